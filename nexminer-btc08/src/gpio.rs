// Copyright (C) 2020  Nexminer contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Control pins of the BTC08 hash boards. Four inputs per port (board plug,
//! body detect, out-of-nonce, golden nonce) and two outputs (chain reset,
//! power enable). GN and OON are active low and level polled from the scan
//! loop; there are no kernel interrupts involved.

use embedded_hal;
use sysfs_gpio;

/// Helper struct for altering output pins which implements OutputPin trait
#[derive(Clone)]
pub struct PinOut(sysfs_gpio::Pin);

impl embedded_hal::digital::v2::OutputPin for PinOut {
    type Error = sysfs_gpio::Error;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.set_value(0)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.set_value(1)
    }
}

/// Helper struct for reading input pins which implements InputPin trait
#[derive(Clone)]
pub struct PinIn(sysfs_gpio::Pin);

impl embedded_hal::digital::v2::InputPin for PinIn {
    type Error = sysfs_gpio::Error;

    fn is_high(&self) -> Result<bool, Self::Error> {
        self.0.get_value().map(|value| value > 0)
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        self.0.get_value().map(|value| value == 0)
    }
}

/// All known output pin types on a BTC08 board
#[derive(Debug, Copy, Clone)]
pub enum PinOutName {
    /// Chain reset, active low
    Rst(usize),
    /// Board power/fan enable
    PowerEn(usize),
}

/// All known input pin types on a BTC08 board
#[derive(Debug, Copy, Clone)]
pub enum PinInName {
    /// High: board connected, low: board removed
    Plug(usize),
    /// High: hash board, low: VTK board
    BodyDetect(usize),
    /// Golden nonce interrupt line, active low
    Gn(usize),
    /// Out-of-nonce interrupt line, active low
    Oon(usize),
}

// SoC GPIO bank bases
const GPIOA: u64 = 0;
const GPIOD: u64 = 96;
const GPIOE: u64 = 128;

/// Number of SPI ports and therefore hash board slots
pub const MAX_SPI_PORT: usize = 2;

/// Provides functionality for configuring BTC08 control pins.
/// The pins can be accessed by name (see PinOutName and PinInName)
pub struct ControlPinManager;

impl ControlPinManager {
    pub fn new() -> Self {
        ControlPinManager {}
    }

    /// Returns a specified output pin and initializes it (export in sysfs)
    pub fn get_pin_out(&self, pin_name: PinOutName) -> Result<PinOut, sysfs_gpio::Error> {
        let pin_num = match pin_name {
            PinOutName::Rst(i) => {
                assert!(i < MAX_SPI_PORT, "Rst pin {} is out of range", i);
                [GPIOD + 31, GPIOE + 4][i]
            }
            PinOutName::PowerEn(i) => {
                assert!(i < MAX_SPI_PORT, "PowerEn pin {} is out of range", i);
                [GPIOA + 0, GPIOA + 16][i]
            }
        };

        let pin = sysfs_gpio::Pin::new(pin_num);
        pin.export()?;
        pin.set_direction(sysfs_gpio::Direction::Out)?;
        Ok(PinOut(pin))
    }

    /// Returns a specified input pin and initializes it (export in sysfs)
    pub fn get_pin_in(&self, pin_name: PinInName) -> Result<PinIn, sysfs_gpio::Error> {
        let pin_num = match pin_name {
            PinInName::Plug(i) => {
                assert!(i < MAX_SPI_PORT, "Plug pin {} is out of range", i);
                [GPIOA + 24, GPIOA + 11][i]
            }
            PinInName::BodyDetect(i) => {
                assert!(i < MAX_SPI_PORT, "BodyDetect pin {} is out of range", i);
                [GPIOA + 20, GPIOA + 9][i]
            }
            PinInName::Gn(i) => {
                assert!(i < MAX_SPI_PORT, "Gn pin {} is out of range", i);
                [GPIOD + 30, GPIOE + 3][i]
            }
            PinInName::Oon(i) => {
                assert!(i < MAX_SPI_PORT, "Oon pin {} is out of range", i);
                [GPIOD + 29, GPIOE + 2][i]
            }
        };

        let pin = sysfs_gpio::Pin::new(pin_num);
        pin.export()?;
        pin.set_direction(sysfs_gpio::Direction::In)?;
        Ok(PinIn(pin))
    }
}

// NOTE: these tests touch real sysfs GPIO state and only pass on the target
// hardware, hence the ignore markers.
#[cfg(test)]
mod test {
    use super::*;
    use embedded_hal::digital::v2::InputPin;

    #[test]
    #[ignore]
    fn test_get_pin_in_check_plug_pins() {
        let ctrl_pin_manager = ControlPinManager::new();
        for i in 0..MAX_SPI_PORT {
            let pin_in = ctrl_pin_manager.get_pin_in(PinInName::Plug(i));
            match pin_in {
                Ok(_) => (),
                Err(err) => assert!(false, "Failed to detect plug pin {} {}", i, err),
            }
        }
    }

    #[test]
    #[should_panic]
    fn test_get_pin_in_out_of_range() {
        let ctrl_pin_manager = ControlPinManager::new();
        let _ = ctrl_pin_manager.get_pin_in(PinInName::Plug(MAX_SPI_PORT));
    }

    #[test]
    #[ignore]
    fn test_interrupt_lines_idle_high() {
        let ctrl_pin_manager = ControlPinManager::new();
        for i in 0..MAX_SPI_PORT {
            for pin_name in [PinInName::Gn(i), PinInName::Oon(i)].iter() {
                if let Ok(pin) = ctrl_pin_manager.get_pin_in(*pin_name) {
                    assert!(
                        pin.is_high().unwrap(),
                        "Interrupt line {:?} asserted at rest",
                        pin_name
                    );
                }
            }
        }
    }
}
