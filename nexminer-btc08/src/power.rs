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

//! Core voltage sensing for the hash boards. Each board has one analog
//! sense line on the SoC ADC, exposed through the Linux IIO sysfs
//! interface. The file is opened per read so no descriptor is held across
//! the mining session.

use crate::error::{self, ErrorKind};

use std::fs;

/// ADC reference voltage in millivolts
const ADC_REF_MV: u32 = 1800;
/// 12-bit converter
const ADC_FULL_SCALE: u32 = 4096;

/// Voltage test points the self-test sweeps through, in millivolts
pub const TEST_POINTS_MV: [u32; 2] = [400, 420];

/// Convert a raw ADC sample to millivolts
#[inline]
pub fn adc_to_mv(raw: u32) -> u32 {
    raw * ADC_REF_MV / ADC_FULL_SCALE
}

/// Acceptance band around one voltage test point
#[derive(Debug, Clone, Copy)]
pub struct VoltageBand {
    pub nominal_mv: u32,
    pub min_mv: u32,
    pub max_mv: u32,
}

impl VoltageBand {
    /// Band of +-10% around the nominal point
    pub fn with_default_margin(nominal_mv: u32) -> Self {
        Self {
            nominal_mv,
            min_mv: nominal_mv - nominal_mv / 10,
            max_mv: nominal_mv + nominal_mv / 10,
        }
    }

    #[inline]
    pub fn contains(&self, mv: u32) -> bool {
        (self.min_mv..=self.max_mv).contains(&mv)
    }
}

/// One ADC sense channel
#[derive(Debug, Clone)]
pub struct VoltageSense {
    channel: usize,
}

impl VoltageSense {
    pub fn new(channel: usize) -> Self {
        Self { channel }
    }

    fn sysfs_path(&self) -> String {
        format!(
            "/sys/bus/iio/devices/iio:device0/in_voltage{}_raw",
            self.channel
        )
    }

    /// Read the current board core voltage in millivolts
    pub fn read_mv(&self) -> error::Result<u32> {
        let path = self.sysfs_path();
        let raw = fs::read_to_string(&path)
            .map_err(|e| ErrorKind::Adc(format!("cannot read {}: {}", path, e)))?;
        let raw: u32 = raw
            .trim()
            .parse()
            .map_err(|e| ErrorKind::Adc(format!("bad sample in {}: {}", path, e)))?;
        Ok(adc_to_mv(raw))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_adc_conversion() {
        // 0.5 V point: 0.5 * 4096 / 1.8 ~= 1138
        assert_eq!(adc_to_mv(1138), 500);
        assert_eq!(adc_to_mv(0), 0);
        assert_eq!(adc_to_mv(4095), 1799);
    }

    #[test]
    fn test_default_band() {
        let band = VoltageBand::with_default_margin(400);
        assert_eq!(band.min_mv, 360);
        assert_eq!(band.max_mv, 440);
        assert!(band.contains(400));
        assert!(band.contains(360));
        assert!(!band.contains(359));
        assert!(!band.contains(441));
    }
}
