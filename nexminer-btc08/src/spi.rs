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

//! SPI transport against the Linux spidev interface.
//!
//! All chain traffic goes through three primitives: a plain full-duplex
//! transfer at the configured bus speed, a fast-path transfer at 20x the
//! configured speed (used for commands the chips latch without a readback),
//! and a batched burst that submits several frames back-to-back in a single
//! ioctl so the chips see no host-side gap between them.

use crate::error::{self, ErrorKind};

use nexminer::logging::macros::*;

use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};

/// Default SPI clock in kHz; the chips are specified down to 1.2 MHz
pub const DEFAULT_SPI_CLK_KHZ: u32 = 2000;
/// Minimum SPI clock the chips stay coherent at
pub const MIN_SPI_CLK_KHZ: u32 = 1200;
/// Fast-path multiplier over the configured clock
pub const FAST_SPEED_MULTIPLIER: u32 = 20;
/// Fast-path ceiling for ASIC silicon
pub const MAX_FAST_SPEED_HZ_ASIC: u32 = 10_000_000;
/// Fast-path ceiling for the FPGA emulator
pub const MAX_FAST_SPEED_HZ_FPGA: u32 = 4_000_000;

/// One frame of a batched burst
pub struct Frame {
    pub tx: Vec<u8>,
    /// Submit at the fast-path speed
    pub fast: bool,
    /// Toggle chip select after this frame
    pub cs_change: bool,
}

impl Frame {
    pub fn new(tx: Vec<u8>) -> Self {
        Self {
            tx,
            fast: true,
            cs_change: true,
        }
    }
}

/// Chain-facing transport interface. Production code uses [`Bus`]; tests
/// substitute a scripted fake.
pub trait Transport: Send + 'static {
    /// Exchange `tx.len()` bytes at the configured speed. The receive buffer
    /// is prefilled with 0xFF before the transfer.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> error::Result<()>;

    /// Same contract at the fast-path speed. The length must be a multiple
    /// of 4.
    fn transfer_fast(&mut self, tx: &[u8], rx: &mut [u8]) -> error::Result<()>;

    /// Submit frames as one atomic burst with no host-side gaps.
    fn transfer_batch(&mut self, frames: &[Frame]) -> error::Result<()>;

    /// Cap the fast-path clock. Called once the chain knows what silicon it
    /// is talking to; the FPGA emulator only samples reliably up to 4 MHz.
    fn limit_fast_speed(&mut self, _ceiling_hz: u32) {}
}

/// Transport over one `/dev/spidevB.C` endpoint. The endpoint is exclusively
/// owned by a single chain for the process lifetime.
pub struct Bus {
    device: Spidev,
    bus: u32,
    speed_hz: u32,
    fast_speed_hz: u32,
}

impl Bus {
    /// Open and configure a spidev endpoint: mode 0, 8 bits per word, no
    /// inter-word delay.
    pub fn open(bus: u32, cs_line: u32, spi_clk_khz: u32) -> error::Result<Self> {
        let path = format!("/dev/spidev{}.{}", bus, cs_line);
        let mut device = Spidev::open(&path)
            .map_err(|e| ErrorKind::Spi(format!("cannot open {}: {}", path, e)))?;

        let spi_clk_khz = spi_clk_khz.max(MIN_SPI_CLK_KHZ);
        let speed_hz = spi_clk_khz * 1000;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(speed_hz)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        device
            .configure(&options)
            .map_err(|e| ErrorKind::Spi(format!("cannot configure {}: {}", path, e)))?;

        info!(
            "SPI '{}': mode=0, bits=8, speed={} Hz",
            path, speed_hz
        );

        Ok(Self {
            device,
            bus,
            speed_hz,
            fast_speed_hz: (speed_hz * FAST_SPEED_MULTIPLIER).min(MAX_FAST_SPEED_HZ_ASIC),
        })
    }

    #[inline]
    pub fn bus(&self) -> u32 {
        self.bus
    }

    #[inline]
    pub fn fast_speed_hz(&self) -> u32 {
        self.fast_speed_hz
    }

    fn transfer_at(&mut self, tx: &[u8], rx: &mut [u8], speed_hz: u32) -> error::Result<()> {
        assert_eq!(tx.len(), rx.len(), "tx/rx length mismatch");
        for byte in rx.iter_mut() {
            *byte = 0xff;
        }
        let mut xfer = SpidevTransfer::read_write(tx, rx);
        xfer.speed_hz = speed_hz;
        xfer.cs_change = 1;
        self.device
            .transfer(&mut xfer)
            .map_err(|e| ErrorKind::Spi(format!("transfer of {} bytes failed: {}", tx.len(), e)))?;
        Ok(())
    }
}

impl Transport for Bus {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> error::Result<()> {
        self.transfer_at(tx, rx, self.speed_hz)
    }

    fn transfer_fast(&mut self, tx: &[u8], rx: &mut [u8]) -> error::Result<()> {
        if tx.len() % 4 != 0 {
            Err(ErrorKind::Spi(format!(
                "fast transfer length must be 4-byte aligned, {} is not allowed",
                tx.len()
            )))?
        }
        let speed = self.fast_speed_hz;
        self.transfer_at(tx, rx, speed)
    }

    fn transfer_batch(&mut self, frames: &[Frame]) -> error::Result<()> {
        let mut transfers = Vec::with_capacity(frames.len());
        for frame in frames {
            let mut xfer = SpidevTransfer::write(&frame.tx);
            xfer.speed_hz = if frame.fast {
                self.fast_speed_hz
            } else {
                self.speed_hz
            };
            xfer.cs_change = frame.cs_change as u8;
            transfers.push(xfer);
        }
        self.device.transfer_multiple(&mut transfers).map_err(|e| {
            ErrorKind::Spi(format!("batch of {} frames failed: {}", frames.len(), e))
        })?;
        Ok(())
    }

    fn limit_fast_speed(&mut self, ceiling_hz: u32) {
        self.fast_speed_hz = (self.speed_hz * FAST_SPEED_MULTIPLIER).min(ceiling_hz);
    }
}
