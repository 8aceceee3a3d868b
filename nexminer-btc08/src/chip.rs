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

//! Per-chip state tracked by the chain controller.

use crate::command::FEATURE_CLASS_FPGA;

use std::time::{Duration, Instant};

/// SHA-256 pipelines per ASIC
pub const MAX_CORES_PER_CHIP: usize = 206;
/// The FPGA emulator instantiates two cores
pub const FPGA_CORES_PER_CHIP: usize = 2;
/// Chips per fully populated chain
pub const MAX_CHIPS_PER_CHAIN: usize = 22;

/// An inaccessible chip rests this long before the recovery path may touch
/// it again
pub const COOLDOWN: Duration = Duration::from_secs(30);
/// Consecutive access failures before a chip is disabled for good
pub const DISABLE_FAIL_THRESHOLD: u32 = 3;

/// Protocol progress of one chip, see the chain initialization sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipState {
    Uninitialized,
    /// Responded to AUTO_ADDRESS and READ_ID
    Detected,
    PllLocked,
    BistPassed,
    /// Nonce range assigned, ready for jobs
    Ready,
    Running,
    /// Terminal for the session
    Disabled,
}

#[derive(Debug, Clone)]
pub struct Chip {
    pub state: ChipState,
    /// Cores that survived the BIST
    pub num_cores: usize,
    /// Current PLL frequency, 0 when the PLL failed
    pub mhz: u32,
    /// Per-core inner loop count from the feature register
    pub hash_depth: u32,
    /// Raw revision/feature dword
    pub rev: u32,
    /// First nonce of the assigned range (inclusive)
    pub start_nonce: u32,
    /// Last nonce of the assigned range (inclusive)
    pub end_nonce: u32,

    // stats
    pub hw_errors: u64,
    pub stales: u64,
    pub nonces_found: u64,
    pub nonce_ranges_done: u64,

    /// When the chip was put aside to cool down, `None` when healthy
    pub cooldown_begin: Option<Instant>,
    /// Consecutive failures to access the chip
    pub fail_count: u32,
    /// Do not try to re-enable a disabled chip
    pub disabled: bool,
}

impl Chip {
    pub fn new() -> Self {
        Self {
            state: ChipState::Uninitialized,
            num_cores: 0,
            mhz: 0,
            hash_depth: 0,
            rev: 0,
            start_nonce: 0,
            end_nonce: 0,
            hw_errors: 0,
            stales: 0,
            nonces_found: 0,
            nonce_ranges_done: 0,
            cooldown_begin: None,
            fail_count: 0,
            disabled: false,
        }
    }

    /// Scheduling weight: a chip sweeps nonces proportionally to how many
    /// cores it has and how fast they are clocked
    #[inline]
    pub fn perf(&self) -> u64 {
        self.num_cores as u64 * u64::from(self.mhz)
    }

    /// Silicon class from the feature dword; 0 identifies the FPGA emulator
    #[inline]
    pub fn feature_class(&self) -> u8 {
        ((self.rev >> 8) & 0xf) as u8
    }

    #[inline]
    pub fn is_fpga(&self) -> bool {
        self.feature_class() == FEATURE_CLASS_FPGA
    }

    /// Still inside the cooldown window after an access failure
    pub fn is_cooling(&self) -> bool {
        self.cooldown_begin
            .map(|begin| begin.elapsed() < COOLDOWN)
            .unwrap_or(false)
    }

    #[inline]
    pub fn is_usable(&self) -> bool {
        !self.disabled && !self.is_cooling()
    }

    /// Take the chip out of service for the rest of the session
    pub fn disable(&mut self) {
        self.disabled = true;
        self.state = ChipState::Disabled;
        self.num_cores = 0;
        self.mhz = 0;
    }
}

impl Default for Chip {
    fn default() -> Self {
        Self::new()
    }
}
