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

//! BTC08 frequency synthesizer settings.
//!
//! The chip PLL is programmed from a fixed table of PMS divider triplets.
//! The configuration word is synthesized by explicit shifts so the layout
//! is independent of host bitfield conventions:
//!
//! ```text
//! word = (p << 26) | (m << 16) | (s << 13) | (bypass << 12) | (div_sel << 11)
//!      | (afc_enb << 10) | (extafc << 5) | (feed_en << 4) | (fsel << 3)
//! ```

use crate::error::{self, ErrorKind};

use nexminer::logging::macros::*;

use std::time::Duration;

/// Requests below this frequency are rejected
pub const MIN_PLL_FREQ_MHZ: u32 = 50;
/// Requests above the table maximum clamp to it
pub const MAX_PLL_FREQ_MHZ: u32 = 1000;
/// Core clock of the FPGA emulator; its PLL is fixed and never programmed
pub const FPGA_CORE_CLK_MHZ: u32 = 50;
/// Demotion step applied to a struggling chip before disabling it
pub const DEMOTE_STEP_MHZ: u32 = 50;

/// READ_PLL lock polling budget
pub const MAX_PLL_WAIT_CYCLES: usize = 25;
/// Delay between lock polls
pub const PLL_CYCLE_WAIT_TIME: Duration = Duration::from_millis(40);
/// Settle time between PLL reset release and FOUT enable
pub const PLL_RESET_SETTLE: Duration = Duration::from_millis(1);

/// SET_PLL_FOUT_EN argument values
pub const FOUT_EN_DISABLE: u8 = 0;
pub const FOUT_EN_ENABLE: u8 = 1;
/// SET_PLL_RESETB argument values
pub const RESETB_RESET: u8 = 0;
pub const RESETB_ON: u8 = 1;

/// One entry of the PMS table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PllEntry {
    pub freq_mhz: u32,
    p: u32,
    m: u32,
    s: u32,
    bypass: bool,
}

impl PllEntry {
    /// Synthesize the SET_PLL_CONFIG word. The divider table drives the
    /// div_sel, AFC, feed and fsel bits to zero on every entry; they stay
    /// in the encoding so the full word layout is explicit.
    pub fn word(&self) -> u32 {
        const DIV_SEL: u32 = 0;
        const AFC_ENB: u32 = 0;
        const EXTAFC: u32 = 0;
        const FEED_EN: u32 = 0;
        const FSEL: u32 = 0;
        (self.p << 26)
            | (self.m << 16)
            | (self.s << 13)
            | ((self.bypass as u32) << 12)
            | (DIV_SEL << 11)
            | (AFC_ENB << 10)
            | (EXTAFC << 5)
            | (FEED_EN << 4)
            | (FSEL << 3)
    }
}

const fn entry(freq_mhz: u32, p: u32, m: u32, s: u32) -> PllEntry {
    PllEntry {
        freq_mhz,
        p,
        m,
        s,
        bypass: false,
    }
}

/// Supported frequencies, ordered. The 24 MHz entry bypasses the PLL and
/// runs straight off the reference clock; it is kept for bring-up but below
/// the minimum mining frequency.
pub const PLL_TABLE: [PllEntry; 21] = [
    PllEntry {
        freq_mhz: 24,
        p: 0,
        m: 0,
        s: 0,
        bypass: true,
    },
    entry(50, 3, 200, 5),
    entry(100, 3, 400, 5),
    entry(150, 2, 200, 4),
    entry(200, 3, 200, 3),
    entry(250, 3, 250, 3),
    entry(300, 2, 200, 3),
    entry(350, 3, 350, 3),
    entry(400, 3, 200, 2),
    entry(450, 2, 150, 2),
    entry(500, 3, 250, 2),
    entry(550, 3, 275, 2),
    entry(600, 2, 200, 2),
    entry(650, 3, 325, 2),
    entry(700, 3, 350, 2),
    entry(750, 3, 375, 2),
    entry(800, 3, 200, 1),
    entry(850, 6, 425, 1),
    entry(900, 2, 150, 1),
    entry(950, 6, 475, 1),
    entry(1000, 6, 1000, 2),
];

/// Pick the table entry for a requested frequency: the first entry at or
/// above the request, clamped to the table maximum.
pub fn lookup(freq_mhz: u32) -> error::Result<&'static PllEntry> {
    if freq_mhz < MIN_PLL_FREQ_MHZ {
        Err(ErrorKind::Pll(format!(
            "too low frequency ({} MHz), it must be at least {} MHz",
            freq_mhz, MIN_PLL_FREQ_MHZ
        )))?
    }
    let last = &PLL_TABLE[PLL_TABLE.len() - 1];
    if freq_mhz > last.freq_mhz {
        warn!(
            "clamping requested {} MHz to table maximum {} MHz",
            freq_mhz, last.freq_mhz
        );
        return Ok(last);
    }
    Ok(PLL_TABLE
        .iter()
        .find(|entry| freq_mhz <= entry.freq_mhz)
        .expect("BUG: clamped frequency misses the PLL table"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_word_synthesis() {
        // 550 MHz: p=3, m=275, s=2
        assert_eq!(lookup(550).unwrap().word(), 0x0d13_4000);
        // 50 MHz: p=3, m=200, s=5
        assert_eq!(lookup(50).unwrap().word(), 0x0cc8_a000);
        // 1000 MHz: p=6, m=1000, s=2
        assert_eq!(lookup(1000).unwrap().word(), 0x1be8_4000);
        // 24 MHz bypass entry
        assert_eq!(PLL_TABLE[0].word(), 0x0000_1000);
    }

    #[test]
    fn test_lookup_rounds_up() {
        assert_eq!(lookup(50).unwrap().freq_mhz, 50);
        assert_eq!(lookup(555).unwrap().freq_mhz, 600);
        assert_eq!(lookup(999).unwrap().freq_mhz, 1000);
    }

    #[test]
    fn test_lookup_clamps_above_table() {
        assert_eq!(lookup(1200).unwrap().freq_mhz, MAX_PLL_FREQ_MHZ);
    }

    #[test]
    fn test_lookup_rejects_below_minimum() {
        assert!(lookup(49).is_err());
        assert!(lookup(24).is_err());
        assert!(lookup(0).is_err());
    }

    #[test]
    fn test_table_is_ordered() {
        for pair in PLL_TABLE.windows(2) {
            assert!(pair[0].freq_mhz < pair[1].freq_mhz);
        }
    }

    #[test]
    fn test_divider_ranges() {
        for entry in PLL_TABLE.iter() {
            assert!(entry.p < (1 << 6));
            assert!(entry.m < (1 << 10));
            assert!(entry.s < (1 << 3));
        }
    }
}
