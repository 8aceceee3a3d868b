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

//! Share target representation and its compact (nBits) encoding.

use std::fmt;

/// Difficulty 1 in compact form
pub const DIFF1_NBITS: u32 = 0x1d00ffff;

/// 256-bit share target stored in little-endian byte order: byte 0 is the
/// least significant, byte 31 the most significant.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Target([u8; 32]);

impl Target {
    /// Expand a compact target. The compact form is a size byte followed by
    /// a 3-byte mantissa placed at the top of the expanded value.
    pub fn from_compact(nbits: u32) -> Self {
        let mut target = [0u8; 32];
        let size = (nbits >> 24) as usize;

        let mantissa = [
            ((nbits >> 16) & 0xff) as u8,
            ((nbits >> 8) & 0xff) as u8,
            (nbits & 0xff) as u8,
        ];
        for (i, byte) in mantissa.iter().enumerate() {
            if size >= i + 1 && size - i - 1 < 32 {
                target[size - i - 1] = *byte;
            }
        }
        Self(target)
    }

    /// Compress back to compact form by scanning for the leading nonzero
    /// byte. When the third mantissa byte is zero the size is bumped by one,
    /// so mantissas stored with a leading zero byte (top-bit avoidance)
    /// round-trip exactly.
    pub fn to_compact(&self) -> u32 {
        let t = &self.0;
        let mut i = 31usize;
        while t[i] == 0 {
            if i == 0 {
                return 0;
            }
            i -= 1;
        }
        if i >= 2 && i < 31 && t[i - 2] == 0 {
            i += 1;
        }

        let byte = |n: isize| {
            if (0..32).contains(&n) {
                t[n as usize] as u32
            } else {
                0
            }
        };
        ((i as u32 + 1) << 24)
            | (byte(i as isize) << 16)
            | (byte(i as isize - 1) << 8)
            | byte(i as isize - 2)
    }

    /// Derive a compact target from a pool share difficulty.
    pub fn from_pool_difficulty(difficulty: f64) -> Self {
        Self::from_compact(compact_from_difficulty(difficulty))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn into_inner(self) -> [u8; 32] {
        self.0
    }
}

impl From<[u8; 32]> for Target {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Default for Target {
    /// Difficulty 1 target
    fn default() -> Self {
        Self::from_compact(DIFF1_NBITS)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // print big-endian so the leading zeros come first
        for byte in self.0.iter().rev() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Compute the compact target corresponding to a share difficulty by scaling
/// the difficulty-1 mantissa. Floating point is sufficient here: the result
/// only has 24 bits of mantissa.
pub fn compact_from_difficulty(difficulty: f64) -> u32 {
    assert!(difficulty > 0.0, "difficulty must be positive");
    let mut shift = 29i32;
    let mut f = f64::from(0x0000ffff) / difficulty;
    while f < f64::from(0x00008000) {
        shift -= 1;
        f *= 256.0;
    }
    while f >= f64::from(0x00800000) {
        shift += 1;
        f /= 256.0;
    }
    (f as u32).wrapping_add((shift as u32) << 24)
}
