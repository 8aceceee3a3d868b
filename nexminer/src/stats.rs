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

//! Mining statistics shared between backends and the embedding application.

/// Per-backend mining counters. Guarded by a mutex at the sharing site.
#[derive(Debug, Default)]
pub struct Mining {
    /// Pieces of work handed to the hardware
    pub work_generated: usize,
    /// Solutions that passed host-side revalidation
    pub unique_solutions: u64,
    /// Solutions rejected by host-side revalidation
    pub hardware_errors: u64,
    /// Solutions that arrived for already flushed work
    pub stale_solutions: u64,
    /// Nonce ranges the hardware has fully swept
    pub nonce_ranges_done: u64,
    /// Total hashes attributed to this backend
    pub hashes_processed: u128,
}

impl Mining {
    /// Account one scan pass: `ranges` nonce ranges of `range_size` hashes,
    /// each evaluated for `midstates` version variants.
    pub fn account_ranges(&mut self, ranges: u64, range_size: u64, midstates: usize) {
        self.nonce_ranges_done += ranges;
        self.hashes_processed += u128::from(ranges) * u128::from(range_size) * midstates as u128;
    }
}
