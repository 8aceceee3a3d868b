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

//! Null work assignments for chip bring-up, benchmarking and tests.

use nexminer::work;

/// Version-rolling mask used for benchmark work with four midstates
const BENCHMARK_VERSION_MASK: u32 = 0x1fff_e000;

/// Work with a single midstate derived from `i`, difficulty 1.
pub fn prepare(i: u64) -> work::Assignment {
    prepare_benchmark(i, 1, 1.0)
}

/// Benchmark work: `midstate_count` distinct midstates derived from `i` and
/// a share target for the given difficulty.
pub fn prepare_benchmark(i: u64, midstate_count: usize, sdiff: f64) -> work::Assignment {
    let midstates = (0..midstate_count)
        .map(|idx| {
            let mut state = [0u8; 32];
            state[..8].copy_from_slice(&i.to_le_bytes());
            state[8] = idx as u8;
            work::Midstate {
                version: 0x2000_0000 | ((idx as u32) << 13),
                state,
            }
        })
        .collect();

    let version_mask = if midstate_count > 1 {
        BENCHMARK_VERSION_MASK
    } else {
        0
    };

    let mut assignment = work::Assignment::new(
        midstates,
        i as u32,
        0x5f4d_60a2,
        0x1737_6f56,
        sdiff,
        version_mask,
    );
    assignment.origin_id = Some(format!("null-{}", i));
    assignment
}
