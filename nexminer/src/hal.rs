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

use crate::shutdown;
use crate::stats;
use crate::work;

use futures::lock::Mutex;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Minimal interface for running a compatible hashing backend
pub trait Backend: Send + Sync + 'static {
    /// Number of midstates per assignment the backend expects by default
    const DEFAULT_MIDSTATE_COUNT: usize;
    /// Maximum time it takes to compute one job under normal circumstances
    const JOB_TIMEOUT: Duration;

    /// Detect hardware and spawn all backend tasks. Ownership of the work
    /// generator and the solution path transfers to the backend.
    fn run(
        &self,
        generator: work::Generator,
        solution_sender: work::SolutionSender,
        mining_stats: Arc<Mutex<stats::Mining>>,
        shutdown: shutdown::Sender,
    );
}

/// Solution as reported by the hashing hardware, before it is paired with
/// its originating work.
pub trait BackendSolution: Debug + Send + Sync {
    /// Winning nonce
    fn nonce(&self) -> u32;
    /// Index of the midstate (micro-job) that produced the nonce
    fn midstate_idx(&self) -> usize;
    /// Order of this solution if the hardware found several for one work
    fn solution_idx(&self) -> usize;
}
