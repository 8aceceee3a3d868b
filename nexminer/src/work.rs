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

//! Work assignments flowing from the frontend to hashing backends and
//! solutions flowing back. Midstates are precomputed by the frontend; the
//! backend never touches SHA-256 itself.

use crate::hal;
use crate::target::Target;

use tokio::sync::mpsc;

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time;

/// SHA-256 midstate together with the block version it was computed for.
/// With version rolling (ASIC-boost) enabled an assignment carries four of
/// these, one per rolled version variant.
#[derive(Clone)]
pub struct Midstate {
    /// Version field used for calculating the midstate
    pub version: u32,
    /// Internal state of SHA256 after processing the first chunk
    pub state: [u8; 32],
}

impl Debug for Midstate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Midstate(version {:#010x})", self.version)
    }
}

/// One piece of mining work as handed to a backend. Everything past the
/// first SHA-256 chunk is carried explicitly: the merkle-root tail, ntime
/// and nbits go into the second chunk on the chip.
#[derive(Clone, Debug)]
pub struct Assignment {
    /// Frontend job identifier, kept for log correlation only
    pub origin_id: Option<String>,
    /// One midstate, or four when the pool rolls versions
    pub midstates: Vec<Midstate>,
    /// Last 4 bytes of the merkle root (big-endian on the wire)
    pub merkle_root_tail: u32,
    /// nTime value for this work
    pub ntime: u32,
    /// Network difficulty bits of the block being mined
    pub nbits: u32,
    /// Share target derived from the pool difficulty
    pub share_target: Target,
    /// Pool share difficulty the target was derived from
    pub sdiff: f64,
    /// Version-rolling mask granted by the pool, 0 if none
    pub version_mask: u32,
}

impl Assignment {
    pub fn new(
        midstates: Vec<Midstate>,
        merkle_root_tail: u32,
        ntime: u32,
        nbits: u32,
        sdiff: f64,
        version_mask: u32,
    ) -> Self {
        assert!(!midstates.is_empty(), "assignment without midstates");
        Self {
            origin_id: None,
            midstates,
            merkle_root_tail,
            ntime,
            nbits,
            share_target: Target::from_pool_difficulty(sdiff),
            sdiff,
            version_mask,
        }
    }

    #[inline]
    pub fn midstate_count(&self) -> usize {
        self.midstates.len()
    }

    /// True when the pool allows version rolling and the backend should run
    /// all midstate variants in parallel
    #[inline]
    pub fn uses_version_rolling(&self) -> bool {
        self.version_mask != 0
    }
}

/// Mining work together with its solution as reported by a backend.
#[derive(Clone)]
pub struct Solution {
    /// Time stamp of when the backend pulled the solution out of hardware
    timestamp: time::Instant,
    /// Original mining work associated with this solution
    work: Assignment,
    /// Solution of the PoW puzzle
    solution: Arc<dyn hal::BackendSolution>,
}

impl Solution {
    pub fn new(
        work: Assignment,
        solution: impl hal::BackendSolution + 'static,
        timestamp: Option<time::Instant>,
    ) -> Self {
        Self {
            timestamp: timestamp.unwrap_or_else(time::Instant::now),
            work,
            solution: Arc::new(solution),
        }
    }

    #[inline]
    pub fn timestamp(&self) -> time::Instant {
        self.timestamp
    }

    #[inline]
    pub fn nonce(&self) -> u32 {
        self.solution.nonce()
    }

    #[inline]
    pub fn midstate_idx(&self) -> usize {
        self.solution.midstate_idx()
    }

    /// Block version of the solved micro-job
    #[inline]
    pub fn version(&self) -> u32 {
        self.work.midstates[self.midstate_idx()].version
    }

    #[inline]
    pub fn ntime(&self) -> u32 {
        self.work.ntime
    }

    #[inline]
    pub fn work(&self) -> &Assignment {
        &self.work
    }

    #[inline]
    pub fn share_target(&self) -> &Target {
        &self.work.share_target
    }
}

impl Debug for Solution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Solution(nonce {:#010x}, midstate {})",
            self.nonce(),
            self.midstate_idx()
        )
    }
}

/// Host-side revalidation of solutions before they are accepted upstream.
/// Supplied by the embedding application; a rejected solution is accounted
/// as a hardware error by the backend.
pub trait SolutionVerifier: Send + Sync + 'static {
    fn verify(&self, solution: &Solution) -> bool;
}

/// Verifier that accepts everything. Used by the benchmark feed and tests.
pub struct AcceptAll;

impl SolutionVerifier for AcceptAll {
    fn verify(&self, _solution: &Solution) -> bool {
        true
    }
}

/// Backend side of the work queue: pulls assignments produced by the
/// frontend.
pub struct Generator {
    receiver: mpsc::Receiver<Assignment>,
}

impl Generator {
    /// Next piece of work, `None` once the frontend hung up
    pub async fn generate(&mut self) -> Option<Assignment> {
        self.receiver.recv().await
    }

    /// Non-blocking variant used when the caller only refills opportunistically
    pub fn try_generate(&mut self) -> Option<Assignment> {
        self.receiver.try_recv().ok()
    }
}

/// Frontend side of the work queue.
#[derive(Clone)]
pub struct JobSender {
    sender: mpsc::Sender<Assignment>,
}

impl JobSender {
    pub async fn send(&self, work: Assignment) -> Result<(), Assignment> {
        self.sender.send(work).await.map_err(|e| e.0)
    }
}

/// Backend side of the solution path. `submit` runs the frontend's
/// revalidation synchronously and reports the verdict so the backend can
/// account hardware errors; accepted solutions are forwarded for share
/// submission.
#[derive(Clone)]
pub struct SolutionSender {
    verifier: Arc<dyn SolutionVerifier>,
    sender: mpsc::UnboundedSender<Solution>,
}

impl SolutionSender {
    /// Returns false when the solution failed host-side revalidation
    pub fn submit(&self, solution: Solution) -> bool {
        if !self.verifier.verify(&solution) {
            return false;
        }
        // frontend hanging up is not the backend's problem
        let _ = self.sender.send(solution);
        true
    }
}

/// Frontend side of the solution path.
pub struct SolutionReceiver {
    receiver: mpsc::UnboundedReceiver<Solution>,
}

impl SolutionReceiver {
    pub async fn receive(&mut self) -> Option<Solution> {
        self.receiver.recv().await
    }

    /// Non-blocking receive, `None` when no solution is waiting
    pub fn try_receive(&mut self) -> Option<Solution> {
        self.receiver.try_recv().ok()
    }
}

/// Capacity of the frontend work queue; backends additionally bound their
/// own per-chain queues.
const JOB_CHANNEL_CAPACITY: usize = 128;

/// Build the two channel pairs that connect a frontend with a backend.
pub fn solver_pair(
    verifier: impl SolutionVerifier,
) -> (JobSender, Generator, SolutionSender, SolutionReceiver) {
    let (job_tx, job_rx) = mpsc::channel(JOB_CHANNEL_CAPACITY);
    let (solution_tx, solution_rx) = mpsc::unbounded_channel();
    (
        JobSender { sender: job_tx },
        Generator { receiver: job_rx },
        SolutionSender {
            verifier: Arc::new(verifier),
            sender: solution_tx,
        },
        SolutionReceiver {
            receiver: solution_rx,
        },
    )
}
