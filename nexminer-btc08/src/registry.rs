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

//! Job slot ring mirroring the chip-side job FIFO.
//!
//! The chips address jobs with ids 1..=8; the host mirror is a ring of 8
//! slots where slot `i` corresponds to job id `i + 1`. A slot owns its work
//! item until the slot is overwritten (the chips have long finished that job
//! by then, which counts as one completed nonce range) or the ring is
//! flushed on a block change.

use nexminer::work;

/// Host-side job slots; on-chip job ids run 1..=JOB_SLOT_COUNT
pub const JOB_SLOT_COUNT: usize = 8;

pub struct JobRegistry {
    slots: Vec<Option<work::Assignment>>,
    /// Slot that the next stored work goes into
    last_queued_id: usize,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            slots: vec![None; JOB_SLOT_COUNT],
            last_queued_id: 0,
        }
    }

    /// Job id the next stored work will run under
    #[inline]
    pub fn next_job_id(&self) -> u8 {
        (self.last_queued_id + 1) as u8
    }

    /// Store work into the current slot and advance the ring. Returns the
    /// assigned job id and the previous occupant of the slot, whose nonce
    /// range is complete.
    pub fn store(&mut self, work: work::Assignment) -> (u8, Option<work::Assignment>) {
        let job_id = self.next_job_id();
        let evicted = self.slots[self.last_queued_id].replace(work);
        self.last_queued_id = (self.last_queued_id + 1) % JOB_SLOT_COUNT;
        (job_id, evicted)
    }

    /// Work running under the given on-chip job id, if any
    pub fn get(&self, job_id: u8) -> Option<&work::Assignment> {
        if job_id == 0 || job_id as usize > JOB_SLOT_COUNT {
            return None;
        }
        self.slots[job_id as usize - 1].as_ref()
    }

    /// Drop all slots and rewind the ring; returns how many were occupied
    pub fn flush(&mut self) -> usize {
        let occupied = self.occupied();
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.last_queued_id = 0;
        occupied
    }

    #[inline]
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::null_work;

    /// Job ids are handed out as 1, 2, .., 8, 1, 2, ..
    #[test]
    fn test_job_id_sequence() {
        let mut registry = JobRegistry::new();
        for round in 0..2 {
            for expect in 1..=JOB_SLOT_COUNT as u8 {
                let (job_id, _) = registry.store(null_work::prepare(round));
                assert_eq!(job_id, expect);
            }
        }
    }

    /// A slot stays occupied until the ring wraps over it
    #[test]
    fn test_eviction_after_wrap() {
        let mut registry = JobRegistry::new();
        for i in 0..JOB_SLOT_COUNT as u64 {
            let (_, evicted) = registry.store(null_work::prepare(i));
            assert!(evicted.is_none());
        }
        assert_eq!(registry.occupied(), JOB_SLOT_COUNT);
        let (job_id, evicted) = registry.store(null_work::prepare(99));
        assert_eq!(job_id, 1);
        assert!(evicted.is_some());
        assert_eq!(registry.occupied(), JOB_SLOT_COUNT);
    }

    #[test]
    fn test_get_by_job_id() {
        let mut registry = JobRegistry::new();
        let (job_id, _) = registry.store(null_work::prepare(7));
        assert_eq!(job_id, 1);
        assert!(registry.get(1).is_some());
        assert!(registry.get(2).is_none());
        // out of range ids never resolve
        assert!(registry.get(0).is_none());
        assert!(registry.get(9).is_none());
    }

    #[test]
    fn test_flush_rewinds_ring() {
        let mut registry = JobRegistry::new();
        for i in 0..3 {
            registry.store(null_work::prepare(i));
        }
        assert_eq!(registry.flush(), 3);
        assert_eq!(registry.occupied(), 0);
        let (job_id, _) = registry.store(null_work::prepare(0));
        assert_eq!(job_id, 1);
    }
}
