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

//! End-to-end scenarios against the fake chain: bring-up, the steady-state
//! scan pass, flush/stale handling and recovery.

use super::*;
use crate::command::Opcode;
use crate::null_work;
use crate::{MAX_NONCE_SIZE_ASIC, MAX_NONCE_SIZE_FPGA};

use nexminer::work::{Solution, SolutionVerifier};

use std::time::Duration;

struct RejectAll;

impl SolutionVerifier for RejectAll {
    fn verify(&self, _solution: &Solution) -> bool {
        false
    }
}

fn queue_works(rig: &mut TestRig, count: u64) {
    for i in 0..count {
        rig.chain
            .enqueue_work(null_work::prepare_benchmark(i, 4, 1.0))
            .expect("queue full");
    }
}

/// Boot on a chain of 3 FPGA chips: PLL skipped, the long OON deadline, and
/// the reduced nonce space split three ways.
#[tokio::test]
async fn test_boot_fpga_chain_of_three() {
    let mut rig = test_rig(vec![FakeChip::fpga(); 3]);
    rig.chain.init().await.expect("init failed");

    assert_eq!(rig.chain.timeout_oon(), Duration::from_millis(120_000));
    assert_eq!(rig.chain.max_nonce(), MAX_NONCE_SIZE_FPGA);
    assert_eq!(rig.chain.transport.count_op(Opcode::SetPllConfig), 0);
    assert_eq!(rig.chain.transport.count_op(Opcode::ReadPll), 0);

    let chips = rig.chain.chips();
    assert_eq!(chips[0].mhz, 50);
    assert_eq!(
        (chips[0].start_nonce, chips[0].end_nonce),
        (0x0000_0000, 0x02aa_aaaa)
    );
    assert_eq!(
        (chips[1].start_nonce, chips[1].end_nonce),
        (0x02aa_aaab, 0x0555_5555)
    );
    assert_eq!(
        (chips[2].start_nonce, chips[2].end_nonce),
        (0x0555_5556, 0x07ff_ffff)
    );

    // each chip got its range over the wire (plus the golden BIST range)
    let writes = rig.chain.transport.commands(Opcode::WriteNonce);
    let per_chip: Vec<_> = writes.iter().filter(|cmd| cmd.chip_id != 0).collect();
    assert_eq!(per_chip.len(), 3);
    assert_eq!(per_chip[2].params, 0x0555_5556u32.to_be_bytes().iter().chain(
        0x07ff_ffffu32.to_be_bytes().iter()).cloned().collect::<Vec<u8>>());
}

/// The nonce ranges of the chips partition the whole space with no gaps,
/// proportionally to core count
#[tokio::test]
async fn test_nonce_range_partition() {
    let mut chips = vec![FakeChip::asic(), FakeChip::asic(), FakeChip::asic()];
    chips[1].cores = 180;
    chips[2].cores = 120;
    let mut settings = test_settings();
    settings.min_cores = 100;
    let mut rig = test_rig_with(chips, settings, nexminer::work::AcceptAll);
    rig.chain.init().await.expect("init failed");

    let chips = rig.chain.chips();
    assert_eq!(chips[0].start_nonce, 0);
    for pair in chips.windows(2) {
        assert_eq!(pair[0].end_nonce.wrapping_add(1), pair[1].start_nonce);
    }
    assert_eq!(chips.last().unwrap().end_nonce, MAX_NONCE_SIZE_ASIC);
    // bigger chips sweep bigger ranges
    assert!(
        chips[0].end_nonce - chips[0].start_nonce > chips[2].end_nonce - chips[2].start_nonce
    );
}

/// Golden nonce path: a latched GN is read out, decoded big-endian and
/// submitted upstream
#[tokio::test]
async fn test_golden_nonce_submission() {
    let mut rig = test_rig(vec![FakeChip::asic()]);
    rig.chain.init().await.expect("init failed");
    queue_works(&mut rig, 6);

    rig.chain.transport.chips[0].gn = Some(GnEvent {
        job_id: 1,
        nonces: [0x0d47_3a59, 0, 0, 0],
        micro_job_mask: 0x01,
    });
    rig.gn.set_low(true);
    rig.oon.set_low(true); // terminate the pass after the harvest

    let ranges = rig.chain.scan_pass().await.expect("scan failed");
    assert_eq!(ranges, 2);

    let solution = rig.solutions.try_receive().expect("no solution");
    assert_eq!(solution.nonce(), 0x0d47_3a59);
    assert_eq!(solution.midstate_idx(), 0);
    assert_eq!(rig.chain.chips()[0].nonces_found, 1);
    assert_eq!(rig.chain.chips()[0].hw_errors, 0);
}

/// All four ASIC-boost micro-jobs of one result are submitted with their
/// own midstate index
#[tokio::test]
async fn test_all_micro_jobs_submitted() {
    let mut rig = test_rig(vec![FakeChip::asic()]);
    rig.chain.init().await.expect("init failed");
    queue_works(&mut rig, 6);

    rig.chain.transport.chips[0].gn = Some(GnEvent {
        job_id: 2,
        nonces: [0x1000_0000, 0x2000_0000, 0x3000_0000, 0x4000_0000],
        micro_job_mask: 0x0f,
    });
    rig.gn.set_low(true);
    rig.oon.set_low(true);

    rig.chain.scan_pass().await.expect("scan failed");

    let mut seen = Vec::new();
    while let Some(solution) = rig.solutions.try_receive() {
        seen.push((solution.midstate_idx(), solution.nonce()));
    }
    assert_eq!(
        seen,
        vec![
            (0, 0x1000_0000),
            (1, 0x2000_0000),
            (2, 0x3000_0000),
            (3, 0x4000_0000),
        ]
    );
    assert_eq!(rig.chain.chips()[0].nonces_found, 4);
}

/// OON refill: one CLEAR_OON broadcast, two refill jobs, two nonce ranges
/// accounted
#[tokio::test]
async fn test_oon_refill() {
    let mut rig = test_rig(vec![FakeChip::asic()]);
    rig.chain.init().await.expect("init failed");
    queue_works(&mut rig, 8);

    rig.oon.set_low(true);
    let ranges = rig.chain.scan_pass().await.expect("scan failed");
    assert_eq!(ranges, 2);

    assert_eq!(rig.chain.transport.count_op(Opcode::ClearOon), 1);
    // 4 primed + 2 refilled, plus the golden job of the BIST
    let parm_writes = rig.chain.transport.count_op(Opcode::WriteParm);
    assert_eq!(parm_writes, 4 + 2 + 1);
    // 4 + 2 jobs were started
    assert_eq!(rig.chain.transport.count_op(Opcode::RunJob), 6);
}

/// Work underflow on the priming path aborts the pass with zero progress
#[tokio::test]
async fn test_prime_underflow() {
    let mut rig = test_rig(vec![FakeChip::asic()]);
    rig.chain.init().await.expect("init failed");
    queue_works(&mut rig, 2); // fewer than the FIFO depth

    let ranges = rig.chain.scan_pass().await.expect("scan failed");
    assert_eq!(ranges, 0);
}

/// A nonce arriving for a flushed job slot is stale: counted on the chip,
/// never submitted
#[tokio::test]
async fn test_stale_nonce_after_flush() {
    let mut rig = test_rig(vec![FakeChip::asic()]);
    rig.chain.init().await.expect("init failed");
    queue_works(&mut rig, 4);

    // prime the FIFO so slots 1..=4 hold work, then flush everything
    rig.oon.set_low(true);
    rig.chain.scan_pass().await.expect("scan failed");
    rig.chain.flush_work().await.expect("flush failed");

    // a late golden nonce for job 3 arrives
    rig.chain.transport.chips[0].gn = Some(GnEvent {
        job_id: 3,
        nonces: [0xdead_beef, 0, 0, 0],
        micro_job_mask: 0x01,
    });
    let penalty = rig.chain.harvest_golden_nonces().expect("harvest failed");
    assert_eq!(penalty, 0);
    assert_eq!(rig.chain.chips()[0].stales, 1);
    assert!(rig.solutions.try_receive().is_none());
}

/// WRITE_TARGET is only re-sent when the share difficulty changes
#[tokio::test]
async fn test_write_target_on_difficulty_change() {
    let mut rig = test_rig(vec![FakeChip::asic()]);
    rig.chain.init().await.expect("init failed");

    // reach steady state at sdiff 1.0
    rig.chain
        .set_work(null_work::prepare_benchmark(0, 4, 1.0))
        .expect("set_work failed");
    rig.chain.transport.log.clear();

    // consecutive works at 1.0 then 2.0: exactly one WRITE_TARGET, on the
    // second one
    rig.chain
        .set_work(null_work::prepare_benchmark(1, 4, 1.0))
        .expect("set_work failed");
    assert_eq!(rig.chain.transport.count_op(Opcode::WriteTarget), 0);

    rig.chain
        .set_work(null_work::prepare_benchmark(2, 4, 2.0))
        .expect("set_work failed");
    assert_eq!(rig.chain.transport.count_op(Opcode::WriteTarget), 1);
}

/// A flush forgets the share difficulty so the next work re-sends the target
#[tokio::test]
async fn test_flush_resets_difficulty() {
    let mut rig = test_rig(vec![FakeChip::asic()]);
    rig.chain.init().await.expect("init failed");
    rig.chain
        .set_work(null_work::prepare_benchmark(0, 4, 2.0))
        .expect("set_work failed");

    rig.chain.flush_work().await.expect("flush failed");
    rig.chain.transport.log.clear();

    rig.chain
        .set_work(null_work::prepare_benchmark(1, 4, 2.0))
        .expect("set_work failed");
    assert_eq!(rig.chain.transport.count_op(Opcode::WriteTarget), 1);
}

/// Upstream rejection of a nonce counts as a hardware error and one range
/// of penalty
#[tokio::test]
async fn test_rejected_nonce_is_hardware_error() {
    let mut rig = test_rig_with(vec![FakeChip::asic()], test_settings(), RejectAll);
    rig.chain.init().await.expect("init failed");
    queue_works(&mut rig, 6);

    rig.chain.transport.chips[0].gn = Some(GnEvent {
        job_id: 1,
        nonces: [0x1234_5678, 0, 0, 0],
        micro_job_mask: 0x01,
    });
    rig.gn.set_low(true);
    rig.oon.set_low(true);

    // 2 ranges from OON minus 1 of penalty
    let ranges = rig.chain.scan_pass().await.expect("scan failed");
    assert_eq!(ranges, 1);
    assert_eq!(rig.chain.chips()[0].hw_errors, 1);
    assert!(rig.solutions.try_receive().is_none());
}

/// PLL never locking fails chain init and zeroes the chip frequency
#[tokio::test]
async fn test_pll_lock_failure() {
    let mut chip = FakeChip::asic();
    chip.pll_locks = false;
    let mut rig = test_rig(vec![chip]);

    assert!(rig.chain.init().await.is_err());
    assert_eq!(rig.chain.chips()[0].mhz, 0);
}

/// A mismatch between AUTO_ADDRESS and READ_ID refuses to mine
#[tokio::test]
async fn test_auto_address_mismatch_refuses_to_mine() {
    let mut rig = test_rig(vec![FakeChip::asic()]);
    rig.chain.transport.break_auto_address = true;
    assert!(rig.chain.init().await.is_err());
}

/// Job ids of consecutive set_work calls cycle 1..=8
#[tokio::test]
async fn test_job_id_cycle_on_wire() {
    let mut rig = test_rig(vec![FakeChip::asic()]);
    rig.chain.init().await.expect("init failed");
    rig.chain.transport.log.clear();

    for i in 0..10u64 {
        rig.chain
            .set_work(null_work::prepare_benchmark(i, 4, 1.0))
            .expect("set_work failed");
    }
    let job_ids: Vec<u8> = rig
        .chain
        .transport
        .commands(Opcode::RunJob)
        .iter()
        .map(|cmd| cmd.params[1])
        .collect();
    assert_eq!(job_ids, vec![1, 2, 3, 4, 5, 6, 7, 8, 1, 2]);
    // the 9th and 10th stores overwrote occupied slots, retiring their work
    assert_eq!(rig.chain.chips()[0].nonce_ranges_done, 2);
}

/// Slot eviction books a completed nonce range on every chip that mined it
#[tokio::test]
async fn test_eviction_books_per_chip_ranges() {
    let mut chips = vec![FakeChip::asic(), FakeChip::asic()];
    chips[1].cores = 190;
    let mut settings = test_settings();
    settings.min_cores = 100;
    let mut rig = test_rig_with(chips, settings, nexminer::work::AcceptAll);
    rig.chain.init().await.expect("init failed");

    for i in 0..crate::registry::JOB_SLOT_COUNT as u64 {
        rig.chain
            .set_work(null_work::prepare_benchmark(i, 4, 1.0))
            .expect("set_work failed");
    }
    assert_eq!(rig.chain.chips()[0].nonce_ranges_done, 0);
    assert_eq!(rig.chain.chips()[1].nonce_ranges_done, 0);

    rig.chain
        .set_work(null_work::prepare_benchmark(99, 4, 1.0))
        .expect("set_work failed");
    assert_eq!(rig.chain.chips()[0].nonce_ranges_done, 1);
    assert_eq!(rig.chain.chips()[1].nonce_ranges_done, 1);
}

/// The OON deadline expiring with a stuck chip demotes it by 50 MHz and
/// re-inits the chain
#[tokio::test]
async fn test_oon_timeout_demotes_stuck_chip() {
    let mut rig = test_rig(vec![FakeChip::asic()]);
    rig.chain.init().await.expect("init failed");
    queue_works(&mut rig, 4);

    // chip keeps its FIFO full and never raises OON
    rig.chain.transport.chips[0].in_flight = 2;
    rig.chain.timeout_oon = Duration::from_millis(0);

    let ranges = rig.chain.scan_pass().await.expect("scan failed");
    assert_eq!(ranges, 0);
    assert_eq!(rig.chain.chips()[0].mhz, 500);
    assert!(!rig.chain.chips()[0].disabled);
}

/// At the PLL floor a stuck chip is disabled instead of demoted; the last
/// chip going away surfaces as an error
#[tokio::test]
async fn test_stuck_chip_at_pll_floor_is_disabled() {
    let mut chips = vec![FakeChip::asic(), FakeChip::asic()];
    chips[1].in_flight = 2;
    let mut settings = test_settings();
    settings.pll_mhz = 50;
    let mut rig = test_rig_with(chips, settings, nexminer::work::AcceptAll);
    rig.chain.init().await.expect("init failed");

    rig.chain.recover().await.expect("recover failed");
    assert!(rig.chain.chips()[1].disabled);
    assert_eq!(rig.chain.chips()[1].num_cores, 0);
    // the survivor owns the whole nonce space again
    assert_eq!(rig.chain.chips()[0].start_nonce, 0);
    assert_eq!(rig.chain.chips()[0].end_nonce, MAX_NONCE_SIZE_ASIC);
}

/// WRITE_PARM payload echoed back by READ_PARM is identical
#[tokio::test]
async fn test_write_parm_read_parm_round_trip() {
    let mut rig = test_rig(vec![FakeChip::asic()]);
    rig.chain.init().await.expect("init failed");

    let work = null_work::prepare_benchmark(42, 4, 1.0);
    let expected = {
        let mut payload = Vec::new();
        payload.extend_from_slice(&work.midstates[0].state);
        payload.extend_from_slice(&work.merkle_root_tail.to_be_bytes());
        payload.extend_from_slice(&work.ntime.to_be_bytes());
        payload.extend_from_slice(&work.nbits.to_be_bytes());
        for i in 1..4 {
            payload.extend_from_slice(&work.midstates[i].state);
        }
        payload
    };
    rig.chain.set_work(work).expect("set_work failed");

    let echoed = rig.chain.cmd_read_parm(1).expect("read_parm failed");
    assert_eq!(echoed, expected);
}

/// The first work after chain bring-up always transmits WRITE_TARGET
#[tokio::test]
async fn test_first_work_sends_target() {
    let mut rig = test_rig(vec![FakeChip::asic()]);
    rig.chain.init().await.expect("init failed");
    rig.chain.transport.log.clear();

    rig.chain
        .set_work(null_work::prepare_benchmark(0, 4, 1.0))
        .expect("set_work failed");
    assert_eq!(rig.chain.transport.count_op(Opcode::WriteTarget), 1);
}

/// Version rolling drives the ASIC-boost enable flag of RUN_JOB
#[tokio::test]
async fn test_asic_boost_flag_follows_version_mask() {
    let mut rig = test_rig(vec![FakeChip::asic()]);
    rig.chain.init().await.expect("init failed");
    rig.chain.transport.log.clear();

    rig.chain
        .set_work(null_work::prepare_benchmark(0, 4, 1.0))
        .expect("set_work failed");
    rig.chain
        .set_work(null_work::prepare_benchmark(1, 1, 1.0))
        .expect("set_work failed");

    let flags: Vec<u8> = rig
        .chain
        .transport
        .commands(Opcode::RunJob)
        .iter()
        .map(|cmd| cmd.params[0])
        .collect();
    assert_eq!(flags, vec![crate::command::ASIC_BOOST_EN, 0]);
}
