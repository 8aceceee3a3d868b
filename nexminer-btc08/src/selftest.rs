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

//! Hash board self-test harness for the production line.
//!
//! The test sweeps both voltage points, re-discovers and re-inits the chain
//! at each one, runs the embedded golden job against every chip with all
//! chips sweeping the full nonce space, and finishes with a full-load soak
//! where the chain refills itself through OON events. A chip passes when it
//! latches the golden nonce (after hash-depth back-correction) under its
//! expected job id.

use crate::chip::Chip;
use crate::command::{golden, FrameBuilder, Opcode, BCAST_CHIP_ID, WRITE_PARM_LEN};
use crate::config::ResolvedSelftestConfig;
use crate::error::{self, ErrorKind};
use crate::spi::{Frame, Transport};
use crate::HashChain;

use nexminer::logging::macros::*;

use embedded_hal::digital::v2::{InputPin, OutputPin};
use tokio::time::sleep;

use std::fmt::Debug;
use std::time::{Duration, Instant};

/// Voltage settle time after switching a test point
const VOLT_SETTLE: Duration = Duration::from_millis(500);
/// Soak time for one golden job before the per-chip checks
const GOLDEN_JOB_SETTLE: Duration = Duration::from_millis(1_000);
/// How long one chip may take to report the golden nonce
const GN_WAIT_LIMIT: Duration = Duration::from_secs(50);
/// Poll cadence while waiting on chip job state
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Embedded test job; the remainder of the WRITE_PARM payload stays zero
const TEST_JOB: [u8; 48] = [
    0x07, 0x00, 0x4f, 0x40, 0x63, 0xf5, 0x49, 0x63, //
    0x8d, 0x39, 0x6d, 0x6e, 0x8e, 0x43, 0xf6, 0x3f, //
    0x8b, 0xa2, 0x65, 0xb0, 0xba, 0xa4, 0xe3, 0xaf, //
    0xc3, 0x50, 0x29, 0x36, 0x5a, 0x98, 0x4c, 0xf6, //
    0x9e, 0xb7, 0x91, 0x5c, 0x88, 0x7a, 0x53, 0x6d, //
    0xc8, 0x02, 0x19, 0x00, 0x89, 0x6c, 0x00, 0x00,
];

/// Target the test job solves against
const TEST_TARGET: [u8; 6] = [0x19, 0x00, 0x89, 0x6c, 0x05, 0x10];

/// Golden nonce with the per-chip pipeline offset removed
fn corrected_nonce(raw: u32, chip: &Chip) -> u32 {
    raw.wrapping_sub(chip.hash_depth.wrapping_mul(chip.num_cores as u32))
}

impl<T, I, O> HashChain<T, I, O>
where
    T: Transport,
    I: InputPin,
    I::Error: Debug,
    O: OutputPin,
    O::Error: Debug,
{
    /// Stream the embedded test job into all chips: job parameters, an OON
    /// clear, the fixed test target and RUN_JOB, as one burst.
    fn submit_test_job(&mut self, job_id: u8) -> error::Result<()> {
        let mut payload = [0u8; WRITE_PARM_LEN];
        payload[..TEST_JOB.len()].copy_from_slice(&TEST_JOB);

        let frames = vec![
            Frame::new(
                FrameBuilder::new(Opcode::WriteParm, BCAST_CHIP_ID)
                    .param(&payload)
                    .build(),
            ),
            Frame::new(FrameBuilder::new(Opcode::ClearOon, BCAST_CHIP_ID).build()),
            Frame::new(
                FrameBuilder::new(Opcode::WriteTarget, BCAST_CHIP_ID)
                    .param(&TEST_TARGET)
                    .build(),
            ),
            Frame::new(
                FrameBuilder::new(Opcode::RunJob, BCAST_CHIP_ID)
                    .param(&[0, job_id])
                    .build(),
            ),
        ];
        self.transport.transfer_batch(&frames)
    }

    /// Check one chip for the golden nonce of the test job `job_id`
    async fn check_golden_nonce(&mut self, chip_id: u8, job_id: u8) -> error::Result<()> {
        let deadline = Instant::now() + GN_WAIT_LIMIT;
        let status = loop {
            let status = self.cmd_read_job_id(chip_id)?;
            if status.chip_id != chip_id {
                Err(ErrorKind::Protocol(format!(
                    "chip {} answered as chip {}",
                    chip_id, status.chip_id
                )))?
            }
            if status.oon_irq() {
                break status;
            }
            if Instant::now() >= deadline {
                // drain the result latch before moving on
                let _ = self.cmd_read_result(chip_id);
                Err(ErrorKind::Hashchip(format!(
                    "chip {}: golden nonce timeout",
                    chip_id
                )))?
            }
            sleep(POLL_INTERVAL).await;
        };

        if !status.gn_irq() {
            let _ = self.cmd_read_result(chip_id);
            Err(ErrorKind::Hashchip(format!(
                "chip {}: no golden nonce found",
                chip_id
            )))?
        }
        if status.oon_job_id != job_id || status.gn_job_id != job_id {
            Err(ErrorKind::Hashchip(format!(
                "chip {}: wrong job ids in register (oon {}, gn {}, expected {})",
                chip_id, status.oon_job_id, status.gn_job_id, job_id
            )))?
        }

        let result = self.cmd_read_result(chip_id)?;
        let chip = &self.chips[chip_id as usize - 1];
        let nonce = corrected_nonce(result.nonces[0], chip);
        if nonce != golden::NONCE_VALUE {
            Err(ErrorKind::Hashchip(format!(
                "chip {}: nonce {:#010x} is not correct, it must be {:#010x}",
                chip_id,
                nonce,
                golden::NONCE_VALUE
            )))?
        }
        Ok(())
    }

    /// Re-discover and re-init the chain at one voltage point and verify
    /// every chip finds the golden nonce
    async fn selftest_at_point(
        &mut self,
        cfg: &ResolvedSelftestConfig,
        point: usize,
        job_weight: &mut u8,
    ) -> error::Result<()> {
        let band = &cfg.bands[point];

        self.cmd_reset_bcast()?;
        sleep(VOLT_SETTLE).await;

        if let Some(sense) = self.voltage.clone() {
            let mv = sense.read_mv()?;
            if !band.contains(mv) {
                Err(ErrorKind::Adc(format!(
                    "power error ({} mV detected, it must be {} mV)",
                    mv, band.nominal_mv
                )))?
            }
            info!("-- test chips at {} mV --", mv);
        }

        let num_chips = self.cmd_auto_address()?;
        if num_chips < cfg.min_chips {
            Err(ErrorKind::Hashchip(format!(
                "chip number FAIL (total {}, not {})",
                num_chips, cfg.min_chips
            )))?
        }
        self.num_chips = num_chips;
        self.num_active_chips = num_chips;
        self.chips = vec![Chip::new(); num_chips];

        for chip_id in 1..=num_chips as u8 {
            self.cmd_read_id(chip_id)?;
        }
        self.read_features()?;
        self.set_pll_all().await?;
        self.cmd_set_control(BCAST_CHIP_ID, self.settings.udiv)?;

        self.cmd_reset_bcast()?;
        self.is_processing_job = false;
        self.run_bist().await?;

        for (idx, chip) in self.chips.iter().enumerate() {
            if chip.num_cores < cfg.min_cores {
                Err(ErrorKind::Hashchip(format!(
                    "chip {} has not enough cores ({}, minimum is {})",
                    idx + 1,
                    chip.num_cores,
                    cfg.min_cores
                )))?
            }
        }

        // every chip sweeps the full space so each one finds the nonce
        self.assign_nonce_ranges(true)?;

        let job_id = (*job_weight & 3) + 1;
        *job_weight = job_weight.wrapping_add(1);
        self.submit_test_job(job_id)?;
        sleep(GOLDEN_JOB_SETTLE).await;

        let mut failures = 0;
        for chip_id in 1..=self.num_active_chips as u8 {
            match self.check_golden_nonce(chip_id, job_id).await {
                Ok(()) => info!("chip {}: OK", chip_id),
                Err(e) => {
                    error!("chip {}: FAIL ({})", chip_id, e);
                    failures += 1;
                }
            }
        }
        if failures != 0 {
            Err(ErrorKind::Hashchip(format!(
                "{} chips failed the golden nonce test",
                failures
            )))?
        }
        Ok(())
    }

    /// Full-load soak: run with real (proportional) nonce ranges and keep
    /// the pipeline refilled via OON for the configured duration, checking
    /// every reported nonce against the golden value.
    async fn selftest_full_load(
        &mut self,
        cfg: &ResolvedSelftestConfig,
        job_weight: &mut u8,
    ) -> error::Result<()> {
        self.assign_nonce_ranges(false)?;

        let deadline = Instant::now() + cfg.fulltest;
        while Instant::now() < deadline {
            if self.gn_pin.is_low().map_err(super::gpio_err)? {
                let status = self.cmd_read_job_id(BCAST_CHIP_ID)?;
                if status.gn_irq() {
                    let chip_id = status.chip_id;
                    if chip_id >= 1 && chip_id as usize <= self.num_active_chips {
                        let result = self.cmd_read_result(chip_id)?;
                        let chip = &self.chips[chip_id as usize - 1];
                        let nonce = corrected_nonce(result.nonces[0], chip);
                        if nonce != golden::NONCE_VALUE {
                            Err(ErrorKind::Hashchip(format!(
                                "full load: chip {} nonce {:#010x} is not correct",
                                chip_id, nonce
                            )))?
                        }
                    }
                }
            }

            if self.oon_pin.is_low().map_err(super::gpio_err)? {
                self.cmd_clear_oon()?;
                let job_id = (*job_weight & 3) + 1;
                *job_weight = job_weight.wrapping_add(1);
                self.submit_test_job(job_id)?;
            }

            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Run the complete hash board self-test. The chain must have been
    /// initialized once before.
    pub async fn hashboard_selftest(
        &mut self,
        cfg: &ResolvedSelftestConfig,
    ) -> error::Result<()> {
        info!("----------------------- hash board test mode -----------------------");
        info!("--- voltage bands: {:?} ---", cfg.bands);
        info!("--- minimum core number: {} ---", cfg.min_cores);
        info!(
            "--- full load test time: {}.{:03} seconds ---",
            cfg.fulltest.as_secs(),
            cfg.fulltest.subsec_millis()
        );

        let mut job_weight: u8 = 0;
        for point in 0..cfg.bands.len() {
            self.selftest_at_point(cfg, point, &mut job_weight).await?;
        }
        self.selftest_full_load(cfg, &mut job_weight).await?;

        info!("hash board test PASSED");
        Ok(())
    }
}
