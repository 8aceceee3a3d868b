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

//! Host-side driver for chains of BTC08 Bitcoin-hashing ASICs attached over
//! SPI.
//!
//! Each hash board is one `HashChain`: the driver discovers the chips with
//! AUTO_ADDRESS, brings them through reset, PLL lock and the built-in
//! self-test, splits the 32-bit nonce space across the chips proportionally
//! to their measured capability, and then keeps the in-chip job FIFO fed
//! from the frontend work queue. Golden-nonce and out-of-nonce events are
//! level-polled on two GPIO lines and harvested from the scan loop.

pub mod chip;
pub mod command;
pub mod config;
pub mod error;
pub mod gpio;
pub mod null_work;
pub mod pll;
pub mod power;
pub mod registry;
pub mod selftest;
pub mod spi;

#[cfg(test)]
pub mod test;

use crate::chip::{Chip, ChipState};
use crate::command::{
    golden, BistStatusReg, FeatureReg, FrameBuilder, JobStatusReg, Opcode, PllStatusReg,
    ReadResult, ASIC_BOOST_CORE_NUM, ASIC_BOOST_EN, BCAST_CHIP_ID, OON_IRQ_EN,
};
use crate::config::ResolvedChainConfig;
use crate::error::ErrorKind;
use crate::registry::{JobRegistry, JOB_SLOT_COUNT};
use crate::spi::{Frame, Transport};

use nexminer::logging::macros::*;
use nexminer::{hal, shutdown, stats, work};

use embedded_hal::digital::v2::{InputPin, OutputPin};
use futures::lock::Mutex;
use packed_struct::{PackedStruct, PackedStructSlice};
use tokio::time::sleep;

use std::collections::VecDeque;
use std::fmt::Debug;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Depth of the in-chip job FIFO; at most this many jobs are in flight
pub const MAX_JOB_FIFO: usize = 4;
/// Jobs refilled after every out-of-nonce event
const OON_REFILL_WORKS: usize = 2;
/// In-flight job count at which a chip is considered stuck
pub const OON_INT_MAXJOB: u8 = 2;
/// Bound of the per-chain frontend work queue
pub const WORK_QUEUE_LIMIT: usize = MAX_JOB_FIFO * 10;

/// Nonce space swept per job on real silicon
pub const MAX_NONCE_SIZE_ASIC: u32 = 0xffff_ffff;
/// The FPGA emulator sweeps a reduced space so a job still completes within
/// a second
pub const MAX_NONCE_SIZE_FPGA: u32 = 0x07ff_ffff;

/// Out-of-nonce deadline; a silent chain longer than this is recovered
const TIMEOUT_OON: Duration = Duration::from_millis(4_000);
const TIMEOUT_OON_FPGA: Duration = Duration::from_millis(120_000);

/// Width of the reset pulse on the RESET line
const RESET_PULSE: Duration = Duration::from_millis(1);

/// READ_BIST polling budget
const BIST_WAIT_CYCLES: usize = 10;
const BIST_CYCLE_WAIT_TIME: Duration = Duration::from_millis(200);

/// Cadence of the voltage/temperature monitor task
const MONITOR_INTERVAL: Duration = Duration::from_millis(2_000);

/// SPI bus numbers backing the two hash board ports
pub const SPI_BUS_MAP: [u32; gpio::MAX_SPI_PORT] = [0, 2];

/// Production chain type: spidev transport and sysfs pins
pub type SpiHashChain = HashChain<spi::Bus, gpio::PinIn, gpio::PinOut>;

/// Raw solution as reported by a BTC08 chip
#[derive(Clone, Debug)]
pub struct Solution {
    /// Actual nonce
    nonce: u32,
    /// Micro-job (rolled version variant) that produced the nonce
    midstate_idx: usize,
    /// Order of this solution within one READ_RESULT
    solution_idx: usize,
}

impl hal::BackendSolution for Solution {
    #[inline]
    fn nonce(&self) -> u32 {
        self.nonce
    }

    #[inline]
    fn midstate_idx(&self) -> usize {
        self.midstate_idx
    }

    #[inline]
    fn solution_idx(&self) -> usize {
        self.solution_idx
    }
}

fn gpio_err<E: Debug>(e: E) -> error::Error {
    ErrorKind::Gpio(format!("{:?}", e)).into()
}

fn hex(buf: &[u8]) -> String {
    let mut out = String::with_capacity(buf.len() * 3);
    for byte in buf {
        let _ = write!(out, "{:02X} ", byte);
    }
    out
}

/// Driver state of one hash board. The chain is owned behind one mutex that
/// is held for a complete scan pass; the work-intake task takes the same
/// mutex to enqueue, which is the only way new work enters the chain.
pub struct HashChain<T, I, O> {
    pub(crate) chain_id: usize,
    pub(crate) transport: T,
    pub(crate) gn_pin: I,
    pub(crate) oon_pin: I,
    pub(crate) reset_pin: O,
    pub(crate) voltage: Option<power::VoltageSense>,
    pub(crate) settings: ResolvedChainConfig,
    pub(crate) solution_sender: work::SolutionSender,

    /// Chip roster indexed by chip id - 1
    pub(crate) chips: Vec<Chip>,
    /// Chip count reported by AUTO_ADDRESS
    pub(crate) num_chips: usize,
    /// Chips that answered READ_ID; must equal `num_chips` to mine
    pub(crate) num_active_chips: usize,
    /// Live cores across the chain
    pub(crate) num_cores: usize,
    /// Sum of per-chip performance scores
    pub(crate) perf: u64,

    /// Host mirror of the chip-side job FIFO
    pub(crate) registry: JobRegistry,
    /// Frontend work waiting to be pushed into the FIFO
    pub(crate) active_wq: VecDeque<work::Assignment>,
    /// Share difficulty the chips currently filter at; WRITE_TARGET is only
    /// re-sent when a work item differs
    pub(crate) sdiff: f64,
    /// First four jobs have been primed
    pub(crate) is_processing_job: bool,
    /// Sticky failure indicator observed by the framework
    pub(crate) disabled: bool,

    /// Top of the per-job nonce space (ASIC vs FPGA)
    pub(crate) max_nonce: u32,
    pub(crate) timeout_oon: Duration,
    /// Last board voltage snapshot in millivolts
    pub(crate) last_mvolt: u32,
}

impl<T, I, O> HashChain<T, I, O>
where
    T: Transport,
    I: InputPin,
    I::Error: Debug,
    O: OutputPin,
    O::Error: Debug,
{
    pub fn new(
        chain_id: usize,
        transport: T,
        gn_pin: I,
        oon_pin: I,
        reset_pin: O,
        voltage: Option<power::VoltageSense>,
        settings: ResolvedChainConfig,
        solution_sender: work::SolutionSender,
    ) -> Self {
        Self {
            chain_id,
            transport,
            gn_pin,
            oon_pin,
            reset_pin,
            voltage,
            settings,
            solution_sender,
            chips: Vec::new(),
            num_chips: 0,
            num_active_chips: 0,
            num_cores: 0,
            perf: 0,
            registry: JobRegistry::new(),
            active_wq: VecDeque::new(),
            sdiff: 0.0,
            is_processing_job: false,
            disabled: false,
            max_nonce: MAX_NONCE_SIZE_ASIC,
            timeout_oon: TIMEOUT_OON,
            last_mvolt: 0,
        }
    }

    #[inline]
    pub fn chain_id(&self) -> usize {
        self.chain_id
    }

    #[inline]
    pub fn settings(&self) -> &ResolvedChainConfig {
        &self.settings
    }

    #[inline]
    pub fn chips(&self) -> &[Chip] {
        &self.chips
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    #[inline]
    pub fn max_nonce(&self) -> u32 {
        self.max_nonce
    }

    #[inline]
    pub fn timeout_oon(&self) -> Duration {
        self.timeout_oon
    }

    /// The whole chain runs on FPGA silicon (mixed chains do not exist)
    fn is_fpga_chain(&self) -> bool {
        self.chips.last().map(Chip::is_fpga).unwrap_or(false)
    }

    /*
     * command layer
     */

    pub(crate) fn exec_cmd(
        &mut self,
        opcode: Opcode,
        chip_id: u8,
        params: &[u8],
        resp_len: usize,
        fast: bool,
    ) -> error::Result<Vec<u8>> {
        let builder = FrameBuilder::new(opcode, chip_id)
            .param(params)
            .response(resp_len);
        let resp_off = builder.response_offset();
        let tx = builder.build();
        let mut rx = vec![0u8; tx.len()];

        let result = if fast {
            self.transport.transfer_fast(&tx, &mut rx)
        } else {
            self.transport.transfer(&tx, &mut rx)
        };
        if let Err(e) = result {
            self.disabled = true;
            error!("{}: {:?} transfer failed", self.chain_id, opcode);
            return Err(e);
        }
        command::invert(&mut rx);

        if self.settings.dump_traffic {
            debug!("{}: {:?} TX: {}", self.chain_id, opcode, hex(&tx));
            debug!("{}: {:?} RX: {}", self.chain_id, opcode, hex(&rx));
        }
        Ok(rx[resp_off..].to_vec())
    }

    pub(crate) fn cmd_reset_bcast(&mut self) -> error::Result<()> {
        self.exec_cmd(Opcode::Reset, BCAST_CHIP_ID, &[], 0, false)?;
        info!("{}: RESET broadcast", self.chain_id);
        Ok(())
    }

    /// AUTO_ADDRESS the chain; the chips self-address and the response
    /// carries the total chip count
    pub(crate) fn cmd_auto_address(&mut self) -> error::Result<usize> {
        let resp = self.exec_cmd(
            Opcode::AutoAddress,
            BCAST_CHIP_ID,
            &[0u8; command::AUTO_ADDRESS_PARM_LEN],
            command::RET_AUTO_ADDRESS_LEN,
            false,
        )?;
        if resp[0] != Opcode::AutoAddress as u8 {
            Err(ErrorKind::Protocol(format!(
                "{}: AUTO_ADDRESS echoed opcode {:#04x}",
                self.chain_id, resp[0]
            )))?
        }
        Ok(resp[1] as usize)
    }

    /// READ_ID with chip id echo verification. The returned bytes also
    /// carry the chip's in-flight job count.
    pub(crate) fn cmd_read_id(&mut self, chip_id: u8) -> error::Result<[u8; 4]> {
        let resp = self.exec_cmd(Opcode::ReadId, chip_id, &[], command::RET_READ_ID_LEN, false)?;
        if resp.len() < 4 || resp[3] != chip_id {
            Err(ErrorKind::Protocol(format!(
                "{}: READ_ID chip {} failed",
                self.chain_id, chip_id
            )))?
        }
        Ok([resp[0], resp[1], resp[2], resp[3]])
    }

    pub(crate) fn cmd_read_job_id(&mut self, chip_id: u8) -> error::Result<JobStatusReg> {
        let resp = self.exec_cmd(
            Opcode::ReadJobId,
            chip_id,
            &[],
            command::RET_READ_JOB_ID_LEN,
            false,
        )?;
        JobStatusReg::unpack_from_slice(&resp[..command::RET_READ_JOB_ID_LEN]).map_err(|e| {
            ErrorKind::Protocol(format!("{}: READ_JOB_ID unpacking: {}", self.chain_id, e)).into()
        })
    }

    pub(crate) fn cmd_read_result(&mut self, chip_id: u8) -> error::Result<ReadResult> {
        let resp = self.exec_cmd(
            Opcode::ReadResult,
            chip_id,
            &[],
            command::RET_READ_RESULT_LEN,
            false,
        )?;
        ReadResult::from_response(&resp)
    }

    fn cmd_read_hash(&mut self, chip_id: u8) -> error::Result<Vec<u8>> {
        self.exec_cmd(
            Opcode::ReadHash,
            chip_id,
            &[],
            command::RET_READ_HASH_LEN,
            false,
        )
    }

    /// Debug readback of the job parameters a chip latched
    #[allow(dead_code)]
    pub(crate) fn cmd_read_parm(&mut self, chip_id: u8) -> error::Result<Vec<u8>> {
        let resp = self.exec_cmd(
            Opcode::ReadParm,
            chip_id,
            &[],
            command::WRITE_PARM_LEN,
            false,
        )?;
        Ok(resp[..command::WRITE_PARM_LEN].to_vec())
    }

    pub(crate) fn cmd_clear_oon(&mut self) -> error::Result<()> {
        self.exec_cmd(Opcode::ClearOon, BCAST_CHIP_ID, &[], 0, true)?;
        Ok(())
    }

    fn cmd_read_bist(&mut self, chip_id: u8) -> error::Result<BistStatusReg> {
        let resp = self.exec_cmd(
            Opcode::ReadBist,
            chip_id,
            &[],
            command::RET_READ_BIST_LEN,
            false,
        )?;
        BistStatusReg::unpack_from_slice(&resp[..command::RET_READ_BIST_LEN]).map_err(|e| {
            ErrorKind::Protocol(format!("{}: READ_BIST unpacking: {}", self.chain_id, e)).into()
        })
    }

    fn cmd_read_pll(&mut self, chip_id: u8) -> error::Result<PllStatusReg> {
        let resp = self.exec_cmd(Opcode::ReadPll, chip_id, &[], command::RET_READ_PLL_LEN, false)?;
        PllStatusReg::unpack_from_slice(&resp[..command::RET_READ_PLL_LEN]).map_err(|e| {
            ErrorKind::Protocol(format!("{}: READ_PLL unpacking: {}", self.chain_id, e)).into()
        })
    }

    fn cmd_read_feature(&mut self, chip_id: u8) -> error::Result<u32> {
        let resp = self.exec_cmd(
            Opcode::ReadFeature,
            chip_id,
            &[],
            command::RET_READ_FEATURE_LEN,
            false,
        )?;
        Ok(u32::from_be_bytes([resp[0], resp[1], resp[2], resp[3]]))
    }

    fn cmd_read_revision(&mut self, chip_id: u8) -> error::Result<[u8; 4]> {
        let resp = self.exec_cmd(
            Opcode::ReadRevision,
            chip_id,
            &[],
            command::RET_READ_REVISION_LEN,
            false,
        )?;
        Ok([resp[0], resp[1], resp[2], resp[3]])
    }

    fn cmd_set_pll_fout_en(&mut self, chip_id: u8, fout: u8) -> error::Result<()> {
        self.exec_cmd(
            Opcode::SetPllFoutEn,
            chip_id,
            &[0, fout & 1, 0, 0],
            0,
            true,
        )?;
        Ok(())
    }

    fn cmd_set_pll_resetb(&mut self, chip_id: u8, reset: u8) -> error::Result<()> {
        self.exec_cmd(
            Opcode::SetPllResetB,
            chip_id,
            &[0, reset & 1, 0, 0],
            0,
            true,
        )?;
        Ok(())
    }

    fn cmd_set_pll_config(&mut self, chip_id: u8, word: u32) -> error::Result<()> {
        self.exec_cmd(Opcode::SetPllConfig, chip_id, &word.to_be_bytes(), 0, true)?;
        Ok(())
    }

    pub(crate) fn cmd_set_control(&mut self, chip_id: u8, value: u32) -> error::Result<()> {
        self.exec_cmd(Opcode::SetControl, chip_id, &value.to_be_bytes(), 0, false)?;
        Ok(())
    }

    fn cmd_write_nonce(&mut self, chip_id: u8, start_nonce: u32, end_nonce: u32) -> error::Result<()> {
        let mut range = [0u8; command::NONCE_LEN * 2];
        range[..4].copy_from_slice(&start_nonce.to_be_bytes());
        range[4..].copy_from_slice(&end_nonce.to_be_bytes());
        self.exec_cmd(Opcode::WriteNonce, chip_id, &range, 0, false)?;
        Ok(())
    }

    /// Load the golden job into every chip and start the self-test
    pub(crate) fn cmd_bist_bcast(&mut self) -> error::Result<()> {
        self.exec_cmd(Opcode::WriteParm, BCAST_CHIP_ID, &golden::PARAM, 0, false)?;
        self.exec_cmd(Opcode::WriteTarget, BCAST_CHIP_ID, &golden::TARGET, 0, false)?;
        self.exec_cmd(Opcode::WriteNonce, BCAST_CHIP_ID, &golden::NONCE, 0, false)?;
        let mask = command::core_disable_mask(self.settings.enabled_cores, chip::MAX_CORES_PER_CHIP);
        self.exec_cmd(Opcode::SetDisable, BCAST_CHIP_ID, &mask, 0, false)?;
        self.exec_cmd(Opcode::RunBist, BCAST_CHIP_ID, &golden::HASH, 0, false)?;
        Ok(())
    }

    /*
     * chain initialization
     */

    /// Pulse the RESET line
    pub(crate) async fn hw_reset(&mut self) -> error::Result<()> {
        self.reset_pin.set_low().map_err(gpio_err)?;
        sleep(RESET_PULSE).await;
        self.reset_pin.set_high().map_err(gpio_err)?;
        Ok(())
    }

    /// Full chain bring-up: reset, discovery, PLL, BIST, nonce ranges
    pub async fn init(&mut self) -> error::Result<()> {
        info!("{}: initializing BTC08 hash chain", self.chain_id);
        self.hw_reset().await?;
        self.init_chain().await
    }

    /// Bring-up starting at chip discovery; also the re-init path used by
    /// flush and recovery
    async fn init_chain(&mut self) -> error::Result<()> {
        self.num_cores = 0;
        self.perf = 0;
        self.is_processing_job = false;

        self.chain_detect()?;
        info!(
            "{}: found {} BTC08 chips",
            self.chain_id, self.num_chips
        );

        self.read_features()?;
        self.check_min_chips()?;
        self.set_pll_all().await?;
        self.run_bist().await?;
        self.assign_nonce_ranges(self.settings.test_mode)?;
        self.cmd_set_control(BCAST_CHIP_ID, OON_IRQ_EN | self.settings.udiv)?;

        info!(
            "{}: {} chips with {} active cores, perf {}",
            self.chain_id, self.num_active_chips, self.num_cores, self.perf
        );
        Ok(())
    }

    /// Discover the chain: reset, self-address, verify every chip answers.
    /// A chain where any chip stays silent refuses to mine.
    fn chain_detect(&mut self) -> error::Result<()> {
        self.cmd_reset_bcast()?;

        let num_chips = self.cmd_auto_address()?;
        if num_chips == 0 {
            Err(ErrorKind::Hashchip(format!(
                "{}: no chips detected",
                self.chain_id
            )))?
        }

        let mut active_chips = 0;
        for chip_id in (1..=num_chips as u8).rev() {
            match self.cmd_read_id(chip_id) {
                Ok(_) => active_chips += 1,
                Err(e) => {
                    warn!("{}: READ_ID({}): {}", self.chain_id, chip_id, e);
                    break;
                }
            }
        }

        if active_chips != num_chips {
            self.num_chips = 0;
            self.num_active_chips = 0;
            Err(ErrorKind::Hashchip(format!(
                "{}: only {} of {} chips answered, refusing to mine",
                self.chain_id, active_chips, num_chips
            )))?
        }

        self.num_chips = num_chips;
        self.num_active_chips = active_chips;
        self.chips = vec![Chip::new(); active_chips];
        for chip in self.chips.iter_mut() {
            chip.state = ChipState::Detected;
        }
        Ok(())
    }

    /// Read the feature and revision registers of every chip and derive the
    /// chain-wide nonce space and OON deadline from the silicon class
    pub(crate) fn read_features(&mut self) -> error::Result<()> {
        for idx in 0..self.num_active_chips {
            let chip_id = (idx + 1) as u8;
            let rev = self.cmd_read_feature(chip_id)?;
            let feature = FeatureReg::unpack(&rev.to_be_bytes()).map_err(|e| {
                error::Error::from(ErrorKind::Protocol(format!(
                    "{}: READ_FEATURE unpacking: {}",
                    self.chain_id, e
                )))
            })?;
            let date = self.cmd_read_revision(chip_id)?;
            let chip = &mut self.chips[idx];
            chip.rev = rev;
            chip.hash_depth = u32::from(feature.hash_depth);
            info!(
                "{}: chip {} feature {:#010x} date({:02x}/{:02x}/{:02x}) index({:02x})",
                self.chain_id, chip_id, rev, date[0], date[1], date[2], date[3]
            );
        }

        if self.is_fpga_chain() {
            self.max_nonce = MAX_NONCE_SIZE_FPGA;
            self.timeout_oon = TIMEOUT_OON_FPGA;
            self.transport.limit_fast_speed(spi::MAX_FAST_SPEED_HZ_FPGA);
        } else {
            self.max_nonce = MAX_NONCE_SIZE_ASIC;
            self.timeout_oon = TIMEOUT_OON;
        }
        Ok(())
    }

    /// Real silicon must be populated with a minimum number of chips
    fn check_min_chips(&self) -> error::Result<()> {
        if !self.is_fpga_chain() && self.num_chips < self.settings.min_chips {
            Err(ErrorKind::Config(format!(
                "{}: not enough chips ({}, minimum {})",
                self.chain_id, self.num_chips, self.settings.min_chips
            )))?
        }
        Ok(())
    }

    /// Program one chip (or the broadcast address) through the PLL
    /// sequence: disable FOUT, write the PMS word, pulse RESETB, enable
    /// FOUT again
    async fn program_pll(&mut self, chip_id: u8, entry: &pll::PllEntry) -> error::Result<()> {
        self.cmd_set_pll_fout_en(chip_id, pll::FOUT_EN_DISABLE)?;
        self.cmd_set_pll_config(chip_id, entry.word())?;
        self.cmd_set_pll_resetb(chip_id, pll::RESETB_RESET)?;
        self.cmd_set_pll_resetb(chip_id, pll::RESETB_ON)?;
        sleep(pll::PLL_RESET_SETTLE).await;
        self.cmd_set_pll_fout_en(chip_id, pll::FOUT_EN_ENABLE)?;
        Ok(())
    }

    /// Poll one chip for PLL lock within the configured budget
    async fn wait_pll_lock(&mut self, chip_id: u8) -> error::Result<bool> {
        for _ in 0..pll::MAX_PLL_WAIT_CYCLES {
            let status = self.cmd_read_pll(chip_id)?;
            if status.locked {
                debug!("{}: PLL locked on chip {}", self.chain_id, chip_id);
                return Ok(true);
            }
            sleep(pll::PLL_CYCLE_WAIT_TIME).await;
        }
        error!("{}: failed to lock PLL on chip {}", self.chain_id, chip_id);
        Ok(false)
    }

    /// Program and lock the configured frequency on every chip. The FPGA
    /// emulator runs a fixed clock and skips this entirely.
    pub(crate) async fn set_pll_all(&mut self) -> error::Result<()> {
        if self.is_fpga_chain() {
            for chip in self.chips.iter_mut() {
                chip.mhz = pll::FPGA_CORE_CLK_MHZ;
                chip.state = ChipState::PllLocked;
            }
            warn!("{}: skipping PLL setup because FPGA", self.chain_id);
            return Ok(());
        }

        let entry = pll::lookup(self.settings.pll_mhz)?;
        self.program_pll(BCAST_CHIP_ID, entry).await?;

        let mut failed = 0;
        for idx in 0..self.num_active_chips {
            let chip_id = (idx + 1) as u8;
            if self.wait_pll_lock(chip_id).await? {
                self.chips[idx].mhz = entry.freq_mhz;
                self.chips[idx].state = ChipState::PllLocked;
            } else {
                self.chips[idx].mhz = 0;
                failed += 1;
            }
        }
        if failed != 0 {
            Err(ErrorKind::Pll(format!(
                "{}: {} chips failed to lock at {} MHz",
                self.chain_id, failed, entry.freq_mhz
            )))?
        }
        Ok(())
    }

    /// Wait for one chip to finish the BIST and record its live core count.
    /// Returns false when the chip is unusable.
    async fn check_chip(&mut self, chip_id: u8) -> error::Result<bool> {
        for _ in 0..BIST_WAIT_CYCLES {
            if !self.cmd_read_bist(chip_id)?.busy {
                break;
            }
            sleep(BIST_CYCLE_WAIT_TIME).await;
        }
        let status = self.cmd_read_bist(chip_id)?;
        if status.busy {
            Err(ErrorKind::Protocol(format!(
                "{}: BIST timeout on chip {}",
                self.chain_id, chip_id
            )))?
        }

        let idx = chip_id as usize - 1;
        self.chips[idx].num_cores = status.good_cores as usize;
        if !self.chips[idx].is_fpga() && self.chips[idx].num_cores < self.settings.min_cores {
            error!(
                "{}: chip {} has not enough cores ({}, minimum {})",
                self.chain_id, chip_id, self.chips[idx].num_cores, self.settings.min_cores
            );
            self.chips[idx].num_cores = 0;
            return Ok(false);
        }
        debug!(
            "{}: chip {} with {} active cores ({} MHz)",
            self.chain_id, chip_id, self.chips[idx].num_cores, self.chips[idx].mhz
        );
        Ok(true)
    }

    /// Run the golden-vector self-test on the whole chain and accumulate
    /// per-chip performance scores
    pub(crate) async fn run_bist(&mut self) -> error::Result<()> {
        self.cmd_bist_bcast()?;

        self.num_cores = 0;
        self.perf = 0;
        for idx in 0..self.num_active_chips {
            let chip_id = (idx + 1) as u8;
            if !self.chips[idx].is_usable() {
                continue;
            }
            if self.check_chip(chip_id).await? {
                self.chips[idx].state = ChipState::BistPassed;
            }
            self.num_cores += self.chips[idx].num_cores;
            self.perf += self.chips[idx].perf();
        }
        if self.num_cores == 0 {
            Err(ErrorKind::Hashchip(format!(
                "{}: no usable cores on the chain",
                self.chain_id
            )))?
        }
        Ok(())
    }

    /// Split the nonce space across the usable chips proportionally to
    /// their performance and write each chip's range. With `full_range` set
    /// (test mode) every chip sweeps the whole space so all of them find
    /// the golden nonce.
    pub(crate) fn assign_nonce_ranges(&mut self, full_range: bool) -> error::Result<()> {
        let usable: Vec<usize> = (0..self.num_active_chips)
            .filter(|idx| {
                let chip = &self.chips[*idx];
                chip.is_usable() && chip.num_cores > 0
            })
            .collect();
        if usable.is_empty() {
            Err(ErrorKind::Hashchip(format!(
                "{}: no chips left for nonce assignment",
                self.chain_id
            )))?
        }

        if full_range {
            for idx in usable.iter() {
                self.chips[*idx].start_nonce = 0;
                self.chips[*idx].end_nonce = self.max_nonce;
            }
        } else {
            let total_perf = self.perf;
            let mut start: u32 = 0;
            for (pos, idx) in usable.iter().enumerate() {
                let chip = &mut self.chips[*idx];
                chip.start_nonce = start;
                if pos == usable.len() - 1 {
                    chip.end_nonce = self.max_nonce;
                } else {
                    let share =
                        (u64::from(self.max_nonce) * chip.perf() / total_perf) as u32;
                    chip.end_nonce = chip.start_nonce + share;
                    start = chip.end_nonce + 1;
                }
            }
        }

        for idx in usable.iter() {
            let chip_id = (*idx + 1) as u8;
            let (start_nonce, end_nonce) =
                (self.chips[*idx].start_nonce, self.chips[*idx].end_nonce);
            debug!(
                "{}: chip {}: {:08X} ~ {:08X}",
                self.chain_id, chip_id, start_nonce, end_nonce
            );
            self.cmd_write_nonce(chip_id, start_nonce, end_nonce)?;
            self.chips[*idx].state = ChipState::Ready;
        }
        Ok(())
    }

    /*
     * steady-state job pipeline
     */

    /// Would `enqueue_work` reject more work right now
    #[inline]
    pub fn queue_full(&self) -> bool {
        self.active_wq.len() >= WORK_QUEUE_LIMIT
    }

    /// Sole entry point for new work. Gives the work back when the queue is
    /// at its bound.
    pub fn enqueue_work(
        &mut self,
        work: work::Assignment,
    ) -> std::result::Result<(), work::Assignment> {
        if self.queue_full() {
            return Err(work);
        }
        self.active_wq.push_back(work);
        Ok(())
    }

    /// WRITE_PARM payload: midstate 0, the second-chunk data tail, then the
    /// remaining three midstates. Works without version rolling repeat
    /// midstate 0.
    fn build_write_parm(&self, work: &work::Assignment) -> Vec<u8> {
        let ms0 = &work.midstates[0];
        let mut payload = Vec::with_capacity(command::WRITE_PARM_LEN);
        payload.extend_from_slice(&ms0.state);
        payload.extend_from_slice(&work.merkle_root_tail.to_be_bytes());
        payload.extend_from_slice(&work.ntime.to_be_bytes());
        payload.extend_from_slice(&work.nbits.to_be_bytes());
        for i in 1..ASIC_BOOST_CORE_NUM {
            let state = work
                .midstates
                .get(i)
                .map(|ms| &ms.state)
                .unwrap_or(&ms0.state);
            payload.extend_from_slice(state);
        }
        debug_assert_eq!(payload.len(), command::WRITE_PARM_LEN);
        FrameBuilder::new(Opcode::WriteParm, BCAST_CHIP_ID)
            .param(&payload)
            .build()
    }

    /// Push one work item into the chip FIFO: WRITE_PARM, WRITE_TARGET when
    /// the share difficulty changed, RUN_JOB, all streamed as one burst at
    /// the fast SPI speed. Overwriting a previously occupied slot retires
    /// that work (the chips finished it long ago) and books one completed
    /// nonce range on every chip that mined it.
    pub fn set_work(&mut self, work: work::Assignment) -> error::Result<()> {
        let job_id = self.registry.next_job_id();
        debug!("{}: queuing job_id {}", self.chain_id, job_id);

        let mut frames = Vec::with_capacity(3);
        frames.push(Frame::new(self.build_write_parm(&work)));

        if work.sdiff != self.sdiff {
            self.sdiff = work.sdiff;
            let nbits = work.share_target.to_compact();
            info!(
                "{}: share difficulty {:.2}, nbits {:#010x}",
                self.chain_id, self.sdiff, nbits
            );
            frames.push(Frame::new(
                FrameBuilder::new(Opcode::WriteTarget, BCAST_CHIP_ID)
                    .param(&command::target_payload(nbits))
                    .build(),
            ));
        }

        let mut flags = 0u8;
        if work.uses_version_rolling() {
            flags |= ASIC_BOOST_EN;
        }
        frames.push(Frame::new(
            FrameBuilder::new(Opcode::RunJob, BCAST_CHIP_ID)
                .param(&[flags, job_id])
                .build(),
        ));

        if let Err(e) = self.transport.transfer_batch(&frames) {
            self.disabled = true;
            error!(
                "{}: failed to set work for job_id {}",
                self.chain_id, job_id
            );
            // the dropped work is thereby completed upstream
            return Err(e);
        }

        let (stored_id, evicted) = self.registry.store(work);
        debug_assert_eq!(stored_id, job_id);
        let completed = evicted.is_some();
        for chip in self.chips.iter_mut().filter(|chip| chip.is_usable()) {
            chip.state = ChipState::Running;
            if completed {
                chip.nonce_ranges_done += 1;
            }
        }
        if completed {
            debug!(
                "{}: job slot {} retired, work completed",
                self.chain_id, job_id
            );
        }
        Ok(())
    }

    /// Harvest latched golden nonces from all chips. Returns the range
    /// penalty accumulated from hardware errors (zero or negative).
    pub(crate) fn harvest_golden_nonces(&mut self) -> error::Result<i64> {
        let mut penalty: i64 = 0;

        for id in 1..=self.num_active_chips as u8 {
            let status = self.cmd_read_job_id(id)?;
            if !status.gn_irq() {
                continue;
            }

            let job_id = status.gn_job_id;
            let chip_id = status.chip_id;
            // READ_RESULT also clears the GN latch, issue it before any
            // validation bails out
            let result = self.cmd_read_result(id)?;

            if chip_id < 1 || chip_id as usize > self.num_active_chips {
                warn!("{}: wrong chip_id {}", self.chain_id, chip_id);
                continue;
            }
            if job_id < 1 || job_id as usize > JOB_SLOT_COUNT {
                warn!(
                    "{}: chip {}: result has wrong job_id {}",
                    self.chain_id, chip_id, job_id
                );
                continue;
            }

            if self.settings.dump_traffic {
                let hashes = self.cmd_read_hash(id)?;
                debug!("{}: chip {} READ_HASH: {}", self.chain_id, chip_id, hex(&hashes));
            }

            let chip_idx = chip_id as usize - 1;
            let work = match self.registry.get(job_id) {
                Some(work) => work.clone(),
                None => {
                    // already flushed, the nonce is stale
                    warn!(
                        "{}: stale nonces for flushed job_id {} from chip {}: \
                         {:08x} {:08x} {:08x} {:08x}",
                        self.chain_id,
                        job_id,
                        chip_id,
                        result.nonces[0],
                        result.nonces[1],
                        result.nonces[2],
                        result.nonces[3]
                    );
                    self.chips[chip_idx].stales += 1;
                    continue;
                }
            };

            for i in 0..ASIC_BOOST_CORE_NUM {
                if result.micro_job_mask & (1 << i) == 0 {
                    continue;
                }
                if i >= work.midstate_count() {
                    warn!(
                        "{}: chip {} reported micro-job {} beyond the work's midstates",
                        self.chain_id, chip_id, i
                    );
                    self.chips[chip_idx].hw_errors += 1;
                    penalty -= 1;
                    continue;
                }

                let solution = work::Solution::new(
                    work.clone(),
                    Solution {
                        nonce: result.nonces[i],
                        midstate_idx: i,
                        solution_idx: 0,
                    },
                    None,
                );
                if self.solution_sender.submit(solution) {
                    debug!(
                        "{}: chip {} (job_id {}, micro_job {}): nonce {:#010x}",
                        self.chain_id, chip_id, job_id, i, result.nonces[i]
                    );
                    self.chips[chip_idx].nonces_found += 1;
                } else {
                    error!(
                        "{}: chip {} (job_id {}, micro_job {}): invalid nonce {:#010x}",
                        self.chain_id, chip_id, job_id, i, result.nonces[i]
                    );
                    self.chips[chip_idx].hw_errors += 1;
                    // a full nonce range of penalty for a hardware error
                    penalty -= 1;
                }
            }
        }
        Ok(penalty)
    }

    /// One scan pass: prime the FIFO on the first call, then poll the GN
    /// and OON lines until an out-of-nonce event refills the pipeline.
    /// Returns the number of nonce ranges processed by this pass.
    pub async fn scan_pass(&mut self) -> error::Result<u64> {
        if self.disabled {
            Err(ErrorKind::Hashboard(
                self.chain_id,
                "chain is disabled".to_string(),
            ))?
        }
        if self.num_cores == 0 {
            self.disabled = true;
            Err(ErrorKind::Hashboard(
                self.chain_id,
                format!("wrong core count {}", self.num_cores),
            ))?
        }

        let mut ranges: i64 = 0;

        if !self.is_processing_job {
            for _ in 0..MAX_JOB_FIFO {
                let work = match self.active_wq.pop_front() {
                    Some(work) => work,
                    None => {
                        warn!("{}: work underflow", self.chain_id);
                        return Ok(0);
                    }
                };
                self.set_work(work)?;
                self.is_processing_job = true;
            }
        }

        let deadline = Instant::now() + self.timeout_oon;
        loop {
            if self.gn_pin.is_low().map_err(gpio_err)? {
                ranges += self.harvest_golden_nonces()?;
            }

            if self.oon_pin.is_low().map_err(gpio_err)? {
                debug!("{}: OON, job done", self.chain_id);
                ranges += 2;
                self.cmd_clear_oon()?;

                for _ in 0..OON_REFILL_WORKS {
                    let work = match self.active_wq.pop_front() {
                        Some(work) => work,
                        None => {
                            info!("{}: work underflow", self.chain_id);
                            break;
                        }
                    };
                    self.set_work(work)?;
                }
                break;
            }

            if Instant::now() >= deadline {
                warn!(
                    "{}: no out-of-nonce event within {:?}, recovering chain",
                    self.chain_id, self.timeout_oon
                );
                self.recover().await?;
                return Ok(0);
            }
            tokio::task::yield_now().await;
        }

        Ok(ranges.max(0) as u64)
    }

    /*
     * flush & recovery
     */

    /// Requested by the frontend when the block changes: kill all in-flight
    /// work and bring the chain back up from chip discovery. The share
    /// difficulty is forgotten so the next work re-sends WRITE_TARGET.
    pub async fn flush_work(&mut self) -> error::Result<()> {
        info!("{}: flushing work", self.chain_id);
        self.hw_reset().await?;

        let flushed = self.registry.flush();
        let queued = self.active_wq.len();
        self.active_wq.clear();
        debug!(
            "{}: dropped {} in-flight jobs and {} queued works",
            self.chain_id, flushed, queued
        );

        self.sdiff = 0.0;
        self.is_processing_job = false;

        if let Err(e) = self.init_chain().await {
            self.disabled = true;
            return Err(e);
        }
        Ok(())
    }

    /// Take a chip out of service and remove its contribution from the
    /// chain totals
    fn disable_chip(&mut self, idx: usize) {
        warn!("{}: disabling chip {}", self.chain_id, idx + 1);
        self.chips[idx].disable();
        self.recompute_totals();
    }

    fn recompute_totals(&mut self) {
        self.num_cores = 0;
        self.perf = 0;
        for chip in self.chips.iter().filter(|chip| chip.is_usable()) {
            self.num_cores += chip.num_cores;
            self.perf += chip.perf();
        }
    }

    /// Recovery path taken when the OON deadline expires: demote or disable
    /// chips that stopped draining their FIFO, then re-init the chain.
    pub(crate) async fn recover(&mut self) -> error::Result<()> {
        let mut dirty = false;

        for idx in (0..self.num_active_chips).rev() {
            if self.chips[idx].disabled {
                continue;
            }
            let chip_id = (idx + 1) as u8;
            let resp = match self.cmd_read_id(chip_id) {
                Ok(resp) => resp,
                Err(e) => {
                    self.chips[idx].fail_count += 1;
                    error!(
                        "{}: chip {} stopped responding ({} failures): {}",
                        self.chain_id,
                        chip_id,
                        self.chips[idx].fail_count,
                        e
                    );
                    self.chips[idx].cooldown_begin = Some(Instant::now());
                    if self.chips[idx].fail_count >= chip::DISABLE_FAIL_THRESHOLD {
                        self.disable_chip(idx);
                    }
                    dirty = true;
                    continue;
                }
            };
            self.chips[idx].fail_count = 0;

            let in_flight = resp[2] & 0x07;
            if !self.chips[idx].is_fpga() && in_flight >= OON_INT_MAXJOB {
                if self.chips[idx].mhz > pll::MIN_PLL_FREQ_MHZ {
                    self.chips[idx].mhz -= pll::DEMOTE_STEP_MHZ;
                    warn!(
                        "{}: chip {} stuck with {} jobs, demoting to {} MHz",
                        self.chain_id, chip_id, in_flight, self.chips[idx].mhz
                    );
                } else {
                    error!(
                        "{}: chip {} stuck at the PLL floor, disabling",
                        self.chain_id, chip_id
                    );
                    self.disable_chip(idx);
                }
                dirty = true;
            }
        }

        if !dirty {
            warn!("{}: no chip errors behind the OON timeout", self.chain_id);
            return Ok(());
        }
        self.reinit_after_recovery().await
    }

    /// Re-program every surviving chip at its (possibly demoted) frequency
    /// and redo BIST and nonce assignment
    async fn reinit_after_recovery(&mut self) -> error::Result<()> {
        if !self.is_fpga_chain() {
            for idx in 0..self.num_active_chips {
                if !self.chips[idx].is_usable() || self.chips[idx].num_cores == 0 {
                    continue;
                }
                let chip_id = (idx + 1) as u8;
                let entry = pll::lookup(self.chips[idx].mhz)?;
                self.program_pll(chip_id, entry).await?;
                if self.wait_pll_lock(chip_id).await? {
                    self.chips[idx].mhz = entry.freq_mhz;
                } else {
                    self.chips[idx].mhz = 0;
                    self.disable_chip(idx);
                }
            }
        }

        self.cmd_reset_bcast()?;
        self.is_processing_job = false;
        self.run_bist().await?;
        self.assign_nonce_ranges(self.settings.test_mode)?;
        Ok(())
    }

    /// Snapshot the board core voltage
    pub fn read_voltage(&mut self) -> Option<u32> {
        let sense = self.voltage.as_ref()?;
        match sense.read_mv() {
            Ok(mv) => {
                self.last_mvolt = mv;
                Some(mv)
            }
            Err(e) => {
                debug!("{}: voltage read failed: {}", self.chain_id, e);
                None
            }
        }
    }
}

/*
 * backend registration and task wiring
 */

/// The BTC08 backend: detects chains on both SPI ports and spawns the scan,
/// work-intake and monitor tasks.
pub struct Backend {
    settings: ResolvedChainConfig,
}

impl Backend {
    pub fn new(settings: ResolvedChainConfig) -> Self {
        Self { settings }
    }
}

impl hal::Backend for Backend {
    const DEFAULT_MIDSTATE_COUNT: usize = config::ASIC_BOOST_MIDSTATE_COUNT;
    const JOB_TIMEOUT: Duration = config::JOB_TIMEOUT;

    fn run(
        &self,
        generator: work::Generator,
        solution_sender: work::SolutionSender,
        mining_stats: Arc<Mutex<stats::Mining>>,
        shutdown: shutdown::Sender,
    ) {
        let settings = self.settings.clone();
        tokio::spawn(start_miner(
            settings,
            generator,
            solution_sender,
            mining_stats,
            shutdown,
        ));
    }
}

/// Probe one hash board port and bring its chain up
pub async fn setup_chain(
    pin_mgr: &gpio::ControlPinManager,
    port: usize,
    settings: &ResolvedChainConfig,
    solution_sender: work::SolutionSender,
) -> error::Result<SpiHashChain> {
    let plug_pin = pin_mgr.get_pin_in(gpio::PinInName::Plug(port))?;
    if plug_pin.is_low()? {
        Err(ErrorKind::Hashboard(port, "not present".to_string()))?
    }
    let body_pin = pin_mgr.get_pin_in(gpio::PinInName::BodyDetect(port))?;
    debug!(
        "board {}: type {}",
        port,
        if body_pin.is_high()? { "hash" } else { "vtk" }
    );

    let mut power_pin = pin_mgr.get_pin_out(gpio::PinOutName::PowerEn(port))?;
    power_pin.set_high()?;

    let gn_pin = pin_mgr.get_pin_in(gpio::PinInName::Gn(port))?;
    let oon_pin = pin_mgr.get_pin_in(gpio::PinInName::Oon(port))?;
    let reset_pin = pin_mgr.get_pin_out(gpio::PinOutName::Rst(port))?;

    let bus = spi::Bus::open(SPI_BUS_MAP[port], 0, settings.spi_clk_khz)?;

    let mut chain = HashChain::new(
        port,
        bus,
        gn_pin,
        oon_pin,
        reset_pin,
        Some(power::VoltageSense::new(port)),
        settings.clone(),
        solution_sender,
    );
    chain.init().await?;
    Ok(chain)
}

fn spawn_scan_task<T, I, O>(
    chain: Arc<Mutex<HashChain<T, I, O>>>,
    mining_stats: Arc<Mutex<stats::Mining>>,
) where
    T: Transport,
    I: InputPin + Send + 'static,
    I::Error: Debug,
    O: OutputPin + Send + 'static,
    O::Error: Debug,
{
    tokio::spawn(async move {
        loop {
            let mut inner = chain.lock().await;
            let range_size = u64::from(inner.max_nonce()) + 1;
            match inner.scan_pass().await {
                Ok(0) => {
                    drop(inner);
                    // give the intake task a chance to refill the queue
                    sleep(Duration::from_millis(10)).await;
                }
                Ok(ranges) => {
                    drop(inner);
                    mining_stats.lock().await.account_ranges(
                        ranges,
                        range_size,
                        ASIC_BOOST_CORE_NUM,
                    );
                }
                Err(e) => {
                    let chain_id = inner.chain_id();
                    let dead = inner.is_disabled();
                    drop(inner);
                    error!("{}: scan pass failed: {}", chain_id, e);
                    if dead {
                        error!("{}: chain disabled, stopping scan task", chain_id);
                        break;
                    }
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    });
}

fn spawn_monitor_task<T, I, O>(chain: Arc<Mutex<HashChain<T, I, O>>>)
where
    T: Transport,
    I: InputPin + Send + 'static,
    I::Error: Debug,
    O: OutputPin + Send + 'static,
    O::Error: Debug,
{
    tokio::spawn(async move {
        loop {
            sleep(MONITOR_INTERVAL).await;
            let mut inner = chain.lock().await;
            if inner.is_disabled() {
                break;
            }
            if let Some(mv) = inner.read_voltage() {
                trace!("{}: board voltage {} mV", inner.chain_id(), mv);
            }
        }
    });
}

fn spawn_work_intake_task<T, I, O>(
    chains: Vec<Arc<Mutex<HashChain<T, I, O>>>>,
    mut generator: work::Generator,
    mining_stats: Arc<Mutex<stats::Mining>>,
    shutdown: shutdown::Sender,
) where
    T: Transport,
    I: InputPin + Send + 'static,
    I::Error: Debug,
    O: OutputPin + Send + 'static,
    O::Error: Debug,
{
    tokio::spawn(async move {
        let mut next = 0usize;
        loop {
            let work = match generator.generate().await {
                Some(work) => work,
                None => {
                    shutdown.send("no more work from the frontend");
                    return;
                }
            };
            let generated = work.midstate_count();

            let mut pending = Some(work);
            loop {
                let mut any_alive = false;
                for offset in 0..chains.len() {
                    let idx = (next + offset) % chains.len();
                    let mut inner = chains[idx].lock().await;
                    if inner.is_disabled() {
                        continue;
                    }
                    any_alive = true;
                    match inner.enqueue_work(pending.take().expect("BUG: work vanished")) {
                        Ok(()) => {
                            next = (idx + 1) % chains.len();
                            break;
                        }
                        Err(rejected) => pending = Some(rejected),
                    }
                }
                if pending.is_none() {
                    break;
                }
                if !any_alive {
                    shutdown.send("all BTC08 chains disabled");
                    return;
                }
                sleep(Duration::from_millis(50)).await;
            }

            mining_stats.lock().await.work_generated += generated;
        }
    });
}

/// Spawn the per-chain tasks plus the shared work intake
pub fn start_chains<T, I, O>(
    chains: Vec<Arc<Mutex<HashChain<T, I, O>>>>,
    generator: work::Generator,
    mining_stats: Arc<Mutex<stats::Mining>>,
    shutdown: shutdown::Sender,
) where
    T: Transport,
    I: InputPin + Send + 'static,
    I::Error: Debug,
    O: OutputPin + Send + 'static,
    O::Error: Debug,
{
    for chain in chains.iter() {
        spawn_scan_task(chain.clone(), mining_stats.clone());
        spawn_monitor_task(chain.clone());
    }
    spawn_work_intake_task(chains, generator, mining_stats, shutdown);
}

/// Detect and start all chains. Runs as the backend's top-level task.
async fn start_miner(
    settings: ResolvedChainConfig,
    generator: work::Generator,
    solution_sender: work::SolutionSender,
    mining_stats: Arc<Mutex<stats::Mining>>,
    shutdown: shutdown::Sender,
) {
    let pin_mgr = gpio::ControlPinManager::new();
    let mut chains = Vec::new();

    info!(
        "Initializing BTC08 miner, pll={} MHz, midstates={}",
        settings.pll_mhz, settings.midstate_count
    );

    for port in 0..gpio::MAX_SPI_PORT {
        match setup_chain(&pin_mgr, port, &settings, solution_sender.clone()).await {
            Ok(chain) => {
                info!(
                    "Detected BTC08 chain {} with {} chips / {} cores",
                    port, chain.num_active_chips, chain.num_cores
                );
                chains.push(Arc::new(Mutex::new(chain)));
            }
            Err(e) => warn!("No BTC08 chain on port {}: {}", port, e),
        }
    }

    if chains.is_empty() {
        shutdown.send("no BTC08 chains detected");
        return;
    }
    start_chains(chains, generator, mining_stats, shutdown);
}
