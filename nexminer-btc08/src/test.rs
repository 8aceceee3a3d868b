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

//! Shared test fakes: a scripted SPI transport that behaves like a BTC08
//! chain and pin fakes for the GN/OON/RESET lines.

pub mod scan;

use crate::command::{self, Opcode};
use crate::config::{self, CliOptions, ResolvedChainConfig};
use crate::error;
use crate::spi::{Frame, Transport};
use crate::HashChain;

use nexminer::work;

use embedded_hal::digital::v2::{InputPin, OutputPin};

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A pending golden nonce event on one fake chip
#[derive(Debug, Clone)]
pub struct GnEvent {
    pub job_id: u8,
    pub nonces: [u32; 4],
    pub micro_job_mask: u8,
}

/// Behavioural model of one chip on the fake chain
#[derive(Debug, Clone)]
pub struct FakeChip {
    /// Feature dword (silicon class in bits 8..11, hash depth in byte 0)
    pub rev: u32,
    /// Core count the BIST reports
    pub cores: u8,
    /// READ_BIST polls that still report busy before idling
    pub bist_busy_polls: u32,
    /// Whether the PLL ever reaches lock
    pub pll_locks: bool,
    /// In-flight job count reported by READ_ID / READ_JOB_ID
    pub in_flight: u8,
    /// Latched golden nonce, cleared by READ_RESULT
    pub gn: Option<GnEvent>,
    /// Last WRITE_PARM payload, echoed by READ_PARM
    pub last_parm: Vec<u8>,
}

impl FakeChip {
    pub fn asic() -> Self {
        Self {
            // class 5 silicon with hash depth 0x40
            rev: 0x0000_0540,
            cores: 206,
            bist_busy_polls: 0,
            pll_locks: true,
            in_flight: 0,
            gn: None,
            last_parm: Vec::new(),
        }
    }

    pub fn fpga() -> Self {
        Self {
            rev: 0x0000_0001,
            cores: crate::chip::FPGA_CORES_PER_CHIP as u8,
            bist_busy_polls: 0,
            pll_locks: true,
            in_flight: 0,
            gn: None,
            last_parm: Vec::new(),
        }
    }
}

/// One command as it went over the fake wire
#[derive(Debug, Clone)]
pub struct LoggedCmd {
    pub opcode: u8,
    pub chip_id: u8,
    pub params: Vec<u8>,
}

/// Scripted SPI transport standing in for a chain of BTC08 chips. Responses
/// are written bit-inverted, exactly like the real wire.
pub struct FakeSpi {
    pub chips: Vec<FakeChip>,
    pub log: Vec<LoggedCmd>,
    /// When set, AUTO_ADDRESS echoes a wrong opcode
    pub break_auto_address: bool,
    /// When set, every RUN_JOB immediately latches the golden nonce on all
    /// chips (with the per-chip pipeline offset applied), like a chip
    /// solving the embedded test job instantly
    pub auto_golden: bool,
    /// Latch a wrong nonce instead, for negative self-test scenarios
    pub break_golden_nonce: bool,
}

impl FakeSpi {
    pub fn new(chips: Vec<FakeChip>) -> Self {
        Self {
            chips,
            log: Vec::new(),
            break_auto_address: false,
            auto_golden: false,
            break_golden_nonce: false,
        }
    }

    /// Number of logged commands with the given opcode
    pub fn count_op(&self, opcode: Opcode) -> usize {
        self.log
            .iter()
            .filter(|cmd| cmd.opcode == opcode as u8)
            .count()
    }

    /// Logged commands with the given opcode
    pub fn commands(&self, opcode: Opcode) -> Vec<&LoggedCmd> {
        self.log
            .iter()
            .filter(|cmd| cmd.opcode == opcode as u8)
            .collect()
    }

    fn parm_len(opcode: u8) -> usize {
        match opcode {
            x if x == Opcode::AutoAddress as u8 => command::AUTO_ADDRESS_PARM_LEN,
            x if x == Opcode::WriteParm as u8 => command::WRITE_PARM_LEN,
            x if x == Opcode::WriteTarget as u8 => command::TARGET_LEN,
            x if x == Opcode::WriteNonce as u8 => command::NONCE_LEN * 2,
            x if x == Opcode::SetDisable as u8 => command::DISABLE_LEN,
            x if x == Opcode::RunBist as u8 => command::BIST_HASH_LEN,
            x if x == Opcode::SetControl as u8 => command::CONTROL_LEN,
            x if x == Opcode::SetPllConfig as u8
                || x == Opcode::SetPllFoutEn as u8
                || x == Opcode::SetPllResetB as u8 =>
            {
                command::PLL_VALUE_LEN
            }
            x if x == Opcode::RunJob as u8 => command::JOB_ID_LEN,
            _ => 0,
        }
    }

    fn chip_mut(&mut self, chip_id: u8) -> Option<&mut FakeChip> {
        if chip_id == 0 {
            self.chips.first_mut()
        } else {
            self.chips.get_mut(chip_id as usize - 1)
        }
    }

    fn respond(&mut self, opcode: u8, chip_id: u8, params: &[u8]) -> Vec<u8> {
        if opcode == Opcode::AutoAddress as u8 {
            let echo = if self.break_auto_address {
                0xee
            } else {
                opcode
            };
            return vec![echo, self.chips.len() as u8];
        }
        if opcode == Opcode::ReadId as u8 {
            return match self.chip_mut(chip_id) {
                Some(chip) => vec![0, 0, chip.in_flight & 0x7, chip_id],
                None => vec![0, 0, 0, 0xff],
            };
        }
        if opcode == Opcode::ReadJobId as u8 {
            // broadcast picks the first chip with a latched nonce
            let (idx, chip) = if chip_id == 0 {
                match self
                    .chips
                    .iter()
                    .enumerate()
                    .find(|(_, chip)| chip.gn.is_some())
                {
                    Some((idx, chip)) => (idx, chip),
                    None => return vec![0, 0, 0, 0],
                }
            } else {
                match self.chips.get(chip_id as usize - 1) {
                    Some(chip) => (chip_id as usize - 1, chip),
                    None => return vec![0, 0, 0, 0xff],
                }
            };
            return match &chip.gn {
                // GN latched; OON is reported as well so the self-test's
                // wait-for-idle sees the job finished
                Some(gn) => vec![
                    gn.job_id,
                    gn.job_id,
                    0x03 | (chip.in_flight & 0x7),
                    (idx + 1) as u8,
                ],
                None => vec![0, 0, chip.in_flight & 0x7, (idx + 1) as u8],
            };
        }
        if opcode == Opcode::ReadResult as u8 {
            let mut resp = vec![0u8; command::RET_READ_RESULT_LEN];
            if let Some(chip) = self.chip_mut(chip_id) {
                if let Some(gn) = chip.gn.take() {
                    for (i, nonce) in gn.nonces.iter().enumerate() {
                        resp[i * 4..i * 4 + 4].copy_from_slice(&nonce.to_be_bytes());
                    }
                    resp[17] = gn.micro_job_mask;
                }
            }
            return resp;
        }
        if opcode == Opcode::ReadBist as u8 {
            return match self.chip_mut(chip_id) {
                Some(chip) => {
                    if chip.bist_busy_polls > 0 {
                        chip.bist_busy_polls -= 1;
                        vec![0x01, 0]
                    } else {
                        vec![0x00, chip.cores]
                    }
                }
                None => vec![0x01, 0],
            };
        }
        if opcode == Opcode::ReadPll as u8 {
            return match self.chip_mut(chip_id) {
                Some(chip) => vec![0, if chip.pll_locks { 0x80 } else { 0 }, 0, 0],
                None => vec![0; 4],
            };
        }
        if opcode == Opcode::ReadFeature as u8 {
            return match self.chip_mut(chip_id) {
                Some(chip) => chip.rev.to_be_bytes().to_vec(),
                None => vec![0; 4],
            };
        }
        if opcode == Opcode::ReadRevision as u8 {
            return vec![0x20, 0x05, 0x14, chip_id];
        }
        if opcode == Opcode::ReadParm as u8 {
            return match self.chip_mut(chip_id) {
                Some(chip) => {
                    let mut parm = chip.last_parm.clone();
                    parm.resize(command::WRITE_PARM_LEN, 0);
                    parm
                }
                None => vec![0; command::WRITE_PARM_LEN],
            };
        }
        if opcode == Opcode::ReadHash as u8 {
            return vec![0; command::RET_READ_HASH_LEN];
        }
        if opcode == Opcode::WriteParm as u8 {
            let payload = params.to_vec();
            if chip_id == 0 {
                for chip in self.chips.iter_mut() {
                    chip.last_parm = payload.clone();
                }
            } else if let Some(chip) = self.chip_mut(chip_id) {
                chip.last_parm = payload;
            }
        }
        if opcode == Opcode::RunJob as u8 && self.auto_golden {
            let job_id = params[1];
            let broken = self.break_golden_nonce;
            for chip in self.chips.iter_mut() {
                let depth = chip.rev & 0xff;
                let raw = if broken {
                    0x1234_5678
                } else {
                    crate::command::golden::NONCE_VALUE.wrapping_add(depth * chip.cores as u32)
                };
                chip.gn = Some(GnEvent {
                    job_id,
                    nonces: [raw, 0, 0, 0],
                    micro_job_mask: 0x01,
                });
            }
        }
        Vec::new()
    }

    fn handle(&mut self, tx: &[u8], rx: Option<&mut [u8]>) {
        let opcode = tx[0];
        let chip_id = tx[1];
        let parm_len = Self::parm_len(opcode);
        let params = tx[2..2 + parm_len.min(tx.len() - 2)].to_vec();
        self.log.push(LoggedCmd {
            opcode,
            chip_id,
            params: params.clone(),
        });

        let resp = self.respond(opcode, chip_id, &params);
        if let Some(rx) = rx {
            for byte in rx.iter_mut() {
                *byte = 0xff;
            }
            let resp_off = command::CMD_CHIP_ID_LEN + parm_len;
            for (i, byte) in resp.iter().enumerate() {
                if resp_off + i < rx.len() {
                    // the wire is bit inverted
                    rx[resp_off + i] = byte ^ 0xff;
                }
            }
        }
    }
}

impl Transport for FakeSpi {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> error::Result<()> {
        self.handle(tx, Some(rx));
        Ok(())
    }

    fn transfer_fast(&mut self, tx: &[u8], rx: &mut [u8]) -> error::Result<()> {
        assert_eq!(tx.len() % 4, 0, "fast transfer must be 4-byte aligned");
        self.handle(tx, Some(rx));
        Ok(())
    }

    fn transfer_batch(&mut self, frames: &[Frame]) -> error::Result<()> {
        for frame in frames {
            assert_eq!(frame.tx.len() % 4, 0, "burst frame must be 4-byte aligned");
            self.handle(&frame.tx, None);
        }
        Ok(())
    }
}

/// Active-low input line fake
#[derive(Clone)]
pub struct FakePinIn {
    low: Arc<AtomicBool>,
}

impl FakePinIn {
    pub fn new(low: bool) -> Self {
        Self {
            low: Arc::new(AtomicBool::new(low)),
        }
    }

    /// Assert (true) or deassert the active-low line
    pub fn set_low(&self, low: bool) {
        self.low.store(low, Ordering::SeqCst);
    }
}

impl InputPin for FakePinIn {
    type Error = Infallible;

    fn is_high(&self) -> Result<bool, Self::Error> {
        Ok(!self.low.load(Ordering::SeqCst))
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        Ok(self.low.load(Ordering::SeqCst))
    }
}

/// Output line fake recording every written level
#[derive(Clone)]
pub struct FakePinOut {
    pub levels: Arc<Mutex<Vec<bool>>>,
}

impl FakePinOut {
    pub fn new() -> Self {
        Self {
            levels: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl OutputPin for FakePinOut {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.levels.lock().unwrap().push(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.levels.lock().unwrap().push(true);
        Ok(())
    }
}

/// Everything a scenario test needs: the chain plus handles to its fakes
pub struct TestRig {
    pub chain: HashChain<FakeSpi, FakePinIn, FakePinOut>,
    pub gn: FakePinIn,
    pub oon: FakePinIn,
    pub reset: FakePinOut,
    pub solutions: work::SolutionReceiver,
}

/// Chain settings relaxed for small fake chains
pub fn test_settings() -> ResolvedChainConfig {
    let mut settings =
        config::Backend::default().resolve_chain_config(&CliOptions::default());
    settings.min_chips = 1;
    settings.min_cores = 2;
    settings
}

pub fn test_rig(chips: Vec<FakeChip>) -> TestRig {
    test_rig_with(chips, test_settings(), work::AcceptAll)
}

pub fn test_rig_with(
    chips: Vec<FakeChip>,
    settings: ResolvedChainConfig,
    verifier: impl work::SolutionVerifier,
) -> TestRig {
    let (_job_tx, _generator, solution_tx, solution_rx) = work::solver_pair(verifier);
    let gn = FakePinIn::new(false);
    let oon = FakePinIn::new(false);
    let reset = FakePinOut::new();
    let chain = HashChain::new(
        0,
        FakeSpi::new(chips),
        gn.clone(),
        oon.clone(),
        reset.clone(),
        None,
        settings,
        solution_tx,
    );
    TestRig {
        chain,
        gn,
        oon,
        reset,
        solutions: solution_rx,
    }
}
