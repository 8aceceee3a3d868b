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

//! BTC08 command encoding and response decoding.
//!
//! Every command frame has the layout
//!
//! ```text
//! [ opcode | chip_id | params | zero-fill for response | 2 dummy bytes ]
//! ```
//!
//! padded up to a 32-bit boundary. A broadcast (chip id 0) physically shifts
//! through every chip in the chain and wraps the ACK back to the host, which
//! is why the response space is part of the transmitted frame. The wire is
//! bit inverted: every received byte must be XORed with 0xFF before parsing,
//! and the response payload starts after the echoed opcode/chip-id pair and
//! the command parameters.

use crate::error::{self, ErrorKind};

use packed_struct::prelude::*;
use packed_struct_codegen::PackedStruct;

/// Opcode plus chip id prefix of every frame
pub const CMD_CHIP_ID_LEN: usize = 2;
/// Trailing dummy bytes that keep the SPI clock running for the ACK
pub const DUMMY_BYTES: usize = 2;
/// Broadcast address, interpreted by every chip in the chain
pub const BCAST_CHIP_ID: u8 = 0;

/// WRITE_PARM payload: midstate + 12 data bytes + 3 more midstates
pub const WRITE_PARM_LEN: usize = (256 + 96 + 256 + 256 + 256) / 8;
/// WRITE_TARGET payload: 4 byte compact target + 2 select bytes
pub const TARGET_LEN: usize = 6;
/// One nonce bound; WRITE_NONCE carries two (start and end)
pub const NONCE_LEN: usize = 4;
/// SET_DISABLE payload: 256-bit core disable mask
pub const DISABLE_LEN: usize = 32;
/// RUN_BIST payload: expected hash, 4 x 256 bits for the ASIC-boost cores
pub const BIST_HASH_LEN: usize = 128;
/// RUN_JOB payload: flags byte + job id byte
pub const JOB_ID_LEN: usize = 2;
/// PLL command payload
pub const PLL_VALUE_LEN: usize = 4;
/// SET_CONTROL payload
pub const CONTROL_LEN: usize = 4;
/// AUTO_ADDRESS parameter: 32 zero bytes shifted through the chain
pub const AUTO_ADDRESS_PARM_LEN: usize = 32;

pub const RET_READ_ID_LEN: usize = 4;
pub const RET_AUTO_ADDRESS_LEN: usize = 2;
pub const RET_READ_JOB_ID_LEN: usize = 4;
pub const RET_READ_BIST_LEN: usize = 2;
pub const RET_READ_RESULT_LEN: usize = 18;
pub const RET_READ_PLL_LEN: usize = 4;
pub const RET_READ_FEATURE_LEN: usize = 4;
pub const RET_READ_REVISION_LEN: usize = 4;
pub const RET_READ_HASH_LEN: usize = 128;

/// Four micro-jobs (rolled version variants) per job slot
pub const ASIC_BOOST_CORE_NUM: usize = 4;
/// RUN_JOB flag enabling all four micro-jobs
pub const ASIC_BOOST_EN: u8 = 1 << 1;
/// SET_CONTROL flag arming the OON interrupt line
pub const OON_IRQ_EN: u32 = 1 << 4;

/// Feature register class value of the FPGA emulator
pub const FEATURE_CLASS_FPGA: u8 = 0;
/// Feature register class value of real silicon
pub const FEATURE_CLASS_ASIC: u8 = 5;

/// Command opcodes. The hardware numbers them sequentially; `WritePram` at
/// 0x07 is fixed by the on-chip self-test vectors.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    ReadId = 0x00,
    AutoAddress = 0x01,
    RunBist = 0x02,
    ReadBist = 0x03,
    Reset = 0x04,
    SetPllConfig = 0x05,
    ReadPll = 0x06,
    WriteParm = 0x07,
    ReadParm = 0x08,
    WriteTarget = 0x09,
    ReadTarget = 0x0a,
    RunJob = 0x0b,
    ReadJobId = 0x0c,
    ReadResult = 0x0d,
    ClearOon = 0x0e,
    SetDisable = 0x0f,
    ReadDisable = 0x10,
    SetControl = 0x11,
    Debug = 0x12,
    WriteNonce = 0x13,
    WriteCoreCfg = 0x14,
    ReadDebugCnt = 0x15,
    ReadHash = 0x16,
    WriteIoCtrl = 0x17,
    ReadIoCtrl = 0x18,
    ReadFeature = 0x19,
    ReadRevision = 0x1a,
    SetPllFoutEn = 0x1b,
    SetPllResetB = 0x1c,
    WriteCoreDepth = 0x1d,
    SetTmode = 0x1e,
}

/// Round a frame length up to the 32-bit boundary the chain logic requires
#[inline]
pub const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Undo the wire inversion in place
#[inline]
pub fn invert(buf: &mut [u8]) {
    for byte in buf.iter_mut() {
        *byte ^= 0xff;
    }
}

/// Builds one command frame: opcode, chip id, parameters, response
/// zero-fill, dummy bytes and alignment pad.
pub struct FrameBuilder {
    buf: Vec<u8>,
    parm_len: usize,
    resp_len: usize,
}

impl FrameBuilder {
    pub fn new(opcode: Opcode, chip_id: u8) -> Self {
        Self {
            buf: vec![opcode as u8, chip_id],
            parm_len: 0,
            resp_len: 0,
        }
    }

    /// Append raw parameter bytes
    pub fn param(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self.parm_len += bytes.len();
        self
    }

    /// Append a big-endian 32-bit parameter
    pub fn param_u32(self, value: u32) -> Self {
        self.param(&value.to_be_bytes())
    }

    /// Reserve zero-filled space the chain echoes the response into
    pub fn response(mut self, len: usize) -> Self {
        self.buf.resize(self.buf.len() + len, 0);
        self.resp_len += len;
        self
    }

    /// Byte offset of the response payload within the received buffer
    #[inline]
    pub fn response_offset(&self) -> usize {
        CMD_CHIP_ID_LEN + self.parm_len
    }

    /// Finish the frame: dummy bytes plus pad to a 4-byte multiple
    pub fn build(mut self) -> Vec<u8> {
        let len = align4(self.buf.len() + DUMMY_BYTES);
        self.buf.resize(len, 0);
        self.buf
    }
}

/// View of a received (and already un-inverted) buffer that strips the
/// echoed opcode/chip-id pair and the transmitted parameters.
pub struct FrameView<'a> {
    buf: &'a [u8],
    resp_off: usize,
}

impl<'a> FrameView<'a> {
    pub fn new(buf: &'a [u8], parm_len: usize) -> Self {
        Self {
            buf,
            resp_off: CMD_CHIP_ID_LEN + parm_len,
        }
    }

    /// The response payload
    pub fn response(&self) -> &'a [u8] {
        &self.buf[self.resp_off..]
    }

    /// Response payload clipped to an expected length, failing on short
    /// frames
    pub fn response_exact(&self, len: usize) -> error::Result<&'a [u8]> {
        let resp = self.response();
        if resp.len() < len {
            Err(ErrorKind::Protocol(format!(
                "short response: {} bytes, expected {}",
                resp.len(),
                len
            )))?
        }
        Ok(&resp[..len])
    }
}

/// READ_JOB_ID response word
#[derive(PackedStruct, Debug, Clone, PartialEq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct JobStatusReg {
    /// Job id of the most recent out-of-nonce event
    #[packed_field(bits = "31:24")]
    pub oon_job_id: u8,
    /// Job id holding the latched golden nonce
    #[packed_field(bits = "23:16")]
    pub gn_job_id: u8,
    /// Raw flag byte; GN flag, OON flag and the in-flight job count share
    /// bit positions, see the accessors
    #[packed_field(bits = "15:8")]
    pub flags: u8,
    /// Chip id echo
    #[packed_field(bits = "7:0")]
    pub chip_id: u8,
}

impl JobStatusReg {
    #[inline]
    pub fn gn_irq(&self) -> bool {
        self.flags & (1 << 0) != 0
    }

    #[inline]
    pub fn oon_irq(&self) -> bool {
        self.flags & (1 << 1) != 0
    }

    /// Number of jobs queued inside the chip
    #[inline]
    pub fn in_flight_jobs(&self) -> u8 {
        self.flags & 0x07
    }
}

/// READ_BIST response
#[derive(PackedStruct, Debug, Clone, PartialEq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2", endian = "msb")]
pub struct BistStatusReg {
    /// Self-test still running
    #[packed_field(bits = "8")]
    pub busy: bool,
    /// Number of cores that passed
    #[packed_field(bits = "7:0")]
    pub good_cores: u8,
}

/// READ_PLL response word
#[derive(PackedStruct, Debug, Clone, PartialEq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct PllStatusReg {
    #[packed_field(bits = "23")]
    pub locked: bool,
}

/// READ_FEATURE response word
#[derive(PackedStruct, Debug, Clone, PartialEq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct FeatureReg {
    /// Silicon class, distinguishes the FPGA emulator from the ASIC
    #[packed_field(bits = "11:8")]
    pub feature_class: u8,
    /// Per-core inner loop count, used to back-correct self-test nonces
    #[packed_field(bits = "7:0")]
    pub hash_depth: u8,
}

impl FeatureReg {
    #[inline]
    pub fn is_fpga(&self) -> bool {
        self.feature_class == FEATURE_CLASS_FPGA
    }
}

/// Decoded READ_RESULT response: one nonce per micro-job plus the mask of
/// micro-jobs that actually hit
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub nonces: [u32; ASIC_BOOST_CORE_NUM],
    pub micro_job_mask: u8,
}

impl ReadResult {
    pub fn from_response(resp: &[u8]) -> error::Result<Self> {
        if resp.len() < RET_READ_RESULT_LEN {
            Err(ErrorKind::Protocol(format!(
                "READ_RESULT response too short: {} bytes",
                resp.len()
            )))?
        }
        let mut nonces = [0u32; ASIC_BOOST_CORE_NUM];
        for (i, nonce) in nonces.iter_mut().enumerate() {
            let off = i * 4;
            *nonce = u32::from_be_bytes([resp[off], resp[off + 1], resp[off + 2], resp[off + 3]]);
        }
        Ok(Self {
            nonces,
            micro_job_mask: resp[17] & 0x0f,
        })
    }
}

/// WRITE_TARGET payload for a compact share target: the 4 target bytes are
/// followed by two select bytes the comparator derives its byte lanes from.
pub fn target_payload(nbits: u32) -> [u8; TARGET_LEN] {
    let mut payload = [0u8; TARGET_LEN];
    payload[..4].copy_from_slice(&nbits.to_be_bytes());

    let size = payload[0];
    let select0 = (size / 4).wrapping_sub(1);
    let select1 = (size % 4) + 1;
    let shift = 0u8;
    payload[4] = select0;
    payload[5] = (select1 << 4) | (shift & 0x0f);
    payload
}

/// SET_DISABLE payload keeping `enabled_cores` cores alive. With the full
/// complement requested the mask stays clear; otherwise every core is masked
/// off and the first `enabled_cores` are re-enabled bit by bit from the top
/// of the mask.
pub fn core_disable_mask(enabled_cores: usize, max_cores: usize) -> [u8; DISABLE_LEN] {
    let mut mask = [0u8; DISABLE_LEN];
    if enabled_cores < max_cores {
        for byte in mask.iter_mut() {
            *byte = 0xff;
        }
        mask[DISABLE_LEN - 1] &= !1;
        for i in 1..enabled_cores {
            mask[DISABLE_LEN - 1 - i / 8] &= !(1 << (i % 8));
        }
    }
    mask
}

/// Known-golden self-test vectors. The BIST writes a golden job, target and
/// nonce range into every chip and compares the resulting hashes against
/// `GOLDEN_HASH` to count surviving cores.
pub mod golden {
    /// WRITE_PARM payload: midstate, merkle tail + time + bits, and the
    /// midstate repeated for the remaining three micro-jobs
    pub const PARAM: [u8; super::WRITE_PARM_LEN] = [
        0x5f, 0x4d, 0x60, 0xa2, 0x53, 0x85, 0xc4, 0x07, //
        0xc2, 0xa8, 0x4e, 0x0c, 0x25, 0x91, 0x69, 0xc4, //
        0x10, 0xa4, 0xa5, 0x4b, 0x93, 0xf7, 0x17, 0x08, //
        0xf1, 0xab, 0xdf, 0xec, 0x6e, 0x8b, 0x81, 0xd2, //
        //
        0xf4, 0x2a, 0x1d, 0x6e, 0x5b, 0x30, 0x70, 0x7e, //
        0x17, 0x37, 0x6f, 0x56, //
        //
        0x5f, 0x4d, 0x60, 0xa2, 0x53, 0x85, 0xc4, 0x07, //
        0xc2, 0xa8, 0x4e, 0x0c, 0x25, 0x91, 0x69, 0xc4, //
        0x10, 0xa4, 0xa5, 0x4b, 0x93, 0xf7, 0x17, 0x08, //
        0xf1, 0xab, 0xdf, 0xec, 0x6e, 0x8b, 0x81, 0xd2, //
        //
        0x5f, 0x4d, 0x60, 0xa2, 0x53, 0x85, 0xc4, 0x07, //
        0xc2, 0xa8, 0x4e, 0x0c, 0x25, 0x91, 0x69, 0xc4, //
        0x10, 0xa4, 0xa5, 0x4b, 0x93, 0xf7, 0x17, 0x08, //
        0xf1, 0xab, 0xdf, 0xec, 0x6e, 0x8b, 0x81, 0xd2, //
        //
        0x5f, 0x4d, 0x60, 0xa2, 0x53, 0x85, 0xc4, 0x07, //
        0xc2, 0xa8, 0x4e, 0x0c, 0x25, 0x91, 0x69, 0xc4, //
        0x10, 0xa4, 0xa5, 0x4b, 0x93, 0xf7, 0x17, 0x08, //
        0xf1, 0xab, 0xdf, 0xec, 0x6e, 0x8b, 0x81, 0xd2,
    ];

    /// WRITE_NONCE payload: golden start and end nonce
    pub const NONCE: [u8; super::NONCE_LEN * 2] =
        [0x66, 0xcb, 0x34, 0x26, 0x66, 0xcb, 0x34, 0x26];

    /// RUN_BIST payload: expected hash per micro-job
    pub const HASH: [u8; super::BIST_HASH_LEN] = [
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
        0x00, 0x22, 0x09, 0x3d, 0xd4, 0x38, 0xed, 0x47, //
        0xfa, 0x28, 0xe7, 0x18, 0x58, 0xb8, 0x22, 0x0d, //
        0x53, 0xe5, 0xcd, 0x83, 0xb8, 0xd0, 0xd4, 0x42, //
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
        0x00, 0x22, 0x09, 0x3d, 0xd4, 0x38, 0xed, 0x47, //
        0xfa, 0x28, 0xe7, 0x18, 0x58, 0xb8, 0x22, 0x0d, //
        0x53, 0xe5, 0xcd, 0x83, 0xb8, 0xd0, 0xd4, 0x42, //
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
        0x00, 0x22, 0x09, 0x3d, 0xd4, 0x38, 0xed, 0x47, //
        0xfa, 0x28, 0xe7, 0x18, 0x58, 0xb8, 0x22, 0x0d, //
        0x53, 0xe5, 0xcd, 0x83, 0xb8, 0xd0, 0xd4, 0x42, //
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
        0x00, 0x22, 0x09, 0x3d, 0xd4, 0x38, 0xed, 0x47, //
        0xfa, 0x28, 0xe7, 0x18, 0x58, 0xb8, 0x22, 0x0d, //
        0x53, 0xe5, 0xcd, 0x83, 0xb8, 0xd0, 0xd4, 0x42,
    ];

    /// WRITE_TARGET payload matching the golden job
    pub const TARGET: [u8; super::TARGET_LEN] = [0x17, 0x37, 0x6f, 0x56, 0x05, 0x00];

    /// The nonce the golden job must latch, before hash-depth correction
    pub const NONCE_VALUE: u32 = 0x0d47_3a59;
}
