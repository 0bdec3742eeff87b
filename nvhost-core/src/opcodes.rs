// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host1x channel opcodes.
//!
//! Every word fetched by a channel is either an opcode or a data word that
//! belongs to the preceding opcode.
//!
//! ## Opcode Word (32 bits)
//!
//! | Opcode (31:28) | 27:16        | 15:0                                  |
//! |----------------|--------------|---------------------------------------|
//! | 0 SETCLASS     | Offset       | Class (15:6), mask (5:0)              |
//! | 1 INCR         | Offset       | Count                                 |
//! | 2 NONINCR      | Offset       | Count                                 |
//! | 3 MASK         | Offset       | Mask                                  |
//! | 4 IMM          | Offset       | Immediate data                        |
//! | 5 RESTART      | Address >> 4 (27:0)                                 |
//! | 6 GATHER       | Offset       | Insert (15), incr (14), count (13:0)  |
//!
//! A GATHER opcode is followed by one word holding the device address of the
//! command buffer to fetch.
//!
//! ## Host Class Registers
//!
//! | Offset | Register     | Payload                              |
//! |--------|--------------|--------------------------------------|
//! | 0x00   | INCR_SYNCPT  | Condition (15:8), syncpoint id (7:0) |
//! | 0x08   | WAIT_SYNCPT  | Syncpoint id (31:24), thresh (23:0)  |

use nvhost_common::SyncpointId;

/// Register that increments a syncpoint. Every class exposes it at offset 0.
pub const INCR_SYNCPT: u32 = 0x00;

/// Host class register that stalls the channel until a syncpoint threshold.
pub const WAIT_SYNCPT: u32 = 0x08;

/// Width of the threshold field in a WAIT_SYNCPT payload.
pub const WAIT_THRESH_MASK: u32 = 0x00FF_FFFF;

/// Condition attached to a syncpoint increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyncptCond {
    Immediate = 0,
    OpDone = 1,
    RdDone = 2,
    RegWrSafe = 3,
}

/// A decoded opcode word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    SetClass { offset: u32, class_id: u32, mask: u32 },
    Incr { offset: u32, count: u32 },
    NonIncr { offset: u32, count: u32 },
    Mask { offset: u32, mask: u32 },
    Imm { offset: u32, value: u32 },
    Restart { address: u32 },
    Gather { offset: u32, insert: bool, incr: bool, count: u32 },
    Unknown(u32),
}

impl Opcode {
    pub fn decode(word: u32) -> Self {
        let offset = (word >> 16) & 0xFFF;
        match word >> 28 {
            0 => Self::SetClass {
                offset,
                class_id: (word >> 6) & 0x3FF,
                mask: word & 0x3F,
            },
            1 => Self::Incr {
                offset,
                count: word & 0xFFFF,
            },
            2 => Self::NonIncr {
                offset,
                count: word & 0xFFFF,
            },
            3 => Self::Mask {
                offset,
                mask: word & 0xFFFF,
            },
            4 => Self::Imm {
                offset,
                value: word & 0xFFFF,
            },
            5 => Self::Restart {
                address: (word & 0x0FFF_FFFF) << 4,
            },
            6 => Self::Gather {
                offset,
                insert: word & (1 << 15) != 0,
                incr: word & (1 << 14) != 0,
                count: word & 0x3FFF,
            },
            _ => Self::Unknown(word),
        }
    }

    /// Number of data words that follow this opcode in the stream.
    pub fn data_words(&self) -> usize {
        match *self {
            Self::SetClass { mask, .. } => mask.count_ones() as usize,
            Self::Incr { count, .. } | Self::NonIncr { count, .. } => count as usize,
            Self::Mask { mask, .. } => mask.count_ones() as usize,
            Self::Gather { .. } => 1,
            Self::Imm { .. } | Self::Restart { .. } | Self::Unknown(_) => 0,
        }
    }
}

#[inline]
pub const fn setclass(class_id: u32, offset: u32, mask: u32) -> u32 {
    ((offset & 0xFFF) << 16) | ((class_id & 0x3FF) << 6) | (mask & 0x3F)
}

#[inline]
pub const fn incr(offset: u32, count: u32) -> u32 {
    (1 << 28) | ((offset & 0xFFF) << 16) | (count & 0xFFFF)
}

#[inline]
pub const fn nonincr(offset: u32, count: u32) -> u32 {
    (2 << 28) | ((offset & 0xFFF) << 16) | (count & 0xFFFF)
}

#[inline]
pub const fn mask(offset: u32, mask: u32) -> u32 {
    (3 << 28) | ((offset & 0xFFF) << 16) | (mask & 0xFFFF)
}

#[inline]
pub const fn imm(offset: u32, value: u32) -> u32 {
    (4 << 28) | ((offset & 0xFFF) << 16) | (value & 0xFFFF)
}

#[inline]
pub const fn restart(address: u32) -> u32 {
    (5 << 28) | ((address >> 4) & 0x0FFF_FFFF)
}

#[inline]
pub const fn gather(count: u32) -> u32 {
    (6 << 28) | (count & 0x3FFF)
}

/// Gather whose words are data for `offset`, incrementing or not.
#[inline]
pub const fn gather_insert(offset: u32, incr: bool, count: u32) -> u32 {
    (6 << 28) | ((offset & 0xFFF) << 16) | (1 << 15) | ((incr as u32) << 14) | (count & 0x3FFF)
}

/// Zero-length NONINCR, used to pad slots.
#[inline]
pub const fn nop() -> u32 {
    nonincr(0, 0)
}

#[inline]
pub const fn incr_syncpt_payload(cond: SyncptCond, id: SyncpointId) -> u32 {
    ((cond as u32) << 8) | (id & 0xFF)
}

#[inline]
pub const fn wait_syncpt_payload(id: SyncpointId, thresh: u32) -> u32 {
    ((id & 0xFF) << 24) | (thresh & WAIT_THRESH_MASK)
}

/// Split a WAIT_SYNCPT payload into (id, 24-bit threshold).
#[inline]
pub const fn decode_wait_syncpt(payload: u32) -> (SyncpointId, u32) {
    (payload >> 24, payload & WAIT_THRESH_MASK)
}

/// Split an INCR_SYNCPT payload into (condition bits, id).
#[inline]
pub const fn decode_incr_syncpt(payload: u32) -> (u32, SyncpointId) {
    ((payload >> 8) & 0xFF, payload & 0xFF)
}
