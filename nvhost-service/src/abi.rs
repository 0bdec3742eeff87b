// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Ioctl numbers and argument layouts.
//!
//! All arguments are packed little-endian words. The ioctl number is the low
//! byte of the command; the upper bits are ignored.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use nvhost_common::{Fence, Handle, HostError, Result, SyncpointId};
use nvhost_core::job::{Gather, Reloc, RelocKind, SubmitFlags, SyncptIncr, Waitchk};

// ── Channel device ──────────────────────────────────────────────────────

/// in `{identifier: u64}`, out `{channel: u32}`
pub const CHANNEL_OPEN: u32 = 1;
/// in `{index: u32}`, out `{id: u32}`
pub const CHANNEL_GET_SYNCPOINT: u32 = 2;
/// in `{name: [u8; 32]}`, out `{id: u32}`
pub const CHANNEL_GET_CLIENT_MANAGED_SYNCPOINT: u32 = 3;
/// in [`SubmitArgs`], out `{count: u32, (id: u32, thresh: u32) * count}`
pub const CHANNEL_SUBMIT: u32 = 4;
/// in `{handle: u32, pad: u32, offset: u64}`
pub const CHANNEL_SET_ERROR_NOTIFIER: u32 = 5;
/// in [`RegRdWrArgs`], out `{values}` for reads
pub const CHANNEL_MODULE_REGRDWR: u32 = 6;
/// in `{timeout_ms: u32}`
pub const CHANNEL_SET_TIMEOUT: u32 = 7;
/// out `{mask: u32}`
pub const CHANNEL_GET_SYNCPOINTS: u32 = 8;
/// in `{id: u32, name: [u8; 32]}`
pub const CHANNEL_SET_SYNCPOINT_NAME: u32 = 9;
/// in `{timeout_ms: u32, flags: u32}`, see [`TIMEOUT_FLAG_DISABLE_DUMP`]
pub const CHANNEL_SET_TIMEOUT_EX: u32 = 10;
/// out `{timed_out: u32}`
pub const CHANNEL_GET_TIMEDOUT: u32 = 11;
/// in `{id: u32}`
pub const CHANNEL_FREE_CLIENT_MANAGED_SYNCPOINT: u32 = 12;
/// out `{mask: u32}`
pub const CHANNEL_GET_WAITBASES: u32 = 13;
/// out `{mask: u32}`
pub const CHANNEL_GET_MODMUTEXES: u32 = 14;
/// in `{index: u32}`, out `{mutex: u32}`
pub const CHANNEL_GET_MODMUTEX: u32 = 15;

/// SET_TIMEOUT_EX flag: skip the syncpoint dump when this client times out.
pub const TIMEOUT_FLAG_DISABLE_DUMP: u32 = 1 << 0;

// ── Ctrl device ─────────────────────────────────────────────────────────

/// in `{id: u32}`, out `{value: u32}`
pub const CTRL_SYNCPT_READ: u32 = 1;
/// in `{id: u32}`
pub const CTRL_SYNCPT_INCR: u32 = 2;
/// in `{id: u32, thresh: u32, timeout_ms: u32}`, out `{value: u32}`
pub const CTRL_SYNCPT_WAIT: u32 = 3;
/// in `{index: u32, lock: u32}`
pub const CTRL_MODULE_MUTEX: u32 = 4;
/// in `{id: u32}`, out `{value: u32}`
pub const CTRL_SYNCPT_READ_MAX: u32 = 5;
/// out `{version: u32}`
pub const CTRL_GET_VERSION: u32 = 6;

pub const CTRL_VERSION: u32 = 1;

/// Fixed width of name arguments, NUL padded.
pub const NAME_LEN: usize = 32;

/// Pre-fence id meaning "no pre-fence".
pub const NO_PRE_FENCE: u32 = u32::MAX;

/// Maximum words moved per register passthrough batch.
pub const REGRDWR_BATCH_WORDS: usize = 64;

pub fn ioctl_nr(cmd: u32) -> u32 {
    cmd & 0xFF
}

// ── Readers and writers ─────────────────────────────────────────────────

pub struct ArgReader<'a> {
    cur: Cursor<&'a [u8]>,
}

impl<'a> ArgReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            cur: Cursor::new(input),
        }
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.cur.read_u32::<LittleEndian>().map_err(|_| truncated())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.cur.read_u64::<LittleEndian>().map_err(|_| truncated())
    }

    /// A `NAME_LEN`-byte NUL-padded string.
    pub fn name(&mut self) -> Result<String> {
        let start = self.cur.position() as usize;
        let bytes = self
            .cur
            .get_ref()
            .get(start..start + NAME_LEN)
            .ok_or_else(truncated)?;
        self.cur.set_position((start + NAME_LEN) as u64);
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        let name = std::str::from_utf8(&bytes[..end])
            .map_err(|_| HostError::invalid("name is not UTF-8"))?;
        if name.is_empty() {
            return Err(HostError::invalid("empty name"));
        }
        Ok(name.to_string())
    }
}

fn truncated() -> HostError {
    HostError::invalid("ioctl argument truncated")
}

pub struct ArgWriter<'a> {
    cur: Cursor<&'a mut [u8]>,
}

impl<'a> ArgWriter<'a> {
    pub fn new(output: &'a mut [u8]) -> Self {
        Self {
            cur: Cursor::new(output),
        }
    }

    pub fn u32(&mut self, value: u32) -> Result<()> {
        self.cur
            .write_u32::<LittleEndian>(value)
            .map_err(|_| HostError::invalid("ioctl output buffer too small"))
    }

    pub fn fences(&mut self, fences: &[Fence]) -> Result<()> {
        self.u32(fences.len() as u32)?;
        for fence in fences {
            self.u32(fence.id)?;
            self.u32(fence.thresh)?;
        }
        Ok(())
    }
}

/// Encode a name argument.
pub fn name_bytes(name: &str) -> [u8; NAME_LEN] {
    let mut out = [0; NAME_LEN];
    let len = name.len().min(NAME_LEN);
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

// ── SUBMIT ──────────────────────────────────────────────────────────────

/// Arguments of [`CHANNEL_SUBMIT`].
///
/// Header `{num_gathers, num_relocs, num_waitchks, num_incrs, timeout_ms,
/// flags}`, then the tables in that order:
///
/// | Table    | Words                                                          |
/// |----------|----------------------------------------------------------------|
/// | gather   | handle, words, offset, class_id, pre_fence_id, pre_fence_thresh |
/// | reloc    | cmdbuf_handle, cmdbuf_offset, target_handle, target_offset, shift, kind |
/// | waitchk  | handle, offset, syncpt_id, thresh                              |
/// | incr     | syncpt_id, incrs                                               |
#[derive(Debug, Clone, Default)]
pub struct SubmitArgs {
    pub timeout_ms: u32,
    pub flags: SubmitFlags,
    pub gathers: Vec<Gather>,
    pub relocs: Vec<Reloc>,
    pub waitchks: Vec<Waitchk>,
    pub incrs: Vec<SyncptIncr>,
}

impl SubmitArgs {
    pub fn parse(input: &[u8]) -> Result<Self> {
        let mut r = ArgReader::new(input);
        let num_gathers = r.u32()?;
        let num_relocs = r.u32()?;
        let num_waitchks = r.u32()?;
        let num_incrs = r.u32()?;
        let timeout_ms = r.u32()?;
        let flags = SubmitFlags::from_bits_truncate(r.u32()?);

        let words = [(num_gathers, 6u64), (num_relocs, 6), (num_waitchks, 4), (num_incrs, 2)]
            .iter()
            .map(|&(n, w)| n as u64 * w)
            .sum::<u64>();
        if words * 4 > input.len() as u64 {
            return Err(truncated());
        }

        let mut gathers = Vec::with_capacity(num_gathers as usize);
        for _ in 0..num_gathers {
            let handle: Handle = r.u32()?;
            let words = r.u32()?;
            let offset = r.u32()? as u64;
            let class_id = r.u32()?;
            let fence_id = r.u32()?;
            let fence_thresh = r.u32()?;
            let mut gather = Gather::new(handle, words, offset);
            gather.class_id = class_id;
            if fence_id != NO_PRE_FENCE {
                gather.pre_fence = Some(Fence::new(fence_id, fence_thresh));
            }
            gathers.push(gather);
        }

        let mut relocs = Vec::with_capacity(num_relocs as usize);
        for _ in 0..num_relocs {
            relocs.push(Reloc {
                cmdbuf_handle: r.u32()?,
                cmdbuf_offset: r.u32()? as u64,
                target_handle: r.u32()?,
                target_offset: r.u32()? as u64,
                shift: r.u32()?,
                kind: match r.u32()? {
                    0 => RelocKind::Default,
                    1 => RelocKind::PitchLinear,
                    2 => RelocKind::BlockLinear,
                    other => return Err(HostError::invalid(format!("relocation kind {other}"))),
                },
            });
        }

        let mut waitchks = Vec::with_capacity(num_waitchks as usize);
        for _ in 0..num_waitchks {
            waitchks.push(Waitchk {
                handle: r.u32()?,
                offset: r.u32()? as u64,
                syncpt_id: r.u32()?,
                thresh: r.u32()?,
            });
        }

        let mut incrs = Vec::with_capacity(num_incrs as usize);
        for _ in 0..num_incrs {
            incrs.push(SyncptIncr {
                syncpt_id: r.u32()?,
                incrs: r.u32()?,
            });
        }

        Ok(Self {
            timeout_ms,
            flags,
            gathers,
            relocs,
            waitchks,
            incrs,
        })
    }

    /// Serialize for a caller; the inverse of [`parse`](Self::parse).
    ///
    /// Fails if an offset does not fit the 32-bit wire field.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut put = |v: u32| out.extend_from_slice(&v.to_le_bytes());
        put(self.gathers.len() as u32);
        put(self.relocs.len() as u32);
        put(self.waitchks.len() as u32);
        put(self.incrs.len() as u32);
        put(self.timeout_ms);
        put(self.flags.bits());
        for g in &self.gathers {
            let (fence_id, fence_thresh) = g.pre_fence.map_or((NO_PRE_FENCE, 0), |f| (f.id, f.thresh));
            for v in [g.handle, g.words, wire_offset(g.offset)?, g.class_id, fence_id, fence_thresh] {
                put(v);
            }
        }
        for r in &self.relocs {
            let kind = match r.kind {
                RelocKind::Default => 0,
                RelocKind::PitchLinear => 1,
                RelocKind::BlockLinear => 2,
            };
            for v in [
                r.cmdbuf_handle,
                wire_offset(r.cmdbuf_offset)?,
                r.target_handle,
                wire_offset(r.target_offset)?,
                r.shift,
                kind,
            ] {
                put(v);
            }
        }
        for w in &self.waitchks {
            for v in [w.handle, wire_offset(w.offset)?, w.syncpt_id, w.thresh] {
                put(v);
            }
        }
        for i in &self.incrs {
            put(i.syncpt_id);
            put(i.incrs);
        }
        Ok(out)
    }
}

fn wire_offset(offset: u64) -> Result<u32> {
    u32::try_from(offset).map_err(|_| HostError::invalid(format!("offset 0x{offset:X} beyond 32 bits")))
}

// ── MODULE_REGRDWR ──────────────────────────────────────────────────────

/// Arguments of [`CHANNEL_MODULE_REGRDWR`]:
/// `{num_offsets, block_size, write, offsets[num_offsets], values...}`.
///
/// Each offset addresses a block of `block_size` bytes; `values` holds
/// `num_offsets * block_size / 4` words for writes and is absent for reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegRdWrArgs {
    pub block_size: u32,
    pub write: bool,
    pub offsets: Vec<u32>,
    pub values: Vec<u32>,
}

impl RegRdWrArgs {
    pub fn parse(input: &[u8]) -> Result<Self> {
        let mut r = ArgReader::new(input);
        let num_offsets = r.u32()?;
        let block_size = r.u32()?;
        let write = r.u32()? != 0;
        if num_offsets == 0 {
            return Err(HostError::invalid("register access without offsets"));
        }
        if block_size == 0 || block_size % 4 != 0 {
            return Err(HostError::invalid(format!("register block size {block_size}")));
        }
        let total_words = (num_offsets as u64) * (block_size as u64 / 4);
        let needed = 12 + num_offsets as u64 * 4 + if write { total_words * 4 } else { 0 };
        if needed > input.len() as u64 {
            return Err(truncated());
        }
        let offsets = (0..num_offsets).map(|_| r.u32()).collect::<Result<Vec<_>>>()?;
        let values = if write {
            (0..total_words).map(|_| r.u32()).collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        Ok(Self {
            block_size,
            write,
            offsets,
            values,
        })
    }

    pub fn words_per_block(&self) -> usize {
        self.block_size as usize / 4
    }
}

/// `(id, thresh)` pairs from a SUBMIT reply.
pub fn parse_fences(output: &[u8]) -> Result<Vec<(SyncpointId, u32)>> {
    let mut r = ArgReader::new(output);
    let count = r.u32()?;
    (0..count)
        .map(|_| -> Result<(SyncpointId, u32)> { Ok((r.u32()?, r.u32()?)) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_layout() {
        let mut gather = Gather::new(3, 4, 8);
        gather.class_id = 0x30;
        gather.pre_fence = Some(Fence::new(5, 9));
        let args = SubmitArgs {
            timeout_ms: 100,
            flags: SubmitFlags::SYNC_FENCE_FD,
            gathers: vec![gather, Gather::new(4, 2, 0)],
            relocs: vec![Reloc {
                cmdbuf_handle: 3,
                cmdbuf_offset: 4,
                target_handle: 4,
                target_offset: 0x10,
                shift: 8,
                kind: RelocKind::BlockLinear,
            }],
            waitchks: vec![],
            incrs: vec![SyncptIncr { syncpt_id: 2, incrs: 1 }],
        };
        let bytes = args.to_bytes().unwrap();
        assert_eq!(bytes.len(), 4 * (6 + 12 + 6 + 2));

        let parsed = SubmitArgs::parse(&bytes).unwrap();
        assert_eq!(parsed.gathers[0].pre_fence, Some(Fence::new(5, 9)));
        assert_eq!(parsed.gathers[1].pre_fence, None);
        assert_eq!(parsed.relocs[0].kind, RelocKind::BlockLinear);
        assert!(parsed.flags.contains(SubmitFlags::SYNC_FENCE_FD));
    }

    #[test]
    fn test_submit_rejects_short_input() {
        let mut bytes = SubmitArgs {
            incrs: vec![SyncptIncr { syncpt_id: 1, incrs: 1 }],
            ..Default::default()
        }
        .to_bytes()
        .unwrap();
        bytes.truncate(bytes.len() - 4);
        assert!(SubmitArgs::parse(&bytes).is_err());

        // Table counts far beyond the buffer are rejected before allocating.
        let mut huge = vec![0u8; 24];
        huge[0..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(SubmitArgs::parse(&huge).is_err());
    }

    #[test]
    fn test_submit_offsets_must_fit_wire() {
        let args = SubmitArgs {
            gathers: vec![Gather::new(1, 2, 1 << 32)],
            incrs: vec![SyncptIncr { syncpt_id: 1, incrs: 1 }],
            ..Default::default()
        };
        assert!(args.to_bytes().is_err());

        let args = SubmitArgs {
            waitchks: vec![Waitchk {
                handle: 1,
                offset: u32::MAX as u64,
                syncpt_id: 1,
                thresh: 1,
            }],
            ..Default::default()
        };
        let parsed = SubmitArgs::parse(&args.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.waitchks[0].offset, u32::MAX as u64);
    }

    #[test]
    fn test_regrdwr_validation() {
        let words = |v: &[u32]| v.iter().flat_map(|w| w.to_le_bytes()).collect::<Vec<u8>>();
        let write = RegRdWrArgs::parse(&words(&[2, 8, 1, 0x0, 0x10, 1, 2, 3, 4])).unwrap();
        assert_eq!(write.offsets, vec![0, 0x10]);
        assert_eq!(write.values, vec![1, 2, 3, 4]);
        assert_eq!(write.words_per_block(), 2);

        assert!(RegRdWrArgs::parse(&words(&[0, 4, 0])).is_err());
        assert!(RegRdWrArgs::parse(&words(&[1, 6, 0, 0])).is_err());
        assert!(RegRdWrArgs::parse(&words(&[1, 4, 1, 0])).is_err());
    }

    #[test]
    fn test_name_argument() {
        let bytes = name_bytes("vblank");
        assert_eq!(ArgReader::new(&bytes).name().unwrap(), "vblank");
        assert!(ArgReader::new(&[0u8; NAME_LEN]).name().is_err());
        assert!(ArgReader::new(&[b'a'; 8]).name().is_err());
    }
}
