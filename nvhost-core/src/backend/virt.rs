// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Virtual backend: hardware access forwarded to a remote authority.
//!
//! Every operation becomes one request message and waits for exactly one
//! response. Messages are little-endian:
//!
//! | Field   | Type  | Description                        |
//! |---------|-------|------------------------------------|
//! | cmd     | u32   | [`VirtCmd`]                        |
//! | len     | u32   | Payload length in bytes            |
//! | payload | [u32] | Command arguments                  |
//!
//! Responses carry `status: i32` (0 or `-errno`), `count: u32` and `count`
//! result words. A submission larger than the message size is split into
//! several kick requests; only the last one carries the job fences.
//!
//! There are no interrupts over this transport, so waits poll.

use std::io::Cursor;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;

use nvhost_common::error::Errno;
use nvhost_common::{ChannelId, Fence, HostError, Result, SyncpointId};

use super::{CdmaBackend, ChannelBackend, Kick, SyncpointBackend};
use crate::hardware::Host1xHardware;

/// Request header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Smallest usable message size: header plus a kick with one fence and one word.
pub const MIN_MESSAGE_SIZE: usize = HEADER_SIZE + 4 * 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VirtCmd {
    SyncptRead = 1,
    SyncptWrite = 2,
    SyncptCpuIncr = 3,
    MutexTryLock = 4,
    MutexUnlock = 5,
    ChannelInit = 6,
    ChannelDeinit = 7,
    CdmaStart = 8,
    CdmaStop = 9,
    CdmaKick = 10,
    CdmaTeardown = 11,
    ModuleRegRead = 12,
    ModuleRegWrite = 13,
}

impl VirtCmd {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::SyncptRead,
            2 => Self::SyncptWrite,
            3 => Self::SyncptCpuIncr,
            4 => Self::MutexTryLock,
            5 => Self::MutexUnlock,
            6 => Self::ChannelInit,
            7 => Self::ChannelDeinit,
            8 => Self::CdmaStart,
            9 => Self::CdmaStop,
            10 => Self::CdmaKick,
            11 => Self::CdmaTeardown,
            12 => Self::ModuleRegRead,
            13 => Self::ModuleRegWrite,
            _ => return None,
        })
    }
}

// ── Message codec ───────────────────────────────────────────────────────

pub fn encode_request(cmd: VirtCmd, args: &[u32]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HEADER_SIZE + args.len() * 4);
    let _ = msg.write_u32::<LittleEndian>(cmd as u32);
    let _ = msg.write_u32::<LittleEndian>((args.len() * 4) as u32);
    for &arg in args {
        let _ = msg.write_u32::<LittleEndian>(arg);
    }
    msg
}

/// Split a request into its command and argument words.
pub fn decode_request(msg: &[u8]) -> Result<(VirtCmd, Vec<u32>)> {
    let mut cur = Cursor::new(msg);
    let raw_cmd = cur.read_u32::<LittleEndian>().map_err(truncated)?;
    let len = cur.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let cmd = VirtCmd::from_u32(raw_cmd)
        .ok_or_else(|| HostError::invalid(format!("unknown virt command {raw_cmd}")))?;
    if len % 4 != 0 || HEADER_SIZE + len != msg.len() {
        return Err(HostError::invalid(format!(
            "virt payload length {} does not match message of {} bytes",
            len,
            msg.len()
        )));
    }
    let args = read_words(&mut cur, len / 4)?;
    Ok((cmd, args))
}

pub fn encode_response(result: &Result<Vec<u32>>) -> Vec<u8> {
    let mut msg = Vec::new();
    match result {
        Ok(values) => {
            let _ = msg.write_i32::<LittleEndian>(0);
            let _ = msg.write_u32::<LittleEndian>(values.len() as u32);
            for &v in values {
                let _ = msg.write_u32::<LittleEndian>(v);
            }
        }
        Err(e) => {
            let _ = msg.write_i32::<LittleEndian>(e.errno().as_return());
            let _ = msg.write_u32::<LittleEndian>(0);
        }
    }
    msg
}

/// Parse a response. Malformed responses are hardware faults.
pub fn decode_response(msg: &[u8]) -> Result<Vec<u32>> {
    let mut cur = Cursor::new(msg);
    let status = cur.read_i32::<LittleEndian>().map_err(malformed)?;
    let count = cur.read_u32::<LittleEndian>().map_err(malformed)? as usize;
    if status != 0 {
        return Err(HostError::from_errno(Errno::from_return(status), "remote request"));
    }
    if 8 + count * 4 != msg.len() {
        return Err(HostError::fault(format!(
            "virt response claims {} values in {} bytes",
            count,
            msg.len()
        )));
    }
    (0..count)
        .map(|_| cur.read_u32::<LittleEndian>().map_err(malformed))
        .collect()
}

fn read_words(cur: &mut Cursor<&[u8]>, count: usize) -> Result<Vec<u32>> {
    (0..count)
        .map(|_| cur.read_u32::<LittleEndian>().map_err(truncated))
        .collect()
}

fn truncated(e: std::io::Error) -> HostError {
    HostError::invalid(format!("truncated virt request: {e}"))
}

fn malformed(e: std::io::Error) -> HostError {
    HostError::fault(format!("malformed virt response: {e}"))
}

/// Encode a kick as one or more requests of at most `message_size` bytes.
///
/// Layout per fragment: `channel, put, fence_count, (id, thresh)*,
/// word_count, words*`.
pub fn encode_kick(channel: ChannelId, kick: &Kick, message_size: usize) -> Result<Vec<Vec<u8>>> {
    let message_size = message_size.max(MIN_MESSAGE_SIZE);
    let fence_words = kick.fences.len() * 2;
    // channel, put, fence_count, word_count
    let fixed = 4;
    let budget = (message_size - HEADER_SIZE) / 4;
    if fixed + fence_words >= budget {
        return Err(HostError::invalid(format!(
            "{} fences do not fit a {} byte message",
            kick.fences.len(),
            message_size
        )));
    }

    let per_fragment = budget - fixed;
    let last_capacity = budget - fixed - fence_words;
    let mut fragments = Vec::new();
    let mut rest: &[u32] = &kick.words;
    loop {
        let is_last = rest.len() <= last_capacity;
        let take = if is_last { rest.len() } else { rest.len().min(per_fragment) };
        let (chunk, tail) = rest.split_at(take);

        let mut args = Vec::with_capacity(fixed + fence_words + chunk.len());
        args.push(channel);
        args.push(kick.put);
        if is_last {
            args.push(kick.fences.len() as u32);
            for fence in &kick.fences {
                args.push(fence.id);
                args.push(fence.thresh);
            }
        } else {
            args.push(0);
        }
        args.push(chunk.len() as u32);
        args.extend_from_slice(chunk);
        fragments.push(encode_request(VirtCmd::CdmaKick, &args));

        rest = tail;
        if is_last {
            break;
        }
    }
    Ok(fragments)
}

/// Inverse of [`encode_kick`] for one fragment.
pub fn decode_kick(args: &[u32]) -> Result<(ChannelId, Kick)> {
    let bad = || HostError::invalid("short kick request");
    let mut it = args.iter().copied();
    let channel = it.next().ok_or_else(bad)?;
    let put = it.next().ok_or_else(bad)?;
    let fence_count = it.next().ok_or_else(bad)? as usize;
    let mut fences = Vec::with_capacity(fence_count.min(args.len()));
    for _ in 0..fence_count {
        let id = it.next().ok_or_else(bad)?;
        let thresh = it.next().ok_or_else(bad)?;
        fences.push(Fence::new(id, thresh));
    }
    let word_count = it.next().ok_or_else(bad)? as usize;
    let words: Vec<u32> = it.collect();
    if words.len() != word_count {
        return Err(HostError::invalid(format!(
            "kick declares {} words, carries {}",
            word_count,
            words.len()
        )));
    }
    Ok((channel, Kick { put, words, fences }))
}

// ── Transport ───────────────────────────────────────────────────────────

/// Request/response channel to the remote authority.
pub trait Transport: Send + Sync {
    fn request(&self, msg: Vec<u8>) -> Result<Vec<u8>>;
}

/// In-process transport over a pair of mpsc channels.
pub struct ChannelTransport {
    link: Mutex<(Sender<Vec<u8>>, Receiver<Vec<u8>>)>,
}

impl Transport for ChannelTransport {
    fn request(&self, msg: Vec<u8>) -> Result<Vec<u8>> {
        // One request in flight at a time keeps responses paired.
        let link = self.link.lock();
        link.0
            .send(msg)
            .map_err(|_| HostError::fault("virt transport closed"))?;
        link.1
            .recv()
            .map_err(|_| HostError::fault("virt transport closed before response"))
    }
}

/// Serves requests against a [`Host1xHardware`] on its own thread.
pub struct RemoteExecutor {
    hw: Arc<Host1xHardware>,
}

impl RemoteExecutor {
    /// Start the executor thread. It exits when the transport is dropped.
    pub fn spawn(hw: Arc<Host1xHardware>) -> Result<(ChannelTransport, JoinHandle<()>)> {
        let (req_tx, req_rx) = mpsc::channel::<Vec<u8>>();
        let (resp_tx, resp_rx) = mpsc::channel::<Vec<u8>>();
        let executor = Self { hw };
        let handle = thread::Builder::new()
            .name("nvhost-virt".into())
            .spawn(move || executor.run(req_rx, resp_tx))
            .map_err(|e| HostError::fault(format!("failed to spawn virt executor: {e}")))?;
        let transport = ChannelTransport {
            link: Mutex::new((req_tx, resp_rx)),
        };
        Ok((transport, handle))
    }

    fn run(self, requests: Receiver<Vec<u8>>, responses: Sender<Vec<u8>>) {
        log::debug!("virt: executor running");
        for msg in requests {
            let result = decode_request(&msg).and_then(|(cmd, args)| self.dispatch(cmd, &args));
            if let Err(e) = &result {
                log::debug!("virt: request failed: {}", e);
            }
            if responses.send(encode_response(&result)).is_err() {
                break;
            }
        }
        log::debug!("virt: executor stopped");
    }

    fn dispatch(&self, cmd: VirtCmd, args: &[u32]) -> Result<Vec<u32>> {
        let arg = |i: usize| {
            args.get(i)
                .copied()
                .ok_or_else(|| HostError::invalid(format!("{cmd:?} missing argument {i}")))
        };
        let hw = &self.hw;
        match cmd {
            VirtCmd::SyncptRead => Ok(vec![hw.syncpt_read(arg(0)?)?]),
            VirtCmd::SyncptWrite => hw.syncpt_write(arg(0)?, arg(1)?).map(|_| vec![]),
            VirtCmd::SyncptCpuIncr => hw.syncpt_cpu_incr(arg(0)?).map(|_| vec![]),
            VirtCmd::MutexTryLock => Ok(vec![hw.mutex_try_lock(arg(0)?)? as u32]),
            VirtCmd::MutexUnlock => hw.mutex_unlock(arg(0)?).map(|_| vec![]),
            VirtCmd::ChannelInit => hw.channel_init(arg(0)?, arg(1)?).map(|_| vec![]),
            VirtCmd::ChannelDeinit => hw.channel_deinit(arg(0)?).map(|_| vec![]),
            VirtCmd::CdmaStart => hw.channel_start(arg(0)?).map(|_| vec![]),
            VirtCmd::CdmaStop => hw.channel_stop(arg(0)?).map(|_| vec![]),
            VirtCmd::CdmaKick => {
                let (channel, kick) = decode_kick(args)?;
                hw.channel_submit(channel, kick.put, &kick.words).map(|_| vec![])
            }
            VirtCmd::CdmaTeardown => hw.channel_teardown(arg(0)?).map(|_| vec![]),
            VirtCmd::ModuleRegRead => hw.read_module_regs(arg(0)?, arg(1)?),
            VirtCmd::ModuleRegWrite => {
                let offset = arg(0)?;
                hw.write_module_regs(offset, &args[1..]).map(|_| vec![])
            }
        }
    }
}

// ── Backend ─────────────────────────────────────────────────────────────

pub struct VirtualBackend {
    transport: Box<dyn Transport>,
    message_size: usize,
}

impl VirtualBackend {
    pub fn new(transport: Box<dyn Transport>, message_size: usize) -> Self {
        Self {
            transport,
            message_size: message_size.max(MIN_MESSAGE_SIZE),
        }
    }

    fn call(&self, cmd: VirtCmd, args: &[u32]) -> Result<Vec<u32>> {
        let msg = encode_request(cmd, args);
        if msg.len() > self.message_size {
            return Err(HostError::invalid(format!(
                "{:?} request of {} bytes exceeds message size {}",
                cmd,
                msg.len(),
                self.message_size
            )));
        }
        let response = self.transport.request(msg)?;
        decode_response(&response)
    }

    fn call_unit(&self, cmd: VirtCmd, args: &[u32]) -> Result<()> {
        self.call(cmd, args).map(|_| ())
    }

    fn call_value(&self, cmd: VirtCmd, args: &[u32]) -> Result<u32> {
        let values = self.call(cmd, args)?;
        match values.as_slice() {
            [value] => Ok(*value),
            _ => Err(HostError::fault(format!(
                "{:?} returned {} values, expected 1",
                cmd,
                values.len()
            ))),
        }
    }
}

impl SyncpointBackend for VirtualBackend {
    fn read(&self, id: SyncpointId) -> Result<u32> {
        self.call_value(VirtCmd::SyncptRead, &[id])
    }

    fn write(&self, id: SyncpointId, value: u32) -> Result<()> {
        self.call_unit(VirtCmd::SyncptWrite, &[id, value])
    }

    fn cpu_incr(&self, id: SyncpointId) -> Result<()> {
        self.call_unit(VirtCmd::SyncptCpuIncr, &[id])
    }

    fn mutex_try_lock(&self, index: u32) -> Result<bool> {
        Ok(self.call_value(VirtCmd::MutexTryLock, &[index])? != 0)
    }

    fn mutex_unlock(&self, index: u32) -> Result<()> {
        self.call_unit(VirtCmd::MutexUnlock, &[index])
    }
}

impl CdmaBackend for VirtualBackend {
    fn start(&self, channel: ChannelId) -> Result<()> {
        self.call_unit(VirtCmd::CdmaStart, &[channel])
    }

    fn stop(&self, channel: ChannelId) -> Result<()> {
        self.call_unit(VirtCmd::CdmaStop, &[channel])
    }

    fn kick(&self, channel: ChannelId, kick: &Kick) -> Result<()> {
        let fragments = encode_kick(channel, kick, self.message_size)?;
        if fragments.len() > 1 {
            log::debug!(
                "virt: channel {} kick of {} words split into {} messages",
                channel,
                kick.words.len(),
                fragments.len()
            );
        }
        for msg in fragments {
            decode_response(&self.transport.request(msg)?)?;
        }
        Ok(())
    }

    fn teardown(&self, channel: ChannelId) -> Result<()> {
        self.call_unit(VirtCmd::CdmaTeardown, &[channel])
    }
}

impl ChannelBackend for VirtualBackend {
    fn init(&self, channel: ChannelId, class_id: u32) -> Result<()> {
        self.call_unit(VirtCmd::ChannelInit, &[channel, class_id])
    }

    fn deinit(&self, channel: ChannelId) -> Result<()> {
        self.call_unit(VirtCmd::ChannelDeinit, &[channel])
    }

    fn read_module_regs(&self, offset: u32, count: u32) -> Result<Vec<u32>> {
        let values = self.call(VirtCmd::ModuleRegRead, &[offset, count])?;
        if values.len() != count as usize {
            return Err(HostError::fault(format!(
                "register read of {} returned {} values",
                count,
                values.len()
            )));
        }
        Ok(values)
    }

    fn write_module_regs(&self, offset: u32, values: &[u32]) -> Result<()> {
        let mut args = Vec::with_capacity(values.len() + 1);
        args.push(offset);
        args.extend_from_slice(values);
        self.call_unit(VirtCmd::ModuleRegWrite, &args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdma::{Cdma, CdmaConfig};
    use crate::intr::Intr;
    use crate::job::{Job, TimeoutContext};
    use crate::memory::BufferRegistry;
    use crate::opcodes::{self, SyncptCond};
    use crate::syncpoint::{SyncpointKind, SyncpointManager};
    use nvhost_common::settings::{HostSettings, TeardownPolicy};
    use std::time::Duration;

    fn remote() -> (Arc<Host1xHardware>, VirtualBackend, JoinHandle<()>) {
        let hw = Arc::new(Host1xHardware::new(8, 2, 2, 16, Arc::new(BufferRegistry::new())));
        let (transport, handle) = RemoteExecutor::spawn(hw.clone()).unwrap();
        (hw, VirtualBackend::new(Box::new(transport), 64), handle)
    }

    #[test]
    fn test_request_header() {
        let msg = encode_request(VirtCmd::SyncptWrite, &[3, 0x1234]);
        assert_eq!(&msg[..8], &[2, 0, 0, 0, 8, 0, 0, 0]);
        assert_eq!(decode_request(&msg).unwrap(), (VirtCmd::SyncptWrite, vec![3, 0x1234]));
    }

    #[test]
    fn test_decode_request_rejects_bad_length() {
        let mut msg = encode_request(VirtCmd::SyncptRead, &[1]);
        msg.push(0);
        assert!(decode_request(&msg).is_err());
        assert!(decode_request(&[1, 0, 0]).is_err());
        assert!(decode_request(&encode_request_raw(99)).is_err());
    }

    fn encode_request_raw(cmd: u32) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.write_u32::<LittleEndian>(cmd).unwrap();
        msg.write_u32::<LittleEndian>(0).unwrap();
        msg
    }

    #[test]
    fn test_error_response_maps_errno() {
        let msg = encode_response(&Err(HostError::Busy));
        assert_eq!(decode_response(&msg), Err(HostError::Busy));
    }

    #[test]
    fn test_malformed_response_is_fault() {
        assert!(matches!(decode_response(&[0, 0]), Err(HostError::HardwareFault(_))));
        let mut msg = encode_response(&Ok(vec![1, 2]));
        msg.truncate(msg.len() - 2);
        assert!(matches!(decode_response(&msg), Err(HostError::HardwareFault(_))));
    }

    #[test]
    fn test_kick_split_keeps_fences_on_last() {
        let kick = Kick {
            put: 7,
            words: (0..40).collect(),
            fences: vec![Fence::new(3, 10), Fence::new(4, 2)],
        };
        let fragments = encode_kick(1, &kick, 64).unwrap();
        assert!(fragments.len() > 1);
        let mut words = Vec::new();
        for (i, msg) in fragments.iter().enumerate() {
            assert!(msg.len() <= 64);
            let (cmd, args) = decode_request(msg).unwrap();
            assert_eq!(cmd, VirtCmd::CdmaKick);
            let (channel, part) = decode_kick(&args).unwrap();
            assert_eq!(channel, 1);
            if i + 1 == fragments.len() {
                assert_eq!(part.fences, kick.fences);
            } else {
                assert!(part.fences.is_empty());
            }
            words.extend(part.words);
        }
        assert_eq!(words, kick.words);
    }

    #[test]
    fn test_kick_fences_too_large() {
        let kick = Kick {
            put: 0,
            words: vec![],
            fences: (0..10).map(|i| Fence::new(i, 1)).collect(),
        };
        assert!(encode_kick(0, &kick, MIN_MESSAGE_SIZE).is_err());
    }

    #[test]
    fn test_remote_syncpoint_ops() {
        let (hw, backend, _handle) = remote();
        backend.cpu_incr(5).unwrap();
        assert_eq!(backend.read(5).unwrap(), 1);
        backend.write(5, 42).unwrap();
        assert_eq!(hw.syncpt_read(5).unwrap(), 42);
        assert!(backend.mutex_try_lock(1).unwrap());
        assert!(!backend.mutex_try_lock(1).unwrap());
        backend.mutex_unlock(1).unwrap();
        assert!(!backend.has_interrupts());
        assert!(matches!(backend.read(100), Err(HostError::InvalidArgument(_))));
    }

    #[test]
    fn test_remote_split_kick_executes() {
        let (hw, backend, _handle) = remote();
        backend.init(0, 0x30).unwrap();
        backend.start(0).unwrap();
        let mut words = Vec::new();
        for _ in 0..12 {
            words.push(opcodes::nonincr(opcodes::INCR_SYNCPT, 1));
            words.push(opcodes::incr_syncpt_payload(SyncptCond::Immediate, 2));
        }
        let kick = Kick {
            put: 12,
            words,
            fences: vec![Fence::new(2, 12)],
        };
        backend.kick(0, &kick).unwrap();
        assert_eq!(hw.syncpt_read(2).unwrap(), 12);
        assert_eq!(hw.dma_put(0), 12);
    }

    #[test]
    fn test_remote_module_regs() {
        let (_hw, backend, _handle) = remote();
        backend.write_module_regs(4, &[9, 8, 7]).unwrap();
        assert_eq!(backend.read_module_regs(4, 3).unwrap(), vec![9, 8, 7]);
        assert!(matches!(
            backend.read_module_regs(15, 4),
            Err(HostError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_executor_stops_with_transport() {
        let (_hw, backend, handle) = remote();
        drop(backend);
        handle.join().unwrap();
    }

    #[test]
    fn test_remote_kick_fault_resets_queue() {
        let (hw, backend, _handle) = remote();
        let backend = Arc::new(backend);
        backend.init(0, 0x30).unwrap();
        let settings = HostSettings {
            num_syncpoints: 8,
            ..HostSettings::default()
        };
        let sp = Arc::new(SyncpointManager::new(backend.clone(), Arc::new(Intr::new(8)), &settings));
        let cdma = Cdma::new(
            0,
            backend.clone(),
            sp.clone(),
            CdmaConfig {
                slots: 16,
                teardown_policy: TeardownPolicy::Requeue,
                poll_period: Duration::from_millis(1),
                flush_timeout: Duration::from_millis(100),
            },
        )
        .unwrap();
        let id = sp.allocate(SyncpointKind::HostManaged, "t").unwrap();
        let context = Arc::new(TimeoutContext::new());

        let mut submission = cdma.begin(2).unwrap();
        // The remote side loses the channel binding mid-submission.
        hw.channel_deinit(0).unwrap();
        submission
            .push(
                opcodes::nonincr(opcodes::INCR_SYNCPT, 1),
                opcodes::incr_syncpt_payload(SyncptCond::Immediate, id),
            )
            .unwrap();
        let mut job = Job::alloc(Arc::new(BufferRegistry::new()), 0, 1, 0, 0, 0, 1).unwrap();
        job.context = Some(context.clone());
        job.set_fences(vec![Fence::new(id, sp.incr_max(id, 1))]);
        let result = submission.end(Arc::new(job));

        assert!(matches!(result, Err(HostError::HardwareFault(_))));
        assert_eq!(cdma.queued_jobs(), 0);
        assert_eq!(sp.read_min(id), 1);
        assert_eq!(sp.read_max(id), 1);
        assert_eq!(hw.syncpt_read(id).unwrap(), 1);
        assert!(context.has_timed_out());
        // The restart is refused while unbound; the next begin retries it.
        assert!(!cdma.is_running());
        hw.channel_init(0, 0x30).unwrap();
        drop(cdma.begin(2).unwrap());
        assert!(cdma.is_running());
    }
}
