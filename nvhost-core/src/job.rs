// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Jobs and the pin pipeline.
//!
//! A job is built from the tables of one submission, pinned (every buffer
//! handle resolved to a device address, relocations patched, satisfied
//! wait-checks neutralized), then handed to the channel's command queue as an
//! `Arc<Job>`. It is unpinned when its fences expire or when teardown forces
//! it out; unpinning twice is harmless.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use parking_lot::Mutex;

use nvhost_common::settings::ResourcePolicy;
use nvhost_common::{
    ChannelId, ClientId, DeviceAddr, Fence, Handle, HostError, Result, SyncpointId, GRAPHICS_HOST_SYNCPT,
    HOST1X_CLASS, INVALID_HANDLE,
};

use crate::memory::BufferRegistry;
use crate::opcodes;
use crate::syncpoint::{CancelToken, SyncpointManager};

bitflags! {
    /// Submission flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SubmitFlags: u32 {
        /// Return a mergeable [`SyncFence`] instead of raw fence values.
        const SYNC_FENCE_FD = 1 << 0;
    }
}

/// One command buffer of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gather {
    pub handle: Handle,
    /// Length in words.
    pub words: u32,
    /// Byte offset inside the buffer.
    pub offset: u64,
    /// Engine class; 0 selects the channel's default class.
    pub class_id: u32,
    /// Fence the hardware must wait for before fetching this gather.
    pub pre_fence: Option<Fence>,
    /// Resolved by [`Job::pin`].
    pub address: DeviceAddr,
}

impl Gather {
    pub fn new(handle: Handle, words: u32, offset: u64) -> Self {
        Self {
            handle,
            words,
            offset,
            class_id: 0,
            pre_fence: None,
            address: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelocKind {
    #[default]
    Default,
    PitchLinear,
    BlockLinear,
}

/// Patch the address of `target_handle` into a command buffer word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reloc {
    pub cmdbuf_handle: Handle,
    pub cmdbuf_offset: u64,
    pub target_handle: Handle,
    pub target_offset: u64,
    pub shift: u32,
    pub kind: RelocKind,
}

/// A WAIT_SYNCPT payload inside a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waitchk {
    pub handle: Handle,
    pub offset: u64,
    pub syncpt_id: SyncpointId,
    pub thresh: u32,
}

/// Number of increments the job performs on one syncpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncptIncr {
    pub syncpt_id: SyncpointId,
    pub incrs: u32,
}

// ── Error notifier ──────────────────────────────────────────────────────

/// Error code written when a job is torn down after a timeout.
pub const SUBMIT_TIMEOUT: u32 = 1;
/// Status value marking a notifier record as written.
pub const NOTIFIER_STATUS_ERROR: u16 = 0xffff;
/// Size of a notifier record in bytes.
pub const NOTIFIER_SIZE: u64 = 16;

/// Location of a user-visible error record.
///
/// The record is `{timestamp_ns: u64, info32: u32, info16: u16, status: u16}`.
#[derive(Clone)]
pub struct ErrorNotifier {
    memory: Arc<BufferRegistry>,
    handle: Handle,
    offset: u64,
}

impl ErrorNotifier {
    pub fn new(memory: Arc<BufferRegistry>, handle: Handle, offset: u64) -> Result<Self> {
        let size = memory
            .size(handle)
            .ok_or_else(|| HostError::invalid(format!("unknown notifier handle {handle}")))?;
        let end = offset
            .checked_add(NOTIFIER_SIZE)
            .ok_or_else(|| HostError::invalid("notifier offset overflows"))?;
        if end > size {
            return Err(HostError::invalid(format!(
                "notifier at 0x{offset:X} does not fit buffer of 0x{size:X} bytes"
            )));
        }
        let notifier = Self {
            memory,
            handle,
            offset,
        };
        notifier.clear()?;
        Ok(notifier)
    }

    pub fn clear(&self) -> Result<()> {
        self.memory.write_words(self.handle, self.offset, &[0; 4])
    }

    /// Write an error record.
    pub fn set_error(&self, error: u32) -> Result<()> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        let record = [
            timestamp as u32,
            (timestamp >> 32) as u32,
            error,
            (NOTIFIER_STATUS_ERROR as u32) << 16,
        ];
        self.memory.write_words(self.handle, self.offset, &record)
    }

    /// Error code and status of the current record.
    pub fn read(&self) -> Result<(u32, u16)> {
        let words = self.memory.read_words(self.handle, self.offset, 4)?;
        Ok((words[2], (words[3] >> 16) as u16))
    }
}

impl std::fmt::Debug for ErrorNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorNotifier")
            .field("handle", &self.handle)
            .field("offset", &self.offset)
            .finish()
    }
}

// ── Client fault state ──────────────────────────────────────────────────

/// Fault state shared by every job of one client context.
///
/// Once a job of the context is torn down by the watchdog or lost to a
/// channel fault, the context stays timed out and further submissions are
/// refused.
#[derive(Debug)]
pub struct TimeoutContext {
    timed_out: AtomicBool,
    debug_dump: AtomicBool,
}

impl TimeoutContext {
    pub fn new() -> Self {
        Self {
            timed_out: AtomicBool::new(false),
            debug_dump: AtomicBool::new(true),
        }
    }

    pub fn has_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    pub fn set_timed_out(&self) {
        self.timed_out.store(true, Ordering::Release);
    }

    /// Whether a timeout of this context dumps the syncpoint table.
    pub fn debug_dump(&self) -> bool {
        self.debug_dump.load(Ordering::Relaxed)
    }

    pub fn set_debug_dump(&self, enabled: bool) {
        self.debug_dump.store(enabled, Ordering::Relaxed);
    }
}

impl Default for TimeoutContext {
    fn default() -> Self {
        Self::new()
    }
}

// ── Completion tokens ───────────────────────────────────────────────────

/// Mergeable set of fences, at most one per syncpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncFence {
    points: Vec<Fence>,
}

impl SyncFence {
    pub fn new(fences: &[Fence], syncpoints: &SyncpointManager) -> Self {
        fences.iter().fold(Self::default(), |mut acc, &fence| {
            acc.insert(fence, syncpoints);
            acc
        })
    }

    fn insert(&mut self, fence: Fence, syncpoints: &SyncpointManager) {
        match self.points.iter_mut().find(|p| p.id == fence.id) {
            Some(point) => {
                if syncpoints.compare(fence.id, point.thresh, fence.thresh).is_lt() {
                    point.thresh = fence.thresh;
                }
            }
            None => self.points.push(fence),
        }
    }

    /// Union of both fences, keeping the later threshold per syncpoint.
    pub fn merge(&self, other: &SyncFence, syncpoints: &SyncpointManager) -> SyncFence {
        let mut merged = self.clone();
        for &fence in &other.points {
            merged.insert(fence, syncpoints);
        }
        merged
    }

    pub fn fences(&self) -> &[Fence] {
        &self.points
    }

    pub fn is_signaled(&self, syncpoints: &SyncpointManager) -> bool {
        self.points.iter().all(|f| syncpoints.is_expired(f.id, f.thresh))
    }

    pub fn wait(
        &self,
        syncpoints: &SyncpointManager,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        for fence in &self.points {
            syncpoints.wait(fence.id, fence.thresh, timeout, cancel)?;
        }
        Ok(())
    }
}

/// What a submission returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionToken {
    Fences(Vec<Fence>),
    SyncFence(SyncFence),
}

impl CompletionToken {
    pub fn fences(&self) -> &[Fence] {
        match self {
            Self::Fences(fences) => fences,
            Self::SyncFence(sync_fence) => sync_fence.fences(),
        }
    }
}

// ── Job ─────────────────────────────────────────────────────────────────

/// Upper bound on any one table, independent of the per-job gather limit.
const MAX_TABLE_ENTRIES: usize = 1 << 16;

pub struct Job {
    pub channel: ChannelId,
    pub client: ClientId,
    /// `None` disables the watchdog for this job.
    pub timeout: Option<Duration>,
    pub notifier: Option<ErrorNotifier>,
    pub context: Option<Arc<TimeoutContext>>,
    memory: Arc<BufferRegistry>,
    gathers: Vec<Gather>,
    relocs: Vec<Reloc>,
    waitchks: Vec<Waitchk>,
    incrs: Vec<SyncptIncr>,
    fences: Vec<Fence>,
    pins: Mutex<Vec<Handle>>,
    /// Table sizes reserved by [`Job::alloc`]: gathers, relocs, waitchks, incrs.
    limits: [usize; 4],
}

impl Job {
    /// Reserve room for the tables of one submission.
    pub fn alloc(
        memory: Arc<BufferRegistry>,
        channel: ChannelId,
        client: ClientId,
        num_gathers: u32,
        num_relocs: u32,
        num_waitchks: u32,
        num_syncpts: u32,
    ) -> Result<Self> {
        let counts = [num_gathers, num_relocs, num_waitchks, num_syncpts].map(|n| n as usize);
        if counts.iter().any(|&n| n > MAX_TABLE_ENTRIES) {
            return Err(HostError::invalid(format!("job tables too large: {counts:?}")));
        }
        let bytes = [
            mem::size_of::<Gather>(),
            mem::size_of::<Reloc>(),
            mem::size_of::<Waitchk>(),
            mem::size_of::<SyncptIncr>(),
        ]
        .iter()
        .zip(counts)
        .try_fold(0usize, |acc, (&size, n)| size.checked_mul(n).and_then(|b| acc.checked_add(b)));
        if bytes.is_none() {
            return Err(HostError::OutOfMemory("job table size overflows".into()));
        }

        Ok(Self {
            channel,
            client,
            timeout: None,
            notifier: None,
            context: None,
            memory,
            gathers: Vec::with_capacity(counts[0]),
            relocs: Vec::with_capacity(counts[1]),
            waitchks: Vec::with_capacity(counts[2]),
            incrs: Vec::with_capacity(counts[3]),
            fences: Vec::new(),
            pins: Mutex::new(Vec::new()),
            limits: counts,
        })
    }

    pub fn add_gather(&mut self, gather: Gather) -> Result<()> {
        if self.gathers.len() >= self.limits[0] {
            return Err(HostError::invalid(format!(
                "job already holds {} gathers",
                self.limits[0]
            )));
        }
        if gather.handle == INVALID_HANDLE || gather.words == 0 {
            return Err(HostError::invalid(format!(
                "gather of {} words from handle {}",
                gather.words, gather.handle
            )));
        }
        self.gathers.push(gather);
        Ok(())
    }

    pub fn add_reloc(&mut self, reloc: Reloc) -> Result<()> {
        if self.relocs.len() >= self.limits[1] {
            return Err(HostError::invalid("relocation table full"));
        }
        self.relocs.push(reloc);
        Ok(())
    }

    pub fn add_waitchk(&mut self, waitchk: Waitchk) -> Result<()> {
        if self.waitchks.len() >= self.limits[2] {
            return Err(HostError::invalid("wait-check table full"));
        }
        self.waitchks.push(waitchk);
        Ok(())
    }

    pub fn add_syncpt_incr(&mut self, incr: SyncptIncr) -> Result<()> {
        if self.incrs.len() >= self.limits[3] {
            return Err(HostError::invalid("syncpoint increment table full"));
        }
        self.incrs.push(incr);
        Ok(())
    }

    pub fn gathers(&self) -> &[Gather] {
        &self.gathers
    }

    pub fn relocs(&self) -> &[Reloc] {
        &self.relocs
    }

    pub fn waitchks(&self) -> &[Waitchk] {
        &self.waitchks
    }

    pub fn syncpt_incrs(&self) -> &[SyncptIncr] {
        &self.incrs
    }

    /// Completion fences, known once the job is queued.
    pub fn fences(&self) -> &[Fence] {
        &self.fences
    }

    pub(crate) fn set_fences(&mut self, fences: Vec<Fence>) {
        self.fences = fences;
    }

    /// Give gathers without an explicit class the channel's class.
    pub(crate) fn set_default_class(&mut self, class_id: u32) {
        for gather in self.gathers.iter_mut().filter(|g| g.class_id == 0) {
            gather.class_id = class_id;
        }
    }

    pub fn num_pins(&self) -> usize {
        self.pins.lock().len()
    }

    /// Push-buffer slots needed to stream this job, trailer included.
    ///
    /// Every gather takes one slot, plus one for a pre-fence wait and one for
    /// a class switch.
    pub fn slots_needed(&self) -> u32 {
        let mut class = None;
        let mut slots = 1;
        for gather in &self.gathers {
            if gather.pre_fence.is_some() {
                slots += 1;
                class = Some(HOST1X_CLASS);
            }
            if class != Some(gather.class_id) {
                slots += 1;
                class = Some(gather.class_id);
            }
            slots += 1;
        }
        slots
    }

    /// Resolve every referenced handle, patch relocations and wait-checks.
    ///
    /// Each distinct handle is resolved exactly once. On failure every pin
    /// taken so far is dropped again and the job is left unpinned.
    pub fn pin(&mut self, syncpoints: &SyncpointManager, policy: ResourcePolicy) -> Result<()> {
        if self.num_pins() > 0 {
            return Err(HostError::invalid("job is already pinned"));
        }

        let mut handles: Vec<Handle> = self
            .gathers
            .iter()
            .map(|g| g.handle)
            .chain(self.relocs.iter().flat_map(|r| [r.cmdbuf_handle, r.target_handle]))
            .collect();
        handles.sort_unstable();
        handles.dedup();

        let mut addresses = Vec::with_capacity(handles.len());
        for &handle in &handles {
            match self.memory.pin(handle) {
                Ok(address) => addresses.push((handle, address)),
                Err(e) => {
                    log::debug!("job: pin of handle {} failed, rolling back {}", handle, addresses.len());
                    for &(pinned, _) in &addresses {
                        self.memory.unpin(pinned);
                    }
                    return Err(e);
                }
            }
        }
        *self.pins.lock() = handles;

        if let Err(e) = self.patch(&addresses, syncpoints, policy) {
            self.unpin();
            return Err(e);
        }
        Ok(())
    }

    fn patch(
        &mut self,
        addresses: &[(Handle, DeviceAddr)],
        syncpoints: &SyncpointManager,
        policy: ResourcePolicy,
    ) -> Result<()> {
        let lookup = |handle: Handle| -> Result<DeviceAddr> {
            addresses
                .binary_search_by_key(&handle, |&(h, _)| h)
                .map(|i| addresses[i].1)
                .map_err(|_| HostError::PinFailure {
                    handle,
                    reason: "not pinned".into(),
                })
        };

        for gather in &mut self.gathers {
            let size = self.memory.size(gather.handle).unwrap_or(0);
            let end = gather
                .offset
                .checked_add(u64::from(gather.words) * 4)
                .filter(|&end| end <= size);
            if end.is_none() || gather.offset % 4 != 0 {
                return Err(HostError::invalid(format!(
                    "gather 0x{:X}+{} words outside handle {}",
                    gather.offset, gather.words, gather.handle
                )));
            }
            gather.address = lookup(gather.handle)? + gather.offset;
        }

        for reloc in &self.relocs {
            let target = lookup(reloc.target_handle)?
                .checked_add(reloc.target_offset)
                .ok_or_else(|| HostError::invalid("relocation target overflows"))?;
            let value = (target >> reloc.shift.min(63)) as u32;
            self.memory
                .write_words(reloc.cmdbuf_handle, reloc.cmdbuf_offset, &[value])?;
        }

        self.do_waitchks(syncpoints, policy)
    }

    /// Neutralize wait-checks that cannot block.
    ///
    /// A wait on an already expired threshold is rewritten to wait on the
    /// graphics-host syncpoint for zero. Under per-instance isolation every
    /// wait-check is rewritten.
    pub fn do_waitchks(&self, syncpoints: &SyncpointManager, policy: ResourcePolicy) -> Result<()> {
        let always = policy == ResourcePolicy::PerChannelInstance;
        let mut refreshed: Vec<SyncpointId> = Vec::new();

        for wait in &self.waitchks {
            if !syncpoints.is_valid(wait.syncpt_id) {
                log::warn!("job: wait-check on invalid syncpoint {}, skipped", wait.syncpt_id);
                continue;
            }
            if !self.gathers.iter().any(|g| g.handle == wait.handle) {
                continue;
            }
            if !refreshed.contains(&wait.syncpt_id) {
                syncpoints.update_min(wait.syncpt_id)?;
                refreshed.push(wait.syncpt_id);
            }
            if always || syncpoints.is_expired(wait.syncpt_id, wait.thresh) {
                log::trace!(
                    "job: patch wait syncpt {} >= {} at handle {}+0x{:X}",
                    wait.syncpt_id,
                    wait.thresh,
                    wait.handle,
                    wait.offset
                );
                let patched = opcodes::wait_syncpt_payload(GRAPHICS_HOST_SYNCPT, 0);
                self.memory.write_words(wait.handle, wait.offset, &[patched])?;
            }
        }
        Ok(())
    }

    /// Drop every pin reference. Safe to call more than once.
    pub fn unpin(&self) {
        let pins = mem::take(&mut *self.pins.lock());
        for handle in pins {
            self.memory.unpin(handle);
        }
    }

    pub fn has_timed_out(&self) -> bool {
        self.context.as_ref().is_some_and(|c| c.has_timed_out())
    }

    /// Whether a timeout of this job dumps the syncpoint table.
    pub fn debug_dump(&self) -> bool {
        self.context.as_ref().map_or(true, |c| c.debug_dump())
    }

    /// Flag the owning context as timed out.
    pub fn mark_timed_out(&self) {
        if let Some(context) = &self.context {
            context.set_timed_out();
        }
    }

    /// Record an error in the job's notifier, if it has one.
    pub fn notify_error(&self, error: u32) {
        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.set_error(error) {
                log::warn!("job: failed to write error notifier: {}", e);
            }
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.unpin();
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("channel", &self.channel)
            .field("client", &self.client)
            .field("gathers", &self.gathers.len())
            .field("fences", &self.fences)
            .finish()
    }
}
