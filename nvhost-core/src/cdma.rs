// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Channel command queue (CDMA).
//!
//! The producer side reserves push-buffer slots with [`Cdma::begin`], streams
//! opcode pairs, and publishes them with [`CdmaSubmit::end`]. The consumer side
//! ([`Cdma::update`]) retires jobs strictly in FIFO order once all of a job's
//! fences have expired. A watchdog tears the channel down when the job at the
//! head of the queue makes no progress within its timeout.
//!
//! Lock order is `kick_lock` then `state`. Submitters hold `state` from begin
//! to end and only then take `kick_lock`; teardown holds both.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use nvhost_common::settings::TeardownPolicy;
use nvhost_common::{ChannelId, DeviceAddr, Fence, HostError, Result, HOST1X_CLASS};

use crate::backend::{CdmaBackend, Kick};
use crate::job::{Job, SUBMIT_TIMEOUT};
use crate::opcodes;
use crate::push_buffer::{PushBuffer, WORDS_PER_SLOT};
use crate::syncpoint::SyncpointManager;

#[derive(Debug, Clone)]
pub struct CdmaConfig {
    pub slots: u32,
    pub teardown_policy: TeardownPolicy,
    /// Sleep between re-checks while waiting for slots or a flush.
    pub poll_period: Duration,
    /// Bound on the flush performed by [`Cdma::stop`].
    pub flush_timeout: Duration,
}

struct QueuedJob {
    job: Arc<Job>,
    first_get: u32,
    num_slots: u32,
}

struct Watchdog {
    started: Instant,
    timeout: Duration,
    values: Vec<u32>,
}

struct CdmaState {
    pb: PushBuffer,
    /// First slot not yet published to the hardware.
    last_put: u32,
    jobs: VecDeque<QueuedJob>,
    running: bool,
    unkicked_fences: Vec<Fence>,
    watchdog: Option<Watchdog>,
}

pub struct Cdma {
    channel: ChannelId,
    backend: Arc<dyn CdmaBackend>,
    syncpoints: Arc<SyncpointManager>,
    state: Mutex<CdmaState>,
    retired: Condvar,
    kick_lock: Mutex<()>,
    config: CdmaConfig,
}

impl Cdma {
    pub fn new(
        channel: ChannelId,
        backend: Arc<dyn CdmaBackend>,
        syncpoints: Arc<SyncpointManager>,
        config: CdmaConfig,
    ) -> Result<Self> {
        Ok(Self {
            channel,
            backend,
            syncpoints,
            state: Mutex::new(CdmaState {
                pb: PushBuffer::new(config.slots)?,
                last_put: 0,
                jobs: VecDeque::new(),
                running: false,
                unkicked_fences: Vec::new(),
                watchdog: None,
            }),
            retired: Condvar::new(),
            kick_lock: Mutex::new(()),
            config,
        })
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn capacity(&self) -> u32 {
        self.state.lock().pb.capacity()
    }

    pub fn queued_jobs(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Reserve `slots` push-buffer slots, blocking until they are free.
    ///
    /// The returned guard keeps the queue locked until it is ended or dropped;
    /// dropping it without [`CdmaSubmit::end`] discards the pushed words.
    pub fn begin(&self, slots: u32) -> Result<CdmaSubmit<'_>> {
        let mut state = self.state.lock();
        if slots > state.pb.capacity() {
            return Err(HostError::invalid(format!(
                "job needs {} slots, push buffer holds {}",
                slots,
                state.pb.capacity()
            )));
        }
        if !state.running {
            self.backend.start(self.channel)?;
            state.running = true;
        }
        loop {
            self.update_locked(&mut state);
            if state.pb.space() >= slots {
                break;
            }
            log::trace!(
                "cdma: channel {} waits for {} slots ({} free)",
                self.channel,
                slots,
                state.pb.space()
            );
            self.retired.wait_for(&mut state, self.config.poll_period);
        }
        let first_get = state.pb.put();
        Ok(CdmaSubmit {
            cdma: self,
            state,
            first_get,
            ended: false,
        })
    }

    /// Publish all words pushed since the last kick.
    pub fn kick(&self) -> Result<()> {
        let _kick = self.kick_lock.lock();
        let kick = Self::take_kick(&mut self.state.lock());
        self.send_kick(&kick)
    }

    fn take_kick(state: &mut CdmaState) -> Kick {
        let put = state.pb.put();
        let count = state.pb.distance(state.last_put, put);
        let words = state.pb.slot_words(state.last_put, count);
        state.last_put = put;
        Kick {
            put,
            words,
            fences: mem::take(&mut state.unkicked_fences),
        }
    }

    fn send_kick(&self, kick: &Kick) -> Result<()> {
        if kick.words.is_empty() {
            return Ok(());
        }
        self.backend.kick(self.channel, kick)
    }

    /// Retire finished jobs. Returns how many were retired.
    pub fn update(&self) -> usize {
        let mut state = self.state.lock();
        self.update_locked(&mut state)
    }

    fn update_locked(&self, state: &mut CdmaState) -> usize {
        let mut retired = 0;
        while let Some(head) = state.jobs.front() {
            let published = state.pb.distance(state.pb.get(), state.last_put);
            if head.num_slots > published || !self.fences_done(head.job.fences()) {
                break;
            }
            let Some(done) = state.jobs.pop_front() else {
                break;
            };
            state.pb.pop(done.num_slots);
            done.job.unpin();
            log::trace!("cdma: channel {} retired {:?}", self.channel, done.job);
            retired += 1;
        }
        if retired > 0 {
            self.arm_watchdog(state);
            self.retired.notify_all();
        }
        retired
    }

    fn fences_done(&self, fences: &[Fence]) -> bool {
        fences.iter().all(|f| {
            self.syncpoints.is_expired(f.id, f.thresh)
                || (self.syncpoints.update_min(f.id).is_ok() && self.syncpoints.is_expired(f.id, f.thresh))
        })
    }

    fn sample(&self, fences: &[Fence]) -> Vec<u32> {
        fences
            .iter()
            .map(|f| self.syncpoints.update_min(f.id).unwrap_or_else(|_| self.syncpoints.read_min(f.id)))
            .collect()
    }

    fn arm_watchdog(&self, state: &mut CdmaState) {
        state.watchdog = state.jobs.front().and_then(|head| {
            head.job.timeout.map(|timeout| Watchdog {
                started: Instant::now(),
                timeout,
                values: self.sample(head.job.fences()),
            })
        });
    }

    /// Block until every queued job has retired.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            self.update_locked(&mut state);
            if state.jobs.is_empty() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(HostError::timeout(format!(
                    "channel {} flush with {} jobs queued",
                    self.channel,
                    state.jobs.len()
                )));
            }
            self.retired
                .wait_for(&mut state, (deadline - now).min(self.config.poll_period));
        }
    }

    /// Drain the queue, then stop the hardware channel.
    pub fn stop(&self) {
        if let Err(e) = self.flush(self.config.flush_timeout) {
            log::warn!("cdma: channel {} did not drain before stop: {}", self.channel, e);
            if let Err(e) = self.abort() {
                log::warn!("cdma: channel {} abort failed: {}", self.channel, e);
            }
            return;
        }
        let mut state = self.state.lock();
        if state.running {
            if let Err(e) = self.backend.stop(self.channel) {
                log::warn!("cdma: channel {} stop failed: {}", self.channel, e);
            }
            state.running = false;
        }
    }

    /// Stop the channel and force every queued job out.
    ///
    /// The queue is emptied even when the hardware stop fails; that failure
    /// is returned afterwards.
    pub fn abort(&self) -> Result<()> {
        let _kick = self.kick_lock.lock();
        let mut state = self.state.lock();
        let stopped = self.backend.stop(self.channel);
        let dropped = self.drain_locked(&mut state, false);
        if dropped > 0 {
            log::warn!("cdma: channel {} abort drops {} jobs", self.channel, dropped);
        }
        stopped
    }

    /// Recover from a failed kick or a fault reported by the hardware.
    ///
    /// Every queued job is completed on the CPU and its context marked timed
    /// out, then the channel is torn down and restarted from an empty push
    /// buffer.
    pub fn handle_fault(&self, error: &HostError) {
        let _kick = self.kick_lock.lock();
        let mut state = self.state.lock();
        log::error!("cdma: channel {} fault: {}", self.channel, error);
        if let Some(queued) = state.jobs.front() {
            if queued.job.debug_dump() {
                self.syncpoints.debug_dump();
            }
        }
        if let Err(e) = self.backend.stop(self.channel) {
            log::warn!("cdma: channel {} stop failed: {}", self.channel, e);
        }
        let dropped = self.drain_locked(&mut state, true);
        log::warn!("cdma: channel {} reset, {} jobs dropped", self.channel, dropped);
        match self.backend.start(self.channel) {
            Ok(()) => state.running = true,
            Err(e) => log::error!("cdma: channel {} restart failed: {}", self.channel, e),
        }
    }

    /// Tear the channel down and complete every queued job on the CPU.
    /// Leaves the channel stopped. Returns how many jobs were dropped.
    fn drain_locked(&self, state: &mut CdmaState, timed_out: bool) -> usize {
        if let Err(e) = self.backend.teardown(self.channel) {
            log::warn!("cdma: channel {} teardown failed: {}", self.channel, e);
        }
        state.running = false;

        let jobs = mem::take(&mut state.jobs);
        let dropped = jobs.len();
        for queued in jobs {
            self.force_complete(&queued.job, timed_out);
        }
        state.pb.reset();
        state.last_put = 0;
        state.unkicked_fences.clear();
        state.watchdog = None;
        self.retired.notify_all();
        dropped
    }

    /// Watchdog tick. Tears the channel down if the head job timed out
    /// without progress; returns whether it did.
    pub fn check_timeout(&self) -> bool {
        {
            let mut state = self.state.lock();
            self.update_locked(&mut state);
            let Some(head) = state.jobs.front() else {
                return false;
            };
            let fences = head.job.fences().to_vec();
            let Some(watchdog) = state.watchdog.as_mut() else {
                return false;
            };
            if watchdog.started.elapsed() < watchdog.timeout {
                return false;
            }
            let values = self.sample(&fences);
            if values != watchdog.values {
                log::debug!("cdma: channel {} head job progressed, re-arming watchdog", self.channel);
                watchdog.started = Instant::now();
                watchdog.values = values;
                return false;
            }
        }
        self.handle_timeout();
        true
    }

    /// Tear down a wedged channel and restart it.
    ///
    /// The head job is completed on the CPU and its notifier set. Queued jobs
    /// of the same client directly behind it are dropped the same way; the
    /// rest are requeued or dropped according to the teardown policy.
    pub fn handle_timeout(&self) {
        let kick_guard = self.kick_lock.lock();
        let mut state = self.state.lock();
        self.update_locked(&mut state);
        let Some(head) = state.jobs.front() else {
            return;
        };
        let client = head.job.client;
        log::warn!(
            "cdma: channel {} timed out, client {} fences {:?}",
            self.channel,
            client,
            head.job.fences()
        );
        if head.job.debug_dump() {
            self.syncpoints.debug_dump();
        }

        if let Err(e) = self.backend.stop(self.channel) {
            log::warn!("cdma: channel {} stop failed: {}", self.channel, e);
        }
        if let Err(e) = self.backend.teardown(self.channel) {
            log::warn!("cdma: channel {} teardown failed: {}", self.channel, e);
        }
        state.running = false;

        let jobs = mem::take(&mut state.jobs);
        let mut requeue = Vec::new();
        let mut same_client = true;
        for (i, queued) in jobs.into_iter().enumerate() {
            if i > 0 && queued.job.client != client {
                same_client = false;
            }
            if i == 0 || same_client {
                log::warn!("cdma: channel {} drops {:?}", self.channel, queued.job);
                self.force_complete(&queued.job, true);
            } else if self.config.teardown_policy == TeardownPolicy::Drop {
                log::warn!("cdma: channel {} drops {:?}", self.channel, queued.job);
                self.force_complete(&queued.job, false);
            } else {
                log::info!("cdma: channel {} requeues {:?}", self.channel, queued.job);
                let words = state.pb.slot_words(queued.first_get, queued.num_slots);
                requeue.push((queued, words));
            }
        }

        state.pb.reset();
        state.last_put = 0;
        state.unkicked_fences.clear();
        for (mut queued, words) in requeue {
            queued.first_get = state.pb.put();
            for pair in words.chunks_exact(WORDS_PER_SLOT) {
                if let Err(e) = state.pb.push(pair[0], pair[1]) {
                    log::error!("cdma: channel {} requeue overflow: {}", self.channel, e);
                    break;
                }
            }
            state.unkicked_fences.extend_from_slice(queued.job.fences());
            state.jobs.push_back(queued);
        }

        self.update_locked(&mut state);
        self.arm_watchdog(&mut state);
        match self.backend.start(self.channel) {
            Ok(()) => state.running = true,
            Err(e) => log::error!("cdma: channel {} restart failed: {}", self.channel, e),
        }
        let kick = Self::take_kick(&mut state);
        drop(state);
        let replayed = self.send_kick(&kick);
        drop(kick_guard);
        self.retired.notify_all();
        if let Err(e) = replayed {
            log::error!("cdma: channel {} replay failed: {}", self.channel, e);
            self.handle_fault(&e);
        }
    }

    /// Complete a job on the CPU: flag the error, reach its fences, unpin.
    /// `timed_out` also marks the job's context, before any waiter wakes.
    fn force_complete(&self, job: &Job, timed_out: bool) {
        if timed_out {
            job.mark_timed_out();
        }
        job.notify_error(SUBMIT_TIMEOUT);
        for fence in job.fences() {
            if let Err(e) = self.syncpoints.cpu_incr_to(fence.id, fence.thresh) {
                log::warn!("cdma: cannot complete syncpt {} to {}: {}", fence.id, fence.thresh, e);
            }
        }
        job.unpin();
    }
}

/// Open submission on a [`Cdma`]. Holds the queue lock.
pub struct CdmaSubmit<'a> {
    cdma: &'a Cdma,
    state: MutexGuard<'a, CdmaState>,
    first_get: u32,
    ended: bool,
}

impl CdmaSubmit<'_> {
    pub fn push(&mut self, op1: u32, op2: u32) -> Result<()> {
        self.state.pb.push(op1, op2)
    }

    pub fn push_gather(&mut self, address: DeviceAddr, words: u32) -> Result<()> {
        let address = u32::try_from(address)
            .map_err(|_| HostError::invalid(format!("gather address 0x{address:X} beyond 32 bits")))?;
        self.push(opcodes::gather(words), address)
    }

    /// Stream the gathers of a pinned job.
    pub fn push_job(&mut self, job: &Job) -> Result<()> {
        let mut class = None;
        for gather in job.gathers() {
            if let Some(fence) = gather.pre_fence {
                if !self.cdma.syncpoints.is_expired(fence.id, fence.thresh) {
                    self.push(
                        opcodes::setclass(HOST1X_CLASS, opcodes::WAIT_SYNCPT, 1),
                        opcodes::wait_syncpt_payload(fence.id, fence.thresh),
                    )?;
                    class = Some(HOST1X_CLASS);
                }
            }
            if class != Some(gather.class_id) {
                self.push(opcodes::setclass(gather.class_id, 0, 0), opcodes::nop())?;
                class = Some(gather.class_id);
            }
            self.push_gather(gather.address, gather.words)?;
        }
        Ok(())
    }

    /// Append the trailer, queue `job` and publish the words.
    ///
    /// A failed kick resets the channel before the error is returned, so
    /// `job` has already been completed on the CPU and unpinned.
    pub fn end(mut self, job: Arc<Job>) -> Result<()> {
        let next = self.state.pb.advance(self.state.pb.put(), 1);
        self.push(opcodes::restart(next * (WORDS_PER_SLOT as u32) * 4), opcodes::nop())?;

        let num_slots = self.state.pb.distance(self.first_get, self.state.pb.put());
        let was_idle = self.state.jobs.is_empty();
        self.state.unkicked_fences.extend_from_slice(job.fences());
        self.state.jobs.push_back(QueuedJob {
            job,
            first_get: self.first_get,
            num_slots,
        });
        if was_idle {
            self.cdma.arm_watchdog(&mut self.state);
        }
        self.ended = true;

        let cdma = self.cdma;
        drop(self);
        cdma.kick().inspect_err(|e| cdma.handle_fault(e))
    }
}

impl Drop for CdmaSubmit<'_> {
    fn drop(&mut self) {
        if !self.ended {
            log::debug!("cdma: channel {} submission abandoned", self.cdma.channel);
            let first_get = self.first_get;
            self.state.pb.rewind(first_get);
        }
    }
}
