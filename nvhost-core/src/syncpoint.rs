// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Syncpoint manager.
//!
//! A syncpoint is a 32-bit hardware counter that only moves forward. The
//! manager keeps two shadows per syncpoint: `min`, the last value observed
//! from hardware, and `max`, the value the counter will reach once all work
//! scheduled so far has completed. Host-managed syncpoints have `max` bumped
//! by the submission path before work is queued; client-managed ones are
//! incremented by their owner and only ever compared directly.
//!
//! All comparisons are modular. A threshold is expired when it lies at or
//! behind `min` inside the window that ends at `max`; a threshold outside the
//! window is stale and also counts as expired.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use nvhost_common::settings::HostSettings;
use nvhost_common::{ChannelId, HostError, Result, SyncpointId, GRAPHICS_HOST_SYNCPT};

use crate::backend::SyncpointBackend;
use crate::intr::{Intr, WaitAction, WaitEvent, WaiterRef};

/// First id handed out by [`SyncpointManager::allocate`].
pub const FIRST_ALLOCATABLE: SyncpointId = GRAPHICS_HOST_SYNCPT + 1;

/// Sleep between allocation attempts while the table is full.
const ALLOC_BACKOFF: Duration = Duration::from_millis(1);

/// Who tracks the target value of a syncpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncpointKind {
    HostManaged,
    ClientManaged,
}

/// Point-in-time view of one syncpoint, for dumps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncpointInfo {
    pub id: SyncpointId,
    pub min: u32,
    pub max: u32,
    pub refs: u32,
    pub client_managed: bool,
    pub in_use: Option<ChannelId>,
    pub name: Option<String>,
}

/// Cancellation signal for interruptible waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Slot {
    name: Option<String>,
    last_used_by: Option<String>,
    in_use: Option<ChannelId>,
}

struct WaitConfig {
    free_wait: Duration,
    check_period: Duration,
    poll_period: Duration,
    max_stuck_checks: u32,
}

/// Owns every syncpoint and hardware mutex of one host.
pub struct SyncpointManager {
    backend: Arc<dyn SyncpointBackend>,
    intr: Arc<Intr>,
    min: Box<[AtomicU32]>,
    max: Box<[AtomicU32]>,
    refs: Box<[AtomicU32]>,
    assigned: Box<[AtomicBool]>,
    client_managed: Box<[AtomicBool]>,
    lock_counts: Box<[AtomicU32]>,
    /// Serializes allocate/free/naming.
    table: Mutex<Vec<Slot>>,
    freed: Condvar,
    cpu_incr_lock: Mutex<()>,
    interrupts: bool,
    config: WaitConfig,
}

impl SyncpointManager {
    pub fn new(backend: Arc<dyn SyncpointBackend>, intr: Arc<Intr>, settings: &HostSettings) -> Self {
        let nb_pts = settings.num_syncpoints.max(FIRST_ALLOCATABLE + 1);
        let atomics = |n: u32| -> Box<[AtomicU32]> { (0..n).map(|_| AtomicU32::new(0)).collect() };
        let flags = |n: u32| -> Box<[AtomicBool]> { (0..n).map(|_| AtomicBool::new(false)).collect() };

        let mgr = Self {
            interrupts: backend.has_interrupts(),
            backend,
            intr,
            min: atomics(nb_pts),
            max: atomics(nb_pts),
            refs: atomics(nb_pts),
            assigned: flags(nb_pts),
            client_managed: flags(nb_pts),
            lock_counts: atomics(settings.num_mutexes),
            table: Mutex::new((0..nb_pts).map(|_| Slot::default()).collect()),
            freed: Condvar::new(),
            cpu_incr_lock: Mutex::new(()),
            config: WaitConfig {
                free_wait: settings.free_wait(),
                check_period: settings.check_period(),
                poll_period: settings.poll_period(),
                max_stuck_checks: settings.max_stuck_checks,
            },
        };

        // The graphics-host syncpoint stays at zero and is never released.
        let id = GRAPHICS_HOST_SYNCPT as usize;
        mgr.assigned[id].store(true, Ordering::Release);
        mgr.client_managed[id].store(true, Ordering::Release);
        mgr.refs[id].store(1, Ordering::Release);
        mgr.table.lock()[id].name = Some("gfx_host".into());
        mgr
    }

    pub fn num_syncpoints(&self) -> u32 {
        self.min.len() as u32
    }

    pub fn num_mutexes(&self) -> u32 {
        self.lock_counts.len() as u32
    }

    pub fn has_interrupts(&self) -> bool {
        self.interrupts
    }

    pub fn is_valid(&self, id: SyncpointId) -> bool {
        (id as usize) < self.min.len()
    }

    fn check_id(&self, id: SyncpointId) -> Result<usize> {
        if self.is_valid(id) {
            Ok(id as usize)
        } else {
            Err(HostError::invalid(format!("syncpoint id {id} out of range")))
        }
    }

    // ── Allocation and reference counting ───────────────────────────────

    /// Reserve an unassigned syncpoint and return it holding one reference.
    ///
    /// Blocks with a short back-off while the table is full and fails with
    /// `ResourceExhausted` once the free-wait bound passes.
    pub fn allocate(&self, kind: SyncpointKind, name: &str) -> Result<SyncpointId> {
        let deadline = Instant::now() + self.config.free_wait;
        let mut table = self.table.lock();
        let id = loop {
            let free = (FIRST_ALLOCATABLE as usize..self.min.len()).find(|&i| {
                !self.assigned[i].load(Ordering::Acquire) && self.refs[i].load(Ordering::Acquire) == 0
            });
            if let Some(i) = free {
                break i;
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("syncpt: no free syncpoint for {}", name);
                return Err(HostError::ResourceExhausted("syncpoint"));
            }
            self.freed.wait_for(&mut table, (deadline - now).min(ALLOC_BACKOFF));
        };

        let client_managed = kind == SyncpointKind::ClientManaged;
        table[id].name = Some(name.to_string());
        table[id].in_use = None;
        self.client_managed[id].store(client_managed, Ordering::Release);
        self.assigned[id].store(true, Ordering::Release);
        self.refs[id].store(1, Ordering::Release);
        drop(table);

        let sid = id as SyncpointId;
        // Start from the live value with no pending work.
        match self.backend.read(sid) {
            Ok(value) => {
                self.min[id].store(value, Ordering::Release);
                self.max[id].store(value, Ordering::Release);
            }
            Err(e) => {
                log::warn!("syncpt: initial read of {} failed: {}", sid, e);
                self.max[id].store(self.read_min(sid), Ordering::Release);
            }
        }
        log::debug!("syncpt: allocated {} ({:?}) for {}", sid, kind, name);
        Ok(sid)
    }

    /// Take an additional reference. Returns the new count.
    pub fn get_ref(&self, id: SyncpointId) -> Result<u32> {
        let idx = self.check_id(id)?;
        Ok(self.refs[idx].fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn read_ref(&self, id: SyncpointId) -> u32 {
        self.refs.get(id as usize).map_or(0, |r| r.load(Ordering::Acquire))
    }

    /// Drop a reference; the last one releases the syncpoint.
    pub fn free(&self, id: SyncpointId) {
        let Ok(idx) = self.check_id(id) else {
            log::warn!("syncpt: free of invalid id {}", id);
            return;
        };
        if id == GRAPHICS_HOST_SYNCPT {
            return;
        }
        match self.refs[idx].fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1)) {
            Ok(1) => self.release(id),
            Ok(_) => {}
            Err(_) => log::warn!("syncpt: unbalanced free of {}", id),
        }
    }

    fn release(&self, id: SyncpointId) {
        let idx = id as usize;
        if !self.assigned[idx].load(Ordering::Acquire) {
            log::warn!("syncpt: release of unassigned syncpoint {}", id);
            return;
        }

        let client_managed = self.is_client_managed(id);
        if !client_managed && !self.min_eq_max(id) {
            let max = self.read_max(id);
            log::warn!(
                "syncpt: freeing {} with pending work (min {} max {})",
                id,
                self.read_min(id),
                max
            );
            if let Err(e) = self.wait(id, max, Some(self.config.free_wait), None) {
                log::warn!("syncpt: {} did not drain before release: {}", id, e);
            }
        }

        let mut table = self.table.lock();
        if client_managed {
            // The owner's increments are not tracked; adopt the live value.
            match self.update_min(id) {
                Ok(value) => self.max[idx].store(value, Ordering::Release),
                Err(e) => log::warn!("syncpt: read of {} on release failed: {}", id, e),
            }
        }
        let slot = &mut table[idx];
        slot.last_used_by = slot.name.take();
        slot.in_use = None;
        self.client_managed[idx].store(false, Ordering::Release);
        self.assigned[idx].store(false, Ordering::Release);
        drop(table);

        self.freed.notify_all();
        log::debug!("syncpt: released {}", id);
    }

    /// Bind a syncpoint to a channel, taking a reference.
    pub fn mark_used(&self, channel: ChannelId, id: SyncpointId) -> Result<()> {
        let idx = self.check_id(id)?;
        self.get_ref(id)?;
        self.table.lock()[idx].in_use = Some(channel);
        Ok(())
    }

    /// Unbind a syncpoint from a channel and drop the reference.
    pub fn mark_unused(&self, channel: ChannelId, id: SyncpointId) {
        let Ok(idx) = self.check_id(id) else {
            return;
        };
        {
            let mut table = self.table.lock();
            if table[idx].in_use == Some(channel) {
                table[idx].in_use = None;
            }
        }
        self.free(id);
    }

    pub fn is_assigned(&self, id: SyncpointId) -> bool {
        self.assigned.get(id as usize).is_some_and(|a| a.load(Ordering::Acquire))
    }

    pub fn is_client_managed(&self, id: SyncpointId) -> bool {
        self.client_managed
            .get(id as usize)
            .is_some_and(|c| c.load(Ordering::Acquire))
    }

    pub fn in_use(&self, id: SyncpointId) -> Option<ChannelId> {
        self.table.lock().get(id as usize).and_then(|s| s.in_use)
    }

    pub fn set_name(&self, id: SyncpointId, name: &str) -> Result<()> {
        let idx = self.check_id(id)?;
        if !self.is_assigned(id) {
            return Err(HostError::invalid(format!("syncpoint {id} is not assigned")));
        }
        self.table.lock()[idx].name = Some(name.to_string());
        Ok(())
    }

    pub fn name(&self, id: SyncpointId) -> Option<String> {
        self.table.lock().get(id as usize).and_then(|s| s.name.clone())
    }

    /// Name of the last owner of a released syncpoint.
    pub fn last_used_by(&self, id: SyncpointId) -> Option<String> {
        self.table.lock().get(id as usize).and_then(|s| s.last_used_by.clone())
    }

    // ── Counter shadows ─────────────────────────────────────────────────

    /// Pull the hardware value into the `min` shadow and return it.
    ///
    /// The shadow only moves forward, and for host-managed syncpoints it
    /// never passes `max`.
    pub fn update_min(&self, id: SyncpointId) -> Result<u32> {
        let idx = self.check_id(id)?;
        let live = self.backend.read(id)?;
        let client_managed = self.is_client_managed(id);
        let min = &self.min[idx];

        let mut old = min.load(Ordering::Acquire);
        loop {
            if (live.wrapping_sub(old) as i32) <= 0 {
                // Same value, or a slower reader saw an older one.
                return Ok(old);
            }
            let mut new = live;
            if !client_managed {
                let max = self.max[idx].load(Ordering::Acquire);
                if live.wrapping_sub(old) > max.wrapping_sub(old) {
                    log::error!("syncpt: {} hardware value {} is past max {}", id, live, max);
                    new = max;
                    if new == old {
                        return Ok(old);
                    }
                }
            }
            match min.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(new),
                Err(current) => old = current,
            }
        }
    }

    /// Fresh value of a syncpoint.
    pub fn read(&self, id: SyncpointId) -> Result<u32> {
        self.update_min(id)
    }

    /// Cached `min` shadow.
    pub fn read_min(&self, id: SyncpointId) -> u32 {
        self.min.get(id as usize).map_or(0, |m| m.load(Ordering::Acquire))
    }

    /// Cached `max` shadow.
    pub fn read_max(&self, id: SyncpointId) -> u32 {
        self.max.get(id as usize).map_or(0, |m| m.load(Ordering::Acquire))
    }

    pub fn min_eq_max(&self, id: SyncpointId) -> bool {
        self.read_min(id) == self.read_max(id)
    }

    /// Schedule `n` more increments. Returns the new target value.
    pub fn incr_max(&self, id: SyncpointId, n: u32) -> u32 {
        match self.max.get(id as usize) {
            Some(max) => max.fetch_add(n, Ordering::AcqRel).wrapping_add(n),
            None => {
                log::warn!("syncpt: incr_max on invalid id {}", id);
                0
            }
        }
    }

    /// Declare all scheduled work done and write it back to hardware.
    pub fn set_min_eq_max(&self, id: SyncpointId) -> Result<()> {
        let idx = self.check_id(id)?;
        let max = self.max[idx].load(Ordering::Acquire);
        self.min[idx].store(max, Ordering::Release);
        self.backend.write(id, max)
    }

    /// CPU increment. The target moves first so `min` never passes `max`.
    pub fn incr(&self, id: SyncpointId) -> Result<()> {
        self.check_id(id)?;
        self.incr_max(id, 1);
        let _guard = self.cpu_incr_lock.lock();
        self.backend.cpu_incr(id)
    }

    /// CPU-increment until `thresh` is reached. Returns the final value.
    pub fn cpu_incr_to(&self, id: SyncpointId, thresh: u32) -> Result<u32> {
        self.check_id(id)?;
        let _guard = self.cpu_incr_lock.lock();
        let current = self.update_min(id)?;
        let missing = thresh.wrapping_sub(current);
        if (missing as i32) <= 0 {
            return Ok(current);
        }
        log::debug!("syncpt: cpu increment {} by {} to {}", id, missing, thresh);
        for _ in 0..missing {
            self.backend.cpu_incr(id)?;
        }
        self.update_min(id)
    }

    /// Check `thresh` against the cached shadows.
    pub fn is_expired(&self, id: SyncpointId, thresh: u32) -> bool {
        let current = self.read_min(id);
        let future = self.read_max(id);
        is_expired(current, future, !self.is_client_managed(id), thresh)
    }

    fn update_min_is_expired(&self, id: SyncpointId, thresh: u32) -> Result<bool> {
        self.update_min(id)?;
        Ok(self.is_expired(id, thresh))
    }

    /// Order two thresholds of the same syncpoint by when they trigger.
    pub fn compare(&self, id: SyncpointId, a: u32, b: u32) -> CmpOrdering {
        let current = self.read_min(id);
        let future = self.read_max(id);
        compare(current, future, !self.is_client_managed(id), a, b)
    }

    /// Rewrite hardware from the shadows, after a reset or power loss.
    pub fn reset_all(&self) -> Result<()> {
        for id in 0..self.num_syncpoints() {
            self.backend.write(id, self.read_min(id))?;
        }
        Ok(())
    }

    /// Refresh shadows from hardware before it loses state.
    pub fn save(&self) -> Result<()> {
        for id in 0..self.num_syncpoints() {
            if !self.is_assigned(id) {
                continue;
            }
            let value = self.update_min(id)?;
            if !self.is_client_managed(id) && value != self.read_max(id) {
                log::warn!(
                    "syncpt: {} saved with pending work (min {} max {})",
                    id,
                    value,
                    self.read_max(id)
                );
            }
        }
        Ok(())
    }

    // ── Waiting ─────────────────────────────────────────────────────────

    /// Register `action` to run when `id` reaches `thresh`.
    ///
    /// Actions are driven by interrupts where the backend has them and by
    /// [`poll_waiters`](Self::poll_waiters) otherwise.
    pub fn notify_at(&self, id: SyncpointId, thresh: u32, action: WaitAction) -> WaiterRef {
        let waiter = self.intr.add_action(id, thresh, action);
        // Catch an increment that landed before the waiter was visible.
        if self.is_expired(id, thresh) {
            self.intr.handle_syncpt(id, |t| self.is_expired(id, t));
        }
        waiter
    }

    /// Handle an increment reported by the hardware.
    pub fn handle_syncpt_event(&self, id: SyncpointId) {
        if let Err(e) = self.update_min(id) {
            log::warn!("syncpt: read of {} after interrupt failed: {}", id, e);
            return;
        }
        self.intr.handle_syncpt(id, |thresh| self.is_expired(id, thresh));
    }

    /// Re-read every syncpoint with registered waiters and fire expired ones.
    pub fn poll_waiters(&self) {
        for id in 0..self.num_syncpoints() {
            if self.intr.pending(id) > 0 {
                self.handle_syncpt_event(id);
            }
        }
    }

    /// Block until syncpoint `id` reaches `thresh`.
    ///
    /// `timeout` of `None` waits forever; `Some(ZERO)` only checks. A
    /// cancelled `cancel` token ends the wait with `Interrupted`. Returns the
    /// value observed when the threshold was met.
    pub fn wait(
        &self,
        id: SyncpointId,
        thresh: u32,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<u32> {
        self.check_id(id)?;

        if self.is_expired(id, thresh) {
            return Ok(self.read_min(id));
        }
        let value = self.update_min(id)?;
        if self.is_expired(id, thresh) {
            return Ok(value);
        }
        if timeout == Some(Duration::ZERO) {
            return Err(HostError::timeout(format!(
                "syncpoint {id} at {value}, threshold {thresh}"
            )));
        }

        let poll = !self.interrupts;
        let event = WaitEvent::new();
        let waiter = if poll {
            None
        } else {
            Some(self.intr.add_action(id, thresh, WaitAction::Wakeup(event.clone())))
        };

        let result = self.wait_checked(id, thresh, timeout, cancel, &event, poll);

        if let Some(waiter) = waiter {
            self.intr.put_ref(waiter);
        }
        result
    }

    fn wait_checked(
        &self,
        id: SyncpointId,
        thresh: u32,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
        event: &WaitEvent,
        poll: bool,
    ) -> Result<u32> {
        let check_period = self.config.check_period;
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let low_timeout = timeout.is_some_and(|t| t < check_period);
        let mut last = self.read_min(id);
        let mut check_count = 0;

        loop {
            let now = Instant::now();
            let mut check_end = now + check_period;
            if let Some(deadline) = deadline {
                if deadline <= now {
                    break;
                }
                check_end = check_end.min(deadline);
            }

            if let Some(value) = self.sleep_until(id, thresh, check_end, cancel, event, poll)? {
                return Ok(value);
            }

            let value = self.update_min(id)?;
            if self.is_expired(id, thresh) {
                return Ok(value);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }

            if check_count <= self.config.max_stuck_checks {
                if value == last {
                    log::warn!("syncpt: {} ({:?}) stuck at {}, waiting for {}", id, self.name(id), value, thresh);
                } else {
                    log::warn!(
                        "syncpt: {} ({:?}) progressing slowly: {} -> {}, waiting for {}",
                        id,
                        self.name(id),
                        last,
                        value,
                        thresh
                    );
                }
                if check_count == self.config.max_stuck_checks {
                    if low_timeout {
                        log::warn!(
                            "syncpt: timeout {:?} is below the check period, is timeout too low?",
                            timeout
                        );
                    }
                    self.debug_dump();
                }
                check_count += 1;
            }
            last = value;
        }

        Err(HostError::timeout(format!(
            "syncpoint {} at {}, threshold {}",
            id,
            self.read_min(id),
            thresh
        )))
    }

    /// Sleep until `until`, returning early with the value on expiry.
    fn sleep_until(
        &self,
        id: SyncpointId,
        thresh: u32,
        until: Instant,
        cancel: Option<&CancelToken>,
        event: &WaitEvent,
        poll: bool,
    ) -> Result<Option<u32>> {
        loop {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(HostError::Interrupted);
            }
            let expired = if poll || event.is_signaled() {
                self.update_min_is_expired(id, thresh)?
            } else {
                self.is_expired(id, thresh)
            };
            if expired {
                return Ok(Some(self.read_min(id)));
            }

            let now = Instant::now();
            if now >= until {
                return Ok(None);
            }
            let mut slice = until - now;
            if poll || cancel.is_some() {
                slice = slice.min(self.config.poll_period);
            }
            if poll {
                thread::sleep(slice);
            } else {
                event.wait_for(slice);
            }
        }
    }

    // ── Hardware mutexes ────────────────────────────────────────────────

    /// Acquire hardware mutex `index` without blocking; `Busy` if held.
    pub fn mutex_try_lock(&self, index: u32) -> Result<()> {
        let count = self
            .lock_counts
            .get(index as usize)
            .ok_or_else(|| HostError::invalid(format!("mutex index {index} out of range")))?;
        if !self.backend.mutex_try_lock(index)? {
            return Err(HostError::Busy);
        }
        count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn mutex_unlock(&self, index: u32) -> Result<()> {
        let count = self
            .lock_counts
            .get(index as usize)
            .ok_or_else(|| HostError::invalid(format!("mutex index {index} out of range")))?;
        if count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .is_err()
        {
            log::warn!("syncpt: unlock of mutex {} that is not held", index);
        }
        self.backend.mutex_unlock(index)
    }

    /// Number of times mutex `index` has been acquired and not released.
    pub fn mutex_lock_count(&self, index: u32) -> u32 {
        self.lock_counts
            .get(index as usize)
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Vec<SyncpointInfo> {
        let table = self.table.lock();
        (0..self.num_syncpoints())
            .filter(|&id| self.is_assigned(id))
            .map(|id| {
                let slot = &table[id as usize];
                SyncpointInfo {
                    id,
                    min: self.read_min(id),
                    max: self.read_max(id),
                    refs: self.read_ref(id),
                    client_managed: self.is_client_managed(id),
                    in_use: slot.in_use,
                    name: slot.name.clone(),
                }
            })
            .collect()
    }

    /// Log every assigned syncpoint.
    pub fn debug_dump(&self) {
        log::warn!("syncpt: ---- syncpoint dump ----");
        for info in self.snapshot() {
            log::warn!(
                "syncpt: id {:3} min {:10} max {:10} refs {} {} channel {:?} {}",
                info.id,
                info.min,
                info.max,
                info.refs,
                if info.client_managed { "client" } else { "host" },
                info.in_use,
                info.name.as_deref().unwrap_or("-")
            );
        }
    }
}

/// Wraparound-safe expiry test.
///
/// With a known future value the threshold is expired iff
/// `future - thresh >= current - thresh` (unsigned modular), which also
/// treats thresholds outside the `[current, future]` window as stale.
/// Without one, the signed distance from `thresh` to `current` decides.
pub fn is_expired(current: u32, future: u32, has_future: bool, thresh: u32) -> bool {
    if has_future {
        future.wrapping_sub(thresh) >= current.wrapping_sub(thresh)
    } else {
        (current.wrapping_sub(thresh) as i32) >= 0
    }
}

/// Order two thresholds by their modular distance from `reference`.
pub fn compare_ref(reference: u32, a: u32, b: u32) -> CmpOrdering {
    a.wrapping_sub(reference).cmp(&b.wrapping_sub(reference))
}

/// Order two thresholds of one syncpoint; expired thresholds come first.
pub fn compare(current: u32, future: u32, has_future: bool, a: u32, b: u32) -> CmpOrdering {
    if a == b {
        return CmpOrdering::Equal;
    }
    let a_expired = is_expired(current, future, has_future, a);
    let b_expired = is_expired(current, future, has_future, b);
    match (a_expired, b_expired) {
        (true, false) => CmpOrdering::Less,
        (false, true) => CmpOrdering::Greater,
        _ => compare_ref(current, a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;
    use crate::hardware::Host1xHardware;
    use crate::memory::BufferRegistry;

    fn settings() -> HostSettings {
        HostSettings {
            num_syncpoints: 8,
            num_mutexes: 2,
            syncpt_free_wait_ms: 50,
            syncpt_check_period_ms: 20,
            max_stuck_checks: 2,
            ..HostSettings::default()
        }
    }

    fn manager_with(settings: &HostSettings) -> (Arc<Host1xHardware>, SyncpointManager) {
        let hw = Arc::new(Host1xHardware::new(
            settings.num_syncpoints,
            settings.num_mutexes,
            1,
            16,
            Arc::new(BufferRegistry::new()),
        ));
        let backend = Arc::new(LocalBackend::new(hw.clone()));
        let intr = Arc::new(Intr::new(settings.num_syncpoints));
        (hw, SyncpointManager::new(backend, intr, settings))
    }

    fn manager() -> (Arc<Host1xHardware>, SyncpointManager) {
        manager_with(&settings())
    }

    /// Deterministic stride over the full u32 space plus the wrap edges.
    fn sample_values() -> Vec<u32> {
        let mut values = vec![0, 1, 2, 0x7FFF_FFFE, 0x7FFF_FFFF, 0x8000_0000, 0x8000_0001];
        values.extend([u32::MAX - 2, u32::MAX - 1, u32::MAX]);
        let mut x: u32 = 0x9E37_79B9;
        for _ in 0..48 {
            x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            values.push(x);
        }
        values
    }

    #[test]
    fn test_is_expired_untracked() {
        assert!(is_expired(5, 0, false, 3));
        assert!(is_expired(3, 0, false, 3));
        assert!(!is_expired(2, 0, false, 3));
        // Just wrapped past the threshold.
        assert!(is_expired(0, 0, false, u32::MAX));
        assert!(!is_expired(u32::MAX, 0, false, 0));
    }

    #[test]
    fn test_is_expired_tracked_window() {
        // current 5, future 10
        assert!(is_expired(5, 10, true, 3));
        assert!(is_expired(5, 10, true, 5));
        assert!(!is_expired(5, 10, true, 6));
        assert!(!is_expired(5, 10, true, 10));
        // Outside the window: stale.
        assert!(is_expired(5, 10, true, 11));

        // Window straddling the wrap.
        let current = u32::MAX - 1;
        let future = 3;
        assert!(is_expired(current, future, true, u32::MAX - 1));
        assert!(!is_expired(current, future, true, u32::MAX));
        assert!(!is_expired(current, future, true, 0));
        assert!(!is_expired(current, future, true, 3));
    }

    #[test]
    fn test_is_expired_matches_modular_definition() {
        let values = sample_values();
        for &current in &values {
            for &delta in &[0u32, 1, 7, 0x4000_0000, 0x7FFF_FFFF] {
                let future = current.wrapping_add(delta);
                for &thresh in &values {
                    let dist_future = future.wrapping_sub(thresh);
                    let dist_current = current.wrapping_sub(thresh);
                    assert_eq!(
                        is_expired(current, future, true, thresh),
                        dist_future >= dist_current
                    );
                    assert_eq!(
                        is_expired(current, future, false, thresh),
                        dist_current < 0x8000_0000
                    );
                }
                // Everything inside [current+1, future] is pending.
                for step in [1u32, delta / 2, delta] {
                    if step == 0 || step > delta {
                        continue;
                    }
                    assert!(!is_expired(current, future, true, current.wrapping_add(step)));
                }
            }
        }
    }

    #[test]
    fn test_compare_ref_across_wrap() {
        let reference = u32::MAX - 5;
        assert_eq!(compare_ref(reference, u32::MAX, 2), CmpOrdering::Less);
        assert_eq!(compare_ref(reference, 2, u32::MAX), CmpOrdering::Greater);
        assert_eq!(compare_ref(reference, 7, 7), CmpOrdering::Equal);
    }

    #[test]
    fn test_compare_is_antisymmetric() {
        let values = sample_values();
        for &current in &values {
            let future = current.wrapping_add(1000);
            for &a in &values {
                for b in [a.wrapping_add(1), current.wrapping_add(500), current] {
                    let ab = compare(current, future, true, a, b);
                    let ba = compare(current, future, true, b, a);
                    assert_eq!(ab, ba.reverse());
                }
            }
        }
    }

    #[test]
    fn test_compare_expired_first() {
        // current 100, a expired, b pending even though b < a numerically
        // after wrapping.
        assert_eq!(compare(100, 200, true, 90, 150), CmpOrdering::Less);
        assert_eq!(compare(100, 200, true, 150, 90), CmpOrdering::Greater);
        assert_eq!(compare(100, 200, true, 120, 180), CmpOrdering::Less);
        let current = u32::MAX - 10;
        assert_eq!(
            compare(current, current.wrapping_add(40), true, u32::MAX, 5),
            CmpOrdering::Less
        );
    }

    #[test]
    fn test_graphics_host_reserved() {
        let (_hw, sp) = manager();
        assert!(sp.is_assigned(GRAPHICS_HOST_SYNCPT));
        assert!(sp.is_expired(GRAPHICS_HOST_SYNCPT, 0));
        sp.free(GRAPHICS_HOST_SYNCPT);
        assert!(sp.is_assigned(GRAPHICS_HOST_SYNCPT));
    }

    #[test]
    fn test_allocate_and_free() {
        let (_hw, sp) = manager();
        let id = sp.allocate(SyncpointKind::HostManaged, "gr2d").unwrap();
        assert!(id >= FIRST_ALLOCATABLE);
        assert!(sp.is_assigned(id));
        assert!(!sp.is_client_managed(id));
        assert_eq!(sp.read_ref(id), 1);
        assert_eq!(sp.name(id).as_deref(), Some("gr2d"));

        sp.get_ref(id).unwrap();
        sp.free(id);
        assert!(sp.is_assigned(id));
        sp.free(id);
        assert!(!sp.is_assigned(id));
        assert_eq!(sp.last_used_by(id).as_deref(), Some("gr2d"));
    }

    #[test]
    fn test_allocate_exhaustion() {
        let (_hw, sp) = manager();
        let ids: Vec<_> = (FIRST_ALLOCATABLE..8)
            .map(|_| sp.allocate(SyncpointKind::ClientManaged, "fill").unwrap())
            .collect();
        assert_eq!(ids.len(), 7);
        let start = Instant::now();
        assert_eq!(
            sp.allocate(SyncpointKind::ClientManaged, "late"),
            Err(HostError::ResourceExhausted("syncpoint"))
        );
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_allocate_waits_for_free() {
        let (_hw, sp) = manager_with(&HostSettings {
            syncpt_free_wait_ms: 2000,
            ..settings()
        });
        let sp = Arc::new(sp);
        let ids: Vec<_> = (FIRST_ALLOCATABLE..8)
            .map(|_| sp.allocate(SyncpointKind::ClientManaged, "fill").unwrap())
            .collect();

        let sp2 = sp.clone();
        let handle = thread::spawn(move || sp2.allocate(SyncpointKind::HostManaged, "waiter"));
        thread::sleep(Duration::from_millis(20));
        sp.free(ids[3]);
        assert_eq!(handle.join().unwrap(), Ok(ids[3]));
    }

    #[test]
    fn test_free_client_managed_sets_min_eq_max() {
        let (hw, sp) = manager();
        let id = sp.allocate(SyncpointKind::ClientManaged, "user").unwrap();
        sp.incr(id).unwrap();
        // Increment from a command stream, invisible to the shadows.
        hw.syncpt_cpu_incr(id).unwrap();
        sp.free(id);
        assert_eq!(sp.read_min(id), 2);
        assert!(sp.min_eq_max(id));
        assert_eq!(hw.syncpt_read(id).unwrap(), 2);
    }

    #[test]
    fn test_free_host_managed_waits_for_max() {
        let (hw, sp) = manager();
        let sp = Arc::new(sp);
        let id = sp.allocate(SyncpointKind::HostManaged, "busy").unwrap();
        sp.incr_max(id, 1);

        let hw2 = hw.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            hw2.syncpt_cpu_incr(id).unwrap();
        });
        sp.free(id);
        handle.join().unwrap();
        assert!(!sp.is_assigned(id));
        assert_eq!(sp.read_min(id), 1);
    }

    #[test]
    fn test_update_min_is_monotonic() {
        let (hw, sp) = manager();
        let id = sp.allocate(SyncpointKind::ClientManaged, "mono").unwrap();
        hw.syncpt_write(id, 10).unwrap();
        assert_eq!(sp.update_min(id).unwrap(), 10);
        // A stale hardware value never moves the shadow backwards.
        hw.syncpt_write(id, 4).unwrap();
        assert_eq!(sp.update_min(id).unwrap(), 10);
    }

    #[test]
    fn test_update_min_clamps_to_max() {
        let (hw, sp) = manager();
        let id = sp.allocate(SyncpointKind::HostManaged, "clamp").unwrap();
        sp.incr_max(id, 2);
        hw.syncpt_write(id, 5).unwrap();
        assert_eq!(sp.update_min(id).unwrap(), 2);
        assert_eq!(sp.read_max(id), 2);
    }

    #[test]
    fn test_min_never_exceeds_max_under_contention() {
        let (hw, sp) = manager();
        let sp = Arc::new(sp);
        let id = sp.allocate(SyncpointKind::HostManaged, "race").unwrap();
        // Start close to the wrap so the race crosses it.
        let base = u32::MAX - 500;
        hw.syncpt_write(id, base).unwrap();
        sp.max[id as usize].store(base, Ordering::Release);
        sp.min[id as usize].store(base, Ordering::Release);

        let producer = {
            let sp = sp.clone();
            let hw = hw.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    sp.incr_max(id, 1);
                    hw.syncpt_cpu_incr(id).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let sp = sp.clone();
                thread::spawn(move || {
                    for _ in 0..2000 {
                        sp.update_min(id).unwrap();
                        let min = sp.read_min(id);
                        let max = sp.read_max(id);
                        assert!((max.wrapping_sub(min) as i32) >= 0, "min {min} max {max}");
                    }
                })
            })
            .collect();

        producer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(sp.update_min(id).unwrap(), base.wrapping_add(1000));
        assert!(sp.min_eq_max(id));
    }

    #[test]
    fn test_incr_moves_max() {
        let (_hw, sp) = manager();
        let id = sp.allocate(SyncpointKind::ClientManaged, "cpu").unwrap();
        sp.incr(id).unwrap();
        sp.incr(id).unwrap();
        assert_eq!(sp.read_max(id), 2);
        assert_eq!(sp.read(id).unwrap(), 2);
    }

    #[test]
    fn test_cpu_incr_to() {
        let (_hw, sp) = manager();
        let id = sp.allocate(SyncpointKind::HostManaged, "force").unwrap();
        let target = sp.incr_max(id, 4);
        assert_eq!(sp.cpu_incr_to(id, target).unwrap(), 4);
        assert!(sp.is_expired(id, target));
        // Already there: no further increments.
        assert_eq!(sp.cpu_incr_to(id, 2).unwrap(), 4);
    }

    #[test]
    fn test_wait_already_expired() {
        let (hw, sp) = manager();
        let id = sp.allocate(SyncpointKind::ClientManaged, "w").unwrap();
        hw.syncpt_write(id, 2).unwrap();
        assert_eq!(sp.wait(id, 1, Some(Duration::ZERO), None).unwrap(), 2);
    }

    #[test]
    fn test_wait_zero_timeout_does_not_block() {
        let (_hw, sp) = manager();
        let id = sp.allocate(SyncpointKind::ClientManaged, "w").unwrap();
        assert!(matches!(
            sp.wait(id, 1, Some(Duration::ZERO), None),
            Err(HostError::Timeout(_))
        ));
    }

    #[test]
    fn test_wait_timeout() {
        let (_hw, sp) = manager();
        let id = sp.allocate(SyncpointKind::ClientManaged, "w").unwrap();
        let start = Instant::now();
        assert!(matches!(
            sp.wait(id, 10, Some(Duration::from_millis(50)), None),
            Err(HostError::Timeout(_))
        ));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_wait_polls_without_interrupts() {
        let (hw, sp) = manager();
        assert!(!sp.has_interrupts());
        let sp = Arc::new(sp);
        let id = sp.allocate(SyncpointKind::ClientManaged, "poll").unwrap();
        let sp2 = sp.clone();
        let handle = thread::spawn(move || sp2.wait(id, 3, Some(Duration::from_secs(2)), None));
        thread::sleep(Duration::from_millis(20));
        for _ in 0..3 {
            hw.syncpt_cpu_incr(id).unwrap();
        }
        assert_eq!(handle.join().unwrap(), Ok(3));
    }

    #[test]
    fn test_wait_woken_by_interrupt() {
        let settings = settings();
        let hw = Arc::new(Host1xHardware::new(8, 2, 1, 16, Arc::new(BufferRegistry::new())));
        let backend = Arc::new(LocalBackend::with_interrupts(hw.clone()));
        let intr = Arc::new(Intr::new(8));
        let sp = Arc::new(SyncpointManager::new(backend, intr, &settings));
        assert!(sp.has_interrupts());
        let id = sp.allocate(SyncpointKind::ClientManaged, "irq").unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        hw.set_irq_sink(tx.clone());
        let sp_irq = sp.clone();
        let irq_thread = thread::spawn(move || {
            while let Ok(crate::intr::HostEvent::Syncpt(id)) = rx.recv() {
                sp_irq.handle_syncpt_event(id);
            }
        });

        let sp2 = sp.clone();
        let handle = thread::spawn(move || sp2.wait(id, 1, None, None));
        thread::sleep(Duration::from_millis(20));
        hw.syncpt_cpu_incr(id).unwrap();
        assert_eq!(handle.join().unwrap(), Ok(1));

        tx.send(crate::intr::HostEvent::Shutdown).unwrap();
        irq_thread.join().unwrap();
    }

    #[test]
    fn test_wait_cancelled() {
        let (_hw, sp) = manager();
        let sp = Arc::new(sp);
        let id = sp.allocate(SyncpointKind::ClientManaged, "cancel").unwrap();
        let token = CancelToken::new();
        let t2 = token.clone();
        let sp2 = sp.clone();
        let handle = thread::spawn(move || sp2.wait(id, 5, None, Some(&t2)));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert_eq!(handle.join().unwrap(), Err(HostError::Interrupted));
    }

    #[test]
    fn test_wait_invalid_id() {
        let (_hw, sp) = manager();
        assert!(matches!(
            sp.wait(99, 1, None, None),
            Err(HostError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_mutex_lock_counts() {
        let (_hw, sp) = manager();
        sp.mutex_try_lock(1).unwrap();
        assert_eq!(sp.mutex_try_lock(1), Err(HostError::Busy));
        assert_eq!(sp.mutex_lock_count(1), 1);
        sp.mutex_unlock(1).unwrap();
        assert_eq!(sp.mutex_lock_count(1), 0);
        sp.mutex_try_lock(1).unwrap();
        assert!(sp.mutex_try_lock(2).is_err());
    }

    #[test]
    fn test_mark_used_holds_reference() {
        let (_hw, sp) = manager();
        let id = sp.allocate(SyncpointKind::HostManaged, "ch").unwrap();
        sp.mark_used(3, id).unwrap();
        assert_eq!(sp.in_use(id), Some(3));
        sp.free(id);
        assert!(sp.is_assigned(id));
        sp.mark_unused(3, id);
        assert!(!sp.is_assigned(id));
    }

    #[test]
    fn test_notify_at_already_expired_fires() {
        let (hw, sp) = manager();
        let id = sp.allocate(SyncpointKind::ClientManaged, "n").unwrap();
        hw.syncpt_write(id, 1).unwrap();
        sp.update_min(id).unwrap();
        let event = WaitEvent::new();
        sp.notify_at(id, 1, WaitAction::Wakeup(event.clone()));
        assert!(event.is_signaled());
    }

    #[test]
    fn test_poll_waiters_fires_after_hardware_moves() {
        let (hw, sp) = manager();
        let id = sp.allocate(SyncpointKind::ClientManaged, "p").unwrap();
        let event = WaitEvent::new();
        sp.notify_at(id, 2, WaitAction::Wakeup(event.clone()));
        hw.syncpt_write(id, 2).unwrap();
        assert!(!event.is_signaled());
        sp.poll_waiters();
        assert!(event.is_signaled());
    }

    #[test]
    fn test_reset_all_and_save() {
        let (hw, sp) = manager();
        let id = sp.allocate(SyncpointKind::ClientManaged, "r").unwrap();
        hw.syncpt_write(id, 7).unwrap();
        sp.save().unwrap();
        assert_eq!(sp.read_min(id), 7);
        hw.syncpt_write(id, 0).unwrap();
        sp.reset_all().unwrap();
        assert_eq!(hw.syncpt_read(id).unwrap(), 7);
    }

    #[test]
    fn test_snapshot_lists_assigned() {
        let (_hw, sp) = manager();
        let id = sp.allocate(SyncpointKind::HostManaged, "snap").unwrap();
        sp.set_name(id, "renamed").unwrap();
        let snapshot = sp.snapshot();
        assert_eq!(snapshot.len(), 2);
        let info = snapshot.iter().find(|i| i.id == id).unwrap();
        assert_eq!(info.name.as_deref(), Some("renamed"));
        assert!(!info.client_managed);
        assert!(sp.set_name(7, "nope").is_err());
    }
}
