// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Hardware channels and the pool that multiplexes them.
//!
//! A channel is bound to the opaque identifier of a submitter, not to a slot
//! number. Mapping an identifier that already owns a live channel returns that
//! channel; otherwise the caller waits for a free slot. Blocked callers are
//! served in arrival order.
//!
//! Lock order: `alloc` before `list`. The list lock alone guards lookups.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use nvhost_common::settings::{HostSettings, ResourcePolicy};
use nvhost_common::{ChannelId, Fence, HostError, Identifier, Result, SyncpointId, MODULE_MAX_SYNCPTS};

use crate::backend::{Backends, CdmaBackend, ChannelBackend};
use crate::cdma::{Cdma, CdmaConfig};
use crate::intr::WaitAction;
use crate::job::{CompletionToken, Job, SubmitFlags, SyncFence};
use crate::syncpoint::{SyncpointKind, SyncpointManager};

/// Address-space context shared by every binding of one identifier.
#[derive(Debug)]
pub struct VmContext {
    pub identifier: Identifier,
    pub asid: u32,
}

pub struct Channel {
    id: ChannelId,
    identifier: Identifier,
    class_id: u32,
    policy: ResourcePolicy,
    refs: AtomicU32,
    vm: Mutex<Option<Arc<VmContext>>>,
    cdma: Arc<Cdma>,
    syncpoints: Arc<SyncpointManager>,
    bound: Mutex<[Option<SyncpointId>; MODULE_MAX_SYNCPTS]>,
    client_managed: Mutex<Option<SyncpointId>>,
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    pub fn class_id(&self) -> u32 {
        self.class_id
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn vm(&self) -> Option<Arc<VmContext>> {
        self.vm.lock().clone()
    }

    pub fn cdma(&self) -> &Arc<Cdma> {
        &self.cdma
    }

    /// Host-managed syncpoint in per-channel slot `index`, allocated on
    /// first use.
    pub fn get_syncpoint(&self, index: usize) -> Result<SyncpointId> {
        let mut bound = self.bound.lock();
        let slot = bound
            .get_mut(index)
            .ok_or_else(|| HostError::invalid(format!("syncpoint index {index}")))?;
        if let Some(id) = *slot {
            return Ok(id);
        }
        let name = format!("ch{}_{}", self.id, index);
        let id = self.syncpoints.allocate(SyncpointKind::HostManaged, &name)?;
        if let Err(e) = self.syncpoints.mark_used(self.id, id) {
            self.syncpoints.free(id);
            return Err(e);
        }
        *slot = Some(id);
        Ok(id)
    }

    /// Syncpoints currently bound to this channel.
    pub fn bound_syncpoints(&self) -> Vec<SyncpointId> {
        self.bound.lock().iter().flatten().copied().collect()
    }

    pub fn client_managed_syncpoint(&self) -> Option<SyncpointId> {
        *self.client_managed.lock()
    }

    /// The channel's client-managed syncpoint, allocated under `name` on
    /// first use.
    pub fn get_client_managed_syncpoint(&self, name: &str) -> Result<SyncpointId> {
        let mut client_managed = self.client_managed.lock();
        if let Some(id) = *client_managed {
            return Ok(id);
        }
        let id = self.syncpoints.allocate(SyncpointKind::ClientManaged, name)?;
        *client_managed = Some(id);
        Ok(id)
    }

    /// Give back the client-managed syncpoint `id`.
    pub fn free_client_managed_syncpoint(&self, id: SyncpointId) -> Result<()> {
        let mut client_managed = self.client_managed.lock();
        if *client_managed != Some(id) {
            return Err(HostError::invalid(format!(
                "syncpt {} is not the client-managed syncpoint of channel {}",
                id, self.id
            )));
        }
        *client_managed = None;
        self.syncpoints.free(id);
        Ok(())
    }

    /// Pin `job`, stream it into the command queue and arm completion
    /// tracking for its fences.
    ///
    /// Jobs of a context that already timed out are refused. If the queue
    /// faults while publishing, the job has been completed on the CPU by the
    /// time the error is returned.
    pub fn submit(&self, mut job: Job, flags: SubmitFlags) -> Result<CompletionToken> {
        if job.has_timed_out() {
            return Err(HostError::timeout(format!(
                "channel {} client {} has timed out",
                self.id, job.client
            )));
        }
        job.set_default_class(self.class_id);
        job.pin(&self.syncpoints, self.policy)?;

        let mut submission = self.cdma.begin(job.slots_needed())?;
        submission.push_job(&job)?;
        let fences: Vec<Fence> = job
            .syncpt_incrs()
            .iter()
            .map(|incr| Fence::new(incr.syncpt_id, self.syncpoints.incr_max(incr.syncpt_id, incr.incrs)))
            .collect();
        job.set_fences(fences.clone());
        log::debug!("channel: {} submit fences {:?}", self.id, fences);
        submission.end(Arc::new(job))?;

        for fence in &fences {
            let cdma = Arc::downgrade(&self.cdma);
            self.syncpoints.notify_at(
                fence.id,
                fence.thresh,
                WaitAction::Callback(Box::new(move || {
                    if let Some(cdma) = cdma.upgrade() {
                        cdma.update();
                    }
                })),
            );
        }

        Ok(if flags.contains(SubmitFlags::SYNC_FENCE_FD) {
            CompletionToken::SyncFence(SyncFence::new(&fences, &self.syncpoints))
        } else {
            CompletionToken::Fences(fences)
        })
    }

    fn release_syncpoints(&self) {
        let bound = std::mem::take(&mut *self.bound.lock());
        for id in bound.into_iter().flatten() {
            // Allocation reference plus the binding.
            if self.syncpoints.read_ref(id) > 2 {
                log::debug!("channel: {} syncpt {} still referenced, deferring release", self.id, id);
            }
            self.syncpoints.mark_unused(self.id, id);
            self.syncpoints.free(id);
        }
        if let Some(id) = self.client_managed.lock().take() {
            self.syncpoints.free(id);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("identifier", &self.identifier)
            .field("refs", &self.refs())
            .finish()
    }
}

struct AllocState {
    used: Vec<bool>,
    tickets: VecDeque<u64>,
    next_ticket: u64,
}

struct ListState {
    channels: Vec<Option<Arc<Channel>>>,
    vms: HashMap<Identifier, Weak<VmContext>>,
    next_asid: u32,
}

pub struct ChannelPool {
    backend: Arc<dyn ChannelBackend>,
    cdma_backend: Arc<dyn CdmaBackend>,
    syncpoints: Arc<SyncpointManager>,
    class_id: u32,
    policy: ResourcePolicy,
    cdma_config: CdmaConfig,
    alloc: Mutex<AllocState>,
    slot_freed: Condvar,
    list: Mutex<ListState>,
}

impl ChannelPool {
    pub fn new(backends: &Backends, syncpoints: Arc<SyncpointManager>, settings: &HostSettings) -> Self {
        let num_channels = settings.num_channels.max(1) as usize;
        Self {
            backend: backends.channel.clone(),
            cdma_backend: backends.cdma.clone(),
            syncpoints,
            class_id: settings.device_class,
            policy: settings.resource_policy,
            cdma_config: CdmaConfig {
                slots: settings.push_buffer_slots,
                teardown_policy: settings.teardown_policy,
                poll_period: settings.poll_period(),
                flush_timeout: Duration::from_millis(settings.default_timeout_ms as u64),
            },
            alloc: Mutex::new(AllocState {
                used: vec![false; num_channels],
                tickets: VecDeque::new(),
                next_ticket: 0,
            }),
            slot_freed: Condvar::new(),
            list: Mutex::new(ListState {
                channels: vec![None; num_channels],
                vms: HashMap::new(),
                next_asid: 1,
            }),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.alloc.lock().used.len()
    }

    pub fn live_channels(&self) -> usize {
        self.alloc.lock().used.iter().filter(|&&u| u).count()
    }

    /// Channel bound to `identifier`, binding a free slot if needed.
    /// Blocks while every slot is taken.
    pub fn map(&self, identifier: Identifier) -> Result<Arc<Channel>> {
        self.map_inner(identifier, None)
    }

    /// Like [`map`](Self::map) but gives up with `ResourceExhausted` after
    /// `timeout`.
    pub fn map_timeout(&self, identifier: Identifier, timeout: Duration) -> Result<Arc<Channel>> {
        self.map_inner(identifier, Some(Instant::now() + timeout))
    }

    fn map_inner(&self, identifier: Identifier, deadline: Option<Instant>) -> Result<Arc<Channel>> {
        if let Some(channel) = self.lookup(identifier) {
            return Ok(channel);
        }

        let mut alloc = self.alloc.lock();
        let ticket = alloc.next_ticket;
        alloc.next_ticket += 1;
        alloc.tickets.push_back(ticket);
        let slot = loop {
            // Someone may have bound the identifier while we waited.
            if let Some(channel) = self.lookup(identifier) {
                alloc.tickets.retain(|&t| t != ticket);
                self.slot_freed.notify_all();
                return Ok(channel);
            }
            if alloc.tickets.front() == Some(&ticket) {
                if let Some(slot) = alloc.used.iter().position(|&u| !u) {
                    break slot;
                }
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        alloc.tickets.retain(|&t| t != ticket);
                        self.slot_freed.notify_all();
                        log::warn!("channel: no free channel for {}", identifier);
                        return Err(HostError::ResourceExhausted("channel"));
                    }
                    self.slot_freed.wait_for(&mut alloc, deadline - now);
                }
                None => self.slot_freed.wait(&mut alloc),
            }
        };
        alloc.tickets.pop_front();

        let id = slot as ChannelId;
        let cdma = match self.bind(id) {
            Ok(cdma) => cdma,
            Err(e) => {
                self.slot_freed.notify_all();
                return Err(e);
            }
        };
        alloc.used[slot] = true;

        let channel = {
            let mut list = self.list.lock();
            let vm = Self::vm_for(&mut list, identifier);
            let channel = Arc::new(Channel {
                id,
                identifier,
                class_id: self.class_id,
                policy: self.policy,
                refs: AtomicU32::new(1),
                vm: Mutex::new(Some(vm)),
                cdma,
                syncpoints: self.syncpoints.clone(),
                bound: Mutex::new([None; MODULE_MAX_SYNCPTS]),
                client_managed: Mutex::new(None),
            });
            list.channels[slot] = Some(channel.clone());
            channel
        };
        drop(alloc);
        self.slot_freed.notify_all();
        log::debug!("channel: mapped {} to channel {}", identifier, id);
        Ok(channel)
    }

    fn bind(&self, id: ChannelId) -> Result<Arc<Cdma>> {
        self.backend.init(id, self.class_id)?;
        match Cdma::new(id, self.cdma_backend.clone(), self.syncpoints.clone(), self.cdma_config.clone()) {
            Ok(cdma) => Ok(Arc::new(cdma)),
            Err(e) => {
                if let Err(e) = self.backend.deinit(id) {
                    log::warn!("channel: deinit of {} failed: {}", id, e);
                }
                Err(e)
            }
        }
    }

    fn vm_for(list: &mut ListState, identifier: Identifier) -> Arc<VmContext> {
        if let Some(vm) = list.vms.get(&identifier).and_then(Weak::upgrade) {
            return vm;
        }
        let vm = Arc::new(VmContext {
            identifier,
            asid: list.next_asid,
        });
        list.next_asid = list.next_asid.wrapping_add(1).max(1);
        list.vms.retain(|_, vm| vm.strong_count() > 0);
        list.vms.insert(identifier, Arc::downgrade(&vm));
        vm
    }

    /// Live channel of `identifier`, with a new reference taken.
    fn lookup(&self, identifier: Identifier) -> Option<Arc<Channel>> {
        let list = self.list.lock();
        let channel = list
            .channels
            .iter()
            .flatten()
            .find(|c| c.identifier == identifier)?;
        channel
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| (r > 0).then(|| r + 1))
            .ok()?;
        Some(channel.clone())
    }

    /// Live channel of `identifier` without touching its reference count.
    pub fn find(&self, identifier: Identifier) -> Option<Arc<Channel>> {
        self.list
            .lock()
            .channels
            .iter()
            .flatten()
            .find(|c| c.identifier == identifier && c.refs() > 0)
            .cloned()
    }

    pub fn get(&self, channel: &Channel) -> Result<()> {
        channel
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| (r > 0).then(|| r + 1))
            .map(|_| ())
            .map_err(|_| HostError::invalid(format!("channel {} is not live", channel.id)))
    }

    /// Drop a reference; the last one unbinds the channel.
    pub fn put(&self, channel: &Channel) {
        match channel
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
        {
            Ok(1) => self.unmap(channel),
            Ok(_) => {}
            Err(_) => log::warn!("channel: unbalanced put of {}", channel.id),
        }
    }

    fn unmap(&self, channel: &Channel) {
        log::debug!("channel: unmapping {} from {}", channel.id, channel.identifier);
        channel.cdma.stop();
        channel.release_syncpoints();
        channel.vm.lock().take();
        if let Err(e) = self.backend.deinit(channel.id) {
            log::warn!("channel: deinit of {} failed: {}", channel.id, e);
        }

        let slot = channel.id as usize;
        let mut alloc = self.alloc.lock();
        {
            let mut list = self.list.lock();
            list.channels[slot] = None;
            list.vms.retain(|_, vm| vm.strong_count() > 0);
        }
        alloc.used[slot] = false;
        drop(alloc);
        self.slot_freed.notify_all();
    }

    /// Force teardown of the channel bound to `identifier` and drop the
    /// caller's reference, even if stopping the hardware fails.
    pub fn abort(&self, identifier: Identifier) -> Result<()> {
        let channel = self
            .find(identifier)
            .ok_or_else(|| HostError::invalid(format!("no channel bound to {identifier}")))?;
        log::warn!("channel: aborting {} ({})", channel.id, identifier);
        let result = channel.cdma.abort();
        self.put(&channel);
        result
    }

    /// Run `f` on every live channel, outside the pool locks.
    pub fn for_each_channel(&self, mut f: impl FnMut(&Arc<Channel>)) {
        let channels: Vec<Arc<Channel>> = self.list.lock().channels.iter().flatten().cloned().collect();
        for channel in &channels {
            f(channel);
        }
    }

    pub fn vm_count(&self) -> usize {
        self.list
            .lock()
            .vms
            .values()
            .filter(|vm| vm.strong_count() > 0)
            .count()
    }
}
