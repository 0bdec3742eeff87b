// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Hardware access abstraction.
//!
//! Each component talks to the hardware through its own trait. The local
//! backend touches the host1x register model directly; the virtual backend
//! turns every call into a request message for a remote authority.

pub mod local;
pub mod virt;

use std::sync::Arc;

use nvhost_common::{ChannelId, Fence, Result, SyncpointId};

/// Syncpoint and hardware mutex primitives.
pub trait SyncpointBackend: Send + Sync {
    /// Current hardware value of a syncpoint.
    fn read(&self, id: SyncpointId) -> Result<u32>;
    /// Overwrite the hardware value (reset/restore).
    fn write(&self, id: SyncpointId, value: u32) -> Result<()>;
    fn cpu_incr(&self, id: SyncpointId) -> Result<()>;
    /// Returns `true` if the mutex was acquired.
    fn mutex_try_lock(&self, index: u32) -> Result<bool>;
    fn mutex_unlock(&self, index: u32) -> Result<()>;
    /// Whether syncpoint threshold interrupts are delivered locally.
    fn has_interrupts(&self) -> bool {
        false
    }
}

/// New push-buffer contents published to a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Kick {
    /// Write cursor (slot index) after these words.
    pub put: u32,
    /// Opcode words in fetch order.
    pub words: Vec<u32>,
    /// Fences of the jobs these words complete.
    pub fences: Vec<Fence>,
}

/// Channel DMA control.
pub trait CdmaBackend: Send + Sync {
    fn start(&self, channel: ChannelId) -> Result<()>;
    fn stop(&self, channel: ChannelId) -> Result<()>;
    /// Publish new words to the channel's fetch engine.
    fn kick(&self, channel: ChannelId, kick: &Kick) -> Result<()>;
    /// Drop everything the channel has fetched but not yet executed.
    fn teardown(&self, channel: ChannelId) -> Result<()>;
}

/// Channel binding and module register access.
pub trait ChannelBackend: Send + Sync {
    fn init(&self, channel: ChannelId, class_id: u32) -> Result<()>;
    fn deinit(&self, channel: ChannelId) -> Result<()>;
    fn read_module_regs(&self, offset: u32, count: u32) -> Result<Vec<u32>>;
    fn write_module_regs(&self, offset: u32, values: &[u32]) -> Result<()>;
}

/// The three backend interfaces of one implementation.
#[derive(Clone)]
pub struct Backends {
    pub name: &'static str,
    pub syncpt: Arc<dyn SyncpointBackend>,
    pub cdma: Arc<dyn CdmaBackend>,
    pub channel: Arc<dyn ChannelBackend>,
}

impl Backends {
    pub fn new<B>(name: &'static str, backend: Arc<B>) -> Self
    where
        B: SyncpointBackend + CdmaBackend + ChannelBackend + 'static,
    {
        Self {
            name,
            syncpt: backend.clone(),
            cdma: backend.clone(),
            channel: backend,
        }
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").field("name", &self.name).finish()
    }
}
