// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Local backend: direct access to the host1x register model.

use std::sync::Arc;

use nvhost_common::{ChannelId, Result, SyncpointId};

use super::{CdmaBackend, ChannelBackend, Kick, SyncpointBackend};
use crate::hardware::Host1xHardware;

pub struct LocalBackend {
    hw: Arc<Host1xHardware>,
    interrupts: bool,
}

impl LocalBackend {
    /// Backend whose syncpoint interrupts are not routed anywhere; waits poll.
    pub fn new(hw: Arc<Host1xHardware>) -> Self {
        Self { hw, interrupts: false }
    }

    /// Backend for hardware whose interrupts reach the host worker.
    pub fn with_interrupts(hw: Arc<Host1xHardware>) -> Self {
        Self { hw, interrupts: true }
    }

    pub fn hardware(&self) -> &Arc<Host1xHardware> {
        &self.hw
    }
}

impl SyncpointBackend for LocalBackend {
    fn read(&self, id: SyncpointId) -> Result<u32> {
        self.hw.syncpt_read(id)
    }

    fn write(&self, id: SyncpointId, value: u32) -> Result<()> {
        self.hw.syncpt_write(id, value)
    }

    fn cpu_incr(&self, id: SyncpointId) -> Result<()> {
        self.hw.syncpt_cpu_incr(id)
    }

    fn mutex_try_lock(&self, index: u32) -> Result<bool> {
        self.hw.mutex_try_lock(index)
    }

    fn mutex_unlock(&self, index: u32) -> Result<()> {
        self.hw.mutex_unlock(index)
    }

    fn has_interrupts(&self) -> bool {
        self.interrupts
    }
}

impl CdmaBackend for LocalBackend {
    fn start(&self, channel: ChannelId) -> Result<()> {
        self.hw.channel_start(channel)
    }

    fn stop(&self, channel: ChannelId) -> Result<()> {
        self.hw.channel_stop(channel)
    }

    fn kick(&self, channel: ChannelId, kick: &Kick) -> Result<()> {
        log::trace!(
            "cdma: channel {} kick put {} ({} words)",
            channel,
            kick.put,
            kick.words.len()
        );
        self.hw.channel_submit(channel, kick.put, &kick.words)
    }

    fn teardown(&self, channel: ChannelId) -> Result<()> {
        self.hw.channel_teardown(channel)
    }
}

impl ChannelBackend for LocalBackend {
    fn init(&self, channel: ChannelId, class_id: u32) -> Result<()> {
        self.hw.channel_init(channel, class_id)
    }

    fn deinit(&self, channel: ChannelId) -> Result<()> {
        self.hw.channel_deinit(channel)
    }

    fn read_module_regs(&self, offset: u32, count: u32) -> Result<Vec<u32>> {
        self.hw.read_module_regs(offset, count)
    }

    fn write_module_regs(&self, offset: u32, values: &[u32]) -> Result<()> {
        self.hw.write_module_regs(offset, values)
    }
}
