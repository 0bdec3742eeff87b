// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;

/// Host settings, populated from the config INI.
#[derive(Debug, Clone)]
pub struct HostSettings {
    // Host
    pub backend: BackendKind,
    pub device_class: u32,
    pub module_aperture_words: u32,
    pub virt_message_size: usize,

    // Syncpoints
    pub num_syncpoints: u32,
    pub num_mutexes: u32,
    pub syncpt_free_wait_ms: u32,
    pub syncpt_check_period_ms: u32,
    pub max_stuck_checks: u32,
    pub poll_period_ms: u32,

    // Channels
    pub num_channels: u32,
    pub push_buffer_slots: u32,
    pub max_gathers_per_job: u32,
    pub resource_policy: ResourcePolicy,
    pub abort_on_close: bool,

    // Timeouts
    pub default_timeout_ms: u32,
    pub watchdog_period_ms: u32,
    pub teardown_policy: TeardownPolicy,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            device_class: 0x30,
            module_aperture_words: 0x1000,
            virt_message_size: 4096,
            num_syncpoints: 192,
            num_mutexes: 16,
            syncpt_free_wait_ms: 2000,
            syncpt_check_period_ms: 2000,
            max_stuck_checks: 15,
            poll_period_ms: 1,
            num_channels: 8,
            push_buffer_slots: 512,
            max_gathers_per_job: 128,
            resource_policy: ResourcePolicy::PerDevice,
            abort_on_close: false,
            default_timeout_ms: 10_000,
            watchdog_period_ms: 100,
            teardown_policy: TeardownPolicy::Requeue,
        }
    }
}

impl HostSettings {
    pub fn check_period(&self) -> Duration {
        Duration::from_millis(self.syncpt_check_period_ms.max(1) as u64)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms.max(1) as u64)
    }

    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_period_ms.max(1) as u64)
    }

    pub fn free_wait(&self) -> Duration {
        Duration::from_millis(self.syncpt_free_wait_ms as u64)
    }
}

/// Which implementation drives the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Direct register access to the local host1x model.
    Local,
    /// Request/response messages to a remote authority.
    Virtual,
}

impl BackendKind {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "0" | "local" => Self::Local,
            "1" | "virtual" | "virt" => Self::Virtual,
            _ => Self::Local,
        }
    }
}

/// Where channel syncpoints live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourcePolicy {
    /// Syncpoints are owned by the channel and shared by every instance.
    PerDevice,
    /// Each open instance owns its syncpoints.
    PerChannelInstance,
}

impl ResourcePolicy {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "0" | "device" | "per_device" => Self::PerDevice,
            "1" | "instance" | "per_channel_instance" => Self::PerChannelInstance,
            _ => Self::PerDevice,
        }
    }
}

/// Fate of jobs queued behind a timed-out job from another client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownPolicy {
    /// Replay their push-buffer slots after the channel reset.
    Requeue,
    /// Complete them synthetically and flag their error notifiers.
    Drop,
}

impl TeardownPolicy {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "0" | "requeue" => Self::Requeue,
            "1" | "drop" => Self::Drop,
            _ => Self::Requeue,
        }
    }
}
