// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host registry.
//!
//! Owns the buffer registry, the host1x model, the selected backend, the
//! syncpoint manager and the channel pool. One worker thread consumes
//! syncpoint interrupts and, once per watchdog period, polls waiters and runs
//! CDMA retirement and timeout checks on every live channel.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nvhost_common::settings::{BackendKind, HostSettings};
use nvhost_common::{HostError, Result};

use crate::backend::local::LocalBackend;
use crate::backend::virt::{RemoteExecutor, VirtualBackend};
use crate::backend::Backends;
use crate::channel::ChannelPool;
use crate::hardware::Host1xHardware;
use crate::intr::{HostEvent, Intr};
use crate::memory::BufferRegistry;
use crate::syncpoint::SyncpointManager;

pub struct Host {
    settings: HostSettings,
    memory: Arc<BufferRegistry>,
    hardware: Arc<Host1xHardware>,
    backends: Backends,
    syncpoints: Arc<SyncpointManager>,
    channels: Arc<ChannelPool>,
    events: Sender<HostEvent>,
    worker: Option<JoinHandle<()>>,
}

impl Host {
    pub fn new(settings: HostSettings) -> Result<Self> {
        let memory = Arc::new(BufferRegistry::new());
        let hardware = Arc::new(Host1xHardware::new(
            settings.num_syncpoints,
            settings.num_mutexes,
            settings.num_channels,
            settings.module_aperture_words,
            memory.clone(),
        ));
        let (events, rx) = mpsc::channel();

        let backends = match settings.backend {
            BackendKind::Local => {
                hardware.set_irq_sink(events.clone());
                Backends::new("local", Arc::new(LocalBackend::with_interrupts(hardware.clone())))
            }
            BackendKind::Virtual => {
                // The executor thread exits once the backend drops its transport.
                let (transport, _executor) = RemoteExecutor::spawn(hardware.clone())?;
                let backend = VirtualBackend::new(Box::new(transport), settings.virt_message_size);
                Backends::new("virtual", Arc::new(backend))
            }
        };

        let intr = Arc::new(Intr::new(settings.num_syncpoints));
        let syncpoints = Arc::new(SyncpointManager::new(backends.syncpt.clone(), intr, &settings));
        syncpoints.reset_all()?;
        let channels = Arc::new(ChannelPool::new(&backends, syncpoints.clone(), &settings));

        let worker = {
            let syncpoints = syncpoints.clone();
            let channels = channels.clone();
            let period = settings.watchdog_period();
            thread::Builder::new()
                .name("nvhost-worker".into())
                .spawn(move || run_worker(rx, &syncpoints, &channels, period))
                .map_err(|e| HostError::fault(format!("failed to spawn host worker: {e}")))?
        };

        log::info!(
            "host: {} backend, {} channels, {} syncpoints, {} mutexes",
            backends.name,
            settings.num_channels,
            settings.num_syncpoints,
            settings.num_mutexes
        );

        Ok(Self {
            settings,
            memory,
            hardware,
            backends,
            syncpoints,
            channels,
            events,
            worker: Some(worker),
        })
    }

    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }

    pub fn memory(&self) -> &Arc<BufferRegistry> {
        &self.memory
    }

    /// The register model behind the backend, for inspection.
    pub fn hardware(&self) -> &Arc<Host1xHardware> {
        &self.hardware
    }

    pub fn backend_name(&self) -> &'static str {
        self.backends.name
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn syncpoints(&self) -> &Arc<SyncpointManager> {
        &self.syncpoints
    }

    pub fn channels(&self) -> &Arc<ChannelPool> {
        &self.channels
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.events.send(HostEvent::Shutdown).ok();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("host: worker thread panicked");
            }
        }
    }
}

fn run_worker(
    events: Receiver<HostEvent>,
    syncpoints: &SyncpointManager,
    channels: &ChannelPool,
    period: Duration,
) {
    log::debug!("host: worker running, period {:?}", period);
    let mut next_tick = Instant::now() + period;
    loop {
        let wait = next_tick.saturating_duration_since(Instant::now());
        match events.recv_timeout(wait) {
            Ok(HostEvent::Syncpt(id)) => syncpoints.handle_syncpt_event(id),
            Ok(HostEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if Instant::now() >= next_tick {
            syncpoints.poll_waiters();
            channels.for_each_channel(|channel| {
                let cdma = channel.cdma();
                cdma.update();
                if cdma.check_timeout() {
                    log::warn!("host: channel {} recovered from timeout", channel.id());
                }
            });
            next_tick = Instant::now() + period;
        }
    }
    log::debug!("host: worker stopped");
}
