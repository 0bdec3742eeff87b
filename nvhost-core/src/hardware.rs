// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host1x register model.
//!
//! Holds the syncpoint counters, the hardware mutexes, a flat module register
//! aperture and one fetch FIFO per channel. Words published to a channel are
//! executed immediately: GATHER opcodes pull command buffers from the buffer
//! registry, writes to INCR_SYNCPT bump a counter, and a WAIT_SYNCPT whose
//! threshold has not been reached stalls the channel until the counter moves.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use parking_lot::Mutex;

use nvhost_common::{ChannelId, HostError, Result, SyncpointId, HOST1X_CLASS};

use crate::intr::HostEvent;
use crate::memory::BufferRegistry;
use crate::opcodes::{self, Opcode};

#[derive(Default)]
struct HwChannel {
    bound: bool,
    running: bool,
    class_id: u32,
    fifo: VecDeque<u32>,
    put: u32,
    stalled_on: Option<(SyncpointId, u32)>,
}

/// Simulated host1x block.
pub struct Host1xHardware {
    syncpts: Box<[AtomicU32]>,
    mutexes: Box<[AtomicBool]>,
    channels: Mutex<Vec<HwChannel>>,
    module_regs: Mutex<Vec<u32>>,
    memory: Arc<BufferRegistry>,
    irq: Mutex<Option<Sender<HostEvent>>>,
}

impl Host1xHardware {
    pub fn new(
        num_syncpoints: u32,
        num_mutexes: u32,
        num_channels: u32,
        module_words: u32,
        memory: Arc<BufferRegistry>,
    ) -> Self {
        Self {
            syncpts: (0..num_syncpoints).map(|_| AtomicU32::new(0)).collect(),
            mutexes: (0..num_mutexes).map(|_| AtomicBool::new(false)).collect(),
            channels: Mutex::new((0..num_channels).map(|_| HwChannel::default()).collect()),
            module_regs: Mutex::new(vec![0; module_words as usize]),
            memory,
            irq: Mutex::new(None),
        }
    }

    /// Route syncpoint increment interrupts to `sink`.
    pub fn set_irq_sink(&self, sink: Sender<HostEvent>) {
        *self.irq.lock() = Some(sink);
    }

    pub fn num_syncpoints(&self) -> u32 {
        self.syncpts.len() as u32
    }

    pub fn memory(&self) -> &Arc<BufferRegistry> {
        &self.memory
    }

    // ── Syncpoints and mutexes ──────────────────────────────────────────

    pub fn syncpt_read(&self, id: SyncpointId) -> Result<u32> {
        Ok(self.syncpt(id)?.load(Ordering::Acquire))
    }

    pub fn syncpt_write(&self, id: SyncpointId, value: u32) -> Result<()> {
        self.syncpt(id)?.store(value, Ordering::Release);
        self.run_channels();
        Ok(())
    }

    pub fn syncpt_cpu_incr(&self, id: SyncpointId) -> Result<()> {
        self.syncpt(id)?;
        self.bump(id);
        self.run_channels();
        Ok(())
    }

    pub fn mutex_try_lock(&self, index: u32) -> Result<bool> {
        let mutex = self.mutex(index)?;
        Ok(mutex
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    pub fn mutex_unlock(&self, index: u32) -> Result<()> {
        self.mutex(index)?.store(false, Ordering::Release);
        Ok(())
    }

    fn syncpt(&self, id: SyncpointId) -> Result<&AtomicU32> {
        self.syncpts
            .get(id as usize)
            .ok_or_else(|| HostError::invalid(format!("syncpoint id {id} out of range")))
    }

    fn mutex(&self, index: u32) -> Result<&AtomicBool> {
        self.mutexes
            .get(index as usize)
            .ok_or_else(|| HostError::invalid(format!("mutex index {index} out of range")))
    }

    fn bump(&self, id: SyncpointId) {
        let Some(counter) = self.syncpts.get(id as usize) else {
            log::warn!("host1x: increment of invalid syncpoint {}", id);
            return;
        };
        let value = counter.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        log::trace!("host1x: syncpt[{}] -> {}", id, value);
        if let Some(sink) = self.irq.lock().as_ref() {
            sink.send(HostEvent::Syncpt(id)).ok();
        }
    }

    fn wait_satisfied(&self, id: SyncpointId, thresh: u32) -> bool {
        match self.syncpts.get(id as usize) {
            Some(counter) => {
                let current = counter.load(Ordering::Acquire);
                // 24-bit modular compare, matching the payload width.
                current.wrapping_sub(thresh) & opcodes::WAIT_THRESH_MASK < 0x0080_0000
            }
            None => {
                log::warn!("host1x: wait on invalid syncpoint {}, ignoring", id);
                true
            }
        }
    }

    // ── Channels ────────────────────────────────────────────────────────

    pub fn channel_init(&self, ch: ChannelId, class_id: u32) -> Result<()> {
        let mut channels = self.channels.lock();
        let channel = channel_mut(&mut channels, ch)?;
        *channel = HwChannel {
            bound: true,
            class_id,
            ..Default::default()
        };
        Ok(())
    }

    pub fn channel_deinit(&self, ch: ChannelId) -> Result<()> {
        let mut channels = self.channels.lock();
        *channel_mut(&mut channels, ch)? = HwChannel::default();
        Ok(())
    }

    pub fn channel_start(&self, ch: ChannelId) -> Result<()> {
        {
            let mut channels = self.channels.lock();
            let channel = channel_mut(&mut channels, ch)?;
            if !channel.bound {
                return Err(HostError::fault(format!("channel {ch} not bound")));
            }
            channel.running = true;
        }
        self.run_channels();
        Ok(())
    }

    pub fn channel_stop(&self, ch: ChannelId) -> Result<()> {
        let mut channels = self.channels.lock();
        channel_mut(&mut channels, ch)?.running = false;
        Ok(())
    }

    /// Discard fetched but unexecuted words.
    pub fn channel_teardown(&self, ch: ChannelId) -> Result<()> {
        let mut channels = self.channels.lock();
        let channel = channel_mut(&mut channels, ch)?;
        let dropped = channel.fifo.len();
        channel.fifo.clear();
        channel.stalled_on = None;
        log::debug!("host1x: channel {} teardown dropped {} words", ch, dropped);
        Ok(())
    }

    pub fn channel_submit(&self, ch: ChannelId, put: u32, words: &[u32]) -> Result<()> {
        {
            let mut channels = self.channels.lock();
            let channel = channel_mut(&mut channels, ch)?;
            if !channel.bound {
                return Err(HostError::fault(format!("kick on unbound channel {ch}")));
            }
            channel.fifo.extend(words.iter().copied());
            channel.put = put;
        }
        self.run_channels();
        Ok(())
    }

    /// Words fetched but not yet executed on a channel.
    pub fn pending_words(&self, ch: ChannelId) -> usize {
        self.channels
            .lock()
            .get(ch as usize)
            .map_or(0, |c| c.fifo.len())
    }

    /// Last write cursor published to a channel.
    pub fn dma_put(&self, ch: ChannelId) -> u32 {
        self.channels.lock().get(ch as usize).map_or(0, |c| c.put)
    }

    /// Syncpoint wait a channel is stalled on, if any.
    pub fn stalled_on(&self, ch: ChannelId) -> Option<(SyncpointId, u32)> {
        self.channels.lock().get(ch as usize).and_then(|c| c.stalled_on)
    }

    // ── Module registers ────────────────────────────────────────────────

    pub fn read_module_regs(&self, offset: u32, count: u32) -> Result<Vec<u32>> {
        let regs = self.module_regs.lock();
        let range = reg_range(regs.len(), offset, count as usize)?;
        Ok(regs[range].to_vec())
    }

    pub fn write_module_regs(&self, offset: u32, values: &[u32]) -> Result<()> {
        let mut regs = self.module_regs.lock();
        let range = reg_range(regs.len(), offset, values.len())?;
        regs[range].copy_from_slice(values);
        Ok(())
    }

    // ── Command processing ──────────────────────────────────────────────

    /// Execute all runnable channels until none makes progress.
    fn run_channels(&self) {
        let mut channels = self.channels.lock();
        loop {
            let mut progress = false;
            for (ch, channel) in channels.iter_mut().enumerate() {
                if channel.running && !channel.fifo.is_empty() {
                    progress |= self.execute(ch as ChannelId, channel);
                }
            }
            if !progress {
                break;
            }
        }
    }

    /// Execute one channel's FIFO. Returns whether any word was consumed.
    fn execute(&self, ch: ChannelId, channel: &mut HwChannel) -> bool {
        let mut progress = false;

        while let Some(&word) = channel.fifo.front() {
            let op = Opcode::decode(word);
            let needed = op.data_words();
            if channel.fifo.len() < needed + 1 {
                // Rest of the opcode has not been published yet.
                break;
            }
            let data: Vec<u32> = channel.fifo.iter().skip(1).take(needed).copied().collect();

            if let Opcode::Gather {
                offset,
                insert,
                incr,
                count,
            } = op
            {
                channel.fifo.drain(..needed + 1);
                progress = true;
                match self.memory.read_device(data[0] as u64, count as usize) {
                    Ok(words) => {
                        for &w in words.iter().rev() {
                            channel.fifo.push_front(w);
                        }
                        if insert {
                            let header = if incr {
                                opcodes::incr(offset, count)
                            } else {
                                opcodes::nonincr(offset, count)
                            };
                            channel.fifo.push_front(header);
                        }
                    }
                    Err(e) => log::error!("host1x: channel {} gather fetch failed: {}", ch, e),
                }
                continue;
            }

            let writes = register_writes(op, &data);
            let class_id = match op {
                Opcode::SetClass { class_id, .. } => class_id,
                _ => channel.class_id,
            };

            // Stall before touching anything if a wait is not yet satisfied.
            if class_id == HOST1X_CLASS {
                let blocked = writes
                    .iter()
                    .filter(|(reg, _)| *reg == opcodes::WAIT_SYNCPT)
                    .map(|&(_, payload)| opcodes::decode_wait_syncpt(payload))
                    .find(|&(id, thresh)| !self.wait_satisfied(id, thresh));
                if let Some(wait) = blocked {
                    if channel.stalled_on != Some(wait) {
                        log::trace!("host1x: channel {} waits on syncpt {} >= {}", ch, wait.0, wait.1);
                    }
                    channel.stalled_on = Some(wait);
                    break;
                }
            }
            channel.stalled_on = None;

            channel.fifo.drain(..needed + 1);
            progress = true;
            channel.class_id = class_id;

            if let Opcode::Unknown(raw) = op {
                log::warn!("host1x: channel {} unknown opcode 0x{:08X}", ch, raw);
            }
            for (reg, value) in writes {
                if reg == opcodes::INCR_SYNCPT {
                    let (_, id) = opcodes::decode_incr_syncpt(value);
                    self.bump(id);
                }
            }
        }

        progress
    }
}

/// Register writes performed by an opcode and its data words.
fn register_writes(op: Opcode, data: &[u32]) -> Vec<(u32, u32)> {
    let masked = |offset: u32, mask: u32| {
        (0..16)
            .filter(move |&bit| mask & (1u32 << bit) != 0)
            .map(move |bit| offset + bit)
    };
    match op {
        Opcode::SetClass { offset, mask, .. } | Opcode::Mask { offset, mask } => {
            masked(offset, mask).zip(data.iter().copied()).collect()
        }
        Opcode::Incr { offset, .. } => (offset..).zip(data.iter().copied()).collect(),
        Opcode::NonIncr { offset, .. } => data.iter().map(|&v| (offset, v)).collect(),
        Opcode::Imm { offset, value } => vec![(offset, value)],
        Opcode::Restart { .. } | Opcode::Gather { .. } | Opcode::Unknown(_) => Vec::new(),
    }
}

fn channel_mut(channels: &mut [HwChannel], ch: ChannelId) -> Result<&mut HwChannel> {
    channels
        .get_mut(ch as usize)
        .ok_or_else(|| HostError::invalid(format!("channel id {ch} out of range")))
}

fn reg_range(len: usize, offset: u32, count: usize) -> Result<std::ops::Range<usize>> {
    let start = offset as usize;
    start
        .checked_add(count)
        .filter(|&end| end <= len)
        .map(|end| start..end)
        .ok_or_else(|| HostError::PermissionDenied(format!("register 0x{offset:X}+{count} outside aperture")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{incr_syncpt_payload, wait_syncpt_payload, SyncptCond};

    fn hardware() -> Host1xHardware {
        Host1xHardware::new(32, 4, 2, 64, Arc::new(BufferRegistry::new()))
    }

    fn incr_words(class_id: u32, id: SyncpointId) -> Vec<u32> {
        vec![
            opcodes::setclass(class_id, 0, 0),
            opcodes::nonincr(opcodes::INCR_SYNCPT, 1),
            incr_syncpt_payload(SyncptCond::OpDone, id),
        ]
    }

    #[test]
    fn test_cpu_incr_and_write() {
        let hw = hardware();
        hw.syncpt_cpu_incr(3).unwrap();
        hw.syncpt_cpu_incr(3).unwrap();
        assert_eq!(hw.syncpt_read(3).unwrap(), 2);
        hw.syncpt_write(3, 100).unwrap();
        assert_eq!(hw.syncpt_read(3).unwrap(), 100);
        assert!(hw.syncpt_read(32).is_err());
    }

    #[test]
    fn test_mutex_try_lock() {
        let hw = hardware();
        assert!(hw.mutex_try_lock(1).unwrap());
        assert!(!hw.mutex_try_lock(1).unwrap());
        hw.mutex_unlock(1).unwrap();
        assert!(hw.mutex_try_lock(1).unwrap());
        assert!(hw.mutex_try_lock(4).is_err());
    }

    #[test]
    fn test_submit_requires_binding() {
        let hw = hardware();
        assert!(matches!(
            hw.channel_submit(0, 1, &[opcodes::nop()]),
            Err(HostError::HardwareFault(_))
        ));
    }

    #[test]
    fn test_incr_executes_on_running_channel() {
        let hw = hardware();
        hw.channel_init(0, 0x30).unwrap();
        hw.channel_submit(0, 2, &incr_words(0x30, 5)).unwrap();
        // Not started yet.
        assert_eq!(hw.syncpt_read(5).unwrap(), 0);
        hw.channel_start(0).unwrap();
        assert_eq!(hw.syncpt_read(5).unwrap(), 1);
        assert_eq!(hw.pending_words(0), 0);
    }

    #[test]
    fn test_wait_stalls_until_increment() {
        let hw = hardware();
        hw.channel_init(0, HOST1X_CLASS).unwrap();
        hw.channel_start(0).unwrap();

        let mut words = vec![
            opcodes::setclass(HOST1X_CLASS, opcodes::WAIT_SYNCPT, 1),
            wait_syncpt_payload(7, 2),
        ];
        words.extend(incr_words(0x30, 8));
        hw.channel_submit(0, 3, &words).unwrap();
        assert_eq!(hw.stalled_on(0), Some((7, 2)));
        assert_eq!(hw.syncpt_read(8).unwrap(), 0);

        hw.syncpt_cpu_incr(7).unwrap();
        assert_eq!(hw.syncpt_read(8).unwrap(), 0);
        hw.syncpt_cpu_incr(7).unwrap();
        assert_eq!(hw.stalled_on(0), None);
        assert_eq!(hw.syncpt_read(8).unwrap(), 1);
    }

    #[test]
    fn test_gather_fetches_from_memory() {
        let memory = Arc::new(BufferRegistry::new());
        let hw = Host1xHardware::new(16, 1, 1, 16, memory.clone());
        let h = memory.create(0x100).unwrap();
        let body = incr_words(0x30, 2);
        memory.write_words(h, 0x40, &body).unwrap();
        let addr = memory.pin(h).unwrap();

        hw.channel_init(0, 0x30).unwrap();
        hw.channel_start(0).unwrap();
        hw.channel_submit(0, 1, &[opcodes::gather(body.len() as u32), (addr + 0x40) as u32])
            .unwrap();
        assert_eq!(hw.syncpt_read(2).unwrap(), 1);
    }

    #[test]
    fn test_teardown_drops_stalled_work() {
        let hw = hardware();
        hw.channel_init(1, HOST1X_CLASS).unwrap();
        hw.channel_start(1).unwrap();
        hw.channel_submit(
            1,
            1,
            &[opcodes::setclass(HOST1X_CLASS, opcodes::WAIT_SYNCPT, 1), wait_syncpt_payload(4, 9)],
        )
        .unwrap();
        assert_eq!(hw.pending_words(1), 2);
        hw.channel_teardown(1).unwrap();
        assert_eq!(hw.pending_words(1), 0);
        assert_eq!(hw.stalled_on(1), None);
    }

    #[test]
    fn test_irq_sink_receives_increments() {
        let hw = hardware();
        let (tx, rx) = std::sync::mpsc::channel();
        hw.set_irq_sink(tx);
        hw.syncpt_cpu_incr(9).unwrap();
        assert!(matches!(rx.try_recv(), Ok(HostEvent::Syncpt(9))));
    }

    #[test]
    fn test_module_regs_bounds() {
        let hw = hardware();
        hw.write_module_regs(4, &[1, 2, 3]).unwrap();
        assert_eq!(hw.read_module_regs(4, 3).unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            hw.read_module_regs(62, 4),
            Err(HostError::PermissionDenied(_))
        ));
    }
}
