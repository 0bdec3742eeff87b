// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! `/dev/nvhost-ctrl` and the channel devices (`/dev/nvhost-<engine>`).

use std::sync::Arc;
use std::time::Duration;

use nvhost_common::settings::ResourcePolicy;
use nvhost_common::{
    ClientId, Errno, HostError, Identifier, Result, SyncpointId, ENOTTY, HOST1X_CLASS, MODULE_MAX_SYNCPTS,
    NO_TIMEOUT,
};
use nvhost_core::channel::Channel;
use nvhost_core::host::Host;
use nvhost_core::job::{ErrorNotifier, Job, TimeoutContext};
use nvhost_core::syncpoint::SyncpointKind;

use crate::abi::{self, ArgReader, ArgWriter, RegRdWrArgs, SubmitArgs};

/// A device that handles ioctl commands.
pub trait NvDevice: Send + Sync {
    fn name(&self) -> &str;
    /// Run one ioctl. Returns [`Errno::SUCCESS`] or the failure code.
    fn ioctl(&mut self, cmd: u32, input: &[u8], output: &mut [u8]) -> Errno;
}

/// Collapse a handler result into a status code, logging failures.
fn status(device: &str, nr: u32, result: Option<Result<()>>) -> Errno {
    match result {
        Some(Ok(())) => Errno::SUCCESS,
        Some(Err(e)) => {
            log::debug!("{}: ioctl {} failed: {}", device, nr, e);
            e.errno()
        }
        None => {
            log::warn!("{}: unknown ioctl {}", device, nr);
            ENOTTY
        }
    }
}

fn millis(ms: u32) -> Option<Duration> {
    (ms != 0 && ms != NO_TIMEOUT).then(|| Duration::from_millis(ms as u64))
}

// ── Ctrl device ─────────────────────────────────────────────────────────

/// `/dev/nvhost-ctrl`: syncpoint queries, waits and module mutexes.
pub struct CtrlDevice {
    host: Arc<Host>,
}

impl CtrlDevice {
    pub fn new(host: Arc<Host>) -> Self {
        Self { host }
    }

    fn valid_id(&self, id: SyncpointId) -> Result<SyncpointId> {
        if self.host.syncpoints().is_valid(id) {
            Ok(id)
        } else {
            Err(HostError::invalid(format!("syncpoint id {id}")))
        }
    }

    fn syncpt_read(&self, input: &[u8], output: &mut [u8]) -> Result<()> {
        let id = self.valid_id(ArgReader::new(input).u32()?)?;
        let value = self.host.syncpoints().update_min(id)?;
        log::trace!("nvhost-ctrl: read syncpt {} -> {}", id, value);
        ArgWriter::new(output).u32(value)
    }

    fn syncpt_incr(&self, input: &[u8]) -> Result<()> {
        let id = self.valid_id(ArgReader::new(input).u32()?)?;
        let syncpoints = self.host.syncpoints();
        if !syncpoints.is_assigned(id) || !syncpoints.is_client_managed(id) {
            return Err(HostError::invalid(format!(
                "syncpoint {id} is not client-managed"
            )));
        }
        syncpoints.incr(id)
    }

    fn syncpt_wait(&self, input: &[u8], output: &mut [u8]) -> Result<()> {
        let mut r = ArgReader::new(input);
        let id = self.valid_id(r.u32()?)?;
        let thresh = r.u32()?;
        let timeout_ms = r.u32()?;
        let timeout = match timeout_ms {
            NO_TIMEOUT => None,
            ms => Some(Duration::from_millis(ms as u64)),
        };
        log::debug!("nvhost-ctrl: wait syncpt {} >= {} ({:?})", id, thresh, timeout);

        let syncpoints = self.host.syncpoints();
        match syncpoints.wait(id, thresh, timeout, None) {
            Ok(value) => ArgWriter::new(output).u32(value),
            Err(e) => {
                // Callers still get the value the wait gave up on.
                ArgWriter::new(output).u32(syncpoints.read_min(id))?;
                Err(e)
            }
        }
    }

    fn module_mutex(&self, input: &[u8]) -> Result<()> {
        let mut r = ArgReader::new(input);
        let index = r.u32()?;
        let lock = r.u32()? != 0;
        if lock {
            self.host.syncpoints().mutex_try_lock(index)
        } else {
            self.host.syncpoints().mutex_unlock(index)
        }
    }

    fn syncpt_read_max(&self, input: &[u8], output: &mut [u8]) -> Result<()> {
        let id = self.valid_id(ArgReader::new(input).u32()?)?;
        ArgWriter::new(output).u32(self.host.syncpoints().read_max(id))
    }
}

impl NvDevice for CtrlDevice {
    fn name(&self) -> &str {
        "nvhost-ctrl"
    }

    fn ioctl(&mut self, cmd: u32, input: &[u8], output: &mut [u8]) -> Errno {
        let nr = abi::ioctl_nr(cmd);
        let result = match nr {
            abi::CTRL_SYNCPT_READ => Some(self.syncpt_read(input, output)),
            abi::CTRL_SYNCPT_INCR => Some(self.syncpt_incr(input)),
            abi::CTRL_SYNCPT_WAIT => Some(self.syncpt_wait(input, output)),
            abi::CTRL_MODULE_MUTEX => Some(self.module_mutex(input)),
            abi::CTRL_SYNCPT_READ_MAX => Some(self.syncpt_read_max(input, output)),
            abi::CTRL_GET_VERSION => Some(ArgWriter::new(output).u32(abi::CTRL_VERSION)),
            _ => None,
        };
        status(self.name(), nr, result)
    }
}

// ── Channel device ──────────────────────────────────────────────────────

/// One open instance of a channel device.
///
/// The hardware channel is mapped on the first call that needs it, under the
/// instance's identifier unless OPEN supplied another one.
pub struct ChannelDevice {
    host: Arc<Host>,
    name: String,
    client: ClientId,
    identifier: Identifier,
    channel: Option<Arc<Channel>>,
    timeout: Option<Duration>,
    /// Shared with every job this instance submits; set once one times out.
    context: Arc<TimeoutContext>,
    notifier: Option<ErrorNotifier>,
    /// Instance-owned syncpoints under [`ResourcePolicy::PerChannelInstance`].
    syncpts: [Option<SyncpointId>; MODULE_MAX_SYNCPTS],
    client_managed: Option<SyncpointId>,
}

impl ChannelDevice {
    pub fn new(host: Arc<Host>, name: &str, client: ClientId) -> Self {
        let timeout = millis(host.settings().default_timeout_ms);
        Self {
            host,
            name: name.to_string(),
            client,
            identifier: Identifier(client as u64),
            channel: None,
            timeout,
            context: Arc::new(TimeoutContext::new()),
            notifier: None,
            syncpts: [None; MODULE_MAX_SYNCPTS],
            client_managed: None,
        }
    }

    fn policy(&self) -> ResourcePolicy {
        self.host.settings().resource_policy
    }

    fn channel(&mut self) -> Result<Arc<Channel>> {
        if let Some(channel) = &self.channel {
            return Ok(channel.clone());
        }
        let channel = self.host.channels().map(self.identifier)?;
        self.channel = Some(channel.clone());
        Ok(channel)
    }

    /// Syncpoints the caller may increment through SUBMIT.
    fn owned_syncpoints(&self) -> Vec<SyncpointId> {
        let mut ids: Vec<SyncpointId> = self.syncpts.iter().flatten().copied().collect();
        ids.extend(self.client_managed);
        if let Some(channel) = &self.channel {
            ids.extend(channel.bound_syncpoints());
            ids.extend(channel.client_managed_syncpoint());
        }
        ids
    }

    fn open(&mut self, input: &[u8], output: &mut [u8]) -> Result<()> {
        let identifier = Identifier(ArgReader::new(input).u64()?);
        match &self.channel {
            Some(channel) if channel.identifier() != identifier => {
                return Err(HostError::invalid(format!(
                    "{} already open as {}",
                    self.name,
                    channel.identifier()
                )));
            }
            Some(_) => {}
            None => self.identifier = identifier,
        }
        let channel = self.channel()?;
        log::debug!("{}: open {} -> channel {}", self.name, identifier, channel.id());
        ArgWriter::new(output).u32(channel.id())
    }

    fn get_syncpoint(&mut self, input: &[u8], output: &mut [u8]) -> Result<()> {
        let index = ArgReader::new(input).u32()? as usize;
        if index >= MODULE_MAX_SYNCPTS {
            return Err(HostError::invalid(format!("syncpoint index {index}")));
        }
        let id = match self.policy() {
            ResourcePolicy::PerDevice => self.channel()?.get_syncpoint(index)?,
            ResourcePolicy::PerChannelInstance => match self.syncpts[index] {
                Some(id) => id,
                None => {
                    let name = format!("{}_{}", self.name, index);
                    let id = self
                        .host
                        .syncpoints()
                        .allocate(SyncpointKind::HostManaged, &name)?;
                    self.syncpts[index] = Some(id);
                    id
                }
            },
        };
        ArgWriter::new(output).u32(id)
    }

    fn get_client_managed_syncpoint(&mut self, input: &[u8], output: &mut [u8]) -> Result<()> {
        let name = format!("{}_{}", self.name, ArgReader::new(input).name()?);
        let id = match self.policy() {
            ResourcePolicy::PerDevice => self.channel()?.get_client_managed_syncpoint(&name)?,
            ResourcePolicy::PerChannelInstance => match self.client_managed {
                Some(id) => id,
                None => {
                    let id = self
                        .host
                        .syncpoints()
                        .allocate(SyncpointKind::ClientManaged, &name)?;
                    self.client_managed = Some(id);
                    id
                }
            },
        };
        ArgWriter::new(output).u32(id)
    }

    fn submit(&mut self, input: &[u8], output: &mut [u8]) -> Result<()> {
        if self.context.has_timed_out() {
            return Err(HostError::timeout(format!("{} has timed out", self.name)));
        }
        let args = SubmitArgs::parse(input)?;
        let settings = self.host.settings();

        let num_syncpoints = self.host.syncpoints().num_syncpoints() as usize;
        if args.incrs.is_empty() || args.incrs.len() > num_syncpoints {
            return Err(HostError::invalid(format!(
                "{} syncpoint increments",
                args.incrs.len()
            )));
        }
        if args.gathers.len() > settings.max_gathers_per_job as usize {
            return Err(HostError::invalid(format!("{} gathers", args.gathers.len())));
        }
        let owned = self.owned_syncpoints();
        if let Some(incr) = args
            .incrs
            .iter()
            .find(|i| i.syncpt_id == 0 || !owned.contains(&i.syncpt_id))
        {
            return Err(HostError::invalid(format!(
                "syncpoint {} not owned by {}",
                incr.syncpt_id, self.name
            )));
        }
        let device_class = settings.device_class;
        if let Some(gather) = args
            .gathers
            .iter()
            .find(|g| ![0, device_class, HOST1X_CLASS].contains(&g.class_id))
        {
            return Err(HostError::invalid(format!("class 0x{:X}", gather.class_id)));
        }

        let timeout = match (self.timeout, millis(args.timeout_ms)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let channel = self.channel()?;
        let mut job = Job::alloc(
            self.host.memory().clone(),
            channel.id(),
            self.client,
            args.gathers.len() as u32,
            args.relocs.len() as u32,
            args.waitchks.len() as u32,
            args.incrs.len() as u32,
        )?;
        for gather in args.gathers {
            job.add_gather(gather)?;
        }
        for reloc in args.relocs {
            job.add_reloc(reloc)?;
        }
        for waitchk in args.waitchks {
            job.add_waitchk(waitchk)?;
        }
        for incr in args.incrs {
            job.add_syncpt_incr(incr)?;
        }
        job.timeout = timeout;
        job.notifier = self.notifier.clone();
        job.context = Some(self.context.clone());

        let token = channel.submit(job, args.flags)?;
        ArgWriter::new(output).fences(token.fences())
    }

    fn set_error_notifier(&mut self, input: &[u8]) -> Result<()> {
        let mut r = ArgReader::new(input);
        let handle = r.u32()?;
        let _pad = r.u32()?;
        let offset = r.u64()?;
        if handle == 0 {
            self.notifier = None;
            return Ok(());
        }
        self.notifier = Some(ErrorNotifier::new(self.host.memory().clone(), handle, offset)?);
        Ok(())
    }

    fn module_regrdwr(&mut self, input: &[u8], output: &mut [u8]) -> Result<()> {
        let args = RegRdWrArgs::parse(input)?;
        let aperture = self.host.settings().module_aperture_words as u64 * 4;
        for &offset in &args.offsets {
            if offset % 4 != 0 {
                return Err(HostError::invalid(format!("register offset 0x{offset:X}")));
            }
            let end = (offset as u64).checked_add(args.block_size as u64);
            if end.map_or(true, |end| end > aperture) {
                return Err(HostError::PermissionDenied(format!(
                    "register block 0x{offset:X}+0x{:X} outside the module aperture",
                    args.block_size
                )));
            }
        }

        let backend = &self.host.backends().channel;
        let per_block = args.words_per_block();
        let mut out = ArgWriter::new(output);
        for (i, &offset) in args.offsets.iter().enumerate() {
            let base = offset / 4;
            for start in (0..per_block).step_by(abi::REGRDWR_BATCH_WORDS) {
                let count = (per_block - start).min(abi::REGRDWR_BATCH_WORDS);
                let reg = base + start as u32;
                if args.write {
                    let at = i * per_block + start;
                    backend.write_module_regs(reg, &args.values[at..at + count])?;
                } else {
                    for value in backend.read_module_regs(reg, count as u32)? {
                        out.u32(value)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn set_timeout(&mut self, input: &[u8]) -> Result<()> {
        let ms = ArgReader::new(input).u32()?;
        self.timeout = millis(ms);
        self.context.set_debug_dump(true);
        log::debug!("{}: timeout {:?}", self.name, self.timeout);
        Ok(())
    }

    fn set_timeout_ex(&mut self, input: &[u8]) -> Result<()> {
        let mut r = ArgReader::new(input);
        let ms = r.u32()?;
        let flags = r.u32()?;
        self.timeout = millis(ms);
        self.context.set_debug_dump(flags & abi::TIMEOUT_FLAG_DISABLE_DUMP == 0);
        log::debug!("{}: timeout {:?} flags 0x{:X}", self.name, self.timeout, flags);
        Ok(())
    }

    fn get_timedout(&self, output: &mut [u8]) -> Result<()> {
        ArgWriter::new(output).u32(self.context.has_timed_out() as u32)
    }

    fn free_client_managed_syncpoint(&mut self, input: &[u8]) -> Result<()> {
        let id = ArgReader::new(input).u32()?;
        match self.policy() {
            ResourcePolicy::PerDevice => self.channel()?.free_client_managed_syncpoint(id),
            ResourcePolicy::PerChannelInstance => {
                if self.client_managed != Some(id) {
                    return Err(HostError::invalid(format!(
                        "syncpoint {id} not client-managed by {}",
                        self.name
                    )));
                }
                self.client_managed = None;
                self.host.syncpoints().free(id);
                Ok(())
            }
        }
    }

    fn get_modmutexes(&self, output: &mut [u8]) -> Result<()> {
        let count = self.host.syncpoints().num_mutexes().min(32);
        let mask = (0..count).fold(0u32, |mask, i| mask | (1 << i));
        ArgWriter::new(output).u32(mask)
    }

    fn get_modmutex(&self, input: &[u8], output: &mut [u8]) -> Result<()> {
        let index = ArgReader::new(input).u32()?;
        if index >= self.host.syncpoints().num_mutexes() {
            return Err(HostError::invalid(format!("module mutex {index}")));
        }
        ArgWriter::new(output).u32(index)
    }

    fn get_syncpoints(&self, output: &mut [u8]) -> Result<()> {
        let mask = self
            .owned_syncpoints()
            .into_iter()
            .filter(|&id| (1..32).contains(&id))
            .fold(0u32, |mask, id| mask | (1 << id));
        ArgWriter::new(output).u32(mask)
    }

    fn set_syncpoint_name(&self, input: &[u8]) -> Result<()> {
        let mut r = ArgReader::new(input);
        let id = r.u32()?;
        let name = r.name()?;
        if !self.owned_syncpoints().contains(&id) {
            return Err(HostError::invalid(format!("syncpoint {id} not owned by {}", self.name)));
        }
        self.host.syncpoints().set_name(id, &name)
    }
}

impl NvDevice for ChannelDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn ioctl(&mut self, cmd: u32, input: &[u8], output: &mut [u8]) -> Errno {
        let nr = abi::ioctl_nr(cmd);
        let result = match nr {
            abi::CHANNEL_OPEN => Some(self.open(input, output)),
            abi::CHANNEL_GET_SYNCPOINT => Some(self.get_syncpoint(input, output)),
            abi::CHANNEL_GET_CLIENT_MANAGED_SYNCPOINT => Some(self.get_client_managed_syncpoint(input, output)),
            abi::CHANNEL_SUBMIT => Some(self.submit(input, output)),
            abi::CHANNEL_SET_ERROR_NOTIFIER => Some(self.set_error_notifier(input)),
            abi::CHANNEL_MODULE_REGRDWR => Some(self.module_regrdwr(input, output)),
            abi::CHANNEL_SET_TIMEOUT => Some(self.set_timeout(input)),
            abi::CHANNEL_GET_SYNCPOINTS => Some(self.get_syncpoints(output)),
            abi::CHANNEL_SET_SYNCPOINT_NAME => Some(self.set_syncpoint_name(input)),
            abi::CHANNEL_SET_TIMEOUT_EX => Some(self.set_timeout_ex(input)),
            abi::CHANNEL_GET_TIMEDOUT => Some(self.get_timedout(output)),
            abi::CHANNEL_FREE_CLIENT_MANAGED_SYNCPOINT => Some(self.free_client_managed_syncpoint(input)),
            // No wait bases are exposed.
            abi::CHANNEL_GET_WAITBASES => Some(ArgWriter::new(output).u32(0)),
            abi::CHANNEL_GET_MODMUTEXES => Some(self.get_modmutexes(output)),
            abi::CHANNEL_GET_MODMUTEX => Some(self.get_modmutex(input, output)),
            _ => None,
        };
        status(&self.name, nr, result)
    }
}

impl Drop for ChannelDevice {
    fn drop(&mut self) {
        let syncpoints = self.host.syncpoints();
        for id in self.syncpts.iter_mut().filter_map(Option::take) {
            syncpoints.free(id);
        }
        if let Some(id) = self.client_managed.take() {
            syncpoints.free(id);
        }
        let Some(channel) = self.channel.take() else {
            return;
        };
        let pool = self.host.channels();
        if self.host.settings().abort_on_close {
            if let Err(e) = pool.abort(channel.identifier()) {
                log::warn!("{}: abort on close failed: {}", self.name, e);
            }
        } else {
            pool.put(&channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::name_bytes;
    use nvhost_common::settings::HostSettings;
    use nvhost_common::{Fence, EBUSY, EINVAL, EPERM, ETIMEDOUT};
    use nvhost_core::job::{Gather, SyncptIncr};
    use nvhost_core::opcodes::{self, SyncptCond};

    fn host(policy: ResourcePolicy) -> Arc<Host> {
        Arc::new(
            Host::new(HostSettings {
                num_channels: 2,
                num_syncpoints: 32,
                push_buffer_slots: 64,
                module_aperture_words: 128,
                watchdog_period_ms: 5,
                resource_policy: policy,
                ..HostSettings::default()
            })
            .unwrap(),
        )
    }

    fn words(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn read_u32(buf: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
    }

    fn get_syncpoint(dev: &mut ChannelDevice, index: u32) -> u32 {
        let mut out = [0u8; 4];
        assert!(dev
            .ioctl(abi::CHANNEL_GET_SYNCPOINT, &words(&[index]), &mut out)
            .is_success());
        read_u32(&out, 0)
    }

    fn incr_job(host: &Host, id: u32) -> SubmitArgs {
        let cmdbuf = host.memory().create(8).unwrap();
        host.memory()
            .write_words(
                cmdbuf,
                0,
                &[
                    opcodes::nonincr(opcodes::INCR_SYNCPT, 1),
                    opcodes::incr_syncpt_payload(SyncptCond::OpDone, id),
                ],
            )
            .unwrap();
        SubmitArgs {
            gathers: vec![Gather::new(cmdbuf, 2, 0)],
            incrs: vec![SyncptIncr { syncpt_id: id, incrs: 1 }],
            ..Default::default()
        }
    }

    #[test]
    fn test_submit_and_wait_through_ctrl() {
        let host = host(ResourcePolicy::PerDevice);
        let mut dev = ChannelDevice::new(host.clone(), "nvhost-gpu", 1);
        let mut ctrl = CtrlDevice::new(host.clone());
        let id = get_syncpoint(&mut dev, 0);

        let mut out = [0u8; 64];
        let rc = dev.ioctl(abi::CHANNEL_SUBMIT, &incr_job(&host, id).to_bytes().unwrap(), &mut out);
        assert!(rc.is_success());
        let fences = abi::parse_fences(&out).unwrap();
        assert_eq!(fences, vec![(id, 1)]);

        let mut value = [0u8; 4];
        let rc = ctrl.ioctl(abi::CTRL_SYNCPT_WAIT, &words(&[id, 1, 2000]), &mut value);
        assert!(rc.is_success());
        assert_eq!(read_u32(&value, 0), 1);

        ctrl.ioctl(abi::CTRL_SYNCPT_READ_MAX, &words(&[id]), &mut value);
        assert_eq!(read_u32(&value, 0), 1);
    }

    #[test]
    fn test_submit_validation() {
        let host = host(ResourcePolicy::PerDevice);
        let mut dev = ChannelDevice::new(host.clone(), "nvhost-gpu", 1);
        let id = get_syncpoint(&mut dev, 0);
        let mut out = [0u8; 64];

        let mut args = incr_job(&host, id);
        args.incrs.clear();
        assert_eq!(dev.ioctl(abi::CHANNEL_SUBMIT, &args.to_bytes().unwrap(), &mut out), EINVAL);

        // Not owned by this instance.
        let args = incr_job(&host, id + 1);
        assert_eq!(dev.ioctl(abi::CHANNEL_SUBMIT, &args.to_bytes().unwrap(), &mut out), EINVAL);

        let mut args = incr_job(&host, id);
        args.gathers[0].class_id = 0x99;
        assert_eq!(dev.ioctl(abi::CHANNEL_SUBMIT, &args.to_bytes().unwrap(), &mut out), EINVAL);

        assert_eq!(dev.ioctl(0x7F, &[], &mut out), ENOTTY);
    }

    #[test]
    fn test_instance_policy_owns_syncpoints() {
        let host = host(ResourcePolicy::PerChannelInstance);
        let id = {
            let mut dev = ChannelDevice::new(host.clone(), "nvhost-gpu", 1);
            let id = get_syncpoint(&mut dev, 3);
            assert!(host.syncpoints().is_assigned(id));
            assert!(dev.channel.is_none());

            let mut mask = [0u8; 4];
            dev.ioctl(abi::CHANNEL_GET_SYNCPOINTS, &[], &mut mask);
            assert_eq!(read_u32(&mask, 0), 1 << id);
            id
        };
        assert!(!host.syncpoints().is_assigned(id));
        assert_eq!(host.syncpoints().last_used_by(id).as_deref(), Some("nvhost-gpu_3"));
    }

    #[test]
    fn test_client_managed_syncpoint_incr() {
        let host = host(ResourcePolicy::PerDevice);
        let mut dev = ChannelDevice::new(host.clone(), "nvhost-gpu", 1);
        let mut ctrl = CtrlDevice::new(host.clone());

        let mut out = [0u8; 4];
        let rc = dev.ioctl(abi::CHANNEL_GET_CLIENT_MANAGED_SYNCPOINT, &name_bytes("vblank"), &mut out);
        assert!(rc.is_success());
        let cm = read_u32(&out, 0);
        assert_eq!(host.syncpoints().name(cm).as_deref(), Some("nvhost-gpu_vblank"));

        assert!(ctrl.ioctl(abi::CTRL_SYNCPT_INCR, &words(&[cm]), &mut out).is_success());
        ctrl.ioctl(abi::CTRL_SYNCPT_READ, &words(&[cm]), &mut out);
        assert_eq!(read_u32(&out, 0), 1);

        // Host-managed syncpoints cannot be bumped from user space.
        let hm = get_syncpoint(&mut dev, 0);
        assert_eq!(ctrl.ioctl(abi::CTRL_SYNCPT_INCR, &words(&[hm]), &mut out), EINVAL);

        let mut input = words(&[cm]);
        input.extend_from_slice(&name_bytes("renamed"));
        assert!(dev.ioctl(abi::CHANNEL_SET_SYNCPOINT_NAME, &input, &mut out).is_success());
        assert_eq!(host.syncpoints().name(cm).as_deref(), Some("renamed"));
    }

    #[test]
    fn test_ctrl_wait_timeout_and_mutex() {
        let host = host(ResourcePolicy::PerDevice);
        let mut dev = ChannelDevice::new(host.clone(), "nvhost-gpu", 1);
        let mut ctrl = CtrlDevice::new(host.clone());
        let mut out = [0u8; 4];
        dev.ioctl(abi::CHANNEL_GET_CLIENT_MANAGED_SYNCPOINT, &name_bytes("x"), &mut out);
        let cm = read_u32(&out, 0);

        assert_eq!(ctrl.ioctl(abi::CTRL_SYNCPT_WAIT, &words(&[cm, 5, 10]), &mut out), ETIMEDOUT);
        assert_eq!(read_u32(&out, 0), 0);
        assert_eq!(ctrl.ioctl(abi::CTRL_SYNCPT_READ, &words(&[9999]), &mut out), EINVAL);

        assert!(ctrl.ioctl(abi::CTRL_MODULE_MUTEX, &words(&[2, 1]), &mut out).is_success());
        assert_eq!(ctrl.ioctl(abi::CTRL_MODULE_MUTEX, &words(&[2, 1]), &mut out), EBUSY);
        assert!(ctrl.ioctl(abi::CTRL_MODULE_MUTEX, &words(&[2, 0]), &mut out).is_success());

        ctrl.ioctl(abi::CTRL_GET_VERSION, &[], &mut out);
        assert_eq!(read_u32(&out, 0), abi::CTRL_VERSION);
    }

    #[test]
    fn test_error_notifier_set_on_timeout() {
        let host = host(ResourcePolicy::PerDevice);
        let mut dev = ChannelDevice::new(host.clone(), "nvhost-gpu", 1);
        let id = get_syncpoint(&mut dev, 0);
        let mut out = [0u8; 64];

        let notifier = host.memory().create(0x20).unwrap();
        assert_eq!(
            dev.ioctl(abi::CHANNEL_SET_ERROR_NOTIFIER, &words(&[notifier, 0, 0x18, 0]), &mut out),
            EINVAL
        );
        assert!(dev
            .ioctl(abi::CHANNEL_SET_ERROR_NOTIFIER, &words(&[notifier, 0, 0x10, 0]), &mut out)
            .is_success());
        assert!(dev.ioctl(abi::CHANNEL_SET_TIMEOUT, &words(&[20]), &mut out).is_success());

        let mut gate = [0u8; 4];
        dev.ioctl(abi::CHANNEL_GET_CLIENT_MANAGED_SYNCPOINT, &name_bytes("gate"), &mut gate);
        let gate = read_u32(&gate, 0);

        let mut args = incr_job(&host, id);
        // Stall on a syncpoint nobody increments.
        args.gathers[0].pre_fence = Some(Fence::new(gate, 1));
        assert!(dev.ioctl(abi::CHANNEL_SUBMIT, &args.to_bytes().unwrap(), &mut out).is_success());
        let (_, thresh) = abi::parse_fences(&out).unwrap()[0];

        host.syncpoints()
            .wait(id, thresh, Some(Duration::from_secs(2)), None)
            .unwrap();
        let record = host.memory().read_words(notifier, 0x10, 4).unwrap();
        assert_eq!(record[2], nvhost_core::job::SUBMIT_TIMEOUT);

        // The instance stays timed out until it is reopened.
        let mut flag = [0u8; 4];
        assert!(dev.ioctl(abi::CHANNEL_GET_TIMEDOUT, &[], &mut flag).is_success());
        assert_eq!(read_u32(&flag, 0), 1);
        let max = host.syncpoints().read_max(id);
        let args = incr_job(&host, id);
        assert_eq!(dev.ioctl(abi::CHANNEL_SUBMIT, &args.to_bytes().unwrap(), &mut out), ETIMEDOUT);
        assert_eq!(host.syncpoints().read_max(id), max);
        assert_eq!(host.memory().pin_count(args.gathers[0].handle), 0);

        let mut fresh = ChannelDevice::new(host.clone(), "nvhost-gpu", 2);
        fresh.ioctl(abi::CHANNEL_GET_TIMEDOUT, &[], &mut flag);
        assert_eq!(read_u32(&flag, 0), 0);
    }

    #[test]
    fn test_set_timeout_ex() {
        let host = host(ResourcePolicy::PerDevice);
        let mut dev = ChannelDevice::new(host.clone(), "nvhost-gpu", 1);
        let mut out = [0u8; 4];
        let input = words(&[50, abi::TIMEOUT_FLAG_DISABLE_DUMP]);
        assert!(dev.ioctl(abi::CHANNEL_SET_TIMEOUT_EX, &input, &mut out).is_success());
        assert_eq!(dev.timeout, Some(Duration::from_millis(50)));
        assert!(!dev.context.debug_dump());

        assert!(dev.ioctl(abi::CHANNEL_SET_TIMEOUT_EX, &words(&[0, 0]), &mut out).is_success());
        assert_eq!(dev.timeout, None);
        assert!(dev.context.debug_dump());
        assert_eq!(dev.ioctl(abi::CHANNEL_SET_TIMEOUT_EX, &words(&[50]), &mut out), EINVAL);
    }

    #[test]
    fn test_free_client_managed_syncpoint() {
        for policy in [ResourcePolicy::PerDevice, ResourcePolicy::PerChannelInstance] {
            let host = host(policy);
            let mut dev = ChannelDevice::new(host.clone(), "nvhost-gpu", 1);
            let mut out = [0u8; 4];
            dev.ioctl(abi::CHANNEL_GET_CLIENT_MANAGED_SYNCPOINT, &name_bytes("vblank"), &mut out);
            let cm = read_u32(&out, 0);
            let hm = get_syncpoint(&mut dev, 0);

            assert_eq!(
                dev.ioctl(abi::CHANNEL_FREE_CLIENT_MANAGED_SYNCPOINT, &words(&[hm]), &mut out),
                EINVAL
            );
            assert!(dev
                .ioctl(abi::CHANNEL_FREE_CLIENT_MANAGED_SYNCPOINT, &words(&[cm]), &mut out)
                .is_success());
            assert!(!host.syncpoints().is_assigned(cm));
            assert!(host.syncpoints().is_assigned(hm));
            assert_eq!(
                dev.ioctl(abi::CHANNEL_FREE_CLIENT_MANAGED_SYNCPOINT, &words(&[cm]), &mut out),
                EINVAL
            );

            // A fresh one can be taken afterwards.
            assert!(dev
                .ioctl(abi::CHANNEL_GET_CLIENT_MANAGED_SYNCPOINT, &name_bytes("vblank"), &mut out)
                .is_success());
            assert!(host.syncpoints().is_client_managed(read_u32(&out, 0)));
        }
    }

    #[test]
    fn test_waitbases_and_modmutexes() {
        let host = host(ResourcePolicy::PerDevice);
        let mut dev = ChannelDevice::new(host.clone(), "nvhost-gpu", 1);
        let mut out = [0xFFu8; 4];
        assert!(dev.ioctl(abi::CHANNEL_GET_WAITBASES, &[], &mut out).is_success());
        assert_eq!(read_u32(&out, 0), 0);

        let num_mutexes = host.syncpoints().num_mutexes();
        assert!(dev.ioctl(abi::CHANNEL_GET_MODMUTEXES, &[], &mut out).is_success());
        assert_eq!(read_u32(&out, 0), (1u32 << num_mutexes) - 1);

        assert!(dev.ioctl(abi::CHANNEL_GET_MODMUTEX, &words(&[3]), &mut out).is_success());
        assert_eq!(read_u32(&out, 0), 3);
        assert_eq!(
            dev.ioctl(abi::CHANNEL_GET_MODMUTEX, &words(&[num_mutexes]), &mut out),
            EINVAL
        );
    }

    #[test]
    fn test_module_regrdwr() {
        let host = host(ResourcePolicy::PerDevice);
        let mut dev = ChannelDevice::new(host.clone(), "nvhost-gpu", 1);
        let mut out = [0u8; 64];

        let values: Vec<u32> = (0..70).collect();
        let mut input = words(&[1, 70 * 4, 1, 0x20]);
        input.extend(words(&values));
        assert!(dev.ioctl(abi::CHANNEL_MODULE_REGRDWR, &input, &mut out).is_success());

        let mut out = [0u8; 8];
        assert!(dev
            .ioctl(abi::CHANNEL_MODULE_REGRDWR, &words(&[2, 4, 0, 0x20, 0x20 + 69 * 4]), &mut out)
            .is_success());
        assert_eq!(read_u32(&out, 0), 0);
        assert_eq!(read_u32(&out, 4), 69);

        assert_eq!(
            dev.ioctl(abi::CHANNEL_MODULE_REGRDWR, &words(&[1, 8, 0, 128 * 4 - 4]), &mut out),
            EPERM
        );
        assert_eq!(
            dev.ioctl(abi::CHANNEL_MODULE_REGRDWR, &words(&[1, 4, 0, 2]), &mut out),
            EINVAL
        );
    }

    #[test]
    fn test_open_shares_channel_by_identifier() {
        let host = host(ResourcePolicy::PerDevice);
        let mut a = ChannelDevice::new(host.clone(), "nvhost-gpu", 1);
        let mut b = ChannelDevice::new(host.clone(), "nvhost-gpu", 2);
        let mut out_a = [0u8; 4];
        let mut out_b = [0u8; 4];
        let ident = 0xABCDu64.to_le_bytes();
        assert!(a.ioctl(abi::CHANNEL_OPEN, &ident, &mut out_a).is_success());
        assert!(b.ioctl(abi::CHANNEL_OPEN, &ident, &mut out_b).is_success());
        assert_eq!(out_a, out_b);
        assert_eq!(host.channels().live_channels(), 1);
        assert_eq!(a.ioctl(abi::CHANNEL_OPEN, &7u64.to_le_bytes(), &mut out_a), EINVAL);
        drop(a);
        assert_eq!(host.channels().live_channels(), 1);
        drop(b);
        assert_eq!(host.channels().live_channels(), 0);
    }
}
