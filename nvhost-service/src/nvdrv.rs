// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! File-descriptor table in front of the nvhost devices.
//!
//! `open` creates a device instance for a path, `ioctl` routes commands to
//! it and `close` drops it, which releases whatever the instance held.

use std::collections::HashMap;
use std::sync::Arc;

use nvhost_common::{ClientId, HostError, Result, EINVAL};
use nvhost_core::host::Host;

use crate::devices::{ChannelDevice, CtrlDevice, NvDevice};

pub const CTRL_PATH: &str = "/dev/nvhost-ctrl";
const CHANNEL_PREFIX: &str = "/dev/nvhost-";

pub struct DeviceTable {
    host: Arc<Host>,
    /// Map of file descriptor → device instance.
    devices: HashMap<u32, Box<dyn NvDevice>>,
    next_fd: u32,
    next_client: ClientId,
}

impl DeviceTable {
    pub fn new(host: Arc<Host>) -> Self {
        Self {
            host,
            devices: HashMap::new(),
            next_fd: 1,
            next_client: 1,
        }
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Open `path` and return its descriptor.
    ///
    /// `/dev/nvhost-ctrl` is the control device; any other
    /// `/dev/nvhost-<engine>` opens a channel device on the configured class.
    pub fn open(&mut self, path: &str) -> Result<u32> {
        let device: Box<dyn NvDevice> = if path == CTRL_PATH {
            Box::new(CtrlDevice::new(self.host.clone()))
        } else {
            match path.strip_prefix(CHANNEL_PREFIX) {
                Some(engine) if !engine.is_empty() && !engine.contains('/') => {
                    let client = self.next_client;
                    self.next_client += 1;
                    let name = format!("nvhost-{engine}");
                    Box::new(ChannelDevice::new(self.host.clone(), &name, client))
                }
                _ => return Err(HostError::invalid(format!("no device at {path}"))),
            }
        };

        let fd = self.next_fd;
        self.next_fd += 1;
        log::info!("nvdrv: open(\"{}\") -> fd {}", path, fd);
        self.devices.insert(fd, device);
        Ok(fd)
    }

    /// Run an ioctl on `fd`. Returns 0 or a negative errno.
    pub fn ioctl(&mut self, fd: u32, cmd: u32, input: &[u8], output: &mut [u8]) -> i32 {
        match self.devices.get_mut(&fd) {
            Some(device) => {
                log::trace!("nvdrv: ioctl fd={} ({}) cmd=0x{:X}", fd, device.name(), cmd);
                device.ioctl(cmd, input, output).as_return()
            }
            None => {
                log::warn!("nvdrv: ioctl on unknown fd {}", fd);
                EINVAL.as_return()
            }
        }
    }

    pub fn close(&mut self, fd: u32) -> Result<()> {
        let device = self
            .devices
            .remove(&fd)
            .ok_or_else(|| HostError::invalid(format!("unknown fd {fd}")))?;
        log::info!("nvdrv: close fd {} ({})", fd, device.name());
        Ok(())
    }

    pub fn open_count(&self) -> usize {
        self.devices.len()
    }
}
