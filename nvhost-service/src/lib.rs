// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! User-facing nvhost devices: the ioctl ABI, the ctrl and channel devices
//! and the descriptor table that routes calls to them.

pub mod abi;
pub mod devices;
pub mod nvdrv;

pub use devices::{ChannelDevice, CtrlDevice, NvDevice};
pub use nvdrv::DeviceTable;
