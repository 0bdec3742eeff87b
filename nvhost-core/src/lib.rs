// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host1x command submission core.
//!
//! Syncpoints, the command DMA queue, channels and the jobs that run on
//! them, over a pluggable local or virtualized backend.

pub mod backend;
pub mod cdma;
pub mod channel;
pub mod hardware;
pub mod host;
pub mod intr;
pub mod job;
pub mod memory;
pub mod opcodes;
pub mod push_buffer;
pub mod syncpoint;
