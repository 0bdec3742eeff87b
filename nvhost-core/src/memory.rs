// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Buffer registry: external memory handles and their device addresses.
//!
//! Each buffer gets a page-aligned device address range from a bump
//! allocator when it is created. Pinning a handle takes a reference that keeps
//! the buffer resident at that address until the matching unpin; a buffer
//! cannot be destroyed while pinned.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use nvhost_common::{align_up, is_word_aligned, DeviceAddr, Handle, HostError, Result, PAGE_SIZE};

/// First device address handed out.
const DEVICE_VA_BASE: DeviceAddr = 0x0400_0000;

struct Buffer {
    size: u64,
    address: DeviceAddr,
    words: Vec<u32>,
    pins: u32,
}

#[derive(Default)]
struct RegistryInner {
    buffers: HashMap<Handle, Buffer>,
    /// Start address -> handle, for device-side lookups.
    by_address: BTreeMap<DeviceAddr, Handle>,
    next_handle: Handle,
    next_address: DeviceAddr,
}

/// Handle table shared by submitters and the hardware.
pub struct BufferRegistry {
    inner: RwLock<RegistryInner>,
    resolutions: AtomicU64,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                next_handle: 1,
                next_address: DEVICE_VA_BASE,
                ..Default::default()
            }),
            resolutions: AtomicU64::new(0),
        }
    }

    /// Allocate a zeroed buffer of `size` bytes and return its handle.
    pub fn create(&self, size: u64) -> Result<Handle> {
        if size == 0 || !is_word_aligned(size) {
            return Err(HostError::invalid(format!("buffer size {size:#x}")));
        }
        let words = usize::try_from(size / 4)
            .map_err(|_| HostError::OutOfMemory(format!("buffer size {size:#x}")))?;

        let mut inner = self.inner.write();
        let handle = inner.next_handle;
        let address = inner.next_address;
        inner.next_handle += 1;
        inner.next_address = address
            .checked_add(align_up(size, PAGE_SIZE))
            .ok_or_else(|| HostError::OutOfMemory("device address space".into()))?;
        inner.buffers.insert(
            handle,
            Buffer {
                size,
                address,
                words: vec![0; words],
                pins: 0,
            },
        );
        inner.by_address.insert(address, handle);
        log::trace!("nvmap: create handle {} size 0x{:X} at 0x{:X}", handle, size, address);
        Ok(handle)
    }

    /// Destroy a buffer. Fails with `Busy` while it is pinned.
    pub fn destroy(&self, handle: Handle) -> Result<()> {
        let mut inner = self.inner.write();
        let buffer = inner
            .buffers
            .get(&handle)
            .ok_or_else(|| HostError::invalid(format!("unknown handle {handle}")))?;
        if buffer.pins > 0 {
            return Err(HostError::Busy);
        }
        let address = buffer.address;
        inner.buffers.remove(&handle);
        inner.by_address.remove(&address);
        Ok(())
    }

    pub fn size(&self, handle: Handle) -> Option<u64> {
        self.inner.read().buffers.get(&handle).map(|b| b.size)
    }

    /// Resolve `handle` to its device address and take a pin reference.
    pub fn pin(&self, handle: Handle) -> Result<DeviceAddr> {
        let mut inner = self.inner.write();
        let buffer = inner.buffers.get_mut(&handle).ok_or_else(|| HostError::PinFailure {
            handle,
            reason: "unknown handle".into(),
        })?;
        buffer.pins += 1;
        self.resolutions.fetch_add(1, Ordering::Relaxed);
        Ok(buffer.address)
    }

    /// Drop a pin reference taken by [`pin`](Self::pin).
    pub fn unpin(&self, handle: Handle) {
        let mut inner = self.inner.write();
        match inner.buffers.get_mut(&handle) {
            Some(buffer) if buffer.pins > 0 => buffer.pins -= 1,
            _ => log::warn!("nvmap: unbalanced unpin of handle {}", handle),
        }
    }

    pub fn pin_count(&self, handle: Handle) -> u32 {
        self.inner.read().buffers.get(&handle).map_or(0, |b| b.pins)
    }

    /// Total number of handle resolutions performed so far.
    pub fn resolutions(&self) -> u64 {
        self.resolutions.load(Ordering::Relaxed)
    }

    /// Write words at a byte offset inside a buffer.
    pub fn write_words(&self, handle: Handle, offset: u64, data: &[u32]) -> Result<()> {
        let mut inner = self.inner.write();
        let buffer = inner
            .buffers
            .get_mut(&handle)
            .ok_or_else(|| HostError::invalid(format!("unknown handle {handle}")))?;
        let range = word_range(buffer, offset, data.len())?;
        buffer.words[range].copy_from_slice(data);
        Ok(())
    }

    /// Read words at a byte offset inside a buffer.
    pub fn read_words(&self, handle: Handle, offset: u64, count: usize) -> Result<Vec<u32>> {
        let inner = self.inner.read();
        let buffer = inner
            .buffers
            .get(&handle)
            .ok_or_else(|| HostError::invalid(format!("unknown handle {handle}")))?;
        let range = word_range(buffer, offset, count)?;
        Ok(buffer.words[range].to_vec())
    }

    /// Fetch words by device address, as the channel DMA engine does.
    pub fn read_device(&self, address: DeviceAddr, count: usize) -> Result<Vec<u32>> {
        let inner = self.inner.read();
        let (&start, handle) = inner
            .by_address
            .range(..=address)
            .next_back()
            .ok_or_else(|| HostError::fault(format!("unmapped device address 0x{address:X}")))?;
        let buffer = &inner.buffers[handle];
        if buffer.pins == 0 {
            return Err(HostError::fault(format!(
                "fetch from unpinned handle {} at 0x{:X}",
                handle, address
            )));
        }
        let range = word_range(buffer, address - start, count)
            .map_err(|_| HostError::fault(format!("fetch past end of handle {handle}")))?;
        Ok(buffer.words[range].to_vec())
    }
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn word_range(buffer: &Buffer, offset: u64, count: usize) -> Result<std::ops::Range<usize>> {
    if !is_word_aligned(offset) {
        return Err(HostError::invalid(format!("offset {offset:#x} not word aligned")));
    }
    let start = (offset / 4) as usize;
    let end = start
        .checked_add(count)
        .filter(|&end| end <= buffer.words.len())
        .ok_or_else(|| {
            HostError::invalid(format!(
                "range 0x{:X}+{} words outside buffer of 0x{:X} bytes",
                offset, count, buffer.size
            ))
        })?;
    Ok(start..end)
}
