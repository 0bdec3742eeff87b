// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Hardware syncpoint index.
pub type SyncpointId = u32;

/// Hardware channel slot index.
pub type ChannelId = u32;

/// External memory buffer handle.
pub type Handle = u32;

/// Device-visible (IOVA) address.
pub type DeviceAddr = u64;

/// Identifier handed out to each open channel instance.
pub type ClientId = u32;

/// Invalid handle sentinel.
pub const INVALID_HANDLE: Handle = 0;

/// Syncpoint that is always at zero. Wait-checks that are already satisfied
/// get patched to wait on it.
pub const GRAPHICS_HOST_SYNCPT: SyncpointId = 0;

/// Invalid syncpoint sentinel at the ABI.
pub const INVALID_SYNCPT: SyncpointId = u32::MAX;

/// Host1x class id (host register space).
pub const HOST1X_CLASS: u32 = 0x1;

/// Maximum syncpoints bound to one channel or channel instance.
pub const MODULE_MAX_SYNCPTS: usize = 16;

/// Timeout value meaning "wait forever".
pub const NO_TIMEOUT: u32 = u32::MAX;

/// Device page size for buffer placement.
pub const PAGE_SIZE: u64 = 0x1000;

/// Round `value` up to a multiple of the power-of-two `align`.
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Check that a byte offset addresses a whole 32-bit word.
#[inline]
pub const fn is_word_aligned(offset: u64) -> bool {
    offset & 3 == 0
}

/// "This syncpoint reaching this value."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fence {
    pub id: SyncpointId,
    pub thresh: u32,
}

impl Fence {
    pub const fn new(id: SyncpointId, thresh: u32) -> Self {
        Self { id, thresh }
    }
}

/// Opaque key of a logical submitter. Channels and VM contexts are looked up
/// by this value, never by slot number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(pub u64);

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx#{:x}", self.0)
    }
}
