// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

/// Status code returned across the device ABI.
///
/// Zero is success; failures carry a positive errno value and are reported to
/// callers negated, the way an ioctl return value would be.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    pub const SUCCESS: Self = Self(0);

    /// Check if this is a success status.
    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Value returned from an ioctl: `0` or `-errno`.
    #[inline]
    pub const fn as_return(self) -> i32 {
        -self.0
    }

    /// Recover a status from an ioctl return value.
    #[inline]
    pub const fn from_return(ret: i32) -> Self {
        Self(ret.wrapping_neg())
    }

    /// Raw errno value.
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl std::fmt::Debug for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_success() {
            write!(f, "Errno::SUCCESS")
        } else {
            write!(f, "Errno({})", self.0)
        }
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

pub const EPERM: Errno = Errno(1);
pub const EINTR: Errno = Errno(4);
pub const EIO: Errno = Errno(5);
pub const EAGAIN: Errno = Errno(11);
pub const ENOMEM: Errno = Errno(12);
pub const EFAULT: Errno = Errno(14);
pub const EBUSY: Errno = Errno(16);
pub const ENODEV: Errno = Errno(19);
pub const EINVAL: Errno = Errno(22);
pub const ENOTTY: Errno = Errno(25);
pub const ETIMEDOUT: Errno = Errno(110);

/// Errors raised by the submission and synchronization core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// No free channel or syncpoint within the allowed bound.
    #[error("no free {0} available")]
    ResourceExhausted(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A buffer handle could not be resolved; partial pins were rolled back.
    #[error("failed to pin handle {handle}: {reason}")]
    PinFailure { handle: u32, reason: String },

    #[error("timed out: {0}")]
    Timeout(String),

    /// Register or remote response mismatch.
    #[error("hardware fault: {0}")]
    HardwareFault(String),

    #[error("resource busy")]
    Busy,

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("wait interrupted")]
    Interrupted,

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl HostError {
    /// Errno reported for this error at the device ABI.
    pub fn errno(&self) -> Errno {
        match self {
            Self::ResourceExhausted(_) => EAGAIN,
            Self::InvalidArgument(_) => EINVAL,
            Self::PinFailure { .. } => EFAULT,
            Self::Timeout(_) => ETIMEDOUT,
            Self::HardwareFault(_) => EIO,
            Self::Busy => EBUSY,
            Self::OutOfMemory(_) => ENOMEM,
            Self::Interrupted => EINTR,
            Self::PermissionDenied(_) => EPERM,
        }
    }

    /// Rebuild an error from an errno reported by a remote peer.
    pub fn from_errno(errno: Errno, context: &str) -> Self {
        match errno {
            EAGAIN => Self::ResourceExhausted("remote resource"),
            EINVAL => Self::InvalidArgument(context.to_string()),
            EFAULT => Self::PinFailure {
                handle: 0,
                reason: context.to_string(),
            },
            ETIMEDOUT => Self::Timeout(context.to_string()),
            EBUSY => Self::Busy,
            ENOMEM => Self::OutOfMemory(context.to_string()),
            EINTR => Self::Interrupted,
            EPERM => Self::PermissionDenied(context.to_string()),
            _ => Self::HardwareFault(format!("{context}: {errno}")),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn fault(msg: impl Into<String>) -> Self {
        Self::HardwareFault(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
