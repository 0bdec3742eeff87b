// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Syncpoint threshold notifications.
//!
//! Waiters register an action against a (syncpoint, threshold) pair. When the
//! hardware reports that a syncpoint moved, every waiter whose threshold has
//! expired is removed and its action runs with the waiter lock released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use nvhost_common::SyncpointId;

/// Event delivered to the host worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// A syncpoint was incremented.
    Syncpt(SyncpointId),
    Shutdown,
}

/// One-shot signal a thread can block on.
#[derive(Default)]
pub struct WaitEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl WaitEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Block until signaled or `timeout` passes. Returns the signal state.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            self.cond.wait_for(&mut signaled, timeout);
        }
        *signaled
    }
}

/// What happens when a threshold is reached.
pub enum WaitAction {
    Wakeup(Arc<WaitEvent>),
    Callback(Box<dyn FnOnce() + Send>),
}

impl WaitAction {
    fn run(self) {
        match self {
            Self::Wakeup(event) => event.signal(),
            Self::Callback(f) => f(),
        }
    }
}

struct Waiter {
    key: u64,
    thresh: u32,
    action: WaitAction,
}

/// Reference to a registered waiter, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterRef {
    pub id: SyncpointId,
    key: u64,
}

/// Per-syncpoint waiter lists.
pub struct Intr {
    waiters: Mutex<Vec<Vec<Waiter>>>,
    next_key: AtomicU64,
}

impl Intr {
    pub fn new(num_syncpoints: u32) -> Self {
        Self {
            waiters: Mutex::new((0..num_syncpoints).map(|_| Vec::new()).collect()),
            next_key: AtomicU64::new(1),
        }
    }

    /// Register `action` to run once syncpoint `id` reaches `thresh`.
    pub fn add_action(&self, id: SyncpointId, thresh: u32, action: WaitAction) -> WaiterRef {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let mut waiters = self.waiters.lock();
        if let Some(list) = waiters.get_mut(id as usize) {
            list.push(Waiter { key, thresh, action });
            return WaiterRef { id, key };
        }
        drop(waiters);

        log::warn!("intr: waiter on invalid syncpoint {}, firing now", id);
        action.run();
        WaiterRef { id, key }
    }

    /// Cancel a waiter. Returns `false` if it already fired.
    pub fn put_ref(&self, waiter: WaiterRef) -> bool {
        let mut waiters = self.waiters.lock();
        let Some(list) = waiters.get_mut(waiter.id as usize) else {
            return false;
        };
        let before = list.len();
        list.retain(|w| w.key != waiter.key);
        list.len() != before
    }

    /// Fire every waiter on `id` for which `is_expired(thresh)` holds.
    /// Returns the number of actions run.
    pub fn handle_syncpt(&self, id: SyncpointId, is_expired: impl Fn(u32) -> bool) -> usize {
        let fired: Vec<Waiter> = {
            let mut waiters = self.waiters.lock();
            let Some(list) = waiters.get_mut(id as usize) else {
                return 0;
            };
            let (fired, pending): (Vec<Waiter>, Vec<Waiter>) = std::mem::take(list)
                .into_iter()
                .partition(|w| is_expired(w.thresh));
            *list = pending;
            fired
        };

        let count = fired.len();
        for waiter in fired {
            waiter.action.run();
        }
        count
    }

    /// Number of waiters registered on `id`.
    pub fn pending(&self, id: SyncpointId) -> usize {
        self.waiters.lock().get(id as usize).map_or(0, Vec::len)
    }
}
