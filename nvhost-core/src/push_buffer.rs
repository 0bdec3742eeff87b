// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Circular buffer of opcode slots feeding one channel.
//!
//! A slot is one pair of words. `put` is where the producer writes next and
//! `get` is the oldest slot still owned by an unfinished job. One slot always
//! stays empty so a full buffer can be told apart from an empty one.

use nvhost_common::{HostError, Result};

pub const WORDS_PER_SLOT: usize = 2;

#[derive(Debug)]
pub struct PushBuffer {
    words: Vec<u32>,
    slots: u32,
    get: u32,
    put: u32,
}

impl PushBuffer {
    pub fn new(slots: u32) -> Result<Self> {
        if slots < 2 {
            return Err(HostError::invalid(format!("push buffer of {slots} slots")));
        }
        Ok(Self {
            words: vec![0; slots as usize * WORDS_PER_SLOT],
            slots,
            get: 0,
            put: 0,
        })
    }

    /// Usable slots; one is kept empty.
    pub fn capacity(&self) -> u32 {
        self.slots - 1
    }

    pub fn space(&self) -> u32 {
        (self.get + self.slots - self.put - 1) % self.slots
    }

    pub fn used(&self) -> u32 {
        self.capacity() - self.space()
    }

    pub fn put(&self) -> u32 {
        self.put
    }

    pub fn get(&self) -> u32 {
        self.get
    }

    /// Slot index `n` slots after `from`.
    pub fn advance(&self, from: u32, n: u32) -> u32 {
        (from + n % self.slots) % self.slots
    }

    /// Slots between `from` and `to`, walking forward.
    pub fn distance(&self, from: u32, to: u32) -> u32 {
        (to + self.slots - from) % self.slots
    }

    pub fn push(&mut self, op1: u32, op2: u32) -> Result<()> {
        if self.space() == 0 {
            return Err(HostError::fault("push buffer overflow"));
        }
        let at = self.put as usize * WORDS_PER_SLOT;
        self.words[at] = op1;
        self.words[at + 1] = op2;
        self.put = self.advance(self.put, 1);
        Ok(())
    }

    /// Release `count` slots from the consumer side.
    pub fn pop(&mut self, count: u32) {
        let count = count.min(self.used());
        self.get = self.advance(self.get, count);
    }

    /// Move `put` back to an earlier position, discarding unpublished slots.
    pub fn rewind(&mut self, put: u32) {
        if self.distance(put, self.put) <= self.distance(self.get, self.put) {
            self.put = put % self.slots;
        }
    }

    /// Words of `count` slots starting at slot `start`, wrapping.
    pub fn slot_words(&self, start: u32, count: u32) -> Vec<u32> {
        (0..count)
            .flat_map(|i| {
                let at = self.advance(start, i) as usize * WORDS_PER_SLOT;
                [self.words[at], self.words[at + 1]]
            })
            .collect()
    }

    /// Empty the buffer and restart both cursors at slot 0.
    pub fn reset(&mut self) {
        self.get = 0;
        self.put = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_one_slot_empty() {
        let mut pb = PushBuffer::new(4).unwrap();
        assert_eq!(pb.capacity(), 3);
        for i in 0..3 {
            pb.push(i, i).unwrap();
        }
        assert_eq!(pb.space(), 0);
        assert!(pb.push(9, 9).is_err());
    }

    #[test]
    fn test_wraps_around() {
        let mut pb = PushBuffer::new(4).unwrap();
        pb.push(1, 2).unwrap();
        pb.push(3, 4).unwrap();
        pb.pop(2);
        pb.push(5, 6).unwrap();
        pb.push(7, 8).unwrap();
        pb.push(9, 10).unwrap();
        assert_eq!(pb.put(), 1);
        assert_eq!(pb.slot_words(2, 3), vec![5, 6, 7, 8, 9, 10]);
        assert_eq!(pb.distance(2, pb.put()), 3);
    }

    #[test]
    fn test_pop_never_passes_put() {
        let mut pb = PushBuffer::new(8).unwrap();
        pb.push(0, 0).unwrap();
        pb.pop(5);
        assert_eq!(pb.get(), pb.put());
        assert_eq!(pb.space(), 7);
    }

    #[test]
    fn test_rewind_discards_unpublished() {
        let mut pb = PushBuffer::new(8).unwrap();
        pb.push(1, 1).unwrap();
        let mark = pb.put();
        pb.push(2, 2).unwrap();
        pb.push(3, 3).unwrap();
        pb.rewind(mark);
        assert_eq!(pb.put(), 1);
        assert_eq!(pb.used(), 1);
    }

    #[test]
    fn test_rejects_tiny_buffer() {
        assert!(PushBuffer::new(1).is_err());
    }
}
