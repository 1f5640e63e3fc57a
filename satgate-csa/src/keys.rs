//! Control word queues, one per CSA parity.
//!
//! Decryption always uses the queue head for a parity; the head is only
//! evicted after a batch explicitly marked final consumed it, i.e. on
//! crypto-period rollover.

use std::collections::VecDeque;
use std::time::Instant;

use log::debug;

use crate::{ControlWord, Parity};

#[derive(Debug, Default)]
pub struct Keys {
    queues: [VecDeque<(Instant, ControlWord)>; 2],
}

impl Keys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue the next control word for a parity. `index` is the decrypt
    /// client's adapter index, carried for the log only. A key flagged
    /// `final` starts a fresh crypto period: stale queued keys for that
    /// parity are dropped first.
    pub fn set(&mut self, cw: ControlWord, parity: Parity, index: usize, is_final: bool) {
        let queue = &mut self.queues[parity.index()];
        if is_final {
            queue.clear();
        }
        queue.push_back((Instant::now(), cw));
        debug!(
            "Key set for {parity} parity (index {index}, queued: {})",
            queue.len()
        );
    }

    /// The control word decryption must use for this parity.
    pub fn get(&self, parity: Parity) -> Option<&ControlWord> {
        self.queues[parity.index()].front().map(|(_, cw)| cw)
    }

    /// Age of the active key for this parity.
    pub fn age(&self, parity: Parity) -> Option<std::time::Duration> {
        self.queues[parity.index()]
            .front()
            .map(|(acquired, _)| acquired.elapsed())
    }

    /// Evict the exhausted head key after a final batch consumed it.
    pub fn remove(&mut self, parity: Parity) {
        if self.queues[parity.index()].pop_front().is_some() {
            debug!("Key evicted for {parity} parity");
        }
    }

    /// Drop every queued key, e.g. when the decrypt client disconnects.
    pub fn clear(&mut self) {
        self.queues[0].clear();
        self.queues[1].clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CW_A: ControlWord = [1, 2, 3, 4, 5, 6, 7, 8];
    const CW_B: ControlWord = [9, 9, 9, 9, 9, 9, 9, 9];

    #[test]
    fn head_key_is_used_until_evicted() {
        let mut keys = Keys::new();
        keys.set(CW_A, Parity::Even, 0, false);
        keys.set(CW_B, Parity::Even, 0, false);

        assert_eq!(keys.get(Parity::Even), Some(&CW_A));
        keys.remove(Parity::Even);
        assert_eq!(keys.get(Parity::Even), Some(&CW_B));
        keys.remove(Parity::Even);
        assert_eq!(keys.get(Parity::Even), None);
    }

    #[test]
    fn parities_are_independent() {
        let mut keys = Keys::new();
        keys.set(CW_A, Parity::Even, 0, false);
        assert_eq!(keys.get(Parity::Odd), None);
        assert_eq!(keys.get(Parity::Even), Some(&CW_A));
    }

    #[test]
    fn final_key_drops_stale_queue() {
        let mut keys = Keys::new();
        keys.set(CW_A, Parity::Odd, 0, false);
        keys.set(CW_B, Parity::Odd, 0, true);
        assert_eq!(keys.get(Parity::Odd), Some(&CW_B));
    }
}
