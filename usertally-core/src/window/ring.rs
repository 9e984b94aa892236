//! Fixed-capacity circular buffer of the currently open windows, newest at
//! the head. The access pattern is "touch the newest window, occasionally
//! evict a few oldest", so head insert, tail evict and relative lookup are all
//! O(1) and no allocation happens per record.

use crate::error::{Error, Result};
use crate::window::Window;

#[derive(Debug)]
pub struct WindowRing {
    /// Slots are None only where no open window lives.
    buf: Box<[Option<Window>]>,
    /// Index of the newest window; meaningful only when size > 0.
    head: usize,
    size: usize,
}

impl WindowRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        Self {
            buf: (0..capacity).map(|_| None).collect(),
            head: 0,
            size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of open windows, 0..=capacity.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Maps a relative index to an absolute buffer position. `i` is folded
    /// modulo size with negatives counted from the tail, so `get(-1)` and
    /// `get(size-1)` both address the oldest window.
    fn position(&self, i: isize) -> Option<usize> {
        if self.size == 0 {
            return None;
        }
        let offset = i.rem_euclid(self.size as isize) as usize;
        Some((self.head + self.capacity() - offset) % self.capacity())
    }

    /// Live handle into ring storage; `get(0)` is the newest window.
    pub fn get(&mut self, i: isize) -> Option<&mut Window> {
        let pos = self.position(i)?;
        self.buf[pos].as_mut()
    }

    /// Read-only peek, same addressing as [`WindowRing::get`].
    pub fn peek(&self, i: isize) -> Option<&Window> {
        let pos = self.position(i)?;
        self.buf[pos].as_ref()
    }

    /// Installs a fresh empty window as the new head. The ring never grows:
    /// when it is full this fails with a capacity error and the window cannot
    /// be opened until the ring drains.
    pub fn push_new(&mut self, bucket_key: i64) -> Result<&mut Window> {
        if self.size == self.capacity() {
            return Err(Error::Window(format!(
                "Ring capacity {} exceeded, cannot open window {}",
                self.capacity(),
                bucket_key
            )));
        }
        let next = if self.size == 0 {
            self.head
        } else {
            (self.head + 1) % self.capacity()
        };
        self.buf[next] = Some(Window::new(bucket_key));
        self.head = next;
        self.size += 1;
        Ok(self.buf[next].as_mut().expect("slot was just filled"))
    }

    /// Removes up to `count` windows from the tail, oldest first, transferring
    /// ownership to the caller. Evicting more than `size` empties the ring.
    pub fn evict_oldest(&mut self, count: usize) -> Vec<Window> {
        let count = count.min(self.size);
        let mut evicted = Vec::with_capacity(count);
        for _ in 0..count {
            let tail = self
                .position(-1)
                .expect("ring is non-empty while evicting");
            evicted.push(self.buf[tail].take().expect("tail slot is occupied"));
            self.size -= 1;
        }
        if self.size == 0 {
            self.head = 0;
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addressing_newest_and_oldest() {
        let mut ring = WindowRing::new(4);
        ring.push_new(60).unwrap();
        ring.push_new(120).unwrap();
        ring.push_new(180).unwrap();

        assert_eq!(ring.size(), 3);
        assert_eq!(ring.get(0).unwrap().bucket_key, 180);
        assert_eq!(ring.get(1).unwrap().bucket_key, 120);
        assert_eq!(ring.get(2).unwrap().bucket_key, 60);
        // negative indexes count from the tail
        assert_eq!(ring.get(-1).unwrap().bucket_key, 60);
        assert_eq!(ring.get(-2).unwrap().bucket_key, 120);
        // folded modulo size
        assert_eq!(ring.get(3).unwrap().bucket_key, 180);
        assert_eq!(ring.get(4).unwrap().bucket_key, 120);
    }

    #[test]
    fn get_on_empty_ring() {
        let mut ring = WindowRing::new(2);
        assert!(ring.get(0).is_none());
        assert!(ring.get(-1).is_none());
    }

    #[test]
    fn push_fails_when_full() {
        let mut ring = WindowRing::new(2);
        ring.push_new(60).unwrap();
        ring.push_new(120).unwrap();
        assert!(ring.push_new(180).is_err());
        // the existing windows are untouched
        assert_eq!(ring.size(), 2);
        assert_eq!(ring.get(0).unwrap().bucket_key, 120);

        // draining makes room again
        ring.evict_oldest(1);
        let head = ring.push_new(180).unwrap();
        assert_eq!(head.bucket_key, 180);
    }

    #[test]
    fn evict_oldest_transfers_ownership() {
        let mut ring = WindowRing::new(4);
        ring.push_new(60).unwrap();
        ring.get(0).unwrap().increment("a");
        ring.push_new(120).unwrap();
        ring.push_new(180).unwrap();

        let evicted = ring.evict_oldest(2);
        assert_eq!(evicted.len(), 2);
        assert_eq!(evicted[0].bucket_key, 60);
        assert_eq!(evicted[0].count_for("a"), Some(1));
        assert_eq!(evicted[1].bucket_key, 120);

        assert_eq!(ring.size(), 1);
        assert_eq!(ring.get(0).unwrap().bucket_key, 180);
    }

    #[test]
    fn evicting_more_than_size_empties_cleanly() {
        let mut ring = WindowRing::new(3);
        ring.push_new(60).unwrap();
        ring.push_new(120).unwrap();

        let evicted = ring.evict_oldest(10);
        assert_eq!(evicted.len(), 2);
        assert_eq!(ring.size(), 0);
        assert!(ring.get(0).is_none());

        // the ring is fully usable after a reset
        ring.push_new(240).unwrap();
        assert_eq!(ring.size(), 1);
        assert_eq!(ring.get(0).unwrap().bucket_key, 240);
    }

    #[test]
    fn wraps_around_capacity() {
        let mut ring = WindowRing::new(3);
        ring.push_new(60).unwrap();
        ring.push_new(120).unwrap();
        ring.push_new(180).unwrap();
        ring.evict_oldest(2);
        ring.push_new(240).unwrap();
        ring.push_new(300).unwrap();

        assert_eq!(ring.size(), 3);
        assert_eq!(ring.get(0).unwrap().bucket_key, 300);
        assert_eq!(ring.get(-1).unwrap().bucket_key, 180);
    }
}
