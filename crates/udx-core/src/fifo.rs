//! Growable ring-buffer queue with undo and hinted removal.
//!
//! `undo` reverses the most recent `shift`, which lets a sender take an item,
//! try to transmit it, and put it back at the head when the socket would
//! block. `remove` leaves a tombstone that later shifts skip over.

/// FIFO of small copyable values
#[derive(Debug, Clone)]
pub struct Fifo<T> {
    values: Vec<Option<T>>,
    mask: usize,
    btm: usize,
    /// Occupied window, tombstones included
    len: usize,
    live: usize,
}

impl<T: Copy + PartialEq> Fifo<T> {
    /// Create a queue with room for at least `size` values before growing
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1).next_power_of_two();
        Self {
            values: vec![None; size],
            mask: size - 1,
            btm: 0,
            len: 0,
            live: 0,
        }
    }

    /// Number of queued values
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// No queued values
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Append `value`, returning its position for a later [`remove`](Self::remove)
    pub fn push(&mut self, value: T) -> usize {
        if self.len == self.values.len() {
            self.grow();
        }
        let pos = (self.btm + self.len) & self.mask;
        self.values[pos] = Some(value);
        self.len += 1;
        self.live += 1;
        pos
    }

    /// Pop the head, skipping tombstones
    pub fn shift(&mut self) -> Option<T> {
        while self.len > 0 {
            let value = self.values[self.btm];
            self.btm = (self.btm + 1) & self.mask;
            self.len -= 1;
            if value.is_some() {
                self.live -= 1;
                return value;
            }
        }
        None
    }

    /// Head value without removing it
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        (0..self.len).find_map(|i| self.values[(self.btm + i) & self.mask])
    }

    /// Put back the value returned by the most recent [`shift`](Self::shift)
    pub fn undo(&mut self) {
        self.btm = (self.btm + self.mask) & self.mask;
        self.len += 1;
        self.live += 1;
    }

    /// Remove `value`, trying position `hint` before sweeping the queue.
    ///
    /// Returns whether the value was found.
    pub fn remove(&mut self, value: T, hint: usize) -> bool {
        let pos = if self.in_window(hint) && self.values[hint] == Some(value) {
            Some(hint)
        } else {
            (0..self.len)
                .map(|i| (self.btm + i) & self.mask)
                .find(|&p| self.values[p] == Some(value))
        };

        let Some(pos) = pos else {
            return false;
        };

        self.values[pos] = None;
        self.live -= 1;
        while self.len > 0 && self.values[self.btm].is_none() {
            self.btm = (self.btm + 1) & self.mask;
            self.len -= 1;
        }
        true
    }

    /// Queued values in order
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).filter_map(move |i| self.values[(self.btm + i) & self.mask])
    }

    /// Drop every queued value
    pub fn clear(&mut self) {
        self.values.iter_mut().for_each(|v| *v = None);
        self.btm = 0;
        self.len = 0;
        self.live = 0;
    }

    fn in_window(&self, pos: usize) -> bool {
        pos < self.values.len() && (pos.wrapping_sub(self.btm) & self.mask) < self.len
    }

    fn grow(&mut self) {
        let old_size = self.values.len();
        self.values.resize(old_size * 2, None);
        self.mask = old_size * 2 - 1;
        // Relinearize the wrapped prefix behind the old end
        for i in 0..self.btm {
            self.values[old_size + i] = self.values[i].take();
        }
    }
}
