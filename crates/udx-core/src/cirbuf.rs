//! Sequence-indexed circular buffer.
//!
//! An open-addressed table of `2^n` slots indexed by `seq & mask`. It backs
//! the sent-awaiting-ack and received-awaiting-delivery windows of a stream
//! and the local-id routing table of the instance. Only exact-seq lookups are
//! supported; a collision between two different sequence numbers doubles the
//! table until they no longer alias. The table never shrinks.

/// Sequence-keyed table with power-of-two capacity
#[derive(Debug, Clone)]
pub struct Cirbuf<T> {
    slots: Vec<Option<(u32, T)>>,
    mask: u32,
    len: usize,
}

impl<T> Cirbuf<T> {
    /// Create a table with at least `size` slots
    #[must_use]
    pub fn new(size: u32) -> Self {
        let size = size.max(1).next_power_of_two();
        Self {
            slots: (0..size).map(|_| None).collect(),
            mask: size - 1,
            len: 0,
        }
    }

    /// Number of slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of stored entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// No entries stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `value` under `seq`, returning the value it replaced.
    ///
    /// Only an entry with the same `seq` is ever replaced. Any other
    /// occupant of the slot forces the table to grow.
    pub fn set(&mut self, seq: u32, value: T) -> Option<T> {
        loop {
            let idx = (seq & self.mask) as usize;
            let occupant = match &self.slots[idx] {
                Some((occupant, _)) if *occupant != seq => *occupant,
                _ => break,
            };
            self.grow_past(occupant, seq);
        }

        let idx = (seq & self.mask) as usize;
        let previous = self.slots[idx].replace((seq, value)).map(|(_, v)| v);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Entry stored under exactly `seq`
    #[must_use]
    pub fn get(&self, seq: u32) -> Option<&T> {
        match &self.slots[(seq & self.mask) as usize] {
            Some((s, v)) if *s == seq => Some(v),
            _ => None,
        }
    }

    /// Mutable entry stored under exactly `seq`
    pub fn get_mut(&mut self, seq: u32) -> Option<&mut T> {
        match &mut self.slots[(seq & self.mask) as usize] {
            Some((s, v)) if *s == seq => Some(v),
            _ => None,
        }
    }

    /// An entry is stored under exactly `seq`
    #[must_use]
    pub fn contains(&self, seq: u32) -> bool {
        self.get(seq).is_some()
    }

    /// Remove and return the entry stored under exactly `seq`
    pub fn remove(&mut self, seq: u32) -> Option<T> {
        let slot = &mut self.slots[(seq & self.mask) as usize];
        match slot {
            Some((s, _)) if *s == seq => {
                self.len -= 1;
                slot.take().map(|(_, v)| v)
            }
            _ => None,
        }
    }

    /// Iterate stored entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.as_ref().map(|(s, v)| (*s, v)))
    }

    /// Remove every entry, returning them in slot order
    pub fn drain(&mut self) -> Vec<(u32, T)> {
        self.len = 0;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    fn grow_past(&mut self, a: u32, b: u32) {
        let mut size = self.slots.len();
        let mut mask = self.mask;
        while a & mask == b & mask {
            size *= 2;
            mask = (size - 1) as u32;
        }

        tracing::trace!("cirbuf grows {} -> {} slots", self.slots.len(), size);

        let old = std::mem::replace(&mut self.slots, (0..size).map(|_| None).collect());
        self.mask = mask;
        for (seq, value) in old.into_iter().flatten() {
            self.slots[(seq & mask) as usize] = Some((seq, value));
        }
    }
}
