//! Generational arena.
//!
//! Streams, sockets, queued packets and write requests live in arenas and are
//! referred to by [`Handle`]s. A handle pairs a slot index with the slot's
//! generation, so a handle to a removed value never resolves to whatever
//! later reuses the slot.

use std::fmt;

/// Generation-checked reference into an [`Arena`]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Slot index
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Slot generation at insertion time
    #[must_use]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone)]
enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

/// Slot storage with free-list reuse and generation checks
#[derive(Debug, Clone)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Create an empty arena
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Number of live values
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// No live values
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `value` and return its handle
    pub fn insert(&mut self, value: T) -> Handle {
        self.insert_with(|_| value)
    }

    /// Store the value built from its own handle
    pub fn insert_with(&mut self, build: impl FnOnce(Handle) -> T) -> Handle {
        self.len += 1;

        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            if let Slot::Vacant {
                generation,
                next_free,
            } = *slot
            {
                let handle = Handle { index, generation };
                self.free_head = next_free;
                *slot = Slot::Occupied {
                    generation,
                    value: build(handle),
                };
                return handle;
            }
        }

        let handle = Handle {
            index: self.slots.len() as u32,
            generation: 0,
        };
        self.slots.push(Slot::Occupied {
            generation: 0,
            value: build(handle),
        });
        handle
    }

    /// Value behind `handle`, if still live
    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Mutable value behind `handle`, if still live
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// `handle` still refers to a live value
    #[must_use]
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Remove the value behind `handle`, retiring the handle
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {
                let vacant = Slot::Vacant {
                    generation: generation.wrapping_add(1),
                    next_free: self.free_head,
                };
                self.free_head = Some(handle.index);
                self.len -= 1;
                match std::mem::replace(slot, vacant) {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Vacant { .. } => None,
                }
            }
            _ => None,
        }
    }

    /// Two distinct live values at once
    pub fn get2_mut(&mut self, a: Handle, b: Handle) -> Option<(&mut T, &mut T)> {
        if a.index == b.index || !self.contains(a) || !self.contains(b) {
            return None;
        }
        let (lo, hi) = if a.index < b.index { (a, b) } else { (b, a) };
        let (head, tail) = self.slots.split_at_mut(hi.index as usize);
        let lo_value = match &mut head[lo.index as usize] {
            Slot::Occupied { value, .. } => value,
            Slot::Vacant { .. } => return None,
        };
        let hi_value = match &mut tail[0] {
            Slot::Occupied { value, .. } => value,
            Slot::Vacant { .. } => return None,
        };
        if a.index < b.index {
            Some((lo_value, hi_value))
        } else {
            Some((hi_value, lo_value))
        }
    }

    /// Live values in slot order
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => Some((
                    Handle {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }

    /// Live values in slot order, mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => Some((
                    Handle {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }

    /// Snapshot of live handles in slot order
    #[must_use]
    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(h, _)| h).collect()
    }
}
