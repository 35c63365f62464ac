//! Fixed-size ownership table for live connection handles

use crate::stack::ConnHandle;

/// Maximum number of simultaneous peer connections.
pub const MAX_PEERS: usize = 5;

/// Records which handles currently hold an open SPP link.
///
/// An arena-style fixed array with linear scans; peer counts stay small
/// enough that nothing fancier pays for itself.
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: [Option<ConnHandle>; MAX_PEERS],
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            slots: [None; MAX_PEERS],
        }
    }

    /// Occupy the first empty slot with `handle`.
    ///
    /// Returns `false` when the table is full. The target list is validated
    /// against `MAX_PEERS`, so a full table indicates a configuration error.
    pub fn allocate(&mut self, handle: ConnHandle) -> bool {
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(handle);
                return true;
            }
        }
        false
    }

    /// Clear the slot holding `handle`.
    ///
    /// Releasing a handle that is not present is a no-op returning `false`.
    pub fn release(&mut self, handle: ConnHandle) -> bool {
        for slot in self.slots.iter_mut() {
            if *slot == Some(handle) {
                *slot = None;
                return true;
            }
        }
        false
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// First occupied slot in table order, if any.
    pub fn first_occupied(&self) -> Option<ConnHandle> {
        self.slots.iter().flatten().copied().next()
    }

    /// Next occupied slot in circular order after the slot holding `current`.
    ///
    /// When `current` is `None`, or its slot has been released since the last
    /// rotation, the scan restarts from the first occupied slot in table
    /// order. Returns `None` only when no slot is occupied; callers must
    /// check the connection count before rotating.
    pub fn next_write_target(&self, current: Option<ConnHandle>) -> Option<ConnHandle> {
        let start = match current.and_then(|h| self.slots.iter().position(|s| *s == Some(h))) {
            Some(pos) => pos + 1,
            None => 0,
        };
        for offset in 0..MAX_PEERS {
            let idx = (start + offset) % MAX_PEERS;
            if let Some(handle) = self.slots[idx] {
                return Some(handle);
            }
        }
        None
    }
}
