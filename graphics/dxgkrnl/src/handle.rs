//! Handle tables
//!
//! A handle table maps small non-zero integers to typed objects. Each
//! process owns two tables (objects and adapters) and the registry owns one
//! global table for shared anchors.
//!
//! # Handle Layout
//!
//! ```text
//!  31                              5 4        0
//! ┌─────────────────────────────────┬──────────┐
//! │           slot index            │ instance │
//! └─────────────────────────────────┴──────────┘
//! ```
//!
//! The instance counter of a slot is bumped every time the slot is freed and
//! is never zero, so a handle is never zero and a stale handle does not match
//! the slot's next tenant. Freed slots are reused in FIFO order.
//!
//! # Two-Phase Free
//!
//! Destroying an object first calls [`HandleTable::mark_destroyed`], which
//! makes every lookup fail while the slot stays reserved. The slot is only
//! returned by [`HandleTable::free`] once the object's last reference is
//! gone.

use core::fmt;
use std::collections::VecDeque;

#[cfg(feature = "debug-logging")]
use log::trace;

use crate::error::{Error, Result};
use crate::lock::{LockRank, OrderedRwLock};

const INSTANCE_BITS: u32 = 5;
const INSTANCE_MASK: u32 = (1 << INSTANCE_BITS) - 1;
/// Largest slot count a table can address
pub const MAX_SLOTS: usize = (u32::MAX >> INSTANCE_BITS) as usize;

/// Opaque object handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u32);

impl Handle {
    /// Wrap a raw value received from a caller. Zero is never a handle.
    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    fn new(index: usize, instance: u32) -> Self {
        Self(((index as u32) << INSTANCE_BITS) | instance)
    }

    fn index(self) -> usize {
        (self.0 >> INSTANCE_BITS) as usize
    }

    fn instance(self) -> u32 {
        self.0 & INSTANCE_MASK
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Type tag of a handle table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleType {
    Adapter,
    Device,
    Context,
    HwQueue,
    /// Progress fence of a hardware queue
    MonitoredFence,
    Allocation,
    Resource,
    SyncObject,
    PagingQueue,
    SharedResource,
    SharedSyncObject,
}

fn next_instance(instance: u32) -> u32 {
    if instance >= INSTANCE_MASK {
        1
    } else {
        instance + 1
    }
}

enum Slot<T> {
    Free {
        instance: u32,
    },
    Live {
        instance: u32,
        handle_type: HandleType,
        destroyed: bool,
        object: T,
    },
}

struct TableInner<T> {
    slots: Vec<Slot<T>>,
    free: VecDeque<usize>,
    live: usize,
}

/// Typed handle table guarded by a ranked reader/writer lock
pub struct HandleTable<T> {
    name: &'static str,
    capacity: usize,
    inner: OrderedRwLock<TableInner<T>>,
}

impl<T: Clone> HandleTable<T> {
    /// Create an empty table holding at most `capacity` entries
    pub fn new(name: &'static str, rank: LockRank, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.min(MAX_SLOTS),
            inner: OrderedRwLock::new(
                rank,
                TableInner {
                    slots: Vec::new(),
                    free: VecDeque::new(),
                    live: 0,
                },
            ),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of reserved slots, including ones marked destroyed
    pub fn len(&self) -> usize {
        self.inner.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `object` and return its new handle
    pub fn allocate(&self, object: T, handle_type: HandleType) -> Result<Handle> {
        let mut inner = self.inner.write();

        if inner.live >= self.capacity {
            return Err(Error::HandleTableFull);
        }

        let index = match inner.free.pop_front() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot::Free { instance: 1 });
                inner.slots.len() - 1
            }
        };

        let instance = match inner.slots[index] {
            Slot::Free { instance } => instance,
            Slot::Live { .. } => unreachable!("free list points at a live slot"),
        };

        inner.slots[index] = Slot::Live {
            instance,
            handle_type,
            destroyed: false,
            object,
        };
        inner.live += 1;

        let handle = Handle::new(index, instance);

        #[cfg(feature = "debug-logging")]
        trace!("{}: allocate {} {:?}", self.name, handle, handle_type);

        Ok(handle)
    }

    /// Get the object behind `handle` if it is live and of type `handle_type`
    pub fn lookup(&self, handle: Handle, handle_type: HandleType) -> Result<T> {
        let (found_type, object) = self.lookup_any(handle)?;
        if found_type != handle_type {
            return Err(Error::WrongHandleType);
        }
        Ok(object)
    }

    /// Get the object and its type behind `handle`
    pub fn lookup_any(&self, handle: Handle) -> Result<(HandleType, T)> {
        let inner = self.inner.read();
        match inner.slots.get(handle.index()) {
            Some(Slot::Live {
                instance,
                handle_type,
                destroyed: false,
                object,
            }) if *instance == handle.instance() => Ok((*handle_type, object.clone())),
            _ => Err(Error::InvalidHandle),
        }
    }

    /// Make every further lookup of `handle` fail while keeping its slot.
    /// Returns false if the handle was not live or was already marked.
    pub fn mark_destroyed(&self, handle: Handle) -> bool {
        let mut inner = self.inner.write();
        match inner.slots.get_mut(handle.index()) {
            Some(Slot::Live {
                instance,
                destroyed,
                ..
            }) if *instance == handle.instance() && !*destroyed => {
                *destroyed = true;
                true
            }
            _ => false,
        }
    }

    /// Release the slot of `handle` and return its object
    pub fn free(&self, handle: Handle) -> Option<T> {
        let mut inner = self.inner.write();
        let index = handle.index();

        match inner.slots.get(index) {
            Some(Slot::Live { instance, .. }) if *instance == handle.instance() => {}
            _ => return None,
        }

        let old = core::mem::replace(
            &mut inner.slots[index],
            Slot::Free {
                instance: next_instance(handle.instance()),
            },
        );
        inner.free.push_back(index);
        inner.live -= 1;

        #[cfg(feature = "debug-logging")]
        trace!("{}: free {}", self.name, handle);

        match old {
            Slot::Live { object, .. } => Some(object),
            Slot::Free { .. } => None,
        }
    }

    /// Snapshot of every live, non-destroyed entry
    pub fn entries(&self) -> Vec<(Handle, HandleType, T)> {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Live {
                    instance,
                    handle_type,
                    destroyed: false,
                    object,
                } => Some((Handle::new(index, *instance), *handle_type, object.clone())),
                _ => None,
            })
            .collect()
    }
}

impl<T> fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(capacity: usize) -> HandleTable<u32> {
        HandleTable::new("test", LockRank::HandleTable, capacity)
    }

    #[test]
    fn test_allocate_lookup() {
        let t = table(16);
        let a = t.allocate(10, HandleType::Device).unwrap();
        let b = t.allocate(20, HandleType::Context).unwrap();

        assert_ne!(a, b);
        assert_ne!(a.raw(), 0);
        assert_eq!(t.lookup(a, HandleType::Device), Ok(10));
        assert_eq!(t.lookup(b, HandleType::Context), Ok(20));
        assert_eq!(t.lookup(a, HandleType::Context), Err(Error::WrongHandleType));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_zero_is_never_a_handle() {
        assert!(Handle::from_raw(0).is_none());
        let t = table(4);
        for i in 0..4 {
            assert_ne!(t.allocate(i, HandleType::Allocation).unwrap().raw(), 0);
        }
    }

    #[test]
    fn test_free_then_lookup_fails() {
        let t = table(16);
        let h = t.allocate(1, HandleType::SyncObject).unwrap();
        assert_eq!(t.free(h), Some(1));
        assert_eq!(t.lookup(h, HandleType::SyncObject), Err(Error::InvalidHandle));
        assert_eq!(t.free(h), None);
        assert!(t.is_empty());
    }

    #[test]
    fn test_never_allocated_lookup_fails() {
        let t = table(16);
        let bogus = Handle::from_raw(0x1234).unwrap();
        assert_eq!(t.lookup_any(bogus), Err(Error::InvalidHandle));
    }

    #[test]
    fn test_mark_destroyed_keeps_slot() {
        let t = table(1);
        let h = t.allocate(5, HandleType::Device).unwrap();

        assert!(t.mark_destroyed(h));
        assert!(!t.mark_destroyed(h));
        assert_eq!(t.lookup(h, HandleType::Device), Err(Error::InvalidHandle));

        // Slot is still reserved until freed.
        assert_eq!(t.allocate(6, HandleType::Device), Err(Error::HandleTableFull));
        assert_eq!(t.free(h), Some(5));
        assert!(t.allocate(6, HandleType::Device).is_ok());
    }

    #[test]
    fn test_slot_reuse_changes_handle() {
        let t = table(1);
        let first = t.allocate(1, HandleType::Resource).unwrap();
        t.free(first);
        let second = t.allocate(2, HandleType::Resource).unwrap();

        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert_eq!(t.lookup(first, HandleType::Resource), Err(Error::InvalidHandle));
        assert_eq!(t.lookup(second, HandleType::Resource), Ok(2));
    }

    #[test]
    fn test_instance_wraps_without_zero() {
        let t = table(1);
        for i in 0..100 {
            let h = t.allocate(i, HandleType::Context).unwrap();
            assert_ne!(h.instance(), 0);
            t.free(h);
        }
    }

    #[test]
    fn test_capacity_exhaustion() {
        let t = table(3);
        for i in 0..3 {
            t.allocate(i, HandleType::Allocation).unwrap();
        }
        assert_eq!(
            t.allocate(3, HandleType::Allocation),
            Err(Error::HandleTableFull)
        );
    }

    #[test]
    fn test_entries_skip_destroyed() {
        let t = table(8);
        let a = t.allocate(1, HandleType::Device).unwrap();
        let b = t.allocate(2, HandleType::SyncObject).unwrap();
        t.mark_destroyed(a);

        let entries = t.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], (b, HandleType::SyncObject, 2));
    }
}
