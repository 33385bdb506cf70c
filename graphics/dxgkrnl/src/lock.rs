//! Ranked locks
//!
//! Every lock in the object graph carries a [`LockRank`]. A thread may only
//! acquire a lock whose rank is strictly greater than every rank it already
//! holds. Debug builds check this on each acquisition and panic on a
//! violation; release builds compile the check out.
//!
//! # Lock Ordering (acquire top to bottom, release in any order)
//!
//! ```text
//! ProcessList          registry process list
//! AdapterList          registry adapter list
//! ProcessAdapter       global process <-> adapter binding lists
//! AdapterCore          adapter state
//! Device               device state
//! ├── DeviceContexts   device context list
//! └── DeviceAllocs     device allocation/resource/syncobj/paging queue lists
//! Context              context state and hwqueue list
//! HwQueue              hwqueue state
//! Resource             resource allocation list
//! Allocation           allocation state and CPU lock count
//! SyncObject           sync object state
//! PagingQueue          paging queue state
//! AdapterShared        adapter shared object and syncobj lists
//! SharedObject         shared anchor participant list
//! SharedFd             shared anchor NT handle state
//! BindingDevices       binding device list
//! HandleTable          process object handle table
//! GlobalHandleTable    registry shared handle table
//! AdapterHandleTable   process adapter handle table
//! DescriptorTable      registry descriptor grants
//! HostEventList        pending host events
//! Channel              pending host requests
//! ```
//!
//! Reference counts are atomics and never take a lock.

use core::fmt;
use core::ops::{Deref, DerefMut};

#[cfg(debug_assertions)]
use std::cell::RefCell;

/// Lock rank, in acquisition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockRank {
    ProcessList = 1,
    AdapterList,
    ProcessAdapter,
    AdapterCore,
    Device,
    DeviceContexts,
    DeviceAllocs,
    Context,
    HwQueue,
    Resource,
    Allocation,
    SyncObject,
    PagingQueue,
    AdapterShared,
    SharedObject,
    SharedFd,
    BindingDevices,
    HandleTable,
    GlobalHandleTable,
    AdapterHandleTable,
    DescriptorTable,
    HostEventList,
    Channel,
}

impl LockRank {
    /// Get the name of this rank
    pub fn name(self) -> &'static str {
        match self {
            LockRank::ProcessList => "PROCESS_LIST",
            LockRank::AdapterList => "ADAPTER_LIST",
            LockRank::ProcessAdapter => "PROCESS_ADAPTER",
            LockRank::AdapterCore => "ADAPTER_CORE",
            LockRank::Device => "DEVICE",
            LockRank::DeviceContexts => "DEVICE_CONTEXTS",
            LockRank::DeviceAllocs => "DEVICE_ALLOCS",
            LockRank::Context => "CONTEXT",
            LockRank::HwQueue => "HWQUEUE",
            LockRank::Resource => "RESOURCE",
            LockRank::Allocation => "ALLOCATION",
            LockRank::SyncObject => "SYNC_OBJECT",
            LockRank::PagingQueue => "PAGING_QUEUE",
            LockRank::AdapterShared => "ADAPTER_SHARED",
            LockRank::SharedObject => "SHARED_OBJECT",
            LockRank::SharedFd => "SHARED_FD",
            LockRank::BindingDevices => "BINDING_DEVICES",
            LockRank::HandleTable => "HANDLE_TABLE",
            LockRank::GlobalHandleTable => "GLOBAL_HANDLE_TABLE",
            LockRank::AdapterHandleTable => "ADAPTER_HANDLE_TABLE",
            LockRank::DescriptorTable => "DESCRIPTOR_TABLE",
            LockRank::HostEventList => "HOST_EVENT_LIST",
            LockRank::Channel => "CHANNEL",
        }
    }
}

impl fmt::Display for LockRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (rank {})", self.name(), *self as u8)
    }
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD: RefCell<Vec<LockRank>> = RefCell::new(Vec::new());
}

/// Check the calling thread may take `rank`, then record it as held
#[cfg(debug_assertions)]
pub fn check_acquire(rank: LockRank) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(&highest) = held.iter().max() {
            if highest >= rank {
                // Drop the borrow before unwinding runs guard destructors.
                drop(held);
                panic!(
                    "Lock ordering violation: holding {}, trying to acquire {}",
                    highest, rank
                );
            }
        }
        held.push(rank);
    });
}

/// Record the release of `rank`
#[cfg(debug_assertions)]
pub fn record_release(rank: LockRank) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|r| *r == rank) {
            held.remove(pos);
        }
    });
}

/// Ranks currently held by the calling thread
#[cfg(debug_assertions)]
pub fn held_ranks() -> Vec<LockRank> {
    HELD.with(|held| held.borrow().clone())
}

#[cfg(not(debug_assertions))]
#[inline(always)]
pub fn check_acquire(_rank: LockRank) {}

#[cfg(not(debug_assertions))]
#[inline(always)]
pub fn record_release(_rank: LockRank) {}

#[cfg(not(debug_assertions))]
pub fn held_ranks() -> Vec<LockRank> {
    Vec::new()
}

/// Marker held by every ranked guard; releases the rank on drop
struct RankToken(LockRank);

impl RankToken {
    fn acquire(rank: LockRank) -> Self {
        check_acquire(rank);
        Self(rank)
    }
}

impl Drop for RankToken {
    fn drop(&mut self) {
        record_release(self.0);
    }
}

/// Mutex with a lock rank
pub struct OrderedMutex<T> {
    rank: LockRank,
    inner: parking_lot::Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub const fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: parking_lot::Mutex::new(value),
        }
    }

    pub fn rank(&self) -> LockRank {
        self.rank
    }

    pub fn lock(&self) -> OrderedMutexGuard<'_, T> {
        let token = RankToken::acquire(self.rank);
        OrderedMutexGuard {
            guard: self.inner.lock(),
            _token: token,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for OrderedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}

/// Guard for [`OrderedMutex`]
pub struct OrderedMutexGuard<'a, T> {
    // Declared first so the lock is released before the rank is popped.
    guard: parking_lot::MutexGuard<'a, T>,
    _token: RankToken,
}

impl<T> Deref for OrderedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Reader/writer lock with a lock rank
pub struct OrderedRwLock<T> {
    rank: LockRank,
    inner: parking_lot::RwLock<T>,
}

impl<T> OrderedRwLock<T> {
    pub const fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: parking_lot::RwLock::new(value),
        }
    }

    pub fn rank(&self) -> LockRank {
        self.rank
    }

    pub fn read(&self) -> OrderedReadGuard<'_, T> {
        let token = RankToken::acquire(self.rank);
        OrderedReadGuard {
            guard: self.inner.read(),
            _token: token,
        }
    }

    pub fn write(&self) -> OrderedWriteGuard<'_, T> {
        let token = RankToken::acquire(self.rank);
        OrderedWriteGuard {
            guard: self.inner.write(),
            _token: token,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for OrderedRwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedRwLock")
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}

/// Shared guard for [`OrderedRwLock`]
pub struct OrderedReadGuard<'a, T> {
    guard: parking_lot::RwLockReadGuard<'a, T>,
    _token: RankToken,
}

impl<T> Deref for OrderedReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

/// Exclusive guard for [`OrderedRwLock`]
pub struct OrderedWriteGuard<'a, T> {
    guard: parking_lot::RwLockWriteGuard<'a, T>,
    _token: RankToken,
}

impl<T> Deref for OrderedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Spinlock with a lock rank, for short critical sections that never block
pub struct OrderedSpinMutex<T> {
    rank: LockRank,
    inner: spin::Mutex<T>,
}

impl<T> OrderedSpinMutex<T> {
    pub const fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: spin::Mutex::new(value),
        }
    }

    pub fn lock(&self) -> OrderedSpinGuard<'_, T> {
        let token = RankToken::acquire(self.rank);
        OrderedSpinGuard {
            guard: self.inner.lock(),
            _token: token,
        }
    }
}

/// Guard for [`OrderedSpinMutex`]
pub struct OrderedSpinGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
    _token: RankToken,
}

impl<T> Deref for OrderedSpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascending_acquisition() {
        let outer = OrderedRwLock::new(LockRank::AdapterCore, 0u32);
        let inner = OrderedMutex::new(LockRank::HandleTable, 0u32);

        let a = outer.read();
        let mut b = inner.lock();
        *b += *a + 1;
        drop(b);
        drop(a);

        assert_eq!(*inner.lock(), 1);
        assert!(held_ranks().is_empty());
    }

    #[test]
    fn test_release_out_of_order() {
        let first = OrderedMutex::new(LockRank::Device, ());
        let second = OrderedMutex::new(LockRank::Context, ());

        let a = first.lock();
        let b = second.lock();
        drop(a);
        drop(b);

        // Both released; taking the lower rank again is fine.
        let _a = first.lock();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_descending_acquisition_panics() {
        let outer = OrderedMutex::new(LockRank::HandleTable, ());
        let inner = OrderedRwLock::new(LockRank::AdapterCore, ());

        let _a = outer.lock();
        let _b = inner.read();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_same_rank_nesting_panics() {
        let a = OrderedRwLock::new(LockRank::Device, ());
        let b = OrderedRwLock::new(LockRank::Device, ());

        let _x = a.read();
        let _y = b.read();
    }
}
