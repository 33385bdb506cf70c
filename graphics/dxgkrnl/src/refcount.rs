//! Logical reference counts
//!
//! `Arc` keeps the memory alive; a [`RefCount`] decides when an object is
//! torn down. The count starts at one, and once it reaches zero it can never
//! be raised again, so a racing `acquire` either wins before the final
//! release or fails.

use core::sync::atomic::{AtomicU32, Ordering};

/// Non-resurrecting atomic reference count
#[derive(Debug)]
pub struct RefCount(AtomicU32);

impl RefCount {
    /// Create a count holding the creator's reference
    pub const fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    /// Take a reference. Fails once the count has reached zero.
    pub fn acquire(&self) -> bool {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a reference. Returns true for the release that reached zero.
    ///
    /// Releasing an already-zero count is a programming error and panics.
    pub fn release(&self) -> bool {
        let previous = self.0.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            panic!("RefCount underflow");
        }
        previous == 1
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of a device-tree object
///
/// ```text
/// Created ──► Active ──► Stopped
///    │          │           │
///    └──────────┴───────────┴──► Destroyed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Created,
    Active,
    Stopped,
    Destroyed,
}

impl ObjectState {
    pub fn can_transition(self, to: ObjectState) -> bool {
        use ObjectState::*;
        matches!(
            (self, to),
            (Created, Active) | (Created, Stopped) | (Active, Stopped) | (_, Destroyed)
        ) && self != Destroyed
    }

    /// Move to `to`. An illegal transition is a programming error.
    pub fn advance(&mut self, to: ObjectState) {
        if !self.can_transition(to) {
            panic!("illegal object state transition {:?} -> {:?}", self, to);
        }
        *self = to;
    }

    /// Stop unless already stopped or destroyed. Returns true if this call
    /// stopped the object.
    pub fn stop(&mut self) -> bool {
        match self {
            ObjectState::Created | ObjectState::Active => {
                *self = ObjectState::Stopped;
                true
            }
            ObjectState::Stopped | ObjectState::Destroyed => false,
        }
    }

    /// Test-and-set of the destroyed state. Returns true for the one caller
    /// that gets to tear the object down.
    pub fn mark_destroyed(&mut self) -> bool {
        if *self == ObjectState::Destroyed {
            return false;
        }
        *self = ObjectState::Destroyed;
        true
    }

    /// Publish a freshly created object. Returns false if it was stopped or
    /// destroyed before it got here.
    pub fn activate(&mut self) -> bool {
        if *self == ObjectState::Created {
            *self = ObjectState::Active;
            true
        } else {
            false
        }
    }

    pub fn is_active(self) -> bool {
        self == ObjectState::Active
    }
}
