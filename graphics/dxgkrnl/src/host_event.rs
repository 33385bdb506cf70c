//! Host-signaled events
//!
//! The host completes asynchronous waits by sending a `SignalEvent` packet
//! carrying an event id. The registry keeps every pending [`HostEvent`] in a
//! [`HostEventList`] keyed by id. Each event is backed either by a
//! [`CpuEvent`] (a counting event the caller polls or waits on) or by a
//! one-shot [`Completion`] a kernel-side waiter blocks on.
//!
//! Signal and cancel race for the list entry under the list lock: whichever
//! removes (or, for persistent events, finds) the entry first wins, so a
//! waiter is woken or cancelled exactly once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::lock::{LockRank, OrderedSpinMutex};

/// Counting CPU event, signalled by the host and consumed by waiters
#[derive(Debug, Default)]
pub struct CpuEvent {
    count: Mutex<u64>,
    cond: Condvar,
}

impl CpuEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signal(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_all();
    }

    /// Consume one signal if there is one
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Block until a signal arrives, then consume it. Returns false on
    /// timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = self.count.lock();
        while *count == 0 {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut count, deadline).timed_out() && *count == 0 {
                        return false;
                    }
                }
                None => self.cond.wait(&mut count),
            }
        }
        *count -= 1;
        true
    }

    /// Signals not consumed yet
    pub fn pending(&self) -> u64 {
        *self.count.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionState {
    Pending,
    Completed,
    Cancelled,
}

/// One-shot completion
#[derive(Debug)]
pub struct Completion {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CompletionState::Pending),
            cond: Condvar::new(),
        })
    }

    /// Complete the waiter. Returns false if already finished.
    pub fn complete(&self) -> bool {
        self.finish(CompletionState::Completed)
    }

    /// Fail the waiter. Returns false if already finished.
    pub fn cancel(&self) -> bool {
        self.finish(CompletionState::Cancelled)
    }

    fn finish(&self, to: CompletionState) -> bool {
        let mut state = self.state.lock();
        if *state != CompletionState::Pending {
            return false;
        }
        *state = to;
        self.cond.notify_all();
        true
    }

    pub fn is_completed(&self) -> bool {
        *self.state.lock() == CompletionState::Completed
    }

    /// Block until completed. Cancellation fails with `ObjectDestroyed`,
    /// expiry of `timeout` with `Timeout`.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            match *state {
                CompletionState::Completed => return Ok(()),
                CompletionState::Cancelled => return Err(Error::ObjectDestroyed),
                CompletionState::Pending => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out()
                        && *state == CompletionState::Pending
                    {
                        return Err(Error::Timeout);
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}

/// What a host event wakes when signalled
#[derive(Debug, Clone)]
pub enum HostEventTarget {
    Cpu(Arc<CpuEvent>),
    Completion(Arc<Completion>),
}

/// A pending host-signaled wait
#[derive(Debug, Clone)]
pub struct HostEvent {
    pub event_id: u64,
    /// Process the wait belongs to, 0 for driver-internal waits
    pub pid: u32,
    pub target: HostEventTarget,
    /// Remove the event from the list when it is signalled
    pub destroy_after_signal: bool,
}

impl HostEvent {
    fn fire(&self) {
        match &self.target {
            HostEventTarget::Cpu(event) => event.signal(),
            HostEventTarget::Completion(completion) => {
                completion.complete();
            }
        }
    }

    fn abort(&self) {
        if let HostEventTarget::Completion(completion) = &self.target {
            completion.cancel();
        }
    }
}

/// Registry-wide list of pending host events
pub struct HostEventList {
    next_id: AtomicU64,
    events: OrderedSpinMutex<BTreeMap<u64, HostEvent>>,
}

impl HostEventList {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            events: OrderedSpinMutex::new(LockRank::HostEventList, BTreeMap::new()),
        }
    }

    /// Allocate an event id. Ids are never reused.
    pub fn new_event_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add(&self, event: HostEvent) -> Result<()> {
        let mut events = self.events.lock();
        if event.event_id == 0 || events.contains_key(&event.event_id) {
            return Err(Error::InvalidParameter);
        }
        trace!("host event {} added (pid {})", event.event_id, event.pid);
        events.insert(event.event_id, event);
        Ok(())
    }

    /// Fire the event with `event_id`. Returns false if it was not pending,
    /// which includes losing a race with [`HostEventList::cancel`].
    pub fn signal(&self, event_id: u64) -> bool {
        let event = {
            let mut events = self.events.lock();
            match events.get(&event_id).map(|event| event.destroy_after_signal) {
                Some(true) => events.remove(&event_id),
                Some(false) => events.get(&event_id).cloned(),
                None => None,
            }
        };

        match event {
            Some(event) => {
                trace!("host event {} signalled", event_id);
                event.fire();
                true
            }
            None => {
                warn!("signal for unknown host event {}", event_id);
                false
            }
        }
    }

    /// Withdraw the event with `event_id` and fail its waiter. Returns false
    /// if it was already gone.
    pub fn cancel(&self, event_id: u64) -> bool {
        let event = self.events.lock().remove(&event_id);
        match event {
            Some(event) => {
                trace!("host event {} cancelled", event_id);
                event.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every event owned by `pid`
    pub fn cancel_for_process(&self, pid: u32) -> usize {
        let cancelled: Vec<HostEvent> = {
            let mut events = self.events.lock();
            let ids: Vec<u64> = events
                .values()
                .filter(|event| event.pid == pid)
                .map(|event| event.event_id)
                .collect();
            ids.iter().filter_map(|id| events.remove(id)).collect()
        };

        if !cancelled.is_empty() {
            debug!("cancelled {} host events of pid {}", cancelled.len(), pid);
        }
        for event in &cancelled {
            event.abort();
        }
        cancelled.len()
    }

    /// Cancel every pending event
    pub fn cancel_all(&self) -> usize {
        let cancelled = core::mem::take(&mut *self.events.lock());
        for event in cancelled.values() {
            event.abort();
        }
        cancelled.len()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HostEventList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn completion_event(list: &HostEventList, pid: u32) -> (u64, Arc<Completion>) {
        let completion = Completion::new();
        let id = list.new_event_id();
        list.add(HostEvent {
            event_id: id,
            pid,
            target: HostEventTarget::Completion(completion.clone()),
            destroy_after_signal: true,
        })
        .unwrap();
        (id, completion)
    }

    #[test]
    fn test_event_ids_unique() {
        let list = HostEventList::new();
        let a = list.new_event_id();
        let b = list.new_event_id();
        assert_ne!(a, b);
        assert_ne!(a, 0);
    }

    #[test]
    fn test_signal_completion() {
        let list = HostEventList::new();
        let (id, completion) = completion_event(&list, 1);

        assert!(list.signal(id));
        assert!(completion.is_completed());
        assert!(list.is_empty());
        assert!(!list.signal(id));
    }

    #[test]
    fn test_persistent_cpu_event() {
        let list = HostEventList::new();
        let event = CpuEvent::new();
        let id = list.new_event_id();
        list.add(HostEvent {
            event_id: id,
            pid: 1,
            target: HostEventTarget::Cpu(event.clone()),
            destroy_after_signal: false,
        })
        .unwrap();

        assert!(list.signal(id));
        assert!(list.signal(id));
        assert_eq!(event.pending(), 2);
        assert_eq!(list.len(), 1);
        assert!(list.cancel(id));
        assert!(list.is_empty());
    }

    #[test]
    fn test_cancel_fails_waiter() {
        let list = HostEventList::new();
        let (id, completion) = completion_event(&list, 1);

        assert!(list.cancel(id));
        assert!(!list.signal(id));
        assert_eq!(completion.wait(None), Err(Error::ObjectDestroyed));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let list = HostEventList::new();
        let (id, _completion) = completion_event(&list, 1);
        let dup = HostEvent {
            event_id: id,
            pid: 1,
            target: HostEventTarget::Cpu(CpuEvent::new()),
            destroy_after_signal: true,
        };
        assert_eq!(list.add(dup), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_cancel_for_process() {
        let list = HostEventList::new();
        let (_, a) = completion_event(&list, 10);
        let (_, b) = completion_event(&list, 10);
        let (other, c) = completion_event(&list, 11);

        assert_eq!(list.cancel_for_process(10), 2);
        assert_eq!(a.wait(None), Err(Error::ObjectDestroyed));
        assert_eq!(b.wait(None), Err(Error::ObjectDestroyed));
        assert_eq!(list.len(), 1);
        assert!(list.signal(other));
        assert!(c.is_completed());
    }

    #[test]
    fn test_completion_timeout() {
        let completion = Completion::new();
        assert_eq!(
            completion.wait(Some(Duration::from_millis(10))),
            Err(Error::Timeout)
        );
    }

    #[test]
    fn test_signal_cancel_race_exactly_one_wins() {
        for _ in 0..200 {
            let list = Arc::new(HostEventList::new());
            let (id, completion) = completion_event(&list, 1);

            let signaller = {
                let list = list.clone();
                thread::spawn(move || list.signal(id))
            };
            let canceller = {
                let list = list.clone();
                thread::spawn(move || list.cancel(id))
            };

            let signalled = signaller.join().unwrap();
            let cancelled = canceller.join().unwrap();

            assert!(signalled ^ cancelled);
            assert_eq!(completion.wait(None).is_ok(), signalled);
            assert!(list.is_empty());
            assert_eq!(Arc::strong_count(&completion), 1);
        }
    }

    #[test]
    fn test_cpu_event_wait_across_threads() {
        let event = CpuEvent::new();
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait(Some(Duration::from_secs(5))))
        };
        event.signal();
        assert!(waiter.join().unwrap());
        assert!(!event.try_wait());
    }
}
