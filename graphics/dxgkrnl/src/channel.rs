//! Host communication channel
//!
//! Every state-changing operation is a request/response round trip with the
//! host. Requests are correlated with completions by a monotonically
//! increasing `request_id`:
//!
//! ```text
//!  caller                    Channel                     transport
//!    │ send_request()          │                             │
//!    │────────────────────────►│ pending.insert(id)          │
//!    │                         │────── send(packet) ────────►│
//!    │   (blocks on slot)      │                             │
//!    │                         │◄── callback(Completion id) ─│
//!    │◄──── slot filled ───────│ pending.remove(id)          │
//! ```
//!
//! `SignalEvent` packets arriving on the same callback are forwarded to the
//! registry's [`HostEventList`]. Closing the channel fails every pending
//! request with `ChannelClosed`; nothing is ever retried.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{error, info, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::host_event::HostEventList;
use crate::lock::{LockRank, OrderedMutex};
use crate::protocol::{GuestPacket, HostHandle, HostPacket, HostRequest, HostResponse, HostStatus};

/// Receive callback installed on a transport
pub type ReceiveCallback = Arc<dyn Fn(HostPacket) + Send + Sync>;

/// Transport a channel rides on
///
/// `send` hands a packet to the host. Host packets are delivered through the
/// receive callback, from any thread, possibly before `send` returns.
pub trait HostTransport: Send + Sync {
    fn send(&self, packet: GuestPacket) -> Result<()>;

    fn set_receive_callback(&self, callback: ReceiveCallback);
}

/// One-shot completion slot of a pending request
struct PendingRequest {
    slot: Mutex<Option<Result<HostResponse>>>,
    cond: Condvar,
}

impl PendingRequest {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn fill(&self, result: Result<HostResponse>) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(result);
            self.cond.notify_all();
        }
    }

    fn wait(&self, deadline: Option<Instant>) -> Option<Result<HostResponse>> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return Some(result);
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut slot, deadline).timed_out() {
                        return slot.take();
                    }
                }
                None => self.cond.wait(&mut slot),
            }
        }
    }
}

/// Channel statistics
#[derive(Debug, Default)]
pub struct ChannelStats {
    pub requests_sent: AtomicU64,
    pub completions: AtomicU64,
    pub host_errors: AtomicU64,
    pub late_completions: AtomicU64,
    pub events: AtomicU64,
}

/// Request/response channel to the host
pub struct Channel {
    name: String,
    transport: Arc<dyn HostTransport>,
    events: Arc<HostEventList>,
    next_request_id: AtomicU64,
    pending: OrderedMutex<BTreeMap<u64, Arc<PendingRequest>>>,
    closed: AtomicBool,
    timeout: Option<Duration>,
    stats: ChannelStats,
}

impl Channel {
    /// Open a channel over `transport` and install its receive callback
    pub fn open(
        name: impl Into<String>,
        transport: Arc<dyn HostTransport>,
        events: Arc<HostEventList>,
        timeout: Option<Duration>,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            name: name.into(),
            transport: transport.clone(),
            events,
            next_request_id: AtomicU64::new(1),
            pending: OrderedMutex::new(LockRank::Channel, BTreeMap::new()),
            closed: AtomicBool::new(false),
            timeout,
            stats: ChannelStats::default(),
        });

        let weak: Weak<Channel> = Arc::downgrade(&channel);
        transport.set_receive_callback(Arc::new(move |packet| {
            if let Some(channel) = weak.upgrade() {
                channel.receive(packet);
            }
        }));

        info!("channel {} opened", channel.name);
        channel
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Requests still waiting for a completion
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send `request` on behalf of `process` and block for the completion
    pub fn send_request(&self, process: HostHandle, request: HostRequest) -> Result<HostResponse> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let pending = PendingRequest::new();

        {
            let mut map = self.pending.lock();
            // Checked under the lock so close() cannot miss this entry.
            if self.is_closed() {
                return Err(Error::ChannelClosed);
            }
            map.insert(request_id, pending.clone());
        }

        let command_type = request.command_type();
        trace!("{}: send #{} {:?}", self.name, request_id, command_type);
        self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);

        if let Err(err) = self.transport.send(GuestPacket::new(request_id, process, request)) {
            self.pending.lock().remove(&request_id);
            error!(
                "{}: send #{} {:?} failed: {}",
                self.name, request_id, command_type, err
            );
            return Err(match err {
                Error::ChannelClosed => Error::ChannelClosed,
                _ => Error::ChannelFailure,
            });
        }

        let deadline = self.timeout.map(|t| Instant::now() + t);
        match pending.wait(deadline) {
            Some(result) => result,
            None => {
                let raced = self.pending.lock().remove(&request_id).is_none();
                if raced {
                    // A completion or close removed the entry first and fills
                    // the slot right after.
                    if let Some(result) = pending.wait(None) {
                        return result;
                    }
                }
                warn!(
                    "{}: request #{} {:?} timed out",
                    self.name, request_id, command_type
                );
                Err(Error::Timeout)
            }
        }
    }

    /// Handle one packet from the host
    pub fn receive(&self, packet: HostPacket) {
        match packet {
            HostPacket::Completion {
                request_id,
                status,
                response,
            } => self.complete(request_id, status, response),
            HostPacket::SignalEvent { event_id } => {
                self.stats.events.fetch_add(1, Ordering::Relaxed);
                self.events.signal(event_id);
            }
        }
    }

    fn complete(&self, request_id: u64, status: HostStatus, response: HostResponse) {
        let pending = self.pending.lock().remove(&request_id);
        let Some(pending) = pending else {
            self.stats.late_completions.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{}: completion for unknown request #{} ({})",
                self.name, request_id, status
            );
            return;
        };

        self.stats.completions.fetch_add(1, Ordering::Relaxed);
        if status.is_success() {
            trace!("{}: complete #{}", self.name, request_id);
            pending.fill(Ok(response));
        } else {
            self.stats.host_errors.fetch_add(1, Ordering::Relaxed);
            warn!("{}: request #{} failed: {}", self.name, request_id, status);
            pending.fill(Err(status.into()));
        }
    }

    /// Close the channel and fail every pending request. Idempotent.
    pub fn close(&self) {
        let drained = {
            let mut map = self.pending.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            core::mem::take(&mut *map)
        };

        info!(
            "channel {} closed, failing {} pending requests",
            self.name,
            drained.len()
        );
        for pending in drained.values() {
            pending.fill(Err(Error::ChannelClosed));
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_event::{Completion, HostEvent, HostEventTarget};
    use std::thread;

    /// Transport that records packets and lets the test answer them
    #[derive(Default)]
    struct ManualTransport {
        sent: Mutex<Vec<GuestPacket>>,
        callback: Mutex<Option<ReceiveCallback>>,
        fail_send: AtomicBool,
    }

    impl ManualTransport {
        fn deliver(&self, packet: HostPacket) {
            let callback = self.callback.lock().clone();
            if let Some(callback) = callback {
                callback(packet);
            }
        }

        fn wait_for_request(&self) -> GuestPacket {
            loop {
                if let Some(packet) = self.sent.lock().pop() {
                    return packet;
                }
                thread::yield_now();
            }
        }
    }

    impl HostTransport for ManualTransport {
        fn send(&self, packet: GuestPacket) -> Result<()> {
            if self.fail_send.load(Ordering::SeqCst) {
                return Err(Error::ChannelFailure);
            }
            self.sent.lock().push(packet);
            Ok(())
        }

        fn set_receive_callback(&self, callback: ReceiveCallback) {
            *self.callback.lock() = Some(callback);
        }
    }

    fn open(timeout: Option<Duration>) -> (Arc<ManualTransport>, Arc<Channel>) {
        let transport = Arc::new(ManualTransport::default());
        let channel = Channel::open(
            "test",
            transport.clone(),
            Arc::new(HostEventList::new()),
            timeout,
        );
        (transport, channel)
    }

    fn destroy_device() -> HostRequest {
        HostRequest::DestroyDevice {
            device: HostHandle(1),
        }
    }

    #[test]
    fn test_request_response() {
        let (transport, channel) = open(None);

        let caller = {
            let channel = channel.clone();
            thread::spawn(move || channel.send_request(HostHandle(5), destroy_device()))
        };

        let packet = transport.wait_for_request();
        assert_eq!(packet.header.process, HostHandle(5));
        transport.deliver(HostPacket::Completion {
            request_id: packet.header.request_id,
            status: HostStatus::SUCCESS,
            response: HostResponse::Handle(HostHandle(77)),
        });

        assert_eq!(
            caller.join().unwrap(),
            Ok(HostResponse::Handle(HostHandle(77)))
        );
        assert_eq!(channel.pending_count(), 0);
    }

    #[test]
    fn test_host_error_is_verbatim() {
        let (transport, channel) = open(None);

        let caller = {
            let channel = channel.clone();
            thread::spawn(move || channel.send_request(HostHandle::NULL, destroy_device()))
        };

        let packet = transport.wait_for_request();
        let status = HostStatus(0xC0DE_0042_u32 as i32);
        transport.deliver(HostPacket::Completion {
            request_id: packet.header.request_id,
            status,
            response: HostResponse::Empty,
        });

        assert_eq!(caller.join().unwrap(), Err(Error::Host(status)));
    }

    #[test]
    fn test_send_failure_is_not_retried() {
        let (transport, channel) = open(None);
        transport.fail_send.store(true, Ordering::SeqCst);

        assert_eq!(
            channel.send_request(HostHandle::NULL, destroy_device()),
            Err(Error::ChannelFailure)
        );
        assert_eq!(channel.pending_count(), 0);
        assert!(transport.sent.lock().is_empty());
    }

    #[test]
    fn test_close_fails_pending() {
        let (transport, channel) = open(None);

        let caller = {
            let channel = channel.clone();
            thread::spawn(move || channel.send_request(HostHandle::NULL, destroy_device()))
        };

        transport.wait_for_request();
        channel.close();

        assert_eq!(caller.join().unwrap(), Err(Error::ChannelClosed));
        assert_eq!(
            channel.send_request(HostHandle::NULL, destroy_device()),
            Err(Error::ChannelClosed)
        );
    }

    #[test]
    fn test_timeout_then_late_completion() {
        let (transport, channel) = open(Some(Duration::from_millis(20)));

        assert_eq!(
            channel.send_request(HostHandle::NULL, destroy_device()),
            Err(Error::Timeout)
        );

        let packet = transport.wait_for_request();
        transport.deliver(HostPacket::Completion {
            request_id: packet.header.request_id,
            status: HostStatus::SUCCESS,
            response: HostResponse::Empty,
        });
        assert_eq!(channel.stats().late_completions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_completion_racing_timeout_is_kept() {
        let (transport, channel) = open(Some(Duration::from_millis(20)));

        let caller = {
            let channel = channel.clone();
            thread::spawn(move || channel.send_request(HostHandle::NULL, destroy_device()))
        };

        // Take the entry the way a completion does, then fill it only after
        // the caller's deadline has passed.
        let packet = transport.wait_for_request();
        let entry = channel
            .pending
            .lock()
            .remove(&packet.header.request_id)
            .unwrap();
        thread::sleep(Duration::from_millis(60));
        entry.fill(Ok(HostResponse::Handle(HostHandle(9))));

        assert_eq!(
            caller.join().unwrap(),
            Ok(HostResponse::Handle(HostHandle(9)))
        );
    }

    #[test]
    fn test_request_ids_increase() {
        let (transport, channel) = open(Some(Duration::from_millis(1)));
        let _ = channel.send_request(HostHandle::NULL, destroy_device());
        let _ = channel.send_request(HostHandle::NULL, destroy_device());

        let sent = transport.sent.lock();
        assert!(sent[0].header.request_id < sent[1].header.request_id);
    }

    #[test]
    fn test_signal_event_forwarded() {
        let events = Arc::new(HostEventList::new());
        let transport = Arc::new(ManualTransport::default());
        let _channel = Channel::open("test", transport.clone(), events.clone(), None);

        let completion = Completion::new();
        let event_id = events.new_event_id();
        events
            .add(HostEvent {
                event_id,
                pid: 0,
                target: HostEventTarget::Completion(completion.clone()),
                destroy_after_signal: true,
            })
            .unwrap();

        transport.deliver(HostPacket::SignalEvent { event_id });
        assert!(completion.is_completed());
        assert!(events.is_empty());
    }
}
