//! In-process host
//!
//! [`LoopbackHost`] answers every request synchronously from inside
//! `send`, keeping a small model of the host's object namespace: a tree of
//! host handles rooted at processes and devices, fence values for sync
//! objects, and pending CPU waits. Destroying a handle drops its whole
//! subtree, as the real host does.
//!
//! One host can serve several channels at once. The host itself is a
//! transport, and [`LoopbackHost::endpoint`] hands out more transports over
//! the same namespace, so a global channel and an adapter channel can agree
//! on NT shared handles.
//!
//! Completions are delivered inline. `SignalEvent` packets produced while
//! handling a request are queued and, unless auto-delivery is turned off,
//! flushed right after the completion.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use log::{debug, trace};
use parking_lot::Mutex;

use crate::channel::{HostTransport, ReceiveCallback};
use crate::error::{Error, Result};
use crate::protocol::{
    AllocationFlags, CommandType, GuestPacket, HostHandle, HostPacket, HostRequest,
    HostResponse, HostStatus, SignalFlags, SyncObjectType,
};

const FENCE_PAGE_BASE: u64 = 0x7f00_0000_0000;
const LOCK_PAGE_BASE: u64 = 0x7e00_0000_0000;
const PAGE_SIZE: u64 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    Process,
    Device,
    PagingQueue,
    Context,
    HwQueue,
    Resource,
    Allocation,
    SyncObject,
    NtShared(HostHandle),
}

#[derive(Debug)]
struct HostObject {
    kind: ObjectKind,
    parent: HostHandle,
    /// Fence cell backing a sync object; aliased by opened sync objects
    fence: Option<u32>,
}

#[derive(Debug)]
struct Fence {
    value: u64,
    /// Host event signalled on every signal, 0 if none
    cpu_event_id: u64,
}

#[derive(Debug)]
struct CpuWaiter {
    event_id: u64,
    wait_any: bool,
    objects: Vec<(HostHandle, u64)>,
}

#[derive(Default)]
struct HostState {
    next_handle: u32,
    next_page: u64,
    objects: BTreeMap<HostHandle, HostObject>,
    fences: BTreeMap<u32, Fence>,
    waiters: Vec<CpuWaiter>,
    locked: BTreeSet<HostHandle>,
    fail_next: Option<HostStatus>,
    submissions: usize,
    commands: Vec<CommandType>,
    /// Events produced by the request being handled
    signalled: Vec<u64>,
}

impl HostState {
    fn new_handle(&mut self) -> HostHandle {
        self.next_handle += 1;
        HostHandle(self.next_handle)
    }

    fn new_page(&mut self, base: u64) -> u64 {
        self.next_page += 1;
        base + self.next_page * PAGE_SIZE
    }

    fn exists(&self, handle: HostHandle) -> bool {
        self.objects.contains_key(&handle)
    }

    fn require(&self, handle: HostHandle) -> core::result::Result<(), HostStatus> {
        if self.exists(handle) {
            Ok(())
        } else {
            Err(HostStatus::INVALID_HANDLE)
        }
    }

    fn insert(&mut self, kind: ObjectKind, parent: HostHandle) -> HostHandle {
        let handle = self.new_handle();
        let parent = if self.exists(parent) {
            parent
        } else {
            HostHandle::NULL
        };
        self.objects.insert(
            handle,
            HostObject {
                kind,
                parent,
                fence: None,
            },
        );
        handle
    }

    fn insert_fence(
        &mut self,
        kind: ObjectKind,
        parent: HostHandle,
        value: u64,
        cpu_event_id: u64,
    ) -> HostHandle {
        let handle = self.insert(kind, parent);
        self.fences.insert(
            handle.0,
            Fence {
                value,
                cpu_event_id,
            },
        );
        if let Some(object) = self.objects.get_mut(&handle) {
            object.fence = Some(handle.0);
        }
        handle
    }

    /// Remove `handle` and everything below it
    fn remove(&mut self, handle: HostHandle) -> core::result::Result<(), HostStatus> {
        if !self.exists(handle) {
            return Err(HostStatus::INVALID_HANDLE);
        }

        let mut doomed = vec![handle];
        let mut i = 0;
        while i < doomed.len() {
            let parent = doomed[i];
            doomed.extend(
                self.objects
                    .iter()
                    .filter(|(_, o)| o.parent == parent)
                    .map(|(h, _)| *h),
            );
            i += 1;
        }

        for handle in doomed {
            self.objects.remove(&handle);
            self.locked.remove(&handle);
        }

        let live: BTreeSet<u32> = self.objects.values().filter_map(|o| o.fence).collect();
        self.fences.retain(|id, _| live.contains(id));
        Ok(())
    }

    /// Resolve an NT shared handle to the object it names
    fn resolve(&self, handle: HostHandle) -> HostHandle {
        match self.objects.get(&handle).map(|o| o.kind) {
            Some(ObjectKind::NtShared(object)) => object,
            _ => handle,
        }
    }

    fn fence_of(&self, handle: HostHandle) -> Option<u32> {
        self.objects.get(&handle).and_then(|o| o.fence)
    }

    fn fence_value(&self, handle: HostHandle) -> Option<u64> {
        self.fence_of(handle)
            .and_then(|id| self.fences.get(&id))
            .map(|f| f.value)
    }

    fn satisfied(&self, waiter: &CpuWaiter) -> bool {
        let mut reached = waiter
            .objects
            .iter()
            .map(|(handle, target)| self.fence_value(*handle).map_or(false, |v| v >= *target));
        if waiter.wait_any {
            reached.any(|r| r)
        } else {
            reached.all(|r| r)
        }
    }

    fn check_waiters(&mut self) {
        let waiters = core::mem::take(&mut self.waiters);
        for waiter in waiters {
            if self.satisfied(&waiter) {
                self.signalled.push(waiter.event_id);
            } else {
                self.waiters.push(waiter);
            }
        }
    }

    fn signal(
        &mut self,
        flags: SignalFlags,
        objects: &[HostHandle],
        fence_values: &[u64],
    ) -> core::result::Result<(), HostStatus> {
        for object in objects {
            self.require(*object)?;
        }

        for (i, object) in objects.iter().enumerate() {
            let value = fence_values.get(i).copied().unwrap_or(1);
            let Some(id) = self.fence_of(*object) else {
                continue;
            };
            if let Some(fence) = self.fences.get_mut(&id) {
                if flags.contains(SignalFlags::ALLOW_FENCE_REWIND) {
                    fence.value = value;
                } else {
                    fence.value = fence.value.max(value);
                }
                if fence.cpu_event_id != 0 {
                    self.signalled.push(fence.cpu_event_id);
                }
            }
        }

        self.check_waiters();
        Ok(())
    }

    fn handle(
        &mut self,
        process: HostHandle,
        request: HostRequest,
    ) -> core::result::Result<HostResponse, HostStatus> {
        use HostRequest::*;

        Ok(match request {
            CreateProcess { .. } => {
                HostResponse::Handle(self.insert(ObjectKind::Process, HostHandle::NULL))
            }
            DestroyProcess { process } => {
                self.remove(process)?;
                HostResponse::Empty
            }
            QueryAdapterInfo {
                query_type,
                private_data,
            } => {
                let mut data = query_type.to_le_bytes().to_vec();
                data.extend_from_slice(&private_data);
                HostResponse::Data(data)
            }
            CreateNtSharedObject { object } => {
                self.require(object)?;
                HostResponse::Handle(self.insert(ObjectKind::NtShared(object), HostHandle::NULL))
            }
            DestroyNtSharedObject { shared } => {
                self.remove(shared)?;
                HostResponse::Empty
            }
            CreateDevice { .. } => HostResponse::Handle(self.insert(ObjectKind::Device, process)),
            DestroyDevice { device } => {
                self.remove(device)?;
                HostResponse::Empty
            }
            CreatePagingQueue { device, .. } => {
                self.require(device)?;
                let paging_queue = self.insert(ObjectKind::PagingQueue, device);
                let sync_object = self.insert_fence(ObjectKind::SyncObject, paging_queue, 0, 0);
                HostResponse::PagingQueue {
                    paging_queue,
                    sync_object,
                    fence_address: self.new_page(FENCE_PAGE_BASE),
                }
            }
            DestroyPagingQueue { paging_queue } => {
                self.remove(paging_queue)?;
                HostResponse::Empty
            }
            CreateContext { device, .. } => {
                self.require(device)?;
                HostResponse::Handle(self.insert(ObjectKind::Context, device))
            }
            DestroyContext { context } => {
                self.remove(context)?;
                HostResponse::Empty
            }
            CreateHwQueue { context, .. } => {
                self.require(context)?;
                let hwqueue = self.insert(ObjectKind::HwQueue, context);
                let progress_fence = self.insert_fence(ObjectKind::SyncObject, hwqueue, 0, 0);
                HostResponse::HwQueue {
                    hwqueue,
                    progress_fence,
                    fence_address: self.new_page(FENCE_PAGE_BASE),
                }
            }
            DestroyHwQueue { hwqueue } => {
                self.remove(hwqueue)?;
                HostResponse::Empty
            }
            SubmitCommand { context, .. } => {
                self.require(context)?;
                self.submissions += 1;
                HostResponse::Empty
            }
            SubmitCommandToHwQueue {
                hwqueue,
                hwqueue_progress_fence,
                ..
            } => {
                self.require(hwqueue)?;
                self.submissions += 1;
                // The work retires at once: advance the progress fence.
                let fence = self
                    .objects
                    .iter()
                    .find(|(_, o)| o.parent == hwqueue && o.fence.is_some())
                    .map(|(h, _)| *h);
                if let Some(fence) = fence {
                    self.signal(SignalFlags::empty(), &[fence], &[hwqueue_progress_fence])?;
                }
                HostResponse::Empty
            }
            CreateAllocation {
                device,
                flags,
                resource,
                allocations,
                ..
            } => {
                self.require(device)?;
                let resource = if flags.contains(AllocationFlags::CREATE_RESOURCE) {
                    self.insert(ObjectKind::Resource, device)
                } else if !resource.is_null() {
                    self.require(resource)?;
                    resource
                } else {
                    HostHandle::NULL
                };
                let parent = if resource.is_null() { device } else { resource };
                let allocations = allocations
                    .iter()
                    .map(|_| self.insert(ObjectKind::Allocation, parent))
                    .collect();
                HostResponse::Allocations {
                    resource,
                    allocations,
                }
            }
            DestroyAllocation {
                resource,
                allocations,
                ..
            } => {
                for allocation in allocations {
                    // Already gone with its resource
                    let _ = self.remove(allocation);
                }
                if !resource.is_null() {
                    self.remove(resource)?;
                }
                HostResponse::Empty
            }
            Lock2 { allocation, .. } => {
                self.require(allocation)?;
                self.locked.insert(allocation);
                HostResponse::Lock {
                    address: self.new_page(LOCK_PAGE_BASE),
                }
            }
            Unlock2 { allocation, .. } => {
                self.require(allocation)?;
                self.locked.remove(&allocation);
                HostResponse::Empty
            }
            OpenResource {
                device,
                shared,
                allocation_count,
            } => {
                self.require(device)?;
                self.require(self.resolve(shared))?;
                let resource = self.insert(ObjectKind::Resource, device);
                let allocations = (0..allocation_count)
                    .map(|_| self.insert(ObjectKind::Allocation, resource))
                    .collect();
                HostResponse::Allocations {
                    resource,
                    allocations,
                }
            }
            CreateSyncObject {
                device,
                sync_type,
                initial_value,
                cpu_event_id,
                ..
            } => {
                self.require(device)?;
                let parent = if sync_type.is_device_type() {
                    device
                } else {
                    process
                };
                let sync_object =
                    self.insert_fence(ObjectKind::SyncObject, parent, initial_value, cpu_event_id);
                HostResponse::SyncObject {
                    sync_object,
                    fence_address: self.fence_address(sync_type),
                }
            }
            DestroySyncObject { sync_object } => {
                self.remove(sync_object)?;
                HostResponse::Empty
            }
            OpenSyncObject { device, shared, .. } => {
                self.require(device)?;
                let target = self.resolve(shared);
                self.require(target)?;
                let fence = self.fence_of(target);
                let sync_object = self.insert(ObjectKind::SyncObject, device);
                if let Some(object) = self.objects.get_mut(&sync_object) {
                    object.fence = fence;
                }
                HostResponse::SyncObject {
                    sync_object,
                    fence_address: self.new_page(FENCE_PAGE_BASE),
                }
            }
            SignalSyncObject {
                flags,
                objects,
                fence_values,
                cpu_event_id,
                ..
            } => {
                self.signal(flags, &objects, &fence_values)?;
                if cpu_event_id != 0 {
                    self.signalled.push(cpu_event_id);
                }
                HostResponse::Empty
            }
            WaitForSyncObjectFromCpu {
                flags,
                objects,
                fence_values,
                event_id,
                ..
            } => {
                for object in &objects {
                    self.require(*object)?;
                }
                let waiter = CpuWaiter {
                    event_id,
                    wait_any: flags.contains(SignalFlags::WAIT_ANY),
                    objects: objects.into_iter().zip(fence_values).collect(),
                };
                if self.satisfied(&waiter) {
                    self.signalled.push(event_id);
                } else {
                    self.waiters.push(waiter);
                }
                HostResponse::Empty
            }
            WaitForSyncObjectFromGpu { context, .. } => {
                self.require(context)?;
                HostResponse::Empty
            }
        })
    }

    fn fence_address(&mut self, sync_type: SyncObjectType) -> u64 {
        if sync_type.is_monitored() {
            self.new_page(FENCE_PAGE_BASE)
        } else {
            0
        }
    }
}

/// Host model answering requests in-process
pub struct LoopbackHost {
    state: Mutex<HostState>,
    callback: Mutex<Option<ReceiveCallback>>,
    events: SegQueue<(ReceiveCallback, u64)>,
    held: SegQueue<(ReceiveCallback, HostPacket)>,
    auto_deliver: AtomicBool,
    hold_completions: AtomicBool,
    connected: AtomicBool,
    requests: AtomicUsize,
}

impl LoopbackHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HostState::default()),
            callback: Mutex::new(None),
            events: SegQueue::new(),
            held: SegQueue::new(),
            auto_deliver: AtomicBool::new(true),
            hold_completions: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            requests: AtomicUsize::new(0),
        })
    }

    /// Another transport over this host's namespace
    pub fn endpoint(self: &Arc<Self>) -> Arc<LoopbackEndpoint> {
        Arc::new(LoopbackEndpoint {
            host: self.clone(),
            callback: Mutex::new(None),
        })
    }

    /// Fail the next request with `status`
    pub fn fail_next(&self, status: HostStatus) {
        self.state.lock().fail_next = Some(status);
    }

    /// Refuse every further send
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Deliver queued `SignalEvent`s after every completion, or only on
    /// [`LoopbackHost::deliver_pending_events`]
    pub fn set_auto_deliver(&self, enabled: bool) {
        self.auto_deliver.store(enabled, Ordering::SeqCst);
    }

    /// Queue completions until [`LoopbackHost::release_completions`]
    pub fn set_hold_completions(&self, enabled: bool) {
        self.hold_completions.store(enabled, Ordering::SeqCst);
    }

    /// Deliver queued events; returns how many were delivered
    pub fn deliver_pending_events(&self) -> usize {
        let mut delivered = 0;
        while let Some((callback, event_id)) = self.events.pop() {
            callback(HostPacket::SignalEvent { event_id });
            delivered += 1;
        }
        delivered
    }

    /// Deliver held completions; returns how many were delivered
    pub fn release_completions(&self) -> usize {
        let mut delivered = 0;
        while let Some((callback, packet)) = self.held.pop() {
            callback(packet);
            delivered += 1;
        }
        delivered
    }

    pub fn held_completions(&self) -> usize {
        self.held.len()
    }

    pub fn live_processes(&self) -> usize {
        self.count(|kind| kind == ObjectKind::Process)
    }

    /// Live objects other than processes, NT shared handles and queue fences
    pub fn live_objects(&self) -> usize {
        self.count(|kind| {
            !matches!(
                kind,
                ObjectKind::Process | ObjectKind::NtShared(_) | ObjectKind::SyncObject
            )
        }) + self.live_sync_objects()
    }

    pub fn live_allocations(&self) -> usize {
        self.count(|kind| kind == ObjectKind::Allocation)
    }

    pub fn live_resources(&self) -> usize {
        self.count(|kind| kind == ObjectKind::Resource)
    }

    /// Sync objects the guest created or opened, not counting queue fences
    pub fn live_sync_objects(&self) -> usize {
        let state = self.state.lock();
        state
            .objects
            .values()
            .filter(|o| o.kind == ObjectKind::SyncObject)
            .filter(|o| {
                !matches!(
                    state.objects.get(&o.parent).map(|p| p.kind),
                    Some(ObjectKind::HwQueue) | Some(ObjectKind::PagingQueue)
                )
            })
            .count()
    }

    pub fn live_nt_objects(&self) -> usize {
        self.count(|kind| matches!(kind, ObjectKind::NtShared(_)))
    }

    pub fn submissions(&self) -> usize {
        self.state.lock().submissions
    }

    pub fn locked_allocations(&self) -> usize {
        self.state.lock().locked.len()
    }

    pub fn pending_waits(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Current fence value of a sync object
    pub fn fence_value(&self, sync_object: HostHandle) -> Option<u64> {
        self.state.lock().fence_value(sync_object)
    }

    /// How many requests of `command` the host has seen
    pub fn command_count(&self, command: CommandType) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| **c == command)
            .count()
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    fn count(&self, f: impl Fn(ObjectKind) -> bool) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|o| f(o.kind))
            .count()
    }

    fn process(&self, packet: GuestPacket, callback: Option<ReceiveCallback>) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::ChannelFailure);
        }
        let Some(callback) = callback else {
            return Err(Error::ChannelClosed);
        };
        self.requests.fetch_add(1, Ordering::Relaxed);

        let GuestPacket { header, request } = packet;
        let (status, response, signalled) = {
            let mut state = self.state.lock();
            state.commands.push(header.command_type);
            let result = match state.fail_next.take() {
                Some(status) => Err(status),
                None => state.handle(header.process, request),
            };
            let signalled = core::mem::take(&mut state.signalled);
            match result {
                Ok(response) => (HostStatus::SUCCESS, response, signalled),
                Err(status) => (status, HostResponse::Empty, signalled),
            }
        };

        trace!(
            "loopback: #{} {:?} -> {}",
            header.request_id,
            header.command_type,
            status
        );
        if !status.is_success() {
            debug!("loopback: {:?} failed with {}", header.command_type, status);
        }

        for event_id in signalled {
            self.events.push((callback.clone(), event_id));
        }

        let completion = HostPacket::Completion {
            request_id: header.request_id,
            status,
            response,
        };
        if self.hold_completions.load(Ordering::SeqCst) {
            self.held.push((callback, completion));
            return Ok(());
        }

        callback(completion);
        if self.auto_deliver.load(Ordering::SeqCst) {
            self.deliver_pending_events();
        }
        Ok(())
    }
}

impl HostTransport for LoopbackHost {
    fn send(&self, packet: GuestPacket) -> Result<()> {
        let callback = self.callback.lock().clone();
        self.process(packet, callback)
    }

    fn set_receive_callback(&self, callback: ReceiveCallback) {
        *self.callback.lock() = Some(callback);
    }
}

/// Additional transport sharing a [`LoopbackHost`]
pub struct LoopbackEndpoint {
    host: Arc<LoopbackHost>,
    callback: Mutex<Option<ReceiveCallback>>,
}

impl LoopbackEndpoint {
    pub fn host(&self) -> &Arc<LoopbackHost> {
        &self.host
    }
}

impl HostTransport for LoopbackEndpoint {
    fn send(&self, packet: GuestPacket) -> Result<()> {
        let callback = self.callback.lock().clone();
        self.host.process(packet, callback)
    }

    fn set_receive_callback(&self, callback: ReceiveCallback) {
        *self.callback.lock() = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(host: &LoopbackHost, request: HostRequest) -> HostPacket {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        host.set_receive_callback(Arc::new(move |packet| sink.lock().push(packet)));
        host.send(GuestPacket::new(1, HostHandle::NULL, request)).unwrap();
        let mut received = received.lock();
        received.remove(0)
    }

    fn handle_of(packet: HostPacket) -> HostHandle {
        match packet {
            HostPacket::Completion {
                response: HostResponse::Handle(handle),
                ..
            } => handle,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_destroy_removes_subtree() {
        let host = LoopbackHost::new();
        let device = handle_of(send(
            &host,
            HostRequest::CreateDevice {
                flags: Default::default(),
            },
        ));
        handle_of(send(
            &host,
            HostRequest::CreateContext {
                device,
                node_ordinal: 0,
                engine_affinity: 0,
                flags: Default::default(),
                private_data: Vec::new(),
            },
        ));
        assert_eq!(host.live_objects(), 2);

        send(&host, HostRequest::DestroyDevice { device });
        assert_eq!(host.live_objects(), 0);
    }

    #[test]
    fn test_fail_next() {
        let host = LoopbackHost::new();
        host.fail_next(HostStatus::DEVICE_REMOVED);
        match send(&host, HostRequest::CreateProcess { pid: 1 }) {
            HostPacket::Completion { status, .. } => {
                assert_eq!(status, HostStatus::DEVICE_REMOVED)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(host.live_processes(), 0);
    }

    #[test]
    fn test_unknown_handle() {
        let host = LoopbackHost::new();
        match send(
            &host,
            HostRequest::DestroyContext {
                context: HostHandle(42),
            },
        ) {
            HostPacket::Completion { status, .. } => {
                assert_eq!(status, HostStatus::INVALID_HANDLE)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_disconnected_send_fails() {
        let host = LoopbackHost::new();
        host.set_receive_callback(Arc::new(|_| {}));
        host.disconnect();
        assert_eq!(
            host.send(GuestPacket::new(
                1,
                HostHandle::NULL,
                HostRequest::CreateProcess { pid: 1 }
            )),
            Err(Error::ChannelFailure)
        );
    }
}
