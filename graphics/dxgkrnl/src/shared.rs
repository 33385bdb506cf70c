//! Cross-process sharing
//!
//! A shared anchor is the cross-process identity of a resource or sync
//! object. Every local object opened on it is a participant and holds one
//! anchor reference. Anchors are reached in one of two ways:
//!
//! ```text
//!  global handle sharing              descriptor (NT handle) sharing
//!
//!  Registry::shared_handles           Registry::descriptors
//!        │  handle                          │  grant (holds a reference)
//!        ▼                                  ▼
//!  ┌──────────────┐  participants   ┌──────────────┐
//!  │    anchor    │───────────────► │    anchor    │──► host NT object
//!  └──────────────┘                 └──────────────┘
//! ```
//!
//! A descriptor grant is redeemed exactly once by an open, or dropped by
//! [`Registry::close_descriptor`]. Descriptor-shared anchors are not in the
//! global table.
//!
//! A resource anchor is sealed the first time it is shared, opened or
//! queried. From then on its private data is frozen and no allocations can
//! be added.

use core::fmt;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};

use log::{debug, warn};

use crate::adapter::Adapter;
use crate::allocation::Resource;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::lock::{LockRank, OrderedMutex, OrderedMutexGuard};
use crate::process::{HandleObject, Process};
use crate::protocol::{HostHandle, HostRequest, HostResponse, SyncObjectType};
use crate::refcount::RefCount;
use crate::registry::Registry;
use crate::syncobj::SyncObject;

/// Private data frozen into a shared resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedResourceData {
    pub resource_private_data: Vec<u8>,
    pub runtime_private_data: Vec<u8>,
    /// One blob per allocation, in creation order
    pub allocation_private_data: Vec<Vec<u8>>,
}

/// Sizes reported by [`Registry::query_resource_info`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceInfo {
    pub allocation_count: u32,
    pub resource_private_data_size: usize,
    pub runtime_private_data_size: usize,
    /// Sum of the per-allocation private data sizes
    pub allocation_private_data_size: usize,
}

struct NtState {
    host: HostHandle,
    references: u32,
}

/// Reference count of the host NT object behind a descriptor-shared anchor
///
/// The host object is created with the first reference and destroyed with the
/// last one. Grants and participants opened from a descriptor each hold one.
struct NtShare {
    state: OrderedMutex<NtState>,
}

impl NtShare {
    fn new() -> Self {
        Self {
            state: OrderedMutex::new(
                LockRank::SharedFd,
                NtState {
                    host: HostHandle::NULL,
                    references: 0,
                },
            ),
        }
    }

    fn host(&self) -> HostHandle {
        self.state.lock().host
    }

    fn references(&self) -> u32 {
        self.state.lock().references
    }

    fn acquire(&self, registry: &Registry, process: HostHandle, object: HostHandle) -> Result<()> {
        let mut state = self.state.lock();
        if state.references == 0 {
            let response = registry
                .global_channel()
                .send_request(process, HostRequest::CreateNtSharedObject { object })?;
            state.host = match response {
                HostResponse::Handle(host) => host,
                _ => return Err(Error::ChannelFailure),
            };
            debug!("host NT object {} created for {}", state.host, object);
        }
        state.references += 1;
        Ok(())
    }

    fn release(&self, registry: Option<Arc<Registry>>) {
        let mut state = self.state.lock();
        debug_assert!(state.references > 0);
        state.references = state.references.saturating_sub(1);
        if state.references > 0 || state.host.is_null() {
            return;
        }

        let shared = core::mem::replace(&mut state.host, HostHandle::NULL);
        if let Some(registry) = registry {
            if let Err(err) = registry.global_channel().send_request(
                HostHandle::NULL,
                HostRequest::DestroyNtSharedObject { shared },
            ) {
                debug!("host NT object {}: destroy: {}", shared, err);
            }
        }
    }
}

/// Mutable state of a shared resource anchor
pub(crate) struct SharedResourceInner {
    pub sealed: bool,
    pub participants: Vec<Weak<Resource>>,
    pub data: SharedResourceData,
}

/// Cross-process anchor of a resource
pub struct SharedResource {
    adapter: Weak<Adapter>,
    registry: Weak<Registry>,
    host_resource: HostHandle,
    nt_security: bool,
    refcount: RefCount,
    global_handle: OnceLock<Handle>,
    inner: OrderedMutex<SharedResourceInner>,
    nt: NtShare,
}

impl SharedResource {
    /// Create an anchor for the resource `host_resource` and register it on
    /// the adapter. The returned anchor holds the creator's reference.
    pub(crate) fn new(
        adapter: &Arc<Adapter>,
        registry: Weak<Registry>,
        host_resource: HostHandle,
        nt_security: bool,
        data: SharedResourceData,
    ) -> Arc<Self> {
        let anchor = Arc::new(Self {
            adapter: Arc::downgrade(adapter),
            registry,
            host_resource,
            nt_security,
            refcount: RefCount::new(),
            global_handle: OnceLock::new(),
            inner: OrderedMutex::new(
                LockRank::SharedObject,
                SharedResourceInner {
                    sealed: false,
                    participants: Vec::new(),
                    data,
                },
            ),
            nt: NtShare::new(),
        });
        adapter
            .shared
            .lock()
            .shared_resources
            .push(Arc::downgrade(&anchor));
        anchor
    }

    /// Handle in the registry's global table; none for descriptor sharing
    pub fn global_handle(&self) -> Option<Handle> {
        self.global_handle.get().copied()
    }

    pub(crate) fn adapter_ptr(&self) -> *const Adapter {
        self.adapter.as_ptr()
    }

    pub(crate) fn set_global_handle(&self, handle: Handle) {
        let _ = self.global_handle.set(handle);
    }

    pub fn nt_security(&self) -> bool {
        self.nt_security
    }

    /// Host handle an open request refers to
    pub fn host_shared_handle(&self) -> HostHandle {
        if self.nt_security {
            self.nt.host()
        } else {
            self.host_resource
        }
    }

    pub fn host_nt_references(&self) -> u32 {
        self.nt.references()
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.lock().sealed
    }

    pub fn allocation_count(&self) -> u32 {
        self.inner.lock().data.allocation_private_data.len() as u32
    }

    pub fn participant_count(&self) -> usize {
        self.inner
            .lock()
            .participants
            .iter()
            .filter(|p| p.strong_count() > 0)
            .count()
    }

    /// Copy of the frozen private data
    pub fn data(&self) -> SharedResourceData {
        self.inner.lock().data.clone()
    }

    pub(crate) fn lock(&self) -> OrderedMutexGuard<'_, SharedResourceInner> {
        self.inner.lock()
    }

    /// Seal the anchor. Returns true for the call that sealed it.
    pub(crate) fn seal(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return false;
        }
        inner.sealed = true;
        debug!(
            "shared resource {} sealed with {} allocations",
            self.host_resource,
            inner.data.allocation_private_data.len()
        );
        true
    }

    /// Seal and report sizes
    pub(crate) fn info(&self) -> ResourceInfo {
        let mut inner = self.inner.lock();
        inner.sealed = true;
        let data = &inner.data;
        ResourceInfo {
            allocation_count: data.allocation_private_data.len() as u32,
            resource_private_data_size: data.resource_private_data.len(),
            runtime_private_data_size: data.runtime_private_data.len(),
            allocation_private_data_size: data.allocation_private_data.iter().map(Vec::len).sum(),
        }
    }

    pub(crate) fn add_participant(&self, resource: &Arc<Resource>) {
        self.inner
            .lock()
            .participants
            .push(Arc::downgrade(resource));
    }

    pub(crate) fn remove_participant(&self, resource: &Resource) {
        let ptr: *const Resource = resource;
        self.inner
            .lock()
            .participants
            .retain(|p| p.as_ptr() != ptr && p.strong_count() > 0);
    }

    pub(crate) fn nt_acquire(&self, process: HostHandle) -> Result<()> {
        let registry = self.registry.upgrade().ok_or(Error::ShutdownInProgress)?;
        self.nt.acquire(&registry, process, self.host_resource)
    }

    pub(crate) fn nt_release(&self) {
        self.nt.release(self.registry.upgrade());
    }

    pub fn acquire_reference(&self) -> bool {
        self.refcount.acquire()
    }

    pub fn release_reference(self: &Arc<Self>) {
        if !self.refcount.release() {
            return;
        }

        if let (Some(registry), Some(handle)) = (self.registry.upgrade(), self.global_handle()) {
            registry.shared_handles.free(handle);
        }
        if let Some(adapter) = self.adapter.upgrade() {
            let ptr = Arc::as_ptr(self);
            adapter
                .shared
                .lock()
                .shared_resources
                .retain(|w| w.as_ptr() != ptr && w.strong_count() > 0);
        }
        if self.nt.references() > 0 {
            warn!(
                "shared resource {} released with host NT references",
                self.host_resource
            );
        }
        debug!("shared resource {} released", self.host_resource);
    }

    pub fn reference_count(&self) -> u32 {
        self.refcount.count()
    }
}

/// Cross-process anchor of a sync object
pub struct SharedSyncObject {
    adapter: Weak<Adapter>,
    registry: Weak<Registry>,
    host_object: HostHandle,
    sync_type: SyncObjectType,
    nt_security: bool,
    refcount: RefCount,
    global_handle: OnceLock<Handle>,
    participants: OrderedMutex<Vec<Weak<SyncObject>>>,
    nt: NtShare,
}

impl SharedSyncObject {
    pub(crate) fn new(
        adapter: &Arc<Adapter>,
        registry: Weak<Registry>,
        host_object: HostHandle,
        sync_type: SyncObjectType,
        nt_security: bool,
    ) -> Arc<Self> {
        let anchor = Arc::new(Self {
            adapter: Arc::downgrade(adapter),
            registry,
            host_object,
            sync_type,
            nt_security,
            refcount: RefCount::new(),
            global_handle: OnceLock::new(),
            participants: OrderedMutex::new(LockRank::SharedObject, Vec::new()),
            nt: NtShare::new(),
        });
        adapter
            .shared
            .lock()
            .shared_syncobjs
            .push(Arc::downgrade(&anchor));
        anchor
    }

    pub fn global_handle(&self) -> Option<Handle> {
        self.global_handle.get().copied()
    }

    pub(crate) fn set_global_handle(&self, handle: Handle) {
        let _ = self.global_handle.set(handle);
    }

    pub fn sync_type(&self) -> SyncObjectType {
        self.sync_type
    }

    pub fn nt_security(&self) -> bool {
        self.nt_security
    }

    pub fn host_shared_handle(&self) -> HostHandle {
        if self.nt_security {
            self.nt.host()
        } else {
            self.host_object
        }
    }

    pub fn host_nt_references(&self) -> u32 {
        self.nt.references()
    }

    pub fn participant_count(&self) -> usize {
        self.participants
            .lock()
            .iter()
            .filter(|p| p.strong_count() > 0)
            .count()
    }

    pub(crate) fn add_participant(&self, syncobj: &Arc<SyncObject>) {
        self.participants.lock().push(Arc::downgrade(syncobj));
    }

    pub(crate) fn remove_participant(&self, syncobj: &SyncObject) {
        let ptr: *const SyncObject = syncobj;
        self.participants
            .lock()
            .retain(|p| p.as_ptr() != ptr && p.strong_count() > 0);
    }

    pub(crate) fn nt_acquire(&self, process: HostHandle) -> Result<()> {
        let registry = self.registry.upgrade().ok_or(Error::ShutdownInProgress)?;
        self.nt.acquire(&registry, process, self.host_object)
    }

    pub(crate) fn nt_release(&self) {
        self.nt.release(self.registry.upgrade());
    }

    pub fn acquire_reference(&self) -> bool {
        self.refcount.acquire()
    }

    pub fn release_reference(self: &Arc<Self>) {
        if !self.refcount.release() {
            return;
        }

        if let (Some(registry), Some(handle)) = (self.registry.upgrade(), self.global_handle()) {
            registry.shared_handles.free(handle);
        }
        if let Some(adapter) = self.adapter.upgrade() {
            let ptr = Arc::as_ptr(self);
            adapter
                .shared
                .lock()
                .shared_syncobjs
                .retain(|w| w.as_ptr() != ptr && w.strong_count() > 0);
        }
        debug!("shared sync object {} released", self.host_object);
    }

    pub fn reference_count(&self) -> u32 {
        self.refcount.count()
    }
}

/// Entry of the global shared handle table and of descriptor grants
#[derive(Clone)]
pub enum SharedObject {
    Resource(Arc<SharedResource>),
    SyncObject(Arc<SharedSyncObject>),
}

impl SharedObject {
    fn nt_security(&self) -> bool {
        match self {
            SharedObject::Resource(anchor) => anchor.nt_security(),
            SharedObject::SyncObject(anchor) => anchor.nt_security(),
        }
    }

    fn acquire_reference(&self) -> bool {
        match self {
            SharedObject::Resource(anchor) => anchor.acquire_reference(),
            SharedObject::SyncObject(anchor) => anchor.acquire_reference(),
        }
    }

    pub(crate) fn release_reference(&self) {
        match self {
            SharedObject::Resource(anchor) => anchor.release_reference(),
            SharedObject::SyncObject(anchor) => anchor.release_reference(),
        }
    }

    fn nt_acquire(&self, process: HostHandle) -> Result<()> {
        match self {
            SharedObject::Resource(anchor) => anchor.nt_acquire(process),
            SharedObject::SyncObject(anchor) => anchor.nt_acquire(process),
        }
    }

    pub(crate) fn nt_release(&self) {
        match self {
            SharedObject::Resource(anchor) => anchor.nt_release(),
            SharedObject::SyncObject(anchor) => anchor.nt_release(),
        }
    }
}

/// Descriptor (NT handle) naming a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Descriptor(u32);

impl Descriptor {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Outstanding descriptor grants
pub struct DescriptorTable {
    next: u32,
    max: usize,
    grants: BTreeMap<u32, SharedObject>,
}

impl DescriptorTable {
    pub fn new(max: usize) -> Self {
        Self {
            next: 1,
            max,
            grants: BTreeMap::new(),
        }
    }

    fn insert(&mut self, object: SharedObject) -> Result<Descriptor> {
        if self.grants.len() >= self.max {
            return Err(Error::HandleTableFull);
        }
        while self.next == 0 || self.grants.contains_key(&self.next) {
            self.next = self.next.wrapping_add(1);
        }
        let descriptor = self.next;
        self.next = self.next.wrapping_add(1);
        self.grants.insert(descriptor, object);
        Ok(Descriptor(descriptor))
    }

    fn get(&self, descriptor: Descriptor) -> Option<SharedObject> {
        self.grants.get(&descriptor.0).cloned()
    }

    fn take(&mut self, descriptor: Descriptor) -> Option<SharedObject> {
        self.grants.remove(&descriptor.0)
    }

    fn restore(&mut self, descriptor: Descriptor, object: SharedObject) {
        self.grants.insert(descriptor.0, object);
    }

    /// Take every grant out of the table
    pub(crate) fn drain(&mut self) -> Vec<SharedObject> {
        core::mem::take(&mut self.grants).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

impl Registry {
    /// Issue one descriptor grant per object. Only objects created for
    /// descriptor sharing qualify. Either every grant is issued or none.
    pub fn share_objects(&self, process: &Arc<Process>, objects: &[Handle]) -> Result<Vec<Descriptor>> {
        self.check_running()?;
        process.check_alive()?;

        let mut descriptors = Vec::with_capacity(objects.len());
        for &handle in objects {
            match self.share_object(process, handle) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(err) => {
                    for descriptor in descriptors {
                        let _ = self.close_descriptor(descriptor);
                    }
                    return Err(err);
                }
            }
        }
        Ok(descriptors)
    }

    fn share_object(&self, process: &Arc<Process>, handle: Handle) -> Result<Descriptor> {
        // Only resources and sync objects can ever be shared; of those, only
        // the ones created shared have an anchor.
        let object = match process.handles.lookup_any(handle)? {
            (_, HandleObject::Resource(resource)) => resource.shared().cloned().map(SharedObject::Resource),
            (_, HandleObject::SyncObject(syncobj)) => syncobj.shared().cloned().map(SharedObject::SyncObject),
            _ => return Err(Error::NotSupported),
        }
        .ok_or(Error::InvalidParameter)?;

        if !object.nt_security() {
            return Err(Error::InvalidParameter);
        }
        if !object.acquire_reference() {
            return Err(Error::ObjectDestroyed);
        }
        if let SharedObject::Resource(anchor) = &object {
            anchor.seal();
        }

        if let Err(err) = object.nt_acquire(process.host_handle()) {
            object.release_reference();
            return Err(err);
        }

        let inserted = self.descriptors.lock().insert(object.clone());
        match inserted {
            Ok(descriptor) => {
                debug!("pid {} shared {} as {}", process.pid(), handle, descriptor);
                Ok(descriptor)
            }
            Err(err) => {
                object.nt_release();
                object.release_reference();
                Err(err)
            }
        }
    }

    /// Drop a grant without redeeming it
    pub fn close_descriptor(&self, descriptor: Descriptor) -> Result<()> {
        let object = self
            .descriptors
            .lock()
            .take(descriptor)
            .ok_or(Error::InvalidHandle)?;
        object.nt_release();
        object.release_reference();
        Ok(())
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptors.lock().len()
    }

    pub(crate) fn peek_descriptor(&self, descriptor: Descriptor) -> Result<SharedObject> {
        self.descriptors
            .lock()
            .get(descriptor)
            .ok_or(Error::InvalidHandle)
    }

    /// Remove a grant for redemption. The caller owns its anchor and host NT
    /// references until it either keeps them or restores the grant.
    pub(crate) fn redeem_descriptor(&self, descriptor: Descriptor) -> Result<SharedObject> {
        self.descriptors
            .lock()
            .take(descriptor)
            .ok_or(Error::InvalidHandle)
    }

    pub(crate) fn restore_descriptor(&self, descriptor: Descriptor, object: SharedObject) {
        self.descriptors.lock().restore(descriptor, object);
    }
}
