//! Allocations and resources
//!
//! An [`Allocation`] is one piece of GPU memory. It belongs either directly
//! to a device or to a [`Resource`], which groups allocations created
//! together. A resource may carry a [`SharedResource`] anchor, in which case
//! other processes can open it and get their own resource with the same
//! allocation layout.
//!
//! Allocations are never destroyed on the host one by one when their owner
//! goes away: destroying a resource or device drops everything under it on
//! the host side too, so only the local objects are torn down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use log::debug;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleType};
use crate::lock::{LockRank, OrderedMutex, OrderedRwLock};
use crate::process::{HandleObject, Process};
use crate::protocol::{AllocationDesc, AllocationFlags, HostHandle, HostRequest, HostResponse};
use crate::refcount::{ObjectState, RefCount};
use crate::registry::Registry;
use crate::shared::{Descriptor, ResourceInfo, SharedObject, SharedResource, SharedResourceData};

/// Parameters of [`Registry::create_allocation`]
#[derive(Debug, Clone)]
pub struct AllocationCreateInfo {
    pub device: Handle,
    pub flags: AllocationFlags,
    /// Existing resource to add the allocations to
    pub resource: Option<Handle>,
    pub allocations: Vec<AllocationDesc>,
    pub resource_private_data: Vec<u8>,
    pub runtime_private_data: Vec<u8>,
}

impl AllocationCreateInfo {
    /// Request with no allocations on `device`
    pub fn new(device: Handle) -> Self {
        Self {
            device,
            flags: AllocationFlags::empty(),
            resource: None,
            allocations: Vec::new(),
            resource_private_data: Vec::new(),
            runtime_private_data: Vec::new(),
        }
    }
}

/// Result of [`Registry::create_allocation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedAllocations {
    /// New resource, or the existing one the allocations were added to
    pub resource: Option<Handle>,
    pub allocations: Vec<Handle>,
    /// Global handle of the new shared anchor, for global handle sharing
    pub global_share: Option<Handle>,
}

/// Result of [`Registry::open_resource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedResource {
    pub resource: Handle,
    pub allocations: Vec<Handle>,
    pub data: SharedResourceData,
}

enum Owner {
    Device(Weak<Device>),
    Resource(Weak<Resource>),
}

struct AllocationState {
    destroyed: bool,
    lock_count: u32,
    cpu_address: u64,
}

/// One GPU allocation
pub struct Allocation {
    handle: OnceLock<Handle>,
    host: HostHandle,
    owner: Owner,
    device: Weak<Device>,
    process: Weak<Process>,
    private_data: Vec<u8>,
    page_count: u64,
    refcount: RefCount,
    state: OrderedMutex<AllocationState>,
}

impl Allocation {
    /// Build an allocation holding a reference on its owner. Returns `None`
    /// if the owner is already gone.
    fn new(
        host: HostHandle,
        owner: Owner,
        device: &Arc<Device>,
        process: &Arc<Process>,
        desc: &AllocationDesc,
    ) -> Option<Arc<Self>> {
        let acquired = match &owner {
            Owner::Device(device) => device.upgrade().map_or(false, |d| d.acquire_reference()),
            Owner::Resource(resource) => resource.upgrade().map_or(false, |r| r.acquire_reference()),
        };
        if !acquired {
            return None;
        }

        Some(Arc::new(Self {
            handle: OnceLock::new(),
            host,
            owner,
            device: Arc::downgrade(device),
            process: Arc::downgrade(process),
            private_data: desc.private_data.clone(),
            page_count: desc.page_count,
            refcount: RefCount::new(),
            state: OrderedMutex::new(
                LockRank::Allocation,
                AllocationState {
                    destroyed: false,
                    lock_count: 0,
                    cpu_address: 0,
                },
            ),
        }))
    }

    pub fn handle(&self) -> Option<Handle> {
        self.handle.get().copied()
    }

    pub fn host_handle(&self) -> HostHandle {
        self.host
    }

    pub fn private_data(&self) -> &[u8] {
        &self.private_data
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Outstanding CPU locks
    pub fn lock_count(&self) -> u32 {
        self.state.lock().lock_count
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    fn belongs_to_device(&self, device: &Arc<Device>) -> bool {
        self.device.as_ptr() == Arc::as_ptr(device)
    }

    fn resource(&self) -> Option<Arc<Resource>> {
        match &self.owner {
            Owner::Resource(resource) => resource.upgrade(),
            Owner::Device(_) => None,
        }
    }

    pub fn acquire_reference(&self) -> bool {
        self.refcount.acquire()
    }

    pub fn release_reference(self: &Arc<Self>) {
        if !self.refcount.release() {
            return;
        }
        if let Some(process) = self.process.upgrade() {
            process.free_handle(self.handle());
        }
        match &self.owner {
            Owner::Device(device) => {
                if let Some(device) = device.upgrade() {
                    device.release_reference();
                }
            }
            Owner::Resource(resource) => {
                if let Some(resource) = resource.upgrade() {
                    resource.release_reference();
                }
            }
        }
    }

    pub fn reference_count(&self) -> u32 {
        self.refcount.count()
    }

    /// Tear down the local object. The host side goes with the request that
    /// triggered this.
    pub(crate) fn destroy(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }

        match &self.owner {
            Owner::Device(device) => {
                if let Some(device) = device.upgrade() {
                    device.remove_allocation(self);
                }
            }
            Owner::Resource(resource) => {
                if let Some(resource) = resource.upgrade() {
                    resource.remove_allocation(self);
                }
            }
        }

        if let Some(process) = self.process.upgrade() {
            process.mark_handle_destroyed(self.handle());
        }
        self.release_reference();
    }
}

struct ResourceInner {
    state: ObjectState,
    allocations: Vec<Arc<Allocation>>,
}

/// Group of allocations, optionally shared
pub struct Resource {
    handle: OnceLock<Handle>,
    host: HostHandle,
    device: Weak<Device>,
    process: Weak<Process>,
    shared: Option<Arc<SharedResource>>,
    /// Opened from a descriptor and holding a host NT reference
    nt_reference: AtomicBool,
    refcount: RefCount,
    inner: OrderedRwLock<ResourceInner>,
}

impl Resource {
    /// Build a resource holding a reference on `device`. The caller hands
    /// over one anchor reference through `shared`.
    fn new(
        host: HostHandle,
        device: &Arc<Device>,
        process: &Arc<Process>,
        shared: Option<Arc<SharedResource>>,
    ) -> Option<Arc<Self>> {
        if !device.acquire_reference() {
            return None;
        }
        Some(Arc::new(Self {
            handle: OnceLock::new(),
            host,
            device: Arc::downgrade(device),
            process: Arc::downgrade(process),
            shared,
            nt_reference: AtomicBool::new(false),
            refcount: RefCount::new(),
            inner: OrderedRwLock::new(
                LockRank::Resource,
                ResourceInner {
                    state: ObjectState::Created,
                    allocations: Vec::new(),
                },
            ),
        }))
    }

    pub fn handle(&self) -> Option<Handle> {
        self.handle.get().copied()
    }

    pub fn host_handle(&self) -> HostHandle {
        self.host
    }

    pub fn shared(&self) -> Option<&Arc<SharedResource>> {
        self.shared.as_ref()
    }

    pub fn state(&self) -> ObjectState {
        self.inner.read().state
    }

    pub fn allocations(&self) -> Vec<Arc<Allocation>> {
        self.inner.read().allocations.clone()
    }

    fn belongs_to_device(&self, device: &Arc<Device>) -> bool {
        self.device.as_ptr() == Arc::as_ptr(device)
    }

    fn remove_allocation(&self, allocation: &Arc<Allocation>) {
        self.inner
            .write()
            .allocations
            .retain(|a| !Arc::ptr_eq(a, allocation));
    }

    pub fn acquire_reference(&self) -> bool {
        self.refcount.acquire()
    }

    pub fn release_reference(self: &Arc<Self>) {
        if !self.refcount.release() {
            return;
        }
        if let Some(process) = self.process.upgrade() {
            process.free_handle(self.handle());
        }
        if let Some(anchor) = &self.shared {
            anchor.remove_participant(self);
            if self.nt_reference.load(Ordering::Acquire) {
                anchor.nt_release();
            }
            anchor.release_reference();
        }
        debug!("resource {} released", self.host);
        if let Some(device) = self.device.upgrade() {
            device.release_reference();
        }
    }

    pub fn reference_count(&self) -> u32 {
        self.refcount.count()
    }

    pub(crate) fn destroy(self: &Arc<Self>, parent_teardown: bool) {
        let allocations = {
            let mut inner = self.inner.write();
            if !inner.state.mark_destroyed() {
                return;
            }
            core::mem::take(&mut inner.allocations)
        };

        for allocation in allocations {
            allocation.destroy();
        }

        if let Some(anchor) = &self.shared {
            anchor.remove_participant(self);
        }

        if !parent_teardown {
            if let Some(device) = self.device.upgrade() {
                if let Err(err) = device.send(HostRequest::DestroyAllocation {
                    device: device.host_handle(),
                    resource: self.host,
                    allocations: Vec::new(),
                }) {
                    debug!("resource {}: host destroy: {}", self.host, err);
                }
                device.remove_resource(self);
            }
        }

        if let Some(process) = self.process.upgrade() {
            process.mark_handle_destroyed(self.handle());
        }
        self.release_reference();
    }
}

/// Objects built by one create or open, not yet published
#[derive(Default)]
struct Pending {
    resource: Option<Arc<Resource>>,
    allocations: Vec<Arc<Allocation>>,
    handles: Vec<Handle>,
}

impl Pending {
    /// Undo a failed create: free the handles taken so far and tear the
    /// objects down. An object already destroyed through a visible handle
    /// is not released twice. Call without locks held.
    fn unwind(self, process: &Process) {
        for handle in self.handles {
            process.handles.free(handle);
        }
        for allocation in &self.allocations {
            allocation.destroy();
        }
        if let Some(resource) = &self.resource {
            resource.destroy(true);
        }
    }

    /// Give the resource its allocation list. Done before any handle is
    /// visible so a destroy through the resource handle sees all of them.
    fn attach_allocations(&self) {
        if let Some(resource) = &self.resource {
            resource.inner.write().allocations = self.allocations.clone();
        }
    }

    /// Allocate handles, the resource's last: once it is visible the
    /// allocations are too, and nothing after it can fail.
    fn allocate_handles(&mut self, process: &Process) -> Result<()> {
        for allocation in &self.allocations {
            let handle = process
                .handles
                .allocate(HandleObject::Allocation(allocation.clone()), HandleType::Allocation)?;
            self.handles.push(handle);
        }
        if let Some(resource) = &self.resource {
            let handle = process
                .handles
                .allocate(HandleObject::Resource(resource.clone()), HandleType::Resource)?;
            self.handles.push(handle);
        }
        Ok(())
    }

    /// Hand the handles to the objects once all of them were allocated
    fn publish(&self) {
        let mut handles = self.handles.iter();
        for (allocation, &handle) in self.allocations.iter().zip(&mut handles) {
            let _ = allocation.handle.set(handle);
        }
        if let Some(resource) = &self.resource {
            if let Some(&handle) = handles.next() {
                let _ = resource.handle.set(handle);
            }
        }
    }
}

impl Registry {
    fn check_allocation_request(&self, info: &AllocationCreateInfo) -> Result<()> {
        let flags = info.flags;
        if info.allocations.is_empty() || info.allocations.len() > self.config().max_allocations_per_request {
            return Err(Error::InvalidParameter);
        }
        if flags.contains(AllocationFlags::CREATE_SHARED) && !flags.contains(AllocationFlags::CREATE_RESOURCE) {
            return Err(Error::InvalidParameter);
        }
        if flags.contains(AllocationFlags::NT_SECURITY_SHARING) && !flags.contains(AllocationFlags::CREATE_SHARED) {
            return Err(Error::InvalidParameter);
        }
        if flags.contains(AllocationFlags::CREATE_RESOURCE) && info.resource.is_some() {
            return Err(Error::InvalidParameter);
        }
        self.check_private_data(&info.resource_private_data)?;
        self.check_private_data(&info.runtime_private_data)?;
        for desc in &info.allocations {
            self.check_private_data(&desc.private_data)?;
        }
        Ok(())
    }

    /// Create allocations, optionally grouped under a new or existing
    /// resource and optionally shared
    pub fn create_allocation(
        &self,
        process: &Arc<Process>,
        info: &AllocationCreateInfo,
    ) -> Result<CreatedAllocations> {
        self.check_running()?;
        self.check_allocation_request(info)?;

        let device = process.device(info.device)?;
        let existing = match info.resource {
            Some(handle) => {
                let resource = process.resource(handle)?;
                if !resource.belongs_to_device(&device) {
                    return Err(Error::InvalidParameter);
                }
                Some(resource)
            }
            None => None,
        };

        match existing {
            Some(resource) => self.add_allocations(process, &device, &resource, info),
            None => self.create_allocations(process, &device, info),
        }
    }

    fn create_allocations(
        &self,
        process: &Arc<Process>,
        device: &Arc<Device>,
        info: &AllocationCreateInfo,
    ) -> Result<CreatedAllocations> {
        let flags = info.flags;
        let active = device.lock_active()?;

        let (host_resource, host_allocations) = match device.send(HostRequest::CreateAllocation {
            device: device.host_handle(),
            flags,
            resource: HostHandle::NULL,
            allocations: info.allocations.clone(),
            resource_private_data: info.resource_private_data.clone(),
            runtime_private_data: info.runtime_private_data.clone(),
        })? {
            HostResponse::Allocations {
                resource,
                allocations,
            } => (resource, allocations),
            _ => return Err(Error::ChannelFailure),
        };

        let host_destroy = || {
            let _ = device.send(HostRequest::DestroyAllocation {
                device: device.host_handle(),
                resource: host_resource,
                allocations: host_allocations.clone(),
            });
        };

        if host_allocations.len() != info.allocations.len() {
            host_destroy();
            return Err(Error::ChannelFailure);
        }

        let mut pending = Pending::default();
        let built = self
            .build_allocations(process, device, info, host_resource, &host_allocations, &mut pending)
            .and_then(|()| self.share_globally(&pending, flags));
        let global_share = match built {
            Ok(global_share) => global_share,
            Err(err) => {
                host_destroy();
                drop(active);
                pending.unwind(process);
                return Err(err);
            }
        };
        pending.publish();

        match &pending.resource {
            Some(resource) => {
                if let Some(anchor) = &resource.shared {
                    anchor.add_participant(resource);
                }
                device.objects.write().resources.push(resource.clone());
                if !resource.inner.write().state.activate() {
                    device.remove_resource(resource);
                }
            }
            None => {
                device
                    .objects
                    .write()
                    .allocations
                    .extend(pending.allocations.iter().filter(|a| !a.is_destroyed()).cloned());
            }
        }

        debug!(
            "device {} created {} allocations{}",
            device.host_handle(),
            pending.allocations.len(),
            if pending.resource.is_some() { " with resource" } else { "" }
        );

        Ok(CreatedAllocations {
            resource: pending.resource.as_ref().and_then(|r| r.handle()),
            allocations: pending.allocations.iter().filter_map(|a| a.handle()).collect(),
            global_share,
        })
    }

    fn build_allocations(
        &self,
        process: &Arc<Process>,
        device: &Arc<Device>,
        info: &AllocationCreateInfo,
        host_resource: HostHandle,
        host_allocations: &[HostHandle],
        pending: &mut Pending,
    ) -> Result<()> {
        let flags = info.flags;

        if flags.contains(AllocationFlags::CREATE_RESOURCE) {
            let anchor = flags.contains(AllocationFlags::CREATE_SHARED).then(|| {
                SharedResource::new(
                    device.adapter(),
                    self.weak(),
                    host_resource,
                    flags.contains(AllocationFlags::NT_SECURITY_SHARING),
                    SharedResourceData {
                        resource_private_data: info.resource_private_data.clone(),
                        runtime_private_data: info.runtime_private_data.clone(),
                        allocation_private_data: info
                            .allocations
                            .iter()
                            .map(|desc| desc.private_data.clone())
                            .collect(),
                    },
                )
            });
            match Resource::new(host_resource, device, process, anchor.clone()) {
                Some(resource) => pending.resource = Some(resource),
                None => {
                    if let Some(anchor) = anchor {
                        anchor.release_reference();
                    }
                    return Err(Error::DeviceStopped);
                }
            }
        }

        for (desc, &host) in info.allocations.iter().zip(host_allocations) {
            let owner = match &pending.resource {
                Some(resource) => Owner::Resource(Arc::downgrade(resource)),
                None => Owner::Device(Arc::downgrade(device)),
            };
            let allocation = Allocation::new(host, owner, device, process, desc).ok_or(Error::DeviceStopped)?;
            pending.allocations.push(allocation);
        }

        pending.attach_allocations();
        pending.allocate_handles(process)
    }

    /// Put a new non-NT anchor into the global table
    fn share_globally(&self, pending: &Pending, flags: AllocationFlags) -> Result<Option<Handle>> {
        if flags.contains(AllocationFlags::NT_SECURITY_SHARING) {
            return Ok(None);
        }
        let Some(anchor) = pending.resource.as_ref().and_then(|r| r.shared.as_ref()) else {
            return Ok(None);
        };
        let handle = self
            .shared_handles
            .allocate(SharedObject::Resource(anchor.clone()), HandleType::SharedResource)?;
        anchor.set_global_handle(handle);
        Ok(Some(handle))
    }

    fn add_allocations(
        &self,
        process: &Arc<Process>,
        device: &Arc<Device>,
        resource: &Arc<Resource>,
        info: &AllocationCreateInfo,
    ) -> Result<CreatedAllocations> {
        let active = device.lock_active()?;
        let mut inner = resource.inner.write();
        if !inner.state.is_active() {
            return Err(Error::ObjectDestroyed);
        }
        // Held to the end so the anchor cannot seal under us.
        let mut anchor = resource.shared.as_ref().map(|anchor| anchor.lock());
        if anchor.as_ref().map_or(false, |a| a.sealed) {
            return Err(Error::Sealed);
        }

        let host_allocations = match device.send(HostRequest::CreateAllocation {
            device: device.host_handle(),
            flags: info.flags,
            resource: resource.host,
            allocations: info.allocations.clone(),
            resource_private_data: Vec::new(),
            runtime_private_data: Vec::new(),
        })? {
            HostResponse::Allocations { allocations, .. } => allocations,
            _ => return Err(Error::ChannelFailure),
        };

        let host_destroy = || {
            let _ = device.send(HostRequest::DestroyAllocation {
                device: device.host_handle(),
                resource: HostHandle::NULL,
                allocations: host_allocations.clone(),
            });
        };

        let mut pending = Pending::default();
        let built = if host_allocations.len() != info.allocations.len() {
            Err(Error::ChannelFailure)
        } else {
            info.allocations
                .iter()
                .zip(&host_allocations)
                .try_for_each(|(desc, &host)| {
                    let owner = Owner::Resource(Arc::downgrade(resource));
                    let allocation =
                        Allocation::new(host, owner, device, process, desc).ok_or(Error::ObjectDestroyed)?;
                    pending.allocations.push(allocation);
                    Ok(())
                })
                .and_then(|()| pending.allocate_handles(process))
        };

        if let Err(err) = built {
            host_destroy();
            drop(anchor);
            drop(inner);
            drop(active);
            pending.unwind(process);
            return Err(err);
        }
        pending.publish();

        inner.allocations.extend(pending.allocations.iter().cloned());
        if let Some(anchor) = anchor.as_mut() {
            anchor
                .data
                .allocation_private_data
                .extend(info.allocations.iter().map(|desc| desc.private_data.clone()));
        }

        Ok(CreatedAllocations {
            resource: resource.handle(),
            allocations: pending.allocations.iter().filter_map(|a| a.handle()).collect(),
            global_share: None,
        })
    }

    /// Destroy a whole resource, or a set of resource-less allocations
    pub fn destroy_allocations(
        &self,
        process: &Arc<Process>,
        device_handle: Handle,
        resource: Option<Handle>,
        allocations: &[Handle],
    ) -> Result<()> {
        let device = process.device(device_handle)?;

        if let Some(handle) = resource {
            let resource = process.resource(handle)?;
            if !resource.belongs_to_device(&device) {
                return Err(Error::InvalidParameter);
            }
            for &handle in allocations {
                let allocation = process.allocation(handle)?;
                let owned = allocation
                    .resource()
                    .map_or(false, |r| Arc::ptr_eq(&r, &resource));
                if !owned {
                    return Err(Error::InvalidParameter);
                }
            }
            resource.destroy(false);
            return Ok(());
        }

        if allocations.is_empty() {
            return Err(Error::InvalidParameter);
        }

        let objects = allocations
            .iter()
            .map(|&handle| {
                let allocation = process.allocation(handle)?;
                if allocation.resource().is_some() || !allocation.belongs_to_device(&device) {
                    return Err(Error::InvalidParameter);
                }
                Ok(allocation)
            })
            .collect::<Result<Vec<_>>>()?;

        if let Err(err) = device.send(HostRequest::DestroyAllocation {
            device: device.host_handle(),
            resource: HostHandle::NULL,
            allocations: objects.iter().map(|a| a.host).collect(),
        }) {
            debug!("device {}: host destroy allocations: {}", device.host_handle(), err);
        }

        for allocation in objects {
            allocation.destroy();
        }
        Ok(())
    }

    /// Map an allocation for CPU access. The host is asked on the first lock
    /// only; later locks return the same address.
    pub fn lock_allocation(
        &self,
        process: &Arc<Process>,
        device_handle: Handle,
        allocation_handle: Handle,
    ) -> Result<u64> {
        let device = process.device(device_handle)?;
        let allocation = process.allocation(allocation_handle)?;
        if !allocation.belongs_to_device(&device) {
            return Err(Error::InvalidParameter);
        }

        let _active = device.lock_active()?;
        let mut state = allocation.state.lock();
        if state.destroyed {
            return Err(Error::ObjectDestroyed);
        }

        if state.lock_count == 0 {
            state.cpu_address = match device.send(HostRequest::Lock2 {
                device: device.host_handle(),
                allocation: allocation.host,
            })? {
                HostResponse::Lock { address } => address,
                _ => return Err(Error::ChannelFailure),
            };
        }
        state.lock_count += 1;
        Ok(state.cpu_address)
    }

    /// Drop one CPU lock; the last one unmaps on the host
    pub fn unlock_allocation(
        &self,
        process: &Arc<Process>,
        device_handle: Handle,
        allocation_handle: Handle,
    ) -> Result<()> {
        let device = process.device(device_handle)?;
        let allocation = process.allocation(allocation_handle)?;
        if !allocation.belongs_to_device(&device) {
            return Err(Error::InvalidParameter);
        }

        let _active = device.lock_active()?;
        let mut state = allocation.state.lock();
        if state.lock_count == 0 {
            return Err(Error::InvalidParameter);
        }

        if state.lock_count == 1 {
            device.send(HostRequest::Unlock2 {
                device: device.host_handle(),
                allocation: allocation.host,
            })?;
            state.cpu_address = 0;
        }
        state.lock_count -= 1;
        Ok(())
    }

    fn lookup_shared_resource(&self, global: Handle) -> Result<Arc<SharedResource>> {
        match self.shared_handles.lookup(global, HandleType::SharedResource)? {
            SharedObject::Resource(anchor) => Ok(anchor),
            SharedObject::SyncObject(_) => Err(Error::WrongHandleType),
        }
    }

    /// Sizes needed to open the globally shared resource `global`. Seals it.
    pub fn query_resource_info(
        &self,
        process: &Arc<Process>,
        device_handle: Handle,
        global: Handle,
    ) -> Result<ResourceInfo> {
        let device = process.device(device_handle)?;
        let anchor = self.lookup_shared_resource(global)?;
        check_same_adapter(&device, &anchor)?;
        Ok(anchor.info())
    }

    /// Like [`Registry::query_resource_info`] for a descriptor grant. The
    /// grant is not redeemed.
    pub fn query_resource_info_from_descriptor(
        &self,
        process: &Arc<Process>,
        device_handle: Handle,
        descriptor: Descriptor,
    ) -> Result<ResourceInfo> {
        let device = process.device(device_handle)?;
        let anchor = match self.peek_descriptor(descriptor)? {
            SharedObject::Resource(anchor) => anchor,
            SharedObject::SyncObject(_) => return Err(Error::WrongHandleType),
        };
        check_same_adapter(&device, &anchor)?;
        Ok(anchor.info())
    }

    /// Open the globally shared resource `global` on a device
    pub fn open_resource(
        &self,
        process: &Arc<Process>,
        device_handle: Handle,
        global: Handle,
    ) -> Result<OpenedResource> {
        self.check_running()?;
        let device = process.device(device_handle)?;
        let anchor = self.lookup_shared_resource(global)?;
        if !anchor.acquire_reference() {
            return Err(Error::InvalidHandle);
        }

        let opened = self.open_shared_resource(process, &device, &anchor, false);
        if opened.is_err() {
            anchor.release_reference();
        }
        opened
    }

    /// Open the resource behind a descriptor grant, redeeming it
    pub fn open_resource_from_descriptor(
        &self,
        process: &Arc<Process>,
        device_handle: Handle,
        descriptor: Descriptor,
    ) -> Result<OpenedResource> {
        self.check_running()?;
        let device = process.device(device_handle)?;
        let object = self.redeem_descriptor(descriptor)?;
        let anchor = match &object {
            SharedObject::Resource(anchor) => anchor.clone(),
            SharedObject::SyncObject(_) => {
                self.restore_descriptor(descriptor, object);
                return Err(Error::WrongHandleType);
            }
        };

        // The grant's anchor and NT references move to the new resource.
        let opened = self.open_shared_resource(process, &device, &anchor, true);
        if opened.is_err() {
            self.restore_descriptor(descriptor, object);
        }
        opened
    }

    /// Build a participant of `anchor`. Consumes one anchor reference on
    /// success.
    fn open_shared_resource(
        &self,
        process: &Arc<Process>,
        device: &Arc<Device>,
        anchor: &Arc<SharedResource>,
        nt_reference: bool,
    ) -> Result<OpenedResource> {
        check_same_adapter(device, anchor)?;
        let active = device.lock_active()?;

        anchor.seal();
        let data = anchor.data();
        let allocation_count = data.allocation_private_data.len();

        let (host_resource, host_allocations) = match device.send(HostRequest::OpenResource {
            device: device.host_handle(),
            shared: anchor.host_shared_handle(),
            allocation_count: allocation_count as u32,
        })? {
            HostResponse::Allocations {
                resource,
                allocations,
            } => (resource, allocations),
            _ => return Err(Error::ChannelFailure),
        };

        let host_destroy = || {
            let _ = device.send(HostRequest::DestroyAllocation {
                device: device.host_handle(),
                resource: host_resource,
                allocations: Vec::new(),
            });
        };

        if host_allocations.len() != allocation_count {
            host_destroy();
            return Err(Error::ChannelFailure);
        }

        let mut pending = Pending::default();
        let built = match Resource::new(host_resource, device, process, Some(anchor.clone())) {
            Some(resource) => {
                resource.nt_reference.store(nt_reference, Ordering::Release);
                pending.resource = Some(resource.clone());
                data.allocation_private_data
                    .iter()
                    .zip(&host_allocations)
                    .try_for_each(|(private_data, &host)| {
                        let desc = AllocationDesc {
                            private_data: private_data.clone(),
                            page_count: 0,
                        };
                        let owner = Owner::Resource(Arc::downgrade(&resource));
                        let allocation =
                            Allocation::new(host, owner, device, process, &desc).ok_or(Error::ObjectDestroyed)?;
                        pending.allocations.push(allocation);
                        Ok(())
                    })
                    .and_then(|()| {
                        pending.attach_allocations();
                        pending.allocate_handles(process)
                    })
            }
            None => Err(Error::DeviceStopped),
        };

        if let Err(err) = built {
            host_destroy();
            drop(active);
            // Releasing the resource gives back an anchor reference; the
            // caller keeps its own.
            if let Some(resource) = &pending.resource {
                resource.nt_reference.store(false, Ordering::Release);
                anchor.acquire_reference();
            }
            pending.unwind(process);
            return Err(err);
        }
        pending.publish();

        let Some(resource) = pending.resource.clone() else {
            return Err(Error::ChannelFailure);
        };
        anchor.add_participant(&resource);
        device.objects.write().resources.push(resource.clone());
        if !resource.inner.write().state.activate() {
            device.remove_resource(&resource);
        }

        let resource_handle = resource.handle().ok_or(Error::ChannelFailure)?;
        debug!(
            "pid {} opened shared resource {} as {}",
            process.pid(),
            anchor.host_shared_handle(),
            resource_handle
        );

        Ok(OpenedResource {
            resource: resource_handle,
            allocations: pending.allocations.iter().filter_map(|a| a.handle()).collect(),
            data,
        })
    }
}

fn check_same_adapter(device: &Arc<Device>, anchor: &SharedResource) -> Result<()> {
    if anchor.adapter_ptr() == Arc::as_ptr(device.adapter()) {
        Ok(())
    } else {
        Err(Error::InvalidParameter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::loopback::LoopbackHost;
    use crate::protocol::{DeviceFlags, Luid};

    struct Fixture {
        host: Arc<LoopbackHost>,
        registry: Arc<Registry>,
        process: Arc<Process>,
        device: Handle,
    }

    fn fixture() -> Fixture {
        let host = LoopbackHost::new();
        let registry = Registry::new(DriverConfig::default(), host.endpoint());
        registry.add_adapter(Luid::new(9, 0), host.endpoint()).unwrap();
        let process = registry.process_create(10).unwrap();
        let adapter = registry
            .open_adapter_from_luid(&process, Luid::new(9, 0))
            .unwrap();
        let device = registry
            .create_device(&process, adapter, DeviceFlags::empty())
            .unwrap();
        Fixture {
            host,
            registry,
            process,
            device,
        }
    }

    fn descs(count: usize) -> Vec<AllocationDesc> {
        (0..count)
            .map(|i| AllocationDesc {
                private_data: vec![i as u8; 4],
                page_count: 1,
            })
            .collect()
    }

    #[test]
    fn test_resourceless_allocations() {
        let f = fixture();
        let created = f
            .registry
            .create_allocation(
                &f.process,
                &AllocationCreateInfo {
                    allocations: descs(2),
                    ..AllocationCreateInfo::new(f.device)
                },
            )
            .unwrap();
        assert!(created.resource.is_none());
        assert_eq!(created.allocations.len(), 2);

        let device = f.process.device(f.device).unwrap();
        assert_eq!(device.reference_count(), 3);

        f.registry
            .destroy_allocations(&f.process, f.device, None, &created.allocations)
            .unwrap();
        assert_eq!(device.reference_count(), 1);
        assert!(f.process.allocation(created.allocations[0]).is_err());
    }

    #[test]
    fn test_resource_destroy_takes_allocations() {
        let f = fixture();
        let created = f
            .registry
            .create_allocation(
                &f.process,
                &AllocationCreateInfo {
                    flags: AllocationFlags::CREATE_RESOURCE,
                    allocations: descs(3),
                    ..AllocationCreateInfo::new(f.device)
                },
            )
            .unwrap();
        let resource = f.process.resource(created.resource.unwrap()).unwrap();
        assert_eq!(resource.allocations().len(), 3);
        assert_eq!(resource.reference_count(), 4);

        f.registry
            .destroy_allocations(&f.process, f.device, created.resource, &[])
            .unwrap();
        assert_eq!(resource.reference_count(), 0);
        assert_eq!(f.process.device(f.device).unwrap().reference_count(), 1);
        // device and adapter handles
        assert_eq!(f.process.handle_count(), 2);
    }

    #[test]
    fn test_shared_requires_resource() {
        let f = fixture();
        let result = f.registry.create_allocation(
            &f.process,
            &AllocationCreateInfo {
                flags: AllocationFlags::CREATE_SHARED,
                allocations: descs(1),
                ..AllocationCreateInfo::new(f.device)
            },
        );
        assert_eq!(result, Err(Error::InvalidParameter));
    }

    #[test]
    fn test_lock_unlock_counts() {
        let f = fixture();
        let created = f
            .registry
            .create_allocation(
                &f.process,
                &AllocationCreateInfo {
                    allocations: descs(1),
                    ..AllocationCreateInfo::new(f.device)
                },
            )
            .unwrap();
        let handle = created.allocations[0];

        let a = f.registry.lock_allocation(&f.process, f.device, handle).unwrap();
        let b = f.registry.lock_allocation(&f.process, f.device, handle).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, 0);
        assert_eq!(f.host.locked_allocations(), 1);

        f.registry.unlock_allocation(&f.process, f.device, handle).unwrap();
        assert_eq!(f.host.locked_allocations(), 1);
        f.registry.unlock_allocation(&f.process, f.device, handle).unwrap();
        assert_eq!(f.host.locked_allocations(), 0);
        assert_eq!(
            f.registry.unlock_allocation(&f.process, f.device, handle),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn test_add_to_sealed_resource_fails() {
        let f = fixture();
        let created = f
            .registry
            .create_allocation(
                &f.process,
                &AllocationCreateInfo {
                    flags: AllocationFlags::CREATE_RESOURCE | AllocationFlags::CREATE_SHARED,
                    allocations: descs(1),
                    ..AllocationCreateInfo::new(f.device)
                },
            )
            .unwrap();
        let global = created.global_share.unwrap();

        let more = AllocationCreateInfo {
            resource: created.resource,
            allocations: descs(1),
            ..AllocationCreateInfo::new(f.device)
        };
        f.registry.create_allocation(&f.process, &more).unwrap();

        let info = f
            .registry
            .query_resource_info(&f.process, f.device, global)
            .unwrap();
        assert_eq!(info.allocation_count, 2);

        assert_eq!(
            f.registry.create_allocation(&f.process, &more),
            Err(Error::Sealed)
        );
    }
}
