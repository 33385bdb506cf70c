//! Devices and paging queues
//!
//! A [`Device`] is the execution root of a process on one adapter. It owns
//! contexts, allocations, resources, device-type sync objects and paging
//! queues:
//!
//! ```text
//! Device
//! ├── contexts ──────► Context ──► HwQueue
//! ├── objects
//! │   ├── allocations (resource-less)
//! │   ├── resources ──► Allocation
//! │   └── syncobjs (monitored fences)
//! └── paging_queues
//! ```
//!
//! Every child holds one logical reference on the device, so the device's
//! handle slot is only freed after the last child is gone.

use std::sync::{Arc, OnceLock, Weak};

use log::debug;

use crate::adapter::{Adapter, AdapterCore};
use crate::allocation::{Allocation, Resource};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleType};
use crate::lock::{LockRank, OrderedMutex, OrderedReadGuard, OrderedRwLock};
use crate::process::{HandleObject, Process, ProcessAdapter};
use crate::protocol::{DeviceFlags, HostHandle, HostRequest, HostResponse};
use crate::refcount::{ObjectState, RefCount};
use crate::registry::Registry;
use crate::syncobj::SyncObject;

/// Objects on a device's allocation list
#[derive(Default)]
pub(crate) struct DeviceObjects {
    pub allocations: Vec<Arc<Allocation>>,
    pub resources: Vec<Arc<Resource>>,
    pub syncobjs: Vec<Arc<SyncObject>>,
}

/// Proof that both the adapter and the device are active
///
/// Holds the adapter core lock and the device lock shared; neither can stop
/// while it lives.
pub(crate) struct ActiveDevice<'a> {
    _adapter: OrderedReadGuard<'a, AdapterCore>,
    _device: OrderedReadGuard<'a, ObjectState>,
}

/// Execution root of a process on one adapter
pub struct Device {
    handle: OnceLock<Handle>,
    host: HostHandle,
    flags: DeviceFlags,
    process: Weak<Process>,
    process_host: HostHandle,
    adapter: Arc<Adapter>,
    binding: Weak<ProcessAdapter>,
    refcount: RefCount,
    state: OrderedRwLock<ObjectState>,
    contexts: OrderedRwLock<Vec<Arc<Context>>>,
    pub(crate) objects: OrderedRwLock<DeviceObjects>,
    paging_queues: OrderedMutex<Vec<Arc<PagingQueue>>>,
}

impl Device {
    fn new(
        host: HostHandle,
        flags: DeviceFlags,
        process: &Arc<Process>,
        binding: &Arc<ProcessAdapter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle: OnceLock::new(),
            host,
            flags,
            process: Arc::downgrade(process),
            process_host: process.host_handle(),
            adapter: binding.adapter().clone(),
            binding: Arc::downgrade(binding),
            refcount: RefCount::new(),
            state: OrderedRwLock::new(LockRank::Device, ObjectState::Created),
            contexts: OrderedRwLock::new(LockRank::DeviceContexts, Vec::new()),
            objects: OrderedRwLock::new(LockRank::DeviceAllocs, DeviceObjects::default()),
            paging_queues: OrderedMutex::new(LockRank::DeviceAllocs, Vec::new()),
        })
    }

    pub fn handle(&self) -> Option<Handle> {
        self.handle.get().copied()
    }

    pub fn host_handle(&self) -> HostHandle {
        self.host
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }

    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }

    pub(crate) fn process(&self) -> Weak<Process> {
        self.process.clone()
    }

    pub fn state(&self) -> ObjectState {
        *self.state.read()
    }

    /// Take the adapter core and device locks shared and check both are
    /// active
    pub(crate) fn lock_active(&self) -> Result<ActiveDevice<'_>> {
        let adapter = self.adapter.lock_active()?;
        let device = self.state.read();
        if !device.is_active() {
            return Err(Error::DeviceStopped);
        }
        Ok(ActiveDevice {
            _adapter: adapter,
            _device: device,
        })
    }

    /// Send `request` on the adapter channel on behalf of the owning process
    pub(crate) fn send(&self, request: HostRequest) -> Result<HostResponse> {
        self.adapter
            .channel()
            .send_request(self.process_host, request)
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
        debug!("device {} released", self.host);

        if let Some(binding) = self.binding.upgrade() {
            binding.release_reference();
        }
    }

    pub fn reference_count(&self) -> u32 {
        self.refcount.count()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.read().len()
    }

    pub(crate) fn add_context(&self, context: Arc<Context>) {
        self.contexts.write().push(context);
    }

    pub(crate) fn remove_context(&self, context: &Arc<Context>) {
        self.contexts.write().retain(|c| !Arc::ptr_eq(c, context));
    }

    pub(crate) fn remove_allocation(&self, allocation: &Arc<Allocation>) {
        self.objects
            .write()
            .allocations
            .retain(|a| !Arc::ptr_eq(a, allocation));
    }

    pub(crate) fn remove_resource(&self, resource: &Arc<Resource>) {
        self.objects
            .write()
            .resources
            .retain(|r| !Arc::ptr_eq(r, resource));
    }

    pub(crate) fn remove_syncobj(&self, syncobj: &Arc<SyncObject>) {
        self.objects
            .write()
            .syncobjs
            .retain(|s| !Arc::ptr_eq(s, syncobj));
    }

    fn remove_paging_queue(&self, queue: &Arc<PagingQueue>) {
        self.paging_queues
            .lock()
            .retain(|q| !Arc::ptr_eq(q, queue));
    }

    /// Make the device non-functional. Children fail fast from here on;
    /// their structure stays until the device is destroyed.
    pub(crate) fn stop(&self) {
        let mut state = self.state.write();
        if !state.stop() {
            return;
        }

        debug!("device {} stopped", self.host);

        let syncobjs = self.objects.read().syncobjs.clone();
        for syncobj in syncobjs {
            syncobj.stop();
        }

        let queues = self.paging_queues.lock().clone();
        for queue in queues {
            queue.stop();
        }
    }

    /// Tear the device and everything under it down. Runs once; later calls
    /// return immediately.
    pub(crate) fn destroy(self: &Arc<Self>) {
        if !self.state.write().mark_destroyed() {
            return;
        }

        debug!("device {} destroying", self.host);

        let contexts = core::mem::take(&mut *self.contexts.write());
        for context in contexts {
            context.destroy(true);
        }

        let objects = core::mem::take(&mut *self.objects.write());
        for resource in objects.resources {
            resource.destroy(true);
        }
        for allocation in objects.allocations {
            allocation.destroy();
        }
        for syncobj in objects.syncobjs {
            syncobj.destroy(true);
        }

        let queues = core::mem::take(&mut *self.paging_queues.lock());
        for queue in queues {
            queue.destroy(true);
        }

        if let Err(err) = self.send(HostRequest::DestroyDevice { device: self.host }) {
            debug!("device {}: host destroy: {}", self.host, err);
        }

        if let Some(binding) = self.binding.upgrade() {
            binding.remove_device(self);
        }
        if let Some(process) = self.process.upgrade() {
            process.mark_handle_destroyed(self.handle());
        }

        self.release_reference();
    }
}

/// Paging queue with its backing monitored fence
pub struct PagingQueue {
    handle: OnceLock<Handle>,
    fence_handle: OnceLock<Handle>,
    host: HostHandle,
    host_sync: HostHandle,
    fence_address: u64,
    device: Weak<Device>,
    process: Weak<Process>,
    refcount: RefCount,
    state: OrderedMutex<ObjectState>,
}

/// Result of [`Registry::create_paging_queue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingQueueInfo {
    pub paging_queue: Handle,
    /// Monitored fence handle of the backing sync object
    pub sync_object: Handle,
    pub fence_address: u64,
}

impl PagingQueue {
    pub fn handle(&self) -> Option<Handle> {
        self.handle.get().copied()
    }

    pub fn fence_address(&self) -> u64 {
        self.fence_address
    }

    pub fn host_sync_object(&self) -> HostHandle {
        self.host_sync
    }

    pub fn state(&self) -> ObjectState {
        *self.state.lock()
    }

    pub fn reference_count(&self) -> u32 {
        self.refcount.count()
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
            process.free_handle(self.fence_handle.get().copied());
        }
        if let Some(device) = self.device.upgrade() {
            device.release_reference();
        }
    }

    fn stop(&self) {
        self.state.lock().stop();
    }

    pub(crate) fn destroy(self: &Arc<Self>, parent_teardown: bool) {
        if !self.state.lock().mark_destroyed() {
            return;
        }

        if !parent_teardown {
            if let Some(device) = self.device.upgrade() {
                if let Err(err) = device.send(HostRequest::DestroyPagingQueue {
                    paging_queue: self.host,
                }) {
                    debug!("paging queue {}: host destroy: {}", self.host, err);
                }
                device.remove_paging_queue(self);
            }
        }

        if let Some(process) = self.process.upgrade() {
            process.mark_handle_destroyed(self.handle());
            process.mark_handle_destroyed(self.fence_handle.get().copied());
        }
        self.release_reference();
    }
}

impl Registry {
    /// Create a device on the adapter behind `adapter_handle`
    pub fn create_device(
        &self,
        process: &Arc<Process>,
        adapter_handle: Handle,
        flags: DeviceFlags,
    ) -> Result<Handle> {
        self.check_running()?;
        process.check_alive()?;

        let adapter = process.adapter(adapter_handle)?;
        let binding = self.acquire_binding(process, &adapter)?;

        let result = Self::create_device_locked(process, &adapter, &binding, flags);
        if result.is_err() {
            binding.release_reference();
        }
        result
    }

    fn create_device_locked(
        process: &Arc<Process>,
        adapter: &Arc<Adapter>,
        binding: &Arc<ProcessAdapter>,
        flags: DeviceFlags,
    ) -> Result<Handle> {
        let _core = adapter.lock_active()?;

        let host = match adapter
            .channel()
            .send_request(process.host_handle(), HostRequest::CreateDevice { flags })?
        {
            HostResponse::Handle(host) => host,
            _ => return Err(Error::ChannelFailure),
        };

        let device = Device::new(host, flags, process, binding);
        let handle = match process
            .handles
            .allocate(HandleObject::Device(device.clone()), HandleType::Device)
        {
            Ok(handle) => handle,
            Err(err) => {
                let _ = device.send(HostRequest::DestroyDevice { device: host });
                return Err(err);
            }
        };
        let _ = device.handle.set(handle);

        binding.add_device(device.clone());
        if !device.state.write().activate() {
            // Destroyed through its handle before it was listed.
            binding.remove_device(&device);
        }

        debug!("pid {} created device {} ({})", process.pid(), handle, host);
        Ok(handle)
    }

    /// Destroy a device and everything it owns
    pub fn destroy_device(&self, process: &Arc<Process>, handle: Handle) -> Result<()> {
        let device = process.device(handle)?;
        device.destroy();
        Ok(())
    }

    /// Create a paging queue on a device
    pub fn create_paging_queue(
        &self,
        process: &Arc<Process>,
        device_handle: Handle,
        priority: i32,
    ) -> Result<PagingQueueInfo> {
        let device = process.device(device_handle)?;
        let active = device.lock_active()?;

        let (host, host_sync, fence_address) = match device.send(HostRequest::CreatePagingQueue {
            device: device.host,
            priority,
        })? {
            HostResponse::PagingQueue {
                paging_queue,
                sync_object,
                fence_address,
            } => (paging_queue, sync_object, fence_address),
            _ => return Err(Error::ChannelFailure),
        };

        let host_destroy = || {
            let _ = device.send(HostRequest::DestroyPagingQueue { paging_queue: host });
        };

        if !device.acquire_reference() {
            host_destroy();
            return Err(Error::DeviceStopped);
        }

        let queue = Arc::new(PagingQueue {
            handle: OnceLock::new(),
            fence_handle: OnceLock::new(),
            host,
            host_sync,
            fence_address,
            device: Arc::downgrade(&device),
            process: Arc::downgrade(process),
            refcount: RefCount::new(),
            state: OrderedMutex::new(LockRank::PagingQueue, ObjectState::Created),
        });

        let handles = process
            .handles
            .allocate(HandleObject::PagingQueue(queue.clone()), HandleType::PagingQueue)
            .and_then(|handle| {
                match process
                    .handles
                    .allocate(HandleObject::PagingQueue(queue.clone()), HandleType::MonitoredFence)
                {
                    Ok(fence) => Ok((handle, fence)),
                    Err(err) => {
                        process.handles.free(handle);
                        Err(err)
                    }
                }
            });

        let (handle, fence) = match handles {
            Ok(handles) => handles,
            Err(err) => {
                host_destroy();
                drop(active);
                // A destroy through the briefly visible queue handle owns
                // the release instead.
                queue.destroy(true);
                return Err(err);
            }
        };
        let _ = queue.handle.set(handle);
        let _ = queue.fence_handle.set(fence);

        device.paging_queues.lock().push(queue.clone());
        if !queue.state.lock().activate() {
            device.remove_paging_queue(&queue);
        }

        debug!("device {} created paging queue {}", device.host, handle);
        Ok(PagingQueueInfo {
            paging_queue: handle,
            sync_object: fence,
            fence_address,
        })
    }

    pub fn destroy_paging_queue(&self, process: &Arc<Process>, handle: Handle) -> Result<()> {
        let queue = process.paging_queue(handle)?;
        queue.destroy(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::allocation::AllocationCreateInfo;
    use crate::config::DriverConfig;
    use crate::context::ContextCreateInfo;
    use crate::loopback::LoopbackHost;
    use crate::protocol::{AllocationDesc, AllocationFlags, HostStatus, Luid, SyncObjectType};
    use crate::syncobj::SyncObjectCreateInfo;

    struct Fixture {
        host: Arc<LoopbackHost>,
        registry: Arc<Registry>,
        process: Arc<Process>,
        adapter: Handle,
    }

    fn fixture() -> Fixture {
        let registry = Registry::new(DriverConfig::default(), LoopbackHost::new());
        let host = LoopbackHost::new();
        registry.add_adapter(Luid::new(1, 0), host.clone()).unwrap();
        let process = registry.process_create(100).unwrap();
        let adapter = registry
            .open_adapter_from_luid(&process, Luid::new(1, 0))
            .unwrap();
        Fixture {
            host,
            registry,
            process,
            adapter,
        }
    }

    #[test]
    fn test_create_destroy_device() {
        let f = fixture();
        let handle = f
            .registry
            .create_device(&f.process, f.adapter, DeviceFlags::empty())
            .unwrap();
        let device = f.process.device(handle).unwrap();
        assert_eq!(device.state(), ObjectState::Active);
        assert_eq!(f.host.live_objects(), 1);

        let binding = f.registry.bindings_of_process(&f.process)[0].clone();
        assert_eq!(binding.reference_count(), 2);
        assert_eq!(binding.devices().len(), 1);

        f.registry.destroy_device(&f.process, handle).unwrap();
        assert_eq!(device.state(), ObjectState::Destroyed);
        assert_eq!(device.reference_count(), 0);
        assert_eq!(binding.reference_count(), 1);
        assert!(binding.devices().is_empty());
        assert_eq!(f.process.device(handle).err(), Some(Error::InvalidHandle));
        assert_eq!(f.host.live_objects(), 0);
    }

    #[test]
    fn test_create_device_host_error() {
        let f = fixture();
        f.host.fail_next(HostStatus::NO_MEMORY);
        assert_eq!(
            f.registry
                .create_device(&f.process, f.adapter, DeviceFlags::empty()),
            Err(Error::Host(HostStatus::NO_MEMORY))
        );
        assert_eq!(f.registry.bindings_of_process(&f.process)[0].reference_count(), 1);
        assert_eq!(f.process.handle_count(), 1);
    }

    #[test]
    fn test_paging_queue_lifecycle() {
        let f = fixture();
        let device = f
            .registry
            .create_device(&f.process, f.adapter, DeviceFlags::empty())
            .unwrap();
        let info = f.registry.create_paging_queue(&f.process, device, 0).unwrap();

        assert_ne!(info.fence_address, 0);
        assert!(matches!(
            f.process.monitored_fence(info.sync_object),
            Ok(HandleObject::PagingQueue(_))
        ));
        assert_eq!(f.process.device(device).unwrap().reference_count(), 2);

        f.registry.destroy_paging_queue(&f.process, info.paging_queue).unwrap();
        assert!(f.process.monitored_fence(info.sync_object).is_err());
        assert_eq!(f.process.device(device).unwrap().reference_count(), 1);
        assert_eq!(
            f.registry.destroy_paging_queue(&f.process, info.paging_queue),
            Err(Error::InvalidHandle)
        );
    }

    #[test]
    fn test_device_destroy_takes_paging_queues() {
        let f = fixture();
        let device = f
            .registry
            .create_device(&f.process, f.adapter, DeviceFlags::empty())
            .unwrap();
        let info = f.registry.create_paging_queue(&f.process, device, 0).unwrap();
        let queue = f.process.paging_queue(info.paging_queue).unwrap();

        f.registry.destroy_device(&f.process, device).unwrap();
        assert_eq!(queue.state(), ObjectState::Destroyed);
        assert_eq!(queue.reference_count(), 0);
        assert_eq!(f.process.handle_count(), 1);
    }

    // A destroy that lands after the handle is visible but before the
    // object is listed on the device must leave nothing behind. The list
    // lock is held to park the creator in between.

    #[test]
    fn test_context_destroyed_before_listed() {
        let f = fixture();
        let device_handle = f
            .registry
            .create_device(&f.process, f.adapter, DeviceFlags::empty())
            .unwrap();
        let device = f.process.device(device_handle).unwrap();

        let listing = device.contexts.write();
        let creator = {
            let (registry, process) = (f.registry.clone(), f.process.clone());
            thread::spawn(move || {
                registry.create_context(&process, device_handle, &ContextCreateInfo::default())
            })
        };
        let HandleObject::Context(context) = f.process.wait_for_object(HandleType::Context) else {
            unreachable!()
        };
        while context.handle().is_none() {
            thread::yield_now();
        }
        let handle = context.handle().unwrap();
        let destroyer = {
            let (registry, process) = (f.registry.clone(), f.process.clone());
            thread::spawn(move || registry.destroy_context(&process, handle))
        };
        while context.state() != ObjectState::Destroyed {
            thread::yield_now();
        }
        drop(listing);

        assert_eq!(creator.join().unwrap(), Ok(handle));
        assert_eq!(destroyer.join().unwrap(), Ok(()));
        assert_eq!(device.context_count(), 0);
        assert_eq!(context.reference_count(), 0);
        assert_eq!(device.reference_count(), 1);
        assert_eq!(f.process.context(handle).err(), Some(Error::InvalidHandle));
        assert_eq!(f.process.handle_count(), 2);
        assert_eq!(f.host.live_objects(), 1);
    }

    #[test]
    fn test_sync_object_destroyed_before_listed() {
        let f = fixture();
        let device_handle = f
            .registry
            .create_device(&f.process, f.adapter, DeviceFlags::empty())
            .unwrap();
        let device = f.process.device(device_handle).unwrap();

        let listing = device.objects.write();
        let creator = {
            let (registry, process) = (f.registry.clone(), f.process.clone());
            thread::spawn(move || {
                registry.create_sync_object(
                    &process,
                    &SyncObjectCreateInfo::new(device_handle, SyncObjectType::MonitoredFence),
                )
            })
        };
        let HandleObject::SyncObject(syncobj) = f.process.wait_for_object(HandleType::SyncObject) else {
            unreachable!()
        };
        while syncobj.handle().is_none() {
            thread::yield_now();
        }
        let handle = syncobj.handle().unwrap();
        let destroyer = {
            let (registry, process) = (f.registry.clone(), f.process.clone());
            thread::spawn(move || registry.destroy_sync_object(&process, handle))
        };
        while syncobj.state() != ObjectState::Destroyed {
            thread::yield_now();
        }
        drop(listing);

        assert_eq!(creator.join().unwrap().unwrap().sync_object, handle);
        assert_eq!(destroyer.join().unwrap(), Ok(()));
        assert!(device.objects.read().syncobjs.is_empty());
        assert_eq!(syncobj.reference_count(), 0);
        assert_eq!(device.reference_count(), 1);
        assert_eq!(f.process.sync_object(handle).err(), Some(Error::InvalidHandle));
        assert_eq!(f.host.live_sync_objects(), 0);
        assert_eq!(f.host.live_objects(), 1);
    }

    #[test]
    fn test_resource_destroyed_before_listed() {
        let f = fixture();
        let device_handle = f
            .registry
            .create_device(&f.process, f.adapter, DeviceFlags::empty())
            .unwrap();
        let device = f.process.device(device_handle).unwrap();
        let info = AllocationCreateInfo {
            flags: AllocationFlags::CREATE_RESOURCE,
            allocations: vec![
                AllocationDesc {
                    private_data: vec![1],
                    page_count: 1,
                },
                AllocationDesc {
                    private_data: vec![2],
                    page_count: 1,
                },
            ],
            ..AllocationCreateInfo::new(device_handle)
        };

        let listing = device.objects.write();
        let creator = {
            let (registry, process) = (f.registry.clone(), f.process.clone());
            thread::spawn(move || registry.create_allocation(&process, &info))
        };
        let HandleObject::Resource(resource) = f.process.wait_for_object(HandleType::Resource) else {
            unreachable!()
        };
        while resource.handle().is_none() {
            thread::yield_now();
        }
        let handle = resource.handle().unwrap();
        let destroyer = {
            let (registry, process) = (f.registry.clone(), f.process.clone());
            thread::spawn(move || registry.destroy_allocations(&process, device_handle, Some(handle), &[]))
        };
        while resource.state() != ObjectState::Destroyed {
            thread::yield_now();
        }
        drop(listing);

        assert_eq!(creator.join().unwrap().unwrap().resource, Some(handle));
        assert_eq!(destroyer.join().unwrap(), Ok(()));
        assert!(device.objects.read().resources.is_empty());
        assert!(resource.allocations().is_empty());
        assert_eq!(resource.reference_count(), 0);
        assert_eq!(device.reference_count(), 1);
        assert_eq!(f.process.resource(handle).err(), Some(Error::InvalidHandle));
        assert_eq!(f.process.handle_count(), 2);
        assert_eq!(f.host.live_resources(), 0);
        assert_eq!(f.host.live_allocations(), 0);
        assert_eq!(f.host.live_objects(), 1);
    }
}
