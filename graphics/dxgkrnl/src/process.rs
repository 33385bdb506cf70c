//! Processes and process-adapter bindings
//!
//! A [`Process`] is one user-mode caller. It owns two handle tables: one for
//! adapters and one for everything else. For every adapter it opens, the
//! process gets exactly one [`ProcessAdapter`] binding, which owns the
//! process's devices on that adapter.
//!
//! A binding is referenced by every open adapter handle and by every device
//! created through it. When the last reference goes it is unlinked from the
//! registry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::debug;

use crate::adapter::Adapter;
use crate::allocation::{Allocation, Resource};
use crate::config::DriverConfig;
use crate::context::{Context, HwQueue};
use crate::device::{Device, PagingQueue};
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleTable, HandleType};
use crate::lock::{LockRank, OrderedMutex};
use crate::protocol::HostHandle;
use crate::refcount::RefCount;
use crate::registry::Registry;
use crate::syncobj::SyncObject;

/// Object stored in a process handle table
#[derive(Clone)]
pub enum HandleObject {
    Device(Arc<Device>),
    Context(Arc<Context>),
    HwQueue(Arc<HwQueue>),
    Allocation(Arc<Allocation>),
    Resource(Arc<Resource>),
    SyncObject(Arc<SyncObject>),
    PagingQueue(Arc<PagingQueue>),
}

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// One user-mode caller
pub struct Process {
    id: u64,
    pid: u32,
    host: HostHandle,
    refcount: RefCount,
    destroyed: AtomicBool,
    pub(crate) handles: HandleTable<HandleObject>,
    pub(crate) adapter_handles: HandleTable<Arc<Adapter>>,
}

impl Process {
    pub(crate) fn new(pid: u32, host: HostHandle, config: &DriverConfig) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed),
            pid,
            host,
            refcount: RefCount::new(),
            destroyed: AtomicBool::new(false),
            handles: HandleTable::new("objects", LockRank::HandleTable, config.handle_table_capacity),
            adapter_handles: HandleTable::new(
                "adapters",
                LockRank::AdapterHandleTable,
                config.adapter_handle_capacity,
            ),
        })
    }

    /// Registry-unique id; pids may be reused, ids are not
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Handle of the process in the host's namespace
    pub fn host_handle(&self) -> HostHandle {
        self.host
    }

    pub(crate) fn acquire_reference(&self) -> bool {
        self.refcount.acquire()
    }

    /// Drop one open reference. Returns true when the process must be torn
    /// down.
    pub(crate) fn release_reference(&self) -> bool {
        if self.refcount.release() {
            self.destroyed.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn reference_count(&self) -> u32 {
        self.refcount.count()
    }

    pub(crate) fn check_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            Err(Error::ObjectDestroyed)
        } else {
            Ok(())
        }
    }

    /// Live entries in the object table plus the adapter table
    pub fn handle_count(&self) -> usize {
        self.handles.len() + self.adapter_handles.len()
    }

    pub fn adapter(&self, handle: Handle) -> Result<Arc<Adapter>> {
        self.adapter_handles.lookup(handle, HandleType::Adapter)
    }

    pub fn device(&self, handle: Handle) -> Result<Arc<Device>> {
        match self.handles.lookup(handle, HandleType::Device)? {
            HandleObject::Device(device) => Ok(device),
            _ => Err(Error::WrongHandleType),
        }
    }

    pub fn context(&self, handle: Handle) -> Result<Arc<Context>> {
        match self.handles.lookup(handle, HandleType::Context)? {
            HandleObject::Context(context) => Ok(context),
            _ => Err(Error::WrongHandleType),
        }
    }

    pub fn hwqueue(&self, handle: Handle) -> Result<Arc<HwQueue>> {
        match self.handles.lookup(handle, HandleType::HwQueue)? {
            HandleObject::HwQueue(hwqueue) => Ok(hwqueue),
            _ => Err(Error::WrongHandleType),
        }
    }

    pub fn allocation(&self, handle: Handle) -> Result<Arc<Allocation>> {
        match self.handles.lookup(handle, HandleType::Allocation)? {
            HandleObject::Allocation(allocation) => Ok(allocation),
            _ => Err(Error::WrongHandleType),
        }
    }

    pub fn resource(&self, handle: Handle) -> Result<Arc<Resource>> {
        match self.handles.lookup(handle, HandleType::Resource)? {
            HandleObject::Resource(resource) => Ok(resource),
            _ => Err(Error::WrongHandleType),
        }
    }

    pub fn sync_object(&self, handle: Handle) -> Result<Arc<SyncObject>> {
        match self.handles.lookup(handle, HandleType::SyncObject)? {
            HandleObject::SyncObject(syncobj) => Ok(syncobj),
            _ => Err(Error::WrongHandleType),
        }
    }

    pub fn paging_queue(&self, handle: Handle) -> Result<Arc<PagingQueue>> {
        match self.handles.lookup(handle, HandleType::PagingQueue)? {
            HandleObject::PagingQueue(queue) => Ok(queue),
            _ => Err(Error::WrongHandleType),
        }
    }

    /// Look up a monitored fence handle: a hwqueue progress fence or a
    /// paging queue fence
    pub fn monitored_fence(&self, handle: Handle) -> Result<HandleObject> {
        self.handles.lookup(handle, HandleType::MonitoredFence)
    }

    /// Mark `handle` destroyed, if present
    pub(crate) fn mark_handle_destroyed(&self, handle: Option<Handle>) {
        if let Some(handle) = handle {
            self.handles.mark_destroyed(handle);
        }
    }

    pub(crate) fn free_handle(&self, handle: Option<Handle>) {
        if let Some(handle) = handle {
            self.handles.free(handle);
        }
    }
}

/// A process's use of one adapter
pub struct ProcessAdapter {
    process: Weak<Process>,
    process_id: u64,
    pid: u32,
    adapter: Arc<Adapter>,
    registry: Weak<Registry>,
    refcount: RefCount,
    devices: OrderedMutex<Vec<Arc<Device>>>,
}

impl ProcessAdapter {
    /// Create a binding holding one adapter reference. The caller has
    /// already acquired it.
    pub(crate) fn new(
        process: &Arc<Process>,
        adapter: Arc<Adapter>,
        registry: Weak<Registry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            process: Arc::downgrade(process),
            process_id: process.id(),
            pid: process.pid(),
            adapter,
            registry,
            refcount: RefCount::new(),
            devices: OrderedMutex::new(LockRank::BindingDevices, Vec::new()),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn key(&self) -> (u64, u64) {
        (self.process_id, self.adapter.id())
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }

    pub fn acquire_reference(&self) -> bool {
        self.refcount.acquire()
    }

    /// Release one reference; the last one unlinks the binding
    pub fn release_reference(self: &Arc<Self>) {
        if !self.refcount.release() {
            return;
        }

        debug_assert!(self.devices.lock().is_empty());

        if let Some(registry) = self.registry.upgrade() {
            registry.unlink_binding(self);
        }
        debug!(
            "pid {} binding to adapter {} released",
            self.pid,
            self.adapter.luid()
        );
        self.adapter.release_reference();
    }

    pub fn reference_count(&self) -> u32 {
        self.refcount.count()
    }

    /// Snapshot of the devices created through this binding
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().clone()
    }

    pub(crate) fn add_device(&self, device: Arc<Device>) {
        self.devices.lock().push(device);
    }

    pub(crate) fn remove_device(&self, device: &Arc<Device>) {
        self.devices.lock().retain(|d| !Arc::ptr_eq(d, device));
    }
}

#[cfg(test)]
impl Process {
    /// Spin until a handle of `handle_type` shows up and return its object
    pub(crate) fn wait_for_object(&self, handle_type: HandleType) -> HandleObject {
        loop {
            let found = self
                .handles
                .entries()
                .into_iter()
                .find(|(_, t, _)| *t == handle_type);
            if let Some((_, _, object)) = found {
                return object;
            }
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::loopback::LoopbackHost;
    use crate::protocol::{CommandType, DeviceFlags, Luid};

    #[test]
    fn test_device_destroyed_before_listed() {
        let host = LoopbackHost::new();
        let registry = Registry::new(DriverConfig::default(), host.endpoint());
        registry.add_adapter(Luid::new(2, 0), host.endpoint()).unwrap();
        let process = registry.process_create(30).unwrap();
        let adapter = registry
            .open_adapter_from_luid(&process, Luid::new(2, 0))
            .unwrap();
        let binding = registry.bindings_of_process(&process)[0].clone();

        let listing = binding.devices.lock();
        let creator = {
            let (registry, process) = (registry.clone(), process.clone());
            thread::spawn(move || registry.create_device(&process, adapter, DeviceFlags::empty()))
        };
        let HandleObject::Device(device) = process.wait_for_object(HandleType::Device) else {
            unreachable!()
        };
        while device.handle().is_none() {
            thread::yield_now();
        }
        let handle = device.handle().unwrap();
        let destroyer = {
            let (registry, process) = (registry.clone(), process.clone());
            thread::spawn(move || registry.destroy_device(&process, handle))
        };
        // The device lock ranks below the list, so watch the host instead.
        while host.command_count(CommandType::DestroyDevice) == 0 {
            thread::yield_now();
        }
        drop(listing);

        assert_eq!(creator.join().unwrap(), Ok(handle));
        assert_eq!(destroyer.join().unwrap(), Ok(()));
        assert!(binding.devices().is_empty());
        assert_eq!(device.reference_count(), 0);
        assert_eq!(binding.reference_count(), 1);
        assert_eq!(process.device(handle).err(), Some(Error::InvalidHandle));
        assert_eq!(process.handle_count(), 1);
        assert_eq!(host.live_objects(), 0);
    }
}
