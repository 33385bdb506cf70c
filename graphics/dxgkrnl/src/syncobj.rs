//! Sync objects
//!
//! Monitored fences are device objects and go down with their device. All
//! other kinds (mutex, semaphore, fence, CPU notification) are kept on the
//! adapter and only stop with it.
//!
//! CPU waits go through host events: the guest registers an event id, sends
//! the wait, and the host signals the id once the wait is satisfied.
//!
//! ```text
//!  wait_sync_object_cpu              host
//!     │ add HostEvent(id)             │
//!     │ WaitForSyncObjectFromCpu(id) ─►│
//!     │ ◄──────────── completion ──────│
//!     │ (locks dropped, blocking)      │
//!     │ ◄──────── SignalEvent(id) ─────│
//!     ▼ done
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use log::{debug, warn};

use crate::adapter::Adapter;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleType};
use crate::host_event::{Completion, CpuEvent, HostEvent, HostEventList, HostEventTarget};
use crate::lock::{LockRank, OrderedMutex};
use crate::process::{HandleObject, Process};
use crate::protocol::{
    HostHandle, HostRequest, HostResponse, SignalFlags, SyncObjectFlags, SyncObjectType,
};
use crate::refcount::{ObjectState, RefCount};
use crate::registry::Registry;
use crate::shared::{Descriptor, SharedObject, SharedSyncObject};

/// Parameters of [`Registry::create_sync_object`]
#[derive(Debug, Clone)]
pub struct SyncObjectCreateInfo {
    pub device: Handle,
    pub sync_type: SyncObjectType,
    pub flags: SyncObjectFlags,
    pub initial_value: u64,
    /// Event the host signals; required for CPU notifications
    pub cpu_event: Option<Arc<CpuEvent>>,
}

impl SyncObjectCreateInfo {
    pub fn new(device: Handle, sync_type: SyncObjectType) -> Self {
        Self {
            device,
            sync_type,
            flags: SyncObjectFlags::empty(),
            initial_value: 0,
            cpu_event: None,
        }
    }
}

/// Result of [`Registry::create_sync_object`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedSyncObject {
    pub sync_object: Handle,
    /// Global handle of the new shared anchor, for global handle sharing
    pub global_share: Option<Handle>,
    /// CPU visible fence value of a monitored fence, 0 otherwise
    pub fence_address: u64,
}

/// GPU signal of [`Registry::signal_sync_object`]
#[derive(Debug, Clone)]
pub struct SignalInfo {
    pub device: Handle,
    /// Contexts doing the signal
    pub contexts: Vec<Handle>,
    pub objects: Vec<Handle>,
    pub fence_values: Vec<u64>,
    pub flags: SignalFlags,
}

/// CPU wait of [`Registry::wait_sync_object_cpu`]
#[derive(Debug, Clone)]
pub struct CpuWaitInfo {
    pub device: Handle,
    pub objects: Vec<Handle>,
    pub fence_values: Vec<u64>,
    pub flags: SignalFlags,
    /// Signal this event instead of blocking
    pub event: Option<Arc<CpuEvent>>,
    /// Bound on a blocking wait
    pub timeout: Option<Duration>,
}

/// GPU/CPU fence primitive
pub struct SyncObject {
    handle: OnceLock<Handle>,
    host: HostHandle,
    sync_type: SyncObjectType,
    flags: SyncObjectFlags,
    adapter: Weak<Adapter>,
    /// Set for device-type objects only
    device: Option<Weak<Device>>,
    process: Weak<Process>,
    process_host: HostHandle,
    fence_address: u64,
    shared: Option<Arc<SharedSyncObject>>,
    /// Opened from a descriptor and holding a host NT reference
    nt_reference: AtomicBool,
    /// Host event of a CPU notification, 0 otherwise
    cpu_event_id: u64,
    events: Arc<HostEventList>,
    refcount: RefCount,
    state: OrderedMutex<ObjectState>,
}

impl SyncObject {
    pub fn handle(&self) -> Option<Handle> {
        self.handle.get().copied()
    }

    pub fn host_handle(&self) -> HostHandle {
        self.host
    }

    pub fn sync_type(&self) -> SyncObjectType {
        self.sync_type
    }

    pub fn flags(&self) -> SyncObjectFlags {
        self.flags
    }

    pub fn fence_address(&self) -> u64 {
        self.fence_address
    }

    pub fn shared(&self) -> Option<&Arc<SharedSyncObject>> {
        self.shared.as_ref()
    }

    pub fn state(&self) -> ObjectState {
        *self.state.lock()
    }

    fn check_usable(&self) -> Result<()> {
        match *self.state.lock() {
            ObjectState::Active => Ok(()),
            ObjectState::Created | ObjectState::Destroyed => Err(Error::ObjectDestroyed),
            ObjectState::Stopped => Err(Error::DeviceStopped),
        }
    }

    fn on_adapter(&self, adapter: &Arc<Adapter>) -> bool {
        self.adapter.as_ptr() == Arc::as_ptr(adapter)
    }

    fn send(&self, request: HostRequest) -> Result<HostResponse> {
        let adapter = self.adapter.upgrade().ok_or(Error::AdapterStopped)?;
        adapter.channel().send_request(self.process_host, request)
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
        debug!("sync object {} released", self.host);

        match &self.device {
            Some(device) => {
                if let Some(device) = device.upgrade() {
                    device.release_reference();
                }
            }
            None => {
                if let Some(adapter) = self.adapter.upgrade() {
                    adapter.release_reference();
                }
            }
        }
    }

    pub fn reference_count(&self) -> u32 {
        self.refcount.count()
    }

    /// Fail further operations; the host object stays until destroy
    pub(crate) fn stop(&self) {
        self.state.lock().stop();
    }

    pub(crate) fn destroy(self: &Arc<Self>, parent_teardown: bool) {
        if !self.state.lock().mark_destroyed() {
            return;
        }

        if self.cpu_event_id != 0 {
            self.events.cancel(self.cpu_event_id);
        }

        if !parent_teardown {
            if let Err(err) = self.send(HostRequest::DestroySyncObject {
                sync_object: self.host,
            }) {
                debug!("sync object {}: host destroy: {}", self.host, err);
            }
            match &self.device {
                Some(device) => {
                    if let Some(device) = device.upgrade() {
                        device.remove_syncobj(self);
                    }
                }
                None => {
                    if let Some(adapter) = self.adapter.upgrade() {
                        adapter.detach_syncobj(self);
                    }
                }
            }
        }

        if let Some(anchor) = &self.shared {
            anchor.remove_participant(self);
        }
        if let Some(process) = self.process.upgrade() {
            process.mark_handle_destroyed(self.handle());
        }
        self.release_reference();
    }
}

/// Fields of a sync object that differ between create and open
struct NewSyncObject {
    host: HostHandle,
    sync_type: SyncObjectType,
    flags: SyncObjectFlags,
    fence_address: u64,
    shared: Option<Arc<SharedSyncObject>>,
    nt_reference: bool,
    cpu_event_id: u64,
}

impl Registry {
    /// Take the owner reference, build the object and give it a handle.
    /// The object is not listed on its owner yet.
    fn build_sync_object(
        &self,
        process: &Arc<Process>,
        device: &Arc<Device>,
        new: NewSyncObject,
    ) -> Result<Arc<SyncObject>> {
        let device_type = new.sync_type.is_device_type();
        let owned = if device_type {
            device.acquire_reference()
        } else {
            device.adapter().acquire_reference()
        };
        if !owned {
            return Err(Error::DeviceStopped);
        }

        let syncobj = Arc::new(SyncObject {
            handle: OnceLock::new(),
            host: new.host,
            sync_type: new.sync_type,
            flags: new.flags,
            adapter: Arc::downgrade(device.adapter()),
            device: device_type.then(|| Arc::downgrade(device)),
            process: Arc::downgrade(process),
            process_host: process.host_handle(),
            fence_address: new.fence_address,
            shared: new.shared,
            nt_reference: AtomicBool::new(new.nt_reference),
            cpu_event_id: new.cpu_event_id,
            events: self.host_events().clone(),
            refcount: RefCount::new(),
            state: OrderedMutex::new(LockRank::SyncObject, ObjectState::Created),
        });

        match process
            .handles
            .allocate(HandleObject::SyncObject(syncobj.clone()), HandleType::SyncObject)
        {
            Ok(handle) => {
                let _ = syncobj.handle.set(handle);
                Ok(syncobj)
            }
            Err(err) => {
                // Hand the anchor and NT references back to the caller.
                if let Some(anchor) = &syncobj.shared {
                    syncobj.nt_reference.store(false, Ordering::Release);
                    anchor.acquire_reference();
                }
                syncobj.release_reference();
                Err(err)
            }
        }
    }

    /// List a built object on its owner and on its anchor
    fn publish_sync_object(device: &Arc<Device>, syncobj: &Arc<SyncObject>) {
        if let Some(anchor) = &syncobj.shared {
            anchor.add_participant(syncobj);
        }
        if syncobj.device.is_some() {
            device.objects.write().syncobjs.push(syncobj.clone());
        } else {
            device.adapter().shared.lock().syncobjs.push(syncobj.clone());
        }
        if !syncobj.state.lock().activate() {
            // Destroyed through its handle before it was listed.
            device.remove_syncobj(syncobj);
            device.adapter().detach_syncobj(syncobj);
        }
    }

    pub fn create_sync_object(
        &self,
        process: &Arc<Process>,
        info: &SyncObjectCreateInfo,
    ) -> Result<CreatedSyncObject> {
        self.check_running()?;
        let flags = info.flags;
        if info.sync_type == SyncObjectType::CpuNotification && info.cpu_event.is_none() {
            return Err(Error::InvalidParameter);
        }
        if flags.contains(SyncObjectFlags::NT_SECURITY_SHARING) && !flags.contains(SyncObjectFlags::SHARED) {
            return Err(Error::InvalidParameter);
        }

        let device = process.device(info.device)?;
        let active = device.lock_active()?;

        let cpu_event_id = match &info.cpu_event {
            Some(event) => {
                let event_id = self.new_host_event_id();
                self.add_host_event(HostEvent {
                    event_id,
                    pid: process.pid(),
                    target: HostEventTarget::Cpu(event.clone()),
                    destroy_after_signal: false,
                })?;
                event_id
            }
            None => 0,
        };

        let created = device
            .send(HostRequest::CreateSyncObject {
                device: device.host_handle(),
                sync_type: info.sync_type,
                flags,
                initial_value: info.initial_value,
                cpu_event_id,
            })
            .and_then(|response| match response {
                HostResponse::SyncObject {
                    sync_object,
                    fence_address,
                } => Ok((sync_object, fence_address)),
                _ => Err(Error::ChannelFailure),
            });
        let (host, fence_address) = match created {
            Ok(created) => created,
            Err(err) => {
                if cpu_event_id != 0 {
                    self.cancel_host_event(cpu_event_id);
                }
                return Err(err);
            }
        };

        let host_destroy = || {
            if cpu_event_id != 0 {
                self.cancel_host_event(cpu_event_id);
            }
            let _ = device.send(HostRequest::DestroySyncObject { sync_object: host });
        };

        let anchor = flags.contains(SyncObjectFlags::SHARED).then(|| {
            SharedSyncObject::new(
                device.adapter(),
                self.weak(),
                host,
                info.sync_type,
                flags.contains(SyncObjectFlags::NT_SECURITY_SHARING),
            )
        });

        let global_share = match &anchor {
            Some(anchor) if !anchor.nt_security() => {
                let shared = self
                    .shared_handles
                    .allocate(SharedObject::SyncObject(anchor.clone()), HandleType::SharedSyncObject);
                match shared {
                    Ok(handle) => {
                        anchor.set_global_handle(handle);
                        Some(handle)
                    }
                    Err(err) => {
                        host_destroy();
                        drop(active);
                        anchor.release_reference();
                        return Err(err);
                    }
                }
            }
            _ => None,
        };

        let built = self.build_sync_object(
            process,
            &device,
            NewSyncObject {
                host,
                sync_type: info.sync_type,
                flags,
                fence_address,
                shared: anchor.clone(),
                nt_reference: false,
                cpu_event_id,
            },
        );
        let syncobj = match built {
            Ok(syncobj) => syncobj,
            Err(err) => {
                host_destroy();
                drop(active);
                if let Some(anchor) = anchor {
                    anchor.release_reference();
                }
                return Err(err);
            }
        };
        Self::publish_sync_object(&device, &syncobj);

        let handle = syncobj.handle().ok_or(Error::ChannelFailure)?;
        debug!(
            "device {} created {:?} sync object {} ({})",
            device.host_handle(),
            info.sync_type,
            handle,
            host
        );
        Ok(CreatedSyncObject {
            sync_object: handle,
            global_share,
            fence_address,
        })
    }

    pub fn destroy_sync_object(&self, process: &Arc<Process>, handle: Handle) -> Result<()> {
        let syncobj = process.sync_object(handle)?;
        syncobj.destroy(false);
        Ok(())
    }

    /// Open the globally shared sync object `global` on a device
    pub fn open_sync_object(
        &self,
        process: &Arc<Process>,
        device_handle: Handle,
        global: Handle,
        flags: SyncObjectFlags,
    ) -> Result<Handle> {
        self.check_running()?;
        let device = process.device(device_handle)?;
        let anchor = match self.shared_handles.lookup(global, HandleType::SharedSyncObject)? {
            SharedObject::SyncObject(anchor) => anchor,
            SharedObject::Resource(_) => return Err(Error::WrongHandleType),
        };
        if !anchor.acquire_reference() {
            return Err(Error::InvalidHandle);
        }

        let opened = self.open_shared_sync_object(process, &device, &anchor, flags, false);
        if opened.is_err() {
            anchor.release_reference();
        }
        opened
    }

    /// Open the sync object behind a descriptor grant, redeeming it
    pub fn open_sync_object_from_descriptor(
        &self,
        process: &Arc<Process>,
        device_handle: Handle,
        descriptor: Descriptor,
        flags: SyncObjectFlags,
    ) -> Result<Handle> {
        self.check_running()?;
        let device = process.device(device_handle)?;
        let object = self.redeem_descriptor(descriptor)?;
        let anchor = match &object {
            SharedObject::SyncObject(anchor) => anchor.clone(),
            SharedObject::Resource(_) => {
                self.restore_descriptor(descriptor, object);
                return Err(Error::WrongHandleType);
            }
        };

        let opened = self.open_shared_sync_object(process, &device, &anchor, flags, true);
        if opened.is_err() {
            self.restore_descriptor(descriptor, object);
        }
        opened
    }

    /// Build a participant of `anchor`. Consumes one anchor reference on
    /// success.
    fn open_shared_sync_object(
        &self,
        process: &Arc<Process>,
        device: &Arc<Device>,
        anchor: &Arc<SharedSyncObject>,
        flags: SyncObjectFlags,
        nt_reference: bool,
    ) -> Result<Handle> {
        let active = device.lock_active()?;

        let (host, fence_address) = match device.send(HostRequest::OpenSyncObject {
            device: device.host_handle(),
            shared: anchor.host_shared_handle(),
            flags,
        })? {
            HostResponse::SyncObject {
                sync_object,
                fence_address,
            } => (sync_object, fence_address),
            _ => return Err(Error::ChannelFailure),
        };

        let built = self.build_sync_object(
            process,
            device,
            NewSyncObject {
                host,
                sync_type: anchor.sync_type(),
                flags,
                fence_address,
                shared: Some(anchor.clone()),
                nt_reference,
                cpu_event_id: 0,
            },
        );
        let syncobj = match built {
            Ok(syncobj) => syncobj,
            Err(err) => {
                let _ = device.send(HostRequest::DestroySyncObject { sync_object: host });
                return Err(err);
            }
        };
        Self::publish_sync_object(device, &syncobj);
        drop(active);

        let handle = syncobj.handle().ok_or(Error::ChannelFailure)?;
        debug!(
            "pid {} opened shared sync object {} as {}",
            process.pid(),
            anchor.host_shared_handle(),
            handle
        );
        Ok(handle)
    }

    /// Look up sync objects for a signal or wait on `device`
    fn resolve_sync_objects(
        &self,
        process: &Arc<Process>,
        device: &Arc<Device>,
        objects: &[Handle],
        fence_values: &[u64],
    ) -> Result<Vec<HostHandle>> {
        if objects.is_empty()
            || objects.len() > self.config().max_objects_per_wait
            || fence_values.len() != objects.len()
        {
            return Err(Error::InvalidParameter);
        }

        objects
            .iter()
            .map(|&handle| {
                let syncobj = process.sync_object(handle)?;
                if !syncobj.on_adapter(device.adapter()) {
                    return Err(Error::InvalidParameter);
                }
                syncobj.check_usable()?;
                Ok(syncobj.host)
            })
            .collect()
    }

    /// Signal sync objects from the GPU timelines of `contexts`
    pub fn signal_sync_object(&self, process: &Arc<Process>, info: &SignalInfo) -> Result<()> {
        if info.contexts.is_empty() {
            return Err(Error::InvalidParameter);
        }
        let device = process.device(info.device)?;
        let objects = self.resolve_sync_objects(process, &device, &info.objects, &info.fence_values)?;
        let contexts = info
            .contexts
            .iter()
            .map(|&handle| {
                let context = process.context(handle)?;
                if !Arc::ptr_eq(&context.device()?, &device) {
                    return Err(Error::InvalidParameter);
                }
                Ok(context)
            })
            .collect::<Result<Vec<_>>>()?;

        let _active = device.lock_active()?;
        for context in &contexts {
            context.check_active()?;
        }

        device.send(HostRequest::SignalSyncObject {
            device: device.host_handle(),
            flags: info.flags,
            contexts: contexts.iter().map(|c| c.host_handle()).collect(),
            objects,
            fence_values: info.fence_values.clone(),
            cpu_event_id: 0,
        })?;
        Ok(())
    }

    /// Signal sync objects from the CPU
    pub fn signal_sync_object_cpu(
        &self,
        process: &Arc<Process>,
        device_handle: Handle,
        objects: &[Handle],
        fence_values: &[u64],
        flags: SignalFlags,
    ) -> Result<()> {
        let device = process.device(device_handle)?;
        let objects = self.resolve_sync_objects(process, &device, objects, fence_values)?;
        let _active = device.lock_active()?;

        device.send(HostRequest::SignalSyncObject {
            device: device.host_handle(),
            flags,
            contexts: Vec::new(),
            objects,
            fence_values: fence_values.to_vec(),
            cpu_event_id: 0,
        })?;
        Ok(())
    }

    /// Make a context wait for sync objects on the GPU
    pub fn wait_sync_object_gpu(
        &self,
        process: &Arc<Process>,
        context_handle: Handle,
        objects: &[Handle],
        fence_values: &[u64],
    ) -> Result<()> {
        let context = process.context(context_handle)?;
        let device = context.device()?;
        let objects = self.resolve_sync_objects(process, &device, objects, fence_values)?;
        let _active = device.lock_active()?;
        context.check_active()?;

        device.send(HostRequest::WaitForSyncObjectFromGpu {
            context: context.host_handle(),
            objects,
            fence_values: fence_values.to_vec(),
        })?;
        Ok(())
    }

    /// Wait on the CPU until sync objects reach their fence values. With an
    /// event in `info` the call returns at once and the event is signalled
    /// later; otherwise it blocks, with no locks held, until the host
    /// signals, the wait times out or the event is cancelled.
    pub fn wait_sync_object_cpu(&self, process: &Arc<Process>, info: &CpuWaitInfo) -> Result<()> {
        self.check_running()?;
        let device = process.device(info.device)?;
        let objects = self.resolve_sync_objects(process, &device, &info.objects, &info.fence_values)?;

        let event_id = self.new_host_event_id();
        let completion = Completion::new();
        let target = match &info.event {
            Some(event) => HostEventTarget::Cpu(event.clone()),
            None => HostEventTarget::Completion(completion.clone()),
        };
        self.add_host_event(HostEvent {
            event_id,
            pid: process.pid(),
            target,
            destroy_after_signal: true,
        })?;

        let sent = device.lock_active().and_then(|_active| {
            device.send(HostRequest::WaitForSyncObjectFromCpu {
                device: device.host_handle(),
                flags: info.flags,
                objects,
                fence_values: info.fence_values.clone(),
                event_id,
            })
        });
        if let Err(err) = sent {
            self.cancel_host_event(event_id);
            return Err(err);
        }

        if info.event.is_some() {
            return Ok(());
        }

        match completion.wait(info.timeout) {
            Ok(()) => Ok(()),
            Err(Error::Timeout) => {
                // Lost the race if the host signalled in the meantime.
                if self.cancel_host_event(event_id) {
                    Err(Error::Timeout)
                } else {
                    Ok(())
                }
            }
            Err(err) => {
                warn!("pid {}: cpu wait {} aborted: {}", process.pid(), event_id, err);
                Err(err)
            }
        }
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
        registry.add_adapter(Luid::new(4, 0), host.endpoint()).unwrap();
        let process = registry.process_create(20).unwrap();
        let adapter = registry
            .open_adapter_from_luid(&process, Luid::new(4, 0))
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

    fn cpu_wait(device: Handle, object: Handle, value: u64) -> CpuWaitInfo {
        CpuWaitInfo {
            device,
            objects: vec![object],
            fence_values: vec![value],
            flags: SignalFlags::empty(),
            event: None,
            timeout: Some(Duration::from_millis(50)),
        }
    }

    #[test]
    fn test_monitored_fence_lives_on_device() {
        let f = fixture();
        let created = f
            .registry
            .create_sync_object(
                &f.process,
                &SyncObjectCreateInfo::new(f.device, SyncObjectType::MonitoredFence),
            )
            .unwrap();
        assert_ne!(created.fence_address, 0);

        let device = f.process.device(f.device).unwrap();
        assert_eq!(device.reference_count(), 2);

        f.registry.destroy_device(&f.process, f.device).unwrap();
        let syncobj_gone = f.process.sync_object(created.sync_object).is_err();
        assert!(syncobj_gone);
        assert_eq!(device.reference_count(), 0);
    }

    #[test]
    fn test_fence_lives_on_adapter() {
        let f = fixture();
        let created = f
            .registry
            .create_sync_object(
                &f.process,
                &SyncObjectCreateInfo::new(f.device, SyncObjectType::Fence),
            )
            .unwrap();
        let adapter = f.registry.adapters()[0].clone();
        assert_eq!(adapter.reference_count(), 3);

        f.registry.destroy_device(&f.process, f.device).unwrap();
        assert!(f.process.sync_object(created.sync_object).is_ok());

        f.registry
            .destroy_sync_object(&f.process, created.sync_object)
            .unwrap();
        assert_eq!(adapter.reference_count(), 2);
    }

    #[test]
    fn test_cpu_notification_requires_event() {
        let f = fixture();
        let info = SyncObjectCreateInfo::new(f.device, SyncObjectType::CpuNotification);
        assert_eq!(
            f.registry.create_sync_object(&f.process, &info),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn test_cpu_wait_satisfied_by_signal() {
        let f = fixture();
        let created = f
            .registry
            .create_sync_object(
                &f.process,
                &SyncObjectCreateInfo::new(f.device, SyncObjectType::MonitoredFence),
            )
            .unwrap();
        let fence = created.sync_object;

        assert_eq!(
            f.registry.wait_sync_object_cpu(&f.process, &cpu_wait(f.device, fence, 1)),
            Err(Error::Timeout)
        );
        assert!(f.registry.host_events().is_empty());

        f.registry
            .signal_sync_object_cpu(&f.process, f.device, &[fence], &[1], SignalFlags::empty())
            .unwrap();
        f.registry
            .wait_sync_object_cpu(&f.process, &cpu_wait(f.device, fence, 1))
            .unwrap();
        assert_eq!(f.host.fence_value(f.process.sync_object(fence).unwrap().host_handle()), Some(1));
    }

    #[test]
    fn test_async_cpu_wait_signals_event() {
        let f = fixture();
        let fence = f
            .registry
            .create_sync_object(
                &f.process,
                &SyncObjectCreateInfo::new(f.device, SyncObjectType::MonitoredFence),
            )
            .unwrap()
            .sync_object;

        let event = CpuEvent::new();
        let info = CpuWaitInfo {
            event: Some(event.clone()),
            ..cpu_wait(f.device, fence, 5)
        };
        f.registry.wait_sync_object_cpu(&f.process, &info).unwrap();
        assert!(!event.try_wait());
        assert_eq!(f.registry.host_events().len(), 1);
        assert_eq!(f.host.pending_waits(), 1);

        f.registry
            .signal_sync_object_cpu(&f.process, f.device, &[fence], &[5], SignalFlags::empty())
            .unwrap();
        assert!(event.try_wait());
        assert!(f.registry.host_events().is_empty());
        assert_eq!(f.host.pending_waits(), 0);
    }

    #[test]
    fn test_cpu_notification_event() {
        let f = fixture();
        let event = CpuEvent::new();
        let info = SyncObjectCreateInfo {
            cpu_event: Some(event.clone()),
            ..SyncObjectCreateInfo::new(f.device, SyncObjectType::CpuNotification)
        };
        let created = f.registry.create_sync_object(&f.process, &info).unwrap();

        f.registry
            .signal_sync_object_cpu(
                &f.process,
                f.device,
                &[created.sync_object],
                &[0],
                SignalFlags::empty(),
            )
            .unwrap();
        assert!(event.try_wait());

        f.registry
            .destroy_sync_object(&f.process, created.sync_object)
            .unwrap();
        assert!(f.registry.host_events().is_empty());
    }

    #[test]
    fn test_signal_after_adapter_stop_fails() {
        let f = fixture();
        let fence = f
            .registry
            .create_sync_object(
                &f.process,
                &SyncObjectCreateInfo::new(f.device, SyncObjectType::Fence),
            )
            .unwrap()
            .sync_object;

        f.registry.remove_adapter(Luid::new(4, 0)).unwrap();
        let result =
            f.registry
                .signal_sync_object_cpu(&f.process, f.device, &[fence], &[1], SignalFlags::empty());
        assert!(matches!(
            result,
            Err(Error::DeviceStopped) | Err(Error::AdapterStopped)
        ));
    }
}
