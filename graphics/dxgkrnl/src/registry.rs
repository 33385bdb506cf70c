//! Global registry
//!
//! The [`Registry`] is the driver instance. It is constructed explicitly and
//! every entry point is a method on it.
//!
//! ```text
//! ┌──────────────────────────── Registry ────────────────────────────┐
//! │ processes        adapters          bindings (pid, adapter)       │
//! │ shared handles   descriptor grants host events   global channel  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Process-scoped operations live next to the objects they manage
//! (`device.rs`, `context.rs`, ...) as further `impl Registry` blocks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};

use crate::adapter::Adapter;
use crate::channel::{Channel, HostTransport};
use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::handle::HandleTable;
use crate::host_event::{HostEvent, HostEventList};
use crate::lock::{LockRank, OrderedMutex, OrderedRwLock};
use crate::process::{HandleObject, Process, ProcessAdapter};
use crate::protocol::{HostHandle, HostRequest, HostResponse, Luid};
use crate::shared::{DescriptorTable, SharedObject};

/// Driver instance
pub struct Registry {
    me: Weak<Registry>,
    config: DriverConfig,
    events: Arc<HostEventList>,
    channel: Arc<Channel>,
    processes: OrderedMutex<Vec<Arc<Process>>>,
    adapters: OrderedRwLock<Vec<Arc<Adapter>>>,
    bindings: OrderedMutex<BTreeMap<(u64, u64), Arc<ProcessAdapter>>>,
    pub(crate) shared_handles: HandleTable<SharedObject>,
    pub(crate) descriptors: OrderedMutex<DescriptorTable>,
    shutting_down: AtomicBool,
}

impl Registry {
    /// Create a registry whose global requests travel over `transport`
    pub fn new(config: DriverConfig, transport: Arc<dyn HostTransport>) -> Arc<Self> {
        let events = Arc::new(HostEventList::new());
        let channel = Channel::open("global", transport, events.clone(), config.request_timeout);

        info!("dxgkrnl registry created");

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            shared_handles: HandleTable::new(
                "shared",
                LockRank::GlobalHandleTable,
                config.global_handle_capacity,
            ),
            descriptors: OrderedMutex::new(
                LockRank::DescriptorTable,
                DescriptorTable::new(config.max_descriptors),
            ),
            config,
            events,
            channel,
            processes: OrderedMutex::new(LockRank::ProcessList, Vec::new()),
            adapters: OrderedRwLock::new(LockRank::AdapterList, Vec::new()),
            bindings: OrderedMutex::new(LockRank::ProcessAdapter, BTreeMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn host_events(&self) -> &Arc<HostEventList> {
        &self.events
    }

    /// Channel used for process registration and NT shared objects
    pub fn global_channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub(crate) fn weak(&self) -> Weak<Registry> {
        self.me.clone()
    }

    pub(crate) fn check_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            Err(Error::ShutdownInProgress)
        } else {
            Ok(())
        }
    }

    pub(crate) fn check_private_data(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.config.max_private_data_size {
            Err(Error::OutOfMemory)
        } else {
            Ok(())
        }
    }

    // Adapters

    /// Register an adapter announced by the host
    pub fn add_adapter(&self, luid: Luid, transport: Arc<dyn HostTransport>) -> Result<Arc<Adapter>> {
        self.check_running()?;

        let mut adapters = self.adapters.write();
        if adapters.iter().any(|a| a.luid() == luid) {
            return Err(Error::InvalidParameter);
        }

        let channel = Channel::open(
            format!("adapter {}", luid),
            transport,
            self.events.clone(),
            self.config.request_timeout,
        );
        let adapter = Adapter::new(luid, channel);
        adapters.push(adapter.clone());

        info!("adapter {} added", luid);
        Ok(adapter)
    }

    /// Host-initiated removal: stop the adapter and drop it from the list.
    /// Open handles keep working only as far as teardown goes.
    pub fn remove_adapter(&self, luid: Luid) -> Result<()> {
        let adapter = {
            let mut adapters = self.adapters.write();
            let index = adapters
                .iter()
                .position(|a| a.luid() == luid)
                .ok_or(Error::InvalidParameter)?;
            adapters.remove(index)
        };

        adapter.stop(self);
        adapter.release_reference();
        info!("adapter {} removed", luid);
        Ok(())
    }

    pub fn adapters(&self) -> Vec<Arc<Adapter>> {
        self.adapters.read().clone()
    }

    /// Stop every adapter, fail every pending host event, drop unredeemed
    /// descriptor grants and close the global channel. Processes may still
    /// be destroyed afterwards.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("dxgkrnl registry shutting down");

        let adapters = core::mem::take(&mut *self.adapters.write());
        for adapter in adapters {
            adapter.stop(self);
            adapter.release_reference();
        }

        let cancelled = self.events.cancel_all();
        if cancelled > 0 {
            debug!("cancelled {} host events at shutdown", cancelled);
        }

        // Grants release their host NT objects over the global channel, so
        // they go before it closes.
        let grants = self.descriptors.lock().drain();
        if !grants.is_empty() {
            debug!("closing {} descriptor grants at shutdown", grants.len());
        }
        for object in grants {
            object.nt_release();
            object.release_reference();
        }

        self.channel.close();
    }

    // Processes

    /// Register the caller `pid`, or take another reference on its existing
    /// process
    pub fn process_create(&self, pid: u32) -> Result<Arc<Process>> {
        self.check_running()?;

        let mut processes = self.processes.lock();
        if let Some(process) = processes
            .iter()
            .find(|p| p.pid() == pid && p.acquire_reference())
        {
            return Ok(process.clone());
        }

        let response = self
            .channel
            .send_request(HostHandle::NULL, HostRequest::CreateProcess { pid })?;
        let host = match response {
            HostResponse::Handle(host) => host,
            _ => return Err(Error::ChannelFailure),
        };

        let process = Process::new(pid, host, &self.config);
        processes.push(process.clone());

        debug!("pid {} registered as {}", pid, host);
        Ok(process)
    }

    /// Drop one reference to `process`; the last one tears down everything
    /// the process still owns. Teardown never fails.
    pub fn process_destroy(&self, process: &Arc<Process>) {
        if !process.release_reference() {
            return;
        }

        debug!("pid {} tearing down", process.pid());

        // Devices take their contexts, allocations and device sync objects
        // with them.
        for (_, _, object) in process.handles.entries() {
            if let HandleObject::Device(device) = object {
                device.destroy();
            }
        }

        for (_, _, object) in process.handles.entries() {
            match object {
                HandleObject::SyncObject(syncobj) => syncobj.destroy(false),
                HandleObject::Device(device) => device.destroy(),
                HandleObject::Context(context) => context.destroy(false),
                HandleObject::HwQueue(hwqueue) => hwqueue.destroy(false),
                HandleObject::Resource(resource) => resource.destroy(false),
                HandleObject::Allocation(allocation) => allocation.destroy(),
                HandleObject::PagingQueue(queue) => queue.destroy(false),
            }
        }

        for (handle, _, _) in process.adapter_handles.entries() {
            if let Err(err) = self.close_adapter(process, handle) {
                warn!("pid {}: close adapter {}: {}", process.pid(), handle, err);
            }
        }

        self.events.cancel_for_process(process.pid());

        if let Err(err) = self.channel.send_request(
            HostHandle::NULL,
            HostRequest::DestroyProcess {
                process: process.host_handle(),
            },
        ) {
            debug!("pid {}: host destroy process: {}", process.pid(), err);
        }

        self.processes
            .lock()
            .retain(|p| !Arc::ptr_eq(p, process));

        debug!("pid {} destroyed", process.pid());
    }

    pub fn process_count(&self) -> usize {
        self.processes.lock().len()
    }

    // Bindings

    /// Get or create the binding of `process` to `adapter` and take a
    /// reference on it
    pub(crate) fn open_binding(
        &self,
        process: &Arc<Process>,
        adapter: &Arc<Adapter>,
    ) -> Result<Arc<ProcessAdapter>> {
        let key = (process.id(), adapter.id());
        let mut bindings = self.bindings.lock();

        if let Some(binding) = bindings.get(&key) {
            if binding.acquire_reference() {
                return Ok(binding.clone());
            }
        }

        if !adapter.acquire_reference() {
            return Err(Error::AdapterStopped);
        }

        let binding = ProcessAdapter::new(process, adapter.clone(), self.weak());
        bindings.insert(key, binding.clone());
        debug!("pid {} bound to adapter {}", process.pid(), adapter.luid());
        Ok(binding)
    }

    /// Binding of `process` to `adapter`, without taking a reference
    pub fn find_binding(
        &self,
        process: &Arc<Process>,
        adapter: &Arc<Adapter>,
    ) -> Option<Arc<ProcessAdapter>> {
        self.bindings
            .lock()
            .get(&(process.id(), adapter.id()))
            .cloned()
    }

    /// Binding of `process` to `adapter` with a reference taken
    pub(crate) fn acquire_binding(
        &self,
        process: &Arc<Process>,
        adapter: &Arc<Adapter>,
    ) -> Result<Arc<ProcessAdapter>> {
        let bindings = self.bindings.lock();
        match bindings.get(&(process.id(), adapter.id())) {
            Some(binding) if binding.acquire_reference() => Ok(binding.clone()),
            _ => Err(Error::InvalidHandle),
        }
    }

    pub(crate) fn bindings_of_adapter(&self, adapter: &Arc<Adapter>) -> Vec<Arc<ProcessAdapter>> {
        self.bindings
            .lock()
            .values()
            .filter(|b| Arc::ptr_eq(b.adapter(), adapter))
            .cloned()
            .collect()
    }

    pub fn bindings_of_process(&self, process: &Arc<Process>) -> Vec<Arc<ProcessAdapter>> {
        let id = process.id();
        self.bindings
            .lock()
            .range((id, 0)..=(id, u64::MAX))
            .map(|(_, b)| b.clone())
            .collect()
    }

    pub(crate) fn unlink_binding(&self, binding: &Arc<ProcessAdapter>) {
        let mut bindings = self.bindings.lock();
        if let Some(current) = bindings.get(&binding.key()) {
            if Arc::ptr_eq(current, binding) {
                bindings.remove(&binding.key());
            }
        }
    }

    // Host events

    pub fn new_host_event_id(&self) -> u64 {
        self.events.new_event_id()
    }

    pub fn add_host_event(&self, event: HostEvent) -> Result<()> {
        self.check_running()?;
        self.events.add(event)
    }

    pub fn signal_host_event(&self, event_id: u64) -> bool {
        self.events.signal(event_id)
    }

    pub fn cancel_host_event(&self, event_id: u64) -> bool {
        self.events.cancel(event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackHost;

    fn registry() -> (Arc<LoopbackHost>, Arc<Registry>) {
        let host = LoopbackHost::new();
        let registry = Registry::new(DriverConfig::default(), host.clone());
        (host, registry)
    }

    #[test]
    fn test_process_create_reuses_pid() {
        let (_host, registry) = registry();
        let a = registry.process_create(42).unwrap();
        let b = registry.process_create(42).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.reference_count(), 2);
        assert_eq!(registry.process_count(), 1);

        registry.process_destroy(&a);
        assert_eq!(registry.process_count(), 1);
        registry.process_destroy(&b);
        assert_eq!(registry.process_count(), 0);
    }

    #[test]
    fn test_process_registered_with_host() {
        let (host, registry) = registry();
        let process = registry.process_create(7).unwrap();
        assert!(!process.host_handle().is_null());
        assert_eq!(host.live_processes(), 1);

        registry.process_destroy(&process);
        assert_eq!(host.live_processes(), 0);
    }

    #[test]
    fn test_duplicate_adapter_rejected() {
        let (_host, registry) = registry();
        let luid = Luid::new(1, 0);
        registry.add_adapter(luid, LoopbackHost::new()).unwrap();
        assert_eq!(
            registry.add_adapter(luid, LoopbackHost::new()).err(),
            Some(Error::InvalidParameter)
        );
        assert_eq!(registry.enumerate_adapters().len(), 1);
    }

    #[test]
    fn test_binding_shared_by_opens() {
        let (_host, registry) = registry();
        let luid = Luid::new(1, 0);
        let adapter = registry.add_adapter(luid, LoopbackHost::new()).unwrap();
        let process = registry.process_create(1).unwrap();

        let h1 = registry.open_adapter_from_luid(&process, luid).unwrap();
        let h2 = registry.open_adapter_from_luid(&process, luid).unwrap();
        assert_ne!(h1, h2);

        let bindings = registry.bindings_of_process(&process);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].reference_count(), 2);
        assert!(Arc::ptr_eq(
            &registry.find_binding(&process, &adapter).unwrap(),
            &bindings[0]
        ));
        assert!(Arc::ptr_eq(&process.adapter(h1).unwrap(), &adapter));

        registry.close_adapter(&process, h1).unwrap();
        assert_eq!(registry.bindings_of_process(&process).len(), 1);
        registry.close_adapter(&process, h2).unwrap();
        assert!(registry.bindings_of_process(&process).is_empty());
        assert_eq!(adapter.reference_count(), 1);
        assert_eq!(
            registry.close_adapter(&process, h2),
            Err(Error::InvalidHandle)
        );
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let (_host, registry) = registry();
        registry.shutdown();
        assert_eq!(
            registry.process_create(1).err(),
            Some(Error::ShutdownInProgress)
        );
        assert!(registry.global_channel().is_closed());
    }
}
