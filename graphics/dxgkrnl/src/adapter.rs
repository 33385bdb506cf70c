//! Adapters
//!
//! An [`Adapter`] is one virtual GPU endpoint. It owns the channel its
//! requests travel on and the adapter-scoped shared anchors and sync objects.
//! Processes reach it through a [`ProcessAdapter`](crate::process::ProcessAdapter)
//! binding.
//!
//! ```text
//!            Registry
//!               │ adapters
//!          ┌────▼────┐   channel   ┌──────────┐
//!          │ Adapter │────────────►│   Host   │
//!          └────┬────┘             └──────────┘
//!    bindings   │   shared anchors, adapter syncobjs
//!  ┌────────────┼──────────────┐
//!  ▼            ▼              ▼
//! ProcessAdapter (pid 1)   ProcessAdapter (pid 2)
//!  │ devices                   │ devices
//!  ▼                           ▼
//! Device ...                  Device ...
//! ```
//!
//! The adapter state machine is `Active -> Stopped`, terminal. Operations
//! that need the adapter hold its core lock shared while they test the state
//! and use the adapter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleType};
use crate::lock::{LockRank, OrderedMutex, OrderedReadGuard, OrderedRwLock};
use crate::process::Process;
use crate::protocol::{HostRequest, HostResponse, Luid};
use crate::refcount::RefCount;
use crate::registry::Registry;
use crate::shared::{SharedResource, SharedSyncObject};
use crate::syncobj::SyncObject;

static NEXT_ADAPTER_ID: AtomicU64 = AtomicU64::new(1);

/// Adapter state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Active,
    Stopped,
}

/// Adapter state guarded by the core lock
#[derive(Debug)]
pub struct AdapterCore {
    pub state: AdapterState,
}

/// Adapter-scoped object lists
#[derive(Default)]
pub(crate) struct AdapterShared {
    pub shared_resources: Vec<Weak<SharedResource>>,
    pub shared_syncobjs: Vec<Weak<SharedSyncObject>>,
    /// Sync objects that are not device-type
    pub syncobjs: Vec<Arc<SyncObject>>,
}

/// Adapter description returned by enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterInfo {
    pub luid: Luid,
    pub state: AdapterState,
}

/// One virtual GPU endpoint
pub struct Adapter {
    id: u64,
    luid: Luid,
    refcount: RefCount,
    core: OrderedRwLock<AdapterCore>,
    channel: Arc<Channel>,
    pub(crate) shared: OrderedMutex<AdapterShared>,
}

impl Adapter {
    pub(crate) fn new(luid: Luid, channel: Arc<Channel>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ADAPTER_ID.fetch_add(1, Ordering::Relaxed),
            luid,
            refcount: RefCount::new(),
            core: OrderedRwLock::new(
                LockRank::AdapterCore,
                AdapterCore {
                    state: AdapterState::Active,
                },
            ),
            channel,
            shared: OrderedMutex::new(LockRank::AdapterShared, AdapterShared::default()),
        })
    }

    /// Registry-unique adapter id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn luid(&self) -> Luid {
        self.luid
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn state(&self) -> AdapterState {
        self.core.read().state
    }

    pub fn info(&self) -> AdapterInfo {
        AdapterInfo {
            luid: self.luid,
            state: self.state(),
        }
    }

    /// Take the core lock shared and check the adapter is active
    pub(crate) fn lock_active(&self) -> Result<OrderedReadGuard<'_, AdapterCore>> {
        let core = self.core.read();
        if core.state != AdapterState::Active {
            return Err(Error::AdapterStopped);
        }
        Ok(core)
    }

    pub fn acquire_reference(&self) -> bool {
        self.refcount.acquire()
    }

    pub fn release_reference(self: &Arc<Self>) {
        if self.refcount.release() {
            debug!("adapter {} released", self.luid);
        }
    }

    pub fn reference_count(&self) -> u32 {
        self.refcount.count()
    }

    /// Stop the adapter: the channel closes and every bound device and
    /// adapter sync object stops. Idempotent.
    pub(crate) fn stop(self: &Arc<Self>, registry: &Registry) {
        // Requests in flight hold the core lock shared until the host
        // answers; failing them first lets the write lock through.
        self.channel.close();

        {
            let mut core = self.core.write();
            if core.state == AdapterState::Stopped {
                return;
            }
            core.state = AdapterState::Stopped;
        }

        info!("adapter {} stopping", self.luid);

        for binding in registry.bindings_of_adapter(self) {
            for device in binding.devices() {
                device.stop();
            }
        }

        let syncobjs: Vec<Arc<SyncObject>> = self.shared.lock().syncobjs.clone();
        for syncobj in syncobjs {
            syncobj.stop();
        }
    }

    pub(crate) fn detach_syncobj(&self, syncobj: &Arc<SyncObject>) {
        self.shared
            .lock()
            .syncobjs
            .retain(|s| !Arc::ptr_eq(s, syncobj));
    }

    /// Shared anchors still registered on this adapter
    pub fn shared_object_count(&self) -> usize {
        let shared = self.shared.lock();
        shared
            .shared_resources
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
            + shared
                .shared_syncobjs
                .iter()
                .filter(|w| w.strong_count() > 0)
                .count()
    }
}

impl Registry {
    /// List every adapter known to the registry
    pub fn enumerate_adapters(&self) -> Vec<AdapterInfo> {
        self.adapters().iter().map(|a| a.info()).collect()
    }

    /// Open the adapter with `luid` for `process` and return a private
    /// adapter handle
    pub fn open_adapter_from_luid(&self, process: &Arc<Process>, luid: Luid) -> Result<Handle> {
        self.check_running()?;
        process.check_alive()?;

        let adapter = self
            .adapters()
            .into_iter()
            .find(|a| a.luid() == luid)
            .ok_or(Error::InvalidParameter)?;

        if adapter.state() != AdapterState::Active {
            return Err(Error::AdapterStopped);
        }

        let binding = self.open_binding(process, &adapter)?;

        match process.adapter_handles.allocate(adapter.clone(), HandleType::Adapter) {
            Ok(handle) => {
                debug!("pid {} opened adapter {} as {}", process.pid(), luid, handle);
                Ok(handle)
            }
            Err(err) => {
                binding.release_reference();
                Err(err)
            }
        }
    }

    /// Close an adapter handle returned by [`Registry::open_adapter_from_luid`]
    pub fn close_adapter(&self, process: &Arc<Process>, handle: Handle) -> Result<()> {
        let adapter = process.adapter(handle)?;
        let binding = self
            .find_binding(process, &adapter)
            .ok_or(Error::InvalidHandle)?;

        if process.adapter_handles.free(handle).is_none() {
            return Err(Error::InvalidHandle);
        }

        debug!("pid {} closed adapter {}", process.pid(), adapter.luid());
        binding.release_reference();
        Ok(())
    }

    /// Pass an adapter query through to the host
    pub fn query_adapter_info(
        &self,
        process: &Arc<Process>,
        handle: Handle,
        query_type: u32,
        private_data: &[u8],
    ) -> Result<Vec<u8>> {
        self.check_private_data(private_data)?;
        let adapter = process.adapter(handle)?;
        let _core = adapter.lock_active()?;

        let response = adapter.channel().send_request(
            process.host_handle(),
            HostRequest::QueryAdapterInfo {
                query_type,
                private_data: private_data.to_vec(),
            },
        )?;

        match response {
            HostResponse::Data(data) => Ok(data),
            HostResponse::Empty => Ok(Vec::new()),
            _ => Err(Error::ChannelFailure),
        }
    }
}
