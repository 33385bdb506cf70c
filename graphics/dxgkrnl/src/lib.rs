//! Guest-side control plane for a paravirtualized GPU
//!
//! This crate implements the object model behind the D3D kernel thunks of a
//! guest running on a host GPU: processes, adapters, devices, contexts,
//! hardware queues, allocations, resources, sync objects and their shared
//! forms. It owns no GPU memory and executes no GPU work; every
//! state-changing operation is forwarded to the host over a [`Channel`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │   Kernel thunks     │  (ioctl layer, out of tree)
//! └──────────┬──────────┘
//!            │ process, handle
//! ┌──────────▼──────────┐
//! │      Registry       │◄─── This crate
//! │ processes, adapters │
//! │ shared handles, fds │
//! └──────────┬──────────┘
//!            │ typed requests
//! ┌──────────▼──────────┐
//! │      Channels       │
//! │ (global, adapter)   │
//! └──────────┬──────────┘
//!            │ HostTransport
//! ┌──────────▼──────────┐
//! │   Host dxgkrnl      │
//! └─────────────────────┘
//! ```
//!
//! Object ownership follows the host's:
//!
//! ```text
//! Process ─ ProcessAdapter ─ Device ┬ Context ─ HwQueue
//!                                   ├ PagingQueue
//!                                   ├ Resource ─ Allocation
//!                                   ├ Allocation
//!                                   └ SyncObject (monitored fences)
//! Adapter ┬ SyncObject (other types)
//!         └ SharedResource / SharedSyncObject anchors
//! ```
//!
//! Locks are ranked (see [`lock::LockRank`]) and always taken in ascending
//! rank order. Objects carry a logical reference count separate from their
//! `Arc`; the final release frees the handle and releases the parent.
//!
//! # Usage
//!
//! With the `loopback` feature, a registry can run against the in-process
//! host model:
//!
//! ```ignore
//! use dxgkrnl::{DriverConfig, LoopbackHost, Luid, Registry};
//!
//! let host = LoopbackHost::new();
//! let registry = Registry::new(DriverConfig::from_env(), host.endpoint());
//! registry.add_adapter(Luid::new(1, 0), host.endpoint())?;
//!
//! let process = registry.process_create(42)?;
//! let adapter = registry.open_adapter_from_luid(&process, Luid::new(1, 0))?;
//! let device = registry.create_device(&process, adapter, Default::default())?;
//! ```

pub mod adapter;
pub mod allocation;
pub mod channel;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod handle;
pub mod host_event;
pub mod lock;
/// In-process host model for tests.
///
/// Only built for this crate's own tests or with the `loopback` feature; it
/// is not part of the driver API.
#[cfg(any(test, feature = "loopback"))]
pub mod loopback;
pub mod process;
pub mod protocol;
pub mod refcount;
pub mod registry;
pub mod shared;
pub mod syncobj;

pub use adapter::{Adapter, AdapterInfo, AdapterState};
pub use allocation::{
    Allocation, AllocationCreateInfo, CreatedAllocations, OpenedResource, Resource,
};
pub use channel::{Channel, HostTransport, ReceiveCallback};
pub use config::DriverConfig;
pub use context::{
    CommandSubmission, Context, ContextCreateInfo, HwQueue, HwQueueCreateInfo, HwQueueInfo,
    HwQueueSubmission,
};
pub use device::{Device, PagingQueue, PagingQueueInfo};
pub use error::{Error, Result};
pub use handle::{Handle, HandleType};
pub use host_event::{Completion, CpuEvent};
#[cfg(any(test, feature = "loopback"))]
pub use loopback::{LoopbackEndpoint, LoopbackHost};
pub use process::{HandleObject, Process, ProcessAdapter};
pub use protocol::{
    AllocationDesc, AllocationFlags, ContextFlags, DeviceFlags, HostHandle, HostStatus, Luid,
    SignalFlags, SyncObjectFlags, SyncObjectType,
};
pub use refcount::ObjectState;
pub use registry::Registry;
pub use shared::{Descriptor, ResourceInfo, SharedResource, SharedResourceData, SharedSyncObject};
pub use syncobj::{CpuWaitInfo, CreatedSyncObject, SignalInfo, SyncObject, SyncObjectCreateInfo};
