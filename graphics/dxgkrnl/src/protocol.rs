//! Host protocol definitions
//!
//! This module defines the messages exchanged with the host over an adapter
//! channel. The byte layout of the transport is owned by the transport; this
//! crate only deals in typed packets.
//!
//! ```text
//!   guest                                   host
//!     │  GuestPacket { header(request_id), request }
//!     │ ──────────────────────────────────────► │
//!     │                                         │
//!     │  HostPacket::Completion { request_id }  │
//!     │ ◄────────────────────────────────────── │
//!     │  HostPacket::SignalEvent { event_id }   │
//!     │ ◄────────────────────────────────────── │
//! ```
//!
//! Private driver data blobs travel as opaque `Vec<u8>` and are never
//! interpreted on the guest side.

use core::fmt;

use bitflags::bitflags;

/// Status code returned by the host for every request
///
/// Negative values are failures, as with NTSTATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostStatus(pub i32);

impl HostStatus {
    pub const SUCCESS: Self = Self(0);
    pub const PENDING: Self = Self(0x0000_0103);
    pub const UNSUCCESSFUL: Self = Self(0xC000_0001_u32 as i32);
    pub const INVALID_PARAMETER: Self = Self(0xC000_000D_u32 as i32);
    pub const NO_MEMORY: Self = Self(0xC000_0017_u32 as i32);
    pub const NOT_SUPPORTED: Self = Self(0xC000_00BB_u32 as i32);
    pub const INVALID_HANDLE: Self = Self(0xC000_0008_u32 as i32);
    pub const DEVICE_REMOVED: Self = Self(0xC000_02B6_u32 as i32);
    pub const GRAPHICS_ALLOCATION_BUSY: Self = Self(0xC01E_0102_u32 as i32);

    pub fn is_success(self) -> bool {
        self.0 >= 0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::SUCCESS => "STATUS_SUCCESS",
            Self::PENDING => "STATUS_PENDING",
            Self::UNSUCCESSFUL => "STATUS_UNSUCCESSFUL",
            Self::INVALID_PARAMETER => "STATUS_INVALID_PARAMETER",
            Self::NO_MEMORY => "STATUS_NO_MEMORY",
            Self::NOT_SUPPORTED => "STATUS_NOT_SUPPORTED",
            Self::INVALID_HANDLE => "STATUS_INVALID_HANDLE",
            Self::DEVICE_REMOVED => "STATUS_DEVICE_REMOVED",
            Self::GRAPHICS_ALLOCATION_BUSY => "STATUS_GRAPHICS_ALLOCATION_BUSY",
            _ => return None,
        })
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:08x})", name, self.0 as u32),
            None => write!(f, "0x{:08x}", self.0 as u32),
        }
    }
}

/// Handle of an object in the host's namespace
///
/// Host handles are opaque to the guest and are never exposed as local
/// handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HostHandle(pub u32);

impl HostHandle {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host:{:#x}", self.0)
    }
}

/// Locally unique identifier of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Luid {
    pub low: u32,
    pub high: i32,
}

impl Luid {
    pub const fn new(low: u32, high: i32) -> Self {
        Self { low, high }
    }
}

impl fmt::Display for Luid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:08x}", self.high as u32, self.low)
    }
}

/// Host command types
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandType {
    // Global commands
    CreateProcess = 0x0001,
    DestroyProcess,
    QueryAdapterInfo,
    CreateNtSharedObject,
    DestroyNtSharedObject,

    // Device commands
    CreateDevice = 0x0100,
    DestroyDevice,
    CreatePagingQueue,
    DestroyPagingQueue,

    // Execution commands
    CreateContext = 0x0200,
    DestroyContext,
    CreateHwQueue,
    DestroyHwQueue,
    SubmitCommand,
    SubmitCommandToHwQueue,

    // Memory commands
    CreateAllocation = 0x0300,
    DestroyAllocation,
    Lock2,
    Unlock2,
    OpenResource,

    // Synchronization commands
    CreateSyncObject = 0x0400,
    DestroySyncObject,
    OpenSyncObject,
    SignalSyncObject,
    WaitForSyncObjectFromCpu,
    WaitForSyncObjectFromGpu,
}

bitflags! {
    /// Device creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFlags: u32 {
        const LEGACY_MODE = 1 << 0;
        const REQUEST_VSYNC = 1 << 1;
        const DISABLE_GPU_TIMEOUT = 1 << 2;
        const GDI_DEVICE = 1 << 3;
    }
}

bitflags! {
    /// Context creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContextFlags: u32 {
        const NULL_RENDERING = 1 << 0;
        const INITIAL_DATA = 1 << 1;
        const DISABLE_GPU_TIMEOUT = 1 << 2;
        const SYNCHRONIZATION_ONLY = 1 << 3;
        const HWQUEUE_SUPPORTED = 1 << 4;
    }
}

bitflags! {
    /// Allocation creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocationFlags: u32 {
        /// Group the allocations under a new resource
        const CREATE_RESOURCE = 1 << 0;
        /// Create a shared anchor for the resource
        const CREATE_SHARED = 1 << 1;
        /// Share through descriptors instead of the global handle table
        const NT_SECURITY_SHARING = 1 << 2;
        const EXISTING_SYSMEM = 1 << 3;
        const READ_ONLY = 1 << 4;
    }
}

bitflags! {
    /// Sync object creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SyncObjectFlags: u32 {
        /// Create a shared anchor for the sync object
        const SHARED = 1 << 0;
        /// Share through descriptors instead of the global handle table
        const NT_SECURITY_SHARING = 1 << 1;
        const CROSS_ADAPTER = 1 << 2;
        const TOP_OF_PIPELINE = 1 << 3;
        const NO_SIGNAL = 1 << 4;
        const NO_WAIT = 1 << 5;
        const NO_SIGNAL_MAX_VALUE_ON_TDR = 1 << 6;
        const NO_GPU_ACCESS = 1 << 7;
    }
}

bitflags! {
    /// Signal/wait flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SignalFlags: u32 {
        const SIGNAL_AT_SUBMISSION = 1 << 0;
        const ENQUEUE_CPU_EVENT = 1 << 1;
        const ALLOW_FENCE_REWIND = 1 << 2;
        const WAIT_ANY = 1 << 3;
    }
}

/// Sync object types
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SyncObjectType {
    Mutex = 1,
    Semaphore,
    Fence,
    CpuNotification,
    MonitoredFence,
    PeriodicMonitoredFence,
}

impl SyncObjectType {
    /// Device-type sync objects live on a device, the rest on the adapter
    pub fn is_device_type(self) -> bool {
        matches!(
            self,
            SyncObjectType::MonitoredFence | SyncObjectType::PeriodicMonitoredFence
        )
    }

    /// Whether the object carries a fence value the CPU can wait on
    pub fn is_monitored(self) -> bool {
        self.is_device_type()
    }
}

/// Description of one allocation in a create request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationDesc {
    /// Driver private data, opaque to the guest
    pub private_data: Vec<u8>,
    /// Size in pages
    pub page_count: u64,
}

/// Guest to host request payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRequest {
    CreateProcess {
        pid: u32,
    },
    DestroyProcess {
        process: HostHandle,
    },
    QueryAdapterInfo {
        query_type: u32,
        private_data: Vec<u8>,
    },
    CreateNtSharedObject {
        object: HostHandle,
    },
    DestroyNtSharedObject {
        shared: HostHandle,
    },
    CreateDevice {
        flags: DeviceFlags,
    },
    DestroyDevice {
        device: HostHandle,
    },
    CreatePagingQueue {
        device: HostHandle,
        priority: i32,
    },
    DestroyPagingQueue {
        paging_queue: HostHandle,
    },
    CreateContext {
        device: HostHandle,
        node_ordinal: u32,
        engine_affinity: u32,
        flags: ContextFlags,
        private_data: Vec<u8>,
    },
    DestroyContext {
        context: HostHandle,
    },
    CreateHwQueue {
        context: HostHandle,
        flags: u32,
        private_data: Vec<u8>,
    },
    DestroyHwQueue {
        hwqueue: HostHandle,
    },
    SubmitCommand {
        context: HostHandle,
        command_buffer: u64,
        length: u32,
        present_history_token: u32,
        private_data: Vec<u8>,
    },
    SubmitCommandToHwQueue {
        hwqueue: HostHandle,
        hwqueue_progress_fence: u64,
        command_buffer: u64,
        length: u32,
        private_data: Vec<u8>,
    },
    CreateAllocation {
        device: HostHandle,
        flags: AllocationFlags,
        /// Existing host resource the allocations are added to, or null
        resource: HostHandle,
        allocations: Vec<AllocationDesc>,
        resource_private_data: Vec<u8>,
        runtime_private_data: Vec<u8>,
    },
    DestroyAllocation {
        device: HostHandle,
        resource: HostHandle,
        allocations: Vec<HostHandle>,
    },
    Lock2 {
        device: HostHandle,
        allocation: HostHandle,
    },
    Unlock2 {
        device: HostHandle,
        allocation: HostHandle,
    },
    OpenResource {
        device: HostHandle,
        /// Host shared handle of the anchor
        shared: HostHandle,
        allocation_count: u32,
    },
    CreateSyncObject {
        device: HostHandle,
        sync_type: SyncObjectType,
        flags: SyncObjectFlags,
        initial_value: u64,
        /// Host event signalled for CPU notifications, or 0
        cpu_event_id: u64,
    },
    DestroySyncObject {
        sync_object: HostHandle,
    },
    OpenSyncObject {
        device: HostHandle,
        shared: HostHandle,
        flags: SyncObjectFlags,
    },
    SignalSyncObject {
        device: HostHandle,
        flags: SignalFlags,
        /// Contexts doing the signal; empty for a CPU signal
        contexts: Vec<HostHandle>,
        objects: Vec<HostHandle>,
        fence_values: Vec<u64>,
        /// Host event to signal when done, or 0
        cpu_event_id: u64,
    },
    WaitForSyncObjectFromCpu {
        device: HostHandle,
        flags: SignalFlags,
        objects: Vec<HostHandle>,
        fence_values: Vec<u64>,
        /// Host event signalled when the wait is satisfied
        event_id: u64,
    },
    WaitForSyncObjectFromGpu {
        context: HostHandle,
        objects: Vec<HostHandle>,
        fence_values: Vec<u64>,
    },
}

impl HostRequest {
    pub fn command_type(&self) -> CommandType {
        match self {
            HostRequest::CreateProcess { .. } => CommandType::CreateProcess,
            HostRequest::DestroyProcess { .. } => CommandType::DestroyProcess,
            HostRequest::QueryAdapterInfo { .. } => CommandType::QueryAdapterInfo,
            HostRequest::CreateNtSharedObject { .. } => CommandType::CreateNtSharedObject,
            HostRequest::DestroyNtSharedObject { .. } => CommandType::DestroyNtSharedObject,
            HostRequest::CreateDevice { .. } => CommandType::CreateDevice,
            HostRequest::DestroyDevice { .. } => CommandType::DestroyDevice,
            HostRequest::CreatePagingQueue { .. } => CommandType::CreatePagingQueue,
            HostRequest::DestroyPagingQueue { .. } => CommandType::DestroyPagingQueue,
            HostRequest::CreateContext { .. } => CommandType::CreateContext,
            HostRequest::DestroyContext { .. } => CommandType::DestroyContext,
            HostRequest::CreateHwQueue { .. } => CommandType::CreateHwQueue,
            HostRequest::DestroyHwQueue { .. } => CommandType::DestroyHwQueue,
            HostRequest::SubmitCommand { .. } => CommandType::SubmitCommand,
            HostRequest::SubmitCommandToHwQueue { .. } => CommandType::SubmitCommandToHwQueue,
            HostRequest::CreateAllocation { .. } => CommandType::CreateAllocation,
            HostRequest::DestroyAllocation { .. } => CommandType::DestroyAllocation,
            HostRequest::Lock2 { .. } => CommandType::Lock2,
            HostRequest::Unlock2 { .. } => CommandType::Unlock2,
            HostRequest::OpenResource { .. } => CommandType::OpenResource,
            HostRequest::CreateSyncObject { .. } => CommandType::CreateSyncObject,
            HostRequest::DestroySyncObject { .. } => CommandType::DestroySyncObject,
            HostRequest::OpenSyncObject { .. } => CommandType::OpenSyncObject,
            HostRequest::SignalSyncObject { .. } => CommandType::SignalSyncObject,
            HostRequest::WaitForSyncObjectFromCpu { .. } => CommandType::WaitForSyncObjectFromCpu,
            HostRequest::WaitForSyncObjectFromGpu { .. } => CommandType::WaitForSyncObjectFromGpu,
        }
    }
}

/// Host to guest response payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostResponse {
    /// No payload
    Empty,
    /// A single newly created host object
    Handle(HostHandle),
    /// Hardware queue with its progress fence
    HwQueue {
        hwqueue: HostHandle,
        progress_fence: HostHandle,
        fence_address: u64,
    },
    /// Paging queue with its backing sync object
    PagingQueue {
        paging_queue: HostHandle,
        sync_object: HostHandle,
        fence_address: u64,
    },
    /// Created allocations, in request order
    Allocations {
        resource: HostHandle,
        allocations: Vec<HostHandle>,
    },
    /// Sync object with its monitored fence mapping, 0 if none
    SyncObject {
        sync_object: HostHandle,
        fence_address: u64,
    },
    /// CPU visible address of a locked allocation
    Lock { address: u64 },
    /// Opaque data returned by a query
    Data(Vec<u8>),
}

/// Header common to every guest packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Correlates the completion with this request
    pub request_id: u64,
    pub command_type: CommandType,
    /// Host handle of the calling process, null for global commands
    pub process: HostHandle,
}

/// Guest to host packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestPacket {
    pub header: PacketHeader,
    pub request: HostRequest,
}

impl GuestPacket {
    pub fn new(request_id: u64, process: HostHandle, request: HostRequest) -> Self {
        Self {
            header: PacketHeader {
                request_id,
                command_type: request.command_type(),
                process,
            },
            request,
        }
    }
}

/// Host to guest packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPacket {
    /// Completion of the guest request with the same id
    Completion {
        request_id: u64,
        status: HostStatus,
        response: HostResponse,
    },
    /// Asynchronous signal of a registered host event
    SignalEvent { event_id: u64 },
}
