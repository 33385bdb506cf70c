//! Contexts and hardware queues
//!
//! A [`Context`] is a submission context on a device; a [`HwQueue`] is a
//! hardware queue on a context. Each hardware queue carries a progress fence
//! that is exposed through a second handle of type `MonitoredFence`.
//!
//! Destruction is bottom-up: a context takes its hardware queues down before
//! it detaches from the device and drops its handle reference.

use std::sync::{Arc, OnceLock, Weak};

use log::debug;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleType};
use crate::lock::{LockRank, OrderedMutex, OrderedRwLock};
use crate::process::{HandleObject, Process};
use crate::protocol::{ContextFlags, HostHandle, HostRequest, HostResponse};
use crate::refcount::{ObjectState, RefCount};
use crate::registry::Registry;

/// Parameters of [`Registry::create_context`]
#[derive(Debug, Clone, Default)]
pub struct ContextCreateInfo {
    pub node_ordinal: u32,
    pub engine_affinity: u32,
    pub flags: ContextFlags,
    /// Driver private data, passed through to the host
    pub private_data: Vec<u8>,
}

/// Parameters of [`Registry::create_hwqueue`]
#[derive(Debug, Clone, Default)]
pub struct HwQueueCreateInfo {
    pub flags: u32,
    pub private_data: Vec<u8>,
}

/// Result of [`Registry::create_hwqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwQueueInfo {
    pub hwqueue: Handle,
    /// Monitored fence handle of the progress fence
    pub progress_fence: Handle,
    pub fence_address: u64,
}

/// Command buffer submission to a context
#[derive(Debug, Clone, Default)]
pub struct CommandSubmission {
    pub command_buffer: u64,
    pub length: u32,
    pub present_history_token: u32,
    pub private_data: Vec<u8>,
}

/// Command buffer submission to a hardware queue
#[derive(Debug, Clone, Default)]
pub struct HwQueueSubmission {
    pub command_buffer: u64,
    pub length: u32,
    /// Value the progress fence reaches when the buffer completes
    pub progress_fence_value: u64,
    pub private_data: Vec<u8>,
}

struct ContextInner {
    state: ObjectState,
    hwqueues: Vec<Arc<HwQueue>>,
}

/// Submission context
pub struct Context {
    handle: OnceLock<Handle>,
    host: HostHandle,
    flags: ContextFlags,
    device: Weak<Device>,
    process: Weak<Process>,
    refcount: RefCount,
    inner: OrderedRwLock<ContextInner>,
}

impl Context {
    pub fn handle(&self) -> Option<Handle> {
        self.handle.get().copied()
    }

    pub fn host_handle(&self) -> HostHandle {
        self.host
    }

    pub fn flags(&self) -> ContextFlags {
        self.flags
    }

    pub fn state(&self) -> ObjectState {
        self.inner.read().state
    }

    pub(crate) fn device(&self) -> Result<Arc<Device>> {
        self.device.upgrade().ok_or(Error::ObjectDestroyed)
    }

    pub fn hwqueue_count(&self) -> usize {
        self.inner.read().hwqueues.len()
    }

    /// Fail unless the context is active. Call with the device locked.
    pub(crate) fn check_active(&self) -> Result<()> {
        if self.inner.read().state.is_active() {
            Ok(())
        } else {
            Err(Error::ObjectDestroyed)
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
        debug!("context {} released", self.host);
        if let Some(device) = self.device.upgrade() {
            device.release_reference();
        }
    }

    pub fn reference_count(&self) -> u32 {
        self.refcount.count()
    }

    fn remove_hwqueue(&self, hwqueue: &Arc<HwQueue>) {
        self.inner
            .write()
            .hwqueues
            .retain(|q| !Arc::ptr_eq(q, hwqueue));
    }

    /// Destroy the context and its hardware queues. `parent_teardown` is set
    /// when the device is being destroyed: the host drops the context with
    /// the device and the device list is already drained.
    pub(crate) fn destroy(self: &Arc<Self>, parent_teardown: bool) {
        let hwqueues = {
            let mut inner = self.inner.write();
            if !inner.state.mark_destroyed() {
                return;
            }
            core::mem::take(&mut inner.hwqueues)
        };

        for hwqueue in hwqueues {
            hwqueue.destroy(true);
        }

        if !parent_teardown {
            if let Some(device) = self.device.upgrade() {
                if let Err(err) = device.send(HostRequest::DestroyContext { context: self.host }) {
                    debug!("context {}: host destroy: {}", self.host, err);
                }
                device.remove_context(self);
            }
        }

        if let Some(process) = self.process.upgrade() {
            process.mark_handle_destroyed(self.handle());
        }
        self.release_reference();
    }
}

/// Hardware queue
pub struct HwQueue {
    handle: OnceLock<Handle>,
    fence_handle: OnceLock<Handle>,
    host: HostHandle,
    progress_fence: HostHandle,
    fence_address: u64,
    context: Weak<Context>,
    process: Weak<Process>,
    refcount: RefCount,
    state: OrderedMutex<ObjectState>,
}

impl HwQueue {
    pub fn handle(&self) -> Option<Handle> {
        self.handle.get().copied()
    }

    pub fn progress_fence_handle(&self) -> Option<Handle> {
        self.fence_handle.get().copied()
    }

    pub fn host_handle(&self) -> HostHandle {
        self.host
    }

    /// Host sync object backing the progress fence
    pub fn host_progress_fence(&self) -> HostHandle {
        self.progress_fence
    }

    pub fn fence_address(&self) -> u64 {
        self.fence_address
    }

    pub fn state(&self) -> ObjectState {
        *self.state.lock()
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
            process.free_handle(self.progress_fence_handle());
        }
        if let Some(context) = self.context.upgrade() {
            context.release_reference();
        }
    }

    pub fn reference_count(&self) -> u32 {
        self.refcount.count()
    }

    pub(crate) fn destroy(self: &Arc<Self>, parent_teardown: bool) {
        if !self.state.lock().mark_destroyed() {
            return;
        }

        if !parent_teardown {
            if let Some(context) = self.context.upgrade() {
                if let Ok(device) = context.device() {
                    if let Err(err) = device.send(HostRequest::DestroyHwQueue { hwqueue: self.host }) {
                        debug!("hwqueue {}: host destroy: {}", self.host, err);
                    }
                }
                context.remove_hwqueue(self);
            }
        }

        if let Some(process) = self.process.upgrade() {
            process.mark_handle_destroyed(self.handle());
            process.mark_handle_destroyed(self.progress_fence_handle());
        }
        self.release_reference();
    }
}

impl Registry {
    /// Create a context on a device
    pub fn create_context(
        &self,
        process: &Arc<Process>,
        device_handle: Handle,
        info: &ContextCreateInfo,
    ) -> Result<Handle> {
        self.check_private_data(&info.private_data)?;
        let device = process.device(device_handle)?;
        let active = device.lock_active()?;

        let host = match device.send(HostRequest::CreateContext {
            device: device.host_handle(),
            node_ordinal: info.node_ordinal,
            engine_affinity: info.engine_affinity,
            flags: info.flags,
            private_data: info.private_data.clone(),
        })? {
            HostResponse::Handle(host) => host,
            _ => return Err(Error::ChannelFailure),
        };

        let host_destroy = || {
            let _ = device.send(HostRequest::DestroyContext { context: host });
        };

        if !device.acquire_reference() {
            host_destroy();
            return Err(Error::DeviceStopped);
        }

        let context = Arc::new(Context {
            handle: OnceLock::new(),
            host,
            flags: info.flags,
            device: Arc::downgrade(&device),
            process: Arc::downgrade(process),
            refcount: RefCount::new(),
            inner: OrderedRwLock::new(
                LockRank::Context,
                ContextInner {
                    state: ObjectState::Created,
                    hwqueues: Vec::new(),
                },
            ),
        });

        let handle = match process
            .handles
            .allocate(HandleObject::Context(context.clone()), HandleType::Context)
        {
            Ok(handle) => handle,
            Err(err) => {
                host_destroy();
                drop(active);
                device.release_reference();
                return Err(err);
            }
        };
        let _ = context.handle.set(handle);

        device.add_context(context.clone());
        if !context.inner.write().state.activate() {
            device.remove_context(&context);
        }

        debug!("device {} created context {} ({})", device.host_handle(), handle, host);
        Ok(handle)
    }

    pub fn destroy_context(&self, process: &Arc<Process>, handle: Handle) -> Result<()> {
        let context = process.context(handle)?;
        context.destroy(false);
        Ok(())
    }

    /// Create a hardware queue on a context
    pub fn create_hwqueue(
        &self,
        process: &Arc<Process>,
        context_handle: Handle,
        info: &HwQueueCreateInfo,
    ) -> Result<HwQueueInfo> {
        self.check_private_data(&info.private_data)?;
        let context = process.context(context_handle)?;
        let device = context.device()?;
        let active = device.lock_active()?;

        // Held across the host request so a concurrent destroy cannot miss
        // the new queue.
        let mut inner = context.inner.write();
        if !inner.state.is_active() {
            return Err(Error::ObjectDestroyed);
        }

        let (host, progress_fence, fence_address) = match device.send(HostRequest::CreateHwQueue {
            context: context.host,
            flags: info.flags,
            private_data: info.private_data.clone(),
        })? {
            HostResponse::HwQueue {
                hwqueue,
                progress_fence,
                fence_address,
            } => (hwqueue, progress_fence, fence_address),
            _ => return Err(Error::ChannelFailure),
        };

        if !context.acquire_reference() {
            let _ = device.send(HostRequest::DestroyHwQueue { hwqueue: host });
            return Err(Error::ObjectDestroyed);
        }

        let hwqueue = Arc::new(HwQueue {
            handle: OnceLock::new(),
            fence_handle: OnceLock::new(),
            host,
            progress_fence,
            fence_address,
            context: Arc::downgrade(&context),
            process: Arc::downgrade(process),
            refcount: RefCount::new(),
            state: OrderedMutex::new(LockRank::HwQueue, ObjectState::Created),
        });

        let handles = process
            .handles
            .allocate(HandleObject::HwQueue(hwqueue.clone()), HandleType::HwQueue)
            .and_then(|handle| {
                match process
                    .handles
                    .allocate(HandleObject::HwQueue(hwqueue.clone()), HandleType::MonitoredFence)
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
                let _ = device.send(HostRequest::DestroyHwQueue { hwqueue: host });
                drop(inner);
                drop(active);
                // The queue handle may have been visible for a moment; a
                // destroy through it owns the release instead.
                hwqueue.destroy(true);
                return Err(err);
            }
        };
        let _ = hwqueue.handle.set(handle);
        let _ = hwqueue.fence_handle.set(fence);

        inner.hwqueues.push(hwqueue.clone());
        // A destroy through the new handle waits on the context lock and
        // unlists the queue after us.
        hwqueue.state.lock().activate();

        debug!("context {} created hwqueue {} ({})", context.host, handle, host);
        Ok(HwQueueInfo {
            hwqueue: handle,
            progress_fence: fence,
            fence_address,
        })
    }

    pub fn destroy_hwqueue(&self, process: &Arc<Process>, handle: Handle) -> Result<()> {
        let hwqueue = process.hwqueue(handle)?;
        hwqueue.destroy(false);
        Ok(())
    }

    /// Submit a command buffer to a context
    pub fn submit_command(
        &self,
        process: &Arc<Process>,
        context_handle: Handle,
        submission: &CommandSubmission,
    ) -> Result<()> {
        self.check_private_data(&submission.private_data)?;
        let context = process.context(context_handle)?;
        let device = context.device()?;
        let _active = device.lock_active()?;
        let inner = context.inner.read();
        if !inner.state.is_active() {
            return Err(Error::ObjectDestroyed);
        }

        device.send(HostRequest::SubmitCommand {
            context: context.host,
            command_buffer: submission.command_buffer,
            length: submission.length,
            present_history_token: submission.present_history_token,
            private_data: submission.private_data.clone(),
        })?;
        Ok(())
    }

    /// Submit a command buffer to a hardware queue
    pub fn submit_command_to_hwqueue(
        &self,
        process: &Arc<Process>,
        hwqueue_handle: Handle,
        submission: &HwQueueSubmission,
    ) -> Result<()> {
        self.check_private_data(&submission.private_data)?;
        let hwqueue = process.hwqueue(hwqueue_handle)?;
        let context = hwqueue.context.upgrade().ok_or(Error::ObjectDestroyed)?;
        let device = context.device()?;
        let _active = device.lock_active()?;
        context.check_active()?;
        let state = hwqueue.state.lock();
        if !state.is_active() {
            return Err(Error::ObjectDestroyed);
        }

        device.send(HostRequest::SubmitCommandToHwQueue {
            hwqueue: hwqueue.host,
            hwqueue_progress_fence: submission.progress_fence_value,
            command_buffer: submission.command_buffer,
            length: submission.length,
            private_data: submission.private_data.clone(),
        })?;
        Ok(())
    }
}
