use std::sync::Arc;

use dxgkrnl::{DriverConfig, Handle, LoopbackHost, Luid, Process, Registry};

pub const LUID: Luid = Luid::new(0x10, 0);

pub struct Guest {
    pub host: Arc<LoopbackHost>,
    pub registry: Arc<Registry>,
}

/// Registry with one adapter, both channels served by the same host
pub fn guest() -> Guest {
    let host = LoopbackHost::new();
    let registry = Registry::new(DriverConfig::default(), host.endpoint());
    registry
        .add_adapter(LUID, host.endpoint())
        .expect("add adapter");
    Guest { host, registry }
}

/// Register `pid`, open the adapter and create a device
pub fn device(registry: &Registry, pid: u32) -> (Arc<Process>, Handle) {
    let process = registry.process_create(pid).expect("process create");
    let adapter = registry
        .open_adapter_from_luid(&process, LUID)
        .expect("open adapter");
    let device = registry
        .create_device(&process, adapter, Default::default())
        .expect("create device");
    (process, device)
}

/// Spin until the host holds `count` completions
pub fn wait_for_held(host: &LoopbackHost, count: usize) {
    while host.held_completions() < count {
        std::thread::yield_now();
    }
}

/// Stop holding completions and deliver the ones already held
pub fn release_held(host: &LoopbackHost) -> usize {
    host.set_hold_completions(false);
    host.release_completions()
}
