//! Driver configuration

use std::time::Duration;

/// Driver configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Entries per process object handle table
    pub handle_table_capacity: usize,
    /// Entries per process adapter handle table
    pub adapter_handle_capacity: usize,
    /// Entries in the registry's shared object table
    pub global_handle_capacity: usize,
    /// Outstanding descriptor grants
    pub max_descriptors: usize,
    /// How long to wait for a host response (None = until the channel closes)
    pub request_timeout: Option<Duration>,
    /// Largest private driver data blob accepted from a caller
    pub max_private_data_size: usize,
    /// Allocations per create/destroy/open request
    pub max_allocations_per_request: usize,
    /// Objects per signal/wait request
    pub max_objects_per_wait: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            handle_table_capacity: 0x10000,
            adapter_handle_capacity: 64,
            global_handle_capacity: 0x10000,
            max_descriptors: 4096,
            request_timeout: None,
            max_private_data_size: 0x10000,
            max_allocations_per_request: 1024,
            max_objects_per_wait: 32,
        }
    }
}

impl DriverConfig {
    /// Read overrides from `DXGKRNL_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`; unknown or malformed values keep the
    /// defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let number = |key: &str| lookup(key).and_then(|val| val.trim().parse::<usize>().ok());

        if let Some(n) = number("DXGKRNL_HANDLE_TABLE_CAPACITY") {
            config.handle_table_capacity = n;
        }

        if let Some(n) = number("DXGKRNL_ADAPTER_HANDLE_CAPACITY") {
            config.adapter_handle_capacity = n;
        }

        if let Some(n) = number("DXGKRNL_GLOBAL_HANDLE_CAPACITY") {
            config.global_handle_capacity = n;
        }

        if let Some(n) = number("DXGKRNL_MAX_DESCRIPTORS") {
            config.max_descriptors = n;
        }

        if let Some(ms) = number("DXGKRNL_REQUEST_TIMEOUT_MS") {
            config.request_timeout = match ms {
                0 => None,
                ms => Some(Duration::from_millis(ms as u64)),
            };
        }

        if let Some(n) = number("DXGKRNL_MAX_PRIVATE_DATA_SIZE") {
            config.max_private_data_size = n;
        }

        if let Some(n) = number("DXGKRNL_MAX_ALLOCATIONS") {
            config.max_allocations_per_request = n;
        }

        if let Some(n) = number("DXGKRNL_MAX_WAIT_OBJECTS") {
            config.max_objects_per_wait = n;
        }

        config
    }
}
