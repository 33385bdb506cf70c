//! Error types for dxgkrnl operations
//!
//! Every fallible operation returns [`Result`]. Programming errors (reference
//! count underflow, lock order violations, illegal state transitions) are not
//! represented here; they panic.

use core::fmt;

use crate::protocol::HostStatus;

/// dxgkrnl result type
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// dxgkrnl error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Handle was never allocated, was freed, or its object is being destroyed
    InvalidHandle,
    /// Handle exists but refers to an object of another type
    WrongHandleType,
    /// The adapter has been stopped
    AdapterStopped,
    /// The device is stopped or destroyed
    DeviceStopped,
    /// The object is stopped or destroyed
    ObjectDestroyed,
    /// The host channel has been closed
    ChannelClosed,
    /// The transport failed to deliver the request
    ChannelFailure,
    /// No response from the host within the configured timeout
    Timeout,
    /// The host completed the request with an error status
    Host(HostStatus),
    /// Handle table or grant table is full
    HandleTableFull,
    /// A size limit was exceeded
    OutOfMemory,
    /// Invalid parameter
    InvalidParameter,
    /// The shared resource is sealed and cannot be extended
    Sealed,
    /// Operation is not supported for this kind of object
    NotSupported,
    /// The registry is shutting down
    ShutdownInProgress,
}

impl Error {
    /// Errors caused by the host channel rather than by the request itself
    pub fn is_channel_error(&self) -> bool {
        matches!(
            self,
            Error::ChannelClosed | Error::ChannelFailure | Error::Timeout
        )
    }

    /// Errors caused by a bad or stale handle
    pub fn is_handle_error(&self) -> bool {
        matches!(self, Error::InvalidHandle | Error::WrongHandleType)
    }

    /// Errors caused by an object that is no longer functional
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Error::AdapterStopped
                | Error::DeviceStopped
                | Error::ObjectDestroyed
                | Error::ShutdownInProgress
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidHandle => write!(f, "Invalid handle"),
            Error::WrongHandleType => write!(f, "Handle refers to an object of another type"),
            Error::AdapterStopped => write!(f, "Adapter stopped"),
            Error::DeviceStopped => write!(f, "Device stopped"),
            Error::ObjectDestroyed => write!(f, "Object destroyed"),
            Error::ChannelClosed => write!(f, "Host channel closed"),
            Error::ChannelFailure => write!(f, "Host channel failure"),
            Error::Timeout => write!(f, "Host request timed out"),
            Error::Host(status) => write!(f, "Host error: {}", status),
            Error::HandleTableFull => write!(f, "Handle table full"),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::InvalidParameter => write!(f, "Invalid parameter"),
            Error::Sealed => write!(f, "Shared resource is sealed"),
            Error::NotSupported => write!(f, "Not supported"),
            Error::ShutdownInProgress => write!(f, "Shutdown in progress"),
        }
    }
}

impl std::error::Error for Error {}

impl From<HostStatus> for Error {
    fn from(status: HostStatus) -> Self {
        Error::Host(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_status_converts_verbatim() {
        let err: Error = HostStatus::NO_MEMORY.into();
        assert_eq!(err, Error::Host(HostStatus::NO_MEMORY));
        assert!(!err.is_channel_error());
        assert!(!err.is_state_error());
    }

    #[test]
    fn test_classification() {
        assert!(Error::Timeout.is_channel_error());
        assert!(Error::WrongHandleType.is_handle_error());
        assert!(Error::ShutdownInProgress.is_state_error());
        assert!(!Error::NotSupported.is_handle_error());
    }
}
