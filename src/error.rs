use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the plugin. All of them are terminal for one invocation.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed network configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Required CNI_* variables missing or malformed
    #[error("invalid environment: {0}")]
    Environment(String),

    /// Subnet could not be parsed or has no room for a gateway plus a container
    #[error("invalid subnet {subnet:?}: {reason}")]
    InvalidSubnet { subnet: String, reason: String },

    #[error("no address available in subnet {0}")]
    PoolExhausted(String),

    #[error("link {name} already exists but is a {kind} device, not a {expected}")]
    DeviceTypeConflict {
        name: String,
        kind: String,
        expected: String,
    },

    #[error("bridge {name} carries {count} addresses, expected at most one")]
    AmbiguousBridgeState { name: String, count: usize },

    #[error("interface {0} not found")]
    InterfaceNotFound(String),

    #[error("no IPv4 address set on interface {0}")]
    NoAddress(String),

    #[error("interface {name} carries {count} IPv4 addresses, expected exactly one")]
    AmbiguousAddress { name: String, count: usize },

    /// Reservation ledger I/O or locking failed
    #[error("reservation store {}: {source}", path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("network namespace error: {0}")]
    Namespace(String),

    /// An `ip` invocation exited unsuccessfully
    #[error("command '{cmd}' failed: {stderr}")]
    Command { cmd: String, stderr: String },

    #[error("command '{cmd}' timed out after {secs}s")]
    Timeout { cmd: String, secs: u64 },

    /// CHECK found the live attachment diverging from the configuration
    #[error("attachment is inconsistent: {0}")]
    Inconsistent(String),
}

impl Error {
    pub(crate) fn store(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Store {
            path: path.into(),
            source,
        }
    }

    /// CNI error code reported to the runtime.
    ///
    /// Codes below 100 are the well-known CNI ones; the rest are plugin specific.
    pub fn code(&self) -> u32 {
        match self {
            Error::Environment(_) => 4,
            Error::Config(_) => 7,
            Error::InvalidSubnet { .. } => 7,
            Error::Timeout { .. } => 11,
            Error::PoolExhausted(_) => 101,
            Error::DeviceTypeConflict { .. } => 102,
            Error::AmbiguousBridgeState { .. } => 103,
            Error::InterfaceNotFound(_) => 104,
            Error::NoAddress(_) => 105,
            Error::AmbiguousAddress { .. } => 106,
            Error::Store { .. } => 107,
            Error::Namespace(_) => 108,
            Error::Command { .. } => 109,
            Error::Inconsistent(_) => 110,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
