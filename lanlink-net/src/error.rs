use thiserror::Error;

/// Errors from bridge and TAP management.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("netlink: {0}")]
    Netlink(String),

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("bridge {0} is not open")]
    NotOpen(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
