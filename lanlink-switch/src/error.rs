//! Error types for the switch.

use lanlink_net::NetError;
use lanlink_proto::ProtoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("configuration: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    Resource(String),

    #[error("no such tenant {0}")]
    TenantNotFound(String),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SwitchError>;
