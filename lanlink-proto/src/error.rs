//! Error taxonomy for the wire layer.

use thiserror::Error;

/// Errors surfaced by the codec, cipher and transports.
///
/// `BadMagic` and `BadSize` are unrecoverable for a connection; the
/// session owning the transport is expected to close on them.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Header did not start with the `FF FF` magic.
    #[error("bad magic {found:02x?}")]
    BadMagic { found: [u8; 2] },

    /// Declared payload length outside the configured bounds.
    #[error("payload size {0} out of bounds")]
    BadSize(usize),

    /// A read or write missed its deadline.
    #[error("deadline exceeded")]
    Timeout,

    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,

    /// Payload decryption failed or the ciphertext was truncated.
    #[error("cipher rejected payload")]
    Cipher,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ProtoError {
    /// Whether the connection can keep going after this error.
    ///
    /// Only malformed JSON in a control body is recoverable; everything
    /// else means the byte stream can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtoError::Json(_))
    }
}
