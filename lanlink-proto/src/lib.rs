//! Wire protocol for lanlink: length-prefixed framing with a control
//! sentinel, optional payload encryption, and transport adapters for
//! stream and datagram carriers.
//!
//! Control and data share one connection. Every wire frame is a 4-byte
//! header (`FF FF` magic plus big-endian u16 length) followed by the
//! payload. A payload whose first six bytes are zero carries an in-band
//! control message; anything else is a raw Ethernet frame.

pub mod cipher;
pub mod codec;
pub mod control;
pub mod error;
pub mod transport;

pub use cipher::PayloadCipher;
pub use codec::{Action, FrameMessage, Operator};
pub use error::ProtoError;
pub use transport::{
    DatagramInbox, DatagramSender, DatagramTransport, FrameSink, FrameSource, StreamReceiver,
    StreamSender, StreamTransport, TransportOptions,
};
