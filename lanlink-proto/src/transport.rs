//! Transport adapters: one send/receive contract over stream or
//! datagram carriers.
//!
//! The stream flavor does full reads and full writes around the 4-byte
//! header and is safe to split into independent reader and writer
//! halves. The datagram flavor maps one wire frame to one datagram and
//! must not be shared between concurrent receivers. Both honor an
//! optional per-operation deadline and an optional payload cipher.

use std::borrow::Cow;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::trace;

use crate::cipher::{self, PayloadCipher};
use crate::codec::{self, HEADER_SIZE, MAX_PAYLOAD, MIN_PAYLOAD};
use crate::error::ProtoError;

/// Per-connection transport tuning.
#[derive(Clone)]
pub struct TransportOptions {
    /// Smallest acceptable cleartext payload.
    pub min_size: usize,
    /// Largest acceptable cleartext payload.
    pub max_size: usize,
    /// Deadline applied to every read and write; `None` blocks forever.
    pub timeout: Option<Duration>,
    /// Payload cipher shared by both directions.
    pub cipher: Option<Arc<PayloadCipher>>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            min_size: MIN_PAYLOAD,
            max_size: MAX_PAYLOAD,
            timeout: None,
            cipher: None,
        }
    }
}

impl TransportOptions {
    /// Size bounds as seen on the wire. A cipher grows every payload by
    /// its fixed overhead, so the configured cleartext bounds shift.
    pub fn wire_min(&self) -> usize {
        match self.cipher {
            Some(_) => self.min_size + cipher::OVERHEAD,
            None => self.min_size,
        }
    }

    pub fn wire_max(&self) -> usize {
        match self.cipher {
            Some(_) => self.max_size + cipher::OVERHEAD,
            None => self.max_size,
        }
    }
}

impl std::fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOptions")
            .field("min_size", &self.min_size)
            .field("max_size", &self.max_size)
            .field("timeout", &self.timeout)
            .field("cipher", &self.cipher.is_some())
            .finish()
    }
}

/// Outbound half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Frame and write one payload. Returns the cleartext length sent.
    async fn send(&mut self, payload: &[u8]) -> Result<usize, ProtoError>;
}

/// Inbound half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Read one framed payload, decrypted when a cipher is configured.
    async fn receive(&mut self) -> Result<Vec<u8>, ProtoError>;
}

async fn with_deadline<F, T>(timeout: Option<Duration>, fut: F) -> Result<T, ProtoError>
where
    F: std::future::Future<Output = io::Result<T>> + Send,
{
    let res = match timeout {
        Some(t) => tokio::time::timeout(t, fut)
            .await
            .map_err(|_| ProtoError::Timeout)?,
        None => fut.await,
    };
    res.map_err(io_to_proto)
}

fn io_to_proto(err: io::Error) -> ProtoError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => ProtoError::Closed,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProtoError::Timeout,
        _ => ProtoError::Io(err),
    }
}

/// Seal (when configured) and frame one payload into a wire buffer.
fn encode_payload(payload: &[u8], opts: &TransportOptions) -> Result<Vec<u8>, ProtoError> {
    let body: Cow<'_, [u8]> = match &opts.cipher {
        Some(c) => Cow::Owned(c.seal(payload)?),
        None => Cow::Borrowed(payload),
    };
    Ok(codec::frame(&body))
}

/// Validate and open one complete datagram (header plus payload).
///
/// Shared by the connected datagram transport and the switch-side demux
/// loop, which sees raw datagrams before any session exists.
pub fn open_datagram(datagram: &[u8], opts: &TransportOptions) -> Result<Vec<u8>, ProtoError> {
    if datagram.len() <= HEADER_SIZE {
        return Err(ProtoError::BadSize(datagram.len()));
    }
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&datagram[..HEADER_SIZE]);
    let size = codec::decode_header(&header, opts.wire_min(), opts.wire_max())?;
    let rest = &datagram[HEADER_SIZE..];
    if rest.len() < size {
        return Err(ProtoError::BadSize(rest.len()));
    }
    match &opts.cipher {
        Some(c) => c.open(&rest[..size]),
        None => Ok(rest[..size].to_vec()),
    }
}

/// Framed transport over a reliable byte stream.
pub struct StreamTransport<S> {
    stream: S,
    opts: TransportOptions,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, opts: TransportOptions) -> Self {
        Self { stream, opts }
    }

    /// Split into independent receive and send halves so the inbound
    /// and outbound tasks of a session can run concurrently.
    pub fn split(self) -> (StreamReceiver<ReadHalf<S>>, StreamSender<WriteHalf<S>>) {
        let (read, write) = tokio::io::split(self.stream);
        (
            StreamReceiver {
                stream: read,
                opts: self.opts.clone(),
            },
            StreamSender {
                stream: write,
                opts: self.opts,
            },
        )
    }
}

/// Outbound half of a stream transport.
pub struct StreamSender<W> {
    stream: W,
    opts: TransportOptions,
}

#[async_trait]
impl<W> FrameSink for StreamSender<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn send(&mut self, payload: &[u8]) -> Result<usize, ProtoError> {
        let buf = encode_payload(payload, &self.opts)?;
        trace!(len = payload.len(), wire = buf.len(), "stream send");
        with_deadline(self.opts.timeout, self.stream.write_all(&buf)).await?;
        Ok(payload.len())
    }
}

/// Inbound half of a stream transport. Reads are re-entrant per
/// connection: each call consumes exactly one frame or fails without
/// consuming past the header.
pub struct StreamReceiver<R> {
    stream: R,
    opts: TransportOptions,
}

#[async_trait]
impl<R> FrameSource for StreamReceiver<R>
where
    R: AsyncRead + Send + Unpin,
{
    async fn receive(&mut self) -> Result<Vec<u8>, ProtoError> {
        let mut header = [0u8; HEADER_SIZE];
        with_deadline(self.opts.timeout, self.stream.read_exact(&mut header)).await?;
        let size = codec::decode_header(&header, self.opts.wire_min(), self.opts.wire_max())?;
        let mut payload = vec![0u8; size];
        with_deadline(self.opts.timeout, self.stream.read_exact(&mut payload)).await?;
        trace!(wire = size, "stream receive");
        match &self.opts.cipher {
            Some(c) => c.open(&payload),
            None => Ok(payload),
        }
    }
}

/// Framed transport over a connected datagram socket.
///
/// One wire frame per datagram; a datagram shorter than its declared
/// payload is rejected. Clone the transport to hand the send and
/// receive roles to separate tasks, but never run two receivers at
/// once: a datagram consumed by one never reaches the other.
#[derive(Clone)]
pub struct DatagramTransport {
    socket: Arc<UdpSocket>,
    opts: TransportOptions,
}

impl DatagramTransport {
    pub fn new(socket: Arc<UdpSocket>, opts: TransportOptions) -> Self {
        Self { socket, opts }
    }
}

#[async_trait]
impl FrameSink for DatagramTransport {
    async fn send(&mut self, payload: &[u8]) -> Result<usize, ProtoError> {
        let buf = encode_payload(payload, &self.opts)?;
        with_deadline(self.opts.timeout, self.socket.send(&buf)).await?;
        Ok(payload.len())
    }
}

#[async_trait]
impl FrameSource for DatagramTransport {
    async fn receive(&mut self) -> Result<Vec<u8>, ProtoError> {
        let mut buf = vec![0u8; HEADER_SIZE + self.opts.wire_max()];
        let n = with_deadline(self.opts.timeout, self.socket.recv(&mut buf)).await?;
        open_datagram(&buf[..n], &self.opts)
    }
}

/// Switch-side outbound half for one datagram peer, sharing the
/// listener's unconnected socket.
pub struct DatagramSender {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    opts: TransportOptions,
}

impl DatagramSender {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, opts: TransportOptions) -> Self {
        Self { socket, peer, opts }
    }
}

#[async_trait]
impl FrameSink for DatagramSender {
    async fn send(&mut self, payload: &[u8]) -> Result<usize, ProtoError> {
        let buf = encode_payload(payload, &self.opts)?;
        with_deadline(self.opts.timeout, self.socket.send_to(&buf, self.peer)).await?;
        Ok(payload.len())
    }
}

/// Switch-side inbound half for one datagram peer.
///
/// The listener's demux loop validates and opens each datagram once,
/// then queues the payload here, so the session reader loop stays
/// identical across carriers.
pub struct DatagramInbox {
    rx: mpsc::Receiver<Vec<u8>>,
    timeout: Option<Duration>,
}

impl DatagramInbox {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>, timeout: Option<Duration>) -> Self {
        Self { rx, timeout }
    }
}

#[async_trait]
impl FrameSource for DatagramInbox {
    async fn receive(&mut self) -> Result<Vec<u8>, ProtoError> {
        let next = match self.timeout {
            Some(t) => tokio::time::timeout(t, self.rx.recv())
                .await
                .map_err(|_| ProtoError::Timeout)?,
            None => self.rx.recv().await,
        };
        next.ok_or(ProtoError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_timeout() -> TransportOptions {
        TransportOptions {
            timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (a, b) = tokio::io::duplex(4096);
        let (_rx_a, mut tx_a) = StreamTransport::new(a, TransportOptions::default()).split();
        let (mut rx_b, _tx_b) = StreamTransport::new(b, TransportOptions::default()).split();

        let frame = vec![0xabu8; 60];
        tx_a.send(&frame).await.unwrap();
        assert_eq!(rx_b.receive().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_stream_roundtrip_encrypted() {
        let cipher = Arc::new(PayloadCipher::new("shared"));
        let opts = TransportOptions {
            cipher: Some(cipher),
            ..Default::default()
        };
        let (a, b) = tokio::io::duplex(4096);
        let (_rx_a, mut tx_a) = StreamTransport::new(a, opts.clone()).split();
        let (mut rx_b, _tx_b) = StreamTransport::new(b, opts).split();

        let frame = vec![0x42u8; 120];
        tx_a.send(&frame).await.unwrap();
        assert_eq!(rx_b.receive().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_stream_bad_magic() {
        let (mut a, b) = tokio::io::duplex(64);
        let (mut rx, _tx) = StreamTransport::new(b, TransportOptions::default()).split();

        a.write_all(&[0xfe, 0xff, 0x00, 0x05]).await.unwrap();
        a.write_all(b"hello").await.unwrap();
        match rx.receive().await {
            Err(ProtoError::BadMagic { found }) => assert_eq!(found, [0xfe, 0xff]),
            other => panic!("expected BadMagic, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_oversize_header() {
        let (mut a, b) = tokio::io::duplex(64);
        let (mut rx, _tx) = StreamTransport::new(b, TransportOptions::default()).split();

        // Declares 2000 bytes against the 1514 maximum; the receiver
        // must fail on the header alone without waiting for a payload.
        a.write_all(&[0xff, 0xff, 0x07, 0xd0]).await.unwrap();
        assert!(matches!(rx.receive().await, Err(ProtoError::BadSize(2000))));
    }

    #[tokio::test]
    async fn test_stream_undersize_header() {
        let (mut a, b) = tokio::io::duplex(64);
        let (mut rx, _tx) = StreamTransport::new(b, TransportOptions::default()).split();

        a.write_all(&[0xff, 0xff, 0x00, 0x0e]).await.unwrap();
        assert!(matches!(rx.receive().await, Err(ProtoError::BadSize(14))));
    }

    #[tokio::test]
    async fn test_stream_receive_timeout() {
        let (_a, b) = tokio::io::duplex(64);
        let (mut rx, _tx) = StreamTransport::new(b, short_timeout()).split();
        assert!(matches!(rx.receive().await, Err(ProtoError::Timeout)));
    }

    #[tokio::test]
    async fn test_stream_peer_close() {
        let (a, b) = tokio::io::duplex(64);
        let (mut rx, _tx) = StreamTransport::new(b, TransportOptions::default()).split();
        drop(a);
        assert!(matches!(rx.receive().await, Err(ProtoError::Closed)));
    }

    async fn udp_pair() -> (Arc<UdpSocket>, Arc<UdpSocket>) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();
        (Arc::new(a), Arc::new(b))
    }

    #[tokio::test]
    async fn test_datagram_roundtrip() {
        let (a, b) = udp_pair().await;
        let mut tx = DatagramTransport::new(a, short_timeout());
        let mut rx = DatagramTransport::new(b, short_timeout());

        let frame = vec![0x5au8; 64];
        tx.send(&frame).await.unwrap();
        assert_eq!(rx.receive().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_datagram_short_frame() {
        let (a, b) = udp_pair().await;
        let mut rx = DatagramTransport::new(b, short_timeout());

        // Header only, no payload at all.
        a.send(&[0xff, 0xff, 0x00]).await.unwrap();
        assert!(matches!(rx.receive().await, Err(ProtoError::BadSize(3))));
    }

    #[tokio::test]
    async fn test_datagram_truncated_payload() {
        let (a, b) = udp_pair().await;
        let mut rx = DatagramTransport::new(b, short_timeout());

        // Declares 20 payload bytes but carries 5.
        let mut wire = codec::frame(&[0u8; 20]);
        wire.truncate(HEADER_SIZE + 5);
        a.send(&wire).await.unwrap();
        assert!(matches!(rx.receive().await, Err(ProtoError::BadSize(5))));
    }

    #[tokio::test]
    async fn test_datagram_inbox_close() {
        let (tx, rx) = mpsc::channel(4);
        let mut inbox = DatagramInbox::new(rx, None);
        tx.send(vec![1, 2, 3]).await.unwrap();
        drop(tx);
        assert_eq!(inbox.receive().await.unwrap(), vec![1, 2, 3]);
        assert!(matches!(inbox.receive().await, Err(ProtoError::Closed)));
    }
}
