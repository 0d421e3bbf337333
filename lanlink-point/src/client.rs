//! Connection lifecycle for one endpoint.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lanlink_net::Tap;
use lanlink_proto::codec::{self, Action, FrameMessage, Operator, RawControl};
use lanlink_proto::control::{response_error, LeaseReply, LoginRequest};
use lanlink_proto::transport::{
    DatagramTransport, FrameSink, FrameSource, StreamTransport, TransportOptions,
};
use lanlink_proto::{PayloadCipher, ProtoError};

/// Interval between keepalive pings.
const KEEPALIVE: Duration = Duration::from_secs(30);

/// Pause between reconnect attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Smallest frame worth sending up the wire.
const ETH_MIN: usize = 14;

#[derive(Debug, Error)]
pub enum PointError {
    #[error("login rejected: {0}")]
    Auth(String),

    #[error("unsupported platform: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct PointConfig {
    /// Switch address, `host:port`.
    pub addr: String,
    /// May be qualified as `user@tenant`.
    pub username: String,
    pub password: String,
    /// Tenant to join when the username is unqualified.
    pub network: Option<String>,
    /// Endpoint alias reported at login.
    pub alias: Option<String>,
    /// Interface MTU, including the Ethernet header.
    pub mtu: u32,
    /// Connect over UDP instead of TCP.
    pub udp: bool,
    /// Shared payload-encryption secret.
    pub secret: Option<String>,
    /// Read/write deadline.
    pub timeout: Duration,
}

/// One endpoint: a connection plus the TAP coupled to it.
pub struct Point {
    cfg: PointConfig,
}

impl Point {
    pub fn new(cfg: PointConfig) -> Self {
        Self { cfg }
    }

    fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            timeout: Some(self.cfg.timeout),
            cipher: self
                .cfg
                .secret
                .as_deref()
                .map(|s| Arc::new(PayloadCipher::new(s))),
            ..TransportOptions::default()
        }
    }

    /// Connect and serve until a fatal error; transient failures
    /// reconnect with a fixed backoff. Authentication rejections are
    /// fatal, retrying them would only repeat the refusal.
    pub async fn run(&self) -> Result<(), PointError> {
        loop {
            match self.connect_once().await {
                Ok(()) => info!("session ended, reconnecting"),
                Err(PointError::Auth(reason)) => return Err(PointError::Auth(reason)),
                Err(PointError::Unsupported(what)) => {
                    return Err(PointError::Unsupported(what))
                }
                Err(e) => warn!(error = %e, "session failed, reconnecting"),
            }
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    /// One full connect → login → forward cycle.
    pub async fn connect_once(&self) -> Result<(), PointError> {
        if self.cfg.udp {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(&self.cfg.addr).await?;
            let transport = DatagramTransport::new(Arc::new(socket), self.transport_options());
            self.drive(transport.clone(), transport).await
        } else {
            let stream = TcpStream::connect(&self.cfg.addr).await?;
            stream.set_nodelay(true)?;
            let (source, sink) = StreamTransport::new(stream, self.transport_options()).split();
            self.drive(source, sink).await
        }
    }

    async fn drive(
        &self,
        mut source: impl FrameSource + 'static,
        mut sink: impl FrameSink,
    ) -> Result<(), PointError> {
        info!(addr = %self.cfg.addr, "connected, logging in");
        let lease = login_exchange(&mut source, &mut sink, &self.cfg).await?;
        info!(address = %lease.address, netmask = %lease.netmask, "address leased");
        for route in &lease.routes {
            info!(prefix = %route.prefix, nexthop = %route.nexthop, "route advertised");
        }

        let tap = self.open_tap()?;
        tap.set_mtu(self.cfg.mtu)?;
        tap.up()?;
        info!(dev = %tap.name(), mtu = self.cfg.mtu, "virtual NIC up");

        // TAP reads happen on a dedicated thread; the async side drains
        // the channel.
        let (frames_tx, mut frames_rx) = mpsc::channel::<Vec<u8>>(64);
        let reader_tap = tap.clone();
        let mtu = self.cfg.mtu as usize;
        std::thread::Builder::new()
            .name(format!("tap-{}", tap.name()))
            .spawn(move || {
                let mut buf = vec![0u8; mtu];
                loop {
                    match reader_tap.read(&mut buf) {
                        Ok(n) if n >= ETH_MIN => {
                            if frames_tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            debug!(error = %e, "TAP reader finished");
                            break;
                        }
                    }
                }
            })?;

        // The wire reader gets its own task; a frame read must never be
        // cancelled halfway or the stream desynchronizes.
        let wire_tap = tap.clone();
        let mut wire_reader = tokio::spawn(async move {
            loop {
                match source.receive().await {
                    Ok(payload) => {
                        let msg = FrameMessage::new(payload);
                        if let Some(ctl) = msg.control() {
                            on_control(&ctl);
                        } else if let Err(e) = wire_tap.write(msg.data()) {
                            debug!(error = %e, "TAP write failed");
                        }
                    }
                    Err(e) => return e,
                }
            }
        });

        let mut keepalive = tokio::time::interval(KEEPALIVE);
        keepalive.tick().await; // immediate first tick

        let result = loop {
            tokio::select! {
                frame = frames_rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(&frame).await {
                            break Err(e.into());
                        }
                    }
                    None => break Ok(()),
                },
                ended = &mut wire_reader => {
                    break match ended {
                        Ok(e) => Err(e.into()),
                        Err(_) => Ok(()),
                    };
                }
                _ = keepalive.tick() => {
                    let body = serde_json::to_vec(&json!({ "alias": self.cfg.alias }))?;
                    let payload = codec::encode_control(Action::Ping, Operator::Request, &body);
                    if let Err(e) = sink.send(&payload).await {
                        break Err(e.into());
                    }
                }
            }
        };
        wire_reader.abort();
        tap.close();
        result
    }

    #[cfg(target_os = "linux")]
    fn open_tap(&self) -> Result<Arc<dyn Tap>, PointError> {
        Ok(Arc::new(lanlink_net::LinuxTap::open("point")?))
    }

    #[cfg(not(target_os = "linux"))]
    fn open_tap(&self) -> Result<Arc<dyn Tap>, PointError> {
        Err(PointError::Unsupported("TAP devices need Linux"))
    }
}

fn on_control(ctl: &RawControl<'_>) {
    match (ctl.action(), ctl.operator()) {
        (Some(Action::Ping), Some(Operator::Response)) => {
            debug!("keepalive answered");
        }
        (action, _) => {
            debug!(action = ?action, "control from switch");
        }
    }
}

/// Send the login request and wait for the lease.
pub async fn login_exchange(
    source: &mut impl FrameSource,
    sink: &mut impl FrameSink,
    cfg: &PointConfig,
) -> Result<LeaseReply, PointError> {
    let request = LoginRequest {
        username: cfg.username.clone(),
        password: cfg.password.clone(),
        network: cfg.network.clone(),
        alias: cfg.alias.clone(),
    };
    let body = serde_json::to_vec(&request)?;
    sink.send(&codec::encode_control(
        Action::Login,
        Operator::Request,
        &body,
    ))
    .await?;

    loop {
        let payload = source.receive().await?;
        let msg = FrameMessage::new(payload);
        let Some(ctl) = msg.control() else { continue };
        if ctl.action() != Some(Action::Login) || ctl.operator() != Some(Operator::Response) {
            continue;
        }
        if let Some(reason) = response_error(ctl.body) {
            return Err(PointError::Auth(reason));
        }
        return Ok(serde_json::from_slice(ctl.body)?);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanlink_proto::control::ErrorReply;

    fn test_cfg() -> PointConfig {
        PointConfig {
            addr: "127.0.0.1:10002".into(),
            username: "alice".into(),
            password: "alice-pass".into(),
            network: Some("blue".into()),
            alias: None,
            mtu: 1514,
            udp: false,
            secret: None,
            timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_login_exchange_success() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut c_rx, mut c_tx) = StreamTransport::new(client, TransportOptions::default()).split();
        let (mut s_rx, mut s_tx) = StreamTransport::new(server, TransportOptions::default()).split();

        let server_task = tokio::spawn(async move {
            let payload = s_rx.receive().await.unwrap();
            let msg = FrameMessage::new(payload);
            let ctl = msg.control().unwrap();
            assert_eq!(ctl.action(), Some(Action::Login));
            assert_eq!(ctl.operator(), Some(Operator::Request));
            let request: LoginRequest = serde_json::from_slice(ctl.body).unwrap();
            assert_eq!(request.username, "alice");
            assert_eq!(request.network.as_deref(), Some("blue"));

            let reply = serde_json::to_vec(&LeaseReply {
                address: "10.0.0.2".into(),
                netmask: "255.255.255.0".into(),
                routes: vec![],
            })
            .unwrap();
            s_tx.send(&codec::encode_control(
                Action::Login,
                Operator::Response,
                &reply,
            ))
            .await
            .unwrap();
        });

        let lease = login_exchange(&mut c_rx, &mut c_tx, &test_cfg())
            .await
            .unwrap();
        assert_eq!(lease.address, "10.0.0.2");
        assert_eq!(lease.netmask, "255.255.255.0");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_login_exchange_rejected() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut c_rx, mut c_tx) = StreamTransport::new(client, TransportOptions::default()).split();
        let (mut s_rx, mut s_tx) = StreamTransport::new(server, TransportOptions::default()).split();

        tokio::spawn(async move {
            let _ = s_rx.receive().await.unwrap();
            let reply = serde_json::to_vec(&ErrorReply::new("bad username or password")).unwrap();
            s_tx.send(&codec::encode_control(
                Action::Login,
                Operator::Response,
                &reply,
            ))
            .await
            .unwrap();
        });

        match login_exchange(&mut c_rx, &mut c_tx, &test_cfg()).await {
            Err(PointError::Auth(reason)) => assert_eq!(reason, "bad username or password"),
            other => panic!("expected Auth error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_login_skips_unrelated_control() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut c_rx, mut c_tx) = StreamTransport::new(client, TransportOptions::default()).split();
        let (mut s_rx, mut s_tx) = StreamTransport::new(server, TransportOptions::default()).split();

        tokio::spawn(async move {
            let _ = s_rx.receive().await.unwrap();
            // A ping response lands first; the client must wait for the
            // login response.
            s_tx.send(&codec::encode_control(
                Action::Ping,
                Operator::Response,
                br#"{"seq":0}"#,
            ))
            .await
            .unwrap();
            let reply = serde_json::to_vec(&LeaseReply {
                address: "10.0.0.3".into(),
                netmask: "255.255.255.0".into(),
                routes: vec![],
            })
            .unwrap();
            s_tx.send(&codec::encode_control(
                Action::Login,
                Operator::Response,
                &reply,
            ))
            .await
            .unwrap();
        });

        let lease = login_exchange(&mut c_rx, &mut c_tx, &test_cfg())
            .await
            .unwrap();
        assert_eq!(lease.address, "10.0.0.3");
    }
}
