//! In-memory bridge provider.
//!
//! Emulates a kernel bridge: frames written into one port are learned
//! by source MAC and forwarded to the owning port when the destination
//! is known, flooded to every other port otherwise. Used by tests and
//! on hosts without CAP_NET_ADMIN.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::trace;

use crate::bridge::{Bridge, BridgeKind, Tap};
use crate::error::NetError;

/// Frames a port can buffer before the bridge starts dropping, like a
/// full TAP queue would.
const PORT_DEPTH: usize = 256;

/// The shared forwarding plane of one in-memory bridge.
struct Fabric {
    ports: Mutex<HashMap<String, SyncSender<Vec<u8>>>>,
    macs: Mutex<HashMap<[u8; 6], String>>,
}

impl Fabric {
    fn forward(&self, from: &str, frame: &[u8]) {
        if frame.len() < 14 {
            return;
        }
        let mut dst = [0u8; 6];
        dst.copy_from_slice(&frame[..6]);
        let mut src = [0u8; 6];
        src.copy_from_slice(&frame[6..12]);

        {
            let mut macs = self.macs.lock().expect("mac table poisoned");
            macs.insert(src, from.to_string());
        }

        let ports = self.ports.lock().expect("port table poisoned");
        let unicast = dst[0] & 0x01 == 0;
        let learned = if unicast {
            self.macs
                .lock()
                .expect("mac table poisoned")
                .get(&dst)
                .cloned()
        } else {
            None
        };

        match learned {
            Some(port) if port != from => {
                if let Some(tx) = ports.get(&port) {
                    push(tx, frame);
                }
            }
            Some(_) => {} // destination sits on the ingress port
            None => {
                for (name, tx) in ports.iter() {
                    if name != from {
                        push(tx, frame);
                    }
                }
            }
        }
    }

    fn remove_port(&self, name: &str) {
        self.ports.lock().expect("port table poisoned").remove(name);
        self.macs
            .lock()
            .expect("mac table poisoned")
            .retain(|_, port| port != name);
    }
}

fn push(tx: &SyncSender<Vec<u8>>, frame: &[u8]) {
    match tx.try_send(frame.to_vec()) {
        Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
    }
}

/// One port of an in-memory bridge.
pub struct MemTap {
    name: String,
    tenant: String,
    fabric: Arc<Fabric>,
    rx: Mutex<Receiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl Tap for MemTap {
    fn name(&self) -> &str {
        &self.name
    }

    fn tenant(&self) -> &str {
        &self.tenant
    }

    fn set_mtu(&self, _mtu: u32) -> io::Result<()> {
        Ok(())
    }

    fn up(&self) -> io::Result<()> {
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Dropping the port sender unblocks a pending read.
            self.fabric.remove_port(&self.name);
        }
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed"));
        }
        let rx = self.rx.lock().expect("port receiver poisoned");
        let frame = rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device closed"))?;
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed"));
        }
        trace!(port = %self.name, len = buf.len(), "mem bridge write");
        self.fabric.forward(&self.name, buf);
        Ok(buf.len())
    }
}

/// In-process bridge with kernel-like flood-and-learn forwarding.
pub struct MemBridge {
    name: String,
    tenant: String,
    mtu: u32,
    fabric: Arc<Fabric>,
    counter: AtomicUsize,
    pending: Mutex<HashMap<String, SyncSender<Vec<u8>>>>,
}

impl MemBridge {
    pub fn new(name: &str, tenant: &str, mtu: u32) -> Self {
        Self {
            name: name.to_string(),
            tenant: tenant.to_string(),
            mtu,
            fabric: Arc::new(Fabric {
                ports: Mutex::new(HashMap::new()),
                macs: Mutex::new(HashMap::new()),
            }),
            counter: AtomicUsize::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Bridge for MemBridge {
    fn kind(&self) -> BridgeKind {
        BridgeKind::Memory
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u32 {
        self.mtu
    }

    async fn open(&self, _addr: Option<&str>) -> Result<(), NetError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), NetError> {
        self.fabric.ports.lock().expect("port table poisoned").clear();
        self.fabric.macs.lock().expect("mac table poisoned").clear();
        Ok(())
    }

    fn create_tap(&self) -> Result<Arc<dyn Tap>, NetError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}p{}", self.name, id);
        let (tx, rx) = std::sync::mpsc::sync_channel(PORT_DEPTH);
        self.pending
            .lock()
            .expect("pending table poisoned")
            .insert(name.clone(), tx);
        Ok(Arc::new(MemTap {
            name,
            tenant: self.tenant.clone(),
            fabric: self.fabric.clone(),
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }))
    }

    async fn add_slave(&self, name: &str) -> Result<(), NetError> {
        let tx = self
            .pending
            .lock()
            .expect("pending table poisoned")
            .remove(name)
            .ok_or_else(|| NetError::DeviceNotFound(name.to_string()))?;
        self.fabric
            .ports
            .lock()
            .expect("port table poisoned")
            .insert(name.to_string(), tx);
        Ok(())
    }

    async fn del_slave(&self, name: &str) -> Result<(), NetError> {
        self.fabric.remove_port(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn attached_pair(bridge: &MemBridge) -> (Arc<dyn Tap>, Arc<dyn Tap>) {
        let a = bridge.create_tap().unwrap();
        let b = bridge.create_tap().unwrap();
        bridge.add_slave(a.name()).await.unwrap();
        bridge.add_slave(b.name()).await.unwrap();
        (a, b)
    }

    fn frame(dst: [u8; 6], src: [u8; 6]) -> Vec<u8> {
        let mut f = vec![0u8; 60];
        f[..6].copy_from_slice(&dst);
        f[6..12].copy_from_slice(&src);
        f[12] = 0x08;
        f
    }

    const MAC_A: [u8; 6] = [0xaa, 0, 0, 0, 0, 1];
    const MAC_B: [u8; 6] = [0xaa, 0, 0, 0, 0, 2];
    const BCAST: [u8; 6] = [0xff; 6];

    #[tokio::test]
    async fn test_flood_skips_source() {
        let bridge = MemBridge::new("mb0", "t", 1518);
        let (a, b) = attached_pair(&bridge).await;

        a.write(&frame(BCAST, MAC_A)).unwrap();

        let mut buf = [0u8; 128];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(buf[..n], frame(BCAST, MAC_A)[..]);
        // Nothing came back to the source port.
        let a2 = a.clone();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 128];
            a2.read(&mut buf)
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        a.close();
        assert!(handle.join().unwrap().is_err());
    }

    #[tokio::test]
    async fn test_learned_unicast_targets_one_port() {
        let bridge = MemBridge::new("mb0", "t", 1518);
        let (a, b) = attached_pair(&bridge).await;
        let c = bridge.create_tap().unwrap();
        bridge.add_slave(c.name()).await.unwrap();

        // a teaches the bridge its MAC, then b sends to it.
        a.write(&frame(BCAST, MAC_A)).unwrap();
        b.write(&frame(MAC_A, MAC_B)).unwrap();

        let mut buf = [0u8; 128];
        // a sees b's unicast; c must only see the original flood.
        let n = a.read(&mut buf).unwrap();
        assert_eq!(buf[..n], frame(MAC_A, MAC_B)[..]);
        let n = c.read(&mut buf).unwrap();
        assert_eq!(buf[..n], frame(BCAST, MAC_A)[..]);
        c.close();
        let mut buf = [0u8; 128];
        assert!(c.read(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_detached_port_gets_nothing() {
        let bridge = MemBridge::new("mb0", "t", 1518);
        let (a, b) = attached_pair(&bridge).await;
        bridge.del_slave(b.name()).await.unwrap();

        a.write(&frame(BCAST, MAC_A)).unwrap();
        let mut buf = [0u8; 128];
        // Sender side was removed, so the read fails over immediately.
        assert!(b.read(&mut buf).is_err());
    }
}
