//! Bridge and TAP contracts.

use std::io;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::NetError;

/// Bridge provider flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeKind {
    /// Kernel bridge managed over netlink, TAPs via /dev/net/tun.
    Linux,
    /// In-process bridge with MAC learning, for tests and development.
    Memory,
}

impl BridgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeKind::Linux => "linux",
            BridgeKind::Memory => "memory",
        }
    }
}

impl FromStr for BridgeKind {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(BridgeKind::Linux),
            "memory" => Ok(BridgeKind::Memory),
            other => Err(NetError::DeviceNotFound(format!(
                "unknown bridge provider {other}"
            ))),
        }
    }
}

/// One virtual Ethernet device delivering whole frames to userspace.
///
/// `read` and `write` are blocking and frame-at-a-time; reader loops run
/// on dedicated threads. All methods take `&self` so a device can be
/// shared between its reader thread and the ingress path.
pub trait Tap: Send + Sync {
    fn name(&self) -> &str;

    /// Tenant this device belongs to.
    fn tenant(&self) -> &str;

    fn set_mtu(&self, mtu: u32) -> io::Result<()>;

    fn up(&self) -> io::Result<()>;

    /// Close the device. Unblocks a pending `read` with an error.
    /// Idempotent.
    fn close(&self);

    /// Read one Ethernet frame. Blocks until a frame arrives or the
    /// device is closed.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one Ethernet frame.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
}

/// One tenant's kernel (or emulated) L2 switch.
#[async_trait]
pub trait Bridge: Send + Sync {
    fn kind(&self) -> BridgeKind;

    fn name(&self) -> &str;

    fn mtu(&self) -> u32;

    /// Bring the bridge up, optionally assigning `addr` (CIDR notation)
    /// to the bridge interface.
    async fn open(&self, addr: Option<&str>) -> Result<(), NetError>;

    /// Tear the bridge down. Devices still attached are orphaned.
    async fn close(&self) -> Result<(), NetError>;

    /// Create a new TAP for this bridge's tenant. The device is not
    /// attached until `add_slave`.
    fn create_tap(&self) -> Result<Arc<dyn Tap>, NetError>;

    /// Attach a device created by `create_tap`, looked up by name.
    async fn add_slave(&self, name: &str) -> Result<(), NetError>;

    /// Detach a device, looked up by name.
    async fn del_slave(&self, name: &str) -> Result<(), NetError>;
}

/// Instantiate a bridge of the requested flavor.
///
/// On non-Linux hosts the linux provider falls back to the in-memory
/// one so development builds stay runnable.
pub fn new_bridge(kind: BridgeKind, name: &str, tenant: &str, mtu: u32) -> Arc<dyn Bridge> {
    match kind {
        #[cfg(target_os = "linux")]
        BridgeKind::Linux => Arc::new(crate::linux::LinuxBridge::new(name, tenant, mtu)),
        #[cfg(not(target_os = "linux"))]
        BridgeKind::Linux => Arc::new(crate::memory::MemBridge::new(name, tenant, mtu)),
        BridgeKind::Memory => Arc::new(crate::memory::MemBridge::new(name, tenant, mtu)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_kind_parse() {
        assert_eq!("linux".parse::<BridgeKind>().unwrap(), BridgeKind::Linux);
        assert_eq!("memory".parse::<BridgeKind>().unwrap(), BridgeKind::Memory);
        assert!("ovs".parse::<BridgeKind>().is_err());
    }
}
