//! Linux provider: TAP devices over /dev/net/tun, bridge management
//! over rtnetlink.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use nix::libc;
use rtnetlink::Handle;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, BridgeKind, Tap};
use crate::error::NetError;

/// TUN/TAP flags from linux/if_tun.h.
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request code for TUNSETIFF.
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// Kernel picks the suffix for new devices.
const TAP_NAME_PATTERN: &str = "lan%d";

/// ifreq layout for TUNSETIFF and SIOC[GS]IFFLAGS.
#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// ifreq layout for SIOCSIFMTU.
#[repr(C)]
struct IfReqMtu {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_mtu: libc::c_int,
    _pad: [u8; 20],
}

fn copy_name(dst: &mut [libc::c_char; libc::IFNAMSIZ], name: &str) -> io::Result<()> {
    let bytes = name.as_bytes();
    if bytes.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "device name too long",
        ));
    }
    for (i, &b) in bytes.iter().enumerate() {
        dst[i] = b as libc::c_char;
    }
    Ok(())
}

fn name_from(raw: &[libc::c_char; libc::IFNAMSIZ]) -> String {
    raw.iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8 as char)
        .collect()
}

/// Short-lived AF_INET control socket for interface ioctls.
struct CtlSocket(RawFd);

impl CtlSocket {
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(fd))
    }
}

impl Drop for CtlSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// A kernel TAP device carrying whole Ethernet frames.
///
/// The descriptor is non-blocking; `read` polls with a short tick so a
/// `close` from another thread unblocks the reader loop promptly.
pub struct LinuxTap {
    name: String,
    tenant: String,
    file: File,
    closed: AtomicBool,
}

impl LinuxTap {
    /// Create a TAP device, letting the kernel pick the name suffix.
    pub fn open(tenant: &str) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let mut ifr = IfReqFlags {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };
        copy_name(&mut ifr.ifr_name, TAP_NAME_PATTERN)?;

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        // Non-blocking so the poll loop in read() can observe close().
        let flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let ret =
            unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let name = name_from(&ifr.ifr_name);
        debug!(name = %name, tenant = %tenant, "created TAP device");
        Ok(Self {
            name,
            tenant: tenant.to_string(),
            file,
            closed: AtomicBool::new(false),
        })
    }
}

impl Tap for LinuxTap {
    fn name(&self) -> &str {
        &self.name
    }

    fn tenant(&self) -> &str {
        &self.tenant
    }

    fn set_mtu(&self, mtu: u32) -> io::Result<()> {
        let ctl = CtlSocket::new()?;
        let mut ifr = IfReqMtu {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_mtu: mtu as libc::c_int,
            _pad: [0; 20],
        };
        copy_name(&mut ifr.ifr_name, &self.name)?;
        let ret = unsafe { libc::ioctl(ctl.0, libc::SIOCSIFMTU as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn up(&self) -> io::Result<()> {
        let ctl = CtlSocket::new()?;
        let mut ifr = IfReqFlags {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: 0,
            _pad: [0; 22],
        };
        copy_name(&mut ifr.ifr_name, &self.name)?;
        let ret = unsafe { libc::ioctl(ctl.0, libc::SIOCGIFFLAGS as _, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        ifr.ifr_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        let ret = unsafe { libc::ioctl(ctl.0, libc::SIOCSIFFLAGS as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(name = %self.name, "closing TAP device");
        }
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.file.as_raw_fd();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed"));
            }
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { libc::poll(&mut pfd, 1, 500) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if ret == 0 {
                continue;
            }
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    continue;
                }
                return Err(err);
            }
            return Ok(n as usize);
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed"));
        }
        let n = unsafe {
            libc::write(
                self.file.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            // A full TAP queue drops the frame, same as the kernel would.
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

/// Kernel bridge managed over rtnetlink.
pub struct LinuxBridge {
    name: String,
    tenant: String,
    mtu: u32,
    handle: tokio::sync::Mutex<Option<Handle>>,
}

impl LinuxBridge {
    pub fn new(name: &str, tenant: &str, mtu: u32) -> Self {
        Self {
            name: name.to_string(),
            tenant: tenant.to_string(),
            mtu,
            handle: tokio::sync::Mutex::new(None),
        }
    }

    async fn handle(&self) -> Result<Handle, NetError> {
        self.handle
            .lock()
            .await
            .clone()
            .ok_or_else(|| NetError::NotOpen(self.name.clone()))
    }

    async fn ifindex(handle: &Handle, name: &str) -> Result<u32, NetError> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(link.header.index),
            Ok(None) => Err(NetError::DeviceNotFound(name.to_string())),
            Err(e) => Err(NetError::Netlink(e.to_string())),
        }
    }
}

#[async_trait]
impl Bridge for LinuxBridge {
    fn kind(&self) -> BridgeKind {
        BridgeKind::Linux
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u32 {
        self.mtu
    }

    async fn open(&self, addr: Option<&str>) -> Result<(), NetError> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        if Self::ifindex(&handle, &self.name).await.is_err() {
            handle
                .link()
                .add()
                .bridge(self.name.clone())
                .execute()
                .await
                .map_err(|e| NetError::Netlink(e.to_string()))?;
            info!(bridge = %self.name, "created kernel bridge");
        }
        let index = Self::ifindex(&handle, &self.name).await?;
        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| NetError::Netlink(e.to_string()))?;

        if let Some(cidr) = addr {
            let net: Ipv4Net = cidr
                .parse()
                .map_err(|_| NetError::Netlink(format!("bad CIDR {cidr}")))?;
            let ip = std::net::IpAddr::V4(net.addr());
            if let Err(e) = handle
                .address()
                .add(index, ip, net.prefix_len())
                .execute()
                .await
            {
                // Re-opening an existing bridge hits EEXIST here.
                warn!(bridge = %self.name, error = %e, "address not assigned");
            }
        }

        *self.handle.lock().await = Some(handle);
        Ok(())
    }

    async fn close(&self) -> Result<(), NetError> {
        let handle = match self.handle.lock().await.take() {
            Some(h) => h,
            None => return Ok(()),
        };
        let index = Self::ifindex(&handle, &self.name).await?;
        handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| NetError::Netlink(e.to_string()))?;
        info!(bridge = %self.name, "deleted kernel bridge");
        Ok(())
    }

    fn create_tap(&self) -> Result<Arc<dyn Tap>, NetError> {
        Ok(Arc::new(LinuxTap::open(&self.tenant)?))
    }

    async fn add_slave(&self, name: &str) -> Result<(), NetError> {
        let handle = self.handle().await?;
        let bridge_index = Self::ifindex(&handle, &self.name).await?;
        let tap_index = Self::ifindex(&handle, name).await?;
        handle
            .link()
            .set(tap_index)
            .master(bridge_index)
            .execute()
            .await
            .map_err(|e| NetError::Netlink(e.to_string()))?;
        debug!(bridge = %self.name, dev = %name, "attached slave");
        Ok(())
    }

    async fn del_slave(&self, name: &str) -> Result<(), NetError> {
        let handle = self.handle().await?;
        let tap_index = Self::ifindex(&handle, name).await?;
        // master 0 detaches the port from its bridge.
        handle
            .link()
            .set(tap_index)
            .master(0)
            .execute()
            .await
            .map_err(|e| NetError::Netlink(e.to_string()))?;
        debug!(bridge = %self.name, dev = %name, "detached slave");
        Ok(())
    }
}
