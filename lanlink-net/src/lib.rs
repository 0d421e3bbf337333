//! TAP device and kernel-bridge plane.
//!
//! A tenant's broadcast domain is a kernel bridge; every attached
//! endpoint gets one TAP device slaved to it. This crate defines the
//! `Bridge` and `Tap` contracts the switch consumes plus two providers:
//! the Linux one (ioctl TAP devices, rtnetlink bridge management) and an
//! in-memory one with the same flood-and-learn semantics for tests and
//! development hosts without CAP_NET_ADMIN.

pub mod bridge;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod memory;

mod error;

pub use bridge::{new_bridge, Bridge, BridgeKind, Tap};
pub use error::NetError;
#[cfg(target_os = "linux")]
pub use linux::{LinuxBridge, LinuxTap};
pub use memory::{MemBridge, MemTap};
