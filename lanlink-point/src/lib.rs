//! The lanlink endpoint client.
//!
//! Connects to a switch, authenticates, and couples a local TAP device
//! to the connection: frames read from the TAP go up the wire, frames
//! from the wire go into the TAP.

pub mod client;

pub use client::{Point, PointConfig, PointError};
