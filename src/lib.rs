//! Bluetooth Classic bridge core.
//!
//! Correlates asynchronous platform round-trips (permission prompts, enable
//! requests), serializes RFCOMM socket work on a single worker per adapter
//! and fans adapter, discovery and device notifications out to one
//! subscriber per stream.

pub mod bridge;
pub mod config;
pub mod dbus;
pub mod device;
pub mod error;
pub mod events;
pub mod platform;
pub mod registry;
pub mod session;
pub mod worker;
