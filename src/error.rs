//! Error types for the Bluetooth bridge.
//!
//! Every failure a caller can observe carries a stable string code, a human
//! message and an optional structured detail payload. The codes are part of
//! the wire contract and must not change.

use std::io;

use serde_json::{Value, json};
use smol_str::SmolStr;
use thiserror::Error;

/// Main error type for the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
   #[error("Expected OS version: {expected}. Current OS Version: {current}")]
   UnsupportedOsVersion { expected: u32, current: u32 },

   #[error("Unable to find socket")]
   SocketNotFound(SmolStr),

   #[error("Could not connect to device")]
   ConnectionFailed(#[source] io::Error),

   #[error("Error occurred when opening output stream")]
   OpenOutputStream(#[source] io::Error),

   #[error("Error occurred when opening input stream")]
   OpenInputStream(#[source] io::Error),

   #[error("Error occurred when writing to output stream")]
   WriteOutputStream(#[source] io::Error),

   #[error("Error occurred when flushing to output stream")]
   FlushOutputStream(#[source] io::Error),

   #[error("Unable to get the available bytes from input stream")]
   InputStreamAvailable(#[source] io::Error),

   #[error("Unable to read from input stream")]
   InputStreamRead(#[source] io::Error),

   #[error("{message}")]
   DeviceUpdate { message: String, details: Value },

   #[error("Bluetooth adapter not available")]
   AdapterUnavailable,

   #[error("Invalid argument: {0}")]
   InvalidArgument(String),

   #[error("Method not implemented: {0}")]
   NotImplemented(String),

   #[error("Bridge has been shut down")]
   BridgeShutdown,

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl BridgeError {
   /// Stable identifier reported to callers.
   pub const fn code(&self) -> &'static str {
      match self {
         Self::UnsupportedOsVersion { .. } => "UNSUPPORTED_OS_VERSION",
         Self::SocketNotFound(_) => "SOCKET_NOT_FOUND",
         Self::ConnectionFailed(_) => "CONNECTION_FAILED",
         Self::OpenOutputStream(_) => "UNABLE_TO_OPEN_OUTPUT_STREAM",
         Self::OpenInputStream(_) => "UNABLE_TO_OPEN_INPUT_STREAM",
         Self::WriteOutputStream(_) => "UNABLE_TO_WRITE_TO_OUTPUT_STREAM",
         Self::FlushOutputStream(_) => "UNABLE_TO_FLUSH_OUTPUT_STREAM",
         Self::InputStreamAvailable(_) => "INPUT_STREAM_GET_AVAILABLE_ERROR",
         Self::InputStreamRead(_) => "INPUT_STREAM_READ_ERROR",
         Self::DeviceUpdate { .. } => "ERROR_HANDLING_DEVICE_UPDATE",
         Self::AdapterUnavailable => "ADAPTER_UNAVAILABLE",
         Self::InvalidArgument(_) => "INVALID_ARGUMENT",
         Self::NotImplemented(_) => "NOT_IMPLEMENTED",
         Self::BridgeShutdown => "BRIDGE_SHUTDOWN",
         Self::Bluetooth(_) | Self::DBus(_) | Self::Io(_) => "PLATFORM_ERROR",
         Self::ConfigDirNotFound | Self::TomlParse(_) | Self::TomlSerialize(_) => "CONFIG_ERROR",
      }
   }

   /// Structured detail payload, `null` when the error carries none.
   pub fn details(&self) -> Value {
      match self {
         Self::UnsupportedOsVersion { expected, current } => json!({
             "currentOsVersion": current,
             "expectedOsVersion": expected,
         }),
         Self::SocketNotFound(id) => json!({ "socketId": id.as_str() }),
         Self::OpenOutputStream(e)
         | Self::OpenInputStream(e)
         | Self::WriteOutputStream(e)
         | Self::FlushOutputStream(e)
         | Self::InputStreamAvailable(e)
         | Self::InputStreamRead(e) => json!(e.to_string()),
         Self::DeviceUpdate { details, .. } => details.clone(),
         _ => Value::Null,
      }
   }

   /// Full wire representation: `{code, message, details}`.
   pub fn to_json(&self) -> Value {
      json!({
          "code": self.code(),
          "message": self.to_string(),
          "details": self.details(),
      })
   }
}

/// Convenience type alias for Results with `BridgeError`.
pub type Result<T> = std::result::Result<T, BridgeError>;
