//! The native Bluetooth stack the bridge drives.
//!
//! The bridge never talks to the radio itself. It calls into a [`Platform`]
//! for adapter queries and RFCOMM connections, and the platform answers
//! round-trips and reports system broadcasts by sending [`PlatformMessage`]s
//! through the [`PlatformCallbacks`] it was handed at construction time.

use std::{future::Future, io, time::Duration};

use bluer::Address;
use log::debug;
use serde::{Serialize, Serializer};
use tokio::{
   io::{AsyncRead, AsyncWrite},
   sync::mpsc,
};
use uuid::Uuid;

use crate::error::Result;

pub mod bluez;
#[cfg(test)]
pub mod fake;

/// Activity result: the user accepted.
pub const RESULT_OK: i32 = -1;
/// Activity result: the user declined or the request failed.
pub const RESULT_CANCELED: i32 = 0;
pub const PERMISSION_GRANTED: i32 = 0;
pub const PERMISSION_DENIED: i32 = -1;
/// Connection type reported for RFCOMM sockets.
pub const CONNECTION_TYPE_RFCOMM: i32 = 1;

/// Platform API levels that gate parts of the command surface.
pub mod api_level {
   pub const M: u32 = 23;
   pub const O: u32 = 26;
   pub const R: u32 = 30;
   pub const TIRAMISU: u32 = 33;
}

/// Discoverability of the local adapter.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum ScanMode {
   None = 20,
   Connectable = 21,
   ConnectableDiscoverable = 23,
}

impl Serialize for ScanMode {
   fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
      serializer.serialize_i32(*self as i32)
   }
}

/// Adapter feature flags, as far as the platform knows them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterCapabilities {
   pub multiple_advertisement: bool,
   pub offloaded_filtering: bool,
   pub offloaded_scan_batching: bool,
   pub le_2m_phy: bool,
   pub le_coded_phy: bool,
   pub le_periodic_advertising: bool,
   pub le_extended_advertising: bool,
   pub le_audio: bool,
   pub le_audio_broadcast_assistant: bool,
   pub le_audio_broadcast_source: bool,
   pub le_maximum_advertising_data_length: u32,
   pub max_connected_audio_devices: u32,
   pub discoverable_timeout: Option<Duration>,
}

/// A remote device object exactly as the platform reports it, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevice {
   pub name: Option<String>,
   pub alias: Option<String>,
   pub device_type: i32,
   pub address: String,
   pub bond_state: i32,
   /// Class of device as the platform renders it, in hex.
   pub class: Option<String>,
   pub uuids: Option<Vec<String>>,
}

/// What made the platform report a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DeviceAction {
   Found,
   NameChanged,
   AliasChanged,
   ClassChanged,
   UuidsFetched,
}

/// System broadcast delivered by the platform.
#[derive(Debug, Clone)]
pub enum Broadcast {
   /// The adapter changed power state. Carries no value: receivers read the
   /// current state when they handle it.
   StateChanged,
   DiscoveryStarted,
   DiscoveryFinished,
   /// A device was reported. `None` when the platform object could not be
   /// extracted from the broadcast.
   Device {
      action: DeviceAction,
      device: Option<RawDevice>,
   },
   /// The platform failed while handling a device broadcast.
   DeviceUpdateFailed {
      action: DeviceAction,
      message: String,
   },
}

/// Asynchronous notification from the platform.
#[derive(Debug, Clone)]
pub enum PlatformMessage {
   PermissionsResult {
      request_code: i32,
      permissions: Vec<String>,
      grant_results: Vec<i32>,
   },
   ActivityResult {
      request_code: i32,
      result_code: i32,
   },
   Broadcast(Broadcast),
}

/// Handle the platform uses to deliver [`PlatformMessage`]s.
///
/// Sending never blocks. Messages sent after the bridge detached are dropped.
#[derive(Debug, Clone)]
pub struct PlatformCallbacks {
   tx: mpsc::UnboundedSender<PlatformMessage>,
}

/// Receiving end of [`PlatformCallbacks`], owned by the bridge.
pub type CallbackReceiver = mpsc::UnboundedReceiver<PlatformMessage>;

/// Creates the callback channel shared by a platform and the bridge attached to it.
pub fn callback_channel() -> (PlatformCallbacks, CallbackReceiver) {
   let (tx, rx) = mpsc::unbounded_channel();
   (PlatformCallbacks { tx }, rx)
}

impl PlatformCallbacks {
   pub fn send(&self, message: PlatformMessage) {
      if let Err(e) = self.tx.send(message) {
         debug!("Platform callback dropped, bridge detached: {:?}", e.0);
      }
   }

   pub fn permissions_result(&self, request_code: i32, permissions: Vec<String>, grant_results: Vec<i32>) {
      self.send(PlatformMessage::PermissionsResult {
         request_code,
         permissions,
         grant_results,
      });
   }

   pub fn activity_result(&self, request_code: i32, result_code: i32) {
      self.send(PlatformMessage::ActivityResult {
         request_code,
         result_code,
      });
   }

   pub fn broadcast(&self, broadcast: Broadcast) {
      self.send(PlatformMessage::Broadcast(broadcast));
   }

   pub fn is_closed(&self) -> bool {
      self.tx.is_closed()
   }
}

/// An open RFCOMM socket.
///
/// The socket hands out its read and write streams separately; each is
/// requested at most once per socket.
pub trait RfcommSocket: Send + 'static {
   type Reader: AsyncRead + Unpin + Send + 'static;
   type Writer: AsyncWrite + Unpin + Send + 'static;

   fn input_stream(&mut self) -> io::Result<Self::Reader>;

   fn output_stream(&mut self) -> io::Result<Self::Writer>;

   fn connection_type(&self) -> i32;

   fn max_receive_packet_size(&self) -> u32;

   fn max_transmit_packet_size(&self) -> u32;

   fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// The local Bluetooth stack.
pub trait Platform: Send + Sync + 'static {
   type Socket: RfcommSocket;

   /// API level used to gate version-dependent commands.
   fn api_level(&self) -> u32;

   /// Whether a local adapter exists at all.
   fn is_available(&self) -> bool;

   fn is_enabled(&self) -> impl Future<Output = Result<bool>> + Send;

   fn name(&self) -> impl Future<Output = Result<Option<String>>> + Send;

   fn set_name(&self, name: String) -> impl Future<Output = Result<bool>> + Send;

   fn address(&self) -> impl Future<Output = Result<String>> + Send;

   fn scan_mode(&self) -> impl Future<Output = Result<ScanMode>> + Send;

   fn bonded_devices(&self) -> impl Future<Output = Result<Vec<RawDevice>>> + Send;

   fn is_discovering(&self) -> impl Future<Output = Result<bool>> + Send;

   fn start_discovery(&self) -> impl Future<Output = Result<bool>> + Send;

   fn cancel_discovery(&self) -> impl Future<Output = Result<bool>> + Send;

   fn capabilities(&self) -> impl Future<Output = Result<AdapterCapabilities>> + Send;

   fn check_permission(&self, permission: &str) -> bool;

   /// Asks the user for `permissions`. The answer arrives later as a
   /// [`PlatformMessage::PermissionsResult`] carrying `request_code`.
   fn request_permissions(&self, permissions: Vec<String>, request_code: i32) -> Result<()>;

   /// Asks the user to switch the adapter on. The answer arrives later as a
   /// [`PlatformMessage::ActivityResult`] carrying `request_code`.
   fn request_enable(&self, request_code: i32) -> Result<()>;

   /// Opens an RFCOMM connection to `service` on `address`. Blocks until the
   /// connection is established or fails.
   fn connect_rfcomm(
      &self,
      address: Address,
      secure: bool,
      service: Uuid,
   ) -> impl Future<Output = io::Result<Self::Socket>> + Send;
}
