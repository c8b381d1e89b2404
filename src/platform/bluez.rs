//! BlueZ backend.
//!
//! Drives one local adapter through `bluer`. Adapter and device property
//! changes are watched in background tasks and reported as broadcasts;
//! RFCOMM connections go through a client profile registered for the
//! requested service UUID.

use std::{collections::HashMap, io, pin::pin, time::Duration};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, AddressType, Device, DeviceEvent,
   DeviceProperty, Session,
   rfcomm::{
      Profile, Role, Stream,
      stream::{OwnedReadHalf, OwnedWriteHalf},
   },
};
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{io::AsyncWriteExt, task::JoinHandle};
use uuid::Uuid;

use super::{
   AdapterCapabilities, Broadcast, CONNECTION_TYPE_RFCOMM, DeviceAction, PERMISSION_GRANTED,
   Platform, PlatformCallbacks, RESULT_CANCELED, RESULT_OK, RawDevice, RfcommSocket, ScanMode,
   api_level,
};
use crate::error::{BridgeError, Result};

/// Default RFCOMM frame size, used for both directions.
const RFCOMM_DEFAULT_MTU: u32 = 127;

/// An RFCOMM stream accepted through a BlueZ profile.
pub struct BluezSocket {
   stream: Option<Stream>,
   reader: Option<OwnedReadHalf>,
   writer: Option<OwnedWriteHalf>,
}

impl BluezSocket {
   const fn new(stream: Stream) -> Self {
      Self {
         stream: Some(stream),
         reader: None,
         writer: None,
      }
   }

   fn split(&mut self) {
      if let Some(stream) = self.stream.take() {
         let (reader, writer) = stream.into_split();
         self.reader = Some(reader);
         self.writer = Some(writer);
      }
   }
}

impl RfcommSocket for BluezSocket {
   type Reader = OwnedReadHalf;
   type Writer = OwnedWriteHalf;

   fn input_stream(&mut self) -> io::Result<OwnedReadHalf> {
      self.split();
      self
         .reader
         .take()
         .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "input stream unavailable"))
   }

   fn output_stream(&mut self) -> io::Result<OwnedWriteHalf> {
      self.split();
      self
         .writer
         .take()
         .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "output stream unavailable"))
   }

   fn connection_type(&self) -> i32 {
      CONNECTION_TYPE_RFCOMM
   }

   fn max_receive_packet_size(&self) -> u32 {
      RFCOMM_DEFAULT_MTU
   }

   fn max_transmit_packet_size(&self) -> u32 {
      RFCOMM_DEFAULT_MTU
   }

   async fn close(&mut self) -> io::Result<()> {
      if let Some(mut stream) = self.stream.take() {
         stream.shutdown().await?;
      }
      // Dropping both halves releases the socket.
      self.reader = None;
      self.writer = None;
      Ok(())
   }
}

/// A local BlueZ adapter.
pub struct BluezPlatform {
   session: Session,
   adapter: Option<Adapter>,
   callbacks: PlatformCallbacks,
   api_level: u32,
   discovery: Mutex<Option<JoinHandle<()>>>,
   monitor: Option<JoinHandle<()>>,
}

impl BluezPlatform {
   /// Opens `adapter_name`, or the default adapter. A missing adapter is not
   /// an error: the platform then reports itself unavailable.
   pub async fn new(
      session: Session,
      adapter_name: Option<&str>,
      api_level: u32,
      callbacks: PlatformCallbacks,
   ) -> Self {
      let adapter = match adapter_name {
         Some(name) => session.adapter(name),
         None => session.default_adapter().await,
      };
      let adapter = match adapter {
         Ok(adapter) => {
            info!("Using adapter {}", adapter.name());
            Some(adapter)
         },
         Err(e) => {
            warn!("No usable Bluetooth adapter: {e}");
            None
         },
      };

      let monitor = adapter
         .clone()
         .map(|adapter| spawn_adapter_monitor(adapter, callbacks.clone(), api_level));

      Self {
         session,
         adapter,
         callbacks,
         api_level,
         discovery: Mutex::new(None),
         monitor,
      }
   }

   fn adapter(&self) -> Result<&Adapter> {
      self.adapter.as_ref().ok_or(BridgeError::AdapterUnavailable)
   }
}

impl Drop for BluezPlatform {
   fn drop(&mut self) {
      if let Some(monitor) = self.monitor.take() {
         monitor.abort();
      }
      if let Some(discovery) = self.discovery.lock().take() {
         discovery.abort();
      }
   }
}

impl Platform for BluezPlatform {
   type Socket = BluezSocket;

   fn api_level(&self) -> u32 {
      self.api_level
   }

   fn is_available(&self) -> bool {
      self.adapter.is_some()
   }

   async fn is_enabled(&self) -> Result<bool> {
      Ok(self.adapter()?.is_powered().await?)
   }

   async fn name(&self) -> Result<Option<String>> {
      Ok(Some(self.adapter()?.alias().await?))
   }

   async fn set_name(&self, name: String) -> Result<bool> {
      self.adapter()?.set_alias(name).await?;
      Ok(true)
   }

   async fn address(&self) -> Result<String> {
      Ok(self.adapter()?.address().await?.to_string())
   }

   async fn scan_mode(&self) -> Result<ScanMode> {
      let adapter = self.adapter()?;
      if !adapter.is_powered().await? {
         return Ok(ScanMode::None);
      }
      if adapter.is_discoverable().await? {
         Ok(ScanMode::ConnectableDiscoverable)
      } else {
         Ok(ScanMode::Connectable)
      }
   }

   async fn bonded_devices(&self) -> Result<Vec<RawDevice>> {
      let adapter = self.adapter()?;
      let mut bonded = Vec::new();
      for address in adapter.device_addresses().await? {
         let device = adapter.device(address)?;
         if device.is_paired().await? {
            bonded.push(read_device(&device, self.api_level).await?);
         }
      }
      Ok(bonded)
   }

   async fn is_discovering(&self) -> Result<bool> {
      Ok(self.adapter()?.is_discovering().await?)
   }

   async fn start_discovery(&self) -> Result<bool> {
      let adapter = self.adapter()?;
      if let Some(task) = self.discovery.lock().as_ref()
         && !task.is_finished()
      {
         return Ok(true);
      }

      // Discovery runs for as long as this stream is alive. Found devices are
      // reported by the adapter monitor.
      let events = adapter.discover_devices().await?;
      let task = tokio::spawn(async move {
         let mut events = pin!(events);
         while events.next().await.is_some() {}
      });
      if let Some(previous) = self.discovery.lock().replace(task) {
         previous.abort();
      }
      Ok(true)
   }

   async fn cancel_discovery(&self) -> Result<bool> {
      self.adapter()?;
      if let Some(task) = self.discovery.lock().take() {
         task.abort();
         debug!("Discovery cancelled");
      }
      Ok(true)
   }

   async fn capabilities(&self) -> Result<AdapterCapabilities> {
      let timeout = self.adapter()?.discoverable_timeout().await?;
      Ok(AdapterCapabilities {
         // Zero means discoverable until switched off.
         discoverable_timeout: (timeout > 0).then(|| Duration::from_secs(u64::from(timeout))),
         ..AdapterCapabilities::default()
      })
   }

   fn check_permission(&self, _permission: &str) -> bool {
      // Access is governed by D-Bus policy, which already let us in.
      true
   }

   fn request_permissions(&self, permissions: Vec<String>, request_code: i32) -> Result<()> {
      let grants = vec![PERMISSION_GRANTED; permissions.len()];
      self
         .callbacks
         .permissions_result(request_code, permissions, grants);
      Ok(())
   }

   fn request_enable(&self, request_code: i32) -> Result<()> {
      let adapter = self.adapter()?.clone();
      let callbacks = self.callbacks.clone();
      tokio::spawn(async move {
         let result_code = match adapter.set_powered(true).await {
            Ok(()) => RESULT_OK,
            Err(e) => {
               warn!("Failed to power on {}: {e}", adapter.name());
               RESULT_CANCELED
            },
         };
         callbacks.activity_result(request_code, result_code);
      });
      Ok(())
   }

   async fn connect_rfcomm(&self, address: Address, secure: bool, service: Uuid) -> io::Result<BluezSocket> {
      let adapter = self
         .adapter()
         .map_err(|e| io::Error::new(io::ErrorKind::NotConnected, e))?;
      let device = adapter.device(address).map_err(io::Error::other)?;

      let profile = Profile {
         uuid: service,
         role: Some(Role::Client),
         require_authentication: Some(secure),
         require_authorization: Some(false),
         ..Default::default()
      };
      // Unregistered when the handle is dropped.
      let mut handle = self
         .session
         .register_profile(profile)
         .await
         .map_err(io::Error::other)?;

      // BlueZ hands the connection to the profile before ConnectProfile returns.
      let mut connect = pin!(device.connect_profile(&service));
      let mut connected = false;
      let request = loop {
         tokio::select! {
            result = &mut connect, if !connected => {
               result.map_err(io::Error::other)?;
               connected = true;
            },
            request = handle.next() => break request,
         }
      };

      let request = request.ok_or_else(|| {
         io::Error::new(io::ErrorKind::ConnectionAborted, "profile unregistered before connecting")
      })?;
      let stream = request.accept().map_err(io::Error::other)?;
      Ok(BluezSocket::new(stream))
   }
}

/// Reads a device the way it is reported to callers.
async fn read_device(device: &Device, api_level: u32) -> bluer::Result<RawDevice> {
   let alias = if api_level >= api_level::R {
      Some(device.alias().await?)
   } else {
      None
   };
   let device_type = match device.address_type().await? {
      AddressType::BrEdr => 1,
      _ => 2,
   };
   let bond_state = if device.is_paired().await? { 12 } else { 10 };
   let uuids = device.uuids().await?.map(|uuids| {
      let mut uuids: Vec<String> = uuids.iter().map(Uuid::to_string).collect();
      uuids.sort_unstable();
      uuids
   });

   Ok(RawDevice {
      name: device.name().await?,
      alias,
      device_type,
      address: device.address().to_string(),
      bond_state,
      class: device.class().await?.map(|class| format!("{class:x}")),
      uuids,
   })
}

async fn report_device(device: &Device, action: DeviceAction, api_level: u32, callbacks: &PlatformCallbacks) {
   let broadcast = match read_device(device, api_level).await {
      Ok(raw) => Broadcast::Device {
         action,
         device: Some(raw),
      },
      Err(e) => Broadcast::DeviceUpdateFailed {
         action,
         message: e.to_string(),
      },
   };
   callbacks.broadcast(broadcast);
}

fn spawn_adapter_monitor(adapter: Adapter, callbacks: PlatformCallbacks, api_level: u32) -> JoinHandle<()> {
   tokio::spawn(async move {
      let name = adapter.name().to_owned();
      let mut events = match adapter.events().await {
         Ok(events) => events,
         Err(e) => {
            warn!("Failed to watch adapter {name}: {e}");
            return;
         },
      };
      let mut watchers: HashMap<Address, JoinHandle<()>> = HashMap::new();

      while let Some(event) = events.next().await {
         match event {
            AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) => {
               debug!("Adapter {name} powered: {powered}");
               callbacks.broadcast(Broadcast::StateChanged);
            },
            AdapterEvent::PropertyChanged(AdapterProperty::Discovering(true)) => {
               callbacks.broadcast(Broadcast::DiscoveryStarted);
            },
            AdapterEvent::PropertyChanged(AdapterProperty::Discovering(false)) => {
               callbacks.broadcast(Broadcast::DiscoveryFinished);
            },
            AdapterEvent::DeviceAdded(address) => {
               let device = match adapter.device(address) {
                  Ok(device) => device,
                  Err(e) => {
                     callbacks.broadcast(Broadcast::DeviceUpdateFailed {
                        action: DeviceAction::Found,
                        message: e.to_string(),
                     });
                     continue;
                  },
               };
               debug!("Device added on {name}: {address}");
               report_device(&device, DeviceAction::Found, api_level, &callbacks).await;
               let watcher = spawn_device_watcher(device, callbacks.clone(), api_level);
               if let Some(previous) = watchers.insert(address, watcher) {
                  previous.abort();
               }
            },
            AdapterEvent::DeviceRemoved(address) => {
               debug!("Device removed on {name}: {address}");
               if let Some(watcher) = watchers.remove(&address) {
                  watcher.abort();
               }
            },
            _ => {},
         }

         if callbacks.is_closed() {
            break;
         }
      }

      for (_, watcher) in watchers {
         watcher.abort();
      }
      debug!("Stopped watching adapter {name}");
   })
}

fn spawn_device_watcher(device: Device, callbacks: PlatformCallbacks, api_level: u32) -> JoinHandle<()> {
   tokio::spawn(async move {
      let mut events = match device.events().await {
         Ok(events) => events,
         Err(e) => {
            debug!("Failed to watch device {}: {e}", device.address());
            return;
         },
      };

      while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
         let action = match property {
            DeviceProperty::Name(_) => DeviceAction::NameChanged,
            DeviceProperty::Alias(_) => DeviceAction::AliasChanged,
            DeviceProperty::Class(_) => DeviceAction::ClassChanged,
            DeviceProperty::Uuids(_) => DeviceAction::UuidsFetched,
            _ => continue,
         };
         report_device(&device, action, api_level, &callbacks).await;
      }
   })
}
