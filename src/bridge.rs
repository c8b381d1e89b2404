//! Command dispatch and platform callback handling.
//!
//! A [`Bridge`] is attached to one [`Platform`] instance. It owns the
//! correlation registries for permission and activity round-trips, the
//! session table, the connection worker and the event multiplexer, and it
//! runs a pump task that turns [`PlatformMessage`]s into resolved requests
//! and published events.

use std::{
   collections::HashMap,
   str::FromStr,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
};

use bluer::Address;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use smol_str::SmolStr;
use tokio::{sync::oneshot, task::JoinHandle};
use uuid::Uuid;

use crate::{
   config::Config,
   device::DeviceDescriptor,
   error::{BridgeError, Result},
   events::{EventCategory, EventMultiplexer, EventPayload},
   platform::{
      AdapterCapabilities, Broadcast, CallbackReceiver, PERMISSION_GRANTED, Platform,
      PlatformMessage, RESULT_OK, api_level,
   },
   registry::CorrelationRegistry,
   session::ConnectionTable,
   worker::{ConnectionWorker, WorkerTask},
};

/// Every call the bridge answers.
///
/// On the wire a command is `{"method": ..., "arguments": {...}}`, with the
/// method and argument names in camelCase.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(
   tag = "method",
   content = "arguments",
   rename_all = "camelCase",
   rename_all_fields = "camelCase"
)]
pub enum Command {
   GetSdkVersion,

   IsAvailable,
   IsEnabled,
   Enable,
   Name,
   SetName { name: String },
   Address,
   ScanMode,
   BondedDevices,
   IsDiscovering,
   StartDiscovery,
   CancelDiscovery,

   IsMultipleAdvertisementSupported,
   IsOffloadedFilteringSupported,
   IsOffloadedScanBatchingSupported,
   IsLe2MPhySupported,
   IsLeCodedPhySupported,
   IsLePeriodicAdvertisingSupported,
   IsLeExtendedAdvertisingSupported,
   IsLeAudioSupported,
   IsLeAudioBroadcastAssistantSupported,
   IsLeAudioBroadcastSourceSupported,
   LeMaximumAdvertisingDataLength,
   MaxConnectedAudioDevices,
   DiscoverableTimeoutMs,

   CheckPermission { permission: String },
   RequestPermissions { permissions: Vec<String> },

   RfcommSocketConnect {
      address: String,
      secure: bool,
      service_record_uuid: String,
   },
   RfcommSocketClose { socket_id: SmolStr },
   RfcommSocketOutputStreamWrite { socket_id: SmolStr, bytes: Vec<u8> },
   RfcommSocketOutputStreamFlush { socket_id: SmolStr },
   RfcommSocketInputStreamAvailable { socket_id: SmolStr },
   RfcommSocketInputStreamRead { socket_id: SmolStr },
   RfcommSocketIsConnected { socket_id: SmolStr },
   RfcommSocketConnectionType { socket_id: SmolStr },
   RfcommSocketMaxTransmitPacketSize { socket_id: SmolStr },
   RfcommSocketMaxReceivePacketSize { socket_id: SmolStr },
   GetSocketData { socket_id: SmolStr },
}

impl Command {
   /// Decodes a command from its method name and JSON arguments.
   ///
   /// Unknown methods fail with `NOT_IMPLEMENTED`, malformed arguments with
   /// `INVALID_ARGUMENT`.
   pub fn parse(method: &str, arguments: Option<Value>) -> Result<Self> {
      let mut call = json!({ "method": method });
      if let Some(arguments) = arguments {
         call["arguments"] = arguments;
      }
      serde_json::from_value(call).map_err(|e| {
         let message = e.to_string();
         if message.starts_with("unknown variant") {
            BridgeError::NotImplemented(method.to_owned())
         } else {
            BridgeError::InvalidArgument(message)
         }
      })
   }
}

/// Pending permission prompt.
struct PermissionRequest {
   permissions: Vec<String>,
   reply: oneshot::Sender<HashMap<String, bool>>,
}

/// Continuation for an activity result. Returns whether the result was handled.
type ActivityCallback = Box<dyn FnOnce(i32) -> bool + Send>;

struct BridgeInner<P: Platform> {
   platform: Arc<P>,
   sessions: Arc<ConnectionTable<P::Socket>>,
   permissions: CorrelationRegistry<PermissionRequest>,
   activities: CorrelationRegistry<ActivityCallback>,
   events: EventMultiplexer,
   detached: AtomicBool,
}

/// The bridge attached to one platform instance.
pub struct Bridge<P: Platform> {
   inner: Arc<BridgeInner<P>>,
   worker: Mutex<Option<ConnectionWorker>>,
   worker_task: Mutex<Option<WorkerTask>>,
   pump_task: JoinHandle<()>,
}

impl<P: Platform> Bridge<P> {
   /// Attaches to `platform`, consuming the receiving end of the callback
   /// channel the platform was built with.
   pub fn attach(platform: P, callbacks: CallbackReceiver, config: &Config) -> Self {
      let platform = Arc::new(platform);
      let sessions = Arc::new(ConnectionTable::new());
      let (worker, worker_task) =
         ConnectionWorker::spawn(platform.clone(), sessions.clone(), config.command_queue_size);

      let inner = Arc::new(BridgeInner {
         platform,
         sessions,
         permissions: CorrelationRegistry::new(),
         activities: CorrelationRegistry::new(),
         events: EventMultiplexer::new(),
         detached: AtomicBool::new(false),
      });
      let pump_task = tokio::spawn(inner.clone().pump(callbacks));

      info!("Bridge attached (API level {})", inner.platform.api_level());
      Self {
         inner,
         worker: Mutex::new(Some(worker)),
         worker_task: Mutex::new(Some(worker_task)),
         pump_task,
      }
   }

   pub fn events(&self) -> &EventMultiplexer {
      &self.inner.events
   }

   /// Number of open RFCOMM sessions.
   pub fn open_sessions(&self) -> usize {
      self.inner.sessions.len()
   }

   /// Detaches from the platform.
   ///
   /// Subscribers are dropped, callbacks stop being processed and every open
   /// session is closed, interrupting a socket operation in progress.
   /// Callers still waiting for a platform answer or for the worker, and
   /// every command issued afterwards, fail with `BRIDGE_SHUTDOWN`.
   pub async fn detach(&self) {
      self.inner.detached.store(true, Ordering::SeqCst);
      self.inner.events.clear();
      self.pump_task.abort();

      // Dropping the continuations wakes their callers.
      let pending = self.inner.permissions.drain().len() + self.inner.activities.drain().len();
      if pending > 0 {
         warn!("Detaching with {pending} unanswered platform requests");
      }

      self.worker.lock().take();
      let worker_task = self.worker_task.lock().take();
      if let Some(task) = worker_task {
         task.stop().await;
      }
      info!("Bridge detached");
   }

   fn ensure_attached(&self) -> Result<()> {
      if self.inner.detached.load(Ordering::SeqCst) {
         return Err(BridgeError::BridgeShutdown);
      }
      Ok(())
   }

   fn worker(&self) -> Result<ConnectionWorker> {
      self.worker.lock().clone().ok_or(BridgeError::BridgeShutdown)
   }

   /// Executes `command`, answering its JSON result.
   pub async fn handle(&self, command: Command) -> Result<Value> {
      self.ensure_attached()?;
      let inner = &*self.inner;
      let platform = &*inner.platform;

      let value = match command {
         Command::GetSdkVersion => json!(platform.api_level()),

         Command::IsAvailable => json!(platform.is_available()),
         Command::IsEnabled => json!(platform.is_enabled().await?),
         Command::Enable => json!(self.enable().await?),
         Command::Name => json!(platform.name().await?),
         Command::SetName { name } => json!(platform.set_name(name).await?),
         Command::Address => json!(platform.address().await?),
         Command::ScanMode => json!(platform.scan_mode().await?),
         Command::BondedDevices => {
            let devices: Vec<Value> = platform
               .bonded_devices()
               .await?
               .into_iter()
               .filter_map(DeviceDescriptor::decode)
               .map(|d| d.to_json())
               .collect();
            json!(devices)
         },
         Command::IsDiscovering => json!(platform.is_discovering().await?),
         Command::StartDiscovery => json!(platform.start_discovery().await?),
         Command::CancelDiscovery => json!(platform.cancel_discovery().await?),

         Command::IsMultipleAdvertisementSupported => {
            json!(platform.capabilities().await?.multiple_advertisement)
         },
         Command::IsOffloadedFilteringSupported => {
            json!(platform.capabilities().await?.offloaded_filtering)
         },
         Command::IsOffloadedScanBatchingSupported => {
            json!(platform.capabilities().await?.offloaded_scan_batching)
         },
         Command::IsLe2MPhySupported => json!(inner.flag(api_level::O, |c| c.le_2m_phy).await?),
         Command::IsLeCodedPhySupported => {
            json!(inner.flag(api_level::O, |c| c.le_coded_phy).await?)
         },
         Command::IsLePeriodicAdvertisingSupported => {
            json!(inner.flag(api_level::O, |c| c.le_periodic_advertising).await?)
         },
         Command::IsLeExtendedAdvertisingSupported => {
            json!(inner.flag(api_level::O, |c| c.le_extended_advertising).await?)
         },
         Command::IsLeAudioSupported => {
            json!(inner.flag(api_level::TIRAMISU, |c| c.le_audio).await?)
         },
         Command::IsLeAudioBroadcastAssistantSupported => {
            json!(inner.flag(api_level::TIRAMISU, |c| c.le_audio_broadcast_assistant).await?)
         },
         Command::IsLeAudioBroadcastSourceSupported => {
            json!(inner.flag(api_level::TIRAMISU, |c| c.le_audio_broadcast_source).await?)
         },
         Command::LeMaximumAdvertisingDataLength => {
            inner.require_api_level(api_level::O)?;
            json!(platform.capabilities().await?.le_maximum_advertising_data_length)
         },
         Command::MaxConnectedAudioDevices => {
            inner.require_api_level(api_level::O)?;
            json!(platform.capabilities().await?.max_connected_audio_devices)
         },
         Command::DiscoverableTimeoutMs => {
            inner.require_api_level(api_level::TIRAMISU)?;
            let timeout = platform.capabilities().await?.discoverable_timeout;
            json!(timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)))
         },

         Command::CheckPermission { permission } => json!(platform.check_permission(&permission)),
         Command::RequestPermissions { permissions } => {
            json!(self.request_permissions(permissions).await?)
         },

         Command::RfcommSocketConnect {
            address,
            secure,
            service_record_uuid,
         } => self.connect(&address, secure, &service_record_uuid).await?,
         Command::RfcommSocketClose { socket_id } => json!(self.worker()?.close(socket_id).await?),
         Command::RfcommSocketOutputStreamWrite { socket_id, bytes } => {
            self.worker()?.write(socket_id, bytes).await?;
            json!(true)
         },
         Command::RfcommSocketOutputStreamFlush { socket_id } => {
            self.worker()?.flush(socket_id).await?;
            json!(true)
         },
         Command::RfcommSocketInputStreamAvailable { socket_id } => {
            json!(self.worker()?.available(socket_id).await?)
         },
         Command::RfcommSocketInputStreamRead { socket_id } => {
            match self.worker()?.read(socket_id).await? {
               Some(byte) => json!(byte),
               None => json!(-1),
            }
         },
         Command::RfcommSocketIsConnected { socket_id } => {
            json!(inner.sessions.require(&socket_id)?.is_connected())
         },
         Command::RfcommSocketConnectionType { socket_id } => {
            inner.require_api_level(api_level::M)?;
            json!(inner.sessions.require(&socket_id)?.meta().connection_type)
         },
         Command::RfcommSocketMaxTransmitPacketSize { socket_id } => {
            inner.require_api_level(api_level::M)?;
            json!(inner.sessions.require(&socket_id)?.meta().max_transmit_packet_size)
         },
         Command::RfcommSocketMaxReceivePacketSize { socket_id } => {
            json!(inner.sessions.require(&socket_id)?.meta().max_receive_packet_size)
         },
         Command::GetSocketData { socket_id } => inner.socket_data(&socket_id)?,
      };
      Ok(value)
   }

   async fn enable(&self) -> Result<bool> {
      let (tx, rx) = oneshot::channel();
      let callback: ActivityCallback = Box::new(move |result_code| {
         if tx.send(result_code == RESULT_OK).is_err() {
            debug!("Enable request answered after the caller went away");
         }
         true
      });
      let token = self.inner.activities.issue(callback);
      // Detach may have drained the registry before the token landed in it.
      if let Err(e) = self.ensure_attached() {
         self.inner.activities.resolve(token);
         return Err(e);
      }

      if let Err(e) = self.inner.platform.request_enable(token) {
         self.inner.activities.resolve(token);
         return Err(e);
      }
      rx.await.map_err(|_| BridgeError::BridgeShutdown)
   }

   async fn request_permissions(&self, permissions: Vec<String>) -> Result<HashMap<String, bool>> {
      let (reply, rx) = oneshot::channel();
      let token = self.inner.permissions.issue(PermissionRequest {
         permissions: permissions.clone(),
         reply,
      });
      if let Err(e) = self.ensure_attached() {
         self.inner.permissions.resolve(token);
         return Err(e);
      }

      if let Err(e) = self.inner.platform.request_permissions(permissions, token) {
         self.inner.permissions.resolve(token);
         return Err(e);
      }
      rx.await.map_err(|_| BridgeError::BridgeShutdown)
   }

   async fn connect(&self, address: &str, secure: bool, service: &str) -> Result<Value> {
      let address = Address::from_str(address)
         .map_err(|e| BridgeError::InvalidArgument(format!("address {address:?}: {e}")))?;
      let service = Uuid::parse_str(service)
         .map_err(|e| BridgeError::InvalidArgument(format!("service UUID {service:?}: {e}")))?;

      self.worker()?.connect(address, secure, service).await
   }
}

impl<P: Platform> BridgeInner<P> {
   fn require_api_level(&self, expected: u32) -> Result<()> {
      let current = self.platform.api_level();
      if current < expected {
         return Err(BridgeError::UnsupportedOsVersion { expected, current });
      }
      Ok(())
   }

   /// Capability flag that reads `false` below `min_level`.
   async fn flag(&self, min_level: u32, get: impl FnOnce(&AdapterCapabilities) -> bool) -> Result<bool> {
      if self.platform.api_level() < min_level {
         return Ok(false);
      }
      Ok(get(&self.platform.capabilities().await?))
   }

   fn socket_data(&self, key: &str) -> Result<Value> {
      let session = self.sessions.require(key)?;
      Ok(session.to_json(self.platform.api_level() >= api_level::M))
   }

   async fn pump(self: Arc<Self>, mut callbacks: CallbackReceiver) {
      while let Some(message) = callbacks.recv().await {
         self.on_message(message).await;
      }
      debug!("Platform callback channel closed");
   }

   /// Routes one platform message. Returns whether anything handled it.
   async fn on_message(&self, message: PlatformMessage) -> bool {
      match message {
         PlatformMessage::PermissionsResult {
            request_code,
            permissions,
            grant_results,
         } => self.on_permissions_result(request_code, permissions, &grant_results),
         PlatformMessage::ActivityResult {
            request_code,
            result_code,
         } => match self.activities.resolve(request_code) {
            Some(callback) => callback(result_code),
            None => {
               debug!("Ignoring activity result for unknown request {request_code}");
               false
            },
         },
         PlatformMessage::Broadcast(broadcast) => self.on_broadcast(broadcast).await,
      }
   }

   fn on_permissions_result(
      &self,
      request_code: i32,
      permissions: Vec<String>,
      grant_results: &[i32],
   ) -> bool {
      let Some(request) = self.permissions.resolve(request_code) else {
         debug!("Ignoring permission result for unknown request {request_code}");
         return false;
      };

      // An interrupted prompt comes back empty: nothing was granted.
      let granted: HashMap<String, bool> = if permissions.is_empty() {
         request
            .permissions
            .into_iter()
            .map(|p| (p, false))
            .collect()
      } else {
         permissions
            .into_iter()
            .enumerate()
            .map(|(i, p)| (p, grant_results.get(i) == Some(&PERMISSION_GRANTED)))
            .collect()
      };

      if request.reply.send(granted).is_err() {
         debug!("Permission request {request_code} answered after the caller went away");
      }
      true
   }

   async fn on_broadcast(&self, broadcast: Broadcast) -> bool {
      match broadcast {
         Broadcast::StateChanged => {
            let enabled = match self.platform.is_enabled().await {
               Ok(enabled) => enabled,
               Err(e) => {
                  warn!("Failed to read adapter state: {e}");
                  false
               },
            };
            self.events.publish(EventPayload::AdapterEnabled(enabled))
         },
         Broadcast::DiscoveryStarted => self.events.publish(EventPayload::Discovering(true)),
         Broadcast::DiscoveryFinished => self.events.publish(EventPayload::Discovering(false)),
         Broadcast::Device { action, device } => {
            match device.and_then(DeviceDescriptor::decode) {
               Some(device) => self.events.publish(EventPayload::DeviceFound(device)),
               None => {
                  debug!("Dropping undecodable device for {action}");
                  false
               },
            }
         },
         Broadcast::DeviceUpdateFailed { action, message } => {
            warn!("Platform failed to handle {action}: {message}");
            let error = BridgeError::DeviceUpdate {
               details: json!({ "action": action.to_string() }),
               message,
            };
            self.events.publish_error(EventCategory::DeviceFound, &error)
         },
      }
   }
}
