//! Bluetooth Classic bridge daemon.
//!
//! Exposes adapter queries, permission and enable round-trips, RFCOMM
//! sessions and adapter event streams on D-Bus, backed by BlueZ.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use btcore::{
   bridge::Bridge,
   config::Config,
   dbus::{BridgeService, BridgeServiceSignals},
   error::{BridgeError, Result},
   events::{EventCategory, EventPayload, EventSink, SinkRef},
   platform::{bluez::BluezPlatform, callback_channel},
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting btcore bridge...");

   let config = Config::load()?;
   info!(
      "Loaded configuration (adapter: {}, API level {})",
      config.adapter.as_deref().unwrap_or("default"),
      config.api_level
   );

   let session = bluer::Session::new().await?;
   let (callbacks, receiver) = callback_channel();
   let platform =
      BluezPlatform::new(session, config.adapter.as_deref(), config.api_level, callbacks).await;
   let bridge = Arc::new(Bridge::attach(platform, receiver, &config));

   let event_bus = EventProcessor::new(config.event_queue_warn_len);
   let service = BridgeService::new(bridge.clone(), event_bus.clone() as SinkRef);

   let builder = if config.system_bus {
      connection::Builder::system()?
   } else {
      connection::Builder::session()?
   };
   let connection = builder
      .name(config.bus_name.as_str())?
      .serve_at(config.object_path.as_str(), service)?
      .build()
      .await?;

   info!("Bridge serving {} at {}", config.bus_name, config.object_path);

   event_bus
      .spawn_dispatcher(connection.clone(), &config.object_path)
      .await?;

   signal::ctrl_c().await?;
   info!("Shutting down btcore bridge...");

   bridge.detach().await;
   drop(connection);

   Ok(())
}

enum StreamEvent {
   Payload(EventPayload),
   Error {
      category: EventCategory,
      code: &'static str,
      message: String,
   },
}

struct EventProcessor {
   queue: SegQueue<StreamEvent>,
   notifier: Notify,
   warn_len: usize,
}

impl EventProcessor {
   fn new(warn_len: usize) -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
         warn_len,
      })
   }

   fn push(&self, event: StreamEvent) {
      self.queue.push(event);
      let backlog = self.queue.len();
      if backlog > self.warn_len {
         warn!("Event dispatcher is falling behind ({backlog} queued)");
      }
      self.notifier.notify_waiters();
   }

   async fn recv(self: &Arc<Self>) -> Option<StreamEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<BridgeService>, event: StreamEvent) -> Result<()> {
      match event {
         StreamEvent::Payload(EventPayload::AdapterEnabled(enabled)) => {
            iface.adapter_state_changed(enabled).await?;
         },
         StreamEvent::Payload(EventPayload::Discovering(discovering)) => {
            iface.discovery_changed(discovering).await?;
         },
         StreamEvent::Payload(EventPayload::DeviceFound(device)) => {
            iface.device_found(&device.to_json().to_string()).await?;
         },
         StreamEvent::Error {
            category,
            code,
            message,
         } => {
            let category: &'static str = category.into();
            iface.stream_error(category, code, &message).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection, path: &str) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, BridgeService>(path)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventSink for EventProcessor {
   fn success(&self, payload: EventPayload) {
      self.push(StreamEvent::Payload(payload));
   }

   fn error(&self, category: EventCategory, error: &BridgeError) {
      self.push(StreamEvent::Error {
         category,
         code: error.code(),
         message: error.to_string(),
      });
   }
}
