use std::{str::FromStr, sync::Arc};

use log::debug;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bridge::{Bridge, Command},
   error::BridgeError,
   events::{EventCategory, SinkRef},
   platform::bluez::BluezPlatform,
};

pub struct BridgeService {
   bridge: Arc<Bridge<BluezPlatform>>,
   sink: SinkRef,
}

impl BridgeService {
   /// `sink` receives every stream a client starts listening to.
   pub fn new(bridge: Arc<Bridge<BluezPlatform>>, sink: SinkRef) -> Self {
      Self { bridge, sink }
   }
}

fn failed(err: &BridgeError) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(err.to_json().to_string())
}

fn parse_category(category: &str) -> zbus::fdo::Result<EventCategory> {
   EventCategory::from_str(category)
      .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Unknown event category: {category}")))
}

#[interface(name = "org.btcore.Bridge1")]
impl BridgeService {
   /// Runs a command. `arguments` is a JSON object, or empty for none.
   ///
   /// Failures are reported as `org.freedesktop.DBus.Error.Failed` whose
   /// message is the JSON error `{code, message, details}`.
   async fn invoke(&self, method: String, arguments: String) -> zbus::fdo::Result<String> {
      let arguments = match arguments.trim() {
         "" => None,
         text => {
            let value: serde_json::Value = serde_json::from_str(text).map_err(|e| {
               failed(&BridgeError::InvalidArgument(format!("arguments: {e}")))
            })?;
            match value {
               serde_json::Value::Null => None,
               serde_json::Value::Object(ref map) if map.is_empty() => None,
               value => Some(value),
            }
         },
      };

      let command = Command::parse(&method, arguments).map_err(|e| failed(&e))?;
      debug!("Invoking {method}");
      let result = self.bridge.handle(command).await.map_err(|e| failed(&e))?;
      Ok(result.to_string())
   }

   /// Starts pushing `category` events as signals.
   async fn listen(&self, category: String) -> zbus::fdo::Result<()> {
      let category = parse_category(&category)?;
      self.bridge.events().subscribe(category, self.sink.clone());
      Ok(())
   }

   async fn cancel(&self, category: String) -> zbus::fdo::Result<()> {
      let category = parse_category(&category)?;
      self.bridge.events().unsubscribe(category);
      Ok(())
   }

   // Signals
   #[zbus(signal)]
   pub async fn adapter_state_changed(emitter: &SignalEmitter<'_>, enabled: bool) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn discovery_changed(emitter: &SignalEmitter<'_>, discovering: bool) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_found(emitter: &SignalEmitter<'_>, device: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn stream_error(
      emitter: &SignalEmitter<'_>,
      category: &str,
      code: &str,
      message: &str,
   ) -> zbus::Result<()>;

   #[zbus(property)]
   async fn open_sessions(&self) -> u32 {
      u32::try_from(self.bridge.open_sessions()).unwrap_or(u32::MAX)
   }
}
