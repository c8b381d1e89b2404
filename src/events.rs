//! Push streams for adapter state, discovery and found devices.
//!
//! Each category has a single subscriber slot. Publishing into an empty slot
//! drops the payload: nothing is queued for a later subscriber.

use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;
use strum::EnumCount;

use crate::{device::DeviceDescriptor, error::BridgeError};

/// Independent event streams.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   strum::EnumCount,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum EventCategory {
   AdapterState,
   Discovery,
   DeviceFound,
}

impl EventCategory {
   const fn slot(self) -> usize {
      self as usize
   }
}

/// Typed payload pushed to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
   /// Whether the adapter is enabled at the time the change was handled.
   AdapterEnabled(bool),
   /// Whether discovery is running.
   Discovering(bool),
   DeviceFound(DeviceDescriptor),
}

impl EventPayload {
   pub const fn category(&self) -> EventCategory {
      match self {
         Self::AdapterEnabled(_) => EventCategory::AdapterState,
         Self::Discovering(_) => EventCategory::Discovery,
         Self::DeviceFound(_) => EventCategory::DeviceFound,
      }
   }
}

/// Receiver of pushed events.
pub trait EventSink: Send + Sync {
   /// Delivers a payload.
   fn success(&self, payload: EventPayload);

   /// Delivers an error on the stream. The stream stays open.
   fn error(&self, category: EventCategory, error: &BridgeError);
}

/// Type alias for a shared event sink.
pub type SinkRef = Arc<dyn EventSink>;

/// Single-slot-per-category subscriber registry.
pub struct EventMultiplexer {
   slots: [RwLock<Option<SinkRef>>; EventCategory::COUNT],
}

impl Default for EventMultiplexer {
   fn default() -> Self {
      Self::new()
   }
}

impl EventMultiplexer {
   pub fn new() -> Self {
      Self {
         slots: Default::default(),
      }
   }

   /// Installs `sink` for `category`, silently detaching the previous one.
   pub fn subscribe(&self, category: EventCategory, sink: SinkRef) {
      if self.slots[category.slot()].write().replace(sink).is_some() {
         debug!("Replaced {category} subscriber");
      }
   }

   pub fn unsubscribe(&self, category: EventCategory) {
      self.slots[category.slot()].write().take();
   }

   pub fn is_subscribed(&self, category: EventCategory) -> bool {
      self.slots[category.slot()].read().is_some()
   }

   fn sink(&self, category: EventCategory) -> Option<SinkRef> {
      self.slots[category.slot()].read().clone()
   }

   /// Delivers `payload` to the subscriber of its category, if any.
   ///
   /// Returns whether a subscriber received it.
   pub fn publish(&self, payload: EventPayload) -> bool {
      let category = payload.category();
      match self.sink(category) {
         Some(sink) => {
            sink.success(payload);
            true
         },
         None => {
            debug!("No {category} subscriber, dropping event");
            false
         },
      }
   }

   /// Delivers an error to the subscriber of `category`, if any.
   pub fn publish_error(&self, category: EventCategory, error: &BridgeError) -> bool {
      match self.sink(category) {
         Some(sink) => {
            sink.error(category, error);
            true
         },
         None => false,
      }
   }

   /// Detaches every subscriber.
   pub fn clear(&self) {
      for slot in &self.slots {
         slot.write().take();
      }
   }
}
