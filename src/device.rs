//! Remote device snapshots.
//!
//! Platform device objects are translated into [`DeviceDescriptor`] values at
//! the moment they are reported. Nothing here is cached.

use std::str::FromStr;

use bluer::Address;
use serde::{Serialize, Serializer};
use smol_str::{SmolStr, ToSmolStr};

use crate::platform::RawDevice;

/// Transport a remote device was seen on.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum DeviceType {
   Unknown = 0,
   Classic = 1,
   Le = 2,
   Dual = 3,
}

/// Pairing state of a remote device.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum BondState {
   None = 10,
   Bonding = 11,
   Bonded = 12,
}

impl Serialize for DeviceType {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.serialize_i32(*self as i32)
   }
}

impl Serialize for BondState {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.serialize_i32(*self as i32)
   }
}

/// Read-only snapshot of a remote device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
   pub name: Option<String>,
   pub alias: Option<String>,
   #[serde(rename = "type")]
   pub device_type: DeviceType,
   pub address: SmolStr,
   pub bond_state: BondState,
   pub class_of_device: Option<u32>,
   pub uuids: Option<Vec<String>>,
}

impl DeviceDescriptor {
   /// Decodes a platform device object.
   ///
   /// Returns `None` when any field cannot be decoded: an unparsable address,
   /// an unknown type or bond state, or a class string that is not hex.
   pub fn decode(raw: RawDevice) -> Option<Self> {
      let address = Address::from_str(&raw.address).ok()?;
      let device_type = DeviceType::from_repr(raw.device_type)?;
      let bond_state = BondState::from_repr(raw.bond_state)?;
      let class_of_device = match raw.class.as_deref() {
         Some(class) => Some(u32::from_str_radix(class, 16).ok()?),
         None => None,
      };

      Some(Self {
         name: raw.name,
         alias: raw.alias,
         device_type,
         address: address.to_smolstr(),
         bond_state,
         class_of_device,
         uuids: raw.uuids,
      })
   }

   pub fn to_json(&self) -> serde_json::Value {
      serde_json::to_value(self).unwrap_or_default()
   }
}
