//! Configuration for the bridge daemon.
//!
//! Loaded from `config.toml` under `$BTCORE_HOME`, `$XDG_CONFIG_HOME/btcore`
//! or the platform config directory, and written back with defaults on first
//! run.

use std::{
   env, fs,
   path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Main configuration structure for the daemon.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// Adapter to drive, e.g. `hci1`. The default adapter when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default = "default_bus_name")]
   pub bus_name: String,

   #[serde(default = "default_object_path")]
   pub object_path: String,

   /// Serve on the system bus instead of the session bus.
   #[serde(default)]
   pub system_bus: bool,

   /// API level reported by the BlueZ backend for command gating.
   #[serde(default = "default_api_level")]
   pub api_level: u32,

   /// Capacity of the connection worker's command queue.
   #[serde(default = "default_command_queue_size")]
   pub command_queue_size: usize,

   /// Event backlog length above which the dispatcher warns.
   #[serde(default = "default_event_queue_warn_len")]
   pub event_queue_warn_len: usize,
}

fn default_bus_name() -> String {
   "org.btcore.Bridge".into()
}

fn default_object_path() -> String {
   "/org/btcore/Bridge".into()
}

const fn default_api_level() -> u32 {
   33
}

const fn default_command_queue_size() -> usize {
   64
}

const fn default_event_queue_warn_len() -> usize {
   256
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         bus_name: default_bus_name(),
         object_path: default_object_path(),
         system_bus: false,
         api_level: default_api_level(),
         command_queue_size: default_command_queue_size(),
         event_queue_warn_len: default_event_queue_warn_len(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BTCORE_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home).join("btcore")
      } else if let Some(config_dir) = dirs::config_dir() {
         config_dir.join("btcore")
      } else {
         return Err(BridgeError::ConfigDirNotFound);
      };

      Ok(config_dir.join("config.toml"))
   }
}
