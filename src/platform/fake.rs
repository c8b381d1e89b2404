//! In-memory platform for tests.
//!
//! Records every call, answers queries from plain fields and backs each
//! RFCOMM socket with a `tokio::io::duplex` pipe whose far end is kept so
//! tests can see exactly what was written.

use std::{collections::HashMap, io, sync::Arc};

use bluer::Address;
use parking_lot::Mutex;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use uuid::Uuid;

use super::{
   AdapterCapabilities, CONNECTION_TYPE_RFCOMM, Platform, RawDevice, RfcommSocket, ScanMode,
};
use crate::error::{BridgeError, Result};

const PIPE_CAPACITY: usize = 4096;

/// Calls the fake has seen, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
   CancelDiscovery,
   StartDiscovery,
   Connect { address: Address, secure: bool, service: Uuid },
   RequestPermissions { permissions: Vec<String>, request_code: i32 },
   RequestEnable { request_code: i32 },
   SetName(String),
}

pub struct FakeSocket {
   pipe: Option<DuplexStream>,
   reader: Option<ReadHalf<DuplexStream>>,
   writer: Option<WriteHalf<DuplexStream>>,
   pub fail_streams: bool,
   pub fail_close: Arc<Mutex<bool>>,
   pub opened: Arc<Mutex<Vec<&'static str>>>,
   pub closed: Arc<Mutex<bool>>,
}

impl FakeSocket {
   /// A socket plus the remote end of its pipe.
   pub fn pair() -> (Self, DuplexStream) {
      let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
      let socket = Self {
         pipe: Some(local),
         reader: None,
         writer: None,
         fail_streams: false,
         fail_close: Arc::default(),
         opened: Arc::default(),
         closed: Arc::default(),
      };
      (socket, remote)
   }

   fn split(&mut self) {
      if let Some(pipe) = self.pipe.take() {
         let (reader, writer) = tokio::io::split(pipe);
         self.reader = Some(reader);
         self.writer = Some(writer);
      }
   }
}

impl RfcommSocket for FakeSocket {
   type Reader = ReadHalf<DuplexStream>;
   type Writer = WriteHalf<DuplexStream>;

   fn input_stream(&mut self) -> io::Result<Self::Reader> {
      if self.fail_streams {
         return Err(io::Error::other("input stream unavailable"));
      }
      self.split();
      self.opened.lock().push("input");
      self.reader
         .take()
         .ok_or_else(|| io::Error::other("input stream already taken"))
   }

   fn output_stream(&mut self) -> io::Result<Self::Writer> {
      if self.fail_streams {
         return Err(io::Error::other("output stream unavailable"));
      }
      self.split();
      self.opened.lock().push("output");
      self.writer
         .take()
         .ok_or_else(|| io::Error::other("output stream already taken"))
   }

   fn connection_type(&self) -> i32 {
      CONNECTION_TYPE_RFCOMM
   }

   fn max_receive_packet_size(&self) -> u32 {
      990
   }

   fn max_transmit_packet_size(&self) -> u32 {
      990
   }

   async fn close(&mut self) -> io::Result<()> {
      if *self.fail_close.lock() {
         return Err(io::Error::other("close failed"));
      }
      self.pipe = None;
      self.reader = None;
      self.writer = None;
      *self.closed.lock() = true;
      Ok(())
   }
}

/// Handles tests keep on the sockets the fake hands out.
pub struct PeerEnd {
   pub remote: DuplexStream,
   pub fail_close: Arc<Mutex<bool>>,
   pub closed: Arc<Mutex<bool>>,
}

#[derive(Default)]
pub struct FakeState {
   pub api_level: u32,
   pub available: bool,
   pub enabled: bool,
   pub discovering: bool,
   pub name: Option<String>,
   pub address: String,
   pub bonded: Vec<RawDevice>,
   pub capabilities: AdapterCapabilities,
   pub granted: Vec<String>,
   pub refuse_connect: bool,
   pub refuse_prompts: bool,
}

#[derive(Default)]
pub struct FakePlatform {
   pub state: Mutex<FakeState>,
   pub calls: Mutex<Vec<Call>>,
   pub sockets: Mutex<HashMap<Address, PeerEnd>>,
}

impl FakePlatform {
   pub fn new(api_level: u32) -> Self {
      let platform = Self::default();
      {
         let mut state = platform.state.lock();
         state.api_level = api_level;
         state.available = true;
         state.enabled = true;
         state.name = Some("bridge-test".into());
         state.address = "00:11:22:33:44:55".into();
      }
      platform
   }

   pub fn calls(&self) -> Vec<Call> {
      self.calls.lock().clone()
   }

   pub fn connect_count(&self) -> usize {
      self
         .calls
         .lock()
         .iter()
         .filter(|c| matches!(c, Call::Connect { .. }))
         .count()
   }

   /// Takes the far end of the socket most recently opened to `address`.
   pub fn take_peer(&self, address: Address) -> PeerEnd {
      self
         .sockets
         .lock()
         .remove(&address)
         .expect("no socket was opened to this address")
   }

   fn adapter(&self) -> Result<()> {
      if self.state.lock().available {
         Ok(())
      } else {
         Err(BridgeError::AdapterUnavailable)
      }
   }
}

impl Platform for FakePlatform {
   type Socket = FakeSocket;

   fn api_level(&self) -> u32 {
      self.state.lock().api_level
   }

   fn is_available(&self) -> bool {
      self.state.lock().available
   }

   async fn is_enabled(&self) -> Result<bool> {
      self.adapter()?;
      Ok(self.state.lock().enabled)
   }

   async fn name(&self) -> Result<Option<String>> {
      self.adapter()?;
      Ok(self.state.lock().name.clone())
   }

   async fn set_name(&self, name: String) -> Result<bool> {
      self.adapter()?;
      self.calls.lock().push(Call::SetName(name.clone()));
      self.state.lock().name = Some(name);
      Ok(true)
   }

   async fn address(&self) -> Result<String> {
      self.adapter()?;
      Ok(self.state.lock().address.clone())
   }

   async fn scan_mode(&self) -> Result<ScanMode> {
      self.adapter()?;
      Ok(ScanMode::Connectable)
   }

   async fn bonded_devices(&self) -> Result<Vec<RawDevice>> {
      self.adapter()?;
      Ok(self.state.lock().bonded.clone())
   }

   async fn is_discovering(&self) -> Result<bool> {
      self.adapter()?;
      Ok(self.state.lock().discovering)
   }

   async fn start_discovery(&self) -> Result<bool> {
      self.adapter()?;
      self.calls.lock().push(Call::StartDiscovery);
      self.state.lock().discovering = true;
      Ok(true)
   }

   async fn cancel_discovery(&self) -> Result<bool> {
      self.adapter()?;
      self.calls.lock().push(Call::CancelDiscovery);
      self.state.lock().discovering = false;
      Ok(true)
   }

   async fn capabilities(&self) -> Result<AdapterCapabilities> {
      self.adapter()?;
      Ok(self.state.lock().capabilities.clone())
   }

   fn check_permission(&self, permission: &str) -> bool {
      self.state.lock().granted.iter().any(|p| p == permission)
   }

   fn request_permissions(&self, permissions: Vec<String>, request_code: i32) -> Result<()> {
      if self.state.lock().refuse_prompts {
         return Err(BridgeError::AdapterUnavailable);
      }
      self.calls.lock().push(Call::RequestPermissions {
         permissions,
         request_code,
      });
      Ok(())
   }

   fn request_enable(&self, request_code: i32) -> Result<()> {
      if self.state.lock().refuse_prompts {
         return Err(BridgeError::AdapterUnavailable);
      }
      self.calls.lock().push(Call::RequestEnable { request_code });
      Ok(())
   }

   async fn connect_rfcomm(&self, address: Address, secure: bool, service: Uuid) -> io::Result<FakeSocket> {
      self.calls.lock().push(Call::Connect {
         address,
         secure,
         service,
      });
      if self.state.lock().refuse_connect {
         return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "host is down"));
      }
      let (socket, remote) = FakeSocket::pair();
      self.sockets.lock().insert(address, PeerEnd {
         remote,
         fail_close: socket.fail_close.clone(),
         closed: socket.closed.clone(),
      });
      Ok(socket)
   }
}
