//! Open RFCOMM sessions.
//!
//! The table is shared: the connection worker inserts, removes and performs
//! I/O on sessions, while read-only queries (connection state, packet sizes)
//! are answered directly from the caller's task.

use std::{
   collections::{HashMap, VecDeque},
   io,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
};

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use smol_str::SmolStr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
   error::{BridgeError, Result},
   platform::RfcommSocket,
};

/// Identifier of a session, the device address it was opened to.
pub type SessionKey = SmolStr;

/// Read buffer size used when draining bytes for [`InputStream::available`].
const AVAILABLE_CHUNK: usize = 1024;

/// Read side of a session.
///
/// Bytes pulled off the socket by [`available`](Self::available) are kept
/// and handed out by subsequent reads.
pub struct InputStream<R> {
   inner: R,
   pending: VecDeque<u8>,
}

impl<R: tokio::io::AsyncRead + Unpin> InputStream<R> {
   pub const fn new(inner: R) -> Self {
      Self {
         inner,
         pending: VecDeque::new(),
      }
   }

   /// Reads a single byte, waiting for one to arrive. `None` at end of stream.
   pub async fn read_byte(&mut self) -> io::Result<Option<u8>> {
      if let Some(byte) = self.pending.pop_front() {
         return Ok(Some(byte));
      }
      let mut byte = [0u8; 1];
      match self.inner.read(&mut byte).await? {
         0 => Ok(None),
         _ => Ok(Some(byte[0])),
      }
   }

   /// Number of bytes that can be read without waiting.
   pub fn available(&mut self) -> io::Result<usize> {
      let mut chunk = [0u8; AVAILABLE_CHUNK];
      loop {
         match self.inner.read(&mut chunk).now_or_never() {
            Some(Ok(0)) | None => break,
            Some(Ok(n)) => {
               self.pending.extend(&chunk[..n]);
               if n < chunk.len() {
                  break;
               }
            },
            Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
            Some(Err(e)) => return Err(e),
         }
      }
      Ok(self.pending.len())
   }
}

/// Write side of a session.
pub struct OutputStream<W> {
   inner: W,
}

impl<W: tokio::io::AsyncWrite + Unpin> OutputStream<W> {
   pub const fn new(inner: W) -> Self {
      Self { inner }
   }

   /// Writes the whole buffer or fails.
   pub async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
      self.inner.write_all(bytes).await
   }

   pub async fn flush(&mut self) -> io::Result<()> {
      self.inner.flush().await
   }

   async fn shutdown(&mut self) -> io::Result<()> {
      self.inner.shutdown().await
   }
}

/// Socket plus the streams opened on it so far.
pub struct SessionIo<S: RfcommSocket> {
   socket: S,
   input: Option<InputStream<S::Reader>>,
   output: Option<OutputStream<S::Writer>>,
}

impl<S: RfcommSocket> SessionIo<S> {
   const fn new(socket: S) -> Self {
      Self {
         socket,
         input: None,
         output: None,
      }
   }

   /// The input stream, opened on first use.
   pub fn input(&mut self) -> Result<&mut InputStream<S::Reader>> {
      let input = match self.input.take() {
         Some(input) => input,
         None => InputStream::new(
            self
               .socket
               .input_stream()
               .map_err(BridgeError::OpenInputStream)?,
         ),
      };
      Ok(self.input.insert(input))
   }

   /// The output stream, opened on first use.
   pub fn output(&mut self) -> Result<&mut OutputStream<S::Writer>> {
      let output = match self.output.take() {
         Some(output) => output,
         None => OutputStream::new(
            self
               .socket
               .output_stream()
               .map_err(BridgeError::OpenOutputStream)?,
         ),
      };
      Ok(self.output.insert(output))
   }

   /// Shuts the write side down, if open, then closes the socket.
   pub async fn close(&mut self) -> io::Result<()> {
      if let Some(output) = self.output.as_mut() {
         output.shutdown().await?;
      }
      self.socket.close().await?;
      self.input = None;
      self.output = None;
      Ok(())
   }
}

/// Snapshot of a session as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketMeta {
   pub connection_type: i32,
   pub max_receive_packet_size: u32,
   pub max_transmit_packet_size: u32,
}

/// One open RFCOMM connection.
pub struct Session<S: RfcommSocket> {
   key: SessionKey,
   meta: SocketMeta,
   connected: AtomicBool,
   io: tokio::sync::Mutex<SessionIo<S>>,
}

impl<S: RfcommSocket> Session<S> {
   pub fn new(key: SessionKey, socket: S) -> Self {
      let meta = SocketMeta {
         connection_type: socket.connection_type(),
         max_receive_packet_size: socket.max_receive_packet_size(),
         max_transmit_packet_size: socket.max_transmit_packet_size(),
      };
      Self {
         key,
         meta,
         connected: AtomicBool::new(true),
         io: tokio::sync::Mutex::new(SessionIo::new(socket)),
      }
   }

   pub fn key(&self) -> &SessionKey {
      &self.key
   }

   pub fn meta(&self) -> SocketMeta {
      self.meta
   }

   pub fn is_connected(&self) -> bool {
      self.connected.load(Ordering::Relaxed)
   }

   pub fn set_connected(&self, connected: bool) {
      self.connected.store(connected, Ordering::Relaxed);
   }

   /// Exclusive access to the socket and its streams.
   pub async fn io(&self) -> tokio::sync::MutexGuard<'_, SessionIo<S>> {
      self.io.lock().await
   }

   /// Wire representation of the session.
   ///
   /// Connection type and packet sizes are only reported when `extended` is set.
   pub fn to_json(&self, extended: bool) -> serde_json::Value {
      let mut data = json!({
          "id": self.key.as_str(),
          "type": "rfcommn",
          "isConnected": self.is_connected(),
      });
      if extended {
         data["connectionType"] = json!(self.meta.connection_type);
         data["maxReceivePacketSize"] = json!(self.meta.max_receive_packet_size);
         data["maxTransmitPacketSize"] = json!(self.meta.max_transmit_packet_size);
      }
      data
   }
}

/// Thread-safe map from session key to open session.
pub struct ConnectionTable<S: RfcommSocket> {
   sessions: Mutex<HashMap<SessionKey, Arc<Session<S>>>>,
}

impl<S: RfcommSocket> Default for ConnectionTable<S> {
   fn default() -> Self {
      Self::new()
   }
}

impl<S: RfcommSocket> ConnectionTable<S> {
   pub fn new() -> Self {
      Self {
         sessions: Mutex::new(HashMap::new()),
      }
   }

   pub fn get(&self, key: &str) -> Option<Arc<Session<S>>> {
      self.sessions.lock().get(key).cloned()
   }

   /// Like [`get`](Self::get), failing with `SOCKET_NOT_FOUND`.
   pub fn require(&self, key: &str) -> Result<Arc<Session<S>>> {
      self
         .get(key)
         .ok_or_else(|| BridgeError::SocketNotFound(key.into()))
   }

   /// Inserts `session`, returning whatever was stored under its key before.
   pub fn insert(&self, session: Arc<Session<S>>) -> Option<Arc<Session<S>>> {
      self.sessions.lock().insert(session.key().clone(), session)
   }

   pub fn remove(&self, key: &str) -> Option<Arc<Session<S>>> {
      self.sessions.lock().remove(key)
   }

   pub fn contains(&self, key: &str) -> bool {
      self.sessions.lock().contains_key(key)
   }

   pub fn len(&self) -> usize {
      self.sessions.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.sessions.lock().is_empty()
   }

   /// Removes and returns every session.
   pub fn drain(&self) -> Vec<Arc<Session<S>>> {
      self.sessions.lock().drain().map(|(_, s)| s).collect()
   }
}
