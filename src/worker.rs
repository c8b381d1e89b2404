//! Serialized RFCOMM worker.
//!
//! Every connect, close, write, flush and read is queued to a single actor
//! task per adapter and runs to completion before the next one starts, so
//! byte streams never interleave and adapter-wide calls such as cancelling
//! discovery never race a connection in progress. A slow operation on one
//! session delays everything queued behind it, until the worker is stopped.

use std::sync::Arc;

use bluer::Address;
use log::{debug, info, warn};
use serde_json::Value;
use smol_str::ToSmolStr;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinHandle,
};
use uuid::Uuid;

use crate::{
   error::{BridgeError, Result},
   platform::{Platform, api_level},
   session::{ConnectionTable, Session, SessionKey},
};

// === Commands ===

enum WorkerCommand {
   Connect {
      address: Address,
      secure: bool,
      service: Uuid,
      reply: oneshot::Sender<Result<Value>>,
   },
   Close {
      key: SessionKey,
      reply: oneshot::Sender<Result<bool>>,
   },
   Write {
      key: SessionKey,
      bytes: Vec<u8>,
      reply: oneshot::Sender<Result<()>>,
   },
   Flush {
      key: SessionKey,
      reply: oneshot::Sender<Result<()>>,
   },
   Read {
      key: SessionKey,
      reply: oneshot::Sender<Result<Option<u8>>>,
   },
   Available {
      key: SessionKey,
      reply: oneshot::Sender<Result<usize>>,
   },
}

// === Handle ===

/// Handle used to queue socket work.
///
/// Dropping every handle lets the worker finish its queue and stop, closing
/// all sessions still in the table.
#[derive(Clone)]
pub struct ConnectionWorker {
   inbox: mpsc::Sender<WorkerCommand>,
}

impl ConnectionWorker {
   /// Spawns the worker task for one adapter.
   pub fn spawn<P: Platform>(
      platform: Arc<P>,
      sessions: Arc<ConnectionTable<P::Socket>>,
      queue_size: usize,
   ) -> (Self, WorkerTask) {
      let (inbox, command_rx) = mpsc::channel(queue_size.max(1));
      let (shutdown, shutdown_rx) = oneshot::channel();
      let handle = tokio::spawn(
         WorkerActor {
            platform,
            sessions,
            command_rx,
         }
         .run(shutdown_rx),
      );
      (Self { inbox }, WorkerTask { shutdown, handle })
   }

   async fn request<T>(
      &self,
      command: impl FnOnce(oneshot::Sender<Result<T>>) -> WorkerCommand,
   ) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(command(tx))
         .await
         .map_err(|_| BridgeError::BridgeShutdown)?;
      rx.await.map_err(|_| BridgeError::BridgeShutdown)?
   }

   /// Connects to `service` on `address`, returning the session as reported
   /// to callers.
   pub async fn connect(&self, address: Address, secure: bool, service: Uuid) -> Result<Value> {
      self
         .request(|reply| WorkerCommand::Connect {
            address,
            secure,
            service,
            reply,
         })
         .await
   }

   /// Closes a session. `true` when the session is gone afterwards.
   pub async fn close(&self, key: SessionKey) -> Result<bool> {
      self
         .request(|reply| WorkerCommand::Close { key, reply })
         .await
   }

   pub async fn write(&self, key: SessionKey, bytes: Vec<u8>) -> Result<()> {
      self
         .request(|reply| WorkerCommand::Write { key, bytes, reply })
         .await
   }

   pub async fn flush(&self, key: SessionKey) -> Result<()> {
      self
         .request(|reply| WorkerCommand::Flush { key, reply })
         .await
   }

   /// Reads one byte, `None` at end of stream.
   pub async fn read(&self, key: SessionKey) -> Result<Option<u8>> {
      self
         .request(|reply| WorkerCommand::Read { key, reply })
         .await
   }

   pub async fn available(&self, key: SessionKey) -> Result<usize> {
      self
         .request(|reply| WorkerCommand::Available { key, reply })
         .await
   }
}

/// The running worker task.
///
/// Dropping it stops the worker just like [`stop`](Self::stop), without
/// waiting for it.
pub struct WorkerTask {
   shutdown: oneshot::Sender<()>,
   handle: JoinHandle<()>,
}

impl WorkerTask {
   /// Stops the worker and waits until every session is closed.
   ///
   /// An operation in progress is abandoned and its caller, like every
   /// caller still queued, gets `BRIDGE_SHUTDOWN`.
   pub async fn stop(self) {
      let _ = self.shutdown.send(());
      if let Err(e) = self.handle.await {
         warn!("Connection worker ended abnormally: {e}");
      }
   }
}

// === Worker Actor ===

struct WorkerActor<P: Platform> {
   platform: Arc<P>,
   sessions: Arc<ConnectionTable<P::Socket>>,
   command_rx: mpsc::Receiver<WorkerCommand>,
}

impl<P: Platform> WorkerActor<P> {
   async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
      debug!("Connection worker starting up");

      // `shutdown` resolves once, on stop or when the task handle is dropped.
      loop {
         let cmd = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            cmd = self.command_rx.recv() => match cmd {
               Some(cmd) => cmd,
               None => break,
            },
         };
         tokio::select! {
            biased;
            _ = &mut shutdown => {
               warn!("Connection worker stopped with an operation in progress");
               break;
            },
            () = self.handle_command(cmd) => {},
         }
      }

      info!("Connection worker shutting down");
      self.command_rx.close();
      self.cleanup().await;
   }

   async fn handle_command(&mut self, cmd: WorkerCommand) {
      match cmd {
         WorkerCommand::Connect {
            address,
            secure,
            service,
            reply,
         } => {
            let _ = reply.send(self.connect(address, secure, service).await);
         },
         WorkerCommand::Close { key, reply } => {
            let _ = reply.send(self.close(&key).await);
         },
         WorkerCommand::Write { key, bytes, reply } => {
            let _ = reply.send(self.write(&key, &bytes).await);
         },
         WorkerCommand::Flush { key, reply } => {
            let _ = reply.send(self.flush(&key).await);
         },
         WorkerCommand::Read { key, reply } => {
            let _ = reply.send(self.read(&key).await);
         },
         WorkerCommand::Available { key, reply } => {
            let _ = reply.send(self.available(&key).await);
         },
      }
   }

   async fn connect(&mut self, address: Address, secure: bool, service: Uuid) -> Result<Value> {
      let key = address.to_smolstr();
      let extended = self.platform.api_level() >= api_level::M;

      if let Some(existing) = self.sessions.get(&key) {
         if existing.is_connected() {
            debug!("{key}: already connected");
            return Ok(existing.to_json(extended));
         }
         // The link dropped underneath the session; release it before reconnecting.
         if let Err(e) = existing.io().await.close().await {
            warn!("{key}: failed to close stale session: {e}");
         }
      }

      // Discovery slows connection setup down considerably.
      if let Err(e) = self.platform.cancel_discovery().await {
         warn!("Failed to cancel discovery before connecting to {key}: {e}");
      }

      info!("Connecting to {key} (service {service}, secure: {secure})");
      let socket = self
         .platform
         .connect_rfcomm(address, secure, service)
         .await
         .map_err(|e| {
            warn!("Failed to connect to {key}: {e}");
            BridgeError::ConnectionFailed(e)
         })?;

      let session = Arc::new(Session::new(key.clone(), socket));
      self.sessions.insert(session.clone());
      info!("Connected to {key}");
      Ok(session.to_json(extended))
   }

   async fn close(&mut self, key: &SessionKey) -> Result<bool> {
      let Some(session) = self.sessions.get(key) else {
         return Ok(true);
      };

      // Close failures leave the session in place.
      if let Err(e) = session.io().await.close().await {
         warn!("{key}: failed to close socket: {e}");
         return Ok(false);
      }

      session.set_connected(false);
      self.sessions.remove(key);
      info!("Closed session {key}");
      Ok(true)
   }

   async fn write(&mut self, key: &SessionKey, bytes: &[u8]) -> Result<()> {
      let session = self.sessions.require(key)?;
      let mut io = session.io().await;
      debug!("→ {key}: {}", hex::encode(bytes));
      if let Err(e) = io.output()?.write(bytes).await {
         warn!("{key}: write failed: {e}");
         if is_disconnect(&e) {
            session.set_connected(false);
         }
         return Err(BridgeError::WriteOutputStream(e));
      }
      Ok(())
   }

   async fn flush(&mut self, key: &SessionKey) -> Result<()> {
      let session = self.sessions.require(key)?;
      let mut io = session.io().await;
      io.output()?
         .flush()
         .await
         .map_err(BridgeError::FlushOutputStream)
   }

   async fn read(&mut self, key: &SessionKey) -> Result<Option<u8>> {
      let session = self.sessions.require(key)?;
      let mut io = session.io().await;
      match io.input()?.read_byte().await {
         Ok(Some(byte)) => {
            debug!("← {key}: {byte:02x}");
            Ok(Some(byte))
         },
         Ok(None) => {
            info!("{key}: remote closed the stream");
            session.set_connected(false);
            Ok(None)
         },
         Err(e) => {
            warn!("{key}: read failed: {e}");
            if is_disconnect(&e) {
               session.set_connected(false);
            }
            Err(BridgeError::InputStreamRead(e))
         },
      }
   }

   async fn available(&mut self, key: &SessionKey) -> Result<usize> {
      let session = self.sessions.require(key)?;
      let mut io = session.io().await;
      io.input()?
         .available()
         .map_err(BridgeError::InputStreamAvailable)
   }

   async fn cleanup(&mut self) {
      for session in self.sessions.drain() {
         if let Err(e) = session.io().await.close().await {
            warn!("{}: failed to close socket on shutdown: {e}", session.key());
         }
      }
   }
}

fn is_disconnect(e: &std::io::Error) -> bool {
   use std::io::ErrorKind;
   matches!(
      e.kind(),
      ErrorKind::BrokenPipe
         | ErrorKind::ConnectionReset
         | ErrorKind::ConnectionAborted
         | ErrorKind::NotConnected
   )
}

#[cfg(test)]
mod tests {
   use std::{str::FromStr, time::Duration};

   use tokio::{
      io::{AsyncReadExt, AsyncWriteExt},
      time::timeout,
   };

   use super::*;
   use crate::platform::fake::{Call, FakePlatform, FakeSocket};

   const SPP: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb);

   type Table = Arc<ConnectionTable<FakeSocket>>;

   fn addr(s: &str) -> Address {
      Address::from_str(s).expect("valid address")
   }

   fn start() -> (Arc<FakePlatform>, Table, ConnectionWorker, WorkerTask) {
      let platform = Arc::new(FakePlatform::new(33));
      let sessions = Arc::new(ConnectionTable::new());
      let (worker, task) = ConnectionWorker::spawn(platform.clone(), sessions.clone(), 16);
      (platform, sessions, worker, task)
   }

   async fn open(worker: &ConnectionWorker, device: Address) -> SessionKey {
      let socket = worker.connect(device, true, SPP).await.expect("connects");
      socket["id"].as_str().expect("session id").into()
   }

   #[tokio::test]
   async fn test_connect_cancels_discovery_first() {
      let (platform, sessions, worker, _task) = start();
      platform.state.lock().discovering = true;
      let device = addr("AA:BB:CC:DD:EE:FF");

      let socket = worker.connect(device, true, SPP).await.expect("connects");

      assert_eq!(socket["id"], "AA:BB:CC:DD:EE:FF");
      assert_eq!(socket["isConnected"], true);
      assert_eq!(socket["maxTransmitPacketSize"], 990);
      assert_eq!(platform.calls(), vec![
         Call::CancelDiscovery,
         Call::Connect {
            address: device,
            secure: true,
            service: SPP,
         },
      ]);
      assert!(sessions.contains("AA:BB:CC:DD:EE:FF"));
   }

   #[tokio::test]
   async fn test_connect_reply_hides_extended_fields_on_old_levels() {
      let platform = Arc::new(FakePlatform::new(21));
      let sessions = Arc::new(ConnectionTable::new());
      let (worker, _task) = ConnectionWorker::spawn(platform, sessions, 4);

      let socket = worker
         .connect(addr("AA:BB:CC:DD:EE:FF"), false, SPP)
         .await
         .expect("connects");
      assert_eq!(socket["type"], "rfcommn");
      assert!(socket.get("connectionType").is_none());
   }

   #[tokio::test]
   async fn test_connect_is_idempotent_while_connected() {
      let (platform, sessions, worker, _task) = start();
      let device = addr("AA:BB:CC:DD:EE:FF");

      let first = worker.connect(device, false, SPP).await.expect("connects");
      let second = worker.connect(device, false, SPP).await.expect("connects");

      assert_eq!(first, second);
      assert_eq!(platform.connect_count(), 1);
      assert_eq!(sessions.len(), 1);
   }

   #[tokio::test]
   async fn test_reconnect_replaces_dropped_session() {
      let (platform, sessions, worker, _task) = start();
      let device = addr("AA:BB:CC:DD:EE:FF");

      let key = open(&worker, device).await;
      let stale = platform.take_peer(device);
      sessions.get(&key).expect("session").set_connected(false);

      worker.connect(device, false, SPP).await.expect("reconnects");
      assert_eq!(platform.connect_count(), 2);
      assert!(*stale.closed.lock());
      assert!(sessions.get(&key).expect("session").is_connected());
   }

   #[tokio::test]
   async fn test_failed_connect_leaves_table_untouched() {
      let (platform, sessions, worker, _task) = start();
      platform.state.lock().refuse_connect = true;

      let err = worker
         .connect(addr("AA:BB:CC:DD:EE:FF"), true, SPP)
         .await
         .expect_err("must fail");

      assert_eq!(err.code(), "CONNECTION_FAILED");
      assert!(sessions.is_empty());
   }

   #[tokio::test]
   async fn test_close_absent_key_succeeds() {
      let (_, _, worker, _task) = start();
      assert!(worker.close("11:22:33:44:55:66".into()).await.expect("closes"));
   }

   #[tokio::test]
   async fn test_close_removes_session() {
      let (platform, sessions, worker, _task) = start();
      let device = addr("AA:BB:CC:DD:EE:FF");
      let key = open(&worker, device).await;
      let peer = platform.take_peer(device);

      assert!(worker.close(key.clone()).await.expect("closes"));
      assert!(*peer.closed.lock());
      assert!(!sessions.contains(&key));
   }

   #[tokio::test]
   async fn test_failed_close_keeps_session() {
      let (platform, sessions, worker, _task) = start();
      let device = addr("AA:BB:CC:DD:EE:FF");
      let key = open(&worker, device).await;
      let peer = platform.take_peer(device);
      *peer.fail_close.lock() = true;

      assert!(!worker.close(key.clone()).await.expect("answers"));
      assert!(sessions.contains(&key));

      // A later close may still succeed.
      *peer.fail_close.lock() = false;
      assert!(worker.close(key.clone()).await.expect("closes"));
      assert!(!sessions.contains(&key));
   }

   #[tokio::test]
   async fn test_io_on_absent_key_is_not_found() {
      let (_, _, worker, _task) = start();
      let key: SessionKey = "11:22:33:44:55:66".into();

      let errs = [
         worker.write(key.clone(), vec![1]).await.expect_err("write"),
         worker.read(key.clone()).await.expect_err("read"),
         worker.available(key.clone()).await.expect_err("available"),
         worker.flush(key.clone()).await.expect_err("flush"),
      ];
      for err in errs {
         assert_eq!(err.code(), "SOCKET_NOT_FOUND");
      }
   }

   #[tokio::test]
   async fn test_write_and_read_round_trip_through_remote() {
      let (platform, _, worker, _task) = start();
      let device = addr("AA:BB:CC:DD:EE:FF");
      let key = open(&worker, device).await;
      let mut peer = platform.take_peer(device);

      worker.write(key.clone(), b"AT\r".to_vec()).await.expect("writes");
      worker.flush(key.clone()).await.expect("flushes");
      let mut buf = [0u8; 3];
      peer.remote.read_exact(&mut buf).await.expect("remote reads");
      assert_eq!(&buf, b"AT\r");

      peer.remote.write_all(b"OK").await.expect("remote writes");
      assert_eq!(worker.available(key.clone()).await.expect("available"), 2);
      assert_eq!(worker.read(key.clone()).await.expect("read"), Some(b'O'));
      assert_eq!(worker.read(key.clone()).await.expect("read"), Some(b'K'));

      drop(peer);
      assert_eq!(worker.read(key.clone()).await.expect("read"), None);
   }

   #[tokio::test]
   async fn test_write_to_dropped_remote_fails() {
      let (platform, _, worker, _task) = start();
      let device = addr("AA:BB:CC:DD:EE:FF");
      let key = open(&worker, device).await;
      drop(platform.take_peer(device));

      let err = worker.write(key, vec![0; 8]).await.expect_err("must fail");
      assert_eq!(err.code(), "UNABLE_TO_WRITE_TO_OUTPUT_STREAM");
   }

   #[tokio::test]
   async fn test_concurrent_writes_do_not_interleave() {
      let (platform, _, worker, _task) = start();
      let a = addr("AA:BB:CC:DD:EE:01");
      let b = addr("AA:BB:CC:DD:EE:02");
      let key_a = open(&worker, a).await;
      let key_b = open(&worker, b).await;
      let mut peer_a = platform.take_peer(a);
      let mut peer_b = platform.take_peer(b);

      let payload_a = vec![0xAA; 1024];
      let payload_b = vec![0xBB; 1024];
      let (ra, rb) = tokio::join!(
         worker.write(key_a, payload_a.clone()),
         worker.write(key_b, payload_b.clone()),
      );
      ra.expect("write a");
      rb.expect("write b");

      let mut got_a = vec![0u8; 1024];
      let mut got_b = vec![0u8; 1024];
      peer_a.remote.read_exact(&mut got_a).await.expect("read a");
      peer_b.remote.read_exact(&mut got_b).await.expect("read b");
      assert_eq!(got_a, payload_a);
      assert_eq!(got_b, payload_b);
   }

   #[tokio::test]
   async fn test_blocked_read_holds_back_other_sessions() {
      let (platform, _, worker, _task) = start();
      let a = addr("AA:BB:CC:DD:EE:01");
      let b = addr("AA:BB:CC:DD:EE:02");
      let key_a = open(&worker, a).await;
      let key_b = open(&worker, b).await;
      let mut peer_a = platform.take_peer(a);
      let mut peer_b = platform.take_peer(b);

      let read = tokio::spawn({
         let worker = worker.clone();
         async move { worker.read(key_a).await }
      });
      tokio::time::sleep(Duration::from_millis(20)).await;
      let mut write = tokio::spawn({
         let worker = worker.clone();
         async move { worker.write(key_b, vec![0x42]).await }
      });

      // The write on the idle session waits behind the read.
      assert!(timeout(Duration::from_millis(100), &mut write).await.is_err());
      let mut byte = [0u8; 1];
      assert!(
         timeout(Duration::from_millis(20), peer_b.remote.read_exact(&mut byte))
            .await
            .is_err()
      );

      peer_a.remote.write_all(&[0x07]).await.expect("remote writes");
      assert_eq!(read.await.expect("task").expect("read"), Some(0x07));
      timeout(Duration::from_secs(5), write)
         .await
         .expect("write completes")
         .expect("task")
         .expect("write");
      peer_b.remote.read_exact(&mut byte).await.expect("remote reads");
      assert_eq!(byte, [0x42]);
   }

   #[tokio::test]
   async fn test_dropping_handles_closes_remaining_sessions() {
      let (platform, sessions, worker, task) = start();
      let device = addr("AA:BB:CC:DD:EE:FF");
      open(&worker, device).await;
      let peer = platform.take_peer(device);

      drop(worker);
      timeout(Duration::from_secs(5), task.handle)
         .await
         .expect("worker stops")
         .expect("worker did not panic");

      assert!(*peer.closed.lock());
      assert!(sessions.is_empty());
   }

   #[tokio::test]
   async fn test_stop_interrupts_blocked_read() {
      let (platform, sessions, worker, task) = start();
      let device = addr("AA:BB:CC:DD:EE:FF");
      let key = open(&worker, device).await;
      let peer = platform.take_peer(device);

      let read = tokio::spawn({
         let worker = worker.clone();
         async move { worker.read(key).await }
      });
      tokio::time::sleep(Duration::from_millis(20)).await;
      let queued = tokio::spawn({
         let worker = worker.clone();
         async move { worker.available("AA:BB:CC:DD:EE:FF".into()).await }
      });
      tokio::time::sleep(Duration::from_millis(20)).await;

      timeout(Duration::from_secs(5), task.stop())
         .await
         .expect("stop completes");

      assert!(*peer.closed.lock());
      assert!(sessions.is_empty());
      let err = read.await.expect("task").expect_err("interrupted");
      assert_eq!(err.code(), "BRIDGE_SHUTDOWN");
      let err = queued.await.expect("task").expect_err("never ran");
      assert_eq!(err.code(), "BRIDGE_SHUTDOWN");
      let err = worker.flush("AA:BB:CC:DD:EE:FF".into()).await.expect_err("stopped");
      assert_eq!(err.code(), "BRIDGE_SHUTDOWN");
   }
}
