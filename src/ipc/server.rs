//! IPC server: accepts client connections and dispatches envelopes to a
//! pluggable [`Handler`].
//!
//! One accept-loop task plus one task per accepted connection. The handler
//! is the single boundary to the rest of the helper (catalog, detector,
//! installer, storage); this module never looks inside payloads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::connection::Connection;
use super::error::IpcError;
use super::message::Envelope;
use super::transport;

/// How long the stale-address probe waits for a live peer to answer.
const STALE_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause after a transient accept error before retrying.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Business-logic entry point for decoded envelopes.
///
/// Returning `Ok(None)` sends no response (fire-and-forget requests such as
/// `shutdown`). Returning `Err` produces an `error` response envelope with
/// code `handler_error`; it never tears down the connection.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one envelope, optionally producing a response.
    async fn handle_message(&self, envelope: &Envelope) -> anyhow::Result<Option<Envelope>>;
}

/// Adapter turning a plain function into a [`Handler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&Envelope) -> anyhow::Result<Option<Envelope>> + Send + Sync,
{
    /// Wrap `f` as a [`Handler`].
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> std::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&Envelope) -> anyhow::Result<Option<Envelope>> + Send + Sync,
{
    async fn handle_message(&self, envelope: &Envelope) -> anyhow::Result<Option<Envelope>> {
        (self.0)(envelope)
    }
}

type HandlerSlot = Arc<RwLock<Option<Arc<dyn Handler>>>>;
type Registry = Arc<StdMutex<HashMap<u64, Arc<Connection>>>>;

/// IPC server bound to one local address.
///
/// `start` is non-blocking; `stop` is idempotent and a later `start` creates
/// a fresh listener at the same address.
pub struct Server {
    address: String,
    handler: HandlerSlot,
    running: Arc<AtomicBool>,
    connections: Registry,
    shutdown: StdMutex<Option<watch::Sender<bool>>>,
    next_conn_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.address)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create a server for `address` with no handler installed.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            handler: Arc::new(RwLock::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            connections: Arc::new(StdMutex::new(HashMap::new())),
            shutdown: StdMutex::new(None),
            next_conn_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Install or swap the handler.
    ///
    /// Safe while running; affects only messages processed after the swap,
    /// never messages already in flight.
    pub fn set_handler(&self, handler: Arc<dyn Handler>) {
        *self
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Whether `start` has succeeded and `stop` has not yet run.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The address this server binds.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Recover a stale address, bind, and launch the accept loop.
    ///
    /// Non-blocking: returns once the listener is bound.
    ///
    /// # Errors
    ///
    /// [`IpcError::AlreadyRunning`] if this server is already started or a
    /// live peer owns the address; [`IpcError::Transport`] on bind failure.
    pub async fn start(&self) -> Result<(), IpcError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(IpcError::AlreadyRunning(self.address.clone()));
        }
        match self.bind_and_spawn().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn bind_and_spawn(&self) -> Result<(), IpcError> {
        recover_stale_address(&self.address).await?;

        let listener = transport::bind(&self.address).map_err(IpcError::Transport)?;
        log::info!("[Ipc] Server listening on {}", self.address);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(shutdown_tx);

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.connections),
            Arc::clone(&self.handler),
            Arc::clone(&self.next_conn_id),
            shutdown_rx,
        ));
        Ok(())
    }

    /// Stop the server.
    ///
    /// Idempotent: a no-op when not running. Terminates the accept loop,
    /// closes every registered connection (unblocking their loops), and
    /// clears the registry. Does not wait for in-flight handler calls; a
    /// late response send on a closing connection fails silently.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(tx) = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(true);
        }

        let drained: Vec<Arc<Connection>> = {
            let mut registry = self
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            registry.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &drained {
            conn.close();
        }

        let _ = transport::remove_address(&self.address);
        log::info!(
            "[Ipc] Server stopped, {} connection(s) closed",
            drained.len()
        );
    }

    /// Best-effort send of `envelope` to every registered connection.
    ///
    /// This is the helper's notification push path; per-connection failures
    /// are logged and skipped.
    pub async fn broadcast(&self, envelope: &Envelope) {
        let conns: Vec<(u64, Arc<Connection>)> = {
            let registry = self
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            registry.iter().map(|(id, c)| (*id, Arc::clone(c))).collect()
        };
        for (conn_id, conn) in conns {
            if let Err(e) = conn.send(envelope).await {
                log::debug!("[Ipc] Broadcast to connection {conn_id} failed: {e}");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pre-flight check for an address left behind by a crashed helper.
///
/// Absent address: bind normally. Present address: a short dial probe
/// decides — success means a live peer owns it, failure means an orphan to
/// remove. Check-then-remove is inherently racy against a concurrently
/// starting peer and stays best-effort, not a lock.
async fn recover_stale_address(address: &str) -> Result<(), IpcError> {
    if !transport::address_exists(address) {
        return Ok(());
    }
    match tokio::time::timeout(STALE_PROBE_TIMEOUT, transport::connect(address)).await {
        Ok(Ok(_live)) => Err(IpcError::AlreadyRunning(address.to_string())),
        Ok(Err(_)) | Err(_) => {
            log::info!("[Ipc] Removing stale socket: {address}");
            transport::remove_address(address).map_err(IpcError::Transport)?;
            Ok(())
        }
    }
}

/// Accept loop — runs as its own task until shutdown.
///
/// Transient accept errors are swallowed with a short pause; one bad accept
/// must not kill the server.
async fn accept_loop(
    listener: transport::Listener,
    connections: Registry,
    handler: HandlerSlot,
    next_conn_id: Arc<AtomicU64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                log::debug!("[Ipc] Accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                    let conn = Arc::new(Connection::new(stream));
                    connections
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(conn_id, Arc::clone(&conn));
                    log::info!("[Ipc] Client connected: {conn_id}");
                    tokio::spawn(connection_loop(
                        conn_id,
                        conn,
                        Arc::clone(&connections),
                        Arc::clone(&handler),
                    ));
                }
                Err(e) => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    log::warn!("[Ipc] Accept error: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }
}

/// Per-connection loop — receives envelopes until the connection ends.
///
/// Deregistration is deferred so it runs on every exit path.
async fn connection_loop(
    conn_id: u64,
    conn: Arc<Connection>,
    connections: Registry,
    handler: HandlerSlot,
) {
    scopeguard::defer! {
        connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conn_id);
    }

    loop {
        match conn.receive().await {
            Ok(envelope) => dispatch(conn_id, &conn, envelope, &handler).await,
            Err(IpcError::ConnectionClosed) => {
                log::info!("[Ipc] Client disconnected: {conn_id}");
                break;
            }
            Err(e) => {
                log::warn!("[Ipc] Receive error on connection {conn_id}: {e}");
                break;
            }
        }
    }
}

/// Route one envelope through the current handler and send any response.
async fn dispatch(conn_id: u64, conn: &Connection, envelope: Envelope, handler: &HandlerSlot) {
    // Snapshot under the read lock; a concurrent set_handler affects only
    // later messages.
    let snapshot = handler
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    let Some(active) = snapshot else {
        log::debug!(
            "[Ipc] No handler installed, dropping {} message",
            envelope.message_type
        );
        return;
    };

    let response = match active.handle_message(&envelope).await {
        Ok(response) => response,
        Err(e) => Some(Envelope::error_response("handler_error", &e.to_string())),
    };

    if let Some(mut response) = response {
        // Correlate the response to its request for the client demultiplexer.
        response.id = envelope.id;
        if let Err(e) = conn.send(&response).await {
            log::debug!("[Ipc] Failed to send response on connection {conn_id}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::MessageType;
    use crate::ipc::payload::ErrorResponse;

    fn test_address(tmp: &tempfile::TempDir, name: &str) -> String {
        tmp.path().join(name).to_string_lossy().into_owned()
    }

    async fn dial(address: &str) -> Arc<Connection> {
        let stream = transport::connect(address).await.unwrap();
        Arc::new(Connection::new(stream))
    }

    #[tokio::test]
    async fn test_start_binds_and_stop_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = Server::new(test_address(&tmp, "basic.sock"));

        server.start().await.unwrap();
        assert!(server.is_running());

        server.stop();
        assert!(!server.is_running());
        server.stop(); // second stop: no error, no panic
    }

    #[tokio::test]
    async fn test_second_start_while_running_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = Server::new(test_address(&tmp, "double.sock"));
        server.start().await.unwrap();

        let result = server.start().await;
        assert!(matches!(result, Err(IpcError::AlreadyRunning(_))));
        assert!(server.is_running());

        server.stop();
    }

    #[tokio::test]
    async fn test_two_servers_same_address() {
        let tmp = tempfile::TempDir::new().unwrap();
        let address = test_address(&tmp, "shared.sock");

        let first = Server::new(address.clone());
        first.start().await.unwrap();

        let second = Server::new(address);
        let result = second.start().await;
        assert!(matches!(result, Err(IpcError::AlreadyRunning(_))));
        assert!(first.is_running(), "first server must be unaffected");

        first.stop();
    }

    #[tokio::test]
    async fn test_stale_socket_is_recovered() {
        let tmp = tempfile::TempDir::new().unwrap();
        let address = test_address(&tmp, "stale.sock");

        // Simulate the artifact a crashed helper leaves behind.
        std::fs::write(&address, b"").unwrap();

        let server = Server::new(address.clone());
        server.start().await.unwrap();
        assert!(server.is_running());

        server.stop();
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = Server::new(test_address(&tmp, "restart.sock"));

        server.start().await.unwrap();
        server.stop();
        server.start().await.unwrap();
        assert!(server.is_running());

        let conn = dial(server.address()).await;
        conn.send(&Envelope::new(MessageType::GetStatus)).await.unwrap();

        server.stop();
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_response() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = Server::new(test_address(&tmp, "boom.sock"));
        server.set_handler(Arc::new(FnHandler::new(|_envelope: &Envelope| {
            anyhow::bail!("boom")
        })));
        server.start().await.unwrap();

        let conn = dial(server.address()).await;
        let request = Envelope::new(MessageType::GetStatus);
        conn.send(&request).await.unwrap();

        let response = tokio::time::timeout(Duration::from_secs(2), conn.receive())
            .await
            .expect("Timed out")
            .unwrap();
        assert_eq!(response.message_type, MessageType::Error);
        assert_eq!(response.id, request.id, "response echoes the request id");
        let error: ErrorResponse = response.decode_payload().unwrap().unwrap();
        assert_eq!(error.code, "handler_error");
        assert_eq!(error.message, "boom");

        // The connection survives a handler error.
        conn.send(&Envelope::new(MessageType::GetStatus)).await.unwrap();
        let again = tokio::time::timeout(Duration::from_secs(2), conn.receive())
            .await
            .expect("Timed out")
            .unwrap();
        assert_eq!(again.message_type, MessageType::Error);

        server.stop();
    }

    #[tokio::test]
    async fn test_no_handler_drops_message_without_crash() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = Server::new(test_address(&tmp, "nohandler.sock"));
        server.start().await.unwrap();

        let conn = dial(server.address()).await;
        conn.send(&Envelope::new(MessageType::GetStatus)).await.unwrap();

        // No response must arrive.
        conn.set_deadline(Some(tokio::time::Instant::now() + Duration::from_millis(200)));
        let result = conn.receive().await;
        assert!(matches!(result, Err(IpcError::Timeout)));
        assert!(server.is_running());

        server.stop();
    }

    #[tokio::test]
    async fn test_none_response_sends_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = Server::new(test_address(&tmp, "fire.sock"));
        server.set_handler(Arc::new(FnHandler::new(|_envelope: &Envelope| Ok(None))));
        server.start().await.unwrap();

        let conn = dial(server.address()).await;
        conn.send(&Envelope::new(MessageType::Shutdown)).await.unwrap();

        conn.set_deadline(Some(tokio::time::Instant::now() + Duration::from_millis(200)));
        assert!(matches!(conn.receive().await, Err(IpcError::Timeout)));

        server.stop();
    }

    #[tokio::test]
    async fn test_set_handler_swaps_at_runtime() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = Server::new(test_address(&tmp, "swap.sock"));
        server.set_handler(Arc::new(FnHandler::new(|envelope: &Envelope| {
            Ok(Some(Envelope::error_response("first", envelope.message_type.as_str())))
        })));
        server.start().await.unwrap();

        let conn = dial(server.address()).await;
        conn.send(&Envelope::new(MessageType::GetStatus)).await.unwrap();
        let response = conn.receive().await.unwrap();
        let error: ErrorResponse = response.decode_payload().unwrap().unwrap();
        assert_eq!(error.code, "first");

        server.set_handler(Arc::new(FnHandler::new(|envelope: &Envelope| {
            Ok(Some(Envelope::error_response("second", envelope.message_type.as_str())))
        })));
        conn.send(&Envelope::new(MessageType::GetStatus)).await.unwrap();
        let response = conn.receive().await.unwrap();
        let error: ErrorResponse = response.decode_payload().unwrap().unwrap();
        assert_eq!(error.code, "second");

        server.stop();
    }

    #[tokio::test]
    async fn test_stop_closes_registered_connections() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = Server::new(test_address(&tmp, "teardown.sock"));
        server.start().await.unwrap();

        let first = dial(server.address()).await;
        let second = dial(server.address()).await;
        // Let the accept loop register both.
        first.send(&Envelope::new(MessageType::GetStatus)).await.unwrap();
        second.send(&Envelope::new(MessageType::GetStatus)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        server.stop();

        for conn in [first, second] {
            let result = tokio::time::timeout(Duration::from_secs(2), conn.receive())
                .await
                .expect("Timed out");
            assert!(
                matches!(result, Err(IpcError::ConnectionClosed)),
                "receive after stop must report a closed transport"
            );
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_connections() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = Server::new(test_address(&tmp, "bcast.sock"));
        server.start().await.unwrap();

        let first = dial(server.address()).await;
        let second = dial(server.address()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let notification = Envelope::new(MessageType::UpdateAvailable);
        server.broadcast(&notification).await;

        for conn in [first, second] {
            let envelope = tokio::time::timeout(Duration::from_secs(2), conn.receive())
                .await
                .expect("Timed out")
                .unwrap();
            assert_eq!(envelope.message_type, MessageType::UpdateAvailable);
        }

        server.stop();
    }
}
