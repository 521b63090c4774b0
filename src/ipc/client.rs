//! IPC client: dials the helper and exchanges envelopes.
//!
//! One reader task per connection owns the only `receive` loop. Responses
//! are matched to pending requests by envelope id; everything else — helper
//! notifications — goes to subscriber callbacks. Concurrent outstanding
//! requests on one client are supported.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use super::connection::Connection;
use super::error::IpcError;
use super::message::Envelope;
use super::transport;

type PendingTable = Arc<StdMutex<HashMap<String, oneshot::Sender<Envelope>>>>;
type Subscriber = Arc<dyn Fn(Envelope) + Send + Sync>;
type SubscriberList = Arc<StdMutex<Vec<Subscriber>>>;

/// IPC client for one helper address.
///
/// Holds at most one connection; `connect` while connected is a no-op and
/// `disconnect` is idempotent.
pub struct Client {
    address: String,
    conn: StdMutex<Option<Arc<Connection>>>,
    pending: PendingTable,
    subscribers: SubscriberList,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client for `address` (not yet connected).
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            conn: StdMutex::new(None),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            subscribers: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// The address this client dials.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether a connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Dial the helper, bounded by `timeout`.
    ///
    /// No-op if already connected. The timeout bounds the dial only, not
    /// subsequent I/O.
    ///
    /// # Errors
    ///
    /// [`IpcError::Dial`] when the address is absent, refuses, or does not
    /// answer within `timeout`.
    pub async fn connect(&self, timeout: Duration) -> Result<(), IpcError> {
        if self.is_connected() {
            return Ok(());
        }

        let stream = tokio::time::timeout(timeout, transport::connect(&self.address))
            .await
            .map_err(|_| IpcError::dial_timeout(&self.address))?
            .map_err(|e| IpcError::dial(&self.address, e))?;
        let conn = Arc::new(Connection::new(stream));

        {
            let mut slot = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                // Lost a connect race; keep the existing connection.
                conn.close();
                return Ok(());
            }
            *slot = Some(Arc::clone(&conn));
        }

        tokio::spawn(reader_loop(
            conn,
            Arc::clone(&self.pending),
            Arc::clone(&self.subscribers),
        ));
        log::debug!("[Ipc] Connected to {}", self.address);
        Ok(())
    }

    /// Send a request and block for its correlated response.
    ///
    /// Multiple `send` calls may be outstanding concurrently; the reader
    /// task matches responses by envelope id.
    ///
    /// # Errors
    ///
    /// [`IpcError::NotConnected`] when disconnected;
    /// [`IpcError::ConnectionClosed`] when the connection ends before the
    /// response arrives.
    pub async fn send(&self, envelope: &Envelope) -> Result<Envelope, IpcError> {
        let conn = self.current_connection()?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(envelope.id.clone(), tx);

        if let Err(e) = conn.send(envelope).await {
            self.forget_pending(&envelope.id);
            return Err(e);
        }

        rx.await.map_err(|_| IpcError::ConnectionClosed)
    }

    /// [`Client::send`] bounded by a deadline.
    ///
    /// # Errors
    ///
    /// [`IpcError::Timeout`] when the response does not arrive within
    /// `timeout`; otherwise as [`Client::send`].
    pub async fn send_timeout(
        &self,
        envelope: &Envelope,
        timeout: Duration,
    ) -> Result<Envelope, IpcError> {
        match tokio::time::timeout(timeout, self.send(envelope)).await {
            Ok(result) => result,
            Err(_) => {
                self.forget_pending(&envelope.id);
                Err(IpcError::Timeout)
            }
        }
    }

    /// Write an envelope without awaiting any response.
    ///
    /// Used for requests the caller does not need acknowledged, such as
    /// `shutdown`.
    ///
    /// # Errors
    ///
    /// [`IpcError::NotConnected`] when disconnected; transport errors as
    /// [`Connection::send`].
    pub async fn send_async(&self, envelope: &Envelope) -> Result<(), IpcError> {
        let conn = self.current_connection()?;
        conn.send(envelope).await
    }

    /// Register a callback for envelopes this client did not request.
    ///
    /// Each delivery runs on its own spawned task.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Close the connection.
    ///
    /// Idempotent. Pending requests fail with
    /// [`IpcError::ConnectionClosed`]; the reader task exits on its own.
    pub fn disconnect(&self) {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(conn) = conn {
            conn.close();
            log::debug!("[Ipc] Disconnected from {}", self.address);
        }
    }

    fn current_connection(&self) -> Result<Arc<Connection>, IpcError> {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(IpcError::NotConnected)
    }

    fn forget_pending(&self, id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// The connection's only receive loop.
///
/// Envelopes whose id matches a pending request complete that request;
/// unmatched envelopes are forwarded to every subscriber. Exits when the
/// connection ends, failing all still-pending requests.
async fn reader_loop(conn: Arc<Connection>, pending: PendingTable, subscribers: SubscriberList) {
    loop {
        match conn.receive().await {
            Ok(envelope) => {
                let claimed = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&envelope.id);
                match claimed {
                    Some(tx) => {
                        // Receiver may have timed out and gone away.
                        let _ = tx.send(envelope);
                    }
                    None => {
                        let subs: Vec<Subscriber> = subscribers
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .clone();
                        for subscriber in subs {
                            let delivery = envelope.clone();
                            tokio::spawn(async move { (subscriber.as_ref())(delivery) });
                        }
                    }
                }
            }
            Err(IpcError::ConnectionClosed) => {
                log::debug!("[Ipc] Helper connection closed");
                break;
            }
            Err(e) => {
                log::warn!("[Ipc] Receive error: {e}");
                break;
            }
        }
    }

    // Mark the connection closed so later sends fail fast instead of
    // writing into a dead stream, then drop the pending senders, failing
    // every outstanding request with ConnectionClosed.
    conn.close();
    pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::MessageType;
    use crate::ipc::payload::{ErrorResponse, StatusResponse};
    use crate::ipc::server::{FnHandler, Handler, Server};
    use chrono::Utc;

    fn test_address(tmp: &tempfile::TempDir, name: &str) -> String {
        tmp.path().join(name).to_string_lossy().into_owned()
    }

    fn status_handler() -> Arc<dyn Handler> {
        Arc::new(FnHandler::new(|envelope: &Envelope| {
            match envelope.message_type {
                MessageType::GetStatus => {
                    let status = StatusResponse {
                        running: true,
                        pid: std::process::id(),
                        uptime_seconds: 1,
                        agent_count: 5,
                        updates_available: 0,
                        last_catalog_refresh: Some(Utc::now()),
                        last_update_check: None,
                    };
                    Ok(Some(Envelope::with_payload(MessageType::Success, &status)?))
                }
                _ => Ok(None),
            }
        }))
    }

    #[tokio::test]
    async fn test_send_receives_correlated_response() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = Server::new(test_address(&tmp, "rpc.sock"));
        server.set_handler(status_handler());
        server.start().await.unwrap();

        let client = Client::new(server.address());
        client.connect(Duration::from_secs(2)).await.unwrap();

        let request = Envelope::new(MessageType::GetStatus);
        let response = client
            .send_timeout(&request, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.message_type, MessageType::Success);
        assert_eq!(response.id, request.id);
        let status: StatusResponse = response.decode_payload().unwrap().unwrap();
        assert_eq!(status.agent_count, 5);

        client.disconnect();
        server.stop();
    }

    #[tokio::test]
    async fn test_send_without_connect_fails() {
        let client = Client::new("/nonexistent/helper.sock");
        let result = client.send(&Envelope::new(MessageType::GetStatus)).await;
        assert!(matches!(result, Err(IpcError::NotConnected)));

        let result = client.send_async(&Envelope::new(MessageType::Shutdown)).await;
        assert!(matches!(result, Err(IpcError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_to_absent_address_is_dial_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let client = Client::new(test_address(&tmp, "nobody-home.sock"));
        let result = client.connect(Duration::from_millis(500)).await;
        assert!(matches!(result, Err(IpcError::Dial { .. })));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_twice_is_noop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = Server::new(test_address(&tmp, "twice.sock"));
        server.start().await.unwrap();

        let client = Client::new(server.address());
        client.connect(Duration::from_secs(2)).await.unwrap();
        client.connect(Duration::from_secs(2)).await.unwrap();
        assert!(client.is_connected());

        client.disconnect();
        client.disconnect(); // idempotent
        assert!(!client.is_connected());

        server.stop();
    }

    #[tokio::test]
    async fn test_send_timeout_enforces_deadline() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = Server::new(test_address(&tmp, "slow.sock"));
        // Handler never answers.
        server.set_handler(Arc::new(FnHandler::new(|_envelope: &Envelope| Ok(None))));
        server.start().await.unwrap();

        let client = Client::new(server.address());
        client.connect(Duration::from_secs(2)).await.unwrap();

        let started = std::time::Instant::now();
        let result = client
            .send_timeout(&Envelope::new(MessageType::GetStatus), Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(IpcError::Timeout)));
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "timeout must fire within the deadline window"
        );

        client.disconnect();
        server.stop();
    }

    #[tokio::test]
    async fn test_concurrent_outstanding_requests() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = Server::new(test_address(&tmp, "multi.sock"));
        server.set_handler(Arc::new(FnHandler::new(|envelope: &Envelope| {
            let error = ErrorResponse {
                code: "echo".to_string(),
                message: envelope.id.clone(),
                details: None,
            };
            Ok(Some(Envelope::with_payload(MessageType::Error, &error)?))
        })));
        server.start().await.unwrap();

        let client = Arc::new(Client::new(server.address()));
        client.connect(Duration::from_secs(2)).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let client = Arc::clone(&client);
            tasks.push(tokio::spawn(async move {
                let request = Envelope::new(MessageType::GetStatus);
                let response = client
                    .send_timeout(&request, Duration::from_secs(2))
                    .await
                    .unwrap();
                let error: ErrorResponse = response.decode_payload().unwrap().unwrap();
                assert_eq!(
                    error.message, request.id,
                    "each request gets its own response back"
                );
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        client.disconnect();
        server.stop();
    }

    #[tokio::test]
    async fn test_subscriber_receives_unmatched_envelopes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = Server::new(test_address(&tmp, "notify.sock"));
        server.start().await.unwrap();

        let client = Client::new(server.address());
        client.connect(Duration::from_secs(2)).await.unwrap();

        let (notify_tx, mut notify_rx) = tokio::sync::mpsc::unbounded_channel();
        client.subscribe(move |envelope| {
            let _ = notify_tx.send(envelope);
        });

        // Nudge the accept loop so the connection is registered.
        client
            .send_async(&Envelope::new(MessageType::GetStatus))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let notification = Envelope::new(MessageType::UpdateAvailable);
        server.broadcast(&notification).await;

        let delivered = tokio::time::timeout(Duration::from_secs(2), notify_rx.recv())
            .await
            .expect("Timed out waiting for notification")
            .expect("Channel closed");
        assert_eq!(delivered.message_type, MessageType::UpdateAvailable);
        assert_eq!(delivered.id, notification.id);

        client.disconnect();
        server.stop();
    }

    #[tokio::test]
    async fn test_server_stop_fails_pending_send() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = Arc::new(Server::new(test_address(&tmp, "cutoff.sock")));
        server.set_handler(Arc::new(FnHandler::new(|_envelope: &Envelope| Ok(None))));
        server.start().await.unwrap();

        let client = Client::new(server.address());
        client.connect(Duration::from_secs(2)).await.unwrap();

        let stopper = Arc::clone(&server);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.stop();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            client.send(&Envelope::new(MessageType::GetStatus)),
        )
        .await
        .expect("Timed out");
        assert!(matches!(result, Err(IpcError::ConnectionClosed)));
    }
}
