//! Client transport: one logical connection with automatic recovery.
//!
//! [`RpcClient::call`] sends a request envelope and suspends the caller until
//! exactly one of: the matching result/fault arrives, the call times out, or
//! the link is lost. A background reader task per link correlates responses
//! by id, so many calls can be in flight on the same connection.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──▶ Connected
//!      ▲                          │              │ link lost
//!      │ budget exhausted         ▼              ▼
//!      └──────────────── DisconnectedPendingRetry ◀┘
//! ```
//!
//! `disconnect()` passes through `Closing` and ends in `Disconnected`
//! without any retry.

use super::pending::{PendingCall, PendingCalls};
use crate::cancel::CancellationToken;
use crate::config::ClientConfig;
use crate::protocol::{decode, encode, read_frame, write_frame, Body, Envelope, FaultCode};
use crate::{FacetError, Result};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Connection state of a client transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    DisconnectedPendingRetry,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Closing => write!(f, "CLOSING"),
            ConnectionState::DisconnectedPendingRetry => write!(f, "DISCONNECTED_PENDING_RETRY"),
        }
    }
}

/// Lifecycle notifications, see [`RpcClient::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected,
    /// The link went away without `disconnect()` being called.
    LinkLost { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    Reconnected { attempt: u32 },
    /// Terminal: the reconnection budget is spent.
    ReconnectFailed { attempts: u32 },
    /// `disconnect()` completed.
    Closed,
}

/// One established connection. Replaced wholesale on reconnect.
#[derive(Debug, Clone)]
struct Link {
    id: u64,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    /// Cancelled when this link is torn down.
    token: CancellationToken,
}

impl Link {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        // An earlier write may have been cut off mid-frame.
        if self.token.is_cancelled() {
            return Err(lost_link());
        }
        write_frame(&mut *writer, payload).await
    }
}

#[derive(Debug)]
struct ClientInner {
    addr: String,
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<LifecycleEvent>,
    link: Mutex<Option<Link>>,
    pending: PendingCalls,
    /// Cancelled by `disconnect()`; stops any scheduled reconnection.
    session: Mutex<CancellationToken>,
    /// Held for the whole of `connect()` so attempts never overlap.
    connecting: tokio::sync::Mutex<()>,
    next_link_id: AtomicU64,
    discarded: AtomicU64,
}

/// Client side of the transport. Cheap to clone; clones share the connection.
#[derive(Debug, Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Create a client for `addr` (`host:port`). Does not connect.
    pub fn new(addr: impl Into<String>, config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) =
            broadcast::channel(crate::config::TransportConfig::EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ClientInner {
                addr: addr.into(),
                config,
                state,
                events,
                link: Mutex::new(None),
                pending: PendingCalls::new(),
                session: Mutex::new(CancellationToken::new()),
                connecting: tokio::sync::Mutex::new(()),
                next_link_id: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Create a client and connect it.
    pub async fn connect_to(addr: impl Into<String>, config: ClientConfig) -> Result<Self> {
        let client = Self::new(addr, config);
        client.connect().await?;
        Ok(client)
    }

    /// Establish the connection.
    ///
    /// A failed first attempt is retried under the reconnect policy; the
    /// error of the first attempt is returned once the budget is spent.
    /// Concurrent calls wait for the attempt in progress and share its link.
    pub async fn connect(&self) -> Result<()> {
        let _connecting = self.inner.connecting.lock().await;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        // A fresh session supersedes any reconnection loop still running.
        let session = CancellationToken::new();
        let previous = std::mem::replace(&mut *self.inner.session(), session.clone());
        previous.cancel();

        self.inner.set_state(ConnectionState::Connecting);
        match self.inner.open_link(&session).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Connecting to {} failed: {}", self.inner.addr, e);
                self.inner.reconnect(&session).await;
                if self.state() == ConnectionState::Connected {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Close the connection on purpose.
    ///
    /// Cancels any scheduled reconnection, rejects every pending call with
    /// `ConnectionLost`, and leaves the client `Disconnected`.
    pub async fn disconnect(&self) {
        self.inner.session().cancel();
        self.inner.set_state(ConnectionState::Closing);

        let link = self.inner.take_link();
        if let Some(link) = link {
            link.token.cancel();
            let mut writer = link.writer.lock().await;
            let _ = writer.shutdown().await;
        }

        let rejected = self.inner.pending.fail_all(|| FacetError::ConnectionLost {
            reason: "client disconnected".to_string(),
        });
        if rejected > 0 {
            debug!("Rejected {} pending calls on disconnect", rejected);
        }

        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.emit(LifecycleEvent::Closed);
        info!("Disconnected from {}", self.inner.addr);
    }

    /// Call `operation` with the configured default timeout.
    pub async fn call(&self, operation: &str, arguments: Value) -> Result<Value> {
        self.call_with_timeout(operation, arguments, None).await
    }

    /// Call `operation`, giving up after `timeout` (or the default timeout).
    ///
    /// Fails fast with `NotConnected` unless the client is connected.
    pub async fn call_with_timeout(
        &self,
        operation: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let link = self.inner.current_link().ok_or(FacetError::NotConnected)?;
        let timeout = timeout.unwrap_or(self.inner.config.default_timeout);

        let envelope = Envelope::request(operation, arguments);
        let id = envelope.id.clone();
        let payload = encode(&envelope)?;

        let (pending, mut rx) = PendingCall::new(operation, timeout, link.token.clone());
        let deadline = pending.deadline;
        let link_closed = pending.link.clone();
        self.inner.pending.register(id.clone(), pending)?;
        let _abandoned = self.inner.pending.guard(&id);

        let sent = tokio::select! {
            biased;
            sent = link.send(&payload) => Some(sent),
            _ = link_closed.cancelled() => Some(Err(lost_link())),
            _ = tokio::time::sleep_until(deadline) => None,
        };

        match sent {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                if self.inner.pending.remove(&id).is_some() {
                    return Err(FacetError::ConnectionLost {
                        reason: format!("send failed: {}", e),
                    });
                }
                // Teardown got there first and already rejected the call.
                return rx.await.unwrap_or_else(|_| Err(dropped()));
            }
            None => {
                // The frame may be half written; the reader tears the link down.
                warn!(
                    "Call {} ({}) could not be sent within {:?}, aborting link to {}",
                    id, operation, timeout, self.inner.addr
                );
                link.token.cancel();
                if self.inner.pending.remove(&id).is_some() {
                    return Err(FacetError::Timeout(timeout));
                }
                return rx.await.unwrap_or_else(|_| Err(dropped()));
            }
        }

        enum Wake {
            Outcome(Result<Value>),
            Deadline,
            LinkClosed,
        }

        let wake = tokio::select! {
            biased;
            outcome = &mut rx => Wake::Outcome(outcome.unwrap_or_else(|_| Err(dropped()))),
            _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
            _ = link_closed.cancelled() => Wake::LinkClosed,
        };

        match wake {
            Wake::Outcome(outcome) => outcome,
            Wake::Deadline => match self.inner.pending.remove(&id) {
                Some(_) => {
                    debug!("Call {} ({}) timed out after {:?}", id, operation, timeout);
                    Err(FacetError::Timeout(timeout))
                }
                None => rx.await.unwrap_or_else(|_| Err(dropped())),
            },
            Wake::LinkClosed => match self.inner.pending.remove(&id) {
                Some(_) => Err(lost_link()),
                None => rx.await.unwrap_or_else(|_| Err(dropped())),
            },
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    /// Number of calls awaiting a terminal outcome.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Responses that matched no pending call (late, duplicate or unknown).
    pub fn discarded_responses(&self) -> u64 {
        self.inner.discarded.load(Ordering::Relaxed)
    }

    /// Address this client connects to.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }
}

fn dropped() -> FacetError {
    FacetError::ConnectionLost {
        reason: "call abandoned by transport".to_string(),
    }
}

fn lost_link() -> FacetError {
    FacetError::ConnectionLost {
        reason: "link closed".to_string(),
    }
}

impl ClientInner {
    fn session(&self) -> MutexGuard<'_, CancellationToken> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn link_slot(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_link(&self) -> Option<Link> {
        if *self.state.borrow() != ConnectionState::Connected {
            return None;
        }
        self.link_slot().clone()
    }

    fn take_link(&self) -> Option<Link> {
        self.link_slot().take()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Client {} state {} -> {}", self.addr, previous, state);
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Dial the server and install a new link with its reader task.
    async fn open_link(self: &Arc<Self>, session: &CancellationToken) -> Result<()> {
        let connect = TcpStream::connect(self.addr.as_str());
        let stream = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| FacetError::ConnectFailed {
                addr: self.addr.clone(),
                message: format!("timed out after {:?}", self.config.connect_timeout),
            })?
            .map_err(|e| FacetError::ConnectFailed {
                addr: self.addr.clone(),
                message: e.to_string(),
            })?;

        if session.is_cancelled() {
            return Err(FacetError::NotConnected);
        }

        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let link = Link {
            id: self.next_link_id.fetch_add(1, Ordering::Relaxed) + 1,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            token: CancellationToken::new(),
        };

        let replaced = self.link_slot().replace(link.clone());
        if let Some(stale) = replaced {
            stale.token.cancel();
        }
        self.set_state(ConnectionState::Connected);
        self.emit(LifecycleEvent::Connected);
        info!("Connected to {}", self.addr);

        spawn_reader(self.clone(), reader, link);
        Ok(())
    }

    /// Run the reconnect schedule until a link is up, the session is
    /// cancelled, or the attempt budget is exhausted.
    async fn reconnect(self: &Arc<Self>, session: &CancellationToken) {
        let policy = &self.config.reconnect;

        for (attempt, delay) in policy.schedule() {
            if session.is_cancelled() {
                return;
            }
            self.set_state(ConnectionState::DisconnectedPendingRetry);
            self.emit(LifecycleEvent::Reconnecting { attempt, delay });
            info!(
                "Reconnecting to {} in {:?} (attempt {}/{})",
                self.addr, delay, attempt, policy.max_attempts
            );

            tokio::select! {
                _ = session.cancelled() => {
                    debug!("Reconnection to {} cancelled", self.addr);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            self.set_state(ConnectionState::Connecting);
            match self.open_link(session).await {
                Ok(()) => {
                    self.emit(LifecycleEvent::Reconnected { attempt });
                    return;
                }
                Err(e) => warn!(
                    "Reconnect attempt {}/{} to {} failed: {}",
                    attempt, policy.max_attempts, self.addr, e
                ),
            }
        }

        if session.is_cancelled() {
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        self.emit(LifecycleEvent::ReconnectFailed {
            attempts: policy.max_attempts,
        });
        warn!(
            "Giving up on {} after {} reconnect attempts",
            self.addr, policy.max_attempts
        );
    }

    /// Tear down `link` after it failed, then start the reconnect policy.
    async fn link_lost(self: &Arc<Self>, link: &Link, reason: String) {
        let is_current = {
            let mut slot = self.link_slot();
            if slot.as_ref().map(|l| l.id) == Some(link.id) {
                slot.take();
                true
            } else {
                false
            }
        };
        if !is_current {
            // Replaced or closed on purpose; nothing left to clean up.
            return;
        }

        link.token.cancel();
        let rejected = self.pending.fail_all(|| FacetError::ConnectionLost {
            reason: reason.clone(),
        });
        warn!(
            "Link to {} lost ({}), rejected {} pending calls",
            self.addr, reason, rejected
        );
        self.emit(LifecycleEvent::LinkLost {
            reason: reason.clone(),
        });

        let session = self.session().clone();
        if session.is_cancelled() {
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        self.set_state(ConnectionState::DisconnectedPendingRetry);
        self.reconnect(&session).await;
    }

    /// Correlate one inbound frame.
    ///
    /// Returns the message of a connection-scoped fault, which explains a
    /// close that follows it directly (e.g. the server's connection limit).
    fn handle_frame(&self, bytes: &[u8]) -> Option<String> {
        let envelope = match decode(bytes) {
            Ok(envelope) => envelope,
            Err(fault) => {
                warn!("Discarding malformed message from {}: {}", self.addr, fault);
                self.discarded.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let kind = envelope.kind();
        let mut connection_fault = None;
        let outcome = match envelope.body {
            Body::Result { value, ok: true, .. } => Ok(value),
            Body::Result { value, ok: false, .. } => Err(handler_failure(value)),
            Body::Fault {
                operation,
                message,
                fault_code,
            } => {
                if operation.is_none() {
                    connection_fault = Some(format!("{}: {}", fault_code, message));
                }
                Err(FacetError::Fault {
                    code: fault_code,
                    message,
                })
            }
            Body::Request { operation, .. } => {
                debug!("Ignoring request for {} sent by server {}", operation, self.addr);
                self.discarded.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match self.pending.remove(&envelope.id) {
            Some(call) if call.is_overdue() => {
                debug!(
                    "Response for {} ({}) arrived past its deadline",
                    envelope.id, call.operation
                );
                let timeout = call.timeout;
                call.resolve(Err(FacetError::Timeout(timeout)));
            }
            Some(call) => call.resolve(outcome),
            None => {
                let total = self.discarded.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    "Discarding unmatched {} {} from {} ({} discarded so far)",
                    kind, envelope.id, self.addr, total
                );
            }
        }

        connection_fault
    }
}

/// Convert the value of an `ok=false` result into a fault error.
fn handler_failure(value: Value) -> FacetError {
    let code = value
        .get("errorType")
        .and_then(Value::as_str)
        .map(FaultCode::from)
        .unwrap_or(FaultCode::HandlerError);
    let message = match &value {
        Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| other.to_string()),
    };
    FacetError::fault(code, message)
}

/// Start the reader task for a freshly opened link.
///
/// The reader may reconnect, which opens a link and spawns the next reader,
/// so the future is boxed to give the cycle a nameable type.
fn spawn_reader(inner: Arc<ClientInner>, reader: OwnedReadHalf, link: Link) {
    let task: Pin<Box<dyn Future<Output = ()> + Send>> =
        Box::pin(read_loop(inner, reader, link));
    tokio::spawn(task);
}

async fn read_loop(inner: Arc<ClientInner>, mut reader: OwnedReadHalf, link: Link) {
    let max_size = inner.config.max_message_size;
    let mut close_reason: Option<String> = None;

    let reason = loop {
        let frame = tokio::select! {
            biased;
            // Already taken down by whoever cancelled it, unless a call
            // aborted it after a cut-off write.
            _ = link.token.cancelled() => break "link aborted".to_string(),
            frame = read_frame(&mut reader, max_size) => frame,
        };

        match frame {
            Ok(Some(bytes)) => close_reason = inner.handle_frame(&bytes),
            Ok(None) => {
                break close_reason.unwrap_or_else(|| "connection closed by peer".to_string())
            }
            Err(e) => break e.to_string(),
        }
    };

    inner.link_lost(&link, reason).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use crate::transport::ReconnectPolicy;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    fn quick_config() -> ClientConfig {
        ClientConfig::new()
            .with_default_timeout(Duration::from_secs(2))
            .with_reconnect(ReconnectPolicy::disabled())
    }

    async fn read_request(stream: &mut TcpStream) -> Envelope {
        let bytes = read_frame(stream, 1024 * 1024).await.unwrap().unwrap();
        decode(&bytes).unwrap()
    }

    async fn reply(stream: &mut TcpStream, envelope: &Envelope) {
        write_frame(stream, &encode(envelope).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_call_before_connect_fails_fast() {
        let client = RpcClient::new("127.0.0.1:1", quick_config());
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let err = client.call("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, FacetError::NotConnected));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_to_dead_server_fails() {
        let client = RpcClient::new("127.0.0.1:1", quick_config());
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, FacetError::ConnectFailed { .. }));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_result_and_failures_are_correlated() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for _ in 0..3 {
                let req = read_request(&mut stream).await;
                let response = match req.operation() {
                    Some("ok") => Envelope::result(req.id.clone(), "ok", json!({"x": 1}), true),
                    Some("fails") => Envelope::result(
                        req.id.clone(),
                        "fails",
                        json!({"message": "bad input", "errorType": "invalid-arguments"}),
                        false,
                    ),
                    _ => Envelope::fault(
                        req.id.clone(),
                        req.operation().map(String::from),
                        FaultCode::UnknownOperation,
                        "Unknown operation",
                    ),
                };
                reply(&mut stream, &response).await;
            }
            stream
        });

        let client = RpcClient::connect_to(addr, quick_config()).await.unwrap();

        assert_eq!(client.call("ok", json!({})).await.unwrap(), json!({"x": 1}));

        match client.call("fails", json!({})).await.unwrap_err() {
            FacetError::Fault { code, message } => {
                assert_eq!(code, FaultCode::InvalidArguments);
                assert_eq!(message, "bad input");
            }
            other => panic!("Expected Fault, got: {:?}", other),
        }

        match client.call("bogus", json!({})).await.unwrap_err() {
            FacetError::Fault { code, .. } => assert_eq!(code, FaultCode::UnknownOperation),
            other => panic!("Expected Fault, got: {:?}", other),
        }

        assert_eq!(client.pending_count(), 0);
        let _stream = server.await.unwrap();
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_unmatched_response_is_discarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let req = read_request(&mut stream).await;
            reply(&mut stream, &Envelope::result("stranger", "echo", json!(0), true)).await;
            write_frame(&mut stream, b"garbage").await.unwrap();
            reply(&mut stream, &Envelope::result(req.id.clone(), "echo", json!(1), true)).await;
            stream
        });

        let client = RpcClient::connect_to(addr, quick_config()).await.unwrap();
        assert_eq!(client.call("echo", json!({})).await.unwrap(), json!(1));
        assert_eq!(client.discarded_responses(), 2);
        assert_eq!(client.state(), ConnectionState::Connected);

        let _stream = server.await.unwrap();
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_link_loss_rejects_pending_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for _ in 0..3 {
                read_request(&mut stream).await;
            }
            // Drop the connection with all three unanswered.
            drop(stream);
        });

        let client = RpcClient::connect_to(addr, quick_config()).await.unwrap();
        let mut events = client.subscribe();

        let calls: Vec<_> = (0..3)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move { client.call("slow", json!({ "i": i })).await })
            })
            .collect();

        server.await.unwrap();
        for call in calls {
            let result = call.await.unwrap();
            assert!(
                matches!(result, Err(FacetError::ConnectionLost { .. })),
                "got {:?}",
                result
            );
        }
        assert_eq!(client.pending_count(), 0);

        let event = events.recv().await.unwrap();
        assert!(matches!(event, LifecycleEvent::LinkLost { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::ReconnectFailed { attempts: 0 }
        );
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_and_does_not_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_request(&mut stream).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let config = quick_config().with_reconnect(
            ReconnectPolicy::new()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(10)),
        );
        let client = RpcClient::connect_to(addr, config).await.unwrap();
        let mut events = client.subscribe();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.call("slow", json!({})).await })
        };
        while client.pending_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        client.disconnect().await;

        assert!(matches!(
            pending.await.unwrap(),
            Err(FacetError::ConnectionLost { .. })
        ));
        assert_eq!(events.recv().await.unwrap(), LifecycleEvent::Closed);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(events.try_recv().is_err(), "no reconnection after explicit disconnect");
    }

    #[tokio::test]
    async fn test_call_stalled_on_send_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // Accepts and never reads, so the socket buffers fill up.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let client = RpcClient::connect_to(addr, quick_config()).await.unwrap();
        let mut events = client.subscribe();

        let arguments = json!({ "s": "x".repeat(12 * 1024 * 1024) });
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            client.call_with_timeout("echo", arguments, Some(Duration::from_millis(100))),
        )
        .await
        .expect("call gives up at its own deadline");
        assert!(matches!(outcome, Err(FacetError::Timeout(_))), "got {:?}", outcome);
        assert_eq!(client.pending_count(), 0);

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            LifecycleEvent::LinkLost {
                reason: "link aborted".to_string()
            }
        );
        assert!(matches!(
            client.call("echo", json!({})).await,
            Err(FacetError::NotConnected)
        ));
        server.abort();
    }

    #[tokio::test]
    async fn test_abandoned_call_leaves_no_pending_entry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_request(&mut stream).await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let client = RpcClient::connect_to(addr, quick_config()).await.unwrap();
        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), client.call("slow", json!({}))).await;
        assert!(abandoned.is_err());
        assert_eq!(client.pending_count(), 0);

        client.disconnect().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_unbounded_timeout_is_accepted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let req = read_request(&mut stream).await;
            reply(&mut stream, &Envelope::result(req.id.clone(), "echo", json!(5), true)).await;
            stream
        });

        let client = RpcClient::connect_to(addr, quick_config()).await.unwrap();
        let value = client
            .call_with_timeout("echo", json!(5), Some(Duration::MAX))
            .await
            .unwrap();
        assert_eq!(value, json!(5));

        let _stream = server.await.unwrap();
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let server = {
            let accepted = Arc::clone(&accepted);
            tokio::spawn(async move {
                let mut streams = Vec::new();
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    streams.push(stream);
                }
            })
        };

        let client = RpcClient::new(addr, quick_config());
        let (first, second) = tokio::join!(client.connect(), client.connect());
        first.unwrap();
        second.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(client.state(), ConnectionState::Connected);

        client.disconnect().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_earlier_connection_fault_is_not_the_close_reason() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let fault = Envelope::connection_fault(None, FaultCode::DecodeError, "bad frame");
            reply(&mut stream, &fault).await;
            let req = read_request(&mut stream).await;
            reply(&mut stream, &Envelope::result(req.id.clone(), "echo", json!(1), true)).await;
            drop(stream);
        });

        let client = RpcClient::connect_to(addr, quick_config()).await.unwrap();
        let mut events = client.subscribe();
        assert_eq!(client.call("echo", json!({})).await.unwrap(), json!(1));
        server.await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            LifecycleEvent::LinkLost {
                reason: "connection closed by peer".to_string()
            }
        );
    }

    #[test]
    fn test_handler_failure_mapping() {
        let err = handler_failure(json!("plain message"));
        assert!(matches!(
            err,
            FacetError::Fault { code: FaultCode::HandlerError, ref message }
                if message == "plain message"
        ));

        let err = handler_failure(json!({"message": "m", "errorType": "custom-code"}));
        assert!(matches!(
            err,
            FacetError::Fault { code: FaultCode::Other(ref c), .. } if c == "custom-code"
        ));
    }
}
