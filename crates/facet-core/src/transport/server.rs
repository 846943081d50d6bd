//! Server dispatcher: accepts connections and routes requests to tools.
//!
//! Each accepted connection gets a session task that reads frames, decodes
//! envelopes and spawns one task per request, so a slow tool never holds up
//! the requests behind it. Responses are written as they complete; writes to
//! a connection are serialized by a mutex around its write half.
//!
//! # Admission
//!
//! The session table is guarded by a single mutex, and the check against
//! `max_connections` happens under the same lock as the insert. A refused
//! connection receives one `connection-limit` fault and is closed.

use crate::config::ServerConfig;
use crate::protocol::{decode, encode, read_frame, write_frame, Body, Envelope, FaultCode};
use crate::registry::{ToolHandler, ToolRegistry};
use crate::{FacetError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Handle to a running server. Dropping shuts down the server.
pub struct RpcServerHandle {
    addr: SocketAddr,
    sessions: Arc<SessionTable>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RpcServerHandle {
    /// Address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of connection sessions currently admitted.
    pub fn active_connections(&self) -> usize {
        self.sessions.len()
    }

    /// Stop accepting connections and close every active session.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for RpcServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServerHandle")
            .field("addr", &self.addr)
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

/// Connection sessions, keyed by session id.
#[derive(Debug)]
struct SessionTable {
    max: usize,
    sessions: Mutex<HashMap<u64, ConnectionSession>>,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct ConnectionSession {
    peer: SocketAddr,
    opened_at: Instant,
}

impl SessionTable {
    fn new(max: usize) -> Self {
        Self {
            max,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, ConnectionSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a session unless the table is full.
    fn admit(self: &Arc<Self>, peer: SocketAddr) -> Option<SessionGuard> {
        let mut sessions = self.lock();
        if sessions.len() >= self.max {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        sessions.insert(
            id,
            ConnectionSession {
                peer,
                opened_at: Instant::now(),
            },
        );
        Some(SessionGuard {
            table: Arc::clone(self),
            id,
        })
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Releases the session slot when the connection task ends, however it ends.
struct SessionGuard {
    table: Arc<SessionTable>,
    id: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.table.lock().remove(&self.id) {
            debug!(
                "Session {} with {} closed after {:?}",
                self.id,
                session.peer,
                session.opened_at.elapsed()
            );
        }
    }
}

/// Settings shared by every session of one server.
struct Dispatcher {
    registry: Arc<ToolRegistry>,
    handler_timeout: Duration,
    max_in_flight: usize,
    max_message_size: usize,
}

/// Tool server listening for client connections.
pub struct RpcServer;

impl RpcServer {
    /// Bind `config.bind_addr()` and start serving `registry`.
    ///
    /// Port 0 asks the OS for a free port; see [`RpcServerHandle::addr`].
    /// The server runs in background tokio tasks.
    pub async fn start(
        config: ServerConfig,
        registry: Arc<ToolRegistry>,
    ) -> Result<RpcServerHandle> {
        config.validate()?;

        let bind_addr = config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| FacetError::Io {
                message: format!("Failed to bind {}: {}", bind_addr, e),
                source: Some(e),
            })?;
        let addr = listener.local_addr()?;

        info!(
            "Tool server listening on {} ({} tools, max {} connections)",
            addr,
            registry.len(),
            config.max_connections
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let sessions = Arc::new(SessionTable::new(config.max_connections));
        let dispatcher = Arc::new(Dispatcher {
            registry,
            handler_timeout: config.handler_timeout,
            max_in_flight: config.max_in_flight_per_connection,
            max_message_size: config.max_message_size,
        });

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatcher,
            Arc::clone(&sessions),
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(RpcServerHandle {
            addr,
            sessions,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        dispatcher: Arc<Dispatcher>,
        sessions: Arc<SessionTable>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Tool server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    let (stream, peer_addr) = match accept_result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Accept error: {}", e);
                            continue;
                        }
                    };

                    let Some(guard) = sessions.admit(peer_addr) else {
                        warn!(
                            "Refusing connection from {}: at max capacity ({})",
                            peer_addr, sessions.max
                        );
                        tokio::spawn(Self::refuse(stream, sessions.max));
                        continue;
                    };

                    let dispatcher = Arc::clone(&dispatcher);
                    let mut conn_shutdown = conn_shutdown_rx.clone();
                    tokio::spawn(async move {
                        debug!("Connection {} from {}", guard.id, peer_addr);
                        let served =
                            Self::serve_connection(stream, dispatcher, &mut conn_shutdown).await;
                        if let Err(e) = served {
                            debug!("Connection {} ended: {}", peer_addr, e);
                        }
                        drop(guard);
                    });
                }
            }
        }
    }

    /// Tell an over-capacity peer why it is being dropped, then close.
    async fn refuse(mut stream: TcpStream, max: usize) {
        let fault = Envelope::connection_fault(
            None,
            FaultCode::ConnectionLimit,
            format!("Server is at its connection limit ({})", max),
        );
        if let Ok(bytes) = encode(&fault) {
            let _ = write_frame(&mut stream, &bytes).await;
        }
        let _ = stream.shutdown().await;
    }

    async fn serve_connection(
        stream: TcpStream,
        dispatcher: Arc<Dispatcher>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let (mut reader, writer) = stream.into_split();
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
        let in_flight = Arc::new(Semaphore::new(dispatcher.max_in_flight));
        // Dropping the set aborts requests still running when the session ends.
        let mut requests = JoinSet::new();

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader, dispatcher.max_message_size) => result,
                _ = shutdown_rx.changed() => return Ok(()),
            };

            let bytes = match frame {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return Ok(()),
                Err(e @ FacetError::FrameTooLarge { .. }) => {
                    let _ = send(&writer, &error_fault(None, &e)).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            while let Some(finished) = requests.try_join_next() {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("Request task panicked: {}", e);
                    }
                }
            }

            let envelope = match decode(&bytes) {
                Ok(envelope) => envelope,
                Err(fault) => {
                    warn!("Malformed message: {}", fault);
                    let id = fault.id.clone();
                    send(&writer, &error_fault(id, &fault.into())).await?;
                    continue;
                }
            };

            let kind = envelope.kind();
            let Envelope { id, body, .. } = envelope;
            let (operation, arguments) = match body {
                Body::Request {
                    operation,
                    arguments,
                } => (operation, arguments),
                Body::Result { operation, .. } => {
                    send(&writer, &unsupported(id, Some(operation), kind)).await?;
                    continue;
                }
                Body::Fault { operation, .. } => {
                    send(&writer, &unsupported(id, operation, kind)).await?;
                    continue;
                }
            };

            let Some(handler) = dispatcher.registry.lookup(&operation) else {
                debug!("Unknown operation {} (request {})", operation, id);
                let message = format!("Unknown operation: {}", operation);
                let code = FaultCode::UnknownOperation;
                send(&writer, &Envelope::fault(id, Some(operation), code, message)).await?;
                continue;
            };

            // Applies backpressure on the reader once too many requests are running.
            let permit = Arc::clone(&in_flight)
                .acquire_owned()
                .await
                .map_err(|e| FacetError::Other(e.to_string()))?;

            requests.spawn(run_request(RequestTask {
                id,
                operation,
                arguments,
                handler,
                timeout: dispatcher.handler_timeout,
                writer: Arc::clone(&writer),
                _permit: permit,
            }));
        }
    }
}

struct RequestTask {
    id: String,
    operation: String,
    arguments: Value,
    handler: Arc<dyn ToolHandler>,
    timeout: Duration,
    writer: SharedWriter,
    _permit: OwnedSemaphorePermit,
}

/// Invoke one tool and write back exactly one terminal envelope.
async fn run_request(task: RequestTask) {
    let RequestTask {
        id,
        operation,
        arguments,
        handler,
        timeout,
        writer,
        _permit,
    } = task;

    let started = Instant::now();
    // A separate task so a panicking tool still produces a fault.
    let mut invocation = tokio::spawn(async move { handler.call(arguments).await });

    let response = match tokio::time::timeout(timeout, &mut invocation).await {
        Ok(Ok(Ok(value))) => Envelope::result(id, operation, value, true),
        Ok(Ok(Err(e))) => {
            debug!("Tool {} failed: {}", operation, e);
            let value = e.to_value();
            Envelope::result(id, operation, value, false)
        }
        Ok(Err(join_error)) => {
            error!("Tool {} crashed: {}", operation, join_error);
            let error = FacetError::Other(format!("Tool {} failed unexpectedly", operation));
            Envelope::fault(id, Some(operation), error.fault_code(), error.to_string())
        }
        Err(_) => {
            invocation.abort();
            warn!("Tool {} timed out after {:?}", operation, timeout);
            let code = FacetError::Timeout(timeout).fault_code();
            let message = format!("Operation {} timed out after {:?}", operation, timeout);
            Envelope::fault(id, Some(operation), code, message)
        }
    };

    debug!(
        "Request {} ({}) finished in {:?}",
        response.id,
        response.operation().unwrap_or_default(),
        started.elapsed()
    );

    if let Err(e) = send(&writer, &response).await {
        debug!("Could not deliver response {}: {}", response.id, e);
    }
}

/// Connection-scoped fault describing an error raised while reading the session.
fn error_fault(id: Option<String>, error: &FacetError) -> Envelope {
    Envelope::connection_fault(id, error.fault_code(), error.to_string())
}

fn unsupported(id: String, operation: Option<String>, kind: &str) -> Envelope {
    let message = format!("Unsupported envelope kind: {}", kind);
    Envelope::fault(id, operation, FaultCode::Unsupported, message)
}

async fn send(writer: &SharedWriter, envelope: &Envelope) -> Result<()> {
    let bytes = encode(envelope)?;
    let mut writer = writer.lock().await;
    write_frame(&mut *writer, &bytes).await
}
