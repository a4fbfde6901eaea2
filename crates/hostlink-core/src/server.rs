//! WebSocket host listener.
//!
//! Serves the WebSocket upgrade on `/` and a health probe on `/health`.
//! Every accepted socket becomes a [`Connection`] sharing one dispatch table
//! and one subscription registry. Each connection gets its own correlation
//! table, so host-initiated requests fail when their connection goes away.
//!
//! # Example
//!
//! ```no_run
//! use hostlink_core::{HostServer, ServerConfig, RpcError};
//! use serde_json::json;
//!
//! # async fn run() -> hostlink_core::Result<()> {
//! let mut server = HostServer::new(ServerConfig::default());
//! server.register_fn("host.ping", |_ctx, _params| async {
//!     Ok::<_, RpcError>(json!("pong"))
//! });
//! let handle = server.start().await?;
//! println!("listening on {}", handle.url());
//! # Ok(())
//! # }
//! ```

use crate::config::{BusConfig, ServerConfig};
use crate::connection::{
    CloseReason, Connection, ConnectionHandle, ConnectionId, ConnectionRouter, IgnoreNotifications,
    NotificationHandler,
};
use crate::correlation::{CorrelationTable, PendingResponse};
use crate::dispatch::{DispatchTable, DispatchTableBuilder, Handler, RequestContext};
use crate::error::{HostlinkError, Result};
use crate::protocol::{methods, params::get_str_param, Envelope, Notification, Request, RpcError};
use crate::subscription::{PublishReport, SubscriptionRegistry};
use crate::sync::lock;
use crate::transport::{axum_transport, Transport};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Routes client notifications: `host.emitEvent` is published through the
/// registry, everything else goes to the embedder's handler.
struct HostNotifications {
    registry: Arc<SubscriptionRegistry>,
    fallback: Arc<dyn NotificationHandler>,
}

impl NotificationHandler for HostNotifications {
    fn on_notification(&self, from: &Arc<ConnectionHandle>, notification: Notification) {
        if notification.method != methods::EMIT_EVENT {
            self.fallback.on_notification(from, notification);
            return;
        }

        let params = notification.params.unwrap_or(Value::Null);
        let Some(event) = get_str_param(&params, "event", "eventName") else {
            warn!(connection_id = %from.id(), "host.emitEvent without an event name");
            return;
        };
        let data = params.get("data").cloned().unwrap_or(Value::Null);
        self.registry.publish(event, data);
    }
}

struct PeerEntry {
    handle: Arc<ConnectionHandle>,
    correlation: Arc<CorrelationTable>,
}

struct ServerShared {
    dispatch: Arc<DispatchTable>,
    notifications: Arc<dyn NotificationHandler>,
    registry: Arc<SubscriptionRegistry>,
    connections: Mutex<HashMap<ConnectionId, PeerEntry>>,
    stopped: AtomicBool,
}

impl ServerShared {
    async fn serve(self: Arc<Self>, transport: Transport) -> CloseReason {
        let correlation = Arc::new(CorrelationTable::new());
        let router = ConnectionRouter::new(
            Arc::clone(&self.dispatch),
            Arc::clone(&correlation),
            Arc::clone(&self.notifications),
        );
        let connection = Connection::new(transport, router);
        let handle = connection.handle();
        let id = handle.id();

        {
            let mut connections = lock(&self.connections);
            if self.stopped.load(Ordering::SeqCst) {
                handle.close();
            } else {
                connections.insert(
                    id,
                    PeerEntry {
                        handle: Arc::clone(&handle),
                        correlation: Arc::clone(&correlation),
                    },
                );
            }
        }
        self.registry.attach(&handle);
        info!(connection_id = %id, peer = %handle.peer(), "Client connected");

        let reason = connection.run().await;

        lock(&self.connections).remove(&id);
        self.registry.detach(id);
        let rejected = correlation.reject_all(|| HostlinkError::ConnectionClosed);
        if rejected > 0 {
            debug!(connection_id = %id, rejected, "Failed host requests for closed connection");
        }
        reason
    }

    fn handles(&self) -> Vec<Arc<ConnectionHandle>> {
        lock(&self.connections)
            .values()
            .map(|entry| Arc::clone(&entry.handle))
            .collect()
    }
}

/// Host listener under construction.
pub struct HostServer {
    config: ServerConfig,
    builder: DispatchTableBuilder,
    registry: Arc<SubscriptionRegistry>,
    notifications: Arc<dyn NotificationHandler>,
}

impl HostServer {
    /// A server whose dispatch table already carries the subscription methods.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let mut builder = DispatchTable::builder();
        registry.register_methods(&mut builder);

        Self {
            config,
            builder,
            registry,
            notifications: Arc::new(IgnoreNotifications),
        }
    }

    pub fn register(&mut self, method: impl Into<String>, handler: impl Handler + 'static) -> &mut Self {
        self.builder.register(method, handler);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, method: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, RpcError>> + Send + 'static,
    {
        self.builder.register_fn(method, f);
        self
    }

    /// Handler for client notifications other than `host.emitEvent`.
    pub fn with_notification_handler(mut self, handler: impl NotificationHandler + 'static) -> Self {
        self.notifications = Arc::new(handler);
        self
    }

    /// The registry handlers should publish through.
    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind and start serving in the background.
    pub async fn start(self) -> Result<HostServerHandle> {
        let bind_addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(bind_addr).await?;
        let addr = listener.local_addr()?;

        let dispatch = Arc::new(self.builder.build());
        info!(addr = %addr, methods = ?dispatch.methods(), "Host server listening");

        let notifications: Arc<dyn NotificationHandler> = Arc::new(HostNotifications {
            registry: Arc::clone(&self.registry),
            fallback: self.notifications,
        });
        let shared = Arc::new(ServerShared {
            dispatch,
            notifications,
            registry: self.registry,
            connections: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        });

        let app = Router::new()
            .route("/", get(handle_upgrade))
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&shared));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;

            match result {
                Ok(()) => info!("Host server stopped"),
                Err(e) => error!(error = %e, "Host server error"),
            }
        });

        Ok(HostServerHandle {
            addr,
            shared,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        })
    }
}

async fn handle_upgrade(
    State(shared): State<Arc<ServerShared>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    if shared.stopped.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| async move {
        shared.serve(axum_transport(socket, peer.to_string())).await;
    })
}

async fn handle_health(State(shared): State<Arc<ServerShared>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": lock(&shared.connections).len(),
    }))
}

/// Handle to a running host server. Dropping it stops the server.
pub struct HostServerHandle {
    addr: SocketAddr,
    shared: Arc<ServerShared>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HostServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// WebSocket URL clients should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.shared.registry)
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::SeqCst)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        lock(&self.shared.connections).keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.shared.connections).len()
    }

    /// Serve an already established transport (e.g. an in-memory one).
    pub fn accept(&self, transport: Transport) -> JoinHandle<CloseReason> {
        tokio::spawn(Arc::clone(&self.shared).serve(transport))
    }

    /// Notify every subscriber of `event`.
    pub fn publish(&self, event: &str, payload: Value) -> PublishReport {
        self.shared.registry.publish(event, payload)
    }

    /// Notify every active connection, subscribed or not. Returns the number
    /// of connections the Notification was queued for.
    pub fn broadcast(&self, method: &str, params: Option<Value>) -> usize {
        let mut delivered = 0;
        for handle in self.shared.handles() {
            match handle.notify(method, params.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(connection_id = %handle.id(), method, error = %e, "Broadcast delivery failed")
                }
            }
        }
        delivered
    }

    /// Send a request to one connected client.
    pub fn send_request(
        &self,
        connection_id: ConnectionId,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<PendingResponse> {
        let (handle, correlation) = {
            let connections = lock(&self.shared.connections);
            let entry = connections
                .get(&connection_id)
                .ok_or_else(|| HostlinkError::Connection {
                    message: format!("Unknown connection {}", connection_id),
                })?;
            (Arc::clone(&entry.handle), Arc::clone(&entry.correlation))
        };

        let (id, rx) = correlation.register_next(method);
        let pending = PendingResponse::new(id.clone(), rx, Arc::clone(&correlation), timeout);
        handle.send(&Envelope::Request(Request::new(method, params, id.clone())))?;
        correlation.mark_sent(&id);
        Ok(pending)
    }

    /// Stop listening and close every connection. Idempotent.
    pub fn stop(&self) {
        let handles: Vec<Arc<ConnectionHandle>> = {
            let mut connections = lock(&self.shared.connections);
            if self.shared.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            connections.drain().map(|(_, entry)| entry.handle).collect()
        };

        if let Some(tx) = lock(&self.shutdown_tx).take() {
            let _ = tx.send(());
        }

        info!(addr = %self.addr, connections = handles.len(), "Stopping host server");
        for handle in handles {
            handle.close();
            self.shared.registry.detach(handle.id());
        }
    }

    /// Stop and wait for the listener task to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let task = lock(&self.task).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(BusConfig::CLOSE_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                debug!("Listener did not stop in time; aborting");
                task.abort();
            }
        }
    }
}

impl Drop for HostServerHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}
