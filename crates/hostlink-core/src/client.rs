//! Client-side connection manager.
//!
//! Owns the connect/reconnect lifecycle and the offline queue:
//!
//! ```text
//! Disconnected --connect()--> Connecting --established--> Connected
//!      ^                          |                          |
//!      +------ attempt failed ----+------ transport lost ----+  (retry after policy delay)
//!
//! any state --disconnect()--> Disconnected (no retry until connect() again)
//! ```
//!
//! Requests and notifications submitted while no connection is up are queued
//! and written in submission order as soon as one is. Requests already
//! written when a connection drops are failed with a connection error rather
//! than replayed.

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionHandle, ConnectionRouter, NotificationHandler};
use crate::correlation::{CorrelationTable, PendingResponse};
use crate::dispatch::DispatchTable;
use crate::error::{HostlinkError, Result};
use crate::protocol::{methods, Envelope, Notification, Request, RequestId};
use crate::sync::lock;
use crate::transport::{Connector, WsConnector};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection manager state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Fans inbound Notifications out to per-method receivers.
#[derive(Default)]
struct NotificationRouter {
    receivers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Notification>>>>,
}

impl NotificationRouter {
    fn subscribe(&self, method: &str) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.receivers)
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }
}

impl NotificationHandler for NotificationRouter {
    fn on_notification(&self, from: &Arc<ConnectionHandle>, notification: Notification) {
        let mut receivers = lock(&self.receivers);
        let Some(senders) = receivers.get_mut(&notification.method) else {
            debug!(
                connection_id = %from.id(),
                method = %notification.method,
                "No receiver for notification"
            );
            return;
        };

        senders.retain(|tx| tx.send(notification.clone()).is_ok());
        if senders.is_empty() {
            receivers.remove(&notification.method);
        }
    }
}

struct Queued {
    envelope: Envelope,
    /// Set for requests so cancelled ones can be skipped on drain.
    id: Option<RequestId>,
}

#[derive(Default)]
struct Link {
    handle: Option<Arc<ConnectionHandle>>,
    queue: VecDeque<Queued>,
    /// Bumped by every connect() and disconnect(); a supervisor only acts
    /// while its generation is current.
    generation: u64,
}

struct Supervisor {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ManagerInner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    correlation: Arc<CorrelationTable>,
    router: ConnectionRouter,
    notifications: Arc<NotificationRouter>,
    link: Mutex<Link>,
    state_tx: watch::Sender<ConnectionState>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl ManagerInner {
    fn set_state(&self, generation: u64, state: ConnectionState) {
        let link = lock(&self.link);
        if link.generation == generation {
            self.state_tx.send_if_modified(|current| {
                let changed = *current != state;
                *current = state;
                changed
            });
        }
    }

    /// Write `envelope` now if a connection is up, otherwise queue it.
    fn submit(&self, envelope: Envelope, id: Option<RequestId>) {
        let mut link = lock(&self.link);
        if let Some(handle) = &link.handle {
            match handle.send(&envelope) {
                Ok(()) => {
                    if let Some(id) = &id {
                        self.correlation.mark_sent(id);
                    }
                    return;
                }
                Err(e) => {
                    debug!(error = %e, "Connection is going away; queueing message");
                }
            }
        }
        link.queue.push_back(Queued { envelope, id });
        debug!(queued = link.queue.len(), "Message queued while offline");
    }

    /// Install a fresh connection and drain the queue through it.
    fn go_online(&self, generation: u64, handle: &Arc<ConnectionHandle>) -> bool {
        let mut link = lock(&self.link);
        if link.generation != generation {
            return false;
        }

        let mut drained = 0;
        while let Some(queued) = link.queue.pop_front() {
            if let Some(id) = &queued.id {
                if !self.correlation.contains(id) {
                    // Cancelled or timed out while waiting.
                    continue;
                }
            }
            if let Err(e) = handle.send(&queued.envelope) {
                warn!(error = %e, "Connection dropped while draining queue");
                link.queue.push_front(queued);
                return false;
            }
            if let Some(id) = &queued.id {
                self.correlation.mark_sent(id);
            }
            drained += 1;
        }

        link.handle = Some(Arc::clone(handle));
        self.state_tx.send_replace(ConnectionState::Connected);
        info!(peer = %handle.peer(), drained, "Connected");
        true
    }

    /// Tear down after a connection ended on its own.
    fn go_offline(&self, generation: u64, handle: &Arc<ConnectionHandle>) {
        let mut link = lock(&self.link);
        if link
            .handle
            .as_ref()
            .is_some_and(|current| current.id() == handle.id())
        {
            link.handle = None;
        }
        if link.generation != generation {
            return;
        }

        let rejected = self
            .correlation
            .reject_sent(|| HostlinkError::ConnectionClosed);
        self.state_tx.send_replace(ConnectionState::Disconnected);
        if rejected > 0 {
            warn!(rejected, "Failed in-flight requests after connection loss");
        }
    }
}

async fn supervise(inner: Arc<ManagerInner>, generation: u64, mut stop_rx: watch::Receiver<bool>) {
    let endpoint = inner.connector.describe();
    let mut attempt: u32 = 0;

    loop {
        if *stop_rx.borrow() {
            break;
        }

        inner.set_state(generation, ConnectionState::Connecting);
        debug!(endpoint = %endpoint, attempt, "Connecting");

        let connected = tokio::select! {
            result = tokio::time::timeout(inner.config.connect_timeout, inner.connector.connect()) => result,
            _ = stop_rx.changed() => break,
        };

        match connected {
            Ok(Ok(transport)) => {
                attempt = 0;
                let connection = Connection::new(transport, inner.router.clone());
                let handle = connection.handle();
                if !inner.go_online(generation, &handle) {
                    handle.close();
                }
                let reason = connection.run().await;
                inner.go_offline(generation, &handle);
                info!(endpoint = %endpoint, reason = %reason, "Disconnected");
            }
            Ok(Err(e)) => {
                warn!(endpoint = %endpoint, attempt, error = %e, "Connection attempt failed");
                inner.set_state(generation, ConnectionState::Disconnected);
            }
            Err(_) => {
                warn!(
                    endpoint = %endpoint,
                    attempt,
                    timeout_ms = inner.config.connect_timeout.as_millis() as u64,
                    "Connection attempt timed out"
                );
                inner.set_state(generation, ConnectionState::Disconnected);
            }
        }

        if *stop_rx.borrow() {
            break;
        }

        let delay = inner.config.reconnect.delay(attempt);
        attempt = attempt.saturating_add(1);
        info!(endpoint = %endpoint, delay_ms = delay.as_millis() as u64, "Reconnecting");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_rx.changed() => break,
        }
    }

    debug!(endpoint = %endpoint, "Supervisor stopped");
}

/// Client connection manager.
///
/// Construct one per logical link and share it (e.g. in an `Arc`). Dropping
/// the manager disconnects it.
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Manager over an arbitrary connector, with no inbound request handlers.
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self::with_dispatch(config, connector, DispatchTable::empty())
    }

    /// Manager that connects to `config.url` over WebSocket.
    pub fn websocket(config: ClientConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.url.clone()));
        Self::new(config, connector)
    }

    /// Manager that also answers requests sent by the host.
    pub fn with_dispatch(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        dispatch: DispatchTable,
    ) -> Self {
        let correlation = Arc::new(CorrelationTable::new());
        let notifications = Arc::new(NotificationRouter::default());
        let router = ConnectionRouter::new(
            Arc::new(dispatch),
            Arc::clone(&correlation),
            Arc::clone(&notifications) as Arc<dyn NotificationHandler>,
        );
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(ManagerInner {
                config,
                connector,
                correlation,
                router,
                notifications,
                link: Mutex::new(Link::default()),
                state_tx,
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Start connecting in the background. Retries until [`disconnect`] is
    /// called. Calling it while already running is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// [`disconnect`]: Self::disconnect
    pub fn connect(&self) {
        let mut supervisor = lock(&self.inner.supervisor);
        if supervisor
            .as_ref()
            .is_some_and(|running| !running.task.is_finished() && !*running.stop_tx.borrow())
        {
            return;
        }

        let generation = {
            let mut link = lock(&self.inner.link);
            link.generation += 1;
            link.generation
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(Arc::clone(&self.inner), generation, stop_rx));
        *supervisor = Some(Supervisor { stop_tx, task });
        info!(endpoint = %self.inner.connector.describe(), "Connection manager started");
    }

    /// Stop reconnecting, close the connection and fail everything pending.
    pub fn disconnect(&self) {
        if let Some(supervisor) = lock(&self.inner.supervisor).take() {
            supervisor.stop_tx.send_replace(true);
        }

        let (handle, queued) = {
            let mut link = lock(&self.inner.link);
            link.generation += 1;
            let queued: Vec<Queued> = link.queue.drain(..).collect();
            (link.handle.take(), queued)
        };

        if let Some(handle) = handle {
            handle.close();
        }

        for item in queued {
            if let Some(id) = item.id {
                self.inner.correlation.reject(&id, HostlinkError::ConnectionClosed);
            }
        }
        let rejected = self
            .inner
            .correlation
            .reject_all(|| HostlinkError::ConnectionClosed);
        if rejected > 0 {
            debug!(rejected, "Failed pending requests on disconnect");
        }

        self.inner
            .state_tx
            .send_replace(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the manager is `Connected`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut changes = self.state_changes();
        let connected = changes.wait_for(|state| *state == ConnectionState::Connected);
        // Drop the borrowed state before `changes` goes out of scope.
        let outcome = tokio::time::timeout(timeout, connected)
            .await
            .map(|reached| reached.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(HostlinkError::ConnectionClosed),
            Err(_) => Err(HostlinkError::Timeout(timeout)),
        }
    }

    /// Submit a request; it is queued if no connection is up.
    ///
    /// The returned handle uses the configured request timeout.
    pub fn send_request(&self, method: &str, params: Option<Value>) -> PendingResponse {
        self.request_with_timeout(method, params, self.inner.config.request_timeout)
    }

    pub fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> PendingResponse {
        let (id, rx) = self.inner.correlation.register_next(method);
        let envelope = Envelope::Request(Request::new(method, params, id.clone()));
        self.inner.submit(envelope, Some(id.clone()));
        PendingResponse::new(id, rx, Arc::clone(&self.inner.correlation), timeout)
    }

    /// Submit a request and wait for its result.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.send_request(method, params).await
    }

    /// Send a Notification, queueing it while offline.
    pub fn send_notification(&self, method: &str, params: Option<Value>) {
        self.inner
            .submit(Envelope::Notification(Notification::new(method, params)), None);
    }

    /// Receive every inbound Notification whose method is `method`.
    pub fn on_notification(&self, method: &str) -> mpsc::UnboundedReceiver<Notification> {
        self.inner.notifications.subscribe(method)
    }

    pub async fn subscribe_to_event(&self, event: &str) -> Result<Value> {
        self.call(methods::SUBSCRIBE_TO_EVENT, Some(json!({"event": event})))
            .await
    }

    pub async fn unsubscribe_from_event(&self, event: &str) -> Result<Value> {
        self.call(methods::UNSUBSCRIBE_FROM_EVENT, Some(json!({"event": event})))
            .await
    }

    /// Ask the host to publish `data` to subscribers of `event`.
    pub fn emit_event(&self, event: &str, data: Value) {
        self.send_notification(methods::EMIT_EVENT, Some(json!({"event": event, "data": data})));
    }

    /// Requests awaiting a response, queued or written.
    pub fn pending_count(&self) -> usize {
        self.inner.correlation.len()
    }

    /// Messages waiting for a connection.
    pub fn queued_count(&self) -> usize {
        lock(&self.inner.link).queue.len()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.connector.describe())
            .field("state", &self.state())
            .finish()
    }
}
