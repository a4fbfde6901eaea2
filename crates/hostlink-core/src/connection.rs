//! One live link to a peer.
//!
//! A [`Connection`] owns the transport. Its read loop decodes each frame and
//! routes it: requests to the dispatch table (each in its own task), responses
//! to the correlation table, notifications to a notification handler. Writes
//! from any task go through a [`ConnectionHandle`] and a single writer task,
//! so frames leave in the order they were accepted.

use crate::config::BusConfig;
use crate::correlation::CorrelationTable;
use crate::dispatch::DispatchTable;
use crate::error::{HostlinkError, Result};
use crate::protocol::{decode, encode, Envelope, Notification};
use crate::subscription::NotificationSink;
use crate::sync::lock;
use crate::transport::{FrameSink, FrameStream, Transport};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifier assigned to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Open,
    Closing,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Open => write!(f, "open"),
            PeerState::Closing => write!(f, "closing"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}

/// Why a connection's read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the transport.
    PeerClosed,
    /// [`ConnectionHandle::close`] was called.
    Local,
    /// The transport failed.
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::Error(e) => write!(f, "transport error: {}", e),
        }
    }
}

enum Outbound {
    Frame(String),
    Close,
}

/// Shared write side of a connection.
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: String,
    state: Mutex<PeerState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> PeerState {
        *lock(&self.state)
    }

    pub fn is_open(&self) -> bool {
        self.state() == PeerState::Open
    }

    /// Queue an envelope for writing.
    ///
    /// Fails with a connection error once the connection has left `Open`.
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        let state = lock(&self.state);
        if *state != PeerState::Open {
            return Err(HostlinkError::ConnectionClosed);
        }
        self.outbound
            .send(Outbound::Frame(encode(envelope)))
            .map_err(|_| HostlinkError::ConnectionClosed)
    }

    /// Send a Notification to this peer.
    pub fn notify(&self, method: impl Into<String>, params: Option<serde_json::Value>) -> Result<()> {
        self.send(&Envelope::Notification(Notification::new(method, params)))
    }

    /// Ask the read loop to stop. Frames already accepted are still written.
    pub fn close(&self) {
        {
            let mut state = lock(&self.state);
            if *state == PeerState::Open {
                *state = PeerState::Closing;
            }
        }
        self.shutdown.send_replace(true);
    }

    fn set_closed(&self) {
        *lock(&self.state) = PeerState::Closed;
    }
}

impl NotificationSink for ConnectionHandle {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn deliver(&self, notification: Notification) -> Result<()> {
        self.send(&Envelope::Notification(notification))
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Receives Notifications that arrive on a connection.
pub trait NotificationHandler: Send + Sync {
    fn on_notification(&self, from: &Arc<ConnectionHandle>, notification: Notification);
}

/// Logs and drops every Notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreNotifications;

impl NotificationHandler for IgnoreNotifications {
    fn on_notification(&self, from: &Arc<ConnectionHandle>, notification: Notification) {
        debug!(
            connection_id = %from.id(),
            method = %notification.method,
            "Ignoring notification"
        );
    }
}

/// Where decoded frames go.
#[derive(Clone)]
pub struct ConnectionRouter {
    dispatch: Arc<DispatchTable>,
    correlation: Arc<CorrelationTable>,
    notifications: Arc<dyn NotificationHandler>,
}

impl ConnectionRouter {
    pub fn new(
        dispatch: Arc<DispatchTable>,
        correlation: Arc<CorrelationTable>,
        notifications: Arc<dyn NotificationHandler>,
    ) -> Self {
        Self {
            dispatch,
            correlation,
            notifications,
        }
    }

    pub fn correlation(&self) -> &Arc<CorrelationTable> {
        &self.correlation
    }

    /// Route one inbound frame. Never fails: every problem is answered or
    /// logged so the read loop keeps going.
    pub fn route(&self, handle: &Arc<ConnectionHandle>, frame: &[u8]) {
        let envelope = match decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(connection_id = %handle.id(), error = %e, "Rejecting malformed frame");
                let reply = Envelope::Response(e.to_response());
                if let Err(send_err) = handle.send(&reply) {
                    debug!(connection_id = %handle.id(), error = %send_err, "Could not send decode error");
                }
                return;
            }
        };

        match envelope {
            Envelope::Request(request) => {
                debug!(
                    connection_id = %handle.id(),
                    request_id = %request.id,
                    method = %request.method,
                    "Dispatching request"
                );
                let dispatch = Arc::clone(&self.dispatch);
                let handle = Arc::clone(handle);
                tokio::spawn(async move {
                    let response = dispatch.handle_request(handle.id(), request).await;
                    if let Err(e) = handle.send(&Envelope::Response(response)) {
                        warn!(connection_id = %handle.id(), error = %e, "Dropping response for closed connection");
                    }
                });
            }
            Envelope::Response(response) => {
                self.correlation.complete(response);
            }
            Envelope::Notification(notification) => {
                self.notifications.on_notification(handle, notification);
            }
        }
    }
}

/// A connection over one transport.
pub struct Connection {
    handle: Arc<ConnectionHandle>,
    stream: FrameStream,
    sink: FrameSink,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    shutdown_rx: watch::Receiver<bool>,
    router: ConnectionRouter,
}

impl Connection {
    pub fn new(transport: Transport, router: ConnectionRouter) -> Self {
        Self::with_id(ConnectionId::new(), transport, router)
    }

    pub fn with_id(id: ConnectionId, transport: Transport, router: ConnectionRouter) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let Transport { stream, sink, peer } = transport;

        let handle = Arc::new(ConnectionHandle {
            id,
            peer,
            state: Mutex::new(PeerState::Open),
            outbound,
            shutdown,
        });

        Self {
            handle,
            stream,
            sink,
            outbound_rx,
            shutdown_rx,
            router,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    pub fn handle(&self) -> Arc<ConnectionHandle> {
        Arc::clone(&self.handle)
    }

    /// Run until the peer goes away or the handle is closed.
    ///
    /// On return the connection is `Closed`; the owner is responsible for
    /// dropping it from any connection sets and subscription registries.
    pub async fn run(self) -> CloseReason {
        let Connection {
            handle,
            mut stream,
            sink,
            outbound_rx,
            mut shutdown_rx,
            router,
        } = self;

        debug!(connection_id = %handle.id, peer = %handle.peer, "Connection open");
        let mut writer = tokio::spawn(write_loop(Arc::clone(&handle), sink, outbound_rx));

        let reason = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(bytes)) => router.route(&handle, &bytes),
                    Some(Err(e)) => {
                        warn!(connection_id = %handle.id, error = %e, "Transport read failed");
                        break CloseReason::Error(e.to_string());
                    }
                    None => break CloseReason::PeerClosed,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break CloseReason::Local;
                    }
                }
            }
        };

        handle.set_closed();
        let _ = handle.outbound.send(Outbound::Close);
        if tokio::time::timeout(BusConfig::CLOSE_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            debug!(connection_id = %handle.id, "Writer did not finish in time; aborting");
            writer.abort();
        }

        info!(connection_id = %handle.id, peer = %handle.peer, reason = %reason, "Connection closed");
        reason
    }
}

async fn write_loop(
    handle: Arc<ConnectionHandle>,
    mut sink: FrameSink,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(message) = outbound_rx.recv().await {
        match message {
            Outbound::Frame(text) => {
                if let Err(e) = sink.send(text).await {
                    warn!(connection_id = %handle.id, error = %e, "Transport write failed");
                    handle.close();
                    break;
                }
            }
            Outbound::Close => break,
        }
    }

    if let Err(e) = sink.close().await {
        debug!(connection_id = %handle.id, error = %e, "Error closing transport");
    }
}
