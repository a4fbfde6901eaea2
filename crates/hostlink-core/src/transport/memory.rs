//! In-process transports over channels.
//!
//! Used by tests and by embedders that run client and host in one process.

use super::{Connector, Transport};
use crate::error::{HostlinkError, Result};
use async_trait::async_trait;
use futures::channel::mpsc as frame_channel;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Two connected transports. Frames sent on one arrive on the other; closing
/// one side's sink ends the other side's stream.
pub fn duplex(a_peer: impl Into<String>, b_peer: impl Into<String>) -> (Transport, Transport) {
    let (a_tx, a_rx) = frame_channel::unbounded::<String>();
    let (b_tx, b_rx) = frame_channel::unbounded::<String>();

    let a = Transport::new(
        b_rx.map(|frame| Ok(frame.into_bytes())),
        a_tx.sink_map_err(|_| HostlinkError::ConnectionClosed),
        b_peer,
    );
    let b = Transport::new(
        a_rx.map(|frame| Ok(frame.into_bytes())),
        b_tx.sink_map_err(|_| HostlinkError::ConnectionClosed),
        a_peer,
    );
    (a, b)
}

struct Endpoint {
    online: AtomicBool,
    attempts: AtomicUsize,
    accepted: mpsc::UnboundedSender<Transport>,
}

/// Create a connector/acceptor pair for an in-process endpoint.
pub fn memory_endpoint(name: impl Into<String>) -> (MemoryConnector, MemoryAcceptor) {
    let (tx, rx) = mpsc::unbounded_channel();
    let endpoint = Arc::new(Endpoint {
        online: AtomicBool::new(true),
        attempts: AtomicUsize::new(0),
        accepted: tx,
    });
    let name = name.into();

    (
        MemoryConnector {
            endpoint: Arc::clone(&endpoint),
            name: name.clone(),
        },
        MemoryAcceptor {
            endpoint,
            incoming: rx,
            name,
        },
    )
}

/// Client side of a memory endpoint.
#[derive(Clone)]
pub struct MemoryConnector {
    endpoint: Arc<Endpoint>,
    name: String,
}

impl MemoryConnector {
    /// Number of connect calls so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.endpoint.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Transport> {
        let attempt = self.endpoint.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.endpoint.online.load(Ordering::SeqCst) {
            return Err(HostlinkError::Connection {
                message: format!("{} is offline", self.name),
            });
        }

        let (client, server) = duplex(format!("{}#client{}", self.name, attempt), self.name.clone());
        self.endpoint
            .accepted
            .send(server)
            .map_err(|_| HostlinkError::Connection {
                message: format!("{} is no longer accepting", self.name),
            })?;
        Ok(client)
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.name)
    }
}

/// Host side of a memory endpoint.
pub struct MemoryAcceptor {
    endpoint: Arc<Endpoint>,
    incoming: mpsc::UnboundedReceiver<Transport>,
    name: String,
}

impl MemoryAcceptor {
    /// Wait for the next client transport.
    pub async fn accept(&mut self) -> Option<Transport> {
        self.incoming.recv().await
    }

    /// Refuse (or allow again) new connections.
    pub fn set_online(&self, online: bool) {
        self.endpoint.online.store(online, Ordering::SeqCst);
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
