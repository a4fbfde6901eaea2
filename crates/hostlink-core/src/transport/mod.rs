//! Message-framed transports.
//!
//! A [`Transport`] is a stream of inbound frames plus a sink for outbound
//! text frames. Connections only see this pair, so the same read loop runs
//! over a WebSocket or an in-process channel.

pub mod memory;
pub mod ws;

use crate::error::{HostlinkError, Result};
use async_trait::async_trait;
use futures::{Sink, Stream};
use std::pin::Pin;

pub use memory::{duplex, memory_endpoint, MemoryAcceptor, MemoryConnector};
pub use ws::{axum_transport, client_transport, WsConnector};

/// Inbound frames, one complete document each.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Outbound text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = HostlinkError> + Send>>;

/// One established duplex link to a peer.
pub struct Transport {
    pub stream: FrameStream,
    pub sink: FrameSink,
    /// Human-readable peer description for logs.
    pub peer: String,
}

impl Transport {
    pub fn new<St, Si>(stream: St, sink: Si, peer: impl Into<String>) -> Self
    where
        St: Stream<Item = Result<Vec<u8>>> + Send + 'static,
        Si: Sink<String, Error = HostlinkError> + Send + 'static,
    {
        Self {
            stream: Box::pin(stream),
            sink: Box::pin(sink),
            peer: peer.into(),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("peer", &self.peer).finish()
    }
}

/// Establishes client-side transports; called once per (re)connect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Transport>;

    /// Target description for logs.
    fn describe(&self) -> String;
}
