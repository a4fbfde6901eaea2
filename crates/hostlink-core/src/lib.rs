//! Hostlink Core - bidirectional JSON-RPC 2.0 bus between an editor client
//! and a long-running host process.
//!
//! The host side runs a [`HostServer`] that dispatches requests to registered
//! handlers and fans events out to subscribed connections. The client side
//! runs a [`ConnectionManager`] that reconnects on its own, queues work while
//! offline and correlates responses with the requests that caused them.
//!
//! # Example
//!
//! ```rust,ignore
//! use hostlink_core::{ClientConfig, ConnectionManager};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> hostlink_core::Result<()> {
//!     let manager = ConnectionManager::websocket(ClientConfig::default());
//!     manager.connect();
//!     manager.wait_connected(Duration::from_secs(5)).await?;
//!
//!     let scene = manager.call("host.getSceneInfo", None).await?;
//!     println!("Scene: {}", scene["name"]);
//!
//!     let mut changes = manager.on_notification("objectChanged");
//!     manager.subscribe_to_event("objectChanged").await?;
//!     while let Some(change) = changes.recv().await {
//!         println!("{:?}", change.params);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod server;
pub mod subscription;
pub mod transport;

mod sync;

// Re-export commonly used types
pub use backoff::{ExponentialBackoff, FixedDelay, ReconnectPolicy};
pub use client::{ConnectionManager, ConnectionState};
pub use config::{BusConfig, ClientConfig, ServerConfig};
pub use connection::{
    CloseReason, Connection, ConnectionHandle, ConnectionId, ConnectionRouter,
    IgnoreNotifications, NotificationHandler, PeerState,
};
pub use correlation::{CorrelationTable, PendingResponse};
pub use dispatch::{handler_fn, DispatchTable, DispatchTableBuilder, Handler, RequestContext};
pub use error::{HostlinkError, Result};
pub use protocol::{
    methods, DecodeError, Envelope, ErrorCode, Notification, Request, RequestId, Response,
    RpcError,
};
pub use server::{HostServer, HostServerHandle};
pub use subscription::{NotificationSink, PublishReport, SubscriptionRegistry};
pub use transport::{Connector, Transport, WsConnector};
