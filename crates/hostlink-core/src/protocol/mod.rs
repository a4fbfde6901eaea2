//! JSON-RPC 2.0 wire protocol.

pub mod codec;
pub mod envelope;
pub mod params;

pub use codec::{decode, decode_str, decode_value, encode, DecodeError};
pub use envelope::{
    Envelope, ErrorCode, Notification, Request, RequestId, Response, RpcError, JSONRPC_VERSION,
};

/// Method names spoken between the editor client and the host.
pub mod methods {
    pub const GET_SCENE_INFO: &str = "host.getSceneInfo";
    pub const GET_OBJECT_INFO: &str = "host.getObjectInfo";
    pub const EXECUTE_COMMAND: &str = "host.executeCommand";
    pub const SUBSCRIBE_TO_EVENT: &str = "host.subscribeToEvent";
    pub const UNSUBSCRIBE_FROM_EVENT: &str = "host.unsubscribeFromEvent";

    /// Client notification asking the host to publish `{event, data}`.
    pub const EMIT_EVENT: &str = "host.emitEvent";
}
