//! End-to-end tests for the hostlink bus over real WebSocket sockets.
//!
//! Each test binds a host on `127.0.0.1:0` and talks to it either through a
//! raw tungstenite socket (to see exact frames) or through a
//! `ConnectionManager`.

use futures::{SinkExt, StreamExt};
use hostlink_core::{
    methods, ClientConfig, ConnectionHandle, ConnectionManager, ConnectionState, FixedDelay,
    HostServer, HostServerHandle, Notification, NotificationHandler, RpcError, ServerConfig,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

/// Records the method of every client notification the host receives.
#[derive(Default, Clone)]
struct Recorder {
    methods: Arc<Mutex<Vec<String>>>,
}

impl NotificationHandler for Recorder {
    fn on_notification(&self, _from: &Arc<ConnectionHandle>, notification: Notification) {
        self.methods.lock().unwrap().push(notification.method);
    }
}

fn scene_server() -> HostServer {
    let mut server = HostServer::new(ServerConfig::ephemeral());
    server
        .register_fn(methods::GET_SCENE_INFO, |_ctx, _params| async {
            Ok::<_, RpcError>(json!({"name": "Main", "rootObjects": []}))
        })
        .register_fn("test.hang", |_ctx, _params| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, RpcError>(Value::Null)
        })
        .register_fn("test.echo", |_ctx, params| async move {
            Ok::<_, RpcError>(params.unwrap_or(Value::Null))
        });
    server
}

fn client_config(handle: &HostServerHandle) -> ClientConfig {
    ClientConfig::new(handle.url())
        .with_reconnect_policy(FixedDelay::new(Duration::from_millis(50)))
        .with_request_timeout(Some(WAIT))
}

async fn connected_manager(handle: &HostServerHandle) -> ConnectionManager {
    let manager = ConnectionManager::websocket(client_config(handle));
    manager.connect();
    manager.wait_connected(WAIT).await.unwrap();
    manager
}

async fn raw_socket(
    handle: &HostServerHandle,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let (socket, _) = tokio_tungstenite::connect_async(handle.url()).await.unwrap();
    socket
}

async fn next_json<S>(socket: &mut S) -> Value
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(WAIT, socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_scene_info_exact_frames() {
    let handle = scene_server().start().await.unwrap();
    let mut socket = raw_socket(&handle).await;

    socket
        .send(Message::Text(
            r#"{"jsonrpc":"2.0","method":"host.getSceneInfo","id":1}"#.to_string(),
        ))
        .await
        .unwrap();

    let response = next_json(&mut socket).await;
    assert_eq!(
        response,
        json!({"jsonrpc": "2.0", "id": 1, "result": {"name": "Main", "rootObjects": []}})
    );
}

#[tokio::test]
async fn test_scene_info_through_manager() {
    let handle = scene_server().start().await.unwrap();
    let manager = connected_manager(&handle).await;

    let result = manager.call(methods::GET_SCENE_INFO, None).await.unwrap();
    assert_eq!(result, json!({"name": "Main", "rootObjects": []}));
    assert_eq!(manager.pending_count(), 0);
}

#[tokio::test]
async fn test_parse_error_keeps_connection_open() {
    let handle = scene_server().start().await.unwrap();
    let mut socket = raw_socket(&handle).await;

    socket
        .send(Message::Text("this is not json".to_string()))
        .await
        .unwrap();
    let response = next_json(&mut socket).await;
    assert_eq!(response["id"], Value::Null);
    assert_eq!(response["error"]["code"], json!(-32700));

    socket
        .send(Message::Text(
            json!({"jsonrpc": "2.0", "method": "test.echo", "params": [7], "id": "next"})
                .to_string(),
        ))
        .await
        .unwrap();
    let response = next_json(&mut socket).await;
    assert_eq!(response["id"], json!("next"));
    assert_eq!(response["result"], json!([7]));
}

#[tokio::test]
async fn test_invalid_envelope_and_unknown_method() {
    let handle = scene_server().start().await.unwrap();
    let mut socket = raw_socket(&handle).await;

    socket
        .send(Message::Text(json!({"jsonrpc": "2.0", "id": 5}).to_string()))
        .await
        .unwrap();
    let response = next_json(&mut socket).await;
    assert_eq!(response["error"]["code"], json!(-32600));
    assert_eq!(response["id"], Value::Null);

    socket
        .send(Message::Text(
            json!({"jsonrpc": "2.0", "method": "host.nope", "id": 6}).to_string(),
        ))
        .await
        .unwrap();
    let response = next_json(&mut socket).await;
    assert_eq!(response["error"]["code"], json!(-32601));
    assert_eq!(response["id"], json!(6));
}

#[tokio::test]
async fn test_tick_subscription_lifecycle() {
    let handle = scene_server().start().await.unwrap();
    let manager = connected_manager(&handle).await;
    let mut ticks = manager.on_notification("tick");

    manager.subscribe_to_event("tick").await.unwrap();
    let report = handle.publish("tick", json!({"n": 1}));
    assert_eq!(report.delivered, 1);

    let tick = tokio::time::timeout(WAIT, ticks.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tick.params, Some(json!({"n": 1})));

    manager.unsubscribe_from_event("tick").await.unwrap();
    let report = handle.publish("tick", json!({"n": 2}));
    assert_eq!(report.delivered, 0);

    // A later frame proves nothing else was queued behind the first tick.
    let echo = manager.call("test.echo", Some(json!("after"))).await.unwrap();
    assert_eq!(echo, json!("after"));
    assert!(ticks.try_recv().is_err());
}

#[tokio::test]
async fn test_emit_event_reaches_other_client() {
    let handle = scene_server().start().await.unwrap();
    let listener = connected_manager(&handle).await;
    let emitter = connected_manager(&handle).await;
    let mut changes = listener.on_notification("objectChanged");

    listener.subscribe_to_event("objectChanged").await.unwrap();
    emitter.emit_event("objectChanged", json!({"instanceId": 3}));

    let change = tokio::time::timeout(WAIT, changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.method, "objectChanged");
    assert_eq!(change.params, Some(json!({"instanceId": 3})));
}

#[tokio::test]
async fn test_queued_messages_arrive_in_submission_order() {
    let recorder = Recorder::default();
    let handle = scene_server()
        .with_notification_handler(recorder.clone())
        .start()
        .await
        .unwrap();

    let manager = ConnectionManager::websocket(client_config(&handle));
    manager.send_notification("first", None);
    manager.send_notification("second", None);
    let pending = manager.send_request("test.echo", Some(json!("queued")));
    manager.send_notification("third", None);
    assert_eq!(manager.queued_count(), 4);

    manager.connect();
    manager.wait_connected(WAIT).await.unwrap();
    manager.send_notification("fourth", None);

    assert_eq!(pending.await.unwrap(), json!("queued"));
    // Notifications are never answered, so poll until all four arrived.
    tokio::time::timeout(WAIT, async {
        while recorder.methods.lock().unwrap().len() < 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        *recorder.methods.lock().unwrap(),
        vec!["first", "second", "third", "fourth"]
    );
}

#[tokio::test]
async fn test_dropped_connection_rejects_all_pending() {
    let handle = scene_server().start().await.unwrap();
    let manager = connected_manager(&handle).await;

    let pending: Vec<_> = (0..4)
        .map(|_| manager.send_request("test.hang", None))
        .collect();
    assert_eq!(manager.pending_count(), 4);

    handle.stop();

    for response in pending {
        let err = tokio::time::timeout(WAIT, response).await.unwrap().unwrap_err();
        assert_eq!(err.to_rpc_error_code(), -32002, "unexpected error: {}", err);
    }
    assert_eq!(manager.pending_count(), 0);

    let mut states = manager.state_changes();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s != ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
    manager.disconnect();
}

#[tokio::test]
async fn test_request_timeout_removes_entry() {
    let handle = scene_server().start().await.unwrap();
    let manager = connected_manager(&handle).await;

    let err = manager
        .request_with_timeout("test.hang", None, Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.to_rpc_error_code(), -32001);
    assert_eq!(manager.pending_count(), 0);

    // The connection is unaffected.
    assert!(manager.is_connected());
    let echo = manager.call("test.echo", Some(json!(1))).await.unwrap();
    assert_eq!(echo, json!(1));
}

#[tokio::test]
async fn test_stop_is_idempotent_and_closes_listener() {
    let handle = scene_server().start().await.unwrap();
    let addr = handle.addr();
    let _manager = connected_manager(&handle).await;
    assert_eq!(handle.connection_count(), 1);

    handle.shutdown().await;
    handle.stop();
    assert!(!handle.is_running());
    assert_eq!(handle.connection_count(), 0);

    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_health_and_plain_http_rejection() {
    let handle = scene_server().start().await.unwrap();
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("http://{}/health", handle.addr()))
        .timeout(WAIT)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], json!("ok"));

    let plain = client
        .get(format!("http://{}/", handle.addr()))
        .timeout(WAIT)
        .send()
        .await
        .unwrap();
    assert!(plain.status().is_client_error(), "got {}", plain.status());
}
