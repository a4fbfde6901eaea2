//! Scene handlers for the demonstration host.

use crate::scene::Scene;
use hostlink_core::protocol::params::{require_i64_param, require_str_param};
use hostlink_core::{methods, HostServer, RpcError, SubscriptionRegistry};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Event published after every mutating command.
pub const OBJECT_CHANGED: &str = "objectChanged";

/// Shared state behind every scene handler.
pub struct HostState {
    pub scene: RwLock<Scene>,
    pub registry: Arc<SubscriptionRegistry>,
}

impl HostState {
    pub fn new(scene: Scene, registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            scene: RwLock::new(scene),
            registry,
        }
    }
}

/// Register the scene methods on `server`.
pub fn register(server: &mut HostServer, state: Arc<HostState>) {
    route(server, &state, methods::GET_SCENE_INFO, get_scene_info);
    route(server, &state, methods::GET_OBJECT_INFO, get_object_info);
    route(server, &state, methods::EXECUTE_COMMAND, execute_command);
}

fn route<F, Fut>(server: &mut HostServer, state: &Arc<HostState>, method: &str, handler: F)
where
    F: Fn(Arc<HostState>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    let state = Arc::clone(state);
    server.register_fn(method, move |_ctx, params| {
        handler(Arc::clone(&state), params.unwrap_or(Value::Null))
    });
}

pub async fn get_scene_info(state: Arc<HostState>, _params: Value) -> Result<Value, RpcError> {
    let info = state.scene.read().await.info();
    serde_json::to_value(info).map_err(|e| RpcError::internal(e.to_string()))
}

pub async fn get_object_info(state: Arc<HostState>, params: Value) -> Result<Value, RpcError> {
    let instance_id = instance_id_param(&params)?;
    let info = state
        .scene
        .read()
        .await
        .object_info(instance_id)
        .ok_or_else(|| not_found(instance_id))?;
    serde_json::to_value(info).map_err(|e| RpcError::internal(e.to_string()))
}

/// Run `{command, args}` against the scene.
///
/// `args` is either positional (`[instanceId, value]`) or an object with
/// `instanceId` plus `active` / `name`.
pub async fn execute_command(state: Arc<HostState>, params: Value) -> Result<Value, RpcError> {
    let command = require_str_param(&params, "command", "command")?;
    let args = params.get("args").cloned().unwrap_or(Value::Null);
    let instance_id = arg(&args, 0, "instance_id", "instanceId")
        .and_then(Value::as_i64)
        .ok_or_else(|| RpcError::invalid_params("Missing required integer argument: instanceId"))?;

    let change = {
        let mut scene = state.scene.write().await;
        match command.as_str() {
            "setActive" => {
                let active = arg(&args, 1, "active", "active")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| RpcError::invalid_params("Missing required boolean argument: active"))?;
                if !scene.set_active(instance_id, active) {
                    return Err(not_found(instance_id));
                }
                json!({
                    "command": command,
                    "instanceId": instance_id,
                    "object": scene.object_info(instance_id),
                })
            }
            "rename" => {
                let name = arg(&args, 1, "name", "name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::invalid_params("Missing required string argument: name"))?;
                if !scene.rename(instance_id, name) {
                    return Err(not_found(instance_id));
                }
                json!({
                    "command": command,
                    "instanceId": instance_id,
                    "object": scene.object_info(instance_id),
                })
            }
            "destroy" => {
                let removed = scene.destroy(instance_id);
                if removed.is_empty() {
                    return Err(not_found(instance_id));
                }
                json!({
                    "command": command,
                    "instanceId": instance_id,
                    "removed": removed,
                })
            }
            other => {
                return Err(RpcError::invalid_params(format!("Unknown command: {}", other)));
            }
        }
    };

    info!(command = %command, instance_id, "Executed scene command");
    let report = state.registry.publish(OBJECT_CHANGED, change);
    debug!(delivered = report.delivered, failed = report.failed, "Published {}", OBJECT_CHANGED);

    Ok(json!({"success": true}))
}

/// Accepts `id`, `[id]` or `{"instanceId": id}`.
fn instance_id_param(params: &Value) -> Result<i64, RpcError> {
    match params {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| RpcError::invalid_params("instanceId must be an integer")),
        Value::Array(items) => items
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| RpcError::invalid_params("instanceId must be an integer")),
        _ => require_i64_param(params, "instance_id", "instanceId"),
    }
}

fn arg<'a>(args: &'a Value, index: usize, snake: &str, camel: &str) -> Option<&'a Value> {
    match args {
        Value::Array(items) => items.get(index),
        _ => args.get(snake).or_else(|| args.get(camel)),
    }
}

fn not_found(instance_id: i64) -> RpcError {
    RpcError::invalid_params(format!("Object with instance ID {} not found", instance_id))
}
