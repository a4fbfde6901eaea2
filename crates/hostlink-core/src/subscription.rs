//! Event subscriptions and fan-out.
//!
//! The registry maps event names to connection ids and holds only weak
//! references to the connections themselves. A connection that goes away
//! is pruned on the next publish even if nobody detached it.

use crate::connection::ConnectionId;
use crate::dispatch::DispatchTableBuilder;
use crate::error::Result;
use crate::protocol::{methods, params::name_param, Notification, RpcError};
use crate::sync::lock;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Something that can carry a Notification to one peer.
pub trait NotificationSink: Send + Sync {
    fn connection_id(&self) -> ConnectionId;

    fn deliver(&self, notification: Notification) -> Result<()>;
}

/// Outcome of one [`SubscriptionRegistry::publish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
    /// Subscriptions dropped because their connection no longer exists.
    pub pruned: usize,
}

#[derive(Default)]
struct RegistryState {
    events: HashMap<String, HashSet<ConnectionId>>,
    sinks: HashMap<ConnectionId, Weak<dyn NotificationSink>>,
}

impl RegistryState {
    fn remove_connection(&mut self, id: ConnectionId) -> usize {
        let mut dropped = 0;
        self.events.retain(|_, subscribers| {
            if subscribers.remove(&id) {
                dropped += 1;
            }
            !subscribers.is_empty()
        });
        self.sinks.remove(&id);
        dropped
    }
}

/// Event name to subscriber set.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a connection reachable by publish.
    pub fn attach<S: NotificationSink + 'static>(&self, sink: &Arc<S>) {
        let sink: Arc<dyn NotificationSink> = sink.clone();
        let id = sink.connection_id();
        lock(&self.state).sinks.insert(id, Arc::downgrade(&sink));
    }

    /// Forget a connection and every subscription it held.
    pub fn detach(&self, id: ConnectionId) -> usize {
        let dropped = lock(&self.state).remove_connection(id);
        if dropped > 0 {
            debug!(connection_id = %id, dropped, "Dropped subscriptions of closed connection");
        }
        dropped
    }

    /// Subscribe `id` to `event`. Returns `false` if it already was.
    pub fn subscribe(&self, event: &str, id: ConnectionId) -> bool {
        let added = lock(&self.state)
            .events
            .entry(event.to_string())
            .or_default()
            .insert(id);
        debug!(connection_id = %id, event, added, "Subscribe");
        added
    }

    /// Unsubscribe `id` from `event`. Unknown pairs are a no-op.
    pub fn unsubscribe(&self, event: &str, id: ConnectionId) -> bool {
        let mut state = lock(&self.state);
        let Some(subscribers) = state.events.get_mut(event) else {
            return false;
        };
        let removed = subscribers.remove(&id);
        if subscribers.is_empty() {
            state.events.remove(event);
        }
        debug!(connection_id = %id, event, removed, "Unsubscribe");
        removed
    }

    /// Send one Notification for `event` to every current subscriber.
    ///
    /// A failed delivery is logged and counted; it never stops delivery to
    /// the remaining subscribers.
    pub fn publish(&self, event: &str, payload: Value) -> PublishReport {
        let mut report = PublishReport::default();

        // Snapshot targets so delivery happens outside the lock.
        let targets: Vec<Arc<dyn NotificationSink>> = {
            let mut state = lock(&self.state);
            let Some(subscribers) = state.events.get(event) else {
                return report;
            };

            let mut live = Vec::with_capacity(subscribers.len());
            let mut dead = Vec::new();
            for id in subscribers {
                match state.sinks.get(id).and_then(Weak::upgrade) {
                    Some(sink) => live.push(sink),
                    None => dead.push(*id),
                }
            }
            for id in dead {
                report.pruned += state.remove_connection(id);
            }
            live
        };

        let params = if payload.is_null() { None } else { Some(payload) };
        for sink in targets {
            let notification = Notification::new(event, params.clone());
            match sink.deliver(notification) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        connection_id = %sink.connection_id(),
                        event,
                        error = %e,
                        "Failed to deliver event notification"
                    );
                }
            }
        }

        debug!(
            event,
            delivered = report.delivered,
            failed = report.failed,
            pruned = report.pruned,
            "Published event"
        );
        report
    }

    /// Connections currently subscribed to `event`.
    pub fn subscribers(&self, event: &str) -> Vec<ConnectionId> {
        lock(&self.state)
            .events
            .get(event)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Events `id` is subscribed to, sorted.
    pub fn subscriptions_of(&self, id: ConnectionId) -> Vec<String> {
        let state = lock(&self.state);
        let mut events: Vec<String> = state
            .events
            .iter()
            .filter(|(_, subscribers)| subscribers.contains(&id))
            .map(|(event, _)| event.clone())
            .collect();
        events.sort();
        events
    }

    pub fn is_attached(&self, id: ConnectionId) -> bool {
        lock(&self.state).sinks.contains_key(&id)
    }

    /// Bind `host.subscribeToEvent` and `host.unsubscribeFromEvent` to this
    /// registry. The event name is a bare string or `{"event": name}`.
    pub fn register_methods(self: &Arc<Self>, builder: &mut DispatchTableBuilder) {
        let registry = Arc::clone(self);
        builder.register_fn(methods::SUBSCRIBE_TO_EVENT, move |ctx, params| {
            let registry = Arc::clone(&registry);
            async move {
                let event = name_param(params.as_ref(), "event")?;
                registry.subscribe(&event, ctx.connection_id);
                Ok::<Value, RpcError>(json!({"success": true, "event": event}))
            }
        });

        let registry = Arc::clone(self);
        builder.register_fn(methods::UNSUBSCRIBE_FROM_EVENT, move |ctx, params| {
            let registry = Arc::clone(&registry);
            async move {
                let event = name_param(params.as_ref(), "event")?;
                registry.unsubscribe(&event, ctx.connection_id);
                Ok::<Value, RpcError>(json!({"success": true, "event": event}))
            }
        });
    }
}
