//! Correlation of outbound requests with their eventual responses.
//!
//! Every outstanding request owns one entry keyed by its id. The entry is
//! removed by whichever of resolve, reject, expire or cancel reaches it
//! first; the others find nothing and become no-ops. All of them run under
//! the same lock, so exactly one outcome is ever delivered.

use crate::error::{HostlinkError, Result};
use crate::protocol::{RequestId, Response};
use crate::sync::lock;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

type Continuation = oneshot::Sender<Result<Value>>;

struct PendingRequest {
    method: String,
    created_at: Instant,
    /// Set once the request has been written to a live connection.
    sent: bool,
    tx: Continuation,
}

/// Table of requests awaiting a response.
pub struct CorrelationTable {
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next id from the monotonically increasing counter.
    pub fn next_id(&self) -> RequestId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        RequestId::Number(id as i64)
    }

    /// Register a continuation for `id`.
    pub fn register(
        &self,
        id: RequestId,
        method: impl Into<String>,
    ) -> Result<oneshot::Receiver<Result<Value>>> {
        let mut pending = lock(&self.pending);
        if pending.contains_key(&id) {
            return Err(HostlinkError::DuplicateId { id: id.to_string() });
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(
            id,
            PendingRequest {
                method: method.into(),
                created_at: Instant::now(),
                sent: false,
                tx,
            },
        );
        Ok(rx)
    }

    /// Allocate an id and register it in one step.
    pub fn register_next(
        &self,
        method: impl Into<String>,
    ) -> (RequestId, oneshot::Receiver<Result<Value>>) {
        let method = method.into();
        loop {
            let id = self.next_id();
            // Only collides with a caller-chosen numeric id.
            if let Ok(rx) = self.register(id.clone(), method.clone()) {
                return (id, rx);
            }
        }
    }

    /// Record that the request has been written to a connection.
    pub fn mark_sent(&self, id: &RequestId) -> bool {
        match lock(&self.pending).get_mut(id) {
            Some(entry) => {
                entry.sent = true;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        lock(&self.pending).contains_key(id)
    }

    /// Complete a pending request successfully.
    pub fn resolve(&self, id: &RequestId, result: Value) -> bool {
        self.settle(id, Ok(result))
    }

    /// Complete a pending request with an error.
    pub fn reject(&self, id: &RequestId, error: HostlinkError) -> bool {
        self.settle(id, Err(error))
    }

    fn settle(&self, id: &RequestId, outcome: Result<Value>) -> bool {
        let mut pending = lock(&self.pending);
        match pending.remove(id) {
            Some(entry) => {
                debug!(
                    request_id = %id,
                    method = %entry.method,
                    elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                    ok = outcome.is_ok(),
                    "Request settled"
                );
                // Sent while holding the lock so a racing expire sees either
                // the entry or the delivered value, never neither.
                let _ = entry.tx.send(outcome);
                true
            }
            None => {
                debug!(request_id = %id, "No pending request for response; ignoring");
                false
            }
        }
    }

    /// Route an inbound Response to its pending request.
    pub fn complete(&self, response: Response) -> bool {
        let Some(id) = response.id else {
            match response.outcome {
                Err(error) => debug!(
                    code = error.code,
                    message = %error.message,
                    "Peer reported an error for an unidentified frame"
                ),
                Ok(_) => debug!("Dropping response with null id"),
            }
            return false;
        };

        match response.outcome {
            Ok(result) => self.resolve(&id, result),
            Err(error) => self.reject(&id, HostlinkError::Remote(error)),
        }
    }

    /// Remove an entry whose deadline passed.
    ///
    /// Returns the timeout error when this call won the race, `None` when a
    /// response (or cancellation) got there first.
    pub fn expire(&self, id: &RequestId, after: Duration) -> Option<HostlinkError> {
        let entry = lock(&self.pending).remove(id)?;
        debug!(request_id = %id, method = %entry.method, "Request timed out");
        Some(HostlinkError::Timeout(after))
    }

    /// Drop the entry for `id` without delivering anything. Idempotent.
    pub fn cancel(&self, id: &RequestId) -> bool {
        lock(&self.pending).remove(id).is_some()
    }

    /// Reject every request that was already written to a connection.
    pub fn reject_sent(&self, error: impl Fn() -> HostlinkError) -> usize {
        self.reject_where(|entry| entry.sent, error)
    }

    /// Reject every pending request.
    pub fn reject_all(&self, error: impl Fn() -> HostlinkError) -> usize {
        self.reject_where(|_| true, error)
    }

    fn reject_where(
        &self,
        predicate: impl Fn(&PendingRequest) -> bool,
        error: impl Fn() -> HostlinkError,
    ) -> usize {
        let mut pending = lock(&self.pending);
        let ids: Vec<RequestId> = pending
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &ids {
            if let Some(entry) = pending.remove(id) {
                let _ = entry.tx.send(Err(error()));
            }
        }
        ids.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to the eventual outcome of one request.
///
/// Await it (or call [`wait`](Self::wait)) to get the result. Dropping it
/// before completion cancels the request's correlation entry. The timeout
/// counts from construction, so time spent before the first await is
/// included.
pub struct PendingResponse {
    id: RequestId,
    rx: Option<oneshot::Receiver<Result<Value>>>,
    table: Arc<CorrelationTable>,
    submitted_at: tokio::time::Instant,
    timeout: Option<Duration>,
}

impl PendingResponse {
    pub fn new(
        id: RequestId,
        rx: oneshot::Receiver<Result<Value>>,
        table: Arc<CorrelationTable>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            rx: Some(rx),
            table,
            submitted_at: tokio::time::Instant::now(),
            timeout,
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Replace the deadline; `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Abandon the request. Returns whether an entry was removed.
    pub fn cancel(&self) -> bool {
        self.table.cancel(&self.id)
    }

    /// Wait for the response, the deadline or cancellation.
    pub async fn wait(mut self) -> Result<Value> {
        let Some(mut rx) = self.rx.take() else {
            return Err(self.cancelled());
        };

        let received = match self.timeout {
            None => (&mut rx).await.ok(),
            Some(after) => {
                let deadline = self.submitted_at + after;
                match tokio::time::timeout_at(deadline, &mut rx).await {
                    Ok(outcome) => outcome.ok(),
                    Err(_) => match self.table.expire(&self.id, after) {
                        Some(err) => return Err(err),
                        // The response won the race and is already in the channel.
                        None => rx.try_recv().ok(),
                    },
                }
            }
        };

        received.unwrap_or_else(|| Err(self.cancelled()))
    }

    fn cancelled(&self) -> HostlinkError {
        HostlinkError::Cancelled {
            id: self.id.to_string(),
        }
    }
}

impl IntoFuture for PendingResponse {
    type Output = Result<Value>;
    type IntoFuture = BoxFuture<'static, Result<Value>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.table.cancel(&self.id);
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RpcError;
    use serde_json::json;

    fn pending(table: &Arc<CorrelationTable>, timeout: Option<Duration>) -> PendingResponse {
        let (id, rx) = table.register_next("test.method");
        PendingResponse::new(id, rx, Arc::clone(table), timeout)
    }

    #[test]
    fn test_ids_are_monotonic() {
        let table = CorrelationTable::new();
        assert_eq!(table.next_id(), RequestId::Number(1));
        assert_eq!(table.next_id(), RequestId::Number(2));
        let (id, _rx) = table.register_next("m");
        assert_eq!(id, RequestId::Number(3));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let table = CorrelationTable::new();
        let _rx = table.register(RequestId::from("a"), "m").unwrap();
        let err = table.register(RequestId::from("a"), "m").unwrap_err();
        assert!(matches!(err, HostlinkError::DuplicateId { .. }));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unknown_id_is_noop() {
        let table = CorrelationTable::new();
        assert!(!table.resolve(&RequestId::Number(99), json!(1)));
        assert!(!table.reject(&RequestId::Number(99), HostlinkError::ConnectionClosed));
        assert!(!table.complete(Response::error(None, RpcError::parse_error("x"))));
    }

    #[tokio::test]
    async fn test_resolve_delivers_result() {
        let table = Arc::new(CorrelationTable::new());
        let response = pending(&table, None);
        let id = response.id().clone();

        assert!(table.complete(Response::success(id.clone(), json!({"ok": true}))));
        assert_eq!(response.await.unwrap(), json!({"ok": true}));
        assert!(table.is_empty());

        // Late duplicate response
        assert!(!table.resolve(&id, json!(null)));
    }

    #[tokio::test]
    async fn test_remote_error_is_delivered() {
        let table = Arc::new(CorrelationTable::new());
        let response = pending(&table, None);
        let id = response.id().clone();

        table.complete(Response::error(
            Some(id),
            RpcError::method_not_found("host.nope"),
        ));
        let err = response.await.unwrap_err();
        assert_eq!(err.to_rpc_error_code(), -32601);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let table = Arc::new(CorrelationTable::new());
        let response = pending(&table, Some(Duration::from_millis(50)));
        let id = response.id().clone();

        let err = response.await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!table.contains(&id));
        assert!(!table.resolve(&id, json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_from_submission() {
        let table = Arc::new(CorrelationTable::new());
        let response = pending(&table, Some(Duration::from_millis(100)));
        tokio::time::sleep(Duration::from_millis(150)).await;

        let started = tokio::time::Instant::now();
        let err = response.await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_expire_after_resolve_is_noop() {
        let table = CorrelationTable::new();
        let (id, rx) = table.register_next("m");
        assert!(table.resolve(&id, json!(5)));
        assert!(table.expire(&id, Duration::from_secs(1)).is_none());
        assert_eq!(rx.await.unwrap().unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let table = Arc::new(CorrelationTable::new());
        let response = pending(&table, None);
        assert!(response.cancel());
        assert!(!response.cancel());
        assert!(table.is_empty());

        let err = response.await.unwrap_err();
        assert!(matches!(err, HostlinkError::Cancelled { .. }));
    }

    #[test]
    fn test_drop_cancels() {
        let table = Arc::new(CorrelationTable::new());
        let response = pending(&table, None);
        assert_eq!(table.len(), 1);
        drop(response);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_reject_sent_leaves_unsent_entries() {
        let table = Arc::new(CorrelationTable::new());
        let sent: Vec<_> = (0..3).map(|_| pending(&table, None)).collect();
        let unsent = pending(&table, None);
        for response in &sent {
            assert!(table.mark_sent(response.id()));
        }

        let rejected = table.reject_sent(|| HostlinkError::ConnectionClosed);
        assert_eq!(rejected, 3);
        assert_eq!(table.len(), 1);
        assert!(table.contains(unsent.id()));

        for response in sent {
            assert!(response.await.unwrap_err().is_connection_error());
        }

        assert_eq!(table.reject_all(|| HostlinkError::ConnectionClosed), 1);
        assert!(unsent.await.unwrap_err().is_connection_error());
    }
}
