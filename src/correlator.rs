use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;
use tokio::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub type Settlement = AppResult<Value>;

struct PendingRequest {
    command: String,
    created_at: DateTime<Utc>,
    sender: oneshot::Sender<Settlement>,
    timer: AbortHandle,
}

/// Waiter handed back by [`Correlator::register`].
#[derive(Debug)]
pub struct PendingCall {
    pub request_id: String,
    receiver: oneshot::Receiver<Settlement>,
}

impl PendingCall {
    pub async fn settled(self) -> Settlement {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(AppError::ProcessTerminated(format!(
                "request {} was abandoned before it settled",
                self.request_id
            ))),
        }
    }
}

/// In-flight table for one helper process. Every entry is removed exactly
/// once, by whichever of resolve, reject, timeout or `reject_all` gets there
/// first; the others become no-ops.
///
/// Ids are only checked for uniqueness among requests currently in flight.
/// Callers generate them (v4 UUIDs in practice), which makes a collision
/// vanishingly unlikely but not impossible.
#[derive(Clone)]
pub struct Correlator {
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    timeout: Duration,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Adds a waiter and arms its timeout. Fails if the id is already pending.
    pub async fn register(&self, request_id: &str, command: &str) -> AppResult<PendingCall> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(request_id) {
            return Err(AppError::Protocol(format!(
                "request id {} is already in flight",
                request_id
            )));
        }

        let (sender, receiver) = oneshot::channel();
        let timer = {
            let correlator = self.clone();
            let request_id = request_id.to_string();
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                correlator.expire(&request_id).await;
            })
            .abort_handle()
        };

        pending.insert(
            request_id.to_string(),
            PendingRequest {
                command: command.to_string(),
                created_at: Utc::now(),
                sender,
                timer,
            },
        );

        Ok(PendingCall {
            request_id: request_id.to_string(),
            receiver,
        })
    }

    pub async fn resolve(&self, request_id: &str, value: Value) -> bool {
        self.settle(request_id, Ok(value)).await
    }

    pub async fn reject(&self, request_id: &str, error: AppError) -> bool {
        self.settle(request_id, Err(error)).await
    }

    /// Fires when a request's timer runs out. No-op if it already settled.
    pub async fn expire(&self, request_id: &str) -> bool {
        let entry = self.pending.lock().await.remove(request_id);
        let Some(entry) = entry else {
            return false;
        };

        let elapsed_ms = (Utc::now() - entry.created_at).num_milliseconds().max(0);
        tracing::warn!(
            request_id = %request_id,
            command = %entry.command,
            elapsed_ms,
            "request timed out"
        );
        let _ = entry.sender.send(Err(AppError::Timeout(format!(
            "request {} ({}) got no response within {} ms",
            request_id,
            entry.command,
            self.timeout.as_millis()
        ))));
        true
    }

    /// Rejects every waiter with `error` and empties the table.
    pub async fn reject_all(&self, error: AppError) -> usize {
        let drained = {
            let mut pending = self.pending.lock().await;
            pending.drain().collect::<Vec<_>>()
        };

        let count = drained.len();
        for (_, entry) in drained {
            entry.timer.abort();
            let _ = entry.sender.send(Err(error.clone()));
        }
        count
    }

    pub async fn contains(&self, request_id: &str) -> bool {
        self.pending.lock().await.contains_key(request_id)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn settle(&self, request_id: &str, outcome: Settlement) -> bool {
        let entry = self.pending.lock().await.remove(request_id);
        let Some(entry) = entry else {
            return false;
        };

        entry.timer.abort();
        if entry.sender.send(outcome).is_err() {
            tracing::debug!(request_id = %request_id, "caller stopped waiting before settlement");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::Correlator;
    use crate::errors::AppError;
    use serde_json::json;
    use tokio::time::Duration;

    #[tokio::test]
    async fn resolves_the_matching_waiter_only() {
        let correlator = Correlator::default();
        let first = correlator.register("a", "echo").await.expect("register a");
        let second = correlator.register("b", "echo").await.expect("register b");

        assert!(correlator.resolve("b", json!({ "n": 2 })).await);
        assert!(correlator.resolve("a", json!({ "n": 1 })).await);

        assert_eq!(first.settled().await.expect("a"), json!({ "n": 1 }));
        assert_eq!(second.settled().await.expect("b"), json!({ "n": 2 }));
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_id_is_refused() {
        let correlator = Correlator::default();
        let _call = correlator.register("a", "echo").await.expect("register");
        let err = correlator.register("a", "echo").await.expect_err("duplicate");
        assert!(matches!(err, AppError::Protocol(_)));
    }

    #[tokio::test]
    async fn second_settlement_is_a_no_op() {
        let correlator = Correlator::default();
        let call = correlator.register("a", "echo").await.expect("register");
        assert!(correlator.reject("a", AppError::Helper("boom".to_string())).await);
        assert!(!correlator.resolve("a", json!({})).await);
        assert!(!correlator.reject("a", AppError::Helper("again".to_string())).await);
        assert_eq!(
            call.settled().await.expect_err("rejected"),
            AppError::Helper("boom".to_string())
        );
    }

    #[tokio::test]
    async fn timeout_rejects_once_and_ignores_late_response() {
        let correlator = Correlator::new(Duration::from_millis(50));
        let call = correlator.register("slow", "run_code").await.expect("register");
        let err = call.settled().await.expect_err("timed out");
        assert!(matches!(err, AppError::Timeout(_)));
        assert!(!correlator.resolve("slow", json!({ "late": true })).await);
        assert!(!correlator.contains("slow").await);
    }

    #[tokio::test]
    async fn resolved_request_is_not_timed_out_later() {
        let correlator = Correlator::new(Duration::from_millis(30));
        let call = correlator.register("fast", "echo").await.expect("register");
        assert!(correlator.resolve("fast", json!({ "ok": true })).await);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(call.settled().await.expect("resolved"), json!({ "ok": true }));
    }

    #[tokio::test]
    async fn reject_all_settles_every_waiter() {
        let correlator = Correlator::default();
        let calls = vec![
            correlator.register("a", "echo").await.expect("a"),
            correlator.register("b", "echo").await.expect("b"),
            correlator.register("c", "echo").await.expect("c"),
        ];
        let rejected = correlator
            .reject_all(AppError::ProcessTerminated("exit code 1".to_string()))
            .await;
        assert_eq!(rejected, 3);
        for call in calls {
            assert!(matches!(call.settled().await, Err(AppError::ProcessTerminated(_))));
        }
        assert_eq!(
            correlator
                .reject_all(AppError::ProcessTerminated("again".to_string()))
                .await,
            0
        );
    }
}
