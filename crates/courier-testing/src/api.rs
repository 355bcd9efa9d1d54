//! Scripted platform API client.
//!
//! Responses are served in the order they were pushed; once the script runs
//! out every call succeeds with `true`. Each call is recorded with the clock
//! time it reached the client, which is what pacing assertions compare.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use courier_core::Clock;
use courier_delivery::{ApiClient, ApiFailure, ApiResult};
use serde_json::{json, Value};
use tokio::sync::Mutex;

/// One call observed by [`ScriptedApiClient`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// API method name.
    pub method: String,
    /// Request payload.
    pub payload: Value,
    /// Clock time the call started.
    pub at: Instant,
}

impl RecordedCall {
    /// The payload's `chat_id`, if numeric.
    pub fn chat_id(&self) -> Option<i64> {
        self.payload.get("chat_id").and_then(Value::as_i64)
    }
}

/// API client returning scripted results.
pub struct ScriptedApiClient {
    clock: Arc<dyn Clock>,
    script: Mutex<VecDeque<ApiResult>>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedApiClient {
    /// Creates a client that succeeds unless scripted otherwise.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            latency: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Makes every call take `latency` on the tokio timer.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queues a result for the next unscripted call.
    pub async fn push(&self, result: ApiResult) {
        self.script.lock().await.push_back(result);
    }

    /// Queues a successful result.
    pub async fn push_success(&self, result: Value) {
        self.push(ApiResult::Success(result)).await;
    }

    /// Queues a platform error.
    pub async fn push_error(&self, code: i32, description: &str) {
        self.push(ApiResult::Failure(ApiFailure::with_code(code, description))).await;
    }

    /// Queues a 429 carrying `retry_after` seconds.
    pub async fn push_rate_limited(&self, retry_after_seconds: u64) {
        let failure = ApiFailure {
            retry_after_seconds: Some(retry_after_seconds),
            ..ApiFailure::with_code(429, "Too Many Requests: retry later")
        };
        self.push(ApiResult::Failure(failure)).await;
    }

    /// Queues a transport failure with no response.
    pub async fn push_transport_error(&self, description: &str) {
        self.push(ApiResult::Failure(ApiFailure::transport(description))).await;
    }

    /// Every call made so far, in order.
    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    /// Calls made with `method`.
    pub async fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.calls.lock().await.iter().filter(|call| call.method == method).cloned().collect()
    }

    /// Number of calls made so far.
    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ScriptedApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedApiClient")
            .field("latency", &self.latency)
            .field("max_in_flight", &self.max_in_flight())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ApiClient for ScriptedApiClient {
    async fn call(&self, method: &str, payload: &Value) -> ApiResult {
        let current = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_flight.fetch_max(current, Ordering::AcqRel);

        self.calls.lock().await.push(RecordedCall {
            method: method.to_string(),
            payload: payload.clone(),
            at: self.clock.now(),
        });

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self.script.lock().await.pop_front();
        let result = scripted.unwrap_or_else(|| ApiResult::Success(json!(true)));
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        result
    }
}

#[cfg(test)]
mod tests {
    use courier_core::TestClock;

    use super::*;

    #[tokio::test]
    async fn script_is_served_in_order_then_succeeds() {
        let client = ScriptedApiClient::new(Arc::new(TestClock::new()));
        client.push_error(400, "Bad Request: chat not found").await;

        let first = client.call("sendMessage", &json!({"chat_id": 1})).await;
        let second = client.call("sendMessage", &json!({"chat_id": 1})).await;

        assert!(matches!(first, ApiResult::Failure(ref f) if f.error_code == Some(400)));
        assert_eq!(second, ApiResult::Success(json!(true)));
        assert_eq!(client.call_count().await, 2);
        assert_eq!(client.calls().await[0].chat_id(), Some(1));
    }

    #[tokio::test]
    async fn rate_limited_result_carries_retry_after() {
        let client = ScriptedApiClient::new(Arc::new(TestClock::new()));
        client.push_rate_limited(7).await;

        let ApiResult::Failure(failure) = client.call("sendMessage", &json!({})).await else {
            panic!("expected a failure");
        };
        assert_eq!(failure.retry_after(), Some(Duration::from_secs(7)));
        assert!(failure.is_retryable());
    }
}
