//! Chat platform API client.
//!
//! Expected failures are values, not errors: every call yields an
//! [`ApiResult`] and the outbound handler classifies it. Transport errors
//! become failures without an error code, which the classifier treats as
//! retryable.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Error code the platform uses for rate limiting.
pub const RATE_LIMITED: i32 = 429;

/// Outcome of one API call.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResult {
    /// The call succeeded; carries the `result` field.
    Success(Value),
    /// The call failed.
    Failure(ApiFailure),
}

/// A failed API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiFailure {
    /// Platform error code; absent for transport failures.
    pub error_code: Option<i32>,
    /// Human readable reason. Never contains the bot token.
    pub description: String,
    /// Minimum wait requested by the platform.
    pub retry_after_seconds: Option<u64>,
}

impl ApiFailure {
    /// Creates a failure without an error code.
    pub fn transport(description: impl Into<String>) -> Self {
        Self { error_code: None, description: description.into(), retry_after_seconds: None }
    }

    /// Creates a failure with a platform error code.
    pub fn with_code(error_code: i32, description: impl Into<String>) -> Self {
        Self { error_code: Some(error_code), description: description.into(), retry_after_seconds: None }
    }

    /// Whether a later attempt may succeed: no code, a server error or rate
    /// limiting.
    pub fn is_retryable(&self) -> bool {
        match self.error_code {
            None => true,
            Some(code) => code >= 500 || code == RATE_LIMITED,
        }
    }

    /// Minimum wait requested by the platform.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_seconds.map(Duration::from_secs)
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_code {
            Some(code) => write!(f, "{code}: {}", self.description),
            None => f.write_str(&self.description),
        }
    }
}

/// How the outbound worker treats a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodClass {
    /// Posts into a chat; paced per destination.
    Paced,
    /// Acknowledges an interaction; never retried.
    Answer,
    /// Anything else.
    Other,
}

impl MethodClass {
    /// Classifies a Bot API method name.
    pub fn of(method: &str) -> Self {
        if method.starts_with("answer") {
            Self::Answer
        } else if method.starts_with("send")
            || method.starts_with("edit")
            || matches!(method, "copyMessage" | "copyMessages" | "forwardMessage" | "forwardMessages")
        {
            Self::Paced
        } else {
            Self::Other
        }
    }

    /// Whether sends of this method go through the rate limiter.
    pub fn requires_pacing(self) -> bool {
        self == Self::Paced
    }

    /// Whether failures of this method are always terminal.
    pub fn is_answer(self) -> bool {
        self == Self::Answer
    }
}

/// Invokes remote API methods.
#[async_trait]
pub trait ApiClient: Send + Sync + fmt::Debug {
    /// Calls `method` with a JSON body.
    async fn call(&self, method: &str, payload: &Value) -> ApiResult;
}

/// Configuration for [`HttpApiClient`].
#[derive(Clone)]
pub struct ApiClientConfig {
    /// API root, e.g. `https://api.telegram.org`.
    pub base_url: String,
    /// Bot token. Only ever placed in the request path.
    pub token: String,
    /// Per-request timeout. Must exceed the long-poll timeout.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl fmt::Debug for ApiClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClientConfig")
            .field("base_url", &self.base_url)
            .field("token", &"***")
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.telegram.org".to_string(),
            token: String::new(),
            timeout: Duration::from_secs(60),
            user_agent: concat!("courier/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Bot API response envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error_code: Option<i32>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// HTTP implementation of [`ApiClient`] for the Bot API.
#[derive(Debug, Clone)]
pub struct HttpApiClient {
    client: reqwest::Client,
    config: ApiClientConfig,
}

impl HttpApiClient {
    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Configuration` if the HTTP client cannot be
    /// built or the base URL is empty.
    pub fn new(config: ApiClientConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(PipelineError::configuration("API base URL must not be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                PipelineError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.config.base_url.trim_end_matches('/'), self.config.token)
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn call(&self, method: &str, payload: &Value) -> ApiResult {
        let response = match self.client.post(self.method_url(method)).json(payload).send().await {
            Ok(response) => response,
            Err(e) => {
                let e = e.without_url();
                warn!(method, error = %e, "api request failed");
                let description = if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    format!("request failed: {e}")
                };
                return ApiResult::Failure(ApiFailure::transport(description));
            },
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return ApiResult::Failure(ApiFailure::transport(format!(
                    "failed to read response body: {}",
                    e.without_url()
                )));
            },
        };

        debug!(method, status = status.as_u16(), "api response received");

        let Ok(envelope) = serde_json::from_str::<Envelope>(&body) else {
            return ApiResult::Failure(ApiFailure::with_code(
                i32::from(status.as_u16()),
                format!("HTTP {}: non-JSON response", status.as_u16()),
            ));
        };

        if envelope.ok {
            return ApiResult::Success(envelope.result.unwrap_or(Value::Null));
        }

        ApiResult::Failure(ApiFailure {
            error_code: envelope.error_code.or(Some(i32::from(status.as_u16()))),
            description: envelope
                .description
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
            retry_after_seconds: envelope.parameters.and_then(|p| p.retry_after),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_posting_methods_are_paced() {
        for method in ["sendMessage", "sendPhoto", "editMessageText", "copyMessage", "forwardMessage"]
        {
            assert!(MethodClass::of(method).requires_pacing(), "{method}");
        }
        assert!(!MethodClass::of("getMe").requires_pacing());
        assert!(!MethodClass::of("answerCallbackQuery").requires_pacing());
    }

    #[test]
    fn answer_methods_are_classified() {
        assert!(MethodClass::of("answerCallbackQuery").is_answer());
        assert!(MethodClass::of("answerInlineQuery").is_answer());
        assert!(!MethodClass::of("sendMessage").is_answer());
    }

    #[test]
    fn retryable_codes() {
        assert!(ApiFailure::transport("connection reset").is_retryable());
        assert!(ApiFailure::with_code(500, "Internal").is_retryable());
        assert!(ApiFailure::with_code(502, "Bad Gateway").is_retryable());
        assert!(ApiFailure::with_code(429, "Too Many Requests").is_retryable());
        assert!(!ApiFailure::with_code(400, "Bad Request").is_retryable());
        assert!(!ApiFailure::with_code(403, "Forbidden").is_retryable());
    }

    #[test]
    fn failure_display_includes_code() {
        assert_eq!(
            ApiFailure::with_code(400, "Bad Request: chat not found").to_string(),
            "400: Bad Request: chat not found"
        );
        assert_eq!(ApiFailure::transport("request timed out").to_string(), "request timed out");
    }

    #[test]
    fn config_debug_masks_token() {
        let config = ApiClientConfig { token: "123:secret".to_string(), ..Default::default() };
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn method_url_embeds_token_and_trims_slash() {
        let client = HttpApiClient::new(ApiClientConfig {
            base_url: "http://localhost:8081/".to_string(),
            token: "42:abc".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(client.method_url("sendMessage"), "http://localhost:8081/bot42:abc/sendMessage");
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let result =
            HttpApiClient::new(ApiClientConfig { base_url: " ".to_string(), ..Default::default() });
        assert!(matches!(result, Err(PipelineError::Configuration { .. })));
    }
}
