//! Business routing seam for inbound updates.
//!
//! Delivery is at-least-once: a router may see the same update again after
//! a worker crash, so its side effects must be idempotent.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::{
    error::{PipelineError, Result},
    update::IncomingUpdate,
};

/// Why the router did not handle an update.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// Recoverable; the update is retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// The update can never be handled; it fails without retry.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Handles decoded inbound updates.
#[async_trait]
pub trait Router: Send + Sync + fmt::Debug {
    /// Processes one update.
    async fn process(&self, update: &IncomingUpdate) -> std::result::Result<(), RouterError>;
}

/// Forwards updates as JSON to an application endpoint.
///
/// 2xx is success, 429/5xx and transport errors are transient, every other
/// status is a rejection.
#[derive(Debug, Clone)]
pub struct HttpRouter {
    client: reqwest::Client,
    url: String,
}

impl HttpRouter {
    /// Creates a router posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build().map_err(|e| {
            PipelineError::configuration(format!("failed to build router HTTP client: {e}"))
        })?;

        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl Router for HttpRouter {
    async fn process(&self, update: &IncomingUpdate) -> std::result::Result<(), RouterError> {
        let response = self
            .client
            .post(&self.url)
            .header("X-Update-Id", update.update_id.to_string())
            .json(&update.body)
            .send()
            .await
            .map_err(|e| RouterError::Transient(format!("router request failed: {e}")))?;

        let status = response.status();
        debug!(update_id = %update.update_id, status = status.as_u16(), "router responded");

        if status.is_success() {
            Ok(())
        } else if status.is_server_error() || status.as_u16() == 429 {
            Err(RouterError::Transient(format!("router returned HTTP {}", status.as_u16())))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(RouterError::Rejected(format!("router returned HTTP {}: {body}", status.as_u16())))
        }
    }
}
