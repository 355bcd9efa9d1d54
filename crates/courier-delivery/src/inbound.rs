//! Inbound row handling: decode, then route.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::InboundUpdate;
use tracing::debug;

use crate::{
    router::{Router, RouterError},
    update::IncomingUpdate,
    worker::{Handler, Outcome},
};

/// Decodes stored updates and hands them to the router.
///
/// Undecodable payloads fail at once. Transient router errors retry until
/// the attempt ceiling; rejections fail at once.
#[derive(Debug)]
pub struct InboundHandler {
    router: Arc<dyn Router>,
}

impl InboundHandler {
    /// Creates a handler routing through `router`.
    pub fn new(router: Arc<dyn Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Handler<InboundUpdate> for InboundHandler {
    async fn handle(&self, entry: &InboundUpdate) -> Outcome {
        let update = match IncomingUpdate::parse(&entry.payload) {
            Ok(update) => update,
            Err(e) => return Outcome::fail(format!("malformed update: {e}")),
        };

        debug!(
            entry_id = %entry.id,
            update_id = %update.update_id,
            kind = update.hints.kind.as_deref().unwrap_or("unknown"),
            "routing update"
        );

        match self.router.process(&update).await {
            Ok(()) => Outcome::Done,
            Err(RouterError::Transient(reason)) => Outcome::retry(reason),
            Err(RouterError::Rejected(reason)) => Outcome::fail(reason),
        }
    }
}
