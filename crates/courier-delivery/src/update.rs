//! Decoding of raw platform updates.

use courier_core::{ChatId, UpdateId};
use serde_json::{Map, Value};
use thiserror::Error;

/// Why a payload is not a usable update.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(String),
    /// Valid JSON but not an object.
    #[error("update is not a JSON object")]
    NotAnObject,
    /// `update_id` missing or not an integer.
    #[error("update_id missing or not an integer")]
    MissingUpdateId,
}

/// Context recorded with an idempotency key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateHints {
    /// Update kind, e.g. `message` or `callback_query`.
    pub kind: Option<String>,
    /// Chat the update belongs to, if any.
    pub chat_id: Option<ChatId>,
}

/// A decoded platform update handed to the router.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingUpdate {
    /// Platform update identifier.
    pub update_id: UpdateId,
    /// Update kind and chat.
    pub hints: UpdateHints,
    /// Full update object.
    pub body: Value,
}

impl IncomingUpdate {
    /// Decodes a raw update.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if `raw` is not a JSON object with an integer
    /// `update_id`.
    pub fn parse(raw: &str) -> Result<Self, DecodeError> {
        let body: Value = serde_json::from_str(raw).map_err(|e| DecodeError::Json(e.to_string()))?;
        Self::from_value(body)
    }

    /// Decodes an already parsed update.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if `body` is not an object with an integer
    /// `update_id`.
    pub fn from_value(body: Value) -> Result<Self, DecodeError> {
        let object = body.as_object().ok_or(DecodeError::NotAnObject)?;
        let update_id = object
            .get("update_id")
            .and_then(Value::as_i64)
            .map(UpdateId)
            .ok_or(DecodeError::MissingUpdateId)?;
        let hints = hints_from(object);

        Ok(Self { update_id, hints, body })
    }
}

fn hints_from(object: &Map<String, Value>) -> UpdateHints {
    let Some((kind, content)) = object.iter().find(|(key, _)| key.as_str() != "update_id") else {
        return UpdateHints::default();
    };

    let chat_id = content
        .pointer("/chat/id")
        .or_else(|| content.pointer("/message/chat/id"))
        .and_then(Value::as_i64)
        .map(ChatId);

    UpdateHints { kind: Some(kind.clone()), chat_id }
}
