//! Platform update and outbound payload builders.

use serde_json::{json, Value};

/// Builder for platform updates.
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    update_id: i64,
    chat_id: i64,
    text: String,
    kind: UpdateKind,
}

#[derive(Debug, Clone, Copy)]
enum UpdateKind {
    Message,
    CallbackQuery,
    EditedMessage,
}

impl UpdateBuilder {
    /// Text message update with the given id.
    pub fn message(update_id: i64) -> Self {
        Self { update_id, chat_id: 1, text: "hello".to_string(), kind: UpdateKind::Message }
    }

    /// Callback query update with the given id.
    pub fn callback_query(update_id: i64) -> Self {
        Self { kind: UpdateKind::CallbackQuery, text: "button".to_string(), ..Self::message(update_id) }
    }

    /// Edited message update with the given id.
    pub fn edited_message(update_id: i64) -> Self {
        Self { kind: UpdateKind::EditedMessage, ..Self::message(update_id) }
    }

    /// Sets the chat.
    #[must_use]
    pub fn chat(mut self, chat_id: i64) -> Self {
        self.chat_id = chat_id;
        self
    }

    /// Sets the message text or callback data.
    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Builds the update object.
    pub fn build(self) -> Value {
        let message = json!({
            "message_id": self.update_id,
            "date": 1_700_000_000,
            "chat": {"id": self.chat_id, "type": "private"},
            "from": {"id": self.chat_id, "is_bot": false, "first_name": "Test"},
            "text": self.text,
        });

        match self.kind {
            UpdateKind::Message => json!({"update_id": self.update_id, "message": message}),
            UpdateKind::EditedMessage => {
                json!({"update_id": self.update_id, "edited_message": message})
            },
            UpdateKind::CallbackQuery => json!({
                "update_id": self.update_id,
                "callback_query": {
                    "id": format!("cb-{}", self.update_id),
                    "from": {"id": self.chat_id, "is_bot": false, "first_name": "Test"},
                    "message": message,
                    "data": self.text,
                },
            }),
        }
    }

    /// Builds the update as a raw JSON string.
    pub fn raw(self) -> String {
        self.build().to_string()
    }
}

/// `sendMessage` payload.
pub fn send_message(chat_id: i64, text: &str) -> Value {
    json!({"chat_id": chat_id, "text": text})
}

/// `answerCallbackQuery` payload.
pub fn answer_callback(callback_query_id: &str) -> Value {
    json!({"callback_query_id": callback_query_id})
}
