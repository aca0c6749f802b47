//! Validated payloads for `chat:*` frames.
//!
//! Ids arrive as decimal strings and are checked with the `number` rule
//! before any store call.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use validator::{Validate, ValidationError};

use plexus_protocol::models::ChatType;

use crate::ws::{decimal_id, decimal_ids};

const DEFAULT_PAGE: i64 = 50;

fn default_page() -> i64 {
    DEFAULT_PAGE
}

/// Global, regional and challenge chats are the only subscribable kinds.
fn subscribable_type(value: u8) -> Result<(), ValidationError> {
    match ChatType::try_from(value) {
        Ok(ty) if ty.is_open() => Ok(()),
        _ => Err(ValidationError::new("oneof")),
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct NewChatParams {
    #[validate(length(min = 1, max = 50))]
    pub name: String,
    #[validate(range(min = 2, max = 5))]
    pub chat_type: u8,
    #[validate(length(min = 1), custom(function = "decimal_ids"))]
    pub users: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct EditChatParams {
    #[serde(default)]
    #[validate(custom(function = "decimal_id"))]
    pub chat_id: String,
    #[serde(default)]
    #[validate(length(max = 20))]
    pub name: String,
    #[serde(default)]
    #[validate(custom(function = "decimal_ids"))]
    pub add_users: Vec<String>,
    #[serde(default)]
    #[validate(custom(function = "decimal_ids"))]
    pub remove_users: Vec<String>,
}

/// Payloads that only name a chat: delete, unsubscribe.
#[derive(Debug, Deserialize, Validate)]
pub struct ChatIdParams {
    #[serde(default)]
    #[validate(custom(function = "decimal_id"))]
    pub chat_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SendMessageParams {
    #[serde(default)]
    #[validate(custom(function = "decimal_id"))]
    pub chat_id: String,
    #[serde(default, alias = "content")]
    #[validate(length(min = 1, max = 4096))]
    pub body: String,
    #[serde(default)]
    #[validate(range(min = 0, max = 1))]
    pub message_type: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct GetChatsParams {
    #[serde(default)]
    #[validate(range(min = 0))]
    pub offset: i64,
    #[serde(default = "default_page")]
    #[validate(range(min = 1, max = 250))]
    pub limit: i64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct GetMessagesParams {
    #[serde(default)]
    #[validate(custom(function = "decimal_id"))]
    pub chat_id: String,
    /// Defaults to now.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub descending: bool,
    #[serde(default = "default_page")]
    #[validate(range(min = 1, max = 250))]
    pub limit: i64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SubscribeParams {
    #[serde(default)]
    #[validate(custom(function = "decimal_id"))]
    pub chat_id: String,
    #[validate(custom(function = "subscribable_type"))]
    pub chat_type: u8,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateReadParams {
    #[serde(default)]
    #[validate(custom(function = "decimal_id"))]
    pub chat_id: String,
    #[serde(default)]
    #[validate(custom(function = "decimal_id"))]
    pub message_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MuteParams {
    #[serde(default)]
    #[validate(custom(function = "decimal_id"))]
    pub chat_id: String,
    #[serde(default)]
    pub mute: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn errors<T: Validate>(params: &T) -> Vec<(String, String)> {
        match params.validate() {
            Ok(()) => Vec::new(),
            Err(errors) => {
                let mut out: Vec<_> = errors
                    .field_errors()
                    .into_iter()
                    .map(|(field, errs)| (field.to_string(), errs[0].code.to_string()))
                    .collect();
                out.sort();
                out
            }
        }
    }

    #[test]
    fn ids_must_be_decimal() {
        let params: ChatIdParams = serde_json::from_value(json!({"chat_id": "12x"})).unwrap();
        assert_eq!(errors(&params), vec![("chat_id".into(), "number".into())]);

        let params: ChatIdParams = serde_json::from_value(json!({})).unwrap();
        assert_eq!(errors(&params), vec![("chat_id".into(), "required".into())]);

        let params: ChatIdParams = serde_json::from_value(json!({"chat_id": "-4"})).unwrap();
        assert!(errors(&params).is_empty());
    }

    #[test]
    fn send_message_accepts_content_alias() {
        let params: SendMessageParams =
            serde_json::from_value(json!({"chat_id": "0", "content": "hi"})).unwrap();
        assert_eq!(params.body, "hi");
        assert!(errors(&params).is_empty());

        let empty: SendMessageParams = serde_json::from_value(json!({"chat_id": "0"})).unwrap();
        assert_eq!(errors(&empty), vec![("body".into(), "length".into())]);
    }

    #[test]
    fn new_chat_rules() {
        let params: NewChatParams = serde_json::from_value(json!({
            "name": "crew", "chat_type": 0, "users": ["2", "three"]
        }))
        .unwrap();
        assert_eq!(
            errors(&params),
            vec![("chat_type".into(), "range".into()), ("users".into(), "number".into())]
        );
    }

    #[test]
    fn subscribe_only_open_types() {
        let ok: SubscribeParams = serde_json::from_value(json!({"chat_id": "9", "chat_type": 0})).unwrap();
        assert!(errors(&ok).is_empty());
        let dm: SubscribeParams = serde_json::from_value(json!({"chat_id": "9", "chat_type": 2})).unwrap();
        assert_eq!(errors(&dm), vec![("chat_type".into(), "oneof".into())]);
    }

    #[test]
    fn paging_defaults() {
        let params: GetChatsParams = serde_json::from_value(json!({})).unwrap();
        assert_eq!((params.offset, params.limit), (0, DEFAULT_PAGE));
        let params: GetMessagesParams = serde_json::from_value(json!({"chat_id": "1", "limit": 0})).unwrap();
        assert_eq!(errors(&params), vec![("limit".into(), "range".into())]);
    }
}
