use chrono::{ DateTime, Utc };
use serde::{ Serialize, Deserialize };
use serde_json::Value as JsonValue;

use super::chat::Message;

/// Inbound frames. `text` stays untyped so a non-string payload can be
/// reported as `empty_message` rather than a parse failure.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "action")]
pub enum ClientMessage {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "send_message")] SendMessage {
        #[serde(default)]
        text: JsonValue,
    },
}

impl ClientMessage {
    /// Anything that is not a known action maps to `unknown_action`.
    pub fn parse(raw: &str) -> Result<Self, ErrorCode> {
        serde_json::from_str(raw).map_err(|_| ErrorCode::UnknownAction)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    EmptyMessage,
    MessageTooLong,
    RateLimited,
    UnknownAction,
    PermissionDenied,
    ServerError,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "initial_messages")] InitialMessages {
        messages: Vec<Message>,
    },
    #[serde(rename = "message")] Message {
        message: Message,
    },
    #[serde(rename = "message_sent")] MessageSent {
        message: Message,
    },
    #[serde(rename = "pong")] Pong {
        ts: DateTime<Utc>,
    },
    #[serde(rename = "error")] Error {
        error: ErrorCode,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode) -> Self {
        ServerMessage::Error { error: code }
    }
}

/// WebSocket close codes used when a connection is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    MissingConversation,
    Anonymous,
    Forbidden,
    ConversationNotFound,
    Internal,
    /// Dropped for not keeping up with the conversation.
    SlowConsumer,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::MissingConversation => 4000,
            CloseReason::Anonymous => 4001,
            CloseReason::Forbidden => 4003,
            CloseReason::ConversationNotFound => 4004,
            CloseReason::Internal => 1011,
            CloseReason::SlowConsumer => 1013,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CloseReason::MissingConversation => "missing conversation",
            CloseReason::Anonymous => "authentication required",
            CloseReason::Forbidden => "forbidden",
            CloseReason::ConversationNotFound => "conversation not found",
            CloseReason::Internal => "internal error",
            CloseReason::SlowConsumer => "too far behind, reconnect",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_actions() {
        assert_eq!(ClientMessage::parse(r#"{"action":"ping"}"#), Ok(ClientMessage::Ping));
        match ClientMessage::parse(r#"{"action":"send_message","text":"hi"}"#) {
            Ok(ClientMessage::SendMessage { text }) => assert_eq!(text, "hi"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn send_message_without_text_is_null() {
        match ClientMessage::parse(r#"{"action":"send_message"}"#) {
            Ok(ClientMessage::SendMessage { text }) => assert!(text.is_null()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unknown_or_garbage_is_unknown_action() {
        assert_eq!(ClientMessage::parse(r#"{"action":"dance"}"#), Err(ErrorCode::UnknownAction));
        assert_eq!(ClientMessage::parse("not json"), Err(ErrorCode::UnknownAction));
    }

    #[test]
    fn error_event_shape() {
        let json = serde_json::to_value(ServerMessage::error(ErrorCode::RateLimited)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "error", "error": "rate_limited"}));
    }

    #[test]
    fn close_codes_are_distinct() {
        let codes = [
            CloseReason::MissingConversation,
            CloseReason::Anonymous,
            CloseReason::Forbidden,
            CloseReason::ConversationNotFound,
            CloseReason::Internal,
            CloseReason::SlowConsumer,
        ].map(|r| r.code());
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
