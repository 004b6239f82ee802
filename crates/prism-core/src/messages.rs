use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{AgentError, ErrorCategory};
use crate::ids::{MessageId, ToolCallId};
use crate::tokens::TokenUsage;

/// A complete message as published on the Message layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolUse(ToolUseMessage),
    Error(ErrorMessage),
}

impl Message {
    pub fn id(&self) -> &MessageId {
        match self {
            Self::User(m) => &m.id,
            Self::Assistant(m) => &m.id,
            Self::ToolUse(m) => &m.id,
            Self::Error(m) => &m.id,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Assistant(_) => "assistant",
            Self::ToolUse(_) => "tool_use",
            Self::Error(_) => "error",
        }
    }

    pub fn parent_id(&self) -> Option<&MessageId> {
        match self {
            Self::User(m) => m.parent_id.as_ref(),
            Self::Assistant(m) => m.parent_id.as_ref(),
            Self::ToolUse(m) => m.parent_id.as_ref(),
            Self::Error(m) => m.parent_id.as_ref(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::User(m) => m.timestamp,
            Self::Assistant(m) => m.timestamp,
            Self::ToolUse(m) => m.timestamp,
            Self::Error(m) => m.timestamp,
        }
    }

    /// Assistant messages and terminal error messages close a turn.
    pub fn ends_turn(&self) -> bool {
        match self {
            Self::Assistant(_) => true,
            Self::Error(m) => m.terminal,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub id: MessageId,
    pub content: Vec<UserContent>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
}

impl UserMessage {
    pub fn new(content: Vec<UserContent>) -> Self {
        Self {
            id: MessageId::new(),
            content,
            timestamp: Utc::now(),
            parent_id: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![UserContent::Text { text: text.into() }])
    }

    /// All text parts joined, images skipped.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                UserContent::Text { text } => Some(text.as_str()),
                UserContent::Image { .. } => None,
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserContent {
    Text { text: String },
    Image { mime_type: String, data: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Error,
}

impl StopReason {
    /// `tool_use` hands control back to the adapter for another provider
    /// message in the same turn; every other reason ends the turn.
    pub fn ends_turn(&self) -> bool {
        !matches!(self, Self::ToolUse)
    }

    pub fn is_normal_completion(&self) -> bool {
        matches!(self, Self::EndTurn | Self::MaxTokens | Self::StopSequence)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallBlock {
    pub id: ToolCallId,
    pub name: String,
    pub input: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultBlock {
    pub content: String,
    pub is_error: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub id: MessageId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallBlock>,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
}

/// A tool call paired with its result, for display.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseMessage {
    pub id: MessageId,
    pub tool_call: ToolCallBlock,
    /// `None` when the turn ended before the result arrived.
    pub result: Option<ToolResultBlock>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub id: MessageId,
    pub error: AgentError,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_content: Option<String>,
    /// True when this message closes the turn that produced it.
    pub terminal: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
}

impl ErrorMessage {
    pub fn new(error: AgentError, terminal: bool) -> Self {
        Self {
            id: MessageId::new(),
            error,
            partial_content: None,
            terminal,
            timestamp: Utc::now(),
            parent_id: None,
        }
    }

    pub fn subtype(&self) -> ErrorCategory {
        self.error.category
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;

    #[test]
    fn user_text_content_skips_images() {
        let msg = UserMessage::new(vec![
            UserContent::Text { text: "look at ".into() },
            UserContent::Image {
                mime_type: "image/png".into(),
                data: "AAAA".into(),
            },
            UserContent::Text { text: "this".into() },
        ]);
        assert_eq!(msg.text_content(), "look at this");
    }

    #[test]
    fn stop_reason_turn_semantics() {
        assert!(StopReason::EndTurn.ends_turn());
        assert!(StopReason::Error.ends_turn());
        assert!(!StopReason::ToolUse.ends_turn());
        assert!(StopReason::MaxTokens.is_normal_completion());
        assert!(!StopReason::Error.is_normal_completion());
    }

    #[test]
    fn ends_turn_by_role() {
        let user = Message::User(UserMessage::text("hi"));
        assert!(!user.ends_turn());

        let diag = Message::Error(ErrorMessage::new(AgentError::internal("x"), false));
        assert!(!diag.ends_turn());

        let closing = Message::Error(ErrorMessage::new(AgentError::internal("x"), true));
        assert!(closing.ends_turn());
    }

    #[test]
    fn error_subtype_is_category() {
        let msg = ErrorMessage::new(AgentError::new(ErrorCode::MalformedToolInput, "bad"), true);
        assert_eq!(msg.subtype(), ErrorCategory::Validation);
    }

    #[test]
    fn role_tag_serialization() {
        let json = serde_json::to_value(Message::User(UserMessage::text("hi"))).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "text");
        assert!(json.get("parentId").is_none());
    }
}
