use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::events::EventType;
use crate::ids::ToolCallId;
use crate::messages::StopReason;
use crate::tokens::TokenUsage;

/// Raw provider output, one variant per stream event type.
///
/// Per provider message the ordering contract is:
///
/// MessageStart → (TextContentBlockStart → TextDelta* → TextContentBlockStop
///                | ThinkingContentBlockStart → ThinkingDelta* → ThinkingContentBlockStop
///                | ToolUseContentBlockStart → InputJsonDelta* → ToolUseContentBlockStop
///                | ToolResult)* → MessageDelta? → MessageStop
///
/// A `tool_use` stop reason is followed by another MessageStart in the
/// same turn. Error may appear at any point; Interrupted ends the turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message_id: String,
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    MessageDelta {
        usage: TokenUsage,
    },
    MessageStop {
        stop_reason: StopReason,
    },

    TextContentBlockStart,
    TextDelta {
        text: String,
    },
    TextContentBlockStop,

    ThinkingContentBlockStart,
    ThinkingDelta {
        thinking: String,
    },
    ThinkingContentBlockStop,

    ToolUseContentBlockStart {
        id: ToolCallId,
        name: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    ToolUseContentBlockStop,

    /// Out-of-band result for a tool call the adapter executed.
    ToolResult {
        tool_use_id: ToolCallId,
        content: String,
        is_error: bool,
    },

    Interrupted {
        reason: String,
    },
    #[serde(rename = "error_received")]
    Error {
        error: AgentError,
    },
}

impl StreamEvent {
    /// Whether this event ends the turn.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::MessageStop { stop_reason } => stop_reason.ends_turn(),
            Self::Interrupted { .. } => true,
            _ => false,
        }
    }

    pub fn is_content_delta(&self) -> bool {
        matches!(
            self,
            Self::TextDelta { .. } | Self::ThinkingDelta { .. } | Self::InputJsonDelta { .. }
        )
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Self::MessageStart { .. } => EventType::MessageStart,
            Self::MessageDelta { .. } => EventType::MessageDelta,
            Self::MessageStop { .. } => EventType::MessageStop,
            Self::TextContentBlockStart => EventType::TextContentBlockStart,
            Self::TextDelta { .. } => EventType::TextDelta,
            Self::TextContentBlockStop => EventType::TextContentBlockStop,
            Self::ThinkingContentBlockStart => EventType::ThinkingContentBlockStart,
            Self::ThinkingDelta { .. } => EventType::ThinkingDelta,
            Self::ThinkingContentBlockStop => EventType::ThinkingContentBlockStop,
            Self::ToolUseContentBlockStart { .. } => EventType::ToolUseContentBlockStart,
            Self::InputJsonDelta { .. } => EventType::InputJsonDelta,
            Self::ToolUseContentBlockStop => EventType::ToolUseContentBlockStop,
            Self::ToolResult { .. } => EventType::ToolResult,
            Self::Interrupted { .. } => EventType::Interrupted,
            Self::Error { .. } => EventType::ErrorReceived,
        }
    }

    pub fn text_delta(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }

    pub fn input_json_delta(partial_json: impl Into<String>) -> Self {
        Self::InputJsonDelta {
            partial_json: partial_json.into(),
        }
    }

    pub fn message_stop(stop_reason: StopReason) -> Self {
        Self::MessageStop { stop_reason }
    }
}
