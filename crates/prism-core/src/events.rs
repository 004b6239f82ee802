use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::ids::{AgentId, EventId, ExchangeId, MessageId, TurnId};
use crate::messages::{Message, UserMessage};
use crate::state::{AgentState, ToolCallStatus, Transition};
use crate::stream::StreamEvent;
use crate::tokens::TokenUsage;

/// An event on the agent bus. Immutable once published.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub body: EventBody,
}

impl Event {
    pub fn new(agent_id: AgentId, body: EventBody) -> Self {
        Self {
            id: EventId::new(),
            agent_id,
            timestamp: Utc::now(),
            event_type: body.event_type(),
            body,
        }
    }

    pub fn stream(
        agent_id: AgentId,
        turn_id: TurnId,
        content_block_index: Option<u32>,
        event: StreamEvent,
    ) -> Self {
        Self::new(
            agent_id,
            EventBody::Stream(StreamPayload {
                turn_id,
                content_block_index,
                event,
            }),
        )
    }

    pub fn message(agent_id: AgentId, turn_id: Option<TurnId>, message: Message) -> Self {
        Self::new(agent_id, EventBody::Message(MessagePayload { turn_id, message }))
    }

    pub fn command(agent_id: AgentId, command: Command) -> Self {
        Self::new(agent_id, EventBody::Command(command))
    }

    pub fn as_stream(&self) -> Option<&StreamPayload> {
        match &self.body {
            EventBody::Stream(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_state(&self) -> Option<&StatePayload> {
        match &self.body {
            EventBody::State(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&MessagePayload> {
        match &self.body {
            EventBody::Message(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_exchange(&self) -> Option<&ExchangePayload> {
        match &self.body {
            EventBody::Exchange(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_command(&self) -> Option<&Command> {
        match &self.body {
            EventBody::Command(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layer", content = "payload", rename_all = "snake_case")]
pub enum EventBody {
    Stream(StreamPayload),
    State(StatePayload),
    Message(MessagePayload),
    Exchange(ExchangePayload),
    Command(Command),
}

impl EventBody {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Stream(p) => p.event.event_type(),
            Self::State(_) => EventType::StateChanged,
            Self::Message(p) => match p.message {
                Message::User(_) => EventType::UserMessage,
                Message::Assistant(_) => EventType::AssistantMessage,
                Message::ToolUse(_) => EventType::ToolUseMessage,
                Message::Error(_) => EventType::ErrorMessage,
            },
            Self::Exchange(ExchangePayload::Request(_)) => EventType::ExchangeRequest,
            Self::Exchange(ExchangePayload::Response(_)) => EventType::ExchangeResponse,
            Self::Command(Command::SendMessage { .. }) => EventType::SendMessage,
            Self::Command(Command::Interrupt { .. }) => EventType::Interrupt,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPayload {
    /// Shared by every stream event of one turn.
    pub turn_id: TurnId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_block_index: Option<u32>,
    pub event: StreamEvent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePayload {
    pub state: AgentState,
    pub previous_state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<TurnId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<TurnId>,
    pub message: Message,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExchangePayload {
    Request(ExchangeRequest),
    Response(ExchangeResponse),
}

impl ExchangePayload {
    pub fn exchange_id(&self) -> &ExchangeId {
        match self {
            Self::Request(r) => &r.exchange_id,
            Self::Response(r) => &r.exchange_id,
        }
    }

    pub fn exchange_number(&self) -> u64 {
        match self {
            Self::Request(r) => r.exchange_number,
            Self::Response(r) => r.exchange_number,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRequest {
    pub exchange_id: ExchangeId,
    pub exchange_number: u64,
    pub user_message: UserMessage,
    pub requested_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeResponse {
    pub exchange_id: ExchangeId,
    pub exchange_number: u64,
    pub request_message_id: MessageId,
    pub response_message_id: MessageId,
    pub requested_at: DateTime<Utc>,
    pub responded_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: ExchangeOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExchangeOutcome {
    Success,
    Error { error: AgentError },
}

impl ExchangeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Host requests carried on the bus into the reactors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    SendMessage { turn_id: TurnId, message: UserMessage },
    Interrupt { reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLayer {
    Stream,
    State,
    Message,
    Exchange,
    Command,
}

/// Closed discriminant over every event type that can appear on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // stream
    MessageStart,
    MessageDelta,
    MessageStop,
    TextContentBlockStart,
    TextDelta,
    TextContentBlockStop,
    ThinkingContentBlockStart,
    ThinkingDelta,
    ThinkingContentBlockStop,
    ToolUseContentBlockStart,
    InputJsonDelta,
    ToolUseContentBlockStop,
    ToolResult,
    Interrupted,
    ErrorReceived,
    // state
    StateChanged,
    // message
    UserMessage,
    AssistantMessage,
    ToolUseMessage,
    ErrorMessage,
    // exchange
    ExchangeRequest,
    ExchangeResponse,
    // command
    SendMessage,
    Interrupt,
}

impl EventType {
    pub fn layer(&self) -> EventLayer {
        match self {
            Self::StateChanged => EventLayer::State,
            Self::UserMessage | Self::AssistantMessage | Self::ToolUseMessage | Self::ErrorMessage => {
                EventLayer::Message
            }
            Self::ExchangeRequest | Self::ExchangeResponse => EventLayer::Exchange,
            Self::SendMessage | Self::Interrupt => EventLayer::Command,
            _ => EventLayer::Stream,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageStart => "message_start",
            Self::MessageDelta => "message_delta",
            Self::MessageStop => "message_stop",
            Self::TextContentBlockStart => "text_content_block_start",
            Self::TextDelta => "text_delta",
            Self::TextContentBlockStop => "text_content_block_stop",
            Self::ThinkingContentBlockStart => "thinking_content_block_start",
            Self::ThinkingDelta => "thinking_delta",
            Self::ThinkingContentBlockStop => "thinking_content_block_stop",
            Self::ToolUseContentBlockStart => "tool_use_content_block_start",
            Self::InputJsonDelta => "input_json_delta",
            Self::ToolUseContentBlockStop => "tool_use_content_block_stop",
            Self::ToolResult => "tool_result",
            Self::Interrupted => "interrupted",
            Self::ErrorReceived => "error_received",
            Self::StateChanged => "state_changed",
            Self::UserMessage => "user_message",
            Self::AssistantMessage => "assistant_message",
            Self::ToolUseMessage => "tool_use_message",
            Self::ErrorMessage => "error_message",
            Self::ExchangeRequest => "exchange_request",
            Self::ExchangeResponse => "exchange_response",
            Self::SendMessage => "send_message",
            Self::Interrupt => "interrupt",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
