use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

/// Lifecycle state of one agent. Exactly one value is current at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Initializing,
    Ready,
    ConversationThinking,
    ConversationResponding,
    ToolPlanned,
    ToolExecuting,
    ToolCompleted,
    ToolFailed,
    StreamActive,
    Error,
    Destroyed,
}

impl AgentState {
    /// `Destroyed` is the only state with no outgoing transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::ConversationThinking => "conversation_thinking",
            Self::ConversationResponding => "conversation_responding",
            Self::ToolPlanned => "tool_planned",
            Self::ToolExecuting => "tool_executing",
            Self::ToolCompleted => "tool_completed",
            Self::ToolFailed => "tool_failed",
            Self::StreamActive => "stream_active",
            Self::Error => "error",
            Self::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    Planned,
    Executing,
    Completed,
    Failed,
}

impl ToolCallState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub reason: String,
    /// Time spent in the previous state.
    pub duration_ms: u64,
    /// Type name of the event that caused the transition.
    pub trigger: String,
}

/// Sub-state of one in-flight tool call, attached to tool-related
/// state events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallStatus {
    pub id: ToolCallId,
    pub name: String,
    pub state: ToolCallState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_destroyed_is_terminal() {
        assert!(AgentState::Destroyed.is_terminal());
        assert!(!AgentState::Error.is_terminal());
        assert!(!AgentState::Ready.is_terminal());
    }

    #[test]
    fn as_str_matches_serde() {
        for state in [
            AgentState::Initializing,
            AgentState::ConversationResponding,
            AgentState::ToolExecuting,
            AgentState::StreamActive,
        ] {
            let json = serde_json::to_value(state).unwrap();
            assert_eq!(json, state.as_str());
        }
    }

    #[test]
    fn finished_tool_states() {
        assert!(ToolCallState::Completed.is_finished());
        assert!(ToolCallState::Failed.is_finished());
        assert!(!ToolCallState::Executing.is_finished());
    }
}
