use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use prism_core::events::{Command, Event, EventBody, EventType, StatePayload, StreamPayload};
use prism_core::ids::{AgentId, ToolCallId, TurnId};
use prism_core::state::{AgentState, ToolCallState, ToolCallStatus, Transition};
use prism_core::stream::StreamEvent;
use tracing::{debug, trace};

use crate::error::EngineError;
use crate::reactor::{FailureReporter, Reactor, ReactorContext};

pub const NAME: &str = "state_machine";

/// Event types the machine reacts to. Anything else never reaches it.
const HANDLED: &[EventType] = &[
    EventType::SendMessage,
    EventType::MessageStart,
    EventType::ThinkingContentBlockStart,
    EventType::TextContentBlockStart,
    EventType::ToolUseContentBlockStart,
    EventType::ToolUseContentBlockStop,
    EventType::ToolResult,
    EventType::MessageStop,
    EventType::Interrupted,
    EventType::ErrorReceived,
];

struct ToolEntry {
    name: String,
    state: ToolCallState,
}

struct AgentMachine {
    state: AgentState,
    entered_at: Instant,
    tools: HashMap<ToolCallId, ToolEntry>,
    block_tools: HashMap<(TurnId, u32), ToolCallId>,
    last_planned: Option<ToolCallId>,
}

impl AgentMachine {
    fn new(state: AgentState) -> Self {
        Self {
            state,
            entered_at: Instant::now(),
            tools: HashMap::new(),
            block_tools: HashMap::new(),
            last_planned: None,
        }
    }

    fn transition(
        &mut self,
        target: AgentState,
        reason: impl Into<String>,
        trigger: &str,
        tool_call: Option<ToolCallStatus>,
        turn_id: Option<TurnId>,
    ) -> Option<StatePayload> {
        if self.state.is_terminal() {
            return None;
        }
        if target == self.state && tool_call.is_none() {
            return None;
        }

        let now = Instant::now();
        let previous = self.state;
        let duration_ms = now.duration_since(self.entered_at).as_millis() as u64;
        self.state = target;
        if target != previous {
            self.entered_at = now;
        }
        if matches!(target, AgentState::Ready | AgentState::Destroyed) {
            self.tools.clear();
            self.block_tools.clear();
            self.last_planned = None;
        }

        Some(StatePayload {
            state: target,
            previous_state: previous,
            transition: Some(Transition {
                reason: reason.into(),
                duration_ms,
                trigger: trigger.to_string(),
            }),
            tool_call,
            turn_id,
        })
    }

    fn tool_status(&self, id: &ToolCallId) -> Option<ToolCallStatus> {
        self.tools.get(id).map(|t| ToolCallStatus {
            id: id.clone(),
            name: t.name.clone(),
            state: t.state,
        })
    }

    fn set_tool_state(&mut self, id: &ToolCallId, state: ToolCallState) -> Option<ToolCallStatus> {
        let entry = self.tools.get_mut(id)?;
        entry.state = state;
        self.tool_status(id)
    }

    fn on_stream(&mut self, payload: &StreamPayload) -> Option<StatePayload> {
        let trigger = payload.event.event_type().as_str();
        let turn = Some(payload.turn_id.clone());

        match &payload.event {
            StreamEvent::MessageStart { .. } => {
                self.transition(AgentState::StreamActive, "message_started", trigger, None, turn)
            }
            StreamEvent::ThinkingContentBlockStart => self.transition(
                AgentState::ConversationThinking,
                "thinking_started",
                trigger,
                None,
                turn,
            ),
            StreamEvent::TextContentBlockStart => {
                let responding = matches!(
                    self.state,
                    AgentState::StreamActive
                        | AgentState::ConversationThinking
                        | AgentState::ToolCompleted
                        | AgentState::ToolFailed
                );
                if !responding {
                    return None;
                }
                self.transition(
                    AgentState::ConversationResponding,
                    "response_started",
                    trigger,
                    None,
                    turn,
                )
            }
            StreamEvent::ToolUseContentBlockStart { id, name } => {
                self.tools.insert(
                    id.clone(),
                    ToolEntry {
                        name: name.clone(),
                        state: ToolCallState::Planned,
                    },
                );
                if let Some(index) = payload.content_block_index {
                    self.block_tools
                        .insert((payload.turn_id.clone(), index), id.clone());
                }
                self.last_planned = Some(id.clone());
                let status = self.tool_status(id);
                self.transition(AgentState::ToolPlanned, "tool_planned", trigger, status, turn)
            }
            StreamEvent::ToolUseContentBlockStop => {
                let id = payload
                    .content_block_index
                    .and_then(|i| self.block_tools.get(&(payload.turn_id.clone(), i)).cloned())
                    .or_else(|| self.last_planned.clone())?;
                if self.tools.get(&id).is_some_and(|t| t.state.is_finished()) {
                    debug!(tool_call_id = %id, "block stop after tool result; state kept");
                    return None;
                }
                let status = self.set_tool_state(&id, ToolCallState::Executing);
                self.transition(
                    AgentState::ToolExecuting,
                    "tool_execution_started",
                    trigger,
                    status,
                    turn,
                )
            }
            StreamEvent::ToolResult {
                tool_use_id,
                is_error,
                ..
            } => {
                let (target, tool_state, reason) = if *is_error {
                    (AgentState::ToolFailed, ToolCallState::Failed, "tool_failed")
                } else {
                    (AgentState::ToolCompleted, ToolCallState::Completed, "tool_completed")
                };
                let Some(status) = self.set_tool_state(tool_use_id, tool_state) else {
                    debug!(tool_call_id = %tool_use_id, "result for unknown tool call ignored");
                    return None;
                };
                self.transition(target, reason, trigger, Some(status), turn)
            }
            StreamEvent::MessageStop { stop_reason } if stop_reason.ends_turn() => {
                let reason = if self.state == AgentState::Error {
                    "error_cleared"
                } else {
                    "turn_completed"
                };
                self.transition(AgentState::Ready, reason, trigger, None, turn)
            }
            StreamEvent::Interrupted { .. } => {
                self.transition(AgentState::Ready, "interrupted", trigger, None, turn)
            }
            StreamEvent::Error { error } => self.transition(
                AgentState::Error,
                format!("error_received: {}", error.code),
                trigger,
                None,
                turn,
            ),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Machines {
    agents: HashMap<AgentId, AgentMachine>,
}

/// Read access to the current state of every agent the machine tracks.
#[derive(Clone, Default)]
pub struct StateHandle {
    inner: Arc<Mutex<Machines>>,
}

impl StateHandle {
    pub fn current(&self, agent_id: &AgentId) -> Option<AgentState> {
        self.inner.lock().agents.get(agent_id).map(|m| m.state)
    }

    pub fn tool_state(&self, agent_id: &AgentId, tool_call_id: &ToolCallId) -> Option<ToolCallState> {
        self.inner
            .lock()
            .agents
            .get(agent_id)
            .and_then(|m| m.tools.get(tool_call_id))
            .map(|t| t.state)
    }

    fn apply(&self, event: &Event) -> Option<StatePayload> {
        let mut machines = self.inner.lock();
        let machine = machines
            .agents
            .entry(event.agent_id.clone())
            .or_insert_with(|| AgentMachine::new(AgentState::Ready));

        match &event.body {
            EventBody::Stream(payload) => machine.on_stream(payload),
            EventBody::Command(Command::SendMessage { turn_id, .. }) => {
                if !matches!(machine.state, AgentState::Ready | AgentState::Error) {
                    return None;
                }
                machine.transition(
                    AgentState::ConversationThinking,
                    "user_message",
                    EventType::SendMessage.as_str(),
                    None,
                    Some(turn_id.clone()),
                )
            }
            _ => None,
        }
    }

    fn lifecycle(&self, agent_id: &AgentId, target: AgentState, reason: &str, trigger: &str) -> Vec<(AgentId, StatePayload)> {
        let mut machines = self.inner.lock();
        machines
            .agents
            .entry(agent_id.clone())
            .or_insert_with(|| AgentMachine::new(AgentState::Initializing));
        machines
            .agents
            .iter_mut()
            .filter(|(id, _)| target == AgentState::Destroyed || *id == agent_id)
            .filter_map(|(id, m)| m.transition(target, reason, trigger, None, None).map(|p| (id.clone(), p)))
            .collect()
    }
}

/// Tracks one [`AgentState`] per agent, plus a sub-state per tool call, and
/// publishes a `state_changed` event for every transition.
pub struct AgentStateMachine {
    handle: StateHandle,
    ctx: Option<ReactorContext>,
}

impl AgentStateMachine {
    pub fn new() -> Self {
        Self {
            handle: StateHandle::default(),
            ctx: None,
        }
    }

    pub fn handle(&self) -> StateHandle {
        self.handle.clone()
    }

    fn publish_all(ctx: &ReactorContext, updates: Vec<(AgentId, StatePayload)>) {
        for (agent_id, payload) in updates {
            trace!(parent: &ctx.span, state = %payload.state, previous = %payload.previous_state, "state transition");
            ctx.producer.publish(Event::new(agent_id, EventBody::State(payload)));
        }
    }
}

impl Default for AgentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor for AgentStateMachine {
    fn name(&self) -> &str {
        NAME
    }

    fn on_initialize(&mut self, ctx: ReactorContext) -> Result<(), EngineError> {
        let machines = self.handle.clone();
        let producer = ctx.producer.clone();
        let span = ctx.span.clone();
        let reporter = FailureReporter::new(NAME, &ctx);
        ctx.consumer.consume_by_types(HANDLED, move |event| {
            reporter.guard(event, || {
                if let Some(payload) = machines.apply(event) {
                    trace!(parent: &span, state = %payload.state, previous = %payload.previous_state, "state transition");
                    producer.publish(Event::new(event.agent_id.clone(), EventBody::State(payload)));
                }
            })
        })?;

        let updates = self
            .handle
            .lifecycle(&ctx.agent_id, AgentState::Ready, "engine_initialized", "initialize");
        Self::publish_all(&ctx, updates);
        self.ctx = Some(ctx);
        Ok(())
    }

    fn on_destroy(&mut self) {
        let Some(ctx) = self.ctx.take() else {
            return;
        };
        ctx.consumer.unsubscribe_all();
        let updates = self
            .handle
            .lifecycle(&ctx.agent_id, AgentState::Destroyed, "engine_destroyed", "destroy");
        Self::publish_all(&ctx, updates);
    }
}
