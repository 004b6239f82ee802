//! Message assembly.
//!
//! Reassembles a turn's fragmented stream events into complete messages.
//! Content is buffered per content-block index and finalized on the block's
//! stop event. A `message_stop` with `tool_use` only ends one provider
//! message: its blocks are sealed and the turn stays open for the next one.
//! The terminal event of the turn produces exactly one terminal message,
//! `AssistantMessage` or `ErrorMessage`, preceded by a `ToolUseMessage` for
//! every completed tool call whose result never arrived.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use prism_core::errors::{AgentError, ErrorCode};
use prism_core::events::{Command, Event, EventBody, EventType, StreamPayload};
use prism_core::ids::{MessageId, ToolCallId, TurnId};
use prism_core::messages::{
    AssistantMessage, ErrorMessage, Message, StopReason, ToolCallBlock, ToolResultBlock, ToolUseMessage,
};
use prism_core::stream::StreamEvent;
use prism_core::tokens::TokenUsage;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::EngineError;
use crate::reactor::{FailureReporter, Reactor, ReactorContext};

pub const NAME: &str = "message_assembler";

/// How many finished turn ids are remembered to drop late stream events.
const CLOSED_TURN_MEMORY: usize = 64;

const HANDLED: &[EventType] = &[
    EventType::SendMessage,
    EventType::MessageStart,
    EventType::MessageDelta,
    EventType::MessageStop,
    EventType::TextContentBlockStart,
    EventType::TextDelta,
    EventType::TextContentBlockStop,
    EventType::ThinkingContentBlockStart,
    EventType::ThinkingDelta,
    EventType::ThinkingContentBlockStop,
    EventType::ToolUseContentBlockStart,
    EventType::InputJsonDelta,
    EventType::ToolUseContentBlockStop,
    EventType::ToolResult,
    EventType::Interrupted,
    EventType::ErrorReceived,
    EventType::ErrorMessage,
];

/// Buffer for a content block that has started but not stopped.
#[derive(Debug)]
enum OpenBlock {
    Text(String),
    Thinking(String),
    ToolUse { id: ToolCallId, name: String, json: String },
}

#[derive(Debug)]
enum FinishedBlock {
    Text(String),
    Thinking(String),
}

#[derive(Debug)]
struct CompletedCall {
    call: ToolCallBlock,
    reported: bool,
}

/// A message ready to publish, with the turn it belongs to.
pub(crate) type Outgoing = (Option<TurnId>, Message);

#[derive(Debug, Default)]
struct TurnAssembly {
    parent_id: Option<MessageId>,
    open: BTreeMap<u32, OpenBlock>,
    finished: BTreeMap<u32, FinishedBlock>,
    /// Finished blocks of earlier provider messages in this turn.
    sealed: Vec<FinishedBlock>,
    tool_calls: Vec<CompletedCall>,
    early_results: HashMap<ToolCallId, ToolResultBlock>,
    usage: Option<TokenUsage>,
    model: Option<String>,
    error: Option<AgentError>,
    last_index: Option<u32>,
}

impl TurnAssembly {
    fn new(parent_id: Option<MessageId>) -> Self {
        Self {
            parent_id,
            ..Self::default()
        }
    }

    fn index_for_start(&mut self, index: Option<u32>) -> u32 {
        let index = index.unwrap_or_else(|| {
            self.open
                .keys()
                .chain(self.finished.keys())
                .max()
                .map_or(0, |i| i + 1)
        });
        self.last_index = Some(index);
        index
    }

    fn index_for(&mut self, index: Option<u32>) -> u32 {
        let index = index.or(self.last_index).unwrap_or(0);
        self.last_index = Some(index);
        index
    }

    fn open_block(&mut self, turn_id: &TurnId, index: u32, block: OpenBlock, out: &mut Vec<Outgoing>) {
        if self.open.contains_key(&index) {
            warn!(turn_id = %turn_id, index, "content block restarted before stop; finalizing previous");
            self.close_block(turn_id, index, out);
        }
        self.open.insert(index, block);
    }

    fn append_text(&mut self, turn_id: &TurnId, index: u32, text: &str) {
        match self.open.get_mut(&index) {
            Some(OpenBlock::Text(buf)) => buf.push_str(text),
            Some(_) => warn!(turn_id = %turn_id, index, "text delta for non-text block dropped"),
            None => {
                debug!(turn_id = %turn_id, index, "text delta without block start; opening implicitly");
                self.open.insert(index, OpenBlock::Text(text.to_string()));
            }
        }
    }

    fn append_thinking(&mut self, turn_id: &TurnId, index: u32, thinking: &str) {
        match self.open.get_mut(&index) {
            Some(OpenBlock::Thinking(buf)) => buf.push_str(thinking),
            Some(_) => warn!(turn_id = %turn_id, index, "thinking delta for non-thinking block dropped"),
            None => {
                debug!(turn_id = %turn_id, index, "thinking delta without block start; opening implicitly");
                self.open.insert(index, OpenBlock::Thinking(thinking.to_string()));
            }
        }
    }

    fn append_json(&mut self, turn_id: &TurnId, index: u32, partial: &str) {
        match self.open.get_mut(&index) {
            Some(OpenBlock::ToolUse { json, .. }) => json.push_str(partial),
            _ => warn!(turn_id = %turn_id, index, "input_json_delta outside a tool block dropped"),
        }
    }

    fn close_block(&mut self, turn_id: &TurnId, index: u32, out: &mut Vec<Outgoing>) {
        let Some(block) = self.open.remove(&index) else {
            debug!(turn_id = %turn_id, index, "stop for unknown content block ignored");
            return;
        };
        match block {
            OpenBlock::Text(text) => {
                self.finished.insert(index, FinishedBlock::Text(text));
            }
            OpenBlock::Thinking(thinking) => {
                self.finished.insert(index, FinishedBlock::Thinking(thinking));
            }
            OpenBlock::ToolUse { id, name, json } => self.complete_tool_call(turn_id, id, name, json, out),
        }
    }

    fn complete_tool_call(&mut self, turn_id: &TurnId, id: ToolCallId, name: String, json: String, out: &mut Vec<Outgoing>) {
        let input = if json.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            match serde_json::from_str::<Value>(&json) {
                Ok(v) => v,
                Err(e) => {
                    warn!(turn_id = %turn_id, tool_call_id = %id, tool = %name, error = %e, "malformed tool input");
                    if self.error.is_none() {
                        self.error = Some(
                            AgentError::malformed_tool_input(format!("tool '{name}' input is not valid JSON: {e}"))
                                .with_details(serde_json::json!({
                                    "toolCallId": id,
                                    "toolName": name,
                                    "rawInput": json,
                                })),
                        );
                    }
                    return;
                }
            }
        };

        let call = ToolCallBlock { id, name, input };
        let reported = match self.early_results.remove(&call.id) {
            Some(result) => {
                out.push((Some(turn_id.clone()), self.tool_use_message(call.clone(), Some(result))));
                true
            }
            None => false,
        };
        self.tool_calls.push(CompletedCall { call, reported });
    }

    fn tool_result(&mut self, turn_id: &TurnId, tool_use_id: &ToolCallId, result: ToolResultBlock, out: &mut Vec<Outgoing>) {
        let pending = self
            .tool_calls
            .iter_mut()
            .find(|c| c.call.id == *tool_use_id && !c.reported);
        match pending {
            Some(completed) => {
                completed.reported = true;
                let call = completed.call.clone();
                out.push((Some(turn_id.clone()), self.tool_use_message(call, Some(result))));
            }
            None => {
                debug!(turn_id = %turn_id, tool_call_id = %tool_use_id, "tool result before call completed; holding");
                self.early_results.insert(tool_use_id.clone(), result);
            }
        }
    }

    fn tool_use_message(&self, tool_call: ToolCallBlock, result: Option<ToolResultBlock>) -> Message {
        Message::ToolUse(ToolUseMessage {
            id: MessageId::new(),
            tool_call,
            result,
            timestamp: Utc::now(),
            parent_id: self.parent_id.clone(),
        })
    }

    /// Finalize every open block and move this provider message's blocks,
    /// in index order, behind those of earlier messages.
    fn seal(&mut self, turn_id: &TurnId, out: &mut Vec<Outgoing>) {
        let open: Vec<u32> = self.open.keys().copied().collect();
        for index in open {
            debug!(turn_id = %turn_id, index, "content block still open at message boundary; finalizing");
            self.close_block(turn_id, index, out);
        }
        let finished = std::mem::take(&mut self.finished);
        self.sealed.extend(finished.into_values());
        self.last_index = None;
    }

    fn add_usage(&mut self, usage: &TokenUsage) {
        self.usage.get_or_insert_with(TokenUsage::default).add(usage);
    }

    fn text(&self) -> String {
        self.sealed
            .iter()
            .filter_map(|b| match b {
                FinishedBlock::Text(t) => Some(t.as_str()),
                FinishedBlock::Thinking(_) => None,
            })
            .collect()
    }

    fn thinking(&self) -> Option<String> {
        let thinking: String = self
            .sealed
            .iter()
            .filter_map(|b| match b {
                FinishedBlock::Thinking(t) => Some(t.as_str()),
                FinishedBlock::Text(_) => None,
            })
            .collect();
        (!thinking.is_empty()).then_some(thinking)
    }

    fn partial_content(&self) -> Option<String> {
        let text = self.text();
        (!text.is_empty()).then_some(text)
    }

    fn flush_unpaired(&mut self, turn_id: &TurnId, out: &mut Vec<Outgoing>) {
        let unpaired: Vec<ToolCallBlock> = self
            .tool_calls
            .iter_mut()
            .filter(|c| !c.reported)
            .map(|c| {
                c.reported = true;
                c.call.clone()
            })
            .collect();
        for call in unpaired {
            debug!(turn_id = %turn_id, tool_call_id = %call.id, "tool call ended without result");
            out.push((Some(turn_id.clone()), self.tool_use_message(call, None)));
        }
    }

    fn error_message(&self, error: AgentError) -> Message {
        let mut message = ErrorMessage::new(error, true);
        message.partial_content = self.partial_content();
        message.parent_id = self.parent_id.clone();
        Message::Error(message)
    }

    fn finish(mut self, turn_id: &TurnId, stop_reason: StopReason, out: &mut Vec<Outgoing>) {
        self.seal(turn_id, out);
        self.flush_unpaired(turn_id, out);

        let terminal = if let Some(error) = self.error.take() {
            self.error_message(error)
        } else if stop_reason.is_normal_completion() {
            Message::Assistant(AssistantMessage {
                id: MessageId::new(),
                content: self.text(),
                thinking: self.thinking(),
                tool_calls: self.tool_calls.iter().map(|c| c.call.clone()).collect(),
                stop_reason,
                usage: self.usage,
                model: self.model.clone(),
                timestamp: Utc::now(),
                parent_id: self.parent_id.clone(),
            })
        } else {
            self.error_message(AgentError::new(
                ErrorCode::ReceiveFailed,
                format!("turn ended with stop reason {stop_reason:?} and no error detail"),
            ))
        };
        out.push((Some(turn_id.clone()), terminal));
    }

    fn interrupted(mut self, turn_id: &TurnId, reason: &str, out: &mut Vec<Outgoing>) {
        self.seal(turn_id, out);
        self.flush_unpaired(turn_id, out);
        let message = self.error_message(AgentError::aborted(reason.to_string()));
        out.push((Some(turn_id.clone()), message));
    }
}

/// All turns currently being assembled.
#[derive(Default)]
pub(crate) struct Assembly {
    turns: HashMap<TurnId, TurnAssembly>,
    closed: VecDeque<TurnId>,
}

impl Assembly {
    pub(crate) fn open_turns(&self) -> usize {
        self.turns.len()
    }

    fn close(&mut self, turn_id: &TurnId) -> Option<TurnAssembly> {
        if self.closed.len() == CLOSED_TURN_MEMORY {
            self.closed.pop_front();
        }
        self.closed.push_back(turn_id.clone());
        self.turns.remove(turn_id)
    }

    pub(crate) fn apply(&mut self, event: &Event) -> Vec<Outgoing> {
        let mut out = Vec::new();
        match &event.body {
            EventBody::Command(Command::SendMessage { turn_id, message }) => {
                self.turns
                    .insert(turn_id.clone(), TurnAssembly::new(Some(message.id.clone())));
                out.push((Some(turn_id.clone()), Message::User(message.clone())));
            }
            EventBody::Stream(payload) => self.apply_stream(payload, &mut out),
            EventBody::Message(payload) => {
                if let (Message::Error(m), Some(turn_id)) = (&payload.message, &payload.turn_id) {
                    if m.terminal && self.close(turn_id).is_some() {
                        debug!(turn_id = %turn_id, "turn closed by external error message");
                    }
                }
            }
            _ => {}
        }
        out
    }

    fn apply_stream(&mut self, payload: &StreamPayload, out: &mut Vec<Outgoing>) {
        let turn_id = &payload.turn_id;
        let idx = payload.content_block_index;

        if self.closed.contains(turn_id) {
            debug!(turn_id = %turn_id, event_type = %payload.event.event_type(), "stream event for finished turn dropped");
            return;
        }

        match &payload.event {
            StreamEvent::MessageStop { stop_reason } if stop_reason.ends_turn() => {
                let turn = self.close(turn_id).unwrap_or_default();
                turn.finish(turn_id, *stop_reason, out);
                return;
            }
            StreamEvent::Interrupted { reason } => {
                let turn = self.close(turn_id).unwrap_or_default();
                turn.interrupted(turn_id, reason, out);
                return;
            }
            _ => {}
        }

        let turn = self.turns.entry(turn_id.clone()).or_default();
        match &payload.event {
            StreamEvent::MessageStart { model, usage, .. } => {
                turn.seal(turn_id, out);
                turn.model = Some(model.clone());
                if let Some(usage) = usage {
                    turn.add_usage(usage);
                }
            }
            StreamEvent::MessageDelta { usage } => turn.add_usage(usage),
            StreamEvent::MessageStop { .. } => turn.seal(turn_id, out),

            StreamEvent::TextContentBlockStart => {
                let index = turn.index_for_start(idx);
                turn.open_block(turn_id, index, OpenBlock::Text(String::new()), out);
            }
            StreamEvent::ThinkingContentBlockStart => {
                let index = turn.index_for_start(idx);
                turn.open_block(turn_id, index, OpenBlock::Thinking(String::new()), out);
            }
            StreamEvent::ToolUseContentBlockStart { id, name } => {
                let index = turn.index_for_start(idx);
                let block = OpenBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    json: String::new(),
                };
                turn.open_block(turn_id, index, block, out);
            }

            StreamEvent::TextDelta { text } => {
                let index = turn.index_for(idx);
                turn.append_text(turn_id, index, text);
            }
            StreamEvent::ThinkingDelta { thinking } => {
                let index = turn.index_for(idx);
                turn.append_thinking(turn_id, index, thinking);
            }
            StreamEvent::InputJsonDelta { partial_json } => {
                let index = turn.index_for(idx);
                turn.append_json(turn_id, index, partial_json);
            }

            StreamEvent::TextContentBlockStop
            | StreamEvent::ThinkingContentBlockStop
            | StreamEvent::ToolUseContentBlockStop => {
                let index = turn.index_for(idx);
                turn.close_block(turn_id, index, out);
            }

            StreamEvent::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let result = ToolResultBlock {
                    content: content.clone(),
                    is_error: *is_error,
                };
                turn.tool_result(turn_id, tool_use_id, result, out);
            }

            StreamEvent::Error { error } => {
                if turn.error.is_none() {
                    turn.error = Some(error.clone());
                }
            }

            StreamEvent::Interrupted { .. } => {}
        }
    }
}

/// Builds user, assistant, tool-use and error messages from the stream.
pub struct MessageAssembler {
    state: Arc<Mutex<Assembly>>,
    ctx: Option<ReactorContext>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(Assembly::default())),
            ctx: None,
        }
    }

    /// Number of turns with assembly in progress.
    pub fn open_turns(&self) -> usize {
        self.state.lock().open_turns()
    }
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor for MessageAssembler {
    fn name(&self) -> &str {
        NAME
    }

    fn on_initialize(&mut self, ctx: ReactorContext) -> Result<(), EngineError> {
        let state = Arc::clone(&self.state);
        let producer = ctx.producer.clone();
        let span = ctx.span.clone();
        let reporter = FailureReporter::new(NAME, &ctx);
        ctx.consumer.consume_by_types(HANDLED, move |event| {
            reporter.guard(event, || {
                let outgoing = span.in_scope(|| state.lock().apply(event));
                for (turn_id, message) in outgoing {
                    trace!(parent: &span, role = message.role(), message_id = %message.id(), "message assembled");
                    producer.publish(Event::message(event.agent_id.clone(), turn_id, message));
                }
            })
        })?;
        self.ctx = Some(ctx);
        Ok(())
    }

    fn on_destroy(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            ctx.consumer.unsubscribe_all();
        }
        let dropped = std::mem::take(&mut *self.state.lock()).open_turns();
        if dropped > 0 {
            debug!(dropped, "assembler destroyed with turns in progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::errors::{ErrorCategory, ErrorSeverity};
    use prism_core::ids::AgentId;
    use prism_core::messages::UserMessage;
    use proptest::prelude::*;

    struct Feed {
        agent: AgentId,
        turn: TurnId,
        assembly: Assembly,
        out: Vec<Outgoing>,
    }

    impl Feed {
        fn new() -> Self {
            Self {
                agent: AgentId::new(),
                turn: TurnId::new(),
                assembly: Assembly::default(),
                out: Vec::new(),
            }
        }

        fn send(&mut self, text: &str) -> MessageId {
            let message = UserMessage::text(text);
            let id = message.id.clone();
            let event = Event::command(
                self.agent.clone(),
                Command::SendMessage {
                    turn_id: self.turn.clone(),
                    message,
                },
            );
            self.out.extend(self.assembly.apply(&event));
            id
        }

        fn at(&mut self, index: u32, event: StreamEvent) {
            let event = Event::stream(self.agent.clone(), self.turn.clone(), Some(index), event);
            self.out.extend(self.assembly.apply(&event));
        }

        fn msg(&mut self, event: StreamEvent) {
            let event = Event::stream(self.agent.clone(), self.turn.clone(), None, event);
            self.out.extend(self.assembly.apply(&event));
        }

        fn start(&mut self) {
            self.msg(StreamEvent::MessageStart {
                message_id: "m".into(),
                model: "model-x".into(),
                usage: Some(TokenUsage::new(10, 0)),
            });
        }

        fn text_block(&mut self, index: u32, deltas: &[&str]) {
            self.at(index, StreamEvent::TextContentBlockStart);
            for d in deltas {
                self.at(index, StreamEvent::text_delta(*d));
            }
            self.at(index, StreamEvent::TextContentBlockStop);
        }

        fn tool_block(&mut self, index: u32, id: &ToolCallId, fragments: &[&str]) {
            self.at(
                index,
                StreamEvent::ToolUseContentBlockStart {
                    id: id.clone(),
                    name: "get_current_time".into(),
                },
            );
            for f in fragments {
                self.at(index, StreamEvent::input_json_delta(*f));
            }
            self.at(index, StreamEvent::ToolUseContentBlockStop);
        }

        fn messages(&self) -> Vec<&Message> {
            self.out.iter().map(|(_, m)| m).collect()
        }

        fn last(&self) -> &Message {
            &self.out.last().unwrap().1
        }
    }

    fn assistant(m: &Message) -> &AssistantMessage {
        match m {
            Message::Assistant(a) => a,
            other => panic!("expected assistant message, got {other:?}"),
        }
    }

    fn error(m: &Message) -> &ErrorMessage {
        match m {
            Message::Error(e) => e,
            other => panic!("expected error message, got {other:?}"),
        }
    }

    #[test]
    fn user_message_is_emitted_immediately() {
        let mut feed = Feed::new();
        let id = feed.send("hello");
        assert_eq!(feed.out.len(), 1);
        assert_eq!(feed.out[0].0.as_ref(), Some(&feed.turn));
        assert_eq!(feed.last().id(), &id);
        assert!(matches!(feed.last(), Message::User(_)));
    }

    #[test]
    fn text_blocks_concatenate_in_index_order() {
        let mut feed = Feed::new();
        let user = feed.send("hi");
        feed.start();
        feed.at(1, StreamEvent::TextContentBlockStart);
        feed.text_block(0, &["Hel", "lo"]);
        feed.at(1, StreamEvent::text_delta(" world"));
        feed.at(1, StreamEvent::TextContentBlockStop);
        feed.msg(StreamEvent::MessageDelta { usage: TokenUsage::new(0, 4) });
        feed.msg(StreamEvent::message_stop(StopReason::EndTurn));

        let a = assistant(feed.last());
        assert_eq!(a.content, "Hello world");
        assert_eq!(a.parent_id.as_ref(), Some(&user));
        assert_eq!(a.usage, Some(TokenUsage::new(10, 4)));
        assert_eq!(a.model.as_deref(), Some("model-x"));
        assert_eq!(a.stop_reason, StopReason::EndTurn);
        assert_eq!(feed.assembly.open_turns(), 0);
    }

    #[test]
    fn tool_call_pairs_with_result() {
        let mut feed = Feed::new();
        feed.send("what time is it");
        let id = ToolCallId::new();
        feed.start();
        feed.tool_block(0, &id, &["{\"timez", "one\":\"U", "TC\"}"]);
        feed.msg(StreamEvent::message_stop(StopReason::ToolUse));
        assert_eq!(feed.messages().len(), 1);

        feed.msg(StreamEvent::ToolResult {
            tool_use_id: id.clone(),
            content: "12:00".into(),
            is_error: false,
        });
        feed.start();
        feed.text_block(0, &["It is noon."]);
        feed.msg(StreamEvent::message_stop(StopReason::EndTurn));

        let tool_uses: Vec<&ToolUseMessage> = feed
            .messages()
            .into_iter()
            .filter_map(|m| match m {
                Message::ToolUse(t) => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(tool_uses.len(), 1);
        assert_eq!(tool_uses[0].tool_call.input, serde_json::json!({"timezone": "UTC"}));
        assert_eq!(tool_uses[0].result.as_ref().unwrap().content, "12:00");

        let a = assistant(feed.last());
        assert_eq!(a.content, "It is noon.");
        assert_eq!(a.tool_calls.len(), 1);
        assert_eq!(a.usage, Some(TokenUsage::new(20, 0)));
    }

    #[test]
    fn result_arriving_before_block_stop_is_held() {
        let mut feed = Feed::new();
        let id = ToolCallId::new();
        feed.start();
        feed.at(
            0,
            StreamEvent::ToolUseContentBlockStart {
                id: id.clone(),
                name: "t".into(),
            },
        );
        feed.msg(StreamEvent::ToolResult {
            tool_use_id: id.clone(),
            content: "early".into(),
            is_error: true,
        });
        assert!(feed.out.is_empty());
        feed.at(0, StreamEvent::ToolUseContentBlockStop);
        match feed.last() {
            Message::ToolUse(t) => {
                assert_eq!(t.tool_call.input, serde_json::json!({}));
                assert!(t.result.as_ref().unwrap().is_error);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_tool_input_resolves_turn_with_error() {
        let mut feed = Feed::new();
        feed.send("go");
        let id = ToolCallId::new();
        feed.start();
        feed.text_block(0, &["partial"]);
        feed.tool_block(1, &id, &["{\"a\":", "nope"]);
        feed.msg(StreamEvent::message_stop(StopReason::EndTurn));

        let e = error(feed.last());
        assert!(e.terminal);
        assert_eq!(e.error.code, ErrorCode::MalformedToolInput);
        assert_eq!(e.error.category, ErrorCategory::Validation);
        assert_eq!(e.error.details.as_ref().unwrap()["rawInput"], "{\"a\":nope");
        assert_eq!(e.partial_content.as_deref(), Some("partial"));
        assert!(!feed.messages().iter().any(|m| matches!(m, Message::ToolUse(_))));
    }

    #[test]
    fn error_signal_resolves_turn_with_that_error() {
        let mut feed = Feed::new();
        feed.send("hi");
        feed.start();
        feed.text_block(0, &["abc"]);
        feed.msg(StreamEvent::Error {
            error: AgentError::timeout(std::time::Duration::from_secs(600)),
        });
        feed.msg(StreamEvent::message_stop(StopReason::Error));

        let e = error(feed.last());
        assert_eq!(e.error.code, ErrorCode::Timeout);
        assert!(e.terminal);
        assert_eq!(e.partial_content.as_deref(), Some("abc"));
    }

    #[test]
    fn abnormal_stop_without_error_still_resolves() {
        let mut feed = Feed::new();
        feed.start();
        feed.msg(StreamEvent::message_stop(StopReason::Error));
        assert_eq!(error(feed.last()).error.code, ErrorCode::ReceiveFailed);
    }

    #[test]
    fn interrupted_turn_yields_aborted_error_and_unpaired_tool_use() {
        let mut feed = Feed::new();
        feed.send("hi");
        let id = ToolCallId::new();
        feed.start();
        feed.text_block(0, &["so far"]);
        feed.tool_block(1, &id, &["{}"]);
        feed.at(2, StreamEvent::TextContentBlockStart);
        feed.at(2, StreamEvent::text_delta(" more"));
        feed.msg(StreamEvent::Interrupted { reason: "user".into() });

        let msgs = feed.messages();
        let n = msgs.len();
        match msgs[n - 2] {
            Message::ToolUse(t) => {
                assert_eq!(t.tool_call.id, id);
                assert!(t.result.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        let e = error(msgs[n - 1]);
        assert_eq!(e.error.code, ErrorCode::Aborted);
        assert_eq!(e.error.severity, ErrorSeverity::Warning);
        assert!(e.error.recoverable);
        assert_eq!(e.partial_content.as_deref(), Some("so far more"));
    }

    #[test]
    fn thinking_is_collected_separately() {
        let mut feed = Feed::new();
        feed.start();
        feed.at(0, StreamEvent::ThinkingContentBlockStart);
        feed.at(0, StreamEvent::ThinkingDelta { thinking: "hmm".into() });
        feed.at(0, StreamEvent::ThinkingContentBlockStop);
        feed.text_block(1, &["answer"]);
        feed.msg(StreamEvent::message_stop(StopReason::EndTurn));
        let a = assistant(feed.last());
        assert_eq!(a.thinking.as_deref(), Some("hmm"));
        assert_eq!(a.content, "answer");
    }

    #[test]
    fn deltas_without_index_follow_last_block() {
        let mut feed = Feed::new();
        feed.start();
        feed.msg(StreamEvent::TextContentBlockStart);
        feed.msg(StreamEvent::text_delta("a"));
        feed.msg(StreamEvent::text_delta("b"));
        feed.msg(StreamEvent::TextContentBlockStop);
        feed.msg(StreamEvent::message_stop(StopReason::EndTurn));
        assert_eq!(assistant(feed.last()).content, "ab");
    }

    #[test]
    fn external_terminal_error_closes_turn() {
        let mut feed = Feed::new();
        let user = feed.send("hi");
        assert_eq!(feed.assembly.open_turns(), 1);

        let mut rejected = ErrorMessage::new(AgentError::new(ErrorCode::ReceiveFailed, "busy"), true);
        rejected.parent_id = Some(user);
        let event = Event::message(feed.agent.clone(), Some(feed.turn.clone()), Message::Error(rejected));
        assert!(feed.assembly.apply(&event).is_empty());
        assert_eq!(feed.assembly.open_turns(), 0);
    }

    #[test]
    fn events_after_terminal_are_dropped() {
        let mut feed = Feed::new();
        feed.send("hi");
        feed.start();
        feed.text_block(0, &["done"]);
        feed.msg(StreamEvent::message_stop(StopReason::EndTurn));
        let produced = feed.out.len();

        feed.at(1, StreamEvent::TextContentBlockStart);
        feed.at(1, StreamEvent::text_delta("late"));
        feed.msg(StreamEvent::message_stop(StopReason::EndTurn));

        assert_eq!(feed.out.len(), produced);
        assert_eq!(feed.assembly.open_turns(), 0);
        assert_eq!(assistant(feed.last()).content, "done");
    }

    proptest! {
        #[test]
        fn any_chunking_reassembles_original_text(
            text in "[a-zA-Z0-9 .,!?\u{e9}\u{4e16}]{0,64}",
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let chars: Vec<char> = text.chars().collect();
            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(chars.len() + 1)).collect();
            points.sort_unstable();
            points.dedup();

            let mut pieces = Vec::new();
            let mut prev = 0;
            for p in points.into_iter().chain(std::iter::once(chars.len())) {
                pieces.push(chars[prev..p].iter().collect::<String>());
                prev = p;
            }

            let mut feed = Feed::new();
            feed.start();
            let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
            feed.text_block(0, &refs);
            feed.msg(StreamEvent::message_stop(StopReason::EndTurn));
            prop_assert_eq!(&assistant(feed.last()).content, &text);
        }
    }
}
