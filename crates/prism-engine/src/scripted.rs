use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use prism_core::adapter::{EventStream, ProviderAdapter, StreamChunk};
use prism_core::errors::AdapterError;
use prism_core::ids::ToolCallId;
use prism_core::messages::{StopReason, UserMessage};
use prism_core::stream::StreamEvent;
use prism_core::tokens::TokenUsage;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const SCRIPTED_MODEL: &str = "scripted-model";

/// Pre-programmed answers to successive `receive()` calls.
#[derive(Clone, Debug)]
pub enum ScriptedTurn {
    /// Yield these chunks, then end.
    Events(Vec<StreamChunk>),
    /// Fail the `receive()` call itself.
    Error(AdapterError),
    /// Wait, then answer with the inner turn.
    Delay(Duration, Box<ScriptedTurn>),
    /// Yield `before`, then never finish on its own.
    Hang { before: Vec<StreamChunk> },
}

impl ScriptedTurn {
    pub fn delayed(delay: Duration, inner: ScriptedTurn) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

fn message_start(input_tokens: u32) -> StreamChunk {
    StreamChunk::message(StreamEvent::MessageStart {
        message_id: format!("msg_scripted_{input_tokens}"),
        model: SCRIPTED_MODEL.to_string(),
        usage: Some(TokenUsage::new(input_tokens, 0)),
    })
}

fn message_end(output_tokens: u32, stop_reason: StopReason) -> [StreamChunk; 2] {
    [
        StreamChunk::message(StreamEvent::MessageDelta {
            usage: TokenUsage::new(0, output_tokens),
        }),
        StreamChunk::message(StreamEvent::message_stop(stop_reason)),
    ]
}

fn text_block(index: u32, deltas: &[&str]) -> Vec<StreamChunk> {
    let mut chunks = vec![StreamChunk::block(index, StreamEvent::TextContentBlockStart)];
    chunks.extend(
        deltas
            .iter()
            .map(|d| StreamChunk::block(index, StreamEvent::text_delta(*d))),
    );
    chunks.push(StreamChunk::block(index, StreamEvent::TextContentBlockStop));
    chunks
}

/// One provider message with a single text block.
pub fn text_turn(text: &str) -> ScriptedTurn {
    text_deltas_turn(&[text])
}

/// One provider message whose text arrives as the given deltas.
pub fn text_deltas_turn(deltas: &[&str]) -> ScriptedTurn {
    let mut chunks = vec![message_start(10)];
    chunks.extend(text_block(0, deltas));
    chunks.extend(message_end(deltas.len() as u32, StopReason::EndTurn));
    ScriptedTurn::Events(chunks)
}

/// A tool call whose input arrives as `fragments`, the adapter's result for
/// it, then a second provider message answering with `followup`.
pub fn tool_turn(name: &str, fragments: &[&str], result: &str, followup: &str) -> ScriptedTurn {
    let id = ToolCallId::new();
    let mut chunks = vec![
        message_start(10),
        StreamChunk::block(
            0,
            StreamEvent::ToolUseContentBlockStart {
                id: id.clone(),
                name: name.to_string(),
            },
        ),
    ];
    chunks.extend(
        fragments
            .iter()
            .map(|f| StreamChunk::block(0, StreamEvent::input_json_delta(*f))),
    );
    chunks.push(StreamChunk::block(0, StreamEvent::ToolUseContentBlockStop));
    chunks.extend(message_end(5, StopReason::ToolUse));
    chunks.push(StreamChunk::message(StreamEvent::ToolResult {
        tool_use_id: id,
        content: result.to_string(),
        is_error: false,
    }));
    chunks.push(message_start(20));
    chunks.extend(text_block(0, &[followup]));
    chunks.extend(message_end(7, StopReason::EndTurn));
    ScriptedTurn::Events(chunks)
}

struct Playback {
    chunks: VecDeque<StreamChunk>,
    hang: bool,
    token: CancellationToken,
    honour_interrupt: bool,
    interrupted: bool,
    trailing: VecDeque<StreamChunk>,
    chunk_delay: Option<Duration>,
}

impl Playback {
    fn into_stream(self) -> EventStream {
        Box::pin(stream::unfold(self, |mut st| async move {
            if st.interrupted {
                return st.trailing.pop_front().map(|c| (c, st));
            }

            let token = st.token.clone();
            let mut cancelled = st.honour_interrupt && token.is_cancelled();
            if !cancelled {
                if let Some(delay) = st.chunk_delay {
                    cancelled = if st.honour_interrupt {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => true,
                            _ = tokio::time::sleep(delay) => false,
                        }
                    } else {
                        tokio::time::sleep(delay).await;
                        false
                    };
                }
            }

            if !cancelled {
                if let Some(chunk) = st.chunks.pop_front() {
                    return Some((chunk, st));
                }
                if !st.hang {
                    return None;
                }
                if !st.honour_interrupt {
                    std::future::pending::<()>().await;
                }
                token.cancelled().await;
            }

            st.interrupted = true;
            let chunk = StreamChunk::message(StreamEvent::Interrupted {
                reason: "interrupted".into(),
            });
            Some((chunk, st))
        }))
    }
}

/// Deterministic adapter that replays [`ScriptedTurn`]s in order.
pub struct ScriptedAdapter {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    received: Mutex<Vec<UserMessage>>,
    call_count: AtomicUsize,
    interrupt_count: AtomicUsize,
    current: Mutex<Option<CancellationToken>>,
    honour_interrupt: bool,
    trailing: Vec<StreamChunk>,
    chunk_delay: Option<Duration>,
}

impl ScriptedAdapter {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            received: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            interrupt_count: AtomicUsize::new(0),
            current: Mutex::new(None),
            honour_interrupt: true,
            trailing: Vec::new(),
            chunk_delay: None,
        }
    }

    /// Sleep before each chunk, so interrupts can land mid-stream.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Record `interrupt()` calls without ever acting on them.
    pub fn ignoring_interrupts(mut self) -> Self {
        self.honour_interrupt = false;
        self
    }

    /// Chunks yielded after the `interrupted` event, as a real provider may
    /// still have buffered output in flight.
    pub fn with_trailing_after_interrupt(mut self, chunks: Vec<StreamChunk>) -> Self {
        self.trailing = chunks;
        self
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        self.turns.lock().push_back(turn);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupt_count.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().len()
    }

    pub fn received(&self) -> Vec<UserMessage> {
        self.received.lock().clone()
    }

    fn playback(&self, chunks: Vec<StreamChunk>, hang: bool, token: CancellationToken) -> EventStream {
        Playback {
            chunks: chunks.into(),
            hang,
            token,
            honour_interrupt: self.honour_interrupt,
            interrupted: false,
            trailing: self.trailing.clone().into(),
            chunk_delay: self.chunk_delay,
        }
        .into_stream()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn description(&self) -> Option<&str> {
        Some("replays pre-programmed stream events")
    }

    async fn receive(&self, message: &UserMessage) -> Result<EventStream, AdapterError> {
        let call = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.received.lock().push(message.clone());

        let next = self.turns.lock().pop_front();
        debug!(call, remaining = self.remaining(), "scripted turn dequeued");
        let mut turn = next.ok_or_else(|| {
            AdapterError::ReceiveFailed(format!("no scripted turn configured for call {call}"))
        })?;

        let token = CancellationToken::new();
        *self.current.lock() = Some(token.clone());

        loop {
            match turn {
                ScriptedTurn::Events(chunks) => return Ok(self.playback(chunks, false, token)),
                ScriptedTurn::Hang { before } => return Ok(self.playback(before, true, token)),
                ScriptedTurn::Error(e) => return Err(e),
                ScriptedTurn::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    turn = *inner;
                }
            }
        }
    }

    fn interrupt(&self) {
        self.interrupt_count.fetch_add(1, Ordering::Relaxed);
        if !self.honour_interrupt {
            return;
        }
        if let Some(token) = self.current.lock().as_ref() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn events(chunks: &[StreamChunk]) -> Vec<&StreamEvent> {
        chunks.iter().map(|c| &c.event).collect()
    }

    #[tokio::test]
    async fn replays_turns_in_order() {
        let adapter = ScriptedAdapter::new(vec![text_turn("first"), text_turn("second")]);

        let first: Vec<StreamChunk> = adapter
            .receive(&UserMessage::text("a"))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(first.contains(&StreamChunk::block(0, StreamEvent::text_delta("first"))));
        assert!(first.last().unwrap().event.is_terminal());

        let second: Vec<StreamChunk> = adapter
            .receive(&UserMessage::text("b"))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(second.contains(&StreamChunk::block(0, StreamEvent::text_delta("second"))));

        assert_eq!(adapter.call_count(), 2);
        assert_eq!(adapter.received()[1].text_content(), "b");
        assert!(matches!(
            adapter.receive(&UserMessage::text("c")).await,
            Err(AdapterError::ReceiveFailed(_))
        ));
    }

    #[tokio::test]
    async fn scripted_error() {
        let adapter = ScriptedAdapter::new(vec![ScriptedTurn::Error(AdapterError::Overloaded)]);
        assert!(matches!(
            adapter.receive(&UserMessage::text("x")).await,
            Err(AdapterError::Overloaded)
        ));
    }

    #[tokio::test]
    async fn tool_turn_shape() {
        let ScriptedTurn::Events(chunks) =
            tool_turn("get_current_time", &["{\"tz\"", ":\"UTC\"", "}"], "12:00", "done")
        else {
            panic!("expected events");
        };
        let evs = events(&chunks);
        let stops: Vec<_> = evs
            .iter()
            .filter_map(|e| match e {
                StreamEvent::MessageStop { stop_reason } => Some(*stop_reason),
                _ => None,
            })
            .collect();
        assert_eq!(stops, vec![StopReason::ToolUse, StopReason::EndTurn]);
        assert_eq!(
            evs.iter().filter(|e| matches!(e, StreamEvent::InputJsonDelta { .. })).count(),
            3
        );
        assert!(evs.iter().any(|e| matches!(e, StreamEvent::ToolResult { .. })));
    }

    #[tokio::test]
    async fn hang_ends_with_one_interrupted_then_trailing() {
        let adapter = ScriptedAdapter::new(vec![ScriptedTurn::Hang {
            before: vec![StreamChunk::block(0, StreamEvent::TextContentBlockStart)],
        }])
        .with_trailing_after_interrupt(vec![StreamChunk::block(0, StreamEvent::text_delta("late"))]);

        let mut stream = adapter.receive(&UserMessage::text("x")).await.unwrap();
        assert_eq!(stream.next().await.unwrap().event, StreamEvent::TextContentBlockStart);

        adapter.interrupt();
        assert!(matches!(
            stream.next().await.unwrap().event,
            StreamEvent::Interrupted { .. }
        ));
        assert_eq!(stream.next().await.unwrap().event, StreamEvent::text_delta("late"));
        assert!(stream.next().await.is_none());
        assert_eq!(adapter.interrupt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ignoring_interrupts_keeps_hanging() {
        let adapter = ScriptedAdapter::new(vec![ScriptedTurn::Hang { before: vec![] }]).ignoring_interrupts();
        let mut stream = adapter.receive(&UserMessage::text("x")).await.unwrap();
        adapter.interrupt();
        let next = tokio::time::timeout(Duration::from_secs(60), stream.next()).await;
        assert!(next.is_err());
        assert_eq!(adapter.interrupt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_turn_waits() {
        let adapter = ScriptedAdapter::new(vec![ScriptedTurn::delayed(
            Duration::from_secs(5),
            text_turn("late"),
        )]);
        let start = tokio::time::Instant::now();
        adapter.receive(&UserMessage::text("x")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
