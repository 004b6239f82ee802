//! Drives the provider adapter and republishes its output on the bus.
//!
//! Each `send_message` command starts one pump task. The task owns the
//! adapter stream for the turn and is the only publisher of that turn's
//! stream events. It guarantees that every turn ends with exactly one
//! terminal event (`message_stop` or `interrupted`), including on adapter
//! failure, timeout and unacknowledged interrupts, and that nothing from the
//! turn is published after it.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use prism_core::adapter::{EventStream, ProviderAdapter, StreamChunk};
use prism_core::errors::{AgentError, ErrorCode};
use prism_core::events::{Command, Event, EventType};
use prism_core::ids::{AgentId, TurnId};
use prism_core::messages::{ErrorMessage, Message, StopReason, UserMessage};
use prism_core::stream::StreamEvent;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument, Span};

use crate::bus::{Consumer, Producer};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::gate::AdapterGate;
use crate::reactor::{FailureReporter, Reactor, ReactorContext};

pub const NAME: &str = "stream_bridge";

const DEFAULT_INTERRUPT_REASON: &str = "interrupted";

struct ActiveTurn {
    turn_id: TurnId,
    cancel: CancellationToken,
    reason: Option<String>,
    task: Option<JoinHandle<()>>,
}

struct Driver {
    adapter: Arc<dyn ProviderAdapter>,
    gate: Arc<AdapterGate>,
    request_timeout: Duration,
    interrupt_grace: Duration,
    runtime: Handle,
    agent_id: AgentId,
    producer: Producer,
    span: Span,
    active: Mutex<Option<ActiveTurn>>,
}

/// Releases the turn's hold on the adapter when the pump ends, by any path.
struct TurnGuard {
    driver: Arc<Driver>,
    turn_id: TurnId,
    done: bool,
}

impl TurnGuard {
    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        {
            let mut active = self.driver.active.lock();
            if active.as_ref().is_some_and(|a| a.turn_id == self.turn_id) {
                *active = None;
            }
        }
        self.driver.gate.release(&self.turn_id);
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.finish();
    }
}

impl Driver {
    fn emit(&self, turn_id: &TurnId, chunk: StreamChunk) {
        self.producer.publish(Event::stream(
            self.agent_id.clone(),
            turn_id.clone(),
            chunk.content_block_index,
            chunk.event,
        ));
    }

    /// The terminal event is published while the turn still holds the
    /// gate, so no next `send_message` can be ordered ahead of it. The gate
    /// is free once this returns.
    fn emit_terminal(&self, guard: &mut TurnGuard, chunk: StreamChunk) {
        self.emit(&guard.turn_id, chunk);
        guard.finish();
    }

    fn fail(&self, guard: &mut TurnGuard, error: Option<AgentError>) {
        if let Some(error) = error {
            self.emit(&guard.turn_id, StreamChunk::message(StreamEvent::Error { error }));
        }
        self.emit_terminal(guard, StreamEvent::message_stop(StopReason::Error).into());
    }

    fn finish_interrupted(&self, guard: &mut TurnGuard) {
        let reason = self
            .active
            .lock()
            .as_ref()
            .filter(|a| a.turn_id == guard.turn_id)
            .and_then(|a| a.reason.clone())
            .unwrap_or_else(|| DEFAULT_INTERRUPT_REASON.to_string());
        self.emit_terminal(guard, StreamChunk::message(StreamEvent::Interrupted { reason }));
    }

    fn start(self: &Arc<Self>, turn_id: &TurnId, message: &UserMessage) {
        let busy = {
            let active = self.active.lock();
            match active.as_ref() {
                Some(a) => Some(EngineError::AdapterBusy {
                    active_turn: a.turn_id.clone(),
                }),
                None => self.gate.claim(turn_id).err(),
            }
        };
        if let Some(err) = busy {
            warn!(parent: &self.span, turn_id = %turn_id, error = %err, "rejecting send_message");
            let mut rejected = ErrorMessage::new(AgentError::new(ErrorCode::ReceiveFailed, err.to_string()), true);
            rejected.parent_id = Some(message.id.clone());
            self.producer.publish(Event::message(
                self.agent_id.clone(),
                Some(turn_id.clone()),
                Message::Error(rejected),
            ));
            return;
        }

        let cancel = CancellationToken::new();
        *self.active.lock() = Some(ActiveTurn {
            turn_id: turn_id.clone(),
            cancel: cancel.clone(),
            reason: None,
            task: None,
        });

        let span = info_span!(parent: &self.span, "turn", turn_id = %turn_id);
        let pump = Arc::clone(self).pump(turn_id.clone(), message.clone(), cancel);
        let task = self.runtime.spawn(pump.instrument(span));

        let mut active = self.active.lock();
        if let Some(a) = active.as_mut().filter(|a| a.turn_id == *turn_id) {
            a.task = Some(task);
        }
    }

    fn interrupt(&self, reason: &str) {
        let mut active = self.active.lock();
        match active.as_mut() {
            Some(turn) => {
                debug!(parent: &self.span, turn_id = %turn.turn_id, reason, "interrupt requested");
                turn.reason.get_or_insert_with(|| reason.to_string());
                turn.cancel.cancel();
            }
            None => debug!(parent: &self.span, "interrupt with no active turn ignored"),
        }
    }

    fn shutdown(&self) {
        let Some(turn) = self.active.lock().take() else {
            return;
        };
        debug!(parent: &self.span, turn_id = %turn.turn_id, "aborting active turn");
        turn.cancel.cancel();
        self.adapter.interrupt();
        if let Some(task) = turn.task {
            task.abort();
        }
        self.gate.release(&turn.turn_id);
    }

    async fn pump(self: Arc<Self>, turn_id: TurnId, message: UserMessage, cancel: CancellationToken) {
        let deadline = Instant::now() + self.request_timeout;
        let mut guard = TurnGuard {
            driver: Arc::clone(&self),
            turn_id,
            done: false,
        };
        debug!(adapter = self.adapter.name(), "adapter receive started");

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.adapter.interrupt();
                self.finish_interrupted(&mut guard);
                return;
            }
            _ = sleep_until(deadline) => {
                warn!(timeout_ms = self.request_timeout.as_millis() as u64, "adapter receive timed out");
                self.adapter.interrupt();
                self.fail(&mut guard, Some(AgentError::timeout(self.request_timeout)));
                return;
            }
            result = self.adapter.receive(&message) => match result {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, kind = err.error_kind(), "adapter receive failed");
                    self.fail(&mut guard, Some(AgentError::from(&err)));
                    return;
                }
            },
        };

        self.forward(stream, &mut guard, &cancel, deadline).await;
    }

    async fn forward(&self, mut stream: EventStream, guard: &mut TurnGuard, cancel: &CancellationToken, deadline: Instant) {
        let mut interrupt_deadline: Option<Instant> = None;
        let mut saw_error = false;

        loop {
            let wake_at = interrupt_deadline.unwrap_or(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if interrupt_deadline.is_none() => {
                    self.adapter.interrupt();
                    interrupt_deadline = Some(Instant::now() + self.interrupt_grace);
                }
                _ = sleep_until(wake_at) => {
                    if interrupt_deadline.is_some() {
                        warn!(grace_ms = self.interrupt_grace.as_millis() as u64, "adapter did not acknowledge interrupt");
                        self.finish_interrupted(guard);
                    } else {
                        warn!(timeout_ms = self.request_timeout.as_millis() as u64, "request timed out");
                        self.adapter.interrupt();
                        self.fail(guard, Some(AgentError::timeout(self.request_timeout)));
                    }
                    return;
                }
                next = stream.next() => match next {
                    Some(chunk) if chunk.event.is_terminal() => {
                        self.emit_terminal(guard, chunk);
                        return;
                    }
                    Some(chunk) => {
                        saw_error |= matches!(chunk.event, StreamEvent::Error { .. });
                        self.emit(&guard.turn_id, chunk);
                    }
                    None => {
                        if interrupt_deadline.is_some() {
                            self.finish_interrupted(guard);
                        } else {
                            warn!("adapter stream ended without a terminal event");
                            let error = (!saw_error).then(|| {
                                AgentError::new(ErrorCode::ReceiveFailed, "adapter stream ended without a terminal event")
                            });
                            self.fail(guard, error);
                        }
                        return;
                    }
                },
            }
        }
    }
}

/// Runs the provider adapter for each `send_message` command and publishes
/// its output as stream events.
pub struct StreamBridge {
    adapter: Arc<dyn ProviderAdapter>,
    gate: Arc<AdapterGate>,
    request_timeout: Duration,
    interrupt_grace: Duration,
    driver: Option<Arc<Driver>>,
    consumer: Option<Consumer>,
}

impl StreamBridge {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, gate: Arc<AdapterGate>, config: &EngineConfig) -> Self {
        Self {
            adapter,
            gate,
            request_timeout: config.request_timeout,
            interrupt_grace: config.interrupt_grace,
            driver: None,
            consumer: None,
        }
    }
}

impl Reactor for StreamBridge {
    fn name(&self) -> &str {
        NAME
    }

    fn on_initialize(&mut self, ctx: ReactorContext) -> Result<(), EngineError> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let driver = Arc::new(Driver {
            adapter: Arc::clone(&self.adapter),
            gate: Arc::clone(&self.gate),
            request_timeout: self.request_timeout,
            interrupt_grace: self.interrupt_grace,
            runtime,
            agent_id: ctx.agent_id.clone(),
            producer: ctx.producer.clone(),
            span: ctx.span.clone(),
            active: Mutex::new(None),
        });

        let handler_driver = Arc::clone(&driver);
        let reporter = FailureReporter::new(NAME, &ctx);
        ctx.consumer
            .consume_by_types(&[EventType::SendMessage, EventType::Interrupt], move |event| {
                if event.agent_id != handler_driver.agent_id {
                    return;
                }
                reporter.guard(event, || match event.as_command() {
                    Some(Command::SendMessage { turn_id, message }) => handler_driver.start(turn_id, message),
                    Some(Command::Interrupt { reason }) => handler_driver.interrupt(reason),
                    None => {}
                })
            })?;

        self.driver = Some(driver);
        self.consumer = Some(ctx.consumer);
        Ok(())
    }

    fn on_destroy(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe_all();
        }
        if let Some(driver) = self.driver.take() {
            driver.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, EventFilter, EventReceiver};
    use crate::scripted::{text_deltas_turn, ScriptedAdapter, ScriptedTurn};
    use prism_core::errors::AdapterError;

    struct Harness {
        agent: AgentId,
        bus: EventBus,
        gate: Arc<AdapterGate>,
        adapter: Arc<ScriptedAdapter>,
        bridge: StreamBridge,
        events: EventReceiver,
    }

    fn harness(adapter: ScriptedAdapter, config: EngineConfig) -> Harness {
        let agent = AgentId::new();
        let bus = EventBus::new(agent.clone());
        let gate = Arc::new(AdapterGate::new());
        let adapter = Arc::new(adapter);
        let events = bus
            .create_consumer()
            .unwrap()
            .subscribe_stream(EventFilter::All)
            .unwrap();
        let mut bridge = StreamBridge::new(adapter.clone(), Arc::clone(&gate), &config);
        bridge
            .on_initialize(ReactorContext {
                agent_id: agent.clone(),
                session_id: Default::default(),
                consumer: bus.create_consumer().unwrap(),
                producer: bus.create_producer().unwrap(),
                span: Span::none(),
            })
            .unwrap();
        Harness {
            agent,
            bus,
            gate,
            adapter,
            bridge,
            events,
        }
    }

    impl Harness {
        fn send(&self, text: &str) -> TurnId {
            let turn_id = TurnId::new();
            self.bus.create_producer().unwrap().publish(Event::command(
                self.agent.clone(),
                Command::SendMessage {
                    turn_id: turn_id.clone(),
                    message: UserMessage::text(text),
                },
            ));
            turn_id
        }

        fn interrupt(&self) {
            self.bus.create_producer().unwrap().publish(Event::command(
                self.agent.clone(),
                Command::Interrupt { reason: "user".into() },
            ));
        }

        /// Stream events up to and including the turn's terminal event.
        async fn turn_events(&mut self) -> Vec<StreamEvent> {
            let mut out = Vec::new();
            while let Some(event) = self.events.next().await {
                let Some(payload) = event.as_stream() else {
                    continue;
                };
                out.push(payload.event.clone());
                if payload.event.is_terminal() {
                    break;
                }
            }
            out
        }
    }

    #[tokio::test]
    async fn forwards_adapter_events_and_releases_gate() {
        let mut h = harness(ScriptedAdapter::new(vec![text_deltas_turn(&["a", "b"])]), EngineConfig::default());
        h.send("hi");
        let events = h.turn_events().await;
        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert!(events.contains(&StreamEvent::text_delta("a")));
        assert_eq!(events.last(), Some(&StreamEvent::message_stop(StopReason::EndTurn)));
        assert!(h.gate.is_idle());
        assert_eq!(h.adapter.received()[0].text_content(), "hi");
    }

    #[tokio::test]
    async fn terminal_event_is_published_before_gate_release() {
        let mut h = harness(ScriptedAdapter::new(vec![text_deltas_turn(&["a"])]), EngineConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let gate = Arc::clone(&h.gate);
        h.bus
            .create_consumer()
            .unwrap()
            .consume_by_type(EventType::MessageStop, move |_| sink.lock().push(gate.state()))
            .unwrap();

        let turn = h.send("hi");
        h.turn_events().await;

        assert_eq!(*seen.lock(), vec![crate::gate::AdapterState::Active(turn)]);
        assert!(h.gate.is_idle());
    }

    #[tokio::test]
    async fn receive_error_becomes_error_then_stop() {
        let mut h = harness(
            ScriptedAdapter::new(vec![ScriptedTurn::Error(AdapterError::from_status(429, String::new()))]),
            EngineConfig::default(),
        );
        h.send("hi");
        let events = h.turn_events().await;
        assert_eq!(events.len(), 2);
        match &events[0] {
            StreamEvent::Error { error } => assert_eq!(error.code, ErrorCode::RateLimited),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events[1], StreamEvent::message_stop(StopReason::Error));
        assert!(h.gate.is_idle());
    }

    #[tokio::test]
    async fn stream_without_terminal_is_closed_by_bridge() {
        let mut h = harness(
            ScriptedAdapter::new(vec![ScriptedTurn::Events(vec![StreamChunk::block(
                0,
                StreamEvent::TextContentBlockStart,
            )])]),
            EngineConfig::default(),
        );
        h.send("hi");
        let events = h.turn_events().await;
        assert_eq!(events.len(), 3);
        match &events[1] {
            StreamEvent::Error { error } => assert_eq!(error.code, ErrorCode::ReceiveFailed),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events[2], StreamEvent::message_stop(StopReason::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_interrupts_adapter() {
        let config = EngineConfig {
            request_timeout: Duration::from_secs(30),
            ..EngineConfig::default()
        };
        let mut h = harness(
            ScriptedAdapter::new(vec![ScriptedTurn::Hang { before: vec![] }]).ignoring_interrupts(),
            config,
        );
        h.send("hi");
        let events = h.turn_events().await;
        match &events[0] {
            StreamEvent::Error { error } => assert_eq!(error.code, ErrorCode::Timeout),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events[1], StreamEvent::message_stop(StopReason::Error));
        assert_eq!(h.adapter.interrupt_count(), 1);
        assert!(h.gate.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_interrupt_drops_trailing_events() {
        let mut h = harness(
            ScriptedAdapter::new(vec![ScriptedTurn::Hang {
                before: vec![StreamChunk::block(0, StreamEvent::TextContentBlockStart)],
            }])
            .with_trailing_after_interrupt(vec![StreamChunk::block(0, StreamEvent::text_delta("late"))]),
            EngineConfig::default(),
        );
        h.send("hi");
        loop {
            let event = h.events.next().await.unwrap();
            if event.event_type == EventType::TextContentBlockStart {
                break;
            }
        }
        h.interrupt();
        let events = h.turn_events().await;
        assert_eq!(events, vec![StreamEvent::Interrupted { reason: "interrupted".into() }]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        h.bus.close();
        let rest: Vec<Event> = h.events.collect().await;
        assert!(rest.iter().all(|e| e.as_stream().is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_interrupt_falls_back_after_grace() {
        let config = EngineConfig {
            interrupt_grace: Duration::from_secs(2),
            ..EngineConfig::default()
        };
        let mut h = harness(
            ScriptedAdapter::new(vec![ScriptedTurn::Hang { before: vec![] }]).ignoring_interrupts(),
            config,
        );
        h.send("hi");
        tokio::task::yield_now().await;
        h.interrupt();
        let events = h.turn_events().await;
        assert_eq!(events, vec![StreamEvent::Interrupted { reason: "user".into() }]);
        assert_eq!(h.adapter.interrupt_count(), 1);
        assert!(h.gate.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn second_turn_while_active_is_rejected() {
        let mut h = harness(
            ScriptedAdapter::new(vec![ScriptedTurn::Hang { before: vec![] }]),
            EngineConfig::default(),
        );
        let first = h.send("one");
        let second = h.send("two");

        let rejection = loop {
            let event = h.events.next().await.unwrap();
            if event.event_type == EventType::ErrorMessage {
                break event;
            }
        };
        let payload = rejection.as_message().unwrap();
        assert_eq!(payload.turn_id.as_ref(), Some(&second));
        match &payload.message {
            Message::Error(m) => {
                assert!(m.terminal);
                assert!(m.error.message.contains(first.as_str()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.gate.state(), crate::gate::AdapterState::Active(first));
        h.bridge.on_destroy();
        assert!(h.gate.is_idle());
    }

    #[test]
    fn initialize_requires_runtime() {
        let agent = AgentId::new();
        let bus = EventBus::new(agent.clone());
        let mut bridge = StreamBridge::new(
            Arc::new(ScriptedAdapter::new(vec![])),
            Arc::new(AdapterGate::new()),
            &EngineConfig::default(),
        );
        let result = bridge.on_initialize(ReactorContext {
            agent_id: agent,
            session_id: Default::default(),
            consumer: bus.create_consumer().unwrap(),
            producer: bus.create_producer().unwrap(),
            span: Span::none(),
        });
        assert!(matches!(result, Err(EngineError::NoRuntime)));
    }
}
