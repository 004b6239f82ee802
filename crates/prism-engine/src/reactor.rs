use std::panic::{catch_unwind, AssertUnwindSafe};

use prism_core::errors::AgentError;
use prism_core::events::Event;
use prism_core::ids::{AgentId, SessionId};
use prism_core::messages::{ErrorMessage, Message};
use tracing::{error, Span};

use crate::bus::{panic_message, Consumer, Producer};
use crate::error::EngineError;

/// Everything a reactor receives when the engine initializes it.
#[derive(Clone)]
pub struct ReactorContext {
    pub agent_id: AgentId,
    pub session_id: SessionId,
    pub consumer: Consumer,
    pub producer: Producer,
    /// Parent span for all of this reactor's diagnostics.
    pub span: Span,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReactorState {
    Uninitialized,
    Active,
    Destroyed,
}

/// A lifecycle-managed event processor attached to the bus.
///
/// The engine calls `on_initialize` once, in registration order, and
/// `on_destroy` once, in reverse order. Reactors subscribe only to the event
/// types they handle.
pub trait Reactor: Send {
    fn name(&self) -> &str;

    fn on_initialize(&mut self, ctx: ReactorContext) -> Result<(), EngineError>;

    fn on_destroy(&mut self);
}

/// Turns a panic while processing one event into a non-terminal
/// `ErrorMessage` so the rest of the pipeline keeps running.
#[derive(Clone)]
pub(crate) struct FailureReporter {
    reactor: &'static str,
    agent_id: AgentId,
    producer: Producer,
    span: Span,
}

impl FailureReporter {
    pub(crate) fn new(reactor: &'static str, ctx: &ReactorContext) -> Self {
        Self {
            reactor,
            agent_id: ctx.agent_id.clone(),
            producer: ctx.producer.clone(),
            span: ctx.span.clone(),
        }
    }

    pub(crate) fn guard<F: FnOnce()>(&self, event: &Event, f: F) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
            let reason = panic_message(panic.as_ref());
            error!(
                parent: &self.span,
                reactor = self.reactor,
                event_type = %event.event_type,
                event_id = %event.id,
                panic = %reason,
                "reactor failed while processing event"
            );
            let err = AgentError::internal(format!(
                "{} failed on {}: {reason}",
                self.reactor, event.event_type
            ))
            .with_details(serde_json::json!({
                "reactor": self.reactor,
                "eventId": event.id,
            }));
            let turn_id = event.as_stream().map(|p| p.turn_id.clone());
            self.producer.publish(Event::message(
                self.agent_id.clone(),
                turn_id,
                Message::Error(ErrorMessage::new(err, false)),
            ));
        }
    }
}
