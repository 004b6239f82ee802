//! Agent engine: owns one bus, one adapter and the reactors wired to them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use prism_core::adapter::ProviderAdapter;
use prism_core::events::{Command, Event};
use prism_core::ids::{AgentId, ReactorId, SessionId, TurnId};
use prism_core::messages::UserMessage;
use prism_core::state::AgentState;
use tracing::{debug, error, info, instrument, Span};

use crate::assembler::MessageAssembler;
use crate::bridge::StreamBridge;
use crate::bus::{panic_message, Consumer, EventBus, Producer};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::exchange::ExchangeTracker;
use crate::gate::{AdapterGate, AdapterState};
use crate::reactor::{Reactor, ReactorContext, ReactorState};
use crate::state_machine::{AgentStateMachine, StateHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Initialized,
    Destroyed,
}

struct ReactorSlot {
    id: ReactorId,
    reactor: Box<dyn Reactor>,
    state: ReactorState,
}

/// Snapshot of one registered reactor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactorInfo {
    pub id: ReactorId,
    pub name: String,
    pub state: ReactorState,
}

pub struct AgentEngineBuilder {
    adapter: Arc<dyn ProviderAdapter>,
    config: EngineConfig,
    agent_id: Option<AgentId>,
    session_id: Option<SessionId>,
    reactors: Vec<Box<dyn Reactor>>,
}

impl AgentEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn agent_id(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Add a reactor. Added reactors initialize after the built-in
    /// consumers and before the stream bridge, in the order added.
    pub fn reactor(mut self, reactor: Box<dyn Reactor>) -> Self {
        self.reactors.push(reactor);
        self
    }

    pub fn build(self) -> Result<AgentEngine, EngineError> {
        let agent_id = self.agent_id.unwrap_or_default();
        let session_id = self.session_id.unwrap_or_default();
        let bus = EventBus::new(agent_id.clone());
        let producer = bus.create_producer()?;
        let gate = Arc::new(AdapterGate::new());
        let span = prism_telemetry::agent_span(&agent_id, &session_id);

        let state_machine = AgentStateMachine::new();
        let states = state_machine.handle();

        let mut reactors: Vec<Box<dyn Reactor>> = vec![
            Box::new(ExchangeTracker::new(self.config.pricing)),
            Box::new(MessageAssembler::new()),
            Box::new(state_machine),
        ];
        reactors.extend(self.reactors);
        reactors.push(Box::new(StreamBridge::new(
            Arc::clone(&self.adapter),
            Arc::clone(&gate),
            &self.config,
        )));

        let slots = reactors
            .into_iter()
            .map(|reactor| ReactorSlot {
                id: ReactorId::new(),
                reactor,
                state: ReactorState::Uninitialized,
            })
            .collect();

        Ok(AgentEngine {
            agent_id,
            session_id,
            config: self.config,
            adapter: self.adapter,
            bus,
            producer,
            gate,
            span,
            states,
            lifecycle: Mutex::new(Lifecycle::Created),
            reactors: Mutex::new(slots),
        })
    }
}

/// One agent instance: a bus, an adapter and the reactors between them.
///
/// The engine holds the reactors in registration order: exchange tracker,
/// message assembler, state machine, added reactors, stream bridge.
/// `initialize` runs them in that order, so every consumer is subscribed
/// before the bridge can publish; `destroy` runs them in reverse.
pub struct AgentEngine {
    agent_id: AgentId,
    session_id: SessionId,
    config: EngineConfig,
    adapter: Arc<dyn ProviderAdapter>,
    bus: EventBus,
    producer: Producer,
    gate: Arc<AdapterGate>,
    span: Span,
    states: StateHandle,
    lifecycle: Mutex<Lifecycle>,
    reactors: Mutex<Vec<ReactorSlot>>,
}

impl AgentEngine {
    pub fn builder(adapter: Arc<dyn ProviderAdapter>) -> AgentEngineBuilder {
        AgentEngineBuilder {
            adapter,
            config: EngineConfig::default(),
            agent_id: None,
            session_id: None,
            reactors: Vec::new(),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn create_producer(&self) -> Result<Producer, EngineError> {
        Ok(self.bus.create_producer()?)
    }

    pub fn create_consumer(&self) -> Result<Consumer, EngineError> {
        Ok(self.bus.create_consumer()?)
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.gate.state()
    }

    pub fn current_state(&self) -> Option<AgentState> {
        self.states.current(&self.agent_id)
    }

    pub fn is_initialized(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Initialized
    }

    pub fn is_destroyed(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Destroyed
    }

    pub fn reactors(&self) -> Vec<ReactorInfo> {
        self.reactors
            .lock()
            .iter()
            .map(|slot| ReactorInfo {
                id: slot.id.clone(),
                name: slot.reactor.name().to_string(),
                state: slot.state,
            })
            .collect()
    }

    /// Initialize every reactor in registration order. Idempotent. If one
    /// fails, those already initialized are destroyed in reverse order and
    /// the engine ends up destroyed.
    #[instrument(skip(self), fields(agent_id = %self.agent_id))]
    pub fn initialize(&self) -> Result<(), EngineError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Initialized => return Ok(()),
            Lifecycle::Destroyed => return Err(EngineError::Destroyed),
            Lifecycle::Created => {}
        }

        let mut slots = self.reactors.lock();
        for i in 0..slots.len() {
            let ctx = ReactorContext {
                agent_id: self.agent_id.clone(),
                session_id: self.session_id.clone(),
                consumer: self.bus.create_consumer()?,
                producer: self.bus.create_producer()?,
                span: self.span.clone(),
            };
            let slot = &mut slots[i];
            match slot.reactor.on_initialize(ctx) {
                Ok(()) => {
                    slot.state = ReactorState::Active;
                    debug!(reactor = slot.reactor.name(), "reactor initialized");
                }
                Err(err) => {
                    let reactor = slot.reactor.name().to_string();
                    error!(reactor = %reactor, error = %err, "reactor failed to initialize; rolling back");
                    slot.state = ReactorState::Destroyed;
                    for earlier in slots[..i].iter_mut().rev() {
                        destroy_slot(earlier);
                    }
                    *lifecycle = Lifecycle::Destroyed;
                    self.bus.close();
                    return Err(EngineError::ReactorInit {
                        reactor,
                        reason: err.to_string(),
                    });
                }
            }
        }

        *lifecycle = Lifecycle::Initialized;
        info!(reactors = slots.len(), adapter = self.adapter.name(), "agent initialized");
        Ok(())
    }

    /// Destroy every active reactor in reverse registration order, then
    /// close the bus. Idempotent.
    #[instrument(skip(self), fields(agent_id = %self.agent_id))]
    pub fn destroy(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Destroyed {
                return;
            }
            *lifecycle = Lifecycle::Destroyed;
        }
        let mut slots = self.reactors.lock();
        for slot in slots.iter_mut().rev() {
            destroy_slot(slot);
        }
        self.bus.close();
        info!("agent destroyed");
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        match *self.lifecycle.lock() {
            Lifecycle::Initialized => Ok(()),
            Lifecycle::Created => Err(EngineError::NotInitialized),
            Lifecycle::Destroyed => Err(EngineError::Destroyed),
        }
    }

    /// Start a turn for `message`. Fails with `AdapterBusy` while another
    /// turn is in flight.
    #[instrument(skip(self, message), fields(agent_id = %self.agent_id, message_id = %message.id))]
    pub fn send_message(&self, message: UserMessage) -> Result<TurnId, EngineError> {
        self.ensure_running()?;
        let turn_id = TurnId::new();
        self.gate.claim(&turn_id)?;
        debug!(turn_id = %turn_id, "turn started");
        self.producer.publish(Event::command(
            self.agent_id.clone(),
            Command::SendMessage {
                turn_id: turn_id.clone(),
                message,
            },
        ));
        Ok(turn_id)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<TurnId, EngineError> {
        self.send_message(UserMessage::text(text))
    }

    /// Ask the active turn to stop. A no-op when no turn is active.
    #[instrument(skip(self, reason), fields(agent_id = %self.agent_id))]
    pub fn interrupt(&self, reason: impl Into<String>) -> Result<(), EngineError> {
        self.ensure_running()?;
        self.producer.publish(Event::command(
            self.agent_id.clone(),
            Command::Interrupt { reason: reason.into() },
        ));
        Ok(())
    }
}

impl Drop for AgentEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn destroy_slot(slot: &mut ReactorSlot) {
    if slot.state != ReactorState::Active {
        return;
    }
    let name = slot.reactor.name().to_string();
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| slot.reactor.on_destroy())) {
        error!(reactor = %name, panic = %panic_message(panic.as_ref()), "reactor panicked during destroy");
    }
    slot.state = ReactorState::Destroyed;
    debug!(reactor = %name, "reactor destroyed");
}
