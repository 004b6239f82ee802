//! # prism-engine
//!
//! Event-processing engine for one agent instance.
//!
//! - **Event bus**: synchronous, ordered publish/subscribe keyed by event type
//! - **Stream bridge**: drives the provider adapter and republishes its stream
//! - **State machine**: derives the agent's conversation and tool state
//! - **Message assembler**: folds stream events into complete messages
//! - **Exchange tracker**: pairs user messages with their responses
//! - **Engine**: owns the bus and reactors, runs their lifecycle in order
//!
//! ## Crate Position
//!
//! Depends on: prism-core, prism-settings, prism-telemetry.

#![deny(unsafe_code)]

pub mod assembler;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod gate;
pub mod reactor;
pub mod scripted;
pub mod state_machine;

pub use assembler::MessageAssembler;
pub use bridge::StreamBridge;
pub use bus::{Consumer, EventBus, EventFilter, EventReceiver, Producer, Subscription};
pub use config::EngineConfig;
pub use engine::{AgentEngine, AgentEngineBuilder, ReactorInfo};
pub use error::{BusError, EngineError};
pub use exchange::ExchangeTracker;
pub use gate::{AdapterGate, AdapterState};
pub use reactor::{Reactor, ReactorContext, ReactorState};
pub use scripted::{text_deltas_turn, text_turn, tool_turn, ScriptedAdapter, ScriptedTurn};
pub use state_machine::{AgentStateMachine, StateHandle};
