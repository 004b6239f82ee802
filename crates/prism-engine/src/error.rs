use prism_core::ids::TurnId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("adapter is busy with turn {active_turn}")]
    AdapterBusy { active_turn: TurnId },

    #[error("engine not initialized")]
    NotInitialized,

    #[error("engine destroyed")]
    Destroyed,

    #[error("no tokio runtime available to drive the adapter")]
    NoRuntime,

    #[error("reactor '{reactor}' failed to initialize: {reason}")]
    ReactorInit { reactor: String, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}
