use parking_lot::Mutex;
use prism_core::ids::TurnId;

use crate::error::EngineError;

/// Whether the provider adapter has a `receive()` stream outstanding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AdapterState {
    #[default]
    Idle,
    Active(TurnId),
}

/// Enforces at most one in-flight `receive()` per adapter.
#[derive(Debug, Default)]
pub struct AdapterGate {
    state: Mutex<AdapterState>,
}

impl AdapterGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AdapterState {
        self.state.lock().clone()
    }

    pub fn is_idle(&self) -> bool {
        matches!(*self.state.lock(), AdapterState::Idle)
    }

    /// Claim the adapter for `turn_id`. Re-claiming for the same turn
    /// succeeds; claiming while another turn holds it does not.
    pub fn claim(&self, turn_id: &TurnId) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        match &*state {
            AdapterState::Idle => {
                *state = AdapterState::Active(turn_id.clone());
                Ok(())
            }
            AdapterState::Active(active) if active == turn_id => Ok(()),
            AdapterState::Active(active) => Err(EngineError::AdapterBusy {
                active_turn: active.clone(),
            }),
        }
    }

    /// Release if `turn_id` holds the gate. Returns whether it did.
    pub fn release(&self, turn_id: &TurnId) -> bool {
        let mut state = self.state.lock();
        match &*state {
            AdapterState::Active(active) if active == turn_id => {
                *state = AdapterState::Idle;
                true
            }
            _ => false,
        }
    }
}
