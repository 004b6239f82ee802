use std::time::Duration;

use prism_core::tokens::ModelPricing;
use prism_settings::PrismSettings;

/// Default upper bound on one provider turn.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
/// Default wait for an adapter to acknowledge an interrupt.
pub const DEFAULT_INTERRUPT_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub request_timeout: Duration,
    pub interrupt_grace: Duration,
    pub pricing: Option<ModelPricing>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            interrupt_grace: DEFAULT_INTERRUPT_GRACE,
            pricing: None,
        }
    }
}

impl From<&PrismSettings> for EngineConfig {
    fn from(settings: &PrismSettings) -> Self {
        Self {
            request_timeout: Duration::from_millis(settings.engine.request_timeout_ms),
            interrupt_grace: Duration::from_millis(settings.engine.interrupt_grace_ms),
            pricing: settings.pricing,
        }
    }
}
