use std::collections::BTreeMap;

use prism_core::tokens::ModelPricing;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 600_000;
pub const DEFAULT_INTERRUPT_GRACE_MS: u64 = 5_000;
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 1_000;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrismSettings {
    pub engine: EngineSettings,
    pub logging: LoggingSettings,
    /// Prices used to attach a cost to exchange responses.
    pub pricing: Option<ModelPricing>,
}

impl PrismSettings {
    pub fn validate(&self) -> Result<()> {
        if self.engine.request_timeout_ms < MIN_REQUEST_TIMEOUT_MS {
            return Err(SettingsError::InvalidValue {
                field: "engine.requestTimeoutMs",
                reason: format!(
                    "must be >= {MIN_REQUEST_TIMEOUT_MS}, got {}",
                    self.engine.request_timeout_ms
                ),
            });
        }
        if let Some(p) = &self.pricing {
            let prices = [
                p.input_per_mtok,
                p.output_per_mtok,
                p.cache_read_per_mtok,
                p.cache_write_per_mtok,
            ];
            if prices.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(SettingsError::InvalidValue {
                    field: "pricing",
                    reason: "values must be finite and non-negative".into(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Upper bound on one provider turn.
    pub request_timeout_ms: u64,
    /// How long to wait for the adapter to acknowledge an interrupt.
    pub interrupt_grace_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            interrupt_grace_ms: DEFAULT_INTERRUPT_GRACE_MS,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
    /// Per-module overrides, e.g. `"prism_engine::bridge" => "debug"`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Json,
            module_levels: BTreeMap::new(),
        }
    }
}
