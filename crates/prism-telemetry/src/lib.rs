use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use prism_core::ids::{AgentId, SessionId};
use prism_settings::{LogFormat, LoggingSettings};
use tracing::{Level, Span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// How `init_telemetry` builds the subscriber.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Used when `RUST_LOG` is unset.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "prism_engine::bridge" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Json,
        }
    }
}

impl From<&LoggingSettings> for TelemetryConfig {
    /// Unparseable levels fall back to INFO (global) or are skipped (modules).
    fn from(settings: &LoggingSettings) -> Self {
        Self {
            log_level: Level::from_str(&settings.level).unwrap_or(Level::INFO),
            module_levels: settings
                .module_levels
                .iter()
                .filter_map(|(module, level)| {
                    Level::from_str(level).ok().map(|l| (module.clone(), l))
                })
                .collect(),
            format: settings.format,
        }
    }
}

/// Build the `EnvFilter` directive string for a config.
pub fn filter_directives(log_level: Level, module_levels: &[(String, Level)]) -> String {
    let mut filter_str = log_level.to_string().to_lowercase();
    for (module, level) in module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}

/// Handle returned by [`init_telemetry`]. Keeps the reload handle for
/// runtime level changes.
pub struct TelemetryGuard {
    log_level: Level,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
    reload: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TelemetryGuard {
    /// False when another global subscriber was already installed.
    pub fn is_installed(&self) -> bool {
        self.reload.is_some()
    }

    pub fn directives(&self) -> String {
        filter_directives(self.log_level, &self.level_filter.read())
    }

    /// Record a per-module level override.
    pub fn set_module_level(&self, module: &str, level: Level) {
        {
            let mut levels = self.level_filter.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
        }
        if let Some(handle) = &self.reload {
            if let Err(e) = handle.reload(EnvFilter::new(self.directives())) {
                tracing::warn!(error = %e, module, "failed to reload log filter");
            }
        }
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }
}

/// Initialize the global subscriber. Safe to call more than once: later
/// calls leave the first subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let level_filter = Arc::new(RwLock::new(config.module_levels.clone()));

    let filter_str = filter_directives(config.log_level, &config.module_levels);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_list(true),
            )
            .try_init()
            .is_ok(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter_layer)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .is_ok(),
    };

    TelemetryGuard {
        log_level: config.log_level,
        level_filter,
        reload: installed.then_some(handle),
    }
}

/// Root span for everything one agent instance logs. Reactors receive it
/// through their initialization context.
pub fn agent_span(agent_id: &AgentId, session_id: &SessionId) -> Span {
    tracing::info_span!("agent", agent_id = %agent_id, session_id = %session_id)
}
