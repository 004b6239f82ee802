//! # prism-core
//!
//! Types shared by the prism engine and its hosts.
//!
//! - **Events**: the bus envelope, its payloads and the closed set of event types
//! - **Stream**: provider stream events and the [`ProviderAdapter`] seam
//! - **Messages**: user, assistant, tool-use and error messages
//! - **Errors**: the agent error taxonomy and adapter failures
//! - **State**: agent and tool-call lifecycle states
//!
//! ## Crate Position
//!
//! Depended on by: prism-settings, prism-telemetry, prism-engine.

pub mod adapter;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod state;
pub mod stream;
pub mod tokens;

pub use adapter::{EventStream, ProviderAdapter, StreamChunk};
pub use errors::{AdapterError, AgentError, ErrorCategory, ErrorCode, ErrorSeverity};
pub use events::{Event, EventBody, EventType};
