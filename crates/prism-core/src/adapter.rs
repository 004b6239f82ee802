use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::AdapterError;
use crate::messages::UserMessage;
use crate::stream::StreamEvent;

/// One raw event from an adapter, with the content block it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamChunk {
    pub content_block_index: Option<u32>,
    pub event: StreamEvent,
}

impl StreamChunk {
    pub fn block(index: u32, event: StreamEvent) -> Self {
        Self {
            content_block_index: Some(index),
            event,
        }
    }

    pub fn message(event: StreamEvent) -> Self {
        Self {
            content_block_index: None,
            event,
        }
    }
}

impl From<StreamEvent> for StreamChunk {
    fn from(event: StreamEvent) -> Self {
        Self::message(event)
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// Contract between the engine and a concrete language-model integration.
///
/// `receive` returns a lazy, finite, non-restartable stream that ends at a
/// terminal event (`message_stop` or `interrupted`). At most one stream may be
/// outstanding per adapter; the engine enforces this. `interrupt` is a
/// best-effort request: a few buffered events may still arrive after it.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    async fn receive(&self, message: &UserMessage) -> Result<EventStream, AdapterError>;

    fn interrupt(&self);
}
