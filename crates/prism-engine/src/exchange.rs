use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prism_core::events::{
    Event, EventBody, EventType, ExchangeOutcome, ExchangePayload, ExchangeRequest, ExchangeResponse,
};
use prism_core::ids::{AgentId, ExchangeId};
use prism_core::messages::{Message, UserMessage};
use prism_core::tokens::ModelPricing;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::reactor::{FailureReporter, Reactor, ReactorContext};

pub const NAME: &str = "exchange_tracker";

struct PendingExchange {
    exchange_id: ExchangeId,
    number: u64,
    user_message: UserMessage,
    requested_at: DateTime<Utc>,
}

#[derive(Default)]
struct AgentExchanges {
    issued: u64,
    pending: VecDeque<PendingExchange>,
}

impl AgentExchanges {
    fn open(&mut self, user_message: &UserMessage) -> ExchangeRequest {
        if let Some(oldest) = self.pending.front() {
            warn!(
                pending_exchange = oldest.number,
                "user message while a response is outstanding; queueing exchange"
            );
        }
        self.issued += 1;
        let request = ExchangeRequest {
            exchange_id: ExchangeId::new(),
            exchange_number: self.issued,
            user_message: user_message.clone(),
            requested_at: Utc::now(),
        };
        self.pending.push_back(PendingExchange {
            exchange_id: request.exchange_id.clone(),
            number: request.exchange_number,
            user_message: request.user_message.clone(),
            requested_at: request.requested_at,
        });
        request
    }

    /// Resolve the exchange the response answers: the one whose user
    /// message is the response's parent, else the oldest.
    fn take_for(&mut self, response: &Message) -> Option<PendingExchange> {
        let by_parent = response
            .parent_id()
            .and_then(|parent| self.pending.iter().position(|p| p.user_message.id == *parent));
        match by_parent {
            Some(pos) => self.pending.remove(pos),
            None => self.pending.pop_front(),
        }
    }
}

#[derive(Default)]
pub(crate) struct Exchanges {
    agents: HashMap<AgentId, AgentExchanges>,
}

impl Exchanges {
    pub(crate) fn pending(&self, agent_id: &AgentId) -> usize {
        self.agents.get(agent_id).map_or(0, |a| a.pending.len())
    }

    pub(crate) fn apply(&mut self, event: &Event, pricing: Option<&ModelPricing>) -> Option<ExchangePayload> {
        let EventBody::Message(payload) = &event.body else {
            return None;
        };
        let agent = self.agents.entry(event.agent_id.clone()).or_default();

        if let Message::User(user) = &payload.message {
            return Some(ExchangePayload::Request(agent.open(user)));
        }
        if !payload.message.ends_turn() {
            return None;
        }
        let (outcome, usage) = match &payload.message {
            Message::Assistant(m) => (ExchangeOutcome::Success, m.usage.filter(|u| !u.is_empty())),
            Message::Error(m) => (ExchangeOutcome::Error { error: m.error.clone() }, None),
            _ => return None,
        };

        let Some(pending) = agent.take_for(&payload.message) else {
            warn!(message_id = %payload.message.id(), "response without a pending exchange");
            return None;
        };

        let responded_at = Utc::now().max(pending.requested_at);
        let duration_ms = (responded_at - pending.requested_at).num_milliseconds().max(0) as u64;
        let cost_usd = usage.zip(pricing).map(|(u, p)| p.cost_usd(&u));
        debug!(
            exchange = pending.number,
            duration_ms,
            total_tokens = usage.map(|u| u.total()),
            "exchange closed"
        );

        Some(ExchangePayload::Response(ExchangeResponse {
            exchange_id: pending.exchange_id,
            exchange_number: pending.number,
            request_message_id: pending.user_message.id,
            response_message_id: payload.message.id().clone(),
            requested_at: pending.requested_at,
            responded_at,
            duration_ms,
            outcome,
            usage,
            cost_usd,
        }))
    }
}

/// Pairs each user message with the terminal message that answers it and
/// publishes the request and response as exchange events.
pub struct ExchangeTracker {
    pricing: Option<ModelPricing>,
    state: Arc<Mutex<Exchanges>>,
    ctx: Option<ReactorContext>,
}

impl ExchangeTracker {
    pub fn new(pricing: Option<ModelPricing>) -> Self {
        Self {
            pricing,
            state: Arc::new(Mutex::new(Exchanges::default())),
            ctx: None,
        }
    }

    pub fn pending(&self, agent_id: &AgentId) -> usize {
        self.state.lock().pending(agent_id)
    }
}

impl Reactor for ExchangeTracker {
    fn name(&self) -> &str {
        NAME
    }

    fn on_initialize(&mut self, ctx: ReactorContext) -> Result<(), EngineError> {
        let state = Arc::clone(&self.state);
        let pricing = self.pricing;
        let producer = ctx.producer.clone();
        let span = ctx.span.clone();
        let reporter = FailureReporter::new(NAME, &ctx);
        ctx.consumer.consume_by_types(
            &[EventType::UserMessage, EventType::AssistantMessage, EventType::ErrorMessage],
            move |event| {
                reporter.guard(event, || {
                    let update = span.in_scope(|| state.lock().apply(event, pricing.as_ref()));
                    if let Some(payload) = update {
                        debug!(
                            parent: &span,
                            exchange = payload.exchange_number(),
                            exchange_id = %payload.exchange_id(),
                            "exchange event"
                        );
                        producer.publish(Event::new(event.agent_id.clone(), EventBody::Exchange(payload)));
                    }
                })
            },
        )?;
        self.ctx = Some(ctx);
        Ok(())
    }

    fn on_destroy(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            ctx.consumer.unsubscribe_all();
            let left = self.state.lock().pending(&ctx.agent_id);
            if left > 0 {
                warn!(parent: &ctx.span, pending = left, "exchange tracker destroyed with unresolved exchanges");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::errors::{AgentError, ErrorCode};
    use prism_core::ids::{MessageId, TurnId};
    use prism_core::messages::{AssistantMessage, ErrorMessage, StopReason};
    use prism_core::tokens::TokenUsage;

    fn user_event(agent: &AgentId, text: &str) -> (Event, MessageId) {
        let msg = UserMessage::text(text);
        let id = msg.id.clone();
        (Event::message(agent.clone(), Some(TurnId::new()), Message::User(msg)), id)
    }

    fn assistant_event(agent: &AgentId, parent: Option<MessageId>, usage: Option<TokenUsage>) -> Event {
        let msg = AssistantMessage {
            id: MessageId::new(),
            content: "ok".into(),
            thinking: None,
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage,
            model: None,
            timestamp: Utc::now(),
            parent_id: parent,
        };
        Event::message(agent.clone(), None, Message::Assistant(msg))
    }

    fn response(payload: Option<ExchangePayload>) -> ExchangeResponse {
        match payload {
            Some(ExchangePayload::Response(r)) => r,
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn numbers_exchanges_and_pairs_responses() {
        let agent = AgentId::new();
        let mut ex = Exchanges::default();

        let (user, user_id) = user_event(&agent, "one");
        let request = match ex.apply(&user, None) {
            Some(ExchangePayload::Request(r)) => r,
            other => panic!("expected request, got {other:?}"),
        };
        assert_eq!(request.exchange_number, 1);
        assert_eq!(request.user_message.id, user_id);

        let r = response(ex.apply(&assistant_event(&agent, Some(user_id.clone()), None), None));
        assert_eq!(r.exchange_id, request.exchange_id);
        assert_eq!(r.request_message_id, user_id);
        assert!(r.outcome.is_success());
        assert!(r.responded_at >= r.requested_at);
        assert_eq!(
            r.duration_ms,
            (r.responded_at - r.requested_at).num_milliseconds() as u64
        );
        assert_eq!(ex.pending(&agent), 0);

        let (second, _) = user_event(&agent, "two");
        match ex.apply(&second, None) {
            Some(ExchangePayload::Request(r)) => assert_eq!(r.exchange_number, 2),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn parent_link_wins_over_fifo() {
        let agent = AgentId::new();
        let mut ex = Exchanges::default();
        let (first, _) = user_event(&agent, "first");
        let (second, second_id) = user_event(&agent, "second");
        ex.apply(&first, None);
        ex.apply(&second, None);

        let r = response(ex.apply(&assistant_event(&agent, Some(second_id.clone()), None), None));
        assert_eq!(r.exchange_number, 2);
        assert_eq!(r.request_message_id, second_id);

        let r = response(ex.apply(&assistant_event(&agent, None, None), None));
        assert_eq!(r.exchange_number, 1);
    }

    #[test]
    fn terminal_error_resolves_with_error_outcome() {
        let agent = AgentId::new();
        let mut ex = Exchanges::default();
        let (user, user_id) = user_event(&agent, "hi");
        ex.apply(&user, None);

        let mut diag = ErrorMessage::new(AgentError::internal("reactor hiccup"), false);
        diag.parent_id = Some(user_id.clone());
        assert!(ex
            .apply(&Event::message(agent.clone(), None, Message::Error(diag)), None)
            .is_none());

        let mut terminal = ErrorMessage::new(AgentError::timeout(std::time::Duration::from_secs(1)), true);
        terminal.parent_id = Some(user_id);
        let r = response(ex.apply(&Event::message(agent.clone(), None, Message::Error(terminal)), None));
        match r.outcome {
            ExchangeOutcome::Error { error } => assert_eq!(error.code, ErrorCode::Timeout),
            ExchangeOutcome::Success => panic!("expected error outcome"),
        }
        assert!(r.usage.is_none());
    }

    #[test]
    fn cost_needs_usage_and_pricing() {
        let agent = AgentId::new();
        let pricing = ModelPricing {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
            cache_read_per_mtok: 0.0,
            cache_write_per_mtok: 0.0,
        };
        let mut ex = Exchanges::default();

        let (user, _) = user_event(&agent, "a");
        ex.apply(&user, Some(&pricing));
        let r = response(ex.apply(
            &assistant_event(&agent, None, Some(TokenUsage::new(1_000_000, 1_000_000))),
            Some(&pricing),
        ));
        assert_eq!(r.usage, Some(TokenUsage::new(1_000_000, 1_000_000)));
        assert!((r.cost_usd.unwrap() - 18.0).abs() < 1e-9);

        let (user, _) = user_event(&agent, "b");
        ex.apply(&user, None);
        let r = response(ex.apply(&assistant_event(&agent, None, Some(TokenUsage::new(5, 5))), None));
        assert!(r.cost_usd.is_none());
    }

    #[test]
    fn response_without_request_is_dropped() {
        let agent = AgentId::new();
        let mut ex = Exchanges::default();
        assert!(ex.apply(&assistant_event(&agent, None, None), None).is_none());
    }
}
