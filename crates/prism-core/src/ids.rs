use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(AgentId, "agent");
branded_id!(SessionId, "sess");
branded_id!(EventId, "evt");
branded_id!(TurnId, "turn");
branded_id!(MessageId, "msg");
branded_id!(ExchangeId, "exch");
branded_id!(ToolCallId, "toolu");
branded_id!(ReactorId, "reactor");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes() {
        assert!(AgentId::new().as_str().starts_with("agent_"));
        assert!(SessionId::new().as_str().starts_with("sess_"));
        assert!(EventId::new().as_str().starts_with("evt_"));
        assert!(TurnId::new().as_str().starts_with("turn_"));
        assert!(MessageId::new().as_str().starts_with("msg_"));
        assert!(ExchangeId::new().as_str().starts_with("exch_"));
        assert!(ToolCallId::new().as_str().starts_with("toolu_"));
        assert!(ReactorId::new().as_str().starts_with("reactor_"));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(EventId::new(), EventId::new());
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = TurnId::new();
        let parsed: TurnId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serializes_as_bare_string() {
        let id = ExchangeId::from_raw("exch_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"exch_1\"");
    }

    #[test]
    fn creation_order_sorts() {
        let ids: Vec<EventId> = (0..50).map(|_| EventId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
