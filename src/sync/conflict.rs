//! Conflict Resolver
//!
//! Reconciles the optimistic value held in the cache with the value the
//! server returned for the same entity.

use super::models::OperationType;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fields consulted by `TimestampWins`, in order
const TIMESTAMP_FIELDS: [&str; 2] = ["updated_at", "timestamp"];

/// How a conflict is decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Adopt the server value unconditionally
    #[default]
    ServerWins,
    /// The value with the newer timestamp field wins
    TimestampWins,
    /// Field-level merge, server fields take precedence
    Merge,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerWins => "server_wins",
            Self::TimestampWins => "timestamp_wins",
            Self::Merge => "merge",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server_wins" => Ok(Self::ServerWins),
            "timestamp_wins" => Ok(Self::TimestampWins),
            "merge" => Ok(Self::Merge),
            other => Err(format!("Unknown conflict strategy: {}", other)),
        }
    }
}

/// Outcome of a resolution
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub value: Value,

    /// Strategy that actually decided
    pub strategy: ConflictStrategy,

    /// Configured strategy could not decide; server value was used
    pub fell_back: bool,
}

impl Resolution {
    fn decided(value: Value, strategy: ConflictStrategy) -> Self {
        Self {
            value,
            strategy,
            fell_back: false,
        }
    }

    fn fallback(server: &Value) -> Self {
        Self {
            value: server.clone(),
            strategy: ConflictStrategy::ServerWins,
            fell_back: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Decide between the optimistic and server values of one entity.
    /// Never keeps optimistic data when the strategy cannot decide.
    pub fn resolve(&self, op_type: OperationType, optimistic: Option<&Value>, server: &Value) -> Resolution {
        let optimistic = match optimistic {
            Some(value) => value,
            // Nothing local to compare against
            None => return Resolution::decided(server.clone(), ConflictStrategy::ServerWins),
        };

        match self.strategy {
            ConflictStrategy::ServerWins => Resolution::decided(server.clone(), ConflictStrategy::ServerWins),

            ConflictStrategy::TimestampWins => {
                match (timestamp_of(optimistic), timestamp_of(server)) {
                    (Some(local), Some(remote)) => {
                        let value = if local > remote { optimistic } else { server };
                        Resolution::decided(value.clone(), ConflictStrategy::TimestampWins)
                    }
                    _ => {
                        log::warn!(
                            "Conflict on {}: no comparable timestamp, using server value",
                            op_type
                        );
                        Resolution::fallback(server)
                    }
                }
            }

            ConflictStrategy::Merge => match (optimistic.as_object(), server.as_object()) {
                (Some(local), Some(remote)) => {
                    let mut merged = local.clone();
                    for (field, value) in remote {
                        merged.insert(field.clone(), value.clone());
                    }
                    Resolution::decided(Value::Object(merged), ConflictStrategy::Merge)
                }
                _ => {
                    log::warn!("Conflict on {}: values are not objects, using server value", op_type);
                    Resolution::fallback(server)
                }
            },
        }
    }
}

/// First usable timestamp: RFC 3339 string or epoch milliseconds
fn timestamp_of(value: &Value) -> Option<DateTime<Utc>> {
    let object = value.as_object()?;
    TIMESTAMP_FIELDS.iter().find_map(|field| match object.get(*field)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
        _ => None,
    })
}
