//! Optimistic updates as serializable descriptors
//!
//! A descriptor names the cache key and a reversible transform. Because it is
//! plain data it persists together with its operation; the cached value it
//! produced is not re-applied after a reload.

use crate::cache::keys;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Reversible change to a cached JSON object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    /// Add deltas to integer fields; rollback subtracts them
    Increment { deltas: BTreeMap<String, i64> },

    /// Overwrite fields; the overwritten values are captured on apply
    Patch {
        fields: Map<String, Value>,
        #[serde(default)]
        previous: Map<String, Value>,
        #[serde(default)]
        absent: Vec<String>,
    },
}

impl Transform {
    /// Compute the optimistic value. `None` when there is nothing to update.
    pub fn apply(&mut self, current: Option<&Value>) -> Option<Value> {
        let mut object = current?.as_object()?.clone();

        match self {
            Transform::Increment { deltas } => {
                for (field, delta) in deltas.iter() {
                    let base = object.get(field).and_then(Value::as_i64).unwrap_or(0);
                    object.insert(field.clone(), Value::from(base.saturating_add(*delta)));
                }
            }
            Transform::Patch {
                fields,
                previous,
                absent,
            } => {
                previous.clear();
                absent.clear();
                for (field, value) in fields.iter() {
                    match object.insert(field.clone(), value.clone()) {
                        Some(old) => {
                            previous.insert(field.clone(), old);
                        }
                        None => absent.push(field.clone()),
                    }
                }
            }
        }

        Some(Value::Object(object))
    }

    /// Undo a previous `apply` against whatever the value is now
    pub fn rollback(&self, current: Option<&Value>) -> Option<Value> {
        let mut object = current?.as_object()?.clone();

        match self {
            Transform::Increment { deltas } => {
                for (field, delta) in deltas {
                    if let Some(now) = object.get(field).and_then(Value::as_i64) {
                        object.insert(field.clone(), Value::from(now.saturating_sub(*delta)));
                    }
                }
            }
            Transform::Patch {
                fields,
                previous,
                absent,
            } => {
                for (field, written) in fields {
                    // A later write owns the field now
                    if object.get(field) != Some(written) {
                        continue;
                    }
                    if let Some(old) = previous.get(field) {
                        object.insert(field.clone(), old.clone());
                    } else if absent.contains(field) {
                        object.remove(field);
                    }
                }
            }
        }

        Some(Value::Object(object))
    }
}

/// Cache key + transform applied when an operation is enqueued
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimisticUpdate {
    pub cache_key: String,
    pub transform: Transform,

    /// The transform's effect is currently in the cache
    #[serde(default)]
    pub applied: bool,
}

impl OptimisticUpdate {
    pub fn increment<I, S>(cache_key: impl Into<String>, deltas: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        Self {
            cache_key: cache_key.into(),
            transform: Transform::Increment {
                deltas: deltas.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            },
            applied: false,
        }
    }

    pub fn patch(cache_key: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            cache_key: cache_key.into(),
            transform: Transform::Patch {
                fields,
                previous: Map::new(),
                absent: Vec::new(),
            },
            applied: false,
        }
    }

    /// `answered += 1` and `correct += is_correct` on the user's stats
    pub fn answer_submitted(user_id: &str, is_correct: bool) -> Self {
        Self::increment(
            keys::user_stats(user_id),
            [("answered", 1), ("correct", i64::from(is_correct))],
        )
    }
}
