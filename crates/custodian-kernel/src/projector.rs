//! State Projector.
//!
//! Evaluates the small state-bag-to-input path language: `null`/empty means
//! "the whole bag", `$.key` extracts one value, `$.a,$.b,...` merges several
//! top-level keys into one object.

use custodian_core::ChainState;
use serde_json::Value;

/// Result of a projection: the projected value plus any warnings to carry
/// into the audit record.
#[derive(Debug, Clone)]
pub struct Projection {
    pub value: Value,
    pub warnings: Vec<String>,
}

/// Project `state` through `mapping`.
///
/// An absent key never aborts projection; it resolves to `Value::Null` at
/// that key. Whether that null is acceptable is a precheck concern, not
/// this function's.
#[must_use]
pub fn project(state: &ChainState, mapping: Option<&str>) -> Projection {
    let mapping = mapping.map(str::trim).filter(|m| !m.is_empty());

    let Some(mapping) = mapping else {
        return Projection {
            value: Value::Object(state.as_object().clone()),
            warnings: Vec::new(),
        };
    };

    if !mapping.starts_with("$.") {
        return Projection {
            value: Value::Object(state.as_object().clone()),
            warnings: Vec::new(),
        };
    }

    let keys: Vec<&str> = mapping
        .split(',')
        .map(str::trim)
        .filter_map(|k| k.strip_prefix("$."))
        .filter(|k| !k.is_empty())
        .collect();

    if keys.len() == 1 {
        let value = state.get(keys[0]).cloned().unwrap_or(Value::Null);
        return Projection {
            value,
            warnings: Vec::new(),
        };
    }

    let mut merged = serde_json::Map::new();
    let mut warnings = Vec::new();
    for key in keys {
        let value = state.get(key).cloned().unwrap_or(Value::Null);
        if merged.contains_key(key) {
            warnings.push(format!("duplicate projection key '{key}' shadowed earlier value"));
        }
        merged.insert(key.to_string(), value);
    }

    Projection {
        value: Value::Object(merged),
        warnings,
    }
}
