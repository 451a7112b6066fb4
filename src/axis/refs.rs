//! `$ref:step:<id>[.path]` parameter resolution.
//!
//! Before a step executes, every string in its parameters matching the
//! reference pattern is replaced by the referent step's completed result,
//! or the sub-value at the dot path. Maps and arrays are traversed
//! recursively. A reference that cannot be resolved — unknown step, step
//! that never completed, missing path — is left in place as the literal
//! string and logged.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::axis::condition::walk_path;
use crate::types::StepOutcome;

fn ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\$ref:step:([a-zA-Z0-9_-]+)(?:\.(.+))?$").expect("valid reference pattern")
    })
}

/// Resolve all references in `parameters` against the results so far.
pub fn resolve_parameters(
    parameters: &serde_json::Value,
    results: &HashMap<String, StepOutcome>,
) -> serde_json::Value {
    match parameters {
        serde_json::Value::String(raw) => resolve_string(raw, results),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_parameters(v, results)))
                .collect(),
        ),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items.iter().map(|v| resolve_parameters(v, results)).collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(
    raw: &str,
    results: &HashMap<String, StepOutcome>,
) -> serde_json::Value {
    let Some(captures) = ref_pattern().captures(raw) else {
        return serde_json::Value::String(raw.to_owned());
    };
    let step_id = &captures[1];
    let path = captures.get(2).map(|m| m.as_str());

    let resolved = results
        .get(step_id)
        .and_then(StepOutcome::value)
        .and_then(|value| match path {
            Some(path) => walk_path(value, path),
            None => Some(value.clone()),
        });

    match resolved {
        Some(value) => value,
        None => {
            warn!(reference = raw, "unresolved step reference left as literal");
            serde_json::Value::String(raw.to_owned())
        }
    }
}
