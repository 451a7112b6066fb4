//! Condition evaluation over settled step results.
//!
//! Fields address earlier results as `step:<id>.status` or
//! `step:<id>.result.<dot.path>`. Resolution goes through a small typed
//! walker returning `Option<Value>`; any traversal failure — unknown step,
//! missing path segment, result on a step that never completed — resolves
//! to `None` rather than an error.
//!
//! Operator semantics: `eq`/`neq` are loose, with numeric coercion only
//! when both sides are scalars and one is a number-bearing string;
//! `gt`/`lt` are strict and false for non-numeric operands; `contains` is
//! substring on strings and membership on arrays; `exists` is true iff the
//! field resolves to a non-null value (`0`, `""`, and `false` all exist).

use std::collections::HashMap;

use crate::types::{Condition, ConditionOp, StepOutcome};

/// Resolve a condition field against the results observed so far.
pub fn resolve_field(
    field: &str,
    results: &HashMap<String, StepOutcome>,
) -> Option<serde_json::Value> {
    let rest = field.strip_prefix("step:")?;
    let (step_id, path) = match rest.split_once('.') {
        Some((id, path)) => (id, path),
        None => (rest, ""),
    };

    let outcome = results.get(step_id)?;
    match path {
        "status" => Some(serde_json::Value::String(outcome.status_str().to_owned())),
        "result" => outcome.value().cloned(),
        _ => match path.strip_prefix("result.") {
            Some(inner) => walk_path(outcome.value()?, inner),
            None => None,
        },
    }
}

/// Walk a dot path into a JSON value. Array segments are numeric indices.
pub fn walk_path(value: &serde_json::Value, path: &str) -> Option<serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Evaluate a condition against the results observed so far.
pub fn evaluate(condition: &Condition, results: &HashMap<String, StepOutcome>) -> bool {
    let resolved = resolve_field(&condition.field, results);

    match condition.op {
        ConditionOp::Eq => resolved.is_some_and(|v| loose_eq(&v, &condition.value)),
        ConditionOp::Neq => !resolved.is_some_and(|v| loose_eq(&v, &condition.value)),
        ConditionOp::Gt => both_numbers(resolved.as_ref(), &condition.value)
            .is_some_and(|(a, b)| a > b),
        ConditionOp::Lt => both_numbers(resolved.as_ref(), &condition.value)
            .is_some_and(|(a, b)| a < b),
        ConditionOp::Contains => resolved.is_some_and(|v| contains(&v, &condition.value)),
        ConditionOp::Exists => resolved.is_some_and(|v| !v.is_null()),
    }
}

/// Loose equality: exact JSON equality, or numeric equality when both
/// sides are scalars and at least one is a number-bearing string.
fn loose_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    if a == b {
        return true;
    }
    match (scalar_number(a), scalar_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn scalar_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn both_numbers(a: Option<&serde_json::Value>, b: &serde_json::Value) -> Option<(f64, f64)> {
    // Strict: only genuine JSON numbers participate in ordering.
    Some((a?.as_f64()?, b.as_f64()?))
}

fn contains(haystack: &serde_json::Value, needle: &serde_json::Value) -> bool {
    match haystack {
        serde_json::Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        serde_json::Value::Array(items) => items.iter().any(|item| item == needle),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SkipReason;

    fn completed(value: serde_json::Value) -> StepOutcome {
        StepOutcome::Completed {
            value,
            duration_ms: 1,
        }
    }

    fn results() -> HashMap<String, StepOutcome> {
        let mut map = HashMap::new();
        map.insert(
            "fetch".to_owned(),
            completed(serde_json::json!({
                "count": 3,
                "zero": 0,
                "empty": "",
                "flag": false,
                "nothing": null,
                "name": "quarterly report",
                "tags": ["urgent", "finance"],
                "user": {"id": 42, "score": "7"},
            })),
        );
        map.insert(
            "probe".to_owned(),
            StepOutcome::Failed {
                error: "boom".to_owned(),
                duration_ms: 2,
            },
        );
        map.insert(
            "gate".to_owned(),
            StepOutcome::Skipped {
                reason: SkipReason::ConditionFalse,
            },
        );
        map
    }

    fn cond(field: &str, op: ConditionOp, value: serde_json::Value) -> Condition {
        Condition {
            field: field.to_owned(),
            op,
            value,
        }
    }

    #[test]
    fn test_status_field() {
        let r = results();
        assert!(evaluate(
            &cond("step:fetch.status", ConditionOp::Eq, serde_json::json!("completed")),
            &r
        ));
        assert!(evaluate(
            &cond("step:probe.status", ConditionOp::Eq, serde_json::json!("failed")),
            &r
        ));
        assert!(evaluate(
            &cond("step:gate.status", ConditionOp::Eq, serde_json::json!("skipped")),
            &r
        ));
    }

    #[test]
    fn test_eq_numeric_coercion() {
        let r = results();
        // "7" (string in the result) == 7 (number in the condition).
        assert!(evaluate(
            &cond("step:fetch.result.user.score", ConditionOp::Eq, serde_json::json!(7)),
            &r
        ));
        assert!(evaluate(
            &cond("step:fetch.result.count", ConditionOp::Eq, serde_json::json!("3")),
            &r
        ));
        assert!(!evaluate(
            &cond("step:fetch.result.count", ConditionOp::Eq, serde_json::json!("nope")),
            &r
        ));
    }

    #[test]
    fn test_neq() {
        let r = results();
        assert!(evaluate(
            &cond("step:fetch.result.count", ConditionOp::Neq, serde_json::json!(4)),
            &r
        ));
        assert!(!evaluate(
            &cond("step:fetch.result.count", ConditionOp::Neq, serde_json::json!(3)),
            &r
        ));
        // Unresolvable field: not equal to anything.
        assert!(evaluate(
            &cond("step:missing.result.x", ConditionOp::Neq, serde_json::json!(1)),
            &r
        ));
    }

    #[test]
    fn test_gt_lt_strict() {
        let r = results();
        assert!(evaluate(
            &cond("step:fetch.result.count", ConditionOp::Gt, serde_json::json!(2)),
            &r
        ));
        assert!(evaluate(
            &cond("step:fetch.result.count", ConditionOp::Lt, serde_json::json!(10)),
            &r
        ));
        // Number-bearing string does not order.
        assert!(!evaluate(
            &cond("step:fetch.result.user.score", ConditionOp::Gt, serde_json::json!(1)),
            &r
        ));
        // Non-numeric operand.
        assert!(!evaluate(
            &cond("step:fetch.result.name", ConditionOp::Gt, serde_json::json!(1)),
            &r
        ));
    }

    #[test]
    fn test_contains() {
        let r = results();
        assert!(evaluate(
            &cond("step:fetch.result.name", ConditionOp::Contains, serde_json::json!("report")),
            &r
        ));
        assert!(evaluate(
            &cond("step:fetch.result.tags", ConditionOp::Contains, serde_json::json!("urgent")),
            &r
        ));
        assert!(!evaluate(
            &cond("step:fetch.result.tags", ConditionOp::Contains, serde_json::json!("calm")),
            &r
        ));
        // Contains on a number is false.
        assert!(!evaluate(
            &cond("step:fetch.result.count", ConditionOp::Contains, serde_json::json!(3)),
            &r
        ));
    }

    #[test]
    fn test_exists_truth_table() {
        let r = results();
        // Falsy-but-present values exist.
        for path in [
            "step:fetch.result.zero",
            "step:fetch.result.empty",
            "step:fetch.result.flag",
        ] {
            assert!(
                evaluate(&cond(path, ConditionOp::Exists, serde_json::Value::Null), &r),
                "{path} should exist"
            );
        }
        // Null, missing path, missing step, and failed-step results do not.
        for path in [
            "step:fetch.result.nothing",
            "step:fetch.result.no.such.path",
            "step:missing.result.x",
            "step:probe.result.x",
        ] {
            assert!(
                !evaluate(&cond(path, ConditionOp::Exists, serde_json::Value::Null), &r),
                "{path} should not exist"
            );
        }
    }

    #[test]
    fn test_array_index_path() {
        let r = results();
        assert!(evaluate(
            &cond("step:fetch.result.tags.0", ConditionOp::Eq, serde_json::json!("urgent")),
            &r
        ));
        assert!(!evaluate(
            &cond("step:fetch.result.tags.9", ConditionOp::Exists, serde_json::Value::Null),
            &r
        ));
    }

    #[test]
    fn test_malformed_fields_resolve_to_none() {
        let r = results();
        for field in ["fetch.result.count", "step:", "step:fetch.output.count"] {
            assert!(resolve_field(field, &r).is_none(), "{field} must not resolve");
        }
    }
}
