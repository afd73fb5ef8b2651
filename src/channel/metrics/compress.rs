//! Inter-frame compression: within a run that doesn't cross a meta boundary
//! or a reset, a cell that didn't change from the previous data row becomes
//! `null` (and a trailing run of unchanged instance values may be dropped
//! entirely rather than padded with `null`).
//!
//! Grounded on `cockpitmetrics.c`'s compression pass, which operates on the
//! already-derived row, not the raw samples.

use serde_json::Value;

/// Compress `current` against `previous` (the prior *derived* data row, or
/// `None` at the start of a run). Each element of the row is either a
/// scalar (non-instanced metric) or an array (instanced metric, one slot
/// per instance in declared order).
#[must_use]
pub fn compress_row(previous: Option<&[Value]>, current: &[Value]) -> Vec<Value> {
    current
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            let prior_cell = previous.and_then(|p| p.get(i));
            match cell {
                Value::Array(values) => {
                    let prior_values = prior_cell.and_then(Value::as_array);
                    Value::Array(compress_instances(prior_values, values))
                }
                scalar => {
                    if prior_cell == Some(scalar) {
                        Value::Null
                    } else {
                        scalar.clone()
                    }
                }
            }
        })
        .collect()
}

fn compress_instances(previous: Option<&Vec<Value>>, current: &[Value]) -> Vec<Value> {
    let mut out: Vec<Value> = current
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let prior = previous.and_then(|p| p.get(i));
            if prior == Some(value) {
                Value::Null
            } else {
                value.clone()
            }
        })
        .collect();
    while matches!(out.last(), Some(Value::Null)) {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_row_in_a_run_passes_through_unchanged() {
        let current = vec![json!(1.0), json!([2.0, 3.0])];
        assert_eq!(compress_row(None, &current), current);
    }

    #[test]
    fn unchanged_scalar_becomes_null() {
        let previous = vec![json!(1.0)];
        let current = vec![json!(1.0)];
        assert_eq!(compress_row(Some(&previous), &current), vec![Value::Null]);
    }

    #[test]
    fn changed_scalar_passes_through() {
        let previous = vec![json!(1.0)];
        let current = vec![json!(2.0)];
        assert_eq!(compress_row(Some(&previous), &current), vec![json!(2.0)]);
    }

    #[test]
    fn trailing_unchanged_instances_are_dropped() {
        let previous = vec![json!([1.0, 2.0, 3.0])];
        let current = vec![json!([1.0, 5.0, 3.0])];
        // middle instance changed, both ends unchanged: leading null kept,
        // trailing null dropped since nothing non-null follows it.
        assert_eq!(compress_row(Some(&previous), &current), vec![json!([Value::Null, json!(5.0)])]);
    }
}
