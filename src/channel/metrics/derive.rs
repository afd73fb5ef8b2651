//! Per-metric derivation: `none`, `delta`, `rate`.
//!
//! Grounded on `cockpitmetrics.c`'s `derive` handling: a raw `false` (not
//! `null`) stands for "no value yet" on the first sample of a new instance.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeriveKind {
    None,
    Delta,
    Rate,
}

impl Default for DeriveKind {
    fn default() -> Self {
        DeriveKind::None
    }
}

/// Per-instance derivation state carried from tick to tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeriveState {
    previous_value: Option<f64>,
    previous_ts_ms: Option<i64>,
}

/// A derived value, matching the JSON shape the wire protocol expects:
/// `false` (not `null`) stands for "not yet derivable".
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Derived {
    Value(f64),
    Indeterminate,
}

impl DeriveState {
    /// Apply `kind` to a fresh raw sample, updating internal state and
    /// returning the value to put on the wire.
    pub fn apply(&mut self, kind: DeriveKind, raw: f64, ts_ms: i64) -> Derived {
        let result = match kind {
            DeriveKind::None => Derived::Value(raw),
            DeriveKind::Delta => match self.previous_value {
                Some(prev) => Derived::Value(raw - prev),
                None => Derived::Indeterminate,
            },
            DeriveKind::Rate => match (self.previous_value, self.previous_ts_ms) {
                (Some(prev), Some(prev_ts)) if ts_ms > prev_ts => {
                    Derived::Value((raw - prev) * 1000.0 / (ts_ms - prev_ts) as f64)
                }
                _ => Derived::Indeterminate,
            },
        };
        self.previous_value = Some(raw);
        self.previous_ts_ms = Some(ts_ms);
        result
    }
}

impl Derived {
    #[must_use]
    pub fn to_json(self) -> serde_json::Value {
        match self {
            Derived::Value(v) if v.is_nan() => serde_json::Value::Bool(false),
            Derived::Value(v) => serde_json::json!(v),
            Derived::Indeterminate => serde_json::Value::Bool(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_passes_through() {
        let mut state = DeriveState::default();
        assert_eq!(state.apply(DeriveKind::None, 42.0, 1000), Derived::Value(42.0));
        assert_eq!(state.apply(DeriveKind::None, 7.0, 2000), Derived::Value(7.0));
    }

    #[test]
    fn delta_first_sample_is_indeterminate_then_subtracts() {
        let mut state = DeriveState::default();
        assert_eq!(state.apply(DeriveKind::Delta, 10.0, 1000), Derived::Indeterminate);
        assert_eq!(state.apply(DeriveKind::Delta, 15.0, 2000), Derived::Value(5.0));
    }

    #[test]
    fn rate_is_per_second() {
        let mut state = DeriveState::default();
        state.apply(DeriveKind::Rate, 0.0, 0);
        match state.apply(DeriveKind::Rate, 10.0, 500) {
            Derived::Value(v) => assert!((v - 20.0).abs() < 1e-9),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn nan_raw_value_renders_as_false() {
        assert_eq!(Derived::Value(f64::NAN).to_json(), serde_json::Value::Bool(false));
        assert_eq!(Derived::Indeterminate.to_json(), serde_json::Value::Bool(false));
    }
}
