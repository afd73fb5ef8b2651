//! Interpolation: when the actual sampling interval drifts from the
//! declared `meta_interval`, adjust the emitted value (and timestamp) back
//! onto the regular grid rather than reporting jittery real elapsed time.
//!
//! Grounded on `cockpitmetrics.c`'s interpolation pass, which runs on the
//! raw sample *before* derivation and is skipped across a meta reset.

/// Linearly interpolate `next` back onto the `meta_interval` grid given how
/// long actually elapsed (`actual_interval_ms`) since `last`.
#[must_use]
pub fn interpolate_value(last: f64, next: f64, meta_interval_ms: u64, actual_interval_ms: u64) -> f64 {
    if actual_interval_ms == 0 {
        return next;
    }
    let ratio = meta_interval_ms as f64 / actual_interval_ms as f64;
    last + (next - last) * ratio
}

/// The logical timestamp to report for an interpolated sample.
#[must_use]
pub fn interpolated_timestamp_ms(last_timestamp_ms: i64, meta_interval_ms: u64) -> i64 {
    last_timestamp_ms + meta_interval_ms as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_interval_is_a_no_op() {
        assert_eq!(interpolate_value(10.0, 20.0, 1000, 1000), 20.0);
    }

    #[test]
    fn slower_actual_interval_scales_down() {
        // Real tick took twice as long as the declared interval: only half
        // the change should show up at the nominal grid point.
        let v = interpolate_value(10.0, 30.0, 1000, 2000);
        assert!((v - 20.0).abs() < 1e-9);
    }

    #[test]
    fn timestamp_always_advances_by_meta_interval() {
        assert_eq!(interpolated_timestamp_ms(5000, 1000), 6000);
    }
}
