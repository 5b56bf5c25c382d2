use crate::types::TrailingPriceBundle;

/// True once price has dipped below `reference * (1 - threshold_pct)` since
/// the last position change. Arms long trailing entries and short trailing
/// closes.
pub fn dipped_below(extrema: &TrailingPriceBundle, reference: f64, threshold_pct: f64) -> bool {
    extrema.min_since_open < reference * (1.0 - threshold_pct)
}

/// True once price has rebounded off the tracked low by `retracement_pct`.
pub fn rebounded_off_low(extrema: &TrailingPriceBundle, retracement_pct: f64) -> bool {
    extrema.max_since_min > extrema.min_since_open * (1.0 + retracement_pct)
}

/// True once price has rallied above `reference * (1 + threshold_pct)`
/// since the last position change. Arms short trailing entries and long
/// trailing closes.
pub fn rallied_above(extrema: &TrailingPriceBundle, reference: f64, threshold_pct: f64) -> bool {
    extrema.max_since_open > reference * (1.0 + threshold_pct)
}

/// True once price has faded off the tracked high by `retracement_pct`.
pub fn faded_off_high(extrema: &TrailingPriceBundle, retracement_pct: f64) -> bool {
    extrema.min_since_max < extrema.max_since_open * (1.0 - retracement_pct)
}

/// Advances the trailing extrema with one candle.
///
/// Within the candle the touch order of `high` and `low` is ambiguous; it is
/// resolved deterministically by candle direction: an up candle
/// (`close >= open`) is walked `open -> low -> high -> close`, a down candle
/// `open -> high -> low -> close`. A fresh bundle (sentinels) is populated
/// on the first candle after a position change, so the extrema are seeded
/// from that candle's own range.
pub fn update_trailing_prices(
    bundle: &mut TrailingPriceBundle,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
) {
    if close >= open {
        // low is visited first, high afterwards
        if low < bundle.min_since_open {
            bundle.min_since_open = low;
            bundle.max_since_min = high;
        } else {
            bundle.max_since_min = bundle.max_since_min.max(high);
        }
        if high > bundle.max_since_open {
            bundle.max_since_open = high;
            bundle.min_since_max = close;
        } else {
            bundle.min_since_max = bundle.min_since_max.min(low);
        }
    } else {
        // high is visited first, low afterwards
        if high > bundle.max_since_open {
            bundle.max_since_open = high;
            bundle.min_since_max = low;
        } else {
            bundle.min_since_max = bundle.min_since_max.min(low);
        }
        if low < bundle.min_since_open {
            bundle.min_since_open = low;
            bundle.max_since_min = close;
        } else {
            bundle.max_since_min = bundle.max_since_min.max(high);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_candle_seeds_from_own_range() {
        let mut bundle = TrailingPriceBundle::default();
        update_trailing_prices(&mut bundle, 100.0, 103.0, 98.0, 102.0);
        assert_eq!(bundle.min_since_open, 98.0);
        assert_eq!(bundle.max_since_open, 103.0);
        // up candle: the high comes after the low
        assert_eq!(bundle.max_since_min, 103.0);
        assert_eq!(bundle.min_since_max, 102.0);
    }

    #[test]
    fn test_down_candle_orders_high_before_low() {
        let mut bundle = TrailingPriceBundle::default();
        update_trailing_prices(&mut bundle, 102.0, 103.0, 98.0, 99.0);
        assert_eq!(bundle.max_since_open, 103.0);
        // the low comes after the high
        assert_eq!(bundle.min_since_max, 98.0);
        assert_eq!(bundle.min_since_open, 98.0);
        assert_eq!(bundle.max_since_min, 99.0);
    }

    #[test]
    fn test_retracement_after_new_low() {
        let mut bundle = TrailingPriceBundle::default();
        // dump to 97, then recover
        update_trailing_prices(&mut bundle, 100.0, 100.0, 97.0, 97.5);
        update_trailing_prices(&mut bundle, 97.5, 98.5, 97.2, 98.4);
        assert_eq!(bundle.min_since_open, 97.0);
        assert_eq!(bundle.max_since_min, 98.5);
    }

    #[test]
    fn test_dip_and_rebound_predicates() {
        let mut bundle = TrailingPriceBundle::default();
        update_trailing_prices(&mut bundle, 100.0, 100.0, 97.0, 97.5);
        assert!(dipped_below(&bundle, 100.0, 0.02));
        assert!(!rebounded_off_low(&bundle, 0.01));
        update_trailing_prices(&mut bundle, 97.5, 98.5, 97.2, 98.4);
        assert!(rebounded_off_low(&bundle, 0.01));
    }

    #[test]
    fn test_rally_and_fade_predicates() {
        let mut bundle = TrailingPriceBundle::default();
        update_trailing_prices(&mut bundle, 100.0, 103.0, 100.0, 102.8);
        assert!(rallied_above(&bundle, 100.0, 0.02));
        assert!(!faded_off_high(&bundle, 0.01));
        update_trailing_prices(&mut bundle, 102.8, 102.9, 101.5, 101.6);
        assert!(faded_off_high(&bundle, 0.01));
    }

    #[test]
    fn test_extrema_monotone_without_new_extreme() {
        let mut bundle = TrailingPriceBundle::default();
        update_trailing_prices(&mut bundle, 100.0, 105.0, 95.0, 104.0);
        let before = bundle;
        // inside candle: no extremum moves, retrace trackers may tighten
        update_trailing_prices(&mut bundle, 104.0, 104.5, 103.0, 104.2);
        assert_eq!(bundle.min_since_open, before.min_since_open);
        assert_eq!(bundle.max_since_open, before.max_since_open);
        assert!(bundle.min_since_max <= before.min_since_max);
    }
}
