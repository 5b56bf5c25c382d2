use ndarray::{s, ArrayView3};

use crate::constants::{CLOSE, HIGH, LOW, N_FIELDS, OPEN, VOLUME};
use crate::error::{EngineError, EngineResult};

/// A placeholder candle marks a minute where the symbol was not trading
/// (back/front-filled gap or delisting): flat price and non-positive volume
/// (-1.0 in newer data, 0.0 in older fills).
pub fn is_gap_candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> bool {
    high == low && high == close && high == open && volume <= 0.0
}

/// Upfront validation of the whole candle matrix. Any malformed candle is
/// fatal and reported with its `(minute, symbol)` coordinates.
pub fn validate_candles(hlcvs: &ArrayView3<f64>) -> EngineResult<()> {
    let shape = hlcvs.shape();
    if shape[2] != N_FIELDS {
        return Err(EngineError::Config(format!(
            "candle matrix must have {} fields per candle, got {}",
            N_FIELDS, shape[2]
        )));
    }
    for k in 0..shape[0] {
        for idx in 0..shape[1] {
            let open = hlcvs[[k, idx, OPEN]];
            let high = hlcvs[[k, idx, HIGH]];
            let low = hlcvs[[k, idx, LOW]];
            let close = hlcvs[[k, idx, CLOSE]];
            let volume = hlcvs[[k, idx, VOLUME]];
            for v in [open, high, low, close, volume] {
                if !v.is_finite() {
                    return Err(EngineError::Candle {
                        index: k,
                        symbol: idx,
                        reason: "non-finite field".to_string(),
                    });
                }
            }
            if is_gap_candle(open, high, low, close, volume) {
                continue;
            }
            if low > high {
                return Err(EngineError::Candle {
                    index: k,
                    symbol: idx,
                    reason: format!("low {} above high {}", low, high),
                });
            }
            if volume < 0.0 {
                return Err(EngineError::Candle {
                    index: k,
                    symbol: idx,
                    reason: format!("negative volume {}", volume),
                });
            }
        }
    }
    Ok(())
}

/// Binary-search the first and last valid candle index for every symbol.
pub fn find_valid_bounds(hlcvs: &ArrayView3<f64>) -> (Vec<usize>, Vec<usize>) {
    let n_ts = hlcvs.shape()[0];
    let n_coins = hlcvs.shape()[1];
    let mut firsts = vec![0; n_coins];
    let mut lasts = vec![0; n_coins];

    for idx in 0..n_coins {
        let is_invalid = |k: usize| {
            let row = hlcvs.slice(s![k, idx, ..]);
            is_gap_candle(row[OPEN], row[HIGH], row[LOW], row[CLOSE], row[VOLUME])
        };

        let (mut lo, mut hi) = (0usize, n_ts - 1);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if is_invalid(mid) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        // symbol never became valid
        if is_invalid(lo) {
            firsts[idx] = n_ts;
            lasts[idx] = n_ts;
            continue;
        }
        firsts[idx] = lo;

        let (mut lo2, mut hi2) = (lo, n_ts - 1);
        while lo2 < hi2 {
            let mid = (lo2 + hi2 + 1) / 2;
            if is_invalid(mid) {
                hi2 = mid - 1;
            } else {
                lo2 = mid;
            }
        }
        lasts[idx] = lo2;
    }
    (firsts, lasts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> [f64; 5] {
        [open, high, low, close, volume]
    }

    fn grid_from(rows: &[[f64; 5]]) -> Array3<f64> {
        let mut arr = Array3::zeros((rows.len(), 1, 5));
        for (k, row) in rows.iter().enumerate() {
            for (f, v) in row.iter().enumerate() {
                arr[[k, 0, f]] = *v;
            }
        }
        arr
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let arr = grid_from(&[candle(100.0, 99.0, 101.0, 100.0, 5.0)]);
        let err = validate_candles(&arr.view()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Candle {
                index: 0,
                symbol: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_validate_allows_gap_placeholders() {
        let arr = grid_from(&[
            candle(100.0, 100.0, 100.0, 100.0, -1.0),
            candle(100.0, 101.0, 99.0, 100.5, 5.0),
        ]);
        assert!(validate_candles(&arr.view()).is_ok());
    }

    #[test]
    fn test_validate_rejects_negative_volume_on_live_candle() {
        let arr = grid_from(&[candle(100.0, 101.0, 99.0, 100.0, -3.0)]);
        assert!(validate_candles(&arr.view()).is_err());
    }

    #[test]
    fn test_valid_bounds_skip_leading_and_trailing_gaps() {
        let gap = candle(50.0, 50.0, 50.0, 50.0, 0.0);
        let live = candle(50.0, 51.0, 49.0, 50.0, 10.0);
        let arr = grid_from(&[gap, gap, live, live, live, gap, gap]);
        let (firsts, lasts) = find_valid_bounds(&arr.view());
        assert_eq!(firsts, vec![2]);
        assert_eq!(lasts, vec![4]);
    }

    #[test]
    fn test_valid_bounds_never_valid() {
        let gap = candle(50.0, 50.0, 50.0, 50.0, 0.0);
        let arr = grid_from(&[gap, gap, gap]);
        let (firsts, lasts) = find_valid_bounds(&arr.view());
        assert_eq!(firsts, vec![3]);
        assert_eq!(lasts, vec![3]);
    }
}
