use std::cmp::Ordering;
use std::collections::HashMap;

use crate::constants::{LONG, MINUTES_PER_DAY};
use crate::types::{Analysis, Equities, Fill};

/// Daily aggregation of the minute equity series: the closing equity of
/// each day and the worst equity seen within it.
struct DailySeries {
    closes: Vec<f64>,
    floors: Vec<f64>,
}

fn split_into_days(equities: &[f64]) -> DailySeries {
    let mut closes = Vec::new();
    let mut floors = Vec::new();
    for day in equities.chunks(MINUTES_PER_DAY) {
        closes.push(*day.last().unwrap());
        floors.push(day.iter().copied().fold(f64::INFINITY, f64::min));
    }
    DailySeries { closes, floors }
}

fn pct_changes(series: &[f64]) -> Vec<f64> {
    series
        .windows(2)
        .map(|pair| (pair[1] - pair[0]) / pair[0])
        .collect()
}

fn sort_f64(values: &mut [f64]) {
    values.sort_by(|a, b| match a.partial_cmp(b) {
        Some(order) => order,
        // NaNs sink to the end
        None => {
            if a.is_nan() == b.is_nan() {
                Ordering::Equal
            } else if a.is_nan() {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
    });
}

fn mean_or_zero(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Mean magnitude of the worst `frac` share of an ascending-sorted series.
/// With `at_least_one` the tail never collapses below one element;
/// otherwise an empty tail falls back to the single worst value.
fn worst_tail_mean(sorted: &[f64], frac: f64, at_least_one: bool) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let mut tail = (sorted.len() as f64 * frac) as usize;
    if at_least_one {
        tail = tail.max(1).min(sorted.len());
    } else if tail == 0 {
        return sorted[0].abs();
    }
    sorted[..tail].iter().map(|v| v.abs()).sum::<f64>() / tail as f64
}

fn analyze_backtest_basic(fills: &[Fill], equities: &[f64]) -> Analysis {
    if fills.len() <= 1 {
        return Analysis::default();
    }
    let daily = split_into_days(equities);
    let close_returns = pct_changes(&daily.closes);
    let floor_returns = pct_changes(&daily.floors);

    let (gain, adg) = smoothed_terminal_geometric_gain_and_adg(&daily.closes);
    let mdg = {
        let mut sorted = close_returns.clone();
        sort_f64(&mut sorted);
        median(&sorted)
    };

    // dispersion of the intraday-floor returns around the growth rate
    let spread = floor_returns
        .iter()
        .map(|r| (r - adg) * (r - adg))
        .sum::<f64>()
        / floor_returns.len().max(1) as f64;
    let volatility = spread.sqrt();
    let sharpe_ratio = if volatility != 0.0 { adg / volatility } else { 0.0 };

    let downside: Vec<f64> = floor_returns.iter().copied().filter(|r| *r < 0.0).collect();
    let downside_deviation = if downside.is_empty() {
        0.0
    } else {
        (downside.iter().map(|r| r * r).sum::<f64>() / downside.len() as f64).sqrt()
    };
    let sortino_ratio = if downside_deviation != 0.0 {
        adg / downside_deviation
    } else {
        0.0
    };

    let upside_sum: f64 = close_returns.iter().filter(|r| **r >= 0.0).sum();
    let downside_sum: f64 = close_returns.iter().filter(|r| **r < 0.0).map(|r| -r).sum();
    let omega_ratio = if downside_sum != 0.0 {
        upside_sum / downside_sum
    } else {
        f64::INFINITY
    };

    let expected_shortfall_1pct = {
        let mut sorted = floor_returns.clone();
        sort_f64(&mut sorted);
        worst_tail_mean(&sorted, 0.01, false)
    };

    let drawdowns = calc_drawdowns(&daily.floors);
    let drawdown_worst_mean_1pct = {
        let mut sorted = drawdowns.clone();
        sort_f64(&mut sorted);
        worst_tail_mean(&sorted, 0.01, true)
    };
    let drawdown_worst = drawdowns.iter().map(|d| d.abs()).fold(f64::NEG_INFINITY, f64::max);

    let sterling_ratio = if drawdown_worst_mean_1pct != 0.0 {
        adg / drawdown_worst_mean_1pct
    } else {
        0.0
    };
    let calmar_ratio = if drawdown_worst != 0.0 {
        adg / drawdown_worst
    } else {
        0.0
    };

    // balance is piecewise constant between fills: walk the fill stream
    // alongside the minutes and collect the equity/balance gaps
    let mut positive_gaps = Vec::new();
    let mut negative_gaps = Vec::new();
    {
        let mut marked_balance = fills[0].balance_usd_total;
        let mut pending_fills = fills.iter().peekable();
        for (minute, &equity) in equities.iter().enumerate() {
            while pending_fills.peek().map_or(false, |f| f.index <= minute) {
                marked_balance = pending_fills.next().unwrap().balance_usd_total;
            }
            let gap = (equity - marked_balance) / marked_balance;
            if gap > 0.0 {
                positive_gaps.push(gap);
            } else if gap < 0.0 {
                negative_gaps.push(-gap);
            }
        }
    }
    let equity_balance_diff_pos_max = positive_gaps.iter().copied().fold(0.0, f64::max);
    let equity_balance_diff_pos_mean = mean_or_zero(&positive_gaps);
    let equity_balance_diff_neg_max = negative_gaps.iter().copied().fold(0.0, f64::max);
    let equity_balance_diff_neg_mean = mean_or_zero(&negative_gaps);

    let mut total_profit = 0.0;
    let mut total_loss = 0.0;
    for fill in fills {
        if fill.pnl > 0.0 {
            total_profit += fill.pnl;
        } else {
            total_loss -= fill.pnl;
        }
    }
    let loss_profit_ratio = if total_profit == 0.0 {
        f64::INFINITY
    } else {
        total_loss / total_profit
    };

    // position lifetimes and the longest stretch without any fill
    let mut open_since: HashMap<(String, usize), usize> = HashMap::new();
    let mut last_touch: HashMap<(String, usize), usize> = HashMap::new();
    let mut lifetimes: Vec<usize> = Vec::new();
    let mut idle_stretches: Vec<usize> = Vec::new();
    for fill in fills {
        let key = (fill.coin.clone(), fill.order_type.side().unwrap_or(LONG));
        let opened = *open_since.entry(key.clone()).or_insert(fill.index);
        let touched = *last_touch.entry(key.clone()).or_insert(fill.index);
        idle_stretches.push(fill.index - touched);
        last_touch.insert(key.clone(), fill.index);
        if fill.position_size == 0.0 {
            lifetimes.push(fill.index - opened);
            open_since.remove(&key);
            last_touch.remove(&key);
        }
    }
    let final_minute = fills.last().map_or(0, |f| f.index);
    for (key, &opened) in open_since.iter() {
        lifetimes.push(final_minute - opened);
        if let Some(&touched) = last_touch.get(key) {
            idle_stretches.push(final_minute - touched);
        }
    }

    let n_days = equities.len() as f64 / MINUTES_PER_DAY as f64;
    let positions_held_per_day = if n_days > 0.0 {
        lifetimes.len() as f64 / n_days
    } else {
        0.0
    };
    let lifetimes_hours: Vec<f64> = lifetimes.iter().map(|&m| m as f64 / 60.0).collect();
    let position_held_hours_mean = mean_or_zero(&lifetimes_hours);
    let position_held_hours_max = lifetimes_hours.iter().copied().fold(0.0, f64::max);
    let position_held_hours_median = {
        let mut sorted = lifetimes_hours.clone();
        sort_f64(&mut sorted);
        median(&sorted)
    };
    let position_unchanged_hours_max = idle_stretches
        .iter()
        .map(|&m| m as f64 / 60.0)
        .fold(0.0, f64::max);

    let mut analysis = Analysis::default();
    analysis.adg = adg;
    analysis.mdg = mdg;
    analysis.gain = gain;
    analysis.sharpe_ratio = sharpe_ratio;
    analysis.sortino_ratio = sortino_ratio;
    analysis.omega_ratio = omega_ratio;
    analysis.expected_shortfall_1pct = expected_shortfall_1pct;
    analysis.calmar_ratio = calmar_ratio;
    analysis.sterling_ratio = sterling_ratio;
    analysis.drawdown_worst = drawdown_worst;
    analysis.drawdown_worst_mean_1pct = drawdown_worst_mean_1pct;
    analysis.equity_balance_diff_neg_max = equity_balance_diff_neg_max;
    analysis.equity_balance_diff_neg_mean = equity_balance_diff_neg_mean;
    analysis.equity_balance_diff_pos_max = equity_balance_diff_pos_max;
    analysis.equity_balance_diff_pos_mean = equity_balance_diff_pos_mean;
    analysis.loss_profit_ratio = loss_profit_ratio;
    analysis.positions_held_per_day = positions_held_per_day;
    analysis.position_held_hours_mean = position_held_hours_mean;
    analysis.position_held_hours_max = position_held_hours_max;
    analysis.position_held_hours_median = position_held_hours_median;
    analysis.position_unchanged_hours_max = position_unchanged_hours_max;
    analysis.equity_choppiness = calc_equity_choppiness(&daily.closes);
    analysis.equity_jerkiness = calc_equity_jerkiness(&daily.closes);
    analysis.exponential_fit_error = calc_exponential_fit_error(&daily.closes);
    analysis.volume_pct_per_day_avg = calc_avg_volume_pct_per_day(fills);
    analysis
}

/// Full analysis: base metrics over the whole run plus `_w` variants, the
/// mean over ten overlapping tail subsets
/// (`[0..N], [N/2..N], [2N/3..N], ..., [9N/10..N]`).
pub fn analyze_backtest(fills: &[Fill], equities: &[f64]) -> Analysis {
    let mut analysis = analyze_backtest_basic(fills, equities);
    if fills.len() <= 1 {
        return analysis;
    }

    let n = equities.len();
    let mut subset_analyses = Vec::with_capacity(10);
    subset_analyses.push(analysis.clone());
    for i in 1..10 {
        let keep_frac = 1.0 / (1.0 + i as f64);
        let start_idx = (n as f64 * (1.0 - keep_frac)).round() as usize;
        let tail_equities = &equities[start_idx..];
        if tail_equities.is_empty() {
            break;
        }
        let tail_fills: Vec<Fill> = fills
            .iter()
            .filter(|fill| fill.index >= start_idx)
            .cloned()
            .collect();
        if tail_fills.is_empty() {
            break;
        }
        subset_analyses.push(analyze_backtest_basic(&tail_fills, tail_equities));
    }

    let mean_of = |pick: fn(&Analysis) -> f64| -> f64 {
        subset_analyses.iter().map(pick).sum::<f64>() / 10.0
    };
    analysis.adg_w = mean_of(|a| a.adg);
    analysis.mdg_w = mean_of(|a| a.mdg);
    analysis.sharpe_ratio_w = mean_of(|a| a.sharpe_ratio);
    analysis.sortino_ratio_w = mean_of(|a| a.sortino_ratio);
    analysis.omega_ratio_w = mean_of(|a| a.omega_ratio);
    analysis.calmar_ratio_w = mean_of(|a| a.calmar_ratio);
    analysis.sterling_ratio_w = mean_of(|a| a.sterling_ratio);
    analysis.loss_profit_ratio_w = mean_of(|a| a.loss_profit_ratio);
    analysis.equity_choppiness_w = mean_of(|a| a.equity_choppiness);
    analysis.equity_jerkiness_w = mean_of(|a| a.equity_jerkiness);
    analysis.exponential_fit_error_w = mean_of(|a| a.exponential_fit_error);
    analysis.volume_pct_per_day_avg_w = mean_of(|a| a.volume_pct_per_day_avg);
    analysis
}

/// Returns (analysis in USD terms, analysis in BTC terms). The pair is
/// identical when BTC collateral mode is off.
pub fn analyze_backtest_pair(
    fills: &[Fill],
    equities: &Equities,
    use_btc_collateral: bool,
) -> (Analysis, Analysis) {
    let analysis_usd = analyze_backtest(fills, &equities.usd);
    if !use_btc_collateral {
        return (analysis_usd.clone(), analysis_usd);
    }
    let mut btc_fills = fills.to_vec();
    for fill in btc_fills.iter_mut() {
        fill.balance_usd_total /= fill.btc_price;
        fill.pnl /= fill.btc_price;
    }
    let analysis_btc = analyze_backtest(&btc_fills, &equities.btc);
    (analysis_usd, analysis_btc)
}

/// Peak-relative drawdown of the compounded return path, one entry per
/// input point.
fn calc_drawdowns(equity_series: &[f64]) -> Vec<f64> {
    let mut drawdowns = Vec::with_capacity(equity_series.len());
    let mut compounded: f64 = 1.0;
    let mut peak: f64 = 1.0;
    drawdowns.push(0.0);
    for pair in equity_series.windows(2) {
        compounded *= 1.0 + (pair[1] - pair[0]) / pair[0];
        peak = peak.max(compounded);
        drawdowns.push((compounded - peak) / peak);
    }
    drawdowns
}

/// Normalized total variation: sum of absolute first differences divided
/// by the net equity gain.
pub fn calc_equity_choppiness(equity: &[f64]) -> f64 {
    if equity.len() < 2 {
        return 0.0;
    }
    let travel: f64 = equity.windows(2).map(|pair| (pair[1] - pair[0]).abs()).sum();
    let net_gain = equity.last().unwrap() - equity[0];
    if net_gain.abs() < f64::EPSILON {
        return f64::INFINITY;
    }
    travel / net_gain.abs()
}

/// Normalized mean absolute second difference of the equity curve.
pub fn calc_equity_jerkiness(equity: &[f64]) -> f64 {
    if equity.len() < 3 {
        return 0.0;
    }
    let total: f64 = equity
        .windows(3)
        .map(|w| {
            let bend = (w[2] - 2.0 * w[1] + w[0]).abs();
            let local_level = (w[0] + w[1] + w[2]) / 3.0;
            if local_level.abs() < f64::EPSILON {
                0.0
            } else {
                bend / local_level.abs()
            }
        })
        .sum();
    total / (equity.len() - 2) as f64
}

/// Mean squared error of a log-linear fit to the equity curve.
pub fn calc_exponential_fit_error(equity: &[f64]) -> f64 {
    if equity.len() < 2 || equity.iter().any(|&x| x <= 0.0) {
        return f64::INFINITY;
    }
    let n = equity.len() as f64;
    let log_equity: Vec<f64> = equity.iter().map(|&y| y.ln()).collect();
    let mut sx = 0.0;
    let mut sy = 0.0;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (i, &y) in log_equity.iter().enumerate() {
        let x = i as f64;
        sx += x;
        sy += y;
        sxx += x * x;
        sxy += x * y;
    }
    let denom = n * sxx - sx * sx;
    if denom == 0.0 {
        return f64::INFINITY;
    }
    let slope = (n * sxy - sx * sy) / denom;
    let intercept = (sy - slope * sx) / n;
    let residual_sq: f64 = log_equity
        .iter()
        .enumerate()
        .map(|(i, &y)| {
            let fitted = slope * i as f64 + intercept;
            (fitted - y) * (fitted - y)
        })
        .sum();
    residual_sq / n
}

/// EMA-smoothed (span 3) terminal gain and the geometric mean daily
/// growth rate.
pub fn smoothed_terminal_geometric_gain_and_adg(daily_closes: &[f64]) -> (f64, f64) {
    if daily_closes.len() < 2 {
        return (0.0, 0.0);
    }
    if daily_closes[0] <= 0.0 {
        return (f64::INFINITY, f64::INFINITY);
    }
    let alpha = 2.0 / (3.0 + 1.0);
    let mut smoothed = daily_closes[0];
    for &value in &daily_closes[1..] {
        smoothed = alpha * value + (1.0 - alpha) * smoothed;
    }
    if smoothed <= 0.0 {
        return (-1.0, -1.0);
    }
    let gain = smoothed / daily_closes[0];
    (gain, gain.powf(1.0 / daily_closes.len() as f64) - 1.0)
}

/// Average traded notional per day as a fraction of balance.
pub fn calc_avg_volume_pct_per_day(fills: &[Fill]) -> f64 {
    if fills.is_empty() {
        return 0.0;
    }
    let mut turnover_by_day: HashMap<usize, f64> = HashMap::new();
    for fill in fills {
        let day = fill.index / MINUTES_PER_DAY;
        let turnover = fill.fill_qty.abs() * fill.fill_price / fill.balance_usd_total;
        *turnover_by_day.entry(day).or_insert(0.0) += turnover;
    }
    turnover_by_day.values().sum::<f64>() / turnover_by_day.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderType;

    fn fill(index: usize, pnl: f64, balance: f64, position_size: f64) -> Fill {
        Fill {
            index,
            coin: "SYM0".to_string(),
            pnl,
            fee_paid: 0.0,
            balance_usd_total: balance,
            balance_usd: balance,
            balance_btc: 0.0,
            btc_price: 1.0,
            fill_qty: 1.0,
            fill_price: 100.0,
            position_size,
            position_price: 100.0,
            order_type: if position_size == 0.0 {
                OrderType::CloseGridLong
            } else {
                OrderType::EntryGridNormalLong
            },
        }
    }

    fn steady_growth_equities(days: usize) -> Vec<f64> {
        (0..days * MINUTES_PER_DAY)
            .map(|i| 1000.0 * (1.0f64 + 0.001).powf(i as f64 / MINUTES_PER_DAY as f64))
            .collect()
    }

    #[test]
    fn test_adg_positive_for_growing_equity() {
        let equities = steady_growth_equities(30);
        let fills = vec![fill(1, 0.0, 1000.0, 1.0), fill(100, 1.0, 1001.0, 0.0)];
        let analysis = analyze_backtest(&fills, &equities);
        assert!(analysis.adg > 0.0);
        assert!(analysis.gain > 1.0);
        assert!(analysis.adg_w > 0.0);
    }

    #[test]
    fn test_daily_split_tracks_floors() {
        let mut equities = vec![1000.0; MINUTES_PER_DAY];
        equities[700] = 900.0;
        equities.extend(vec![1100.0; MINUTES_PER_DAY]);
        let daily = split_into_days(&equities);
        assert_eq!(daily.closes, vec![1000.0, 1100.0]);
        assert_eq!(daily.floors, vec![900.0, 1100.0]);
    }

    #[test]
    fn test_exponential_curve_has_negligible_fit_error() {
        let equities: Vec<f64> = (0..100).map(|i| 1000.0 * 1.01f64.powi(i)).collect();
        assert!(calc_exponential_fit_error(&equities) < 1e-12);
    }

    #[test]
    fn test_drawdown_worst_captures_trough() {
        let equities = vec![1000.0, 1100.0, 880.0, 1200.0];
        let drawdowns = calc_drawdowns(&equities);
        let worst = drawdowns.iter().fold(0.0f64, |a, &b| a.max(b.abs()));
        assert!((worst - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_loss_profit_ratio() {
        let equities = steady_growth_equities(2);
        let fills = vec![
            fill(1, 10.0, 1010.0, 1.0),
            fill(2, -5.0, 1005.0, 1.0),
            fill(3, 10.0, 1015.0, 0.0),
        ];
        let analysis = analyze_backtest(&fills, &equities);
        assert!((analysis.loss_profit_ratio - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_position_duration_tracking() {
        let equities = steady_growth_equities(2);
        // opened at minute 60, closed at minute 180: two hours held
        let fills = vec![fill(60, 0.0, 1000.0, 1.0), fill(180, 5.0, 1005.0, 0.0)];
        let analysis = analyze_backtest(&fills, &equities);
        assert!((analysis.position_held_hours_max - 2.0).abs() < 1e-9);
        assert!((analysis.position_held_hours_mean - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_choppiness_infinite_for_flat_curve() {
        let equities = vec![1000.0; 10];
        assert!(calc_equity_choppiness(&equities).is_infinite());
    }

    #[test]
    fn test_worst_tail_mean_floors_at_one_element() {
        let sorted = vec![-0.5, -0.2, -0.1, 0.3];
        // 1% of four elements truncates to zero; the floor keeps one
        assert!((worst_tail_mean(&sorted, 0.01, true) - 0.5).abs() < 1e-12);
        assert!((worst_tail_mean(&sorted, 0.01, false) - 0.5).abs() < 1e-12);
    }
}
