use crate::constants::{LONG, SHORT};
use crate::types::{ExchangeParams, Order, OrderCheck, SkipReason};

/// Strips the float noise that step arithmetic leaves behind.
pub(crate) fn clamp_decimals(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

/// Quantizes `n` onto the `step` grid with the given direction.
fn snap(n: f64, step: f64, quantizer: fn(f64) -> f64) -> f64 {
    clamp_decimals(quantizer(n / step) * step, 10)
}

/// Nearest multiple of `step`.
pub fn round_(n: f64, step: f64) -> f64 {
    snap(n, step, f64::round)
}

/// Next multiple of `step` at or above `n`.
pub fn round_up(n: f64, step: f64) -> f64 {
    snap(n, step, f64::ceil)
}

/// Next multiple of `step` at or below `n`.
pub fn round_dn(n: f64, step: f64) -> f64 {
    snap(n, step, f64::floor)
}

/// Relative distance between two prices, used for fill-priority ordering.
pub fn calc_diff(x: f64, y: f64) -> f64 {
    if y == 0.0 {
        return if x == 0.0 { 0.0 } else { f64::INFINITY };
    }
    ((x - y) / y).abs()
}

pub fn cost_to_qty(cost: f64, price: f64, c_mult: f64) -> f64 {
    if !(price > 0.0) {
        return 0.0;
    }
    cost.abs() / price / c_mult
}

pub fn qty_to_cost(qty: f64, price: f64, c_mult: f64) -> f64 {
    c_mult * price * qty.abs()
}

/// Position notional divided by unleveraged balance.
pub fn calc_wallet_exposure(
    c_mult: f64,
    balance: f64,
    position_size: f64,
    position_price: f64,
) -> f64 {
    if position_size == 0.0 || balance <= 0.0 {
        return 0.0;
    }
    qty_to_cost(position_size, position_price, c_mult) / balance
}

/// Exposure the position would have after merging `qty @ price` into it.
pub fn calc_wallet_exposure_if_filled(
    balance: f64,
    psize: f64,
    pprice: f64,
    qty: f64,
    price: f64,
    exchange_params: &ExchangeParams,
) -> f64 {
    let step = exchange_params.qty_step;
    let (merged_size, merged_price) = calc_new_psize_pprice(
        round_(psize.abs(), step),
        pprice,
        round_(qty.abs(), step),
        price,
        step,
    );
    calc_wallet_exposure(exchange_params.c_mult, balance, merged_size, merged_price)
}

/// Size-weighted position merge. The averaged price is kept full precision;
/// only the size is quantized.
pub fn calc_new_psize_pprice(
    psize: f64,
    pprice: f64,
    qty: f64,
    price: f64,
    qty_step: f64,
) -> (f64, f64) {
    if qty == 0.0 {
        return (psize, pprice);
    }
    if psize == 0.0 {
        return (qty, price);
    }
    let merged_size = round_(psize + qty, qty_step);
    if merged_size == 0.0 {
        return (0.0, 0.0);
    }
    let merged_price = (zero_if_nan(pprice) * psize + price * qty) / merged_size;
    (merged_size, merged_price)
}

fn zero_if_nan(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value
    }
}

/// Lagrange interpolation through `(xs, ys)` evaluated at `x`. Used with
/// two points to solve for the qty that lands exposure exactly on a limit.
pub fn interpolate(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    assert_eq!(xs.len(), ys.len(), "interpolate needs matching coordinates");
    let n = xs.len();
    (0..n)
        .map(|i| {
            let mut weight = ys[i];
            for j in 0..n {
                if j != i {
                    weight *= (x - xs[j]) / (xs[i] - xs[j]);
                }
            }
            weight
        })
        .sum()
}

pub fn calc_pnl_long(entry_price: f64, exit_price: f64, qty: f64, c_mult: f64) -> f64 {
    (exit_price - entry_price) * qty.abs() * c_mult
}

pub fn calc_pnl_short(entry_price: f64, exit_price: f64, qty: f64, c_mult: f64) -> f64 {
    (entry_price - exit_price) * qty.abs() * c_mult
}

/// +1.0 for the long side, -1.0 for the short side. Entry quantities carry
/// this sign; closes carry the opposite.
pub fn side_sign(pside: usize) -> f64 {
    match pside {
        LONG => 1.0,
        SHORT => -1.0,
        _ => panic!("unknown pside {}", pside),
    }
}

/// Side-aware relative distance of `price` from the position price.
/// Positive values mean the position is under water.
pub fn calc_pprice_diff(pside: usize, pprice: f64, price: f64) -> f64 {
    if !(pprice > 0.0) {
        return 0.0;
    }
    match pside {
        LONG => 1.0 - price / pprice,
        SHORT => price / pprice - 1.0,
        _ => panic!("unknown pside {}", pside),
    }
}

/// Loss budget for unstuck closes: the configured fraction of peak balance
/// minus whatever drawdown has already been realized.
pub fn calc_unstuck_allowance(
    balance: f64,
    loss_allowance_pct: f64,
    pnl_cumsum_max: f64,
    pnl_cumsum_last: f64,
) -> f64 {
    let peak_balance = balance + (pnl_cumsum_max - pnl_cumsum_last);
    let drawdown_pct = balance / peak_balance - 1.0;
    (peak_balance * (loss_allowance_pct + drawdown_pct)).max(0.0)
}

/// Initial-entry bid anchored below the lower EMA band.
pub fn calc_ema_price_bid(
    price_step: f64,
    order_book_bid: f64,
    ema_band_lower: f64,
    ema_dist: f64,
) -> f64 {
    round_dn(ema_band_lower * (1.0 - ema_dist), price_step).min(order_book_bid)
}

/// Initial-entry ask anchored above the upper EMA band.
pub fn calc_ema_price_ask(
    price_step: f64,
    order_book_ask: f64,
    ema_band_upper: f64,
    ema_dist: f64,
) -> f64 {
    round_up(ema_band_upper * (1.0 + ema_dist), price_step).max(order_book_ask)
}

/// Validates a generated order against exchange minimums. Orders that an
/// exchange would reject are skipped, never errored.
pub fn screen_order(order: &Order, exchange_params: &ExchangeParams) -> OrderCheck {
    let qty = order.qty.abs();
    if qty == 0.0 {
        return OrderCheck::Skip(SkipReason::ZeroQty);
    }
    if order.price <= 0.0 || !order.price.is_finite() {
        return OrderCheck::Skip(SkipReason::NonPositivePrice);
    }
    if qty < exchange_params.min_qty {
        return OrderCheck::Skip(SkipReason::BelowMinQty);
    }
    if qty_to_cost(qty, order.price, exchange_params.c_mult) < exchange_params.min_cost {
        return OrderCheck::Skip(SkipReason::BelowMinCost);
    }
    OrderCheck::Emit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderType;

    #[test]
    fn test_rounding_steps() {
        assert_eq!(round_(100.004, 0.01), 100.0);
        assert_eq!(round_(100.006, 0.01), 100.01);
        assert_eq!(round_up(100.001, 0.01), 100.01);
        assert_eq!(round_dn(100.009, 0.01), 100.0);
        // products of step division stay clean at 10 decimals
        assert_eq!(round_dn(0.3, 0.1), 0.3);
    }

    #[test]
    fn test_new_psize_pprice_weighted_average() {
        let (psize, pprice) = calc_new_psize_pprice(1.0, 100.0, 1.0, 110.0, 0.001);
        assert_eq!(psize, 2.0);
        assert!((pprice - 105.0).abs() < 1e-9);
        // opening from flat adopts the fill outright
        let (psize, pprice) = calc_new_psize_pprice(0.0, 0.0, 0.5, 99.0, 0.001);
        assert_eq!(psize, 0.5);
        assert_eq!(pprice, 99.0);
    }

    #[test]
    fn test_wallet_exposure() {
        assert_eq!(calc_wallet_exposure(1.0, 1000.0, 5.0, 100.0), 0.5);
        assert_eq!(calc_wallet_exposure(1.0, 0.0, 5.0, 100.0), 0.0);
        assert_eq!(calc_wallet_exposure(1.0, 1000.0, 0.0, 100.0), 0.0);
    }

    #[test]
    fn test_interpolate_linear() {
        // two-point form is linear interpolation
        let y = interpolate(1.5, &[1.0, 2.0], &[10.0, 20.0]);
        assert!((y - 15.0).abs() < 1e-12);
    }

    #[test]
    fn test_unstuck_allowance_zero_when_drawdown_exceeds_budget() {
        // deep drawdown below peak eats the whole loss budget
        let allowance = calc_unstuck_allowance(1000.0, 0.01 * 2.0, 200.0, 0.0);
        assert_eq!(allowance, 0.0);
    }

    #[test]
    fn test_unstuck_allowance_positive_at_peak() {
        let allowance = calc_unstuck_allowance(1200.0, 0.01, 100.0, 100.0);
        assert!((allowance - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_screen_order_min_cost() {
        let exchange_params = ExchangeParams {
            qty_step: 0.001,
            price_step: 0.01,
            min_qty: 0.001,
            min_cost: 10.0,
            c_mult: 1.0,
        };
        let order = Order {
            qty: 0.05,
            price: 100.0,
            order_type: OrderType::EntryGridNormalLong,
        };
        assert_eq!(
            screen_order(&order, &exchange_params),
            OrderCheck::Skip(SkipReason::BelowMinCost)
        );
        let order = Order {
            qty: 0.2,
            price: 100.0,
            order_type: OrderType::EntryGridNormalLong,
        };
        assert_eq!(screen_order(&order, &exchange_params), OrderCheck::Emit);
    }

    #[test]
    fn test_pprice_diff_sides() {
        assert!((calc_pprice_diff(LONG, 100.0, 90.0) - 0.1).abs() < 1e-12);
        assert!((calc_pprice_diff(SHORT, 100.0, 110.0) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_side_sign() {
        assert_eq!(side_sign(LONG), 1.0);
        assert_eq!(side_sign(SHORT), -1.0);
    }
}
