use crate::constants::{LONG, WE_OVERSHOOT_TOLERANCE};
use crate::entries::calc_min_entry_qty;
use crate::trailing::{dipped_below, faded_off_high, rallied_above, rebounded_off_low};
use crate::types::{
    BotParams, ExchangeParams, Mechanism, Order, OrderBook, OrderType, Position, StateParams,
};
use crate::utils::{
    calc_wallet_exposure, cost_to_qty, interpolate, round_, round_dn, round_up, side_sign,
};

/// Shrink factor for the probe position used to linearize exposure against
/// size when auto-reducing.
const REDUCE_PROBE_SHRINK: f64 = 0.9;

/// Upper bound on levels materialized per ladder.
const LADDER_CAP: usize = 500;

fn grid_close_kind(pside: usize) -> OrderType {
    match pside {
        LONG => OrderType::CloseGridLong,
        _ => OrderType::CloseGridShort,
    }
}

fn trailing_close_kind(pside: usize) -> OrderType {
    match pside {
        LONG => OrderType::CloseTrailingLong,
        _ => OrderType::CloseTrailingShort,
    }
}

fn auto_reduce_kind(pside: usize) -> OrderType {
    match pside {
        LONG => OrderType::CloseAutoReduceLong,
        _ => OrderType::CloseAutoReduceShort,
    }
}

fn is_trailing_close(order_type: OrderType) -> bool {
    matches!(
        order_type,
        OrderType::CloseTrailingLong | OrderType::CloseTrailingShort
    )
}

/// The book level closes rest against: ask for longs, bid for shorts.
fn close_book_price(pside: usize, order_book: &OrderBook) -> f64 {
    match pside {
        LONG => order_book.ask,
        _ => order_book.bid,
    }
}

/// Take-profit level `markup` away from the position price, rounded away
/// from the mark.
fn markup_price(
    pside: usize,
    position_price: f64,
    markup: f64,
    exchange_params: &ExchangeParams,
) -> f64 {
    match pside {
        LONG => round_up(position_price * (1.0 + markup), exchange_params.price_step),
        _ => round_dn(position_price * (1.0 - markup), exchange_params.price_step),
    }
}

/// A close never quotes inside the book: longs sell at or above the ask,
/// shorts buy back at or below the bid.
fn clamp_beyond_book(pside: usize, price: f64, order_book: &OrderBook) -> f64 {
    match pside {
        LONG => price.max(order_book.ask),
        _ => price.min(order_book.bid),
    }
}

/// Size of one take-profit slice: the configured share of the full position
/// plus any overflow above it, never stranding a remainder the exchange
/// would refuse.
pub fn calc_tp_qty(
    exchange_params: &ExchangeParams,
    bot_params: &BotParams,
    position: &Position,
    slice_pct: f64,
    balance: f64,
    close_price: f64,
) -> f64 {
    let target_psize = cost_to_qty(
        balance * bot_params.wallet_exposure_limit,
        position.price,
        exchange_params.c_mult,
    );
    let held = position.size.abs();
    let overflow = (held - target_psize).max(0.0);
    let qty_floor = calc_min_entry_qty(close_price, exchange_params);
    let slice = round_up(target_psize * slice_pct + overflow, exchange_params.qty_step)
        .max(qty_floor);
    let qty = slice.min(round_(held, exchange_params.qty_step));
    let remainder = held - qty;
    if qty > 0.0 && remainder > 0.0 && remainder < qty_floor {
        held
    } else {
        qty
    }
}

fn full_exit(
    pside: usize,
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    position: &Position,
    level_price: f64,
) -> Order {
    Order {
        qty: -side_sign(pside) * round_(position.size.abs(), exchange_params.qty_step),
        price: clamp_beyond_book(pside, level_price, &state_params.order_book),
        order_type: grid_close_kind(pside),
    }
}

/// Active grid take-profit for one side. Levels run linearly from
/// `markup_start` to `markup_end`; how full the position is picks the level,
/// and a slice of the full position size (plus overflow) exits there.
pub fn calc_grid_close(
    pside: usize,
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    bot_params: &BotParams,
    position: &Position,
) -> Order {
    let held = position.size.abs();
    if held == 0.0 {
        return Order::default();
    }
    if !(0.0..1.0).contains(&bot_params.close_grid_qty_pct) {
        // a slice of 100% or more collapses the ladder to one exit
        let level = markup_price(
            pside,
            position.price,
            bot_params.close_grid_markup_start,
            exchange_params,
        );
        return full_exit(pside, exchange_params, state_params, position, level);
    }
    let first_level = markup_price(
        pside,
        position.price,
        bot_params.close_grid_markup_start,
        exchange_params,
    );
    let last_level = markup_price(
        pside,
        position.price,
        bot_params.close_grid_markup_end,
        exchange_params,
    );
    if first_level == last_level {
        return full_exit(pside, exchange_params, state_params, position, first_level);
    }
    // enough slices that every level lands on a distinct price step
    let n_levels = ((last_level - first_level).abs() / exchange_params.price_step).ceil();
    let slice_pct = bot_params.close_grid_qty_pct.max(n_levels.recip());
    let exposure = calc_wallet_exposure(
        exchange_params.c_mult,
        state_params.balance,
        held,
        position.price,
    );
    let filled_frac = exposure / bot_params.wallet_exposure_limit;
    let level_price = if filled_frac > 1.0 {
        // overfull positions exit at whichever level pays out first
        match pside {
            LONG => first_level.min(last_level),
            _ => first_level.max(last_level),
        }
    } else {
        let along = first_level + (last_level - first_level) * filled_frac.min(1.0);
        match pside {
            LONG => round_up(along, exchange_params.price_step),
            _ => round_dn(along, exchange_params.price_step),
        }
    };
    let close_price = clamp_beyond_book(pside, level_price, &state_params.order_book);
    let qty = calc_tp_qty(
        exchange_params,
        bot_params,
        position,
        slice_pct,
        state_params.balance,
        close_price,
    );
    Order {
        qty: -side_sign(pside) * qty,
        price: close_price,
        order_type: grid_close_kind(pside),
    }
}

/// Trailing take-profit for one side. A favorable run past the threshold
/// arms it; giving back the retracement fires it. Either knob at zero
/// degenerates per its meaning: no threshold waits on the retracement
/// alone, no retracement quotes a resting limit at the threshold, and both
/// off locks in at the book immediately.
pub fn calc_trailing_close(
    pside: usize,
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    bot_params: &BotParams,
    position: &Position,
) -> Order {
    let held = position.size.abs();
    if held == 0.0 {
        return Order::default();
    }
    let threshold = bot_params.close_trailing_threshold_pct;
    let retracement = bot_params.close_trailing_retracement_pct;
    let extrema = &position.trailing;
    // the favored move for a close is the profitable one
    let ran_favorably = match pside {
        LONG => rallied_above(extrema, position.price, threshold),
        _ => dipped_below(extrema, position.price, threshold),
    };
    let gave_back = match pside {
        LONG => faded_off_high(extrema, retracement),
        _ => rebounded_off_low(extrema, retracement),
    };
    let close_price = if threshold > 0.0 {
        if retracement > 0.0 {
            if ran_favorably && gave_back {
                let level = markup_price(
                    pside,
                    position.price,
                    threshold - retracement,
                    exchange_params,
                );
                Some(clamp_beyond_book(pside, level, &state_params.order_book))
            } else {
                None
            }
        } else {
            let level = markup_price(pside, position.price, threshold, exchange_params);
            Some(clamp_beyond_book(pside, level, &state_params.order_book))
        }
    } else if retracement > 0.0 {
        if gave_back {
            Some(close_book_price(pside, &state_params.order_book))
        } else {
            None
        }
    } else {
        Some(close_book_price(pside, &state_params.order_book))
    };
    let Some(close_price) = close_price else {
        return Order {
            qty: 0.0,
            price: 0.0,
            order_type: trailing_close_kind(pside),
        };
    };
    let qty = calc_tp_qty(
        exchange_params,
        bot_params,
        position,
        bot_params.close_trailing_qty_pct,
        state_params.balance,
        close_price,
    );
    Order {
        qty: -side_sign(pside) * qty,
        price: close_price,
        order_type: trailing_close_kind(pside),
    }
}

/// Market close of the excess above the tolerated exposure limit.
fn calc_auto_reduce(
    pside: usize,
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    bot_params: &BotParams,
    position: &Position,
    exposure: f64,
    held: f64,
) -> Option<Order> {
    // probe a slightly smaller position to linearize exposure against size,
    // then solve for the size sitting at the tolerated limit
    let probe_held = held * REDUCE_PROBE_SHRINK;
    let probe_exposure = calc_wallet_exposure(
        exchange_params.c_mult,
        state_params.balance,
        probe_held,
        position.price,
    );
    let tolerated = bot_params.wallet_exposure_limit * WE_OVERSHOOT_TOLERANCE;
    let target_held = interpolate(
        tolerated,
        &[exposure, probe_exposure],
        &[held, probe_held],
    );
    let excess = held - target_held;
    if excess <= 0.0 {
        return None;
    }
    let book_price = close_book_price(pside, &state_params.order_book);
    let qty = round_(excess, exchange_params.qty_step)
        .max(calc_min_entry_qty(book_price, exchange_params))
        .min(round_(held, exchange_params.qty_step));
    Some(Order {
        qty: -side_sign(pside) * qty,
        price: book_price,
        order_type: auto_reduce_kind(pside),
    })
}

/// Next close for one side. An exposure breach (under enforcement) emits an
/// auto-reduce before anything else; otherwise grid and trailing blend on
/// `close_trailing_grid_ratio`. The leading mechanism works the whole
/// position while the exposure sits inside its share; past that the
/// follower works the remainder, with the leader's slice held in reserve.
pub fn calc_next_close(
    pside: usize,
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    bot_params: &BotParams,
    position: &Position,
) -> Order {
    let held = position.size.abs();
    if held == 0.0 {
        return Order::default();
    }
    let exposure = calc_wallet_exposure(
        exchange_params.c_mult,
        state_params.balance,
        held,
        position.price,
    );
    let spent_frac = if bot_params.wallet_exposure_limit > 0.0 {
        exposure / bot_params.wallet_exposure_limit
    } else {
        f64::INFINITY
    };
    if bot_params.enforce_exposure_limit && spent_frac > WE_OVERSHOOT_TOLERANCE {
        if let Some(order) = calc_auto_reduce(
            pside,
            exchange_params,
            state_params,
            bot_params,
            position,
            exposure,
            held,
        ) {
            return order;
        }
    }
    let ratio = bot_params.close_trailing_grid_ratio;
    if ratio == 0.0 {
        return calc_grid_close(pside, exchange_params, state_params, bot_params, position);
    }
    if ratio.abs() >= 1.0 {
        return calc_trailing_close(pside, exchange_params, state_params, bot_params, position);
    }
    let (leader, leader_share) = if ratio > 0.0 {
        (Mechanism::Trailing, ratio)
    } else {
        (Mechanism::Grid, 1.0 + ratio)
    };
    if spent_frac < leader_share {
        return match leader {
            Mechanism::Grid => {
                calc_grid_close(pside, exchange_params, state_params, bot_params, position)
            }
            Mechanism::Trailing => {
                calc_trailing_close(pside, exchange_params, state_params, bot_params, position)
            }
        };
    }
    // the leader's share of the position stays reserved for it; the
    // follower works the remainder
    let qty_floor = calc_min_entry_qty(position.price, exchange_params);
    let mut reserved = cost_to_qty(
        state_params.balance * bot_params.wallet_exposure_limit * leader_share,
        position.price,
        exchange_params.c_mult,
    );
    if reserved < qty_floor {
        reserved = 0.0;
    }
    let workable = round_(held - reserved, exchange_params.qty_step)
        .max(qty_floor)
        .min(held);
    let trimmed = Position {
        size: side_sign(pside) * workable,
        price: position.price,
        ..position.clone()
    };
    match leader {
        Mechanism::Trailing => {
            calc_grid_close(pside, exchange_params, state_params, bot_params, &trimmed)
        }
        Mechanism::Grid => {
            calc_trailing_close(pside, exchange_params, state_params, bot_params, &trimmed)
        }
    }
}

/// Expands the resting close book for one side by simulating successive
/// partial exits. Same-price levels fold together; the result is sorted
/// closest-to-mark first.
pub fn calc_close_ladder(
    pside: usize,
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    bot_params: &BotParams,
    position: &Position,
) -> Vec<Order> {
    let mut ladder = Vec::<Order>::new();
    let mut sim_position = position.clone();
    while ladder.len() < LADDER_CAP {
        let level = calc_next_close(pside, exchange_params, state_params, bot_params, &sim_position);
        if level.qty == 0.0 {
            break;
        }
        if !ladder.is_empty() && is_trailing_close(level.order_type) {
            break;
        }
        sim_position.size = round_(sim_position.size + level.qty, exchange_params.qty_step);
        let folds_into_last = ladder
            .last()
            .map_or(false, |last| last.price == level.price);
        if folds_into_last {
            // same price step: fold into the previous level
            let last = ladder.last_mut().unwrap();
            last.qty = round_(last.qty + level.qty, exchange_params.qty_step);
            last.order_type = level.order_type;
        } else {
            ladder.push(level);
        }
    }
    // closest-to-mark first
    match pside {
        LONG => ladder.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap()),
        _ => ladder.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap()),
    }
    ladder
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SHORT;
    use crate::types::{EMABands, TrailingPriceBundle};

    fn exchange() -> ExchangeParams {
        ExchangeParams {
            qty_step: 0.001,
            price_step: 0.01,
            min_qty: 0.001,
            min_cost: 0.0,
            c_mult: 1.0,
        }
    }

    fn state(balance: f64, bid: f64, ask: f64) -> StateParams {
        StateParams {
            balance,
            order_book: OrderBook { bid, ask },
            ema_bands: EMABands::default(),
            grid_log_range: 0.0,
        }
    }

    fn params() -> BotParams {
        BotParams {
            close_grid_markup_start: 0.01,
            close_grid_markup_end: 0.02,
            close_grid_qty_pct: 1.0,
            wallet_exposure_limit: 1.0,
            total_wallet_exposure_limit: 1.0,
            n_positions: 1,
            ..BotParams::default()
        }
    }

    fn open_position(size: f64, price: f64) -> Position {
        Position {
            size,
            price,
            ..Position::default()
        }
    }

    #[test]
    fn test_full_close_single_order_at_markup_start() {
        // close_grid_qty_pct = 1.0 collapses the grid to one TP level
        let exchange_params = exchange();
        let state_params = state(1000.0, 100.0, 100.0);
        let position = open_position(5.0, 100.0);
        let ladder = calc_close_ladder(
            LONG,
            &exchange_params,
            &state_params,
            &params(),
            &position,
        );
        assert_eq!(ladder.len(), 1);
        assert!((ladder[0].price - 101.0).abs() < 1e-9);
        assert!((ladder[0].qty + 5.0).abs() < 1e-9);
        assert_eq!(ladder[0].order_type, OrderType::CloseGridLong);
    }

    #[test]
    fn test_partial_close_grid_spreads_levels() {
        let exchange_params = exchange();
        let state_params = state(1000.0, 100.0, 100.0);
        let mut bot_params = params();
        bot_params.close_grid_qty_pct = 0.25;
        let position = open_position(10.0, 100.0);
        let ladder = calc_close_ladder(
            LONG,
            &exchange_params,
            &state_params,
            &bot_params,
            &position,
        );
        assert!(ladder.len() > 1);
        // everything sells and levels ascend away from the mark
        let total: f64 = ladder.iter().map(|o| o.qty).sum();
        assert!((total + 10.0).abs() < 1e-6);
        for pair in ladder.windows(2) {
            assert!(pair[1].price > pair[0].price);
        }
    }

    #[test]
    fn test_auto_reduce_when_over_exposed() {
        let exchange_params = exchange();
        let state_params = state(1000.0, 100.0, 100.0);
        let mut bot_params = params();
        bot_params.enforce_exposure_limit = true;
        // exposure 1.5 against a cap of 1.0: breach beyond tolerance
        let position = open_position(15.0, 100.0);
        let order = calc_next_close(
            LONG,
            &exchange_params,
            &state_params,
            &bot_params,
            &position,
        );
        assert_eq!(order.order_type, OrderType::CloseAutoReduceLong);
        assert!(order.qty < 0.0);
        // reduces roughly down to limit * tolerance
        let remaining = position.size + order.qty;
        let we_after =
            calc_wallet_exposure(1.0, state_params.balance, remaining, position.price);
        assert!(we_after <= 1.011, "we_after {}", we_after);
    }

    #[test]
    fn test_no_auto_reduce_without_enforcement() {
        let exchange_params = exchange();
        let state_params = state(1000.0, 100.0, 100.0);
        let position = open_position(15.0, 100.0);
        let order = calc_next_close(
            LONG,
            &exchange_params,
            &state_params,
            &params(),
            &position,
        );
        assert_ne!(order.order_type, OrderType::CloseAutoReduceLong);
    }

    #[test]
    fn test_trailing_close_threshold_and_retracement() {
        let exchange_params = exchange();
        let mut bot_params = params();
        bot_params.close_trailing_grid_ratio = 1.0;
        bot_params.close_trailing_threshold_pct = 0.02;
        bot_params.close_trailing_retracement_pct = 0.005;
        bot_params.close_trailing_qty_pct = 1.0;
        let state_params = state(1000.0, 100.0, 100.0);
        let mut position = open_position(5.0, 100.0);
        // rallied past 102, then gave back more than 0.5%
        position.trailing = TrailingPriceBundle {
            min_since_open: 99.0,
            max_since_min: 103.0,
            max_since_open: 103.0,
            min_since_max: 102.0,
        };
        let order = calc_next_close(
            LONG,
            &exchange_params,
            &state_params,
            &bot_params,
            &position,
        );
        assert_eq!(order.order_type, OrderType::CloseTrailingLong);
        // limit at threshold minus retracement
        assert!((order.price - round_up(100.0 * 1.015, 0.01)).abs() < 1e-9);
        assert!(order.qty < 0.0);
    }

    #[test]
    fn test_short_grid_close_mirrors_long() {
        let exchange_params = exchange();
        let state_params = state(1000.0, 100.0, 100.0);
        let position = open_position(-5.0, 102.0);
        let ladder = calc_close_ladder(
            SHORT,
            &exchange_params,
            &state_params,
            &params(),
            &position,
        );
        assert_eq!(ladder.len(), 1);
        // buys back below the position price
        assert!(ladder[0].qty > 0.0);
        assert!(ladder[0].price < 102.0);
        assert_eq!(ladder[0].order_type, OrderType::CloseGridShort);
    }

    #[test]
    fn test_blend_reserves_leader_share_for_trailing() {
        let exchange_params = exchange();
        let state_params = state(1000.0, 100.0, 100.0);
        let mut bot_params = params();
        // trailing leads with a 40% share; exposure is past it
        bot_params.close_trailing_grid_ratio = 0.4;
        bot_params.close_trailing_threshold_pct = 0.02;
        bot_params.close_trailing_retracement_pct = 0.005;
        let position = open_position(8.0, 100.0);
        let order = calc_next_close(
            LONG,
            &exchange_params,
            &state_params,
            &bot_params,
            &position,
        );
        // the grid works only the 4 units not reserved for trailing
        assert_eq!(order.order_type, OrderType::CloseGridLong);
        assert!((order.qty + 4.0).abs() < 1e-9, "qty {}", order.qty);
    }

    #[test]
    fn test_close_qty_avoids_dust_remainder() {
        let exchange_params = ExchangeParams {
            qty_step: 1.0,
            price_step: 0.01,
            min_qty: 1.0,
            min_cost: 0.0,
            c_mult: 1.0,
        };
        let bot_params = params();
        let position = open_position(3.0, 100.0);
        // slice would leave less than min_qty behind: close everything
        let qty = calc_tp_qty(&exchange_params, &bot_params, &position, 0.9, 300.0, 101.0);
        assert_eq!(qty, 3.0);
    }
}
