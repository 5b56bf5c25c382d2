use crate::constants::{LONG, WE_OVERSHOOT_TOLERANCE};
use crate::trailing::{dipped_below, faded_off_high, rallied_above, rebounded_off_low};
use crate::types::{BotParams, ExchangeParams, Mechanism, Order, OrderType, Position, StateParams};
use crate::utils::{
    calc_ema_price_ask, calc_ema_price_bid, calc_new_psize_pprice, calc_wallet_exposure,
    calc_wallet_exposure_if_filled, cost_to_qty, interpolate, round_, round_dn, round_up,
    side_sign,
};

/// A position whose exposure is within 0.1% of its cap counts as full; no
/// further entries are quoted for it.
const NEARLY_FULL: f64 = 0.999;

/// Positions below this share of the initial qty are topped up with a
/// partial initial entry instead of a grid rung.
const STUB_TOPUP_CUTOFF: f64 = 0.8;

/// Inflate the current rung when the rung after it would shrink below this
/// share of the double-down factor.
const RUNT_RUNG_FRACTION: f64 = 0.25;

/// Upper bound on rungs materialized per ladder.
const LADDER_CAP: usize = 500;

/// Smallest entry qty the exchange accepts at this price.
pub fn calc_min_entry_qty(entry_price: f64, exchange_params: &ExchangeParams) -> f64 {
    f64::max(
        exchange_params.min_qty,
        round_up(
            cost_to_qty(
                exchange_params.min_cost,
                entry_price,
                exchange_params.c_mult,
            ),
            exchange_params.qty_step,
        ),
    )
}

pub fn calc_initial_entry_qty(
    exchange_params: &ExchangeParams,
    bot_params: &BotParams,
    balance: f64,
    entry_price: f64,
) -> f64 {
    f64::max(
        calc_min_entry_qty(entry_price, exchange_params),
        round_(
            cost_to_qty(
                balance * bot_params.wallet_exposure_limit * bot_params.entry_initial_qty_pct,
                entry_price,
                exchange_params.c_mult,
            ),
            exchange_params.qty_step,
        ),
    )
}

fn initial_entry_kind(pside: usize, partial: bool) -> OrderType {
    match (pside, partial) {
        (LONG, false) => OrderType::EntryInitialNormalLong,
        (LONG, true) => OrderType::EntryInitialPartialLong,
        (_, false) => OrderType::EntryInitialNormalShort,
        (_, true) => OrderType::EntryInitialPartialShort,
    }
}

#[derive(Clone, Copy)]
enum RungKind {
    Normal,
    Cropped,
    Inflated,
}

fn grid_entry_kind(pside: usize, kind: RungKind) -> OrderType {
    match (pside, kind) {
        (LONG, RungKind::Normal) => OrderType::EntryGridNormalLong,
        (LONG, RungKind::Cropped) => OrderType::EntryGridCroppedLong,
        (LONG, RungKind::Inflated) => OrderType::EntryGridInflatedLong,
        (_, RungKind::Normal) => OrderType::EntryGridNormalShort,
        (_, RungKind::Cropped) => OrderType::EntryGridCroppedShort,
        (_, RungKind::Inflated) => OrderType::EntryGridInflatedShort,
    }
}

fn trailing_entry_kind(pside: usize, cropped: bool) -> OrderType {
    match (pside, cropped) {
        (LONG, false) => OrderType::EntryTrailingNormalLong,
        (LONG, true) => OrderType::EntryTrailingCroppedLong,
        (_, false) => OrderType::EntryTrailingNormalShort,
        (_, true) => OrderType::EntryTrailingCroppedShort,
    }
}

fn is_trailing_entry(order_type: OrderType) -> bool {
    matches!(
        order_type,
        OrderType::EntryTrailingNormalLong
            | OrderType::EntryTrailingCroppedLong
            | OrderType::EntryTrailingNormalShort
            | OrderType::EntryTrailingCroppedShort
    )
}

/// The book level entries rest against: bid for longs, ask for shorts.
fn entry_book_price(pside: usize, state_params: &StateParams) -> f64 {
    match pside {
        LONG => state_params.order_book.bid,
        _ => state_params.order_book.ask,
    }
}

/// EMA-band anchor for the initial entry.
fn band_anchor_price(
    pside: usize,
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    ema_dist: f64,
) -> f64 {
    match pside {
        LONG => calc_ema_price_bid(
            exchange_params.price_step,
            state_params.order_book.bid,
            state_params.ema_bands.lower,
            ema_dist,
        ),
        _ => calc_ema_price_ask(
            exchange_params.price_step,
            state_params.order_book.ask,
            state_params.ema_bands.upper,
            ema_dist,
        ),
    }
}

/// A limit resting `offset_pct` away from the position price on the entry
/// side, clamped so it never crosses the book.
fn entry_offset_price(
    pside: usize,
    position_price: f64,
    offset_pct: f64,
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
) -> f64 {
    match pside {
        LONG => round_dn(
            position_price * (1.0 - offset_pct),
            exchange_params.price_step,
        )
        .min(state_params.order_book.bid),
        _ => round_up(
            position_price * (1.0 + offset_pct),
            exchange_params.price_step,
        )
        .max(state_params.order_book.ask),
    }
}

/// Outcome of sizing the EMA-anchored initial entry, decided before any
/// re-entry logic runs.
enum InitialEntry {
    /// Band anchor unusable; nothing can be quoted.
    NoQuote,
    /// Emit this order now (fresh position, or top-up of a small stub).
    Place(Order),
    /// Position is established; re-entries use this qty floor.
    Established { qty_floor: f64 },
}

fn size_initial_entry(
    pside: usize,
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    bot_params: &BotParams,
    held: f64,
) -> InitialEntry {
    let anchor = band_anchor_price(
        pside,
        exchange_params,
        state_params,
        bot_params.entry_initial_ema_dist,
    );
    if anchor <= exchange_params.price_step {
        return InitialEntry::NoQuote;
    }
    let stub_qty = calc_initial_entry_qty(exchange_params, bot_params, state_params.balance, anchor);
    if held == 0.0 {
        return InitialEntry::Place(Order {
            qty: side_sign(pside) * stub_qty,
            price: anchor,
            order_type: initial_entry_kind(pside, false),
        });
    }
    if held < stub_qty * STUB_TOPUP_CUTOFF {
        let top_up = round_dn(stub_qty - held, exchange_params.qty_step)
            .max(calc_min_entry_qty(anchor, exchange_params));
        return InitialEntry::Place(Order {
            qty: side_sign(pside) * top_up,
            price: anchor,
            order_type: initial_entry_kind(pside, true),
        });
    }
    let qty_floor = if held < stub_qty {
        round_(held, exchange_params.qty_step).max(calc_min_entry_qty(anchor, exchange_params))
    } else {
        stub_qty
    };
    InitialEntry::Established { qty_floor }
}

/// Grid spacing widens with how full the position is and with recent
/// volatility.
fn spacing_factor(bot_params: &BotParams, exposure: f64, cap: f64, grid_log_range: f64) -> f64 {
    let mut factor = 1.0 + grid_log_range * bot_params.entry_grid_spacing_log_weight;
    if cap > 0.0 {
        factor += (exposure / cap) * bot_params.entry_grid_spacing_we_weight;
    }
    factor.max(0.0)
}

fn grid_rung_price(
    pside: usize,
    position_price: f64,
    exposure: f64,
    cap: f64,
    exchange_params: &ExchangeParams,
    bot_params: &BotParams,
    state_params: &StateParams,
) -> f64 {
    let spread = bot_params.entry_grid_spacing_pct
        * spacing_factor(bot_params, exposure, cap, state_params.grid_log_range);
    let stepped = match pside {
        LONG => round_dn(position_price * (1.0 - spread), exchange_params.price_step)
            .min(state_params.order_book.bid),
        _ => round_up(position_price * (1.0 + spread), exchange_params.price_step)
            .max(state_params.order_book.ask),
    };
    if stepped > exchange_params.price_step {
        stepped
    } else {
        0.0
    }
}

/// Raw rung size: double down on what is held, but never less than the
/// seed qty a fresh position would start with.
fn calc_rung_qty(
    rung_price: f64,
    balance: f64,
    held: f64,
    double_down_factor: f64,
    exchange_params: &ExchangeParams,
    bot_params: &BotParams,
    cap: f64,
) -> f64 {
    let doubled = held * double_down_factor;
    let seeded = cost_to_qty(balance, rung_price, exchange_params.c_mult)
        * cap
        * bot_params.entry_initial_qty_pct;
    round_(doubled.max(seeded), exchange_params.qty_step)
        .max(calc_min_entry_qty(rung_price, exchange_params))
}

/// Returns the exposure a full fill would produce, alongside the qty to
/// quote — shrunk when that exposure would overshoot the cap.
fn crop_rung(
    exchange_params: &ExchangeParams,
    held: f64,
    position_price: f64,
    balance: f64,
    exposure: f64,
    rung_qty: f64,
    rung_price: f64,
    cap: f64,
) -> (f64, f64) {
    let exposure_if_filled = calc_wallet_exposure_if_filled(
        balance,
        held,
        position_price,
        rung_qty,
        rung_price,
        exchange_params,
    );
    let qty_floor = calc_min_entry_qty(rung_price, exchange_params);
    if exposure_if_filled <= cap * WE_OVERSHOOT_TOLERANCE {
        return (exposure_if_filled, rung_qty.max(qty_floor));
    }
    // linear solve for the size that lands exactly on the cap
    let capped_size = interpolate(
        cap,
        &[exposure, exposure_if_filled],
        &[held, held + rung_qty],
    );
    (
        exposure_if_filled,
        round_(capped_size - held, exchange_params.qty_step).max(qty_floor),
    )
}

/// Next grid entry for one side: the EMA-anchored initial entry while the
/// position is small, otherwise a spaced re-entry cropped (or inflated)
/// against the exposure cap.
pub fn calc_grid_entry(
    pside: usize,
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    bot_params: &BotParams,
    position: &Position,
    exposure_cap: f64,
) -> Order {
    if bot_params.wallet_exposure_limit == 0.0 || state_params.balance <= 0.0 {
        return Order::default();
    }
    let held = position.size.abs();
    let qty_floor =
        match size_initial_entry(pside, exchange_params, state_params, bot_params, held) {
            InitialEntry::NoQuote => return Order::default(),
            InitialEntry::Place(order) => return order,
            InitialEntry::Established { qty_floor } => qty_floor,
        };
    let exposure = calc_wallet_exposure(
        exchange_params.c_mult,
        state_params.balance,
        held,
        position.price,
    );
    let cap = exposure_cap.min(bot_params.wallet_exposure_limit);
    if exposure >= cap * NEARLY_FULL {
        return Order::default();
    }

    let rung_price = grid_rung_price(
        pside,
        position.price,
        exposure,
        cap,
        exchange_params,
        bot_params,
        state_params,
    );
    if rung_price <= 0.0 {
        return Order::default();
    }
    let rung_qty = calc_rung_qty(
        rung_price,
        state_params.balance,
        held,
        bot_params.entry_grid_double_down_factor,
        exchange_params,
        bot_params,
        cap,
    )
    .max(qty_floor);
    let (exposure_if_filled, kept_qty) = crop_rung(
        exchange_params,
        held,
        position.price,
        state_params.balance,
        exposure,
        rung_qty,
        rung_price,
        cap,
    );
    if kept_qty < rung_qty {
        return Order {
            qty: side_sign(pside) * kept_qty,
            price: rung_price,
            order_type: grid_entry_kind(pside, RungKind::Cropped),
        };
    }
    // probe the rung after this one; a runt tail means the remaining budget
    // is better spent here
    let (next_held, next_pprice) = calc_new_psize_pprice(
        held,
        position.price,
        rung_qty,
        rung_price,
        exchange_params.qty_step,
    );
    let next_price = grid_rung_price(
        pside,
        next_pprice,
        exposure_if_filled,
        cap,
        exchange_params,
        bot_params,
        state_params,
    );
    let next_qty = calc_rung_qty(
        next_price,
        state_params.balance,
        next_held,
        bot_params.entry_grid_double_down_factor,
        exchange_params,
        bot_params,
        cap,
    )
    .max(qty_floor);
    let (_, next_kept) = crop_rung(
        exchange_params,
        next_held,
        next_pprice,
        state_params.balance,
        exposure_if_filled,
        next_qty,
        next_price,
        cap,
    );
    if next_kept < next_held * bot_params.entry_grid_double_down_factor * RUNT_RUNG_FRACTION {
        let budget_qty = interpolate(
            cap,
            &[exposure, exposure_if_filled],
            &[held, held + rung_qty],
        ) - held;
        return Order {
            qty: side_sign(pside) * round_(budget_qty, exchange_params.qty_step),
            price: rung_price,
            order_type: grid_entry_kind(pside, RungKind::Inflated),
        };
    }
    Order {
        qty: side_sign(pside) * rung_qty,
        price: rung_price,
        order_type: grid_entry_kind(pside, RungKind::Normal),
    }
}

/// Next trailing entry for one side. The adverse move arms the trigger; a
/// retracement off the extreme fires it. Either knob at zero degenerates
/// per its meaning: no threshold quotes a resting limit, no retracement
/// fires on the threshold alone, and both off re-enters at the book
/// immediately.
pub fn calc_trailing_entry(
    pside: usize,
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    bot_params: &BotParams,
    position: &Position,
    exposure_cap: f64,
) -> Order {
    if bot_params.wallet_exposure_limit == 0.0 || state_params.balance <= 0.0 {
        return Order::default();
    }
    let held = position.size.abs();
    let qty_floor =
        match size_initial_entry(pside, exchange_params, state_params, bot_params, held) {
            InitialEntry::NoQuote => return Order::default(),
            InitialEntry::Place(order) => return order,
            InitialEntry::Established { qty_floor } => qty_floor,
        };
    let exposure = calc_wallet_exposure(
        exchange_params.c_mult,
        state_params.balance,
        held,
        position.price,
    );
    let cap = exposure_cap.min(bot_params.wallet_exposure_limit);
    if exposure > cap * NEARLY_FULL {
        return Order::default();
    }

    let threshold = bot_params.entry_trailing_threshold_pct;
    let retracement = bot_params.entry_trailing_retracement_pct;
    let extrema = &position.trailing;
    let pulled_away = match pside {
        LONG => dipped_below(extrema, position.price, threshold),
        _ => rallied_above(extrema, position.price, threshold),
    };
    let turned_back = match pside {
        LONG => rebounded_off_low(extrema, retracement),
        _ => faded_off_high(extrema, retracement),
    };
    let rung_price = if threshold > 0.0 {
        if retracement > 0.0 {
            if pulled_away && turned_back {
                Some(entry_offset_price(
                    pside,
                    position.price,
                    threshold - retracement,
                    exchange_params,
                    state_params,
                ))
            } else {
                None
            }
        } else {
            Some(entry_offset_price(
                pside,
                position.price,
                threshold,
                exchange_params,
                state_params,
            ))
        }
    } else if retracement > 0.0 {
        if turned_back {
            Some(entry_book_price(pside, state_params))
        } else {
            None
        }
    } else {
        Some(entry_book_price(pside, state_params))
    };
    let Some(rung_price) = rung_price else {
        return Order {
            qty: 0.0,
            price: 0.0,
            order_type: trailing_entry_kind(pside, false),
        };
    };
    let rung_qty = calc_rung_qty(
        rung_price,
        state_params.balance,
        held,
        bot_params.entry_trailing_double_down_factor,
        exchange_params,
        bot_params,
        cap,
    )
    .max(qty_floor);
    let (_, kept_qty) = crop_rung(
        exchange_params,
        held,
        position.price,
        state_params.balance,
        exposure,
        rung_qty,
        rung_price,
        cap,
    );
    if kept_qty < rung_qty {
        Order {
            qty: side_sign(pside) * kept_qty,
            price: rung_price,
            order_type: trailing_entry_kind(pside, true),
        }
    } else {
        Order {
            qty: side_sign(pside) * rung_qty,
            price: rung_price,
            order_type: trailing_entry_kind(pside, false),
        }
    }
}

/// Next entry for one side, blending grid and trailing on
/// `entry_trailing_grid_ratio`: zero is grid only, a magnitude of one is
/// trailing only. Otherwise one mechanism leads until its share of the
/// exposure budget is spent, then hands the position to the other — a
/// positive ratio puts trailing first, a negative one grid first.
pub fn calc_next_entry(
    pside: usize,
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    bot_params: &BotParams,
    position: &Position,
) -> Order {
    let budget = bot_params.wallet_exposure_limit;
    if budget == 0.0 || state_params.balance <= 0.0 {
        return Order::default();
    }
    let run = |mechanism: Mechanism, cap: f64| match mechanism {
        Mechanism::Grid => {
            calc_grid_entry(pside, exchange_params, state_params, bot_params, position, cap)
        }
        Mechanism::Trailing => calc_trailing_entry(
            pside,
            exchange_params,
            state_params,
            bot_params,
            position,
            cap,
        ),
    };
    let ratio = bot_params.entry_trailing_grid_ratio;
    if ratio == 0.0 {
        return run(Mechanism::Grid, budget);
    }
    if ratio.abs() >= 1.0 {
        return run(Mechanism::Trailing, budget);
    }
    let exposure = calc_wallet_exposure(
        exchange_params.c_mult,
        state_params.balance,
        position.size.abs(),
        position.price,
    );
    let spent_frac = exposure / budget;
    let (leader, leader_share) = if ratio > 0.0 {
        (Mechanism::Trailing, ratio)
    } else {
        (Mechanism::Grid, 1.0 + ratio)
    };
    if spent_frac < leader_share {
        // the leader works inside its own slice of the budget
        let cap = if exposure == 0.0 {
            budget
        } else {
            (budget * leader_share * WE_OVERSHOOT_TOLERANCE).min(budget)
        };
        run(leader, cap)
    } else {
        let follower = match leader {
            Mechanism::Grid => Mechanism::Trailing,
            Mechanism::Trailing => Mechanism::Grid,
        };
        run(follower, budget)
    }
}

/// Expands the resting entry book for one side by simulating successive
/// fills. Stops at the first trailing rung (its trigger depends on future
/// price action) and when the grid stalls on a repeated price.
pub fn calc_entry_ladder(
    pside: usize,
    exchange_params: &ExchangeParams,
    state_params: &StateParams,
    bot_params: &BotParams,
    position: &Position,
) -> Vec<Order> {
    let mut ladder = Vec::<Order>::new();
    let mut sim_position = position.clone();
    let mut sim_state = state_params.clone();
    while ladder.len() < LADDER_CAP {
        let rung = calc_next_entry(pside, exchange_params, &sim_state, bot_params, &sim_position);
        if rung.qty == 0.0 {
            break;
        }
        if let Some(last) = ladder.last() {
            if is_trailing_entry(rung.order_type) || last.price == rung.price {
                break;
            }
        }
        (sim_position.size, sim_position.price) = calc_new_psize_pprice(
            sim_position.size,
            sim_position.price,
            rung.qty,
            rung.price,
            exchange_params.qty_step,
        );
        // later rungs quote off the worst book level reached so far
        match pside {
            LONG => sim_state.order_book.bid = sim_state.order_book.bid.min(rung.price),
            _ => sim_state.order_book.ask = sim_state.order_book.ask.max(rung.price),
        }
        ladder.push(rung);
    }
    ladder
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SHORT;
    use crate::types::{EMABands, OrderBook, TrailingPriceBundle};

    fn exchange() -> ExchangeParams {
        ExchangeParams {
            qty_step: 0.001,
            price_step: 0.01,
            min_qty: 0.001,
            min_cost: 0.0,
            c_mult: 1.0,
        }
    }

    fn state(balance: f64, bid: f64, ask: f64, lower: f64, upper: f64) -> StateParams {
        StateParams {
            balance,
            order_book: OrderBook { bid, ask },
            ema_bands: EMABands { upper, lower },
            grid_log_range: 0.0,
        }
    }

    fn params() -> BotParams {
        BotParams {
            entry_initial_qty_pct: 0.15,
            entry_initial_ema_dist: -0.01,
            entry_grid_double_down_factor: 1.0,
            entry_grid_spacing_pct: 0.02,
            entry_grid_spacing_we_weight: 0.0,
            entry_grid_spacing_log_weight: 0.0,
            wallet_exposure_limit: 2.0,
            total_wallet_exposure_limit: 2.0,
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

    fn with_extrema(mut position: Position, trailing: TrailingPriceBundle) -> Position {
        position.trailing = trailing;
        position
    }

    #[test]
    fn test_initial_entry_price_and_qty() {
        // lower band 100, dist -0.01 => limit at 101, capped by the bid
        let exchange_params = exchange();
        let state_params = state(1000.0, 101.0, 101.0, 100.0, 100.0);
        let order = calc_next_entry(
            LONG,
            &exchange_params,
            &state_params,
            &params(),
            &Position::default(),
        );
        assert_eq!(order.order_type, OrderType::EntryInitialNormalLong);
        assert!((order.price - 101.0).abs() < 1e-9);
        let expected_qty = round_(1000.0 * 2.0 * 0.15 / 101.0, exchange_params.qty_step);
        assert!((order.qty - expected_qty).abs() < 1e-9);
    }

    #[test]
    fn test_grid_spacing_with_exposure_weight() {
        // exposure at half the cap with we_weight 1.0 widens spacing 1.5x
        let exchange_params = exchange();
        let mut bot_params = params();
        bot_params.wallet_exposure_limit = 1.0;
        bot_params.entry_grid_spacing_we_weight = 1.0;
        let state_params = state(1000.0, 100.0, 100.0, 100.0, 100.0);
        let position = open_position(5.0, 100.0);
        let order = calc_grid_entry(
            LONG,
            &exchange_params,
            &state_params,
            &bot_params,
            &position,
            bot_params.wallet_exposure_limit,
        );
        assert!((order.price - 97.0).abs() < 1e-9, "got {}", order.price);
    }

    #[test]
    fn test_trailing_entry_threshold_and_retracement() {
        // pprice 100, th 0.02, rt 0.01; dumped to 97 then recovered past 97.97
        let exchange_params = exchange();
        let mut bot_params = params();
        bot_params.entry_trailing_grid_ratio = 1.0;
        bot_params.entry_trailing_threshold_pct = 0.02;
        bot_params.entry_trailing_retracement_pct = 0.01;
        bot_params.entry_trailing_double_down_factor = 1.0;
        let state_params = state(1000.0, 100.0, 100.0, 100.0, 100.0);
        let position = with_extrema(
            open_position(4.0, 100.0),
            TrailingPriceBundle {
                min_since_open: 97.0,
                max_since_min: 98.5,
                max_since_open: 100.0,
                min_since_max: 97.0,
            },
        );
        let order = calc_next_entry(
            LONG,
            &exchange_params,
            &state_params,
            &bot_params,
            &position,
        );
        assert_eq!(order.order_type, OrderType::EntryTrailingNormalLong);
        assert!((order.price - 99.0).abs() < 1e-9, "got {}", order.price);
    }

    #[test]
    fn test_trailing_entry_not_triggered_without_retracement() {
        let exchange_params = exchange();
        let mut bot_params = params();
        bot_params.entry_trailing_grid_ratio = 1.0;
        bot_params.entry_trailing_threshold_pct = 0.02;
        bot_params.entry_trailing_retracement_pct = 0.01;
        let state_params = state(1000.0, 100.0, 100.0, 100.0, 100.0);
        // below threshold but still sliding: no retracement yet
        let position = with_extrema(
            open_position(4.0, 100.0),
            TrailingPriceBundle {
                min_since_open: 97.0,
                max_since_min: 97.5,
                max_since_open: 100.0,
                min_since_max: 97.0,
            },
        );
        let order = calc_next_entry(
            LONG,
            &exchange_params,
            &state_params,
            &bot_params,
            &position,
        );
        assert_eq!(order.qty, 0.0);
    }

    #[test]
    fn test_grid_only_ratio_emits_no_trailing_kinds() {
        let exchange_params = exchange();
        let state_params = state(1000.0, 100.0, 100.0, 100.0, 100.0);
        let position = open_position(2.0, 100.0);
        let ladder = calc_entry_ladder(
            LONG,
            &exchange_params,
            &state_params,
            &params(),
            &position,
        );
        assert!(!ladder.is_empty());
        for order in &ladder {
            assert!(
                !is_trailing_entry(order.order_type),
                "unexpected trailing order in grid-only mode"
            );
        }
    }

    #[test]
    fn test_trailing_only_ratio_emits_no_grid_kinds() {
        let exchange_params = exchange();
        let mut bot_params = params();
        bot_params.entry_trailing_grid_ratio = 1.0;
        bot_params.entry_trailing_threshold_pct = 0.02;
        bot_params.entry_trailing_retracement_pct = 0.01;
        bot_params.entry_trailing_double_down_factor = 1.0;
        let state_params = state(1000.0, 100.0, 100.0, 100.0, 100.0);
        let position = with_extrema(
            open_position(4.0, 100.0),
            TrailingPriceBundle {
                min_since_open: 97.0,
                max_since_min: 98.5,
                max_since_open: 100.0,
                min_since_max: 97.0,
            },
        );
        let order = calc_next_entry(
            LONG,
            &exchange_params,
            &state_params,
            &bot_params,
            &position,
        );
        assert!(!matches!(
            order.order_type,
            OrderType::EntryGridNormalLong
                | OrderType::EntryGridCroppedLong
                | OrderType::EntryGridInflatedLong
        ));
    }

    #[test]
    fn test_blend_hands_position_from_trailing_to_grid() {
        let exchange_params = exchange();
        let mut bot_params = params();
        bot_params.wallet_exposure_limit = 1.0;
        bot_params.entry_trailing_grid_ratio = 0.5;
        bot_params.entry_trailing_threshold_pct = 0.02;
        bot_params.entry_trailing_retracement_pct = 0.01;
        bot_params.entry_trailing_double_down_factor = 1.0;
        let state_params = state(1000.0, 100.0, 100.0, 100.0, 100.0);
        // below the trailing share and untriggered: placeholder, no order
        let leader_phase = calc_next_entry(
            LONG,
            &exchange_params,
            &state_params,
            &bot_params,
            &open_position(2.0, 100.0),
        );
        assert_eq!(leader_phase.order_type, OrderType::EntryTrailingNormalLong);
        assert_eq!(leader_phase.qty, 0.0);
        // past the trailing share: the grid takes over
        let follower_phase = calc_next_entry(
            LONG,
            &exchange_params,
            &state_params,
            &bot_params,
            &open_position(6.0, 100.0),
        );
        assert!(matches!(
            follower_phase.order_type,
            OrderType::EntryGridNormalLong
                | OrderType::EntryGridCroppedLong
                | OrderType::EntryGridInflatedLong
        ));
    }

    #[test]
    fn test_short_initial_entry_mirrors_long() {
        let exchange_params = exchange();
        let state_params = state(1000.0, 99.0, 99.0, 100.0, 100.0);
        let order = calc_next_entry(
            SHORT,
            &exchange_params,
            &state_params,
            &params(),
            &Position::default(),
        );
        assert_eq!(order.order_type, OrderType::EntryInitialNormalShort);
        // upper band 100, dist -0.01 => ask anchor at 99, capped by book ask
        assert!(order.qty < 0.0);
        assert!((order.price - 99.0).abs() < 1e-9);
    }

    #[test]
    fn test_entry_suppressed_at_exposure_limit() {
        let exchange_params = exchange();
        let mut bot_params = params();
        bot_params.wallet_exposure_limit = 1.0;
        let state_params = state(1000.0, 100.0, 100.0, 100.0, 100.0);
        // exposure exactly at the cap
        let position = open_position(10.0, 100.0);
        let order = calc_grid_entry(
            LONG,
            &exchange_params,
            &state_params,
            &bot_params,
            &position,
            bot_params.wallet_exposure_limit,
        );
        assert_eq!(order.order_type, OrderType::Empty);
    }

    #[test]
    fn test_grid_ladder_descends() {
        let exchange_params = exchange();
        let state_params = state(1000.0, 100.0, 100.0, 100.0, 100.0);
        let position = open_position(2.0, 100.0);
        let ladder = calc_entry_ladder(
            LONG,
            &exchange_params,
            &state_params,
            &params(),
            &position,
        );
        assert!(ladder.len() > 1);
        for pair in ladder.windows(2) {
            assert!(pair[1].price < pair[0].price);
        }
    }

    #[test]
    fn test_short_grid_ladder_ascends() {
        let exchange_params = exchange();
        let state_params = state(1000.0, 100.0, 100.0, 100.0, 100.0);
        let position = open_position(-2.0, 100.0);
        let ladder = calc_entry_ladder(
            SHORT,
            &exchange_params,
            &state_params,
            &params(),
            &position,
        );
        assert!(ladder.len() > 1);
        for pair in ladder.windows(2) {
            assert!(pair[1].price > pair[0].price);
            assert!(pair[1].qty < 0.0);
        }
    }
}
