use crate::constants::{LONG, SHORT};
use crate::entries::calc_min_entry_qty;
use crate::types::{BotParams, BotParamsPair, ExchangeParams, Order, OrderType};
use crate::utils::{
    calc_pnl_long, calc_pnl_short, calc_pprice_diff, calc_unstuck_allowance,
    calc_wallet_exposure, cost_to_qty, round_dn, round_up, side_sign,
};

/// Everything the scheduler needs to know about one open position.
#[derive(Debug, Clone)]
pub struct StuckPositionView {
    pub idx: usize,
    pub pside: usize,
    /// Absolute position size.
    pub position_size: f64,
    pub position_price: f64,
    pub mark_price: f64,
    /// Upper EMA band for longs, lower for shorts.
    pub ema_band: f64,
    /// Price of the nearest resting close, 0.0 when none rests.
    pub first_close_price: f64,
    pub first_close_qty: f64,
}

fn side_params(pair: &BotParamsPair, pside: usize) -> &BotParams {
    match pside {
        LONG => &pair.long,
        SHORT => &pair.short,
        _ => panic!("unknown pside {}", pside),
    }
}

/// Close price for an unstuck order: the EMA band pushed out by
/// `unstuck_ema_dist`, never through the mark.
fn unstuck_close_price(
    view: &StuckPositionView,
    bot_params: &BotParams,
    exchange_params: &ExchangeParams,
) -> f64 {
    match view.pside {
        LONG => round_up(
            view.ema_band * (1.0 + bot_params.unstuck_ema_dist),
            exchange_params.price_step,
        )
        .max(view.mark_price),
        _ => round_dn(
            view.ema_band * (1.0 - bot_params.unstuck_ema_dist),
            exchange_params.price_step,
        )
        .min(view.mark_price),
    }
}

/// The order is only worth placing if it undercuts whatever close already
/// rests for the position.
fn improves_on_resting_close(view: &StuckPositionView, close_price: f64) -> bool {
    if view.first_close_qty == 0.0 {
        return true;
    }
    match view.pside {
        LONG => close_price < view.first_close_price,
        _ => close_price > view.first_close_price,
    }
}

fn unstuck_pnl(view: &StuckPositionView, close_price: f64, qty: f64, c_mult: f64) -> f64 {
    match view.pside {
        LONG => calc_pnl_long(view.position_price, close_price, qty, c_mult),
        _ => calc_pnl_short(view.position_price, close_price, qty, c_mult),
    }
}

/// Picks at most one unstuck close across all positions and sides.
///
/// A position is stuck when its exposure ratio exceeds `unstuck_threshold`
/// and no profitable take-profit is currently reachable (the active close
/// level sits beyond the mark). Among stuck positions the one closest to
/// its entry price goes first; realized loss is capped by the remaining
/// allowance derived from peak balance.
pub fn select_unstuck_close(
    bot_params_pair: &BotParamsPair,
    exchange_params_list: &[ExchangeParams],
    balance: f64,
    pnl_cumsum_max: f64,
    pnl_cumsum_running: f64,
    positions: &[StuckPositionView],
) -> Option<(usize, usize, Order)> {
    let mut allowances = [0.0, 0.0];
    for pside in [LONG, SHORT] {
        let bot_params = side_params(bot_params_pair, pside);
        if bot_params.unstuck_loss_allowance_pct > 0.0 {
            allowances[pside] = calc_unstuck_allowance(
                balance,
                bot_params.unstuck_loss_allowance_pct * bot_params.total_wallet_exposure_limit,
                pnl_cumsum_max,
                pnl_cumsum_running,
            );
        }
    }

    let mut stuck: Vec<(usize, usize, f64)> = Vec::new();
    for view in positions {
        if view.position_size == 0.0 || allowances[view.pside] <= 0.0 {
            continue;
        }
        let bot_params = side_params(bot_params_pair, view.pside);
        if bot_params.wallet_exposure_limit <= 0.0 {
            continue;
        }
        let exposure = calc_wallet_exposure(
            exchange_params_list[view.idx].c_mult,
            balance,
            view.position_size,
            view.position_price,
        );
        if exposure / bot_params.wallet_exposure_limit <= bot_params.unstuck_threshold {
            continue;
        }
        // a reachable profitable TP disqualifies the position
        let tp_reachable = view.first_close_qty != 0.0
            && match view.pside {
                LONG => view.first_close_price <= view.mark_price,
                _ => view.first_close_price >= view.mark_price,
            };
        if tp_reachable {
            continue;
        }
        let entry_gap = calc_pprice_diff(view.pside, view.position_price, view.mark_price);
        stuck.push((view.idx, view.pside, entry_gap));
    }
    if stuck.is_empty() {
        return None;
    }
    stuck.sort_by(|(idx_a, side_a, gap_a), (idx_b, side_b, gap_b)| {
        gap_a
            .partial_cmp(gap_b)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| (idx_a, side_a).cmp(&(idx_b, side_b)))
    });

    for (idx, pside, _) in stuck {
        let view = positions
            .iter()
            .find(|v| v.idx == idx && v.pside == pside)
            .unwrap();
        let bot_params = side_params(bot_params_pair, pside);
        let exchange_params = &exchange_params_list[idx];
        let close_price = unstuck_close_price(view, bot_params, exchange_params);
        if !improves_on_resting_close(view, close_price) {
            continue;
        }
        let qty_floor = calc_min_entry_qty(close_price, exchange_params);
        let target_psize = cost_to_qty(
            balance * bot_params.wallet_exposure_limit,
            view.position_price,
            exchange_params.c_mult,
        );
        let mut close_qty = round_up(
            target_psize * bot_params.unstuck_close_pct,
            exchange_params.qty_step,
        )
        .max(qty_floor)
        .min(view.position_size);
        if close_qty == 0.0 {
            continue;
        }
        let pnl_if_closed = unstuck_pnl(view, close_price, close_qty, exchange_params.c_mult);
        if pnl_if_closed < 0.0 && -pnl_if_closed > allowances[pside] {
            // scale the slice down so the realized loss fits the budget
            close_qty = round_dn(
                close_qty * (allowances[pside] / -pnl_if_closed),
                exchange_params.qty_step,
            )
            .max(qty_floor)
            .min(view.position_size);
        }
        if close_qty > 0.0 {
            let order_type = match pside {
                LONG => OrderType::CloseUnstuckLong,
                _ => OrderType::CloseUnstuckShort,
            };
            return Some((
                idx,
                pside,
                Order {
                    qty: -side_sign(pside) * close_qty,
                    price: close_price,
                    order_type,
                },
            ));
        }
    }
    None
}
