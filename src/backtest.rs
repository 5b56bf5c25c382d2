use ndarray::{ArrayView1, ArrayView3};

use crate::candles::{find_valid_bounds, is_gap_candle, validate_candles};
use crate::closes::{calc_close_ladder, calc_next_close};
use crate::constants::{BALANCE_FLOOR, CLOSE, HIGH, LONG, LOW, MINUTES_PER_DAY, OPEN, SHORT, VOLUME};
use crate::ema::{FilterEmas, HourlyLogRangeEma, PriceEmas};
use crate::entries::{calc_entry_ladder, calc_next_entry};
use crate::error::{EngineError, EngineResult};
use crate::forager::{select_eligible, Eligibility, SymbolScore, SymbolSet};
use crate::trailing::update_trailing_prices;
use crate::types::{
    BacktestParams, Balance, BotParams, BotParamsOverridePair, BotParamsPair, EMABands, Equities,
    ExchangeParams, Fill, ForcedMode, MinuteObservation, Order, OrderBook, OrderCheck, OrderType,
    Position, PositionSnapshot, SkipReason, StateParams, TrailingPriceBundle,
};
use crate::unstuck::{select_unstuck_close, StuckPositionView};
use crate::utils::{
    calc_new_psize_pprice, calc_pnl_long, calc_pnl_short, calc_wallet_exposure, qty_to_cost,
    round_, screen_order,
};

/// Resting orders for one (symbol, side), regenerated every minute.
#[derive(Debug, Default, Clone)]
struct OrderBundle {
    entries: Vec<Order>,
    closes: Vec<Order>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Running,
    Finished,
    Bankrupt,
}

/// Everything the run produced, in minute order.
#[derive(Debug, Clone)]
pub struct BacktestOutput {
    pub fills: Vec<Fill>,
    pub equities: Equities,
    pub observations: Vec<MinuteObservation>,
    /// Minute at which equity fell through the liquidation floor, if it did.
    pub bankruptcy: Option<usize>,
}

/// Single-threaded minute-loop driver. State is kept in arenas indexed by
/// symbol id; iteration is always in ascending id order, which makes runs
/// deterministic.
pub struct Backtest<'a> {
    hlcvs: &'a ArrayView3<'a, f64>,
    btc_usd_prices: Option<&'a ArrayView1<'a, f64>>,
    bot_params_pair: BotParamsPair,
    bot_params: [Vec<BotParams>; 2],
    exchange_params_list: Vec<ExchangeParams>,
    backtest_params: BacktestParams,
    balance: Balance,
    n_coins: usize,
    n_timesteps: usize,
    price_emas: [Vec<PriceEmas>; 2],
    filter_emas: [Vec<FilterEmas>; 2],
    hourly_log_range: [Vec<HourlyLogRangeEma>; 2],
    positions: [Vec<Position>; 2],
    open_orders: [Vec<OrderBundle>; 2],
    eligibility: [Eligibility; 2],
    wallet_exposure_limits: [f64; 2],
    did_fill: [Vec<bool>; 2],
    trading_enabled: [bool; 2],
    first_valid: Vec<usize>,
    delist_at: Vec<Option<usize>>,
    pnl_cumsum_running: f64,
    pnl_cumsum_max: f64,
    fills: Vec<Fill>,
    equities: Equities,
    observations: Vec<MinuteObservation>,
    bankruptcy: Option<usize>,
    k: usize,
}

impl<'a> Backtest<'a> {
    pub fn new(
        hlcvs: &'a ArrayView3<'a, f64>,
        btc_usd_prices: Option<&'a ArrayView1<'a, f64>>,
        bot_params_pair: BotParamsPair,
        exchange_params_list: Vec<ExchangeParams>,
        overrides: &[(usize, BotParamsOverridePair)],
        backtest_params: BacktestParams,
    ) -> EngineResult<Self> {
        validate_candles(hlcvs)?;
        let n_timesteps = hlcvs.shape()[0];
        let n_coins = hlcvs.shape()[1];
        if n_timesteps < 3 {
            return Err(EngineError::Config(
                "need at least three minutes of candles".to_string(),
            ));
        }
        if let Some(prices) = btc_usd_prices {
            if prices.len() != n_timesteps {
                return Err(EngineError::Config(format!(
                    "btc price series length {} does not match {} candle minutes",
                    prices.len(),
                    n_timesteps
                )));
            }
            if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
                return Err(EngineError::Config(
                    "btc price series contains non-positive values".to_string(),
                ));
            }
        }
        if exchange_params_list.len() != n_coins {
            return Err(EngineError::Market {
                symbol: exchange_params_list.len(),
                reason: format!(
                    "exchange rules for {} symbols, stream has {}",
                    exchange_params_list.len(),
                    n_coins
                ),
            });
        }
        for (idx, exchange_params) in exchange_params_list.iter().enumerate() {
            validate_exchange_params(idx, exchange_params)?;
        }
        validate_backtest_params(&backtest_params)?;

        let mut bot_params_pair = bot_params_pair;
        bot_params_pair.long.n_positions = bot_params_pair.long.n_positions.min(n_coins);
        bot_params_pair.short.n_positions = bot_params_pair.short.n_positions.min(n_coins);
        validate_bot_params("long", &bot_params_pair.long)?;
        validate_bot_params("short", &bot_params_pair.short)?;

        let wallet_exposure_limits = [
            side_wallet_exposure_limit(&bot_params_pair.long),
            side_wallet_exposure_limit(&bot_params_pair.short),
        ];
        bot_params_pair.long.wallet_exposure_limit = wallet_exposure_limits[LONG];
        bot_params_pair.short.wallet_exposure_limit = wallet_exposure_limits[SHORT];

        let mut bot_params = [
            vec![bot_params_pair.long.clone(); n_coins],
            vec![bot_params_pair.short.clone(); n_coins],
        ];
        for (idx, override_pair) in overrides {
            if *idx >= n_coins {
                return Err(EngineError::Config(format!(
                    "coin override for symbol index {} out of range ({} symbols)",
                    idx, n_coins
                )));
            }
            bot_params[LONG][*idx] = override_pair.long.apply(&bot_params_pair.long);
            bot_params[SHORT][*idx] = override_pair.short.apply(&bot_params_pair.short);
        }

        let mut backtest_params = backtest_params;
        if backtest_params.coins.len() != n_coins {
            backtest_params.coins = (0..n_coins).map(|idx| format!("SYM{}", idx)).collect();
        }

        let use_btc_collateral = btc_usd_prices.map_or(false, |p| p.iter().any(|&x| x != 1.0));
        let mut balance = Balance {
            use_btc_collateral,
            ..Balance::default()
        };
        if use_btc_collateral {
            balance.btc = backtest_params.starting_balance / btc_usd_prices.unwrap()[0];
        } else {
            balance.usd = backtest_params.starting_balance;
        }
        balance.usd_total = backtest_params.starting_balance;
        balance.btc_total = if use_btc_collateral { balance.btc } else { 0.0 };

        let make_price_emas = |side: usize, params: &[Vec<BotParams>]| -> Vec<PriceEmas> {
            (0..n_coins)
                .map(|idx| {
                    let p = &params[side][idx];
                    PriceEmas::new(p.ema_span_0, p.ema_span_1, backtest_params.ema_warmup_ratio)
                })
                .collect()
        };
        let price_emas = [
            make_price_emas(LONG, &bot_params),
            make_price_emas(SHORT, &bot_params),
        ];
        let make_filter_emas = |side: &BotParams| -> Vec<FilterEmas> {
            (0..n_coins)
                .map(|_| FilterEmas::new(side.filter_volume_ema_span, side.filter_log_range_ema_span))
                .collect()
        };
        let filter_emas = [
            make_filter_emas(&bot_params_pair.long),
            make_filter_emas(&bot_params_pair.short),
        ];
        let make_hourly = |side: &BotParams| -> Vec<HourlyLogRangeEma> {
            (0..n_coins)
                .map(|_| HourlyLogRangeEma::new(side.grid_log_range_ema_span_hours))
                .collect()
        };
        let hourly_log_range = [
            make_hourly(&bot_params_pair.long),
            make_hourly(&bot_params_pair.short),
        ];

        let (first_valid, last_valid) = find_valid_bounds(hlcvs);
        // treat as delisted only when the stream goes dark more than a day
        // before the end; shorter gaps are just missing data
        let delist_at: Vec<Option<usize>> = last_valid
            .iter()
            .map(|&last| {
                if last < n_timesteps && n_timesteps - last > MINUTES_PER_DAY {
                    Some(last)
                } else {
                    None
                }
            })
            .collect();

        let mut equities = Equities::default();
        equities.usd.push(backtest_params.starting_balance);
        equities.btc.push(balance.btc);

        let trading_enabled = [
            bot_params_pair.long.total_wallet_exposure_limit > 0.0
                && bot_params_pair.long.n_positions > 0,
            bot_params_pair.short.total_wallet_exposure_limit > 0.0
                && bot_params_pair.short.n_positions > 0,
        ];

        Ok(Backtest {
            hlcvs,
            btc_usd_prices,
            bot_params_pair,
            bot_params,
            exchange_params_list,
            backtest_params,
            balance,
            n_coins,
            n_timesteps,
            price_emas,
            filter_emas,
            hourly_log_range,
            positions: [vec![Position::default(); n_coins], vec![Position::default(); n_coins]],
            open_orders: [
                vec![OrderBundle::default(); n_coins],
                vec![OrderBundle::default(); n_coins],
            ],
            eligibility: [
                Eligibility {
                    entry_eligible: SymbolSet::new(n_coins),
                    active: SymbolSet::new(n_coins),
                    effective_n_positions: 1,
                },
                Eligibility {
                    entry_eligible: SymbolSet::new(n_coins),
                    active: SymbolSet::new(n_coins),
                    effective_n_positions: 1,
                },
            ],
            wallet_exposure_limits,
            did_fill: [vec![false; n_coins], vec![false; n_coins]],
            trading_enabled,
            first_valid,
            delist_at,
            pnl_cumsum_running: 0.0,
            pnl_cumsum_max: 0.0,
            fills: Vec::new(),
            equities,
            observations: Vec::new(),
            bankruptcy: None,
            k: 1,
        })
    }

    /// Drives the loop to the end of the stream (or bankruptcy).
    pub fn run(&mut self) -> EngineResult<BacktestOutput> {
        while self.step()? == StepStatus::Running {}
        Ok(self.output())
    }

    /// Advances exactly one minute. Callers embedding the engine as a
    /// streaming library can check for a halt between calls.
    pub fn step(&mut self) -> EngineResult<StepStatus> {
        if self.bankruptcy.is_some() {
            return Ok(StepStatus::Bankrupt);
        }
        if self.k >= self.n_timesteps - 1 {
            return Ok(StepStatus::Finished);
        }
        let k = self.k;
        self.check_for_fills(k);
        self.update_indicators(k);
        self.update_eligibility(k);
        self.update_trailing(k);
        self.update_open_orders(k);
        let status = self.commit_minute(k)?;
        self.k += 1;
        Ok(status)
    }

    pub fn output(&self) -> BacktestOutput {
        BacktestOutput {
            fills: self.fills.clone(),
            equities: self.equities.clone(),
            observations: self.observations.clone(),
            bankruptcy: self.bankruptcy,
        }
    }

    fn btc_price(&self, k: usize) -> f64 {
        self.btc_usd_prices.map_or(1.0, |p| p[k])
    }

    /// Usable balance: floored so exposure ratios stay finite.
    fn balance_quote(&self) -> f64 {
        self.balance.usd_total.max(BALANCE_FLOOR)
    }

    fn is_tradable(&self, k: usize, idx: usize) -> bool {
        k >= self.first_valid[idx] && self.delist_at[idx].map_or(true, |d| k < d)
    }

    fn fee_rate(&self, order_type: OrderType) -> f64 {
        let rate = if order_type.is_market() {
            self.backtest_params.taker_fee
        } else {
            self.backtest_params.maker_fee
        };
        rate * self.backtest_params.fee_multiplier
    }

    fn order_filled(&self, k: usize, idx: usize, order: &Order) -> bool {
        if order.qty == 0.0 {
            return false;
        }
        if order.order_type.is_market() {
            return true;
        }
        if order.qty > 0.0 {
            self.hlcvs[[k, idx, LOW]] <= order.price
        } else {
            self.hlcvs[[k, idx, HIGH]] >= order.price
        }
    }

    /// Limit fills execute at the resting price; market kinds at the open.
    fn execution_price(&self, k: usize, idx: usize, order: &Order) -> f64 {
        if order.order_type.is_market() {
            self.hlcvs[[k, idx, OPEN]]
        } else {
            order.price
        }
    }

    fn create_state_params(&self, k: usize, idx: usize, pside: usize) -> StateParams {
        let close_price = self.hlcvs[[k, idx, CLOSE]];
        StateParams {
            balance: self.balance_quote(),
            order_book: OrderBook {
                bid: close_price,
                ask: close_price,
            },
            ema_bands: self.price_emas[pside][idx].bands().unwrap_or(EMABands {
                upper: 0.0,
                lower: 0.0,
            }),
            grid_log_range: self.hourly_log_range[pside][idx].get(),
        }
    }

    /// Matches the resting order set (built at `k - 1`) against candle `k`.
    /// Closes are ranked auto-reduce, unstuck/panic, then grid/trailing
    /// closest-to-mark first; entries fill afterwards.
    fn check_for_fills(&mut self, k: usize) {
        self.did_fill[LONG].fill(false);
        self.did_fill[SHORT].fill(false);
        for pside in [LONG, SHORT] {
            if !self.trading_enabled[pside] {
                continue;
            }
            for idx in 0..self.n_coins {
                let closes_to_process: Vec<Order> = self.open_orders[pside][idx]
                    .closes
                    .iter()
                    .filter(|order| self.order_filled(k, idx, order))
                    .cloned()
                    .collect();
                for order in closes_to_process {
                    if self.positions[pside][idx].size != 0.0 {
                        self.did_fill[pside][idx] = true;
                        self.positions[pside][idx].trailing = TrailingPriceBundle::default();
                        match pside {
                            LONG => self.process_close_fill_long(k, idx, &order),
                            _ => self.process_close_fill_short(k, idx, &order),
                        }
                    }
                }
                let entries_to_process: Vec<Order> = self.open_orders[pside][idx]
                    .entries
                    .iter()
                    .filter(|order| self.order_filled(k, idx, order))
                    .cloned()
                    .collect();
                for order in entries_to_process {
                    self.did_fill[pside][idx] = true;
                    self.positions[pside][idx].trailing = TrailingPriceBundle::default();
                    self.process_entry_fill(k, idx, pside, &order);
                }
            }
        }
    }

    fn process_close_fill_long(&mut self, k: usize, idx: usize, order: &Order) {
        let exchange_params = self.exchange_params_list[idx].clone();
        let exec_price = self.execution_price(k, idx, order);
        let mut new_psize = round_(
            self.positions[LONG][idx].size + order.qty,
            exchange_params.qty_step,
        );
        let mut adjusted_close_qty = order.qty;
        if new_psize < 0.0 {
            log::warn!(
                "close qty greater than psize long: {} {:?}",
                self.backtest_params.coins[idx],
                order
            );
            new_psize = 0.0;
            adjusted_close_qty = -self.positions[LONG][idx].size;
        }
        let fee_paid = -qty_to_cost(adjusted_close_qty, exec_price, exchange_params.c_mult)
            * self.fee_rate(order.order_type);
        let pnl = calc_pnl_long(
            self.positions[LONG][idx].price,
            exec_price,
            adjusted_close_qty,
            exchange_params.c_mult,
        );
        self.pnl_cumsum_running += pnl;
        self.pnl_cumsum_max = self.pnl_cumsum_max.max(self.pnl_cumsum_running);
        self.update_balance(k, pnl, fee_paid);

        let current_pprice = self.positions[LONG][idx].price;
        if new_psize == 0.0 {
            self.positions[LONG][idx] = Position::default();
        } else {
            self.positions[LONG][idx].size = new_psize;
        }
        self.fills.push(Fill {
            index: k,
            coin: self.backtest_params.coins[idx].clone(),
            pnl,
            fee_paid,
            balance_usd_total: self.balance.usd_total,
            balance_usd: self.balance.usd,
            balance_btc: self.balance.btc,
            btc_price: self.btc_price(k),
            fill_qty: adjusted_close_qty,
            fill_price: exec_price,
            position_size: new_psize,
            position_price: current_pprice,
            order_type: order.order_type,
        });
    }

    fn process_close_fill_short(&mut self, k: usize, idx: usize, order: &Order) {
        let exchange_params = self.exchange_params_list[idx].clone();
        let exec_price = self.execution_price(k, idx, order);
        let mut new_psize = round_(
            self.positions[SHORT][idx].size + order.qty,
            exchange_params.qty_step,
        );
        let mut adjusted_close_qty = order.qty;
        if new_psize > 0.0 {
            log::warn!(
                "close qty greater than psize short: {} {:?}",
                self.backtest_params.coins[idx],
                order
            );
            new_psize = 0.0;
            adjusted_close_qty = self.positions[SHORT][idx].size.abs();
        }
        let fee_paid = -qty_to_cost(adjusted_close_qty, exec_price, exchange_params.c_mult)
            * self.fee_rate(order.order_type);
        let pnl = calc_pnl_short(
            self.positions[SHORT][idx].price,
            exec_price,
            adjusted_close_qty,
            exchange_params.c_mult,
        );
        self.pnl_cumsum_running += pnl;
        self.pnl_cumsum_max = self.pnl_cumsum_max.max(self.pnl_cumsum_running);
        self.update_balance(k, pnl, fee_paid);

        let current_pprice = self.positions[SHORT][idx].price;
        if new_psize == 0.0 {
            self.positions[SHORT][idx] = Position::default();
        } else {
            self.positions[SHORT][idx].size = new_psize;
        }
        self.fills.push(Fill {
            index: k,
            coin: self.backtest_params.coins[idx].clone(),
            pnl,
            fee_paid,
            balance_usd_total: self.balance.usd_total,
            balance_usd: self.balance.usd,
            balance_btc: self.balance.btc,
            btc_price: self.btc_price(k),
            fill_qty: adjusted_close_qty,
            fill_price: exec_price,
            position_size: new_psize,
            position_price: current_pprice,
            order_type: order.order_type,
        });
    }

    fn process_entry_fill(&mut self, k: usize, idx: usize, pside: usize, order: &Order) {
        let exchange_params = self.exchange_params_list[idx].clone();
        let exec_price = self.execution_price(k, idx, order);
        let fee_paid = -qty_to_cost(order.qty, exec_price, exchange_params.c_mult)
            * self.fee_rate(order.order_type);
        self.update_balance(k, 0.0, fee_paid);

        let was_flat = self.positions[pside][idx].size == 0.0;
        let (new_psize, new_pprice) = calc_new_psize_pprice(
            self.positions[pside][idx].size,
            self.positions[pside][idx].price,
            order.qty,
            exec_price,
            exchange_params.qty_step,
        );
        self.positions[pside][idx].size = new_psize;
        self.positions[pside][idx].price = new_pprice;
        if was_flat {
            self.positions[pside][idx].opened_at = k;
        }
        self.fills.push(Fill {
            index: k,
            coin: self.backtest_params.coins[idx].clone(),
            pnl: 0.0,
            fee_paid,
            balance_usd_total: self.balance.usd_total,
            balance_usd: self.balance.usd,
            balance_btc: self.balance.btc,
            btc_price: self.btc_price(k),
            fill_qty: order.qty,
            fill_price: exec_price,
            position_size: new_psize,
            position_price: new_pprice,
            order_type: order.order_type,
        });
    }

    fn update_balance(&mut self, k: usize, mut pnl: f64, fee_paid: f64) {
        if self.balance.use_btc_collateral {
            let btc_price = self.btc_price(k);
            // fees always reduce the USD leg
            self.balance.usd += fee_paid;
            if pnl > 0.0 {
                // pay down USD debt first, convert the rest to BTC
                if self.balance.usd < 0.0 {
                    let offset_amount = pnl.min(-self.balance.usd);
                    self.balance.usd += offset_amount;
                    pnl -= offset_amount;
                }
                if pnl > 0.0 {
                    let btc_to_add = pnl / btc_price;
                    self.balance.btc += btc_to_add * 0.999; // spot conversion fee
                }
            } else if pnl < 0.0 {
                self.balance.usd += pnl;
            }
            self.balance.usd_total = self.balance.btc * btc_price + self.balance.usd;
            self.balance.btc_total = self.balance.usd_total / btc_price;
        } else {
            self.balance.usd += pnl + fee_paid;
            self.balance.usd_total = self.balance.usd;
            self.balance.btc_total = 0.0;
        }
    }

    fn update_indicators(&mut self, k: usize) {
        for idx in 0..self.n_coins {
            let open = self.hlcvs[[k, idx, OPEN]];
            let high = self.hlcvs[[k, idx, HIGH]];
            let low = self.hlcvs[[k, idx, LOW]];
            let close = self.hlcvs[[k, idx, CLOSE]];
            let volume = self.hlcvs[[k, idx, VOLUME]];
            if is_gap_candle(open, high, low, close, volume) {
                continue;
            }
            for pside in [LONG, SHORT] {
                self.price_emas[pside][idx].update(close);
                self.filter_emas[pside][idx].update(volume, high, low);
                self.hourly_log_range[pside][idx].update(high, low);
            }
        }
    }

    /// Recomputes the active symbol sets and redistributes the per-position
    /// exposure limit: `WEL = TWEL / effective_n_positions`.
    fn update_eligibility(&mut self, k: usize) {
        for pside in [LONG, SHORT] {
            if !self.trading_enabled[pside] {
                continue;
            }
            let (n_positions, volume_drop_pct, total_wallet_exposure_limit) = {
                let side_params = match pside {
                    LONG => &self.bot_params_pair.long,
                    _ => &self.bot_params_pair.short,
                };
                (
                    side_params.n_positions,
                    side_params.filter_volume_drop_pct,
                    side_params.total_wallet_exposure_limit,
                )
            };
            let mut held = SymbolSet::new(self.n_coins);
            for idx in 0..self.n_coins {
                if self.positions[pside][idx].size != 0.0 {
                    held.insert(idx);
                }
            }
            let scores: Vec<SymbolScore> = (0..self.n_coins)
                .map(|idx| SymbolScore {
                    idx,
                    tradable: self.is_tradable(k, idx),
                    volume_ema: self.filter_emas[pside][idx].volume.get(),
                    log_range_ema: self.filter_emas[pside][idx].log_range.get(),
                })
                .collect();
            let eligibility = select_eligible(&scores, &held, n_positions, volume_drop_pct);
            let wallet_exposure_limit =
                total_wallet_exposure_limit / eligibility.effective_n_positions as f64;
            self.wallet_exposure_limits[pside] = wallet_exposure_limit;
            for idx in 0..self.n_coins {
                self.bot_params[pside][idx].wallet_exposure_limit = wallet_exposure_limit;
            }
            self.eligibility[pside] = eligibility;
        }
    }

    fn update_trailing(&mut self, k: usize) {
        for pside in [LONG, SHORT] {
            for idx in 0..self.n_coins {
                if self.positions[pside][idx].size == 0.0 || self.did_fill[pside][idx] {
                    continue;
                }
                let open = self.hlcvs[[k, idx, OPEN]];
                let high = self.hlcvs[[k, idx, HIGH]];
                let low = self.hlcvs[[k, idx, LOW]];
                let close = self.hlcvs[[k, idx, CLOSE]];
                let volume = self.hlcvs[[k, idx, VOLUME]];
                if is_gap_candle(open, high, low, close, volume) {
                    continue;
                }
                update_trailing_prices(
                    &mut self.positions[pside][idx].trailing,
                    open,
                    high,
                    low,
                    close,
                );
            }
        }
    }

    fn update_open_orders(&mut self, k: usize) {
        for pside in [LONG, SHORT] {
            if !self.trading_enabled[pside] {
                continue;
            }
            for idx in 0..self.n_coins {
                self.update_symbol_orders(k, idx, pside);
            }
        }
        // at most one unstuck close per minute, across all symbols and sides
        if let Some((idx, pside, order)) = self.calc_unstucking_close(k) {
            if screen_order(&order, &self.exchange_params_list[idx]) == OrderCheck::Emit {
                self.open_orders[pside][idx].closes = vec![order];
            }
        }
    }

    fn update_symbol_orders(&mut self, k: usize, idx: usize, pside: usize) {
        let bot_params = self.bot_params[pside][idx].clone();
        let exchange_params = self.exchange_params_list[idx].clone();
        if bot_params.forced_mode == ForcedMode::Manual {
            // externally managed: leave the position alone
            self.open_orders[pside][idx] = OrderBundle::default();
            return;
        }
        let position = self.positions[pside][idx].clone();

        // force-close delisted symbols near their last traded price
        if let Some(delist_k) = self.delist_at[idx] {
            if k >= delist_k {
                self.open_orders[pside][idx] = OrderBundle::default();
                if position.size != 0.0 {
                    let price = match pside {
                        LONG => round_(
                            f64::min(
                                self.hlcvs[[k, idx, HIGH]] - exchange_params.price_step,
                                position.price,
                            ),
                            exchange_params.price_step,
                        ),
                        _ => round_(
                            f64::max(
                                self.hlcvs[[k, idx, LOW]] + exchange_params.price_step,
                                position.price,
                            ),
                            exchange_params.price_step,
                        ),
                    };
                    let order_type = match pside {
                        LONG => OrderType::CloseUnstuckLong,
                        _ => OrderType::CloseUnstuckShort,
                    };
                    self.open_orders[pside][idx].closes = vec![Order {
                        qty: -position.size,
                        price,
                        order_type,
                    }];
                }
                return;
            }
        }

        if bot_params.forced_mode == ForcedMode::Panic {
            self.open_orders[pside][idx] = OrderBundle::default();
            if position.size != 0.0 {
                let order_type = match pside {
                    LONG => OrderType::ClosePanicLong,
                    _ => OrderType::ClosePanicShort,
                };
                self.open_orders[pside][idx].closes = vec![Order {
                    qty: -position.size,
                    price: self.hlcvs[[k, idx, CLOSE]],
                    order_type,
                }];
            }
            return;
        }

        let state_params = self.create_state_params(k, idx, pside);
        let warm = self.price_emas[pside][idx].bands().is_some();
        let entries_allowed = bot_params.forced_mode.entries_allowed()
            && warm
            && self.is_tradable(k, idx)
            && self.eligibility[pside].entry_eligible.contains(idx);

        let mut entries = Vec::new();
        if entries_allowed {
            let next_entry =
                calc_next_entry(pside, &exchange_params, &state_params, &bot_params, &position);
            // materialize the full ladder only when the next candle is known
            // to reach the first rung
            if self.order_filled(k + 1, idx, &next_entry)
                && is_grid_expandable(&next_entry, pside)
            {
                entries = calc_entry_ladder(
                    pside,
                    &exchange_params,
                    &state_params,
                    &bot_params,
                    &position,
                );
            } else {
                entries = vec![next_entry];
            }
        }

        let mut closes = Vec::new();
        if position.size != 0.0 {
            let next_close =
                calc_next_close(pside, &exchange_params, &state_params, &bot_params, &position);
            if self.order_filled(k + 1, idx, &next_close)
                && is_grid_expandable(&next_close, pside)
            {
                closes = calc_close_ladder(
                    pside,
                    &exchange_params,
                    &state_params,
                    &bot_params,
                    &position,
                );
            } else {
                closes = vec![next_close];
            }
        }

        let coin = &self.backtest_params.coins[idx];
        entries.retain(|order| match screen_order(order, &exchange_params) {
            OrderCheck::Emit => true,
            OrderCheck::Skip(SkipReason::ZeroQty) => false,
            OrderCheck::Skip(reason) => {
                log::debug!("skipping entry {} for {}: {:?}", order.order_type, coin, reason);
                false
            }
        });
        closes.retain(|order| match screen_order(order, &exchange_params) {
            OrderCheck::Emit => true,
            OrderCheck::Skip(SkipReason::ZeroQty) => false,
            OrderCheck::Skip(reason) => {
                log::debug!("skipping close {} for {}: {:?}", order.order_type, coin, reason);
                false
            }
        });
        // ladders come price-sorted; rank keeps auto-reduce ahead of the rest
        closes.sort_by_key(|order| order.order_type.fill_rank());

        self.open_orders[pside][idx] = OrderBundle { entries, closes };
    }

    fn calc_unstucking_close(&self, k: usize) -> Option<(usize, usize, Order)> {
        let mut views: Vec<StuckPositionView> = Vec::new();
        for pside in [LONG, SHORT] {
            if !self.trading_enabled[pside] {
                continue;
            }
            for idx in 0..self.n_coins {
                let position = &self.positions[pside][idx];
                if position.size == 0.0 {
                    continue;
                }
                let mode = self.bot_params[pside][idx].forced_mode;
                if matches!(mode, ForcedMode::Manual | ForcedMode::Panic) {
                    continue;
                }
                let Some(bands) = self.price_emas[pside][idx].bands() else {
                    continue;
                };
                let first_close = self.open_orders[pside][idx].closes.first();
                views.push(StuckPositionView {
                    idx,
                    pside,
                    position_size: position.size.abs(),
                    position_price: position.price,
                    mark_price: self.hlcvs[[k, idx, CLOSE]],
                    ema_band: match pside {
                        LONG => bands.upper,
                        _ => bands.lower,
                    },
                    first_close_price: first_close.map_or(0.0, |o| o.price),
                    first_close_qty: first_close.map_or(0.0, |o| o.qty),
                });
            }
        }
        if views.is_empty() {
            return None;
        }
        let mut pair = self.bot_params_pair.clone();
        pair.long.wallet_exposure_limit = self.wallet_exposure_limits[LONG];
        pair.short.wallet_exposure_limit = self.wallet_exposure_limits[SHORT];
        select_unstuck_close(
            &pair,
            &self.exchange_params_list,
            self.balance_quote(),
            self.pnl_cumsum_max,
            self.pnl_cumsum_running,
            &views,
        )
    }

    /// Commits the minute: equity, observation row, bankruptcy check.
    fn commit_minute(&mut self, k: usize) -> EngineResult<StepStatus> {
        let btc_price = self.btc_price(k);
        let mut equity_usd = self.balance.usd_total;
        let mut equity_btc = self.balance.btc_total;
        let mut snapshots = Vec::new();
        for pside in [LONG, SHORT] {
            for idx in 0..self.n_coins {
                let position = &self.positions[pside][idx];
                if position.size == 0.0 {
                    continue;
                }
                let current_price = self.hlcvs[[k, idx, CLOSE]];
                let c_mult = self.exchange_params_list[idx].c_mult;
                let upnl = match pside {
                    LONG => calc_pnl_long(position.price, current_price, position.size, c_mult),
                    _ => calc_pnl_short(position.price, current_price, position.size, c_mult),
                };
                equity_usd += upnl;
                equity_btc += upnl / btc_price;
                snapshots.push(PositionSnapshot {
                    idx,
                    side: pside,
                    size: position.size,
                    price: position.price,
                    wallet_exposure: calc_wallet_exposure(
                        c_mult,
                        self.balance_quote(),
                        position.size.abs(),
                        position.price,
                    ),
                });
            }
        }
        if !equity_usd.is_finite() || !self.balance.usd_total.is_finite() {
            return Err(EngineError::Degenerate {
                index: k,
                context: format!(
                    "equity {} balance {}",
                    equity_usd, self.balance.usd_total
                ),
            });
        }
        self.equities.usd.push(equity_usd);
        self.equities.btc.push(equity_btc);
        self.observations.push(MinuteObservation {
            index: k,
            balance: self.balance_quote(),
            equity: equity_usd,
            positions: snapshots,
        });
        let liquidation_floor =
            self.backtest_params.starting_balance * self.backtest_params.liquidation_buffer;
        if equity_usd <= liquidation_floor {
            self.bankruptcy = Some(k);
            return Ok(StepStatus::Bankrupt);
        }
        Ok(StepStatus::Running)
    }
}

/// Grid and initial orders have successors worth materializing; trailing,
/// unstuck, and market kinds do not.
fn is_grid_expandable(order: &Order, pside: usize) -> bool {
    if order.qty == 0.0 {
        return false;
    }
    match pside {
        LONG => {
            if order.qty > 0.0 {
                matches!(
                    order.order_type,
                    OrderType::EntryGridNormalLong
                        | OrderType::EntryInitialNormalLong
                        | OrderType::EntryInitialPartialLong
                )
            } else {
                order.order_type == OrderType::CloseGridLong
            }
        }
        _ => {
            if order.qty < 0.0 {
                matches!(
                    order.order_type,
                    OrderType::EntryGridNormalShort
                        | OrderType::EntryInitialNormalShort
                        | OrderType::EntryInitialPartialShort
                )
            } else {
                order.order_type == OrderType::CloseGridShort
            }
        }
    }
}

fn side_wallet_exposure_limit(side: &BotParams) -> f64 {
    if side.n_positions == 0 {
        0.0
    } else {
        side.total_wallet_exposure_limit / side.n_positions as f64
    }
}

fn validate_exchange_params(idx: usize, p: &ExchangeParams) -> EngineResult<()> {
    let fields = [
        ("qty_step", p.qty_step),
        ("price_step", p.price_step),
        ("min_qty", p.min_qty),
        ("min_cost", p.min_cost),
        ("c_mult", p.c_mult),
    ];
    for (name, value) in fields {
        if !value.is_finite() {
            return Err(EngineError::Market {
                symbol: idx,
                reason: format!("{} is not finite", name),
            });
        }
    }
    if p.qty_step <= 0.0 || p.price_step <= 0.0 || p.c_mult <= 0.0 {
        return Err(EngineError::Market {
            symbol: idx,
            reason: "qty_step, price_step and c_mult must be positive".to_string(),
        });
    }
    if p.min_qty < 0.0 || p.min_cost < 0.0 {
        return Err(EngineError::Market {
            symbol: idx,
            reason: "min_qty and min_cost must be non-negative".to_string(),
        });
    }
    Ok(())
}

fn validate_backtest_params(p: &BacktestParams) -> EngineResult<()> {
    if !p.starting_balance.is_finite() || p.starting_balance <= 0.0 {
        return Err(EngineError::Config(
            "starting_balance must be positive".to_string(),
        ));
    }
    if !p.maker_fee.is_finite() || !p.taker_fee.is_finite() || !p.fee_multiplier.is_finite() {
        return Err(EngineError::Config("fee parameters must be finite".to_string()));
    }
    if p.fee_multiplier < 0.0 {
        return Err(EngineError::Config(
            "fee_multiplier must be non-negative".to_string(),
        ));
    }
    if !(0.0..1.0).contains(&p.liquidation_buffer) {
        return Err(EngineError::Config(
            "liquidation_buffer must be in [0, 1)".to_string(),
        ));
    }
    if !p.ema_warmup_ratio.is_finite() || p.ema_warmup_ratio < 0.0 {
        return Err(EngineError::Config(
            "ema_warmup_ratio must be non-negative".to_string(),
        ));
    }
    Ok(())
}

fn validate_bot_params(side: &str, p: &BotParams) -> EngineResult<()> {
    let trading = p.total_wallet_exposure_limit > 0.0 && p.n_positions > 0;
    if p.total_wallet_exposure_limit < 0.0 {
        return Err(EngineError::Config(format!(
            "{}: total_wallet_exposure_limit must be non-negative",
            side
        )));
    }
    if !trading {
        return Ok(());
    }
    if p.ema_span_0 < 1.0 || p.ema_span_1 < 1.0 {
        return Err(EngineError::Config(format!(
            "{}: ema spans must be at least one minute",
            side
        )));
    }
    if p.entry_initial_qty_pct <= 0.0 {
        return Err(EngineError::Config(format!(
            "{}: entry_initial_qty_pct must be positive",
            side
        )));
    }
    if p.entry_grid_spacing_pct < 0.0 {
        return Err(EngineError::Config(format!(
            "{}: entry_grid_spacing_pct must be non-negative",
            side
        )));
    }
    if p.close_grid_markup_start == 0.0 && p.close_grid_markup_end == 0.0 {
        return Err(EngineError::Config(format!(
            "{}: close_grid_markup_start and close_grid_markup_end are both zero",
            side
        )));
    }
    for (name, ratio) in [
        ("entry_trailing_grid_ratio", p.entry_trailing_grid_ratio),
        ("close_trailing_grid_ratio", p.close_trailing_grid_ratio),
    ] {
        if !(-1.0..=1.0).contains(&ratio) {
            return Err(EngineError::Config(format!(
                "{}: {} must be within [-1, 1]",
                side, name
            )));
        }
    }
    if !(0.0..=1.0).contains(&p.filter_volume_drop_pct) {
        return Err(EngineError::Config(format!(
            "{}: filter_volume_drop_pct must be within [0, 1]",
            side
        )));
    }
    if p.filter_volume_ema_span < 1.0 || p.filter_log_range_ema_span < 1.0 {
        return Err(EngineError::Config(format!(
            "{}: filter ema spans must be at least one minute",
            side
        )));
    }
    if p.grid_log_range_ema_span_hours < 1.0 {
        return Err(EngineError::Config(format!(
            "{}: grid_log_range_ema_span_hours must be at least one hour",
            side
        )));
    }
    if p.unstuck_threshold < 0.0
        || p.unstuck_close_pct < 0.0
        || p.unstuck_loss_allowance_pct < 0.0
    {
        return Err(EngineError::Config(format!(
            "{}: unstuck parameters must be non-negative",
            side
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn flat_tape(n_minutes: usize, price: f64) -> Array3<f64> {
        let mut arr = Array3::zeros((n_minutes, 1, 5));
        for k in 0..n_minutes {
            arr[[k, 0, OPEN]] = price;
            arr[[k, 0, HIGH]] = price;
            arr[[k, 0, LOW]] = price;
            arr[[k, 0, CLOSE]] = price;
            arr[[k, 0, VOLUME]] = 1_000_000.0;
        }
        arr
    }

    fn side_params() -> BotParams {
        BotParams {
            ema_span_0: 5.0,
            ema_span_1: 10.0,
            entry_initial_qty_pct: 0.15,
            entry_grid_double_down_factor: 1.0,
            entry_grid_spacing_pct: 0.02,
            close_grid_markup_start: 0.01,
            close_grid_markup_end: 0.02,
            close_grid_qty_pct: 1.0,
            unstuck_threshold: 0.9,
            unstuck_close_pct: 0.1,
            unstuck_loss_allowance_pct: 0.01,
            filter_volume_ema_span: 60.0,
            filter_log_range_ema_span: 60.0,
            grid_log_range_ema_span_hours: 4.0,
            n_positions: 1,
            total_wallet_exposure_limit: 2.0,
            ..BotParams::default()
        }
    }

    fn exchange() -> ExchangeParams {
        ExchangeParams {
            qty_step: 0.001,
            price_step: 0.01,
            min_qty: 0.001,
            min_cost: 0.0,
            c_mult: 1.0,
        }
    }

    #[test]
    fn test_panic_mode_closes_position_at_market() {
        let hlcvs = flat_tape(40, 100.0);
        let view = hlcvs.view();
        let pair = BotParamsPair {
            long: side_params(),
            short: BotParams::default(),
        };
        let mut backtest = Backtest::new(
            &view,
            None,
            pair,
            vec![exchange()],
            &[],
            BacktestParams::default(),
        )
        .unwrap();
        backtest.bot_params[LONG][0].forced_mode = ForcedMode::Panic;
        backtest.positions[LONG][0] = Position {
            size: 2.0,
            price: 100.0,
            ..Position::default()
        };
        backtest.update_symbol_orders(15, 0, LONG);
        let closes = &backtest.open_orders[LONG][0].closes;
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].order_type, OrderType::ClosePanicLong);
        assert_eq!(closes[0].qty, -2.0);
        assert!(backtest.open_orders[LONG][0].entries.is_empty());

        backtest.check_for_fills(16);
        assert_eq!(backtest.fills.len(), 1);
        // market kind executes at the candle open
        assert_eq!(backtest.fills[0].fill_price, 100.0);
        assert_eq!(backtest.fills[0].position_size, 0.0);
        assert!(backtest.positions[LONG][0].is_flat());
    }

    #[test]
    fn test_unstuck_replaces_resting_close() {
        let hlcvs = flat_tape(40, 90.0);
        let view = hlcvs.view();
        let pair = BotParamsPair {
            long: side_params(),
            short: BotParams::default(),
        };
        let mut backtest = Backtest::new(
            &view,
            None,
            pair,
            vec![exchange()],
            &[],
            BacktestParams::default(),
        )
        .unwrap();
        for k in 1..20 {
            backtest.update_indicators(k);
        }
        // deep under-water long: entry averaged at 100, mark at 90
        backtest.positions[LONG][0] = Position {
            size: 8.0,
            price: 100.0,
            ..Position::default()
        };
        backtest.wallet_exposure_limits[LONG] = 0.5;
        backtest.bot_params[LONG][0].wallet_exposure_limit = 0.5;
        backtest.bot_params_pair.long.wallet_exposure_limit = 0.5;
        backtest.update_symbol_orders(20, 0, LONG);
        // grid TP rests above the mark: unreachable, so unstuck fires
        let resting = backtest.open_orders[LONG][0].closes[0].clone();
        assert_eq!(resting.order_type, OrderType::CloseGridLong);
        assert!(resting.price > 90.0);

        let (idx, pside, order) = backtest.calc_unstucking_close(20).expect("stuck");
        assert_eq!((idx, pside), (0, LONG));
        assert_eq!(order.order_type, OrderType::CloseUnstuckLong);
        // band of a flat 90 tape is 90: the close undercuts the resting TP
        assert!(order.price < resting.price);
        assert!((order.qty + 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_closes_fill_before_entries() {
        let mut hlcvs = flat_tape(40, 100.0);
        // wide candle at minute 16 reaches both resting orders
        hlcvs[[16, 0, HIGH]] = 102.0;
        hlcvs[[16, 0, LOW]] = 98.0;
        let view = hlcvs.view();
        let pair = BotParamsPair {
            long: side_params(),
            short: BotParams::default(),
        };
        let mut backtest = Backtest::new(
            &view,
            None,
            pair,
            vec![exchange()],
            &[],
            BacktestParams::default(),
        )
        .unwrap();
        backtest.positions[LONG][0] = Position {
            size: 2.0,
            price: 100.0,
            ..Position::default()
        };
        backtest.open_orders[LONG][0] = OrderBundle {
            entries: vec![Order {
                qty: 1.0,
                price: 99.0,
                order_type: OrderType::EntryGridNormalLong,
            }],
            closes: vec![Order {
                qty: -1.0,
                price: 101.0,
                order_type: OrderType::CloseGridLong,
            }],
        };
        backtest.check_for_fills(16);
        assert_eq!(backtest.fills.len(), 2);
        assert_eq!(backtest.fills[0].order_type, OrderType::CloseGridLong);
        assert_eq!(backtest.fills[1].order_type, OrderType::EntryGridNormalLong);
        // trailing extrema were reset by the fills
        assert_eq!(
            backtest.positions[LONG][0].trailing.max_since_open,
            TrailingPriceBundle::default().max_since_open
        );
    }
}
