use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::{LONG, SHORT};

/// Per-symbol exchange rules. Immutable during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeParams {
    pub qty_step: f64,
    pub price_step: f64,
    pub min_qty: f64,
    pub min_cost: f64,
    pub c_mult: f64,
}

impl Default for ExchangeParams {
    fn default() -> Self {
        ExchangeParams {
            qty_step: 0.00001,
            price_step: 0.00001,
            min_qty: 0.00001,
            min_cost: 1.0,
            c_mult: 1.0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OrderBook {
    pub bid: f64,
    pub ask: f64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EMABands {
    pub upper: f64,
    pub lower: f64,
}

/// Snapshot of wallet and market state consumed by the pure order math.
/// Owned by the driver; order math borrows it read-only.
#[derive(Debug, Default, Clone)]
pub struct StateParams {
    pub balance: f64,
    pub order_book: OrderBook,
    pub ema_bands: EMABands,
    /// Hourly EMA of `ln(high/low)`, modulating grid spacing.
    pub grid_log_range: f64,
}

/// Price extrema tracked while a position is open. Reset on every position
/// size change; the sentinels mean "not yet populated".
#[derive(Debug, Clone, Copy)]
pub struct TrailingPriceBundle {
    pub min_since_open: f64,
    pub max_since_min: f64,
    pub max_since_open: f64,
    pub min_since_max: f64,
}

impl Default for TrailingPriceBundle {
    fn default() -> Self {
        TrailingPriceBundle {
            min_since_open: f64::INFINITY,
            max_since_min: 0.0,
            max_since_open: 0.0,
            min_since_max: f64::INFINITY,
        }
    }
}

/// Position state for one (symbol, side). `size == 0.0 && price == 0.0` is
/// the flat state. Trailing extrema live inside the position so their
/// lifetime is tied to it.
#[derive(Debug, Clone)]
pub struct Position {
    /// Signed size: positive for longs, negative for shorts.
    pub size: f64,
    /// Average entry price, stored full precision.
    pub price: f64,
    /// Minute index at which the position was opened.
    pub opened_at: usize,
    pub trailing: TrailingPriceBundle,
}

impl Default for Position {
    fn default() -> Self {
        Position {
            size: 0.0,
            price: 0.0,
            opened_at: 0,
            trailing: TrailingPriceBundle::default(),
        }
    }
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.size == 0.0
    }
}

/// The 24 concrete order kinds plus the empty sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    EntryInitialNormalLong,
    EntryInitialPartialLong,
    EntryGridNormalLong,
    EntryGridCroppedLong,
    EntryGridInflatedLong,
    EntryTrailingNormalLong,
    EntryTrailingCroppedLong,
    CloseGridLong,
    CloseTrailingLong,
    CloseUnstuckLong,
    CloseAutoReduceLong,
    ClosePanicLong,

    EntryInitialNormalShort,
    EntryInitialPartialShort,
    EntryGridNormalShort,
    EntryGridCroppedShort,
    EntryGridInflatedShort,
    EntryTrailingNormalShort,
    EntryTrailingCroppedShort,
    CloseGridShort,
    CloseTrailingShort,
    CloseUnstuckShort,
    CloseAutoReduceShort,
    ClosePanicShort,

    Empty,
}

impl OrderType {
    /// Market-kind orders execute at the candle open and pay taker fee.
    pub fn is_market(&self) -> bool {
        matches!(
            self,
            OrderType::CloseAutoReduceLong
                | OrderType::CloseAutoReduceShort
                | OrderType::ClosePanicLong
                | OrderType::ClosePanicShort
        )
    }

    pub fn is_entry(&self) -> bool {
        matches!(
            self,
            OrderType::EntryInitialNormalLong
                | OrderType::EntryInitialPartialLong
                | OrderType::EntryGridNormalLong
                | OrderType::EntryGridCroppedLong
                | OrderType::EntryGridInflatedLong
                | OrderType::EntryTrailingNormalLong
                | OrderType::EntryTrailingCroppedLong
                | OrderType::EntryInitialNormalShort
                | OrderType::EntryInitialPartialShort
                | OrderType::EntryGridNormalShort
                | OrderType::EntryGridCroppedShort
                | OrderType::EntryGridInflatedShort
                | OrderType::EntryTrailingNormalShort
                | OrderType::EntryTrailingCroppedShort
        )
    }

    pub fn is_close(&self) -> bool {
        !self.is_entry() && *self != OrderType::Empty
    }

    /// Fill precedence within a minute: auto-reduce, then unstuck/panic,
    /// then regular closes, then entries.
    pub fn fill_rank(&self) -> u8 {
        match self {
            OrderType::CloseAutoReduceLong | OrderType::CloseAutoReduceShort => 0,
            OrderType::CloseUnstuckLong
            | OrderType::CloseUnstuckShort
            | OrderType::ClosePanicLong
            | OrderType::ClosePanicShort => 1,
            t if t.is_close() => 2,
            _ => 3,
        }
    }

    pub fn side(&self) -> Option<usize> {
        match self {
            OrderType::Empty => None,
            OrderType::EntryInitialNormalLong
            | OrderType::EntryInitialPartialLong
            | OrderType::EntryGridNormalLong
            | OrderType::EntryGridCroppedLong
            | OrderType::EntryGridInflatedLong
            | OrderType::EntryTrailingNormalLong
            | OrderType::EntryTrailingCroppedLong
            | OrderType::CloseGridLong
            | OrderType::CloseTrailingLong
            | OrderType::CloseUnstuckLong
            | OrderType::CloseAutoReduceLong
            | OrderType::ClosePanicLong => Some(LONG),
            _ => Some(SHORT),
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            OrderType::EntryInitialNormalLong => "entry_initial_normal_long",
            OrderType::EntryInitialPartialLong => "entry_initial_partial_long",
            OrderType::EntryGridNormalLong => "entry_grid_normal_long",
            OrderType::EntryGridCroppedLong => "entry_grid_cropped_long",
            OrderType::EntryGridInflatedLong => "entry_grid_inflated_long",
            OrderType::EntryTrailingNormalLong => "entry_trailing_normal_long",
            OrderType::EntryTrailingCroppedLong => "entry_trailing_cropped_long",
            OrderType::CloseGridLong => "close_grid_long",
            OrderType::CloseTrailingLong => "close_trailing_long",
            OrderType::CloseUnstuckLong => "close_unstuck_long",
            OrderType::CloseAutoReduceLong => "close_auto_reduce_long",
            OrderType::ClosePanicLong => "close_panic_long",
            OrderType::EntryInitialNormalShort => "entry_initial_normal_short",
            OrderType::EntryInitialPartialShort => "entry_initial_partial_short",
            OrderType::EntryGridNormalShort => "entry_grid_normal_short",
            OrderType::EntryGridCroppedShort => "entry_grid_cropped_short",
            OrderType::EntryGridInflatedShort => "entry_grid_inflated_short",
            OrderType::EntryTrailingNormalShort => "entry_trailing_normal_short",
            OrderType::EntryTrailingCroppedShort => "entry_trailing_cropped_short",
            OrderType::CloseGridShort => "close_grid_short",
            OrderType::CloseTrailingShort => "close_trailing_short",
            OrderType::CloseUnstuckShort => "close_unstuck_short",
            OrderType::CloseAutoReduceShort => "close_auto_reduce_short",
            OrderType::ClosePanicShort => "close_panic_short",
            OrderType::Empty => "empty",
        };
        write!(f, "{}", s)
    }
}

/// Which mechanism the trailing-vs-grid blend selects for the current
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mechanism {
    Grid,
    Trailing,
}

/// A resting order produced for the current minute. Orders are regenerated
/// every minute; they are not persistent objects.
#[derive(Debug, Clone)]
pub struct Order {
    /// Signed: positive buys, negative sells.
    pub qty: f64,
    pub price: f64,
    pub order_type: OrderType,
}

impl Default for Order {
    fn default() -> Self {
        Order {
            qty: 0.0,
            price: 0.0,
            order_type: OrderType::Empty,
        }
    }
}

/// Screening outcome for a generated order. Replaces exception-style control
/// flow: a min-cost rejection is a skip, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderCheck {
    Emit,
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ZeroQty,
    BelowMinQty,
    BelowMinCost,
    NonPositivePrice,
}

/// Per-side operating mode forced from the outside.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForcedMode {
    #[default]
    Normal,
    /// The engine neither places orders nor touches the position.
    Manual,
    /// Entries suppressed; the position winds down through normal closes.
    GracefulStop,
    /// Entries suppressed; take-profit closes only.
    TakeProfitOnly,
    /// Close the whole position at market immediately.
    Panic,
}

impl ForcedMode {
    pub fn entries_allowed(&self) -> bool {
        matches!(self, ForcedMode::Normal)
    }
}

impl FromStr for ForcedMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "n" | "normal" => Ok(ForcedMode::Normal),
            "m" | "manual" => Ok(ForcedMode::Manual),
            "gs" | "graceful_stop" => Ok(ForcedMode::GracefulStop),
            "t" | "tp_only" => Ok(ForcedMode::TakeProfitOnly),
            "p" | "panic" => Ok(ForcedMode::Panic),
            other => Err(format!("unknown forced mode '{}'", other)),
        }
    }
}

/// Per-side strategy parameters. `wallet_exposure_limit` is derived by the
/// driver every minute (`TWEL / effective_n_positions`); all other fields
/// are frozen at init.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotParams {
    pub ema_span_0: f64,
    pub ema_span_1: f64,

    pub entry_initial_ema_dist: f64,
    pub entry_initial_qty_pct: f64,
    pub entry_grid_double_down_factor: f64,
    pub entry_grid_spacing_pct: f64,
    pub entry_grid_spacing_we_weight: f64,
    pub entry_grid_spacing_log_weight: f64,
    pub entry_trailing_threshold_pct: f64,
    pub entry_trailing_retracement_pct: f64,
    pub entry_trailing_double_down_factor: f64,
    pub entry_trailing_grid_ratio: f64,

    pub close_grid_markup_start: f64,
    pub close_grid_markup_end: f64,
    pub close_grid_qty_pct: f64,
    pub close_trailing_threshold_pct: f64,
    pub close_trailing_retracement_pct: f64,
    pub close_trailing_qty_pct: f64,
    pub close_trailing_grid_ratio: f64,

    pub unstuck_threshold: f64,
    pub unstuck_close_pct: f64,
    pub unstuck_ema_dist: f64,
    pub unstuck_loss_allowance_pct: f64,

    pub filter_volume_drop_pct: f64,
    pub filter_volume_ema_span: f64,
    pub filter_log_range_ema_span: f64,
    pub grid_log_range_ema_span_hours: f64,

    pub n_positions: usize,
    pub total_wallet_exposure_limit: f64,
    pub wallet_exposure_limit: f64,
    pub enforce_exposure_limit: bool,
    pub forced_mode: ForcedMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotParamsPair {
    pub long: BotParams,
    pub short: BotParams,
}

/// Partial per-symbol config, merged into the side's [`BotParams`] eagerly
/// at run init. Only fields that make sense per symbol are overridable;
/// position counts, exposure totals, unstuck budgeting, and the forager
/// filters stay global (the unstuck scheduler and symbol selection work
/// across positions).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotParamsOverride {
    pub ema_span_0: Option<f64>,
    pub ema_span_1: Option<f64>,
    pub entry_initial_ema_dist: Option<f64>,
    pub entry_initial_qty_pct: Option<f64>,
    pub entry_grid_double_down_factor: Option<f64>,
    pub entry_grid_spacing_pct: Option<f64>,
    pub entry_grid_spacing_we_weight: Option<f64>,
    pub entry_grid_spacing_log_weight: Option<f64>,
    pub entry_trailing_threshold_pct: Option<f64>,
    pub entry_trailing_retracement_pct: Option<f64>,
    pub entry_trailing_double_down_factor: Option<f64>,
    pub entry_trailing_grid_ratio: Option<f64>,
    pub close_grid_markup_start: Option<f64>,
    pub close_grid_markup_end: Option<f64>,
    pub close_grid_qty_pct: Option<f64>,
    pub close_trailing_threshold_pct: Option<f64>,
    pub close_trailing_retracement_pct: Option<f64>,
    pub close_trailing_qty_pct: Option<f64>,
    pub close_trailing_grid_ratio: Option<f64>,
    pub forced_mode: Option<ForcedMode>,
}

impl BotParamsOverride {
    pub fn apply(&self, base: &BotParams) -> BotParams {
        let mut p = base.clone();
        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = self.$field { p.$field = v; })*
            };
        }
        merge!(
            ema_span_0,
            ema_span_1,
            entry_initial_ema_dist,
            entry_initial_qty_pct,
            entry_grid_double_down_factor,
            entry_grid_spacing_pct,
            entry_grid_spacing_we_weight,
            entry_grid_spacing_log_weight,
            entry_trailing_threshold_pct,
            entry_trailing_retracement_pct,
            entry_trailing_double_down_factor,
            entry_trailing_grid_ratio,
            close_grid_markup_start,
            close_grid_markup_end,
            close_grid_qty_pct,
            close_trailing_threshold_pct,
            close_trailing_retracement_pct,
            close_trailing_qty_pct,
            close_trailing_grid_ratio,
            forced_mode,
        );
        p
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotParamsOverridePair {
    pub long: BotParamsOverride,
    pub short: BotParamsOverride,
}

/// Run-level parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestParams {
    pub starting_balance: f64,
    pub maker_fee: f64,
    pub taker_fee: f64,
    /// Stress-test knob; scales both fee rates.
    pub fee_multiplier: f64,
    /// The run stops once `equity <= starting_balance * liquidation_buffer`.
    /// 0.0 means plain bankruptcy at zero equity.
    pub liquidation_buffer: f64,
    /// EMA bands stay undefined until
    /// `ceil(ema_warmup_ratio * max(ema_span_0, ema_span_1))` minutes have
    /// been observed. Capped at 1.0.
    pub ema_warmup_ratio: f64,
    pub coins: Vec<String>,
}

impl Default for BacktestParams {
    fn default() -> Self {
        BacktestParams {
            starting_balance: 1000.0,
            maker_fee: 0.0002,
            taker_fee: 0.00055,
            fee_multiplier: 1.0,
            liquidation_buffer: 0.0,
            ema_warmup_ratio: 1.0,
            coins: Vec::new(),
        }
    }
}

/// Wallet state. In BTC-collateral mode realized profit accumulates as BTC
/// and realized loss (and fees) as USD debt; otherwise only `usd` moves.
#[derive(Debug, Default, Clone)]
pub struct Balance {
    pub usd: f64,
    pub btc: f64,
    pub usd_total: f64,
    pub btc_total: f64,
    pub use_btc_collateral: bool,
}

/// One executed fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub index: usize,
    pub coin: String,
    pub pnl: f64,
    pub fee_paid: f64,
    pub balance_usd_total: f64,
    pub balance_usd: f64,
    pub balance_btc: f64,
    pub btc_price: f64,
    pub fill_qty: f64,
    pub fill_price: f64,
    pub position_size: f64,
    pub position_price: f64,
    pub order_type: OrderType,
}

/// Minute-resolution equity series, one entry per simulated minute.
#[derive(Debug, Clone, Default)]
pub struct Equities {
    pub usd: Vec<f64>,
    pub btc: Vec<f64>,
}

/// Sparse per-symbol position snapshot; symbols without an open position
/// are omitted (absence means flat).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub idx: usize,
    pub side: usize,
    pub size: f64,
    pub price: f64,
    pub wallet_exposure: f64,
}

/// One row of the minute observation stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinuteObservation {
    pub index: usize,
    pub balance: f64,
    pub equity: f64,
    pub positions: Vec<PositionSnapshot>,
}

/// Aggregate performance metrics. `_w` fields are the mean over the ten
/// overlapping tail subsets of the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Analysis {
    pub adg: f64,
    pub adg_w: f64,
    pub mdg: f64,
    pub mdg_w: f64,
    pub gain: f64,
    pub sharpe_ratio: f64,
    pub sharpe_ratio_w: f64,
    pub sortino_ratio: f64,
    pub sortino_ratio_w: f64,
    pub omega_ratio: f64,
    pub omega_ratio_w: f64,
    pub calmar_ratio: f64,
    pub calmar_ratio_w: f64,
    pub sterling_ratio: f64,
    pub sterling_ratio_w: f64,
    pub expected_shortfall_1pct: f64,
    pub drawdown_worst: f64,
    pub drawdown_worst_mean_1pct: f64,
    pub equity_balance_diff_neg_max: f64,
    pub equity_balance_diff_neg_mean: f64,
    pub equity_balance_diff_pos_max: f64,
    pub equity_balance_diff_pos_mean: f64,
    pub loss_profit_ratio: f64,
    pub loss_profit_ratio_w: f64,
    pub positions_held_per_day: f64,
    pub position_held_hours_mean: f64,
    pub position_held_hours_median: f64,
    pub position_held_hours_max: f64,
    pub position_unchanged_hours_max: f64,
    pub volume_pct_per_day_avg: f64,
    pub volume_pct_per_day_avg_w: f64,
    pub equity_choppiness: f64,
    pub equity_choppiness_w: f64,
    pub equity_jerkiness: f64,
    pub equity_jerkiness_w: f64,
    pub exponential_fit_error: f64,
    pub exponential_fit_error_w: f64,
}
