/// Position side indices. Used to index per-side arrays and to tag
/// side-agnostic helpers.
pub const LONG: usize = 0;
pub const SHORT: usize = 1;

/// Field indices of the third axis of the OHLCV candle matrix.
pub const OPEN: usize = 0;
pub const HIGH: usize = 1;
pub const LOW: usize = 2;
pub const CLOSE: usize = 3;
pub const VOLUME: usize = 4;

/// Number of fields per candle.
pub const N_FIELDS: usize = 5;

/// Minutes per day, used for daily aggregation in analysis.
pub const MINUTES_PER_DAY: usize = 1440;

/// Minutes per hour, used by the hourly log-range EMA.
pub const MINUTES_PER_HOUR: usize = 60;

/// Balance is never allowed below this, to keep exposure ratios finite.
pub const BALANCE_FLOOR: f64 = 1e-12;

/// Wallet exposure may overshoot its per-position limit by this factor
/// before corrective action (rung cropping, auto-reduce) engages.
pub const WE_OVERSHOOT_TOLERANCE: f64 = 1.01;
