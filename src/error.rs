use thiserror::Error;

/// Fatal failure classes of the engine. Anything recoverable (min-cost
/// rejections, untriggered trailing orders) is expressed as an
/// [`crate::types::OrderCheck`] instead of an error, and bankruptcy is a
/// clean stop reported through [`crate::backtest::BacktestOutput`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// Out-of-range or mutually inconsistent configuration. Raised at init.
    #[error("invalid config: {0}")]
    Config(String),

    /// Exchange rules missing or unusable for a symbol present in the stream.
    #[error("invalid market rules for symbol index {symbol}: {reason}")]
    Market { symbol: usize, reason: String },

    /// Malformed candle: `low > high`, negative volume, or non-finite field.
    #[error("malformed candle at minute {index}, symbol index {symbol}: {reason}")]
    Candle {
        index: usize,
        symbol: usize,
        reason: String,
    },

    /// NaN or infinity surfaced in wallet state at a minute boundary.
    #[error("numerically degenerate state at minute {index}: {context}")]
    Degenerate { index: usize, context: String },
}

pub type EngineResult<T> = Result<T, EngineError>;
