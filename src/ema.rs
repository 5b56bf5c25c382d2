use crate::constants::MINUTES_PER_HOUR;
use crate::types::EMABands;
use crate::utils::clamp_decimals;

/// Exponential moving average with bias correction during warm-up.
///
/// The raw recurrence starts from zero, so early readings are biased low.
/// Dividing by the accumulated weight `1 - (1-alpha)^t` removes the bias:
/// after `t` identical samples the corrected value equals the sample.
#[derive(Debug, Clone, Copy)]
pub struct CorrectedEma {
    alpha: f64,
    value: f64,
    weight: f64,
    count: u64,
}

impl CorrectedEma {
    pub fn new(span: f64) -> Self {
        let span = span.max(1.0);
        CorrectedEma {
            alpha: 2.0 / (span + 1.0),
            value: 0.0,
            weight: 0.0,
            count: 0,
        }
    }

    pub fn update(&mut self, x: f64) {
        self.value = self.value * (1.0 - self.alpha) + x * self.alpha;
        self.weight = self.weight * (1.0 - self.alpha) + self.alpha;
        self.count += 1;
    }

    /// Bias-corrected reading; 0.0 before the first sample. Rounded to ten
    /// decimals so the correction ratio cannot smear a constant series by
    /// an ulp and drag step-rounding across a boundary.
    pub fn get(&self) -> f64 {
        if self.weight > 0.0 {
            clamp_decimals(self.value / self.weight, 10)
        } else {
            0.0
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Three close-price EMAs per (symbol, side) with spans
/// `s0, s1, sqrt(s0*s1)`, sorted ascending. Bands are the max/min of the
/// three and stay undefined until the warm-up bound is reached.
#[derive(Debug, Clone)]
pub struct PriceEmas {
    emas: [CorrectedEma; 3],
    warmup_minutes: u64,
}

impl PriceEmas {
    pub fn new(span_0: f64, span_1: f64, warmup_ratio: f64) -> Self {
        let mut spans = [span_0, span_1, (span_0 * span_1).sqrt()];
        spans.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let max_span = spans[2].max(1.0);
        let ratio = warmup_ratio.clamp(0.0, 1.0);
        PriceEmas {
            emas: [
                CorrectedEma::new(spans[0]),
                CorrectedEma::new(spans[1]),
                CorrectedEma::new(spans[2]),
            ],
            warmup_minutes: (max_span * ratio).ceil() as u64,
        }
    }

    pub fn update(&mut self, close: f64) {
        for ema in self.emas.iter_mut() {
            ema.update(close);
        }
    }

    pub fn is_warm(&self) -> bool {
        self.emas[0].count() >= self.warmup_minutes.max(1)
    }

    /// `None` until warm-up is satisfied; no entry orders are generated
    /// while the bands are undefined.
    pub fn bands(&self) -> Option<EMABands> {
        if !self.is_warm() {
            return None;
        }
        let values = [self.emas[0].get(), self.emas[1].get(), self.emas[2].get()];
        let mut upper = values[0];
        let mut lower = values[0];
        for &v in &values[1..] {
            upper = upper.max(v);
            lower = lower.min(v);
        }
        Some(EMABands { upper, lower })
    }
}

/// Hourly-bucketed EMA of `ln(high/low)` feeding the grid-spacing
/// multiplier. Reads 0.0 until the first completed hour.
#[derive(Debug, Clone)]
pub struct HourlyLogRangeEma {
    ema: CorrectedEma,
    bucket_high: f64,
    bucket_low: f64,
    minutes_in_bucket: usize,
}

impl HourlyLogRangeEma {
    pub fn new(span_hours: f64) -> Self {
        HourlyLogRangeEma {
            ema: CorrectedEma::new(span_hours),
            bucket_high: f64::NEG_INFINITY,
            bucket_low: f64::INFINITY,
            minutes_in_bucket: 0,
        }
    }

    pub fn update(&mut self, high: f64, low: f64) {
        self.bucket_high = self.bucket_high.max(high);
        self.bucket_low = self.bucket_low.min(low);
        self.minutes_in_bucket += 1;
        if self.minutes_in_bucket == MINUTES_PER_HOUR {
            if self.bucket_low > 0.0 && self.bucket_high >= self.bucket_low {
                self.ema.update((self.bucket_high / self.bucket_low).ln());
            }
            self.bucket_high = f64::NEG_INFINITY;
            self.bucket_low = f64::INFINITY;
            self.minutes_in_bucket = 0;
        }
    }

    pub fn get(&self) -> f64 {
        self.ema.get()
    }
}

/// Minute EMAs of quote volume and `ln(high/low)` used by the forager
/// ranking.
#[derive(Debug, Clone)]
pub struct FilterEmas {
    pub volume: CorrectedEma,
    pub log_range: CorrectedEma,
}

impl FilterEmas {
    pub fn new(volume_span: f64, log_range_span: f64) -> Self {
        FilterEmas {
            volume: CorrectedEma::new(volume_span),
            log_range: CorrectedEma::new(log_range_span),
        }
    }

    pub fn update(&mut self, quote_volume: f64, high: f64, low: f64) {
        self.volume.update(quote_volume.max(0.0));
        let log_range = if low > 0.0 && high >= low {
            (high / low).ln()
        } else {
            0.0
        };
        self.log_range.update(log_range);
    }
}
