use std::cmp::Ordering;

/// Fixed-capacity bitset over symbol ids. Iteration is always ascending,
/// which keeps downstream order generation deterministic.
#[derive(Debug, Clone)]
pub struct SymbolSet {
    words: Vec<u64>,
    len: usize,
}

impl SymbolSet {
    pub fn new(n_symbols: usize) -> Self {
        SymbolSet {
            words: vec![0; (n_symbols + 63) / 64],
            len: 0,
        }
    }

    pub fn insert(&mut self, idx: usize) -> bool {
        let (word, bit) = (idx / 64, idx % 64);
        let mask = 1u64 << bit;
        if self.words[word] & mask == 0 {
            self.words[word] |= mask;
            self.len += 1;
            true
        } else {
            false
        }
    }

    pub fn contains(&self, idx: usize) -> bool {
        let (word, bit) = (idx / 64, idx % 64);
        self.words
            .get(word)
            .map_or(false, |w| w & (1u64 << bit) != 0)
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &word)| {
            (0..64).filter_map(move |bit| {
                if word & (1u64 << bit) != 0 {
                    Some(w * 64 + bit)
                } else {
                    None
                }
            })
        })
    }
}

/// Scores feeding the per-minute symbol selection.
#[derive(Debug, Clone, Copy)]
pub struct SymbolScore {
    pub idx: usize,
    /// Symbol has valid candles at the current minute.
    pub tradable: bool,
    pub volume_ema: f64,
    pub log_range_ema: f64,
}

#[derive(Debug, Clone)]
pub struct Eligibility {
    /// Ranked top-`n_positions` symbols; only these may open or extend
    /// positions.
    pub entry_eligible: SymbolSet,
    /// `entry_eligible` plus symbols already holding a position. Held
    /// symbols that fell out of the ranking stay active close-only.
    pub active: SymbolSet,
    /// Denominator for the per-position exposure limit, never zero.
    pub effective_n_positions: usize,
}

fn compare_desc(a: f64, b: f64, idx_a: usize, idx_b: usize) -> Ordering {
    match b.partial_cmp(&a).unwrap_or(Ordering::Equal) {
        Ordering::Equal => idx_a.cmp(&idx_b),
        ordering => ordering,
    }
}

/// Selects the active symbol set for one side.
///
/// Drops the bottom `volume_drop_pct` by volume EMA, ranks the survivors by
/// log-range EMA, keeps the top `n_positions`, and unions symbols that
/// already hold a position (those stay close-only if they fell out of the
/// ranking; the driver enforces that). The per-position exposure limit is
/// `total / effective_n_positions`.
pub fn select_eligible(
    scores: &[SymbolScore],
    held: &SymbolSet,
    n_positions: usize,
    volume_drop_pct: f64,
) -> Eligibility {
    let n_symbols = scores.len();
    let mut entry_eligible = SymbolSet::new(n_symbols);

    let mut candidates: Vec<&SymbolScore> = scores.iter().filter(|s| s.tradable).collect();
    if candidates.len() > n_positions {
        let drop = if volume_drop_pct.is_finite() {
            volume_drop_pct.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let mut keep = ((candidates.len() as f64) * (1.0 - drop)).round() as usize;
        keep = keep.max(n_positions.max(1)).min(candidates.len());
        candidates.sort_by(|a, b| compare_desc(a.volume_ema, b.volume_ema, a.idx, b.idx));
        candidates.truncate(keep);
        candidates.sort_by(|a, b| compare_desc(a.log_range_ema, b.log_range_ema, a.idx, b.idx));
        candidates.truncate(n_positions);
    }
    for score in candidates {
        entry_eligible.insert(score.idx);
    }
    let mut active = entry_eligible.clone();
    for idx in held.iter() {
        active.insert(idx);
    }

    Eligibility {
        entry_eligible,
        effective_n_positions: active.len().max(1),
        active,
    }
}
