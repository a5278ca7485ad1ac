//! Financial Splitter
//!
//! Pot, platform rake and winner payout for a match. This is the only place
//! the split is computed; matchmaking stamps it onto new matches and the
//! payout path falls back to it only when a stored split is unusable.

use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::error::{CoreError, CoreResult};

pub const DEFAULT_RAKE_RATE: f64 = 0.15;

/// Allowed drift between `pot` and `cut + payout`
pub const SPLIT_TOLERANCE_USD: f64 = 0.01;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FinancialSplit {
    pub pot_usd: f64,
    pub platform_cut_usd: f64,
    pub winner_payout_usd: f64,
}

impl FinancialSplit {
    pub fn is_valid(&self) -> bool {
        let fields = [self.pot_usd, self.platform_cut_usd, self.winner_payout_usd];
        if !fields.iter().all(|v| v.is_finite() && *v >= 0.0) {
            return false;
        }
        (self.pot_usd - self.platform_cut_usd - self.winner_payout_usd).abs()
            <= SPLIT_TOLERANCE_USD + 1e-9
    }
}

/// Where the split used for a payout came from
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(tag = "source", content = "split", rename_all = "snake_case")]
pub enum SplitSource {
    /// Values persisted on the match at creation
    Stored(FinancialSplit),
    /// Derived on the fly because the stored values were missing or invalid
    Recomputed(FinancialSplit),
}

impl SplitSource {
    pub fn split(&self) -> FinancialSplit {
        match self {
            SplitSource::Stored(s) | SplitSource::Recomputed(s) => *s,
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, SplitSource::Stored(_))
    }

    /// Prefer `stored` when it is complete and consistent. `entry_fee` is
    /// only awaited when the split has to be recomputed.
    pub async fn resolve<F>(
        stored: Option<FinancialSplit>,
        entry_count: usize,
        rake_rate: f64,
        entry_fee: F,
    ) -> CoreResult<Self>
    where
        F: Future<Output = CoreResult<f64>>,
    {
        if let Some(split) = stored.filter(FinancialSplit::is_valid) {
            return Ok(SplitSource::Stored(split));
        }
        let entry_fee_usd = entry_fee.await?;
        compute_split(entry_count, entry_fee_usd, rake_rate).map(SplitSource::Recomputed)
    }
}

/// Half-up rounding to cents for non-negative amounts.
pub fn round2(value: f64) -> f64 {
    // nudge values like 1.005 that sit just under the half in binary
    ((value * 100.0) + 1e-9).round() / 100.0
}

pub fn validate_rake_rate(rake_rate: f64) -> CoreResult<()> {
    if !(rake_rate.is_finite() && (0.0..1.0).contains(&rake_rate)) {
        return Err(CoreError::validation(format!(
            "rake rate must be in [0, 1), got {}",
            rake_rate
        )));
    }
    Ok(())
}

pub fn compute_split(
    entry_count: usize,
    entry_fee_usd: f64,
    rake_rate: f64,
) -> CoreResult<FinancialSplit> {
    if entry_count < 2 {
        return Err(CoreError::validation(format!(
            "a split needs at least 2 entries, got {}",
            entry_count
        )));
    }
    if !(entry_fee_usd.is_finite() && entry_fee_usd >= 0.0) {
        return Err(CoreError::validation(format!(
            "invalid entry fee: {}",
            entry_fee_usd
        )));
    }
    validate_rake_rate(rake_rate)?;

    let pot_usd = entry_count as f64 * entry_fee_usd;
    let platform_cut_usd = round2(pot_usd * rake_rate);
    let winner_payout_usd = round2(pot_usd - platform_cut_usd).max(0.0);

    Ok(FinancialSplit {
        pot_usd,
        platform_cut_usd,
        winner_payout_usd,
    })
}
