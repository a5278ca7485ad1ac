//! Payout Processor
//!
//! Credits a match winner exactly once. The store's `settle_payout` flips
//! `payout_processed` with a compare-and-set inside the same transaction that
//! credits the balance and appends the ledger lines, so a direct payout and
//! a batch run racing on one match cannot both pay.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    error::{CoreError, CoreResult},
    ledger::{LedgerStore, PayoutSettlement},
    models::Match,
    split::{validate_rake_rate, FinancialSplit, SplitSource},
};

/// What a payout of one match would do
#[derive(Debug, Clone, Serialize)]
pub struct PayoutPlan {
    pub match_id: String,
    pub battle_id: String,
    pub winner_entry_id: String,
    pub winner_user_id: String,
    pub split_source: SplitSource,
}

impl PayoutPlan {
    pub fn split(&self) -> FinancialSplit {
        self.split_source.split()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PayoutReceipt {
    pub match_id: String,
    pub winner_user_id: String,
    pub winner_entry_id: String,
    pub balance_usd: f64,
    pub winner_payout_usd: f64,
    pub platform_cut_usd: f64,
    pub used_stored_split: bool,
    pub payout_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PayoutOutcome {
    Paid(PayoutReceipt),
    /// Someone already paid this match; nothing was written
    AlreadyProcessed { match_id: String },
}

impl PayoutOutcome {
    pub fn is_paid(&self) -> bool {
        matches!(self, PayoutOutcome::Paid(_))
    }
}

#[derive(Clone)]
pub struct PayoutProcessor {
    store: Arc<dyn LedgerStore>,
    rake_rate: f64,
}

impl PayoutProcessor {
    pub fn new(store: Arc<dyn LedgerStore>, rake_rate: f64) -> CoreResult<Self> {
        validate_rake_rate(rake_rate)?;
        Ok(Self { store, rake_rate })
    }

    pub async fn payout(&self, match_id: &str) -> CoreResult<PayoutOutcome> {
        let m = self
            .store
            .get_match(match_id)
            .await?
            .ok_or_else(|| CoreError::not_found("match", match_id))?;
        self.payout_match(&m).await
    }

    /// Pays an already-loaded match. The snapshot may be stale; the
    /// store-side guard decides whether this call wins.
    pub async fn payout_match(&self, m: &Match) -> CoreResult<PayoutOutcome> {
        if m.payout_processed {
            return Ok(PayoutOutcome::AlreadyProcessed {
                match_id: m.id.clone(),
            });
        }

        let plan = self.plan(m).await?;
        let split = plan.split();
        let settlement = PayoutSettlement {
            match_id: plan.match_id.clone(),
            winner_user_id: plan.winner_user_id.clone(),
            split,
            settled_at: Utc::now(),
        };

        let Some(balance_usd) = self.store.settle_payout(&settlement).await? else {
            debug!(match_id = %m.id, "payout guard lost, match already processed");
            return Ok(PayoutOutcome::AlreadyProcessed {
                match_id: m.id.clone(),
            });
        };

        info!(
            match_id = %plan.match_id,
            winner_user_id = %plan.winner_user_id,
            payout = split.winner_payout_usd,
            cut = split.platform_cut_usd,
            "💰 Match paid out"
        );

        Ok(PayoutOutcome::Paid(PayoutReceipt {
            match_id: plan.match_id,
            winner_user_id: plan.winner_user_id,
            winner_entry_id: plan.winner_entry_id,
            balance_usd,
            winner_payout_usd: split.winner_payout_usd,
            platform_cut_usd: split.platform_cut_usd,
            used_stored_split: plan.split_source.is_stored(),
            payout_at: settlement.settled_at,
        }))
    }

    /// Resolves winner and split without writing anything.
    pub async fn plan(&self, m: &Match) -> CoreResult<PayoutPlan> {
        if !m.entry_ids.iter().any(|id| id == &m.winner_entry_id) {
            return Err(CoreError::InconsistentState(format!(
                "match {} winner {} is not among its entries",
                m.id, m.winner_entry_id
            )));
        }

        let entry = self
            .store
            .get_entry(&m.winner_entry_id)
            .await?
            .ok_or_else(|| {
                CoreError::InconsistentState(format!(
                    "match {} winner entry {} missing",
                    m.id, m.winner_entry_id
                ))
            })?;
        if entry.battle_id != m.battle_id {
            return Err(CoreError::InconsistentState(format!(
                "winner entry {} belongs to battle {}, match {} to {}",
                entry.id, entry.battle_id, m.id, m.battle_id
            )));
        }
        let user = self.store.get_user(&entry.user_id).await?.ok_or_else(|| {
            CoreError::InconsistentState(format!(
                "match {} winner user {} missing",
                m.id, entry.user_id
            ))
        })?;

        let battle_fee = async {
            warn!(match_id = %m.id, "stored split missing or invalid, recomputing");
            let battle = self.store.get_battle(&m.battle_id).await?.ok_or_else(|| {
                CoreError::InconsistentState(format!(
                    "match {} battle {} missing",
                    m.id, m.battle_id
                ))
            })?;
            Ok::<f64, CoreError>(battle.entry_fee_usd)
        };
        let split_source = SplitSource::resolve(
            m.stored_split(),
            m.entry_ids.len(),
            self.rake_rate,
            battle_fee,
        )
        .await?;

        Ok(PayoutPlan {
            match_id: m.id.clone(),
            battle_id: m.battle_id.clone(),
            winner_entry_id: entry.id,
            winner_user_id: user.id,
            split_source,
        })
    }
}
