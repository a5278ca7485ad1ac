//! Fairness audit
//!
//! Re-derives a match's winner from its stored seed and entry-id list. Pure
//! read: nothing is written and nothing outside the match row is consulted,
//! so later changes to the battle's entries cannot change the verdict.

use serde::Serialize;

use crate::{
    error::{CoreError, CoreResult},
    ledger::LedgerStore,
    models::Match,
    seed,
};

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub match_id: String,
    pub seed: String,
    pub entry_count: usize,
    pub recomputed_index: Option<usize>,
    pub recomputed_winner_entry_id: Option<String>,
    pub stored_winner_entry_id: String,
    pub verified: bool,
}

pub async fn verify_match(store: &dyn LedgerStore, match_id: &str) -> CoreResult<VerifyReport> {
    let m = store
        .get_match(match_id)
        .await?
        .ok_or_else(|| CoreError::not_found("match", match_id))?;
    Ok(verify(&m))
}

pub fn verify(m: &Match) -> VerifyReport {
    let index = seed::winner_index(&m.seed, m.entry_ids.len());
    let recomputed = index.and_then(|i| m.entry_ids.get(i).cloned());
    VerifyReport {
        match_id: m.id.clone(),
        seed: m.seed.clone(),
        entry_count: m.entry_ids.len(),
        recomputed_index: index,
        verified: recomputed.as_deref() == Some(m.winner_entry_id.as_str()),
        recomputed_winner_entry_id: recomputed,
        stored_winner_entry_id: m.winner_entry_id.clone(),
    }
}
