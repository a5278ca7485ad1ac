//! Matchmaking Engine
//!
//! Scans open battles oldest first. A battle with at least two paid and
//! locked entries gets a seed-drawn winner and a stamped split, and is closed
//! in the same store transaction that inserts its match. That transaction
//! refuses to commit if the eligible entries moved since the draw. Battles
//! below the threshold stay open for a later run. One battle failing never
//! stops the scan.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{CoreError, CoreResult, ErrorKind},
    ledger::{CloseOutcome, LedgerStore},
    models::{Battle, Match},
    seed,
    split::{compute_split, validate_rake_rate, FinancialSplit},
};

/// Fewest eligible entries that make a match
pub const MIN_MATCH_ENTRIES: usize = 2;

#[derive(Debug, Clone, Serialize)]
pub struct CreatedMatch {
    pub battle_id: String,
    pub match_id: String,
    pub winner_entry_id: String,
    pub entry_count: usize,
    pub split: FinancialSplit,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    NotEnoughEntries { eligible: usize },
    /// Another run closed the battle first
    AlreadyClosed,
    /// Entries were paid or locked between the draw and the close; the
    /// battle stays open and the next run draws again
    EntriesChanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedBattle {
    pub battle_id: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct BattleFailure {
    pub battle_id: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchmakingReport {
    pub scanned: usize,
    pub created: Vec<CreatedMatch>,
    pub skipped: Vec<SkippedBattle>,
    pub failed: Vec<BattleFailure>,
}

enum BattleOutcome {
    Created(CreatedMatch),
    Skipped(SkipReason),
}

#[derive(Clone)]
pub struct MatchmakingEngine {
    store: Arc<dyn LedgerStore>,
    rake_rate: f64,
}

impl MatchmakingEngine {
    pub fn new(store: Arc<dyn LedgerStore>, rake_rate: f64) -> CoreResult<Self> {
        validate_rake_rate(rake_rate)?;
        Ok(Self { store, rake_rate })
    }

    /// One pass over every open battle. Safe to call repeatedly.
    pub async fn run(&self) -> CoreResult<MatchmakingReport> {
        let battles = self.store.list_open_battles().await?;
        let mut report = MatchmakingReport {
            scanned: battles.len(),
            ..Default::default()
        };

        for battle in &battles {
            match self.process_battle(battle).await {
                Ok(BattleOutcome::Created(created)) => {
                    info!(
                        battle_id = %created.battle_id,
                        match_id = %created.match_id,
                        winner_entry_id = %created.winner_entry_id,
                        entries = created.entry_count,
                        pot = created.split.pot_usd,
                        "🎯 Match created"
                    );
                    report.created.push(created);
                }
                Ok(BattleOutcome::Skipped(reason)) => {
                    debug!(battle_id = %battle.id, ?reason, "battle skipped");
                    report.skipped.push(SkippedBattle {
                        battle_id: battle.id.clone(),
                        reason,
                    });
                }
                Err(e) => {
                    warn!(battle_id = %battle.id, error = %e, "matchmaking failed for battle");
                    report.failed.push(BattleFailure {
                        battle_id: battle.id.clone(),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if !report.created.is_empty() || !report.failed.is_empty() {
            info!(
                scanned = report.scanned,
                created = report.created.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "matchmaking run complete"
            );
        }
        Ok(report)
    }

    async fn process_battle(&self, battle: &Battle) -> CoreResult<BattleOutcome> {
        let entries = self.store.list_eligible_entries(&battle.id).await?;
        if entries.len() < MIN_MATCH_ENTRIES {
            return Ok(BattleOutcome::Skipped(SkipReason::NotEnoughEntries {
                eligible: entries.len(),
            }));
        }

        let now = Utc::now();
        let draw = seed::draw(entries.len(), now).ok_or_else(|| {
            CoreError::InconsistentState(format!("battle {} has no entries to draw", battle.id))
        })?;
        let split = compute_split(entries.len(), battle.entry_fee_usd, self.rake_rate)?;
        let winner = &entries[draw.index];

        let m = Match {
            id: Uuid::new_v4().to_string(),
            battle_id: battle.id.clone(),
            entry_ids: entries.iter().map(|e| e.id.clone()).collect(),
            winner_entry_id: winner.id.clone(),
            pot_usd: Some(split.pot_usd),
            winner_payout_usd: Some(split.winner_payout_usd),
            platform_cut_usd: Some(split.platform_cut_usd),
            seed: draw.seed,
            paid: false,
            payout_processed: false,
            payout_at: None,
            created_at: now,
        };

        match self.store.create_match_closing_battle(&m).await? {
            CloseOutcome::Closed => {}
            CloseOutcome::NotOpen => return Ok(BattleOutcome::Skipped(SkipReason::AlreadyClosed)),
            CloseOutcome::EntriesChanged => {
                return Ok(BattleOutcome::Skipped(SkipReason::EntriesChanged))
            }
        }

        Ok(BattleOutcome::Created(CreatedMatch {
            battle_id: m.battle_id,
            match_id: m.id,
            winner_entry_id: m.winner_entry_id,
            entry_count: m.entry_ids.len(),
            split,
        }))
    }
}
