//! Ledger Store
//!
//! Persistent home of users, battles, entries, matches and transactions.
//! Engines only talk to the [`LedgerStore`] trait; the conditional
//! transitions (battle close, payout settle) are single calls so that each
//! implementation can make them atomic.

pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::{
    error::CoreResult,
    models::{Battle, Entry, Match, Transaction, User},
    split::FinancialSplit,
};

pub use sqlite::SqliteLedger;

/// Everything the payout step writes for one match
#[derive(Debug, Clone)]
pub struct PayoutSettlement {
    pub match_id: String,
    pub winner_user_id: String,
    pub split: FinancialSplit,
    pub settled_at: DateTime<Utc>,
}

/// Result of the atomic battle close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Battle closed and match inserted
    Closed,
    /// Battle was no longer open; nothing written
    NotOpen,
    /// The battle's paid and locked entries differ from the match's entry
    /// list; nothing written
    EntriesChanged,
}

#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert_user(&self, user: &User) -> CoreResult<()>;
    async fn get_user(&self, user_id: &str) -> CoreResult<Option<User>>;

    async fn insert_battle(&self, battle: &Battle) -> CoreResult<()>;
    async fn get_battle(&self, battle_id: &str) -> CoreResult<Option<Battle>>;
    /// Open battles, oldest first
    async fn list_open_battles(&self) -> CoreResult<Vec<Battle>>;
    /// Open battles whose start time is at or before `now`
    async fn list_due_battles(&self, now: DateTime<Utc>) -> CoreResult<Vec<Battle>>;

    /// Returns false when the user already holds an entry in that battle.
    async fn insert_entry(&self, entry: &Entry) -> CoreResult<bool>;
    async fn get_entry(&self, entry_id: &str) -> CoreResult<Option<Entry>>;
    /// Paid and locked entries of a battle in creation order (ties by id)
    async fn list_eligible_entries(&self, battle_id: &str) -> CoreResult<Vec<Entry>>;
    /// Marks an unlocked entry paid. Returns false if nothing changed.
    async fn mark_entry_paid(&self, entry_id: &str) -> CoreResult<bool>;
    /// Locks every paid, unlocked entry of a battle; returns how many flipped.
    async fn lock_paid_entries(&self, battle_id: &str) -> CoreResult<usize>;

    /// Closes the battle (guarded on `open`) and inserts the match, all or
    /// nothing. Commits only if the battle's current paid and locked entries,
    /// in creation order, are exactly `m.entry_ids`.
    async fn create_match_closing_battle(&self, m: &Match) -> CoreResult<CloseOutcome>;
    async fn get_match(&self, match_id: &str) -> CoreResult<Option<Match>>;
    /// Matches not yet paid out, newest first. `limit == 0` means no cap.
    async fn list_unpaid_matches(&self, limit: usize) -> CoreResult<Vec<Match>>;

    /// Flips `payout_processed` false -> true, credits the winner and appends
    /// the payout and platform fee lines in one unit. Returns the winner's new
    /// balance, or `None` if the match had already been processed.
    async fn settle_payout(&self, settlement: &PayoutSettlement) -> CoreResult<Option<f64>>;
    async fn list_match_transactions(&self, match_id: &str) -> CoreResult<Vec<Transaction>>;
}
