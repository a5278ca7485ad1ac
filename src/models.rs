//! Ledger entities
//!
//! Users, battles, entries, matches and the append-only transaction ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::split::FinancialSplit;

/// Account holder with a spendable USD balance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub balance_usd: f64,
    pub created_at: DateTime<Utc>,
}

/// Battle lifecycle. `Open` -> `Closed` happens once, only via matchmaking.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BattleState {
    Open,
    Closed,
}

impl BattleState {
    pub fn as_str(&self) -> &str {
        match self {
            BattleState::Open => "open",
            BattleState::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "open" => Some(BattleState::Open),
            "closed" => Some(BattleState::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Battle {
    pub id: String,
    pub creator_id: String,
    pub title: String,
    pub sport: String,
    pub entry_fee_usd: f64,
    pub start_at: Option<DateTime<Utc>>,
    pub state: BattleState,
    pub created_at: DateTime<Utc>,
}

/// One user's participation in one battle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub battle_id: String,
    pub user_id: String,
    pub paid: bool,
    pub locked: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome record of matchmaking over one battle.
///
/// `entry_ids` is frozen in creation order when the match is stamped; the
/// winner index derived from `seed` points into this list. The financial
/// columns are nullable so rows written before the split was stamped can
/// still be paid out through a recomputed split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub battle_id: String,
    pub entry_ids: Vec<String>,
    pub winner_entry_id: String,
    pub pot_usd: Option<f64>,
    pub winner_payout_usd: Option<f64>,
    pub platform_cut_usd: Option<f64>,
    pub seed: String,
    pub paid: bool,
    pub payout_processed: bool,
    pub payout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Match {
    /// Stored split, if all three fields are present
    pub fn stored_split(&self) -> Option<FinancialSplit> {
        Some(FinancialSplit {
            pot_usd: self.pot_usd?,
            platform_cut_usd: self.platform_cut_usd?,
            winner_payout_usd: self.winner_payout_usd?,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Payout,
    PlatformFee,
    Deposit,
    Withdrawal,
    Other,
}

impl TransactionKind {
    pub fn as_str(&self) -> &str {
        match self {
            TransactionKind::Payout => "payout",
            TransactionKind::PlatformFee => "platform_fee",
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "payout" => Some(TransactionKind::Payout),
            "platform_fee" => Some(TransactionKind::PlatformFee),
            "deposit" => Some(TransactionKind::Deposit),
            "withdrawal" => Some(TransactionKind::Withdrawal),
            "other" => Some(TransactionKind::Other),
            _ => None,
        }
    }
}

/// Immutable ledger line. Platform fee lines carry no user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: Option<String>,
    pub match_id: Option<String>,
    pub amount_usd: f64,
    pub kind: TransactionKind,
    pub note: String,
    pub created_at: DateTime<Utc>,
}
