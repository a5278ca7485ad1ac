//! Battle Book
//!
//! Lifecycle around matchmaking: users, battle creation, joining, payment
//! confirmation (the gateway is stubbed, confirmation just flips `paid`) and
//! locking paid entries once a battle is due.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{CoreError, CoreResult},
    ledger::LedgerStore,
    models::{Battle, BattleState, Entry, User},
};

/// Battle creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBattle {
    pub creator_id: String,
    pub title: String,
    pub sport: String,
    pub entry_fee_usd: f64,
    pub start_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct BattleBook {
    store: Arc<dyn LedgerStore>,
}

impl BattleBook {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn create_user(&self, username: &str) -> CoreResult<User> {
        let username = username.trim();
        if username.is_empty() {
            return Err(CoreError::validation("username required"));
        }

        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            balance_usd: 0.0,
            created_at: Utc::now(),
        };
        self.store.insert_user(&user).await?;

        info!(user_id = %user.id, "✅ Created user: {}", user.username);
        Ok(user)
    }

    pub async fn create_battle(&self, req: NewBattle) -> CoreResult<Battle> {
        let title = req.title.trim();
        let sport = req.sport.trim();
        if title.is_empty() {
            return Err(CoreError::validation("title required"));
        }
        if sport.is_empty() {
            return Err(CoreError::validation("sport required"));
        }
        if !(req.entry_fee_usd.is_finite() && req.entry_fee_usd > 0.0) {
            return Err(CoreError::validation(format!(
                "entry fee must be positive, got {}",
                req.entry_fee_usd
            )));
        }
        if self.store.get_user(&req.creator_id).await?.is_none() {
            return Err(CoreError::not_found("user", &req.creator_id));
        }

        let battle = Battle {
            id: Uuid::new_v4().to_string(),
            creator_id: req.creator_id,
            title: title.to_string(),
            sport: sport.to_string(),
            entry_fee_usd: req.entry_fee_usd,
            start_at: req.start_at,
            state: BattleState::Open,
            created_at: Utc::now(),
        };
        self.store.insert_battle(&battle).await?;

        info!(
            battle_id = %battle.id,
            fee = battle.entry_fee_usd,
            "⚔️ Battle opened: {}",
            battle.title
        );
        Ok(battle)
    }

    pub async fn join_battle(&self, battle_id: &str, user_id: &str) -> CoreResult<Entry> {
        let battle = self
            .store
            .get_battle(battle_id)
            .await?
            .ok_or_else(|| CoreError::not_found("battle", battle_id))?;
        if battle.state != BattleState::Open {
            return Err(CoreError::validation(format!(
                "battle {} is closed",
                battle_id
            )));
        }
        if self.store.get_user(user_id).await?.is_none() {
            return Err(CoreError::not_found("user", user_id));
        }

        let entry = Entry {
            id: Uuid::new_v4().to_string(),
            battle_id: battle.id,
            user_id: user_id.to_string(),
            paid: false,
            locked: false,
            created_at: Utc::now(),
        };
        if !self.store.insert_entry(&entry).await? {
            return Err(CoreError::validation(format!(
                "user {} already joined battle {}",
                user_id, battle_id
            )));
        }

        debug!(entry_id = %entry.id, battle_id, user_id, "entry created");
        Ok(entry)
    }

    /// Settles an entry fee. Repeating it on a paid entry is a no-op.
    pub async fn confirm_entry_payment(&self, entry_id: &str) -> CoreResult<Entry> {
        let entry = self
            .store
            .get_entry(entry_id)
            .await?
            .ok_or_else(|| CoreError::not_found("entry", entry_id))?;
        if entry.paid {
            return Ok(entry);
        }
        if entry.locked {
            return Err(CoreError::validation(format!(
                "entry {} is locked",
                entry_id
            )));
        }

        let marked = self.store.mark_entry_paid(entry_id).await?;
        let entry = self
            .store
            .get_entry(entry_id)
            .await?
            .ok_or_else(|| CoreError::InconsistentState(format!("entry {} vanished", entry_id)))?;
        if !marked && !entry.paid {
            // the guarded update lost to a lock
            return Err(CoreError::validation(format!(
                "entry {} was locked before payment was recorded",
                entry_id
            )));
        }
        Ok(entry)
    }

    /// Freezes every paid entry of an open battle; returns how many flipped.
    pub async fn lock_battle_entries(&self, battle_id: &str) -> CoreResult<usize> {
        let battle = self
            .store
            .get_battle(battle_id)
            .await?
            .ok_or_else(|| CoreError::not_found("battle", battle_id))?;
        if battle.state != BattleState::Open {
            return Err(CoreError::validation(format!(
                "battle {} is closed",
                battle_id
            )));
        }

        let locked = self.store.lock_paid_entries(battle_id).await?;
        if locked > 0 {
            debug!(battle_id, locked, "entries locked");
        }
        Ok(locked)
    }
}
