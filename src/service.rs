//! Battle service facade
//!
//! Wires one ledger store into every component with a shared config and
//! exposes the operator-level operations. `OpOutcome` is the structured
//! `{ok, kind, message, data}` envelope callers print or ship over a wire.

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::{
    audit::{self, VerifyReport},
    batch::{BatchOptions, BatchPayoutRunner, BatchRun},
    book::{BattleBook, NewBattle},
    config::CoreConfig,
    error::{CoreError, CoreResult, ErrorKind},
    ledger::{LedgerStore, SqliteLedger},
    matchmaking::{MatchmakingEngine, MatchmakingReport},
    models::{Battle, Entry, Match, Transaction, User},
    payout::{PayoutOutcome, PayoutProcessor},
    scheduler::BattleScheduler,
};

#[derive(Debug, Clone, Serialize)]
pub struct OpOutcome<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> OpOutcome<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            kind: None,
            message: None,
            data: Some(data),
        }
    }

    pub fn failure(err: &CoreError) -> Self {
        Self {
            ok: false,
            kind: Some(err.kind()),
            message: Some(err.to_string()),
            data: None,
        }
    }
}

impl<T> From<CoreResult<T>> for OpOutcome<T> {
    fn from(result: CoreResult<T>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => Self::failure(&e),
        }
    }
}

#[derive(Clone)]
pub struct BattleService {
    store: Arc<dyn LedgerStore>,
    config: CoreConfig,
    book: BattleBook,
    matchmaking: MatchmakingEngine,
    payouts: PayoutProcessor,
    batch: BatchPayoutRunner,
}

impl BattleService {
    pub fn new(store: Arc<dyn LedgerStore>, config: CoreConfig) -> CoreResult<Self> {
        let matchmaking = MatchmakingEngine::new(store.clone(), config.rake_rate)?;
        let payouts = PayoutProcessor::new(store.clone(), config.rake_rate)?;
        let batch = BatchPayoutRunner::new(
            store.clone(),
            payouts.clone(),
            config.batch_pause(),
            config.item_timeout(),
        );
        Ok(Self {
            book: BattleBook::new(store.clone()),
            store,
            config,
            matchmaking,
            payouts,
            batch,
        })
    }

    /// Service over the SQLite ledger at `config.db_path`
    pub fn open(config: CoreConfig) -> CoreResult<Self> {
        let ledger = SqliteLedger::open(&config.db_path)?;
        info!("💾 Battle ledger opened at {}", config.db_path);
        Self::new(Arc::new(ledger), config)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn scheduler(&self) -> BattleScheduler {
        BattleScheduler::new(
            self.store.clone(),
            self.matchmaking.clone(),
            self.config.scheduler_interval(),
        )
    }

    pub async fn create_user(&self, username: &str) -> CoreResult<User> {
        self.book.create_user(username).await
    }

    pub async fn create_battle(&self, req: NewBattle) -> CoreResult<Battle> {
        self.book.create_battle(req).await
    }

    pub async fn join_battle(&self, battle_id: &str, user_id: &str) -> CoreResult<Entry> {
        self.book.join_battle(battle_id, user_id).await
    }

    pub async fn confirm_entry_payment(&self, entry_id: &str) -> CoreResult<Entry> {
        self.book.confirm_entry_payment(entry_id).await
    }

    pub async fn lock_battle_entries(&self, battle_id: &str) -> CoreResult<usize> {
        self.book.lock_battle_entries(battle_id).await
    }

    pub async fn run_matchmaking(&self) -> CoreResult<MatchmakingReport> {
        self.matchmaking.run().await
    }

    pub async fn verify_match(&self, match_id: &str) -> CoreResult<VerifyReport> {
        audit::verify_match(self.store.as_ref(), match_id).await
    }

    pub async fn pay_match(&self, match_id: &str) -> CoreResult<PayoutOutcome> {
        self.payouts.payout(match_id).await
    }

    pub async fn run_batch_payout(&self, opts: BatchOptions) -> CoreResult<BatchRun> {
        self.batch.run(opts).await
    }

    pub async fn get_match(&self, match_id: &str) -> CoreResult<Match> {
        self.store
            .get_match(match_id)
            .await?
            .ok_or_else(|| CoreError::not_found("match", match_id))
    }

    pub async fn match_transactions(&self, match_id: &str) -> CoreResult<Vec<Transaction>> {
        self.store.list_match_transactions(match_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;

    #[test]
    fn test_outcome_envelope() {
        let ok: OpOutcome<u32> = Ok(7).into();
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json, serde_json::json!({"ok": true, "data": 7}));

        let failed: OpOutcome<u32> = Err(CoreError::not_found("match", "m-1")).into();
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["kind"], "not_found");
        assert_eq!(json["message"], "match not found: m-1");
        assert!(json.get("data").is_none());
    }

    #[tokio::test]
    async fn test_full_cycle_through_facade() {
        let fx = Fixture::new().await;
        let service = BattleService::new(fx.store.clone(), CoreConfig::default()).unwrap();
        fx.battle_with_entries(5.0, 3).await;

        let report = service.run_matchmaking().await.unwrap();
        let match_id = report.created[0].match_id.clone();
        assert!(service.verify_match(&match_id).await.unwrap().verified);

        let paid = service.pay_match(&match_id).await.unwrap();
        assert!(paid.is_paid());
        assert!(!service.pay_match(&match_id).await.unwrap().is_paid());
        assert!(service.get_match(&match_id).await.unwrap().payout_processed);
        assert_eq!(service.match_transactions(&match_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_bad_rake_config() {
        let fx = Fixture::new().await;
        let config = CoreConfig {
            rake_rate: -0.1,
            ..Default::default()
        };
        assert!(BattleService::new(fx.store.clone(), config).is_err());
    }
}
