//! Shared fixtures for unit tests

use chrono::{DateTime, Utc};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tempfile::NamedTempFile;

use crate::{
    book::{BattleBook, NewBattle},
    error::{CoreError, CoreResult},
    ledger::{CloseOutcome, LedgerStore, PayoutSettlement, SqliteLedger},
    models::{Battle, Entry, Match, Transaction, User},
};

pub struct Fixture {
    pub store: Arc<dyn LedgerStore>,
    pub book: BattleBook,
    ledger: SqliteLedger,
    _temp: NamedTempFile,
}

impl Fixture {
    pub async fn new() -> Self {
        let temp = NamedTempFile::new().unwrap();
        let ledger = SqliteLedger::open(temp.path().to_str().unwrap()).unwrap();
        let store: Arc<dyn LedgerStore> = Arc::new(ledger.clone());
        Self {
            book: BattleBook::new(store.clone()),
            store,
            ledger,
            _temp: temp,
        }
    }

    pub async fn user(&self, prefix: &str) -> User {
        let name = format!("{}-{}", prefix, uuid::Uuid::new_v4().simple());
        self.book.create_user(&name).await.unwrap()
    }

    pub async fn balance(&self, user_id: &str) -> f64 {
        self.store.get_user(user_id).await.unwrap().unwrap().balance_usd
    }

    /// Open battle with `n` paid and locked entries
    pub async fn battle_with_entries(&self, fee: f64, n: usize) -> Battle {
        let battle = self.open_battle(fee).await;
        for i in 0..n {
            self.paid_entry(&battle.id, &format!("player{}", i)).await;
        }
        self.book.lock_battle_entries(&battle.id).await.unwrap();
        battle
    }

    pub async fn open_battle(&self, fee: f64) -> Battle {
        let creator = self.user("creator").await;
        self.book
            .create_battle(NewBattle {
                creator_id: creator.id,
                title: "Test battle".to_string(),
                sport: "chess".to_string(),
                entry_fee_usd: fee,
                start_at: None,
            })
            .await
            .unwrap()
    }

    /// Joined and paid, not yet locked
    pub async fn paid_entry(&self, battle_id: &str, prefix: &str) -> Entry {
        let player = self.user(prefix).await;
        let entry = self.book.join_battle(battle_id, &player.id).await.unwrap();
        self.book.confirm_entry_payment(&entry.id).await.unwrap()
    }

    /// Store that fails every call touching one of `poisoned` (battle or match ids)
    pub fn failing_store(&self, poisoned: Vec<String>) -> Arc<dyn LedgerStore> {
        Arc::new(ScriptedLedger::new(
            self.ledger.clone(),
            Script {
                poisoned,
                ..Default::default()
            },
        ))
    }

    pub fn scripted_store(&self, script: Script) -> Arc<ScriptedLedger> {
        Arc::new(ScriptedLedger::new(self.ledger.clone(), script))
    }
}

/// Misbehaviour injected by [`ScriptedLedger`]
#[derive(Default)]
pub struct Script {
    /// Calls naming one of these ids fail with `StoreUnavailable`
    pub poisoned: Vec<String>,
    /// Lock the battle's paid entries right after the next eligible-entry
    /// read returns (one shot)
    pub lock_after_eligible_read: bool,
    /// `mark_entry_paid` writes nothing and reports no change
    pub ignore_payment_marks: bool,
    /// Every `settle_payout` sleeps this long first
    pub settle_delay: Duration,
    /// `settle_payout` for these match ids sleeps `stall_for` first
    pub stalled: Vec<String>,
    pub stall_for: Duration,
}

pub struct ScriptedLedger {
    inner: SqliteLedger,
    script: Script,
    lock_armed: AtomicBool,
    settling: AtomicUsize,
    peak_settling: AtomicUsize,
}

impl ScriptedLedger {
    fn new(inner: SqliteLedger, script: Script) -> Self {
        Self {
            lock_armed: AtomicBool::new(script.lock_after_eligible_read),
            inner,
            script,
            settling: AtomicUsize::new(0),
            peak_settling: AtomicUsize::new(0),
        }
    }

    /// Most `settle_payout` calls ever in flight at once
    pub fn peak_settling(&self) -> usize {
        self.peak_settling.load(Ordering::SeqCst)
    }

    fn check(&self, id: &str) -> CoreResult<()> {
        if self.script.poisoned.iter().any(|p| p == id) {
            return Err(CoreError::StoreUnavailable(format!("injected fault for {}", id)));
        }
        Ok(())
    }
}

/// Counts a call as in flight until dropped, including when a timeout
/// cancels it
struct InFlight<'a> {
    count: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = count.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { count }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl LedgerStore for ScriptedLedger {
    async fn insert_user(&self, user: &User) -> CoreResult<()> {
        self.inner.insert_user(user).await
    }
    async fn get_user(&self, user_id: &str) -> CoreResult<Option<User>> {
        self.inner.get_user(user_id).await
    }
    async fn insert_battle(&self, battle: &Battle) -> CoreResult<()> {
        self.inner.insert_battle(battle).await
    }
    async fn get_battle(&self, battle_id: &str) -> CoreResult<Option<Battle>> {
        self.inner.get_battle(battle_id).await
    }
    async fn list_open_battles(&self) -> CoreResult<Vec<Battle>> {
        self.inner.list_open_battles().await
    }
    async fn list_due_battles(&self, now: DateTime<Utc>) -> CoreResult<Vec<Battle>> {
        self.inner.list_due_battles(now).await
    }
    async fn insert_entry(&self, entry: &Entry) -> CoreResult<bool> {
        self.inner.insert_entry(entry).await
    }
    async fn get_entry(&self, entry_id: &str) -> CoreResult<Option<Entry>> {
        self.inner.get_entry(entry_id).await
    }
    async fn list_eligible_entries(&self, battle_id: &str) -> CoreResult<Vec<Entry>> {
        self.check(battle_id)?;
        let entries = self.inner.list_eligible_entries(battle_id).await?;
        if self.lock_armed.swap(false, Ordering::SeqCst) {
            self.inner.lock_paid_entries(battle_id).await?;
        }
        Ok(entries)
    }
    async fn mark_entry_paid(&self, entry_id: &str) -> CoreResult<bool> {
        if self.script.ignore_payment_marks {
            return Ok(false);
        }
        self.inner.mark_entry_paid(entry_id).await
    }
    async fn lock_paid_entries(&self, battle_id: &str) -> CoreResult<usize> {
        self.check(battle_id)?;
        self.inner.lock_paid_entries(battle_id).await
    }
    async fn create_match_closing_battle(&self, m: &Match) -> CoreResult<CloseOutcome> {
        self.inner.create_match_closing_battle(m).await
    }
    async fn get_match(&self, match_id: &str) -> CoreResult<Option<Match>> {
        self.check(match_id)?;
        self.inner.get_match(match_id).await
    }
    async fn list_unpaid_matches(&self, limit: usize) -> CoreResult<Vec<Match>> {
        self.inner.list_unpaid_matches(limit).await
    }
    async fn settle_payout(&self, settlement: &PayoutSettlement) -> CoreResult<Option<f64>> {
        self.check(&settlement.match_id)?;

        let _settling = InFlight::enter(&self.settling, &self.peak_settling);
        let mut delay = self.script.settle_delay;
        if self.script.stalled.iter().any(|id| id == &settlement.match_id) {
            delay += self.script.stall_for;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.settle_payout(settlement).await
    }
    async fn list_match_transactions(&self, match_id: &str) -> CoreResult<Vec<Transaction>> {
        self.inner.list_match_transactions(match_id).await
    }
}
