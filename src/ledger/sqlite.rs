//! SQLite-backed Ledger Store
//!
//! - WAL mode so readers are not blocked by the writer
//! - One connection behind a tokio mutex; every call is a short critical section
//! - Guarded transitions run inside IMMEDIATE transactions and check
//!   `changes()` to detect a lost race

use chrono::{DateTime, Utc};
use rusqlite::{
    params, types::Type, Connection, OptionalExtension, Row, TransactionBehavior,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{CoreError, CoreResult},
    ledger::{CloseOutcome, LedgerStore, PayoutSettlement},
    models::{Battle, BattleState, Entry, Match, Transaction, TransactionKind, User},
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT UNIQUE NOT NULL,
    balance_usd REAL NOT NULL DEFAULT 0.0,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS battles (
    id TEXT PRIMARY KEY,
    creator_id TEXT NOT NULL,
    title TEXT NOT NULL,
    sport TEXT NOT NULL,
    entry_fee_usd REAL NOT NULL,
    start_at INTEGER,
    state TEXT NOT NULL DEFAULT 'open',
    created_at INTEGER NOT NULL,
    FOREIGN KEY (creator_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_battles_state_created
    ON battles(state, created_at ASC, id ASC);

CREATE TABLE IF NOT EXISTS entries (
    id TEXT PRIMARY KEY,
    battle_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    paid INTEGER NOT NULL DEFAULT 0,
    locked INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    UNIQUE (battle_id, user_id),
    FOREIGN KEY (battle_id) REFERENCES battles(id),
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_entries_battle_created
    ON entries(battle_id, created_at ASC, id ASC);

-- battle_id is UNIQUE: one match per battle even if a guard were bypassed
CREATE TABLE IF NOT EXISTS matches (
    id TEXT PRIMARY KEY,
    battle_id TEXT UNIQUE NOT NULL,
    entry_ids_json TEXT NOT NULL,
    winner_entry_id TEXT NOT NULL,
    pot_usd REAL,
    winner_payout_usd REAL,
    platform_cut_usd REAL,
    seed TEXT NOT NULL,
    paid INTEGER NOT NULL DEFAULT 0,
    payout_processed INTEGER NOT NULL DEFAULT 0,
    payout_at INTEGER,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (battle_id) REFERENCES battles(id)
);

CREATE INDEX IF NOT EXISTS idx_matches_unpaid
    ON matches(payout_processed, created_at DESC);

-- append-only
CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY,
    user_id TEXT,
    match_id TEXT,
    amount_usd REAL NOT NULL,
    kind TEXT NOT NULL,
    note TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transactions_match
    ON transactions(match_id, created_at ASC);
"#;

const USER_COLS: &str = "id, username, balance_usd, created_at";
const BATTLE_COLS: &str =
    "id, creator_id, title, sport, entry_fee_usd, start_at, state, created_at";
const ENTRY_COLS: &str = "id, battle_id, user_id, paid, locked, created_at";
const MATCH_COLS: &str = "id, battle_id, entry_ids_json, winner_entry_id, pot_usd, \
     winner_payout_usd, platform_cut_usd, seed, paid, payout_processed, payout_at, created_at";
const TRANSACTION_COLS: &str = "id, user_id, match_id, amount_usd, kind, note, created_at";

#[derive(Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    pub fn open(db_path: &str) -> CoreResult<Self> {
        let conn = Connection::open(db_path)?;
        let ledger = Self::init(conn)?;
        info!("📒 Ledger store initialized at: {}", db_path);
        Ok(ledger)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> CoreResult<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn ts(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn ms(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        balance_usd: row.get(2)?,
        created_at: ts(row.get(3)?),
    })
}

fn battle_from_row(row: &Row<'_>) -> rusqlite::Result<Battle> {
    let state: String = row.get(6)?;
    Ok(Battle {
        id: row.get(0)?,
        creator_id: row.get(1)?,
        title: row.get(2)?,
        sport: row.get(3)?,
        entry_fee_usd: row.get(4)?,
        start_at: row.get::<_, Option<i64>>(5)?.map(ts),
        // an unreadable state is never treated as matchable
        state: BattleState::from_str(&state).unwrap_or(BattleState::Closed),
        created_at: ts(row.get(7)?),
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<Entry> {
    Ok(Entry {
        id: row.get(0)?,
        battle_id: row.get(1)?,
        user_id: row.get(2)?,
        paid: row.get(3)?,
        locked: row.get(4)?,
        created_at: ts(row.get(5)?),
    })
}

fn match_from_row(row: &Row<'_>) -> rusqlite::Result<Match> {
    let entry_ids_json: String = row.get(2)?;
    let entry_ids: Vec<String> = serde_json::from_str(&entry_ids_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    Ok(Match {
        id: row.get(0)?,
        battle_id: row.get(1)?,
        entry_ids,
        winner_entry_id: row.get(3)?,
        pot_usd: row.get(4)?,
        winner_payout_usd: row.get(5)?,
        platform_cut_usd: row.get(6)?,
        seed: row.get(7)?,
        paid: row.get(8)?,
        payout_processed: row.get(9)?,
        payout_at: row.get::<_, Option<i64>>(10)?.map(ts),
        created_at: ts(row.get(11)?),
    })
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let kind: String = row.get(4)?;
    Ok(Transaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        match_id: row.get(2)?,
        amount_usd: row.get(3)?,
        kind: TransactionKind::from_str(&kind).unwrap_or(TransactionKind::Other),
        note: row.get(5)?,
        created_at: ts(row.get(6)?),
    })
}

fn insert_transaction(conn: &Connection, txn: &Transaction) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO transactions (id, user_id, match_id, amount_usd, kind, note, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            &txn.id,
            txn.user_id.as_deref(),
            txn.match_id.as_deref(),
            txn.amount_usd,
            txn.kind.as_str(),
            &txn.note,
            ms(&txn.created_at),
        ],
    )?;
    Ok(())
}

#[async_trait::async_trait]
impl LedgerStore for SqliteLedger {
    async fn insert_user(&self, user: &User) -> CoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (id, username, balance_usd, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![&user.id, &user.username, user.balance_usd, ms(&user.created_at)],
        )?;
        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> CoreResult<Option<User>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {} FROM users WHERE id = ?1", USER_COLS))?;
        Ok(stmt.query_row([user_id], user_from_row).optional()?)
    }

    async fn insert_battle(&self, battle: &Battle) -> CoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO battles (id, creator_id, title, sport, entry_fee_usd, start_at, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &battle.id,
                &battle.creator_id,
                &battle.title,
                &battle.sport,
                battle.entry_fee_usd,
                battle.start_at.as_ref().map(ms),
                battle.state.as_str(),
                ms(&battle.created_at),
            ],
        )?;
        Ok(())
    }

    async fn get_battle(&self, battle_id: &str) -> CoreResult<Option<Battle>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {} FROM battles WHERE id = ?1", BATTLE_COLS))?;
        Ok(stmt.query_row([battle_id], battle_from_row).optional()?)
    }

    async fn list_open_battles(&self) -> CoreResult<Vec<Battle>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM battles WHERE state = 'open' ORDER BY created_at ASC, id ASC",
            BATTLE_COLS
        ))?;
        let battles = stmt
            .query_map([], battle_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(battles)
    }

    async fn list_due_battles(&self, now: DateTime<Utc>) -> CoreResult<Vec<Battle>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM battles
             WHERE state = 'open' AND start_at IS NOT NULL AND start_at <= ?1
             ORDER BY created_at ASC, id ASC",
            BATTLE_COLS
        ))?;
        let battles = stmt
            .query_map([ms(&now)], battle_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(battles)
    }

    async fn insert_entry(&self, entry: &Entry) -> CoreResult<bool> {
        let conn = self.conn.lock().await;
        let changes = conn.execute(
            "INSERT OR IGNORE INTO entries (id, battle_id, user_id, paid, locked, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &entry.id,
                &entry.battle_id,
                &entry.user_id,
                entry.paid,
                entry.locked,
                ms(&entry.created_at),
            ],
        )?;
        Ok(changes > 0)
    }

    async fn get_entry(&self, entry_id: &str) -> CoreResult<Option<Entry>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {} FROM entries WHERE id = ?1", ENTRY_COLS))?;
        Ok(stmt.query_row([entry_id], entry_from_row).optional()?)
    }

    async fn list_eligible_entries(&self, battle_id: &str) -> CoreResult<Vec<Entry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM entries
             WHERE battle_id = ?1 AND paid = 1 AND locked = 1
             ORDER BY created_at ASC, id ASC",
            ENTRY_COLS
        ))?;
        let entries = stmt
            .query_map([battle_id], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    async fn mark_entry_paid(&self, entry_id: &str) -> CoreResult<bool> {
        let conn = self.conn.lock().await;
        let changes = conn.execute(
            "UPDATE entries SET paid = 1 WHERE id = ?1 AND paid = 0 AND locked = 0",
            [entry_id],
        )?;
        Ok(changes > 0)
    }

    async fn lock_paid_entries(&self, battle_id: &str) -> CoreResult<usize> {
        let conn = self.conn.lock().await;
        let changes = conn.execute(
            "UPDATE entries SET locked = 1
             WHERE battle_id = ?1 AND paid = 1 AND locked = 0
               AND EXISTS (SELECT 1 FROM battles b WHERE b.id = ?1 AND b.state = 'open')",
            [battle_id],
        )?;
        Ok(changes)
    }

    async fn create_match_closing_battle(&self, m: &Match) -> CoreResult<CloseOutcome> {
        let entry_ids_json = serde_json::to_string(&m.entry_ids)?;

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let closed = tx.execute(
            "UPDATE battles SET state = 'closed' WHERE id = ?1 AND state = 'open'",
            [&m.battle_id],
        )?;
        if closed == 0 {
            debug!(battle_id = %m.battle_id, "battle no longer open, match not created");
            return Ok(CloseOutcome::NotOpen);
        }

        // the draw must cover exactly the entries eligible at close time
        let current: Vec<String> = {
            let mut stmt = tx.prepare_cached(
                "SELECT id FROM entries
                 WHERE battle_id = ?1 AND paid = 1 AND locked = 1
                 ORDER BY created_at ASC, id ASC",
            )?;
            let ids = stmt
                .query_map([&m.battle_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        if current != m.entry_ids {
            debug!(
                battle_id = %m.battle_id,
                drawn = m.entry_ids.len(),
                eligible = current.len(),
                "eligible entries changed since draw, match not created"
            );
            // dropping `tx` reopens the battle
            return Ok(CloseOutcome::EntriesChanged);
        }

        tx.execute(
            &format!(
                "INSERT INTO matches ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                MATCH_COLS
            ),
            params![
                &m.id,
                &m.battle_id,
                &entry_ids_json,
                &m.winner_entry_id,
                m.pot_usd,
                m.winner_payout_usd,
                m.platform_cut_usd,
                &m.seed,
                m.paid,
                m.payout_processed,
                m.payout_at.as_ref().map(ms),
                ms(&m.created_at),
            ],
        )?;

        tx.commit()?;
        Ok(CloseOutcome::Closed)
    }

    async fn get_match(&self, match_id: &str) -> CoreResult<Option<Match>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {} FROM matches WHERE id = ?1", MATCH_COLS))?;
        Ok(stmt.query_row([match_id], match_from_row).optional()?)
    }

    async fn list_unpaid_matches(&self, limit: usize) -> CoreResult<Vec<Match>> {
        // SQLite treats a negative LIMIT as unbounded
        let limit: i64 = if limit == 0 { -1 } else { limit as i64 };
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM matches
             WHERE payout_processed = 0
             ORDER BY created_at DESC, id DESC
             LIMIT ?1",
            MATCH_COLS
        ))?;
        let matches = stmt
            .query_map([limit], match_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(matches)
    }

    async fn settle_payout(&self, s: &PayoutSettlement) -> CoreResult<Option<f64>> {
        let payout_line = Transaction {
            id: Uuid::new_v4().to_string(),
            user_id: Some(s.winner_user_id.clone()),
            match_id: Some(s.match_id.clone()),
            amount_usd: s.split.winner_payout_usd,
            kind: TransactionKind::Payout,
            note: format!("Payout for match {}", s.match_id),
            created_at: s.settled_at,
        };
        let fee_line = Transaction {
            id: Uuid::new_v4().to_string(),
            user_id: None,
            match_id: Some(s.match_id.clone()),
            amount_usd: s.split.platform_cut_usd,
            kind: TransactionKind::PlatformFee,
            note: format!("Platform fee for match {}", s.match_id),
            created_at: s.settled_at,
        };

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let flipped = tx.execute(
            "UPDATE matches SET payout_processed = 1, paid = 1, payout_at = ?2
             WHERE id = ?1 AND payout_processed = 0",
            params![&s.match_id, ms(&s.settled_at)],
        )?;
        if flipped == 0 {
            return Ok(None);
        }

        let credited = tx.execute(
            "UPDATE users SET balance_usd = balance_usd + ?1 WHERE id = ?2",
            params![s.split.winner_payout_usd, &s.winner_user_id],
        )?;
        if credited == 0 {
            // dropping `tx` rolls the flag back
            return Err(CoreError::InconsistentState(format!(
                "winner user {} vanished during payout of match {}",
                s.winner_user_id, s.match_id
            )));
        }
        let balance: f64 = tx.query_row(
            "SELECT balance_usd FROM users WHERE id = ?1",
            [&s.winner_user_id],
            |row| row.get(0),
        )?;

        insert_transaction(&tx, &payout_line)?;
        insert_transaction(&tx, &fee_line)?;

        tx.commit()?;
        Ok(Some(balance))
    }

    async fn list_match_transactions(&self, match_id: &str) -> CoreResult<Vec<Transaction>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM transactions WHERE match_id = ?1 ORDER BY created_at ASC, rowid ASC",
            TRANSACTION_COLS
        ))?;
        let txns = stmt
            .query_map([match_id], transaction_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(txns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::FinancialSplit;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    fn create_test_ledger() -> (SqliteLedger, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        let ledger = SqliteLedger::open(db_path).unwrap();
        (ledger, temp_file)
    }

    fn user(name: &str) -> User {
        User {
            id: Uuid::new_v4().to_string(),
            username: name.to_string(),
            balance_usd: 0.0,
            created_at: Utc::now(),
        }
    }

    fn battle(creator: &User, created_at: DateTime<Utc>) -> Battle {
        Battle {
            id: Uuid::new_v4().to_string(),
            creator_id: creator.id.clone(),
            title: "Sunday showdown".to_string(),
            sport: "soccer".to_string(),
            entry_fee_usd: 5.0,
            start_at: None,
            state: BattleState::Open,
            created_at,
        }
    }

    fn entry(battle: &Battle, user: &User, created_at: DateTime<Utc>) -> Entry {
        Entry {
            id: Uuid::new_v4().to_string(),
            battle_id: battle.id.clone(),
            user_id: user.id.clone(),
            paid: true,
            locked: true,
            created_at,
        }
    }

    fn stamped_match(battle: &Battle, entries: &[&Entry]) -> Match {
        Match {
            id: Uuid::new_v4().to_string(),
            battle_id: battle.id.clone(),
            entry_ids: entries.iter().map(|e| e.id.clone()).collect(),
            winner_entry_id: entries[0].id.clone(),
            pot_usd: Some(10.0),
            winner_payout_usd: Some(8.5),
            platform_cut_usd: Some(1.5),
            seed: "seed".to_string(),
            paid: false,
            payout_processed: false,
            payout_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_user_roundtrip() {
        let (ledger, _temp) = create_test_ledger();
        let alice = user("alice");
        ledger.insert_user(&alice).await.unwrap();

        let loaded = ledger.get_user(&alice.id).await.unwrap().unwrap();
        assert_eq!(loaded.username, "alice");
        assert_eq!(loaded.balance_usd, 0.0);
        assert!(ledger.get_user("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_battles_oldest_first() {
        let (ledger, _temp) = create_test_ledger();
        let alice = user("alice");
        ledger.insert_user(&alice).await.unwrap();

        let now = Utc::now();
        let newer = battle(&alice, now);
        let older = battle(&alice, now - Duration::minutes(5));
        ledger.insert_battle(&newer).await.unwrap();
        ledger.insert_battle(&older).await.unwrap();

        let open = ledger.list_open_battles().await.unwrap();
        let ids: Vec<_> = open.iter().map(|b| b.id.clone()).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
    }

    #[tokio::test]
    async fn test_eligible_entries_ordered_with_id_tiebreak() {
        let (ledger, _temp) = create_test_ledger();
        let alice = user("alice");
        let bob = user("bob");
        let carol = user("carol");
        for u in [&alice, &bob, &carol] {
            ledger.insert_user(u).await.unwrap();
        }
        let b = battle(&alice, Utc::now());
        ledger.insert_battle(&b).await.unwrap();

        let t = Utc::now();
        let e1 = entry(&b, &alice, t);
        let e2 = entry(&b, &bob, t);
        let mut unpaid = entry(&b, &carol, t - Duration::seconds(1));
        unpaid.paid = false;
        unpaid.locked = false;
        for e in [&e1, &e2, &unpaid] {
            assert!(ledger.insert_entry(e).await.unwrap());
        }

        let eligible = ledger.list_eligible_entries(&b.id).await.unwrap();
        let mut expected = vec![e1.id.clone(), e2.id.clone()];
        expected.sort();
        let got: Vec<_> = eligible.iter().map(|e| e.id.clone()).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_duplicate_entry_ignored() {
        let (ledger, _temp) = create_test_ledger();
        let alice = user("alice");
        ledger.insert_user(&alice).await.unwrap();
        let b = battle(&alice, Utc::now());
        ledger.insert_battle(&b).await.unwrap();

        assert!(ledger.insert_entry(&entry(&b, &alice, Utc::now())).await.unwrap());
        assert!(!ledger.insert_entry(&entry(&b, &alice, Utc::now())).await.unwrap());
    }

    #[tokio::test]
    async fn test_battle_closes_once() {
        let (ledger, _temp) = create_test_ledger();
        let alice = user("alice");
        let bob = user("bob");
        ledger.insert_user(&alice).await.unwrap();
        ledger.insert_user(&bob).await.unwrap();
        let b = battle(&alice, Utc::now());
        ledger.insert_battle(&b).await.unwrap();
        let e1 = entry(&b, &alice, Utc::now());
        let e2 = entry(&b, &bob, Utc::now() + Duration::seconds(1));
        ledger.insert_entry(&e1).await.unwrap();
        ledger.insert_entry(&e2).await.unwrap();

        let first = stamped_match(&b, &[&e1, &e2]);
        let second = stamped_match(&b, &[&e1, &e2]);
        assert_eq!(
            ledger.create_match_closing_battle(&first).await.unwrap(),
            CloseOutcome::Closed
        );
        assert_eq!(
            ledger.create_match_closing_battle(&second).await.unwrap(),
            CloseOutcome::NotOpen
        );

        let stored = ledger.get_battle(&b.id).await.unwrap().unwrap();
        assert_eq!(stored.state, BattleState::Closed);
        assert!(ledger.get_match(&first.id).await.unwrap().is_some());
        assert!(ledger.get_match(&second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_rejected_when_eligible_set_differs() {
        let (ledger, _temp) = create_test_ledger();
        let alice = user("alice");
        let bob = user("bob");
        let carol = user("carol");
        for u in [&alice, &bob, &carol] {
            ledger.insert_user(u).await.unwrap();
        }
        let b = battle(&alice, Utc::now());
        ledger.insert_battle(&b).await.unwrap();
        let t = Utc::now();
        let e1 = entry(&b, &alice, t);
        let e2 = entry(&b, &bob, t + Duration::seconds(1));
        let e3 = entry(&b, &carol, t + Duration::seconds(2));
        for e in [&e1, &e2, &e3] {
            ledger.insert_entry(e).await.unwrap();
        }

        let short = stamped_match(&b, &[&e1, &e2]);
        assert_eq!(
            ledger.create_match_closing_battle(&short).await.unwrap(),
            CloseOutcome::EntriesChanged
        );
        assert_eq!(
            ledger.get_battle(&b.id).await.unwrap().unwrap().state,
            BattleState::Open
        );
        assert!(ledger.get_match(&short.id).await.unwrap().is_none());

        let full = stamped_match(&b, &[&e1, &e2, &e3]);
        assert_eq!(
            ledger.create_match_closing_battle(&full).await.unwrap(),
            CloseOutcome::Closed
        );
    }

    #[tokio::test]
    async fn test_settle_payout_once() {
        let (ledger, _temp) = create_test_ledger();
        let alice = user("alice");
        let bob = user("bob");
        ledger.insert_user(&alice).await.unwrap();
        ledger.insert_user(&bob).await.unwrap();
        let b = battle(&alice, Utc::now());
        ledger.insert_battle(&b).await.unwrap();
        let e1 = entry(&b, &alice, Utc::now());
        let e2 = entry(&b, &bob, Utc::now() + Duration::seconds(1));
        ledger.insert_entry(&e1).await.unwrap();
        ledger.insert_entry(&e2).await.unwrap();
        let m = stamped_match(&b, &[&e1, &e2]);
        ledger.create_match_closing_battle(&m).await.unwrap();

        let settlement = PayoutSettlement {
            match_id: m.id.clone(),
            winner_user_id: alice.id.clone(),
            split: FinancialSplit {
                pot_usd: 10.0,
                platform_cut_usd: 1.5,
                winner_payout_usd: 8.5,
            },
            settled_at: Utc::now(),
        };
        assert_eq!(ledger.settle_payout(&settlement).await.unwrap(), Some(8.5));
        assert_eq!(ledger.settle_payout(&settlement).await.unwrap(), None);

        let txns = ledger.list_match_transactions(&m.id).await.unwrap();
        assert_eq!(txns.len(), 2);
        assert_eq!(txns[0].kind, TransactionKind::Payout);
        assert_eq!(txns[0].user_id.as_deref(), Some(alice.id.as_str()));
        assert_eq!(txns[1].kind, TransactionKind::PlatformFee);
        assert!(txns[1].user_id.is_none());

        let paid = ledger.get_match(&m.id).await.unwrap().unwrap();
        assert!(paid.paid && paid.payout_processed);
        assert!(paid.payout_at.is_some());
        assert!(ledger.list_unpaid_matches(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settle_rolls_back_when_user_missing() {
        let (ledger, _temp) = create_test_ledger();
        let alice = user("alice");
        let bob = user("bob");
        ledger.insert_user(&alice).await.unwrap();
        ledger.insert_user(&bob).await.unwrap();
        let b = battle(&alice, Utc::now());
        ledger.insert_battle(&b).await.unwrap();
        let e1 = entry(&b, &alice, Utc::now());
        let e2 = entry(&b, &bob, Utc::now() + Duration::seconds(1));
        ledger.insert_entry(&e1).await.unwrap();
        ledger.insert_entry(&e2).await.unwrap();
        let m = stamped_match(&b, &[&e1, &e2]);
        ledger.create_match_closing_battle(&m).await.unwrap();

        let settlement = PayoutSettlement {
            match_id: m.id.clone(),
            winner_user_id: "ghost".to_string(),
            split: m.stored_split().unwrap(),
            settled_at: Utc::now(),
        };
        let err = ledger.settle_payout(&settlement).await.unwrap_err();
        assert!(matches!(err, CoreError::InconsistentState(_)));

        let untouched = ledger.get_match(&m.id).await.unwrap().unwrap();
        assert!(!untouched.payout_processed);
        assert!(ledger.list_match_transactions(&m.id).await.unwrap().is_empty());
    }
}
