//! Battle scheduler
//!
//! Periodic driver for battles with a start time. A tick locks the paid
//! entries of every open battle whose start time has passed, then runs a
//! matchmaking pass. Ticks never overlap: a tick requested while another is
//! running returns `TickOutcome::Busy` and does nothing.

use chrono::Utc;
use serde::Serialize;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{
    error::CoreResult,
    flight::SingleFlight,
    ledger::LedgerStore,
    matchmaking::{BattleFailure, MatchmakingEngine, MatchmakingReport},
};

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub due_battles: usize,
    pub entries_locked: usize,
    pub lock_failures: Vec<BattleFailure>,
    pub matchmaking: MatchmakingReport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickOutcome {
    Ran(TickReport),
    Busy,
}

#[derive(Clone)]
pub struct BattleScheduler {
    store: Arc<dyn LedgerStore>,
    engine: MatchmakingEngine,
    interval: Duration,
    flight: SingleFlight,
}

impl BattleScheduler {
    pub fn new(store: Arc<dyn LedgerStore>, engine: MatchmakingEngine, interval: Duration) -> Self {
        Self {
            store,
            engine,
            interval,
            flight: SingleFlight::new(),
        }
    }

    pub async fn tick(&self) -> CoreResult<TickOutcome> {
        let Some(_flight) = self.flight.try_acquire() else {
            return Ok(TickOutcome::Busy);
        };

        let due = self.store.list_due_battles(Utc::now()).await?;
        let mut report = TickReport {
            due_battles: due.len(),
            ..Default::default()
        };

        for battle in &due {
            match self.store.lock_paid_entries(&battle.id).await {
                Ok(n) => {
                    if n > 0 {
                        debug!(battle_id = %battle.id, locked = n, "entries locked at start time");
                    }
                    report.entries_locked += n;
                }
                Err(e) => {
                    warn!(battle_id = %battle.id, error = %e, "failed to lock due battle");
                    report.lock_failures.push(BattleFailure {
                        battle_id: battle.id.clone(),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }

        report.matchmaking = self.engine.run().await?;
        Ok(TickOutcome::Ran(report))
    }

    /// Tick every interval until `shutdown` resolves. Tick errors are logged
    /// and the loop keeps going.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("⏱️  Battle scheduler started (every {:?})", self.interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("⏱️  Battle scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(TickOutcome::Ran(report)) => {
                            if !report.matchmaking.created.is_empty() || report.entries_locked > 0 {
                                info!(
                                    due = report.due_battles,
                                    locked = report.entries_locked,
                                    matches = report.matchmaking.created.len(),
                                    "scheduler tick"
                                );
                            }
                        }
                        Ok(TickOutcome::Busy) => debug!("previous tick still running"),
                        Err(e) => error!(error = %e, "scheduler tick failed"),
                    }
                }
            }
        }
    }
}
