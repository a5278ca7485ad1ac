//! Batch Payout Runner
//!
//! Works through the unpaid-match backlog newest first. The backlog is cut
//! into chunks processed one after another with a short pause in between;
//! inside a chunk a fixed pool of workers drains a shared queue. Every item
//! is attempted once: failures are recorded in the summary and the batch
//! moves on. Re-running is safe because the payout guard is per match.

use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
};
use tracing::{error, info, warn};

use crate::{
    error::{CoreResult, ErrorKind},
    flight::SingleFlight,
    ledger::LedgerStore,
    models::Match,
    payout::{PayoutOutcome, PayoutPlan, PayoutProcessor, PayoutReceipt},
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchOptions {
    /// false = dry run, nothing is written
    pub apply: bool,
    /// Cap on matches considered, 0 = no cap
    pub limit: usize,
    pub batch_size: usize,
    pub concurrency: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            apply: false,
            limit: 0,
            batch_size: 50,
            concurrency: 5,
        }
    }
}

impl BatchOptions {
    fn normalized(self) -> Self {
        Self {
            batch_size: self.batch_size.max(1),
            concurrency: self.concurrency.max(1),
            ..self
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItemOutcome {
    /// Dry run: what an apply run would pay
    WouldPay(PayoutPlan),
    Paid(PayoutReceipt),
    AlreadyProcessed,
    Failed { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub match_id: String,
    pub outcome: BatchItemOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub apply: bool,
    pub considered: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub details: Vec<BatchItem>,
}

impl BatchSummary {
    fn record(&mut self, item: BatchItem) {
        match item.outcome {
            BatchItemOutcome::WouldPay(_) | BatchItemOutcome::Paid(_) => self.processed += 1,
            BatchItemOutcome::AlreadyProcessed => self.skipped += 1,
            BatchItemOutcome::Failed { .. } => self.errors += 1,
        }
        self.details.push(item);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchRun {
    Completed(BatchSummary),
    /// Another batch run holds the flight; this call did nothing
    Busy,
}

#[derive(Clone)]
pub struct BatchPayoutRunner {
    store: Arc<dyn LedgerStore>,
    processor: PayoutProcessor,
    chunk_pause: Duration,
    item_timeout: Duration,
    flight: SingleFlight,
}

impl BatchPayoutRunner {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        processor: PayoutProcessor,
        chunk_pause: Duration,
        item_timeout: Duration,
    ) -> Self {
        Self {
            store,
            processor,
            chunk_pause,
            item_timeout,
            flight: SingleFlight::new(),
        }
    }

    pub async fn run(&self, opts: BatchOptions) -> CoreResult<BatchRun> {
        let Some(_flight) = self.flight.try_acquire() else {
            warn!("batch payout already in flight, rejecting");
            return Ok(BatchRun::Busy);
        };
        let summary = self.run_backlog(opts.normalized()).await?;
        Ok(BatchRun::Completed(summary))
    }

    async fn run_backlog(&self, opts: BatchOptions) -> CoreResult<BatchSummary> {
        let backlog = self.store.list_unpaid_matches(opts.limit).await?;
        let mut summary = BatchSummary {
            apply: opts.apply,
            considered: backlog.len(),
            ..Default::default()
        };
        if backlog.is_empty() {
            return Ok(summary);
        }

        let chunks: Vec<Vec<Match>> = backlog
            .chunks(opts.batch_size)
            .map(|c| c.to_vec())
            .collect();
        let chunk_count = chunks.len();

        info!(
            matches = summary.considered,
            chunks = chunk_count,
            concurrency = opts.concurrency,
            apply = opts.apply,
            "📦 Batch payout starting"
        );

        for (i, chunk) in chunks.into_iter().enumerate() {
            for item in self.run_chunk(chunk, opts).await {
                summary.record(item);
            }
            if i + 1 < chunk_count && !self.chunk_pause.is_zero() {
                tokio::time::sleep(self.chunk_pause).await;
            }
        }

        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            errors = summary.errors,
            apply = opts.apply,
            "📦 Batch payout finished"
        );
        Ok(summary)
    }

    /// Fixed pool of `concurrency` workers over one chunk. Results keep the
    /// chunk's order.
    async fn run_chunk(&self, chunk: Vec<Match>, opts: BatchOptions) -> Vec<BatchItem> {
        let match_ids: Vec<String> = chunk.iter().map(|m| m.id.clone()).collect();

        let (tx, rx) = mpsc::unbounded_channel::<(usize, Match)>();
        for job in chunk.into_iter().enumerate() {
            let _ = tx.send(job);
        }
        drop(tx);
        let queue = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for _ in 0..opts.concurrency.min(match_ids.len()) {
            let queue = queue.clone();
            let processor = self.processor.clone();
            let item_timeout = self.item_timeout;
            workers.spawn(async move {
                let mut done = Vec::new();
                loop {
                    let next = queue.lock().await.recv().await;
                    let Some((idx, m)) = next else { break };
                    let outcome = process_one(&processor, &m, opts.apply, item_timeout).await;
                    done.push((idx, outcome));
                }
                done
            });
        }

        let mut slots: Vec<Option<BatchItemOutcome>> = vec![None; match_ids.len()];
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(done) => {
                    for (idx, outcome) in done {
                        slots[idx] = Some(outcome);
                    }
                }
                Err(e) => error!(error = %e, "batch payout worker aborted"),
            }
        }

        match_ids
            .into_iter()
            .zip(slots)
            .map(|(match_id, outcome)| BatchItem {
                match_id,
                outcome: outcome.unwrap_or_else(|| BatchItemOutcome::Failed {
                    kind: ErrorKind::InconsistentState,
                    message: "worker aborted before reporting".to_string(),
                }),
            })
            .collect()
    }
}

async fn process_one(
    processor: &PayoutProcessor,
    m: &Match,
    apply: bool,
    item_timeout: Duration,
) -> BatchItemOutcome {
    let attempt = async {
        if apply {
            processor.payout_match(m).await.map(|outcome| match outcome {
                PayoutOutcome::Paid(receipt) => BatchItemOutcome::Paid(receipt),
                PayoutOutcome::AlreadyProcessed { .. } => BatchItemOutcome::AlreadyProcessed,
            })
        } else {
            processor.plan(m).await.map(BatchItemOutcome::WouldPay)
        }
    };

    match tokio::time::timeout(item_timeout, attempt).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            warn!(
                match_id = %m.id,
                error = %e,
                retryable = e.is_retryable(),
                "batch payout item failed"
            );
            BatchItemOutcome::Failed {
                kind: e.kind(),
                message: e.to_string(),
            }
        }
        Err(_) => {
            warn!(match_id = %m.id, timeout_ms = item_timeout.as_millis() as u64, "batch payout item timed out");
            BatchItemOutcome::Failed {
                kind: ErrorKind::StoreUnavailable,
                message: format!("timed out after {}ms", item_timeout.as_millis()),
            }
        }
    }
}
