//! Bounded persistence queue with a circuit breaker — §5.
//!
//! Grounded in the ingest pipeline's bounded-`mpsc` worker pattern
//! (`main.rs`'s enrichment channel): a fixed-capacity channel decouples the
//! producer (the execution kernel, which must never block on I/O) from the
//! consumer (the database writer, which sometimes is slow or down). Unlike
//! that pipeline, persistence tasks are not retried on their own — dropping
//! one means the in-memory state and the store diverge for that row until
//! the next write to the same entity catches it up, which is always
//! acceptable here since in-memory state is authoritative (§5).

use crate::account::AccountState;
use crate::audit::AuditEvent;
use crate::execution::TradeRecord;
use crate::ids::{OrderId, PositionId};
use crate::order::PendingOrder;
use crate::position::Position;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// The channel drops the oldest-pending-to-send task rather than applying
/// backpressure to callers; callers hold an account lock while enqueueing
/// and must never block on a slow store.
pub const QUEUE_CAPACITY: usize = 100;

/// Consecutive store-call failures before the breaker opens and stops
/// attempting writes, falling back to a single probe per interval.
pub const FAILURE_THRESHOLD: u32 = 10;

/// How often an open breaker lets one task through to probe recovery.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum PersistenceTask {
    UpsertAccount(AccountState),
    UpsertPosition(Position),
    DeletePosition(PositionId),
    InsertOrder(PendingOrder),
    DeleteOrder(OrderId),
    InsertTrade(TradeRecord),
    InsertAuditLog(AuditEvent),
}

/// Breaker state, observable from outside the worker loop for health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
}

struct Breaker {
    consecutive_failures: AtomicU32,
    opened_at_millis: AtomicU64,
}

impl Breaker {
    fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
        }
    }

    fn state(&self) -> BreakerState {
        if self.opened_at_millis.load(Ordering::Acquire) == 0 {
            BreakerState::Closed
        } else {
            BreakerState::Open
        }
    }

    /// Whether a task should be attempted right now. When open, only lets
    /// one probe through per [`PROBE_INTERVAL`]; every task skipped this way
    /// is effectively dropped, same as a full-queue drop.
    fn should_attempt(&self, now_millis: i64) -> bool {
        let opened_at = self.opened_at_millis.load(Ordering::Acquire);
        if opened_at == 0 {
            return true;
        }
        now_millis - opened_at as i64 >= PROBE_INTERVAL.as_millis() as i64
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.opened_at_millis.store(0, Ordering::Release);
    }

    fn record_failure(&self, now_millis: i64) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= FAILURE_THRESHOLD {
            // Re-stamp on every probe failure too, so the next probe is a
            // full PROBE_INTERVAL away rather than immediate.
            self.opened_at_millis.store(now_millis.max(1) as u64, Ordering::Release);
        }
    }
}

pub struct PersistenceQueue {
    sender: mpsc::Sender<PersistenceTask>,
}

impl PersistenceQueue {
    /// Spawns the draining worker and returns a handle producers can clone
    /// and enqueue onto. `store` is typically an `Arc<dyn Store>`.
    pub fn spawn(store: Arc<dyn crate::persistence::Store>, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Self {
        let (sender, mut receiver) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(async move {
            let breaker = Breaker::new();
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::info!("persistence worker shutting down");
                        break;
                    }
                    task = receiver.recv() => {
                        let Some(task) = task else { break };
                        let now = chrono::Utc::now().timestamp_millis();
                        if !breaker.should_attempt(now) {
                            tracing::warn!("persistence circuit breaker open, dropping task");
                            continue;
                        }
                        match apply(&*store, task).await {
                            Ok(()) => breaker.record_success(),
                            Err(err) => {
                                breaker.record_failure(now);
                                let opened = breaker.state() == BreakerState::Open;
                                tracing::error!(error = %err, breaker_open = opened, "persistence task failed");
                            }
                        }
                    }
                }
            }
        });
        Self { sender }
    }

    /// Enqueue a task. Never blocks: a full queue means the store is falling
    /// behind production rate, and the task is dropped with a CRITICAL log
    /// rather than stalling whichever caller is holding an account lock.
    pub fn enqueue(&self, task: PersistenceTask) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.sender.try_send(task) {
            tracing::error!("persistence queue full, dropping task");
        }
    }
}

async fn apply(store: &dyn crate::persistence::Store, task: PersistenceTask) -> anyhow::Result<()> {
    match task {
        PersistenceTask::UpsertAccount(account) => store.upsert_account(&account).await,
        PersistenceTask::UpsertPosition(position) => store.upsert_position(&position).await,
        PersistenceTask::DeletePosition(id) => store.delete_position(id).await,
        PersistenceTask::InsertOrder(order) => store.insert_order(&order).await,
        PersistenceTask::DeleteOrder(id) => store.delete_order(id).await,
        PersistenceTask::InsertTrade(trade) => store.insert_trade(&trade).await,
        PersistenceTask::InsertAuditLog(event) => store.insert_audit_log(&event).await,
    }
}
