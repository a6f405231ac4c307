//! Claim → execute → persist loop over the owned partitions.

use std::ops::AddAssign;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use shardq_core::config::PipelineConfig;
use shardq_core::truncate::truncate_default;
use shardq_core::{Event, EventStatus, OutboxRecord, PartitionId};
use shardq_store::EventStore;
use tracing::{debug, error, info};

use crate::{
    pool::WorkerPool,
    task::{TaskHandler, TaskOutcome},
    tracker::PartitionOwnershipTracker,
};

/// Counters for one pipeline cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub partitions: usize,
    pub batches: usize,
    pub claimed: usize,
    pub processed: usize,
    pub failed: usize,
    pub persist_failures: usize,
    pub claim_failures: usize,
}

impl AddAssign for CycleReport {
    fn add_assign(&mut self, other: Self) {
        self.partitions += other.partitions;
        self.batches += other.batches;
        self.claimed += other.claimed;
        self.processed += other.processed;
        self.failed += other.failed;
        self.persist_failures += other.persist_failures;
        self.claim_failures += other.claim_failures;
    }
}

#[derive(Clone)]
pub struct ClaimAndProcessPipeline {
    store: Arc<dyn EventStore>,
    tracker: Arc<PartitionOwnershipTracker>,
    pool: WorkerPool,
    claim_batch_size: usize,
    max_batches_per_cycle: usize,
}

impl ClaimAndProcessPipeline {
    pub fn new(
        store: Arc<dyn EventStore>,
        tracker: Arc<PartitionOwnershipTracker>,
        handler: Arc<dyn TaskHandler>,
        config: &PipelineConfig,
    ) -> Self {
        let timeout = config.execution_timeout_ms.map(Duration::from_millis);
        Self {
            store,
            tracker,
            pool: WorkerPool::new(handler, config.max_concurrent_executions, timeout),
            claim_batch_size: config.claim_batch_size,
            max_batches_per_cycle: config.max_batches_per_cycle,
        }
    }

    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// One cycle treating `now` as the time the cycle started. Each claim is
    /// stamped with `now` plus the wall time elapsed since then, so a batch
    /// claimed late in the cycle never looks older to the reaper than it is.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleReport {
        let started = Instant::now();
        let mut partitions = self.tracker.snapshot();
        if partitions.is_empty() {
            debug!("no owned partitions; pipeline cycle skipped");
            return CycleReport::default();
        }
        // Randomised order keeps one busy partition from always going first.
        fastrand::shuffle(&mut partitions);

        let drains = partitions.iter().map(|&p| self.drain_partition(p, now, started));
        let mut report = CycleReport::default();
        for partial in join_all(drains).await {
            report += partial;
        }

        if report.claimed > 0 {
            info!(
                partitions = report.partitions,
                claimed = report.claimed,
                processed = report.processed,
                failed = report.failed,
                persist_failures = report.persist_failures,
                "pipeline cycle finished"
            );
        }
        report
    }

    async fn drain_partition(
        &self,
        partition: PartitionId,
        now: DateTime<Utc>,
        started: Instant,
    ) -> CycleReport {
        let mut report = CycleReport {
            partitions: 1,
            ..CycleReport::default()
        };

        for _ in 0..self.max_batches_per_cycle {
            let claim_at = now
                + chrono::Duration::from_std(started.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero());
            let claimed = match self
                .store
                .claim_due(partition, claim_at, self.claim_batch_size)
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(partition, error = %e, "claim failed; skipping partition this cycle");
                    report.claim_failures += 1;
                    break;
                }
            };
            if claimed.is_empty() {
                break;
            }

            let batch_len = claimed.len();
            report.batches += 1;
            report.claimed += batch_len;

            let finished = self.execute(claimed).await;
            let outbox: Vec<OutboxRecord> = finished
                .iter()
                .map(|event| OutboxRecord::for_event(event, Utc::now()))
                .collect();

            if let Err(e) = self.store.complete_batch(&finished, &outbox).await {
                // The rows stay IN_PROGRESS; the reaper returns them to PENDING.
                error!(
                    partition,
                    batch = batch_len,
                    error = %e,
                    "persist transaction rolled back; claims left for the reaper"
                );
                report.persist_failures += 1;
                break;
            }

            let failed = finished
                .iter()
                .filter(|e| e.status == EventStatus::Failed)
                .count();
            report.failed += failed;
            report.processed += batch_len - failed;

            if batch_len < self.claim_batch_size {
                break;
            }
        }
        report
    }

    /// Run the handler over a claimed batch and apply each outcome.
    async fn execute(&self, claimed: Vec<Event>) -> Vec<Event> {
        self.pool
            .execute_all(claimed)
            .await
            .into_iter()
            .map(|(mut event, outcome)| {
                match outcome {
                    TaskOutcome::Completed => event.mark_processed(),
                    TaskOutcome::Failed { reason } => {
                        debug!(event_id = %event.id, "task failed: {reason}");
                        event.mark_failed(truncate_default(&reason));
                    }
                }
                event
            })
            .collect()
    }
}
