use chrono::{DateTime, Duration, Utc};
use slog::{info, o, warn, Logger};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use uuid::Uuid;

use crate::{
    batch::{aggregate_task_marker, gather_batches, ready_batches_in, BatchKind, DiscoveredBatch},
    interval::Interval,
    logging::event,
    metrics::WorkflowManagerMetrics,
    storage::{Bucket, StorageError},
    task::{AggregationTask, Batch, IntakeBatchTask, TaskEnqueuer, TaskQueueError},
    ErrorClassification, DATE_FORMAT,
};

/// Batches newer than this much past `now` are tolerated in the intake
/// window, to avoid missing batches written by ingestion servers whose
/// clocks run ahead of ours.
const INTAKE_CLOCK_SKEW_TOLERANCE_HOURS: i64 = 24;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    TaskQueue(#[from] TaskQueueError),
    #[error("{0} task(s) failed to publish or record their marker")]
    PublishFailures(usize),
}

impl ErrorClassification for WorkflowError {
    fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::Storage(e) => e.is_retryable(),
            WorkflowError::TaskQueue(e) => e.is_retryable(),
            // Markers guarantee the next run skips whatever did get
            // scheduled, so re-running after publish failures is safe.
            WorkflowError::PublishFailures(_) => true,
        }
    }
}

/// One scheduler sweep: discovers ready batches in the intake and peer
/// validation buckets, decides which intake and aggregate tasks are due, and
/// publishes them onto task queues, recording a marker object per scheduled
/// task so subsequent sweeps schedule each task at most once.
pub struct WorkflowManager {
    intake_bucket: Bucket,
    own_validation_bucket: Bucket,
    peer_validation_bucket: Bucket,
    is_first: bool,
    intake_max_age: Duration,
    aggregation_period: Duration,
    grace_period: Duration,
    aggregation_override_timestamp: Option<DateTime<Utc>>,
    intake_enqueuer: Box<dyn TaskEnqueuer<IntakeBatchTask>>,
    aggregate_enqueuer: Box<dyn TaskEnqueuer<AggregationTask>>,
    metrics: WorkflowManagerMetrics,
    /// Publishes or marker writes that failed in a completion callback.
    failed_tasks: Arc<AtomicUsize>,
    logger: Logger,
}

impl WorkflowManager {
    pub fn new(
        intake_bucket: Bucket,
        own_validation_bucket: Bucket,
        peer_validation_bucket: Bucket,
        is_first: bool,
        intake_max_age: Duration,
        aggregation_period: Duration,
        grace_period: Duration,
        aggregation_override_timestamp: Option<DateTime<Utc>>,
        intake_enqueuer: Box<dyn TaskEnqueuer<IntakeBatchTask>>,
        aggregate_enqueuer: Box<dyn TaskEnqueuer<AggregationTask>>,
        metrics: WorkflowManagerMetrics,
        parent_logger: &Logger,
    ) -> WorkflowManager {
        WorkflowManager {
            intake_bucket,
            own_validation_bucket,
            peer_validation_bucket,
            is_first,
            intake_max_age,
            aggregation_period,
            grace_period,
            aggregation_override_timestamp,
            intake_enqueuer,
            aggregate_enqueuer,
            metrics,
            failed_tasks: Arc::new(AtomicUsize::new(0)),
            logger: parent_logger.new(o!()),
        }
    }

    /// Performs one sweep at the provided instant. Listing failures abort
    /// the sweep after in-flight publishes are drained; individual publish
    /// failures are recorded and the remaining tasks still publish. Either
    /// way an error is returned so the process exits non-zero.
    pub fn run(&mut self, now: DateTime<Utc>) -> Result<(), WorkflowError> {
        let sweep_result = self.sweep(now);

        // Outstanding publishes must complete before the process exits,
        // even when the sweep failed partway.
        let intake_drain = self.intake_enqueuer.stop();
        let aggregate_drain = self.aggregate_enqueuer.stop();

        sweep_result?;
        intake_drain?;
        aggregate_drain?;

        match self.failed_tasks.load(Ordering::SeqCst) {
            0 => Ok(()),
            failed => Err(WorkflowError::PublishFailures(failed)),
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> Result<(), WorkflowError> {
        let aggregation_ids = self.intake_bucket.list_aggregation_ids()?;
        info!(
            self.logger, "discovered aggregations";
            "count" => aggregation_ids.len(),
        );

        // All intake tasks for the sweep are issued before any aggregate
        // task: aggregate tasks operate on batches whose intake tasks
        // completed in previous sweeps, and issuing them last keeps the
        // publish order easy to reason about.
        for aggregation_id in &aggregation_ids {
            self.schedule_intake_tasks(aggregation_id, now).map_err(|e| {
                warn!(
                    self.logger, "failed to schedule intake tasks";
                    event::AGGREGATION_ID => aggregation_id,
                    "error" => format!("{e:?}"),
                );
                e
            })?;
        }
        for aggregation_id in &aggregation_ids {
            self.schedule_aggregate_task(aggregation_id, now).map_err(|e| {
                warn!(
                    self.logger, "failed to schedule aggregate task";
                    event::AGGREGATION_ID => aggregation_id,
                    "error" => format!("{e:?}"),
                );
                e
            })?;
        }
        Ok(())
    }

    /// Schedules an intake task for every ready intake batch in the intake
    /// window that has not already been scheduled by a previous sweep.
    fn schedule_intake_tasks(
        &mut self,
        aggregation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        let logger = self.logger.new(o!(
            event::AGGREGATION_ID => aggregation_id.to_owned(),
        ));

        let intake_interval = Interval::new(
            now - self.intake_max_age,
            now + Duration::hours(INTAKE_CLOCK_SKEW_TOLERANCE_HOURS),
        )
        .expect("intake interval cannot be backwards");

        let keys = self
            .intake_bucket
            .list_batch_files(aggregation_id, &intake_interval)?;
        let ready = ready_batches_in(gather_batches(&keys, BatchKind::Intake), &intake_interval);
        let markers = self
            .own_validation_bucket
            .list_intake_task_markers(aggregation_id, &intake_interval)?;

        self.metrics
            .intake_batches_discovered
            .with_label_values(&[aggregation_id])
            .set(ready.len() as i64);

        let mut scheduled = 0;
        let mut skipped = 0;
        for batch in ready {
            let marker = batch.path.intake_task_marker();
            if markers.contains(&marker) {
                skipped += 1;
                continue;
            }

            let trace_id = Uuid::new_v4();
            let task = IntakeBatchTask {
                trace_id: Some(trace_id),
                aggregation_id: batch.path.aggregation_id.clone(),
                batch_id: batch.path.batch_id.to_string(),
                date: batch.path.time.format(DATE_FORMAT).to_string(),
            };
            info!(
                logger, "scheduling intake task";
                event::TRACE_ID => trace_id.to_string(),
                event::BATCH_ID => task.batch_id.clone(),
                event::BATCH_DATE => task.date.clone(),
            );
            self.intake_enqueuer
                .enqueue(task, self.marker_writing_callback(marker, &logger))?;
            scheduled += 1;
        }

        self.metrics
            .intake_tasks_scheduled
            .with_label_values(&[aggregation_id])
            .set(scheduled);
        self.metrics
            .intake_tasks_skipped_due_to_marker
            .with_label_values(&[aggregation_id])
            .set(skipped);
        Ok(())
    }

    /// Schedules at most one aggregate task, for the current aggregation
    /// window, covering the peer validation batches whose intake batches are
    /// also ready.
    fn schedule_aggregate_task(
        &mut self,
        aggregation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        let logger = self.logger.new(o!(
            event::AGGREGATION_ID => aggregation_id.to_owned(),
        ));

        let window = match self.aggregation_override_timestamp {
            Some(timestamp) => Interval::window_containing(timestamp, self.aggregation_period),
            None => Interval::aggregation_window(now, self.aggregation_period, self.grace_period),
        };

        let intake_keys = self
            .intake_bucket
            .list_batch_files(aggregation_id, &window)?;
        let ready_intake =
            ready_batches_in(gather_batches(&intake_keys, BatchKind::Intake), &window);

        let peer_keys = self
            .peer_validation_bucket
            .list_batch_files(aggregation_id, &window)?;
        let ready_peer = ready_batches_in(
            gather_batches(&peer_keys, BatchKind::peer_validation_for(self.is_first)),
            &window,
        );

        // The aggregatable set is the peer validation batches whose UUIDs
        // also appear among ready intake batches: both the original batch
        // and the peer's validation must exist before a batch can be
        // aggregated.
        let intake_ids: HashSet<Uuid> = ready_intake
            .iter()
            .map(|batch| batch.path.batch_id)
            .collect();
        let aggregatable: Vec<&DiscoveredBatch> = ready_peer
            .iter()
            .filter(|batch| intake_ids.contains(&batch.path.batch_id))
            .collect();

        if aggregatable.is_empty() {
            info!(logger, "no batches to aggregate"; "window" => window.to_string());
            return Ok(());
        }

        let marker = aggregate_task_marker(aggregation_id, window.begin());
        if self
            .own_validation_bucket
            .list_aggregate_task_markers(aggregation_id)?
            .contains(&marker)
        {
            self.metrics
                .aggregate_tasks_skipped_due_to_marker
                .with_label_values(&[aggregation_id])
                .set(1);
            return Ok(());
        }

        let trace_id = Uuid::new_v4();
        let task = AggregationTask {
            trace_id: Some(trace_id),
            aggregation_id: aggregation_id.to_owned(),
            aggregation_start: window.begin().format(DATE_FORMAT).to_string(),
            aggregation_end: window.end().format(DATE_FORMAT).to_string(),
            batches: aggregatable
                .iter()
                .map(|batch| Batch {
                    id: batch.path.batch_id.to_string(),
                    time: batch.path.time.format(DATE_FORMAT).to_string(),
                })
                .collect(),
        };
        info!(
            logger, "scheduling aggregate task";
            event::TRACE_ID => trace_id.to_string(),
            "window" => window.to_string(),
            "batches" => task.batches.len(),
        );
        self.aggregate_enqueuer
            .enqueue(task, self.marker_writing_callback(marker, &logger))?;
        self.metrics
            .aggregate_tasks_scheduled
            .with_label_values(&[aggregation_id])
            .set(1);
        Ok(())
    }

    /// A completion callback that records the task's marker once its publish
    /// succeeds. The publish-then-mark order is what makes scheduling safe
    /// across crashes: a crash between publish and mark merely causes one
    /// redundant publish on the next sweep, while the opposite order could
    /// lose tasks.
    fn marker_writing_callback(
        &self,
        marker: String,
        logger: &Logger,
    ) -> Box<dyn FnOnce(Result<(), TaskQueueError>) + Send> {
        let own_validation_bucket = self.own_validation_bucket.clone();
        let failed_tasks = Arc::clone(&self.failed_tasks);
        let logger = logger.new(o!(
            event::TASK_MARKER => marker.clone(),
        ));
        Box::new(move |result| {
            match result {
                Ok(()) => {
                    if let Err(error) = own_validation_bucket.write_task_marker(&marker) {
                        // The task is published but unmarked: the next sweep
                        // will publish it again, which downstream workers
                        // tolerate. The run must still be reported as
                        // failed.
                        warn!(
                            logger, "failed to write task marker";
                            "error" => format!("{error:?}"),
                        );
                        failed_tasks.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Err(_) => {
                    // Already logged by the enqueuer; the marker is not
                    // written so a future sweep retries the task.
                    failed_tasks.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
    }
}
