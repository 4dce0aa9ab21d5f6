mod pubsub;
mod sns;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use slog::{debug, error, o, Logger};
use std::{
    fmt::{self, Debug, Display},
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};
use uuid::Uuid;

use crate::ErrorClassification;

pub use pubsub::PubSubTopicPublisher;
pub use sns::SnsTopicPublisher;

/// The number of worker threads a `WorkerPoolEnqueuer` runs publishes on
/// unless configured otherwise.
pub const DEFAULT_ENQUEUE_WORKERS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum TaskQueueError {
    #[error("failed to serialize task to JSON: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to publish task: {0}")]
    Publish(#[source] anyhow::Error),
    #[error("task queue is stopped")]
    Stopped,
    #[error("task queue worker panicked")]
    WorkerPanic,
}

impl ErrorClassification for TaskQueueError {
    fn is_retryable(&self) -> bool {
        match self {
            // A task that cannot be serialized will never serialize.
            TaskQueueError::Serialization(_) => false,
            // Publish attempts have already been retried by the publisher.
            TaskQueueError::Publish(_) => true,
            TaskQueueError::Stopped | TaskQueueError::WorkerPanic => false,
        }
    }
}

/// Represents a task that can be scheduled onto a task queue for a worker to
/// execute.
pub trait Task:
    Debug + Display + PartialEq + Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Represents an intake batch task to be executed
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct IntakeBatchTask {
    /// The trace identifier for the intake
    pub trace_id: Option<Uuid>,
    /// The identifier for the aggregation
    pub aggregation_id: String,
    /// The identifier of the batch, typically a UUID
    pub batch_id: String,
    /// The UTC timestamp on the batch, with minute precision, formatted like
    /// "2006/01/02/15/04"
    pub date: String,
}

impl Task for IntakeBatchTask {}

impl Display for IntakeBatchTask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(id) = self.trace_id {
            writeln!(f, "trace ID: {id}")?;
        }
        write!(
            f,
            "aggregation ID: {}\nbatch ID: {}\ndate: {}",
            self.aggregation_id, self.batch_id, self.date
        )
    }
}

/// Represents an aggregation task to be executed
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct AggregationTask {
    /// The trace identifier for the aggregation
    pub trace_id: Option<Uuid>,
    /// The identifier for the aggregation
    pub aggregation_id: String,
    /// The start of the range of time covered by the aggregation in UTC,
    /// with minute precision, formatted like "2006/01/02/15/04"
    pub aggregation_start: String,
    /// The end of the range of time covered by the aggregation in UTC, with
    /// minute precision, formatted like "2006/01/02/15/04"
    pub aggregation_end: String,
    /// The list of batches aggregated by this task
    pub batches: Vec<Batch>,
}

impl Task for AggregationTask {}

impl Display for AggregationTask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(id) = self.trace_id {
            writeln!(f, "trace ID: {id}")?;
        }
        write!(
            f,
            "aggregation ID: {}\naggregation start: {}\naggregation end: {}\nnumber of batches: {}",
            self.aggregation_id,
            self.aggregation_start,
            self.aggregation_end,
            self.batches.len()
        )
    }
}

/// Represents a batch included in an aggregation
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Batch {
    /// The identifier of the batch. Typically a UUID.
    pub id: String,
    /// The timestamp on the batch, in UTC, with minute precision, formatted
    /// like "2006/01/02/15/04".
    pub time: String,
}

/// Publishes a single serialized message onto a named topic, synchronously.
/// Implementations retry transient provider errors internally and make no
/// ordering or deduplication guarantees.
pub trait TopicPublisher: Debug + Send + Sync {
    fn publish(&self, message: &str) -> Result<(), TaskQueueError>;
}

/// A callback invoked exactly once with the outcome of an asynchronous
/// publish.
pub type CompletionCallback = Box<dyn FnOnce(Result<(), TaskQueueError>) + Send>;

/// Accepts tasks for asynchronous publication onto a task queue topic.
/// Enqueued tasks are published by a pool of workers; each task's completion
/// callback is invoked exactly once, with the publish outcome, from a worker
/// thread. `stop` blocks until every callback has fired.
pub trait TaskEnqueuer<T: Task>: Debug + Send {
    fn enqueue(&mut self, task: T, on_complete: CompletionCallback)
        -> Result<(), TaskQueueError>;

    fn stop(&mut self) -> Result<(), TaskQueueError>;
}

struct Job<T: Task> {
    task: T,
    on_complete: CompletionCallback,
}

/// A TaskEnqueuer that drives a `TopicPublisher` from a bounded pool of
/// worker threads, so that at most `workers` publishes are in flight at a
/// time.
pub struct WorkerPoolEnqueuer<T: Task> {
    sender: Option<Sender<Job<T>>>,
    workers: Vec<JoinHandle<()>>,
    logger: Logger,
}

impl<T: Task> Debug for WorkerPoolEnqueuer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WorkerPoolEnqueuer")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl<T: Task> WorkerPoolEnqueuer<T> {
    pub fn new(
        publisher: Arc<dyn TopicPublisher>,
        worker_count: usize,
        parent_logger: &Logger,
    ) -> WorkerPoolEnqueuer<T> {
        assert!(worker_count > 0);
        let logger = parent_logger.new(o!());
        let (sender, receiver) = channel::<Job<T>>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..worker_count)
            .map(|_| {
                let publisher = Arc::clone(&publisher);
                let receiver = Arc::clone(&receiver);
                let logger = logger.clone();
                thread::spawn(move || worker_loop(publisher, receiver, logger))
            })
            .collect();

        WorkerPoolEnqueuer {
            sender: Some(sender),
            workers,
            logger,
        }
    }
}

fn worker_loop<T: Task>(
    publisher: Arc<dyn TopicPublisher>,
    receiver: Arc<Mutex<Receiver<Job<T>>>>,
    logger: Logger,
) {
    loop {
        // The job must be received outside the match so the mutex guard is
        // dropped before the publish, or one slow publish would serialize
        // the whole pool.
        let job = receiver.lock().unwrap().recv();
        let job = match job {
            Ok(job) => job,
            // All senders are gone: the enqueuer is stopping.
            Err(_) => return,
        };

        let result = serde_json::to_string(&job.task)
            .map_err(TaskQueueError::from)
            .and_then(|message| publisher.publish(&message));
        if let Err(error) = &result {
            error!(
                logger, "failed to publish task";
                "error" => format!("{error:?}"),
            );
        } else {
            debug!(logger, "published task");
        }
        (job.on_complete)(result);
    }
}

impl<T: Task> TaskEnqueuer<T> for WorkerPoolEnqueuer<T> {
    fn enqueue(
        &mut self,
        task: T,
        on_complete: CompletionCallback,
    ) -> Result<(), TaskQueueError> {
        let sender = self.sender.as_ref().ok_or(TaskQueueError::Stopped)?;
        sender
            .send(Job { task, on_complete })
            .map_err(|_| TaskQueueError::Stopped)
    }

    fn stop(&mut self) -> Result<(), TaskQueueError> {
        // Dropping the sender makes every worker's recv fail once the queue
        // drains, so join waits for all outstanding callbacks.
        self.sender = None;
        let mut result = Ok(());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!(self.logger, "task queue worker panicked");
                result = Err(TaskQueueError::WorkerPanic);
            }
        }
        result
    }
}

/// A TopicPublisher that records published messages in memory, for tests.
/// Clones share the same underlying state. Tests may arrange for the next
/// publishes to fail.
#[derive(Clone, Debug, Default)]
pub struct MemoryTopicPublisher {
    messages: Arc<Mutex<Vec<String>>>,
    failures_remaining: Arc<Mutex<usize>>,
}

impl MemoryTopicPublisher {
    pub fn new() -> MemoryTopicPublisher {
        MemoryTopicPublisher::default()
    }

    /// The messages published so far, in publication order.
    pub fn published(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    /// Parses every published message as a task of type T.
    pub fn published_tasks<T: Task>(&self) -> Vec<T> {
        self.published()
            .iter()
            .map(|message| serde_json::from_str(message).expect("published unparseable task"))
            .collect()
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next(&self, count: usize) {
        *self.failures_remaining.lock().unwrap() += count;
    }
}

impl TopicPublisher for MemoryTopicPublisher {
    fn publish(&self, message: &str) -> Result<(), TaskQueueError> {
        {
            let mut failures_remaining = self.failures_remaining.lock().unwrap();
            if *failures_remaining > 0 {
                *failures_remaining -= 1;
                return Err(TaskQueueError::Publish(anyhow::anyhow!(
                    "synthetic publish failure"
                )));
            }
        }
        self.messages.lock().unwrap().push(message.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::setup_test_logging;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fake_task(n: u32) -> IntakeBatchTask {
        IntakeBatchTask {
            trace_id: Some(Uuid::from_u128(n.into())),
            aggregation_id: "fake-aggregation".to_owned(),
            batch_id: format!("batch-{n}"),
            date: "2021/01/01/00/30".to_owned(),
        }
    }

    #[test]
    fn task_json_is_kebab_case() {
        let task = fake_task(1);
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&task).unwrap()).unwrap();
        assert!(value.get("aggregation-id").is_some());
        assert!(value.get("batch-id").is_some());
        assert!(value.get("trace-id").is_some());

        let aggregation = AggregationTask {
            trace_id: None,
            aggregation_id: "fake-aggregation".to_owned(),
            aggregation_start: "2021/01/01/00/00".to_owned(),
            aggregation_end: "2021/01/01/08/00".to_owned(),
            batches: vec![Batch {
                id: "fake-batch".to_owned(),
                time: "2021/01/01/00/30".to_owned(),
            }],
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&aggregation).unwrap()).unwrap();
        assert!(value.get("aggregation-start").is_some());
        assert!(value.get("aggregation-end").is_some());
    }

    #[test]
    fn enqueue_publishes_and_fires_callbacks() {
        let logger = setup_test_logging();
        let publisher = MemoryTopicPublisher::new();
        let mut enqueuer: WorkerPoolEnqueuer<IntakeBatchTask> =
            WorkerPoolEnqueuer::new(Arc::new(publisher.clone()), 4, &logger);

        let successes = Arc::new(AtomicUsize::new(0));
        for n in 0..10 {
            let successes = Arc::clone(&successes);
            enqueuer
                .enqueue(
                    fake_task(n),
                    Box::new(move |result| {
                        if result.is_ok() {
                            successes.fetch_add(1, Ordering::SeqCst);
                        }
                    }),
                )
                .unwrap();
        }
        enqueuer.stop().unwrap();

        assert_eq!(successes.load(Ordering::SeqCst), 10);
        let mut tasks = publisher.published_tasks::<IntakeBatchTask>();
        tasks.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
        assert_eq!(tasks.len(), 10);
        assert_eq!(tasks[0], fake_task(0));
    }

    #[test]
    fn publish_failure_reaches_callback() {
        let logger = setup_test_logging();
        let publisher = MemoryTopicPublisher::new();
        publisher.fail_next(1);
        let mut enqueuer: WorkerPoolEnqueuer<IntakeBatchTask> =
            WorkerPoolEnqueuer::new(Arc::new(publisher.clone()), 1, &logger);

        let failures = Arc::new(AtomicUsize::new(0));
        for n in 0..2 {
            let failures = Arc::clone(&failures);
            enqueuer
                .enqueue(
                    fake_task(n),
                    Box::new(move |result| {
                        if result.is_err() {
                            failures.fetch_add(1, Ordering::SeqCst);
                        }
                    }),
                )
                .unwrap();
        }
        enqueuer.stop().unwrap();

        // One publish failed, the other went through
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.published().len(), 1);
    }

    #[test]
    fn enqueue_after_stop_fails() {
        let logger = setup_test_logging();
        let mut enqueuer: WorkerPoolEnqueuer<IntakeBatchTask> =
            WorkerPoolEnqueuer::new(Arc::new(MemoryTopicPublisher::new()), 1, &logger);
        enqueuer.stop().unwrap();
        assert_matches::assert_matches!(
            enqueuer.enqueue(fake_task(0), Box::new(|_| {})),
            Err(TaskQueueError::Stopped)
        );
    }
}
