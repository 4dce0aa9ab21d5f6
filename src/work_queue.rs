use std::{sync::Mutex, thread};

/// A queue of jobs that may be shared across multiple worker threads. The
/// producer must have the entire list of jobs in hand when creating the
/// WorkQueue; adding new jobs to an existing WorkQueue is not supported.
#[derive(Debug)]
pub(crate) struct WorkQueue<T> {
    // Most work queue implementations would use a VecDeque to allow new
    // jobs to be pushed to the back of the queue, but since clients have
    // all the jobs in hand when they call WorkQueue::new(), a plain Vec
    // saves an allocation and copy.
    jobs: Mutex<Vec<T>>,
}

impl<T> WorkQueue<T> {
    pub(crate) fn new(jobs: Vec<T>) -> Self {
        WorkQueue {
            jobs: Mutex::new(jobs),
        }
    }

    /// Returns a job from the queue, or None if the queue is empty.
    ///
    /// # Panics
    ///
    /// Panics if the mutex protecting the job queue is poisoned.
    pub(crate) fn dequeue_job(&self) -> Option<T> {
        self.jobs.lock().unwrap().pop()
    }
}

/// Runs `f` over every job on up to `worker_count` threads and returns the
/// results, in no particular order. Callers that care which job a result
/// belongs to should carry the job's identity in the result.
pub(crate) fn fan_out<J, R, F>(jobs: Vec<J>, worker_count: usize, f: F) -> Vec<R>
where
    J: Send,
    R: Send,
    F: Fn(J) -> R + Sync,
{
    let worker_count = worker_count.clamp(1, jobs.len().max(1));
    let queue = WorkQueue::new(jobs);
    let results = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for _ in 0..worker_count {
            scope.spawn(|| {
                while let Some(job) = queue.dequeue_job() {
                    let result = f(job);
                    results.lock().unwrap().push(result);
                }
            });
        }
    });

    results.into_inner().unwrap()
}
