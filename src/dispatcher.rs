//! Bounded worker-pool job dispatcher with stalled-job detection and
//! abandon-and-replace termination.
//!
//! Ported from RadSSH's `dispatcher.py`. Jobs are arbitrary async closures;
//! each worker pops one, runs it, and publishes a [`JobSummary`] on the
//! shared output channel. `async_results(timeout)` polls that channel and
//! raises [`crate::error::DispatchError::UnfinishedJobs`] — not a failure,
//! a "come back later" signal — when jobs are still outstanding after the
//! timeout elapses.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::DispatchError;

/// A boxed, one-shot unit of work submitted to a [`Dispatcher`].
pub type Job = Pin<Box<dyn Future<Output = JobOutcome> + Send>>;

/// What a job produced: its boxed result, or the boxed error if it failed.
pub type JobOutcome = Result<Box<dyn std::any::Any + Send>, Box<dyn std::error::Error + Send + Sync>>;

/// Dispatcher info returned for one completed (or failed) job.
pub struct JobSummary {
    /// Sequence number assigned at `submit` time.
    pub job_id: u64,
    /// `true` if the handler returned `Ok`.
    pub completed: bool,
    /// The handler's boxed return value, or boxed error.
    pub result: JobOutcome,
    /// When the job was submitted.
    pub start_time: Instant,
    /// When the job finished.
    pub end_time: Instant,
}

impl JobSummary {
    /// Wall-clock duration the job ran for.
    pub fn duration(&self) -> Duration {
        self.end_time.duration_since(self.start_time)
    }
}

struct Envelope {
    job_id: u64,
    start_time: Instant,
    job: Job,
}

/// Generic bounded async worker pool. Mirrors `generic_dispatch`/`Dispatcher`
/// from the original: a shared input channel, N worker tasks, and an output
/// channel of [`JobSummary`] values.
pub struct Dispatcher {
    input: mpsc::UnboundedSender<Option<Envelope>>,
    output_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(u64, JobSummary)>>,
    workers: Vec<JoinHandle<()>>,
    terminated: Arc<AtomicBool>,
    job_sequence: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    requests: AtomicUsize,
}

impl Dispatcher {
    /// Start a fixed-size pool of `pool_size` worker tasks.
    pub fn new(pool_size: usize) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel::<Option<Envelope>>();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let input_rx = Arc::new(tokio::sync::Mutex::new(input_rx));
        let terminated = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(pool_size);
        for _ in 0..pool_size.max(1) {
            let input_rx = input_rx.clone();
            let output_tx = output_tx.clone();
            let in_flight = in_flight.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let envelope = {
                        let mut guard = input_rx.lock().await;
                        guard.recv().await
                    };
                    let Some(Some(envelope)) = envelope else {
                        break;
                    };
                    let Envelope {
                        job_id,
                        start_time,
                        job,
                    } = envelope;
                    let result = job.await;
                    let completed = result.is_ok();
                    let summary = JobSummary {
                        job_id,
                        completed,
                        result,
                        start_time,
                        end_time: Instant::now(),
                    };
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    let _ = output_tx.send((job_id, summary));
                }
            }));
        }

        Dispatcher {
            input: input_tx,
            output_rx: tokio::sync::Mutex::new(output_rx),
            workers,
            terminated,
            job_sequence: AtomicUsize::new(0),
            in_flight,
            requests: AtomicUsize::new(0),
        }
    }

    /// Submit a boxed job, returning its job id. Fails if the dispatcher was terminated.
    pub fn submit(&self, job: Job) -> Result<u64, DispatchError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(DispatchError::Terminated);
        }
        let job_id = self.job_sequence.fetch_add(1, Ordering::SeqCst) as u64;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.requests.fetch_add(1, Ordering::SeqCst);
        let _ = self.input.send(Some(Envelope {
            job_id,
            start_time: Instant::now(),
            job,
        }));
        Ok(job_id)
    }

    /// Jobs submitted, still outstanding.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Block until every submitted job has produced a summary (does not
    /// itself drain the output channel — callers pair this with `async_results`).
    pub async fn wait(&self) {
        while self.in_flight.load(Ordering::SeqCst) > 0 && !self.terminated.load(Ordering::SeqCst)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.requests.store(0, Ordering::SeqCst);
    }

    /// Poll for the next completed job, waiting up to `timeout`. Returns
    /// `Ok(None)` once every submitted job has been drained and none remain
    /// in flight. Returns [`DispatchError::UnfinishedJobs`] if `timeout`
    /// elapses with jobs still outstanding — callers should treat this as
    /// "stalled, try again," not a terminal failure.
    pub async fn next_result(
        &self,
        timeout: Duration,
    ) -> Result<Option<(u64, JobSummary)>, DispatchError> {
        let mut rx = self.output_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => Ok(None),
            Err(_) => {
                let remaining = self.in_flight.load(Ordering::SeqCst);
                if remaining == 0 {
                    Ok(None)
                } else {
                    Err(DispatchError::UnfinishedJobs {
                        remaining,
                        total: self.requests.load(Ordering::SeqCst),
                    })
                }
            }
        }
    }

    /// Set the terminated flag (rejecting new submits) and inject one null
    /// sentinel per worker so idle workers exit cleanly. Blocked workers are
    /// deliberately left to die with their blocking I/O: per the
    /// abandon-and-replace policy, the caller should treat this dispatcher as
    /// garbage and construct a fresh one rather than wait for it to drain.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        for _ in 0..self.workers.len() {
            let _ = self.input.send(None);
        }
    }
}

/// Box a plain value as a [`JobOutcome`] success.
pub fn ok_outcome<T: std::any::Any + Send>(value: T) -> JobOutcome {
    Ok(Box::new(value))
}

/// Box an error as a [`JobOutcome`] failure.
pub fn err_outcome<E: std::error::Error + Send + Sync + 'static>(error: E) -> JobOutcome {
    Err(Box::new(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn job_ok(value: u32) -> Job {
        Box::pin(async move { ok_outcome(value) })
    }

    fn job_err() -> Job {
        Box::pin(async move { err_outcome(io::Error::other("boom")) })
    }

    #[tokio::test]
    async fn dispatcher_completeness_after_wait() {
        let dispatcher = Dispatcher::new(4);
        for i in 0..10u32 {
            dispatcher.submit(job_ok(i)).unwrap();
        }
        dispatcher.wait().await;
        let mut seen = 0;
        while let Ok(Some(_)) = dispatcher.next_result(Duration::from_millis(50)).await {
            seen += 1;
        }
        assert_eq!(seen, 10);
    }

    #[tokio::test]
    async fn failed_handler_reports_completed_false() {
        let dispatcher = Dispatcher::new(1);
        dispatcher.submit(job_err()).unwrap();
        let (_, summary) = dispatcher
            .next_result(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(!summary.completed);
    }

    #[tokio::test]
    async fn stalled_job_reports_unfinished_then_resumes() {
        let dispatcher = Dispatcher::new(2);
        dispatcher.submit(job_ok(1)).unwrap();
        dispatcher.submit(Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            ok_outcome(2u32)
        })).unwrap();

        let (_, fast) = dispatcher
            .next_result(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(fast.completed);

        let stalled = dispatcher.next_result(Duration::from_millis(20)).await;
        assert!(matches!(
            stalled,
            Err(DispatchError::UnfinishedJobs { remaining: 1, .. })
        ));

        let (_, slow) = dispatcher
            .next_result(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(slow.completed);
    }

    #[tokio::test]
    async fn submit_after_terminate_is_rejected() {
        let dispatcher = Dispatcher::new(1);
        dispatcher.terminate();
        assert!(matches!(
            dispatcher.submit(job_ok(1)),
            Err(DispatchError::Terminated)
        ));
    }
}
