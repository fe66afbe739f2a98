//! Background pose estimation with a bounded wait.
//!
//! The estimator lives on its own thread. The render thread submits one job
//! per consumed frame and waits at most the configured budget for the
//! answer. A job that overruns is abandoned: its late result is drained and
//! discarded before the next submission, and no new job is submitted while
//! it is still running.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::field::Configuration;
use crate::frame::ImageFrame;

use super::estimator::{Detection, PoseEstimator, TargetProbe};

pub(crate) struct Job {
    pub sequence: u64,
    pub frame: Arc<ImageFrame>,
    pub probes: Vec<TargetProbe>,
    pub config: Configuration,
}

struct JobResult {
    sequence: u64,
    detections: Vec<Option<Detection>>,
}

#[derive(Debug)]
pub(crate) enum WorkerOutcome {
    Done(Vec<Option<Detection>>),
    /// The budget elapsed before the estimator answered.
    TimedOut,
    /// A previous job is still running; nothing was submitted.
    Busy,
    /// The worker thread is gone (estimator panicked).
    Disconnected,
}

pub(crate) struct DetectionWorker {
    jobs: Option<Sender<Job>>,
    results: Receiver<JobResult>,
    handle: Option<JoinHandle<()>>,
    in_flight: Option<u64>,
}

impl DetectionWorker {
    pub(crate) fn spawn<E: PoseEstimator>(mut estimator: E) -> std::io::Result<Self> {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (result_tx, result_rx) = mpsc::channel::<JobResult>();
        let handle = thread::Builder::new()
            .name(format!("pose-{}", estimator.name()))
            .spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    let detections = estimator.estimate(&job.frame, &job.probes, &job.config);
                    let result = JobResult {
                        sequence: job.sequence,
                        detections,
                    };
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            handle: Some(handle),
            in_flight: None,
        })
    }

    pub(crate) fn run(&mut self, job: Job, budget: Duration) -> WorkerOutcome {
        if let Some(stale) = self.in_flight {
            match self.results.try_recv() {
                Ok(result) => {
                    log::debug!(
                        "discarding late detection for frame {} (wanted {})",
                        result.sequence,
                        stale
                    );
                    self.in_flight = None;
                }
                Err(TryRecvError::Empty) => return WorkerOutcome::Busy,
                Err(TryRecvError::Disconnected) => return WorkerOutcome::Disconnected,
            }
        }

        let sequence = job.sequence;
        let Some(jobs) = &self.jobs else {
            return WorkerOutcome::Disconnected;
        };
        if jobs.send(job).is_err() {
            return WorkerOutcome::Disconnected;
        }
        self.in_flight = Some(sequence);

        match self.results.recv_timeout(budget) {
            Ok(result) if result.sequence == sequence => {
                self.in_flight = None;
                WorkerOutcome::Done(result.detections)
            }
            // Cannot happen after the drain above, but never apply a result
            // to the wrong frame.
            Ok(_) => WorkerOutcome::TimedOut,
            Err(RecvTimeoutError::Timeout) => WorkerOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => WorkerOutcome::Disconnected,
        }
    }
}

impl Drop for DetectionWorker {
    fn drop(&mut self) {
        // Closing the job channel ends the worker loop.
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if self.in_flight.is_none() {
                let _ = handle.join();
            }
        }
    }
}
