//! Time-based job scheduler
//!
//! Each enabled [`Job`] gets its own tokio task that sleeps until the next
//! fire time of its [`Schedule`] and then runs the job to completion, so a
//! job never overlaps with itself.

mod job;
mod schedule;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub use job::Job;
pub use schedule::Schedule;

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::tasks::TaskManager;

/// Spawns and supervises the job loops
pub struct Scheduler {
    tasks: Arc<TaskManager>,
    jobs: Vec<Job>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Create a scheduler for every job not disabled in the configuration
    pub fn new(
        tasks: Arc<TaskManager>,
        config: &SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let disabled = config
            .disabled_jobs
            .iter()
            .map(|name| {
                name.parse::<Job>()
                    .map_err(|_| Error::config(format!("unknown job in disabled_jobs: {name}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let jobs = Job::ALL
            .into_iter()
            .filter(|job| !disabled.contains(job))
            .collect();

        Ok(Self {
            tasks,
            jobs,
            shutdown,
        })
    }

    /// Jobs this scheduler runs
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Run every job loop until the shutdown token is cancelled
    pub async fn run(self) {
        info!(jobs = self.jobs.len(), "Starting scheduler");

        let mut loops = JoinSet::new();
        for job in self.jobs {
            loops.spawn(job_loop(job, self.tasks.clone(), self.shutdown.clone()));
        }

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Job loop panicked");
            }
        }

        info!("Scheduler stopped");
    }
}

async fn job_loop(job: Job, tasks: Arc<TaskManager>, shutdown: CancellationToken) {
    let schedule = job.schedule();
    let mut next = schedule.next_after(Utc::now());

    loop {
        debug!(job = job.name(), next = %next, "Waiting for next run");
        if !sleep_until(next, &shutdown).await {
            break;
        }

        // Errors are already logged and counted
        let _ = run_once(&tasks, job).await;

        next = following_slot(schedule, next, Utc::now());
    }
}

/// Sleep until the wall clock reaches `at`; false when shut down first
///
/// Timers run on the monotonic clock, which can get ahead of the wall clock,
/// so an early wake-up sleeps again for the remainder.
async fn sleep_until(at: DateTime<Utc>, shutdown: &CancellationToken) -> bool {
    loop {
        let Ok(wait) = (at - Utc::now()).to_std() else {
            return true;
        };
        if wait.is_zero() {
            return true;
        }

        tokio::select! {
            () = shutdown.cancelled() => return false,
            () = tokio::time::sleep(wait) => {}
        }
    }
}

/// Fire time after the slot that just ran, never the same slot again
fn following_slot(schedule: Schedule, ran: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    schedule.next_after(now.max(ran))
}

/// Run a job once, logging the outcome and recording metrics
pub async fn run_once(tasks: &TaskManager, job: Job) -> Result<usize> {
    let started = Instant::now();
    let result = tasks.run(job).await;
    let elapsed = started.elapsed();

    metrics::counter!("pulsekeeper_job_runs_total", "job" => job.name()).increment(1);
    metrics::histogram!("pulsekeeper_job_duration_seconds", "job" => job.name())
        .record(elapsed.as_secs_f64());

    match &result {
        Ok(affected) => {
            debug!(job = job.name(), affected, elapsed_ms = elapsed.as_millis(), "Job finished");
        }
        Err(e) => {
            metrics::counter!("pulsekeeper_job_failures_total", "job" => job.name()).increment(1);
            error!(job = job.name(), error = %e, elapsed_ms = elapsed.as_millis(), "Job failed");
        }
    }

    result
}
