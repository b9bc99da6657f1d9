// tessera/src/jobs/mod.rs

//! Persistent admin job queue.
//!
//! Jobs are rows in the `JobStore`. Every executor registered for a job's
//! name runs in isolation; the job is EXECUTED only when all of them
//! succeed, otherwise it is retried with exponential backoff until
//! `max_attempts`, then parked as FAILED.

pub mod executors;
pub mod scheduler;

pub use executors::{
  CheckOfflinePaymentsExecutor, ExpireOfflinePaymentsExecutor, ExpirePendingReservationsExecutor,
  RetryConfirmationEmailExecutor,
};
pub use scheduler::{AdminJobScheduler, SchedulerHandle, SchedulerSettings};

use crate::error::CoreResult;
use crate::model::{AdminJobSchedule, JobName};
use crate::services::PaymentServices;
use async_trait::async_trait;
use chrono::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{event, instrument, Level};

#[async_trait]
pub trait AdminJobExecutor: Send + Sync {
  fn job_name(&self) -> JobName;

  async fn execute(&self, job: &AdminJobSchedule) -> CoreResult<()>;
}

/// Retry and retention settings of the queue.
#[derive(Debug, Clone, Copy)]
pub struct JobPolicy {
  pub max_attempts: u32,
  pub initial_delay: Duration,
  pub max_delay: Duration,
  pub batch_size: usize,
  pub keep_executed: Duration,
  pub keep_failed: Duration,
}

impl Default for JobPolicy {
  fn default() -> Self {
    JobPolicy {
      max_attempts: 10,
      initial_delay: Duration::minutes(1),
      max_delay: Duration::hours(1),
      batch_size: 100,
      keep_executed: Duration::days(1),
      keep_failed: Duration::weeks(1),
    }
  }
}

impl JobPolicy {
  /// Delay before retry number `attempts` (1-based): doubles each time, capped.
  pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(20);
    let factor = 1i64 << exponent;
    let delay = self
      .initial_delay
      .checked_mul(factor as i32)
      .unwrap_or(self.max_delay);
    delay.min(self.max_delay)
  }
}

/// What one processing pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobRunSummary {
  pub executed: usize,
  pub rescheduled: usize,
  pub failed: usize,
}

pub struct AdminJobManager {
  services: PaymentServices,
  executors: Vec<Arc<dyn AdminJobExecutor>>,
  policy: JobPolicy,
}

impl AdminJobManager {
  pub fn new(services: PaymentServices, executors: Vec<Arc<dyn AdminJobExecutor>>, policy: JobPolicy) -> Self {
    AdminJobManager {
      services,
      executors,
      policy,
    }
  }

  pub fn policy(&self) -> &JobPolicy {
    &self.policy
  }

  /// Queues `job_name` to run as soon as the next pass picks it up.
  pub async fn schedule(&self, job_name: JobName, metadata: BTreeMap<String, String>) -> CoreResult<i64> {
    let now = self.services.clock.now();
    let id = self.services.jobs.schedule(job_name, now, metadata).await?;
    event!(Level::DEBUG, job_id = id, job = %job_name, "Job scheduled.");
    Ok(id)
  }

  /// Runs every due job once.
  #[instrument(name = "AdminJobManager::process_pending_jobs", skip(self))]
  pub async fn process_pending_jobs(&self) -> CoreResult<JobRunSummary> {
    let now = self.services.clock.now();
    let due = self.services.jobs.pending(now, self.policy.batch_size).await?;
    let mut summary = JobRunSummary::default();
    for job in due {
      match self.run_job(&job).await? {
        JobStatusAfterRun::Executed => summary.executed += 1,
        JobStatusAfterRun::Rescheduled => summary.rescheduled += 1,
        JobStatusAfterRun::Failed => summary.failed += 1,
      }
    }
    if summary != JobRunSummary::default() {
      event!(
        Level::INFO,
        executed = summary.executed,
        rescheduled = summary.rescheduled,
        failed = summary.failed,
        "Job pass finished."
      );
    }
    Ok(summary)
  }

  async fn run_job(&self, job: &AdminJobSchedule) -> CoreResult<JobStatusAfterRun> {
    let executors: Vec<_> = self.executors.iter().filter(|e| e.job_name() == job.job_name).collect();
    let attempts = job.attempts + 1;
    let now = self.services.clock.now();

    if executors.is_empty() {
      event!(Level::ERROR, job_id = job.id, job = %job.job_name, "No executor registered.");
      self.services.jobs.mark_failed(job.id, attempts, "no executor registered", now).await?;
      return Ok(JobStatusAfterRun::Failed);
    }

    let mut errors = Vec::new();
    for executor in executors {
      // One executor failing does not stop the others.
      if let Err(e) = executor.execute(job).await {
        event!(Level::WARN, job_id = job.id, job = %job.job_name, error = %e, "Executor failed.");
        errors.push(e.to_string());
      }
    }

    let finished = self.services.clock.now();
    if errors.is_empty() {
      self.services.jobs.mark_executed(job.id, finished).await?;
      return Ok(JobStatusAfterRun::Executed);
    }
    let error = errors.join("; ");
    if attempts >= self.policy.max_attempts {
      event!(Level::ERROR, job_id = job.id, job = %job.job_name, attempts, error = %error, "Job gave up.");
      self.services.jobs.mark_failed(job.id, attempts, &error, finished).await?;
      return Ok(JobStatusAfterRun::Failed);
    }
    let next_run = finished + self.policy.delay_for_attempt(attempts);
    self.services.jobs.reschedule(job.id, next_run, attempts, &error).await?;
    Ok(JobStatusAfterRun::Rescheduled)
  }

  /// Drops old EXECUTED and FAILED rows.
  pub async fn cleanup(&self) -> CoreResult<u64> {
    let now = self.services.clock.now();
    let removed = self
      .services
      .jobs
      .cleanup(now - self.policy.keep_executed, now - self.policy.keep_failed)
      .await?;
    if removed > 0 {
      event!(Level::INFO, removed, "Old jobs removed.");
    }
    Ok(removed)
  }
}

enum JobStatusAfterRun {
  Executed,
  Rescheduled,
  Failed,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn backoff_doubles_and_caps() {
    let policy = JobPolicy::default();
    assert_eq!(policy.delay_for_attempt(1), Duration::minutes(1));
    assert_eq!(policy.delay_for_attempt(2), Duration::minutes(2));
    assert_eq!(policy.delay_for_attempt(4), Duration::minutes(8));
    assert_eq!(policy.delay_for_attempt(9), Duration::hours(1));
    assert_eq!(policy.delay_for_attempt(400), Duration::hours(1));
  }
}
