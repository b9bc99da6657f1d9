// tessera/src/jobs/scheduler.rs

use super::AdminJobManager;
use crate::error::CoreResult;
use crate::model::JobName;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{event, Level};

/// Delays between the end of one run and the start of the next.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
  pub process_jobs: Duration,
  pub expire_pending: Duration,
  pub expire_offline: Duration,
  pub check_offline_payments: Duration,
  pub cleanup: Duration,
}

impl Default for SchedulerSettings {
  fn default() -> Self {
    SchedulerSettings {
      process_jobs: Duration::from_secs(5),
      expire_pending: Duration::from_secs(60),
      expire_offline: Duration::from_secs(30 * 60),
      check_offline_payments: Duration::from_secs(30 * 60),
      cleanup: Duration::from_secs(60 * 60),
    }
  }
}

/// Drives the job queue with fixed-delay loops: periodic jobs are enqueued,
/// and a separate loop executes whatever is due.
pub struct AdminJobScheduler {
  manager: Arc<AdminJobManager>,
  settings: SchedulerSettings,
}

/// Running loops. Dropping it without `stop` leaves them running.
pub struct SchedulerHandle {
  shutdown: watch::Sender<bool>,
  tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
  /// Signals every loop and waits for the current iterations to finish.
  pub async fn stop(self) {
    let _ = self.shutdown.send(true);
    for task in self.tasks {
      if let Err(e) = task.await {
        event!(Level::WARN, error = %e, "Scheduler loop ended abnormally.");
      }
    }
    event!(Level::INFO, "Admin job scheduler stopped.");
  }
}

impl AdminJobScheduler {
  pub fn new(manager: Arc<AdminJobManager>, settings: SchedulerSettings) -> Self {
    AdminJobScheduler { manager, settings }
  }

  /// Spawns the loops on the current tokio runtime.
  pub fn start(self) -> SchedulerHandle {
    let (shutdown, receiver) = watch::channel(false);
    let mut tasks = Vec::new();

    let periodic = [
      (JobName::ExpirePendingReservations, self.settings.expire_pending),
      (JobName::ExpireOfflinePayments, self.settings.expire_offline),
      (JobName::CheckOfflinePayments, self.settings.check_offline_payments),
    ];
    for (job_name, delay) in periodic {
      let manager = self.manager.clone();
      tasks.push(tokio::spawn(fixed_delay(job_name.as_str(), delay, receiver.clone(), move || {
        let manager = manager.clone();
        async move { manager.schedule(job_name, BTreeMap::new()).await.map(|_| ()) }
      })));
    }

    let manager = self.manager.clone();
    tasks.push(tokio::spawn(fixed_delay("process_jobs", self.settings.process_jobs, receiver.clone(), move || {
      let manager = manager.clone();
      async move { manager.process_pending_jobs().await.map(|_| ()) }
    })));

    let manager = self.manager;
    tasks.push(tokio::spawn(fixed_delay("cleanup_jobs", self.settings.cleanup, receiver, move || {
      let manager = manager.clone();
      async move { manager.cleanup().await.map(|_| ()) }
    })));

    event!(Level::INFO, loops = tasks.len(), "Admin job scheduler started.");
    SchedulerHandle { shutdown, tasks }
  }
}

/// Runs `tick`, then sleeps `delay`, until shutdown. A slow tick delays the
/// next one; runs never overlap.
async fn fixed_delay<F, Fut>(name: &'static str, delay: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
  F: FnMut() -> Fut + Send + 'static,
  Fut: Future<Output = CoreResult<()>> + Send,
{
  while !*shutdown.borrow() {
    if let Err(e) = tick().await {
      event!(Level::ERROR, task = name, error = %e, "Scheduled task failed.");
    }
    tokio::select! {
      _ = tokio::time::sleep(delay) => {}
      changed = shutdown.changed() => {
        if changed.is_err() || *shutdown.borrow() {
          break;
        }
      }
    }
  }
  event!(Level::DEBUG, task = name, "Scheduled loop stopped.");
}
