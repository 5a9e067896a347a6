use chrono::{DateTime, Utc};
use cron::Schedule;
use futures_util::future::BoxFuture;
use log::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

type CallbackError = Box<dyn std::error::Error + Sync + Send>;
type CallbackFunction = dyn Fn() -> BoxFuture<'static, Result<(), CallbackError>> + Sync + Send;

static JOB_ID_COUNTER: AtomicI32 = AtomicI32::new(1);

struct JobState {
  name: String,
  schedule: Schedule,
  callback: Arc<CallbackFunction>,
  handle: Option<tokio::task::AbortHandle>,
  latest_error: Option<String>,
}

/// One scheduled trigger: a task-spawned loop sleeping until the next cron
/// firing.
#[derive(Clone)]
pub(crate) struct Job {
  pub id: i32,
  state: Arc<Mutex<JobState>>,
}

impl std::fmt::Debug for Job {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    return f.debug_struct("Job").field("id", &self.id).finish_non_exhaustive();
  }
}

impl Job {
  fn new(id: i32, name: String, schedule: Schedule, callback: Box<CallbackFunction>) -> Self {
    return Job {
      id,
      state: Arc::new(Mutex::new(JobState {
        name,
        schedule,
        callback: callback.into(),
        handle: None,
        latest_error: None,
      })),
    };
  }

  pub(crate) fn start(&self) {
    let job = self.clone();
    let (name, schedule) = {
      let lock = job.state.lock();
      if let Some(ref handle) = lock.handle {
        warn!("Starting an already running job");
        handle.abort();
      }
      (lock.name.clone(), lock.schedule.clone())
    };

    self.state.lock().handle = Some(
      tokio::spawn(async move {
        loop {
          let Some(next) = schedule.upcoming(Utc).next() else {
            break;
          };
          let Ok(duration) = (next - Utc::now()).to_std() else {
            continue;
          };

          tokio::time::sleep(duration).await;
          let _ = job.run_now().await;
        }

        info!("Exited job: '{name}'");
      })
      .abort_handle(),
    );
  }

  pub(crate) async fn run_now(&self) -> Result<(), String> {
    let callback = self.state.lock().callback.clone();
    let result = callback().await.map_err(|err| err.to_string());
    self.state.lock().latest_error = result.as_ref().err().cloned();
    return result;
  }

  pub(crate) fn next_run(&self) -> Option<DateTime<Utc>> {
    let lock = self.state.lock();
    if lock.handle.is_some() {
      return lock.schedule.upcoming(Utc).next();
    }
    return None;
  }

  fn stop(&self) {
    let mut lock = self.state.lock();
    if let Some(ref handle) = lock.handle {
      handle.abort();
    }
    lock.handle = None;
  }

  pub(crate) fn name(&self) -> String {
    return self.state.lock().name.clone();
  }
}

/// Registry of cron jobs; dropping it stops every spawned loop.
#[derive(Debug)]
pub(crate) struct JobRegistry {
  jobs: Mutex<HashMap<i32, Job>>,
}

impl JobRegistry {
  pub(crate) fn new() -> Self {
    return JobRegistry {
      jobs: Mutex::new(HashMap::new()),
    };
  }

  pub(crate) fn new_job(
    &self,
    name: impl Into<String>,
    schedule: Schedule,
    callback: Box<CallbackFunction>,
  ) -> Job {
    let id = JOB_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
    let job = Job::new(id, name.into(), schedule, callback);
    self.jobs.lock().insert(id, job.clone());
    return job;
  }

  pub(crate) fn len(&self) -> usize {
    return self.jobs.lock().len();
  }

  pub(crate) fn stop_all(&self) {
    let jobs = self.jobs.lock();
    for job in jobs.values() {
      job.stop();
    }
  }
}

impl Drop for JobRegistry {
  fn drop(&mut self) {
    let mut jobs = self.jobs.lock();
    for job in jobs.values_mut() {
      job.stop();
    }
  }
}

pub(crate) fn build_callback<F, Fut>(f: F) -> Box<CallbackFunction>
where
  F: 'static + Sync + Send + Fn() -> Fut,
  Fut: Send + std::future::Future<Output = Result<(), CallbackError>>,
{
  let fun = Arc::new(f);
  return Box::new(move || {
    let fun = fun.clone();
    return Box::pin(async move {
      return fun().await;
    });
  });
}

/// Parse a cron spec, accepting both 6- and 7-field (with seconds) forms.
pub(crate) fn parse_schedule(spec: &str) -> Result<Schedule, cron::error::Error> {
  return Schedule::from_str(spec);
}
