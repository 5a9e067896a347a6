use chrono::Utc;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::DataDir;
use crate::broker::{Broker, BrokerError, SubscribeOptions, Subscription};
use crate::jobs::TRACEPARENT_HEADER;
use crate::metrics::{JOB_DEAD_LETTERED, JOB_RETRIED, JOB_SUCCESS, metrics};
use crate::runtime::EnginePair;

/// Retries before a job is quarantined; max deliveries is one more.
pub(crate) const MAX_RETRIES: u64 = 5;

/// Forensic record persisted when a job exhausts its deliveries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrashSnapshot {
  pub timestamp: chrono::DateTime<Utc>,
  pub error: String,
  /// The job envelope as received; kept as raw JSON for replay.
  pub input: serde_json::Value,
  pub env: HashMap<String, String>,
  pub wasm_file: String,
}

/// Everything a worker subscriber needs besides its engine pair.
pub(crate) struct WorkerContext {
  pub broker: Broker,
  pub data_dir: DataDir,
  pub stream: String,
  pub module_path: String,
  pub env: HashMap<String, String>,
  pub timeout: Duration,
}

pub(crate) struct WorkerHandle {
  pub subscription: Subscription,
  task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for WorkerHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    return f
      .debug_struct("WorkerHandle")
      .field("subscription", &self.subscription)
      .finish_non_exhaustive();
  }
}

impl WorkerHandle {
  /// Drain the subscription (waits for in-flight work) and let the worker
  /// task exit.
  pub(crate) async fn drain(self) {
    self.subscription.drain().await;
    if let Err(err) = self.task.await {
      warn!("Worker task ended abnormally: {err}");
    }
  }
}

/// Start one queue-subscribed worker on the function's subject, owning one
/// pre-warmed pair for its lifetime.
pub(crate) fn start_worker_subscriber(
  id: usize,
  ctx: Arc<WorkerContext>,
  pair: EnginePair,
) -> Result<WorkerHandle, BrokerError> {
  let subject = crate::function_subject(&ctx.module_path);
  let queue_group = format!("WORKERS_{}", crate::hash_string(&ctx.module_path));

  let subscription = ctx.broker.queue_subscribe(
    &subject,
    &queue_group,
    SubscribeOptions {
      bind_stream: ctx.stream.clone(),
      max_deliver: MAX_RETRIES + 1,
    },
  )?;
  debug!("Worker {id} subscribed on '{subject}' (group {queue_group})");

  let task = {
    let subscription = subscription.clone();
    let pair = Arc::new(pair);
    tokio::spawn(async move {
      worker_loop(id, ctx, pair, subscription).await;
    })
  };

  return Ok(WorkerHandle {
    subscription,
    task,
  });
}

async fn worker_loop(
  id: usize,
  ctx: Arc<WorkerContext>,
  pair: Arc<EnginePair>,
  subscription: Subscription,
) {
  while let Some(msg) = subscription.fetch().await {
    let meta = match msg.metadata() {
      Ok(meta) => meta,
      Err(err) => {
        error!("Failed to get message metadata: {err}");
        msg.nak();
        continue;
      }
    };

    msg.in_progress();

    let trace = msg
      .headers()
      .get(TRACEPARENT_HEADER)
      .cloned()
      .unwrap_or_default();
    let input = msg.payload().to_vec();

    let outcome = {
      let pair = pair.clone();
      let timeout = ctx.timeout;
      tokio::task::spawn_blocking(move || pair.execute(&input, timeout)).await
    };

    match outcome {
      Ok(Ok(_output)) => {
        if let Err(err) = msg.ack() {
          warn!("Failed to ack job seq {}: {err}", meta.stream_seq);
        }
        metrics().jobs_total.with_label_values(&[JOB_SUCCESS]).inc();
        debug!(
          "Worker {id} completed job (seq {}, delivery {}, trace {trace})",
          meta.stream_seq, meta.delivered
        );
      }
      Ok(Err(exec_err)) => {
        let error_message = format!(
          "Wasm Error: {} | Stderr: {}",
          exec_err.message(),
          exec_err.stderr()
        );

        if meta.delivered > MAX_RETRIES {
          // Terminal: quarantine with a dump, then remove from the queue.
          let snapshot = CrashSnapshot {
            timestamp: Utc::now(),
            error: error_message,
            input: serde_json::from_slice(msg.payload())
              .unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(msg.payload()).into_owned())
              }),
            env: ctx.env.clone(),
            wasm_file: ctx.module_path.clone(),
          };
          save_crash_dump(&ctx.data_dir, meta.stream_seq, &snapshot);

          if let Err(err) = msg.ack() {
            warn!("Failed to ack dead-lettered job seq {}: {err}", meta.stream_seq);
          }
          metrics().jobs_total.with_label_values(&[JOB_DEAD_LETTERED]).inc();
          error!(
            "Job dead-lettered after {} deliveries (seq {}, trace {trace})",
            meta.delivered, meta.stream_seq
          );
        } else {
          // Linear backoff: one second per delivery so far.
          let backoff = Duration::from_secs(meta.delivered);
          msg.nak_with_delay(backoff);
          metrics().jobs_total.with_label_values(&[JOB_RETRIED]).inc();
          warn!(
            "Job failed (seq {}, delivery {}, trace {trace}); retrying in {backoff:?}: {}",
            meta.stream_seq,
            meta.delivered,
            exec_err.message()
          );
        }
      }
      Err(join_err) => {
        error!("Worker execution task panicked: {join_err}");
        msg.nak();
      }
    }
  }

  debug!("Worker {id} exited");
}

fn save_crash_dump(data_dir: &DataDir, stream_seq: u64, snapshot: &CrashSnapshot) {
  let filename = format!(
    "crash_{}_seq{stream_seq}.json",
    snapshot.timestamp.format("%Y%m%d-%H%M%S")
  );
  let path = data_dir.crash_dump_path(&filename);

  match serde_json::to_vec_pretty(snapshot) {
    Ok(bytes) => {
      if let Err(err) = std::fs::write(&path, bytes) {
        error!("Failed to persist crash dump {path:?}: {err}");
      } else {
        warn!("Crash dump persisted: {path:?}");
      }
    }
    Err(err) => error!("Failed to encode crash snapshot: {err}"),
  }
}

/// Load a crash dump for replay.
pub fn load_crash_dump(path: &std::path::Path) -> Result<CrashSnapshot, std::io::Error> {
  let bytes = std::fs::read(path)?;
  return serde_json::from_slice(&bytes).map_err(std::io::Error::other);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::broker::StreamConfig;
  use crate::host::test_host_ctx;
  use crate::runtime::RuntimeConfig;
  use crate::runtime::tests::{crash_wat, echo_wat};

  async fn worker_fixture(
    wasm: Vec<u8>,
    module_path: &str,
  ) -> (Arc<WorkerContext>, WorkerHandle, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let host = test_host_ctx().await;
    let broker = host.broker.clone();

    broker
      .create_stream(StreamConfig {
        name: "GOJINN_WORKER".to_string(),
        subjects: vec!["exec.>".to_string()],
        replicas: 1,
      })
      .expect("stream");

    let ctx = Arc::new(WorkerContext {
      broker: broker.clone(),
      data_dir: DataDir(dir.path().to_path_buf()),
      stream: "GOJINN_WORKER".to_string(),
      module_path: module_path.to_string(),
      env: HashMap::from([("MODE".to_string(), "test".to_string())]),
      timeout: Duration::from_secs(5),
    });

    let pair = EnginePair::new(&wasm, RuntimeConfig::default(), host.clone()).expect("pair");
    let handle = start_worker_subscriber(0, ctx.clone(), pair).expect("subscriber");
    return (ctx, handle, dir);
  }

  fn dead_letter_count() -> u64 {
    return metrics().jobs_total.with_label_values(&[JOB_DEAD_LETTERED]).get();
  }

  #[tokio::test]
  async fn test_successful_job_is_acked_and_counted() {
    let (ctx, handle, _dir) =
      worker_fixture(echo_wat(r#"{"status":200}"#), "fixtures/ok.wasm").await;
    let before = metrics().jobs_total.with_label_values(&[JOB_SUCCESS]).get();

    crate::jobs::publish_async_job(&ctx.broker, &ctx.module_path, "{}", None)
      .expect("publish");

    let stream = ctx.broker.get_stream("GOJINN_WORKER").expect("stream");
    for _ in 0..100 {
      if stream.pending_count() == 0 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stream.pending_count(), 0, "job should be acked off the queue");
    assert!(metrics().jobs_total.with_label_values(&[JOB_SUCCESS]).get() > before);

    handle.drain().await;
  }

  // Slow by design: five real backoffs (1..5s) before the dump.
  #[tokio::test]
  async fn test_crashing_job_retries_then_dead_letters() {
    let (ctx, handle, dir) =
      worker_fixture(crash_wat(), "fixtures/fail.wasm").await;
    let before = dead_letter_count();

    crate::jobs::publish_async_job(&ctx.broker, &ctx.module_path, "{}", None)
      .expect("publish");

    // Six deliveries with linear 1..5s backoffs in between, then a crash
    // dump and a terminal ack.
    let stream = ctx.broker.get_stream("GOJINN_WORKER").expect("stream");
    for _ in 0..300 {
      if stream.pending_count() == 0 && dead_letter_count() > before {
        break;
      }
      tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(stream.pending_count(), 0, "terminal failure must ack the message");
    assert_eq!(dead_letter_count(), before + 1);

    let dumps: Vec<_> = std::fs::read_dir(dir.path())
      .expect("read dir")
      .filter_map(|e| e.ok())
      .map(|e| e.file_name().to_string_lossy().into_owned())
      .filter(|name| name.starts_with("crash_") && name.ends_with(".json"))
      .collect();
    assert_eq!(dumps.len(), 1, "exactly one crash dump, got {dumps:?}");
    assert!(dumps[0].contains("_seq"));

    let snapshot =
      load_crash_dump(&dir.path().join(&dumps[0])).expect("parse dump");
    assert_eq!(snapshot.wasm_file, "fixtures/fail.wasm");
    assert_eq!(snapshot.env.get("MODE").map(String::as_str), Some("test"));
    assert!(snapshot.error.contains("Wasm Error"));

    handle.drain().await;
  }

  #[tokio::test]
  async fn test_crash_snapshot_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_dir = DataDir(dir.path().to_path_buf());

    let snapshot = CrashSnapshot {
      timestamp: Utc::now(),
      error: "Wasm Error: trap".to_string(),
      input: serde_json::json!({"method": "ASYNC", "body": "x"}),
      env: HashMap::new(),
      wasm_file: "f.wasm".to_string(),
    };
    save_crash_dump(&data_dir, 7, &snapshot);

    let name = format!("crash_{}_seq7.json", snapshot.timestamp.format("%Y%m%d-%H%M%S"));
    let loaded = load_crash_dump(&data_dir.crash_dump_path(&name)).expect("load");
    assert_eq!(loaded.error, snapshot.error);
    assert_eq!(loaded.input["method"], "ASYNC");
  }
}
