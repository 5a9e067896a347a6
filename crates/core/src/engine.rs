use axum::http::HeaderMap;
use axum::response::Response;
use log::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::broker::{self, Broker, BrokerError, BrokerOptions, ClusterOptions, KvConfig, StreamConfig};
use crate::buffer_pool::BufferPool;
use crate::config::{Config, ConfigError};
use crate::data_dir::DataDir;
use crate::executor::{self, SyncDeps};
use crate::host::db::{DbError, HostDb};
use crate::host::{AiClient, HostCtx, KvSlot};
use crate::jobs;
use crate::metrics::metrics;
use crate::pool::{PoolError, WorkerPool};
use crate::runtime::{EnginePair, RuntimeConfig, RuntimeError};
use crate::scheduler::{JobRegistry, build_callback, parse_schedule};
use crate::signing::{self, SigningError, TrustRoot};
use crate::snapshot::{self, SnapshotError};
use crate::worker::{CrashSnapshot, WorkerContext, WorkerHandle, start_worker_subscriber};

/// Durable work-queue stream shared by every function on the node.
pub const WORKER_STREAM: &str = "GOJINN_WORKER";
/// Replicated KV bucket backing `host_kv_*` and the distributed mutex.
pub const STATE_BUCKET: &str = "GOJINN_STATE";

/// Cooperative provisioning retry cadence.
const PROVISION_INTERVAL: Duration = Duration::from_secs(2);
/// Queue-depth sampling cadence.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProvisionError {
  #[error("config error: {0}")]
  Config(#[from] ConfigError),
  #[error("failed to load wasm module: {0}")]
  Signing(#[from] SigningError),
  #[error("broker error: {0}")]
  Broker(#[from] BrokerError),
  #[error("pool error: {0}")]
  Pool(#[from] PoolError),
  #[error("runtime error: {0}")]
  Runtime(#[from] RuntimeError),
  #[error("database error: {0}")]
  Db(#[from] DbError),
  #[error("snapshot error: {0}")]
  Snapshot(#[from] SnapshotError),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

#[derive(Debug)]
struct EngineInner {
  config: Config,
  data_dir: DataDir,
  runtime_config: RuntimeConfig,
  trust: TrustRoot,

  broker: Broker,
  kv_slot: KvSlot,
  host: Arc<HostCtx>,
  db: Option<Arc<HostDb>>,
  ai: Option<Arc<AiClient>>,

  buffers: BufferPool,
  pool: tokio::sync::RwLock<WorkerPool>,
  /// Queue subscribers; exclusive during reload, untouched in steady state.
  subs: tokio::sync::Mutex<Vec<WorkerHandle>>,
  jobs: JobRegistry,

  background: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
  cleaned_up: AtomicBool,
}

/// Root handle owning one function's pool, subscriptions, bindings and the
/// shared per-process services.
#[derive(Clone, Debug)]
pub struct Engine {
  inner: Arc<EngineInner>,
}

impl Engine {
  /// Boot everything: broker, database, AI client, the pre-warmed pool, cron
  /// bindings, queue workers and the background monitors. Load-time failures
  /// (bad signature, missing file, compile error, invalid config) abort
  /// startup.
  pub async fn provision(config: Config, data_dir: DataDir) -> Result<Self, ProvisionError> {
    config.validate()?;
    data_dir.ensure_directory_structure()?;

    // Touch the process-wide registry so series exist before first scrape.
    let _ = metrics();

    let trust = TrustRoot::from_hex_keys(&config.trusted_signing_keys)?;

    let broker = broker::start(BrokerOptions {
      server_name: config.server_name.clone(),
      port: config.nats_port,
      store_dir: data_dir.nats_store_path(),
      cluster: ClusterOptions {
        name: config.cluster_name.clone(),
        port: config.cluster_port,
        peers: config.cluster_peers.clone(),
        leaf_port: config.leaf_port,
        leaf_remotes: config.leaf_remotes.clone(),
        replicas: config.cluster_replicas.max(1),
      },
      cipher_key: non_empty(&config.store_cipher_key),
      trusted_users: config.trusted_nats_users.clone(),
      user_seed: non_empty(&config.nats_user_seed),
    })
    .await?;

    let db = if !config.db_driver.is_empty() && !config.db_dsn.is_empty() {
      Some(Arc::new(HostDb::open(&config.db_driver, &config.db_dsn)?))
    } else {
      None
    };

    let ai = if !config.ai_endpoint.is_empty() && !config.ai_token.is_empty() {
      let model = if config.ai_model.is_empty() {
        "gpt-4o-mini"
      } else {
        &config.ai_model
      };
      let provider = if config.ai_provider.is_empty() {
        "openai"
      } else {
        &config.ai_provider
      };
      info!("AI backend configured (provider '{provider}', model '{model}')");
      Some(Arc::new(AiClient::new(&config.ai_endpoint, &config.ai_token, model)))
    } else {
      None
    };

    let holder_id = if config.server_name.is_empty() {
      let mut suffix = [0u8; 4];
      rand::RngCore::fill_bytes(&mut rand::rng(), &mut suffix);
      format!("gojinn-node-{}", hex::encode(suffix))
    } else {
      config.server_name.clone()
    };

    let kv_slot: KvSlot = Arc::new(parking_lot::RwLock::new(None));
    let host = Arc::new(HostCtx {
      broker: broker.clone(),
      kv: kv_slot.clone(),
      db: db.clone(),
      ai: ai.clone(),
      holder_id,
      handle: tokio::runtime::Handle::current(),
    });

    // The signature gate: no module executes without passing it.
    let wasm_bytes = signing::load(Path::new(&config.path), &trust)?;

    let runtime_config = RuntimeConfig {
      memory_pages: config.memory_pages(),
      fuel_limit: config.fuel_limit(),
      env: config.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
      args: config.args.clone(),
      mounts: config.mounts(),
    };

    let pool = {
      let bytes = wasm_bytes.clone();
      let runtime_config = runtime_config.clone();
      let host = host.clone();
      WorkerPool::provision(config.pool_size(), move || {
        EnginePair::new(&bytes, runtime_config.clone(), host.clone())
      })
      .await?
    };

    let engine = Self {
      inner: Arc::new(EngineInner {
        config,
        data_dir,
        runtime_config,
        trust,
        broker,
        kv_slot,
        host,
        db,
        ai,
        buffers: BufferPool::new(64),
        pool: tokio::sync::RwLock::new(pool),
        subs: tokio::sync::Mutex::new(Vec::new()),
        jobs: JobRegistry::new(),
        background: parking_lot::Mutex::new(Vec::new()),
        cleaned_up: AtomicBool::new(false),
      }),
    };

    engine.schedule_cron_jobs();
    engine.spawn_provisioning(wasm_bytes);
    engine.spawn_queue_monitor();

    return Ok(engine);
  }

  pub fn config(&self) -> &Config {
    return &self.inner.config;
  }

  pub fn data_dir(&self) -> &DataDir {
    return &self.inner.data_dir;
  }

  pub fn ai(&self) -> Option<&Arc<AiClient>> {
    return self.inner.ai.as_ref();
  }

  /// The sync fast path: envelope in, envelope out, pooled pair in between.
  pub async fn handle_http(
    &self,
    method: &str,
    uri: &str,
    headers: &HeaderMap,
    body: String,
  ) -> Response {
    let envelope = executor::envelope_from_request(method, uri, headers, body);
    let pool = self.inner.pool.read().await;
    return executor::execute_sync(
      SyncDeps {
        pool: &pool,
        buffers: &self.inner.buffers,
        path: &self.inner.config.path,
        timeout: self.inner.config.timeout(),
      },
      envelope,
    )
    .await;
  }

  /// One-shot raw execution for the tool surface and crash replay.
  pub async fn run_raw(&self, input: Vec<u8>) -> Result<String, String> {
    let pool = self.inner.pool.read().await;
    return executor::execute_raw(
      SyncDeps {
        pool: &pool,
        buffers: &self.inner.buffers,
        path: &self.inner.config.path,
        timeout: self.inner.config.timeout(),
      },
      input,
    )
    .await;
  }

  /// Publish an async job for `wasm_file`; the adapter contract used by
  /// cron bindings, guests and external event sources.
  pub fn publish_async_job(&self, wasm_file: &str, payload: &str) -> Result<u64, BrokerError> {
    return jobs::publish_async_job(&self.inner.broker, wasm_file, payload, None);
  }

  /// Re-run a quarantined job synchronously.
  pub async fn replay(&self, dump: &CrashSnapshot) -> Result<String, String> {
    let input = serde_json::to_vec(&dump.input).map_err(|err| err.to_string())?;
    info!("Replaying crash dump for '{}'", dump.wasm_file);
    return self.run_raw(input).await;
  }

  pub async fn snapshot_create(&self) -> Result<PathBuf, ProvisionError> {
    let data_dir = self.inner.data_dir.clone();
    let db = self.inner.db.clone();
    let archive = tokio::task::spawn_blocking(move || snapshot::create(&data_dir, db.as_deref()))
      .await
      .map_err(|err| std::io::Error::other(err.to_string()))??;
    return Ok(archive);
  }

  /// Restore a snapshot archive: shuts the engines down, swaps the on-disk
  /// state, then leaves the process for the operator to restart.
  pub async fn snapshot_restore(&self, archive: &Path) -> Result<(), ProvisionError> {
    warn!("Initiating global snapshot restore from {archive:?}");
    self.cleanup().await;

    let db_target = if self.inner.config.db_dsn.is_empty() {
      self.inner.data_dir.default_db_path()
    } else {
      PathBuf::from(
        self
          .inner
          .config
          .db_dsn
          .strip_prefix("file:")
          .unwrap_or(&self.inner.config.db_dsn),
      )
    };

    let data_dir = self.inner.data_dir.clone();
    let archive = archive.to_path_buf();
    tokio::task::spawn_blocking(move || snapshot::restore_files(&data_dir, &archive, &db_target))
      .await
      .map_err(|err| std::io::Error::other(err.to_string()))??;
    return Ok(());
  }

  /// Hot reload: drain subscribers, reload signed bytes, rebuild workers and
  /// the sync pool. Nothing is rolled back on failure; fix and retry.
  pub async fn reload(&self) -> Result<(), ProvisionError> {
    info!("Hot reload initiated: recycling workers");
    let mut subs = self.inner.subs.lock().await;

    for handle in subs.drain(..) {
      handle.drain().await;
    }

    let wasm_bytes = signing::load(Path::new(&self.inner.config.path), &self.inner.trust)?;

    self.start_workers_locked(&mut subs, &wasm_bytes)?;

    let new_pool = {
      let bytes = wasm_bytes.clone();
      let runtime_config = self.inner.runtime_config.clone();
      let host = self.inner.host.clone();
      WorkerPool::provision(self.inner.config.pool_size(), move || {
        EnginePair::new(&bytes, runtime_config.clone(), host.clone())
      })
      .await?
    };
    {
      let mut pool = self.inner.pool.write().await;
      pool.close();
      *pool = new_pool;
    }

    info!("Hot reload complete (new_workers {})", subs.len());
    return Ok(());
  }

  /// Tear everything down in reverse boot order. Idempotent.
  pub async fn cleanup(&self) {
    if self.inner.cleaned_up.swap(true, Ordering::SeqCst) {
      return;
    }

    self.inner.jobs.stop_all();

    for task in self.inner.background.lock().drain(..) {
      task.abort();
    }

    let mut subs = self.inner.subs.lock().await;
    for handle in subs.drain(..) {
      handle.drain().await;
    }
    drop(subs);

    info!("Shutting down worker pool (path '{}')", self.inner.config.path);
    self.inner.pool.read().await.close();

    broker::release(&self.inner.broker).await;
  }

  /// Number of live queue subscribers; `pool_size` once provisioning
  /// completes.
  pub async fn subscriber_count(&self) -> usize {
    return self.inner.subs.lock().await.len();
  }

  fn worker_context(&self) -> Arc<WorkerContext> {
    return Arc::new(WorkerContext {
      broker: self.inner.broker.clone(),
      data_dir: self.inner.data_dir.clone(),
      stream: WORKER_STREAM.to_string(),
      module_path: self.inner.config.path.clone(),
      env: self.inner.config.env.clone(),
      timeout: self.inner.config.timeout(),
    });
  }

  fn start_workers_locked(
    &self,
    subs: &mut Vec<WorkerHandle>,
    wasm_bytes: &[u8],
  ) -> Result<(), ProvisionError> {
    let ctx = self.worker_context();
    for id in 0..self.inner.config.pool_size() {
      let pair = EnginePair::new(wasm_bytes, self.inner.runtime_config.clone(), self.inner.host.clone())?;
      let handle = start_worker_subscriber(id, ctx.clone(), pair)?;
      subs.push(handle);
    }
    return Ok(());
  }

  fn schedule_cron_jobs(&self) {
    for job in &self.inner.config.cron_jobs {
      let Ok(schedule) = parse_schedule(&job.schedule) else {
        // validate() already rejected these; belt for direct construction.
        error!("Invalid cron schedule '{}'", job.schedule);
        continue;
      };

      let broker = self.inner.broker.clone();
      let wasm_file = job.wasm_file.clone();
      let registered = self.inner.jobs.new_job(
        format!("cron {}", job.wasm_file),
        schedule,
        build_callback(move || {
          let broker = broker.clone();
          let wasm_file = wasm_file.clone();
          return async move {
            jobs::publish_async_job(&broker, &wasm_file, &jobs::cron_payload(), None)?;
            return Ok(());
          };
        }),
      );
      registered.start();
      info!("Cron job scheduled (schedule '{}', wasm '{}')", job.schedule, job.wasm_file);
    }
  }

  /// Cooperative provisioning: retry stream and KV creation every 2 seconds
  /// until cluster quorum admits them, then start the queue workers. Never
  /// blocks the main process.
  fn spawn_provisioning(&self, wasm_bytes: Vec<u8>) {
    let engine = self.clone();
    let replicas = self.inner.config.cluster_replicas.max(1);

    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(PROVISION_INTERVAL);
      loop {
        ticker.tick().await;

        if engine.inner.broker.get_stream(WORKER_STREAM).is_none() {
          info!("Attempting to initialize durable stream '{WORKER_STREAM}'");
          match engine.inner.broker.create_stream(StreamConfig {
            name: WORKER_STREAM.to_string(),
            subjects: vec!["exec.>".to_string()],
            replicas,
          }) {
            Ok(_) => info!("Durable stream ready (stream {WORKER_STREAM})"),
            Err(err) => {
              warn!("Stream creation pending: {err}");
              continue;
            }
          }
        }

        if engine.inner.kv_slot.read().is_none() {
          match engine.inner.broker.create_kv_bucket(KvConfig {
            bucket: STATE_BUCKET.to_string(),
            description: "Gojinn distributed state".to_string(),
            history: 1,
            ttl: None,
            replicas,
          }) {
            Ok(bucket) => {
              *engine.inner.kv_slot.write() = Some(bucket);
              info!("Distributed KV store ready (bucket {STATE_BUCKET})");
            }
            Err(err) => {
              warn!("KV bucket creation pending: {err}");
              continue;
            }
          }
        }

        let mut subs = engine.inner.subs.lock().await;
        if subs.is_empty() {
          if let Err(err) = engine.start_workers_locked(&mut subs, &wasm_bytes) {
            error!("Failed to start queue workers: {err}");
          }
        }
        return;
      }
    });

    self.inner.background.lock().push(task);
  }

  fn spawn_queue_monitor(&self) {
    let broker = self.inner.broker.clone();
    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
      loop {
        ticker.tick().await;
        if let Some(stream) = broker.get_stream(WORKER_STREAM) {
          metrics()
            .queue_depth
            .with_label_values(&[stream.name()])
            .set(stream.pending_count() as i64);
        }
      }
    });
    self.inner.background.lock().push(task);
  }
}

fn non_empty(value: &str) -> Option<String> {
  return if value.is_empty() {
    None
  } else {
    Some(value.to_string())
  };
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::CronJobConfig;
  use crate::runtime::tests::echo_wat;
  use axum::http::HeaderValue;
  use std::sync::atomic::AtomicU16;

  static NEXT_PORT: AtomicU16 = AtomicU16::new(24000);

  fn unique_port() -> u16 {
    return NEXT_PORT.fetch_add(1, Ordering::SeqCst);
  }

  fn write_module(dir: &Path, name: &str, bytes: &[u8]) -> String {
    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("write module");
    return path.to_string_lossy().into_owned();
  }

  async fn wait_for_subscribers(engine: &Engine, want: usize) {
    for _ in 0..200 {
      if engine.subscriber_count().await >= want {
        return;
      }
      tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("workers never provisioned");
  }

  fn base_config(path: String, port: u16) -> Config {
    return Config {
      path,
      nats_port: port,
      server_name: format!("engine-test-{port}"),
      ..Default::default()
    };
  }

  #[tokio::test]
  async fn test_provision_full_lifecycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_module(
      dir.path(),
      "lifecycle.wasm",
      &echo_wat(r#"{"status":200,"headers":{"X-Gojinn":["Phase2"]},"body":"hello"}"#),
    );

    let mut config = base_config(path, unique_port());
    config.pool_size = 2;
    config.memory_limit = "10MB".to_string();
    config.timeout = 5;

    let engine = Engine::provision(config, DataDir(dir.path().join("data")))
      .await
      .expect("provision");

    // Exactly pool_size queue subscribers once provisioning converges.
    wait_for_subscribers(&engine, 2).await;
    assert_eq!(engine.subscriber_count().await, 2);

    // Sync path end to end.
    let mut headers = HeaderMap::new();
    headers.insert("x-request-id", HeaderValue::from_static("t-1"));
    let response = engine.handle_http("POST", "/echo", &headers, "hi".to_string()).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
      response.headers().get("X-Gojinn").and_then(|v| v.to_str().ok()),
      Some("Phase2")
    );

    engine.cleanup().await;
  }

  #[tokio::test]
  async fn test_default_pool_size_applied() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_module(dir.path(), "defaults.wasm", &echo_wat("{}"));

    let mut config = base_config(path, unique_port());
    config.pool_size = 0;

    let engine = Engine::provision(config, DataDir(dir.path().join("data")))
      .await
      .expect("provision");
    wait_for_subscribers(&engine, 2).await;
    assert_eq!(engine.subscriber_count().await, 2);

    engine.cleanup().await;
  }

  #[tokio::test]
  async fn test_provision_file_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = base_config("./missing_module.wasm".to_string(), unique_port());

    let err = Engine::provision(config, DataDir(dir.path().join("data")))
      .await
      .expect_err("must fail");
    assert!(matches!(err, ProvisionError::Signing(_)));
  }

  #[tokio::test]
  async fn test_provision_tolerates_bad_memory_limit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_module(dir.path(), "graceful.wasm", &echo_wat("{}"));

    let mut config = base_config(path, unique_port());
    config.memory_limit = "BATATA".to_string();
    config.pool_size = 1;

    let engine = Engine::provision(config, DataDir(dir.path().join("data")))
      .await
      .expect("invalid memory limit is not fatal");
    wait_for_subscribers(&engine, 1).await;

    engine.cleanup().await;
  }

  #[tokio::test]
  async fn test_signed_module_accepted_and_untrusted_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (sk, pk) = signing::generate_keypair();
    let (_other_sk, other_pk) = signing::generate_keypair();

    let signed = signing::sign(&echo_wat(r#"{"status":200}"#), &sk);
    let path = write_module(dir.path(), "signed.wasm", &signed);

    // Trusting the signer's key: loads and compiles.
    let mut config = base_config(path.clone(), unique_port());
    config.trusted_signing_keys = vec![signing::encode_verifying_key(&pk)];
    config.pool_size = 1;

    let engine = Engine::provision(config, DataDir(dir.path().join("data-ok")))
      .await
      .expect("trusted signature");
    engine.cleanup().await;

    // Trusting only a different key: fatal, before any compilation.
    let mut config = base_config(path, unique_port());
    config.trusted_signing_keys = vec![signing::encode_verifying_key(&other_pk)];

    let err = Engine::provision(config, DataDir(dir.path().join("data-bad")))
      .await
      .expect_err("untrusted signature");
    assert!(matches!(
      err,
      ProvisionError::Signing(SigningError::UntrustedSignature)
    ));
  }

  #[tokio::test]
  async fn test_reload_preserves_behavior_with_unchanged_bytes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_module(
      dir.path(),
      "reload.wasm",
      &echo_wat(r#"{"status":200,"body":"stable"}"#),
    );

    let mut config = base_config(path, unique_port());
    config.pool_size = 1;

    let engine = Engine::provision(config, DataDir(dir.path().join("data")))
      .await
      .expect("provision");
    wait_for_subscribers(&engine, 1).await;

    let before = engine
      .handle_http("GET", "/", &HeaderMap::new(), String::new())
      .await;
    assert_eq!(before.status(), 200);

    engine.reload().await.expect("reload");
    assert_eq!(engine.subscriber_count().await, 1);

    let after = engine
      .handle_http("GET", "/", &HeaderMap::new(), String::new())
      .await;
    assert_eq!(after.status(), 200);
    let bytes = axum::body::to_bytes(after.into_body(), 1024).await.expect("body");
    assert_eq!(bytes, "stable".as_bytes());

    engine.cleanup().await;
  }

  #[tokio::test]
  async fn test_async_job_flows_through_worker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_module(dir.path(), "asyncjob.wasm", &echo_wat(r#"{"status":200}"#));

    let mut config = base_config(path.clone(), unique_port());
    config.pool_size = 1;

    let engine = Engine::provision(config, DataDir(dir.path().join("data")))
      .await
      .expect("provision");
    wait_for_subscribers(&engine, 1).await;

    engine.publish_async_job(&path, r#"{"event":"test"}"#).expect("publish");

    let stream = engine.inner.broker.get_stream(WORKER_STREAM).expect("stream");
    for _ in 0..200 {
      if stream.pending_count() == 0 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(stream.pending_count(), 0, "job must be consumed and acked");

    engine.cleanup().await;
  }

  #[tokio::test]
  async fn test_cron_binding_publishes_jobs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_module(dir.path(), "cronfn.wasm", &echo_wat(r#"{"status":200}"#));

    let mut config = base_config(path.clone(), unique_port());
    config.pool_size = 1;
    config.cron_jobs = vec![CronJobConfig {
      //          sec  min  hour  dom  month  dow
      schedule: "*    *    *     *    *      *".to_string(),
      wasm_file: path.clone(),
    }];

    let engine = Engine::provision(config, DataDir(dir.path().join("data")))
      .await
      .expect("provision");
    wait_for_subscribers(&engine, 1).await;

    // Within ~2s the every-second schedule must have published at least one
    // job and the worker consumed it.
    let mut fired = false;
    for _ in 0..120 {
      if let Some(stream) = engine.inner.broker.get_stream(WORKER_STREAM) {
        // Sequence advances on publish even after ack removes the entry.
        if stream.pending_count() > 0 {
          fired = true;
          break;
        }
      }
      tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Either observed in flight, or already consumed: check the success
    // counter advanced.
    if !fired {
      let success = metrics()
        .jobs_total
        .with_label_values(&[crate::metrics::JOB_SUCCESS])
        .get();
      assert!(success > 0, "cron trigger never produced a completed job");
    }

    engine.cleanup().await;
  }
}
