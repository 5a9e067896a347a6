//! Embedded durable broker: subject-based publish into file-backed
//! work-queue streams, queue-group subscriptions with manual acknowledgment,
//! and a replicated key/value bucket. One broker instance per port per
//! process; handler instances sharing a port share the instance.

pub mod kv;
pub mod stream;

mod cluster;
mod store;

pub use cluster::ClusterOptions;
pub use kv::{KvBucket, KvConfig, KvOp};
pub use stream::{DeliveryInfo, JobMessage, Stream, StreamConfig, Subscription};

use log::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use cluster::{Cluster, Inbound, Outbound};
use store::StoreCipher;

pub const DEFAULT_PORT: u16 = 4222;

#[derive(Debug, Error)]
pub enum BrokerError {
  #[error("broker not ready: {0}")]
  NotReady(String),
  #[error("no cluster quorum: {have} of {need} members present")]
  NoQuorum { have: usize, need: usize },
  #[error("key already exists")]
  KeyExists,
  #[error("storage error: {0}")]
  Storage(String),
  #[error("cluster error: {0}")]
  Cluster(String),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Default)]
pub struct BrokerOptions {
  pub server_name: String,
  /// Identity of the broker within the process; handler instances configured
  /// with the same port share one instance.
  pub port: u16,
  pub store_dir: PathBuf,
  pub cluster: ClusterOptions,
  /// Enables encryption-at-rest on the store when set.
  pub cipher_key: Option<String>,
  /// Nkey-style trust set for inbound cluster links.
  pub trusted_users: Vec<String>,
  /// This node's signing seed for outbound cluster links.
  pub user_seed: Option<String>,
}

#[derive(Debug)]
struct BrokerInner {
  opts: BrokerOptions,
  cipher: Option<Arc<StoreCipher>>,
  streams: parking_lot::RwLock<HashMap<String, Arc<Stream>>>,
  buckets: parking_lot::RwLock<HashMap<String, Arc<KvBucket>>>,
  cluster: Arc<Cluster>,
  kv_outbound_tx: mpsc::UnboundedSender<Outbound>,
  shutdown_tx: watch::Sender<bool>,
}

#[derive(Clone)]
#[derive(Debug)]
pub struct Broker {
  inner: Arc<BrokerInner>,
}

impl Broker {
  async fn start_new(opts: BrokerOptions) -> Result<Self, BrokerError> {
    std::fs::create_dir_all(&opts.store_dir)?;

    let cipher = opts
      .cipher_key
      .as_deref()
      .map(|key| Arc::new(StoreCipher::from_passphrase(key)));
    if cipher.is_some() {
      info!("Broker store encryption-at-rest enabled");
    }

    let server_name = if opts.server_name.is_empty() {
      format!("gojinn-node-{}", opts.cluster.port)
    } else {
      opts.server_name.clone()
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Inbound>();
    let (kv_outbound_tx, mut kv_outbound_rx) = mpsc::unbounded_channel::<Outbound>();

    let cluster = Cluster::start(
      server_name,
      &opts.cluster,
      &opts.trusted_users,
      opts.user_seed.as_deref(),
      inbound_tx,
      shutdown_rx.clone(),
    )
    .await?;

    let broker = Self {
      inner: Arc::new(BrokerInner {
        opts,
        cipher,
        streams: parking_lot::RwLock::new(HashMap::new()),
        buckets: parking_lot::RwLock::new(HashMap::new()),
        cluster,
        kv_outbound_tx,
        shutdown_tx,
      }),
    };

    // Apply operations replicated in from peers; never re-forwarded. Both
    // pump tasks hold a broker handle, so they must observe shutdown rather
    // than wait for channel closure.
    {
      let broker = broker.clone();
      let mut shutdown = shutdown_rx.clone();
      tokio::spawn(async move {
        loop {
          let inbound = tokio::select! {
            inbound = inbound_rx.recv() => inbound,
            _ = shutdown.changed() => return,
          };
          let Some(inbound) = inbound else {
            return;
          };
          match inbound {
            Inbound::Publish {
              subject,
              payload,
              msg_id,
              headers,
            } => {
              if let Err(err) =
                broker.publish_local(&subject, &payload, msg_id.as_deref(), headers)
              {
                debug!("Dropping replicated publish on '{subject}': {err}");
              }
            }
            Inbound::KvOp { bucket, op } => {
              let target = broker.inner.buckets.read().get(&bucket).cloned();
              match target {
                Some(target) => {
                  if let Err(err) = target.apply_remote(&op) {
                    warn!("Failed to apply replicated KV op on '{bucket}': {err}");
                  }
                }
                None => debug!("Dropping replicated KV op for unknown bucket '{bucket}'"),
              }
            }
          }
        }
      });
    }

    // Funnel local KV mutations out to the cluster.
    {
      let broker = broker.clone();
      let mut shutdown = shutdown_rx;
      tokio::spawn(async move {
        loop {
          let out = tokio::select! {
            out = kv_outbound_rx.recv() => out,
            _ = shutdown.changed() => return,
          };
          let Some(out) = out else {
            return;
          };
          broker.inner.cluster.broadcast(out);
        }
      });
    }

    return Ok(broker);
  }

  pub fn port(&self) -> u16 {
    return self.inner.opts.port;
  }

  /// Members currently in the cluster, this node included.
  pub fn cluster_size(&self) -> usize {
    return self.inner.cluster.member_count() + 1;
  }

  fn check_quorum(&self, replicas: usize) -> Result<(), BrokerError> {
    let have = self.cluster_size();
    let need = replicas.max(1);
    if have < need {
      return Err(BrokerError::NoQuorum { have, need });
    }
    return Ok(());
  }

  /// Durably publish to the stream capturing `subject` and replicate to
  /// peers. `msg_id` enables server-side idempotent deduplication.
  pub fn publish(
    &self,
    subject: &str,
    payload: &[u8],
    msg_id: Option<&str>,
    headers: HashMap<String, String>,
  ) -> Result<u64, BrokerError> {
    let seq = self.publish_local(subject, payload, msg_id, headers.clone())?;
    self.inner.cluster.broadcast(Outbound::Publish {
      subject: subject.to_string(),
      payload: payload.to_vec(),
      msg_id: msg_id.map(str::to_string),
      headers,
    });
    return Ok(seq);
  }

  fn publish_local(
    &self,
    subject: &str,
    payload: &[u8],
    msg_id: Option<&str>,
    headers: HashMap<String, String>,
  ) -> Result<u64, BrokerError> {
    let stream = {
      let streams = self.inner.streams.read();
      streams.values().find(|s| s.captures_subject(subject)).cloned()
    };
    let Some(stream) = stream else {
      return Err(BrokerError::NotReady(format!("no stream bound for subject '{subject}'")));
    };
    return stream.publish(subject, payload, msg_id, headers);
  }

  /// Queue-group subscription bound to a durable stream. Delivery is always
  /// manual-ack; `max_deliver` bounds redelivery.
  pub fn queue_subscribe(
    &self,
    subject: &str,
    group: &str,
    opts: SubscribeOptions,
  ) -> Result<Subscription, BrokerError> {
    let Some(stream) = self.get_stream(&opts.bind_stream) else {
      return Err(BrokerError::NotReady(format!(
        "stream '{}' not provisioned yet",
        opts.bind_stream
      )));
    };
    let consumer = stream.queue_consumer(subject, group, opts.max_deliver);
    return Ok(Subscription { stream, consumer });
  }

  /// Creates a durable stream once cluster quorum allows it. Re-creating an
  /// existing stream returns the existing instance.
  pub fn create_stream(&self, config: StreamConfig) -> Result<Arc<Stream>, BrokerError> {
    self.check_quorum(config.replicas)?;

    let mut streams = self.inner.streams.write();
    if let Some(existing) = streams.get(&config.name) {
      return Ok(existing.clone());
    }

    let dir = self.inner.opts.store_dir.join("streams").join(&config.name);
    let stream = Arc::new(Stream::open(&dir, config, self.inner.cipher.clone())?);
    streams.insert(stream.name().to_string(), stream.clone());
    return Ok(stream);
  }

  pub fn get_stream(&self, name: &str) -> Option<Arc<Stream>> {
    return self.inner.streams.read().get(name).cloned();
  }

  pub fn create_kv_bucket(&self, config: KvConfig) -> Result<Arc<KvBucket>, BrokerError> {
    self.check_quorum(config.replicas)?;

    let mut buckets = self.inner.buckets.write();
    if let Some(existing) = buckets.get(&config.bucket) {
      return Ok(existing.clone());
    }

    let dir = self.inner.opts.store_dir.join("kv").join(&config.bucket);
    let bucket = Arc::new(KvBucket::open(
      &dir,
      &config,
      self.inner.cipher.clone(),
      Some(self.inner.kv_outbound_tx.clone()),
    )?);
    buckets.insert(bucket.name().to_string(), bucket.clone());
    return Ok(bucket);
  }

  pub fn kv_bucket(&self, name: &str) -> Option<Arc<KvBucket>> {
    return self.inner.buckets.read().get(name).cloned();
  }

  fn shutdown(&self) {
    let _ = self.inner.shutdown_tx.send(true);
    self.inner.streams.write().clear();
    self.inner.buckets.write().clear();
  }
}

#[derive(Clone, Debug)]
pub struct SubscribeOptions {
  /// Durable stream the subscription binds to.
  pub bind_stream: String,
  /// Redelivery ceiling per message.
  pub max_deliver: u64,
}

struct ServerEntry {
  broker: Broker,
  refs: usize,
}

/// Process-wide broker registry keyed by port: a duplicate port reuses the
/// running instance instead of starting a second one.
static SERVERS: LazyLock<tokio::sync::Mutex<HashMap<u16, ServerEntry>>> =
  LazyLock::new(|| tokio::sync::Mutex::new(HashMap::new()));

/// Start or join the broker for `opts.port`. Options of the first starter
/// win; a joiner with diverging topology gets the running instance and a
/// warning.
pub async fn start(mut opts: BrokerOptions) -> Result<Broker, BrokerError> {
  if opts.port == 0 {
    opts.port = DEFAULT_PORT;
  }

  let mut servers = SERVERS.lock().await;
  if let Some(entry) = servers.get_mut(&opts.port) {
    let running = &entry.broker.inner.opts;
    if running.cluster.name != opts.cluster.name
      || running.cluster.replicas != opts.cluster.replicas
    {
      warn!(
        "Broker for port {} already running; ignoring diverging cluster config (name '{}', replicas {})",
        opts.port, opts.cluster.name, opts.cluster.replicas
      );
    }
    entry.refs += 1;
    return Ok(entry.broker.clone());
  }

  let broker = Broker::start_new(opts).await?;
  info!(
    "Embedded broker started (port {}, store {:?})",
    broker.inner.opts.port, broker.inner.opts.store_dir
  );
  servers.insert(
    broker.inner.opts.port,
    ServerEntry {
      broker: broker.clone(),
      refs: 1,
    },
  );
  return Ok(broker);
}

/// Drop one reference on the broker; the instance shuts down when the last
/// handler releases it.
pub async fn release(broker: &Broker) {
  let mut servers = SERVERS.lock().await;
  let port = broker.port();
  if let Some(entry) = servers.get_mut(&port) {
    entry.refs = entry.refs.saturating_sub(1);
    if entry.refs == 0 {
      info!("Shutting down embedded broker on port {port}");
      entry.broker.shutdown();
      servers.remove(&port);
    }
  }
}

/// NATS-style subject matching: `*` matches one token, `>` the remainder.
pub(crate) fn subject_matches(filter: &str, subject: &str) -> bool {
  let mut filter_tokens = filter.split('.');
  let mut subject_tokens = subject.split('.');

  loop {
    return match (filter_tokens.next(), subject_tokens.next()) {
      (Some(">"), _) => true,
      (Some("*"), Some(_)) => continue,
      (Some(f), Some(s)) if f == s => continue,
      (None, None) => true,
      _ => false,
    };
  }
}
