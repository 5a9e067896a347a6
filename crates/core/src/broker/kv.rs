use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::broker::BrokerError;
use crate::broker::cluster::Outbound;
use crate::broker::store::{OpLog, StoreCipher};

#[derive(Clone, Debug)]
pub struct KvConfig {
  pub bucket: String,
  pub description: String,
  /// Number of value revisions retained. This store only supports 1.
  pub history: u32,
  /// Bucket-wide default TTL. Per-key TTLs are passed to `create`.
  pub ttl: Option<Duration>,
  pub replicas: usize,
}

impl Default for KvConfig {
  fn default() -> Self {
    return Self {
      bucket: String::new(),
      description: String::new(),
      history: 1,
      ttl: None,
      replicas: 1,
    };
  }
}

/// Replicated key/value operation, also the on-disk log record and the
/// cross-node replication payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KvOp {
  Put {
    key: String,
    value: String,
    expires_at_ms: Option<u64>,
  },
  Delete {
    key: String,
  },
}

#[derive(Debug)]
struct KvEntry {
  value: Vec<u8>,
  expires_at_ms: Option<u64>,
}

impl KvEntry {
  fn expired(&self, now_ms: u64) -> bool {
    return self.expires_at_ms.is_some_and(|at| at <= now_ms);
  }
}

#[derive(Debug)]
struct KvState {
  entries: HashMap<String, KvEntry>,
  log: OpLog,
}

/// A replicated key/value bucket. Writes go to the local op-log first, then
/// out to cluster peers; remote ops are applied without re-forwarding.
#[derive(Debug)]
pub struct KvBucket {
  name: String,
  default_ttl: Option<Duration>,
  state: Mutex<KvState>,
  replicate: Option<tokio::sync::mpsc::UnboundedSender<Outbound>>,
}

fn now_ms() -> u64 {
  return SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0);
}

impl KvBucket {
  pub(super) fn open(
    dir: &Path,
    config: &KvConfig,
    cipher: Option<Arc<StoreCipher>>,
    replicate: Option<tokio::sync::mpsc::UnboundedSender<Outbound>>,
  ) -> Result<Self, BrokerError> {
    let label = format!("kv:{}", config.bucket);
    let (log, records) = OpLog::open(&dir.join("ops.log"), &label, cipher)?;

    let mut entries = HashMap::new();
    let now = now_ms();
    for record in records {
      let op: KvOp = serde_json::from_slice(&record)
        .map_err(|err| BrokerError::Storage(format!("corrupt kv record: {err}")))?;
      apply_op(&mut entries, &op, now);
    }

    return Ok(Self {
      name: config.bucket.clone(),
      default_ttl: config.ttl,
      state: Mutex::new(KvState { entries, log }),
      replicate,
    });
  }

  pub fn name(&self) -> &str {
    return &self.name;
  }

  pub fn get(&self, key: &str) -> Option<Vec<u8>> {
    let mut state = self.state.lock();
    let now = now_ms();
    if state.entries.get(key).is_some_and(|e| e.expired(now)) {
      state.entries.remove(key);
      return None;
    }
    return state.entries.get(key).map(|e| e.value.clone());
  }

  pub fn put(&self, key: &str, value: &[u8]) -> Result<(), BrokerError> {
    let op = KvOp::Put {
      key: key.to_string(),
      value: BASE64.encode(value),
      expires_at_ms: self.expiry(self.default_ttl),
    };
    self.commit(&op)?;
    self.forward(&op);
    return Ok(());
  }

  /// Atomic create-if-absent with an optional per-key TTL. This is the
  /// primitive the distributed mutex is built on.
  pub fn create(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), BrokerError> {
    let op = {
      let mut state = self.state.lock();
      let now = now_ms();
      if state.entries.get(key).is_some_and(|e| e.expired(now)) {
        state.entries.remove(key);
      }
      if state.entries.contains_key(key) {
        return Err(BrokerError::KeyExists);
      }

      let op = KvOp::Put {
        key: key.to_string(),
        value: BASE64.encode(value),
        expires_at_ms: self.expiry(ttl.or(self.default_ttl)),
      };
      Self::commit_locked(&mut state, &op)?;
      op
    };
    self.forward(&op);
    return Ok(());
  }

  pub fn delete(&self, key: &str) -> Result<(), BrokerError> {
    let op = KvOp::Delete {
      key: key.to_string(),
    };
    self.commit(&op)?;
    self.forward(&op);
    return Ok(());
  }

  /// Delete `key` only if its current value equals `expected`. Returns true
  /// when the entry was removed.
  pub fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, BrokerError> {
    let op = {
      let mut state = self.state.lock();
      let now = now_ms();
      let matches = state
        .entries
        .get(key)
        .is_some_and(|e| !e.expired(now) && e.value == expected);
      if !matches {
        return Ok(false);
      }

      let op = KvOp::Delete {
        key: key.to_string(),
      };
      Self::commit_locked(&mut state, &op)?;
      op
    };
    self.forward(&op);
    return Ok(true);
  }

  pub fn len(&self) -> usize {
    let state = self.state.lock();
    let now = now_ms();
    return state.entries.values().filter(|e| !e.expired(now)).count();
  }

  pub fn is_empty(&self) -> bool {
    return self.len() == 0;
  }

  /// Apply an op received from a cluster peer. Persisted locally, never
  /// re-forwarded.
  pub(super) fn apply_remote(&self, op: &KvOp) -> Result<(), BrokerError> {
    return self.commit(op);
  }

  fn commit(&self, op: &KvOp) -> Result<(), BrokerError> {
    let mut state = self.state.lock();
    return Self::commit_locked(&mut state, op);
  }

  fn commit_locked(state: &mut KvState, op: &KvOp) -> Result<(), BrokerError> {
    let record = serde_json::to_vec(op)
      .map_err(|err| BrokerError::Storage(format!("kv record encode: {err}")))?;
    state.log.append(&record)?;
    apply_op(&mut state.entries, op, now_ms());
    return Ok(());
  }

  fn forward(&self, op: &KvOp) {
    if let Some(ref tx) = self.replicate {
      let _ = tx.send(Outbound::KvOp {
        bucket: self.name.clone(),
        op: op.clone(),
      });
    }
  }

  fn expiry(&self, ttl: Option<Duration>) -> Option<u64> {
    return ttl.map(|ttl| now_ms() + ttl.as_millis() as u64);
  }
}

fn apply_op(entries: &mut HashMap<String, KvEntry>, op: &KvOp, now_ms: u64) {
  match op {
    KvOp::Put {
      key,
      value,
      expires_at_ms,
    } => {
      // An already-expired replayed entry is dropped rather than inserted.
      if expires_at_ms.is_some_and(|at| at <= now_ms) {
        entries.remove(key);
        return;
      }
      entries.insert(
        key.clone(),
        KvEntry {
          value: BASE64.decode(value).unwrap_or_default(),
          expires_at_ms: *expires_at_ms,
        },
      );
    }
    KvOp::Delete { key } => {
      entries.remove(key);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn open_bucket(dir: &Path) -> KvBucket {
    return KvBucket::open(
      dir,
      &KvConfig {
        bucket: "TEST_STATE".to_string(),
        ..Default::default()
      },
      None,
      None,
    )
    .expect("open");
  }

  #[test]
  fn test_put_get_delete() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bucket = open_bucket(dir.path());

    assert_eq!(bucket.get("k"), None);
    bucket.put("k", b"v").expect("put");
    assert_eq!(bucket.get("k"), Some(b"v".to_vec()));
    bucket.delete("k").expect("delete");
    assert_eq!(bucket.get("k"), None);
  }

  #[test]
  fn test_create_only_semantics() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bucket = open_bucket(dir.path());

    bucket.create("lock", b"holder-a", None).expect("create");
    let err = bucket.create("lock", b"holder-b", None).expect_err("contended");
    assert!(matches!(err, BrokerError::KeyExists));
    assert_eq!(bucket.get("lock"), Some(b"holder-a".to_vec()));
  }

  #[test]
  fn test_ttl_expiry_frees_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bucket = open_bucket(dir.path());

    bucket
      .create("lease", b"holder", Some(Duration::from_millis(20)))
      .expect("create");
    assert!(bucket.create("lease", b"other", None).is_err());

    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(bucket.get("lease"), None);
    bucket.create("lease", b"other", None).expect("expired lease is free");
  }

  #[test]
  fn test_compare_and_delete_owner_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bucket = open_bucket(dir.path());

    bucket.create("lock", b"owner", None).expect("create");
    assert!(!bucket.compare_and_delete("lock", b"intruder").expect("cad"));
    assert_eq!(bucket.get("lock"), Some(b"owner".to_vec()));
    assert!(bucket.compare_and_delete("lock", b"owner").expect("cad"));
    assert_eq!(bucket.get("lock"), None);
  }

  #[test]
  fn test_persistence_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
      let bucket = open_bucket(dir.path());
      bucket.put("a", b"1").expect("put");
      bucket.put("b", b"2").expect("put");
      bucket.delete("a").expect("delete");
    }

    let bucket = open_bucket(dir.path());
    assert_eq!(bucket.get("a"), None);
    assert_eq!(bucket.get("b"), Some(b"2".to_vec()));
  }
}
