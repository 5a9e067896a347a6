//! Host functions importable by guests under the `env` module. Every guest
//! pointer is bounds-checked against the instance's linear memory before it
//! is dereferenced; out-of-bounds access traps the instance.

pub(crate) mod ai;
pub(crate) mod db;

use log::*;
use std::sync::Arc;
use std::time::Duration;
use wasmtime::{Caller, Linker, Memory};

use crate::broker::{Broker, KvBucket};
use crate::runtime::StoreState;

pub(crate) use ai::AiClient;
pub(crate) use db::HostDb;

/// The replicated KV bucket arrives asynchronously (cooperative
/// provisioning); guests calling in before it is ready get the transient
/// failure signal.
pub(crate) type KvSlot = Arc<parking_lot::RwLock<Option<Arc<KvBucket>>>>;

/// Shared services behind the guest import surface.
#[derive(Debug)]
pub(crate) struct HostCtx {
  pub broker: Broker,
  pub kv: KvSlot,
  pub db: Option<Arc<HostDb>>,
  pub ai: Option<Arc<AiClient>>,
  /// This node's identity, stored as the value of held distributed locks.
  pub holder_id: String,
  pub handle: tokio::runtime::Handle,
}

impl HostCtx {
  fn kv_bucket(&self) -> Option<Arc<KvBucket>> {
    return self.kv.read().clone();
  }
}

/// Distributed try-lock: atomic create-if-absent with a TTL lease for
/// liveness under holder crash.
pub(crate) fn mutex_try_lock(bucket: &KvBucket, key: &str, holder: &str, ttl_secs: u32) -> bool {
  let ttl = if ttl_secs == 0 {
    None
  } else {
    Some(Duration::from_secs(ttl_secs as u64))
  };
  return match bucket.create(key, holder.as_bytes(), ttl) {
    Ok(()) => true,
    Err(crate::broker::BrokerError::KeyExists) => false,
    Err(err) => {
      warn!("Distributed lock '{key}' failed: {err}");
      false
    }
  };
}

/// Owner-checked unlock: the entry is deleted only if it still carries this
/// holder's id, so non-owners cannot break the lock.
pub(crate) fn mutex_unlock(bucket: &KvBucket, key: &str, holder: &str) -> bool {
  return match bucket.compare_and_delete(key, holder.as_bytes()) {
    Ok(removed) => removed,
    Err(err) => {
      warn!("Distributed unlock '{key}' failed: {err}");
      false
    }
  };
}

fn memory_of(caller: &mut Caller<'_, StoreState>) -> Result<Memory, wasmtime::Error> {
  return caller
    .get_export("memory")
    .and_then(|export| export.into_memory())
    .ok_or_else(|| wasmtime::Error::msg("guest exports no linear memory"));
}

fn read_guest(
  caller: &mut Caller<'_, StoreState>,
  ptr: u32,
  len: u32,
) -> Result<Vec<u8>, wasmtime::Error> {
  let memory = memory_of(caller)?;
  let start = ptr as usize;
  let end = start
    .checked_add(len as usize)
    .ok_or_else(|| wasmtime::Error::msg("guest pointer overflow"))?;
  return memory
    .data(&caller)
    .get(start..end)
    .map(<[u8]>::to_vec)
    .ok_or_else(|| wasmtime::Error::msg("guest pointer out of bounds"));
}

fn read_guest_str(
  caller: &mut Caller<'_, StoreState>,
  ptr: u32,
  len: u32,
) -> Result<String, wasmtime::Error> {
  return Ok(String::from_utf8_lossy(&read_guest(caller, ptr, len)?).into_owned());
}

/// Write `bytes` at `ptr` if they fit within `max`; returns the byte count or
/// 0 when the caller's buffer is too small. The destination range itself is
/// still bounds-checked and traps when outside memory.
fn write_guest_bounded(
  caller: &mut Caller<'_, StoreState>,
  ptr: u32,
  max: u32,
  bytes: &[u8],
) -> Result<u32, wasmtime::Error> {
  if bytes.len() > max as usize {
    warn!("Host result of {} bytes exceeds guest buffer of {max}", bytes.len());
    return Ok(0);
  }
  let memory = memory_of(caller)?;
  memory
    .write(caller, ptr as usize, bytes)
    .map_err(|_| wasmtime::Error::msg("guest pointer out of bounds"))?;
  return Ok(bytes.len() as u32);
}

pub(crate) fn install(linker: &mut Linker<StoreState>) -> Result<(), wasmtime::Error> {
  linker.func_wrap(
    "env",
    "host_log",
    |mut caller: Caller<'_, StoreState>, level: u32, ptr: u32, len: u32| -> Result<(), wasmtime::Error> {
      let message = read_guest_str(&mut caller, ptr, len)?;
      match level {
        0 => debug!("[guest] {message}"),
        2 => warn!("[guest] {message}"),
        3 => error!("[guest] {message}"),
        _ => info!("[guest] {message}"),
      }
      return Ok(());
    },
  )?;

  linker.func_wrap(
    "env",
    "host_enqueue",
    |mut caller: Caller<'_, StoreState>,
     name_ptr: u32,
     name_len: u32,
     payload_ptr: u32,
     payload_len: u32|
     -> Result<u32, wasmtime::Error> {
      let name = read_guest_str(&mut caller, name_ptr, name_len)?;
      let payload = read_guest_str(&mut caller, payload_ptr, payload_len)?;

      let broker = caller.data().host().broker.clone();
      return match crate::jobs::publish_async_job(&broker, &name, &payload, None) {
        Ok(_) => Ok(0),
        Err(err) => {
          warn!("Guest enqueue to '{name}' failed: {err}");
          Ok(1)
        }
      };
    },
  )?;

  linker.func_wrap(
    "env",
    "host_db_query",
    |mut caller: Caller<'_, StoreState>,
     query_ptr: u32,
     query_len: u32,
     out_ptr: u32,
     out_max: u32|
     -> Result<u32, wasmtime::Error> {
      let query = read_guest_str(&mut caller, query_ptr, query_len)?;

      let Some(db) = caller.data().host().db.clone() else {
        warn!("Guest SQL query with no database configured on host");
        return Ok(0);
      };
      return match db.query_to_json(&query) {
        Ok(rows) => write_guest_bounded(&mut caller, out_ptr, out_max, &rows),
        Err(err) => {
          warn!("Guest SQL query failed: {err}");
          Ok(0)
        }
      };
    },
  )?;

  linker.func_wrap(
    "env",
    "host_kv_set",
    |mut caller: Caller<'_, StoreState>,
     key_ptr: u32,
     key_len: u32,
     value_ptr: u32,
     value_len: u32|
     -> Result<u32, wasmtime::Error> {
      let key = read_guest_str(&mut caller, key_ptr, key_len)?;
      let value = read_guest(&mut caller, value_ptr, value_len)?;

      let Some(bucket) = caller.data().host().kv_bucket() else {
        warn!("Guest KV set before bucket is ready");
        return Ok(1);
      };
      return match bucket.put(&key, &value) {
        Ok(()) => Ok(0),
        Err(err) => {
          warn!("Guest KV set '{key}' failed: {err}");
          Ok(1)
        }
      };
    },
  )?;

  linker.func_wrap(
    "env",
    "host_kv_get",
    |mut caller: Caller<'_, StoreState>,
     key_ptr: u32,
     key_len: u32,
     out_ptr: u32,
     out_max: u32|
     -> Result<u32, wasmtime::Error> {
      let key = read_guest_str(&mut caller, key_ptr, key_len)?;

      let Some(bucket) = caller.data().host().kv_bucket() else {
        return Ok(0);
      };
      return match bucket.get(&key) {
        Some(value) => write_guest_bounded(&mut caller, out_ptr, out_max, &value),
        None => Ok(0),
      };
    },
  )?;

  linker.func_wrap(
    "env",
    "host_mutex_lock",
    |mut caller: Caller<'_, StoreState>,
     key_ptr: u32,
     key_len: u32,
     ttl_seconds: u32|
     -> Result<u32, wasmtime::Error> {
      let key = read_guest_str(&mut caller, key_ptr, key_len)?;
      let host = caller.data().host().clone();

      let Some(bucket) = host.kv_bucket() else {
        warn!("Guest mutex lock before bucket is ready");
        return Ok(0);
      };
      return Ok(mutex_try_lock(&bucket, &key, &host.holder_id, ttl_seconds) as u32);
    },
  )?;

  linker.func_wrap(
    "env",
    "host_mutex_unlock",
    |mut caller: Caller<'_, StoreState>, key_ptr: u32, key_len: u32| -> Result<u32, wasmtime::Error> {
      let key = read_guest_str(&mut caller, key_ptr, key_len)?;
      let host = caller.data().host().clone();

      let Some(bucket) = host.kv_bucket() else {
        return Ok(0);
      };
      return Ok(mutex_unlock(&bucket, &key, &host.holder_id) as u32);
    },
  )?;

  linker.func_wrap(
    "env",
    "host_ask_ai",
    |mut caller: Caller<'_, StoreState>,
     prompt_ptr: u32,
     prompt_len: u32,
     out_ptr: u32,
     out_max: u32|
     -> Result<u32, wasmtime::Error> {
      let prompt = read_guest_str(&mut caller, prompt_ptr, prompt_len)?;
      let host = caller.data().host().clone();

      let Some(ai) = host.ai.clone() else {
        warn!("Guest AI prompt with no provider configured");
        return Ok(0);
      };

      // Guest execution happens on a blocking thread, so parking it on the
      // async HTTP client is safe.
      let response = host.handle.block_on(ai.ask(&prompt));
      return match response {
        Ok(text) => write_guest_bounded(&mut caller, out_ptr, out_max, text.as_bytes()),
        Err(err) => {
          warn!("Guest AI prompt failed: {err}");
          Ok(0)
        }
      };
    },
  )?;

  // Optional WebSocket surface. This embedding carries no upgrade channel,
  // so upgrades report failure and the data calls are inert; pointers are
  // still validated.
  linker.func_wrap(
    "env",
    "host_ws_upgrade",
    |_caller: Caller<'_, StoreState>| -> Result<u32, wasmtime::Error> {
      debug!("Guest requested WebSocket upgrade; no upgrade channel available");
      return Ok(0);
    },
  )?;
  linker.func_wrap(
    "env",
    "host_ws_read",
    |mut caller: Caller<'_, StoreState>, buf_ptr: u32, buf_max: u32| -> Result<u32, wasmtime::Error> {
      let _ = write_guest_bounded(&mut caller, buf_ptr, buf_max, &[])?;
      return Ok(0);
    },
  )?;
  linker.func_wrap(
    "env",
    "host_ws_write",
    |mut caller: Caller<'_, StoreState>, ptr: u32, len: u32| -> Result<u32, wasmtime::Error> {
      let _ = read_guest(&mut caller, ptr, len)?;
      return Ok(0);
    },
  )?;

  return Ok(());
}

#[cfg(test)]
pub(crate) async fn test_host_ctx() -> Arc<HostCtx> {
  use std::sync::atomic::{AtomicU16, Ordering};

  static NEXT_PORT: AtomicU16 = AtomicU16::new(21000);
  let port = NEXT_PORT.fetch_add(1, Ordering::SeqCst);

  // Unique per process so state never leaks between test runs.
  let nanos = std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_nanos())
    .unwrap_or(0);
  let store_dir = std::env::temp_dir().join(format!("gojinn-host-test-{port}-{nanos}"));
  let broker = crate::broker::start(crate::broker::BrokerOptions {
    server_name: format!("host-test-{port}"),
    port,
    store_dir,
    ..Default::default()
  })
  .await
  .expect("test broker");

  return Arc::new(HostCtx {
    broker,
    kv: Arc::new(parking_lot::RwLock::new(None)),
    db: None,
    ai: None,
    holder_id: format!("test-node-{port}"),
    handle: tokio::runtime::Handle::current(),
  });
}
