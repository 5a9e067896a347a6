use log::*;
use std::ops::Deref;
use std::time::Instant;
use thiserror::Error;

use crate::runtime::{EnginePair, RuntimeError};

#[derive(Debug, Error)]
pub enum PoolError {
  #[error("failed to provision any workers")]
  NoWorkers,
  #[error("pool is closed")]
  Closed,
}

/// Fixed-size pool of pre-warmed engine pairs. Capacity equals the pool
/// size; a pair is either idle in the channel or lent to exactly one caller.
#[derive(Debug)]
pub(crate) struct WorkerPool {
  sender: flume::Sender<EnginePair>,
  receiver: flume::Receiver<EnginePair>,
  size: usize,
}

impl WorkerPool {
  /// Boot `size` workers in parallel. Zero successes is fatal; partial
  /// success proceeds with a warning.
  pub(crate) async fn provision<F>(size: usize, builder: F) -> Result<Self, PoolError>
  where
    F: Fn() -> Result<EnginePair, RuntimeError> + Clone + Send + 'static,
  {
    let (sender, receiver) = flume::bounded::<EnginePair>(size);

    info!("Provisioning worker pool (workers {size}, strategy parallel_boot)");
    let boot_start = Instant::now();

    let mut boots = Vec::with_capacity(size);
    for _ in 0..size {
      let builder = builder.clone();
      boots.push(tokio::task::spawn_blocking(builder));
    }

    let mut provisioned = 0usize;
    for boot in boots {
      match boot.await {
        Ok(Ok(pair)) => {
          let _ = sender.try_send(pair);
          provisioned += 1;
        }
        Ok(Err(err)) => error!("Failed to provision worker: {err}"),
        Err(err) => error!("Worker boot task panicked: {err}"),
      }
    }

    if provisioned == 0 {
      return Err(PoolError::NoWorkers);
    }
    if provisioned < size {
      warn!("Worker pool degraded: {provisioned} of {size} workers provisioned");
    }
    info!("Worker pool ready (boot_time {:?})", boot_start.elapsed());

    return Ok(Self {
      sender,
      receiver,
      size,
    });
  }

  /// Blocks until an idle pair is available. The guard returns the pair on
  /// drop, whatever the return path.
  pub(crate) async fn checkout(&self) -> Result<PoolGuard, PoolError> {
    let pair = self.receiver.recv_async().await.map_err(|_| PoolError::Closed)?;
    return Ok(PoolGuard {
      pair: Some(pair),
      sender: self.sender.clone(),
    });
  }

  pub(crate) fn size(&self) -> usize {
    return self.size;
  }

  /// Drop all idle pairs. Lent pairs are released when their guards drop;
  /// they cannot re-enter after the channel is gone.
  pub(crate) fn close(&self) {
    while self.receiver.try_recv().is_ok() {}
  }
}

pub(crate) struct PoolGuard {
  pair: Option<EnginePair>,
  sender: flume::Sender<EnginePair>,
}

impl Deref for PoolGuard {
  type Target = EnginePair;

  fn deref(&self) -> &Self::Target {
    return self.pair.as_ref().expect("pair present until drop");
  }
}

impl Drop for PoolGuard {
  fn drop(&mut self) {
    if let Some(pair) = self.pair.take() {
      // A full or disconnected channel means the pool was rebuilt; the old
      // pair is released instead of leaking back in.
      let _ = self.sender.try_send(pair);
    }
  }
}
