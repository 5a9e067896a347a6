use log::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use wasmtime::{Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap};
use wasmtime_wasi::p1::WasiP1Ctx;
use wasmtime_wasi::p2::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::host::{self, HostCtx};

/// Epoch ticker resolution; deadlines round up to the next tick.
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Captured guest output buffers are capped; a run-away guest writing to
/// stdout is a protocol violation anyway.
const MAX_STDOUT: usize = 4 * 1024 * 1024;
const MAX_STDERR: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum RuntimeError {
  #[error("failed to compile module: {0}")]
  Compile(String),
  #[error("failed to link host imports: {0}")]
  Link(String),
  #[error("wasmtime: {0}")]
  Wasmtime(String),
}

/// Execution limits and guest environment, derived once from config.
#[derive(Clone, Debug, Default)]
pub struct RuntimeConfig {
  pub memory_pages: Option<u64>,
  pub fuel_limit: Option<u64>,
  pub env: Vec<(String, String)>,
  pub args: Vec<String>,
  /// Host-dir -> guest-dir grants.
  pub mounts: Vec<(PathBuf, String)>,
}

pub(crate) struct StoreState {
  wasi: WasiP1Ctx,
  host: Arc<HostCtx>,
  limits: StoreLimits,
}

impl StoreState {
  pub(crate) fn wasi(&mut self) -> &mut WasiP1Ctx {
    return &mut self.wasi;
  }

  pub(crate) fn host(&self) -> &Arc<HostCtx> {
    return &self.host;
  }
}

/// Outcome of one guest execution.
#[derive(Debug)]
pub(crate) struct ExecOutput {
  pub stdout: Vec<u8>,
  pub stderr: String,
}

#[derive(Debug)]
pub(crate) enum ExecError {
  /// The epoch deadline fired inside guest code.
  DeadlineExceeded { stderr: String },
  /// Trap, non-zero exit, fuel exhaustion or instantiation failure.
  Guest { message: String, stderr: String },
}

impl ExecError {
  pub(crate) fn message(&self) -> String {
    return match self {
      Self::DeadlineExceeded { .. } => "deadline exceeded".to_string(),
      Self::Guest { message, .. } => message.clone(),
    };
  }

  pub(crate) fn stderr(&self) -> &str {
    return match self {
      Self::DeadlineExceeded { stderr } => stderr,
      Self::Guest { stderr, .. } => stderr,
    };
  }
}

/// A pre-warmed (runtime, compiled-module) pair. The pair is exclusively lent
/// to one execution at a time; every execution instantiates a fresh store, so
/// no guest state survives between requests.
#[derive(Debug)]
pub struct EnginePair {
  engine: Engine,
  module: Module,
  linker: Linker<StoreState>,
  config: RuntimeConfig,
  host: Arc<HostCtx>,
  ticker_stop: Arc<AtomicBool>,
  ticker: Option<std::thread::JoinHandle<()>>,
}

impl EnginePair {
  pub(crate) fn new(
    wasm_bytes: &[u8],
    config: RuntimeConfig,
    host: Arc<HostCtx>,
  ) -> Result<Self, RuntimeError> {
    let mut engine_config = wasmtime::Config::new();
    engine_config.epoch_interruption(true);
    engine_config.consume_fuel(config.fuel_limit.is_some());

    let engine =
      Engine::new(&engine_config).map_err(|err| RuntimeError::Wasmtime(err.to_string()))?;

    let module =
      Module::new(&engine, wasm_bytes).map_err(|err| RuntimeError::Compile(err.to_string()))?;

    let mut linker = Linker::<StoreState>::new(&engine);
    wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |state: &mut StoreState| state.wasi())
      .map_err(|err| RuntimeError::Link(err.to_string()))?;
    host::install(&mut linker).map_err(|err| RuntimeError::Link(err.to_string()))?;

    // Engine-owned wall clock: every live store's deadline counts in these
    // ticks.
    let ticker_stop = Arc::new(AtomicBool::new(false));
    let ticker = {
      let engine = engine.clone();
      let stop = ticker_stop.clone();
      std::thread::Builder::new()
        .name("gojinn-epoch".to_string())
        .spawn(move || {
          while !stop.load(Ordering::Relaxed) {
            std::thread::sleep(EPOCH_TICK);
            engine.increment_epoch();
          }
        })
        .map_err(|err| RuntimeError::Wasmtime(err.to_string()))?
    };

    return Ok(Self {
      engine,
      module,
      linker,
      config,
      host,
      ticker_stop,
      ticker: Some(ticker),
    });
  }

  /// Run the module once: `input` on stdin, captured stdout/stderr, the
  /// configured env/args/mounts and a wall-clock deadline. Blocking; callers
  /// dispatch onto a blocking thread.
  pub(crate) fn execute(&self, input: &[u8], deadline: Duration) -> Result<ExecOutput, ExecError> {
    let stdout = MemoryOutputPipe::new(MAX_STDOUT);
    let stderr = MemoryOutputPipe::new(MAX_STDERR);

    let wasi = {
      let mut builder = WasiCtxBuilder::new();
      builder.stdin(MemoryInputPipe::new(input.to_vec()));
      builder.stdout(stdout.clone());
      builder.stderr(stderr.clone());

      let mut argv: Vec<&str> = vec!["function.wasm"];
      argv.extend(self.config.args.iter().map(String::as_str));
      builder.args(&argv);

      for (key, value) in &self.config.env {
        builder.env(key, value);
      }
      for (host_dir, guest_dir) in &self.config.mounts {
        if let Err(err) =
          builder.preopened_dir(host_dir, guest_dir, DirPerms::all(), FilePerms::all())
        {
          warn!("Skipping mount {host_dir:?} -> {guest_dir}: {err}");
        }
      }
      builder.build_p1()
    };

    let limits = match self.config.memory_pages {
      Some(pages) => StoreLimitsBuilder::new()
        .memory_size((pages * 65536) as usize)
        .build(),
      None => StoreLimits::default(),
    };

    let mut store = Store::new(
      &self.engine,
      StoreState {
        wasi,
        host: self.host.clone(),
        limits,
      },
    );
    store.limiter(|state| &mut state.limits);
    store.epoch_deadline_trap();
    store.set_epoch_deadline(deadline_ticks(deadline));

    if let Some(fuel) = self.config.fuel_limit {
      if let Err(err) = store.set_fuel(fuel) {
        return Err(ExecError::Guest {
          message: format!("failed to arm fuel meter: {err}"),
          stderr: String::new(),
        });
      }
    }

    let result = self
      .linker
      .instantiate(&mut store, &self.module)
      .and_then(|instance| instance.get_typed_func::<(), ()>(&mut store, "_start"))
      .and_then(|start| start.call(&mut store, ()));

    drop(store);
    let stderr_text = String::from_utf8_lossy(&stderr.contents()).into_owned();

    return match result {
      Ok(()) => Ok(ExecOutput {
        stdout: stdout.contents().to_vec(),
        stderr: stderr_text,
      }),
      Err(err) => {
        // An explicit exit(0) is a normal completion for wasip1 commands.
        if let Some(exit) = err.downcast_ref::<wasmtime_wasi::I32Exit>() {
          if exit.0 == 0 {
            return Ok(ExecOutput {
              stdout: stdout.contents().to_vec(),
              stderr: stderr_text,
            });
          }
          return Err(ExecError::Guest {
            message: format!("guest exited with status {}", exit.0),
            stderr: stderr_text,
          });
        }

        if err.downcast_ref::<Trap>() == Some(&Trap::Interrupt) {
          return Err(ExecError::DeadlineExceeded {
            stderr: stderr_text,
          });
        }

        Err(ExecError::Guest {
          message: err.to_string(),
          stderr: stderr_text,
        })
      }
    };
  }
}

impl Drop for EnginePair {
  fn drop(&mut self) {
    self.ticker_stop.store(true, Ordering::Relaxed);
    if let Some(handle) = self.ticker.take() {
      let _ = handle.join();
    }
  }
}

fn deadline_ticks(deadline: Duration) -> u64 {
  let ticks = deadline.as_millis() / EPOCH_TICK.as_millis();
  return (ticks as u64).max(1) + 1;
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::host::test_host_ctx;

  /// Guest that copies a canned envelope to stdout.
  pub(crate) fn echo_wat(body: &str) -> Vec<u8> {
    let escaped = body.replace('\\', "\\\\").replace('"', "\\\"");
    return wat::parse_str(format!(
      r#"(module
        (import "wasi_snapshot_preview1" "fd_write"
          (func $fd_write (param i32 i32 i32 i32) (result i32)))
        (memory (export "memory") 1)
        (data (i32.const 64) "{escaped}")
        (func (export "_start")
          (i32.store (i32.const 0) (i32.const 64))
          (i32.store (i32.const 4) (i32.const {len}))
          (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 16)))))"#,
      len = body.len(),
    ))
    .expect("valid wat");
  }

  /// Guest that busy-loops forever.
  pub(crate) fn spin_wat() -> Vec<u8> {
    return wat::parse_str(
      r#"(module
        (memory (export "memory") 1)
        (func (export "_start") (loop (br 0))))"#,
    )
    .expect("valid wat");
  }

  /// Guest that traps immediately.
  pub(crate) fn crash_wat() -> Vec<u8> {
    return wat::parse_str(
      r#"(module
        (memory (export "memory") 1)
        (func (export "_start") unreachable))"#,
    )
    .expect("valid wat");
  }

  #[tokio::test]
  async fn test_execute_captures_stdout() {
    let pair = EnginePair::new(
      &echo_wat(r#"{"status":200,"body":"ok"}"#),
      RuntimeConfig::default(),
      test_host_ctx().await,
    )
    .expect("pair");

    let out = tokio::task::spawn_blocking(move || pair.execute(b"{}", Duration::from_secs(5)))
      .await
      .expect("join")
      .expect("execute");
    assert_eq!(out.stdout, br#"{"status":200,"body":"ok"}"#);
  }

  #[tokio::test]
  async fn test_deadline_trips_as_deadline_exceeded() {
    let pair = EnginePair::new(&spin_wat(), RuntimeConfig::default(), test_host_ctx().await)
      .expect("pair");

    let err =
      tokio::task::spawn_blocking(move || pair.execute(b"", Duration::from_millis(100)))
        .await
        .expect("join")
        .expect_err("must time out");
    assert!(matches!(err, ExecError::DeadlineExceeded { .. }));
  }

  #[tokio::test]
  async fn test_trap_is_guest_error() {
    let pair = EnginePair::new(&crash_wat(), RuntimeConfig::default(), test_host_ctx().await)
      .expect("pair");

    let err = tokio::task::spawn_blocking(move || pair.execute(b"", Duration::from_secs(5)))
      .await
      .expect("join")
      .expect_err("must trap");
    assert!(matches!(err, ExecError::Guest { .. }));
  }

  #[tokio::test]
  async fn test_fuel_exhaustion_is_guest_error() {
    let pair = EnginePair::new(
      &spin_wat(),
      RuntimeConfig {
        fuel_limit: Some(10_000),
        ..Default::default()
      },
      test_host_ctx().await,
    )
    .expect("pair");

    let err = tokio::task::spawn_blocking(move || pair.execute(b"", Duration::from_secs(5)))
      .await
      .expect("join")
      .expect_err("must exhaust fuel");
    assert!(matches!(err, ExecError::Guest { .. }));
  }

  #[tokio::test]
  async fn test_invalid_module_fails_compile() {
    let err = EnginePair::new(b"not wasm", RuntimeConfig::default(), test_host_ctx().await)
      .expect_err("must fail");
    assert!(matches!(err, RuntimeError::Compile(_)));
  }
}
