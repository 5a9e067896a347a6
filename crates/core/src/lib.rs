#![forbid(unsafe_code, clippy::unwrap_used)]
#![allow(clippy::needless_return)]
#![warn(clippy::await_holding_lock, clippy::inefficient_to_string)]

pub mod agentic;
pub mod broker;
pub mod config;
pub mod data_dir;
pub mod engine;
pub mod envelope;
pub mod metrics;
pub mod server;
pub mod signing;
pub mod snapshot;

mod buffer_pool;
mod executor;
mod host;
mod jobs;
mod pool;
mod runtime;
mod scheduler;
mod worker;

pub use config::{Config, CronJobConfig, ToolConfig};
pub use data_dir::DataDir;
pub use engine::{Engine, ProvisionError};
pub use envelope::{RequestEnvelope, ResponseEnvelope};
pub use host::ai::{AiClient, AiError};
pub use host::db::{DbError, HostDb};
pub use pool::PoolError;
pub use runtime::{RuntimeConfig, RuntimeError};
pub use worker::{CrashSnapshot, load_crash_dump};

use sha2::{Digest, Sha256};

/// Stable identity of a function: the hex SHA-256 of its module path.
pub(crate) fn hash_string(input: &str) -> String {
  return hex::encode(Sha256::digest(input.as_bytes()));
}

/// Broker subject a function's jobs are published on.
pub fn function_subject(module_path: &str) -> String {
  return format!("exec.{}", hash_string(module_path));
}
