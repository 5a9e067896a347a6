use clap::{Args, Parser, Subcommand};

use gojinn::DataDir;

/// Command line arguments for the Gojinn CLI.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Gojinn: sovereign serverless WASM platform", long_about = None)]
pub struct DefaultCommandLineArgs {
  /// Directory for runtime files: broker store, database, crash dumps,
  /// snapshots. Created if it doesn't exist.
  #[arg(long, env, default_value = DataDir::DEFAULT)]
  pub data_dir: std::path::PathBuf,

  /// Path to the JSON config document (default: <data_dir>/gojinn.json).
  #[arg(long, env)]
  pub config: Option<std::path::PathBuf>,

  #[command(subcommand)]
  pub cmd: Option<SubCommands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommands {
  /// Starts the HTTP server and the embedded broker.
  Run(ServerArgs),
  /// Scaffold a data directory with a default config.
  Init(InitArgs),
  /// Sign a module file in place and install it at the configured path.
  Deploy(DeployArgs),
  /// Re-run a quarantined crash dump synchronously.
  Replay(ReplayArgs),
  /// Generate an Ed25519 signing keypair.
  Keygen(KeygenArgs),
  /// Sign a module file in place.
  Sign(SignArgs),
  /// Create or restore snapshots of the broker store and database.
  Snapshot {
    #[command(subcommand)]
    cmd: SnapshotSubCommands,
  },
}

#[derive(Args, Clone, Debug)]
pub struct ServerArgs {
  /// Authority (<host>:<port>) the HTTP server binds to.
  #[arg(short, long, env, default_value = "localhost:4000")]
  pub address: String,
}

#[derive(Args, Clone, Debug)]
pub struct InitArgs {
  /// Module path written into the generated config.
  #[arg(long, default_value = "function.wasm")]
  pub path: String,
}

#[derive(Args, Clone, Debug)]
pub struct DeployArgs {
  /// Module file to deploy.
  pub file: std::path::PathBuf,

  /// Private key (hex seed file) used to sign before installing.
  #[arg(long, env)]
  pub key: Option<std::path::PathBuf>,
}

#[derive(Args, Clone, Debug)]
pub struct ReplayArgs {
  /// A crash_*.json file produced by the async worker.
  pub crash_file: std::path::PathBuf,
}

#[derive(Args, Clone, Debug)]
pub struct KeygenArgs {
  /// Basename for the generated <name>.pub / <name>.priv files.
  #[arg(long, default_value = "default-key")]
  pub name: String,
}

#[derive(Args, Clone, Debug)]
pub struct SignArgs {
  /// Private key file (hex seed) to sign with.
  #[arg(long, env)]
  pub key: std::path::PathBuf,

  /// WASM file to sign in place.
  #[arg(long)]
  pub file: std::path::PathBuf,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SnapshotSubCommands {
  /// Capture the broker store and database into a compressed archive.
  Create,
  /// Swap the archive contents into place. The server must be stopped and
  /// restarted afterwards.
  Restore {
    archive: std::path::PathBuf,
  },
}
