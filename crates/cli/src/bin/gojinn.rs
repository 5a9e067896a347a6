#![allow(clippy::needless_return)]

use clap::{CommandFactory, Parser};
use log::*;
use std::path::{Path, PathBuf};

use gojinn::{Config, DataDir, Engine, HostDb, load_crash_dump, signing, snapshot};
use gojinn_cli::{DefaultCommandLineArgs, SnapshotSubCommands, SubCommands};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn init_logger() {
  env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
}

fn config_path(args: &DefaultCommandLineArgs, data_dir: &DataDir) -> PathBuf {
  return args.config.clone().unwrap_or_else(|| data_dir.config_path());
}

fn load_config(args: &DefaultCommandLineArgs, data_dir: &DataDir) -> Result<Config, BoxError> {
  let path = config_path(args, data_dir);
  return Ok(Config::load(&path).map_err(|err| format!("config {path:?}: {err}"))?);
}

fn db_target(config: &Config, data_dir: &DataDir) -> PathBuf {
  if config.db_dsn.is_empty() {
    return data_dir.default_db_path();
  }
  return PathBuf::from(config.db_dsn.strip_prefix("file:").unwrap_or(&config.db_dsn));
}

fn open_db(config: &Config) -> Result<Option<HostDb>, BoxError> {
  if config.db_driver.is_empty() || config.db_dsn.is_empty() {
    return Ok(None);
  }
  return Ok(Some(HostDb::open(&config.db_driver, &config.db_dsn)?));
}

async fn async_main() -> Result<(), BoxError> {
  let args = DefaultCommandLineArgs::parse();
  let data_dir = DataDir(args.data_dir.clone());

  match args.cmd.clone() {
    Some(SubCommands::Run(cmd)) => {
      init_logger();

      let config = load_config(&args, &data_dir)?;
      let engine = Engine::provision(config, data_dir).await?;
      gojinn::server::serve(&cmd.address, engine).await?;
    }
    Some(SubCommands::Init(cmd)) => {
      init_logger();

      data_dir.ensure_directory_structure()?;
      let path = config_path(&args, &data_dir);
      if path.exists() {
        return Err(format!("refusing to overwrite existing config {path:?}").into());
      }

      let config = Config {
        path: cmd.path,
        ..Default::default()
      };
      std::fs::write(&path, serde_json::to_vec_pretty(&config)?)?;
      println!("Initialized {path:?}");
    }
    Some(SubCommands::Keygen(cmd)) => {
      init_logger();

      let (sk, pk) = signing::generate_keypair();
      let priv_path = format!("{}.priv", cmd.name);
      let pub_path = format!("{}.pub", cmd.name);
      std::fs::write(&priv_path, signing::encode_signing_key(&sk))?;
      std::fs::write(&pub_path, signing::encode_verifying_key(&pk))?;

      println!("Keys generated: {pub_path} and {priv_path}");
      println!("Public key (add to trusted_signing_keys):");
      println!("{}", signing::encode_verifying_key(&pk));
    }
    Some(SubCommands::Sign(cmd)) => {
      init_logger();

      let key = signing::parse_signing_key(&std::fs::read_to_string(&cmd.key)?)?;
      signing::sign_file(&cmd.file, &key)?;
      println!("File successfully signed: {:?}", cmd.file);
    }
    Some(SubCommands::Deploy(cmd)) => {
      init_logger();

      let config = load_config(&args, &data_dir)?;

      if let Some(ref key_path) = cmd.key {
        let key = signing::parse_signing_key(&std::fs::read_to_string(key_path)?)?;
        signing::sign_file(&cmd.file, &key)?;
        info!("Signed {:?}", cmd.file);
      }

      let target = Path::new(&config.path);
      if cmd.file.as_path() != target {
        std::fs::copy(&cmd.file, target)?;
      }
      println!("Deployed {:?} -> {:?}", cmd.file, target);
      println!("Trigger the reload endpoint (or restart) to pick it up.");
    }
    Some(SubCommands::Replay(cmd)) => {
      init_logger();

      let dump = load_crash_dump(&cmd.crash_file)?;
      warn!("Replaying crash from {:?} (module '{}')", cmd.crash_file, dump.wasm_file);

      let config = load_config(&args, &data_dir)?;
      let engine = Engine::provision(config, data_dir).await?;
      let result = engine.replay(&dump).await;
      engine.cleanup().await;

      match result {
        Ok(output) => println!("{output}"),
        Err(err) => return Err(err.into()),
      }
    }
    Some(SubCommands::Snapshot { cmd }) => {
      init_logger();

      let config = load_config(&args, &data_dir)?;
      match cmd {
        SnapshotSubCommands::Create => {
          let db = open_db(&config)?;
          let archive = snapshot::create(&data_dir, db.as_ref())?;
          println!("Snapshot created: {archive:?}");
        }
        SnapshotSubCommands::Restore { archive } => {
          let target = db_target(&config, &data_dir);
          snapshot::restore_files(&data_dir, &archive, &target)?;
          println!("Snapshot restored; start the server to load the new state.");
        }
      }
    }
    None => {
      let _ = DefaultCommandLineArgs::command().print_help();
    }
  }

  return Ok(());
}

fn main() -> Result<(), BoxError> {
  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()?;
  return runtime.block_on(async_main());
}
