#![allow(clippy::needless_return)]

mod args;

pub use args::{
  DefaultCommandLineArgs, DeployArgs, InitArgs, KeygenArgs, ReplayArgs, ServerArgs, SignArgs,
  SnapshotSubCommands, SubCommands,
};
