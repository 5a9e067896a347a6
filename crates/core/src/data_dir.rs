use std::path::PathBuf;

/// The base data directory where the broker store, database, crash dumps and
/// snapshots live.
#[derive(Debug, Clone)]
pub struct DataDir(pub PathBuf);

impl Default for DataDir {
  fn default() -> Self {
    return Self(format!("./{}/", Self::DEFAULT).into());
  }
}

impl DataDir {
  pub const DEFAULT: &str = "gojinn_data";

  pub fn root(&self) -> &PathBuf {
    return &self.0;
  }

  pub fn config_path(&self) -> PathBuf {
    return self.0.join("gojinn.json");
  }

  pub fn nats_store_path(&self) -> PathBuf {
    return self.0.join("nats_store/");
  }

  pub fn snapshots_path(&self) -> PathBuf {
    return self.0.join("snapshots/");
  }

  pub fn default_db_path(&self) -> PathBuf {
    return self.0.join("gojinn.db");
  }

  /// Crash dumps are written straight into the data dir root.
  pub fn crash_dump_path(&self, filename: &str) -> PathBuf {
    return self.0.join(filename);
  }

  pub fn ensure_directory_structure(&self) -> std::io::Result<()> {
    for dir in [
      self.root().clone(),
      self.nats_store_path(),
      self.snapshots_path(),
    ] {
      if !dir.exists() {
        std::fs::create_dir_all(dir)?;
      }
    }
    return Ok(());
  }
}
