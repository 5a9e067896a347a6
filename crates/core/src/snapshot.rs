use chrono::Utc;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

use crate::data_dir::DataDir;
use crate::host::db::{DbError, HostDb};

#[derive(Debug, Error)]
pub enum SnapshotError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("database backup failed: {0}")]
  Db(#[from] DbError),
}

/// Removes the staging directory when the operation ends, success or not.
struct StagingDir(PathBuf);

impl StagingDir {
  fn new(prefix: &str) -> Result<Self, std::io::Error> {
    let nanos = std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .map(|d| d.as_nanos())
      .unwrap_or(0);
    let path = std::env::temp_dir().join(format!("{prefix}_{nanos}"));
    std::fs::create_dir_all(&path)?;
    return Ok(Self(path));
  }

  fn path(&self) -> &Path {
    return &self.0;
  }
}

impl Drop for StagingDir {
  fn drop(&mut self) {
    let _ = std::fs::remove_dir_all(&self.0);
  }
}

/// Atomic point-in-time capture: online DB backup plus a verbatim copy of
/// the broker store, compressed into one archive. Returns the archive path.
pub fn create(data_dir: &DataDir, db: Option<&HostDb>) -> Result<PathBuf, SnapshotError> {
  info!("Starting global snapshot");
  let start = Instant::now();

  let snapshot_dir = data_dir.snapshots_path();
  std::fs::create_dir_all(&snapshot_dir)?;

  let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
  let archive_path = snapshot_dir.join(format!("gojinn_snapshot_{timestamp}.tar.gz"));

  let staging = StagingDir::new("gojinn_stage")?;

  if let Some(db) = db {
    info!("Snapshotting database (VACUUM INTO)");
    db.vacuum_into(&staging.path().join("replica.db"))?;
  }

  info!("Snapshotting broker store");
  let nats_store = data_dir.nats_store_path();
  if nats_store.exists() {
    copy_dir(&nats_store, &staging.path().join("nats_store"))?;
  }

  info!("Compressing snapshot archive");
  {
    let file = File::create(&archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    // Entry names stay relative with forward slashes: nats_store/..., replica.db.
    builder.append_dir_all("", staging.path())?;
    builder.into_inner()?.finish()?;
  }

  let size_mb = std::fs::metadata(&archive_path)
    .map(|m| m.len() as f64 / 1024.0 / 1024.0)
    .unwrap_or(0.0);
  info!(
    "Global snapshot completed (file {archive_path:?}, size {size_mb:.2} MB, duration {:?})",
    start.elapsed()
  );

  return Ok(archive_path);
}

/// Swap the on-disk state from `archive` into place. The caller must have
/// shut the engines down first; the process must be restarted afterwards to
/// pick the restored state up (the broker and DB hold live file handles that
/// cannot be replaced mid-process).
pub fn restore_files(
  data_dir: &DataDir,
  archive: &Path,
  db_target: &Path,
) -> Result<(), SnapshotError> {
  let staging = StagingDir::new("gojinn_restore")?;

  info!("Extracting snapshot archive {archive:?}");
  let file = File::open(archive)?;
  let mut unpacker = tar::Archive::new(GzDecoder::new(file));
  unpacker.unpack(staging.path())?;

  let nats_stage = staging.path().join("nats_store");
  if nats_stage.exists() {
    info!("Restoring broker store");
    let nats_target = data_dir.nats_store_path();
    let _ = std::fs::remove_dir_all(&nats_target);
    copy_dir(&nats_stage, &nats_target)?;
  }

  let db_stage = staging.path().join("replica.db");
  if db_stage.exists() {
    info!("Restoring relational database to {db_target:?}");
    let _ = std::fs::remove_file(db_target);
    std::fs::copy(&db_stage, db_target)?;
  }

  warn!("Snapshot files swapped; restart the server to load the restored state");
  return Ok(());
}

fn copy_dir(src: &Path, dst: &Path) -> Result<(), std::io::Error> {
  std::fs::create_dir_all(dst)?;
  for entry in std::fs::read_dir(src)? {
    let entry = entry?;
    let target = dst.join(entry.file_name());
    if entry.file_type()?.is_dir() {
      copy_dir(&entry.path(), &target)?;
    } else {
      std::fs::copy(entry.path(), &target)?;
    }
  }
  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  fn seeded_data_dir(root: &Path) -> DataDir {
    let data_dir = DataDir(root.to_path_buf());
    data_dir.ensure_directory_structure().expect("dirs");

    let store = data_dir.nats_store_path();
    std::fs::create_dir_all(store.join("streams/GOJINN_WORKER")).expect("dirs");
    std::fs::write(store.join("streams/GOJINN_WORKER/msgs.log"), b"stream bytes")
      .expect("write");
    std::fs::write(store.join("meta"), b"store meta").expect("write");
    return data_dir;
  }

  #[test]
  fn test_create_and_restore_roundtrip() {
    let source_root = tempfile::tempdir().expect("tempdir");
    let data_dir = seeded_data_dir(source_root.path());

    let db = HostDb::open("sqlite", &data_dir.default_db_path().to_string_lossy())
      .expect("db");
    db.execute("CREATE TABLE kv (k TEXT, v TEXT)").expect("create");
    db.execute("INSERT INTO kv VALUES ('a', '1')").expect("insert");

    let archive = create(&data_dir, Some(&db)).expect("create snapshot");
    assert!(archive.exists());
    assert!(
      archive
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("gojinn_snapshot_") && n.ends_with(".tar.gz"))
    );

    // Restore into a fresh data dir.
    let restore_root = tempfile::tempdir().expect("tempdir");
    let restored_dir = DataDir(restore_root.path().to_path_buf());
    restored_dir.ensure_directory_structure().expect("dirs");

    let db_target = restored_dir.default_db_path();
    restore_files(&restored_dir, &archive, &db_target).expect("restore");

    let restored_log = restored_dir
      .nats_store_path()
      .join("streams/GOJINN_WORKER/msgs.log");
    assert_eq!(std::fs::read(restored_log).expect("read"), b"stream bytes");

    let restored_db =
      HostDb::open("sqlite", &db_target.to_string_lossy()).expect("reopen");
    let rows = restored_db
      .query_to_json("SELECT v FROM kv WHERE k = 'a'")
      .expect("query");
    let rows: serde_json::Value = serde_json::from_slice(&rows).expect("json");
    assert_eq!(rows[0]["v"], "1");
  }

  #[test]
  fn test_restore_without_db_entry_leaves_db_alone() {
    let source_root = tempfile::tempdir().expect("tempdir");
    let data_dir = seeded_data_dir(source_root.path());

    // Archive without a replica.db.
    let archive = create(&data_dir, None).expect("create snapshot");

    let restore_root = tempfile::tempdir().expect("tempdir");
    let restored_dir = DataDir(restore_root.path().to_path_buf());
    restored_dir.ensure_directory_structure().expect("dirs");

    let db_target = restored_dir.default_db_path();
    std::fs::write(&db_target, b"existing db").expect("write");

    restore_files(&restored_dir, &archive, &db_target).expect("restore");
    assert_eq!(std::fs::read(&db_target).expect("read"), b"existing db");
  }
}
