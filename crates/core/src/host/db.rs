use log::*;
use parking_lot::Mutex;
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
  #[error("unsupported driver '{0}'")]
  UnsupportedDriver(String),
  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("encode error: {0}")]
  Encode(#[from] serde_json::Error),
}

/// Host-side relational pool backing `host_db_query`. Queries run on the
/// caller's blocking thread; the connection is shared behind a lock.
#[derive(Debug)]
pub struct HostDb {
  conn: Mutex<Connection>,
}

impl HostDb {
  /// `db_driver`/`db_dsn` from config. The sqlite family of driver names is
  /// normalized; anything else is rejected at provisioning.
  pub fn open(driver: &str, dsn: &str) -> Result<Self, DbError> {
    match driver {
      "sqlite" | "sqlite3" | "libsql" => {}
      other => return Err(DbError::UnsupportedDriver(other.to_string())),
    }

    let conn = if dsn.contains(":memory:") {
      Connection::open_in_memory()?
    } else {
      Connection::open(dsn.strip_prefix("file:").unwrap_or(dsn))?
    };

    info!("Host database connection established (driver sqlite, dsn '{dsn}')");
    return Ok(Self {
      conn: Mutex::new(conn),
    });
  }

  /// Run a query and render all rows as a JSON array of objects, the wire
  /// shape handed back to guests.
  pub fn query_to_json(&self, query: &str) -> Result<Vec<u8>, DbError> {
    let conn = self.conn.lock();
    let mut stmt = conn.prepare(query)?;
    let column_names: Vec<String> =
      stmt.column_names().iter().map(|c| (*c).to_string()).collect();

    let mut rows = stmt.raw_query();
    let mut table = Vec::new();
    while let Some(row) = rows.next()? {
      let mut entry = serde_json::Map::new();
      for (i, name) in column_names.iter().enumerate() {
        let value = match row.get_ref(i)? {
          ValueRef::Null => serde_json::Value::Null,
          ValueRef::Integer(n) => serde_json::Value::from(n),
          ValueRef::Real(f) => serde_json::Value::from(f),
          ValueRef::Text(text) => {
            serde_json::Value::from(String::from_utf8_lossy(text).into_owned())
          }
          ValueRef::Blob(blob) => {
            serde_json::Value::from(String::from_utf8_lossy(blob).into_owned())
          }
        };
        entry.insert(name.clone(), value);
      }
      table.push(serde_json::Value::Object(entry));
    }

    return Ok(serde_json::to_vec(&table)?);
  }

  /// Online backup used by the snapshot engine.
  pub fn vacuum_into(&self, destination: &Path) -> Result<(), DbError> {
    let conn = self.conn.lock();
    conn.execute(
      "VACUUM INTO ?1",
      [destination.to_string_lossy().into_owned()],
    )?;
    return Ok(());
  }

  pub fn execute(&self, sql: &str) -> Result<usize, DbError> {
    let conn = self.conn.lock();
    return Ok(conn.execute(sql, [])?);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn seeded_db() -> HostDb {
    let db = HostDb::open("sqlite", ":memory:").expect("open");
    db.execute("CREATE TABLE contacts (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
      .expect("create");
    db.execute("INSERT INTO contacts (name, age) VALUES ('ada', 36), ('alan', 41)")
      .expect("insert");
    return db;
  }

  #[test]
  fn test_query_renders_json_rows() {
    let db = seeded_db();
    let bytes = db
      .query_to_json("SELECT name, age FROM contacts ORDER BY id")
      .expect("query");

    let rows: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(rows[0]["name"], "ada");
    assert_eq!(rows[0]["age"], 36);
    assert_eq!(rows[1]["name"], "alan");
  }

  #[test]
  fn test_empty_result_is_empty_array() {
    let db = seeded_db();
    let bytes = db
      .query_to_json("SELECT * FROM contacts WHERE age > 100")
      .expect("query");
    assert_eq!(bytes, b"[]");
  }

  #[test]
  fn test_bad_query_errors() {
    let db = seeded_db();
    assert!(db.query_to_json("SELECT * FROM nope").is_err());
  }

  #[test]
  fn test_unsupported_driver_rejected() {
    let err = HostDb::open("postgres", "host=localhost").expect_err("must fail");
    assert!(matches!(err, DbError::UnsupportedDriver(_)));
  }

  #[test]
  fn test_vacuum_into_produces_replica() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = seeded_db();

    let replica = dir.path().join("replica.db");
    db.vacuum_into(&replica).expect("vacuum");

    let restored = HostDb::open("sqlite", &replica.to_string_lossy()).expect("reopen");
    let bytes = restored
      .query_to_json("SELECT COUNT(*) AS n FROM contacts")
      .expect("query");
    let rows: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(rows[0]["n"], 2);
  }
}
