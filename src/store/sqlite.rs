//! SQLite slot storage.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use color_eyre::{eyre::eyre, Result};
use rusqlite::types::{ToSql, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use super::{Slot, Store};
use crate::record::ChangeSet;
use crate::value::Value;

/// SQLite-based slot storage. Rows are keyed by an `id INTEGER` column.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) a database file, creating parent directories.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Ok(Self::from_connection(conn))
  }

  /// Open the database at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Ok(Self::from_connection(conn))
  }

  fn from_connection(conn: Connection) -> Self {
    Self {
      conn: Mutex::new(conn),
    }
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("cached-field").join("ledger.db"))
  }

  /// Run `f` against the underlying connection.
  ///
  /// Holds the store lock for the duration, so `f` must not call back into
  /// this store.
  pub fn with_connection<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&Connection) -> rusqlite::Result<T>,
  {
    let conn = self.lock()?;
    f(&conn).map_err(|e| eyre!("Database error: {}", e))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn existing_columns(conn: &Connection, table: &str) -> Result<HashSet<String>> {
    let mut stmt = conn
      .prepare(&format!("PRAGMA table_info({})", quote(table)))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let columns: HashSet<String> = stmt
      .query_map([], |row| row.get::<_, String>(1))
      .map_err(|e| eyre!("Failed to read columns of {}: {}", table, e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read columns of {}: {}", table, e))?;

    Ok(columns)
  }
}

impl Store for SqliteStore {
  fn declare_slots(&self, table: &str, slots: &[Slot]) -> Result<()> {
    let conn = self.lock()?;
    let existing = Self::existing_columns(&conn, table)?;
    if existing.is_empty() {
      return Err(eyre!("Table {} does not exist", table));
    }

    for slot in slots {
      if !existing.contains(&slot.name) {
        let mut column = format!("{} {}", quote(&slot.name), slot.kind.sql_type());
        if !slot.default.is_null() {
          column.push_str(&format!(" NOT NULL DEFAULT {}", sql_literal(&slot.default)?));
        }

        conn
          .execute(
            &format!("ALTER TABLE {} ADD COLUMN {}", quote(table), column),
            [],
          )
          .map_err(|e| eyre!("Failed to add column {}.{}: {}", table, slot.name, e))?;
        debug!(table, column = %slot.name, "declared slot");
      }

      if slot.indexed {
        conn
          .execute(
            &format!(
              "CREATE INDEX IF NOT EXISTS {} ON {}({})",
              quote(&format!("idx_{}_{}", table, slot.name)),
              quote(table),
              quote(&slot.name)
            ),
            [],
          )
          .map_err(|e| eyre!("Failed to index {}.{}: {}", table, slot.name, e))?;
      }
    }

    Ok(())
  }

  fn fetch(&self, table: &str, pk: i64, slots: &[Slot]) -> Result<Option<HashMap<String, Value>>> {
    let conn = self.lock()?;

    let mut columns = vec!["id".to_string()];
    columns.extend(slots.iter().map(|s| quote(&s.name)));
    let sql = format!(
      "SELECT {} FROM {} WHERE id = ?1",
      columns.join(", "),
      quote(table)
    );

    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let raw: Option<Vec<SqlValue>> = stmt
      .query_row([pk], |row| {
        (1..=slots.len())
          .map(|i| row.get::<_, SqlValue>(i))
          .collect()
      })
      .optional()
      .map_err(|e| eyre!("Failed to read {} row {}: {}", table, pk, e))?;

    let Some(raw) = raw else {
      return Ok(None);
    };

    let mut values = HashMap::with_capacity(slots.len());
    for (slot, raw) in slots.iter().zip(&raw) {
      let value = Value::from_sql(slot.kind, ValueRef::from(raw))
        .map_err(|e| eyre!("Slot {}.{}: {}", table, slot.name, e))?;
      values.insert(slot.name.clone(), value);
    }

    Ok(Some(values))
  }

  fn update(&self, table: &str, pk: i64, changes: &ChangeSet) -> Result<()> {
    if changes.is_empty() {
      return Ok(());
    }

    let conn = self.lock()?;

    let assignments: Vec<String> = changes
      .iter()
      .enumerate()
      .map(|(i, (name, _))| format!("{} = ?{}", quote(name), i + 1))
      .collect();
    let sql = format!(
      "UPDATE {} SET {} WHERE id = ?{}",
      quote(table),
      assignments.join(", "),
      changes.len() + 1
    );

    let mut params: Vec<&dyn ToSql> = changes.iter().map(|(_, v)| v as &dyn ToSql).collect();
    params.push(&pk);

    let updated = conn
      .execute(&sql, params_from_iter(params))
      .map_err(|e| eyre!("Failed to update {} row {}: {}", table, pk, e))?;

    if updated == 0 {
      return Err(eyre!("No {} row with id {}", table, pk));
    }

    Ok(())
  }
}

fn quote(ident: &str) -> String {
  format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Column defaults can't be bound as parameters, so render them inline.
fn sql_literal(value: &Value) -> Result<String> {
  match value {
    Value::Null => Ok("NULL".to_string()),
    Value::Boolean(b) => Ok(i64::from(*b).to_string()),
    Value::Integer(i) => Ok(i.to_string()),
    Value::Float(f) => Ok(f.to_string()),
    other => Err(eyre!("Unsupported column default: {:?}", other)),
  }
}
