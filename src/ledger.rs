//! Demo ledger: accounts whose balance is a cached attribute over entries.

use std::sync::Arc;

use cached_field::{CachedAttribute, Model, Record, Settings, SqliteStore, Value, ValueKind};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};

pub const ACCOUNT: &str = "ledger.Account";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS entries (
    id INTEGER PRIMARY KEY,
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    amount INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_entries_account ON entries(account_id);
"#;

/// Account rows; the balance is the sum of their entries, in cents.
pub struct AccountModel {
  store: Arc<SqliteStore>,
}

impl AccountModel {
  pub fn new(store: Arc<SqliteStore>) -> Self {
    Self { store }
  }
}

impl Model for AccountModel {
  fn type_name(&self) -> &str {
    ACCOUNT
  }

  fn table(&self) -> &str {
    "accounts"
  }

  fn provides(&self, method: &str) -> bool {
    method == "calculate_balance"
  }

  fn calculate(&self, method: &str, record: &Record) -> Result<Value> {
    if !self.provides(method) {
      return Err(eyre!("{} has no calculation '{}'", ACCOUNT, method));
    }

    let total: i64 = self.store.with_connection(|conn| {
      conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM entries WHERE account_id = ?",
        params![record.pk()],
        |row| row.get(0),
      )
    })?;

    Ok(Value::Integer(total))
  }
}

/// The `balance` attribute: integer, flag indexed for stale sweeps.
pub fn balance_attribute(settings: &Settings) -> Result<CachedAttribute> {
  CachedAttribute::builder("balance")
    .value_kind(ValueKind::Integer)
    .index_on_flag(true)
    .index_on_expiration(true)
    .build(settings)
}

pub fn create_schema(store: &SqliteStore) -> Result<()> {
  store.with_connection(|conn| conn.execute_batch(SCHEMA))
}

/// Primary key of the named account, creating it if needed.
pub fn ensure_account(store: &SqliteStore, name: &str) -> Result<i64> {
  store.with_connection(|conn| {
    conn.execute(
      "INSERT OR IGNORE INTO accounts (name) VALUES (?)",
      params![name],
    )?;
    conn.query_row(
      "SELECT id FROM accounts WHERE name = ?",
      params![name],
      |row| row.get(0),
    )
  })
}

pub fn find_account(store: &SqliteStore, name: &str) -> Result<i64> {
  store
    .with_connection(|conn| {
      conn
        .query_row(
          "SELECT id FROM accounts WHERE name = ?",
          params![name],
          |row| row.get(0),
        )
        .optional()
    })?
    .ok_or_else(|| eyre!("No account named '{}'", name))
}

pub fn add_entry(store: &SqliteStore, account_id: i64, amount: i64) -> Result<()> {
  store.with_connection(|conn| {
    conn.execute(
      "INSERT INTO entries (account_id, amount) VALUES (?, ?)",
      params![account_id, amount],
    )
  })?;
  Ok(())
}
