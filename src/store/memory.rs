//! In-memory slot storage with an update journal.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use color_eyre::{eyre::eyre, Result};

use super::{Slot, Store};
use crate::record::ChangeSet;
use crate::value::Value;

/// One write issued through [`Store::update`].
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRecord {
  pub table: String,
  pub pk: i64,
  pub changes: ChangeSet,
}

#[derive(Default)]
struct Table {
  slots: HashMap<String, Slot>,
  rows: HashMap<i64, HashMap<String, Value>>,
}

#[derive(Default)]
struct Inner {
  tables: HashMap<String, Table>,
  journal: Vec<UpdateRecord>,
  unavailable: bool,
}

/// Storage that keeps rows in memory and journals every update.
///
/// Useful for tests that need to assert exactly which writes happened.
#[derive(Default)]
pub struct MemoryStore {
  inner: Mutex<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
    self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Insert a row with every declared slot at its default.
  pub fn insert(&self, table: &str, pk: i64) -> Result<()> {
    let mut inner = self.lock()?;
    let table = inner.tables.entry(table.to_string()).or_default();
    let row = table
      .slots
      .values()
      .map(|slot| (slot.name.clone(), slot.default.clone()))
      .collect();
    table.rows.insert(pk, row);
    Ok(())
  }

  /// Write a slot directly, bypassing the journal.
  pub fn set(&self, table: &str, pk: i64, slot: &str, value: impl Into<Value>) -> Result<()> {
    let mut inner = self.lock()?;
    let row = inner
      .tables
      .get_mut(table)
      .and_then(|t| t.rows.get_mut(&pk))
      .ok_or_else(|| eyre!("No {} row with id {}", table, pk))?;
    row.insert(slot.to_string(), value.into());
    Ok(())
  }

  /// Read a slot directly.
  pub fn get(&self, table: &str, pk: i64, slot: &str) -> Option<Value> {
    let inner = self.inner.lock().ok()?;
    inner
      .tables
      .get(table)?
      .rows
      .get(&pk)?
      .get(slot)
      .cloned()
  }

  /// Every update issued so far, oldest first.
  pub fn updates(&self) -> Vec<UpdateRecord> {
    self
      .inner
      .lock()
      .map(|inner| inner.journal.clone())
      .unwrap_or_default()
  }

  pub fn clear_updates(&self) {
    if let Ok(mut inner) = self.inner.lock() {
      inner.journal.clear();
    }
  }

  /// Make every subsequent store operation fail.
  pub fn set_unavailable(&self, unavailable: bool) {
    if let Ok(mut inner) = self.inner.lock() {
      inner.unavailable = unavailable;
    }
  }

  fn available(&self) -> Result<MutexGuard<'_, Inner>> {
    let inner = self.lock()?;
    if inner.unavailable {
      return Err(eyre!("Storage unavailable"));
    }
    Ok(inner)
  }
}

impl Store for MemoryStore {
  fn declare_slots(&self, table: &str, slots: &[Slot]) -> Result<()> {
    let mut inner = self.available()?;
    let table = inner.tables.entry(table.to_string()).or_default();
    for slot in slots {
      for row in table.rows.values_mut() {
        row
          .entry(slot.name.clone())
          .or_insert_with(|| slot.default.clone());
      }
      table.slots.insert(slot.name.clone(), slot.clone());
    }
    Ok(())
  }

  fn fetch(&self, table: &str, pk: i64, slots: &[Slot]) -> Result<Option<HashMap<String, Value>>> {
    let inner = self.available()?;
    let Some(row) = inner.tables.get(table).and_then(|t| t.rows.get(&pk)) else {
      return Ok(None);
    };

    Ok(Some(
      slots
        .iter()
        .map(|slot| {
          let value = row.get(&slot.name).cloned().unwrap_or_default();
          (slot.name.clone(), value)
        })
        .collect(),
    ))
  }

  fn update(&self, table: &str, pk: i64, changes: &ChangeSet) -> Result<()> {
    if changes.is_empty() {
      return Ok(());
    }

    let mut inner = self.available()?;
    let row = inner
      .tables
      .get_mut(table)
      .and_then(|t| t.rows.get_mut(&pk))
      .ok_or_else(|| eyre!("No {} row with id {}", table, pk))?;

    for (name, value) in changes.iter() {
      row.insert(name.to_string(), value.clone());
    }

    inner.journal.push(UpdateRecord {
      table: table.to_string(),
      pk,
      changes: changes.clone(),
    });

    Ok(())
  }
}
