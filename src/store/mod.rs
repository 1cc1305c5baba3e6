//! Storage of cached-attribute slots.
//!
//! The engine only needs three things from storage: declare slots on a
//! table, read named slots of one row, and update a subset of slots of one
//! row atomically. Rows are addressed by integer primary key.

mod memory;
mod sqlite;

use std::collections::HashMap;

use color_eyre::Result;

use crate::record::ChangeSet;
use crate::value::{Value, ValueKind};

pub use memory::{MemoryStore, UpdateRecord};
pub use sqlite::SqliteStore;

/// A named storage slot on a record type.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
  pub name: String,
  pub kind: ValueKind,
  /// Value for existing and newly inserted rows; `Null` means nullable
  pub default: Value,
  /// Secondary index hint
  pub indexed: bool,
}

impl Slot {
  pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
    Self {
      name: name.into(),
      kind,
      default: Value::Null,
      indexed: false,
    }
  }

  pub fn with_default(mut self, default: Value) -> Self {
    self.default = default;
    self
  }

  pub fn indexed(mut self, indexed: bool) -> Self {
    self.indexed = indexed;
    self
  }
}

/// Trait for slot storage backends.
pub trait Store: Send + Sync {
  /// Make sure `table` has every slot, adding the missing ones.
  fn declare_slots(&self, table: &str, slots: &[Slot]) -> Result<()>;

  /// Point read of `slots` for one row. `None` when the row doesn't exist.
  fn fetch(&self, table: &str, pk: i64, slots: &[Slot]) -> Result<Option<HashMap<String, Value>>>;

  /// Write exactly the slots in `changes` for one row, atomically.
  ///
  /// An empty change set writes nothing.
  fn update(&self, table: &str, pk: i64, changes: &ChangeSet) -> Result<()>;
}
