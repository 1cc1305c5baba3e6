//! The record-type contract.

use color_eyre::Result;

use crate::record::Record;
use crate::value::Value;

/// A record type carrying cached attributes.
///
/// Implementors supply the calculations behind each attribute and tell the
/// engine where their rows live.
pub trait Model: Send + Sync {
  /// Unique type name (e.g., "ledger.Account")
  fn type_name(&self) -> &str;

  /// Table holding this type's rows
  fn table(&self) -> &str;

  /// Type name to use when dispatching jobs.
  ///
  /// Alias types that share another type's rows return that type's name so
  /// executors reload through the canonical type.
  fn canonical_type(&self) -> &str {
    self.type_name()
  }

  /// Whether `method` names a calculation this type can run.
  fn provides(&self, method: &str) -> bool;

  /// Compute a fresh value.
  ///
  /// May read other slots on `record` but must not read or recalculate the
  /// attribute being computed.
  fn calculate(&self, method: &str, record: &Record) -> Result<Value>;
}
