//! In-memory record instances and slot change sets.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::attribute::CachedAttribute;
use crate::value::Value;

static NULL: Value = Value::Null;

/// A loaded row: model type, primary key and the slots read from storage.
///
/// The engine mutates slots in place; the instance can drift from storage
/// when a write fails, so reload it after an error.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
  model: String,
  pk: i64,
  slots: HashMap<String, Value>,
}

impl Record {
  pub fn new(model: impl Into<String>, pk: i64) -> Self {
    Self {
      model: model.into(),
      pk,
      slots: HashMap::new(),
    }
  }

  pub fn with_slot(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.set(name, value);
    self
  }

  pub(crate) fn with_slots(mut self, slots: HashMap<String, Value>) -> Self {
    self.slots.extend(slots);
    self
  }

  pub fn model(&self) -> &str {
    &self.model
  }

  pub fn pk(&self) -> i64 {
    self.pk
  }

  /// Slot value, `Null` when the slot was never loaded.
  pub fn get(&self, slot: &str) -> &Value {
    self.slots.get(slot).unwrap_or(&NULL)
  }

  pub fn set(&mut self, slot: impl Into<String>, value: impl Into<Value>) {
    self.slots.insert(slot.into(), value.into());
  }

  pub fn cached_value(&self, attr: &CachedAttribute) -> &Value {
    self.get(attr.cached_field())
  }

  /// The stored flag. A missing or null flag counts as set.
  pub fn recalculation_needed(&self, attr: &CachedAttribute) -> bool {
    self
      .get(attr.recalculation_needed_field())
      .as_bool()
      .unwrap_or(true)
  }

  /// Current expiration, `None` without temporal triggers or when unset.
  pub fn expiration(&self, attr: &CachedAttribute) -> Option<DateTime<Utc>> {
    attr
      .expiration_field()
      .and_then(|field| self.get(field).as_datetime())
  }
}

/// Slots to write in one targeted update, keyed by slot name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet(BTreeMap<String, Value>);

impl ChangeSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, slot: impl Into<String>, value: impl Into<Value>) {
    self.0.insert(slot.into(), value.into());
  }

  pub fn get(&self, slot: &str) -> Option<&Value> {
    self.0.get(slot)
  }

  pub fn contains(&self, slot: &str) -> bool {
    self.0.contains_key(slot)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v))
  }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ChangeSet {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self(
      iter
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }
}
