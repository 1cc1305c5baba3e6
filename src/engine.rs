//! The staleness engine: read, recalculate, flag as stale, expire.
//!
//! A cached value is trusted unless its recalculation flag is set or, with
//! temporal triggers, its expiration has passed. Reads recalculate
//! synchronously; flagging as stale may hand the work to a [`Dispatcher`].
//!
//! # Ordering
//!
//! `recalculate` persists `flag = false` *before* running the calculation.
//! This narrows the window in which concurrent readers would recompute the
//! same value, but it is not a lock: two recalculations can both run and the
//! last write wins. If the calculation fails, the cleared flag stays
//! committed and the old value is trusted until the next `flag_as_stale`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info};

use crate::attribute::CachedAttribute;
use crate::dispatch::{Dispatcher, RecalculationJob};
use crate::expiration::{is_expired, resolve_or_default, Expiration};
use crate::model::Model;
use crate::record::{ChangeSet, Record};
use crate::registry::Registry;
use crate::settings::Settings;
use crate::store::Store;
use crate::value::Value;

/// Runs the staleness state machine against a store and a dispatcher.
pub struct Engine<S: Store, D: Dispatcher> {
  store: Arc<S>,
  registry: Registry,
  settings: Settings,
  dispatcher: D,
}

impl<S: Store, D: Dispatcher> Engine<S, D> {
  pub fn new(store: Arc<S>, registry: Registry, settings: Settings, dispatcher: D) -> Self {
    Self {
      store,
      registry,
      settings,
      dispatcher,
    }
  }

  pub fn store(&self) -> &Arc<S> {
    &self.store
  }

  pub fn registry(&self) -> &Registry {
    &self.registry
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub fn attribute(&self, model: &str, name: &str) -> Result<Arc<CachedAttribute>> {
    self.registry.attribute(model, name)
  }

  /// Load a record with the slots of every attribute bound to its type.
  pub fn load(&self, model: &str, pk: i64) -> Result<Record> {
    let table = self.registry.model(model)?.table().to_string();
    let slots: Vec<_> = self
      .registry
      .attributes(model)?
      .iter()
      .flat_map(|attr| attr.slots())
      .collect();

    let values = self
      .store
      .fetch(&table, pk, &slots)?
      .ok_or_else(|| eyre!("No {} record with primary key {}", model, pk))?;

    Ok(Record::new(model, pk).with_slots(values))
  }

  /// Return the cached value, recalculating first if it can't be trusted.
  ///
  /// Never dispatches async work.
  pub fn read(&self, record: &mut Record, attr: &CachedAttribute) -> Result<Value> {
    let now = Utc::now();
    let mut stale = record.recalculation_needed(attr);
    if attr.temporal_triggers() {
      stale = stale || is_expired(record.expiration(attr), now);
    }

    if stale {
      debug!(
        model = record.model(),
        pk = record.pk(),
        attribute = attr.name(),
        "cached value is stale, recalculating"
      );
      self.recalculate(record, attr, None, true)?;
    }

    Ok(record.cached_value(attr).clone())
  }

  /// Compute a fresh value and store it.
  ///
  /// With `commit`, the flag is cleared in storage up front and the returned
  /// change set (value and, if changed, expiration) has been written in one
  /// update. Without `commit`, nothing is written and the change set also
  /// carries the cleared flag for the caller to persist.
  pub fn recalculate(
    &self,
    record: &mut Record,
    attr: &CachedAttribute,
    expiration: Option<Expiration>,
    commit: bool,
  ) -> Result<ChangeSet> {
    let model = self.model_for(record)?;

    if commit {
      let cleared: ChangeSet = [(attr.recalculation_needed_field(), false)]
        .into_iter()
        .collect();
      self.store.update(model.table(), record.pk(), &cleared)?;
    }

    let value = model.calculate(attr.calculation_method(), record)?;
    record.set(attr.cached_field(), value.clone());
    record.set(attr.recalculation_needed_field(), false);

    let mut changes = ChangeSet::new();
    changes.insert(attr.cached_field(), value);
    if !commit {
      changes.insert(attr.recalculation_needed_field(), false);
    }

    if let Some(field) = attr.expiration_field() {
      let now = Utc::now();
      let current = record.expiration(attr);
      if current.is_none() || is_expired(current, now) {
        let next = resolve_or_default(expiration, attr.default_expiration(), now)?;
        record.set(field, next);
        if next != current {
          changes.insert(field, next);
        }
      }
    }

    if commit {
      self.store.update(model.table(), record.pk(), &changes)?;
      debug!(
        model = record.model(),
        pk = record.pk(),
        attribute = attr.name(),
        "recalculated"
      );
    }

    Ok(changes)
  }

  /// Mark the cached value untrustworthy.
  ///
  /// `and_recalculate` defaults to the eager-recalculation setting. When it
  /// is on and `commit` is set, a recalculation job is scheduled even if the
  /// flag was already set.
  pub fn flag_as_stale(
    &self,
    record: &mut Record,
    attr: &CachedAttribute,
    and_recalculate: Option<bool>,
    commit: bool,
  ) -> Result<ChangeSet> {
    let and_recalculate = and_recalculate.unwrap_or_else(|| self.settings.eager_recalculation());
    let model = self.model_for(record)?;

    let flag_slot = attr.flag_slot();
    let already_flagged = self
      .store
      .fetch(model.table(), record.pk(), std::slice::from_ref(&flag_slot))?
      .ok_or_else(|| eyre!("No {} record with primary key {}", record.model(), record.pk()))?
      .get(&flag_slot.name)
      .and_then(Value::as_bool)
      .unwrap_or(false);

    let mut changes = ChangeSet::new();
    if !already_flagged {
      record.set(attr.recalculation_needed_field(), true);
      changes.insert(attr.recalculation_needed_field(), true);
    }

    if commit {
      self.store.update(model.table(), record.pk(), &changes)?;
      if and_recalculate {
        self.schedule(record, attr)?;
      }
    }

    Ok(changes)
  }

  /// Set and persist a new expiration, returning the resolved timestamp.
  ///
  /// Falls back to the default expiration; with neither, the expiration is
  /// cleared. Leaves the flag alone.
  pub fn expire_after(
    &self,
    record: &mut Record,
    attr: &CachedAttribute,
    expiration: Option<Expiration>,
  ) -> Result<Option<DateTime<Utc>>> {
    let field = attr.expiration_field().ok_or_else(|| {
      eyre!(
        "Cached attribute '{}' has no temporal triggers",
        attr.name()
      )
    })?;
    let model = self.model_for(record)?;

    let at = resolve_or_default(expiration, attr.default_expiration(), Utc::now())?;
    record.set(field, at);

    let changes: ChangeSet = [(field, Value::from(at))].into_iter().collect();
    self.store.update(model.table(), record.pk(), &changes)?;

    Ok(at)
  }

  /// Submit an async recalculation for `record`. Does not wait for it.
  pub fn schedule(&self, record: &Record, attr: &CachedAttribute) -> Result<()> {
    let model = self.model_for(record)?;
    let job = RecalculationJob {
      model: model.canonical_type().to_string(),
      pk: record.pk(),
      attribute: attr.name().to_string(),
      params: attr.dispatch_params().clone(),
    };

    info!(
      model = %job.model,
      pk = job.pk,
      attribute = %job.attribute,
      "scheduling recalculation"
    );
    self.dispatcher.submit(job)
  }

  /// Executor callback: reload the record by identity and recalculate.
  pub fn recalculate_job(&self, job: &RecalculationJob) -> Result<ChangeSet> {
    let attr = self.registry.attribute(&job.model, &job.attribute)?;
    let mut record = self.load(&job.model, job.pk)?;
    self.recalculate(&mut record, &attr, None, true)
  }

  fn model_for(&self, record: &Record) -> Result<Arc<dyn Model>> {
    self.registry.model(record.model())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dispatch::DispatchParams;
  use crate::store::{MemoryStore, UpdateRecord};
  use chrono::Duration;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  const ACCOUNT: &str = "ledger.Account";
  const TABLE: &str = "accounts";

  struct Account {
    calls: AtomicUsize,
    fail: std::sync::atomic::AtomicBool,
    value: i64,
  }

  impl Model for Account {
    fn type_name(&self) -> &str {
      ACCOUNT
    }

    fn table(&self) -> &str {
      TABLE
    }

    fn provides(&self, method: &str) -> bool {
      method == "calculate_balance"
    }

    fn calculate(&self, _method: &str, _record: &Record) -> Result<Value> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if self.fail.load(Ordering::SeqCst) {
        return Err(eyre!("ledger offline"));
      }
      Ok(Value::Integer(self.value))
    }
  }

  struct AccountView;

  impl Model for AccountView {
    fn type_name(&self) -> &str {
      "ledger.AccountView"
    }

    fn table(&self) -> &str {
      TABLE
    }

    fn canonical_type(&self) -> &str {
      ACCOUNT
    }

    fn provides(&self, _method: &str) -> bool {
      true
    }

    fn calculate(&self, _method: &str, _record: &Record) -> Result<Value> {
      Ok(Value::Integer(7))
    }
  }

  #[derive(Default)]
  struct RecordingDispatcher {
    jobs: Mutex<Vec<RecalculationJob>>,
  }

  impl Dispatcher for RecordingDispatcher {
    fn submit(&self, job: RecalculationJob) -> Result<()> {
      self.jobs.lock().unwrap().push(job);
      Ok(())
    }
  }

  impl RecordingDispatcher {
    fn jobs(&self) -> Vec<RecalculationJob> {
      self.jobs.lock().unwrap().clone()
    }
  }

  struct Fixture {
    engine: Engine<MemoryStore, RecordingDispatcher>,
    model: Arc<Account>,
    attr: Arc<CachedAttribute>,
  }

  impl Fixture {
    fn store(&self) -> &MemoryStore {
      self.engine.store()
    }

    fn updates(&self) -> Vec<UpdateRecord> {
      self.store().updates()
    }

    fn calls(&self) -> usize {
      self.model.calls.load(Ordering::SeqCst)
    }

    fn record(&self) -> Record {
      self.engine.load(ACCOUNT, 1).unwrap()
    }

    fn jobs(&self) -> Vec<RecalculationJob> {
      self.engine.dispatcher.jobs()
    }
  }

  fn fixture_with(settings: Settings, temporal: Option<bool>) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    store.insert(TABLE, 1).unwrap();

    let model = Arc::new(Account {
      calls: AtomicUsize::new(0),
      fail: Default::default(),
      value: 42,
    });

    let mut builder = CachedAttribute::builder("balance")
      .value_kind(crate::value::ValueKind::Integer)
      .dispatch_params(DispatchParams::new().with("queue", "cache"));
    if let Some(temporal) = temporal {
      builder = builder.temporal_triggers(temporal);
    }
    let attr = builder.build(&settings).unwrap();

    let mut registry = Registry::new();
    let attr = registry
      .bind(store.as_ref(), model.clone(), attr)
      .unwrap();
    registry.register(Arc::new(AccountView));

    let engine = Engine::new(store, registry, settings, RecordingDispatcher::default());
    Fixture {
      engine,
      model,
      attr,
    }
  }

  fn fixture() -> Fixture {
    fixture_with(Settings::default(), None)
  }

  fn temporal_fixture() -> Fixture {
    let settings = Settings {
      default_expiration: Some(Duration::hours(1).into()),
      ..Default::default()
    };
    fixture_with(settings, None)
  }

  fn one(slot: &str, value: impl Into<Value>) -> ChangeSet {
    let mut changes = ChangeSet::new();
    changes.insert(slot, value);
    changes
  }

  /// Put the row in a trusted state without going through the engine.
  fn settle(f: &Fixture, value: i64) {
    f.store()
      .set(TABLE, 1, "cached_balance", Value::Integer(value))
      .unwrap();
    f.store()
      .set(TABLE, 1, "balance_recalculation_needed", false)
      .unwrap();
  }

  #[test]
  fn test_read_trusts_clean_value() {
    let f = fixture();
    settle(&f, 10);

    let mut record = f.record();
    assert_eq!(f.engine.read(&mut record, &f.attr).unwrap(), Value::Integer(10));
    assert_eq!(f.calls(), 0);
    assert!(f.updates().is_empty());
  }

  #[test]
  fn test_read_with_flag_recalculates_exactly_once() {
    let f = fixture();
    let mut record = f.record();
    assert!(record.recalculation_needed(&f.attr));

    assert_eq!(f.engine.read(&mut record, &f.attr).unwrap(), Value::Integer(42));
    assert_eq!(f.calls(), 1);
    assert!(!record.recalculation_needed(&f.attr));
    assert_eq!(
      f.store().get(TABLE, 1, "balance_recalculation_needed"),
      Some(Value::Boolean(false))
    );

    // Now trusted
    assert_eq!(f.engine.read(&mut record, &f.attr).unwrap(), Value::Integer(42));
    assert_eq!(f.calls(), 1);
    assert!(f.jobs().is_empty());
  }

  #[test]
  fn test_past_expiration_acts_like_flag() {
    let f = temporal_fixture();
    settle(&f, 10);
    let past = Utc::now() - Duration::minutes(5);
    f.store()
      .set(TABLE, 1, "balance_expires_after", past)
      .unwrap();

    let mut record = f.record();
    assert_eq!(f.engine.read(&mut record, &f.attr).unwrap(), Value::Integer(42));
    assert_eq!(f.calls(), 1);

    // No flag=true write happened; only the pre-clear and the value update.
    let updates = f.updates();
    assert_eq!(updates.len(), 2);
    assert!(updates
      .iter()
      .all(|u| u.changes.get("balance_recalculation_needed") != Some(&Value::Boolean(true))));

    let new_expiration = record.expiration(&f.attr).unwrap();
    assert!(new_expiration > Utc::now());
  }

  #[test]
  fn test_future_expiration_is_trusted() {
    let f = temporal_fixture();
    settle(&f, 10);
    f.store()
      .set(TABLE, 1, "balance_expires_after", Utc::now() + Duration::hours(1))
      .unwrap();

    let mut record = f.record();
    assert_eq!(f.engine.read(&mut record, &f.attr).unwrap(), Value::Integer(10));
    assert_eq!(f.calls(), 0);
  }

  #[test]
  fn test_recalculate_carries_expiration_forward() {
    let f = temporal_fixture();
    let mut record = f.record();

    let before = Utc::now();
    let changes = f.engine.recalculate(&mut record, &f.attr, None, true).unwrap();
    let after = Utc::now();

    let updates = f.updates();
    assert_eq!(updates.len(), 2);
    assert_eq!(
      updates[0].changes,
      one("balance_recalculation_needed", false)
    );
    assert_eq!(updates[1].changes, changes);

    assert_eq!(changes.get("cached_balance"), Some(&Value::Integer(42)));
    assert!(!changes.contains("balance_recalculation_needed"));
    let expires = changes
      .get("balance_expires_after")
      .and_then(Value::as_datetime)
      .unwrap();
    assert!(expires >= before + Duration::hours(1));
    assert!(expires <= after + Duration::hours(1));
  }

  #[test]
  fn test_recalculate_keeps_future_expiration() {
    let f = temporal_fixture();
    let future = Utc::now() + Duration::days(2);
    f.store()
      .set(TABLE, 1, "balance_expires_after", future)
      .unwrap();

    let mut record = f.record();
    let changes = f.engine.recalculate(&mut record, &f.attr, None, true).unwrap();
    assert!(!changes.contains("balance_expires_after"));
    assert_eq!(record.expiration(&f.attr), Some(future));
  }

  #[test]
  fn test_recalculate_uses_explicit_expiration() {
    let f = temporal_fixture();
    let mut record = f.record();
    let at = Utc::now() + Duration::days(30);

    let changes = f
      .engine
      .recalculate(&mut record, &f.attr, Some(Expiration::At(at)), true)
      .unwrap();
    assert_eq!(changes.get("balance_expires_after"), Some(&Value::DateTime(at)));
  }

  #[test]
  fn test_uncommitted_recalculate_returns_pending_changes() {
    let f = temporal_fixture();
    let mut record = f.record();

    let changes = f.engine.recalculate(&mut record, &f.attr, None, false).unwrap();

    assert!(f.updates().is_empty());
    assert_eq!(changes.get("cached_balance"), Some(&Value::Integer(42)));
    assert_eq!(
      changes.get("balance_recalculation_needed"),
      Some(&Value::Boolean(false))
    );
    assert!(changes.contains("balance_expires_after"));
    assert_eq!(record.cached_value(&f.attr), &Value::Integer(42));
  }

  #[test]
  fn test_failed_calculation_leaves_flag_cleared() {
    let f = fixture();
    settle(&f, 10);
    f.store()
      .set(TABLE, 1, "balance_recalculation_needed", true)
      .unwrap();
    f.model.fail.store(true, Ordering::SeqCst);

    let mut record = f.record();
    assert!(f.engine.read(&mut record, &f.attr).is_err());

    assert_eq!(
      f.store().get(TABLE, 1, "balance_recalculation_needed"),
      Some(Value::Boolean(false))
    );
    assert_eq!(f.store().get(TABLE, 1, "cached_balance"), Some(Value::Integer(10)));
  }

  #[test]
  fn test_storage_failure_propagates() {
    let f = fixture();
    let mut record = f.record();
    f.store().set_unavailable(true);

    assert!(f.engine.recalculate(&mut record, &f.attr, None, true).is_err());
    assert!(f
      .engine
      .flag_as_stale(&mut record, &f.attr, Some(false), true)
      .is_err());
    assert_eq!(f.calls(), 0);
  }

  #[test]
  fn test_flag_as_stale_twice_is_a_noop() {
    let f = fixture();
    settle(&f, 10);
    let mut record = f.record();

    let first = f
      .engine
      .flag_as_stale(&mut record, &f.attr, Some(false), true)
      .unwrap();
    assert_eq!(
      first,
      one("balance_recalculation_needed", true)
    );

    let second = f
      .engine
      .flag_as_stale(&mut record, &f.attr, Some(false), true)
      .unwrap();
    assert!(second.is_empty());
    assert!(record.recalculation_needed(&f.attr));
    assert_eq!(f.updates().len(), 1);
    assert!(f.jobs().is_empty());
  }

  #[test]
  fn test_flag_as_stale_reads_storage_not_memory() {
    let f = fixture();
    settle(&f, 10);
    let mut record = f.record();
    // In-memory copy says stale, storage says clean.
    record.set("balance_recalculation_needed", true);

    let changes = f
      .engine
      .flag_as_stale(&mut record, &f.attr, Some(false), true)
      .unwrap();
    assert!(changes.contains("balance_recalculation_needed"));
  }

  #[test]
  fn test_flag_then_read_with_async_scenario() {
    let f = fixture_with(Settings::default(), Some(false));
    settle(&f, 10);
    let mut record = f.record();

    let changes = f.engine.flag_as_stale(&mut record, &f.attr, None, true).unwrap();
    assert_eq!(
      changes,
      one("balance_recalculation_needed", true)
    );
    assert_eq!(
      f.store().get(TABLE, 1, "balance_recalculation_needed"),
      Some(Value::Boolean(true))
    );

    let jobs = f.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].model, ACCOUNT);
    assert_eq!(jobs[0].pk, 1);
    assert_eq!(jobs[0].params, DispatchParams::new().with("queue", "cache"));

    // A direct read before the job runs recalculates synchronously.
    assert_eq!(f.engine.read(&mut record, &f.attr).unwrap(), Value::Integer(42));
    assert_eq!(f.calls(), 1);

    // The job then runs against a fresh load: redundant but harmless.
    let job_changes = f.engine.recalculate_job(&jobs[0]).unwrap();
    assert_eq!(job_changes.get("cached_balance"), Some(&Value::Integer(42)));
    assert_eq!(f.calls(), 2);
    assert_eq!(
      f.store().get(TABLE, 1, "balance_recalculation_needed"),
      Some(Value::Boolean(false))
    );
  }

  #[test]
  fn test_flag_as_stale_reschedules_even_when_already_flagged() {
    let f = fixture();
    let mut record = f.record();

    let changes = f.engine.flag_as_stale(&mut record, &f.attr, Some(true), true).unwrap();
    assert!(changes.is_empty());
    assert_eq!(f.jobs().len(), 1);
  }

  #[test]
  fn test_flag_as_stale_follows_eager_setting() {
    let settings = Settings {
      eager_recalculation: Some(false),
      ..Default::default()
    };
    let f = fixture_with(settings, None);
    settle(&f, 10);
    let mut record = f.record();

    f.engine.flag_as_stale(&mut record, &f.attr, None, true).unwrap();
    assert!(f.jobs().is_empty());

    f.engine
      .flag_as_stale(&mut record, &f.attr, Some(true), true)
      .unwrap();
    assert_eq!(f.jobs().len(), 1);
  }

  #[test]
  fn test_uncommitted_flag_writes_and_schedules_nothing() {
    let f = fixture();
    settle(&f, 10);
    let mut record = f.record();

    let changes = f
      .engine
      .flag_as_stale(&mut record, &f.attr, Some(true), false)
      .unwrap();
    assert!(changes.contains("balance_recalculation_needed"));
    assert!(record.recalculation_needed(&f.attr));
    assert!(f.updates().is_empty());
    assert!(f.jobs().is_empty());
  }

  #[test]
  fn test_alias_record_dispatches_canonical_type() {
    let f = fixture();
    let record = Record::new("ledger.AccountView", 1);
    f.engine.schedule(&record, &f.attr).unwrap();
    assert_eq!(f.jobs()[0].model, ACCOUNT);
  }

  #[test]
  fn test_expire_after_persists_only_expiration() {
    let f = temporal_fixture();
    settle(&f, 10);
    let mut record = f.record();

    let at = f
      .engine
      .expire_after(&mut record, &f.attr, Some(Duration::minutes(10).into()))
      .unwrap()
      .unwrap();
    assert!(at > Utc::now());

    let updates = f.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(
      updates[0].changes,
      one("balance_expires_after", Value::DateTime(at))
    );
    assert!(!record.recalculation_needed(&f.attr));
  }

  #[test]
  fn test_expire_after_requires_temporal_triggers() {
    let f = fixture_with(Settings::default(), Some(false));
    let mut record = f.record();
    assert!(f.engine.expire_after(&mut record, &f.attr, None).is_err());
  }

  #[test]
  fn test_recalculate_job_for_missing_record_fails() {
    let f = fixture();
    let job = RecalculationJob {
      model: ACCOUNT.to_string(),
      pk: 404,
      attribute: "balance".to_string(),
      params: DispatchParams::new(),
    };
    assert!(f.engine.recalculate_job(&job).is_err());
    assert_eq!(f.calls(), 0);
  }
}
