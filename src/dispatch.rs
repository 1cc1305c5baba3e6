//! Hand-off of recalculations to an asynchronous executor.
//!
//! The engine never runs deferred work itself. It builds a
//! [`RecalculationJob`] that names the record by identity and submits it to a
//! [`Dispatcher`]. Whoever executes the job must reload the record by primary
//! key and call back into [`Engine::recalculate_job`](crate::Engine::recalculate_job).

use std::time::Duration;

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

/// Opaque executor options, forwarded verbatim with every job.
///
/// The bundled worker understands `countdown` (seconds to wait before
/// running); other keys are carried along untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatchParams(Map<String, JsonValue>);

impl DispatchParams {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
    self.0.insert(key.into(), value.into());
    self
  }

  pub fn get(&self, key: &str) -> Option<&JsonValue> {
    self.0.get(key)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Delay requested through the `countdown` key, in (possibly fractional) seconds.
  ///
  /// Values that are not positive or do not fit a [`Duration`] mean no delay.
  pub fn countdown(&self) -> Option<Duration> {
    self
      .get("countdown")
      .and_then(JsonValue::as_f64)
      .filter(|secs| *secs > 0.0)
      .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
  }
}

/// Identity of a deferred recalculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecalculationJob {
  /// Canonical model type name
  pub model: String,
  /// Primary key of the record to reload
  pub pk: i64,
  /// Attribute to recalculate
  pub attribute: String,
  pub params: DispatchParams,
}

impl RecalculationJob {
  /// Stable key for coalescing duplicate jobs.
  ///
  /// Dispatch parameters are not part of the key: two jobs for the same
  /// record and attribute do the same work.
  pub fn idempotency_key(&self) -> String {
    let input = format!("{}:{}:{}", self.model, self.pk, self.attribute);

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Fire-and-forget submission of recalculation jobs.
pub trait Dispatcher: Send + Sync {
  /// Queue a job. Must not wait for it to run.
  fn submit(&self, job: RecalculationJob) -> Result<()>;
}

#[cfg(test)]
mod tests {
  use super::*;

  fn job(pk: i64, countdown: u64) -> RecalculationJob {
    RecalculationJob {
      model: "ledger.Account".to_string(),
      pk,
      attribute: "balance".to_string(),
      params: DispatchParams::new().with("countdown", countdown),
    }
  }

  #[test]
  fn test_idempotency_key_ignores_params() {
    assert_eq!(job(1, 0).idempotency_key(), job(1, 30).idempotency_key());
    assert_ne!(job(1, 0).idempotency_key(), job(2, 0).idempotency_key());
    assert_eq!(job(1, 0).idempotency_key().len(), 64);
  }

  #[test]
  fn test_countdown() {
    assert_eq!(job(1, 3).params.countdown(), Some(Duration::from_secs(3)));
    assert_eq!(job(1, 0).params.countdown(), None);
    assert_eq!(DispatchParams::new().countdown(), None);
    let fractional = DispatchParams::new().with("countdown", 0.5);
    assert_eq!(fractional.countdown(), Some(Duration::from_millis(500)));
    assert_eq!(DispatchParams::new().with("countdown", 1e30).countdown(), None);
    assert_eq!(DispatchParams::new().with("countdown", -2).countdown(), None);
  }

  #[test]
  fn test_params_serialize_as_plain_map() {
    let params = DispatchParams::new().with("queue", "cache").with("priority", 3);
    let json = serde_json::to_string(&params).unwrap();
    assert_eq!(json, r#"{"priority":3,"queue":"cache"}"#);
  }
}
