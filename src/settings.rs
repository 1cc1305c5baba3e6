//! Process-wide defaults for cached attributes.

use serde::Deserialize;

use crate::dispatch::DispatchParams;
use crate::expiration::{deserialize_expiration, Expiration};

/// Defaults consulted when an attribute does not override them.
///
/// Resolved into each [`CachedAttribute`](crate::CachedAttribute) when it is
/// built, so changing settings afterwards does not affect existing attributes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
  /// Expiration used when none is given explicitly. Its presence also turns
  /// on temporal triggers for attributes that don't choose either way.
  #[serde(default, deserialize_with = "deserialize_expiration")]
  pub default_expiration: Option<Expiration>,
  /// Whether flagging as stale schedules a recalculation by default
  #[serde(default)]
  pub eager_recalculation: Option<bool>,
  /// Parameters forwarded to the async executor
  #[serde(default)]
  pub dispatch: DispatchParams,
}

impl Settings {
  pub fn eager_recalculation(&self) -> bool {
    self.eager_recalculation.unwrap_or(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::expiration::Offset;
  use chrono::Duration;

  #[test]
  fn test_empty_settings_defaults() {
    let settings: Settings = serde_yaml::from_str("{}").unwrap();
    assert!(settings.default_expiration.is_none());
    assert!(settings.eager_recalculation());
    assert!(settings.dispatch.is_empty());
  }

  #[test]
  fn test_full_settings() {
    let yaml = r#"
default_expiration:
  hours: 6
eager_recalculation: false
dispatch:
  countdown: 5
  queue: cache
"#;
    let settings: Settings = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(
      settings.default_expiration,
      Some(Expiration::After(Offset::new(Duration::hours(6))))
    );
    assert!(!settings.eager_recalculation());
    assert_eq!(
      settings.dispatch.countdown(),
      Some(std::time::Duration::from_secs(5))
    );
  }

  #[test]
  fn test_unknown_expiration_unit_is_rejected() {
    let yaml = "default_expiration:\n  fortnights: 2\n";
    assert!(serde_yaml::from_str::<Settings>(yaml).is_err());
  }
}
