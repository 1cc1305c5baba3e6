//! Expiration policies for temporally triggered attributes.

use chrono::{DateTime, Duration, Months, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Deserializer};

/// A relative offset: calendar months followed by a fixed duration.
///
/// Months are applied first and clamp to the end of shorter months, so
/// January 31st plus one month lands on the last day of February.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offset {
  months: u32,
  duration: Duration,
}

impl Offset {
  pub fn new(duration: Duration) -> Self {
    Self {
      months: 0,
      duration,
    }
  }

  pub fn months(months: u32) -> Self {
    Self {
      months,
      duration: Duration::zero(),
    }
  }

  pub fn with_months(mut self, months: u32) -> Self {
    self.months = months;
    self
  }

  /// Apply the offset to a point in time.
  pub fn apply(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
    at.checked_add_months(Months::new(self.months))
      .and_then(|dt| dt.checked_add_signed(self.duration))
      .ok_or_else(|| eyre!("Expiration offset {:?} overflows from {}", self, at))
  }
}

/// When a cached value stops being trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
  /// A fixed point in time
  At(DateTime<Utc>),
  /// An offset resolved against the current time
  After(Offset),
}

impl Expiration {
  /// Resolve to an absolute timestamp, using `now` for relative offsets.
  pub fn resolve(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match self {
      Self::At(at) => Ok(*at),
      Self::After(offset) => offset.apply(now),
    }
  }
}

impl From<Duration> for Expiration {
  fn from(duration: Duration) -> Self {
    Self::After(Offset::new(duration))
  }
}

impl From<Offset> for Expiration {
  fn from(offset: Offset) -> Self {
    Self::After(offset)
  }
}

impl From<DateTime<Utc>> for Expiration {
  fn from(at: DateTime<Utc>) -> Self {
    Self::At(at)
  }
}

/// Pick the explicit expiration, else the default, and resolve it.
///
/// Returns `None` when neither is set.
pub fn resolve_or_default(
  explicit: Option<Expiration>,
  default: Option<Expiration>,
  now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
  explicit.or(default).map(|e| e.resolve(now)).transpose()
}

/// Configuration form of an offset: every unit is optional and they add up.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OffsetSetting {
  #[serde(default)]
  months: u32,
  #[serde(default)]
  days: i64,
  #[serde(default)]
  hours: i64,
  #[serde(default)]
  minutes: i64,
  #[serde(default)]
  seconds: i64,
}

impl OffsetSetting {
  fn into_offset(self) -> Option<Offset> {
    let duration = Duration::try_days(self.days)?
      .checked_add(&Duration::try_hours(self.hours)?)?
      .checked_add(&Duration::try_minutes(self.minutes)?)?
      .checked_add(&Duration::try_seconds(self.seconds)?)?;
    Some(Offset::new(duration).with_months(self.months))
  }
}

/// Deserialize an optional relative expiration such as `{ hours: 6 }`.
pub fn deserialize_expiration<'de, D>(deserializer: D) -> Result<Option<Expiration>, D::Error>
where
  D: Deserializer<'de>,
{
  let setting: Option<OffsetSetting> = Option::deserialize(deserializer)?;
  setting
    .map(|s| {
      s.into_offset()
        .map(Expiration::After)
        .ok_or_else(|| <D::Error as serde::de::Error>::custom("expiration offset out of range"))
    })
    .transpose()
}

/// True when `expiration` is set and strictly before `now`.
pub fn is_expired(expiration: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
  expiration.is_some_and(|at| at < now)
}
