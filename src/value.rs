//! Values stored in cached-attribute slots.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Declared type of a cached value slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
  Integer,
  Float,
  #[default]
  Text,
  Boolean,
  /// Exact decimal, stored as canonical text
  Decimal,
  Date,
  DateTime,
  Time,
}

impl ValueKind {
  /// SQLite column type used when declaring a slot of this kind.
  pub fn sql_type(self) -> &'static str {
    match self {
      Self::Integer | Self::Boolean => "INTEGER",
      Self::Float => "REAL",
      Self::Text | Self::Decimal | Self::Date | Self::DateTime | Self::Time => "TEXT",
    }
  }
}

/// A single slot value.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
  #[default]
  Null,
  Integer(i64),
  Float(f64),
  Text(String),
  Boolean(bool),
  Decimal(Decimal),
  Date(NaiveDate),
  DateTime(DateTime<Utc>),
  Time(NaiveTime),
}

impl Value {
  pub fn is_null(&self) -> bool {
    matches!(self, Self::Null)
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Self::Boolean(b) => Some(*b),
      Self::Integer(i) => Some(*i != 0),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Self::Integer(i) => Some(*i),
      _ => None,
    }
  }

  pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
    match self {
      Self::DateTime(dt) => Some(*dt),
      _ => None,
    }
  }

  /// Decode a raw SQLite value as the given kind.
  ///
  /// NULL always decodes to [`Value::Null`], whatever the kind. REAL
  /// columns are not accepted as decimals.
  pub fn from_sql(kind: ValueKind, raw: ValueRef<'_>) -> Result<Self> {
    if let ValueRef::Null = raw {
      return Ok(Self::Null);
    }

    let value = match (kind, raw) {
      (ValueKind::Integer, ValueRef::Integer(i)) => Self::Integer(i),
      (ValueKind::Boolean, ValueRef::Integer(i)) => Self::Boolean(i != 0),
      (ValueKind::Float, ValueRef::Real(f)) => Self::Float(f),
      (ValueKind::Float, ValueRef::Integer(i)) => Self::Float(i as f64),
      (ValueKind::Decimal, ValueRef::Integer(i)) => Self::Decimal(Decimal::from(i)),
      (kind, ValueRef::Text(bytes)) => {
        let text = std::str::from_utf8(bytes).map_err(|e| eyre!("Invalid UTF-8 in slot: {}", e))?;
        Self::parse_text(kind, text)?
      }
      (kind, other) => {
        return Err(eyre!(
          "Cannot decode {:?} column as {:?}",
          other.data_type(),
          kind
        ))
      }
    };

    Ok(value)
  }

  fn parse_text(kind: ValueKind, text: &str) -> Result<Self> {
    let value = match kind {
      ValueKind::Text => Self::Text(text.to_string()),
      ValueKind::Decimal => Self::Decimal(
        Decimal::from_str(text).map_err(|e| eyre!("Failed to parse decimal '{}': {}", text, e))?,
      ),
      ValueKind::Date => Self::Date(
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
          .map_err(|e| eyre!("Failed to parse date '{}': {}", text, e))?,
      ),
      ValueKind::DateTime => Self::DateTime(
        DateTime::parse_from_rfc3339(text)
          .map(|dt| dt.with_timezone(&Utc))
          .map_err(|e| eyre!("Failed to parse datetime '{}': {}", text, e))?,
      ),
      ValueKind::Time => Self::Time(
        NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
          .map_err(|e| eyre!("Failed to parse time '{}': {}", text, e))?,
      ),
      ValueKind::Integer => Self::Integer(
        text
          .parse()
          .map_err(|e| eyre!("Failed to parse integer '{}': {}", text, e))?,
      ),
      ValueKind::Float => Self::Float(
        text
          .parse()
          .map_err(|e| eyre!("Failed to parse float '{}': {}", text, e))?,
      ),
      ValueKind::Boolean => Self::Boolean(match text {
        "1" | "true" | "TRUE" => true,
        "0" | "false" | "FALSE" => false,
        _ => return Err(eyre!("Failed to parse boolean '{}'", text)),
      }),
    };
    Ok(value)
  }
}

impl ToSql for Value {
  fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
    let out = match self {
      Self::Null => ToSqlOutput::from(rusqlite::types::Null),
      Self::Integer(i) => ToSqlOutput::from(*i),
      Self::Float(f) => ToSqlOutput::from(*f),
      Self::Boolean(b) => ToSqlOutput::from(i64::from(*b)),
      Self::Text(s) => ToSqlOutput::from(s.as_str()),
      Self::Decimal(d) => ToSqlOutput::from(d.to_string()),
      Self::Date(d) => ToSqlOutput::from(d.format("%Y-%m-%d").to_string()),
      Self::DateTime(dt) => ToSqlOutput::from(dt.to_rfc3339_opts(SecondsFormat::Nanos, true)),
      Self::Time(t) => ToSqlOutput::from(t.format("%H:%M:%S%.f").to_string()),
    };
    Ok(out)
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Null => write!(f, "null"),
      Self::Integer(i) => write!(f, "{}", i),
      Self::Float(v) => write!(f, "{}", v),
      Self::Text(s) => write!(f, "{}", s),
      Self::Decimal(d) => write!(f, "{}", d),
      Self::Boolean(b) => write!(f, "{}", b),
      Self::Date(d) => write!(f, "{}", d),
      Self::DateTime(dt) => write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
      Self::Time(t) => write!(f, "{}", t),
    }
  }
}

impl From<i64> for Value {
  fn from(v: i64) -> Self {
    Self::Integer(v)
  }
}

impl From<f64> for Value {
  fn from(v: f64) -> Self {
    Self::Float(v)
  }
}

impl From<bool> for Value {
  fn from(v: bool) -> Self {
    Self::Boolean(v)
  }
}

impl From<String> for Value {
  fn from(v: String) -> Self {
    Self::Text(v)
  }
}

impl From<&str> for Value {
  fn from(v: &str) -> Self {
    Self::Text(v.to_string())
  }
}

impl From<Decimal> for Value {
  fn from(v: Decimal) -> Self {
    Self::Decimal(v)
  }
}

impl From<DateTime<Utc>> for Value {
  fn from(v: DateTime<Utc>) -> Self {
    Self::DateTime(v)
  }
}

impl<T: Into<Value>> From<Option<T>> for Value {
  fn from(v: Option<T>) -> Self {
    v.map(Into::into).unwrap_or(Self::Null)
  }
}
