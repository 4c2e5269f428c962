//! Attribute values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::schema::AttributeType;

/// Attribute name to value mapping for one record.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// A single attribute value.
///
/// Serialized with an explicit type tag so dates and binary blobs survive a
/// round-trip through the medium unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum AttributeValue {
  Null,
  Bool(bool),
  Integer(i64),
  Double(f64),
  String(String),
  Date(DateTime<Utc>),
  Binary(Vec<u8>),
}

impl AttributeValue {
  /// Coerce a plain JSON value into an attribute of the given type.
  ///
  /// Dates are read from RFC 3339 strings, binary from arrays of bytes.
  /// Integers widen to doubles; nothing else is converted.
  pub fn from_json(value: &Value, ty: AttributeType) -> Option<Self> {
    if value.is_null() {
      return Some(Self::Null);
    }

    match ty {
      AttributeType::String => value.as_str().map(|s| Self::String(s.to_string())),
      AttributeType::Integer => value.as_i64().map(Self::Integer),
      AttributeType::Double => value.as_f64().map(Self::Double),
      AttributeType::Boolean => value.as_bool().map(Self::Bool),
      AttributeType::Date => value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| Self::Date(dt.with_timezone(&Utc))),
      AttributeType::Binary => value
        .as_array()?
        .iter()
        .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
        .collect::<Option<Vec<u8>>>()
        .map(Self::Binary),
    }
  }

  /// Plain JSON rendering, for display.
  pub fn to_json(&self) -> Value {
    match self {
      Self::Null => Value::Null,
      Self::Bool(b) => Value::Bool(*b),
      Self::Integer(i) => Value::from(*i),
      Self::Double(d) => Value::from(*d),
      Self::String(s) => Value::String(s.clone()),
      Self::Date(dt) => Value::String(dt.to_rfc3339()),
      Self::Binary(bytes) => Value::from(bytes.clone()),
    }
  }

  pub fn is_null(&self) -> bool {
    matches!(self, Self::Null)
  }

  /// Order two values of compatible kinds. Integers and doubles compare
  /// numerically; `Null` sorts before everything else. Values of unrelated
  /// kinds are unordered.
  pub fn compare(&self, other: &Self) -> Option<Ordering> {
    match (self, other) {
      (Self::Null, Self::Null) => Some(Ordering::Equal),
      (Self::Null, _) => Some(Ordering::Less),
      (_, Self::Null) => Some(Ordering::Greater),
      (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
      (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
      (Self::Double(a), Self::Double(b)) => a.partial_cmp(b),
      (Self::Integer(a), Self::Double(b)) => (*a as f64).partial_cmp(b),
      (Self::Double(a), Self::Integer(b)) => a.partial_cmp(&(*b as f64)),
      (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
      (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
      (Self::Binary(a), Self::Binary(b)) => Some(a.cmp(b)),
      _ => None,
    }
  }

  /// Total order for sorting. Numbers compare with [`f64::total_cmp`] and
  /// values of unrelated kinds order by kind.
  pub fn sort_cmp(&self, other: &Self) -> Ordering {
    match (self, other) {
      (Self::Double(a), Self::Double(b)) => a.total_cmp(b),
      (Self::Integer(a), Self::Double(b)) => (*a as f64).total_cmp(b),
      (Self::Double(a), Self::Integer(b)) => a.total_cmp(&(*b as f64)),
      _ => self
        .compare(other)
        .unwrap_or_else(|| self.rank().cmp(&other.rank())),
    }
  }

  fn rank(&self) -> u8 {
    match self {
      Self::Null => 0,
      Self::Bool(_) => 1,
      Self::Integer(_) | Self::Double(_) => 2,
      Self::String(_) => 3,
      Self::Date(_) => 4,
      Self::Binary(_) => 5,
    }
  }
}

impl From<&str> for AttributeValue {
  fn from(s: &str) -> Self {
    Self::String(s.to_string())
  }
}

impl From<String> for AttributeValue {
  fn from(s: String) -> Self {
    Self::String(s)
  }
}

impl From<i64> for AttributeValue {
  fn from(i: i64) -> Self {
    Self::Integer(i)
  }
}

impl From<f64> for AttributeValue {
  fn from(d: f64) -> Self {
    Self::Double(d)
  }
}

impl From<bool> for AttributeValue {
  fn from(b: bool) -> Self {
    Self::Bool(b)
  }
}

impl From<DateTime<Utc>> for AttributeValue {
  fn from(dt: DateTime<Utc>) -> Self {
    Self::Date(dt)
  }
}

/// Build an [`Attributes`] map from `(name, value)` pairs.
pub fn attributes<K, V, I>(pairs: I) -> Attributes
where
  K: Into<String>,
  V: Into<AttributeValue>,
  I: IntoIterator<Item = (K, V)>,
{
  pairs
    .into_iter()
    .map(|(k, v)| (k.into(), v.into()))
    .collect()
}
