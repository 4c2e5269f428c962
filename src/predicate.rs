//! Fetch requests and record predicates.

use std::cmp::Ordering;

use crate::value::{AttributeValue, Attributes};

/// A filter over one record.
///
/// Keys name attributes. The backing's resource identifier key names the
/// record's identifier instead. Missing attributes read as `Null`, and
/// ordering comparisons never match a `Null` operand.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Predicate {
  #[default]
  All,
  Eq(String, AttributeValue),
  Ne(String, AttributeValue),
  Lt(String, AttributeValue),
  Le(String, AttributeValue),
  Gt(String, AttributeValue),
  Ge(String, AttributeValue),
  In(String, Vec<AttributeValue>),
  IsNull(String),
  /// Substring match on string attributes
  Contains(String, String),
  And(Vec<Predicate>),
  Or(Vec<Predicate>),
  Not(Box<Predicate>),
}

/// The fields a predicate or sort descriptor can see.
pub(crate) struct RecordView<'a> {
  pub identifier_key: &'a str,
  pub identifier: &'a str,
  pub attributes: &'a Attributes,
}

impl RecordView<'_> {
  fn value(&self, key: &str) -> AttributeValue {
    if key == self.identifier_key {
      return AttributeValue::String(self.identifier.to_string());
    }
    self
      .attributes
      .get(key)
      .cloned()
      .unwrap_or(AttributeValue::Null)
  }
}

fn ordered(lhs: &AttributeValue, rhs: &AttributeValue, accept: impl Fn(Ordering) -> bool) -> bool {
  if lhs.is_null() || rhs.is_null() {
    return false;
  }
  lhs.compare(rhs).is_some_and(accept)
}

fn equal(lhs: &AttributeValue, rhs: &AttributeValue) -> bool {
  lhs.compare(rhs) == Some(Ordering::Equal)
}

impl Predicate {
  pub fn equals(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
    Self::Eq(key.into(), value.into())
  }

  pub fn and(predicates: impl IntoIterator<Item = Predicate>) -> Self {
    Self::And(predicates.into_iter().collect())
  }

  pub fn or(predicates: impl IntoIterator<Item = Predicate>) -> Self {
    Self::Or(predicates.into_iter().collect())
  }

  pub fn negate(predicate: Predicate) -> Self {
    Self::Not(Box::new(predicate))
  }

  pub(crate) fn matches(&self, record: &RecordView<'_>) -> bool {
    match self {
      Self::All => true,
      Self::Eq(key, value) => equal(&record.value(key), value),
      Self::Ne(key, value) => !equal(&record.value(key), value),
      Self::Lt(key, value) => ordered(&record.value(key), value, |o| o == Ordering::Less),
      Self::Le(key, value) => ordered(&record.value(key), value, |o| o != Ordering::Greater),
      Self::Gt(key, value) => ordered(&record.value(key), value, |o| o == Ordering::Greater),
      Self::Ge(key, value) => ordered(&record.value(key), value, |o| o != Ordering::Less),
      Self::In(key, values) => {
        let actual = record.value(key);
        values.iter().any(|v| equal(&actual, v))
      }
      Self::IsNull(key) => record.value(key).is_null(),
      Self::Contains(key, needle) => match record.value(key) {
        AttributeValue::String(s) => s.contains(needle.as_str()),
        _ => false,
      },
      Self::And(predicates) => predicates.iter().all(|p| p.matches(record)),
      Self::Or(predicates) => predicates.iter().any(|p| p.matches(record)),
      Self::Not(predicate) => !predicate.matches(record),
    }
  }
}

/// Sort key for fetch results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
  pub key: String,
  pub ascending: bool,
}

impl SortDescriptor {
  pub fn ascending(key: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      ascending: true,
    }
  }

  pub fn descending(key: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      ascending: false,
    }
  }
}

/// Compare two records by a list of sort descriptors.
/// Ties fall back to the identifier.
pub(crate) fn compare_records(
  sort: &[SortDescriptor],
  a: &RecordView<'_>,
  b: &RecordView<'_>,
) -> Ordering {
  for descriptor in sort {
    let ordering = a
      .value(&descriptor.key)
      .sort_cmp(&b.value(&descriptor.key));
    let ordering = if descriptor.ascending {
      ordering
    } else {
      ordering.reverse()
    };
    if ordering != Ordering::Equal {
      return ordering;
    }
  }
  a.identifier.cmp(b.identifier)
}

/// What to fetch: one entity type, filtered, sorted and windowed.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
  pub entity: String,
  pub predicate: Predicate,
  pub sort: Vec<SortDescriptor>,
  pub offset: usize,
  pub limit: Option<usize>,
}

impl FetchRequest {
  pub fn new(entity: impl Into<String>) -> Self {
    Self {
      entity: entity.into(),
      predicate: Predicate::All,
      sort: Vec::new(),
      offset: 0,
      limit: None,
    }
  }

  pub fn with_predicate(mut self, predicate: Predicate) -> Self {
    self.predicate = predicate;
    self
  }

  pub fn sorted_by(mut self, descriptor: SortDescriptor) -> Self {
    self.sort.push(descriptor);
    self
  }

  pub fn with_offset(mut self, offset: usize) -> Self {
    self.offset = offset;
    self
  }

  pub fn with_limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }
}
