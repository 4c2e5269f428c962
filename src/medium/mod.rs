//! Persistent media that back the object cache.
//!
//! A medium stores records keyed by (entity type, resource identifier) and
//! applies batches of mutations atomically. It knows nothing about handles:
//! relationship targets are stored as [`RecordRef`]s.

mod memory;
mod sqlite;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::value::Attributes;

pub use memory::MemoryMedium;
pub use sqlite::SqliteMedium;

/// Error reported by a medium.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed: {cause}")]
pub struct MediumError {
  /// The operation that failed
  pub operation: String,
  /// The underlying cause
  pub cause: String,
}

impl MediumError {
  pub fn new(operation: impl Into<String>, cause: impl ToString) -> Self {
    Self {
      operation: operation.into(),
      cause: cause.to_string(),
    }
  }
}

pub type MediumResult<T> = std::result::Result<T, MediumError>;

/// Stable reference to a record, independent of any cache session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordRef {
  pub entity: String,
  pub identifier: String,
}

impl RecordRef {
  pub fn new(entity: impl Into<String>, identifier: impl Into<String>) -> Self {
    Self {
      entity: entity.into(),
      identifier: identifier.into(),
    }
  }
}

/// A record as held by the medium.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredRecord {
  pub entity: String,
  pub identifier: String,
  pub attributes: Attributes,
  /// Relationship name to ordered targets
  pub relationships: BTreeMap<String, Vec<RecordRef>>,
}

impl StoredRecord {
  fn empty(entity: &str, identifier: &str) -> Self {
    Self {
      entity: entity.to_string(),
      identifier: identifier.to_string(),
      ..Default::default()
    }
  }
}

/// One entry of a commit batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
  /// Create a new record. Fails the batch if the record already exists.
  Insert {
    entity: String,
    identifier: String,
    attributes: Attributes,
  },
  /// Replace the attributes of a record, creating it if absent.
  Update {
    entity: String,
    identifier: String,
    attributes: Attributes,
  },
  /// Replace one relationship's targets, creating the record if absent.
  Relate {
    entity: String,
    identifier: String,
    relationship: String,
    targets: Vec<RecordRef>,
  },
  /// Remove a record and every edge that points at it.
  Delete { entity: String, identifier: String },
}

/// Trait for persistent media.
pub trait PersistentMedium: Send + Sync {
  /// Load a single record.
  fn load(&self, entity: &str, identifier: &str) -> MediumResult<Option<StoredRecord>>;

  /// Load every record of an entity type, ordered by identifier.
  fn scan(&self, entity: &str) -> MediumResult<Vec<StoredRecord>>;

  /// Whether a record exists.
  fn contains(&self, entity: &str, identifier: &str) -> MediumResult<bool> {
    Ok(self.load(entity, identifier)?.is_some())
  }

  /// Apply a batch in order. Either every mutation is applied or none is.
  fn apply(&self, batch: &[Mutation]) -> MediumResult<()>;
}
