//! Error types for the object cache.

use crate::handle::ObjectHandle;
use crate::medium::MediumError;

/// Errors returned by [`crate::Backing`].
///
/// Everything except [`BackingError::CommitFailed`] is reported before any
/// cache state is touched, so the caller can correct the request and retry.
#[derive(Debug, thiserror::Error)]
pub enum BackingError {
  /// No entity descriptor is registered under this name.
  #[error("unknown entity type '{0}'")]
  UnknownEntityType(String),

  /// The identifier is already mapped for the entity type.
  #[error("{entity} '{identifier}' already exists")]
  DuplicateIdentifier { entity: String, identifier: String },

  /// The handle was deleted, rolled back, or never issued by this cache.
  #[error("object handle {0} is no longer valid")]
  HandleInvalidated(ObjectHandle),

  /// The attribute is not declared on the entity.
  #[error("{entity} has no attribute '{attribute}'")]
  UnknownAttribute { entity: String, attribute: String },

  /// The value does not match the declared attribute type.
  #[error("{entity}.{attribute} expects {expected}")]
  AttributeTypeMismatch {
    entity: String,
    attribute: String,
    expected: String,
  },

  /// The relationship is not declared on the entity.
  #[error("{entity} has no relationship '{relationship}'")]
  UnknownRelationship { entity: String, relationship: String },

  /// A relationship target has the wrong entity type, or a to-one
  /// relationship was given several targets.
  #[error("invalid target for {entity}.{relationship}: {reason}")]
  InvalidRelationshipTarget {
    entity: String,
    relationship: String,
    reason: String,
  },

  /// The medium rejected the batch. Pending changes were discarded.
  #[error("commit failed: {0}")]
  CommitFailed(#[source] MediumError),

  /// The medium failed while loading data for a read.
  #[error(transparent)]
  Medium(#[from] MediumError),

  /// A fetch instantiator failed.
  #[error("instantiation failed: {0}")]
  Instantiation(String),

  /// The confined context has shut down.
  #[error("backing context is closed")]
  ContextClosed,

  /// The confined context thread could not be started.
  #[error("failed to start backing context: {0}")]
  ContextSpawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BackingError>;
