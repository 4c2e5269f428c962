//! Identifier-mapped object cache and mutation journal over a persistent
//! backing store.
//!
//! A [`Backing`] maps (entity type, resource identifier) pairs to
//! process-local [`ObjectHandle`]s, caches their attributes and
//! relationships, and commits batches of changes to a [`PersistentMedium`]
//! atomically.

mod backing;
mod context;
mod error;
mod handle;
mod state;

pub mod config;
pub mod medium;
pub mod predicate;
pub mod schema;
pub mod value;

pub use backing::{Backing, BackingOptions, Fetched, DEFAULT_IDENTIFIER_KEY};
pub use error::{BackingError, Result};
pub use handle::ObjectHandle;
pub use medium::{MemoryMedium, PersistentMedium, SqliteMedium};
pub use predicate::{FetchRequest, Predicate, SortDescriptor};
pub use schema::{AttributeType, EntityDescriptor, RelationshipDescriptor, Schema, SchemaProvider};
pub use value::{AttributeValue, Attributes};
