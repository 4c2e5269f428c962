//! In-memory medium.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{MediumError, MediumResult, Mutation, PersistentMedium, RecordRef, StoredRecord};

type Records = BTreeMap<RecordRef, StoredRecord>;

/// Medium that keeps records in process memory.
/// Batches are applied to a copy which replaces the live map on success.
#[derive(Debug, Default)]
pub struct MemoryMedium {
  records: Mutex<Records>,
}

impl MemoryMedium {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Records> {
    match self.records.lock() {
      Ok(guard) => guard,
      Err(poisoned) => {
        tracing::warn!("memory medium mutex was poisoned, recovering");
        poisoned.into_inner()
      }
    }
  }

  /// Number of stored records.
  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }
}

fn apply_one(records: &mut Records, mutation: &Mutation) -> MediumResult<()> {
  match mutation {
    Mutation::Insert {
      entity,
      identifier,
      attributes,
    } => {
      let key = RecordRef::new(entity.as_str(), identifier.as_str());
      if records.contains_key(&key) {
        return Err(MediumError::new(
          "insert",
          format!("record {}/{} already exists", entity, identifier),
        ));
      }
      let mut record = StoredRecord::empty(entity, identifier);
      record.attributes = attributes.clone();
      records.insert(key, record);
    }
    Mutation::Update {
      entity,
      identifier,
      attributes,
    } => {
      let key = RecordRef::new(entity.as_str(), identifier.as_str());
      records
        .entry(key)
        .or_insert_with(|| StoredRecord::empty(entity, identifier))
        .attributes = attributes.clone();
    }
    Mutation::Relate {
      entity,
      identifier,
      relationship,
      targets,
    } => {
      let key = RecordRef::new(entity.as_str(), identifier.as_str());
      let record = records
        .entry(key)
        .or_insert_with(|| StoredRecord::empty(entity, identifier));
      if targets.is_empty() {
        record.relationships.remove(relationship);
      } else {
        record
          .relationships
          .insert(relationship.clone(), targets.clone());
      }
    }
    Mutation::Delete { entity, identifier } => {
      let key = RecordRef::new(entity.as_str(), identifier.as_str());
      records.remove(&key);
      for record in records.values_mut() {
        for targets in record.relationships.values_mut() {
          targets.retain(|t| *t != key);
        }
        record.relationships.retain(|_, targets| !targets.is_empty());
      }
    }
  }
  Ok(())
}

impl PersistentMedium for MemoryMedium {
  fn load(&self, entity: &str, identifier: &str) -> MediumResult<Option<StoredRecord>> {
    Ok(self.lock().get(&RecordRef::new(entity, identifier)).cloned())
  }

  fn scan(&self, entity: &str) -> MediumResult<Vec<StoredRecord>> {
    Ok(
      self
        .lock()
        .values()
        .filter(|r| r.entity == entity)
        .cloned()
        .collect(),
    )
  }

  fn apply(&self, batch: &[Mutation]) -> MediumResult<()> {
    let mut records = self.lock();
    let mut staged = records.clone();

    for mutation in batch {
      apply_one(&mut staged, mutation)?;
    }

    *records = staged;
    Ok(())
  }
}
