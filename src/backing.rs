//! The identifier-mapped object cache.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::context::Context;
use crate::error::{BackingError, Result};
use crate::handle::ObjectHandle;
use crate::medium::{Mutation, PersistentMedium, RecordRef, StoredRecord};
use crate::predicate::{compare_records, FetchRequest, RecordView};
use crate::schema::{EntityDescriptor, SchemaProvider};
use crate::state::{Resident, Slot, State};
use crate::value::Attributes;

/// Attribute name that addresses the resource identifier in predicates.
pub const DEFAULT_IDENTIFIER_KEY: &str = "__resourceIdentifier";

/// Construction options for [`Backing`].
#[derive(Debug, Clone)]
pub struct BackingOptions {
  /// Key under which predicates and sort descriptors see the identifier
  pub identifier_key: String,
  /// Name of the context thread
  pub context_name: String,
}

impl Default for BackingOptions {
  fn default() -> Self {
    Self {
      identifier_key: DEFAULT_IDENTIFIER_KEY.to_string(),
      context_name: "backstore-context".to_string(),
    }
  }
}

/// Object cache sitting between callers and a persistent medium.
///
/// Records are addressed by (entity type, resource identifier) and handed
/// out as [`ObjectHandle`]s. Changes accumulate in a pending batch until
/// [`Backing::commit`] flushes them to the medium in one transaction.
///
/// Every mutation runs on a single confined context thread and the caller
/// blocks until it is applied. Reads of resident data are answered from
/// shared state directly; faults are loaded on the context.
///
/// None of the methods may be called from inside an async runtime worker.
#[derive(Clone)]
pub struct Backing {
  inner: Arc<Inner>,
}

struct Inner {
  schema: Arc<dyn SchemaProvider>,
  medium: Arc<dyn PersistentMedium>,
  identifier_key: String,
  state: RwLock<State>,
  context: Context,
}

impl Backing {
  /// Create a backing with default options.
  pub fn new(schema: Arc<dyn SchemaProvider>, medium: Arc<dyn PersistentMedium>) -> Result<Self> {
    Self::with_options(schema, medium, BackingOptions::default())
  }

  pub fn with_options(
    schema: Arc<dyn SchemaProvider>,
    medium: Arc<dyn PersistentMedium>,
    options: BackingOptions,
  ) -> Result<Self> {
    let context = Context::spawn(&options.context_name)?;

    Ok(Self {
      inner: Arc::new(Inner {
        schema,
        medium,
        identifier_key: options.identifier_key,
        state: RwLock::new(State::default()),
        context,
      }),
    })
  }

  /// Names of every entity the schema knows.
  pub fn entity_names(&self) -> Vec<String> {
    self.inner.schema.entity_names()
  }

  pub fn identifier_key(&self) -> &str {
    &self.inner.identifier_key
  }

  /// Look up an entity descriptor.
  pub fn entity(&self, name: &str) -> Result<Arc<EntityDescriptor>> {
    self.inner.descriptor(name)
  }

  /// Run `f` on the confined context and wait for it.
  ///
  /// Operations `f` performs on the backing it receives run inline, so the
  /// whole closure is applied without interleaving with other callers.
  pub fn perform_and_wait<R, F>(&self, f: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce(&Backing) -> R + Send + 'static,
  {
    let backing = self.clone();
    self.inner.context.perform_and_wait(move || f(&backing))
  }

  fn on_context<R, F>(&self, f: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce(&Inner) -> Result<R> + Send + 'static,
  {
    let inner = Arc::clone(&self.inner);
    self.inner.context.perform_and_wait(move || f(&inner))?
  }

  /// Map an identifier to its handle, creating a fault on first use.
  pub fn resolve(&self, entity: &str, identifier: &str) -> Result<ObjectHandle> {
    {
      let state = self.inner.read();
      if let Some(handle) = state.handle_for(&RecordRef::new(entity, identifier)) {
        return Ok(handle);
      }
    }

    let key = RecordRef::new(entity, identifier);
    self.on_context(move |inner| inner.resolve(key))
  }

  /// Resolve an identifier and load its record into the cache.
  pub fn prefetch(&self, entity: &str, identifier: &str) -> Result<ObjectHandle> {
    let handle = self.resolve(entity, identifier)?;
    self.on_context(move |inner| inner.fault_in(handle))?;
    Ok(handle)
  }

  /// Read from a resident record, loading it first if it is a fault.
  fn with_resident<R>(&self, handle: ObjectHandle, read: impl Fn(&Resident) -> R) -> Result<R> {
    loop {
      {
        let state = self.inner.read();
        let slot = state
          .lookup(handle)
          .ok_or(BackingError::HandleInvalidated(handle))?;
        if let Some(record) = &slot.record {
          return Ok(read(record));
        }
      }

      self.on_context(move |inner| inner.fault_in(handle))?;
    }
  }

  pub fn attributes_of(&self, handle: ObjectHandle) -> Result<Attributes> {
    self.with_resident(handle, |record| record.attributes.clone())
  }

  /// Whether the record exists in the medium or was created by the
  /// pending batch. A resolved identifier need not exist.
  pub fn exists(&self, handle: ObjectHandle) -> Result<bool> {
    self.with_resident(handle, |record| record.exists)
  }

  pub fn identifier_of(&self, handle: ObjectHandle) -> Result<String> {
    let state = self.inner.read();
    state
      .lookup(handle)
      .map(|slot| slot.identifier.clone())
      .ok_or(BackingError::HandleInvalidated(handle))
  }

  pub fn entity_of(&self, handle: ObjectHandle) -> Result<String> {
    let state = self.inner.read();
    state
      .lookup(handle)
      .map(|slot| slot.entity.clone())
      .ok_or(BackingError::HandleInvalidated(handle))
  }

  /// Targets of a relationship, in edge order.
  pub fn relationship_targets(
    &self,
    handle: ObjectHandle,
    relationship: &str,
  ) -> Result<Vec<ObjectHandle>> {
    let entity = self.entity_of(handle)?;
    let descriptor = self.inner.descriptor(&entity)?;
    if descriptor.relationship(relationship).is_none() {
      return Err(BackingError::UnknownRelationship {
        entity,
        relationship: relationship.to_string(),
      });
    }

    self.with_resident(handle, |record| {
      record
        .relationships
        .get(relationship)
        .cloned()
        .unwrap_or_default()
    })
  }

  /// Create a new record. Fails if the identifier is already mapped.
  ///
  /// An identifier counts as mapped once anything in this session has
  /// resolved it, including a fault created for an edge target, even if
  /// the medium holds no record for it. Use [`Backing::update`] on the
  /// resolved handle to create such a record instead.
  pub fn insert(&self, entity: &str, identifier: &str) -> Result<ObjectHandle> {
    let key = RecordRef::new(entity, identifier);
    self.on_context(move |inner| inner.insert(key))
  }

  /// Merge attributes into a record.
  pub fn update(&self, handle: ObjectHandle, attributes: Attributes) -> Result<()> {
    self.on_context(move |inner| inner.update(handle, attributes))
  }

  /// Replace the targets of one relationship.
  pub fn update_relationship(
    &self,
    handle: ObjectHandle,
    relationship: &str,
    targets: Vec<ObjectHandle>,
  ) -> Result<()> {
    let relationship = relationship.to_string();
    self.on_context(move |inner| inner.update_relationship(handle, &relationship, targets))
  }

  /// Delete a record and invalidate its handle.
  pub fn delete(&self, handle: ObjectHandle) -> Result<()> {
    self.on_context(move |inner| inner.delete(handle))
  }

  /// Flush the pending batch to the medium, all or nothing.
  pub fn commit(&self) -> Result<()> {
    self.on_context(|inner| inner.commit())
  }

  /// Discard the pending batch.
  pub fn rollback(&self) -> Result<()> {
    self.on_context(|inner| {
      let mut state = inner.write();
      if state.has_changes() {
        tracing::warn!(mutations = state.pending_len(), "discarding pending changes");
      }
      state.rollback();
      Ok(())
    })
  }

  pub fn has_changes(&self) -> bool {
    self.inner.read().has_changes()
  }

  pub fn pending_len(&self) -> usize {
    self.inner.read().pending_len()
  }

  /// Run a fetch request.
  ///
  /// Matching records are collected on the context; the returned iterator
  /// then builds each result on demand with `instantiate`.
  pub fn fetch<T, F>(&self, request: &FetchRequest, instantiate: F) -> Result<Fetched<T, F>>
  where
    F: FnMut(ObjectHandle) -> Result<T>,
  {
    let request = request.clone();
    let handles = self.on_context(move |inner| inner.fetch_handles(&request))?;

    Ok(Fetched {
      handles: handles.into_iter(),
      instantiate,
      _marker: PhantomData,
    })
  }
}

/// Lazy fetch results.
pub struct Fetched<T, F> {
  handles: std::vec::IntoIter<ObjectHandle>,
  instantiate: F,
  _marker: PhantomData<fn() -> T>,
}

impl<T, F> Iterator for Fetched<T, F>
where
  F: FnMut(ObjectHandle) -> Result<T>,
{
  type Item = Result<T>;

  fn next(&mut self) -> Option<Self::Item> {
    self.handles.next().map(&mut self.instantiate)
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    self.handles.size_hint()
  }
}

impl<T, F> ExactSizeIterator for Fetched<T, F> where F: FnMut(ObjectHandle) -> Result<T> {}

fn view_of<'a>(identifier_key: &'a str, slot: &'a Slot) -> Option<RecordView<'a>> {
  slot.record.as_ref().map(|record| RecordView {
    identifier_key,
    identifier: &slot.identifier,
    attributes: &record.attributes,
  })
}

impl Inner {
  fn read(&self) -> RwLockReadGuard<'_, State> {
    match self.state.read() {
      Ok(guard) => guard,
      Err(poisoned) => {
        tracing::warn!("backing state lock was poisoned, recovering");
        poisoned.into_inner()
      }
    }
  }

  fn write(&self) -> RwLockWriteGuard<'_, State> {
    match self.state.write() {
      Ok(guard) => guard,
      Err(poisoned) => {
        tracing::warn!("backing state lock was poisoned, recovering");
        poisoned.into_inner()
      }
    }
  }

  fn descriptor(&self, entity: &str) -> Result<Arc<EntityDescriptor>> {
    self
      .schema
      .entity(entity)
      .ok_or_else(|| BackingError::UnknownEntityType(entity.to_string()))
  }

  /// Entity, identifier and descriptor of a live handle.
  fn describe(&self, handle: ObjectHandle) -> Result<(RecordRef, Arc<EntityDescriptor>)> {
    let key = {
      let state = self.read();
      state
        .lookup(handle)
        .map(Slot::key)
        .ok_or(BackingError::HandleInvalidated(handle))?
    };
    let descriptor = self.descriptor(&key.entity)?;
    Ok((key, descriptor))
  }

  fn resolve(&self, key: RecordRef) -> Result<ObjectHandle> {
    self.descriptor(&key.entity)?;

    let mut state = self.write();
    if let Some(handle) = state.handle_for(&key) {
      return Ok(handle);
    }

    tracing::debug!(entity = %key.entity, identifier = %key.identifier, "resolved new identifier");
    Ok(state.allocate(key, None, false))
  }

  /// Turn a stored record into resident contents, resolving edge targets.
  /// Targets deleted by the pending batch or of unknown type are dropped.
  fn materialize(
    &self,
    state: &mut State,
    descriptor: &EntityDescriptor,
    stored: Option<StoredRecord>,
  ) -> Resident {
    let Some(stored) = stored else {
      return Resident::default();
    };

    let mut resident = Resident {
      attributes: stored.attributes,
      exists: true,
      ..Default::default()
    };

    for (name, targets) in stored.relationships {
      if descriptor.relationship(&name).is_none() {
        continue;
      }

      let mut handles = Vec::with_capacity(targets.len());
      for target in targets {
        if state.is_tombstoned(&target) || self.schema.entity(&target.entity).is_none() {
          continue;
        }
        let handle = match state.handle_for(&target) {
          Some(handle) => handle,
          None => state.allocate(target, None, false),
        };
        handles.push(handle);
      }

      if !handles.is_empty() {
        resident.relationships.insert(name, handles);
      }
    }

    resident
  }

  /// Load a faulted record from the medium.
  fn fault_in(&self, handle: ObjectHandle) -> Result<()> {
    let (key, descriptor) = self.describe(handle)?;

    let tombstoned = {
      let state = self.read();
      let slot = state
        .lookup(handle)
        .ok_or(BackingError::HandleInvalidated(handle))?;
      if slot.record.is_some() {
        return Ok(());
      }
      state.is_tombstoned(&key)
    };

    let stored = if tombstoned {
      None
    } else {
      self.medium.load(&key.entity, &key.identifier)?
    };
    tracing::debug!(
      entity = %key.entity,
      identifier = %key.identifier,
      found = stored.is_some(),
      "faulted record"
    );

    let mut state = self.write();
    let resident = self.materialize(&mut state, &descriptor, stored);
    if let Some(slot) = state.lookup_mut(handle) {
      slot.record = Some(resident);
    }
    Ok(())
  }

  fn insert(&self, key: RecordRef) -> Result<ObjectHandle> {
    self.descriptor(&key.entity)?;

    let duplicate = || BackingError::DuplicateIdentifier {
      entity: key.entity.clone(),
      identifier: key.identifier.clone(),
    };

    let tombstoned = {
      let state = self.read();
      if state.handle_for(&key).is_some() {
        return Err(duplicate());
      }
      state.is_tombstoned(&key)
    };

    if !tombstoned && self.medium.contains(&key.entity, &key.identifier)? {
      return Err(duplicate());
    }

    let mutation = Mutation::Insert {
      entity: key.entity.clone(),
      identifier: key.identifier.clone(),
      attributes: Attributes::new(),
    };

    let mut state = self.write();
    let handle = state.allocate(
      key,
      Some(Resident {
        exists: true,
        ..Default::default()
      }),
      true,
    );
    state.record(mutation);
    Ok(handle)
  }

  fn update(&self, handle: ObjectHandle, attributes: Attributes) -> Result<()> {
    let (key, descriptor) = self.describe(handle)?;

    for (name, value) in &attributes {
      let ty = descriptor
        .attribute(name)
        .ok_or_else(|| BackingError::UnknownAttribute {
          entity: key.entity.clone(),
          attribute: name.clone(),
        })?;
      if !ty.accepts(value) {
        return Err(BackingError::AttributeTypeMismatch {
          entity: key.entity.clone(),
          attribute: name.clone(),
          expected: format!("{:?}", ty).to_lowercase(),
        });
      }
    }

    self.fault_in(handle)?;

    let mut state = self.write();
    state.backup(handle);
    let merged = {
      let slot = state
        .lookup_mut(handle)
        .ok_or(BackingError::HandleInvalidated(handle))?;
      let record = slot.record.get_or_insert_with(Resident::default);
      record.attributes.extend(attributes);
      record.exists = true;
      record.attributes.clone()
    };

    state.record(Mutation::Update {
      entity: key.entity,
      identifier: key.identifier,
      attributes: merged,
    });
    Ok(())
  }

  fn update_relationship(
    &self,
    handle: ObjectHandle,
    relationship: &str,
    targets: Vec<ObjectHandle>,
  ) -> Result<()> {
    let (key, descriptor) = self.describe(handle)?;
    let declared =
      descriptor
        .relationship(relationship)
        .ok_or_else(|| BackingError::UnknownRelationship {
          entity: key.entity.clone(),
          relationship: relationship.to_string(),
        })?;

    let invalid = |reason: String| BackingError::InvalidRelationshipTarget {
      entity: key.entity.clone(),
      relationship: relationship.to_string(),
      reason,
    };

    let mut seen = HashSet::new();
    let targets: Vec<ObjectHandle> = targets.into_iter().filter(|t| seen.insert(*t)).collect();

    if !declared.to_many && targets.len() > 1 {
      return Err(invalid(format!("to-one relationship given {} targets", targets.len())));
    }

    let target_refs = {
      let state = self.read();
      targets
        .iter()
        .map(|target| {
          let slot = state
            .lookup(*target)
            .ok_or(BackingError::HandleInvalidated(*target))?;
          if slot.entity != declared.destination {
            return Err(invalid(format!(
              "{} is a {}, expected {}",
              slot.identifier, slot.entity, declared.destination
            )));
          }
          Ok(slot.key())
        })
        .collect::<Result<Vec<_>>>()?
    };

    self.fault_in(handle)?;

    let mut state = self.write();
    state.backup(handle);
    {
      let slot = state
        .lookup_mut(handle)
        .ok_or(BackingError::HandleInvalidated(handle))?;
      let record = slot.record.get_or_insert_with(Resident::default);
      if targets.is_empty() {
        record.relationships.remove(relationship);
      } else {
        record
          .relationships
          .insert(relationship.to_string(), targets);
      }
      record.exists = true;
    }

    state.record(Mutation::Relate {
      entity: key.entity,
      identifier: key.identifier,
      relationship: relationship.to_string(),
      targets: target_refs,
    });
    Ok(())
  }

  fn delete(&self, handle: ObjectHandle) -> Result<()> {
    let (key, _) = self.describe(handle)?;

    let mut state = self.write();
    for (source, relationship) in state.strip_target(handle) {
      let Some(source_key) = state.lookup(source).map(Slot::key) else {
        continue;
      };
      let targets = state.edge_refs(source, &relationship);
      state.record(Mutation::Relate {
        entity: source_key.entity,
        identifier: source_key.identifier,
        relationship,
        targets,
      });
    }

    state.release(handle);
    state.record(Mutation::Delete {
      entity: key.entity,
      identifier: key.identifier,
    });
    Ok(())
  }

  fn commit(&self) -> Result<()> {
    let mut state = self.write();
    if !state.has_changes() {
      return Ok(());
    }

    let mutations = state.pending_len();
    match self.medium.apply(state.journal()) {
      Ok(()) => {
        state.committed();
        tracing::info!(mutations, "committed pending changes");
        Ok(())
      }
      Err(e) => {
        tracing::warn!(mutations, error = %e, "commit failed, rolling back");
        state.rollback();
        Err(BackingError::CommitFailed(e))
      }
    }
  }

  fn fetch_handles(&self, request: &FetchRequest) -> Result<Vec<ObjectHandle>> {
    let descriptor = self.descriptor(&request.entity)?;
    let rows = self.medium.scan(&request.entity)?;

    let mut state = self.write();
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for row in rows {
      let key = RecordRef::new(row.entity.as_str(), row.identifier.as_str());
      if state.is_tombstoned(&key) {
        continue;
      }

      let handle = match state.handle_for(&key) {
        Some(handle) => handle,
        None => state.allocate(key, None, false),
      };
      let faulted = state.lookup(handle).is_some_and(|s| s.record.is_none());
      if faulted {
        let resident = self.materialize(&mut state, &descriptor, Some(row));
        if let Some(slot) = state.lookup_mut(handle) {
          slot.record = Some(resident);
        }
      }

      if seen.insert(handle) {
        candidates.push(handle);
      }
    }

    // Records created by the pending batch are not in the medium yet
    for handle in state.live_handles() {
      let pending = state.lookup(handle).is_some_and(|slot| {
        slot.entity == request.entity && slot.record.as_ref().is_some_and(|r| r.exists)
      });
      if pending && seen.insert(handle) {
        candidates.push(handle);
      }
    }

    let state = &*state;
    let key = self.identifier_key.as_str();
    let mut matched: Vec<(ObjectHandle, RecordView<'_>)> = candidates
      .into_iter()
      .filter_map(|handle| {
        let view = view_of(key, state.lookup(handle)?)?;
        Some((handle, view))
      })
      .filter(|(_, view)| request.predicate.matches(view))
      .collect();

    matched.sort_by(|(_, a), (_, b)| compare_records(&request.sort, a, b));

    Ok(
      matched
        .into_iter()
        .skip(request.offset)
        .take(request.limit.unwrap_or(usize::MAX))
        .map(|(handle, _)| handle)
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::medium::{MediumError, MediumResult, MemoryMedium, SqliteMedium};
  use crate::predicate::{Predicate, SortDescriptor};
  use crate::schema::{AttributeType, RelationshipDescriptor, Schema};
  use crate::value::{attributes, AttributeValue};
  use std::sync::atomic::{AtomicBool, Ordering};

  fn schema() -> Arc<Schema> {
    let schema = Schema::new();
    schema.register(
      EntityDescriptor::new("Person")
        .with_attribute("name", AttributeType::String)
        .with_attribute("age", AttributeType::Integer)
        .with_attribute("score", AttributeType::Double)
        .with_relationship("friends", RelationshipDescriptor::to_many("Person", true))
        .with_relationship("employer", RelationshipDescriptor::to_one("Company")),
    );
    schema.register(EntityDescriptor::new("Company").with_attribute("name", AttributeType::String));
    Arc::new(schema)
  }

  /// Medium whose commits can be made to fail on demand.
  struct FlakyMedium {
    inner: MemoryMedium,
    fail: AtomicBool,
  }

  impl FlakyMedium {
    fn new() -> Self {
      Self {
        inner: MemoryMedium::new(),
        fail: AtomicBool::new(false),
      }
    }
  }

  impl PersistentMedium for FlakyMedium {
    fn load(&self, entity: &str, identifier: &str) -> MediumResult<Option<StoredRecord>> {
      self.inner.load(entity, identifier)
    }

    fn scan(&self, entity: &str) -> MediumResult<Vec<StoredRecord>> {
      self.inner.scan(entity)
    }

    fn apply(&self, batch: &[Mutation]) -> MediumResult<()> {
      if self.fail.load(Ordering::SeqCst) {
        return Err(MediumError::new("apply", "disk full"));
      }
      self.inner.apply(batch)
    }
  }

  fn backing() -> (Backing, Arc<FlakyMedium>) {
    let medium = Arc::new(FlakyMedium::new());
    let backing = Backing::new(schema(), medium.clone()).unwrap();
    (backing, medium)
  }

  fn name(value: &str) -> Attributes {
    attributes([("name", value)])
  }

  #[test]
  fn test_resolve_is_idempotent() {
    let (backing, _) = backing();
    let first = backing.resolve("Person", "p1").unwrap();
    let second = backing.resolve("Person", "p1").unwrap();
    assert_eq!(first, second);
    assert_ne!(first, backing.resolve("Company", "p1").unwrap());
  }

  #[test]
  fn test_resolve_unknown_entity() {
    let (backing, _) = backing();
    let err = backing.resolve("Dog", "d1").unwrap_err();
    assert!(matches!(err, BackingError::UnknownEntityType(name) if name == "Dog"));
  }

  #[test]
  fn test_insert_update_commit() {
    let (backing, medium) = backing();
    let h1 = backing.insert("Person", "p1").unwrap();
    backing.update(h1, name("Ann")).unwrap();
    backing.commit().unwrap();

    assert_eq!(backing.attributes_of(h1).unwrap(), name("Ann"));
    assert_eq!(backing.identifier_of(h1).unwrap(), "p1");
    assert!(!backing.has_changes());
    assert!(medium.inner.contains("Person", "p1").unwrap());
  }

  #[test]
  fn test_duplicate_insert() {
    let (backing, _) = backing();
    backing.insert("Person", "p1").unwrap();
    let err = backing.insert("Person", "p1").unwrap_err();
    assert!(matches!(err, BackingError::DuplicateIdentifier { .. }));
    assert_eq!(backing.pending_len(), 1);
  }

  #[test]
  fn test_duplicate_of_committed_record() {
    let medium = Arc::new(MemoryMedium::new());
    medium
      .apply(&[Mutation::Insert {
        entity: "Person".into(),
        identifier: "p1".into(),
        attributes: name("Ann"),
      }])
      .unwrap();
    let backing = Backing::new(schema(), medium).unwrap();

    let err = backing.insert("Person", "p1").unwrap_err();
    assert!(matches!(err, BackingError::DuplicateIdentifier { .. }));
  }

  #[test]
  fn test_update_merges() {
    let (backing, _) = backing();
    let h1 = backing.insert("Person", "p1").unwrap();
    backing.update(h1, name("Ann")).unwrap();
    backing.update(h1, attributes([("age", 41i64)])).unwrap();

    let attrs = backing.attributes_of(h1).unwrap();
    assert_eq!(attrs.get("name"), Some(&AttributeValue::String("Ann".into())));
    assert_eq!(attrs.get("age"), Some(&AttributeValue::Integer(41)));
    assert_eq!(attrs.len(), 2);
  }

  #[test]
  fn test_update_validation_leaves_state_untouched() {
    let (backing, _) = backing();
    let h1 = backing.insert("Person", "p1").unwrap();

    let err = backing.update(h1, attributes([("shoe", "42")])).unwrap_err();
    assert!(matches!(err, BackingError::UnknownAttribute { .. }));

    let err = backing
      .update(h1, attributes([("name", "Ann"), ("age", "old")]))
      .unwrap_err();
    assert!(matches!(err, BackingError::AttributeTypeMismatch { .. }));

    assert!(backing.attributes_of(h1).unwrap().is_empty());
    assert_eq!(backing.pending_len(), 1);
  }

  #[test]
  fn test_delete_allocates_new_handle() {
    let (backing, _) = backing();
    let h1 = backing.insert("Person", "p1").unwrap();
    backing.commit().unwrap();

    backing.delete(h1).unwrap();
    assert!(matches!(
      backing.attributes_of(h1),
      Err(BackingError::HandleInvalidated(h)) if h == h1
    ));

    let h2 = backing.resolve("Person", "p1").unwrap();
    assert_ne!(h1, h2);
    assert!(!backing.exists(h2).unwrap());
    // Deleted in the pending batch, so the committed row is hidden
    assert!(backing.attributes_of(h2).unwrap().is_empty());

    backing.commit().unwrap();
    let h3 = backing.resolve("Person", "p1").unwrap();
    assert_eq!(h2, h3);
    assert!(backing.attributes_of(h3).unwrap().is_empty());
  }

  #[test]
  fn test_failed_commit_is_atomic() {
    let (backing, medium) = backing();
    let h1 = backing.insert("Person", "p1").unwrap();
    backing.update(h1, name("Ann")).unwrap();
    backing.commit().unwrap();

    backing.update(h1, name("Changed")).unwrap();
    let h2 = backing.insert("Person", "p2").unwrap();
    backing.delete(h1).unwrap();

    medium.fail.store(true, Ordering::SeqCst);
    let err = backing.commit().unwrap_err();
    assert!(matches!(err, BackingError::CommitFailed(_)));
    medium.fail.store(false, Ordering::SeqCst);

    assert!(!backing.has_changes());
    assert_eq!(backing.attributes_of(h1).unwrap(), name("Ann"));
    assert!(matches!(
      backing.attributes_of(h2),
      Err(BackingError::HandleInvalidated(_))
    ));
    assert_eq!(backing.resolve("Person", "p1").unwrap(), h1);
    assert_eq!(medium.inner.len(), 1);
  }

  #[test]
  fn test_failed_commit_keeps_one_handle_per_identifier() {
    let (backing, medium) = backing();
    let h1 = backing.insert("Person", "p1").unwrap();
    backing.commit().unwrap();

    backing.delete(h1).unwrap();
    let h2 = backing.resolve("Person", "p1").unwrap();
    assert_ne!(h1, h2);

    medium.fail.store(true, Ordering::SeqCst);
    assert!(backing.commit().is_err());
    medium.fail.store(false, Ordering::SeqCst);

    assert!(backing.exists(h1).unwrap());
    assert!(matches!(
      backing.exists(h2),
      Err(BackingError::HandleInvalidated(h)) if h == h2
    ));
    assert_eq!(backing.resolve("Person", "p1").unwrap(), h1);
  }

  #[test]
  fn test_rollback_after_delete_and_resolve() {
    let (backing, medium) = backing();
    let h1 = backing.insert("Person", "p1").unwrap();
    backing.commit().unwrap();

    backing.delete(h1).unwrap();
    let h2 = backing.resolve("Person", "p1").unwrap();
    backing.rollback().unwrap();

    assert!(backing.identifier_of(h1).is_ok());
    assert!(backing.identifier_of(h2).is_err());
    assert_eq!(backing.resolve("Person", "p1").unwrap(), h1);

    backing.update(h1, name("Ann")).unwrap();
    assert!(backing.update(h2, name("Bob")).is_err());
    backing.commit().unwrap();
    assert_eq!(
      medium.inner.load("Person", "p1").unwrap().unwrap().attributes,
      name("Ann")
    );
  }

  #[test]
  fn test_resolved_identifier_cannot_be_inserted() {
    let (backing, medium) = backing();
    let h1 = backing.resolve("Person", "p1").unwrap();
    assert!(!backing.exists(h1).unwrap());

    let err = backing.insert("Person", "p1").unwrap_err();
    assert!(matches!(err, BackingError::DuplicateIdentifier { .. }));

    backing.update(h1, name("Ann")).unwrap();
    backing.commit().unwrap();
    assert!(backing.exists(h1).unwrap());
    assert!(medium.inner.contains("Person", "p1").unwrap());
  }

  #[test]
  fn test_non_finite_double_rejected() {
    let medium = Arc::new(SqliteMedium::open_in_memory().unwrap());
    {
      let backing = Backing::new(schema(), medium.clone()).unwrap();
      let h1 = backing.insert("Person", "p1").unwrap();
      for bad in [f64::NAN, f64::INFINITY] {
        let err = backing.update(h1, attributes([("score", bad)])).unwrap_err();
        assert!(matches!(err, BackingError::AttributeTypeMismatch { .. }));
      }
      backing.update(h1, attributes([("score", 2.5)])).unwrap();
      backing.commit().unwrap();
    }

    let backing = Backing::new(schema(), medium).unwrap();
    let h1 = backing.resolve("Person", "p1").unwrap();
    assert_eq!(
      backing.attributes_of(h1).unwrap(),
      attributes([("score", 2.5)])
    );
  }

  #[test]
  fn test_rollback_discards_pending() {
    let (backing, _) = backing();
    let h1 = backing.insert("Person", "p1").unwrap();
    backing.update(h1, name("Ann")).unwrap();
    backing.commit().unwrap();

    backing.update(h1, name("Bob")).unwrap();
    backing.rollback().unwrap();

    assert_eq!(backing.attributes_of(h1).unwrap(), name("Ann"));
    assert!(!backing.has_changes());
  }

  #[test]
  fn test_relationships() {
    let (backing, _) = backing();
    let ann = backing.insert("Person", "ann").unwrap();
    let bob = backing.insert("Person", "bob").unwrap();
    let cid = backing.insert("Person", "cid").unwrap();
    let acme = backing.insert("Company", "acme").unwrap();

    backing
      .update_relationship(ann, "friends", vec![cid, bob, cid])
      .unwrap();
    backing.update_relationship(ann, "employer", vec![acme]).unwrap();

    assert_eq!(backing.relationship_targets(ann, "friends").unwrap(), vec![cid, bob]);
    assert_eq!(backing.relationship_targets(ann, "employer").unwrap(), vec![acme]);
    assert!(backing.relationship_targets(bob, "friends").unwrap().is_empty());

    let err = backing.update_relationship(ann, "employer", vec![bob]).unwrap_err();
    assert!(matches!(err, BackingError::InvalidRelationshipTarget { .. }));

    let err = backing
      .update_relationship(ann, "friends", vec![acme])
      .unwrap_err();
    assert!(matches!(err, BackingError::InvalidRelationshipTarget { .. }));

    let err = backing.relationship_targets(ann, "pets").unwrap_err();
    assert!(matches!(err, BackingError::UnknownRelationship { .. }));
  }

  #[test]
  fn test_delete_nullifies_edges() {
    let (backing, _) = backing();
    let ann = backing.insert("Person", "ann").unwrap();
    let bob = backing.insert("Person", "bob").unwrap();
    let cid = backing.insert("Person", "cid").unwrap();
    backing.update_relationship(ann, "friends", vec![bob, cid]).unwrap();
    backing.commit().unwrap();

    backing.delete(bob).unwrap();
    assert_eq!(backing.relationship_targets(ann, "friends").unwrap(), vec![cid]);

    let err = backing
      .update_relationship(ann, "friends", vec![bob])
      .unwrap_err();
    assert!(matches!(err, BackingError::HandleInvalidated(h) if h == bob));
  }

  #[test]
  fn test_edges_survive_reopen() {
    let medium = Arc::new(SqliteMedium::open_in_memory().unwrap());
    {
      let backing = Backing::new(schema(), medium.clone()).unwrap();
      let ann = backing.insert("Person", "ann").unwrap();
      let bob = backing.insert("Person", "bob").unwrap();
      backing.update(bob, name("Bob")).unwrap();
      backing.update_relationship(ann, "friends", vec![bob]).unwrap();
      backing.commit().unwrap();
    }

    let backing = Backing::new(schema(), medium).unwrap();
    let ann = backing.prefetch("Person", "ann").unwrap();
    let friends = backing.relationship_targets(ann, "friends").unwrap();
    assert_eq!(friends.len(), 1);
    assert_eq!(backing.identifier_of(friends[0]).unwrap(), "bob");
    assert_eq!(backing.attributes_of(friends[0]).unwrap(), name("Bob"));
  }

  #[derive(Debug, PartialEq)]
  struct Person {
    id: String,
    name: Option<String>,
  }

  fn person(backing: &Backing) -> impl FnMut(ObjectHandle) -> Result<Person> + '_ {
    move |handle| {
      let attrs = backing.attributes_of(handle)?;
      Ok(Person {
        id: backing.identifier_of(handle)?,
        name: match attrs.get("name") {
          Some(AttributeValue::String(s)) => Some(s.clone()),
          _ => None,
        },
      })
    }
  }

  #[test]
  fn test_fetch_combines_committed_and_pending() {
    let (backing, _) = backing();
    for (id, n, age) in [("p1", "Ann", 30i64), ("p2", "Bob", 25), ("p3", "Cid", 41)] {
      let h = backing.insert("Person", id).unwrap();
      backing
        .update(h, attributes([("name", AttributeValue::from(n)), ("age", age.into())]))
        .unwrap();
    }
    backing.commit().unwrap();

    let p4 = backing.insert("Person", "p4").unwrap();
    backing.update(p4, name("Dee")).unwrap();
    let p2 = backing.resolve("Person", "p2").unwrap();
    backing.delete(p2).unwrap();

    let request = FetchRequest::new("Person");
    let ids: Vec<String> = backing
      .fetch(&request, person(&backing))
      .unwrap()
      .map(|p| p.unwrap().id)
      .collect();
    assert_eq!(ids, vec!["p1", "p3", "p4"]);

    let request = FetchRequest::new("Person")
      .with_predicate(Predicate::Ge("age".into(), 30i64.into()))
      .sorted_by(SortDescriptor::descending("age"));
    let people: Vec<Person> = backing
      .fetch(&request, person(&backing))
      .unwrap()
      .collect::<Result<_>>()
      .unwrap();
    assert_eq!(
      people,
      vec![
        Person {
          id: "p3".into(),
          name: Some("Cid".into())
        },
        Person {
          id: "p1".into(),
          name: Some("Ann".into())
        },
      ]
    );
  }

  #[test]
  fn test_fetch_window_and_identifier_key() {
    let (backing, _) = backing();
    for id in ["a", "b", "c", "d"] {
      backing.insert("Person", id).unwrap();
    }

    let request = FetchRequest::new("Person").with_offset(1).with_limit(2);
    let fetched = backing.fetch(&request, |h| backing.identifier_of(h)).unwrap();
    assert_eq!(fetched.len(), 2);
    assert_eq!(fetched.collect::<Result<Vec<_>>>().unwrap(), vec!["b", "c"]);

    let request = FetchRequest::new("Person")
      .with_predicate(Predicate::equals(DEFAULT_IDENTIFIER_KEY, "c"));
    let ids: Vec<String> = backing
      .fetch(&request, |h| backing.identifier_of(h))
      .unwrap()
      .collect::<Result<_>>()
      .unwrap();
    assert_eq!(ids, vec!["c"]);
  }

  #[test]
  fn test_fetch_instantiator_error() {
    let (backing, _) = backing();
    backing.insert("Person", "p1").unwrap();

    let mut results = backing
      .fetch(&FetchRequest::new("Person"), |_| -> Result<()> {
        Err(BackingError::Instantiation("no constructor".into()))
      })
      .unwrap();
    assert!(matches!(results.next(), Some(Err(BackingError::Instantiation(_)))));
  }

  #[test]
  fn test_perform_and_wait_batches() {
    let (backing, _) = backing();
    let handle = backing
      .perform_and_wait(|backing| -> Result<ObjectHandle> {
        let h = backing.insert("Person", "p1")?;
        backing.update(h, name("Ann"))?;
        backing.commit()?;
        Ok(h)
      })
      .unwrap()
      .unwrap();

    assert_eq!(backing.attributes_of(handle).unwrap(), name("Ann"));
  }

  #[test]
  fn test_concurrent_mutations() {
    let (backing, medium) = backing();

    let workers: Vec<_> = (0..8)
      .map(|worker| {
        let backing = backing.clone();
        std::thread::spawn(move || {
          for i in 0..10 {
            let h = backing.insert("Person", &format!("w{}-{}", worker, i)).unwrap();
            backing.update(h, attributes([("age", i as i64)])).unwrap();
          }
        })
      })
      .collect();
    for worker in workers {
      worker.join().unwrap();
    }

    assert_eq!(backing.pending_len(), 160);
    backing.commit().unwrap();
    assert_eq!(medium.inner.len(), 80);
  }
}
