//! Arena of cached records plus the pending mutation journal.
//!
//! Slots are addressed by [`ObjectHandle`]. Every change made by a pending
//! batch first saves the affected slot in an undo table, so a failed commit
//! can put identities back exactly as they were at the last commit.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::handle::ObjectHandle;
use crate::medium::{Mutation, RecordRef};
use crate::value::Attributes;

/// Loaded contents of a record.
#[derive(Debug, Clone, Default)]
pub(crate) struct Resident {
  pub attributes: Attributes,
  pub relationships: BTreeMap<String, Vec<ObjectHandle>>,
  /// Present in the medium or created by the pending batch
  pub exists: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Slot {
  pub entity: String,
  pub identifier: String,
  pub generation: u64,
  pub live: bool,
  /// `None` while the record is a fault
  pub record: Option<Resident>,
}

impl Slot {
  pub fn key(&self) -> RecordRef {
    RecordRef::new(self.entity.as_str(), self.identifier.as_str())
  }
}

#[derive(Debug, Default)]
pub(crate) struct State {
  slots: Vec<Slot>,
  /// Slots free since the last commit
  free: Vec<u32>,
  /// Slots released by the pending batch, recycled only once it commits
  released: Vec<u32>,
  index: HashMap<RecordRef, ObjectHandle>,
  next_generation: u64,
  journal: Vec<Mutation>,
  /// Slot contents before their first change in the pending batch.
  /// `None` marks a slot the batch took from the free list.
  undo: HashMap<u32, Option<Slot>>,
  /// Records deleted by the pending batch
  tombstones: HashSet<RecordRef>,
}

impl State {
  pub fn lookup(&self, handle: ObjectHandle) -> Option<&Slot> {
    self
      .slots
      .get(handle.slot as usize)
      .filter(|slot| slot.live && slot.generation == handle.generation)
  }

  pub fn lookup_mut(&mut self, handle: ObjectHandle) -> Option<&mut Slot> {
    self
      .slots
      .get_mut(handle.slot as usize)
      .filter(|slot| slot.live && slot.generation == handle.generation)
  }

  pub fn handle_for(&self, key: &RecordRef) -> Option<ObjectHandle> {
    self.index.get(key).copied()
  }

  pub fn is_tombstoned(&self, key: &RecordRef) -> bool {
    self.tombstones.contains(key)
  }

  /// Map a new identity to a slot. `journaled` allocations belong to the
  /// pending batch and disappear again if it rolls back. So does any
  /// identity the batch deleted, since rollback brings back its old slot.
  pub fn allocate(
    &mut self,
    key: RecordRef,
    record: Option<Resident>,
    journaled: bool,
  ) -> ObjectHandle {
    let journaled = journaled || self.tombstones.contains(&key);
    let generation = self.next_generation;
    self.next_generation += 1;

    let slot = Slot {
      entity: key.entity.clone(),
      identifier: key.identifier.clone(),
      generation,
      live: true,
      record,
    };

    let index = match self.free.pop() {
      Some(index) => {
        self.slots[index as usize] = slot;
        index
      }
      None => {
        self.slots.push(slot);
        (self.slots.len() - 1) as u32
      }
    };

    if journaled {
      self.undo.entry(index).or_insert(None);
    }

    let handle = ObjectHandle::new(index, generation);
    self.index.insert(key, handle);
    handle
  }

  /// Save a slot's current contents before the pending batch changes it.
  pub fn backup(&mut self, handle: ObjectHandle) {
    if self.undo.contains_key(&handle.slot) {
      return;
    }
    if let Some(slot) = self.slots.get(handle.slot as usize) {
      let copy = slot.clone();
      self.undo.insert(handle.slot, Some(copy));
    }
  }

  /// Invalidate a handle and forget its identity mapping.
  pub fn release(&mut self, handle: ObjectHandle) {
    self.backup(handle);
    let key = match self.lookup_mut(handle) {
      Some(slot) => {
        slot.live = false;
        slot.record = None;
        slot.key()
      }
      None => return,
    };

    self.index.remove(&key);
    self.tombstones.insert(key);
    self.released.push(handle.slot);
  }

  /// Remove `target` from every resident edge that holds it.
  /// Returns the (source, relationship) pairs that changed.
  pub fn strip_target(&mut self, target: ObjectHandle) -> Vec<(ObjectHandle, String)> {
    let affected: Vec<(ObjectHandle, String)> = self
      .live_handles()
      .into_iter()
      .flat_map(|source| {
        self
          .lookup(source)
          .and_then(|slot| slot.record.as_ref())
          .map(|record| {
            record
              .relationships
              .iter()
              .filter(|(_, targets)| targets.contains(&target))
              .map(|(name, _)| (source, name.clone()))
              .collect::<Vec<_>>()
          })
          .unwrap_or_default()
      })
      .collect();

    for (source, name) in &affected {
      self.backup(*source);
      if let Some(record) = self.lookup_mut(*source).and_then(|s| s.record.as_mut()) {
        if let Some(targets) = record.relationships.get_mut(name) {
          targets.retain(|t| *t != target);
          if targets.is_empty() {
            record.relationships.remove(name);
          }
        }
      }
    }

    affected
  }

  /// Handles of every live slot, in slot order.
  pub fn live_handles(&self) -> Vec<ObjectHandle> {
    self
      .slots
      .iter()
      .enumerate()
      .filter(|(_, slot)| slot.live)
      .map(|(index, slot)| ObjectHandle::new(index as u32, slot.generation))
      .collect()
  }

  /// Current targets of an edge as stable references.
  pub fn edge_refs(&self, source: ObjectHandle, relationship: &str) -> Vec<RecordRef> {
    self
      .lookup(source)
      .and_then(|slot| slot.record.as_ref())
      .and_then(|record| record.relationships.get(relationship))
      .map(|targets| {
        targets
          .iter()
          .filter_map(|t| self.lookup(*t).map(Slot::key))
          .collect()
      })
      .unwrap_or_default()
  }

  pub fn record(&mut self, mutation: Mutation) {
    self.journal.push(mutation);
  }

  pub fn journal(&self) -> &[Mutation] {
    &self.journal
  }

  pub fn has_changes(&self) -> bool {
    !self.journal.is_empty()
  }

  pub fn pending_len(&self) -> usize {
    self.journal.len()
  }

  /// The medium accepted the batch: it becomes the committed state.
  pub fn committed(&mut self) {
    self.journal.clear();
    self.undo.clear();
    self.tombstones.clear();
    self.free.append(&mut self.released);
  }

  /// Discard the pending batch.
  ///
  /// Identities changed by the batch are restored, and every live record
  /// becomes a fault again so its next read comes from the medium, which
  /// still holds the last committed state.
  pub fn rollback(&mut self) {
    for (index, backup) in self.undo.drain() {
      match backup {
        Some(slot) => self.slots[index as usize] = slot,
        None => {
          let slot = &mut self.slots[index as usize];
          slot.live = false;
          slot.record = None;
          self.free.push(index);
        }
      }
    }

    self.journal.clear();
    self.tombstones.clear();
    self.released.clear();

    self.index.clear();
    for (index, slot) in self.slots.iter_mut().enumerate() {
      if slot.live {
        slot.record = None;
        self
          .index
          .insert(slot.key(), ObjectHandle::new(index as u32, slot.generation));
      }
    }
  }
}
