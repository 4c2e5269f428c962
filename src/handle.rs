//! Process-local object handles.

use std::fmt;

/// Opaque reference to a cached record.
///
/// A handle names an arena slot plus the generation the slot had when the
/// handle was issued. Generations come from a session-wide counter, so a
/// handle is never reissued once its record is deleted, even when the slot
/// is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectHandle {
  pub(crate) slot: u32,
  pub(crate) generation: u64,
}

impl ObjectHandle {
  pub(crate) fn new(slot: u32, generation: u64) -> Self {
    Self { slot, generation }
  }
}

impl fmt::Display for ObjectHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}v{}", self.slot, self.generation)
  }
}
