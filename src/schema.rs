//! Entity descriptors and the schema provider.
//!
//! A schema is a set of named entity descriptors. Descriptors are immutable
//! once registered and the set only ever grows, so a descriptor handed out
//! by [`SchemaProvider::entity`] stays valid for the process lifetime.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::value::AttributeValue;

/// Declared type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
  String,
  Integer,
  Double,
  Boolean,
  Date,
  Binary,
}

impl AttributeType {
  /// Whether a value may be stored under an attribute of this type.
  /// `Null` is accepted for every type. Doubles must be finite.
  pub fn accepts(&self, value: &AttributeValue) -> bool {
    matches!(
      (self, value),
      (_, AttributeValue::Null)
        | (AttributeType::String, AttributeValue::String(_))
        | (AttributeType::Integer, AttributeValue::Integer(_))
        | (AttributeType::Boolean, AttributeValue::Bool(_))
        | (AttributeType::Date, AttributeValue::Date(_))
        | (AttributeType::Binary, AttributeValue::Binary(_))
    ) || matches!(
      (self, value),
      (AttributeType::Double, AttributeValue::Double(d)) if d.is_finite()
    )
  }
}

/// A typed relationship from one entity to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDescriptor {
  /// Entity type of every target
  pub destination: String,
  #[serde(default)]
  pub to_many: bool,
  /// Only meaningful for to-many relationships
  #[serde(default)]
  pub ordered: bool,
  /// Name of the inverse relationship on the destination, if any.
  /// Informational only: edges are never maintained in both directions.
  #[serde(default)]
  pub inverse: Option<String>,
}

/// Schema for one record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub attributes: BTreeMap<String, AttributeType>,
  #[serde(default)]
  pub relationships: BTreeMap<String, RelationshipDescriptor>,
}

impl EntityDescriptor {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      attributes: BTreeMap::new(),
      relationships: BTreeMap::new(),
    }
  }

  pub fn with_attribute(mut self, name: impl Into<String>, ty: AttributeType) -> Self {
    self.attributes.insert(name.into(), ty);
    self
  }

  pub fn with_relationship(
    mut self,
    name: impl Into<String>,
    relationship: RelationshipDescriptor,
  ) -> Self {
    self.relationships.insert(name.into(), relationship);
    self
  }

  pub fn attribute(&self, name: &str) -> Option<AttributeType> {
    self.attributes.get(name).copied()
  }

  pub fn relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
    self.relationships.get(name)
  }
}

impl RelationshipDescriptor {
  pub fn to_one(destination: impl Into<String>) -> Self {
    Self {
      destination: destination.into(),
      to_many: false,
      ordered: false,
      inverse: None,
    }
  }

  pub fn to_many(destination: impl Into<String>, ordered: bool) -> Self {
    Self {
      destination: destination.into(),
      to_many: true,
      ordered,
      inverse: None,
    }
  }

  pub fn with_inverse(mut self, inverse: impl Into<String>) -> Self {
    self.inverse = Some(inverse.into());
    self
  }
}

/// Source of entity descriptors.
///
/// Implementations must be append-only: once a name resolves to a
/// descriptor it must keep resolving to that same descriptor.
pub trait SchemaProvider: Send + Sync {
  /// Look up an entity descriptor by name.
  fn entity(&self, name: &str) -> Option<Arc<EntityDescriptor>>;

  /// Names of every known entity, sorted.
  fn entity_names(&self) -> Vec<String>;
}

/// On-disk layout of a schema file.
#[derive(Debug, Deserialize)]
struct SchemaFile {
  #[serde(default)]
  entities: BTreeMap<String, EntityDescriptor>,
}

/// Append-only, in-process schema.
#[derive(Debug, Default)]
pub struct Schema {
  entities: RwLock<BTreeMap<String, Arc<EntityDescriptor>>>,
}

impl Schema {
  pub fn new() -> Self {
    Self::default()
  }

  /// Load a schema from a YAML file.
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read schema file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse schema file {}: {}", path.display(), e))
  }

  /// Parse a schema from YAML text.
  ///
  /// ```yaml
  /// entities:
  ///   Person:
  ///     attributes:
  ///       name: string
  ///     relationships:
  ///       friends: { destination: Person, to_many: true }
  /// ```
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let file: SchemaFile = serde_yaml::from_str(contents)?;
    let schema = Self::new();

    for (name, mut descriptor) in file.entities {
      descriptor.name = name;
      schema.register(descriptor);
    }

    schema.validate()?;
    Ok(schema)
  }

  /// Register a descriptor. Returns false (and leaves the schema unchanged)
  /// if the name is already taken.
  pub fn register(&self, descriptor: EntityDescriptor) -> bool {
    let mut entities = match self.entities.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };

    if entities.contains_key(&descriptor.name) {
      return false;
    }
    entities.insert(descriptor.name.clone(), Arc::new(descriptor));
    true
  }

  /// Check that every relationship points at a registered entity.
  pub fn validate(&self) -> Result<()> {
    let entities = match self.entities.read() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };

    for descriptor in entities.values() {
      for (name, relationship) in &descriptor.relationships {
        if !entities.contains_key(&relationship.destination) {
          return Err(eyre!(
            "Relationship {}.{} points at unknown entity {}",
            descriptor.name,
            name,
            relationship.destination
          ));
        }
      }
    }

    Ok(())
  }
}

impl SchemaProvider for Schema {
  fn entity(&self, name: &str) -> Option<Arc<EntityDescriptor>> {
    let entities = match self.entities.read() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    entities.get(name).cloned()
  }

  fn entity_names(&self) -> Vec<String> {
    let entities = match self.entities.read() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    entities.keys().cloned().collect()
  }
}
