//! Command-line operations over a backing.

use backstore::{
  AttributeValue, Attributes, Backing, EntityDescriptor, FetchRequest, ObjectHandle, Predicate,
  SortDescriptor,
};
use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Map, Value};

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
  /// List entity descriptors
  Entities,
  /// Show one record
  Get { entity: String, id: String },
  /// Create a record
  Insert {
    entity: String,
    id: String,
    /// Attributes as key=value (values are JSON, or plain strings)
    #[arg(value_parser = parse_assignment)]
    values: Vec<(String, Value)>,
  },
  /// Merge attributes into a record, creating it if needed
  Set {
    entity: String,
    id: String,
    #[arg(required = true, value_parser = parse_assignment)]
    values: Vec<(String, Value)>,
  },
  /// Replace the targets of a relationship
  Relate {
    entity: String,
    id: String,
    relationship: String,
    targets: Vec<String>,
  },
  /// Delete a record
  Delete { entity: String, id: String },
  /// List records of an entity
  Fetch {
    entity: String,
    /// Equality filter as key=value (repeatable)
    #[arg(long = "where", value_parser = parse_assignment)]
    filters: Vec<(String, Value)>,
    /// Attribute to sort by
    #[arg(long)]
    sort: Option<String>,
    /// Sort descending
    #[arg(long)]
    desc: bool,
    #[arg(long)]
    limit: Option<usize>,
  },
}

/// Parse `key=value`. The value is read as JSON when possible.
pub fn parse_assignment(input: &str) -> std::result::Result<(String, Value), String> {
  let (key, raw) = input
    .split_once('=')
    .ok_or_else(|| format!("expected key=value, got '{}'", input))?;

  if key.is_empty() {
    return Err(format!("missing key in '{}'", input));
  }

  let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
  Ok((key.to_string(), value))
}

/// Convert parsed assignments into typed attributes.
fn to_attributes(descriptor: &EntityDescriptor, values: &[(String, Value)]) -> Result<Attributes> {
  values
    .iter()
    .map(|(key, raw)| {
      let ty = descriptor
        .attribute(key)
        .ok_or_else(|| eyre!("{} has no attribute '{}'", descriptor.name, key))?;
      let value = AttributeValue::from_json(raw, ty)
        .ok_or_else(|| eyre!("{} is not a valid {:?} for {}.{}", raw, ty, descriptor.name, key))?;
      Ok((key.clone(), value))
    })
    .collect()
}

/// JSON rendering of a record.
fn describe(backing: &Backing, handle: ObjectHandle) -> Result<Value> {
  let entity = backing.entity_of(handle)?;
  let descriptor = backing.entity(&entity)?;

  let attributes: Map<String, Value> = backing
    .attributes_of(handle)?
    .iter()
    .map(|(k, v)| (k.clone(), v.to_json()))
    .collect();

  let mut relationships = Map::new();
  for name in descriptor.relationships.keys() {
    let targets = backing
      .relationship_targets(handle, name)?
      .into_iter()
      .map(|t| backing.identifier_of(t).map(Value::String))
      .collect::<backstore::Result<Vec<_>>>()?;
    if !targets.is_empty() {
      relationships.insert(name.clone(), Value::Array(targets));
    }
  }

  Ok(json!({
    "entity": entity,
    "identifier": backing.identifier_of(handle)?,
    "attributes": attributes,
    "relationships": relationships,
  }))
}

/// Resolve a record that must already exist.
fn existing(backing: &Backing, entity: &str, id: &str) -> Result<ObjectHandle> {
  let handle = backing.prefetch(entity, id)?;
  if !backing.exists(handle)? {
    return Err(eyre!("{} '{}' not found", entity, id));
  }
  Ok(handle)
}

/// Run a command, returning what to print.
pub fn execute(backing: &Backing, command: Command) -> Result<Value> {
  match command {
    Command::Entities => {
      let mut entities = Vec::new();
      for name in backing.entity_names() {
        let descriptor = backing.entity(&name)?;
        entities.push(serde_json::to_value(&*descriptor)?);
      }
      Ok(Value::Array(entities))
    }
    Command::Get { entity, id } => {
      let handle = existing(backing, &entity, &id)?;
      describe(backing, handle)
    }
    Command::Insert { entity, id, values } => {
      let descriptor = backing.entity(&entity)?;
      let attributes = to_attributes(&descriptor, &values)?;

      let handle = backing.insert(&entity, &id)?;
      if !attributes.is_empty() {
        backing.update(handle, attributes)?;
      }
      backing.commit()?;
      describe(backing, handle)
    }
    Command::Set { entity, id, values } => {
      let descriptor = backing.entity(&entity)?;
      let attributes = to_attributes(&descriptor, &values)?;

      let handle = backing.resolve(&entity, &id)?;
      backing.update(handle, attributes)?;
      backing.commit()?;
      describe(backing, handle)
    }
    Command::Relate {
      entity,
      id,
      relationship,
      targets,
    } => {
      let descriptor = backing.entity(&entity)?;
      let destination = descriptor
        .relationship(&relationship)
        .map(|r| r.destination.clone())
        .ok_or_else(|| eyre!("{} has no relationship '{}'", entity, relationship))?;

      let handle = existing(backing, &entity, &id)?;
      let targets = targets
        .iter()
        .map(|target| existing(backing, &destination, target))
        .collect::<Result<Vec<_>>>()?;

      backing.update_relationship(handle, &relationship, targets)?;
      backing.commit()?;
      describe(backing, handle)
    }
    Command::Delete { entity, id } => {
      let handle = existing(backing, &entity, &id)?;
      backing.delete(handle)?;
      backing.commit()?;
      Ok(json!({ "deleted": { "entity": entity, "identifier": id } }))
    }
    Command::Fetch {
      entity,
      filters,
      sort,
      desc,
      limit,
    } => {
      let descriptor = backing.entity(&entity)?;
      let key = backing.identifier_key().to_string();

      let mut predicates = Vec::new();
      for (name, raw) in &filters {
        let value = if *name == key {
          AttributeValue::String(raw.as_str().map(String::from).unwrap_or_else(|| raw.to_string()))
        } else {
          to_attributes(&descriptor, &[(name.clone(), raw.clone())])?
            .remove(name)
            .unwrap_or(AttributeValue::Null)
        };
        predicates.push(Predicate::Eq(name.clone(), value));
      }

      let mut request = FetchRequest::new(&entity).with_predicate(Predicate::and(predicates));
      if let Some(sort) = sort {
        request = request.sorted_by(if desc {
          SortDescriptor::descending(sort)
        } else {
          SortDescriptor::ascending(sort)
        });
      }
      if let Some(limit) = limit {
        request = request.with_limit(limit);
      }

      let records = backing
        .fetch(&request, |handle| Ok(describe(backing, handle)))?
        .map(|record| -> Result<Value> { record? })
        .collect::<Result<Vec<_>>>()?;
      Ok(Value::Array(records))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use backstore::{MemoryMedium, Schema};
  use std::sync::Arc;

  const SCHEMA: &str = r#"
entities:
  Person:
    attributes:
      name: string
      age: integer
    relationships:
      friends: { destination: Person, to_many: true, ordered: true }
"#;

  fn backing() -> Backing {
    let schema = Schema::from_yaml(SCHEMA).unwrap();
    Backing::new(Arc::new(schema), Arc::new(MemoryMedium::new())).unwrap()
  }

  fn insert(backing: &Backing, id: &str, values: &[&str]) -> Value {
    let values = values.iter().map(|v| parse_assignment(v).unwrap()).collect();
    execute(
      backing,
      Command::Insert {
        entity: "Person".into(),
        id: id.into(),
        values,
      },
    )
    .unwrap()
  }

  #[test]
  fn test_parse_assignment() {
    assert_eq!(parse_assignment("age=41").unwrap(), ("age".into(), json!(41)));
    assert_eq!(parse_assignment("name=Ann").unwrap(), ("name".into(), json!("Ann")));
    assert_eq!(parse_assignment("name=\"41\"").unwrap(), ("name".into(), json!("41")));
    assert!(parse_assignment("novalue").is_err());
    assert!(parse_assignment("=1").is_err());
  }

  #[test]
  fn test_insert_and_get() {
    let backing = backing();
    let inserted = insert(&backing, "p1", &["name=Ann", "age=41"]);
    assert_eq!(inserted["attributes"], json!({ "name": "Ann", "age": 41 }));

    let fetched = execute(
      &backing,
      Command::Get {
        entity: "Person".into(),
        id: "p1".into(),
      },
    )
    .unwrap();
    assert_eq!(fetched["identifier"], json!("p1"));
  }

  #[test]
  fn test_type_errors_are_reported() {
    let backing = backing();
    let result = execute(
      &backing,
      Command::Insert {
        entity: "Person".into(),
        id: "p1".into(),
        values: vec![parse_assignment("age=old").unwrap()],
      },
    );
    assert!(result.is_err());
    assert!(!backing.has_changes());
  }

  #[test]
  fn test_relate_fetch_delete() {
    let backing = backing();
    insert(&backing, "ann", &["name=Ann", "age=30"]);
    insert(&backing, "bob", &["name=Bob", "age=25"]);

    let related = execute(
      &backing,
      Command::Relate {
        entity: "Person".into(),
        id: "ann".into(),
        relationship: "friends".into(),
        targets: vec!["bob".into()],
      },
    )
    .unwrap();
    assert_eq!(related["relationships"]["friends"], json!(["bob"]));

    let fetched = execute(
      &backing,
      Command::Fetch {
        entity: "Person".into(),
        filters: vec![],
        sort: Some("age".into()),
        desc: false,
        limit: None,
      },
    )
    .unwrap();
    assert_eq!(fetched[0]["identifier"], json!("bob"));
    assert_eq!(fetched[1]["identifier"], json!("ann"));

    execute(
      &backing,
      Command::Delete {
        entity: "Person".into(),
        id: "bob".into(),
      },
    )
    .unwrap();

    let fetched = execute(
      &backing,
      Command::Fetch {
        entity: "Person".into(),
        filters: vec![parse_assignment("name=Ann").unwrap()],
        sort: None,
        desc: false,
        limit: Some(5),
      },
    )
    .unwrap();
    assert_eq!(fetched.as_array().unwrap().len(), 1);
    assert_eq!(fetched[0]["relationships"], json!({}));

    let missing = execute(
      &backing,
      Command::Get {
        entity: "Person".into(),
        id: "bob".into(),
      },
    );
    assert!(missing.is_err());
  }
}
