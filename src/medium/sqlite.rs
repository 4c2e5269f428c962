//! SQLite-backed medium.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{MediumError, MediumResult, Mutation, PersistentMedium, RecordRef, StoredRecord};
use crate::value::Attributes;

/// SQLite-based medium implementation.
pub struct SqliteMedium {
  conn: Mutex<Connection>,
}

/// Schema for the record tables.
const RECORD_SCHEMA: &str = r#"
-- One row per record (attributes serialized as JSON)
CREATE TABLE IF NOT EXISTS records (
    entity_type TEXT NOT NULL,
    resource_identifier TEXT NOT NULL,
    attributes BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (entity_type, resource_identifier)
);

-- Relationship edges (position preserves order)
CREATE TABLE IF NOT EXISTS edges (
    entity_type TEXT NOT NULL,
    resource_identifier TEXT NOT NULL,
    relationship TEXT NOT NULL,
    position INTEGER NOT NULL,
    target_entity_type TEXT NOT NULL,
    target_identifier TEXT NOT NULL,
    PRIMARY KEY (entity_type, resource_identifier, relationship, position)
);

CREATE INDEX IF NOT EXISTS idx_edges_target
    ON edges(target_entity_type, target_identifier);
"#;

impl SqliteMedium {
  /// Open (or create) the database at the given path.
  pub fn open(path: &Path) -> MediumResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| MediumError::new("create database directory", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| MediumError::new(format!("open database at {}", path.display()), e))?;

    Self::with_connection(conn)
  }

  /// Open a private, non-persistent database.
  pub fn open_in_memory() -> MediumResult<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| MediumError::new("open in-memory database", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> MediumResult<Self> {
    let medium = Self {
      conn: Mutex::new(conn),
    };
    medium.run_migrations()?;
    Ok(medium)
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;

    Some(data_dir.join("backstore").join("store.db"))
  }

  fn lock(&self) -> MutexGuard<'_, Connection> {
    match self.conn.lock() {
      Ok(guard) => guard,
      Err(poisoned) => {
        tracing::warn!("SQLite mutex was poisoned, recovering");
        poisoned.into_inner()
      }
    }
  }

  /// Run database migrations for record tables.
  fn run_migrations(&self) -> MediumResult<()> {
    self
      .lock()
      .execute_batch(RECORD_SCHEMA)
      .map_err(|e| MediumError::new("run migrations", e))
  }
}

fn decode_attributes(data: &[u8]) -> MediumResult<Attributes> {
  serde_json::from_slice(data).map_err(|e| MediumError::new("deserialize attributes", e))
}

fn encode_attributes(attributes: &Attributes) -> MediumResult<Vec<u8>> {
  serde_json::to_vec(attributes).map_err(|e| MediumError::new("serialize attributes", e))
}

/// Load all edges of one record, grouped by relationship in position order.
fn load_edges(
  conn: &Connection,
  entity: &str,
  identifier: &str,
) -> MediumResult<BTreeMap<String, Vec<RecordRef>>> {
  let mut stmt = conn
    .prepare_cached(
      "SELECT relationship, target_entity_type, target_identifier FROM edges
       WHERE entity_type = ? AND resource_identifier = ?
       ORDER BY relationship, position",
    )
    .map_err(|e| MediumError::new("prepare edge query", e))?;

  let rows = stmt
    .query_map(params![entity, identifier], |row| {
      Ok((
        row.get::<_, String>(0)?,
        RecordRef {
          entity: row.get(1)?,
          identifier: row.get(2)?,
        },
      ))
    })
    .map_err(|e| MediumError::new("query edges", e))?;

  let mut relationships: BTreeMap<String, Vec<RecordRef>> = BTreeMap::new();
  for row in rows {
    let (relationship, target) = row.map_err(|e| MediumError::new("read edge", e))?;
    relationships.entry(relationship).or_default().push(target);
  }

  Ok(relationships)
}

fn ensure_row(tx: &Transaction<'_>, entity: &str, identifier: &str) -> MediumResult<()> {
  tx.execute(
    "INSERT OR IGNORE INTO records (entity_type, resource_identifier, attributes)
     VALUES (?, ?, ?)",
    params![entity, identifier, b"{}".to_vec()],
  )
  .map_err(|e| MediumError::new("create record", e))?;
  Ok(())
}

fn apply_one(tx: &Transaction<'_>, mutation: &Mutation) -> MediumResult<()> {
  match mutation {
    Mutation::Insert {
      entity,
      identifier,
      attributes,
    } => {
      let data = encode_attributes(attributes)?;
      tx.execute(
        "INSERT INTO records (entity_type, resource_identifier, attributes, updated_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![entity, identifier, data],
      )
      .map_err(|e| MediumError::new(format!("insert {}/{}", entity, identifier), e))?;
    }
    Mutation::Update {
      entity,
      identifier,
      attributes,
    } => {
      let data = encode_attributes(attributes)?;
      tx.execute(
        "INSERT INTO records (entity_type, resource_identifier, attributes, updated_at)
         VALUES (?, ?, ?, datetime('now'))
         ON CONFLICT (entity_type, resource_identifier)
         DO UPDATE SET attributes = excluded.attributes, updated_at = excluded.updated_at",
        params![entity, identifier, data],
      )
      .map_err(|e| MediumError::new(format!("update {}/{}", entity, identifier), e))?;
    }
    Mutation::Relate {
      entity,
      identifier,
      relationship,
      targets,
    } => {
      ensure_row(tx, entity, identifier)?;

      tx.execute(
        "DELETE FROM edges
         WHERE entity_type = ? AND resource_identifier = ? AND relationship = ?",
        params![entity, identifier, relationship],
      )
      .map_err(|e| MediumError::new("delete old edges", e))?;

      for (position, target) in targets.iter().enumerate() {
        tx.execute(
          "INSERT INTO edges (entity_type, resource_identifier, relationship, position,
                              target_entity_type, target_identifier)
           VALUES (?, ?, ?, ?, ?, ?)",
          params![
            entity,
            identifier,
            relationship,
            position,
            target.entity,
            target.identifier
          ],
        )
        .map_err(|e| MediumError::new("store edge", e))?;
      }
    }
    Mutation::Delete { entity, identifier } => {
      tx.execute(
        "DELETE FROM records WHERE entity_type = ? AND resource_identifier = ?",
        params![entity, identifier],
      )
      .map_err(|e| MediumError::new(format!("delete {}/{}", entity, identifier), e))?;

      tx.execute(
        "DELETE FROM edges
         WHERE (entity_type = ?1 AND resource_identifier = ?2)
            OR (target_entity_type = ?1 AND target_identifier = ?2)",
        params![entity, identifier],
      )
      .map_err(|e| MediumError::new("delete edges", e))?;
    }
  }
  Ok(())
}

impl PersistentMedium for SqliteMedium {
  fn load(&self, entity: &str, identifier: &str) -> MediumResult<Option<StoredRecord>> {
    let conn = self.lock();

    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT attributes FROM records
         WHERE entity_type = ? AND resource_identifier = ?",
        params![entity, identifier],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| MediumError::new("query record", e))?;

    let Some(data) = data else {
      return Ok(None);
    };

    Ok(Some(StoredRecord {
      entity: entity.to_string(),
      identifier: identifier.to_string(),
      attributes: decode_attributes(&data)?,
      relationships: load_edges(&conn, entity, identifier)?,
    }))
  }

  fn scan(&self, entity: &str) -> MediumResult<Vec<StoredRecord>> {
    let conn = self.lock();

    let rows: Vec<(String, Vec<u8>)> = {
      let mut stmt = conn
        .prepare(
          "SELECT resource_identifier, attributes FROM records
           WHERE entity_type = ?
           ORDER BY resource_identifier",
        )
        .map_err(|e| MediumError::new("prepare scan", e))?;

      let rows = stmt
        .query_map(params![entity], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| MediumError::new("scan records", e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MediumError::new("read record", e))?;
      rows
    };

    rows
      .into_iter()
      .map(|(identifier, data)| {
        Ok(StoredRecord {
          entity: entity.to_string(),
          attributes: decode_attributes(&data)?,
          relationships: load_edges(&conn, entity, &identifier)?,
          identifier,
        })
      })
      .collect()
  }

  fn contains(&self, entity: &str, identifier: &str) -> MediumResult<bool> {
    let conn = self.lock();

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM records WHERE entity_type = ? AND resource_identifier = ?",
        params![entity, identifier],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| MediumError::new("query record", e))?;

    Ok(found.is_some())
  }

  fn apply(&self, batch: &[Mutation]) -> MediumResult<()> {
    let mut conn = self.lock();

    // Dropping the transaction without commit rolls everything back
    let tx = conn
      .transaction()
      .map_err(|e| MediumError::new("begin transaction", e))?;

    for mutation in batch {
      apply_one(&tx, mutation)?;
    }

    tx.commit()
      .map_err(|e| MediumError::new("commit transaction", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::value::{attributes, AttributeValue};

  fn insert(identifier: &str, name: &str) -> Mutation {
    Mutation::Insert {
      entity: "Person".into(),
      identifier: identifier.into(),
      attributes: attributes([("name", name)]),
    }
  }

  #[test]
  fn test_insert_and_load() {
    let medium = SqliteMedium::open_in_memory().unwrap();
    medium.apply(&[insert("p1", "Ann")]).unwrap();

    let record = medium.load("Person", "p1").unwrap().unwrap();
    assert_eq!(
      record.attributes.get("name"),
      Some(&AttributeValue::String("Ann".into()))
    );
    assert!(medium.contains("Person", "p1").unwrap());
    assert!(!medium.contains("Company", "p1").unwrap());
    assert!(medium.load("Person", "p2").unwrap().is_none());
  }

  #[test]
  fn test_failed_batch_rolls_back() {
    let medium = SqliteMedium::open_in_memory().unwrap();
    medium.apply(&[insert("p1", "Ann")]).unwrap();

    let result = medium.apply(&[
      Mutation::Update {
        entity: "Person".into(),
        identifier: "p1".into(),
        attributes: attributes([("name", "Changed")]),
      },
      insert("p2", "Bob"),
      insert("p1", "Duplicate"),
    ]);
    assert!(result.is_err());

    let record = medium.load("Person", "p1").unwrap().unwrap();
    assert_eq!(
      record.attributes.get("name"),
      Some(&AttributeValue::String("Ann".into()))
    );
    assert!(!medium.contains("Person", "p2").unwrap());
  }

  #[test]
  fn test_edges_keep_order_and_delete_cascades() {
    let medium = SqliteMedium::open_in_memory().unwrap();
    medium
      .apply(&[
        insert("p1", "Ann"),
        insert("p2", "Bob"),
        insert("p3", "Cid"),
        Mutation::Relate {
          entity: "Person".into(),
          identifier: "p1".into(),
          relationship: "friends".into(),
          targets: vec![RecordRef::new("Person", "p3"), RecordRef::new("Person", "p2")],
        },
      ])
      .unwrap();

    let p1 = medium.load("Person", "p1").unwrap().unwrap();
    assert_eq!(
      p1.relationships["friends"],
      vec![RecordRef::new("Person", "p3"), RecordRef::new("Person", "p2")]
    );

    medium
      .apply(&[Mutation::Delete {
        entity: "Person".into(),
        identifier: "p3".into(),
      }])
      .unwrap();

    let p1 = medium.load("Person", "p1").unwrap().unwrap();
    assert_eq!(p1.relationships["friends"], vec![RecordRef::new("Person", "p2")]);

    let identifiers: Vec<String> = medium
      .scan("Person")
      .unwrap()
      .into_iter()
      .map(|r| r.identifier)
      .collect();
    assert_eq!(identifiers, vec!["p1", "p2"]);
  }

  #[test]
  fn test_reopen_persists() {
    let path = std::env::temp_dir().join(format!("backstore-medium-{}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);

    {
      let medium = SqliteMedium::open(&path).unwrap();
      medium.apply(&[insert("p1", "Ann")]).unwrap();
    }

    let medium = SqliteMedium::open(&path).unwrap();
    assert!(medium.contains("Person", "p1").unwrap());

    drop(medium);
    let _ = std::fs::remove_file(&path);
  }
}
