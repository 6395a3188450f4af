//! Versioned schema migrations for the `metrics` table.
//!
//! Migrations are embedded JSON scripts that add columns to the table
//! manifest kept in the object store:
//!
//! ```text
//! _schema/version.json   {"version": 2, "dirty": false}
//! _schema/metrics.json   {"table": "metrics", "version": 2, "columns": [...]}
//! ```
//!
//! Each step marks the version dirty, writes the new manifest, then clears
//! the flag. A dirty marker means a previous run stopped mid-step and needs
//! an operator; it is never repaired automatically.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use object_store::path::Path;
use object_store::ObjectStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::schema::{metrics_storage_schema, METRICS_TABLE};
use crate::QanError;

const SCHEMA_DIR: &str = "_schema";

const EMBEDDED: &[(&str, &str)] = &[
    (
        "0001_create_metrics.json",
        include_str!("../migrations/0001_create_metrics.json"),
    ),
    (
        "0002_add_client_tags.json",
        include_str!("../migrations/0002_add_client_tags.json"),
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Utf8,
    Int64,
    UInt64,
    Float64,
}

impl ColumnType {
    const fn data_type(self) -> DataType {
        match self {
            Self::Utf8 => DataType::Utf8,
            Self::Int64 => DataType::Int64,
            Self::UInt64 => DataType::UInt64,
            Self::Float64 => DataType::Float64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub nullable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddColumn {
    #[serde(flatten)]
    pub column: Column,
    /// Insert after this column instead of appending.
    #[serde(default)]
    pub after: Option<String>,
}

/// One embedded migration script.
#[derive(Debug, Clone, Deserialize)]
pub struct Migration {
    pub version: u32,
    pub name: String,
    pub add_columns: Vec<AddColumn>,
}

/// Stored description of the table at some version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub table: String,
    pub version: u32,
    pub columns: Vec<Column>,
}

impl Manifest {
    fn empty() -> Self {
        Self {
            table: METRICS_TABLE.to_owned(),
            version: 0,
            columns: Vec::new(),
        }
    }

    fn apply(&mut self, migration: &Migration) -> Result<(), QanError> {
        for add in &migration.add_columns {
            if self.columns.iter().any(|c| c.name == add.column.name) {
                return Err(QanError::Migration(format!(
                    "migration {} adds existing column {}",
                    migration.version, add.column.name
                )));
            }
            let position = match &add.after {
                Some(after) => {
                    let index = self
                        .columns
                        .iter()
                        .position(|c| &c.name == after)
                        .ok_or_else(|| {
                            QanError::Migration(format!(
                                "migration {} references unknown column {after}",
                                migration.version
                            ))
                        })?;
                    index + 1
                }
                None => self.columns.len(),
            };
            self.columns.insert(position, add.column.clone());
        }
        self.version = migration.version;
        Ok(())
    }

    pub fn to_schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.columns
                .iter()
                .map(|c| Field::new(&c.name, c.column_type.data_type(), c.nullable))
                .collect::<Vec<_>>(),
        ))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct VersionMarker {
    version: u32,
    dirty: bool,
}

/// Result of [`apply_pending`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Applied { from: u32, to: u32 },
    NoChange { version: u32 },
}

/// Parse the embedded scripts. Versions must run 1, 2, 3... without gaps.
pub fn embedded() -> Result<Vec<Migration>, QanError> {
    let mut migrations = Vec::with_capacity(EMBEDDED.len());
    for (file, text) in EMBEDDED {
        let migration: Migration = serde_json::from_str(text)
            .map_err(|e| QanError::Migration(format!("{file}: {e}")))?;
        migrations.push(migration);
    }

    for (expected, migration) in (1..).zip(&migrations) {
        if migration.version != expected {
            return Err(QanError::Migration(format!(
                "expected migration version {expected}, found {} ({})",
                migration.version, migration.name
            )));
        }
    }
    Ok(migrations)
}

/// Bring the stored schema up to the latest embedded version.
///
/// Any error is fatal: the caller must not start serving.
pub async fn apply_pending(store: &dyn ObjectStore) -> Result<MigrationOutcome, QanError> {
    let migrations = embedded()?;
    let (outcome, manifest) = apply_migrations(store, &migrations).await?;

    let expected = metrics_storage_schema();
    if manifest.to_schema().fields() != expected.fields() {
        return Err(QanError::Migration(format!(
            "stored schema at version {} does not match the compiled storage schema",
            manifest.version
        )));
    }

    Ok(outcome)
}

/// Read the table schema recorded by the last migration.
pub async fn load_table_schema(store: &dyn ObjectStore) -> Result<SchemaRef, QanError> {
    let manifest: Manifest = read_json(store, &manifest_path())
        .await?
        .ok_or_else(|| QanError::Migration("no table manifest; migrations not applied".to_owned()))?;
    Ok(manifest.to_schema())
}

async fn apply_migrations(
    store: &dyn ObjectStore,
    migrations: &[Migration],
) -> Result<(MigrationOutcome, Manifest), QanError> {
    let latest = migrations.last().map_or(0, |m| m.version);
    let marker: VersionMarker = read_json(store, &version_path()).await?.unwrap_or_default();

    if marker.dirty {
        return Err(QanError::Migration(format!(
            "schema version {} is dirty; a previous migration did not complete",
            marker.version
        )));
    }
    if marker.version > latest {
        return Err(QanError::Migration(format!(
            "stored schema version {} is newer than the latest known version {latest}",
            marker.version
        )));
    }

    let mut manifest = if marker.version == 0 {
        Manifest::empty()
    } else {
        read_json(store, &manifest_path()).await?.ok_or_else(|| {
            QanError::Migration(format!(
                "schema version {} has no table manifest",
                marker.version
            ))
        })?
    };

    if marker.version == latest {
        tracing::info!(version = latest, "Schema is up to date");
        return Ok((MigrationOutcome::NoChange { version: latest }, manifest));
    }

    for migration in migrations.iter().filter(|m| m.version > marker.version) {
        write_json(
            store,
            &version_path(),
            &VersionMarker {
                version: migration.version,
                dirty: true,
            },
        )
        .await?;

        manifest.apply(migration)?;
        write_json(store, &manifest_path(), &manifest).await?;

        write_json(
            store,
            &version_path(),
            &VersionMarker {
                version: migration.version,
                dirty: false,
            },
        )
        .await?;

        tracing::info!(
            version = migration.version,
            name = %migration.name,
            "Applied schema migration"
        );
    }

    Ok((
        MigrationOutcome::Applied {
            from: marker.version,
            to: latest,
        },
        manifest,
    ))
}

fn version_path() -> Path {
    Path::from(SCHEMA_DIR).child("version.json")
}

fn manifest_path() -> Path {
    Path::from(SCHEMA_DIR).child(format!("{METRICS_TABLE}.json"))
}

async fn read_json<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    path: &Path,
) -> Result<Option<T>, QanError> {
    let bytes = match store.get(path).await {
        Ok(result) => result.bytes().await?,
        Err(object_store::Error::NotFound { .. }) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value = serde_json::from_slice(&bytes).map_err(|source| QanError::Json { source })?;
    Ok(Some(value))
}

async fn write_json<T: Serialize>(
    store: &dyn ObjectStore,
    path: &Path,
    value: &T,
) -> Result<(), QanError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| QanError::Json { source })?;
    store.put(path, bytes.into()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    #[test]
    fn embedded_migrations_are_contiguous() {
        let migrations = embedded().unwrap();
        assert_eq!(migrations.len(), EMBEDDED.len());
        assert_eq!(migrations[0].version, 1);
    }

    #[tokio::test]
    async fn fresh_store_migrates_to_latest() {
        let store = InMemory::new();

        let outcome = apply_pending(&store).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Applied { from: 0, to: 2 });

        let schema = load_table_schema(&store).await.unwrap();
        assert_eq!(schema.fields(), metrics_storage_schema().fields());
    }

    #[tokio::test]
    async fn second_run_is_noop() {
        let store = InMemory::new();
        apply_pending(&store).await.unwrap();

        let outcome = apply_pending(&store).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::NoChange { version: 2 });
    }

    #[tokio::test]
    async fn partially_migrated_store_upgrades() {
        let store = InMemory::new();
        let migrations = embedded().unwrap();
        apply_migrations(&store, &migrations[..1]).await.unwrap();

        let old = load_table_schema(&store).await.unwrap();
        assert!(old.field_with_name("username").is_err());

        let outcome = apply_pending(&store).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Applied { from: 1, to: 2 });
    }

    #[tokio::test]
    async fn dirty_marker_is_fatal() {
        let store = InMemory::new();
        write_json(
            &store,
            &version_path(),
            &VersionMarker {
                version: 1,
                dirty: true,
            },
        )
        .await
        .unwrap();

        let err = apply_pending(&store).await.unwrap_err();
        assert!(matches!(err, QanError::Migration(msg) if msg.contains("dirty")));
    }

    #[tokio::test]
    async fn newer_marker_is_fatal() {
        let store = InMemory::new();
        write_json(
            &store,
            &version_path(),
            &VersionMarker {
                version: 99,
                dirty: false,
            },
        )
        .await
        .unwrap();

        let err = apply_pending(&store).await.unwrap_err();
        assert!(matches!(err, QanError::Migration(msg) if msg.contains("newer")));
    }

    #[test]
    fn duplicate_column_rejected() {
        let mut manifest = Manifest::empty();
        let migration: Migration = serde_json::from_str(
            r#"{"version": 1, "name": "dup", "add_columns": [
                {"name": "a", "type": "utf8", "nullable": false},
                {"name": "a", "type": "int64", "nullable": false}
            ]}"#,
        )
        .unwrap();

        assert!(manifest.apply(&migration).is_err());
    }
}
