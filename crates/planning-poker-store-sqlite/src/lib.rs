use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS extension_fields (
  extension_id TEXT NOT NULL CHECK (length(trim(extension_id)) > 0),
  field_key TEXT NOT NULL CHECK (length(trim(field_key)) > 0),
  value_json TEXT NOT NULL,
  revision INTEGER NOT NULL CHECK (revision >= 1),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (extension_id, field_key)
);

CREATE INDEX IF NOT EXISTS idx_extension_fields_updated_at ON extension_fields(updated_at);
";

/// Extension-scoped key/value storage: one JSON value per
/// `(extension_id, field_key)`, overwritten whole on every write.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldRecord {
    pub extension_id: String,
    pub field_key: String,
    pub value: serde_json::Value,
    pub revision: u64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WriteOutcome {
    Written { revision: u64 },
    Conflict { current_revision: Option<u64> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub field_count: usize,
    pub unparsable_fields: Vec<String>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed field store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration_1()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration v1")?;
        Ok(())
    }

    /// Read one field. A missing field is `Ok(None)`, never an error.
    ///
    /// # Errors
    /// Returns an error when the lookup fails or the stored JSON cannot be decoded.
    pub fn read_field(&self, extension_id: &str, field_key: &str) -> Result<Option<FieldRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT value_json, revision, updated_at
                 FROM extension_fields
                 WHERE extension_id = ?1 AND field_key = ?2",
                params![extension_id, field_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to read field {extension_id}/{field_key}"))?;

        let Some((value_json, revision, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(FieldRecord {
            extension_id: extension_id.to_string(),
            field_key: field_key.to_string(),
            value: serde_json::from_str(&value_json).with_context(|| {
                format!("failed to deserialize stored value for {extension_id}/{field_key}")
            })?,
            revision: revision_from_sql(revision)?,
            updated_at,
        }))
    }

    /// Overwrite one field unconditionally and return its new revision.
    ///
    /// # Errors
    /// Returns an error when the key is blank, serialization fails, or the write fails.
    pub fn write_field(
        &mut self,
        extension_id: &str,
        field_key: &str,
        value: &serde_json::Value,
    ) -> Result<u64> {
        validate_key(extension_id, field_key)?;
        let value_json = serde_json::to_string(value).context("failed to serialize field value")?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        let revision = current_revision(&tx, extension_id, field_key)?.map_or(1, |rev| rev + 1);
        upsert_field(&tx, extension_id, field_key, &value_json, revision)?;
        tx.commit().context("failed to commit field write")?;
        Ok(revision)
    }

    /// Overwrite one field only if its revision still equals `expected_revision`
    /// (`None` means the field must not exist yet).
    ///
    /// # Errors
    /// Returns an error when the key is blank, serialization fails, or the write fails.
    /// A revision mismatch is reported as [`WriteOutcome::Conflict`], not as an error.
    pub fn write_field_if_revision(
        &mut self,
        extension_id: &str,
        field_key: &str,
        value: &serde_json::Value,
        expected_revision: Option<u64>,
    ) -> Result<WriteOutcome> {
        validate_key(extension_id, field_key)?;
        let value_json = serde_json::to_string(value).context("failed to serialize field value")?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        let current = current_revision(&tx, extension_id, field_key)?;
        if current != expected_revision {
            return Ok(WriteOutcome::Conflict { current_revision: current });
        }

        let revision = current.map_or(1, |rev| rev + 1);
        upsert_field(&tx, extension_id, field_key, &value_json, revision)?;
        tx.commit().context("failed to commit conditional field write")?;
        Ok(WriteOutcome::Written { revision })
    }

    /// List stored fields, optionally restricted to one extension.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_fields(&self, extension_id: Option<&str>) -> Result<Vec<FieldRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT extension_id, field_key, value_json, revision, updated_at
             FROM extension_fields
             WHERE ?1 IS NULL OR extension_id = ?1
             ORDER BY extension_id ASC, field_key ASC",
        )?;
        let mut rows = stmt.query(params![extension_id])?;
        let mut fields = Vec::new();

        while let Some(row) = rows.next()? {
            let extension_id: String = row.get(0)?;
            let field_key: String = row.get(1)?;
            let value_json: String = row.get(2)?;
            fields.push(FieldRecord {
                value: serde_json::from_str(&value_json).with_context(|| {
                    format!("failed to deserialize stored value for {extension_id}/{field_key}")
                })?,
                revision: revision_from_sql(row.get(3)?)?,
                updated_at: row.get(4)?,
                extension_id,
                field_key,
            });
        }

        Ok(fields)
    }

    /// Write a consistent `SQLite` backup of this database to `out_file`.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, stored-value decoding, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let mut field_count = 0_usize;
        let mut unparsable_fields = Vec::new();

        if schema_status.current_version >= 1 {
            let mut stmt = self
                .conn
                .prepare("SELECT extension_id, field_key, value_json FROM extension_fields")
                .context("failed to prepare field scan")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                field_count += 1;
                let value_json: String = row.get(2)?;
                if serde_json::from_str::<serde_json::Value>(&value_json).is_err() {
                    let extension_id: String = row.get(0)?;
                    let field_key: String = row.get(1)?;
                    unparsable_fields.push(format!("{extension_id}/{field_key}"));
                }
            }
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            field_count,
            unparsable_fields,
            schema_status,
        })
    }
}

fn validate_key(extension_id: &str, field_key: &str) -> Result<()> {
    if extension_id.trim().is_empty() {
        return Err(anyhow!("extension_id MUST be provided for every field write"));
    }
    if field_key.trim().is_empty() {
        return Err(anyhow!("field_key MUST be provided for every field write"));
    }
    Ok(())
}

fn current_revision(conn: &Connection, extension_id: &str, field_key: &str) -> Result<Option<u64>> {
    let revision = conn
        .query_row(
            "SELECT revision FROM extension_fields WHERE extension_id = ?1 AND field_key = ?2",
            params![extension_id, field_key],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .with_context(|| format!("failed to read revision for {extension_id}/{field_key}"))?;
    revision.map(revision_from_sql).transpose()
}

fn upsert_field(
    conn: &Connection,
    extension_id: &str,
    field_key: &str,
    value_json: &str,
    revision: u64,
) -> Result<()> {
    let revision = i64::try_from(revision).context("field revision exceeds sqlite range")?;
    conn.execute(
        "INSERT INTO extension_fields(extension_id, field_key, value_json, revision, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(extension_id, field_key) DO UPDATE SET
           value_json = excluded.value_json,
           revision = excluded.revision,
           updated_at = excluded.updated_at",
        params![extension_id, field_key, value_json, revision, now_rfc3339()?],
    )
    .with_context(|| format!("failed to write field {extension_id}/{field_key}"))?;
    Ok(())
}

fn revision_from_sql(raw: i64) -> Result<u64> {
    u64::try_from(raw).with_context(|| format!("invalid stored revision: {raw}"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
