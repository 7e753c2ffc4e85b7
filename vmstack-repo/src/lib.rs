// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Persisted line tables stored in repository databases.
//!
//! Units compiled ahead of time live in a repository: an SQLite database
//! whose `UnitLineTable` table holds one encoded line table per unit, keyed
//! by the unit's serial number. A process may have several repositories
//! loaded, told apart by a small repository id.
//!
//! [`RepoStore`] implements [`LineTableStore`] over a set of repository
//! files. Each file is opened read-only the first time it is needed and the
//! connection (or the failure to open it) is kept for the lifetime of the
//! store.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, trace, warn};
use vmstack_common::traits::{LineTableStore, StoreError, UnitId};

/// Base name of the table holding line tables.
pub const LINE_TABLE_TABLE: &str = "UnitLineTable";

/// The result of opening a repository, cached per repository id.
type CachedConnection = Result<Connection, String>;

/// A [`LineTableStore`] reading from repository databases.
#[derive(Debug, Default)]
pub struct RepoStore {
    paths: BTreeMap<i8, PathBuf>,
    schema: Option<String>,
    connections: Mutex<HashMap<i8, CachedConnection>>,
}

fn table_name(schema: Option<&str>) -> String {
    match schema {
        Some(schema) => format!("{}_{}", LINE_TABLE_TABLE, schema),
        None => LINE_TABLE_TABLE.to_string(),
    }
}

fn validate_schema(schema: &str) -> Result<(), StoreError> {
    if schema.is_empty()
        || !schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(StoreError::InvalidSchema(schema.to_string()));
    }
    Ok(())
}

impl RepoStore {
    pub fn new() -> RepoStore {
        Default::default()
    }

    /// Serve repository `repo_id` from the database at `path`.
    pub fn add_repo<P: AsRef<Path>>(&mut self, repo_id: i8, path: P) {
        self.paths.insert(repo_id, path.as_ref().to_path_buf());
    }

    /// Read from `UnitLineTable_<schema>` instead of `UnitLineTable`.
    ///
    /// The suffix may only contain ASCII letters, digits and underscores.
    pub fn set_schema(&mut self, schema: &str) -> Result<(), StoreError> {
        validate_schema(schema)?;
        self.schema = Some(schema.to_string());
        Ok(())
    }

    /// The repository ids this store knows about.
    pub fn repo_ids(&self) -> impl Iterator<Item = i8> + '_ {
        self.paths.keys().copied()
    }

    fn open(repo_id: i8, path: &Path) -> CachedConnection {
        debug!("opening repository {} at {}", repo_id, path.display());
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            warn!("couldn't open repository {} ({}): {}", repo_id, path.display(), e);
            e.to_string()
        })
    }
}

impl LineTableStore for RepoStore {
    fn line_table(&self, unit: UnitId) -> Result<Option<Vec<u8>>, StoreError> {
        let path = match self.paths.get(&unit.repo_id) {
            Some(path) => path,
            None => {
                trace!("no repository with id {}", unit.repo_id);
                return Ok(None);
            }
        };

        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let conn = connections
            .entry(unit.repo_id)
            .or_insert_with(|| RepoStore::open(unit.repo_id, path))
            .as_ref()
            .map_err(|reason| StoreError::Open {
                repo_id: unit.repo_id,
                reason: reason.clone(),
            })?;

        let sql = format!(
            "SELECT data FROM {} WHERE unitSn = ?1",
            table_name(self.schema.as_deref())
        );
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(|e| StoreError::Query(e.to_string()))?;
        stmt.query_row(params![unit.serial_number], |row| row.get::<_, Vec<u8>>(0))
            .optional()
            .map_err(|e| StoreError::Query(e.to_string()))
    }
}

/// Create (or extend) a repository database at `path` holding the given
/// `(serial number, encoded line table)` rows.
pub fn write_line_tables<'a, P, I>(path: P, schema: Option<&str>, tables: I) -> Result<(), StoreError>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = (i64, &'a [u8])>,
{
    if let Some(schema) = schema {
        validate_schema(schema)?;
    }
    let table = table_name(schema);
    let mut conn = Connection::open(path.as_ref()).map_err(|e| StoreError::Open {
        repo_id: -1,
        reason: e.to_string(),
    })?;
    let tx = conn
        .transaction()
        .map_err(|e| StoreError::Query(e.to_string()))?;
    tx.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {} (unitSn INTEGER PRIMARY KEY, data BLOB NOT NULL)",
            table
        ),
        [],
    )
    .map_err(|e| StoreError::Query(e.to_string()))?;
    {
        let mut stmt = tx
            .prepare(&format!(
                "INSERT OR REPLACE INTO {} (unitSn, data) VALUES (?1, ?2)",
                table
            ))
            .map_err(|e| StoreError::Query(e.to_string()))?;
        for (serial_number, data) in tables {
            stmt.execute(params![serial_number, data])
                .map_err(|e| StoreError::Query(e.to_string()))?;
        }
    }
    tx.commit().map_err(|e| StoreError::Query(e.to_string()))
}
