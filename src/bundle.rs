//! Reading program bundles.
//!
//! A bundle is a SQLite file with three tables:
//!
//! - `bindings(id_name, lazy, value, file_name)` — each top-level binding
//!   with its JSON-encoded function body,
//! - `entry_points(id_name)` — the bindings runnable from the command
//!   line,
//! - `depends_ons(id_name, needs)` — the dependency edges between
//!   bindings.
//!
//! The reader is strictly read-only and is dropped before execution
//! begins, so the database handle never outlives the load phase.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, trace};

#[derive(Debug)]
pub enum BundleError {
    /// The underlying database rejected an operation.
    Sqlite(rusqlite::Error),
    /// A binding named nowhere in the bundle.
    UnknownBinding(String),
    /// The bundle declares no entry points and none was requested.
    NoEntryPoint,
    /// Several entry points but none selected.
    AmbiguousEntryPoint(Vec<String>),
}

impl fmt::Display for BundleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "bundle error: {}", err),
            Self::UnknownBinding(name) => write!(f, "binding not found: {}", name),
            Self::NoEntryPoint => write!(f, "bundle has no entry points"),
            Self::AmbiguousEntryPoint(names) => {
                write!(f, "multiple entry points, select one with -e: {}", names.join(", "))
            }
        }
    }
}

impl std::error::Error for BundleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for BundleError {
    fn from(err: rusqlite::Error) -> BundleError {
        BundleError::Sqlite(err)
    }
}

pub type BundleResult<T> = Result<T, BundleError>;

/// One row of the bindings table.
#[derive(Debug, Clone)]
pub struct Binding {
    pub name: String,
    pub lazy: bool,
    /// JSON-encoded function body.
    pub body: String,
    /// Source file the binding was compiled from, for diagnostics.
    pub filename: String,
}

/// Read-only access to one bundle file.
pub struct BundleReader {
    conn: Connection,
    path: PathBuf,
}

impl BundleReader {
    pub fn open(path: &Path) -> BundleResult<BundleReader> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        debug!(target: "filament::bundle", path = %path.display(), "opened bundle");
        Ok(BundleReader { conn, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All declared entry points, in table order.
    pub fn entry_points(&self) -> BundleResult<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT id_name FROM entry_points")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for name in rows {
            names.push(name?);
        }
        Ok(names)
    }

    /// Fetch one binding by name.
    pub fn binding(&self, name: &str) -> BundleResult<Binding> {
        let mut stmt = self
            .conn
            .prepare("SELECT id_name, lazy, value, file_name FROM bindings WHERE id_name = ?1")?;
        let mut rows = stmt.query([name])?;
        match rows.next()? {
            Some(row) => Ok(Binding {
                name: row.get(0)?,
                lazy: row.get::<_, i64>(1)? != 0,
                body: row.get(2)?,
                filename: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            }),
            None => Err(BundleError::UnknownBinding(name.to_string())),
        }
    }

    /// The transitive dependency closure of `name`, including `name`
    /// itself, mapped to each binding's lazy flag. Cycles are fine: a
    /// binding is visited once.
    pub fn dependency_closure(&self, name: &str) -> BundleResult<HashMap<String, bool>> {
        let mut closure = HashMap::new();
        let mut pending = vec![name.to_string()];

        let mut stmt = self.conn.prepare("SELECT needs FROM depends_ons WHERE id_name = ?1")?;
        while let Some(current) = pending.pop() {
            if closure.contains_key(&current) {
                continue;
            }
            let binding = self.binding(&current)?;
            closure.insert(current.clone(), binding.lazy);

            let rows = stmt.query_map([current.as_str()], |row| row.get::<_, String>(0))?;
            for needed in rows {
                let needed = needed?;
                trace!(target: "filament::bundle", binding = %current, needs = %needed, "dependency");
                if !closure.contains_key(&needed) {
                    pending.push(needed);
                }
            }
        }
        Ok(closure)
    }
}

impl fmt::Debug for BundleReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleReader").field("path", &self.path).finish()
    }
}
