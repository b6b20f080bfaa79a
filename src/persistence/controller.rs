//! Controller Database
//!
//! Table store used by the controller. Rows are kept as JSON values per
//! table; property rows per instance path. Optionally bound to a file that
//! every successful write batch is written through to.

use super::{PersistenceDriver, PropsDriver, Record};
use crate::error::{Error, Result};
use crate::transaction::TransactionalStore;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File format version
const FORMAT_VERSION: u32 = 1;

/// Backend name reported in availability errors
const BACKEND_NAME: &str = "controller-db";

// =============================================================================
// Tables
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    /// table -> primary key -> row
    rows: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    /// instance path -> key -> value
    props: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatabaseFile {
    version: u32,
    saved_at: DateTime<Utc>,
    tables: Tables,
}

// =============================================================================
// Controller Database
// =============================================================================

pub struct ControllerDatabase {
    /// Live tables
    tables: RwLock<Tables>,
    /// Serializes write batches
    batch: Mutex<()>,
    /// Write-through target
    path: Option<PathBuf>,
    /// Is backend available
    available: AtomicBool,
    /// Committed batches
    batches: AtomicU64,
}

impl ControllerDatabase {
    /// Database without a backing file
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::with_tables(Tables::default(), None))
    }

    /// Open (or create) a database bound to `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let file: DatabaseFile = serde_json::from_slice(&fs::read(&path)?)?;
            if file.version != FORMAT_VERSION {
                return Err(Error::Persistence(format!(
                    "unsupported database format version {} in {}",
                    file.version,
                    path.display()
                )));
            }
            info!(
                path = %path.display(),
                saved_at = %file.saved_at,
                tables = file.tables.rows.len(),
                "Opened controller database"
            );
            file.tables
        } else {
            info!(path = %path.display(), "Creating new controller database");
            Tables::default()
        };
        Ok(Arc::new(Self::with_tables(tables, Some(path))))
    }

    fn with_tables(tables: Tables, path: Option<PathBuf>) -> Self {
        Self {
            tables: RwLock::new(tables),
            batch: Mutex::new(()),
            path,
            available: AtomicBool::new(true),
            batches: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Set availability (for testing)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Check if available
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Number of committed write batches
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Number of rows in `table`
    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .rows
            .get(table)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Write the current tables to the bound file, if any
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = DatabaseFile {
            version: FORMAT_VERSION,
            saved_at: Utc::now(),
            tables: self.tables.read().clone(),
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "Saved controller database");
        Ok(())
    }

    fn check_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::BackendUnavailable {
                backend: BACKEND_NAME.to_string(),
            })
        }
    }

    fn missing_row(table: &str, pk: &str) -> Error {
        Error::Persistence(format!("no row {} in table {}", pk, table))
    }
}

impl std::fmt::Debug for ControllerDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerDatabase")
            .field("path", &self.path)
            .field("available", &self.is_available())
            .finish()
    }
}

// =============================================================================
// Entity Rows
// =============================================================================

impl<R: Record> PersistenceDriver<R> for ControllerDatabase {
    fn create(&self, record: &R) -> Result<()> {
        self.check_available()?;
        let pk = R::row_key(&record.key());
        let row = serde_json::to_value(record)?;

        let mut tables = self.tables.write();
        let table = tables.rows.entry(R::TABLE.to_string()).or_default();
        if table.contains_key(&pk) {
            return Err(Error::Persistence(format!(
                "duplicate primary key {} in table {}",
                pk,
                R::TABLE
            )));
        }
        table.insert(pk, row);
        Ok(())
    }

    fn load(&self, key: &R::Key) -> Result<Option<R>> {
        self.check_available()?;
        let pk = R::row_key(key);
        let row = self
            .tables
            .read()
            .rows
            .get(R::TABLE)
            .and_then(|table| table.get(&pk))
            .cloned();
        Ok(row.map(serde_json::from_value).transpose()?)
    }

    fn load_all(&self) -> Result<Vec<R>> {
        self.check_available()?;
        let rows: Vec<serde_json::Value> = self
            .tables
            .read()
            .rows
            .get(R::TABLE)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default();
        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(Error::from))
            .collect()
    }

    fn delete(&self, key: &R::Key) -> Result<()> {
        self.check_available()?;
        let pk = R::row_key(key);
        self.tables
            .write()
            .rows
            .get_mut(R::TABLE)
            .and_then(|table| table.remove(&pk))
            .map(|_| ())
            .ok_or_else(|| Self::missing_row(R::TABLE, &pk))
    }

    fn exists(&self, key: &R::Key) -> Result<bool> {
        self.check_available()?;
        let pk = R::row_key(key);
        Ok(self
            .tables
            .read()
            .rows
            .get(R::TABLE)
            .map(|table| table.contains_key(&pk))
            .unwrap_or(false))
    }

    fn update_field(&self, key: &R::Key, field: &'static str, value: serde_json::Value) -> Result<()> {
        self.check_available()?;
        let pk = R::row_key(key);
        let mut tables = self.tables.write();
        let row = tables
            .rows
            .get_mut(R::TABLE)
            .and_then(|table| table.get_mut(&pk))
            .ok_or_else(|| Self::missing_row(R::TABLE, &pk))?;
        let columns = row.as_object_mut().ok_or_else(|| {
            Error::Persistence(format!("row {} in table {} is not an object", pk, R::TABLE))
        })?;
        columns.insert(field.to_string(), value);
        Ok(())
    }
}

// =============================================================================
// Property Rows
// =============================================================================

impl PropsDriver for ControllerDatabase {
    fn persist(&self, instance: &str, key: &str, value: &str) -> Result<()> {
        self.check_available()?;
        self.tables
            .write()
            .props
            .entry(instance.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, instance: &str, key: &str) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.write();
        if let Some(props) = tables.props.get_mut(instance) {
            props.remove(key);
            if props.is_empty() {
                tables.props.remove(instance);
            }
        }
        Ok(())
    }

    fn remove_all(&self, instance: &str) -> Result<()> {
        self.check_available()?;
        self.tables.write().props.remove(instance);
        Ok(())
    }

    fn load_all(&self, instance: &str) -> Result<BTreeMap<String, String>> {
        self.check_available()?;
        Ok(self
            .tables
            .read()
            .props
            .get(instance)
            .cloned()
            .unwrap_or_default())
    }
}

// =============================================================================
// Write Batches
// =============================================================================

impl TransactionalStore for ControllerDatabase {
    fn write_batch(&self, flush: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let _batch = self.batch.lock();
        self.check_available()?;

        let snapshot = self.tables.read().clone();
        let outcome = flush().and_then(|()| self.save());
        if let Err(e) = outcome {
            *self.tables.write() = snapshot;
            warn!(error = %e, "Write batch failed, store restored");
            return Err(e);
        }

        self.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
