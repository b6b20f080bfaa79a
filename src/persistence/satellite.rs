//! No-op drivers for satellite mode
//!
//! A satellite keeps controller-pushed state in memory only: nothing is ever
//! found in the store and every write succeeds without effect.

use super::{PersistenceDriver, PropsDriver, Record};
use crate::error::Result;
use crate::transaction::TransactionalStore;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct SatelliteDatabase;

impl SatelliteDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl<R: Record> PersistenceDriver<R> for SatelliteDatabase {
    fn create(&self, _record: &R) -> Result<()> {
        Ok(())
    }

    fn load(&self, _key: &R::Key) -> Result<Option<R>> {
        Ok(None)
    }

    fn load_all(&self) -> Result<Vec<R>> {
        Ok(Vec::new())
    }

    fn delete(&self, _key: &R::Key) -> Result<()> {
        Ok(())
    }

    fn exists(&self, _key: &R::Key) -> Result<bool> {
        Ok(false)
    }

    fn update_field(&self, _key: &R::Key, _field: &'static str, _value: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

impl PropsDriver for SatelliteDatabase {
    fn persist(&self, _instance: &str, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _instance: &str, _key: &str) -> Result<()> {
        Ok(())
    }

    fn remove_all(&self, _instance: &str) -> Result<()> {
        Ok(())
    }

    fn load_all(&self, _instance: &str) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
}

impl TransactionalStore for SatelliteDatabase {
    fn write_batch(&self, flush: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        flush()
    }
}
