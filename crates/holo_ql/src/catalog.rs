//! Table catalog state and its optional on-disk persistence.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

use holo_tablet::{Schema, TableId, TabletId};

use crate::error::QlError;
use crate::partition::PartitionScheme;

/// Catalog entry for one table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableDesc {
    pub id: TableId,
    pub name: String,
    pub schema: Schema,
    pub partitions: PartitionScheme,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CatalogState {
    next_table_id: TableId,
    next_tablet_id: TabletId,
    tables: BTreeMap<String, TableDesc>,
}

impl Default for CatalogState {
    fn default() -> Self {
        Self {
            next_table_id: 1,
            next_tablet_id: 1,
            tables: BTreeMap::new(),
        }
    }
}

/// Shared catalog. Every mutation is persisted before it returns when a
/// path is configured.
pub struct Catalog {
    state: RwLock<CatalogState>,
    path: Option<PathBuf>,
}

impl Catalog {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(CatalogState::default()),
            path: None,
        }
    }

    /// Load the catalog stored at `path`, or start empty if there is none.
    pub fn load_or_init(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(data) => serde_json::from_slice::<CatalogState>(&data)
                .with_context(|| format!("decode catalog {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CatalogState::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("read catalog {}", path.display()))
            }
        };
        let catalog = Self {
            state: RwLock::new(state),
            path: Some(path),
        };
        catalog.persist()?;
        Ok(catalog)
    }

    pub fn table(&self, name: &str) -> Option<TableDesc> {
        self.read().tables.get(name).cloned()
    }

    pub fn table_by_id(&self, id: TableId) -> Option<TableDesc> {
        self.read().tables.values().find(|t| t.id == id).cloned()
    }

    pub fn tables(&self) -> Vec<TableDesc> {
        self.read().tables.values().cloned().collect()
    }

    /// Register a new table with an even hash partitioning.
    pub fn create_table(
        &self,
        name: &str,
        schema: Schema,
        num_tablets: usize,
        servers: usize,
    ) -> Result<TableDesc, QlError> {
        let desc = {
            let mut state = self.write();
            if state.tables.contains_key(name) {
                return Err(QlError::TableAlreadyExists(name.to_string()));
            }
            let partitions =
                PartitionScheme::hash_partitions(num_tablets, state.next_tablet_id, servers);
            let desc = TableDesc {
                id: state.next_table_id,
                name: name.to_string(),
                schema,
                partitions,
            };
            state.next_table_id += 1;
            state.next_tablet_id += desc.partitions.tablets().len() as TabletId;
            state.tables.insert(name.to_string(), desc.clone());
            desc
        };
        self.persist()?;
        Ok(desc)
    }

    /// Replace a table's schema. The new schema must be exactly one version
    /// ahead.
    pub fn update_schema(&self, name: &str, schema: Schema) -> Result<TableDesc, QlError> {
        let desc = {
            let mut state = self.write();
            let desc = state
                .tables
                .get_mut(name)
                .ok_or_else(|| QlError::TableNotFound(name.to_string()))?;
            if schema.version() != desc.schema.version() + 1 {
                return Err(QlError::InvalidRequest(format!(
                    "schema version {} does not follow {}",
                    schema.version(),
                    desc.schema.version()
                )));
            }
            desc.schema = schema;
            desc.clone()
        };
        self.persist()?;
        Ok(desc)
    }

    pub fn drop_table(&self, name: &str) -> Result<TableDesc, QlError> {
        let desc = self
            .write()
            .tables
            .remove(name)
            .ok_or_else(|| QlError::TableNotFound(name.to_string()))?;
        self.persist()?;
        Ok(desc)
    }

    /// Reserve a fresh tablet id.
    pub fn allocate_tablet_id(&self) -> Result<TabletId, QlError> {
        let id = {
            let mut state = self.write();
            let id = state.next_tablet_id;
            state.next_tablet_id += 1;
            id
        };
        self.persist()?;
        Ok(id)
    }

    pub fn update_partitions(
        &self,
        name: &str,
        partitions: PartitionScheme,
    ) -> Result<TableDesc, QlError> {
        let (desc, previous) = {
            let mut state = self.write();
            let desc = state
                .tables
                .get_mut(name)
                .ok_or_else(|| QlError::TableNotFound(name.to_string()))?;
            let previous = std::mem::replace(&mut desc.partitions, partitions);
            (desc.clone(), previous)
        };
        if let Err(err) = self.persist() {
            if let Some(desc) = self.write().tables.get_mut(name) {
                desc.partitions = previous;
            }
            return Err(err.into());
        }
        Ok(desc)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CatalogState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CatalogState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = {
            let state = self.read();
            serde_json::to_vec_pretty(&*state).context("serialize catalog")?
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create catalog dir")?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data).context("write catalog")?;
        if let Err(err) = fs::rename(&tmp, path) {
            warn!(error = ?err, path = %path.display(), "catalog rename failed");
            return Err(err).context("install catalog");
        }
        Ok(())
    }
}
