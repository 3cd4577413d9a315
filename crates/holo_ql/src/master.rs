//! Master: DDL and tablet placement on top of the catalog.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use holo_tablet::{DataType, Schema, TabletId};

use crate::catalog::{Catalog, TableDesc};
use crate::error::QlError;
use crate::server::TabletServer;

pub struct Master {
    catalog: Catalog,
    servers: Vec<Arc<TabletServer>>,
    default_tablets: usize,
    // Serializes DDL so catalog updates and tablet changes stay in step.
    ddl_lock: Mutex<()>,
}

impl Master {
    pub fn new(catalog: Catalog, servers: Vec<Arc<TabletServer>>, default_tablets: usize) -> Self {
        Self {
            catalog,
            servers,
            default_tablets: default_tablets.max(1),
            ddl_lock: Mutex::new(()),
        }
    }

    /// Open every tablet the catalog knows about on its server.
    pub fn recover_tablets(&self) -> anyhow::Result<usize> {
        let mut opened = 0usize;
        for desc in self.catalog.tables() {
            let schema = Arc::new(desc.schema.clone());
            for tablet in desc.partitions.tablets() {
                let server = self.server(tablet.server)?;
                server.open_tablet(tablet.tablet_id, desc.id, schema.clone(), tablet.hash_range)?;
                opened += 1;
            }
        }
        Ok(opened)
    }

    fn server(&self, idx: usize) -> anyhow::Result<&Arc<TabletServer>> {
        self.servers
            .get(idx)
            .ok_or_else(|| anyhow::anyhow!("tablet server {idx} does not exist"))
    }

    pub fn table(&self, name: &str) -> Result<TableDesc, QlError> {
        self.catalog
            .table(name)
            .ok_or_else(|| QlError::TableNotFound(name.to_string()))
    }

    pub fn table_by_id(&self, id: holo_tablet::TableId) -> Result<TableDesc, QlError> {
        self.catalog
            .table_by_id(id)
            .ok_or_else(|| QlError::TableNotFound(format!("#{id}")))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.catalog.tables().into_iter().map(|t| t.name).collect()
    }

    /// Create a table split into `num_tablets` tablets (0 picks the default).
    pub fn create_table(
        &self,
        name: &str,
        schema: Schema,
        num_tablets: usize,
    ) -> Result<TableDesc, QlError> {
        let _ddl = self.ddl_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let num_tablets = if num_tablets == 0 {
            self.default_tablets
        } else {
            num_tablets
        };
        let desc = self
            .catalog
            .create_table(name, schema, num_tablets, self.servers.len())?;
        let schema = Arc::new(desc.schema.clone());
        for tablet in desc.partitions.tablets() {
            self.server(tablet.server)?.open_tablet(
                tablet.tablet_id,
                desc.id,
                schema.clone(),
                tablet.hash_range,
            )?;
        }
        info!(
            table = name,
            table_id = desc.id,
            tablets = desc.partitions.tablets().len(),
            "table created"
        );
        Ok(desc)
    }

    /// Add value columns, bumping the schema version once per column, and
    /// push the final schema to every tablet.
    pub fn add_columns(
        &self,
        name: &str,
        columns: &[(String, DataType, bool)],
    ) -> Result<TableDesc, QlError> {
        let _ddl = self.ddl_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut desc = self.table(name)?;
        for (column, data_type, not_null) in columns {
            let next = desc.schema.with_added_column(column, *data_type, *not_null)?;
            desc = self.catalog.update_schema(name, next)?;
        }
        let schema = Arc::new(desc.schema.clone());
        for tablet in desc.partitions.tablets() {
            if let Some(live) = self.server(tablet.server)?.tablet(tablet.tablet_id) {
                live.update_schema(schema.clone());
            }
        }
        info!(
            table = name,
            schema_version = desc.schema.version(),
            "table altered"
        );
        Ok(desc)
    }

    pub fn drop_table(&self, name: &str) -> Result<(), QlError> {
        let _ddl = self.ddl_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let desc = self.catalog.drop_table(name)?;
        for tablet in desc.partitions.tablets() {
            self.server(tablet.server)?.remove_tablet(tablet.tablet_id)?;
        }
        info!(table = name, table_id = desc.id, "table dropped");
        Ok(())
    }

    /// Split a tablet at the midpoint of its hash range, placing the upper
    /// half on the next server round-robin. Returns the new tablet's id.
    pub fn split_tablet(&self, name: &str, tablet_id: TabletId) -> Result<TabletId, QlError> {
        let _ddl = self.ddl_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let desc = self.table(name)?;
        let source_desc = desc
            .partitions
            .tablet(tablet_id)
            .cloned()
            .ok_or(QlError::TabletNotFound(tablet_id))?;
        let source = self
            .server(source_desc.server)?
            .tablet(tablet_id)
            .ok_or(QlError::TabletNotFound(tablet_id))?;

        let new_tablet_id = self.catalog.allocate_tablet_id()?;
        let target_server = (source_desc.server + 1) % self.servers.len().max(1);
        let mut partitions = desc.partitions.clone();
        let split_at = partitions.split(tablet_id, new_tablet_id, target_server)?;

        let upper = partitions
            .tablet(new_tablet_id)
            .map(|t| t.hash_range)
            .ok_or(QlError::TabletNotFound(new_tablet_id))?;
        let target = self.server(target_server)?.open_tablet(
            new_tablet_id,
            desc.id,
            source.schema(),
            upper,
        )?;
        // The catalog flips inside the split so writers bounced by the source
        // already find the new layout when they refresh.
        let split = source.split_into(split_at, &target, || {
            self.catalog
                .update_partitions(name, partitions)
                .map(|_| ())
                .map_err(anyhow::Error::from)
        });
        let moved = match split {
            Ok(moved) => moved,
            Err(err) => {
                if let Err(cleanup) = self.server(target_server)?.remove_tablet(new_tablet_id) {
                    warn!(
                        table = name,
                        new_tablet_id,
                        error = ?cleanup,
                        "failed to remove tablet of an aborted split"
                    );
                }
                return Err(err.into());
            }
        };
        info!(
            table = name,
            tablet_id,
            new_tablet_id,
            split_at,
            moved,
            "tablet split committed"
        );
        Ok(new_tablet_id)
    }
}
