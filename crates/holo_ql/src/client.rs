//! Client handle: table DDL, table handles and the partition meta cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use tracing::{debug, info};

use holo_tablet::{ColumnId, DataType, Schema, TableId, Value, WriteKind};

use crate::catalog::TableDesc;
use crate::config::{ClientConfig, SessionConfig};
use crate::error::QlError;
use crate::master::Master;
use crate::op::{ReadOp, WriteOp};
use crate::partition::{PartitionScheme, Route};
use crate::server::TabletTransport;
use crate::session::Session;

/// Cheap to clone; clones share the meta cache and the closed flag.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    master: Arc<Master>,
    transport: Arc<dyn TabletTransport>,
    meta_cache: RwLock<HashMap<TableId, Arc<PartitionScheme>>>,
    closed: AtomicBool,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        master: Arc<Master>,
        transport: Arc<dyn TabletTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                master,
                transport,
                meta_cache: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub(crate) fn transport(&self) -> &Arc<dyn TabletTransport> {
        &self.inner.transport
    }

    fn ensure_open(&self) -> Result<(), QlError> {
        if self.is_closed() {
            return Err(QlError::ClientClosed);
        }
        Ok(())
    }

    /// Create a table with `num_tablets` tablets; 0 uses the cluster default.
    pub async fn create_table(
        &self,
        name: &str,
        schema: Schema,
        num_tablets: usize,
    ) -> Result<Table, QlError> {
        self.ensure_open()?;
        let desc = self.inner.master.create_table(name, schema, num_tablets)?;
        Ok(self.table_handle(desc))
    }

    /// Open a table, retrying while it is not visible yet.
    pub async fn open_table(&self, name: &str) -> Result<Table, QlError> {
        self.ensure_open()?;
        let deadline = Instant::now() + self.inner.config.open_table_timeout;
        let mut backoff = self.inner.config.open_table_backoff;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.inner.master.table(name) {
                Ok(desc) => return Ok(self.table_handle(desc)),
                Err(QlError::TableNotFound(_)) if Instant::now() + backoff < deadline => {
                    debug!(table = name, attempts, backoff = ?backoff, "table not visible yet");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.inner.config.open_table_max_backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn alter_table(&self, name: &str) -> AlterTable {
        AlterTable {
            client: self.clone(),
            name: name.to_string(),
            columns: Vec::new(),
        }
    }

    pub async fn delete_table(&self, name: &str) -> Result<(), QlError> {
        self.ensure_open()?;
        let desc = self.inner.master.table(name)?;
        self.inner.master.drop_table(name)?;
        self.inner
            .meta_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&desc.id);
        Ok(())
    }

    pub fn list_tables(&self) -> Vec<String> {
        self.inner.master.table_names()
    }

    /// Session with the client's default session settings.
    pub fn new_session(&self) -> Session {
        self.new_session_with(self.inner.config.session.clone())
    }

    pub fn new_session_with(&self, config: SessionConfig) -> Session {
        Session::new(self.clone(), config)
    }

    /// Close the client. Sessions built from it move to the errored state.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!("client closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn table_handle(&self, desc: TableDesc) -> Table {
        self.remember(desc.id, &desc.partitions);
        Table::new(desc)
    }

    /// Cache a partition scheme unless a newer one is already known.
    fn remember(&self, table_id: TableId, partitions: &PartitionScheme) -> bool {
        let mut cache = self
            .inner
            .meta_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match cache.get(&table_id) {
            Some(cached) if cached.epoch() >= partitions.epoch() => false,
            _ => {
                cache.insert(table_id, Arc::new(partitions.clone()));
                true
            }
        }
    }

    fn partitions(&self, table: &Table) -> Arc<PartitionScheme> {
        let cached = self
            .inner
            .meta_cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&table.id())
            .cloned();
        match cached {
            Some(partitions) => partitions,
            None => {
                self.remember(table.id(), table.partitions());
                Arc::new(table.partitions().clone())
            }
        }
    }

    /// Route a row of `table` to the tablet owning its hash-key values.
    pub fn locate(&self, table: &Table, hash_values: &[Value]) -> Result<Route, QlError> {
        self.partitions(table).route(table.schema(), hash_values)
    }

    /// Reload a table's partitions from the master. Returns whether the
    /// cached layout changed.
    pub fn refresh(&self, table_id: TableId) -> Result<bool, QlError> {
        let desc = self.inner.master.table_by_id(table_id)?;
        let changed = self.remember(table_id, &desc.partitions);
        if changed {
            debug!(
                table_id,
                epoch = desc.partitions.epoch(),
                "partition cache refreshed"
            );
        }
        Ok(changed)
    }
}

/// Handle to one table at one schema version.
#[derive(Clone, Debug)]
pub struct Table {
    desc: Arc<TableDesc>,
}

impl Table {
    fn new(desc: TableDesc) -> Self {
        Self {
            desc: Arc::new(desc),
        }
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn id(&self) -> TableId {
        self.desc.id
    }

    pub fn schema(&self) -> &Schema {
        &self.desc.schema
    }

    /// Partitioning as of when the handle was opened.
    pub fn partitions(&self) -> &PartitionScheme {
        &self.desc.partitions
    }

    pub fn column_id(&self, name: &str) -> Option<ColumnId> {
        self.desc.schema.column(name).map(|c| c.id)
    }

    pub fn new_write_op(&self, kind: WriteKind) -> WriteOp {
        WriteOp::new(self.clone(), kind)
    }

    pub fn new_insert_op(&self) -> WriteOp {
        self.new_write_op(WriteKind::Insert)
    }

    pub fn new_update_op(&self) -> WriteOp {
        self.new_write_op(WriteKind::Update)
    }

    pub fn new_delete_op(&self) -> WriteOp {
        self.new_write_op(WriteKind::Delete)
    }

    pub fn new_read_op(&self) -> ReadOp {
        ReadOp::new(self.clone())
    }
}

/// Pending ALTER TABLE. Each added column bumps the schema version by one.
pub struct AlterTable {
    client: Client,
    name: String,
    columns: Vec<(String, DataType, bool)>,
}

impl AlterTable {
    pub fn add_column(mut self, name: &str, data_type: DataType) -> Self {
        self.columns.push((name.to_string(), data_type, false));
        self
    }

    /// Mark the most recently added column NOT NULL.
    pub fn not_null(mut self) -> Self {
        if let Some(last) = self.columns.last_mut() {
            last.2 = true;
        }
        self
    }

    /// Apply the alteration and return a handle at the new schema version.
    pub async fn apply(self) -> Result<Table, QlError> {
        self.client.ensure_open()?;
        if self.columns.is_empty() {
            return Err(QlError::InvalidRequest(format!(
                "alter of table {} has no changes",
                self.name
            )));
        }
        let desc = self.client.inner.master.add_columns(&self.name, &self.columns)?;
        Ok(self.client.table_handle(desc))
    }
}
