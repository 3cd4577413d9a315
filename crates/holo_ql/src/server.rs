//! Tablet servers and the transport the client uses to reach them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use fjall::Keyspace;
use tracing::debug;

use holo_tablet::{
    FjallRowStorage, HashRange, MemoryRowStorage, QlResponse, RowStorage, Schema, TableId,
    Tablet, TabletError, TabletId, TabletRequest,
};

/// Index of a tablet server within a cluster.
pub type ServerId = usize;

/// Per-request outcome returned by a tablet.
pub type TabletResult = Result<QlResponse, TabletError>;

/// Delivers request batches to tablets.
///
/// A batch for one tablet is executed in order. An `Err` means the batch as a
/// whole never reached a tablet (server stopped, tablet missing); per-request
/// results are only returned when it did.
#[async_trait]
pub trait TabletTransport: Send + Sync + 'static {
    async fn execute(
        &self,
        target: ServerId,
        tablet_id: TabletId,
        requests: Vec<TabletRequest>,
    ) -> anyhow::Result<Vec<TabletResult>>;
}

/// Hosts tablets for one server slot.
pub struct TabletServer {
    id: ServerId,
    keyspace: Option<Arc<Keyspace>>,
    tablets: RwLock<HashMap<TabletId, Arc<Tablet>>>,
    handler_delay: Duration,
    stopped: AtomicBool,
}

impl TabletServer {
    pub fn new(id: ServerId, keyspace: Option<Arc<Keyspace>>, handler_delay: Duration) -> Self {
        Self {
            id,
            keyspace,
            tablets: RwLock::new(HashMap::new()),
            handler_delay,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    /// Open (or create) a tablet's storage and start serving it.
    pub fn open_tablet(
        &self,
        tablet_id: TabletId,
        table_id: TableId,
        schema: Arc<Schema>,
        hash_range: HashRange,
    ) -> anyhow::Result<Arc<Tablet>> {
        let storage: Arc<dyn RowStorage> = match &self.keyspace {
            Some(keyspace) => Arc::new(FjallRowStorage::open(keyspace.clone(), tablet_id)?),
            None => Arc::new(MemoryRowStorage::new()),
        };
        let tablet = Arc::new(Tablet::new(tablet_id, table_id, schema, hash_range, storage));
        self.tablets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tablet_id, tablet.clone());
        debug!(server = self.id, tablet_id, table_id, "tablet opened");
        Ok(tablet)
    }

    pub fn tablet(&self, tablet_id: TabletId) -> Option<Arc<Tablet>> {
        self.tablets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tablet_id)
            .cloned()
    }

    pub fn tablets(&self) -> Vec<Arc<Tablet>> {
        let mut tablets = self
            .tablets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect::<Vec<_>>();
        tablets.sort_by_key(|t| t.id());
        tablets
    }

    /// Stop serving a tablet and drop its rows.
    pub fn remove_tablet(&self, tablet_id: TabletId) -> anyhow::Result<()> {
        let removed = self
            .tablets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tablet_id);
        if let Some(tablet) = removed {
            tablet.destroy()?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Flush buffered writes of the server's keyspace to disk.
    pub fn persist(&self) -> anyhow::Result<()> {
        if let Some(keyspace) = &self.keyspace {
            keyspace.persist(fjall::PersistMode::SyncAll)?;
        }
        Ok(())
    }

    async fn handle(
        &self,
        tablet_id: TabletId,
        requests: Vec<TabletRequest>,
    ) -> anyhow::Result<Vec<TabletResult>> {
        anyhow::ensure!(!self.is_stopped(), "tablet server {} is stopped", self.id);
        if !self.handler_delay.is_zero() {
            tokio::time::sleep(self.handler_delay).await;
        }
        let tablet = self
            .tablet(tablet_id)
            .ok_or_else(|| anyhow::anyhow!("tablet {tablet_id} not found on server {}", self.id))?;
        Ok(requests.iter().map(|req| tablet.execute(req)).collect())
    }
}

/// In-process transport dispatching straight to local tablet servers.
pub struct LocalTransport {
    servers: Vec<Arc<TabletServer>>,
}

impl LocalTransport {
    pub fn new(servers: Vec<Arc<TabletServer>>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl TabletTransport for LocalTransport {
    async fn execute(
        &self,
        target: ServerId,
        tablet_id: TabletId,
        requests: Vec<TabletRequest>,
    ) -> anyhow::Result<Vec<TabletResult>> {
        let server = self
            .servers
            .get(target)
            .ok_or_else(|| anyhow::anyhow!("unknown tablet server {target}"))?;
        server.handle(tablet_id, requests).await
    }
}
