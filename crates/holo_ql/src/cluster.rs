//! In-process cluster: a master plus a set of tablet servers.
//!
//! With the fjall backend every tablet server owns one keyspace under
//! `<data_dir>/ts-<n>` and the master keeps its catalog in
//! `<data_dir>/catalog.json`. A restart reopens both and re-hosts every tablet
//! the catalog lists, so routing and rows survive.

use std::fs;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use holo_tablet::{TabletId, TabletLoadSnapshot};

use crate::catalog::Catalog;
use crate::client::Client;
use crate::config::{ClusterConfig, StorageBackend};
use crate::error::QlError;
use crate::master::Master;
use crate::server::{LocalTransport, TabletServer, TabletTransport};

pub struct Cluster {
    config: ClusterConfig,
    master: Arc<Master>,
    servers: Vec<Arc<TabletServer>>,
    transport: Arc<dyn TabletTransport>,
}

impl Cluster {
    /// Start a cluster, recovering persisted state when a data dir is set.
    pub fn start(config: ClusterConfig) -> anyhow::Result<Self> {
        let num_servers = config.tablet_servers.max(1);
        let (catalog, servers) = match &config.storage {
            StorageBackend::Memory => {
                let servers = (0..num_servers)
                    .map(|id| Arc::new(TabletServer::new(id, None, config.handler_delay)))
                    .collect::<Vec<_>>();
                (Catalog::in_memory(), servers)
            }
            StorageBackend::Fjall { data_dir } => {
                fs::create_dir_all(data_dir)
                    .with_context(|| format!("create data dir {}", data_dir.display()))?;
                let mut servers = Vec::with_capacity(num_servers);
                for id in 0..num_servers {
                    let path = data_dir.join(format!("ts-{id}"));
                    let keyspace = fjall::Config::new(&path)
                        .open()
                        .with_context(|| format!("open keyspace {}", path.display()))?;
                    servers.push(Arc::new(TabletServer::new(
                        id,
                        Some(Arc::new(keyspace)),
                        config.handler_delay,
                    )));
                }
                let catalog = Catalog::load_or_init(data_dir.join("catalog.json"))?;
                (catalog, servers)
            }
        };

        let master = Arc::new(Master::new(
            catalog,
            servers.clone(),
            config.default_tablets_per_table,
        ));
        let recovered = master.recover_tablets()?;
        let transport: Arc<dyn TabletTransport> = Arc::new(LocalTransport::new(servers.clone()));
        info!(
            tablet_servers = num_servers,
            recovered_tablets = recovered,
            persistent = matches!(config.storage, StorageBackend::Fjall { .. }),
            "cluster started"
        );
        Ok(Self {
            config,
            master,
            servers,
            transport,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn master(&self) -> &Arc<Master> {
        &self.master
    }

    pub fn tablet_servers(&self) -> &[Arc<TabletServer>] {
        &self.servers
    }

    /// New client with the cluster's client defaults.
    pub fn client(&self) -> Client {
        Client::new(
            self.config.client.clone(),
            self.master.clone(),
            self.transport.clone(),
        )
    }

    /// Persist and reopen the cluster from its data dir.
    ///
    /// Clients and sessions built on the old instance must be dropped first so
    /// the old keyspace handles are released.
    pub fn restart(self) -> anyhow::Result<Self> {
        let config = self.config.clone();
        self.shutdown()?;
        Self::start(config)
    }

    /// Stop serving and flush storage to disk.
    pub fn shutdown(self) -> anyhow::Result<()> {
        for server in &self.servers {
            server.stop();
            server
                .persist()
                .with_context(|| format!("persist tablet server {}", server.id()))?;
        }
        info!("cluster stopped");
        Ok(())
    }

    /// Split one tablet of `table` at its hash-range midpoint.
    pub async fn split_tablet(
        &self,
        table: &str,
        tablet_id: TabletId,
    ) -> Result<TabletId, QlError> {
        let master = self.master.clone();
        let table = table.to_string();
        tokio::task::spawn_blocking(move || master.split_tablet(&table, tablet_id))
            .await
            .map_err(|err| QlError::Internal(anyhow::anyhow!("split task failed: {err}")))?
    }

    /// Storage iteration scopes opened across every hosted tablet.
    pub fn iterators_opened(&self) -> u64 {
        self.servers
            .iter()
            .flat_map(|server| server.tablets())
            .map(|tablet| tablet.iter_stats().opened())
            .sum()
    }

    /// Storage iteration scopes currently open.
    pub fn iterators_live(&self) -> u64 {
        self.servers
            .iter()
            .flat_map(|server| server.tablets())
            .map(|tablet| tablet.iter_stats().live())
            .sum()
    }

    pub fn tablet_load(&self) -> Vec<(TabletId, TabletLoadSnapshot)> {
        let mut load = self
            .servers
            .iter()
            .flat_map(|server| server.tablets())
            .map(|tablet| (tablet.id(), tablet.load().snapshot()))
            .collect::<Vec<_>>();
        load.sort_by_key(|(id, _)| *id);
        load
    }
}
