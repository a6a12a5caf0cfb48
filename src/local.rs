//! A cluster of services wired over an in-process [`LocalNetwork`].
//!
//! Must be built inside a tokio runtime; every node's dispatch loop is a
//! spawned task that is aborted when the cluster is dropped.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::error::Error;
use crate::network::LocalNetwork;
use crate::service::Service;
use crate::types::{KeyPair, Roster};
use crate::verify::{AllowAll, Authorizer};

type AuthorizerFactory = Box<dyn Fn(usize) -> Arc<dyn Authorizer>>;

pub struct ClusterBuilder {
    n: usize,
    config: Config,
    authorizer: AuthorizerFactory,
    storage_dir: Option<PathBuf>,
}

impl ClusterBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Same policy on every node.
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Box::new(move |_| authorizer.clone());
        self
    }

    /// Policy chosen per node index.
    pub fn authorizer_with(mut self, f: impl Fn(usize) -> Arc<dyn Authorizer> + 'static) -> Self {
        self.authorizer = Box::new(f);
        self
    }

    /// Give every node a file store `<dir>/<address>.json`.
    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<LocalCluster, Error> {
        let mut cluster = LocalCluster {
            network: LocalNetwork::new(),
            nodes: Vec::with_capacity(self.n),
            keypairs: Vec::with_capacity(self.n),
            authorizers: Vec::with_capacity(self.n),
            tasks: Vec::with_capacity(self.n),
            config: self.config,
            storage_dir: self.storage_dir,
        };
        for i in 0..self.n {
            cluster.keypairs.push(KeyPair::random());
            cluster.authorizers.push((self.authorizer)(i));
            let (service, task) = cluster.spawn_node(i)?;
            cluster.nodes.push(service);
            cluster.tasks.push(task);
        }
        info!(n = self.n, "local cluster up");
        Ok(cluster)
    }
}

pub struct LocalCluster {
    network: Arc<LocalNetwork>,
    nodes: Vec<Service>,
    keypairs: Vec<KeyPair>,
    authorizers: Vec<Arc<dyn Authorizer>>,
    tasks: Vec<JoinHandle<()>>,
    config: Config,
    storage_dir: Option<PathBuf>,
}

impl LocalCluster {
    pub fn builder(n: usize) -> ClusterBuilder {
        ClusterBuilder {
            n,
            config: Config::default(),
            authorizer: Box::new(|_| Arc::new(AllowAll)),
            storage_dir: None,
        }
    }

    /// `n` nodes with default config, accepting every request.
    pub fn new(n: usize) -> Result<Self, Error> {
        Self::builder(n).build()
    }

    pub fn address(i: usize) -> String {
        format!("node-{i}")
    }

    fn spawn_node(&self, i: usize) -> Result<(Service, JoinHandle<()>), Error> {
        let address = Self::address(i);
        let mut config = self.config.clone();
        if let Some(dir) = &self.storage_dir {
            config.storage_path = Some(dir.join(format!("{address}.json")));
        }
        let inbox = self.network.register(address.clone());
        let service = Service::from_config(
            address,
            self.keypairs[i].clone(),
            self.authorizers[i].clone(),
            config,
            self.network.clone(),
        )?;
        let task = tokio::spawn(service.clone().run(inbox));
        Ok((service, task))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, i: usize) -> &Service {
        &self.nodes[i]
    }

    pub fn nodes(&self) -> &[Service] {
        &self.nodes
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    pub fn roster(&self) -> Roster {
        Roster::new(self.nodes.iter().map(Service::identity).collect())
    }

    pub fn pause(&self, i: usize) {
        self.network.pause(self.nodes[i].address());
    }

    pub fn resume(&self, i: usize) {
        self.network.resume(self.nodes[i].address());
    }

    /// Replace node `i` by a fresh service with the same key, reopening its
    /// store. Shares only survive with a storage directory.
    pub fn restart(&mut self, i: usize) -> Result<(), Error> {
        self.tasks[i].abort();
        let (service, task) = self.spawn_node(i)?;
        self.nodes[i] = service;
        self.tasks[i] = task;
        info!(node = %Self::address(i), "restarted");
        Ok(())
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LtsId;

    #[tokio::test]
    async fn test_roster_matches_nodes() {
        let cluster = LocalCluster::new(4).unwrap();
        let roster = cluster.roster();
        assert_eq!(roster.len(), 4);
        assert_eq!(roster.list[3].address, "node-3");
        assert_eq!(roster.threshold(), 3);
    }

    #[tokio::test]
    async fn test_paused_node_blocks_dkg() {
        let mut cfg = Config::default();
        cfg.dkg_timeout_ms = 500;
        let cluster = LocalCluster::builder(3).config(cfg).build().unwrap();
        cluster.pause(2);
        let err = cluster
            .node(0)
            .create_lts(LtsId::random(), &cluster.roster())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BroadcastFailed { failed: 1, total: 2 }));

        cluster.resume(2);
        assert!(cluster
            .node(0)
            .create_lts(LtsId::random(), &cluster.roster())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_restart_keeps_memory_store_empty() {
        let mut cluster = LocalCluster::new(3).unwrap();
        let lts = cluster.node(0).create_lts(LtsId::random(), &cluster.roster()).await.unwrap();
        cluster.restart(0).unwrap();
        assert!(matches!(
            cluster.node(0).get_lts_reply(&lts.lts_id),
            Err(Error::UnknownLts(_))
        ));
    }
}
