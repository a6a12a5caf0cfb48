//! One LTS node: owns the share store and runs protocol instances.
//!
//! Initiating operations (`create_lts`, `reshare_lts`, `decrypt_key`,
//! `decrypt_keys`) run the coordinator side locally. Everything else arrives
//! through [`Service::run`], which routes envelopes to running instances and
//! starts the follower side of a protocol when its first message comes in.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::batch::{BatchItem, OcsBatch, OcsBatchFollower};
use crate::config::Config;
use crate::encoding::decode_key;
use crate::error::Error;
use crate::network::{Envelope, Inbound, InstanceContext, InstanceId, ProtocolKind, Transport};
use crate::protocol::{Ocs, OcsFollower};
use crate::setup::Setup;
use crate::store::{FileStore, MemoryStore, SecretStore};
use crate::group::point_list_bytes;
use crate::types::{KeyPair, LtsId, Message, ReencryptRequest, ReshareInit, Roster, ServerIdentity};
use crate::verify::{Authorizer, ReadProof};
use crate::write::{Read, Write};

/// Returned by `create_lts` and `get_lts_reply`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateLtsReply {
    pub lts_id: LtsId,
    /// Collective public key writers encrypt to.
    pub x: RistrettoPoint,
    /// Roster in share order, the creating node first.
    pub roster: Roster,
}

/// Reader request for the key of `write`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecryptKey {
    pub write: Write,
    pub read: Read,
    pub verification_data: Vec<u8>,
}

impl DecryptKey {
    /// Request whose verification data is the serialized write/read pair, as
    /// expected by [`crate::verify::ReadProofAuthorizer`].
    pub fn with_read_proof(write: Write, read: Read) -> Result<Self, Error> {
        let verification_data = ReadProof {
            write: write.clone(),
            read: read.clone(),
        }
        .to_bytes()?;
        Ok(DecryptKey {
            write,
            read,
            verification_data,
        })
    }

    fn request(&self) -> Result<ReencryptRequest, Error> {
        if self.read.write != self.write.id() {
            return Err(Error::Authorization("read doesn't point to the write".into()));
        }
        Ok(ReencryptRequest {
            lts_id: self.write.lts_id,
            u: self.write.u,
            xc: self.read.xc,
            verification_data: self.verification_data.clone(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecryptKeyReply {
    /// Key commitment re-encrypted under the reader's key.
    pub xhat_enc: RistrettoPoint,
    pub x: RistrettoPoint,
    pub cs: Vec<RistrettoPoint>,
}

impl DecryptKeyReply {
    /// Recover the symmetric key with the reader's private key.
    pub fn recover_key(&self, xc: &Scalar) -> Result<Vec<u8>, Error> {
        decode_key(&self.x, &self.cs, &self.xhat_enc, xc)
    }
}

type InstanceTable = Mutex<HashMap<InstanceId, UnboundedSender<Inbound>>>;

struct Inner {
    address: String,
    keypair: KeyPair,
    store: Arc<dyn SecretStore>,
    authorizer: Arc<dyn Authorizer>,
    config: Config,
    transport: Arc<dyn Transport>,
    instances: InstanceTable,
}

#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    pub fn new(
        address: impl Into<String>,
        keypair: KeyPair,
        store: Arc<dyn SecretStore>,
        authorizer: Arc<dyn Authorizer>,
        config: Config,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Service {
            inner: Arc::new(Inner {
                address: address.into(),
                keypair,
                store,
                authorizer,
                config,
                transport,
                instances: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Node whose store follows `config.storage_path`.
    pub fn from_config(
        address: impl Into<String>,
        keypair: KeyPair,
        authorizer: Arc<dyn Authorizer>,
        config: Config,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, Error> {
        let store = Self::open_store(config.storage_path.as_deref())?;
        Ok(Service::new(address, keypair, store, authorizer, config, transport))
    }

    /// File-backed store at `path` when given, in-memory otherwise.
    pub fn open_store(path: Option<&Path>) -> Result<Arc<dyn SecretStore>, Error> {
        Ok(match path {
            Some(path) => Arc::new(FileStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        })
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity::new(self.inner.address.clone(), &self.inner.keypair.public)
    }

    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Number of protocol instances currently running on this node.
    pub fn running_instances(&self) -> usize {
        self.inner.instances.lock().len()
    }

    /// Dispatch loop. Returns once the transport drops the inbox.
    pub async fn run(self, mut inbox: UnboundedReceiver<Envelope>) {
        while let Some(envelope) = inbox.recv().await {
            self.dispatch(envelope);
        }
        debug!(me = %self.inner.address, "inbox closed");
    }

    fn dispatch(&self, envelope: Envelope) {
        let Envelope {
            instance,
            kind,
            from,
            roster,
            message,
        } = envelope;
        let inbound = Inbound { from, message };

        let sender = self.inner.instances.lock().get(&instance).cloned();
        if let Some(tx) = sender {
            if tx.send(inbound).is_err() {
                debug!(instance = %instance, "instance already finished");
                self.inner.instances.lock().remove(&instance);
            }
            return;
        }

        if !inbound.message.starts_instance() {
            debug!(
                me = %self.inner.address,
                instance = %instance,
                msg = inbound.message.name(),
                "dropping message for unknown instance"
            );
            return;
        }
        if roster.index_of(&self.inner.address).is_none() {
            warn!(me = %self.inner.address, protocol = kind.name(), "not part of the requested roster");
            return;
        }

        let ctx = InstanceContext::new(
            instance,
            kind,
            self.inner.address.clone(),
            roster,
            self.inner.transport.clone(),
        );
        if let Err(e) = self.start_follower(ctx, inbound) {
            warn!(me = %self.inner.address, protocol = kind.name(), error = %e, "couldn't start instance");
        }
    }

    /// Follower side of each protocol, keyed by its kind.
    fn start_follower(&self, ctx: InstanceContext, first: Inbound) -> Result<(), Error> {
        let instance = ctx.instance;
        let cfg = &self.inner.config;
        debug!(me = %self.inner.address, instance = %instance, protocol = ctx.kind.name(), "new instance");

        match ctx.kind {
            ProtocolKind::Setup | ProtocolKind::Reshare => {
                let resharing = ctx.kind == ProtocolKind::Reshare;
                // failures are logged by the instance itself
                let (mut setup, _) = Setup::child(ctx, self.inner.keypair.clone(), cfg.dkg_timeout());
                if let (true, Message::Init(init)) = (resharing, &first.message) {
                    if let Ok(record) = self.inner.store.get(&init.lts_id) {
                        setup.with_old_share(record.dks);
                    }
                }
                setup.store_into(self.inner.store.clone());
                let inbox = self.register(instance, Some(first))?;
                self.spawn_instance(instance, setup.run(inbox));
            }
            ProtocolKind::Reencrypt => {
                let Message::Reencrypt(req) = &first.message else {
                    return Err(Error::UnexpectedMessage(first.message.name()));
                };
                let shared = match self.inner.store.get(&req.lts_id) {
                    Ok(record) => Some(record.shared),
                    Err(e) => {
                        debug!(me = %self.inner.address, error = %e, "no share for request");
                        None
                    }
                };
                let follower = OcsFollower::new(
                    ctx,
                    shared,
                    self.inner.authorizer.clone(),
                    cfg.follower_timeout(),
                );
                let inbox = self.register(instance, Some(first))?;
                self.spawn_instance(instance, follower.run(inbox));
            }
            ProtocolKind::ReencryptBatch => {
                let follower = OcsBatchFollower::new(
                    ctx,
                    self.inner.store.clone(),
                    self.inner.authorizer.clone(),
                    cfg.follower_timeout(),
                );
                let inbox = self.register(instance, Some(first))?;
                self.spawn_instance(instance, follower.run(inbox));
            }
        }
        Ok(())
    }

    /// Add `instance` to the table, queueing `first` when given.
    fn register(&self, instance: InstanceId, first: Option<Inbound>) -> Result<UnboundedReceiver<Inbound>, Error> {
        let (tx, rx) = unbounded_channel();
        if let Some(msg) = first {
            tx.send(msg).map_err(|_| Error::Aborted)?;
        }
        self.inner.instances.lock().insert(instance, tx);
        Ok(rx)
    }

    fn spawn_instance<F>(&self, instance: InstanceId, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            fut.await;
            inner.instances.lock().remove(&instance);
        });
    }

    fn context(&self, kind: ProtocolKind, roster: Roster) -> InstanceContext {
        InstanceContext::new(
            InstanceId::random(),
            kind,
            self.inner.address.clone(),
            roster,
            self.inner.transport.clone(),
        )
    }

    /// Run a DKG over `roster` with this node as root and store the result.
    pub async fn create_lts(&self, lts_id: LtsId, roster: &Roster) -> Result<CreateLtsReply, Error> {
        let roster = roster
            .rotated_to(&self.inner.address)
            .ok_or_else(|| Error::NotInRoster(self.inner.address.clone()))?;
        let ctx = self.context(ProtocolKind::Setup, roster.clone());
        let instance = ctx.instance;

        let (mut setup, rx) = Setup::root(
            ctx,
            self.inner.keypair.clone(),
            lts_id,
            true,
            self.inner.config.dkg_timeout(),
        );
        setup.store_into(self.inner.store.clone());
        let inbox = self.register(instance, None)?;
        if let Err(e) = setup.start() {
            self.inner.instances.lock().remove(&instance);
            return Err(e);
        }
        self.spawn_instance(instance, setup.run(inbox));

        let outcome = rx
            .await
            .map_err(|_| Error::Aborted)??
            .ok_or(Error::NotInitialized("share"))?;
        let x = outcome.shared.x;
        info!(me = %self.inner.address, lts = %lts_id, n = roster.len(), "created LTS");
        Ok(CreateLtsReply { lts_id, x, roster })
    }

    /// Move an LTS this node holds a share of onto `new_roster`, keeping its
    /// public key. Old members outside `new_roster` deal and then drop their
    /// share; every member of both rosters must be reachable.
    pub async fn reshare_lts(&self, lts_id: LtsId, new_roster: &Roster) -> Result<CreateLtsReply, Error> {
        let record = self.inner.store.get(&lts_id)?;
        let new_roster = new_roster
            .rotated_to(&self.inner.address)
            .ok_or_else(|| Error::NotInRoster(self.inner.address.clone()))?;

        let mut list = new_roster.list.clone();
        for si in &record.roster.list {
            if new_roster.index_of(&si.address).is_none() {
                list.push(si.clone());
            }
        }
        let reshare = ReshareInit {
            old_publics: record.roster.list.iter().map(|si| si.public).collect(),
            old_commits: point_list_bytes(&record.dks.commits),
            new_n: new_roster.len() as u32,
        };
        let ctx = self.context(ProtocolKind::Reshare, Roster::new(list));
        let instance = ctx.instance;

        let (mut setup, rx) = Setup::root_reshare(
            ctx,
            self.inner.keypair.clone(),
            lts_id,
            reshare,
            record.dks.clone(),
            self.inner.config.dkg_timeout(),
        );
        setup.store_into(self.inner.store.clone());
        let inbox = self.register(instance, None)?;
        if let Err(e) = setup.start() {
            self.inner.instances.lock().remove(&instance);
            return Err(e);
        }
        self.spawn_instance(instance, setup.run(inbox));

        let outcome = rx
            .await
            .map_err(|_| Error::Aborted)??
            .ok_or(Error::NotInitialized("share"))?;
        if outcome.shared.x != record.x {
            return Err(Error::KeyChanged);
        }
        if outcome.dks.share.v == record.dks.share.v {
            return Err(Error::ShareUnchanged);
        }
        info!(
            me = %self.inner.address,
            lts = %lts_id,
            old = record.roster.len(),
            new = new_roster.len(),
            "reshared LTS"
        );
        Ok(CreateLtsReply {
            lts_id,
            x: outcome.shared.x,
            roster: new_roster,
        })
    }

    pub fn get_lts_reply(&self, lts_id: &LtsId) -> Result<CreateLtsReply, Error> {
        let record = self.inner.store.get(lts_id)?;
        Ok(CreateLtsReply {
            lts_id: *lts_id,
            x: record.x,
            roster: record.roster,
        })
    }

    /// Coordinate the re-encryption of one write's key to the reader's key.
    pub async fn decrypt_key(&self, req: &DecryptKey) -> Result<DecryptKeyReply, Error> {
        let request = req.request()?;
        let record = self.inner.store.get(&request.lts_id)?;
        let ctx = self.context(ProtocolKind::Reencrypt, record.roster.clone());
        let instance = ctx.instance;

        let (mut ocs, rx) = Ocs::new(
            ctx,
            self.inner.authorizer.clone(),
            self.inner.config.reencrypt_timeout(),
        );
        ocs.shared = Some(record.shared);
        ocs.poly = Some(record.poly);
        ocs.request = Some(request);

        let inbox = self.register(instance, None)?;
        if let Err(e) = ocs.start() {
            self.inner.instances.lock().remove(&instance);
            return Err(e);
        }
        self.spawn_instance(instance, ocs.run(inbox));

        let reencrypted = rx.await.map_err(|_| Error::Aborted)??;
        Ok(DecryptKeyReply {
            xhat_enc: reencrypted.xhat_enc,
            x: record.x,
            cs: req.write.cs.clone(),
        })
    }

    /// Re-encrypt several keys in one round trip. All writes must belong to
    /// LTSs sharing the same roster. Each item succeeds or fails on its own.
    pub async fn decrypt_keys(&self, reqs: &[DecryptKey]) -> Result<Vec<Result<DecryptKeyReply, Error>>, Error> {
        let mut items = Vec::with_capacity(reqs.len());
        let mut xs = Vec::with_capacity(reqs.len());
        let mut roster: Option<Roster> = None;
        for req in reqs {
            let request = req.request()?;
            let record = self.inner.store.get(&request.lts_id)?;
            match &roster {
                Some(r) if r != &record.roster => return Err(Error::RosterMismatch),
                Some(_) => {}
                None => roster = Some(record.roster.clone()),
            }
            xs.push(record.x);
            items.push(BatchItem {
                request,
                shared: record.shared,
                poly: record.poly,
            });
        }
        let Some(roster) = roster else {
            return Ok(Vec::new());
        };

        let ctx = self.context(ProtocolKind::ReencryptBatch, roster);
        let instance = ctx.instance;
        let (mut batch, rx) = OcsBatch::new(
            ctx,
            items,
            self.inner.authorizer.clone(),
            self.inner.config.batch_timeout(),
        );
        let inbox = self.register(instance, None)?;
        if let Err(e) = batch.start() {
            self.inner.instances.lock().remove(&instance);
            return Err(e);
        }
        self.spawn_instance(instance, batch.run(inbox));

        let results = rx.await.map_err(|_| Error::Aborted)?;
        Ok(results
            .into_iter()
            .zip(reqs.iter().zip(xs))
            .map(|(res, (req, x))| {
                res.map(|r| DecryptKeyReply {
                    xhat_enc: r.xhat_enc,
                    x,
                    cs: req.write.cs.clone(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalCluster;
    use crate::verify::AllowAll;

    fn cluster(n: usize) -> LocalCluster {
        LocalCluster::builder(n)
            .authorizer(Arc::new(AllowAll))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_lts_stores_share_on_every_node() {
        let cluster = cluster(4);
        let lts_id = LtsId::random();
        let reply = cluster.node(0).create_lts(lts_id, &cluster.roster()).await.unwrap();
        assert_eq!(reply.roster.list[0].address, cluster.node(0).address());

        for node in cluster.nodes() {
            let record = node.store().get(&lts_id).unwrap();
            assert_eq!(record.x, reply.x);
            assert_eq!(record.roster, reply.roster);
        }
        assert_eq!(cluster.node(2).get_lts_reply(&lts_id).unwrap(), reply);
    }

    #[tokio::test]
    async fn test_create_lts_outside_roster() {
        let cluster = cluster(3);
        let roster = Roster::new(cluster.roster().list[1..].to_vec());
        let err = cluster.node(0).create_lts(LtsId::random(), &roster).await.unwrap_err();
        assert!(matches!(err, Error::NotInRoster(_)));
    }

    #[tokio::test]
    async fn test_decrypt_key_unknown_lts() {
        let cluster = cluster(3);
        let x = KeyPair::random().public;
        let write = Write::new(LtsId::random(), b"policy", &x, b"key").unwrap();
        let read = Read::new(&write, KeyPair::random().public);
        let req = DecryptKey::with_read_proof(write, read).unwrap();
        let err = cluster.node(0).decrypt_key(&req).await.unwrap_err();
        assert!(matches!(err, Error::UnknownLts(_)));
    }

    #[tokio::test]
    async fn test_decrypt_key_rejects_mismatched_read() {
        let cluster = cluster(3);
        let lts = cluster.node(0).create_lts(LtsId::random(), &cluster.roster()).await.unwrap();
        let write = Write::new(lts.lts_id, b"policy", &lts.x, b"key").unwrap();
        let other = Write::new(lts.lts_id, b"policy", &lts.x, b"other").unwrap();
        let read = Read::new(&other, KeyPair::random().public);
        let req = DecryptKey::with_read_proof(write, read).unwrap();
        assert!(matches!(
            cluster.node(0).decrypt_key(&req).await,
            Err(Error::Authorization(_))
        ));
    }

    #[tokio::test]
    async fn test_instances_are_cleaned_up() {
        let cluster = cluster(3);
        let lts = cluster.node(0).create_lts(LtsId::random(), &cluster.roster()).await.unwrap();
        let reader = KeyPair::random();
        let write = Write::new(lts.lts_id, b"policy", &lts.x, b"secret key").unwrap();
        let read = Read::new(&write, reader.public);
        let req = DecryptKey::with_read_proof(write, read).unwrap();
        let reply = cluster.node(0).decrypt_key(&req).await.unwrap();
        assert_eq!(reply.recover_key(&reader.private).unwrap(), b"secret key");

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(cluster.node(0).running_instances(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let cluster = cluster(3);
        assert!(cluster.node(1).decrypt_keys(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reshare_same_roster_replaces_shares() {
        let cluster = cluster(4);
        let lts = cluster.node(0).create_lts(LtsId::random(), &cluster.roster()).await.unwrap();
        let before: Vec<_> = cluster.nodes().iter().map(|n| n.store().get(&lts.lts_id).unwrap()).collect();

        let reader = KeyPair::random();
        let write = Write::new(lts.lts_id, b"policy", &lts.x, b"written before").unwrap();

        let reply = cluster.node(1).reshare_lts(lts.lts_id, &cluster.roster()).await.unwrap();
        assert_eq!(reply.x, lts.x);
        assert_eq!(reply.roster.list[0].address, cluster.node(1).address());

        for (node, old) in cluster.nodes().iter().zip(&before) {
            let record = node.store().get(&lts.lts_id).unwrap();
            assert_eq!(record.x, lts.x);
            assert_eq!(record.roster, reply.roster);
            assert_ne!(record.dks.share.v, old.dks.share.v);
            assert_ne!(record.poly, old.poly);
        }

        let req = DecryptKey::with_read_proof(write.clone(), Read::new(&write, reader.public)).unwrap();
        let out = cluster.node(3).decrypt_key(&req).await.unwrap();
        assert_eq!(out.recover_key(&reader.private).unwrap(), b"written before");
    }

    #[tokio::test]
    async fn test_reshare_unknown_lts() {
        let cluster = cluster(3);
        assert!(matches!(
            cluster.node(0).reshare_lts(LtsId::random(), &cluster.roster()).await,
            Err(Error::UnknownLts(_))
        ));
    }
}
