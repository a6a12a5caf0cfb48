//! Networked run of the DKG on a star tree rooted at the initiator.
//!
//! Root: `Init` to every child, collect `InitReply`, send `StartDeal` with the
//! ordered public keys. Then every node deals, answers deals with multicast
//! responses and justifies complaints until its generator is certified. With
//! `wait` set the root additionally collects a `WaitReply` from every child
//! once they are certified too.
//!
//! The same flow reshares an existing LTS: `Init` then carries the old
//! roster's keys and commitments, and the generator is a
//! [`ReshareGenerator`] instead of a fresh DKG.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::completion::Completion;
use crate::dkg::{Deal, DistKeyGenerator, DistKeyShare, Justification, KeyGenerator, Response};
use crate::error::Error;
use crate::group::{byzantine_threshold, enc_point, point_list, PointBytes};
use crate::network::{Inbound, InstanceContext, ProtocolKind};
use crate::reshare::ReshareGenerator;
use crate::shamir::PubPoly;
use crate::store::{LtsRecord, SecretStore};
use crate::types::{Init, InitReply, KeyPair, LtsId, Message, ReshareInit, Roster, SharedSecret, StartDeal};

/// What a node holds after a successful setup.
#[derive(Clone, Debug)]
pub struct SetupOutcome {
    pub lts_id: LtsId,
    pub shared: SharedSecret,
    pub dks: DistKeyShare,
    pub poly: PubPoly,
}

/// `Ok(None)` for an old member that left the roster on a resharing.
pub type SetupResult = Result<Option<SetupOutcome>, Error>;

pub struct Setup {
    ctx: InstanceContext,
    keypair: KeyPair,
    lts_id: Option<LtsId>,
    wait: bool,
    threshold: usize,
    timeout: Duration,
    reshare: Option<ReshareInit>,
    /// Share being reshared, old members only.
    old_share: Option<DistKeyShare>,
    dkg: Option<Box<dyn KeyGenerator>>,
    /// Root only: public keys by roster index.
    publics: BTreeMap<usize, PointBytes>,
    /// DKG messages received before `StartDeal`.
    buffered: Vec<Inbound>,
    wait_setup_sent: bool,
    wait_requested: bool,
    wait_replies: BTreeSet<String>,
    store: Option<Arc<dyn SecretStore>>,
    done: Completion<SetupResult>,
}

impl Setup {
    fn new(ctx: InstanceContext, keypair: KeyPair, timeout: Duration) -> (Self, oneshot::Receiver<SetupResult>) {
        let (done, rx) = Completion::new();
        let setup = Setup {
            threshold: ctx.roster.threshold(),
            ctx,
            keypair,
            lts_id: None,
            wait: false,
            timeout,
            reshare: None,
            old_share: None,
            dkg: None,
            publics: BTreeMap::new(),
            buffered: Vec::new(),
            wait_setup_sent: false,
            wait_requested: false,
            wait_replies: BTreeSet::new(),
            store: None,
            done,
        };
        (setup, rx)
    }

    /// Initiator of a new LTS. The roster must already start with this node.
    pub fn root(
        ctx: InstanceContext,
        keypair: KeyPair,
        lts_id: LtsId,
        wait: bool,
        timeout: Duration,
    ) -> (Self, oneshot::Receiver<SetupResult>) {
        let (mut setup, rx) = Setup::new(ctx, keypair, timeout);
        setup.lts_id = Some(lts_id);
        setup.wait = wait;
        (setup, rx)
    }

    /// Initiator of a resharing. The run's roster lists the new roster first,
    /// starting with this node, followed by the old members leaving.
    pub fn root_reshare(
        ctx: InstanceContext,
        keypair: KeyPair,
        lts_id: LtsId,
        reshare: ReshareInit,
        old_share: DistKeyShare,
        timeout: Duration,
    ) -> (Self, oneshot::Receiver<SetupResult>) {
        let (mut setup, rx) = Setup::new(ctx, keypair, timeout);
        setup.threshold = byzantine_threshold(reshare.new_n as usize);
        setup.lts_id = Some(lts_id);
        setup.wait = true;
        setup.reshare = Some(reshare);
        setup.old_share = Some(old_share);
        (setup, rx)
    }

    /// Node joining a setup on reception of `Init`.
    pub fn child(ctx: InstanceContext, keypair: KeyPair, timeout: Duration) -> (Self, oneshot::Receiver<SetupResult>) {
        Setup::new(ctx, keypair, timeout)
    }

    /// Share this node holds of the LTS being reshared.
    pub fn with_old_share(&mut self, share: DistKeyShare) {
        self.old_share = Some(share);
    }

    pub fn is_root(&self) -> bool {
        self.ctx.is_root()
    }

    /// Persist the share into `store` before reporting success. A child only
    /// acknowledges `WaitSetup` once the share is stored.
    pub fn store_into(&mut self, store: Arc<dyn SecretStore>) {
        self.store = Some(store);
    }

    /// Root: send `Init` to every child. Children start on their `Init` message.
    pub fn start(&mut self) -> Result<(), Error> {
        if !self.ctx.is_root() {
            return Ok(());
        }
        let lts_id = self.lts_id.ok_or(Error::NotInitialized("lts id"))?;
        info!(lts = %lts_id, n = self.ctx.roster.len(), t = self.threshold, "starting DKG");

        self.publics.insert(0, enc_point(&self.keypair.public));
        let init = Message::Init(Init {
            lts_id,
            roster: self.ctx.roster.clone(),
            threshold: self.threshold as u32,
            wait: self.wait,
            reshare: self.reshare.clone(),
        });
        let failed = self.ctx.broadcast(&init).len();
        if failed > 0 {
            // The DKG needs every roster member.
            let total = self.ctx.roster.len() - 1;
            self.done.finish(Err(Error::BroadcastFailed { failed, total }));
            return Err(Error::BroadcastFailed { failed, total });
        }
        if self.ctx.roster.len() == 1 {
            self.start_deal()?;
        }
        Ok(())
    }

    pub async fn run(mut self, mut inbox: UnboundedReceiver<Inbound>) {
        let deadline = Instant::now() + self.timeout;
        while !self.done.is_finished() {
            tokio::select! {
                msg = inbox.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = self.handle(msg) {
                            warn!(me = %self.ctx.me, error = %e, "DKG aborted");
                            self.done.finish(Err(e));
                        }
                    }
                    None => {
                        self.done.finish(Err(Error::Aborted));
                    }
                },
                _ = sleep_until(deadline) => {
                    warn!(me = %self.ctx.me, "DKG timed out");
                    self.done.finish(Err(Error::Timeout(self.timeout)));
                }
            }
        }
    }

    fn handle(&mut self, msg: Inbound) -> Result<(), Error> {
        if self.dkg.is_none()
            && matches!(
                msg.message,
                Message::Deal(_) | Message::Response(_) | Message::Justification(_)
            )
        {
            self.buffered.push(msg);
            return Ok(());
        }

        let Inbound { from, message } = msg;
        match message {
            Message::Init(init) => self.handle_init(&from, init),
            Message::InitReply(reply) => self.handle_init_reply(&from, reply),
            Message::StartDeal(sd) => self.handle_start_deal(sd),
            Message::Deal(deal) => self.handle_deal(deal),
            Message::Response(resp) => self.handle_response(resp),
            Message::Justification(j) => self.handle_justification(j),
            Message::WaitSetup => {
                self.wait_requested = true;
                self.check_progress()
            }
            Message::WaitReply => {
                self.wait_replies.insert(from);
                self.check_progress()
            }
            other => Err(Error::UnexpectedMessage(other.name())),
        }
    }

    fn handle_init(&mut self, from: &str, init: Init) -> Result<(), Error> {
        if self.ctx.is_root() {
            return Err(Error::UnexpectedMessage("Init"));
        }
        if init.reshare.is_some() != (self.ctx.kind == ProtocolKind::Reshare) {
            return Err(Error::UnexpectedMessage("Init"));
        }
        debug!(me = %self.ctx.me, lts = %init.lts_id, reshare = init.reshare.is_some(), "joining DKG");
        self.lts_id = Some(init.lts_id);
        self.wait = init.wait;
        self.threshold = init.threshold as usize;
        self.reshare = init.reshare;
        self.ctx.send(
            from,
            Message::InitReply(InitReply {
                public: enc_point(&self.keypair.public),
            }),
        )
    }

    fn handle_init_reply(&mut self, from: &str, reply: InitReply) -> Result<(), Error> {
        let index = self
            .ctx
            .roster
            .index_of(from)
            .ok_or_else(|| Error::NotInRoster(from.to_string()))?;
        self.publics.insert(index, reply.public);
        if self.publics.len() == self.ctx.roster.len() && self.dkg.is_none() {
            self.start_deal()?;
        }
        Ok(())
    }

    /// Root: everybody answered, distribute the public keys and deal.
    fn start_deal(&mut self) -> Result<(), Error> {
        let publics: Vec<PointBytes> = self.publics.values().copied().collect();
        let sd = StartDeal {
            publics,
            threshold: self.threshold as u32,
        };
        for (address, e) in self.ctx.broadcast(&Message::StartDeal(sd.clone())) {
            warn!(to = %address, error = %e, "couldn't send StartDeal");
        }
        self.handle_start_deal(sd)
    }

    fn handle_start_deal(&mut self, sd: StartDeal) -> Result<(), Error> {
        if self.dkg.is_some() {
            return Err(Error::UnexpectedMessage("StartDeal"));
        }
        let publics = point_list(&sd.publics)?;
        let t = sd.threshold as usize;
        let dkg: Box<dyn KeyGenerator> = match &self.reshare {
            None => Box::new(DistKeyGenerator::new(self.keypair.private, publics, t)?),
            Some(r) => {
                let new_n = r.new_n as usize;
                let new = publics.get(..new_n).ok_or(Error::UnexpectedMessage("StartDeal"))?;
                Box::new(ReshareGenerator::new(
                    self.keypair.private,
                    point_list(&r.old_publics)?,
                    new.to_vec(),
                    point_list(&r.old_commits)?,
                    t,
                    self.old_share.as_ref(),
                )?)
            }
        };
        let deals = dkg.deals()?;
        debug!(me = %self.ctx.me, deals = deals.len(), "dealing");
        self.dkg = Some(dkg);

        for (j, deal) in deals {
            let Some(si) = self.ctx.roster.get(j as usize) else {
                continue;
            };
            if let Err(e) = self.ctx.send(&si.address, Message::Deal(deal)) {
                warn!(to = %si.address, error = %e, "couldn't send deal");
            }
        }

        for msg in std::mem::take(&mut self.buffered) {
            self.handle(msg)?;
        }
        self.check_progress()
    }

    fn dkg(&mut self) -> Result<&mut Box<dyn KeyGenerator>, Error> {
        self.dkg.as_mut().ok_or(Error::NotInitialized("dkg"))
    }

    fn handle_deal(&mut self, deal: Deal) -> Result<(), Error> {
        let resp = self.dkg()?.process_deal(&deal)?;
        for (address, e) in self.ctx.broadcast(&Message::Response(resp)) {
            debug!(to = %address, error = %e, "couldn't send response");
        }
        self.check_progress()
    }

    fn handle_response(&mut self, resp: Response) -> Result<(), Error> {
        match self.dkg()?.process_response(&resp) {
            Ok(Some(j)) => {
                warn!(verifier = resp.verifier, "complaint against our deal, justifying");
                for (address, e) in self.ctx.broadcast(&Message::Justification(j)) {
                    debug!(to = %address, error = %e, "couldn't send justification");
                }
            }
            Ok(None) => {}
            Err(e) if e.is_benign() => {
                debug!(me = %self.ctx.me, error = %e, "ignoring response");
            }
            Err(e) => return Err(e.into()),
        }
        self.check_progress()
    }

    fn handle_justification(&mut self, j: Justification) -> Result<(), Error> {
        self.dkg()?.process_justification(&j)?;
        self.check_progress()
    }

    fn certified(&self) -> bool {
        self.dkg.as_ref().is_some_and(|d| d.certified())
    }

    fn check_progress(&mut self) -> Result<(), Error> {
        if !self.certified() || self.done.is_finished() {
            return Ok(());
        }
        if self.ctx.is_root() {
            if self.wait {
                if !self.wait_setup_sent {
                    self.wait_setup_sent = true;
                    for (address, e) in self.ctx.broadcast(&Message::WaitSetup) {
                        warn!(to = %address, error = %e, "couldn't send WaitSetup");
                    }
                }
                if self.wait_replies.len() + 1 < self.ctx.roster.len() {
                    return Ok(());
                }
            }
        } else if self.wait {
            if !self.wait_requested {
                return Ok(());
            }
            let root = self.ctx.root().map(|r| r.address.clone());
            self.finish()?;
            if let Some(root) = root {
                self.ctx.send(&root, Message::WaitReply)?;
            }
            return Ok(());
        }
        self.finish()
    }

    /// Roster the resulting shares belong to.
    fn share_roster(&self) -> Roster {
        match &self.reshare {
            Some(r) => Roster::new(self.ctx.roster.list.iter().take(r.new_n as usize).cloned().collect()),
            None => self.ctx.roster.clone(),
        }
    }

    /// A resharing must keep the collective key and replace our share.
    fn check_reshared(&self, dks: &DistKeyShare) -> Result<(), Error> {
        let Some(reshare) = &self.reshare else {
            return Ok(());
        };
        if dks.public() != reshare.x()? {
            return Err(Error::KeyChanged);
        }
        if self.old_share.as_ref().is_some_and(|old| old.share.v == dks.share.v) {
            return Err(Error::ShareUnchanged);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        let lts_id = self.lts_id.ok_or(Error::NotInitialized("lts id"))?;
        let dks = self
            .dkg
            .as_ref()
            .ok_or(Error::NotInitialized("dkg"))?
            .dist_key_share()?;
        let Some(dks) = dks else {
            info!(me = %self.ctx.me, lts = %lts_id, "resharing done, leaving the roster");
            if let Some(store) = &self.store {
                store.remove(&lts_id)?;
            }
            self.done.finish(Ok(None));
            return Ok(());
        };
        self.check_reshared(&dks)?;
        let shared = SharedSecret::from_dist_key_share(&dks)?;
        let poly = dks.pub_poly();
        info!(me = %self.ctx.me, lts = %lts_id, index = shared.index, "DKG certified");
        if let Some(store) = &self.store {
            store.put(
                lts_id,
                LtsRecord {
                    shared: shared.clone(),
                    poly: poly.clone(),
                    roster: self.share_roster(),
                    dks: dks.clone(),
                    x: shared.x,
                },
            )?;
        }
        self.done.finish(Ok(Some(SetupOutcome {
            lts_id,
            shared,
            dks,
            poly,
        })));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{InstanceId, LocalNetwork, ProtocolKind};
    use crate::shamir::{recover_secret, PriShare};
    use crate::types::{Roster, ServerIdentity};
    use tokio::sync::mpsc::unbounded_channel;

    /// Drive one setup over a LocalNetwork without the service layer.
    async fn run_setup(n: usize, wait: bool) -> Vec<SetupResult> {
        let net = LocalNetwork::new();
        let keys: Vec<KeyPair> = (0..n).map(|_| KeyPair::random()).collect();
        let roster = Roster::new(
            keys.iter()
                .enumerate()
                .map(|(i, k)| ServerIdentity::new(format!("n{i}"), &k.public))
                .collect(),
        );
        let instance = InstanceId::random();
        let timeout = Duration::from_secs(10);

        let mut results = Vec::new();
        let mut root = None;
        for (i, k) in keys.iter().enumerate() {
            let address = format!("n{i}");
            let mut wire = net.register(address.clone());
            let (tx, inbox) = unbounded_channel();
            tokio::spawn(async move {
                while let Some(env) = wire.recv().await {
                    if tx
                        .send(Inbound {
                            from: env.from,
                            message: env.message,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            });

            let ctx = InstanceContext::new(instance, ProtocolKind::Setup, address, roster.clone(), net.clone());
            if i == 0 {
                let (setup, rx) = Setup::root(ctx, k.clone(), LtsId::from_seed(b"setup-test"), wait, timeout);
                root = Some((setup, inbox));
                results.push(rx);
            } else {
                let (setup, rx) = Setup::child(ctx, k.clone(), timeout);
                tokio::spawn(setup.run(inbox));
                results.push(rx);
            }
        }

        let (mut setup, inbox) = root.unwrap();
        setup.start().unwrap();
        tokio::spawn(setup.run(inbox));

        let mut out = Vec::new();
        for rx in results {
            out.push(rx.await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_setup_agreement() {
        let (n, t) = (4, 3);
        let outcomes: Vec<SetupOutcome> = run_setup(n, true)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        let x = outcomes[0].shared.x;
        for (i, o) in outcomes.iter().enumerate() {
            assert_eq!(o.shared.x, x);
            assert_eq!(o.shared.index as usize, i);
            assert_eq!(o.poly, outcomes[0].poly);
            assert_eq!(o.lts_id, LtsId::from_seed(b"setup-test"));
        }

        let shares: Vec<Option<PriShare>> = outcomes
            .iter()
            .skip(1)
            .map(|o| Some(o.dks.share.clone()))
            .collect();
        let secret = recover_secret(&shares, t, n).unwrap();
        assert_eq!(crate::group::G * secret, x);
    }

    #[tokio::test]
    async fn test_setup_without_wait() {
        let outcomes = run_setup(3, false).await;
        assert!(outcomes.iter().all(|o| matches!(o, Ok(Some(_)))));
    }

    #[tokio::test]
    async fn test_single_node_setup() {
        let outcomes = run_setup(1, true).await;
        assert_eq!(outcomes.len(), 1);
        let o = outcomes[0].as_ref().unwrap().as_ref().unwrap();
        assert_eq!(o.shared.commits.len(), 1);
    }

    #[tokio::test]
    async fn test_root_fails_when_child_unreachable() {
        let net = LocalNetwork::new();
        let keys: Vec<KeyPair> = (0..3).map(|_| KeyPair::random()).collect();
        let roster = Roster::new(
            keys.iter()
                .enumerate()
                .map(|(i, k)| ServerIdentity::new(format!("n{i}"), &k.public))
                .collect(),
        );
        let _n0 = net.register("n0");
        let _n1 = net.register("n1");
        let ctx = InstanceContext::new(InstanceId::random(), ProtocolKind::Setup, "n0", roster, net);
        let (mut setup, rx) = Setup::root(ctx, keys[0].clone(), LtsId::random(), true, Duration::from_secs(1));
        assert!(matches!(
            setup.start(),
            Err(Error::BroadcastFailed { failed: 1, total: 2 })
        ));
        assert!(rx.await.unwrap().is_err());
    }
}
