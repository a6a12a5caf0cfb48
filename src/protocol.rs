use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use curve25519_dalek::ristretto::RistrettoPoint;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::completion::Completion;
use crate::error::Error;
use crate::network::{Inbound, InstanceContext};
use crate::nizk::{generate_partial, verify_partial};
use crate::shamir::{recover_commit, PubPoly, PubShare};
use crate::types::{Message, PartialReply, Reencrypt, ReencryptReply, ReencryptRequest, SharedSecret};
use crate::verify::{is_authorized, Authorizer};

/// Outcome of a successful re-encryption.
#[derive(Clone, Debug)]
pub struct Reencrypted {
    /// XhatEnc = x*U + x*Xc
    pub xhat_enc: RistrettoPoint,
    /// Verified partial shares, indexed by share index.
    pub uis: Vec<Option<PubShare>>,
}

pub type ReencryptResult = Result<Reencrypted, Error>;

/// Answer of a node to a re-encryption request: its partial share, or the
/// empty reply if it has no share or refuses the request.
pub(crate) fn respond(shared: Option<&SharedSecret>, authorizer: &dyn Authorizer, msg: &Reencrypt) -> ReencryptReply {
    let req = match msg.to_request() {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "malformed re-encryption request");
            return ReencryptReply::refused();
        }
    };
    let Some(shared) = shared else {
        warn!(lts = %req.lts_id, "no share for this LTS");
        return ReencryptReply::refused();
    };
    if !is_authorized(authorizer, &req) {
        info!(lts = %req.lts_id, "refusing to reencrypt");
        return ReencryptReply::refused();
    }
    ReencryptReply::from_partial(&generate_partial(shared, &req.u, &req.xc))
}

/// Coordinator of one re-encryption.
///
/// Computes its own partial share, asks every other roster member for theirs and
/// recovers XhatEnc once `t - 1` replies are in. More than `n - t` refusals or
/// unreachable nodes end the run early.
pub struct Ocs {
    ctx: InstanceContext,
    pub shared: Option<SharedSecret>,
    pub poly: Option<PubPoly>,
    pub request: Option<ReencryptRequest>,
    authorizer: Arc<dyn Authorizer>,
    timeout: Duration,
    threshold: usize,
    own: Option<PubShare>,
    replies: BTreeMap<String, PartialReply>,
    failed: BTreeSet<String>,
    deadline: Option<Instant>,
    done: Completion<ReencryptResult>,
}

impl Ocs {
    pub fn new(
        ctx: InstanceContext,
        authorizer: Arc<dyn Authorizer>,
        timeout: Duration,
    ) -> (Self, oneshot::Receiver<ReencryptResult>) {
        let (done, rx) = Completion::new();
        let ocs = Ocs {
            threshold: ctx.roster.threshold(),
            ctx,
            shared: None,
            poly: None,
            request: None,
            authorizer,
            timeout,
            own: None,
            replies: BTreeMap::new(),
            failed: BTreeSet::new(),
            deadline: None,
            done,
        };
        (ocs, rx)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    fn abort(&self, err: fn() -> Error) -> Error {
        self.done.finish(Err(err()));
        err()
    }

    /// Validate, authorize and fan out the request. Configuration errors and a
    /// local refusal are returned here as well as through the completion.
    pub fn start(&mut self) -> Result<(), Error> {
        let Some(shared) = self.shared.as_ref() else {
            return Err(self.abort(|| Error::NotInitialized("shared")));
        };
        let Some(req) = self.request.as_ref() else {
            return Err(self.abort(|| Error::NotInitialized("U")));
        };
        if self.poly.is_none() {
            return Err(self.abort(|| Error::NotInitialized("poly")));
        }
        if !is_authorized(self.authorizer.as_ref(), req) {
            return Err(self.abort(|| Error::Refused));
        }

        self.deadline = Some(Instant::now() + self.timeout);
        let own = generate_partial(shared, &req.u, &req.xc);
        debug!(me = %self.ctx.me, index = own.ui.i, "computed own partial");
        self.own = Some(own.ui);

        let msg = Message::Reencrypt(Reencrypt::from_request(req));
        for (address, _) in self.ctx.broadcast(&msg) {
            self.failed.insert(address);
        }

        if self.too_many_failures() {
            self.done.finish(Err(Error::NotEnoughShares));
        } else if self.threshold <= 1 {
            self.aggregate();
        }
        Ok(())
    }

    fn too_many_failures(&self) -> bool {
        let n = self.ctx.roster.len();
        self.failed.len() > n - self.threshold
    }

    /// Deadline fixed by [`Ocs::start`].
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Process replies until the result is delivered or the deadline set by
    /// `start` passes.
    pub async fn run(mut self, mut inbox: UnboundedReceiver<Inbound>) {
        let deadline = self.deadline.unwrap_or_else(|| Instant::now() + self.timeout);
        while !self.done.is_finished() {
            tokio::select! {
                msg = inbox.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => {
                        self.done.finish(Err(Error::Aborted));
                    }
                },
                _ = sleep_until(deadline) => self.on_timeout(),
            }
        }
    }

    fn on_timeout(&mut self) {
        if self.done.finish(Err(Error::Timeout(self.timeout))) {
            warn!(me = %self.ctx.me, instance = %self.ctx.instance, "re-encryption timed out");
        }
    }

    fn handle(&mut self, msg: Inbound) {
        match msg.message {
            Message::ReencryptReply(reply) => self.handle_reply(msg.from, &reply),
            other => debug!(from = %msg.from, msg = other.name(), "ignoring message"),
        }
    }

    fn handle_reply(&mut self, from: String, reply: &ReencryptReply) {
        if self.done.is_finished() {
            debug!(from = %from, "reply after completion");
            return;
        }
        let Some(index) = self.ctx.roster.index_of(&from).filter(|_| from != self.ctx.me) else {
            warn!(from = %from, "reply from outside the roster");
            return;
        };
        match reply.to_partial() {
            Ok(Some(partial)) if partial.ui.i as usize == index => {
                self.replies.insert(from, partial);
            }
            Ok(Some(partial)) => {
                warn!(from = %from, index = partial.ui.i, "reply for another node's share");
                self.failed.insert(from);
            }
            Ok(None) => {
                debug!(from = %from, "node refused to reencrypt");
                self.failed.insert(from);
            }
            Err(e) => {
                warn!(from = %from, error = %e, "malformed reply");
                self.failed.insert(from);
            }
        }

        if self.too_many_failures() {
            warn!(failed = self.failed.len(), "couldn't get enough shares");
            self.done.finish(Err(Error::NotEnoughShares));
            return;
        }
        if self.replies.len() + 1 >= self.threshold {
            self.aggregate();
        }
    }

    fn aggregate(&mut self) {
        let result = self.recover();
        if let Err(e) = &result {
            warn!(error = %e, "couldn't recover XhatEnc");
        }
        self.done.finish(result);
    }

    fn recover(&self) -> ReencryptResult {
        let poly = self.poly.as_ref().ok_or(Error::NotInitialized("poly"))?;
        let req = self.request.as_ref().ok_or(Error::NotInitialized("U"))?;
        recover_reencrypted(
            poly,
            req,
            self.own.as_ref(),
            &self.replies,
            self.threshold,
            self.ctx.roster.len(),
        )
    }
}

/// Verify every reply, place the valid ones at their share index next to our
/// own share and interpolate XhatEnc.
pub(crate) fn recover_reencrypted(
    poly: &PubPoly,
    req: &ReencryptRequest,
    own: Option<&PubShare>,
    replies: &BTreeMap<String, PartialReply>,
    t: usize,
    n: usize,
) -> ReencryptResult {
    let mut uis: Vec<Option<PubShare>> = vec![None; n];
    if let Some(own) = own {
        if let Some(slot) = uis.get_mut(own.i as usize) {
            *slot = Some(own.clone());
        }
    }
    for (from, r) in replies {
        if !verify_partial(poly, &req.u, &req.xc, r) {
            warn!(from = %from, index = r.ui.i, "received invalid share");
            continue;
        }
        match uis.get_mut(r.ui.i as usize) {
            Some(slot) => *slot = Some(r.ui.clone()),
            None => warn!(from = %from, index = r.ui.i, "share index out of range"),
        }
    }

    let xhat_enc = recover_commit(&uis, t, n)?;
    Ok(Reencrypted { xhat_enc, uis })
}

/// Non-coordinating node of a re-encryption: answers the request once, then
/// exits.
///
/// The service creates a follower with the starting request already queued,
/// so the deadline only bounds an inbox that holds no request (a stray message
/// of another kind for this instance). It then exits after `timeout`.
pub struct OcsFollower {
    ctx: InstanceContext,
    shared: Option<SharedSecret>,
    authorizer: Arc<dyn Authorizer>,
    timeout: Duration,
}

impl OcsFollower {
    pub fn new(
        ctx: InstanceContext,
        shared: Option<SharedSecret>,
        authorizer: Arc<dyn Authorizer>,
        timeout: Duration,
    ) -> Self {
        OcsFollower {
            ctx,
            shared,
            authorizer,
            timeout,
        }
    }

    pub async fn run(self, mut inbox: UnboundedReceiver<Inbound>) {
        let deadline = Instant::now() + self.timeout;
        loop {
            tokio::select! {
                msg = inbox.recv() => {
                    let Some(msg) = msg else { return };
                    let Message::Reencrypt(req) = &msg.message else {
                        debug!(from = %msg.from, msg = msg.message.name(), "ignoring message");
                        continue;
                    };
                    let reply = respond(self.shared.as_ref(), self.authorizer.as_ref(), req);
                    if let Err(e) = self.ctx.send(&msg.from, Message::ReencryptReply(reply)) {
                        warn!(to = %msg.from, error = %e, "couldn't send reply");
                    }
                    return;
                }
                _ = sleep_until(deadline) => {
                    debug!(me = %self.ctx.me, "follower timed out");
                    return;
                }
            }
        }
    }
}
