//! Re-encryption of many requests over a single round trip.
//!
//! Same math and failure rules as [`crate::protocol::Ocs`], tracked per item.
//! The run finishes once every item is either recovered or failed; a timeout
//! fails the items still open.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::completion::Completion;
use crate::error::Error;
use crate::network::{Inbound, InstanceContext};
use crate::nizk::generate_partial;
use crate::protocol::{recover_reencrypted, respond, ReencryptResult};
use crate::shamir::{PubPoly, PubShare};
use crate::store::SecretStore;
use crate::types::{
    Message, PartialReply, Reencrypt, ReencryptBatch, ReencryptBatchReply, ReencryptReply,
    ReencryptRequest, SharedSecret,
};
use crate::verify::{is_authorized, Authorizer};

/// One request of a batch with the coordinator's material for its LTS.
#[derive(Clone, Debug)]
pub struct BatchItem {
    pub request: ReencryptRequest,
    pub shared: SharedSecret,
    pub poly: PubPoly,
}

/// Per-item state of the coordinator.
struct ItemState {
    own: Option<PubShare>,
    replies: BTreeMap<String, PartialReply>,
    failed: BTreeSet<String>,
    result: Option<ReencryptResult>,
}

pub struct OcsBatch {
    ctx: InstanceContext,
    items: Vec<BatchItem>,
    states: Vec<ItemState>,
    authorizer: Arc<dyn Authorizer>,
    timeout: Duration,
    threshold: usize,
    deadline: Option<Instant>,
    done: Completion<Vec<ReencryptResult>>,
}

impl OcsBatch {
    pub fn new(
        ctx: InstanceContext,
        items: Vec<BatchItem>,
        authorizer: Arc<dyn Authorizer>,
        timeout: Duration,
    ) -> (Self, oneshot::Receiver<Vec<ReencryptResult>>) {
        let (done, rx) = Completion::new();
        let states = items
            .iter()
            .map(|_| ItemState {
                own: None,
                replies: BTreeMap::new(),
                failed: BTreeSet::new(),
                result: None,
            })
            .collect();
        let batch = OcsBatch {
            threshold: ctx.roster.threshold(),
            ctx,
            items,
            states,
            authorizer,
            timeout,
            deadline: None,
            done,
        };
        (batch, rx)
    }

    pub fn start(&mut self) -> Result<(), Error> {
        self.deadline = Some(Instant::now() + self.timeout);
        if self.items.is_empty() {
            self.done.finish(Vec::new());
            return Ok(());
        }

        for (item, state) in self.items.iter().zip(self.states.iter_mut()) {
            if !is_authorized(self.authorizer.as_ref(), &item.request) {
                state.result = Some(Err(Error::Refused));
                continue;
            }
            let own = generate_partial(&item.shared, &item.request.u, &item.request.xc);
            state.own = Some(own.ui);
        }

        let msg = Message::ReencryptBatch(ReencryptBatch {
            items: self.items.iter().map(|i| Reencrypt::from_request(&i.request)).collect(),
        });
        let unreachable: Vec<String> = self.ctx.broadcast(&msg).into_iter().map(|(a, _)| a).collect();
        info!(
            me = %self.ctx.me,
            items = self.items.len(),
            unreachable = unreachable.len(),
            "batch sent"
        );
        for k in 0..self.items.len() {
            for address in &unreachable {
                self.states[k].failed.insert(address.clone());
            }
            self.progress(k);
        }
        self.check_done();
        Ok(())
    }

    /// Deadline fixed by [`OcsBatch::start`].
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub async fn run(mut self, mut inbox: UnboundedReceiver<Inbound>) {
        let deadline = self.deadline.unwrap_or_else(|| Instant::now() + self.timeout);
        while !self.done.is_finished() {
            tokio::select! {
                msg = inbox.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => self.fail_open(|| Error::Aborted),
                },
                _ = sleep_until(deadline) => {
                    warn!(me = %self.ctx.me, "batch timed out");
                    let timeout = self.timeout;
                    self.fail_open(move || Error::Timeout(timeout));
                }
            }
        }
    }

    fn handle(&mut self, msg: Inbound) {
        let reply = match msg.message {
            Message::ReencryptBatchReply(reply) => reply,
            other => {
                debug!(from = %msg.from, msg = other.name(), "ignoring message");
                return;
            }
        };
        self.handle_reply(msg.from, reply);
    }

    fn handle_reply(&mut self, from: String, reply: ReencryptBatchReply) {
        if self.done.is_finished() {
            debug!(from = %from, "batch reply after completion");
            return;
        }
        let Some(index) = self.ctx.roster.index_of(&from).filter(|_| from != self.ctx.me) else {
            warn!(from = %from, "batch reply from outside the roster");
            return;
        };
        if reply.replies.len() != self.items.len() {
            warn!(from = %from, got = reply.replies.len(), want = self.items.len(), "batch reply size mismatch");
            for k in 0..self.items.len() {
                self.states[k].failed.insert(from.clone());
                self.progress(k);
            }
            self.check_done();
            return;
        }

        for (k, r) in reply.replies.iter().enumerate() {
            if self.states[k].result.is_some() {
                continue;
            }
            match r.to_partial() {
                Ok(Some(p)) if p.ui.i as usize == index => {
                    self.states[k].replies.insert(from.clone(), p);
                }
                Ok(Some(p)) => {
                    warn!(from = %from, item = k, index = p.ui.i, "reply for another node's share");
                    self.states[k].failed.insert(from.clone());
                }
                Ok(None) => {
                    self.states[k].failed.insert(from.clone());
                }
                Err(e) => {
                    warn!(from = %from, item = k, error = %e, "malformed reply");
                    self.states[k].failed.insert(from.clone());
                }
            }
            self.progress(k);
        }
        self.check_done();
    }

    /// Resolve item `k` if it has enough replies or too many failures.
    fn progress(&mut self, k: usize) {
        let n = self.ctx.roster.len();
        let t = self.threshold;
        let item = &self.items[k];
        let state = &mut self.states[k];
        if state.result.is_some() {
            return;
        }
        if state.failed.len() > n - t {
            debug!(item = k, failed = state.failed.len(), "item can't reach quorum");
            state.result = Some(Err(Error::NotEnoughShares));
        } else if state.replies.len() + 1 >= t {
            let result = recover_reencrypted(&item.poly, &item.request, state.own.as_ref(), &state.replies, t, n);
            if let Err(e) = &result {
                warn!(item = k, error = %e, "couldn't recover XhatEnc");
            }
            state.result = Some(result);
        }
    }

    fn check_done(&mut self) {
        if self.states.iter().all(|s| s.result.is_some()) {
            self.deliver();
        }
    }

    fn fail_open(&mut self, err: impl Fn() -> Error) {
        for state in &mut self.states {
            if state.result.is_none() {
                state.result = Some(Err(err()));
            }
        }
        self.deliver();
    }

    fn deliver(&mut self) {
        let results = self
            .states
            .iter_mut()
            .map(|s| s.result.take().unwrap_or(Err(Error::Aborted)))
            .collect();
        self.done.finish(results);
    }
}

/// Non-coordinating node of a batch. Looks up each item's share by LTS id.
///
/// Like [`crate::protocol::OcsFollower`], it is created with the batch queued;
/// the deadline only ends a follower whose inbox never gets one.
pub struct OcsBatchFollower {
    ctx: InstanceContext,
    store: Arc<dyn SecretStore>,
    authorizer: Arc<dyn Authorizer>,
    timeout: Duration,
}

impl OcsBatchFollower {
    pub fn new(
        ctx: InstanceContext,
        store: Arc<dyn SecretStore>,
        authorizer: Arc<dyn Authorizer>,
        timeout: Duration,
    ) -> Self {
        OcsBatchFollower {
            ctx,
            store,
            authorizer,
            timeout,
        }
    }

    fn answer(&self, batch: &ReencryptBatch) -> ReencryptBatchReply {
        let replies = batch
            .items
            .iter()
            .map(|item| {
                let shared = self.store.get(&item.lts_id).ok().map(|r| r.shared);
                respond(shared.as_ref(), self.authorizer.as_ref(), item)
            })
            .collect::<Vec<ReencryptReply>>();
        ReencryptBatchReply { replies }
    }

    pub async fn run(self, mut inbox: UnboundedReceiver<Inbound>) {
        let deadline = Instant::now() + self.timeout;
        loop {
            tokio::select! {
                msg = inbox.recv() => {
                    let Some(msg) = msg else { return };
                    let Message::ReencryptBatch(batch) = &msg.message else {
                        debug!(from = %msg.from, msg = msg.message.name(), "ignoring message");
                        continue;
                    };
                    let reply = self.answer(batch);
                    if let Err(e) = self.ctx.send(&msg.from, Message::ReencryptBatchReply(reply)) {
                        warn!(to = %msg.from, error = %e, "couldn't send batch reply");
                    }
                    return;
                }
                _ = sleep_until(deadline) => {
                    debug!(me = %self.ctx.me, "batch follower timed out");
                    return;
                }
            }
        }
    }
}
