//! Pedersen distributed key generation over a Feldman VSS.
//!
//! Every participant deals a random polynomial. Shares travel encrypted under a
//! key derived from the Diffie-Hellman of the two long-term keys. Recipients
//! approve or complain, a dealer answers complaints with a justification that
//! reveals the disputed share, and dealers failing to justify are dropped from
//! the qualified set (QUAL).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::group::{dec_point, dec_scalar, enc_point, enc_scalar, PointBytes, ScalarBytes, G};
use crate::hash::derive_key;
use crate::randutil::{random_bytes, random_scalar};
use crate::shamir::{PriPoly, PriShare, PubPoly};

const DEAL_SALT: &[u8] = b"calypso::dkg-deal";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DkgError {
    #[error("own public key not found in list of participants")]
    NotParticipant,

    #[error("invalid threshold {t} for {n} participants")]
    InvalidThreshold { t: usize, n: usize },

    #[error("index {0} out of range")]
    InvalidIndex(u32),

    #[error("deal for {got} received by {want}")]
    WrongRecipient { got: u32, want: u32 },

    #[error("deal from dealer {0} already processed")]
    DuplicateDeal(u32),

    #[error("response from {verifier} for dealer {dealer} already processed")]
    DuplicateResponse { dealer: u32, verifier: u32 },

    #[error("dealer {0} sent malformed commitments")]
    InvalidCommitments(u32),

    #[error("justification for {verifier} doesn't match a complaint against dealer {dealer}")]
    UnexpectedJustification { dealer: u32, verifier: u32 },

    #[error("distributed key not certified")]
    NotCertified,

    #[error("old share missing or not on the old public polynomial")]
    InvalidOldShare,

    #[error("deal encryption failed")]
    Encryption,
}

impl DkgError {
    /// Errors a participant may see in normal operation and can ignore.
    pub fn is_benign(&self) -> bool {
        matches!(self, DkgError::DuplicateResponse { .. })
    }
}

/// Encrypted share of the dealer's polynomial for one recipient.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deal {
    pub dealer: u32,
    pub recipient: u32,
    pub commits: Vec<PointBytes>,
    pub nonce: [u8; 12],
    pub cipher: Vec<u8>,
}

/// A verifier's verdict on a deal, multicast to every participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub dealer: u32,
    pub verifier: u32,
    pub approved: bool,
}

/// A dealer's answer to a complaint: the disputed share in the clear.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Justification {
    pub dealer: u32,
    pub verifier: u32,
    pub share: ScalarBytes,
}

/// Output of a certified DKG: this node's share of the collective secret and the
/// commitments of the collective polynomial.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DistKeyShare {
    pub share: PriShare,
    pub commits: Vec<RistrettoPoint>,
}

impl DistKeyShare {
    pub fn public(&self) -> RistrettoPoint {
        self.commits
            .first()
            .copied()
            .unwrap_or_else(RistrettoPoint::identity)
    }

    pub fn pub_poly(&self) -> PubPoly {
        PubPoly::new(G, self.commits.clone())
    }
}

impl fmt::Debug for DistKeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistKeyShare")
            .field("index", &self.share.i)
            .field("commits", &self.commits.len())
            .finish_non_exhaustive()
    }
}

/// What this node knows about one dealer's deal.
pub(crate) struct Dealing {
    pub(crate) commits: PubPoly,
    /// Our share, `None` while we hold a complaint against the dealer.
    pub(crate) share: Option<Scalar>,
}

pub struct DistKeyGenerator {
    index: u32,
    longterm: Scalar,
    participants: Vec<RistrettoPoint>,
    t: usize,
    poly: PriPoly,
    dealings: BTreeMap<u32, Dealing>,
    /// dealer -> verifier -> approved
    responses: BTreeMap<u32, BTreeMap<u32, bool>>,
    /// Justifications waiting for their deal or complaint.
    pending: Vec<Justification>,
    disqualified: BTreeSet<u32>,
}

fn deal_key(own: &Scalar, other: &RistrettoPoint, dealer: &RistrettoPoint, recipient: &RistrettoPoint) -> Result<[u8; 32], DkgError> {
    let dh = other * own;
    let mut info = Vec::with_capacity(64);
    info.extend_from_slice(&enc_point(dealer));
    info.extend_from_slice(&enc_point(recipient));
    derive_key(DEAL_SALT, &enc_point(&dh), &info).map_err(|_| DkgError::Encryption)
}

fn deal_aad(dealer: u32, recipient: u32, commits: &[PointBytes]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(8 + 32 * commits.len());
    aad.extend_from_slice(&dealer.to_le_bytes());
    aad.extend_from_slice(&recipient.to_le_bytes());
    for c in commits {
        aad.extend_from_slice(c);
    }
    aad
}

/// Encrypt `share` from the dealer holding `longterm` to recipient `j`.
pub(crate) fn seal_deal(
    longterm: &Scalar,
    recipient: &RistrettoPoint,
    dealer: u32,
    j: u32,
    commits: &[PointBytes],
    share: &Scalar,
) -> Result<Deal, DkgError> {
    let me = G * longterm;
    let key = deal_key(longterm, recipient, &me, recipient)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| DkgError::Encryption)?;
    let nonce: [u8; 12] = random_bytes();
    let plain = enc_scalar(share);
    let aad = deal_aad(dealer, j, commits);
    let ct = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &plain,
                aad: &aad,
            },
        )
        .map_err(|_| DkgError::Encryption)?;
    Ok(Deal {
        dealer,
        recipient: j,
        commits: commits.to_vec(),
        nonce,
        cipher: ct,
    })
}

/// Decrypt a deal sent by `dealer` to the holder of `longterm`.
pub(crate) fn open_deal(longterm: &Scalar, dealer: &RistrettoPoint, deal: &Deal) -> Option<Scalar> {
    let me = G * longterm;
    let key = deal_key(longterm, dealer, dealer, &me).ok()?;
    let cipher = Aes256Gcm::new_from_slice(&key).ok()?;
    let aad = deal_aad(deal.dealer, deal.recipient, &deal.commits);
    let plain = cipher
        .decrypt(
            Nonce::from_slice(&deal.nonce),
            Payload {
                msg: &deal.cipher,
                aad: &aad,
            },
        )
        .ok()?;
    let bytes: ScalarBytes = plain.as_slice().try_into().ok()?;
    dec_scalar(&bytes).ok()
}

/// State machine driven by the networked setup: a fresh DKG or a resharing.
///
/// Deals are keyed by the recipient's position in the roster of the run.
pub trait KeyGenerator: Send {
    fn deals(&self) -> Result<BTreeMap<u32, Deal>, DkgError>;
    fn process_deal(&mut self, deal: &Deal) -> Result<Response, DkgError>;
    fn process_response(&mut self, resp: &Response) -> Result<Option<Justification>, DkgError>;
    fn process_justification(&mut self, j: &Justification) -> Result<(), DkgError>;
    fn certified(&self) -> bool;
    /// Share held after the run, `None` for a node that only dealt.
    fn dist_key_share(&self) -> Result<Option<DistKeyShare>, DkgError>;
}

impl DistKeyGenerator {
    /// Fresh generator for the participant holding `longterm`, with a random
    /// secret polynomial of `t` coefficients.
    pub fn new(longterm: Scalar, participants: Vec<RistrettoPoint>, t: usize) -> Result<Self, DkgError> {
        let n = participants.len();
        if t == 0 || t > n {
            return Err(DkgError::InvalidThreshold { t, n });
        }
        let public = G * longterm;
        let index = participants
            .iter()
            .position(|p| *p == public)
            .ok_or(DkgError::NotParticipant)? as u32;

        let poly = PriPoly::random(t, random_scalar());
        let own = Dealing {
            commits: poly.commit(&G),
            share: Some(poly.eval(index).v),
        };
        let mut dealings = BTreeMap::new();
        dealings.insert(index, own);

        Ok(DistKeyGenerator {
            index,
            longterm,
            participants,
            t,
            poly,
            dealings,
            responses: BTreeMap::new(),
            pending: Vec::new(),
            disqualified: BTreeSet::new(),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn threshold(&self) -> usize {
        self.t
    }

    pub fn n(&self) -> usize {
        self.participants.len()
    }

    /// Deals this node waits for, one from every other participant.
    pub fn expected_deals(&self) -> usize {
        self.participants.len() - 1
    }

    fn check_index(&self, i: u32) -> Result<(), DkgError> {
        if (i as usize) < self.participants.len() {
            Ok(())
        } else {
            Err(DkgError::InvalidIndex(i))
        }
    }

    /// One encrypted deal per other participant, keyed by recipient index.
    pub fn deals(&self) -> Result<BTreeMap<u32, Deal>, DkgError> {
        let commits: Vec<PointBytes> = self.poly.commit(&G).commits.iter().map(enc_point).collect();

        let mut deals = BTreeMap::new();
        for (j, recipient) in self.participants.iter().enumerate() {
            let j = j as u32;
            if j == self.index {
                continue;
            }
            let share = self.poly.eval(j).v;
            let deal = seal_deal(&self.longterm, recipient, self.index, j, &commits, &share)?;
            deals.insert(j, deal);
        }
        Ok(deals)
    }

    /// Verify a deal addressed to us and produce the response to multicast.
    ///
    /// Undecryptable shares and shares inconsistent with the commitments yield a
    /// complaint (`approved == false`) rather than an error.
    pub fn process_deal(&mut self, deal: &Deal) -> Result<Response, DkgError> {
        self.check_index(deal.dealer)?;
        if deal.recipient != self.index {
            return Err(DkgError::WrongRecipient {
                got: deal.recipient,
                want: self.index,
            });
        }
        if deal.dealer == self.index || self.dealings.contains_key(&deal.dealer) {
            return Err(DkgError::DuplicateDeal(deal.dealer));
        }

        let commits = deal
            .commits
            .iter()
            .map(dec_point)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| DkgError::InvalidCommitments(deal.dealer))?;
        if commits.len() != self.t {
            return Err(DkgError::InvalidCommitments(deal.dealer));
        }
        let commits = PubPoly::new(G, commits);

        let share = self
            .participants
            .get(deal.dealer as usize)
            .and_then(|dealer| open_deal(&self.longterm, dealer, deal))
            .filter(|v| {
                commits.check(&PriShare {
                    i: self.index,
                    v: *v,
                })
            });
        let approved = share.is_some();
        if !approved {
            warn!(dealer = deal.dealer, "complaining about deal");
        }

        self.dealings.insert(deal.dealer, Dealing { commits, share });
        self.record(deal.dealer, self.index, approved)?;
        self.flush_pending()?;

        Ok(Response {
            dealer: deal.dealer,
            verifier: self.index,
            approved,
        })
    }

    fn record(&mut self, dealer: u32, verifier: u32, approved: bool) -> Result<(), DkgError> {
        let by_dealer = self.responses.entry(dealer).or_default();
        if by_dealer.contains_key(&verifier) {
            return Err(DkgError::DuplicateResponse { dealer, verifier });
        }
        by_dealer.insert(verifier, approved);
        Ok(())
    }

    /// Record another participant's response. A complaint against our own deal
    /// returns the justification to multicast.
    pub fn process_response(&mut self, resp: &Response) -> Result<Option<Justification>, DkgError> {
        self.check_index(resp.dealer)?;
        self.check_index(resp.verifier)?;
        if resp.verifier == resp.dealer {
            return Err(DkgError::InvalidIndex(resp.verifier));
        }
        self.record(resp.dealer, resp.verifier, resp.approved)?;

        if resp.approved || resp.dealer != self.index {
            self.flush_pending()?;
            return Ok(None);
        }
        debug!(verifier = resp.verifier, "justifying own deal");
        if let Some(r) = self.responses.get_mut(&self.index) {
            r.insert(resp.verifier, true);
        }
        Ok(Some(Justification {
            dealer: self.index,
            verifier: resp.verifier,
            share: enc_scalar(&self.poly.eval(resp.verifier).v),
        }))
    }

    /// Check a revealed share against the dealer's commitments. A valid one turns
    /// the complaint into an approval, an invalid one disqualifies the dealer.
    pub fn process_justification(&mut self, j: &Justification) -> Result<(), DkgError> {
        self.check_index(j.dealer)?;
        self.check_index(j.verifier)?;
        self.pending.push(j.clone());
        self.flush_pending()
    }

    /// Apply the justifications whose deal and complaint are both known.
    fn flush_pending(&mut self) -> Result<(), DkgError> {
        let (ready, waiting): (Vec<Justification>, Vec<Justification>) =
            std::mem::take(&mut self.pending).into_iter().partition(|j| {
                self.dealings.contains_key(&j.dealer)
                    && self
                        .responses
                        .get(&j.dealer)
                        .is_some_and(|r| r.contains_key(&j.verifier))
            });
        self.pending = waiting;
        for j in ready {
            self.apply_justification(&j)?;
        }
        Ok(())
    }

    fn apply_justification(&mut self, j: &Justification) -> Result<(), DkgError> {
        match self.responses.get(&j.dealer).and_then(|r| r.get(&j.verifier)) {
            Some(false) => {}
            None => return Ok(()),
            Some(true) => {
                return Err(DkgError::UnexpectedJustification {
                    dealer: j.dealer,
                    verifier: j.verifier,
                })
            }
        }

        let valid = dec_scalar(&j.share).ok().filter(|v| {
            self.dealings[&j.dealer].commits.check(&PriShare {
                i: j.verifier,
                v: *v,
            })
        });
        match valid {
            Some(v) => {
                if let Some(r) = self.responses.get_mut(&j.dealer) {
                    r.insert(j.verifier, true);
                }
                if j.verifier == self.index {
                    if let Some(d) = self.dealings.get_mut(&j.dealer) {
                        d.share = Some(v);
                    }
                }
            }
            None => {
                warn!(dealer = j.dealer, "invalid justification, disqualifying dealer");
                self.disqualified.insert(j.dealer);
            }
        }
        Ok(())
    }

    /// Dealers still part of the qualified set.
    pub fn qual(&self) -> Vec<u32> {
        (0..self.participants.len() as u32)
            .filter(|d| !self.disqualified.contains(d))
            .collect()
    }

    fn dealer_complete(&self, dealer: u32) -> bool {
        let Some(dealing) = self.dealings.get(&dealer) else {
            return false;
        };
        if dealing.share.is_none() {
            return false;
        }
        let responses = self.responses.get(&dealer);
        (0..self.participants.len() as u32)
            .filter(|v| *v != dealer)
            .all(|v| responses.and_then(|r| r.get(&v)).copied() == Some(true))
    }

    /// Every qualified dealer has been approved by all other participants and
    /// enough dealers remain.
    pub fn certified(&self) -> bool {
        let qual = self.qual();
        qual.len() >= self.t && qual.iter().all(|d| self.dealer_complete(*d))
    }

    /// Sum of the qualified shares and of their commitments.
    pub fn dist_key_share(&self) -> Result<DistKeyShare, DkgError> {
        if !self.certified() {
            return Err(DkgError::NotCertified);
        }
        let mut v = Scalar::ZERO;
        let mut commits = vec![RistrettoPoint::identity(); self.t];
        for d in self.qual() {
            let dealing = &self.dealings[&d];
            v += dealing.share.ok_or(DkgError::NotCertified)?;
            for (acc, c) in commits.iter_mut().zip(&dealing.commits.commits) {
                *acc += c;
            }
        }
        Ok(DistKeyShare {
            share: PriShare { i: self.index, v },
            commits,
        })
    }
}

impl KeyGenerator for DistKeyGenerator {
    fn deals(&self) -> Result<BTreeMap<u32, Deal>, DkgError> {
        DistKeyGenerator::deals(self)
    }

    fn process_deal(&mut self, deal: &Deal) -> Result<Response, DkgError> {
        DistKeyGenerator::process_deal(self, deal)
    }

    fn process_response(&mut self, resp: &Response) -> Result<Option<Justification>, DkgError> {
        DistKeyGenerator::process_response(self, resp)
    }

    fn process_justification(&mut self, j: &Justification) -> Result<(), DkgError> {
        DistKeyGenerator::process_justification(self, j)
    }

    fn certified(&self) -> bool {
        DistKeyGenerator::certified(self)
    }

    fn dist_key_share(&self) -> Result<Option<DistKeyShare>, DkgError> {
        DistKeyGenerator::dist_key_share(self).map(Some)
    }
}
