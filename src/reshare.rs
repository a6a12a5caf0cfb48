//! Resharing of an existing LTS onto a new roster.
//!
//! Every old member deals a fresh polynomial of the new threshold whose
//! constant term is its old share. New members check that the constant term of
//! each deal commits to the dealer's old public share, then interpolate the
//! qualified deals at zero over the old indices. The collective public key
//! stays the same, the shares and higher commitments change.
//!
//! Indices live in two spaces: dealers are numbered in the old roster,
//! verifiers in the new one. A node present in both approves its own deal
//! implicitly.

use std::collections::{BTreeMap, BTreeSet};

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use tracing::{debug, warn};

use crate::dkg::{
    open_deal, seal_deal, Deal, Dealing, DistKeyShare, DkgError, Justification, KeyGenerator, Response,
};
use crate::group::{dec_point, dec_scalar, enc_point, enc_scalar, scalar_from_index, PointBytes, G};
use crate::shamir::{lagrange_coeff, PriPoly, PriShare, PubPoly};

pub struct ReshareGenerator {
    longterm: Scalar,
    old: Vec<RistrettoPoint>,
    new: Vec<RistrettoPoint>,
    old_index: Option<u32>,
    new_index: Option<u32>,
    new_t: usize,
    old_poly: PubPoly,
    /// Our resharing polynomial, old members only.
    poly: Option<PriPoly>,
    /// Deals addressed to us by old dealer index, new members only.
    dealings: BTreeMap<u32, Dealing>,
    /// old dealer -> new verifier -> approved
    responses: BTreeMap<u32, BTreeMap<u32, bool>>,
    pending: Vec<Justification>,
    disqualified: BTreeSet<u32>,
}

impl ReshareGenerator {
    /// `old_commits` are the commitments of the collective polynomial being
    /// reshared; their count is the old threshold. Old members pass their share.
    pub fn new(
        longterm: Scalar,
        old: Vec<RistrettoPoint>,
        new: Vec<RistrettoPoint>,
        old_commits: Vec<RistrettoPoint>,
        new_t: usize,
        share: Option<&DistKeyShare>,
    ) -> Result<Self, DkgError> {
        let old_t = old_commits.len();
        if old_t == 0 || old_t > old.len() {
            return Err(DkgError::InvalidThreshold { t: old_t, n: old.len() });
        }
        if new_t == 0 || new_t > new.len() {
            return Err(DkgError::InvalidThreshold { t: new_t, n: new.len() });
        }
        let public = G * longterm;
        let old_index = old.iter().position(|p| *p == public).map(|i| i as u32);
        let new_index = new.iter().position(|p| *p == public).map(|i| i as u32);
        if old_index.is_none() && new_index.is_none() {
            return Err(DkgError::NotParticipant);
        }
        let old_poly = PubPoly::new(G, old_commits);

        let poly = match old_index {
            Some(i) => {
                let share = share
                    .filter(|s| s.share.i == i && old_poly.check(&s.share))
                    .ok_or(DkgError::InvalidOldShare)?;
                Some(PriPoly::random(new_t, share.share.v))
            }
            None => None,
        };

        let mut dealings = BTreeMap::new();
        if let (Some(poly), Some(i), Some(j)) = (&poly, old_index, new_index) {
            dealings.insert(
                i,
                Dealing {
                    commits: poly.commit(&G),
                    share: Some(poly.eval(j).v),
                },
            );
        }

        Ok(ReshareGenerator {
            longterm,
            old,
            new,
            old_index,
            new_index,
            new_t,
            old_poly,
            poly,
            dealings,
            responses: BTreeMap::new(),
            pending: Vec::new(),
            disqualified: BTreeSet::new(),
        })
    }

    pub fn old_threshold(&self) -> usize {
        self.old_poly.threshold()
    }

    fn same_node(&self, dealer: u32, verifier: u32) -> bool {
        match (self.old.get(dealer as usize), self.new.get(verifier as usize)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn check_dealer(&self, i: u32) -> Result<(), DkgError> {
        if (i as usize) < self.old.len() {
            Ok(())
        } else {
            Err(DkgError::InvalidIndex(i))
        }
    }

    fn check_verifier(&self, i: u32) -> Result<(), DkgError> {
        if (i as usize) < self.new.len() {
            Ok(())
        } else {
            Err(DkgError::InvalidIndex(i))
        }
    }

    fn record(&mut self, dealer: u32, verifier: u32, approved: bool) -> Result<(), DkgError> {
        let by_dealer = self.responses.entry(dealer).or_default();
        if by_dealer.contains_key(&verifier) {
            return Err(DkgError::DuplicateResponse { dealer, verifier });
        }
        by_dealer.insert(verifier, approved);
        Ok(())
    }

    fn flush_pending(&mut self) {
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
            self.apply_justification(&j);
        }
    }

    fn apply_justification(&mut self, j: &Justification) {
        if self.responses.get(&j.dealer).and_then(|r| r.get(&j.verifier)) != Some(&false) {
            return;
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
                if Some(j.verifier) == self.new_index {
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
    }

    /// Old dealers still qualified.
    pub fn qual(&self) -> Vec<u32> {
        (0..self.old.len() as u32)
            .filter(|d| !self.disqualified.contains(d))
            .collect()
    }

    /// Every new member other than the dealer itself approved `dealer`.
    fn approved_by_all(&self, dealer: u32) -> bool {
        let responses = self.responses.get(&dealer);
        (0..self.new.len() as u32)
            .filter(|v| !self.same_node(dealer, *v))
            .all(|v| responses.and_then(|r| r.get(&v)).copied() == Some(true))
    }

    fn dealer_complete(&self, dealer: u32) -> bool {
        self.dealings
            .get(&dealer)
            .is_some_and(|d| d.share.is_some())
            && self.approved_by_all(dealer)
    }
}

impl KeyGenerator for ReshareGenerator {
    /// Our resharing polynomial evaluated at every other new member.
    fn deals(&self) -> Result<BTreeMap<u32, Deal>, DkgError> {
        let (Some(poly), Some(dealer)) = (&self.poly, self.old_index) else {
            return Ok(BTreeMap::new());
        };
        let commits: Vec<PointBytes> = poly.commit(&G).commits.iter().map(enc_point).collect();
        let mut deals = BTreeMap::new();
        for (j, recipient) in self.new.iter().enumerate() {
            let j = j as u32;
            if self.same_node(dealer, j) {
                continue;
            }
            let share = poly.eval(j).v;
            deals.insert(j, seal_deal(&self.longterm, recipient, dealer, j, &commits, &share)?);
        }
        Ok(deals)
    }

    /// A deal whose constant term isn't the dealer's old public share
    /// disqualifies the dealer and is answered with a complaint.
    fn process_deal(&mut self, deal: &Deal) -> Result<Response, DkgError> {
        self.check_dealer(deal.dealer)?;
        let Some(me) = self.new_index else {
            return Err(DkgError::NotParticipant);
        };
        if deal.recipient != me {
            return Err(DkgError::WrongRecipient {
                got: deal.recipient,
                want: me,
            });
        }
        if self.dealings.contains_key(&deal.dealer) {
            return Err(DkgError::DuplicateDeal(deal.dealer));
        }

        let commits = deal
            .commits
            .iter()
            .map(dec_point)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| DkgError::InvalidCommitments(deal.dealer))?;
        if commits.len() != self.new_t {
            return Err(DkgError::InvalidCommitments(deal.dealer));
        }
        let commits = PubPoly::new(G, commits);

        if commits.commit() != self.old_poly.eval(deal.dealer).v {
            warn!(dealer = deal.dealer, "deal doesn't reshare the dealer's old share");
            self.disqualified.insert(deal.dealer);
        }
        let share = open_deal(&self.longterm, &self.old[deal.dealer as usize], deal)
            .filter(|v| commits.check(&PriShare { i: me, v: *v }))
            .filter(|_| !self.disqualified.contains(&deal.dealer));
        let approved = share.is_some();
        if !approved {
            warn!(dealer = deal.dealer, "complaining about resharing deal");
        }

        self.dealings.insert(deal.dealer, Dealing { commits, share });
        self.record(deal.dealer, me, approved)?;
        self.flush_pending();

        Ok(Response {
            dealer: deal.dealer,
            verifier: me,
            approved,
        })
    }

    fn process_response(&mut self, resp: &Response) -> Result<Option<Justification>, DkgError> {
        self.check_dealer(resp.dealer)?;
        self.check_verifier(resp.verifier)?;
        if self.same_node(resp.dealer, resp.verifier) {
            return Err(DkgError::InvalidIndex(resp.verifier));
        }
        self.record(resp.dealer, resp.verifier, resp.approved)?;

        let poly = match &self.poly {
            Some(poly) if !resp.approved && Some(resp.dealer) == self.old_index => poly,
            _ => {
                self.flush_pending();
                return Ok(None);
            }
        };
        debug!(verifier = resp.verifier, "justifying own resharing deal");
        let share = enc_scalar(&poly.eval(resp.verifier).v);
        if let Some(r) = self.responses.get_mut(&resp.dealer) {
            r.insert(resp.verifier, true);
        }
        Ok(Some(Justification {
            dealer: resp.dealer,
            verifier: resp.verifier,
            share,
        }))
    }

    fn process_justification(&mut self, j: &Justification) -> Result<(), DkgError> {
        self.check_dealer(j.dealer)?;
        self.check_verifier(j.verifier)?;
        self.pending.push(j.clone());
        self.flush_pending();
        Ok(())
    }

    /// New members: enough qualified dealers, each one complete. A member
    /// leaving the roster only waits for its own deal to be approved.
    fn certified(&self) -> bool {
        if self.new_index.is_none() {
            return self.old_index.is_some_and(|i| self.approved_by_all(i));
        }
        let qual = self.qual();
        qual.len() >= self.old_threshold() && qual.iter().all(|d| self.dealer_complete(*d))
    }

    fn dist_key_share(&self) -> Result<Option<DistKeyShare>, DkgError> {
        if !self.certified() {
            return Err(DkgError::NotCertified);
        }
        let Some(me) = self.new_index else {
            return Ok(None);
        };
        let qual = self.qual();
        let xs: Vec<Scalar> = qual.iter().map(|d| scalar_from_index(*d)).collect();

        let mut v = Scalar::ZERO;
        let mut commits = vec![RistrettoPoint::identity(); self.new_t];
        for (d, x) in qual.iter().zip(&xs) {
            let lambda = lagrange_coeff(x, &xs);
            let dealing = &self.dealings[d];
            v += lambda * dealing.share.ok_or(DkgError::NotCertified)?;
            for (acc, c) in commits.iter_mut().zip(&dealing.commits.commits) {
                *acc += c * lambda;
            }
        }
        Ok(Some(DistKeyShare {
            share: PriShare { i: me, v },
            commits,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkg::tests::run_dkg;
    use crate::randutil::random_scalar;
    use crate::shamir::recover_secret;

    struct OldGroup {
        privs: Vec<Scalar>,
        pubs: Vec<RistrettoPoint>,
        shares: Vec<DistKeyShare>,
    }

    fn old_group(n: usize, t: usize) -> OldGroup {
        // long-term keys are independent of the shares
        let dkgs = run_dkg(n, t);
        let shares: Vec<DistKeyShare> = dkgs.iter().map(|d| d.dist_key_share().unwrap()).collect();
        let privs: Vec<Scalar> = (0..n).map(|_| random_scalar()).collect();
        let pubs = privs.iter().map(|p| G * p).collect();
        OldGroup { privs, pubs, shares }
    }

    /// Exchange every deal, response and justification in memory.
    fn run_reshare(gens: &mut [ReshareGenerator], new_pos: &[Option<usize>]) {
        let mut responses = Vec::new();
        for i in 0..gens.len() {
            for (j, deal) in gens[i].deals().unwrap() {
                let k = new_pos.iter().position(|p| *p == Some(j as usize)).unwrap();
                responses.push((k, gens[k].process_deal(&deal).unwrap()));
            }
        }
        for (from, resp) in &responses {
            for (k, g) in gens.iter_mut().enumerate() {
                if k != *from {
                    assert!(g.process_response(resp).unwrap().is_none());
                }
            }
        }
    }

    #[test]
    fn test_reshare_same_roster_keeps_public_key() {
        let (n, t) = (4, 3);
        let old = old_group(n, t);
        let x = old.shares[0].public();

        let mut gens: Vec<ReshareGenerator> = (0..n)
            .map(|i| {
                ReshareGenerator::new(
                    old.privs[i],
                    old.pubs.clone(),
                    old.pubs.clone(),
                    old.shares[i].commits.clone(),
                    t,
                    Some(&old.shares[i]),
                )
                .unwrap()
            })
            .collect();
        let pos: Vec<Option<usize>> = (0..n).map(Some).collect();
        run_reshare(&mut gens, &pos);

        let new: Vec<DistKeyShare> = gens
            .iter()
            .map(|g| g.dist_key_share().unwrap().unwrap())
            .collect();
        assert!(new.iter().all(|s| s.public() == x));
        assert!(new.iter().all(|s| s.commits == new[0].commits));
        assert!(new.iter().all(|s| s.pub_poly().check(&s.share)));
        assert!(new.iter().zip(&old.shares).all(|(a, b)| a.share.v != b.share.v));

        let pri: Vec<Option<PriShare>> = new.iter().map(|s| Some(s.share.clone())).collect();
        assert_eq!(G * recover_secret(&pri, t, n).unwrap(), x);
    }

    #[test]
    fn test_reshare_to_larger_roster() {
        let (n, t) = (4, 3);
        let old = old_group(n, t);
        let x = old.shares[0].public();

        // one node leaves, three join: new roster is old[1..] + 3 newcomers
        let joiners: Vec<Scalar> = (0..3).map(|_| random_scalar()).collect();
        let mut new_pubs: Vec<RistrettoPoint> = old.pubs[1..].to_vec();
        new_pubs.extend(joiners.iter().map(|p| G * p));
        let new_t = 5;

        let mut gens = Vec::new();
        let mut pos = Vec::new();
        for i in 0..n {
            gens.push(
                ReshareGenerator::new(
                    old.privs[i],
                    old.pubs.clone(),
                    new_pubs.clone(),
                    old.shares[i].commits.clone(),
                    new_t,
                    Some(&old.shares[i]),
                )
                .unwrap(),
            );
            pos.push(if i == 0 { None } else { Some(i - 1) });
        }
        for (k, p) in joiners.iter().enumerate() {
            gens.push(
                ReshareGenerator::new(*p, old.pubs.clone(), new_pubs.clone(), old.shares[0].commits.clone(), new_t, None)
                    .unwrap(),
            );
            pos.push(Some(n - 1 + k));
        }
        run_reshare(&mut gens, &pos);

        assert!(gens.iter().all(|g| g.certified()));
        assert!(gens[0].dist_key_share().unwrap().is_none());
        let new: Vec<DistKeyShare> = gens[1..]
            .iter()
            .map(|g| g.dist_key_share().unwrap().unwrap())
            .collect();
        assert_eq!(new[0].commits.len(), new_t);
        assert!(new.iter().all(|s| s.public() == x && s.pub_poly().check(&s.share)));

        let mut pri: Vec<Option<PriShare>> = new.iter().map(|s| Some(s.share.clone())).collect();
        pri.sort_by_key(|s| s.as_ref().map(|s| s.i));
        assert_eq!(G * recover_secret(&pri, new_t, new_pubs.len()).unwrap(), x);
    }

    #[test]
    fn test_deal_not_resharing_old_share_is_rejected() {
        let (n, t) = (3, 3);
        let old = old_group(n, t);
        let mut honest = ReshareGenerator::new(
            old.privs[0],
            old.pubs.clone(),
            old.pubs.clone(),
            old.shares[0].commits.clone(),
            t,
            Some(&old.shares[0]),
        )
        .unwrap();

        // dealer 1 reshares a made-up value instead of its share
        let mut fake = old.shares[1].clone();
        fake.share.v = random_scalar();
        assert!(matches!(
            ReshareGenerator::new(old.privs[1], old.pubs.clone(), old.pubs.clone(), fake.commits.clone(), t, Some(&fake)),
            Err(DkgError::InvalidOldShare)
        ));

        let poly = PriPoly::random(t, random_scalar());
        let commits: Vec<PointBytes> = poly.commit(&G).commits.iter().map(enc_point).collect();
        let deal = seal_deal(&old.privs[1], &old.pubs[0], 1, 0, &commits, &poly.eval(0).v).unwrap();
        let resp = honest.process_deal(&deal).unwrap();
        assert!(!resp.approved);
        assert_eq!(honest.qual(), vec![0, 2]);
    }

    #[test]
    fn test_outsider_is_rejected() {
        let old = old_group(3, 2);
        assert!(matches!(
            ReshareGenerator::new(random_scalar(), old.pubs.clone(), old.pubs.clone(), old.shares[0].commits.clone(), 2, None),
            Err(DkgError::NotParticipant)
        ));
        assert!(matches!(
            ReshareGenerator::new(old.privs[0], old.pubs.clone(), old.pubs.clone(), old.shares[0].commits.clone(), 2, None),
            Err(DkgError::InvalidOldShare)
        ));
    }
}
