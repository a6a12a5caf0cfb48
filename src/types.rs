use std::fmt;

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dkg::{Deal, DistKeyShare, Justification, Response};
use crate::error::Error;
use crate::group::{
    byzantine_threshold, dec_point, dec_scalar, enc_point, enc_scalar, PointBytes, ScalarBytes, G,
};
use crate::randutil::{random_bytes, random_scalar};
use crate::shamir::PubShare;

/// Identifier of one long-term secret (LTS) instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LtsId(pub [u8; 32]);

impl LtsId {
    pub fn random() -> Self {
        LtsId(random_bytes())
    }

    /// Derive an id from an external reference (a ledger instance, a name...).
    pub fn from_seed(seed: &[u8]) -> Self {
        let mut id = [0u8; 32];
        id.copy_from_slice(&Sha256::digest(seed));
        LtsId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for LtsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for LtsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LtsId({})", hex::encode(&self.0[..8]))
    }
}

#[derive(Clone)]
pub struct KeyPair {
    pub private: Scalar,
    pub public: RistrettoPoint,
}

impl KeyPair {
    pub fn random() -> Self {
        let private = random_scalar();
        KeyPair {
            private,
            public: G * private,
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(enc_point(&self.public)))
            .finish_non_exhaustive()
    }
}

/// Network address plus long-term public key of a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub address: String,
    pub public: PointBytes,
}

impl ServerIdentity {
    pub fn new(address: impl Into<String>, public: &RistrettoPoint) -> Self {
        ServerIdentity {
            address: address.into(),
            public: enc_point(public),
        }
    }

    pub fn public_point(&self) -> Result<RistrettoPoint, Error> {
        dec_point(&self.public)
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Ordered participants of an LTS; the position is the canonical share index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    pub list: Vec<ServerIdentity>,
}

impl Roster {
    pub fn new(list: Vec<ServerIdentity>) -> Self {
        Roster { list }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn threshold(&self) -> usize {
        byzantine_threshold(self.list.len())
    }

    pub fn index_of(&self, address: &str) -> Option<usize> {
        self.list.iter().position(|si| si.address == address)
    }

    pub fn get(&self, i: usize) -> Option<&ServerIdentity> {
        self.list.get(i)
    }

    /// Same roster rotated so that `root` comes first.
    pub fn rotated_to(&self, root: &str) -> Option<Roster> {
        let pos = self.index_of(root)?;
        let mut list = self.list.clone();
        list.rotate_left(pos);
        Some(Roster { list })
    }
}

/// A node's share of an LTS, as certified by the DKG. Never leaves the node.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedSecret {
    pub index: u32,
    pub v: Scalar,
    pub x: RistrettoPoint,
    pub commits: Vec<RistrettoPoint>,
}

impl SharedSecret {
    pub fn from_dist_key_share(dks: &DistKeyShare) -> Result<Self, Error> {
        let x = *dks.commits.first().ok_or(Error::NotInitialized("commits"))?;
        Ok(SharedSecret {
            index: dks.share.i,
            v: dks.share.v,
            x,
            commits: dks.commits.clone(),
        })
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecret")
            .field("index", &self.index)
            .field("x", &hex::encode(enc_point(&self.x)))
            .field("commits", &self.commits.len())
            .finish_non_exhaustive()
    }
}

/// A re-encryption request as seen by the policy gate.
#[derive(Clone, Debug, PartialEq)]
pub struct ReencryptRequest {
    pub lts_id: LtsId,
    pub u: RistrettoPoint,
    pub xc: RistrettoPoint,
    pub verification_data: Vec<u8>,
}

/// One node's partial re-encryption with its NIZK proof.
#[derive(Clone, Debug, PartialEq)]
pub struct PartialReply {
    pub ui: PubShare,
    pub ei: Scalar,
    pub fi: Scalar,
}

// =============================
// Wire messages
// =============================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Init {
    pub lts_id: LtsId,
    pub roster: Roster,
    pub threshold: u32,
    pub wait: bool,
    /// Set when the run reshares an existing LTS.
    #[serde(default)]
    pub reshare: Option<ReshareInit>,
}

/// What every node of a resharing needs to know about the old LTS.
///
/// The roster of the run lists the `new_n` members of the new roster first,
/// then the old members that leave.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReshareInit {
    /// Long-term keys of the old roster, in old share order.
    pub old_publics: Vec<PointBytes>,
    /// Commitments of the polynomial being reshared.
    pub old_commits: Vec<PointBytes>,
    pub new_n: u32,
}

impl ReshareInit {
    /// Collective public key, unchanged by the resharing.
    pub fn x(&self) -> Result<RistrettoPoint, Error> {
        dec_point(self.old_commits.first().ok_or(Error::NotInitialized("old commits"))?)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitReply {
    pub public: PointBytes,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartDeal {
    pub publics: Vec<PointBytes>,
    pub threshold: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reencrypt {
    pub lts_id: LtsId,
    pub u: PointBytes,
    pub xc: PointBytes,
    pub verification_data: Vec<u8>,
}

impl Reencrypt {
    pub fn from_request(req: &ReencryptRequest) -> Self {
        Reencrypt {
            lts_id: req.lts_id,
            u: enc_point(&req.u),
            xc: enc_point(&req.xc),
            verification_data: req.verification_data.clone(),
        }
    }

    pub fn to_request(&self) -> Result<ReencryptRequest, Error> {
        Ok(ReencryptRequest {
            lts_id: self.lts_id,
            u: dec_point(&self.u)?,
            xc: dec_point(&self.xc)?,
            verification_data: self.verification_data.clone(),
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyShare {
    pub i: u32,
    pub v: PointBytes,
    pub ei: ScalarBytes,
    pub fi: ScalarBytes,
}

/// `share == None` is the refusal sentinel.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReencryptReply {
    pub share: Option<ReplyShare>,
}

impl ReencryptReply {
    pub fn refused() -> Self {
        ReencryptReply { share: None }
    }

    pub fn from_partial(p: &PartialReply) -> Self {
        ReencryptReply {
            share: Some(ReplyShare {
                i: p.ui.i,
                v: enc_point(&p.ui.v),
                ei: enc_scalar(&p.ei),
                fi: enc_scalar(&p.fi),
            }),
        }
    }

    /// `Ok(None)` for a refusal.
    pub fn to_partial(&self) -> Result<Option<PartialReply>, Error> {
        let Some(share) = &self.share else {
            return Ok(None);
        };
        Ok(Some(PartialReply {
            ui: PubShare {
                i: share.i,
                v: dec_point(&share.v)?,
            },
            ei: dec_scalar(&share.ei)?,
            fi: dec_scalar(&share.fi)?,
        }))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReencryptBatch {
    pub items: Vec<Reencrypt>,
}

/// One reply per batch item, in request order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReencryptBatchReply {
    pub replies: Vec<ReencryptReply>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    Init(Init),
    InitReply(InitReply),
    StartDeal(StartDeal),
    Deal(Deal),
    Response(Response),
    Justification(Justification),
    WaitSetup,
    WaitReply,
    Reencrypt(Reencrypt),
    ReencryptReply(ReencryptReply),
    ReencryptBatch(ReencryptBatch),
    ReencryptBatchReply(ReencryptBatchReply),
}

impl Message {
    /// Messages that create a protocol instance on the receiving node.
    pub fn starts_instance(&self) -> bool {
        matches!(
            self,
            Message::Init(_) | Message::Reencrypt(_) | Message::ReencryptBatch(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Init(_) => "Init",
            Message::InitReply(_) => "InitReply",
            Message::StartDeal(_) => "StartDeal",
            Message::Deal(_) => "Deal",
            Message::Response(_) => "Response",
            Message::Justification(_) => "Justification",
            Message::WaitSetup => "WaitSetup",
            Message::WaitReply => "WaitReply",
            Message::Reencrypt(_) => "Reencrypt",
            Message::ReencryptReply(_) => "ReencryptReply",
            Message::ReencryptBatch(_) => "ReencryptBatch",
            Message::ReencryptBatchReply(_) => "ReencryptBatchReply",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(n: usize) -> Roster {
        Roster::new(
            (0..n)
                .map(|i| ServerIdentity::new(format!("node-{i}"), &KeyPair::random().public))
                .collect(),
        )
    }

    #[test]
    fn test_roster_rotation_keeps_order() {
        let r = roster(5);
        let rotated = r.rotated_to("node-3").unwrap();
        let names: Vec<_> = rotated.list.iter().map(|s| s.address.as_str()).collect();
        assert_eq!(names, ["node-3", "node-4", "node-0", "node-1", "node-2"]);
        assert!(r.rotated_to("unknown").is_none());
        assert_eq!(r.threshold(), 4);
    }

    #[test]
    fn test_reply_refusal_sentinel() {
        assert!(ReencryptReply::refused().to_partial().unwrap().is_none());
    }

    #[test]
    fn test_reply_rejects_garbage_point() {
        let reply = ReencryptReply {
            share: Some(ReplyShare {
                i: 0,
                v: [0xff; 32],
                ei: [0; 32],
                fi: [0; 32],
            }),
        };
        assert!(matches!(reply.to_partial(), Err(Error::InvalidPoint)));
    }

    #[test]
    fn test_shared_secret_debug_redacts_share() {
        let shared = SharedSecret {
            index: 2,
            v: Scalar::from(1234567u64),
            x: G,
            commits: vec![G],
        };
        let out = format!("{shared:?}");
        assert!(out.contains("index: 2"));
        assert!(!out.contains("v:"));
    }

    #[test]
    fn test_lts_id_from_seed_is_stable() {
        assert_eq!(LtsId::from_seed(b"instance"), LtsId::from_seed(b"instance"));
        assert_ne!(LtsId::from_seed(b"a"), LtsId::from_seed(b"b"));
        assert_eq!(LtsId([0xab; 32]).to_string().len(), 64);
    }
}
