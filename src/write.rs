use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::document::{self, SealedDocument};
use crate::encoding::encode_key_with;
use crate::error::Error;
use crate::group::{enc_point, G};
use crate::hash::write_challenge;
use crate::randutil::random_scalar;
use crate::types::LtsId;

/// Encrypted key envelope stored by the writer, with a NIZK binding it to a policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Write {
    pub lts_id: LtsId,
    pub u: RistrettoPoint,
    pub ubar: RistrettoPoint,
    pub e: Scalar,
    pub f: Scalar,
    pub cs: Vec<RistrettoPoint>,
    /// Document sealed under the embedded key, if the writer attached one.
    pub data: Option<SealedDocument>,
}

/// A reader's request for a given write, naming the key to re-encrypt to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Read {
    pub write: [u8; 32],
    pub xc: RistrettoPoint,
}

/// Second generator gBar = SetBytes(lts_id)*G.
fn g_bar(lts_id: &LtsId) -> RistrettoPoint {
    G * Scalar::from_bytes_mod_order(*lts_id.as_bytes())
}

impl Write {
    /// Encode `key` under `x` and prove knowledge of the encryption randomness,
    /// bound to `policy_id`.
    pub fn new(lts_id: LtsId, policy_id: &[u8], x: &RistrettoPoint, key: &[u8]) -> Result<Self, Error> {
        let r = random_scalar();
        let (u, cs) = encode_key_with(&r, x, key)?;

        let gbar = g_bar(&lts_id);
        let ubar = gbar * r;
        let s = random_scalar();
        let w = G * s;
        let wbar = gbar * s;
        let e = write_challenge(&cs, &u, &ubar, &w, &wbar, policy_id);
        let f = s + e * r;

        Ok(Write {
            lts_id,
            u,
            ubar,
            e,
            f,
            cs,
            data: None,
        })
    }

    /// Like [`Write::new`], additionally sealing `document` under `key`.
    pub fn with_document(
        lts_id: LtsId,
        policy_id: &[u8],
        x: &RistrettoPoint,
        key: &[u8],
        document: &[u8],
    ) -> Result<Self, Error> {
        let mut wr = Write::new(lts_id, policy_id, x, key)?;
        wr.data = Some(document::seal(key, document, lts_id.as_bytes())?);
        Ok(wr)
    }

    /// Verifies that the write was created by somebody knowing the randomness
    /// behind U, for this policy.
    pub fn check_proof(&self, policy_id: &[u8]) -> Result<(), Error> {
        let w = G * self.f - self.u * self.e;
        let gbar = g_bar(&self.lts_id);
        let wbar = gbar * self.f - self.ubar * self.e;

        let e = write_challenge(&self.cs, &self.u, &self.ubar, &w, &wbar, policy_id);
        if e == self.e {
            Ok(())
        } else {
            Err(Error::InvalidWriteProof)
        }
    }

    pub fn id(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(self.lts_id.as_bytes());
        h.update(enc_point(&self.u));
        h.update(enc_point(&self.ubar));
        for c in &self.cs {
            h.update(enc_point(c));
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&h.finalize());
        id
    }

    /// Open the attached document with the recovered key.
    pub fn open_document(&self, key: &[u8]) -> Result<Vec<u8>, Error> {
        let sealed = self.data.as_ref().ok_or(Error::NotInitialized("document"))?;
        document::open(key, sealed, self.lts_id.as_bytes())
    }
}

impl Read {
    pub fn new(write: &Write, xc: RistrettoPoint) -> Self {
        Read {
            write: write.id(),
            xc,
        }
    }
}
