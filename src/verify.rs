//! Authorization of re-encryption requests.
//!
//! The protocol never looks at `verification_data` itself; it asks an
//! [`Authorizer`] on the coordinator and again on every follower before a share
//! is produced.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::types::ReencryptRequest;
use crate::write::{Read, Write};

pub trait Authorizer: Send + Sync {
    /// `Ok(false)` and `Err(_)` both refuse the request; the error carries the reason.
    fn authorize(&self, request: &ReencryptRequest) -> Result<bool, Error>;
}

impl<F> Authorizer for F
where
    F: Fn(&ReencryptRequest) -> Result<bool, Error> + Send + Sync,
{
    fn authorize(&self, request: &ReencryptRequest) -> Result<bool, Error> {
        self(request)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _: &ReencryptRequest) -> Result<bool, Error> {
        Ok(true)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn authorize(&self, _: &ReencryptRequest) -> Result<bool, Error> {
        Ok(false)
    }
}

/// Accepts any request carrying a non-empty verification blob.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequireVerificationData;

impl Authorizer for RequireVerificationData {
    fn authorize(&self, request: &ReencryptRequest) -> Result<bool, Error> {
        Ok(!request.verification_data.is_empty())
    }
}

/// Verification blob understood by [`ReadProofAuthorizer`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadProof {
    pub write: Write,
    pub read: Read,
}

impl ReadProof {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Checks that the request re-encrypts the key of a valid write, for the reader
/// named in the matching read.
#[derive(Clone, Debug)]
pub struct ReadProofAuthorizer {
    pub policy_id: Vec<u8>,
}

impl ReadProofAuthorizer {
    pub fn new(policy_id: impl Into<Vec<u8>>) -> Self {
        ReadProofAuthorizer {
            policy_id: policy_id.into(),
        }
    }
}

impl Authorizer for ReadProofAuthorizer {
    fn authorize(&self, request: &ReencryptRequest) -> Result<bool, Error> {
        let proof: ReadProof = serde_json::from_slice(&request.verification_data)
            .map_err(|e| Error::Authorization(format!("malformed read proof: {e}")))?;

        proof.write.check_proof(&self.policy_id)?;
        if proof.read.write != proof.write.id() {
            return Err(Error::Authorization("read doesn't point to the write".into()));
        }
        if proof.read.xc != request.xc {
            return Err(Error::Authorization("wrong reader key".into()));
        }
        if proof.write.u != request.u {
            return Err(Error::Authorization("U doesn't match the write".into()));
        }
        if proof.write.lts_id != request.lts_id {
            return Err(Error::Authorization("write belongs to another LTS".into()));
        }
        debug!(lts = %request.lts_id, "read proof accepted");
        Ok(true)
    }
}

/// Runs `authorizer`, folding errors into a refusal after logging the reason.
pub fn is_authorized(authorizer: &dyn Authorizer, request: &ReencryptRequest) -> bool {
    match authorizer.authorize(request) {
        Ok(ok) => ok,
        Err(e) => {
            debug!(lts = %request.lts_id, error = %e, "request refused");
            false
        }
    }
}
