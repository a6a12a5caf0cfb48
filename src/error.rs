use std::time::Duration;

use thiserror::Error;

use crate::dkg::DkgError;
use crate::types::LtsId;

/// Errors surfaced by the LTS service and its protocols.
#[derive(Error, Debug)]
pub enum Error {
    #[error("please initialize {0} first")]
    NotInitialized(&'static str),

    #[error("refused to reencrypt")]
    Refused,

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("couldn't get enough shares")]
    NotEnoughShares,

    #[error("not enough good public shares: got {got}, need {need}")]
    InsufficientShares { got: usize, need: usize },

    #[error("protocol timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid point encoding")]
    InvalidPoint,

    #[error("invalid scalar encoding")]
    InvalidScalar,

    #[error("{len} bytes don't fit into a point (capacity {cap})")]
    EmbedCapacity { len: usize, cap: usize },

    #[error("couldn't find a point embedding the data")]
    EmbedFailed,

    #[error("point doesn't hold embedded data")]
    InvalidEmbedding,

    #[error("key of {0} bytes is too long to encode")]
    KeyTooLong(usize),

    #[error("recreated proof is not equal to stored proof")]
    InvalidWriteProof,

    #[error("dkg: {0}")]
    Dkg(#[from] DkgError),

    #[error("don't know the LTS id {0}")]
    UnknownLts(LtsId),

    #[error("{0} is not part of the roster")]
    NotInRoster(String),

    #[error("batch items belong to different rosters")]
    RosterMismatch,

    #[error("resharing changed the collective public key")]
    KeyChanged,

    #[error("resharing left the share unchanged")]
    ShareUnchanged,

    #[error("node {0} is unreachable")]
    Unreachable(String),

    #[error("too many nodes failed in broadcast: {failed} of {total}")]
    BroadcastFailed { failed: usize, total: usize },

    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    #[error("symmetric cipher failure")]
    Cipher,

    #[error("protocol instance aborted")]
    Aborted,

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
