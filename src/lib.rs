pub mod error;
pub mod group;
pub mod hash;
pub mod randutil;
pub mod shamir;
pub mod types;
pub mod encoding;
pub mod document;
pub mod write;
pub mod dkg;
pub mod reshare;
pub mod setup;
pub mod nizk;
pub mod completion;
pub mod protocol;
pub mod batch;
pub mod network;
pub mod verify;
pub mod store;
pub mod config;
pub mod logging;
pub mod service;
pub mod local;

pub use error::Error;
pub use local::LocalCluster;
pub use service::{CreateLtsReply, DecryptKey, DecryptKeyReply, Service};
pub use types::{KeyPair, LtsId, Roster, ServerIdentity};
pub use write::{Read, Write};
