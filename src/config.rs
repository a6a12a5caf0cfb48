use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Environment variable pointing to a JSON config file.
pub const CONFIG_ENV: &str = "CALYPSO_CONFIG";

/// Node settings. Missing fields take their default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Coordinator timer of a re-encryption.
    pub reencrypt_timeout_ms: u64,
    /// How long a follower waits for its request.
    pub follower_timeout_ms: u64,
    pub batch_timeout_ms: u64,
    /// Propagation timeout of the DKG.
    pub dkg_timeout_ms: u64,
    /// File-backed share store when set, in-memory otherwise.
    pub storage_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            reencrypt_timeout_ms: 60_000,
            follower_timeout_ms: 60_000,
            batch_timeout_ms: 60_000,
            dkg_timeout_ms: 20_000,
            storage_path: None,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Config named by `CALYPSO_CONFIG`, or the defaults when unset.
    pub fn from_env() -> Result<Self, Error> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn reencrypt_timeout(&self) -> Duration {
        Duration::from_millis(self.reencrypt_timeout_ms)
    }

    pub fn follower_timeout(&self) -> Duration {
        Duration::from_millis(self.follower_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn dkg_timeout(&self) -> Duration {
        Duration::from_millis(self.dkg_timeout_ms)
    }
}
