//! Per-node storage of LTS shares.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use curve25519_dalek::ristretto::RistrettoPoint;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dkg::DistKeyShare;
use crate::error::Error;
use crate::shamir::PubPoly;
use crate::types::{LtsId, Roster, SharedSecret};

/// Everything a node keeps about one LTS.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LtsRecord {
    pub shared: SharedSecret,
    pub poly: PubPoly,
    pub roster: Roster,
    pub dks: DistKeyShare,
    /// Collective public key, as returned to the creator.
    pub x: RistrettoPoint,
}

pub trait SecretStore: Send + Sync {
    fn get(&self, id: &LtsId) -> Result<LtsRecord, Error>;
    fn put(&self, id: LtsId, record: LtsRecord) -> Result<(), Error>;
    /// Drop the record of an LTS this node no longer holds a share of.
    fn remove(&self, id: &LtsId) -> Result<(), Error>;
    fn ids(&self) -> Vec<LtsId>;
}

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<LtsId, LtsRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryStore {
    fn get(&self, id: &LtsId) -> Result<LtsRecord, Error> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or(Error::UnknownLts(*id))
    }

    fn put(&self, id: LtsId, record: LtsRecord) -> Result<(), Error> {
        self.records.write().insert(id, record);
        Ok(())
    }

    fn remove(&self, id: &LtsId) -> Result<(), Error> {
        self.records.write().remove(id);
        Ok(())
    }

    fn ids(&self) -> Vec<LtsId> {
        let mut ids: Vec<LtsId> = self.records.read().keys().copied().collect();
        ids.sort();
        ids
    }
}

#[derive(Serialize, Deserialize, Default)]
struct StoreFile {
    records: Vec<(LtsId, LtsRecord)>,
}

/// [`MemoryStore`] persisted to a JSON file on every `put`.
pub struct FileStore {
    path: PathBuf,
    records: RwLock<HashMap<LtsId, LtsRecord>>,
}

impl FileStore {
    /// Open the store at `path`, loading existing records if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let bytes = fs::read(&path)?;
            let file: StoreFile = serde_json::from_slice(&bytes)?;
            info!(path = %path.display(), records = file.records.len(), "loaded share store");
            file.records.into_iter().collect()
        } else {
            HashMap::new()
        };
        Ok(FileStore {
            path,
            records: RwLock::new(records),
        })
    }

    fn save(&self, records: &HashMap<LtsId, LtsRecord>) -> Result<(), Error> {
        let mut file = StoreFile {
            records: records.iter().map(|(id, r)| (*id, r.clone())).collect(),
        };
        file.records.sort_by_key(|(id, _)| *id);
        let bytes = serde_json::to_vec_pretty(&file)?;

        // the store file is only ever replaced whole
        let tmp = self.path.with_extension("tmp");
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "saved share store");
        Ok(())
    }

    /// Apply `f` to a copy of the records; the copy only replaces the visible
    /// records once it is on disk.
    fn update(&self, f: impl FnOnce(&mut HashMap<LtsId, LtsRecord>)) -> Result<(), Error> {
        let mut records = self.records.write();
        let mut next = records.clone();
        f(&mut next);
        self.save(&next)?;
        *records = next;
        Ok(())
    }
}

impl SecretStore for FileStore {
    fn get(&self, id: &LtsId) -> Result<LtsRecord, Error> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or(Error::UnknownLts(*id))
    }

    fn put(&self, id: LtsId, record: LtsRecord) -> Result<(), Error> {
        self.update(|records| {
            records.insert(id, record);
        })
    }

    fn remove(&self, id: &LtsId) -> Result<(), Error> {
        self.update(|records| {
            records.remove(id);
        })
    }

    fn ids(&self) -> Vec<LtsId> {
        let mut ids: Vec<LtsId> = self.records.read().keys().copied().collect();
        ids.sort();
        ids
    }
}
