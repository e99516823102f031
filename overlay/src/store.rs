//! Versioned snapshots of overlay state
//!
//! Registry, vote and spork state are written as bincode files with a
//! leading version tag on clean shutdown and reloaded at start. A tag
//! mismatch discards the file; the state is rebuilt from the network.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Bumped whenever a persisted layout changes
pub const STORE_VERSION: &str = "meridian-overlay-1";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: String,
    payload: T,
}

pub struct Store {
    data_dir: PathBuf,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let data_dir = path.as_ref().to_path_buf();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir)?;
        }
        Ok(Self { data_dir })
    }

    pub fn save<T: Serialize>(&self, name: &str, payload: &T) -> Result<(), StoreError> {
        let envelope = Envelope {
            version: STORE_VERSION.to_string(),
            payload,
        };
        let bytes = bincode::serialize(&envelope)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let path = self.path_for(name);
        fs::write(&path, bytes)?;
        info!(file = %path.display(), "saved overlay state");
        Ok(())
    }

    /// Load a snapshot; `None` when the file is missing, unreadable or
    /// carries the wrong version tag.
    pub fn load<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let envelope: Envelope<T> = match bincode::deserialize(&bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(file = %path.display(), error = %err, "discarding unreadable state file");
                return Ok(None);
            }
        };
        if envelope.version != STORE_VERSION {
            warn!(
                file = %path.display(),
                found = %envelope.version,
                expected = STORE_VERSION,
                "discarding state file with wrong version"
            );
            return Ok(None);
        }
        Ok(Some(envelope.payload))
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.dat"))
    }
}
