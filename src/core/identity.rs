//! Peer identity: the 6-digit id other peers dial to reach us.
//!
//! The id is generated once, persisted in the data directory and reused on
//! the next start. A collision reported by the transport, or an explicit
//! refresh by the user, replaces it with a fresh random id.

use crate::core::config::{PEER_ID_FILE, PEER_ID_MAX, PEER_ID_MIN};
use crate::core::error::SessionError;
use crate::utils::atomic_write::atomic_write;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

/// A validated 6-digit peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// A random id in `100000..=999999`.
    pub fn random() -> Self {
        let n = rand::thread_rng().gen_range(PEER_ID_MIN..=PEER_ID_MAX);
        Self(n.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PeerId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(s.to_string()))
        } else {
            Err(SessionError::InvalidRemoteIdFormat(s.to_string()))
        }
    }
}

impl TryFrom<String> for PeerId {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Allocates and recalls the local [`PeerId`].
///
/// Persistence failures are logged and otherwise ignored: an id that cannot
/// be saved is still usable for the current process.
#[derive(Debug, Clone, Default)]
pub struct IdentityProvider {
    path: Option<PathBuf>,
}

impl IdentityProvider {
    /// Provider backed by `<data_dir>/peer_id`.
    pub fn in_data_dir(dir: &Path) -> Self {
        Self {
            path: Some(dir.join(PEER_ID_FILE)),
        }
    }

    /// Provider that never touches the filesystem.
    pub fn ephemeral() -> Self {
        Self { path: None }
    }

    /// Return the persisted id, or generate and persist a new one.
    pub fn load_or_create(&self) -> PeerId {
        if let Some(path) = &self.path {
            match std::fs::read_to_string(path) {
                Ok(content) => match content.trim().parse::<PeerId>() {
                    Ok(id) => {
                        info!(event = "peer_id_loaded", %id, path = %path.display());
                        return id;
                    }
                    Err(e) => warn!(event = "peer_id_invalid", path = %path.display(), %e),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(event = "peer_id_read_failure", path = %path.display(), %e),
            }
        }
        self.regenerate(None)
    }

    /// Generate a new id different from `previous` and persist it.
    pub fn regenerate(&self, previous: Option<&PeerId>) -> PeerId {
        let id = loop {
            let candidate = PeerId::random();
            if Some(&candidate) != previous {
                break candidate;
            }
        };
        self.persist(&id);
        id
    }

    fn persist(&self, id: &PeerId) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = atomic_write(path, id.as_str().as_bytes()) {
            warn!(event = "peer_id_persist_failure", %id, path = %path.display(), %e);
        }
    }
}
