//! Centralized configuration for deskdrop.
//!
//! Wire-level constants are fixed here; the timeouts and size limits that an
//! operator may reasonably want to tune live in [`SessionConfig`], which is
//! loaded from the `[session]` table of the TOML config file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Fixed chunk size in bytes (16 KB).
///
/// Both peers derive `total_chunks` from this value, so it is part of the
/// wire contract and is not configurable.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// MIME type used when the file name gives no hint.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Default upper bound for an inbound file (1 GiB).
///
/// Incoming files are reassembled in memory, so larger offers are refused
/// before any slot is allocated.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

// ── Identity ─────────────────────────────────────────────────────────────────

/// Smallest generated peer id (ids never start with a zero).
pub const PEER_ID_MIN: u32 = 100_000;

/// Largest generated peer id.
pub const PEER_ID_MAX: u32 = 999_999;

/// Name of the file holding the persisted peer id inside the data directory.
pub const PEER_ID_FILE: &str = "peer_id";

// ── Timeouts ─────────────────────────────────────────────────────────────────

/// How long an outgoing connection may stay in `Connecting` or
/// `AwaitingAcceptance` before it is abandoned.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an inbound connection request waits for a local decision.
pub const CONSENT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a file offer (either direction) waits for a decision.
pub const FILE_OFFER_TIMEOUT: Duration = Duration::from_secs(120);

/// Maximum silence between chunks of an accepted inbound transfer.
pub const TRANSFER_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval at which the node evaluates the deadlines above.
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

// ── Runtime configuration ────────────────────────────────────────────────────

/// Tunable session parameters.
///
/// Durations are expressed in whole seconds in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_secs: u64,
    pub consent_timeout_secs: u64,
    pub file_offer_timeout_secs: u64,
    pub transfer_stall_timeout_secs: u64,
    /// Largest inbound file that will be offered to the user.
    pub max_file_size: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: CONNECT_TIMEOUT.as_secs(),
            consent_timeout_secs: CONSENT_TIMEOUT.as_secs(),
            file_offer_timeout_secs: FILE_OFFER_TIMEOUT.as_secs(),
            transfer_stall_timeout_secs: TRANSFER_STALL_TIMEOUT.as_secs(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn consent_timeout(&self) -> Duration {
        Duration::from_secs(self.consent_timeout_secs)
    }

    pub fn file_offer_timeout(&self) -> Duration {
        Duration::from_secs(self.file_offer_timeout_secs)
    }

    pub fn transfer_stall_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_stall_timeout_secs)
    }
}
