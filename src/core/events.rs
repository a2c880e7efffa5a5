//! Events the session reports to whatever drives the UI.
//!
//! The core never blocks on the consumer: events go out on an unbounded
//! queue and are dropped if nobody is listening.

use crate::core::identity::PeerId;
use crate::core::session::Role;
use crate::core::transfer::TransferDirection;
use bytes::Bytes;
use tokio::sync::mpsc;

/// A file that finished transferring in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    /// Reassembled content for inbound transfers; `None` for outbound ones.
    pub bytes: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    // ── Identity ─────────────────────────────────────────────────────────────
    /// Our id is registered and other peers can dial it.
    Ready { local_id: PeerId },

    // ── Connection ───────────────────────────────────────────────────────────
    /// A remote peer asks to connect; answer with accept or reject.
    IncomingConnection { remote_id: PeerId },
    /// The pending request timed out or the requester gave up.
    ConsentExpired { remote_id: PeerId },
    Connecting { remote_id: PeerId },
    Connected { remote_id: PeerId, role: Role },
    Disconnected { reason: Option<String> },

    // ── File transfer ────────────────────────────────────────────────────────
    IncomingFileOffer {
        name: String,
        size: u64,
        mime_type: String,
    },
    /// An offer that was declined without asking the user.
    IncomingFileRefused {
        name: String,
        size: u64,
        reason: String,
    },
    FileProgress {
        direction: TransferDirection,
        percent: u8,
    },
    FileComplete {
        direction: TransferDirection,
        file: CompletedFile,
    },
    /// The remote peer declined our offer.
    FileRejected { name: String },
    TransferFailed {
        direction: TransferDirection,
        name: String,
        reason: String,
    },

    // ── Screen share ─────────────────────────────────────────────────────────
    SharingStarted,
    SharingStopped,
    RemoteStreamStarted { stream_id: String },
    RemoteShareStopped,
    MediaError(String),

    Error(String),
}

/// Sending half of the session event queue.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn notify(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
