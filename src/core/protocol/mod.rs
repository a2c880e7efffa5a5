//! Application messages exchanged over the peer channel.
//!
//! Every message is a `{type, ...fields}` envelope. Control messages travel
//! as JSON; `file-chunk` uses the compact binary layout in [`frame`] so bulk
//! data carries no JSON overhead.

pub mod frame;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The complete set of messages a peer understands.
///
/// Decoding anything else yields a protocol violation, never a silent skip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    // ── Session ──────────────────────────────────────────────────────────────
    /// Host granted consent; promotes the controller to `Connected`.
    #[serde(rename = "connection-accepted")]
    ConnectionAccepted,
    /// Controller asks the host to begin sharing.
    #[serde(rename = "requestScreen")]
    RequestScreen,
    /// The sender's local screen share ended.
    #[serde(rename = "screen-share-stopped")]
    ScreenShareStopped,

    // ── File transfer ────────────────────────────────────────────────────────
    /// Offer a file to the peer.
    #[serde(rename = "file-request")]
    FileRequest {
        name: String,
        size: u64,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Receiver accepted the pending offer; the sender starts streaming.
    #[serde(rename = "file-accepted")]
    FileAccepted,
    /// Receiver declined the pending offer.
    #[serde(rename = "file-rejected")]
    FileRejected,
    /// One chunk of the accepted file.
    #[serde(rename = "file-chunk")]
    FileChunk { index: u32, total: u32, payload: Bytes },

    // ── Remote input ─────────────────────────────────────────────────────────
    /// Pointer position, normalized to `0..=1` on both axes.
    #[serde(rename = "mouseMove")]
    MouseMove { x: f64, y: f64 },
    /// Click at a normalized position.
    #[serde(rename = "mouseClick")]
    MouseClick { x: f64, y: f64 },
    #[serde(rename = "keyPress")]
    KeyPress { key: String },
}

impl WireMessage {
    /// The envelope `type` string, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::ConnectionAccepted => "connection-accepted",
            WireMessage::RequestScreen => "requestScreen",
            WireMessage::ScreenShareStopped => "screen-share-stopped",
            WireMessage::FileRequest { .. } => "file-request",
            WireMessage::FileAccepted => "file-accepted",
            WireMessage::FileRejected => "file-rejected",
            WireMessage::FileChunk { .. } => "file-chunk",
            WireMessage::MouseMove { .. } => "mouseMove",
            WireMessage::MouseClick { .. } => "mouseClick",
            WireMessage::KeyPress { .. } => "keyPress",
        }
    }
}
