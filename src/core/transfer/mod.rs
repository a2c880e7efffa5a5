//! TransferEngine: the file-transfer half of a session.
//!
//! At most one outbound and one inbound transfer exist at a time. An offer
//! (`file-request`) must be answered with `file-accepted` or
//! `file-rejected` before any chunk flows. Reaching a terminal state emits
//! the matching event, frees the transfer and leaves only its outcome
//! behind, so a new offer in that direction is allowed immediately.
//!
//! The engine performs no I/O of its own beyond the [`Channel`] it is handed
//! and never sleeps. Deadlines are evaluated by [`TransferEngine::expire`]
//! and outbound chunks are produced one per [`TransferEngine::pump`] call so
//! the owning loop stays responsive between chunks.

pub mod chunk;
pub mod file;

use crate::core::config::SessionConfig;
use crate::core::connection::Channel;
use crate::core::error::{Result, SessionError};
use crate::core::events::{CompletedFile, EventSink, SessionEvent};
use crate::core::protocol::WireMessage;
use bytes::Bytes;
use chunk::{ChunkSlots, total_chunks};
use file::OutgoingFile;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Outbound,
    Inbound,
}

impl TransferDirection {
    fn as_str(self) -> &'static str {
        match self {
            TransferDirection::Outbound => "outbound",
            TransferDirection::Inbound => "inbound",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Offer sent or received, no decision yet.
    Requested,
    /// Receiver accepted; no chunk has arrived yet.
    Accepted,
    Rejected,
    InProgress,
    Complete,
    Failed,
}

/// What a `file-request` announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

impl FileMeta {
    pub fn total_chunks(&self) -> u32 {
        total_chunks(self.size)
    }
}

#[derive(Debug)]
struct OutboundTransfer {
    id: Uuid,
    meta: FileMeta,
    state: TransferState,
    file: OutgoingFile,
    next_index: u32,
    bytes_sent: u64,
    /// Decision deadline while `Requested`.
    deadline: Option<Instant>,
}

#[derive(Debug)]
struct InboundTransfer {
    id: Uuid,
    meta: FileMeta,
    state: TransferState,
    /// Allocated on accept.
    slots: Option<ChunkSlots>,
    /// Decision deadline while `Requested`, stall deadline afterwards.
    deadline: Instant,
}

#[derive(Debug)]
pub struct TransferEngine {
    config: SessionConfig,
    events: EventSink,
    outbound: Option<OutboundTransfer>,
    inbound: Option<InboundTransfer>,
    /// Terminal state of the last finished transfer per direction.
    outbound_outcome: Option<TransferState>,
    inbound_outcome: Option<TransferState>,
}

impl TransferEngine {
    pub fn new(config: SessionConfig, events: EventSink) -> Self {
        Self {
            config,
            events,
            outbound: None,
            inbound: None,
            outbound_outcome: None,
            inbound_outcome: None,
        }
    }

    /// State of the active outbound transfer, else the outcome of the last one.
    pub fn outbound_state(&self) -> Option<TransferState> {
        self.outbound
            .as_ref()
            .map(|t| t.state)
            .or(self.outbound_outcome)
    }

    /// State of the active inbound transfer, else the outcome of the last one.
    pub fn inbound_state(&self) -> Option<TransferState> {
        self.inbound.as_ref().map(|t| t.state).or(self.inbound_outcome)
    }

    fn has_active_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    /// The inbound offer awaiting a local decision, if any.
    pub fn pending_offer(&self) -> Option<&FileMeta> {
        self.inbound
            .as_ref()
            .filter(|t| t.state == TransferState::Requested)
            .map(|t| &t.meta)
    }

    /// Whether [`pump`](Self::pump) has a chunk to send.
    pub fn has_pending_chunks(&self) -> bool {
        matches!(
            self.outbound.as_ref().map(|t| t.state),
            Some(TransferState::InProgress)
        )
    }

    // ── Local actions ────────────────────────────────────────────────────────

    /// Offer `file` to the peer.
    pub fn offer_file(
        &mut self,
        channel: &dyn Channel,
        file: OutgoingFile,
        now: Instant,
    ) -> Result<()> {
        if self.has_active_outbound() {
            return Err(SessionError::TransferAlreadyActive);
        }

        let meta = FileMeta {
            name: file.name().to_string(),
            size: file.size(),
            mime_type: file.mime_type().to_string(),
        };
        channel.send_message(&WireMessage::FileRequest {
            name: meta.name.clone(),
            size: meta.size,
            mime_type: meta.mime_type.clone(),
        })?;

        let id = Uuid::new_v4();
        info!(
            event = "transfer_offered",
            transfer_id = %id,
            direction = "outbound",
            name = %meta.name,
            size = meta.size,
            total_chunks = meta.total_chunks(),
            "File offered to peer"
        );
        self.outbound = Some(OutboundTransfer {
            id,
            meta,
            state: TransferState::Requested,
            file,
            next_index: 0,
            bytes_sent: 0,
            deadline: Some(now + self.config.file_offer_timeout()),
        });
        Ok(())
    }

    /// Accept the pending inbound offer and allocate its slots.
    pub fn accept_incoming(&mut self, channel: &dyn Channel, now: Instant) -> Result<()> {
        let Some(transfer) = self
            .inbound
            .as_mut()
            .filter(|t| t.state == TransferState::Requested)
        else {
            return Err(SessionError::NoIncomingOffer);
        };

        if let Err(e) = channel.send_message(&WireMessage::FileAccepted) {
            self.inbound = None;
            return Err(e);
        }

        transfer.slots = Some(ChunkSlots::new(transfer.meta.size));
        transfer.state = TransferState::Accepted;
        transfer.deadline = now + self.config.transfer_stall_timeout();
        info!(
            event = "transfer_accepted",
            transfer_id = %transfer.id,
            name = %transfer.meta.name,
            "Incoming file accepted"
        );
        Ok(())
    }

    /// Decline the pending inbound offer.
    pub fn reject_incoming(&mut self, channel: &dyn Channel) -> Result<()> {
        if self.pending_offer().is_none() {
            return Err(SessionError::NoIncomingOffer);
        }
        if let Some(transfer) = self.inbound.take() {
            info!(
                event = "transfer_rejected",
                transfer_id = %transfer.id,
                name = %transfer.meta.name,
                "Incoming file rejected by user"
            );
            self.inbound_outcome = Some(TransferState::Rejected);
        }
        channel.send_message(&WireMessage::FileRejected)
    }

    // ── Remote messages ──────────────────────────────────────────────────────

    /// Apply one `file-*` message from the peer.
    pub fn handle_message(
        &mut self,
        channel: &dyn Channel,
        msg: WireMessage,
        now: Instant,
    ) -> Result<()> {
        match msg {
            WireMessage::FileRequest {
                name,
                size,
                mime_type,
            } => self.on_file_request(
                channel,
                FileMeta {
                    name,
                    size,
                    mime_type,
                },
                now,
            ),
            WireMessage::FileAccepted => self.on_file_accepted(),
            WireMessage::FileRejected => self.on_file_rejected(),
            WireMessage::FileChunk {
                index,
                total,
                payload,
            } => self.on_file_chunk(index, total, payload, now),
            other => Err(SessionError::ProtocolViolation(format!(
                "{} is not a file-transfer message",
                other.kind()
            ))),
        }
    }

    fn on_file_request(
        &mut self,
        channel: &dyn Channel,
        meta: FileMeta,
        now: Instant,
    ) -> Result<()> {
        if let Some(active) = &self.inbound {
            warn!(
                event = "file_request_while_busy",
                transfer_id = %active.id,
                name = %meta.name,
                "Refusing second inbound offer"
            );
            channel.send_message(&WireMessage::FileRejected)?;
            return Err(SessionError::ProtocolViolation(
                "file-request while an inbound transfer is active".into(),
            ));
        }

        if meta.size > self.config.max_file_size {
            warn!(
                event = "file_request_too_large",
                name = %meta.name,
                size = meta.size,
                limit = self.config.max_file_size,
                "Refusing oversized inbound offer"
            );
            channel.send_message(&WireMessage::FileRejected)?;
            self.inbound_outcome = Some(TransferState::Rejected);
            self.events.notify(SessionEvent::IncomingFileRefused {
                name: meta.name,
                size: meta.size,
                reason: format!("exceeds limit of {} bytes", self.config.max_file_size),
            });
            return Ok(());
        }

        let id = Uuid::new_v4();
        info!(
            event = "transfer_offered",
            transfer_id = %id,
            direction = "inbound",
            name = %meta.name,
            size = meta.size,
            mime_type = %meta.mime_type,
            "Peer offered a file"
        );
        self.events.notify(SessionEvent::IncomingFileOffer {
            name: meta.name.clone(),
            size: meta.size,
            mime_type: meta.mime_type.clone(),
        });
        self.inbound = Some(InboundTransfer {
            id,
            meta,
            state: TransferState::Requested,
            slots: None,
            deadline: now + self.config.file_offer_timeout(),
        });
        Ok(())
    }

    fn on_file_accepted(&mut self) -> Result<()> {
        let Some(transfer) = self
            .outbound
            .as_mut()
            .filter(|t| t.state == TransferState::Requested)
        else {
            return Err(SessionError::ProtocolViolation(
                "file-accepted without a pending offer".into(),
            ));
        };
        transfer.state = TransferState::InProgress;
        transfer.deadline = None;
        info!(
            event = "transfer_started",
            transfer_id = %transfer.id,
            direction = "outbound",
            name = %transfer.meta.name,
            "Peer accepted, streaming chunks"
        );
        Ok(())
    }

    fn on_file_rejected(&mut self) -> Result<()> {
        if self.outbound_state() != Some(TransferState::Requested) {
            return Err(SessionError::ProtocolViolation(
                "file-rejected without a pending offer".into(),
            ));
        }
        if let Some(transfer) = self.outbound.take() {
            info!(
                event = "transfer_rejected",
                transfer_id = %transfer.id,
                name = %transfer.meta.name,
                "Peer rejected the offer"
            );
            self.outbound_outcome = Some(TransferState::Rejected);
            self.events.notify(SessionEvent::FileRejected {
                name: transfer.meta.name,
            });
        }
        Ok(())
    }

    fn on_file_chunk(
        &mut self,
        index: u32,
        total: u32,
        payload: Bytes,
        now: Instant,
    ) -> Result<()> {
        let Some(transfer) = self.inbound.as_mut().filter(|t| {
            matches!(t.state, TransferState::Accepted | TransferState::InProgress)
        }) else {
            return Err(SessionError::ProtocolViolation(format!(
                "file-chunk {index} without an accepted transfer"
            )));
        };
        let Some(slots) = transfer.slots.as_mut() else {
            return Err(SessionError::ProtocolViolation(
                "accepted transfer has no slots".into(),
            ));
        };

        if total != slots.total() {
            return Err(SessionError::ProtocolViolation(format!(
                "chunk total {total} does not match expected {}",
                slots.total()
            )));
        }
        slots.store(index, payload)?;

        transfer.state = TransferState::InProgress;
        transfer.deadline = now + self.config.transfer_stall_timeout();
        let filled = slots.filled();
        let complete = slots.is_complete();
        self.events.notify(SessionEvent::FileProgress {
            direction: TransferDirection::Inbound,
            percent: percent(u64::from(filled), u64::from(total)),
        });

        if complete {
            self.finish_inbound();
        }
        Ok(())
    }

    fn finish_inbound(&mut self) {
        let Some(transfer) = self.inbound.take() else {
            return;
        };
        let bytes = transfer.slots.and_then(ChunkSlots::assemble);
        self.inbound_outcome = Some(TransferState::Complete);
        info!(
            event = "transfer_complete",
            transfer_id = %transfer.id,
            direction = "inbound",
            name = %transfer.meta.name,
            size = transfer.meta.size,
            "Inbound transfer complete"
        );
        self.events.notify(SessionEvent::FileComplete {
            direction: TransferDirection::Inbound,
            file: CompletedFile {
                file_name: transfer.meta.name,
                mime_type: transfer.meta.mime_type,
                size: transfer.meta.size,
                bytes,
            },
        });
    }

    // ── Driving ──────────────────────────────────────────────────────────────

    /// Send the next outbound chunk. Returns whether more chunks remain.
    ///
    /// A read or send failure fails the transfer and is returned.
    pub fn pump(&mut self, channel: &dyn Channel) -> Result<bool> {
        let Some(transfer) = self
            .outbound
            .as_mut()
            .filter(|t| t.state == TransferState::InProgress)
        else {
            return Ok(false);
        };

        let index = transfer.next_index;
        let total = transfer.meta.total_chunks();
        let sent = transfer.file.read_chunk(index).and_then(|payload| {
            let len = payload.len() as u64;
            channel
                .send_message(&WireMessage::FileChunk {
                    index,
                    total,
                    payload,
                })
                .map(|()| len)
        });
        let len = match sent {
            Ok(len) => len,
            Err(e) => {
                self.fail(TransferDirection::Outbound, &e.to_string());
                return Err(e);
            }
        };

        transfer.next_index += 1;
        transfer.bytes_sent += len;
        debug!(event = "chunk_sent", transfer_id = %transfer.id, index, total);
        self.events.notify(SessionEvent::FileProgress {
            direction: TransferDirection::Outbound,
            percent: percent(transfer.bytes_sent, transfer.meta.size),
        });

        if transfer.next_index < total {
            return Ok(true);
        }

        if let Some(transfer) = self.outbound.take() {
            info!(
                event = "transfer_complete",
                transfer_id = %transfer.id,
                direction = "outbound",
                name = %transfer.meta.name,
                size = transfer.meta.size,
                "Outbound transfer complete"
            );
            self.outbound_outcome = Some(TransferState::Complete);
            self.events.notify(SessionEvent::FileComplete {
                direction: TransferDirection::Outbound,
                file: CompletedFile {
                    file_name: transfer.meta.name,
                    mime_type: transfer.meta.mime_type,
                    size: transfer.meta.size,
                    bytes: None,
                },
            });
        }
        Ok(false)
    }

    /// Abandon transfers whose deadline has passed.
    ///
    /// An expired inbound offer is answered with `file-rejected` when a
    /// channel is available.
    pub fn expire(&mut self, channel: Option<&dyn Channel>, now: Instant) {
        let outbound_expired = self
            .outbound
            .as_ref()
            .and_then(|t| t.deadline)
            .is_some_and(|deadline| now >= deadline);
        if outbound_expired {
            self.fail(TransferDirection::Outbound, "offer was not answered in time");
        }

        let Some(transfer) = &self.inbound else {
            return;
        };
        if now < transfer.deadline {
            return;
        }

        if transfer.state == TransferState::Requested {
            if let Some(channel) = channel {
                if let Err(e) = channel.send_message(&WireMessage::FileRejected) {
                    warn!(event = "file_reject_send_failure", error = %e);
                }
            }
            if let Some(transfer) = self.inbound.take() {
                info!(
                    event = "transfer_offer_expired",
                    transfer_id = %transfer.id,
                    name = %transfer.meta.name,
                    "Inbound offer expired without a decision"
                );
                self.inbound_outcome = Some(TransferState::Rejected);
                self.events.notify(SessionEvent::IncomingFileRefused {
                    name: transfer.meta.name,
                    size: transfer.meta.size,
                    reason: "no decision in time".into(),
                });
            }
        } else {
            let missing = transfer
                .slots
                .as_ref()
                .map_or(0, |slots| slots.missing().len());
            self.fail(
                TransferDirection::Inbound,
                &format!("stalled with {missing} chunks missing"),
            );
        }
    }

    /// Drop every transfer, failing those still active. Called when the
    /// channel goes away.
    pub fn reset(&mut self) {
        if self.outbound.is_some() {
            self.fail(TransferDirection::Outbound, "channel closed");
        }
        if self.inbound.is_some() {
            self.fail(TransferDirection::Inbound, "channel closed");
        }
    }

    fn fail(&mut self, direction: TransferDirection, reason: &str) {
        let slot = match direction {
            TransferDirection::Outbound => self.outbound.take().map(|t| (t.id, t.meta)),
            TransferDirection::Inbound => self.inbound.take().map(|t| (t.id, t.meta)),
        };
        let Some((id, meta)) = slot else {
            return;
        };
        match direction {
            TransferDirection::Outbound => self.outbound_outcome = Some(TransferState::Failed),
            TransferDirection::Inbound => self.inbound_outcome = Some(TransferState::Failed),
        }

        warn!(
            event = "transfer_failed",
            transfer_id = %id,
            direction = direction.as_str(),
            name = %meta.name,
            reason,
            "Transfer failed"
        );
        self.events.notify(SessionEvent::TransferFailed {
            direction,
            name: meta.name,
            reason: reason.to_string(),
        });
    }
}

/// Rounded percentage; an empty total counts as done.
fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as f64 / total as f64) * 100.0).round().min(100.0) as u8
}
