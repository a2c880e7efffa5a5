//! Transport seam between the session and the signaling/rendezvous layer.
//!
//! A [`Transport`] registers our [`PeerId`], opens data channels to remote
//! ids and places media calls. Everything the transport observes comes back
//! as a [`TransportEvent`] on a single queue so that one task can own the
//! session state without locks.

pub mod memory;

use crate::core::error::Result;
use crate::core::identity::PeerId;
use crate::core::protocol::{WireMessage, frame};
use crate::core::session::media::MediaStream;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

pub type ChannelId = u64;

/// A reliable, ordered, bidirectional message channel to one remote peer.
pub trait Channel: Send + Sync + fmt::Debug {
    fn id(&self) -> ChannelId;

    /// The peer at the other end.
    fn remote(&self) -> &PeerId;

    /// Queue one encoded frame for delivery.
    fn send(&self, frame: Bytes) -> Result<()>;

    /// Close the channel. Calling it more than once is a no-op.
    fn close(&self);
}

impl dyn Channel + '_ {
    /// Encode and send an application message.
    pub fn send_message(&self, msg: &WireMessage) -> Result<()> {
        self.send(frame::encode(msg)?)
    }
}

/// Signaling layer: identity registration, data channels and media calls.
pub trait Transport: Send + Sync {
    /// Claim `id` on the rendezvous service. The outcome arrives as
    /// [`TransportEvent::Registered`] or [`TransportEvent::IdentityUnavailable`].
    fn register(&self, id: &PeerId) -> Result<()>;

    /// Open a data channel to `remote`. The returned channel is not usable
    /// until [`TransportEvent::ChannelOpen`] arrives for its id.
    fn connect(&self, remote: &PeerId) -> Result<Arc<dyn Channel>>;

    /// Offer a media stream to `remote`.
    fn call(&self, remote: &PeerId, stream: &dyn MediaStream) -> Result<()>;
}

#[derive(Debug)]
pub enum TransportEvent {
    Registered(PeerId),
    /// The requested id is already taken by another peer.
    IdentityUnavailable(PeerId),
    /// A remote peer opened a channel to us.
    IncomingChannel(Arc<dyn Channel>),
    ChannelOpen(ChannelId),
    ChannelData { channel: ChannelId, frame: Bytes },
    ChannelClosed(ChannelId),
    ChannelError { channel: ChannelId, error: String },
    /// A remote peer started a media call.
    IncomingCall {
        from: PeerId,
        stream: Box<dyn MediaStream>,
    },
}
