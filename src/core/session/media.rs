//! Screen-capture seam and the derived media state.

use crate::core::error::{Result, SessionError};
use std::fmt;

/// Who is currently showing a screen, derived from the streams the session holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    Idle,
    /// We are capturing and sending our screen.
    Sharing,
    /// We are displaying the remote peer's screen.
    Receiving,
}

impl MediaState {
    pub(crate) fn derive(has_local: bool, has_remote: bool) -> Self {
        if has_local {
            MediaState::Sharing
        } else if has_remote {
            MediaState::Receiving
        } else {
            MediaState::Idle
        }
    }
}

/// A live audio/video stream, local or remote.
pub trait MediaStream: Send + fmt::Debug {
    fn id(&self) -> &str;

    /// Stop every track. Calling it on a stopped stream is a no-op.
    fn stop(&mut self);
}

/// Source of local screen-capture streams.
pub trait ScreenCapture: Send + Sync {
    /// Ask the platform for a capture of the whole screen.
    ///
    /// Returns [`SessionError::MediaCaptureDenied`] when the user declines
    /// and [`SessionError::MediaUnsupported`] when capture is unavailable.
    fn capture(&self) -> Result<Box<dyn MediaStream>>;
}

/// Capture backend for headless builds: every request is unsupported.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

impl ScreenCapture for NoCapture {
    fn capture(&self) -> Result<Box<dyn MediaStream>> {
        Err(SessionError::MediaUnsupported)
    }
}
