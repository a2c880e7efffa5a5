//! Remote input: normalized pointer and keyboard events.
//!
//! Coordinates travel normalized to `0..=1` on both axes and are scaled to
//! the executing host's screen size only at the last moment.

use crate::core::error::{Result, SessionError};
use crate::core::protocol::WireMessage;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    MouseMove { x: f64, y: f64 },
    MouseClick { x: f64, y: f64 },
    KeyPress { key: String },
}

impl InputEvent {
    /// Reject coordinates outside the unit square (including NaN) and empty keys.
    pub fn validate(&self) -> Result<()> {
        match self {
            InputEvent::MouseMove { x, y } | InputEvent::MouseClick { x, y } => {
                let unit = 0.0..=1.0;
                if unit.contains(x) && unit.contains(y) {
                    Ok(())
                } else {
                    Err(SessionError::ProtocolViolation(format!(
                        "pointer coordinates out of range: ({x}, {y})"
                    )))
                }
            }
            InputEvent::KeyPress { key } if key.is_empty() => Err(
                SessionError::ProtocolViolation("empty key in keyPress".into()),
            ),
            InputEvent::KeyPress { .. } => Ok(()),
        }
    }

    pub fn to_wire(&self) -> WireMessage {
        match self {
            InputEvent::MouseMove { x, y } => WireMessage::MouseMove { x: *x, y: *y },
            InputEvent::MouseClick { x, y } => WireMessage::MouseClick { x: *x, y: *y },
            InputEvent::KeyPress { key } => WireMessage::KeyPress { key: key.clone() },
        }
    }

    /// The input event carried by `msg`, if it is one.
    pub fn from_wire(msg: WireMessage) -> Option<Self> {
        match msg {
            WireMessage::MouseMove { x, y } => Some(InputEvent::MouseMove { x, y }),
            WireMessage::MouseClick { x, y } => Some(InputEvent::MouseClick { x, y }),
            WireMessage::KeyPress { key } => Some(InputEvent::KeyPress { key }),
            _ => None,
        }
    }
}

/// Platform hook that performs input on the local machine.
pub trait InputExecutor: Send {
    /// Screen size in pixels as `(width, height)`.
    fn screen_size(&self) -> (u32, u32);

    fn mouse_move(&mut self, x: u32, y: u32);

    fn mouse_click(&mut self, x: u32, y: u32);

    fn key_press(&mut self, key: &str);
}

/// Scale a validated event to screen pixels and run it.
pub fn execute(executor: &mut dyn InputExecutor, event: &InputEvent) {
    let (width, height) = executor.screen_size();
    let scale = |v: f64, extent: u32| (v * f64::from(extent)).round() as u32;

    match event {
        InputEvent::MouseMove { x, y } => {
            executor.mouse_move(scale(*x, width), scale(*y, height));
        }
        InputEvent::MouseClick { x, y } => {
            executor.mouse_click(scale(*x, width), scale(*y, height));
        }
        InputEvent::KeyPress { key } => executor.key_press(key),
    }
}

/// Executor that only records what it would have done.
///
/// Used where no OS input backend is wired in.
#[derive(Debug, Clone, Copy)]
pub struct LoggingInputExecutor {
    width: u32,
    height: u32,
}

impl Default for LoggingInputExecutor {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

impl InputExecutor for LoggingInputExecutor {
    fn screen_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn mouse_move(&mut self, x: u32, y: u32) {
        info!(event = "remote_mouse_move", x, y);
    }

    fn mouse_click(&mut self, x: u32, y: u32) {
        info!(event = "remote_mouse_click", x, y);
    }

    fn key_press(&mut self, key: &str) {
        info!(event = "remote_key_press", key);
    }
}
