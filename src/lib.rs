//! deskdrop: peer-to-peer remote screen sessions with consent-gated file
//! transfer.
//!
//! The [`core`] module holds the session state machine, the transfer engine
//! and the transport seam; [`workers`] wires them into the command-line
//! binary.

pub mod core;
pub mod utils;
pub mod workers;
