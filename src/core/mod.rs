pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod identity;
pub mod node;
pub mod protocol;
pub mod session;
pub mod transfer;
