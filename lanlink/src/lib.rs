//! `LanLink` client library.
//!
//! Joins a room on a local signaling relay, negotiates a direct channel with
//! the other member, and then carries text, files and media frames over that
//! channel. The same send / event contract is available over an alternate
//! mesh radio bridge.

pub mod config;
pub mod events;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod transport;
