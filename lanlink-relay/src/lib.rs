//! `LanLink` signaling relay library.
//!
//! Exposes the relay server for use in tests and embedding. The relay
//! accepts WebSocket connections, groups them into rooms, and fans
//! signaling messages out to the other members of the sender's room.

pub mod config;
pub mod relay;
pub mod rooms;
