//! Shared protocol definitions for `LanLink` wire formats.
//!
//! - [`signal`]: JSON signaling messages routed by the relay.
//! - [`channel`]: length-prefixed frames carried on the direct peer channel.

pub mod channel;
pub mod signal;
