//! Session lifecycle states.

use std::fmt;

/// Lifecycle state of a [`super::Session`].
///
/// ```text
/// Idle -> Joining -> Negotiating -> Connected -> Closed -> Idle
///            |            |                        ^
///            +-> Failed <-+------------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// No relay connection.
    #[default]
    Idle,
    /// Relay connection open, waiting for the join acknowledgment.
    Joining,
    /// Exchanging descriptions and candidates.
    Negotiating,
    /// The direct channel is open.
    Connected,
    /// Tearing down; moves on to `Idle`.
    Closed,
    /// Setup failed; resources are released and `connect` may be retried.
    Failed,
}

impl SessionState {
    /// Whether the state machine permits moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle | Self::Failed, Self::Joining)
                | (Self::Joining, Self::Negotiating)
                | (Self::Negotiating, Self::Connected)
                | (Self::Joining | Self::Negotiating, Self::Failed)
                | (
                    Self::Joining | Self::Negotiating | Self::Connected | Self::Failed,
                    Self::Closed
                )
                | (Self::Closed, Self::Idle)
        )
    }

    /// `true` between `connect` and teardown, while relay or channel
    /// resources are held.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Joining | Self::Negotiating | Self::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Joining => "Joining",
            Self::Negotiating => "Negotiating",
            Self::Connected => "Connected",
            Self::Closed => "Closed",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}
