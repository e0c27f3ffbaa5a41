//! Connection state.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

// ============================================================================
// State
// ============================================================================

/// Connection state, in increasing order of readiness.
///
/// ```text
/// Closed → Connecting → Open → Established ⇄ Available
/// ```
///
/// `Available` is entered and left on host notifications, so it can toggle
/// any number of times after establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum State {
    /// No socket.
    #[default]
    Closed = 0,
    /// Socket opening.
    Connecting = 1,
    /// Socket open, handshake in progress.
    Open = 2,
    /// Handshake done; API calls not yet enabled by the user.
    Established = 3,
    /// API calls enabled.
    Available = 4,
}

impl State {
    /// All states in order.
    pub const ALL: [State; 5] = [
        State::Closed,
        State::Connecting,
        State::Open,
        State::Established,
        State::Available,
    ];

    /// Numeric value of the state.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Converts a numeric value back into a state.
    #[inline]
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Closed),
            1 => Some(Self::Connecting),
            2 => Some(Self::Open),
            3 => Some(Self::Established),
            4 => Some(Self::Available),
            _ => None,
        }
    }

    /// Human-readable label.
    #[inline]
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::Connecting => "Connecting",
            Self::Open => "Open",
            Self::Established => "Established",
            Self::Available => "Available",
        }
    }

    /// Returns `true` once the handshake has completed.
    #[inline]
    #[must_use]
    pub const fn is_established(self) -> bool {
        matches!(self, Self::Established | Self::Available)
    }

    /// Returns `true` if API calls are allowed.
    #[inline]
    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Available)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Tests
// ============================================================================
