//! Worker pair lifecycle
//!
//! ```text
//! Allocating --ports leased--> Starting --launched--> Registered --retire--> Retiring --torn down--> Done
//!     ^  |                        |
//!     +--+ launch failed          |
//!     +---------------------------+ launch failed (after backoff)
//! ```
//!
//! Shutdown before registration goes straight to `Done`; a registered pair
//! always passes through `Retiring` so it is deregistered before teardown.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Allocating,
    Starting,
    Registered,
    Retiring,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairEvent {
    PortsLeased,
    LaunchFailed,
    Launched,
    Retire,
    TornDown,
    Shutdown,
}

/// Why a registered pair left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    Shutdown,
    CircuitExited,
    ForwarderExited,
    Expired,
}

const TRANSITIONS: &[(PairState, PairEvent, PairState)] = &[
    (PairState::Allocating, PairEvent::PortsLeased, PairState::Starting),
    (PairState::Allocating, PairEvent::LaunchFailed, PairState::Allocating),
    (PairState::Allocating, PairEvent::Shutdown, PairState::Done),
    (PairState::Starting, PairEvent::Launched, PairState::Registered),
    (PairState::Starting, PairEvent::LaunchFailed, PairState::Allocating),
    (PairState::Starting, PairEvent::Shutdown, PairState::Done),
    (PairState::Registered, PairEvent::Retire, PairState::Retiring),
    (PairState::Retiring, PairEvent::TornDown, PairState::Done),
];

impl PairState {
    /// Next state, or `None` if `event` is not valid in this state
    pub fn on(self, event: PairEvent) -> Option<PairState> {
        TRANSITIONS
            .iter()
            .find(|(from, on, _)| *from == self && *on == event)
            .map(|(_, _, to)| *to)
    }

    pub fn is_done(self) -> bool {
        self == PairState::Done
    }
}

impl fmt::Display for PairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PairState::Allocating => "allocating",
            PairState::Starting => "starting",
            PairState::Registered => "registered",
            PairState::Retiring => "retiring",
            PairState::Done => "done",
        };
        f.write_str(name)
    }
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            RetireReason::Shutdown => "application terminating",
            RetireReason::CircuitExited => "tor ended",
            RetireReason::ForwarderExited => "privoxy ended",
            RetireReason::Expired => "proxy lifetime expired",
        };
        f.write_str(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = PairState::Allocating;
        for event in [
            PairEvent::PortsLeased,
            PairEvent::Launched,
            PairEvent::Retire,
            PairEvent::TornDown,
        ] {
            state = state.on(event).unwrap();
        }
        assert!(state.is_done());
    }

    #[test]
    fn test_launch_failure_returns_to_allocating() {
        assert_eq!(
            PairState::Starting.on(PairEvent::LaunchFailed),
            Some(PairState::Allocating)
        );
        assert_eq!(
            PairState::Allocating.on(PairEvent::LaunchFailed),
            Some(PairState::Allocating)
        );
    }

    #[test]
    fn test_shutdown_before_registration_ends_immediately() {
        assert_eq!(
            PairState::Allocating.on(PairEvent::Shutdown),
            Some(PairState::Done)
        );
        assert_eq!(
            PairState::Starting.on(PairEvent::Shutdown),
            Some(PairState::Done)
        );
    }

    #[test]
    fn test_registered_pair_must_retire_first() {
        assert_eq!(PairState::Registered.on(PairEvent::Shutdown), None);
        assert_eq!(PairState::Registered.on(PairEvent::TornDown), None);
        assert_eq!(
            PairState::Registered.on(PairEvent::Retire),
            Some(PairState::Retiring)
        );
    }

    #[test]
    fn test_done_is_terminal() {
        for event in [
            PairEvent::PortsLeased,
            PairEvent::LaunchFailed,
            PairEvent::Launched,
            PairEvent::Retire,
            PairEvent::TornDown,
            PairEvent::Shutdown,
        ] {
            assert_eq!(PairState::Done.on(event), None);
        }
    }
}
