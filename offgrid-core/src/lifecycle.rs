//! Per-endpoint connection lifecycle.
//!
//! ```text
//!            found                 request / initiated          result OK
//!   Idle ───────────> Discovered ─────────────────────> Initiated ─────────> Connected
//!    ^                    │                                 │                    │
//!    ├────── lost ────────┘                  rejected/error │       disconnected │
//!    │                                                      v                    v
//!    └──────────────── lost ───────────────────── Rejected / Errored        Disconnected
//! ```
//!
//! Terminal states behave like `Idle` for the start of a new cycle. Inputs with no transition
//! from the current state are no-ops, so duplicate transport events never repeat a side effect.

use serde::{Deserialize, Serialize};

use crate::transport::ConnectionStatus;

/// Connection state of one remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Discovered,
    Initiated,
    Connected,
    Rejected,
    Errored,
    Disconnected,
}

impl ConnectionState {
    /// Rejected, Errored or Disconnected.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Rejected | ConnectionState::Errored | ConnectionState::Disconnected
        )
    }

    /// Idle or terminal: a new discovery or connection cycle may start here.
    pub fn is_at_rest(self) -> bool {
        self == ConnectionState::Idle || self.is_terminal()
    }
}

/// Inputs to one endpoint's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleInput {
    /// Transport found the endpoint while discovering.
    EndpointFound,
    /// Transport lost the endpoint while discovering.
    EndpointLost,
    /// Local side sent a connection request.
    RequestSent,
    /// Transport reported a connection being initiated (either side).
    ConnectionInitiated,
    ConnectionResult(ConnectionStatus),
    Disconnected,
    /// Stop-all: force to idle or terminal.
    Stop,
}

/// A transition that happened. `accept` asks the host to accept the pending connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub accept: bool,
}

/// State machine for a single endpoint.
#[derive(Debug, Clone)]
pub struct EndpointLifecycle {
    state: ConnectionState,
    /// Whether the pending connection has been accepted locally (meaningful in `Initiated`).
    accepted: bool,
}

impl EndpointLifecycle {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            accepted: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Apply an input. Returns `None` when the input is a no-op in the current state.
    pub fn apply(&mut self, input: LifecycleInput) -> Option<Step> {
        use ConnectionState::*;
        let from = self.state;
        let (to, accept) = match (from, input) {
            (s, LifecycleInput::EndpointFound) if s.is_at_rest() => (Discovered, false),
            (Discovered | Rejected | Errored, LifecycleInput::EndpointLost) => (Idle, false),
            (s, LifecycleInput::RequestSent) if s.is_at_rest() || s == Discovered => {
                self.accepted = false;
                (Initiated, false)
            }
            (s, LifecycleInput::ConnectionInitiated) if s.is_at_rest() || s == Discovered => {
                self.accepted = true;
                (Initiated, true)
            }
            // Our own request is pending; the transport now asks us to accept it.
            (Initiated, LifecycleInput::ConnectionInitiated) if !self.accepted => {
                self.accepted = true;
                (Initiated, true)
            }
            (Initiated, LifecycleInput::ConnectionResult(status)) => match status {
                ConnectionStatus::Ok => (Connected, false),
                ConnectionStatus::Rejected => (Rejected, false),
                ConnectionStatus::Error(_) => (Errored, false),
            },
            (Connected, LifecycleInput::Disconnected) => (Disconnected, false),
            (Connected, LifecycleInput::Stop) => (Disconnected, false),
            (Discovered | Initiated, LifecycleInput::Stop) => (Idle, false),
            _ => return None,
        };
        self.state = to;
        if to != Initiated {
            self.accepted = false;
        }
        Some(Step { from, to, accept })
    }

    /// Undo a local request that the transport refused to send.
    pub(crate) fn revert_request(&mut self, previous: ConnectionState) {
        if self.state == ConnectionState::Initiated && !self.accepted {
            self.state = previous;
        }
    }
}

impl Default for EndpointLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ConnectionState::*;

    #[test]
    fn discoverer_happy_path() {
        let mut lc = EndpointLifecycle::new();
        assert_eq!(lc.apply(LifecycleInput::EndpointFound).unwrap().to, Discovered);
        let s = lc.apply(LifecycleInput::RequestSent).unwrap();
        assert_eq!((s.from, s.to, s.accept), (Discovered, Initiated, false));
        let s = lc.apply(LifecycleInput::ConnectionInitiated).unwrap();
        assert_eq!((s.from, s.to, s.accept), (Initiated, Initiated, true));
        let s = lc
            .apply(LifecycleInput::ConnectionResult(ConnectionStatus::Ok))
            .unwrap();
        assert_eq!((s.from, s.to), (Initiated, Connected));
        let s = lc.apply(LifecycleInput::Disconnected).unwrap();
        assert_eq!((s.from, s.to), (Connected, Disconnected));
    }

    #[test]
    fn advertiser_auto_accepts() {
        let mut lc = EndpointLifecycle::new();
        let s = lc.apply(LifecycleInput::ConnectionInitiated).unwrap();
        assert_eq!((s.from, s.to, s.accept), (Idle, Initiated, true));
        // Duplicate initiation is a no-op: at most one accept.
        assert!(lc.apply(LifecycleInput::ConnectionInitiated).is_none());
    }

    #[test]
    fn rejected_and_errored_are_terminal() {
        let mut lc = EndpointLifecycle::new();
        lc.apply(LifecycleInput::ConnectionInitiated);
        let s = lc
            .apply(LifecycleInput::ConnectionResult(ConnectionStatus::Rejected))
            .unwrap();
        assert_eq!(s.to, Rejected);
        assert!(lc.state().is_terminal());
        assert!(lc
            .apply(LifecycleInput::ConnectionResult(ConnectionStatus::Ok))
            .is_none());

        let mut lc = EndpointLifecycle::new();
        lc.apply(LifecycleInput::RequestSent);
        let s = lc
            .apply(LifecycleInput::ConnectionResult(ConnectionStatus::Error(13)))
            .unwrap();
        assert_eq!(s.to, Errored);
    }

    #[test]
    fn result_without_initiation_is_ignored() {
        let mut lc = EndpointLifecycle::new();
        assert!(lc
            .apply(LifecycleInput::ConnectionResult(ConnectionStatus::Ok))
            .is_none());
        lc.apply(LifecycleInput::EndpointFound);
        assert!(lc
            .apply(LifecycleInput::ConnectionResult(ConnectionStatus::Ok))
            .is_none());
        assert_eq!(lc.state(), Discovered);
    }

    #[test]
    fn lost_leaves_discovery_phase_only() {
        let mut lc = EndpointLifecycle::new();
        assert!(lc.apply(LifecycleInput::EndpointLost).is_none());
        lc.apply(LifecycleInput::EndpointFound);
        assert_eq!(lc.apply(LifecycleInput::EndpointLost).unwrap().to, Idle);
        lc.apply(LifecycleInput::ConnectionInitiated);
        assert!(lc.apply(LifecycleInput::EndpointLost).is_none());
        assert_eq!(lc.state(), Initiated);
        lc.apply(LifecycleInput::ConnectionResult(ConnectionStatus::Ok));
        assert!(lc.apply(LifecycleInput::EndpointLost).is_none());
        lc.apply(LifecycleInput::Disconnected);
        assert!(lc.apply(LifecycleInput::EndpointLost).is_none());
        assert_eq!(lc.state(), Disconnected);
    }

    #[test]
    fn lost_after_failed_connection_returns_to_idle() {
        for status in [ConnectionStatus::Rejected, ConnectionStatus::Error(13)] {
            let mut lc = EndpointLifecycle::new();
            lc.apply(LifecycleInput::EndpointFound);
            lc.apply(LifecycleInput::RequestSent);
            lc.apply(LifecycleInput::ConnectionResult(status));
            let s = lc.apply(LifecycleInput::EndpointLost).unwrap();
            assert_eq!(s.to, Idle);
            assert!(lc.apply(LifecycleInput::EndpointLost).is_none());
        }
    }

    #[test]
    fn stop_forces_rest() {
        for setup in [
            vec![],
            vec![LifecycleInput::EndpointFound],
            vec![LifecycleInput::RequestSent],
            vec![
                LifecycleInput::ConnectionInitiated,
                LifecycleInput::ConnectionResult(ConnectionStatus::Ok),
            ],
        ] {
            let mut lc = EndpointLifecycle::new();
            for input in setup {
                lc.apply(input);
            }
            lc.apply(LifecycleInput::Stop);
            assert!(lc.state().is_at_rest(), "state {:?}", lc.state());
        }
    }

    #[test]
    fn terminal_state_can_start_new_cycle() {
        let mut lc = EndpointLifecycle::new();
        lc.apply(LifecycleInput::ConnectionInitiated);
        lc.apply(LifecycleInput::ConnectionResult(ConnectionStatus::Ok));
        lc.apply(LifecycleInput::Disconnected);
        assert!(lc.apply(LifecycleInput::Disconnected).is_none());
        assert_eq!(lc.apply(LifecycleInput::EndpointFound).unwrap().to, Discovered);
    }

    #[test]
    fn revert_request_restores_previous_state() {
        let mut lc = EndpointLifecycle::new();
        lc.apply(LifecycleInput::EndpointFound);
        lc.apply(LifecycleInput::RequestSent);
        lc.revert_request(Discovered);
        assert_eq!(lc.state(), Discovered);
    }

    fn input_strategy() -> impl Strategy<Value = LifecycleInput> {
        prop_oneof![
            Just(LifecycleInput::EndpointFound),
            Just(LifecycleInput::EndpointLost),
            Just(LifecycleInput::RequestSent),
            Just(LifecycleInput::ConnectionInitiated),
            Just(LifecycleInput::ConnectionResult(ConnectionStatus::Ok)),
            Just(LifecycleInput::ConnectionResult(ConnectionStatus::Rejected)),
            Just(LifecycleInput::ConnectionResult(ConnectionStatus::Error(8012))),
            Just(LifecycleInput::Disconnected),
            Just(LifecycleInput::Stop),
        ]
    }

    proptest! {
        #[test]
        fn prop_connected_only_from_initiated(inputs in prop::collection::vec(input_strategy(), 0..64)) {
            let mut lc = EndpointLifecycle::new();
            let mut accepts_this_cycle = 0u32;
            for input in inputs {
                if let Some(step) = lc.apply(input) {
                    if step.to == Connected && step.from != Connected {
                        prop_assert_eq!(step.from, Initiated);
                    }
                    if step.from != Initiated {
                        accepts_this_cycle = 0;
                    }
                    if step.accept {
                        accepts_this_cycle += 1;
                    }
                    prop_assert!(accepts_this_cycle <= 1);
                }
            }
        }
    }
}
