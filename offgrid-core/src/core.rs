//! Host-driven API: SessionCore receives transport events, returns actions.
//!
//! No I/O here. The session (or any other host) serializes calls, executes the returned
//! actions against the transport and forwards emitted events to its consumer.

use std::collections::HashMap;
use std::sync::Arc;

use crate::event::{ConnectionOutcome, SessionEvent};
use crate::identity::EndpointId;
use crate::lifecycle::{ConnectionState, EndpointLifecycle, LifecycleInput, Step};
use crate::protocol::ControlMessage;
use crate::registry::EndpointRegistry;
use crate::transport::TransportEvent;
use crate::wire;

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Accept the pending connection (every initiated connection is accepted).
    AcceptConnection(EndpointId),
    StopDiscovery,
    StopAdvertising,
    /// Deliver to the consumer.
    Emit(SessionEvent),
}

/// Per-endpoint state machines plus the shared name registry and the scan flags.
pub struct SessionCore {
    registry: Arc<EndpointRegistry>,
    endpoints: HashMap<EndpointId, EndpointLifecycle>,
    discovering: bool,
    advertising: bool,
}

impl SessionCore {
    pub fn new() -> Self {
        Self::with_registry(Arc::new(EndpointRegistry::new()))
    }

    pub fn with_registry(registry: Arc<EndpointRegistry>) -> Self {
        Self {
            registry,
            endpoints: HashMap::new(),
            discovering: false,
            advertising: false,
        }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// State of `id`; `Idle` for endpoints never seen.
    pub fn state(&self, id: &EndpointId) -> ConnectionState {
        self.endpoints
            .get(id)
            .map(EndpointLifecycle::state)
            .unwrap_or(ConnectionState::Idle)
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    /// Endpoints currently in `Connected`, sorted.
    pub fn connected_endpoints(&self) -> Vec<EndpointId> {
        let mut out: Vec<EndpointId> = self
            .endpoints
            .iter()
            .filter(|(_, lc)| lc.state() == ConnectionState::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        out.sort();
        out
    }

    /// True while advertising, discovering, or any connection is pending or up.
    pub fn is_active(&self) -> bool {
        self.discovering
            || self.advertising
            || self.endpoints.values().any(|lc| {
                matches!(
                    lc.state(),
                    ConnectionState::Initiated | ConnectionState::Connected
                )
            })
    }

    /// Mark discovery as running. Returns false if it already was.
    pub fn begin_discovery(&mut self) -> bool {
        !std::mem::replace(&mut self.discovering, true)
    }

    /// Mark advertising as running. Returns false if it already was.
    pub fn begin_advertising(&mut self) -> bool {
        !std::mem::replace(&mut self.advertising, true)
    }

    /// Transport refused to start discovery.
    pub fn discovery_failed(&mut self) {
        self.discovering = false;
    }

    /// Transport refused to start advertising.
    pub fn advertising_failed(&mut self) {
        self.advertising = false;
    }

    /// Local connection request. Returns the previous state if the endpoint moved to `Initiated`,
    /// `None` if a connection to it is already pending or up.
    pub fn begin_connect(&mut self, id: &EndpointId) -> Option<ConnectionState> {
        let step = self.apply(id, LifecycleInput::RequestSent)?;
        tracing::debug!(endpoint = %id, from = ?step.from, "connection requested");
        Some(step.from)
    }

    /// Transport refused the connection request; restore the state before `begin_connect`.
    pub fn connect_failed(&mut self, id: &EndpointId, previous: ConnectionState) {
        if let Some(lc) = self.endpoints.get_mut(id) {
            lc.revert_request(previous);
        }
        self.prune(id);
    }

    /// Process one transport event.
    pub fn on_transport_event(&mut self, event: TransportEvent) -> Vec<Action> {
        match event {
            TransportEvent::EndpointFound { endpoint_id, name } => {
                self.on_endpoint_found(endpoint_id, name)
            }
            TransportEvent::EndpointLost { endpoint_id } => self.on_endpoint_lost(endpoint_id),
            TransportEvent::ConnectionInitiated { endpoint_id, name } => {
                self.on_connection_initiated(endpoint_id, name)
            }
            TransportEvent::ConnectionResult {
                endpoint_id,
                status,
            } => self.on_connection_result(endpoint_id, status),
            TransportEvent::Disconnected { endpoint_id } => self.on_disconnected(endpoint_id),
            TransportEvent::BytesReceived { endpoint_id, bytes } => {
                self.on_bytes_received(endpoint_id, &bytes)
            }
        }
    }

    fn on_endpoint_found(&mut self, id: EndpointId, name: String) -> Vec<Action> {
        if !self.discovering {
            tracing::debug!(endpoint = %id, "endpoint found while not discovering; ignored");
            return vec![];
        }
        self.registry.record_name(&id, &name);
        match self.apply(&id, LifecycleInput::EndpointFound) {
            Some(_) => {
                let name = self.registry.lookup_name(&id);
                tracing::debug!(endpoint = %id, %name, "endpoint found");
                vec![Action::Emit(SessionEvent::EndpointFound {
                    endpoint_id: id,
                    name,
                })]
            }
            None => vec![],
        }
    }

    fn on_endpoint_lost(&mut self, id: EndpointId) -> Vec<Action> {
        let state = self.state(&id);
        let in_discovery_phase = matches!(
            state,
            ConnectionState::Idle
                | ConnectionState::Discovered
                | ConnectionState::Rejected
                | ConnectionState::Errored
        );
        if in_discovery_phase {
            self.registry.forget(&id);
        }
        // Discovered, Rejected and Errored all return to Idle and report the loss.
        // Pending and connected endpoints keep their own lifecycle.
        match self.apply(&id, LifecycleInput::EndpointLost) {
            Some(_) => {
                tracing::debug!(endpoint = %id, "endpoint lost");
                vec![Action::Emit(SessionEvent::EndpointLost { endpoint_id: id })]
            }
            None => vec![],
        }
    }

    fn on_connection_initiated(&mut self, id: EndpointId, name: String) -> Vec<Action> {
        self.registry.record_name(&id, &name);
        match self.apply(&id, LifecycleInput::ConnectionInitiated) {
            Some(Step { accept: true, .. }) => {
                tracing::debug!(endpoint = %id, %name, "connection initiated; accepting");
                vec![Action::AcceptConnection(id)]
            }
            _ => vec![],
        }
    }

    fn on_connection_result(
        &mut self,
        id: EndpointId,
        status: crate::transport::ConnectionStatus,
    ) -> Vec<Action> {
        let Some(step) = self.apply(&id, LifecycleInput::ConnectionResult(status)) else {
            tracing::warn!(endpoint = %id, ?status, state = ?self.state(&id), "connection result with no pending connection; ignored");
            return vec![];
        };
        let endpoint_name = self.registry.lookup_name(&id);
        let mut actions = Vec::new();
        let outcome = match step.to {
            ConnectionState::Connected => {
                // One active link is enough: stop scanning once, whatever else was pending.
                // Only what this session started is stopped; an advertiser-only session
                // never asks the transport to stop discovery.
                if std::mem::replace(&mut self.discovering, false) {
                    actions.push(Action::StopDiscovery);
                }
                if std::mem::replace(&mut self.advertising, false) {
                    actions.push(Action::StopAdvertising);
                }
                tracing::info!(endpoint = %id, name = %endpoint_name, "connected");
                ConnectionOutcome::Connected
            }
            ConnectionState::Rejected => {
                tracing::info!(endpoint = %id, "connection rejected");
                ConnectionOutcome::Rejected
            }
            _ => {
                tracing::info!(endpoint = %id, ?status, "connection failed");
                ConnectionOutcome::Error
            }
        };
        actions.push(Action::Emit(SessionEvent::ConnectionResult {
            endpoint_id: id,
            endpoint_name,
            status: outcome,
        }));
        actions
    }

    fn on_disconnected(&mut self, id: EndpointId) -> Vec<Action> {
        match self.apply(&id, LifecycleInput::Disconnected) {
            Some(_) => {
                let endpoint_name = self.registry.lookup_name(&id);
                tracing::info!(endpoint = %id, name = %endpoint_name, "disconnected");
                vec![Action::Emit(SessionEvent::Disconnected {
                    endpoint_id: id,
                    endpoint_name,
                })]
            }
            None => {
                tracing::debug!(endpoint = %id, "disconnect for endpoint not connected; ignored");
                vec![]
            }
        }
    }

    fn on_bytes_received(&mut self, id: EndpointId, bytes: &[u8]) -> Vec<Action> {
        if self.state(&id) != ConnectionState::Connected {
            tracing::warn!(endpoint = %id, len = bytes.len(), "payload from endpoint not connected; dropped");
            return vec![];
        }
        let event = match wire::decode_payload(bytes) {
            ControlMessage::Chat { text } => SessionEvent::MessageReceived {
                endpoint_id: id,
                message: text,
            },
            ControlMessage::TypingStart => SessionEvent::TypingChanged {
                endpoint_id: id,
                is_typing: true,
            },
            ControlMessage::TypingStop => SessionEvent::TypingChanged {
                endpoint_id: id,
                is_typing: false,
            },
            ControlMessage::ReadReceipt { message_id } => SessionEvent::ReadReceiptReceived {
                endpoint_id: id,
                message_id,
            },
        };
        vec![Action::Emit(event)]
    }

    /// Reset every endpoint to `Idle`, clear scan flags and start a new registry epoch.
    /// Connected endpoints are reported as `Disconnected` and keep their names.
    pub fn stop_all(&mut self) -> Vec<Action> {
        let mut ids: Vec<EndpointId> = self.endpoints.keys().cloned().collect();
        ids.sort();
        let mut actions = Vec::new();
        let mut was_connected = Vec::new();
        for id in ids {
            if let Some(step) = self.apply(&id, LifecycleInput::Stop) {
                if step.to == ConnectionState::Disconnected {
                    let endpoint_name = self.registry.lookup_name(&id);
                    actions.push(Action::Emit(SessionEvent::Disconnected {
                        endpoint_id: id.clone(),
                        endpoint_name,
                    }));
                    was_connected.push(id.clone());
                }
            }
        }
        // Terminal entries have already been reported; nothing is carried into the next cycle.
        self.endpoints.clear();
        self.registry.advance_epoch(|id| was_connected.contains(id));
        self.discovering = false;
        self.advertising = false;
        tracing::info!(disconnected = was_connected.len(), "stopped all endpoints");
        actions
    }

    fn apply(&mut self, id: &EndpointId, input: LifecycleInput) -> Option<Step> {
        let step = self.endpoints.entry(id.clone()).or_default().apply(input);
        if let Some(step) = &step {
            tracing::debug!(endpoint = %id, ?input, from = ?step.from, to = ?step.to, "transition");
        }
        self.prune(id);
        step
    }

    /// Idle endpoints are not stored.
    fn prune(&mut self, id: &EndpointId) {
        if self.state(id) == ConnectionState::Idle {
            self.endpoints.remove(id);
        }
    }
}

impl Default for SessionCore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::UNKNOWN_DEVICE;
    use crate::transport::ConnectionStatus;

    fn found(id: &str, name: &str) -> TransportEvent {
        TransportEvent::EndpointFound {
            endpoint_id: id.into(),
            name: name.into(),
        }
    }

    fn initiated(id: &str, name: &str) -> TransportEvent {
        TransportEvent::ConnectionInitiated {
            endpoint_id: id.into(),
            name: name.into(),
        }
    }

    fn result(id: &str, status: ConnectionStatus) -> TransportEvent {
        TransportEvent::ConnectionResult {
            endpoint_id: id.into(),
            status,
        }
    }

    fn bytes(id: &str, b: &[u8]) -> TransportEvent {
        TransportEvent::BytesReceived {
            endpoint_id: id.into(),
            bytes: b.to_vec(),
        }
    }

    fn connected_core(id: &str, name: &str) -> SessionCore {
        let mut core = SessionCore::new();
        core.on_transport_event(initiated(id, name));
        core.on_transport_event(result(id, ConnectionStatus::Ok));
        core
    }

    #[test]
    fn found_then_lost_updates_registry() {
        let mut core = SessionCore::new();
        core.begin_discovery();
        let actions = core.on_transport_event(found("E1", "Alice"));
        assert_eq!(
            actions,
            vec![Action::Emit(SessionEvent::EndpointFound {
                endpoint_id: "E1".into(),
                name: "Alice".into()
            })]
        );
        assert_eq!(core.registry().lookup_name(&"E1".into()), "Alice");
        assert_eq!(core.state(&"E1".into()), ConnectionState::Discovered);

        let actions = core.on_transport_event(TransportEvent::EndpointLost {
            endpoint_id: "E1".into(),
        });
        assert_eq!(actions.len(), 1);
        assert_eq!(core.registry().lookup_name(&"E1".into()), UNKNOWN_DEVICE);
        assert_eq!(core.state(&"E1".into()), ConnectionState::Idle);
    }

    #[test]
    fn duplicate_found_emits_once() {
        let mut core = SessionCore::new();
        core.begin_discovery();
        assert_eq!(core.on_transport_event(found("E1", "Alice")).len(), 1);
        assert!(core.on_transport_event(found("E1", "Alice")).is_empty());
    }

    #[test]
    fn found_while_not_discovering_is_ignored() {
        let mut core = SessionCore::new();
        assert!(core.on_transport_event(found("E1", "Alice")).is_empty());
        assert!(!core.registry().contains(&"E1".into()));
    }

    #[test]
    fn advertiser_learns_name_on_initiation_and_accepts() {
        let mut core = SessionCore::new();
        core.begin_advertising();
        let actions = core.on_transport_event(initiated("E9", "Bob"));
        assert_eq!(actions, vec![Action::AcceptConnection("E9".into())]);
        assert!(core.on_transport_event(initiated("E9", "Bob")).is_empty());

        let actions = core.on_transport_event(result("E9", ConnectionStatus::Ok));
        assert_eq!(
            actions,
            vec![
                Action::StopAdvertising,
                Action::Emit(SessionEvent::ConnectionResult {
                    endpoint_id: "E9".into(),
                    endpoint_name: "Bob".into(),
                    status: ConnectionOutcome::Connected,
                })
            ]
        );
    }

    #[test]
    fn discoverer_accepts_after_own_request() {
        let mut core = SessionCore::new();
        core.begin_discovery();
        core.on_transport_event(found("E1", "Alice"));
        assert_eq!(core.begin_connect(&"E1".into()), Some(ConnectionState::Discovered));
        assert_eq!(core.begin_connect(&"E1".into()), None);
        let actions = core.on_transport_event(initiated("E1", "Alice (late)"));
        assert_eq!(actions, vec![Action::AcceptConnection("E1".into())]);
        // The discovery-time name wins within the epoch.
        assert_eq!(core.registry().lookup_name(&"E1".into()), "Alice");
    }

    #[test]
    fn connected_stops_scanning_exactly_once() {
        let mut core = SessionCore::new();
        core.begin_discovery();
        core.begin_advertising();
        core.on_transport_event(found("A", "a"));
        core.on_transport_event(found("B", "b"));
        core.on_transport_event(initiated("C", "c"));
        core.on_transport_event(initiated("D", "d"));

        let mut all = core.on_transport_event(result("C", ConnectionStatus::Ok));
        all.extend(core.on_transport_event(result("C", ConnectionStatus::Ok)));
        all.extend(core.on_transport_event(result("D", ConnectionStatus::Ok)));
        let stops_disc = all.iter().filter(|a| **a == Action::StopDiscovery).count();
        let stops_adv = all.iter().filter(|a| **a == Action::StopAdvertising).count();
        assert_eq!((stops_disc, stops_adv), (1, 1));
        assert!(!core.is_discovering());
        assert!(!core.is_advertising());
        assert_eq!(core.connected_endpoints(), vec!["C".into(), "D".into()]);
    }

    #[test]
    fn rejected_and_error_results_are_reported() {
        let mut core = SessionCore::new();
        core.on_transport_event(initiated("E1", "x"));
        let actions = core.on_transport_event(result("E1", ConnectionStatus::Rejected));
        assert!(matches!(
            actions.as_slice(),
            [Action::Emit(SessionEvent::ConnectionResult {
                status: ConnectionOutcome::Rejected,
                ..
            })]
        ));
        core.on_transport_event(initiated("E2", "y"));
        let actions = core.on_transport_event(result("E2", ConnectionStatus::Error(13)));
        assert!(matches!(
            actions.as_slice(),
            [Action::Emit(SessionEvent::ConnectionResult {
                status: ConnectionOutcome::Error,
                ..
            })]
        ));
        assert_eq!(core.state(&"E2".into()), ConnectionState::Errored);
    }

    #[test]
    fn result_before_initiation_is_ignored() {
        let mut core = SessionCore::new();
        core.begin_discovery();
        assert!(core
            .on_transport_event(result("E1", ConnectionStatus::Ok))
            .is_empty());
        assert_ne!(core.state(&"E1".into()), ConnectionState::Connected);
        assert!(core.is_discovering());
    }

    #[test]
    fn disconnect_keeps_name_resolvable() {
        let mut core = connected_core("E1", "Alice");
        core.on_transport_event(TransportEvent::EndpointLost {
            endpoint_id: "E1".into(),
        });
        let actions = core.on_transport_event(TransportEvent::Disconnected {
            endpoint_id: "E1".into(),
        });
        assert_eq!(
            actions,
            vec![Action::Emit(SessionEvent::Disconnected {
                endpoint_id: "E1".into(),
                endpoint_name: "Alice".into()
            })]
        );
        assert!(core
            .on_transport_event(TransportEvent::Disconnected {
                endpoint_id: "E1".into()
            })
            .is_empty());
    }

    #[test]
    fn payloads_route_by_kind() {
        let mut core = connected_core("E1", "Alice");
        let payloads: [&[u8]; 4] = [
            b"hello",
            b"__typing_start__",
            b"__typing_stop__",
            b"__read__42",
        ];
        let emitted: Vec<SessionEvent> = payloads
            .iter()
            .flat_map(|b| core.on_transport_event(bytes("E1", b)))
            .filter_map(|a| match a {
                Action::Emit(ev) => Some(ev),
                _ => None,
            })
            .collect();
        assert_eq!(
            emitted,
            vec![
                SessionEvent::MessageReceived {
                    endpoint_id: "E1".into(),
                    message: "hello".into()
                },
                SessionEvent::TypingChanged {
                    endpoint_id: "E1".into(),
                    is_typing: true
                },
                SessionEvent::TypingChanged {
                    endpoint_id: "E1".into(),
                    is_typing: false
                },
                SessionEvent::ReadReceiptReceived {
                    endpoint_id: "E1".into(),
                    message_id: "42".into()
                },
            ]
        );
    }

    #[test]
    fn payload_from_unconnected_endpoint_dropped() {
        let mut core = SessionCore::new();
        core.on_transport_event(initiated("E1", "Alice"));
        assert!(core.on_transport_event(bytes("E1", b"early")).is_empty());
    }

    #[test]
    fn stop_all_from_mixed_states() {
        let mut core = SessionCore::new();
        core.begin_discovery();
        core.begin_advertising();
        core.on_transport_event(found("A", "a"));
        core.on_transport_event(found("B", "b"));
        core.begin_connect(&"B".into());
        core.on_transport_event(initiated("C", "c"));
        core.on_transport_event(result("C", ConnectionStatus::Ok));
        core.on_transport_event(initiated("D", "d"));
        core.on_transport_event(result("D", ConnectionStatus::Rejected));

        let actions = core.stop_all();
        assert_eq!(
            actions,
            vec![Action::Emit(SessionEvent::Disconnected {
                endpoint_id: "C".into(),
                endpoint_name: "c".into()
            })]
        );
        for id in ["A", "B", "C", "D"] {
            assert!(core.state(&id.into()).is_at_rest());
        }
        assert!(!core.is_active());
        let reg = core.registry();
        assert!(!reg.contains(&"A".into()));
        assert!(!reg.contains(&"B".into()));
        assert!(!reg.contains(&"D".into()));
        assert_eq!(reg.lookup_name(&"C".into()), "c");
        assert!(core.stop_all().is_empty());
    }

    #[test]
    fn lost_after_rejected_connection_is_reported() {
        let mut core = SessionCore::new();
        core.begin_discovery();
        core.on_transport_event(found("E1", "Alice"));
        core.begin_connect(&"E1".into());
        core.on_transport_event(initiated("E1", "Alice"));
        core.on_transport_event(result("E1", ConnectionStatus::Rejected));

        let actions = core.on_transport_event(TransportEvent::EndpointLost {
            endpoint_id: "E1".into(),
        });
        assert_eq!(
            actions,
            vec![Action::Emit(SessionEvent::EndpointLost {
                endpoint_id: "E1".into()
            })]
        );
        assert_eq!(core.state(&"E1".into()), ConnectionState::Idle);
        assert!(!core.registry().contains(&"E1".into()));
        assert!(core
            .on_transport_event(TransportEvent::EndpointLost {
                endpoint_id: "E1".into()
            })
            .is_empty());
    }

    #[test]
    fn lost_after_errored_connection_is_reported() {
        let mut core = SessionCore::new();
        core.begin_discovery();
        core.on_transport_event(found("E2", "Bob"));
        core.begin_connect(&"E2".into());
        core.on_transport_event(result("E2", ConnectionStatus::Error(13)));
        let actions = core.on_transport_event(TransportEvent::EndpointLost {
            endpoint_id: "E2".into(),
        });
        assert_eq!(actions.len(), 1);
        assert_eq!(core.state(&"E2".into()), ConnectionState::Idle);
    }

    #[test]
    fn stop_all_cycles_do_not_accumulate_endpoints() {
        let mut core = SessionCore::new();
        for _ in 0..50 {
            core.begin_advertising();
            core.on_transport_event(initiated("P0", "p"));
            core.on_transport_event(result("P0", ConnectionStatus::Ok));
            core.on_transport_event(initiated("P1", "q"));
            core.on_transport_event(result("P1", ConnectionStatus::Rejected));
            assert_eq!(core.stop_all().len(), 1);
            assert!(core.endpoints.is_empty());
        }
        assert_eq!(core.state(&"P0".into()), ConnectionState::Idle);
        assert_eq!(core.registry().epoch(), 50);
    }

    #[test]
    fn advertiser_only_never_stops_discovery() {
        let mut core = SessionCore::new();
        core.begin_advertising();
        core.on_transport_event(initiated("E1", "a"));
        let actions = core.on_transport_event(result("E1", ConnectionStatus::Ok));
        assert!(!actions.contains(&Action::StopDiscovery));
        assert!(actions.contains(&Action::StopAdvertising));
    }

    #[test]
    fn connect_failed_reverts() {
        let mut core = SessionCore::new();
        let prev = core.begin_connect(&"E1".into()).unwrap();
        assert_eq!(prev, ConnectionState::Idle);
        assert!(core.is_active());
        core.connect_failed(&"E1".into(), prev);
        assert_eq!(core.state(&"E1".into()), ConnectionState::Idle);
        assert!(!core.is_active());
    }
}
