//! Endpoint and local identity: transport-assigned endpoint ids, the local username, session config.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default service id shared by every device running the app. Peers only see each other within one service id.
pub const DEFAULT_SERVICE_ID: &str = "com.example.offgrid.service";

/// Opaque identifier for a remote peer, as assigned by the transport.
/// Unique for the lifetime of one discovery/connection session; not stable across restarts.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        EndpointId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        EndpointId(s.to_owned())
    }
}

impl From<String> for EndpointId {
    fn from(s: String) -> Self {
        EndpointId(s)
    }
}

/// Name this device advertises and sends with connection requests.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct LocalIdentity {
    username: String,
}

impl LocalIdentity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }

    /// Generate a per-session name of the form `User-NNNN` (NNNN in 1000..=9999).
    pub fn generate() -> Self {
        let n: u16 = rand::thread_rng().gen_range(1000..=9999);
        Self::new(format!("User-{}", n))
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self::generate()
    }
}

/// Session configuration passed to the facade at construction.
/// The identity only changes through an explicit rename while no cycle is active.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub service_id: String,
    pub identity: LocalIdentity,
}

impl SessionConfig {
    pub fn new(service_id: impl Into<String>, identity: LocalIdentity) -> Self {
        Self {
            service_id: service_id.into(),
            identity,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_id: DEFAULT_SERVICE_ID.to_owned(),
            identity: LocalIdentity::generate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_username_shape() {
        for _ in 0..50 {
            let id = LocalIdentity::generate();
            let name = id.username();
            let digits = name.strip_prefix("User-").expect("User- prefix");
            let n: u16 = digits.parse().unwrap();
            assert!((1000..=9999).contains(&n));
        }
    }

    #[test]
    fn endpoint_id_serializes_as_plain_string() {
        let id = EndpointId::new("A1B2");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"A1B2\"");
        assert_eq!(id.to_string(), "A1B2");
    }

    #[test]
    fn default_config_uses_default_service() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.service_id, DEFAULT_SERVICE_ID);
        assert!(cfg.identity.username().starts_with("User-"));
    }
}
