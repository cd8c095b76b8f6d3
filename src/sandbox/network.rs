//! Network policy definitions for sandboxes.

use serde::{Deserialize, Serialize};

/// Network configuration for a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Master switch. When false the backend isolates the sandbox from the network.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Allow connections initiated from inside the sandbox.
    #[serde(default = "default_true")]
    pub allow_outbound: bool,

    /// Allow connections initiated from outside the sandbox.
    #[serde(default)]
    pub allow_inbound: bool,

    /// DNS servers handed to the backend.
    #[serde(default = "default_dns")]
    pub dns_servers: Vec<String>,

    /// Host-to-sandbox port forwards.
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_outbound: true,
            allow_inbound: false,
            dns_servers: default_dns(),
            port_mappings: Vec::new(),
        }
    }
}

impl NetworkConfig {
    /// A configuration with networking switched off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            allow_outbound: false,
            allow_inbound: false,
            ..Self::default()
        }
    }

    /// Returns true if outbound traffic is permitted.
    #[must_use]
    pub fn outbound_allowed(&self) -> bool {
        self.enabled && self.allow_outbound
    }

    /// Returns true if inbound traffic is permitted.
    #[must_use]
    pub fn inbound_allowed(&self) -> bool {
        self.enabled && self.allow_inbound
    }
}

/// One forwarded port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the sandbox.
    pub sandbox_port: u16,
    /// Transport protocol.
    #[serde(default)]
    pub protocol: Protocol,
}

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    #[default]
    Tcp,
    /// UDP
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_dns() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()]
}
