//! Core domain types

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generate a short lowercase alphanumeric suffix for ids
fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Wrap an existing id string
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random id
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "_{}"), random_suffix(10)))
            }

            /// Get the raw ID string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

opaque_id!(
    /// Identifier of a persisted tunnel record
    TunnelId,
    "tnl"
);
opaque_id!(
    /// Identifier of a connected Cloudflare account
    AccountId,
    "acct"
);
opaque_id!(
    /// Identifier of a running deployment
    DeploymentId,
    "dep"
);
opaque_id!(
    /// Identifier of a saved project snapshot
    ProjectId,
    "prj"
);
opaque_id!(
    /// Identifier of an interactive login attempt
    LoginSessionId,
    "login"
);

/// Kind of tunnel backing a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelType {
    /// Ephemeral quick tunnel with a randomly assigned hostname
    Free,
    /// Persistent tunnel bound to a DNS record
    Named,
}

/// Tunnel record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    #[default]
    Active,
}

/// How an account authenticates against Cloudflare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// Bearer API token used against the REST API
    Token,
    /// Origin certificate obtained through `cloudflared tunnel login`
    Cloudflared,
}

/// Account connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Pending,
    Connected,
    Error,
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountStatus::Pending => write!(f, "pending"),
            AccountStatus::Connected => write!(f, "connected"),
            AccountStatus::Error => write!(f, "error"),
        }
    }
}

/// Proxy scheme recorded on a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    #[default]
    Http,
    Https,
    Socks5,
}

/// How proxies are distributed across a batch of tunnels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyRotation {
    /// Tunnel `i` gets `proxies[i % len]`
    #[default]
    Cycle,
    /// Every tunnel gets the first proxy
    Sticky,
}

impl ProxyRotation {
    /// Pick the proxy for the tunnel at `index` within a batch
    pub fn pick<'a>(&self, proxies: &'a [String], index: usize) -> Option<&'a String> {
        if proxies.is_empty() {
            return None;
        }
        match self {
            ProxyRotation::Cycle => proxies.get(index % proxies.len()),
            ProxyRotation::Sticky => proxies.first(),
        }
    }
}

/// Runtime detected for a deployed bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeType {
    /// Script runtime started from a manifest-bearing bundle
    Script,
    /// Generic static/script web server serving the application root
    GenericWeb,
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeType::Script => write!(f, "script"),
            RuntimeType::GenericWeb => write!(f, "generic-web"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_carry_prefix() {
        let id = TunnelId::generate();
        assert!(id.as_str().starts_with("tnl_"));
        assert_eq!(id.as_str().len(), "tnl_".len() + 10);
        assert_ne!(TunnelId::generate(), TunnelId::generate());
        assert!(DeploymentId::generate().as_str().starts_with("dep_"));
    }

    #[test]
    fn test_proxy_rotation_cycles() {
        let proxies = vec!["p1".to_string(), "p2".to_string()];
        let picked: Vec<_> = (0..3)
            .map(|i| ProxyRotation::Cycle.pick(&proxies, i).cloned())
            .collect();
        assert_eq!(
            picked,
            vec![
                Some("p1".to_string()),
                Some("p2".to_string()),
                Some("p1".to_string())
            ]
        );
        assert_eq!(ProxyRotation::Sticky.pick(&proxies, 1), Some(&proxies[0]));
        assert_eq!(ProxyRotation::Cycle.pick(&[], 0), None);
    }

    #[test]
    fn test_runtime_type_serde_names() {
        let json = serde_json::to_string(&RuntimeType::GenericWeb).unwrap();
        assert_eq!(json, "\"generic-web\"");
        assert_eq!(format!("{}", AccountStatus::Connected), "connected");
    }
}
