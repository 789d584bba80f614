//! Configuration data structures for droplet-proxy.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files using the
//! kebab-case keys the proxy has always used (`bind`, `tls-cert-file`, `[backend]`, ...).
//! Every section carries defaults so that a minimal config only names what differs.
use std::{
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Serde adapter for human readable durations such as `"250ms"` or `"2s"`.
pub mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(D::Error::custom)
    }
}

/// Load balancing algorithm selected by `[loadbalancing] type`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerType {
    /// Cycle through healthy backends in inventory order
    #[default]
    RoundRobin,
    /// Pick the healthy backend with the fewest in-flight requests
    LeastConn,
    /// Pick the healthy backend with the lowest rolling latency
    LowestLatency,
}

impl std::fmt::Display for LoadBalancerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LoadBalancerType::RoundRobin => "roundrobin",
            LoadBalancerType::LeastConn => "leastconn",
            LoadBalancerType::LowestLatency => "lowestlatency",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct LoadBalancingConfig {
    #[serde(rename = "type")]
    pub kind: LoadBalancerType,
}

/// Per-backend transport and monitoring settings (`[backend]`).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct BackendConfig {
    /// Timeout for establishing a connection to a backend
    #[serde(with = "duration_serde")]
    pub dial_timeout: Duration,
    /// Window, in seconds, of the rolling latency average
    pub latency_average_seconds: u64,
    /// Timeout of a single health probe. Must not exceed one second.
    #[serde(with = "duration_serde")]
    pub health_check_timeout: Duration,
    /// Port new backends serve on; used to derive `server-host`
    pub new_host_port: u16,
    /// Path appended to `server-host` to form a new backend's health URL
    pub new_host_health_path: String,
    /// Probe new backends over https instead of http
    pub new_host_health_https: bool,
    /// Skip monitoring entirely; backends are then always considered healthy
    pub disable_health_check: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(2),
            latency_average_seconds: 30,
            health_check_timeout: Duration::from_millis(250),
            new_host_port: 80,
            new_host_health_path: "/".to_string(),
            new_host_health_https: false,
            disable_health_check: false,
        }
    }
}

/// Main server configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Address to listen on. `:8080` is accepted as shorthand for `0.0.0.0:8080`.
    pub bind: String,
    pub https: bool,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    /// Append the client address to `X-Forwarded-For`
    pub add_x_forwarded_for: bool,
    /// Reload the configuration and inventory files when they change on disk
    pub watch_config: bool,
    pub loadbalancing: LoadBalancingConfig,
    pub inventory_file: PathBuf,
    pub backend: BackendConfig,
    /// Upper bound for each bounded wait during shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: ":80".to_string(),
            https: false,
            tls_cert_file: None,
            tls_key_file: None,
            add_x_forwarded_for: true,
            watch_config: true,
            loadbalancing: LoadBalancingConfig::default(),
            inventory_file: PathBuf::from("inventory.toml"),
            backend: BackendConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Resolve `bind` into a socket address.
    pub fn bind_addr(&self) -> std::io::Result<SocketAddr> {
        let bind = self.bind.trim();
        let normalized = if bind.starts_with(':') {
            format!("0.0.0.0{bind}")
        } else {
            bind.to_string()
        };
        normalized.to_socket_addrs()?.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("'{bind}' did not resolve to an address"),
            )
        })
    }

    /// Name of the first field that may not change while the server runs, if any differs.
    pub fn immutable_change(&self, next: &ServerConfig) -> Option<&'static str> {
        if self.watch_config != next.watch_config {
            return Some("watch-config");
        }
        if self.bind != next.bind {
            return Some("bind");
        }
        if self.https != next.https {
            return Some("https");
        }
        if self.tls_cert_file != next.tls_cert_file {
            return Some("tls-cert-file");
        }
        if self.tls_key_file != next.tls_key_file {
            return Some("tls-key-file");
        }
        None
    }

    /// Whether moving to `next` requires a freshly built inventory and load balancer.
    pub fn requires_new_backends(&self, next: &ServerConfig) -> bool {
        self.inventory_file != next.inventory_file
            || self.loadbalancing != next.loadbalancing
            || self.backend != next.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_shorthand_listens_on_all_interfaces() {
        let config = ServerConfig {
            bind: ":8080".to_string(),
            ..ServerConfig::default()
        };
        assert_eq!(
            config.bind_addr().unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn immutable_change_names_the_field() {
        let current = ServerConfig::default();
        let mut next = current.clone();
        assert_eq!(current.immutable_change(&next), None);

        next.add_x_forwarded_for = false;
        assert_eq!(current.immutable_change(&next), None);

        next.bind = ":9090".to_string();
        assert_eq!(current.immutable_change(&next), Some("bind"));

        let mut next = current.clone();
        next.tls_key_file = Some(PathBuf::from("key.pem"));
        assert_eq!(current.immutable_change(&next), Some("tls-key-file"));
    }

    #[test]
    fn backend_changes_require_rebuild() {
        let current = ServerConfig::default();
        let mut next = current.clone();
        assert!(!current.requires_new_backends(&next));

        next.loadbalancing.kind = LoadBalancerType::LeastConn;
        assert!(current.requires_new_backends(&next));
    }
}
