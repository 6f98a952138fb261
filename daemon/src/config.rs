//! Daemon configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use sigbox_crypto::StreamKey;
use sigbox_transport::{BackendPoolConfig, Endpoint, parse_port_range};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    /// Listener and session settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Keys and certificates of the default box
    #[serde(default)]
    pub agent: AgentConfig,

    /// Proxy mode settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl DaemonConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let config: DaemonConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` if it exists; defaults otherwise.
    ///
    /// With `required` a missing file is an error.
    pub async fn load_or_default(path: impl AsRef<Path>, required: bool) -> Result<Self> {
        let path = path.as_ref();
        if !required && !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Self::default());
        }
        Self::load(path).await
    }

    /// Merge another config into this one
    ///
    /// Rules:
    /// - Scalar values: overwrite if the new value differs from default
    /// - Option values: overwrite if Some
    /// - Vec values: append entries not already present
    pub fn merge(&mut self, other: DaemonConfig) {
        // Server config
        if other.server.bind.is_some() {
            self.server.bind = other.server.bind;
        }
        if other.server.tcp {
            self.server.tcp = true;
        }
        if other.server.key.is_some() {
            self.server.key = other.server.key;
        }
        if other.server.keep_alive != default_keep_alive() {
            self.server.keep_alive = other.server.keep_alive;
        }
        if other.server.sweep_interval != default_sweep_interval() {
            self.server.sweep_interval = other.server.sweep_interval;
        }
        if other.server.ca.is_some() {
            self.server.ca = other.server.ca;
        }
        if other.server.max_connections != default_max_connections() {
            self.server.max_connections = other.server.max_connections;
        }
        if other.server.silent {
            self.server.silent = true;
        }

        // Default box: merge by path
        for key in other.agent.keys {
            if let Some(existing) = self.agent.keys.iter_mut().find(|k| k.path == key.path) {
                existing.password = key.password;
            } else {
                self.agent.keys.push(key);
            }
        }
        for cert in other.agent.certs {
            if !self.agent.certs.contains(&cert) {
                self.agent.certs.push(cert);
            }
        }

        // Proxy
        if other.proxy.bind.is_some() {
            self.proxy.bind = other.proxy.bind;
        }
        if other.proxy.backend_host != default_backend_host() {
            self.proxy.backend_host = other.proxy.backend_host;
        }
        if other.proxy.ports.is_some() {
            self.proxy.ports = other.proxy.ports;
        }
        for backend in other.proxy.backends {
            if !self.proxy.backends.contains(&backend) {
                self.proxy.backends.push(backend);
            }
        }
        if other.proxy.backend_key.is_some() {
            self.proxy.backend_key = other.proxy.backend_key;
        }
        if other.proxy.max_attempts != default_max_attempts() {
            self.proxy.max_attempts = other.proxy.max_attempts;
        }
        if other.proxy.backoff_base_ms != default_backoff_base_ms() {
            self.proxy.backoff_base_ms = other.proxy.backoff_base_ms;
        }
        if other.proxy.backoff_max_ms != default_backoff_max_ms() {
            self.proxy.backoff_max_ms = other.proxy.backoff_max_ms;
        }

        // Monitoring
        if other.monitoring.prometheus_bind != default_prometheus_bind() {
            self.monitoring.prometheus_bind = other.monitoring.prometheus_bind;
        }
        if other.monitoring.prometheus_enabled {
            self.monitoring.prometheus_enabled = true;
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Unix socket path, or `host:port` with `tcp`.
    /// Unset means `$HOME/.dstu-agent.sock`.
    #[serde(default)]
    pub bind: Option<String>,

    /// Listen on TCP instead of a Unix socket
    #[serde(default)]
    pub tcp: bool,

    /// Hex key authenticating client streams
    #[serde(default)]
    pub key: Option<String>,

    /// Idle seconds before a session is swept
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,

    /// Seconds between sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,

    /// CA bundle shared by all sessions
    #[serde(default)]
    pub ca: Option<PathBuf>,

    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Log warnings only
    #[serde(default)]
    pub silent: bool,
}

fn default_keep_alive() -> u64 {
    900 // 15 minutes
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_max_connections() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: None,
            tcp: false,
            key: None,
            keep_alive: default_keep_alive(),
            sweep_interval: default_sweep_interval(),
            ca: None,
            max_connections: default_max_connections(),
            silent: false,
        }
    }
}

impl ServerConfig {
    pub fn endpoint(&self) -> Result<Endpoint> {
        Endpoint::from_bind(self.bind.as_deref(), self.tcp).context("resolving listen endpoint")
    }

    pub fn stream_key(&self) -> Result<Option<StreamKey>> {
        parse_key(self.key.as_deref())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive)
    }

    pub fn sweep_every(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }
}

fn parse_key(hex: Option<&str>) -> Result<Option<StreamKey>> {
    hex.filter(|k| !k.is_empty())
        .map(|k| StreamKey::from_hex(k).context("invalid stream key"))
        .transpose()
}

/// Key file of the default box
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeyFileConfig {
    pub path: PathBuf,

    #[serde(default)]
    pub password: Option<String>,
}

/// Default box, loaded at startup
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub keys: Vec<KeyFileConfig>,

    #[serde(default)]
    pub certs: Vec<PathBuf>,
}

impl AgentConfig {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.certs.is_empty()
    }
}

/// Proxy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// `host:port` the proxy listens on
    #[serde(default)]
    pub bind: Option<String>,

    /// Host of the port-range backends
    #[serde(default = "default_backend_host")]
    pub backend_host: String,

    /// Backend ports, `low:high`
    #[serde(default)]
    pub ports: Option<String>,

    /// Additional backends (`host:port`, `tcp://...`, `unix://...`)
    #[serde(default)]
    pub backends: Vec<String>,

    /// Hex key shared with the backends; the client key when unset
    #[serde(default)]
    pub backend_key: Option<String>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_attempts() -> usize {
    5
}

fn default_backoff_base_ms() -> u64 {
    20
}

fn default_backoff_max_ms() -> u64 {
    1000
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: None,
            backend_host: default_backend_host(),
            ports: None,
            backends: Vec::new(),
            backend_key: None,
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl ProxyConfig {
    /// Port-range members first, then explicit backends
    pub fn members(&self) -> Result<Vec<Endpoint>> {
        let mut members = Vec::new();
        if let Some(ports) = self.ports.as_deref() {
            for port in parse_port_range(ports)? {
                members.push(Endpoint::Tcp(format!("{}:{}", self.backend_host, port)));
            }
        }
        for backend in &self.backends {
            let endpoint = if backend.contains("://") {
                Endpoint::from_uri(backend)
            } else {
                Endpoint::Tcp(backend.clone())
            };
            members.push(endpoint);
        }
        Ok(members)
    }

    pub fn pool_config(&self, client_key: Option<&StreamKey>) -> Result<BackendPoolConfig> {
        let key = match parse_key(self.backend_key.as_deref())? {
            Some(key) => Some(key),
            None => client_key.cloned(),
        };
        Ok(BackendPoolConfig {
            members: self.members()?,
            key,
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        })
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Prometheus metrics bind address
    #[serde(default = "default_prometheus_bind")]
    pub prometheus_bind: SocketAddr,

    /// Enable Prometheus
    #[serde(default)]
    pub prometheus_enabled: bool,
}

fn default_prometheus_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_bind: default_prometheus_bind(),
            prometheus_enabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.server.keep_alive, 900);
        assert_eq!(config.server.sweep_interval, 5);
        assert!(!config.server.tcp);
        assert!(config.agent.is_empty());
        assert_eq!(config.proxy.max_attempts, 5);
        assert!(!config.monitoring.prometheus_enabled);
    }

    #[test]
    fn test_parse_toml() {
        let config: DaemonConfig = toml::from_str(
            r#"
[server]
bind = "127.0.0.1:7000"
tcp = true
key = "00112233"
keep_alive = 60

[[agent.keys]]
path = "/etc/sigbox/key.dat"
password = "secret"

[proxy]
ports = "9000:9001"
backends = ["unix:///run/a.sock", "10.0.0.5:9000"]
"#,
        )
        .unwrap();

        assert_eq!(config.server.endpoint().unwrap(), Endpoint::Tcp("127.0.0.1:7000".into()));
        assert_eq!(config.server.idle_timeout(), Duration::from_secs(60));
        assert!(config.server.stream_key().unwrap().is_some());
        assert_eq!(config.agent.keys[0].password.as_deref(), Some("secret"));

        let members = config.proxy.members().unwrap();
        assert_eq!(
            members,
            vec![
                Endpoint::Tcp("127.0.0.1:9000".into()),
                Endpoint::Tcp("127.0.0.1:9001".into()),
                Endpoint::Unix("/run/a.sock".into()),
                Endpoint::Tcp("10.0.0.5:9000".into()),
            ]
        );
    }

    #[test]
    fn test_bad_key_rejected() {
        let server = ServerConfig {
            key: Some("not hex".into()),
            ..Default::default()
        };
        assert!(server.stream_key().is_err());
    }

    #[test]
    fn test_backend_key_falls_back_to_client_key() {
        let client_key = StreamKey::new(vec![1u8; 32]).unwrap();
        let proxy = ProxyConfig {
            ports: Some("9000:9000".into()),
            ..Default::default()
        };
        let pool = proxy.pool_config(Some(&client_key)).unwrap();
        assert_eq!(pool.key, Some(client_key));

        let proxy = ProxyConfig {
            backend_key: Some("ff".repeat(32)),
            ..proxy
        };
        let pool = proxy.pool_config(None).unwrap();
        assert_eq!(pool.key.unwrap().as_bytes(), &[0xffu8; 32][..]);
    }

    #[test]
    fn test_merge_scalars() {
        let mut config = DaemonConfig::default();
        let mut other = DaemonConfig::default();
        other.server.keep_alive = 30;
        other.server.tcp = true;
        other.proxy.max_attempts = 2;

        config.merge(other);

        assert_eq!(config.server.keep_alive, 30);
        assert!(config.server.tcp);
        assert_eq!(config.proxy.max_attempts, 2);
    }

    #[test]
    fn test_merge_options() {
        let mut config = DaemonConfig::default();
        config.server.bind = Some("/tmp/a.sock".into());

        let mut other = DaemonConfig::default();
        other.server.key = Some("abcd".into());
        config.merge(other);

        assert_eq!(config.server.bind.as_deref(), Some("/tmp/a.sock"));
        assert_eq!(config.server.key.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_merge_agent_keys() {
        let mut config = DaemonConfig::default();
        config.agent.keys.push(KeyFileConfig {
            path: "k1".into(),
            password: None,
        });

        let mut other = DaemonConfig::default();
        // Update existing
        other.agent.keys.push(KeyFileConfig {
            path: "k1".into(),
            password: Some("pw".into()),
        });
        // Add new
        other.agent.keys.push(KeyFileConfig {
            path: "k2".into(),
            password: None,
        });

        config.merge(other);

        assert_eq!(config.agent.keys.len(), 2);
        let k1 = config.agent.keys.iter().find(|k| k.path == Path::new("k1")).unwrap();
        assert_eq!(k1.password.as_deref(), Some("pw"));
    }

    #[tokio::test]
    async fn test_missing_optional_file() {
        let config = DaemonConfig::load_or_default("/nonexistent/sigboxd.toml", false)
            .await
            .unwrap();
        assert_eq!(config.server.keep_alive, 900);
        assert!(
            DaemonConfig::load_or_default("/nonexistent/sigboxd.toml", true)
                .await
                .is_err()
        );
    }
}
