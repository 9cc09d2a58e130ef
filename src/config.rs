//! Configuration management for prefix-broker.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/prefix-broker/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Allocatable units handed out to routers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolsConfig {
    /// IPv4 client prefixes. Each prefix is one unit; its length is the size class.
    #[serde(with = "net_list_serde")]
    pub ipv4_prefixes: Vec<Ipv4Net>,

    /// IPv6 client prefixes, handed out only when a constituency is given.
    #[serde(with = "net_list_serde")]
    pub ipv6_prefixes: Vec<Ipv6Net>,

    /// Single IPv4 addresses used on the mesh interfaces.
    pub mesh4: Vec<Ipv4Addr>,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        let ipv4 = [
            "10.36.5.96/27",
            "10.230.240.192/28",
            "10.31.110.64/28",
            "10.36.236.128/27",
        ];
        let ipv6 = [
            "2001:bf7:760:400::/56",
            "2001:bf7:800:800::/56",
            "2001:bf7:820:1900::/56",
        ];
        let mesh4 = [
            "10.31.29.129",
            "10.31.29.130",
            "10.31.29.140",
            "10.31.43.188",
            "10.31.43.189",
            "10.31.43.190",
            "10.31.30.117",
            "10.31.30.118",
            "10.31.30.119",
        ];

        Self {
            ipv4_prefixes: ipv4.iter().map(|p| p.parse().unwrap()).collect(),
            ipv6_prefixes: ipv6.iter().map(|p| p.parse().unwrap()).collect(),
            mesh4: mesh4.iter().map(|a| a.parse().unwrap()).collect(),
        }
    }
}

impl PoolsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mesh4.is_empty() {
            return Err(ConfigError::ValidationError(
                "pools.mesh4 must contain at least one address".to_string(),
            ));
        }

        for (i, a) in self.ipv4_prefixes.iter().enumerate() {
            if a.trunc() != *a {
                return Err(ConfigError::ValidationError(format!(
                    "pools.ipv4_prefixes: {} has host bits set",
                    a
                )));
            }
            if a.prefix_len() < 23 {
                return Err(ConfigError::ValidationError(format!(
                    "pools.ipv4_prefixes: {} is larger than /23",
                    a
                )));
            }
            for b in &self.ipv4_prefixes[i + 1..] {
                if a.contains(b) || b.contains(a) {
                    return Err(ConfigError::ValidationError(format!(
                        "pools.ipv4_prefixes: {} overlaps {}",
                        a, b
                    )));
                }
            }
        }

        for (i, a) in self.ipv6_prefixes.iter().enumerate() {
            if a.trunc() != *a {
                return Err(ConfigError::ValidationError(format!(
                    "pools.ipv6_prefixes: {} has host bits set",
                    a
                )));
            }
            for b in &self.ipv6_prefixes[i + 1..] {
                if a.contains(b) || b.contains(a) {
                    return Err(ConfigError::ValidationError(format!(
                        "pools.ipv6_prefixes: {} overlaps {}",
                        a, b
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        for addr in &self.mesh4 {
            if !seen.insert(*addr) {
                return Err(ConfigError::ValidationError(format!(
                    "pools.mesh4: {} is listed twice",
                    addr
                )));
            }
            if let Some(prefix) = self.ipv4_prefixes.iter().find(|p| p.contains(addr)) {
                return Err(ConfigError::ValidationError(format!(
                    "pools.mesh4: {} lies inside client prefix {}",
                    addr, prefix
                )));
            }
        }

        Ok(())
    }
}

/// Longest confirmation window accepted (30 days).
pub const MAX_RESERVATION_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Reservation policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Mesh addresses reserved per router.
    pub mesh_count: usize,

    /// Seconds a pending reservation waits for its confirmation.
    pub reservation_ttl_secs: u64,

    /// Seconds between expiry sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            mesh_count: 3,
            reservation_ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl AllocationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mesh_count == 0 {
            return Err(ConfigError::ValidationError(
                "mesh_count must be at least 1".to_string(),
            ));
        }
        if !(60..=MAX_RESERVATION_TTL_SECS).contains(&self.reservation_ttl_secs) {
            return Err(ConfigError::ValidationError(format!(
                "reservation_ttl_secs must be between 60 and {}",
                MAX_RESERVATION_TTL_SECS
            )));
        }
        if self.sweep_interval_secs == 0 || self.sweep_interval_secs > 3600 {
            return Err(ConfigError::ValidationError(
                "sweep_interval_secs must be between 1 and 3600".to_string(),
            ));
        }
        Ok(())
    }
}

/// Request gating.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Question shown to clients.
    pub captcha_question: String,

    /// Expected answer, compared exactly.
    pub captcha_answer: String,

    /// Resolve the email domain before accepting a request.
    pub check_email_deliverability: bool,

    /// Upper bound on contact addresses per request.
    pub max_emails: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            captcha_question: "Was ist die Hauptstadt von Berlin?".to_string(),
            captcha_answer: "Berlin".to_string(),
            check_email_deliverability: false,
            max_emails: 5,
        }
    }
}

impl ValidationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.captcha_answer.is_empty() {
            return Err(ConfigError::ValidationError(
                "captcha_answer must not be empty".to_string(),
            ));
        }
        if self.max_emails == 0 {
            return Err(ConfigError::ValidationError(
                "max_emails must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// How confirmation tokens reach the contact addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyMethod {
    /// Write the confirmation link to the log (development only).
    Log,
    /// Hand the message to a local sendmail binary.
    Sendmail,
}

/// Notification configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub method: NotifyMethod,

    /// Path to a sendmail-compatible binary (invoked with `-t`).
    pub sendmail_path: PathBuf,

    /// Sender address for confirmation mails.
    pub from: String,

    /// Public URL of the confirm endpoint; session and token are appended as query.
    pub confirm_url_base: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            method: NotifyMethod::Log,
            sendmail_path: PathBuf::from("/usr/sbin/sendmail"),
            from: "prefix-broker@localhost".to_string(),
            confirm_url_base: "http://127.0.0.1:8080/api/v1/confirm".to_string(),
        }
    }
}

impl NotifyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.from.contains(['\r', '\n']) {
            return Err(ConfigError::ValidationError(
                "notify.from must be a single line".to_string(),
            ));
        }
        if !self.confirm_url_base.starts_with("http://")
            && !self.confirm_url_base.starts_with("https://")
        {
            return Err(ConfigError::ValidationError(
                "notify.confirm_url_base must be an http(s) URL".to_string(),
            ));
        }
        Ok(())
    }
}

/// API server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address.
    pub listen_host: String,

    /// Listen port.
    pub listen_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8080,
        }
    }
}

impl ApiConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.listen_host, self.listen_port)
            .parse()
            .map_err(|_| ConfigError::ValidationError("Invalid listen address".to_string()))
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to SQLite database.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/prefix-broker/broker.db"),
        }
    }
}

/// Main configuration container.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub pools: PoolsConfig,
    pub allocation: AllocationConfig,
    pub validation: ValidationConfig,
    pub notify: NotifyConfig,
    pub api: ApiConfig,
    pub database: DatabaseConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pools.validate()?;
        self.allocation.validate()?;
        self.validation.validate()?;
        self.notify.validate()?;
        self.api.socket_addr()?;
        Ok(())
    }
}

/// Load configuration from the default or specified path.
pub fn load_config(path: Option<&std::path::Path>) -> Result<Config, ConfigError> {
    let config_path = path.unwrap_or(std::path::Path::new(DEFAULT_CONFIG_PATH));
    Config::from_file(config_path)
}

/// Serde for lists of networks written as CIDR strings.
mod net_list_serde {
    use std::fmt::Display;
    use std::str::FromStr;

    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(nets: &[T], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Display,
    {
        serializer.collect_seq(nets.iter().map(|n| n.to_string()))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: FromStr,
        T::Err: Display,
    {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| s.trim().parse().map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.notify.method, NotifyMethod::Log);
        assert_eq!(config.allocation.mesh_count, 3);
        assert_eq!(config.pools.ipv4_prefixes.len(), 4);
        assert_eq!(config.pools.mesh4.len(), 9);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[pools]
ipv4_prefixes = ["10.0.0.0/27", "10.0.0.32/28"]
ipv6_prefixes = ["2001:db8:100::/56"]
mesh4 = ["10.0.1.1", "10.0.1.2"]

[allocation]
mesh_count = 2
reservation_ttl_secs = 3600

[notify]
method = "sendmail"
from = "noreply@example.org"

[api]
listen_port = 9090
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.pools.ipv4_prefixes[1].prefix_len(), 28);
        assert_eq!(config.pools.ipv6_prefixes.len(), 1);
        assert_eq!(config.allocation.mesh_count, 2);
        assert_eq!(config.allocation.sweep_interval_secs, 60);
        assert_eq!(config.notify.method, NotifyMethod::Sendmail);
        assert_eq!(config.api.listen_port, 9090);
        assert_eq!(config.validation.captcha_answer, "Berlin");
    }

    #[test]
    fn test_rejects_overlapping_prefixes() {
        let pools = PoolsConfig {
            ipv4_prefixes: vec!["10.0.0.0/24".parse().unwrap(), "10.0.0.64/27".parse().unwrap()],
            ipv6_prefixes: vec![],
            mesh4: vec!["10.0.1.1".parse().unwrap()],
        };
        assert!(matches!(pools.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_rejects_mesh_inside_prefix() {
        let pools = PoolsConfig {
            ipv4_prefixes: vec!["10.0.0.0/27".parse().unwrap()],
            ipv6_prefixes: vec![],
            mesh4: vec!["10.0.0.5".parse().unwrap()],
        };
        assert!(pools.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_mesh_count() {
        let allocation = AllocationConfig {
            mesh_count: 0,
            ..AllocationConfig::default()
        };
        assert!(allocation.validate().is_err());
    }

    #[test]
    fn test_reservation_ttl_bounds() {
        let ttl = |secs| AllocationConfig {
            reservation_ttl_secs: secs,
            ..AllocationConfig::default()
        };
        assert!(ttl(59).validate().is_err());
        assert!(ttl(60).validate().is_ok());
        assert!(ttl(MAX_RESERVATION_TTL_SECS).validate().is_ok());
        assert!(ttl(MAX_RESERVATION_TTL_SECS + 1).validate().is_err());
        assert!(ttl(10_000_000_000_000_000).validate().is_err());
    }

    #[test]
    fn test_rejects_bad_cidr() {
        let toml = r#"
[pools]
ipv4_prefixes = ["10.0.0.0/33"]
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }
}
