//! Configuration handling for vpnctl
//!
//! Two shapes live here: the TOML file the CLI reads (`Config`) and the JSON
//! tunnel profile the background service receives with a connect command
//! (`TunnelProfile`). The TOML sections convert into a profile so both paths
//! feed the same route resolution.

use crate::vpn::network::NetworkSpec;
use crate::vpn::routing::SplitTunnelPolicy;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const CONFIG_FILE_NAME: &str = "vpnctl.toml";
const DEFAULT_MTU: u32 = 1280;
const MIN_MTU: u32 = 576;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Failed to parse tunnel profile: {0}")]
    ProfileError(#[from] serde_json::Error),
    #[error("Invalid network specification: {0}")]
    InvalidNetwork(String),
    #[error("Invalid split tunnel type: {0}")]
    InvalidSplitTunnelType(i64),
    #[error("Split tunnel mode {0} requires a site list")]
    MissingSites(&'static str),
    #[error("Invalid proxy address: {0}")]
    InvalidProxy(String),
    #[error("Invalid MTU: {0}")]
    InvalidMtu(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub split_tunnel: SplitTunnelSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub capabilities: CapabilityOverrides,
}

/// Static interface settings, `[tunnel]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSection {
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<NetworkSpec>,
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    #[serde(default)]
    pub search_domain: Option<String>,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default = "default_allowed_routes")]
    pub allowed_routes: Vec<NetworkSpec>,
    #[serde(default)]
    pub excluded_applications: Vec<String>,
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default = "default_true")]
    pub allow_all_families: bool,
    #[serde(default)]
    pub blocking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitTunnelMode {
    #[default]
    Disabled,
    Include,
    Exclude,
}

impl SplitTunnelMode {
    /// Numeric code used by the tunnel profile wire format
    pub fn code(self) -> i64 {
        match self {
            SplitTunnelMode::Disabled => 0,
            SplitTunnelMode::Include => 1,
            SplitTunnelMode::Exclude => 2,
        }
    }
}

/// `[split_tunnel]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SplitTunnelSection {
    #[serde(default)]
    pub mode: SplitTunnelMode,
    #[serde(default)]
    pub sites: Vec<String>,
}

/// `[session]`, timing and labels for the session coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_timeout_ms")]
    pub bind_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_label")]
    pub default_label: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            bind_timeout_ms: default_timeout_ms(),
            stop_timeout_ms: default_timeout_ms(),
            default_label: default_label(),
        }
    }
}

impl SessionSection {
    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// `[capabilities]`, optional overrides for the detected platform capabilities
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CapabilityOverrides {
    pub exclude_route: Option<bool>,
    pub http_proxy: Option<bool>,
    pub metered_flag: Option<bool>,
    pub dns_requires_route: Option<bool>,
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

fn default_allowed_routes() -> Vec<NetworkSpec> {
    vec![NetworkSpec::default_v4(), NetworkSpec::default_v6()]
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_label() -> String {
    "vpnctl".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunnel: TunnelSection {
                name: "vpnctl".to_string(),
                addresses: vec![NetworkSpec::host(IpAddr::from([10, 8, 0, 2]))],
                dns_servers: vec![IpAddr::from([1, 1, 1, 1]), IpAddr::from([1, 0, 0, 1])],
                search_domain: None,
                mtu: DEFAULT_MTU,
                allowed_routes: default_allowed_routes(),
                excluded_applications: Vec::new(),
                http_proxy: None,
                allow_all_families: true,
                blocking: false,
            },
            split_tunnel: SplitTunnelSection::default(),
            session: SessionSection::default(),
            capabilities: CapabilityOverrides::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load config from an explicit path or the default locations
    ///
    /// Order: `explicit`, `./vpnctl.toml`, `~/.vpnctl/config.toml`, defaults.
    pub fn find(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let local_config = PathBuf::from(CONFIG_FILE_NAME);
        if local_config.exists() {
            return Self::load(&local_config);
        }

        if let Some(home) = dirs::home_dir() {
            let home_config = home.join(".vpnctl").join("config.toml");
            if home_config.exists() {
                return Self::load(&home_config);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Default file name written by `vpnctl init`
    pub fn default_path() -> PathBuf {
        PathBuf::from(CONFIG_FILE_NAME)
    }

    /// The tunnel profile the service would receive for this config
    pub fn profile(&self) -> TunnelProfile {
        let tunnel = &self.tunnel;
        let split = &self.split_tunnel;
        TunnelProfile {
            name: tunnel.name.clone(),
            addresses: tunnel.addresses.clone(),
            dns_servers: tunnel.dns_servers.clone(),
            search_domain: tunnel.search_domain.clone(),
            mtu: tunnel.mtu,
            allowed_routes: tunnel.allowed_routes.clone(),
            excluded_applications: tunnel.excluded_applications.clone(),
            http_proxy: tunnel.http_proxy.clone(),
            allow_all_families: tunnel.allow_all_families,
            blocking: tunnel.blocking,
            split_tunnel_type: split.mode.code(),
            split_tunnel_sites: match split.mode {
                SplitTunnelMode::Disabled => None,
                _ => Some(split.sites.clone()),
            },
        }
    }
}

/// Tunnel profile as carried by a connect command (JSON)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelProfile {
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<NetworkSpec>,
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    #[serde(default)]
    pub search_domain: Option<String>,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default = "default_allowed_routes")]
    pub allowed_routes: Vec<NetworkSpec>,
    #[serde(default)]
    pub excluded_applications: Vec<String>,
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default = "default_true")]
    pub allow_all_families: bool,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default)]
    pub split_tunnel_type: i64,
    #[serde(default)]
    pub split_tunnel_sites: Option<Vec<String>>,
}

impl TunnelProfile {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Split-tunnel policy for this profile
    ///
    /// A malformed site or unknown type is an error; it never degrades to
    /// `Disabled`.
    pub fn policy(&self) -> Result<SplitTunnelPolicy, ConfigError> {
        SplitTunnelPolicy::from_code(self.split_tunnel_type, self.split_tunnel_sites.as_deref())
    }

    pub(crate) fn validated_mtu(&self) -> Result<u32, ConfigError> {
        if self.mtu < MIN_MTU {
            return Err(ConfigError::InvalidMtu(self.mtu));
        }
        Ok(self.mtu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidSplitTunnelType(7);
        assert_eq!(err.to_string(), "Invalid split tunnel type: 7");

        let err = ConfigError::MissingSites("exclude");
        assert_eq!(err.to_string(), "Split tunnel mode exclude requires a site list");

        let err = ConfigError::InvalidNetwork("10.0.0.0/33".to_string());
        assert!(err.to_string().contains("10.0.0.0/33"));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.tunnel.mtu, 1280);
        assert_eq!(config.split_tunnel.mode, SplitTunnelMode::Disabled);
        assert_eq!(config.session.bind_timeout(), Duration::from_secs(1));
        assert_eq!(config.session.stop_timeout(), Duration::from_secs(1));
        assert_eq!(config.tunnel.allowed_routes.len(), 2);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vpnctl.toml");

        let mut config = Config::default();
        config.split_tunnel.mode = SplitTunnelMode::Exclude;
        config.split_tunnel.sites = vec!["10.0.0.0/8".to_string()];
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.split_tunnel.mode, SplitTunnelMode::Exclude);
        assert_eq!(loaded.split_tunnel.sites, vec!["10.0.0.0/8".to_string()]);
        assert_eq!(loaded.tunnel.dns_servers, config.tunnel.dns_servers);
    }

    #[test]
    fn test_load_minimal_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("minimal.toml");
        std::fs::write(
            &path,
            "[tunnel]\nname = \"office\"\naddresses = [\"10.8.0.2/32\"]\n\n\
             [split_tunnel]\nmode = \"include\"\nsites = [\"192.168.10.0/24\"]\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.tunnel.name, "office");
        assert_eq!(config.tunnel.mtu, 1280);
        assert!(config.tunnel.allow_all_families);
        assert_eq!(config.session.default_label, "vpnctl");

        let profile = config.profile();
        assert_eq!(profile.split_tunnel_type, 1);
        assert_eq!(
            profile.split_tunnel_sites,
            Some(vec!["192.168.10.0/24".to_string()])
        );
    }

    #[test]
    fn test_find_explicit_missing_file_fails() {
        let result = Config::find(Some(Path::new("/nonexistent/vpnctl.toml")));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }

    #[test]
    fn test_profile_from_json_defaults() {
        let profile = TunnelProfile::from_json(r#"{"name": "home"}"#).unwrap();
        assert_eq!(profile.name, "home");
        assert_eq!(profile.mtu, 1280);
        assert_eq!(profile.split_tunnel_type, 0);
        assert!(profile.split_tunnel_sites.is_none());
        assert_eq!(profile.policy().unwrap(), SplitTunnelPolicy::Disabled);
    }

    #[test]
    fn test_profile_json_roundtrip() {
        let profile = Config::default().profile();
        let raw = profile.to_json().unwrap();
        assert!(raw.contains("splitTunnelType"));
        assert_eq!(TunnelProfile::from_json(&raw).unwrap(), profile);
    }

    #[test]
    fn test_profile_invalid_split_type_is_error() {
        let profile =
            TunnelProfile::from_json(r#"{"name": "x", "splitTunnelType": 5}"#).unwrap();
        assert!(matches!(
            profile.policy(),
            Err(ConfigError::InvalidSplitTunnelType(5))
        ));
    }

    #[test]
    fn test_profile_malformed_json() {
        let result = TunnelProfile::from_json("{not json");
        assert!(matches!(result, Err(ConfigError::ProfileError(_))));
    }

    #[test]
    fn test_profile_mtu_validation() {
        let mut profile = Config::default().profile();
        profile.mtu = 100;
        assert!(matches!(
            profile.validated_mtu(),
            Err(ConfigError::InvalidMtu(100))
        ));
    }
}
