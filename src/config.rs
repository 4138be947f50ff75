use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level daemon configuration, loaded from YAML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fallback IPMI credentials for servers that carry none.
    pub ipmi: IpmiConfig,
    /// Optional static server seeds joined with discovered inventory.
    pub servers: Vec<ServerEntry>,
    /// Inventory source settings.
    pub discovery: DiscoveryConfig,
    /// Boot detection tuning.
    pub reboot_detection: RebootDetectionConfig,
    /// Console log storage settings.
    pub logs: LogsConfig,
    /// HTTP surface settings (consumed outside this crate's core).
    pub server: ServerConfig,
}

/// Fallback IPMI credentials.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IpmiConfig {
    /// Username used when a server has none of its own.
    pub username: String,
    /// Password used when a server has none of its own.
    pub password: String,
}

/// A statically configured server.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerEntry {
    /// Logical name.
    pub name: String,
    /// BMC host.
    pub host: String,
    /// Known MAC addresses for this server.
    pub macs: Vec<String>,
}

/// Inventory source settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Base URL of the inventory API; empty disables fetching.
    pub bmh_url: String,
    /// Namespace scope filter; empty disables scoping.
    pub namespace: String,
}

/// Boot detection tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RebootDetectionConfig {
    /// Extra patterns added to the BIOS boot pattern set.
    pub sol_patterns: Vec<String>,
}

impl Default for RebootDetectionConfig {
    fn default() -> Self {
        Self {
            sol_patterns: vec!["POST".into(), "BIOS".into(), "Booting".into()],
        }
    }
}

/// Console log storage settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// Base directory for per-server log directories.
    pub path: String,
    /// Files older than this many days are pruned; 0 disables.
    pub retention_days: u32,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            path: "/data/logs".into(),
            retention_days: 30,
        }
    }
}

/// HTTP surface settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening port for the HTTP surface.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Config {
    /// Load configuration from a YAML file, applying defaults for anything
    /// the file omits.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&data).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.logs.path, "/data/logs");
        assert_eq!(cfg.logs.retention_days, 30);
        assert_eq!(cfg.server.port, 8080);
        assert!(cfg.discovery.bmh_url.is_empty());
        assert_eq!(
            cfg.reboot_detection.sol_patterns,
            ["POST", "BIOS", "Booting"]
        );
    }

    #[test]
    fn partial_yaml_keeps_defaults_elsewhere() {
        let yaml = r#"
ipmi:
  username: ADMIN
  password: secret
discovery:
  bmh_url: http://inventory:8082
  namespace: g11
servers:
  - name: srvA
    host: 10.0.0.10
    macs: ["aa:bb:cc:dd:ee:ff"]
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.ipmi.username, "ADMIN");
        assert_eq!(cfg.discovery.namespace, "g11");
        assert_eq!(cfg.servers.len(), 1);
        assert_eq!(cfg.servers[0].macs.len(), 1);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.logs.retention_days, 30);
        assert_eq!(cfg.server.port, 8080);
    }
}
