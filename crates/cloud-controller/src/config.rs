//! `cloudd`'s TOML configuration: a `[server]` global table plus
//! validation, loaded once at startup and handed to every component
//! that needs a piece of it.

use std::path::Path;

use anyhow::{Context, Result};
use cloud_directory::dn::DirectoryConfig;
use cloud_net::network::NetworkMode;
use cloud_quota::QuotaDefaults;
use serde::Deserialize;

/// Flat reserved-key configuration: `network_manager`, `compute_driver`,
/// `volume_driver`, `image_service`, `use_ipv6`, `vlan_start`,
/// `num_networks`, `floating_range`, `iscsi_num_targets`,
/// `zone_db_check_interval`, `zone_failures_to_offline`, `quota_*`.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub directory: DirectorySection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub zones: ZoneSection,
    #[serde(default)]
    pub quota: QuotaDefaults,
}

/// Which `cloud_directory::Directory` backend `cloudd` constructs.
/// Sealed choice, not a runtime-loaded driver name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryDriver {
    /// In-memory backend; every `cloudd` invocation starts from an
    /// empty directory. Intended for local development and the
    /// in-process integration tests.
    Fake,
    /// Real LDAP backend (`cloud_directory::ldap::LdapDirectory`).
    Ldap,
}

impl Default for DirectoryDriver {
    fn default() -> Self {
        DirectoryDriver::Fake
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectorySection {
    #[serde(default)]
    pub driver: DirectoryDriver,
    #[serde(default)]
    pub ldap: DirectoryConfig,
}

impl Default for DirectorySection {
    fn default() -> Self {
        DirectorySection {
            driver: DirectoryDriver::default(),
            ldap: DirectoryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_state_path")]
    pub state_path: String,
    #[serde(default = "default_availability_zone")]
    pub availability_zone: String,
    #[serde(default = "default_quota_reservation_ttl")]
    pub quota_reservation_ttl_secs: u64,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_iscsi_num_targets")]
    pub iscsi_num_targets: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: default_listen(),
            state_path: default_state_path(),
            availability_zone: default_availability_zone(),
            quota_reservation_ttl_secs: default_quota_reservation_ttl(),
            rpc_timeout_secs: default_rpc_timeout(),
            iscsi_num_targets: default_iscsi_num_targets(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_network_mode")]
    pub mode: NetworkMode,
    #[serde(default = "default_bridge_name")]
    pub bridge_name: String,
    #[serde(default)]
    pub use_ipv6: bool,
    #[serde(default = "default_vlan_start")]
    pub vlan_start: u16,
    #[serde(default = "default_num_networks")]
    pub num_networks: u32,
}

impl Default for NetworkSection {
    fn default() -> Self {
        NetworkSection {
            mode: default_network_mode(),
            bridge_name: default_bridge_name(),
            use_ipv6: false,
            vlan_start: default_vlan_start(),
            num_networks: default_num_networks(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneSection {
    #[serde(default = "default_zone_check_interval")]
    pub db_check_interval_secs: u64,
    #[serde(default = "default_zone_failures_to_offline")]
    pub failures_to_offline: u32,
    #[serde(default = "default_zone_pool_width")]
    pub worker_pool_width: usize,
}

impl Default for ZoneSection {
    fn default() -> Self {
        ZoneSection {
            db_check_interval_secs: default_zone_check_interval(),
            failures_to_offline: default_zone_failures_to_offline(),
            worker_pool_width: default_zone_pool_width(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8773".to_string()
}
fn default_state_path() -> String {
    "cloud.db".to_string()
}
fn default_availability_zone() -> String {
    "nova".to_string()
}
fn default_quota_reservation_ttl() -> u64 {
    300
}
fn default_rpc_timeout() -> u64 {
    30
}
fn default_iscsi_num_targets() -> u32 {
    100
}
fn default_network_mode() -> NetworkMode {
    NetworkMode::FlatDhcp
}
fn default_bridge_name() -> String {
    "cloudbr0".to_string()
}
fn default_vlan_start() -> u16 {
    100
}
fn default_num_networks() -> u32 {
    1
}
fn default_zone_check_interval() -> u64 {
    60
}
fn default_zone_failures_to_offline() -> u32 {
    3
}
fn default_zone_pool_width() -> usize {
    8
}

impl Default for CloudConfig {
    fn default() -> Self {
        CloudConfig {
            server: ServerConfig::default(),
            directory: DirectorySection::default(),
            network: NetworkSection::default(),
            zones: ZoneSection::default(),
            quota: QuotaDefaults::default(),
        }
    }
}

impl CloudConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read cloudd config: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).with_context(|| "failed to parse cloudd config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.network.num_networks == 0 {
            anyhow::bail!("network.num_networks must be at least 1");
        }
        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("server.listen '{}' is not a valid socket address", self.server.listen);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_empty_sections() {
        let config = CloudConfig::parse("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8773");
        assert_eq!(config.zones.failures_to_offline, 3);
        assert_eq!(config.quota.instances, 10);
    }

    #[test]
    fn full_config_overrides_defaults() {
        let toml = r#"
[server]
listen = "127.0.0.1:9000"
availability_zone = "zone-b"

[network]
mode = "vlan"
use_ipv6 = true

[zones]
db_check_interval_secs = 30
failures_to_offline = 5

[quota]
instances = 50
"#;
        let config = CloudConfig::parse(toml).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.network.mode, NetworkMode::Vlan);
        assert!(config.network.use_ipv6);
        assert_eq!(config.zones.db_check_interval_secs, 30);
        assert_eq!(config.quota.instances, 50);
    }

    #[test]
    fn rejects_zero_networks() {
        let toml = "[network]\nnum_networks = 0\n";
        assert!(CloudConfig::parse(toml).is_err());
    }

    #[test]
    fn rejects_unparseable_listen_address() {
        let toml = "[server]\nlisten = \"not-an-address\"\n";
        assert!(CloudConfig::parse(toml).is_err());
    }
}
