//! Per-project resource limits: config-driven defaults with optional
//! per-project overrides.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Default limit for a resource when no project-specific override is
/// configured. Mirrors the original's `quota_instances`,
/// `quota_cores`, `quota_ram`, `quota_volumes`, `quota_gigabytes`,
/// `quota_floating_ips`, `quota_security_groups`,
/// `quota_security_group_rules`, `quota_key_pairs`,
/// `quota_metadata_items` reserved config keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaDefaults {
    #[serde(default = "default_instances")]
    pub instances: u64,
    #[serde(default = "default_cores")]
    pub cores: u64,
    #[serde(default = "default_ram_mb")]
    pub ram_mb: u64,
    #[serde(default = "default_volumes")]
    pub volumes: u64,
    #[serde(default = "default_gigabytes")]
    pub gigabytes: u64,
    #[serde(default = "default_floating_ips")]
    pub floating_ips: u64,
    #[serde(default = "default_security_groups")]
    pub security_groups: u64,
    #[serde(default = "default_security_group_rules")]
    pub security_group_rules: u64,
    #[serde(default = "default_key_pairs")]
    pub key_pairs: u64,
}

fn default_instances() -> u64 {
    10
}
fn default_cores() -> u64 {
    20
}
fn default_ram_mb() -> u64 {
    51200
}
fn default_volumes() -> u64 {
    10
}
fn default_gigabytes() -> u64 {
    1000
}
fn default_floating_ips() -> u64 {
    10
}
fn default_security_groups() -> u64 {
    10
}
fn default_security_group_rules() -> u64 {
    20
}
fn default_key_pairs() -> u64 {
    100
}

impl Default for QuotaDefaults {
    fn default() -> Self {
        QuotaDefaults {
            instances: default_instances(),
            cores: default_cores(),
            ram_mb: default_ram_mb(),
            volumes: default_volumes(),
            gigabytes: default_gigabytes(),
            floating_ips: default_floating_ips(),
            security_groups: default_security_groups(),
            security_group_rules: default_security_group_rules(),
            key_pairs: default_key_pairs(),
        }
    }
}

impl QuotaDefaults {
    pub fn get(&self, resource: &str) -> Option<u64> {
        match resource {
            "instances" => Some(self.instances),
            "cores" => Some(self.cores),
            "ram_mb" => Some(self.ram_mb),
            "volumes" => Some(self.volumes),
            "gigabytes" => Some(self.gigabytes),
            "floating_ips" => Some(self.floating_ips),
            "security_groups" => Some(self.security_groups),
            "security_group_rules" => Some(self.security_group_rules),
            "key_pairs" => Some(self.key_pairs),
            _ => None,
        }
    }
}

/// Resolves the effective limit for `(project_id, resource)`: a
/// per-project override if one is configured, else the global default,
/// else "unlimited" is never implied — an unrecognized resource name
/// has no limit entry and reservation against it always fails closed
/// (callers should only reserve resources named in `QuotaDefaults`).
#[derive(Debug, Clone, Default)]
pub struct QuotaLimits {
    defaults: QuotaDefaults,
    overrides: HashMap<(String, String), u64>,
}

impl QuotaLimits {
    pub fn new(defaults: QuotaDefaults) -> Self {
        QuotaLimits {
            defaults,
            overrides: HashMap::new(),
        }
    }

    pub fn set_override(&mut self, project_id: impl Into<String>, resource: impl Into<String>, limit: u64) {
        self.overrides.insert((project_id.into(), resource.into()), limit);
    }

    pub fn limit_for(&self, project_id: &str, resource: &str) -> Option<u64> {
        self.overrides
            .get(&(project_id.to_string(), resource.to_string()))
            .copied()
            .or_else(|| self.defaults.get(resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limit_applies_when_no_override() {
        let limits = QuotaLimits::new(QuotaDefaults::default());
        assert_eq!(limits.limit_for("acme", "instances"), Some(10));
    }

    #[test]
    fn project_override_wins_over_default() {
        let mut limits = QuotaLimits::new(QuotaDefaults::default());
        limits.set_override("acme", "instances", 50);
        assert_eq!(limits.limit_for("acme", "instances"), Some(50));
        assert_eq!(limits.limit_for("other", "instances"), Some(10));
    }

    #[test]
    fn unknown_resource_has_no_limit() {
        let limits = QuotaLimits::new(QuotaDefaults::default());
        assert_eq!(limits.limit_for("acme", "unobtanium"), None);
    }
}
