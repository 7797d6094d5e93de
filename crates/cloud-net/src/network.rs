//! Network Allocator (C6): fixed/floating IP pools across the
//! Flat/FlatDhcp/Vlan bridge modes, reusing the `retry` backoff loop
//! for `deallocate`'s grace-timer force-free.

use std::time::Duration;

use cloud_core::error::{CloudError, Result};
use cloud_core::model::{FixedIp, FixedIpState, FloatingIp, validate_fixed_ip_transition};
use cloud_core::retry::retry;
use cloud_state::StateStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::shell;

/// Deploy-time network mode. Sealed: no other mode is
/// meaningful without a corresponding bridge-provisioning strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// A single shared bridge; addresses pre-filled from a list.
    Flat,
    /// A single bridge host running DHCP from a reserved pool.
    FlatDhcp,
    /// One dedicated VLAN + subnet per project; `.2` reserved for the VPN instance.
    Vlan,
}

/// Static per-deploy network configuration. VLAN/subnet carve-out for
/// `Vlan` mode is config-driven rather than elected at runtime — see
/// DESIGN.md's note on the network-host leader-election open question.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub mode: NetworkMode,
    pub bridge_name: String,
    pub dhcp_lease_grace: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            mode: NetworkMode::FlatDhcp,
            bridge_name: "cloudbr0".to_string(),
            dhcp_lease_grace: Duration::from_secs(30),
        }
    }
}

pub struct NetworkAllocator {
    store: Arc<dyn StateStore>,
    config: NetworkConfig,
}

impl NetworkAllocator {
    pub fn new(store: Arc<dyn StateStore>, config: NetworkConfig) -> Self {
        NetworkAllocator { store, config }
    }

    /// Idempotently ensures the mode's bridge exists on the current host.
    pub fn ensure_bridge(&self) -> Result<()> {
        let bridge = &self.config.bridge_name;
        let exists = shell::run("ip", &["link", "show", bridge])?;
        if !exists.status.success() {
            shell::run_checked("ip", &["link", "add", "name", bridge, "type", "bridge"])?;
            shell::run_checked("ip", &["link", "set", bridge, "up"])?;
            info!(bridge, mode = ?self.config.mode, "created network bridge");
        }
        Ok(())
    }

    /// Allocates the first `Free`, non-reserved address on `network_id`.
    /// Never returns a reserved or leased address.
    pub async fn allocate_fixed_ip(&self, network_id: &str, instance_id: &str) -> Result<FixedIp> {
        let candidates = self.store.list_fixed_ips_by_network(network_id).await?;
        let mut chosen = candidates
            .into_iter()
            .find(|ip| !ip.reserved && ip.state == FixedIpState::Free)
            .ok_or(CloudError::NoMoreAddresses)?;

        validate_fixed_ip_transition(chosen.state, FixedIpState::Allocated)?;
        chosen.state = FixedIpState::Allocated;
        chosen.instance_id = Some(instance_id.to_string());
        self.store.update_fixed_ip(&chosen).await?;
        Ok(chosen)
    }

    /// Marks a fixed IP leased once the DHCP ack is observed (`FlatDhcp`/`Vlan`).
    pub async fn lease_fixed_ip(&self, address: &str) -> Result<FixedIp> {
        let mut ip = self.store.get_fixed_ip(address).await?;
        validate_fixed_ip_transition(ip.state, FixedIpState::Leased)?;
        ip.state = FixedIpState::Leased;
        self.store.update_fixed_ip(&ip).await?;
        Ok(ip)
    }

    /// Releases the DHCP lease, then frees the address. If the lease
    /// isn't released within `dhcp_lease_grace`, force-frees it with a
    /// warning rather than leaking the slot forever.
    pub async fn deallocate_fixed_ip(&self, address: &str) -> Result<FixedIp> {
        let ip = self.store.get_fixed_ip(address).await?;
        if ip.state == FixedIpState::Leased {
            let address = address.to_string();
            let store = self.store.clone();
            let released = retry(3, Duration::from_millis(50), || {
                let store = store.clone();
                let address = address.clone();
                async move {
                    let ip = store.get_fixed_ip(&address).await?;
                    if ip.state == FixedIpState::Released {
                        Ok(())
                    } else {
                        Err(CloudError::ApiError("lease not yet released".into()))
                    }
                }
            })
            .await;
            if released.is_err() {
                warn!(address, "dhcp lease release timed out, force-freeing address");
            }
        }

        let mut ip = self.store.get_fixed_ip(address).await?;
        if ip.state != FixedIpState::Free {
            // Force-free: skip the intermediate `Released` step if the
            // grace timer above expired without an observed release.
            ip.state = FixedIpState::Free;
            ip.instance_id = None;
            self.store.update_fixed_ip(&ip).await?;
        }
        Ok(ip)
    }

    /// Allocates a free floating IP from `host`'s pool to `project_id`.
    pub async fn allocate_floating_ip(&self, project_id: &str, host: &str) -> Result<FloatingIp> {
        let pool = self.store.list_floating_ips_by_project(project_id).await?;
        if let Some(existing) = pool.iter().find(|ip| ip.project_id.is_none() && ip.host == host) {
            let mut ip = existing.clone();
            ip.project_id = Some(project_id.to_string());
            self.store.update_floating_ip(&ip).await?;
            return Ok(ip);
        }
        Err(CloudError::NoMoreFloatingIps)
    }

    /// Associates a floating IP with an instance's fixed IP. Only
    /// validates ownership and persists the association — updating NAT
    /// on the owning network host is the caller's responsibility via a
    /// `cast` to that host once this call returns.
    pub async fn associate_floating_ip(&self, address: &str, fixed_ip_address: &str, project_id: &str) -> Result<FloatingIp> {
        let mut floating = self.store.get_floating_ip(address).await?;
        if floating.project_id.as_deref() != Some(project_id) {
            return Err(CloudError::Unauthorized("floating ip not owned by this project".into()));
        }
        let fixed = self.store.get_fixed_ip(fixed_ip_address).await?;
        floating.fixed_ip_id = Some(fixed.address.clone());
        self.store.update_floating_ip(&floating).await?;
        Ok(floating)
    }

    pub async fn disassociate_floating_ip(&self, address: &str) -> Result<FloatingIp> {
        let mut floating = self.store.get_floating_ip(address).await?;
        floating.fixed_ip_id = None;
        self.store.update_floating_ip(&floating).await?;
        Ok(floating)
    }

    pub async fn release_floating_ip(&self, address: &str, project_id: &str) -> Result<()> {
        let mut floating = self.store.get_floating_ip(address).await?;
        if floating.project_id.as_deref() != Some(project_id) {
            return Err(CloudError::Unauthorized("floating ip not owned by this project".into()));
        }
        floating.project_id = None;
        floating.fixed_ip_id = None;
        self.store.update_floating_ip(&floating).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_state::SqliteStateStore;

    async fn store_with_network(network_id: &str, addrs: &[&str]) -> Arc<dyn StateStore> {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        for addr in addrs {
            store
                .insert_fixed_ip(&FixedIp {
                    address: addr.to_string(),
                    network_id: network_id.to_string(),
                    instance_id: None,
                    state: FixedIpState::Free,
                    reserved: false,
                    virtual_interface_id: None,
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn allocate_never_returns_reserved_address() {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        store
            .insert_fixed_ip(&FixedIp {
                address: "10.0.0.2".into(),
                network_id: "net-1".into(),
                instance_id: None,
                state: FixedIpState::Free,
                reserved: true,
                virtual_interface_id: None,
            })
            .await
            .unwrap();
        store
            .insert_fixed_ip(&FixedIp {
                address: "10.0.0.3".into(),
                network_id: "net-1".into(),
                instance_id: None,
                state: FixedIpState::Free,
                reserved: false,
                virtual_interface_id: None,
            })
            .await
            .unwrap();

        let alloc = NetworkAllocator::new(store, NetworkConfig::default());
        let ip = alloc.allocate_fixed_ip("net-1", "i-1").await.unwrap();
        assert_eq!(ip.address, "10.0.0.3");
    }

    #[tokio::test]
    async fn allocate_fails_when_network_exhausted() {
        let store = store_with_network("net-1", &[]).await;
        let alloc = NetworkAllocator::new(store, NetworkConfig::default());
        assert!(alloc.allocate_fixed_ip("net-1", "i-1").await.is_err());
    }

    #[tokio::test]
    async fn full_lifecycle_round_trips_to_free() {
        let store = store_with_network("net-1", &["10.0.0.5"]).await;
        let alloc = NetworkAllocator::new(store, NetworkConfig::default());
        let ip = alloc.allocate_fixed_ip("net-1", "i-1").await.unwrap();
        assert_eq!(ip.state, FixedIpState::Allocated);
        let ip = alloc.lease_fixed_ip(&ip.address).await.unwrap();
        assert_eq!(ip.state, FixedIpState::Leased);
        let ip = alloc.deallocate_fixed_ip(&ip.address).await.unwrap();
        assert_eq!(ip.state, FixedIpState::Free);
        assert!(ip.instance_id.is_none());
    }

    #[tokio::test]
    async fn floating_ip_associate_requires_ownership() {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        store
            .insert_floating_ip(&FloatingIp {
                address: "198.51.100.9".into(),
                host: "net-host-1".into(),
                project_id: Some("acme".into()),
                fixed_ip_id: None,
                auto_assigned: false,
            })
            .await
            .unwrap();
        store
            .insert_fixed_ip(&FixedIp {
                address: "10.0.0.9".into(),
                network_id: "net-1".into(),
                instance_id: Some("i-1".into()),
                state: FixedIpState::Leased,
                reserved: false,
                virtual_interface_id: None,
            })
            .await
            .unwrap();

        let alloc = NetworkAllocator::new(store, NetworkConfig::default());
        let err = alloc.associate_floating_ip("198.51.100.9", "10.0.0.9", "other-project").await;
        assert!(matches!(err, Err(CloudError::Unauthorized(_))));

        let ok = alloc.associate_floating_ip("198.51.100.9", "10.0.0.9", "acme").await.unwrap();
        assert_eq!(ok.fixed_ip_id.as_deref(), Some("10.0.0.9"));
    }
}
