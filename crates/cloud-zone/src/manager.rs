//! Zone Manager (C9): tracks every child zone's active/offline state
//! plus a per-service capability report, backed by a consecutive
//! failure counter (`zone_failures_to_offline`) instead of a fixed
//! grace timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cloud_core::error::Result;
use cloud_core::model::Zone;
use cloud_state::StateStore;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::capabilities::{self, NestedCapabilities};

/// Abstraction over "ask a child zone's API for its current capability
/// report." The wire protocol to an actual zone is out of scope —
/// this is the seam a real HTTP/RPC client plugs into, mirroring how
/// `cloud-directory::Directory` seams out the LDAP wire protocol.
#[async_trait]
pub trait ZoneProbe: Send + Sync {
    async fn probe(&self, zone: &Zone) -> Result<NestedCapabilities>;
}

/// Placeholder `ZoneProbe` for deployments with no child zones
/// configured yet. Every probe fails with `ServiceUnavailable`, so a
/// zone added to the store without a real prober wired in simply
/// drifts to `is_active = false` after `failures_to_offline` polls
/// rather than panicking or blocking startup.
pub struct NullZoneProbe;

#[async_trait]
impl ZoneProbe for NullZoneProbe {
    async fn probe(&self, _zone: &Zone) -> Result<NestedCapabilities> {
        Err(cloud_core::error::CloudError::ServiceUnavailable(
            "no zone prober configured".into(),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ZoneManagerConfig {
    /// How often to reconcile against the persisted zone list and
    /// re-probe every zone.
    pub check_interval: Duration,
    /// Consecutive probe failures before a zone is marked inactive.
    pub failures_to_offline: u32,
    /// Max probes in flight at once (bounded-concurrency worker pool).
    pub worker_pool_width: usize,
}

impl Default for ZoneManagerConfig {
    fn default() -> Self {
        ZoneManagerConfig {
            check_interval: Duration::from_secs(60),
            failures_to_offline: 3,
            worker_pool_width: 8,
        }
    }
}

/// Owns the single background task that polls every persisted zone
/// and keeps an in-memory snapshot other components read without
/// touching the store on every scheduling decision.
pub struct ZoneManager {
    store: Arc<dyn StateStore>,
    probe: Arc<dyn ZoneProbe>,
    config: ZoneManagerConfig,
    snapshot: Arc<RwLock<HashMap<String, Zone>>>,
}

impl ZoneManager {
    pub fn new(store: Arc<dyn StateStore>, probe: Arc<dyn ZoneProbe>, config: ZoneManagerConfig) -> Self {
        ZoneManager {
            store,
            probe,
            config,
            snapshot: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Runs the background poll loop until cancelled. Intended to be
    /// spawned once by the controller's `serve()`.
    pub async fn run(&self) {
        loop {
            if let Err(e) = self.reconcile_once().await {
                warn!(error = %e, "zone reconcile pass failed");
            }
            tokio::time::sleep(self.config.check_interval).await;
        }
    }

    /// One reconcile pass: loads the persisted zone list, probes every
    /// zone with bounded concurrency, and updates each zone's
    /// liveness/capability state. Exposed separately from `run` so
    /// tests can drive a single pass deterministically.
    pub async fn reconcile_once(&self) -> Result<()> {
        let zones = self.store.list_zones().await?;
        let mut joinset: JoinSet<(Zone, Result<NestedCapabilities>)> = JoinSet::new();
        let mut pending = zones.into_iter();
        let mut in_flight = 0usize;

        loop {
            while in_flight < self.config.worker_pool_width {
                let Some(zone) = pending.next() else { break };
                let probe = self.probe.clone();
                let z = zone.clone();
                joinset.spawn(async move {
                    let result = probe.probe(&z).await;
                    (zone, result)
                });
                in_flight += 1;
            }
            if in_flight == 0 {
                break;
            }
            let Some(joined) = joinset.join_next().await else { break };
            in_flight -= 1;
            match joined {
                Ok((zone, result)) => self.apply_probe_result(zone, result).await?,
                Err(e) => warn!(error = %e, "zone probe task panicked"),
            }
        }
        Ok(())
    }

    async fn apply_probe_result(&self, mut zone: Zone, result: Result<NestedCapabilities>) -> Result<()> {
        match result {
            Ok(nested) => {
                zone.attempt = 0;
                zone.is_active = true;
                zone.last_seen = Some(cloud_core::time::utc_now());
                zone.last_error = None;
                zone.capabilities = capabilities::flatten(&nested);
            }
            Err(e) => {
                zone.attempt += 1;
                zone.last_error = Some(e.to_string());
                if zone.attempt >= self.config.failures_to_offline {
                    if zone.is_active {
                        warn!(zone_id = %zone.id, attempt = zone.attempt, "zone marked offline");
                    }
                    zone.is_active = false;
                } else {
                    info!(zone_id = %zone.id, attempt = zone.attempt, "zone probe failed, retrying");
                }
            }
        }
        self.store.upsert_zone(&zone).await?;
        self.snapshot.write().await.insert(zone.id.clone(), zone);
        Ok(())
    }

    /// Returns the aggregated `(min, max)` capability range across
    /// every currently-active zone, reading the in-memory snapshot
    /// rather than the store.
    pub async fn get_zone_capabilities(&self) -> HashMap<String, (f64, f64)> {
        let snapshot = self.snapshot.read().await;
        let zones: Vec<Zone> = snapshot.values().cloned().collect();
        capabilities::aggregate(&zones)
    }

    /// Current snapshot of a single zone's state, if known.
    pub async fn zone_state(&self, zone_id: &str) -> Option<Zone> {
        self.snapshot.read().await.get(zone_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_core::error::CloudError;
    use cloud_state::SqliteStateStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysOk;
    #[async_trait]
    impl ZoneProbe for AlwaysOk {
        async fn probe(&self, _zone: &Zone) -> Result<NestedCapabilities> {
            let mut nested = NestedCapabilities::new();
            let mut hosts = HashMap::new();
            hosts.insert("host1".to_string(), HashMap::from([("free_ram_mb".to_string(), 2048.0)]));
            nested.insert("compute".to_string(), hosts);
            Ok(nested)
        }
    }

    struct AlwaysFail;
    #[async_trait]
    impl ZoneProbe for AlwaysFail {
        async fn probe(&self, _zone: &Zone) -> Result<NestedCapabilities> {
            Err(CloudError::ServiceUnavailable("zone unreachable".into()))
        }
    }

    struct FailNTimes(AtomicU32, u32);
    #[async_trait]
    impl ZoneProbe for FailNTimes {
        async fn probe(&self, _zone: &Zone) -> Result<NestedCapabilities> {
            let attempt = self.0.fetch_add(1, Ordering::SeqCst);
            if attempt < self.1 {
                Err(CloudError::ServiceUnavailable("not yet".into()))
            } else {
                Ok(NestedCapabilities::new())
            }
        }
    }

    fn zone(id: &str) -> Zone {
        Zone {
            id: id.to_string(),
            api_url: format!("http://{id}"),
            username: "svc".into(),
            password: "pw".into(),
            name: None,
            capabilities: HashMap::new(),
            is_active: false,
            attempt: 0,
            last_seen: None,
            last_error: None,
        }
    }

    async fn store_with_zone(z: Zone) -> Arc<dyn StateStore> {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        store.upsert_zone(&z).await.unwrap();
        store
    }

    #[tokio::test]
    async fn successful_probe_marks_zone_active_and_flattens_capabilities() {
        let store = store_with_zone(zone("zone1")).await;
        let mgr = ZoneManager::new(store, Arc::new(AlwaysOk), ZoneManagerConfig::default());
        mgr.reconcile_once().await.unwrap();

        let state = mgr.zone_state("zone1").await.unwrap();
        assert!(state.is_active);
        assert_eq!(state.attempt, 0);
        assert_eq!(state.capabilities.get("compute_free_ram_mb"), Some(&2048.0));
    }

    #[tokio::test]
    async fn failures_below_threshold_keep_zone_active() {
        let mut z = zone("zone1");
        z.is_active = true;
        let store = store_with_zone(z).await;
        let config = ZoneManagerConfig {
            failures_to_offline: 3,
            ..ZoneManagerConfig::default()
        };
        let mgr = ZoneManager::new(store, Arc::new(AlwaysFail), config);
        mgr.reconcile_once().await.unwrap();

        let state = mgr.zone_state("zone1").await.unwrap();
        assert!(state.is_active);
        assert_eq!(state.attempt, 1);
    }

    #[tokio::test]
    async fn failures_at_threshold_mark_zone_offline() {
        let mut z = zone("zone1");
        z.is_active = true;
        z.attempt = 2;
        let store = store_with_zone(z).await;
        let config = ZoneManagerConfig {
            failures_to_offline: 3,
            ..ZoneManagerConfig::default()
        };
        let mgr = ZoneManager::new(store, Arc::new(AlwaysFail), config);
        mgr.reconcile_once().await.unwrap();

        let state = mgr.zone_state("zone1").await.unwrap();
        assert!(!state.is_active);
        assert_eq!(state.attempt, 3);
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn recovery_resets_attempt_counter() {
        let store = store_with_zone(zone("zone1")).await;
        let probe = Arc::new(FailNTimes(AtomicU32::new(0), 1));
        let mgr = ZoneManager::new(store, probe, ZoneManagerConfig::default());

        mgr.reconcile_once().await.unwrap();
        assert_eq!(mgr.zone_state("zone1").await.unwrap().attempt, 1);

        mgr.reconcile_once().await.unwrap();
        let state = mgr.zone_state("zone1").await.unwrap();
        assert_eq!(state.attempt, 0);
        assert!(state.is_active);
    }

    #[tokio::test]
    async fn reconcile_handles_multiple_zones_with_bounded_concurrency() {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        for i in 0..5 {
            store.upsert_zone(&zone(&format!("zone{i}"))).await.unwrap();
        }
        let config = ZoneManagerConfig {
            worker_pool_width: 2,
            ..ZoneManagerConfig::default()
        };
        let mgr = ZoneManager::new(store, Arc::new(AlwaysOk), config);
        mgr.reconcile_once().await.unwrap();

        for i in 0..5 {
            assert!(mgr.zone_state(&format!("zone{i}")).await.unwrap().is_active);
        }
    }

    #[tokio::test]
    async fn get_zone_capabilities_aggregates_active_zones() {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        store.upsert_zone(&zone("zone1")).await.unwrap();
        store.upsert_zone(&zone("zone2")).await.unwrap();
        let mgr = ZoneManager::new(store, Arc::new(AlwaysOk), ZoneManagerConfig::default());
        mgr.reconcile_once().await.unwrap();

        let caps = mgr.get_zone_capabilities().await;
        assert_eq!(caps["compute_free_ram_mb"], (2048.0, 2048.0));
    }
}
