//! Per-host iSCSI target-number table: a shared, host-scoped slot
//! allocator. `CreateVolume` claims the lowest free slot on the chosen
//! host, `DeleteVolume` frees it, and an exhausted host returns
//! `NoMoreTargets` rather than blocking.

use std::collections::{HashMap, HashSet};

use cloud_core::error::{CloudError, Result};
use tokio::sync::Mutex;

pub struct TargetTable {
    max_per_host: u32,
    hosts: Mutex<HashMap<String, HashSet<u32>>>,
}

impl TargetTable {
    pub fn new(max_per_host: u32) -> Self {
        TargetTable {
            max_per_host,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Claims the lowest unused target number on `host`.
    pub async fn allocate(&self, host: &str) -> Result<u32> {
        let mut hosts = self.hosts.lock().await;
        let used = hosts.entry(host.to_string()).or_default();
        for candidate in 0..self.max_per_host {
            if !used.contains(&candidate) {
                used.insert(candidate);
                return Ok(candidate);
            }
        }
        Err(CloudError::NoMoreTargets(host.to_string()))
    }

    /// Frees a target number on `host`, unblocking the next `CreateVolume`.
    pub async fn free(&self, host: &str, target: u32) {
        let mut hosts = self.hosts.lock().await;
        if let Some(used) = hosts.get_mut(host) {
            used.remove(&target);
        }
    }
}
