use async_trait::async_trait;
use cloud_core::error::Result;
use cloud_core::model::{
    FixedIp, FloatingIp, Instance, QuotaReservation, SecurityGroup, Service, Snapshot, Volume, Zone,
};

/// Persistent State API (C4). One call per entity operation rather
/// than a generic `get`/`put`, so every collaborator gets a typed
/// repository method instead of a schemaless blob store.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn insert_instance(&self, instance: &Instance) -> Result<()>;
    async fn get_instance(&self, id: &str) -> Result<Instance>;
    async fn update_instance(&self, instance: &Instance) -> Result<()>;
    async fn list_instances_by_project(&self, project_id: &str) -> Result<Vec<Instance>>;
    async fn delete_instance(&self, id: &str) -> Result<()>;

    async fn insert_volume(&self, volume: &Volume) -> Result<()>;
    async fn get_volume(&self, id: &str) -> Result<Volume>;
    async fn update_volume(&self, volume: &Volume) -> Result<()>;
    async fn list_volumes_by_project(&self, project_id: &str) -> Result<Vec<Volume>>;
    async fn delete_volume(&self, id: &str) -> Result<()>;

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
    async fn get_snapshot(&self, id: &str) -> Result<Snapshot>;
    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
    async fn list_snapshots_by_volume(&self, volume_id: &str) -> Result<Vec<Snapshot>>;
    async fn delete_snapshot(&self, id: &str) -> Result<()>;

    async fn insert_fixed_ip(&self, ip: &FixedIp) -> Result<()>;
    async fn get_fixed_ip(&self, address: &str) -> Result<FixedIp>;
    async fn update_fixed_ip(&self, ip: &FixedIp) -> Result<()>;
    async fn list_fixed_ips_by_network(&self, network_id: &str) -> Result<Vec<FixedIp>>;

    async fn insert_floating_ip(&self, ip: &FloatingIp) -> Result<()>;
    async fn get_floating_ip(&self, address: &str) -> Result<FloatingIp>;
    async fn update_floating_ip(&self, ip: &FloatingIp) -> Result<()>;
    async fn list_floating_ips_by_project(&self, project_id: &str) -> Result<Vec<FloatingIp>>;

    async fn insert_security_group(&self, group: &SecurityGroup) -> Result<()>;
    async fn get_security_group(&self, id: &str) -> Result<SecurityGroup>;
    async fn update_security_group(&self, group: &SecurityGroup) -> Result<()>;
    async fn list_security_groups_by_project(&self, project_id: &str) -> Result<Vec<SecurityGroup>>;
    async fn delete_security_group(&self, id: &str) -> Result<()>;

    async fn upsert_service(&self, service: &Service) -> Result<()>;
    async fn list_services(&self) -> Result<Vec<Service>>;

    async fn upsert_zone(&self, zone: &Zone) -> Result<()>;
    async fn list_zones(&self) -> Result<Vec<Zone>>;
    async fn delete_zone(&self, id: &str) -> Result<()>;

    async fn insert_quota_reservation(&self, reservation: &QuotaReservation) -> Result<()>;
    async fn delete_quota_reservation(&self, id: &str) -> Result<Option<QuotaReservation>>;
    async fn list_expired_reservations(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<QuotaReservation>>;
    async fn get_used(&self, project_id: &str, resource: &str) -> Result<i64>;
    async fn adjust_used(&self, project_id: &str, resource: &str, delta: i64) -> Result<i64>;
}

