//! SQLite-backed `StateStore`. Entities round-trip through a `doc`
//! JSON column keyed by their natural id, giving every entity durable
//! state behind a narrow typed API without a bespoke table per kind.

use std::sync::Arc;

use async_trait::async_trait;
use cloud_core::error::{CloudError, Result};
use cloud_core::model::{
    FixedIp, FloatingIp, Instance, QuotaReservation, SecurityGroup, Service, Snapshot, Volume, Zone,
};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::schema::CREATE_TABLES;
use crate::store::StateStore;

pub struct SqliteStateStore {
    pool: SqlitePool,
    /// Serializes the critical sections taken out by `with_entity_lock`.
    /// SQLite has no row-level locking primitive we can hold across
    /// `await` points from multiple connections, so the `locks` table
    /// plus this in-process mutex together emulate one: the table
    /// makes the lock visible/auditable, the mutex makes acquisition
    /// atomic within this process.
    lock_guard: Arc<Mutex<()>>,
}

impl SqliteStateStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .map_err(|e| CloudError::Internal(format!("failed to open state store: {e}")))?;
        sqlx::query(CREATE_TABLES)
            .execute(&pool)
            .await
            .map_err(|e| CloudError::Internal(format!("failed to initialize schema: {e}")))?;
        Ok(SqliteStateStore {
            pool,
            lock_guard: Arc::new(Mutex::new(())),
        })
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Runs `f` inside an exclusive transaction holding the advisory
    /// lock row for `(entity_kind, entity_id)`, serializing concurrent
    /// read-modify-write sequences against the same entity.
    pub async fn with_entity_lock<F, Fut, T>(&self, entity_kind: &str, entity_id: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let _permit = self.lock_guard.lock().await;
        sqlx::query("INSERT OR IGNORE INTO locks (entity_kind, entity_id) VALUES (?, ?)")
            .bind(entity_kind)
            .bind(entity_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(format!("failed to take advisory lock: {e}")))?;
        f().await
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn insert_instance(&self, instance: &Instance) -> Result<()> {
        let doc = serde_json::to_string(instance).map_err(|e| CloudError::Internal(e.to_string()))?;
        sqlx::query("INSERT INTO instances (id, project_id, doc) VALUES (?, ?, ?)")
            .bind(&instance.id)
            .bind(&instance.project_id)
            .bind(doc)
            .execute(&self.pool)
            .await
            .map_err(|_| CloudError::Duplicate(format!("instance {}", instance.id)))?;
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<Instance> {
        let row = sqlx::query("SELECT doc FROM instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?
            .ok_or_else(|| CloudError::NotFound(format!("instance {id}")))?;
        let doc: String = row.get("doc");
        serde_json::from_str(&doc).map_err(|e| CloudError::Internal(e.to_string()))
    }

    async fn update_instance(&self, instance: &Instance) -> Result<()> {
        let doc = serde_json::to_string(instance).map_err(|e| CloudError::Internal(e.to_string()))?;
        let result = sqlx::query("UPDATE instances SET doc = ?, project_id = ? WHERE id = ?")
            .bind(doc)
            .bind(&instance.project_id)
            .bind(&instance.id)
            .execute(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(CloudError::NotFound(format!("instance {}", instance.id)));
        }
        Ok(())
    }

    async fn list_instances_by_project(&self, project_id: &str) -> Result<Vec<Instance>> {
        let rows = sqlx::query("SELECT doc FROM instances WHERE project_id = ?")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|r| {
                let doc: String = r.get("doc");
                serde_json::from_str(&doc).map_err(|e| CloudError::Internal(e.to_string()))
            })
            .collect()
    }

    async fn delete_instance(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(CloudError::NotFound(format!("instance {id}")));
        }
        Ok(())
    }

    async fn insert_volume(&self, volume: &Volume) -> Result<()> {
        let doc = serde_json::to_string(volume).map_err(|e| CloudError::Internal(e.to_string()))?;
        sqlx::query("INSERT INTO volumes (id, project_id, doc) VALUES (?, ?, ?)")
            .bind(&volume.id)
            .bind(&volume.project_id)
            .bind(doc)
            .execute(&self.pool)
            .await
            .map_err(|_| CloudError::Duplicate(format!("volume {}", volume.id)))?;
        Ok(())
    }

    async fn get_volume(&self, id: &str) -> Result<Volume> {
        let row = sqlx::query("SELECT doc FROM volumes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?
            .ok_or_else(|| CloudError::NotFound(format!("volume {id}")))?;
        let doc: String = row.get("doc");
        serde_json::from_str(&doc).map_err(|e| CloudError::Internal(e.to_string()))
    }

    async fn update_volume(&self, volume: &Volume) -> Result<()> {
        let doc = serde_json::to_string(volume).map_err(|e| CloudError::Internal(e.to_string()))?;
        let result = sqlx::query("UPDATE volumes SET doc = ? WHERE id = ?")
            .bind(doc)
            .bind(&volume.id)
            .execute(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(CloudError::NotFound(format!("volume {}", volume.id)));
        }
        Ok(())
    }

    async fn list_volumes_by_project(&self, project_id: &str) -> Result<Vec<Volume>> {
        let rows = sqlx::query("SELECT doc FROM volumes WHERE project_id = ?")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|r| {
                let doc: String = r.get("doc");
                serde_json::from_str(&doc).map_err(|e| CloudError::Internal(e.to_string()))
            })
            .collect()
    }

    async fn delete_volume(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM volumes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(CloudError::NotFound(format!("volume {id}")));
        }
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let doc = serde_json::to_string(snapshot).map_err(|e| CloudError::Internal(e.to_string()))?;
        sqlx::query("INSERT INTO snapshots (id, volume_id, doc) VALUES (?, ?, ?)")
            .bind(&snapshot.id)
            .bind(&snapshot.volume_id)
            .bind(doc)
            .execute(&self.pool)
            .await
            .map_err(|_| CloudError::Duplicate(format!("snapshot {}", snapshot.id)))?;
        Ok(())
    }

    async fn get_snapshot(&self, id: &str) -> Result<Snapshot> {
        let row = sqlx::query("SELECT doc FROM snapshots WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?
            .ok_or_else(|| CloudError::NotFound(format!("snapshot {id}")))?;
        let doc: String = row.get("doc");
        serde_json::from_str(&doc).map_err(|e| CloudError::Internal(e.to_string()))
    }

    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let doc = serde_json::to_string(snapshot).map_err(|e| CloudError::Internal(e.to_string()))?;
        let result = sqlx::query("UPDATE snapshots SET doc = ? WHERE id = ?")
            .bind(doc)
            .bind(&snapshot.id)
            .execute(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(CloudError::NotFound(format!("snapshot {}", snapshot.id)));
        }
        Ok(())
    }

    async fn list_snapshots_by_volume(&self, volume_id: &str) -> Result<Vec<Snapshot>> {
        let rows = sqlx::query("SELECT doc FROM snapshots WHERE volume_id = ?")
            .bind(volume_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|r| {
                let doc: String = r.get("doc");
                serde_json::from_str(&doc).map_err(|e| CloudError::Internal(e.to_string()))
            })
            .collect()
    }

    async fn delete_snapshot(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM snapshots WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(CloudError::NotFound(format!("snapshot {id}")));
        }
        Ok(())
    }

    async fn insert_fixed_ip(&self, ip: &FixedIp) -> Result<()> {
        let doc = serde_json::to_string(ip).map_err(|e| CloudError::Internal(e.to_string()))?;
        sqlx::query("INSERT INTO fixed_ips (address, network_id, doc) VALUES (?, ?, ?)")
            .bind(&ip.address)
            .bind(&ip.network_id)
            .bind(doc)
            .execute(&self.pool)
            .await
            .map_err(|_| CloudError::Duplicate(format!("fixed ip {}", ip.address)))?;
        Ok(())
    }

    async fn get_fixed_ip(&self, address: &str) -> Result<FixedIp> {
        let row = sqlx::query("SELECT doc FROM fixed_ips WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?
            .ok_or_else(|| CloudError::NotFound(format!("fixed ip {address}")))?;
        let doc: String = row.get("doc");
        serde_json::from_str(&doc).map_err(|e| CloudError::Internal(e.to_string()))
    }

    async fn update_fixed_ip(&self, ip: &FixedIp) -> Result<()> {
        let doc = serde_json::to_string(ip).map_err(|e| CloudError::Internal(e.to_string()))?;
        let result = sqlx::query("UPDATE fixed_ips SET doc = ? WHERE address = ?")
            .bind(doc)
            .bind(&ip.address)
            .execute(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(CloudError::NotFound(format!("fixed ip {}", ip.address)));
        }
        Ok(())
    }

    async fn list_fixed_ips_by_network(&self, network_id: &str) -> Result<Vec<FixedIp>> {
        let rows = sqlx::query("SELECT doc FROM fixed_ips WHERE network_id = ?")
            .bind(network_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|r| {
                let doc: String = r.get("doc");
                serde_json::from_str(&doc).map_err(|e| CloudError::Internal(e.to_string()))
            })
            .collect()
    }

    async fn insert_floating_ip(&self, ip: &FloatingIp) -> Result<()> {
        let doc = serde_json::to_string(ip).map_err(|e| CloudError::Internal(e.to_string()))?;
        sqlx::query("INSERT INTO floating_ips (address, project_id, doc) VALUES (?, ?, ?)")
            .bind(&ip.address)
            .bind(&ip.project_id)
            .bind(doc)
            .execute(&self.pool)
            .await
            .map_err(|_| CloudError::Duplicate(format!("floating ip {}", ip.address)))?;
        Ok(())
    }

    async fn get_floating_ip(&self, address: &str) -> Result<FloatingIp> {
        let row = sqlx::query("SELECT doc FROM floating_ips WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?
            .ok_or_else(|| CloudError::NotFound(format!("floating ip {address}")))?;
        let doc: String = row.get("doc");
        serde_json::from_str(&doc).map_err(|e| CloudError::Internal(e.to_string()))
    }

    async fn update_floating_ip(&self, ip: &FloatingIp) -> Result<()> {
        let doc = serde_json::to_string(ip).map_err(|e| CloudError::Internal(e.to_string()))?;
        let result = sqlx::query("UPDATE floating_ips SET doc = ?, project_id = ? WHERE address = ?")
            .bind(doc)
            .bind(&ip.project_id)
            .bind(&ip.address)
            .execute(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(CloudError::NotFound(format!("floating ip {}", ip.address)));
        }
        Ok(())
    }

    async fn list_floating_ips_by_project(&self, project_id: &str) -> Result<Vec<FloatingIp>> {
        let rows = sqlx::query("SELECT doc FROM floating_ips WHERE project_id = ?")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|r| {
                let doc: String = r.get("doc");
                serde_json::from_str(&doc).map_err(|e| CloudError::Internal(e.to_string()))
            })
            .collect()
    }

    async fn insert_security_group(&self, group: &SecurityGroup) -> Result<()> {
        let doc = serde_json::to_string(group).map_err(|e| CloudError::Internal(e.to_string()))?;
        sqlx::query("INSERT INTO security_groups (id, project_id, name, doc) VALUES (?, ?, ?, ?)")
            .bind(&group.id)
            .bind(&group.project_id)
            .bind(&group.name)
            .bind(doc)
            .execute(&self.pool)
            .await
            .map_err(|_| CloudError::Duplicate(format!("security group {}", group.name)))?;
        Ok(())
    }

    async fn get_security_group(&self, id: &str) -> Result<SecurityGroup> {
        let row = sqlx::query("SELECT doc FROM security_groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?
            .ok_or_else(|| CloudError::NotFound(format!("security group {id}")))?;
        let doc: String = row.get("doc");
        serde_json::from_str(&doc).map_err(|e| CloudError::Internal(e.to_string()))
    }

    async fn update_security_group(&self, group: &SecurityGroup) -> Result<()> {
        let doc = serde_json::to_string(group).map_err(|e| CloudError::Internal(e.to_string()))?;
        let result = sqlx::query("UPDATE security_groups SET doc = ? WHERE id = ?")
            .bind(doc)
            .bind(&group.id)
            .execute(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(CloudError::NotFound(format!("security group {}", group.id)));
        }
        Ok(())
    }

    async fn list_security_groups_by_project(&self, project_id: &str) -> Result<Vec<SecurityGroup>> {
        let rows = sqlx::query("SELECT doc FROM security_groups WHERE project_id = ?")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|r| {
                let doc: String = r.get("doc");
                serde_json::from_str(&doc).map_err(|e| CloudError::Internal(e.to_string()))
            })
            .collect()
    }

    async fn delete_security_group(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM security_groups WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(CloudError::NotFound(format!("security group {id}")));
        }
        Ok(())
    }

    async fn upsert_service(&self, service: &Service) -> Result<()> {
        let doc = serde_json::to_string(service).map_err(|e| CloudError::Internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO services (host, binary, doc) VALUES (?, ?, ?)
             ON CONFLICT(host, binary) DO UPDATE SET doc = excluded.doc",
        )
        .bind(&service.host)
        .bind(&service.binary)
        .bind(doc)
        .execute(&self.pool)
        .await
        .map_err(|e| CloudError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let rows = sqlx::query("SELECT doc FROM services")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|r| {
                let doc: String = r.get("doc");
                serde_json::from_str(&doc).map_err(|e| CloudError::Internal(e.to_string()))
            })
            .collect()
    }

    async fn upsert_zone(&self, zone: &Zone) -> Result<()> {
        let doc = serde_json::to_string(zone).map_err(|e| CloudError::Internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO zones (id, doc) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET doc = excluded.doc",
        )
        .bind(&zone.id)
        .bind(doc)
        .execute(&self.pool)
        .await
        .map_err(|e| CloudError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn list_zones(&self) -> Result<Vec<Zone>> {
        let rows = sqlx::query("SELECT doc FROM zones")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|r| {
                let doc: String = r.get("doc");
                serde_json::from_str(&doc).map_err(|e| CloudError::Internal(e.to_string()))
            })
            .collect()
    }

    async fn delete_zone(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM zones WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(CloudError::NotFound(format!("zone {id}")));
        }
        Ok(())
    }

    async fn insert_quota_reservation(&self, reservation: &QuotaReservation) -> Result<()> {
        let doc = serde_json::to_string(reservation).map_err(|e| CloudError::Internal(e.to_string()))?;
        sqlx::query("INSERT INTO quota_reservations (id, project_id, doc) VALUES (?, ?, ?)")
            .bind(&reservation.id)
            .bind(&reservation.project_id)
            .bind(doc)
            .execute(&self.pool)
            .await
            .map_err(|_| CloudError::Duplicate(format!("reservation {}", reservation.id)))?;
        Ok(())
    }

    async fn delete_quota_reservation(&self, id: &str) -> Result<Option<QuotaReservation>> {
        let row = sqlx::query("SELECT doc FROM quota_reservations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        let Some(row) = row else { return Ok(None) };
        let doc: String = row.get("doc");
        let reservation: QuotaReservation =
            serde_json::from_str(&doc).map_err(|e| CloudError::Internal(e.to_string()))?;
        sqlx::query("DELETE FROM quota_reservations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        Ok(Some(reservation))
    }

    async fn list_expired_reservations(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<QuotaReservation>> {
        let rows = sqlx::query("SELECT doc FROM quota_reservations")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        rows.into_iter()
            .filter_map(|r| {
                let doc: String = r.get("doc");
                serde_json::from_str::<QuotaReservation>(&doc).ok()
            })
            .filter(|r| r.expires_at <= now)
            .map(Ok)
            .collect()
    }

    async fn get_used(&self, project_id: &str, resource: &str) -> Result<i64> {
        let row = sqlx::query("SELECT used FROM quota_counters WHERE project_id = ? AND resource = ?")
            .bind(project_id)
            .bind(resource)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CloudError::Internal(e.to_string()))?;
        Ok(row.map(|r| r.get::<i64, _>("used")).unwrap_or(0))
    }

    async fn adjust_used(&self, project_id: &str, resource: &str, delta: i64) -> Result<i64> {
        sqlx::query(
            "INSERT INTO quota_counters (project_id, resource, used) VALUES (?, ?, ?)
             ON CONFLICT(project_id, resource) DO UPDATE SET used = used + excluded.used",
        )
        .bind(project_id)
        .bind(resource)
        .bind(delta)
        .execute(&self.pool)
        .await
        .map_err(|e| CloudError::Internal(e.to_string()))?;
        self.get_used(project_id, resource).await
    }
}
