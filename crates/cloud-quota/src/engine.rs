//! Two-phase `reserve -> commit|rollback` quota engine (C12). A
//! reservation never folds into the durable `used` counter until
//! `commit`; an unconfirmed reservation expires after `reservation_ttl`
//! so a crashed handler cannot leak quota.
//!
//! `cloud-state::StateStore` only exposes a generic per-`(project,
//! resource)` counter, not a dedicated "outstanding reservations" sum —
//! rather than widen that trait, this engine tracks outstanding
//! reservations as a second counter under a derived resource key
//! (`"<resource>__reserved"`), reusing `get_used`/`adjust_used`
//! unchanged. Concurrent `reserve` calls against the same
//! `(project, resource)` are additionally serialized by an in-process
//! per-key lock, the same shape `cloud-volume`'s target-slot table
//! uses per host.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cloud_core::error::{CloudError, Result};
use cloud_core::model::QuotaReservation;
use cloud_state::StateStore;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::limits::QuotaLimits;

fn reserved_key(resource: &str) -> String {
    format!("{resource}__reserved")
}

pub struct QuotaEngine {
    store: Arc<dyn StateStore>,
    limits: QuotaLimits,
    reservation_ttl: Duration,
    key_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl QuotaEngine {
    pub fn new(store: Arc<dyn StateStore>, limits: QuotaLimits, reservation_ttl: Duration) -> Self {
        QuotaEngine {
            store,
            limits,
            reservation_ttl,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, project_id: &str, resource: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks
            .entry((project_id.to_string(), resource.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Reserves `delta` units of `resource` for `project_id`. Fails
    /// `QuotaExceeded` if `used + outstanding_reservations + delta`
    /// would exceed the project's limit (I5).
    pub async fn reserve(&self, project_id: &str, resource: &str, delta: i64) -> Result<QuotaReservation> {
        let limit = self
            .limits
            .limit_for(project_id, resource)
            .ok_or_else(|| CloudError::Internal(format!("no quota limit configured for resource {resource}")))?;

        let key_lock = self.lock_for(project_id, resource).await;
        let _guard = key_lock.lock().await;

        let used = self.store.get_used(project_id, resource).await?;
        let reserved = self.store.get_used(project_id, &reserved_key(resource)).await?;
        let requested = used + reserved + delta;
        if requested > limit as i64 {
            return Err(CloudError::QuotaExceeded {
                resource: resource.to_string(),
                used: (used + reserved).max(0) as u64,
                requested: delta.max(0) as u64,
                limit,
            });
        }

        self.store.adjust_used(project_id, &reserved_key(resource), delta).await?;
        let reservation = QuotaReservation {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            resource: resource.to_string(),
            delta,
            expires_at: cloud_core::time::utc_now() + chrono::Duration::from_std(self.reservation_ttl).unwrap_or(chrono::Duration::seconds(300)),
        };
        self.store.insert_quota_reservation(&reservation).await?;
        Ok(reservation)
    }

    /// Folds a reservation's delta into the durable `used` counter and
    /// releases the outstanding-reservation slot it held.
    pub async fn commit(&self, reservation_id: &str) -> Result<()> {
        let reservation = self
            .store
            .delete_quota_reservation(reservation_id)
            .await?
            .ok_or_else(|| CloudError::NotFound(format!("quota reservation {reservation_id}")))?;
        self.store
            .adjust_used(&reservation.project_id, &reservation.resource, reservation.delta)
            .await?;
        self.store
            .adjust_used(&reservation.project_id, &reserved_key(&reservation.resource), -reservation.delta)
            .await?;
        Ok(())
    }

    /// Drops a reservation without folding it into `used` — the
    /// operation it was guarding failed and any partial side effects
    /// were already undone by the caller.
    pub async fn rollback(&self, reservation_id: &str) -> Result<()> {
        let reservation = match self.store.delete_quota_reservation(reservation_id).await? {
            Some(r) => r,
            // Idempotent: a reservation already committed or rolled
            // back (or swept by the TTL reaper) is not an error.
            None => return Ok(()),
        };
        self.store
            .adjust_used(&reservation.project_id, &reserved_key(&reservation.resource), -reservation.delta)
            .await?;
        Ok(())
    }

    /// Expires reservations past their TTL, releasing the outstanding
    /// slot each held. Same shape as a TTL-bounded idle-tracker sweep:
    /// owned by one background task, reads a snapshot, acts on it.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = cloud_core::time::utc_now();
        let expired = self.store.list_expired_reservations(now).await?;
        let mut swept = 0;
        for reservation in expired {
            match self.store.delete_quota_reservation(&reservation.id).await {
                Ok(Some(r)) => {
                    self.store
                        .adjust_used(&r.project_id, &reserved_key(&r.resource), -r.delta)
                        .await?;
                    warn!(
                        reservation_id = %r.id,
                        project_id = %r.project_id,
                        resource = %r.resource,
                        "quota reservation expired unconfirmed, rolled back"
                    );
                    swept += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to sweep expired quota reservation"),
            }
        }
        if swept > 0 {
            info!(swept, "quota sweep released expired reservations");
        }
        Ok(swept)
    }

    pub async fn used(&self, project_id: &str, resource: &str) -> Result<i64> {
        self.store.get_used(project_id, resource).await
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::QuotaDefaults;
    use cloud_state::SqliteStateStore;

    async fn engine() -> QuotaEngine {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        QuotaEngine::new(store, QuotaLimits::new(QuotaDefaults::default()), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn reserve_commit_folds_into_used() {
        let engine = engine().await;
        let r = engine.reserve("acme", "instances", 2).await.unwrap();
        assert_eq!(engine.used("acme", "instances").await.unwrap(), 0);
        engine.commit(&r.id).await.unwrap();
        assert_eq!(engine.used("acme", "instances").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reserve_rollback_leaves_used_unchanged() {
        let engine = engine().await;
        let r = engine.reserve("acme", "instances", 2).await.unwrap();
        engine.rollback(&r.id).await.unwrap();
        assert_eq!(engine.used("acme", "instances").await.unwrap(), 0);
        // Reserving again to the limit must succeed — the rollback
        // released the outstanding slot.
        engine.reserve("acme", "instances", 10).await.unwrap();
    }

    #[tokio::test]
    async fn reserve_exceeding_limit_fails() {
        let engine = engine().await;
        let result = engine.reserve("acme", "instances", 11).await;
        assert!(matches!(result, Err(CloudError::QuotaExceeded { .. })));
    }

    #[tokio::test]
    async fn outstanding_reservation_counts_against_limit() {
        let engine = engine().await;
        engine.reserve("acme", "instances", 10).await.unwrap();
        let second = engine.reserve("acme", "instances", 1).await;
        assert!(matches!(second, Err(CloudError::QuotaExceeded { .. })));
    }

    #[tokio::test]
    async fn rollback_of_unknown_reservation_is_idempotent() {
        let engine = engine().await;
        engine.rollback("does-not-exist").await.unwrap();
    }

    #[tokio::test]
    async fn commit_of_unknown_reservation_is_not_found() {
        let engine = engine().await;
        assert!(matches!(engine.commit("does-not-exist").await, Err(CloudError::NotFound(_))));
    }

    #[tokio::test]
    async fn sweep_releases_expired_reservations() {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        let engine = QuotaEngine::new(
            store.clone(),
            QuotaLimits::new(QuotaDefaults::default()),
            Duration::from_secs(0),
        );
        let r = engine.reserve("acme", "instances", 5).await.unwrap();
        // TTL of zero means the reservation is already expired.
        let swept = engine.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
        // The released slot allows a fresh reservation up to the full limit.
        engine.reserve("acme", "instances", 10).await.unwrap();
        assert!(engine.commit(&r.id).await.is_err());
    }
}
