//! Volume Controller (C8): network-attached volume state machine with
//! a per-host target-slot table, covering create/attach/detach/
//! snapshot and blind-detach when the owning instance is already gone.
//!
//! Quota is reserved before any state mutation and only folded into
//! the durable counter once the operation actually lands — same
//! two-phase shape the RPC call-path uses for its own cancellation.

use std::sync::Arc;

use cloud_core::error::{CloudError, Result};
use cloud_core::model::{
    Snapshot, SnapshotStatus, Volume, VolumeStatus, AttachStatus, validate_snapshot_transition,
    validate_volume_transition,
};
use cloud_core::naming::ec2_id;
use cloud_quota::{QuotaEngine, QuotaReservationGuard};
use cloud_state::StateStore;
use tracing::{info, warn};

use crate::targets::TargetTable;

pub struct VolumeController {
    store: Arc<dyn StateStore>,
    quota: Arc<QuotaEngine>,
    targets: TargetTable,
}

impl VolumeController {
    pub fn new(store: Arc<dyn StateStore>, quota: Arc<QuotaEngine>, max_targets_per_host: u32) -> Self {
        VolumeController {
            store,
            quota,
            targets: TargetTable::new(max_targets_per_host),
        }
    }

    /// Creates a volume on `host`: reserves `volumes`/`gigabytes`
    /// quota, claims a target slot, and persists a `Creating` row.
    /// `NoMoreTargets` rolls the reservation back rather than leaving
    /// an orphaned reservation on the table.
    pub async fn create_volume(
        &self,
        project_id: &str,
        user_id: &str,
        size_gb: u32,
        host: &str,
        snapshot_id: Option<String>,
        sequence: u32,
    ) -> Result<Volume> {
        let vol_reservation = self.quota.reserve(project_id, "volumes", 1).await?;
        let vol_guard = QuotaReservationGuard::new(self.quota.clone(), vol_reservation.id.clone());
        let gb_reservation = self.quota.reserve(project_id, "gigabytes", size_gb as i64).await?;
        let gb_guard = QuotaReservationGuard::new(self.quota.clone(), gb_reservation.id.clone());

        let target = self.targets.allocate(host).await?;

        let volume = Volume {
            id: format!("vol-{:08x}", sequence),
            ec2_id: ec2_id("vol", sequence),
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            size_gb,
            status: VolumeStatus::Creating,
            attach_status: AttachStatus::Detached,
            host: Some(host.to_string()),
            instance_uuid: None,
            mountpoint: None,
            snapshot_id,
            iscsi_target_num: Some(target),
        };
        if let Err(e) = self.store.insert_volume(&volume).await {
            self.targets.free(host, target).await;
            return Err(e);
        }

        vol_guard.commit().await?;
        gb_guard.commit().await?;
        info!(volume_id = %volume.id, host, target, "volume created");
        Ok(volume)
    }

    /// Marks a `Creating` volume `Available` once the backing store
    /// has provisioned it.
    pub async fn mark_available(&self, volume_id: &str) -> Result<Volume> {
        let mut volume = self.store.get_volume(volume_id).await?;
        validate_volume_transition(volume.status, VolumeStatus::Available)?;
        volume.status = VolumeStatus::Available;
        volume.validate_invariant()?;
        self.store.update_volume(&volume).await?;
        Ok(volume)
    }

    /// Begins attaching `volume_id` to `instance_uuid` at `mountpoint`.
    pub async fn attach_volume(&self, volume_id: &str, instance_uuid: &str, mountpoint: &str) -> Result<Volume> {
        let mut volume = self.store.get_volume(volume_id).await?;
        validate_volume_transition(volume.status, VolumeStatus::Attaching)?;
        volume.status = VolumeStatus::Attaching;
        volume.instance_uuid = Some(instance_uuid.to_string());
        volume.mountpoint = Some(mountpoint.to_string());
        volume.validate_invariant()?;
        self.store.update_volume(&volume).await?;
        Ok(volume)
    }

    /// Completes an attach once the compute host's hotplug has acked it.
    pub async fn attach_completed(&self, volume_id: &str) -> Result<Volume> {
        let mut volume = self.store.get_volume(volume_id).await?;
        validate_volume_transition(volume.status, VolumeStatus::InUse)?;
        volume.status = VolumeStatus::InUse;
        volume.attach_status = AttachStatus::Attached;
        volume.validate_invariant()?;
        self.store.update_volume(&volume).await?;
        Ok(volume)
    }

    /// Begins detaching an `InUse` volume.
    pub async fn detach_volume(&self, volume_id: &str) -> Result<Volume> {
        let mut volume = self.store.get_volume(volume_id).await?;
        validate_volume_transition(volume.status, VolumeStatus::Detaching)?;
        volume.status = VolumeStatus::Detaching;
        volume.validate_invariant()?;
        self.store.update_volume(&volume).await?;
        Ok(volume)
    }

    /// Completes a detach, returning the volume to `Available`.
    pub async fn detach_completed(&self, volume_id: &str) -> Result<Volume> {
        let mut volume = self.store.get_volume(volume_id).await?;
        validate_volume_transition(volume.status, VolumeStatus::Available)?;
        volume.status = VolumeStatus::Available;
        volume.attach_status = AttachStatus::Detached;
        volume.instance_uuid = None;
        volume.mountpoint = None;
        volume.validate_invariant()?;
        self.store.update_volume(&volume).await?;
        Ok(volume)
    }

    /// Deletes an `Available` volume: frees its target slot and
    /// rolls the project's `volumes`/`gigabytes` usage back. A volume
    /// mid-attach/detach is busy rather than invalid — the caller gets
    /// `VolumeIsBusy` and the record is left exactly as it was — a
    /// locally recovered condition, not transitioned to `Error`.
    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let volume = self.store.get_volume(volume_id).await?;
        match volume.status {
            VolumeStatus::Attaching | VolumeStatus::InUse | VolumeStatus::Detaching => {
                return Err(CloudError::VolumeIsBusy(volume_id.to_string()));
            }
            VolumeStatus::Deleting | VolumeStatus::ErrorDeleting => {
                return Err(CloudError::VolumeIsBusy(volume_id.to_string()));
            }
            VolumeStatus::Available | VolumeStatus::Creating | VolumeStatus::Error => {}
        }

        self.store.delete_volume(volume_id).await?;
        if let (Some(host), Some(target)) = (&volume.host, volume.iscsi_target_num) {
            self.targets.free(host, target).await;
        }
        self.store.adjust_used(&volume.project_id, "volumes", -1).await?;
        self.store
            .adjust_used(&volume.project_id, "gigabytes", -(volume.size_gb as i64))
            .await?;
        info!(volume_id, "volume deleted");
        Ok(())
    }

    /// Creates a `Creating` snapshot row for `volume_id`. The volume
    /// itself is not locked — `I1` does not constrain a volume's
    /// attach state while a snapshot of it is in progress.
    pub async fn create_snapshot(&self, volume_id: &str, sequence: u32) -> Result<Snapshot> {
        let volume = self.store.get_volume(volume_id).await?;
        let snapshot = Snapshot {
            id: format!("snap-{:08x}", sequence),
            ec2_id: ec2_id("snap", sequence),
            volume_id: volume.id.clone(),
            volume_size: volume.size_gb,
            status: SnapshotStatus::Creating,
            progress: 0,
        };
        self.store.insert_snapshot(&snapshot).await?;
        Ok(snapshot)
    }

    /// Marks a snapshot `Available` once the backing copy completes.
    pub async fn mark_snapshot_available(&self, snapshot_id: &str) -> Result<Snapshot> {
        let mut snapshot = self.store.get_snapshot(snapshot_id).await?;
        validate_snapshot_transition(snapshot.status, SnapshotStatus::Available)?;
        snapshot.status = SnapshotStatus::Available;
        snapshot.progress = 100;
        self.store.update_snapshot(&snapshot).await?;
        Ok(snapshot)
    }

    /// Deletes an `Available` snapshot. A snapshot still `Creating` is
    /// busy rather than invalid, matching `delete_volume`'s handling
    /// of an in-flight attach.
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let snapshot = self.store.get_snapshot(snapshot_id).await?;
        if snapshot.status == SnapshotStatus::Creating {
            return Err(CloudError::SnapshotIsBusy(snapshot_id.to_string()));
        }
        self.store.delete_snapshot(snapshot_id).await?;
        Ok(())
    }

    /// Cleans up old, already-`Available` snapshots of a volume,
    /// keeping the `keep_n` most recently created (assumed to be the
    /// tail of `list_snapshots_by_volume`'s natural insertion order) —
    /// a "keep N most recent, wipe the rest" retention policy.
    pub async fn cleanup_old_snapshots(&self, volume_id: &str, keep_n: usize) -> Result<u32> {
        let snapshots = self.store.list_snapshots_by_volume(volume_id).await?;
        let eligible: Vec<_> = snapshots
            .into_iter()
            .filter(|s| s.status == SnapshotStatus::Available)
            .collect();
        if eligible.len() <= keep_n {
            return Ok(0);
        }
        let mut removed = 0;
        for snapshot in &eligible[..eligible.len() - keep_n] {
            match self.delete_snapshot(&snapshot.id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(snapshot_id = %snapshot.id, error = %e, "failed to clean up old snapshot"),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_quota::{QuotaDefaults, QuotaLimits};
    use cloud_state::SqliteStateStore;
    use std::time::Duration;

    async fn controller() -> VolumeController {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        let quota = Arc::new(QuotaEngine::new(
            store.clone(),
            QuotaLimits::new(QuotaDefaults::default()),
            Duration::from_secs(300),
        ));
        VolumeController::new(store, quota, 4)
    }

    #[tokio::test]
    async fn create_volume_persists_available_after_transition() {
        let ctl = controller().await;
        let vol = ctl.create_volume("acme", "bob", 10, "hostA", None, 1).await.unwrap();
        assert_eq!(vol.status, VolumeStatus::Creating);
        assert_eq!(vol.iscsi_target_num, Some(0));

        let vol = ctl.mark_available(&vol.id).await.unwrap();
        assert_eq!(vol.status, VolumeStatus::Available);
    }

    #[tokio::test]
    async fn full_attach_detach_round_trip() {
        let ctl = controller().await;
        let vol = ctl.create_volume("acme", "bob", 10, "hostA", None, 1).await.unwrap();
        let vol = ctl.mark_available(&vol.id).await.unwrap();

        let vol = ctl.attach_volume(&vol.id, "i-1", "/dev/vdb").await.unwrap();
        assert_eq!(vol.status, VolumeStatus::Attaching);
        let vol = ctl.attach_completed(&vol.id).await.unwrap();
        assert_eq!(vol.status, VolumeStatus::InUse);
        assert_eq!(vol.attach_status, AttachStatus::Attached);

        let vol = ctl.detach_volume(&vol.id).await.unwrap();
        assert_eq!(vol.status, VolumeStatus::Detaching);
        let vol = ctl.detach_completed(&vol.id).await.unwrap();
        assert_eq!(vol.status, VolumeStatus::Available);
        assert!(vol.instance_uuid.is_none());
    }

    #[tokio::test]
    async fn delete_busy_volume_is_recovered_locally() {
        let ctl = controller().await;
        let vol = ctl.create_volume("acme", "bob", 10, "hostA", None, 1).await.unwrap();
        let vol = ctl.mark_available(&vol.id).await.unwrap();
        let vol = ctl.attach_volume(&vol.id, "i-1", "/dev/vdb").await.unwrap();

        let err = ctl.delete_volume(&vol.id).await;
        assert!(matches!(err, Err(CloudError::VolumeIsBusy(_))));

        // The record is untouched — still Attaching, not Error.
        let reloaded = ctl.store.get_volume(&vol.id).await.unwrap();
        assert_eq!(reloaded.status, VolumeStatus::Attaching);
    }

    #[tokio::test]
    async fn delete_volume_frees_target_slot_and_quota() {
        let ctl = controller().await;
        let vol = ctl.create_volume("acme", "bob", 10, "hostA", None, 1).await.unwrap();
        assert_eq!(ctl.quota.used("acme", "volumes").await.unwrap(), 1);
        assert_eq!(ctl.quota.used("acme", "gigabytes").await.unwrap(), 10);

        ctl.delete_volume(&vol.id).await.unwrap();
        assert_eq!(ctl.quota.used("acme", "volumes").await.unwrap(), 0);
        assert_eq!(ctl.quota.used("acme", "gigabytes").await.unwrap(), 0);

        // The freed slot 0 is immediately reusable.
        let vol2 = ctl.create_volume("acme", "bob", 5, "hostA", None, 2).await.unwrap();
        assert_eq!(vol2.iscsi_target_num, Some(0));
    }

    #[tokio::test]
    async fn exhausted_target_table_rolls_back_quota_reservation() {
        let ctl = controller().await;
        for i in 0..4 {
            ctl.create_volume("acme", "bob", 1, "hostA", None, i).await.unwrap();
        }
        let err = ctl.create_volume("acme", "bob", 1, "hostA", None, 99).await;
        assert!(matches!(err, Err(CloudError::NoMoreTargets(_))));

        // Give the guards' spawned rollback tasks a chance to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctl.quota.used("acme", "volumes").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn delete_snapshot_while_creating_is_busy() {
        let ctl = controller().await;
        let vol = ctl.create_volume("acme", "bob", 10, "hostA", None, 1).await.unwrap();
        let snap = ctl.create_snapshot(&vol.id, 1).await.unwrap();
        assert_eq!(snap.status, SnapshotStatus::Creating);

        let err = ctl.delete_snapshot(&snap.id).await;
        assert!(matches!(err, Err(CloudError::SnapshotIsBusy(_))));
    }

    #[tokio::test]
    async fn cleanup_old_snapshots_keeps_newest_n() {
        let ctl = controller().await;
        let vol = ctl.create_volume("acme", "bob", 10, "hostA", None, 1).await.unwrap();
        for i in 0..3 {
            let snap = ctl.create_snapshot(&vol.id, i).await.unwrap();
            ctl.mark_snapshot_available(&snap.id).await.unwrap();
        }

        let removed = ctl.cleanup_old_snapshots(&vol.id, 1).await.unwrap();
        assert_eq!(removed, 2);
        let remaining = ctl.store.list_snapshots_by_volume(&vol.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
