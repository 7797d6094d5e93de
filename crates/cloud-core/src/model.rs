//! Entities from the data model. Attributes are semantic, not
//! physical — `cloud-state` maps these onto SQL rows.

use serde::{Deserialize, Serialize};

use crate::error::{CloudError, Result};

// ---------------------------------------------------------------------
// Identity (C1) entities
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub access_key: String,
    pub secret_key: String,
    pub admin: bool,
    pub key_pairs: Vec<KeyPair>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPair {
    pub owner_user_id: String,
    pub name: String,
    pub public_key: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub manager_user_id: String,
    pub description: String,
    pub member_user_ids: Vec<String>,
    pub vpn_ip: Option<String>,
    pub vpn_port: Option<u16>,
}

impl Project {
    /// Invariant: `manager_user_id ∈ member_user_ids`.
    pub fn validate(&self) -> Result<()> {
        if !self.member_user_ids.iter().any(|m| m == &self.manager_user_id) {
            return Err(CloudError::ApiError(format!(
                "project {} manager {} is not a member",
                self.id, self.manager_user_id
            )));
        }
        Ok(())
    }
}

/// Closed set of role names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    CloudAdmin,
    ItSec,
    SysAdmin,
    NetAdmin,
    Developer,
    ProjectManager,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleBinding {
    pub user_id: String,
    pub role: Role,
    /// Global if absent.
    pub project_id: Option<String>,
}

// ---------------------------------------------------------------------
// Instance (C10) lifecycle
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Scheduling,
    Networking,
    Building,
    Running,
    Rebooting,
    Stopping,
    Stopped,
    Starting,
    Rescued,
    Terminating,
    Deleted,
    Error,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Canonical instance state machine. `error` is terminal
/// unless an admin explicitly resets it (modeled as a caller-supplied
/// `allow_admin_reset` flag at the call site, not encoded here).
pub fn validate_instance_transition(from: InstanceStatus, to: InstanceStatus) -> Result<()> {
    use InstanceStatus::*;
    let ok = match (from, to) {
        (Pending, Scheduling) => true,
        (Scheduling, Networking) => true,
        (Scheduling, Building) => true,
        (Networking, Building) => true,
        (Building, Running) => true,
        (Running, Rebooting) => true,
        (Rebooting, Running) => true,
        (Running, Stopping) => true,
        (Stopping, Stopped) => true,
        (Stopped, Starting) => true,
        (Starting, Running) => true,
        (_, Terminating) => !matches!(from, Deleted),
        (Terminating, Deleted) => true,
        (_, Error) => !matches!(from, Deleted | Error),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(CloudError::ApiError(format!(
            "illegal instance transition {:?} -> {:?}",
            from, to
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub uuid: String,
    pub ec2_id: String,
    pub project_id: String,
    pub user_id: String,
    pub image_ref: String,
    pub kernel_ref: Option<String>,
    pub ramdisk_ref: Option<String>,
    pub instance_type_id: String,
    pub reservation_id: String,
    pub launch_time: chrono::DateTime<chrono::Utc>,
    pub state: InstanceStatus,
    pub state_description: String,
    pub host: Option<String>,
    pub mac: String,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub key_name: Option<String>,
    pub key_data: Option<String>,
    pub root_device_name: String,
    pub block_device_mapping: Vec<BlockDeviceMapping>,
    pub security_group_ids: Vec<String>,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BdmSource {
    Snapshot,
    Volume,
    Blank,
    Ephemeral,
    Swap,
    NoDevice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    pub instance_id: String,
    pub device_name: String,
    pub source: BdmSource,
    pub size_gb: Option<u32>,
    pub delete_on_termination: bool,
    pub virtual_name: Option<String>,
}

// ---------------------------------------------------------------------
// Volume / Snapshot (C8) lifecycle
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    Creating,
    Available,
    Attaching,
    InUse,
    Detaching,
    Deleting,
    Error,
    ErrorDeleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachStatus {
    Detached,
    Attached,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub ec2_id: String,
    pub project_id: String,
    pub user_id: String,
    pub size_gb: u32,
    pub status: VolumeStatus,
    pub attach_status: AttachStatus,
    pub host: Option<String>,
    pub instance_uuid: Option<String>,
    pub mountpoint: Option<String>,
    pub snapshot_id: Option<String>,
    pub iscsi_target_num: Option<u32>,
}

impl Volume {
    /// Invariant I1: `(status, attach_status, instance_uuid, mountpoint)`
    /// is one of four legal combinations.
    pub fn validate_invariant(&self) -> Result<()> {
        use AttachStatus::*;
        use VolumeStatus::*;
        let legal = match (self.status, self.attach_status) {
            (Available, Detached) => self.instance_uuid.is_none() && self.mountpoint.is_none(),
            (Attaching, Detached) => self.instance_uuid.is_some() && self.mountpoint.is_some(),
            (InUse, Attached) => self.instance_uuid.is_some() && self.mountpoint.is_some(),
            (Detaching, Attached) => self.instance_uuid.is_some() && self.mountpoint.is_some(),
            // Transitional/terminal statuses (creating, deleting, error*)
            // do not constrain attach_status directly.
            (Creating, _) | (Deleting, _) | (Error, _) | (ErrorDeleting, _) => true,
            _ => false,
        };
        if legal {
            Ok(())
        } else {
            Err(CloudError::Internal(format!(
                "volume {} violates I1: status={:?} attach_status={:?} instance={:?} mountpoint={:?}",
                self.id, self.status, self.attach_status, self.instance_uuid, self.mountpoint
            )))
        }
    }
}

/// Legal volume status transitions. Full deletion (`Deleting` -> row
/// removed) is handled by the caller dropping the record, not by a
/// `Deleted` status value.
pub fn validate_volume_transition(from: VolumeStatus, to: VolumeStatus) -> Result<()> {
    use VolumeStatus::*;
    let ok = matches!(
        (from, to),
        (Creating, Available)
            | (Available, Attaching)
            | (Attaching, InUse)
            | (InUse, Detaching)
            | (Detaching, Available)
            | (Available, Deleting)
            | (Creating, Error)
            | (Deleting, ErrorDeleting)
    );
    if ok {
        Ok(())
    } else {
        Err(CloudError::ApiError(format!(
            "illegal volume transition {:?} -> {:?}",
            from, to
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Creating,
    Available,
    Deleting,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub ec2_id: String,
    pub volume_id: String,
    pub volume_size: u32,
    pub status: SnapshotStatus,
    pub progress: u8,
}

pub fn validate_snapshot_transition(from: SnapshotStatus, to: SnapshotStatus) -> Result<()> {
    use SnapshotStatus::*;
    let ok = matches!(
        (from, to),
        (Creating, Available) | (Creating, Error) | (Available, Deleting)
    );
    if ok {
        Ok(())
    } else {
        Err(CloudError::ApiError(format!(
            "illegal snapshot transition {:?} -> {:?}",
            from, to
        )))
    }
}

// ---------------------------------------------------------------------
// Networking (C6) entities
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixedIpState {
    Free,
    Allocated,
    Leased,
    Released,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedIp {
    pub address: String,
    pub network_id: String,
    pub instance_id: Option<String>,
    pub state: FixedIpState,
    pub reserved: bool,
    pub virtual_interface_id: Option<String>,
}

pub fn validate_fixed_ip_transition(from: FixedIpState, to: FixedIpState) -> Result<()> {
    use FixedIpState::*;
    let ok = matches!(
        (from, to),
        (Free, Allocated) | (Allocated, Leased) | (Leased, Released) | (Released, Free)
    );
    if ok {
        Ok(())
    } else {
        Err(CloudError::ApiError(format!(
            "illegal fixed ip transition {:?} -> {:?}",
            from, to
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloatingIp {
    pub address: String,
    pub host: String,
    pub project_id: Option<String>,
    pub fixed_ip_id: Option<String>,
    pub auto_assigned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub protocol: Protocol,
    pub from_port: i32,
    pub to_port: i32,
    pub cidr: Option<String>,
    pub source_group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub description: String,
    pub rules: Vec<SecurityGroupRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderFirewallRule {
    pub protocol: Protocol,
    pub from_port: i32,
    pub to_port: i32,
    pub cidr: String,
}

// ---------------------------------------------------------------------
// Services & zones (C9)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub host: String,
    pub binary: String,
    pub topic: String,
    pub availability_zone: String,
    pub report_count: u64,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    pub disabled: bool,
    pub capabilities: std::collections::HashMap<String, f64>,
}

impl Service {
    /// A service is "up" iff `now - last_seen < liveness_window`.
    pub fn is_up(&self, now: chrono::DateTime<chrono::Utc>, liveness_window: chrono::Duration) -> bool {
        now - self.last_seen < liveness_window
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub name: Option<String>,
    pub capabilities: std::collections::HashMap<String, f64>,
    pub is_active: bool,
    pub attempt: u32,
    pub last_seen: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------
// Quota (C12)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaReservation {
    pub id: String,
    pub project_id: String,
    pub resource: String,
    pub delta: i64,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_invariant_rejects_manager_not_member() {
        let p = Project {
            id: "acme".into(),
            name: "Acme".into(),
            manager_user_id: "bob".into(),
            description: "".into(),
            member_user_ids: vec!["alice".into()],
            vpn_ip: None,
            vpn_port: None,
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn project_invariant_accepts_manager_member() {
        let p = Project {
            id: "acme".into(),
            name: "Acme".into(),
            manager_user_id: "bob".into(),
            description: "".into(),
            member_user_ids: vec!["alice".into(), "bob".into()],
            vpn_ip: None,
            vpn_port: None,
        };
        assert!(p.validate().is_ok());
    }

    #[test]
    fn instance_canonical_path() {
        use InstanceStatus::*;
        validate_instance_transition(Pending, Scheduling).unwrap();
        validate_instance_transition(Scheduling, Building).unwrap();
        validate_instance_transition(Building, Running).unwrap();
        validate_instance_transition(Running, Stopping).unwrap();
        validate_instance_transition(Stopping, Stopped).unwrap();
        validate_instance_transition(Stopped, Starting).unwrap();
        validate_instance_transition(Starting, Running).unwrap();
        validate_instance_transition(Running, Terminating).unwrap();
        validate_instance_transition(Terminating, Deleted).unwrap();
    }

    #[test]
    fn instance_illegal_transition_rejected() {
        use InstanceStatus::*;
        assert!(validate_instance_transition(Pending, Running).is_err());
        assert!(validate_instance_transition(Deleted, Running).is_err());
        assert!(validate_instance_transition(Deleted, Terminating).is_err());
    }

    #[test]
    fn instance_any_state_can_error_except_deleted() {
        use InstanceStatus::*;
        validate_instance_transition(Pending, Error).unwrap();
        validate_instance_transition(Running, Error).unwrap();
        assert!(validate_instance_transition(Deleted, Error).is_err());
    }

    #[test]
    fn volume_i1_invariant_round_trip() {
        use AttachStatus::*;
        use VolumeStatus::*;
        let v = Volume {
            id: "vol-1".into(),
            ec2_id: "vol-00000001".into(),
            project_id: "acme".into(),
            user_id: "bob".into(),
            size_gb: 1,
            status: Available,
            attach_status: Detached,
            host: None,
            instance_uuid: None,
            mountpoint: None,
            snapshot_id: None,
            iscsi_target_num: None,
        };
        v.validate_invariant().unwrap();

        let mut attaching = v.clone();
        attaching.status = Attaching;
        attaching.attach_status = Detached;
        attaching.instance_uuid = Some("i-1".into());
        attaching.mountpoint = Some("/dev/sdf".into());
        attaching.validate_invariant().unwrap();

        let mut bad = v.clone();
        bad.status = InUse;
        bad.attach_status = Detached;
        assert!(bad.validate_invariant().is_err());
    }

    #[test]
    fn volume_transition_attach_detach_cycle() {
        use VolumeStatus::*;
        validate_volume_transition(Creating, Available).unwrap();
        validate_volume_transition(Available, Attaching).unwrap();
        validate_volume_transition(Attaching, InUse).unwrap();
        validate_volume_transition(InUse, Detaching).unwrap();
        validate_volume_transition(Detaching, Available).unwrap();
        assert!(validate_volume_transition(InUse, Available).is_err());
    }

    #[test]
    fn snapshot_transitions() {
        use SnapshotStatus::*;
        validate_snapshot_transition(Creating, Available).unwrap();
        validate_snapshot_transition(Available, Deleting).unwrap();
        assert!(validate_snapshot_transition(Deleting, Available).is_err());
    }

    #[test]
    fn fixed_ip_lifecycle() {
        use FixedIpState::*;
        validate_fixed_ip_transition(Free, Allocated).unwrap();
        validate_fixed_ip_transition(Allocated, Leased).unwrap();
        validate_fixed_ip_transition(Leased, Released).unwrap();
        validate_fixed_ip_transition(Released, Free).unwrap();
        assert!(validate_fixed_ip_transition(Free, Leased).is_err());
    }

    #[test]
    fn service_liveness_window() {
        let now = chrono::Utc::now();
        let svc = Service {
            host: "h1".into(),
            binary: "cloud-compute".into(),
            topic: "compute".into(),
            availability_zone: "nova".into(),
            report_count: 1,
            last_seen: now - chrono::Duration::seconds(5),
            disabled: false,
            capabilities: Default::default(),
        };
        assert!(svc.is_up(now, chrono::Duration::seconds(30)));
        assert!(!svc.is_up(now, chrono::Duration::seconds(1)));
    }
}
