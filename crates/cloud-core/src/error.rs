//! Error taxonomy. Every control-plane operation that can fail
//! in a way the caller must distinguish returns a `CloudError`; ad-hoc
//! orchestration glue (the CLI, background loops) uses `anyhow` on top.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("api error: {0}")]
    ApiError(String),

    #[error("authentication failure: {0}")]
    AuthFailure(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("quota exceeded: {resource} (used={used}, requested={requested}, limit={limit})")]
    QuotaExceeded {
        resource: String,
        used: u64,
        requested: u64,
        limit: u64,
    },

    #[error("rpc timeout after {0:?}")]
    RpcTimeout(std::time::Duration),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("volume is busy: {0}")]
    VolumeIsBusy(String),

    #[error("snapshot is busy: {0}")]
    SnapshotIsBusy(String),

    #[error("no more target slots on host {0}")]
    NoMoreTargets(String),

    #[error("no more addresses available in pool")]
    NoMoreAddresses,

    #[error("no more floating ips available in pool")]
    NoMoreFloatingIps,

    #[error("malformed directory entry: {0}")]
    MalformedEntry(String),

    #[error("unknown signature version: {0}")]
    UnknownSignatureVersion(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CloudError {
    /// EC2-style error code, for rendering into the XML wire response.
    pub fn ec2_code(&self) -> &'static str {
        match self {
            CloudError::NotFound(_) => "InvalidResource.NotFound",
            CloudError::Duplicate(_) => "InvalidResource.Duplicate",
            CloudError::ApiError(_) => "ApiError",
            CloudError::AuthFailure(_) => "AuthFailure",
            CloudError::Unauthorized(_) => "Unauthorized",
            CloudError::QuotaExceeded { .. } => "QuotaExceeded",
            CloudError::RpcTimeout(_) => "RpcTimeout",
            CloudError::ServiceUnavailable(_) => "ServiceUnavailable",
            CloudError::VolumeIsBusy(_) => "VolumeIsBusy",
            CloudError::SnapshotIsBusy(_) => "SnapshotIsBusy",
            CloudError::NoMoreTargets(_) => "NoMoreTargets",
            CloudError::NoMoreAddresses => "NoMoreAddresses",
            CloudError::NoMoreFloatingIps => "NoMoreFloatingIps",
            CloudError::MalformedEntry(_) => "MalformedEntry",
            CloudError::UnknownSignatureVersion(_) => "UnknownSignatureVersion",
            CloudError::Internal(_) => "InternalError",
        }
    }

    /// HTTP status to pair with the EC2 error code.
    pub fn http_status(&self) -> u16 {
        match self {
            CloudError::NotFound(_) => 404,
            CloudError::Duplicate(_) => 409,
            CloudError::ApiError(_) => 400,
            CloudError::AuthFailure(_) => 401,
            CloudError::Unauthorized(_) => 403,
            CloudError::QuotaExceeded { .. } => 400,
            CloudError::RpcTimeout(_) | CloudError::ServiceUnavailable(_) => 503,
            CloudError::VolumeIsBusy(_) | CloudError::SnapshotIsBusy(_) => 409,
            CloudError::NoMoreTargets(_)
            | CloudError::NoMoreAddresses
            | CloudError::NoMoreFloatingIps => 409,
            CloudError::MalformedEntry(_) => 500,
            CloudError::UnknownSignatureVersion(_) => 400,
            CloudError::Internal(_) => 500,
        }
    }

    /// Idempotent verbs (terminate, delete, detach) treat a missing
    /// entity as success rather than propagating NotFound.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }

    /// VolumeIsBusy/SnapshotIsBusy are recovered locally: the caller
    /// should leave the entity in its prior state, not mark it `error`.
    pub fn is_recoverable_busy(&self) -> bool {
        matches!(
            self,
            CloudError::VolumeIsBusy(_) | CloudError::SnapshotIsBusy(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let e = CloudError::NotFound("i-deadbeef".into());
        assert_eq!(e.http_status(), 404);
        assert_eq!(e.ec2_code(), "InvalidResource.NotFound");
        assert!(e.is_not_found());
    }

    #[test]
    fn busy_errors_are_recoverable() {
        assert!(CloudError::VolumeIsBusy("vol-1".into()).is_recoverable_busy());
        assert!(CloudError::SnapshotIsBusy("snap-1".into()).is_recoverable_busy());
        assert!(!CloudError::Internal("x".into()).is_recoverable_busy());
    }

    #[test]
    fn quota_exceeded_reports_breakdown() {
        let e = CloudError::QuotaExceeded {
            resource: "instances".into(),
            used: 10,
            requested: 2,
            limit: 10,
        };
        assert!(format!("{}", e).contains("instances"));
    }
}
