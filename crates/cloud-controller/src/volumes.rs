//! CreateVolume / AttachVolume / DetachVolume / CreateSnapshot.
//! `cloud_volume::VolumeController` owns the state machine and
//! quota reservation; this module's job is only the `cast` to the
//! owning volume/compute host the verb contract requires on top of it.

use std::collections::HashMap;

use cloud_core::error::{CloudError, Result};
use cloud_core::model::{Volume, VolumeStatus};
use cloud_core::protocol::{Destination, Envelope, RequestContext};
use cloud_state::StateStore;

use crate::controller::CloudController;

pub async fn create_volume(
    controller: &CloudController,
    ctx: &RequestContext,
    size_gb: Option<u32>,
    snapshot_id: Option<String>,
    host: &str,
) -> Result<Volume> {
    let size_gb = match (&snapshot_id, size_gb) {
        (Some(id), explicit) => {
            let snapshot = controller.store.get_snapshot(id).await?;
            if let Some(requested) = explicit {
                if requested != snapshot.volume_size {
                    return Err(CloudError::ApiError(format!(
                        "requested size {requested} does not match snapshot size {}",
                        snapshot.volume_size
                    )));
                }
            }
            snapshot.volume_size
        }
        (None, Some(explicit)) => explicit,
        (None, None) => return Err(CloudError::ApiError("size_gb or snapshot_id is required".into())),
    };

    let sequence = controller.next_sequence();
    let volume = controller
        .volumes
        .create_volume(&ctx.project_id, &ctx.user_id, size_gb, host, snapshot_id, sequence)
        .await?;

    let mut args = HashMap::new();
    args.insert("volume_id".to_string(), serde_json::json!(volume.id));
    controller
        .dispatcher
        .cast(
            &Destination::Topic("volume".to_string()),
            Envelope {
                method: "create_volume".to_string(),
                args,
                msg_id: None,
                reply_to: None,
                context: ctx.clone(),
            },
        )
        .await?;
    Ok(volume)
}

pub async fn attach_volume(
    controller: &CloudController,
    ctx: &RequestContext,
    volume_id: &str,
    instance_id: &str,
    device: &str,
) -> Result<Volume> {
    let instance = controller.store.get_instance(instance_id).await?;
    let in_use = controller.store.list_volumes_by_project(&ctx.project_id).await?;
    if in_use
        .iter()
        .any(|v| v.instance_uuid.as_deref() == Some(instance_id) && v.mountpoint.as_deref() == Some(device))
    {
        return Err(CloudError::ApiError(format!(
            "device {device} already in use on instance {instance_id}"
        )));
    }

    let volume = controller.volumes.attach_volume(volume_id, instance_id, device).await?;

    let Some(host) = instance.host else {
        return Err(CloudError::ApiError(format!(
            "instance {instance_id} has no assigned host"
        )));
    };
    let mut args = HashMap::new();
    args.insert("volume_id".to_string(), serde_json::json!(volume.id));
    args.insert("mountpoint".to_string(), serde_json::json!(device));
    controller
        .dispatcher
        .cast(
            &Destination::TopicHost("compute".to_string(), host),
            Envelope {
                method: "attach_volume".to_string(),
                args,
                msg_id: None,
                reply_to: None,
                context: ctx.clone(),
            },
        )
        .await?;
    Ok(volume)
}

/// "Blind detach": if the owning instance no longer
/// exists, `cloud_volume::VolumeController::detach_volume` still drives
/// the state machine forward; we simply skip notifying a host that
/// isn't there.
pub async fn detach_volume(controller: &CloudController, ctx: &RequestContext, volume_id: &str) -> Result<Volume> {
    let volume = controller.store.get_volume(volume_id).await?;
    let host = match &volume.instance_uuid {
        Some(instance_id) => controller.store.get_instance(instance_id).await.ok().and_then(|i| i.host),
        None => None,
    };

    let volume = controller.volumes.detach_volume(volume_id).await?;

    if let Some(host) = host {
        let mut args = HashMap::new();
        args.insert("volume_id".to_string(), serde_json::json!(volume.id));
        controller
            .dispatcher
            .cast(
                &Destination::TopicHost("compute".to_string(), host),
                Envelope {
                    method: "detach_volume".to_string(),
                    args,
                    msg_id: None,
                    reply_to: None,
                    context: ctx.clone(),
                },
            )
            .await?;
    }
    Ok(volume)
}

pub async fn create_snapshot(
    controller: &CloudController,
    ctx: &RequestContext,
    volume_id: &str,
    force: bool,
) -> Result<cloud_core::model::Snapshot> {
    let volume = controller.store.get_volume(volume_id).await?;
    if volume.status != VolumeStatus::Available && !force {
        return Err(CloudError::ApiError(format!(
            "volume {volume_id} is {:?}, not available (pass force to override)",
            volume.status
        )));
    }
    let sequence = controller.next_sequence();
    let snapshot = controller.volumes.create_snapshot(volume_id, sequence).await?;

    let Some(host) = volume.host.clone() else {
        return Ok(snapshot);
    };
    let mut args = HashMap::new();
    args.insert("snapshot_id".to_string(), serde_json::json!(snapshot.id));
    controller
        .dispatcher
        .cast(
            &Destination::TopicHost("volume".to_string(), host),
            Envelope {
                method: "create_snapshot".to_string(),
                args,
                msg_id: None,
                reply_to: None,
                context: ctx.clone(),
            },
        )
        .await?;
    Ok(snapshot)
}
