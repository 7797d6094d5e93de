//! RunInstances / TerminateInstances / RebootInstances / Start-StopInstances
//! Quota is reserved before any row is written and rolled
//! back on any failure in between — the same two-phase discipline
//! `cloud_volume::VolumeController::create_volume` uses for its own
//! quota reservations.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use cloud_core::error::{CloudError, Result};
use cloud_core::model::{
    validate_instance_transition, BlockDeviceMapping, Instance, InstanceStatus,
};
use cloud_core::naming::{ec2_id, generate_instance_id, generate_mac, generate_reservation_id};
use cloud_core::protocol::{Destination, Envelope, RequestContext};
use cloud_quota::QuotaReservationGuard;
use cloud_state::StateStore;
use tracing::{info, warn};

use crate::controller::CloudController;
use crate::image::ImageService;

/// Static `instance_type -> (vcpus, ram_mb)` table (flavors are
/// operator-configured in the original; a fixed table matches this
/// repo's closed, in-process configuration model).
fn instance_type_resources(instance_type: &str) -> Result<(u32, u32)> {
    match instance_type {
        "m1.tiny" => Ok((1, 512)),
        "m1.small" => Ok((1, 2048)),
        "m1.medium" => Ok((2, 4096)),
        "m1.large" => Ok((4, 8192)),
        "m1.xlarge" => Ok((8, 16384)),
        other => Err(CloudError::ApiError(format!("unknown instance type: {other}"))),
    }
}

pub struct RunInstancesRequest {
    pub image_ref: String,
    pub min_count: u32,
    pub max_count: u32,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub security_group_ids: Vec<String>,
    pub user_data: Option<String>,
    pub block_device_mapping: Vec<BlockDeviceMapping>,
    pub kernel_ref: Option<String>,
    pub ramdisk_ref: Option<String>,
}

/// Reserves quota for as many as `max_count`; if that is refused,
/// retries at `min_count` (EC2 semantics: launch "at least min, as
/// many as max"). Both reservations, on success, are bundled under one
/// guard per resource so a later failure rolls all of them back.
async fn reserve_instance_quota(
    controller: &CloudController,
    project_id: &str,
    min_count: u32,
    max_count: u32,
    vcpus: u32,
    ram_mb: u32,
) -> Result<(u32, Vec<QuotaReservationGuard>)> {
    async fn reserve_n(
        controller: &CloudController,
        project_id: &str,
        n: u32,
        vcpus: u32,
        ram_mb: u32,
    ) -> Result<Vec<QuotaReservationGuard>> {
        let instances = controller.quota.reserve(project_id, "instances", n as i64).await?;
        let instances_guard = QuotaReservationGuard::new(controller.quota.clone(), instances.id.clone());
        let cores = controller
            .quota
            .reserve(project_id, "cores", (n * vcpus) as i64)
            .await?;
        let cores_guard = QuotaReservationGuard::new(controller.quota.clone(), cores.id.clone());
        let ram = controller
            .quota
            .reserve(project_id, "ram_mb", (n * ram_mb) as i64)
            .await?;
        let ram_guard = QuotaReservationGuard::new(controller.quota.clone(), ram.id.clone());
        Ok(vec![instances_guard, cores_guard, ram_guard])
    }

    match reserve_n(controller, project_id, max_count, vcpus, ram_mb).await {
        Ok(guards) => Ok((max_count, guards)),
        Err(CloudError::QuotaExceeded { .. }) if min_count < max_count => {
            let guards = reserve_n(controller, project_id, min_count, vcpus, ram_mb).await?;
            Ok((min_count, guards))
        }
        Err(e) => Err(e),
    }
}

pub async fn run_instances(
    controller: &CloudController,
    ctx: &RequestContext,
    req: RunInstancesRequest,
) -> Result<Vec<Instance>> {
    if req.min_count == 0 || req.max_count == 0 || req.min_count > req.max_count {
        return Err(CloudError::ApiError(
            "min_count must be <= max_count and both non-zero".into(),
        ));
    }
    let image = controller.images.get(&req.image_ref).await?;
    if image.owner_project_id != ctx.project_id && !image.is_public && !image.shared_with.iter().any(|p| p == &ctx.project_id) {
        return Err(CloudError::Unauthorized(format!(
            "project {} has no launch permission on {}",
            ctx.project_id, req.image_ref
        )));
    }
    if image.state != crate::image::ImageState::Available {
        return Err(CloudError::ApiError(format!(
            "image {} is not available for launch",
            req.image_ref
        )));
    }
    let (vcpus, ram_mb) = instance_type_resources(&req.instance_type)?;

    let (count, _guards) =
        reserve_instance_quota(controller, &ctx.project_id, req.min_count, req.max_count, vcpus, ram_mb).await?;

    let reservation_id = generate_reservation_id();
    let network_id = format!("net-{}", ctx.project_id);
    let mut instances = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let sequence = controller.next_sequence();
        let uuid = generate_instance_id();
        let mac = generate_mac(sequence);
        let fixed_ip = match controller.network.allocate_fixed_ip(&network_id, &uuid).await {
            Ok(fixed_ip) => fixed_ip,
            Err(e) => {
                rollback_partial_launch(controller, &instances).await;
                return Err(e);
            }
        };

        let instance = Instance {
            id: uuid.clone(),
            uuid: uuid.clone(),
            ec2_id: ec2_id("i", sequence),
            project_id: ctx.project_id.clone(),
            user_id: ctx.user_id.clone(),
            image_ref: req.image_ref.clone(),
            kernel_ref: req.kernel_ref.clone(),
            ramdisk_ref: req.ramdisk_ref.clone(),
            instance_type_id: req.instance_type.clone(),
            reservation_id: reservation_id.clone(),
            launch_time: Utc::now(),
            state: InstanceStatus::Scheduling,
            state_description: "scheduling".to_string(),
            host: None,
            mac,
            private_ip: Some(fixed_ip.address.clone()),
            public_ip: None,
            key_name: req.key_name.clone(),
            key_data: None,
            root_device_name: "/dev/sda1".to_string(),
            block_device_mapping: req.block_device_mapping.clone(),
            security_group_ids: req.security_group_ids.clone(),
            display_name: uuid.clone(),
        };
        if let Err(e) = controller.store.insert_instance(&instance).await {
            rollback_partial_launch(controller, &instances).await;
            return Err(e);
        }

        let mut args = HashMap::new();
        args.insert("instance_id".to_string(), serde_json::json!(instance.id));
        let cast_result = controller
            .dispatcher
            .cast(
                &Destination::Topic("compute".to_string()),
                Envelope {
                    method: "run_instance".to_string(),
                    args,
                    msg_id: None,
                    reply_to: None,
                    context: ctx.clone(),
                },
            )
            .await;
        if let Err(e) = cast_result {
            instances.push(instance);
            rollback_partial_launch(controller, &instances).await;
            return Err(e);
        }

        instances.push(instance);
    }

    for guard in _guards {
        guard.commit().await?;
    }
    info!(reservation_id = %reservation_id, count, "instances launched");
    Ok(instances)
}

/// Deletes every instance already persisted earlier in a batch that
/// failed partway through. `_guards` rolls back the quota reservation
/// for the whole batch on drop; this undoes the rows those guards no
/// longer back.
async fn rollback_partial_launch(controller: &CloudController, instances: &[Instance]) {
    for instance in instances {
        if let Err(e) = controller.store.delete_instance(&instance.id).await {
            warn!(instance_id = %instance.id, error = %e, "failed to roll back instance after partial launch failure");
        }
    }
}

/// `(id, previous_state, current_state)` per instance, matching the
/// verb contract's result shape.
pub struct TerminationResult {
    pub id: String,
    pub previous_state: InstanceStatus,
    pub current_state: InstanceStatus,
}

pub async fn terminate_instances(
    controller: &CloudController,
    ctx: &RequestContext,
    ids: &[String],
) -> Result<Vec<TerminationResult>> {
    let mut results = Vec::with_capacity(ids.len());
    for id in ids {
        let mut instance = match controller.store.get_instance(id).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => {
                warn!(instance_id = %id, "terminate: instance not found, skipping");
                continue;
            }
            Err(e) => return Err(e),
        };
        let previous_state = instance.state;
        validate_instance_transition(previous_state, InstanceStatus::Terminating)?;

        if let Some(address) = instance.public_ip.clone() {
            if let Err(e) = controller.network.disassociate_floating_ip(&address).await {
                warn!(instance_id = %id, error = %e, "best-effort floating ip disassociation failed");
            }
        }
        if let Some(address) = instance.private_ip.clone() {
            if let Err(e) = controller.network.deallocate_fixed_ip(&address).await {
                warn!(instance_id = %id, error = %e, "fixed ip deallocation failed");
            }
        }

        instance.state = InstanceStatus::Terminating;
        instance.state_description = "terminating".to_string();
        controller.store.update_instance(&instance).await?;

        if let Some(host) = instance.host.clone() {
            let mut args = HashMap::new();
            args.insert("instance_id".to_string(), serde_json::json!(instance.id));
            controller
                .dispatcher
                .cast(
                    &Destination::TopicHost("compute".to_string(), host),
                    Envelope {
                        method: "terminate_instance".to_string(),
                        args,
                        msg_id: None,
                        reply_to: None,
                        context: ctx.clone(),
                    },
                )
                .await?;
        } else {
            instance.state = InstanceStatus::Deleted;
            instance.state_description = "deleted".to_string();
            controller.store.update_instance(&instance).await?;
        }

        results.push(TerminationResult {
            id: instance.id.clone(),
            previous_state,
            current_state: instance.state,
        });
    }
    Ok(results)
}

pub async fn reboot_instances(controller: &CloudController, ctx: &RequestContext, ids: &[String]) -> Result<()> {
    for id in ids {
        let instance = controller.store.get_instance(id).await?;
        if instance.state != InstanceStatus::Running {
            continue;
        }
        let Some(host) = instance.host.clone() else {
            continue;
        };
        let mut args = HashMap::new();
        args.insert("instance_id".to_string(), serde_json::json!(instance.id));
        controller
            .dispatcher
            .cast(
                &Destination::TopicHost("compute".to_string(), host),
                Envelope {
                    method: "reboot_instance".to_string(),
                    args,
                    msg_id: None,
                    reply_to: None,
                    context: ctx.clone(),
                },
            )
            .await?;
    }
    Ok(())
}

async fn transition_power_state(
    controller: &CloudController,
    ctx: &RequestContext,
    ids: &[String],
    required: InstanceStatus,
    target: InstanceStatus,
    method: &str,
) -> Result<()> {
    for id in ids {
        let mut instance = controller.store.get_instance(id).await?;
        if instance.state != required {
            return Err(CloudError::ApiError(format!(
                "instance {id} is {:?}, cannot {method}",
                instance.state
            )));
        }
        validate_instance_transition(instance.state, target)?;
        instance.state = target;
        instance.state_description = method.to_string();
        controller.store.update_instance(&instance).await?;

        if let Some(host) = instance.host.clone() {
            let mut args = HashMap::new();
            args.insert("instance_id".to_string(), serde_json::json!(instance.id));
            controller
                .dispatcher
                .cast(
                    &Destination::TopicHost("compute".to_string(), host),
                    Envelope {
                        method: method.to_string(),
                        args,
                        msg_id: None,
                        reply_to: None,
                        context: ctx.clone(),
                    },
                )
                .await?;
        }
    }
    Ok(())
}

/// Only legal from `running`. Volumes attached with
/// `delete_on_termination=false` are left for the worker to reattach on
/// `start` — that reattachment is the compute host's responsibility
/// once it acks `start_instance`.
pub async fn stop_instances(controller: &CloudController, ctx: &RequestContext, ids: &[String]) -> Result<()> {
    transition_power_state(
        controller,
        ctx,
        ids,
        InstanceStatus::Running,
        InstanceStatus::Stopping,
        "stop_instance",
    )
    .await
}

pub async fn start_instances(controller: &CloudController, ctx: &RequestContext, ids: &[String]) -> Result<()> {
    transition_power_state(
        controller,
        ctx,
        ids,
        InstanceStatus::Stopped,
        InstanceStatus::Starting,
        "start_instance",
    )
    .await
}

/// Both console output and password data are hypervisor-owned facts
/// this control plane has no local copy of — it round-trips an RPC
/// `call` to the instance's host and relays whatever comes back,
/// the same "dispatcher's view of an out-of-scope collaborator" shape
/// `cloud-rpc` documents for the worker topics generally.
async fn call_instance_host(
    controller: &CloudController,
    ctx: &RequestContext,
    instance_id: &str,
    method: &str,
) -> Result<serde_json::Value> {
    let instance = controller.store.get_instance(instance_id).await?;
    let Some(host) = instance.host else {
        return Err(CloudError::ApiError(format!(
            "instance {instance_id} has no assigned host"
        )));
    };
    let mut args = HashMap::new();
    args.insert("instance_id".to_string(), serde_json::json!(instance.id));
    controller
        .dispatcher
        .call(
            &Destination::TopicHost("compute".to_string(), host),
            method,
            args,
            ctx.clone(),
            None,
        )
        .await
}

pub async fn get_console_output(controller: &CloudController, ctx: &RequestContext, instance_id: &str) -> Result<String> {
    let reply = call_instance_host(controller, ctx, instance_id, "get_console_output").await?;
    reply
        .get("output")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| CloudError::Internal("compute host reply missing output field".into()))
}

pub async fn get_password_data(controller: &CloudController, ctx: &RequestContext, instance_id: &str) -> Result<String> {
    let reply = call_instance_host(controller, ctx, instance_id, "get_password_data").await?;
    reply
        .get("password_data")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| CloudError::Internal("compute host reply missing password_data field".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ContainerType, FakeImageService};
    use cloud_core::model::{FixedIp, FixedIpState};
    use cloud_core::protocol::{Destination, Reply};
    use cloud_net::{NetworkAllocator, NetworkConfig};
    use cloud_quota::{QuotaDefaults, QuotaEngine, QuotaLimits};
    use cloud_rpc::Dispatcher;
    use cloud_state::SqliteStateStore;
    use cloud_volume::VolumeController;
    use cloud_zone::{NullZoneProbe, ZoneManager, ZoneManagerConfig};
    use std::time::Duration;

    #[test]
    fn known_instance_types_resolve() {
        assert_eq!(instance_type_resources("m1.small").unwrap(), (1, 2048));
    }

    #[test]
    fn unknown_instance_type_is_api_error() {
        assert!(instance_type_resources("m1.bogus").is_err());
    }

    async fn fixture() -> (CloudController, RequestContext) {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        let directory = Arc::new(cloud_directory::fake::FakeDirectory::new());
        let limits = QuotaLimits::new(QuotaDefaults::default());
        let quota = Arc::new(QuotaEngine::new(store.clone(), limits, Duration::from_secs(300)));
        let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(2)));
        let network = Arc::new(NetworkAllocator::new(store.clone(), NetworkConfig::default()));
        let volumes = Arc::new(VolumeController::new(store.clone(), quota.clone(), 100));
        let zones = Arc::new(ZoneManager::new(
            store.clone(),
            Arc::new(NullZoneProbe),
            ZoneManagerConfig::default(),
        ));
        let images = Arc::new(FakeImageService::new());
        store
            .insert_fixed_ip(&FixedIp {
                address: "10.0.0.5".to_string(),
                network_id: "net-acme".to_string(),
                instance_id: None,
                state: FixedIpState::Free,
                reserved: false,
                virtual_interface_id: None,
            })
            .await
            .unwrap();
        let controller = CloudController::new(store, directory, quota, dispatcher, network, volumes, zones, images, "nova");
        let ctx = RequestContext {
            request_id: "req-1".to_string(),
            user_id: "bob".to_string(),
            project_id: "acme".to_string(),
            is_admin: true,
            roles: Vec::new(),
            remote_address: None,
            read_deleted: false,
        };
        (controller, ctx)
    }

    #[tokio::test]
    async fn run_instances_rejects_image_without_launch_permission() {
        let (controller, ctx) = fixture().await;
        let image = controller.images.register("someone-else", ContainerType::Ami).await.unwrap();
        let request = RunInstancesRequest {
            image_ref: image.id,
            min_count: 1,
            max_count: 1,
            instance_type: "m1.small".to_string(),
            key_name: None,
            security_group_ids: Vec::new(),
            user_data: None,
            block_device_mapping: Vec::new(),
            kernel_ref: None,
            ramdisk_ref: None,
        };
        let result = run_instances(&controller, &ctx, request).await;
        assert!(matches!(result, Err(CloudError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn get_console_output_relays_compute_host_reply() {
        let (controller, ctx) = fixture().await;
        let image = controller.images.register("acme", ContainerType::Ami).await.unwrap();
        let request = RunInstancesRequest {
            image_ref: image.id,
            min_count: 1,
            max_count: 1,
            instance_type: "m1.small".to_string(),
            key_name: None,
            security_group_ids: Vec::new(),
            user_data: None,
            block_device_mapping: Vec::new(),
            kernel_ref: None,
            ramdisk_ref: None,
        };
        let mut launched = run_instances(&controller, &ctx, request).await.unwrap();
        let mut instance = launched.remove(0);
        instance.host = Some("host1".to_string());
        controller.store.update_instance(&instance).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        controller
            .dispatcher
            .register(Destination::TopicHost("compute".to_string(), "host1".to_string()), tx)
            .await;
        let dispatcher = controller.dispatcher.clone();
        tokio::spawn(async move {
            let env = rx.recv().await.unwrap();
            dispatcher
                .reply(Reply {
                    msg_id: env.msg_id.unwrap(),
                    result: Ok(serde_json::json!({"output": "boot complete"})),
                })
                .await;
        });

        let output = get_console_output(&controller, &ctx, &instance.id).await.unwrap();
        assert_eq!(output, "boot complete");
    }

    #[tokio::test]
    async fn run_instances_rolls_back_already_inserted_rows_on_mid_batch_failure() {
        // No "compute" fanout worker is registered, so the dispatcher
        // cast in the first loop iteration fails with
        // `ServiceUnavailable` before a second instance is ever
        // created.
        let (controller, ctx) = fixture().await;
        let image = controller.images.register("acme", ContainerType::Ami).await.unwrap();
        let request = RunInstancesRequest {
            image_ref: image.id,
            min_count: 1,
            max_count: 1,
            instance_type: "m1.small".to_string(),
            key_name: None,
            security_group_ids: Vec::new(),
            user_data: None,
            block_device_mapping: Vec::new(),
            kernel_ref: None,
            ramdisk_ref: None,
        };
        let result = run_instances(&controller, &ctx, request).await;
        assert!(matches!(result, Err(CloudError::ServiceUnavailable(_))));

        let remaining = controller.store.list_instances_by_project(&ctx.project_id).await.unwrap();
        assert!(remaining.is_empty(), "failed instance row was not rolled back: {remaining:?}");

        // Quota for the whole reservation is released too, so a
        // follow-up launch against the same project isn't short on
        // room left over from the failed attempt.
        let used = controller.quota.used(&ctx.project_id, "instances").await.unwrap();
        assert_eq!(used, 0);
    }

    #[tokio::test]
    async fn get_password_data_fails_without_assigned_host() {
        let (controller, ctx) = fixture().await;
        let image = controller.images.register("acme", ContainerType::Ami).await.unwrap();
        let request = RunInstancesRequest {
            image_ref: image.id,
            min_count: 1,
            max_count: 1,
            instance_type: "m1.small".to_string(),
            key_name: None,
            security_group_ids: Vec::new(),
            user_data: None,
            block_device_mapping: Vec::new(),
            kernel_ref: None,
            ramdisk_ref: None,
        };
        let launched = run_instances(&controller, &ctx, request).await.unwrap();
        let instance = &launched[0];
        let result = get_password_data(&controller, &ctx, &instance.id).await;
        assert!(result.is_err());
    }
}
