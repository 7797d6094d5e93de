//! The EC2 wire surface: HTTP GET/POST with query parameters,
//! XML responses. Shaped like `cloud_net::metadata::router` — one axum
//! `Router` over a shared state struct — but fronted by signature
//! verification instead of IP-gating.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use cloud_core::error::CloudError;
use cloud_core::model::{BlockDeviceMapping, Protocol, SecurityGroupRule};
use cloud_core::protocol::RequestContext;
use cloud_core::signing::Signer;
use cloud_directory::Directory;
use cloud_state::StateStore;
use uuid::Uuid;

use crate::controller::CloudController;
use crate::image::{ContainerType, ImageService};
use crate::{addresses, instances, keypairs, policy, security_groups, volumes, xml};

/// Single hardcoded region: this deploy has exactly one EC2 endpoint,
/// so `DescribeRegions` always returns it rather than reading a config
/// section that would otherwise only ever hold one entry.
const REGION_NAME: &str = "nova";
const REGION_ENDPOINT: &str = "ec2.nova.internal";

pub fn router(controller: Arc<CloudController>) -> Router {
    Router::new()
        .route("/", any(ec2_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(controller)
}

async fn ec2_handler(
    State(controller): State<Arc<CloudController>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    Query(mut params): Query<BTreeMap<String, String>>,
    body: Bytes,
) -> Response {
    // POST requests carry their parameters as a form-urlencoded body
    // rather than a query string; merge both so either verb works the
    // same way through the rest of the pipeline.
    if !body.is_empty() {
        if let Ok(form) = serde_urlencoded::from_bytes::<BTreeMap<String, String>>(&body) {
            params.extend(form);
        }
    }
    match handle(&controller, &peer, &method, params).await {
        Ok(body) => (StatusCode::OK, [("content-type", "text/xml")], body).into_response(),
        Err(error) => {
            let request_id = Uuid::new_v4().to_string();
            let status = StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = xml::render_error(&error, &request_id);
            (status, [("content-type", "text/xml")], body).into_response()
        }
    }
}

async fn handle(
    controller: &CloudController,
    peer: &SocketAddr,
    method: &Method,
    params: BTreeMap<String, String>,
) -> Result<String, CloudError> {
    let action = params
        .get("Action")
        .cloned()
        .ok_or_else(|| CloudError::ApiError("missing Action parameter".into()))?;
    let access_key = params
        .get("AWSAccessKeyId")
        .cloned()
        .ok_or_else(|| CloudError::AuthFailure("missing AWSAccessKeyId".into()))?;
    let signature = params
        .get("Signature")
        .cloned()
        .ok_or_else(|| CloudError::AuthFailure("missing Signature".into()))?;

    let user = controller.directory.get_user_by_access_key(&access_key).await?;
    let mut signed_params = params.clone();
    signed_params.remove("Signature");
    let signer = Signer::new(&user.secret_key);
    let ok = signer.verify(&signed_params, &signature, method.as_str(), "", "/")?;
    if !ok {
        return Err(CloudError::AuthFailure("signature mismatch".into()));
    }

    let project_id = params.get("ProjectId").cloned().unwrap_or_else(|| user.id.clone());
    let roles = controller.directory.get_user_roles(&user.id, Some(&project_id)).await?;
    let ctx = RequestContext {
        request_id: Uuid::new_v4().to_string(),
        user_id: user.id.clone(),
        project_id,
        is_admin: user.admin,
        roles: roles.iter().map(role_wire_name).map(str::to_string).collect(),
        remote_address: Some(peer.to_string()),
        read_deleted: params.get("ReadDeleted").map(|v| v == "true").unwrap_or(false),
    };

    policy::authorize(&ctx, &action)?;
    dispatch(controller, &ctx, &action, &params).await
}

fn role_wire_name(role: &cloud_core::model::Role) -> &'static str {
    use cloud_core::model::Role::*;
    match role {
        CloudAdmin => "cloudadmin",
        ItSec => "itsec",
        SysAdmin => "sysadmin",
        NetAdmin => "netadmin",
        Developer => "developer",
        ProjectManager => "projectmanager",
    }
}

fn indexed(params: &BTreeMap<String, String>, prefix: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut i = 1;
    loop {
        let Some(value) = params.get(&format!("{prefix}.{i}")) else { break };
        values.push(value.clone());
        i += 1;
    }
    values
}

fn parse_u32(params: &BTreeMap<String, String>, key: &str) -> Result<Option<u32>, CloudError> {
    match params.get(key) {
        None => Ok(None),
        Some(v) => v
            .parse::<u32>()
            .map(Some)
            .map_err(|_| CloudError::ApiError(format!("{key} is not a valid integer"))),
    }
}

async fn dispatch(
    controller: &CloudController,
    ctx: &RequestContext,
    action: &str,
    params: &BTreeMap<String, String>,
) -> Result<String, CloudError> {
    match action {
        "RunInstances" => {
            let min_count = parse_u32(params, "MinCount")?.unwrap_or(1);
            let max_count = parse_u32(params, "MaxCount")?.unwrap_or(min_count);
            let request = instances::RunInstancesRequest {
                image_ref: params
                    .get("ImageId")
                    .cloned()
                    .ok_or_else(|| CloudError::ApiError("missing ImageId".into()))?,
                min_count,
                max_count,
                instance_type: params.get("InstanceType").cloned().unwrap_or_else(|| "m1.small".into()),
                key_name: params.get("KeyName").cloned(),
                security_group_ids: indexed(params, "SecurityGroupId"),
                user_data: params.get("UserData").cloned(),
                block_device_mapping: Vec::<BlockDeviceMapping>::new(),
                kernel_ref: params.get("KernelId").cloned(),
                ramdisk_ref: params.get("RamdiskId").cloned(),
            };
            let launched = instances::run_instances(controller, ctx, request).await?;
            Ok(xml::render_describe_instances(&launched, &ctx.request_id))
        }
        "TerminateInstances" => {
            let ids = indexed(params, "InstanceId");
            instances::terminate_instances(controller, ctx, &ids).await?;
            Ok(xml::XmlResponse::start("TerminateInstances", &ctx.request_id).finish("TerminateInstances"))
        }
        "RebootInstances" => {
            let ids = indexed(params, "InstanceId");
            instances::reboot_instances(controller, ctx, &ids).await?;
            Ok(xml::XmlResponse::start("RebootInstances", &ctx.request_id).finish("RebootInstances"))
        }
        "StartInstances" => {
            let ids = indexed(params, "InstanceId");
            instances::start_instances(controller, ctx, &ids).await?;
            Ok(xml::XmlResponse::start("StartInstances", &ctx.request_id).finish("StartInstances"))
        }
        "StopInstances" => {
            let ids = indexed(params, "InstanceId");
            instances::stop_instances(controller, ctx, &ids).await?;
            Ok(xml::XmlResponse::start("StopInstances", &ctx.request_id).finish("StopInstances"))
        }
        "DescribeInstances" => {
            let list = controller.store.list_instances_by_project(&ctx.project_id).await?;
            Ok(xml::render_describe_instances(&list, &ctx.request_id))
        }
        "CreateVolume" => {
            let size_gb = parse_u32(params, "Size")?;
            let snapshot_id = params.get("SnapshotId").cloned();
            let host = params.get("AvailabilityZone").cloned().unwrap_or_else(|| controller.availability_zone.clone());
            let volume = volumes::create_volume(controller, ctx, size_gb, snapshot_id, &host).await?;
            Ok(xml::render_describe_volumes(&[volume], &ctx.request_id))
        }
        "AttachVolume" => {
            let volume_id = params.get("VolumeId").cloned().ok_or_else(missing("VolumeId"))?;
            let instance_id = params.get("InstanceId").cloned().ok_or_else(missing("InstanceId"))?;
            let device = params.get("Device").cloned().ok_or_else(missing("Device"))?;
            let volume = volumes::attach_volume(controller, ctx, &volume_id, &instance_id, &device).await?;
            Ok(xml::render_describe_volumes(&[volume], &ctx.request_id))
        }
        "DetachVolume" => {
            let volume_id = params.get("VolumeId").cloned().ok_or_else(missing("VolumeId"))?;
            let volume = volumes::detach_volume(controller, ctx, &volume_id).await?;
            Ok(xml::render_describe_volumes(&[volume], &ctx.request_id))
        }
        "DeleteVolume" => {
            let volume_id = params.get("VolumeId").cloned().ok_or_else(missing("VolumeId"))?;
            controller.volumes.delete_volume(&volume_id).await?;
            Ok(xml::XmlResponse::start("DeleteVolume", &ctx.request_id).finish("DeleteVolume"))
        }
        "DescribeVolumes" => {
            let list = controller.store.list_volumes_by_project(&ctx.project_id).await?;
            Ok(xml::render_describe_volumes(&list, &ctx.request_id))
        }
        "CreateSnapshot" => {
            let volume_id = params.get("VolumeId").cloned().ok_or_else(missing("VolumeId"))?;
            let force = params.get("Force").map(|v| v == "true").unwrap_or(false);
            let snapshot = volumes::create_snapshot(controller, ctx, &volume_id, force).await?;
            Ok(xml::render_describe_snapshots(&[snapshot], &ctx.request_id))
        }
        "DeleteSnapshot" => {
            let snapshot_id = params.get("SnapshotId").cloned().ok_or_else(missing("SnapshotId"))?;
            controller.volumes.delete_snapshot(&snapshot_id).await?;
            Ok(xml::XmlResponse::start("DeleteSnapshot", &ctx.request_id).finish("DeleteSnapshot"))
        }
        "DescribeSnapshots" => {
            let volume_id = params.get("VolumeId").cloned().unwrap_or_default();
            let list = controller.store.list_snapshots_by_volume(&volume_id).await?;
            Ok(xml::render_describe_snapshots(&list, &ctx.request_id))
        }
        "AllocateAddress" => {
            let host = params.get("AvailabilityZone").cloned().unwrap_or_else(|| controller.availability_zone.clone());
            let address = addresses::allocate_address(controller, ctx, &host).await?;
            Ok(xml::render_describe_addresses(&[address], &ctx.request_id))
        }
        "ReleaseAddress" => {
            let address = params.get("PublicIp").cloned().ok_or_else(missing("PublicIp"))?;
            addresses::release_address(controller, ctx, &address).await?;
            Ok(xml::XmlResponse::start("ReleaseAddress", &ctx.request_id).finish("ReleaseAddress"))
        }
        "AssociateAddress" => {
            let address = params.get("PublicIp").cloned().ok_or_else(missing("PublicIp"))?;
            let instance_id = params.get("InstanceId").cloned().ok_or_else(missing("InstanceId"))?;
            let address = addresses::associate_address(controller, ctx, &address, &instance_id).await?;
            Ok(xml::render_describe_addresses(&[address], &ctx.request_id))
        }
        "DisassociateAddress" => {
            let address = params.get("PublicIp").cloned().ok_or_else(missing("PublicIp"))?;
            let address = addresses::disassociate_address(controller, ctx, &address).await?;
            Ok(xml::render_describe_addresses(&[address], &ctx.request_id))
        }
        "DescribeAddresses" => {
            let list = controller.store.list_floating_ips_by_project(&ctx.project_id).await?;
            Ok(xml::render_describe_addresses(&list, &ctx.request_id))
        }
        "CreateSecurityGroup" => {
            let name = params.get("GroupName").cloned().ok_or_else(missing("GroupName"))?;
            let description = params.get("GroupDescription").cloned().unwrap_or_default();
            let group = security_groups::create_security_group(controller, ctx, &name, &description).await?;
            Ok(xml::render_describe_security_groups(&[group], &ctx.request_id))
        }
        "DeleteSecurityGroup" => {
            let group_id = params.get("GroupId").cloned().ok_or_else(missing("GroupId"))?;
            security_groups::delete_security_group(controller, &group_id).await?;
            Ok(xml::XmlResponse::start("DeleteSecurityGroup", &ctx.request_id).finish("DeleteSecurityGroup"))
        }
        "DescribeSecurityGroups" => {
            let list = controller.store.list_security_groups_by_project(&ctx.project_id).await?;
            Ok(xml::render_describe_security_groups(&list, &ctx.request_id))
        }
        "AuthorizeSecurityGroupIngress" => {
            let group_id = params.get("GroupId").cloned().ok_or_else(missing("GroupId"))?;
            let rule = parse_ingress_rule(params)?;
            let group = security_groups::authorize_ingress(controller, &group_id, rule).await?;
            Ok(xml::render_describe_security_groups(&[group], &ctx.request_id))
        }
        "RevokeSecurityGroupIngress" => {
            let group_id = params.get("GroupId").cloned().ok_or_else(missing("GroupId"))?;
            let rule = parse_ingress_rule(params)?;
            let group = security_groups::revoke_ingress(controller, &group_id, &rule).await?;
            Ok(xml::render_describe_security_groups(&[group], &ctx.request_id))
        }
        "RegisterImage" => {
            let container_type = match params.get("ContainerType").map(String::as_str) {
                Some("kernel") => ContainerType::Kernel,
                Some("ramdisk") => ContainerType::Ramdisk,
                _ => ContainerType::Ami,
            };
            let image = controller.images.register(&ctx.project_id, container_type).await?;
            let mut response = xml::XmlResponse::start("RegisterImage", &ctx.request_id);
            response.text_element("imageId", &image.id);
            Ok(response.finish("RegisterImage"))
        }
        "DeregisterImage" => {
            let image_id = params.get("ImageId").cloned().ok_or_else(missing("ImageId"))?;
            controller.images.deregister(&image_id).await?;
            Ok(xml::XmlResponse::start("DeregisterImage", &ctx.request_id).finish("DeregisterImage"))
        }
        "ModifyImageAttribute" => {
            let image_id = params.get("ImageId").cloned().ok_or_else(missing("ImageId"))?;
            let group_all = params.get("UserGroup.1").map(String::as_str) == Some("all");
            let target = if group_all {
                "all".to_string()
            } else {
                params.get("UserId.1").cloned().ok_or_else(missing("UserId.1 or UserGroup.1=all"))?
            };
            if params.get("OperationType").map(String::as_str) == Some("remove") {
                controller.images.remove_launch_permission(&image_id, &target).await?;
            } else {
                controller.images.add_launch_permission(&image_id, &target).await?;
            }
            Ok(xml::XmlResponse::start("ModifyImageAttribute", &ctx.request_id).finish("ModifyImageAttribute"))
        }
        "CreateKeyPair" => {
            let name = params.get("KeyName").cloned().ok_or_else(missing("KeyName"))?;
            let pair = keypairs::create_key_pair(controller, ctx, &name).await?;
            Ok(xml::render_create_key_pair(&pair, &ctx.request_id))
        }
        "DeleteKeyPair" => {
            let name = params.get("KeyName").cloned().ok_or_else(missing("KeyName"))?;
            keypairs::delete_key_pair(controller, ctx, &name).await?;
            Ok(xml::XmlResponse::start("DeleteKeyPair", &ctx.request_id).finish("DeleteKeyPair"))
        }
        "DescribeKeyPairs" => {
            let pairs = keypairs::describe_key_pairs(controller, ctx).await?;
            Ok(xml::render_describe_key_pairs(&pairs, &ctx.request_id))
        }
        "DescribeImages" => {
            let images = controller.images.list(&ctx.project_id).await?;
            Ok(xml::render_describe_images(&images, &ctx.request_id))
        }
        "DescribeAvailabilityZones" => Ok(xml::render_describe_availability_zones(&controller.availability_zone, &ctx.request_id)),
        "DescribeRegions" => Ok(xml::render_describe_regions(REGION_NAME, REGION_ENDPOINT, &ctx.request_id)),
        "GetConsoleOutput" => {
            let instance_id = params.get("InstanceId").cloned().ok_or_else(missing("InstanceId"))?;
            let output = instances::get_console_output(controller, ctx, &instance_id).await?;
            Ok(xml::render_console_output(&instance_id, &output, &ctx.request_id))
        }
        "GetPasswordData" => {
            let instance_id = params.get("InstanceId").cloned().ok_or_else(missing("InstanceId"))?;
            let password_data = instances::get_password_data(controller, ctx, &instance_id).await?;
            Ok(xml::render_password_data(&instance_id, &password_data, &ctx.request_id))
        }
        other => Err(CloudError::ApiError(format!("unsupported action: {other}"))),
    }
}

fn missing(field: &'static str) -> impl Fn() -> CloudError {
    move || CloudError::ApiError(format!("missing {field}"))
}

fn parse_ingress_rule(params: &BTreeMap<String, String>) -> Result<SecurityGroupRule, CloudError> {
    let protocol = match params.get("IpProtocol").map(String::as_str) {
        Some("tcp") => Protocol::Tcp,
        Some("udp") => Protocol::Udp,
        Some("icmp") => Protocol::Icmp,
        _ => return Err(CloudError::ApiError("missing or unknown IpProtocol".into())),
    };
    let from_port = params
        .get("FromPort")
        .and_then(|v| v.parse::<i32>().ok())
        .ok_or_else(missing("FromPort"))?;
    let to_port = params
        .get("ToPort")
        .and_then(|v| v.parse::<i32>().ok())
        .ok_or_else(missing("ToPort"))?;
    Ok(SecurityGroupRule {
        protocol,
        from_port,
        to_port,
        cidr: params.get("CidrIp").cloned(),
        source_group_id: params.get("SourceSecurityGroupName").cloned(),
    })
}
