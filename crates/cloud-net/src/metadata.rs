//! Metadata Service (C11): an `axum` HTTP service exposing the
//! cloud-init-style `169.254.169.254` fixed tree. Unauthenticated but
//! IP-gated by matching the peer address against the instance that
//! currently holds it as a fixed IP.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use base64::Engine;
use cloud_core::model::{BdmSource, Instance};
use cloud_state::StateStore;

#[derive(Clone)]
pub struct MetadataState {
    store: Arc<dyn StateStore>,
    default_availability_zone: String,
}

pub fn router(store: Arc<dyn StateStore>, default_availability_zone: impl Into<String>) -> Router {
    let state = MetadataState {
        store,
        default_availability_zone: default_availability_zone.into(),
    };
    Router::new()
        .route("/meta-data/*key", get(meta_data))
        .route("/user-data", get(user_data))
        .with_state(state)
}

/// Looks up the instance currently holding `addr` as its fixed IP. The
/// IP gate: the only identity a metadata request carries is "where did
/// this TCP connection come from," so the lookup doubles as auth.
async fn instance_for_peer(state: &MetadataState, addr: SocketAddr) -> Result<Instance, StatusCode> {
    let ip = addr.ip().to_string();
    let fixed = state.store.get_fixed_ip(&ip).await.map_err(|_| StatusCode::FORBIDDEN)?;
    let instance_id = fixed.instance_id.ok_or(StatusCode::FORBIDDEN)?;
    state.store.get_instance(&instance_id).await.map_err(|_| StatusCode::NOT_FOUND)
}

fn bdm_field(instance: &Instance, role: &str) -> Option<String> {
    instance
        .block_device_mapping
        .iter()
        .find(|m| match role {
            "root" => m.device_name == instance.root_device_name,
            "ami" => matches!(m.source, BdmSource::Snapshot | BdmSource::Volume) && m.device_name == instance.root_device_name,
            _ => m.virtual_name.as_deref() == Some(role),
        })
        .map(|m| m.device_name.clone())
}

/// Renders one `meta-data/` leaf. Directory-shaped keys (trailing `/`,
/// or a key with known children) are not modeled — every leaf this
/// service serves is addressed directly by its full path, matching how
/// EC2 clients actually walk the tree (one GET per leaf).
fn render_leaf(state: &MetadataState, instance: &Instance, key: &str) -> Option<String> {
    match key {
        "ami-id" => Some(instance.image_ref.clone()),
        "ami-launch-index" => Some("0".to_string()),
        "instance-id" => Some(instance.ec2_id.clone()),
        "instance-type" => Some(instance.instance_type_id.clone()),
        "hostname" => Some(format!("{}.internal", instance.ec2_id)),
        "local-ipv4" => instance.private_ip.clone(),
        "public-ipv4" => instance.public_ip.clone(),
        "public-keys/0/openssh-key" => instance.key_data.clone(),
        "reservation-id" => Some(instance.reservation_id.clone()),
        "placement/availability-zone" => Some(
            instance
                .host
                .clone()
                .unwrap_or_else(|| state.default_availability_zone.clone()),
        ),
        "kernel-id" => instance.kernel_ref.clone(),
        "ramdisk-id" => instance.ramdisk_ref.clone(),
        "security-groups" => Some(instance.security_group_ids.join("\n")),
        "block-device-mapping/ami" => bdm_field(instance, "ami").or_else(|| Some(instance.root_device_name.clone())),
        "block-device-mapping/root" => Some(instance.root_device_name.clone()),
        "block-device-mapping/ephemeral0" => bdm_field(instance, "ephemeral0"),
        "block-device-mapping/swap" => bdm_field(instance, "swap"),
        _ => None,
    }
}

async fn meta_data(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<MetadataState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    let instance = match instance_for_peer(&state, addr).await {
        Ok(i) => i,
        Err(code) => return (code, String::new()),
    };
    match render_leaf(&state, &instance, &key) {
        Some(value) => (StatusCode::OK, value),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

/// `user-data` is not part of the persisted `Instance` record in this
/// state model — RunInstances accepts it but a durable home for it is
/// out of this service's scope, so every peer resolves to 404 rather
/// than silently fabricating a value.
async fn user_data(ConnectInfo(addr): ConnectInfo<SocketAddr>, State(state): State<MetadataState>) -> impl IntoResponse {
    match instance_for_peer(&state, addr).await {
        Ok(_) => StatusCode::NOT_FOUND,
        Err(code) => code,
    }
}

/// Base64-decodes a raw `user-data` payload for egress.
/// Exposed standalone so callers with their own user-data store (outside
/// this crate's scope) can reuse the decode step.
pub fn decode_user_data(encoded: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(encoded).ok()
}
