//! Allocate/Release/Associate/DisassociateAddress.
//! Thin verb wrapper over `cloud_net::NetworkAllocator`; the allocator
//! owns the pool state machine, this module only supplies the host
//! selection and authorization context a bare allocator call doesn't
//! carry.

use cloud_core::error::Result;
use cloud_core::model::FloatingIp;
use cloud_core::protocol::RequestContext;
use cloud_state::StateStore;

use crate::controller::CloudController;

pub async fn allocate_address(controller: &CloudController, ctx: &RequestContext, host: &str) -> Result<FloatingIp> {
    controller.network.allocate_floating_ip(&ctx.project_id, host).await
}

pub async fn release_address(controller: &CloudController, ctx: &RequestContext, address: &str) -> Result<()> {
    controller.network.release_floating_ip(address, &ctx.project_id).await
}

/// Beyond the pool-state transition, keeps `Instance::public_ip` in sync so
/// it stays a direct mirror of "a `FloatingIp` row points at this
/// instance's fixed ip" (the invariant `DescribeInstances` and the
/// metadata service both read `public_ip` off of, rather than re-deriving
/// it from the floating-ip table on every read).
pub async fn associate_address(
    controller: &CloudController,
    ctx: &RequestContext,
    address: &str,
    instance_id: &str,
) -> Result<FloatingIp> {
    let mut instance = controller.store.get_instance(instance_id).await?;
    let fixed_ip_address = instance.private_ip.clone().ok_or_else(|| {
        cloud_core::error::CloudError::ApiError(format!("instance {instance_id} has no private ip to associate with"))
    })?;
    let floating = controller
        .network
        .associate_floating_ip(address, &fixed_ip_address, &ctx.project_id)
        .await?;
    instance.public_ip = Some(floating.address.clone());
    controller.store.update_instance(&instance).await?;
    Ok(floating)
}

pub async fn disassociate_address(controller: &CloudController, _ctx: &RequestContext, address: &str) -> Result<FloatingIp> {
    let before = controller.store.get_floating_ip(address).await?;
    let floating = controller.network.disassociate_floating_ip(address).await?;
    if let Some(fixed_ip_address) = before.fixed_ip_id {
        if let Ok(fixed) = controller.store.get_fixed_ip(&fixed_ip_address).await {
            if let Some(instance_id) = fixed.instance_id {
                if let Ok(mut instance) = controller.store.get_instance(&instance_id).await {
                    if instance.public_ip.as_deref() == Some(address) {
                        instance.public_ip = None;
                        controller.store.update_instance(&instance).await?;
                    }
                }
            }
        }
    }
    Ok(floating)
}
