//! Security group CRUD plus the notify-hosts-to-recompile-firewall
//! fan-out. Rule changes never touch iptables
//! directly from the controller — they are compiled and applied on
//! each affected compute host, which owns `cloud_net::firewall`.

use std::collections::{HashMap, HashSet};

use cloud_core::error::{CloudError, Result};
use cloud_core::model::{SecurityGroup, SecurityGroupRule};
use cloud_core::naming::validate_id;
use cloud_core::protocol::{Destination, Envelope, RequestContext};
use cloud_state::StateStore;
use uuid::Uuid;

use crate::controller::CloudController;

pub async fn create_security_group(
    controller: &CloudController,
    ctx: &RequestContext,
    name: &str,
    description: &str,
) -> Result<SecurityGroup> {
    validate_id(name, "SecurityGroup")?;
    let existing = controller.store.list_security_groups_by_project(&ctx.project_id).await?;
    if existing.iter().any(|g| g.name == name) {
        return Err(CloudError::Duplicate(format!(
            "security group {name} already exists in project {}",
            ctx.project_id
        )));
    }
    let group = SecurityGroup {
        id: Uuid::new_v4().to_string(),
        project_id: ctx.project_id.clone(),
        name: name.to_string(),
        description: description.to_string(),
        rules: Vec::new(),
    };
    controller.store.insert_security_group(&group).await?;
    Ok(group)
}

/// The `default` security group, auto-created per project,
/// is never deletable through this path.
pub async fn delete_security_group(controller: &CloudController, group_id: &str) -> Result<()> {
    let group = controller.store.get_security_group(group_id).await?;
    if group.name == "default" {
        return Err(CloudError::ApiError("the default security group cannot be deleted".into()));
    }
    controller.store.delete_security_group(group_id).await?;
    notify_bound_hosts(controller, &group.project_id, group_id).await
}

pub async fn authorize_ingress(
    controller: &CloudController,
    group_id: &str,
    rule: SecurityGroupRule,
) -> Result<SecurityGroup> {
    let mut group = controller.store.get_security_group(group_id).await?;
    group.rules.push(rule);
    controller.store.update_security_group(&group).await?;
    notify_bound_hosts(controller, &group.project_id, group_id).await?;
    Ok(group)
}

pub async fn revoke_ingress(
    controller: &CloudController,
    group_id: &str,
    rule: &SecurityGroupRule,
) -> Result<SecurityGroup> {
    let mut group = controller.store.get_security_group(group_id).await?;
    group.rules.retain(|r| {
        !(r.protocol == rule.protocol
            && r.from_port == rule.from_port
            && r.to_port == rule.to_port
            && r.cidr == rule.cidr
            && r.source_group_id == rule.source_group_id)
    });
    controller.store.update_security_group(&group).await?;
    notify_bound_hosts(controller, &group.project_id, group_id).await?;
    Ok(group)
}

/// Every host running an instance bound to `group_id` gets a
/// `recompile_firewall` cast so it rebuilds its own chain set from the
/// current rule graph.
async fn notify_bound_hosts(controller: &CloudController, project_id: &str, group_id: &str) -> Result<()> {
    let instances = controller.store.list_instances_by_project(project_id).await?;
    let mut hosts = HashSet::new();
    for instance in instances {
        if instance.security_group_ids.iter().any(|id| id == group_id) {
            if let Some(host) = instance.host {
                hosts.insert(host);
            }
        }
    }
    for host in hosts {
        let mut args = HashMap::new();
        args.insert("security_group_id".to_string(), serde_json::json!(group_id));
        controller
            .dispatcher
            .cast(
                &Destination::TopicHost("compute".to_string(), host),
                Envelope {
                    method: "recompile_firewall".to_string(),
                    args,
                    msg_id: None,
                    reply_to: None,
                    context: system_context(),
                },
            )
            .await?;
    }
    Ok(())
}

fn system_context() -> RequestContext {
    RequestContext {
        request_id: Uuid::new_v4().to_string(),
        user_id: "system".to_string(),
        project_id: String::new(),
        is_admin: true,
        roles: Vec::new(),
        remote_address: None,
        read_deleted: false,
    }
}
