//! Authorization Policy (C3). A static `verb -> required roles` table
//! plus a short-circuit for admins and project managers acting within
//! their own project — the declarative table the dispatch layer
//! consults before running any verb handler.

use cloud_core::error::{CloudError, Result};
use cloud_core::model::Role;
use cloud_core::protocol::RequestContext;

/// What a verb demands of the caller, beyond simply being authenticated.
#[derive(Debug, Clone, Copy)]
pub enum RoleRequirement {
    /// Any authenticated caller who is a member of the target project.
    AnyProjectMember,
    /// Caller must hold at least one of these roles, scoped to the
    /// target project (or held globally).
    AnyOf(&'static [Role]),
}

/// Declarative verb policy table. Verbs absent from this table default
/// to `AnyOf(&[Role::CloudAdmin])` — unlisted verbs are conservatively
/// admin-only rather than silently open.
const POLICY: &[(&str, RoleRequirement)] = &[
    ("DescribeInstances", RoleRequirement::AnyProjectMember),
    ("DescribeVolumes", RoleRequirement::AnyProjectMember),
    ("DescribeSnapshots", RoleRequirement::AnyProjectMember),
    ("DescribeAddresses", RoleRequirement::AnyProjectMember),
    ("DescribeSecurityGroups", RoleRequirement::AnyProjectMember),
    ("RunInstances", RoleRequirement::AnyOf(&[Role::Developer, Role::SysAdmin])),
    ("TerminateInstances", RoleRequirement::AnyOf(&[Role::Developer, Role::SysAdmin])),
    ("RebootInstances", RoleRequirement::AnyOf(&[Role::Developer, Role::SysAdmin])),
    ("StartInstances", RoleRequirement::AnyOf(&[Role::Developer, Role::SysAdmin])),
    ("StopInstances", RoleRequirement::AnyOf(&[Role::Developer, Role::SysAdmin])),
    ("CreateVolume", RoleRequirement::AnyOf(&[Role::Developer, Role::SysAdmin])),
    ("DeleteVolume", RoleRequirement::AnyOf(&[Role::Developer, Role::SysAdmin])),
    ("AttachVolume", RoleRequirement::AnyOf(&[Role::Developer, Role::SysAdmin])),
    ("DetachVolume", RoleRequirement::AnyOf(&[Role::Developer, Role::SysAdmin])),
    ("CreateSnapshot", RoleRequirement::AnyOf(&[Role::Developer, Role::SysAdmin])),
    ("DeleteSnapshot", RoleRequirement::AnyOf(&[Role::Developer, Role::SysAdmin])),
    ("AllocateAddress", RoleRequirement::AnyOf(&[Role::NetAdmin, Role::SysAdmin])),
    ("ReleaseAddress", RoleRequirement::AnyOf(&[Role::NetAdmin, Role::SysAdmin])),
    ("AssociateAddress", RoleRequirement::AnyOf(&[Role::NetAdmin, Role::SysAdmin, Role::Developer])),
    ("DisassociateAddress", RoleRequirement::AnyOf(&[Role::NetAdmin, Role::SysAdmin, Role::Developer])),
    ("CreateSecurityGroup", RoleRequirement::AnyOf(&[Role::NetAdmin, Role::ItSec, Role::SysAdmin])),
    ("DeleteSecurityGroup", RoleRequirement::AnyOf(&[Role::NetAdmin, Role::ItSec, Role::SysAdmin])),
    (
        "AuthorizeSecurityGroupIngress",
        RoleRequirement::AnyOf(&[Role::NetAdmin, Role::ItSec, Role::SysAdmin]),
    ),
    (
        "RevokeSecurityGroupIngress",
        RoleRequirement::AnyOf(&[Role::NetAdmin, Role::ItSec, Role::SysAdmin]),
    ),
    ("RegisterImage", RoleRequirement::AnyOf(&[Role::SysAdmin, Role::CloudAdmin])),
    ("DeregisterImage", RoleRequirement::AnyOf(&[Role::SysAdmin, Role::CloudAdmin])),
    ("ModifyImageAttribute", RoleRequirement::AnyOf(&[Role::SysAdmin, Role::CloudAdmin])),
    ("DescribeImages", RoleRequirement::AnyProjectMember),
    ("CreateKeyPair", RoleRequirement::AnyOf(&[Role::Developer, Role::SysAdmin])),
    ("DeleteKeyPair", RoleRequirement::AnyOf(&[Role::Developer, Role::SysAdmin])),
    ("DescribeKeyPairs", RoleRequirement::AnyProjectMember),
    ("DescribeAvailabilityZones", RoleRequirement::AnyProjectMember),
    ("DescribeRegions", RoleRequirement::AnyProjectMember),
    ("GetConsoleOutput", RoleRequirement::AnyOf(&[Role::Developer, Role::SysAdmin])),
    ("GetPasswordData", RoleRequirement::AnyOf(&[Role::Developer, Role::SysAdmin])),
];

/// Role-enum wire name, matching `#[serde(rename_all = "lowercase")]`
/// on `Role` — duplicated here rather than depending on serde's private
/// renaming so the policy table can compare against plain strings.
fn role_wire_name(role: Role) -> &'static str {
    match role {
        Role::CloudAdmin => "cloudadmin",
        Role::ItSec => "itsec",
        Role::SysAdmin => "sysadmin",
        Role::NetAdmin => "netadmin",
        Role::Developer => "developer",
        Role::ProjectManager => "projectmanager",
    }
}

fn requirement_for(verb: &str) -> RoleRequirement {
    POLICY
        .iter()
        .find(|(name, _)| *name == verb)
        .map(|(_, req)| *req)
        .unwrap_or(RoleRequirement::AnyOf(&[Role::CloudAdmin]))
}

/// Authorizes `ctx` to call `verb`. Admins bypass every check. A caller
/// holding `ProjectManager` in `ctx.project_id` also bypasses the
/// per-verb role table — project managers administer their own
/// project's resources without needing every operational role
/// individually granted.
pub fn authorize(ctx: &RequestContext, verb: &str) -> Result<()> {
    if ctx.is_admin {
        return Ok(());
    }
    if ctx.roles.iter().any(|r| r == role_wire_name(Role::ProjectManager)) {
        return Ok(());
    }
    match requirement_for(verb) {
        RoleRequirement::AnyProjectMember => {
            if ctx.project_id.is_empty() {
                return Err(CloudError::Unauthorized(format!(
                    "{verb} requires project membership"
                )));
            }
            Ok(())
        }
        RoleRequirement::AnyOf(roles) => {
            let held = roles.iter().any(|role| ctx.roles.iter().any(|r| r == role_wire_name(*role)));
            if held {
                Ok(())
            } else {
                Err(CloudError::Unauthorized(format!(
                    "{verb} requires one of {:?}",
                    roles
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(roles: &[&str], is_admin: bool) -> RequestContext {
        RequestContext {
            request_id: "req-1".into(),
            user_id: "bob".into(),
            project_id: "acme".into(),
            is_admin,
            roles: roles.iter().map(|s| s.to_string()).collect(),
            remote_address: None,
            read_deleted: false,
        }
    }

    #[test]
    fn admin_bypasses_every_check() {
        authorize(&ctx(&[], true), "RunInstances").unwrap();
        authorize(&ctx(&[], true), "DeleteSecurityGroup").unwrap();
    }

    #[test]
    fn project_manager_bypasses_role_table() {
        authorize(&ctx(&["projectmanager"], false), "RunInstances").unwrap();
    }

    #[test]
    fn developer_can_run_instances_but_not_manage_addresses() {
        authorize(&ctx(&["developer"], false), "RunInstances").unwrap();
        assert!(authorize(&ctx(&["developer"], false), "AllocateAddress").is_err());
    }

    #[test]
    fn unlisted_verb_defaults_to_admin_only() {
        assert!(authorize(&ctx(&["developer"], false), "SomeFutureVerb").is_err());
        authorize(&ctx(&[], true), "SomeFutureVerb").unwrap();
    }

    #[test]
    fn any_project_member_requirement_needs_a_project() {
        let mut request_ctx = ctx(&["developer"], false);
        authorize(&request_ctx, "DescribeInstances").unwrap();
        request_ctx.project_id = String::new();
        assert!(authorize(&request_ctx, "DescribeInstances").is_err());
    }
}
