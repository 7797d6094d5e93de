//! DN (distinguished name) conventions for the directory backend.
//! Schema-version selection is a sealed enum, not scattered runtime
//! string branching.

use serde::{Deserialize, Serialize};

/// Directory connection + DN-mapping configuration, loaded once into
/// an immutable struct rather than read piecemeal from global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u8,
    #[serde(default = "default_ldap_url")]
    pub ldap_url: String,
    #[serde(default = "default_user_dn")]
    pub bind_dn: String,
    #[serde(default = "default_password")]
    pub bind_password: String,
    #[serde(default = "default_user_id_attribute")]
    pub user_id_attribute: String,
    #[serde(default = "default_user_subtree")]
    pub user_subtree: String,
    #[serde(default = "default_project_subtree")]
    pub project_subtree: String,
    #[serde(default = "default_role_project_subtree")]
    pub role_project_subtree: String,
    #[serde(default)]
    pub modify_only: bool,
    #[serde(default = "default_cloudadmin_dn")]
    pub cloudadmin_dn: String,
    #[serde(default = "default_itsec_dn")]
    pub itsec_dn: String,
    #[serde(default = "default_sysadmin_dn")]
    pub sysadmin_dn: String,
    #[serde(default = "default_netadmin_dn")]
    pub netadmin_dn: String,
    #[serde(default = "default_developer_dn")]
    pub developer_dn: String,
}

fn default_schema_version() -> u8 {
    2
}
fn default_ldap_url() -> String {
    "ldap://localhost".to_string()
}
fn default_user_dn() -> String {
    "cn=Manager,dc=example,dc=com".to_string()
}
fn default_password() -> String {
    "changeme".to_string()
}
fn default_user_id_attribute() -> String {
    "uid".to_string()
}
fn default_user_subtree() -> String {
    "ou=Users,dc=example,dc=com".to_string()
}
fn default_project_subtree() -> String {
    "ou=Groups,dc=example,dc=com".to_string()
}
fn default_role_project_subtree() -> String {
    "ou=Groups,dc=example,dc=com".to_string()
}
fn default_cloudadmin_dn() -> String {
    "cn=cloudadmins,ou=Groups,dc=example,dc=com".to_string()
}
fn default_itsec_dn() -> String {
    "cn=itsec,ou=Groups,dc=example,dc=com".to_string()
}
fn default_sysadmin_dn() -> String {
    "cn=sysadmins,ou=Groups,dc=example,dc=com".to_string()
}
fn default_netadmin_dn() -> String {
    "cn=netadmins,ou=Groups,dc=example,dc=com".to_string()
}
fn default_developer_dn() -> String {
    "cn=developers,ou=Groups,dc=example,dc=com".to_string()
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        DirectoryConfig {
            schema_version: default_schema_version(),
            ldap_url: default_ldap_url(),
            bind_dn: default_user_dn(),
            bind_password: default_password(),
            user_id_attribute: default_user_id_attribute(),
            user_subtree: default_user_subtree(),
            project_subtree: default_project_subtree(),
            role_project_subtree: default_role_project_subtree(),
            modify_only: false,
            cloudadmin_dn: default_cloudadmin_dn(),
            itsec_dn: default_itsec_dn(),
            sysadmin_dn: default_sysadmin_dn(),
            netadmin_dn: default_netadmin_dn(),
            developer_dn: default_developer_dn(),
        }
    }
}

/// Schema quirks that differ between the legacy (v1) and current (v2)
/// directory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaQuirks {
    pub project_pattern: &'static str,
    pub isadmin_attribute: &'static str,
    pub project_attribute: &'static str,
    pub project_objectclass: &'static str,
}

pub fn schema_quirks(version: u8) -> SchemaQuirks {
    if version == 1 {
        SchemaQuirks {
            project_pattern: "(objectclass=novaProject)",
            isadmin_attribute: "isAdmin",
            project_attribute: "projectManager",
            project_objectclass: "novaProject",
        }
    } else {
        SchemaQuirks {
            project_pattern: "(owner=*)",
            isadmin_attribute: "isNovaAdmin",
            project_attribute: "owner",
            project_objectclass: "groupOfNames",
        }
    }
}

pub fn user_dn(cfg: &DirectoryConfig, user_id: &str) -> String {
    format!("{}={},{}", cfg.user_id_attribute, user_id, cfg.user_subtree)
}

pub fn project_dn(cfg: &DirectoryConfig, project_id: &str) -> String {
    format!("cn={},{}", project_id, cfg.project_subtree)
}

pub fn project_role_dn(cfg: &DirectoryConfig, role: cloud_core::model::Role, project_id: &str) -> String {
    format!(
        "cn={},cn={},{}",
        role_cn(role),
        project_id,
        cfg.role_project_subtree
    )
}

/// Global role DN — one well-known DN per role, no project scoping.
/// `ProjectManager` has no group: it is derived from
/// `Project::manager_user_id`, never stored as a role binding.
pub fn global_role_dn(cfg: &DirectoryConfig, role: cloud_core::model::Role) -> Option<String> {
    use cloud_core::model::Role::*;
    match role {
        CloudAdmin => Some(cfg.cloudadmin_dn.clone()),
        ItSec => Some(cfg.itsec_dn.clone()),
        SysAdmin => Some(cfg.sysadmin_dn.clone()),
        NetAdmin => Some(cfg.netadmin_dn.clone()),
        Developer => Some(cfg.developer_dn.clone()),
        ProjectManager => None,
    }
}

fn role_cn(role: cloud_core::model::Role) -> &'static str {
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
