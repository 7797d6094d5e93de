pub mod dn;
pub mod fake;
pub mod ldap;

use async_trait::async_trait;
use cloud_core::error::Result;
use cloud_core::model::{KeyPair, Project, Role, User};

/// Identity Store adapter (C1). A sealed set of backends share this
/// capability contract — no runtime driver name lookup by configured
/// string.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn create_user(&self, id: &str, access_key: &str, secret_key: &str, admin: bool) -> Result<User>;
    async fn get_user(&self, id: &str) -> Result<User>;
    async fn get_user_by_access_key(&self, access_key: &str) -> Result<User>;
    async fn delete_user(&self, id: &str) -> Result<()>;

    /// Defaults `description` to `name` if the caller passes an empty
    /// string.
    async fn create_project(
        &self,
        id: &str,
        name: &str,
        manager_user_id: &str,
        description: &str,
    ) -> Result<Project>;
    async fn modify_project(&self, id: &str, description: Option<&str>) -> Result<()>;
    async fn add_to_project(&self, user_id: &str, project_id: &str) -> Result<()>;
    /// Also removes the user from every role group nested under the
    /// project; deleting a group's last member deletes the group.
    async fn remove_from_project(&self, user_id: &str, project_id: &str) -> Result<()>;
    async fn is_in_project(&self, user_id: &str, project_id: &str) -> Result<bool>;

    /// Auto-creates the role group if it does not already exist.
    async fn add_role(&self, user_id: &str, role: Role, project_id: Option<&str>) -> Result<()>;
    async fn remove_role(&self, user_id: &str, role: Role, project_id: Option<&str>) -> Result<()>;
    async fn has_role(&self, user_id: &str, role: Role, project_id: Option<&str>) -> Result<bool>;
    async fn get_user_roles(&self, user_id: &str, project_id: Option<&str>) -> Result<Vec<Role>>;

    async fn generate_key_pair(&self, user_id: &str, name: &str) -> Result<KeyPair>;
    async fn delete_key_pair(&self, user_id: &str, name: &str) -> Result<()>;

    /// Returns (cert_pem, private_key_pem).
    async fn generate_x509_cert(&self, user_id: &str, project_id: &str) -> Result<(String, String)>;
}
