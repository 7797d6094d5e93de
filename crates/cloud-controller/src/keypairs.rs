//! Key pair verbs. Key pairs live on the owning `User` in the identity
//! store (C1), not in `cloud-state` — there is no fleet-wide reason to
//! fan a key pair change out to any host.

use cloud_core::error::Result;
use cloud_core::model::KeyPair;
use cloud_core::protocol::RequestContext;
use cloud_directory::Directory;

use crate::controller::CloudController;

pub async fn create_key_pair(controller: &CloudController, ctx: &RequestContext, name: &str) -> Result<KeyPair> {
    controller.directory.generate_key_pair(&ctx.user_id, name).await
}

pub async fn delete_key_pair(controller: &CloudController, ctx: &RequestContext, name: &str) -> Result<()> {
    controller.directory.delete_key_pair(&ctx.user_id, name).await
}

pub async fn describe_key_pairs(controller: &CloudController, ctx: &RequestContext) -> Result<Vec<KeyPair>> {
    let user = controller.directory.get_user(&ctx.user_id).await?;
    Ok(user.key_pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::FakeImageService;
    use cloud_directory::fake::FakeDirectory;
    use cloud_net::{NetworkAllocator, NetworkConfig};
    use cloud_quota::{QuotaDefaults, QuotaEngine, QuotaLimits};
    use cloud_rpc::Dispatcher;
    use cloud_state::SqliteStateStore;
    use cloud_volume::VolumeController;
    use cloud_zone::{NullZoneProbe, ZoneManager, ZoneManagerConfig};
    use std::sync::Arc;
    use std::time::Duration;

    async fn fixture() -> (CloudController, RequestContext) {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        let directory = Arc::new(FakeDirectory::new());
        directory.create_user("bob", "AKIABOB", "secret", false).await.unwrap();
        let limits = QuotaLimits::new(QuotaDefaults::default());
        let quota = Arc::new(QuotaEngine::new(store.clone(), limits, Duration::from_secs(300)));
        let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(5)));
        let network = Arc::new(NetworkAllocator::new(store.clone(), NetworkConfig::default()));
        let volumes = Arc::new(VolumeController::new(store.clone(), quota.clone(), 100));
        let zones = Arc::new(ZoneManager::new(
            store.clone(),
            Arc::new(NullZoneProbe),
            ZoneManagerConfig::default(),
        ));
        let images = Arc::new(FakeImageService::new());
        let controller = CloudController::new(store, directory, quota, dispatcher, network, volumes, zones, images, "nova");
        let ctx = RequestContext {
            request_id: "req-1".to_string(),
            user_id: "bob".to_string(),
            project_id: "acme".to_string(),
            is_admin: false,
            roles: Vec::new(),
            remote_address: None,
            read_deleted: false,
        };
        (controller, ctx)
    }

    #[tokio::test]
    async fn create_then_describe_then_delete() {
        let (controller, ctx) = fixture().await;
        let pair = create_key_pair(&controller, &ctx, "laptop").await.unwrap();
        assert_eq!(pair.name, "laptop");

        let pairs = describe_key_pairs(&controller, &ctx).await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].name, "laptop");

        delete_key_pair(&controller, &ctx, "laptop").await.unwrap();
        assert!(describe_key_pairs(&controller, &ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let (controller, ctx) = fixture().await;
        create_key_pair(&controller, &ctx, "laptop").await.unwrap();
        assert!(create_key_pair(&controller, &ctx, "laptop").await.is_err());
    }
}
