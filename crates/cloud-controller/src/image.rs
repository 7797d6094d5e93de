//! Image store seam. No `Image` entity lives in `cloud-core::model` and
//! `cloud-state::StateStore` has no image methods — the image registry
//! is an external collaborator this repo talks to, not one it owns
//! (an explicit non-goal of this control plane), mirroring how `cloud-directory::Directory`
//! and `cloud-zone::ZoneProbe` seam out their own external backends.

use async_trait::async_trait;
use cloud_core::error::{CloudError, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerType {
    Ami,
    Kernel,
    Ramdisk,
}

/// `RunInstances` only accepts images in `Available` state.
/// This control plane never drives the transition out of `Pending`
/// itself — that belongs to the external image store — so `register`
/// marks a new image `Available` immediately, matching how `FakeImageService`
/// stands in for a store that already has the bits in place by the
/// time `RegisterImage` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Available,
    Pending,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ImageMetadata {
    pub id: String,
    pub owner_project_id: String,
    pub container_type: ContainerType,
    pub state: ImageState,
    pub is_public: bool,
    /// Project ids granted `launchPermission` when not public.
    pub shared_with: Vec<String>,
}

/// Only `ami`-typed images may be deregistered; kernels/ramdisks are
/// referenced by running instances and are immutable once registered.
#[async_trait]
pub trait ImageService: Send + Sync {
    async fn register(&self, owner_project_id: &str, container_type: ContainerType) -> Result<ImageMetadata>;
    async fn deregister(&self, image_id: &str) -> Result<()>;
    async fn get(&self, image_id: &str) -> Result<ImageMetadata>;
    async fn list(&self, project_id: &str) -> Result<Vec<ImageMetadata>>;

    /// `modifyImageAttribute` supports only the `launchPermission`
    /// attribute with `group=all` (make public) or a project id
    /// (share with one project) — no other attribute name is
    /// accepted.
    async fn add_launch_permission(&self, image_id: &str, project_id_or_all: &str) -> Result<()>;
    async fn remove_launch_permission(&self, image_id: &str, project_id_or_all: &str) -> Result<()>;
}

/// In-memory `ImageService` for tests and for standalone `cloudd` runs
/// without a real image registry configured.
#[derive(Default)]
pub struct FakeImageService {
    images: RwLock<HashMap<String, ImageMetadata>>,
    sequence: std::sync::atomic::AtomicU32,
}

impl FakeImageService {
    pub fn new() -> Self {
        FakeImageService::default()
    }
}

#[async_trait]
impl ImageService for FakeImageService {
    async fn register(&self, owner_project_id: &str, container_type: ContainerType) -> Result<ImageMetadata> {
        let sequence = self.sequence.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        let prefix = match container_type {
            ContainerType::Ami => "ami",
            ContainerType::Kernel => "aki",
            ContainerType::Ramdisk => "ari",
        };
        let id = cloud_core::naming::ec2_id(prefix, sequence);
        let metadata = ImageMetadata {
            id: id.clone(),
            owner_project_id: owner_project_id.to_string(),
            container_type,
            state: ImageState::Available,
            is_public: false,
            shared_with: Vec::new(),
        };
        self.images.write().await.insert(id, metadata.clone());
        Ok(metadata)
    }

    async fn deregister(&self, image_id: &str) -> Result<()> {
        let mut images = self.images.write().await;
        let metadata = images
            .get(image_id)
            .ok_or_else(|| CloudError::NotFound(image_id.to_string()))?;
        if metadata.container_type != ContainerType::Ami {
            return Err(CloudError::ApiError(format!(
                "image {image_id} is not an ami and cannot be deregistered"
            )));
        }
        images.remove(image_id);
        Ok(())
    }

    async fn get(&self, image_id: &str) -> Result<ImageMetadata> {
        self.images
            .read()
            .await
            .get(image_id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(image_id.to_string()))
    }

    async fn list(&self, project_id: &str) -> Result<Vec<ImageMetadata>> {
        Ok(self
            .images
            .read()
            .await
            .values()
            .filter(|m| m.owner_project_id == project_id || m.is_public || m.shared_with.iter().any(|p| p == project_id))
            .cloned()
            .collect())
    }

    async fn add_launch_permission(&self, image_id: &str, project_id_or_all: &str) -> Result<()> {
        let mut images = self.images.write().await;
        let metadata = images
            .get_mut(image_id)
            .ok_or_else(|| CloudError::NotFound(image_id.to_string()))?;
        if project_id_or_all == "all" {
            metadata.is_public = true;
        } else if !metadata.shared_with.iter().any(|p| p == project_id_or_all) {
            metadata.shared_with.push(project_id_or_all.to_string());
        }
        Ok(())
    }

    async fn remove_launch_permission(&self, image_id: &str, project_id_or_all: &str) -> Result<()> {
        let mut images = self.images.write().await;
        let metadata = images
            .get_mut(image_id)
            .ok_or_else(|| CloudError::NotFound(image_id.to_string()))?;
        if project_id_or_all == "all" {
            metadata.is_public = false;
        } else {
            metadata.shared_with.retain(|p| p != project_id_or_all);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_assigns_ami_prefixed_id() {
        let svc = FakeImageService::new();
        let image = svc.register("acme", ContainerType::Ami).await.unwrap();
        assert!(image.id.starts_with("ami-"));
    }

    #[tokio::test]
    async fn deregister_rejects_non_ami() {
        let svc = FakeImageService::new();
        let kernel = svc.register("acme", ContainerType::Kernel).await.unwrap();
        assert!(svc.deregister(&kernel.id).await.is_err());
    }

    #[tokio::test]
    async fn deregister_removes_ami() {
        let svc = FakeImageService::new();
        let image = svc.register("acme", ContainerType::Ami).await.unwrap();
        svc.deregister(&image.id).await.unwrap();
        assert!(svc.get(&image.id).await.is_err());
    }

    #[tokio::test]
    async fn launch_permission_group_all_makes_public() {
        let svc = FakeImageService::new();
        let image = svc.register("acme", ContainerType::Ami).await.unwrap();
        svc.add_launch_permission(&image.id, "all").await.unwrap();
        assert!(svc.get(&image.id).await.unwrap().is_public);
        svc.remove_launch_permission(&image.id, "all").await.unwrap();
        assert!(!svc.get(&image.id).await.unwrap().is_public);
    }

    #[tokio::test]
    async fn list_is_scoped_to_owner_public_and_shared() {
        let svc = FakeImageService::new();
        let owned = svc.register("acme", ContainerType::Ami).await.unwrap();
        let other = svc.register("other", ContainerType::Ami).await.unwrap();
        svc.add_launch_permission(&other.id, "acme").await.unwrap();
        let unrelated = svc.register("third", ContainerType::Ami).await.unwrap();

        let visible = svc.list("acme").await.unwrap();
        let ids: Vec<_> = visible.iter().map(|i| i.id.clone()).collect();
        assert!(ids.contains(&owned.id));
        assert!(ids.contains(&other.id));
        assert!(!ids.contains(&unrelated.id));
    }

    #[tokio::test]
    async fn launch_permission_project_shares_with_one_project() {
        let svc = FakeImageService::new();
        let image = svc.register("acme", ContainerType::Ami).await.unwrap();
        svc.add_launch_permission(&image.id, "other-project").await.unwrap();
        let fetched = svc.get(&image.id).await.unwrap();
        assert_eq!(fetched.shared_with, vec!["other-project".to_string()]);
    }
}
