//! `CloudController`: the aggregate that owns every collaborator a verb
//! handler needs and wires them together.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use cloud_directory::Directory;
use cloud_net::NetworkAllocator;
use cloud_quota::QuotaEngine;
use cloud_rpc::Dispatcher;
use cloud_state::StateStore;
use cloud_volume::VolumeController;
use cloud_zone::ZoneManager;

use crate::image::ImageService;

/// Aggregate root handed to every verb handler module. Construction is
/// cheap (everything is an `Arc` clone); the expensive setup — pool
/// connections, background loops — happens once in `cloudd`'s startup.
pub struct CloudController {
    pub store: Arc<dyn StateStore>,
    pub directory: Arc<dyn Directory>,
    pub quota: Arc<QuotaEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub network: Arc<NetworkAllocator>,
    pub volumes: Arc<VolumeController>,
    pub zones: Arc<ZoneManager>,
    pub images: Arc<dyn ImageService>,
    pub availability_zone: String,
    /// In-process EC2-id sequence counter. A production deployment
    /// would persist this counter in `cloud-state` so it survives
    /// restarts without reusing ids; kept in-process here to avoid
    /// widening `StateStore` for a single counter.
    sequence: AtomicU32,
}

impl CloudController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StateStore>,
        directory: Arc<dyn Directory>,
        quota: Arc<QuotaEngine>,
        dispatcher: Arc<Dispatcher>,
        network: Arc<NetworkAllocator>,
        volumes: Arc<VolumeController>,
        zones: Arc<ZoneManager>,
        images: Arc<dyn ImageService>,
        availability_zone: impl Into<String>,
    ) -> Self {
        CloudController {
            store,
            directory,
            quota,
            dispatcher,
            network,
            volumes,
            zones,
            images,
            availability_zone: availability_zone.into(),
            sequence: AtomicU32::new(1),
        }
    }

    /// Next numeric sequence value for minting an EC2-shaped id
    /// (`cloud_core::naming::ec2_id`).
    pub fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }
}
