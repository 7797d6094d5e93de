//! `cloudd`: the Cloud Controller server process. Parses its TOML
//! config, wires up every collaborator (C1, C4-C9, C12) behind their
//! trait seams, and serves the EC2 wire surface plus the metadata
//! service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cloud_controller::config::{CloudConfig, DirectoryDriver};
use cloud_controller::{http, CloudController};
use cloud_directory::fake::FakeDirectory;
use cloud_directory::ldap::LdapDirectory;
use cloud_directory::Directory;
use cloud_net::metadata;
use cloud_net::network::{NetworkAllocator, NetworkConfig};
use cloud_quota::{QuotaEngine, QuotaLimits};
use cloud_rpc::Dispatcher;
use cloud_state::{SqliteStateStore, StateStore};
use cloud_volume::VolumeController;
use cloud_zone::{NullZoneProbe, ZoneManager, ZoneManagerConfig};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "cloudd", version, about = "EC2-compatible cloud controller daemon")]
struct Cli {
    /// Path to the TOML config file. Missing file falls back to defaults.
    #[arg(long, default_value = "cloudd.toml")]
    config: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = match std::fs::metadata(&cli.config) {
        Ok(_) => CloudConfig::from_file(std::path::Path::new(&cli.config))?,
        Err(_) => {
            info!(path = %cli.config, "no config file found, using defaults");
            CloudConfig::default()
        }
    };

    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(serve(config))
}

async fn serve(config: CloudConfig) -> Result<()> {
    let store: Arc<dyn StateStore> = Arc::new(
        SqliteStateStore::connect(&format!("sqlite://{}?mode=rwc", config.server.state_path))
            .await
            .with_context(|| format!("failed to open state store at {}", config.server.state_path))?,
    );

    let directory: Arc<dyn Directory> = match config.directory.driver {
        DirectoryDriver::Fake => Arc::new(FakeDirectory::new()),
        DirectoryDriver::Ldap => Arc::new(LdapDirectory::new(config.directory.ldap.clone())),
    };

    let limits = QuotaLimits::new(config.quota.clone());
    let quota = Arc::new(QuotaEngine::new(
        store.clone(),
        limits,
        Duration::from_secs(config.server.quota_reservation_ttl_secs),
    ));

    let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(config.server.rpc_timeout_secs)));

    let network_config = NetworkConfig {
        mode: config.network.mode,
        bridge_name: config.network.bridge_name.clone(),
        dhcp_lease_grace: Duration::from_secs(30),
    };
    let network = Arc::new(NetworkAllocator::new(store.clone(), network_config));

    let volumes = Arc::new(VolumeController::new(store.clone(), quota.clone(), config.server.iscsi_num_targets));

    let zone_config = ZoneManagerConfig {
        check_interval: Duration::from_secs(config.zones.db_check_interval_secs),
        failures_to_offline: config.zones.failures_to_offline,
        worker_pool_width: config.zones.worker_pool_width,
    };
    let zones = Arc::new(ZoneManager::new(store.clone(), Arc::new(NullZoneProbe), zone_config));

    let images = Arc::new(cloud_controller::image::FakeImageService::new());

    let controller = Arc::new(CloudController::new(
        store.clone(),
        directory,
        quota.clone(),
        dispatcher,
        network,
        volumes,
        zones.clone(),
        images,
        config.server.availability_zone.clone(),
    ));

    let zones_bg = zones.clone();
    tokio::spawn(async move { zones_bg.run().await });

    let quota_bg = quota.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            if let Err(e) = quota_bg.sweep_expired().await {
                tracing::warn!(error = %e, "quota reservation sweep pass failed");
            }
        }
    });

    let app = http::router(controller.clone()).merge(metadata::router(store.clone(), controller.availability_zone.clone()));

    let addr: SocketAddr = config.server.listen.parse().context("invalid server.listen address")?;
    info!(%addr, "cloudd listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
