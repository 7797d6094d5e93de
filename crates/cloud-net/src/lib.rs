pub mod firewall;
pub mod metadata;
pub mod network;
pub mod shell;

pub use metadata::MetadataState;
pub use network::{NetworkAllocator, NetworkConfig, NetworkMode};
