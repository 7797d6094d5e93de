pub mod capabilities;
pub mod manager;

pub use manager::{NullZoneProbe, ZoneManager, ZoneManagerConfig, ZoneProbe};
