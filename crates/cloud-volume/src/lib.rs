pub mod controller;
pub mod targets;

pub use controller::VolumeController;
pub use targets::TargetTable;
