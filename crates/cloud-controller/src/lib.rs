pub mod addresses;
pub mod config;
pub mod controller;
pub mod http;
pub mod image;
pub mod instances;
pub mod keypairs;
pub mod policy;
pub mod security_groups;
pub mod volumes;
pub mod xml;

pub use config::CloudConfig;
pub use controller::CloudController;
