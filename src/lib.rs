//! # cloud — EC2-compatible IaaS control plane core
//!
//! Facade crate that re-exports the workspace crates so consumers can
//! depend on a single `cloud` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | cloud-core | Entities, error taxonomy, signer, naming, protocol |
//! | [`directory`] | cloud-directory | Identity Store adapter (C1) |
//! | [`state`] | cloud-state | Persistent State API (C4) |
//! | [`rpc`] | cloud-rpc | RPC dispatcher (C5) |
//! | [`quota`] | cloud-quota | Quota Engine (C12) |
//! | [`net`] | cloud-net | Network Allocator, Firewall Compiler, Metadata Service (C6, C7, C11) |
//! | [`volume`] | cloud-volume | Volume Controller (C8) |
//! | [`zone`] | cloud-zone | Zone Manager (C9) |
//! | [`controller`] | cloud-controller | Cloud Controller verb surface + server (C3, C10) |
//! | [`cli`] | cloud-cli | `cloudctl` admin CLI command tree |

pub use cloud_cli as cli;
pub use cloud_controller as controller;
pub use cloud_core as core;
pub use cloud_directory as directory;
pub use cloud_net as net;
pub use cloud_quota as quota;
pub use cloud_rpc as rpc;
pub use cloud_state as state;
pub use cloud_volume as volume;
pub use cloud_zone as zone;
