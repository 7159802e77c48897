//! CLI command implementations

pub mod cluster;
pub mod vms;
