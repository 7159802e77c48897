//! Group manager process: configuration, HTTP collaborators and the HTTP surface

pub mod api;
pub mod config;
pub mod node;
pub mod remote;
