//! Nimbus host library: configuration and the cloud types this host can run.

pub mod catalog;
pub mod config;
