//!
//! Lifecycle management for hybrid Kubernetes nodes: installing the node
//! components, joining the node to a cluster, upgrading it in place and
//! removing everything again.
//!
pub mod artifact;
pub mod cluster;
pub mod components;
pub mod config;
pub mod creds;
pub mod daemon;
pub mod flows;
pub mod host;
pub mod layout;
pub mod node_provider;
pub mod packages;
pub mod remediation;
pub mod safe_remove;
pub mod system;
pub mod tracker;
pub mod validation;

#[cfg(test)]
mod testing;
