//! Data types shared by the hybrid node tooling: the user supplied
//! `NodeConfig` document, the cluster metadata derived from the EKS API and
//! the release manifest that lists downloadable node artifacts.
pub mod cluster;
pub mod manifest;
pub mod node_config;
