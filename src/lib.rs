//! OCI Monitor: node-resident install daemon for an OCI-bundled storage service
//!
//! Runs on every Kubernetes node, installs or upgrades the host service from
//! a container image, and reacts to node labels and local REST requests.

pub mod config;
pub mod controller;
pub mod error;
pub mod host;
pub mod labels;
pub mod monitor;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
