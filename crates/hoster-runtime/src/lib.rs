//! Container runtime access for hoster nodes.
//!
//! The control plane talks to every node through the [`ContainerClient`]
//! trait. [`DockerClient`] implements it over a Docker socket, local or
//! forwarded; [`NodePool`] caches one client per node and owns the SSH
//! tunnels that forwarding requires.

pub mod client;
pub mod docker;
pub mod error;
pub mod logs;
pub mod pool;
pub mod ssh;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{
    ContainerClient, ContainerSpec, ContainerState, ContainerStats, ContainerSummary, LogChunk,
    LogOptions, StdStream,
};
pub use docker::DockerClient;
pub use error::{Result, RuntimeError};
pub use pool::{NodeEndpoint, NodePool};
