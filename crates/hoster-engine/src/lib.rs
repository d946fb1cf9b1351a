//! The hoster control plane.
//!
//! Takes authenticated intents ("start this deployment", "provision a
//! server", "verify this domain") and drives cloud APIs, remote container
//! runtimes, and DNS to match the stored desired state. Request-scoped
//! operations live in [`engine::Engine`]; the long-running reconciliation
//! loops live in [`workers`].

pub mod authz;
pub mod compose;
pub mod dns;
pub mod domains;
pub mod engine;
pub mod orchestrator;
pub mod scheduler;
pub mod services;
pub mod testing;
pub mod vault;
pub mod workers;

pub use engine::{Engine, ProviderFactory, RegistryProviderFactory, UsageSink};
pub use hoster_core::{Error, Result};
