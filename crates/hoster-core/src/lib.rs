//! Shared foundation for the hoster control plane.
//!
//! Everything here is consumed by the store, runtime, cloud, and engine
//! crates: reference-ID handling, resource arithmetic, the authenticated
//! caller context, the user-facing error taxonomy, and the top-level
//! configuration types.

pub mod auth;
pub mod config;
pub mod error;
pub mod id;
pub mod resources;

pub use error::{Error, Result};
