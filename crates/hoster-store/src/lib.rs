//! Data model and storage interface for the hoster control plane.
//!
//! The [`Store`] trait is the only way the rest of the system touches durable
//! state. Transactions are scoped closures over a [`StoreTx`]: commit when the
//! closure returns `Ok`, roll back on `Err`. [`MemoryStore`] is the reference
//! implementation, used by every test suite and by `hosterd --dev`.

pub mod error;
pub mod memory;
pub mod model;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use store::{Store, StoreTx};
