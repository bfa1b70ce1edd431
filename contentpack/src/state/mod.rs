//! Installation state: per-pack records and their durable store.
//!
//! The store is loaded and reconciled once at startup, mutated only by the
//! pipeline stages, and flushed on shutdown.

mod record;
mod store;

pub use record::{InstallStatus, InstallationRecord};
pub use store::{InstallationStore, ReconcileChange, STATE_FORMAT_VERSION};
