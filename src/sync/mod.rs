//! Synchronizer: reconciliation between the panel and the local mirror.
//!
//! Mutations are applied remote-first, local-second: the panel call must
//! succeed before the mirror is touched, so the local store never claims a
//! state the panel does not actually have.

mod engine;

pub use engine::{SyncError, SyncReport, SyncStatus, Synchronizer};
