//! Marzban Control Core Library
//!
//! Administers a Marzban panel's admin accounts and backs up panel state.
//!
//! This crate provides the core functionality for:
//! - Authenticated access to the panel API with retry and token refresh
//! - A local SQLite mirror of admin state with a sync cursor
//! - Reconciliation between the panel and the local mirror
//! - Scheduled, atomic backup archives with retention pruning and restore
//! - A command interface consumed by the presentation layer

pub mod backup;
pub mod commands;
pub mod config;
pub mod panel;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;
