//! Command handling module.
//!
//! Parses operator commands and dispatches them to the synchronizer and the
//! backup subsystem. Commands use a configurable prefix such as `/panel`.

mod handler;
mod types;

pub use handler::CommandHandler;
pub use types::{AdminCommand, CommandReply, CreateArgs, EditArgs, ExtendArgs};
