//! CLI command modules.

pub mod chat;
pub mod control;
pub mod session;
pub mod watch;
