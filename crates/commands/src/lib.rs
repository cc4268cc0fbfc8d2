//! Prefix commands: registration, alias resolution, per-conversation
//! cooldowns and dispatch.

pub mod command;
pub mod dispatcher;

pub use {
    command::{Command, CommandContext, CommandHandler, CommandSummary, handler_fn},
    dispatcher::{Dispatcher, parse_invocation},
};
