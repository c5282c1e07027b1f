//! CLI domain: parse, route and presentation only.
//! No domain orchestration; a single route table dispatches to the
//! orchestrator and registry.

mod parse;
mod presentation;
mod route;

pub use parse::{Cli, Commands, ConfigCommands};
pub use route::RunContext;
