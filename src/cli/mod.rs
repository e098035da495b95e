//! Command-line interface.

pub mod commands;
pub mod handlers;

pub use commands::Cli;
pub use commands::Commands;
pub use commands::ConfigCommands;
pub use commands::OrderArg;
