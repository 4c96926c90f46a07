//! Subcommand implementations.

pub mod admit;
pub mod audit;
pub mod keys;
pub mod registry;
