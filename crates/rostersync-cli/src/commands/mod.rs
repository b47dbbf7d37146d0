//! CLI subcommands

pub mod batch;
pub mod cache;
pub mod config;
