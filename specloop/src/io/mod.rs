//! I/O helpers for orchestrator commands.

pub mod activity;
pub mod config;
pub mod fsutil;
pub mod gateway;
pub mod init;
pub mod policy;
pub mod process;
pub mod prompt;
pub mod reasoner;
pub mod spec_provider;
pub mod spec_store;
pub mod state_file;
