#![forbid(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Policy-gated schema and data mutations for agent-owned databases.

pub mod config;
pub mod data_ops;
pub mod db;
pub mod gateway;
pub mod migration;
pub mod policy;
pub mod schema;

#[cfg(test)]
mod test_support;

pub use config::{Config, ConfigError, LogFormat};
pub use gateway::Gateway;
