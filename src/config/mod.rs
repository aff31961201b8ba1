//! Configuration module for kwt-net
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use kwt_net::config::load_config;
//!
//! let config = load_config("/etc/kwt-net/config.json").unwrap();
//! println!("Forwarding {} subnets", config.subnets.len());
//! ```

mod loader;
mod types;

pub use loader::{apply_env_overrides, load_config, load_config_str, load_config_with_env};
pub use types::{
    parse_recursor, ClusterConfig, Config, DnsConfig, ListenForwardConfig, LogConfig, SshConfig,
};
