#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared operator configuration for the `ruvltra` code-assistance service.

pub mod config;

pub use config::{
    HttpFormat, RuvltraConfig, config_path, default_state_dir, load_config, save_config,
};
