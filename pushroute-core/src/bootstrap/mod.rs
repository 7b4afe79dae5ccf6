//! Bootstrap helpers for the `pushroute` binary

pub mod config;

pub use config::load_config;
