pub mod bootstrap;
pub mod config;
pub mod keys;
pub mod logging;

pub use config::Config;
pub use keys::KeyBuilder;
