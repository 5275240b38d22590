//! Config Defs

pub mod hot_reload;
pub mod load;

pub use hot_reload::spawn_config_watcher;
pub use load::{ProxyConfig, split_host_port};
