pub mod cache_cmd;
pub mod plugins;
pub mod targets;
pub mod watch;
