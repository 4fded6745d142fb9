pub mod config;
pub mod core;
pub mod database;
pub mod services;

pub use crate::config::MuterConfig;
pub use crate::core::watcher::{FeedWatcher, ScanReport, WatcherHandle};
