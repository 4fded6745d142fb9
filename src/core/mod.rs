pub mod extractor;
pub mod hash;
pub mod oracle;
pub mod page;
pub mod scheduler;
pub mod watcher;
