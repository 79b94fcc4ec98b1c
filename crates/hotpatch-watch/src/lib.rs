//! Hotpatch Watch - filesystem watching, directory-change cache, debouncing

pub mod cache;
pub mod debounce;
pub mod watcher;

pub use cache::{Directory, DirectoryCache};
pub use debounce::Debouncer;
pub use watcher::{FakeWatcher, FsWatcher, PathWatcher};
