//! The spaced daemon: supervises the storage node, watches the synced roots,
//! and keeps the metadata cache coherent with both.

mod error;
pub mod log_rotation;
pub mod paths;
pub mod runtime;
pub mod status;
pub mod supervisor;
pub mod watcher;

pub use error::{DaemonError, NodeError, WatchError};
pub use runtime::{init_tracing, run, run_until, start_blocking, Cache, Daemon};
pub use status::StatusSnapshot;
pub use supervisor::NodeSupervisor;
pub use watcher::{FileWatcher, WatchStream};
