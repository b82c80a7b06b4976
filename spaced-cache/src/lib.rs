//! # spaced-cache
//!
//! Metadata cache and data source over the storage node.
//!
//! [`MetadataCache`] implements [`DataSource`] on top of any [`NodeBackend`];
//! [`FsBackend`] is the local-disk backend the daemon uses. Watch events fed
//! to [`MetadataCache::apply`] keep the cache honest.

pub mod backend;
pub mod cache;
pub mod datasource;
pub mod error;
pub mod stream;

pub use backend::{FsBackend, NodeBackend};
pub use cache::{CacheStats, MetadataCache};
pub use datasource::DataSource;
pub use error::{BackendError, DataSourceError};
pub use stream::{OpenMode, ScopedStream, StreamStats};
