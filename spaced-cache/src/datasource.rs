//! The lookup surface the rest of the daemon talks to.

use std::future::Future;
use std::path::Path;

use spaced_core::types::{DirEntry, EntryKind};
use spaced_core::RequestContext;

use crate::error::DataSourceError;
use crate::stream::{OpenMode, ScopedStream};

/// Caller-scoped access to file and directory metadata.
///
/// Every call checks the context's caller against the path before doing
/// anything else, and gives up as soon as the context is canceled or past its
/// deadline.
pub trait DataSource: Send + Sync {
    fn get(
        &self,
        ctx: &RequestContext,
        path: &Path,
    ) -> impl Future<Output = Result<DirEntry, DataSourceError>> + Send;

    /// Children of a directory, sorted by name.
    fn get_children(
        &self,
        ctx: &RequestContext,
        path: &Path,
    ) -> impl Future<Output = Result<Vec<DirEntry>, DataSourceError>> + Send;

    fn open(
        &self,
        ctx: &RequestContext,
        path: &Path,
        mode: OpenMode,
    ) -> impl Future<Output = Result<ScopedStream, DataSourceError>> + Send;

    fn create_entry(
        &self,
        ctx: &RequestContext,
        path: &Path,
        kind: EntryKind,
    ) -> impl Future<Output = Result<DirEntry, DataSourceError>> + Send;

    fn rename_entry(
        &self,
        ctx: &RequestContext,
        from: &Path,
        to: &Path,
    ) -> impl Future<Output = Result<(), DataSourceError>> + Send;

    fn delete_entry(
        &self,
        ctx: &RequestContext,
        path: &Path,
    ) -> impl Future<Output = Result<(), DataSourceError>> + Send;
}
