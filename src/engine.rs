//! The async filesystem contract the spill machinery runs on.

use async_trait::async_trait;
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;
use tokio::task;

/// Handle to an open spill file.
///
/// Every outstanding I/O operation holds a clone, so the descriptor stays
/// open until the last operation has unwound — possibly after the channel
/// itself is gone. Dropping the last clone closes the descriptor.
pub type SpillFile = Arc<File>;

/// Filesystem operations used by the spill reader and writer.
///
/// The channel only issues positional reads and writes, so implementations
/// carry no cursor state. Cancellation is the caller's concern: a cancelled
/// request simply has its completion discarded.
#[async_trait]
pub trait IoEngine: Send + Sync + 'static {
    /// Creates `path` exclusively with mode `0600`, open for reading and
    /// writing. Fails with `AlreadyExists` if the path is taken.
    async fn create(&self, path: &Path) -> io::Result<SpillFile>;

    /// Writes `buf` at `offset`, returning the number of bytes written.
    async fn write_at(&self, file: &SpillFile, buf: Bytes, offset: u64) -> io::Result<usize>;

    /// Reads up to `len` bytes at `offset`.
    async fn read_at(&self, file: &SpillFile, len: usize, offset: u64) -> io::Result<Bytes>;

    /// Removes `path` from the filesystem.
    async fn unlink(&self, path: &Path) -> io::Result<()>;
}

/// [`IoEngine`] backed by the local filesystem.
///
/// Positional I/O is dispatched to the blocking thread pool, since tokio's
/// file API exposes no `pread`/`pwrite` equivalents.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskEngine;

fn join_error(err: task::JoinError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

#[async_trait]
impl IoEngine for DiskEngine {
    async fn create(&self, path: &Path) -> io::Result<SpillFile> {
        let path = path.to_owned();
        task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)?;
            Ok(Arc::new(file))
        })
        .await
        .map_err(join_error)?
    }

    async fn write_at(&self, file: &SpillFile, buf: Bytes, offset: u64) -> io::Result<usize> {
        let file = Arc::clone(file);
        task::spawn_blocking(move || file.write_at(&buf, offset))
            .await
            .map_err(join_error)?
    }

    async fn read_at(&self, file: &SpillFile, len: usize, offset: u64) -> io::Result<Bytes> {
        let file = Arc::clone(file);
        task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            let n = file.read_at(&mut buf, offset)?;
            buf.truncate(n);
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(join_error)?
    }

    async fn unlink(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}
