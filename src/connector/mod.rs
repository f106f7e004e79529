pub mod local;
#[cfg(test)]
pub(crate) mod mock;

use std::ffi::{OsStr, OsString};
use std::io;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::path::RemotePath;

/// Failure reported by a remote-storage primitive: an errno-style code plus
/// the backend's human readable rendering of it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RemoteError {
    pub code: i32,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Error carrying the OS description of `code`
    pub fn from_code(code: i32) -> Self {
        Self::new(code, io::Error::from_raw_os_error(code).to_string())
    }
}

impl From<io::Error> for RemoteError {
    fn from(e: io::Error) -> Self {
        let code = e.raw_os_error().unwrap_or(match e.kind() {
            io::ErrorKind::NotFound => libc::ENOENT,
            io::ErrorKind::PermissionDenied => libc::EACCES,
            io::ErrorKind::AlreadyExists => libc::EEXIST,
            io::ErrorKind::InvalidInput => libc::EINVAL,
            io::ErrorKind::Unsupported => libc::EOPNOTSUPP,
            _ => libc::EIO,
        });
        Self::new(code, e.to_string())
    }
}

/// Result type of every remote-storage primitive
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// File type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

/// Attribute record of a remote object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub kind: FileKind,
    /// POSIX permission bits (e.g., 0o644)
    pub perm: u16,
    pub size: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Metadata {
    /// All-zero record of the given kind
    pub fn zeroed(kind: FileKind, perm: u16) -> Self {
        Self {
            kind,
            perm,
            size: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, FileKind::Directory)
    }
}

/// Directory entry yielded by a remote directory cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDirEntry {
    pub name: OsString,
    pub kind: FileKind,
}

impl RemoteDirEntry {
    pub fn new(name: impl Into<OsString>, kind: FileKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Iteration state of an open remote directory
#[async_trait]
pub trait RemoteDir: Send {
    /// Next entry in backend order, `None` once exhausted
    async fn next_entry(&mut self) -> RemoteResult<Option<RemoteDirEntry>>;
}

/// Owned remote directory cursor
pub type DirCursor = Box<dyn RemoteDir>;

/// Descriptor of a remote file opened with `Connector::open`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteFd(pub i32);

/// Options for a third-party copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyParams {
    /// Overwrite the destination if it exists
    pub replace_existing: bool,
    /// Create missing parent directories of the destination
    pub create_parent: bool,
}

/// Remote-storage primitive API
///
/// One call per filesystem operation, addressed by fully resolved remote
/// identifiers. Failures are reported as `RemoteError` and never retried
/// by the caller.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Attributes of `url`, without following a final symlink
    async fn stat(&self, url: &RemotePath) -> RemoteResult<Metadata>;

    /// Target of the symlink at `url`, in remote identifier space
    async fn readlink(&self, url: &RemotePath) -> RemoteResult<Vec<u8>>;

    async fn opendir(&self, url: &RemotePath) -> RemoteResult<DirCursor>;

    async fn closedir(&self, cursor: DirCursor) -> RemoteResult<()>;

    async fn open(&self, url: &RemotePath, flags: i32, mode: u32) -> RemoteResult<RemoteFd>;

    /// Read up to `size` bytes at `offset`
    async fn pread(&self, fd: RemoteFd, offset: u64, size: u32) -> RemoteResult<Bytes>;

    /// Write `data` at `offset`, returning the number of bytes written
    async fn pwrite(&self, fd: RemoteFd, offset: u64, data: &[u8]) -> RemoteResult<usize>;

    async fn close(&self, fd: RemoteFd) -> RemoteResult<()>;

    async fn access(&self, url: &RemotePath, mask: i32) -> RemoteResult<()>;

    async fn unlink(&self, url: &RemotePath) -> RemoteResult<()>;

    async fn mkdir(&self, url: &RemotePath, mode: u32) -> RemoteResult<()>;

    async fn rmdir(&self, url: &RemotePath) -> RemoteResult<()>;

    async fn chmod(&self, url: &RemotePath, mode: u32) -> RemoteResult<()>;

    async fn rename(&self, from: &RemotePath, to: &RemotePath) -> RemoteResult<()>;

    /// Create a symlink at `link` pointing to `target`
    async fn symlink(&self, target: &RemotePath, link: &RemotePath) -> RemoteResult<()>;

    async fn getxattr(&self, url: &RemotePath, name: &OsStr) -> RemoteResult<Bytes>;

    async fn setxattr(
        &self,
        url: &RemotePath,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> RemoteResult<()>;

    async fn listxattr(&self, url: &RemotePath) -> RemoteResult<Vec<OsString>>;

    /// Whether this backend can address `url` at all
    ///
    /// Default implementation accepts every identifier
    fn serves(&self, _url: &RemotePath) -> bool {
        true
    }

    /// Copy `src` to `dst`, both remote identifiers
    ///
    /// Default implementation returns EOPNOTSUPP
    async fn copy(
        &self,
        _src: &RemotePath,
        _dst: &RemotePath,
        _params: CopyParams,
    ) -> RemoteResult<()> {
        Err(RemoteError::from_code(libc::EOPNOTSUPP))
    }
}
