//! Local filesystem connector
//!
//! Serves `file://` identifiers from the local filesystem. Useful for
//! staging areas exported over a shared mount and for exercising the
//! dispatcher without grid middleware.

use std::ffi::{CString, OsStr, OsString};
use std::fs::Permissions;
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::trace;

use crate::connector::{
    Connector, CopyParams, DirCursor, FileKind, Metadata, RemoteDir, RemoteDirEntry, RemoteError,
    RemoteFd, RemoteResult,
};
use crate::path::RemotePath;

/// URL scheme served by this connector
pub const FILE_SCHEME: &str = "file://";

/// Connector for `file://` identifiers
pub struct LocalConnector {
    files: DashMap<i32, Arc<std::fs::File>>,
    next_fd: AtomicI32,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self {
            files: DashMap::new(),
            // 0 is never handed out, callers treat it as a failed open
            next_fd: AtomicI32::new(1),
        }
    }

    /// Number of descriptors currently open
    pub fn open_count(&self) -> usize {
        self.files.len()
    }

    /// Resolve a `file://` identifier to an absolute local path
    fn fs_path(url: &RemotePath) -> RemoteResult<PathBuf> {
        let bytes = url.as_bytes();
        let rest = bytes.strip_prefix(FILE_SCHEME.as_bytes()).unwrap_or(bytes);
        if !rest.starts_with(b"/") {
            return Err(RemoteError::new(
                libc::EINVAL,
                format!("not an absolute file URL: {}", url),
            ));
        }
        Ok(PathBuf::from(OsStr::from_bytes(rest)))
    }

    fn file(&self, fd: RemoteFd) -> RemoteResult<Arc<std::fs::File>> {
        self.files
            .get(&fd.0)
            .map(|f| f.clone())
            .ok_or_else(|| RemoteError::from_code(libc::EBADF))
    }
}

impl Default for LocalConnector {
    fn default() -> Self {
        Self::new()
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        SystemTime::UNIX_EPOCH
    }
}

fn to_kind(ft: std::fs::FileType) -> FileKind {
    if ft.is_dir() {
        FileKind::Directory
    } else if ft.is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::File
    }
}

fn to_metadata(meta: &std::fs::Metadata) -> Metadata {
    Metadata {
        kind: to_kind(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        size: meta.size(),
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime: system_time(meta.ctime(), meta.ctime_nsec()),
    }
}

/// Run a blocking syscall off the async workers
async fn blocking<T, F>(f: F) -> RemoteResult<T>
where
    F: FnOnce() -> RemoteResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RemoteError::new(libc::EIO, format!("blocking task failed: {}", e)))?
}

fn c_string(bytes: &[u8]) -> RemoteResult<CString> {
    CString::new(bytes).map_err(|_| RemoteError::from_code(libc::EINVAL))
}

fn last_os_error() -> RemoteError {
    io::Error::last_os_error().into()
}

fn get_xattr(path: &Path, name: &OsStr) -> RemoteResult<Vec<u8>> {
    let path = c_string(path.as_os_str().as_bytes())?;
    let name = c_string(name.as_bytes())?;
    loop {
        // SAFETY: both strings are NUL terminated; a null buffer of size 0 probes the length
        let size =
            unsafe { libc::lgetxattr(path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(last_os_error());
        }
        let mut buf = vec![0u8; size as usize];
        // SAFETY: buf is valid for buf.len() bytes
        let read = unsafe {
            libc::lgetxattr(
                path.as_ptr(),
                name.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if read < 0 {
            let err = io::Error::last_os_error();
            // Value grew between the two calls
            if err.raw_os_error() == Some(libc::ERANGE) {
                continue;
            }
            return Err(err.into());
        }
        buf.truncate(read as usize);
        return Ok(buf);
    }
}

fn set_xattr(path: &Path, name: &OsStr, value: &[u8], flags: i32) -> RemoteResult<()> {
    let path = c_string(path.as_os_str().as_bytes())?;
    let name = c_string(name.as_bytes())?;
    // SAFETY: value is valid for value.len() bytes
    let ret = unsafe {
        libc::lsetxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            flags,
        )
    };
    if ret < 0 {
        return Err(last_os_error());
    }
    Ok(())
}

fn list_xattr(path: &Path) -> RemoteResult<Vec<OsString>> {
    let path = c_string(path.as_os_str().as_bytes())?;
    loop {
        // SAFETY: a null buffer of size 0 probes the length
        let size = unsafe { libc::llistxattr(path.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(last_os_error());
        }
        let mut buf = vec![0u8; size as usize];
        // SAFETY: buf is valid for buf.len() bytes
        let read = unsafe { libc::llistxattr(path.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
        if read < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ERANGE) {
                continue;
            }
            return Err(err.into());
        }
        buf.truncate(read as usize);
        return Ok(buf
            .split(|b| *b == 0)
            .filter(|name| !name.is_empty())
            .map(|name| OsString::from_vec(name.to_vec()))
            .collect());
    }
}

/// Cursor over a local directory
struct LocalDir {
    inner: tokio::fs::ReadDir,
}

#[async_trait]
impl RemoteDir for LocalDir {
    async fn next_entry(&mut self) -> RemoteResult<Option<RemoteDirEntry>> {
        match self.inner.next_entry().await? {
            Some(entry) => {
                let kind = to_kind(entry.file_type().await?);
                Ok(Some(RemoteDirEntry::new(entry.file_name(), kind)))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    fn serves(&self, url: &RemotePath) -> bool {
        Self::fs_path(url).is_ok()
    }

    async fn stat(&self, url: &RemotePath) -> RemoteResult<Metadata> {
        let path = Self::fs_path(url)?;
        trace!("stat: {:?}", path);
        let meta = tokio::fs::symlink_metadata(&path).await?;
        Ok(to_metadata(&meta))
    }

    async fn readlink(&self, url: &RemotePath) -> RemoteResult<Vec<u8>> {
        let path = Self::fs_path(url)?;
        let target = tokio::fs::read_link(&path).await?;
        let target = target.into_os_string().into_vec();
        // Absolute targets are reported in identifier space
        if target.starts_with(b"/") {
            let mut url = FILE_SCHEME.as_bytes().to_vec();
            url.extend_from_slice(&target);
            Ok(url)
        } else {
            Ok(target)
        }
    }

    async fn opendir(&self, url: &RemotePath) -> RemoteResult<DirCursor> {
        let path = Self::fs_path(url)?;
        let inner = tokio::fs::read_dir(&path).await?;
        Ok(Box::new(LocalDir { inner }))
    }

    async fn closedir(&self, cursor: DirCursor) -> RemoteResult<()> {
        drop(cursor);
        Ok(())
    }

    async fn open(&self, url: &RemotePath, flags: i32, mode: u32) -> RemoteResult<RemoteFd> {
        let path = Self::fs_path(url)?;
        trace!("open: {:?} flags={:#o} mode={:o}", path, flags, mode);

        let mut options = std::fs::OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => options.write(true),
            libc::O_RDWR => options.read(true).write(true),
            _ => options.read(true),
        };
        options
            .append(flags & libc::O_APPEND != 0)
            .truncate(flags & libc::O_TRUNC != 0)
            .mode(mode);
        if flags & libc::O_CREAT != 0 {
            if flags & libc::O_EXCL != 0 {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }

        let file = blocking(move || options.open(&path).map_err(RemoteError::from)).await?;
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        self.files.insert(fd, Arc::new(file));
        Ok(RemoteFd(fd))
    }

    async fn pread(&self, fd: RemoteFd, offset: u64, size: u32) -> RemoteResult<Bytes> {
        let file = self.file(fd)?;
        blocking(move || {
            let mut buf = vec![0u8; size as usize];
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(Bytes::from(buf))
        })
        .await
    }

    async fn pwrite(&self, fd: RemoteFd, offset: u64, data: &[u8]) -> RemoteResult<usize> {
        let file = self.file(fd)?;
        let data = data.to_vec();
        blocking(move || {
            file.write_all_at(&data, offset)?;
            Ok(data.len())
        })
        .await
    }

    async fn close(&self, fd: RemoteFd) -> RemoteResult<()> {
        self.files
            .remove(&fd.0)
            .map(|_| ())
            .ok_or_else(|| RemoteError::from_code(libc::EBADF))
    }

    async fn access(&self, url: &RemotePath, mask: i32) -> RemoteResult<()> {
        let path = c_string(Self::fs_path(url)?.as_os_str().as_bytes())?;
        blocking(move || {
            // SAFETY: path is NUL terminated
            if unsafe { libc::access(path.as_ptr(), mask) } < 0 {
                return Err(last_os_error());
            }
            Ok(())
        })
        .await
    }

    async fn unlink(&self, url: &RemotePath) -> RemoteResult<()> {
        Ok(tokio::fs::remove_file(Self::fs_path(url)?).await?)
    }

    async fn mkdir(&self, url: &RemotePath, mode: u32) -> RemoteResult<()> {
        let path = Self::fs_path(url)?;
        Ok(tokio::fs::DirBuilder::new().mode(mode).create(path).await?)
    }

    async fn rmdir(&self, url: &RemotePath) -> RemoteResult<()> {
        Ok(tokio::fs::remove_dir(Self::fs_path(url)?).await?)
    }

    async fn chmod(&self, url: &RemotePath, mode: u32) -> RemoteResult<()> {
        let path = Self::fs_path(url)?;
        Ok(tokio::fs::set_permissions(path, Permissions::from_mode(mode & 0o7777)).await?)
    }

    async fn rename(&self, from: &RemotePath, to: &RemotePath) -> RemoteResult<()> {
        Ok(tokio::fs::rename(Self::fs_path(from)?, Self::fs_path(to)?).await?)
    }

    async fn symlink(&self, target: &RemotePath, link: &RemotePath) -> RemoteResult<()> {
        let link = Self::fs_path(link)?;
        // Relative targets are stored verbatim
        let target = match target.as_bytes().strip_prefix(FILE_SCHEME.as_bytes()) {
            Some(abs) => PathBuf::from(OsStr::from_bytes(abs)),
            None => PathBuf::from(target.as_os_str()),
        };
        Ok(tokio::fs::symlink(target, link).await?)
    }

    async fn getxattr(&self, url: &RemotePath, name: &OsStr) -> RemoteResult<Bytes> {
        let path = Self::fs_path(url)?;
        let name = name.to_os_string();
        let value = blocking(move || get_xattr(&path, &name)).await?;
        Ok(Bytes::from(value))
    }

    async fn setxattr(
        &self,
        url: &RemotePath,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> RemoteResult<()> {
        let path = Self::fs_path(url)?;
        let name = name.to_os_string();
        let value = value.to_vec();
        blocking(move || set_xattr(&path, &name, &value, flags)).await
    }

    async fn listxattr(&self, url: &RemotePath) -> RemoteResult<Vec<OsString>> {
        let path = Self::fs_path(url)?;
        blocking(move || list_xattr(&path)).await
    }

    async fn copy(&self, src: &RemotePath, dst: &RemotePath, params: CopyParams) -> RemoteResult<()> {
        let src = Self::fs_path(src)?;
        let dst = Self::fs_path(dst)?;

        if params.create_parent {
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        if !params.replace_existing && tokio::fs::symlink_metadata(&dst).await.is_ok() {
            return Err(RemoteError::from_code(libc::EEXIST));
        }

        tokio::fs::copy(&src, &dst).await?;
        Ok(())
    }
}
