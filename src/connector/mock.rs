//! Recording connector for unit tests

use std::collections::{HashMap, VecDeque};
use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::connector::{
    Connector, CopyParams, DirCursor, FileKind, Metadata, RemoteDir, RemoteDirEntry, RemoteError,
    RemoteFd, RemoteResult,
};
use crate::path::RemotePath;

#[derive(Default)]
pub(crate) struct MockConnector {
    calls: Mutex<Vec<(&'static str, String)>>,
    op_failures: Mutex<HashMap<&'static str, i32>>,
    path_failures: Mutex<HashMap<String, i32>>,
    entries: Mutex<Vec<RemoteDirEntry>>,
    listing_error: Mutex<Option<i32>>,
    link_target: Mutex<Vec<u8>>,
    xattrs: Mutex<HashMap<OsString, Bytes>>,
    copies: Mutex<Vec<(String, String, CopyParams)>>,
    delay: Mutex<Option<Duration>>,
    next_fd: AtomicI32,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        let mock = Self::default();
        mock.next_fd.store(3, Ordering::SeqCst);
        mock
    }

    /// Fail every call of `op` with `code`
    pub(crate) fn fail(&self, op: &'static str, code: i32) {
        self.op_failures.lock().insert(op, code);
    }

    /// Fail every call addressing `url` with `code`
    pub(crate) fn fail_path(&self, url: &str, code: i32) {
        self.path_failures.lock().insert(url.to_string(), code);
    }

    pub(crate) fn set_entries(&self, entries: Vec<RemoteDirEntry>) {
        *self.entries.lock() = entries;
    }

    /// Make directory cursors fail with `code` once their entries run out
    pub(crate) fn fail_listing(&self, code: i32) {
        *self.listing_error.lock() = Some(code);
    }

    pub(crate) fn set_link_target(&self, target: &[u8]) {
        *self.link_target.lock() = target.to_vec();
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Names of the primitives called so far, in order
    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(|(op, _)| *op).collect()
    }

    /// Identifiers passed to the primitives called so far, in order
    pub(crate) fn urls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(_, url)| url.clone()).collect()
    }

    pub(crate) fn copies(&self) -> Vec<(String, String, CopyParams)> {
        self.copies.lock().clone()
    }

    async fn enter(&self, op: &'static str, url: &str) -> RemoteResult<()> {
        self.calls.lock().push((op, url.to_string()));
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(code) = self.op_failures.lock().get(op) {
            return Err(RemoteError::from_code(*code));
        }
        if let Some(code) = self.path_failures.lock().get(url) {
            return Err(RemoteError::from_code(*code));
        }
        Ok(())
    }
}

struct MockDir {
    entries: VecDeque<RemoteDirEntry>,
    error: Option<i32>,
}

#[async_trait]
impl RemoteDir for MockDir {
    async fn next_entry(&mut self) -> RemoteResult<Option<RemoteDirEntry>> {
        match self.entries.pop_front() {
            Some(entry) => Ok(Some(entry)),
            None => match self.error {
                Some(code) => Err(RemoteError::from_code(code)),
                None => Ok(None),
            },
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn stat(&self, url: &RemotePath) -> RemoteResult<Metadata> {
        self.enter("stat", &url.to_string()).await?;
        Ok(Metadata {
            kind: FileKind::File,
            perm: 0o640,
            size: 42,
            nlink: 1,
            uid: 4242,
            gid: 4242,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
        })
    }

    async fn readlink(&self, url: &RemotePath) -> RemoteResult<Vec<u8>> {
        self.enter("readlink", &url.to_string()).await?;
        Ok(self.link_target.lock().clone())
    }

    async fn opendir(&self, url: &RemotePath) -> RemoteResult<DirCursor> {
        self.enter("opendir", &url.to_string()).await?;
        Ok(Box::new(MockDir {
            entries: self.entries.lock().iter().cloned().collect(),
            error: *self.listing_error.lock(),
        }))
    }

    async fn closedir(&self, _cursor: DirCursor) -> RemoteResult<()> {
        self.enter("closedir", "").await
    }

    async fn open(&self, url: &RemotePath, _flags: i32, _mode: u32) -> RemoteResult<RemoteFd> {
        self.enter("open", &url.to_string()).await?;
        Ok(RemoteFd(self.next_fd.fetch_add(1, Ordering::SeqCst)))
    }

    async fn pread(&self, fd: RemoteFd, offset: u64, size: u32) -> RemoteResult<Bytes> {
        self.enter("pread", &fd.0.to_string()).await?;
        let data: Vec<u8> = (offset..offset + size as u64).map(|i| i as u8).collect();
        Ok(Bytes::from(data))
    }

    async fn pwrite(&self, fd: RemoteFd, _offset: u64, data: &[u8]) -> RemoteResult<usize> {
        self.enter("pwrite", &fd.0.to_string()).await?;
        Ok(data.len())
    }

    async fn close(&self, fd: RemoteFd) -> RemoteResult<()> {
        self.enter("close", &fd.0.to_string()).await
    }

    async fn access(&self, url: &RemotePath, _mask: i32) -> RemoteResult<()> {
        self.enter("access", &url.to_string()).await
    }

    async fn unlink(&self, url: &RemotePath) -> RemoteResult<()> {
        self.enter("unlink", &url.to_string()).await
    }

    async fn mkdir(&self, url: &RemotePath, _mode: u32) -> RemoteResult<()> {
        self.enter("mkdir", &url.to_string()).await
    }

    async fn rmdir(&self, url: &RemotePath) -> RemoteResult<()> {
        self.enter("rmdir", &url.to_string()).await
    }

    async fn chmod(&self, url: &RemotePath, _mode: u32) -> RemoteResult<()> {
        self.enter("chmod", &url.to_string()).await
    }

    async fn rename(&self, from: &RemotePath, to: &RemotePath) -> RemoteResult<()> {
        self.enter("rename", &format!("{} -> {}", from, to)).await
    }

    async fn symlink(&self, target: &RemotePath, link: &RemotePath) -> RemoteResult<()> {
        self.enter("symlink", &format!("{} -> {}", link, target)).await
    }

    async fn getxattr(&self, url: &RemotePath, name: &OsStr) -> RemoteResult<Bytes> {
        self.enter("getxattr", &url.to_string()).await?;
        self.xattrs
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| RemoteError::from_code(libc::EPROTONOSUPPORT))
    }

    async fn setxattr(
        &self,
        url: &RemotePath,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
    ) -> RemoteResult<()> {
        self.enter("setxattr", &url.to_string()).await?;
        self.xattrs
            .lock()
            .insert(name.to_os_string(), Bytes::copy_from_slice(value));
        Ok(())
    }

    async fn listxattr(&self, url: &RemotePath) -> RemoteResult<Vec<OsString>> {
        self.enter("listxattr", &url.to_string()).await?;
        let mut names: Vec<OsString> = self.xattrs.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn copy(&self, src: &RemotePath, dst: &RemotePath, params: CopyParams) -> RemoteResult<()> {
        self.enter("copy", &dst.to_string()).await?;
        self.copies
            .lock()
            .push((src.to_string(), dst.to_string(), params));
        Ok(())
    }
}
