//! Session-scoped handles for open remote files
//!
//! The kernel file handle is a token into this table rather than the
//! remote descriptor itself, so a stale or forged handle is rejected
//! instead of being passed to the backend.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::connector::RemoteFd;
use crate::error::{GridFsError, Result};
use crate::path::RemotePath;

/// An open remote file
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub fd: RemoteFd,
    pub remote_path: RemotePath,
    /// Flags the file was opened with
    pub flags: i32,
}

/// Maps kernel file handles to open remote files
pub struct OpenFileTable {
    files: DashMap<u64, OpenFile>,
    next_handle: AtomicU64,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            files: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn insert(&self, file: OpenFile) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.files.insert(handle, file);
        handle
    }

    pub fn get(&self, handle: u64) -> Result<OpenFile> {
        self.files
            .get(&handle)
            .map(|f| f.clone())
            .ok_or(GridFsError::BadHandle(handle))
    }

    pub fn remove(&self, handle: u64) -> Result<OpenFile> {
        self.files
            .remove(&handle)
            .map(|(_, f)| f)
            .ok_or(GridFsError::BadHandle(handle))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let table = OpenFileTable::new();
        let fh = table.insert(OpenFile {
            fd: RemoteFd(7),
            remote_path: RemotePath::from("srm://h/f"),
            flags: libc::O_RDONLY,
        });

        assert_eq!(table.get(fh).unwrap().fd, RemoteFd(7));
        assert_eq!(table.remove(fh).unwrap().fd, RemoteFd(7));
        assert!(table.is_empty());
        assert_eq!(table.get(fh).unwrap_err().to_errno(), libc::EBADF);
    }
}
