//! Inode <-> virtual path mapping
//!
//! The kernel addresses objects by inode while every dispatcher operation
//! takes a virtual path relative to the mount. Inodes are assigned on
//! first sight (lookup, readdir, create) and follow their path through
//! renames.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Root directory inode (always 1 in FUSE)
pub const ROOT_INODE: u64 = 1;

/// Bidirectional inode <-> virtual path table
pub struct InodeTable {
    inode_to_path: DashMap<u64, PathBuf>,
    path_to_inode: DashMap<PathBuf, u64>,
    next_inode: AtomicU64,
}

impl InodeTable {
    /// Create a table with the mount root pre-registered
    pub fn new() -> Self {
        let table = Self {
            inode_to_path: DashMap::new(),
            path_to_inode: DashMap::new(),
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        };

        let root = PathBuf::from("/");
        table.inode_to_path.insert(ROOT_INODE, root.clone());
        table.path_to_inode.insert(root, ROOT_INODE);
        table
    }

    /// Inode for `path`, assigning a fresh one on first sight
    pub fn get_or_create_inode(&self, path: &Path) -> u64 {
        match self.path_to_inode.entry(normalize_path(path)) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let inode = self.next_inode.fetch_add(1, Ordering::SeqCst);
                self.inode_to_path.insert(inode, entry.key().clone());
                entry.insert(inode);
                inode
            }
        }
    }

    pub fn get_path(&self, inode: u64) -> Option<PathBuf> {
        self.inode_to_path.get(&inode).map(|p| p.clone())
    }

    pub fn get_inode(&self, path: &Path) -> Option<u64> {
        self.path_to_inode.get(&normalize_path(path)).map(|i| *i)
    }

    /// Virtual path of `name` inside directory inode `parent`
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.get_path(parent).map(|p| p.join(name))
    }

    /// Inode of the directory containing `path`
    pub fn parent_inode(&self, path: &Path) -> u64 {
        path.parent()
            .and_then(|p| self.get_inode(p))
            .unwrap_or(ROOT_INODE)
    }

    /// Forget `path`
    pub fn remove_path(&self, path: &Path) {
        if let Some((_, inode)) = self.path_to_inode.remove(&normalize_path(path)) {
            self.inode_to_path.remove(&inode);
        }
    }

    /// Move `old` and everything known below it to `new`.
    ///
    /// An inode already assigned to `new` is dropped, as the rename
    /// replaced that object.
    pub fn rename_path(&self, old: &Path, new: &Path) {
        let old = normalize_path(old);
        let new = normalize_path(new);

        if let Some((_, replaced)) = self.path_to_inode.remove(&new) {
            self.inode_to_path.remove(&replaced);
        }

        let moved: Vec<(PathBuf, u64)> = self
            .path_to_inode
            .iter()
            .filter(|e| e.key().starts_with(&old))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        for (path, inode) in moved {
            let Ok(rest) = path.strip_prefix(&old) else {
                continue;
            };
            let renamed = if rest.as_os_str().is_empty() {
                new.clone()
            } else {
                new.join(rest)
            };
            self.path_to_inode.remove(&path);
            self.inode_to_path.insert(inode, renamed.clone());
            self.path_to_inode.insert(renamed, inode);
        }
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Virtual paths are always absolute within the mount
fn normalize_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        PathBuf::from("/").join(path)
    }
}
