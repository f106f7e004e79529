//! FUSE boundary
//!
//! Resolves kernel inodes to virtual paths, runs the matching dispatcher
//! operation on a dedicated runtime, and turns its result into a reply.

pub mod inode;

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType as FuseFileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tracing::{debug, trace};

use crate::connector::{FileKind, Metadata};
use crate::dispatch::envelope::{CallContext, CancelToken};
use crate::dispatch::Dispatcher;
use crate::error::Result;

use self::inode::{InodeTable, ROOT_INODE};

/// Default TTL for attribute caching
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);

/// Generation number (not used, always 0)
const GENERATION: u64 = 0;

/// Block size for reporting
const BLOCK_SIZE: u32 = 4096;

/// Kernel offsets taken by `.` and `..` ahead of the listed entries
const DOT_ENTRIES: u64 = 2;

fn to_fuse_file_type(kind: FileKind) -> FuseFileType {
    match kind {
        FileKind::File => FuseFileType::RegularFile,
        FileKind::Directory => FuseFileType::Directory,
        FileKind::Symlink => FuseFileType::Symlink,
    }
}

fn metadata_to_attr(ino: u64, meta: &Metadata) -> FileAttr {
    FileAttr {
        ino,
        size: meta.size,
        blocks: meta.size.div_ceil(BLOCK_SIZE as u64),
        atime: meta.atime,
        mtime: meta.mtime,
        ctime: meta.ctime,
        crtime: meta.ctime,
        kind: to_fuse_file_type(meta.kind),
        perm: meta.perm,
        nlink: meta.nlink,
        uid: meta.uid,
        gid: meta.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// What a getxattr/listxattr reply should carry for a value of `len`
/// bytes and a caller buffer of `size` bytes
#[derive(Debug, PartialEq, Eq)]
enum XattrReply {
    Size(u32),
    Data,
}

fn xattr_reply(len: usize, size: u32) -> std::result::Result<XattrReply, i32> {
    if size == 0 {
        Ok(XattrReply::Size(len as u32))
    } else if len > size as usize {
        Err(libc::ERANGE)
    } else {
        Ok(XattrReply::Data)
    }
}

/// Attribute names as the kernel expects them: each NUL terminated
fn xattr_name_list(names: &[OsString]) -> Vec<u8> {
    let mut buf = Vec::new();
    for name in names {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
    }
    buf
}

/// Changes requested by one setattr call
struct AttrChanges {
    mode: Option<u32>,
    owner: bool,
    size: Option<u64>,
    times: bool,
    fh: Option<u64>,
}

/// Apply each requested change in turn, then report the resulting attributes
async fn apply_attr_changes(
    dispatcher: &Dispatcher,
    ctx: &mut CallContext,
    path: &Path,
    changes: AttrChanges,
) -> Result<Metadata> {
    if let Some(mode) = changes.mode {
        dispatcher.chmod(ctx, path, mode & 0o7777).await?;
    }
    if changes.owner {
        dispatcher.chown(ctx, path)?;
    }
    if let Some(size) = changes.size {
        dispatcher.truncate(ctx, path, size)?;
    }
    if changes.times {
        dispatcher.utimens(ctx, path)?;
    }
    match changes.fh {
        Some(fh) => dispatcher.fgetattr_handle(ctx, path, fh).await,
        None => dispatcher.getattr(ctx, path).await,
    }
}

/// FUSE filesystem delegating to one mount's dispatcher
pub struct FuseAdapter {
    dispatcher: Arc<Dispatcher>,
    inodes: InodeTable,
    /// Dedicated runtime for FUSE async operations
    runtime: tokio::runtime::Runtime,
    cancel: CancelToken,
    attr_ttl: Duration,
}

impl FuseAdapter {
    /// Create an adapter; calls observe `cancel` for interruption
    pub fn new(dispatcher: Arc<Dispatcher>, cancel: CancelToken, attr_ttl: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .thread_name("gridfs-fuse")
            .enable_all()
            .build()?;

        Ok(Self {
            dispatcher,
            inodes: InodeTable::new(),
            runtime,
            cancel,
            attr_ttl,
        })
    }

    fn inode_to_path(&self, ino: u64) -> std::result::Result<PathBuf, i32> {
        self.inodes.get_path(ino).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> std::result::Result<PathBuf, i32> {
        self.inodes.child_path(parent, name).ok_or(libc::ENOENT)
    }

    fn context(&self) -> CallContext {
        CallContext::new(self.cancel.clone())
    }

    /// Run an async operation on the FUSE runtime and wait for the result
    fn run_async<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Fetch attributes of a freshly created object and answer with an entry
    fn reply_new_entry(&self, path: &Path, reply: ReplyEntry) {
        let mut ctx = self.context();
        match self.run_async(self.dispatcher.getattr(&mut ctx, path)) {
            Ok(meta) => {
                let ino = self.inodes.get_or_create_inode(path);
                reply.entry(&self.attr_ttl, &metadata_to_attr(ino, &meta), GENERATION);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

impl Filesystem for FuseAdapter {
    fn destroy(&mut self) {
        debug!("filesystem destroyed, cancelling outstanding calls");
        self.cancel.cancel();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("lookup: {:?}", path);

        let mut ctx = self.context();
        match self.run_async(self.dispatcher.getattr(&mut ctx, &path)) {
            Ok(meta) => {
                let ino = self.inodes.get_or_create_inode(&path);
                reply.entry(&self.attr_ttl, &metadata_to_attr(ino, &meta), GENERATION);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("getattr: {:?} (ino={})", path, ino);

        let mut ctx = self.context();
        match self.run_async(self.dispatcher.getattr(&mut ctx, &path)) {
            Ok(meta) => reply.attr(&self.attr_ttl, &metadata_to_attr(ino, &meta)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("setattr: {:?} (ino={})", path, ino);

        let changes = AttrChanges {
            mode,
            owner: uid.is_some() || gid.is_some(),
            size,
            times: atime.is_some() || mtime.is_some(),
            fh,
        };
        let mut ctx = self.context();
        let result = self.run_async(apply_attr_changes(&self.dispatcher, &mut ctx, &path, changes));

        match result {
            Ok(meta) => reply.attr(&self.attr_ttl, &metadata_to_attr(ino, &meta)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mut ctx = self.context();
        match self.run_async(self.dispatcher.readlink(&mut ctx, &path)) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let effective_mode = (mode & !umask) & 0o7777;
        debug!("mkdir: {:?} mode={:o}", path, effective_mode);

        let mut ctx = self.context();
        if let Err(e) = self.run_async(self.dispatcher.mkdir(&mut ctx, &path, effective_mode)) {
            reply.error(e.to_errno());
            return;
        }
        self.reply_new_entry(&path, reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        debug!("unlink: {:?}", path);

        let mut ctx = self.context();
        match self.run_async(self.dispatcher.unlink(&mut ctx, &path)) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        debug!("rmdir: {:?}", path);

        let mut ctx = self.context();
        match self.run_async(self.dispatcher.rmdir(&mut ctx, &path)) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let link = match self.child_path(parent, link_name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        debug!("symlink: {:?} -> {:?}", link, target);

        let mut ctx = self.context();
        if let Err(e) = self.run_async(self.dispatcher.symlink(&mut ctx, target, &link)) {
            reply.error(e.to_errno());
            return;
        }
        self.reply_new_entry(&link, reply);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (old_path, new_path) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Ok(old), Ok(new)) => (old, new),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(e);
                return;
            }
        };
        debug!("rename: {:?} -> {:?}", old_path, new_path);

        let mut ctx = self.context();
        match self.run_async(self.dispatcher.rename(&mut ctx, &old_path, &new_path)) {
            Ok(()) => {
                self.inodes.rename_path(&old_path, &new_path);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mut ctx = self.context();
        match self.run_async(self.dispatcher.open(&mut ctx, &path, flags)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = self.inodes.get_path(ino).unwrap_or_default();
        trace!("read: {:?} offset={} size={}", path, offset, size);

        let mut ctx = self.context();
        match self.run_async(self.dispatcher.read(&mut ctx, &path, fh, offset as u64, size)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = self.inodes.get_path(ino).unwrap_or_default();
        trace!("write: {:?} offset={} size={}", path, offset, data.len());

        let mut ctx = self.context();
        match self.run_async(self.dispatcher.write(&mut ctx, &path, fh, offset as u64, data)) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let mut ctx = self.context();
        match self.run_async(self.dispatcher.release(&mut ctx, fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mut ctx = self.context();
        match self.run_async(self.dispatcher.opendir(&mut ctx, &path)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("readdir: {:?} offset={}", path, offset);

        let offset = offset.max(0) as u64;
        if offset == 0 && reply.add(ino, 1, FuseFileType::Directory, ".") {
            reply.ok();
            return;
        }
        if offset <= 1 {
            let parent_ino = if ino == ROOT_INODE {
                ROOT_INODE
            } else {
                self.inodes.parent_inode(&path)
            };
            if reply.add(parent_ino, 2, FuseFileType::Directory, "..") {
                reply.ok();
                return;
            }
        }

        let inodes = &self.inodes;
        let mut ctx = self.context();
        let start = offset.saturating_sub(DOT_ENTRIES);
        let result = self.run_async(self.dispatcher.readdir(&mut ctx, fh, start, |entry, next| {
            let entry_ino = inodes.get_or_create_inode(&path.join(&entry.name));
            reply.add(
                entry_ino,
                (next + DOT_ENTRIES) as i64,
                to_fuse_file_type(entry.kind),
                &entry.name,
            )
        }));

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        let mut ctx = self.context();
        match self.run_async(self.dispatcher.releasedir(&mut ctx, fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mut ctx = self.context();
        match self.run_async(self.dispatcher.setxattr(&mut ctx, &path, name, value, flags)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mut ctx = self.context();
        let value = match self.run_async(self.dispatcher.getxattr(&mut ctx, &path, name)) {
            Ok(value) => value,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match xattr_reply(value.len(), size) {
            Ok(XattrReply::Size(len)) => reply.size(len),
            Ok(XattrReply::Data) => reply.data(&value),
            Err(e) => reply.error(e),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mut ctx = self.context();
        let names = match self.run_async(self.dispatcher.listxattr(&mut ctx, &path)) {
            Ok(names) => xattr_name_list(&names),
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match xattr_reply(names.len(), size) {
            Ok(XattrReply::Size(len)) => reply.size(len),
            Ok(XattrReply::Data) => reply.data(&names),
            Err(e) => reply.error(e),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mut ctx = self.context();
        match self.run_async(self.dispatcher.access(&mut ctx, &path, mask)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let effective_mode = (mode & !umask) & 0o7777;
        debug!("create: {:?} mode={:o}", path, effective_mode);

        let mut ctx = self.context();
        match self.run_async(self.dispatcher.create(&mut ctx, &path, effective_mode, flags)) {
            Ok((fh, meta)) => {
                let ino = self.inodes.get_or_create_inode(&path);
                reply.created(&self.attr_ttl, &metadata_to_attr(ino, &meta), GENERATION, fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        // Remote namespaces report no capacity; answer with unbounded stats
        reply.statfs(
            u64::MAX,   // blocks
            u64::MAX,   // bfree
            u64::MAX,   // bavail
            u64::MAX,   // files
            u64::MAX,   // ffree
            BLOCK_SIZE, // bsize
            255,        // namelen
            BLOCK_SIZE, // frsize
        );
    }
}
