//! Operation dispatcher
//!
//! One method per filesystem operation. Path-bearing operations share a
//! single routine: translate the virtual path, call one remote primitive,
//! interpret the outcome through the call's envelope. Session operations
//! (open/read/write/release and their directory counterparts) resolve the
//! kernel handle first and never translate a path.

pub mod attr;
pub mod dir_handle;
pub mod envelope;
pub mod open_files;

use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::connector::{Connector, RemoteDirEntry, RemoteError, RemoteResult};
use crate::error::{GridFsError, Result};
use crate::path::{PathTranslator, RemotePath, PATH_CAPACITY};
use crate::upload::UploadWorkflow;

use self::attr::{created_file_attributes, tune_stat, Owner};
use self::dir_handle::DirHandleRegistry;
use self::envelope::{CallContext, Remap};
use self::open_files::{OpenFile, OpenFileTable};

pub use crate::connector::Metadata;

/// Mode passed to the backend when a plain open does not create
const DEFAULT_OPEN_MODE: u32 = 0o644;

/// Dispatches filesystem operations for one mount
pub struct Dispatcher {
    connector: Arc<dyn Connector>,
    translator: PathTranslator,
    dirs: DirHandleRegistry,
    files: OpenFileTable,
    upload: Option<Arc<dyn UploadWorkflow>>,
    owner: Owner,
}

impl Dispatcher {
    pub fn new(connector: Arc<dyn Connector>, translator: PathTranslator, owner: Owner) -> Self {
        Self {
            connector,
            translator,
            dirs: DirHandleRegistry::new(),
            files: OpenFileTable::new(),
            upload: None,
            owner,
        }
    }

    /// Route file creation through an upload workflow
    pub fn with_upload(mut self, upload: Arc<dyn UploadWorkflow>) -> Self {
        self.upload = Some(upload);
        self
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    /// Number of live directory sessions
    pub fn open_dir_count(&self) -> usize {
        self.dirs.len()
    }

    /// Number of live file sessions
    pub fn open_file_count(&self) -> usize {
        self.files.len()
    }

    /// Translate one virtual path, run `call` against it and interpret the outcome
    async fn path_call<T, F, Fut>(
        &self,
        ctx: &mut CallContext,
        op: &'static str,
        path: &Path,
        remap: Remap,
        call: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn Connector>, RemotePath) -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        ctx.clear_error();
        debug!("{} path {}", op, path.display());
        let remote = self.translator.to_remote(path);
        let outcome = call(self.connector.clone(), remote.clone()).await;
        let result = ctx.interpret(op, &remote, remap, outcome);
        ctx.finish(result)
    }

    /// Same as `path_call` for operations taking two remote identifiers
    async fn pair_call<T, F, Fut>(
        &self,
        ctx: &mut CallContext,
        op: &'static str,
        first: RemotePath,
        second: RemotePath,
        call: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn Connector>, RemotePath, RemotePath) -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let outcome = call(self.connector.clone(), first.clone(), second).await;
        let result = ctx.interpret(op, &first, Remap::Never, outcome);
        ctx.finish(result)
    }

    /// Attributes of `path`, normalized for the local host
    pub async fn getattr(&self, ctx: &mut CallContext, path: &Path) -> Result<Metadata> {
        let owner = self.owner;
        self.path_call(ctx, "getattr", path, Remap::Never, move |c, r| async move {
            c.stat(&r).await.map(|mut meta| {
                tune_stat(&mut meta, owner);
                meta
            })
        })
        .await
    }

    /// Attributes of a file that is open with `flags`.
    ///
    /// Backends flagged with the create shortcut cannot describe an object
    /// they are still creating, so a default record is returned without a
    /// remote round trip.
    pub async fn fgetattr(&self, ctx: &mut CallContext, path: &Path, flags: i32) -> Result<Metadata> {
        if flags & libc::O_CREAT != 0 && self.translator.mount_points().create_attr_shortcut() {
            debug!("fgetattr create mode, default attributes for {}", path.display());
            ctx.clear_error();
            return ctx.finish(Ok(created_file_attributes()));
        }
        debug!("fgetattr other mode for {}", path.display());
        self.getattr(ctx, path).await
    }

    /// `fgetattr` using the flags recorded for an open file handle
    pub async fn fgetattr_handle(&self, ctx: &mut CallContext, path: &Path, fh: u64) -> Result<Metadata> {
        match self.files.get(fh) {
            Ok(file) => self.fgetattr(ctx, path, file.flags).await,
            Err(e) => ctx.finish(Err(e)),
        }
    }

    /// Symlink target of `path`, mapped back under the local mount
    pub async fn readlink(&self, ctx: &mut CallContext, path: &Path) -> Result<Vec<u8>> {
        let target = self
            .path_call(ctx, "readlink", path, Remap::Never, |c, r| async move {
                c.readlink(&r).await
            })
            .await?;
        Ok(self
            .translator
            .readlink_target_to_virtual(&target, PATH_CAPACITY as isize))
    }

    /// Open a remote directory, returning the session handle
    pub async fn opendir(&self, ctx: &mut CallContext, path: &Path) -> Result<u64> {
        ctx.clear_error();
        debug!("opendir path {}", path.display());
        let remote = self.translator.to_remote(path);
        let outcome = self.connector.opendir(&remote).await;
        let cursor = match ctx.interpret("opendir", &remote, Remap::Never, outcome) {
            Ok(cursor) => cursor,
            Err(e) => return ctx.finish(Err(e)),
        };

        if ctx.is_cancelled() {
            if let Err(e) = self.connector.closedir(cursor).await {
                debug!("closedir after cancel failed for {}: {}", remote, e);
            }
            return ctx.finish(Err(GridFsError::Canceled));
        }

        let handle = self.dirs.create(Some(cursor), remote);
        ctx.finish(Ok(handle))
    }

    /// List a directory session from `offset`.
    ///
    /// `emit` gets each entry and the offset following it, and returns
    /// `true` once the reply buffer is full.
    pub async fn readdir<F>(&self, ctx: &mut CallContext, fh: u64, offset: u64, emit: F) -> Result<()>
    where
        F: FnMut(&RemoteDirEntry, u64) -> bool,
    {
        ctx.clear_error();
        debug!("readdir handle {} offset {}", fh, offset);
        let remote = match self.dirs.remote_path(fh).await {
            Ok(remote) => remote,
            Err(e) => return ctx.finish(Err(e)),
        };
        match self.dirs.can_replay(fh, offset).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = self.rewind_dir(ctx, fh, &remote).await {
                    return ctx.finish(Err(e));
                }
            }
            Err(e) => return ctx.finish(Err(e)),
        }

        let result = match self.dirs.iterate(fh, offset, emit).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => ctx.interpret("readdir", &remote, Remap::MissingAttribute, Err::<(), _>(e)),
            Err(e) => Err(e),
        };
        ctx.finish(result)
    }

    /// Reopen the remote directory of a session whose kept entries no
    /// longer reach back to the requested offset
    async fn rewind_dir(&self, ctx: &mut CallContext, fh: u64, remote: &RemotePath) -> Result<()> {
        debug!("readdir handle {} rewinding {}", fh, remote);
        let outcome = self.connector.opendir(remote).await;
        let cursor = ctx.interpret("readdir", remote, Remap::Never, outcome)?;
        if let Some(replaced) = self.dirs.rewind(fh, cursor).await? {
            if let Err(e) = self.connector.closedir(replaced).await {
                debug!("closedir of replaced cursor failed for {}: {}", remote, e);
            }
        }
        Ok(())
    }

    /// Close a directory session and forget its handle
    pub async fn releasedir(&self, ctx: &mut CallContext, fh: u64) -> Result<()> {
        ctx.clear_error();
        debug!("releasedir handle {}", fh);
        let remote = match self.dirs.remote_path(fh).await {
            Ok(remote) => remote,
            Err(e) => return ctx.finish(Err(e)),
        };

        // A session without a cursor has nothing to close remotely
        let result = match self.dirs.resolve_cursor(fh).await {
            Ok(cursor) => {
                let outcome = self.connector.closedir(cursor).await;
                ctx.interpret("releasedir", &remote, Remap::Never, outcome)
            }
            Err(_) => Ok(()),
        };
        if let Err(e) = self.dirs.destroy(fh) {
            return ctx.finish(Err(e));
        }
        ctx.finish(result)
    }

    /// Open a remote file, returning the session handle
    pub async fn open(&self, ctx: &mut CallContext, path: &Path, flags: i32) -> Result<u64> {
        self.open_remote(ctx, path, flags, flags, DEFAULT_OPEN_MODE).await
    }

    async fn open_remote(
        &self,
        ctx: &mut CallContext,
        path: &Path,
        remote_flags: i32,
        session_flags: i32,
        mode: u32,
    ) -> Result<u64> {
        ctx.clear_error();
        let remote = self.translator.to_remote(path);
        let mut outcome = self.connector.open(&remote, remote_flags, mode).await;
        if matches!(outcome, Ok(fd) if fd.0 == 0) {
            outcome = Err(RemoteError::new(libc::EIO, "backend returned an invalid descriptor"));
        }
        let fd = match ctx.interpret("open", &remote, Remap::Never, outcome) {
            Ok(fd) => fd,
            Err(e) => return ctx.finish(Err(e)),
        };
        debug!("open path {} fd {}", path.display(), fd.0);

        if ctx.is_cancelled() {
            if let Err(e) = self.connector.close(fd).await {
                debug!("close after cancel failed for {}: {}", remote, e);
            }
            return ctx.finish(Err(GridFsError::Canceled));
        }

        let fh = self.files.insert(OpenFile {
            fd,
            remote_path: remote,
            flags: session_flags,
        });
        ctx.finish(Ok(fh))
    }

    /// Read from an open file. `path` is only used for logging.
    pub async fn read(
        &self,
        ctx: &mut CallContext,
        path: &Path,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Bytes> {
        ctx.clear_error();
        let file = match self.files.get(fh) {
            Ok(file) => file,
            Err(e) => return ctx.finish(Err(e)),
        };
        debug!("read path {} fd {}", path.display(), file.fd.0);
        let outcome = self.connector.pread(file.fd, offset, size).await;
        let result = ctx.interpret("read", &path.display(), Remap::Never, outcome);
        ctx.finish(result)
    }

    /// Write to an open file. `path` is only used for logging.
    pub async fn write(
        &self,
        ctx: &mut CallContext,
        path: &Path,
        fh: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        ctx.clear_error();
        let file = match self.files.get(fh) {
            Ok(file) => file,
            Err(e) => return ctx.finish(Err(e)),
        };
        debug!("write path {} fd {}", path.display(), file.fd.0);
        let outcome = self.connector.pwrite(file.fd, offset, data).await;
        let result = ctx.interpret("write", &path.display(), Remap::Never, outcome);
        ctx.finish(result)
    }

    /// Close an open file and forget its handle
    pub async fn release(&self, ctx: &mut CallContext, fh: u64) -> Result<()> {
        ctx.clear_error();
        let file = match self.files.remove(fh) {
            Ok(file) => file,
            Err(e) => return ctx.finish(Err(e)),
        };
        debug!("release fd {}", file.fd.0);
        let outcome = self.connector.close(file.fd).await;
        let result = ctx.interpret("release", &file.remote_path, Remap::Never, outcome);
        ctx.finish(result)
    }

    pub async fn access(&self, ctx: &mut CallContext, path: &Path, mask: i32) -> Result<()> {
        self.path_call(ctx, "access", path, Remap::Never, move |c, r| async move {
            c.access(&r, mask).await
        })
        .await
    }

    pub async fn unlink(&self, ctx: &mut CallContext, path: &Path) -> Result<()> {
        self.path_call(ctx, "unlink", path, Remap::Never, |c, r| async move {
            c.unlink(&r).await
        })
        .await
    }

    pub async fn mkdir(&self, ctx: &mut CallContext, path: &Path, mode: u32) -> Result<()> {
        self.path_call(ctx, "mkdir", path, Remap::Never, move |c, r| async move {
            c.mkdir(&r, mode).await
        })
        .await
    }

    pub async fn rmdir(&self, ctx: &mut CallContext, path: &Path) -> Result<()> {
        self.path_call(ctx, "rmdir", path, Remap::Never, |c, r| async move {
            c.rmdir(&r).await
        })
        .await
    }

    pub async fn chmod(&self, ctx: &mut CallContext, path: &Path, mode: u32) -> Result<()> {
        self.path_call(ctx, "chmod", path, Remap::Never, move |c, r| async move {
            c.chmod(&r, mode).await
        })
        .await
    }

    pub async fn rename(&self, ctx: &mut CallContext, from: &Path, to: &Path) -> Result<()> {
        ctx.clear_error();
        debug!("rename oldpath {} newpath {}", from.display(), to.display());
        let from = self.translator.to_remote(from);
        let to = self.translator.to_remote(to);
        self.pair_call(ctx, "rename", from, to, |c, f, t| async move {
            c.rename(&f, &t).await
        })
        .await
    }

    /// Create a symlink at virtual path `link` pointing to `target`.
    ///
    /// Absolute targets must lie under the local mount point and are
    /// translated into remote identifiers; relative targets are stored as
    /// given.
    pub async fn symlink(&self, ctx: &mut CallContext, target: &Path, link: &Path) -> Result<()> {
        ctx.clear_error();
        let remote_target = if target.is_absolute() {
            match self.translator.to_remote_from_local_absolute(target) {
                Ok(remote) => remote,
                Err(e) => {
                    warn!("symlink target {} is outside the mount", target.display());
                    return ctx.finish(Err(e));
                }
            }
        } else {
            RemotePath::from_bytes(target.as_os_str().as_bytes())
        };
        let remote_link = self.translator.to_remote(link);
        debug!("symlink oldpath {} newpath {}", remote_target, remote_link);

        self.pair_call(ctx, "symlink", remote_target, remote_link, |c, t, l| async move {
            c.symlink(&t, &l).await
        })
        .await
    }

    pub async fn getxattr(&self, ctx: &mut CallContext, path: &Path, name: &OsStr) -> Result<Bytes> {
        debug!("getxattr name {}", name.to_string_lossy());
        let name = name.to_os_string();
        self.path_call(ctx, "getxattr", path, Remap::MissingAttribute, move |c, r| async move {
            c.getxattr(&r, &name).await
        })
        .await
    }

    pub async fn setxattr(
        &self,
        ctx: &mut CallContext,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<()> {
        debug!("setxattr name {}", name.to_string_lossy());
        let name = name.to_os_string();
        let value = value.to_vec();
        self.path_call(ctx, "setxattr", path, Remap::Never, move |c, r| async move {
            c.setxattr(&r, &name, &value, flags).await
        })
        .await
    }

    pub async fn listxattr(&self, ctx: &mut CallContext, path: &Path) -> Result<Vec<OsString>> {
        self.path_call(ctx, "listxattr", path, Remap::Never, |c, r| async move {
            c.listxattr(&r).await
        })
        .await
    }

    /// Ownership changes are not supported by the backends; accepted and ignored
    pub fn chown(&self, ctx: &mut CallContext, path: &Path) -> Result<()> {
        debug!("chown path {}", path.display());
        ctx.clear_error();
        Ok(())
    }

    /// Accepted and ignored
    pub fn utimens(&self, ctx: &mut CallContext, path: &Path) -> Result<()> {
        debug!("utimens path {}", path.display());
        ctx.clear_error();
        Ok(())
    }

    /// Accepted and ignored
    pub fn truncate(&self, ctx: &mut CallContext, path: &Path, size: u64) -> Result<()> {
        debug!("truncate path {} size {}", path.display(), size);
        ctx.clear_error();
        Ok(())
    }

    /// Create a new file and open it.
    ///
    /// With an upload workflow configured the remote object is produced by
    /// the workflow and then opened; otherwise it is opened with create
    /// intent directly. Returns the session handle and the attributes seen
    /// through a create-intent `fgetattr`.
    pub async fn create(
        &self,
        ctx: &mut CallContext,
        path: &Path,
        mode: u32,
        flags: i32,
    ) -> Result<(u64, Metadata)> {
        ctx.clear_error();
        debug!("create path {} mode {:o}", path.display(), mode);
        let session_flags = flags | libc::O_CREAT;

        let fh = match &self.upload {
            Some(upload) => {
                let remote = self.translator.to_remote(path);
                if let Err(e) = upload.upload(&remote).await {
                    return ctx.finish(Err(e));
                }
                let remote_flags = flags & !(libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC);
                self.open_remote(ctx, path, remote_flags, session_flags, mode)
                    .await?
            }
            None => {
                self.open_remote(ctx, path, session_flags, session_flags, mode)
                    .await?
            }
        };

        match self.fgetattr(ctx, path, session_flags).await {
            Ok(meta) => Ok((fh, meta)),
            Err(e) => {
                let mut cleanup = CallContext::detached();
                if let Err(close_err) = self.release(&mut cleanup, fh).await {
                    debug!("release after failed create: {}", close_err);
                }
                Err(e)
            }
        }
    }
}
