//! gridfs: mount remote grid storage namespaces as local directories
//!
//! Every filesystem call on a mount is translated into a call on a remote
//! storage identifier, and the outcome is translated back into the
//! errno convention.
//!
//! # Architecture
//!
//! - **Path translation** (`path`): virtual path <-> remote identifier
//!   mapping, including symlink targets, with bounded buffers.
//! - **Connectors** (`connector`): remote storage primitives behind the
//!   `Connector` trait.
//! - **Dispatcher** (`dispatch`): one method per filesystem operation,
//!   each running inside a per-call error and cancellation envelope, plus
//!   the open directory and file sessions.
//! - **Upload workflow** (`upload`): copy-then-register creation of new
//!   files in a catalog.
//! - **FUSE adapter** (`fuse`) and **mount manager** (`mount`): kernel
//!   boundary and mount lifecycle.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use gridfs::connector::local::LocalConnector;
//! use gridfs::dispatch::attr::Owner;
//! use gridfs::dispatch::envelope::CallContext;
//! use gridfs::dispatch::Dispatcher;
//! use gridfs::path::{MountPoints, PathTranslator};
//!
//! # async fn example() -> gridfs::Result<()> {
//! let mount = MountPoints::builder()
//!     .remote_mount_point("file:///srv/grid")
//!     .local_mount_point("/mnt/grid")
//!     .build()?;
//! let dispatcher = Dispatcher::new(
//!     Arc::new(LocalConnector::new()),
//!     PathTranslator::new(mount),
//!     Owner::current(),
//! );
//!
//! let mut ctx = CallContext::detached();
//! let meta = dispatcher.getattr(&mut ctx, Path::new("/data/run1")).await?;
//! println!("{} bytes", meta.size);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod fuse;
pub mod mount;
pub mod path;
pub mod upload;

pub use error::{GridFsError, Result};
