//! Mount management and lifecycle

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fuser::MountOption;
use parking_lot::Mutex;
use tracing::info;

use crate::dispatch::envelope::CancelToken;
use crate::dispatch::Dispatcher;
use crate::error::{GridFsError, Result};
use crate::fuse::FuseAdapter;

/// Per-mount options applied at the FUSE level
#[derive(Debug, Clone)]
pub struct MountSettings {
    pub read_only: bool,
    pub attr_ttl: Duration,
}

/// Mount options handed to the kernel
fn mount_options(settings: &MountSettings) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("gridfs".to_string()),
        MountOption::Subtype("gridfs".to_string()),
        MountOption::AutoUnmount,
        MountOption::AllowOther,
    ];
    if settings.read_only {
        options.push(MountOption::RO);
    }
    options
}

/// An active mount
pub struct ActiveMount {
    pub path: PathBuf,
    cancel: CancelToken,
    session: Option<fuser::BackgroundSession>,
}

impl ActiveMount {
    /// Cancel in-flight calls and unmount
    pub fn unmount(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Unmounting {:?}", self.path);
            self.cancel.cancel();
            drop(session);
        }
    }
}

impl Drop for ActiveMount {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Handles the lifecycle of all mounts
pub struct MountManager {
    mounts: Mutex<Vec<ActiveMount>>,
}

impl MountManager {
    pub fn new() -> Self {
        Self {
            mounts: Mutex::new(Vec::new()),
        }
    }

    /// Mount `dispatcher` at `path`
    pub fn mount(&self, path: PathBuf, dispatcher: Arc<Dispatcher>, settings: MountSettings) -> Result<()> {
        info!("Mounting at {:?}", path);

        if !path.exists() {
            return Err(GridFsError::NotFound(format!(
                "Mount point does not exist: {:?}",
                path
            )));
        }
        if !path.is_dir() {
            return Err(GridFsError::Config(format!(
                "Mount point is not a directory: {:?}",
                path
            )));
        }

        let cancel = CancelToken::new();
        let adapter = FuseAdapter::new(dispatcher, cancel.clone(), settings.attr_ttl)?;

        if settings.read_only {
            info!("Mounting {:?} as read-only", path);
        }
        let session = fuser::spawn_mount2(adapter, &path, &mount_options(&settings))?;

        self.mounts.lock().push(ActiveMount {
            path: path.clone(),
            cancel,
            session: Some(session),
        });

        info!("Successfully mounted at {:?}", path);
        Ok(())
    }

    /// Unmount a specific path
    pub fn unmount(&self, path: &Path) -> Result<()> {
        let mut mounts = self.mounts.lock();
        match mounts.iter().position(|m| m.path == path) {
            Some(pos) => {
                mounts.remove(pos).unmount();
                Ok(())
            }
            None => Err(GridFsError::NotFound(format!("No mount at {:?}", path))),
        }
    }

    /// Unmount all filesystems
    pub fn unmount_all(&self) {
        info!("Unmounting all filesystems");
        for mut mount in self.mounts.lock().drain(..) {
            mount.unmount();
        }
    }

    /// Paths of the active mounts
    pub fn list_mounts(&self) -> Vec<PathBuf> {
        self.mounts.lock().iter().map(|m| m.path.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.mounts.lock().len()
    }
}

impl Default for MountManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MountManager {
    fn drop(&mut self) {
        self.unmount_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_options() {
        let settings = MountSettings {
            read_only: true,
            attr_ttl: Duration::from_secs(1),
        };
        let options = mount_options(&settings);
        assert!(options.contains(&MountOption::RO));
        assert!(options.contains(&MountOption::AutoUnmount));
        assert!(!options.contains(&MountOption::DefaultPermissions));

        let options = mount_options(&MountSettings {
            read_only: false,
            ..settings
        });
        assert!(!options.contains(&MountOption::RO));
    }

    #[test]
    fn test_unmount_unknown_path() {
        let manager = MountManager::new();
        let err = manager.unmount(Path::new("/mnt/nowhere")).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
        assert_eq!(manager.count(), 0);
        assert!(manager.list_mounts().is_empty());
    }
}
