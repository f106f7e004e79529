//! Attribute normalization

use crate::connector::{FileKind, Metadata};

/// Mode bits of the record synthesized for a file opened with create intent
pub const CREATED_FILE_PERM: u16 = 0o666;

/// Owner reported for every object in the mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Owner of the running process
    pub fn current() -> Self {
        // SAFETY: getuid/getgid cannot fail
        unsafe { Self::new(libc::getuid(), libc::getgid()) }
    }
}

/// Adjust a backend attribute record to local conventions.
///
/// Remote ownership has no meaning on this host, so objects are reported
/// as owned by the mount owner. Backends that do not count links get the
/// usual minimum.
pub fn tune_stat(meta: &mut Metadata, owner: Owner) {
    meta.uid = owner.uid;
    meta.gid = owner.gid;
    if meta.nlink == 0 {
        meta.nlink = if meta.is_dir() { 2 } else { 1 };
    }
}

/// Zeroed regular-file record with permissive bits
pub fn created_file_attributes() -> Metadata {
    Metadata::zeroed(FileKind::File, CREATED_FILE_PERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tune_stat_overrides_owner() {
        let mut meta = Metadata::zeroed(FileKind::Directory, 0o755);
        meta.uid = 99;
        tune_stat(&mut meta, Owner::new(1000, 1001));
        assert_eq!((meta.uid, meta.gid), (1000, 1001));
        assert_eq!(meta.nlink, 2);
    }

    #[test]
    fn test_created_file_attributes_are_zeroed() {
        let meta = created_file_attributes();
        assert_eq!(meta.kind, FileKind::File);
        assert_eq!(meta.perm, 0o666);
        assert_eq!(meta.size, 0);
        assert_eq!(meta.uid, 0);
    }
}
