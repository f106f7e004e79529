//! Translation between virtual paths and remote identifiers
//!
//! The kernel hands us paths relative to the mount (`/dir/file.txt`), while
//! the storage backend wants fully qualified identifiers
//! (`srm://host/base/dir/file.txt`). Symlink targets travel the other way.
//!
//! Every buffer produced here is bounded: content is truncated at
//! `capacity - 1` bytes (room is kept for the NUL that C-string based
//! remote clients expect), and no translation ever grows past it.

use std::borrow::Cow;
use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::{GridFsError, Result};

/// Capacity of every path buffer, terminating NUL included
pub const PATH_CAPACITY: usize = 2048;

/// Append-only byte buffer that truncates instead of growing past its capacity
#[derive(Debug, Clone)]
pub struct BoundedBuf {
    bytes: Vec<u8>,
    limit: usize,
}

impl BoundedBuf {
    /// Create an empty buffer. A capacity of 0 or 1 holds no content.
    pub fn new(capacity: usize) -> Self {
        let limit = capacity.saturating_sub(1);
        Self {
            bytes: Vec::with_capacity(limit),
            limit,
        }
    }

    /// Append as much of `src` as fits, returning the number of bytes taken
    pub fn push(&mut self, src: &[u8]) -> usize {
        let take = src.len().min(self.remaining());
        self.bytes.extend_from_slice(&src[..take]);
        take
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.bytes.len()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Copy `src` into a new buffer of the given capacity, truncating
pub fn bounded_copy(src: &[u8], capacity: usize) -> Vec<u8> {
    let mut buf = BoundedBuf::new(capacity);
    buf.push(src);
    buf.into_bytes()
}

/// Fully resolved identifier of a resource on the storage backend
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemotePath(Vec<u8>);

impl RemotePath {
    /// Wrap raw bytes, truncating to `PATH_CAPACITY`
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bounded_copy(bytes, PATH_CAPACITY))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_os_str(&self) -> &OsStr {
        OsStr::from_bytes(&self.0)
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for RemotePath {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

/// Immutable mount configuration: both mount points and the resolution mode.
///
/// Built once per mount before the filesystem is exposed and never
/// modified afterwards, so it is shared freely between worker threads.
#[derive(Debug, Clone)]
pub struct MountPoints {
    remote: Vec<u8>,
    local: Vec<u8>,
    guid_mode: bool,
    create_attr_shortcut: bool,
}

impl MountPoints {
    pub fn builder() -> MountPointsBuilder {
        MountPointsBuilder::default()
    }

    /// Remote base URL every virtual path is appended to
    pub fn remote_prefix(&self) -> &[u8] {
        &self.remote
    }

    /// Local directory the filesystem is mounted on
    pub fn local_prefix(&self) -> &[u8] {
        &self.local
    }

    pub fn guid_mode(&self) -> bool {
        self.guid_mode
    }

    /// Whether attributes of a file opened with create intent are synthesized
    /// locally instead of being fetched from the backend
    pub fn create_attr_shortcut(&self) -> bool {
        self.create_attr_shortcut
    }
}

/// Collects mount points during setup
#[derive(Debug, Default)]
pub struct MountPointsBuilder {
    remote: Option<Vec<u8>>,
    local: Option<Vec<u8>>,
    guid_mode: bool,
    create_attr_shortcut: Option<bool>,
}

impl MountPointsBuilder {
    /// Set the remote mount point (truncated to `PATH_CAPACITY`)
    pub fn remote_mount_point(mut self, remote: impl AsRef<[u8]>) -> Self {
        self.remote = Some(bounded_copy(remote.as_ref(), PATH_CAPACITY));
        self
    }

    /// Set the local mount point (truncated to `PATH_CAPACITY`)
    pub fn local_mount_point(mut self, local: impl AsRef<Path>) -> Self {
        let bytes = local.as_ref().as_os_str().as_bytes();
        self.local = Some(bounded_copy(bytes, PATH_CAPACITY));
        self
    }

    pub fn guid_mode(mut self, enabled: bool) -> Self {
        self.guid_mode = enabled;
        self
    }

    /// Override the create-intent attribute shortcut. When unset it is
    /// enabled for `srm` and `gsiftp` backends, which cannot report a
    /// consistent state for an object that was just created.
    pub fn create_attr_shortcut(mut self, enabled: bool) -> Self {
        self.create_attr_shortcut = Some(enabled);
        self
    }

    pub fn build(self) -> Result<MountPoints> {
        let remote = self
            .remote
            .ok_or_else(|| GridFsError::Config("remote mount point not set".to_string()))?;
        let local = self
            .local
            .ok_or_else(|| GridFsError::Config("local mount point not set".to_string()))?;

        let create_attr_shortcut = self
            .create_attr_shortcut
            .unwrap_or_else(|| remote.starts_with(b"srm") || remote.starts_with(b"gsiftp"));

        Ok(MountPoints {
            remote,
            local,
            guid_mode: self.guid_mode,
            create_attr_shortcut,
        })
    }
}

/// Pure translation functions over one mount's configuration
#[derive(Debug, Clone)]
pub struct PathTranslator {
    mount: MountPoints,
}

impl PathTranslator {
    pub fn new(mount: MountPoints) -> Self {
        Self { mount }
    }

    pub fn mount_points(&self) -> &MountPoints {
        &self.mount
    }

    /// Build the remote identifier for a virtual path into a buffer of
    /// `capacity` bytes.
    ///
    /// In GUID mode the path minus its leading separator is the identifier;
    /// otherwise it is appended to the remote prefix.
    pub fn construct(&self, virtual_path: &[u8], capacity: usize) -> Vec<u8> {
        let mut buf = BoundedBuf::new(capacity);
        if self.mount.guid_mode {
            buf.push(virtual_path.get(1..).unwrap_or_default());
        } else {
            buf.push(&self.mount.remote);
            buf.push(virtual_path);
        }
        buf.into_bytes()
    }

    /// Translate a virtual path into a remote identifier
    pub fn to_remote(&self, virtual_path: &Path) -> RemotePath {
        RemotePath(self.construct(virtual_path.as_os_str().as_bytes(), PATH_CAPACITY))
    }

    /// Translate an absolute path rooted at the local mount point.
    ///
    /// Paths outside the local mount point have no remote counterpart and
    /// are rejected with `OutsideMount`.
    pub fn to_remote_from_local_absolute(&self, local_path: &Path) -> Result<RemotePath> {
        let bytes = local_path.as_os_str().as_bytes();
        match bytes.strip_prefix(self.mount.local.as_slice()) {
            Some(rest) => {
                let rest = bounded_copy(rest, PATH_CAPACITY);
                Ok(RemotePath(self.construct(&rest, PATH_CAPACITY)))
            }
            None => Err(GridFsError::OutsideMount(
                local_path.to_string_lossy().into_owned(),
            )),
        }
    }

    /// Map a symlink target reported by the backend back under the local mount.
    ///
    /// A target longer than the remote prefix has exactly that many leading
    /// bytes replaced by the local mount point; shorter targets are copied
    /// through. The result never exceeds `capacity - 1` bytes and a
    /// non-positive capacity yields nothing.
    pub fn readlink_target_to_virtual(&self, target: &[u8], capacity: isize) -> Vec<u8> {
        if capacity <= 0 {
            return Vec::new();
        }
        let capacity = capacity as usize;
        let prefix_len = self.mount.remote.len();
        let mut out = BoundedBuf::new(capacity);

        if target.len() > prefix_len {
            let end = target.len().min(PATH_CAPACITY - 1);
            let suffix = target.get(prefix_len..end).unwrap_or_default();
            out.push(&self.mount.local);
            if capacity > self.mount.local.len() {
                out.push(suffix);
            }
        } else {
            out.push(target);
        }

        out.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn translator(remote: &str, local: &str, guid_mode: bool) -> PathTranslator {
        let mount = MountPoints::builder()
            .remote_mount_point(remote)
            .local_mount_point(local)
            .guid_mode(guid_mode)
            .build()
            .unwrap();
        PathTranslator::new(mount)
    }

    #[test]
    fn test_to_remote_prefixes_virtual_path() {
        let t = translator("srm://host/base", "/mnt/grid", false);
        let remote = t.to_remote(Path::new("/dir/file.txt"));
        assert_eq!(remote.to_string(), "srm://host/base/dir/file.txt");
    }

    #[test]
    fn test_to_remote_guid_mode_strips_separator() {
        let t = translator("lfn://catalog", "/mnt/grid", true);
        let remote = t.to_remote(Path::new("/guid:3f2a-11"));
        assert_eq!(remote.to_string(), "guid:3f2a-11");
        assert!(t.construct(b"", PATH_CAPACITY).is_empty());
    }

    #[test]
    fn test_to_remote_truncates_oversized_input() {
        let long_prefix = "x".repeat(PATH_CAPACITY + 10);
        let t = translator(&long_prefix, "/mnt/grid", false);
        let remote = t.to_remote(Path::new("/dir/file"));
        assert_eq!(remote.len(), PATH_CAPACITY - 1);
        assert!(remote.as_bytes().iter().all(|b| *b == b'x'));

        let t = translator("srm://host", "/mnt/grid", false);
        let long_path = format!("/{}", "a".repeat(PATH_CAPACITY * 2));
        let remote = t.to_remote(Path::new(&long_path));
        assert_eq!(remote.len(), PATH_CAPACITY - 1);
        assert!(remote.as_bytes().starts_with(b"srm://host/aaa"));
    }

    #[test]
    fn test_construct_respects_small_capacity() {
        let t = translator("srm://host/base", "/mnt/grid", false);
        assert_eq!(t.construct(b"/f", 0), b"");
        assert_eq!(t.construct(b"/f", 1), b"");
        assert_eq!(t.construct(b"/f", 6), b"srm:/");
    }

    #[test]
    fn test_from_local_absolute_strips_local_prefix() {
        let t = translator("srm://host/base", "/mnt/grid", false);
        let remote = t
            .to_remote_from_local_absolute(Path::new("/mnt/grid/dir/target.txt"))
            .unwrap();
        assert_eq!(remote.to_string(), "srm://host/base/dir/target.txt");
    }

    #[test]
    fn test_from_local_absolute_rejects_foreign_path() {
        let t = translator("srm://host/base", "/mnt/grid", false);
        let err = t
            .to_remote_from_local_absolute(Path::new("/etc/passwd"))
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::EXDEV);
    }

    #[test]
    fn test_readlink_target_replaces_remote_prefix() {
        let t = translator("srm://host/base", "/mnt/grid", false);
        let local = t.readlink_target_to_virtual(b"srm://host/base/dir/target.txt", 2048);
        assert_eq!(local, b"/mnt/grid/dir/target.txt");
    }

    #[test]
    fn test_readlink_short_target_copied_through() {
        let t = translator("srm://host/base", "/mnt/grid", false);
        assert_eq!(t.readlink_target_to_virtual(b"../other", 2048), b"../other");
        assert_eq!(t.readlink_target_to_virtual(b"../other", 4), b"../");
    }

    #[test]
    fn test_readlink_capacity_below_local_prefix() {
        let t = translator("srm://host/base", "/mnt/grid", false);
        // Prefix alone, truncated; no suffix appended
        let out = t.readlink_target_to_virtual(b"srm://host/base/dir/target.txt", 6);
        assert_eq!(out, b"/mnt/");
        let out = t.readlink_target_to_virtual(b"srm://host/base/dir/target.txt", 9);
        assert_eq!(out, b"/mnt/gri");
    }

    #[test]
    fn test_readlink_non_positive_capacity() {
        let t = translator("srm://host/base", "/mnt/grid", false);
        assert!(t.readlink_target_to_virtual(b"srm://host/base/x", 0).is_empty());
        assert!(t.readlink_target_to_virtual(b"srm://host/base/x", -4).is_empty());
    }

    #[test]
    fn test_create_attr_shortcut_defaults_by_scheme() {
        let srm = translator("srm://host/base", "/mnt/a", false);
        let gsiftp = translator("gsiftp://host/base", "/mnt/b", false);
        let file = translator("file:///srv", "/mnt/c", false);
        assert!(srm.mount_points().create_attr_shortcut());
        assert!(gsiftp.mount_points().create_attr_shortcut());
        assert!(!file.mount_points().create_attr_shortcut());

        let forced = MountPoints::builder()
            .remote_mount_point("srm://host")
            .local_mount_point("/mnt/d")
            .create_attr_shortcut(false)
            .build()
            .unwrap();
        assert!(!forced.create_attr_shortcut());
    }

    #[test]
    fn test_builder_requires_both_mount_points() {
        assert!(MountPoints::builder().remote_mount_point("srm://h").build().is_err());
        assert!(MountPoints::builder().local_mount_point("/mnt").build().is_err());
    }

    proptest! {
        #[test]
        fn prop_to_remote_is_bounded_concatenation(
            remote in "[a-z]{1,8}://[a-z./]{0,3000}",
            path in "/[a-zA-Z0-9._/-]{0,3000}",
        ) {
            let t = translator(&remote, "/mnt/grid", false);
            let mut expected = format!("{}{}", remote, path).into_bytes();
            expected.truncate(PATH_CAPACITY - 1);
            let remote = t.to_remote(Path::new(&path));
            prop_assert_eq!(remote.as_bytes(), expected.as_slice());
        }

        #[test]
        fn prop_guid_mode_drops_first_byte(path in "/[a-zA-Z0-9:-]{0,200}") {
            let t = translator("lfn://catalog", "/mnt/grid", true);
            let remote = t.to_remote(Path::new(&path));
            prop_assert_eq!(remote.as_bytes(), &path.as_bytes()[1..]);
        }

        #[test]
        fn prop_readlink_never_exceeds_capacity(
            target in proptest::collection::vec(any::<u8>(), 0..5000),
            capacity in -8isize..4200,
        ) {
            let t = translator("srm://host/base", "/mnt/grid", false);
            let out = t.readlink_target_to_virtual(&target, capacity);
            let bound = if capacity <= 0 { 0 } else { capacity as usize - 1 };
            prop_assert!(out.len() <= bound);
        }

        #[test]
        fn prop_remote_round_trip(path in "/[a-zA-Z0-9._/-]{0,500}") {
            let t = translator("srm://host/base", "/mnt/grid", false);
            let remote = t.to_remote(Path::new(&path));
            let local = t.readlink_target_to_virtual(remote.as_bytes(), PATH_CAPACITY as isize);
            let expected = format!("/mnt/grid{}", path);
            prop_assert_eq!(local, expected.into_bytes());
        }
    }
}
