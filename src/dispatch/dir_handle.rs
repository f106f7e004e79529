//! Directory handle registry
//!
//! A directory session spans `opendir`, any number of `readdir` calls and
//! `releasedir`. The kernel only carries an opaque `u64` between them;
//! this registry maps that token to the remote cursor it owns.
//!
//! The most recent entries pulled from the cursor are kept so that a
//! `readdir` at a slightly earlier offset (a retry after a full reply
//! buffer) is replayed without touching the remote directory. At most
//! `REPLAY_WINDOW` entries are held per session. An offset older than the
//! window (rewinddir on a large listing) needs the session restarted on a
//! fresh cursor with `rewind`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::connector::{DirCursor, RemoteDirEntry, RemoteError, RemoteResult};
use crate::error::{GridFsError, Result};
use crate::path::RemotePath;

/// Entries held per session for replaying earlier offsets
pub const REPLAY_WINDOW: usize = 1024;

/// State of one open directory session
struct DirHandle {
    cursor: Option<DirCursor>,
    remote_path: RemotePath,
    /// Most recent entries read from the cursor, in listing order
    seen: VecDeque<RemoteDirEntry>,
    /// Offset of the first entry in `seen`
    base: u64,
    exhausted: bool,
}

impl DirHandle {
    fn remember(&mut self, entry: RemoteDirEntry, window: usize) {
        self.seen.push_back(entry);
        if self.seen.len() > window {
            self.seen.pop_front();
            self.base += 1;
        }
    }
}

/// Maps opaque directory tokens to their sessions
pub struct DirHandleRegistry {
    handles: DashMap<u64, Arc<Mutex<DirHandle>>>,
    next_handle: AtomicU64,
    window: usize,
}

impl DirHandleRegistry {
    pub fn new() -> Self {
        Self::with_replay_window(REPLAY_WINDOW)
    }

    /// Registry keeping at most `window` entries per session
    pub fn with_replay_window(window: usize) -> Self {
        Self {
            handles: DashMap::new(),
            next_handle: AtomicU64::new(1),
            window: window.max(1),
        }
    }

    /// Register a new session owning `cursor`.
    ///
    /// A missing cursor is accepted; iterating such a handle fails with EBADF.
    pub fn create(&self, cursor: Option<DirCursor>, remote_path: RemotePath) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let state = DirHandle {
            cursor,
            remote_path,
            seen: VecDeque::new(),
            base: 0,
            exhausted: false,
        };
        self.handles.insert(handle, Arc::new(Mutex::new(state)));
        handle
    }

    fn get(&self, handle: u64) -> Result<Arc<Mutex<DirHandle>>> {
        self.handles
            .get(&handle)
            .map(|h| h.clone())
            .ok_or(GridFsError::BadHandle(handle))
    }

    /// Remote identifier the session was opened on
    pub async fn remote_path(&self, handle: u64) -> Result<RemotePath> {
        let state = self.get(handle)?;
        let state = state.lock().await;
        Ok(state.remote_path.clone())
    }

    /// Whether iterating from `offset` can be served without a rewind
    pub async fn can_replay(&self, handle: u64, offset: u64) -> Result<bool> {
        let state = self.get(handle)?;
        let state = state.lock().await;
        Ok(offset >= state.base)
    }

    /// Restart a session on a fresh cursor, returning the one it replaces
    pub async fn rewind(&self, handle: u64, cursor: DirCursor) -> Result<Option<DirCursor>> {
        let state = self.get(handle)?;
        let mut state = state.lock().await;
        state.seen.clear();
        state.base = 0;
        state.exhausted = false;
        Ok(state.cursor.replace(cursor))
    }

    /// Enumerate entries starting at `offset`.
    ///
    /// `emit` receives each entry with the offset of the entry after it and
    /// returns `true` when the consumer is full, which stops iteration
    /// without error. Calls on the same handle are serialized. An offset
    /// that fell out of the replay window fails with EINVAL.
    pub async fn iterate<F>(&self, handle: u64, offset: u64, mut emit: F) -> Result<RemoteResult<()>>
    where
        F: FnMut(&RemoteDirEntry, u64) -> bool,
    {
        let state = self.get(handle)?;
        let mut state = state.lock().await;
        let state = &mut *state;
        if offset < state.base {
            return Ok(Err(RemoteError::new(
                libc::EINVAL,
                format!("offset {} precedes replay window at {}", offset, state.base),
            )));
        }
        let mut index = offset;

        loop {
            let pos = (index - state.base) as usize;
            if pos < state.seen.len() {
                if emit(&state.seen[pos], index + 1) {
                    return Ok(Ok(()));
                }
                index += 1;
                continue;
            }
            if state.exhausted {
                return Ok(Ok(()));
            }

            let cursor = state.cursor.as_mut().ok_or(GridFsError::BadHandle(handle))?;
            match cursor.next_entry().await {
                Ok(Some(entry)) => state.remember(entry, self.window),
                Ok(None) => state.exhausted = true,
                Err(e) => return Ok(Err(e)),
            }
        }
    }

    /// Take the cursor out of a live session so it can be closed
    pub async fn resolve_cursor(&self, handle: u64) -> Result<DirCursor> {
        let state = self.get(handle)?;
        let mut state = state.lock().await;
        state.cursor.take().ok_or(GridFsError::BadHandle(handle))
    }

    /// Forget a session. The remote cursor is not closed here.
    pub fn destroy(&self, handle: u64) -> Result<()> {
        self.handles
            .remove(&handle)
            .map(|_| ())
            .ok_or(GridFsError::BadHandle(handle))
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for DirHandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{FileKind, RemoteDir, RemoteError};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct VecCursor {
        entries: VecDeque<RemoteDirEntry>,
        pulls: Arc<AtomicU64>,
    }

    #[async_trait]
    impl RemoteDir for VecCursor {
        async fn next_entry(&mut self) -> RemoteResult<Option<RemoteDirEntry>> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(self.entries.pop_front())
        }
    }

    struct FailingCursor;

    #[async_trait]
    impl RemoteDir for FailingCursor {
        async fn next_entry(&mut self) -> RemoteResult<Option<RemoteDirEntry>> {
            Err(RemoteError::from_code(libc::EIO))
        }
    }

    fn names(n: usize) -> Vec<RemoteDirEntry> {
        (0..n)
            .map(|i| RemoteDirEntry::new(format!("entry-{}", i), FileKind::File))
            .collect()
    }

    fn cursor(entries: Vec<RemoteDirEntry>) -> (DirCursor, Arc<AtomicU64>) {
        let pulls = Arc::new(AtomicU64::new(0));
        let cursor = VecCursor {
            entries: entries.into(),
            pulls: pulls.clone(),
        };
        (Box::new(cursor), pulls)
    }

    async fn collect(registry: &DirHandleRegistry, handle: u64, offset: u64) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        registry
            .iterate(handle, offset, |entry, next| {
                out.push((entry.name.to_string_lossy().into_owned(), next));
                false
            })
            .await
            .unwrap()
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_iterate_yields_cursor_order_once() {
        let registry = DirHandleRegistry::new();
        let (cursor, _) = cursor(names(4));
        let handle = registry.create(Some(cursor), RemotePath::from("srm://h/dir"));

        let listed = collect(&registry, handle, 0).await;
        assert_eq!(
            listed,
            vec![
                ("entry-0".to_string(), 1),
                ("entry-1".to_string(), 2),
                ("entry-2".to_string(), 3),
                ("entry-3".to_string(), 4),
            ]
        );

        registry.destroy(handle).unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_iterate_stops_when_consumer_full() {
        let registry = DirHandleRegistry::new();
        let (cursor, pulls) = cursor(names(10));
        let handle = registry.create(Some(cursor), RemotePath::from("srm://h/dir"));

        let mut first = Vec::new();
        registry
            .iterate(handle, 0, |entry, next| {
                first.push(entry.name.clone());
                next == 3
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(pulls.load(Ordering::SeqCst), 3);

        // Resume after the last accepted entry
        let rest = collect(&registry, handle, 3).await;
        assert_eq!(rest.first().map(|(n, _)| n.as_str()), Some("entry-3"));
        assert_eq!(rest.len(), 7);
    }

    #[tokio::test]
    async fn test_iterate_replays_earlier_offsets() {
        let registry = DirHandleRegistry::new();
        let (cursor, pulls) = cursor(names(3));
        let handle = registry.create(Some(cursor), RemotePath::from("srm://h/dir"));

        let first = collect(&registry, handle, 0).await;
        let pulls_after_first = pulls.load(Ordering::SeqCst);
        let again = collect(&registry, handle, 0).await;

        assert_eq!(first, again);
        assert_eq!(pulls.load(Ordering::SeqCst), pulls_after_first);
        assert!(collect(&registry, handle, 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_replay_is_bounded_by_window() {
        let registry = DirHandleRegistry::with_replay_window(4);
        let (first, pulls) = cursor(names(10));
        let handle = registry.create(Some(first), RemotePath::from("srm://h/dir"));

        assert_eq!(collect(&registry, handle, 0).await.len(), 10);
        assert!(registry.can_replay(handle, 6).await.unwrap());
        assert!(!registry.can_replay(handle, 5).await.unwrap());

        // Offsets inside the window replay without pulling again
        let pulled = pulls.load(Ordering::SeqCst);
        let tail = collect(&registry, handle, 7).await;
        assert_eq!(tail.first(), Some(&("entry-7".to_string(), 8)));
        assert_eq!(tail.len(), 3);
        assert_eq!(pulls.load(Ordering::SeqCst), pulled);

        let outcome = registry.iterate(handle, 0, |_, _| false).await.unwrap();
        assert_eq!(outcome.unwrap_err().code, libc::EINVAL);
    }

    #[tokio::test]
    async fn test_rewind_restarts_listing() {
        let registry = DirHandleRegistry::with_replay_window(2);
        let (first, _) = cursor(names(5));
        let handle = registry.create(Some(first), RemotePath::from("srm://h/dir"));
        collect(&registry, handle, 0).await;
        assert!(!registry.can_replay(handle, 0).await.unwrap());

        let (second, _) = cursor(names(5));
        let replaced = registry.rewind(handle, second).await.unwrap();
        assert!(replaced.is_some());
        assert!(registry.can_replay(handle, 0).await.unwrap());

        let listed = collect(&registry, handle, 0).await;
        assert_eq!(listed.len(), 5);
        assert_eq!(listed[0], ("entry-0".to_string(), 1));
    }

    #[tokio::test]
    async fn test_destroyed_handle_fails_deterministically() {
        let registry = DirHandleRegistry::new();
        let (cursor, _) = cursor(names(2));
        let handle = registry.create(Some(cursor), RemotePath::from("srm://h/dir"));

        let taken = registry.resolve_cursor(handle).await;
        assert!(taken.is_ok());
        registry.destroy(handle).unwrap();

        let err = registry.iterate(handle, 0, |_, _| false).await.unwrap_err();
        assert_eq!(err.to_errno(), libc::EBADF);
        assert!(registry.destroy(handle).is_err());
        assert!(registry.resolve_cursor(handle).await.is_err());
    }

    #[tokio::test]
    async fn test_handle_without_cursor() {
        let registry = DirHandleRegistry::new();
        let handle = registry.create(None, RemotePath::from("srm://h/missing"));
        assert_eq!(
            registry.remote_path(handle).await.unwrap(),
            RemotePath::from("srm://h/missing")
        );
        let err = registry.iterate(handle, 0, |_, _| false).await.unwrap_err();
        assert_eq!(err.to_errno(), libc::EBADF);
    }

    #[tokio::test]
    async fn test_cursor_error_surfaces_as_remote_result() {
        let registry = DirHandleRegistry::new();
        let handle = registry.create(Some(Box::new(FailingCursor)), RemotePath::from("srm://h/d"));
        let outcome = registry.iterate(handle, 0, |_, _| false).await.unwrap();
        assert_eq!(outcome.unwrap_err().code, libc::EIO);
    }

    #[tokio::test]
    async fn test_concurrent_iteration_of_one_handle_is_serialized() {
        let registry = Arc::new(DirHandleRegistry::new());
        let (cursor, pulls) = cursor(names(50));
        let handle = registry.create(Some(cursor), RemotePath::from("srm://h/dir"));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                collect(&registry, handle, 0).await
            }));
        }

        let expected: Vec<String> = (0..50).map(|i| format!("entry-{}", i)).collect();
        for task in tasks {
            let listed: Vec<String> = task.await.unwrap().into_iter().map(|(n, _)| n).collect();
            assert_eq!(listed, expected);
        }
        // 50 entries plus the final end-of-listing pull
        assert_eq!(pulls.load(Ordering::SeqCst), 51);
    }

    #[tokio::test]
    async fn test_handles_are_unique() {
        let registry = DirHandleRegistry::new();
        let a = registry.create(None, RemotePath::from("srm://h/a"));
        let b = registry.create(None, RemotePath::from("srm://h/b"));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }
}
