//! Per-call error, logging and cancellation envelope
//!
//! Every dispatched operation runs with its own `CallContext`. The remote
//! outcome lands in the context's `ErrorSlot`, is translated into the
//! errno convention, logged, and the slot is cleared again before the
//! operation returns, so no failure can leak into an unrelated call.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::connector::{RemoteError, RemoteResult};
use crate::error::{GridFsError, Result};

/// "No such attribute" (ENOATTR is an alias of ENODATA on Linux)
pub const ENOATTR: i32 = libc::ENODATA;

/// Cooperative cancellation flag shared between a mount and its calls
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Last remote error observed by one call
#[derive(Debug, Default)]
pub struct ErrorSlot(Option<RemoteError>);

impl ErrorSlot {
    pub fn set(&mut self, err: RemoteError) {
        self.0 = Some(err);
    }

    /// Take the error, leaving the slot clear
    pub fn take(&mut self) -> Option<RemoteError> {
        self.0.take()
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }
}

/// Error remapping applied to a failed remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remap {
    /// Report the remote code unchanged
    Never,
    /// Backends without attribute support answer "not supported"; report
    /// that as a missing attribute, which is expected and frequent
    MissingAttribute,
}

impl Remap {
    pub fn apply(self, code: i32) -> i32 {
        match self {
            Remap::MissingAttribute
                if code == libc::EPROTONOSUPPORT || code == libc::EOPNOTSUPP =>
            {
                ENOATTR
            }
            _ => code,
        }
    }

    /// Whether a translated code is routine for this remap and logged quietly
    fn is_quiet(self, code: i32) -> bool {
        matches!(self, Remap::MissingAttribute) && code == ENOATTR
    }
}

/// State threaded through one dispatched operation
#[derive(Debug)]
pub struct CallContext {
    slot: ErrorSlot,
    cancel: CancelToken,
}

impl CallContext {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            slot: ErrorSlot::default(),
            cancel,
        }
    }

    /// Context that is never cancelled
    pub fn detached() -> Self {
        Self::new(CancelToken::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drop any stale error left by an earlier call
    pub fn clear_error(&mut self) {
        self.slot.clear();
    }

    pub fn has_error(&self) -> bool {
        self.slot.is_set()
    }

    /// Record a remote outcome and translate it.
    ///
    /// On failure the error is logged with the operation and remote
    /// identifier, remapped, and the slot cleared.
    pub fn interpret<T>(
        &mut self,
        op: &'static str,
        subject: &dyn fmt::Display,
        remap: Remap,
        outcome: RemoteResult<T>,
    ) -> Result<T> {
        match outcome {
            Ok(value) => Ok(value),
            Err(err) => {
                self.slot.set(err);
                Err(self.translate(op, subject, remap))
            }
        }
    }

    fn translate(&mut self, op: &'static str, subject: &dyn fmt::Display, remap: Remap) -> GridFsError {
        let err = self
            .slot
            .take()
            .unwrap_or_else(|| RemoteError::from_code(libc::EIO));
        // A failure must never reach the kernel as a success status
        let code = if err.code > 0 {
            remap.apply(err.code)
        } else {
            libc::EIO
        };

        if remap.is_quiet(code) {
            debug!(op, path = %subject, code, "{}", err.message);
        } else {
            warn!(op, path = %subject, code, "remote error: {}", err.message);
        }

        GridFsError::Remote {
            code,
            message: err.message,
        }
    }

    /// Final step of every operation: cancellation overrides the result
    pub fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        self.slot.clear();
        if self.is_cancelled() {
            return Err(GridFsError::Canceled);
        }
        result
    }
}
