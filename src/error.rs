use std::io;
use thiserror::Error;

/// Main error type for gridfs operations
#[derive(Error, Debug)]
pub enum GridFsError {
    /// Failure reported by a remote-storage primitive, already remapped
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("Operation canceled")]
    Canceled,

    #[error("Bad or released handle: {0}")]
    BadHandle(u64),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path is outside the mount: {0}")]
    OutsideMount(String),

    #[error("Upload workflow failed: {0}")]
    Upload(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl GridFsError {
    /// Convert error to libc errno for FUSE responses
    pub fn to_errno(&self) -> i32 {
        match self {
            GridFsError::Remote { code, .. } => *code,
            GridFsError::Canceled => libc::ECANCELED,
            GridFsError::BadHandle(_) => libc::EBADF,
            GridFsError::NotFound(_) => libc::ENOENT,
            GridFsError::OutsideMount(_) => libc::EXDEV,
            GridFsError::Upload(_) => libc::EIO,
            GridFsError::Config(_) => libc::EINVAL,
            GridFsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Signed status as returned across the filesystem call boundary
    pub fn status(&self) -> i32 {
        -self.to_errno()
    }
}

/// Result type alias for gridfs operations
pub type Result<T> = std::result::Result<T, GridFsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_negated_errno() {
        let err = GridFsError::Remote {
            code: libc::ENOENT,
            message: "No such file or directory".to_string(),
        };
        assert_eq!(err.to_errno(), libc::ENOENT);
        assert_eq!(err.status(), -libc::ENOENT);
        assert_eq!(GridFsError::Canceled.status(), -libc::ECANCELED);
    }

    #[test]
    fn test_io_error_keeps_os_code() {
        let err = GridFsError::from(io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(err.to_errno(), libc::EACCES);

        let err = GridFsError::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.to_errno(), libc::EIO);
    }
}
