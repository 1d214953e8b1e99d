//! Foundation utilities shared across the arbor crates: the lock-file
//! protocol used to guard the dircache, and scoped temporary files.

mod error;
pub mod lockfile;
pub mod tempfile;

pub use error::{LockError, UtilError};

/// Convenience result alias for utility operations.
pub type Result<T> = std::result::Result<T, UtilError>;
