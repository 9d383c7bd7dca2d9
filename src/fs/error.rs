//! File-layer error types.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    InvalidPath,
    NoSpace,
    IoError,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "No such file"),
            FsError::AlreadyExists => write!(f, "File exists"),
            FsError::InvalidPath => write!(f, "Invalid file name"),
            FsError::NoSpace => write!(f, "No space left"),
            FsError::IoError => write!(f, "I/O error"),
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;
