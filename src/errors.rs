//! Errors specific to reading, building and committing resources.

use alloc::string::String;

#[cfg(feature = "std")]
use std::{io::Error as IOError, path::PathBuf};

/// Error that can occur when reading and parsing bytes.
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
#[cfg_attr(feature = "std", error("{0}"))]
pub struct ReadError(pub String);

/// Errors that can occur when reading a PE image.
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum ImageReadError {
    #[cfg_attr(feature = "std", error("invalid bytes: {0}"))]
    InvalidBytes(ReadError),
    #[cfg_attr(feature = "std", error("invalid header: {0}"))]
    InvalidHeader(String),
    #[cfg_attr(feature = "std", error("invalid resource table: {0}"))]
    InvalidResourceTable(String),
}
impl From<ReadError> for ImageReadError {
    fn from(error: ReadError) -> Self { ImageReadError::InvalidBytes(error) }
}

/// Errors that can occur when writing a PE image.
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum ImageWriteError {
    #[cfg_attr(feature = "std", error("not enough space in file header"))]
    NotEnoughSpaceInHeader,
    #[cfg_attr(feature = "std", error("section points outside image: {0} > {1}"))]
    InvalidSectionRange(u64, u64),
    #[cfg_attr(feature = "std", error("image has no resource data directory entry"))]
    MissingResourceDataDirectory,
    #[cfg_attr(feature = "std", error("resource directory too large: {0} bytes"))]
    ResourceDirectoryTooLarge(u64),
}

/// Errors that can occur when reading an icon container.
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum IconError {
    #[cfg_attr(feature = "std", error("icon container truncated: {0} bytes"))]
    Truncated(usize),
    #[cfg_attr(feature = "std", error("invalid icon container header: reserved word is {0}"))]
    InvalidReserved(u16),
    #[cfg_attr(feature = "std", error("not an icon container: type word is {0}"))]
    InvalidType(u16),
    #[cfg_attr(feature = "std", error("icon container holds no images"))]
    Empty,
    #[cfg_attr(
        feature = "std",
        error("icon image {index} at {offset:#x} with size {length:#x} exceeds container size {size:#x}")
    )]
    ImageOutOfBounds { index: usize, offset: u32, length: u32, size: usize },
}

/// Errors that can occur when building a version record.
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum VersionInfoError {
    #[cfg_attr(feature = "std", error("version block {key} is {size} bytes, exceeding the 16 bit length field"))]
    SizeOverflow { key: String, size: usize },
}

/// Errors that can occur when reading or modifying resource data.
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum ResourceError {
    #[cfg_attr(feature = "std", error("invalid bytes: {0}"))]
    InvalidBytes(ReadError),
    #[cfg_attr(feature = "std", error("invalid record: {0}"))]
    InvalidRecord(String),
}
impl From<ReadError> for ResourceError {
    fn from(error: ReadError) -> Self { ResourceError::InvalidBytes(error) }
}

/// Errors that can occur when beginning, updating or ending an update session.
#[cfg(feature = "std")]
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    IOError(IOError),
    #[error("file is locked by another session: {0}")]
    Locked(PathBuf),
    #[error("invalid executable image: {0}")]
    InvalidImage(ImageReadError),
    #[error("could not build executable image: {0}")]
    Build(ImageWriteError),
}
#[cfg(feature = "std")]
impl From<IOError> for SessionError {
    fn from(error: IOError) -> Self { SessionError::IOError(error) }
}
#[cfg(feature = "std")]
impl From<ImageReadError> for SessionError {
    fn from(error: ImageReadError) -> Self { SessionError::InvalidImage(error) }
}
#[cfg(feature = "std")]
impl From<ImageWriteError> for SessionError {
    fn from(error: ImageWriteError) -> Self { SessionError::Build(error) }
}
#[cfg(feature = "std")]
impl SessionError {
    /// Returns the operating system error code of the underlying failure, if any.
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            SessionError::IOError(error) => error.raw_os_error(),
            _ => None,
        }
    }
}

/// Errors that can occur during a resource transaction.
#[cfg(feature = "std")]
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("could not open update session: {0}")]
    Session(SessionError),
    #[error("invalid resource record: {0}")]
    Stage(String),
    #[error("transaction is already finalized")]
    InvalidState,
    #[error("could not commit resources: {0}")]
    Commit(SessionError),
    #[error("invalid icon: {0}")]
    Format(IconError),
    #[error("invalid version info: {0}")]
    SizeOverflow(VersionInfoError),
    #[error("io error: {0}")]
    IOError(IOError),
}
#[cfg(feature = "std")]
impl From<IconError> for TransactionError {
    fn from(error: IconError) -> Self { TransactionError::Format(error) }
}
#[cfg(feature = "std")]
impl From<VersionInfoError> for TransactionError {
    fn from(error: VersionInfoError) -> Self { TransactionError::SizeOverflow(error) }
}
#[cfg(feature = "std")]
impl From<IOError> for TransactionError {
    fn from(error: IOError) -> Self { TransactionError::IOError(error) }
}
#[cfg(feature = "std")]
impl TransactionError {
    /// Returns the operating system error code of the underlying failure, if any.
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            TransactionError::Session(error) | TransactionError::Commit(error) => {
                error.os_error_code()
            }
            TransactionError::IOError(error) => error.raw_os_error(),
            _ => None,
        }
    }
}
