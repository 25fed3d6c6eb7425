//! Filesystem layer.
//!
//! The only filesystem is UniFS, a flat read-only image handed over by the
//! bootloader as module 0.

pub mod unifs;

pub use unifs::{FileHandle, FileSystem, FileType};

/// Filesystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The image header is malformed.
    Corrupt,
    /// No file with the requested name.
    NotFound,
}
