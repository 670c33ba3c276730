//! Error types for the frame relay

use std::io;
use thiserror::Error;

/// Result type for frame relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while creating, opening or using a channel
///
/// Only resource failures are reported here. Transient conditions such as a
/// busy lock or a frame that is not newer than the last one are reported
/// through return values instead.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The named channel does not exist (yet)
    #[error("Channel '{name}' does not exist")]
    ChannelNotFound { name: String },

    /// Failed to create or reopen the shared memory object
    #[error("Failed to create channel '{name}': {source}")]
    ChannelCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open an existing shared memory object
    #[error("Failed to open channel '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Channel name cannot be used as a shared memory name
    #[error("Invalid channel name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Frame dimensions are zero or overflow the region size
    #[error("Invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Pixel buffer length does not match the announced dimensions
    #[error("Frame size mismatch: expected {expected} bytes, got {got} bytes")]
    FrameSizeMismatch { expected: usize, got: usize },

    /// The region was written by an incompatible build
    #[error(
        "Channel layout mismatch: expected magic 0x{expected_magic:08X} v{expected_version}, \
         got 0x{got_magic:08X} v{got_version}"
    )]
    LayoutMismatch {
        expected_magic: u32,
        got_magic: u32,
        expected_version: u32,
        got_version: u32,
    },

    /// Mapping is smaller than the header requires
    #[error("Shared memory region too small: need {required} bytes, have {actual}")]
    RegionTooSmall { required: usize, actual: usize },
}

impl RelayError {
    /// Whether the caller should simply retry later
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::ChannelNotFound { .. })
    }
}
