//! Error types for the eventbox storage engine.

use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of every error the engine can return.
///
/// Callers that only need to distinguish "bad input" from "the disk failed"
/// match on this rather than on the per-component enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A caller-provided value is not acceptable (bad fan-out, bad data type,
    /// incompatible kind/version, malformed block or settings).
    InvalidArgument,
    /// An index is outside the valid range (dimension or depth).
    OutOfRange,
    /// Opening, reading, writing or copying the backing file failed.
    FileError,
    /// The operation needs state that is not present (e.g. file backing).
    RuntimeError,
}

/// The main error type for all eventbox operations.
#[derive(Error, Debug)]
pub enum EventBoxError {
    /// Error from the box controller's split policy or settings.
    #[error("box controller error: {0}")]
    Controller(#[from] ControllerError),

    /// Error describing or migrating the on-disk record format.
    #[error("record format error: {0}")]
    Format(#[from] FormatError),

    /// Error from the free-space allocator.
    #[error("free space error: {0}")]
    FreeSpace(#[from] FreeSpaceError),

    /// Error from an I/O backend.
    #[error("file I/O error: {0}")]
    FileIo(#[from] FileIoError),

    /// Error from the write-back cache.
    #[error("disk buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Error building or filling the box tree.
    #[error("box tree error: {0}")]
    Tree(#[from] TreeError),
}

impl EventBoxError {
    /// Returns the coarse classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Controller(e) => e.kind(),
            Self::Format(_) | Self::FreeSpace(_) | Self::Tree(_) => ErrorKind::InvalidArgument,
            Self::FileIo(e) => e.kind(),
            Self::Buffer(e) => e.kind(),
        }
    }
}

/// Errors raised by the box controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// A controller needs at least one dimension.
    #[error("number of dimensions must be at least 1")]
    ZeroDimensions,

    /// A per-dimension fan-out index is past the last dimension.
    #[error("split dimension {dim} is out of range for {n_dims} dimensions")]
    DimensionOutOfRange {
        /// The requested dimension.
        dim: usize,
        /// The controller's dimensionality.
        n_dims: usize,
    },

    /// A top-level fan-out index is past the last dimension.
    #[error("top-level split dimension {dim} is invalid for {n_dims} dimensions")]
    InvalidTopDimension {
        /// The requested dimension.
        dim: usize,
        /// The controller's dimensionality.
        n_dims: usize,
    },

    /// Fan-out must be at least one.
    #[error("fan-out for dimension {dim} must be >= 1, got {value}")]
    InvalidFanOut {
        /// The dimension being configured.
        dim: usize,
        /// The rejected fan-out.
        value: usize,
    },

    /// Depth is at or beyond the maximum depth.
    #[error("depth {depth} is out of range (max depth {max_depth})")]
    DepthOutOfRange {
        /// The requested depth.
        depth: usize,
        /// The configured maximum depth.
        max_depth: usize,
    },

    /// Maximum depth past the supported limit.
    #[error("max depth {depth} exceeds the limit of {limit}")]
    MaxDepthTooLarge {
        /// The requested maximum depth.
        depth: usize,
        /// The largest accepted maximum depth.
        limit: usize,
    },

    /// An I/O backend was built for a different dimensionality.
    #[error("I/O backend has {found} dimensions, controller has {expected}")]
    DimensionMismatch {
        /// The controller's dimensionality.
        expected: usize,
        /// The backend's dimensionality.
        found: usize,
    },

    /// Serialized settings could not be parsed or are inconsistent.
    #[error("invalid controller settings: {reason}")]
    InvalidSettings {
        /// What was wrong with the settings.
        reason: String,
    },

    /// Failed to read or write the XML settings blob.
    #[error("controller settings XML: {reason}")]
    SettingsXml {
        /// The reader or writer error.
        reason: String,
    },

    /// Failed to serialize or parse JSON settings.
    #[error("controller settings JSON: {0}")]
    SettingsJson(#[from] serde_json::Error),

    /// The operation needs file backing and the controller has none.
    #[error("{operation} requires a file-backed box controller")]
    NotFileBacked {
        /// The operation that was attempted.
        operation: &'static str,
    },
}

impl ControllerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::DimensionOutOfRange { .. } | Self::DepthOutOfRange { .. } => {
                ErrorKind::OutOfRange
            }
            Self::NotFileBacked { .. } => ErrorKind::RuntimeError,
            _ => ErrorKind::InvalidArgument,
        }
    }
}

/// Errors describing the record format or migrating blocks between versions.
#[derive(Error, Debug)]
pub enum FormatError {
    /// Coordinates are stored in single (4) or double (8) precision only.
    #[error("coordinate size must be 4 or 8 bytes, got {size}")]
    InvalidCoordSize {
        /// The rejected size.
        size: usize,
    },

    /// The event kind name is not recognised.
    #[error("unknown event kind '{name}' (expected \"MDEvent\" or \"MDLeanEvent\")")]
    UnknownEventKind {
        /// The rejected name.
        name: String,
    },

    /// The numeric event data version is not recognised.
    #[error("unknown event data version {value} (expected 2, 4 or 5)")]
    UnknownVersion {
        /// The rejected value.
        value: u32,
    },

    /// The event kind cannot be stored with this data version.
    #[error("event kind {kind} cannot be stored with event data version {version}")]
    IncompatibleVersion {
        /// The event kind name.
        kind: &'static str,
        /// The version name.
        version: &'static str,
    },

    /// The migration direction is neither READ nor WRITE.
    #[error("unknown block direction '{direction}' (expected \"READ\" or \"WRITE\")")]
    UnknownDirection {
        /// The rejected direction.
        direction: String,
    },

    /// A block does not hold a whole number of records.
    #[error("block of {len} values is not a whole number of {columns}-column records")]
    MalformedBlock {
        /// The number of values in the block.
        len: usize,
        /// The record width.
        columns: usize,
    },
}

/// Errors raised by the free-space allocator.
#[derive(Error, Debug)]
pub enum FreeSpaceError {
    /// Extents must have a non-zero length.
    #[error("free extent at {position} has zero length")]
    EmptyExtent {
        /// The position of the empty extent.
        position: u64,
    },

    /// Two extents claim the same space.
    #[error("free extent {position}+{length} overlaps free space starting at {existing}")]
    Overlap {
        /// Start of the rejected extent.
        position: u64,
        /// Length of the rejected extent.
        length: u64,
        /// Start of the extent it collides with.
        existing: u64,
    },
}

/// Errors raised by I/O backends.
#[derive(Error, Debug)]
pub enum FileIoError {
    /// The file does not exist and the mode requires it.
    #[error("file '{}' does not exist", path.display())]
    NotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// The file could not be opened or created.
    #[error("failed to open '{}': {source}", path.display())]
    OpenFailed {
        /// The path being opened.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The open mode string is not recognised.
    #[error("unknown open mode '{mode}' (expected r, w or W)")]
    InvalidMode {
        /// The rejected mode.
        mode: String,
    },

    /// The file exists but is not a valid container.
    #[error("container '{}' is corrupted: {reason}", path.display())]
    Corrupted {
        /// The container path.
        path: PathBuf,
        /// Description of the problem.
        reason: String,
    },

    /// Reading from the container failed.
    #[error("failed to read '{}' at event {position}: {source}", path.display())]
    ReadFailed {
        /// The container path.
        path: PathBuf,
        /// The logical event position.
        position: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Writing to the container failed.
    #[error("failed to write '{}' at event {position}: {source}", path.display())]
    WriteFailed {
        /// The container path.
        path: PathBuf,
        /// The logical event position.
        position: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Flushing the container to disk failed.
    #[error("failed to sync '{}' to disk: {source}", path.display())]
    SyncFailed {
        /// The container path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Copying the container failed.
    #[error("failed to copy '{}' to '{}': {source}", from.display(), to.display())]
    CopyFailed {
        /// The source path.
        from: PathBuf,
        /// The destination path.
        to: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A read asked for events past the end of the data region.
    #[error("events {position}..{end} are beyond the file length of {length} events")]
    BeyondEnd {
        /// First requested event.
        position: u64,
        /// One past the last requested event.
        end: u64,
        /// Current file length in events.
        length: u64,
    },

    /// The backend was opened read-only.
    #[error("'{}' is open read-only", path.display())]
    ReadOnly {
        /// The container path.
        path: PathBuf,
    },

    /// The operation needs an open file.
    #[error("no file is open")]
    NotOpen,

    /// The data type cannot change once events are stored.
    #[error("cannot change the data type of '{}': it already holds {events} events", path.display())]
    DataTypeLocked {
        /// The container path.
        path: PathBuf,
        /// Number of stored events.
        events: u64,
    },

    /// The backend cannot perform this operation at all.
    #[error("{operation} is not supported by this backend")]
    Unsupported {
        /// The operation that was attempted.
        operation: &'static str,
    },
}

impl FileIoError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidMode { .. } => ErrorKind::InvalidArgument,
            Self::DataTypeLocked { .. } | Self::Unsupported { .. } => ErrorKind::RuntimeError,
            _ => ErrorKind::FileError,
        }
    }
}

/// Errors raised by the write-back cache.
#[derive(Error, Debug)]
pub enum BufferError {
    /// The box has neither a buffered block nor an on-disk location.
    #[error("no data is stored for box {box_id}")]
    UnknownBlock {
        /// The box id.
        box_id: u64,
    },
}

impl BufferError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownBlock { .. } => ErrorKind::RuntimeError,
        }
    }
}

/// Errors raised while building or filling the box tree.
#[derive(Error, Debug)]
pub enum TreeError {
    /// The number of extents or coordinates does not match the dimensions.
    #[error("expected {expected} coordinates, got {found}")]
    CoordinateCount {
        /// The controller's dimensionality.
        expected: usize,
        /// The number supplied.
        found: usize,
    },

    /// An extent is empty, reversed or not finite.
    #[error("extent {min}..{max} of dimension {dim} is not a valid range")]
    InvalidExtent {
        /// The offending dimension.
        dim: usize,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
}

/// Type alias for `Result<T, EventBoxError>`.
pub type Result<T> = std::result::Result<T, EventBoxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err: EventBoxError = ControllerError::DimensionOutOfRange { dim: 3, n_dims: 2 }.into();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);

        let err: EventBoxError = ControllerError::InvalidTopDimension { dim: 3, n_dims: 2 }.into();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err: EventBoxError = FormatError::InvalidCoordSize { size: 7 }.into();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err: EventBoxError = FileIoError::NotFound {
            path: PathBuf::from("missing.evbx"),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::FileError);

        let err: EventBoxError = ControllerError::NotFileBacked { operation: "evict" }.into();
        assert_eq!(err.kind(), ErrorKind::RuntimeError);
    }

    #[test]
    fn test_messages_name_the_offender() {
        let err: EventBoxError = FormatError::UnknownEventKind {
            name: "MDFatEvent".to_string(),
        }
        .into();
        assert!(err.to_string().contains("MDFatEvent"));

        let err: EventBoxError = FileIoError::NotFound {
            path: PathBuf::from("/tmp/nowhere.evbx"),
        }
        .into();
        assert!(err.to_string().contains("/tmp/nowhere.evbx"));
    }
}
