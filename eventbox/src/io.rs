//! The I/O backend contract used by the box controller.
//!
//! A backend owns one backing file (or an in-memory stand-in), the data type
//! description of the records inside it, and the file's free-space map. The
//! box controller never talks to a backend directly; it hands it to a
//! [`DiskBuffer`](crate::disk_buffer::DiskBuffer) which decides when blocks
//! are read or written.
//!
//! Two implementations ship with the crate:
//!
//! - [`FileBoxIo`](crate::file_io::FileBoxIo): memory-mapped container file
//! - [`MemoryBoxIo`](crate::memory_io::MemoryBoxIo): in-memory, for tests
//!   and dry runs

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::codec::{Direction, EventDataVersion, EventSchema, RecordLayout};
use crate::error::{FileIoError, Result};
use crate::free_space::FreeSpaceMap;

/// How a backing file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    /// Existing file, no writes.
    Read,
    /// New file, truncating anything already at the path.
    Write,
    /// Existing file if present, otherwise a new one; reads and writes.
    ReadWrite,
}

impl OpenMode {
    /// Whether blocks may be written in this mode.
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::Read)
    }
}

impl FromStr for OpenMode {
    type Err = crate::error::EventBoxError;

    /// Parses `"r"`/`"R"` (read), `"w"` (write/create) and `"W"` or any
    /// casing of `"rw"` (read-write).
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" | "R" => Ok(Self::Read),
            "w" => Ok(Self::Write),
            "W" => Ok(Self::ReadWrite),
            _ if s.eq_ignore_ascii_case("rw") => Ok(Self::ReadWrite),
            _ => Err(FileIoError::InvalidMode {
                mode: s.to_string(),
            }
            .into()),
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "r",
            Self::Write => "w",
            Self::ReadWrite => "W",
        })
    }
}

/// Durable storage of fixed-width event records plus free-space state.
///
/// Positions are event indices. Blocks passed in and out are in the
/// in-memory record shape ([`RecordLayout::n_data_columns`] values per
/// event); the backend migrates and narrows them to the on-disk shape.
pub trait BoxControllerIo: fmt::Debug + Send {
    /// Dimensionality the backend was built for.
    fn n_dims(&self) -> usize;

    /// Opens (or creates) the backing file.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown mode, a missing file in read mode, or
    /// a file that is not a valid container.
    fn open_file(&mut self, path: &Path, mode: &str) -> Result<()>;

    /// Whether a file is currently open.
    fn is_opened(&self) -> bool;

    /// Path of the open file.
    fn file_name(&self) -> Option<&Path>;

    /// Mode of the open file.
    fn open_mode(&self) -> Option<OpenMode>;

    /// Writes pending metadata and syncs the file.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError`] if the sync fails.
    fn flush_data(&mut self) -> Result<()>;

    /// Flushes and closes the file. Closing a closed backend is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError`] if the final flush fails.
    fn close_file(&mut self) -> Result<()>;

    /// Current data type description.
    fn schema(&self) -> &EventSchema;

    /// Replaces the data type description.
    ///
    /// # Errors
    ///
    /// Returns an error if the file already stores events in another format.
    fn replace_schema(&mut self, schema: EventSchema) -> Result<()>;

    /// Writes a block of events starting at `position`.
    ///
    /// # Errors
    ///
    /// Returns an error if the block is malformed, the file is closed or
    /// read-only, or the write fails.
    fn save_block(&mut self, data: &[f64], position: u64) -> Result<()>;

    /// Reads `n_events` events starting at `position` into `data`, replacing
    /// its contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is closed or the range is past the end.
    fn load_block(&mut self, data: &mut Vec<f64>, position: u64, n_events: usize) -> Result<()>;

    /// Length of the data region in events.
    fn file_length(&self) -> u64;

    /// The free-space map.
    fn free_space(&self) -> &FreeSpaceMap;

    /// Mutable access to the free-space map.
    fn free_space_mut(&mut self) -> &mut FreeSpaceMap;

    /// Duplicates the backing file at `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error if no file is open or the copy fails.
    fn copy_file_to(&mut self, dest: &Path) -> Result<()>;

    /// Sets precision and event kind.
    ///
    /// # Errors
    ///
    /// Returns an error for a size other than 4 or 8, an unknown kind, a kind
    /// that conflicts with the explicit version, or a file with stored events.
    fn set_data_type(&mut self, coord_size: usize, kind_name: &str) -> Result<()> {
        let mut schema = *self.schema();
        schema.set_data_type(coord_size, kind_name)?;
        self.replace_schema(schema)
    }

    /// Pins the on-disk format version.
    ///
    /// # Errors
    ///
    /// Returns an error if the version conflicts with the event kind.
    fn set_event_data_version(&mut self, version: EventDataVersion) -> Result<()> {
        let mut schema = *self.schema();
        schema.set_event_data_version(version)?;
        self.replace_schema(schema)
    }

    /// Effective on-disk format version.
    fn event_data_version(&self) -> EventDataVersion {
        self.schema().version()
    }

    /// Record layout for this backend.
    fn layout(&self) -> RecordLayout {
        self.schema().layout(self.n_dims())
    }

    /// Values per in-memory record.
    fn n_data_columns(&self) -> usize {
        self.layout().n_data_columns()
    }

    /// Values per on-disk record.
    fn data_event_count(&self) -> usize {
        self.layout().data_event_count()
    }

    /// Runs the migration shim on `block`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown direction or a partial record.
    fn adjust_event_data_block(&self, block: Vec<f64>, direction: &str) -> Result<Vec<f64>> {
        let direction: Direction = direction.parse()?;
        self.layout().adjust_event_data_block(block, direction)
    }

    /// Replaces the free-space map with a persisted extent list.
    ///
    /// # Errors
    ///
    /// Returns an error for empty or overlapping extents.
    fn set_free_space_vector(&mut self, extents: &[(u64, u64)]) -> Result<()> {
        *self.free_space_mut() = FreeSpaceMap::from_extents(extents)?;
        Ok(())
    }

    /// The free-space map as an extent list sorted by position.
    fn free_space_vector(&self) -> Vec<(u64, u64)> {
        self.free_space().extents()
    }
}
