//! In-memory I/O backend.
//!
//! Behaves like a container file without touching the filesystem: the
//! "file" is a byte image held by the backend that survives close/reopen
//! under the same name. Values are still narrowed to the configured
//! precision and migrated between record shapes, so code exercised against
//! this backend sees the same numbers it would see from disk.
//!
//! The backend counts block reads and writes and can be told to fail
//! writes. Both live behind an [`IoControl`] handle that stays usable after
//! the backend has been boxed into a disk buffer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::trace;

use crate::codec::EventSchema;
use crate::error::{FileIoError, Result};
use crate::free_space::FreeSpaceMap;
use crate::io::{BoxControllerIo, OpenMode};

/// The persisted state of one in-memory "file".
#[derive(Debug, Clone)]
struct MemoryImage {
    name: PathBuf,
    schema: EventSchema,
    bytes: Vec<u8>,
    free_space: Vec<(u64, u64)>,
}

/// Block traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCounters {
    /// Number of `save_block` calls that succeeded.
    pub blocks_written: u64,
    /// Number of `load_block` calls that succeeded.
    pub blocks_read: u64,
    /// Events written across all blocks.
    pub events_written: u64,
    /// Events read across all blocks.
    pub events_read: u64,
}

#[derive(Debug, Default)]
struct ControlState {
    fail_writes: AtomicBool,
    blocks_written: AtomicU64,
    blocks_read: AtomicU64,
    events_written: AtomicU64,
    events_read: AtomicU64,
}

/// Shared handle to a [`MemoryBoxIo`]'s counters and fault injection.
///
/// Clones observe and steer the same backend.
#[derive(Debug, Clone, Default)]
pub struct IoControl {
    state: Arc<ControlState>,
}

impl IoControl {
    /// Block traffic so far.
    pub fn counters(&self) -> IoCounters {
        IoCounters {
            blocks_written: self.state.blocks_written.load(Ordering::Relaxed),
            blocks_read: self.state.blocks_read.load(Ordering::Relaxed),
            events_written: self.state.events_written.load(Ordering::Relaxed),
            events_read: self.state.events_read.load(Ordering::Relaxed),
        }
    }

    /// Makes every subsequent `save_block` fail with a write error until
    /// switched off again. Simulates a device error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn fail_writes(&self) -> bool {
        self.state.fail_writes.load(Ordering::Relaxed)
    }

    fn record_write(&self, n_events: u64) {
        self.state.blocks_written.fetch_add(1, Ordering::Relaxed);
        self.state.events_written.fetch_add(n_events, Ordering::Relaxed);
    }

    fn record_read(&self, n_events: u64) {
        self.state.blocks_read.fetch_add(1, Ordering::Relaxed);
        self.state.events_read.fetch_add(n_events, Ordering::Relaxed);
    }
}

/// Backend that keeps its container image in memory.
#[derive(Debug)]
pub struct MemoryBoxIo {
    n_dims: usize,
    schema: EventSchema,
    free_space: FreeSpaceMap,
    image: Option<MemoryImage>,
    mode: Option<OpenMode>,
    control: IoControl,
}

impl MemoryBoxIo {
    /// Creates a closed backend for `n_dims`-dimensional events.
    pub fn new(n_dims: usize) -> Self {
        Self {
            n_dims,
            schema: EventSchema::default(),
            free_space: FreeSpaceMap::new(),
            image: None,
            mode: None,
            control: IoControl::default(),
        }
    }

    /// Creates a backend with the given data type already configured.
    pub fn with_schema(n_dims: usize, schema: EventSchema) -> Self {
        Self {
            schema,
            ..Self::new(n_dims)
        }
    }

    /// A handle to this backend's counters and fault injection.
    pub fn control(&self) -> IoControl {
        self.control.clone()
    }

    /// Block traffic so far.
    pub fn counters(&self) -> IoCounters {
        self.control.counters()
    }

    /// See [`IoControl::set_fail_writes`].
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.control.set_fail_writes(fail);
    }

    fn image_path(&self) -> PathBuf {
        self.image
            .as_ref()
            .map(|image| image.name.clone())
            .unwrap_or_default()
    }

    fn open_image(&mut self) -> Result<&mut MemoryImage> {
        if self.mode.is_none() {
            return Err(FileIoError::NotOpen.into());
        }
        self.image.as_mut().ok_or_else(|| FileIoError::NotOpen.into())
    }
}

impl BoxControllerIo for MemoryBoxIo {
    fn n_dims(&self) -> usize {
        self.n_dims
    }

    fn open_file(&mut self, path: &Path, mode: &str) -> Result<()> {
        let mode: OpenMode = mode.parse()?;
        self.close_file()?;

        let existing = self
            .image
            .as_ref()
            .filter(|image| image.name == path)
            .map(|image| (image.schema, image.free_space.clone()));
        match (mode, existing) {
            (OpenMode::Read | OpenMode::ReadWrite, Some((schema, extents))) => {
                self.free_space = FreeSpaceMap::from_extents(&extents)?;
                self.schema = schema;
            }
            (OpenMode::Read, None) => {
                return Err(FileIoError::NotFound {
                    path: path.to_path_buf(),
                }
                .into());
            }
            (OpenMode::Write | OpenMode::ReadWrite, _) => {
                self.free_space.clear();
                self.image = Some(MemoryImage {
                    name: path.to_path_buf(),
                    schema: self.schema,
                    bytes: Vec::new(),
                    free_space: Vec::new(),
                });
            }
        }

        self.mode = Some(mode);
        trace!(path = %path.display(), %mode, "opened in-memory container");
        Ok(())
    }

    fn is_opened(&self) -> bool {
        self.mode.is_some()
    }

    fn file_name(&self) -> Option<&Path> {
        self.mode?;
        self.image.as_ref().map(|image| image.name.as_path())
    }

    fn open_mode(&self) -> Option<OpenMode> {
        self.mode
    }

    fn flush_data(&mut self) -> Result<()> {
        let extents = self.free_space.extents();
        if self.mode.is_some_and(OpenMode::is_writable) {
            self.open_image()?.free_space = extents;
        }
        Ok(())
    }

    fn close_file(&mut self) -> Result<()> {
        if self.mode.is_some() {
            self.flush_data()?;
            self.mode = None;
        }
        Ok(())
    }

    fn schema(&self) -> &EventSchema {
        &self.schema
    }

    fn replace_schema(&mut self, schema: EventSchema) -> Result<()> {
        let stored = self.file_length();
        if self.mode.is_some() && stored > 0 && schema != self.schema {
            return Err(FileIoError::DataTypeLocked {
                path: self.image_path(),
                events: stored,
            }
            .into());
        }
        self.schema = schema;
        if self.mode.is_some()
            && let Some(image) = self.image.as_mut()
        {
            image.schema = schema;
        }
        Ok(())
    }

    fn save_block(&mut self, data: &[f64], position: u64) -> Result<()> {
        let layout = self.layout();
        if !self.mode.is_some_and(OpenMode::is_writable) {
            return Err(match self.mode {
                Some(_) => FileIoError::ReadOnly {
                    path: self.image_path(),
                },
                None => FileIoError::NotOpen,
            }
            .into());
        }
        if self.control.fail_writes() {
            return Err(FileIoError::WriteFailed {
                path: self.image_path(),
                position,
                source: std::io::Error::other("simulated write failure"),
            }
            .into());
        }

        let encoded = layout.encode_block(data)?;
        let n_events = layout.events_in(data)?;
        let start = usize::try_from(position).unwrap_or(usize::MAX) * layout.row_bytes();
        let end = start + encoded.len();

        let image = self.open_image()?;
        if image.bytes.len() < end {
            image.bytes.resize(end, 0);
        }
        image.bytes[start..end].copy_from_slice(&encoded);

        self.control.record_write(n_events as u64);
        Ok(())
    }

    fn load_block(&mut self, data: &mut Vec<f64>, position: u64, n_events: usize) -> Result<()> {
        let layout = self.layout();
        let length = self.file_length();
        let end = position + n_events as u64;
        if end > length {
            return Err(FileIoError::BeyondEnd {
                position,
                end,
                length,
            }
            .into());
        }

        let row = layout.row_bytes();
        let start = usize::try_from(position).unwrap_or(usize::MAX) * row;
        let image = self.open_image()?;
        *data = layout.decode_block(&image.bytes[start..start + n_events * row])?;

        self.control.record_read(n_events as u64);
        Ok(())
    }

    fn file_length(&self) -> u64 {
        let row = self.layout().row_bytes();
        match (&self.image, self.mode) {
            (Some(image), Some(_)) => (image.bytes.len() / row) as u64,
            _ => 0,
        }
    }

    fn free_space(&self) -> &FreeSpaceMap {
        &self.free_space
    }

    fn free_space_mut(&mut self) -> &mut FreeSpaceMap {
        &mut self.free_space
    }

    fn copy_file_to(&mut self, _dest: &Path) -> Result<()> {
        Err(FileIoError::Unsupported {
            operation: "copying an in-memory container",
        }
        .into())
    }
}
