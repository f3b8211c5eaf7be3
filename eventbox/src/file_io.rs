//! Memory-mapped container file backend.
//!
//! A container holds one dataset of fixed-width event records, the
//! free-space extent list and the scalar metadata describing the records.
//!
//! # File Format
//!
//! ```text
//! [0..64)                 Header (ContainerHeader)
//! [64..64+C*R)            Data region: C = capacity in events, R = bytes per record
//! [64+C*R..+F*16)         Free-space trailer: F extents of (position u64, length u64)
//! ```
//!
//! The data region grows geometrically as blocks are written past its end.
//! The header and trailer are rewritten by [`flush_data`] and
//! [`close_file`]; until then the header's counters on disk may be stale.
//!
//! # Safety
//!
//! The header is read and written through raw pointers into the mapping.
//! The mapping always starts at a page boundary and is checked to be at
//! least [`HEADER_SIZE`] bytes long before any header access.
//!
//! [`flush_data`]: BoxControllerIo::flush_data
//! [`close_file`]: BoxControllerIo::close_file

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;

use memmap2::{Mmap, MmapMut};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::codec::{CoordSize, EventDataVersion, EventKind, EventSchema};
use crate::error::{FileIoError, Result};
use crate::free_space::FreeSpaceMap;
use crate::io::{BoxControllerIo, OpenMode};

/// Magic bytes identifying an eventbox container.
const CONTAINER_MAGIC: [u8; 4] = *b"EVBX";

/// Current container format version.
const CONTAINER_VERSION: u32 = 1;

/// Size of the container header in bytes.
const HEADER_SIZE: usize = 64;

/// Size of one persisted free-space extent in bytes.
const EXTENT_SIZE: usize = 16;

/// Smallest data region, in events, allocated on first growth.
const MIN_CAPACITY: u64 = 1024;

/// Header at the start of every container.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ContainerHeader {
    /// Magic bytes for file type identification.
    magic: [u8; 4],
    /// Container format version.
    version: u32,
    /// Bytes per stored value (4 or 8).
    coord_size: u32,
    /// 0 = MDEvent, 1 = MDLeanEvent.
    event_kind: u32,
    /// Event data version (2, 4 or 5).
    event_data_version: u32,
    /// Dimensionality of the coordinates.
    n_dims: u32,
    /// Logical file length in events.
    event_count: u64,
    /// Events the data region can hold.
    capacity: u64,
    /// Number of extents in the free-space trailer.
    free_space_count: u64,
    /// Reserved space (padding to 64 bytes).
    _reserved: [u8; 16],
}

impl ContainerHeader {
    #[allow(clippy::cast_possible_truncation)] // dimensionality and field sizes are tiny
    fn new(n_dims: usize, schema: &EventSchema) -> Self {
        Self {
            magic: CONTAINER_MAGIC,
            version: CONTAINER_VERSION,
            coord_size: schema.coord_size().bytes() as u32,
            event_kind: match schema.kind() {
                EventKind::MdEvent => 0,
                EventKind::MdLeanEvent => 1,
            },
            event_data_version: schema.version() as u32,
            n_dims: n_dims as u32,
            event_count: 0,
            capacity: 0,
            free_space_count: 0,
            _reserved: [0; 16],
        }
    }

    /// Validates magic and version and decodes the stored data type.
    fn validate(&self, path: &Path) -> Result<EventSchema> {
        let corrupted = |reason: String| FileIoError::Corrupted {
            path: path.to_path_buf(),
            reason,
        };

        if self.magic != CONTAINER_MAGIC {
            return Err(corrupted(format!(
                "invalid magic bytes: expected {:?}, found {:?}",
                CONTAINER_MAGIC, self.magic
            ))
            .into());
        }
        if self.version != CONTAINER_VERSION {
            return Err(corrupted(format!(
                "unsupported version: expected {}, found {}",
                CONTAINER_VERSION, self.version
            ))
            .into());
        }
        if self.n_dims == 0 {
            return Err(corrupted("header records zero dimensions".to_string()).into());
        }

        let kind = match self.event_kind {
            0 => EventKind::MdEvent,
            1 => EventKind::MdLeanEvent,
            other => return Err(corrupted(format!("unknown event kind tag {other}")).into()),
        };
        let coord_size = CoordSize::from_bytes(self.coord_size as usize)
            .map_err(|e| corrupted(e.to_string()))?;
        let version = EventDataVersion::try_from(self.event_data_version)
            .map_err(|e| corrupted(e.to_string()))?;
        EventSchema::new(coord_size, kind, version).map_err(|e| corrupted(e.to_string()).into())
    }
}

/// Mapping of an open container.
#[derive(Debug)]
enum Mapping {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::ReadOnly(map) => &map[..],
            Self::Writable(map) => &map[..],
        }
    }
}

/// State of an open container.
#[derive(Debug)]
struct OpenContainer {
    path: PathBuf,
    mode: OpenMode,
    file: File,
    map: Mapping,
    header: ContainerHeader,
}

impl OpenContainer {
    fn read_header(map: &Mapping, path: &Path) -> Result<ContainerHeader> {
        let bytes = map.bytes();
        if bytes.len() < HEADER_SIZE {
            return Err(FileIoError::Corrupted {
                path: path.to_path_buf(),
                reason: format!(
                    "file too small: {} bytes, expected at least {}",
                    bytes.len(),
                    HEADER_SIZE
                ),
            }
            .into());
        }
        // SAFETY: The mapping is at least HEADER_SIZE bytes and starts at a
        // page boundary, so it is aligned for ContainerHeader. Every bit
        // pattern is a valid ContainerHeader.
        Ok(unsafe { ptr::read(bytes.as_ptr() as *const ContainerHeader) })
    }

    fn writable_map(&mut self) -> Result<&mut MmapMut> {
        match &mut self.map {
            Mapping::Writable(map) => Ok(map),
            Mapping::ReadOnly(_) => Err(FileIoError::ReadOnly {
                path: self.path.clone(),
            }
            .into()),
        }
    }

    /// Resizes the file and remaps it.
    fn resize(&mut self, len: usize) -> Result<()> {
        self.file
            .set_len(len as u64)
            .map_err(|e| FileIoError::WriteFailed {
                path: self.path.clone(),
                position: self.header.event_count,
                source: e,
            })?;
        // SAFETY: The file is open read/write and owned by this container;
        // the previous mapping is replaced before anyone can observe it at
        // the old length.
        let map = unsafe {
            MmapMut::map_mut(&self.file).map_err(|e| FileIoError::WriteFailed {
                path: self.path.clone(),
                position: self.header.event_count,
                source: e,
            })?
        };
        self.map = Mapping::Writable(map);
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let header = self.header;
        let map = self.writable_map()?;
        // SAFETY: Writable mappings are created with at least HEADER_SIZE
        // bytes and start at a page boundary.
        unsafe {
            ptr::write(map.as_mut_ptr() as *mut ContainerHeader, header);
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        match &self.map {
            Mapping::Writable(map) => map.flush().map_err(|e| {
                FileIoError::SyncFailed {
                    path: self.path.clone(),
                    source: e,
                }
                .into()
            }),
            Mapping::ReadOnly(_) => Ok(()),
        }
    }
}

/// Summary of a container, read without knowing its dimensionality.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerInfo {
    /// Dimensionality of the stored events.
    pub n_dims: usize,
    /// Stored data type.
    pub schema: EventSchema,
    /// Logical length in events.
    pub event_count: u64,
    /// Events the data region can hold without growing.
    pub capacity: u64,
    /// Persisted free-space extents.
    pub free_space: Vec<(u64, u64)>,
    /// File size in bytes.
    pub file_size: u64,
}

/// Production backend storing events in a memory-mapped container file.
///
/// # Thread Safety
///
/// A backend is owned by a single box controller; it is `Send` but performs
/// no internal locking.
#[derive(Debug)]
pub struct FileBoxIo {
    n_dims: usize,
    schema: EventSchema,
    free_space: FreeSpaceMap,
    open: Option<OpenContainer>,
}

impl FileBoxIo {
    /// Creates a closed backend for `n_dims`-dimensional events.
    pub fn new(n_dims: usize) -> Self {
        Self {
            n_dims,
            schema: EventSchema::default(),
            free_space: FreeSpaceMap::new(),
            open: None,
        }
    }

    /// Creates a backend with the given data type already configured.
    pub fn with_schema(n_dims: usize, schema: EventSchema) -> Self {
        let mut io = Self::new(n_dims);
        io.schema = schema;
        io
    }

    /// Reads a container's header and free-space list.
    ///
    /// # Errors
    ///
    /// Returns [`FileIoError`] if the file is missing or not a container.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use eventbox::file_io::FileBoxIo;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let info = FileBoxIo::inspect("events.evbx")?;
    /// println!("{} events in {} dimensions", info.event_count, info.n_dims);
    /// # Ok(())
    /// # }
    /// ```
    pub fn inspect<P: AsRef<Path>>(path: P) -> Result<ContainerInfo> {
        let path = path.as_ref();
        let (file, map) = map_read_only(path)?;
        let header = OpenContainer::read_header(&map, path)?;
        let schema = header.validate(path)?;
        let layout = schema.layout(header.n_dims as usize);
        let free_space = read_trailer(&map, &header, layout.row_bytes(), path)?;
        let file_size = file
            .metadata()
            .map_err(|e| FileIoError::OpenFailed {
                path: path.to_path_buf(),
                source: e,
            })?
            .len();

        Ok(ContainerInfo {
            n_dims: header.n_dims as usize,
            schema,
            event_count: header.event_count,
            capacity: header.capacity,
            free_space,
            file_size,
        })
    }

    fn open_existing(&mut self, path: &Path, mode: OpenMode) -> Result<OpenContainer> {
        let (file, map) = match mode {
            OpenMode::Read => map_read_only(path)?,
            OpenMode::Write | OpenMode::ReadWrite => map_read_write(path)?,
        };
        let header = OpenContainer::read_header(&map, path)?;
        let schema = header.validate(path)?;

        if header.n_dims as usize != self.n_dims {
            return Err(FileIoError::Corrupted {
                path: path.to_path_buf(),
                reason: format!(
                    "container has {} dimensions, backend expects {}",
                    header.n_dims, self.n_dims
                ),
            }
            .into());
        }

        let row = schema.layout(self.n_dims).row_bytes();
        let extents = read_trailer(&map, &header, row, path)?;
        let free_space = FreeSpaceMap::from_extents(&extents).map_err(|e| FileIoError::Corrupted {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        if schema != self.schema {
            debug!(path = %path.display(), kind = %schema.kind(), version = %schema.version(),
                "adopting data type stored in container");
        }
        self.schema = schema;
        self.free_space = free_space;

        Ok(OpenContainer {
            path: path.to_path_buf(),
            mode,
            file,
            map,
            header,
        })
    }

    fn create(&mut self, path: &Path, mode: OpenMode) -> Result<OpenContainer> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| FileIoError::OpenFailed {
                path: path.to_path_buf(),
                source: e,
            })?;

        file.set_len(HEADER_SIZE as u64)
            .map_err(|e| FileIoError::WriteFailed {
                path: path.to_path_buf(),
                position: 0,
                source: e,
            })?;

        // SAFETY: The file was just created with the correct size and we hold
        // the only handle to it.
        let map = unsafe {
            MmapMut::map_mut(&file).map_err(|e| FileIoError::OpenFailed {
                path: path.to_path_buf(),
                source: e,
            })?
        };

        self.free_space.clear();
        let mut container = OpenContainer {
            path: path.to_path_buf(),
            mode,
            file,
            map: Mapping::Writable(map),
            header: ContainerHeader::new(self.n_dims, &self.schema),
        };
        container.write_header()?;
        Ok(container)
    }

    fn writable(&mut self) -> Result<&mut OpenContainer> {
        match &self.open {
            Some(container) if !container.mode.is_writable() => {
                return Err(FileIoError::ReadOnly {
                    path: container.path.clone(),
                }
                .into());
            }
            Some(_) => {}
            None => return Err(FileIoError::NotOpen.into()),
        }
        self.open.as_mut().ok_or_else(|| FileIoError::NotOpen.into())
    }
}

impl BoxControllerIo for FileBoxIo {
    fn n_dims(&self) -> usize {
        self.n_dims
    }

    fn open_file(&mut self, path: &Path, mode: &str) -> Result<()> {
        let mode: OpenMode = mode.parse()?;
        self.close_file()?;

        let exists = path.exists();
        let container = match mode {
            OpenMode::Read if !exists => {
                return Err(FileIoError::NotFound {
                    path: path.to_path_buf(),
                }
                .into());
            }
            OpenMode::Read | OpenMode::ReadWrite if exists => self.open_existing(path, mode)?,
            _ => self.create(path, mode)?,
        };

        debug!(
            path = %path.display(),
            %mode,
            events = container.header.event_count,
            free_extents = self.free_space.len(),
            "opened container"
        );
        self.open = Some(container);
        Ok(())
    }

    fn is_opened(&self) -> bool {
        self.open.is_some()
    }

    fn file_name(&self) -> Option<&Path> {
        self.open.as_ref().map(|container| container.path.as_path())
    }

    fn open_mode(&self) -> Option<OpenMode> {
        self.open.as_ref().map(|container| container.mode)
    }

    #[allow(clippy::cast_possible_truncation)] // in-memory sizes fit in usize
    fn flush_data(&mut self) -> Result<()> {
        let Some(container) = self.open.as_mut() else {
            return Ok(());
        };
        if !container.mode.is_writable() {
            return Ok(());
        }

        let layout = self.schema.layout(self.n_dims);
        let extents = self.free_space.extents();
        let trailer_offset = HEADER_SIZE + container.header.capacity as usize * layout.row_bytes();
        let file_len = trailer_offset + extents.len() * EXTENT_SIZE;

        if container.map.bytes().len() != file_len {
            container.resize(file_len)?;
        }

        let map = container.writable_map()?;
        for (slot, (position, length)) in map[trailer_offset..]
            .chunks_exact_mut(EXTENT_SIZE)
            .zip(&extents)
        {
            slot[..8].copy_from_slice(&position.to_le_bytes());
            slot[8..].copy_from_slice(&length.to_le_bytes());
        }

        let fresh = ContainerHeader::new(self.n_dims, &self.schema);
        container.header = ContainerHeader {
            event_count: container.header.event_count,
            capacity: container.header.capacity,
            free_space_count: extents.len() as u64,
            ..fresh
        };
        container.write_header()?;
        container.sync()?;
        trace!(path = %container.path.display(), extents = extents.len(), "flushed container");
        Ok(())
    }

    fn close_file(&mut self) -> Result<()> {
        if self.open.is_none() {
            return Ok(());
        }
        self.flush_data()?;
        if let Some(container) = self.open.take() {
            debug!(
                path = %container.path.display(),
                events = container.header.event_count,
                "closed container"
            );
        }
        Ok(())
    }

    fn schema(&self) -> &EventSchema {
        &self.schema
    }

    fn replace_schema(&mut self, schema: EventSchema) -> Result<()> {
        if let Some(container) = &self.open
            && container.header.event_count > 0
            && schema != self.schema
        {
            return Err(FileIoError::DataTypeLocked {
                path: container.path.clone(),
                events: container.header.event_count,
            }
            .into());
        }
        self.schema = schema;
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)] // positions are bounded by the mapped size
    fn save_block(&mut self, data: &[f64], position: u64) -> Result<()> {
        let layout = self.schema.layout(self.n_dims);
        let encoded = layout.encode_block(data)?;
        let n_events = layout.events_in(data)? as u64;
        let row = layout.row_bytes();
        let end = position + n_events;

        let container = self.writable()?;
        if end > container.header.capacity {
            let capacity = end
                .max(container.header.capacity.saturating_mul(2))
                .max(MIN_CAPACITY);
            // The trailer is rewritten on flush; drop it while growing.
            container.resize(HEADER_SIZE + capacity as usize * row)?;
            container.header.capacity = capacity;
        }

        let offset = HEADER_SIZE + position as usize * row;
        let map = container.writable_map()?;
        map[offset..offset + encoded.len()].copy_from_slice(&encoded);
        container.header.event_count = container.header.event_count.max(end);

        trace!(position, events = n_events, "saved block");
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)] // positions are bounded by the mapped size
    fn load_block(&mut self, data: &mut Vec<f64>, position: u64, n_events: usize) -> Result<()> {
        let layout = self.schema.layout(self.n_dims);
        let container = self.open.as_ref().ok_or(FileIoError::NotOpen)?;

        let end = position + n_events as u64;
        let length = container.header.event_count;
        if end > length {
            return Err(FileIoError::BeyondEnd {
                position,
                end,
                length,
            }
            .into());
        }

        let row = layout.row_bytes();
        let offset = HEADER_SIZE + position as usize * row;
        *data = layout.decode_block(&container.map.bytes()[offset..offset + n_events * row])?;

        trace!(position, events = n_events, "loaded block");
        Ok(())
    }

    fn file_length(&self) -> u64 {
        self.open
            .as_ref()
            .map_or(0, |container| container.header.event_count)
    }

    fn free_space(&self) -> &FreeSpaceMap {
        &self.free_space
    }

    fn free_space_mut(&mut self) -> &mut FreeSpaceMap {
        &mut self.free_space
    }

    fn copy_file_to(&mut self, dest: &Path) -> Result<()> {
        self.flush_data()?;
        let container = self.open.as_ref().ok_or(FileIoError::NotOpen)?;
        std::fs::copy(&container.path, dest).map_err(|e| FileIoError::CopyFailed {
            from: container.path.clone(),
            to: dest.to_path_buf(),
            source: e,
        })?;
        debug!(from = %container.path.display(), to = %dest.display(), "copied container");
        Ok(())
    }
}

impl Drop for FileBoxIo {
    fn drop(&mut self) {
        if let Err(e) = self.close_file() {
            warn!("failed to close container on drop: {e}");
        }
    }
}

fn map_read_only(path: &Path) -> Result<(File, Mapping)> {
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| open_error(path, e))?;
    // SAFETY: The file is opened read-only; the backend that opened it is the
    // only writer this process allows.
    let map = unsafe {
        Mmap::map(&file).map_err(|e| FileIoError::OpenFailed {
            path: path.to_path_buf(),
            source: e,
        })?
    };
    Ok((file, Mapping::ReadOnly(map)))
}

fn map_read_write(path: &Path) -> Result<(File, Mapping)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| open_error(path, e))?;
    // SAFETY: The file was opened read/write; the owning controller holds the
    // only handle used for writing.
    let map = unsafe {
        MmapMut::map_mut(&file).map_err(|e| FileIoError::OpenFailed {
            path: path.to_path_buf(),
            source: e,
        })?
    };
    Ok((file, Mapping::Writable(map)))
}

fn open_error(path: &Path, source: std::io::Error) -> FileIoError {
    if source.kind() == std::io::ErrorKind::NotFound {
        FileIoError::NotFound {
            path: path.to_path_buf(),
        }
    } else {
        FileIoError::OpenFailed {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[allow(clippy::cast_possible_truncation)] // bounded by the mapped size, checked below
fn read_trailer(map: &Mapping, header: &ContainerHeader, row: usize, path: &Path) -> Result<Vec<(u64, u64)>> {
    let bytes = map.bytes();
    let trailer_offset = (header.capacity as usize)
        .checked_mul(row)
        .and_then(|data| data.checked_add(HEADER_SIZE));
    let trailer_end = trailer_offset.and_then(|offset| {
        (header.free_space_count as usize)
            .checked_mul(EXTENT_SIZE)
            .and_then(|len| offset.checked_add(len))
    });

    let (Some(offset), Some(end)) = (trailer_offset, trailer_end) else {
        return Err(FileIoError::Corrupted {
            path: path.to_path_buf(),
            reason: "header sizes overflow".to_string(),
        }
        .into());
    };
    if header.event_count > header.capacity || end > bytes.len() {
        return Err(FileIoError::Corrupted {
            path: path.to_path_buf(),
            reason: format!(
                "file size mismatch: {} bytes, header needs {}",
                bytes.len(),
                end
            ),
        }
        .into());
    }

    Ok(bytes[offset..end]
        .chunks_exact(EXTENT_SIZE)
        .map(|slot| {
            let mut position = [0u8; 8];
            let mut length = [0u8; 8];
            position.copy_from_slice(&slot[..8]);
            length.copy_from_slice(&slot[8..]);
            (u64::from_le_bytes(position), u64::from_le_bytes(length))
        })
        .collect())
}
