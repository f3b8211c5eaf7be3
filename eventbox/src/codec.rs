//! Record codec for event blocks.
//!
//! Events travel between the tree and the backing file as flat blocks of
//! `f64` values, one fixed-width record per event. In memory a record is
//! always shaped for the newest format; on disk its width depends on the
//! configured [`EventDataVersion`].
//!
//! # Record layout
//!
//! ```text
//! Lean        signal, error², coord[0..n_dims]
//! Original    signal, error², run index, detector id, coord[0..n_dims]
//! Goniometer  signal, error², run index, goniometer index, detector id, coord[0..n_dims]
//! ```
//!
//! Full events are held in memory in the `Goniometer` shape. Files written
//! in the `Original` format lack the goniometer index; the migration shim
//! ([`RecordLayout::adjust_event_data_block`]) inserts a zero on read and
//! drops the column on write.
//!
//! Every value in a record is stored with the container's coordinate
//! precision, little-endian.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FormatError, Result};

/// Index of the goniometer index inside an in-memory full-event record.
const GONIOMETER_FIELD: usize = 3;

/// Non-coordinate fields in an in-memory full-event record.
const FULL_EVENT_FIELDS: usize = 5;

/// Non-coordinate fields in a lean-event record.
const LEAN_EVENT_FIELDS: usize = 2;

/// Precision of every stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoordSize {
    /// 4-byte `f32`.
    Single,
    /// 8-byte `f64`.
    Double,
}

impl CoordSize {
    /// Parses a size in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::InvalidCoordSize`] for anything but 4 or 8.
    pub fn from_bytes(size: usize) -> Result<Self> {
        match size {
            4 => Ok(Self::Single),
            8 => Ok(Self::Double),
            _ => Err(FormatError::InvalidCoordSize { size }.into()),
        }
    }

    /// Size of one stored value in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Self::Single => 4,
            Self::Double => 8,
        }
    }

    #[allow(clippy::cast_possible_truncation)] // narrowing to f32 is the point
    fn write(self, value: f64, out: &mut [u8]) {
        match self {
            Self::Single => out.copy_from_slice(&(value as f32).to_le_bytes()),
            Self::Double => out.copy_from_slice(&value.to_le_bytes()),
        }
    }

    fn read(self, bytes: &[u8]) -> f64 {
        match self {
            Self::Single => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(bytes);
                f64::from(f32::from_le_bytes(raw))
            }
            Self::Double => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                f64::from_le_bytes(raw)
            }
        }
    }
}

/// Which event type a container stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Full events carrying run, goniometer and detector indexes.
    MdEvent,
    /// Lean events: signal, error² and coordinates only.
    MdLeanEvent,
}

impl EventKind {
    /// The canonical name, as written in metadata.
    pub fn name(self) -> &'static str {
        match self {
            Self::MdEvent => "MDEvent",
            Self::MdLeanEvent => "MDLeanEvent",
        }
    }

    /// Version used when none was chosen explicitly.
    pub fn default_version(self) -> EventDataVersion {
        match self {
            Self::MdEvent => EventDataVersion::Goniometer,
            Self::MdLeanEvent => EventDataVersion::Lean,
        }
    }

    /// Non-coordinate fields of an in-memory record.
    pub fn memory_fields(self) -> usize {
        match self {
            Self::MdEvent => FULL_EVENT_FIELDS,
            Self::MdLeanEvent => LEAN_EVENT_FIELDS,
        }
    }

    /// Whether events of this kind can be stored with `version`.
    pub fn accepts(self, version: EventDataVersion) -> bool {
        match self {
            Self::MdEvent => version != EventDataVersion::Lean,
            Self::MdLeanEvent => version == EventDataVersion::Lean,
        }
    }
}

impl FromStr for EventKind {
    type Err = crate::error::EventBoxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MDEvent" => Ok(Self::MdEvent),
            "MDLeanEvent" => Ok(Self::MdLeanEvent),
            _ => Err(FormatError::UnknownEventKind {
                name: s.to_string(),
            }
            .into()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// On-disk record format. The discriminant is the number of non-coordinate
/// fields stored per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum EventDataVersion {
    /// Signal and error² only.
    Lean = 2,
    /// Full events without the goniometer index.
    Original = 4,
    /// Full events with the goniometer index.
    Goniometer = 5,
}

impl EventDataVersion {
    /// Non-coordinate fields stored per event on disk.
    pub fn stored_fields(self) -> usize {
        self as usize
    }

    /// The canonical name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Lean => "Lean",
            Self::Original => "Original",
            Self::Goniometer => "Goniometer",
        }
    }
}

impl TryFrom<u32> for EventDataVersion {
    type Error = crate::error::EventBoxError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            2 => Ok(Self::Lean),
            4 => Ok(Self::Original),
            5 => Ok(Self::Goniometer),
            _ => Err(FormatError::UnknownVersion { value }.into()),
        }
    }
}

impl fmt::Display for EventDataVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Direction of a migration pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Disk shape to memory shape.
    Read,
    /// Memory shape to disk shape.
    Write,
}

impl FromStr for Direction {
    type Err = crate::error::EventBoxError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("READ") {
            Ok(Self::Read)
        } else if s.eq_ignore_ascii_case("WRITE") {
            Ok(Self::Write)
        } else {
            Err(FormatError::UnknownDirection {
                direction: s.to_string(),
            }
            .into())
        }
    }
}

/// Data type configuration of a backend: precision, event kind and an
/// optional explicit format version.
///
/// Setters validate the whole combination before changing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSchema {
    coord_size: CoordSize,
    kind: EventKind,
    version: Option<EventDataVersion>,
}

impl Default for EventSchema {
    fn default() -> Self {
        Self {
            coord_size: CoordSize::Single,
            kind: EventKind::MdEvent,
            version: None,
        }
    }
}

impl EventSchema {
    /// Builds a schema with an explicit version.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::IncompatibleVersion`] if `kind` cannot be
    /// stored with `version`.
    pub fn new(coord_size: CoordSize, kind: EventKind, version: EventDataVersion) -> Result<Self> {
        check_compatible(kind, version)?;
        Ok(Self {
            coord_size,
            kind,
            version: Some(version),
        })
    }

    /// Sets precision and event kind from their external spellings.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`] if the size is not 4 or 8, the kind name is
    /// unknown, or the kind conflicts with an explicitly set version.
    pub fn set_data_type(&mut self, coord_size: usize, kind_name: &str) -> Result<()> {
        let coord_size = CoordSize::from_bytes(coord_size)?;
        let kind: EventKind = kind_name.parse()?;
        if let Some(version) = self.version {
            check_compatible(kind, version)?;
        }
        self.coord_size = coord_size;
        self.kind = kind;
        Ok(())
    }

    /// Pins the on-disk format version.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::IncompatibleVersion`] if the current kind
    /// cannot be stored with `version`.
    pub fn set_event_data_version(&mut self, version: EventDataVersion) -> Result<()> {
        check_compatible(self.kind, version)?;
        self.version = Some(version);
        Ok(())
    }

    /// Coordinate precision.
    pub fn coord_size(&self) -> CoordSize {
        self.coord_size
    }

    /// Event kind.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The effective version: explicit, or the kind's default.
    pub fn version(&self) -> EventDataVersion {
        self.version.unwrap_or_else(|| self.kind.default_version())
    }

    /// Record layout for a given dimensionality.
    pub fn layout(&self, n_dims: usize) -> RecordLayout {
        RecordLayout {
            n_dims,
            coord_size: self.coord_size,
            kind: self.kind,
            version: self.version(),
        }
    }
}

fn check_compatible(kind: EventKind, version: EventDataVersion) -> Result<()> {
    if kind.accepts(version) {
        Ok(())
    } else {
        Err(FormatError::IncompatibleVersion {
            kind: kind.name(),
            version: version.name(),
        }
        .into())
    }
}

/// Fully resolved record widths for one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    n_dims: usize,
    coord_size: CoordSize,
    kind: EventKind,
    version: EventDataVersion,
}

impl RecordLayout {
    /// Dimensionality of the event coordinates.
    pub fn n_dims(&self) -> usize {
        self.n_dims
    }

    /// Stored precision.
    pub fn coord_size(&self) -> CoordSize {
        self.coord_size
    }

    /// Event kind.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// On-disk format version.
    pub fn version(&self) -> EventDataVersion {
        self.version
    }

    /// Values per in-memory record.
    pub fn n_data_columns(&self) -> usize {
        self.n_dims + self.kind.memory_fields()
    }

    /// Values per on-disk record: one fewer than in memory for `Original`.
    pub fn data_event_count(&self) -> usize {
        self.n_dims + self.version.stored_fields()
    }

    /// Bytes per on-disk record.
    pub fn row_bytes(&self) -> usize {
        self.data_event_count() * self.coord_size.bytes()
    }

    /// Number of events in an in-memory block.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::MalformedBlock`] if the block is not a whole
    /// number of records.
    pub fn events_in(&self, block: &[f64]) -> Result<usize> {
        whole_records(block.len(), self.n_data_columns())
    }

    /// Reshapes a block between the disk and memory record shapes.
    ///
    /// Only `Original` containers change anything: `Read` inserts a zero
    /// goniometer index after the third field of every record, `Write`
    /// removes it. Other versions return the block untouched.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::MalformedBlock`] if the block is not a whole
    /// number of input records.
    pub fn adjust_event_data_block(&self, block: Vec<f64>, direction: Direction) -> Result<Vec<f64>> {
        if self.version != EventDataVersion::Original {
            let width = match direction {
                Direction::Read => self.data_event_count(),
                Direction::Write => self.n_data_columns(),
            };
            whole_records(block.len(), width)?;
            return Ok(block);
        }

        match direction {
            Direction::Read => {
                let width = self.data_event_count();
                let events = whole_records(block.len(), width)?;
                let mut adjusted = Vec::with_capacity(events * (width + 1));
                for record in block.chunks_exact(width) {
                    adjusted.extend_from_slice(&record[..GONIOMETER_FIELD]);
                    adjusted.push(0.0);
                    adjusted.extend_from_slice(&record[GONIOMETER_FIELD..]);
                }
                Ok(adjusted)
            }
            Direction::Write => {
                let width = self.n_data_columns();
                let events = whole_records(block.len(), width)?;
                let mut adjusted = Vec::with_capacity(events * (width - 1));
                for record in block.chunks_exact(width) {
                    adjusted.extend_from_slice(&record[..GONIOMETER_FIELD]);
                    adjusted.extend_from_slice(&record[GONIOMETER_FIELD + 1..]);
                }
                Ok(adjusted)
            }
        }
    }

    /// Converts an in-memory block into on-disk bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::MalformedBlock`] for a partial record.
    pub fn encode_block(&self, block: &[f64]) -> Result<Vec<u8>> {
        let stored = self.adjust_event_data_block(block.to_vec(), Direction::Write)?;
        let width = self.coord_size.bytes();
        let mut bytes = vec![0u8; stored.len() * width];
        for (value, out) in stored.iter().zip(bytes.chunks_exact_mut(width)) {
            self.coord_size.write(*value, out);
        }
        Ok(bytes)
    }

    /// Converts on-disk bytes into an in-memory block.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::MalformedBlock`] if the bytes are not a whole
    /// number of on-disk records.
    pub fn decode_block(&self, bytes: &[u8]) -> Result<Vec<f64>> {
        whole_records(bytes.len(), self.row_bytes())?;
        let stored: Vec<f64> = bytes
            .chunks_exact(self.coord_size.bytes())
            .map(|raw| self.coord_size.read(raw))
            .collect();
        self.adjust_event_data_block(stored, Direction::Read)
    }
}

fn whole_records(len: usize, columns: usize) -> Result<usize> {
    if columns == 0 || len % columns != 0 {
        return Err(FormatError::MalformedBlock { len, columns }.into());
    }
    Ok(len / columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn original_layout(n_dims: usize) -> RecordLayout {
        EventSchema::new(CoordSize::Double, EventKind::MdEvent, EventDataVersion::Original)
            .unwrap()
            .layout(n_dims)
    }

    #[test]
    fn test_coord_size() {
        assert_eq!(CoordSize::from_bytes(4).unwrap(), CoordSize::Single);
        assert_eq!(CoordSize::from_bytes(8).unwrap(), CoordSize::Double);
        let err = CoordSize::from_bytes(2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!("MDEvent".parse::<EventKind>().unwrap(), EventKind::MdEvent);
        assert_eq!("MDLeanEvent".parse::<EventKind>().unwrap(), EventKind::MdLeanEvent);
        assert!("mdevent".parse::<EventKind>().is_err());
        assert_eq!(EventKind::MdLeanEvent.to_string(), "MDLeanEvent");
    }

    #[test]
    fn test_version_numbers() {
        assert_eq!(EventDataVersion::try_from(2).unwrap(), EventDataVersion::Lean);
        assert_eq!(EventDataVersion::try_from(4).unwrap(), EventDataVersion::Original);
        assert_eq!(EventDataVersion::try_from(5).unwrap(), EventDataVersion::Goniometer);
        assert!(EventDataVersion::try_from(3).is_err());
    }

    #[test]
    fn test_schema_compatibility() {
        let mut schema = EventSchema::default();
        schema.set_event_data_version(EventDataVersion::Original).unwrap();

        let err = schema.set_data_type(4, "MDLeanEvent").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        // Nothing changed on failure.
        assert_eq!(schema.kind(), EventKind::MdEvent);
        assert_eq!(schema.coord_size(), CoordSize::Single);

        schema.set_data_type(8, "MDEvent").unwrap();
        assert_eq!(schema.version(), EventDataVersion::Original);
        assert!(schema.set_event_data_version(EventDataVersion::Lean).is_err());

        let mut lean = EventSchema::default();
        lean.set_data_type(4, "MDLeanEvent").unwrap();
        assert_eq!(lean.version(), EventDataVersion::Lean);
        assert!(lean.set_event_data_version(EventDataVersion::Goniometer).is_err());
        assert!(lean.set_data_type(16, "MDLeanEvent").is_err());
    }

    #[test]
    fn test_column_counts() {
        let layout = original_layout(3);
        assert_eq!(layout.n_data_columns(), 8);
        assert_eq!(layout.data_event_count(), 7);
        assert_eq!(layout.row_bytes(), 56);

        let gonio = EventSchema::new(CoordSize::Single, EventKind::MdEvent, EventDataVersion::Goniometer)
            .unwrap()
            .layout(3);
        assert_eq!(gonio.n_data_columns(), 8);
        assert_eq!(gonio.data_event_count(), 8);

        let lean = EventSchema::new(CoordSize::Single, EventKind::MdLeanEvent, EventDataVersion::Lean)
            .unwrap()
            .layout(2);
        assert_eq!(lean.n_data_columns(), 4);
        assert_eq!(lean.data_event_count(), 4);
        assert_eq!(lean.row_bytes(), 16);
    }

    #[test]
    fn test_adjust_read_inserts_goniometer_index() {
        let layout = original_layout(2);
        // Two records of: signal, error², run, detector, x, y
        let disk = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 11.0, 12.0, 13.0, 14.0, 15.0, 16.0];
        let memory = layout.adjust_event_data_block(disk, Direction::Read).unwrap();
        assert_eq!(
            memory,
            vec![1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 11.0, 12.0, 13.0, 0.0, 14.0, 15.0, 16.0]
        );
    }

    #[test]
    fn test_adjust_read_then_write_is_identity() {
        let layout = original_layout(3);
        let disk: Vec<f64> = (0..70).map(f64::from).collect();
        let memory = layout
            .adjust_event_data_block(disk.clone(), Direction::Read)
            .unwrap();
        assert_eq!(memory.len(), 80);
        let back = layout.adjust_event_data_block(memory, Direction::Write).unwrap();
        assert_eq!(back, disk);
    }

    #[test]
    fn test_adjust_is_noop_for_goniometer() {
        let layout = EventSchema::new(CoordSize::Double, EventKind::MdEvent, EventDataVersion::Goniometer)
            .unwrap()
            .layout(1);
        let block = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(
            layout.adjust_event_data_block(block.clone(), Direction::Read).unwrap(),
            block
        );
        assert_eq!(
            layout.adjust_event_data_block(block.clone(), Direction::Write).unwrap(),
            block
        );
    }

    #[test]
    fn test_adjust_rejects_partial_records() {
        let layout = original_layout(2);
        let err = layout
            .adjust_event_data_block(vec![1.0; 7], Direction::Read)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(layout.adjust_event_data_block(vec![1.0; 6], Direction::Write).is_err());
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("READ".parse::<Direction>().unwrap(), Direction::Read);
        assert_eq!("write".parse::<Direction>().unwrap(), Direction::Write);
        assert!("SIDEWAYS".parse::<Direction>().is_err());
    }

    #[test]
    fn test_encode_decode_single_precision_narrows() {
        let layout = EventSchema::new(CoordSize::Single, EventKind::MdLeanEvent, EventDataVersion::Lean)
            .unwrap()
            .layout(2);
        let block = vec![1.0, 0.5, 0.1, 1.0e-9];
        let bytes = layout.encode_block(&block).unwrap();
        assert_eq!(bytes.len(), 16);
        let decoded = layout.decode_block(&bytes).unwrap();
        assert_eq!(decoded[0], 1.0);
        assert_eq!(decoded[1], 0.5);
        // 0.1 is not representable exactly in f32.
        assert_ne!(decoded[2], 0.1);
        assert!((decoded[2] - 0.1).abs() < 1e-7);
    }

    #[test]
    fn test_encode_original_drops_column() {
        let layout = original_layout(1);
        let memory = vec![1.0, 2.0, 3.0, 9.0, 4.0, 5.0];
        let bytes = layout.encode_block(&memory).unwrap();
        assert_eq!(bytes.len(), 5 * 8);
        let decoded = layout.decode_block(&bytes).unwrap();
        // The goniometer index is not persisted in this format.
        assert_eq!(decoded, vec![1.0, 2.0, 3.0, 0.0, 4.0, 5.0]);
    }
}
