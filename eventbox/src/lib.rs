//! # eventbox
//!
//! Out-of-core, adaptive multidimensional event storage.
//!
//! eventbox organises datasets with far more events than fit in memory into
//! a spatial tree whose leaves page their events to and from a single
//! backing container file. A [`BoxController`] holds the split policy and
//! population counters for one dataset; when file backed it owns a
//! [`DiskBuffer`] (a bounded write-back cache) over an I/O backend.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Per-dimension fan-out with an optional top-level override
//! - Bounded write-back cache, least-recently-touched eviction
//! - Memory-mapped block container with persistent free-space reuse
//! - Versioned record format, migrated on read and write
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use eventbox::{BoxController, BoxNode, Extent, FileBoxIo, MdEvent};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut controller = BoxController::new(3)?;
//! controller.set_split_into(4)?;
//! controller.set_split_threshold(1000);
//!
//! // Page leaf events to a container file.
//! controller.set_file_backed(Box::new(FileBoxIo::new(3)), "events.evbx")?;
//!
//! let mut root = BoxNode::new_root(&mut controller, vec![Extent::new(-10.0, 10.0); 3])?;
//! root.add_event(MdEvent::lean(1.0, 1.0, vec![0.5, -2.0, 3.25]), &mut controller)?;
//!
//! // Push everything out, then close the file.
//! root.evict(&mut controller)?;
//! controller.clear_file_backed()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`controller`]: Split policy, ids, counters, XML/JSON settings
//! - [`tree`]: Leaf and grid boxes
//! - [`disk_buffer`]: Write-back cache keyed by box id
//! - [`io`]: Backend trait and open modes
//! - [`file_io`]: Memory-mapped container backend
//! - [`memory_io`]: In-memory backend
//! - [`codec`]: Record layouts, data types and version migration
//! - [`free_space`]: Extent allocator
//! - [`error`]: Error types

pub mod codec;
pub mod controller;
pub mod disk_buffer;
pub mod error;
pub mod file_io;
pub mod free_space;
pub mod io;
pub mod memory_io;
pub mod tree;

// Re-export primary API types at crate root for convenience.
pub use codec::{CoordSize, EventDataVersion, EventKind, EventSchema};
pub use controller::{BoxController, BoxControllerSettings};
pub use disk_buffer::{BlockLocation, DiskBuffer};
pub use error::{ErrorKind, EventBoxError, Result};
pub use file_io::FileBoxIo;
pub use io::{BoxControllerIo, OpenMode};
pub use memory_io::{IoControl, MemoryBoxIo};
pub use tree::{BoxNode, Extent, MdEvent};
