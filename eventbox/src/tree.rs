//! The spatial box tree.
//!
//! A tree starts as a single leaf covering the whole event space. Leaves
//! collect events until the [`BoxController`] says they should split, at
//! which point the leaf becomes a grid box with one child leaf per cell of
//! the controller's fan-out, and its events are redistributed into them.
//!
//! Leaves can push their events into the controller's disk buffer
//! ([`BoxNode::evict`]) and read them back later; a leaf keeps its id for
//! its whole life, whether its events are in memory, buffered or on disk.
//!
//! # Example
//!
//! ```rust
//! use eventbox::controller::BoxController;
//! use eventbox::tree::{BoxNode, Extent, MdEvent};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut controller = BoxController::new(2)?;
//! controller.set_split_into(2)?;
//! controller.set_split_threshold(4);
//!
//! let mut root = BoxNode::new_root(&mut controller, vec![Extent::new(0.0, 1.0); 2])?;
//! for i in 0..5 {
//!     let x = f64::from(i) / 5.0;
//!     root.add_event(MdEvent::lean(1.0, 1.0, vec![x, x]), &mut controller)?;
//! }
//! assert!(!root.is_leaf());
//! assert_eq!(root.children().len(), 4);
//! assert_eq!(root.n_events(), 5);
//! # Ok(())
//! # }
//! ```

use tracing::debug;

use crate::codec::EventKind;
use crate::controller::BoxController;
use crate::error::{Result, TreeError};

/// A single measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct MdEvent {
    /// Weight of the event.
    pub signal: f64,
    /// Squared error of the weight.
    pub error_squared: f64,
    /// Run the event came from. Not stored for lean events.
    pub run_index: u16,
    /// Goniometer setting. Not stored for lean events.
    pub goniometer_index: u16,
    /// Detector that saw the event. Not stored for lean events.
    pub detector_id: u32,
    /// Coordinates, one per dimension.
    pub center: Vec<f64>,
}

impl MdEvent {
    /// A full event.
    pub fn new(
        signal: f64,
        error_squared: f64,
        run_index: u16,
        goniometer_index: u16,
        detector_id: u32,
        center: Vec<f64>,
    ) -> Self {
        Self {
            signal,
            error_squared,
            run_index,
            goniometer_index,
            detector_id,
            center,
        }
    }

    /// An event with weight and coordinates only.
    pub fn lean(signal: f64, error_squared: f64, center: Vec<f64>) -> Self {
        Self::new(signal, error_squared, 0, 0, 0, center)
    }

    /// Appends this event as one in-memory record of `kind`.
    pub fn write_row(&self, kind: EventKind, out: &mut Vec<f64>) {
        out.push(self.signal);
        out.push(self.error_squared);
        if kind == EventKind::MdEvent {
            out.push(f64::from(self.run_index));
            out.push(f64::from(self.goniometer_index));
            out.push(f64::from(self.detector_id));
        }
        out.extend_from_slice(&self.center);
    }

    /// Rebuilds an event from one in-memory record of `kind`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // ids are stored as floats
    pub fn from_row(kind: EventKind, row: &[f64]) -> Self {
        match kind {
            EventKind::MdLeanEvent => Self::lean(row[0], row[1], row[2..].to_vec()),
            EventKind::MdEvent => Self::new(
                row[0],
                row[1],
                row[2] as u16,
                row[3] as u16,
                row[4] as u32,
                row[5..].to_vec(),
            ),
        }
    }
}

/// Half-open range `[min, max)` covered by a box in one dimension.
///
/// The upper edge of the space belongs to the last box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
}

impl Extent {
    /// Creates an extent.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Length of the range.
    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    /// Whether `x` lies inside the range.
    pub fn contains(&self, x: f64) -> bool {
        x >= self.min && x < self.max
    }

    /// Index of the cell holding `x` when this range is cut into `n` equal
    /// cells. Values outside the range go to the nearest end cell.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn cell(&self, x: f64, n: usize) -> usize {
        let scaled = (x - self.min) / self.width() * n as f64;
        if scaled <= 0.0 || scaled.is_nan() {
            0
        } else {
            (scaled as usize).min(n - 1)
        }
    }

    /// The `i`-th of `n` equal cells.
    #[allow(clippy::cast_precision_loss)]
    fn sub_extent(&self, i: usize, n: usize) -> Self {
        let step = self.width() / n as f64;
        let min = self.min + step * i as f64;
        let max = if i + 1 == n {
            self.max
        } else {
            self.min + step * (i + 1) as f64
        };
        Self { min, max }
    }
}

/// A box holding events.
#[derive(Debug, Clone)]
pub struct LeafBox {
    id: u64,
    depth: usize,
    extents: Vec<Extent>,
    signal: f64,
    error_squared: f64,
    n_events: u64,
    /// Events not yet handed to the disk buffer.
    events: Vec<MdEvent>,
    /// Whether the disk buffer holds a block for this box.
    stored: bool,
}

impl LeafBox {
    fn new(id: u64, depth: usize, extents: Vec<Extent>) -> Self {
        Self {
            id,
            depth,
            extents,
            signal: 0.0,
            error_squared: 0.0,
            n_events: 0,
            events: Vec::new(),
            stored: false,
        }
    }

    /// Events currently held in memory.
    pub fn in_memory(&self) -> &[MdEvent] {
        &self.events
    }

    /// Whether some of this box's events live in the disk buffer.
    pub fn is_stored(&self) -> bool {
        self.stored
    }

    fn push(&mut self, event: MdEvent) {
        self.signal += event.signal;
        self.error_squared += event.error_squared;
        self.n_events += 1;
        self.events.push(event);
    }

    /// All events: the stored block (if any) followed by the in-memory ones.
    fn load_events(&self, controller: &mut BoxController) -> Result<Vec<MdEvent>> {
        let mut events: Vec<MdEvent> = if self.stored {
            let buffer = controller.require_file_io("loading box events")?;
            let kind = buffer.io().schema().kind();
            let width = buffer.io().n_data_columns();
            buffer
                .load_block(self.id)?
                .chunks_exact(width)
                .map(|row| MdEvent::from_row(kind, row))
                .collect()
        } else {
            Vec::new()
        };
        events.extend(self.events.iter().cloned());
        Ok(events)
    }

    fn evict(&mut self, controller: &mut BoxController) -> Result<()> {
        let buffer = controller.require_file_io("evicting box events")?;
        if self.stored && self.events.is_empty() {
            return Ok(());
        }
        let kind = buffer.io().schema().kind();
        let mut rows = if self.stored {
            buffer.load_block(self.id)?
        } else {
            Vec::new()
        };
        for event in &self.events {
            event.write_row(kind, &mut rows);
        }
        buffer.save_block(self.id, rows)?;
        self.events.clear();
        self.stored = true;
        Ok(())
    }
}

/// A box whose space is divided among child boxes.
#[derive(Debug, Clone)]
pub struct GridBox {
    id: u64,
    depth: usize,
    extents: Vec<Extent>,
    signal: f64,
    error_squared: f64,
    n_events: u64,
    /// Fan-out per dimension; dimension 0 varies fastest in `children`.
    split: Vec<usize>,
    children: Vec<BoxNode>,
}

impl GridBox {
    /// Fan-out per dimension.
    pub fn split(&self) -> &[usize] {
        &self.split
    }

    fn child_index(&self, center: &[f64]) -> usize {
        let mut index = 0;
        let mut stride = 1;
        for ((extent, &n), &x) in self.extents.iter().zip(&self.split).zip(center) {
            index += extent.cell(x, n) * stride;
            stride *= n;
        }
        index
    }

    fn insert(&mut self, event: MdEvent, controller: &mut BoxController) -> Result<()> {
        self.signal += event.signal;
        self.error_squared += event.error_squared;
        self.n_events += 1;
        let index = self.child_index(&event.center);
        self.children[index].insert(event, controller)
    }
}

/// A node of the box tree.
#[derive(Debug, Clone)]
pub enum BoxNode {
    /// A box holding events.
    Leaf(LeafBox),
    /// A box holding child boxes.
    Grid(GridBox),
}

impl BoxNode {
    /// Creates the root leaf covering `extents`, taking its id from the
    /// controller.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError`] if the number of extents differs from the
    /// controller's dimensions, or an extent is empty or not finite.
    pub fn new_root(controller: &mut BoxController, extents: Vec<Extent>) -> Result<Self> {
        if extents.len() != controller.n_dims() {
            return Err(TreeError::CoordinateCount {
                expected: controller.n_dims(),
                found: extents.len(),
            }
            .into());
        }
        for (dim, extent) in extents.iter().enumerate() {
            if !(extent.min.is_finite() && extent.max.is_finite() && extent.min < extent.max) {
                return Err(TreeError::InvalidExtent {
                    dim,
                    min: extent.min,
                    max: extent.max,
                }
                .into());
            }
        }
        Ok(Self::Leaf(LeafBox::new(controller.next_id(), 0, extents)))
    }

    /// Adds an event to the leaf containing its coordinates, splitting
    /// leaves that grow past the controller's threshold.
    ///
    /// Coordinates outside the box are routed to the nearest boundary cell.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::CoordinateCount`] for an event of the wrong
    /// dimensionality, or the disk buffer error if a split must reload
    /// evicted events and cannot.
    pub fn add_event(&mut self, event: MdEvent, controller: &mut BoxController) -> Result<()> {
        if event.center.len() != self.extents().len() {
            return Err(TreeError::CoordinateCount {
                expected: self.extents().len(),
                found: event.center.len(),
            }
            .into());
        }
        self.insert(event, controller)
    }

    fn insert(&mut self, event: MdEvent, controller: &mut BoxController) -> Result<()> {
        let should_split = match self {
            Self::Leaf(leaf) => {
                leaf.push(event);
                controller.will_split(leaf.n_events, leaf.depth)
            }
            Self::Grid(grid) => {
                grid.insert(event, controller)?;
                false
            }
        };
        if should_split {
            self.split(controller)?;
        }
        Ok(())
    }

    /// Turns this leaf into a grid box and redistributes its events.
    fn split(&mut self, controller: &mut BoxController) -> Result<()> {
        let Self::Leaf(leaf) = self else {
            return Ok(());
        };
        let events = leaf.load_events(controller)?;
        let depth = leaf.depth;
        let split = controller.split_for_depth(depth);
        let n_children: usize = split.iter().product();

        let mut children = Vec::with_capacity(n_children);
        for index in 0..n_children {
            let mut rest = index;
            let extents = leaf
                .extents
                .iter()
                .zip(&split)
                .map(|(extent, &n)| {
                    let cell = rest % n;
                    rest /= n;
                    extent.sub_extent(cell, n)
                })
                .collect();
            children.push(Self::Leaf(LeafBox::new(
                controller.next_id(),
                depth + 1,
                extents,
            )));
        }
        controller.track_num_boxes(depth)?;

        let mut grid = GridBox {
            id: leaf.id,
            depth,
            extents: leaf.extents.clone(),
            signal: 0.0,
            error_squared: 0.0,
            n_events: 0,
            split,
            children,
        };
        for event in events {
            grid.insert(event, controller)?;
        }
        if leaf.stored {
            controller
                .require_file_io("splitting a stored box")?
                .remove_block(leaf.id)?;
        }

        debug!(
            id = grid.id,
            depth,
            children = n_children,
            events = grid.n_events,
            "split box"
        );
        *self = Self::Grid(grid);
        Ok(())
    }

    /// Moves every leaf's in-memory events into the controller's disk
    /// buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::NotFileBacked`](crate::error::ControllerError::NotFileBacked)
    /// if the controller has no file backing, or the disk buffer error.
    pub fn evict(&mut self, controller: &mut BoxController) -> Result<()> {
        match self {
            Self::Leaf(leaf) => leaf.evict(controller),
            Self::Grid(grid) => grid
                .children
                .iter_mut()
                .try_for_each(|child| child.evict(controller)),
        }
    }

    /// Every event below this node, reloading evicted ones.
    ///
    /// # Errors
    ///
    /// Returns the disk buffer error if a stored block cannot be read.
    pub fn collect_events(&self, controller: &mut BoxController) -> Result<Vec<MdEvent>> {
        match self {
            Self::Leaf(leaf) => leaf.load_events(controller),
            Self::Grid(grid) => {
                let mut events = Vec::new();
                for child in &grid.children {
                    events.extend(child.collect_events(controller)?);
                }
                Ok(events)
            }
        }
    }

    /// Box id.
    pub fn id(&self) -> u64 {
        match self {
            Self::Leaf(leaf) => leaf.id,
            Self::Grid(grid) => grid.id,
        }
    }

    /// Depth below the root.
    pub fn depth(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.depth,
            Self::Grid(grid) => grid.depth,
        }
    }

    /// Events held below this node.
    pub fn n_events(&self) -> u64 {
        match self {
            Self::Leaf(leaf) => leaf.n_events,
            Self::Grid(grid) => grid.n_events,
        }
    }

    /// Summed signal.
    pub fn signal(&self) -> f64 {
        match self {
            Self::Leaf(leaf) => leaf.signal,
            Self::Grid(grid) => grid.signal,
        }
    }

    /// Summed squared error.
    pub fn error_squared(&self) -> f64 {
        match self {
            Self::Leaf(leaf) => leaf.error_squared,
            Self::Grid(grid) => grid.error_squared,
        }
    }

    /// Space covered by this node.
    pub fn extents(&self) -> &[Extent] {
        match self {
            Self::Leaf(leaf) => &leaf.extents,
            Self::Grid(grid) => &grid.extents,
        }
    }

    /// Whether this node holds events directly.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    /// Child nodes; empty for a leaf.
    pub fn children(&self) -> &[BoxNode] {
        match self {
            Self::Leaf(_) => &[],
            Self::Grid(grid) => &grid.children,
        }
    }

    /// Number of leaves at each depth, indexed from this node's depth 0
    /// of the tree up to the deepest leaf.
    pub fn leaf_count_by_depth(&self) -> Vec<u64> {
        let mut counts = Vec::new();
        self.count_leaves(&mut counts);
        counts
    }

    fn count_leaves(&self, counts: &mut Vec<u64>) {
        match self {
            Self::Leaf(leaf) => {
                if counts.len() <= leaf.depth {
                    counts.resize(leaf.depth + 1, 0);
                }
                counts[leaf.depth] += 1;
            }
            Self::Grid(grid) => {
                for child in &grid.children {
                    child.count_leaves(counts);
                }
            }
        }
    }
}
