//! The box controller: split policy, id allocation and population counters.
//!
//! One controller exists per dataset. The box tree asks it whether a leaf
//! should split ([`BoxController::will_split`]), takes fresh ids from it
//! ([`BoxController::next_id`]) and reports every split back
//! ([`BoxController::track_num_boxes`]) so the per-depth populations stay
//! current. A controller may additionally own a [`DiskBuffer`] and its I/O
//! backend, in which case the tree can page leaf events to a file.
//!
//! Policy and counters serialize to a small XML blob
//! ([`to_xml_string`](BoxController::to_xml_string)) and to JSON through
//! [`BoxControllerSettings`]. Neither carries the file backing.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::disk_buffer::DiskBuffer;
use crate::error::{ControllerError, Result};
use crate::io::BoxControllerIo;

/// Split threshold of a freshly constructed controller, in events.
pub const DEFAULT_SPLIT_THRESHOLD: u64 = 1000;

/// Maximum depth of a freshly constructed controller.
pub const DEFAULT_MAX_DEPTH: usize = 5;

/// Largest accepted maximum depth. Box ids are `u64`, so a tree whose
/// fan-out is at least two never gets deeper than this.
pub const MAX_DEPTH_LIMIT: usize = 64;

const XML_ROOT: &str = "BoxController";

/// Serializable policy and counters of a [`BoxController`].
///
/// This is the configuration surface: the CLI reads it from JSON, and the
/// XML blob is produced from and parsed into it. The counters may be left
/// out, in which case the controller starts with only the root box.
///
/// # Example
///
/// ```rust
/// use eventbox::controller::{BoxController, BoxControllerSettings};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let settings: BoxControllerSettings = serde_json::from_str(
///     r#"{ "n_dims": 2, "split_into": [4, 4], "split_threshold": 500, "max_depth": 6 }"#,
/// )?;
/// let controller = BoxController::from_settings(&settings)?;
/// assert_eq!(controller.num_split(), 16);
/// assert_eq!(controller.num_md_boxes(), &[1, 0, 0, 0, 0, 0, 0]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxControllerSettings {
    /// Dimensionality of the event space.
    pub n_dims: usize,

    /// Fan-out per dimension below the top level.
    pub split_into: Vec<usize>,

    /// Top-level fan-out overrides, one entry per dimension. `None` entries
    /// fall back to `split_into`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_top_into: Option<Vec<Option<usize>>>,

    /// A leaf splits once it holds more events than this.
    pub split_threshold: u64,

    /// Leaves at this depth never split.
    pub max_depth: usize,

    /// Next box id to hand out.
    #[serde(default)]
    pub max_id: u64,

    /// Leaf count per depth, `max_depth + 1` entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub num_md_boxes: Vec<u64>,

    /// Grid box count per depth, `max_depth + 1` entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub num_md_grid_boxes: Vec<u64>,
}

impl BoxControllerSettings {
    /// Checks that the settings describe a consistent controller.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] if:
    /// - `n_dims` is zero
    /// - a fan-out list has the wrong length or a zero entry
    /// - `max_depth` exceeds [`MAX_DEPTH_LIMIT`]
    /// - a counter list is present with a length other than `max_depth + 1`
    pub fn validate(&self) -> Result<()> {
        if self.n_dims == 0 {
            return Err(ControllerError::ZeroDimensions.into());
        }
        if self.split_into.len() != self.n_dims {
            return Err(invalid_settings(format!(
                "split_into has {} entries for {} dimensions",
                self.split_into.len(),
                self.n_dims
            )));
        }
        check_fan_out(&self.split_into)?;

        if let Some(top) = &self.split_top_into {
            if top.len() != self.n_dims {
                return Err(invalid_settings(format!(
                    "split_top_into has {} entries for {} dimensions",
                    top.len(),
                    self.n_dims
                )));
            }
            for (dim, value) in top.iter().enumerate() {
                if let Some(0) = value {
                    return Err(ControllerError::InvalidFanOut { dim, value: 0 }.into());
                }
            }
        }

        check_max_depth(self.max_depth)?;
        let levels = self.max_depth + 1;
        for (name, counts) in [
            ("num_md_boxes", &self.num_md_boxes),
            ("num_md_grid_boxes", &self.num_md_grid_boxes),
        ] {
            if !counts.is_empty() && counts.len() != levels {
                return Err(invalid_settings(format!(
                    "{name} has {} entries, expected {levels}",
                    counts.len()
                )));
            }
        }
        Ok(())
    }
}

/// Split policy, id counter and population statistics for one dataset.
///
/// Cloning copies policy and counters only; a clone is never file backed.
#[derive(Debug)]
pub struct BoxController {
    n_dims: usize,
    split_into: Vec<usize>,
    split_top_into: Vec<Option<usize>>,
    num_split: usize,
    split_threshold: u64,
    max_depth: usize,
    max_id: u64,
    num_md_boxes: Vec<u64>,
    num_md_grid_boxes: Vec<u64>,
    max_num_md_boxes: Vec<f64>,
    buffer: Option<DiskBuffer>,
}

impl BoxController {
    /// Creates a controller for `n_dims` dimensions.
    ///
    /// Fan-out starts at 1 in every dimension, the id counter at 0 and the
    /// population at a single root leaf.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::ZeroDimensions`] if `n_dims` is zero.
    pub fn new(n_dims: usize) -> Result<Self> {
        if n_dims == 0 {
            return Err(ControllerError::ZeroDimensions.into());
        }
        let mut controller = Self {
            n_dims,
            split_into: vec![1; n_dims],
            split_top_into: vec![None; n_dims],
            num_split: 1,
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            max_depth: DEFAULT_MAX_DEPTH,
            max_id: 0,
            num_md_boxes: Vec::new(),
            num_md_grid_boxes: Vec::new(),
            max_num_md_boxes: Vec::new(),
            buffer: None,
        };
        controller.reset_num_boxes();
        controller.recalculate();
        Ok(controller)
    }

    /// Builds a controller from validated settings.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] if the settings fail
    /// [`BoxControllerSettings::validate`].
    pub fn from_settings(settings: &BoxControllerSettings) -> Result<Self> {
        settings.validate()?;

        let mut controller = Self::new(settings.n_dims)?;
        controller.split_into.clone_from(&settings.split_into);
        controller.split_top_into = settings
            .split_top_into
            .clone()
            .unwrap_or_else(|| vec![None; settings.n_dims]);
        controller.split_threshold = settings.split_threshold;
        controller.max_depth = settings.max_depth;
        controller.max_id = settings.max_id;
        controller.reset_num_boxes();
        if !settings.num_md_boxes.is_empty() {
            controller.num_md_boxes.clone_from(&settings.num_md_boxes);
        }
        if !settings.num_md_grid_boxes.is_empty() {
            controller
                .num_md_grid_boxes
                .clone_from(&settings.num_md_grid_boxes);
        }
        controller.recalculate();
        Ok(controller)
    }

    /// Snapshot of policy and counters.
    pub fn settings(&self) -> BoxControllerSettings {
        BoxControllerSettings {
            n_dims: self.n_dims,
            split_into: self.split_into.clone(),
            split_top_into: self
                .split_top_into
                .iter()
                .any(Option::is_some)
                .then(|| self.split_top_into.clone()),
            split_threshold: self.split_threshold,
            max_depth: self.max_depth,
            max_id: self.max_id,
            num_md_boxes: self.num_md_boxes.clone(),
            num_md_grid_boxes: self.num_md_grid_boxes.clone(),
        }
    }

    /// Dimensionality of the event space.
    pub fn n_dims(&self) -> usize {
        self.n_dims
    }

    /// Sets the same fan-out for every dimension.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidFanOut`] if `n` is zero.
    pub fn set_split_into(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(ControllerError::InvalidFanOut { dim: 0, value: n }.into());
        }
        self.split_into.fill(n);
        self.recalculate();
        Ok(())
    }

    /// Sets the fan-out of one dimension.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::DimensionOutOfRange`] if `dim` is not a
    /// dimension, or [`ControllerError::InvalidFanOut`] if `n` is zero.
    pub fn set_split_into_dim(&mut self, dim: usize, n: usize) -> Result<()> {
        if dim >= self.n_dims {
            return Err(ControllerError::DimensionOutOfRange {
                dim,
                n_dims: self.n_dims,
            }
            .into());
        }
        if n == 0 {
            return Err(ControllerError::InvalidFanOut { dim, value: n }.into());
        }
        self.split_into[dim] = n;
        self.recalculate();
        Ok(())
    }

    /// Fan-out of one dimension below the top level.
    pub fn split_into(&self, dim: usize) -> Option<usize> {
        self.split_into.get(dim).copied()
    }

    /// Overrides the top-level fan-out of one dimension.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidTopDimension`] if `dim` is not a
    /// dimension, or [`ControllerError::InvalidFanOut`] if `n` is zero.
    pub fn set_split_top_into(&mut self, dim: usize, n: usize) -> Result<()> {
        if dim >= self.n_dims {
            return Err(ControllerError::InvalidTopDimension {
                dim,
                n_dims: self.n_dims,
            }
            .into());
        }
        if n == 0 {
            return Err(ControllerError::InvalidFanOut { dim, value: n }.into());
        }
        self.split_top_into[dim] = Some(n);
        self.recalculate();
        Ok(())
    }

    /// The top-level fan-out, or `None` if no dimension has an override.
    ///
    /// Dimensions without an override report their regular fan-out.
    pub fn split_top_into(&self) -> Option<Vec<usize>> {
        self.split_top_into
            .iter()
            .any(Option::is_some)
            .then(|| self.split_for_depth(0))
    }

    /// Number of children produced by a split below the top level.
    pub fn num_split(&self) -> usize {
        self.num_split
    }

    /// Per-dimension fan-out applied when a leaf at `depth` splits.
    pub fn split_for_depth(&self, depth: usize) -> Vec<usize> {
        if depth == 0 {
            self.split_into
                .iter()
                .zip(&self.split_top_into)
                .map(|(&regular, top)| top.unwrap_or(regular))
                .collect()
        } else {
            self.split_into.clone()
        }
    }

    /// Number of children produced when a leaf at `depth` splits.
    pub fn num_split_for_depth(&self, depth: usize) -> usize {
        if depth == 0 {
            self.split_for_depth(0).iter().product()
        } else {
            self.num_split
        }
    }

    /// Leaves at this depth never split.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Changes the maximum depth. Counters are resized to `depth + 1`
    /// entries; existing counts are kept.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::MaxDepthTooLarge`] if `depth` exceeds
    /// [`MAX_DEPTH_LIMIT`]; the controller is left unchanged.
    pub fn set_max_depth(&mut self, depth: usize) -> Result<()> {
        check_max_depth(depth)?;
        self.max_depth = depth;
        self.num_md_boxes.resize(depth + 1, 0);
        self.num_md_grid_boxes.resize(depth + 1, 0);
        self.recalculate();
        Ok(())
    }

    /// A leaf splits once it holds more events than this.
    pub fn split_threshold(&self) -> u64 {
        self.split_threshold
    }

    /// Changes the split threshold.
    pub fn set_split_threshold(&mut self, threshold: u64) {
        self.split_threshold = threshold;
    }

    /// Whether a leaf holding `signal` events at `depth` should split.
    pub fn will_split(&self, signal: u64, depth: usize) -> bool {
        signal > self.split_threshold && depth < self.max_depth
    }

    /// Returns the next unused box id.
    pub fn next_id(&mut self) -> u64 {
        let id = self.max_id;
        self.max_id += 1;
        id
    }

    /// The id the next call to [`next_id`](Self::next_id) will return.
    pub fn max_id(&self) -> u64 {
        self.max_id
    }

    /// Moves the id counter, e.g. after loading a tree from disk.
    pub fn set_max_id(&mut self, id: u64) {
        self.max_id = id;
    }

    /// Records one leaf at `depth` turning into a grid box.
    ///
    /// The leaf count at `depth` drops by one, the grid count rises by one,
    /// and the leaf count at `depth + 1` rises by the fan-out of the split.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::DepthOutOfRange`] if `depth` is at or
    /// beyond the maximum depth.
    pub fn track_num_boxes(&mut self, depth: usize) -> Result<()> {
        if depth >= self.max_depth {
            return Err(ControllerError::DepthOutOfRange {
                depth,
                max_depth: self.max_depth,
            }
            .into());
        }
        let children = self.num_split_for_depth(depth) as u64;
        self.num_md_boxes[depth] = self.num_md_boxes[depth].saturating_sub(1);
        self.num_md_grid_boxes[depth] += 1;
        self.num_md_boxes[depth + 1] += children;
        Ok(())
    }

    /// Leaf count per depth.
    pub fn num_md_boxes(&self) -> &[u64] {
        &self.num_md_boxes
    }

    /// Grid box count per depth.
    pub fn num_md_grid_boxes(&self) -> &[u64] {
        &self.num_md_grid_boxes
    }

    /// Largest possible number of boxes at each depth.
    pub fn max_num_md_boxes(&self) -> &[f64] {
        &self.max_num_md_boxes
    }

    /// Total leaves across all depths.
    pub fn total_num_md_boxes(&self) -> u64 {
        self.num_md_boxes.iter().sum()
    }

    /// Total grid boxes across all depths.
    pub fn total_num_md_grid_boxes(&self) -> u64 {
        self.num_md_grid_boxes.iter().sum()
    }

    /// Resets the population to a single root leaf.
    pub fn reset_num_boxes(&mut self) {
        self.num_md_boxes = vec![0; self.max_depth + 1];
        self.num_md_boxes[0] = 1;
        self.num_md_grid_boxes = vec![0; self.max_depth + 1];
    }

    /// Mean leaf depth, weighting each leaf by the volume it covers.
    ///
    /// A leaf at depth `d` covers `1 / max_num_md_boxes[d]` of the root, so
    /// the mean is `sum(d * num_md_boxes[d] / max_num_md_boxes[d])`. Depths
    /// whose box count overflows `f64` contribute nothing.
    #[allow(clippy::cast_precision_loss)] // counts far below 2^52
    pub fn average_depth(&self) -> f64 {
        self.num_md_boxes
            .iter()
            .zip(&self.max_num_md_boxes)
            .enumerate()
            .filter(|&(depth, (&count, _))| depth > 0 && count > 0)
            .map(|(depth, (&count, &max))| depth as f64 * count as f64 / max)
            .sum()
    }

    /// Serializes policy and counters as an XML blob.
    ///
    /// Lists are comma separated. `SplitTopInto` is only written when some
    /// dimension has an override, and leaves the other entries empty.
    pub fn to_xml_string(&self) -> String {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        if let Err(e) = self.write_xml(&mut writer) {
            error!("failed to write box controller XML: {e}");
        }
        String::from_utf8_lossy(&writer.into_inner()).into_owned()
    }

    /// Parses a blob written by [`to_xml_string`](Self::to_xml_string).
    ///
    /// Attributes, comments and unknown elements are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::SettingsXml`] for malformed XML and
    /// [`ControllerError::InvalidSettings`] for a missing element, an
    /// unparsable value or inconsistent settings.
    pub fn from_xml_string(xml: &str) -> Result<Self> {
        let fields = read_xml_fields(xml)?;

        let settings = BoxControllerSettings {
            n_dims: parse_scalar(&fields, "NumDims")?,
            split_into: parse_list(&fields, "SplitInto")?,
            split_top_into: fields
                .get("SplitTopInto")
                .map(|text| {
                    text.split(',')
                        .map(|item| parse_optional(item.trim(), "SplitTopInto"))
                        .collect::<Result<Vec<_>>>()
                })
                .transpose()?,
            split_threshold: parse_scalar(&fields, "SplitThreshold")?,
            max_depth: parse_scalar(&fields, "MaxDepth")?,
            max_id: parse_scalar(&fields, "MaxId")?,
            num_md_boxes: parse_list(&fields, "NumMDBoxes")?,
            num_md_grid_boxes: parse_list(&fields, "NumMDGridBoxes")?,
        };
        Self::from_settings(&settings)
    }

    fn write_xml<W: std::io::Write>(&self, writer: &mut Writer<W>) -> Result<()> {
        let mut elements = vec![
            ("NumDims", self.n_dims.to_string()),
            ("MaxId", self.max_id.to_string()),
            ("SplitThreshold", self.split_threshold.to_string()),
            ("MaxDepth", self.max_depth.to_string()),
            ("SplitInto", join(&self.split_into)),
        ];
        if self.split_top_into.iter().any(Option::is_some) {
            let top: Vec<String> = self
                .split_top_into
                .iter()
                .map(|n| n.map(|n| n.to_string()).unwrap_or_default())
                .collect();
            elements.push(("SplitTopInto", top.join(",")));
        }
        elements.push(("NumMDBoxes", join(&self.num_md_boxes)));
        elements.push(("NumMDGridBoxes", join(&self.num_md_grid_boxes)));

        writer
            .write_event(Event::Start(BytesStart::new(XML_ROOT)))
            .map_err(xml_error)?;
        for (tag, text) in &elements {
            writer
                .create_element(*tag)
                .write_text_content(BytesText::new(text))
                .map_err(xml_error)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(XML_ROOT)))
            .map_err(xml_error)?;
        Ok(())
    }

    /// Serializes policy and counters as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::SettingsJson`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.settings())
            .map_err(|e| ControllerError::SettingsJson(e).into())
    }

    /// Parses JSON settings.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] if the JSON is malformed or the settings
    /// are inconsistent.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: BoxControllerSettings =
            serde_json::from_str(json).map_err(ControllerError::SettingsJson)?;
        Self::from_settings(&settings)
    }

    /// Attaches an I/O backend and a fresh disk buffer over it.
    ///
    /// Any previous backing is flushed and closed first. Only then is a
    /// backend that is not open yet opened on `file_name` in write mode, so
    /// a failed flush leaves both the old backing and the new file as they
    /// were.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::DimensionMismatch`] if the backend was built
    /// for other dimensions, or the backend error if opening it or closing
    /// the previous backing fails.
    pub fn set_file_backed(
        &mut self,
        mut io: Box<dyn BoxControllerIo>,
        file_name: impl AsRef<Path>,
    ) -> Result<()> {
        if io.n_dims() != self.n_dims {
            return Err(ControllerError::DimensionMismatch {
                expected: self.n_dims,
                found: io.n_dims(),
            }
            .into());
        }
        self.clear_file_backed()?;
        if !io.is_opened() {
            io.open_file(file_name.as_ref(), "w")?;
        }

        debug!(
            file = ?io.file_name(),
            mode = ?io.open_mode(),
            "box controller is now file backed"
        );
        self.buffer = Some(DiskBuffer::new(io));
        Ok(())
    }

    /// Flushes the disk buffer, closes the backend and drops both.
    ///
    /// # Errors
    ///
    /// Returns the flush or close error; the controller then stays backed.
    pub fn clear_file_backed(&mut self) -> Result<()> {
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.close()?;
            self.buffer = None;
            debug!("box controller file backing cleared");
        }
        Ok(())
    }

    /// Whether a disk buffer and backend are attached.
    pub fn is_file_backed(&self) -> bool {
        self.buffer.is_some()
    }

    /// The disk buffer, if file backed.
    pub fn file_io(&self) -> Option<&DiskBuffer> {
        self.buffer.as_ref()
    }

    /// Mutable access to the disk buffer, if file backed.
    pub fn file_io_mut(&mut self) -> Option<&mut DiskBuffer> {
        self.buffer.as_mut()
    }

    /// The disk buffer, or an error naming `operation` if not file backed.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::NotFileBacked`].
    pub fn require_file_io(&mut self, operation: &'static str) -> Result<&mut DiskBuffer> {
        self.buffer
            .as_mut()
            .ok_or_else(|| ControllerError::NotFileBacked { operation }.into())
    }

    #[allow(clippy::cast_precision_loss)] // box counts are estimates
    fn recalculate(&mut self) {
        self.num_split = self.split_into.iter().product();

        let top = self.num_split_for_depth(0) as f64;
        self.max_num_md_boxes = Vec::with_capacity(self.max_depth + 1);
        self.max_num_md_boxes.push(1.0);
        let mut boxes = top;
        for _ in 1..=self.max_depth {
            self.max_num_md_boxes.push(boxes);
            boxes *= self.num_split as f64;
        }
    }
}

impl Clone for BoxController {
    fn clone(&self) -> Self {
        Self {
            n_dims: self.n_dims,
            split_into: self.split_into.clone(),
            split_top_into: self.split_top_into.clone(),
            num_split: self.num_split,
            split_threshold: self.split_threshold,
            max_depth: self.max_depth,
            max_id: self.max_id,
            num_md_boxes: self.num_md_boxes.clone(),
            num_md_grid_boxes: self.num_md_grid_boxes.clone(),
            max_num_md_boxes: self.max_num_md_boxes.clone(),
            buffer: None,
        }
    }
}

impl PartialEq for BoxController {
    fn eq(&self, other: &Self) -> bool {
        self.n_dims == other.n_dims
            && self.split_into == other.split_into
            && self.split_top_into() == other.split_top_into()
            && self.split_threshold == other.split_threshold
            && self.max_depth == other.max_depth
            && self.max_id == other.max_id
            && self.num_md_boxes == other.num_md_boxes
            && self.num_md_grid_boxes == other.num_md_grid_boxes
    }
}

impl Drop for BoxController {
    fn drop(&mut self) {
        if let Err(e) = self.clear_file_backed() {
            error!("failed to clear file backing of dropped box controller: {e}");
        }
    }
}

fn invalid_settings(reason: String) -> crate::error::EventBoxError {
    ControllerError::InvalidSettings { reason }.into()
}

fn check_fan_out(split: &[usize]) -> Result<()> {
    match split.iter().position(|&n| n == 0) {
        Some(dim) => Err(ControllerError::InvalidFanOut { dim, value: 0 }.into()),
        None => Ok(()),
    }
}

fn join<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn xml_error(e: impl fmt::Display) -> crate::error::EventBoxError {
    ControllerError::SettingsXml {
        reason: e.to_string(),
    }
    .into()
}

fn check_max_depth(depth: usize) -> Result<()> {
    if depth > MAX_DEPTH_LIMIT {
        return Err(ControllerError::MaxDepthTooLarge {
            depth,
            limit: MAX_DEPTH_LIMIT,
        }
        .into());
    }
    Ok(())
}

/// Collects the text of each child of the root element, keyed by tag.
fn read_xml_fields(xml: &str) -> Result<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    let mut fields = HashMap::new();
    let mut saw_root = false;
    let mut depth = 0usize;
    let mut current: Option<String> = None;
    let mut text = String::new();

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => {
                depth += 1;
                match depth {
                    1 => saw_root = check_root(e.local_name().as_ref())?,
                    2 => {
                        current = Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                        text.clear();
                    }
                    _ => {}
                }
            }
            Event::Empty(e) => match depth {
                0 => saw_root = check_root(e.local_name().as_ref())?,
                1 => {
                    let tag = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    fields.insert(tag, String::new());
                }
                _ => {}
            },
            Event::Text(e) if depth == 2 => text.push_str(&e.unescape().map_err(xml_error)?),
            Event::End(_) => {
                if depth == 2
                    && let Some(tag) = current.take()
                {
                    fields.insert(tag, text.trim().to_string());
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(invalid_settings(format!("missing <{XML_ROOT}> element")));
    }
    if depth != 0 {
        return Err(invalid_settings(format!("unclosed <{XML_ROOT}> element")));
    }
    Ok(fields)
}

fn check_root(name: &[u8]) -> Result<bool> {
    if name == XML_ROOT.as_bytes() {
        Ok(true)
    } else {
        Err(invalid_settings(format!(
            "unexpected root element <{}>, expected <{XML_ROOT}>",
            String::from_utf8_lossy(name)
        )))
    }
}

fn field<'a>(fields: &'a HashMap<String, String>, tag: &str) -> Result<&'a str> {
    fields
        .get(tag)
        .map(String::as_str)
        .ok_or_else(|| invalid_settings(format!("missing <{tag}> element")))
}

fn parse_value<T: FromStr>(text: &str, tag: &str) -> Result<T> {
    text.parse()
        .map_err(|_| invalid_settings(format!("cannot parse '{text}' in <{tag}>")))
}

fn parse_scalar<T: FromStr>(fields: &HashMap<String, String>, tag: &str) -> Result<T> {
    parse_value(field(fields, tag)?, tag)
}

fn parse_list<T: FromStr>(fields: &HashMap<String, String>, tag: &str) -> Result<Vec<T>> {
    let text = field(fields, tag)?;
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|item| parse_value(item.trim(), tag))
        .collect()
}

fn parse_optional(text: &str, tag: &str) -> Result<Option<usize>> {
    if text.is_empty() {
        Ok(None)
    } else {
        parse_value(text, tag).map(Some)
    }
}
