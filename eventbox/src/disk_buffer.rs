//! Write-back cache in front of an I/O backend.
//!
//! Leaves hand their event blocks to the buffer keyed by box id. Writes land
//! in memory first and reach the backend only when the buffer holds more
//! than [`write_buffer_size`](DiskBuffer::write_buffer_size) blocks, when
//! [`flush`](DiskBuffer::flush) is called, or when the owning controller
//! drops its file backing.
//!
//! Eviction is least-recently-touched first. Every save or buffered read
//! stamps the block with a fresh serial number; the `lru` index maps serial
//! numbers back to box ids, so its first entry is always the next victim.
//!
//! The buffer also decides where blocks live in the file. A block that is
//! rewritten with the same length goes back to the same place; otherwise it
//! gets a new extent (reused free space first, else the end of the file) and
//! its old extent is freed once the new write has succeeded.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, error, trace, warn};

use crate::error::{BufferError, Result};
use crate::io::BoxControllerIo;

/// Number of blocks buffered before the oldest are written out.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 64;

/// Where a box's events live in the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockLocation {
    /// First event.
    pub position: u64,
    /// Number of events.
    pub n_events: u64,
}

/// Cache traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Reads served from the buffer.
    pub hits: u64,
    /// Reads that went to the backend.
    pub misses: u64,
    /// Blocks written to the backend.
    pub flushed_blocks: u64,
}

/// A block waiting to be written.
#[derive(Debug)]
struct PendingBlock {
    data: Vec<f64>,
    /// Serial number for LRU purposes; higher is more recent.
    serial: u64,
}

/// Write-back cache keyed by box id.
#[derive(Debug)]
pub struct DiskBuffer {
    io: Box<dyn BoxControllerIo>,
    write_buffer_size: usize,
    pending: HashMap<u64, PendingBlock>,
    /// Serial number to box id. The smallest serial is the least recently
    /// touched block.
    lru: BTreeMap<u64, u64>,
    next_serial: u64,
    locations: HashMap<u64, BlockLocation>,
    stats: BufferStats,
}

impl DiskBuffer {
    /// Wraps `io` with the default buffer size.
    pub fn new(io: Box<dyn BoxControllerIo>) -> Self {
        Self::with_write_buffer_size(io, DEFAULT_WRITE_BUFFER_SIZE)
    }

    /// Wraps `io`, buffering at most `size` blocks.
    pub fn with_write_buffer_size(io: Box<dyn BoxControllerIo>, size: usize) -> Self {
        Self {
            io,
            write_buffer_size: size,
            pending: HashMap::new(),
            lru: BTreeMap::new(),
            next_serial: 0,
            locations: HashMap::new(),
            stats: BufferStats::default(),
        }
    }

    /// Maximum number of blocks held before eviction.
    pub fn write_buffer_size(&self) -> usize {
        self.write_buffer_size
    }

    /// Changes the bound, writing out blocks if the buffer is now over it.
    ///
    /// A size of zero makes every save write straight through.
    ///
    /// # Errors
    ///
    /// Returns the backend error if an eviction fails; the new size is kept
    /// and the unwritten blocks stay buffered.
    pub fn set_write_buffer_size(&mut self, size: usize) -> Result<()> {
        self.write_buffer_size = size;
        self.evict_to(size)
    }

    /// Buffers `data` as the current contents of `box_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the block is not a whole number of records, or if
    /// the eviction it triggers fails. In the latter case the block is still
    /// buffered.
    pub fn save_block(&mut self, box_id: u64, data: Vec<f64>) -> Result<()> {
        self.io.layout().events_in(&data)?;

        let serial = self.bump_serial();
        if let Some(old) = self
            .pending
            .insert(box_id, PendingBlock { data, serial })
        {
            self.lru.remove(&old.serial);
        }
        self.lru.insert(serial, box_id);

        self.evict_to(self.write_buffer_size)
    }

    /// Returns the current contents of `box_id`.
    ///
    /// Buffered blocks are served without touching the backend.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::UnknownBlock`] if the box was never saved, or
    /// the backend error if the read fails.
    pub fn load_block(&mut self, box_id: u64) -> Result<Vec<f64>> {
        if self.pending.contains_key(&box_id) {
            self.touch(box_id);
            self.stats.hits += 1;
            trace!(box_id, "buffer hit");
            return Ok(self.pending[&box_id].data.clone());
        }

        let location = self
            .locations
            .get(&box_id)
            .copied()
            .ok_or(BufferError::UnknownBlock { box_id })?;

        self.stats.misses += 1;
        trace!(box_id, position = location.position, "buffer miss");

        let mut data = Vec::new();
        if location.n_events > 0 {
            #[allow(clippy::cast_possible_truncation)] // block lengths fit in memory
            let n_events = location.n_events as usize;
            self.io.load_block(&mut data, location.position, n_events)?;
        }
        Ok(data)
    }

    /// Writes every buffered block, oldest first, then flushes the backend.
    ///
    /// # Errors
    ///
    /// Returns the first backend error; blocks not yet written stay buffered.
    pub fn flush(&mut self) -> Result<()> {
        let count = self.pending.len();
        self.evict_to(0)?;
        self.io.flush_data()?;
        if count > 0 {
            debug!(blocks = count, "flushed disk buffer");
        }
        Ok(())
    }

    /// Forgets `box_id`: drops any buffered copy and frees its extent.
    ///
    /// # Errors
    ///
    /// Returns an error if the extent cannot be returned to the free map.
    pub fn remove_block(&mut self, box_id: u64) -> Result<()> {
        if let Some(old) = self.pending.remove(&box_id) {
            self.lru.remove(&old.serial);
        }
        if let Some(location) = self.locations.remove(&box_id)
            && location.n_events > 0
        {
            self.io
                .free_space_mut()
                .free(location.position, location.n_events)?;
        }
        Ok(())
    }

    /// Flushes the buffer and closes the backend.
    ///
    /// # Errors
    ///
    /// Returns the flush or close error; on a flush error the backend stays
    /// open and the blocks stay buffered.
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.io.close_file()
    }

    /// Whether `box_id` currently has an unwritten block.
    pub fn is_buffered(&self, box_id: u64) -> bool {
        self.pending.contains_key(&box_id)
    }

    /// Number of unwritten blocks.
    pub fn buffered_count(&self) -> usize {
        self.pending.len()
    }

    /// Where `box_id` was last written.
    pub fn location(&self, box_id: u64) -> Option<BlockLocation> {
        self.locations.get(&box_id).copied()
    }

    /// Records where `box_id` lives in a file that was written earlier.
    pub fn set_location(&mut self, box_id: u64, location: BlockLocation) {
        self.locations.insert(box_id, location);
    }

    /// Cache traffic so far.
    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    /// The backend.
    pub fn io(&self) -> &dyn BoxControllerIo {
        self.io.as_ref()
    }

    /// Mutable access to the backend.
    pub fn io_mut(&mut self) -> &mut dyn BoxControllerIo {
        self.io.as_mut()
    }

    fn bump_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    fn touch(&mut self, box_id: u64) {
        let serial = self.bump_serial();
        if let Some(block) = self.pending.get_mut(&box_id) {
            self.lru.remove(&block.serial);
            block.serial = serial;
            self.lru.insert(serial, box_id);
        }
    }

    fn evict_to(&mut self, limit: usize) -> Result<()> {
        while self.pending.len() > limit {
            let Some((&_serial, &box_id)) = self.lru.first_key_value() else {
                break;
            };
            self.write_block(box_id)?;
        }
        Ok(())
    }

    /// Writes one buffered block and removes it from the buffer.
    fn write_block(&mut self, box_id: u64) -> Result<()> {
        let n_data_columns = self.io.n_data_columns();
        let Some(len) = self.pending.get(&box_id).map(|block| block.data.len()) else {
            return Ok(());
        };
        let n_events = (len / n_data_columns) as u64;
        let old = self.locations.get(&box_id).copied();

        let (position, from_free_space) = match old {
            Some(location) if location.n_events == n_events => (location.position, false),
            _ if n_events == 0 => (0, false),
            _ => match self.io.free_space_mut().allocate(n_events) {
                Some(position) => (position, true),
                None => (self.io.file_length(), false),
            },
        };

        if n_events > 0 {
            let data = &self.pending[&box_id].data;
            if let Err(e) = self.io.save_block(data, position) {
                if from_free_space
                    && let Err(free_err) = self.io.free_space_mut().free(position, n_events)
                {
                    warn!(box_id, "could not return extent after failed write: {free_err}");
                }
                error!(box_id, position, "block write failed: {e}");
                return Err(e);
            }
        }

        if let Some(old) = old
            && old.n_events > 0
            && (old.position != position || old.n_events != n_events)
        {
            self.io.free_space_mut().free(old.position, old.n_events)?;
        }

        self.locations.insert(box_id, BlockLocation { position, n_events });
        if let Some(block) = self.pending.remove(&box_id) {
            self.lru.remove(&block.serial);
        }
        self.stats.flushed_blocks += 1;
        trace!(box_id, position, n_events, "wrote block");
        Ok(())
    }
}

impl Drop for DiskBuffer {
    fn drop(&mut self) {
        if !self.pending.is_empty()
            && let Err(e) = self.flush()
        {
            error!(
                blocks = self.pending.len(),
                "disk buffer dropped with unwritten blocks: {e}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::memory_io::{IoControl, MemoryBoxIo};
    use std::path::Path;

    /// A lean 2-d in-memory backend: 4 values per event.
    fn buffer(size: usize) -> DiskBuffer {
        controlled_buffer(size).0
    }

    fn controlled_buffer(size: usize) -> (DiskBuffer, IoControl) {
        let mut io = MemoryBoxIo::new(2);
        io.set_data_type(8, "MDLeanEvent").unwrap();
        io.open_file(Path::new("buffer-test"), "w").unwrap();
        let control = io.control();
        (DiskBuffer::with_write_buffer_size(Box::new(io), size), control)
    }

    fn block(n_events: usize, seed: f64) -> Vec<f64> {
        (0..n_events * 4).map(|i| seed + i as f64).collect()
    }

    #[test]
    fn test_writes_stay_buffered_until_full() {
        let mut buffer = buffer(3);
        for id in 0..3 {
            buffer.save_block(id, block(2, id as f64)).unwrap();
        }
        assert_eq!(buffer.buffered_count(), 3);
        assert_eq!(buffer.io().file_length(), 0);

        // The fourth block pushes out the oldest one.
        buffer.save_block(3, block(2, 3.0)).unwrap();
        assert_eq!(buffer.buffered_count(), 3);
        assert!(!buffer.is_buffered(0));
        assert_eq!(
            buffer.location(0),
            Some(BlockLocation {
                position: 0,
                n_events: 2
            })
        );
        assert_eq!(buffer.stats().flushed_blocks, 1);
    }

    #[test]
    fn test_recently_read_blocks_survive_eviction() {
        let mut buffer = buffer(2);
        buffer.save_block(1, block(1, 1.0)).unwrap();
        buffer.save_block(2, block(1, 2.0)).unwrap();

        // Reading box 1 makes box 2 the least recently touched.
        buffer.load_block(1).unwrap();
        buffer.save_block(3, block(1, 3.0)).unwrap();

        assert!(buffer.is_buffered(1));
        assert!(!buffer.is_buffered(2));
        assert!(buffer.is_buffered(3));
    }

    #[test]
    fn test_hits_and_misses() {
        let mut buffer = buffer(1);
        buffer.save_block(7, block(3, 7.0)).unwrap();
        assert_eq!(buffer.load_block(7).unwrap(), block(3, 7.0));
        assert_eq!(buffer.stats().hits, 1);
        assert_eq!(buffer.stats().misses, 0);

        buffer.save_block(8, block(3, 8.0)).unwrap();
        assert_eq!(buffer.load_block(7).unwrap(), block(3, 7.0));
        assert_eq!(buffer.stats().misses, 1);
    }

    #[test]
    fn test_unknown_block() {
        let mut buffer = buffer(4);
        let err = buffer.load_block(99).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeError);
    }

    #[test]
    fn test_malformed_block_rejected() {
        let mut buffer = buffer(4);
        let err = buffer.save_block(1, vec![1.0; 5]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(!buffer.is_buffered(1));
    }

    #[test]
    fn test_rewrite_same_size_reuses_position() {
        let mut buffer = buffer(0);
        buffer.save_block(1, block(5, 0.0)).unwrap();
        buffer.save_block(2, block(5, 100.0)).unwrap();
        let first = buffer.location(1).unwrap();

        buffer.save_block(1, block(5, 50.0)).unwrap();
        assert_eq!(buffer.location(1), Some(first));
        assert_eq!(buffer.io().file_length(), 10);
        assert!(buffer.io().free_space_vector().is_empty());
    }

    #[test]
    fn test_grown_block_moves_and_frees_old_extent() {
        let mut buffer = buffer(0);
        buffer.save_block(1, block(5, 0.0)).unwrap();
        buffer.save_block(2, block(5, 100.0)).unwrap();

        buffer.save_block(1, block(8, 0.0)).unwrap();
        assert_eq!(
            buffer.location(1),
            Some(BlockLocation {
                position: 10,
                n_events: 8
            })
        );
        assert_eq!(buffer.io().free_space_vector(), vec![(0, 5)]);

        // A small block reuses the hole.
        buffer.save_block(3, block(3, 0.0)).unwrap();
        assert_eq!(buffer.location(3).unwrap().position, 0);
        assert_eq!(buffer.io().free_space_vector(), vec![(3, 2)]);
    }

    #[test]
    fn test_remove_block_frees_extent() {
        let mut buffer = buffer(0);
        buffer.save_block(1, block(4, 0.0)).unwrap();
        buffer.remove_block(1).unwrap();
        assert_eq!(buffer.location(1), None);
        assert_eq!(buffer.io().free_space_vector(), vec![(0, 4)]);
        assert!(buffer.load_block(1).is_err());
    }

    #[test]
    fn test_empty_block_round_trips_without_disk() {
        let mut buffer = buffer(0);
        buffer.save_block(1, Vec::new()).unwrap();
        assert_eq!(buffer.io().file_length(), 0);
        assert!(buffer.load_block(1).unwrap().is_empty());
    }

    #[test]
    fn test_set_write_buffer_size_evicts() {
        let mut buffer = buffer(10);
        for id in 0..6 {
            buffer.save_block(id, block(1, 0.0)).unwrap();
        }
        buffer.set_write_buffer_size(2).unwrap();
        assert_eq!(buffer.write_buffer_size(), 2);
        assert_eq!(buffer.buffered_count(), 2);
        assert!(buffer.is_buffered(4));
        assert!(buffer.is_buffered(5));
    }

    #[test]
    fn test_failed_write_keeps_block_and_returns_extent() {
        let (mut buffer, control) = controlled_buffer(0);
        buffer.save_block(1, block(5, 0.0)).unwrap();
        buffer.save_block(2, block(5, 100.0)).unwrap();
        buffer.remove_block(1).unwrap();
        assert_eq!(buffer.io().free_space_vector(), vec![(0, 5)]);

        control.set_fail_writes(true);
        let err = buffer.save_block(3, block(3, 7.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileError);
        assert!(buffer.is_buffered(3));
        assert_eq!(buffer.location(3), None);
        assert_eq!(buffer.io().free_space_vector(), vec![(0, 5)]);
        assert_eq!(control.counters().blocks_written, 2);

        // The buffered copy is still served while the device is down.
        assert_eq!(buffer.load_block(3).unwrap(), block(3, 7.0));
        assert!(buffer.flush().is_err());

        control.set_fail_writes(false);
        buffer.flush().unwrap();
        assert!(!buffer.is_buffered(3));
        assert_eq!(
            buffer.location(3),
            Some(BlockLocation {
                position: 0,
                n_events: 3
            })
        );
        assert_eq!(buffer.io().free_space_vector(), vec![(3, 2)]);
        assert_eq!(buffer.load_block(3).unwrap(), block(3, 7.0));
    }

    #[test]
    fn test_failed_move_keeps_old_extent() {
        let (mut buffer, control) = controlled_buffer(0);
        buffer.save_block(1, block(2, 0.0)).unwrap();
        let before = buffer.location(1);

        control.set_fail_writes(true);
        assert!(buffer.save_block(1, block(4, 0.0)).is_err());
        assert_eq!(buffer.location(1), before);
        assert!(buffer.io().free_space_vector().is_empty());
        assert_eq!(buffer.io().file_length(), 2);

        control.set_fail_writes(false);
        buffer.flush().unwrap();
        assert_eq!(buffer.location(1).unwrap().n_events, 4);
        assert_eq!(buffer.io().free_space_vector(), vec![(0, 2)]);
    }

    #[test]
    fn test_hits_never_reach_backend() {
        let (mut buffer, control) = controlled_buffer(4);
        buffer.save_block(9, block(3, 9.0)).unwrap();
        for _ in 0..5 {
            assert_eq!(buffer.load_block(9).unwrap(), block(3, 9.0));
        }
        assert_eq!(buffer.stats().hits, 5);
        assert_eq!(control.counters().blocks_read, 0);
        assert_eq!(control.counters().blocks_written, 0);

        buffer.flush().unwrap();
        assert_eq!(buffer.load_block(9).unwrap(), block(3, 9.0));
        assert_eq!(buffer.stats().misses, 1);
        assert_eq!(control.counters().blocks_read, 1);
    }
}
