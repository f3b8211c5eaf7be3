//! Free-space allocator for the backing container.
//!
//! Tracks reusable extents inside a container's data region. Extents are
//! measured in events (logical positions), not bytes, so the map is
//! independent of the record width and precision. Each I/O backend owns one
//! map; it is persisted alongside the data so it survives a close/reopen.
//!
//! Two indexes are kept in step: one ordered by position (for coalescing and
//! for the persisted extent list), one ordered by `(length, position)` (for
//! best-fit allocation).

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{FreeSpaceError, Result};

/// Ordered set of free `(position, length)` extents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeSpaceMap {
    /// Extents keyed by start position.
    by_position: BTreeMap<u64, u64>,
    /// The same extents as `(length, position)` for best-fit lookup.
    by_length: BTreeSet<(u64, u64)>,
}

impl FreeSpaceMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from a persisted extent list.
    ///
    /// Adjacent extents are kept as given so that [`extents`](Self::extents)
    /// returns exactly what was stored. Unsorted input is accepted; the map
    /// always reports extents sorted by position.
    ///
    /// # Errors
    ///
    /// Returns [`FreeSpaceError`] if an extent is empty or two extents
    /// overlap.
    pub fn from_extents(extents: &[(u64, u64)]) -> Result<Self> {
        let mut map = Self::new();
        for &(position, length) in extents {
            map.check_insert(position, length)?;
            map.insert(position, length);
        }
        Ok(map)
    }

    /// Returns the extents sorted by position.
    pub fn extents(&self) -> Vec<(u64, u64)> {
        self.by_position.iter().map(|(&p, &l)| (p, l)).collect()
    }

    /// Number of extents.
    pub fn len(&self) -> usize {
        self.by_position.len()
    }

    /// Whether no space is free.
    pub fn is_empty(&self) -> bool {
        self.by_position.is_empty()
    }

    /// Total number of free events across all extents.
    pub fn total_free(&self) -> u64 {
        self.by_position.values().sum()
    }

    /// Forgets every extent.
    pub fn clear(&mut self) {
        self.by_position.clear();
        self.by_length.clear();
    }

    /// Takes `length` events from the smallest extent that can hold them.
    ///
    /// Ties on length go to the lowest position. Whatever is left of the
    /// chosen extent stays free. Returns `None` when nothing fits, in which
    /// case the caller appends at the end of the file.
    pub fn allocate(&mut self, length: u64) -> Option<u64> {
        if length == 0 {
            return None;
        }
        let &(found_length, position) = self.by_length.range((length, 0)..).next()?;
        self.remove(position, found_length);
        if found_length > length {
            self.insert(position + length, found_length - length);
        }
        Some(position)
    }

    /// Returns `length` events at `position` to the free pool, merging with
    /// free neighbours on either side.
    ///
    /// # Errors
    ///
    /// Returns [`FreeSpaceError`] if the range is empty or any part of it is
    /// already free.
    pub fn free(&mut self, position: u64, length: u64) -> Result<()> {
        self.check_insert(position, length)?;

        let mut start = position;
        let mut end = position + length;

        if let Some((&prev_pos, &prev_len)) = self.by_position.range(..position).next_back()
            && prev_pos + prev_len == position
        {
            self.remove(prev_pos, prev_len);
            start = prev_pos;
        }
        if let Some(&next_len) = self.by_position.get(&end) {
            self.remove(end, next_len);
            end += next_len;
        }

        self.insert(start, end - start);
        Ok(())
    }

    fn check_insert(&self, position: u64, length: u64) -> Result<()> {
        if length == 0 {
            return Err(FreeSpaceError::EmptyExtent { position }.into());
        }
        let end = position.saturating_add(length);

        if let Some((&prev_pos, &prev_len)) = self.by_position.range(..=position).next_back()
            && prev_pos + prev_len > position
        {
            return Err(FreeSpaceError::Overlap {
                position,
                length,
                existing: prev_pos,
            }
            .into());
        }
        if let Some((&next_pos, _)) = self.by_position.range(position..).next()
            && next_pos < end
        {
            return Err(FreeSpaceError::Overlap {
                position,
                length,
                existing: next_pos,
            }
            .into());
        }
        Ok(())
    }

    fn insert(&mut self, position: u64, length: u64) {
        self.by_position.insert(position, length);
        self.by_length.insert((length, position));
    }

    fn remove(&mut self, position: u64, length: u64) {
        self.by_position.remove(&position);
        self.by_length.remove(&(length, position));
    }
}
