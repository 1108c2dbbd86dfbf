// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Block location cache.
//!
//! Maps every configured block, and every spare block adopted during the
//! startup scan, to where its newest copy lives. An entry only points at a
//! record whose written marker is confirmed on flash.

use crate::config::BlockConfig;

/// Where the newest copy of a block is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    /// Never written.
    Absent,
    /// Data of `length` bytes at `address`.
    Data {
        /// Flash address of the data.
        address: usize,
        /// Data length.
        length: u16,
    },
    /// Invalidated by a record in `section`.
    Invalid {
        /// Section holding the invalidation.
        section: usize,
    },
    /// Lost. The loss is recorded in `section`, or only in memory if the
    /// marker could not be written yet.
    Inconsistent {
        /// Section holding the inconsistency record.
        section: usize,
    },
}

/// One cache slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    /// Block number, `u16::MAX` for an unused spare.
    pub id: u16,
    /// The newest copy.
    pub location: Location,
}

impl CacheEntry {
    /// An unused entry. Use this to fill the storage handed to `TickEE`.
    pub const EMPTY: CacheEntry = CacheEntry {
        id: u16::MAX,
        location: Location::Absent,
    };
}

/// Position of a block in migration order. Critical blocks go first, then
/// the other configured blocks, then spares; each group by ascending id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderKey {
    rank: u8,
    id: u16,
}

/// The cache over caller provided storage.
pub struct BlockCache<'a> {
    blocks: &'a [BlockConfig],
    entries: &'a mut [CacheEntry],
    spares: usize,
}

impl<'a> BlockCache<'a> {
    pub(crate) fn new(blocks: &'a [BlockConfig], entries: &'a mut [CacheEntry]) -> Self {
        for (entry, block) in entries.iter_mut().zip(blocks.iter()) {
            *entry = CacheEntry {
                id: block.id,
                location: Location::Absent,
            };
        }
        for entry in entries[blocks.len()..].iter_mut() {
            *entry = CacheEntry::EMPTY;
        }
        Self {
            blocks,
            entries,
            spares: 0,
        }
    }

    /// Forget every location, keeping the configured ids.
    pub fn clear(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.location = Location::Absent;
        }
        for entry in self.entries[self.blocks.len()..].iter_mut() {
            entry.id = u16::MAX;
        }
        self.spares = 0;
    }

    /// Number of entries in use.
    pub fn len(&self) -> usize {
        self.blocks.len() + self.spares
    }

    /// Index of block `id`.
    pub fn index_of(&self, id: u16) -> Option<usize> {
        self.entries[..self.len()].iter().position(|e| e.id == id)
    }

    /// True if `index` is a configured block.
    pub fn is_configured(&self, index: usize) -> bool {
        index < self.blocks.len()
    }

    /// Take a spare entry for block `id` found on flash.
    pub fn adopt_spare(&mut self, id: u16) -> Option<usize> {
        let index = self.len();
        let entry = self.entries.get_mut(index)?;
        entry.id = id;
        entry.location = Location::Absent;
        self.spares += 1;
        Some(index)
    }

    /// The configuration of a configured block.
    pub fn config(&self, index: usize) -> Option<&BlockConfig> {
        self.blocks.get(index)
    }

    /// The block id at `index`.
    pub fn id(&self, index: usize) -> u16 {
        self.entries[index].id
    }

    /// The location of the block at `index`.
    pub fn get(&self, index: usize) -> Location {
        self.entries[index].location
    }

    /// Point the block at `index` to a confirmed record.
    pub fn set(&mut self, index: usize, location: Location) {
        self.entries[index].location = location;
    }

    /// All entries in use.
    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries[..self.len()]
    }

    fn order_key(&self, index: usize) -> OrderKey {
        let rank = match self.blocks.get(index) {
            Some(block) if block.critical => 0,
            Some(_) => 1,
            None => 2,
        };
        OrderKey {
            rank,
            id: self.entries[index].id,
        }
    }

    /// The block following `after` in migration order.
    pub fn next_in_order(&self, after: Option<OrderKey>) -> Option<(usize, OrderKey)> {
        (0..self.len())
            .map(|i| (i, self.order_key(i)))
            .filter(|(_, key)| after.is_none_or(|a| *key > a))
            .min_by_key(|(_, key)| *key)
    }
}
