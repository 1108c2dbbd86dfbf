// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Static configuration of a TicKEE instance.

use crate::error_codes::ErrorCode;
use crate::layout::Layout;
use crate::pattern::PatternMode;

/// Maximum number of sections. Section counters are a `u8`.
pub const MAX_SECTIONS: usize = 255;

/// A block the application knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockConfig {
    /// Stable block number.
    pub id: u16,
    /// Data length in bytes.
    pub size: u16,
    /// Critical blocks are migrated before all others. Once written, a
    /// critical block freezes the engine: only reads and erasures of it
    /// are accepted and background work waits until it is erased.
    pub critical: bool,
}

impl BlockConfig {
    /// A non critical block.
    pub const fn new(id: u16, size: u16) -> Self {
        Self {
            id,
            size,
            critical: false,
        }
    }

    /// A critical block.
    pub const fn critical(id: u16, size: u16) -> Self {
        Self {
            id,
            size,
            critical: true,
        }
    }
}

/// Geometry and format options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Flash address of the first section.
    pub flash_base: usize,
    /// Size of one section. Must be a multiple of the erase unit.
    pub section_size: usize,
    /// Virtual page size. Every field is aligned to it.
    pub page_size: usize,
    /// Consistency patterns carried by records.
    pub pattern_mode: PatternMode,
    /// Number of info slots that must stay free in a section.
    pub margin: usize,
    /// Identifies the on-flash format of this build.
    pub config_id: u8,
    /// A previous format that can still be read.
    pub legacy_config_id: Option<u8>,
    /// Largest spare block, adopted from flash or written with
    /// `TickEE::write_custom()`.
    pub spare_block_size: u16,
}

impl Config {
    /// A configuration with end patterns, a margin of two slots and
    /// 8 byte pages.
    pub const fn new(flash_base: usize, section_size: usize) -> Self {
        Self {
            flash_base,
            section_size,
            page_size: 8,
            pattern_mode: PatternMode::End,
            margin: 2,
            config_id: 1,
            legacy_config_id: None,
            spare_block_size: 0,
        }
    }

    /// True if sections stamped with `id` were written by a compatible
    /// build.
    pub fn accepts_config_id(&self, id: u8) -> bool {
        id == self.config_id || self.legacy_config_id == Some(id)
    }

    /// Check that an engine with `sections` sections can run the given
    /// block table without ever stalling a switch.
    pub(crate) fn validate(
        &self,
        sections: usize,
        blocks: &[BlockConfig],
        cache_len: usize,
        management_buffer: usize,
        data_buffer: usize,
    ) -> Result<Layout, ErrorCode> {
        if sections < 3 || sections > MAX_SECTIONS {
            return Err(ErrorCode::InvalidConfig);
        }
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(ErrorCode::InvalidConfig);
        }
        if self.section_size % self.page_size != 0 || self.margin == 0 {
            return Err(ErrorCode::InvalidConfig);
        }
        if self.config_id == 0xFF || cache_len < blocks.len() {
            return Err(ErrorCode::InvalidConfig);
        }

        for (i, block) in blocks.iter().enumerate() {
            if block.size == 0 || block.id == u16::MAX {
                return Err(ErrorCode::InvalidConfig);
            }
            if blocks[i + 1..].iter().any(|b| b.id == block.id) {
                return Err(ErrorCode::InvalidConfig);
            }
        }

        let layout = Layout::new(self);
        if management_buffer < layout.header_len().max(layout.slot_len()) {
            return Err(ErrorCode::BufferTooSmall);
        }
        if data_buffer < self.page_size {
            return Err(ErrorCode::BufferTooSmall);
        }

        let spares = cache_len - blocks.len();
        let largest = blocks
            .iter()
            .map(|b| b.size)
            .chain(core::iter::once(self.spare_block_size))
            .max()
            .unwrap_or(0) as usize;

        // The whole live set, a block lost to a torn write and the margin
        // must fit in one empty section.
        let live: usize = blocks
            .iter()
            .map(|b| layout.record_len(b.size as usize))
            .sum::<usize>()
            + spares * layout.record_len(self.spare_block_size as usize);
        let needed = live + layout.record_len(largest) + (self.margin + 1) * layout.slot_len();
        if needed > layout.usable_len() {
            return Err(ErrorCode::InvalidConfig);
        }

        Ok(layout)
    }
}
