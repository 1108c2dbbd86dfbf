// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Byte offsets of everything TicKEE places in a section.
//!
//! ```text
//!  section start
//!  +------------------------------------------------------------+
//!  | erasable marker | management | [end pattern] | active mark | header
//!  +------------------------------------------------------------+
//!  | data 0 | data 1 | ...  --> grows up                         |
//!  |                                                            |
//!  |                   free, margin protected                   |
//!  |                                                            |
//!  |                        grows down <-- ... | info 1 | info 0 |
//!  +------------------------------------------------------------+
//!  | active mark | management | [end pattern] | erasable marker | footer
//!  +------------------------------------------------------------+
//!  section end
//! ```
//!
//! Every info slot is laid out as
//! `[start pattern] block info [end pattern] written marker`.

use crate::config::Config;
use crate::pattern::PatternMode;
use crate::records::{BLOCK_INFO_LEN, MANAGEMENT_LEN};

/// Fields of a section header or footer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    /// Set when the section is to be erased.
    ErasableMarker,
    /// The management object.
    Management,
    /// Consistency pattern closing the management object.
    EndPattern,
    /// Set when the section holds live data.
    ActiveMarker,
}

/// Which copy of the section management a field belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// At the section start.
    Header,
    /// At the section end.
    Footer,
}

/// The computed geometry. All addresses are absolute flash addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    base: usize,
    section_size: usize,
    page: usize,
    mode: PatternMode,
    margin: usize,
    management_len: usize,
    info_len: usize,
}

impl Layout {
    pub(crate) fn new(config: &Config) -> Self {
        let page = config.page_size;
        Self {
            base: config.flash_base,
            section_size: config.section_size,
            page,
            mode: config.pattern_mode,
            margin: config.margin,
            management_len: align_to(MANAGEMENT_LEN, page),
            info_len: align_to(BLOCK_INFO_LEN, page),
        }
    }

    /// Round `len` up to the virtual page size.
    pub fn align(&self, len: usize) -> usize {
        align_to(len, self.page)
    }

    /// Size of a section.
    pub fn section_size(&self) -> usize {
        self.section_size
    }

    /// The configured pattern mode.
    pub fn pattern_mode(&self) -> PatternMode {
        self.mode
    }

    /// Number of info slots that must stay free.
    pub fn margin(&self) -> usize {
        self.margin
    }

    /// Length of a pattern or marker field.
    pub fn pattern_len(&self) -> usize {
        self.page
    }

    /// Length of the management object on flash.
    pub fn management_len(&self) -> usize {
        self.management_len
    }

    /// Length of a header, and of a footer.
    pub fn header_len(&self) -> usize {
        let pattern = if self.mode.has_end() { self.page } else { 0 };
        2 * self.page + self.management_len + pattern
    }

    /// Offset and length of `field` inside the header or footer.
    pub fn field(&self, side: Side, field: Field) -> (usize, usize) {
        let first = self.page;
        let pattern = first + self.management_len;
        let last = self.header_len() - self.page;
        match (side, field) {
            (_, Field::Management) => (first, self.management_len),
            (_, Field::EndPattern) => (pattern, self.page),
            (Side::Header, Field::ErasableMarker) | (Side::Footer, Field::ActiveMarker) => {
                (0, self.page)
            }
            (Side::Header, Field::ActiveMarker) | (Side::Footer, Field::ErasableMarker) => {
                (last, self.page)
            }
        }
    }

    /// Flash address of `field` in section `section`.
    pub fn field_address(&self, section: usize, side: Side, field: Field) -> usize {
        let start = match side {
            Side::Header => self.section_start(section),
            Side::Footer => self.footer_start(section),
        };
        start + self.field(side, field).0
    }

    /// First address of a section.
    pub fn section_start(&self, section: usize) -> usize {
        self.base + section * self.section_size
    }

    /// One past the last address of a section.
    pub fn section_end(&self, section: usize) -> usize {
        self.section_start(section) + self.section_size
    }

    /// Address of the footer.
    pub fn footer_start(&self, section: usize) -> usize {
        self.section_end(section) - self.header_len()
    }

    /// Where the first data record of a section goes.
    pub fn data_start(&self, section: usize) -> usize {
        self.section_start(section) + self.header_len()
    }

    /// Address of the first (highest) info slot.
    pub fn first_slot(&self, section: usize) -> usize {
        self.footer_start(section) - self.slot_len()
    }

    /// Bytes between header and footer.
    pub fn usable_len(&self) -> usize {
        self.section_size.saturating_sub(2 * self.header_len())
    }

    /// Length of one info slot.
    pub fn slot_len(&self) -> usize {
        let start = if self.mode.has_start() { self.page } else { 0 };
        let end = if self.mode.has_end() { self.page } else { 0 };
        start + self.info_len + end + self.page
    }

    /// Offset of the block info inside a slot.
    pub fn info_offset(&self) -> usize {
        if self.mode.has_start() {
            self.page
        } else {
            0
        }
    }

    /// Length of the first program job of a slot: the optional start
    /// pattern and the block info.
    pub fn info_write_len(&self) -> usize {
        self.info_offset() + self.info_len
    }

    /// Offset of the end pattern inside a slot.
    pub fn info_end_pattern_offset(&self) -> usize {
        self.info_write_len()
    }

    /// Offset of the written marker inside a slot.
    pub fn written_marker_offset(&self) -> usize {
        self.slot_len() - self.page
    }

    /// Flash space taken by a block with `len` data bytes.
    pub fn record_len(&self, len: usize) -> usize {
        self.align(len) + self.slot_len()
    }

    /// The data address recorded by an invalidation of a block.
    pub fn invalid_address(&self, section: usize) -> u32 {
        self.section_start(section) as u32
    }

    /// The data address recorded when a block was lost.
    pub fn inconsistent_address(&self, section: usize) -> u32 {
        self.section_start(section) as u32 + 1
    }

    /// The section `address` falls into, if any.
    pub fn section_of(&self, address: usize, sections: usize) -> Option<usize> {
        if address < self.base {
            return None;
        }
        let section = (address - self.base) / self.section_size;
        if section < sections {
            Some(section)
        } else {
            None
        }
    }
}

/// Round `len` up to a multiple of `page`.
pub fn align_to(len: usize, page: usize) -> usize {
    len.div_ceil(page) * page
}
