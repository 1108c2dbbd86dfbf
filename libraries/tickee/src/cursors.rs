// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The two bump allocators of the active section.
//!
//! Data grows up from the header, info slots grow down from the footer.
//! After every allocation at least `margin` whole info slots stay free
//! between them.

use crate::error_codes::ErrorCode;
use crate::layout::Layout;

/// Address of the next free data byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DataCursor(pub usize);

/// Address of the next free info slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct InfoCursor(pub usize);

/// Space claimed for one record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reservation {
    /// Address of the info slot.
    pub slot: usize,
    /// Address of the data.
    pub data: usize,
    /// Aligned data length.
    pub data_len: usize,
}

/// The cursors of one section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cursors {
    section: usize,
    data: DataCursor,
    info: InfoCursor,
}

impl Cursors {
    /// Cursors of an empty section.
    pub fn new(layout: &Layout, section: usize) -> Self {
        Self {
            section,
            data: DataCursor(layout.data_start(section)),
            info: InfoCursor(layout.first_slot(section)),
        }
    }

    /// Cursors recovered by a startup scan.
    pub fn recovered(section: usize, data: DataCursor, info: InfoCursor) -> Self {
        Self {
            section,
            data,
            info,
        }
    }

    /// The section these cursors belong to.
    pub fn section(&self) -> usize {
        self.section
    }

    /// The data cursor.
    pub fn data(&self) -> DataCursor {
        self.data
    }

    /// The info cursor.
    pub fn info(&self) -> InfoCursor {
        self.info
    }

    /// Bytes that can still be allocated, slot included, without eating
    /// into the margin.
    pub fn free_space(&self, layout: &Layout) -> usize {
        let slot = layout.slot_len();
        (self.info.0 + slot).saturating_sub(self.data.0 + layout.margin() * slot)
    }

    /// True if a record with `data_len` data bytes plus `extra` bytes fit.
    pub fn fits(&self, layout: &Layout, data_len: usize, extra: usize) -> bool {
        self.free_space(layout) >= layout.record_len(data_len) + extra
    }

    /// Claim a slot and `data_len` bytes of data.
    pub fn reserve(&mut self, layout: &Layout, data_len: usize) -> Result<Reservation, ErrorCode> {
        if !self.fits(layout, data_len, 0) {
            return Err(ErrorCode::InvalidLength);
        }

        let reservation = Reservation {
            slot: self.info.0,
            data: self.data.0,
            data_len: layout.align(data_len),
        };
        self.data = DataCursor(self.data.0 + reservation.data_len);
        self.info = InfoCursor(self.info.0 - layout.slot_len());

        debug_assert!(
            self.data.0 + layout.margin() * layout.slot_len() <= self.info.0 + layout.slot_len()
        );
        Ok(reservation)
    }

    /// Give `reservation` back so the record can be written again.
    ///
    /// Only the most recent reservation can be returned. Space of an older
    /// one stays allocated and is reclaimed by the next switch.
    pub fn rollback(&mut self, layout: &Layout, reservation: &Reservation) -> bool {
        let latest = self.data.0 == reservation.data + reservation.data_len
            && self.info.0 + layout.slot_len() == reservation.slot;
        if latest {
            self.data = DataCursor(reservation.data);
            self.info = InfoCursor(reservation.slot);
        }
        latest
    }
}
