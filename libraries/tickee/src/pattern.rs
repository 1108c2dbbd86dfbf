// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Consistency patterns and status markers.
//!
//! A record is only trusted once every pattern it carries reads back whole.
//! The end pattern is always programmed by a separate flash job after the
//! record body has been confirmed, so a torn body never has a valid end
//! pattern.
//!
//! Markers are different: they are single-purpose stamps, and a marker
//! that was only partly programmed still counts as set.

/// The value of an erased flash byte.
pub const ERASED: u8 = 0xFF;
/// Fill byte of the consistency pattern.
pub const CONSISTENCY_PATTERN: u8 = 0x77;

/// Which consistency patterns bracket a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatternMode {
    /// Records carry no pattern.
    None,
    /// Records are terminated by an end pattern.
    End,
    /// Records carry a start pattern (written with the body) and an end
    /// pattern.
    StartAndEnd,
}

impl PatternMode {
    /// True if records carry an end pattern.
    pub fn has_end(self) -> bool {
        self != PatternMode::None
    }

    /// True if records carry a start pattern.
    pub fn has_start(self) -> bool {
        self == PatternMode::StartAndEnd
    }
}

/// Single-purpose stamps written into section headers and info slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    /// The section holds live data.
    Active,
    /// The section may be erased.
    Erasable,
    /// The data of a block landed completely.
    Written,
}

impl Marker {
    /// The byte value a marker field is filled with.
    pub fn value(self) -> u8 {
        match self {
            Marker::Active => 0xAA,
            Marker::Erasable => 0xDD,
            Marker::Written => 0x96,
        }
    }

    /// Fill `buf` with the marker value.
    pub fn encode(self, buf: &mut [u8]) {
        buf.fill(self.value());
    }

    /// A marker is set if at least one byte carries its value.
    pub fn is_set(self, bytes: &[u8]) -> bool {
        bytes.iter().any(|b| *b == self.value())
    }
}

/// Fill `buf` with the consistency pattern.
pub fn encode(buf: &mut [u8]) {
    buf.fill(CONSISTENCY_PATTERN);
}

/// True if `bytes` hold a complete consistency pattern.
pub fn is_valid(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes.iter().all(|b| *b == CONSISTENCY_PATTERN)
}

/// True if every byte of `bytes` is erased.
pub fn is_erased(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| *b == ERASED)
}
