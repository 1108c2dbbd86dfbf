// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Encoding of the records TicKEE persists: the section management object
//! and the block info.

use crate::checksum::{block_info_checksum, crc8};
use crate::pattern;
use byteorder::{ByteOrder, LittleEndian};

/// Unaligned length of the management object.
pub const MANAGEMENT_LEN: usize = 8;
/// Unaligned length of a block info.
pub const BLOCK_INFO_LEN: usize = 10;

const ERASE_COUNTER_OFFSET: usize = 0;
const ERASE_COUNTER_CRC_OFFSET: usize = 4;
const CONFIG_ID_OFFSET: usize = 5;
const SECTION_COUNTER_OFFSET: usize = 6;
const CONFIG_CRC_OFFSET: usize = 7;

/// Per section bookkeeping stored in both header and footer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManagementObject {
    /// Number of times the section was erased.
    pub erase_counter: u32,
    /// Format of the build that prepared the section.
    pub config_id: u8,
    /// Ring position of the section.
    pub section_counter: u8,
}

/// What a management object read back from flash contained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagementState {
    /// Every byte is erased.
    Erased,
    /// The object is intact. `erase_counter` is `None` if only its own
    /// checksum is broken.
    Valid {
        /// The section counter.
        section_counter: u8,
        /// The erase counter, if its checksum holds.
        erase_counter: Option<u32>,
    },
    /// The checksum is wrong.
    Invalid,
    /// Intact, but written by an incompatible configuration.
    Foreign(u8),
}

impl ManagementObject {
    /// Serialise into `buf`, which must hold `MANAGEMENT_LEN` bytes.
    /// Trailing alignment bytes are left erased.
    pub fn encode(&self, buf: &mut [u8]) {
        buf.fill(pattern::ERASED);
        LittleEndian::write_u32(&mut buf[ERASE_COUNTER_OFFSET..], self.erase_counter);
        buf[ERASE_COUNTER_CRC_OFFSET] = crc8(&buf[ERASE_COUNTER_OFFSET..ERASE_COUNTER_CRC_OFFSET]);
        buf[CONFIG_ID_OFFSET] = self.config_id;
        buf[SECTION_COUNTER_OFFSET] = self.section_counter;
        buf[CONFIG_CRC_OFFSET] = crc8(&buf[CONFIG_ID_OFFSET..CONFIG_CRC_OFFSET]);
    }

    /// Parse a management object. `accepts` decides if a config id is
    /// compatible with this build.
    pub fn decode(buf: &[u8], accepts: impl Fn(u8) -> bool) -> ManagementState {
        let buf = &buf[..MANAGEMENT_LEN];
        if pattern::is_erased(buf) {
            return ManagementState::Erased;
        }

        let config_id = buf[CONFIG_ID_OFFSET];
        if crc8(&buf[CONFIG_ID_OFFSET..CONFIG_CRC_OFFSET]) != buf[CONFIG_CRC_OFFSET] {
            return ManagementState::Invalid;
        }
        if !accepts(config_id) {
            return ManagementState::Foreign(config_id);
        }

        let erase_counter = if crc8(&buf[ERASE_COUNTER_OFFSET..ERASE_COUNTER_CRC_OFFSET])
            == buf[ERASE_COUNTER_CRC_OFFSET]
        {
            Some(LittleEndian::read_u32(&buf[ERASE_COUNTER_OFFSET..]))
        } else {
            None
        };

        ManagementState::Valid {
            section_counter: buf[SECTION_COUNTER_OFFSET],
            erase_counter,
        }
    }
}

/// The origin of a block info.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    /// Written on behalf of the user.
    Write,
    /// Copied by a section switch.
    Migration,
    /// Marks the block invalid or inconsistent.
    Invalidation,
}

impl JobKind {
    fn to_byte(self) -> u8 {
        match self {
            JobKind::Write => 0xBB,
            JobKind::Migration => 0xCC,
            JobKind::Invalidation => 0xEE,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0xBB => Some(JobKind::Write),
            0xCC => Some(JobKind::Migration),
            0xEE => Some(JobKind::Invalidation),
            _ => None,
        }
    }
}

/// Describes one occurrence of a block in a section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// The block number.
    pub block_id: u16,
    /// Length of the data. Zero for invalidations.
    pub length: u16,
    /// Where the data is, or the invalid/inconsistent sentinel address.
    pub data_address: u32,
    /// Who wrote the record.
    pub kind: JobKind,
}

const BLOCK_ID_OFFSET: usize = 0;
const LENGTH_OFFSET: usize = 2;
const DATA_ADDRESS_OFFSET: usize = 4;
const KIND_OFFSET: usize = 8;
const CHECKSUM_OFFSET: usize = 9;

impl BlockInfo {
    /// Serialise into `buf`, which must hold `BLOCK_INFO_LEN` bytes.
    pub fn encode(&self, buf: &mut [u8]) {
        buf.fill(pattern::ERASED);
        LittleEndian::write_u16(&mut buf[BLOCK_ID_OFFSET..], self.block_id);
        LittleEndian::write_u16(&mut buf[LENGTH_OFFSET..], self.length);
        LittleEndian::write_u32(&mut buf[DATA_ADDRESS_OFFSET..], self.data_address);
        buf[KIND_OFFSET] = self.kind.to_byte();
        buf[CHECKSUM_OFFSET] = block_info_checksum(&buf[..CHECKSUM_OFFSET]);
    }

    /// Parse a block info, `None` if the checksum or kind is wrong.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if block_info_checksum(&buf[..CHECKSUM_OFFSET]) != buf[CHECKSUM_OFFSET] {
            return None;
        }
        Some(Self {
            block_id: LittleEndian::read_u16(&buf[BLOCK_ID_OFFSET..]),
            length: LittleEndian::read_u16(&buf[LENGTH_OFFSET..]),
            data_address: LittleEndian::read_u32(&buf[DATA_ADDRESS_OFFSET..]),
            kind: JobKind::from_byte(buf[KIND_OFFSET])?,
        })
    }
}
