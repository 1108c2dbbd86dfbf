// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Checksums protecting the on-flash management records.

use crc_any::CRCu8;

/// CRC-8 SAE J1850 (poly 0x1D, init 0xFF, xor-out 0xFF, not reflected).
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = CRCu8::create_crc(0x1D, 8, 0xFF, 0xFF, false);
    crc.digest(data);
    crc.get_crc()
}

/// Checksum of a block info: the byte sum, xor 0xAA.
pub fn block_info_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) ^ 0xAA
}
