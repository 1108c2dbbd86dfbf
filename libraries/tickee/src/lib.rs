// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! # TicKEE
//!
//! TicKEE (Tiny Circular EEPROM Emulation) stores a fixed set of numbered
//! blocks on raw flash and survives a power loss at any point.
//!
//! ## Goals of TicKEE
//!
//! TicKEE is designed with these main goals (in order)
//!
//!  * Fully implemented in no_std Rust
//!  * Power loss resilient
//!  * Never blocks the caller: all work runs in small steps from a
//!    periodic `main_function()`
//!  * Wear leveling
//!  * Low memory usage: every buffer is handed in by the caller
//!
//! ## How TicKEE works
//!
//! The flash area is split into `N` equally sized sections arranged as a
//! ring. Every section carries a header at its start and a mirrored footer
//! at its end. Both hold a management object (erase counter, config id and
//! a section counter giving the ring position) and the markers stamping
//! the section active or erasable. Either copy alone is enough to recover
//! the status of a section after a power loss.
//!
//! Exactly one section is active and receives all writes. Block data grows
//! up from its header, info slots describing the data grow down from its
//! footer. A block is written as
//!
//!  1. the info slot (block id, length, data address, checksum)
//!  2. the data
//!  3. the written marker of the slot
//!
//! and only a block whose written marker is on flash is ever returned to
//! the user.
//!
//! When the active section is full the next prepared section is activated.
//! Once the active section has moved half way around the ring from the
//! oldest section the section switch copies every block whose newest copy
//! still lives in the oldest section into the active one, after which the
//! oldest section is stamped erasable, erased and prepared again.
//!
//! On `init()` TicKEE reads every header and footer, finds the active and
//! oldest sections and walks their info slots to rebuild the block cache.
//! Sections left half prepared, half activated or half retired are repaired
//! in the background.
//!
//! # Using TicKEE
//!
//! To use TicKEE first implement the `FlashController` trait. Then create a
//! TicKEE instance and call `main_function()` periodically.
//!
//! ```rust
//! use core::cell::RefCell;
//! use tickee::cache::CacheEntry;
//! use tickee::config::{BlockConfig, Config};
//! use tickee::error_codes::ErrorCode;
//! use tickee::flash_controller::{FlashController, JobResult};
//! use tickee::tickee::{EngineStatus, UserJobResult};
//! use tickee::TickEE;
//!
//! struct FlashCtrl {
//!     buf: RefCell<[u8; 4 * 1024]>,
//! }
//!
//! impl FlashController for FlashCtrl {
//!     fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), ErrorCode> {
//!         buf.copy_from_slice(&self.buf.borrow()[address..address + buf.len()]);
//!         Ok(())
//!     }
//!
//!     fn write(&self, address: usize, buf: &[u8]) -> Result<(), ErrorCode> {
//!         for (i, d) in buf.iter().enumerate() {
//!             self.buf.borrow_mut()[address + i] &= *d;
//!         }
//!         Ok(())
//!     }
//!
//!     fn erase(&self, address: usize, len: usize) -> Result<(), ErrorCode> {
//!         self.buf.borrow_mut()[address..address + len].fill(0xFF);
//!         Ok(())
//!     }
//!
//!     fn job_result(&self) -> JobResult {
//!         JobResult::Complete
//!     }
//! }
//!
//! static BLOCKS: [BlockConfig; 2] = [BlockConfig::new(1, 16), BlockConfig::new(2, 16)];
//! static VALUE: [u8; 16] = [0x23; 16];
//!
//! let mut cache = [CacheEntry::EMPTY; 2];
//! let mut management = [0; 64];
//! let mut data = [0; 64];
//! let mut out = [0; 16];
//!
//! let mut tickee = TickEE::<FlashCtrl, 4>::new(
//!     FlashCtrl {
//!         buf: RefCell::new([0xFF; 4 * 1024]),
//!     },
//!     Config::new(0, 1024),
//!     &BLOCKS,
//!     &mut cache,
//!     &mut management,
//!     &mut data,
//! )
//! .unwrap();
//! tickee.init().unwrap();
//!
//! // Store a block
//! tickee.write(1, &VALUE).unwrap();
//! while tickee.job_result() == UserJobResult::Pending {
//!     tickee.main_function();
//! }
//! assert_eq!(tickee.job_result(), UserJobResult::Ok);
//!
//! // Get the same block back
//! tickee.read(1, 0, &mut out).unwrap();
//! while tickee.job_result() == UserJobResult::Pending {
//!     tickee.main_function();
//! }
//! assert_eq!(tickee.take_read_buffer().unwrap(), &VALUE[..]);
//!
//! // Let the background work finish
//! while tickee.status() != EngineStatus::Idle {
//!     tickee.main_function();
//! }
//! ```
//!
//! # Power loss protection
//!
//! A power loss can only lose the request being written at that moment.
//! Everything TicKEE changes is stamped last: a record by its written
//! marker, a section by its markers. Torn records are detected by their
//! checksum and consistency patterns and skipped.
//!
//! A block whose copy cannot be read back during a section switch is
//! recorded as inconsistent and reads of it report
//! `UserJobResult::BlockInconsistent`.
//!
//! # Spare and critical blocks
//!
//! Blocks outside the configured table are written with `write_custom()`
//! and read with `read_custom()`. They take one of the spare cache entries,
//! as do unknown blocks found on flash during startup.
//!
//! Writing a configured block marked critical freezes the engine. Only
//! reads and `erase_immediate()` of that block are accepted until the
//! erasure completes, and background work waits meanwhile.

#![no_std]
#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod buffer_pool;
pub mod cache;
pub mod checksum;
pub mod config;
pub mod cursors;
pub mod error_codes;
pub mod flash_controller;
pub mod layout;
pub mod lifecycle;
pub mod pattern;
pub mod record;
pub mod records;
pub mod registry;
mod startup;
pub mod success_codes;
pub mod switch;
pub mod tickee;

// Use this to generate nicer docs
#[doc(inline)]
pub use crate::error_codes::ErrorCode;
#[doc(inline)]
pub use crate::flash_controller::FlashController;
#[doc(inline)]
pub use crate::tickee::TickEE;

// This is used to run the tests on a host
#[cfg(test)]
#[macro_use]
extern crate std;

#[cfg(test)]
mod tests;
