// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Writing one block record, shared by user jobs and the section switch.
//!
//! A record is written as a sequence of flash jobs:
//!
//!  1. the info slot: optional start pattern and block info
//!  2. the info end pattern, if enabled
//!  3. the data, one chunk per job
//!  4. the written marker
//!
//! Invalidation records stop after step 2.

use crate::buffer_pool::Requester;
use crate::cursors::Reservation;
use crate::error_codes::ErrorCode;
use crate::flash_controller::FlashController;
use crate::pattern::{self, Marker};
use crate::records::BlockInfo;
use crate::tickee::{Step, TickEE};

/// Where the bytes of a record come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Payload<'a> {
    /// Data handed in by the user.
    User(&'a [u8]),
    /// An older copy on flash.
    Flash(usize),
    /// No data, the record is an invalidation.
    Nothing,
}

/// The flash job a record is at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordStep {
    /// Program the block info.
    Info,
    /// Program the pattern closing the block info.
    InfoEndPattern,
    /// Program data from `offset` on.
    Data {
        /// Bytes already on flash.
        offset: usize,
    },
    /// Program the written marker.
    WrittenMarker,
}

/// Progress of one record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordProgress {
    /// Space claimed for the record.
    pub reservation: Reservation,
    /// The block info being written.
    pub info: BlockInfo,
    /// The next flash job.
    pub step: RecordStep,
    chunk: usize,
    accepted: bool,
}

/// What the last completed job meant for the record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RecordOutcome {
    /// More jobs follow.
    Continue(RecordProgress),
    /// The record is complete on flash.
    Done(RecordProgress),
}

impl RecordProgress {
    pub(crate) fn new(reservation: Reservation, info: BlockInfo) -> Self {
        Self {
            reservation,
            info,
            step: RecordStep::Info,
            chunk: 0,
            accepted: false,
        }
    }

    fn is_invalidation(&self) -> bool {
        self.info.length == 0
    }
}

impl<'a, C: FlashController, const N: usize> TickEE<'a, C, N> {
    /// Issue the next flash job of `record`.
    ///
    /// Returns the updated progress. `Err(ErrorCode::ReadFail)` means the
    /// payload could not be read from flash, `Err(ErrorCode::ReadNotReady)`
    /// that the same job has to be issued again later.
    pub(crate) fn record_issue(
        &mut self,
        owner: Requester,
        mut record: RecordProgress,
        payload: Payload<'a>,
    ) -> Result<(RecordProgress, Step), ErrorCode> {
        let layout = self.layout;
        let slot = record.reservation.slot;

        let step = match record.step {
            RecordStep::Info => {
                let len = layout.info_write_len();
                let buf = self.pool.allocate(owner, len)?;
                let bytes = &mut self.pool.get_mut(buf)[..len];
                bytes.fill(pattern::ERASED);
                if layout.pattern_mode().has_start() {
                    pattern::encode(&mut bytes[..layout.pattern_len()]);
                }
                record.info.encode(&mut bytes[layout.info_offset()..]);
                self.issue_write(owner, slot, buf, len)
            }
            RecordStep::InfoEndPattern => {
                let len = layout.pattern_len();
                let buf = self.pool.allocate(owner, len)?;
                pattern::encode(&mut self.pool.get_mut(buf)[..len]);
                self.issue_write(owner, slot + layout.info_end_pattern_offset(), buf, len)
            }
            RecordStep::WrittenMarker => {
                let len = layout.pattern_len();
                let buf = self.pool.allocate(owner, len)?;
                Marker::Written.encode(&mut self.pool.get_mut(buf)[..len]);
                self.issue_write(owner, slot + layout.written_marker_offset(), buf, len)
            }
            RecordStep::Data { offset } => {
                let total = record.reservation.data_len;
                let page = layout.pattern_len();
                let wanted = (total - offset).min(self.pool.largest() / page * page);
                let buf = self.pool.allocate(owner, wanted)?;
                let chunk = wanted.min(self.pool.get(buf).len() / page * page);
                let bytes = &mut self.pool.get_mut(buf)[..chunk];

                match payload {
                    Payload::User(data) => {
                        bytes.fill(pattern::ERASED);
                        if offset < data.len() {
                            let end = data.len().min(offset + chunk);
                            bytes[..end - offset].copy_from_slice(&data[offset..end]);
                        }
                    }
                    Payload::Flash(source) => {
                        if let Err(e) = self.controller.read(source + offset, bytes) {
                            self.pool.release(buf);
                            return Err(e);
                        }
                    }
                    Payload::Nothing => {
                        self.pool.release(buf);
                        return Err(ErrorCode::InvalidLength);
                    }
                }

                record.chunk = chunk;
                self.issue_write(owner, record.reservation.data + offset, buf, chunk)
            }
        };

        if step == Step::Yield {
            record.accepted = true;
        }
        Ok((record, step))
    }

    /// Give up on `record` after its retries ran out.
    ///
    /// The space goes back to the cursors only if nothing of the record can
    /// be on flash: no job was accepted, or only the block info job was and
    /// the slot still reads back erased. Otherwise it stays allocated like
    /// the space of a torn record.
    pub(crate) fn record_abandon(&mut self, owner: Requester, record: &RecordProgress) {
        if !record.accepted || self.slot_erased(owner, record) {
            self.cursors.rollback(&self.layout, &record.reservation);
        }
    }

    fn slot_erased(&mut self, owner: Requester, record: &RecordProgress) -> bool {
        if record.step != RecordStep::Info {
            return false;
        }
        let len = self.layout.slot_len();
        let buf = match self.pool.allocate(owner, len) {
            Ok(buf) => buf,
            Err(_) => return false,
        };
        let bytes = &mut self.pool.get_mut(buf)[..len];
        let erased = self.controller.read(record.reservation.slot, bytes).is_ok()
            && pattern::is_erased(bytes);
        self.pool.release(buf);
        erased
    }

    /// Move `record` on after its last job completed successfully.
    pub(crate) fn record_advance(&self, mut record: RecordProgress) -> RecordOutcome {
        let has_end = self.layout.pattern_mode().has_end();
        record.step = match record.step {
            RecordStep::Info if has_end => RecordStep::InfoEndPattern,
            RecordStep::Info | RecordStep::InfoEndPattern => {
                if record.is_invalidation() {
                    return RecordOutcome::Done(record);
                }
                RecordStep::Data { offset: 0 }
            }
            RecordStep::Data { offset } => {
                let offset = offset + record.chunk;
                if offset >= record.reservation.data_len {
                    RecordStep::WrittenMarker
                } else {
                    RecordStep::Data { offset }
                }
            }
            RecordStep::WrittenMarker => return RecordOutcome::Done(record),
        };
        RecordOutcome::Continue(record)
    }
}
