// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The section switch.
//!
//! Copies every block whose newest copy lives in the oldest section into
//! the active section, then hands the oldest section to the lifecycle state
//! machine for retirement. Blocks are visited critical first, then by
//! ascending id, spares last.
//!
//! The switch keeps its position in [`SwitchCheckpoint`]. User jobs run
//! between any two of its flash jobs and it continues from the checkpoint.

use crate::buffer_pool::Requester;
use crate::cache::{Location, OrderKey};
use crate::error_codes::ErrorCode;
use crate::flash_controller::FlashController;
use crate::record::{Payload, RecordOutcome, RecordProgress};
use crate::records::{BlockInfo, JobKind};
use crate::registry::SectionStatus;
use crate::tickee::{Mode, Step, TickEE};
use tracing::{debug, info, warn};

/// Where the section switch is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchCheckpoint {
    /// No switch running.
    Idle,
    /// Pick the block following `after`.
    SelectNextBlock {
        /// The block handled last.
        after: Option<OrderKey>,
    },
    /// Copy one block.
    Copy {
        /// Cache index of the block.
        index: usize,
        /// Position in migration order.
        key: OrderKey,
        /// The copy being migrated.
        source: Location,
        /// The record written so far, `None` until space is reserved.
        record: Option<RecordProgress>,
        /// Failed reads of the source.
        read_failures: u8,
    },
    /// Every block moved, the oldest section is to be retired.
    Retire,
    /// The lifecycle state machine retires the oldest section.
    Retiring,
}

impl SwitchCheckpoint {
    /// Cache index of the block being copied.
    pub fn block(&self) -> Option<usize> {
        match self {
            SwitchCheckpoint::Copy { index, .. } => Some(*index),
            _ => None,
        }
    }
}

impl<'a, C: FlashController, const N: usize> TickEE<'a, C, N> {
    /// True if a switch should start now.
    pub(crate) fn switch_due(&self) -> bool {
        self.mode == Mode::Running
            && self.switch == SwitchCheckpoint::Idle
            && self.registry.status(self.registry.active) == SectionStatus::Active
            && (self.urgent || self.registry.needs_switch())
    }

    pub(crate) fn start_switch(&mut self) {
        info!(
            oldest = self.registry.oldest,
            active = self.registry.active,
            urgent = self.urgent,
            "section switch started"
        );
        self.switch = SwitchCheckpoint::SelectNextBlock { after: None };
    }

    pub(crate) fn switch_step(&mut self) -> Step {
        match self.switch {
            SwitchCheckpoint::Idle | SwitchCheckpoint::Retire | SwitchCheckpoint::Retiring => {
                Step::Yield
            }
            SwitchCheckpoint::SelectNextBlock { after } => self.select_block(after),
            SwitchCheckpoint::Copy {
                index,
                key,
                source,
                record,
                read_failures,
            } => {
                let record = match record {
                    Some(record) => record,
                    None => match self.reserve_copy(index, source) {
                        Some(record) => record,
                        None => return Step::Yield,
                    },
                };
                self.copy_block(index, key, source, record, read_failures)
            }
        }
    }

    fn select_block(&mut self, after: Option<OrderKey>) -> Step {
        let (index, key) = match self.cache.next_in_order(after) {
            Some(next) => next,
            None => {
                debug!(section = self.registry.oldest, "migration complete");
                self.switch = SwitchCheckpoint::Retire;
                return Step::Continue;
            }
        };

        let source = self.cache.get(index);
        if self.location_section(source) != Some(self.registry.oldest) {
            self.switch = SwitchCheckpoint::SelectNextBlock { after: Some(key) };
            return Step::Continue;
        }
        if self.user_record_in_flight() == Some(index) {
            return Step::Yield;
        }

        self.switch = SwitchCheckpoint::Copy {
            index,
            key,
            source,
            record: None,
            read_failures: 0,
        };
        Step::Continue
    }

    /// Claim space in the active section for a copy of `source`.
    fn reserve_copy(&mut self, index: usize, source: Location) -> Option<RecordProgress> {
        if self.registry.status(self.registry.active) != SectionStatus::Active {
            return None;
        }

        let length = match source {
            Location::Data { length, .. } => length,
            _ => 0,
        };
        if !self.cursors.fits(&self.layout, length as usize, 0) {
            self.request_section_change();
            return None;
        }
        let reservation = self.cursors.reserve(&self.layout, length as usize).ok()?;
        let section = self.cursors.section();

        let (data_address, kind) = match source {
            Location::Data { .. } => (reservation.data as u32, JobKind::Migration),
            Location::Inconsistent { .. } => (
                self.layout.inconsistent_address(section),
                JobKind::Invalidation,
            ),
            _ => (self.layout.invalid_address(section), JobKind::Invalidation),
        };
        let info = BlockInfo {
            block_id: self.cache.id(index),
            length,
            data_address,
            kind,
        };
        Some(RecordProgress::new(reservation, info))
    }

    fn copy_block(
        &mut self,
        index: usize,
        key: OrderKey,
        source: Location,
        record: RecordProgress,
        read_failures: u8,
    ) -> Step {
        let payload = match source {
            Location::Data { address, .. } => Payload::Flash(address),
            _ => Payload::Nothing,
        };

        let (record, read_failures, step) =
            match self.record_issue(Requester::Switch, record, payload) {
                Ok((record, step)) => (record, read_failures, step),
                Err(ErrorCode::ReadFail) if read_failures == 0 => (record, 1, Step::Yield),
                Err(ErrorCode::ReadFail) => {
                    self.lose_block(index, key);
                    return Step::Continue;
                }
                Err(_) => (record, read_failures, Step::Yield),
            };

        self.switch = SwitchCheckpoint::Copy {
            index,
            key,
            source,
            record: Some(record),
            read_failures,
        };
        step
    }

    /// The source of a block cannot be read. The block is recorded as
    /// inconsistent in the active section instead.
    fn lose_block(&mut self, index: usize, key: OrderKey) {
        let oldest = self.registry.oldest;
        warn!(
            block = self.cache.id(index),
            section = oldest,
            error = ?ErrorCode::RecordInconsistent,
            "block lost during section switch"
        );
        let source = Location::Inconsistent { section: oldest };
        self.cache.set(index, source);
        self.switch = SwitchCheckpoint::Copy {
            index,
            key,
            source,
            record: None,
            read_failures: 0,
        };
    }

    pub(crate) fn switch_complete(&mut self, ok: bool) {
        let (index, key, source, record, read_failures) = match self.switch {
            SwitchCheckpoint::Copy {
                index,
                key,
                source,
                record: Some(record),
                read_failures,
            } => (index, key, source, record, read_failures),
            _ => return,
        };

        if !ok {
            if self.retry() {
                return;
            }
            warn!(
                block = record.info.block_id,
                error = ?ErrorCode::RetriesExhausted,
                "migration write failed"
            );
            self.record_abandon(Requester::Switch, &record);
            self.switch = SwitchCheckpoint::Copy {
                index,
                key,
                source,
                record: None,
                read_failures: 0,
            };
            return;
        }
        self.succeeded();

        match self.record_advance(record) {
            RecordOutcome::Continue(record) => {
                self.switch = SwitchCheckpoint::Copy {
                    index,
                    key,
                    source,
                    record: Some(record),
                    read_failures,
                };
            }
            RecordOutcome::Done(record) => {
                if self.cache.get(index) == source {
                    let section = self.record_section(&record);
                    let location = match source {
                        Location::Data { length, .. } => Location::Data {
                            address: record.reservation.data,
                            length,
                        },
                        Location::Inconsistent { .. } => Location::Inconsistent { section },
                        _ => Location::Invalid { section },
                    };
                    self.cache.set(index, location);
                }
                debug!(block = record.info.block_id, "block migrated");
                self.switch = SwitchCheckpoint::SelectNextBlock { after: Some(key) };
            }
        }
    }
}
