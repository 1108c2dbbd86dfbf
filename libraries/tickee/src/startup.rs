// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The startup scan.
//!
//! Runs from `main_function()` after `init()` in three phases:
//!
//!  1. Read header and footer of every section and derive its status.
//!  2. Find the active and the oldest section.
//!  3. Walk the info slots of every section from the oldest to the active
//!     one, filling the block cache and recovering the cursors.
//!
//! Torn or foreign records are never trusted. Sections that cannot be used
//! are repaired by the lifecycle state machine once the scan is done.

use crate::buffer_pool::{BufferId, Requester};
use crate::cache::Location;
use crate::cursors::{Cursors, DataCursor, InfoCursor};
use crate::error_codes::ErrorCode;
use crate::flash_controller::FlashController;
use crate::layout::{Field, Layout, Side};
use crate::pattern::{self, Marker};
use crate::records::{BlockInfo, ManagementObject, ManagementState};
use crate::registry::{Registry, SectionStatus};
use crate::tickee::{Mode, Step, TickEE};
use tracing::{debug, info, warn};

/// What one side, header or footer, of a section says.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SideStatus {
    Erased,
    Empty,
    Active,
    Erasable,
    ActiveInconsistent,
    ErasableInconsistent,
    Inconsistent,
}

/// Progress through the info slots of one section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SlotScan {
    section: usize,
    slot: usize,
    erased_run: usize,
    data_end: usize,
    lost: usize,
    next_free: usize,
}

impl SlotScan {
    fn new(layout: &Layout, section: usize) -> Self {
        Self {
            section,
            slot: layout.first_slot(section),
            erased_run: 0,
            data_end: layout.data_start(section),
            lost: 0,
            next_free: layout.first_slot(section),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StartupState {
    ReadHeader {
        section: usize,
        newest: Option<usize>,
    },
    ReadFooter {
        section: usize,
        newest: Option<usize>,
        header: SideStatus,
        management: ManagementState,
    },
    FillCache(SlotScan),
}

impl StartupState {
    pub(crate) fn start() -> Self {
        StartupState::ReadHeader {
            section: 0,
            newest: None,
        }
    }
}

/// Combine the status of header and footer into the section status.
pub(crate) fn decide(header: SideStatus, footer: SideStatus) -> SectionStatus {
    use SideStatus::*;
    match (header, footer) {
        (Erased, ActiveInconsistent | ErasableInconsistent | Erased) => SectionStatus::Inconsistent,
        (Erased, other) => side_to_section(other),
        (Inconsistent, Active | Erasable | Empty) => side_to_section(footer),
        (Inconsistent, _) => SectionStatus::Inconsistent,
        (Empty, Erased) => SectionStatus::NoFooter,
        (Empty, Inconsistent | Empty) => SectionStatus::Empty,
        (Empty, Active | ActiveInconsistent) => SectionStatus::Active,
        (Empty, Erasable | ErasableInconsistent) => SectionStatus::Erasable,
        (Active, Erasable | ErasableInconsistent) => SectionStatus::Erasable,
        (Active, _) => SectionStatus::Active,
        (Erasable, Empty | Active) => SectionStatus::ErasableHeader,
        (Erasable, _) => SectionStatus::Erasable,
        (ActiveInconsistent, Empty | Active) => SectionStatus::Active,
        (ActiveInconsistent, Erasable) => SectionStatus::Erasable,
        (ActiveInconsistent, _) => SectionStatus::Inconsistent,
        (ErasableInconsistent, Empty | Active) => SectionStatus::ErasableHeader,
        (ErasableInconsistent, Erasable) => SectionStatus::Erasable,
        (ErasableInconsistent, _) => SectionStatus::Inconsistent,
    }
}

fn side_to_section(side: SideStatus) -> SectionStatus {
    match side {
        SideStatus::Empty => SectionStatus::Empty,
        SideStatus::Active => SectionStatus::Active,
        SideStatus::Erasable => SectionStatus::Erasable,
        _ => SectionStatus::Inconsistent,
    }
}

impl<'a, C: FlashController, const N: usize> TickEE<'a, C, N> {
    pub(crate) fn startup_step(&mut self, state: StartupState) -> Step {
        match state {
            StartupState::ReadHeader { section, newest } => {
                let address = self.layout.section_start(section);
                let (header, management) = match self.read_side(address, Side::Header) {
                    Ok(side) => side,
                    Err(_) => return Step::Yield,
                };
                self.mode = Mode::Startup(StartupState::ReadFooter {
                    section,
                    newest,
                    header,
                    management,
                });
                Step::Continue
            }
            StartupState::ReadFooter {
                section,
                newest,
                header,
                management,
            } => {
                let address = self.layout.footer_start(section);
                let (footer, footer_management) = match self.read_side(address, Side::Footer) {
                    Ok(side) => side,
                    Err(_) => return Step::Yield,
                };
                let status = decide(header, footer);
                debug!(section, ?header, ?footer, ?status, "section scanned");
                self.registry.restore_status(section, status);

                let newest = match (management, footer_management) {
                    (
                        ManagementState::Valid {
                            section_counter,
                            erase_counter,
                        },
                        _,
                    )
                    | (
                        _,
                        ManagementState::Valid {
                            section_counter,
                            erase_counter,
                        },
                    ) => {
                        self.registry
                            .set_management(section, section_counter, erase_counter);
                        self.newer(newest, section)
                    }
                    _ => newest,
                };

                if section + 1 < N {
                    self.mode = Mode::Startup(StartupState::ReadHeader {
                        section: section + 1,
                        newest,
                    });
                    Step::Continue
                } else {
                    self.sections_scanned(newest)
                }
            }
            StartupState::FillCache(scan) => self.scan_slot(scan),
        }
    }

    /// Allocate a startup buffer and read `len` bytes at `address` into it.
    fn startup_read(&mut self, address: usize, len: usize) -> Result<BufferId, ErrorCode> {
        let buf = self.pool.allocate(Requester::Startup, len)?;
        match self
            .controller
            .read(address, &mut self.pool.get_mut(buf)[..len])
        {
            Ok(()) => Ok(buf),
            Err(e) => {
                self.pool.release(buf);
                Err(e)
            }
        }
    }

    /// Read and classify a header or footer. `Err` means try again later.
    fn read_side(
        &mut self,
        address: usize,
        side: Side,
    ) -> Result<(SideStatus, ManagementState), ErrorCode> {
        let len = self.layout.header_len();
        let buf = match self.startup_read(address, len) {
            Ok(buf) => buf,
            Err(ErrorCode::ReadFail) => {
                warn!(address, "section management unreadable");
                return Ok((SideStatus::Inconsistent, ManagementState::Invalid));
            }
            Err(e) => return Err(e),
        };
        let result = self.classify_side(&self.pool.get(buf)[..len], side);
        self.pool.release(buf);
        Ok(result)
    }

    fn classify_side(&self, bytes: &[u8], side: Side) -> (SideStatus, ManagementState) {
        let field = |field: Field| {
            let (offset, len) = self.layout.field(side, field);
            &bytes[offset..offset + len]
        };

        let management = ManagementObject::decode(field(Field::Management), |id| {
            self.config.accepts_config_id(id)
        });
        let has_end = self.layout.pattern_mode().has_end();
        let base = match management {
            ManagementState::Erased
                if !has_end || pattern::is_erased(field(Field::EndPattern)) =>
            {
                SideStatus::Erased
            }
            ManagementState::Valid { .. }
                if !has_end || pattern::is_valid(field(Field::EndPattern)) =>
            {
                SideStatus::Empty
            }
            ManagementState::Foreign(config_id) => {
                warn!(
                    config_id,
                    error = ?ErrorCode::ConfigMismatch,
                    "section written by another configuration"
                );
                SideStatus::Inconsistent
            }
            _ => SideStatus::Inconsistent,
        };

        let status = if Marker::Erasable.is_set(field(Field::ErasableMarker)) {
            if base == SideStatus::Empty {
                SideStatus::Erasable
            } else {
                SideStatus::ErasableInconsistent
            }
        } else if Marker::Active.is_set(field(Field::ActiveMarker)) {
            if base == SideStatus::Empty {
                SideStatus::Active
            } else {
                SideStatus::ActiveInconsistent
            }
        } else {
            base
        };

        match status {
            SideStatus::Empty | SideStatus::Active | SideStatus::Erasable => (status, management),
            _ => (status, ManagementState::Invalid),
        }
    }

    /// Keep the newer of the `candidate` and `section`. A section is newer
    /// if its counter continues the candidate's.
    fn newer(&self, candidate: Option<usize>, section: usize) -> Option<usize> {
        if !matches!(
            self.registry.status(section),
            SectionStatus::Active | SectionStatus::Empty | SectionStatus::NoFooter
        ) {
            return candidate;
        }
        match candidate {
            None => Some(section),
            Some(c) => {
                let expected = self
                    .registry
                    .get(c)
                    .counter
                    .wrapping_add(Registry::<N>::distance(c, section) as u8);
                if self.registry.get(section).counter == expected {
                    Some(section)
                } else {
                    Some(c)
                }
            }
        }
    }

    fn sections_scanned(&mut self, newest: Option<usize>) -> Step {
        self.registry.settle_erase_counters();

        let newest = match newest {
            Some(newest) => newest,
            None => {
                self.registry.active = 0;
                self.registry.oldest = 0;
                self.finish_startup();
                return Step::Continue;
            }
        };

        let mut found = false;
        let mut oldest = newest;
        let mut section = newest;
        for _ in 0..N {
            match self.registry.status(section) {
                SectionStatus::Inconsistent => {}
                SectionStatus::Active => {
                    if !found {
                        self.registry.active = section;
                        found = true;
                    }
                    oldest = section;
                }
                SectionStatus::Empty | SectionStatus::NoFooter if !found => oldest = section,
                _ if found => break,
                _ => {}
            }
            section = Registry::<N>::previous(section);
        }

        self.registry.oldest = oldest;
        if found {
            let active = self.registry.active;
            self.registry.set_status(active, SectionStatus::Active);
        } else {
            self.registry.active = oldest;
        }
        debug!(
            active = self.registry.active,
            oldest = self.registry.oldest,
            "ring recovered"
        );

        self.scan_from(self.registry.oldest)
    }

    /// Start the slot scan at the first section holding data, from
    /// `section` up to the active section.
    fn scan_from(&mut self, mut section: usize) -> Step {
        for _ in 0..N {
            if matches!(
                self.registry.status(section),
                SectionStatus::Active | SectionStatus::Full
            ) {
                let scan = SlotScan::new(&self.layout, section);
                self.mode = Mode::Startup(StartupState::FillCache(scan));
                return Step::Continue;
            }
            if section == self.registry.active {
                break;
            }
            section = Registry::<N>::next(section);
        }
        self.finish_startup();
        Step::Continue
    }

    fn scan_slot(&mut self, mut scan: SlotScan) -> Step {
        let slot_len = self.layout.slot_len();
        if scan.erased_run >= self.layout.margin() || scan.slot < scan.data_end {
            return self.section_scanned(scan);
        }

        let info = match self.startup_read(scan.slot, slot_len) {
            Ok(buf) => {
                let bytes = &self.pool.get(buf)[..slot_len];
                let found = if pattern::is_erased(bytes) {
                    None
                } else {
                    Some(self.parse_slot(bytes))
                };
                self.pool.release(buf);
                found
            }
            Err(ErrorCode::ReadFail) => Some(None),
            Err(_) => return Step::Yield,
        };

        match info {
            None => scan.erased_run += 1,
            Some(info) => {
                scan.erased_run = 0;
                scan.next_free = scan.slot.saturating_sub(slot_len);
                self.slot_found(&mut scan, info);
            }
        }
        scan.slot = scan.slot.saturating_sub(slot_len);
        self.mode = Mode::Startup(StartupState::FillCache(scan));
        Step::Continue
    }

    /// Decode a slot. Returns the block info and whether the written marker
    /// is set, `None` if the slot is torn.
    fn parse_slot(&self, bytes: &[u8]) -> Option<(BlockInfo, bool)> {
        let layout = &self.layout;
        let page = layout.pattern_len();
        let mode = layout.pattern_mode();
        if mode.has_start() && !pattern::is_valid(&bytes[..page]) {
            return None;
        }
        if mode.has_end() {
            let offset = layout.info_end_pattern_offset();
            if !pattern::is_valid(&bytes[offset..offset + page]) {
                return None;
            }
        }
        let info = BlockInfo::decode(&bytes[layout.info_offset()..])?;
        let offset = layout.written_marker_offset();
        let written = Marker::Written.is_set(&bytes[offset..offset + page]);
        Some((info, written))
    }

    fn slot_found(&mut self, scan: &mut SlotScan, found: Option<(BlockInfo, bool)>) {
        let section = scan.section;
        let (info, written) = match found {
            Some(found) => found,
            None => {
                scan.lost += self.largest_record;
                return;
            }
        };

        if info.length == 0 {
            let location = if info.data_address == self.layout.invalid_address(section) {
                Location::Invalid { section }
            } else if info.data_address == self.layout.inconsistent_address(section) {
                Location::Inconsistent { section }
            } else {
                scan.lost += self.largest_record;
                return;
            };
            self.block_found(info, location);
            return;
        }

        let address = info.data_address as usize;
        let end = address + self.layout.align(info.length as usize);
        if address < self.layout.data_start(section) || end > scan.slot {
            scan.lost += self.largest_record;
            return;
        }
        scan.data_end = scan.data_end.max(end);
        scan.lost = 0;
        if written {
            self.block_found(
                info,
                Location::Data {
                    address,
                    length: info.length,
                },
            );
        }
    }

    /// Point the cache at a record found on flash. Newer records found
    /// later replace older ones.
    fn block_found(&mut self, info: BlockInfo, location: Location) {
        let index = match self.cache.index_of(info.block_id) {
            Some(index) => match self.cache.config(index) {
                Some(block) if info.length > block.size => {
                    warn!(
                        block = info.block_id,
                        length = info.length,
                        "record longer than the configured block"
                    );
                    return;
                }
                _ => index,
            },
            None if info.length <= self.config.spare_block_size => {
                match self.cache.adopt_spare(info.block_id) {
                    Some(index) => index,
                    None => {
                        warn!(block = info.block_id, "spare pool full, block dropped");
                        return;
                    }
                }
            }
            None => {
                warn!(block = info.block_id, "unknown block dropped");
                return;
            }
        };
        self.cache.set(index, location);
    }

    fn section_scanned(&mut self, scan: SlotScan) -> Step {
        if scan.section == self.registry.active {
            self.cursors = Cursors::recovered(
                scan.section,
                DataCursor(scan.data_end + scan.lost),
                InfoCursor(scan.next_free),
            );
            self.finish_startup();
            return Step::Continue;
        }
        self.scan_from(Registry::<N>::next(scan.section))
    }

    fn finish_startup(&mut self) {
        let active = self.registry.active;
        if self.registry.status(active) != SectionStatus::Active {
            self.activating = Some(active);
            self.cursors = Cursors::new(&self.layout, active);
        }
        self.urgent = self.registry.ring_closed();
        self.critical = (0..self.cache.len()).find(|&index| {
            self.is_critical(index) && matches!(self.cache.get(index), Location::Data { .. })
        });
        if let Some(index) = self.critical {
            info!(block = self.cache.id(index), "critical block found, engine frozen");
        }
        self.mode = Mode::Running;
        info!(
            active,
            oldest = self.registry.oldest,
            erase_counter = self.registry.max_erase_counter,
            "startup complete"
        );
    }
}
