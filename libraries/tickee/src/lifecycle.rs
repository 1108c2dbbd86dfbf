// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The section lifecycle state machine.
//!
//! Prepares erased sections, activates the next section and retires the
//! oldest one:
//!
//! ```text
//! prepare:  Erase -> WriteSectionHeader -> [WriteHeaderEndPattern]
//!                 -> WriteSectionFooter -> [WriteFooterEndPattern] -> Empty
//! activate: MarkHeaderActive -> MarkFooterActive -> Active
//! retire:   MarkHeaderErasable -> MarkFooterErasable -> Erase -> prepare
//! ```
//!
//! Every state issues one flash job. The registry follows only once the
//! job is confirmed.

use crate::buffer_pool::Requester;
use crate::cursors::Cursors;
use crate::error_codes::ErrorCode;
use crate::flash_controller::FlashController;
use crate::layout::{Field, Side};
use crate::pattern::{self, Marker};
use crate::records::ManagementObject;
use crate::registry::{Registry, SectionStatus};
use crate::switch::SwitchCheckpoint;
use crate::tickee::{Step, TickEE};
use tracing::{debug, info, warn};

/// The flash job the lifecycle state machine is at. Each variant carries
/// the section it works on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing to do.
    Idle,
    /// Erase the section.
    Erase(usize),
    /// Program the header management object.
    WriteSectionHeader(usize),
    /// Program the pattern closing the header management object.
    WriteHeaderEndPattern(usize),
    /// Program the footer management object.
    WriteSectionFooter(usize),
    /// Program the pattern closing the footer management object.
    WriteFooterEndPattern(usize),
    /// Stamp the header active.
    MarkHeaderActive(usize),
    /// Stamp the footer active.
    MarkFooterActive(usize),
    /// Stamp the header erasable.
    MarkHeaderErasable(usize),
    /// Stamp the footer erasable.
    MarkFooterErasable(usize),
}

impl LifecycleState {
    /// The section being worked on.
    pub fn section(self) -> Option<usize> {
        match self {
            LifecycleState::Idle => None,
            LifecycleState::Erase(s)
            | LifecycleState::WriteSectionHeader(s)
            | LifecycleState::WriteHeaderEndPattern(s)
            | LifecycleState::WriteSectionFooter(s)
            | LifecycleState::WriteFooterEndPattern(s)
            | LifecycleState::MarkHeaderActive(s)
            | LifecycleState::MarkFooterActive(s)
            | LifecycleState::MarkHeaderErasable(s)
            | LifecycleState::MarkFooterErasable(s) => Some(s),
        }
    }

    /// The first state that brings a section with `status` back to `Empty`.
    fn prepare(section: usize, status: SectionStatus) -> Self {
        match status {
            SectionStatus::Erased => LifecycleState::WriteSectionHeader(section),
            SectionStatus::NoFooter => LifecycleState::WriteSectionFooter(section),
            SectionStatus::ErasableHeader => LifecycleState::MarkFooterErasable(section),
            _ => LifecycleState::Erase(section),
        }
    }
}

impl<'a, C: FlashController, const N: usize> TickEE<'a, C, N> {
    /// The work the lifecycle state machine should pick up next, if any.
    pub(crate) fn plan_lifecycle(&self) -> Option<LifecycleState> {
        if let Some(section) = self.activating {
            return Some(match self.registry.status(section) {
                SectionStatus::Empty => LifecycleState::MarkHeaderActive(section),
                status => LifecycleState::prepare(section, status),
            });
        }

        if self.switch == SwitchCheckpoint::Retire {
            return Some(LifecycleState::MarkHeaderErasable(self.registry.oldest));
        }

        let mut section = Registry::<N>::next(self.registry.active);
        while section != self.registry.oldest && section != self.registry.active {
            let status = self.registry.status(section);
            if status != SectionStatus::Empty {
                return Some(LifecycleState::prepare(section, status));
            }
            section = Registry::<N>::next(section);
        }
        None
    }

    pub(crate) fn start_lifecycle(&mut self, state: LifecycleState) {
        if let LifecycleState::MarkHeaderErasable(_) = state {
            if self.switch == SwitchCheckpoint::Retire {
                self.switch = SwitchCheckpoint::Retiring;
            }
        }
        debug!(?state, "lifecycle start");
        self.lifecycle = state;
    }

    pub(crate) fn lifecycle_step(&mut self) -> Step {
        let owner = Requester::Lifecycle;
        match self.lifecycle {
            LifecycleState::Idle => Step::Continue,
            LifecycleState::Erase(s) => self.issue_erase(owner, s),
            LifecycleState::WriteSectionHeader(s) => {
                let object = ManagementObject {
                    erase_counter: self.registry.get(s).erase_counter,
                    config_id: self.config.config_id,
                    section_counter: self.registry.counter_for(s),
                };
                self.write_management(s, Side::Header, object)
            }
            LifecycleState::WriteSectionFooter(s) => {
                let info = self.registry.get(s);
                let object = ManagementObject {
                    erase_counter: info.erase_counter,
                    config_id: self.config.config_id,
                    section_counter: info.counter,
                };
                self.write_management(s, Side::Footer, object)
            }
            LifecycleState::WriteHeaderEndPattern(s) => {
                self.write_field(s, Side::Header, Field::EndPattern, None)
            }
            LifecycleState::WriteFooterEndPattern(s) => {
                self.write_field(s, Side::Footer, Field::EndPattern, None)
            }
            LifecycleState::MarkHeaderActive(s) => {
                self.write_field(s, Side::Header, Field::ActiveMarker, Some(Marker::Active))
            }
            LifecycleState::MarkFooterActive(s) => {
                self.write_field(s, Side::Footer, Field::ActiveMarker, Some(Marker::Active))
            }
            LifecycleState::MarkHeaderErasable(s) => self.write_field(
                s,
                Side::Header,
                Field::ErasableMarker,
                Some(Marker::Erasable),
            ),
            LifecycleState::MarkFooterErasable(s) => self.write_field(
                s,
                Side::Footer,
                Field::ErasableMarker,
                Some(Marker::Erasable),
            ),
        }
    }

    fn write_management(&mut self, section: usize, side: Side, object: ManagementObject) -> Step {
        let len = self.layout.management_len();
        let buf = match self.pool.allocate(Requester::Lifecycle, len) {
            Ok(buf) => buf,
            Err(_) => return Step::Yield,
        };
        object.encode(&mut self.pool.get_mut(buf)[..len]);
        let address = self.layout.field_address(section, side, Field::Management);
        self.issue_write(Requester::Lifecycle, address, buf, len)
    }

    /// Program a marker, or the consistency pattern if `marker` is `None`.
    fn write_field(
        &mut self,
        section: usize,
        side: Side,
        field: Field,
        marker: Option<Marker>,
    ) -> Step {
        let len = self.layout.pattern_len();
        let buf = match self.pool.allocate(Requester::Lifecycle, len) {
            Ok(buf) => buf,
            Err(_) => return Step::Yield,
        };
        let bytes = &mut self.pool.get_mut(buf)[..len];
        match marker {
            Some(marker) => marker.encode(bytes),
            None => pattern::encode(bytes),
        }
        let address = self.layout.field_address(section, side, field);
        self.issue_write(Requester::Lifecycle, address, buf, len)
    }

    pub(crate) fn lifecycle_complete(&mut self, ok: bool) {
        let state = self.lifecycle;
        if !ok {
            if self.retry() {
                return;
            }
            warn!(?state, error = ?ErrorCode::RetriesExhausted, "lifecycle step failed");
            self.lifecycle = match state {
                LifecycleState::Idle => LifecycleState::Idle,
                LifecycleState::Erase(s)
                | LifecycleState::WriteSectionHeader(s)
                | LifecycleState::WriteHeaderEndPattern(s)
                | LifecycleState::WriteSectionFooter(s)
                | LifecycleState::WriteFooterEndPattern(s)
                | LifecycleState::MarkFooterErasable(s) => LifecycleState::Erase(s),
                // Either active stamp is enough to recognise the section.
                LifecycleState::MarkHeaderActive(s) => LifecycleState::MarkFooterActive(s),
                LifecycleState::MarkFooterActive(s) => LifecycleState::MarkHeaderErasable(s),
                LifecycleState::MarkHeaderErasable(s) => LifecycleState::MarkFooterErasable(s),
            };
            return;
        }
        self.succeeded();

        let has_end = self.layout.pattern_mode().has_end();
        self.lifecycle = match state {
            LifecycleState::Idle => LifecycleState::Idle,
            LifecycleState::Erase(s) => {
                self.registry.count_erase(s);
                debug!(
                    section = s,
                    erase_counter = self.registry.get(s).erase_counter,
                    "section erased"
                );
                LifecycleState::WriteSectionHeader(s)
            }
            LifecycleState::WriteSectionHeader(s) => {
                let erase_counter = self.registry.get(s).erase_counter;
                let counter = self.registry.counter_for(s);
                self.registry
                    .set_management(s, counter, Some(erase_counter));
                if has_end {
                    LifecycleState::WriteHeaderEndPattern(s)
                } else {
                    self.registry.set_status(s, SectionStatus::NoFooter);
                    LifecycleState::WriteSectionFooter(s)
                }
            }
            LifecycleState::WriteHeaderEndPattern(s) => {
                self.registry.set_status(s, SectionStatus::NoFooter);
                LifecycleState::WriteSectionFooter(s)
            }
            LifecycleState::WriteSectionFooter(s) if has_end => {
                LifecycleState::WriteFooterEndPattern(s)
            }
            LifecycleState::WriteSectionFooter(s) | LifecycleState::WriteFooterEndPattern(s) => {
                self.section_prepared(s);
                LifecycleState::Idle
            }
            LifecycleState::MarkHeaderActive(s) => LifecycleState::MarkFooterActive(s),
            LifecycleState::MarkFooterActive(s) => {
                self.section_activated(s);
                LifecycleState::Idle
            }
            LifecycleState::MarkHeaderErasable(s) => {
                self.registry.set_status(s, SectionStatus::ErasableHeader);
                LifecycleState::MarkFooterErasable(s)
            }
            LifecycleState::MarkFooterErasable(s) => {
                self.registry.set_status(s, SectionStatus::Erasable);
                LifecycleState::Erase(s)
            }
        };
    }

    fn section_prepared(&mut self, section: usize) {
        self.registry.set_status(section, SectionStatus::Empty);
        debug!(section, "section prepared");

        if self.switch == SwitchCheckpoint::Retiring && section == self.registry.oldest {
            self.registry.oldest = Registry::<N>::next(section);
            self.switch = SwitchCheckpoint::Idle;
            self.urgent = self.registry.ring_closed();
            info!(
                retired = section,
                oldest = self.registry.oldest,
                "section switch finished"
            );
        }
    }

    fn section_activated(&mut self, section: usize) {
        self.registry.set_status(section, SectionStatus::Active);
        self.cursors = Cursors::new(&self.layout, section);
        self.activating = None;
        self.urgent = self.registry.ring_closed();
        info!(section, urgent = self.urgent, "section activated");
    }
}
