// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! In memory view of the sections.
//!
//! Flash is the source of truth. The registry is rebuilt by the startup
//! scan and afterwards changed only once a flash job has been confirmed.

/// Status of one section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionStatus {
    /// The management object is erased.
    Erased,
    /// The header was written but the footer was not.
    NoFooter,
    /// Header and footer are written, the section holds nothing.
    Empty,
    /// The section receiving writes. Exactly one section has this status.
    Active,
    /// Carries the active stamp but is older than the active section. It
    /// holds data still to be migrated.
    Full,
    /// Only the header was stamped erasable.
    ErasableHeader,
    /// Stamped erasable on both ends.
    Erasable,
    /// Nothing on flash can be trusted.
    Inconsistent,
}

/// Bookkeeping of one section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectionInfo {
    /// The derived status.
    pub status: SectionStatus,
    /// Ring position.
    pub counter: u8,
    /// Erasures so far.
    pub erase_counter: u32,
    /// False if no intact erase counter was found on flash.
    pub erase_known: bool,
}

impl SectionInfo {
    const fn unknown() -> Self {
        Self {
            status: SectionStatus::Inconsistent,
            counter: 0,
            erase_counter: 0,
            erase_known: false,
        }
    }
}

/// The ring of `N` sections.
pub struct Registry<const N: usize> {
    sections: [SectionInfo; N],
    /// The section receiving writes.
    pub active: usize,
    /// The oldest section holding data.
    pub oldest: usize,
    /// Highest erase counter seen on any section.
    pub max_erase_counter: u32,
}

impl<const N: usize> Registry<N> {
    pub(crate) fn new() -> Self {
        Self {
            sections: [SectionInfo::unknown(); N],
            active: 0,
            oldest: 0,
            max_erase_counter: 0,
        }
    }

    /// Section following `section` in the ring.
    pub fn next(section: usize) -> usize {
        (section + 1) % N
    }

    /// Section preceding `section` in the ring.
    pub fn previous(section: usize) -> usize {
        (section + N - 1) % N
    }

    /// How many steps forward it takes to get from `from` to `to`.
    pub fn distance(from: usize, to: usize) -> usize {
        (to + N - from) % N
    }

    /// Information about `section`.
    pub fn get(&self, section: usize) -> SectionInfo {
        self.sections[section]
    }

    /// Status of `section`.
    pub fn status(&self, section: usize) -> SectionStatus {
        self.sections[section].status
    }

    /// Record a status confirmed by flash.
    ///
    /// Promoting a section to `Active` demotes the previous active section
    /// to `Full`.
    pub fn set_status(&mut self, section: usize, status: SectionStatus) {
        if status == SectionStatus::Active {
            for (i, info) in self.sections.iter_mut().enumerate() {
                if i != section && info.status == SectionStatus::Active {
                    info.status = SectionStatus::Full;
                }
            }
            self.active = section;
        }
        self.sections[section].status = status;
    }

    /// Record a status read back by the startup scan. Several sections may
    /// carry the active stamp until the scan picks the active one.
    pub(crate) fn restore_status(&mut self, section: usize, status: SectionStatus) {
        self.sections[section].status = status;
    }

    /// Record the management object read from or written to flash.
    pub fn set_management(&mut self, section: usize, counter: u8, erase_counter: Option<u32>) {
        let info = &mut self.sections[section];
        info.counter = counter;
        if let Some(erase_counter) = erase_counter {
            info.erase_counter = erase_counter;
            info.erase_known = true;
            self.max_erase_counter = self.max_erase_counter.max(erase_counter);
        }
    }

    /// Sections whose erase counter was lost continue from the highest
    /// counter of the ring, so no counter ever goes backwards.
    pub fn settle_erase_counters(&mut self) {
        let max = self.max_erase_counter;
        for info in self.sections.iter_mut().filter(|s| !s.erase_known) {
            info.erase_counter = max;
            info.erase_known = true;
        }
    }

    /// Count an erasure of `section` confirmed by flash.
    pub fn count_erase(&mut self, section: usize) {
        let info = &mut self.sections[section];
        info.erase_counter = info.erase_counter.saturating_add(1);
        info.erase_known = true;
        info.status = SectionStatus::Erased;
        self.max_erase_counter = self.max_erase_counter.max(info.erase_counter);
    }

    /// The counter a section prepared now should carry.
    pub fn counter_for(&self, section: usize) -> u8 {
        let active = self.sections[self.active].counter;
        active.wrapping_add(Self::distance(self.active, section) as u8)
    }

    /// Number of sections that are `Active`.
    pub fn active_count(&self) -> usize {
        self.sections
            .iter()
            .filter(|s| s.status == SectionStatus::Active)
            .count()
    }

    /// True if the switch must run before a section is free again.
    pub fn needs_switch(&self) -> bool {
        Self::distance(self.oldest, self.active) >= N / 2
    }

    /// True if the section after the active one still holds data.
    pub fn ring_closed(&self) -> bool {
        self.oldest != self.active && Self::next(self.active) == self.oldest
    }
}
