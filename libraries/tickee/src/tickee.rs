// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The TicKEE engine: request API and main function.

use crate::buffer_pool::{BufferId, BufferPool, Requester};
use crate::cache::{BlockCache, CacheEntry, Location};
use crate::config::{BlockConfig, Config};
use crate::cursors::Cursors;
use crate::error_codes::ErrorCode;
use crate::flash_controller::{FlashController, JobResult};
use crate::layout::Layout;
use crate::lifecycle::LifecycleState;
use crate::record::{Payload, RecordProgress};
use crate::records::{BlockInfo, JobKind};
use crate::registry::{Registry, SectionStatus};
use crate::startup::StartupState;
use crate::success_codes::SuccessCode;
use crate::switch::SwitchCheckpoint;
use tracing::{debug, info, warn};

/// Retries of a failed flash job before the owning state machine takes its
/// failure path.
pub const MAX_RETRIES: u8 = 1;

/// Upper bound of state machine steps run by one `main_function()` call.
pub const MAX_STEPS_PER_TICK: usize = 32;

/// What the engine is doing, as seen by the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    /// `init()` was not called.
    Uninit,
    /// Nothing to do.
    Idle,
    /// A user request is pending.
    Busy,
    /// Only internal work (startup, switch, erase) is pending.
    BusyInternal,
}

/// Outcome of the last user request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserJobResult {
    /// Completed successfully.
    Ok,
    /// Still running.
    Pending,
    /// Flash failed after all retries.
    Failed,
    /// The block was invalidated or never written.
    BlockInvalid,
    /// The block was lost.
    BlockInconsistent,
    /// The request was cancelled.
    Cancelled,
}

/// Result of one state machine step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// Run the next step in the same tick.
    Continue,
    /// Stop for this tick.
    Yield,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    Uninit,
    Startup(StartupState),
    Running,
}

/// The flash job waiting for completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Job {
    pub(crate) owner: Requester,
    pub(crate) buffer: Option<BufferId>,
    pub(crate) erase: bool,
    pub(crate) refused: bool,
    pub(crate) cancelled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UserJob<'a> {
    None,
    Record {
        index: usize,
        payload: Payload<'a>,
        lost: bool,
        record: Option<RecordProgress>,
    },
    Read {
        index: usize,
        offset: usize,
    },
}

/// The struct storing all of the TicKEE state.
pub struct TickEE<'a, C: FlashController, const N: usize> {
    /// The controller used for flash commands
    pub controller: C,
    pub(crate) config: Config,
    pub(crate) layout: Layout,
    pub(crate) pool: BufferPool<'a>,
    pub(crate) cache: BlockCache<'a>,
    pub(crate) registry: Registry<N>,
    pub(crate) cursors: Cursors,
    pub(crate) mode: Mode,
    pub(crate) lifecycle: LifecycleState,
    pub(crate) switch: SwitchCheckpoint,
    pub(crate) user: UserJob<'a>,
    pub(crate) job: Option<Job>,
    pub(crate) activating: Option<usize>,
    pub(crate) urgent: bool,
    pub(crate) critical: Option<usize>,
    pub(crate) largest_record: usize,
    activities_frozen: bool,
    retries: u8,
    backoff: bool,
    result: UserJobResult,
    read_buffer: Option<&'a mut [u8]>,
}

impl<'a, C: FlashController, const N: usize> TickEE<'a, C, N> {
    /// Create a new engine.
    ///
    /// `blocks`: the configured blocks.
    /// `cache_storage`: one entry per configured block, plus one per spare
    ///                  block to adopt from flash.
    /// `management_buffer`: stages headers and info slots.
    /// `data_buffer`: stages block data, one chunk at a time.
    ///
    /// Fails with `ErrorCode::InvalidConfig` or `ErrorCode::BufferTooSmall`
    /// if the geometry cannot hold the configured blocks.
    pub fn new(
        controller: C,
        config: Config,
        blocks: &'a [BlockConfig],
        cache_storage: &'a mut [CacheEntry],
        management_buffer: &'a mut [u8],
        data_buffer: &'a mut [u8],
    ) -> Result<Self, ErrorCode> {
        let layout = config.validate(
            N,
            blocks,
            cache_storage.len(),
            management_buffer.len(),
            data_buffer.len(),
        )?;
        let largest = blocks
            .iter()
            .map(|b| b.size)
            .chain(core::iter::once(config.spare_block_size))
            .max()
            .unwrap_or(0) as usize;

        Ok(Self {
            controller,
            config,
            layout,
            pool: BufferPool::new(management_buffer, data_buffer),
            cache: BlockCache::new(blocks, cache_storage),
            registry: Registry::new(),
            cursors: Cursors::new(&layout, 0),
            mode: Mode::Uninit,
            lifecycle: LifecycleState::Idle,
            switch: SwitchCheckpoint::Idle,
            user: UserJob::None,
            job: None,
            activating: None,
            urgent: false,
            critical: None,
            largest_record: layout.record_len(largest),
            activities_frozen: false,
            retries: 0,
            backoff: false,
            result: UserJobResult::Ok,
            read_buffer: None,
        })
    }

    /// Start the startup scan. It runs from `main_function()`; user
    /// requests are accepted right away and served once it completes.
    pub fn init(&mut self) -> Result<SuccessCode, ErrorCode> {
        if self.job.is_some() {
            return Err(ErrorCode::Busy);
        }
        self.registry = Registry::new();
        self.cache.clear();
        self.lifecycle = LifecycleState::Idle;
        self.switch = SwitchCheckpoint::Idle;
        self.activating = None;
        self.urgent = false;
        self.critical = None;
        self.activities_frozen = false;
        self.retries = 0;
        self.mode = Mode::Startup(StartupState::start());
        Ok(SuccessCode::Queued)
    }

    /// Run one tick.
    ///
    /// Polls the outstanding flash job and then advances the state
    /// machines until a new flash job is pending or there is nothing left
    /// to do. A failed job makes the engine wait for the next tick.
    pub fn main_function(&mut self) {
        self.backoff = false;
        for _ in 0..MAX_STEPS_PER_TICK {
            if let Some(job) = self.job {
                let ok = if job.refused {
                    false
                } else {
                    match self.controller.job_result() {
                        JobResult::Pending => return,
                        JobResult::Complete => true,
                        JobResult::Failed => false,
                    }
                };
                if !ok && !job.cancelled {
                    let error = if job.refused {
                        ErrorCode::FlashRefused
                    } else {
                        ErrorCode::FlashJobFailed
                    };
                    debug!(owner = ?job.owner, ?error, "flash job failed");
                }
                self.job = None;
                self.complete(job, ok);
                if core::mem::take(&mut self.backoff) {
                    return;
                }
                continue;
            }

            let step = match self.mode {
                Mode::Uninit => Step::Yield,
                Mode::Startup(state) => self.startup_step(state),
                Mode::Running => self.running_step(),
            };
            if step == Step::Yield {
                return;
            }
        }
    }

    /// Queue a write of `data` to configured block `block_id`. `data` may
    /// be shorter than the configured size of the block but not empty.
    pub fn write(&mut self, block_id: u16, data: &'a [u8]) -> Result<SuccessCode, ErrorCode> {
        self.accept()?;
        let index = self.configured(block_id)?;
        self.check_frozen(None)?;
        self.check_urgent()?;
        let size = self.cache.config(index).map_or(0, |b| b.size);
        if data.is_empty() || data.len() > size as usize {
            return Err(ErrorCode::InvalidLength);
        }
        self.queue(UserJob::Record {
            index,
            payload: Payload::User(data),
            lost: false,
            record: None,
        })
    }

    /// Queue a write of `data` to block `block_id`, which must not be a
    /// configured block. The block takes a spare cache entry on its first
    /// write and migrates like any other block. `data` holds at most
    /// `Config::spare_block_size` bytes.
    pub fn write_custom(
        &mut self,
        block_id: u16,
        data: &'a [u8],
    ) -> Result<SuccessCode, ErrorCode> {
        self.accept()?;
        self.check_frozen(None)?;
        self.check_urgent()?;
        if data.is_empty() || data.len() > self.config.spare_block_size as usize {
            return Err(ErrorCode::InvalidLength);
        }
        let index = match self.cache.index_of(block_id) {
            Some(index) if self.cache.is_configured(index) => return Err(ErrorCode::KeyNotFound),
            Some(index) => index,
            None if block_id == u16::MAX => return Err(ErrorCode::KeyNotFound),
            None => self
                .cache
                .adopt_spare(block_id)
                .ok_or(ErrorCode::SparePoolFull)?,
        };
        self.queue(UserJob::Record {
            index,
            payload: Payload::User(data),
            lost: false,
            record: None,
        })
    }

    /// Queue a read of configured block `block_id`, starting `offset` bytes
    /// into the block, into `buf`. Get `buf` back with `take_read_buffer()`.
    pub fn read(
        &mut self,
        block_id: u16,
        offset: usize,
        buf: &'a mut [u8],
    ) -> Result<SuccessCode, ErrorCode> {
        self.accept()?;
        let index = self.configured(block_id)?;
        self.check_frozen(Some(index))?;
        self.check_read(index, offset, buf.len())?;
        self.read_buffer = Some(buf);
        self.queue(UserJob::Read { index, offset })
    }

    /// Queue a read of a block written by `write_custom()` or adopted as a
    /// spare during startup.
    pub fn read_custom(
        &mut self,
        block_id: u16,
        offset: usize,
        buf: &'a mut [u8],
    ) -> Result<SuccessCode, ErrorCode> {
        self.accept()?;
        let index = match self.cache.index_of(block_id) {
            Some(index) if !self.cache.is_configured(index) => index,
            _ => return Err(ErrorCode::KeyNotFound),
        };
        self.check_frozen(None)?;
        self.check_read(index, offset, buf.len())?;
        self.read_buffer = Some(buf);
        self.queue(UserJob::Read { index, offset })
    }

    /// Queue an invalidation of block `block_id`. Reads return
    /// `UserJobResult::BlockInvalid` afterwards.
    pub fn invalidate(&mut self, block_id: u16) -> Result<SuccessCode, ErrorCode> {
        self.accept()?;
        let index = self.configured(block_id)?;
        self.check_frozen(None)?;
        self.check_urgent()?;
        self.queue(UserJob::Record {
            index,
            payload: Payload::Nothing,
            lost: false,
            record: None,
        })
    }

    /// Queue marking block `block_id` as inconsistent, for data that must
    /// not survive. Reads return `UserJobResult::BlockInconsistent`
    /// afterwards.
    ///
    /// Erasing the critical block that froze the engine unfreezes it.
    pub fn erase_immediate(&mut self, block_id: u16) -> Result<SuccessCode, ErrorCode> {
        self.accept()?;
        let index = self.configured(block_id)?;
        self.check_frozen(Some(index))?;
        self.check_urgent()?;
        self.queue(UserJob::Record {
            index,
            payload: Payload::Nothing,
            lost: true,
            record: None,
        })
    }

    /// Drop the pending user request. Requests for a critical block cannot
    /// be cancelled.
    pub fn cancel(&mut self) -> Result<SuccessCode, ErrorCode> {
        let index = match self.user {
            UserJob::None => return Ok(SuccessCode::Complete),
            UserJob::Record { index, .. } | UserJob::Read { index, .. } => index,
        };
        if self.is_critical(index) {
            return Err(ErrorCode::Busy);
        }

        // Space of a partly written record stays allocated.
        if let Some(job) = self.job.as_mut() {
            if job.owner == Requester::User && !job.cancelled {
                job.cancelled = true;
                self.controller.cancel();
            }
        }
        debug!("user job cancelled");
        self.user = UserJob::None;
        self.result = UserJobResult::Cancelled;
        Ok(SuccessCode::Cancelled)
    }

    /// Suspend or resume background work. While frozen the section switch
    /// and the preparation and retirement of sections wait. User requests
    /// are still served, including the activation of a section they need.
    pub fn freeze_activities(&mut self, freeze: bool) -> Result<SuccessCode, ErrorCode> {
        if self.mode == Mode::Uninit {
            return Err(ErrorCode::NotInitialised);
        }
        debug!(freeze, "background work frozen");
        self.activities_frozen = freeze;
        Ok(SuccessCode::Complete)
    }

    /// Outcome of the last user request.
    pub fn job_result(&self) -> UserJobResult {
        self.result
    }

    /// Return the buffer of the last read once it completed.
    pub fn take_read_buffer(&mut self) -> Option<&'a mut [u8]> {
        if matches!(self.user, UserJob::Read { .. }) {
            return None;
        }
        self.read_buffer.take()
    }

    /// The current engine status.
    pub fn status(&self) -> EngineStatus {
        match self.mode {
            Mode::Uninit => EngineStatus::Uninit,
            Mode::Startup(_) => EngineStatus::BusyInternal,
            Mode::Running => {
                if self.user != UserJob::None {
                    EngineStatus::Busy
                } else if self.job.is_some() {
                    EngineStatus::BusyInternal
                } else if self.background_paused() {
                    EngineStatus::Idle
                } else if self.lifecycle != LifecycleState::Idle
                    || self.switch != SwitchCheckpoint::Idle
                    || self.plan_lifecycle().is_some()
                    || self.switch_due()
                {
                    EngineStatus::BusyInternal
                } else {
                    EngineStatus::Idle
                }
            }
        }
    }

    /// The highest erase counter of all sections.
    pub fn erase_counter(&self) -> u32 {
        self.registry.max_erase_counter
    }

    /// Where the newest copy of `block_id` is.
    pub fn block_location(&self, block_id: u16) -> Option<Location> {
        self.cache.index_of(block_id).map(|i| self.cache.get(i))
    }

    /// Status of `section`.
    pub fn section_status(&self, section: usize) -> SectionStatus {
        self.registry.status(section)
    }

    /// The section receiving writes.
    pub fn active_section(&self) -> usize {
        self.registry.active
    }

    /// The oldest section holding data.
    pub fn oldest_section(&self) -> usize {
        self.registry.oldest
    }

    /// The erase counter of `section`.
    pub fn section_erase_counter(&self, section: usize) -> u32 {
        self.registry.get(section).erase_counter
    }

    /// Where the section switch is.
    pub fn switch_checkpoint(&self) -> SwitchCheckpoint {
        self.switch
    }

    /// Where the section lifecycle state machine is.
    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle
    }

    /// The critical block holding data, if one froze the engine.
    pub fn frozen_by(&self) -> Option<u16> {
        self.critical.map(|index| self.cache.id(index))
    }

    /// The allocation cursors of the active section.
    pub fn cursors(&self) -> Cursors {
        self.cursors
    }

    /// The computed geometry.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// All cache entries in use.
    pub fn cache_entries(&self) -> &[CacheEntry] {
        self.cache.entries()
    }

    fn accept(&self) -> Result<(), ErrorCode> {
        if self.mode == Mode::Uninit {
            return Err(ErrorCode::NotInitialised);
        }
        if self.user != UserJob::None {
            return Err(ErrorCode::Busy);
        }
        Ok(())
    }

    fn configured(&self, block_id: u16) -> Result<usize, ErrorCode> {
        match self.cache.index_of(block_id) {
            Some(index) if self.cache.is_configured(index) => Ok(index),
            _ => Err(ErrorCode::KeyNotFound),
        }
    }

    /// Once a critical block holds data only reads and erasures of that
    /// block are accepted. `index` is the block a read or erasure is for.
    fn check_frozen(&self, index: Option<usize>) -> Result<(), ErrorCode> {
        match self.critical {
            Some(critical) if index != Some(critical) => Err(ErrorCode::Frozen),
            _ => Ok(()),
        }
    }

    /// Records are refused while an urgent switch frees a section.
    fn check_urgent(&self) -> Result<(), ErrorCode> {
        if self.urgent {
            return Err(ErrorCode::Busy);
        }
        Ok(())
    }

    /// `len` bytes from `offset` must lie inside the stored copy of the
    /// block, or inside its maximum size while nothing is stored.
    fn check_read(&self, index: usize, offset: usize, len: usize) -> Result<(), ErrorCode> {
        let end = offset.checked_add(len).ok_or(ErrorCode::InvalidLength)?;
        let limit = match self.cache.get(index) {
            Location::Data { length, .. } => length,
            _ => self
                .cache
                .config(index)
                .map_or(self.config.spare_block_size, |block| block.size),
        };
        if end > limit as usize {
            return Err(ErrorCode::InvalidLength);
        }
        Ok(())
    }

    pub(crate) fn is_critical(&self, index: usize) -> bool {
        self.cache.config(index).is_some_and(|block| block.critical)
    }

    /// True if the section switch waits: the user froze background work,
    /// or a critical block holds data and no urgent switch is needed.
    fn switch_paused(&self) -> bool {
        self.activities_frozen || (self.critical.is_some() && !self.urgent)
    }

    /// True if all background work waits. A pending section activation
    /// still runs.
    fn background_paused(&self) -> bool {
        self.activating.is_none() && self.switch_paused()
    }

    fn queue(&mut self, job: UserJob<'a>) -> Result<SuccessCode, ErrorCode> {
        self.user = job;
        self.result = UserJobResult::Pending;
        self.preempt_erase();
        Ok(SuccessCode::Queued)
    }

    /// A running erase is cancelled in favour of a user request. The erase
    /// is issued again later.
    fn preempt_erase(&mut self) {
        if let Some(job) = self.job.as_mut() {
            if job.erase && job.owner == Requester::Lifecycle && !job.cancelled {
                job.cancelled = true;
                self.controller.cancel();
                debug!("erase cancelled for user request");
            }
        }
    }

    fn complete(&mut self, job: Job, ok: bool) {
        if let Some(buf) = job.buffer {
            self.pool.release(buf);
        }
        if job.cancelled {
            return;
        }
        match job.owner {
            Requester::User => self.user_complete(ok),
            Requester::Lifecycle => self.lifecycle_complete(ok),
            Requester::Switch => self.switch_complete(ok),
            Requester::Startup => {}
        }
    }

    /// Start programming `len` bytes of `buf` at `address`.
    pub(crate) fn issue_write(
        &mut self,
        owner: Requester,
        address: usize,
        buf: BufferId,
        len: usize,
    ) -> Step {
        let refused = self
            .controller
            .write(address, &self.pool.get(buf)[..len])
            .is_err();
        self.job = Some(Job {
            owner,
            buffer: Some(buf),
            erase: false,
            refused,
            cancelled: false,
        });
        if refused {
            Step::Continue
        } else {
            Step::Yield
        }
    }

    /// Start erasing `section`.
    pub(crate) fn issue_erase(&mut self, owner: Requester, section: usize) -> Step {
        let refused = self
            .controller
            .erase(self.layout.section_start(section), self.layout.section_size())
            .is_err();
        self.job = Some(Job {
            owner,
            buffer: None,
            erase: true,
            refused,
            cancelled: false,
        });
        if refused {
            Step::Continue
        } else {
            Step::Yield
        }
    }

    /// Count a failed job. Returns true if the same job should be issued
    /// again, false if the retries are used up. Either way the engine
    /// waits for the next tick.
    pub(crate) fn retry(&mut self) -> bool {
        self.backoff = true;
        if self.retries < MAX_RETRIES {
            self.retries += 1;
            true
        } else {
            self.retries = 0;
            false
        }
    }

    /// A job succeeded, the retry budget starts over.
    pub(crate) fn succeeded(&mut self) {
        self.retries = 0;
    }

    /// The section a cached location lives in.
    pub(crate) fn location_section(&self, location: Location) -> Option<usize> {
        match location {
            Location::Absent => None,
            Location::Data { address, .. } => self.layout.section_of(address, N),
            Location::Invalid { section } | Location::Inconsistent { section } => Some(section),
        }
    }

    /// The section `record` was written to.
    pub(crate) fn record_section(&self, record: &RecordProgress) -> usize {
        self.layout
            .section_of(record.reservation.slot, N)
            .unwrap_or(self.cursors.section())
    }

    /// Flash space the remaining migration out of the oldest section needs.
    pub(crate) fn migration_space(&self) -> usize {
        let oldest = self.registry.oldest;
        self.cache
            .entries()
            .iter()
            .filter(|e| self.location_section(e.location) == Some(oldest))
            .map(|e| match e.location {
                Location::Data { length, .. } => self.layout.record_len(length as usize),
                _ => self.layout.slot_len(),
            })
            .sum()
    }

    /// Activate the next section if the active one is full.
    pub(crate) fn request_section_change(&mut self) {
        if self.activating.is_some() || self.registry.ring_closed() {
            return;
        }
        let next = Registry::<N>::next(self.registry.active);
        if self.registry.status(next) == SectionStatus::Empty && next != self.registry.oldest {
            debug!(section = next, "section change");
            self.activating = Some(next);
        }
    }

    fn running_step(&mut self) -> Step {
        if self.user_runnable() {
            return self.user_step();
        }
        if self.background_paused() {
            return Step::Yield;
        }

        if self.lifecycle == LifecycleState::Idle {
            if let Some(state) = self.plan_lifecycle() {
                self.start_lifecycle(state);
            }
        }
        if self.lifecycle != LifecycleState::Idle {
            return self.lifecycle_step();
        }
        if self.switch_paused() {
            return Step::Yield;
        }

        if self.switch == SwitchCheckpoint::Idle && self.switch_due() {
            self.start_switch();
        }
        if self.switch != SwitchCheckpoint::Idle {
            return self.switch_step();
        }

        Step::Yield
    }

    /// The block the user job is writing, once it has claimed space.
    pub(crate) fn user_record_in_flight(&self) -> Option<usize> {
        match self.user {
            UserJob::Record {
                index,
                record: Some(_),
                ..
            } => Some(index),
            _ => None,
        }
    }

    fn user_runnable(&mut self) -> bool {
        let (index, payload) = match self.user {
            UserJob::None => return false,
            UserJob::Read { .. } => return true,
            UserJob::Record {
                record: Some(_), ..
            } => return true,
            UserJob::Record { index, payload, .. } => (index, payload),
        };

        if self.switch.block() == Some(index) {
            return false;
        }
        if self.registry.status(self.registry.active) != SectionStatus::Active {
            return false;
        }

        let len = match payload {
            Payload::User(data) => data.len(),
            _ => 0,
        };
        let reserve = if self.registry.ring_closed() {
            self.migration_space()
        } else {
            0
        };
        if self.cursors.fits(&self.layout, len, reserve) {
            return true;
        }
        self.request_section_change();
        false
    }

    fn user_step(&mut self) -> Step {
        match self.user {
            UserJob::None => Step::Yield,
            UserJob::Read { index, offset } => self.user_read(index, offset),
            UserJob::Record {
                index,
                payload,
                lost,
                record,
            } => {
                let (record, fresh) = match record {
                    Some(record) => (record, false),
                    None => match self.user_reserve(index, payload, lost) {
                        Ok(record) => (record, true),
                        Err(_) => return Step::Yield,
                    },
                };
                match self.record_issue(Requester::User, record, payload) {
                    Ok((record, step)) => {
                        self.user = UserJob::Record {
                            index,
                            payload,
                            lost,
                            record: Some(record),
                        };
                        step
                    }
                    Err(_) => {
                        if fresh {
                            self.cursors.rollback(&self.layout, &record.reservation);
                        }
                        Step::Yield
                    }
                }
            }
        }
    }

    fn user_reserve(
        &mut self,
        index: usize,
        payload: Payload<'a>,
        lost: bool,
    ) -> Result<RecordProgress, ErrorCode> {
        let section = self.cursors.section();
        let len = match payload {
            Payload::User(data) => data.len(),
            _ => 0,
        };
        let reservation = self.cursors.reserve(&self.layout, len)?;
        let info = match payload {
            Payload::User(_) => BlockInfo {
                block_id: self.cache.id(index),
                length: len as u16,
                data_address: reservation.data as u32,
                kind: JobKind::Write,
            },
            _ => BlockInfo {
                block_id: self.cache.id(index),
                length: 0,
                data_address: if lost {
                    self.layout.inconsistent_address(section)
                } else {
                    self.layout.invalid_address(section)
                },
                kind: JobKind::Invalidation,
            },
        };
        Ok(RecordProgress::new(reservation, info))
    }

    fn user_read(&mut self, index: usize, offset: usize) -> Step {
        let result = match self.cache.get(index) {
            Location::Absent | Location::Invalid { .. } => UserJobResult::BlockInvalid,
            Location::Inconsistent { .. } => UserJobResult::BlockInconsistent,
            Location::Data { address, length } => {
                let read = match self.read_buffer.as_deref_mut() {
                    Some(buf) if offset.saturating_add(buf.len()) <= length as usize => {
                        Some(self.controller.read(address + offset, buf))
                    }
                    _ => None,
                };
                match read {
                    Some(Ok(())) => {
                        self.succeeded();
                        UserJobResult::Ok
                    }
                    Some(Err(ErrorCode::ReadNotReady(_))) => return Step::Yield,
                    Some(Err(_)) => {
                        if self.retry() {
                            return Step::Yield;
                        }
                        UserJobResult::Failed
                    }
                    None => UserJobResult::Failed,
                }
            }
        };
        self.finish_user(result);
        Step::Continue
    }

    fn user_complete(&mut self, ok: bool) {
        let (index, payload, lost, record) = match self.user {
            UserJob::Record {
                index,
                payload,
                lost,
                record: Some(record),
            } => (index, payload, lost, record),
            _ => return,
        };

        if !ok {
            if self.retry() {
                return;
            }
            warn!(
                block = self.cache.id(index),
                error = ?ErrorCode::RetriesExhausted,
                "user write failed"
            );
            self.record_abandon(Requester::User, &record);
            self.finish_user(UserJobResult::Failed);
            return;
        }
        self.succeeded();

        match self.record_advance(record) {
            crate::record::RecordOutcome::Continue(record) => {
                self.user = UserJob::Record {
                    index,
                    payload,
                    lost,
                    record: Some(record),
                };
            }
            crate::record::RecordOutcome::Done(record) => {
                let section = self.record_section(&record);
                let location = match payload {
                    Payload::User(data) => Location::Data {
                        address: record.reservation.data,
                        length: data.len() as u16,
                    },
                    _ if lost => Location::Inconsistent { section },
                    _ => Location::Invalid { section },
                };
                self.cache.set(index, location);
                debug!(block = record.info.block_id, "user record written");
                self.critical_written(index, location);
                self.finish_user(UserJobResult::Ok);
            }
        }
    }

    /// A critical block holding data freezes the engine until it is erased.
    pub(crate) fn critical_written(&mut self, index: usize, location: Location) {
        if !self.is_critical(index) {
            return;
        }
        match location {
            Location::Data { .. } => {
                info!(block = self.cache.id(index), "critical block written, engine frozen");
                self.critical = Some(index);
            }
            _ if self.critical == Some(index) => {
                info!(block = self.cache.id(index), "critical block erased, engine resumed");
                self.critical = None;
            }
            _ => {}
        }
    }

    fn finish_user(&mut self, result: UserJobResult) {
        self.user = UserJob::None;
        self.result = result;
    }
}
