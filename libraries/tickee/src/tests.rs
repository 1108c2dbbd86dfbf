// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

use crate::buffer_pool::{BufferPool, Requester};
use crate::cache::{BlockCache, CacheEntry, Location};
use crate::checksum::crc8;
use crate::config::{BlockConfig, Config};
use crate::cursors::Cursors;
use crate::error_codes::ErrorCode;
use crate::flash_controller::{FlashController, JobResult};
use crate::layout::{Field, Layout, Side};
use crate::lifecycle::LifecycleState;
use crate::pattern::{self, Marker, PatternMode};
use crate::record::RecordStep;
use crate::records::{BlockInfo, JobKind, ManagementObject, ManagementState};
use crate::registry::{Registry, SectionStatus};
use crate::startup::{decide, SideStatus};
use crate::success_codes::SuccessCode;
use crate::switch::SwitchCheckpoint;
use crate::tickee::{EngineStatus, Mode, TickEE, UserJob, UserJobResult};
use quickcheck::{quickcheck, TestResult};
use std::boxed::Box;
use std::cell::{Cell, RefCell};
use std::vec::Vec;

const SECTIONS: usize = 4;
const SECTION_SIZE: usize = 1024;
const FLASH_SIZE: usize = SECTIONS * SECTION_SIZE;
const TICK_LIMIT: usize = 100_000;

static BLOCKS: [BlockConfig; 10] = [
    BlockConfig::new(1, 16),
    BlockConfig::new(2, 16),
    BlockConfig::new(3, 16),
    BlockConfig::new(4, 16),
    BlockConfig::new(5, 16),
    BlockConfig::new(6, 16),
    BlockConfig::new(7, 16),
    BlockConfig::new(8, 16),
    BlockConfig::new(9, 16),
    BlockConfig::new(10, 16),
];

/// Flash simulation with NOR programming semantics, optional latency,
/// fault injection and power loss snapshots.
struct FakeFlash {
    flash: RefCell<Vec<u8>>,
    latency: usize,
    busy: Cell<usize>,
    result: Cell<JobResult>,
    fail_read_at: Cell<Option<usize>>,
    fail_writes: Cell<usize>,
    refuse_writes: Cell<usize>,
    writes: Cell<usize>,
    erases: Cell<usize>,
    cancels: Cell<usize>,
    snapshots: RefCell<Option<Vec<Vec<u8>>>>,
}

impl FakeFlash {
    fn new() -> Self {
        Self::from_image(vec![0xFF; FLASH_SIZE])
    }

    fn from_image(image: Vec<u8>) -> Self {
        Self {
            flash: RefCell::new(image),
            latency: 0,
            busy: Cell::new(0),
            result: Cell::new(JobResult::Complete),
            fail_read_at: Cell::new(None),
            fail_writes: Cell::new(0),
            refuse_writes: Cell::new(0),
            writes: Cell::new(0),
            erases: Cell::new(0),
            cancels: Cell::new(0),
            snapshots: RefCell::new(None),
        }
    }

    fn with_latency(mut self, latency: usize) -> Self {
        self.latency = latency;
        self
    }

    /// The flash contents at the moment power is lost.
    fn image(&self) -> Vec<u8> {
        self.flash.borrow().clone()
    }

    /// Keep the flash contents a power loss could leave behind during and
    /// after every write and erase from now on.
    fn record_snapshots(&self) {
        *self.snapshots.borrow_mut() = Some(Vec::new());
    }

    fn take_snapshots(&self) -> Vec<Vec<u8>> {
        self.snapshots.borrow_mut().take().unwrap_or_default()
    }

    fn snapshot(&self, flash: &[u8]) {
        if let Some(snapshots) = self.snapshots.borrow_mut().as_mut() {
            snapshots.push(flash.to_vec());
        }
    }

    fn start_job(&self, ok: bool) {
        self.busy.set(self.latency);
        self.result.set(if ok {
            JobResult::Complete
        } else {
            JobResult::Failed
        });
    }
}

impl FlashController for FakeFlash {
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), ErrorCode> {
        if self.fail_read_at.get() == Some(address) {
            return Err(ErrorCode::ReadFail);
        }
        buf.copy_from_slice(&self.flash.borrow()[address..address + buf.len()]);
        Ok(())
    }

    fn write(&self, address: usize, buf: &[u8]) -> Result<(), ErrorCode> {
        if self.refuse_writes.get() > 0 {
            self.refuse_writes.set(self.refuse_writes.get() - 1);
            return Err(ErrorCode::FlashRefused);
        }
        if self.fail_writes.get() > 0 {
            self.fail_writes.set(self.fail_writes.get() - 1);
            self.start_job(false);
            return Ok(());
        }

        let mut flash = self.flash.borrow_mut();
        for (i, d) in buf.iter().enumerate() {
            if i == buf.len() / 2 {
                self.snapshot(&flash);
            }
            flash[address + i] &= *d;
        }
        self.snapshot(&flash);
        self.writes.set(self.writes.get() + 1);
        self.start_job(true);
        Ok(())
    }

    fn erase(&self, address: usize, len: usize) -> Result<(), ErrorCode> {
        let mut flash = self.flash.borrow_mut();
        flash[address..address + len / 2].fill(0xFF);
        self.snapshot(&flash);
        flash[address..address + len].fill(0xFF);
        self.snapshot(&flash);
        drop(flash);
        self.erases.set(self.erases.get() + 1);
        self.start_job(true);
        Ok(())
    }

    fn job_result(&self) -> JobResult {
        if self.busy.get() > 0 {
            self.busy.set(self.busy.get() - 1);
            return JobResult::Pending;
        }
        self.result.get()
    }

    fn cancel(&self) {
        self.cancels.set(self.cancels.get() + 1);
        self.busy.set(0);
    }
}

type Ring<const N: usize> = TickEE<'static, FakeFlash, N>;
type Engine = Ring<SECTIONS>;

fn leak<T: Clone>(value: T, len: usize) -> &'static mut [T] {
    Box::leak(vec![value; len].into_boxed_slice())
}

fn engine_with(flash: FakeFlash, blocks: &'static [BlockConfig], config: Config) -> Engine {
    let engine = TickEE::new(
        flash,
        config,
        blocks,
        leak(CacheEntry::EMPTY, blocks.len() + 2),
        leak(0u8, 64),
        leak(0u8, 64),
    );
    match engine {
        Ok(engine) => engine,
        Err(e) => panic!("engine rejected its configuration: {:?}", e),
    }
}

fn started_with(flash: FakeFlash, blocks: &'static [BlockConfig], config: Config) -> Engine {
    let mut tickee = engine_with(flash, blocks, config);
    assert_eq!(tickee.init(), Ok(SuccessCode::Queued));
    settle(&mut tickee);
    tickee
}

fn started(flash: FakeFlash) -> Engine {
    started_with(flash, &BLOCKS, Config::new(0, SECTION_SIZE))
}

/// Simulate a power loss: a new engine over the current flash contents.
fn restart(tickee: &Engine) -> Engine {
    started(FakeFlash::from_image(tickee.controller.image()))
}

fn check_invariants<const N: usize>(tickee: &Ring<N>) {
    assert!(tickee.registry.active_count() <= 1);
    if tickee.mode == Mode::Running && tickee.activating.is_none() {
        assert_eq!(tickee.registry.active_count(), 1);
        assert_eq!(
            tickee.section_status(tickee.active_section()),
            SectionStatus::Active
        );
    }
    let layout = tickee.layout();
    let cursors = tickee.cursors();
    assert!(cursors.data().0 <= cursors.info().0 + layout.slot_len());
}

fn settle<const N: usize>(tickee: &mut Ring<N>) {
    for _ in 0..TICK_LIMIT {
        if tickee.status() == EngineStatus::Idle {
            return;
        }
        tickee.main_function();
        check_invariants(tickee);
    }
    panic!("engine did not settle");
}

fn finish<const N: usize>(tickee: &mut Ring<N>) -> UserJobResult {
    for _ in 0..TICK_LIMIT {
        if tickee.job_result() != UserJobResult::Pending {
            return tickee.job_result();
        }
        tickee.main_function();
        check_invariants(tickee);
    }
    panic!("user job did not finish");
}

fn write<const N: usize>(tickee: &mut Ring<N>, id: u16, value: u8) -> UserJobResult {
    let data: &'static [u8] = leak(value, 16);
    for _ in 0..TICK_LIMIT {
        match tickee.write(id, data) {
            Ok(_) => return finish(tickee),
            Err(ErrorCode::Busy) => tickee.main_function(),
            Err(e) => panic!("write of block {} refused: {:?}", id, e),
        }
    }
    panic!("write of block {} never accepted", id);
}

fn read<const N: usize>(tickee: &mut Ring<N>, id: u16) -> (UserJobResult, Vec<u8>) {
    read_at(tickee, id, 0, 16)
}

fn read_at<const N: usize>(
    tickee: &mut Ring<N>,
    id: u16,
    offset: usize,
    len: usize,
) -> (UserJobResult, Vec<u8>) {
    let buf = leak(0u8, len);
    assert_eq!(tickee.read(id, offset, buf), Ok(SuccessCode::Queued));
    let result = finish(tickee);
    let buf = tickee.take_read_buffer().unwrap();
    (result, buf.to_vec())
}

fn read_custom(tickee: &mut Engine, id: u16, len: usize) -> (UserJobResult, Vec<u8>) {
    let buf = leak(0u8, len);
    assert_eq!(tickee.read_custom(id, 0, buf), Ok(SuccessCode::Queued));
    let result = finish(tickee);
    let buf = tickee.take_read_buffer().unwrap();
    (result, buf.to_vec())
}

fn assert_value<const N: usize>(tickee: &mut Ring<N>, id: u16, value: u8) {
    let (result, data) = read(tickee, id);
    assert_eq!(result, UserJobResult::Ok, "block {}", id);
    assert_eq!(data, vec![value; 16], "block {}", id);
}

fn section_of<const N: usize>(tickee: &Ring<N>, id: u16) -> Option<usize> {
    match tickee.block_location(id)? {
        Location::Absent => None,
        Location::Data { address, .. } => Some(address / SECTION_SIZE),
        Location::Invalid { section } | Location::Inconsistent { section } => Some(section),
    }
}

/// Write every block once, block `id` holding `id` in every byte.
fn write_all<const N: usize>(tickee: &mut Ring<N>) {
    for id in 1..=10 {
        assert_eq!(write(tickee, id, id as u8), UserJobResult::Ok);
    }
}

/// Rewrite block 1 until `section` is active.
fn fill_until_active<const N: usize>(tickee: &mut Ring<N>, section: usize) {
    let mut value = 0x80;
    for _ in 0..1000 {
        if tickee.active_section() == section {
            return;
        }
        assert_eq!(write(tickee, 1, value), UserJobResult::Ok);
        value = value.wrapping_add(1);
    }
    panic!("section {} never became active", section);
}

/// Run the queued user record until its data job has been issued.
fn run_until_data(tickee: &mut Engine) {
    for _ in 0..TICK_LIMIT {
        if let UserJob::Record {
            record: Some(record),
            ..
        } = tickee.user
        {
            if let RecordStep::Data { .. } = record.step {
                return;
            }
        }
        tickee.main_function();
    }
    panic!("user record never reached its data");
}

/// Run the switch until the copy of block `id` has its first job issued.
fn run_until_copying(tickee: &mut Engine, id: u16) {
    for _ in 0..TICK_LIMIT {
        if let SwitchCheckpoint::Copy {
            index,
            record: Some(_),
            ..
        } = tickee.switch_checkpoint()
        {
            if tickee.cache_entries()[index].id == id {
                return;
            }
        }
        tickee.main_function();
    }
    panic!("block {} was never copied", id);
}

mod codec {
    use super::*;

    #[test]
    fn crc8_is_sae_j1850() {
        assert_eq!(crc8(b"123456789"), 0x4B);
    }

    #[test]
    fn block_info_layout() {
        let mut buf = [0; 16];
        let info = BlockInfo {
            block_id: 1,
            length: 16,
            data_address: 32,
            kind: JobKind::Write,
        };
        info.encode(&mut buf);

        assert_eq!(&buf[..9], &[0x01, 0x00, 0x10, 0x00, 0x20, 0x00, 0x00, 0x00, 0xBB]);
        // (1 + 16 + 32 + 0xBB) ^ 0xAA
        assert_eq!(buf[9], 0x46);
        // Alignment padding stays erased
        assert_eq!(&buf[10..], &[0xFF; 6]);
        assert_eq!(BlockInfo::decode(&buf), Some(info));
    }

    #[test]
    fn block_info_rejects_unknown_kind() {
        let mut buf = [0; 10];
        BlockInfo {
            block_id: 3,
            length: 0,
            data_address: 0,
            kind: JobKind::Invalidation,
        }
        .encode(&mut buf);
        buf[8] = 0x12;
        buf[9] = crate::checksum::block_info_checksum(&buf[..9]);
        assert_eq!(BlockInfo::decode(&buf), None);
    }

    #[test]
    fn management_object_states() {
        let object = ManagementObject {
            erase_counter: 7,
            config_id: 1,
            section_counter: 3,
        };
        let mut buf = [0; 8];
        object.encode(&mut buf);
        assert_eq!(
            ManagementObject::decode(&buf, |id| id == 1),
            ManagementState::Valid {
                section_counter: 3,
                erase_counter: Some(7)
            }
        );
        assert_eq!(
            ManagementObject::decode(&buf, |id| id == 2),
            ManagementState::Foreign(1)
        );

        let mut torn = buf;
        torn[0] ^= 0x01;
        assert_eq!(
            ManagementObject::decode(&torn, |id| id == 1),
            ManagementState::Valid {
                section_counter: 3,
                erase_counter: None
            }
        );

        let mut torn = buf;
        torn[6] ^= 0x01;
        assert_eq!(
            ManagementObject::decode(&torn, |id| id == 1),
            ManagementState::Invalid
        );

        assert_eq!(
            ManagementObject::decode(&[0xFF; 8], |_| true),
            ManagementState::Erased
        );
    }

    #[test]
    fn markers_and_patterns() {
        assert!(Marker::Active.is_set(&[0xFF, 0xAA, 0xFF]));
        assert!(!Marker::Active.is_set(&[0xFF; 8]));
        assert!(!Marker::Erasable.is_set(&[0xAA; 8]));

        let mut buf = [0xFF; 8];
        pattern::encode(&mut buf);
        assert!(pattern::is_valid(&buf));
        buf[7] = 0xFF;
        assert!(!pattern::is_valid(&buf));
        assert!(!pattern::is_valid(&[]));
    }

    quickcheck! {
        fn prop_info_detects_single_byte_corruption(
            id: u16,
            length: u16,
            address: u32,
            position: usize,
            flip: u8
        ) -> TestResult {
            if flip == 0 {
                return TestResult::discard();
            }
            let mut buf = [0; 10];
            BlockInfo {
                block_id: id,
                length,
                data_address: address,
                kind: JobKind::Migration,
            }
            .encode(&mut buf);
            buf[position % 10] ^= flip;
            TestResult::from_bool(BlockInfo::decode(&buf).is_none())
        }

        fn prop_marker_needs_one_byte(bytes: Vec<u8>, position: usize) -> TestResult {
            if bytes.is_empty() {
                return TestResult::discard();
            }
            let mut bytes: Vec<u8> = bytes
                .into_iter()
                .map(|b| if b == 0x96 { 0 } else { b })
                .collect();
            if Marker::Written.is_set(&bytes) {
                return TestResult::failed();
            }
            let i = position % bytes.len();
            bytes[i] = Marker::Written.value();
            TestResult::from_bool(Marker::Written.is_set(&bytes))
        }

        fn prop_pattern_needs_every_byte(len: u8, position: usize, value: u8) -> TestResult {
            if len == 0 || value == pattern::CONSISTENCY_PATTERN {
                return TestResult::discard();
            }
            let mut bytes = vec![0xFF; len as usize];
            pattern::encode(&mut bytes);
            if !pattern::is_valid(&bytes) {
                return TestResult::failed();
            }
            let i = position % bytes.len();
            bytes[i] = value;
            TestResult::from_bool(!pattern::is_valid(&bytes))
        }
    }
}

mod geometry {
    use super::*;

    #[test]
    fn layout_with_end_patterns() {
        let layout = Layout::new(&Config::new(0, SECTION_SIZE));

        assert_eq!(layout.header_len(), 32);
        assert_eq!(layout.slot_len(), 32);
        assert_eq!(layout.field(Side::Header, Field::ErasableMarker), (0, 8));
        assert_eq!(layout.field(Side::Header, Field::Management), (8, 8));
        assert_eq!(layout.field(Side::Header, Field::EndPattern), (16, 8));
        assert_eq!(layout.field(Side::Header, Field::ActiveMarker), (24, 8));
        assert_eq!(layout.field(Side::Footer, Field::ActiveMarker), (0, 8));
        assert_eq!(layout.field(Side::Footer, Field::ErasableMarker), (24, 8));

        assert_eq!(layout.data_start(1), 1056);
        assert_eq!(layout.footer_start(1), 2016);
        assert_eq!(layout.first_slot(1), 1984);
        assert_eq!(layout.record_len(10), 48);
        assert_eq!(layout.section_of(2047, SECTIONS), Some(1));
        assert_eq!(layout.section_of(FLASH_SIZE, SECTIONS), None);
    }

    #[test]
    fn layout_pattern_modes() {
        let mut config = Config::new(0x1000, 512);
        config.pattern_mode = PatternMode::StartAndEnd;
        let layout = Layout::new(&config);
        assert_eq!(layout.slot_len(), 40);
        assert_eq!(layout.info_offset(), 8);
        assert_eq!(layout.written_marker_offset(), 32);
        assert_eq!(layout.section_start(1), 0x1200);

        config.pattern_mode = PatternMode::None;
        let layout = Layout::new(&config);
        assert_eq!(layout.header_len(), 24);
        assert_eq!(layout.slot_len(), 24);
        assert_eq!(layout.field(Side::Header, Field::ActiveMarker), (16, 8));
    }

    #[test]
    fn config_validation() {
        static DUPLICATE: [BlockConfig; 2] = [BlockConfig::new(4, 16), BlockConfig::new(4, 8)];
        static TOO_MANY: [BlockConfig; 20] = {
            let mut blocks = [BlockConfig::new(0, 16); 20];
            let mut i = 0;
            while i < 20 {
                blocks[i] = BlockConfig::new(i as u16, 16);
                i += 1;
            }
            blocks
        };
        let config = Config::new(0, SECTION_SIZE);

        let two_sections = TickEE::<FakeFlash, 2>::new(
            FakeFlash::new(),
            config,
            &BLOCKS,
            leak(CacheEntry::EMPTY, 10),
            leak(0u8, 64),
            leak(0u8, 64),
        );
        assert_eq!(two_sections.err(), Some(ErrorCode::InvalidConfig));

        for blocks in [&DUPLICATE[..], &TOO_MANY[..]] {
            let result = TickEE::<FakeFlash, SECTIONS>::new(
                FakeFlash::new(),
                config,
                blocks,
                leak(CacheEntry::EMPTY, 20),
                leak(0u8, 64),
                leak(0u8, 64),
            );
            assert_eq!(result.err(), Some(ErrorCode::InvalidConfig));
        }

        let small_buffer = TickEE::<FakeFlash, SECTIONS>::new(
            FakeFlash::new(),
            config,
            &BLOCKS,
            leak(CacheEntry::EMPTY, 10),
            leak(0u8, 16),
            leak(0u8, 64),
        );
        assert_eq!(small_buffer.err(), Some(ErrorCode::BufferTooSmall));

        let mut odd_page = config;
        odd_page.page_size = 12;
        let result = TickEE::<FakeFlash, SECTIONS>::new(
            FakeFlash::new(),
            odd_page,
            &BLOCKS,
            leak(CacheEntry::EMPTY, 10),
            leak(0u8, 64),
            leak(0u8, 64),
        );
        assert_eq!(result.err(), Some(ErrorCode::InvalidConfig));
    }

    #[test]
    fn cursors_keep_the_margin() {
        let layout = Layout::new(&Config::new(0, SECTION_SIZE));
        let mut cursors = Cursors::new(&layout, 0);

        // 896 free bytes, 48 per record
        let mut count = 0;
        while cursors.reserve(&layout, 16).is_ok() {
            count += 1;
        }
        assert_eq!(count, 18);
        assert!(!cursors.fits(&layout, 1, 0));
        assert_eq!(cursors.reserve(&layout, 1), Err(ErrorCode::InvalidLength));
    }

    #[test]
    fn cursors_roll_back_only_the_latest() {
        let layout = Layout::new(&Config::new(0, SECTION_SIZE));
        let mut cursors = Cursors::new(&layout, 1);
        let first = cursors.reserve(&layout, 16).unwrap();
        let second = cursors.reserve(&layout, 8).unwrap();

        assert!(!cursors.rollback(&layout, &first));
        assert!(cursors.rollback(&layout, &second));
        assert!(cursors.rollback(&layout, &first));
        assert_eq!(cursors, Cursors::new(&layout, 1));
    }

    quickcheck! {
        fn prop_cursors_never_cross(lengths: Vec<u16>) -> bool {
            let layout = Layout::new(&Config::new(0, SECTION_SIZE));
            let mut cursors = Cursors::new(&layout, 2);
            let slot = layout.slot_len();
            for len in lengths {
                let len = (len % 200) as usize;
                let fits = cursors.fits(&layout, len, 0);
                match cursors.reserve(&layout, len) {
                    Ok(r) => {
                        if !fits || r.data + r.data_len > r.slot {
                            return false;
                        }
                    }
                    Err(_) => {
                        if fits {
                            return false;
                        }
                    }
                }
                if cursors.data().0 + layout.margin() * slot > cursors.info().0 + slot {
                    return false;
                }
            }
            true
        }
    }
}

mod bookkeeping {
    use super::*;

    #[test]
    fn ring_arithmetic() {
        assert_eq!(Registry::<4>::next(3), 0);
        assert_eq!(Registry::<4>::previous(0), 3);
        assert_eq!(Registry::<4>::distance(3, 1), 2);
        assert_eq!(Registry::<4>::distance(1, 1), 0);
    }

    #[test]
    fn one_active_section() {
        let mut registry = Registry::<4>::new();
        registry.set_status(0, SectionStatus::Active);
        registry.set_status(1, SectionStatus::Active);
        assert_eq!(registry.active, 1);
        assert_eq!(registry.status(0), SectionStatus::Full);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn switch_due_half_way_round() {
        let mut registry = Registry::<4>::new();
        registry.oldest = 0;
        registry.active = 1;
        assert!(!registry.needs_switch());
        registry.active = 2;
        assert!(registry.needs_switch());
        assert!(!registry.ring_closed());
        registry.active = 3;
        assert!(registry.ring_closed());
    }

    #[test]
    fn lost_erase_counters_continue_from_the_maximum() {
        let mut registry = Registry::<4>::new();
        registry.set_management(0, 5, Some(12));
        registry.set_management(1, 6, None);
        registry.set_management(2, 7, Some(3));
        registry.settle_erase_counters();
        assert_eq!(registry.get(1).erase_counter, 12);
        assert_eq!(registry.get(3).erase_counter, 12);
        assert_eq!(registry.get(2).erase_counter, 3);

        registry.count_erase(2);
        assert_eq!(registry.get(2).erase_counter, 4);
        assert_eq!(registry.status(2), SectionStatus::Erased);
        assert_eq!(registry.max_erase_counter, 12);
    }

    #[test]
    fn section_counters_follow_the_ring() {
        let mut registry = Registry::<4>::new();
        registry.set_management(2, 254, Some(1));
        registry.set_status(2, SectionStatus::Active);
        assert_eq!(registry.counter_for(3), 255);
        assert_eq!(registry.counter_for(0), 0);
        assert_eq!(registry.counter_for(1), 1);
    }

    #[test]
    fn buffer_pool_ownership() {
        let management = leak(0u8, 32);
        let data = leak(0u8, 128);
        let mut pool = BufferPool::new(management, data);

        let small = pool.allocate(Requester::Lifecycle, 16).unwrap();
        assert_eq!(pool.get(small).len(), 32);
        assert_eq!(pool.owner(small), Some(Requester::Lifecycle));

        let large = pool.allocate(Requester::Switch, 16).unwrap();
        assert_eq!(pool.get(large).len(), 128);
        assert_eq!(pool.allocate(Requester::User, 8), Err(ErrorCode::Busy));
        assert_eq!(
            pool.allocate(Requester::User, 256),
            Err(ErrorCode::BufferTooSmall)
        );

        pool.release(small);
        pool.release(large);
        assert!(pool.is_idle());
    }

    #[test]
    fn migration_order() {
        static ORDERED: [BlockConfig; 3] = [
            BlockConfig::new(5, 16),
            BlockConfig::critical(9, 16),
            BlockConfig::new(2, 16),
        ];
        let mut cache = BlockCache::new(&ORDERED, leak(CacheEntry::EMPTY, 4));
        assert_eq!(cache.adopt_spare(1), Some(3));
        assert_eq!(cache.adopt_spare(6), None);

        let mut order = Vec::new();
        let mut after = None;
        while let Some((index, key)) = cache.next_in_order(after) {
            order.push(cache.id(index));
            after = Some(key);
        }
        assert_eq!(order, vec![9, 2, 5, 1]);
        assert!(cache.is_configured(2));
        assert!(!cache.is_configured(3));
    }

    #[test]
    fn header_and_footer_decide_the_status() {
        use SideStatus::*;
        assert_eq!(decide(Erased, Erased), SectionStatus::Inconsistent);
        assert_eq!(decide(Empty, Erased), SectionStatus::NoFooter);
        assert_eq!(decide(Empty, Empty), SectionStatus::Empty);
        assert_eq!(decide(Active, Empty), SectionStatus::Active);
        assert_eq!(decide(Inconsistent, Active), SectionStatus::Active);
        assert_eq!(decide(Erasable, Active), SectionStatus::ErasableHeader);
        assert_eq!(decide(Active, Erasable), SectionStatus::Erasable);
        assert_eq!(decide(ActiveInconsistent, Erased), SectionStatus::Inconsistent);
        assert_eq!(decide(Erased, Empty), SectionStatus::Empty);
    }
}

mod engine {
    use super::*;

    #[test]
    fn first_boot_prepares_the_ring() {
        let mut tickee = engine_with(FakeFlash::new(), &BLOCKS, Config::new(0, SECTION_SIZE));
        assert_eq!(tickee.status(), EngineStatus::Uninit);
        assert_eq!(tickee.init(), Ok(SuccessCode::Queued));
        assert_eq!(tickee.status(), EngineStatus::BusyInternal);
        settle(&mut tickee);

        assert_eq!(tickee.active_section(), 0);
        assert_eq!(tickee.oldest_section(), 0);
        assert_eq!(tickee.section_status(0), SectionStatus::Active);
        for section in 1..SECTIONS {
            assert_eq!(tickee.section_status(section), SectionStatus::Empty);
        }
        for section in 0..SECTIONS {
            assert_eq!(tickee.section_erase_counter(section), 1);
        }
        assert_eq!(tickee.erase_counter(), 1);
        assert_eq!(tickee.controller.erases.get(), SECTIONS);
        assert_eq!(tickee.lifecycle_state(), LifecycleState::Idle);
        assert_eq!(tickee.frozen_by(), None);
    }

    #[test]
    fn requests_are_checked() {
        let mut tickee = engine_with(FakeFlash::new(), &BLOCKS, Config::new(0, SECTION_SIZE));
        assert_eq!(tickee.write(1, leak(0u8, 16)), Err(ErrorCode::NotInitialised));
        assert_eq!(tickee.freeze_activities(true), Err(ErrorCode::NotInitialised));

        tickee.init().unwrap();
        settle(&mut tickee);
        assert_eq!(tickee.write(11, leak(0u8, 16)), Err(ErrorCode::KeyNotFound));
        assert_eq!(tickee.write(1, leak(0u8, 17)), Err(ErrorCode::InvalidLength));
        assert_eq!(tickee.write(1, leak(0u8, 0)), Err(ErrorCode::InvalidLength));
        assert_eq!(tickee.read(1, 8, leak(0u8, 16)), Err(ErrorCode::InvalidLength));
        assert_eq!(
            tickee.read(1, usize::MAX, leak(0u8, 1)),
            Err(ErrorCode::InvalidLength)
        );
        assert_eq!(tickee.read(11, 0, leak(0u8, 1)), Err(ErrorCode::KeyNotFound));
        assert_eq!(tickee.read_custom(1, 0, leak(0u8, 1)), Err(ErrorCode::KeyNotFound));
        assert_eq!(
            tickee.write_custom(11, leak(0u8, 1)),
            Err(ErrorCode::InvalidLength)
        );

        assert_eq!(tickee.write(1, leak(0u8, 16)), Ok(SuccessCode::Queued));
        assert_eq!(tickee.status(), EngineStatus::Busy);
        assert_eq!(tickee.invalidate(2), Err(ErrorCode::Busy));
        assert_eq!(finish(&mut tickee), UserJobResult::Ok);
    }

    #[test]
    fn write_read_invalidate() {
        let mut tickee = started(FakeFlash::new());

        let (result, _) = read(&mut tickee, 2);
        assert_eq!(result, UserJobResult::BlockInvalid);

        assert_eq!(write(&mut tickee, 1, 0x11), UserJobResult::Ok);
        assert_value(&mut tickee, 1, 0x11);
        assert_eq!(write(&mut tickee, 1, 0x12), UserJobResult::Ok);
        assert_value(&mut tickee, 1, 0x12);

        let buf = leak(0u8, 4);
        tickee.read(1, 12, buf).unwrap();
        assert_eq!(finish(&mut tickee), UserJobResult::Ok);
        assert_eq!(tickee.take_read_buffer().unwrap(), &[0x12; 4]);

        tickee.invalidate(1).unwrap();
        assert_eq!(finish(&mut tickee), UserJobResult::Ok);
        assert_eq!(read(&mut tickee, 1).0, UserJobResult::BlockInvalid);
        assert_eq!(tickee.block_location(1), Some(Location::Invalid { section: 0 }));

        assert_eq!(write(&mut tickee, 2, 0x22), UserJobResult::Ok);
        tickee.erase_immediate(2).unwrap();
        assert_eq!(finish(&mut tickee), UserJobResult::Ok);
        assert_eq!(read(&mut tickee, 2).0, UserJobResult::BlockInconsistent);
    }

    #[test]
    fn blocks_survive_a_restart() {
        let mut tickee = started(FakeFlash::new());
        for id in 1..=10 {
            assert_eq!(write(&mut tickee, id, 0x40 + id as u8), UserJobResult::Ok);
        }
        tickee.invalidate(3).unwrap();
        assert_eq!(finish(&mut tickee), UserJobResult::Ok);
        tickee.erase_immediate(4).unwrap();
        assert_eq!(finish(&mut tickee), UserJobResult::Ok);
        let cursors = tickee.cursors();

        let mut tickee = restart(&tickee);
        assert_eq!(tickee.cursors(), cursors);
        assert_eq!(tickee.erase_counter(), 1);
        assert_eq!(read(&mut tickee, 3).0, UserJobResult::BlockInvalid);
        assert_eq!(read(&mut tickee, 4).0, UserJobResult::BlockInconsistent);
        for id in (1..=10).filter(|id| *id != 3 && *id != 4) {
            assert_value(&mut tickee, id, 0x40 + id as u8);
        }

        // Nothing was erased again
        assert_eq!(tickee.controller.erases.get(), 0);
    }

    #[test]
    fn switch_starts_half_way_round() {
        let mut tickee = started(FakeFlash::new());
        write_all(&mut tickee);

        fill_until_active(&mut tickee, 1);
        settle(&mut tickee);
        assert_eq!(tickee.switch_checkpoint(), SwitchCheckpoint::Idle);
        assert_eq!(tickee.oldest_section(), 0);
        assert_eq!(tickee.section_status(0), SectionStatus::Full);

        let mut value = 0xA0;
        while tickee.active_section() != 2 {
            assert_eq!(write(&mut tickee, 1, value), UserJobResult::Ok);
            value += 1;
        }
        assert_ne!(tickee.switch_checkpoint(), SwitchCheckpoint::Idle);

        settle(&mut tickee);
        assert_eq!(tickee.switch_checkpoint(), SwitchCheckpoint::Idle);
        assert_eq!(tickee.oldest_section(), 1);
        assert_eq!(tickee.active_section(), 2);
        assert_eq!(tickee.section_status(0), SectionStatus::Empty);
        assert_eq!(tickee.section_erase_counter(0), 2);
        assert_eq!(tickee.erase_counter(), 2);

        assert_value(&mut tickee, 1, value - 1);
        for id in 2..=10 {
            assert_eq!(section_of(&tickee, id), Some(2));
            assert_value(&mut tickee, id, id as u8);
        }

        // The same picture after a restart
        let mut tickee = restart(&tickee);
        assert_eq!(tickee.oldest_section(), 1);
        assert_eq!(tickee.active_section(), 2);
        for id in 2..=10 {
            assert_value(&mut tickee, id, id as u8);
        }
    }

    #[test]
    fn asynchronous_flash() {
        let mut tickee = started(FakeFlash::new().with_latency(3));
        write_all(&mut tickee);
        fill_until_active(&mut tickee, 2);
        settle(&mut tickee);

        assert_eq!(tickee.oldest_section(), 1);
        for id in 2..=10 {
            assert_value(&mut tickee, id, id as u8);
        }
    }

    #[test]
    fn crash_during_switch_resumes() {
        let mut tickee = started(FakeFlash::new());
        write_all(&mut tickee);
        fill_until_active(&mut tickee, 2);
        let last = match read(&mut tickee, 1) {
            (UserJobResult::Ok, data) => data[0],
            (result, _) => panic!("block 1 unreadable: {:?}", result),
        };

        // Power is lost once three blocks moved out of section 0
        let mut moved = 0;
        for _ in 0..TICK_LIMIT {
            moved = (2..=10)
                .filter(|id| section_of(&tickee, *id) == Some(2))
                .count();
            if moved >= 3 {
                break;
            }
            tickee.main_function();
        }
        assert_eq!(moved, 3);
        assert!(matches!(
            tickee.switch_checkpoint(),
            SwitchCheckpoint::Copy { .. } | SwitchCheckpoint::SelectNextBlock { .. }
        ));

        let mut tickee = restart(&tickee);
        assert_eq!(tickee.active_section(), 2);
        assert_eq!(tickee.oldest_section(), 1);
        assert_eq!(tickee.section_status(0), SectionStatus::Empty);
        assert_value(&mut tickee, 1, last);
        for id in 2..=10 {
            assert_eq!(section_of(&tickee, id), Some(2));
            assert_value(&mut tickee, id, id as u8);
        }
    }

    #[test]
    fn unreadable_block_becomes_inconsistent() {
        let mut tickee = started(FakeFlash::new());
        write_all(&mut tickee);
        let address = match tickee.block_location(7) {
            Some(Location::Data { address, .. }) => address,
            other => panic!("block 7 at {:?}", other),
        };
        tickee.controller.fail_read_at.set(Some(address));

        fill_until_active(&mut tickee, 2);
        settle(&mut tickee);

        assert_eq!(
            tickee.block_location(7),
            Some(Location::Inconsistent { section: 2 })
        );
        assert_eq!(read(&mut tickee, 7).0, UserJobResult::BlockInconsistent);
        for id in 8..=10 {
            assert_eq!(section_of(&tickee, id), Some(2));
            assert_value(&mut tickee, id, id as u8);
        }

        let mut tickee = restart(&tickee);
        assert_eq!(read(&mut tickee, 7).0, UserJobResult::BlockInconsistent);
        assert_value(&mut tickee, 8, 8);
    }

    #[test]
    fn failed_writes_are_retried_once() {
        let mut tickee = started(FakeFlash::new());
        assert_eq!(write(&mut tickee, 5, 0x55), UserJobResult::Ok);

        tickee.controller.fail_writes.set(1);
        assert_eq!(write(&mut tickee, 5, 0x56), UserJobResult::Ok);
        assert_value(&mut tickee, 5, 0x56);

        tickee.controller.refuse_writes.set(1);
        assert_eq!(write(&mut tickee, 5, 0x57), UserJobResult::Ok);
        assert_value(&mut tickee, 5, 0x57);

        // Nothing reached the flash, the space is given back
        let cursors = tickee.cursors();
        tickee.controller.fail_writes.set(2);
        assert_eq!(write(&mut tickee, 5, 0x58), UserJobResult::Failed);
        assert_eq!(tickee.cursors(), cursors);
        assert_value(&mut tickee, 5, 0x57);

        tickee.controller.refuse_writes.set(2);
        assert_eq!(write(&mut tickee, 5, 0x58), UserJobResult::Failed);
        assert_eq!(tickee.cursors(), cursors);
        assert_value(&mut tickee, 5, 0x57);

        assert_eq!(write(&mut tickee, 5, 0x59), UserJobResult::Ok);
        assert_value(&mut tickee, 5, 0x59);
        assert_value(&mut restart(&tickee), 5, 0x59);
    }

    #[test]
    fn torn_write_is_not_exposed() {
        let mut tickee = started(FakeFlash::new());
        assert_eq!(write(&mut tickee, 6, 0x61), UserJobResult::Ok);

        tickee.write(6, leak(0x62u8, 16)).unwrap();
        run_until_data(&mut tickee);

        // The data landed, the written marker did not
        let mut tickee = restart(&tickee);
        assert_value(&mut tickee, 6, 0x61);
        assert_eq!(write(&mut tickee, 6, 0x63), UserJobResult::Ok);
        assert_value(&mut restart(&tickee), 6, 0x63);
    }

    #[test]
    fn cancel_drops_the_user_job() {
        let mut tickee = started(FakeFlash::new().with_latency(5));
        assert_eq!(tickee.cancel(), Ok(SuccessCode::Complete));

        tickee.write(2, leak(0x21u8, 16)).unwrap();
        tickee.main_function();
        assert_eq!(tickee.cancel(), Ok(SuccessCode::Cancelled));
        assert_eq!(tickee.job_result(), UserJobResult::Cancelled);
        assert_eq!(tickee.controller.cancels.get(), 1);

        settle(&mut tickee);
        assert_eq!(read(&mut tickee, 2).0, UserJobResult::BlockInvalid);
        assert_eq!(write(&mut tickee, 2, 0x22), UserJobResult::Ok);
        assert_value(&mut tickee, 2, 0x22);
    }

    #[test]
    fn user_request_preempts_an_erase() {
        let mut tickee = engine_with(
            FakeFlash::new().with_latency(5),
            &BLOCKS,
            Config::new(0, SECTION_SIZE),
        );
        tickee.init().unwrap();
        for _ in 0..TICK_LIMIT {
            if tickee.job.is_some_and(|job| job.erase) {
                break;
            }
            tickee.main_function();
        }

        tickee.write(3, leak(0x33u8, 16)).unwrap();
        assert_eq!(tickee.controller.cancels.get(), 1);
        assert_eq!(finish(&mut tickee), UserJobResult::Ok);

        settle(&mut tickee);
        assert_value(&mut tickee, 3, 0x33);
        for section in 1..SECTIONS {
            assert_eq!(tickee.section_status(section), SectionStatus::Empty);
        }
    }

    #[test]
    fn erase_counters_only_grow() {
        let mut tickee = started(FakeFlash::new());
        for id in 2..=10 {
            assert_eq!(write(&mut tickee, id, id as u8), UserJobResult::Ok);
        }

        let mut seen = [0; SECTIONS];
        for i in 0..200u32 {
            assert_eq!(write(&mut tickee, 1, i as u8), UserJobResult::Ok);
            for (section, last) in seen.iter_mut().enumerate() {
                let counter = tickee.section_erase_counter(section);
                assert!(counter >= *last);
                *last = counter;
            }
            assert_eq!(tickee.erase_counter(), *seen.iter().max().unwrap());
        }
        settle(&mut tickee);

        // The ring went round more than once
        assert!(tickee.erase_counter() > 2);
        assert_value(&mut tickee, 1, 199);
        for id in 2..=10 {
            assert_value(&mut tickee, id, id as u8);
        }

        let counters: Vec<u32> = (0..SECTIONS)
            .map(|s| tickee.section_erase_counter(s))
            .collect();
        let tickee = restart(&tickee);
        for (section, counter) in counters.iter().enumerate() {
            assert_eq!(tickee.section_erase_counter(section), *counter);
        }
    }

    #[test]
    fn spare_blocks_are_adopted() {
        static ELEVEN: [BlockConfig; 11] = [
            BlockConfig::new(1, 16),
            BlockConfig::new(2, 16),
            BlockConfig::new(3, 16),
            BlockConfig::new(4, 16),
            BlockConfig::new(5, 16),
            BlockConfig::new(6, 16),
            BlockConfig::new(7, 16),
            BlockConfig::new(8, 16),
            BlockConfig::new(9, 16),
            BlockConfig::new(10, 16),
            BlockConfig::critical(11, 16),
        ];
        let mut tickee = started_with(FakeFlash::new(), &ELEVEN, Config::new(0, SECTION_SIZE));
        assert_eq!(write(&mut tickee, 11, 0xB1), UserJobResult::Ok);
        let image = tickee.controller.image();

        let mut config = Config::new(0, SECTION_SIZE);
        config.spare_block_size = 16;
        let mut tickee = started_with(FakeFlash::from_image(image.clone()), &BLOCKS, config);
        assert!(matches!(
            tickee.block_location(11),
            Some(Location::Data { length: 16, .. })
        ));
        let (result, data) = read_custom(&mut tickee, 11, 16);
        assert_eq!(result, UserJobResult::Ok);
        assert_eq!(data, vec![0xB1; 16]);
        assert_eq!(tickee.write(11, leak(0u8, 16)), Err(ErrorCode::KeyNotFound));
        assert_eq!(tickee.read(11, 0, leak(0u8, 16)), Err(ErrorCode::KeyNotFound));

        let tickee = started_with(
            FakeFlash::from_image(image),
            &BLOCKS,
            Config::new(0, SECTION_SIZE),
        );
        assert_eq!(tickee.block_location(11), None);
    }

    #[test]
    fn config_id_must_match() {
        let mut tickee = started(FakeFlash::new());
        assert_eq!(write(&mut tickee, 1, 0x17), UserJobResult::Ok);
        let image = tickee.controller.image();

        let mut config = Config::new(0, SECTION_SIZE);
        config.config_id = 2;
        config.legacy_config_id = Some(1);
        let mut tickee = started_with(FakeFlash::from_image(image.clone()), &BLOCKS, config);
        assert_value(&mut tickee, 1, 0x17);

        config.legacy_config_id = None;
        let mut tickee = started_with(FakeFlash::from_image(image), &BLOCKS, config);
        assert_eq!(read(&mut tickee, 1).0, UserJobResult::BlockInvalid);
        assert_eq!(tickee.section_erase_counter(0), 1);
    }

    #[test]
    fn failed_record_keeps_its_space() {
        let mut tickee = started(FakeFlash::new());
        assert_eq!(write(&mut tickee, 5, 0x55), UserJobResult::Ok);

        tickee.write(5, leak(0x56u8, 16)).unwrap();
        run_until_data(&mut tickee);
        let cursors = tickee.cursors();
        tickee.controller.fail_writes.set(2);
        assert_eq!(finish(&mut tickee), UserJobResult::Failed);

        // The info slot is on flash, so the space is not handed out again
        assert_eq!(tickee.cursors(), cursors);
        assert_value(&mut tickee, 5, 0x55);
        assert_eq!(write(&mut tickee, 6, 0x66), UserJobResult::Ok);
        let cursors = tickee.cursors();

        let mut tickee = restart(&tickee);
        assert_eq!(tickee.cursors(), cursors);
        assert_value(&mut tickee, 5, 0x55);
        assert_value(&mut tickee, 6, 0x66);
    }

    #[test]
    fn short_writes_keep_their_length() {
        let mut tickee = started(FakeFlash::new());
        write_all(&mut tickee);
        tickee.write(4, leak(0x4Au8, 8)).unwrap();
        assert_eq!(finish(&mut tickee), UserJobResult::Ok);

        let check = |tickee: &mut Engine| {
            assert!(matches!(
                tickee.block_location(4),
                Some(Location::Data { length: 8, .. })
            ));
            assert_eq!(read_at(tickee, 4, 0, 8), (UserJobResult::Ok, vec![0x4A; 8]));
            assert_eq!(read_at(tickee, 4, 6, 2), (UserJobResult::Ok, vec![0x4A; 2]));
            assert_eq!(tickee.read(4, 0, leak(0u8, 16)), Err(ErrorCode::InvalidLength));
            assert_eq!(tickee.read(4, 4, leak(0u8, 8)), Err(ErrorCode::InvalidLength));
        };
        check(&mut tickee);

        // Migrated with the same length
        fill_until_active(&mut tickee, 2);
        settle(&mut tickee);
        assert_eq!(section_of(&tickee, 4), Some(2));
        check(&mut tickee);

        let mut tickee = restart(&tickee);
        check(&mut tickee);
        assert_eq!(write(&mut tickee, 4, 0x44), UserJobResult::Ok);
        assert_value(&mut tickee, 4, 0x44);
    }

    #[test]
    fn power_loss_at_every_flash_job() {
        let mut tickee = started(FakeFlash::new());
        write_all(&mut tickee);
        tickee.controller.record_snapshots();
        fill_until_active(&mut tickee, 2);
        settle(&mut tickee);
        assert_eq!(tickee.oldest_section(), 1);

        let snapshots = tickee.controller.take_snapshots();
        assert!(snapshots.len() > 100);
        for image in snapshots {
            let mut tickee = started(FakeFlash::from_image(image));
            let (result, data) = read(&mut tickee, 1);
            assert_eq!(result, UserJobResult::Ok);
            assert!(data.iter().all(|b| *b == data[0]));
            assert!(data[0] == 1 || data[0] >= 0x80);
            for id in 2..=10 {
                assert_value(&mut tickee, id, id as u8);
            }

            assert_eq!(write(&mut tickee, 2, 0xEE), UserJobResult::Ok);
            settle(&mut tickee);
            assert_value(&mut tickee, 2, 0xEE);
        }
    }

    #[test]
    fn three_section_ring() {
        fn start(image: Vec<u8>) -> Ring<3> {
            let engine = Ring::<3>::new(
                FakeFlash::from_image(image),
                Config::new(0, SECTION_SIZE),
                &BLOCKS,
                leak(CacheEntry::EMPTY, BLOCKS.len()),
                leak(0u8, 64),
                leak(0u8, 64),
            );
            let mut tickee = match engine {
                Ok(engine) => engine,
                Err(e) => panic!("engine rejected its configuration: {:?}", e),
            };
            assert_eq!(tickee.init(), Ok(SuccessCode::Queued));
            settle(&mut tickee);
            tickee
        }

        let mut tickee = start(vec![0xFF; FLASH_SIZE]);
        for section in 0..3 {
            assert_eq!(tickee.section_erase_counter(section), 1);
        }
        write_all(&mut tickee);
        for round in 0..150u32 {
            assert_eq!(write(&mut tickee, 1, round as u8), UserJobResult::Ok);
            if round % 50 == 49 {
                tickee = start(tickee.controller.image());
                assert_value(&mut tickee, 1, round as u8);
            }
        }
        settle(&mut tickee);

        assert!(tickee.erase_counter() > 2);
        assert_value(&mut tickee, 1, 149);
        for id in 2..=10 {
            assert_value(&mut tickee, id, id as u8);
        }

        let mut tickee = start(tickee.controller.image());
        assert_value(&mut tickee, 1, 149);
        for id in 2..=10 {
            assert_value(&mut tickee, id, id as u8);
        }
    }

    #[test]
    fn write_into_the_margin_changes_section() {
        let mut tickee = started(FakeFlash::new());
        write_all(&mut tickee);
        for value in 0..8 {
            assert_eq!(write(&mut tickee, 1, 0x80 + value), UserJobResult::Ok);
        }
        assert_eq!(tickee.active_section(), 0);

        // One more record would eat into the margin
        let layout = *tickee.layout();
        let cursors = tickee.cursors();
        let slot = layout.slot_len();
        let gap = cursors.data().0..cursors.info().0 + slot;
        assert!(!cursors.fits(&layout, 16, 0));
        assert!(gap.len() >= layout.margin() * slot);
        assert!(gap.len() < layout.margin() * slot + layout.record_len(16));

        assert_eq!(write(&mut tickee, 2, 0x22), UserJobResult::Ok);
        assert_eq!(tickee.active_section(), 1);
        assert_eq!(tickee.section_status(0), SectionStatus::Full);
        assert_eq!(section_of(&tickee, 2), Some(1));
        let image = tickee.controller.image();
        assert!(image[gap].iter().all(|b| *b == 0xFF));

        let mut tickee = restart(&tickee);
        assert_eq!(tickee.active_section(), 1);
        assert_value(&mut tickee, 2, 0x22);
        assert_value(&mut tickee, 1, 0x87);
    }

    #[test]
    fn write_to_another_block_during_a_copy() {
        let mut tickee = started(FakeFlash::new());
        write_all(&mut tickee);
        fill_until_active(&mut tickee, 2);
        run_until_copying(&mut tickee, 3);

        tickee.write(10, leak(0xA0u8, 16)).unwrap();
        assert_eq!(finish(&mut tickee), UserJobResult::Ok);
        let copying = tickee.switch_checkpoint().block();
        assert_eq!(copying.map(|index| tickee.cache_entries()[index].id), Some(3));

        settle(&mut tickee);
        assert_eq!(tickee.oldest_section(), 1);
        assert_value(&mut tickee, 10, 0xA0);
        for id in 2..=9 {
            assert_eq!(section_of(&tickee, id), Some(2));
            assert_value(&mut tickee, id, id as u8);
        }

        let mut tickee = restart(&tickee);
        assert_value(&mut tickee, 10, 0xA0);
        assert_value(&mut tickee, 3, 3);
    }

    #[test]
    fn write_to_the_block_being_copied() {
        let mut tickee = started(FakeFlash::new());
        write_all(&mut tickee);
        fill_until_active(&mut tickee, 2);
        run_until_copying(&mut tickee, 3);

        // The write waits for the copy
        tickee.write(3, leak(0x3Cu8, 16)).unwrap();
        tickee.main_function();
        assert_eq!(tickee.user_record_in_flight(), None);
        let copying = tickee.switch_checkpoint().block();
        assert_eq!(copying.map(|index| tickee.cache_entries()[index].id), Some(3));

        assert_eq!(finish(&mut tickee), UserJobResult::Ok);
        settle(&mut tickee);
        assert_eq!(section_of(&tickee, 3), Some(2));
        assert_value(&mut tickee, 3, 0x3C);
        assert_value(&mut restart(&tickee), 3, 0x3C);
    }

    #[test]
    fn custom_blocks_use_the_spare_entries() {
        let mut config = Config::new(0, SECTION_SIZE);
        config.spare_block_size = 16;
        let mut tickee = started_with(FakeFlash::new(), &BLOCKS, config);
        assert_eq!(tickee.write_custom(1, leak(0u8, 4)), Err(ErrorCode::KeyNotFound));
        assert_eq!(
            tickee.write_custom(u16::MAX, leak(0u8, 4)),
            Err(ErrorCode::KeyNotFound)
        );
        assert_eq!(
            tickee.write_custom(11, leak(0u8, 17)),
            Err(ErrorCode::InvalidLength)
        );
        assert_eq!(tickee.block_location(11), None);

        tickee.write_custom(11, leak(0xC1u8, 12)).unwrap();
        assert_eq!(finish(&mut tickee), UserJobResult::Ok);
        tickee.write_custom(12, leak(0xC2u8, 16)).unwrap();
        assert_eq!(finish(&mut tickee), UserJobResult::Ok);
        assert_eq!(
            tickee.write_custom(13, leak(0u8, 4)),
            Err(ErrorCode::SparePoolFull)
        );
        tickee.write_custom(11, leak(0xC3u8, 12)).unwrap();
        assert_eq!(finish(&mut tickee), UserJobResult::Ok);

        assert_eq!(read_custom(&mut tickee, 11, 12), (UserJobResult::Ok, vec![0xC3; 12]));
        assert_eq!(
            tickee.read_custom(11, 0, leak(0u8, 16)),
            Err(ErrorCode::InvalidLength)
        );

        write_all(&mut tickee);
        fill_until_active(&mut tickee, 2);
        settle(&mut tickee);
        assert_eq!(section_of(&tickee, 11), Some(2));
        assert_eq!(section_of(&tickee, 12), Some(2));

        let image = tickee.controller.image();
        let mut tickee = started_with(FakeFlash::from_image(image), &BLOCKS, config);
        assert!(matches!(
            tickee.block_location(11),
            Some(Location::Data { length: 12, .. })
        ));
        assert_eq!(read_custom(&mut tickee, 11, 12), (UserJobResult::Ok, vec![0xC3; 12]));
        assert_eq!(read_custom(&mut tickee, 12, 16), (UserJobResult::Ok, vec![0xC2; 16]));
    }

    #[test]
    fn frozen_activities_hold_the_switch() {
        let mut tickee = started(FakeFlash::new());
        write_all(&mut tickee);
        fill_until_active(&mut tickee, 1);
        settle(&mut tickee);
        assert_eq!(tickee.freeze_activities(true), Ok(SuccessCode::Complete));

        // Writes still get a new section, the switch waits
        fill_until_active(&mut tickee, 2);
        assert_eq!(tickee.status(), EngineStatus::Idle);
        settle(&mut tickee);
        assert_eq!(tickee.switch_checkpoint(), SwitchCheckpoint::Idle);
        assert_eq!(tickee.oldest_section(), 0);
        assert_eq!(tickee.section_status(0), SectionStatus::Full);

        assert_eq!(tickee.freeze_activities(false), Ok(SuccessCode::Complete));
        assert_eq!(tickee.status(), EngineStatus::BusyInternal);
        settle(&mut tickee);
        assert_eq!(tickee.oldest_section(), 1);
        for id in 2..=10 {
            assert_value(&mut tickee, id, id as u8);
        }
    }

    #[test]
    fn critical_block_freezes_the_engine() {
        static CRITICAL: [BlockConfig; 10] = [
            BlockConfig::critical(1, 16),
            BlockConfig::new(2, 16),
            BlockConfig::new(3, 16),
            BlockConfig::new(4, 16),
            BlockConfig::new(5, 16),
            BlockConfig::new(6, 16),
            BlockConfig::new(7, 16),
            BlockConfig::new(8, 16),
            BlockConfig::new(9, 16),
            BlockConfig::new(10, 16),
        ];
        let config = Config::new(0, SECTION_SIZE);
        let mut tickee = started_with(FakeFlash::new(), &CRITICAL, config);
        assert_eq!(write(&mut tickee, 2, 0x22), UserJobResult::Ok);
        assert_eq!(write(&mut tickee, 1, 0x11), UserJobResult::Ok);
        assert_eq!(tickee.frozen_by(), Some(1));

        let check = |tickee: &mut Engine| {
            assert_eq!(tickee.write(2, leak(0u8, 16)), Err(ErrorCode::Frozen));
            assert_eq!(tickee.write(1, leak(0u8, 16)), Err(ErrorCode::Frozen));
            assert_eq!(tickee.invalidate(1), Err(ErrorCode::Frozen));
            assert_eq!(tickee.read(2, 0, leak(0u8, 16)), Err(ErrorCode::Frozen));
            assert_value(tickee, 1, 0x11);
        };
        check(&mut tickee);

        let image = tickee.controller.image();
        let mut tickee = started_with(FakeFlash::from_image(image), &CRITICAL, config);
        assert_eq!(tickee.frozen_by(), Some(1));
        check(&mut tickee);

        tickee.erase_immediate(1).unwrap();
        tickee.main_function();
        assert_eq!(tickee.cancel(), Err(ErrorCode::Busy));
        assert_eq!(finish(&mut tickee), UserJobResult::Ok);
        assert_eq!(tickee.frozen_by(), None);

        assert_eq!(read(&mut tickee, 1).0, UserJobResult::BlockInconsistent);
        assert_value(&mut tickee, 2, 0x22);
        assert_eq!(write(&mut tickee, 3, 0x33), UserJobResult::Ok);

        let image = tickee.controller.image();
        let tickee = started_with(FakeFlash::from_image(image), &CRITICAL, config);
        assert_eq!(tickee.frozen_by(), None);
    }
}
