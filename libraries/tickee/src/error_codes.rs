// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The standard error codes used by TicKEE.

/// Standard error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// The flash driver rejected a program or erase request synchronously.
    FlashRefused,
    /// An accepted flash job completed with a failure.
    FlashJobFailed,
    /// A state machine step failed more often than the retry bound allows.
    RetriesExhausted,
    /// The block could not be recovered after exhausting internal retries.
    RecordInconsistent,
    /// The section was written by an incompatible configuration.
    ConfigMismatch,
    /// A flash read failed.
    ReadFail,
    /// The read has been started but the data is not available yet. The
    /// same read will be issued again. The value is the flash address.
    ReadNotReady(usize),
    /// The engine cannot accept the request right now.
    Busy,
    /// No scratch buffer is large enough for the request.
    BufferTooSmall,
    /// The block id is unknown to the request, or the block holds no data.
    KeyNotFound,
    /// The length or offset of the request does not fit the block.
    InvalidLength,
    /// The configuration passed to `TickEE::new()` is not usable.
    InvalidConfig,
    /// `TickEE::init()` has not completed yet.
    NotInitialised,
    /// A critical block holds data. Only reads and erasures of it are
    /// accepted until it is erased.
    Frozen,
    /// Every spare cache entry is taken.
    SparePoolFull,
}

impl From<ErrorCode> for isize {
    fn from(original: ErrorCode) -> isize {
        match original {
            ErrorCode::FlashRefused => -1,
            ErrorCode::FlashJobFailed => -2,
            ErrorCode::RetriesExhausted => -3,
            ErrorCode::RecordInconsistent => -4,
            ErrorCode::ConfigMismatch => -5,
            ErrorCode::ReadFail => -6,
            ErrorCode::ReadNotReady(_) => -7,
            ErrorCode::Busy => -8,
            ErrorCode::BufferTooSmall => -9,
            ErrorCode::KeyNotFound => -10,
            ErrorCode::InvalidLength => -11,
            ErrorCode::InvalidConfig => -12,
            ErrorCode::NotInitialised => -13,
            ErrorCode::Frozen => -14,
            ErrorCode::SparePoolFull => -15,
        }
    }
}

impl From<ErrorCode> for usize {
    fn from(original: ErrorCode) -> usize {
        isize::from(original) as usize
    }
}
