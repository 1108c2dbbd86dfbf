// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The Flash Controller interface with hardware

use crate::error_codes::ErrorCode;

/// Outcome of the last accepted `write()` or `erase()` job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobResult {
    /// The job is still running.
    Pending,
    /// The job finished and the flash contents are durable.
    Complete,
    /// The job finished with an error.
    Failed,
}

/// Implementation required for the flash driver. TicKEE issues at most one
/// program or erase job at a time and polls `job_result()` from
/// `TickEE::main_function()` until the job leaves `JobResult::Pending`.
///
/// Addresses are absolute. The first section starts at
/// `Config::flash_base`.
///
/// The boiler plate for an implementation will look something like this
///
/// ```rust
/// use tickee::error_codes::ErrorCode;
/// use tickee::flash_controller::{FlashController, JobResult};
///
/// struct FlashCtrl {}
///
/// impl FlashController for FlashCtrl {
///     fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), ErrorCode> {
///         unimplemented!()
///     }
///
///     fn write(&self, address: usize, buf: &[u8]) -> Result<(), ErrorCode> {
///         unimplemented!()
///     }
///
///     fn erase(&self, address: usize, len: usize) -> Result<(), ErrorCode> {
///         unimplemented!()
///     }
///
///     fn job_result(&self) -> JobResult {
///         unimplemented!()
///     }
/// }
/// ```
pub trait FlashController {
    /// Read `buf.len()` bytes starting at `address` into `buf`.
    ///
    /// Return `ErrorCode::ReadNotReady(address)` if the data is not ready
    /// yet. TicKEE will issue the same read again on a later tick, and the
    /// implementation should then return the data. Return
    /// `ErrorCode::ReadFail` if the read failed.
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), ErrorCode>;

    /// Start programming `buf` at `address`.
    ///
    /// `Ok(())` means the job was accepted and its outcome will be reported
    /// by `job_result()`. Return `ErrorCode::FlashRefused` if the job could
    /// not be started; TicKEE retries it later.
    fn write(&self, address: usize, buf: &[u8]) -> Result<(), ErrorCode>;

    /// Start erasing `len` bytes at `address`. `address` and `len` always
    /// cover whole sections. Same contract as `write()`.
    fn erase(&self, address: usize, len: usize) -> Result<(), ErrorCode>;

    /// Report the state of the last accepted job.
    fn job_result(&self) -> JobResult;

    /// Abort the running job, if the hardware supports it. After a
    /// cancellation the next `job_result()` must not report `Pending`.
    fn cancel(&self) {}
}
