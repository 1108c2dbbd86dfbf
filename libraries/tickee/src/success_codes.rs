// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The success codes returned by the TicKEE request API.

/// Successful outcomes of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuccessCode {
    /// The request finished without touching flash.
    Complete,
    /// The request was accepted and runs from `main_function()`. Poll
    /// `job_result()` for the outcome.
    Queued,
    /// A pending request was dropped before it reached flash.
    Cancelled,
}

impl From<SuccessCode> for isize {
    fn from(original: SuccessCode) -> isize {
        match original {
            SuccessCode::Complete => 0,
            SuccessCode::Queued => 1,
            SuccessCode::Cancelled => 2,
        }
    }
}

impl From<SuccessCode> for usize {
    fn from(original: SuccessCode) -> usize {
        isize::from(original) as usize
    }
}
