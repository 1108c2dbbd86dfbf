// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Scratch buffers staging flash jobs.
//!
//! A buffer belongs to the state machine that allocated it until that
//! machine observes the completion of the flash job using it.

use crate::error_codes::ErrorCode;

/// Number of buffers in the pool.
pub const POOL_SIZE: usize = 2;

/// The state machine holding a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requester {
    /// The startup scan.
    Startup,
    /// A user job.
    User,
    /// The section lifecycle state machine.
    Lifecycle,
    /// The section switch state machine.
    Switch,
}

/// Handle to an allocated buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferId(usize);

/// The pool of caller provided buffers.
pub struct BufferPool<'a> {
    buffers: [&'a mut [u8]; POOL_SIZE],
    owners: [Option<Requester>; POOL_SIZE],
}

impl<'a> BufferPool<'a> {
    /// Create a pool from a small buffer for management records and a
    /// larger one for block data.
    pub fn new(management: &'a mut [u8], data: &'a mut [u8]) -> Self {
        Self {
            buffers: [management, data],
            owners: [None; POOL_SIZE],
        }
    }

    /// Take the smallest free buffer holding at least `min_size` bytes.
    ///
    /// Returns `ErrorCode::BufferTooSmall` if no buffer of the pool is that
    /// large, and `ErrorCode::Busy` if all large enough buffers are owned.
    pub fn allocate(
        &mut self,
        requester: Requester,
        min_size: usize,
    ) -> Result<BufferId, ErrorCode> {
        let mut candidate: Option<usize> = None;
        let mut exists = false;
        for (i, buf) in self.buffers.iter().enumerate() {
            if buf.len() < min_size {
                continue;
            }
            exists = true;
            if self.owners[i].is_some() {
                continue;
            }
            match candidate {
                Some(c) if self.buffers[c].len() <= buf.len() => {}
                _ => candidate = Some(i),
            }
        }

        match candidate {
            Some(i) => {
                self.owners[i] = Some(requester);
                Ok(BufferId(i))
            }
            None if exists => Err(ErrorCode::Busy),
            None => Err(ErrorCode::BufferTooSmall),
        }
    }

    /// Hand a buffer back to the pool.
    pub fn release(&mut self, id: BufferId) {
        self.owners[id.0] = None;
    }

    /// The state machine owning `id`.
    pub fn owner(&self, id: BufferId) -> Option<Requester> {
        self.owners[id.0]
    }

    /// True if no buffer is allocated.
    pub fn is_idle(&self) -> bool {
        self.owners.iter().all(Option::is_none)
    }

    /// Length of the largest buffer.
    pub fn largest(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).max().unwrap_or(0)
    }

    /// Read access to an allocated buffer.
    pub fn get(&self, id: BufferId) -> &[u8] {
        &self.buffers[id.0][..]
    }

    /// Write access to an allocated buffer.
    pub fn get_mut(&mut self, id: BufferId) -> &mut [u8] {
        &mut self.buffers[id.0][..]
    }
}
