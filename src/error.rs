// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error kinds for the transport. `InvalidArgument`, `ResourceExhausted`,
// and `Transient` are ordinary return values; `Fatal` logs and aborts the
// process at its single construction site (`HazmemError::fatal`) rather
// than leaving every call site responsible for remembering to abort.

use std::io;

pub type Result<T> = std::result::Result<T, HazmemError>;

#[derive(Debug, thiserror::Error)]
pub enum HazmemError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("transient I/O failure: {0}")]
    Transient(#[from] io::Error),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl HazmemError {
    /// Construct a `Fatal` error and terminate the process.
    ///
    /// Device-API failures and corrupted shared-memory invariants fall in
    /// this category: there is no local recovery that doesn't risk handing
    /// back a half-mapped allocator to the caller.
    #[cold]
    pub fn fatal(msg: impl Into<String>) -> ! {
        let msg = msg.into();
        log::error!("fatal hazmem error, aborting: {msg}");
        std::process::abort();
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }
}
