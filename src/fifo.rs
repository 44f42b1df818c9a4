// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-topic signal FIFO. A topic gets one named pipe at
// `/tmp/ros2_hazcat.<topic>`, mode 0666, created once and never unlinked by
// the hot path — it is meant to outlive any single publisher or subscriber
// so a late-starting process can still observe earlier wakeups' effects
// indirectly (the FIFO itself carries no payload, only a wake byte).

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::shm_name;

pub fn fifo_path(topic: &str) -> PathBuf {
    let suffix = shm_name::sanitize_topic(topic);
    PathBuf::from(format!("/tmp/ros2_hazcat.{suffix}"))
}

/// Create the FIFO if it doesn't already exist. Idempotent across processes.
pub fn ensure_fifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().to_string_lossy().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let ret = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }
    }
    Ok(())
}

/// A topic's signal channel: a write end kept open for non-blocking signals
/// and, on the subscriber side, a read end the façade polls externally.
pub struct SignalFifo {
    write_end: File,
}

impl SignalFifo {
    pub fn open(topic: &str) -> io::Result<Self> {
        let path = fifo_path(topic);
        ensure_fifo(&path)?;
        // O_RDWR so the writer never blocks waiting for a reader to attach
        // (a pure O_WRONLY open on a FIFO blocks until some reader opens it).
        let write_end = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)?;
        Ok(Self { write_end })
    }

    /// Wake any waiters with a single byte. Never blocks.
    pub fn signal(&self) -> io::Result<()> {
        use std::io::Write;
        let mut f = &self.write_end;
        match f.write_all(&[1u8]) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn as_raw_fd(&self) -> i32 {
        self.write_end.as_raw_fd()
    }
}
