// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Advisory whole-file locking for the topic queue's structural operations
// (register/unregister/resize take the write lock, publish/take the read
// lock). Built on `fcntl(F_SETLKW)`, which is process-cooperative only —
// every participant must go through this module, matching the `flock`
// discipline cpp-ipc's POSIX platform layer already relies on for its own
// shared-memory coordination.

use std::io;
use std::os::fd::RawFd;

fn apply(fd: RawFd, l_type: libc::c_short) -> io::Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = l_type;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0; // whole file

    loop {
        let ret = unsafe { libc::fcntl(fd, libc::F_SETLKW, &fl) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// RAII guard releasing the lock (`F_UNLCK`) on drop.
pub struct FileLockGuard {
    fd: RawFd,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = apply(self.fd, libc::F_UNLCK as libc::c_short);
    }
}

/// Acquire a write (exclusive) lock on `fd`, blocking until available.
pub fn write_lock(fd: RawFd) -> io::Result<FileLockGuard> {
    apply(fd, libc::F_WRLCK as libc::c_short)?;
    Ok(FileLockGuard { fd })
}

/// Acquire a read (shared) lock on `fd`, blocking until available.
pub fn read_lock(fd: RawFd) -> io::Result<FileLockGuard> {
    apply(fd, libc::F_RDLCK as libc::c_short)?;
    Ok(FileLockGuard { fd })
}
