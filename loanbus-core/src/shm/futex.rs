// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Futex wait/wake on words that live in shared memory.
//!
//! Blocked parties sleep in the kernel with a timeout, so a peer that dies
//! without waking them costs at most one timeout. On non-Linux targets the
//! wait degrades to a short sleep.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Block while `*word == expected`, for at most `timeout`.
///
/// Returns `true` if woken, `false` on timeout, interruption or when the
/// value had already changed. Callers re-check their condition either way.
#[cfg(target_os = "linux")]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Duration) -> bool {
    let timespec = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };

    // FUTEX_PRIVATE_FLAG is deliberately absent: waiters and wakers may be
    // different processes.
    // SAFETY: word points into a live mapping for the duration of the call
    let result = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            &timespec as *const libc::timespec,
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    if result == 0 {
        return true;
    }

    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::ETIMEDOUT) | Some(libc::EINTR) => false,
        other => {
            tracing::warn!(errno = ?other, "futex wait failed");
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Duration) -> bool {
    if word.load(Ordering::Acquire) != expected {
        return false;
    }
    std::thread::sleep(timeout.min(Duration::from_micros(200)));
    false
}

/// Wake every waiter on `word`.
#[cfg(target_os = "linux")]
fn wake_all(word: &AtomicU32) {
    // SAFETY: word points into a live mapping for the duration of the call
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn wake_all(_word: &AtomicU32) {}

/// Bump the word and wake all waiters.
pub fn signal(word: &AtomicU32) {
    word.fetch_add(1, Ordering::Release);
    wake_all(word);
}
