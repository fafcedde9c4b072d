// This file is part of wdcap, a lossless rotating packet-capture daemon.
// Copyright (C) 2025 The wdcap Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Process-wide flags and the signal handlers that set them.
//!
//! Handlers are async-signal-safe: they only read a static pointer and touch
//! atomics (plus `clock_gettime(CLOCK_MONOTONIC)` for HUP rate-limiting).
//! All cross-thread wakeup goes through [`Flags`]; threads poll it rather
//! than being interrupted.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, Ordering};
use std::sync::Arc;

use base::{Error, ResultExt};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Minimum spacing between honored HUPs, in seconds of monotonic time.
const RELOAD_INTERVAL_SECS: i64 = 1;

pub struct Flags {
    halt: AtomicBool,
    reload: AtomicBool,
    last_hup_sec: AtomicI64,
    child_exited: AtomicBool,
}

impl Flags {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Flags> {
        Arc::new(Flags {
            halt: AtomicBool::new(false),
            reload: AtomicBool::new(false),
            last_hup_sec: AtomicI64::new(-RELOAD_INTERVAL_SECS),
            child_exited: AtomicBool::new(false),
        })
    }

    pub fn request_halt(&self) {
        self.halt.store(true, Ordering::SeqCst);
    }

    pub fn halted(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }

    /// Whether a reload has been requested and not yet consumed. Workers
    /// read this without consuming; the flag lives until the process exits.
    pub fn reload_requested(&self) -> bool {
        self.reload.load(Ordering::SeqCst)
    }

    /// Consumes a pending reload request (supervisor only).
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }

    pub fn take_child_exited(&self) -> bool {
        self.child_exited.swap(false, Ordering::SeqCst)
    }

    fn note_child_exited(&self) {
        self.child_exited.store(true, Ordering::SeqCst);
    }

    /// Records a HUP observed at monotonic second `now_sec`, dropping it if
    /// one was already honored less than [`RELOAD_INTERVAL_SECS`] ago.
    /// Returns whether the request was accepted.
    pub fn note_hup_at(&self, now_sec: i64) -> bool {
        let last = self.last_hup_sec.load(Ordering::SeqCst);
        if now_sec.saturating_sub(last) < RELOAD_INTERVAL_SECS {
            return false;
        }
        if self
            .last_hup_sec
            .compare_exchange(last, now_sec, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.reload.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }
}

/// Which set of handlers to install.
#[derive(Copy, Clone, Debug)]
pub enum Role {
    /// INT/TERM halt, HUP reloads, CHLD reaps.
    Supervisor,

    /// INT/TERM halt, HUP drains, PIPE ignored, CHLD back to default.
    Capture,
}

/// Flags the handlers operate on. Leaked on purpose: handlers may fire at
/// any point for the remainder of the process's life. A forked child
/// re-points this at its own fresh `Flags` via [`install`].
static FLAGS: AtomicPtr<Flags> = AtomicPtr::new(std::ptr::null_mut());

fn with_flags(f: impl FnOnce(&Flags)) {
    let p = FLAGS.load(Ordering::Acquire);
    if !p.is_null() {
        f(unsafe { &*p });
    }
}

/// Async-signal-safe monotonic clock read.
fn monotonic_secs() -> i64 {
    unsafe {
        let mut ts = mem::MaybeUninit::uninit();
        if libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr()) != 0 {
            return 0;
        }
        #[allow(clippy::useless_conversion)]
        i64::from(ts.assume_init().tv_sec)
    }
}

extern "C" fn on_halt_signal(_signum: libc::c_int) {
    with_flags(Flags::request_halt);
}

extern "C" fn on_hup(_signum: libc::c_int) {
    with_flags(|f| {
        f.note_hup_at(monotonic_secs());
    });
}

extern "C" fn on_chld(_signum: libc::c_int) {
    with_flags(Flags::note_child_exited);
}

/// Installs signal handlers operating on `flags`.
///
/// Called after basic init but before any thread is spawned, so every signal
/// is delivered to the main thread (see [`block_all`] for the spawn window).
pub fn install(flags: &Arc<Flags>, role: Role) -> Result<(), Error> {
    FLAGS.store(Arc::into_raw(flags.clone()) as *mut Flags, Ordering::Release);
    let act = |handler| SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
    unsafe {
        signal::sigaction(Signal::SIGINT, &act(SigHandler::Handler(on_halt_signal)))
            .err_kind(base::ErrorKind::Internal)?;
        signal::sigaction(Signal::SIGTERM, &act(SigHandler::Handler(on_halt_signal)))
            .err_kind(base::ErrorKind::Internal)?;
        signal::sigaction(Signal::SIGHUP, &act(SigHandler::Handler(on_hup)))
            .err_kind(base::ErrorKind::Internal)?;
        match role {
            Role::Supervisor => {
                let chld = SigAction::new(
                    SigHandler::Handler(on_chld),
                    SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
                    SigSet::empty(),
                );
                signal::sigaction(Signal::SIGCHLD, &chld).err_kind(base::ErrorKind::Internal)?;
            }
            Role::Capture => {
                signal::sigaction(Signal::SIGCHLD, &act(SigHandler::SigDfl))
                    .err_kind(base::ErrorKind::Internal)?;
                signal::sigaction(Signal::SIGPIPE, &act(SigHandler::SigIgn))
                    .err_kind(base::ErrorKind::Internal)?;
            }
        }
    }
    Ok(())
}

/// Blocks every signal on the calling thread, returning the previous mask.
/// Threads spawned while blocked inherit the full mask, keeping signal
/// delivery on the main thread.
pub fn block_all() -> Result<SigSet, Error> {
    let mut old = SigSet::empty();
    signal::pthread_sigmask(signal::SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), Some(&mut old))
        .err_kind(base::ErrorKind::Internal)?;
    Ok(old)
}

pub fn restore_mask(old: &SigSet) -> Result<(), Error> {
    signal::pthread_sigmask(signal::SigmaskHow::SIG_SETMASK, Some(old), None)
        .err_kind(base::ErrorKind::Internal)
}
