// This file is part of wdcap, a lossless rotating packet-capture daemon.
// Copyright (C) 2025 The wdcap Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The supervisor: a long-lived parent process that forks the capture child
//! and honors reloads.
//!
//! On HUP (rate-limited to once a second), the current child is forwarded
//! the HUP and a replacement child is forked against freshly-parsed
//! configuration. The old child's workers drain their in-flight interval and
//! exit on their own, so no interval on disk is lost across a reload. A
//! child that exits for any other reason halts the supervisor: restarting it
//! silently would just mask bugs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base::clock::{Clocks, RealClocks};
use base::{err, Error, ResultExt};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{error, info, warn};

use crate::capture;
use crate::config::{self, ConfigFile};
use crate::signals::{self, Flags, Role};

/// How often the supervisor polls its flags.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Runs the supervisor until shutdown. `config_path` is re-parsed on each
/// accepted reload.
pub fn run(config_path: &Path, mut config: ConfigFile) -> Result<i32, Error> {
    let flags = Flags::new();
    signals::install(&flags, Role::Supervisor)?;
    let clocks = RealClocks {};

    let mut child = Some(fork_capture(&config)?);
    let mut exit_code = 0;
    while !flags.halted() {
        if flags.take_reload() {
            reload(config_path, &mut config, &mut child);
        }
        if flags.take_child_exited() {
            reap(&mut child, &flags, &mut exit_code);
        }
        clocks.sleep(POLL_INTERVAL);
    }

    if let Some(child) = child {
        let pid = read_pid_file(&config.pidfile).unwrap_or_else(|e| {
            warn!(err = %e.chain(), "unable to read pid file; using forked pid");
            child
        });
        info!(pid = pid.as_raw(), "stopping capture child");
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            warn!(err = %e, "unable to signal capture child");
        }
        match waitpid(child, None) {
            Ok(status) => info!(?status, "capture child exited"),
            Err(e) => warn!(err = %e, "unable to reap capture child"),
        }
    }
    Ok(exit_code)
}

fn reload(config_path: &Path, config: &mut ConfigFile, child: &mut Option<Pid>) {
    info!("reload requested");
    if let Some(old) = *child {
        // The pid file still names the old child at this point; the
        // replacement overwrites it on startup.
        let pid = read_pid_file(&config.pidfile).unwrap_or(old);
        if let Err(e) = kill(pid, Signal::SIGHUP) {
            warn!(pid = pid.as_raw(), err = %e, "unable to forward hangup");
        }
    }
    match config::read_config(config_path) {
        Ok(c) => *config = c,
        Err(e) => {
            // Keep capturing under the previous configuration rather than
            // dying mid-reload.
            error!(err = %e.chain(), "reload kept previous config");
        }
    }
    match fork_capture(config) {
        Ok(pid) => *child = Some(pid),
        Err(e) => {
            error!(err = %e.chain(), "unable to fork replacement child");
            *child = None;
        }
    }
}

/// Reaps exited children. Old children draining after a reload are
/// expected; the current child exiting is not, and halts the supervisor.
fn reap(child: &mut Option<Pid>, flags: &Arc<Flags>, exit_code: &mut i32) {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(WaitStatus::Exited(pid, code)) => {
                if Some(pid) == *child {
                    error!(pid = pid.as_raw(), code, "capture child exited unexpectedly");
                    *child = None;
                    *exit_code = 1;
                    flags.request_halt();
                } else {
                    info!(pid = pid.as_raw(), code, "drained capture child exited");
                }
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                if Some(pid) == *child {
                    error!(pid = pid.as_raw(), %signal, "capture child killed unexpectedly");
                    *child = None;
                    *exit_code = 1;
                    flags.request_halt();
                } else {
                    warn!(pid = pid.as_raw(), %signal, "drained capture child killed");
                }
            }
            Ok(_) => {}
            Err(nix::errno::Errno::ECHILD) => break,
            Err(e) => {
                warn!(err = %e, "waitpid failed");
                break;
            }
        }
    }
}

/// Forks a capture child running [`capture::run`]. The child never returns
/// from this function.
fn fork_capture(config: &ConfigFile) -> Result<Pid, Error> {
    match unsafe { fork() }.err_kind(base::ErrorKind::Internal)? {
        ForkResult::Parent { child } => {
            info!(pid = child.as_raw(), "forked capture child");
            Ok(child)
        }
        ForkResult::Child => {
            let flags = Flags::new();
            let code = match signals::install(&flags, Role::Capture)
                .and_then(|()| capture::run(config, flags))
            {
                Ok(()) => 0,
                Err(e) => {
                    error!(err = %e.chain(), "capture process failed");
                    1
                }
            };
            std::process::exit(code);
        }
    }
}

fn read_pid_file(path: &Path) -> Result<Pid, Error> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| err!(NotFound, "unable to read pid file {}: {e}", path.display()))?;
    let pid: i32 = raw
        .trim()
        .parse()
        .map_err(|e| err!(InvalidArgument, "malformed pid file {}: {e}", path.display()))?;
    Ok(Pid::from_raw(pid))
}
