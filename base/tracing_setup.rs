// This file is part of wdcap, a lossless rotating packet-capture daemon.
// Copyright (C) 2025 The wdcap Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Logic for setting up a `tracing` subscriber according to the `-l` flag.

use std::ffi::CString;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use tracing::{error, Level};
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::{fmt::format::Writer, layer::SubscriberExt, Layer};

use crate::{err, Error, ResultExt};

/// Destination for log output, from the `-l` command-line flag.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum LogMode {
    /// Human-readable output on stderr.
    #[default]
    Terminal,

    /// Append to the log file named in the configuration.
    File,

    /// `syslog(3)` with ident `wdcap`.
    Syslog,

    /// No log output at all.
    Disabled,
}

impl FromStr for LogMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "terminal" | "stderr" => Ok(LogMode::Terminal),
            "file" => Ok(LogMode::File),
            "syslog" => Ok(LogMode::Syslog),
            "disabled" | "off" | "none" => Ok(LogMode::Disabled),
            _ => Err(err!(InvalidArgument, "unknown log mode {s:?}")),
        }
    }
}

struct JiffTimer;

impl FormatTime for JiffTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", jiff::Timestamp::now().strftime("%Y-%m-%dT%H:%M:%S%.6fZ"))
    }
}

fn syslog_priority(level: Level) -> libc::c_int {
    if level >= Level::DEBUG {
        libc::LOG_DEBUG
    } else if level >= Level::INFO {
        libc::LOG_INFO
    } else if level >= Level::WARN {
        libc::LOG_WARNING
    } else {
        libc::LOG_ERR
    }
}

/// Line-buffering writer which forwards each event to `syslog(3)`.
///
/// syslog supplies its own timestamps, so the emitting layer is configured
/// without one.
struct SyslogWriter {
    priority: libc::c_int,
    buf: Vec<u8>,
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogWriter {
    fn drop(&mut self) {
        for line in self.buf.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let Ok(msg) = CString::new(line) else {
                continue;
            };
            unsafe {
                libc::syslog(self.priority, c"%s".as_ptr(), msg.as_ptr());
            }
        }
    }
}

struct MakeSyslogWriter;

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for MakeSyslogWriter {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> SyslogWriter {
        SyslogWriter {
            priority: libc::LOG_INFO,
            buf: Vec::new(),
        }
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> SyslogWriter {
        SyslogWriter {
            priority: syslog_priority(*meta.level()),
            buf: Vec::new(),
        }
    }
}

fn filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .with_env_var("WDCAP_LOG")
        .from_env_lossy()
}

/// Installs the global subscriber for the given mode.
///
/// `log_file` is consulted only in [`LogMode::File`]; pointing `-l file` at a
/// configuration with no `logfile` is a configuration error.
pub fn install(mode: LogMode, log_file: Option<&Path>) -> Result<(), Error> {
    match mode {
        LogMode::Terminal => {
            let sub = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(std::io::stderr)
                    .with_timer(JiffTimer)
                    .with_thread_names(true)
                    .with_filter(filter()),
            );
            tracing::subscriber::set_global_default(sub).err_kind(crate::ErrorKind::Internal)?;
        }
        LogMode::File => {
            let path = log_file
                .ok_or_else(|| err!(InvalidArgument, "-l file requires logfile in config"))?;
            let f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let sub = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(std::sync::Mutex::new(f))
                    .with_ansi(false)
                    .with_timer(JiffTimer)
                    .with_thread_names(true)
                    .with_filter(filter()),
            );
            tracing::subscriber::set_global_default(sub).err_kind(crate::ErrorKind::Internal)?;
        }
        LogMode::Syslog => {
            unsafe {
                libc::openlog(c"wdcap".as_ptr(), libc::LOG_PID, libc::LOG_DAEMON);
            }
            let sub = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(MakeSyslogWriter)
                    .with_ansi(false)
                    .without_time()
                    .with_filter(filter()),
            );
            tracing::subscriber::set_global_default(sub).err_kind(crate::ErrorKind::Internal)?;
        }
        LogMode::Disabled => {
            tracing::subscriber::set_global_default(tracing_subscriber::registry())
                .err_kind(crate::ErrorKind::Internal)?;
        }
    }
    let use_panic_hook = std::env::var("WDCAP_PANIC_HOOK")
        .map(|s| s != "false" && s != "0")
        .unwrap_or(true);
    if use_panic_hook {
        std::panic::set_hook(Box::new(panic_hook));
    }
    Ok(())
}

/// Custom panic hook that logs instead of directly writing to stderr, so the
/// report lands wherever the configured log mode points.
fn panic_hook(p: &std::panic::PanicHookInfo) {
    let payload: Option<&str> = if let Some(s) = p.payload().downcast_ref::<&str>() {
        Some(*s)
    } else if let Some(s) = p.payload().downcast_ref::<String>() {
        Some(s)
    } else {
        None
    };
    error!(
        target: std::env!("CARGO_CRATE_NAME"),
        location = p.location().map(tracing::field::display),
        payload = payload.map(tracing::field::display),
        backtrace = %std::backtrace::Backtrace::force_capture(),
        "panic",
    );
}

pub fn install_for_tests() {
    let sub = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::Layer::new()
            .with_test_writer()
            .with_timer(JiffTimer)
            .with_thread_names(true)
            .with_filter(filter()),
    );
    // Ignore errors from multiple tests racing to install.
    let _ = tracing::subscriber::set_global_default(sub);
}

#[cfg(test)]
mod tests {
    use super::LogMode;

    #[test]
    fn log_mode_from_str() {
        assert_eq!("terminal".parse::<LogMode>().unwrap(), LogMode::Terminal);
        assert_eq!("stderr".parse::<LogMode>().unwrap(), LogMode::Terminal);
        assert_eq!("file".parse::<LogMode>().unwrap(), LogMode::File);
        assert_eq!("syslog".parse::<LogMode>().unwrap(), LogMode::Syslog);
        for s in ["disabled", "off", "none"] {
            assert_eq!(s.parse::<LogMode>().unwrap(), LogMode::Disabled);
        }
        "oops".parse::<LogMode>().unwrap_err();
    }
}
