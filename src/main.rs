// This file is part of wdcap, a lossless rotating packet-capture daemon.
// Copyright (C) 2025 The wdcap Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! wdcap: lossless rotating packet capture for network telescopes.

use std::path::PathBuf;

use base::tracing_setup::LogMode;
use bpaf::Bpaf;
use tracing::{debug, error};

mod awrite;
mod capture;
mod config;
mod coord;
mod filename;
mod merger;
mod signals;
mod source;
mod supervisor;

/// wdcap: lossless rotating packet-capture daemon.
#[derive(Bpaf, Debug)]
#[bpaf(options, version)]
struct Args {
    /// Configuration file.
    #[bpaf(short('c'), long("config"), argument("PATH"))]
    config: PathBuf,

    /// Log destination: terminal|stderr, file, syslog, or disabled|off|none.
    #[bpaf(short('l'), long("log"), argument("MODE"), fallback(LogMode::Terminal))]
    log: LogMode,
}

fn main() {
    // If using the clock will fail, find out now *before* anything depends
    // on it (timestamps, reload rate-limiting), so the error is readable.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!("clock_gettime failed: {e}\n\nThis indicates a broken environment.");
        std::process::exit(1);
    }

    let args = match args().run_inner(bpaf::Args::current_args()) {
        Ok(args) => args,
        Err(e) => {
            e.print_message(100);
            // Usage always exits unsuccessfully, help included.
            std::process::exit(match e.exit_code() {
                0 => 1,
                code => code,
            });
        }
    };

    // Configuration problems are reported on stderr and are fatal before
    // any thread or child exists.
    let config = match config::read_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("wdcap: {}", e.chain());
            std::process::exit(1);
        }
    };
    if let Err(e) = base::tracing_setup::install(args.log, config.logfile.as_deref()) {
        eprintln!("wdcap: {}", e.chain());
        std::process::exit(1);
    }

    match supervisor::run(&args.config, config) {
        Ok(code) => {
            debug!("exiting with status {code}");
            std::process::exit(code);
        }
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
