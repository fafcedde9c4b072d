// This file is part of wdcap, a lossless rotating packet-capture daemon.
// Copyright (C) 2025 The wdcap Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Runtime configuration file (TOML).

use std::path::{Path, PathBuf};

use base::{bail, err, Error};
use serde::Deserialize;

/// Upper bound on capture threads. The merge scan is linear in the worker
/// count per packet, which stays cheap only for modest fan-out.
pub const MAX_THREADS: usize = 64;

fn default_threads() -> usize {
    1
}

fn default_interval() -> u32 {
    300
}

fn default_monitor() -> String {
    "unknown".to_owned()
}

fn default_format() -> String {
    "pcap".to_owned()
}

fn default_pidfile() -> PathBuf {
    "/var/run/wdcap.pid".into()
}

/// Top-level configuration file object.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConfigFile {
    /// Capture source URI, e.g. `pcapfile:/data/input.pcap`.
    pub input: String,

    /// Number of capture threads.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Length of one output interval, in seconds.
    #[serde(default = "default_interval")]
    pub interval_secs: u32,

    /// Filename template for interim and merged traces; see the directives
    /// in [`crate::filename`].
    pub template: String,

    /// Monitor id substituted for `%N`.
    #[serde(default = "default_monitor")]
    pub monitor: String,

    /// On-disk trace format. Only `pcap` is supported.
    #[serde(default = "default_format")]
    pub format: String,

    #[serde(default = "default_pidfile")]
    pub pidfile: PathBuf,

    /// Log destination for `-l file`.
    #[serde(default)]
    pub logfile: Option<PathBuf>,

    /// Write a `.stats` sidecar next to each merged trace.
    #[serde(default)]
    pub stats: bool,

    /// Strip 802.1Q/802.1ad tags before writing. Leave off when the feed
    /// carries no VLANs; stripping costs a copy per tagged packet.
    #[serde(default)]
    pub strip_vlan: bool,
}

impl ConfigFile {
    fn validate(&self) -> Result<(), Error> {
        if self.input.is_empty() {
            bail!(InvalidArgument, "input must be non-empty");
        }
        if self.template.is_empty() {
            bail!(InvalidArgument, "template must be non-empty");
        }
        if self.threads == 0 || self.threads > MAX_THREADS {
            bail!(
                InvalidArgument,
                "threads must be in [1, {MAX_THREADS}], not {}",
                self.threads
            );
        }
        if self.interval_secs == 0 {
            bail!(InvalidArgument, "interval_secs must be positive");
        }
        Ok(())
    }
}

pub fn read_config(path: &Path) -> Result<ConfigFile, Error> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| err!(NotFound, "unable to read {}: {e}", path.display()))?;
    let config: ConfigFile = toml::from_str(&raw)
        .map_err(|e| err!(InvalidArgument, "unable to parse {}: {e}", path.display()))?;
    config.validate()?;
    Ok(config)
}
