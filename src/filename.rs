// This file is part of wdcap, a lossless rotating packet-capture daemon.
// Copyright (C) 2025 The wdcap Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Filename template rendering.
//!
//! Templates use `%`-introduced directives. Beyond the standard strftime
//! time directives (rendered in UTC from the interval timestamp), wdcap
//! recognizes:
//!
//! * `%N`: the monitor id from the configuration
//! * `%P`: the plugin tag (legacy; always `wdcap`)
//! * `%f`: the trace-format extension (e.g. `pcap`)
//! * `%s`: the interval timestamp as unix seconds
//!
//! Rendering is pure: the same inputs always produce the same path. That
//! matters because workers derive interim paths when opening them for write
//! and the merger re-derives the very same paths to find the files again.

use base::{bail, err, Error, ResultExt};
use jiff::tz::TimeZone;

use crate::config::ConfigFile;

/// Tag identifying this capture program in rendered names; fixed for
/// compatibility with the telescope's archival tooling.
const PLUGIN_TAG: &str = "wdcap";

/// Suffix appended to a base name when rendering a marker path.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Marker {
    None,
    Done,
    Stats,
}

/// Renders trace-file names from the configured template.
pub struct FileNamer {
    template: String,
    monitor: String,
    /// Trace-format extension substituted for `%f`.
    ext: String,
    /// URI scheme understood by the trace codec, without the trailing colon.
    scheme: String,
}

impl FileNamer {
    pub fn from_config(config: &ConfigFile) -> Result<Self, Error> {
        let (scheme, ext) = match config.format.as_str() {
            "pcap" => ("pcapfile", "pcap"),
            f => bail!(Unimplemented, "unsupported trace format {f:?}"),
        };
        Ok(FileNamer {
            template: config.template.clone(),
            monitor: config.monitor.clone(),
            ext: ext.to_owned(),
            scheme: scheme.to_owned(),
        })
    }

    /// URI of worker `i`'s interim file for the interval starting at `t0`.
    pub fn interim(&self, t0: u32, worker: usize) -> Result<String, Error> {
        self.render(t0, Some(worker), true, Marker::None)
    }

    /// URI of the merged output file for the interval starting at `t0`.
    pub fn output(&self, t0: u32) -> Result<String, Error> {
        self.render(t0, None, true, Marker::None)
    }

    /// Path of the completion marker for the interval starting at `t0`.
    pub fn done(&self, t0: u32) -> Result<String, Error> {
        self.render(t0, None, false, Marker::Done)
    }

    /// Path of the statistics sidecar for the interval starting at `t0`.
    pub fn stats(&self, t0: u32) -> Result<String, Error> {
        self.render(t0, None, false, Marker::Stats)
    }

    pub fn render(
        &self,
        t0: u32,
        worker: Option<usize>,
        scheme: bool,
        marker: Marker,
    ) -> Result<String, Error> {
        let zoned = jiff::Timestamp::from_second(i64::from(t0))
            .err_kind(base::ErrorKind::OutOfRange)?
            .to_zoned(TimeZone::UTC);
        let mut out = String::with_capacity(self.template.len() + 32);
        if scheme {
            out.push_str(&self.scheme);
            out.push(':');
        }
        let mut it = self.template.chars();
        while let Some(c) = it.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            let Some(d) = it.next() else {
                bail!(InvalidArgument, "template ends mid-directive");
            };
            match d {
                '%' => out.push('%'),
                'N' => out.push_str(&self.monitor),
                'P' => out.push_str(PLUGIN_TAG),
                'f' => out.push_str(&self.ext),
                's' => out.push_str(&t0.to_string()),
                _ => {
                    let expanded = jiff::fmt::strtime::format(format!("%{d}"), &zoned)
                        .map_err(|e| err!(InvalidArgument, "bad template directive %{d}: {e}"))?;
                    out.push_str(&expanded);
                }
            }
        }
        if let Some(i) = worker {
            out.push_str("--");
            out.push_str(&i.to_string());
        } else {
            match marker {
                Marker::None => {}
                Marker::Done => out.push_str(".done"),
                Marker::Stats => out.push_str(".stats"),
            }
        }
        Ok(out)
    }
}

/// Strips a leading `scheme:` prefix from a rendered URI, yielding the bare
/// filesystem path.
pub fn strip_scheme(uri: &str) -> &str {
    match uri.split_once(':') {
        Some((scheme, rest))
            if !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            rest
        }
        _ => uri,
    }
}
