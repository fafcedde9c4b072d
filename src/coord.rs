// This file is part of wdcap, a lossless rotating packet-capture daemon.
// Copyright (C) 2025 The wdcap Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The coordination channel between capture workers and the merger.
//!
//! Multi-producer (each worker's interim writer, plus the main thread for
//! [`Record::Stop`]), single-consumer, carrying small copyable records.
//! Delivery is in-order per producer; no ordering holds across producers.
//! The channel is unbounded, so the hot path never blocks on it; the merger
//! is expected to keep up, with transient bursts absorbed by the channel's
//! internal buffering.

use std::os::unix::io::RawFd;
use std::sync::mpsc;

use crate::source::CaptureStats;

/// Sentinel for [`IntervalDone::src_fd`]: the worker opened no interim file
/// for the interval.
pub const NO_FD: RawFd = -1;

/// Fixed-size record passed to the merger.
#[derive(Clone, Copy, Debug)]
pub enum Record {
    IntervalDone(IntervalDone),

    /// Sent once by the main thread during shutdown; the merger exits its
    /// loop on receipt.
    Stop,
}

/// One worker's report that it has finished writing an interval.
#[derive(Clone, Copy, Debug)]
pub struct IntervalDone {
    pub worker: usize,

    /// Start of the completed interval (unix seconds).
    pub timestamp: u32,

    /// Descriptor of the fully-written interim file, or [`NO_FD`] if this
    /// worker saw no packets in the interval. Ownership passes to the
    /// merger, which must close it.
    pub src_fd: RawFd,

    /// Per-thread capture statistics snapshot, when stats are enabled.
    pub stats: Option<CaptureStats>,
}

pub type Sender = mpsc::Sender<Record>;
pub type Receiver = mpsc::Receiver<Record>;

pub fn channel() -> (Sender, Receiver) {
    mpsc::channel()
}
