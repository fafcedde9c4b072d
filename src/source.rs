// This file is part of wdcap, a lossless rotating packet-capture daemon.
// Copyright (C) 2025 The wdcap Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The capture-source seam.
//!
//! A [`Source`] opens into one [`PacketStream`] per capture thread plus a
//! shared [`Capture`] handle. Each stream delivers that thread's packets in
//! arrival order (so per-stream timestamps never decrease), interleaved with
//! tick events roughly once per second, and `Eof` once the source is
//! exhausted or stopped.
//!
//! The only built-in source is offline replay of a pcap file; live capture
//! belongs to an external capture library behind this same seam.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, OnceLock};

use base::{bail, Error, ResultExt};
use tracing::warn;
use trace::{Packet, PacketTime};

/// Per-thread cumulative capture counters. A value of -1 means the source
/// does not track that counter for this thread.
#[derive(Clone, Copy, Debug)]
pub struct CaptureStats {
    pub accepted: i64,
    pub filtered: i64,
    pub received: i64,
    pub dropped: i64,
    pub missing: i64,
}

impl CaptureStats {
    /// Field names and values in `.stats`-file order.
    pub fn fields(&self) -> [(&'static str, i64); 5] {
        [
            ("accepted_pkts", self.accepted),
            ("filtered_pkts", self.filtered),
            ("received_pkts", self.received),
            ("dropped_pkts", self.dropped),
            ("missing_pkts", self.missing),
        ]
    }
}

impl Default for CaptureStats {
    fn default() -> Self {
        CaptureStats {
            accepted: -1,
            filtered: -1,
            received: -1,
            dropped: -1,
            missing: -1,
        }
    }
}

pub enum SourceEvent {
    Packet(Packet),

    /// Periodic (~1 Hz) prompt to inspect stats, delivered even when the
    /// stream itself is between packets.
    Tick,

    /// The source is exhausted or was stopped; no further events follow.
    Eof,
}

/// One capture thread's view of the source. Packets arrive in order, so
/// per-stream timestamps are non-decreasing.
pub trait PacketStream: Send + 'static {
    /// Blocks for the next event.
    fn next(&mut self) -> Result<SourceEvent, Error>;

    /// Cumulative counters for this thread.
    fn stats(&self) -> CaptureStats;
}

/// Shared handle to a started capture.
pub trait Capture: Send + Sync + 'static {
    /// Timestamp of the globally-first packet across all threads. `None`
    /// only before any packet has been delivered to any stream.
    fn first_packet_time(&self) -> Option<PacketTime>;

    /// Link type of delivered packets, as a pcap linktype code.
    fn linktype(&self) -> u32;

    /// Requests that all streams wind down; each then yields `Eof`.
    fn stop(&self);
}

pub trait Source: std::fmt::Debug {
    fn open(&self, threads: usize) -> Result<(Arc<dyn Capture>, Vec<Box<dyn PacketStream>>), Error>;
}

/// Builds a source from a configured input URI.
pub fn from_uri(uri: &str) -> Result<Box<dyn Source + Send + Sync>, Error> {
    match uri.split_once(':') {
        Some(("pcapfile", path)) => Ok(Box::new(PcapFileSource::new(path))),
        Some((scheme, _)) => {
            bail!(Unimplemented, "unsupported capture source scheme {scheme:?}")
        }
        None => Ok(Box::new(PcapFileSource::new(uri))),
    }
}

/// Queue depth between the replay dispatcher and each worker.
const REPLAY_QUEUE_DEPTH: usize = 1024;

/// Offline replay of a pcap file.
///
/// A dispatcher thread reads the file in order and fans packets out to
/// per-worker queues by a stable flow hash, so one flow stays on one worker
/// and every worker's stream remains chronological. Tick events are
/// synthesized from capture time, once per second of trace.
#[derive(Debug)]
pub struct PcapFileSource {
    path: PathBuf,
}

impl PcapFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        PcapFileSource { path: path.into() }
    }
}

struct ReplayShared {
    first: OnceLock<PacketTime>,
    stopped: AtomicBool,
    linktype: u32,
    accepted: Vec<AtomicI64>,
}

struct ReplayCapture {
    shared: Arc<ReplayShared>,
}

impl Capture for ReplayCapture {
    fn first_packet_time(&self) -> Option<PacketTime> {
        self.shared.first.get().copied()
    }

    fn linktype(&self) -> u32 {
        self.shared.linktype
    }

    fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
    }
}

struct ReplayStream {
    idx: usize,
    rx: Receiver<SourceEvent>,
    shared: Arc<ReplayShared>,
}

impl PacketStream for ReplayStream {
    fn next(&mut self) -> Result<SourceEvent, Error> {
        // A closed queue means the dispatcher is done: end of stream.
        Ok(self.rx.recv().unwrap_or(SourceEvent::Eof))
    }

    fn stats(&self) -> CaptureStats {
        let accepted = self.shared.accepted[self.idx].load(Ordering::Relaxed);
        CaptureStats {
            accepted,
            filtered: 0,
            received: accepted,
            dropped: 0,
            missing: -1,
        }
    }
}

impl Source for PcapFileSource {
    fn open(&self, threads: usize) -> Result<(Arc<dyn Capture>, Vec<Box<dyn PacketStream>>), Error> {
        let f = File::open(&self.path)
            .map_err(|e| base::err!(NotFound, "unable to open {}: {e}", self.path.display()))?;
        let reader = trace::pcap::Reader::new(BufReader::with_capacity(1 << 16, f))?;
        let shared = Arc::new(ReplayShared {
            first: OnceLock::new(),
            stopped: AtomicBool::new(false),
            linktype: reader.linktype(),
            accepted: (0..threads).map(|_| AtomicI64::new(0)).collect(),
        });
        let mut txs = Vec::with_capacity(threads);
        let mut streams: Vec<Box<dyn PacketStream>> = Vec::with_capacity(threads);
        for idx in 0..threads {
            let (tx, rx) = std::sync::mpsc::sync_channel(REPLAY_QUEUE_DEPTH);
            txs.push(tx);
            streams.push(Box::new(ReplayStream {
                idx,
                rx,
                shared: shared.clone(),
            }));
        }
        let dispatcher_shared = shared.clone();
        std::thread::Builder::new()
            .name("replay-dispatch".to_owned())
            .spawn(move || dispatch(reader, dispatcher_shared, txs))
            .err_kind(base::ErrorKind::Internal)?;
        Ok((Arc::new(ReplayCapture { shared }), streams))
    }
}

fn dispatch(
    mut reader: trace::pcap::Reader<BufReader<File>>,
    shared: Arc<ReplayShared>,
    txs: Vec<SyncSender<SourceEvent>>,
) {
    let threads = txs.len();
    let mut last_tick_sec: Option<u32> = None;
    while !shared.stopped.load(Ordering::SeqCst) {
        let pkt = match reader.next() {
            Ok(Some(pkt)) => pkt,
            Ok(None) => break,
            Err(e) => {
                warn!(err = %e.chain(), "replay read failed; ending capture");
                break;
            }
        };
        let _ = shared.first.set(pkt.time);
        if last_tick_sec.map(|t| pkt.time.sec > t).unwrap_or(true) {
            last_tick_sec = Some(pkt.time.sec);
            for tx in &txs {
                let _ = tx.send(SourceEvent::Tick);
            }
        }
        let idx = flow_hash(&pkt.data) as usize % threads;
        shared.accepted[idx].fetch_add(1, Ordering::Relaxed);
        if tx_send(&txs[idx], pkt).is_err() {
            break; // worker went away; nothing left to feed
        }
    }
    // Dropping the senders delivers Eof to every stream.
}

fn tx_send(tx: &SyncSender<SourceEvent>, pkt: Packet) -> Result<(), ()> {
    tx.send(SourceEvent::Packet(pkt)).map_err(|_| ())
}

/// FNV-1a over the frame prefix. Stable across runs so a flow always lands
/// on the same worker.
pub(crate) fn flow_hash(data: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in data.iter().take(64) {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x100_0000_01b3);
    }
    h
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Scripted sources for worker and merger tests.

    use super::*;

    pub struct ScriptedCapture {
        first: Option<PacketTime>,
    }

    impl ScriptedCapture {
        pub fn new(first: Option<PacketTime>) -> Arc<Self> {
            Arc::new(ScriptedCapture { first })
        }
    }

    impl Capture for ScriptedCapture {
        fn first_packet_time(&self) -> Option<PacketTime> {
            self.first
        }

        fn linktype(&self) -> u32 {
            trace::pcap::LINKTYPE_ETHERNET
        }

        fn stop(&self) {}
    }

    /// Yields a fixed list of events, then `Eof` forever.
    pub struct ScriptedStream {
        events: std::vec::IntoIter<SourceEvent>,
        pub stats: CaptureStats,
    }

    impl ScriptedStream {
        pub fn new(events: Vec<SourceEvent>) -> Self {
            ScriptedStream {
                events: events.into_iter(),
                stats: CaptureStats::default(),
            }
        }
    }

    impl PacketStream for ScriptedStream {
        fn next(&mut self) -> Result<SourceEvent, Error> {
            Ok(self.events.next().unwrap_or(SourceEvent::Eof))
        }

        fn stats(&self) -> CaptureStats {
            self.stats
        }
    }
}
