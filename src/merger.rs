// This file is part of wdcap, a lossless rotating packet-capture daemon.
// Copyright (C) 2025 The wdcap Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The merger: single consumer of the coordination channel.
//!
//! Tracks which workers have finished each interval, closes handed-off
//! descriptors (blocking, and deliberately far from the packet path), and
//! once an interval is complete performs a k-way chronological merge of the
//! workers' interim files into one output trace, then marks the interval
//! done for downstream archival.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;

use base::clock::{Clocks, TimerGuard};
use base::{err, Error};
use tracing::{debug, error, info, warn};
use trace::{pcap, Packet};

use crate::coord::{self, IntervalDone, Record};
use crate::filename::{strip_scheme, FileNamer};
use crate::source::CaptureStats;

/// Reserved thread id for the aggregate lines of a `.stats` file.
const STATS_SUMMARY_ID: i64 = -1;

/// One interval awaiting completion reports from some subset of workers.
#[derive(Default)]
struct PendingInterval {
    /// Worker ids in report order, each with its stats snapshot.
    reported: Vec<(usize, Option<CaptureStats>)>,
}

pub struct Merger<C: Clocks> {
    n_workers: usize,
    namer: Arc<FileNamer>,
    stats_enabled: bool,
    clocks: C,
    rx: coord::Receiver,

    /// Pending intervals keyed by start timestamp; expected length 0 or 1
    /// in normal operation.
    pending: BTreeMap<u32, PendingInterval>,
}

impl<C: Clocks> Merger<C> {
    pub fn new(
        n_workers: usize,
        namer: Arc<FileNamer>,
        stats_enabled: bool,
        clocks: C,
        rx: coord::Receiver,
    ) -> Self {
        Merger {
            n_workers,
            namer,
            stats_enabled,
            clocks,
            rx,
            pending: BTreeMap::new(),
        }
    }

    pub fn run(mut self) {
        info!("merger starting");
        loop {
            let record = match self.rx.recv() {
                Ok(r) => r,
                Err(_) => {
                    warn!("coordination channel closed without a stop record");
                    break;
                }
            };
            match record {
                Record::Stop => break,
                Record::IntervalDone(done) => self.interval_done(done),
            }
        }
        for (&t0, p) in &self.pending {
            warn!(
                timestamp = t0,
                reported = p.reported.len(),
                "interval incomplete at shutdown; interim files left on disk"
            );
        }
        info!("merger ending");
    }

    fn interval_done(&mut self, done: IntervalDone) {
        debug!(
            worker = done.worker,
            timestamp = done.timestamp,
            fd = done.src_fd,
            "interval report"
        );
        if done.src_fd >= 0 {
            // The handed-off descriptor's close lives here so it can never
            // stall a capture thread.
            if let Err(e) = nix::unistd::close(done.src_fd) {
                warn!(worker = done.worker, err = %e, "closing interim descriptor failed");
            }
        }
        let pending = self.pending.entry(done.timestamp).or_default();
        pending.reported.push((done.worker, done.stats));
        if pending.reported.len() < self.n_workers {
            return;
        }
        if self.pending.keys().next() != Some(&done.timestamp) {
            // A straggler is still holding an older interval open. Each
            // interim file is independently complete, so merging the newer
            // interval now is safe.
            warn!(
                timestamp = done.timestamp,
                "interval completed ahead of an older one still pending"
            );
        }
        if let Some(p) = self.pending.remove(&done.timestamp) {
            self.merge_interval(done.timestamp, &p);
        }
    }

    /// Merges one completed interval and emits its artifacts. On merge
    /// failure the `.done` marker is withheld (the downstream signal of data
    /// loss) but interim files are still removed.
    fn merge_interval(&mut self, t0: u32, pending: &PendingInterval) {
        let start = self.clocks.monotonic();
        let (mut readers, open_err) = self.open_readers(t0);
        let result = match open_err {
            Some(e) => Err(e),
            None => self.write_merged(t0, &mut readers),
        };
        let mut unlinked = 0;
        for r in &mut readers {
            unlinked += r.unlink() as usize;
        }
        match result {
            Ok(packets) => {
                let elapsed = self.clocks.monotonic().saturating_sub(start);
                if self.stats_enabled {
                    if let Err(e) = self.write_stats(t0, pending, elapsed) {
                        warn!(timestamp = t0, err = %e.chain(), "unable to write stats sidecar");
                    }
                }
                if let Err(e) = self.write_done_marker(t0) {
                    error!(timestamp = t0, err = %e.chain(), "unable to create done marker");
                    return;
                }
                info!(
                    timestamp = t0,
                    packets,
                    interim_files = unlinked,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "interval merged"
                );
            }
            Err(e) => {
                // Visible data loss: downstream archival must notice the
                // missing marker.
                error!(timestamp = t0, err = %e.chain(), "merge abandoned; no done marker");
            }
        }
    }

    /// Opens every worker's interim file for `t0`. A worker that wrote no
    /// packets has no file; its reader starts (and stays) at end of stream.
    ///
    /// Any other open failure means a worker's interval can't be read; the
    /// first such error is returned so the merge is abandoned, but every
    /// reader is still constructed so cleanup covers all the files.
    fn open_readers(&self, t0: u32) -> (Vec<InterimReader>, Option<Error>) {
        let mut first_err = None;
        let readers = (0..self.n_workers)
            .map(|i| {
                let uri = match self.namer.interim(t0, i) {
                    Ok(uri) => uri,
                    Err(e) => {
                        error!(worker = i, err = %e.chain(), "unable to derive interim path");
                        first_err.get_or_insert(e);
                        return InterimReader::missing();
                    }
                };
                let (reader, err) = InterimReader::open(uri);
                if let Some(e) = err {
                    error!(worker = i, err = %e.chain(), "unable to open interim file");
                    first_err.get_or_insert(e);
                }
                reader
            })
            .collect();
        (readers, first_err)
    }

    fn write_merged(&self, t0: u32, readers: &mut [InterimReader]) -> Result<u64, Error> {
        let out_uri = self.namer.output(t0)?;
        let linktype = readers
            .iter()
            .find_map(InterimReader::linktype)
            .unwrap_or(pcap::LINKTYPE_ETHERNET);
        let _t = TimerGuard::new(&self.clocks, || format!("merging interval {t0}"));
        let out = File::create(strip_scheme(&out_uri))
            .map_err(|e| err!(Unknown, "unable to create {out_uri}: {e}"))?;
        let mut out = pcap::Writer::new(BufWriter::with_capacity(1 << 16, out), linktype)?;
        let mut packets = 0u64;
        while let Some(idx) = choose_next(readers)? {
            out.append(&readers[idx].take())?;
            packets += 1;
        }
        out.into_inner()
            .into_inner()
            .map_err(|e| err!(DataLoss, "flushing {out_uri}: {}", e.error()))?;
        Ok(packets)
    }

    fn write_stats(&self, t0: u32, pending: &PendingInterval, elapsed: Duration) -> Result<(), Error> {
        let path = self.namer.stats(t0)?;
        let mut f = BufWriter::new(File::create(&path)?);
        writeln!(f, "time:{t0}")?;
        for &(worker, stats) in &pending.reported {
            let stats = stats.unwrap_or_default();
            for (name, value) in stats.fields() {
                writeln!(f, "thread:{worker} {name}:{value}")?;
            }
        }
        let field_names: Vec<&str> = CaptureStats::default()
            .fields()
            .iter()
            .map(|&(name, _)| name)
            .collect();
        for (fi, name) in field_names.iter().enumerate() {
            let mut any_valid = false;
            let mut sum = 0i64;
            for &(_, stats) in &pending.reported {
                let value = stats.unwrap_or_default().fields()[fi].1;
                if value >= 0 {
                    any_valid = true;
                    sum += value;
                }
            }
            let value = if any_valid { sum } else { -1 };
            writeln!(f, "thread:{STATS_SUMMARY_ID} {name}:{value}")?;
        }
        writeln!(f, "merge_duration_msec:{}", elapsed.as_millis())?;
        f.into_inner()
            .map_err(|e| err!(DataLoss, "flushing {path}: {}", e.error()))?;
        Ok(())
    }

    fn write_done_marker(&self, t0: u32) -> Result<(), Error> {
        let path = self.namer.done(t0)?;
        File::create(&path).map_err(|e| err!(Unknown, "unable to create {path}: {e}"))?;
        Ok(())
    }
}

enum ReaderState {
    /// Open with nothing buffered; the next scan reads a packet.
    Idle(pcap::Reader<BufReader<File>>),

    /// A packet is buffered and is a merge candidate.
    Buffered(pcap::Reader<BufReader<File>>, Packet),

    /// Exhausted, or the file never existed.
    Eof,
}

/// Transient per-worker read state during one interval's merge.
struct InterimReader {
    /// Rendered URI, if the interim file existed when the merge began.
    uri: Option<String>,
    state: ReaderState,
}

impl InterimReader {
    /// Opens one worker's interim file. A missing file just means that
    /// worker saw no packets and yields an exhausted reader; a file that
    /// exists but can't be read is a merge-abandoning error. The returned
    /// reader remembers the path in either failure case so the file is
    /// still cleaned up.
    fn open(uri: String) -> (Self, Option<Error>) {
        match File::open(strip_scheme(&uri)) {
            Ok(f) => match pcap::Reader::new(BufReader::with_capacity(1 << 16, f)) {
                Ok(r) => (
                    InterimReader {
                        uri: Some(uri),
                        state: ReaderState::Idle(r),
                    },
                    None,
                ),
                Err(e) => {
                    let e = err!(DataLoss, "interim file {uri} unreadable: {}", e.chain());
                    (
                        InterimReader {
                            uri: Some(uri),
                            state: ReaderState::Eof,
                        },
                        Some(e),
                    )
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(%uri, "no interim file (worker saw no packets)");
                (InterimReader::missing(), None)
            }
            Err(e) => {
                let err = err!(Unknown, "unable to open interim file {uri}: {e}");
                (
                    InterimReader {
                        uri: Some(uri),
                        state: ReaderState::Eof,
                    },
                    Some(err),
                )
            }
        }
    }

    fn missing() -> Self {
        InterimReader {
            uri: None,
            state: ReaderState::Eof,
        }
    }

    fn linktype(&self) -> Option<u32> {
        match &self.state {
            ReaderState::Idle(r) | ReaderState::Buffered(r, _) => Some(r.linktype()),
            ReaderState::Eof => None,
        }
    }

    /// Buffers the next packet if none is buffered and any remains,
    /// returning the buffered packet's timestamp in nanoseconds.
    fn peek(&mut self) -> Result<Option<u64>, Error> {
        if matches!(self.state, ReaderState::Idle(_)) {
            match std::mem::replace(&mut self.state, ReaderState::Eof) {
                ReaderState::Idle(mut r) => match r.next()? {
                    Some(pkt) => self.state = ReaderState::Buffered(r, pkt),
                    None => {} // stays Eof
                },
                _ => unreachable!(),
            }
        }
        Ok(match &self.state {
            ReaderState::Buffered(_, pkt) => Some(pkt.time.as_nanos()),
            _ => None,
        })
    }

    /// Takes the buffered packet, leaving the reader ready to buffer the
    /// next one. Must only be called in the buffered state.
    fn take(&mut self) -> Packet {
        match std::mem::replace(&mut self.state, ReaderState::Eof) {
            ReaderState::Buffered(r, pkt) => {
                self.state = ReaderState::Idle(r);
                pkt
            }
            _ => unreachable!("take() on a reader with no buffered packet"),
        }
    }

    /// Removes the interim file if it existed, returning whether it did.
    fn unlink(&mut self) -> bool {
        self.state = ReaderState::Eof;
        let Some(uri) = self.uri.take() else {
            return false;
        };
        if let Err(e) = std::fs::remove_file(strip_scheme(&uri)) {
            warn!(%uri, err = %e, "unable to remove interim file");
        }
        true
    }
}

/// Picks the reader whose buffered packet has the lowest timestamp, reading
/// ahead one packet wherever nothing is buffered yet. Ties go to the lowest
/// worker index. `None` once every reader is exhausted.
fn choose_next(readers: &mut [InterimReader]) -> Result<Option<usize>, Error> {
    let mut best: Option<(usize, u64)> = None;
    for (i, reader) in readers.iter_mut().enumerate() {
        let Some(ts) = reader.peek()? else {
            continue;
        };
        // Strict comparison: on a tie the earlier (lower) index wins.
        if best.map(|(_, b)| ts < b).unwrap_or(true) {
            best = Some((i, ts));
        }
    }
    Ok(best.map(|(i, _)| i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;
    use base::clock::SimulatedClocks;
    use std::os::unix::io::IntoRawFd;
    use std::path::Path;
    use trace::PacketTime;

    const T0: u32 = 1_700_000_000 - (1_700_000_000 % 60); // 1699999980
    const T1: u32 = T0 + 60;

    fn namer(dir: &Path) -> Arc<FileNamer> {
        let config: ConfigFile = toml::from_str(&format!(
            r#"
            input = "pcapfile:unused"
            template = "{}/%N-%s.%f"
            monitor = "scope"
            "#,
            dir.display()
        ))
        .unwrap();
        Arc::new(FileNamer::from_config(&config).unwrap())
    }

    fn pkt(sec: u32, usec: u32, fill: u8) -> Packet {
        Packet::new(PacketTime::new(sec, usec), vec![fill; 32].into())
    }

    /// Writes worker `i`'s interim file for `t0` and returns a descriptor
    /// for the hand-off, mimicking the detach path.
    fn write_interim(namer: &FileNamer, t0: u32, worker: usize, pkts: &[Packet]) -> i32 {
        let uri = namer.interim(t0, worker).unwrap();
        let f = File::create(strip_scheme(&uri)).unwrap();
        let mut w = pcap::Writer::new(BufWriter::new(f), pcap::LINKTYPE_ETHERNET).unwrap();
        for p in pkts {
            w.append(p).unwrap();
        }
        w.into_inner().into_inner().unwrap().into_raw_fd()
    }

    fn done(worker: usize, timestamp: u32, src_fd: i32, stats: Option<CaptureStats>) -> Record {
        Record::IntervalDone(IntervalDone {
            worker,
            timestamp,
            src_fd,
            stats,
        })
    }

    fn run_merger(
        n: usize,
        namer: Arc<FileNamer>,
        stats_enabled: bool,
        records: Vec<Record>,
    ) {
        let (tx, rx) = coord::channel();
        for r in records {
            tx.send(r).unwrap();
        }
        tx.send(Record::Stop).unwrap();
        Merger::new(n, namer, stats_enabled, SimulatedClocks::new(), rx).run();
    }

    fn read_output(namer: &FileNamer, t0: u32) -> Vec<(u32, u32, u8)> {
        let uri = namer.output(t0).unwrap();
        let mut r = pcap::Reader::new(File::open(strip_scheme(&uri)).unwrap()).unwrap();
        let mut out = Vec::new();
        while let Some(p) = r.next().unwrap() {
            out.push((p.time.sec, p.time.usec, p.data[0]));
        }
        out
    }

    #[test]
    fn merges_two_workers_chronologically() {
        let dir = tempfile::tempdir().unwrap();
        let namer = namer(dir.path());
        let fd0 = write_interim(
            &namer,
            T0,
            0,
            &[pkt(T0 + 1, 0, 0), pkt(T0 + 3, 500_000, 0)],
        );
        let fd1 = write_interim(
            &namer,
            T0,
            1,
            &[pkt(T0 + 2, 0, 1), pkt(T0 + 59, 900_000, 1)],
        );
        run_merger(
            2,
            namer.clone(),
            false,
            vec![done(0, T0, fd0, None), done(1, T0, fd1, None)],
        );

        assert_eq!(
            read_output(&namer, T0),
            vec![
                (T0 + 1, 0, 0),
                (T0 + 2, 0, 1),
                (T0 + 3, 500_000, 0),
                (T0 + 59, 900_000, 1),
            ]
        );
        assert!(Path::new(&namer.done(T0).unwrap()).exists());
        // Interim files are gone.
        assert!(!Path::new(strip_scheme(&namer.interim(T0, 0).unwrap())).exists());
        assert!(!Path::new(strip_scheme(&namer.interim(T0, 1).unwrap())).exists());
    }

    #[test]
    fn equal_timestamps_favor_lower_worker_index() {
        let dir = tempfile::tempdir().unwrap();
        let namer = namer(dir.path());
        let fd0 = write_interim(&namer, T0, 0, &[pkt(T0 + 5, 0, 0)]);
        let fd1 = write_interim(&namer, T0, 1, &[pkt(T0 + 5, 0, 1)]);
        run_merger(
            2,
            namer.clone(),
            false,
            vec![done(1, T0, fd1, None), done(0, T0, fd0, None)],
        );
        assert_eq!(read_output(&namer, T0), vec![(T0 + 5, 0, 0), (T0 + 5, 0, 1)]);
    }

    #[test]
    fn silent_worker_completes_interval() {
        let dir = tempfile::tempdir().unwrap();
        let namer = namer(dir.path());
        let fd0 = write_interim(&namer, T1, 0, &[pkt(T1 + 1, 0, 0)]);
        let fd1 = write_interim(&namer, T1, 1, &[pkt(T1 + 2, 0, 1)]);
        run_merger(
            3,
            namer.clone(),
            false,
            vec![
                done(0, T1, fd0, None),
                done(1, T1, fd1, None),
                done(2, T1, coord::NO_FD, None), // no packets, no file
            ],
        );
        assert_eq!(read_output(&namer, T1), vec![(T1 + 1, 0, 0), (T1 + 2, 0, 1)]);
        assert!(Path::new(&namer.done(T1).unwrap()).exists());
    }

    #[test]
    fn newer_interval_merges_ahead_of_stalled_older_one() {
        let dir = tempfile::tempdir().unwrap();
        let namer = namer(dir.path());
        let a0 = write_interim(&namer, T0, 0, &[pkt(T0 + 1, 0, 0)]);
        let a1 = write_interim(&namer, T0, 1, &[pkt(T0 + 2, 0, 1)]);
        let b0 = write_interim(&namer, T1, 0, &[pkt(T1 + 1, 0, 0)]);
        let b1 = write_interim(&namer, T1, 1, &[pkt(T1 + 2, 0, 1)]);
        // Worker 1 lags a full interval behind worker 0.
        run_merger(
            2,
            namer.clone(),
            false,
            vec![
                done(0, T0, a0, None),
                done(0, T1, b0, None),
                done(1, T1, b1, None), // completes T1 while T0 still pending
                done(1, T0, a1, None),
            ],
        );
        assert!(Path::new(&namer.done(T0).unwrap()).exists());
        assert!(Path::new(&namer.done(T1).unwrap()).exists());
        assert_eq!(read_output(&namer, T0).len(), 2);
        assert_eq!(read_output(&namer, T1).len(), 2);
    }

    #[test]
    fn stats_sidecar_contents() {
        let dir = tempfile::tempdir().unwrap();
        let namer = namer(dir.path());
        let fd0 = write_interim(&namer, T0, 0, &[pkt(T0 + 1, 0, 0)]);
        let fd1 = write_interim(&namer, T0, 1, &[pkt(T0 + 2, 0, 1)]);
        let s = |accepted, dropped| CaptureStats {
            accepted,
            filtered: 0,
            received: accepted,
            dropped,
            missing: -1,
        };
        run_merger(
            2,
            namer.clone(),
            true,
            vec![done(0, T0, fd0, Some(s(100, 0))), done(1, T0, fd1, Some(s(200, 5)))],
        );
        let stats = std::fs::read_to_string(namer.stats(T0).unwrap()).unwrap();
        assert!(stats.starts_with(&format!("time:{T0}\n")));
        assert!(stats.contains("thread:0 accepted_pkts:100\n"));
        assert!(stats.contains("thread:1 accepted_pkts:200\n"));
        assert!(stats.contains("thread:-1 accepted_pkts:300\n"));
        assert!(stats.contains("thread:-1 dropped_pkts:5\n"));
        // missing is invalid on every thread, so the aggregate is too.
        assert!(stats.contains("thread:-1 missing_pkts:-1\n"));
        let line = stats
            .lines()
            .find(|l| l.starts_with("merge_duration_msec:"))
            .unwrap();
        let ms: i64 = line.split(':').nth(1).unwrap().parse().unwrap();
        assert!(ms >= 0);
    }

    #[test]
    fn failed_merge_withholds_done_marker_but_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let namer = namer(dir.path());
        // Corrupt interim: a truncated record drops the whole merge.
        let uri = namer.interim(T0, 0).unwrap();
        let good = {
            let mut w = pcap::Writer::new(Vec::new(), pcap::LINKTYPE_ETHERNET).unwrap();
            w.append(&pkt(T0 + 1, 0, 0)).unwrap();
            w.into_inner()
        };
        std::fs::write(strip_scheme(&uri), &good[..good.len() - 4]).unwrap();
        run_merger(1, namer.clone(), false, vec![done(0, T0, coord::NO_FD, None)]);
        assert!(!Path::new(&namer.done(T0).unwrap()).exists());
        assert!(!Path::new(strip_scheme(&uri)).exists());
    }

    #[test]
    fn unreadable_interim_header_abandons_merge() {
        let dir = tempfile::tempdir().unwrap();
        let namer = namer(dir.path());
        // Worker 0's interim exists but isn't a pcap file at all; worker 1's
        // is fine. The whole interval must be abandoned, not silently merged
        // without worker 0's packets, and both files still get cleaned up.
        let bad_uri = namer.interim(T0, 0).unwrap();
        std::fs::write(strip_scheme(&bad_uri), b"garbage, not a capture").unwrap();
        let fd1 = write_interim(&namer, T0, 1, &[pkt(T0 + 1, 0, 1)]);
        run_merger(
            2,
            namer.clone(),
            false,
            vec![done(0, T0, coord::NO_FD, None), done(1, T0, fd1, None)],
        );
        assert!(!Path::new(&namer.done(T0).unwrap()).exists());
        assert!(!Path::new(strip_scheme(&namer.output(T0).unwrap())).exists());
        assert!(!Path::new(strip_scheme(&bad_uri)).exists());
        assert!(!Path::new(strip_scheme(&namer.interim(T0, 1).unwrap())).exists());
    }

    #[test]
    fn handed_off_descriptors_are_closed() {
        let dir = tempfile::tempdir().unwrap();
        let namer = namer(dir.path());
        let fd = write_interim(&namer, T0, 0, &[pkt(T0 + 1, 0, 0)]);
        // Park the descriptor at a number the kernel won't hand out again
        // mid-test, so the post-merge check can't race fd reuse.
        let parked = 741;
        nix::unistd::dup2(fd, parked).unwrap();
        nix::unistd::close(fd).unwrap();
        run_merger(1, namer.clone(), false, vec![done(0, T0, parked, None)]);
        assert_eq!(
            nix::sys::stat::fstat(parked).unwrap_err(),
            nix::errno::Errno::EBADF
        );
    }

    #[test]
    fn incomplete_interval_survives_stop() {
        let dir = tempfile::tempdir().unwrap();
        let namer = namer(dir.path());
        let fd = write_interim(&namer, T0, 0, &[pkt(T0 + 1, 0, 0)]);
        // Only one of two workers reports before shutdown.
        run_merger(2, namer.clone(), false, vec![done(0, T0, fd, None)]);
        assert!(!Path::new(&namer.done(T0).unwrap()).exists());
        assert!(Path::new(strip_scheme(&namer.interim(T0, 0).unwrap())).exists());
    }
}
