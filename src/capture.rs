// This file is part of wdcap, a lossless rotating packet-capture daemon.
// Copyright (C) 2025 The wdcap Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The capture process: worker hot path and child lifecycle.
//!
//! Each worker drains one capture stream, appends packets to its private
//! interim file in arrival order, and reports each interval boundary to the
//! merger over the coordination channel. The packet path never opens,
//! closes, or flushes a file itself; see [`crate::awrite`].

use std::io::Write;
use std::sync::Arc;

use base::clock::Clocks;
use base::{err, Error};
use parking_lot::Mutex;
use tracing::{error, info, warn};
use trace::strip_vlan;
use trace::Packet;

use crate::awrite::InterimWriter;
use crate::config::ConfigFile;
use crate::coord;
use crate::filename::{strip_scheme, FileNamer};
use crate::merger::Merger;
use crate::signals::{self, Flags};
use crate::source::{self, Capture, PacketStream, SourceEvent};

/// Shared drain bookkeeping: how many workers have finished their reload
/// drain. The mutex also orders the final worker's halt request, so "all
/// workers ended" is decided exactly once.
pub struct WorkerDrain {
    ended: Mutex<usize>,
    total: usize,
}

impl WorkerDrain {
    pub fn new(total: usize) -> Arc<Self> {
        Arc::new(WorkerDrain {
            ended: Mutex::new(0),
            total,
        })
    }
}

/// State shared by all workers of one capture run.
#[derive(Clone)]
pub struct Environment {
    pub flags: Arc<Flags>,
    pub drain: Arc<WorkerDrain>,
    pub capture: Arc<dyn Capture>,
    pub namer: Arc<FileNamer>,
    pub done_tx: coord::Sender,
    pub interval_len: u32,
    pub stats_enabled: bool,
    pub strip_vlan: bool,
}

pub struct Worker {
    idx: usize,
    env: Environment,
    stream: Box<dyn PacketStream>,
    writer: InterimWriter,

    /// Start of the interval currently being written; 0 until the first
    /// packet establishes the common starting interval.
    interval_start: u32,
    next_boundary: u32,

    /// Rendered URI of the open interim file, if one is open.
    interim_path: Option<String>,

    last_seen_missing: i64,
    last_seen_accepted: i64,

    /// Once set, every further packet is dropped on the floor; the worker
    /// has drained for reload.
    ending: bool,
}

impl Worker {
    pub fn new(env: &Environment, idx: usize, stream: Box<dyn PacketStream>) -> Result<Self, Error> {
        let writer = InterimWriter::spawn(idx, env.flags.clone())?;
        Ok(Worker {
            idx,
            env: env.clone(),
            stream,
            writer,
            interval_start: 0,
            next_boundary: 0,
            interim_path: None,
            last_seen_missing: -1,
            last_seen_accepted: -1,
            ending: false,
        })
    }

    pub fn run(&mut self) {
        loop {
            if self.env.flags.halted() {
                break;
            }
            match self.stream.next() {
                Ok(SourceEvent::Packet(pkt)) => {
                    if let Err(e) = self.handle_packet(pkt) {
                        error!(worker = self.idx, err = %e.chain(), "worker failed");
                        self.env.flags.request_halt();
                        break;
                    }
                    if self.ending {
                        // Drained for reload; keep eating packets so the
                        // source can wind down, but do no more work.
                        continue;
                    }
                }
                Ok(SourceEvent::Tick) => self.tick(),
                Ok(SourceEvent::Eof) => break,
                Err(e) => {
                    error!(worker = self.idx, err = %e.chain(), "capture stream failed");
                    self.env.flags.request_halt();
                    break;
                }
            }
        }
    }

    fn handle_packet(&mut self, pkt: Packet) -> Result<(), Error> {
        if self.ending {
            return Ok(());
        }
        if self.interval_start == 0 {
            self.bootstrap()?;
        }
        let reload = self.env.flags.reload_requested();
        while reload || pkt.time.sec >= self.next_boundary {
            self.close_interval()?;
            self.interval_start = self.next_boundary;
            self.next_boundary += self.env.interval_len;
            if reload {
                self.ending = true;
                let mut ended = self.env.drain.ended.lock();
                *ended += 1;
                info!(worker = self.idx, ended = *ended, "worker drained for reload");
                if *ended == self.env.drain.total {
                    self.env.flags.request_halt();
                }
                return Ok(());
            }
        }
        if self.interim_path.is_none() {
            let uri = self.env.namer.interim(self.interval_start, self.idx)?;
            self.writer
                .open(strip_scheme(&uri).to_owned(), self.env.capture.linktype())?;
            self.interim_path = Some(uri);
        }
        let pkt = if self.env.strip_vlan { strip_vlan(pkt) } else { pkt };
        self.writer.append(pkt)
    }

    /// Establishes the common starting interval from the globally-first
    /// packet, so every worker acknowledges the same first interval even if
    /// its own first packet arrives after a boundary.
    fn bootstrap(&mut self) -> Result<(), Error> {
        let first = self
            .env
            .capture
            .first_packet_time()
            .ok_or_else(|| err!(Internal, "packet delivered before first-packet time was set"))?;
        self.interval_start = first.interval_start(self.env.interval_len);
        self.next_boundary = self.interval_start + self.env.interval_len;
        Ok(())
    }

    /// Reports the interval currently being written as finished. The interim
    /// writer detaches the descriptor (if a file is open) and forwards the
    /// record to the merger in order.
    fn close_interval(&mut self) -> Result<(), Error> {
        let record = coord::IntervalDone {
            worker: self.idx,
            timestamp: self.interval_start,
            src_fd: coord::NO_FD,
            stats: self.env.stats_enabled.then(|| self.stream.stats()),
        };
        self.interim_path = None;
        self.writer.rotate(record, self.env.done_tx.clone())
    }

    fn tick(&mut self) {
        let stats = self.stream.stats();
        if stats.missing >= 0 && self.last_seen_missing >= 0 && stats.missing > self.last_seen_missing
        {
            warn!(
                worker = self.idx,
                missing = stats.missing - self.last_seen_missing,
                "capture dropped packets since last tick"
            );
        }
        if stats.accepted >= 0 && self.last_seen_accepted >= 0 {
            tracing::trace!(
                worker = self.idx,
                accepted = stats.accepted - self.last_seen_accepted,
                "tick"
            );
        }
        self.last_seen_missing = stats.missing;
        self.last_seen_accepted = stats.accepted;
    }
}

fn write_pid_file(path: &std::path::Path) -> Result<(), Error> {
    let mut f = std::fs::File::create(path)
        .map_err(|e| err!(Unknown, "unable to create pid file {}: {e}", path.display()))?;
    writeln!(f, "{}", std::process::id())?;
    Ok(())
}

/// Body of the capture child process. Returns once capture has halted and
/// all threads are joined.
pub fn run(config: &ConfigFile, flags: Arc<Flags>) -> Result<(), Error> {
    let clocks = base::clock::RealClocks {};
    write_pid_file(&config.pidfile)?;

    // Keep the trace codec on the caller's thread: uncompressed output gains
    // nothing from an I/O worker pool.
    std::env::set_var("LIBTRACEIO", "nothreads");

    let namer = Arc::new(FileNamer::from_config(config)?);
    let source = source::from_uri(&config.input)?;
    let (capture, streams) = source.open(config.threads)?;
    info!(input = %config.input, threads = config.threads, "capture started");

    let (done_tx, done_rx) = coord::channel();
    let env = Environment {
        flags: flags.clone(),
        drain: WorkerDrain::new(config.threads),
        capture: capture.clone(),
        namer: namer.clone(),
        done_tx: done_tx.clone(),
        interval_len: config.interval_secs,
        stats_enabled: config.stats,
        strip_vlan: config.strip_vlan,
    };

    // Block signals while spawning so they keep landing on this thread only.
    let old_mask = signals::block_all()?;
    let merger = Merger::new(
        config.threads,
        namer,
        config.stats,
        clocks,
        done_rx,
    );
    let merger_join = std::thread::Builder::new()
        .name("merger".to_owned())
        .spawn(move || merger.run())
        .map_err(|e| err!(Internal, "unable to spawn merger: {e}"))?;
    let mut workers = Vec::with_capacity(config.threads);
    for (idx, stream) in streams.into_iter().enumerate() {
        let mut worker = Worker::new(&env, idx, stream)?;
        workers.push(
            std::thread::Builder::new()
                .name(format!("capture-{idx}"))
                .spawn(move || worker.run())
                .map_err(|e| err!(Internal, "unable to spawn worker {idx}: {e}"))?,
        );
    }
    signals::restore_mask(&old_mask)?;

    while !flags.halted() && !workers.iter().all(|w| w.is_finished()) {
        clocks.sleep(std::time::Duration::from_millis(100));
    }

    capture.stop();
    for w in workers {
        if w.join().is_err() {
            error!("worker thread panicked");
        }
    }
    if done_tx.send(coord::Record::Stop).is_err() {
        warn!("merger exited before stop record");
    }
    drop(done_tx);
    if merger_join.join().is_err() {
        error!("merger thread panicked");
    }
    if let Err(e) = std::fs::remove_file(&config.pidfile) {
        warn!(err = %e, "unable to remove pid file");
    }
    info!("capture stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::Record;
    use crate::source::testutil::{ScriptedCapture, ScriptedStream};
    use crate::source::CaptureStats;
    use trace::PacketTime;

    fn namer(dir: &std::path::Path) -> Arc<FileNamer> {
        let config: ConfigFile = toml::from_str(&format!(
            r#"
            input = "pcapfile:unused"
            template = "{}/%s.%f"
            "#,
            dir.display()
        ))
        .unwrap();
        Arc::new(FileNamer::from_config(&config).unwrap())
    }

    fn pkt(sec: u32, usec: u32) -> SourceEvent {
        SourceEvent::Packet(Packet::new(PacketTime::new(sec, usec), vec![0u8; 60].into()))
    }

    fn env(
        dir: &std::path::Path,
        n: usize,
        first: PacketTime,
        stats_enabled: bool,
    ) -> (Environment, coord::Receiver) {
        let (done_tx, done_rx) = coord::channel();
        (
            Environment {
                flags: Flags::new(),
                drain: WorkerDrain::new(n),
                capture: ScriptedCapture::new(Some(first)),
                namer: namer(dir),
                done_tx,
                interval_len: 60,
                stats_enabled,
                strip_vlan: false,
            },
            done_rx,
        )
    }

    fn recv_done(rx: &coord::Receiver) -> coord::IntervalDone {
        match rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap() {
            Record::IntervalDone(d) => d,
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn boundary_crossings_emit_interval_done_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (env, rx) = env(dir.path(), 1, PacketTime::new(1_700_000_005, 0), false);
        let events = vec![
            pkt(1_700_000_005, 0),
            pkt(1_700_000_059, 999_999),
            pkt(1_700_000_060, 0),   // crosses into the second interval
            pkt(1_700_000_185, 0),   // skips one empty interval entirely
        ];
        let mut w = Worker::new(&env, 0, Box::new(ScriptedStream::new(events))).unwrap();
        w.run();
        drop(w);

        let d0 = recv_done(&rx);
        assert_eq!(d0.timestamp, 1_699_999_980);
        assert!(d0.src_fd >= 0);
        nix::unistd::close(d0.src_fd).unwrap();

        let d1 = recv_done(&rx);
        assert_eq!(d1.timestamp, 1_700_000_040);
        assert!(d1.src_fd >= 0);
        nix::unistd::close(d1.src_fd).unwrap();

        let d2 = recv_done(&rx);
        assert_eq!(d2.timestamp, 1_700_000_100);
        assert_eq!(d2.src_fd, coord::NO_FD);
    }

    #[test]
    fn bootstrap_uses_globally_first_packet() {
        // This worker's own first packet is already past the first boundary;
        // it must still acknowledge the starting interval (with no file).
        let dir = tempfile::tempdir().unwrap();
        let (env, rx) = env(dir.path(), 2, PacketTime::new(1_700_000_000, 0), false);
        let events = vec![pkt(1_700_000_070, 0), pkt(1_700_000_130, 0)];
        let mut w = Worker::new(&env, 1, Box::new(ScriptedStream::new(events))).unwrap();
        w.run();
        drop(w);

        let d0 = recv_done(&rx);
        assert_eq!(d0.timestamp, 1_699_999_980);
        assert_eq!(d0.src_fd, coord::NO_FD);
        let d1 = recv_done(&rx);
        assert_eq!(d1.timestamp, 1_700_000_040);
        assert!(d1.src_fd >= 0);
        nix::unistd::close(d1.src_fd).unwrap();
    }

    #[test]
    fn interim_files_are_written_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (env, rx) = env(dir.path(), 1, PacketTime::new(1_700_000_000, 0), false);
        let events = vec![pkt(1_700_000_001, 0), pkt(1_700_000_002, 0), pkt(1_700_000_061, 0)];
        let mut w = Worker::new(&env, 0, Box::new(ScriptedStream::new(events))).unwrap();
        w.run();
        drop(w);
        let d0 = recv_done(&rx);
        nix::unistd::close(d0.src_fd).unwrap();

        let interim = env.namer.interim(1_699_999_980, 0).unwrap();
        let mut r =
            trace::pcap::Reader::new(std::fs::File::open(strip_scheme(&interim)).unwrap()).unwrap();
        let mut times = Vec::new();
        while let Some(p) = r.next().unwrap() {
            times.push(p.time.sec);
        }
        assert_eq!(times, vec![1_700_000_001, 1_700_000_002]);
    }

    #[test]
    fn reload_drains_each_worker_once() {
        let dir = tempfile::tempdir().unwrap();
        let (env, rx) = env(dir.path(), 2, PacketTime::new(1_700_000_000, 0), true);
        env.flags.note_hup_at(100);
        assert!(env.flags.reload_requested());

        let mk = |stats: CaptureStats, events: Vec<SourceEvent>| {
            let mut s = ScriptedStream::new(events);
            s.stats = stats;
            s
        };
        let stats = CaptureStats {
            accepted: 7,
            filtered: 0,
            received: 7,
            dropped: 0,
            missing: -1,
        };

        // Worker 0 sees the reload on its next packet: partial interval is
        // reported, further packets are dropped, and it does not halt alone.
        let mut w0 = Worker::new(
            &env,
            0,
            Box::new(mk(stats, vec![pkt(1_700_000_005, 0), pkt(1_700_000_006, 0)])),
        )
        .unwrap();
        w0.run();
        assert!(w0.ending);
        assert!(!env.flags.halted());
        drop(w0);

        let d0 = recv_done(&rx);
        assert_eq!(d0.timestamp, 1_699_999_980);
        assert_eq!(d0.src_fd, coord::NO_FD); // dropped before any append
        assert_eq!(d0.stats.unwrap().accepted, 7);

        // The last worker to drain requests the global halt.
        let mut w1 = Worker::new(&env, 1, Box::new(mk(stats, vec![pkt(1_700_000_005, 500)])))
            .unwrap();
        w1.run();
        assert!(env.flags.halted());
        drop(w1);
        let d1 = recv_done(&rx);
        assert_eq!(d1.worker, 1);
        assert_eq!(d1.timestamp, 1_699_999_980);
    }

    /// Full offline pipeline: pcap replay through two workers and the
    /// merger. Every complete interval comes out merged, chronological, and
    /// marked done; the interval cut off by end of input stays interim.
    #[test]
    fn end_to_end_offline_replay() {
        base::tracing_setup::install_for_tests();
        let dir = tempfile::tempdir().unwrap();

        // Two payloads pinned to different workers via the dispatch hash,
        // so both workers see traffic every second.
        let payload_for = |worker: usize| {
            (0u8..=255)
                .map(|b| vec![b; 40])
                .find(|p| crate::source::flow_hash(p) % 2 == worker as u64)
                .unwrap()
        };
        let payloads = [payload_for(0), payload_for(1)];

        let base_sec: u32 = 1_700_000_000;
        let t0 = base_sec - base_sec % 60; // 1699999980
        let t1 = t0 + 60;
        let input = dir.path().join("input.pcap");
        {
            let f = std::fs::File::create(&input).unwrap();
            let mut w = trace::pcap::Writer::new(
                std::io::BufWriter::new(f),
                trace::pcap::LINKTYPE_ETHERNET,
            )
            .unwrap();
            for i in 0..150u32 {
                for p in &payloads {
                    w.append(&Packet::new(
                        PacketTime::new(base_sec + i, 500),
                        p.clone().into(),
                    ))
                    .unwrap();
                }
            }
            w.into_inner().into_inner().unwrap();
        }

        let config: ConfigFile = toml::from_str(&format!(
            r#"
            input = "pcapfile:{input}"
            threads = 2
            interval_secs = 60
            template = "{dir}/%N-%s.%f"
            monitor = "scope"
            pidfile = "{dir}/wdcap.pid"
            stats = true
            "#,
            input = input.display(),
            dir = dir.path().display(),
        ))
        .unwrap();

        let flags = Flags::new();
        run(&config, flags).unwrap();

        let namer = FileNamer::from_config(&config).unwrap();
        for (t, expect) in [(t0, 80), (t1, 120)] {
            let out = namer.output(t).unwrap();
            let mut r =
                trace::pcap::Reader::new(std::fs::File::open(strip_scheme(&out)).unwrap()).unwrap();
            let mut count = 0;
            let mut last = PacketTime::default();
            while let Some(p) = r.next().unwrap() {
                assert!(p.time >= last, "merged output out of order");
                last = p.time;
                count += 1;
            }
            assert_eq!(count, expect);
            assert!(std::path::Path::new(&namer.done(t).unwrap()).exists());
            assert!(std::path::Path::new(&namer.stats(t).unwrap()).exists());
            for worker in 0..2 {
                let interim = namer.interim(t, worker).unwrap();
                assert!(!std::path::Path::new(strip_scheme(&interim)).exists());
            }
        }
        // The final interval never saw an IntervalDone: no merged output,
        // no marker, interim files left behind.
        let t2 = t1 + 60;
        assert!(!std::path::Path::new(strip_scheme(&namer.output(t2).unwrap())).exists());
        assert!(!std::path::Path::new(&namer.done(t2).unwrap()).exists());
        assert!(std::path::Path::new(strip_scheme(&namer.interim(t2, 0).unwrap())).exists());
        // The pid file is written on startup and removed on shutdown.
        assert!(!config.pidfile.exists());
    }

    #[test]
    fn halt_stops_worker_without_final_record() {
        let dir = tempfile::tempdir().unwrap();
        let (env, rx) = env(dir.path(), 1, PacketTime::new(1_700_000_000, 0), false);
        let mut w = Worker::new(
            &env,
            0,
            Box::new(ScriptedStream::new(vec![pkt(1_700_000_001, 0)])),
        )
        .unwrap();
        w.run(); // Eof after one packet; interval never closes
        drop(w);
        drop(env);
        // No IntervalDone was emitted; the interim file stays for the
        // operator to collect.
        assert!(rx.recv().is_err());
    }
}
