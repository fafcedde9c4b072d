// This file is part of wdcap, a lossless rotating packet-capture daemon.
// Copyright (C) 2025 The wdcap Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Asynchronous interim-file writer.
//!
//! Each worker owns one [`InterimWriter`]: a long-lived I/O thread fed by a
//! queue. The packet path only enqueues; every filesystem operation (open,
//! write, flush) happens on the I/O thread. Nothing on this path ever calls
//! `close()`: at rotation the I/O thread finishes the queued appends, pulls
//! the file descriptor out of the buffered writer, stamps it into the
//! worker's prepared `IntervalDone` record, and forwards the record to the
//! merger, which owns the descriptor from then on.
//!
//! Routing the record through the I/O thread gives two guarantees at once:
//! the merger can't see an interval as complete while its bytes are still in
//! flight, and one worker's records (including empty-interval ones with no
//! descriptor) reach the merger in rotation order.

use std::fs::File;
use std::io::BufWriter;
use std::os::unix::io::IntoRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use base::{err, Error, ResultExt};
use tracing::{error, warn};
use trace::Packet;

use crate::coord;
use crate::signals::Flags;

enum Command {
    Open { path: String, linktype: u32 },
    Append(Packet),
    Rotate {
        record: coord::IntervalDone,
        done_tx: coord::Sender,
    },
}

/// Worker-side handle to the interim I/O thread.
pub struct InterimWriter {
    tx: Option<mpsc::Sender<Command>>,
    join: Option<JoinHandle<()>>,
    failed: Arc<AtomicBool>,
}

impl InterimWriter {
    pub fn spawn(worker: usize, flags: Arc<Flags>) -> Result<Self, Error> {
        let (tx, rx) = mpsc::channel();
        let failed = Arc::new(AtomicBool::new(false));
        let io_failed = failed.clone();
        let join = std::thread::Builder::new()
            .name(format!("interim-{worker}"))
            .spawn(move || run_io(rx, worker, flags, io_failed))
            .err_kind(base::ErrorKind::Internal)?;
        Ok(InterimWriter {
            tx: Some(tx),
            join: Some(join),
            failed,
        })
    }

    /// Opens a new interim file at `path` (a bare filesystem path).
    pub fn open(&self, path: String, linktype: u32) -> Result<(), Error> {
        self.send(Command::Open { path, linktype })
    }

    /// Enqueues one packet for append. Never blocks on I/O.
    pub fn append(&self, pkt: Packet) -> Result<(), Error> {
        self.send(Command::Append(pkt))
    }

    /// Enqueues a rotation: finish the current file (if any), hand its
    /// descriptor off inside `record`, and send the record to the merger.
    pub fn rotate(&self, record: coord::IntervalDone, done_tx: coord::Sender) -> Result<(), Error> {
        self.send(Command::Rotate { record, done_tx })
    }

    fn send(&self, cmd: Command) -> Result<(), Error> {
        if self.failed.load(Ordering::Relaxed) {
            return Err(err!(DataLoss, "interim writer failed; see earlier log"));
        }
        self.tx
            .as_ref()
            .and_then(|tx| tx.send(cmd).ok())
            .ok_or_else(|| err!(Internal, "interim writer thread is gone"))
    }
}

impl Drop for InterimWriter {
    fn drop(&mut self) {
        // Closing the queue lets the I/O thread drain, flush, and exit; the
        // join guarantees no interim descriptor outlives the worker.
        self.tx.take();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("interim writer thread panicked");
            }
        }
    }
}

fn run_io(rx: mpsc::Receiver<Command>, worker: usize, flags: Arc<Flags>, failed: Arc<AtomicBool>) {
    let mut out: Option<trace::pcap::Writer<BufWriter<File>>> = None;
    let fail = |e: Error, what: &str, failed: &AtomicBool| {
        error!(worker, err = %e.chain(), "{what}");
        failed.store(true, Ordering::Relaxed);
        flags.request_halt();
    };
    for cmd in rx.iter() {
        match cmd {
            Command::Open { path, linktype } => match open_writer(&path, linktype) {
                Ok(w) => out = Some(w),
                Err(e) => fail(e, "unable to open interim file", &failed),
            },
            Command::Append(pkt) => {
                if let Some(w) = &mut out {
                    if let Err(e) = w.append(&pkt) {
                        out = None; // drop (and close) the broken file
                        fail(e, "interim append failed", &failed);
                    }
                }
            }
            Command::Rotate { mut record, done_tx } => {
                if let Some(w) = out.take() {
                    match detach(w) {
                        Ok(fd) => record.src_fd = fd,
                        Err(e) => fail(e, "interim flush failed", &failed),
                    }
                }
                if done_tx.send(coord::Record::IntervalDone(record)).is_err() {
                    warn!(worker, "merger is gone; halting");
                    flags.request_halt();
                }
            }
        }
    }
    if let Some(w) = out.take() {
        // Shutdown with an interval still open: flush and close. No
        // IntervalDone was sent for it, so the merger will never merge it;
        // the interim file stays on disk for the operator.
        if let Err(e) = w.into_inner().into_inner() {
            error!(worker, err = %e.error(), "final interim flush failed");
        }
    }
}

fn open_writer(path: &str, linktype: u32) -> Result<trace::pcap::Writer<BufWriter<File>>, Error> {
    let f = File::create(path).map_err(|e| err!(Unknown, "unable to create {path}: {e}"))?;
    trace::pcap::Writer::new(BufWriter::with_capacity(1 << 16, f), linktype)
}

/// Completes all writes, then surrenders the descriptor without closing it.
fn detach(w: trace::pcap::Writer<BufWriter<File>>) -> Result<std::os::unix::io::RawFd, Error> {
    let f = w
        .into_inner()
        .into_inner()
        .map_err(|e| err!(DataLoss, "interim flush failed: {}", e.error()))?;
    Ok(f.into_raw_fd())
}
