// This file is part of wdcap, a lossless rotating packet-capture daemon.
// Copyright (C) 2025 The wdcap Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Trace-file codec: the packet model and a streaming classic-pcap
//! writer/reader.
//!
//! Output is always produced on the caller's thread; this codec has no
//! internal I/O worker pool. That is the behavior selected by
//! `LIBTRACEIO=nothreads`, the only mode wdcap needs since it writes
//! uncompressed traces, and the daemon exports that variable on startup so
//! the convention is visible to operators and downstream tooling.

mod packet;
pub mod pcap;

pub use packet::{strip_vlan, Packet, PacketTime};
