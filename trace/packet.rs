// This file is part of wdcap, a lossless rotating packet-capture daemon.
// Copyright (C) 2025 The wdcap Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The packet model shared by capture, interim files, and merge.

use std::fmt;

use bytes::{Bytes, BytesMut};

const ETHERTYPE_VLAN: u16 = 0x8100; // 802.1Q
const ETHERTYPE_QINQ: u16 = 0x88a8; // 802.1ad

/// A capture timestamp: seconds since the unix epoch plus microseconds.
///
/// The derived ordering is chronological (seconds first, then microseconds);
/// `usec` is always in `[0, 1_000_000)`.
#[derive(Copy, Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct PacketTime {
    pub sec: u32,
    pub usec: u32,
}

impl PacketTime {
    pub fn new(sec: u32, usec: u32) -> Self {
        debug_assert!(usec < 1_000_000);
        PacketTime { sec, usec }
    }

    /// Start of the capture interval containing this time: the largest
    /// multiple of `interval_len` not after it.
    pub fn interval_start(self, interval_len: u32) -> u32 {
        self.sec - (self.sec % interval_len)
    }

    pub fn as_nanos(self) -> u64 {
        u64::from(self.sec) * 1_000_000_000 + u64::from(self.usec) * 1_000
    }
}

impl fmt::Display for PacketTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

/// One captured packet.
///
/// The capture source owns its receive buffers only until its callback
/// returns, so the single hot-path copy into `data` happens at capture time;
/// from there the `Bytes` travels through queues without further copies.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub time: PacketTime,
    pub data: Bytes,

    /// Original length on the wire; equals `data.len()` unless the capture
    /// snapped the packet.
    pub wire_len: u32,
}

impl Packet {
    pub fn new(time: PacketTime, data: Bytes) -> Self {
        let wire_len = data.len() as u32;
        Packet {
            time,
            data,
            wire_len,
        }
    }
}

/// Removes 802.1Q/802.1ad tags from an Ethernet frame, stacked tags
/// included. Frames without a tag (or too short to carry one) pass through
/// unchanged.
pub fn strip_vlan(pkt: Packet) -> Packet {
    let data = &pkt.data;
    if data.len() < 18 {
        return pkt;
    }
    let mut tag_end = 12;
    while data.len() >= tag_end + 6 {
        match u16::from_be_bytes([data[tag_end], data[tag_end + 1]]) {
            ETHERTYPE_VLAN | ETHERTYPE_QINQ => tag_end += 4,
            _ => break,
        }
    }
    if tag_end == 12 {
        return pkt;
    }
    let stripped = (tag_end - 12) as u32;
    let mut out = BytesMut::with_capacity(data.len() - stripped as usize);
    out.extend_from_slice(&data[..12]);
    out.extend_from_slice(&data[tag_end..]);
    Packet {
        time: pkt.time,
        data: out.freeze(),
        wire_len: pkt.wire_len.saturating_sub(stripped),
    }
}
