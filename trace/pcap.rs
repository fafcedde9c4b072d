// This file is part of wdcap, a lossless rotating packet-capture daemon.
// Copyright (C) 2025 The wdcap Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Streaming classic-pcap writer and reader.
//!
//! The on-disk layout is the classic tcpdump format: a 24-byte file header
//! (microsecond magic `0xa1b2c3d4`, version 2.4) followed by 16-byte
//! per-packet record headers. wdcap always writes little-endian and reads
//! back only files it wrote, so byte-swapped captures are rejected rather
//! than translated.

use std::io::{Read, Write};

use base::{bail, err, Error, ResultExt};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use crate::{Packet, PacketTime};

const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const MAGIC_MICROS_SWAPPED: u32 = 0xd4c3_b2a1;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;

pub const LINKTYPE_ETHERNET: u32 = 1;

/// Largest record body accepted on read. Matches the traditional tcpdump
/// `MAXIMUM_SNAPLEN`; anything bigger means a corrupt record header.
const MAX_CAPLEN: u32 = 262_144;

pub const SNAPLEN: u32 = 65_535;

/// Streaming pcap writer. The file header goes out at construction; each
/// [`Writer::append`] emits one record.
pub struct Writer<W: Write> {
    inner: W,
}

impl<W: Write> Writer<W> {
    pub fn new(mut inner: W, linktype: u32) -> Result<Self, Error> {
        inner.write_u32::<LittleEndian>(MAGIC_MICROS)?;
        inner.write_u16::<LittleEndian>(VERSION_MAJOR)?;
        inner.write_u16::<LittleEndian>(VERSION_MINOR)?;
        inner.write_i32::<LittleEndian>(0)?; // thiszone
        inner.write_u32::<LittleEndian>(0)?; // sigfigs
        inner.write_u32::<LittleEndian>(SNAPLEN)?;
        inner.write_u32::<LittleEndian>(linktype)?;
        Ok(Writer { inner })
    }

    pub fn append(&mut self, pkt: &Packet) -> Result<(), Error> {
        self.inner.write_u32::<LittleEndian>(pkt.time.sec)?;
        self.inner.write_u32::<LittleEndian>(pkt.time.usec)?;
        self.inner.write_u32::<LittleEndian>(pkt.data.len() as u32)?;
        self.inner.write_u32::<LittleEndian>(pkt.wire_len)?;
        self.inner.write_all(&pkt.data)?;
        Ok(())
    }

    /// Hands back the underlying writer. The caller is responsible for any
    /// remaining flush.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Streaming pcap reader yielding packets in file order.
pub struct Reader<R: Read> {
    inner: R,
    linktype: u32,
}

impl<R: Read> Reader<R> {
    pub fn new(mut inner: R) -> Result<Self, Error> {
        let magic = inner
            .read_u32::<LittleEndian>()
            .err_kind(base::ErrorKind::DataLoss)?;
        match magic {
            MAGIC_MICROS => {}
            MAGIC_MICROS_SWAPPED => {
                bail!(Unimplemented, "byte-swapped pcap is not supported")
            }
            _ => bail!(InvalidArgument, "not a pcap file (magic {magic:#010x})"),
        }
        let major = inner.read_u16::<LittleEndian>()?;
        let minor = inner.read_u16::<LittleEndian>()?;
        if major != VERSION_MAJOR {
            bail!(Unimplemented, "unsupported pcap version {major}.{minor}");
        }
        let _thiszone = inner.read_i32::<LittleEndian>()?;
        let _sigfigs = inner.read_u32::<LittleEndian>()?;
        let _snaplen = inner.read_u32::<LittleEndian>()?;
        let linktype = inner.read_u32::<LittleEndian>()?;
        Ok(Reader { inner, linktype })
    }

    pub fn linktype(&self) -> u32 {
        self.linktype
    }

    /// Reads the next packet. `Ok(None)` at a clean end of file; an error if
    /// the file ends mid-record.
    pub fn next(&mut self) -> Result<Option<Packet>, Error> {
        let mut hdr = [0u8; 16];
        let mut filled = 0;
        while filled < hdr.len() {
            let n = self.inner.read(&mut hdr[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                bail!(DataLoss, "truncated record header");
            }
            filled += n;
        }
        let mut hdr = &hdr[..];
        let sec = hdr.read_u32::<LittleEndian>()?;
        let usec = hdr.read_u32::<LittleEndian>()?;
        let caplen = hdr.read_u32::<LittleEndian>()?;
        let wire_len = hdr.read_u32::<LittleEndian>()?;
        if usec >= 1_000_000 {
            bail!(DataLoss, "corrupt record timestamp ({sec}.{usec})");
        }
        if caplen > MAX_CAPLEN {
            bail!(DataLoss, "corrupt record length ({caplen})");
        }
        let mut data = vec![0u8; caplen as usize];
        self.inner
            .read_exact(&mut data)
            .map_err(|e| err!(DataLoss, "truncated record body: {e}"))?;
        Ok(Some(Packet {
            time: PacketTime::new(sec, usec),
            data: Bytes::from(data),
            wire_len,
        }))
    }
}
