// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Header encoding.
//!
//! The encoder walks the header once per use, emitting bytes into a
//! [`Sink`]. The same walk computes the header length, the checksum, and the
//! final bytes, so the three can't disagree.

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::IntoBytes;

use crate::wire::{self, align4};
use crate::{
    MalformedHeader, TbfHeader, Tlv, BASE_HEADER_LEN, CHECKSUM_WORD,
    TLV_HEADER_LEN,
};

/// Reasons a header can't be written out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteError {
    /// The destination needs at least `needed` bytes.
    BufferTooSmall { needed: usize },
}

impl core::fmt::Display for WriteError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BufferTooSmall { needed } => {
                write!(f, "buffer too small, need {needed} bytes")
            }
        }
    }
}

trait Sink {
    fn put(&mut self, bytes: &[u8]) -> Result<(), WriteError>;
}

struct SliceSink<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl Sink for SliceSink<'_> {
    fn put(&mut self, bytes: &[u8]) -> Result<(), WriteError> {
        let end = self.pos + bytes.len();
        let dst = self
            .buf
            .get_mut(self.pos..end)
            .ok_or(WriteError::BufferTooSmall { needed: end })?;
        dst.copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }
}

/// Folds emitted bytes into the header checksum.
#[derive(Default)]
struct ChecksumSink {
    acc: u32,
    word: [u8; 4],
    pos: usize,
}

impl Sink for ChecksumSink {
    fn put(&mut self, bytes: &[u8]) -> Result<(), WriteError> {
        for &b in bytes {
            self.word[self.pos % 4] = b;
            self.pos += 1;
            if self.pos % 4 == 0 && self.pos / 4 - 1 != CHECKSUM_WORD {
                self.acc ^= u32::from_le_bytes(self.word);
            }
        }
        Ok(())
    }
}

/// Unpadded payload length of a record.
fn payload_len(tlv: &Tlv<'_>) -> usize {
    match tlv {
        Tlv::Main(_) => core::mem::size_of::<wire::Main>(),
        Tlv::WriteableFlashRegions(r) => {
            r.len() * core::mem::size_of::<wire::FlashRegion>()
        }
        Tlv::PackageName(n) => n.len(),
        Tlv::FixedAddresses(_) => core::mem::size_of::<wire::Fixed>(),
        Tlv::Permissions(p) => {
            2 + p.len() * core::mem::size_of::<wire::Permission>()
        }
        Tlv::PersistentAcl(a) => {
            4 + 2 + 4 * a.read_ids.len() + 2 + 4 * a.access_ids.len()
        }
    }
}

/// Computes `header_size` for the records of `header`.
pub(crate) fn encoded_len(header: &TbfHeader<'_>) -> Result<u16, MalformedHeader> {
    let mut total = BASE_HEADER_LEN;
    for tlv in header.tlvs() {
        let len = payload_len(tlv);
        if u16::try_from(len).is_err() {
            return Err(MalformedHeader::BadTlvEntry(tlv.tlv_type() as u16));
        }
        total += TLV_HEADER_LEN + align4(len);
    }
    u16::try_from(total).map_err(|_| MalformedHeader::BadLength)
}

/// Computes the checksum `header` should carry.
pub(crate) fn checksum(header: &TbfHeader<'_>) -> u32 {
    let mut sink = ChecksumSink::default();
    // ChecksumSink never fails.
    let _ = encode(header, 0, &mut sink);
    sink.acc
}

pub(crate) fn write_to(
    header: &TbfHeader<'_>,
    buf: &mut [u8],
) -> Result<usize, WriteError> {
    let needed = usize::from(header.header_size());
    if buf.len() < needed {
        return Err(WriteError::BufferTooSmall { needed });
    }
    let mut sink = SliceSink { buf, pos: 0 };
    encode(header, header.checksum(), &mut sink)?;
    Ok(sink.pos)
}

fn encode(
    header: &TbfHeader<'_>,
    checksum: u32,
    sink: &mut impl Sink,
) -> Result<(), WriteError> {
    let base = wire::BaseHeader {
        version: U16::new(header.version()),
        header_size: U16::new(header.header_size()),
        total_size: U32::new(header.total_size()),
        flags: U32::new(header.flags().bits()),
        checksum: U32::new(checksum),
    };
    sink.put(base.as_bytes())?;
    for tlv in header.tlvs() {
        encode_tlv(tlv, sink)?;
    }
    Ok(())
}

fn encode_tlv(tlv: &Tlv<'_>, sink: &mut impl Sink) -> Result<(), WriteError> {
    let len = payload_len(tlv);
    let th = wire::TlvHeader {
        tipe: U16::new(tlv.tlv_type() as u16),
        // encoded_len has already rejected anything longer.
        length: U16::new(len as u16),
    };
    sink.put(th.as_bytes())?;

    match tlv {
        Tlv::Main(m) => sink.put(wire::Main::from(m).as_bytes())?,
        Tlv::WriteableFlashRegions(regions) => {
            for r in regions {
                sink.put(wire::FlashRegion::from(r).as_bytes())?;
            }
        }
        Tlv::PackageName(n) => sink.put(n.as_bytes())?,
        Tlv::FixedAddresses(f) => sink.put(wire::Fixed::from(f).as_bytes())?,
        Tlv::Permissions(perms) => {
            sink.put(U16::new(perms.len() as u16).as_bytes())?;
            for p in perms {
                sink.put(wire::Permission::from(p).as_bytes())?;
            }
        }
        Tlv::PersistentAcl(acl) => {
            sink.put(U32::new(acl.write_id).as_bytes())?;
            for ids in [&acl.read_ids, &acl.access_ids] {
                sink.put(U16::new(ids.len() as u16).as_bytes())?;
                for &id in ids {
                    sink.put(U32::new(id).as_bytes())?;
                }
            }
        }
    }

    let pad = align4(len) - len;
    sink.put(&[0; 3][..pad])
}
