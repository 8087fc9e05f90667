// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Header decoding.

use heapless::Vec;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::FromBytes;

use crate::wire::{self, align4};
use crate::{
    MalformedHeader, PersistentAcl, TbfFlags, TbfHeader, Tlv, TlvType,
    BASE_HEADER_LEN, CHECKSUM_WORD, MAX_ACL_IDS, MAX_TLVS, OUT_OF_TREE_TYPE_BIT,
    SUPPORTED_VERSION,
};

/// The length fields of a base header, read before anything else about the
/// header is trusted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BaseLengths {
    pub version: u16,
    pub header_size: u16,
    pub total_size: u32,
}

/// Reads just the lengths out of the base header at the front of `bytes`.
///
/// Returns `None` if there is no recognizable base header here: the buffer
/// is too short, or the version is not one we speak (erased flash reads as
/// version `0xFFFF`, zeroed flash as `0`). The lengths are *not* validated;
/// this exists so that a loader can step over an image whose full header
/// turns out to be malformed.
pub fn peek_lengths(bytes: &[u8]) -> Option<BaseLengths> {
    let (base, _) = wire::BaseHeader::read_from_prefix(bytes).ok()?;
    let version = base.version.get();
    if version != SUPPORTED_VERSION {
        return None;
    }
    Some(BaseLengths {
        version,
        header_size: base.header_size.get(),
        total_size: base.total_size.get(),
    })
}

/// Decodes the TBF header at the front of `bytes`.
///
/// `bytes` should start at an image boundary and may extend past the header;
/// only the first `header_size` bytes are examined.
///
/// Returns `Ok(None)` when the base header declares a total size of zero,
/// which marks an empty slot rather than an error.
pub fn parse(bytes: &[u8]) -> Result<Option<TbfHeader<'_>>, MalformedHeader> {
    let (base, _) = wire::BaseHeader::read_from_prefix(bytes)
        .map_err(|_| MalformedHeader::Truncated)?;

    let version = base.version.get();
    if version != SUPPORTED_VERSION {
        return Err(MalformedHeader::UnsupportedVersion(version));
    }
    let lengths = BaseLengths {
        version,
        header_size: base.header_size.get(),
        total_size: base.total_size.get(),
    };
    if lengths.total_size == 0 {
        return Ok(None);
    }

    let header_size = usize::from(lengths.header_size);
    if header_size < BASE_HEADER_LEN
        || header_size % 4 != 0
        || lengths.total_size % 4 != 0
        || u32::from(lengths.header_size) > lengths.total_size
    {
        return Err(MalformedHeader::BadLength);
    }
    let header = bytes
        .get(..header_size)
        .ok_or(MalformedHeader::Truncated)?;

    // Nothing past the base header is looked at until the checksum is known
    // to be good.
    let stored = base.checksum.get();
    let computed = checksum_words(header);
    if stored != computed {
        return Err(MalformedHeader::ChecksumMismatch { stored, computed });
    }

    let tlvs = parse_tlvs(&header[BASE_HEADER_LEN..])?;

    Ok(Some(TbfHeader::from_parts(
        lengths,
        TbfFlags::from_bits_retain(base.flags.get()),
        stored,
        tlvs,
    )))
}

/// XORs every 32-bit little-endian word of `header` except the checksum
/// word itself.
///
/// `header` must be a whole number of words; a trailing partial word is
/// ignored.
pub(crate) fn checksum_words(header: &[u8]) -> u32 {
    header
        .chunks_exact(4)
        .enumerate()
        .filter(|(i, _)| *i != CHECKSUM_WORD)
        .fold(0, |acc, (_, w)| {
            acc ^ u32::from_le_bytes([w[0], w[1], w[2], w[3]])
        })
}

fn parse_tlvs(mut rest: &[u8]) -> Result<Vec<Tlv<'_>, MAX_TLVS>, MalformedHeader> {
    let mut tlvs = Vec::new();
    while !rest.is_empty() {
        let (th, after) = wire::TlvHeader::read_from_prefix(rest)
            .map_err(|_| MalformedHeader::Truncated)?;
        let tipe = th.tipe.get();
        let length = usize::from(th.length.get());

        // The record, including its padding, has to end inside the header.
        let padded = align4(length);
        if padded > after.len() {
            return Err(MalformedHeader::BadTlvEntry(tipe));
        }
        let (body, next) = after.split_at(padded);

        if let Some(tlv) = decode_tlv(tipe, &body[..length])? {
            tlvs.push(tlv)
                .map_err(|_| MalformedHeader::TooManyEntries(tipe))?;
        }
        rest = next;
    }
    Ok(tlvs)
}

/// Decodes one record. Types we don't know produce `None`.
fn decode_tlv(tipe: u16, data: &[u8]) -> Result<Option<Tlv<'_>>, MalformedHeader> {
    if tipe & OUT_OF_TREE_TYPE_BIT != 0 {
        return Ok(None);
    }
    let Ok(kind) = TlvType::try_from(tipe) else {
        return Ok(None);
    };
    let bad = MalformedHeader::BadTlvEntry(tipe);
    let too_many = MalformedHeader::TooManyEntries(tipe);

    let tlv = match kind {
        TlvType::Main => {
            let m = wire::Main::read_from_bytes(data).map_err(|_| bad)?;
            Tlv::Main(m.into())
        }
        TlvType::WriteableFlashRegions => {
            if data.len() % 8 != 0 {
                return Err(bad);
            }
            let mut regions = Vec::new();
            for chunk in data.chunks_exact(8) {
                let r =
                    wire::FlashRegion::read_from_bytes(chunk).map_err(|_| bad)?;
                regions.push(r.into()).map_err(|_| too_many)?;
            }
            Tlv::WriteableFlashRegions(regions)
        }
        TlvType::PackageName => Tlv::PackageName(
            core::str::from_utf8(data)
                .map_err(|_| MalformedHeader::BadPackageName)?,
        ),
        TlvType::FixedAddresses => {
            let f = wire::Fixed::read_from_bytes(data).map_err(|_| bad)?;
            Tlv::FixedAddresses(f.into())
        }
        TlvType::Permissions => {
            let (count, entries) =
                U16::read_from_prefix(data).map_err(|_| bad)?;
            let count = usize::from(count.get());
            if entries.len() != count * core::mem::size_of::<wire::Permission>()
            {
                return Err(bad);
            }
            let mut perms = Vec::new();
            for chunk in entries.chunks_exact(16) {
                let p =
                    wire::Permission::read_from_bytes(chunk).map_err(|_| bad)?;
                perms.push(p.into()).map_err(|_| too_many)?;
            }
            Tlv::Permissions(perms)
        }
        TlvType::PersistentAcl => Tlv::PersistentAcl(parse_acl(tipe, data)?),
    };
    Ok(Some(tlv))
}

fn parse_acl(tipe: u16, data: &[u8]) -> Result<PersistentAcl, MalformedHeader> {
    let bad = MalformedHeader::BadTlvEntry(tipe);
    let (write_id, rest) = U32::read_from_prefix(data).map_err(|_| bad)?;
    let (read_ids, rest) = parse_id_list(tipe, rest)?;
    let (access_ids, rest) = parse_id_list(tipe, rest)?;
    if !rest.is_empty() {
        return Err(bad);
    }
    Ok(PersistentAcl {
        write_id: write_id.get(),
        read_ids,
        access_ids,
    })
}

/// Reads a `u16` count followed by that many `u32` identifiers.
fn parse_id_list(
    tipe: u16,
    data: &[u8],
) -> Result<(Vec<u32, MAX_ACL_IDS>, &[u8]), MalformedHeader> {
    let bad = MalformedHeader::BadTlvEntry(tipe);
    let (count, mut rest) = U16::read_from_prefix(data).map_err(|_| bad)?;
    let mut ids = Vec::new();
    for _ in 0..count.get() {
        let (id, next) = U32::read_from_prefix(rest).map_err(|_| bad)?;
        ids.push(id.get())
            .map_err(|_| MalformedHeader::TooManyEntries(tipe))?;
        rest = next;
    }
    Ok((ids, rest))
}
