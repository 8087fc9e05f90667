// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tock Binary Format (TBF) headers.
//!
//! A process image in flash starts with a TBF header: a fixed 16-byte base
//! header followed by a chain of type-length-value records, all little-endian
//! and padded to 4-byte boundaries. This crate decodes that header into a
//! [`TbfHeader`] without copying anything out of flash except small fixed
//! fields, and can write one back out for tooling and tests.
//!
//! Parsing is strict about anything that affects where the kernel will put
//! the process, and lenient about record types it doesn't know: those are
//! skipped by their declared length.

#![cfg_attr(not(test), no_std)]

use heapless::Vec;

mod parse;
mod wire;
mod write;

pub use parse::{parse, peek_lengths, BaseLengths};
pub use write::WriteError;

/// The only base header version we accept.
pub const SUPPORTED_VERSION: u16 = 2;
/// Length of the fixed base header, in bytes.
pub const BASE_HEADER_LEN: usize = 16;
/// Length of a TLV record's type-and-length prefix, in bytes.
pub const TLV_HEADER_LEN: usize = 4;
/// Index of the checksum within the header, counted in 32-bit words.
pub const CHECKSUM_WORD: usize = 3;

/// Most TLV records we will retain from a single header.
pub const MAX_TLVS: usize = 16;
/// Most writeable flash regions a single record may describe.
pub const MAX_WRITEABLE_REGIONS: usize = 4;
/// Most driver permission entries a single record may carry.
pub const MAX_PERMISSIONS: usize = 8;
/// Most storage identifiers per list in a persistent ACL record.
pub const MAX_ACL_IDS: usize = 8;

/// Value used in the FixedAddresses record to mean "no constraint".
pub const UNCONSTRAINED_ADDRESS: u32 = 0xFFFF_FFFF;

/// Bit in the TLV type field that marks a record from the out-of-tree
/// namespace. We never decode these.
pub const OUT_OF_TREE_TYPE_BIT: u16 = 0x8000;

bitflags::bitflags! {
    /// Flags word of the base header.
    ///
    /// Unknown bits are preserved so that a header survives a round trip.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct TbfFlags: u32 {
        /// The process should be loaded and started.
        const ENABLED = 1 << 0;
        /// The process should not be erased by tooling without extra
        /// confirmation.
        const STICKY = 1 << 1;
    }
}

/// Record types we know how to decode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum TlvType {
    Main = 1,
    WriteableFlashRegions = 2,
    PackageName = 3,
    FixedAddresses = 5,
    Permissions = 6,
    PersistentAcl = 7,
}

impl core::convert::TryFrom<u16> for TlvType {
    type Error = ();

    fn try_from(x: u16) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::Main),
            2 => Ok(Self::WriteableFlashRegions),
            3 => Ok(Self::PackageName),
            5 => Ok(Self::FixedAddresses),
            6 => Ok(Self::Permissions),
            7 => Ok(Self::PersistentAcl),
            _ => Err(()),
        }
    }
}

/// Contents of the Main record: where the program starts and what it needs.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MainTlv {
    /// Offset of the first instruction, relative to the end of the header.
    pub init_fn_offset: u32,
    /// Bytes after the header that the process may not write, e.g. a
    /// signature block.
    pub protected_size: u32,
    /// RAM the process needs for stack, data, and initial heap.
    pub minimum_ram_size: u32,
}

/// A sub-range of the image that the process is allowed to write.
///
/// `offset` is relative to the start of the image.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct WriteableFlashRegion {
    pub offset: u32,
    pub size: u32,
}

/// Addresses the image was linked for.
///
/// Fields hold the raw on-flash values; use [`TbfHeader::fixed_address_ram`]
/// and [`TbfHeader::fixed_address_flash`] to get the sentinel interpreted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FixedAddresses {
    pub ram: u32,
    pub flash: u32,
}

/// Syscall commands a process may issue to one driver.
///
/// Bit `n` of `allowed_commands` permits command number `offset * 64 + n`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DriverPermission {
    pub driver_number: u32,
    pub offset: u32,
    pub allowed_commands: u64,
}

/// Persistent storage identities of the process.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PersistentAcl {
    /// Identifier stamped on everything the process writes. Zero means the
    /// process may not write.
    pub write_id: u32,
    /// Identifiers whose data the process may read.
    pub read_ids: Vec<u32, MAX_ACL_IDS>,
    /// Identifiers whose data the process may modify.
    pub access_ids: Vec<u32, MAX_ACL_IDS>,
}

/// One decoded header record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Tlv<'a> {
    Main(MainTlv),
    WriteableFlashRegions(Vec<WriteableFlashRegion, MAX_WRITEABLE_REGIONS>),
    PackageName(&'a str),
    FixedAddresses(FixedAddresses),
    Permissions(Vec<DriverPermission, MAX_PERMISSIONS>),
    PersistentAcl(PersistentAcl),
}

impl Tlv<'_> {
    pub fn tlv_type(&self) -> TlvType {
        match self {
            Self::Main(_) => TlvType::Main,
            Self::WriteableFlashRegions(_) => TlvType::WriteableFlashRegions,
            Self::PackageName(_) => TlvType::PackageName,
            Self::FixedAddresses(_) => TlvType::FixedAddresses,
            Self::Permissions(_) => TlvType::Permissions,
            Self::PersistentAcl(_) => TlvType::PersistentAcl,
        }
    }
}

/// Answer to "may this process issue this command to this driver?"
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandPermissions {
    /// The header carries no Permissions record, so no restriction applies.
    NoPermsAtAll,
    /// The header restricts commands and does not list this driver.
    NoPermsThisDriver,
    /// Mask of allowed commands for the block of 64 containing the command.
    Mask(u64),
}

/// Reasons a header can be rejected.
///
/// Every variant means the same thing to the loader: this image is
/// malformed and must not run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MalformedHeader {
    /// Buffer is shorter than the structure it is supposed to hold.
    Truncated,
    UnsupportedVersion(u16),
    /// A length field is not a multiple of 4, the header is shorter than the
    /// base header, or the header claims to be longer than the image.
    BadLength,
    ChecksumMismatch { stored: u32, computed: u32 },
    /// A record is inconsistent with its type, or runs past the header.
    BadTlvEntry(u16),
    /// Package name is not valid UTF-8.
    BadPackageName,
    /// More records or list entries than we have room to keep.
    TooManyEntries(u16),
}

impl core::fmt::Display for MalformedHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Truncated => f.write_str("header truncated"),
            Self::UnsupportedVersion(v) => {
                write!(f, "unsupported header version {v}")
            }
            Self::BadLength => f.write_str("inconsistent header lengths"),
            Self::ChecksumMismatch { stored, computed } => write!(
                f,
                "checksum mismatch (stored {stored:#010x}, computed {computed:#010x})"
            ),
            Self::BadTlvEntry(t) => write!(f, "bad record of type {t}"),
            Self::BadPackageName => f.write_str("package name is not UTF-8"),
            Self::TooManyEntries(t) => {
                write!(f, "too many entries in record of type {t}")
            }
        }
    }
}

/// A validated TBF header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TbfHeader<'a> {
    version: u16,
    header_size: u16,
    total_size: u32,
    flags: TbfFlags,
    checksum: u32,
    tlvs: Vec<Tlv<'a>, MAX_TLVS>,
}

impl<'a> TbfHeader<'a> {
    /// Assembles a header from its records, computing `header_size` and the
    /// checksum.
    ///
    /// `total_size` must be a multiple of 4 and must be able to hold the
    /// header.
    pub fn build(
        total_size: u32,
        flags: TbfFlags,
        tlvs: Vec<Tlv<'a>, MAX_TLVS>,
    ) -> Result<Self, MalformedHeader> {
        let mut header = Self {
            version: SUPPORTED_VERSION,
            header_size: 0,
            total_size,
            flags,
            checksum: 0,
            tlvs,
        };
        let header_size = write::encoded_len(&header)?;
        if total_size % 4 != 0 || total_size < u32::from(header_size) {
            return Err(MalformedHeader::BadLength);
        }
        header.header_size = header_size;
        header.checksum = write::checksum(&header);
        Ok(header)
    }

    pub(crate) fn from_parts(
        base: BaseLengths,
        flags: TbfFlags,
        checksum: u32,
        tlvs: Vec<Tlv<'a>, MAX_TLVS>,
    ) -> Self {
        Self {
            version: base.version,
            header_size: base.header_size,
            total_size: base.total_size,
            flags,
            checksum,
            tlvs,
        }
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn header_size(&self) -> u16 {
        self.header_size
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn flags(&self) -> TbfFlags {
        self.flags
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Decoded records, in header order.
    pub fn tlvs(&self) -> &[Tlv<'a>] {
        &self.tlvs
    }

    pub fn enabled(&self) -> bool {
        self.flags.contains(TbfFlags::ENABLED)
    }

    pub fn sticky(&self) -> bool {
        self.flags.contains(TbfFlags::STICKY)
    }

    /// The Main record, if any. A later duplicate overrides an earlier one.
    pub fn main(&self) -> Option<&MainTlv> {
        self.tlvs.iter().rev().find_map(|t| match t {
            Tlv::Main(m) => Some(m),
            _ => None,
        })
    }

    /// Checks whether this image contains a program, as opposed to being
    /// padding between programs.
    pub fn is_app(&self) -> bool {
        self.main().is_some()
    }

    pub fn init_fn_offset(&self) -> u32 {
        self.main().map_or(0, |m| m.init_fn_offset)
    }

    pub fn protected_size(&self) -> u32 {
        self.main().map_or(0, |m| m.protected_size)
    }

    pub fn minimum_ram_size(&self) -> u32 {
        self.main().map_or(0, |m| m.minimum_ram_size)
    }

    /// Bytes at the start of the image the process can never write: the
    /// header plus the protected region.
    pub fn protected_len(&self) -> u32 {
        u32::from(self.header_size).saturating_add(self.protected_size())
    }

    pub fn package_name(&self) -> Option<&'a str> {
        self.tlvs.iter().find_map(|t| match t {
            Tlv::PackageName(n) => Some(*n),
            _ => None,
        })
    }

    /// All writeable flash regions, across every record that lists them.
    pub fn writeable_flash_regions(
        &self,
    ) -> impl Iterator<Item = &WriteableFlashRegion> + '_ {
        self.tlvs
            .iter()
            .filter_map(|t| match t {
                Tlv::WriteableFlashRegions(r) => Some(r.iter()),
                _ => None,
            })
            .flatten()
    }

    fn fixed_addresses(&self) -> Option<&FixedAddresses> {
        self.tlvs.iter().find_map(|t| match t {
            Tlv::FixedAddresses(f) => Some(f),
            _ => None,
        })
    }

    /// RAM address the image was linked for, if it was linked for one.
    pub fn fixed_address_ram(&self) -> Option<u32> {
        self.fixed_addresses()
            .map(|f| f.ram)
            .filter(|&a| a != UNCONSTRAINED_ADDRESS)
    }

    /// Flash address of the code after the protected region, if the image
    /// was linked for one.
    pub fn fixed_address_flash(&self) -> Option<u32> {
        self.fixed_addresses()
            .map(|f| f.flash)
            .filter(|&a| a != UNCONSTRAINED_ADDRESS)
    }

    pub fn persistent_acl(&self) -> Option<&PersistentAcl> {
        self.tlvs.iter().find_map(|t| match t {
            Tlv::PersistentAcl(a) => Some(a),
            _ => None,
        })
    }

    /// Looks up the command mask that covers `command_num` on
    /// `driver_number`.
    ///
    /// Permissions are default-deny once a Permissions record exists: a
    /// listed driver without an entry for the right block of 64 commands gets
    /// an empty mask.
    pub fn command_permissions(
        &self,
        driver_number: u32,
        command_num: u32,
    ) -> CommandPermissions {
        let offset = command_num / 64;
        let mut any_record = false;
        let mut driver_listed = false;
        for t in &self.tlvs {
            let Tlv::Permissions(perms) = t else { continue };
            any_record = true;
            for p in perms.iter().filter(|p| p.driver_number == driver_number)
            {
                driver_listed = true;
                if p.offset == offset {
                    return CommandPermissions::Mask(p.allowed_commands);
                }
            }
        }
        match (any_record, driver_listed) {
            (false, _) => CommandPermissions::NoPermsAtAll,
            (true, false) => CommandPermissions::NoPermsThisDriver,
            (true, true) => CommandPermissions::Mask(0),
        }
    }

    /// Convenience form of [`Self::command_permissions`]: can the command be
    /// issued at all?
    pub fn command_allowed(&self, driver_number: u32, command_num: u32) -> bool {
        match self.command_permissions(driver_number, command_num) {
            CommandPermissions::NoPermsAtAll => true,
            CommandPermissions::NoPermsThisDriver => false,
            CommandPermissions::Mask(m) => m & (1 << (command_num % 64)) != 0,
        }
    }

    /// Writes the encoded header to the front of `buf`, returning the number
    /// of bytes written (always `header_size`).
    pub fn write_to(&self, buf: &mut [u8]) -> Result<usize, WriteError> {
        write::write_to(self, buf)
    }
}

#[cfg(test)]
mod tests;
