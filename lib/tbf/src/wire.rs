// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-flash layouts.
//!
//! Everything here is `Unaligned` because TLV payloads are only 2-byte
//! aligned in places (the Permissions and PersistentAcl counts shift the
//! entries that follow them).

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    DriverPermission, FixedAddresses, MainTlv, WriteableFlashRegion,
    BASE_HEADER_LEN, TLV_HEADER_LEN,
};

#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct BaseHeader {
    pub version: U16,
    pub header_size: U16,
    pub total_size: U32,
    pub flags: U32,
    pub checksum: U32,
}

#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct TlvHeader {
    pub tipe: U16,
    pub length: U16,
}

#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct Main {
    pub init_fn_offset: U32,
    pub protected_size: U32,
    pub minimum_ram_size: U32,
}

#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct FlashRegion {
    pub offset: U32,
    pub size: U32,
}

#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct Fixed {
    pub ram: U32,
    pub flash: U32,
}

#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub(crate) struct Permission {
    pub driver_number: U32,
    pub offset: U32,
    pub allowed_commands: U64,
}

static_assertions::assert_eq_size!(BaseHeader, [u8; BASE_HEADER_LEN]);
static_assertions::assert_eq_size!(TlvHeader, [u8; TLV_HEADER_LEN]);
static_assertions::assert_eq_size!(Main, [u8; 12]);
static_assertions::assert_eq_size!(Permission, [u8; 16]);

impl From<Main> for MainTlv {
    fn from(m: Main) -> Self {
        Self {
            init_fn_offset: m.init_fn_offset.get(),
            protected_size: m.protected_size.get(),
            minimum_ram_size: m.minimum_ram_size.get(),
        }
    }
}

impl From<&MainTlv> for Main {
    fn from(m: &MainTlv) -> Self {
        Self {
            init_fn_offset: U32::new(m.init_fn_offset),
            protected_size: U32::new(m.protected_size),
            minimum_ram_size: U32::new(m.minimum_ram_size),
        }
    }
}

impl From<FlashRegion> for WriteableFlashRegion {
    fn from(r: FlashRegion) -> Self {
        Self {
            offset: r.offset.get(),
            size: r.size.get(),
        }
    }
}

impl From<&WriteableFlashRegion> for FlashRegion {
    fn from(r: &WriteableFlashRegion) -> Self {
        Self {
            offset: U32::new(r.offset),
            size: U32::new(r.size),
        }
    }
}

impl From<Fixed> for FixedAddresses {
    fn from(f: Fixed) -> Self {
        Self {
            ram: f.ram.get(),
            flash: f.flash.get(),
        }
    }
}

impl From<&FixedAddresses> for Fixed {
    fn from(f: &FixedAddresses) -> Self {
        Self {
            ram: U32::new(f.ram),
            flash: U32::new(f.flash),
        }
    }
}

impl From<Permission> for DriverPermission {
    fn from(p: Permission) -> Self {
        Self {
            driver_number: p.driver_number.get(),
            offset: p.offset.get(),
            allowed_commands: p.allowed_commands.get(),
        }
    }
}

impl From<&DriverPermission> for Permission {
    fn from(p: &DriverPermission) -> Self {
        Self {
            driver_number: U32::new(p.driver_number),
            offset: U32::new(p.offset),
            allowed_commands: U64::new(p.allowed_commands),
        }
    }
}

/// Rounds a record length up to the 4-byte boundary the next record starts
/// on.
pub(crate) const fn align4(n: usize) -> usize {
    (n + 3) & !3
}
