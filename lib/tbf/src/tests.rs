// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::*;
use crate::parse::checksum_words;
use proptest::prelude::*;

/// Assembles a header by hand from raw records, padding each to 4 bytes and
/// sealing it with a correct checksum. Lengths are taken as given, so this
/// can build headers that lie.
fn raw_header(total_size: u32, flags: u32, records: &[(u16, u16, &[u8])]) -> std::vec::Vec<u8> {
    let mut out = std::vec::Vec::new();
    out.extend_from_slice(&SUPPORTED_VERSION.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&total_size.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    for &(tipe, length, body) in records {
        out.extend_from_slice(&tipe.to_le_bytes());
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(body);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }
    let header_size = out.len() as u16;
    out[2..4].copy_from_slice(&header_size.to_le_bytes());
    seal(&mut out);
    out
}

fn seal(header: &mut [u8]) {
    let sum = checksum_words(header);
    header[12..16].copy_from_slice(&sum.to_le_bytes());
}

fn main_body(init: u32, protected: u32, ram: u32) -> std::vec::Vec<u8> {
    [init, protected, ram]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect()
}

fn sample_header() -> TbfHeader<'static> {
    let mut tlvs = Vec::new();
    tlvs.push(Tlv::Main(MainTlv {
        init_fn_offset: 0x41,
        protected_size: 0x20,
        minimum_ram_size: 0x1000,
    }))
    .unwrap();
    tlvs.push(Tlv::PackageName("blink")).unwrap();
    tlvs.push(Tlv::WriteableFlashRegions(
        Vec::from_slice(&[WriteableFlashRegion {
            offset: 0x800,
            size: 0x200,
        }])
        .unwrap(),
    ))
    .unwrap();
    tlvs.push(Tlv::Permissions(
        Vec::from_slice(&[
            DriverPermission {
                driver_number: 0x0000_0002,
                offset: 0,
                allowed_commands: 0b1011,
            },
            DriverPermission {
                driver_number: 0x0000_0002,
                offset: 2,
                allowed_commands: 1,
            },
            DriverPermission {
                driver_number: 0x0006_0000,
                offset: 1,
                allowed_commands: u64::MAX,
            },
        ])
        .unwrap(),
    ))
    .unwrap();
    TbfHeader::build(0x2000, TbfFlags::ENABLED, tlvs).unwrap()
}

fn encode(header: &TbfHeader<'_>) -> std::vec::Vec<u8> {
    let mut buf = vec![0; usize::from(header.header_size())];
    let n = header.write_to(&mut buf).unwrap();
    assert_eq!(n, buf.len());
    buf
}

#[test]
fn parses_a_complete_app_header() {
    let bytes = encode(&sample_header());
    let h = parse(&bytes).unwrap().unwrap();

    assert_eq!(h.version(), 2);
    assert_eq!(h.total_size(), 0x2000);
    assert!(h.enabled());
    assert!(!h.sticky());
    assert!(h.is_app());
    assert_eq!(h.init_fn_offset(), 0x41);
    assert_eq!(h.minimum_ram_size(), 0x1000);
    assert_eq!(h.protected_len(), u32::from(h.header_size()) + 0x20);
    assert_eq!(h.package_name(), Some("blink"));
    assert_eq!(h.writeable_flash_regions().count(), 1);
    assert_eq!(h.fixed_address_ram(), None);
    assert_eq!(h.fixed_address_flash(), None);
    assert_eq!(h, sample_header());
}

#[test]
fn header_may_be_followed_by_the_rest_of_the_image() {
    let mut bytes = encode(&sample_header());
    bytes.resize(0x2000, 0xA5);
    assert!(parse(&bytes).unwrap().is_some());
}

#[test]
fn zero_total_size_is_an_empty_slot() {
    let bytes = raw_header(0, 0, &[]);
    assert_eq!(parse(&bytes), Ok(None));
}

#[test]
fn padding_image_has_no_main() {
    let bytes = raw_header(0x400, 0, &[]);
    let h = parse(&bytes).unwrap().unwrap();
    assert!(!h.is_app());
    assert_eq!(h.init_fn_offset(), 0);
    assert_eq!(h.minimum_ram_size(), 0);
    assert_eq!(h.package_name(), None);
}

#[test]
fn erased_flash_is_not_a_header() {
    let bytes = [0xFF; 64];
    assert_eq!(peek_lengths(&bytes), None);
    assert_eq!(
        parse(&bytes),
        Err(MalformedHeader::UnsupportedVersion(0xFFFF))
    );
}

#[test]
fn short_buffers_are_truncated() {
    let bytes = encode(&sample_header());
    assert_eq!(parse(&bytes[..8]), Err(MalformedHeader::Truncated));
    assert_eq!(parse(&bytes[..bytes.len() - 4]), Err(MalformedHeader::Truncated));
    assert_eq!(peek_lengths(&bytes[..15]), None);
}

#[test]
fn peek_reports_unvalidated_lengths() {
    let mut bytes = encode(&sample_header());
    bytes[12] ^= 1;
    let lengths = peek_lengths(&bytes).unwrap();
    assert_eq!(lengths.total_size, 0x2000);
    assert_eq!(usize::from(lengths.header_size), bytes.len());
    assert!(parse(&bytes).is_err());
}

#[test]
fn checksum_mismatch_is_reported() {
    let mut bytes = encode(&sample_header());
    // Flip a bit in the Main record's minimum RAM size.
    bytes[28] ^= 0x10;
    assert!(matches!(
        parse(&bytes),
        Err(MalformedHeader::ChecksumMismatch { .. })
    ));
}

#[test]
fn misaligned_and_inconsistent_lengths() {
    // Total size not a multiple of 4.
    let bytes = raw_header(0x401, 0, &[]);
    assert_eq!(parse(&bytes), Err(MalformedHeader::BadLength));

    // Header bigger than the image it describes.
    let body = main_body(0, 0, 0);
    let bytes = raw_header(16, 0, &[(1, 12, &body)]);
    assert_eq!(parse(&bytes), Err(MalformedHeader::BadLength));

    // Header size smaller than the base header.
    let mut bytes = raw_header(0x400, 0, &[]);
    bytes[2..4].copy_from_slice(&12u16.to_le_bytes());
    seal(&mut bytes);
    assert_eq!(parse(&bytes), Err(MalformedHeader::BadLength));
}

#[test]
fn record_overrunning_the_header_is_rejected() {
    let body = main_body(0, 0, 0);
    // Claims 0x40 bytes of payload but only 12 are present.
    let bytes = raw_header(0x400, 0, &[(1, 0x40, &body)]);
    assert_eq!(parse(&bytes), Err(MalformedHeader::BadTlvEntry(1)));
}

#[test]
fn fixed_size_records_must_have_their_size() {
    let body = main_body(0, 0, 0);
    let bytes = raw_header(0x400, 0, &[(1, 8, &body[..8])]);
    assert_eq!(parse(&bytes), Err(MalformedHeader::BadTlvEntry(1)));

    let bytes = raw_header(0x400, 0, &[(5, 4, &[0xFF; 4])]);
    assert_eq!(parse(&bytes), Err(MalformedHeader::BadTlvEntry(5)));
}

#[test]
fn unknown_records_are_skipped() {
    let body = main_body(0x10, 0, 0x800);
    let bytes = raw_header(
        0x400,
        1,
        &[
            (4, 4, &[1, 2, 3, 4]),
            (0x8001, 6, &[9; 6]),
            (1, 12, &body),
            (0x40, 0, &[]),
            (3, 3, b"abc"),
        ],
    );
    let h = parse(&bytes).unwrap().unwrap();
    assert_eq!(h.tlvs().len(), 2);
    assert_eq!(h.init_fn_offset(), 0x10);
    assert_eq!(h.package_name(), Some("abc"));
}

#[test]
fn package_name_must_be_utf8() {
    let bytes = raw_header(0x400, 0, &[(3, 2, &[0xC3, 0x28])]);
    assert_eq!(parse(&bytes), Err(MalformedHeader::BadPackageName));
}

#[test]
fn later_main_record_wins() {
    let first = main_body(1, 0, 0x100);
    let second = main_body(2, 0, 0x200);
    let bytes = raw_header(0x400, 1, &[(1, 12, &first), (1, 12, &second)]);
    let h = parse(&bytes).unwrap().unwrap();
    assert_eq!(h.init_fn_offset(), 2);
    assert_eq!(h.minimum_ram_size(), 0x200);
}

#[test]
fn fixed_address_sentinel_means_unconstrained() {
    let mut fixed = std::vec::Vec::new();
    fixed.extend_from_slice(&0x2000_4000u32.to_le_bytes());
    fixed.extend_from_slice(&UNCONSTRAINED_ADDRESS.to_le_bytes());
    let bytes = raw_header(0x400, 1, &[(5, 8, &fixed)]);
    let h = parse(&bytes).unwrap().unwrap();
    assert_eq!(h.fixed_address_ram(), Some(0x2000_4000));
    assert_eq!(h.fixed_address_flash(), None);
}

#[test]
fn permissions_count_must_match_length() {
    let mut body = std::vec::Vec::new();
    body.extend_from_slice(&2u16.to_le_bytes());
    body.extend_from_slice(&[0; 16]);
    let bytes = raw_header(0x400, 0, &[(6, body.len() as u16, &body)]);
    assert_eq!(parse(&bytes), Err(MalformedHeader::BadTlvEntry(6)));
}

#[test]
fn too_many_acl_ids() {
    let mut body = std::vec::Vec::new();
    body.extend_from_slice(&7u32.to_le_bytes());
    body.extend_from_slice(&(MAX_ACL_IDS as u16 + 1).to_le_bytes());
    for id in 0..=MAX_ACL_IDS as u32 {
        body.extend_from_slice(&id.to_le_bytes());
    }
    body.extend_from_slice(&0u16.to_le_bytes());
    let bytes = raw_header(0x400, 0, &[(7, body.len() as u16, &body)]);
    assert_eq!(parse(&bytes), Err(MalformedHeader::TooManyEntries(7)));
}

#[test]
fn command_permission_lookup() {
    let h = sample_header();

    // Listed driver, listed block.
    assert_eq!(h.command_permissions(2, 3), CommandPermissions::Mask(0b1011));
    assert!(h.command_allowed(2, 0));
    assert!(h.command_allowed(2, 1));
    assert!(!h.command_allowed(2, 2));
    assert!(h.command_allowed(2, 3));
    assert!(h.command_allowed(2, 128));
    assert!(!h.command_allowed(2, 129));

    // Listed driver, block without an entry.
    assert_eq!(h.command_permissions(2, 70), CommandPermissions::Mask(0));
    assert!(!h.command_allowed(2, 70));

    // Unlisted driver.
    assert_eq!(
        h.command_permissions(0x9999, 0),
        CommandPermissions::NoPermsThisDriver
    );
    assert!(!h.command_allowed(0x9999, 0));

    assert!(!h.command_allowed(0x6_0000, 63));
    assert!(h.command_allowed(0x6_0000, 64));
    assert!(h.command_allowed(0x6_0000, 127));
}

#[test]
fn no_permissions_record_allows_everything() {
    let bytes = raw_header(0x400, 1, &[]);
    let h = parse(&bytes).unwrap().unwrap();
    assert_eq!(h.command_permissions(1, 1), CommandPermissions::NoPermsAtAll);
    assert!(h.command_allowed(0xFFFF, 12345));
}

#[test]
fn build_rejects_an_image_smaller_than_its_header() {
    let mut tlvs = Vec::new();
    tlvs.push(Tlv::PackageName("a-rather-long-name")).unwrap();
    assert_eq!(
        TbfHeader::build(20, TbfFlags::empty(), tlvs.clone()).unwrap_err(),
        MalformedHeader::BadLength
    );
    assert_eq!(
        TbfHeader::build(0x402, TbfFlags::empty(), tlvs).unwrap_err(),
        MalformedHeader::BadLength
    );
}

#[test]
fn write_into_a_short_buffer() {
    let h = sample_header();
    let mut buf = [0; 20];
    assert_eq!(
        h.write_to(&mut buf),
        Err(WriteError::BufferTooSmall {
            needed: usize::from(h.header_size())
        })
    );
}

/// Owned record contents, so proptest can generate headers whose package
/// name borrows from something that outlives the test case.
#[derive(Clone, Debug)]
enum Record {
    Main(u32, u32, u32),
    Regions(std::vec::Vec<(u32, u32)>),
    Name(String),
    Fixed(u32, u32),
    Perms(std::vec::Vec<(u32, u32, u64)>),
    Acl(u32, std::vec::Vec<u32>, std::vec::Vec<u32>),
}

impl Record {
    fn to_tlv(&self) -> Tlv<'_> {
        match self {
            Self::Main(a, b, c) => Tlv::Main(MainTlv {
                init_fn_offset: *a,
                protected_size: *b,
                minimum_ram_size: *c,
            }),
            Self::Regions(r) => Tlv::WriteableFlashRegions(
                r.iter()
                    .map(|&(offset, size)| WriteableFlashRegion { offset, size })
                    .collect(),
            ),
            Self::Name(n) => Tlv::PackageName(n),
            Self::Fixed(ram, flash) => Tlv::FixedAddresses(FixedAddresses {
                ram: *ram,
                flash: *flash,
            }),
            Self::Perms(p) => Tlv::Permissions(
                p.iter()
                    .map(|&(driver_number, offset, allowed_commands)| {
                        DriverPermission {
                            driver_number,
                            offset,
                            allowed_commands,
                        }
                    })
                    .collect(),
            ),
            Self::Acl(w, r, a) => Tlv::PersistentAcl(PersistentAcl {
                write_id: *w,
                read_ids: Vec::from_slice(r).unwrap(),
                access_ids: Vec::from_slice(a).unwrap(),
            }),
        }
    }
}

fn record() -> impl Strategy<Value = Record> {
    use proptest::collection::vec;
    prop_oneof![
        (any::<u32>(), any::<u32>(), any::<u32>())
            .prop_map(|(a, b, c)| Record::Main(a, b, c)),
        vec((any::<u32>(), any::<u32>()), 0..=MAX_WRITEABLE_REGIONS)
            .prop_map(Record::Regions),
        "[a-z_]{0,24}".prop_map(Record::Name),
        (any::<u32>(), any::<u32>()).prop_map(|(r, f)| Record::Fixed(r, f)),
        vec((any::<u32>(), any::<u32>(), any::<u64>()), 0..=MAX_PERMISSIONS)
            .prop_map(Record::Perms),
        (
            any::<u32>(),
            vec(any::<u32>(), 0..=MAX_ACL_IDS),
            vec(any::<u32>(), 0..=MAX_ACL_IDS)
        )
            .prop_map(|(w, r, a)| Record::Acl(w, r, a)),
    ]
}

fn build(records: &[Record], flags: u32, slack: u32) -> TbfHeader<'_> {
    let tlvs = records.iter().map(Record::to_tlv).collect();
    TbfHeader::build(0x1_0000 + slack * 4, TbfFlags::from_bits_retain(flags), tlvs)
        .unwrap()
}

proptest! {
    #[test]
    fn header_round_trip(
        records in proptest::collection::vec(record(), 0..8),
        flags in any::<u32>(),
        slack in 0u32..64,
    ) {
        let header = build(&records, flags, slack);
        let bytes = encode(&header);
        prop_assert_eq!(bytes.len() % 4, 0);
        prop_assert_eq!(parse(&bytes), Ok(Some(header)));
    }

    #[test]
    fn any_single_bit_flip_is_caught(
        records in proptest::collection::vec(record(), 0..6),
        flags in any::<u32>(),
        bit in any::<proptest::sample::Index>(),
    ) {
        let header = build(&records, flags, 0);
        let mut bytes = encode(&header);
        let i = bit.index(bytes.len() * 8);
        bytes[i / 8] ^= 1 << (i % 8);
        // A flip may turn the header into an empty slot, but never into a
        // process.
        prop_assert!(!matches!(parse(&bytes), Ok(Some(_))));
    }
}
