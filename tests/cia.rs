//! CIA archives: section layout, ticket and TMD decoding, content
//! decryption and verification.

mod common;

use ctrkit::Error;
use ctrkit::formats::Options;
use ctrkit::formats::cia::Cia;
use ctrkit::formats::ncch::Ncch;
use ctrkit::formats::tmd::{CtrCustomData, TitleCustomData};
use ctrkit::keys::KeySet;

use common::{
    CiaImage, ExeFsImage, NcchImage, PARTITION_ID, TITLE_KEY, init_tracing, memory, pattern,
    test_keys,
};

const TITLE_ID: u64 = PARTITION_ID;

fn sample() -> CiaImage {
    let mut cia = CiaImage::new(TITLE_ID)
        .content(0x0000_0010, 0, true, pattern(0x800, 1))
        .content(0x0000_0011, 1, false, pattern(0x230, 2))
        .content(0x0000_0020, 4, true, pattern(0x40, 3));
    cia.meta = pattern(0x3AC0, 9);
    cia.custom_data[..4].copy_from_slice(&0x8_0000u32.to_le_bytes());
    cia
}

#[test]
fn parses_sections_ticket_and_tmd() {
    let storage = memory(sample().build());
    let cia = Cia::parse(&storage).unwrap();

    assert_eq!(cia.cert.offset, 0x2040);
    assert_eq!(cia.ticket_section.offset % 0x40, 0);
    assert_eq!(cia.tmd_section.offset % 0x40, 0);
    assert_eq!(cia.content.size, 0x800 + 0x230 + 0x40);
    assert_eq!(cia.meta.size, 0x3AC0);

    assert_eq!(cia.ticket.title_id, TITLE_ID);
    assert_eq!(cia.ticket.signature_type, 0x010004);
    assert_eq!(cia.ticket.issuer, "Root-CA00000003-XS0000000c");
    assert_eq!(cia.ticket.title_key(&test_keys()).unwrap(), TITLE_KEY);

    assert_eq!(cia.tmd.title_id, TITLE_ID);
    assert_eq!(cia.tmd.content_count(), 3);
    assert_eq!(
        cia.tmd.custom(),
        TitleCustomData::Ctr(CtrCustomData {
            save_data_size: 0x8_0000
        })
    );
    cia.tmd.verify().unwrap();

    // Contents are stored back to back, in chunk order.
    let offsets: Vec<_> = cia.contents.iter().map(|c| c.offset - cia.content.offset).collect();
    assert_eq!(offsets, [0, 0x800, 0xA30]);
    assert!(cia.has_content(4));
    assert!(!cia.has_content(2));
}

#[test]
fn mounts_and_decrypts_contents() {
    init_tracing();
    let storage = memory(sample().build());
    let cia = Cia::parse(&storage).unwrap();
    let vfs = cia.mount(&storage, &test_keys(), Options::default()).unwrap();

    let mut names: Vec<_> = vfs.files().map(|f| f.path.clone()).collect();
    names.sort();
    assert_eq!(
        names,
        [
            "/0000.00000010.app",
            "/0001.00000011.app",
            "/0004.00000020.app",
            "/cert",
            "/meta",
            "/ticket",
            "/tmd",
        ]
    );
    assert_eq!(vfs["/0000.00000010.app"].read_all().unwrap(), pattern(0x800, 1));
    assert_eq!(vfs["/0001.00000011.app"].read_all().unwrap(), pattern(0x230, 2));
    assert_eq!(vfs["/0004.00000020.app"].read_all().unwrap(), pattern(0x40, 3));
    assert_eq!(vfs["/meta"].read_all().unwrap(), pattern(0x3AC0, 9));
}

#[test]
fn meta_is_omitted_when_empty() {
    let mut image = sample();
    image.meta.clear();
    let storage = memory(image.build());
    let cia = Cia::parse(&storage).unwrap();
    let vfs = cia.mount(&storage, &test_keys(), Options::default()).unwrap();
    assert!(vfs.file("/meta").is_none());
    assert_eq!(vfs.file_count(), 6);
}

#[test]
fn title_key_entry_overrides_the_ticket() {
    let storage = memory(sample().build());
    let cia = Cia::parse(&storage).unwrap();
    let mut keys = KeySet::new();
    keys.title_keys.insert(TITLE_ID, TITLE_KEY);
    let vfs = cia.mount(&storage, &keys, Options::default()).unwrap();
    assert_eq!(vfs["/0000.00000010.app"].read_all().unwrap(), pattern(0x800, 1));
}

#[test]
fn missing_common_key_is_reported() {
    let storage = memory(sample().build());
    let cia = Cia::parse(&storage).unwrap();
    let err = cia
        .mount(&storage, &KeySet::new(), Options::default())
        .unwrap_err();
    assert!(matches!(err, Error::MissingKey(ref name) if name == "common_key_00"), "{err:?}");
}

#[test]
fn corrupt_content_fails_verification() {
    let mut image = sample().build();
    let cia = Cia::parse(&memory(image.clone())).unwrap();
    let second = cia.contents[1].offset as usize;
    image[second + 0x100] ^= 0x01;

    let storage = memory(image);
    let err = cia
        .mount(&storage, &test_keys(), Options::default())
        .unwrap_err();
    assert!(matches!(err, Error::Integrity { what: "cia content", index: 1 }), "{err:?}");

    let lenient = Options {
        verify: false,
        decrypt: true,
    };
    assert!(cia.mount(&storage, &test_keys(), lenient).is_ok());
}

#[test]
fn tampered_chunk_record_fails_tmd_verification() {
    let storage = memory(sample().build());
    let mut cia = Cia::parse(&storage).unwrap();
    cia.tmd.verify().unwrap();

    let mut image = sample().build();
    // Last byte of the TMD lies in the final chunk record's hash.
    let tmd_end = (cia.tmd_section.offset + cia.tmd_section.size) as usize;
    image[tmd_end - 1] ^= 0x01;
    cia = Cia::parse(&memory(image)).unwrap();
    assert!(matches!(
        cia.tmd.verify(),
        Err(Error::Integrity { what: "tmd chunk records", .. })
    ));
}

#[test]
fn decrypt_off_exposes_encrypted_contents() {
    let storage = memory(sample().build());
    let cia = Cia::parse(&storage).unwrap();
    let options = Options {
        verify: true,
        decrypt: false,
    };
    let vfs = cia.mount(&storage, &KeySet::new(), options).unwrap();
    assert_ne!(vfs["/0000.00000010.app"].read_all().unwrap(), pattern(0x800, 1));
    assert_eq!(vfs["/0001.00000011.app"].read_all().unwrap(), pattern(0x230, 2));
}

#[test]
fn index_bits_must_match_the_tmd() {
    let mut image = sample().build();
    // Mark content 2 present although the TMD does not list it.
    image[0x20] |= 0x20;
    assert!(matches!(Cia::parse(&memory(image)), Err(Error::Parse(_))));

    let mut image = sample().build();
    image[0x20] &= !0x80;
    assert!(matches!(Cia::parse(&memory(image)), Err(Error::Parse(_))));
}

#[test]
fn truncated_archive_is_rejected() {
    let image = sample().build();
    let truncated = image[..image.len() - 1].to_vec();
    assert!(matches!(Cia::parse(&memory(truncated)), Err(Error::InvalidRange)));
}

#[test]
fn encrypted_ncch_content_opens_end_to_end() {
    let ncch = NcchImage {
        encrypted: true,
        exefs: Some(ExeFsImage::new().section(".code", &pattern(0x250, 4)).build()),
        ..NcchImage::default()
    }
    .build();
    let image = CiaImage::new(TITLE_ID).content(0, 0, true, ncch).build();
    let storage = memory(image);
    let cia = Cia::parse(&storage).unwrap();
    let keys = test_keys();
    let app = cia
        .open_content(&storage, &cia.contents[0], &keys, Options::default())
        .unwrap();
    let ncch = Ncch::open(app, &keys, Options::default()).unwrap();
    assert_eq!(
        ncch.exefs().unwrap()["/.code"].read_all().unwrap(),
        pattern(0x250, 4)
    );
}
