//! Builders for small, well-formed container images.
//!
//! Each builder lays its format out the way the parsers expect, so a test
//! can start from a valid image and break exactly one thing in it.

use aes::Aes128;
use ctrkit::crypto::{Cbc, Ctr, sha256};
use ctrkit::formats::romfs::{bucket_count, path_hash};
use ctrkit::storage::verify::hash_blocks;

use super::{COMMON_KEY, PARTITION_ID, PRIMARY_KEY, SECONDARY_KEY, TITLE_KEY};

const MEDIA_UNIT: usize = 0x200;
const NONE: u32 = 0xFFFF_FFFF;

fn align(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

fn utf16(name: &str) -> Vec<u8> {
    name.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

// RomFS

struct DirSpec {
    parent: usize,
    name: String,
}

struct FileSpec {
    parent: usize,
    name: String,
    data: Vec<u8>,
}

/// RomFS tables and data. Directories are created implicitly from file
/// paths, in first-seen order.
#[derive(Default)]
pub struct RomFsImage {
    dirs: Vec<DirSpec>,
    files: Vec<FileSpec>,
}

impl RomFsImage {
    pub fn new() -> Self {
        Self {
            dirs: vec![DirSpec {
                parent: 0,
                name: String::new(),
            }],
            files: Vec::new(),
        }
    }

    /// Add an (initially empty) directory at absolute `path`.
    pub fn dir(mut self, path: &str) -> Self {
        self.ensure_dir(path);
        self
    }

    /// Add a file at absolute `path`.
    pub fn file(mut self, path: &str, data: &[u8]) -> Self {
        let (dir, name) = path.rsplit_once('/').expect("absolute path");
        let parent = self.ensure_dir(dir);
        self.files.push(FileSpec {
            parent,
            name: name.to_string(),
            data: data.to_vec(),
        });
        self
    }

    fn ensure_dir(&mut self, path: &str) -> usize {
        let mut current = 0;
        for name in path.split('/').filter(|c| !c.is_empty()) {
            current = match self
                .dirs
                .iter()
                .position(|d| d.parent == current && d.name == name && !d.name.is_empty())
            {
                Some(i) => i,
                None => {
                    self.dirs.push(DirSpec {
                        parent: current,
                        name: name.to_string(),
                    });
                    self.dirs.len() - 1
                }
            };
        }
        current
    }

    pub fn build(&self) -> Vec<u8> {
        let dir_len = |d: &DirSpec| align(0x18 + d.name.encode_utf16().count() * 2, 4);
        let file_len = |f: &FileSpec| align(0x20 + f.name.encode_utf16().count() * 2, 4);

        let mut dir_offsets = Vec::new();
        let mut at = 0;
        for d in &self.dirs {
            dir_offsets.push(at as u32);
            at += dir_len(d);
        }
        let dir_meta_size = at;
        let mut file_offsets = Vec::new();
        at = 0;
        for f in &self.files {
            file_offsets.push(at as u32);
            at += file_len(f);
        }
        let file_meta_size = at;

        let first = |ids: Vec<usize>, offsets: &[u32]| ids.first().map_or(NONE, |&i| offsets[i]);
        let next = |ids: &[usize], me: usize, offsets: &[u32]| {
            let pos = ids.iter().position(|&i| i == me).expect("listed child");
            ids.get(pos + 1).map_or(NONE, |&i| offsets[i])
        };
        let child_dirs = |p: usize| -> Vec<usize> {
            (1..self.dirs.len()).filter(|&i| self.dirs[i].parent == p).collect()
        };
        let child_files = |p: usize| -> Vec<usize> {
            (0..self.files.len()).filter(|&i| self.files[i].parent == p).collect()
        };

        // Hash buckets, each chain prepended in entry order.
        let dir_buckets_n = bucket_count(self.dirs.len() as u32) as usize;
        let mut dir_buckets = vec![NONE; dir_buckets_n];
        let mut dir_hash_sibling = vec![NONE; self.dirs.len()];
        for (i, d) in self.dirs.iter().enumerate() {
            let b = path_hash(dir_offsets[d.parent], &d.name) as usize % dir_buckets_n;
            dir_hash_sibling[i] = dir_buckets[b];
            dir_buckets[b] = dir_offsets[i];
        }
        let file_buckets_n = bucket_count(self.files.len() as u32) as usize;
        let mut file_buckets = vec![NONE; file_buckets_n];
        let mut file_hash_sibling = vec![NONE; self.files.len()];
        for (i, f) in self.files.iter().enumerate() {
            let b = path_hash(dir_offsets[f.parent], &f.name) as usize % file_buckets_n;
            file_hash_sibling[i] = file_buckets[b];
            file_buckets[b] = file_offsets[i];
        }

        let mut dir_meta = vec![0u8; dir_meta_size];
        for (i, d) in self.dirs.iter().enumerate() {
            let o = dir_offsets[i] as usize;
            let sibling = if i == 0 {
                NONE
            } else {
                next(&child_dirs(d.parent), i, &dir_offsets)
            };
            let name = utf16(&d.name);
            put_u32(&mut dir_meta, o, dir_offsets[d.parent]);
            put_u32(&mut dir_meta, o + 0x04, sibling);
            put_u32(&mut dir_meta, o + 0x08, first(child_dirs(i), &dir_offsets));
            put_u32(&mut dir_meta, o + 0x0C, first(child_files(i), &file_offsets));
            put_u32(&mut dir_meta, o + 0x10, dir_hash_sibling[i]);
            put_u32(&mut dir_meta, o + 0x14, name.len() as u32);
            dir_meta[o + 0x18..o + 0x18 + name.len()].copy_from_slice(&name);
        }

        let mut data = Vec::new();
        let mut file_meta = vec![0u8; file_meta_size];
        for (i, f) in self.files.iter().enumerate() {
            let o = file_offsets[i] as usize;
            data.resize(align(data.len(), 16), 0);
            let data_offset = data.len();
            data.extend_from_slice(&f.data);
            let name = utf16(&f.name);
            put_u32(&mut file_meta, o, dir_offsets[f.parent]);
            put_u32(&mut file_meta, o + 0x04, next(&child_files(f.parent), i, &file_offsets));
            put_u64(&mut file_meta, o + 0x08, data_offset as u64);
            put_u64(&mut file_meta, o + 0x10, f.data.len() as u64);
            put_u32(&mut file_meta, o + 0x18, file_hash_sibling[i]);
            put_u32(&mut file_meta, o + 0x1C, name.len() as u32);
            file_meta[o + 0x20..o + 0x20 + name.len()].copy_from_slice(&name);
        }

        let words = |v: &[u32]| v.iter().flat_map(|w| w.to_le_bytes()).collect::<Vec<u8>>();
        let dir_hash = words(&dir_buckets);
        let file_hash = words(&file_buckets);

        let dir_hash_at = 0x28;
        let dir_meta_at = dir_hash_at + dir_hash.len();
        let file_hash_at = dir_meta_at + dir_meta.len();
        let file_meta_at = file_hash_at + file_hash.len();
        let data_at = align(file_meta_at + file_meta.len(), 16);

        let mut out = vec![0u8; data_at];
        put_u32(&mut out, 0x00, 0x28);
        for (i, (offset, size)) in [
            (dir_hash_at, dir_hash.len()),
            (dir_meta_at, dir_meta.len()),
            (file_hash_at, file_hash.len()),
            (file_meta_at, file_meta.len()),
        ]
        .into_iter()
        .enumerate()
        {
            put_u32(&mut out, 0x04 + i * 8, offset as u32);
            put_u32(&mut out, 0x08 + i * 8, size as u32);
        }
        put_u32(&mut out, 0x24, data_at as u32);
        out[dir_hash_at..dir_meta_at].copy_from_slice(&dir_hash);
        out[dir_meta_at..file_hash_at].copy_from_slice(&dir_meta);
        out[file_hash_at..file_meta_at].copy_from_slice(&file_hash);
        out[file_meta_at..file_meta_at + file_meta.len()].copy_from_slice(&file_meta);
        out.extend_from_slice(&data);
        out
    }
}

// IVFC

/// Wrap `lv3` in a three-level IVFC tree using one block size throughout.
/// The result is padded to a whole media unit.
pub fn ivfc_image(lv3: &[u8], block_size_log2: u32) -> Vec<u8> {
    let bs = 1usize << block_size_log2;
    let lv2 = hash_blocks(lv3, bs);
    let lv1 = hash_blocks(&lv2, bs);
    let master = hash_blocks(&lv1, bs);

    let lv3_at = align(0x60 + master.len(), bs);
    let lv1_at = align(lv3_at + lv3.len(), bs);
    let lv2_at = align(lv1_at + lv1.len(), bs);
    let total = align(lv2_at + lv2.len(), MEDIA_UNIT);

    let mut out = vec![0u8; total];
    out[..4].copy_from_slice(b"IVFC");
    put_u32(&mut out, 0x04, 0x10000);
    put_u32(&mut out, 0x08, master.len() as u32);
    let logical = [0, align(lv1.len(), bs), align(align(lv1.len(), bs) + lv2.len(), bs)];
    for (i, size) in [lv1.len(), lv2.len(), lv3.len()].into_iter().enumerate() {
        let at = 0x0C + i * 0x18;
        put_u64(&mut out, at, logical[i] as u64);
        put_u64(&mut out, at + 8, size as u64);
        put_u32(&mut out, at + 0x10, block_size_log2);
    }
    put_u32(&mut out, 0x54, 0x5C);
    out[0x60..0x60 + master.len()].copy_from_slice(&master);
    out[lv3_at..lv3_at + lv3.len()].copy_from_slice(lv3);
    out[lv1_at..lv1_at + lv1.len()].copy_from_slice(&lv1);
    out[lv2_at..lv2_at + lv2.len()].copy_from_slice(&lv2);
    out
}

// ExeFS

/// ExeFS header plus sections, each padded to 0x200.
#[derive(Default)]
pub struct ExeFsImage {
    sections: Vec<(String, Vec<u8>)>,
}

impl ExeFsImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(mut self, name: &str, data: &[u8]) -> Self {
        self.sections.push((name.to_string(), data.to_vec()));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![0u8; 0x200];
        let mut offset = 0usize;
        for (slot, (name, data)) in self.sections.iter().enumerate() {
            let at = slot * 0x10;
            out[at..at + name.len()].copy_from_slice(name.as_bytes());
            put_u32(&mut out, at + 8, offset as u32);
            put_u32(&mut out, at + 12, data.len() as u32);
            let hash_at = 0xC0 + (9 - slot) * 32;
            out[hash_at..hash_at + 32].copy_from_slice(&sha256(data));

            out.extend_from_slice(data);
            out.resize(align(out.len(), 0x200), 0);
            offset = out.len() - 0x200;
        }
        out
    }
}

// NCCH

/// An NCCH partition with optional exheader, ExeFS (built) and RomFS (an
/// IVFC image).
pub struct NcchImage {
    pub version: u16,
    pub encrypted: bool,
    /// Flags byte 3; selects the secondary keyslot.
    pub security_version: u8,
    pub exheader: Option<Vec<u8>>,
    pub exefs: Option<Vec<u8>>,
    pub romfs: Option<Vec<u8>>,
}

impl Default for NcchImage {
    fn default() -> Self {
        Self {
            version: 2,
            encrypted: false,
            security_version: 1,
            exheader: None,
            exefs: None,
            romfs: None,
        }
    }
}

impl NcchImage {
    fn counter(&self, section: u8, offset: usize) -> [u8; 16] {
        let mut ctr = [0u8; 16];
        if self.version == 1 {
            ctr[..8].copy_from_slice(&PARTITION_ID.to_le_bytes());
            ctr[12..].copy_from_slice(&(offset as u32).to_be_bytes());
        } else {
            ctr[..8].copy_from_slice(&PARTITION_ID.to_be_bytes());
            ctr[8] = section;
        }
        ctr
    }

    fn secondary_key(&self) -> [u8; 16] {
        if self.security_version == 0 {
            PRIMARY_KEY
        } else {
            SECONDARY_KEY
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mu = |bytes: usize| (bytes / MEDIA_UNIT) as u32;
        let mut out = vec![0u8; 0x200];

        let mut exheader_hash = [0u8; 32];
        if let Some(exheader) = &self.exheader {
            let mut region = vec![0u8; 0x800];
            region[..exheader.len()].copy_from_slice(exheader);
            exheader_hash = sha256(&region[..0x400]);
            out.extend_from_slice(&region);
        }

        let mut exefs_region = (0, 0);
        let mut exefs_hash = [0u8; 32];
        if let Some(exefs) = &self.exefs {
            exefs_region = (out.len(), align(exefs.len(), MEDIA_UNIT));
            exefs_hash = sha256(&exefs[..0x200]);
            out.extend_from_slice(exefs);
            out.resize(align(out.len(), MEDIA_UNIT), 0);
        }

        let mut romfs_region = (0, 0);
        let mut romfs_hash_size = 0;
        let mut romfs_hash = [0u8; 32];
        if let Some(romfs) = &self.romfs {
            romfs_region = (out.len(), align(romfs.len(), MEDIA_UNIT));
            let master_size = u32::from_le_bytes(romfs[8..12].try_into().unwrap()) as usize;
            romfs_hash_size = align(0x60 + master_size, MEDIA_UNIT);
            romfs_hash = sha256(&romfs[..romfs_hash_size]);
            out.extend_from_slice(romfs);
            out.resize(align(out.len(), MEDIA_UNIT), 0);
        }

        let total = mu(out.len());
        let h = &mut out[..0x200];
        h[0x100..0x104].copy_from_slice(b"NCCH");
        put_u32(h, 0x104, total);
        put_u64(h, 0x108, PARTITION_ID);
        h[0x110..0x112].copy_from_slice(b"01");
        h[0x112..0x114].copy_from_slice(&self.version.to_le_bytes());
        put_u64(h, 0x118, PARTITION_ID);
        h[0x150..0x15A].copy_from_slice(b"CTR-P-TEST");
        h[0x160..0x180].copy_from_slice(&exheader_hash);
        put_u32(h, 0x180, if self.exheader.is_some() { 0x400 } else { 0 });
        h[0x188 + 3] = self.security_version;
        h[0x188 + 4] = 1;
        h[0x188 + 5] = 0x03;
        h[0x188 + 7] = if self.encrypted { 0 } else { 0x04 };
        put_u32(h, 0x1A0, mu(exefs_region.0));
        put_u32(h, 0x1A4, mu(exefs_region.1));
        put_u32(h, 0x1A8, if self.exefs.is_some() { 1 } else { 0 });
        put_u32(h, 0x1B0, mu(romfs_region.0));
        put_u32(h, 0x1B4, mu(romfs_region.1));
        put_u32(h, 0x1B8, mu(romfs_hash_size));
        h[0x1C0..0x1E0].copy_from_slice(&exefs_hash);
        h[0x1E0..0x200].copy_from_slice(&romfs_hash);

        if self.encrypted {
            self.encrypt(&mut out, exefs_region, romfs_region);
        }
        out
    }

    fn encrypt(&self, out: &mut [u8], exefs: (usize, usize), romfs: (usize, usize)) {
        let ctr = |key: &[u8; 16], counter: [u8; 16]| Ctr::<Aes128>::new(key, &counter).unwrap();
        if self.exheader.is_some() {
            ctr(&PRIMARY_KEY, self.counter(1, 0x200)).apply_keystream(&mut out[0x200..0xA00], 0);
        }
        if exefs.1 > 0 {
            let counter = self.counter(2, exefs.0);
            let region = &mut out[exefs.0..exefs.0 + exefs.1];
            // Spans are taken from the plaintext header before it is encrypted.
            let mut spans = vec![(0usize, 0x200usize, PRIMARY_KEY)];
            for slot in 0..10 {
                let at = slot * 0x10;
                let size = u32::from_le_bytes(region[at + 12..at + 16].try_into().unwrap()) as usize;
                if region[at] == 0 || size == 0 {
                    continue;
                }
                let start = 0x200 + u32::from_le_bytes(region[at + 8..at + 12].try_into().unwrap()) as usize;
                let name = &region[at..at + 8];
                let key = if name.starts_with(b"icon") || name.starts_with(b"banner") {
                    PRIMARY_KEY
                } else {
                    self.secondary_key()
                };
                spans.push((start, start + align(size, 0x200), key));
            }
            for (start, end, key) in spans {
                ctr(&key, counter).apply_keystream(&mut region[start..end], (start / 16) as u64);
            }
        }
        if romfs.1 > 0 {
            let counter = self.counter(3, romfs.0);
            ctr(&self.secondary_key(), counter)
                .apply_keystream(&mut out[romfs.0..romfs.0 + romfs.1], 0);
        }
    }
}

// CCI

/// An NCSD image holding `partitions` as `(slot, title id, ncch)`.
pub fn cci_image(partitions: &[(usize, u64, Vec<u8>)]) -> Vec<u8> {
    let mut out = vec![0u8; 0x4000];
    let mut table = [(0u32, 0u32); 8];
    let mut ids = [0u64; 8];
    for (slot, title_id, ncch) in partitions {
        out.resize(align(out.len(), MEDIA_UNIT), 0);
        let offset = out.len();
        out.extend_from_slice(ncch);
        out.resize(align(out.len(), MEDIA_UNIT), 0);
        table[*slot] = ((offset / MEDIA_UNIT) as u32, ((out.len() - offset) / MEDIA_UNIT) as u32);
        ids[*slot] = *title_id;
    }
    out[0x100..0x104].copy_from_slice(b"NCSD");
    let units = (out.len() / MEDIA_UNIT) as u32;
    put_u32(&mut out, 0x104, units);
    put_u64(&mut out, 0x108, PARTITION_ID);
    for (i, (offset, size)) in table.iter().enumerate() {
        put_u32(&mut out, 0x120 + i * 8, *offset);
        put_u32(&mut out, 0x124 + i * 8, *size);
        put_u64(&mut out, 0x190 + i * 8, ids[i]);
    }
    out[0x188 + 4] = 1;
    out[0x188 + 5] = 1;
    out
}

// CIA

/// One CIA content before encryption.
pub struct CiaContentSpec {
    pub id: u32,
    pub index: u16,
    pub encrypted: bool,
    /// Plaintext; a multiple of 16 bytes when encrypted.
    pub data: Vec<u8>,
}

/// A CIA signed with dummy signatures, whose title key is wrapped with
/// common key 0.
pub struct CiaImage {
    pub title_id: u64,
    pub contents: Vec<CiaContentSpec>,
    pub meta: Vec<u8>,
    pub custom_data: [u8; 13],
}

impl CiaImage {
    pub fn new(title_id: u64) -> Self {
        Self {
            title_id,
            contents: Vec::new(),
            meta: Vec::new(),
            custom_data: [0; 13],
        }
    }

    pub fn content(mut self, id: u32, index: u16, encrypted: bool, data: Vec<u8>) -> Self {
        self.contents.push(CiaContentSpec {
            id,
            index,
            encrypted,
            data,
        });
        self
    }

    fn signature() -> Vec<u8> {
        let mut sig = vec![0u8; 0x140];
        sig[..4].copy_from_slice(&0x010004u32.to_be_bytes());
        sig
    }

    pub fn ticket(&self) -> Vec<u8> {
        let mut body = vec![0u8; 0x164];
        body[..0x1A].copy_from_slice(b"Root-CA00000003-XS0000000c");
        body[0x7C] = 1;
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&self.title_id.to_be_bytes());
        let mut key = TITLE_KEY;
        Cbc::<Aes128>::new(&COMMON_KEY, &iv)
            .unwrap()
            .encrypt_in_place(&mut key)
            .unwrap();
        body[0x7F..0x8F].copy_from_slice(&key);
        body[0x9C..0xA4].copy_from_slice(&self.title_id.to_be_bytes());
        body[0xB1] = 0;
        let mut out = Self::signature();
        out.extend_from_slice(&body);
        out
    }

    pub fn tmd(&self) -> Vec<u8> {
        let mut chunks = Vec::new();
        for c in &self.contents {
            chunks.extend_from_slice(&c.id.to_be_bytes());
            chunks.extend_from_slice(&c.index.to_be_bytes());
            chunks.extend_from_slice(&(c.encrypted as u16).to_be_bytes());
            chunks.extend_from_slice(&(c.data.len() as u64).to_be_bytes());
            chunks.extend_from_slice(&sha256(&c.data));
        }
        let mut records = vec![0u8; 64 * 0x24];
        records[2..4].copy_from_slice(&(self.contents.len() as u16).to_be_bytes());
        records[4..0x24].copy_from_slice(&sha256(&chunks));

        let mut header = vec![0u8; 0xC4];
        header[..0x1A].copy_from_slice(b"Root-CA00000003-CP0000000b");
        header[0x40] = 1;
        header[0x4C..0x54].copy_from_slice(&self.title_id.to_be_bytes());
        header[0x54..0x58].copy_from_slice(&0x40u32.to_be_bytes());
        header[0x5A..0x67].copy_from_slice(&self.custom_data);
        header[0x9E..0xA0].copy_from_slice(&(self.contents.len() as u16).to_be_bytes());
        header[0xA4..0xC4].copy_from_slice(&sha256(&records));

        let mut out = Self::signature();
        out.extend_from_slice(&header);
        out.extend_from_slice(&records);
        out.extend_from_slice(&chunks);
        out
    }

    fn content_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for c in &self.contents {
            let mut data = c.data.clone();
            if c.encrypted {
                let mut iv = [0u8; 16];
                iv[..2].copy_from_slice(&c.index.to_be_bytes());
                Cbc::<Aes128>::new(&TITLE_KEY, &iv)
                    .unwrap()
                    .encrypt_in_place(&mut data)
                    .unwrap();
            }
            out.extend_from_slice(&data);
        }
        out
    }

    pub fn build(&self) -> Vec<u8> {
        let cert = super::pattern(0x300, 0xCE);
        let ticket = self.ticket();
        let tmd = self.tmd();
        let content = self.content_bytes();

        let mut out = vec![0u8; 0x2020];
        put_u32(&mut out, 0x00, 0x2020);
        put_u32(&mut out, 0x08, cert.len() as u32);
        put_u32(&mut out, 0x0C, ticket.len() as u32);
        put_u32(&mut out, 0x10, tmd.len() as u32);
        put_u32(&mut out, 0x14, self.meta.len() as u32);
        put_u64(&mut out, 0x18, content.len() as u64);
        for c in &self.contents {
            out[0x20 + c.index as usize / 8] |= 0x80 >> (c.index % 8);
        }
        for section in [&cert, &ticket, &tmd, &content, &self.meta] {
            if section.is_empty() {
                continue;
            }
            out.resize(align(out.len(), 0x40), 0);
            out.extend_from_slice(section);
        }
        out
    }
}
