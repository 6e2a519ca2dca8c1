use std::env;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use ctrkit::formats::Options;
use ctrkit::formats::cci::Cci;
use ctrkit::formats::cia::Cia;
use ctrkit::formats::ncch::Ncch;
use ctrkit::keys::KeySet;
use ctrkit::storage::{FileStorage, SharedStorage};
use ctrkit::vfs::VirtualFileSystem;
use ctrkit::{Error, Result};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let path = env::args()
        .nth(1)
        .ok_or(Error::InvalidArgument("usage: mount <file.3ds|file.cia|file.cxi>"))?;

    let mut keys = KeySet::new();
    if Path::new("keys.txt").exists() {
        keys.load(File::open("keys.txt")?)?;
    }
    let options = Options::default();
    let storage: SharedStorage = Arc::new(FileStorage::open(&path)?);

    let extension = Path::new(&path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match extension.as_str() {
        "3ds" | "cci" => {
            let cci = Cci::parse(&storage)?;
            println!("media id: {:016X}", cci.media_id);
            print_tree(&cci.mount(&storage)?);
            let ncch = Ncch::open(cci.open_partition(&storage, 0)?, &keys, options)?;
            print_ncch(&ncch)?;
        }
        "cia" => {
            let cia = Cia::parse(&storage)?;
            println!("title id: {:016X}", cia.tmd.title_id);
            print_tree(&cia.mount(&storage, &keys, options)?);
            if let Some(first) = cia.contents.first() {
                let content = cia.open_content(&storage, first, &keys, options)?;
                print_ncch(&Ncch::open(content, &keys, options)?)?;
            }
        }
        _ => print_ncch(&Ncch::open(storage, &keys, options)?)?,
    }
    Ok(())
}

fn print_ncch(ncch: &Ncch) -> Result<()> {
    println!(
        "partition id: {:016X} ({})",
        ncch.header.partition_id, ncch.header.product_code
    );
    if let Ok(exefs) = ncch.exefs() {
        println!("exefs:");
        print_tree(&exefs);
    }
    match ncch.romfs() {
        Ok(romfs) => {
            println!("romfs:");
            print_tree(&romfs);
        }
        Err(Error::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    Ok(())
}

fn print_tree(vfs: &VirtualFileSystem) {
    for file in vfs.files() {
        println!("  {:>10}  {}", file.size, file.path);
    }
}
