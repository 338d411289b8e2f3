//! Dump the raw key headers of the extents and dirents btrees.
//!
//! Run with: cargo run --example dump_keys

use std::path::Path;

use bchwalk_core::{BtreeId, Reader};

fn main() -> anyhow::Result<()> {
    let image_path = Path::new("dataset.img");

    if !image_path.exists() {
        eprintln!("Image not found: {}", image_path.display());
        eprintln!("   Point this example at a cleanly unmounted bcachefs image.");
        return Ok(());
    }

    let reader = Reader::open(image_path)?;
    println!("{}", reader.filesystem_info());
    println!();

    for btree in [BtreeId::Extents, BtreeId::Dirents] {
        println!("== {} ==", btree);
        let mut iter = reader.iterator(btree)?;
        while let Some(key) = iter.next_key()? {
            let k = key.unpack()?;
            println!(
                "bkey: u:{}, f:{}, t:{}, s:{}, o:{}",
                k.u64s, k.format, k.key_type, k.size, k.p.offset
            );
        }
    }

    Ok(())
}
