//! Cross-module scenarios exercising the driver core end to end, rather
//! than one layer in isolation (see each module's own `#[cfg(test)]` for
//! that).

use fatfs::boot_sector::FatType;
use fatfs::dir_entry::Attributes;
use fatfs::fat::FatManager;
use fatfs::format::{format, FormatOptions};
use fatfs::{Error, FileSystem, FsOptions};
use fatfs_io::BlockDevice as _;
use fatfs_io::MemoryDevice;

fn formatted(total_bytes: u64, label: Option<&str>) -> MemoryDevice {
    let dev = MemoryDevice::zeroed(total_bytes as usize);
    format(
        &dev,
        FormatOptions {
            total_bytes,
            volume_label: label,
            ..Default::default()
        },
    )
    .unwrap();
    dev
}

/// S1: a freshly formatted, labeled volume lists exactly the label.
#[test]
fn s1_fat12_image_lists_only_its_volume_label() {
    let dev = formatted(2 << 20, Some("FAT12TEST"));
    let fs = FileSystem::mount(&dev, FsOptions::default()).unwrap();
    assert_eq!(fs.geometry().fat_type, FatType::Fat12);
    assert_eq!(fs.volume_label().unwrap(), "FAT12TEST");
    // Volume labels are excluded from `list`; the root has no ordinary entries.
    assert!(fs.list("/").unwrap().is_empty());
}

/// S2: a long name round-trips case-insensitively across a remount, with
/// a generated `~1` short name and a single-record LFN chain.
#[test]
fn s2_long_name_round_trips_case_insensitively_across_remount() {
    let dev = formatted(64 << 20, None);
    {
        let fs = FileSystem::mount(&dev, FsOptions::default()).unwrap();
        assert_eq!(fs.geometry().fat_type, FatType::Fat32);
        fs.create_file("Hello World.txt").unwrap();
        fs.write_file("Hello World.txt", 0, b"hello\n").unwrap();
    }

    let fs = FileSystem::mount(&dev, FsOptions::default()).unwrap();
    let entry = fs.stat("hello world.txt").unwrap();
    assert_eq!(entry.size, 6);
    assert_eq!(entry.short_name.display(), "HELLO_~1.TXT");
    assert_eq!(entry.long_name.as_deref(), Some("Hello World.txt"));

    let mut buf = [0u8; 6];
    fs.read_file("hello world.txt", 0, &mut buf).unwrap();
    assert_eq!(&buf, b"hello\n");
}

/// S3: a large pseudo-random file survives a seek-and-read into the
/// middle of its third-plus megabyte.
#[test]
fn s3_large_file_byte_exact_at_an_arbitrary_offset() {
    let dev = formatted(64 << 20, None);
    let fs = FileSystem::mount(&dev, FsOptions::default()).unwrap();
    fs.create_file("big.bin").unwrap();

    let source = pseudo_random_bytes(42, 1 << 20);
    fs.write_file("big.bin", 0, &source).unwrap();

    let offset = 700_000usize;
    let len = 300_000usize;
    let mut buf = vec![0u8; len];
    fs.read_file("big.bin", offset as u64, &mut buf).unwrap();
    assert_eq!(buf, source[offset..offset + len]);
}

/// A small deterministic xorshift generator, so the scenario doesn't need
/// a `rand` dependency the rest of the crate has no other use for.
fn pseudo_random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed ^ 0x9E3779B97F4A7C15;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

/// S4: case-insensitive collisions are rejected, both across files and
/// between a file and a directory sharing a name.
#[test]
fn s4_name_collisions_are_rejected_case_insensitively_and_across_kinds() {
    let dev = formatted(32 << 20, None);
    let fs = FileSystem::mount(&dev, FsOptions::default()).unwrap();

    fs.create_file("A.TXT").unwrap();
    assert!(matches!(fs.create_file("a.txt"), Err(Error::AlreadyExists)));

    fs.create_dir("sub").unwrap();
    assert!(matches!(fs.create_file("sub"), Err(Error::AlreadyExists)));
}

/// S5: filling a small volume to `NoSpace`, then freeing half the files,
/// recovers exactly that much free space and a write that fits the
/// reclaimed amount succeeds again.
#[test]
fn s5_freeing_files_after_no_space_recovers_free_count() {
    let dev = formatted(2 << 20, None);
    let fs = FileSystem::mount(&dev, FsOptions::default()).unwrap();
    let geometry = fs.geometry();
    let payload = vec![0xABu8; geometry.bytes_per_cluster as usize];

    let mut created = Vec::new();
    loop {
        let name = format!("F{}.BIN", created.len());
        match fs.create_file(&name) {
            Ok(()) => {}
            Err(Error::NoSpace) => break,
            Err(e) => panic!("unexpected error while filling the volume: {e}"),
        }
        match fs.write_file(&name, 0, &payload) {
            Ok(_) => created.push(name),
            Err(Error::NoSpace) => {
                fs.remove_file(&name).unwrap();
                break;
            }
            Err(e) => panic!("unexpected error while filling the volume: {e}"),
        }
    }
    assert!(!created.is_empty(), "volume should fill within a couple MiB");

    let free_before = fs.free_bytes().unwrap();
    let half = created.len() / 2;
    for name in &created[..half.max(1)] {
        fs.remove_file(name).unwrap();
    }
    let free_after = fs.free_bytes().unwrap();
    assert!(free_after > free_before);

    // The reclaimed space is enough for at least one more cluster-sized file.
    fs.create_file("RECLAIM.BIN").unwrap();
    fs.write_file("RECLAIM.BIN", 0, &payload).unwrap();
}

/// S6: a corrupted LFN checksum degrades that one entry to its short name
/// only, without disturbing its siblings or failing the mount.
#[test]
fn s6_corrupted_lfn_checksum_degrades_one_entry_without_failing_mount() {
    let dev = formatted(32 << 20, None);
    {
        let fs = FileSystem::mount(&dev, FsOptions::default()).unwrap();
        fs.create_file("Long Name.txt").unwrap();
        fs.create_file("SHORT.TXT").unwrap();
    }

    let geometry = fatfs::boot_sector::read_geometry(&dev).unwrap();
    let fat = FatManager::new(&dev, geometry, false).unwrap();
    let root = fatfs::directory::Directory::root(&dev, geometry, &fat, false, true).unwrap();
    let before = root.find("Long Name.txt").unwrap().unwrap();
    assert!(before.long_name.is_some());

    // Flip a byte inside the LFN record's checksum field on disk directly.
    let start = geometry.sector_offset(geometry.root_dir_start_sector);
    let mut slot = [0u8; 32];
    dev.read_at(start, &mut slot).unwrap();
    slot[13] ^= 0xFF;
    dev.write_at(start, &slot).unwrap();

    let fs = FileSystem::mount(&dev, FsOptions::default()).unwrap();
    let listing = fs.list("/").unwrap();
    assert_eq!(listing.len(), 2);
    let degraded = listing
        .iter()
        .find(|e| e.long_name.is_none() && e.short_name.display() != "SHORT.TXT")
        .expect("the corrupted entry should still be present with only its short name");
    assert!(degraded.long_name.is_none());

    let untouched = listing.iter().find(|e| e.short_name.display() == "SHORT.TXT").unwrap();
    assert_eq!(untouched.name(), "SHORT.TXT");
}

#[test]
fn create_dir_remove_dir_and_rename_compose_across_a_real_file_backed_device() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let dev = fatfs_io_std::FileDevice::create(tmp.path(), 16 << 20).unwrap();
    format(&dev, FormatOptions { total_bytes: 16 << 20, ..Default::default() }).unwrap();

    {
        let fs = FileSystem::mount(&dev, FsOptions::default()).unwrap();
        fs.create_dir("a").unwrap();
        fs.create_file("a/note.txt").unwrap();
        fs.write_file("a/note.txt", 0, b"keep me").unwrap();
        fs.create_dir("b").unwrap();
        fs.rename("a/note.txt", "b/note.txt").unwrap();
        fs.remove_dir("a").unwrap();
    }

    let fs = FileSystem::mount(&dev, FsOptions::default()).unwrap();
    let mut buf = [0u8; 7];
    fs.read_file("b/note.txt", 0, &mut buf).unwrap();
    assert_eq!(&buf, b"keep me");
    assert!(fs.stat("a").is_err());
}

#[test]
fn attributes_roundtrip_through_read_only_flag() {
    let dev = formatted(32 << 20, None);
    let fs = FileSystem::mount(&dev, FsOptions::default()).unwrap();
    fs.create_file("plain.txt").unwrap();
    let entry = fs.stat("plain.txt").unwrap();
    assert!(entry.attributes.contains(Attributes::ARCHIVE));
    assert!(!entry.is_read_only());
}
