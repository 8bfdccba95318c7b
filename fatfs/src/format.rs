// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `mkfs`: lays down a fresh boot sector, FAT copies, FSInfo sector (FAT32
//! only), and root directory (spec §4.6). The device passed in already
//! represents whatever sub-range the caller mounted at (see
//! `FsOptions::offset`); every write here is relative to byte 0 of it.

use fatfs_err::{Error, Result};
use fatfs_io::BlockDevice;
use zerocopy::little_endian::{U16, U32};
use zerocopy::IntoBytes;

use crate::boot_sector::{BootSectorCommon, BootSectorFat1216, BootSectorFat32, FatType, Geometry, SECTOR_MAGIC};
use crate::dir_entry::{self, Attributes, EightDotThree};
use crate::time::Timestamp;

pub struct FormatOptions<'a> {
    pub total_bytes: u64,
    pub bytes_per_sector: u16,
    pub volume_label: Option<&'a str>,
    pub created: Timestamp,
}

impl Default for FormatOptions<'_> {
    fn default() -> Self {
        FormatOptions {
            total_bytes: 0,
            bytes_per_sector: 512,
            volume_label: None,
            created: Timestamp::default(),
        }
    }
}

/// Default cluster size table, following the same size bands most FAT
/// formatters use (spec §4.6).
fn default_sectors_per_cluster(total_bytes: u64, bytes_per_sector: u32) -> u32 {
    let spc = if total_bytes <= 1 << 20 {
        1
    } else if total_bytes <= 16 << 20 {
        2
    } else if total_bytes <= 128 << 20 {
        4
    } else if total_bytes <= 256 << 20 {
        8
    } else if total_bytes <= 512 << 20 {
        16
    } else if total_bytes <= 2 << 30 {
        32
    } else if total_bytes <= 16 << 30 {
        64
    } else {
        128
    };
    // Keep bytes-per-cluster from exceeding 64KiB even on oversized sectors.
    let max_spc = (65536 / bytes_per_sector).max(1);
    spc.min(max_spc)
}

fn compute_sectors_per_fat(
    total_sectors: u32,
    reserved_sectors: u32,
    num_fats: u32,
    root_dir_sectors: u32,
    sectors_per_cluster: u32,
    bytes_per_sector: u32,
    bits_per_entry: u32,
) -> u32 {
    let mut sectors_per_fat = 1u32;
    for _ in 0..16 {
        let non_fat = reserved_sectors + root_dir_sectors;
        let fat_sectors_total = num_fats * sectors_per_fat;
        let data_sectors = total_sectors.saturating_sub(non_fat + fat_sectors_total);
        let cluster_count = data_sectors / sectors_per_cluster;
        let entries_needed = cluster_count as u64 + 2;
        let fat_bytes = (entries_needed * bits_per_entry as u64).div_ceil(8);
        let new_spf = ((fat_bytes as u32).div_ceil(bytes_per_sector)).max(1);
        if new_spf == sectors_per_fat {
            break;
        }
        sectors_per_fat = new_spf;
    }
    sectors_per_fat
}

/// Formats `device` as a fresh FAT volume, returning the resulting
/// [`Geometry`] (spec §4.6).
pub fn format(device: &dyn BlockDevice, options: FormatOptions) -> Result<Geometry> {
    let bytes_per_sector = options.bytes_per_sector as u32;
    if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
        return Err(Error::InvalidArg("bytes_per_sector must be a power of two in 512..=4096"));
    }
    let total_sectors = (options.total_bytes / bytes_per_sector as u64) as u32;
    if total_sectors < 64 {
        return Err(Error::InvalidArg("device too small to hold a FAT volume"));
    }

    let num_fats = 2u32;
    let sectors_per_cluster = default_sectors_per_cluster(options.total_bytes, bytes_per_sector);

    // First pass: guess the family from raw size, lay out accordingly,
    // then let the actual cluster count have the final say (spec §4.1's
    // cluster-count rule is authoritative, not the on-disk family hint).
    let mut root_entry_count: u32 = if options.total_bytes < 512 << 20 { 512 } else { 0 };
    let mut reserved_sectors = if root_entry_count == 0 { 32 } else { 1 };

    let (sectors_per_fat, cluster_count, fat_type) = loop {
        let root_dir_sectors = (root_entry_count * 32).div_ceil(bytes_per_sector);
        let bits_guess = if root_entry_count == 0 { 28 } else { 16 };
        let spf = compute_sectors_per_fat(
            total_sectors,
            reserved_sectors,
            num_fats,
            root_dir_sectors,
            sectors_per_cluster,
            bytes_per_sector,
            bits_guess,
        );
        let data_sectors = total_sectors.saturating_sub(reserved_sectors + num_fats * spf + root_dir_sectors);
        let clusters = data_sectors / sectors_per_cluster;
        let actual = FatType::from_cluster_count(clusters);
        let wants_fat32 = actual == FatType::Fat32;
        if wants_fat32 == (root_entry_count == 0) {
            break (spf, clusters, actual);
        }
        // Family guess was wrong; flip layout assumptions and retry once.
        root_entry_count = if wants_fat32 { 0 } else { 512 };
        reserved_sectors = if wants_fat32 { 32 } else { 1 };
    };

    if cluster_count < 1 {
        return Err(Error::InvalidArg("device too small to hold any data clusters"));
    }

    let fat_start_sector = reserved_sectors;
    let root_dir_sectors = (root_entry_count * 32).div_ceil(bytes_per_sector);
    let root_dir_start_sector = fat_start_sector + num_fats * sectors_per_fat;
    let data_start_sector = root_dir_start_sector + root_dir_sectors;
    let fs_info_sector = if fat_type == FatType::Fat32 { 1 } else { 0 };
    let root_cluster = if fat_type == FatType::Fat32 { 2 } else { 0 };

    let volume_label = encode_volume_label(options.volume_label);

    write_boot_sector(
        device,
        fat_type,
        bytes_per_sector,
        sectors_per_cluster,
        reserved_sectors,
        num_fats,
        root_entry_count,
        total_sectors,
        sectors_per_fat,
        root_cluster,
        fs_info_sector,
        volume_label,
    )?;

    zero_fat_region(device, fat_type, fat_start_sector, num_fats, sectors_per_fat, bytes_per_sector)?;

    if fat_type == FatType::Fat32 {
        write_fs_info(device, fs_info_sector, bytes_per_sector, cluster_count)?;
        let bytes_per_cluster = bytes_per_sector * sectors_per_cluster;
        let zeros = vec![0u8; bytes_per_cluster as usize];
        device.write_at(root_cluster_offset(data_start_sector, bytes_per_sector), &zeros)?;
        // Root cluster itself is the end of its own (single-cluster) chain.
        set_fat32_entry(device, fat_start_sector, bytes_per_sector, root_cluster, FatType::Fat32.end_of_chain_marker(), num_fats, sectors_per_fat)?;
    } else {
        let zeros = vec![0u8; (root_entry_count * 32) as usize];
        device.write_at(
            root_dir_start_sector as u64 * bytes_per_sector as u64,
            &zeros,
        )?;
    }

    let geometry = Geometry {
        bytes_per_sector,
        sectors_per_cluster,
        bytes_per_cluster: bytes_per_sector * sectors_per_cluster,
        reserved_sectors,
        num_fats,
        sectors_per_fat,
        root_entry_count,
        root_cluster,
        total_sectors,
        fat_start_sector,
        root_dir_start_sector,
        data_start_sector,
        cluster_count,
        fat_type,
        fs_info_sector,
        media: 0xF8,
        volume_label,
    };

    if options.volume_label.is_some_and(|s| !s.is_empty()) {
        write_volume_label_entry(device, &geometry, options.created)?;
    }

    Ok(geometry)
}

pub(crate) fn encode_volume_label(label: Option<&str>) -> [u8; 11] {
    let mut raw = [b' '; 11];
    if let Some(label) = label {
        for (i, c) in label.chars().take(11).enumerate() {
            raw[i] = crate::oem::encode(c.to_ascii_uppercase()).unwrap_or(b'_');
        }
    }
    raw
}

#[allow(clippy::too_many_arguments)]
fn write_boot_sector(
    device: &dyn BlockDevice,
    fat_type: FatType,
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    reserved_sectors: u32,
    num_fats: u32,
    root_entry_count: u32,
    total_sectors: u32,
    sectors_per_fat: u32,
    root_cluster: u32,
    fs_info_sector: u32,
    volume_label: [u8; 11],
) -> Result<()> {
    let common = BootSectorCommon {
        bs_jmpboot: [0xEB, 0x3C, 0x90],
        bs_oemname: *b"FATFS4.0",
        bpb_bytspersec: U16::new(bytes_per_sector as u16),
        bpb_secperclus: sectors_per_cluster as u8,
        bpb_rsvdseccnt: U16::new(reserved_sectors as u16),
        bpb_numfats: num_fats as u8,
        bpb_rootentcnt: U16::new(root_entry_count as u16),
        bpb_totsec16: if total_sectors <= u16::MAX as u32 { U16::new(total_sectors as u16) } else { U16::new(0) },
        bpb_media: 0xF8,
        bpb_fatsz16: if fat_type == FatType::Fat32 { U16::new(0) } else { U16::new(sectors_per_fat as u16) },
        bpb_secpertrk: U16::new(0),
        bpb_numheads: U16::new(0),
        bpb_hiddsec: U32::new(0),
        bpb_totsec32: if total_sectors > u16::MAX as u32 { U32::new(total_sectors) } else { U32::new(0) },
    };

    let mut sector = [0u8; 512];
    if fat_type == FatType::Fat32 {
        let boot = BootSectorFat32 {
            common,
            bpb_fatsz32: U32::new(sectors_per_fat),
            bpb_extflags: U16::new(0),
            bpb_fsver: U16::new(0),
            bpb_rootclus: U32::new(root_cluster),
            bpb_fsinfo: U16::new(fs_info_sector as u16),
            bpb_bkbootsec: U16::new(0),
            bpb_reserved: [0u8; 12],
            bs_drvnum: 0x80,
            bs_reserved1: 0,
            bs_bootsig: 0x29,
            bs_volid: U32::new(0),
            bs_vollab: volume_label,
            bs_filsystype: *b"FAT32   ",
            boot_code: [0u8; 420],
            signature_word: [0x55, 0xAA],
        };
        sector.copy_from_slice(boot.as_bytes());
    } else {
        let label = if fat_type == FatType::Fat12 { *b"FAT12   " } else { *b"FAT16   " };
        let boot = BootSectorFat1216 {
            common,
            bs_drvnum: 0x80,
            bs_reserved1: 0,
            bs_bootsig: 0x29,
            bs_volid: U32::new(0),
            bs_vollab: volume_label,
            bs_filsystype: label,
            boot_code: [0u8; 448],
            signature_word: [0x55, 0xAA],
        };
        sector.copy_from_slice(boot.as_bytes());
    }
    debug_assert_eq!(sector[510..512], SECTOR_MAGIC);
    device.write_at(0, &sector)
}

fn zero_fat_region(
    device: &dyn BlockDevice,
    fat_type: FatType,
    fat_start_sector: u32,
    num_fats: u32,
    sectors_per_fat: u32,
    bytes_per_sector: u32,
) -> Result<()> {
    let fat_bytes = (sectors_per_fat * bytes_per_sector) as usize;
    let mut fat_image = vec![0u8; fat_bytes];
    // Entries 0 and 1 are reserved: entry 0 holds the media descriptor in
    // its low byte, entry 1 is written all-ones here, which sets the
    // clean-shutdown/hard-error bits to their clean state (1 = clean,
    // matching the convention `FatManager::is_dirty` reads against).
    match fat_type {
        FatType::Fat12 => {
            fat_image[0] = 0xF8;
            fat_image[1] = 0xFF;
            fat_image[2] = 0xFF;
        }
        FatType::Fat16 => {
            fat_image[0..2].copy_from_slice(&0xFFF8u16.to_le_bytes());
            fat_image[2..4].copy_from_slice(&0xFFFFu16.to_le_bytes());
        }
        FatType::Fat32 => {
            fat_image[0..4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
            fat_image[4..8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        }
    }
    for copy in 0..num_fats {
        let offset = (fat_start_sector + copy * sectors_per_fat) as u64 * bytes_per_sector as u64;
        device.write_at(offset, &fat_image)?;
    }
    Ok(())
}

fn set_fat32_entry(
    device: &dyn BlockDevice,
    fat_start_sector: u32,
    bytes_per_sector: u32,
    cluster: u32,
    value: u32,
    num_fats: u32,
    sectors_per_fat: u32,
) -> Result<()> {
    for copy in 0..num_fats {
        let offset = (fat_start_sector + copy * sectors_per_fat) as u64 * bytes_per_sector as u64
            + cluster as u64 * 4;
        device.write_at(offset, &(value & 0x0FFF_FFFF).to_le_bytes())?;
    }
    Ok(())
}

fn root_cluster_offset(data_start_sector: u32, bytes_per_sector: u32) -> u64 {
    data_start_sector as u64 * bytes_per_sector as u64
}

fn write_fs_info(device: &dyn BlockDevice, fs_info_sector: u32, bytes_per_sector: u32, cluster_count: u32) -> Result<()> {
    let mut sector = [0u8; 512];
    sector[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
    sector[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
    // One cluster (the root's) is already in use.
    sector[488..492].copy_from_slice(&(cluster_count.saturating_sub(1)).to_le_bytes());
    sector[492..496].copy_from_slice(&3u32.to_le_bytes());
    sector[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
    device.write_at(fs_info_sector as u64 * bytes_per_sector as u64, &sector)
}

fn write_volume_label_entry(device: &dyn BlockDevice, geometry: &Geometry, created: Timestamp) -> Result<()> {
    let short = EightDotThree {
        base: geometry.volume_label[..8].try_into().unwrap(),
        ext: geometry.volume_label[8..11].try_into().unwrap(),
        base_lower: false,
        ext_lower: false,
    };
    let slots = dir_entry::encode_entry(
        short,
        None,
        Attributes::VOLUME_ID,
        0,
        0,
        created,
        created,
        created,
    );
    let mut buf = vec![0u8; 32];
    buf.copy_from_slice(&slots[0]);
    let offset = if geometry.fat_type == FatType::Fat32 {
        root_cluster_offset(geometry.data_start_sector, geometry.bytes_per_sector)
    } else {
        geometry.root_dir_start_sector as u64 * geometry.bytes_per_sector as u64
    };
    device.write_at(offset, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_sector::read_geometry;
    use fatfs_io::MemoryDevice;

    #[test]
    fn formats_a_small_volume_as_fat16() {
        let total = 32u64 << 20; // 32MiB
        let dev = MemoryDevice::zeroed(total as usize);
        let geometry = format(
            &dev,
            FormatOptions {
                total_bytes: total,
                volume_label: Some("TESTVOL"),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(geometry.fat_type, FatType::Fat16);

        let reread = read_geometry(&dev).unwrap();
        assert_eq!(reread.fat_type, FatType::Fat16);
        assert_eq!(reread.cluster_count, geometry.cluster_count);
    }

    #[test]
    fn formats_a_large_volume_as_fat32() {
        let total = 1u64 << 30; // 1GiB
        let dev = MemoryDevice::zeroed(total as usize);
        let geometry = format(&dev, FormatOptions { total_bytes: total, ..Default::default() }).unwrap();
        assert_eq!(geometry.fat_type, FatType::Fat32);
        assert_eq!(geometry.root_cluster, 2);

        let reread = read_geometry(&dev).unwrap();
        assert_eq!(reread.fat_type, FatType::Fat32);
    }

    #[test]
    fn rejects_a_device_too_small_to_format() {
        let dev = MemoryDevice::zeroed(4096);
        let result = format(&dev, FormatOptions { total_bytes: 4096, ..Default::default() });
        assert!(result.is_err());
    }
}
