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

//! Boot sector / BPB parsing and geometry derivation (spec §4.1).
//!
//! The donor's `BootSector` struct flattened the FAT32 extended BPB into
//! one layout and used it unconditionally; that's only byte-correct for
//! FAT32 media. Here the common 36-byte BPB prefix is split from the two
//! mutually exclusive extension shapes (FAT12/16's 26-byte extended boot
//! record, FAT32's 54-byte extension) so both families parse correctly.

use fatfs_err::{Error, Result};
use fatfs_io::BlockDevice;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const SECTOR_MAGIC: [u8; 2] = [0x55, 0xAA];

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BootSectorCommon {
    pub bs_jmpboot: [u8; 3],
    pub bs_oemname: [u8; 8],
    pub bpb_bytspersec: U16,
    pub bpb_secperclus: u8,
    pub bpb_rsvdseccnt: U16,
    pub bpb_numfats: u8,
    pub bpb_rootentcnt: U16,
    pub bpb_totsec16: U16,
    pub bpb_media: u8,
    pub bpb_fatsz16: U16,
    pub bpb_secpertrk: U16,
    pub bpb_numheads: U16,
    pub bpb_hiddsec: U32,
    pub bpb_totsec32: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BootSectorFat1216 {
    pub common: BootSectorCommon,
    pub bs_drvnum: u8,
    pub bs_reserved1: u8,
    pub bs_bootsig: u8,
    pub bs_volid: U32,
    pub bs_vollab: [u8; 11],
    pub bs_filsystype: [u8; 8],
    pub boot_code: [u8; 448],
    pub signature_word: [u8; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BootSectorFat32 {
    pub common: BootSectorCommon,
    pub bpb_fatsz32: U32,
    pub bpb_extflags: U16,
    pub bpb_fsver: U16,
    pub bpb_rootclus: U32,
    pub bpb_fsinfo: U16,
    pub bpb_bkbootsec: U16,
    pub bpb_reserved: [u8; 12],
    pub bs_drvnum: u8,
    pub bs_reserved1: u8,
    pub bs_bootsig: u8,
    pub bs_volid: U32,
    pub bs_vollab: [u8; 11],
    pub bs_filsystype: [u8; 8],
    pub boot_code: [u8; 420],
    pub signature_word: [u8; 2],
}

const _: () = assert!(core::mem::size_of::<BootSectorFat1216>() == 512);
const _: () = assert!(core::mem::size_of::<BootSectorFat32>() == 512);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    pub fn from_cluster_count(cluster_count: u32) -> FatType {
        if cluster_count < 4085 {
            FatType::Fat12
        } else if cluster_count < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            FatType::Fat12 => 12,
            FatType::Fat16 => 16,
            FatType::Fat32 => 28,
        }
    }

    pub fn end_of_chain_marker(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFFFFFF,
        }
    }

    pub fn bad_cluster_marker(self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF7,
            FatType::Fat16 => 0xFFF7,
            FatType::Fat32 => 0x0FFFFFF7,
        }
    }
}

/// Fully-derived, immutable geometry of a mounted volume (spec §3).
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub bytes_per_cluster: u32,
    pub reserved_sectors: u32,
    pub num_fats: u32,
    pub sectors_per_fat: u32,
    pub root_entry_count: u32,
    pub root_cluster: u32,
    pub total_sectors: u32,
    pub fat_start_sector: u32,
    pub root_dir_start_sector: u32,
    pub data_start_sector: u32,
    pub cluster_count: u32,
    pub fat_type: FatType,
    pub fs_info_sector: u32,
    pub media: u8,
    pub volume_label: [u8; 11],
}

impl Geometry {
    pub fn data_offset(&self, cluster: u32) -> u64 {
        let cluster_index = (cluster - 2) as u64;
        self.sector_offset(self.data_start_sector) + cluster_index * self.bytes_per_cluster as u64
    }

    pub fn sector_offset(&self, sector: u32) -> u64 {
        sector as u64 * self.bytes_per_sector as u64
    }

    pub fn root_dir_bytes(&self) -> u32 {
        self.root_entry_count * 32
    }
}

fn is_power_of_two(value: u32) -> bool {
    value != 0 && value & (value - 1) == 0
}

/// Reads and validates the boot sector at the start of `device`, deriving
/// the volume's [`Geometry`] (spec §4.1).
pub fn read_geometry(device: &dyn BlockDevice) -> Result<Geometry> {
    let mut raw = [0u8; 512];
    device.read_at(0, &mut raw)?;

    if raw[510..512] != SECTOR_MAGIC {
        return Err(Error::Corrupt("boot sector missing 0x55AA signature"));
    }

    let common = BootSectorCommon::read_from_bytes(&raw[..36])
        .map_err(|_| Error::Corrupt("boot sector too short"))?;

    let bytes_per_sector = common.bpb_bytspersec.get() as u32;
    if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
        return Err(Error::Corrupt("bytes_per_sector out of range"));
    }
    let sectors_per_cluster = common.bpb_secperclus as u32;
    if !is_power_of_two(sectors_per_cluster) || sectors_per_cluster > 128 {
        return Err(Error::Corrupt("sectors_per_cluster not a power of two"));
    }
    let reserved_sectors = common.bpb_rsvdseccnt.get() as u32;
    if reserved_sectors == 0 {
        return Err(Error::Corrupt("reserved_sectors is zero"));
    }
    let num_fats = common.bpb_numfats as u32;
    if num_fats == 0 {
        return Err(Error::Corrupt("num_fats is zero"));
    }
    let root_entry_count = common.bpb_rootentcnt.get() as u32;

    let total_sectors = if common.bpb_totsec16.get() != 0 {
        common.bpb_totsec16.get() as u32
    } else {
        common.bpb_totsec32.get()
    };

    let is_fat32_shaped = common.bpb_fatsz16.get() == 0;
    let (sectors_per_fat, root_cluster, fs_info_sector, bs_vollab) = if is_fat32_shaped {
        if root_entry_count != 0 {
            return Err(Error::Corrupt(
                "FAT32 volume must have root_entry_count == 0",
            ));
        }
        let fat32 = BootSectorFat32::read_from_bytes(&raw)
            .map_err(|_| Error::Corrupt("boot sector too short for FAT32 extension"))?;
        (
            fat32.bpb_fatsz32.get(),
            fat32.bpb_rootclus.get(),
            fat32.bpb_fsinfo.get() as u32,
            fat32.bs_vollab,
        )
    } else {
        if root_entry_count == 0 {
            return Err(Error::Corrupt(
                "FAT12/16 volume must have root_entry_count > 0",
            ));
        }
        let fat1216 = BootSectorFat1216::read_from_bytes(&raw)
            .map_err(|_| Error::Corrupt("boot sector too short for FAT12/16 extension"))?;
        (common.bpb_fatsz16.get() as u32, 0u32, 0u32, fat1216.bs_vollab)
    };

    if sectors_per_fat == 0 {
        return Err(Error::Corrupt("sectors_per_fat is zero"));
    }

    let fat_start_sector = reserved_sectors;
    let root_dir_start_sector = fat_start_sector + num_fats * sectors_per_fat;
    let root_dir_sectors =
        (root_entry_count * 32).div_ceil(bytes_per_sector);
    let data_start_sector = root_dir_start_sector + root_dir_sectors;

    if total_sectors < data_start_sector {
        return Err(Error::Corrupt("total_sectors smaller than data region start"));
    }
    let cluster_count = (total_sectors - data_start_sector) / sectors_per_cluster;

    let fat_type = FatType::from_cluster_count(cluster_count);
    if fat_type == FatType::Fat32 && !is_fat32_shaped {
        log::warn!(
            "cluster count ({cluster_count}) implies FAT32 but the BPB is shaped like FAT12/16; trusting cluster count"
        );
    }

    Ok(Geometry {
        bytes_per_sector,
        sectors_per_cluster,
        bytes_per_cluster: bytes_per_sector * sectors_per_cluster,
        reserved_sectors,
        num_fats,
        sectors_per_fat,
        root_entry_count,
        root_cluster: if fat_type == FatType::Fat32 {
            root_cluster.max(2)
        } else {
            0
        },
        total_sectors,
        fat_start_sector,
        root_dir_start_sector,
        data_start_sector,
        cluster_count,
        fat_type,
        fs_info_sector,
        media: common.bpb_media,
        volume_label: bs_vollab,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fatfs_io::MemoryDevice;

    fn minimal_fat16_boot_sector() -> [u8; 512] {
        let mut sector = [0u8; 512];
        sector[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        sector[3..11].copy_from_slice(b"MSDOS5.0");
        sector[11..13].copy_from_slice(&512u16.to_le_bytes()); // bytes/sector
        sector[13] = 4; // sectors/cluster
        sector[14..16].copy_from_slice(&1u16.to_le_bytes()); // reserved
        sector[16] = 2; // num fats
        sector[17..19].copy_from_slice(&512u16.to_le_bytes()); // root entries
        sector[19..21].copy_from_slice(&20000u16.to_le_bytes()); // total sectors 16
        sector[21] = 0xF8;
        sector[22..24].copy_from_slice(&32u16.to_le_bytes()); // sectors per fat 16
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    #[test]
    fn parses_a_fat16_boot_sector() {
        let dev = MemoryDevice::from_vec(minimal_fat16_boot_sector().to_vec());
        let geometry = read_geometry(&dev).unwrap();
        assert_eq!(geometry.bytes_per_sector, 512);
        assert_eq!(geometry.sectors_per_cluster, 4);
        assert_eq!(geometry.fat_type, FatType::Fat16);
    }

    #[test]
    fn rejects_missing_signature() {
        let mut raw = minimal_fat16_boot_sector();
        raw[510] = 0;
        let dev = MemoryDevice::from_vec(raw.to_vec());
        assert!(read_geometry(&dev).is_err());
    }
}
