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

//! The File Allocation Table: entry get/set across the three bit widths,
//! chain walking, the free-cluster allocator, FSInfo maintenance, and the
//! dirty bit (spec §4.2).

use std::cell::Cell;
use std::collections::HashSet;

use fatfs_err::{Error, Result};
use fatfs_io::BlockDevice;
use log::{debug, trace, warn};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::boot_sector::{FatType, Geometry};

pub const FREE: u32 = 0x0000;
pub const RESERVED: u32 = 0x0001;
pub const FIRST_DATA_CLUSTER: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct FsInfoRaw {
    lead_signature: U32,
    reserved1: [u8; 480],
    struct_signature: U32,
    free_count: U32,
    next_free: U32,
    reserved2: [u8; 12],
    trail_signature: U32,
}

const FS_INFO_LEAD_SIGNATURE: u32 = 0x4161_5252;
const FS_INFO_STRUCT_SIGNATURE: u32 = 0x6141_7272;
const FS_INFO_TRAIL_SIGNATURE: u32 = 0xAA55_0000;

/// Owns all access to the on-disk File Allocation Table(s), including the
/// FAT32 FSInfo hint and the process-local free-count fallback FAT12/16
/// use in its place.
pub struct FatManager<'d> {
    device: &'d dyn BlockDevice,
    geometry: Geometry,
    read_only: bool,
    next_free_hint: Cell<u32>,
    free_count: Cell<Option<u32>>,
}

impl<'d> FatManager<'d> {
    pub fn new(device: &'d dyn BlockDevice, geometry: Geometry, read_only: bool) -> Result<Self> {
        let manager = FatManager {
            device,
            geometry,
            read_only,
            next_free_hint: Cell::new(FIRST_DATA_CLUSTER),
            free_count: Cell::new(None),
        };
        if geometry.fat_type == FatType::Fat32 && geometry.fs_info_sector != 0 {
            if let Ok((free_count, next_free)) = manager.read_fs_info() {
                if next_free >= FIRST_DATA_CLUSTER && next_free < geometry.cluster_count + 2 {
                    manager.next_free_hint.set(next_free);
                }
                manager.free_count.set(free_count);
            }
        }
        Ok(manager)
    }

    fn bits(&self) -> u32 {
        self.geometry.fat_type.bits()
    }

    fn entry_byte_offset(&self, cluster: u32) -> u64 {
        match self.geometry.fat_type {
            FatType::Fat12 => (cluster as u64 * 3) / 2,
            FatType::Fat16 => cluster as u64 * 2,
            FatType::Fat32 => cluster as u64 * 4,
        }
    }

    fn fat_copy_offset(&self, copy: u32, cluster: u32) -> u64 {
        self.geometry.sector_offset(
            self.geometry.fat_start_sector + copy * self.geometry.sectors_per_fat,
        ) + self.entry_byte_offset(cluster)
    }

    /// Reads the raw entry value for `cluster` from FAT copy 0.
    pub fn get(&self, cluster: u32) -> Result<u32> {
        let offset = self.fat_copy_offset(0, cluster);
        match self.geometry.fat_type {
            FatType::Fat12 => {
                let mut buf = [0u8; 2];
                self.device.read_at(offset, &mut buf)?;
                let word = u16::from_le_bytes(buf);
                Ok(if cluster % 2 == 0 {
                    (word & 0x0FFF) as u32
                } else {
                    (word >> 4) as u32
                })
            }
            FatType::Fat16 => {
                let mut buf = [0u8; 2];
                self.device.read_at(offset, &mut buf)?;
                Ok(u16::from_le_bytes(buf) as u32)
            }
            FatType::Fat32 => {
                let mut buf = [0u8; 4];
                self.device.read_at(offset, &mut buf)?;
                Ok(u32::from_le_bytes(buf) & 0x0FFF_FFFF)
            }
        }
    }

    /// Writes `value` for `cluster` to FAT copy 0 and mirrors it to every
    /// other copy (spec §4.2 "Mirror policy"). Preserves the sibling
    /// nibble for FAT12 and the reserved top 4 bits for FAT32.
    pub fn set(&self, cluster: u32, value: u32) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        for copy in 0..self.geometry.num_fats {
            let offset = self.fat_copy_offset(copy, cluster);
            match self.geometry.fat_type {
                FatType::Fat12 => {
                    let mut buf = [0u8; 2];
                    self.device.read_at(offset, &mut buf)?;
                    let mut word = u16::from_le_bytes(buf);
                    if cluster % 2 == 0 {
                        word = (word & 0xF000) | (value as u16 & 0x0FFF);
                    } else {
                        word = (word & 0x000F) | ((value as u16 & 0x0FFF) << 4);
                    }
                    self.device.write_at(offset, &word.to_le_bytes())?;
                }
                FatType::Fat16 => {
                    self.device
                        .write_at(offset, &(value as u16).to_le_bytes())?;
                }
                FatType::Fat32 => {
                    let mut buf = [0u8; 4];
                    self.device.read_at(offset, &mut buf)?;
                    let existing = u32::from_le_bytes(buf);
                    let merged = (existing & 0xF000_0000) | (value & 0x0FFF_FFFF);
                    self.device.write_at(offset, &merged.to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    pub fn is_end_of_chain(&self, entry: u32) -> bool {
        entry >= self.geometry.fat_type.end_of_chain_marker() - 7
    }

    pub fn is_bad_cluster(&self, entry: u32) -> bool {
        let bad = self.geometry.fat_type.bad_cluster_marker();
        entry >= bad && entry < bad + 8 && !self.is_end_of_chain(entry)
    }

    pub fn is_free(&self, entry: u32) -> bool {
        entry == FREE
    }

    /// Walks the chain starting at `start`, returning the cluster list.
    /// Rejects chains that loop or exceed `cluster_count` (spec §4.2).
    pub fn read_chain(&self, start: u32) -> Result<Vec<u32>> {
        let mut clusters = Vec::new();
        let mut seen = HashSet::new();
        let mut current = start;
        loop {
            if current < FIRST_DATA_CLUSTER || self.is_bad_cluster(current) {
                return Err(Error::Corrupt("cluster chain references an invalid cluster"));
            }
            if !seen.insert(current) {
                return Err(Error::Corrupt("cluster chain loops"));
            }
            clusters.push(current);
            if clusters.len() > self.geometry.cluster_count as usize {
                return Err(Error::Corrupt("cluster chain longer than cluster_count"));
            }
            let next = self.get(current)?;
            trace!("cluster {current} -> {next:#x}");
            if self.is_end_of_chain(next) {
                break;
            }
            current = next;
        }
        Ok(clusters)
    }

    /// Allocates `n` free clusters, linking them into a chain and
    /// updating the free-cluster hint. Rolls back every write it made if
    /// any individual write fails partway through (spec §4.2, atomicity).
    pub fn allocate(&self, n: usize) -> Result<Vec<u32>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let total = self.geometry.cluster_count + 2;
        let mut found = Vec::with_capacity(n);
        let start = self.next_free_hint.get().max(FIRST_DATA_CLUSTER);
        let mut cluster = start;
        let mut scanned = 0u32;
        while found.len() < n && scanned < total {
            if self.is_free(self.get(cluster)?) {
                found.push(cluster);
            }
            cluster += 1;
            if cluster >= total {
                cluster = FIRST_DATA_CLUSTER;
            }
            scanned += 1;
        }
        if found.len() < n {
            return Err(Error::NoSpace);
        }

        let mut written = Vec::with_capacity(found.len());
        let rollback = |written: &[u32]| {
            for &c in written {
                let _ = self.set(c, FREE);
            }
        };
        for (i, &c) in found.iter().enumerate() {
            let value = if i + 1 < found.len() {
                found[i + 1]
            } else {
                self.geometry.fat_type.end_of_chain_marker()
            };
            if let Err(e) = self.set(c, value) {
                rollback(&written);
                return Err(e);
            }
            written.push(c);
        }

        let last = *found.last().unwrap();
        self.next_free_hint.set(if last + 1 >= total {
            FIRST_DATA_CLUSTER
        } else {
            last + 1
        });
        if let Some(count) = self.free_count.get() {
            self.free_count.set(Some(count.saturating_sub(n as u32)));
        }
        self.flush_fs_info()?;
        debug!("allocated {n} cluster(s): {found:?}");
        Ok(found)
    }

    /// Frees every cluster in `chain`, updating the hint to the lowest
    /// freed cluster number (spec §4.2).
    pub fn free_chain(&self, chain: &[u32]) -> Result<()> {
        for &c in chain {
            self.set(c, FREE)?;
        }
        if let Some(&min) = chain.iter().min() {
            if min < self.next_free_hint.get() {
                self.next_free_hint.set(min);
            }
        }
        if let Some(count) = self.free_count.get() {
            self.free_count
                .set(Some(count + chain.len() as u32));
        }
        self.flush_fs_info()?;
        Ok(())
    }

    fn fs_info_offset(&self) -> u64 {
        self.geometry.sector_offset(self.geometry.fs_info_sector)
    }

    fn read_fs_info(&self) -> Result<(Option<u32>, u32)> {
        let mut raw = [0u8; 512];
        self.device.read_at(self.fs_info_offset(), &mut raw)?;
        let info = FsInfoRaw::read_from_bytes(&raw)
            .map_err(|_| Error::Corrupt("FSInfo sector truncated"))?;
        if info.lead_signature.get() != FS_INFO_LEAD_SIGNATURE
            || info.struct_signature.get() != FS_INFO_STRUCT_SIGNATURE
            || info.trail_signature.get() != FS_INFO_TRAIL_SIGNATURE
        {
            warn!("FSInfo signatures invalid, ignoring advisory hints");
            return Ok((None, FIRST_DATA_CLUSTER));
        }
        let free_count = info.free_count.get();
        Ok((
            if free_count == 0xFFFF_FFFF {
                None
            } else {
                Some(free_count)
            },
            info.next_free.get(),
        ))
    }

    fn flush_fs_info(&self) -> Result<()> {
        if self.geometry.fat_type != FatType::Fat32
            || self.geometry.fs_info_sector == 0
            || self.read_only
        {
            return Ok(());
        }
        let info = FsInfoRaw {
            lead_signature: U32::new(FS_INFO_LEAD_SIGNATURE),
            reserved1: [0u8; 480],
            struct_signature: U32::new(FS_INFO_STRUCT_SIGNATURE),
            free_count: U32::new(self.free_count.get().unwrap_or(0xFFFF_FFFF)),
            next_free: U32::new(self.next_free_hint.get()),
            reserved2: [0u8; 12],
            trail_signature: U32::new(FS_INFO_TRAIL_SIGNATURE),
        };
        self.device.write_at(self.fs_info_offset(), info.as_bytes())?;
        Ok(())
    }

    /// Recomputes the free-cluster count by scanning the whole table.
    /// Used when the FSInfo hint is absent or found to mismatch.
    pub fn recompute_free_count(&self) -> Result<u32> {
        let total = self.geometry.cluster_count + 2;
        let mut free = 0;
        for cluster in FIRST_DATA_CLUSTER..total {
            if self.is_free(self.get(cluster)?) {
                free += 1;
            }
        }
        self.free_count.set(Some(free));
        self.flush_fs_info()?;
        Ok(free)
    }

    pub fn free_count(&self) -> Result<u32> {
        match self.free_count.get() {
            Some(count) => Ok(count),
            None => self.recompute_free_count(),
        }
    }

    /// Entry-1 dirty bit (spec §4.2): high bit for FAT16, bit 27 for
    /// FAT32. FAT12 has no dirty bit.
    pub fn set_dirty(&self, dirty: bool) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let mask = match self.geometry.fat_type {
            FatType::Fat12 => return Ok(()),
            FatType::Fat16 => 0x8000,
            FatType::Fat32 => 0x0800_0000,
        };
        let current = self.get(1)?;
        let updated = if dirty { current & !mask } else { current | mask };
        self.set(1, updated)
    }

    pub fn is_dirty(&self) -> Result<bool> {
        let mask = match self.geometry.fat_type {
            FatType::Fat12 => return Ok(false),
            FatType::Fat16 => 0x8000,
            FatType::Fat32 => 0x0800_0000,
        };
        Ok(self.get(1)? & mask == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_sector::FatType;
    use fatfs_io::MemoryDevice;

    fn geometry(fat_type: FatType, cluster_count: u32) -> Geometry {
        Geometry {
            bytes_per_sector: 512,
            sectors_per_cluster: 1,
            bytes_per_cluster: 512,
            reserved_sectors: 1,
            num_fats: 2,
            sectors_per_fat: 4,
            root_entry_count: 16,
            root_cluster: 0,
            total_sectors: 200,
            fat_start_sector: 1,
            root_dir_start_sector: 9,
            data_start_sector: 10,
            cluster_count,
            fat_type,
            fs_info_sector: 0,
            media: 0xF8,
            volume_label: *b"NO NAME    ",
        }
    }

    #[test]
    fn fat16_chain_walk_and_allocate() {
        let geo = geometry(FatType::Fat16, 100);
        let dev = MemoryDevice::zeroed(200 * 512);
        let fat = FatManager::new(&dev, geo, false).unwrap();

        let chain = fat.allocate(3).unwrap();
        assert_eq!(chain.len(), 3);
        for w in chain.windows(2) {
            assert_eq!(fat.get(w[0]).unwrap(), w[1]);
        }
        assert!(fat.is_end_of_chain(fat.get(*chain.last().unwrap()).unwrap()));

        let walked = fat.read_chain(chain[0]).unwrap();
        assert_eq!(walked, chain);

        fat.free_chain(&chain).unwrap();
        for &c in &chain {
            assert!(fat.is_free(fat.get(c).unwrap()));
        }
    }

    #[test]
    fn fat12_straddles_bytes_correctly() {
        let geo = geometry(FatType::Fat12, 100);
        let dev = MemoryDevice::zeroed(200 * 512);
        let fat = FatManager::new(&dev, geo, false).unwrap();

        fat.set(2, 0x345).unwrap();
        fat.set(3, 0x678).unwrap();
        assert_eq!(fat.get(2).unwrap(), 0x345);
        assert_eq!(fat.get(3).unwrap(), 0x678);
    }

    #[test]
    fn allocate_fails_with_no_space_and_leaves_fat_unchanged() {
        let geo = geometry(FatType::Fat16, 2);
        let dev = MemoryDevice::zeroed(200 * 512);
        let fat = FatManager::new(&dev, geo, false).unwrap();
        assert!(matches!(fat.allocate(10), Err(Error::NoSpace)));
    }

    #[test]
    fn detects_looping_chains() {
        let geo = geometry(FatType::Fat16, 100);
        let dev = MemoryDevice::zeroed(200 * 512);
        let fat = FatManager::new(&dev, geo, false).unwrap();
        fat.set(2, 3).unwrap();
        fat.set(3, 2).unwrap();
        assert!(matches!(fat.read_chain(2), Err(Error::Corrupt(_))));
    }
}
