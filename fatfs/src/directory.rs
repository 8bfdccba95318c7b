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

//! Directory tree traversal (spec §4.4): the FAT12/16 fixed-size root
//! region versus the cluster-chain region every other directory (including
//! the FAT32 root) uses, entry insertion/removal preserving slot order,
//! and `.`/`..` bootstrapping for freshly created subdirectories.

use std::cell::RefCell;

use fatfs_err::{Error, Result};
use fatfs_io::BlockDevice;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, IntoBytes};

use crate::boot_sector::Geometry;
use crate::dir_entry::{
    self, make_8dot3, Attributes, DirEntry, EightDotThree, RawShortEntry, ScannedEntry, SLOT_SIZE,
};
use crate::fat::FatManager;
use crate::time::{DosDate, Timestamp};

#[derive(Debug, Clone, Copy)]
enum Region {
    FixedRoot,
    Chain(u32),
}

/// A single directory's entry list, backed either by the FAT12/16 fixed
/// root region or by a cluster chain (spec §4.4).
pub struct Directory<'d> {
    device: &'d dyn BlockDevice,
    geometry: Geometry,
    fat: &'d FatManager<'d>,
    region: Region,
    read_only: bool,
    cache: RefCell<Option<Vec<ScannedEntry>>>,
}

impl<'d> Directory<'d> {
    fn new(
        device: &'d dyn BlockDevice,
        geometry: Geometry,
        fat: &'d FatManager<'d>,
        read_only: bool,
        region: Region,
        lazy: bool,
    ) -> Result<Self> {
        let dir = Directory {
            device,
            geometry,
            fat,
            region,
            read_only,
            cache: RefCell::new(None),
        };
        if !lazy {
            dir.entries()?;
        }
        Ok(dir)
    }

    pub fn root(
        device: &'d dyn BlockDevice,
        geometry: Geometry,
        fat: &'d FatManager<'d>,
        read_only: bool,
        lazy: bool,
    ) -> Result<Self> {
        let region = if geometry.fat_type == crate::boot_sector::FatType::Fat32 {
            Region::Chain(geometry.root_cluster)
        } else {
            Region::FixedRoot
        };
        Directory::new(device, geometry, fat, read_only, region, lazy)
    }

    pub fn open(
        device: &'d dyn BlockDevice,
        geometry: Geometry,
        fat: &'d FatManager<'d>,
        read_only: bool,
        lazy: bool,
        first_cluster: u32,
    ) -> Result<Self> {
        Directory::new(device, geometry, fat, read_only, Region::Chain(first_cluster), lazy)
    }

    fn chunk(buf: &[u8]) -> Vec<[u8; SLOT_SIZE]> {
        buf.chunks_exact(SLOT_SIZE)
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    fn read_all_slots(&self) -> Result<Vec<[u8; SLOT_SIZE]>> {
        match self.region {
            Region::FixedRoot => {
                let start = self.geometry.sector_offset(self.geometry.root_dir_start_sector);
                let mut buf = vec![0u8; self.geometry.root_dir_bytes() as usize];
                self.device.read_at(start, &mut buf)?;
                Ok(Self::chunk(&buf))
            }
            Region::Chain(first) => {
                let chain = self.fat.read_chain(first)?;
                let mut buf = Vec::with_capacity(chain.len() * self.geometry.bytes_per_cluster as usize);
                for &c in &chain {
                    let mut cbuf = vec![0u8; self.geometry.bytes_per_cluster as usize];
                    self.device.read_at(self.geometry.data_offset(c), &mut cbuf)?;
                    buf.extend_from_slice(&cbuf);
                }
                Ok(Self::chunk(&buf))
            }
        }
    }

    fn write_all_slots(&self, slots: &[[u8; SLOT_SIZE]]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        match self.region {
            Region::FixedRoot => {
                let capacity = self.geometry.root_entry_count as usize;
                if slots.len() > capacity {
                    return Err(Error::NoSpace);
                }
                let start = self.geometry.sector_offset(self.geometry.root_dir_start_sector);
                let mut buf = vec![0u8; self.geometry.root_dir_bytes() as usize];
                for (i, s) in slots.iter().enumerate() {
                    buf[i * SLOT_SIZE..(i + 1) * SLOT_SIZE].copy_from_slice(s);
                }
                self.device.write_at(start, &buf)?;
            }
            Region::Chain(first) => {
                let mut chain = self.fat.read_chain(first)?;
                let bytes_needed = slots.len() * SLOT_SIZE;
                let capacity_bytes = chain.len() * self.geometry.bytes_per_cluster as usize;
                if bytes_needed > capacity_bytes {
                    let extra = (bytes_needed - capacity_bytes).div_ceil(self.geometry.bytes_per_cluster as usize);
                    let new_clusters = self.fat.allocate(extra)?;
                    self.fat.set(*chain.last().unwrap(), new_clusters[0])?;
                    chain.extend(new_clusters);
                }
                let mut buf = vec![0u8; chain.len() * self.geometry.bytes_per_cluster as usize];
                for (i, s) in slots.iter().enumerate() {
                    buf[i * SLOT_SIZE..(i + 1) * SLOT_SIZE].copy_from_slice(s);
                }
                for (ci, &c) in chain.iter().enumerate() {
                    let start = ci * self.geometry.bytes_per_cluster as usize;
                    let end = start + self.geometry.bytes_per_cluster as usize;
                    self.device.write_at(self.geometry.data_offset(c), &buf[start..end])?;
                }
            }
        }
        *self.cache.borrow_mut() = None;
        Ok(())
    }

    /// The directory's logical entries, excluding `.`, `..`, and volume
    /// labels. Scans on first access and caches; a later insert/remove
    /// through this same handle invalidates the cache (spec §4.4 "lazy
    /// load").
    pub fn entries(&self) -> Result<Vec<DirEntry>> {
        Ok(self
            .scanned_entries()?
            .into_iter()
            .map(|s| s.entry)
            .filter(|e| !e.is_volume_label())
            .filter(|e| !matches!(e.short_name.display().as_str(), "." | ".."))
            .collect())
    }

    fn scanned_entries(&self) -> Result<Vec<ScannedEntry>> {
        if let Some(cached) = self.cache.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let slots = self.read_all_slots()?;
        let outcome = dir_entry::scan(&slots);
        *self.cache.borrow_mut() = Some(outcome.entries.clone());
        Ok(outcome.entries)
    }

    pub fn find(&self, name: &str) -> Result<Option<DirEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|e| e.name().eq_ignore_ascii_case(name)))
    }

    fn name_collision(&self, name: &str) -> Result<bool> {
        Ok(self
            .scanned_entries()?
            .iter()
            .any(|s| s.entry.name().eq_ignore_ascii_case(name)))
    }

    /// Inserts a new entry, generating a short name (and an LFN run if
    /// needed) against the current sibling set (spec §4.3, §4.4).
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &self,
        name: &str,
        attributes: Attributes,
        first_cluster: u32,
        size: u32,
        created: Timestamp,
        written: Timestamp,
        accessed: Timestamp,
    ) -> Result<DirEntry> {
        if name.is_empty() || name == "." || name == ".." {
            return Err(Error::InvalidArg("name is empty or reserved"));
        }
        if self.name_collision(name)? {
            return Err(Error::AlreadyExists);
        }
        let siblings = self.scanned_entries()?;
        let short = make_8dot3(name, |candidate| {
            siblings
                .iter()
                .any(|s| s.entry.short_name.to_raw().0 == *candidate)
        });
        let long_name = if short.display() == name { None } else { Some(name) };
        let new_slots = dir_entry::encode_entry(
            short, long_name, attributes, first_cluster, size, created, written, accessed,
        );
        self.place_slots(new_slots)?;
        Ok(self
            .find(name)?
            .expect("entry just inserted must be found"))
    }

    fn place_slots(&self, new_slots: Vec<[u8; SLOT_SIZE]>) -> Result<()> {
        let mut raw = self.read_all_slots()?;
        let outcome = dir_entry::scan(&raw);
        let end_idx = outcome.end_marker.unwrap_or(raw.len());
        let needed = new_slots.len();

        let mut run_start = None;
        let mut placement = None;
        for i in 0..end_idx {
            if raw[i][0] == 0xE5 {
                let start = *run_start.get_or_insert(i);
                if i + 1 - start >= needed {
                    placement = Some(start);
                    break;
                }
            } else {
                run_start = None;
            }
        }

        match placement {
            Some(start) => {
                for (i, s) in new_slots.into_iter().enumerate() {
                    raw[start + i] = s;
                }
            }
            None => {
                if end_idx + needed > raw.len() {
                    if matches!(self.region, Region::FixedRoot) {
                        return Err(Error::NoSpace);
                    }
                    raw.resize(end_idx + needed, [0u8; SLOT_SIZE]);
                }
                for (i, s) in new_slots.into_iter().enumerate() {
                    raw[end_idx + i] = s;
                }
            }
        }
        self.write_all_slots(&raw)
    }

    /// Removes the entry named `name`. If it was the last live entry, its
    /// slots (and any now-orphaned run of `0xE5` tombstones immediately
    /// before it) are zeroed back to never-used rather than left as
    /// tombstones, so the directory's high-water mark shrinks back down
    /// (spec §4.4).
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut raw = self.read_all_slots()?;
        let outcome = dir_entry::scan(&raw);
        let target = outcome
            .entries
            .iter()
            .find(|s| s.entry.name().eq_ignore_ascii_case(name))
            .ok_or(Error::NotFound)?;
        let range = target.range.clone();
        let is_last_live = !outcome.entries.iter().any(|s| s.range.start >= range.end);

        if is_last_live {
            let mut from = range.start;
            while from > 0 && raw[from - 1][0] == 0xE5 {
                from -= 1;
            }
            for s in raw[from..range.end].iter_mut() {
                *s = [0u8; SLOT_SIZE];
            }
        } else {
            for i in range {
                raw[i][0] = 0xE5;
            }
        }
        self.write_all_slots(&raw)
    }

    /// Patches an existing entry's first-cluster, size, and write/access
    /// timestamps in place, without touching its name or slot position.
    /// Used by `File` owners to keep the directory entry in sync after a
    /// write or truncate (spec §4.5).
    pub fn update_metadata(
        &self,
        name: &str,
        first_cluster: u32,
        size: u32,
        written: Timestamp,
        accessed: Timestamp,
    ) -> Result<()> {
        let mut raw = self.read_all_slots()?;
        let outcome = dir_entry::scan(&raw);
        let target = outcome
            .entries
            .iter()
            .find(|s| s.entry.name().eq_ignore_ascii_case(name))
            .ok_or(Error::NotFound)?;
        let short_idx = target.range.end - 1;
        let mut short = RawShortEntry::read_from_bytes(&raw[short_idx]).unwrap();
        short.fst_clus_hi = U16::new((first_cluster >> 16) as u16);
        short.fst_clus_lo = U16::new((first_cluster & 0xFFFF) as u16);
        short.file_size = U32::new(size);
        let wrt_date = written.date.unwrap_or(DosDate::SENTINEL).encode();
        let (wrt_time, _) = written.time.encode();
        short.wrt_date = U16::new(wrt_date);
        short.wrt_time = U16::new(wrt_time);
        short.lst_acc_date = U16::new(accessed.date.unwrap_or(DosDate::SENTINEL).encode());
        raw[short_idx] = {
            let mut bytes = [0u8; SLOT_SIZE];
            bytes.copy_from_slice(short.as_bytes());
            bytes
        };
        self.write_all_slots(&raw)
    }

    /// The volume label entry (`Attributes::VOLUME_ID`), if this directory
    /// carries one. Only meaningful for the root directory.
    pub fn volume_label_entry(&self) -> Result<Option<DirEntry>> {
        Ok(self
            .scanned_entries()?
            .into_iter()
            .find(|s| s.entry.is_volume_label())
            .map(|s| s.entry))
    }

    /// Updates the root directory's volume-label entry in place, or
    /// inserts one if none exists yet (spec §6 volume label support).
    pub fn set_volume_label(&self, raw_name: [u8; 11], timestamp: Timestamp) -> Result<()> {
        let mut raw = self.read_all_slots()?;
        let outcome = dir_entry::scan(&raw);
        if let Some(existing) = outcome.entries.iter().find(|s| s.entry.is_volume_label()) {
            let idx = existing.range.start;
            let mut short = RawShortEntry::read_from_bytes(&raw[idx]).unwrap();
            short.name = raw_name;
            let mut bytes = [0u8; SLOT_SIZE];
            bytes.copy_from_slice(short.as_bytes());
            raw[idx] = bytes;
            return self.write_all_slots(&raw);
        }
        let short = EightDotThree {
            base: raw_name[..8].try_into().unwrap(),
            ext: raw_name[8..].try_into().unwrap(),
            base_lower: false,
            ext_lower: false,
        };
        let slots = dir_entry::encode_entry(short, None, Attributes::VOLUME_ID, 0, 0, timestamp, timestamp, timestamp);
        self.place_slots(slots)
    }

    /// Writes a freshly allocated subdirectory's `.` and `..` entries as
    /// its first two slots (spec §4.4). `parent_first_cluster` is `0` when
    /// the parent is the FAT12/16 fixed root, which has no cluster number
    /// of its own.
    pub fn init_subdirectory(
        device: &'d dyn BlockDevice,
        geometry: Geometry,
        first_cluster: u32,
        parent_first_cluster: u32,
        timestamp: Timestamp,
    ) -> Result<()> {
        let dot = special_name(b".       ");
        let dotdot = special_name(b"..      ");
        let mut slots = dir_entry::encode_entry(
            dot,
            None,
            Attributes::DIRECTORY,
            first_cluster,
            0,
            timestamp,
            timestamp,
            timestamp,
        );
        slots.extend(dir_entry::encode_entry(
            dotdot,
            None,
            Attributes::DIRECTORY,
            parent_first_cluster,
            0,
            timestamp,
            timestamp,
            timestamp,
        ));
        let mut buf = vec![0u8; geometry.bytes_per_cluster as usize];
        for (i, s) in slots.iter().enumerate() {
            buf[i * SLOT_SIZE..(i + 1) * SLOT_SIZE].copy_from_slice(s);
        }
        device.write_at(geometry.data_offset(first_cluster), &buf)?;
        Ok(())
    }
}

fn special_name(base: &[u8; 8]) -> EightDotThree {
    EightDotThree {
        base: *base,
        ext: [b' '; 3],
        base_lower: false,
        ext_lower: false,
    }
}
