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

//! File content I/O: read/write against a cluster chain, truncation, and
//! the allocate-on-write growth path (spec §4.5). The owning directory
//! entry's size and first-cluster fields are kept in sync by the caller
//! (`FileSystem`, in `lib.rs`) after each mutating call, since a `File`
//! has no notion of which directory slot names it.

use std::cell::{Cell, RefCell};
use std::sync::Mutex;

use fatfs_err::{Error, Result};
use fatfs_io::BlockDevice;

use crate::boot_sector::Geometry;
use crate::fat::FatManager;

/// An open file's cluster chain, materialized lazily and extended
/// forward as I/O reaches further into the file. Repeated sequential
/// access only ever walks the clusters it hasn't seen yet, instead of
/// re-reading the whole chain from the first cluster on every call.
pub struct File<'d> {
    device: &'d dyn BlockDevice,
    geometry: Geometry,
    fat: &'d FatManager<'d>,
    read_only: bool,
    first_cluster: Cell<u32>,
    size: Cell<u32>,
    chain_cache: RefCell<Vec<u32>>,
    io_lock: Mutex<()>,
}

impl<'d> File<'d> {
    pub fn new(
        device: &'d dyn BlockDevice,
        geometry: Geometry,
        fat: &'d FatManager<'d>,
        read_only: bool,
        first_cluster: u32,
        size: u32,
    ) -> Self {
        File {
            device,
            geometry,
            fat,
            read_only,
            first_cluster: Cell::new(first_cluster),
            size: Cell::new(size),
            chain_cache: RefCell::new(Vec::new()),
            io_lock: Mutex::new(()),
        }
    }

    pub fn first_cluster(&self) -> u32 {
        self.first_cluster.get()
    }

    pub fn size(&self) -> u32 {
        self.size.get()
    }

    /// Grows the cached chain until it covers index `upto_idx` or hits
    /// the chain's actual end, walking the FAT only from the last
    /// cluster already cached rather than from the start.
    fn ensure_cached(&self, upto_idx: usize) -> Result<()> {
        let mut cache = self.chain_cache.borrow_mut();
        if cache.is_empty() {
            if self.first_cluster.get() == 0 {
                return Ok(());
            }
            cache.push(self.first_cluster.get());
        }
        while cache.len() <= upto_idx {
            let last = *cache.last().unwrap();
            let next = self.fat.get(last)?;
            if self.fat.is_end_of_chain(next) {
                break;
            }
            if self.fat.is_bad_cluster(next) || cache.len() > self.geometry.cluster_count as usize {
                return Err(Error::Corrupt("cluster chain references an invalid cluster"));
            }
            cache.push(next);
        }
        Ok(())
    }

    fn cluster_at(&self, idx: usize) -> Result<Option<u32>> {
        self.ensure_cached(idx)?;
        Ok(self.chain_cache.borrow().get(idx).copied())
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let _guard = self.io_lock.lock().unwrap();
        let size = self.size.get() as u64;
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let to_read = buf.len().min((size - offset) as usize);
        let bytes_per_cluster = self.geometry.bytes_per_cluster as usize;
        let mut done = 0;
        while done < to_read {
            let pos = offset + done as u64;
            let idx = (pos / bytes_per_cluster as u64) as usize;
            let Some(cluster) = self.cluster_at(idx)? else {
                break;
            };
            let cluster_off = (pos as usize) % bytes_per_cluster;
            let chunk = (bytes_per_cluster - cluster_off).min(to_read - done);
            self.device
                .read_at(self.geometry.data_offset(cluster) + cluster_off as u64, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(done)
    }

    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let _guard = self.io_lock.lock().unwrap();
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset + buf.len() as u64;
        if end > u32::MAX as u64 {
            return Err(Error::TooBig);
        }
        self.ensure_capacity(end)?;
        let bytes_per_cluster = self.geometry.bytes_per_cluster as usize;
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let idx = (pos / bytes_per_cluster as u64) as usize;
            let cluster = self
                .cluster_at(idx)?
                .expect("ensure_capacity grew the chain to cover this offset");
            let cluster_off = (pos as usize) % bytes_per_cluster;
            let chunk = (bytes_per_cluster - cluster_off).min(buf.len() - done);
            self.device.write_at(
                self.geometry.data_offset(cluster) + cluster_off as u64,
                &buf[done..done + chunk],
            )?;
            done += chunk;
        }
        if end as u32 > self.size.get() {
            self.size.set(end as u32);
        }
        Ok(done)
    }

    fn ensure_capacity(&self, end: u64) -> Result<()> {
        let bytes_per_cluster = self.geometry.bytes_per_cluster as u64;
        let needed_clusters = end.div_ceil(bytes_per_cluster).max(1) as usize;
        self.ensure_cached(needed_clusters.saturating_sub(1))?;
        let mut cache = self.chain_cache.borrow_mut();
        if cache.len() >= needed_clusters {
            return Ok(());
        }
        let extra = needed_clusters - cache.len();
        let new_clusters = self.fat.allocate(extra)?;
        if cache.is_empty() {
            self.first_cluster.set(new_clusters[0]);
        } else {
            self.fat.set(*cache.last().unwrap(), new_clusters[0])?;
        }
        cache.extend(new_clusters);
        Ok(())
    }

    /// Resizes the file to exactly `new_len` bytes: extends with
    /// zero-fill, or frees trailing clusters. Truncating to zero keeps
    /// the first cluster allocated rather than freeing the whole chain
    /// (spec §4.5, §8 property 7), so a file that's been written to never
    /// regresses to having no cluster of its own.
    pub fn truncate(&self, new_len: u32) -> Result<()> {
        let _guard = self.io_lock.lock().unwrap();
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if new_len as u64 > self.size.get() as u64 {
            drop(_guard);
            self.ensure_capacity(new_len as u64)?;
            let gap = (new_len - self.size.get()) as usize;
            self.write(self.size.get() as u64, &vec![0u8; gap])?;
            return Ok(());
        }

        self.ensure_cached(usize::MAX)?;
        let mut cache = self.chain_cache.borrow_mut();
        let bytes_per_cluster = self.geometry.bytes_per_cluster as u64;
        let keep_clusters = if new_len == 0 {
            if cache.is_empty() { 0 } else { 1 }
        } else {
            (new_len as u64).div_ceil(bytes_per_cluster) as usize
        };

        if keep_clusters < cache.len() {
            self.fat.free_chain(&cache[keep_clusters..])?;
            if keep_clusters == 0 {
                self.first_cluster.set(0);
            } else {
                self.fat
                    .set(cache[keep_clusters - 1], self.geometry.fat_type.end_of_chain_marker())?;
            }
            cache.truncate(keep_clusters);
        }
        drop(cache);
        self.size.set(new_len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_sector::FatType;
    use fatfs_io::MemoryDevice;

    fn geometry() -> Geometry {
        Geometry {
            bytes_per_sector: 512,
            sectors_per_cluster: 1,
            bytes_per_cluster: 16,
            reserved_sectors: 1,
            num_fats: 1,
            sectors_per_fat: 4,
            root_entry_count: 0,
            root_cluster: 2,
            total_sectors: 2000,
            fat_start_sector: 1,
            root_dir_start_sector: 5,
            data_start_sector: 5,
            cluster_count: 1000,
            fat_type: FatType::Fat16,
            fs_info_sector: 0,
            media: 0xF8,
            volume_label: *b"NO NAME    ",
        }
    }

    #[test]
    fn write_then_read_across_multiple_clusters() {
        let geo = geometry();
        let dev = MemoryDevice::zeroed(2000 * 512);
        let fat = FatManager::new(&dev, geo, false).unwrap();
        let file = File::new(&dev, geo, &fat, false, 0, 0);

        let data: Vec<u8> = (0..50u8).collect();
        assert_eq!(file.write(0, &data).unwrap(), 50);
        assert_eq!(file.size(), 50);

        let mut readback = vec![0u8; 50];
        assert_eq!(file.read(0, &mut readback).unwrap(), 50);
        assert_eq!(readback, data);
    }

    #[test]
    fn read_past_eof_returns_zero() {
        let geo = geometry();
        let dev = MemoryDevice::zeroed(2000 * 512);
        let fat = FatManager::new(&dev, geo, false).unwrap();
        let file = File::new(&dev, geo, &fat, false, 0, 0);
        file.write(0, b"hi").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(file.read(10, &mut buf).unwrap(), 0);
    }

    #[test]
    fn truncate_to_zero_retains_first_cluster() {
        let geo = geometry();
        let dev = MemoryDevice::zeroed(2000 * 512);
        let fat = FatManager::new(&dev, geo, false).unwrap();
        let file = File::new(&dev, geo, &fat, false, 0, 0);
        file.write(0, &[1u8; 40]).unwrap();
        let first = file.first_cluster();
        assert_ne!(first, 0);

        file.truncate(0).unwrap();
        assert_eq!(file.size(), 0);
        assert_eq!(file.first_cluster(), first);
        assert_eq!(fat.read_chain(first).unwrap(), vec![first]);
    }

    #[test]
    fn truncate_shrinks_and_frees_trailing_clusters() {
        let geo = geometry();
        let dev = MemoryDevice::zeroed(2000 * 512);
        let fat = FatManager::new(&dev, geo, false).unwrap();
        let file = File::new(&dev, geo, &fat, false, 0, 0);
        file.write(0, &[1u8; 40]).unwrap();
        let chain_before = fat.read_chain(file.first_cluster()).unwrap();
        assert_eq!(chain_before.len(), 3);

        file.truncate(10).unwrap();
        let chain_after = fat.read_chain(file.first_cluster()).unwrap();
        assert_eq!(chain_after.len(), 1);
        assert!(fat.is_free(fat.get(chain_before[1]).unwrap()));
    }

    #[test]
    fn truncate_extending_zero_fills_the_gap() {
        let geo = geometry();
        let dev = MemoryDevice::zeroed(2000 * 512);
        let fat = FatManager::new(&dev, geo, false).unwrap();
        let file = File::new(&dev, geo, &fat, false, 0, 0);
        file.write(0, b"hi").unwrap();
        file.truncate(5).unwrap();
        let mut buf = [0u8; 5];
        file.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hi\0\0\0");
    }

    #[test]
    fn write_is_rejected_on_a_read_only_file() {
        let geo = geometry();
        let dev = MemoryDevice::zeroed(2000 * 512);
        let fat = FatManager::new(&dev, geo, false).unwrap();
        let file = File::new(&dev, geo, &fat, true, 0, 0);
        assert!(matches!(file.write(0, b"x"), Err(Error::ReadOnly)));
    }
}
