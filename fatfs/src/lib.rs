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

//! A FAT12/16/32 + VFAT long-file-name filesystem driver core.
//!
//! [`FileSystem`] mounts a [`BlockDevice`] and presents path-addressed
//! directory and file operations over it; [`format::format`] lays a fresh
//! volume down first when needed. Everything below that — boot sector
//! parsing, the FAT itself, directory entries, and file content I/O — is
//! split into its own module and can be used on its own.

pub mod boot_sector;
pub mod dir_entry;
pub mod directory;
pub mod fat;
pub mod file;
pub mod format;
mod oem;
pub mod time;

use log::warn;

use boot_sector::{FatType, Geometry};
use dir_entry::{Attributes, DirEntry};
use directory::Directory;
use fat::FatManager;
use file::File;
use time::Timestamp;

pub use fatfs_err::{Error, Result};
pub use fatfs_io::BlockDevice;

/// Text encoding used for 8.3 short names. Long names are always UCS-2 on
/// disk regardless of this option (spec §6). Code page 437 is the only
/// one this crate implements; the field exists so a caller's mount
/// configuration has somewhere to name the choice even though there's
/// only one today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Cp437,
}

/// Mount-time configuration (spec §6).
#[derive(Debug, Clone)]
pub struct FsOptions {
    pub encoding: Encoding,
    pub read_only: bool,
    /// Preserve the exact case of names that need an LFN. When `false`,
    /// names are upper-cased before short-name generation, trading exact
    /// case fidelity for never allocating an LFN run.
    pub preserve_case: bool,
    /// Interpreted as UTC; see [`Timestamp::now`] for why local time
    /// isn't supported.
    pub utc: bool,
    /// Defer scanning a directory's entries until first access rather
    /// than eagerly on open.
    pub lazy_load: bool,
}

impl Default for FsOptions {
    fn default() -> Self {
        FsOptions {
            encoding: Encoding::Cp437,
            read_only: false,
            preserve_case: true,
            utc: true,
            lazy_load: true,
        }
    }
}

/// A mounted FAT volume.
///
/// Holds the FAT table manager for the volume's lifetime; directory and
/// file handles borrow from it, so they can't outlive the `FileSystem`
/// that produced them. Clearing the dirty bit on clean unmount (spec
/// §4.2, §9) happens in `Drop`.
pub struct FileSystem<'d> {
    device: &'d dyn BlockDevice,
    geometry: Geometry,
    fat: FatManager<'d>,
    options: FsOptions,
}

impl<'d> FileSystem<'d> {
    /// Mounts an already-formatted volume.
    pub fn mount(device: &'d dyn BlockDevice, options: FsOptions) -> Result<Self> {
        let geometry = boot_sector::read_geometry(device)?;
        let fat = FatManager::new(device, geometry, options.read_only)?;
        if !options.read_only {
            if fat.is_dirty().unwrap_or(false) {
                warn!("volume was not cleanly unmounted last time; mounting anyway");
            }
            fat.set_dirty(true)?;
        }
        Ok(FileSystem { device, geometry, fat, options })
    }

    /// Formats `device` and mounts the result in one step.
    pub fn format_and_mount(
        device: &'d dyn BlockDevice,
        format_options: format::FormatOptions,
        fs_options: FsOptions,
    ) -> Result<Self> {
        format::format(device, format_options)?;
        Self::mount(device, fs_options)
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    pub fn free_bytes(&self) -> Result<u64> {
        Ok(self.fat.free_count()? as u64 * self.geometry.bytes_per_cluster as u64)
    }

    pub fn total_bytes(&self) -> u64 {
        self.geometry.cluster_count as u64 * self.geometry.bytes_per_cluster as u64
    }

    pub fn volume_label(&self) -> Result<String> {
        if let Some(entry) = self.root()?.volume_label_entry()? {
            return Ok(entry.short_name.display());
        }
        let label: String = self
            .geometry
            .volume_label
            .iter()
            .take_while(|&&b| b != b' ')
            .map(|&b| oem::decode(b))
            .collect();
        Ok(label)
    }

    /// Updates the volume label, both the directory entry and the boot
    /// sector's embedded copy (spec §6 supplemented feature).
    pub fn set_volume_label(&self, label: &str) -> Result<()> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        let raw = format::encode_volume_label(Some(label));
        self.patch_boot_sector_label(raw)?;
        self.root()?.set_volume_label(raw, Timestamp::now())
    }

    fn patch_boot_sector_label(&self, raw: [u8; 11]) -> Result<()> {
        use boot_sector::{BootSectorFat1216, BootSectorFat32};
        use zerocopy::{FromBytes, IntoBytes};

        let mut sector = [0u8; 512];
        self.device.read_at(0, &mut sector)?;
        if self.geometry.fat_type == FatType::Fat32 {
            let mut boot = BootSectorFat32::read_from_bytes(&sector)
                .map_err(|_| Error::Corrupt("boot sector truncated"))?;
            boot.bs_vollab = raw;
            sector.copy_from_slice(boot.as_bytes());
        } else {
            let mut boot = BootSectorFat1216::read_from_bytes(&sector)
                .map_err(|_| Error::Corrupt("boot sector truncated"))?;
            boot.bs_vollab = raw;
            sector.copy_from_slice(boot.as_bytes());
        }
        self.device.write_at(0, &sector)
    }

    pub fn root(&self) -> Result<Directory<'_>> {
        Directory::root(self.device, self.geometry, &self.fat, self.options.read_only, self.options.lazy_load)
    }

    fn split_path(path: &str) -> (Vec<&str>, &str) {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return (Vec::new(), "");
        }
        let mut parts: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
        let last = parts.pop().unwrap_or("");
        (parts, last)
    }

    fn open_dir_chain(&self, components: &[&str]) -> Result<Directory<'_>> {
        let mut dir = self.root()?;
        for comp in components {
            let entry = dir.find(comp)?.ok_or(Error::NotFound)?;
            if !entry.is_dir() {
                return Err(Error::NotDir);
            }
            dir = Directory::open(
                self.device,
                self.geometry,
                &self.fat,
                self.options.read_only,
                self.options.lazy_load,
                entry.first_cluster,
            )?;
        }
        Ok(dir)
    }

    fn first_cluster_of_dir(&self, parts: &[&str]) -> Result<u32> {
        if parts.is_empty() {
            return Ok(if self.geometry.fat_type == FatType::Fat32 {
                self.geometry.root_cluster
            } else {
                0
            });
        }
        let (init, last) = parts.split_at(parts.len() - 1);
        let dir = self.open_dir_chain(init)?;
        let entry = dir.find(last[0])?.ok_or(Error::NotFound)?;
        if !entry.is_dir() {
            return Err(Error::NotDir);
        }
        Ok(entry.first_cluster)
    }

    /// Opens the directory at `path` (empty or `"/"` for the root).
    pub fn open_dir(&self, path: &str) -> Result<Directory<'_>> {
        let (mut parts, last) = Self::split_path(path);
        if !last.is_empty() {
            parts.push(last);
        }
        self.open_dir_chain(&parts)
    }

    pub fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.open_dir(path)?.entries()
    }

    /// Looks up a single entry's metadata without opening it for I/O.
    pub fn stat(&self, path: &str) -> Result<DirEntry> {
        let (parts, name) = Self::split_path(path);
        if name.is_empty() {
            return Err(Error::InvalidArg("cannot stat the root directory"));
        }
        self.open_dir_chain(&parts)?.find(name)?.ok_or(Error::NotFound)
    }

    /// Opens an existing file for reading (and writing, unless the volume
    /// or the entry itself is read-only).
    pub fn open_file(&self, path: &str) -> Result<File<'_>> {
        let (parts, name) = Self::split_path(path);
        let entry = self.open_dir_chain(&parts)?.find(name)?.ok_or(Error::NotFound)?;
        if entry.is_dir() {
            return Err(Error::IsDir);
        }
        Ok(File::new(
            self.device,
            self.geometry,
            &self.fat,
            self.options.read_only || entry.is_read_only(),
            entry.first_cluster,
            entry.size,
        ))
    }

    pub fn read_file(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.open_file(path)?.read(offset, buf)
    }

    /// Writes `data` at `offset`, growing the file if needed, and syncs
    /// the resulting size/first-cluster/timestamp back to the directory
    /// entry. Pass `file.size()` as `offset` to append.
    pub fn write_file(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        let (parts, name) = Self::split_path(path);
        let dir = self.open_dir_chain(&parts)?;
        let entry = dir.find(name)?.ok_or(Error::NotFound)?;
        if entry.is_dir() {
            return Err(Error::IsDir);
        }
        if entry.is_read_only() {
            return Err(Error::ReadOnly);
        }
        let file = File::new(self.device, self.geometry, &self.fat, false, entry.first_cluster, entry.size);
        let n = file.write(offset, data)?;
        let now = Timestamp::now();
        dir.update_metadata(name, file.first_cluster(), file.size(), now, now)?;
        Ok(n)
    }

    pub fn truncate_file(&self, path: &str, new_len: u32) -> Result<()> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        let (parts, name) = Self::split_path(path);
        let dir = self.open_dir_chain(&parts)?;
        let entry = dir.find(name)?.ok_or(Error::NotFound)?;
        if entry.is_dir() {
            return Err(Error::IsDir);
        }
        if entry.is_read_only() {
            return Err(Error::ReadOnly);
        }
        let file = File::new(self.device, self.geometry, &self.fat, false, entry.first_cluster, entry.size);
        file.truncate(new_len)?;
        let now = Timestamp::now();
        dir.update_metadata(name, file.first_cluster(), file.size(), now, now)
    }

    pub fn create_file(&self, path: &str) -> Result<()> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        let (parts, name) = Self::split_path(path);
        if name.is_empty() {
            return Err(Error::InvalidArg("empty file name"));
        }
        let dir = self.open_dir_chain(&parts)?;
        let name = normalize_case(name, self.options.preserve_case);
        let now = Timestamp::now();
        dir.insert(&name, Attributes::ARCHIVE, 0, 0, now, now, now)?;
        Ok(())
    }

    pub fn remove_file(&self, path: &str) -> Result<()> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        let (parts, name) = Self::split_path(path);
        let dir = self.open_dir_chain(&parts)?;
        let entry = dir.find(name)?.ok_or(Error::NotFound)?;
        if entry.is_dir() {
            return Err(Error::IsDir);
        }
        if entry.first_cluster != 0 {
            let chain = self.fat.read_chain(entry.first_cluster)?;
            self.fat.free_chain(&chain)?;
        }
        dir.remove(name)
    }

    pub fn create_dir(&self, path: &str) -> Result<()> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        let (parts, name) = Self::split_path(path);
        if name.is_empty() {
            return Err(Error::InvalidArg("empty directory name"));
        }
        let parent_first_cluster = self.first_cluster_of_dir(&parts)?;
        let parent = self.open_dir_chain(&parts)?;
        let name = normalize_case(name, self.options.preserve_case);
        let new_cluster = self.fat.allocate(1)?[0];
        let now = Timestamp::now();
        Directory::init_subdirectory(self.device, self.geometry, new_cluster, parent_first_cluster, now)?;
        if let Err(e) = parent.insert(&name, Attributes::DIRECTORY, new_cluster, 0, now, now, now) {
            let _ = self.fat.free_chain(&[new_cluster]);
            return Err(e);
        }
        Ok(())
    }

    pub fn remove_dir(&self, path: &str) -> Result<()> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        let (parts, name) = Self::split_path(path);
        let parent = self.open_dir_chain(&parts)?;
        let entry = parent.find(name)?.ok_or(Error::NotFound)?;
        if !entry.is_dir() {
            return Err(Error::NotDir);
        }
        let child = Directory::open(
            self.device,
            self.geometry,
            &self.fat,
            self.options.read_only,
            true,
            entry.first_cluster,
        )?;
        if !child.entries()?.is_empty() {
            return Err(Error::DirNotEmpty);
        }
        if entry.first_cluster != 0 {
            let chain = self.fat.read_chain(entry.first_cluster)?;
            self.fat.free_chain(&chain)?;
        }
        parent.remove(name)
    }

    /// Renames (and optionally moves) an entry, preserving its content,
    /// attributes, and timestamps (spec §6 supplemented feature: the
    /// donor's name-in-place rename doesn't span directories, this does).
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        let (from_parts, from_name) = Self::split_path(from);
        let (to_parts, to_name) = Self::split_path(to);
        if to_name.is_empty() {
            return Err(Error::InvalidArg("empty destination name"));
        }
        let src_dir = self.open_dir_chain(&from_parts)?;
        let entry = src_dir.find(from_name)?.ok_or(Error::NotFound)?;
        let dst_dir = self.open_dir_chain(&to_parts)?;
        let to_name = normalize_case(to_name, self.options.preserve_case);
        dst_dir.insert(
            &to_name,
            entry.attributes,
            entry.first_cluster,
            entry.size,
            entry.created,
            entry.written,
            entry.accessed,
        )?;
        if let Err(e) = src_dir.remove(from_name) {
            let _ = dst_dir.remove(&to_name);
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for FileSystem<'_> {
    fn drop(&mut self) {
        if !self.options.read_only {
            if let Err(e) = self.fat.set_dirty(false) {
                log::error!("failed to clear the dirty bit on unmount: {e}");
            }
        }
    }
}

fn normalize_case(name: &str, preserve_case: bool) -> String {
    if preserve_case {
        name.to_string()
    } else {
        name.to_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fatfs_io::MemoryDevice;

    fn mounted(total_bytes: u64) -> (MemoryDevice, format::FormatOptions<'static>) {
        let dev = MemoryDevice::zeroed(total_bytes as usize);
        (dev, format::FormatOptions { total_bytes, volume_label: Some("TESTVOL"), ..Default::default() })
    }

    #[test]
    fn formats_mounts_and_round_trips_a_file() {
        let (dev, fmt) = mounted(32 << 20);
        let fs = FileSystem::format_and_mount(&dev, fmt, FsOptions::default()).unwrap();

        fs.create_file("hello.txt").unwrap();
        fs.write_file("hello.txt", 0, b"hello, fat").unwrap();

        let mut buf = [0u8; 10];
        fs.read_file("hello.txt", 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello, fat");

        let stat = fs.stat("hello.txt").unwrap();
        assert_eq!(stat.size, 10);
        drop(fs);
    }

    #[test]
    fn creates_and_lists_nested_directories() {
        let (dev, fmt) = mounted(32 << 20);
        let fs = FileSystem::format_and_mount(&dev, fmt, FsOptions::default()).unwrap();

        fs.create_dir("docs").unwrap();
        fs.create_file("docs/readme.txt").unwrap();
        fs.write_file("docs/readme.txt", 0, b"hi").unwrap();

        let listing = fs.list("docs").unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name(), "readme.txt");
    }

    #[test]
    fn removing_a_non_empty_directory_fails() {
        let (dev, fmt) = mounted(32 << 20);
        let fs = FileSystem::format_and_mount(&dev, fmt, FsOptions::default()).unwrap();
        fs.create_dir("docs").unwrap();
        fs.create_file("docs/a.txt").unwrap();
        assert!(matches!(fs.remove_dir("docs"), Err(Error::DirNotEmpty)));
        fs.remove_file("docs/a.txt").unwrap();
        fs.remove_dir("docs").unwrap();
    }

    #[test]
    fn renames_a_file_across_directories() {
        let (dev, fmt) = mounted(32 << 20);
        let fs = FileSystem::format_and_mount(&dev, fmt, FsOptions::default()).unwrap();
        fs.create_dir("a").unwrap();
        fs.create_dir("b").unwrap();
        fs.create_file("a/x.txt").unwrap();
        fs.write_file("a/x.txt", 0, b"payload").unwrap();

        fs.rename("a/x.txt", "b/y.txt").unwrap();
        assert!(fs.stat("a/x.txt").is_err());
        let mut buf = [0u8; 7];
        fs.read_file("b/y.txt", 0, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn dirty_bit_is_set_on_mount_and_cleared_on_drop() {
        let (dev, fmt) = mounted(32 << 20);
        {
            let fs = FileSystem::format_and_mount(&dev, fmt, FsOptions::default()).unwrap();
            let geometry = fs.geometry();
            let fat = FatManager::new(&dev, geometry, false).unwrap();
            assert!(fat.is_dirty().unwrap());
        }
        let geometry = boot_sector::read_geometry(&dev).unwrap();
        let fat = FatManager::new(&dev, geometry, true).unwrap();
        assert!(!fat.is_dirty().unwrap());
    }

    #[test]
    fn read_only_mount_rejects_mutation() {
        let (dev, fmt) = mounted(32 << 20);
        format::format(&dev, fmt).unwrap();
        let fs = FileSystem::mount(&dev, FsOptions { read_only: true, ..Default::default() }).unwrap();
        assert!(matches!(fs.create_file("x.txt"), Err(Error::ReadOnly)));
    }

    #[test]
    fn volume_label_round_trips() {
        let (dev, fmt) = mounted(32 << 20);
        let fs = FileSystem::format_and_mount(&dev, fmt, FsOptions::default()).unwrap();
        assert_eq!(fs.volume_label().unwrap(), "TESTVOL");
        fs.set_volume_label("NEWLABEL").unwrap();
        assert_eq!(fs.volume_label().unwrap(), "NEWLABEL");
    }
}
