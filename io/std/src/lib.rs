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

//! `std::fs::File`-backed block device, generalized from a single-purpose
//! read-write-at-offset-zero wrapper into one that honors the `offset` and
//! `read_only` mount options: every access is translated by a fixed base
//! offset so the driver can sit on a partition inside a larger image, and
//! writes are rejected up front when the file was opened read-only.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use fatfs_err::{Error, Result};
use fatfs_io::BlockDevice;
use log::debug;

pub struct FileDevice {
    file: File,
    offset: u64,
    read_only: bool,
}

impl FileDevice {
    /// Opens `path` read-write, addressing it starting at byte `offset`.
    pub fn open(path: impl AsRef<Path>, offset: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file,
            offset,
            read_only: false,
        })
    }

    /// Opens `path` read-only, addressing it starting at byte `offset`.
    pub fn open_read_only(path: impl AsRef<Path>, offset: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self {
            file,
            offset,
            read_only: true,
        })
    }

    /// Creates (or truncates) `path`, sized to `len` bytes, for use by the
    /// formatter. The resulting device is writable and not offset.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        debug!("created backing file of {len} bytes");
        Ok(Self {
            file,
            offset: 0,
            read_only: false,
        })
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, self.offset + offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.file.write_all_at(buf, self.offset + offset)?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len().saturating_sub(self.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_real_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let dev = FileDevice::create(tmp.path(), 4096).unwrap();
        dev.write_at(10, b"fatfs").unwrap();
        let mut buf = [0u8; 5];
        dev.read_at(10, &mut buf).unwrap();
        assert_eq!(&buf, b"fatfs");
    }

    #[test]
    fn honors_the_base_offset() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let raw = FileDevice::create(tmp.path(), 8192).unwrap();
        raw.write_at(2048 + 4, b"part").unwrap();
        let dev = FileDevice::open(tmp.path(), 2048).unwrap();
        let mut buf = [0u8; 4];
        dev.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"part");
    }

    #[test]
    fn read_only_device_rejects_writes() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        FileDevice::create(tmp.path(), 4096).unwrap();
        let dev = FileDevice::open_read_only(tmp.path(), 0).unwrap();
        assert!(matches!(dev.write_at(0, b"x"), Err(Error::ReadOnly)));
    }
}
