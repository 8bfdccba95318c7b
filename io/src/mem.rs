use std::sync::RwLock;

use fatfs_err::Result;

use crate::BlockDevice;

/// An in-memory [`BlockDevice`] backed by a growable byte buffer.
///
/// Used throughout the driver's test suite in place of a real disk image;
/// it gives the exact `read_at`/`write_at` contract a file-backed device
/// would without touching the filesystem the tests themselves run on.
pub struct MemoryDevice {
    data: RwLock<Vec<u8>>,
}

impl MemoryDevice {
    /// Creates a zero-filled device of the given size.
    pub fn zeroed(size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size]),
        }
    }

    /// Creates a device from existing bytes.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Consumes the device, returning its contents.
    pub fn into_vec(self) -> Vec<u8> {
        self.data.into_inner().unwrap()
    }
}

impl BlockDevice for MemoryDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of memory device",
            )
            .into());
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.write().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "write past end of memory device",
            )
            .into());
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.read().unwrap().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bytes() {
        let dev = MemoryDevice::zeroed(4096);
        dev.write_at(100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        dev.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn rejects_out_of_range_access() {
        let dev = MemoryDevice::zeroed(16);
        let mut buf = [0u8; 8];
        assert!(dev.read_at(12, &mut buf).is_err());
    }
}
