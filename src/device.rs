use crate::error::{BtrfsError, Result};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Backing byte store for the filesystem. `read_at`/`write_at` are positional, so a
/// single device can be shared by concurrent readers without a seek race — the
/// equivalent of the teacher's `MappedFile`, but read-write: the COW engine has to put
/// new blocks somewhere, which a read-only `mmap` can't do.
pub trait BlockDevice: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;
    fn len(&self) -> u64;
    fn sync(&self) -> Result<()>;
}

/// A real file or block device, opened read-write.
pub struct FileDevice {
    file: File,
    len: u64,
    path: PathBuf,
}

impl FileDevice {
    pub fn open(path: &Path) -> Result<FileDevice> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let md = file.metadata()?;
        let len = if md.is_file() {
            md.len()
        } else {
            device_size(&file)?
        };
        Ok(FileDevice {
            file,
            len,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// grounded on `wtfrank-dump_btrfs/src/mapped_file.rs::MappedFile::open`'s block-device
/// size detection, reused as-is (only the mmap step is dropped).
fn device_size(f: &File) -> Result<u64> {
    let mut len64: u64 = 0;
    let len_ref = &mut len64 as *mut u64;
    let ret = unsafe { ioctls::blkgetsize64(f.as_raw_fd(), len_ref) };
    if ret != 0 {
        return Err(BtrfsError::IoError(std::io::Error::last_os_error()));
    }
    Ok(len64)
}

impl BlockDevice for FileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.len {
            return Err(BtrfsError::invalid("read past end of device"));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.len {
            return Err(BtrfsError::invalid("write past end of device"));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// in-memory device for tests: the scenarios in spec §8 need a fast, disposable backing
/// store, not a real disk image.
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
}

impl MemDevice {
    pub fn new(len: u64) -> MemDevice {
        MemDevice {
            data: Mutex::new(vec![0_u8; len as usize]),
        }
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(BtrfsError::invalid("read past end of device"));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(BtrfsError::invalid("write past end of device"));
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips() {
        let dev = MemDevice::new(4096);
        dev.write_at(100, b"hello").unwrap();
        let mut buf = [0_u8; 5];
        dev.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn mem_device_rejects_out_of_range() {
        let dev = MemDevice::new(16);
        let mut buf = [0_u8; 8];
        assert!(dev.read_at(12, &mut buf).is_err());
    }
}
