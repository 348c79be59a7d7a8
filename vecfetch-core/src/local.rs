use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{IoContext, Result, VecfetchError};
use crate::range::ByteRange;

/// The local copy of the dataset file. Chunks are written positionally so
/// concurrent writers to disjoint chunks need no shared cursor.
#[derive(Debug)]
pub struct LocalFile {
    path: PathBuf,
    file: File,
    total_size: u64,
    locked: bool,
}

impl LocalFile {
    /// Open or create the file and size it to `total_size`.
    pub fn open(path: &Path, total_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .ctx(|| format!("open {}", path.display()))?;
        let len = file.metadata().ctx(|| format!("stat {}", path.display()))?.len();
        if len != total_size {
            if len < total_size {
                // Reserve the space up front so a full disk fails here, not mid-transfer.
                // Not every filesystem supports preallocation; set_len still sizes it.
                if let Err(e) = file.allocate(total_size) {
                    tracing::debug!(path = %path.display(), error = %e, "preallocation unsupported");
                }
            }
            file.set_len(total_size).ctx(|| format!("resize {}", path.display()))?;
        }
        Ok(Self { path: path.to_path_buf(), file, total_size, locked: false })
    }

    /// Adopt a handle the caller already opened. The file keeps its current
    /// length; writes fail if the handle was not opened for writing.
    pub fn from_file(path: &Path, file: File) -> Result<Self> {
        let total_size = file.metadata().ctx(|| format!("stat {}", path.display()))?.len();
        Ok(Self { path: path.to_path_buf(), file, total_size, locked: false })
    }

    /// Take an advisory exclusive lock for the lifetime of this handle.
    pub fn lock_exclusive(&mut self) -> Result<()> {
        self.file
            .try_lock_exclusive()
            .map_err(|_| VecfetchError::Locked(self.path.display().to_string()))?;
        self.locked = true;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn read_range(&self, range: ByteRange) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; range.size() as usize];
        self.read_at(range.start(), &mut buf)?;
        Ok(buf)
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        read_exact_at(&self.file, buf, offset)
            .ctx(|| format!("read {} bytes at {offset} from {}", buf.len(), self.path.display()))
    }

    /// Write and flush to stable storage before returning.
    pub fn write_durable(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        write_all_at(&self.file, bytes, offset)
            .ctx(|| format!("write {} bytes at {offset} to {}", bytes.len(), self.path.display()))?;
        self.file.sync_data().ctx(|| format!("sync {}", self.path.display()))
    }
}

impl Drop for LocalFile {
    fn drop(&mut self) {
        if self.locked {
            let _ = FileExt::unlock(&self.file);
        }
    }
}

#[cfg(unix)]
pub(crate) fn read_exact_at(f: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(f, buf, offset)
}

#[cfg(unix)]
fn write_all_at(f: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(f, buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(f: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match f.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(f: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match f.seek_write(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
