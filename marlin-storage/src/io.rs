//! Synchronous page-granular volume I/O.
//!
//! Every data page carries an 8-byte prefix holding the LSA of the log
//! record that last modified it; the write-ahead rule is checked against
//! that prefix before a page goes to disk. Bitmap pages of temporary
//! volumes carry [`TEMP_PAGE_LSA`] instead, which excludes them from WAL
//! protection.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use zerocopy::{AsBytes, FromBytes};

use crate::error::Result;
use crate::lsa::{Lsa, LsaRepr};

/// Size of the per-page LSA prefix.
pub const PAGE_LSA_PREFIX: usize = LsaRepr::SIZE;

/// Sentinel LSA stamped on pages that are not WAL-protected.
pub const TEMP_PAGE_LSA: Lsa = Lsa::new(-2, -2);

pub fn page_lsa(page: &[u8]) -> Lsa {
    LsaRepr::read_from_prefix(page).map(|r| r.get()).unwrap_or(Lsa::NULL)
}

pub fn set_page_lsa(page: &mut [u8], lsa: Lsa) {
    let repr = LsaRepr::from(lsa);
    page[..PAGE_LSA_PREFIX].copy_from_slice(repr.as_bytes());
}

/// The usable payload of a data page, after the LSA prefix.
pub fn page_content(page: &[u8]) -> &[u8] {
    &page[PAGE_LSA_PREFIX..]
}

pub fn page_content_mut(page: &mut [u8]) -> &mut [u8] {
    &mut page[PAGE_LSA_PREFIX..]
}

/// An open volume file addressed by physical page id.
#[derive(Debug)]
pub struct VolumeFile {
    file: File,
    path: PathBuf,
    page_size: usize,
}

impl VolumeFile {
    /// Create and pre-size a volume with `npages` zeroed pages.
    pub fn format(path: &Path, page_size: usize, npages: i32) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(page_size as u64 * npages as u64)?;
        Ok(Self {
            file,
            path: path.to_owned(),
            page_size,
        })
    }

    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("mount of {} failed: {e}", path.display());
                return Err(crate::Error::MountFail {
                    path: path.display().to_string(),
                });
            }
        };
        Ok(Self {
            file,
            path: path.to_owned(),
            page_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn npages(&self) -> Result<i32> {
        let len = self.file.metadata()?.len();
        Ok((len / self.page_size as u64) as i32)
    }

    pub fn read_page(&self, pageid: i32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        self.file
            .read_exact_at(buf, pageid as u64 * self.page_size as u64)?;
        Ok(())
    }

    pub fn write_page(&self, pageid: i32, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        self.file
            .write_all_at(buf, pageid as u64 * self.page_size as u64)?;
        Ok(())
    }

    /// Grow the volume by `npages` zeroed pages, returning the new total.
    pub fn extend(&self, npages: i32) -> Result<i32> {
        let total = self.npages()? + npages;
        self.file.set_len(self.page_size as u64 * total as u64)?;
        Ok(total)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Dismount and delete the underlying file.
    pub fn unformat(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn format_read_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol0");
        let vol = VolumeFile::format(&path, 4096, 8).unwrap();
        assert_eq!(vol.npages().unwrap(), 8);

        let mut page = vec![0u8; 4096];
        set_page_lsa(&mut page, Lsa::new(3, 77));
        page_content_mut(&mut page)[0] = 0xAB;
        vol.write_page(5, &page).unwrap();

        let mut back = vec![0u8; 4096];
        vol.read_page(5, &mut back).unwrap();
        assert_eq!(page_lsa(&back), Lsa::new(3, 77));
        assert_eq!(page_content(&back)[0], 0xAB);
    }

    #[test]
    fn unformat_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol1");
        let vol = VolumeFile::format(&path, 4096, 4).unwrap();
        vol.unformat().unwrap();
        assert!(!path.exists());
    }
}
