//! Memory-mapped file access
//!
//! One backend owns the database file and a single mapping of the full
//! configured map size. The file itself starts small and is extended with
//! `set_len` as the database grows; the mapping never moves, so page
//! references handed to transactions stay valid for the life of the
//! environment.

use crate::error::{Error, Pgno, Result};
use crate::meta::MetaPage;
use crate::page::{Page, PAGE_SIZE};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

enum Mapping {
    Ro(#[allow(dead_code)] Mmap),
    Rw(MmapMut),
}

/// Memory-mapped I/O backend
pub struct MmapBackend {
    file: File,
    /// Owns the mapping; all access goes through `base`.
    map: Mapping,
    base: *const u8,
    map_size: usize,
    /// Current file length in bytes. Pages at or past this offset do not
    /// exist yet and must not be touched.
    file_size: AtomicU64,
    readonly: bool,
}

// SAFETY: the mapping is never remapped or unmapped while the backend lives.
// Mutation goes through raw pointers under the single-writer protocol: the
// writer only stores into pages that no committed tree references, so
// concurrent readers never observe a torn page.
unsafe impl Send for MmapBackend {}
unsafe impl Sync for MmapBackend {}

impl MmapBackend {
    /// Open or create the database file and map `map_size` bytes of it.
    ///
    /// Returns the backend and whether the file was too small to hold meta
    /// pages before this call (i.e. the database is fresh).
    pub fn open(path: impl AsRef<Path>, map_size: usize, readonly: bool, create: bool) -> Result<(Self, bool)> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .create(create && !readonly)
            .truncate(false)
            .open(path)?;

        let mut file_size = file.metadata()?.len();
        let min_size = (2 * PAGE_SIZE) as u64;
        let fresh = file_size < min_size;
        if fresh {
            if readonly {
                return Err(Error::Corruption {
                    details: "file too small to contain meta pages".into(),
                });
            }
            file.set_len(min_size)?;
            file_size = min_size;
        }
        if map_size < 2 * PAGE_SIZE {
            return Err(Error::InvalidParameter("map size smaller than two pages"));
        }

        let (map, base) = if readonly {
            // SAFETY: the file stays open for the life of the mapping.
            let m = unsafe { MmapOptions::new().len(map_size).map(&file)? };
            let base = m.as_ptr();
            (Mapping::Ro(m), base)
        } else {
            // SAFETY: as above; mapping past EOF is fine, those pages become
            // accessible once the file is extended under them.
            let mut m = unsafe { MmapOptions::new().len(map_size).map_mut(&file)? };
            let base = m.as_mut_ptr() as *const u8;
            (Mapping::Rw(m), base)
        };

        Ok((
            Self { file, map, base, map_size, file_size: AtomicU64::new(file_size), readonly },
            fresh,
        ))
    }

    /// Configured map size in bytes
    pub fn map_size(&self) -> usize {
        self.map_size
    }

    /// Current file length in bytes
    pub fn file_len(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    fn page_offset(&self, pgno: Pgno) -> Result<usize> {
        let offset = pgno.0 as usize * PAGE_SIZE;
        let accessible = (self.file_len() as usize).min(self.map_size);
        if offset + PAGE_SIZE > accessible {
            return Err(Error::Corruption {
                details: format!("page {} beyond end of file or map", pgno),
            });
        }
        Ok(offset)
    }

    /// Zero-copy reference to a page in the map.
    ///
    /// # Safety
    /// The caller must not use the returned reference beyond the lifetime of
    /// the transaction that obtained it, and must only request pages that are
    /// immutable for that transaction (committed pages under CoW).
    pub unsafe fn page_ref<'a>(&self, pgno: Pgno) -> Result<&'a Page> {
        let offset = self.page_offset(pgno)?;
        // SAFETY: bounds checked above; map base is PAGE_SIZE aligned and
        // file offsets are page multiples.
        Ok(unsafe { Page::from_raw(self.base.add(offset)) })
    }

    /// Copy a dirty page buffer to its physical location in the map
    pub fn write_page(&self, page: &Page) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        let offset = self.page_offset(page.header.pgno())?;
        // SAFETY: bounds checked; the single writer is the only mutator and
        // this page is not part of any committed tree yet.
        unsafe {
            std::ptr::copy_nonoverlapping(
                page.as_bytes().as_ptr(),
                self.base.add(offset) as *mut u8,
                PAGE_SIZE,
            );
        }
        Ok(())
    }

    /// Read a meta page out of the map
    pub fn read_meta(&self, slot: Pgno) -> Result<MetaPage> {
        let offset = self.page_offset(slot)?;
        // SAFETY: bounds checked; read_unaligned so no alignment assumption.
        Ok(unsafe { std::ptr::read_unaligned(self.base.add(offset) as *const MetaPage) })
    }

    /// Write a meta page, zeroing the reserved remainder of the page
    pub fn write_meta(&self, slot: Pgno, meta: &MetaPage) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        let offset = self.page_offset(slot)?;
        // SAFETY: bounds checked; meta slots are written only by the single
        // writer (commit) or at creation before any reader exists.
        unsafe {
            let dst = self.base.add(offset) as *mut u8;
            std::ptr::write_bytes(dst, 0, PAGE_SIZE);
            std::ptr::copy_nonoverlapping(
                meta as *const MetaPage as *const u8,
                dst,
                std::mem::size_of::<MetaPage>(),
            );
        }
        Ok(())
    }

    /// Extend the file so pages up to and including `last_pgno` exist
    pub fn grow(&self, last_pgno: Pgno) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        let needed = (last_pgno.0 + 1) * PAGE_SIZE as u64;
        if needed as usize > self.map_size {
            return Err(Error::MapFull);
        }
        if needed > self.file_len() {
            self.file.set_len(needed)?;
            self.file_size.store(needed, Ordering::Release);
        }
        Ok(())
    }

    /// Flush the data region of the map to disk (msync), plus the file
    /// metadata so a crash cannot forget a `set_len` extension
    pub fn sync(&self) -> Result<()> {
        if let Mapping::Rw(map) = &self.map {
            map.flush()?;
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Flush a single page range of the map to disk
    pub fn sync_page(&self, pgno: Pgno) -> Result<()> {
        if let Mapping::Rw(map) = &self.map {
            map.flush_range(pgno.0 as usize * PAGE_SIZE, PAGE_SIZE)?;
        }
        Ok(())
    }
}
