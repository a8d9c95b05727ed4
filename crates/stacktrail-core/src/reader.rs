//! # Reader Layer
//!
//! Random-access byte sources that everything above parses from.
//!
//! A [`Reader`] serves absolute-offset reads; for an ELF image on disk the
//! offset is a file offset, for a process address space it is a virtual
//! address. Readers compose: [`CacheReader`] wraps any other reader behind a
//! bounded page cache, and the decompressing readers expose the inflated
//! view of a compressed section as if it were a flat file.

use std::fmt;
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::error::{Error, Result};

/// Random-access byte source.
///
/// `read_at` is the raw primitive: it reads as many bytes as are available,
/// tolerating a short tail at the end of the source. The strict helpers
/// (`read_exact_at`, `read_string_at`) are built on top of it and fail with
/// [`Error::ShortRead`] / [`Error::UnterminatedString`] instead.
pub trait Reader: Send + Sync
{
    /// Read up to `dst.len()` bytes at `offset`; returns the count read,
    /// which is less than requested only at the end of the source.
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize>;

    /// Short human-readable identifier (a path, `pid 1234`, ...).
    fn describe(&self) -> String;

    /// Read exactly `dst.len()` bytes at `offset`.
    fn read_exact_at(&self, offset: u64, dst: &mut [u8]) -> Result<()>
    {
        let got = self.read_at(offset, dst)?;
        if got != dst.len() {
            return Err(Error::ShortRead {
                offset,
                wanted: dst.len(),
                got,
            });
        }
        Ok(())
    }

    /// Read a NUL-terminated string at `offset`. Running off the end of the
    /// reader before the NUL is the only failure.
    fn read_string_at(&self, offset: u64) -> Result<String>
    {
        let mut out = Vec::new();
        let mut chunk = [0u8; 256];
        let mut pos = offset;
        loop {
            let got = self.read_at(pos, &mut chunk)?;
            if let Some(nul) = chunk[..got].iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.extend_from_slice(&chunk[..got]);
            if got < chunk.len() {
                return Err(Error::UnterminatedString(offset));
            }
            pos += got as u64;
        }
    }
}

impl fmt::Debug for dyn Reader
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "Reader({})", self.describe())
    }
}

/// Reader over a file on disk.
pub struct FileReader
{
    path: PathBuf,
    file: File,
}

impl FileReader
{
    pub fn open(path: impl AsRef<Path>) -> Result<Self>
    {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path
    {
        &self.path
    }
}

impl Reader for FileReader
{
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize>
    {
        // pread can return short counts before EOF; loop until it settles.
        let mut done = 0;
        while done < dst.len() {
            let got = self.file.read_at(&mut dst[done..], offset + done as u64)?;
            if got == 0 {
                break;
            }
            done += got;
        }
        Ok(done)
    }

    fn describe(&self) -> String
    {
        self.path.display().to_string()
    }
}

/// Reader over an in-memory byte buffer.
///
/// Used by the test fixtures and for images that only exist inside a target
/// address space (a loaded object whose backing file is gone).
pub struct MemReader
{
    name: String,
    data: Arc<[u8]>,
}

impl MemReader
{
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self
    {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

impl Reader for MemReader
{
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize>
    {
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let avail = (len - offset) as usize;
        let take = avail.min(dst.len());
        dst[..take].copy_from_slice(&self.data[offset as usize..offset as usize + take]);
        Ok(take)
    }

    fn describe(&self) -> String
    {
        self.name.clone()
    }
}

/// Page size of the caching reader.
pub const CACHE_PAGE_SIZE: usize = 4096;

const DEFAULT_CACHE_PAGES: usize = 256;

struct CachePage
{
    data: Vec<u8>,
}

/// Caching wrapper around any reader.
///
/// The backing source is partitioned into [`CACHE_PAGE_SIZE`] pages held in
/// a bounded LRU keyed by page index; hits are served without touching the
/// backing reader, misses evict the least-recently-used page. A short page
/// marks the end of the source and is cached like any other.
pub struct CacheReader
{
    inner: Arc<dyn Reader>,
    pages: Mutex<LruCache<u64, CachePage>>,
}

impl CacheReader
{
    pub fn new(inner: Arc<dyn Reader>) -> Self
    {
        Self::with_capacity(inner, DEFAULT_CACHE_PAGES)
    }

    pub fn with_capacity(inner: Arc<dyn Reader>, pages: usize) -> Self
    {
        let cap = NonZeroUsize::new(pages.max(1)).unwrap();
        Self {
            inner,
            pages: Mutex::new(LruCache::new(cap)),
        }
    }
}

impl Reader for CacheReader
{
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize>
    {
        let mut pages = self.pages.lock().unwrap();
        let mut done = 0;
        while done < dst.len() {
            let pos = offset + done as u64;
            let index = pos / CACHE_PAGE_SIZE as u64;
            let in_page = (pos % CACHE_PAGE_SIZE as u64) as usize;

            if pages.get(&index).is_none() {
                let mut buf = vec![0u8; CACHE_PAGE_SIZE];
                let got = match self.inner.read_at(index * CACHE_PAGE_SIZE as u64, &mut buf) {
                    Ok(got) => got,
                    Err(err) if done > 0 => {
                        // A failed page after partial progress acts as the
                        // end of the readable range.
                        tracing::trace!("cache fill failed past {done} bytes: {err}");
                        return Ok(done);
                    }
                    Err(err) => return Err(err),
                };
                buf.truncate(got);
                pages.put(index, CachePage { data: buf });
            }

            let page = pages.get(&index).expect("page just inserted");
            if in_page >= page.data.len() {
                break;
            }
            let take = (page.data.len() - in_page).min(dst.len() - done);
            dst[done..done + take].copy_from_slice(&page.data[in_page..in_page + take]);
            done += take;
            if in_page + take < CACHE_PAGE_SIZE {
                // Short page: nothing follows it.
                break;
            }
        }
        Ok(done)
    }

    fn describe(&self) -> String
    {
        self.inner.describe()
    }
}

/// Reader exposing the inflated view of a zlib-compressed section.
///
/// The whole blob is inflated on first use and memoized; sections carrying
/// debug data are small relative to the images they describe, so the
/// re-inflation cost of a streaming implementation is not worth its
/// complexity here.
#[cfg(feature = "zlib")]
pub struct InflateReader
{
    name: String,
    compressed: Arc<[u8]>,
    inflated_size: u64,
    inflated: once_cell::sync::OnceCell<Vec<u8>>,
}

#[cfg(feature = "zlib")]
impl InflateReader
{
    pub fn new(name: impl Into<String>, compressed: impl Into<Arc<[u8]>>, inflated_size: u64) -> Self
    {
        Self {
            name: name.into(),
            compressed: compressed.into(),
            inflated_size,
            inflated: once_cell::sync::OnceCell::new(),
        }
    }

    fn inflated(&self) -> Result<&[u8]>
    {
        self.inflated
            .get_or_try_init(|| {
                use std::io::Read;
                let mut out = Vec::with_capacity(self.inflated_size as usize);
                flate2::read::ZlibDecoder::new(&self.compressed[..])
                    .read_to_end(&mut out)
                    .map_err(|err| Error::TruncatedSection(format!("{}: inflate failed: {err}", self.name)))?;
                Ok(out)
            })
            .map(Vec::as_slice)
    }
}

#[cfg(feature = "zlib")]
impl Reader for InflateReader
{
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize>
    {
        let data = self.inflated()?;
        if offset >= data.len() as u64 {
            return Ok(0);
        }
        let avail = data.len() - offset as usize;
        let take = avail.min(dst.len());
        dst[..take].copy_from_slice(&data[offset as usize..offset as usize + take]);
        Ok(take)
    }

    fn describe(&self) -> String
    {
        format!("{} (inflated)", self.name)
    }
}

/// Reader exposing the decoded view of an xz-compressed section.
#[cfg(feature = "xz")]
pub struct XzReader
{
    name: String,
    compressed: Arc<[u8]>,
    inflated_size: u64,
    inflated: once_cell::sync::OnceCell<Vec<u8>>,
}

#[cfg(feature = "xz")]
impl XzReader
{
    pub fn new(name: impl Into<String>, compressed: impl Into<Arc<[u8]>>, inflated_size: u64) -> Self
    {
        Self {
            name: name.into(),
            compressed: compressed.into(),
            inflated_size,
            inflated: once_cell::sync::OnceCell::new(),
        }
    }

    fn inflated(&self) -> Result<&[u8]>
    {
        self.inflated
            .get_or_try_init(|| {
                use std::io::Read;
                let mut out = Vec::with_capacity(self.inflated_size as usize);
                xz2::read::XzDecoder::new(&self.compressed[..])
                    .read_to_end(&mut out)
                    .map_err(|err| Error::TruncatedSection(format!("{}: xz decode failed: {err}", self.name)))?;
                Ok(out)
            })
            .map(Vec::as_slice)
    }
}

#[cfg(feature = "xz")]
impl Reader for XzReader
{
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize>
    {
        let data = self.inflated()?;
        if offset >= data.len() as u64 {
            return Ok(0);
        }
        let avail = data.len() - offset as usize;
        let take = avail.min(dst.len());
        dst[..take].copy_from_slice(&data[offset as usize..offset as usize + take]);
        Ok(take)
    }

    fn describe(&self) -> String
    {
        format!("{} (xz)", self.name)
    }
}
