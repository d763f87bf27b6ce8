//! File-backed shared mappings.
//!
//! Every worker process maps the same file read-write with `MAP_SHARED`, so
//! stores made by one process are visible to all others. The mapping never
//! moves for the lifetime of a `SharedMap`, but each process may see it at a
//! different virtual address: anything stored inside must be addressed by
//! offset, never by pointer.

use memmap2::MmapMut;
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

pub struct SharedMap {
    _file: File,
    path: PathBuf,
    mmap: MmapMut,
}

impl SharedMap {
    /// Create (or truncate) the file at `path`, size it to `size_bytes` and map it.
    ///
    /// The fresh region is zero-filled by the kernel.
    pub fn create<P: AsRef<Path>>(path: P, size_bytes: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(size_bytes as u64)?;

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            _file: file,
            path: path.as_ref().to_path_buf(),
            mmap,
        })
    }

    /// Map an existing file created by another process.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        if file.metadata()?.len() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared map file is empty",
            ));
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            _file: file,
            path: path.as_ref().to_path_buf(),
            mmap,
        })
    }

    /// Raw pointer to the first byte of the mapping.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
