// src/data_loader/byte_reader.rs
//
// Raw sample bytes for the image deserializer, from loose files or from
// entries of a zip archive, decoded into 8-bit pixel matrices.

use crate::data_loader::error::{ReaderError, Result};
use crate::data_loader::pool::ConcPool;

use image::DynamicImage;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use zip::ZipArchive;

/// Decoded image: `rows x cols` pixels of `channels` interleaved bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMatrix {
    pub rows: usize,
    pub cols: usize,
    pub channels: usize,
    pub data: Vec<u8>,
}

impl ImageMatrix {
    fn decode(bytes: &[u8], grayscale: bool) -> Result<Self> {
        let img: DynamicImage = image::load_from_memory(bytes)?;
        let (cols, rows) = (img.width() as usize, img.height() as usize);
        let (channels, data) = if grayscale {
            (1, img.to_luma8().into_raw())
        } else {
            (3, img.to_rgb8().into_raw())
        };
        Ok(Self { rows, cols, channels, data })
    }
}

pub trait ByteReader: Send + Sync {
    /// Announce that `seq_id` will later be read from `path`.
    fn register(&mut self, seq_id: usize, path: &str) -> Result<()>;

    fn read(&self, seq_id: usize, path: &str, grayscale: bool) -> Result<ImageMatrix>;
}

/// Reads loose files; `path` is taken relative to an optional base directory.
#[derive(Debug, Clone, Default)]
pub struct FileByteReader {
    base: Option<PathBuf>,
}

impl FileByteReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base(base: impl AsRef<Path>) -> Self {
        Self { base: Some(base.as_ref().to_owned()) }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.base {
            Some(base) => base.join(path),
            None => PathBuf::from(path),
        }
    }
}

impl ByteReader for FileByteReader {
    fn register(&mut self, _seq_id: usize, _path: &str) -> Result<()> {
        Ok(())
    }

    fn read(&self, _seq_id: usize, path: &str, grayscale: bool) -> Result<ImageMatrix> {
        let bytes = std::fs::read(self.resolve(path))?;
        ImageMatrix::decode(&bytes, grayscale)
    }
}

/// Reads entries of one zip archive.
///
/// Archive handles and scratch buffers are pooled: a read borrows one of
/// each and returns both when it finishes, so concurrent readers never
/// share a handle and the number of open handles matches the peak number
/// of concurrent reads.
pub struct ZipByteReader {
    zip_path: PathBuf,
    archives: ConcPool<ZipArchive<File>>,
    buffers: ConcPool<Vec<u8>>,
    /// seq_id -> (entry index, uncompressed size)
    entries: HashMap<usize, (usize, u64)>,
}

impl ZipByteReader {
    pub fn new(zip_path: impl AsRef<Path>) -> Result<Self> {
        let reader = Self {
            zip_path: zip_path.as_ref().to_owned(),
            archives: ConcPool::new(),
            buffers: ConcPool::new(),
            entries: HashMap::new(),
        };
        // Fail early on a missing or corrupt archive.
        let first = reader.open_archive()?;
        debug!(path = %reader.zip_path.display(), entries = first.len(), "opened zip archive");
        reader.archives.push(first);
        Ok(reader)
    }

    fn open_archive(&self) -> Result<ZipArchive<File>> {
        let file = File::open(&self.zip_path)?;
        Ok(ZipArchive::new(file)?)
    }

    /// Archive handles opened so far.
    pub fn open_handles(&self) -> usize {
        self.archives.created() + 1
    }

    pub fn registered(&self) -> usize {
        self.entries.len()
    }
}

impl ByteReader for ZipByteReader {
    fn register(&mut self, seq_id: usize, path: &str) -> Result<()> {
        let entry = {
            let mut archive = self.archives.checkout(|| self.open_archive())?;
            let index = archive.index_for_name(path).ok_or_else(|| {
                ReaderError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("'{}' not found in {}", path, self.zip_path.display()),
                ))
            })?;
            let size = archive.by_index(index)?.size();
            (index, size)
        };
        self.entries.insert(seq_id, entry);
        Ok(())
    }

    fn read(&self, seq_id: usize, path: &str, grayscale: bool) -> Result<ImageMatrix> {
        let &(index, size) = self
            .entries
            .get(&seq_id)
            .unwrap_or_else(|| panic!("sequence {seq_id} ('{path}') was never registered"));

        let mut archive = self.archives.checkout(|| self.open_archive())?;
        let mut buffer = self.buffers.checkout(|| Ok::<_, ReaderError>(Vec::new()))?;
        buffer.clear();
        buffer.reserve(size as usize);
        archive.by_index(index)?.read_to_end(&mut *buffer)?;
        trace!(seq_id, path, bytes = buffer.len(), "read zip entry");

        ImageMatrix::decode(&buffer, grayscale)
    }
}
