// src/data_loader/image_deserializer.rs
//
//! Reference image deserializer.
//!
//! A map file lists one `path<TAB>label` entry per line.  Every entry is a
//! one-sample sequence with two dense float streams: `features`
//! (`[channels, width, height]`, interleaved pixel values in 0..255) and `labels`
//! (one-hot over `num_classes`).  Images are decoded when their chunk is
//! loaded, through a [`FileByteReader`] or, when the config names an
//! archive, a [`ZipByteReader`].

use crate::data_loader::byte_reader::{ByteReader, FileByteReader, ZipByteReader};
use crate::data_loader::deserializer::{
    Chunk, ChunkDescription, ChunkId, ChunkPtr, DataDeserializer, SequenceData, SequenceDataPtr,
    SequenceDescription, SequenceKey,
};
use crate::data_loader::error::{ReaderError, Result};
use crate::data_loader::options::ImageDeserializerConfig;
use crate::data_loader::stream::{SampleLayout, StreamDescription, StreamDescriptionPtr};

use rayon::prelude::*;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// One map-file line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub path: String,
    pub label: usize,
}

/// Parse `path<TAB>label` lines; blank lines are skipped.
pub fn parse_map(text: &str, source: &str) -> Result<Vec<ImageEntry>> {
    let mut entries = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let (path, label) = line.split_once('\t').ok_or_else(|| {
            ReaderError::inconsistent(format!("{}:{}: expected 'path<TAB>label'", source, n + 1))
        })?;
        let label = label.trim().parse::<usize>().map_err(|e| {
            ReaderError::inconsistent(format!("{}:{}: bad label '{}': {}", source, n + 1, label.trim(), e))
        })?;
        entries.push(ImageEntry { path: path.to_string(), label });
    }
    Ok(entries)
}

pub struct ImageDeserializer {
    streams: Vec<StreamDescriptionPtr>,
    entries: Vec<ImageEntry>,
    reader: Arc<dyn ByteReader>,
    width: usize,
    height: usize,
    channels: usize,
    num_classes: usize,
    chunk_size: usize,
}

impl ImageDeserializer {
    /// Read the map file named by `config` and pick the byte reader.
    /// Loose-file paths are resolved against the map file's directory.
    pub fn new(config: &ImageDeserializerConfig) -> Result<Self> {
        let text = std::fs::read_to_string(&config.map_file)?;
        let entries = parse_map(&text, &config.map_file)?;
        let reader: Box<dyn ByteReader> = match &config.zip_file {
            Some(zip) => Box::new(ZipByteReader::new(zip)?),
            None => {
                let base = Path::new(&config.map_file).parent().unwrap_or_else(|| Path::new(""));
                Box::new(FileByteReader::with_base(base))
            }
        };
        Self::with_reader(config, entries, reader)
    }

    /// Build over already parsed entries; every entry is registered with
    /// `reader` before it is shared.
    pub fn with_reader(
        config: &ImageDeserializerConfig,
        entries: Vec<ImageEntry>,
        mut reader: Box<dyn ByteReader>,
    ) -> Result<Self> {
        if config.channels != 1 && config.channels != 3 {
            return Err(ReaderError::config(format!("unsupported channel count {}", config.channels)));
        }
        if config.width == 0 || config.height == 0 || config.num_classes == 0 || config.chunk_size == 0 {
            return Err(ReaderError::config(
                "image width, height, numClasses and chunkSize must be positive",
            ));
        }
        for (seq_id, entry) in entries.iter().enumerate() {
            if entry.label >= config.num_classes {
                return Err(ReaderError::inconsistent(format!(
                    "label {} of '{}' is outside {} classes",
                    entry.label, entry.path, config.num_classes
                )));
            }
            reader.register(seq_id, &entry.path)?;
        }

        let streams = vec![
            Arc::new(StreamDescription::dense(
                0,
                "features",
                SampleLayout::new(vec![config.channels, config.width, config.height]),
            )),
            Arc::new(StreamDescription::dense(1, "labels", SampleLayout::vector(config.num_classes))),
        ];
        debug!(images = entries.len(), chunk_size = config.chunk_size, "image deserializer ready");

        Ok(Self {
            streams,
            entries,
            reader: Arc::from(reader),
            width: config.width,
            height: config.height,
            channels: config.channels,
            num_classes: config.num_classes,
            chunk_size: config.chunk_size,
        })
    }

    fn num_chunks(&self) -> usize {
        self.entries.len().div_ceil(self.chunk_size)
    }

    fn chunk_range(&self, chunk_id: ChunkId) -> Result<std::ops::Range<usize>> {
        if chunk_id >= self.num_chunks() {
            return Err(ReaderError::from(format!("unknown chunk {}", chunk_id)));
        }
        let begin = chunk_id * self.chunk_size;
        Ok(begin..(begin + self.chunk_size).min(self.entries.len()))
    }

    fn decode(&self, seq_id: usize) -> Result<Vec<SequenceDataPtr>> {
        let entry = &self.entries[seq_id];
        let img = self.reader.read(seq_id, &entry.path, self.channels == 1)?;
        if img.rows != self.height || img.cols != self.width || img.channels != self.channels {
            return Err(ReaderError::inconsistent(format!(
                "'{}' is {}x{}x{}, expected {}x{}x{}",
                entry.path, img.cols, img.rows, img.channels, self.width, self.height, self.channels
            )));
        }
        let pixels: Vec<f32> = img.data.iter().map(|&b| b as f32).collect();
        let mut label = vec![0.0f32; self.num_classes];
        label[entry.label] = 1.0;
        Ok(vec![
            Arc::new(SequenceData::dense_from(1, &pixels)),
            Arc::new(SequenceData::dense_from(1, &label)),
        ])
    }
}

struct ImageChunk {
    sequences: Vec<Vec<SequenceDataPtr>>,
}

impl Chunk for ImageChunk {
    fn get_sequence(&self, index_in_chunk: usize) -> Result<Vec<SequenceDataPtr>> {
        self.sequences
            .get(index_in_chunk)
            .cloned()
            .ok_or_else(|| ReaderError::from(format!("sequence {} not in chunk", index_in_chunk)))
    }
}

impl DataDeserializer for ImageDeserializer {
    fn stream_descriptions(&self) -> Vec<StreamDescriptionPtr> {
        self.streams.clone()
    }

    fn chunk_descriptions(&self) -> Vec<ChunkDescription> {
        (0..self.num_chunks())
            .map(|id| {
                let n = (self.entries.len() - id * self.chunk_size).min(self.chunk_size);
                ChunkDescription { id, number_of_sequences: n, number_of_samples: n }
            })
            .collect()
    }

    fn sequences_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<SequenceDescription>> {
        let range = self.chunk_range(chunk_id)?;
        let begin = range.start;
        Ok(range
            .map(|i| SequenceDescription {
                index_in_chunk: i - begin,
                chunk_id,
                number_of_samples: 1,
                key: i as SequenceKey,
            })
            .collect())
    }

    fn sequence_by_key(&self, key: SequenceKey) -> Option<SequenceDescription> {
        let i = usize::try_from(key).ok().filter(|&i| i < self.entries.len())?;
        Some(SequenceDescription {
            index_in_chunk: i % self.chunk_size,
            chunk_id: i / self.chunk_size,
            number_of_samples: 1,
            key,
        })
    }

    fn get_chunk(&self, chunk_id: ChunkId) -> Result<ChunkPtr> {
        let range = self.chunk_range(chunk_id)?;
        trace!(chunk_id, images = range.len(), "decoding image chunk");
        // Images decode on the rayon pool; each read checks out its own
        // archive handle.
        let sequences = range.into_par_iter().map(|i| self.decode(i)).collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(ImageChunk { sequences }))
    }
}
