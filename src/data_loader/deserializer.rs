// src/data_loader/deserializer.rs
//
//! Deserializer contract: a chunked catalog of sequences plus on-demand
//! chunk loading.  Also home of the in-memory `MemoryDeserializer`.

use crate::data_loader::error::{ReaderError, Result};
use crate::data_loader::stream::{Element, StorageType, StreamDescription, StreamDescriptionPtr};

use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Identifier of a chunk inside one deserializer.
pub type ChunkId = usize;

/// Stable identity of a sequence across epochs and across deserializers.
pub type SequenceKey = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescription {
    pub id: ChunkId,
    pub number_of_sequences: usize,
    pub number_of_samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceDescription {
    pub index_in_chunk: usize,
    pub chunk_id: ChunkId,
    pub number_of_samples: usize,
    pub key: SequenceKey,
}

/// Raw payload of one sequence of one stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SequencePayload {
    /// Native-endian elements, sample after sample.
    Dense(Bytes),
    /// Per-sample non-zeros: `nnz_counts[i]` entries of `indices`/`values`
    /// belong to sample `i`.
    Sparse {
        indices: Vec<usize>,
        nnz_counts: Vec<usize>,
        values: Bytes,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceData {
    pub number_of_samples: usize,
    pub payload: SequencePayload,
}

pub type SequenceDataPtr = Arc<SequenceData>;

impl SequenceData {
    pub fn dense(number_of_samples: usize, data: Bytes) -> Self {
        Self { number_of_samples, payload: SequencePayload::Dense(data) }
    }

    /// Dense sequence from typed values.
    pub fn dense_from<E: Element>(number_of_samples: usize, values: &[E]) -> Self {
        Self::dense(number_of_samples, Bytes::copy_from_slice(bytemuck::cast_slice(values)))
    }

    /// Sparse sequence from typed values.
    pub fn sparse_from<E: Element>(nnz_counts: Vec<usize>, indices: Vec<usize>, values: &[E]) -> Self {
        Self {
            number_of_samples: nnz_counts.len(),
            payload: SequencePayload::Sparse {
                indices,
                nnz_counts,
                values: Bytes::copy_from_slice(bytemuck::cast_slice(values)),
            },
        }
    }

    /// Check the payload against the stream it is supposed to belong to.
    pub fn validate(&self, stream: &StreamDescription) -> Result<()> {
        let elem = stream.element_type.size();
        let rows = stream.sample_layout.num_elements();
        match (&self.payload, stream.storage_type) {
            (SequencePayload::Dense(data), StorageType::Dense) => {
                let expected = self.number_of_samples * rows * elem;
                if data.len() != expected {
                    return Err(ReaderError::inconsistent(format!(
                        "stream '{}': dense sequence of {} samples holds {} bytes, expected {}",
                        stream.name, self.number_of_samples, data.len(), expected
                    )));
                }
            }
            (SequencePayload::Sparse { indices, nnz_counts, values }, StorageType::Sparse) => {
                let nnz: usize = nnz_counts.iter().sum();
                if nnz_counts.len() != self.number_of_samples
                    || indices.len() != nnz
                    || values.len() != nnz * elem
                {
                    return Err(ReaderError::inconsistent(format!(
                        "stream '{}': malformed sparse sequence ({} samples, {} counts, {} indices, {} value bytes)",
                        stream.name,
                        self.number_of_samples,
                        nnz_counts.len(),
                        indices.len(),
                        values.len()
                    )));
                }
                if let Some(bad) = indices.iter().find(|&&i| i >= rows) {
                    return Err(ReaderError::inconsistent(format!(
                        "stream '{}': sparse index {} out of range for sample of {} elements",
                        stream.name, bad, rows
                    )));
                }
            }
            (_, storage) => {
                return Err(ReaderError::inconsistent(format!(
                    "stream '{}' is {:?} but sequence payload does not match",
                    stream.name, storage
                )));
            }
        }
        Ok(())
    }
}

/// A loaded chunk.  Sequence data is returned per stream of the owning
/// deserializer.
pub trait Chunk: Send + Sync {
    fn get_sequence(&self, index_in_chunk: usize) -> Result<Vec<SequenceDataPtr>>;
}

pub type ChunkPtr = Arc<dyn Chunk>;

/// A source of chunked sequences.
///
/// Descriptions are cheap; `get_chunk` is where I/O and decoding happen.
pub trait DataDeserializer: Send + Sync {
    fn stream_descriptions(&self) -> Vec<StreamDescriptionPtr>;

    fn chunk_descriptions(&self) -> Vec<ChunkDescription>;

    fn sequences_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<SequenceDescription>>;

    /// Locate a sequence by key.  Used to align secondary deserializers
    /// with the primary one.
    fn sequence_by_key(&self, key: SequenceKey) -> Option<SequenceDescription>;

    fn get_chunk(&self, chunk_id: ChunkId) -> Result<ChunkPtr>;
}

pub type DataDeserializerPtr = Arc<dyn DataDeserializer>;

// ────────────────────────────────────────────────────────────────────────────
// In-memory deserializer
// ────────────────────────────────────────────────────────────────────────────

/// One sequence handed to [`MemoryDeserializer::add_chunk`]; `data` holds
/// one entry per stream.
#[derive(Debug, Clone)]
pub struct MemorySequence {
    pub key: SequenceKey,
    pub data: Vec<SequenceData>,
}

struct MemoryChunk {
    sequences: Vec<Vec<SequenceDataPtr>>,
}

impl Chunk for MemoryChunk {
    fn get_sequence(&self, index_in_chunk: usize) -> Result<Vec<SequenceDataPtr>> {
        self.sequences
            .get(index_in_chunk)
            .cloned()
            .ok_or_else(|| ReaderError::from(format!("sequence {} not in chunk", index_in_chunk)))
    }
}

/// Deserializer over sequences already held in memory.
pub struct MemoryDeserializer {
    streams: Vec<StreamDescriptionPtr>,
    chunks: Vec<Arc<MemoryChunk>>,
    descriptions: Vec<Vec<SequenceDescription>>,
    by_key: HashMap<SequenceKey, SequenceDescription>,
    chunk_loads: AtomicUsize,
}

impl MemoryDeserializer {
    pub fn new(streams: Vec<StreamDescription>) -> Self {
        Self {
            streams: streams.into_iter().map(Arc::new).collect(),
            chunks: Vec::new(),
            descriptions: Vec::new(),
            by_key: HashMap::new(),
            chunk_loads: AtomicUsize::new(0),
        }
    }

    /// Append a chunk and return its id.  A rejected chunk leaves the
    /// deserializer unchanged.
    pub fn add_chunk(&mut self, sequences: Vec<MemorySequence>) -> Result<ChunkId> {
        let chunk_id = self.chunks.len();
        let mut descriptions: Vec<SequenceDescription> = Vec::with_capacity(sequences.len());
        let mut keys = HashSet::with_capacity(sequences.len());
        let mut data = Vec::with_capacity(sequences.len());

        for (index_in_chunk, seq) in sequences.into_iter().enumerate() {
            if seq.data.len() != self.streams.len() {
                return Err(ReaderError::inconsistent(format!(
                    "sequence {} carries {} streams, deserializer has {}",
                    seq.key,
                    seq.data.len(),
                    self.streams.len()
                )));
            }
            let samples = seq.data.first().map(|d| d.number_of_samples).unwrap_or(0);
            for (d, stream) in seq.data.iter().zip(&self.streams) {
                if d.number_of_samples != samples {
                    return Err(ReaderError::inconsistent(format!(
                        "sequence {}: stream '{}' has {} samples, expected {}",
                        seq.key, stream.name, d.number_of_samples, samples
                    )));
                }
                d.validate(stream)?;
            }
            let desc = SequenceDescription {
                index_in_chunk,
                chunk_id,
                number_of_samples: samples,
                key: seq.key,
            };
            if self.by_key.contains_key(&seq.key) || !keys.insert(seq.key) {
                return Err(ReaderError::inconsistent(format!("duplicate sequence key {}", seq.key)));
            }
            descriptions.push(desc);
            data.push(seq.data.into_iter().map(Arc::new).collect());
        }

        self.by_key.extend(descriptions.iter().map(|d| (d.key, *d)));
        self.chunks.push(Arc::new(MemoryChunk { sequences: data }));
        self.descriptions.push(descriptions);
        Ok(chunk_id)
    }

    /// Number of `get_chunk` calls served so far.
    pub fn chunk_loads(&self) -> usize {
        self.chunk_loads.load(Ordering::Relaxed)
    }
}

impl DataDeserializer for MemoryDeserializer {
    fn stream_descriptions(&self) -> Vec<StreamDescriptionPtr> {
        self.streams.clone()
    }

    fn chunk_descriptions(&self) -> Vec<ChunkDescription> {
        self.descriptions
            .iter()
            .enumerate()
            .map(|(id, seqs)| ChunkDescription {
                id,
                number_of_sequences: seqs.len(),
                number_of_samples: seqs.iter().map(|s| s.number_of_samples).sum(),
            })
            .collect()
    }

    fn sequences_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<SequenceDescription>> {
        self.descriptions
            .get(chunk_id)
            .cloned()
            .ok_or_else(|| ReaderError::from(format!("unknown chunk {}", chunk_id)))
    }

    fn sequence_by_key(&self, key: SequenceKey) -> Option<SequenceDescription> {
        self.by_key.get(&key).copied()
    }

    fn get_chunk(&self, chunk_id: ChunkId) -> Result<ChunkPtr> {
        let chunk = self
            .chunks
            .get(chunk_id)
            .ok_or_else(|| ReaderError::from(format!("unknown chunk {}", chunk_id)))?;
        self.chunk_loads.fetch_add(1, Ordering::Relaxed);
        Ok(chunk.clone() as ChunkPtr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_loader::stream::SampleLayout;

    fn one_stream() -> MemoryDeserializer {
        MemoryDeserializer::new(vec![StreamDescription::dense(0, "x", SampleLayout::vector(2))])
    }

    #[test]
    fn chunk_catalog_sums_samples() {
        let mut d = one_stream();
        d.add_chunk(vec![
            MemorySequence { key: 1, data: vec![SequenceData::dense_from(1, &[1.0f32, 2.0])] },
            MemorySequence { key: 2, data: vec![SequenceData::dense_from(2, &[1.0f32, 2.0, 3.0, 4.0])] },
        ])
        .unwrap();

        let chunks = d.chunk_descriptions();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].number_of_sequences, 2);
        assert_eq!(chunks[0].number_of_samples, 3);
        assert_eq!(d.sequence_by_key(2).unwrap().index_in_chunk, 1);
    }

    #[test]
    fn rejects_wrong_payload_size() {
        let mut d = one_stream();
        let err = d
            .add_chunk(vec![MemorySequence { key: 1, data: vec![SequenceData::dense_from(2, &[1.0f32])] }])
            .unwrap_err();
        assert!(matches!(err, ReaderError::DataInconsistency(_)));
    }

    #[test]
    fn rejects_duplicate_keys() {
        let mut d = one_stream();
        let seq = MemorySequence { key: 9, data: vec![SequenceData::dense_from(1, &[0.0f32, 0.0])] };
        d.add_chunk(vec![seq.clone()]).unwrap();
        assert!(d.add_chunk(vec![seq]).is_err());
    }

    #[test]
    fn rejected_chunk_leaves_no_trace() {
        let mut d = one_stream();
        let seq = |key| MemorySequence { key, data: vec![SequenceData::dense_from(1, &[0.0f32, 0.0])] };
        assert!(matches!(d.add_chunk(vec![seq(1), seq(1)]), Err(ReaderError::DataInconsistency(_))));
        assert!(d.chunk_descriptions().is_empty());
        assert!(d.sequence_by_key(1).is_none());

        assert_eq!(d.add_chunk(vec![seq(1), seq(2)]).unwrap(), 0);
        assert_eq!(d.sequence_by_key(2).unwrap().chunk_id, 0);
    }

    #[test]
    fn sparse_indices_are_bounds_checked() {
        let stream = StreamDescription::sparse(0, "s", SampleLayout::vector(3));
        let ok = SequenceData::sparse_from(vec![1, 0], vec![2], &[5.0f32]);
        assert!(ok.validate(&stream).is_ok());
        let bad = SequenceData::sparse_from(vec![1], vec![3], &[5.0f32]);
        assert!(bad.validate(&stream).is_err());
    }
}
