// src/data_loader/bundler.rs
//
//! Bundles several deserializers into one logical source.
//!
//! The primary deserializer drives the chunk/sequence catalog; every other
//! deserializer is aligned to it by sequence key.  Streams of all
//! deserializers are concatenated and renumbered into one contiguous id
//! space.

use crate::constants::MAX_REPORTED_MISMATCHES;
use crate::data_loader::deserializer::{
    Chunk, ChunkDescription, ChunkId, ChunkPtr, DataDeserializer, DataDeserializerPtr,
    SequenceDataPtr, SequenceDescription, SequenceKey,
};
use crate::data_loader::error::{ReaderError, Result};
use crate::data_loader::stream::{StreamDescription, StreamDescriptionPtr};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// One disagreement found while cross-checking deserializers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    SequenceCount { deserializer: usize, expected: usize, actual: usize },
    MissingKey { deserializer: usize, key: SequenceKey },
    SampleCount { deserializer: usize, key: SequenceKey, expected: usize, actual: usize },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::SequenceCount { deserializer, expected, actual } => write!(
                f,
                "deserializer {} has {} sequences, primary has {}",
                deserializer, actual, expected
            ),
            Mismatch::MissingKey { deserializer, key } => {
                write!(f, "deserializer {} has no sequence with key {}", deserializer, key)
            }
            Mismatch::SampleCount { deserializer, key, expected, actual } => write!(
                f,
                "sequence {}: deserializer {} has {} samples, primary has {}",
                key, deserializer, actual, expected
            ),
        }
    }
}

pub struct Bundler {
    deserializers: Vec<DataDeserializerPtr>,
    primary: usize,
    streams: Vec<StreamDescriptionPtr>,
    chunks: Vec<ChunkDescription>,
}

impl Bundler {
    /// Bundle `deserializers`, taking the catalog from `deserializers[primary]`.
    ///
    /// With `cleanse` set, all deserializers are cross-checked up front and
    /// any disagreement fails construction.
    pub fn new(deserializers: Vec<DataDeserializerPtr>, primary: usize, cleanse: bool) -> Result<Self> {
        if deserializers.is_empty() {
            return Err(ReaderError::config("no deserializers configured"));
        }
        if primary >= deserializers.len() {
            return Err(ReaderError::config(format!(
                "primary deserializer {} out of range ({} configured)",
                primary,
                deserializers.len()
            )));
        }

        let mut streams = Vec::new();
        for d in &deserializers {
            for s in d.stream_descriptions() {
                let renumbered = StreamDescription { id: streams.len(), ..(*s).clone() };
                streams.push(Arc::new(renumbered));
            }
        }

        let chunks = deserializers[primary].chunk_descriptions();
        let bundler = Self { deserializers, primary, streams, chunks };

        if cleanse {
            let mismatches = bundler.find_mismatches()?;
            if !mismatches.is_empty() {
                let shown: Vec<String> =
                    mismatches.iter().take(MAX_REPORTED_MISMATCHES).map(|m| m.to_string()).collect();
                return Err(ReaderError::inconsistent(format!(
                    "{} mismatch(es) between deserializers: {}",
                    mismatches.len(),
                    shown.join("; ")
                )));
            }
        }

        debug!(
            deserializers = bundler.deserializers.len(),
            streams = bundler.streams.len(),
            chunks = bundler.chunks.len(),
            "bundled deserializers"
        );
        Ok(bundler)
    }

    /// Walk the primary catalog alongside every secondary deserializer and
    /// collect every disagreement.
    pub fn find_mismatches(&self) -> Result<Vec<Mismatch>> {
        let primary = &self.deserializers[self.primary];
        let mut primary_seqs = Vec::new();
        for chunk in &self.chunks {
            primary_seqs.extend(primary.sequences_for_chunk(chunk.id)?);
        }

        let mut mismatches = Vec::new();
        for (index, d) in self.deserializers.iter().enumerate() {
            if index == self.primary {
                continue;
            }
            let total: usize = d.chunk_descriptions().iter().map(|c| c.number_of_sequences).sum();
            if total != primary_seqs.len() {
                mismatches.push(Mismatch::SequenceCount {
                    deserializer: index,
                    expected: primary_seqs.len(),
                    actual: total,
                });
            }
            for p in &primary_seqs {
                match d.sequence_by_key(p.key) {
                    None => mismatches.push(Mismatch::MissingKey { deserializer: index, key: p.key }),
                    Some(s) if s.number_of_samples != p.number_of_samples => {
                        mismatches.push(Mismatch::SampleCount {
                            deserializer: index,
                            key: p.key,
                            expected: p.number_of_samples,
                            actual: s.number_of_samples,
                        })
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(mismatches)
    }
}

/// A primary chunk plus, per sequence, where every deserializer keeps it.
struct BundledChunk {
    sequences: Vec<Vec<(ChunkPtr, usize)>>,
}

impl Chunk for BundledChunk {
    fn get_sequence(&self, index_in_chunk: usize) -> Result<Vec<SequenceDataPtr>> {
        let parts = self
            .sequences
            .get(index_in_chunk)
            .ok_or_else(|| ReaderError::from(format!("sequence {} not in bundled chunk", index_in_chunk)))?;
        let mut data = Vec::new();
        for (chunk, index) in parts {
            data.extend(chunk.get_sequence(*index)?);
        }
        Ok(data)
    }
}

impl DataDeserializer for Bundler {
    fn stream_descriptions(&self) -> Vec<StreamDescriptionPtr> {
        self.streams.clone()
    }

    fn chunk_descriptions(&self) -> Vec<ChunkDescription> {
        self.chunks.clone()
    }

    fn sequences_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<SequenceDescription>> {
        self.deserializers[self.primary].sequences_for_chunk(chunk_id)
    }

    fn sequence_by_key(&self, key: SequenceKey) -> Option<SequenceDescription> {
        self.deserializers[self.primary].sequence_by_key(key)
    }

    fn get_chunk(&self, chunk_id: ChunkId) -> Result<ChunkPtr> {
        let primary_seqs = self.sequences_for_chunk(chunk_id)?;
        let mut sequences: Vec<Vec<(ChunkPtr, usize)>> =
            (0..primary_seqs.len()).map(|_| Vec::with_capacity(self.deserializers.len())).collect();

        for (index, d) in self.deserializers.iter().enumerate() {
            if index == self.primary {
                let chunk = d.get_chunk(chunk_id)?;
                for (slot, seq) in sequences.iter_mut().zip(&primary_seqs) {
                    slot.push((chunk.clone(), seq.index_in_chunk));
                }
                continue;
            }

            // Secondary sequences may be spread over several of its chunks.
            let mut loaded: HashMap<ChunkId, ChunkPtr> = HashMap::new();
            for (slot, seq) in sequences.iter_mut().zip(&primary_seqs) {
                let found = d.sequence_by_key(seq.key).ok_or_else(|| {
                    ReaderError::inconsistent(format!(
                        "deserializer {} has no sequence with key {}",
                        index, seq.key
                    ))
                })?;
                let chunk = match loaded.get(&found.chunk_id) {
                    Some(c) => c.clone(),
                    None => {
                        let c = d.get_chunk(found.chunk_id)?;
                        loaded.insert(found.chunk_id, c.clone());
                        c
                    }
                };
                slot.push((chunk, found.index_in_chunk));
            }
        }

        Ok(Arc::new(BundledChunk { sequences }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_loader::deserializer::{MemoryDeserializer, MemorySequence, SequenceData};
    use crate::data_loader::stream::SampleLayout;

    fn source(name: &str, keys: &[(u64, usize)]) -> DataDeserializerPtr {
        let mut d = MemoryDeserializer::new(vec![StreamDescription::dense(0, name, SampleLayout::vector(1))]);
        let seqs = keys
            .iter()
            .map(|&(key, n)| MemorySequence {
                key,
                data: vec![SequenceData::dense_from(n, &vec![key as f32; n])],
            })
            .collect();
        d.add_chunk(seqs).unwrap();
        Arc::new(d)
    }

    #[test]
    fn streams_are_renumbered_contiguously() {
        let a = source("features", &[(1, 1), (2, 1)]);
        let b = source("labels", &[(2, 1), (1, 1)]);
        let bundler = Bundler::new(vec![a, b], 0, true).unwrap();
        let streams = bundler.stream_descriptions();
        assert_eq!(streams.len(), 2);
        assert_eq!((streams[0].id, streams[0].name.as_str()), (0, "features"));
        assert_eq!((streams[1].id, streams[1].name.as_str()), (1, "labels"));
    }

    #[test]
    fn bundled_chunk_aligns_by_key() {
        let a = source("features", &[(1, 1), (2, 1)]);
        let b = source("labels", &[(2, 1), (1, 1)]);
        let bundler = Bundler::new(vec![a, b], 0, false).unwrap();
        let chunk = bundler.get_chunk(0).unwrap();
        let second = chunk.get_sequence(1).unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0], second[1]); // both streams carry key 2 as value
    }

    #[test]
    fn cleanse_reports_missing_keys() {
        let a = source("features", &[(1, 1), (2, 1), (3, 1)]);
        let b = source("labels", &[(1, 1), (2, 1)]);
        let err = Bundler::new(vec![a, b], 0, true).err().expect("must fail");
        match err {
            ReaderError::DataInconsistency(msg) => {
                assert!(msg.starts_with("2 mismatch"), "{}", msg);
                assert!(msg.contains("key 3"), "{}", msg);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn cleanse_reports_sample_count_mismatch() {
        let a = source("features", &[(1, 2)]);
        let b = source("labels", &[(1, 1)]);
        let bundler = Bundler::new(vec![a.clone(), b.clone()], 0, false).unwrap();
        assert_eq!(
            bundler.find_mismatches().unwrap(),
            vec![Mismatch::SampleCount { deserializer: 1, key: 1, expected: 2, actual: 1 }]
        );
        assert!(Bundler::new(vec![a, b], 0, true).is_err());
    }

    #[test]
    fn without_cleanse_missing_key_fails_at_load() {
        let a = source("features", &[(1, 1), (5, 1)]);
        let b = source("labels", &[(1, 1)]);
        let bundler = Bundler::new(vec![a, b], 0, false).unwrap();
        assert!(matches!(bundler.get_chunk(0), Err(ReaderError::DataInconsistency(_))));
    }

    #[test]
    fn empty_list_is_config_error() {
        assert!(matches!(Bundler::new(Vec::new(), 0, false), Err(ReaderError::Config(_))));
    }
}
