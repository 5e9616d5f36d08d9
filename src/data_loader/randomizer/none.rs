// src/data_loader/randomizer/none.rs
//
//! Passthrough enumerator: natural chunk and sequence order, no windowing.
//! Chunks are still decimated across workers so distributed runs see
//! disjoint data.

use super::sweep::{Catalog, PlannedSequence, SweepEnumerator, SweepPlan, SweepPlanner};
use super::{DecimationMode, EpochConfiguration, SequenceEnumerator, Sequences};
use crate::data_loader::deserializer::DataDeserializerPtr;
use crate::data_loader::error::Result;
use crate::data_loader::stream::StreamDescriptionPtr;

struct NaturalOrder;

impl SweepPlanner for NaturalOrder {
    fn plan(&mut self, _sweep: usize, catalog: &Catalog) -> SweepPlan {
        // One window per chunk keeps a single chunk resident.
        let sequences = catalog
            .sequences
            .iter()
            .enumerate()
            .flat_map(|(position, seqs)| {
                seqs.iter().map(move |(id, desc)| PlannedSequence::new(*id, desc, position, position))
            })
            .collect();
        SweepPlan::new(sequences)
    }
}

pub struct NoRandomizer {
    inner: SweepEnumerator<NaturalOrder>,
}

impl NoRandomizer {
    pub fn new(deserializer: DataDeserializerPtr) -> Result<Self> {
        Ok(Self { inner: SweepEnumerator::new(deserializer, NaturalOrder, DecimationMode::Chunk)? })
    }

    pub fn split_sequences(mut self, yes: bool) -> Self {
        self.inner.set_split_sequences(yes);
        self
    }

    /// Chunks currently held in memory.
    pub fn resident_chunks(&self) -> usize {
        self.inner.resident_chunks()
    }
}

impl SequenceEnumerator for NoRandomizer {
    fn stream_descriptions(&self) -> &[StreamDescriptionPtr] {
        self.inner.streams()
    }

    fn start_epoch(&mut self, config: &EpochConfiguration) -> Result<()> {
        self.inner.start_epoch(config)
    }

    fn get_next_sequences(&mut self, sample_count: usize) -> Result<Sequences> {
        self.inner.get_next_sequences(sample_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::REQUEST_DATA_SIZE;
    use crate::data_loader::deserializer::{MemoryDeserializer, MemorySequence, SequenceData};
    use crate::data_loader::error::ReaderError;
    use crate::data_loader::stream::{SampleLayout, StreamDescription};
    use std::sync::Arc;

    /// Sequences of the given lengths, `per_chunk` per chunk; key = ordinal.
    fn dataset(lengths: &[usize], per_chunk: usize) -> Arc<MemoryDeserializer> {
        let mut d = MemoryDeserializer::new(vec![StreamDescription::dense(0, "x", SampleLayout::vector(1))]);
        for (c, group) in lengths.chunks(per_chunk).enumerate() {
            let seqs = group
                .iter()
                .enumerate()
                .map(|(i, &n)| MemorySequence {
                    key: (c * per_chunk + i) as u64,
                    data: vec![SequenceData::dense_from(n, &vec![0.0f32; n])],
                })
                .collect();
            d.add_chunk(seqs).unwrap();
        }
        Arc::new(d)
    }

    fn epoch(size: usize, index: usize) -> EpochConfiguration {
        EpochConfiguration {
            worker_rank: 0,
            number_of_workers: 1,
            minibatch_size_in_samples: 4,
            total_epoch_size_in_samples: size,
            epoch_index: index,
        }
    }

    #[test]
    fn natural_order_in_minibatch_sized_pulls() {
        let mut r = NoRandomizer::new(dataset(&[1; 12], 3)).unwrap();
        r.start_epoch(&epoch(10, 0)).unwrap();

        let mut sizes = Vec::new();
        let mut keys = Vec::new();
        loop {
            let s = r.get_next_sequences(4).unwrap();
            sizes.push((s.number_of_samples(), s.end_of_epoch));
            keys.extend(s.sequences.iter().map(|q| q.key));
            if s.end_of_epoch {
                break;
            }
        }
        assert_eq!(sizes, vec![(4, false), (4, false), (2, true)]);
        assert_eq!(keys, (0..10).collect::<Vec<u64>>());
        assert!(r.resident_chunks() <= 1);
    }

    #[test]
    fn later_epochs_continue_and_wrap_sweeps() {
        let mut r = NoRandomizer::new(dataset(&[1; 6], 2)).unwrap();
        r.start_epoch(&epoch(4, 1)).unwrap();
        let s = r.get_next_sequences(100).unwrap();
        let keys: Vec<u64> = s.sequences.iter().map(|q| q.key).collect();
        assert_eq!(keys, vec![4, 5, 0, 1]);
        assert!(s.end_of_epoch);
    }

    #[test]
    fn full_sweep_stops_at_dataset_end() {
        let mut r = NoRandomizer::new(dataset(&[2, 3, 1], 3)).unwrap();
        r.start_epoch(&epoch(REQUEST_DATA_SIZE, 0)).unwrap();
        let s = r.get_next_sequences(100).unwrap();
        assert_eq!(s.sequences.len(), 3);
        assert_eq!(s.number_of_samples(), 6);
        assert!(s.end_of_epoch);
        assert!(r.get_next_sequences(100).unwrap().end_of_epoch);
    }

    #[test]
    fn long_sequence_is_never_split() {
        let mut r = NoRandomizer::new(dataset(&[5, 1], 2)).unwrap();
        r.start_epoch(&epoch(REQUEST_DATA_SIZE, 0)).unwrap();
        let s = r.get_next_sequences(2).unwrap();
        assert_eq!(s.number_of_samples(), 5);
        assert!(!s.end_of_epoch);
    }

    #[test]
    fn split_sequences_fill_exact_sample_counts() {
        let mut r = NoRandomizer::new(dataset(&[3, 3, 3, 3], 2)).unwrap().split_sequences(true);
        r.start_epoch(&epoch(10, 0)).unwrap();

        let mut pulls = Vec::new();
        loop {
            let s = r.get_next_sequences(4).unwrap();
            let parts: Vec<(u64, usize, usize)> =
                s.sequences.iter().map(|q| (q.key, q.first_sample, q.number_of_samples)).collect();
            pulls.push(parts);
            if s.end_of_epoch {
                break;
            }
        }
        assert_eq!(
            pulls,
            vec![
                vec![(0, 0, 3), (1, 0, 1)],
                vec![(1, 1, 2), (2, 0, 2)],
                vec![(2, 2, 1), (3, 0, 1)],
            ]
        );

        // Epoch 1 starts at global sample 10, inside key 3.
        r.start_epoch(&epoch(10, 1)).unwrap();
        let s = r.get_next_sequences(4).unwrap();
        assert_eq!((s.sequences[0].key, s.sequences[0].first_sample), (3, 1));
        assert_eq!(s.number_of_samples(), 4);
    }

    #[test]
    fn invalid_epoch_fails_before_io() {
        let data = dataset(&[1; 4], 2);
        let mut r = NoRandomizer::new(data.clone()).unwrap();
        assert!(matches!(r.start_epoch(&epoch(0, 0)), Err(ReaderError::Config(_))));
        assert_eq!(data.chunk_loads(), 0);
    }
}
