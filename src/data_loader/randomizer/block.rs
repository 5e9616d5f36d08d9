// src/data_loader/randomizer/block.rs
//
//! Block randomizer: shuffles chunk order per sweep, then shuffles sequences
//! inside bounded windows of consecutive randomized chunks.
//!
//! Only the current window's chunks are resident, so memory stays around
//! one window's worth of data while a window spanning the whole data set
//! gives a full shuffle.  Every worker derives the same order from
//! `(seed, sweep)` and keeps its own decimated share.

use super::sweep::{Catalog, PlannedSequence, SweepEnumerator, SweepPlan, SweepPlanner};
use super::{DecimationMode, EpochConfiguration, SequenceEnumerator, Sequences, shuffle};
use crate::data_loader::deserializer::{ChunkId, DataDeserializerPtr};
use crate::data_loader::error::Result;
use crate::data_loader::stream::StreamDescriptionPtr;

use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::SeedableRng;
use tracing::{debug, info};

struct BlockPlanner {
    verbosity: u32,
    randomization_window: usize,
    seed: u64,
}

impl BlockPlanner {
    fn rng(&self, sweep: usize) -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(self.seed.wrapping_add(sweep as u64))
    }

    /// Positions into the catalog's chunk list, in visiting order.
    fn chunk_order(rng: &mut ChaCha20Rng, num_chunks: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..num_chunks).collect();
        shuffle(&mut order, rng);
        order
    }
}

impl SweepPlanner for BlockPlanner {
    fn plan(&mut self, sweep: usize, catalog: &Catalog) -> SweepPlan {
        let mut rng = self.rng(sweep);
        let order = Self::chunk_order(&mut rng, catalog.chunks.len());

        let mut sequences = Vec::new();
        let mut window = 0;
        let mut pos = 0;
        while pos < order.len() {
            // Greedily take chunks while the window budget holds; a window
            // always has at least one chunk.
            let begin = pos;
            let mut samples = 0;
            while pos < order.len() {
                let chunk_samples = catalog.chunks[order[pos]].number_of_samples;
                if pos > begin && samples + chunk_samples > self.randomization_window {
                    break;
                }
                samples += chunk_samples;
                pos += 1;
            }

            let mut window_seqs: Vec<PlannedSequence> = (begin..pos)
                .flat_map(|p| {
                    catalog.sequences[order[p]]
                        .iter()
                        .map(move |(id, desc)| PlannedSequence::new(*id, desc, p, window))
                })
                .collect();
            shuffle(&mut window_seqs, &mut rng);
            sequences.extend(window_seqs);
            window += 1;
        }

        if self.verbosity > 0 {
            info!(
                sweep,
                chunks = order.len(),
                windows = window,
                sequences = sequences.len(),
                "block randomizer planned sweep"
            );
        }
        SweepPlan::new(sequences)
    }
}

pub struct BlockRandomizer {
    inner: SweepEnumerator<BlockPlanner>,
}

impl BlockRandomizer {
    /// `randomization_window` is in samples; pass the data set size (or
    /// more) to shuffle across everything.
    pub fn new(
        verbosity: u32,
        randomization_window: usize,
        deserializer: DataDeserializerPtr,
        decimation_mode: DecimationMode,
        seed: u64,
    ) -> Result<Self> {
        let planner = BlockPlanner { verbosity, randomization_window, seed };
        let inner = SweepEnumerator::new(deserializer, planner, decimation_mode)?;
        debug!(
            window = randomization_window,
            chunks = inner.catalog().chunks.len(),
            samples = inner.catalog().sweep_samples,
            ?decimation_mode,
            "block randomizer created"
        );
        Ok(Self { inner })
    }

    /// Cut sequences at sample granularity so pulls and epochs end on exact
    /// sample counts.  Used in frame mode.
    pub fn split_sequences(mut self, yes: bool) -> Self {
        self.inner.set_split_sequences(yes);
        self
    }

    /// Randomized chunk order of `sweep`, identical on every worker.
    pub fn chunk_order(&self, sweep: usize) -> Vec<ChunkId> {
        let chunks = &self.inner.catalog().chunks;
        let mut rng = self.inner.planner().rng(sweep);
        BlockPlanner::chunk_order(&mut rng, chunks.len())
            .into_iter()
            .map(|p| chunks[p].id)
            .collect()
    }

    /// Chunks owned by `rank` of `workers` in `sweep` under chunk decimation.
    pub fn chunks_for_worker(&self, sweep: usize, rank: usize, workers: usize) -> Vec<ChunkId> {
        self.chunk_order(sweep)
            .into_iter()
            .enumerate()
            .filter(|(p, _)| workers > 0 && p % workers == rank)
            .map(|(_, id)| id)
            .collect()
    }

    /// Chunks currently held in memory.
    pub fn resident_chunks(&self) -> usize {
        self.inner.resident_chunks()
    }
}

impl SequenceEnumerator for BlockRandomizer {
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
