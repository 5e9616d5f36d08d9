// src/data_loader/randomizer/mod.rs
//
//! Sequence enumerators sitting between the bundler and the packers.
//!
//! Two variants share the [`SequenceEnumerator`] contract:
//!  * [`BlockRandomizer`] – chunk-windowed shuffle, decimated across workers.
//!  * [`NoRandomizer`]    – natural order passthrough.
//!
//! Both walk an endless series of sweeps (one sweep = one pass over the
//! data set) measured in global sample positions.  Epoch `e` of size `E`
//! covers positions `[e*E, (e+1)*E)`; every worker walks the same global
//! order and keeps only the sequences it owns.

mod block;
mod none;
mod sweep;

pub use block::BlockRandomizer;
pub use none::NoRandomizer;

use crate::constants::REQUEST_DATA_SIZE;
use crate::data_loader::deserializer::{ChunkId, SequenceDataPtr, SequenceKey};
use crate::data_loader::error::{ReaderError, Result};
use crate::data_loader::stream::StreamDescriptionPtr;

use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::RngCore;

/// Per-epoch parameters.  Built for each epoch start, immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochConfiguration {
    pub worker_rank: usize,
    pub number_of_workers: usize,
    pub minibatch_size_in_samples: usize,
    /// Global epoch size; [`REQUEST_DATA_SIZE`] means one full sweep.
    pub total_epoch_size_in_samples: usize,
    pub epoch_index: usize,
}

impl EpochConfiguration {
    /// Reject configurations that cannot describe an epoch.
    pub fn validate(&self) -> Result<()> {
        if self.total_epoch_size_in_samples == 0 {
            return Err(ReaderError::config(format!(
                "unsupported epoch size '{}'",
                self.total_epoch_size_in_samples
            )));
        }
        if self.minibatch_size_in_samples == 0 {
            return Err(ReaderError::config("minibatch size must be positive"));
        }
        if self.number_of_workers == 0 || self.worker_rank >= self.number_of_workers {
            return Err(ReaderError::config(format!(
                "worker rank {} is not valid for {} worker(s)",
                self.worker_rank, self.number_of_workers
            )));
        }
        Ok(())
    }

    pub fn is_full_sweep(&self) -> bool {
        self.total_epoch_size_in_samples == REQUEST_DATA_SIZE
    }
}

/// How sequences are partitioned across distributed workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecimationMode {
    /// Worker `r` of `n` owns the chunks at randomized positions `p` with
    /// `p % n == r`.
    #[default]
    Chunk,
    /// Worker `r` of `n` owns the sequences at sweep positions `p` with
    /// `p % n == r`.
    Sequence,
}

/// One sequence handed to the packer, with its data for every stream.
#[derive(Debug, Clone)]
pub struct SequenceRecord {
    /// Catalog ordinal, stable across epochs.
    pub id: usize,
    pub key: SequenceKey,
    pub chunk_id: ChunkId,
    /// First sample of `data` this record covers; non-zero only when frame
    /// mode cuts a sequence.
    pub first_sample: usize,
    pub number_of_samples: usize,
    pub data: Vec<SequenceDataPtr>,
}

impl SequenceRecord {
    /// Samples of `data` this record covers.
    pub fn samples(&self) -> std::ops::Range<usize> {
        self.first_sample..self.first_sample + self.number_of_samples
    }
}

/// Result of one pull from an enumerator.
#[derive(Debug, Clone, Default)]
pub struct Sequences {
    pub sequences: Vec<SequenceRecord>,
    pub end_of_epoch: bool,
}

impl Sequences {
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn number_of_samples(&self) -> usize {
        self.sequences.iter().map(|s| s.number_of_samples).sum()
    }
}

/// Contract shared by the randomizer variants.
pub trait SequenceEnumerator: Send {
    fn stream_descriptions(&self) -> &[StreamDescriptionPtr];

    /// (Re)initialize traversal for an epoch.  Validates `config` before
    /// touching any chunk.
    fn start_epoch(&mut self, config: &EpochConfiguration) -> Result<()>;

    /// Advance the global cursor over at most `sample_count` samples (at
    /// least one sequence, unless sequences are split) and return the
    /// sequences this worker owns.
    fn get_next_sequences(&mut self, sample_count: usize) -> Result<Sequences>;
}

/// Deterministic in-place Fisher–Yates shuffle.
///
/// Written out by hand so the permutation for a given seed never changes
/// with the version of `rand`.
pub(crate) fn shuffle<T>(items: &mut [T], rng: &mut ChaCha20Rng) {
    for i in (1..items.len()).rev() {
        // generate a u32 and reduce to [0..=i]
        let j = (rng.next_u32() as usize) % (i + 1);
        items.swap(i, j);
    }
}
