// src/data_loader/randomizer/sweep.rs
//
// Sweep bookkeeping shared by both randomizers: the chunk/sequence catalog,
// the per-sweep plan, the global sample cursor, decimation and chunk
// residency.  The variants only decide the order in which a sweep visits
// sequences (`SweepPlanner`).

use super::{DecimationMode, EpochConfiguration, SequenceRecord, Sequences};
use crate::constants::REQUEST_DATA_SIZE;
use crate::data_loader::deserializer::{
    ChunkDescription, ChunkId, ChunkPtr, DataDeserializerPtr, SequenceDescription, SequenceKey,
};
use crate::data_loader::error::{ReaderError, Result};
use crate::data_loader::stream::StreamDescriptionPtr;

use std::collections::HashMap;
use tracing::{debug, trace};

/// Descriptions of every chunk and sequence, loaded once.
pub(crate) struct Catalog {
    pub chunks: Vec<ChunkDescription>,
    /// `sequences[i]` belongs to `chunks[i]`; paired with its catalog ordinal.
    pub sequences: Vec<Vec<(usize, SequenceDescription)>>,
    pub sweep_samples: usize,
}

impl Catalog {
    pub fn load(deserializer: &DataDeserializerPtr) -> Result<Self> {
        let chunks = deserializer.chunk_descriptions();
        let mut sequences = Vec::with_capacity(chunks.len());
        let mut ordinal = 0;
        let mut sweep_samples = 0;
        for chunk in &chunks {
            let seqs = deserializer.sequences_for_chunk(chunk.id)?;
            let numbered = seqs
                .into_iter()
                .map(|s| {
                    ordinal += 1;
                    sweep_samples += s.number_of_samples;
                    (ordinal - 1, s)
                })
                .collect();
            sequences.push(numbered);
        }
        Ok(Self { chunks, sequences, sweep_samples })
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PlannedSequence {
    pub id: usize,
    pub key: SequenceKey,
    pub chunk_id: ChunkId,
    pub index_in_chunk: usize,
    pub samples: usize,
    /// Position of the owning chunk in this sweep's chunk order.
    pub chunk_position: usize,
    /// Residency window the sequence is read from.
    pub window: usize,
}

impl PlannedSequence {
    pub fn new(id: usize, desc: &SequenceDescription, chunk_position: usize, window: usize) -> Self {
        Self {
            id,
            key: desc.key,
            chunk_id: desc.chunk_id,
            index_in_chunk: desc.index_in_chunk,
            samples: desc.number_of_samples,
            chunk_position,
            window,
        }
    }
}

/// Visiting order of one sweep.
#[derive(Default)]
pub(crate) struct SweepPlan {
    pub sequences: Vec<PlannedSequence>,
    /// Sample offset of each sequence inside the sweep.
    pub starts: Vec<usize>,
}

impl SweepPlan {
    pub fn new(sequences: Vec<PlannedSequence>) -> Self {
        let mut starts = Vec::with_capacity(sequences.len());
        let mut acc = 0;
        for s in &sequences {
            starts.push(acc);
            acc += s.samples;
        }
        Self { sequences, starts }
    }
}

pub(crate) trait SweepPlanner: Send {
    fn plan(&mut self, sweep: usize, catalog: &Catalog) -> SweepPlan;
}

pub(crate) struct SweepEnumerator<P> {
    deserializer: DataDeserializerPtr,
    streams: Vec<StreamDescriptionPtr>,
    catalog: Catalog,
    planner: P,
    decimation: DecimationMode,
    /// Cut sequences at sample granularity (frame mode).
    split_sequences: bool,
    config: Option<EpochConfiguration>,
    sweep: usize,
    plan: SweepPlan,
    cursor: usize,
    /// Samples of `plan.sequences[cursor]` already handed out.
    consumed: usize,
    global_position: usize,
    epoch_end: usize,
    resident: HashMap<ChunkId, ChunkPtr>,
    resident_window: Option<(usize, usize)>,
}

impl<P: SweepPlanner> SweepEnumerator<P> {
    pub fn new(deserializer: DataDeserializerPtr, planner: P, decimation: DecimationMode) -> Result<Self> {
        let catalog = Catalog::load(&deserializer)?;
        let streams = deserializer.stream_descriptions();
        Ok(Self {
            deserializer,
            streams,
            catalog,
            planner,
            decimation,
            split_sequences: false,
            config: None,
            sweep: 0,
            plan: SweepPlan::default(),
            cursor: 0,
            consumed: 0,
            global_position: 0,
            epoch_end: 0,
            resident: HashMap::new(),
            resident_window: None,
        })
    }

    pub fn set_split_sequences(&mut self, yes: bool) {
        self.split_sequences = yes;
    }

    pub fn streams(&self) -> &[StreamDescriptionPtr] {
        &self.streams
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn planner(&self) -> &P {
        &self.planner
    }

    /// Chunks currently held in memory.
    pub fn resident_chunks(&self) -> usize {
        self.resident.len()
    }

    pub fn start_epoch(&mut self, config: &EpochConfiguration) -> Result<()> {
        config.validate()?;

        self.resident.clear();
        self.resident_window = None;
        self.config = Some(*config);
        self.consumed = 0;

        let sweep_samples = self.catalog.sweep_samples;
        if sweep_samples == 0 {
            self.plan = SweepPlan::default();
            self.global_position = 0;
            self.epoch_end = 0;
            return Ok(());
        }

        let epoch_size = if config.total_epoch_size_in_samples == REQUEST_DATA_SIZE {
            sweep_samples
        } else {
            config.total_epoch_size_in_samples
        };
        let epoch_start = config.epoch_index.checked_mul(epoch_size).ok_or_else(|| {
            ReaderError::config(format!(
                "epoch {} of {} samples overflows the sample position",
                config.epoch_index, epoch_size
            ))
        })?;
        self.epoch_end = epoch_start.saturating_add(epoch_size);

        self.sweep = epoch_start / sweep_samples;
        self.plan = self.planner.plan(self.sweep, &self.catalog);

        let offset = epoch_start % sweep_samples;
        if self.split_sequences {
            // Start exactly at the epoch start, possibly inside a sequence.
            // The last sequence starting at or before `offset` is never empty.
            self.cursor = self.plan.starts.partition_point(|&s| s <= offset).saturating_sub(1);
            self.consumed = offset - self.plan.starts[self.cursor];
            self.global_position = epoch_start;
        } else {
            // Start at the first sequence beginning at or after the epoch start.
            self.cursor = self.plan.starts.partition_point(|&s| s < offset);
            self.global_position = if self.cursor < self.plan.sequences.len() {
                self.sweep * sweep_samples + self.plan.starts[self.cursor]
            } else {
                (self.sweep + 1) * sweep_samples
            };
        }

        debug!(
            epoch = config.epoch_index,
            rank = config.worker_rank,
            workers = config.number_of_workers,
            sweep = self.sweep,
            start = self.global_position,
            end = self.epoch_end,
            "epoch started"
        );
        Ok(())
    }

    pub fn get_next_sequences(&mut self, sample_count: usize) -> Result<Sequences> {
        let config = self
            .config
            .ok_or_else(|| ReaderError::config("get_next_sequences called before start_epoch"))?;

        if self.global_position >= self.epoch_end {
            return Ok(Sequences { sequences: Vec::new(), end_of_epoch: true });
        }

        let budget = sample_count.max(1).min(self.epoch_end - self.global_position);
        let mut taken = 0;
        let mut picked = Vec::new();
        while taken < budget && self.global_position < self.epoch_end {
            if self.cursor == self.plan.sequences.len() {
                self.sweep += 1;
                self.plan = self.planner.plan(self.sweep, &self.catalog);
                self.cursor = 0;
                trace!(sweep = self.sweep, "advanced to next sweep");
            }
            let seq = self.plan.sequences[self.cursor];
            let first = self.consumed;
            let left = seq.samples - first;
            let take = if self.split_sequences {
                left.min(budget - taken)
            } else {
                if taken > 0 && taken + left > budget {
                    break;
                }
                left
            };
            if self.owns(&seq, self.cursor, &config) {
                picked.push((self.sweep, seq, first, take));
            }
            taken += take;
            self.global_position += take;
            if take == left {
                self.cursor += 1;
                self.consumed = 0;
            } else {
                self.consumed += take;
            }
        }

        let mut sequences = Vec::with_capacity(picked.len());
        for (sweep, seq, first_sample, number_of_samples) in picked {
            let chunk = self.resident_chunk(sweep, &seq)?;
            sequences.push(SequenceRecord {
                id: seq.id,
                key: seq.key,
                chunk_id: seq.chunk_id,
                first_sample,
                number_of_samples,
                data: chunk.get_sequence(seq.index_in_chunk)?,
            });
        }

        Ok(Sequences { sequences, end_of_epoch: self.global_position >= self.epoch_end })
    }

    fn owns(&self, seq: &PlannedSequence, sweep_position: usize, config: &EpochConfiguration) -> bool {
        let unit = match self.decimation {
            DecimationMode::Chunk => seq.chunk_position,
            DecimationMode::Sequence => sweep_position,
        };
        unit % config.number_of_workers == config.worker_rank
    }

    /// Fetch the chunk of `seq`, releasing chunks of the previous window
    /// when the window changes.
    fn resident_chunk(&mut self, sweep: usize, seq: &PlannedSequence) -> Result<ChunkPtr> {
        let window = (sweep, seq.window);
        if self.resident_window != Some(window) {
            self.resident.clear();
            self.resident_window = Some(window);
        }
        if let Some(chunk) = self.resident.get(&seq.chunk_id) {
            return Ok(chunk.clone());
        }
        let chunk = self.deserializer.get_chunk(seq.chunk_id)?;
        self.resident.insert(seq.chunk_id, chunk.clone());
        Ok(chunk)
    }
}
