// src/data_loader/packer/mod.rs
//
//! Packers turn the randomizer's sequence stream into minibatches.
//!
//!  * [`SampleModePacker`] – frame mode, one column per sample.
//!  * [`SequencePacker`]   – whole sequences in parallel slots, gap padded.
//!  * [`TruncatedPacker`]  – fixed `slots x steps` grid, sequences carried
//!    across minibatches (truncated BPTT).
//!
//! A packer owns its randomizer while it runs; the reader takes the
//! randomizer back between epochs with [`Packer::into_source`].

mod sample;
mod sequence;
mod truncated;

pub use sample::SampleModePacker;
pub use sequence::SequencePacker;
pub use truncated::TruncatedPacker;

use crate::data_loader::deserializer::{SequenceData, SequencePayload};
use crate::data_loader::error::{ReaderError, Result};
use crate::data_loader::layout::MBLayout;
use crate::data_loader::memory::MemoryProvider;
use crate::data_loader::randomizer::{SequenceEnumerator, SequenceRecord, Sequences};
use crate::data_loader::stream::StreamDescriptionPtr;

use std::ops::Range;
use std::sync::Arc;

/// Packed data of one stream plus the layout describing its columns.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMinibatch {
    pub data: Vec<u8>,
    pub layout: MBLayout,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Minibatch {
    /// Indexed by stream id.  Empty when there was nothing left to pack.
    pub data: Vec<StreamMinibatch>,
    pub end_of_epoch: bool,
}

impl Minibatch {
    pub fn empty(end_of_epoch: bool) -> Self {
        Self { data: Vec::new(), end_of_epoch }
    }

    /// Hand the packed buffers back to the provider they came from.
    pub fn release(self, provider: &dyn MemoryProvider) {
        for stream in self.data {
            provider.free(stream.data);
        }
    }
}

pub trait Packer: Send {
    /// Pack the next minibatch.  `end_of_epoch` is set once the underlying
    /// enumerator is exhausted for the configured epoch.
    fn read_minibatch(&mut self) -> Result<Minibatch>;

    /// Give back the enumerator this packer pulls from.
    fn into_source(self: Box<Self>) -> Box<dyn SequenceEnumerator>;
}

/// State and helpers shared by every packer.
pub(crate) struct PackerCore {
    provider: Arc<dyn MemoryProvider>,
    source: Box<dyn SequenceEnumerator>,
    streams: Vec<StreamDescriptionPtr>,
    minibatch_size: usize,
}

impl PackerCore {
    pub fn new(
        provider: Arc<dyn MemoryProvider>,
        source: Box<dyn SequenceEnumerator>,
        minibatch_size: usize,
        streams: Vec<StreamDescriptionPtr>,
    ) -> Self {
        Self { provider, source, streams, minibatch_size }
    }

    pub fn into_source(self) -> Box<dyn SequenceEnumerator> {
        self.source
    }

    pub fn streams(&self) -> &[StreamDescriptionPtr] {
        &self.streams
    }

    pub fn minibatch_size(&self) -> usize {
        self.minibatch_size
    }

    /// Pull until something arrives for this worker or the epoch ends;
    /// empty sequences are dropped and every record is validated.
    pub fn next_sequences(&mut self, sample_count: usize) -> Result<Sequences> {
        loop {
            let mut s = self.source.get_next_sequences(sample_count)?;
            s.sequences.retain(|q| q.number_of_samples > 0);
            for record in &s.sequences {
                self.check(record)?;
            }
            if !s.is_empty() || s.end_of_epoch {
                return Ok(s);
            }
        }
    }

    fn check(&self, record: &SequenceRecord) -> Result<()> {
        if record.data.len() != self.streams.len() {
            return Err(ReaderError::inconsistent(format!(
                "sequence {} carries {} streams, expected {}",
                record.key,
                record.data.len(),
                self.streams.len()
            )));
        }
        // Every stream holds the whole sequence, which covers the record.
        let end = record.samples().end;
        let expected = record.data.first().map_or(end, |d| d.number_of_samples).max(end);
        for (data, stream) in record.data.iter().zip(&self.streams) {
            if data.number_of_samples != expected {
                return Err(ReaderError::inconsistent(format!(
                    "sequence {}: stream '{}' has {} samples, expected {}",
                    record.key, stream.name, data.number_of_samples, expected
                )));
            }
        }
        Ok(())
    }

    /// Zeroed buffer for `columns` dense samples of stream `stream`.
    pub fn alloc(&self, stream: usize, columns: usize) -> Vec<u8> {
        let s = &self.streams[stream];
        self.provider.alloc(s.element_type.size(), s.sample_layout.num_elements() * columns)
    }

    pub fn free(&self, buffers: Vec<Vec<u8>>) {
        for b in buffers {
            self.provider.free(b);
        }
    }

    /// Copy `samples` of `data` (stream `stream`) into `out`; sample `i` of
    /// the range lands in column `column(i)`.
    pub fn copy_samples(
        &self,
        stream: usize,
        data: &SequenceData,
        samples: Range<usize>,
        out: &mut [u8],
        column: impl Fn(usize) -> usize,
    ) {
        let s = &self.streams[stream];
        let elem = s.element_type.size();
        let sample_bytes = s.sample_size_in_bytes();

        match &data.payload {
            SequencePayload::Dense(bytes) => {
                for (i, sample) in samples.enumerate() {
                    let src = &bytes[sample * sample_bytes..(sample + 1) * sample_bytes];
                    let dst = column(i) * sample_bytes;
                    out[dst..dst + sample_bytes].copy_from_slice(src);
                }
            }
            SequencePayload::Sparse { indices, nnz_counts, values } => {
                let mut nz: usize = nnz_counts[..samples.start].iter().sum();
                for (i, sample) in samples.enumerate() {
                    let base = column(i) * sample_bytes;
                    for _ in 0..nnz_counts[sample] {
                        let dst = base + indices[nz] * elem;
                        out[dst..dst + elem].copy_from_slice(&values[nz * elem..(nz + 1) * elem]);
                        nz += 1;
                    }
                }
            }
        }
    }

    /// Assemble a minibatch where every stream shares `layout`.
    pub fn finish(&self, buffers: Vec<Vec<u8>>, layout: MBLayout, end_of_epoch: bool) -> Minibatch {
        let data = buffers
            .into_iter()
            .map(|data| StreamMinibatch { data, layout: layout.clone() })
            .collect();
        Minibatch { data, end_of_epoch }
    }
}
