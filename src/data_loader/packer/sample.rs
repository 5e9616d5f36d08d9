// src/data_loader/packer/sample.rs
//
//! Frame-mode packer: every sample is its own column, sequences are
//! flattened.  The layout is `samples x 1`.  The randomizer cuts sequences
//! at sample granularity in frame mode, so a record may cover only part of
//! its sequence.

use super::{Minibatch, Packer, PackerCore};
use crate::data_loader::error::Result;
use crate::data_loader::layout::MBLayout;
use crate::data_loader::memory::MemoryProvider;
use crate::data_loader::randomizer::SequenceEnumerator;
use crate::data_loader::stream::StreamDescriptionPtr;

use std::sync::Arc;
use tracing::trace;

pub struct SampleModePacker {
    core: PackerCore,
}

impl SampleModePacker {
    pub fn new(
        provider: Arc<dyn MemoryProvider>,
        source: Box<dyn SequenceEnumerator>,
        minibatch_size: usize,
        streams: Vec<StreamDescriptionPtr>,
    ) -> Self {
        Self { core: PackerCore::new(provider, source, minibatch_size, streams) }
    }
}

impl Packer for SampleModePacker {
    fn read_minibatch(&mut self) -> Result<Minibatch> {
        let batch = self.core.next_sequences(self.core.minibatch_size())?;
        if batch.is_empty() {
            return Ok(Minibatch::empty(batch.end_of_epoch));
        }

        let columns = batch.number_of_samples();
        let mut layout = MBLayout::new(columns, 1);
        let mut col = 0;
        for seq in &batch.sequences {
            for _ in 0..seq.number_of_samples {
                layout.add_sequence(seq.id, col, 0, 1);
                col += 1;
            }
        }

        let mut buffers = Vec::with_capacity(self.core.streams().len());
        for stream in 0..self.core.streams().len() {
            let mut out = self.core.alloc(stream, columns);
            let mut first = 0;
            for seq in &batch.sequences {
                self.core.copy_samples(stream, &seq.data[stream], seq.samples(), &mut out, |i| first + i);
                first += seq.number_of_samples;
            }
            buffers.push(out);
        }

        trace!(columns, sequences = batch.sequences.len(), "packed frame minibatch");
        Ok(self.core.finish(buffers, layout, batch.end_of_epoch))
    }

    fn into_source(self: Box<Self>) -> Box<dyn SequenceEnumerator> {
        self.core.into_source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_loader::deserializer::SequenceData;
    use crate::data_loader::error::ReaderError;
    use crate::data_loader::memory::HeapMemoryProvider;
    use crate::data_loader::packer::test_support::*;
    use crate::data_loader::stream::{SampleLayout, StreamDescription};

    fn packer(pulls: Vec<crate::data_loader::randomizer::Sequences>, streams: Vec<StreamDescriptionPtr>) -> SampleModePacker {
        let source = Scripted { streams: streams.clone(), pulls: pulls.into() };
        SampleModePacker::new(Arc::new(HeapMemoryProvider::default()), Box::new(source), 4, streams)
    }

    #[test]
    fn flattens_sequences_into_columns() {
        let mut p = packer(vec![pull(vec![record(1, 2), record(2, 1)], false)], stream(1));
        let mb = p.read_minibatch().unwrap();
        assert!(!mb.end_of_epoch);
        let layout = &mb.data[0].layout;
        assert_eq!((layout.num_parallel_sequences(), layout.num_time_steps()), (3, 1));
        assert_eq!(floats(&mb.data[0].data), vec![10.0, 11.0, 20.0]);
        assert_eq!(layout.column(1), Some((1, 0)));
        assert_eq!(layout.column(2), Some((2, 0)));
    }

    #[test]
    fn skips_empty_pulls_until_data_or_end() {
        let mut p = packer(vec![pull(vec![], false), pull(vec![record(3, 1)], true)], stream(1));
        let mb = p.read_minibatch().unwrap();
        assert_eq!(mb.data[0].layout.num_cols(), 1);
        assert!(mb.end_of_epoch);

        let done = p.read_minibatch().unwrap();
        assert!(done.data.is_empty());
        assert!(done.end_of_epoch);
    }

    #[test]
    fn sparse_input_is_densified() {
        let streams = vec![Arc::new(StreamDescription::sparse(0, "s", SampleLayout::vector(4)))];
        let data = SequenceData::sparse_from(vec![1, 2], vec![3, 0, 2], &[1.0f32, 2.0, 3.0]);
        let mut rec = record(0, 2);
        rec.data = vec![Arc::new(data)];
        let mut p = packer(vec![pull(vec![rec], true)], streams);
        let mb = p.read_minibatch().unwrap();
        assert_eq!(floats(&mb.data[0].data), vec![0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 3.0, 0.0]);
    }

    #[test]
    fn sample_count_mismatch_between_streams_is_an_error() {
        let streams = vec![
            Arc::new(StreamDescription::dense(0, "a", SampleLayout::vector(1))),
            Arc::new(StreamDescription::dense(1, "b", SampleLayout::vector(1))),
        ];
        let mut rec = record(0, 2);
        rec.data.push(Arc::new(SequenceData::dense_from(1, &[5.0f32])));
        let mut p = packer(vec![pull(vec![rec], true)], streams);
        assert!(matches!(p.read_minibatch(), Err(ReaderError::DataInconsistency(_))));
    }
}
