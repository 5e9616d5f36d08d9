// src/data_loader/packer/truncated.rs
//
//! Truncated BPTT packer.  A fixed grid of `slots x steps` columns; each
//! slot streams sequences end to end, so a sequence cut at the end of one
//! minibatch continues at `t = 0` of the next.  Continued sequences show up
//! in the layout with a negative `t_begin`, sequences running past the end
//! with `t_end > steps`.

use super::{Minibatch, Packer, PackerCore};
use crate::data_loader::error::Result;
use crate::data_loader::layout::MBLayout;
use crate::data_loader::memory::MemoryProvider;
use crate::data_loader::randomizer::{SequenceEnumerator, SequenceRecord};
use crate::data_loader::stream::StreamDescriptionPtr;

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// A sequence partially written into a slot.
struct Cursor {
    record: SequenceRecord,
    next_sample: usize,
}

pub struct TruncatedPacker {
    core: PackerCore,
    steps: usize,
    slots: Vec<Option<Cursor>>,
    pending: VecDeque<SequenceRecord>,
    exhausted: bool,
}

impl TruncatedPacker {
    /// `parallel_sequences` slots; the time extent is
    /// `max(1, minibatch_size / parallel_sequences)`.
    pub fn new(
        provider: Arc<dyn MemoryProvider>,
        source: Box<dyn SequenceEnumerator>,
        minibatch_size: usize,
        streams: Vec<StreamDescriptionPtr>,
        parallel_sequences: usize,
    ) -> Self {
        let parallel_sequences = parallel_sequences.max(1);
        let steps = (minibatch_size / parallel_sequences).max(1);
        debug!(parallel_sequences, steps, "truncated packer created");
        Self {
            core: PackerCore::new(provider, source, minibatch_size, streams),
            steps,
            slots: (0..parallel_sequences).map(|_| None).collect(),
            pending: VecDeque::new(),
            exhausted: false,
        }
    }

    fn next_record(&mut self) -> Result<Option<SequenceRecord>> {
        if self.pending.is_empty() && !self.exhausted {
            let batch = self.core.next_sequences(self.steps)?;
            self.exhausted = batch.end_of_epoch;
            self.pending.extend(batch.sequences);
        }
        Ok(self.pending.pop_front())
    }

    fn drained(&self) -> bool {
        self.exhausted && self.pending.is_empty() && self.slots.iter().all(Option::is_none)
    }
}

impl Packer for TruncatedPacker {
    fn read_minibatch(&mut self) -> Result<Minibatch> {
        if self.drained() {
            return Ok(Minibatch::empty(true));
        }

        let slots = self.slots.len();
        let steps = self.steps;
        let mut layout = MBLayout::new(slots, steps);
        let mut buffers: Vec<Vec<u8>> =
            (0..self.core.streams().len()).map(|stream| self.core.alloc(stream, slots * steps)).collect();
        let mut packed = 0;

        for s in 0..slots {
            let mut t = 0;
            while t < steps {
                let mut cursor = match self.slots[s].take() {
                    Some(c) => c,
                    None => match self.next_record()? {
                        Some(record) => Cursor { record, next_sample: 0 },
                        None => {
                            layout.add_gap(s, t, steps);
                            break;
                        }
                    },
                };

                let len = cursor.record.number_of_samples;
                let start = cursor.next_sample;
                let offset = cursor.record.first_sample;
                let take = (len - start).min(steps - t);
                let t_begin = t as isize - start as isize;
                layout.add_sequence(cursor.record.id, s, t_begin, t_begin + len as isize);

                for (stream, out) in buffers.iter_mut().enumerate() {
                    self.core.copy_samples(
                        stream,
                        &cursor.record.data[stream],
                        offset + start..offset + start + take,
                        out,
                        |i| (t + i) * slots + s,
                    );
                }

                cursor.next_sample += take;
                t += take;
                packed += take;
                if cursor.next_sample < len {
                    self.slots[s] = Some(cursor);
                }
            }
        }

        let end_of_epoch = self.drained();
        if packed == 0 {
            self.core.free(buffers);
            return Ok(Minibatch::empty(end_of_epoch));
        }
        trace!(slots, steps, packed, end_of_epoch, "packed truncated minibatch");
        Ok(self.core.finish(buffers, layout, end_of_epoch))
    }

    fn into_source(self: Box<Self>) -> Box<dyn SequenceEnumerator> {
        self.core.into_source()
    }
}
