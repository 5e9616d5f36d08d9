// src/data_loader/packer/sequence.rs
//
//! Sequence-mode packer.  Whole sequences go into parallel slots, several
//! short ones may share a slot back to back, and the remaining tail of
//! each slot is a gap.  `T` is the longest sequence in the minibatch.

use super::{Minibatch, Packer, PackerCore};
use crate::data_loader::error::Result;
use crate::data_loader::layout::MBLayout;
use crate::data_loader::memory::MemoryProvider;
use crate::data_loader::randomizer::SequenceEnumerator;
use crate::data_loader::stream::StreamDescriptionPtr;

use std::sync::Arc;
use tracing::trace;

pub struct SequencePacker {
    core: PackerCore,
}

impl SequencePacker {
    pub fn new(
        provider: Arc<dyn MemoryProvider>,
        source: Box<dyn SequenceEnumerator>,
        minibatch_size: usize,
        streams: Vec<StreamDescriptionPtr>,
    ) -> Self {
        Self { core: PackerCore::new(provider, source, minibatch_size, streams) }
    }
}

/// First-fit placement: returns `(slot, t_begin)` per sequence and the
/// filled length of every slot.
fn place(lengths: &[usize], steps: usize) -> (Vec<(usize, usize)>, Vec<usize>) {
    let mut used: Vec<usize> = Vec::new();
    let mut placements = Vec::with_capacity(lengths.len());
    for &len in lengths {
        let slot = match used.iter().position(|&u| u + len <= steps) {
            Some(s) => s,
            None => {
                used.push(0);
                used.len() - 1
            }
        };
        placements.push((slot, used[slot]));
        used[slot] += len;
    }
    (placements, used)
}

impl Packer for SequencePacker {
    fn read_minibatch(&mut self) -> Result<Minibatch> {
        let batch = self.core.next_sequences(self.core.minibatch_size())?;
        if batch.is_empty() {
            return Ok(Minibatch::empty(batch.end_of_epoch));
        }

        let lengths: Vec<usize> = batch.sequences.iter().map(|s| s.number_of_samples).collect();
        let steps = lengths.iter().copied().max().unwrap_or(0);
        let (placements, used) = place(&lengths, steps);
        let slots = used.len();

        let mut layout = MBLayout::new(slots, steps);
        for (seq, &(s, t)) in batch.sequences.iter().zip(&placements) {
            layout.add_sequence(seq.id, s, t as isize, (t + seq.number_of_samples) as isize);
        }
        for (s, &filled) in used.iter().enumerate() {
            layout.add_gap(s, filled, steps);
        }

        let mut buffers = Vec::with_capacity(self.core.streams().len());
        for stream in 0..self.core.streams().len() {
            let mut out = self.core.alloc(stream, slots * steps);
            for (seq, &(s, t)) in batch.sequences.iter().zip(&placements) {
                self.core.copy_samples(stream, &seq.data[stream], seq.samples(), &mut out, |i| (t + i) * slots + s);
            }
            buffers.push(out);
        }

        trace!(slots, steps, sequences = batch.sequences.len(), "packed sequence minibatch");
        Ok(self.core.finish(buffers, layout, batch.end_of_epoch))
    }

    fn into_source(self: Box<Self>) -> Box<dyn SequenceEnumerator> {
        self.core.into_source()
    }
}
