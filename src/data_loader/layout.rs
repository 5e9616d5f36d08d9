// src/data_loader/layout.rs
//
//! Minibatch layout: how minibatch columns map to parallel sequences and
//! time steps.
//!
//! Columns are laid out time-major: column `t * S + s` holds time step `t`
//! of parallel slot `s`, where `S` is the number of parallel sequences.

/// Sequence id used for gap (padding) entries.
pub const GAP_SEQUENCE_ID: usize = usize::MAX;

/// One sequence (or gap) placed into a parallel slot.
///
/// `t_begin` may be negative and `t_end` may exceed the minibatch's time
/// extent when a sequence continues from or into a neighbouring minibatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceInfo {
    pub seq_id: usize,
    pub s: usize,
    pub t_begin: isize,
    pub t_end: isize,
}

impl SequenceInfo {
    pub fn is_gap(&self) -> bool {
        self.seq_id == GAP_SEQUENCE_ID
    }

    pub fn len(&self) -> usize {
        (self.t_end - self.t_begin).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MBLayout {
    num_parallel_sequences: usize,
    num_time_steps: usize,
    sequences: Vec<SequenceInfo>,
}

impl MBLayout {
    pub fn new(num_parallel_sequences: usize, num_time_steps: usize) -> Self {
        Self { num_parallel_sequences, num_time_steps, sequences: Vec::new() }
    }

    /// Reset to an empty `S x T` grid, keeping allocated capacity.
    pub fn init(&mut self, num_parallel_sequences: usize, num_time_steps: usize) {
        self.num_parallel_sequences = num_parallel_sequences;
        self.num_time_steps = num_time_steps;
        self.sequences.clear();
    }

    /// Overwrite `self` with `other` without giving up allocated capacity.
    pub fn copy_from(&mut self, other: &MBLayout) {
        self.num_parallel_sequences = other.num_parallel_sequences;
        self.num_time_steps = other.num_time_steps;
        self.sequences.clear();
        self.sequences.extend_from_slice(&other.sequences);
    }

    pub fn add_sequence(&mut self, seq_id: usize, s: usize, t_begin: isize, t_end: isize) {
        debug_assert!(s < self.num_parallel_sequences, "slot {} out of range", s);
        debug_assert!(t_begin < t_end);
        self.sequences.push(SequenceInfo { seq_id, s, t_begin, t_end });
    }

    pub fn add_gap(&mut self, s: usize, t_begin: usize, t_end: usize) {
        if t_begin < t_end {
            self.add_sequence(GAP_SEQUENCE_ID, s, t_begin as isize, t_end as isize);
        }
    }

    pub fn num_parallel_sequences(&self) -> usize {
        self.num_parallel_sequences
    }

    pub fn num_time_steps(&self) -> usize {
        self.num_time_steps
    }

    pub fn num_cols(&self) -> usize {
        self.num_parallel_sequences * self.num_time_steps
    }

    pub fn sequences(&self) -> &[SequenceInfo] {
        &self.sequences
    }

    /// Column index of time step `t` in slot `s`.
    pub fn column_index(&self, s: usize, t: usize) -> usize {
        t * self.num_parallel_sequences + s
    }

    /// Which sequence, and which of its time steps, occupies column `col`.
    /// `None` for gaps and unassigned columns.
    pub fn column(&self, col: usize) -> Option<(usize, usize)> {
        if self.num_parallel_sequences == 0 || col >= self.num_cols() {
            return None;
        }
        let s = col % self.num_parallel_sequences;
        let t = (col / self.num_parallel_sequences) as isize;
        self.sequences
            .iter()
            .find(|info| info.s == s && info.t_begin <= t && t < info.t_end)
            .filter(|info| !info.is_gap())
            .map(|info| (info.seq_id, (t - info.t_begin) as usize))
    }

    /// Number of columns carrying real (non-gap) data.
    pub fn num_samples(&self) -> usize {
        let t_max = self.num_time_steps as isize;
        self.sequences
            .iter()
            .filter(|info| !info.is_gap())
            .map(|info| (info.t_end.min(t_max) - info.t_begin.max(0)).max(0) as usize)
            .sum()
    }
}
