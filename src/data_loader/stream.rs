// src/data_loader/stream.rs
//
//! Stream descriptions: the logical data channels flowing through the
//! pipeline (e.g. `features`, `labels`).

use std::sync::Arc;

/// Identifier of a stream inside the bundled namespace (`0..n`).
pub type StreamId = usize;

/// How samples of a stream are stored by its deserializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageType {
    #[default]
    Dense,
    Sparse,
}

/// Element type of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElementType {
    #[default]
    Float,
    Double,
}

impl ElementType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            ElementType::Float => std::mem::size_of::<f32>(),
            ElementType::Double => std::mem::size_of::<f64>(),
        }
    }
}

/// Shape of one sample, innermost dimension first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleLayout {
    dims: Vec<usize>,
}

impl SampleLayout {
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    /// A flat vector of `n` elements.
    pub fn vector(n: usize) -> Self {
        Self { dims: vec![n] }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Describes one stream.  Immutable once published; shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescription {
    pub id: StreamId,
    pub name: String,
    pub storage_type: StorageType,
    pub element_type: ElementType,
    pub sample_layout: SampleLayout,
}

pub type StreamDescriptionPtr = Arc<StreamDescription>;

impl StreamDescription {
    pub fn dense(id: StreamId, name: impl Into<String>, sample_layout: SampleLayout) -> Self {
        Self {
            id,
            name: name.into(),
            storage_type: StorageType::Dense,
            element_type: ElementType::Float,
            sample_layout,
        }
    }

    pub fn sparse(id: StreamId, name: impl Into<String>, sample_layout: SampleLayout) -> Self {
        Self {
            storage_type: StorageType::Sparse,
            ..Self::dense(id, name, sample_layout)
        }
    }

    pub fn with_element_type(mut self, element_type: ElementType) -> Self {
        self.element_type = element_type;
        self
    }

    /// Bytes occupied by one dense sample of this stream.
    pub fn sample_size_in_bytes(&self) -> usize {
        self.sample_layout.num_elements() * self.element_type.size()
    }
}

/// Element types a reader can deliver into caller buffers.
pub trait Element: bytemuck::Pod + Send + Sync + 'static {
    const TYPE: ElementType;
}

impl Element for f32 {
    const TYPE: ElementType = ElementType::Float;
}

impl Element for f64 {
    const TYPE: ElementType = ElementType::Double;
}
