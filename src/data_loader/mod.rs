// src/data_loader/mod.rs

//! Public API surface of the minibatch reader pipeline.
//!
//! ByteReader -> Deserializer -> Bundler -> Randomizer -> Packer ->
//! CompositeReader -> caller buffers.

/// expose the `composite_reader` module (file composite_reader.rs)
pub mod composite_reader;

/// expose the `options` module (file options.rs)
pub mod options;

pub mod bundler;
pub mod byte_reader;
pub mod deserializer;
pub mod error;
pub mod image_deserializer;
pub mod layout;
pub mod memory;
pub mod packer;
pub mod pool;
pub mod prefetch;
pub mod randomizer;
pub mod stream;

// Re‐export the key types at this level:
pub use bundler::Bundler;
pub use byte_reader::{ByteReader, FileByteReader, ImageMatrix, ZipByteReader};
pub use composite_reader::{CompositeReader, HostMatrix, MinibatchBuffer, create_deserializers};
pub use deserializer::{
    Chunk, ChunkDescription, DataDeserializer, DataDeserializerPtr, MemoryDeserializer, MemorySequence,
    SequenceData, SequenceDescription,
};
pub use error::{ReaderError, Result};
pub use image_deserializer::ImageDeserializer;
pub use layout::MBLayout;
pub use memory::{HeapMemoryProvider, MemoryProvider};
pub use options::{DeserializerConfig, ImageDeserializerConfig, ReaderOptions};
pub use randomizer::{BlockRandomizer, DecimationMode, EpochConfiguration, NoRandomizer, SequenceEnumerator};
pub use stream::{ElementType, SampleLayout, StorageType, StreamDescription};
