// src/lib.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
// Crate root — public re-exports.

pub mod constants;
pub mod data_loader;

// ===== Re-exports at the crate root =====
// Types:
pub use crate::data_loader::composite_reader::{CompositeReader, HostMatrix, MinibatchBuffer};
pub use crate::data_loader::error::{ReaderError, Result};
pub use crate::data_loader::layout::{MBLayout, SequenceInfo, GAP_SEQUENCE_ID};
pub use crate::data_loader::options::{DeserializerConfig, ImageDeserializerConfig, ReaderOptions};
// Constants:
pub use crate::constants::REQUEST_DATA_SIZE;
