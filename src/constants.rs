// src/constants.rs
//
// Centralized constants for the reader to avoid hardcoded values throughout the codebase

/// Epoch size meaning "one full sweep over the data set"
pub const REQUEST_DATA_SIZE: usize = usize::MAX;

/// Default logging verbosity of the reader and randomizer (0 = quiet)
pub const DEFAULT_VERBOSITY: u32 = 2;

/// Idle packer buffers kept by `HeapMemoryProvider` for reuse
pub const DEFAULT_MAX_POOLED_BUFFERS: usize = 64;

/// Images per chunk for the image deserializer
pub const DEFAULT_IMAGE_CHUNK_SIZE: usize = 1024;

/// Bundler mismatches listed in a data-check error message
pub const MAX_REPORTED_MISMATCHES: usize = 5;
