// src/data_loader/options.rs
//!
//! Reader configuration.  Deserializes from the usual camelCase keys and
//! offers builder helpers so callers can write a fluent style:
//!
//! let opts = ReaderOptions::default()
//!     .frame_mode(false)
//!     .truncated(true)
//!     .parallel_sequences(vec![4, 8])
//!     .randomize(true, 42)
//!     .randomization_window(100_000)
//!     .prefetch(true);
//!

use crate::constants::{DEFAULT_IMAGE_CHUNK_SIZE, DEFAULT_VERBOSITY};
use crate::data_loader::error::{ReaderError, Result};

use serde::Deserialize;

/// Settings of the reference image deserializer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDeserializerConfig {
    /// Text file with one `path<TAB>label` entry per line.
    pub map_file: String,
    /// When set, map-file paths are entries of this zip archive.
    #[serde(default)]
    pub zip_file: Option<String>,
    pub width: usize,
    pub height: usize,
    /// 1 decodes grayscale, 3 decodes RGB.
    pub channels: usize,
    pub num_classes: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_chunk_size() -> usize {
    DEFAULT_IMAGE_CHUNK_SIZE
}

/// One entry of the `deserializers` list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum DeserializerConfig {
    ImageDeserializer(ImageDeserializerConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReaderOptions {
    /// Parallel sequences per epoch for truncated BPTT; the last entry
    /// applies to every later epoch.
    #[serde(rename = "nbruttsineachrecurrentiter")]
    pub parallel_sequences: Vec<usize>,
    /// Produce the next minibatch on a blocking thread while the caller
    /// consumes the current one.
    pub prefetch: bool,
    /// One column per sample; sequence boundaries are dropped.
    pub frame_mode: bool,
    /// Truncated BPTT packing (sequence mode only).
    pub truncated: bool,
    /// Cross-check deserializers before anything is read.
    pub check_data: bool,
    pub randomize: bool,
    /// In samples; `None` shuffles across the whole data set.
    pub randomization_window: Option<usize>,
    pub randomization_seed: u64,
    pub verbosity: u32,
    pub deserializers: Vec<DeserializerConfig>,
    /// Index of the deserializer whose chunking drives the bundle.
    pub primary_deserializer: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            parallel_sequences: vec![1],
            prefetch: true,
            frame_mode: true,
            truncated: false,
            check_data: false,
            randomize: false,
            randomization_window: None,
            randomization_seed: 0,
            verbosity: DEFAULT_VERBOSITY,
            deserializers: Vec::new(),
            primary_deserializer: 0,
        }
    }
}

impl ReaderOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ReaderError::config(format!("invalid reader options: {e}")))
    }

    /// Reject option combinations no packer supports.
    pub fn validate(&self) -> Result<()> {
        if self.frame_mode && self.truncated {
            return Err(ReaderError::config("truncated packing requires frameMode = false"));
        }
        if self.parallel_sequences.is_empty() {
            return Err(ReaderError::config("nbruttsineachrecurrentiter must not be empty"));
        }
        if self.parallel_sequences.contains(&0) {
            return Err(ReaderError::config("nbruttsineachrecurrentiter entries must be positive"));
        }
        Ok(())
    }

    /// Parallel sequence count for `epoch`.
    pub fn parallel_sequences_for_epoch(&self, epoch: usize) -> usize {
        let last = self.parallel_sequences.len().saturating_sub(1);
        self.parallel_sequences.get(epoch.min(last)).copied().unwrap_or(1)
    }

    pub fn prefetch(mut self, yes: bool) -> Self {
        self.prefetch = yes;
        self
    }

    pub fn frame_mode(mut self, yes: bool) -> Self {
        self.frame_mode = yes;
        self
    }

    pub fn truncated(mut self, yes: bool) -> Self {
        self.truncated = yes;
        self
    }

    pub fn check_data(mut self, yes: bool) -> Self {
        self.check_data = yes;
        self
    }

    pub fn randomize(mut self, yes: bool, seed: u64) -> Self {
        self.randomize = yes;
        self.randomization_seed = seed;
        self
    }

    pub fn randomization_window(mut self, samples: usize) -> Self {
        self.randomization_window = Some(samples);
        self
    }

    pub fn parallel_sequences(mut self, per_epoch: Vec<usize>) -> Self {
        self.parallel_sequences = per_epoch;
        self
    }

    pub fn verbosity(mut self, level: u32) -> Self {
        self.verbosity = level;
        self
    }

    pub fn primary_deserializer(mut self, index: usize) -> Self {
        self.primary_deserializer = index;
        self
    }

    pub fn deserializer(mut self, config: DeserializerConfig) -> Self {
        self.deserializers.push(config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_empty_json() {
        let opts = ReaderOptions::from_json("{}").unwrap();
        assert_eq!(opts, ReaderOptions::default());
        assert!(opts.prefetch && opts.frame_mode && !opts.truncated);
        assert_eq!(opts.parallel_sequences, vec![1]);
        assert_eq!(opts.verbosity, 2);
    }

    #[test]
    fn parses_keys_and_deserializer_list() {
        let opts = ReaderOptions::from_json(
            r#"{
                "nbruttsineachrecurrentiter": [2, 4],
                "frameMode": false,
                "truncated": true,
                "randomize": true,
                "randomizationWindow": 1000,
                "randomizationSeed": 9,
                "deserializers": [
                    {"type": "ImageDeserializer", "mapFile": "map.txt", "width": 4,
                     "height": 2, "channels": 3, "numClasses": 10}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(opts.parallel_sequences, vec![2, 4]);
        assert!(!opts.frame_mode && opts.truncated && opts.randomize);
        assert_eq!(opts.randomization_window, Some(1000));
        assert_eq!(opts.randomization_seed, 9);
        let DeserializerConfig::ImageDeserializer(img) = &opts.deserializers[0];
        assert_eq!(img.chunk_size, DEFAULT_IMAGE_CHUNK_SIZE);
        assert_eq!(img.zip_file, None);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn frame_mode_with_truncation_is_rejected() {
        let opts = ReaderOptions::default().truncated(true);
        assert!(matches!(opts.validate(), Err(ReaderError::Config(_))));
        assert!(ReaderOptions::default().parallel_sequences(vec![]).validate().is_err());
    }

    #[test]
    fn parallel_sequences_clamp_to_last_entry() {
        let opts = ReaderOptions::default().parallel_sequences(vec![2, 4]);
        assert_eq!(opts.parallel_sequences_for_epoch(0), 2);
        assert_eq!(opts.parallel_sequences_for_epoch(1), 4);
        assert_eq!(opts.parallel_sequences_for_epoch(7), 4);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(ReaderOptions::from_json("{\"prefetch\": 3}"), Err(ReaderError::Config(_))));
    }
}
