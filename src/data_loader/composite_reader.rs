// src/data_loader/composite_reader.rs
//
//! The reader callers talk to.
//!
//! Wires deserializers -> bundler -> randomizer -> packer, runs the epoch
//! lifecycle and copies packed minibatches into caller-owned buffers.  One
//! minibatch is always being produced ahead of the caller: the next
//! prefetch is launched before `get_minibatch` returns.

use crate::constants::REQUEST_DATA_SIZE;
use crate::data_loader::bundler::Bundler;
use crate::data_loader::deserializer::DataDeserializerPtr;
use crate::data_loader::error::{ReaderError, Result};
use crate::data_loader::image_deserializer::ImageDeserializer;
use crate::data_loader::layout::MBLayout;
use crate::data_loader::memory::{HeapMemoryProvider, MemoryProvider};
use crate::data_loader::options::{DeserializerConfig, ReaderOptions};
use crate::data_loader::packer::{Packer, SampleModePacker, SequencePacker, TruncatedPacker};
use crate::data_loader::prefetch::{LaunchPolicy, PrefetchTask};
use crate::data_loader::randomizer::{
    BlockRandomizer, DecimationMode, EpochConfiguration, NoRandomizer, SequenceEnumerator,
};
use crate::data_loader::stream::{Element, StorageType, StreamDescription, StreamDescriptionPtr, StreamId};

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};

/// Caller-side matrix a stream is delivered into.
pub trait MinibatchBuffer<E: Element> {
    fn device_id(&self) -> i32;

    /// Replace the contents with `rows x cols` column-major values.
    fn set_value(&mut self, rows: usize, cols: usize, data: &[E]);
}

/// Plain host-memory matrix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostMatrix<E> {
    device_id: i32,
    rows: usize,
    cols: usize,
    data: Vec<E>,
}

impl<E: Element> HostMatrix<E> {
    pub fn new() -> Self {
        Self { device_id: -1, rows: 0, cols: 0, data: Vec::new() }
    }

    pub fn on_device(device_id: i32) -> Self {
        Self { device_id, ..Self::new() }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &[E] {
        &self.data
    }

    /// Column `col` as a slice of `rows` values.
    pub fn column(&self, col: usize) -> &[E] {
        &self.data[col * self.rows..(col + 1) * self.rows]
    }
}

impl<E: Element> MinibatchBuffer<E> for HostMatrix<E> {
    fn device_id(&self) -> i32 {
        self.device_id
    }

    fn set_value(&mut self, rows: usize, cols: usize, data: &[E]) {
        self.rows = rows;
        self.cols = cols;
        self.data.clear();
        self.data.extend_from_slice(data);
    }
}

/// Build the deserializers listed in the options.
pub fn create_deserializers(configs: &[DeserializerConfig]) -> Result<Vec<DataDeserializerPtr>> {
    configs
        .iter()
        .map(|c| match c {
            DeserializerConfig::ImageDeserializer(cfg) => {
                Ok(Arc::new(ImageDeserializer::new(cfg)?) as DataDeserializerPtr)
            }
        })
        .collect()
}

/// Which component currently owns the randomizer.
enum Stage {
    /// No epoch started yet.
    Idle(Box<dyn SequenceEnumerator>),
    /// Epoch started, nothing in flight.
    Ready(Box<dyn Packer>),
    Prefetching(PrefetchTask),
}

pub struct CompositeReader<E: Element> {
    options: ReaderOptions,
    provider: Arc<dyn MemoryProvider>,
    streams: Vec<StreamDescriptionPtr>,
    name_to_id: HashMap<String, StreamId>,
    layout: MBLayout,
    /// `None` only after a prefetch task panicked.
    stage: Option<Stage>,
    end_of_epoch: bool,
    _element: PhantomData<E>,
}

impl<E: Element> CompositeReader<E> {
    pub fn new(options: ReaderOptions, deserializers: Vec<DataDeserializerPtr>) -> Result<Self> {
        options.validate()?;

        let bundler: DataDeserializerPtr =
            Arc::new(Bundler::new(deserializers, options.primary_deserializer, options.check_data)?);

        for s in bundler.stream_descriptions() {
            if s.element_type != E::TYPE {
                return Err(ReaderError::config(format!(
                    "stream '{}' holds {:?} elements, reader delivers {:?}",
                    s.name,
                    s.element_type,
                    E::TYPE
                )));
            }
        }

        let randomizer: Box<dyn SequenceEnumerator> = if options.randomize {
            let window = options.randomization_window.unwrap_or(REQUEST_DATA_SIZE);
            Box::new(BlockRandomizer::new(
                options.verbosity,
                window,
                bundler,
                DecimationMode::Chunk,
                options.randomization_seed,
            )?
            .split_sequences(options.frame_mode))
        } else {
            Box::new(NoRandomizer::new(bundler)?.split_sequences(options.frame_mode))
        };

        // Packers always densify.
        let streams: Vec<StreamDescriptionPtr> = randomizer
            .stream_descriptions()
            .iter()
            .map(|s| Arc::new(StreamDescription { storage_type: StorageType::Dense, ..(**s).clone() }))
            .collect();
        let name_to_id = streams.iter().map(|s| (s.name.clone(), s.id)).collect();

        if options.verbosity > 0 {
            info!(
                streams = streams.len(),
                randomize = options.randomize,
                frame_mode = options.frame_mode,
                truncated = options.truncated,
                prefetch = options.prefetch,
                "composite reader created"
            );
        }

        let layout = MBLayout::new(options.parallel_sequences_for_epoch(0), 0);
        Ok(Self {
            options,
            provider: Arc::new(HeapMemoryProvider::default()),
            streams,
            name_to_id,
            layout,
            stage: Some(Stage::Idle(randomizer)),
            end_of_epoch: false,
            _element: PhantomData,
        })
    }

    /// Build the deserializers named in `options.deserializers`.
    pub fn from_options(options: ReaderOptions) -> Result<Self> {
        let deserializers = create_deserializers(&options.deserializers)?;
        Self::new(options, deserializers)
    }

    /// Replace the buffer provider used by the packers.
    pub fn with_memory_provider(mut self, provider: Arc<dyn MemoryProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn stream_descriptions(&self) -> &[StreamDescriptionPtr] {
        &self.streams
    }

    pub fn stream_id(&self, name: &str) -> Option<StreamId> {
        self.name_to_id.get(name).copied()
    }

    pub async fn start_minibatch_loop(
        &mut self,
        minibatch_size: usize,
        epoch: usize,
        total_epoch_size_in_samples: usize,
    ) -> Result<()> {
        self.start_distributed_minibatch_loop(minibatch_size, epoch, 0, 1, total_epoch_size_in_samples)
            .await
    }

    pub async fn start_distributed_minibatch_loop(
        &mut self,
        minibatch_size: usize,
        epoch: usize,
        worker_rank: usize,
        number_of_workers: usize,
        total_epoch_size_in_samples: usize,
    ) -> Result<()> {
        let mut source = match self.stage.take() {
            Some(Stage::Idle(source)) => source,
            Some(Stage::Ready(packer)) => packer.into_source(),
            Some(Stage::Prefetching(task)) => {
                let (packer, result) = task.wait().await;
                match result {
                    Ok(stale) => stale.release(&*self.provider),
                    Err(e) => debug!(error = %e, "discarding failed prefetch of the previous epoch"),
                }
                packer.into_source()
            }
            None => return Err(ReaderError::from("reader lost its randomizer to a panicked prefetch")),
        };

        let config = EpochConfiguration {
            worker_rank,
            number_of_workers,
            minibatch_size_in_samples: minibatch_size,
            total_epoch_size_in_samples,
            epoch_index: epoch,
        };
        if let Err(e) = source.start_epoch(&config) {
            self.stage = Some(Stage::Idle(source));
            return Err(e);
        }

        let packer = self.create_packer(source, minibatch_size, epoch);
        self.end_of_epoch = false;
        let policy = if self.options.prefetch { LaunchPolicy::Async } else { LaunchPolicy::Deferred };
        self.stage = Some(Stage::Prefetching(PrefetchTask::launch(policy, packer)));

        debug!(epoch, worker_rank, number_of_workers, minibatch_size, "minibatch loop started");
        Ok(())
    }

    fn create_packer(&mut self, source: Box<dyn SequenceEnumerator>, minibatch_size: usize, epoch: usize) -> Box<dyn Packer> {
        let provider = self.provider.clone();
        let streams = self.streams.clone();
        if self.options.frame_mode {
            Box::new(SampleModePacker::new(provider, source, minibatch_size, streams))
        } else if self.options.truncated {
            let parallel = self.options.parallel_sequences_for_epoch(epoch);
            self.layout.init(parallel, 0);
            Box::new(TruncatedPacker::new(provider, source, minibatch_size, streams, parallel))
        } else {
            Box::new(SequencePacker::new(provider, source, minibatch_size, streams))
        }
    }

    /// Fill `outputs` (stream name -> buffer) with the next minibatch.
    /// Returns `false` once the epoch is exhausted.
    ///
    /// # Panics
    ///
    /// On an empty `outputs` map, outputs on different devices, or an
    /// output name that is not a stream of this reader.
    pub async fn get_minibatch<M: MinibatchBuffer<E>>(&mut self, outputs: &mut BTreeMap<String, M>) -> Result<bool> {
        if self.end_of_epoch {
            return Ok(false);
        }

        let device = outputs.values().next().map(|m| m.device_id());
        let device = device.unwrap_or_else(|| panic!("get_minibatch needs at least one output buffer"));
        assert!(
            outputs.values().all(|m| m.device_id() == device),
            "all output buffers must live on one device"
        );
        let ids: Vec<StreamId> = outputs
            .keys()
            .map(|name| self.stream_id(name).unwrap_or_else(|| panic!("unknown output stream '{name}'")))
            .collect();

        let task = match self.stage.take() {
            Some(Stage::Prefetching(task)) => task,
            other => {
                self.stage = other;
                return Err(ReaderError::config("get_minibatch called before start_minibatch_loop"));
            }
        };
        let (packer, result) = task.wait().await;
        let minibatch = match result {
            Ok(m) => m,
            Err(e) => {
                self.end_of_epoch = true;
                self.stage = Some(Stage::Ready(packer));
                return Err(e);
            }
        };

        self.end_of_epoch = minibatch.end_of_epoch;
        let delivered = !minibatch.data.is_empty();
        if delivered {
            for ((_, out), &id) in outputs.iter_mut().zip(&ids) {
                let packed = &minibatch.data[id];
                let rows = self.streams[id].sample_layout.num_elements();
                let cols = packed.layout.num_cols();
                match bytemuck::try_cast_slice::<u8, E>(&packed.data) {
                    Ok(values) => out.set_value(rows, cols, values),
                    Err(_) => out.set_value(rows, cols, &bytemuck::pod_collect_to_vec::<u8, E>(&packed.data)),
                }
            }
            self.layout.copy_from(&minibatch.data[0].layout);
        }
        minibatch.release(&*self.provider);

        self.stage = Some(if self.end_of_epoch {
            Stage::Ready(packer)
        } else {
            let policy = if self.options.prefetch { LaunchPolicy::Async } else { LaunchPolicy::Deferred };
            Stage::Prefetching(PrefetchTask::launch(policy, packer))
        });
        Ok(delivered)
    }

    /// Layout of the last delivered minibatch.
    pub fn copy_mb_layout_to(&self, layout: &mut MBLayout) {
        layout.copy_from(&self.layout);
    }

    pub fn num_parallel_sequences(&self) -> usize {
        self.layout.num_parallel_sequences()
    }

    /// The reader never signals end of data; epochs end through
    /// `get_minibatch` returning `false`.
    pub fn data_end(&self) -> bool {
        false
    }
}
