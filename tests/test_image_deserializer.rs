// tests/test_image_deserializer.rs
//
// Image deserializer driven through the reader options, from loose files
// and from a zip archive.

use minibatch_reader::data_loader::image_deserializer::ImageEntry;
use minibatch_reader::data_loader::{
    ByteReader, Chunk, DataDeserializer, ImageDeserializer, ImageMatrix, ZipByteReader,
};
use minibatch_reader::{CompositeReader, HostMatrix, ImageDeserializerConfig, REQUEST_DATA_SIZE, ReaderError, ReaderOptions};

use image::{ImageFormat, Rgb, RgbImage};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use zip::write::SimpleFileOptions;

const WIDTH: u32 = 3;
const HEIGHT: u32 = 2;

/// Every pixel is `[shade, shade + 1, shade + 2]`.
fn png(shade: u8) -> Vec<u8> {
    let img = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([shade, shade + 1, shade + 2]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

fn map_file(dir: &Path, count: usize) -> String {
    let map = dir.join("map.txt");
    let text: String = (0..count).map(|i| format!("img/{i}.png\t{}\n", i % 2)).collect();
    std::fs::write(&map, text).unwrap();
    map.to_string_lossy().into_owned()
}

fn config(map_file: String, zip_file: Option<String>) -> ImageDeserializerConfig {
    ImageDeserializerConfig {
        map_file,
        zip_file,
        width: WIDTH as usize,
        height: HEIGHT as usize,
        channels: 3,
        num_classes: 2,
        chunk_size: 2,
    }
}

/// Read one full sweep in a single minibatch.
async fn read_all(cfg: ImageDeserializerConfig) -> (HostMatrix<f32>, HostMatrix<f32>) {
    let opts = ReaderOptions::default().deserializer(minibatch_reader::DeserializerConfig::ImageDeserializer(cfg));
    let mut reader = CompositeReader::<f32>::from_options(opts).unwrap();
    reader.start_minibatch_loop(16, 0, REQUEST_DATA_SIZE).await.unwrap();

    let mut out = BTreeMap::from([
        ("features".to_string(), HostMatrix::<f32>::new()),
        ("labels".to_string(), HostMatrix::<f32>::new()),
    ]);
    assert!(reader.get_minibatch(&mut out).await.unwrap());
    assert!(!reader.get_minibatch(&mut out).await.unwrap());
    let labels = out.remove("labels").unwrap();
    let features = out.remove("features").unwrap();
    (features, labels)
}

fn check(features: &HostMatrix<f32>, labels: &HostMatrix<f32>, count: usize) {
    assert_eq!((features.rows(), features.cols()), ((WIDTH * HEIGHT * 3) as usize, count));
    assert_eq!((labels.rows(), labels.cols()), (2, count));
    for i in 0..count {
        let shade = (i * 10) as f32;
        assert_eq!(&features.column(i)[..3], &[shade, shade + 1.0, shade + 2.0]);
        let mut one_hot = [0.0f32; 2];
        one_hot[i % 2] = 1.0;
        assert_eq!(labels.column(i), &one_hot);
    }
}

#[tokio::test]
async fn loose_files_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("img")).unwrap();
    for i in 0..5 {
        std::fs::write(dir.path().join(format!("img/{i}.png")), png(i as u8 * 10)).unwrap();
    }
    let (features, labels) = read_all(config(map_file(dir.path(), 5), None)).await;
    check(&features, &labels, 5);
}

#[tokio::test]
async fn zip_archive_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let zip_path = dir.path().join("images.zip");
    let mut writer = zip::ZipWriter::new(File::create(&zip_path).unwrap());
    let opts = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for i in 0..4u8 {
        writer.start_file(format!("img/{i}.png"), opts).unwrap();
        writer.write_all(&png(i * 10)).unwrap();
    }
    writer.finish().unwrap();

    let cfg = config(map_file(dir.path(), 4), Some(zip_path.to_string_lossy().into_owned()));
    let (features, labels) = read_all(cfg).await;
    check(&features, &labels, 4);
}

fn write_zip(path: &Path, count: u8) {
    let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
    let opts = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for i in 0..count {
        writer.start_file(format!("img/{i}.png"), opts).unwrap();
        writer.write_all(&png(i * 10)).unwrap();
    }
    writer.finish().unwrap();
}

/// Shares a registered zip reader and holds each read until a second read
/// is in flight, recording the peak number of concurrent reads.
struct Overlapping {
    zip: Arc<ZipByteReader>,
    active: AtomicUsize,
    peak: Arc<AtomicUsize>,
}

impl ByteReader for Overlapping {
    fn register(&mut self, _seq_id: usize, _path: &str) -> minibatch_reader::Result<()> {
        Ok(())
    }

    fn read(&self, seq_id: usize, path: &str, grayscale: bool) -> minibatch_reader::Result<ImageMatrix> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.peak.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        let out = self.zip.read(seq_id, path, grayscale);
        self.active.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

#[test]
fn chunk_images_decode_concurrently_from_one_archive() {
    const THREADS: usize = 4;
    const IMAGES: u8 = 16;

    let dir = tempfile::tempdir().unwrap();
    let zip_path = dir.path().join("images.zip");
    write_zip(&zip_path, IMAGES);

    let entries: Vec<ImageEntry> =
        (0..IMAGES).map(|i| ImageEntry { path: format!("img/{i}.png"), label: i as usize % 2 }).collect();
    let mut zip = ZipByteReader::new(&zip_path).unwrap();
    for (i, e) in entries.iter().enumerate() {
        zip.register(i, &e.path).unwrap();
    }
    let zip = Arc::new(zip);
    let peak = Arc::new(AtomicUsize::new(0));
    let reader = Overlapping { zip: zip.clone(), active: AtomicUsize::new(0), peak: peak.clone() };

    let cfg = ImageDeserializerConfig { chunk_size: IMAGES as usize, ..config("unused".into(), None) };
    let d = ImageDeserializer::with_reader(&cfg, entries, Box::new(reader)).unwrap();

    let pool = rayon::ThreadPoolBuilder::new().num_threads(THREADS).build().unwrap();
    let chunk = pool.install(|| d.get_chunk(0)).unwrap();
    assert!(chunk.get_sequence(IMAGES as usize - 1).is_ok());

    let peak = peak.load(Ordering::SeqCst);
    assert!((2..=THREADS).contains(&peak), "peak of {peak} concurrent reads on {THREADS} threads");
    let opened = zip.open_handles();
    assert!(opened >= 1 && opened <= THREADS, "opened {opened} handles for {THREADS} threads");
}

#[test]
fn entry_missing_from_archive_fails_at_construction() {
    let dir = tempfile::tempdir().unwrap();
    let zip_path = dir.path().join("empty.zip");
    zip::ZipWriter::new(File::create(&zip_path).unwrap()).finish().unwrap();

    let cfg = config(map_file(dir.path(), 1), Some(zip_path.to_string_lossy().into_owned()));
    assert!(matches!(ImageDeserializer::new(&cfg), Err(ReaderError::Io(_))));
}

#[test]
fn wrong_image_size_is_a_data_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("img")).unwrap();
    std::fs::write(dir.path().join("img/0.png"), png(0)).unwrap();

    let cfg = ImageDeserializerConfig { width: 5, ..config(map_file(dir.path(), 1), None) };
    let d = ImageDeserializer::new(&cfg).unwrap();
    assert_eq!(d.chunk_descriptions().len(), 1);
    assert!(matches!(d.get_chunk(0), Err(ReaderError::DataInconsistency(_))));
}
