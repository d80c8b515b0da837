//! CIFAR-10 / CIFAR-100 binary distributions.
//!
//! Each record is `label bytes` followed by a 32x32 image stored as three
//! 1024-byte planes (red, green, blue). CIFAR-10 has one label byte, CIFAR-100
//! stores the coarse label first and the fine label second; the fine label is used.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use candle_core::{Device, Tensor};
use futures::future::BoxFuture;
use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use super::{DataBatch, DataLoader, DataSource, Result};
use crate::{config::Dataset, loss::to_runtime_error, TrainingError};

const SIDE: u32 = 32;
const PLANE: usize = (SIDE * SIDE) as usize;
const PIXELS: usize = 3 * PLANE;
const CROP_SCALE: (f64, f64) = (0.05, 1.0);
const CROP_RATIO: (f64, f64) = (3.0 / 4.0, 4.0 / 3.0);
const CROP_ATTEMPTS: usize = 10;
const MEAN: f32 = 0.5;
const STD: f32 = 0.5;

/// Decoded split kept as raw bytes; images are materialized per batch.
#[derive(Debug, Clone, Default)]
pub struct CifarSplit {
    pixels: Vec<u8>,
    labels: Vec<u8>,
}

impl CifarSplit {
    pub fn load(dataset: Dataset, root: &Path, train: bool) -> Result<Self> {
        let mut split = CifarSplit::default();
        for file in split_files(dataset, root, train) {
            let bytes = fs::read(&file).map_err(|err| {
                TrainingError::data_stream(format!("failed to read {}: {}", file.display(), err))
            })?;
            split.append(dataset, &bytes).map_err(|err| match err {
                TrainingError::DataStream(msg) => {
                    TrainingError::data_stream(format!("{}: {}", file.display(), msg))
                }
                other => other,
            })?;
        }
        if split.is_empty() {
            return Err(TrainingError::data_stream(format!(
                "no {} records found under {}",
                dataset,
                root.display()
            )));
        }
        Ok(split)
    }

    pub fn parse(dataset: Dataset, bytes: &[u8]) -> Result<Self> {
        let mut split = CifarSplit::default();
        split.append(dataset, bytes)?;
        Ok(split)
    }

    fn append(&mut self, dataset: Dataset, bytes: &[u8]) -> Result<()> {
        let label_bytes = match dataset {
            Dataset::Cifar10 => 1,
            Dataset::Cifar100 => 2,
        };
        let record = label_bytes + PIXELS;
        if bytes.is_empty() || bytes.len() % record != 0 {
            return Err(TrainingError::data_stream(format!(
                "{} bytes is not a whole number of {}-byte records",
                bytes.len(),
                record
            )));
        }

        let classes = dataset.num_classes();
        for (index, chunk) in bytes.chunks_exact(record).enumerate() {
            let label = chunk[label_bytes - 1];
            if label as usize >= classes {
                return Err(TrainingError::data_stream(format!(
                    "record {} has label {} outside [0, {})",
                    index, label, classes
                )));
            }
            self.labels.push(label);
            self.pixels.extend_from_slice(&chunk[label_bytes..]);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn label(&self, index: usize) -> u8 {
        self.labels[index]
    }

    fn image(&self, index: usize) -> RgbImage {
        let planes = &self.pixels[index * PIXELS..(index + 1) * PIXELS];
        RgbImage::from_fn(SIDE, SIDE, |x, y| {
            let offset = (y * SIDE + x) as usize;
            Rgb([
                planes[offset],
                planes[PLANE + offset],
                planes[2 * PLANE + offset],
            ])
        })
    }
}

fn split_files(dataset: Dataset, root: &Path, train: bool) -> Vec<PathBuf> {
    match (dataset, train) {
        (Dataset::Cifar10, true) => (1..=5)
            .map(|i| root.join("cifar-10-batches-bin").join(format!("data_batch_{i}.bin")))
            .collect(),
        (Dataset::Cifar10, false) => vec![root.join("cifar-10-batches-bin").join("test_batch.bin")],
        (Dataset::Cifar100, true) => vec![root.join("cifar-100-binary").join("train.bin")],
        (Dataset::Cifar100, false) => vec![root.join("cifar-100-binary").join("test.bin")],
    }
}

/// Batched view over a split. Training splits are shuffled and randomly
/// cropped every epoch; evaluation splits are only resized.
#[derive(Debug, Clone)]
pub struct CifarDataSource {
    split: Arc<CifarSplit>,
    batch_size: usize,
    img_size: usize,
    augment: bool,
    seed: u64,
}

impl CifarDataSource {
    pub fn open(
        dataset: Dataset,
        root: &Path,
        train: bool,
        batch_size: usize,
        img_size: usize,
        seed: u64,
    ) -> Result<Self> {
        let split = CifarSplit::load(dataset, root, train)?;
        log::info!(
            "loaded {} {} {} images from {}",
            split.len(),
            dataset,
            if train { "train" } else { "test" },
            root.display()
        );
        Self::from_split(split, train, batch_size, img_size, seed)
    }

    pub fn from_split(
        split: CifarSplit,
        augment: bool,
        batch_size: usize,
        img_size: usize,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 || img_size == 0 {
            return Err(TrainingError::initialization(
                "batch size and image size must be greater than zero",
            ));
        }
        Ok(Self {
            split: Arc::new(split),
            batch_size,
            img_size,
            augment,
            seed,
        })
    }

    pub fn len(&self) -> usize {
        self.split.len()
    }

    pub fn is_empty(&self) -> bool {
        self.split.is_empty()
    }

    fn transform(&self, image: &RgbImage, rng: &mut StdRng, out: &mut Vec<f32>) {
        let side = self.img_size as u32;
        let resized = if self.augment {
            let (x, y, w, h) = random_resized_crop(rng);
            let crop = imageops::crop_imm(image, x, y, w, h).to_image();
            imageops::resize(&crop, side, side, FilterType::Triangle)
        } else if side == SIDE {
            image.clone()
        } else {
            imageops::resize(image, side, side, FilterType::Triangle)
        };

        for channel in 0..3 {
            out.extend(
                resized
                    .pixels()
                    .map(|pixel| (pixel.0[channel] as f32 / 255.0 - MEAN) / STD),
            );
        }
    }
}

/// Crop window `(x, y, width, height)` covering a random area fraction in
/// `CROP_SCALE` with a log-uniform aspect ratio in `CROP_RATIO`.
fn random_resized_crop(rng: &mut StdRng) -> (u32, u32, u32, u32) {
    let area = (SIDE * SIDE) as f64;
    let (log_lo, log_hi) = (CROP_RATIO.0.ln(), CROP_RATIO.1.ln());
    for _ in 0..CROP_ATTEMPTS {
        let target = area * rng.gen_range(CROP_SCALE.0..CROP_SCALE.1);
        let aspect = rng.gen_range(log_lo..log_hi).exp();
        let w = (target * aspect).sqrt().round() as u32;
        let h = (target / aspect).sqrt().round() as u32;
        if w > 0 && h > 0 && w <= SIDE && h <= SIDE {
            let x = rng.gen_range(0..=SIDE - w);
            let y = rng.gen_range(0..=SIDE - h);
            return (x, y, w, h);
        }
    }
    (0, 0, SIDE, SIDE)
}

impl DataSource for CifarDataSource {
    fn num_batches(&self) -> usize {
        self.split.len().div_ceil(self.batch_size)
    }

    fn loader(&self, epoch: usize) -> Result<Box<dyn DataLoader + '_>> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        let mut order: Vec<usize> = (0..self.split.len()).collect();
        if self.augment {
            order.shuffle(&mut rng);
        }
        Ok(Box::new(CifarLoader {
            source: self,
            order,
            cursor: 0,
            batch_index: 0,
            rng,
        }))
    }
}

struct CifarLoader<'a> {
    source: &'a CifarDataSource,
    order: Vec<usize>,
    cursor: usize,
    batch_index: usize,
    rng: StdRng,
}

impl CifarLoader<'_> {
    fn build_batch(&mut self) -> Result<Option<DataBatch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.source.batch_size).min(self.order.len());
        let count = end - self.cursor;
        let side = self.source.img_size;

        let mut pixels = Vec::with_capacity(count * 3 * side * side);
        let mut labels = Vec::with_capacity(count);
        for &index in &self.order[self.cursor..end] {
            let image = self.source.split.image(index);
            self.source.transform(&image, &mut self.rng, &mut pixels);
            labels.push(self.source.split.label(index) as u32);
        }

        let images =
            Tensor::from_vec(pixels, (count, 3, side, side), &Device::Cpu).map_err(to_runtime_error)?;
        let labels = Tensor::from_vec(labels, count, &Device::Cpu).map_err(to_runtime_error)?;

        let batch = DataBatch {
            images,
            labels,
            batch_index: self.batch_index,
        };
        self.cursor = end;
        self.batch_index += 1;
        Ok(Some(batch))
    }
}

impl DataLoader for CifarLoader<'_> {
    fn len(&self) -> usize {
        self.source.num_batches()
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
        Box::pin(async move { self.build_batch() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BlockingDataLoader;

    fn record(labels: &[u8], fill: u8) -> Vec<u8> {
        let mut bytes = labels.to_vec();
        bytes.extend(std::iter::repeat(fill).take(PIXELS));
        bytes
    }

    #[test]
    fn parses_cifar10_records() {
        let mut bytes = record(&[3], 0);
        bytes.extend(record(&[9], 255));
        let split = CifarSplit::parse(Dataset::Cifar10, &bytes).unwrap();
        assert_eq!(split.len(), 2);
        assert_eq!(split.label(0), 3);
        assert_eq!(split.label(1), 9);
    }

    #[test]
    fn cifar100_uses_fine_label() {
        let bytes = record(&[4, 87], 10);
        let split = CifarSplit::parse(Dataset::Cifar100, &bytes).unwrap();
        assert_eq!(split.label(0), 87);
    }

    #[test]
    fn rejects_truncated_file() {
        let mut bytes = record(&[1], 0);
        bytes.pop();
        let err = CifarSplit::parse(Dataset::Cifar10, &bytes).unwrap_err();
        assert!(matches!(err, TrainingError::DataStream(_)));
    }

    #[test]
    fn rejects_label_outside_dataset() {
        let err = CifarSplit::parse(Dataset::Cifar10, &record(&[10], 0)).unwrap_err();
        assert!(matches!(err, TrainingError::DataStream(_)));
    }

    #[test]
    fn planes_become_interleaved_pixels() {
        let mut bytes = vec![0u8];
        bytes.extend(std::iter::repeat(10).take(PLANE));
        bytes.extend(std::iter::repeat(20).take(PLANE));
        bytes.extend(std::iter::repeat(30).take(PLANE));
        let split = CifarSplit::parse(Dataset::Cifar10, &bytes).unwrap();
        assert_eq!(split.image(0).get_pixel(5, 7).0, [10, 20, 30]);
    }

    #[test]
    fn batches_are_normalized_and_resized() {
        let mut bytes = record(&[1], 255);
        bytes.extend(record(&[2], 0));
        bytes.extend(record(&[3], 255));
        let split = CifarSplit::parse(Dataset::Cifar10, &bytes).unwrap();
        let source = CifarDataSource::from_split(split, false, 2, 8, 0).unwrap();
        assert_eq!(source.num_batches(), 2);

        let mut loader = BlockingDataLoader::new(source.loader(1).unwrap());
        let first = loader.next_batch().unwrap().unwrap();
        assert_eq!(first.images.dims(), &[2, 3, 8, 8]);
        assert_eq!(first.labels.to_vec1::<u32>().unwrap(), vec![1, 2]);
        let values = first.images.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values[..192].iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(values[192..].iter().all(|v| (*v + 1.0).abs() < 1e-6));

        let last = loader.next_batch().unwrap().unwrap();
        assert_eq!(last.batch_size(), 1);
        assert_eq!(last.batch_index, 1);
        assert!(loader.next_batch().unwrap().is_none());
    }

    #[test]
    fn training_order_is_reproducible_per_epoch() {
        let bytes: Vec<u8> = (0..10u8).flat_map(|label| record(&[label], label)).collect();
        let split = CifarSplit::parse(Dataset::Cifar10, &bytes).unwrap();
        let source = CifarDataSource::from_split(split, true, 10, 16, 3).unwrap();

        let labels = |epoch| {
            let mut loader = BlockingDataLoader::new(source.loader(epoch).unwrap());
            loader.next_batch().unwrap().unwrap().labels.to_vec1::<u32>().unwrap()
        };
        assert_eq!(labels(2), labels(2));
        let mut sorted = labels(5);
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<u32>>());
    }

    #[test]
    fn augmented_batches_are_cropped_and_resized() {
        let bytes: Vec<u8> = (0..4u8).flat_map(|label| record(&[label], 255)).collect();
        let split = CifarSplit::parse(Dataset::Cifar10, &bytes).unwrap();
        let source = CifarDataSource::from_split(split, true, 4, 24, 7).unwrap();

        let mut loader = BlockingDataLoader::new(source.loader(1).unwrap());
        let batch = loader.next_batch().unwrap().unwrap();
        assert_eq!(batch.images.dims(), &[4, 3, 24, 24]);
        let values = batch.images.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn crop_window_stays_inside_image() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let (x, y, w, h) = random_resized_crop(&mut rng);
            assert!(w > 0 && h > 0);
            assert!(x + w <= SIDE && y + h <= SIDE);
        }
    }
}
