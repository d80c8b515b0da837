use candle_core::{DType, Tensor};
use futures::future::BoxFuture;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{loss::to_runtime_error, TrainingError};

pub mod cifar;

pub use cifar::CifarDataSource;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// One `(images, labels)` pair produced by a loader.
#[derive(Debug, Clone)]
pub struct DataBatch {
    /// `[batch, 3, height, width]`, `f32`.
    pub images: Tensor,
    /// `[batch]`, `u32` class indices.
    pub labels: Tensor,
    /// Zero-based position of this batch within the current pass.
    pub batch_index: usize,
}

impl DataBatch {
    pub fn batch_size(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }

    /// Rejects batches the step executor cannot consume.
    pub fn validate(&self, num_classes: usize) -> Result<()> {
        let image_dims = self.images.dims();
        if image_dims.len() != 4 {
            return Err(TrainingError::data_stream(format!(
                "batch {}: images must be [batch, channels, height, width], got {:?}",
                self.batch_index, image_dims
            )));
        }
        if self.labels.dims().len() != 1 {
            return Err(TrainingError::data_stream(format!(
                "batch {}: labels must be rank 1, got {:?}",
                self.batch_index,
                self.labels.dims()
            )));
        }
        let batch = self.batch_size();
        if batch == 0 || image_dims[0] != batch {
            return Err(TrainingError::data_stream(format!(
                "batch {}: {} images for {} labels",
                self.batch_index, image_dims[0], batch
            )));
        }
        if !self.images.dtype().is_float() {
            return Err(TrainingError::data_stream(format!(
                "batch {}: images must be floating point, got {:?}",
                self.batch_index,
                self.images.dtype()
            )));
        }
        if !matches!(self.labels.dtype(), DType::U32 | DType::U8 | DType::I64) {
            return Err(TrainingError::data_stream(format!(
                "batch {}: labels must be integer, got {:?}",
                self.batch_index,
                self.labels.dtype()
            )));
        }
        let max_label = self
            .labels
            .to_dtype(DType::I64)
            .and_then(|labels| labels.max(0))
            .and_then(|max| max.to_vec0::<i64>())
            .map_err(to_runtime_error)?;
        let min_label = self
            .labels
            .to_dtype(DType::I64)
            .and_then(|labels| labels.min(0))
            .and_then(|min| min.to_vec0::<i64>())
            .map_err(to_runtime_error)?;
        if min_label < 0 || max_label >= num_classes as i64 {
            return Err(TrainingError::data_stream(format!(
                "batch {}: labels must lie in [0, {}), found range [{}, {}]",
                self.batch_index, num_classes, min_label, max_label
            )));
        }
        Ok(())
    }
}

/// Asynchronous-compatible loader abstraction over one finite pass.
pub trait DataLoader: Send {
    /// Number of batches this pass yields.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>>;
}

impl<L> DataLoader for Box<L>
where
    L: DataLoader + ?Sized,
{
    fn len(&self) -> usize {
        (**self).len()
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
        (**self).next_batch()
    }
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn next_batch(&mut self) -> Result<Option<DataBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

/// Produces a fresh, finite loader for every pass over a split.
pub trait DataSource {
    fn num_batches(&self) -> usize;
    fn loader(&self, epoch: usize) -> Result<Box<dyn DataLoader + '_>>;
}

/// Pre-materialized split held as two tensors.
#[derive(Debug, Clone)]
pub struct InMemoryDataSource {
    images: Tensor,
    labels: Tensor,
    batch_size: usize,
    shuffle_seed: Option<u64>,
}

impl InMemoryDataSource {
    pub fn new(images: Tensor, labels: Tensor, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        let samples = images.dims().first().copied().unwrap_or(0);
        if images.rank() != 4 || labels.dims() != [samples] {
            return Err(TrainingError::initialization(format!(
                "in-memory split expects [n, c, h, w] images and [n] labels, got {:?} and {:?}",
                images.dims(),
                labels.dims()
            )));
        }
        Ok(Self {
            images,
            labels,
            batch_size,
            shuffle_seed: None,
        })
    }

    /// Reorders samples every epoch with `seed + epoch`.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DataSource for InMemoryDataSource {
    fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    fn loader(&self, epoch: usize) -> Result<Box<dyn DataLoader + '_>> {
        let mut order: Vec<u32> = (0..self.len() as u32).collect();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        Ok(Box::new(InMemoryLoader {
            source: self,
            order,
            cursor: 0,
            batch_index: 0,
        }))
    }
}

struct InMemoryLoader<'a> {
    source: &'a InMemoryDataSource,
    order: Vec<u32>,
    cursor: usize,
    batch_index: usize,
}

impl InMemoryLoader<'_> {
    fn build_batch(&mut self) -> Result<Option<DataBatch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.source.batch_size).min(self.order.len());
        let indices = Tensor::new(&self.order[self.cursor..end], self.source.images.device())
            .map_err(to_runtime_error)?;
        let images = self
            .source
            .images
            .index_select(&indices, 0)
            .map_err(to_runtime_error)?;
        let labels = self
            .source
            .labels
            .index_select(&indices, 0)
            .map_err(to_runtime_error)?;

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

impl DataLoader for InMemoryLoader<'_> {
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
    use candle_core::Device;

    fn source(samples: usize, batch_size: usize) -> InMemoryDataSource {
        let images = Tensor::zeros((samples, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::new((0..samples as u32).collect::<Vec<_>>(), &Device::Cpu).unwrap();
        InMemoryDataSource::new(images, labels, batch_size).unwrap()
    }

    fn drain(source: &InMemoryDataSource, epoch: usize) -> Vec<DataBatch> {
        let mut loader = BlockingDataLoader::new(source.loader(epoch).unwrap());
        let mut batches = Vec::new();
        while let Some(batch) = loader.next_batch().unwrap() {
            batches.push(batch);
        }
        batches
    }

    #[test]
    fn keeps_partial_last_batch() {
        let source = source(5, 2);
        assert_eq!(source.num_batches(), 3);
        let batches = drain(&source, 0);
        let sizes: Vec<_> = batches.iter().map(DataBatch::batch_size).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let indices: Vec<_> = batches.iter().map(|b| b.batch_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn shuffle_is_seeded_per_epoch() {
        let source = source(16, 16).with_shuffle(7);
        let labels = |epoch| {
            drain(&source, epoch)[0]
                .labels
                .to_vec1::<u32>()
                .unwrap()
        };
        assert_eq!(labels(1), labels(1));
        let mut sorted = labels(2);
        sorted.sort_unstable();
        assert_eq!(sorted, (0..16).collect::<Vec<u32>>());
    }

    #[test]
    fn validation_rejects_out_of_range_labels() {
        let batch = DataBatch {
            images: Tensor::zeros((2, 3, 2, 2), DType::F32, &Device::Cpu).unwrap(),
            labels: Tensor::new(&[1u32, 10], &Device::Cpu).unwrap(),
            batch_index: 4,
        };
        assert!(batch.validate(11).is_ok());
        let err = batch.validate(10).unwrap_err();
        assert!(matches!(err, TrainingError::DataStream(_)));
    }

    #[test]
    fn validation_rejects_mismatched_batch() {
        let batch = DataBatch {
            images: Tensor::zeros((3, 3, 2, 2), DType::F32, &Device::Cpu).unwrap(),
            labels: Tensor::new(&[1u32, 2], &Device::Cpu).unwrap(),
            batch_index: 0,
        };
        assert!(matches!(
            batch.validate(10).unwrap_err(),
            TrainingError::DataStream(_)
        ));
    }
}
