use std::cell::RefCell;

use burn::{
    data::dataset::{vision::MnistDataset, Dataset},
    tensor::{backend::Backend, Int, Tensor, TensorData},
};
use convtrack_core::{permutation, seeded_rng};
use rand::rngs::StdRng;

pub const IMAGE_SIDE: usize = 28;
pub const NUM_FEATURES: usize = IMAGE_SIDE * IMAGE_SIDE;
pub const NUM_CLASSES: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("image {index} has {actual} features, expected {expected} (28x28)")]
    ShapeMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("label {label} of image {index} is not a digit class")]
    InvalidLabel { index: usize, label: u8 },

    #[error("test fraction must be strictly between 0 and 1, got {0}")]
    InvalidTestFraction(f64),

    #[error("splitting {total} images with test fraction {fraction} leaves an empty partition")]
    EmptyPartition { total: usize, fraction: f64 },
}

/// One image as a flat feature vector plus its class.
#[derive(Clone, Debug, PartialEq)]
pub struct DigitItem {
    pub pixels: Vec<f32>,
    pub label: u8,
}

#[derive(Clone, Debug)]
pub struct Partitions {
    pub train: Vec<DigitItem>,
    pub test: Vec<DigitItem>,
}

/// Download (or read from cache) all 70,000 images, train split first.
pub fn fetch_mnist() -> Vec<DigitItem> {
    let train = MnistDataset::train();
    let test = MnistDataset::test();
    tracing::info!(
        train = train.len(),
        test = test.len(),
        "loaded MNIST source splits"
    );

    let mut items = Vec::with_capacity(train.len() + test.len());
    for dataset in [&train, &test] {
        items.extend((0..dataset.len()).filter_map(|index| dataset.get(index)).map(|item| {
            DigitItem {
                pixels: item.image.iter().flatten().copied().collect(),
                label: item.label,
            }
        }));
    }
    items
}

pub fn validate_shapes(items: &[DigitItem]) -> Result<(), DataError> {
    for (index, item) in items.iter().enumerate() {
        if item.pixels.len() != NUM_FEATURES {
            return Err(DataError::ShapeMismatch {
                index,
                expected: NUM_FEATURES,
                actual: item.pixels.len(),
            });
        }
        if item.label as usize >= NUM_CLASSES {
            return Err(DataError::InvalidLabel {
                index,
                label: item.label,
            });
        }
    }
    Ok(())
}

/// Seeded random split. The test partition holds `round(total * test_fraction)` items.
pub fn train_test_split(
    items: Vec<DigitItem>,
    test_fraction: f64,
    seed: u64,
) -> Result<Partitions, DataError> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(DataError::InvalidTestFraction(test_fraction));
    }

    let total = items.len();
    let test_len = (total as f64 * test_fraction).round() as usize;
    if test_len == 0 || test_len == total {
        return Err(DataError::EmptyPartition {
            total,
            fraction: test_fraction,
        });
    }

    let order = permutation(total, &mut seeded_rng(seed));
    let mut slots: Vec<Option<DigitItem>> = items.into_iter().map(Some).collect();
    let mut take = |index: &usize| slots[*index].take();

    let test = order[..test_len].iter().filter_map(&mut take).collect();
    let train = order[test_len..].iter().filter_map(&mut take).collect();

    Ok(Partitions { train, test })
}

/// Per-feature standardisation fitted on one partition and applied to others.
#[derive(Clone, Debug)]
pub struct StandardScaler {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl StandardScaler {
    /// Population mean and standard deviation per feature. Constant features keep scale 1.
    pub fn fit(items: &[DigitItem]) -> Self {
        let features = items.first().map_or(0, |item| item.pixels.len());
        let mut mean = vec![0.0f64; features];
        let mut sq_dev = vec![0.0f64; features];

        for item in items {
            for (sum, &value) in mean.iter_mut().zip(&item.pixels) {
                *sum += value as f64;
            }
        }
        let count = items.len().max(1) as f64;
        mean.iter_mut().for_each(|sum| *sum /= count);

        for item in items {
            for ((acc, &value), &mu) in sq_dev.iter_mut().zip(&item.pixels).zip(&mean) {
                let diff = value as f64 - mu;
                *acc += diff * diff;
            }
        }

        let scale = sq_dev
            .into_iter()
            .map(|acc| {
                let std = (acc / count).sqrt();
                if std < 10.0 * f64::EPSILON {
                    1.0
                } else {
                    std
                }
            })
            .collect();

        Self { mean, scale }
    }

    pub fn transform(&self, items: &mut [DigitItem]) {
        for item in items {
            for ((value, &mu), &scale) in item.pixels.iter_mut().zip(&self.mean).zip(&self.scale)
            {
                *value = ((*value as f64 - mu) / scale) as f32;
            }
        }
    }

    #[cfg(test)]
    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    #[cfg(test)]
    pub fn scale(&self) -> &[f64] {
        &self.scale
    }
}

/// Validate, split, then standardise both partitions with statistics from the train partition.
pub fn prepare(
    items: Vec<DigitItem>,
    test_fraction: f64,
    seed: u64,
) -> Result<Partitions, DataError> {
    validate_shapes(&items)?;
    let mut partitions = train_test_split(items, test_fraction, seed)?;

    let scaler = StandardScaler::fit(&partitions.train);
    scaler.transform(&mut partitions.train);
    scaler.transform(&mut partitions.test);

    tracing::info!(
        train = partitions.train.len(),
        test = partitions.test.len(),
        "prepared standardised partitions"
    );
    Ok(partitions)
}

#[derive(Clone, Debug)]
pub struct MnistBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> MnistBatch<B> {
    pub fn from_items(device: &B::Device, items: &[&DigitItem]) -> Self {
        let mut images = Vec::with_capacity(items.len() * NUM_FEATURES);
        let mut labels = Vec::with_capacity(items.len());

        for item in items {
            images.extend_from_slice(&item.pixels);
            labels.push(item.label as i64);
        }

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images, [items.len(), 1, IMAGE_SIDE, IMAGE_SIDE]),
            device,
        );
        let labels = Tensor::<B, 1, Int>::from_ints(TensorData::new(labels, [items.len()]), device);

        Self { images, labels }
    }

    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }
}

/// Fixed-size batches over an in-memory partition, optionally reshuffled on every pass.
pub struct BatchLoader {
    items: Vec<DigitItem>,
    batch_size: usize,
    shuffle: Option<RefCell<StdRng>>,
}

impl BatchLoader {
    /// Panics if `batch_size` is zero.
    pub fn new(items: Vec<DigitItem>, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch size must be non-zero");
        Self {
            items,
            batch_size,
            shuffle: None,
        }
    }

    pub fn shuffled(items: Vec<DigitItem>, batch_size: usize, seed: u64) -> Self {
        Self {
            shuffle: Some(RefCell::new(seeded_rng(seed))),
            ..Self::new(items, batch_size)
        }
    }

    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    pub fn num_batches(&self) -> usize {
        self.items.len().div_ceil(self.batch_size)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Index groups for one pass. Advances the shuffle RNG when shuffling.
    pub fn epoch_indices(&self) -> Vec<Vec<usize>> {
        let order = match &self.shuffle {
            Some(rng) => permutation(self.items.len(), &mut rng.borrow_mut()),
            None => (0..self.items.len()).collect(),
        };
        order
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    pub fn iter<'a, B: Backend>(
        &'a self,
        device: &'a B::Device,
    ) -> impl Iterator<Item = MnistBatch<B>> + 'a {
        self.epoch_indices().into_iter().map(move |indices| {
            let items: Vec<&DigitItem> = indices.iter().map(|&index| &self.items[index]).collect();
            MnistBatch::from_items(device, &items)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::backend::{ndarray::NdArrayDevice, NdArray};
    use rand::Rng;

    /// Items whose first pixel encodes their original position.
    pub(crate) fn synthetic_items(count: usize, seed: u64) -> Vec<DigitItem> {
        let mut rng = seeded_rng(seed);
        (0..count)
            .map(|index| {
                let mut pixels: Vec<f32> = (0..NUM_FEATURES)
                    .map(|_| rng.gen_range(0.0..255.0f32))
                    .collect();
                pixels[0] = index as f32;
                pixels[NUM_FEATURES - 1] = 0.0;
                DigitItem {
                    pixels,
                    label: (index % NUM_CLASSES) as u8,
                }
            })
            .collect()
    }

    fn ids(items: &[DigitItem]) -> Vec<usize> {
        items.iter().map(|item| item.pixels[0] as usize).collect()
    }

    #[test]
    fn split_sizes_cover_the_pool() {
        let partitions = train_test_split(synthetic_items(140, 1), 1.0 / 7.0, 42).unwrap();
        assert_eq!(partitions.test.len(), 20);
        assert_eq!(partitions.train.len(), 120);

        let mut all = ids(&partitions.train);
        all.extend(ids(&partitions.test));
        all.sort_unstable();
        assert_eq!(all, (0..140).collect::<Vec<_>>());
    }

    #[test]
    fn split_rounds_the_test_share() {
        let partitions = train_test_split(synthetic_items(100, 1), 1.0 / 7.0, 42).unwrap();
        assert_eq!(partitions.test.len(), 14);
        assert_eq!(partitions.train.len(), 86);
    }

    #[test]
    fn split_is_reproducible_for_a_seed() {
        let a = train_test_split(synthetic_items(70, 1), 1.0 / 7.0, 42).unwrap();
        let b = train_test_split(synthetic_items(70, 1), 1.0 / 7.0, 42).unwrap();
        let c = train_test_split(synthetic_items(70, 1), 1.0 / 7.0, 7).unwrap();
        assert_eq!(ids(&a.test), ids(&b.test));
        assert_ne!(ids(&a.test), ids(&c.test));
    }

    #[test]
    fn split_rejects_degenerate_inputs() {
        assert!(matches!(
            train_test_split(synthetic_items(10, 1), 1.5, 42),
            Err(DataError::InvalidTestFraction(_))
        ));
        assert!(matches!(
            train_test_split(synthetic_items(3, 1), 1.0 / 7.0, 42),
            Err(DataError::EmptyPartition { .. })
        ));
    }

    #[test]
    fn train_features_are_standardised() {
        let partitions = prepare(synthetic_items(140, 3), 1.0 / 7.0, 42).unwrap();
        let count = partitions.train.len() as f64;

        for feature in 1..NUM_FEATURES - 1 {
            let values: Vec<f64> = partitions
                .train
                .iter()
                .map(|item| item.pixels[feature] as f64)
                .collect();
            let mean = values.iter().sum::<f64>() / count;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
            assert!(mean.abs() < 1e-4, "feature {feature} mean {mean}");
            assert!((var.sqrt() - 1.0).abs() < 1e-3, "feature {feature} std {}", var.sqrt());
        }

        // The constant last column maps to zero instead of dividing by zero.
        assert!(partitions.train.iter().all(|item| item.pixels[NUM_FEATURES - 1] == 0.0));
    }

    #[test]
    fn test_partition_uses_train_statistics() {
        let partitions = train_test_split(synthetic_items(140, 5), 1.0 / 7.0, 42).unwrap();
        let scaler = StandardScaler::fit(&partitions.train);

        let mut test = partitions.test.clone();
        scaler.transform(&mut test);

        let raw = partitions.test[0].pixels[10] as f64;
        let expected = (raw - scaler.mean()[10]) / scaler.scale()[10];
        assert!((test[0].pixels[10] as f64 - expected).abs() < 1e-4);
    }

    #[test]
    fn malformed_images_fail_before_splitting() {
        let mut items = synthetic_items(20, 1);
        items[4].pixels.truncate(780);

        match prepare(items, 1.0 / 7.0, 42) {
            Err(DataError::ShapeMismatch {
                index,
                expected,
                actual,
            }) => {
                assert_eq!((index, expected, actual), (4, NUM_FEATURES, 780));
            }
            other => panic!("expected shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_labels_are_rejected() {
        let mut items = synthetic_items(20, 1);
        items[9].label = 10;

        match prepare(items, 1.0 / 7.0, 42) {
            Err(DataError::InvalidLabel { index, label }) => assert_eq!((index, label), (9, 10)),
            other => panic!("expected invalid label, got {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "batch size must be non-zero")]
    fn zero_batch_size_is_refused() {
        BatchLoader::new(synthetic_items(4, 1), 0);
    }

    #[test]
    fn batches_have_image_grid_shape() {
        let device = NdArrayDevice::Cpu;
        let loader = BatchLoader::new(synthetic_items(10, 1), 4);
        let batches: Vec<MnistBatch<NdArray>> = loader.iter::<NdArray>(&device).collect();

        assert_eq!(loader.num_batches(), 3);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].images.dims(), [4, 1, IMAGE_SIDE, IMAGE_SIDE]);
        assert_eq!(batches[2].len(), 2);
    }

    #[test]
    fn shuffled_loader_reorders_between_passes() {
        let ordered = BatchLoader::new(synthetic_items(64, 1), 8);
        assert_eq!(ordered.epoch_indices(), ordered.epoch_indices());

        let shuffled = BatchLoader::shuffled(synthetic_items(64, 1), 8, 42);
        let first = shuffled.epoch_indices();
        let second = shuffled.epoch_indices();
        assert_ne!(first, second);

        let mut seen: Vec<usize> = first.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
    }
}
