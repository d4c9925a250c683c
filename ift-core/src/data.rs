use anyhow::{ensure, Result};
use ift_structs::config::{DatasetConfig, DatasetKind};
use ndarray::{Array2, Axis};
use rand::{prelude::*, rngs::StdRng};
use rand_distr::StandardNormal;

#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub inputs: Array2<f64>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// A finite, restartable source of batches over an in-memory split.
///
/// [`DataLoader::next_batch`] cycles through the split indefinitely,
/// reshuffling whenever a pass is exhausted.
#[derive(Clone, Debug)]
pub struct DataLoader {
    inputs: Array2<f64>,
    labels: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    order: Vec<usize>,
    cursor: usize,
}

impl DataLoader {
    pub fn new(
        inputs: Array2<f64>,
        labels: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
        seed: [u8; 32],
    ) -> Result<Self> {
        ensure!(batch_size > 0, "Batch size must be positive");
        ensure!(
            inputs.nrows() == labels.len(),
            "Got {} input rows but {} labels",
            inputs.nrows(),
            labels.len()
        );
        Ok(Self {
            inputs,
            labels,
            batch_size,
            shuffle,
            rng: StdRng::from_seed(seed),
            order: Vec::new(),
            cursor: 0,
        })
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        (self.len() + self.batch_size - 1) / self.batch_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// One pass in storage order. Does not disturb the cycling position.
    pub fn batches(&self) -> Vec<Batch> {
        let indices: Vec<usize> = (0..self.len()).collect();
        indices
            .chunks(self.batch_size)
            .map(|chunk| self.gather(chunk))
            .collect()
    }

    /// One full pass, shuffled when the loader was built with shuffling.
    pub fn shuffled_batches(&mut self) -> Vec<Batch> {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        if self.shuffle {
            indices.shuffle(&mut self.rng);
        }
        indices
            .chunks(self.batch_size)
            .map(|chunk| self.gather(chunk))
            .collect()
    }

    pub fn next_batch(&mut self) -> Result<Batch> {
        ensure!(!self.is_empty(), "Cannot draw a batch from an empty split");
        if self.cursor >= self.order.len() {
            self.order = (0..self.len()).collect();
            if self.shuffle {
                self.order.shuffle(&mut self.rng);
            }
            self.cursor = 0;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.gather(&self.order[self.cursor..end]);
        self.cursor = end;
        Ok(batch)
    }

    fn gather(&self, indices: &[usize]) -> Batch {
        Batch {
            inputs: self.inputs.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }
}

pub struct Splits {
    pub train: DataLoader,
    pub validation: DataLoader,
    pub test: DataLoader,
}

/// Gaussian class blobs around randomly placed centers. Label noise is only
/// ever applied to the training split.
pub fn generate_splits(config: &DatasetConfig, batch_size: usize, seed: [u8; 32]) -> Result<Splits> {
    let DatasetConfig {
        kind,
        input_dims,
        num_classes,
        train_size,
        validation_size,
        test_size,
        label_noise,
        class_separation,
    } = *config;
    ensure!(input_dims > 0, "input_dims must be positive");
    ensure!(num_classes >= 2, "num_classes must be at least 2");
    ensure!(
        train_size > 0 && validation_size > 0 && test_size > 0,
        "Every split needs at least one sample"
    );
    ensure!(
        (0.0..=1.0).contains(&label_noise),
        "label_noise must be within [0, 1], got {}",
        label_noise
    );

    let mut rng = StdRng::from_seed(seed);
    let centers = Array2::from_shape_fn((num_classes, input_dims), |_| {
        class_separation * rng.sample::<f64, _>(StandardNormal)
    });

    let train_noise = match kind {
        DatasetKind::Blobs => 0.0,
        DatasetKind::NoisyBlobs => label_noise,
    };
    let (train_x, train_y) = sample_blobs(&centers, train_size, train_noise, &mut rng);
    let (val_x, val_y) = sample_blobs(&centers, validation_size, 0.0, &mut rng);
    let (test_x, test_y) = sample_blobs(&centers, test_size, 0.0, &mut rng);

    Ok(Splits {
        train: DataLoader::new(train_x, train_y, batch_size, true, rng.gen())?,
        validation: DataLoader::new(val_x, val_y, batch_size, true, rng.gen())?,
        test: DataLoader::new(test_x, test_y, batch_size, false, rng.gen())?,
    })
}

fn sample_blobs(
    centers: &Array2<f64>,
    size: usize,
    label_noise: f64,
    rng: &mut StdRng,
) -> (Array2<f64>, Vec<usize>) {
    let (num_classes, input_dims) = centers.dim();
    let mut inputs = Array2::zeros((size, input_dims));
    let mut labels = Vec::with_capacity(size);
    for mut row in inputs.axis_iter_mut(Axis(0)) {
        let label = rng.gen_range(0..num_classes);
        for d in 0..input_dims {
            row[d] = centers[[label, d]] + rng.sample::<f64, _>(StandardNormal);
        }
        let observed = if label_noise > 0.0 && rng.gen::<f64>() < label_noise {
            rng.gen_range(0..num_classes)
        } else {
            label
        };
        labels.push(observed);
    }
    (inputs, labels)
}
