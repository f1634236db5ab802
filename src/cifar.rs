use std::path::Path;

use braille_rs::BrailleChar;
use log::info;
use rand::{rngs::StdRng, seq::SliceRandom};
use rgb::RGB;
use tch::{Device, Kind, Tensor};

use crate::{
    config::TestStatistics,
    error::{Error, Result},
};

pub const CLASS_NAMES: [&str; 10] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

pub const IMAGE_SIZE: i64 = 32;
pub const CHANNELS: i64 = 3;

/// Images are `[N, 3, 32, 32]` floats, labels `[N]` int64 class indices.
#[derive(Debug)]
pub struct Cifar10 {
    pub train_images: Tensor,
    pub train_labels: Tensor,
    pub test_images: Tensor,
    pub test_labels: Tensor,
    pub n_classes: usize,
}

impl Cifar10 {
    /// Reads the binary CIFAR-10 batches (`data_batch_{1..5}.bin`,
    /// `test_batch.bin`) from `dir`. Pixels are scaled to `[0, 1]`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        info!("loading CIFAR-10 from {}", dir.display());

        let ds = tch::vision::cifar::load_dir(dir)?;
        let data = Self {
            train_images: ds.train_images,
            train_labels: ds.train_labels,
            test_images: ds.test_images,
            test_labels: ds.test_labels,
            n_classes: ds.labels as usize,
        };

        info!(
            "  train: {:?}  test: {:?}  classes: {}",
            data.train_images.size(),
            data.test_images.size(),
            data.n_classes
        );
        Ok(data)
    }

    pub fn train_len(&self) -> usize {
        self.train_images.size()[0] as usize
    }

    pub fn test_len(&self) -> usize {
        self.test_images.size()[0] as usize
    }

    /// Standardizes the training split with its own per-pixel statistics and
    /// the test split with the statistics `test` selects. Returns the
    /// standardizer fitted on the training split.
    pub fn standardize(self, test: TestStatistics) -> (Self, Standardizer) {
        let standardizer = Standardizer::fit(&self.train_images);
        let test_images = match test {
            TestStatistics::Train => standardizer.apply(&self.test_images),
            TestStatistics::Own => Standardizer::fit(&self.test_images).apply(&self.test_images),
        };
        let data = Self {
            train_images: standardizer.apply(&self.train_images),
            test_images,
            ..self
        };
        (data, standardizer)
    }
}

/// Per-pixel z-scoring: `(x - mean) / std` with statistics taken over the
/// batch dimension.
#[derive(Debug)]
pub struct Standardizer {
    mean: Tensor,
    std: Tensor,
}

impl Standardizer {
    const MIN_STD: f64 = 1e-7;

    pub fn fit(images: &Tensor) -> Self {
        Self {
            mean: images.mean_dim(0, true, Kind::Float),
            std: images.std_dim(0, false, true).clamp_min(Self::MIN_STD),
        }
    }

    pub fn apply(&self, images: &Tensor) -> Tensor {
        (images - &self.mean) / &self.std
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn std(&self) -> &Tensor {
        &self.std
    }
}

/// Shuffles `0..len` and cuts it into `len / batch_size` full batches; the
/// remainder is dropped for this epoch.
pub fn shuffled_batches(
    len: usize,
    batch_size: usize,
    rng: &mut StdRng,
) -> Result<Vec<Vec<i64>>> {
    if batch_size == 0 || len < batch_size {
        return Err(Error::EmptyEpoch { batch_size, len });
    }

    let mut indices: Vec<i64> = (0..len as i64).collect();
    indices.shuffle(rng);

    Ok(indices
        .chunks_exact(batch_size)
        .map(<[i64]>::to_vec)
        .collect())
}

/// Gathers the rows in `idx` and moves them to `device`.
pub fn gather(images: &Tensor, labels: &Tensor, idx: &[i64], device: Device) -> (Tensor, Tensor) {
    let idx = Tensor::from_slice(idx);
    (
        images.index_select(0, &idx).to_device(device),
        labels.index_select(0, &idx).to_device(device),
    )
}

fn luminance(px: RGB<f32>) -> f32 {
    0.299 * px.r + 0.587 * px.g + 0.114 * px.b
}

/// Renders one channel-major RGB image (`[3, height, width]`, values in
/// `[0, 1]`) as braille, lighting the dots whose luminance reaches
/// `threshold`. Every character covers a 2x4 pixel cell.
pub fn render(chw: &[f32], width: usize, height: usize, threshold: f32) -> String {
    let plane = width * height;
    let lit: Vec<bool> = (0..plane)
        .map(|i| RGB::new(chw[i], chw[plane + i], chw[2 * plane + i]))
        .map(|px| luminance(px) >= threshold)
        .collect();

    let dot = |x: usize, y: usize| (x < width && y < height && lit[y * width + x]) as u8;

    let mut canvas = String::new();
    for cy in (0..height).step_by(4) {
        for cx in (0..width).step_by(2) {
            let byte = dot(cx, cy)
                | (dot(cx, cy + 1) << 1)
                | (dot(cx, cy + 2) << 2)
                | (dot(cx, cy + 3) << 3)
                | (dot(cx + 1, cy) << 4)
                | (dot(cx + 1, cy + 1) << 5)
                | (dot(cx + 1, cy + 2) << 6)
                | (dot(cx + 1, cy + 3) << 7);

            canvas.push(BrailleChar::with_data(byte).into())
        }
        canvas.push('\n')
    }

    canvas
}

/// Draws the first `rows * cols` images as a labelled braille grid. Each
/// image is thresholded at its own mean luminance.
pub fn preview(images: &Tensor, labels: &Tensor, rows: usize, cols: usize) -> Result<String> {
    let (n, c, h, w) = images.size4()?;
    let count = (rows * cols).min(n as usize);
    if count == 0 || c != CHANNELS {
        return Ok(String::new());
    }

    let pixels = Vec::<f32>::try_from(
        &images
            .narrow(0, 0, count as i64)
            .to_kind(Kind::Float)
            .contiguous()
            .view([-1]),
    )?;
    let labels = Vec::<i64>::try_from(&labels.narrow(0, 0, count as i64).to_kind(Kind::Int64))?;

    let (w, h) = (w as usize, h as usize);
    let stride = 3 * w * h;
    let cell_width = w.div_ceil(2);

    let tiles: Vec<Vec<String>> = pixels
        .chunks_exact(stride)
        .map(|chw| {
            let plane = w * h;
            let mean = (0..plane)
                .map(|i| luminance(RGB::new(chw[i], chw[plane + i], chw[2 * plane + i])))
                .sum::<f32>()
                / plane as f32;
            render(chw, w, h, mean)
                .lines()
                .map(str::to_string)
                .collect()
        })
        .collect();

    let mut out = String::new();
    for (row_tiles, row_labels) in tiles.chunks(cols).zip(labels.chunks(cols)) {
        let captions: Vec<String> = row_labels
            .iter()
            .map(|&l| {
                let name = CLASS_NAMES.get(l as usize).copied().unwrap_or("?");
                format!("{:^width$.width$}", name, width = cell_width)
            })
            .collect();
        out.push_str(captions.join("  ").trim_end());
        out.push('\n');

        let lines = row_tiles.iter().map(Vec::len).max().unwrap_or(0);
        for line in 0..lines {
            let row: Vec<&str> = row_tiles
                .iter()
                .map(|tile| tile.get(line).map(String::as_str).unwrap_or(""))
                .collect();
            out.push_str(&row.join("  "));
            out.push('\n');
        }
        out.push('\n');
    }

    Ok(out)
}
