//! Hooks run by [`Trainer::fit`](crate::train::Trainer::fit) around epochs
//! and batches.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use serde::Serialize;
use tch::{nn::VarStore, Device, Kind, Tensor};
use tensorboard_rs::summary_writer::SummaryWriter;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchLogs {
    pub epoch: usize,
    pub step: usize,
    /// Running means over the batches seen so far this epoch.
    pub loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochLogs {
    pub epoch: usize,
    pub lr: f64,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct History {
    pub epochs: Vec<EpochLogs>,
}

impl History {
    pub fn best(&self) -> Option<&EpochLogs> {
        self.epochs
            .iter()
            .max_by(|a, b| a.val_accuracy.total_cmp(&b.val_accuracy))
    }

    pub fn last(&self) -> Option<&EpochLogs> {
        self.epochs.last()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[allow(unused_variables)]
pub trait Callback {
    fn on_train_begin(&mut self, epochs: usize, steps_per_epoch: usize) -> Result<()> {
        Ok(())
    }

    fn on_epoch_begin(&mut self, epoch: usize, lr: f64) -> Result<()> {
        Ok(())
    }

    fn on_batch_end(&mut self, logs: &BatchLogs) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, logs: &EpochLogs, vs: &VarStore) -> Result<()> {
        Ok(())
    }

    fn on_train_end(&mut self, history: &History) -> Result<()> {
        Ok(())
    }
}

/// Progress bar over the batches of the running epoch.
#[derive(Default)]
pub struct ProgressLogger {
    steps: u64,
    bar: Option<ProgressBar>,
}

impl ProgressLogger {
    pub fn new() -> Self {
        Self::default()
    }

    fn style() -> ProgressStyle {
        ProgressStyle::with_template(
            "[{elapsed:.green}] [{wide_bar:.cyan/red}] {pos:.red}/{len:.green} ({eta}) {msg}",
        )
        .map(|style| style.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
    }
}

impl Callback for ProgressLogger {
    fn on_train_begin(&mut self, _epochs: usize, steps_per_epoch: usize) -> Result<()> {
        self.steps = steps_per_epoch as u64;
        Ok(())
    }

    fn on_epoch_begin(&mut self, _epoch: usize, _lr: f64) -> Result<()> {
        self.bar = Some(ProgressBar::new(self.steps).with_style(Self::style()));
        Ok(())
    }

    fn on_batch_end(&mut self, logs: &BatchLogs) -> Result<()> {
        if let Some(bar) = &self.bar {
            bar.inc(1);
            bar.set_message(format!(
                "loss: {:.4} acc: {:.4}",
                logs.loss, logs.accuracy
            ));
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, _logs: &EpochLogs, _vs: &VarStore) -> Result<()> {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        Ok(())
    }
}

/// Buckets per weight histogram.
const HISTOGRAM_BINS: i64 = 30;

/// Summaries readable by TensorBoard. Batch metrics are written every
/// `update_freq` batches against the global batch count, epoch metrics once
/// per epoch against the epoch index. Every `histogram_freq` epochs (0
/// disables them) each trainable variable also gets a histogram under
/// `weights/<variable name>`.
pub struct TensorBoard {
    writer: SummaryWriter,
    update_freq: usize,
    histogram_freq: usize,
    global_step: usize,
}

impl TensorBoard {
    pub fn new(log_dir: impl AsRef<Path>, update_freq: usize) -> Result<Self> {
        let log_dir = log_dir.as_ref();
        fs::create_dir_all(log_dir)?;
        info!("tensorboard summaries in {}", log_dir.display());

        Ok(Self {
            writer: SummaryWriter::new(log_dir),
            update_freq: update_freq.max(1),
            histogram_freq: 0,
            global_step: 0,
        })
    }

    pub fn with_histogram_freq(mut self, histogram_freq: usize) -> Self {
        self.histogram_freq = histogram_freq;
        self
    }

    fn write_histograms(&mut self, vs: &VarStore, step: usize) -> Result<()> {
        let mut variables: Vec<(String, Tensor)> = vs
            .variables()
            .into_iter()
            .filter(|(_, t)| t.requires_grad())
            .collect();
        variables.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, t) in variables {
            let h = Histogram::of(&t)?;
            if h.num == 0. {
                continue;
            }
            self.writer.add_histogram_raw(
                &format!("weights/{name}"),
                h.min,
                h.max,
                h.num,
                h.sum,
                h.sum_squares,
                &h.bucket_limits,
                &h.bucket_counts,
                step,
            );
        }
        Ok(())
    }
}

/// Summary statistics and equal-width buckets of a tensor's values.
#[derive(Debug, Clone, PartialEq)]
struct Histogram {
    min: f64,
    max: f64,
    num: f64,
    sum: f64,
    sum_squares: f64,
    /// Right edge of every bucket.
    bucket_limits: Vec<f64>,
    bucket_counts: Vec<f64>,
}

impl Histogram {
    fn of(t: &Tensor) -> Result<Self> {
        let values = tch::no_grad(|| {
            t.detach()
                .to_device(Device::Cpu)
                .to_kind(Kind::Double)
                .flatten(0, -1)
        });
        let num = values.numel();
        if num == 0 {
            return Ok(Self {
                min: 0.,
                max: 0.,
                num: 0.,
                sum: 0.,
                sum_squares: 0.,
                bucket_limits: Vec::new(),
                bucket_counts: Vec::new(),
            });
        }

        let min = values.min().double_value(&[]);
        let max = values.max().double_value(&[]);
        let (bucket_limits, bucket_counts) = if min == max {
            (vec![max], vec![num as f64])
        } else {
            let width = (max - min) / HISTOGRAM_BINS as f64;
            let limits = (1..=HISTOGRAM_BINS)
                .map(|i| min + width * i as f64)
                .collect();
            // buckets span the data's own min and max
            let counts = Vec::<f64>::try_from(&values.histc(HISTOGRAM_BINS))?;
            (limits, counts)
        };

        Ok(Self {
            min,
            max,
            num: num as f64,
            sum: values.sum(Kind::Double).double_value(&[]),
            sum_squares: values.square().sum(Kind::Double).double_value(&[]),
            bucket_limits,
            bucket_counts,
        })
    }
}

impl Callback for TensorBoard {
    fn on_batch_end(&mut self, logs: &BatchLogs) -> Result<()> {
        self.global_step += 1;
        if self.global_step % self.update_freq == 0 {
            self.writer
                .add_scalar("batch/loss", logs.loss as f32, self.global_step);
            self.writer
                .add_scalar("batch/accuracy", logs.accuracy as f32, self.global_step);
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, logs: &EpochLogs, vs: &VarStore) -> Result<()> {
        let step = logs.epoch;
        for (tag, value) in [
            ("epoch/loss", logs.loss),
            ("epoch/accuracy", logs.accuracy),
            ("epoch/val_loss", logs.val_loss),
            ("epoch/val_accuracy", logs.val_accuracy),
            ("epoch/learning_rate", logs.lr),
        ] {
            self.writer.add_scalar(tag, value as f32, step);
        }
        if self.histogram_freq > 0 && (logs.epoch + 1) % self.histogram_freq == 0 {
            self.write_histograms(vs, step)?;
        }
        self.writer.flush();
        Ok(())
    }

    fn on_train_end(&mut self, _history: &History) -> Result<()> {
        self.writer.flush();
        Ok(())
    }
}

/// Writes the variable store to `dir`: `last.ot` after every epoch,
/// `epoch_NNN.ot` every `every` epochs (0 disables) and `best.ot` whenever
/// validation accuracy improves.
pub struct Checkpoint {
    dir: PathBuf,
    every: usize,
    best: Option<f64>,
}

impl Checkpoint {
    pub fn new(dir: impl Into<PathBuf>, every: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            every,
            best: None,
        })
    }

    pub fn path_for_epoch(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("epoch_{:03}.ot", epoch + 1))
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join("best.ot")
    }

    pub fn last_path(&self) -> PathBuf {
        self.dir.join("last.ot")
    }
}

impl Callback for Checkpoint {
    fn on_epoch_end(&mut self, logs: &EpochLogs, vs: &VarStore) -> Result<()> {
        vs.save(self.last_path())?;

        if self.every > 0 && (logs.epoch + 1) % self.every == 0 {
            let path = self.path_for_epoch(logs.epoch);
            vs.save(&path)?;
            debug!("saved {}", path.display());
        }

        if self.best.map_or(true, |best| logs.val_accuracy > best) {
            self.best = Some(logs.val_accuracy);
            vs.save(self.best_path())?;
            info!(
                "val_accuracy improved to {:.4}, saved {}",
                logs.val_accuracy,
                self.best_path().display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use tch::{nn, Device, Kind};

    use super::*;

    fn logs(epoch: usize, val_accuracy: f64) -> EpochLogs {
        EpochLogs {
            epoch,
            lr: 0.1,
            loss: 1.,
            accuracy: 0.5,
            val_loss: 1.,
            val_accuracy,
            elapsed: Duration::from_secs(1),
        }
    }

    #[test]
    fn history_best_by_val_accuracy() {
        let history = History {
            epochs: vec![logs(0, 0.3), logs(1, 0.6), logs(2, 0.5)],
        };
        assert_eq!(history.best().map(|l| l.epoch), Some(1));
        assert_eq!(history.last().map(|l| l.epoch), Some(2));
        assert!(History::default().best().is_none());
    }

    #[test]
    fn checkpoint_files() {
        let dir = tempfile::tempdir().unwrap();
        let vs = nn::VarStore::new(Device::Cpu);
        let _w = vs.root().zeros("w", &[2, 2]);

        let mut ckpt = Checkpoint::new(dir.path(), 2).unwrap();
        for (epoch, acc) in [(0, 0.2), (1, 0.4), (2, 0.3)] {
            ckpt.on_epoch_end(&logs(epoch, acc), &vs).unwrap();
        }

        assert!(ckpt.last_path().exists());
        assert!(ckpt.best_path().exists());
        assert!(dir.path().join("epoch_002.ot").exists());
        assert!(!dir.path().join("epoch_001.ot").exists());
        assert!(!dir.path().join("epoch_003.ot").exists());
        assert_eq!(ckpt.best, Some(0.4));
    }

    #[test]
    fn checkpoint_round_trips_weights() {
        let dir = tempfile::tempdir().unwrap();
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().randn_standard("w", &[3]);

        let mut ckpt = Checkpoint::new(dir.path(), 0).unwrap();
        ckpt.on_epoch_end(&logs(0, 0.1), &vs).unwrap();

        let mut restored = nn::VarStore::new(Device::Cpu);
        let r = restored.root().zeros("w", &[3]);
        restored.load(ckpt.best_path()).unwrap();
        assert!(r.allclose(&w.to_kind(Kind::Float), 1e-6, 1e-6, false));
    }

    fn event_bytes(dir: &Path) -> u64 {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().metadata().unwrap().len())
            .sum()
    }

    #[test]
    fn histograms_add_event_data() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _w = vs.root().randn_standard("w", &[64, 8]);
        let _b = vs.root().zeros("b", &[8]);

        let scalars_only = tempfile::tempdir().unwrap();
        let with_histograms = tempfile::tempdir().unwrap();
        let mut plain = TensorBoard::new(scalars_only.path(), 1).unwrap();
        let mut rich = TensorBoard::new(with_histograms.path(), 1)
            .unwrap()
            .with_histogram_freq(1);

        for epoch in 0..2 {
            plain.on_epoch_end(&logs(epoch, 0.5), &vs).unwrap();
            rich.on_epoch_end(&logs(epoch, 0.5), &vs).unwrap();
        }

        assert!(event_bytes(with_histograms.path()) > event_bytes(scalars_only.path()));
    }

    #[test]
    fn histogram_buckets_cover_values() {
        let t = Tensor::from_slice(&[0f64, 1., 2., 3., 3.]);
        let h = Histogram::of(&t).unwrap();
        assert_eq!(h.num, 5.);
        assert_eq!((h.min, h.max), (0., 3.));
        assert_eq!(h.bucket_limits.len(), HISTOGRAM_BINS as usize);
        assert_eq!(h.bucket_counts.iter().sum::<f64>(), 5.);
        approx::assert_abs_diff_eq!(h.bucket_limits[HISTOGRAM_BINS as usize - 1], 3., epsilon = 1e-9);
        approx::assert_abs_diff_eq!(h.sum, 9.);
        approx::assert_abs_diff_eq!(h.sum_squares, 23.);

        let flat = Histogram::of(&Tensor::ones([4], (Kind::Float, Device::Cpu))).unwrap();
        assert_eq!(flat.bucket_limits, vec![1.]);
        assert_eq!(flat.bucket_counts, vec![4.]);
    }

    #[test]
    fn history_serializes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        History {
            epochs: vec![logs(0, 0.25)],
        }
        .save(&path)
        .unwrap();

        let json = fs::read_to_string(path).unwrap();
        assert!(json.contains("\"val_accuracy\": 0.25"));
    }
}
