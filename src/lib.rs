//! Wide residual networks for CIFAR-10 on top of libtorch.
//!
//! - `model`: the WRN-d-k architecture
//! - `cifar`, `augment`: dataset loading, standardization and augmentation
//! - `schedule`, `train`, `callbacks`: the SGD fit loop and its hooks
//! - `metrics`, `summary`: evaluation reports and model tables
//! - `config`: JSON run configuration

pub mod augment;
pub mod callbacks;
pub mod cifar;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod schedule;
pub mod summary;
pub mod train;

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::LevelFilter;

pub use callbacks::{Callback, Checkpoint, EpochLogs, History, ProgressLogger, TensorBoard};
pub use config::Config;
pub use error::{Error, Result};
pub use model::{WideResNet, WideResNetGroup};
pub use train::{evaluate, Evaluation, Trainer};

/// Initializes `env_logger` once. `RUST_LOG` wins over `default_filter`.
pub fn init_logging(default_filter: LevelFilter) {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    builder.format_timestamp_secs();

    if builder.try_init().is_err() {
        // already initialized
    }
}

/// Creates and returns `<log_dir>/<YYYYmmdd-HHMMSS>`.
pub fn create_run_dir(log_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let dir = log_dir.as_ref().join(stamp.to_string());
    fs::create_dir_all(&dir)?;
    Ok(dir)
}
