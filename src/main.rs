use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, LevelFilter};
use tch::nn;

use wide_resnet::{
    cifar::{self, Cifar10},
    config::{parse_device, Config},
    metrics::ConfusionMatrix,
    summary::ModelSummary,
    Checkpoint, ProgressLogger, TensorBoard, Trainer, WideResNet,
};

#[derive(Parser)]
#[command(version, about = "Train and inspect Wide-ResNets on CIFAR-10")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a model, writing TensorBoard summaries and checkpoints.
    Train(TrainArgs),
    /// Print layer shapes and parameter counts.
    Summary(ModelArgs),
    /// Draw the first training images in the terminal.
    Preview {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[arg(long, default_value_t = 5)]
        rows: usize,
        #[arg(long, default_value_t = 10)]
        cols: usize,
    },
    /// Score a checkpoint on the test split.
    Evaluate {
        #[command(flatten)]
        model: ModelArgs,
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long)]
        data_dir: Option<String>,
        #[arg(long)]
        device: Option<String>,
    },
}

#[derive(Args)]
struct ModelArgs {
    /// JSON config; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    depth: Option<usize>,
    #[arg(long, short = 'k')]
    widen: Option<usize>,
}

#[derive(Args)]
struct TrainArgs {
    #[command(flatten)]
    model: ModelArgs,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    data_dir: Option<String>,
    #[arg(long)]
    log_dir: Option<String>,
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    no_augment: bool,
}

impl ModelArgs {
    fn resolve(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("reading config {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(depth) = self.depth {
            config.model.depth = depth;
        }
        if let Some(widen) = self.widen {
            config.model.widen_factor = widen;
        }
        Ok(config)
    }
}

impl TrainArgs {
    fn resolve(&self) -> Result<Config> {
        let mut config = self.model.resolve()?;
        let t = &mut config.training;
        if let Some(epochs) = self.epochs {
            t.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            t.batch_size = batch_size;
        }
        if let Some(dir) = &self.data_dir {
            t.data_dir = dir.clone();
        }
        if let Some(dir) = &self.log_dir {
            t.log_dir = dir.clone();
        }
        if let Some(device) = &self.device {
            t.device = device.clone();
        }
        if let Some(seed) = self.seed {
            t.seed = seed;
        }
        if let Some(lr) = self.lr {
            config.optimizer.lr = lr;
        }
        if self.no_augment {
            config.augmentation.enabled = false;
        }
        config.validate()?;
        Ok(config)
    }
}

fn train(args: TrainArgs) -> Result<()> {
    let config = args.resolve()?;
    tch::manual_seed(config.training.seed as i64);
    let device = parse_device(&config.training.device)?;

    let run_dir = wide_resnet::create_run_dir(&config.training.log_dir)?;
    config.save(run_dir.join("config.json"))?;
    info!("run directory {}", run_dir.display());

    let (data, _) = Cifar10::load(&config.training.data_dir)
        .context("loading CIFAR-10")?
        .standardize(config.training.test_statistics);

    let vs = nn::VarStore::new(device);
    let model = WideResNet::new(&vs.root(), &config.model)?;
    info!(
        "\n{}",
        ModelSummary::new(&vs, &model, [cifar::CHANNELS, cifar::IMAGE_SIZE, cifar::IMAGE_SIZE])
    );

    let checkpoint_dir = Path::new(&config.training.checkpoint_dir)
        .join(run_dir.file_name().unwrap_or_default());
    let mut trainer = Trainer::new(&vs, &config)?
        .with_callback(ProgressLogger::new())
        .with_callback(
            TensorBoard::new(&run_dir, config.training.tensorboard_update_freq)?
                .with_histogram_freq(config.training.histogram_freq),
        )
        .with_callback(Checkpoint::new(
            checkpoint_dir,
            config.training.checkpoint_every,
        )?);

    let history = trainer.fit(&vs, &model, &data)?;
    history.save(run_dir.join("history.json"))?;
    Ok(())
}

fn summary(args: ModelArgs) -> Result<()> {
    let config = args.resolve()?;
    config.validate()?;

    let vs = nn::VarStore::new(tch::Device::Cpu);
    let model = WideResNet::new(&vs.root(), &config.model)?;
    print!(
        "{}",
        ModelSummary::new(&vs, &model, [cifar::CHANNELS, cifar::IMAGE_SIZE, cifar::IMAGE_SIZE])
    );
    Ok(())
}

fn preview(data_dir: PathBuf, rows: usize, cols: usize) -> Result<()> {
    let data = Cifar10::load(&data_dir).context("loading CIFAR-10")?;
    print!(
        "{}",
        cifar::preview(&data.train_images, &data.train_labels, rows, cols)?
    );
    Ok(())
}

fn evaluate(
    args: ModelArgs,
    checkpoint: PathBuf,
    data_dir: Option<String>,
    device: Option<String>,
) -> Result<()> {
    let mut config = args.resolve()?;
    if let Some(dir) = data_dir {
        config.training.data_dir = dir;
    }
    if let Some(device) = device {
        config.training.device = device;
    }
    config.validate()?;
    let device = parse_device(&config.training.device)?;

    let mut vs = nn::VarStore::new(device);
    let model = WideResNet::new(&vs.root(), &config.model)?;
    vs.load(&checkpoint)
        .with_context(|| format!("loading checkpoint {}", checkpoint.display()))?;

    let (data, _) = Cifar10::load(&config.training.data_dir)
        .context("loading CIFAR-10")?
        .standardize(config.training.test_statistics);

    let eval = wide_resnet::evaluate(
        &model,
        &data.test_images,
        &data.test_labels,
        config.training.batch_size,
        device,
    )?;
    let labels = Vec::<i64>::try_from(&data.test_labels)?;
    let cm = ConfusionMatrix::from_predictions(data.n_classes, &eval.predictions, &labels)?;

    println!(
        "{}: loss {:.4}  accuracy {:.2}%\n",
        model.name(),
        eval.loss,
        eval.accuracy * 100.
    );
    print!("{}", cm.report(&cifar::CLASS_NAMES));
    Ok(())
}

fn main() -> Result<()> {
    wide_resnet::init_logging(LevelFilter::Info);

    match Cli::parse().command {
        Command::Train(args) => train(args),
        Command::Summary(args) => summary(args),
        Command::Preview {
            data_dir,
            rows,
            cols,
        } => preview(data_dir, rows, cols),
        Command::Evaluate {
            model,
            checkpoint,
            data_dir,
            device,
        } => evaluate(model, checkpoint, data_dir, device),
    }
}
