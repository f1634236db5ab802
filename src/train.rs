use std::time::Instant;

use log::{info, warn};
use rand::{rngs::StdRng, SeedableRng};
use tch::{
    nn::{self, ModuleT, OptimizerConfig},
    Device, Kind, Tensor,
};

use crate::{
    augment::Augmenter,
    callbacks::{BatchLogs, Callback, EpochLogs, History},
    cifar::{self, Cifar10},
    config::Config,
    error::{Error, Result},
    model::WideResNet,
    schedule::{LrSchedule, MultiStep},
};

/// Mean loss and accuracy of a model over a labelled set, plus its
/// arg-max predictions in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
    pub predictions: Vec<i64>,
}

/// Runs `model` in inference mode over `images` in chunks of `batch_size`.
/// Every example is used, including a final partial chunk.
pub fn evaluate<M: ModuleT>(
    model: &M,
    images: &Tensor,
    labels: &Tensor,
    batch_size: usize,
    device: Device,
) -> Result<Evaluation> {
    let n = images.size()[0];
    let batch_size = batch_size.max(1) as i64;

    tch::no_grad(|| -> Result<Evaluation> {
        let mut loss_sum = 0.;
        let mut correct = 0i64;
        let mut predictions = Vec::with_capacity(n as usize);

        let mut start = 0;
        while start < n {
            let len = batch_size.min(n - start);
            let xs = images.narrow(0, start, len).to_device(device);
            let ys = labels.narrow(0, start, len).to_device(device);

            let logits = model.forward_t(&xs, false);
            loss_sum += logits.cross_entropy_for_logits(&ys).double_value(&[]) * len as f64;

            let preds = logits.argmax(-1, false);
            correct += preds.eq_tensor(&ys).sum(Kind::Int64).int64_value(&[]);
            predictions.extend(Vec::<i64>::try_from(&preds.to_device(Device::Cpu))?);

            start += len;
        }

        let n = n.max(1) as f64;
        Ok(Evaluation {
            loss: loss_sum / n,
            accuracy: correct as f64 / n,
            predictions,
        })
    })
}

/// Mini-batch SGD driver: Nesterov momentum, cross-entropy on logits plus
/// the model's L2 penalty, learning rate set from the schedule at the start
/// of every epoch.
pub struct Trainer {
    opt: nn::Optimizer,
    schedule: Box<dyn LrSchedule>,
    augmenter: Option<Augmenter>,
    callbacks: Vec<Box<dyn Callback>>,
    batch_size: usize,
    epochs: usize,
    rng: StdRng,
}

impl Trainer {
    /// Fails when `config` does not validate.
    pub fn new(vs: &nn::VarStore, config: &Config) -> Result<Self> {
        config.validate()?;

        let opt = nn::Sgd {
            momentum: config.optimizer.momentum,
            dampening: 0.,
            wd: 0.,
            nesterov: config.optimizer.nesterov,
        }
        .build(vs, config.optimizer.lr)?;

        let seed = config.training.seed;
        let augmenter = config
            .augmentation
            .enabled
            .then(|| Augmenter::new(config.augmentation.clone(), seed.wrapping_add(1)));

        Ok(Self {
            opt,
            schedule: Box::new(MultiStep::from_config(&config.optimizer)),
            augmenter,
            callbacks: Vec::new(),
            batch_size: config.training.batch_size,
            epochs: config.training.epochs,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn with_schedule(mut self, schedule: impl LrSchedule + 'static) -> Self {
        self.schedule = Box::new(schedule);
        self
    }

    pub fn with_callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn without_augmentation(mut self) -> Self {
        self.augmenter = None;
        self
    }

    /// Trains `model` (whose variables live in `vs`) on the training split
    /// of `data` and validates on its test split after every epoch.
    pub fn fit(&mut self, vs: &nn::VarStore, model: &WideResNet, data: &Cifar10) -> Result<History> {
        let device = vs.device();
        let n = data.train_len();
        let steps = n.checked_div(self.batch_size).unwrap_or(0);
        if steps == 0 {
            return Err(Error::EmptyEpoch {
                batch_size: self.batch_size,
                len: n,
            });
        }

        info!(
            "Starting training {}:\n  epochs: {:>3}\n  mini_batch: {}\n  examples: {}\n  device: {:?}",
            model.name(),
            self.epochs,
            self.batch_size,
            n,
            device
        );

        let dropped = n - steps * self.batch_size;
        if dropped > 0 {
            warn!("{dropped} examples per epoch are dropped to keep batches full");
        }

        for cb in self.callbacks.iter_mut() {
            cb.on_train_begin(self.epochs, steps)?;
        }

        let mut history = History::default();
        for epoch in 0..self.epochs {
            let logs = self.run_epoch(epoch, vs, model, data)?;
            history.epochs.push(logs);
        }

        for cb in self.callbacks.iter_mut() {
            cb.on_train_end(&history)?;
        }

        if let Some(best) = history.best() {
            info!(
                "best val_accuracy {:.4} at epoch {}",
                best.val_accuracy,
                best.epoch + 1
            );
        }
        Ok(history)
    }

    fn run_epoch(
        &mut self,
        epoch: usize,
        vs: &nn::VarStore,
        model: &WideResNet,
        data: &Cifar10,
    ) -> Result<EpochLogs> {
        let device = vs.device();
        let start = Instant::now();

        let lr = self.schedule.lr_at(epoch);
        self.opt.set_lr(lr);
        for cb in self.callbacks.iter_mut() {
            cb.on_epoch_begin(epoch, lr)?;
        }

        let batches = cifar::shuffled_batches(data.train_len(), self.batch_size, &mut self.rng)?;
        let (mut loss_sum, mut acc_sum) = (0., 0.);

        for (step, idx) in batches.iter().enumerate() {
            let (xs, ys) = cifar::gather(&data.train_images, &data.train_labels, idx, device);
            let xs = match self.augmenter.as_mut() {
                Some(augmenter) => augmenter.apply(&xs)?,
                None => xs,
            };

            let logits = model.forward_t(&xs, true);
            let loss = logits.cross_entropy_for_logits(&ys) + model.l2_penalty();
            self.opt.backward_step(&loss);

            let loss = loss.double_value(&[]);
            if !loss.is_finite() {
                return Err(Error::Diverged { epoch, step, loss });
            }
            loss_sum += loss;
            acc_sum += logits.accuracy_for_logits(&ys).double_value(&[]);

            let seen = (step + 1) as f64;
            let batch = BatchLogs {
                epoch,
                step,
                loss: loss_sum / seen,
                accuracy: acc_sum / seen,
            };
            for cb in self.callbacks.iter_mut() {
                cb.on_batch_end(&batch)?;
            }
        }

        let steps = batches.len() as f64;
        let val = evaluate(
            model,
            &data.test_images,
            &data.test_labels,
            self.batch_size,
            device,
        )?;
        let penalty = tch::no_grad(|| model.l2_penalty().double_value(&[]));

        let logs = EpochLogs {
            epoch,
            lr,
            loss: loss_sum / steps,
            accuracy: acc_sum / steps,
            val_loss: val.loss + penalty,
            val_accuracy: val.accuracy,
            elapsed: start.elapsed(),
        };

        for cb in self.callbacks.iter_mut() {
            cb.on_epoch_end(&logs, vs)?;
        }

        info!(
            "epoch {:>3}: lr {:.4}  loss {:.4}  acc {:#.3}%  val_loss {:.4}  val_acc {:#.3}%  time: {:#?}",
            epoch + 1,
            logs.lr,
            logs.loss,
            logs.accuracy * 100.,
            logs.val_loss,
            logs.val_accuracy * 100.,
            logs.elapsed
        );
        Ok(logs)
    }
}

#[cfg(test)]
mod test {
    use tch::{nn, Device, Kind, Tensor};

    use super::*;
    use crate::{callbacks::EpochLogs, config::ModelConfig, schedule::Constant};

    /// Two well-separated classes: images filled with -1 or +1.
    fn toy_data(n: i64) -> Cifar10 {
        let labels = Tensor::arange(n, (Kind::Int64, Device::Cpu)).remainder(2);
        let sign = labels.to_kind(Kind::Float) * 2. - 1.;
        let images = sign.view([n, 1, 1, 1]).expand([n, 3, 8, 8], false).contiguous();
        Cifar10 {
            train_images: images.shallow_clone(),
            train_labels: labels.shallow_clone(),
            test_images: images,
            test_labels: labels,
            n_classes: 2,
        }
    }

    fn toy_config() -> Config {
        let mut config = Config::default();
        config.model = ModelConfig {
            n_classes: 2,
            depth: 10,
            widen_factor: 1,
            dropout_rate: 0.,
            weight_decay: 0.,
            bn_momentum: 0.1,
            input_size: 8,
            ..Default::default()
        };
        config.training.batch_size = 8;
        config.training.epochs = 3;
        config.augmentation.enabled = false;
        config
    }

    #[derive(Default)]
    struct Recorder {
        batches: usize,
        lrs: Vec<f64>,
        epochs: Vec<usize>,
        finished: bool,
    }

    impl Callback for std::rc::Rc<std::cell::RefCell<Recorder>> {
        fn on_epoch_begin(&mut self, _epoch: usize, lr: f64) -> Result<()> {
            self.borrow_mut().lrs.push(lr);
            Ok(())
        }

        fn on_batch_end(&mut self, _logs: &BatchLogs) -> Result<()> {
            self.borrow_mut().batches += 1;
            Ok(())
        }

        fn on_epoch_end(&mut self, logs: &EpochLogs, _vs: &nn::VarStore) -> Result<()> {
            self.borrow_mut().epochs.push(logs.epoch);
            Ok(())
        }

        fn on_train_end(&mut self, _history: &History) -> Result<()> {
            self.borrow_mut().finished = true;
            Ok(())
        }
    }

    #[test]
    fn learns_separable_toy_problem() {
        tch::manual_seed(0);
        let mut config = toy_config();
        config.training.epochs = 6;
        let data = toy_data(64);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = WideResNet::new(&vs.root(), &config.model).unwrap();

        let recorder = std::rc::Rc::new(std::cell::RefCell::new(Recorder::default()));
        let mut trainer = Trainer::new(&vs, &config)
            .unwrap()
            .with_schedule(Constant(0.05))
            .with_callback(recorder.clone());

        let history = trainer.fit(&vs, &model, &data).unwrap();
        assert_eq!(history.epochs.len(), 6);
        assert!(history.epochs.iter().all(|e| e.loss.is_finite()));

        let first = &history.epochs[0];
        let last = history.last().unwrap();
        assert!(last.loss < first.loss, "{} !< {}", last.loss, first.loss);
        assert!(last.accuracy > 0.9, "accuracy {}", last.accuracy);

        let recorder = recorder.borrow();
        assert_eq!(recorder.batches, 6 * 8);
        assert_eq!(recorder.lrs, vec![0.05; 6]);
        assert_eq!(recorder.epochs, (0..6).collect::<Vec<_>>());
        assert!(recorder.finished);
    }

    #[test]
    fn schedule_drives_learning_rate() {
        let mut config = toy_config();
        config.optimizer.milestones = vec![2, 3];
        config.optimizer.decay_ratio = 0.5;
        let data = toy_data(16);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = WideResNet::new(&vs.root(), &config.model).unwrap();

        let mut trainer = Trainer::new(&vs, &config).unwrap();
        let history = trainer.fit(&vs, &model, &data).unwrap();
        let lrs: Vec<f64> = history.epochs.iter().map(|e| e.lr).collect();
        assert_eq!(lrs.len(), 3);
        approx::assert_relative_eq!(lrs[0], 0.1);
        approx::assert_relative_eq!(lrs[1], 0.05);
        approx::assert_relative_eq!(lrs[2], 0.025);
    }

    #[test]
    fn batch_larger_than_dataset_is_an_error() {
        let mut config = toy_config();
        config.training.batch_size = 64;
        let data = toy_data(16);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = WideResNet::new(&vs.root(), &config.model).unwrap();

        let mut trainer = Trainer::new(&vs, &config).unwrap();
        assert!(matches!(
            trainer.fit(&vs, &model, &data),
            Err(Error::EmptyEpoch { .. })
        ));
    }

    #[test]
    fn zero_batch_size_is_rejected_up_front() {
        let mut config = toy_config();
        config.training.batch_size = 0;
        let vs = nn::VarStore::new(Device::Cpu);

        assert!(matches!(Trainer::new(&vs, &config), Err(Error::Config(_))));
    }

    #[test]
    fn fits_with_default_augmentation() {
        tch::manual_seed(3);
        let mut config = toy_config();
        config.augmentation = Default::default();
        config.training.epochs = 2;
        let data = toy_data(32);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = WideResNet::new(&vs.root(), &config.model).unwrap();

        let recorder = std::rc::Rc::new(std::cell::RefCell::new(Recorder::default()));
        let mut trainer = Trainer::new(&vs, &config)
            .unwrap()
            .with_callback(recorder.clone());
        assert!(trainer.augmenter.is_some());

        let history = trainer.fit(&vs, &model, &data).unwrap();
        assert_eq!(history.epochs.len(), 2);
        assert!(history
            .epochs
            .iter()
            .all(|e| e.loss.is_finite() && e.val_loss.is_finite()));
        assert_eq!(recorder.borrow().batches, 2 * 4);
    }

    #[test]
    fn evaluate_uses_partial_last_batch() {
        let data = toy_data(10);
        let config = toy_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = WideResNet::new(&vs.root(), &config.model).unwrap();

        let eval = evaluate(&model, &data.test_images, &data.test_labels, 4, Device::Cpu).unwrap();
        assert_eq!(eval.predictions.len(), 10);
        assert!(eval.predictions.iter().all(|&p| p == 0 || p == 1));
        assert!((0. ..=1.).contains(&eval.accuracy));
        assert!(eval.loss.is_finite());
    }
}
