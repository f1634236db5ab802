use crate::config::OptimizerConfig;

/// Learning rate as a function of the 0-based epoch index.
pub trait LrSchedule {
    fn lr_at(&self, epoch: usize) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Constant(pub f64);

impl LrSchedule for Constant {
    fn lr_at(&self, _epoch: usize) -> f64 {
        self.0
    }
}

/// Step schedule from the Wide-ResNet paper: the rate is multiplied by
/// `decay_ratio` once the 1-based epoch number reaches each milestone.
///
/// With the defaults (`0.1`, `[60, 120, 160]`, `0.2`) epochs 0..=58 train at
/// 0.1, 59..=118 at 0.02, 119..=158 at 0.004 and the rest at 0.0008.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiStep {
    initial_lr: f64,
    milestones: Vec<usize>,
    decay_ratio: f64,
}

impl MultiStep {
    pub fn new(initial_lr: f64, milestones: Vec<usize>, decay_ratio: f64) -> Self {
        Self {
            initial_lr,
            milestones,
            decay_ratio,
        }
    }

    pub fn from_config(config: &OptimizerConfig) -> Self {
        Self::new(config.lr, config.milestones.clone(), config.decay_ratio)
    }
}

impl LrSchedule for MultiStep {
    fn lr_at(&self, epoch: usize) -> f64 {
        let passed = self.milestones.iter().filter(|&&m| epoch + 1 >= m).count();
        self.initial_lr * self.decay_ratio.powi(passed as i32)
    }
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;

    use super::*;

    fn paper() -> MultiStep {
        MultiStep::from_config(&OptimizerConfig::default())
    }

    #[test]
    fn paper_schedule_boundaries() {
        let schedule = paper();
        for (epoch, lr) in [
            (0, 0.1),
            (58, 0.1),
            (59, 0.02),
            (118, 0.02),
            (119, 0.004),
            (158, 0.004),
            (159, 0.0008),
            (199, 0.0008),
        ] {
            assert_relative_eq!(schedule.lr_at(epoch), lr, epsilon = 1e-12);
        }
    }

    #[test]
    fn no_milestones_is_constant() {
        let schedule = MultiStep::new(0.05, vec![], 0.2);
        assert_relative_eq!(schedule.lr_at(0), 0.05);
        assert_relative_eq!(schedule.lr_at(1000), 0.05);
        assert_relative_eq!(Constant(0.05).lr_at(7), 0.05);
    }

    #[test]
    fn monotonically_non_increasing() {
        let schedule = paper();
        let lrs: Vec<f64> = (0..200).map(|e| schedule.lr_at(e)).collect();
        assert!(lrs.windows(2).all(|w| w[1] <= w[0]));
    }
}
