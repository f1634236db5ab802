use std::fmt::Write;

use ndarray::{Array2, Axis};
use rayon::prelude::*;

use crate::error::{Error, Result};

/// `counts[[truth, predicted]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    counts: Array2<u64>,
}

impl ConfusionMatrix {
    pub fn new(n_classes: usize) -> Self {
        Self {
            counts: Array2::zeros((n_classes, n_classes)),
        }
    }

    pub fn from_predictions(n_classes: usize, predictions: &[i64], labels: &[i64]) -> Result<Self> {
        let check = |label: i64| {
            if label < 0 || label as usize >= n_classes {
                Err(Error::LabelOutOfRange { label, n_classes })
            } else {
                Ok(label as usize)
            }
        };

        let counts = predictions
            .par_iter()
            .zip(labels.par_iter())
            .try_fold(
                || Array2::<u64>::zeros((n_classes, n_classes)),
                |mut counts, (&p, &t)| {
                    counts[[check(t)?, check(p)?]] += 1;
                    Ok::<_, Error>(counts)
                },
            )
            .try_reduce(
                || Array2::zeros((n_classes, n_classes)),
                |a, b| Ok(a + b),
            )?;

        Ok(Self { counts })
    }

    pub fn n_classes(&self) -> usize {
        self.counts.nrows()
    }

    pub fn counts(&self) -> &Array2<u64> {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.counts.diag().sum(), self.total())
    }

    /// Examples whose true class is `class`.
    pub fn support(&self, class: usize) -> u64 {
        self.counts.row(class).sum()
    }

    pub fn precision(&self, class: usize) -> f64 {
        ratio(self.counts[[class, class]], self.counts.column(class).sum())
    }

    pub fn recall(&self, class: usize) -> f64 {
        ratio(self.counts[[class, class]], self.support(class))
    }

    pub fn f1(&self, class: usize) -> f64 {
        let (p, r) = (self.precision(class), self.recall(class));
        if p + r == 0. {
            0.
        } else {
            2. * p * r / (p + r)
        }
    }

    /// Per-class precision/recall/F1/support followed by accuracy and the
    /// macro average, one class per line.
    pub fn report(&self, names: &[&str]) -> String {
        let width = names.iter().map(|n| n.len()).max().unwrap_or(0).max(12);
        let mut out = String::new();

        let _ = writeln!(
            out,
            "{:>width$} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        );
        for class in 0..self.n_classes() {
            let name = names
                .get(class)
                .map(|n| n.to_string())
                .unwrap_or_else(|| class.to_string());
            let _ = writeln!(
                out,
                "{:>width$} {:>9.4} {:>9.4} {:>9.4} {:>9}",
                name,
                self.precision(class),
                self.recall(class),
                self.f1(class),
                self.support(class)
            );
        }

        let n = self.n_classes().max(1) as f64;
        let macro_avg = |f: &dyn Fn(usize) -> f64| (0..self.n_classes()).map(f).sum::<f64>() / n;
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:>width$} {:>9} {:>9} {:>9.4} {:>9}",
            "accuracy",
            "",
            "",
            self.accuracy(),
            self.total()
        );
        let _ = writeln!(
            out,
            "{:>width$} {:>9.4} {:>9.4} {:>9.4} {:>9}",
            "macro avg",
            macro_avg(&|c| self.precision(c)),
            macro_avg(&|c| self.recall(c)),
            macro_avg(&|c| self.f1(c)),
            self.total()
        );
        out
    }

    /// Predictions per true class, rows summing to one.
    pub fn normalized(&self) -> Array2<f64> {
        let counts = self.counts.mapv(|c| c as f64);
        let sums = counts.sum_axis(Axis(1)).mapv(|s| if s == 0. { 1. } else { s });
        counts / &sums.insert_axis(Axis(1))
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.
    } else {
        num as f64 / den as f64
    }
}
