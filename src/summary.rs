use std::fmt;

use tch::{nn::VarStore, Kind, Tensor};

use crate::model::WideResNet;

#[derive(Debug, Clone, PartialEq)]
pub struct LayerRow {
    pub name: String,
    pub output_shape: Vec<i64>,
    pub params: usize,
}

/// Per-stage output shapes and parameter counts of a [`WideResNet`].
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSummary {
    pub model: String,
    pub rows: Vec<LayerRow>,
    pub total: usize,
    pub trainable: usize,
}

impl ModelSummary {
    /// Traces a single zero image of shape `input_shape` (`[C, H, W]`)
    /// through the model. Parameters are attributed to a stage by the first
    /// component of their variable name; the pooling row owns none.
    pub fn new(vs: &VarStore, model: &WideResNet, input_shape: [i64; 3]) -> Self {
        let [c, h, w] = input_shape;
        let xs = Tensor::zeros([1, c, h, w], (Kind::Float, vs.device()));

        let variables = vs.variables();
        let params_under = |prefix: &str| -> usize {
            variables
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .map(|(_, t)| t.numel())
                .sum()
        };

        let rows = model
            .trace(&xs)
            .into_iter()
            .map(|(name, output_shape)| {
                let params = match name.as_str() {
                    "classifier.pool" => params_under("classifier.bn."),
                    "classifier.fc" => params_under("classifier.fc."),
                    stage => params_under(&format!("{stage}.")),
                };
                LayerRow {
                    name,
                    output_shape,
                    params,
                }
            })
            .collect();

        let total = variables.values().map(Tensor::numel).sum();
        let trainable = vs.trainable_variables().iter().map(Tensor::numel).sum();

        Self {
            model: model.name().to_string(),
            rows,
            total,
            trainable,
        }
    }

    pub fn non_trainable(&self) -> usize {
        self.total - self.trainable
    }
}

fn shape(dims: &[i64]) -> String {
    let inner: Vec<String> = std::iter::once("None".to_string())
        .chain(dims.iter().skip(1).map(i64::to_string))
        .collect();
    format!("({})", inner.join(", "))
}

fn thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(66);
        writeln!(f, "Model: \"{}\"", self.model)?;
        writeln!(f, "{}", "_".repeat(66))?;
        writeln!(f, "{:<24}{:<28}{:>14}", "Layer", "Output Shape", "Param #")?;
        writeln!(f, "{rule}")?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<24}{:<28}{:>14}",
                row.name,
                shape(&row.output_shape),
                thousands(row.params)
            )?;
        }
        writeln!(f, "{rule}")?;
        writeln!(f, "Total params: {}", thousands(self.total))?;
        writeln!(f, "Trainable params: {}", thousands(self.trainable))?;
        writeln!(f, "Non-trainable params: {}", thousands(self.non_trainable()))
    }
}
