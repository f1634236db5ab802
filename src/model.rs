//! Wide-ResNet (Zagoruyko & Komodakis, <https://arxiv.org/abs/1605.07146>).
//!
//! A network of depth `d` and widening factor `k` is a 3x3 stem convolution
//! followed by three groups of `(d - 4) / 6` pre-activation residual units
//! with `16k`, `32k` and `64k` channels, and a BN-ReLU-pool-dense classifier.

use tch::{
    nn::{self, ModuleT},
    Kind, Tensor,
};

use crate::{
    config::ModelConfig,
    error::{Error, Result},
};

/// Pool size of the classifier's average pooling.
const POOL_SIZE: i64 = 8;

/// Standard deviation of a unit normal truncated to `[-2, 2]`.
const TRUNCATED_STDEV: f64 = 0.879_625_661_034_239_8;

/// `erf(sqrt(2))`, the probability mass of a unit normal within `[-2, 2]`.
const ERF_SQRT_2: f64 = 0.954_499_736_103_641_6;

/// Overwrites `ws` with He-normal samples: a normal truncated at two standard
/// deviations and rescaled so the samples have variance `2 / fan_in`.
///
/// Samples are drawn by inverse transform: `sqrt(2) * erfinv(u)` with `u`
/// uniform on `(-erf(sqrt(2)), erf(sqrt(2)))` is a unit normal cut at 2.
fn he_normal_(ws: &mut Tensor, fan_in: i64) {
    let stdev = (2. / fan_in as f64).sqrt() / TRUNCATED_STDEV;
    tch::no_grad(|| {
        let sample = Tensor::empty(ws.size().as_slice(), (ws.kind(), ws.device()))
            .uniform_(-ERF_SQRT_2, ERF_SQRT_2)
            .erfinv()
            * (std::f64::consts::SQRT_2 * stdev);
        ws.copy_(&sample);
    });
}

/// Glorot-uniform initialisation, `U(-l, l)` with `l = sqrt(6 / (fan_in + fan_out))`.
fn glorot_uniform(fan_in: i64, fan_out: i64) -> nn::Init {
    let limit = (6. / (fan_in + fan_out) as f64).sqrt();
    nn::Init::Uniform {
        lo: -limit,
        up: limit,
    }
}

fn conv3x3(p: nn::Path, c_in: i64, c_out: i64, stride: i64) -> nn::Conv2D {
    let config = nn::ConvConfig {
        stride,
        padding: 1,
        ws_init: nn::Init::Const(0.),
        bs_init: nn::Init::Const(0.),
        ..Default::default()
    };
    let mut conv = nn::conv2d(p, c_in, c_out, 3, config);
    he_normal_(&mut conv.ws, c_in * 9);
    conv
}

/// Average pooling with TensorFlow's "same" padding at stride 1: the output
/// keeps the input's spatial size, the window extends `(size - 1) / 2` before
/// and `size / 2` after each pixel, and padded cells are left out of the mean.
///
/// Pooling with a symmetric `size / 2` padding that ignores padded cells
/// yields one extra row and column; the window of "same" output `i` is the
/// window of that pooling's output `i + size / 2 - (size - 1) / 2`.
fn same_avg_pool2d(xs: &Tensor, size: i64) -> Tensor {
    let (_, _, h, w) = xs.size4().unwrap_or((0, 0, 0, 0));
    let pad = size / 2;
    let offset = pad - (size - 1) / 2;
    xs.avg_pool2d([size, size], [1, 1], [pad, pad], false, false, None::<i64>)
        .narrow(2, offset, h)
        .narrow(3, offset, w)
}

fn batch_norm(p: nn::Path, channels: i64, config: &ModelConfig) -> nn::BatchNorm {
    let config = nn::BatchNormConfig {
        momentum: config.bn_momentum,
        eps: config.bn_eps,
        ..Default::default()
    };
    nn::batch_norm2d(p, channels, config)
}

/// A pre-activation residual unit.
///
/// ```text
/// x -> bn1 -> relu -> conv1 -> bn2 -> relu -> conv2 -> dropout -> (+) -> out
///              |                                                  |
///              +--------- projection (first unit only) ----------+
/// ```
///
/// Later units add the raw input `x` instead of the projection.
#[derive(Debug)]
pub struct ResidualUnit {
    bn1: nn::BatchNorm,
    conv1: nn::Conv2D,
    bn2: nn::BatchNorm,
    conv2: nn::Conv2D,
    projection: Option<nn::Conv2D>,
    dropout_rate: f64,
}

impl ResidualUnit {
    fn new(
        p: nn::Path,
        c_in: i64,
        c_out: i64,
        stride: i64,
        project: bool,
        config: &ModelConfig,
    ) -> Self {
        let projection = project.then(|| {
            let proj_config = nn::ConvConfig {
                stride,
                ws_init: glorot_uniform(c_in, c_out),
                bs_init: nn::Init::Const(0.),
                ..Default::default()
            };
            nn::conv2d(p.sub("projection"), c_in, c_out, 1, proj_config)
        });

        Self {
            bn1: batch_norm(p.sub("bn1"), c_in, config),
            conv1: conv3x3(p.sub("conv1"), c_in, c_out, stride),
            bn2: batch_norm(p.sub("bn2"), c_out, config),
            conv2: conv3x3(p.sub("conv2"), c_out, c_out, 1),
            projection,
            dropout_rate: config.dropout_rate,
        }
    }

    fn kernels(&self) -> [&Tensor; 2] {
        [&self.conv1.ws, &self.conv2.ws]
    }
}

impl ModuleT for ResidualUnit {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let act = xs.apply_t(&self.bn1, train).relu();
        let out = act
            .apply(&self.conv1)
            .apply_t(&self.bn2, train)
            .relu()
            .apply(&self.conv2)
            .dropout(self.dropout_rate, train);

        match &self.projection {
            Some(projection) => out + act.apply(projection),
            None => out + xs,
        }
    }
}

/// `n_units` residual units taking `input_filters` to `output_filters`; the
/// stride is applied by the first unit, whose shortcut is a 1x1 projection.
#[derive(Debug)]
pub struct WideResNetGroup {
    units: Vec<ResidualUnit>,
    input_filters: i64,
    output_filters: i64,
    stride: i64,
}

impl WideResNetGroup {
    pub(crate) fn new(
        p: nn::Path,
        input_filters: i64,
        output_filters: i64,
        n_units: usize,
        stride: i64,
        config: &ModelConfig,
    ) -> Result<Self> {
        if n_units == 0 {
            return Err(Error::config("a group needs at least one residual unit"));
        }

        let units = (0..n_units)
            .map(|idx| {
                let first = idx == 0;
                ResidualUnit::new(
                    p.sub(format!("unit{idx}")),
                    if first { input_filters } else { output_filters },
                    output_filters,
                    if first { stride } else { 1 },
                    first,
                    config,
                )
            })
            .collect();

        Ok(Self {
            units,
            input_filters,
            output_filters,
            stride,
        })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn input_filters(&self) -> i64 {
        self.input_filters
    }

    pub fn output_filters(&self) -> i64 {
        self.output_filters
    }

    pub fn stride(&self) -> i64 {
        self.stride
    }

    fn kernels(&self) -> impl Iterator<Item = &Tensor> {
        self.units.iter().flat_map(ResidualUnit::kernels)
    }
}

impl ModuleT for WideResNetGroup {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut out = self.units[0].forward_t(xs, train);
        for unit in &self.units[1..] {
            out = unit.forward_t(&out, train);
        }
        out
    }
}

#[derive(Debug)]
pub struct WideResNet {
    stem: nn::Conv2D,
    groups: Vec<WideResNetGroup>,
    bn: nn::BatchNorm,
    fc: nn::Linear,
    weight_decay: f64,
    name: String,
}

impl WideResNet {
    /// Builds the network under `p`. Fails when the configuration is invalid,
    /// in particular when `depth` is not of the form `6n + 4`.
    pub fn new(p: &nn::Path, config: &ModelConfig) -> Result<Self> {
        config.validate()?;

        let widths = config.widths();
        let n_units = config.blocks_per_group();

        let stem = conv3x3(p.sub("stem"), 3, widths[0], 1);
        let groups = (1..4)
            .map(|idx| {
                WideResNetGroup::new(
                    p.sub(format!("group{idx}")),
                    widths[idx - 1],
                    widths[idx],
                    n_units,
                    if idx == 1 { 1 } else { 2 },
                    config,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        // two stride-2 groups, and pooling keeps the spatial size
        let side = config.input_size as i64 / 4;
        let flat = widths[3] * side * side;

        let classifier = p.sub("classifier");
        let bn = batch_norm(classifier.sub("bn"), widths[3], config);
        let mut fc = nn::linear(
            classifier.sub("fc"),
            flat,
            config.n_classes as i64,
            nn::LinearConfig {
                ws_init: nn::Init::Const(0.),
                bs_init: Some(nn::Init::Const(0.)),
                bias: true,
            },
        );
        he_normal_(&mut fc.ws, flat);

        Ok(Self {
            stem,
            groups,
            bn,
            fc,
            weight_decay: config.weight_decay,
            name: config.name(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn groups(&self) -> &[WideResNetGroup] {
        &self.groups
    }

    fn classify(&self, xs: &Tensor, train: bool) -> Tensor {
        self.pool(xs, train).apply(&self.fc)
    }

    fn pool(&self, xs: &Tensor, train: bool) -> Tensor {
        same_avg_pool2d(&xs.apply_t(&self.bn, train).relu(), POOL_SIZE).flatten(1, -1)
    }

    fn kernels(&self) -> impl Iterator<Item = &Tensor> {
        std::iter::once(&self.stem.ws)
            .chain(self.groups.iter().flat_map(WideResNetGroup::kernels))
            .chain(std::iter::once(&self.fc.ws))
    }

    /// `weight_decay * sum(w^2)` over the stem, residual-unit and dense
    /// kernels. Batch-norm parameters, biases and projection shortcuts are
    /// not penalised.
    pub fn l2_penalty(&self) -> Tensor {
        self.kernels()
            .map(|w| w.square().sum(Kind::Float))
            .reduce(|acc, s| acc + s)
            .unwrap_or_else(|| Tensor::from(0f32))
            * self.weight_decay
    }

    /// Runs `xs` through the network in inference mode and reports the
    /// output shape after every stage.
    pub fn trace(&self, xs: &Tensor) -> Vec<(String, Vec<i64>)> {
        tch::no_grad(|| {
            let mut stages = Vec::with_capacity(self.groups.len() + 3);
            let mut out = xs.apply(&self.stem);
            stages.push(("stem".to_string(), out.size()));

            for (idx, group) in self.groups.iter().enumerate() {
                out = group.forward_t(&out, false);
                stages.push((format!("group{}", idx + 1), out.size()));
            }

            let pooled = self.pool(&out, false);
            stages.push(("classifier.pool".to_string(), pooled.size()));
            stages.push(("classifier.fc".to_string(), pooled.apply(&self.fc).size()));
            stages
        })
    }
}

impl ModuleT for WideResNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut out = xs.apply(&self.stem);
        for group in &self.groups {
            out = group.forward_t(&out, train);
        }
        self.classify(&out, train)
    }
}
