//! Random affine augmentation of image batches.
//!
//! Each image gets its own rotation, shift and optional flip. Parameters are
//! drawn on the host from a seeded generator; the warp itself runs on the
//! batch's device through `affine_grid_generator` and `grid_sampler`, with
//! out-of-frame pixels filled from the nearest border pixel.

use rand::{rngs::StdRng, Rng, SeedableRng};
use tch::Tensor;

use crate::{config::AugmentationConfig, error::Result};

const BILINEAR: i64 = 0;
const BORDER: i64 = 1;

/// Parameters of one image's random transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    pub angle_deg: f64,
    /// Horizontal shift as a fraction of the width.
    pub shift_x: f64,
    /// Vertical shift as a fraction of the height.
    pub shift_y: f64,
    pub flip: bool,
}

impl AffineParams {
    pub const IDENTITY: Self = Self {
        angle_deg: 0.,
        shift_x: 0.,
        shift_y: 0.,
        flip: false,
    };

    /// Row-major 2x3 matrix mapping normalized output coordinates in
    /// `[-1, 1]` to the input coordinates they are sampled from.
    pub fn theta(&self) -> [f32; 6] {
        let (sin, cos) = self.angle_deg.to_radians().sin_cos();
        let f = if self.flip { -1. } else { 1. };
        // a shift of the whole width spans 2 normalized units
        [
            (cos * f) as f32,
            (-sin) as f32,
            (2. * self.shift_x) as f32,
            (sin * f) as f32,
            cos as f32,
            (2. * self.shift_y) as f32,
        ]
    }
}

pub struct Augmenter {
    config: AugmentationConfig,
    rng: StdRng,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn sample(&mut self) -> AffineParams {
        let c = &self.config;
        AffineParams {
            angle_deg: self.rng.random_range(-c.rotation_range..=c.rotation_range),
            shift_x: self
                .rng
                .random_range(-c.width_shift_range..=c.width_shift_range),
            shift_y: self
                .rng
                .random_range(-c.height_shift_range..=c.height_shift_range),
            flip: c.horizontal_flip && self.rng.random_bool(0.5),
        }
    }

    /// Warps every image of an `[N, C, H, W]` batch with freshly sampled
    /// parameters.
    pub fn apply(&mut self, images: &Tensor) -> Result<Tensor> {
        let (n, _, _, _) = images.size4()?;
        let params: Vec<AffineParams> = (0..n).map(|_| self.sample()).collect();
        warp(images, &params)
    }
}

/// Applies one transform per image of an `[N, C, H, W]` batch.
pub fn warp(images: &Tensor, params: &[AffineParams]) -> Result<Tensor> {
    let (n, _, _, _) = images.size4()?;
    if n == 0 {
        return Ok(images.shallow_clone());
    }

    let theta: Vec<f32> = params.iter().flat_map(AffineParams::theta).collect();
    let theta = Tensor::from_slice(&theta)
        .view([params.len() as i64, 2, 3])
        .to_kind(images.kind())
        .to_device(images.device());

    let grid = Tensor::f_affine_grid_generator(&theta, images.size().as_slice(), false)?;
    Ok(Tensor::f_grid_sampler(images, &grid, BILINEAR, BORDER, false)?)
}

#[cfg(test)]
mod test {
    use tch::{Device, Kind};

    use super::*;

    #[test]
    fn identity_warp_is_a_no_op() {
        let images = Tensor::randn([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let out = warp(&images, &[AffineParams::IDENTITY; 2]).unwrap();
        assert!(out.allclose(&images, 1e-5, 1e-5, false));
    }

    #[test]
    fn flip_mirrors_columns() {
        let images = Tensor::arange(16, (Kind::Float, Device::Cpu)).view([1, 1, 4, 4]);
        let params = AffineParams {
            flip: true,
            ..AffineParams::IDENTITY
        };
        let out = warp(&images, &[params]).unwrap();
        assert!(out.allclose(&images.flip([3]), 1e-5, 1e-5, false));
    }

    #[test]
    fn shift_moves_whole_pixels_and_fills_from_border() {
        // every row is 0, 1, 2, 3
        let ramp = Tensor::arange(4, (Kind::Float, Device::Cpu))
            .view([1, 1, 1, 4])
            .expand([1, 1, 4, 4], false)
            .contiguous();

        // a quarter of the width is one pixel on a 4-wide image
        let params = AffineParams {
            shift_x: 0.25,
            ..AffineParams::IDENTITY
        };
        let out = warp(&ramp, &[params]).unwrap();
        let expected = Tensor::from_slice(&[1f32, 2., 3., 3.])
            .view([1, 1, 1, 4])
            .expand([1, 1, 4, 4], false);
        assert!(out.allclose(&expected, 1e-5, 1e-5, false), "{out}");

        let params = AffineParams {
            shift_x: -0.5,
            ..AffineParams::IDENTITY
        };
        let out = warp(&ramp, &[params]).unwrap();
        let expected = Tensor::from_slice(&[0f32, 0., 0., 1.])
            .view([1, 1, 1, 4])
            .expand([1, 1, 4, 4], false);
        assert!(out.allclose(&expected, 1e-5, 1e-5, false), "{out}");
    }

    #[test]
    fn vertical_shift_moves_rows() {
        let ramp = Tensor::arange(4, (Kind::Float, Device::Cpu))
            .view([1, 1, 4, 1])
            .expand([1, 1, 4, 4], false)
            .contiguous();
        let params = AffineParams {
            shift_y: 0.25,
            ..AffineParams::IDENTITY
        };
        let out = warp(&ramp, &[params]).unwrap();
        let expected = Tensor::from_slice(&[1f32, 2., 3., 3.])
            .view([1, 1, 4, 1])
            .expand([1, 1, 4, 4], false);
        assert!(out.allclose(&expected, 1e-5, 1e-5, false), "{out}");
    }

    #[test]
    fn samples_stay_in_range() {
        let config = AugmentationConfig::default();
        let mut augmenter = Augmenter::new(config.clone(), 7);
        for _ in 0..1000 {
            let p = augmenter.sample();
            assert!(p.angle_deg.abs() <= config.rotation_range);
            assert!(p.shift_x.abs() <= config.width_shift_range);
            assert!(p.shift_y.abs() <= config.height_shift_range);
            assert!(!p.flip);
        }
    }

    #[test]
    fn same_seed_same_parameters() {
        let mut a = Augmenter::new(AugmentationConfig::default(), 42);
        let mut b = Augmenter::new(AugmentationConfig::default(), 42);
        for _ in 0..16 {
            assert_eq!(a.sample(), b.sample());
        }
    }

    #[test]
    fn zero_ranges_give_identity() {
        let config = AugmentationConfig {
            rotation_range: 0.,
            width_shift_range: 0.,
            height_shift_range: 0.,
            ..Default::default()
        };
        let mut augmenter = Augmenter::new(config, 0);
        assert_eq!(augmenter.sample(), AffineParams::IDENTITY);

        let images = Tensor::rand([4, 3, 32, 32], (Kind::Float, Device::Cpu));
        let out = augmenter.apply(&images).unwrap();
        assert_eq!(out.size(), images.size());
        assert!(out.allclose(&images, 1e-5, 1e-5, false));
    }

    #[test]
    fn theta_of_quarter_turn() {
        let theta = AffineParams {
            angle_deg: 90.,
            ..AffineParams::IDENTITY
        }
        .theta();
        approx::assert_abs_diff_eq!(theta[0], 0., epsilon = 1e-6);
        approx::assert_abs_diff_eq!(theta[1], -1., epsilon = 1e-6);
        approx::assert_abs_diff_eq!(theta[3], 1., epsilon = 1e-6);
    }
}
