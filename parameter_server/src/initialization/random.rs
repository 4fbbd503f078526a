use std::{cell::RefCell, rc::Rc};

use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use super::{InitErr, ParamGen, Result};

/// A parameter generator that samples from a probabilistic distribution.
///
/// The rng is shared so that every variable of a host draws from the same seeded stream.
pub struct RandParamGen<R: Rng, D: Distribution<f32>> {
    rng: Rc<RefCell<R>>,
    distribution: D,
    remaining: usize,
}

impl<R: Rng, D: Distribution<f32>> RandParamGen<R, D> {
    /// Creates a new `RandParamGen` parameter generator.
    ///
    /// # Arguments
    /// * `rng` - The shared random number generator.
    /// * `distribution` - The distribution to sample from.
    /// * `limit` - The maximum amount of values to generate.
    pub fn new(rng: Rc<RefCell<R>>, distribution: D, limit: usize) -> Self {
        Self {
            rng,
            distribution,
            remaining: limit,
        }
    }
}

impl<R: Rng> RandParamGen<R, Uniform<f32>> {
    /// Creates a new generator over the uniform range `[low, high)`.
    ///
    /// # Returns
    /// An error if the range is empty or not finite.
    pub fn uniform(rng: Rc<RefCell<R>>, limit: usize, low: f32, high: f32) -> Result<Self> {
        Ok(Self::new(rng, Uniform::new(low, high)?, limit))
    }

    /// Creates a new generator using Xavier uniform initialization.
    ///
    /// # Arguments
    /// * `rng` - The shared random number generator.
    /// * `limit` - The maximum amount of values to generate.
    /// * `fan_in` - The number of input units of the variable.
    /// * `fan_out` - The number of output units of the variable.
    ///
    /// # Returns
    /// An error if the resulting range is invalid.
    pub fn xavier_uniform(
        rng: Rc<RefCell<R>>,
        limit: usize,
        fan_in: usize,
        fan_out: usize,
    ) -> Result<Self> {
        let range = (6. / (fan_in + fan_out) as f32).sqrt();
        Self::uniform(rng, limit, -range, range)
    }
}

impl<R: Rng> RandParamGen<R, Normal<f32>> {
    /// Creates a new generator over a normal distribution.
    ///
    /// # Returns
    /// An error if `std_dev` is negative or not finite.
    pub fn normal(rng: Rc<RefCell<R>>, limit: usize, mean: f32, std_dev: f32) -> Result<Self> {
        if !std_dev.is_finite() || std_dev < 0. {
            return Err(InitErr::Distribution(format!(
                "std_dev must be finite and non negative, got {std_dev}"
            )));
        }

        Ok(Self::new(rng, Normal::new(mean, std_dev)?, limit))
    }

    /// Creates a new generator using Kaiming normal initialization.
    pub fn kaiming(rng: Rc<RefCell<R>>, limit: usize, fan_in: usize) -> Result<Self> {
        let std_dev = (2. / fan_in as f32).sqrt();
        Self::normal(rng, limit, 0., std_dev)
    }
}

impl<R: Rng, D: Distribution<f32>> ParamGen for RandParamGen<R, D> {
    fn sample(&mut self, n: usize) -> Option<Vec<f32>> {
        if self.remaining == 0 || n == 0 {
            return None;
        }

        let n = n.min(self.remaining);
        self.remaining -= n;

        let mut rng = self.rng.borrow_mut();
        let sample = (0..n).map(|_| self.distribution.sample(&mut *rng)).collect();
        Some(sample)
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn seeded_rng() -> Rc<RefCell<StdRng>> {
        Rc::new(RefCell::new(StdRng::seed_from_u64(42)))
    }

    #[test]
    fn uniform_samples_stay_in_range() {
        let mut param_gen = RandParamGen::uniform(seeded_rng(), 64, -0.5, 0.5).unwrap();
        let sample = param_gen.sample(64).unwrap();

        assert_eq!(sample.len(), 64);
        assert!(sample.iter().all(|v| (-0.5..0.5).contains(v)));
        assert!(param_gen.sample(1).is_none());
    }

    #[test]
    fn xavier_bounds_follow_the_fans() {
        let mut param_gen = RandParamGen::xavier_uniform(seeded_rng(), 32, 2, 4).unwrap();
        let bound = 1.;

        assert!(param_gen.sample(32).unwrap().iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn negative_std_dev_is_rejected() {
        for std_dev in [-1., f32::NAN, f32::INFINITY] {
            assert!(matches!(
                RandParamGen::normal(seeded_rng(), 1, 0., std_dev),
                Err(InitErr::Distribution(_))
            ));
        }
    }

    #[test]
    fn zero_std_dev_yields_the_mean() {
        let mut param_gen = RandParamGen::normal(seeded_rng(), 4, 0.5, 0.).unwrap();
        assert_eq!(param_gen.sample(4).unwrap(), vec![0.5; 4]);
    }
}
