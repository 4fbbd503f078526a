use super::ParamGen;

/// Delegates generation to a sequence of generators, one after the other.
///
/// Each variable gets its own generator; chaining them yields the flat parameter vector of a host.
pub struct ChainedParamGen {
    param_gens: Vec<Box<dyn ParamGen>>,
    curr: usize,
}

impl ChainedParamGen {
    /// Creates a new `ChainedParamGen` parameter generator.
    ///
    /// # Arguments
    /// * `param_gens` - The generators to drain, in order.
    pub fn new(param_gens: Vec<Box<dyn ParamGen>>) -> Self {
        Self {
            param_gens,
            curr: 0,
        }
    }
}

impl ParamGen for ChainedParamGen {
    fn sample(&mut self, n: usize) -> Option<Vec<f32>> {
        let mut sample = Vec::with_capacity(n);

        while sample.len() < n && self.curr < self.param_gens.len() {
            match self.param_gens[self.curr].sample(n - sample.len()) {
                Some(values) => sample.extend(values),
                None => self.curr += 1,
            }
        }

        (!sample.is_empty()).then_some(sample)
    }
}
