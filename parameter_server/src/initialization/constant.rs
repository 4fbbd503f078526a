use super::ParamGen;

/// Fills `limit` values with the same constant, like a zeroed bias.
pub struct ConstParamGen {
    value: f32,
    remaining: usize,
}

impl ConstParamGen {
    pub fn new(value: f32, limit: usize) -> Self {
        Self {
            value,
            remaining: limit,
        }
    }
}

impl ParamGen for ConstParamGen {
    fn sample(&mut self, n: usize) -> Option<Vec<f32>> {
        let take = n.min(self.remaining);
        if take == 0 {
            return None;
        }

        self.remaining -= take;
        Some(vec![self.value; take])
    }
}
