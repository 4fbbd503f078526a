mod chained;
mod constant;
mod error;
mod param_gen;
mod random;

use std::{cell::RefCell, rc::Rc};

use comms::specs::{
    host::InitSpec,
    server::{DistributionSpec, ParamGenSpec},
};
use rand::{SeedableRng, rngs::StdRng};

pub use chained::ChainedParamGen;
pub use constant::ConstParamGen;
pub use error::{InitErr, Result};
pub use param_gen::ParamGen;
pub use random::RandParamGen;

/// Generates the initial values of a host's variables.
///
/// # Arguments
/// * `spec` - One generator spec per variable, in storage order.
/// * `nparams` - The amount of parameters the host stores.
///
/// # Returns
/// The flat initial values, or an `InitErr` if a distribution is invalid or the
/// specs don't produce exactly `nparams` values.
pub fn generate(spec: &InitSpec, nparams: usize) -> Result<Vec<f32>> {
    let rng = match spec.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let rng = Rc::new(RefCell::new(rng));

    let param_gens = spec
        .variables
        .iter()
        .map(|var| resolve(var, &rng))
        .collect::<Result<Vec<_>>>()?;

    let mut param_gen = ChainedParamGen::new(param_gens);
    let mut values = Vec::with_capacity(nparams);

    while let Some(sample) = param_gen.sample(nparams.max(1)) {
        values.extend(sample);
    }

    if values.len() != nparams {
        return Err(InitErr::LengthMismatch {
            got: values.len(),
            expected: nparams,
        });
    }

    Ok(values)
}

/// Builds a boxed `ParamGen` from its specification.
///
/// # Arguments
/// * `spec` - The specification of the parameter generator.
/// * `rng` - The random number generator shared by every random generator.
///
/// # Returns
/// The parameter generator or an `InitErr` if the distribution parameters are invalid.
fn resolve(spec: &ParamGenSpec, rng: &Rc<RefCell<StdRng>>) -> Result<Box<dyn ParamGen>> {
    let param_gen: Box<dyn ParamGen> = match *spec {
        ParamGenSpec::Const { value, limit } => Box::new(ConstParamGen::new(value, limit)),
        ParamGenSpec::Rand {
            distribution,
            limit,
        } => {
            let rng = Rc::clone(rng);

            match distribution {
                DistributionSpec::Uniform { low, high } => {
                    Box::new(RandParamGen::uniform(rng, limit, low, high)?)
                }
                DistributionSpec::XavierUniform { fan_in, fan_out } => {
                    Box::new(RandParamGen::xavier_uniform(rng, limit, fan_in, fan_out)?)
                }
                DistributionSpec::Normal { mean, std_dev } => {
                    Box::new(RandParamGen::normal(rng, limit, mean, std_dev)?)
                }
                DistributionSpec::Kaiming { fan_in } => {
                    Box::new(RandParamGen::kaiming(rng, limit, fan_in)?)
                }
            }
        }
        ParamGenSpec::Chained { ref specs } => {
            let param_gens = specs
                .iter()
                .map(|spec| resolve(spec, rng))
                .collect::<Result<Vec<_>>>()?;

            Box::new(ChainedParamGen::new(param_gens))
        }
    };

    Ok(param_gen)
}
