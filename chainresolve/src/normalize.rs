//! Conversion of fitted parameters into relative intensities
use std::collections::BTreeMap;

use nalgebra::DVector;

use crate::combination::{ChainCombination, CombinationId};
use crate::fit::ParameterType;
use crate::resolve_traits::ResolutionError;

/// Divide each combination's parameter by the sum of all of them.
///
/// `parameters` must be in the same order as `combinations`. Fails if the sum is not
/// strictly positive, as happens when every parameter collapsed to zero.
pub fn normalize_parameters(
    combinations: &[ChainCombination],
    parameters: &DVector<ParameterType>,
) -> Result<BTreeMap<CombinationId, ParameterType>, ResolutionError> {
    let total: ParameterType = parameters.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(ResolutionError::DegenerateNormalization { total });
    }
    Ok(combinations
        .iter()
        .zip(parameters.iter())
        .map(|(c, x)| (c.id.clone(), *x / total))
        .collect())
}
