use std::fmt::Display;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use chainresolve::{
    fit::ParameterType, LeastSquares, LinearCombinationFitter, NonNegativeLeastSquares,
};

/// A fitter that can be shared by every worker thread
pub type BoxedFitter = Box<dyn LinearCombinationFitter + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverChoice {
    /// Non-negative least squares
    #[default]
    Nnls,
    /// Unconstrained least squares, parameters may be negative
    Lstsq,
}

impl Display for SolverChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolverChoice::Nnls => f.write_str("nnls"),
            SolverChoice::Lstsq => f.write_str("lstsq"),
        }
    }
}

impl SolverChoice {
    pub fn make_fitter(&self, nnls: NonNegativeLeastSquares) -> BoxedFitter {
        match self {
            SolverChoice::Nnls => Box::new(nnls),
            SolverChoice::Lstsq => Box::new(LeastSquares::default()),
        }
    }
}

/// Values read from configuration files and the environment. Anything given on the
/// command line wins over these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub relative_chain_cutoff: Option<ParameterType>,
    pub debug: Option<bool>,
    pub max_rounds: Option<usize>,
    pub threads: Option<i32>,
    pub write_buffer_size: Option<usize>,
    pub solver: Option<SolverChoice>,
    pub nnls: Option<NonNegativeLeastSquares>,
}

pub(crate) fn unit_interval_float(s: &str) -> Result<ParameterType, String> {
    let value = s.parse::<ParameterType>().map_err(|e| e.to_string())?;
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(value)
    } else {
        Err(format!("`{s}` must be in (0, 1]"))
    }
}
