/*! Linear least squares fitting of chain combinations to aggregated chain intensities */
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

pub type ParameterType = f64;

/// An error signalling that a linear combination fit could not produce a usable solution
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("The solver did not converge after {iterations} iterations")]
    NotConverged { iterations: usize },
    #[error("The design matrix has {rows} rows but the observation vector has {observations} entries")]
    DimensionMismatch { rows: usize, observations: usize },
    #[error("The design matrix has no columns to fit")]
    EmptyProblem,
    #[error("The solver produced a non-finite parameter at column {0}")]
    NonFinite(usize),
    #[error("The solver returned {returned} parameters for {expected} columns")]
    WrongParameterCount { expected: usize, returned: usize },
    #[error("Failed to decompose the design matrix: {0}")]
    Decomposition(String),
}

/// A strategy for solving `design · x ≈ observed` in the least squares sense.
///
/// Implementations must report failure rather than return zeros or NaNs when they
/// cannot produce a solution.
pub trait LinearCombinationFitter {
    fn fit(
        &self,
        design: &DMatrix<ParameterType>,
        observed: &DVector<ParameterType>,
    ) -> Result<DVector<ParameterType>, FitError>;
}

impl<F: LinearCombinationFitter + ?Sized> LinearCombinationFitter for &F {
    fn fit(
        &self,
        design: &DMatrix<ParameterType>,
        observed: &DVector<ParameterType>,
    ) -> Result<DVector<ParameterType>, FitError> {
        (**self).fit(design, observed)
    }
}

impl<F: LinearCombinationFitter + ?Sized> LinearCombinationFitter for Box<F> {
    fn fit(
        &self,
        design: &DMatrix<ParameterType>,
        observed: &DVector<ParameterType>,
    ) -> Result<DVector<ParameterType>, FitError> {
        (**self).fit(design, observed)
    }
}

fn check_dimensions(
    design: &DMatrix<ParameterType>,
    observed: &DVector<ParameterType>,
) -> Result<(), FitError> {
    if design.ncols() == 0 {
        return Err(FitError::EmptyProblem);
    }
    if design.nrows() != observed.len() {
        return Err(FitError::DimensionMismatch {
            rows: design.nrows(),
            observations: observed.len(),
        });
    }
    Ok(())
}

/// Check that `parameters` has one finite entry per design column
pub fn validate_parameters(
    parameters: &DVector<ParameterType>,
    columns: usize,
) -> Result<(), FitError> {
    if parameters.len() != columns {
        return Err(FitError::WrongParameterCount {
            expected: columns,
            returned: parameters.len(),
        });
    }
    match parameters.iter().position(|x| !x.is_finite()) {
        Some(i) => Err(FitError::NonFinite(i)),
        None => Ok(()),
    }
}

fn solve_svd(
    design: DMatrix<ParameterType>,
    observed: &DVector<ParameterType>,
    eps: ParameterType,
) -> Result<DVector<ParameterType>, FitError> {
    design
        .svd(true, true)
        .solve(observed, eps)
        .map_err(|e| FitError::Decomposition(e.to_string()))
}

/// The unconstrained minimum-norm least squares solution via singular value decomposition.
///
/// Parameters may come out negative.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LeastSquares {
    /// Singular values below this are treated as zero
    pub eps: ParameterType,
}

impl Default for LeastSquares {
    fn default() -> Self {
        Self { eps: 1e-12 }
    }
}

impl LinearCombinationFitter for LeastSquares {
    fn fit(
        &self,
        design: &DMatrix<ParameterType>,
        observed: &DVector<ParameterType>,
    ) -> Result<DVector<ParameterType>, FitError> {
        check_dimensions(design, observed)?;
        let x = solve_svd(design.clone(), observed, self.eps)?;
        validate_parameters(&x, design.ncols())?;
        Ok(x)
    }
}

/// Lawson and Hanson's active set algorithm for non-negative least squares[^1].
///
/// Columns move from the active (clamped to zero) set into the passive set one at a time
/// while the gradient shows they would reduce the residual; the passive subproblem is solved
/// without constraints and any parameter driven non-positive is interpolated back to zero.
///
/// # References
/// [^1]: Lawson, C. L., & Hanson, R. J. (1995). Solving Least Squares Problems.
///       Society for Industrial and Applied Mathematics. <https://doi.org/10.1137/1.9781611971217>
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct NonNegativeLeastSquares {
    /// The gradient and parameter tolerance
    pub tolerance: ParameterType,
    /// The most iterations to run before giving up. When `None`, `max(3n, 50)` for `n` columns.
    pub max_iterations: Option<usize>,
}

impl Default for NonNegativeLeastSquares {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_iterations: None,
        }
    }
}

impl NonNegativeLeastSquares {
    pub fn new(tolerance: ParameterType, max_iterations: Option<usize>) -> Self {
        Self {
            tolerance,
            max_iterations,
        }
    }

    fn solve_passive(
        &self,
        design: &DMatrix<ParameterType>,
        observed: &DVector<ParameterType>,
        passive: &[bool],
    ) -> Result<DVector<ParameterType>, FitError> {
        let columns: Vec<usize> = passive
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.then_some(i))
            .collect();
        let sub = design.select_columns(columns.iter());
        let z_sub = solve_svd(sub, observed, self.tolerance)?;
        let mut z = DVector::zeros(design.ncols());
        for (k, i) in columns.iter().enumerate() {
            z[*i] = z_sub[k];
        }
        Ok(z)
    }
}

fn passive_amax(values: &DVector<ParameterType>, passive: &[bool]) -> ParameterType {
    values
        .iter()
        .zip(passive)
        .filter(|(_, p)| **p)
        .fold(0.0, |acc, (v, _)| acc.max(v.abs()))
}

impl LinearCombinationFitter for NonNegativeLeastSquares {
    fn fit(
        &self,
        design: &DMatrix<ParameterType>,
        observed: &DVector<ParameterType>,
    ) -> Result<DVector<ParameterType>, FitError> {
        check_dimensions(design, observed)?;
        let n = design.ncols();
        let max_iterations = self.max_iterations.unwrap_or_else(|| (3 * n).max(50));
        let tol = self.tolerance;
        // Both tolerances scale with the magnitude of the problem
        let gradient_tol = tol
            * design.amax()
            * observed.amax()
            * design.nrows().max(n) as ParameterType;

        let mut x: DVector<ParameterType> = DVector::zeros(n);
        let mut passive = vec![false; n];
        let mut iterations = 0usize;

        loop {
            let gradient = design.tr_mul(&(observed - design * &x));
            let candidate = (0..n)
                .filter(|i| !passive[*i] && gradient[*i] > gradient_tol)
                .max_by(|a, b| gradient[*a].total_cmp(&gradient[*b]));
            let Some(entering) = candidate else {
                break;
            };
            passive[entering] = true;

            while passive.iter().any(|p| *p) {
                iterations += 1;
                if iterations > max_iterations {
                    return Err(FitError::NotConverged { iterations });
                }
                let z = self.solve_passive(design, observed, &passive)?;
                let z_floor = tol * passive_amax(&z, &passive);
                let feasible = (0..n).filter(|i| passive[*i]).all(|i| z[i] > z_floor);
                if feasible {
                    x = z;
                    break;
                }
                let alpha = (0..n)
                    .filter(|i| passive[*i] && z[*i] <= z_floor && x[*i] > z[*i])
                    .map(|i| x[i] / (x[i] - z[i]))
                    .fold(ParameterType::INFINITY, ParameterType::min);
                let alpha = if alpha.is_finite() { alpha } else { 0.0 };
                let step = (&z - &x) * alpha;
                x += step;
                let x_floor = tol * passive_amax(&x, &passive);
                for i in 0..n {
                    if passive[i] && x[i] <= x_floor {
                        passive[i] = false;
                        x[i] = 0.0;
                    }
                }
            }
        }
        validate_parameters(&x, n)?;
        Ok(x)
    }
}
