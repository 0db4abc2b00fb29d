//! Dense non-linear least squares.
//!
//! Problems expose a residual vector over a flat parameter vector through
//! [`LeastSquaresProblem`] and are minimized with [`LevenbergMarquardt`].

mod levenberg_marquardt;
pub use levenberg_marquardt::*;

use nalgebra::{DMatrix, DVector};

/// Relative step used for the central difference jacobian.
const JACOBIAN_STEP: f64 = 1e-6;

/// A non-linear least squares problem `min_x 0.5 * ||r(x)||^2`.
pub trait LeastSquaresProblem {
    /// Number of parameters.
    fn num_params(&self) -> usize;

    /// Number of residuals.
    fn num_residuals(&self) -> usize;

    /// Evaluate the residual vector at `params` into `out`.
    fn residuals(&self, params: &DVector<f64>, out: &mut DVector<f64>)
        -> Result<(), OptimizerError>;

    /// Evaluate the jacobian of the residuals at `params` into `jac`.
    ///
    /// Defaults to central differences over every parameter.
    fn jacobian(&self, params: &DVector<f64>, jac: &mut DMatrix<f64>) -> Result<(), OptimizerError> {
        numerical_jacobian(self, params, jac)
    }
}

/// Step size for the central difference of a single parameter.
#[inline]
pub fn jacobian_step(value: f64) -> f64 {
    JACOBIAN_STEP * value.abs().max(1.0)
}

/// Central difference jacobian of `problem` at `params`.
pub fn numerical_jacobian<P: LeastSquaresProblem + ?Sized>(
    problem: &P,
    params: &DVector<f64>,
    jac: &mut DMatrix<f64>,
) -> Result<(), OptimizerError> {
    let m = problem.num_residuals();
    let mut x = params.clone();
    let mut r_plus = DVector::<f64>::zeros(m);
    let mut r_minus = DVector::<f64>::zeros(m);

    for j in 0..params.len() {
        let h = jacobian_step(params[j]);

        x[j] = params[j] + h;
        problem.residuals(&x, &mut r_plus)?;
        x[j] = params[j] - h;
        problem.residuals(&x, &mut r_minus)?;
        x[j] = params[j];

        let inv_2h = 1.0 / (2.0 * h);
        for i in 0..m {
            jac[(i, j)] = (r_plus[i] - r_minus[i]) * inv_2h;
        }
    }

    Ok(())
}
