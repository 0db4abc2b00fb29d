//! Levenberg-Marquardt optimizer for non-linear least squares optimization
//!
//! The Levenberg-Marquardt algorithm is a trust-region method that combines
//! the advantages of gradient descent and Gauss-Newton methods. It solves
//! the damped normal equations: (J^T J + λ D) δ = -J^T r, with D the
//! diagonal of J^T J.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use super::LeastSquaresProblem;

/// Errors that can occur during optimization.
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// Residual or jacobian evaluation failed
    #[error("Residual evaluation failed: {0}")]
    Evaluation(String),

    /// Linear system solve failed (singular matrix)
    #[error("Linear system solve failed: {0}")]
    SolveFailed(String),

    /// Numerical instability detected
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),
}

/// Result of an optimization run.
#[derive(Debug, Clone)]
pub struct OptimizerResult {
    /// Optimized parameters
    pub params: DVector<f64>,
    /// Initial cost (sum of squared residuals)
    pub initial_cost: f64,
    /// Final cost (sum of squared residuals)
    pub final_cost: f64,
    /// Number of accepted steps, rejected damping updates are not counted
    pub iterations: usize,
    /// Reason for termination
    pub termination_reason: TerminationReason,
}

impl OptimizerResult {
    /// Whether the optimizer stopped on a convergence criterion.
    pub fn converged(&self) -> bool {
        matches!(
            self.termination_reason,
            TerminationReason::CostConverged
                | TerminationReason::GradientConverged
                | TerminationReason::StepConverged
        )
    }
}

/// Reason why the optimizer terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Converged: cost change below tolerance
    CostConverged,
    /// Converged: gradient norm below tolerance
    GradientConverged,
    /// Converged: parameter step below tolerance
    StepConverged,
    /// Maximum iterations reached
    MaxIterations,
    /// Lambda exceeded maximum (likely numerical issues)
    LambdaMaxExceeded,
}

/// Levenberg-Marquardt optimizer configuration.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    /// Initial damping parameter
    pub lambda_init: f64,
    /// Maximum damping parameter
    pub lambda_max: f64,
    /// Factor for lambda adaptation
    pub lambda_factor: f64,
    /// Maximum number of accepted steps
    pub max_iterations: usize,
    /// Convergence threshold for relative cost change
    pub cost_tolerance: f64,
    /// Convergence threshold for gradient norm
    pub gradient_tolerance: f64,
    /// Convergence threshold for the step norm relative to the parameter norm
    pub step_tolerance: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            lambda_init: 1e-3,
            lambda_max: 1e10,
            lambda_factor: 10.0,
            max_iterations: 50,
            cost_tolerance: 1e-10,
            gradient_tolerance: 1e-10,
            step_tolerance: 1e-12,
        }
    }
}

impl LevenbergMarquardt {
    /// Lower bound applied to the diagonal scaling of the damping term.
    const MIN_DIAGONAL: f64 = 1e-12;

    /// Minimize the problem starting at `x0`.
    pub fn optimize<P: LeastSquaresProblem + ?Sized>(
        &self,
        problem: &P,
        x0: DVector<f64>,
    ) -> Result<OptimizerResult, OptimizerError> {
        let n = problem.num_params();
        let m = problem.num_residuals();

        if n == 0 {
            return Err(OptimizerError::NumericalInstability(
                "Total parameter dimension is zero".to_string(),
            ));
        }
        if m == 0 {
            return Err(OptimizerError::NumericalInstability(
                "No residuals in problem".to_string(),
            ));
        }
        if x0.len() != n {
            return Err(OptimizerError::NumericalInstability(format!(
                "Initial guess has {} parameters, expected {}",
                x0.len(),
                n
            )));
        }

        let mut x = x0;
        let mut residuals = DVector::<f64>::zeros(m);
        let mut jac = DMatrix::<f64>::zeros(m, n);

        problem.residuals(&x, &mut residuals)?;
        let initial_cost = residuals.norm_squared();
        if !initial_cost.is_finite() {
            return Err(OptimizerError::NumericalInstability(
                "Initial cost is not finite".to_string(),
            ));
        }

        let mut current_cost = initial_cost;
        let mut lambda = self.lambda_init;
        let mut iterations = 0;
        let mut candidate_residuals = DVector::<f64>::zeros(m);

        // Build normal equations: J^T J and J^T r
        problem.jacobian(&x, &mut jac)?;
        let mut jtj = jac.tr_mul(&jac);
        let mut jtr = jac.tr_mul(&residuals);

        let finish = |x: DVector<f64>,
                      cost: f64,
                      iterations: usize,
                      reason: TerminationReason|
         -> Result<OptimizerResult, OptimizerError> {
            log::debug!(
                "lm: {:?} after {} iterations, cost {:.6e} -> {:.6e}",
                reason,
                iterations,
                initial_cost,
                cost
            );
            Ok(OptimizerResult {
                params: x,
                initial_cost,
                final_cost: cost,
                iterations,
                termination_reason: reason,
            })
        };

        loop {
            if iterations >= self.max_iterations {
                return finish(x, current_cost, iterations, TerminationReason::MaxIterations);
            }

            // Check gradient convergence
            if jtr.norm() < self.gradient_tolerance {
                return finish(x, current_cost, iterations, TerminationReason::GradientConverged);
            }

            let delta = self.solve_damped_system(&jtj, &jtr, lambda)?;

            if delta.norm() < self.step_tolerance * (x.norm() + self.step_tolerance) {
                return finish(x, current_cost, iterations, TerminationReason::StepConverged);
            }

            let candidate = &x + &delta;
            problem.residuals(&candidate, &mut candidate_residuals)?;
            let new_cost = candidate_residuals.norm_squared();

            if new_cost.is_finite() && new_cost < current_cost {
                iterations += 1;
                // Step improved cost: accept it and decrease lambda
                let relative_cost_change =
                    (current_cost - new_cost) / current_cost.max(f64::MIN_POSITIVE);

                x = candidate;
                std::mem::swap(&mut residuals, &mut candidate_residuals);
                current_cost = new_cost;
                lambda = (lambda / self.lambda_factor).max(1e-15);

                log::trace!(
                    "lm: iteration {} cost {:.6e} lambda {:.3e}",
                    iterations,
                    current_cost,
                    lambda
                );

                if relative_cost_change < self.cost_tolerance {
                    return finish(x, current_cost, iterations, TerminationReason::CostConverged);
                }

                problem.jacobian(&x, &mut jac)?;
                jtj = jac.tr_mul(&jac);
                jtr = jac.tr_mul(&residuals);
            } else {
                // Step increased cost: reject it and increase lambda
                lambda *= self.lambda_factor;
                if lambda > self.lambda_max {
                    return finish(x, current_cost, iterations, TerminationReason::LambdaMaxExceeded);
                }
            }
        }
    }

    /// Solve the damped system (J^T J + λ D) δ = -J^T r.
    fn solve_damped_system(
        &self,
        jtj: &DMatrix<f64>,
        jtr: &DVector<f64>,
        lambda: f64,
    ) -> Result<DVector<f64>, OptimizerError> {
        let mut h = jtj.clone();
        for i in 0..h.nrows() {
            h[(i, i)] += lambda * jtj[(i, i)].max(Self::MIN_DIAGONAL);
        }

        let rhs = -jtr;
        if let Some(chol) = h.clone().cholesky() {
            return Ok(chol.solve(&rhs));
        }

        h.lu()
            .solve(&rhs)
            .ok_or_else(|| OptimizerError::SolveFailed("LU solve failed".to_string()))
    }
}
