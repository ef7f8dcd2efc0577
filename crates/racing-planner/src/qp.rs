//! Box-constrained QP subproblem
//!
//! ```text
//! minimize    ½ dᵀ H d + gᵀ d
//! subject to  l ≤ d ≤ u
//! ```
//!
//! Solved with a projected Newton method: variables at a bound whose
//! gradient pushes outward are fixed, a Newton step is taken on the
//! remaining free set (Cholesky of the reduced Hessian), and the step is
//! projected back onto the box with a backtracking line search.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Armijo sufficient-decrease constant
const ARMIJO: f64 = 1e-4;
/// Maximum step halvings per iteration
const MAX_BACKTRACKS: usize = 30;
/// Bound activity tolerance
const ACTIVE_EPS: f64 = 1e-12;

/// QP errors
#[derive(Debug, Error, PartialEq)]
pub enum QpError {
    #[error("Dimension mismatch: Hessian is {rows}x{cols}, vectors have length {len}")]
    DimensionMismatch { rows: usize, cols: usize, len: usize },
    #[error("Reduced Hessian is not positive definite")]
    NotPositiveDefinite,
    #[error("Lower bound exceeds upper bound at index {0}")]
    InvertedBounds(usize),
}

/// Iteration limits
#[derive(Debug, Clone, Copy)]
pub struct QpOptions {
    pub max_iterations: usize,
    /// Projected-gradient tolerance (infinity norm)
    pub tolerance: f64,
}

/// QP solution
#[derive(Debug, Clone)]
pub struct QpSolution {
    pub x: DVector<f64>,
    pub iterations: usize,
    pub converged: bool,
    pub objective: f64,
}

/// Box-constrained convex QP
pub struct BoxQp<'a> {
    pub hessian: &'a DMatrix<f64>,
    pub gradient: &'a DVector<f64>,
    pub lower: &'a DVector<f64>,
    pub upper: &'a DVector<f64>,
}

impl<'a> BoxQp<'a> {
    fn objective(&self, x: &DVector<f64>) -> f64 {
        0.5 * x.dot(&(self.hessian * x)) + self.gradient.dot(x)
    }

    fn project(&self, x: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            x.len(),
            x.iter()
                .zip(self.lower.iter().zip(self.upper.iter()))
                .map(|(v, (l, u))| v.clamp(*l, *u)),
        )
    }

    fn check(&self) -> Result<(), QpError> {
        let n = self.gradient.len();
        let (rows, cols) = self.hessian.shape();
        if rows != n || cols != n || self.lower.len() != n || self.upper.len() != n {
            return Err(QpError::DimensionMismatch { rows, cols, len: n });
        }
        if let Some(i) = (0..n).find(|&i| self.lower[i] > self.upper[i]) {
            return Err(QpError::InvertedBounds(i));
        }
        Ok(())
    }

    /// Projected gradient norm: |x − P(x − ∇q)|∞
    fn stationarity(&self, x: &DVector<f64>, grad: &DVector<f64>) -> f64 {
        (x - self.project(&(x - grad))).amax()
    }

    /// Solve from the projection of `start` (zero when absent)
    pub fn solve(&self, start: Option<&DVector<f64>>, options: &QpOptions) -> Result<QpSolution, QpError> {
        self.check()?;
        let n = self.gradient.len();
        let mut x = match start {
            Some(s) if s.len() == n => self.project(s),
            _ => self.project(&DVector::zeros(n)),
        };
        let mut objective = self.objective(&x);
        let mut iterations = 0;
        let mut converged = false;
        let mut stalled = false;

        while iterations < options.max_iterations {
            let grad = self.hessian * &x + self.gradient;

            if self.stationarity(&x, &grad) <= options.tolerance {
                converged = true;
                break;
            }
            iterations += 1;

            let free: Vec<usize> = (0..n)
                .filter(|&i| {
                    let at_lower = x[i] <= self.lower[i] + ACTIVE_EPS && grad[i] > 0.0;
                    let at_upper = x[i] >= self.upper[i] - ACTIVE_EPS && grad[i] < 0.0;
                    !(at_lower || at_upper)
                })
                .collect();

            let mut direction = DVector::zeros(n);
            if free.is_empty() {
                direction -= &grad;
            } else {
                let reduced = DMatrix::from_fn(free.len(), free.len(), |r, c| self.hessian[(free[r], free[c])]);
                let rhs = DVector::from_iterator(free.len(), free.iter().map(|&i| -grad[i]));
                let chol = reduced.cholesky().ok_or(QpError::NotPositiveDefinite)?;
                let step = chol.solve(&rhs);
                for (k, &i) in free.iter().enumerate() {
                    direction[i] = step[k];
                }
            }

            // Projected backtracking
            let mut alpha = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_BACKTRACKS {
                let candidate = self.project(&(&x + &direction * alpha));
                let value = self.objective(&candidate);
                if value <= objective + ARMIJO * grad.dot(&(&candidate - &x)) {
                    accepted = Some((candidate, value));
                    break;
                }
                alpha *= 0.5;
            }
            match accepted {
                Some((candidate, value)) => {
                    x = candidate;
                    objective = value;
                }
                // No further decrease possible at this precision
                None => {
                    stalled = true;
                    break;
                }
            }
        }

        if !converged {
            let grad = self.hessian * &x + self.gradient;
            let stationarity = self.stationarity(&x, &grad);
            let limit = if stalled { options.tolerance.sqrt() } else { options.tolerance };
            converged = stationarity <= limit;
        }

        Ok(QpSolution {
            x,
            iterations,
            converged,
            objective,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn options() -> QpOptions {
        QpOptions {
            max_iterations: 50,
            tolerance: 1e-10,
        }
    }

    #[test]
    fn test_unconstrained_minimum() {
        let h = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
        let g = DVector::from_vec(vec![-1.0, -1.0]);
        let lower = DVector::from_element(2, -10.0);
        let upper = DVector::from_element(2, 10.0);
        let qp = BoxQp { hessian: &h, gradient: &g, lower: &lower, upper: &upper };
        let sol = qp.solve(None, &options()).unwrap();
        assert!(sol.converged);
        let expected = h.clone().cholesky().unwrap().solve(&(-&g));
        assert_relative_eq!(sol.x, expected, epsilon = 1e-9);
        assert_eq!(sol.iterations, 1);
    }

    #[test]
    fn test_iteration_cap_reports_unconverged() {
        // The first Newton step lands on a vertex that is not optimal
        let h = DMatrix::from_row_slice(2, 2, &[1.0, -0.9, -0.9, 1.0]);
        let g = DVector::from_vec(vec![-1.0, 0.5]);
        let lower = DVector::from_element(2, 0.0);
        let upper = DVector::from_element(2, 1.0);
        let qp = BoxQp { hessian: &h, gradient: &g, lower: &lower, upper: &upper };

        let capped = qp.solve(None, &QpOptions { max_iterations: 1, ..options() }).unwrap();
        assert_eq!(capped.iterations, 1);
        assert!(!capped.converged);

        let full = qp.solve(None, &options()).unwrap();
        assert!(full.converged);
        assert_relative_eq!(full.x[0], 1.0, epsilon = 1e-9);
        assert_relative_eq!(full.x[1], 0.4, epsilon = 1e-9);
    }

    #[test]
    fn test_active_bound() {
        // min ½(x−2)² + ½(y+1)², 0 ≤ x ≤ 1, 0 ≤ y ≤ 1
        let h = DMatrix::identity(2, 2);
        let g = DVector::from_vec(vec![-2.0, 1.0]);
        let lower = DVector::from_element(2, 0.0);
        let upper = DVector::from_element(2, 1.0);
        let qp = BoxQp { hessian: &h, gradient: &g, lower: &lower, upper: &upper };
        let sol = qp.solve(None, &options()).unwrap();
        assert!(sol.converged);
        assert_relative_eq!(sol.x[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(sol.x[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_iteration_cap() {
        let h = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0]);
        let g = DVector::from_vec(vec![-8.0, 3.0, -5.0]);
        let lower = DVector::from_element(3, -0.5);
        let upper = DVector::from_element(3, 0.5);
        let qp = BoxQp { hessian: &h, gradient: &g, lower: &lower, upper: &upper };
        let capped = qp.solve(None, &QpOptions { max_iterations: 0, tolerance: 1e-10 }).unwrap();
        assert_eq!(capped.iterations, 0);
        assert!(!capped.converged);
        let full = qp.solve(None, &options()).unwrap();
        assert!(full.converged);
        assert!(full.objective < capped.objective);
    }

    #[test]
    fn test_indefinite_hessian_is_an_error() {
        let h = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]);
        let g = DVector::from_vec(vec![1.0, 1.0]);
        let lower = DVector::from_element(2, -1.0);
        let upper = DVector::from_element(2, 1.0);
        let qp = BoxQp { hessian: &h, gradient: &g, lower: &lower, upper: &upper };
        assert_eq!(qp.solve(None, &options()).unwrap_err(), QpError::NotPositiveDefinite);
    }

    #[test]
    fn test_dimension_mismatch() {
        let h = DMatrix::identity(3, 3);
        let g = DVector::zeros(2);
        let b = DVector::zeros(2);
        let qp = BoxQp { hessian: &h, gradient: &g, lower: &b, upper: &b };
        assert!(matches!(qp.solve(None, &options()), Err(QpError::DimensionMismatch { .. })));
    }
}
