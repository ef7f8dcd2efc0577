//! Fixed-step integration
//!
//! The vehicle model is time-invariant and its input is held constant over a
//! shooting interval, so the derivative is autonomous: `f(x)`.

use nalgebra::SVector;

/// One classical Runge-Kutta step of length `h`
pub fn rk4<const N: usize, F>(x: &SVector<f64, N>, h: f64, f: F) -> SVector<f64, N>
where
    F: Fn(&SVector<f64, N>) -> SVector<f64, N>,
{
    let half = 0.5 * h;
    let k1 = f(x);
    let k2 = f(&(x + k1 * half));
    let k3 = f(&(x + k2 * half));
    let k4 = f(&(x + k3 * h));
    x + (k1 + (k2 + k3) * 2.0 + k4) * (h / 6.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{SVector, Vector2};

    fn integrate<const N: usize>(
        x: SVector<f64, N>,
        duration: f64,
        steps: usize,
        f: impl Fn(&SVector<f64, N>) -> SVector<f64, N>,
    ) -> SVector<f64, N> {
        let h = duration / steps as f64;
        (0..steps).fold(x, |state, _| rk4(&state, h, &f))
    }

    #[test]
    fn test_linear_decay_matches_exponential() {
        let x0 = SVector::<f64, 1>::new(2.0);
        let x1 = integrate(x0, 0.5, 50, |x| -x * 4.0);
        assert_relative_eq!(x1[0], 2.0 * (-2.0f64).exp(), epsilon = 1e-8);
    }

    #[test]
    fn test_oscillator_returns_after_one_period() {
        let x0 = Vector2::new(0.0, 1.0);
        let x1 = integrate(x0, std::f64::consts::TAU, 500, |s| Vector2::new(s[1], -s[0]));
        assert_relative_eq!(x1, x0, epsilon = 1e-7);
    }

    #[test]
    fn test_single_step_is_exact_for_cubics() {
        // x' = 3t² written autonomously as (x, t)' = (3t², 1)
        let x0 = Vector2::new(0.0, 0.0);
        let x1 = rk4(&x0, 0.7, |s| Vector2::new(3.0 * s[1] * s[1], 1.0));
        assert_relative_eq!(x1[0], 0.7f64.powi(3), epsilon = 1e-12);
        assert_relative_eq!(x1[1], 0.7, epsilon = 1e-12);
    }
}
