//! Levenberg-Marquardt least squares for two-parameter curve models.
//!
//! The residual is `y - model(x)`. Steps solve `(JᵀJ + λ·diag(JᵀJ)) δ = Jᵀr`; a step is
//! accepted only when it lowers the sum of squared residuals.

use super::FitStatus;

/// Model with two free parameters evaluated on a 1-D abscissa.
pub trait CurveModel {
    fn evaluate(&self, x: f64, params: &[f64; 2]) -> f64;

    /// Partial derivatives of [`CurveModel::evaluate`] with respect to both parameters.
    fn jacobian_row(&self, x: f64, params: &[f64; 2]) -> [f64; 2];
}

#[derive(Debug, Clone)]
pub struct LmConfig {
    pub max_iterations: usize,
    /// Relative reduction of the squared norm below which an accepted step ends the fit.
    pub ftol: f64,
    /// Absolute floor added to the `ftol` criterion.
    pub atol: f64,
    /// Relative parameter change below which an accepted step ends the fit.
    pub xtol: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
    pub max_lambda: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            ftol: 1e-10,
            atol: 1e-10,
            xtol: 1e-10,
            initial_lambda: 0.001,
            lambda_up: 10.0,
            lambda_down: 0.1,
            max_lambda: 1e10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmOutcome {
    pub params: [f64; 2],
    /// Euclidean norm of the residual vector at `params`.
    pub fnorm: f64,
    pub status: FitStatus,
    pub iterations: usize,
}

pub fn optimize<M: CurveModel>(
    model: &M,
    xs: &[f64],
    ys: &[f64],
    initial: [f64; 2],
    config: &LmConfig,
) -> LmOutcome {
    let mut params = initial;
    let mut chi2 = sum_squares(model, xs, ys, &params);
    let mut lambda = config.initial_lambda;
    let mut iterations = 0;

    let outcome = |params: [f64; 2], chi2: f64, status, iterations| LmOutcome {
        params,
        fnorm: chi2.sqrt(),
        status,
        iterations,
    };

    if !chi2.is_finite() {
        return outcome(params, chi2, FitStatus::Trapped, 0);
    }
    if chi2 == 0.0 {
        return outcome(params, chi2, FitStatus::Converged, 0);
    }

    while iterations < config.max_iterations {
        iterations += 1;
        let (hessian, gradient) = normal_equations(model, xs, ys, &params);

        // A step is retried with more damping until it improves or damping runs away.
        loop {
            let mut damped = hessian;
            for (i, row) in damped.iter_mut().enumerate() {
                row[i] *= 1.0 + lambda;
            }
            let Some(delta) = solve(&damped, &gradient) else {
                return outcome(params, chi2, FitStatus::SingularOrZero, iterations);
            };

            let candidate = [params[0] + delta[0], params[1] + delta[1]];
            let new_chi2 = sum_squares(model, xs, ys, &candidate);

            if new_chi2.is_finite() && new_chi2 < chi2 {
                let reduction = chi2 - new_chi2;
                let converged = reduction <= config.ftol * chi2 + config.atol
                    || new_chi2 == 0.0
                    || small_step(&params, &delta, config.xtol);
                params = candidate;
                chi2 = new_chi2;
                lambda *= config.lambda_down;
                if converged {
                    return outcome(params, chi2, FitStatus::Converged, iterations);
                }
                break;
            }

            lambda *= config.lambda_up;
            if lambda > config.max_lambda {
                return outcome(params, chi2, FitStatus::Trapped, iterations);
            }
        }
    }

    outcome(params, chi2, FitStatus::Exhausted, iterations)
}

fn small_step(params: &[f64; 2], delta: &[f64; 2], xtol: f64) -> bool {
    params
        .iter()
        .zip(delta)
        .all(|(p, d)| d.abs() <= xtol * (p.abs() + xtol))
}

fn sum_squares<M: CurveModel>(model: &M, xs: &[f64], ys: &[f64], params: &[f64; 2]) -> f64 {
    xs.iter()
        .zip(ys)
        .map(|(&x, &y)| {
            let r = y - model.evaluate(x, params);
            r * r
        })
        .sum()
}

/// `JᵀJ` and `Jᵀr` at `params`.
fn normal_equations<M: CurveModel>(
    model: &M,
    xs: &[f64],
    ys: &[f64],
    params: &[f64; 2],
) -> ([[f64; 2]; 2], [f64; 2]) {
    let mut hessian = [[0.0; 2]; 2];
    let mut gradient = [0.0; 2];
    for (&x, &y) in xs.iter().zip(ys) {
        let row = model.jacobian_row(x, params);
        let r = y - model.evaluate(x, params);
        for i in 0..2 {
            gradient[i] += row[i] * r;
            for j in 0..2 {
                hessian[i][j] += row[i] * row[j];
            }
        }
    }
    (hessian, gradient)
}

/// Gaussian elimination with partial pivoting. `None` when a pivot vanishes relative to
/// the largest matrix entry.
pub fn solve<const N: usize>(a: &[[f64; N]; N], b: &[f64; N]) -> Option<[f64; N]> {
    let mut matrix = *a;
    let mut rhs = *b;

    let scale = matrix
        .iter()
        .flat_map(|row| row.iter())
        .fold(0.0f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }
    let threshold = f64::EPSILON * scale;

    for col in 0..N {
        let mut max_row = col;
        let mut max_val = matrix[col][col].abs();
        for (row, values) in matrix.iter().enumerate().skip(col + 1) {
            if values[col].abs() > max_val {
                max_val = values[col].abs();
                max_row = row;
            }
        }
        if max_val <= threshold {
            return None;
        }
        if max_row != col {
            matrix.swap(col, max_row);
            rhs.swap(col, max_row);
        }
        for row in (col + 1)..N {
            let factor = matrix[row][col] / matrix[col][col];
            let pivot_row = matrix[col];
            for (j, m) in matrix[row].iter_mut().enumerate().skip(col) {
                *m -= factor * pivot_row[j];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f64; N];
    for i in (0..N).rev() {
        let mut sum = rhs[i];
        for (j, &xj) in x.iter().enumerate().skip(i + 1) {
            sum -= matrix[i][j] * xj;
        }
        x[i] = sum / matrix[i][i];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Line;

    impl CurveModel for Line {
        fn evaluate(&self, x: f64, params: &[f64; 2]) -> f64 {
            params[0] * x + params[1]
        }

        fn jacobian_row(&self, x: f64, _params: &[f64; 2]) -> [f64; 2] {
            [x, 1.0]
        }
    }

    /// Second parameter has no effect on the model.
    struct Flat;

    impl CurveModel for Flat {
        fn evaluate(&self, x: f64, params: &[f64; 2]) -> f64 {
            params[0] * x
        }

        fn jacobian_row(&self, x: f64, _params: &[f64; 2]) -> [f64; 2] {
            [x, 0.0]
        }
    }

    #[test]
    fn solves_small_system() {
        let x = solve(&[[2.0, 1.0], [1.0, 3.0]], &[3.0, 5.0]).expect("regular");
        assert!((x[0] - 0.8).abs() < 1e-12);
        assert!((x[1] - 1.4).abs() < 1e-12);
        assert!(solve(&[[1.0, 2.0], [2.0, 4.0]], &[1.0, 1.0]).is_none());
        assert!(solve(&[[0.0, 0.0], [0.0, 0.0]], &[0.0, 0.0]).is_none());
    }

    #[test]
    fn fits_line_exactly() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let ys = [1.0, 3.0, 5.0, 7.0];
        let out = optimize(&Line, &xs, &ys, [0.5, 0.0], &LmConfig::default());
        assert_eq!(out.status, FitStatus::Converged);
        assert!((out.params[0] - 2.0).abs() < 1e-6);
        assert!((out.params[1] - 1.0).abs() < 1e-6);
        assert!(out.fnorm < 1e-4);
    }

    #[test]
    fn zero_jacobian_column_is_singular() {
        let xs = [1.0, 2.0, 3.0];
        let ys = [2.0, 4.0, 7.0];
        let out = optimize(&Flat, &xs, &ys, [1.0, 5.0], &LmConfig::default());
        assert_eq!(out.status, FitStatus::SingularOrZero);
    }

    #[test]
    fn iteration_limit_reports_exhausted() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let ys = [1.0, 3.0, 5.0, 7.5];
        let config = LmConfig {
            max_iterations: 1,
            initial_lambda: 1e3,
            ..LmConfig::default()
        };
        let out = optimize(&Line, &xs, &ys, [0.0, 0.0], &config);
        assert_eq!(out.status, FitStatus::Exhausted);
        assert_eq!(out.iterations, 1);
    }
}
