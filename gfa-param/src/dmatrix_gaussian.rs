use nalgebra::{Cholesky, DMatrix};

const LN_TWO_PI_E: f64 = 2.837877066409345; // ln(2 * pi * e)

/// Gaussian posterior over a k x d matrix where every column shares
/// one k x k covariance. Updated from its natural (precision) form.
#[derive(Debug, Clone)]
pub struct GaussianMatrix {
    num_rows: usize,
    num_columns: usize,
    //////////////////////////
    // estimated parameters //
    //////////////////////////
    mean: DMatrix<f64>,
    covariance: DMatrix<f64>,
    ln_det_covariance: f64,
}

impl GaussianMatrix {
    /// Fresh posterior with identity covariance and the given mean
    pub fn new(mean: DMatrix<f64>) -> Self {
        let kk = mean.nrows();
        let dd = mean.ncols();
        Self {
            num_rows: kk,
            num_columns: dd,
            mean,
            covariance: DMatrix::identity(kk, kk),
            ln_det_covariance: 0.0,
        }
    }

    /// Recompute the posterior from its precision matrix and the
    /// covariance-free part of the mean: `mean = precision^-1 * rhs`.
    ///
    /// The precision must be symmetric positive definite; a failed
    /// Cholesky factorization is an invariant violation surfaced to
    /// the caller, not a recoverable input condition.
    pub fn update_from_precision(
        &mut self,
        precision: DMatrix<f64>,
        rhs: &DMatrix<f64>,
    ) -> anyhow::Result<()> {
        debug_assert_eq!(precision.nrows(), self.num_rows);
        debug_assert_eq!(rhs.nrows(), self.num_rows);
        debug_assert_eq!(rhs.ncols(), self.num_columns);

        let chol = Cholesky::new(precision)
            .ok_or(anyhow::anyhow!("precision matrix is not positive definite"))?;

        let ln_det_precision = 2.0 * chol.l().diagonal().map(|x| x.ln()).sum();
        self.covariance = chol.inverse();
        self.ln_det_covariance = -ln_det_precision;
        self.mean = &self.covariance * rhs;
        Ok(())
    }

    pub fn mean(&self) -> &DMatrix<f64> {
        &self.mean
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn ln_det_covariance(&self) -> f64 {
        self.ln_det_covariance
    }

    /// Covariance accumulated over all columns: `d * Sigma`
    pub fn covariance_total(&self) -> DMatrix<f64> {
        self.num_columns as f64 * &self.covariance
    }

    /// `E[M M'] = d * Sigma + mean * mean'`
    pub fn second_moment(&self) -> DMatrix<f64> {
        self.covariance_total() + &self.mean * self.mean.transpose()
    }

    /// Differential entropy summed over the d columns
    pub fn entropy(&self) -> f64 {
        self.num_columns as f64 / 2.0
            * (self.num_rows as f64 * LN_TWO_PI_E + self.ln_det_covariance)
    }

    pub fn nrows(&self) -> usize {
        self.num_rows
    }

    pub fn ncols(&self) -> usize {
        self.num_columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use gfa_util::dmatrix_util::rnorm_seeded;

    #[test]
    fn identity_precision_keeps_rhs() -> anyhow::Result<()> {
        let rhs = rnorm_seeded(3, 5, 7);
        let mut q = GaussianMatrix::new(DMatrix::zeros(3, 5));
        q.update_from_precision(DMatrix::identity(3, 3), &rhs)?;

        assert!((q.mean() - &rhs).norm() < 1e-12);
        assert_relative_eq!(q.ln_det_covariance(), 0.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn diagonal_precision_inverts() -> anyhow::Result<()> {
        let prec = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![2.0, 4.0]));
        let rhs = DMatrix::from_element(2, 3, 1.0);
        let mut q = GaussianMatrix::new(DMatrix::zeros(2, 3));
        q.update_from_precision(prec, &rhs)?;

        assert_relative_eq!(q.covariance()[(0, 0)], 0.5, epsilon = 1e-12);
        assert_relative_eq!(q.covariance()[(1, 1)], 0.25, epsilon = 1e-12);
        assert_relative_eq!(q.ln_det_covariance(), -(8.0f64.ln()), epsilon = 1e-12);
        assert_relative_eq!(q.mean()[(0, 0)], 0.5, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn indefinite_precision_is_an_error() {
        let prec = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let rhs = DMatrix::zeros(2, 1);
        let mut q = GaussianMatrix::new(DMatrix::zeros(2, 1));
        assert!(q.update_from_precision(prec, &rhs).is_err());
    }

    #[test]
    fn second_moment_and_entropy() -> anyhow::Result<()> {
        let rhs = rnorm_seeded(2, 4, 3);
        let mut q = GaussianMatrix::new(DMatrix::zeros(2, 4));
        q.update_from_precision(DMatrix::identity(2, 2) * 2.0, &rhs)?;

        let mm = q.second_moment();
        let expected = q.covariance() * 4.0 + q.mean() * q.mean().transpose();
        assert!((mm - expected).norm() < 1e-12);

        // entropy of N(., I/2) per column: (k ln 2 pi e + ln det) / 2
        let per_column = (2.0 * LN_TWO_PI_E + (0.25f64).ln()) / 2.0;
        assert_relative_eq!(q.entropy(), 4.0 * per_column, epsilon = 1e-12);
        Ok(())
    }
}
