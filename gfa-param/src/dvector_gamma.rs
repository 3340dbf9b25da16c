extern crate special;

use nalgebra::DVector;
use statrs::function::gamma::ln_gamma;

/// Gamma posterior over a vector of positive scalars
#[derive(Debug, Clone)]
pub struct GammaVec {
    size: usize,
    //////////////////////
    // hyper parameters //
    //////////////////////
    a0: f64,
    b0: f64,
    ///////////////////////////
    // sufficient statistics //
    ///////////////////////////
    a_stat: DVector<f64>,
    b_stat: DVector<f64>,
    //////////////////////////
    // estimated parameters //
    //////////////////////////
    estimated_mean: DVector<f64>,
    estimated_log_mean: DVector<f64>,
}

impl GammaVec {
    pub fn new(size: usize, a0: f64, b0: f64) -> Self {
        let mut ret = Self {
            size,
            a0,
            b0,
            a_stat: DVector::from_element(size, a0),
            b_stat: DVector::from_element(size, b0),
            estimated_mean: DVector::zeros(size),
            estimated_log_mean: DVector::zeros(size),
        };
        ret.calibrate();
        ret
    }

    /// `a = a0 + add_a`; the shape statistic is set once after
    /// initialization and stays fixed for the rest of a fit
    pub fn update_shape_stat(&mut self, add_a: &DVector<f64>) {
        self.a_stat = add_a.map(|x| x + self.a0);
    }

    /// `b = b0 + add_b`
    pub fn update_rate_stat(&mut self, add_b: &DVector<f64>) {
        self.b_stat = add_b.map(|x| x + self.b0);
    }

    /// Set the rate equal to the shape so that `E[x] = 1`
    pub fn reset_rate_to_shape(&mut self) {
        self.b_stat = self.a_stat.clone();
    }

    pub fn calibrate(&mut self) {
        use special::Gamma;
        self.estimated_mean = self.a_stat.zip_map(&self.b_stat, |a, b| a / b);
        self.estimated_log_mean = self.a_stat.zip_map(&self.b_stat, |a, b| a.digamma() - b.ln());
    }

    pub fn posterior_mean(&self) -> &DVector<f64> {
        &self.estimated_mean
    }

    pub fn posterior_log_mean(&self) -> &DVector<f64> {
        &self.estimated_log_mean
    }

    pub fn shape(&self) -> &DVector<f64> {
        &self.a_stat
    }

    pub fn rate(&self) -> &DVector<f64> {
        &self.b_stat
    }

    /// `E[log p(x | a0, b0)]` under the calibrated posterior,
    /// summed over elements
    pub fn log_prior(&self) -> f64 {
        (0..self.size)
            .map(|i| {
                self.a0 * self.b0.ln() - ln_gamma(self.a0)
                    + (self.a0 - 1.0) * self.estimated_log_mean[i]
                    - self.b0 * self.estimated_mean[i]
            })
            .sum()
    }

    /// Differential entropy summed over elements
    pub fn entropy(&self) -> f64 {
        use special::Gamma;
        (0..self.size)
            .map(|i| {
                let a = self.a_stat[i];
                let b = self.b_stat[i];
                a - b.ln() + ln_gamma(a) + (1.0 - a) * a.digamma()
            })
            .sum()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn shape_equal_rate_means_unit_expectation() {
        // prior expectation is a0/b0 = 1 whenever shape == rate
        let q = GammaVec::new(3, 1e-14, 1e-14);
        for i in 0..3 {
            assert_relative_eq!(q.posterior_mean()[i], 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn rate_update_moves_the_mean() {
        let mut q = GammaVec::new(2, 1.0, 1.0);
        q.update_shape_stat(&DVector::from_vec(vec![3.0, 3.0]));
        q.update_rate_stat(&DVector::from_vec(vec![1.0, 7.0]));
        q.calibrate();
        assert_relative_eq!(q.posterior_mean()[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(q.posterior_mean()[1], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn exponential_entropy_is_one() {
        // Gamma(1, 1) is Exp(1) whose differential entropy is exactly 1
        let q = GammaVec::new(1, 1.0, 1.0);
        assert_relative_eq!(q.entropy(), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn log_mean_uses_digamma() {
        use special::Gamma;
        let mut q = GammaVec::new(1, 2.0, 1.0);
        q.update_rate_stat(&DVector::from_vec(vec![2.0]));
        q.calibrate();
        let expected = (2.0f64).digamma() - (3.0f64).ln();
        assert_relative_eq!(q.posterior_log_mean()[0], expected, epsilon = 1e-12);
    }
}
