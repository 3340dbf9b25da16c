pub mod dmatrix_gaussian;
pub mod dvector_gamma;

pub use dmatrix_gaussian::GaussianMatrix;
pub use dvector_gamma::GammaVec;
