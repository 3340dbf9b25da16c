pub use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Sample a d x n matrix from N(0,1) with an explicit seed
pub fn rnorm_seeded(dd: usize, nn: usize, seed: u64) -> DMatrix<f64> {
    let mut rng = SmallRng::seed_from_u64(seed);
    rnorm_with(dd, nn, &mut rng)
}

/// Sample a d x n matrix from N(0,1) drawing from the given generator
pub fn rnorm_with<R: Rng>(dd: usize, nn: usize, rng: &mut R) -> DMatrix<f64> {
    let rvec = (0..(dd * nn))
        .map(|_| rng.sample(StandardNormal))
        .collect::<Vec<f64>>();

    DMatrix::<f64>::from_vec(dd, nn, rvec)
}

/// Calculate tr(AB) through the Hadamard product without forming AB
pub fn trace_product(aa: &DMatrix<f64>, bb: &DMatrix<f64>) -> f64 {
    debug_assert_eq!(aa.ncols(), bb.nrows());
    debug_assert_eq!(aa.nrows(), bb.ncols());
    aa.transpose().component_mul(bb).sum()
}

/// Flatten matrices into a single vector, column-major within each
/// matrix, concatenated in order
pub fn flatten_matrices(mats: &[&DMatrix<f64>]) -> Vec<f64> {
    mats.iter()
        .flat_map(|m| m.as_slice().iter().copied())
        .collect()
}

/// Restore matrices of the given `(nrows, ncols)` shapes from a
/// vector produced by [`flatten_matrices`]
pub fn split_and_reshape(
    flattened: &[f64],
    shapes: &[(usize, usize)],
) -> anyhow::Result<Vec<DMatrix<f64>>> {
    let ntot: usize = shapes.iter().map(|&(r, c)| r * c).sum();
    if ntot != flattened.len() {
        return Err(anyhow::anyhow!(
            "expected {} elements for shapes {:?}, found {}",
            ntot,
            shapes,
            flattened.len()
        ));
    }

    let mut lb = 0;
    let mut ret = Vec::with_capacity(shapes.len());
    for &(nrows, ncols) in shapes {
        let ub = lb + nrows * ncols;
        ret.push(DMatrix::from_column_slice(nrows, ncols, &flattened[lb..ub]));
        lb = ub;
    }
    Ok(ret)
}

/// Concatenate matrices horizontally; all must share the row count
pub fn concatenate_horizontal(mats: &[&DMatrix<f64>]) -> anyhow::Result<DMatrix<f64>> {
    let nrows = mats
        .first()
        .map(|m| m.nrows())
        .ok_or(anyhow::anyhow!("nothing to concatenate"))?;

    if mats.iter().any(|m| m.nrows() != nrows) {
        return Err(anyhow::anyhow!("inconsistent row counts"));
    }

    let ncols = mats.iter().map(|m| m.ncols()).sum();
    let mut ret = DMatrix::<f64>::zeros(nrows, ncols);
    let mut lb = 0;
    for m in mats {
        ret.view_mut((0, lb), (nrows, m.ncols())).copy_from(*m);
        lb += m.ncols();
    }
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn trace_product_matches_naive() {
        let aa = rnorm_seeded(4, 3, 11);
        let bb = rnorm_seeded(3, 4, 23);
        let naive = (&aa * &bb).trace();
        assert_relative_eq!(trace_product(&aa, &bb), naive, epsilon = 1e-12);
    }

    #[test]
    fn flatten_reshape_roundtrip() -> anyhow::Result<()> {
        let shapes = [(2, 5), (7, 1), (3, 3), (1, 4)];
        let mats: Vec<DMatrix<f64>> = shapes
            .iter()
            .enumerate()
            .map(|(i, &(r, c))| rnorm_seeded(r, c, i as u64))
            .collect();

        let refs: Vec<&DMatrix<f64>> = mats.iter().collect();
        let flat = flatten_matrices(&refs);
        let back = split_and_reshape(&flat, &shapes)?;

        assert_eq!(back.len(), mats.len());
        for (orig, rec) in mats.iter().zip(back.iter()) {
            assert_eq!(orig, rec);
        }
        Ok(())
    }

    #[test]
    fn reshape_rejects_wrong_length() {
        let flat = vec![0.0; 5];
        assert!(split_and_reshape(&flat, &[(2, 3)]).is_err());
    }

    #[test]
    fn horizontal_concatenation() -> anyhow::Result<()> {
        let aa = rnorm_seeded(3, 2, 1);
        let bb = rnorm_seeded(3, 4, 2);
        let cc = concatenate_horizontal(&[&aa, &bb])?;
        assert_eq!(cc.nrows(), 3);
        assert_eq!(cc.ncols(), 6);
        assert_eq!(cc.column(1), aa.column(1));
        assert_eq!(cc.column(5), bb.column(3));
        Ok(())
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let aa = rnorm_seeded(5, 5, 42);
        let bb = rnorm_seeded(5, 5, 42);
        assert_eq!(aa, bb);
        let cc = rnorm_seeded(5, 5, 43);
        assert_ne!(aa, cc);
    }
}
