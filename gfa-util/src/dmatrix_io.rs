use nalgebra::DMatrix;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};

/// Read a dense matrix from a delimited text file, one row per line
pub fn read_file_delim(file_path: &str, delim: &str) -> anyhow::Result<DMatrix<f64>> {
    let buf = BufReader::new(File::open(file_path)?);

    let mut data = vec![];
    for line in buf.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let row = line
            .split(delim)
            .map(|x| {
                x.trim()
                    .parse::<f64>()
                    .map_err(|e| anyhow::anyhow!("failed to parse '{}': {}", x, e))
            })
            .collect::<anyhow::Result<Vec<f64>>>()?;
        data.push(row);
    }

    if data.is_empty() {
        return Err(anyhow::anyhow!("no data in file: {}", file_path));
    }

    let nrows = data.len();
    let ncols = data[0].len();
    if data.iter().any(|row| row.len() != ncols) {
        return Err(anyhow::anyhow!("ragged rows in file: {}", file_path));
    }

    let data = data.into_iter().flatten().collect::<Vec<_>>();
    Ok(DMatrix::<f64>::from_row_iterator(nrows, ncols, data))
}

/// Write a dense matrix to a delimited text file, one row per line
pub fn write_file_delim(mat: &DMatrix<f64>, file_path: &str, delim: &str) -> anyhow::Result<()> {
    let mut buf = BufWriter::new(File::create(file_path)?);
    for row in mat.row_iter() {
        let line = row
            .iter()
            .map(|x| format!("{}", *x))
            .collect::<Vec<String>>()
            .join(delim);
        writeln!(buf, "{}", line)?;
    }
    buf.flush()?;
    Ok(())
}

pub fn read_tsv(file_path: &str) -> anyhow::Result<DMatrix<f64>> {
    read_file_delim(file_path, "\t")
}

pub fn write_tsv(mat: &DMatrix<f64>, file_path: &str) -> anyhow::Result<()> {
    write_file_delim(mat, file_path, "\t")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmatrix_util::rnorm_seeded;

    #[test]
    fn tsv_roundtrip() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join("gfa_util_io_test");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("mat.tsv");
        let path = path.to_str().unwrap();

        let mat = rnorm_seeded(4, 7, 19);
        write_tsv(&mat, path)?;
        let back = read_tsv(path)?;

        assert_eq!(back.nrows(), 4);
        assert_eq!(back.ncols(), 7);
        for (a, b) in mat.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    #[test]
    fn ragged_input_is_an_error() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join("gfa_util_io_test");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("ragged.tsv");
        std::fs::write(&path, "1\t2\t3\n4\t5\n")?;
        assert!(read_tsv(path.to_str().unwrap()).is_err());
        std::fs::remove_file(path)?;
        Ok(())
    }
}
