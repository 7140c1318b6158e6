//! Utilities for difference matrices and text matrix files.
use crate::errors::{GprError, Result};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

/// Computes differences between x and each of the given points
/// resulting in a 2d array of shape (points.len(), x.len()).
/// *Panics* if a point has not the same number of components as x
pub fn differences<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix1>,
    points: &[Array1<F>],
) -> Array2<F> {
    let mut d = Array2::zeros((points.len(), x.len()));
    for (mut row, p) in d.rows_mut().into_iter().zip(points) {
        assert!(p.len() == x.len());
        row.assign(&(x - p));
    }
    d
}

/// Write a matrix as whitespace delimited text, one row per line.
///
/// Values are written with their shortest representation that round-trips
/// to the same floating point value.
pub fn write_matrix<F: Float, P: AsRef<Path>>(
    m: &ArrayBase<impl Data<Elem = F>, Ix2>,
    path: P,
) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for row in m.rows() {
        let line = row
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a whitespace delimited text matrix written by [`write_matrix`].
///
/// Dimensions are inferred from content: one row per non blank line,
/// every row must have the same number of values.
pub fn read_matrix<F: Float + FromStr, P: AsRef<Path>>(path: P) -> Result<Array2<F>> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut values = Vec::new();
    let mut nrows = 0;
    let mut ncols = None;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row = line
            .split_whitespace()
            .map(|tok| {
                tok.parse::<F>().map_err(|_| {
                    GprError::CorruptState(format!(
                        "{}:{}: bad value '{tok}'",
                        path.display(),
                        lineno + 1
                    ))
                })
            })
            .collect::<Result<Vec<F>>>()?;
        match ncols {
            None => ncols = Some(row.len()),
            Some(n) if n != row.len() => {
                return Err(GprError::CorruptState(format!(
                    "{}:{}: expected {n} values, got {}",
                    path.display(),
                    lineno + 1,
                    row.len()
                )))
            }
            _ => (),
        }
        values.extend(row);
        nrows += 1;
    }
    Array2::from_shape_vec((nrows, ncols.unwrap_or(0)), values)
        .map_err(|e| GprError::CorruptState(format!("{}: {e}", path.display())))
}
