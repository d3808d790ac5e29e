use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::nifti_header::Affine;

#[derive(Debug, Error)]
pub enum GradientError {
    #[error("{path}: expected 3 rows of gradient components, found {rows}")]
    RowCount { path: PathBuf, rows: usize },

    #[error("{path}: gradient rows have different lengths")]
    RaggedRows { path: PathBuf },

    #[error("{path}: '{token}' is not a number")]
    NotANumber { path: PathBuf, token: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Diffusion gradient directions, one vector per acquired volume.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GradientTable {
    pub vectors: Vec<[f64; 3]>,
}

impl GradientTable {
    /// Reads a bvec file: three whitespace separated rows holding the x, y
    /// and z components of every direction.
    pub fn read_bvec(path: impl AsRef<Path>) -> Result<Self, GradientError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let rows = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                line.split_whitespace()
                    .map(|token| {
                        token.parse::<f64>().map_err(|_| GradientError::NotANumber {
                            path: path.to_path_buf(),
                            token: token.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let [x, y, z] = <[Vec<f64>; 3]>::try_from(rows).map_err(|rows| {
            GradientError::RowCount {
                path: path.to_path_buf(),
                rows: rows.len(),
            }
        })?;
        if x.len() != y.len() || y.len() != z.len() {
            return Err(GradientError::RaggedRows {
                path: path.to_path_buf(),
            });
        }
        let vectors = x
            .into_iter()
            .zip(y)
            .zip(z)
            .map(|((x, y), z)| [x, y, z])
            .collect();
        Ok(Self { vectors })
    }

    /// Writes the table back in bvec layout.
    pub fn write_bvec(&self, path: impl AsRef<Path>) -> Result<(), GradientError> {
        let mut text = String::new();
        for component in 0..3 {
            let row: Vec<String> = self
                .vectors
                .iter()
                .map(|vector| vector[component].to_string())
                .collect();
            text.push_str(&row.join(" "));
            text.push('\n');
        }
        fs::write(path, text)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Applies the rotation part of `affine` to every vector, treating each as
    /// a row vector multiplied on the left.
    pub fn transformed(&self, affine: &Affine) -> Self {
        let vectors = self
            .vectors
            .iter()
            .map(|v| {
                let mut out = [0.0; 3];
                for (j, slot) in out.iter_mut().enumerate() {
                    *slot = (0..3).map(|i| v[i] * affine[i][j]).sum();
                }
                out
            })
            .collect();
        Self { vectors }
    }
}

/// Number of b-values in a bval file: the tokens on its first line.
pub fn bval_count(path: impl AsRef<Path>) -> Result<usize, GradientError> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .next()
        .map_or(0, |line| line.split_whitespace().count()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reads_three_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dwi.bvec");
        fs::write(&path, "0 1 0\n0 0 1\n0 0 0\n").unwrap();
        let table = GradientTable::read_bvec(&path).unwrap();
        assert_eq!(table.vectors, vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);

        let out = dir.path().join("out.bvec");
        table.write_bvec(&out).unwrap();
        assert_eq!(GradientTable::read_bvec(&out).unwrap(), table);
    }

    #[test]
    fn written_vectors_keep_full_precision() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dwi.bvec");
        let table = GradientTable {
            vectors: vec![[0.123456789, -0.987654321012, 1.0 / 3.0]],
        };
        table.write_bvec(&path).unwrap();
        assert_eq!(GradientTable::read_bvec(&path).unwrap(), table);
        assert!(fs::read_to_string(&path).unwrap().starts_with("0.123456789\n"));
    }

    #[test]
    fn rejects_malformed_tables() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.bvec");
        fs::write(&path, "0 1\n0 0\n").unwrap();
        assert!(matches!(
            GradientTable::read_bvec(&path),
            Err(GradientError::RowCount { rows: 2, .. })
        ));
        fs::write(&path, "0 1\n0\n1 1\n").unwrap();
        assert!(matches!(
            GradientTable::read_bvec(&path),
            Err(GradientError::RaggedRows { .. })
        ));
        fs::write(&path, "0 x\n0 0\n1 1\n").unwrap();
        assert!(matches!(
            GradientTable::read_bvec(&path),
            Err(GradientError::NotANumber { .. })
        ));
    }

    #[test]
    fn flips_follow_the_affine() {
        let table = GradientTable {
            vectors: vec![[1.0, 2.0, 3.0]],
        };
        let mut flip_y = crate::nifti_header::identity();
        flip_y[1][1] = -1.0;
        assert_eq!(table.transformed(&flip_y).vectors, vec![[1.0, -2.0, 3.0]]);
    }

    #[test]
    fn counts_bvals() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dwi.bval");
        fs::write(&path, "0 1000 1000 1000\n").unwrap();
        assert_eq!(bval_count(&path).unwrap(), 4);
    }
}
