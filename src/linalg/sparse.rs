//! Sparse matrix patterns and kernels.
//!
//! All sparse data is CSC (Compressed Sparse Column) with a fixed pattern:
//! the pattern lives in a [`Sparsity`] and the numeric values in a parallel
//! dense slice. Patterns are built once per problem structure; the numeric
//! kernels then work on plain slices so that repeated solves against the
//! same structure never touch the pattern again.

use sprs::{CsMat, TriMat};

use crate::problem::ProblemError;

/// Fixed CSC sparsity pattern: dimensions, column pointers and row indices.
///
/// Row indices within each column are strictly ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sparsity {
    nrow: usize,
    ncol: usize,
    colptr: Vec<usize>,
    rowind: Vec<usize>,
}

impl Sparsity {
    /// Build a pattern from raw CSC arrays, validating the invariants.
    pub fn from_parts(
        nrow: usize,
        ncol: usize,
        colptr: Vec<usize>,
        rowind: Vec<usize>,
    ) -> Result<Self, ProblemError> {
        if colptr.len() != ncol + 1 {
            return Err(ProblemError::InvalidSparsity(format!(
                "colptr has length {}, expected {}",
                colptr.len(),
                ncol + 1
            )));
        }
        if colptr[0] != 0 || colptr[ncol] != rowind.len() {
            return Err(ProblemError::InvalidSparsity(
                "colptr does not span the row index array".to_string(),
            ));
        }
        for j in 0..ncol {
            if colptr[j] > colptr[j + 1] {
                return Err(ProblemError::InvalidSparsity(format!(
                    "colptr is not monotone at column {}",
                    j
                )));
            }
            let col = &rowind[colptr[j]..colptr[j + 1]];
            for (a, b) in col.iter().zip(col.iter().skip(1)) {
                if a >= b {
                    return Err(ProblemError::InvalidSparsity(format!(
                        "row indices in column {} are not strictly ascending",
                        j
                    )));
                }
            }
            if let Some(&last) = col.last() {
                if last >= nrow {
                    return Err(ProblemError::InvalidSparsity(format!(
                        "row index {} out of range in column {}",
                        last, j
                    )));
                }
            }
        }
        Ok(Self {
            nrow,
            ncol,
            colptr,
            rowind,
        })
    }

    /// Build a pattern from arrays already known to satisfy the invariants.
    pub(crate) fn from_parts_unchecked(
        nrow: usize,
        ncol: usize,
        colptr: Vec<usize>,
        rowind: Vec<usize>,
    ) -> Self {
        debug_assert_eq!(colptr.len(), ncol + 1);
        debug_assert_eq!(*colptr.last().unwrap_or(&0), rowind.len());
        Self {
            nrow,
            ncol,
            colptr,
            rowind,
        }
    }

    /// Extract the pattern of a sprs matrix. The matrix must use CSC storage.
    pub fn from_csmat(m: &CsMat<f64>) -> Result<Self, ProblemError> {
        if !m.is_csc() {
            return Err(ProblemError::InvalidSparsity(
                "expected CSC storage (convert with to_csc first)".to_string(),
            ));
        }
        let indptr = m.indptr();
        Self::from_parts(
            m.rows(),
            m.cols(),
            indptr.raw_storage().to_vec(),
            m.indices().to_vec(),
        )
    }

    /// Number of rows.
    pub fn nrow(&self) -> usize {
        self.nrow
    }

    /// Number of columns.
    pub fn ncol(&self) -> usize {
        self.ncol
    }

    /// Number of structural nonzeros.
    pub fn nnz(&self) -> usize {
        self.rowind.len()
    }

    /// Column pointer array (length ncol + 1).
    pub fn colptr(&self) -> &[usize] {
        &self.colptr
    }

    /// Row index array (length nnz).
    pub fn rowind(&self) -> &[usize] {
        &self.rowind
    }

    /// Nonzero range of column `j`.
    pub fn range(&self, j: usize) -> std::ops::Range<usize> {
        self.colptr[j]..self.colptr[j + 1]
    }

    /// Iterate over column `j` as (nonzero index, row index) pairs.
    pub fn col(&self, j: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.range(j).map(move |k| (k, self.rowind[k]))
    }

    /// Whether the pattern is structurally symmetric.
    pub fn is_symmetric(&self) -> bool {
        if self.nrow != self.ncol {
            return false;
        }
        let t = self.transpose_pattern();
        t.colptr == self.colptr && t.rowind == self.rowind
    }

    /// Pattern of the transpose.
    pub fn transpose_pattern(&self) -> Sparsity {
        let mut colptr = vec![0usize; self.nrow + 1];
        for &r in &self.rowind {
            colptr[r + 1] += 1;
        }
        for r in 0..self.nrow {
            colptr[r + 1] += colptr[r];
        }
        let mut cursor = colptr[..self.nrow].to_vec();
        let mut rowind = vec![0usize; self.nnz()];
        for j in 0..self.ncol {
            for k in self.range(j) {
                let r = self.rowind[k];
                rowind[cursor[r]] = j;
                cursor[r] += 1;
            }
        }
        Sparsity {
            nrow: self.ncol,
            ncol: self.nrow,
            colptr,
            rowind,
        }
    }
}

/// Sparse matrix-vector product with accumulation:
/// `y += A x` or, with `transpose`, `y += A^T x`.
pub fn mv(sp: &Sparsity, nz: &[f64], x: &[f64], y: &mut [f64], transpose: bool) {
    debug_assert_eq!(nz.len(), sp.nnz());
    if transpose {
        debug_assert!(x.len() >= sp.nrow && y.len() >= sp.ncol);
        for j in 0..sp.ncol {
            for k in sp.range(j) {
                y[j] += nz[k] * x[sp.rowind[k]];
            }
        }
    } else {
        debug_assert!(x.len() >= sp.ncol && y.len() >= sp.nrow);
        for j in 0..sp.ncol {
            for k in sp.range(j) {
                y[sp.rowind[k]] += nz[k] * x[j];
            }
        }
    }
}

/// Permute values into the transposed pattern: `nz_y` receives the values of
/// `(sp_x, nz_x)` laid out on `sp_y = sp_x^T`. `cursor` is integer scratch of
/// length at least `sp_y.ncol()`.
pub fn trans(sp_x: &Sparsity, nz_x: &[f64], sp_y: &Sparsity, nz_y: &mut [f64], cursor: &mut [usize]) {
    debug_assert_eq!(sp_x.nrow, sp_y.ncol);
    debug_assert_eq!(sp_x.ncol, sp_y.nrow);
    debug_assert_eq!(sp_x.nnz(), sp_y.nnz());
    cursor[..sp_y.ncol].copy_from_slice(&sp_y.colptr[..sp_y.ncol]);
    for (k, &r) in sp_x.rowind.iter().enumerate() {
        nz_y[cursor[r]] = nz_x[k];
        cursor[r] += 1;
    }
}

/// Bilinear form `x^T A y` over a sparse matrix.
pub fn bilin(sp: &Sparsity, nz: &[f64], x: &[f64], y: &[f64]) -> f64 {
    debug_assert!(x.len() >= sp.nrow && y.len() >= sp.ncol);
    let mut ret = 0.0;
    for j in 0..sp.ncol {
        for k in sp.range(j) {
            ret += x[sp.rowind[k]] * nz[k] * y[j];
        }
    }
    ret
}

/// Build a sparse CSC matrix from (row, col, value) triplets.
pub fn from_triplets<I>(nrows: usize, ncols: usize, triplets: I) -> CsMat<f64>
where
    I: IntoIterator<Item = (usize, usize, f64)>,
{
    let mut tri = TriMat::new((nrows, ncols));
    for (i, j, v) in triplets {
        tri.add_triplet(i, j, v);
    }
    tri.to_csc()
}
