//! Problem descriptor, solver settings and result types.
//!
//! The descriptor ([`QpProblem`]) is immutable and structural: dimensions,
//! sparsity patterns and the symbolic QR factors of the KKT system. Numeric
//! data for one solve travels separately in a [`QpInput`], so repeated
//! solves against the same structure reuse everything the descriptor owns.

use std::fmt;

use thiserror::Error;

use crate::linalg::qr::QrSymbolic;
use crate::linalg::sparse::Sparsity;

/// Descriptor construction and input validation errors.
#[derive(Error, Debug)]
pub enum ProblemError {
    /// A slice had the wrong length for the descriptor it was used with.
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Which input was mis-sized
        what: &'static str,
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// A sparsity pattern violated a structural invariant.
    #[error("invalid sparsity: {0}")]
    InvalidSparsity(String),
}

/// Immutable problem structure for
///
/// ```text
/// minimize    (1/2) x^T H x + g^T x
/// subject to  lba <= A x <= uba
///             lbx <=  x  <= ubx
/// ```
///
/// with H symmetric (full pattern, not a triangle) of dimension `nx` and A
/// of shape `na`-by-`nx`. The combined variable vector z stacks x with the
/// constraint values A x, so the KKT system has dimension `nz = nx + na`.
#[derive(Debug, Clone)]
pub struct QpProblem {
    nx: usize,
    na: usize,
    nz: usize,
    pub(crate) sp_h: Sparsity,
    pub(crate) sp_a: Sparsity,
    pub(crate) sp_at: Sparsity,
    pub(crate) sp_kkt: Sparsity,
    pub(crate) qr: QrSymbolic,
}

impl QpProblem {
    /// Build a descriptor from the patterns of H (nx-by-nx, symmetric) and
    /// A (na-by-nx), using the conservative dense symbolic QR factors.
    pub fn new(sp_h: &Sparsity, sp_a: &Sparsity) -> Result<Self, ProblemError> {
        let nz = sp_h.ncol() + sp_a.nrow();
        Self::with_symbolic(sp_h, sp_a, QrSymbolic::dense(nz))
    }

    /// Build a descriptor with caller-provided symbolic QR factors for the
    /// KKT pattern (dimension `nx + na`).
    pub fn with_symbolic(
        sp_h: &Sparsity,
        sp_a: &Sparsity,
        qr: QrSymbolic,
    ) -> Result<Self, ProblemError> {
        let nx = sp_h.ncol();
        let na = sp_a.nrow();
        let nz = nx + na;
        if sp_h.nrow() != nx {
            return Err(ProblemError::InvalidSparsity(format!(
                "H must be square, got {}x{}",
                sp_h.nrow(),
                sp_h.ncol()
            )));
        }
        if !sp_h.is_symmetric() {
            return Err(ProblemError::InvalidSparsity(
                "H pattern must be symmetric (store the full matrix, not a triangle)".to_string(),
            ));
        }
        if sp_a.ncol() != nx {
            return Err(ProblemError::DimensionMismatch {
                what: "A columns",
                expected: nx,
                actual: sp_a.ncol(),
            });
        }
        if qr.dim() != nz {
            return Err(ProblemError::DimensionMismatch {
                what: "symbolic QR dimension",
                expected: nz,
                actual: qr.dim(),
            });
        }
        let sp_at = sp_a.transpose_pattern();
        let sp_kkt = build_kkt_pattern(sp_h, sp_a, &sp_at);
        Ok(Self {
            nx,
            na,
            nz,
            sp_h: sp_h.clone(),
            sp_a: sp_a.clone(),
            sp_at,
            sp_kkt,
            qr,
        })
    }

    /// Number of decision variables.
    pub fn nx(&self) -> usize {
        self.nx
    }

    /// Number of linear constraints.
    pub fn na(&self) -> usize {
        self.na
    }

    /// Dimension of the KKT system (`nx + na`).
    pub fn nz(&self) -> usize {
        self.nz
    }

    /// Pattern of the KKT system.
    pub fn kkt_pattern(&self) -> &Sparsity {
        &self.sp_kkt
    }

    /// Workspace sizing query: total float and integer scratch a
    /// [`crate::Workspace`] allocates for this descriptor. Pure function of
    /// the structure.
    pub fn work_size(&self) -> WorkSize {
        let nnz_h = self.sp_h.nnz();
        let nnz_a = self.sp_a.nnz();
        let nnz_kkt = self.sp_kkt.nnz();
        let nnz_v = self.qr.sp_v.nnz();
        let nnz_r = self.qr.sp_r.nnz();
        let sz_w = nnz_h               // H values
            + 2 * nnz_a                // A values and its transpose
            + self.nx                  // g
            + 6 * self.nz              // z, lbz, ubz, lam, dz, dlam
            + 2 * self.nx              // infeas, tinfeas
            + 2 * nnz_kkt              // KKT values and transpose scratch
            + nnz_v + nnz_r + self.nz  // QR factors and beta
            + self.nz                  // dense scratch
            + self.nz + 1;             // breakpoint positions
        let sz_iw = self.nz            // transpose cursor
            + self.nz                  // multiplier sign snapshot
            + self.nz + 1              // breakpoint indices
            + 3 * self.nz;             // active-set classification
        WorkSize { sz_w, sz_iw }
    }
}

/// Workspace sizes reported by [`QpProblem::work_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkSize {
    /// Number of integer-sized scratch entries.
    pub sz_iw: usize,
    /// Number of float scratch entries.
    pub sz_w: usize,
}

/// KKT pattern: union of H, A, A^T and the diagonal.
///
/// Column j < nx holds the H column, the A column shifted below, and the
/// diagonal; column j >= nx holds the A^T column and the diagonal. Since H
/// is symmetric this pattern is symmetric, which the singular-recovery path
/// relies on when it transposes the numeric KKT in place.
fn build_kkt_pattern(sp_h: &Sparsity, sp_a: &Sparsity, sp_at: &Sparsity) -> Sparsity {
    let nx = sp_h.ncol();
    let na = sp_a.nrow();
    let nz = nx + na;
    let mut colptr = Vec::with_capacity(nz + 1);
    let mut rowind = Vec::new();
    colptr.push(0);
    for j in 0..nx {
        // H rows with the diagonal inserted if H does not store it.
        let mut have_diag = false;
        for (_, r) in sp_h.col(j) {
            if !have_diag && r >= j {
                if r != j {
                    rowind.push(j);
                }
                have_diag = true;
            }
            rowind.push(r);
        }
        if !have_diag {
            rowind.push(j);
        }
        for (_, r) in sp_a.col(j) {
            rowind.push(nx + r);
        }
        colptr.push(rowind.len());
    }
    for j in nx..nz {
        for (_, r) in sp_at.col(j - nx) {
            rowind.push(r);
        }
        rowind.push(j);
        colptr.push(rowind.len());
    }
    Sparsity::from_parts_unchecked(nz, nz, colptr, rowind)
}

/// Numeric inputs for one solve; all slices are caller-owned views.
///
/// `h` and `a` are the nonzero values laid out on the descriptor patterns.
/// Bounds use `f64::INFINITY` for missing sides; an equality is
/// `lb == ub`. Initial multipliers follow the sign convention: negative
/// means active at the lower bound, positive at the upper.
#[derive(Debug, Clone, Copy)]
pub struct QpInput<'a> {
    /// Nonzeros of H on the descriptor's H pattern.
    pub h: &'a [f64],
    /// Linear cost term (length nx).
    pub g: &'a [f64],
    /// Nonzeros of A on the descriptor's A pattern.
    pub a: &'a [f64],
    /// Lower variable bounds (length nx).
    pub lbx: &'a [f64],
    /// Upper variable bounds (length nx).
    pub ubx: &'a [f64],
    /// Lower constraint bounds (length na).
    pub lba: &'a [f64],
    /// Upper constraint bounds (length na).
    pub uba: &'a [f64],
    /// Initial primal point (length nx).
    pub x0: &'a [f64],
    /// Initial bound multipliers (length nx).
    pub lam_x0: &'a [f64],
    /// Initial constraint multipliers (length na).
    pub lam_a0: &'a [f64],
}

/// Solver settings.
#[derive(Debug, Clone)]
pub struct SolverSettings {
    /// Maximum number of outer active-set iterations.
    pub max_iter: usize,

    /// Primal feasibility tolerance (largest bound violation).
    pub tol_pr: f64,

    /// Dual feasibility tolerance (largest Lagrangian gradient entry).
    pub tol_du: f64,

    /// Scale factor relating dual and primal error: a dual error up to
    /// `du_to_pr` times the primal error is considered acceptable when
    /// trading one off against the other.
    pub du_to_pr: f64,

    /// Smallest nonzero multiplier magnitude used to mark a constraint
    /// active.
    pub dmin: f64,

    /// Print one line per outer iteration.
    pub print_iter: bool,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            tol_pr: 1e-8,
            tol_du: 1e-8,
            du_to_pr: 1000.0,
            dmin: f64::MIN_POSITIVE,
            print_iter: false,
        }
    }
}

/// Outcome of one solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// Primal and dual errors within tolerance.
    Solved,

    /// Iteration cap reached; the workspace holds the last iterate.
    MaxIter,

    /// A row of the combined bounds is contradictory; detected in reset
    /// before any factorization.
    InfeasibleBounds,

    /// The KKT system is singular and no rank-restoring active-set change
    /// exists. The workspace holds the last iterate; the caller may perturb
    /// and re-solve.
    Singular,
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveStatus::Solved => write!(f, "Solved"),
            SolveStatus::MaxIter => write!(f, "Maximum iterations reached"),
            SolveStatus::InfeasibleBounds => write!(f, "Infeasible bounds"),
            SolveStatus::Singular => write!(f, "Singular KKT without recovery"),
        }
    }
}

/// Owned primal-dual solution returned by the one-shot entry point.
#[derive(Debug, Clone)]
pub struct QpSolution {
    /// Solve outcome.
    pub status: SolveStatus,
    /// Primal solution (length nx).
    pub x: Vec<f64>,
    /// Bound multipliers (length nx).
    pub lam_x: Vec<f64>,
    /// Constraint multipliers (length na).
    pub lam_a: Vec<f64>,
    /// Objective value at the returned point.
    pub f: f64,
    /// Outer iterations performed.
    pub iterations: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse::{from_triplets, Sparsity};

    fn patterns() -> (Sparsity, Sparsity) {
        // H = diag pattern, A = [[1, 1]]
        let h = from_triplets(2, 2, vec![(0, 0, 2.0), (1, 1, 2.0)]);
        let a = from_triplets(1, 2, vec![(0, 0, 1.0), (0, 1, 1.0)]);
        (
            Sparsity::from_csmat(&h).unwrap(),
            Sparsity::from_csmat(&a).unwrap(),
        )
    }

    #[test]
    fn test_kkt_pattern_symmetric() {
        let (sp_h, sp_a) = patterns();
        let prob = QpProblem::new(&sp_h, &sp_a).unwrap();
        assert_eq!(prob.nz(), 3);
        assert!(prob.kkt_pattern().is_symmetric());
        // Column 0: H diagonal + shifted A row; column 2: A^T + diagonal.
        let cols: Vec<Vec<usize>> = (0..3)
            .map(|j| prob.kkt_pattern().col(j).map(|(_, r)| r).collect())
            .collect();
        assert_eq!(cols[0], vec![0, 2]);
        assert_eq!(cols[1], vec![1, 2]);
        assert_eq!(cols[2], vec![0, 1, 2]);
    }

    #[test]
    fn test_kkt_pattern_missing_h_diagonal() {
        // H with an empty column still gets its KKT diagonal entry.
        let h = from_triplets(2, 2, vec![(0, 0, 1.0)]);
        let a = from_triplets(0, 2, vec![]);
        let prob = QpProblem::new(
            &Sparsity::from_csmat(&h).unwrap(),
            &Sparsity::from_csmat(&a).unwrap(),
        )
        .unwrap();
        let col1: Vec<usize> = prob.kkt_pattern().col(1).map(|(_, r)| r).collect();
        assert_eq!(col1, vec![1]);
    }

    #[test]
    fn test_rejects_asymmetric_h() {
        let h = from_triplets(2, 2, vec![(0, 1, 1.0)]);
        let a = from_triplets(0, 2, vec![]);
        let res = QpProblem::new(
            &Sparsity::from_csmat(&h).unwrap(),
            &Sparsity::from_csmat(&a).unwrap(),
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SolveStatus::Solved.to_string(), "Solved");
        assert_eq!(SolveStatus::InfeasibleBounds.to_string(), "Infeasible bounds");
    }
}
