//! asqp: a sparse active-set quadratic programming solver.
//!
//! Solves convex QPs of the form
//!
//! ```text
//! minimize    (1/2) x^T H x + g^T x
//! subject to  lba <= A x <= uba
//!             lbx <=  x  <= ubx
//! ```
//!
//! with H symmetric positive semidefinite and A sparse, both with a fixed
//! sparsity pattern. The engine is a primal-dual active-set iteration over
//! the signed multipliers: each iteration assembles the KKT system for the
//! current signature, factorizes it with a sparse Householder QR, builds a
//! Newton (or null-space) direction, and takes the largest step that keeps
//! the primal and dual errors inside a shared budget. Singular KKT systems
//! are repaired by scaling the null-space direction onto the constraint
//! whose state change restores full rank.
//!
//! # Example
//!
//! ```ignore
//! use asqp::{solve_qp, SolverSettings};
//! use asqp::linalg::sparse::from_triplets;
//!
//! // minimize x0^2 + x1^2 - 4 x0 - 6 x1  subject to  x >= 0
//! let h = from_triplets(2, 2, vec![(0, 0, 2.0), (1, 1, 2.0)]);
//! let a = from_triplets(0, 2, vec![]);
//! let sol = solve_qp(
//!     &h, &[-4.0, -6.0], &a,
//!     &[0.0, 0.0], &[f64::INFINITY, f64::INFINITY],
//!     &[], &[],
//!     &SolverSettings::default(),
//! )?;
//! println!("status: {}, x = {:?}", sol.status, sol.x);
//! ```
//!
//! For repeated solves against one structure, build a [`QpProblem`] once,
//! keep a [`Workspace`] alive, and call [`Workspace::solve`] per instance;
//! nothing allocates between solves.

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)] // sparse kernels carry their full state

pub mod active_set;
pub mod linalg;
pub mod problem;

pub use active_set::workspace::Workspace;
pub use problem::{
    ProblemError, QpInput, QpProblem, QpSolution, SolveStatus, SolverSettings, WorkSize,
};

use linalg::sparse::Sparsity;
use sprs::CsMat;

/// One-shot solve: build the descriptor and workspace, run from a cold
/// start at x = 0, and return an owned solution.
///
/// `h` must be the full symmetric Hessian (not a triangle); `a` has one row
/// per linear constraint. Bounds use `f64::INFINITY` for missing sides.
pub fn solve_qp(
    h: &CsMat<f64>,
    g: &[f64],
    a: &CsMat<f64>,
    lbx: &[f64],
    ubx: &[f64],
    lba: &[f64],
    uba: &[f64],
    settings: &SolverSettings,
) -> Result<QpSolution, ProblemError> {
    let h = h.to_csc();
    let a = a.to_csc();
    let prob = QpProblem::new(&Sparsity::from_csmat(&h)?, &Sparsity::from_csmat(&a)?)?;
    let mut ws = Workspace::new(&prob);
    let x0 = vec![0.0; prob.nx()];
    let lam_x0 = vec![0.0; prob.nx()];
    let lam_a0 = vec![0.0; prob.na()];
    let status = ws.solve(
        &prob,
        &QpInput {
            h: h.data(),
            g,
            a: a.data(),
            lbx,
            ubx,
            lba,
            uba,
            x0: &x0,
            lam_x0: &lam_x0,
            lam_a0: &lam_a0,
        },
        settings,
    )?;
    Ok(QpSolution {
        status,
        x: ws.primal().to_vec(),
        lam_x: ws.lam_x().to_vec(),
        lam_a: ws.lam_a().to_vec(),
        f: ws.objective(),
        iterations: ws.iterations(),
    })
}
