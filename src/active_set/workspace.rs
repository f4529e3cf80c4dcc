//! Per-solve state for the active-set iteration.
//!
//! All buffers are allocated once from the descriptor dimensions and reused
//! across solves; nothing inside the iteration allocates. The scalar state
//! mirrors what the controller needs between phases: current step length,
//! singularity flag, primal/dual errors with their worst indices, and a
//! reusable event message.

use std::fmt;

use crate::linalg::{self, sparse};
use crate::problem::{ProblemError, QpInput, QpProblem, SolverSettings};

/// Mutable working set of one solver instance.
///
/// Create once per descriptor with [`Workspace::new`]; run solves with
/// [`Workspace::solve`](Workspace::solve). After a solve the iterate is
/// readable through the accessors.
pub struct Workspace {
    // Number of decision variables of the owning descriptor
    nx: usize,

    // Numeric problem data, copied at load time
    pub(crate) nz_h: Vec<f64>,
    pub(crate) nz_a: Vec<f64>,
    pub(crate) g: Vec<f64>,

    // Primal-dual iterate: z = [x, A x], combined bounds, multipliers
    pub(crate) z: Vec<f64>,
    pub(crate) lbz: Vec<f64>,
    pub(crate) ubz: Vec<f64>,
    pub(crate) lam: Vec<f64>,

    // Search direction and dual tangent
    pub(crate) dz: Vec<f64>,
    pub(crate) dlam: Vec<f64>,
    pub(crate) infeas: Vec<f64>,
    pub(crate) tinfeas: Vec<f64>,

    // Numeric KKT and QR factors
    pub(crate) nz_at: Vec<f64>,
    pub(crate) nz_kkt: Vec<f64>,
    pub(crate) kkt_t: Vec<f64>,
    pub(crate) nz_v: Vec<f64>,
    pub(crate) nz_r: Vec<f64>,
    pub(crate) beta: Vec<f64>,

    // Scratch
    pub(crate) w: Vec<f64>,
    pub(crate) iw: Vec<usize>,

    // Line search: breakpoint list and multiplier sign snapshot
    pub(crate) bp_tau: Vec<f64>,
    pub(crate) bp_ind: Vec<Option<usize>>,
    pub(crate) sign_w: Vec<i8>,

    // Per-row bound classification
    pub(crate) neverzero: Vec<bool>,
    pub(crate) neverupper: Vec<bool>,
    pub(crate) neverlower: Vec<bool>,

    // Scalar state
    pub(crate) f: f64,
    pub(crate) tau: f64,
    pub(crate) sing: bool,
    pub(crate) mina: f64,
    pub(crate) imina: usize,
    pub(crate) pr: f64,
    pub(crate) ipr: Option<usize>,
    pub(crate) du: f64,
    pub(crate) idu: Option<usize>,
    pub(crate) msg: String,
    pub(crate) iterations: usize,
}

impl Workspace {
    /// Allocate a workspace for one descriptor.
    pub fn new(prob: &QpProblem) -> Self {
        let nx = prob.nx();
        let nz = prob.nz();
        Self {
            nx,
            nz_h: vec![0.0; prob.sp_h.nnz()],
            nz_a: vec![0.0; prob.sp_a.nnz()],
            g: vec![0.0; nx],
            z: vec![0.0; nz],
            lbz: vec![0.0; nz],
            ubz: vec![0.0; nz],
            lam: vec![0.0; nz],
            dz: vec![0.0; nz],
            dlam: vec![0.0; nz],
            infeas: vec![0.0; nx],
            tinfeas: vec![0.0; nx],
            nz_at: vec![0.0; prob.sp_a.nnz()],
            nz_kkt: vec![0.0; prob.sp_kkt.nnz()],
            kkt_t: vec![0.0; prob.sp_kkt.nnz()],
            nz_v: vec![0.0; prob.qr.sp_v.nnz()],
            nz_r: vec![0.0; prob.qr.sp_r.nnz()],
            beta: vec![0.0; nz],
            w: vec![0.0; nz],
            iw: vec![0; nz],
            bp_tau: vec![0.0; nz + 1],
            bp_ind: vec![None; nz + 1],
            sign_w: vec![0; nz],
            neverzero: vec![false; nz],
            neverupper: vec![false; nz],
            neverlower: vec![false; nz],
            f: 0.0,
            tau: 0.0,
            sing: false,
            mina: 0.0,
            imina: 0,
            pr: 0.0,
            ipr: None,
            du: 0.0,
            idu: None,
            msg: String::with_capacity(40),
            iterations: 0,
        }
    }

    /// Copy one solve's numeric inputs into the workspace and initialize the
    /// iterate: `z[..nx] = x0`, `z[nx..] = A x0`, combined bounds and
    /// multipliers from the caller's slices.
    pub fn load(&mut self, prob: &QpProblem, input: &QpInput) -> Result<(), ProblemError> {
        let nx = prob.nx();
        let na = prob.na();
        check_len("H nonzeros", prob.sp_h.nnz(), input.h)?;
        check_len("A nonzeros", prob.sp_a.nnz(), input.a)?;
        check_len("g", nx, input.g)?;
        check_len("lbx", nx, input.lbx)?;
        check_len("ubx", nx, input.ubx)?;
        check_len("lba", na, input.lba)?;
        check_len("uba", na, input.uba)?;
        check_len("x0", nx, input.x0)?;
        check_len("lam_x0", nx, input.lam_x0)?;
        check_len("lam_a0", na, input.lam_a0)?;

        self.nz_h.copy_from_slice(input.h);
        self.nz_a.copy_from_slice(input.a);
        self.g.copy_from_slice(input.g);
        self.lbz[..nx].copy_from_slice(input.lbx);
        self.lbz[nx..].copy_from_slice(input.lba);
        self.ubz[..nx].copy_from_slice(input.ubx);
        self.ubz[nx..].copy_from_slice(input.uba);
        self.lam[..nx].copy_from_slice(input.lam_x0);
        self.lam[nx..].copy_from_slice(input.lam_a0);
        let (zx, za) = self.z.split_at_mut(nx);
        zx.copy_from_slice(input.x0);
        za.fill(0.0);
        sparse::mv(&prob.sp_a, &self.nz_a, zx, za, false);
        Ok(())
    }

    /// Prepare for a fresh solve on the loaded data: classify rows, correct
    /// the initial multipliers against the permitted signs, and transpose A.
    /// Returns `true` if the bounds themselves are infeasible.
    pub(crate) fn reset(&mut self, prob: &QpProblem, set: &SolverSettings) -> bool {
        self.msg.clear();
        self.tau = 0.0;
        self.sing = false;
        self.iterations = 0;
        for i in 0..prob.nz() {
            // Permitted signs for the multiplier of row i
            self.neverzero[i] = self.lbz[i] == self.ubz[i];
            self.neverupper[i] = self.ubz[i].is_infinite();
            self.neverlower[i] = self.lbz[i].is_infinite();
            if self.lbz[i] > self.ubz[i] {
                return true;
            }
            if self.neverzero[i] && self.neverupper[i] && self.neverlower[i] {
                return true;
            }
            // Correct the initial active set if required
            if self.neverzero[i] && self.lam[i] == 0.0 {
                self.lam[i] = if self.neverupper[i]
                    || self.z[i] - self.lbz[i] <= self.ubz[i] - self.z[i]
                {
                    -set.dmin
                } else {
                    set.dmin
                };
            } else if self.neverupper[i] && self.lam[i] > 0.0 {
                self.lam[i] = if self.neverzero[i] { -set.dmin } else { 0.0 };
            } else if self.neverlower[i] && self.lam[i] < 0.0 {
                self.lam[i] = if self.neverzero[i] { set.dmin } else { 0.0 };
            }
        }
        sparse::trans(&prob.sp_a, &self.nz_a, &prob.sp_at, &mut self.nz_at, &mut self.iw);
        false
    }

    /// Recompute everything derived from the iterate (z, lam): objective,
    /// constraint values, Lagrangian gradient, bound multiplier magnitudes
    /// and the primal/dual errors. Idempotent.
    pub(crate) fn calc_dependent(&mut self, prob: &QpProblem, set: &SolverSettings) {
        let nx = prob.nx();
        self.f = 0.5 * sparse::bilin(&prob.sp_h, &self.nz_h, &self.z, &self.z)
            + linalg::dot(&self.z[..nx], &self.g);
        let (zx, za) = self.z.split_at_mut(nx);
        za.fill(0.0);
        sparse::mv(&prob.sp_a, &self.nz_a, zx, za, false);
        // Gradient of the Lagrangian, excluding the bound multipliers
        self.infeas.copy_from_slice(&self.g);
        sparse::mv(&prob.sp_h, &self.nz_h, &self.z, &mut self.infeas, false);
        sparse::mv(&prob.sp_a, &self.nz_a, &self.lam[nx..], &mut self.infeas, true);
        // Recompute the bound multipliers without letting them change sign,
        // then fold them into the dual infeasibility
        for i in 0..nx {
            if self.lam[i] > 0.0 {
                self.lam[i] = (-self.infeas[i]).max(set.dmin);
            } else if self.lam[i] < 0.0 {
                self.lam[i] = (-self.infeas[i]).min(-set.dmin);
            }
            self.infeas[i] += self.lam[i];
        }
        self.calc_pr();
        self.calc_du();
    }

    /// Largest bound violation and its row.
    pub(crate) fn calc_pr(&mut self) {
        self.pr = 0.0;
        self.ipr = None;
        for i in 0..self.z.len() {
            if self.z[i] > self.ubz[i] + self.pr {
                self.pr = self.z[i] - self.ubz[i];
                self.ipr = Some(i);
            } else if self.z[i] < self.lbz[i] - self.pr {
                self.pr = self.lbz[i] - self.z[i];
                self.ipr = Some(i);
            }
        }
    }

    /// Largest dual infeasibility entry and its variable.
    pub(crate) fn calc_du(&mut self) {
        self.du = 0.0;
        self.idu = None;
        for i in 0..self.infeas.len() {
            if self.infeas[i] > self.du {
                self.du = self.infeas[i];
                self.idu = Some(i);
            } else if self.infeas[i] < -self.du {
                self.du = -self.infeas[i];
                self.idu = Some(i);
            }
        }
    }

    /// Record the latest active-set event.
    pub(crate) fn set_msg(&mut self, args: fmt::Arguments<'_>) {
        self.msg.clear();
        let _ = fmt::Write::write_fmt(&mut self.msg, args);
    }

    /// Primal point x (length nx).
    pub fn primal(&self) -> &[f64] {
        &self.z[..self.nx]
    }

    /// Bound multipliers (length nx).
    pub fn lam_x(&self) -> &[f64] {
        &self.lam[..self.nx]
    }

    /// Constraint multipliers (length na).
    pub fn lam_a(&self) -> &[f64] {
        &self.lam[self.nx..]
    }

    /// Combined iterate z = [x, A x] (length nz).
    pub fn combined(&self) -> &[f64] {
        &self.z
    }

    /// Combined multipliers (length nz).
    pub fn multipliers(&self) -> &[f64] {
        &self.lam
    }

    /// Objective value at the current iterate.
    pub fn objective(&self) -> f64 {
        self.f
    }

    /// Largest bound violation at the current iterate.
    pub fn primal_error(&self) -> f64 {
        self.pr
    }

    /// Largest Lagrangian gradient entry at the current iterate.
    pub fn dual_error(&self) -> f64 {
        self.du
    }

    /// Outer iterations of the last solve.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Human-readable reason for the last active-set event.
    pub fn last_event(&self) -> &str {
        &self.msg
    }
}

fn check_len(what: &'static str, expected: usize, slice: &[f64]) -> Result<(), ProblemError> {
    if slice.len() != expected {
        return Err(ProblemError::DimensionMismatch {
            what,
            expected,
            actual: slice.len(),
        });
    }
    Ok(())
}
