//! Active-set iteration engine.
//!
//! One outer iteration refreshes the dependent quantities, checks
//! convergence, factorizes the KKT system for the current signature, builds
//! a search direction (with singularity recovery if needed), runs the
//! primal/dual blocking line search, and commits the resulting active-set
//! change before looping. The loop terminates on tolerance, on the
//! iteration cap, on infeasible bounds, or on an unrecoverable singularity.

pub mod workspace;

mod direction;
mod flip;
mod kkt;
mod linesearch;

use crate::linalg::qr;
use crate::problem::{ProblemError, QpInput, QpProblem, SolveStatus, SolverSettings};

use direction::Direction;
use workspace::Workspace;

impl Workspace {
    /// Load one solve's inputs and run the active-set loop.
    pub fn solve(
        &mut self,
        prob: &QpProblem,
        input: &QpInput,
        settings: &SolverSettings,
    ) -> Result<SolveStatus, ProblemError> {
        self.load(prob, input)?;
        Ok(run(self, prob, settings))
    }

    /// Re-run the loop on the current iterate without reloading inputs.
    /// A converged instance returns within the first convergence check.
    pub fn resolve(&mut self, prob: &QpProblem, settings: &SolverSettings) -> SolveStatus {
        run(self, prob, settings)
    }
}

/// Absolute threshold on diagonal entries of R below which the KKT system
/// is treated as singular; also used for the linear dependence probes.
pub(crate) const SINGULARITY_TOL: f64 = 1e-12;

/// Direction components smaller than this are rounded to zero to damp
/// denormal drift.
pub(crate) const DIRECTION_ROUND_TOL: f64 = 1e-14;

/// Steps shorter than this do not count as progress.
pub(crate) const MIN_STEP_TOL: f64 = 1e-16;

/// Active-set change being negotiated within one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Proposal {
    /// A flip was just committed.
    Consumed,
    /// The line search and pivoting found nothing to change.
    Exhausted,
    /// Flip row `index` to the given multiplier sign (0 drops it).
    Flip { index: usize, sign: i8 },
}

/// Assemble and factorize the KKT system for the current active set, then
/// probe it for singularity.
pub(crate) fn factorize(ws: &mut Workspace, prob: &QpProblem) {
    kkt::assemble(
        prob,
        &ws.nz_h,
        &ws.nz_a,
        &ws.nz_at,
        &ws.lam,
        &mut ws.w,
        &mut ws.nz_kkt,
    );
    qr::factor(
        &prob.sp_kkt,
        &ws.nz_kkt,
        &prob.qr,
        &mut ws.nz_v,
        &mut ws.nz_r,
        &mut ws.beta,
        &mut ws.w,
    );
    let info = qr::singular(&ws.nz_r, &prob.qr.sp_r, SINGULARITY_TOL);
    ws.sing = info.deficiency > 0;
    ws.mina = info.mina;
    ws.imina = info.imina;
}

/// Run the outer active-set loop on loaded data. The iterate in the
/// workspace is the solution on `Solved` and the last state otherwise.
///
/// Each iteration: refresh dependents, check convergence, factorize,
/// build the direction, line search, flip. The flip commits in the same
/// iteration as the line search that proposed it, with the error budget
/// built from the dependents refreshed at the top of that iteration.
pub(crate) fn run(ws: &mut Workspace, prob: &QpProblem, set: &SolverSettings) -> SolveStatus {
    if ws.reset(prob, set) {
        return SolveStatus::InfeasibleBounds;
    }
    let mut iter = 0;
    loop {
        ws.calc_dependent(prob, set);
        if ws.pr <= set.tol_pr && ws.du <= set.tol_du {
            ws.iterations = iter;
            return SolveStatus::Solved;
        }
        if iter >= set.max_iter {
            ws.iterations = iter;
            return SolveStatus::MaxIter;
        }
        iter += 1;
        if set.print_iter {
            print_iteration(ws, iter);
        }
        factorize(ws, prob);
        let recovery = match direction::calc_step(ws, prob, set) {
            Direction::Ready(rec) => rec,
            Direction::Unrecoverable => {
                ws.iterations = iter;
                return SolveStatus::Singular;
            }
        };
        let blocking = linesearch::linesearch(ws, prob, set);
        let mut change = match blocking.index {
            Some(index) => Proposal::Flip {
                index,
                sign: blocking.sign,
            },
            None => Proposal::Exhausted,
        };
        flip::flip(ws, prob, set, &mut change, recovery);
    }
}

fn print_iteration(ws: &Workspace, iter: usize) {
    if (iter - 1) % 10 == 0 {
        println!(
            "{:>6} {:>13} {:>10} {:>5} {:>10} {:>5} {:>9} {:>9}  {}",
            "iter", "f", "pr", "ipr", "du", "idu", "mina", "tau", "event"
        );
    }
    let fmt_ind = |ind: Option<usize>| ind.map_or("-".to_string(), |i| i.to_string());
    println!(
        "{:>6} {:>13.6e} {:>10.3e} {:>5} {:>10.3e} {:>5} {:>9.2e} {:>9.2e}  {}",
        iter,
        ws.f,
        ws.pr,
        fmt_ind(ws.ipr),
        ws.du,
        fmt_ind(ws.idu),
        ws.mina,
        ws.tau,
        ws.last_event()
    );
}
