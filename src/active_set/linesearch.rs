//! Primal and dual blocking line search.
//!
//! Given a direction and an acceptable error budget, the search finds the
//! largest step in [0, 1] that keeps both the bound violations and the dual
//! infeasibility inside the budget. Dual infeasibility is piecewise linear
//! in the step length: every multiplier crossing zero removes its rank-one
//! contribution from the tangent, so the scan walks the sorted breakpoints.

use crate::linalg;
use crate::problem::{QpProblem, SolverSettings};

use super::workspace::Workspace;

/// Active-set change proposed by the primal blocking scan, if any.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Blocking {
    pub index: Option<usize>,
    pub sign: i8,
}

/// Run the full line search and commit the step.
pub(crate) fn linesearch(ws: &mut Workspace, prob: &QpProblem, set: &SolverSettings) -> Blocking {
    let mut index = None;
    let mut sign: i8 = 0;
    // Start from a full step with no active-set change
    ws.tau = 1.0;
    let e_pr = ws.pr.max(ws.du / set.du_to_pr);
    primal_blocking(ws, prob, e_pr, &mut index, &mut sign);
    let e_du = (ws.pr * set.du_to_pr).max(ws.du);
    if dual_blocking(ws, prob, e_du).is_some() {
        // A dual limit truncated the step before the primal blocker
        index = None;
        sign = 0;
    }
    take_step(ws, prob, set);
    Blocking { index, sign }
}

/// Check for a component already past its bound by more than `e` that the
/// direction pushes further; such a step must be rejected at tau = 0.
fn zero_blocking(
    ws: &mut Workspace,
    prob: &QpProblem,
    e: f64,
    index: &mut Option<usize>,
    sign: &mut i8,
) -> bool {
    let mut blocked = false;
    let mut dz_max = 0.0;
    for i in 0..prob.nz() {
        if -ws.dz[i] > dz_max && ws.z[i] <= ws.lbz[i] - e {
            blocked = true;
            dz_max = -ws.dz[i];
            *index = Some(i);
            *sign = -1;
            ws.set_msg(format_args!("lbz[{}] violated at tau=0", i));
        } else if ws.dz[i] > dz_max && ws.z[i] >= ws.ubz[i] + e {
            blocked = true;
            dz_max = ws.dz[i];
            *index = Some(i);
            *sign = 1;
            ws.set_msg(format_args!("ubz[{}] violated at tau=0", i));
        }
    }
    blocked
}

/// Shrink tau until no bound is violated by more than `e`, recording the
/// blocking constraint. A blocker whose multiplier already has the matching
/// sign is a re-enforcement, not an active-set change, and reports no index.
fn primal_blocking(
    ws: &mut Workspace,
    prob: &QpProblem,
    e: f64,
    index: &mut Option<usize>,
    sign: &mut i8,
) {
    if zero_blocking(ws, prob, e, index, sign) {
        ws.tau = 0.0;
        return;
    }
    for i in 0..prob.nz() {
        if ws.dz[i] == 0.0 {
            continue;
        }
        let trial_z = ws.z[i] + ws.tau * ws.dz[i];
        if ws.dz[i] < 0.0 && trial_z < ws.lbz[i] - e {
            ws.tau = (ws.lbz[i] - e - ws.z[i]) / ws.dz[i];
            *index = if ws.lam[i] < 0.0 { None } else { Some(i) };
            *sign = -1;
            ws.set_msg(format_args!("enforcing lbz[{}]", i));
        } else if ws.dz[i] > 0.0 && trial_z > ws.ubz[i] + e {
            ws.tau = (ws.ubz[i] + e - ws.z[i]) / ws.dz[i];
            *index = if ws.lam[i] > 0.0 { None } else { Some(i) };
            *sign = 1;
            ws.set_msg(format_args!("enforcing ubz[{}]", i));
        }
        if ws.tau <= 0.0 {
            return;
        }
    }
}

/// Collect the multiplier zero crossings in (0, tau) into the breakpoint
/// list, ascending, with the terminal interval end last. Returns the list
/// length.
pub(crate) fn dual_breakpoints(ws: &mut Workspace, prob: &QpProblem, tau: f64) -> usize {
    ws.bp_tau[0] = tau;
    ws.bp_ind[0] = None;
    let mut n_tau = 1;
    for i in 0..prob.nz() {
        if ws.dlam[i] == 0.0 || ws.lam[i] == 0.0 {
            continue;
        }
        let trial_lam = ws.lam[i] + tau * ws.dlam[i];
        let crosses = if ws.lam[i] > 0.0 {
            trial_lam < 0.0
        } else {
            trial_lam > 0.0
        };
        if !crosses {
            continue;
        }
        let new_tau = -ws.lam[i] / ws.dlam[i];
        // Insertion position among the interior points
        let mut loc = 0;
        while loc < n_tau - 1 && new_tau >= ws.bp_tau[loc] {
            loc += 1;
        }
        n_tau += 1;
        let mut next_tau = new_tau;
        let mut next_ind = Some(i);
        for j in loc..n_tau {
            std::mem::swap(&mut ws.bp_tau[j], &mut next_tau);
            std::mem::swap(&mut ws.bp_ind[j], &mut next_ind);
        }
    }
    n_tau
}

/// Walk the breakpoints, advancing the dual infeasibility along the tangent
/// and downdating the tangent at every crossing. Truncates tau to the point
/// where some component would exceed `e`; returns that component if any.
fn dual_blocking(ws: &mut Workspace, prob: &QpProblem, e: f64) -> Option<usize> {
    let nx = prob.nx();
    let n_tau = dual_breakpoints(ws, prob, ws.tau);
    let mut du_index = None;
    let mut tau_k = 0.0;
    for j in 0..n_tau {
        // Distance to the next breakpoint (may be zero)
        let dtau = ws.bp_tau[j] - tau_k;
        for k in 0..nx {
            let new_infeas = ws.infeas[k] + dtau * ws.tinfeas[k];
            if new_infeas.abs() > e {
                let limit = if new_infeas > 0.0 { e } else { -e };
                let tau1 = 0.0_f64.max(tau_k + (limit - ws.infeas[k]) / ws.tinfeas[k]);
                if tau1 < ws.tau {
                    ws.tau = tau1;
                    du_index = Some(k);
                }
            }
        }
        // Advance to the accepted point within this interval
        let adv = (ws.tau - tau_k).min(dtau);
        linalg::axpy(adv, &ws.tinfeas, &mut ws.infeas);
        if du_index.is_some() {
            return du_index;
        }
        tau_k = ws.bp_tau[j];
        let Some(i) = ws.bp_ind[j] else {
            break;
        };
        // The multiplier of i reaches zero here: remove its contribution
        // from the tangent (equality rows keep theirs and flip sign)
        if !ws.neverzero[i] {
            if i < nx {
                ws.tinfeas[i] -= ws.dlam[i];
            } else {
                for (k, r) in prob.sp_at.col(i - nx) {
                    ws.tinfeas[r] -= ws.nz_at[k] * ws.dlam[i];
                }
            }
        }
    }
    du_index
}

/// Commit the step, preserving the active-set signature against numerical
/// drift: multipliers keep their pre-step sign (with magnitude at least
/// dmin) unless the row is an equality, which may flip freely.
pub(crate) fn take_step(ws: &mut Workspace, prob: &QpProblem, set: &SolverSettings) {
    let nz = prob.nz();
    for i in 0..nz {
        ws.sign_w[i] = if ws.lam[i] > 0.0 {
            1
        } else if ws.lam[i] < 0.0 {
            -1
        } else {
            0
        };
    }
    linalg::axpy(ws.tau, &ws.dz, &mut ws.z);
    linalg::axpy(ws.tau, &ws.dlam, &mut ws.lam);
    for i in 0..nz {
        let flipped = if ws.sign_w[i] < 0 {
            ws.lam[i] > 0.0
        } else {
            ws.lam[i] < 0.0
        };
        if ws.neverzero[i] && flipped {
            ws.sign_w[i] = -ws.sign_w[i];
        }
        match ws.sign_w[i] {
            -1 => ws.lam[i] = ws.lam[i].min(-set.dmin),
            1 => ws.lam[i] = ws.lam[i].max(set.dmin),
            _ => ws.lam[i] = 0.0,
        }
    }
}
