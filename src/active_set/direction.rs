//! Search-direction construction.
//!
//! The nonsingular path solves the KKT system against the negative Newton
//! residual; the singular path extracts a null-space direction instead and
//! then scales it so that one constraint lands exactly on the state change
//! that restores full rank.

use crate::linalg::{self, qr, sparse};
use crate::problem::{QpProblem, SolverSettings};

use super::kkt;
use super::workspace::Workspace;
use super::{DIRECTION_ROUND_TOL, MIN_STEP_TOL, SINGULARITY_TOL};

/// Rank-restoring active-set change proposed by the singular-step scaling.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Recovery {
    pub index: usize,
    pub sign: i8,
}

/// Outcome of building a search direction.
pub(crate) enum Direction {
    /// Direction ready in (dz, dlam, tinfeas); carries the recovery flip
    /// when the KKT was singular.
    Ready(Option<Recovery>),
    /// Singular KKT with no rank-restoring flip available.
    Unrecoverable,
}

/// Build the primal-dual step (dz, dlam) and the dual-infeasibility tangent
/// for the current factorization.
pub(crate) fn calc_step(ws: &mut Workspace, prob: &QpProblem, set: &SolverSettings) -> Direction {
    let nx = prob.nx();
    // Step in z[..nx] and lam[nx..]
    if !ws.sing {
        kkt::residual(prob, &ws.z, &ws.lbz, &ws.ubz, &ws.lam, &ws.infeas, &mut ws.dz);
        // The stored factorization is of M^T, so solve the transpose
        qr::solve(&mut ws.dz, true, &prob.qr, &ws.nz_v, &ws.nz_r, &ws.beta, &mut ws.w);
    } else {
        qr::colcomb(
            &mut ws.dz,
            &ws.nz_r,
            &prob.qr.sp_r,
            &prob.qr.pc,
            ws.imina,
            0,
            SINGULARITY_TOL,
        );
    }
    // Change in the Lagrangian gradient
    ws.dlam[..nx].fill(0.0);
    sparse::mv(&prob.sp_h, &ws.nz_h, &ws.dz[..nx], &mut ws.dlam[..nx], false);
    sparse::mv(&prob.sp_a, &ws.nz_a, &ws.dz[nx..], &mut ws.dlam[..nx], true);
    linalg::scal(-1.0, &mut ws.dlam[..nx]);
    // Inactive bounds keep a zero multiplier step
    for i in 0..nx {
        if ws.lam[i] == 0.0 {
            ws.dlam[i] = 0.0;
        }
    }
    // The solved tail is the constraint multiplier step; the constraint
    // value step follows from the primal step
    let (dzx, dza) = ws.dz.split_at_mut(nx);
    ws.dlam[nx..].copy_from_slice(dza);
    dza.fill(0.0);
    sparse::mv(&prob.sp_a, &ws.nz_a, dzx, dza, false);
    // Damp denormal drift
    for v in ws.dz.iter_mut() {
        if v.abs() < DIRECTION_ROUND_TOL {
            *v = 0.0;
        }
    }
    // Tangent of the dual infeasibility at tau = 0
    ws.tinfeas.fill(0.0);
    sparse::mv(&prob.sp_h, &ws.nz_h, &ws.dz[..nx], &mut ws.tinfeas, false);
    sparse::mv(&prob.sp_a, &ws.nz_a, &ws.dlam[nx..], &mut ws.tinfeas, true);
    linalg::axpy(1.0, &ws.dlam[..nx], &mut ws.tinfeas);
    scale_step(ws, prob, set)
}

/// In the singular case, choose a scalar for the null-space direction and
/// the constraint whose state change restores regularity without increasing
/// `max(pr, du)`.
fn scale_step(ws: &mut Workspace, prob: &QpProblem, set: &SolverSettings) -> Direction {
    if !ws.sing {
        return Direction::Ready(None);
    }
    let nx = prob.nx();
    let nz = prob.nz();
    // Slope of pr and du along the direction
    let tpr = match ws.ipr {
        None => 0.0,
        Some(ip) => {
            if ws.z[ip] > ws.ubz[ip] {
                ws.dz[ip] / ws.pr
            } else {
                -ws.dz[ip] / ws.pr
            }
        }
    };
    let tdu = match ws.idu {
        None => 0.0,
        Some(id) => ws.tinfeas[id] / ws.infeas[id],
    };
    // Which directions keep max(pr, du) from growing, and the dominant slope
    let mut pos_ok = true;
    let mut neg_ok = true;
    let terr;
    if ws.pr > ws.du {
        if tpr < 0.0 {
            neg_ok = false;
        } else if tpr > 0.0 {
            pos_ok = false;
        }
        terr = tpr;
    } else if ws.pr < ws.du {
        if tdu < 0.0 {
            neg_ok = false;
        } else if tdu > 0.0 {
            pos_ok = false;
        }
        terr = tdu;
    } else if (tpr > 0.0 && tdu < 0.0) || (tpr < 0.0 && tdu > 0.0) {
        // The errors tie and pull in opposite directions
        pos_ok = false;
        neg_ok = false;
        terr = 0.0;
    } else if tpr.min(tdu) < 0.0 {
        neg_ok = false;
        terr = tpr.max(tdu);
    } else if tpr.max(tdu) > 0.0 {
        pos_ok = false;
        terr = tpr.min(tdu);
    } else {
        terr = 0.0;
    }
    // If the primal error dominates and its constraint is active, keep that
    // multiplier from shrinking through zero
    if let Some(ip) = ws.ipr {
        if set.du_to_pr * ws.pr >= ws.du
            && ws.lam[ip] != 0.0
            && ws.dlam[ip].abs() > SINGULARITY_TOL
        {
            if (ws.lam[ip] > 0.0) == (ws.dlam[ip] > 0.0) {
                neg_ok = false;
            } else {
                pos_ok = false;
            }
        }
    }
    // Refactorize the transpose to expose the left null space; the KKT
    // pattern is symmetric so the transposed values fit the same pattern
    sparse::trans(&prob.sp_kkt, &ws.nz_kkt, &prob.sp_kkt, &mut ws.kkt_t, &mut ws.iw);
    ws.nz_kkt.copy_from_slice(&ws.kkt_t);
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
    // Smallest state change that is rank-increasing, direction-permitted and
    // nonincreasing in max(pr, du)
    let mut tau = f64::INFINITY;
    let mut best: Option<Recovery> = None;
    for nulli in 0..info.deficiency {
        qr::colcomb(
            &mut ws.w,
            &ws.nz_r,
            &prob.qr.sp_r,
            &prob.qr.pc,
            info.imina,
            nulli,
            SINGULARITY_TOL,
        );
        for i in 0..nz {
            // The outgoing column must carry a nonzero step
            let step = if i < nx { ws.dz[i] } else { ws.dlam[i] };
            if step.abs() < SINGULARITY_TOL {
                continue;
            }
            // Rank will not increase if the flipped column is orthogonal to
            // the null combination
            if kkt::diff_dot(prob, &ws.nz_h, &ws.nz_a, &ws.nz_at, &ws.w, i).abs()
                < SINGULARITY_TOL
            {
                continue;
            }
            if ws.lam[i] == 0.0 {
                if ws.dz[i].abs() < SINGULARITY_TOL {
                    continue;
                }
                // Step needed to land z[i] on a bound
                if !ws.neverlower[i] {
                    let tau_test = (ws.lbz[i] - ws.z[i]) / ws.dz[i];
                    if !((terr > 0.0 && tau_test > 0.0) || (terr < 0.0 && tau_test < 0.0))
                        && tau_test.abs() >= MIN_STEP_TOL
                        && tau_test.abs() < tau.abs()
                    {
                        tau = tau_test;
                        best = Some(Recovery { index: i, sign: -1 });
                        ws.set_msg(format_args!("enforced lbz[{}] for regularity", i));
                    }
                }
                if !ws.neverupper[i] {
                    let tau_test = (ws.ubz[i] - ws.z[i]) / ws.dz[i];
                    if !((terr > 0.0 && tau_test > 0.0) || (terr < 0.0 && tau_test < 0.0))
                        && tau_test.abs() >= MIN_STEP_TOL
                        && tau_test.abs() < tau.abs()
                    {
                        tau = tau_test;
                        best = Some(Recovery { index: i, sign: 1 });
                        ws.set_msg(format_args!("enforced ubz[{}] for regularity", i));
                    }
                }
            } else {
                if ws.dlam[i].abs() < SINGULARITY_TOL {
                    continue;
                }
                // Step needed to bring the multiplier to zero
                if !ws.neverzero[i] {
                    let tau_test = -ws.lam[i] / ws.dlam[i];
                    if (terr > 0.0 && tau_test > 0.0) || (terr < 0.0 && tau_test < 0.0) {
                        continue;
                    }
                    if (tau_test > 0.0 && !pos_ok) || (tau_test < 0.0 && !neg_ok) {
                        continue;
                    }
                    if tau_test.abs() < tau.abs() {
                        tau = tau_test;
                        best = Some(Recovery { index: i, sign: 0 });
                        let side = if ws.lam[i] > 0.0 { "ubz" } else { "lbz" };
                        ws.set_msg(format_args!("dropped {}[{}] for regularity", side, i));
                    }
                }
            }
        }
    }
    let Some(recovery) = best else {
        return Direction::Unrecoverable;
    };
    // Rescale so that tau = 1 is the full step
    linalg::scal(tau, &mut ws.dz);
    linalg::scal(tau, &mut ws.dlam);
    linalg::scal(tau, &mut ws.tinfeas);
    Direction::Ready(Some(recovery))
}
