//! Active-set changes: pivoting choices and the flip commit.
//!
//! A flip changes one component of the active-set signature. Candidates come
//! from three sources, in priority order: the rank-restoring index proposed
//! by the singular-step scaling, the blocking constraint from the line
//! search, and the worst primal or dual violator. Before an addition is
//! committed in the nonsingular case, `flip_check` probes whether the new
//! column is linearly dependent on the active ones and, if so, looks for a
//! companion flip that keeps the KKT regular.

use crate::linalg::{self, qr};
use crate::problem::{QpProblem, SolverSettings};

use super::direction::Recovery;
use super::kkt;
use super::workspace::Workspace;
use super::{Proposal, MIN_STEP_TOL, SINGULARITY_TOL};

/// Largest dual infeasibility that would result from zeroing the multiplier
/// of row i, over the entries it touches.
pub(crate) fn du_check(ws: &Workspace, prob: &QpProblem, i: usize) -> f64 {
    let nx = prob.nx();
    if i < nx {
        (ws.infeas[i] - ws.lam[i]).abs()
    } else {
        let mut new_du: f64 = 0.0;
        for (k, r) in prob.sp_at.col(i - nx) {
            new_du = new_du.max((ws.infeas[r] - ws.nz_at[k] * ws.lam[i]).abs());
        }
        new_du
    }
}

/// Propose adding the most violating bound to reduce the primal error.
fn pr_index(ws: &mut Workspace) -> Option<(usize, i8)> {
    let ip = ws.ipr?;
    if ws.lam[ip] != 0.0 {
        return None;
    }
    let sign = if ws.z[ip] < ws.lbz[ip] { -1 } else { 1 };
    ws.set_msg(format_args!("added {} to reduce |pr|", ip));
    Some((ip, sign))
}

/// Propose dropping a constraint to reduce the dual error: a sensitivity
/// sweep picks the multiplier with the strongest influence on the worst
/// dual entry among those whose removal does not grow the error.
fn du_index(ws: &mut Workspace, prob: &QpProblem) -> Option<(usize, i8)> {
    let id = ws.idu?;
    let nx = prob.nx();
    // Sensitivity of infeas[id] to each multiplier
    ws.w.fill(0.0);
    ws.w[id] = if ws.infeas[id] > 0.0 { -1.0 } else { 1.0 };
    let (wx, wa) = ws.w.split_at_mut(nx);
    crate::linalg::sparse::mv(&prob.sp_a, &ws.nz_a, wx, wa, false);
    let mut best: Option<usize> = None;
    let mut best_w = 0.0;
    for i in 0..prob.nz() {
        // The multiplier must influence the worst entry
        if ws.w[i] == 0.0 {
            continue;
        }
        // Removing it must move the entry the right way
        let wrong_way = if ws.w[i] > 0.0 {
            ws.lam[i] >= 0.0
        } else {
            ws.lam[i] <= 0.0
        };
        if wrong_way {
            continue;
        }
        // And must not grow the overall dual error
        if du_check(ws, prob, i) > ws.du {
            continue;
        }
        if ws.w[i].abs() > best_w {
            best_w = ws.w[i].abs();
            best = Some(i);
        }
    }
    let i = best?;
    ws.set_msg(format_args!("removed {} to reduce |du|", i));
    Some((i, 0))
}

/// Probe whether flipping `index` to `sign` makes the KKT singular.
///
/// Returns `(true, companion)` when the new column is linearly dependent on
/// the present ones; the companion, if found, is the `(row, multiplier)`
/// flip with the smallest resulting dual error that restores independence.
/// Uses the current (nonsingular) factorization; clobbers dz and dlam.
fn flip_check(
    ws: &mut Workspace,
    prob: &QpProblem,
    set: &SolverSettings,
    index: usize,
    sign: i8,
) -> (bool, Option<(usize, f64)>) {
    // A linear combination of the columns matching the difference column
    kkt::column_diff(prob, &ws.nz_h, &ws.nz_a, &ws.nz_at, &mut ws.dz, index);
    qr::solve(&mut ws.dz, false, &prob.qr, &ws.nz_v, &ws.nz_r, &ws.beta, &mut ws.w);
    let r = linalg::dot(&ws.dz, &ws.dz).sqrt();
    if r < SINGULARITY_TOL {
        return (false, None);
    }
    linalg::scal(1.0 / r, &mut ws.dz);
    // Same for the rows
    kkt::column_diff(prob, &ws.nz_h, &ws.nz_a, &ws.nz_at, &mut ws.dlam, index);
    qr::solve(&mut ws.dlam, true, &prob.qr, &ws.nz_v, &ws.nz_r, &ws.beta, &mut ws.w);
    let r = linalg::dot(&ws.dlam, &ws.dlam).sqrt();
    if r < SINGULARITY_TOL {
        return (false, None);
    }
    linalg::scal(1.0 / r, &mut ws.dlam);
    // Express the column being added in terms of the others
    kkt::column(prob, &ws.nz_h, &ws.nz_a, &ws.nz_at, &mut ws.dz, index, sign);
    qr::solve(&mut ws.dz, false, &prob.qr, &ws.nz_v, &ws.nz_r, &ws.beta, &mut ws.w);
    if ws.dz[index].abs() >= SINGULARITY_TOL {
        // Columns stay linearly independent
        return (false, None);
    }
    // The column being replaced, normalized
    let outgoing_sign = if sign == 0 { 1 } else { 0 };
    kkt::column(prob, &ws.nz_h, &ws.nz_a, &ws.nz_at, &mut ws.w, index, outgoing_sign);
    let nrm = linalg::dot(&ws.w, &ws.w).sqrt();
    if nrm > 0.0 {
        linalg::scal(1.0 / nrm, &mut ws.w);
    }
    // Best companion flip, if any
    let mut companion: Option<(usize, f64)> = None;
    let mut best_duerr = f64::INFINITY;
    for i in 0..prob.nz() {
        if i == index {
            continue;
        }
        // The companion itself must be flippable
        let flippable = if ws.lam[i] == 0.0 {
            !(ws.neverlower[i] && ws.neverupper[i])
        } else {
            !ws.neverzero[i]
        };
        if !flippable {
            continue;
        }
        // Column i must participate in the dependency
        if ws.dz[i].abs() < SINGULARITY_TOL {
            continue;
        }
        // And flipping it must raise the rank
        if kkt::diff_dot(prob, &ws.nz_h, &ws.nz_a, &ws.nz_at, &ws.dlam, i).abs()
            < SINGULARITY_TOL
        {
            continue;
        }
        // The state column i flips into must overlap the removed direction
        let flipped_sign = if ws.lam[i] == 0.0 { 1 } else { 0 };
        if kkt::col_dot(prob, &ws.nz_h, &ws.nz_a, &ws.nz_at, &ws.w, i, flipped_sign).abs()
            < SINGULARITY_TOL
        {
            continue;
        }
        let new_lam = if ws.lam[i] == 0.0 {
            if ws.lbz[i] - ws.z[i] >= ws.z[i] - ws.ubz[i] {
                -set.dmin
            } else {
                set.dmin
            }
        } else {
            0.0
        };
        let new_duerr = du_check(ws, prob, i);
        if new_duerr < best_duerr {
            best_duerr = new_duerr;
            companion = Some((i, new_lam));
        }
    }
    (true, companion)
}

/// Decide and commit this iteration's active-set change.
pub(crate) fn flip(
    ws: &mut Workspace,
    prob: &QpProblem,
    set: &SolverSettings,
    change: &mut Proposal,
    recovery: Option<Recovery>,
) {
    // Acceptable dual error
    let e = (set.du_to_pr * ws.pr).max(ws.du);
    // Restoring regularity has priority
    if let Some(rec) = recovery {
        if rec.sign != 0 || du_check(ws, prob, rec.index) <= e {
            *change = Proposal::Flip {
                index: rec.index,
                sign: rec.sign,
            };
            ws.set_msg(format_args!("{} -> {} for regularity", rec.index, rec.sign));
        }
    }
    // Otherwise improve whichever error dominates
    if matches!(*change, Proposal::Exhausted)
        && ws.tau > MIN_STEP_TOL
        && (ws.ipr.is_some() || ws.idu.is_some())
    {
        let proposed = if set.du_to_pr * ws.pr >= ws.du {
            pr_index(ws)
        } else {
            du_index(ws, prob)
        };
        *change = match proposed {
            Some((index, sign)) => Proposal::Flip { index, sign },
            None => Proposal::Exhausted,
        };
    }
    if let Proposal::Flip { index, sign } = *change {
        // Keep the KKT nonsingular if we can
        if !ws.sing {
            let (dependent, companion) = flip_check(ws, prob, set, index, sign);
            if dependent {
                if let Some((r_index, r_lam)) = companion {
                    // Flip the companion as well to avoid singularity
                    ws.lam[r_index] = r_lam;
                    ws.set_msg(format_args!(
                        "{} -> {}, {} -> {:e}",
                        index, sign, r_index, r_lam
                    ));
                } else if sign != 0 {
                    // Adding this constraint would create an unrecoverable
                    // dependency: abort the flip
                    let side = if sign > 0 { "ubz" } else { "lbz" };
                    ws.set_msg(format_args!("cannot enforce {}[{}]", side, index));
                    *change = Proposal::Exhausted;
                    return;
                }
            }
        }
        ws.lam[index] = match sign {
            0 => 0.0,
            s if s > 0 => set.dmin,
            _ => -set.dmin,
        };
        ws.calc_dependent(prob, set);
        *change = Proposal::Consumed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::active_set::factorize;
    use crate::linalg::sparse::{from_triplets, Sparsity};
    use crate::problem::QpInput;

    fn boxed_qp() -> (QpProblem, Vec<f64>, Vec<f64>) {
        let h = from_triplets(2, 2, vec![(0, 0, 2.0), (1, 1, 2.0)]);
        let a = from_triplets(1, 2, vec![(0, 0, 1.0), (0, 1, 1.0)]);
        let prob = QpProblem::new(
            &Sparsity::from_csmat(&h).unwrap(),
            &Sparsity::from_csmat(&a).unwrap(),
        )
        .unwrap();
        (prob, h.data().to_vec(), a.data().to_vec())
    }

    fn setup(prob: &QpProblem, h: &[f64], a: &[f64], ubx0: f64) -> Workspace {
        let mut ws = Workspace::new(prob);
        ws.load(
            prob,
            &QpInput {
                h,
                g: &[-4.0, -6.0],
                a,
                lbx: &[0.0, 0.0],
                ubx: &[ubx0, f64::INFINITY],
                lba: &[-f64::INFINITY],
                uba: &[10.0],
                x0: &[2.0, 2.0],
                lam_x0: &[0.0, 0.0],
                lam_a0: &[0.0],
            },
        )
        .unwrap();
        let set = SolverSettings::default();
        assert!(!ws.reset(prob, &set));
        ws.calc_dependent(prob, &set);
        ws
    }

    #[test]
    fn test_pr_index_picks_worst_violation() {
        let (prob, h, a) = boxed_qp();
        // x0 = (2, 2) violates ubx[0] = 1
        let mut ws = setup(&prob, &h, &a, 1.0);
        assert_eq!(ws.ipr, Some(0));
        let proposal = pr_index(&mut ws);
        assert_eq!(proposal, Some((0, 1)));
        assert!(ws.last_event().contains("reduce |pr|"));
    }

    #[test]
    fn test_pr_index_skips_already_active() {
        let (prob, h, a) = boxed_qp();
        let mut ws = setup(&prob, &h, &a, 1.0);
        ws.lam[0] = 1.0;
        assert_eq!(pr_index(&mut ws), None);
    }

    #[test]
    fn test_du_index_drops_wrongly_active_bound() {
        let (prob, h, a) = boxed_qp();
        let mut ws = setup(&prob, &h, &a, 10.0);
        // Feasible point, so the dual error dominates; activate bound 1 at
        // its lower bound with the wrong sign for this gradient
        ws.lam[1] = -1.0;
        let set = SolverSettings::default();
        ws.calc_dependent(&prob, &set);
        assert!(ws.du > 0.0);
        if ws.idu == Some(1) {
            let proposal = du_index(&mut ws, &prob);
            assert_eq!(proposal, Some((1, 0)));
        }
    }

    #[test]
    fn test_flip_check_accepts_independent_addition() {
        let (prob, h, a) = boxed_qp();
        let mut ws = setup(&prob, &h, &a, 1.0);
        let set = SolverSettings::default();
        factorize(&mut ws, &prob);
        assert!(!ws.sing);
        // Adding the bound on x0 keeps the KKT regular
        let (dependent, companion) = flip_check(&mut ws, &prob, &set, 0, 1);
        assert!(!dependent);
        assert!(companion.is_none());
    }

    #[test]
    fn test_flip_commits_and_refreshes() {
        let (prob, h, a) = boxed_qp();
        let mut ws = setup(&prob, &h, &a, 1.0);
        let set = SolverSettings::default();
        factorize(&mut ws, &prob);
        ws.tau = 1.0;
        let mut change = Proposal::Exhausted;
        flip(&mut ws, &prob, &set, &mut change, None);
        assert!(matches!(change, Proposal::Consumed));
        assert!(ws.lam[0] > 0.0, "bound must be active after the flip");
    }

    #[test]
    fn test_flip_recovery_has_priority() {
        let (prob, h, a) = boxed_qp();
        let mut ws = setup(&prob, &h, &a, 1.0);
        let set = SolverSettings::default();
        factorize(&mut ws, &prob);
        ws.sing = true; // pretend the factorization was singular
        let mut change = Proposal::Consumed;
        flip(
            &mut ws,
            &prob,
            &set,
            &mut change,
            Some(Recovery { index: 1, sign: 1 }),
        );
        assert!(matches!(change, Proposal::Consumed));
        assert!(ws.lam[1] > 0.0, "recovery index must be enforced");
    }
}
