//! End-to-end tests for the active-set QP solver.
//!
//! Covers the full pipeline on small problems with known solutions, the
//! failure modes (infeasible bounds, unrecoverable singularity), boundary
//! shapes (no constraints, pinned variables), and the KKT invariants at a
//! successful return.

use asqp::linalg::sparse::{from_triplets, Sparsity};
use asqp::{solve_qp, QpInput, QpProblem, SolveStatus, SolverSettings, Workspace};
use sprs::CsMat;

const TOL: f64 = 1e-8;

/// Stationarity, complementarity and feasibility at a claimed solution.
fn check_kkt(
    h: &CsMat<f64>,
    g: &[f64],
    a: &CsMat<f64>,
    lbx: &[f64],
    ubx: &[f64],
    lba: &[f64],
    uba: &[f64],
    x: &[f64],
    lam_x: &[f64],
    lam_a: &[f64],
) {
    let nx = g.len();
    let na = lba.len();
    // Stationarity: g + H x + A^T lam_a + lam_x = 0
    let mut grad = g.to_vec();
    for (&v, (r, c)) in h.iter() {
        grad[r] += v * x[c];
    }
    for (&v, (r, c)) in a.iter() {
        grad[c] += v * lam_a[r];
    }
    for i in 0..nx {
        grad[i] += lam_x[i];
        assert!(
            grad[i].abs() <= 1e-6,
            "stationarity violated at {}: {}",
            i,
            grad[i]
        );
    }
    // Constraint values
    let mut ax = vec![0.0; na];
    for (&v, (r, c)) in a.iter() {
        ax[r] += v * x[c];
    }
    // Complementarity and feasibility on both blocks
    let check_row = |z: f64, lb: f64, ub: f64, lam: f64, what: &str| {
        assert!(z >= lb - 1e-6 && z <= ub + 1e-6, "{} out of bounds: {}", what, z);
        if lam > 1e-10 {
            assert!((z - ub).abs() <= 1e-6, "{}: upper bound not tight", what);
        } else if lam < -1e-10 {
            assert!((z - lb).abs() <= 1e-6, "{}: lower bound not tight", what);
        }
    };
    for i in 0..nx {
        check_row(x[i], lbx[i], ubx[i], lam_x[i], "variable");
    }
    for i in 0..na {
        check_row(ax[i], lba[i], uba[i], lam_a[i], "constraint");
    }
}

#[test]
fn test_tiny_box_qp() {
    // min x0^2 + x1^2 - 4 x0 - 6 x1, x >= 0: unconstrained minimizer is
    // feasible, so the bounds never activate
    let h = from_triplets(2, 2, vec![(0, 0, 2.0), (1, 1, 2.0)]);
    let a = from_triplets(0, 2, vec![]);
    let g = [-4.0, -6.0];
    let lbx = [0.0, 0.0];
    let ubx = [f64::INFINITY, f64::INFINITY];
    let sol = solve_qp(&h, &g, &a, &lbx, &ubx, &[], &[], &SolverSettings::default()).unwrap();
    assert_eq!(sol.status, SolveStatus::Solved);
    assert!((sol.x[0] - 2.0).abs() < TOL, "x = {:?}", sol.x);
    assert!((sol.x[1] - 3.0).abs() < TOL, "x = {:?}", sol.x);
    assert!(sol.lam_x[0].abs() < TOL && sol.lam_x[1].abs() < TOL);
    assert!((sol.f + 13.0).abs() < TOL, "f = {}", sol.f);
    // Unconstrained case must need exactly one factorization and one step
    assert_eq!(sol.iterations, 1);
    check_kkt(&h, &g, &a, &lbx, &ubx, &[], &[], &sol.x, &sol.lam_x, &sol.lam_a);
}

#[test]
fn test_active_upper_bound() {
    // Same objective with ubx[0] = 1: the bound activates
    let h = from_triplets(2, 2, vec![(0, 0, 2.0), (1, 1, 2.0)]);
    let a = from_triplets(0, 2, vec![]);
    let g = [-4.0, -6.0];
    let lbx = [0.0, 0.0];
    let ubx = [1.0, f64::INFINITY];
    let sol = solve_qp(&h, &g, &a, &lbx, &ubx, &[], &[], &SolverSettings::default()).unwrap();
    assert_eq!(sol.status, SolveStatus::Solved);
    assert!((sol.x[0] - 1.0).abs() < TOL, "x = {:?}", sol.x);
    assert!((sol.x[1] - 3.0).abs() < TOL, "x = {:?}", sol.x);
    assert!(sol.lam_x[0] > 0.0, "upper bound multiplier must be positive");
    assert!(sol.lam_x[1].abs() < TOL);
    assert!((sol.f + 12.5).abs() < TOL, "f = {}", sol.f);
    check_kkt(&h, &g, &a, &lbx, &ubx, &[], &[], &sol.x, &sol.lam_x, &sol.lam_a);
}

#[test]
fn test_equality_constrained() {
    // min (1/2)(x0^2 + x1^2) s.t. x0 + x1 = 1
    let h = from_triplets(2, 2, vec![(0, 0, 1.0), (1, 1, 1.0)]);
    let a = from_triplets(1, 2, vec![(0, 0, 1.0), (0, 1, 1.0)]);
    let g = [0.0, 0.0];
    let inf = f64::INFINITY;
    let sol = solve_qp(
        &h,
        &g,
        &a,
        &[-inf, -inf],
        &[inf, inf],
        &[1.0],
        &[1.0],
        &SolverSettings::default(),
    )
    .unwrap();
    assert_eq!(sol.status, SolveStatus::Solved);
    assert!((sol.x[0] - 0.5).abs() < TOL, "x = {:?}", sol.x);
    assert!((sol.x[1] - 0.5).abs() < TOL, "x = {:?}", sol.x);
    assert!(
        (sol.lam_a[0].abs() - 0.5).abs() < TOL,
        "equality multiplier magnitude must be 0.5, got {}",
        sol.lam_a[0]
    );
    assert!((sol.f - 0.25).abs() < TOL, "f = {}", sol.f);
}

#[test]
fn test_infeasible_bounds() {
    // lbx > ubx must be rejected in reset, before any factorization
    let h = from_triplets(1, 1, vec![(0, 0, 1.0)]);
    let a = from_triplets(0, 1, vec![]);
    let sol = solve_qp(
        &h,
        &[0.0],
        &a,
        &[1.0],
        &[0.0],
        &[],
        &[],
        &SolverSettings::default(),
    )
    .unwrap();
    assert_eq!(sol.status, SolveStatus::InfeasibleBounds);
    assert_eq!(sol.iterations, 0);
}

#[test]
fn test_singular_hessian_without_bounds() {
    // H = [[1, 1], [1, 1]] is rank one and the problem has no bounds to
    // activate: the solver must stop cleanly, not diverge
    let h = from_triplets(
        2,
        2,
        vec![(0, 0, 1.0), (0, 1, 1.0), (1, 0, 1.0), (1, 1, 1.0)],
    );
    let a = from_triplets(0, 2, vec![]);
    let inf = f64::INFINITY;
    let sol = solve_qp(
        &h,
        &[-1.0, -1.0],
        &a,
        &[-inf, -inf],
        &[inf, inf],
        &[],
        &[],
        &SolverSettings::default(),
    )
    .unwrap();
    match sol.status {
        SolveStatus::Singular => {}
        SolveStatus::Solved => {
            // Any point on x0 + x1 = 1 is optimal
            assert!((sol.x[0] + sol.x[1] - 1.0).abs() < 1e-6, "x = {:?}", sol.x);
        }
        other => panic!("unexpected status {:?}", other),
    }
    assert!(sol.x.iter().all(|v| v.is_finite()));
}

#[test]
fn test_warm_start_idempotence() {
    // Converge, then resolve in place: the second run must exit in the
    // first convergence check with the iterate untouched
    let h = from_triplets(2, 2, vec![(0, 0, 2.0), (1, 1, 2.0)]);
    let a = from_triplets(0, 2, vec![]);
    let prob = QpProblem::new(
        &Sparsity::from_csmat(&h).unwrap(),
        &Sparsity::from_csmat(&a).unwrap(),
    )
    .unwrap();
    let set = SolverSettings::default();
    let mut ws = Workspace::new(&prob);
    let status = ws
        .solve(
            &prob,
            &QpInput {
                h: h.data(),
                g: &[-4.0, -6.0],
                a: a.data(),
                lbx: &[0.0, 0.0],
                ubx: &[1.0, f64::INFINITY],
                lba: &[],
                uba: &[],
                x0: &[0.0, 0.0],
                lam_x0: &[0.0, 0.0],
                lam_a0: &[],
            },
            &set,
        )
        .unwrap();
    assert_eq!(status, SolveStatus::Solved);
    let x_before = ws.primal().to_vec();
    let lam_before = ws.multipliers().to_vec();

    let status = ws.resolve(&prob, &set);
    assert_eq!(status, SolveStatus::Solved);
    assert_eq!(ws.iterations(), 0, "warm resolve must not iterate");
    assert_eq!(ws.primal(), &x_before[..]);
    assert_eq!(ws.multipliers(), &lam_before[..]);
}

#[test]
fn test_pinned_variable() {
    // Degenerate bound lbx[0] = ubx[0]: the variable is pinned and its
    // multiplier may take either sign
    let h = from_triplets(2, 2, vec![(0, 0, 2.0), (1, 1, 2.0)]);
    let a = from_triplets(0, 2, vec![]);
    let sol = solve_qp(
        &h,
        &[1.0, -6.0],
        &a,
        &[0.5, 0.0],
        &[0.5, f64::INFINITY],
        &[],
        &[],
        &SolverSettings::default(),
    )
    .unwrap();
    assert_eq!(sol.status, SolveStatus::Solved);
    assert!((sol.x[0] - 0.5).abs() < TOL, "pinned variable moved: {:?}", sol.x);
    assert!((sol.x[1] - 3.0).abs() < TOL, "x = {:?}", sol.x);
    assert!(sol.lam_x[0] != 0.0, "pinned variable must stay active");
}

#[test]
fn test_all_equality_rows() {
    // Every row an equality: both variables pinned, objective irrelevant
    let h = from_triplets(2, 2, vec![(0, 0, 1.0), (1, 1, 1.0)]);
    let a = from_triplets(0, 2, vec![]);
    let sol = solve_qp(
        &h,
        &[1.0, 1.0],
        &a,
        &[0.5, -0.25],
        &[0.5, -0.25],
        &[],
        &[],
        &SolverSettings::default(),
    )
    .unwrap();
    assert_eq!(sol.status, SolveStatus::Solved);
    assert!((sol.x[0] - 0.5).abs() < TOL);
    assert!((sol.x[1] + 0.25).abs() < TOL);
    assert!(sol.lam_x[0] != 0.0 && sol.lam_x[1] != 0.0);
}

#[test]
fn test_inequality_qp_kkt_invariants() {
    // Two coupled inequality rows plus bounds; verify the KKT conditions
    // rather than a closed-form solution
    let h = from_triplets(
        4,
        4,
        vec![
            (0, 0, 4.0),
            (0, 1, 1.0),
            (1, 0, 1.0),
            (1, 1, 3.0),
            (2, 2, 2.0),
            (3, 3, 1.0),
        ],
    );
    let a = from_triplets(2, 4, vec![(0, 0, 1.0), (0, 1, 1.0), (1, 2, 1.0), (1, 3, 1.0)]);
    let g = [-1.0, -2.0, -3.0, -4.0];
    let inf = f64::INFINITY;
    let lbx = [0.0; 4];
    let ubx = [inf; 4];
    let lba = [-inf, -inf];
    let uba = [1.0, 1.0];
    let sol = solve_qp(&h, &g, &a, &lbx, &ubx, &lba, &uba, &SolverSettings::default()).unwrap();
    assert_eq!(
        sol.status,
        SolveStatus::Solved,
        "failed after {} iterations",
        sol.iterations
    );
    check_kkt(&h, &g, &a, &lbx, &ubx, &lba, &uba, &sol.x, &sol.lam_x, &sol.lam_a);
}

#[test]
fn test_deterministic_repeat() {
    // Identical inputs must give bit-identical outputs
    let h = from_triplets(2, 2, vec![(0, 0, 2.0), (1, 1, 2.0)]);
    let a = from_triplets(1, 2, vec![(0, 0, 1.0), (0, 1, 2.0)]);
    let run = || {
        solve_qp(
            &h,
            &[-4.0, -6.0],
            &a,
            &[0.0, 0.0],
            &[1.0, f64::INFINITY],
            &[-f64::INFINITY],
            &[2.0],
            &SolverSettings::default(),
        )
        .unwrap()
    };
    let first = run();
    let second = run();
    assert_eq!(first.status, second.status);
    assert_eq!(first.iterations, second.iterations);
    for i in 0..2 {
        assert_eq!(first.x[i].to_bits(), second.x[i].to_bits());
        assert_eq!(first.lam_x[i].to_bits(), second.lam_x[i].to_bits());
    }
}

#[test]
fn test_max_iter_returns_last_iterate() {
    let h = from_triplets(2, 2, vec![(0, 0, 2.0), (1, 1, 2.0)]);
    let a = from_triplets(0, 2, vec![]);
    let settings = SolverSettings {
        max_iter: 0,
        ..Default::default()
    };
    let sol = solve_qp(
        &h,
        &[-4.0, -6.0],
        &a,
        &[0.0, 0.0],
        &[f64::INFINITY, f64::INFINITY],
        &[],
        &[],
        &settings,
    )
    .unwrap();
    assert_eq!(sol.status, SolveStatus::MaxIter);
    assert!(sol.x.iter().all(|v| v.is_finite()));
}

#[test]
fn test_work_size_matches_allocation() {
    let h = from_triplets(3, 3, vec![(0, 0, 2.0), (1, 1, 2.0), (2, 2, 2.0), (0, 1, 0.5), (1, 0, 0.5)]);
    let a = from_triplets(2, 3, vec![(0, 0, 1.0), (0, 2, 1.0), (1, 1, 1.0)]);
    let prob = QpProblem::new(
        &Sparsity::from_csmat(&h).unwrap(),
        &Sparsity::from_csmat(&a).unwrap(),
    )
    .unwrap();
    let ws = prob.work_size();
    // Persistent float storage: values + iterate + direction + factors
    let nnz_h = 5;
    let nnz_a = 3;
    let nz = 5;
    let nx = 3;
    let nnz_kkt = prob.kkt_pattern().nnz();
    // Dense symbolic factors: full triangles
    let nnz_tri = nz * (nz + 1) / 2;
    let expect_w = nnz_h + 2 * nnz_a + nx + 6 * nz + 2 * nx + 2 * nnz_kkt
        + 2 * nnz_tri + nz + nz + nz + 1;
    assert_eq!(ws.sz_w, expect_w);
    assert_eq!(ws.sz_iw, 6 * nz + 1);
}
