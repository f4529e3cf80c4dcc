//! KKT system assembly and products.
//!
//! The KKT matrix for the current active set has the block structure
//!
//! ```text
//!       [ H_active    A^T_active  ]
//!   M = [                         ]
//!       [ A_active   -I_inactive  ]
//! ```
//!
//! where row i is replaced by `e_i` (i < nx) or kept as the constraint row
//! (i >= nx) when the multiplier of row i is nonzero. Assembly walks the
//! conceptual rows and scatters each into the stored column, so the stored
//! matrix is M^T; the direction solve accounts for this by solving the
//! transposed system.

use crate::problem::QpProblem;

/// Assemble the full KKT matrix for the active set given by the signs of
/// `lam`, writing the values of M^T onto the KKT pattern. `w` is dense
/// scratch of length nz.
pub(crate) fn assemble(
    prob: &QpProblem,
    nz_h: &[f64],
    nz_a: &[f64],
    nz_at: &[f64],
    lam: &[f64],
    w: &mut [f64],
    nz_kkt: &mut [f64],
) {
    let nx = prob.nx();
    w.fill(0.0);
    for i in 0..prob.nz() {
        // Materialize row i of the KKT into w
        if i < nx {
            if lam[i] == 0.0 {
                for (k, r) in prob.sp_h.col(i) {
                    w[r] = nz_h[k];
                }
                for (k, r) in prob.sp_a.col(i) {
                    w[nx + r] = nz_a[k];
                }
            } else {
                w[i] = 1.0;
            }
        } else if lam[i] == 0.0 {
            w[i] = -1.0;
        } else {
            for (k, r) in prob.sp_at.col(i - nx) {
                w[r] = nz_at[k];
            }
        }
        // Gather onto the stored column, clearing w as we go
        for (k, r) in prob.sp_kkt.col(i) {
            nz_kkt[k] = w[r];
            w[r] = 0.0;
        }
    }
}

/// Column i of the KKT assuming the given activity: `sign == 0` builds the
/// inactive column, any other sign the active one. Does not touch the
/// stored matrix.
pub(crate) fn column(
    prob: &QpProblem,
    nz_h: &[f64],
    nz_a: &[f64],
    nz_at: &[f64],
    out: &mut [f64],
    i: usize,
    sign: i8,
) {
    let nx = prob.nx();
    out.fill(0.0);
    if i < nx {
        if sign == 0 {
            for (k, r) in prob.sp_h.col(i) {
                out[r] = nz_h[k];
            }
            for (k, r) in prob.sp_a.col(i) {
                out[nx + r] = nz_a[k];
            }
        } else {
            out[i] = 1.0;
        }
    } else if sign == 0 {
        out[i] = -1.0;
    } else {
        for (k, r) in prob.sp_at.col(i - nx) {
            out[r] = nz_at[k];
        }
    }
}

/// Difference between the inactive and active versions of column i; used to
/// probe linear dependence when flipping i.
pub(crate) fn column_diff(
    prob: &QpProblem,
    nz_h: &[f64],
    nz_a: &[f64],
    nz_at: &[f64],
    out: &mut [f64],
    i: usize,
) {
    let nx = prob.nx();
    out.fill(0.0);
    if i < nx {
        for (k, r) in prob.sp_h.col(i) {
            out[r] = nz_h[k];
        }
        for (k, r) in prob.sp_a.col(i) {
            out[nx + r] = nz_a[k];
        }
    } else {
        for (k, r) in prob.sp_at.col(i - nx) {
            out[r] = -nz_at[k];
        }
    }
    out[i] -= 1.0;
}

/// Scalar product of `v` with the column [`column`] would build.
pub(crate) fn col_dot(
    prob: &QpProblem,
    nz_h: &[f64],
    nz_a: &[f64],
    nz_at: &[f64],
    v: &[f64],
    i: usize,
    sign: i8,
) -> f64 {
    let nx = prob.nx();
    if i < nx {
        if sign == 0 {
            let mut r = 0.0;
            for (k, row) in prob.sp_h.col(i) {
                r += v[row] * nz_h[k];
            }
            for (k, row) in prob.sp_a.col(i) {
                r += v[nx + row] * nz_a[k];
            }
            r
        } else {
            v[i]
        }
    } else if sign == 0 {
        -v[i]
    } else {
        let mut r = 0.0;
        for (k, row) in prob.sp_at.col(i - nx) {
            r += v[row] * nz_at[k];
        }
        r
    }
}

/// Scalar product of `v` with the column difference of row i (up to sign).
pub(crate) fn diff_dot(
    prob: &QpProblem,
    nz_h: &[f64],
    nz_a: &[f64],
    nz_at: &[f64],
    v: &[f64],
    i: usize,
) -> f64 {
    let nx = prob.nx();
    let mut r = v[i];
    if i < nx {
        for (k, row) in prob.sp_h.col(i) {
            r -= v[row] * nz_h[k];
        }
        for (k, row) in prob.sp_a.col(i) {
            r -= v[nx + row] * nz_a[k];
        }
    } else {
        for (k, row) in prob.sp_at.col(i - nx) {
            r += v[row] * nz_at[k];
        }
    }
    r
}

/// Negative Newton residual driving the iteration: bound residuals on
/// active rows, dual residuals on inactive ones.
pub(crate) fn residual(
    prob: &QpProblem,
    z: &[f64],
    lbz: &[f64],
    ubz: &[f64],
    lam: &[f64],
    infeas: &[f64],
    r: &mut [f64],
) {
    let nx = prob.nx();
    for i in 0..prob.nz() {
        r[i] = if lam[i] > 0.0 {
            ubz[i] - z[i]
        } else if lam[i] < 0.0 {
            lbz[i] - z[i]
        } else if i < nx {
            -infeas[i]
        } else {
            0.0
        };
    }
}
