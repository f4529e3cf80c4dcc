//! Sparse Householder QR over precomputed symbolic factors.
//!
//! The numeric factorization consumes a symbolic description of the factors
//! ([`QrSymbolic`]): the structural patterns of V (the Householder vectors)
//! and R, plus a row permutation `prinv` and a column permutation `pc`. With
//! B defined by `B[prinv[r], c] = A[r, pc[c]]`, the factorization computes
//! `B = Q R` where Q is the product of the stored reflections.
//!
//! Symbolic analysis itself is not performed here. Callers with a real
//! elimination analysis supply their own factors; [`QrSymbolic::dense`]
//! provides a conservative fallback (full triangles, identity permutations)
//! that is a superset of any true fill and therefore valid for every input
//! pattern of the same dimension.

use super::sparse::Sparsity;
use crate::problem::ProblemError;

/// Symbolic QR factors: V and R patterns plus row/column permutations.
///
/// Invariants, checked by [`QrSymbolic::new`]:
/// - column `c` of V has row `c` as its first entry (the reflection pivot),
/// - column `c` of R is upper triangular with the diagonal as its last entry,
/// - `prinv` and `pc` are permutations of `0..n`.
#[derive(Debug, Clone)]
pub struct QrSymbolic {
    /// Pattern of the Householder vectors.
    pub sp_v: Sparsity,
    /// Pattern of the triangular factor.
    pub sp_r: Sparsity,
    /// Row permutation: original row `r` maps to permuted position `prinv[r]`.
    pub prinv: Vec<usize>,
    /// Column permutation: permuted column `c` is original column `pc[c]`.
    pub pc: Vec<usize>,
}

impl QrSymbolic {
    /// Validate and assemble caller-provided symbolic factors.
    pub fn new(
        sp_v: Sparsity,
        sp_r: Sparsity,
        prinv: Vec<usize>,
        pc: Vec<usize>,
    ) -> Result<Self, ProblemError> {
        let n = sp_v.ncol();
        if sp_r.nrow() != n || sp_r.ncol() != n || sp_v.nrow() < n {
            return Err(ProblemError::InvalidSparsity(
                "QR factor patterns have inconsistent dimensions".to_string(),
            ));
        }
        for c in 0..n {
            match sp_v.col(c).next() {
                Some((_, r)) if r == c => {}
                _ => {
                    return Err(ProblemError::InvalidSparsity(format!(
                        "V column {} does not start at the diagonal",
                        c
                    )))
                }
            }
            match sp_r.col(c).last() {
                Some((_, r)) if r == c => {}
                _ => {
                    return Err(ProblemError::InvalidSparsity(format!(
                        "R column {} does not end at the diagonal",
                        c
                    )))
                }
            }
        }
        for perm in [&prinv, &pc] {
            if perm.len() != n {
                return Err(ProblemError::InvalidSparsity(
                    "permutation length does not match the factor dimension".to_string(),
                ));
            }
            let mut seen = vec![false; n];
            for &p in perm {
                if p >= n || seen[p] {
                    return Err(ProblemError::InvalidSparsity(
                        "row/column permutation is not a permutation".to_string(),
                    ));
                }
                seen[p] = true;
            }
        }
        Ok(Self {
            sp_v,
            sp_r,
            prinv,
            pc,
        })
    }

    /// Conservative symbolic factors for an n-by-n matrix: identity
    /// permutations, full lower-triangular V and full upper-triangular R.
    pub fn dense(n: usize) -> Self {
        let mut v_colptr = Vec::with_capacity(n + 1);
        let mut v_rowind = Vec::with_capacity(n * (n + 1) / 2);
        let mut r_colptr = Vec::with_capacity(n + 1);
        let mut r_rowind = Vec::with_capacity(n * (n + 1) / 2);
        v_colptr.push(0);
        r_colptr.push(0);
        for c in 0..n {
            v_rowind.extend(c..n);
            v_colptr.push(v_rowind.len());
            r_rowind.extend(0..=c);
            r_colptr.push(r_rowind.len());
        }
        Self {
            sp_v: Sparsity::from_parts_unchecked(n, n, v_colptr, v_rowind),
            sp_r: Sparsity::from_parts_unchecked(n, n, r_colptr, r_rowind),
            prinv: (0..n).collect(),
            pc: (0..n).collect(),
        }
    }

    /// Dimension of the factored matrix.
    pub fn dim(&self) -> usize {
        self.sp_v.ncol()
    }
}

/// Result of a singularity probe over the diagonal of R.
#[derive(Debug, Clone, Copy)]
pub struct SingularInfo {
    /// Number of diagonal entries below the threshold.
    pub deficiency: usize,
    /// Smallest diagonal magnitude.
    pub mina: f64,
    /// Column index of the smallest diagonal magnitude.
    pub imina: usize,
}

/// Compute the Householder reflection for `v` in place.
///
/// On return `v` holds the (unnormalized) reflection vector, and the result
/// is `(s, beta)` with `s = ||v_in||` such that
/// `(I - beta v v^T) v_in = s e_1`.
fn house(v: &mut [f64]) -> (f64, f64) {
    let v0 = v[0];
    let sigma: f64 = v[1..].iter().map(|&a| a * a).sum();
    let s = (v0 * v0 + sigma).sqrt();
    let beta;
    if sigma == 0.0 {
        v[0] = 1.0;
        beta = if v0 <= 0.0 { 2.0 } else { 0.0 };
    } else {
        v[0] = if v0 <= 0.0 { v0 - s } else { -sigma / (v0 + s) };
        beta = -1.0 / (s * v[0]);
    }
    (s, beta)
}

/// Numeric QR factorization of `(sp_a, nz_a)` onto the symbolic factors.
///
/// `x` is dense scratch of length at least `sym.sp_v.nrow()`; its previous
/// contents are ignored. Deterministic: identical inputs give bit-identical
/// factors.
pub fn factor(
    sp_a: &Sparsity,
    nz_a: &[f64],
    sym: &QrSymbolic,
    nz_v: &mut [f64],
    nz_r: &mut [f64],
    beta: &mut [f64],
    x: &mut [f64],
) {
    let n = sym.dim();
    debug_assert_eq!(sp_a.ncol(), n);
    let v_rowind = sym.sp_v.rowind();
    let r_rowind = sym.sp_r.rowind();
    x[..sym.sp_v.nrow()].fill(0.0);
    for c in 0..n {
        // Scatter the permuted column of A.
        for (k, r) in sp_a.col(sym.pc[c]) {
            x[sym.prinv[r]] = nz_a[k];
        }
        // Apply the reflections of the previous columns, in ascending order,
        // harvesting the finished entries of column c of R as we go.
        for k in sym.sp_r.range(c) {
            let r = r_rowind[k];
            if r == c {
                break;
            }
            let vr = sym.sp_v.range(r);
            let mut alpha = 0.0;
            for kv in vr.clone() {
                alpha += nz_v[kv] * x[v_rowind[kv]];
            }
            alpha *= beta[r];
            if alpha != 0.0 {
                for kv in vr {
                    x[v_rowind[kv]] -= alpha * nz_v[kv];
                }
            }
            nz_r[k] = x[r];
            x[r] = 0.0;
        }
        // Gather the new reflection vector and reduce it.
        let vc = sym.sp_v.range(c);
        for kv in vc.clone() {
            nz_v[kv] = x[v_rowind[kv]];
            x[v_rowind[kv]] = 0.0;
        }
        let (s, b) = house(&mut nz_v[vc]);
        beta[c] = b;
        // The diagonal of R is the last structural entry of the column.
        nz_r[sym.sp_r.range(c).end - 1] = s;
    }
}

/// Apply Q (or its transpose) to a dense vector through the stored
/// reflections: ascending order applies `Q^T`, descending applies `Q`.
fn apply_q(sp_v: &Sparsity, nz_v: &[f64], beta: &[f64], x: &mut [f64], transpose: bool) {
    let n = sp_v.ncol();
    let rowind = sp_v.rowind();
    let mut apply = |c: usize| {
        let rng = sp_v.range(c);
        let mut alpha = 0.0;
        for k in rng.clone() {
            alpha += nz_v[k] * x[rowind[k]];
        }
        alpha *= beta[c];
        if alpha != 0.0 {
            for k in rng {
                x[rowind[k]] -= alpha * nz_v[k];
            }
        }
    };
    if transpose {
        for c in 0..n {
            apply(c);
        }
    } else {
        for c in (0..n).rev() {
            apply(c);
        }
    }
}

/// Solve `R x = b` (backward) or `R^T x = b` (forward) in place.
fn triangular_solve(sp_r: &Sparsity, nz_r: &[f64], x: &mut [f64], transpose: bool) {
    let n = sp_r.ncol();
    let rowind = sp_r.rowind();
    if transpose {
        for c in 0..n {
            let rng = sp_r.range(c);
            let dk = rng.end - 1;
            for k in rng.start..dk {
                x[c] -= nz_r[k] * x[rowind[k]];
            }
            x[c] /= nz_r[dk];
        }
    } else {
        for c in (0..n).rev() {
            let rng = sp_r.range(c);
            let dk = rng.end - 1;
            x[c] /= nz_r[dk];
            let xc = x[c];
            if xc != 0.0 {
                for k in rng.start..dk {
                    x[rowind[k]] -= nz_r[k] * xc;
                }
            }
        }
    }
}

/// In-place solve of `A x = b` or `A^T x = b` using the stored factors,
/// where A is the matrix that was factorized. `w` is dense scratch of length
/// at least `sym.sp_v.nrow()`.
pub fn solve(
    x: &mut [f64],
    transpose: bool,
    sym: &QrSymbolic,
    nz_v: &[f64],
    nz_r: &[f64],
    beta: &[f64],
    w: &mut [f64],
) {
    let n = sym.dim();
    if transpose {
        // A^T x = b:  x = P^T Q R^-T Pc^T b
        for c in 0..n {
            w[c] = x[sym.pc[c]];
        }
        triangular_solve(&sym.sp_r, nz_r, w, true);
        apply_q(&sym.sp_v, nz_v, beta, w, false);
        for i in 0..n {
            x[i] = w[sym.prinv[i]];
        }
    } else {
        // A x = b:  x = Pc R^-1 Q^T P b
        for i in 0..n {
            w[sym.prinv[i]] = x[i];
        }
        apply_q(&sym.sp_v, nz_v, beta, w, true);
        triangular_solve(&sym.sp_r, nz_r, w, false);
        for c in 0..n {
            x[sym.pc[c]] = w[c];
        }
    }
}

/// Probe the diagonal of R for (near-)singularity with an absolute
/// threshold. Ties on the minimum keep the first column.
pub fn singular(nz_r: &[f64], sp_r: &Sparsity, eps: f64) -> SingularInfo {
    let mut info = SingularInfo {
        deficiency: 0,
        mina: f64::INFINITY,
        imina: 0,
    };
    for c in 0..sp_r.ncol() {
        let d = nz_r[sp_r.range(c).end - 1].abs();
        if d < eps {
            info.deficiency += 1;
        }
        if d < info.mina {
            info.mina = d;
            info.imina = c;
        }
    }
    info
}

/// Reconstruct the `ind`-th null-space column combination of the factored
/// matrix, writing a unit-norm vector in original column coordinates.
///
/// Columns with a diagonal of R below `eps` are scanned starting at `imina`
/// (wrapping around), and the `ind`-th such column `j` seeds a back
/// substitution of the leading block with the diagonal zeros skipped. The
/// caller guarantees `ind` is below the deficiency reported by [`singular`]
/// for the same `eps`; otherwise the output is zero.
pub fn colcomb(
    out: &mut [f64],
    nz_r: &[f64],
    sp_r: &Sparsity,
    pc: &[usize],
    imina: usize,
    ind: usize,
    eps: f64,
) {
    let n = sp_r.ncol();
    let rowind = sp_r.rowind();
    out[..n].fill(0.0);
    // Locate the target singular column.
    let mut target = None;
    let mut seen = 0;
    for step in 0..n {
        let c = (imina + step) % n;
        if nz_r[sp_r.range(c).end - 1].abs() < eps {
            if seen == ind {
                target = Some(c);
                break;
            }
            seen += 1;
        }
    }
    let Some(j) = target else {
        return;
    };
    // Right-hand side: the entries of column j above its diagonal, negated.
    out[pc[j]] = 1.0;
    let rng = sp_r.range(j);
    for k in rng.start..rng.end - 1 {
        out[pc[rowind[k]]] = -nz_r[k];
    }
    // Back substitution on the leading block, through the permutation.
    for c in (0..j).rev() {
        let rng = sp_r.range(c);
        let dk = rng.end - 1;
        let d = nz_r[dk];
        let yc = if d.abs() < eps { 0.0 } else { out[pc[c]] / d };
        out[pc[c]] = yc;
        if yc != 0.0 {
            for k in rng.start..dk {
                out[pc[rowind[k]]] -= nz_r[k] * yc;
            }
        }
    }
    let nrm = super::dot(&out[..n], &out[..n]).sqrt();
    if nrm > 0.0 {
        super::scal(1.0 / nrm, &mut out[..n]);
    }
}
