use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2, Zip};

/// Inter-step decay factors `exp(-c_j * (t[i+1] - t[i]))` as an `(n-1, r)` matrix.
pub(crate) fn propagators<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Array2<F> {
    let n = t.len();
    let mut p = Array2::<F>::zeros((n.saturating_sub(1), c.len()));
    for (i, mut row) in p.outer_iter_mut().enumerate() {
        let dt = t[i + 1] - t[i];
        Zip::from(&mut row).and(c).for_each(|pv, &cj| *pv = (-cj * dt).exp());
    }
    p
}

/// Full covariance diagonal `diag + rowsum(U ∘ V)`.
pub(crate) fn full_diag<F: Float>(
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    v: &ArrayBase<impl Data<Elem = F>, Ix2>,
    diag: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Array1<F> {
    let mut a = diag.to_owned();
    Zip::from(&mut a)
        .and(u.rows())
        .and(v.rows())
        .for_each(|av, ur, vr| *av += ur.dot(&vr));
    a
}

/// Checks that a sequence is strictly increasing.
pub(crate) fn check_sorted<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    what: &str,
) -> Result<()> {
    for i in 1..t.len() {
        if !(t[i] > t[i - 1]) {
            return Err(GpError::InvalidValueError(format!(
                "{} must be strictly increasing, got {} after {} at index {}",
                what,
                t[i],
                t[i - 1],
                i
            )));
        }
    }
    Ok(())
}

/// Checks the coefficient system shapes and returns `(n, r)`.
pub(crate) fn check_coeffs<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    v: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<(usize, usize)> {
    let (n, r) = (t.len(), c.len());
    if n == 0 {
        return Err(GpError::InvalidValueError(
            "t must hold at least one point".to_string(),
        ));
    }
    if u.dim() != (n, r) {
        return Err(GpError::ShapeMismatch(format!(
            "U is {:?}, expected ({}, {})",
            u.dim(),
            n,
            r
        )));
    }
    if v.dim() != (n, r) {
        return Err(GpError::ShapeMismatch(format!(
            "V is {:?}, expected ({}, {})",
            v.dim(),
            n,
            r
        )));
    }
    Ok((n, r))
}

/// Checks a vector length against an expected number of entries.
pub(crate) fn check_len<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix1>,
    n: usize,
    what: &str,
) -> Result<()> {
    if x.len() != n {
        return Err(GpError::ShapeMismatch(format!(
            "{} has length {}, expected {}",
            what,
            x.len(),
            n
        )));
    }
    Ok(())
}

/// Checks that a right-hand side has `n` rows.
pub(crate) fn check_rhs<F: Float>(
    z: &ArrayBase<impl Data<Elem = F>, Ix2>,
    n: usize,
) -> Result<()> {
    if z.nrows() != n {
        return Err(GpError::ShapeMismatch(format!(
            "right-hand side has {} rows, expected {}",
            z.nrows(),
            n
        )));
    }
    Ok(())
}

/// Index of the first element of sorted `t` not less than `x`.
pub(crate) fn searchsorted<F: Float>(t: &ArrayBase<impl Data<Elem = F>, Ix1>, x: F) -> usize {
    let (mut lo, mut hi) = (0, t.len());
    while lo < hi {
        let mid = (lo + hi) / 2;
        if t[mid] < x {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}
