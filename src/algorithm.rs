use crate::errors::{GpError, Result};
use crate::utils::{check_coeffs, check_len, check_rhs, check_sorted, full_diag, propagators};

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

use linfa::Float;
use ndarray::parallel::prelude::*;
use ndarray::{
    Array1, Array2, Array3, ArrayBase, ArrayView1, ArrayView2, ArrayViewMut2, Axis, Data, Ix1,
    Ix2, Zip,
};

/// Minimum number of right-hand-side columns before sweeps run on rayon chunks.
pub(crate) const PAR_MIN_RHS: usize = 8;

/// Lower-triangular `L·D·Lᵀ` factorization of a semiseparable covariance
/// matrix, with `L = I + tril(U·P·Wᵀ)` kept in its `(d, W)` generator form.
///
/// The factorization is immutable once built; solves and related operations
/// borrow it, so it can be shared freely across threads.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Factorization<F: Float> {
    d: Array1<F>,
    w: Array2<F>,
}

impl<F: Float> Factorization<F> {
    /// Number of data points.
    pub fn n(&self) -> usize {
        self.d.len()
    }

    /// Number of semiseparable coefficient columns.
    pub fn rank(&self) -> usize {
        self.w.ncols()
    }

    /// Factorized diagonal `d`.
    pub fn d(&self) -> &Array1<F> {
        &self.d
    }

    /// Rescaled right coefficients `W`.
    pub fn w(&self) -> &Array2<F> {
        &self.w
    }

    /// Log-determinant `Σ ln d[i]` of the factorized matrix.
    pub fn log_det(&self) -> F {
        self.d.fold(F::zero(), |acc, &di| acc + di.ln())
    }
}

/// Outcome of a quiet factorization: either a completed factorization or a
/// tagged failure carrying the partially computed state.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum FactorOutcome<F: Float> {
    /// The matrix is positive definite and fully factorized
    Factored(Factorization<F>),
    /// The sweep hit a non positive pivot
    NotPositiveDefinite {
        /// Index of the first row with a non positive pivot
        row: usize,
        /// Partial state: rows before `row` are valid, `d[row]` holds the
        /// offending pivot, later rows are unspecified
        partial: Factorization<F>,
    },
}

impl<F: Float> FactorOutcome<F> {
    /// True when the factorization completed.
    pub fn is_positive_definite(&self) -> bool {
        matches!(self, FactorOutcome::Factored(_))
    }

    /// The completed factorization, if any.
    pub fn factor(&self) -> Option<&Factorization<F>> {
        match self {
            FactorOutcome::Factored(f) => Some(f),
            FactorOutcome::NotPositiveDefinite { .. } => None,
        }
    }

    /// Log-determinant, pinned to `-inf` when not positive definite so that
    /// downstream likelihoods treat the parameters as impossible.
    pub fn log_det(&self) -> F {
        match self {
            FactorOutcome::Factored(f) => f.log_det(),
            FactorOutcome::NotPositiveDefinite { .. } => F::neg_infinity(),
        }
    }

    /// Converts into a strict result, dropping the partial state on failure.
    pub fn into_result(self) -> Result<Factorization<F>> {
        match self {
            FactorOutcome::Factored(f) => Ok(f),
            FactorOutcome::NotPositiveDefinite { row, .. } => {
                Err(GpError::NotPositiveDefinite { row })
            }
        }
    }
}

/// Forward state saved by [`factorize_traced`] for reverse-mode consumption:
/// the propagators and, per row, the left-scaled accumulator `diag(P)·S`.
#[derive(Debug, Clone)]
pub struct FactorTrace<F: Float> {
    pub(crate) p: Array2<F>,
    pub(crate) s: Array3<F>,
}

/// Accumulator states saved by [`solve_traced`], pre-scaling, for both sweeps.
#[derive(Debug, Clone)]
pub struct SolveTrace<F: Float> {
    pub(crate) p: Array2<F>,
    pub(crate) f: Array3<F>,
    pub(crate) g: Array3<F>,
}

/// Accumulator states saved by [`matmul_traced`], pre-scaling, for both sweeps.
#[derive(Debug, Clone)]
pub struct MatmulTrace<F: Float> {
    pub(crate) p: Array2<F>,
    pub(crate) fu: Array3<F>,
    pub(crate) fl: Array3<F>,
}

fn factor_sweep<F: Float>(
    u: &ArrayView2<F>,
    p: &ArrayView2<F>,
    a: &ArrayView1<F>,
    v: &ArrayView2<F>,
    mut trace: Option<&mut Array3<F>>,
) -> (Array1<F>, Array2<F>, Option<usize>) {
    let n = a.len();
    let r = u.ncols();
    let mut d = a.to_owned();
    let mut w = v.to_owned();
    if !(d[0] > F::zero()) {
        return (d, w, Some(0));
    }
    let d0 = d[0];
    w.row_mut(0).mapv_inplace(|x| x / d0);
    let mut s = Array2::<F>::zeros((r, r));
    let mut tmp = Array1::<F>::zeros(r);
    for i in 1..n {
        let (w_done, mut w_todo) = w.view_mut().split_at(Axis(0), i);
        let wprev = w_done.row(i - 1);
        let pi = p.row(i - 1);
        let dprev = d[i - 1];
        for j in 0..r {
            let wj = dprev * wprev[j];
            for k in 0..r {
                s[[j, k]] += wj * wprev[k];
            }
        }
        for j in 0..r {
            let pj = pi[j];
            for k in 0..r {
                s[[j, k]] *= pj;
            }
        }
        if let Some(tr) = trace.as_deref_mut() {
            tr.index_axis_mut(Axis(0), i).assign(&s);
        }
        for k in 0..r {
            let pk = pi[k];
            for j in 0..r {
                s[[j, k]] *= pk;
            }
        }
        let ui = u.row(i);
        for k in 0..r {
            let mut acc = F::zero();
            for j in 0..r {
                acc += ui[j] * s[[j, k]];
            }
            tmp[k] = acc;
        }
        let mut di = a[i];
        for k in 0..r {
            di -= tmp[k] * ui[k];
        }
        d[i] = di;
        if !(di > F::zero()) {
            return (d, w, Some(i));
        }
        let mut wi = w_todo.row_mut(0);
        for k in 0..r {
            wi[k] = (wi[k] - tmp[k]) / di;
        }
    }
    (d, w, None)
}

/// Factorizes the semiseparable covariance matrix defined by the coefficients
/// `(t, c, U, V, diag)` in a single O(n·r²) sweep.
///
/// The matrix is `K[i, j] = Σ_k U[i, k]·V[j, k]·exp(-c[k]·(t[i] - t[j]))` for
/// `i > j` (symmetric) with diagonal `diag + rowsum(U ∘ V)`. Fails with
/// [`GpError::NotPositiveDefinite`] at the first non positive pivot and with a
/// shape or value error on malformed inputs (`t` must be strictly increasing).
pub fn factorize<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    v: &ArrayBase<impl Data<Elem = F>, Ix2>,
    diag: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<Factorization<F>> {
    factorize_quiet(t, c, u, v, diag)?.into_result()
}

/// Quiet variant of [`factorize`]: shape and ordering problems still error,
/// but a non positive pivot comes back as a [`FactorOutcome`] arm instead of
/// an error, keeping sampling loops free of unwinding.
pub fn factorize_quiet<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    v: &ArrayBase<impl Data<Elem = F>, Ix2>,
    diag: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<FactorOutcome<F>> {
    let (n, _) = check_coeffs(t, c, u, v)?;
    check_len(diag, n, "diag")?;
    check_sorted(t, "t")?;
    let p = propagators(t, c);
    let a = full_diag(u, v, diag);
    let (d, w, fail) = factor_sweep(&u.view(), &p.view(), &a.view(), &v.view(), None);
    let partial = Factorization { d, w };
    Ok(match fail {
        None => FactorOutcome::Factored(partial),
        Some(row) => FactorOutcome::NotPositiveDefinite { row, partial },
    })
}

/// Factorization that also records the forward state needed by
/// [`crate::grad::factorize_rev`]. Strict about positive definiteness.
pub fn factorize_traced<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    v: &ArrayBase<impl Data<Elem = F>, Ix2>,
    diag: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<(Factorization<F>, FactorTrace<F>)> {
    let (n, r) = check_coeffs(t, c, u, v)?;
    check_len(diag, n, "diag")?;
    check_sorted(t, "t")?;
    let p = propagators(t, c);
    let a = full_diag(u, v, diag);
    let mut s = Array3::<F>::zeros((n, r, r));
    let (d, w, fail) = factor_sweep(&u.view(), &p.view(), &a.view(), &v.view(), Some(&mut s));
    if let Some(row) = fail {
        return Err(GpError::NotPositiveDefinite { row });
    }
    Ok((Factorization { d, w }, FactorTrace { p, s }))
}

fn lower_sweep<F: Float>(
    u: &ArrayView2<F>,
    w: &ArrayView2<F>,
    p: &ArrayView2<F>,
    x: &mut ArrayViewMut2<F>,
    mut trace: Option<&mut Array3<F>>,
) {
    let n = u.nrows();
    let r = u.ncols();
    let k = x.ncols();
    let mut f = Array2::<F>::zeros((r, k));
    for i in 1..n {
        let (x_done, mut x_todo) = x.view_mut().split_at(Axis(0), i);
        let xprev = x_done.row(i - 1);
        let wprev = w.row(i - 1);
        for j in 0..r {
            let wj = wprev[j];
            Zip::from(&mut f.row_mut(j))
                .and(&xprev)
                .for_each(|fv, &xv| *fv += wj * xv);
        }
        if let Some(tr) = trace.as_deref_mut() {
            tr.index_axis_mut(Axis(0), i).assign(&f);
        }
        let pi = p.row(i - 1);
        for j in 0..r {
            let pj = pi[j];
            f.row_mut(j).mapv_inplace(|v| v * pj);
        }
        let ui = u.row(i);
        let mut xi = x_todo.row_mut(0);
        for j in 0..r {
            let uj = ui[j];
            Zip::from(&mut xi)
                .and(&f.row(j))
                .for_each(|xv, &fv| *xv -= uj * fv);
        }
    }
}

fn upper_sweep<F: Float>(
    u: &ArrayView2<F>,
    w: &ArrayView2<F>,
    p: &ArrayView2<F>,
    x: &mut ArrayViewMut2<F>,
    mut trace: Option<&mut Array3<F>>,
) {
    let n = u.nrows();
    let r = u.ncols();
    let k = x.ncols();
    let mut g = Array2::<F>::zeros((r, k));
    for i in (0..n.saturating_sub(1)).rev() {
        let (mut x_head, x_tail) = x.view_mut().split_at(Axis(0), i + 1);
        let xnext = x_tail.row(0);
        let unext = u.row(i + 1);
        for j in 0..r {
            let uj = unext[j];
            Zip::from(&mut g.row_mut(j))
                .and(&xnext)
                .for_each(|gv, &xv| *gv += uj * xv);
        }
        if let Some(tr) = trace.as_deref_mut() {
            tr.index_axis_mut(Axis(0), i).assign(&g);
        }
        let pi = p.row(i);
        for j in 0..r {
            let pj = pi[j];
            g.row_mut(j).mapv_inplace(|v| v * pj);
        }
        let wi = w.row(i);
        let mut xi = x_head.row_mut(i);
        for j in 0..r {
            let wj = wi[j];
            Zip::from(&mut xi)
                .and(&g.row(j))
                .for_each(|xv, &gv| *xv -= wj * gv);
        }
    }
}

fn solve_sweeps<F: Float>(
    u: &ArrayView2<F>,
    w: &ArrayView2<F>,
    p: &ArrayView2<F>,
    d: &ArrayView1<F>,
    x: &mut ArrayViewMut2<F>,
    ftrace: Option<&mut Array3<F>>,
    gtrace: Option<&mut Array3<F>>,
) {
    lower_sweep(u, w, p, x, ftrace);
    Zip::from(x.rows_mut()).and(d).for_each(|mut row, &di| {
        row.mapv_inplace(|v| v / di);
    });
    upper_sweep(u, w, p, x, gtrace);
}

fn par_columns<F, OP>(x: &mut Array2<F>, op: OP)
where
    F: Float,
    OP: Fn(&mut ArrayViewMut2<F>) + Sync,
{
    let k = x.ncols();
    if k < PAR_MIN_RHS {
        op(&mut x.view_mut());
    } else {
        let chunk = k.div_ceil(rayon::current_num_threads()).max(1);
        x.axis_chunks_iter_mut(Axis(1), chunk)
            .into_par_iter()
            .for_each(|mut block| op(&mut block));
    }
}

fn par_columns_in_out<F, OP>(z: &ArrayView2<F>, y: &mut Array2<F>, op: OP)
where
    F: Float,
    OP: Fn(&ArrayView2<F>, &mut ArrayViewMut2<F>) + Sync,
{
    let k = z.ncols();
    if k < PAR_MIN_RHS {
        op(z, &mut y.view_mut());
        return;
    }
    let chunk = k.div_ceil(rayon::current_num_threads()).max(1);
    y.axis_chunks_iter_mut(Axis(1), chunk)
        .into_par_iter()
        .zip(z.axis_chunks_iter(Axis(1), chunk).into_par_iter())
        .for_each(|(mut yb, zb)| op(&zb, &mut yb));
}

/// Applies `K⁻¹` to the columns of `z` through the factorization: a lower
/// substitution sweep, a diagonal rescale and an upper substitution sweep,
/// O(n·r) per column. Columns run on rayon chunks when there are many.
pub fn solve<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    factor: &Factorization<F>,
    z: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<Array2<F>> {
    let (n, _) = check_factor_system(t, c, u, factor)?;
    check_rhs(z, n)?;
    let p = propagators(t, c);
    let mut x = z.to_owned();
    let (uv, wv, pv, dv) = (u.view(), factor.w.view(), p.view(), factor.d.view());
    par_columns(&mut x, |block| {
        solve_sweeps(&uv, &wv, &pv, &dv, block, None, None)
    });
    Ok(x)
}

/// [`solve`] that also records the forward accumulator states needed by
/// [`crate::grad::solve_rev`]. Runs sequentially over columns.
pub fn solve_traced<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    factor: &Factorization<F>,
    z: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<(Array2<F>, SolveTrace<F>)> {
    let (n, r) = check_factor_system(t, c, u, factor)?;
    check_rhs(z, n)?;
    let k = z.ncols();
    let p = propagators(t, c);
    let mut x = z.to_owned();
    let mut f = Array3::<F>::zeros((n, r, k));
    let mut g = Array3::<F>::zeros((n, r, k));
    solve_sweeps(
        &u.view(),
        &factor.w.view(),
        &p.view(),
        &factor.d.view(),
        &mut x.view_mut(),
        Some(&mut f),
        Some(&mut g),
    );
    Ok((x, SolveTrace { p, f, g }))
}

/// Inverse quadratic form `zᵀ·K⁻¹·z` per column, using only the lower half
/// sweep: `Σ_i x[i]²/d[i]` after `L·x = z`.
pub fn inv_quad<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    factor: &Factorization<F>,
    z: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<Array1<F>> {
    let (n, _) = check_factor_system(t, c, u, factor)?;
    check_rhs(z, n)?;
    let p = propagators(t, c);
    let mut x = z.to_owned();
    let (uv, wv, pv) = (u.view(), factor.w.view(), p.view());
    par_columns(&mut x, |block| lower_sweep(&uv, &wv, &pv, block, None));
    let mut out = Array1::<F>::zeros(x.ncols());
    Zip::from(&mut out).and(x.columns()).for_each(|o, col| {
        let mut acc = F::zero();
        Zip::from(&col)
            .and(&factor.d)
            .for_each(|&xv, &di| acc += xv * xv / di);
        *o = acc;
    });
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn matmul_sweeps<F: Float>(
    u: &ArrayView2<F>,
    v: &ArrayView2<F>,
    p: &ArrayView2<F>,
    a: &ArrayView1<F>,
    z: &ArrayView2<F>,
    y: &mut ArrayViewMut2<F>,
    mut utrace: Option<&mut Array3<F>>,
    mut ltrace: Option<&mut Array3<F>>,
) {
    let n = u.nrows();
    let r = u.ncols();
    let k = z.ncols();
    let mut f = Array2::<F>::zeros((r, k));
    {
        let alast = a[n - 1];
        Zip::from(&mut y.row_mut(n - 1))
            .and(&z.row(n - 1))
            .for_each(|yv, &zv| *yv = alast * zv);
    }
    for i in (0..n.saturating_sub(1)).rev() {
        let znext = z.row(i + 1);
        let unext = u.row(i + 1);
        for j in 0..r {
            let uj = unext[j];
            Zip::from(&mut f.row_mut(j))
                .and(&znext)
                .for_each(|fv, &zv| *fv += uj * zv);
        }
        if let Some(tr) = utrace.as_deref_mut() {
            tr.index_axis_mut(Axis(0), i).assign(&f);
        }
        let pi = p.row(i);
        for j in 0..r {
            let pj = pi[j];
            f.row_mut(j).mapv_inplace(|fv| fv * pj);
        }
        let ai = a[i];
        let vi = v.row(i);
        let mut yi = y.row_mut(i);
        Zip::from(&mut yi).and(&z.row(i)).for_each(|yv, &zv| *yv = ai * zv);
        for j in 0..r {
            let vj = vi[j];
            Zip::from(&mut yi)
                .and(&f.row(j))
                .for_each(|yv, &fv| *yv += vj * fv);
        }
    }
    f.fill(F::zero());
    for i in 1..n {
        let zprev = z.row(i - 1);
        let vprev = v.row(i - 1);
        for j in 0..r {
            let vj = vprev[j];
            Zip::from(&mut f.row_mut(j))
                .and(&zprev)
                .for_each(|fv, &zv| *fv += vj * zv);
        }
        if let Some(tr) = ltrace.as_deref_mut() {
            tr.index_axis_mut(Axis(0), i).assign(&f);
        }
        let pi = p.row(i - 1);
        for j in 0..r {
            let pj = pi[j];
            f.row_mut(j).mapv_inplace(|fv| fv * pj);
        }
        let ui = u.row(i);
        let mut yi = y.row_mut(i);
        for j in 0..r {
            let uj = ui[j];
            Zip::from(&mut yi)
                .and(&f.row(j))
                .for_each(|yv, &fv| *yv += uj * fv);
        }
    }
}

/// Multiplies `K` by the columns of `z` without materializing `K`: an upper
/// (descending) sweep then a lower (ascending) sweep, no divisions, O(n·r)
/// per column.
pub fn matmul<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    v: &ArrayBase<impl Data<Elem = F>, Ix2>,
    diag: &ArrayBase<impl Data<Elem = F>, Ix1>,
    z: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<Array2<F>> {
    let (n, _) = check_coeffs(t, c, u, v)?;
    check_len(diag, n, "diag")?;
    check_rhs(z, n)?;
    let p = propagators(t, c);
    let a = full_diag(u, v, diag);
    let mut y = Array2::<F>::zeros(z.raw_dim());
    let (uv, vv, pv, av) = (u.view(), v.view(), p.view(), a.view());
    par_columns_in_out(&z.view(), &mut y, |zb, yb| {
        matmul_sweeps(&uv, &vv, &pv, &av, zb, yb, None, None)
    });
    Ok(y)
}

/// [`matmul`] that also records the forward accumulator states needed by
/// [`crate::grad::matmul_rev`]. Runs sequentially over columns.
pub fn matmul_traced<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    v: &ArrayBase<impl Data<Elem = F>, Ix2>,
    diag: &ArrayBase<impl Data<Elem = F>, Ix1>,
    z: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<(Array2<F>, MatmulTrace<F>)> {
    let (n, r) = check_coeffs(t, c, u, v)?;
    check_len(diag, n, "diag")?;
    check_rhs(z, n)?;
    let k = z.ncols();
    let p = propagators(t, c);
    let a = full_diag(u, v, diag);
    let mut y = Array2::<F>::zeros(z.raw_dim());
    let mut fu = Array3::<F>::zeros((n, r, k));
    let mut fl = Array3::<F>::zeros((n, r, k));
    matmul_sweeps(
        &u.view(),
        &v.view(),
        &p.view(),
        &a.view(),
        &z.view(),
        &mut y.view_mut(),
        Some(&mut fu),
        Some(&mut fl),
    );
    Ok((y, MatmulTrace { p, fu, fl }))
}

/// Multiplies the strictly lower triangular part of `K` (no diagonal) by the
/// columns of `z`.
pub fn matmul_lower<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    v: &ArrayBase<impl Data<Elem = F>, Ix2>,
    z: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<Array2<F>> {
    let (n, r) = check_coeffs(t, c, u, v)?;
    check_rhs(z, n)?;
    let p = propagators(t, c);
    let mut y = Array2::<F>::zeros(z.raw_dim());
    let (uv, vv, pv) = (u.view(), v.view(), p.view());
    par_columns_in_out(&z.view(), &mut y, |zb, yb| {
        let k = zb.ncols();
        let mut f = Array2::<F>::zeros((r, k));
        for i in 1..n {
            let zprev = zb.row(i - 1);
            let vprev = vv.row(i - 1);
            for j in 0..r {
                let vj = vprev[j];
                Zip::from(&mut f.row_mut(j))
                    .and(&zprev)
                    .for_each(|fv, &zv| *fv += vj * zv);
            }
            let pi = pv.row(i - 1);
            for j in 0..r {
                let pj = pi[j];
                f.row_mut(j).mapv_inplace(|fv| fv * pj);
            }
            let ui = uv.row(i);
            let mut yi = yb.row_mut(i);
            for j in 0..r {
                let uj = ui[j];
                Zip::from(&mut yi)
                    .and(&f.row(j))
                    .for_each(|yv, &fv| *yv += uj * fv);
            }
        }
    });
    Ok(y)
}

/// Applies the Cholesky-like factor `L·diag(√d)` to the columns of `z`,
/// turning i.i.d. standard normal columns into draws with covariance `K`.
pub fn dot_tril<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    factor: &Factorization<F>,
    z: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<Array2<F>> {
    let (n, r) = check_factor_system(t, c, u, factor)?;
    check_rhs(z, n)?;
    let p = propagators(t, c);
    let mut x = z.to_owned();
    let (uv, wv, pv, dv) = (u.view(), factor.w.view(), p.view(), factor.d.view());
    par_columns(&mut x, |block| {
        let k = block.ncols();
        let sd0 = dv[0].sqrt();
        block.row_mut(0).mapv_inplace(|v| v * sd0);
        // the accumulator reads the scaled input rows, not the finished
        // output rows, so the previous row is staged before its update
        let mut prev = block.row(0).to_owned();
        let mut f = Array2::<F>::zeros((r, k));
        for i in 1..n {
            let wprev = wv.row(i - 1);
            for j in 0..r {
                let wj = wprev[j];
                Zip::from(&mut f.row_mut(j))
                    .and(&prev)
                    .for_each(|fv, &xv| *fv += wj * xv);
            }
            let pi = pv.row(i - 1);
            for j in 0..r {
                let pj = pi[j];
                f.row_mut(j).mapv_inplace(|fv| fv * pj);
            }
            let sdi = dv[i].sqrt();
            let ui = uv.row(i);
            let mut xi = block.row_mut(i);
            xi.mapv_inplace(|v| v * sdi);
            prev.assign(&xi);
            for j in 0..r {
                let uj = ui[j];
                Zip::from(&mut xi)
                    .and(&f.row(j))
                    .for_each(|xv, &fv| *xv += uj * fv);
            }
        }
    });
    Ok(x)
}

/// Materializes the dense covariance matrix. O(n²·r) work and O(n²) storage,
/// intended for tests and debugging at small sizes.
pub fn to_dense<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    v: &ArrayBase<impl Data<Elem = F>, Ix2>,
    diag: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<Array2<F>> {
    let (n, r) = check_coeffs(t, c, u, v)?;
    check_len(diag, n, "diag")?;
    let a = full_diag(u, v, diag);
    let mut kmat = Array2::<F>::zeros((n, n));
    for i in 0..n {
        kmat[[i, i]] = a[i];
        for m in 0..i {
            let mut val = F::zero();
            for j in 0..r {
                val += u[[i, j]] * v[[m, j]] * (-c[j] * (t[i] - t[m])).exp();
            }
            kmat[[i, m]] = val;
            kmat[[m, i]] = val;
        }
    }
    Ok(kmat)
}

/// Conditional (posterior) mean weights applied at sorted prediction points.
///
/// `alpha` is `K⁻¹·(y - mean)`; `u_star`/`v_star` are the coefficient rows at
/// the prediction points with the partial-gap decay folded in, and `inds[m]`
/// counts the training points strictly before prediction point `m`. One
/// ascending sweep gathers the lower-triangle contributions, one descending
/// sweep the upper-triangle ones, O((n + m)·r) total.
#[allow(clippy::too_many_arguments)]
pub fn conditional_mean<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    v: &ArrayBase<impl Data<Elem = F>, Ix2>,
    alpha: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u_star: &ArrayBase<impl Data<Elem = F>, Ix2>,
    v_star: &ArrayBase<impl Data<Elem = F>, Ix2>,
    inds: &[usize],
) -> Result<Array1<F>> {
    let (n, r) = check_coeffs(t, c, u, v)?;
    check_len(alpha, n, "alpha")?;
    let m = inds.len();
    if u_star.dim() != (m, r) || v_star.dim() != (m, r) {
        return Err(GpError::ShapeMismatch(format!(
            "star matrices are {:?} and {:?}, expected ({}, {})",
            u_star.dim(),
            v_star.dim(),
            m,
            r
        )));
    }
    if inds.windows(2).any(|w| w[1] < w[0]) || inds.iter().any(|&i| i > n) {
        return Err(GpError::InvalidValueError(
            "prediction indices must be non decreasing and at most n".to_string(),
        ));
    }
    let p = propagators(t, c);
    let mut mu = Array1::<F>::zeros(m);
    let mut q = Array1::<F>::zeros(r);
    let mut star = 0;
    while star < m && inds[star] == 0 {
        star += 1;
    }
    for i in 0..n {
        let ai = alpha[i];
        for j in 0..r {
            q[j] += ai * v[[i, j]];
        }
        while star < m && inds[star] == i + 1 {
            mu[star] = u_star.row(star).dot(&q);
            star += 1;
        }
        if i + 1 < n {
            for j in 0..r {
                q[j] *= p[[i, j]];
            }
        }
    }
    q.fill(F::zero());
    let mut star = m;
    while star > 0 && inds[star - 1] == n {
        star -= 1;
    }
    for i in (0..n).rev() {
        let ai = alpha[i];
        for j in 0..r {
            q[j] += ai * u[[i, j]];
        }
        while star > 0 && inds[star - 1] == i {
            mu[star - 1] += v_star.row(star - 1).dot(&q);
            star -= 1;
        }
        if i > 0 {
            for j in 0..r {
                q[j] *= p[[i - 1, j]];
            }
        }
    }
    Ok(mu)
}

/// Log-determinant `Σ ln d[i]` of a factorized diagonal, erroring at the
/// first non positive entry.
pub fn log_det<F: Float>(d: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<F> {
    let mut acc = F::zero();
    for (i, &di) in d.iter().enumerate() {
        if !(di > F::zero()) {
            return Err(GpError::NotPositiveDefinite { row: i });
        }
        acc += di.ln();
    }
    Ok(acc)
}

fn check_factor_system<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    factor: &Factorization<F>,
) -> Result<(usize, usize)> {
    let (n, r) = (t.len(), c.len());
    if u.dim() != (n, r) {
        return Err(GpError::ShapeMismatch(format!(
            "U is {:?}, expected ({}, {})",
            u.dim(),
            n,
            r
        )));
    }
    if factor.n() != n || factor.rank() != r {
        return Err(GpError::ShapeMismatch(format!(
            "factorization is ({}, {}), expected ({}, {})",
            factor.n(),
            factor.rank(),
            n,
            r
        )));
    }
    Ok((n, r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terms::Term;
    use approx::assert_abs_diff_eq;
    use linfa_linalg::{cholesky::*, triangular::*};
    use ndarray::{array, Array};
    use ndarray_rand::rand::{Rng, SeedableRng};
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand_xoshiro::Xoshiro256Plus;

    fn sorted_times(n: usize, rng: &mut Xoshiro256Plus) -> Array1<f64> {
        let mut v: Vec<f64> = (0..n).map(|_| rng.gen::<f64>() * 10.).collect();
        v.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Array1::from_vec(v)
    }

    fn dense_solve(kmat: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
        let chol = kmat.cholesky().unwrap();
        let z = chol.solve_triangular(b, UPLO::Lower).unwrap();
        chol.t().solve_triangular(&z, UPLO::Upper).unwrap()
    }

    fn term_of_rank(r: usize) -> Term<f64> {
        match r {
            1 => Term::real(1.3, 0.7),
            2 => Term::sho(1.0, 2.5, 3.0),
            4 => Term::real(1.3, 0.7) + Term::sho(0.8, 1.5, 2.0) + Term::real(0.4, 1.9),
            6 => {
                Term::sho(1.0, 2.5, 3.0)
                    + Term::real(0.5, 0.3) * Term::sho(0.7, 1.1, 4.0)
                    + Term::sho(0.3, 4.0, 0.2)
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_factorize_concrete_real_term() {
        let t: Array1<f64> = array![0., 1., 2., 3., 4.];
        let diag = Array1::from_elem(5, 0.1);
        let (c, u, v) = Term::real(1.0, 0.5).matrices(&t);
        let factor = factorize(&t, &c, &u, &v, &diag).unwrap();

        let mut kdense = Array2::<f64>::zeros((5, 5));
        for i in 0..5 {
            for j in 0..5 {
                kdense[[i, j]] = (-0.5 * (t[i] - t[j]).abs()).exp();
                if i == j {
                    kdense[[i, j]] += 0.1;
                }
            }
        }
        assert_abs_diff_eq!(
            to_dense(&t, &c, &u, &v, &diag).unwrap(),
            kdense,
            epsilon = 1e-12
        );

        let chol = kdense.cholesky().unwrap();
        let ld_dense = 2. * chol.diag().mapv(f64::ln).sum();
        assert_abs_diff_eq!(factor.log_det(), ld_dense, epsilon = 1e-10);

        let y = array![[0.3], [-0.4], [1.1], [0.2], [-0.8]];
        let x = solve(&t, &c, &u, &factor, &y).unwrap();
        let x_dense = dense_solve(&kdense, &y);
        assert_abs_diff_eq!(x, x_dense, epsilon = 1e-10);
    }

    #[test]
    fn test_round_trip_matmul_solve() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        for &r in &[1usize, 2, 4, 6] {
            let term = term_of_rank(r);
            for &n in &[1usize, 2, 10, 500] {
                let t = sorted_times(n, &mut rng);
                let diag = Array1::from_elem(n, 0.3);
                let (c, u, v) = term.matrices(&t);
                assert_eq!(c.len(), r);
                let z = Array::random_using((n, 3), Uniform::new(-1., 1.), &mut rng);
                let y = matmul(&t, &c, &u, &v, &diag, &z).unwrap();
                let factor = factorize(&t, &c, &u, &v, &diag).unwrap();
                let back = solve(&t, &c, &u, &factor, &y).unwrap();
                let scale = z.mapv(f64::abs).sum().max(1.);
                assert!(
                    (&back - &z).mapv(f64::abs).sum() / scale < 1e-8,
                    "round trip failed for r={} n={}",
                    r,
                    n
                );
            }
        }
    }

    #[test]
    fn test_log_det_matches_dense() {
        let mut rng = Xoshiro256Plus::seed_from_u64(7);
        let n = 50;
        let t = sorted_times(n, &mut rng);
        let diag = Array1::from_elem(n, 0.2);
        let term = Term::sho(1.0, 2.0, 4.0) + Term::real(0.6, 0.9);
        let (c, u, v) = term.matrices(&t);
        let factor = factorize(&t, &c, &u, &v, &diag).unwrap();
        let kdense = to_dense(&t, &c, &u, &v, &diag).unwrap();
        let chol = kdense.cholesky().unwrap();
        let ld_dense = 2. * chol.diag().mapv(f64::ln).sum();
        assert_abs_diff_eq!(factor.log_det(), ld_dense, epsilon = 1e-8);
        assert_abs_diff_eq!(log_det(factor.d()).unwrap(), ld_dense, epsilon = 1e-8);
    }

    #[test]
    fn test_matmul_matches_dense() {
        let mut rng = Xoshiro256Plus::seed_from_u64(11);
        let n = 20;
        let t = sorted_times(n, &mut rng);
        let diag = Array1::from_elem(n, 0.4);
        let term = Term::sho(0.8, 1.7, 2.5) + Term::real(0.5, 0.4);
        let (c, u, v) = term.matrices(&t);
        let z = Array::random_using((n, 2), Uniform::new(-1., 1.), &mut rng);
        let kdense = to_dense(&t, &c, &u, &v, &diag).unwrap();
        let y = matmul(&t, &c, &u, &v, &diag, &z).unwrap();
        assert_abs_diff_eq!(y, kdense.dot(&z), epsilon = 1e-10);
    }

    #[test]
    fn test_matmul_lower_is_strictly_lower() {
        let mut rng = Xoshiro256Plus::seed_from_u64(13);
        let n = 15;
        let t = sorted_times(n, &mut rng);
        let diag = Array1::from_elem(n, 0.4);
        let term = Term::sho(0.8, 1.7, 2.5);
        let (c, u, v) = term.matrices(&t);
        let z = Array::random_using((n, 2), Uniform::new(-1., 1.), &mut rng);
        let mut lower = to_dense(&t, &c, &u, &v, &diag).unwrap();
        for i in 0..n {
            for j in i..n {
                lower[[i, j]] = 0.;
            }
        }
        let y = matmul_lower(&t, &c, &u, &v, &z).unwrap();
        assert_abs_diff_eq!(y, lower.dot(&z), epsilon = 1e-10);
    }

    #[test]
    fn test_dot_tril_squares_to_covariance() {
        let mut rng = Xoshiro256Plus::seed_from_u64(17);
        let n = 12;
        let t = sorted_times(n, &mut rng);
        let diag = Array1::from_elem(n, 0.3);
        let term = Term::real(1.1, 0.6) + Term::sho(0.5, 2.2, 1.5);
        let (c, u, v) = term.matrices(&t);
        let factor = factorize(&t, &c, &u, &v, &diag).unwrap();
        let eye = Array2::<f64>::eye(n);
        let l = dot_tril(&t, &c, &u, &factor, &eye).unwrap();
        let kdense = to_dense(&t, &c, &u, &v, &diag).unwrap();
        assert_abs_diff_eq!(l.dot(&l.t()), kdense, epsilon = 1e-10);
    }

    #[test]
    fn test_inv_quad_matches_solve() {
        let mut rng = Xoshiro256Plus::seed_from_u64(19);
        let n = 30;
        let t = sorted_times(n, &mut rng);
        let diag = Array1::from_elem(n, 0.25);
        let term = Term::sho(1.0, 1.5, 3.0);
        let (c, u, v) = term.matrices(&t);
        let factor = factorize(&t, &c, &u, &v, &diag).unwrap();
        let z = Array::random_using((n, 4), Uniform::new(-1., 1.), &mut rng);
        let q = inv_quad(&t, &c, &u, &factor, &z).unwrap();
        let x = solve(&t, &c, &u, &factor, &z).unwrap();
        for k in 0..4 {
            let direct = z.column(k).dot(&x.column(k));
            assert_abs_diff_eq!(q[k], direct, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_not_positive_definite_row() {
        let t = array![0., 1., 2., 3., 4.];
        let (c, u, v) = Term::real(1.0, 0.5).matrices(&t);
        let diag = array![0.1, 0.1, -10., 0.1, 0.1];
        match factorize(&t, &c, &u, &v, &diag) {
            Err(GpError::NotPositiveDefinite { row }) => assert_eq!(row, 2),
            other => panic!("expected non positive definite, got {:?}", other),
        }
        let diag = Array1::from_elem(5, -10.);
        match factorize(&t, &c, &u, &v, &diag) {
            Err(GpError::NotPositiveDefinite { row }) => assert_eq!(row, 0),
            other => panic!("expected non positive definite, got {:?}", other),
        }
    }

    #[test]
    fn test_quiet_factorization() {
        let t = array![0., 1., 2., 3., 4.];
        let (c, u, v) = Term::real(1.0, 0.5).matrices(&t);
        let diag = Array1::from_elem(5, -10.);
        let outcome = factorize_quiet(&t, &c, &u, &v, &diag).unwrap();
        assert!(!outcome.is_positive_definite());
        assert!(outcome.factor().is_none());
        assert_eq!(outcome.log_det(), f64::NEG_INFINITY);
        assert!(outcome.into_result().is_err());

        let diag = Array1::from_elem(5, 0.1);
        let outcome = factorize_quiet(&t, &c, &u, &v, &diag).unwrap();
        assert!(outcome.is_positive_definite());
        assert!(outcome.log_det().is_finite());
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let t = array![0., 2., 1.];
        let (c, u, v) = Term::real(1.0, 0.5).matrices(&t);
        let diag = Array1::from_elem(3, 0.1);
        assert!(matches!(
            factorize(&t, &c, &u, &v, &diag),
            Err(GpError::InvalidValueError(_))
        ));

        let t = array![0., 1., 2.];
        let (c, u, v) = Term::real(1.0, 0.5).matrices(&t);
        let short_diag = Array1::from_elem(2, 0.1);
        assert!(matches!(
            factorize(&t, &c, &u, &v, &short_diag),
            Err(GpError::ShapeMismatch(_))
        ));

        let diag = Array1::from_elem(3, 0.1);
        let factor = factorize(&t, &c, &u, &v, &diag).unwrap();
        let z = Array2::<f64>::zeros((5, 1));
        assert!(matches!(
            solve(&t, &c, &u, &factor, &z),
            Err(GpError::ShapeMismatch(_))
        ));

        let empty = Array1::<f64>::zeros(0);
        let (ce, ue, ve) = Term::real(1.0, 0.5).matrices(&empty);
        assert!(factorize(&empty, &ce, &ue, &ve, &empty).is_err());
    }

    #[test]
    fn test_single_point() {
        let t = array![1.5];
        let diag = array![0.2];
        let (c, u, v) = Term::sho(1.0, 2.0, 3.0).matrices(&t);
        let factor = factorize(&t, &c, &u, &v, &diag).unwrap();
        let a0 = 0.2 + u.row(0).dot(&v.row(0));
        assert_abs_diff_eq!(factor.d()[0], a0, epsilon = 1e-12);
        let z = array![[2.0]];
        let x = solve(&t, &c, &u, &factor, &z).unwrap();
        assert_abs_diff_eq!(x[[0, 0]], 2.0 / a0, epsilon = 1e-12);
        let y = matmul(&t, &c, &u, &v, &diag, &z).unwrap();
        assert_abs_diff_eq!(y[[0, 0]], 2.0 * a0, epsilon = 1e-12);
    }

    #[test]
    fn test_rank_zero_is_diagonal() {
        let t = array![0., 1., 2.];
        let c = Array1::<f64>::zeros(0);
        let u = Array2::<f64>::zeros((3, 0));
        let v = Array2::<f64>::zeros((3, 0));
        let diag = array![0.5, 1.0, 2.0];
        let factor = factorize(&t, &c, &u, &v, &diag).unwrap();
        assert_eq!(factor.rank(), 0);
        assert_abs_diff_eq!(factor.d(), &diag, epsilon = 1e-15);
        let z = array![[1.0], [2.0], [3.0]];
        let x = solve(&t, &c, &u, &factor, &z).unwrap();
        assert_abs_diff_eq!(x, array![[2.0], [2.0], [1.5]], epsilon = 1e-15);
    }

    #[test]
    fn test_parallel_columns_match_sequential() {
        let mut rng = Xoshiro256Plus::seed_from_u64(23);
        let n = 64;
        let t = sorted_times(n, &mut rng);
        let diag = Array1::from_elem(n, 0.3);
        let term = Term::sho(1.0, 2.0, 3.0) + Term::real(0.5, 0.8);
        let (c, u, v) = term.matrices(&t);
        let factor = factorize(&t, &c, &u, &v, &diag).unwrap();
        let z = Array::random_using((n, 4 * PAR_MIN_RHS), Uniform::new(-1., 1.), &mut rng);
        let x = solve(&t, &c, &u, &factor, &z).unwrap();
        for k in 0..z.ncols() {
            let col = z.column(k).to_owned().insert_axis(Axis(1));
            let xk = solve(&t, &c, &u, &factor, &col).unwrap();
            assert_abs_diff_eq!(x.column(k).to_owned(), xk.column(0).to_owned(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_concurrent_solves_share_factorization() {
        let mut rng = Xoshiro256Plus::seed_from_u64(29);
        let n = 40;
        let t = sorted_times(n, &mut rng);
        let diag = Array1::from_elem(n, 0.3);
        let (c, u, v) = Term::sho(1.0, 2.0, 3.0).matrices(&t);
        let factor = factorize(&t, &c, &u, &v, &diag).unwrap();
        let rhs: Vec<Array2<f64>> = (0..8)
            .map(|_| Array::random_using((n, 1), Uniform::new(-1., 1.), &mut rng))
            .collect();
        let sequential: Vec<Array2<f64>> = rhs
            .iter()
            .map(|z| solve(&t, &c, &u, &factor, z).unwrap())
            .collect();
        let concurrent: Vec<Array2<f64>> = rhs
            .par_iter()
            .map(|z| solve(&t, &c, &u, &factor, z).unwrap())
            .collect();
        for (a, b) in sequential.iter().zip(concurrent.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 0.);
        }
    }

    #[test]
    fn test_traced_variants_match_plain() {
        let mut rng = Xoshiro256Plus::seed_from_u64(31);
        let n = 25;
        let t = sorted_times(n, &mut rng);
        let diag = Array1::from_elem(n, 0.3);
        let term = Term::sho(1.0, 2.0, 3.0) + Term::real(0.4, 0.6);
        let (c, u, v) = term.matrices(&t);
        let factor = factorize(&t, &c, &u, &v, &diag).unwrap();
        let (traced, _) = factorize_traced(&t, &c, &u, &v, &diag).unwrap();
        assert_abs_diff_eq!(factor.d(), traced.d(), epsilon = 1e-14);
        assert_abs_diff_eq!(factor.w(), traced.w(), epsilon = 1e-14);

        let z = Array::random_using((n, 2), Uniform::new(-1., 1.), &mut rng);
        let x = solve(&t, &c, &u, &factor, &z).unwrap();
        let (xt, _) = solve_traced(&t, &c, &u, &factor, &z).unwrap();
        assert_abs_diff_eq!(x, xt, epsilon = 1e-14);

        let y = matmul(&t, &c, &u, &v, &diag, &z).unwrap();
        let (yt, _) = matmul_traced(&t, &c, &u, &v, &diag, &z).unwrap();
        assert_abs_diff_eq!(y, yt, epsilon = 1e-14);
    }

    #[test]
    fn test_conditional_mean_matches_dense() {
        let mut rng = Xoshiro256Plus::seed_from_u64(37);
        let n = 12;
        let t = sorted_times(n, &mut rng);
        let diag = Array1::from_elem(n, 0.2);
        let term = Term::sho(1.0, 2.0, 3.0) + Term::real(0.5, 0.7);
        let (c, u, v) = term.matrices(&t);
        let factor = factorize(&t, &c, &u, &v, &diag).unwrap();
        let y = Array::random_using((n, 1), Uniform::new(-1., 1.), &mut rng);
        let alpha = solve(&t, &c, &u, &factor, &y).unwrap().column(0).to_owned();

        // before all data, interleaved, coincident with a training point, beyond
        let t_star = array![
            t[0] - 1.0,
            0.5 * (t[2] + t[3]),
            t[5],
            0.5 * (t[8] + t[9]),
            t[n - 1] + 1.0
        ];
        let (c_star, mut u_star, mut v_star) = term.matrices(&t_star);
        assert_eq!(c_star.len(), c.len());
        let mut inds = Vec::new();
        for (m, &ts) in t_star.iter().enumerate() {
            let ind = crate::utils::searchsorted(&t, ts);
            if ind > 0 {
                let dt = ts - t[ind - 1];
                for j in 0..c.len() {
                    u_star[[m, j]] *= (-c[j] * dt).exp();
                }
            }
            if ind < n {
                let dt = t[ind] - ts;
                for j in 0..c.len() {
                    v_star[[m, j]] *= (-c[j] * dt).exp();
                }
            }
            inds.push(ind);
        }
        let mu = conditional_mean(&t, &c, &u, &v, &alpha, &u_star, &v_star, &inds).unwrap();

        for (m, &ts) in t_star.iter().enumerate() {
            let mut expected = 0.;
            for i in 0..n {
                expected += term.value(ts - t[i]) * alpha[i];
            }
            assert_abs_diff_eq!(mu[m], expected, epsilon = 1e-10);
        }
    }
}
