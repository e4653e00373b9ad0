//! Reverse-mode accumulation through the semiseparable sweeps.
//!
//! Each `*_rev` function replays a forward operation backwards from the trace
//! recorded by its `*_traced` counterpart and accumulates adjoints into
//! caller-owned buffers. A likelihood gradient chains [`log_det_rev`] and
//! [`solve_rev`] into [`factorize_rev`]: the first two fill a
//! [`FactorAdjoints`] seed, the last converts it into adjoints with respect
//! to the kernel coefficients `(t, c, U, V, diag)`. Everything stays O(n·r²).

use crate::algorithm::{FactorTrace, Factorization, MatmulTrace, SolveTrace};
use crate::errors::{GpError, Result};
use crate::utils::{check_coeffs, check_len, full_diag};

use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, ArrayView2, Axis, Data, Ix1, Ix2, Zip};

/// Adjoints with respect to the kernel coefficient inputs of the sweeps.
///
/// All `*_rev` functions accumulate with `+=` so one buffer can collect the
/// contributions of several chained operations.
#[derive(Debug, Clone)]
pub struct CoeffAdjoints<F: Float> {
    /// Adjoint of the input locations `t`
    pub t: Array1<F>,
    /// Adjoint of the decay rates `c`
    pub c: Array1<F>,
    /// Adjoint of the left coefficients `U`
    pub u: Array2<F>,
    /// Adjoint of the right coefficients `V`
    pub v: Array2<F>,
    /// Adjoint of the extra diagonal `diag`
    pub diag: Array1<F>,
}

impl<F: Float> CoeffAdjoints<F> {
    /// Zero-initialized buffers for a system of `n` points and rank `r`.
    pub fn zeros(n: usize, r: usize) -> Self {
        CoeffAdjoints {
            t: Array1::zeros(n),
            c: Array1::zeros(r),
            u: Array2::zeros((n, r)),
            v: Array2::zeros((n, r)),
            diag: Array1::zeros(n),
        }
    }
}

/// Adjoints with respect to the factorization outputs `(d, W)`.
///
/// Used both as a seed for [`factorize_rev`] and as an output of
/// [`solve_rev`] and [`log_det_rev`].
#[derive(Debug, Clone)]
pub struct FactorAdjoints<F: Float> {
    /// Adjoint of the factorized diagonal `d`
    pub d: Array1<F>,
    /// Adjoint of the rescaled coefficients `W`
    pub w: Array2<F>,
}

impl<F: Float> FactorAdjoints<F> {
    /// Zero-initialized buffers for a system of `n` points and rank `r`.
    pub fn zeros(n: usize, r: usize) -> Self {
        FactorAdjoints {
            d: Array1::zeros(n),
            w: Array2::zeros((n, r)),
        }
    }
}

fn check_adjoint_dims<F: Float>(out: &CoeffAdjoints<F>, n: usize, r: usize) -> Result<()> {
    if out.t.len() != n
        || out.c.len() != r
        || out.u.dim() != (n, r)
        || out.v.dim() != (n, r)
        || out.diag.len() != n
    {
        return Err(GpError::ShapeMismatch(format!(
            "adjoint buffers do not match the system size ({}, {})",
            n, r
        )));
    }
    Ok(())
}

/// Chains propagator adjoints `bp[i, j]` back onto `t` and `c` through
/// `p[i, j] = exp(-c[j]·(t[i+1] - t[i]))`.
fn propagator_chain<F: Float>(
    t: &ArrayView1<F>,
    c: &ArrayView1<F>,
    p: &ArrayView2<F>,
    bp: &ArrayView2<F>,
    bt: &mut Array1<F>,
    bc: &mut Array1<F>,
) {
    let r = c.len();
    for i in 0..p.nrows() {
        let dt = t[i + 1] - t[i];
        let mut acc = F::zero();
        for j in 0..r {
            let g = bp[[i, j]] * p[[i, j]];
            bc[j] -= g * dt;
            acc += g * c[j];
        }
        bt[i + 1] -= acc;
        bt[i] += acc;
    }
}

/// Propagates adjoints of the factorization outputs `(d, W)` back onto the
/// kernel coefficients by replaying the factorization sweep in reverse.
#[allow(clippy::too_many_arguments)]
pub fn factorize_rev<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    v: &ArrayBase<impl Data<Elem = F>, Ix2>,
    factor: &Factorization<F>,
    trace: &FactorTrace<F>,
    seed: &FactorAdjoints<F>,
    out: &mut CoeffAdjoints<F>,
) -> Result<()> {
    let (n, r) = check_coeffs(t, c, u, v)?;
    if factor.n() != n || factor.rank() != r || trace.s.dim() != (n, r, r) {
        return Err(GpError::ShapeMismatch(
            "factorization or trace does not match the coefficients".to_string(),
        ));
    }
    if seed.d.len() != n || seed.w.dim() != (n, r) {
        return Err(GpError::ShapeMismatch(
            "adjoint seed does not match the factorization".to_string(),
        ));
    }
    check_adjoint_dims(out, n, r)?;

    let two = F::cast(2.);
    let mut ba = seed.d.to_owned();
    // bwd holds the running w adjoint divided by the matching d
    let mut bwd = seed.w.to_owned();
    Zip::from(bwd.rows_mut())
        .and(factor.d())
        .for_each(|mut row, &di| row.mapv_inplace(|bw| bw / di));
    let mut bu_loc = Array2::<F>::zeros((n, r));
    let mut bs = Array2::<F>::zeros((r, r));
    let mut bp = Array2::<F>::zeros((n.saturating_sub(1), r));
    let mut h1 = Array1::<F>::zeros(r);
    let mut h2 = Array1::<F>::zeros(r);

    for i in (1..n).rev() {
        let sh = trace.s.index_axis(Axis(0), i);
        let wi = factor.w().row(i);
        let ui = u.row(i);
        let pi = trace.p.row(i - 1);
        let bai = ba[i] - wi.dot(&bwd.row(i));
        ba[i] = bai;
        for j in 0..r {
            let b = bwd[[i, j]];
            h1[j] = b + two * bai * ui[j];
            h2[j] = b + bai * ui[j];
        }
        for k in 0..r {
            let mut acc = F::zero();
            for j in 0..r {
                acc += h1[j] * sh[[j, k]];
            }
            bu_loc[[i, k]] = -pi[k] * acc;
        }
        for j in 0..r {
            let uj = ui[j];
            for k in 0..r {
                bs[[j, k]] -= uj * h2[k];
            }
        }
        for m in 0..r {
            let mut acc = F::zero();
            for k in 0..r {
                acc += sh[[k, m]] * (bs[[m, k]] + bs[[k, m]]);
            }
            bp[[i - 1, m]] += acc;
        }
        for j in 0..r {
            let pj = pi[j];
            for k in 0..r {
                bs[[j, k]] *= pj * pi[k];
            }
        }
        let wprev = factor.w().row(i - 1);
        for k in 0..r {
            let mut acc = F::zero();
            for j in 0..r {
                acc += wprev[j] * (bs[[j, k]] + bs[[k, j]]);
            }
            bwd[[i - 1, k]] += acc;
        }
        let mut acc = F::zero();
        for j in 0..r {
            let wj = wprev[j];
            for k in 0..r {
                acc += wj * bs[[j, k]] * wprev[k];
            }
        }
        ba[i - 1] += acc;
    }
    {
        let dot = factor.w().row(0).dot(&bwd.row(0));
        ba[0] -= dot;
    }

    Zip::from(&mut out.diag).and(&ba).for_each(|o, &b| *o += b);
    for i in 0..n {
        let bai = ba[i];
        for j in 0..r {
            out.u[[i, j]] += bu_loc[[i, j]] + bai * v[[i, j]];
            out.v[[i, j]] += bwd[[i, j]] + bai * u[[i, j]];
        }
    }
    propagator_chain(
        &t.view(),
        &c.view(),
        &trace.p.view(),
        &bp.view(),
        &mut out.t,
        &mut out.c,
    );
    Ok(())
}

/// Propagates adjoints of a solve output `x = K⁻¹·z` back onto the system.
///
/// Direct dependencies on `(t, c, U)` land in `out`, the dependency through
/// the factorization lands in `fadj` (to be fed to [`factorize_rev`]) and the
/// dependency on the right-hand side accumulates into `bz`.
#[allow(clippy::too_many_arguments)]
pub fn solve_rev<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    factor: &Factorization<F>,
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    trace: &SolveTrace<F>,
    bx: &ArrayBase<impl Data<Elem = F>, Ix2>,
    out: &mut CoeffAdjoints<F>,
    fadj: &mut FactorAdjoints<F>,
    bz: &mut Array2<F>,
) -> Result<()> {
    let (n, r) = (t.len(), c.len());
    if n == 0 {
        return Err(GpError::InvalidValueError("t must not be empty".to_string()));
    }
    let k = x.ncols();
    if u.dim() != (n, r) || factor.n() != n || factor.rank() != r {
        return Err(GpError::ShapeMismatch(
            "factorization does not match the coefficients".to_string(),
        ));
    }
    if x.dim() != (n, k) || bx.dim() != (n, k) || bz.dim() != (n, k) || trace.f.dim() != (n, r, k)
    {
        return Err(GpError::ShapeMismatch(
            "solve adjoints do not match the forward shapes".to_string(),
        ));
    }
    check_adjoint_dims(out, n, r)?;
    if fadj.d.len() != n || fadj.w.dim() != (n, r) {
        return Err(GpError::ShapeMismatch(
            "factor adjoint buffers do not match the factorization".to_string(),
        ));
    }

    let mut bxw = bx.to_owned();
    // xw is rolled back stage by stage as the sweeps are replayed in reverse
    let mut xw = x.to_owned();
    let mut bg = Array2::<F>::zeros((r, k));
    let mut bp = Array2::<F>::zeros((n.saturating_sub(1), r));

    for i in 0..n - 1 {
        let gi = trace.g.index_axis(Axis(0), i);
        let pi = trace.p.row(i);
        let wi = factor.w().row(i);
        {
            let mut xwi = xw.row_mut(i);
            for j in 0..r {
                let wp = wi[j] * pi[j];
                Zip::from(&mut xwi)
                    .and(&gi.row(j))
                    .for_each(|xv, &gv| *xv += wp * gv);
            }
        }
        let (bx_head, mut bx_tail) = bxw.view_mut().split_at(Axis(0), i + 1);
        let bxi = bx_head.row(i);
        let mut bxnext = bx_tail.row_mut(0);
        for j in 0..r {
            let gij = gi.row(j);
            fadj.w[[i, j]] -= pi[j] * bxi.dot(&gij);
            let wj = wi[j];
            Zip::from(&mut bg.row_mut(j))
                .and(&bxi)
                .for_each(|bv, &xv| *bv -= wj * xv);
            bp[[i, j]] += bg.row(j).dot(&gij);
            let pj = pi[j];
            bg.row_mut(j).mapv_inplace(|bv| bv * pj);
            out.u[[i + 1, j]] += x.row(i + 1).dot(&bg.row(j));
            let uj = u[[i + 1, j]];
            Zip::from(&mut bxnext)
                .and(&bg.row(j))
                .for_each(|bv, &gv| *bv += uj * gv);
        }
    }

    Zip::from(bxw.rows_mut())
        .and(xw.rows_mut())
        .and(factor.d())
        .and(&mut fadj.d)
        .for_each(|mut brow, mut xrow, &di, bd| {
            let mut acc = F::zero();
            Zip::from(&mut brow).and(&mut xrow).for_each(|bv, xv| {
                *bv /= di;
                acc += *bv * *xv;
                *xv *= di;
            });
            *bd -= acc;
        });

    let mut bf = Array2::<F>::zeros((r, k));
    for i in (1..n).rev() {
        let fi = trace.f.index_axis(Axis(0), i);
        let pi = trace.p.row(i - 1);
        let (mut bx_head, bx_tail) = bxw.view_mut().split_at(Axis(0), i);
        let bxi = bx_tail.row(0);
        let mut bxprev = bx_head.row_mut(i - 1);
        let xwprev = xw.row(i - 1);
        let wprev = factor.w().row(i - 1);
        for j in 0..r {
            let fij = fi.row(j);
            out.u[[i, j]] -= pi[j] * bxi.dot(&fij);
            let uj = u[[i, j]];
            Zip::from(&mut bf.row_mut(j))
                .and(&bxi)
                .for_each(|bv, &xv| *bv -= uj * xv);
            bp[[i - 1, j]] += bf.row(j).dot(&fij);
            let pj = pi[j];
            bf.row_mut(j).mapv_inplace(|bv| bv * pj);
            fadj.w[[i - 1, j]] += xwprev.dot(&bf.row(j));
            let wj = wprev[j];
            Zip::from(&mut bxprev)
                .and(&bf.row(j))
                .for_each(|bv, &fv| *bv += wj * fv);
        }
    }

    *bz += &bxw;
    propagator_chain(
        &t.view(),
        &c.view(),
        &trace.p.view(),
        &bp.view(),
        &mut out.t,
        &mut out.c,
    );
    Ok(())
}

/// Propagates adjoints of a matrix product `y = K·z` back onto the kernel
/// coefficients (into `out`) and the multiplicand (into `bz`).
#[allow(clippy::too_many_arguments)]
pub fn matmul_rev<F: Float>(
    t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    c: &ArrayBase<impl Data<Elem = F>, Ix1>,
    u: &ArrayBase<impl Data<Elem = F>, Ix2>,
    v: &ArrayBase<impl Data<Elem = F>, Ix2>,
    diag: &ArrayBase<impl Data<Elem = F>, Ix1>,
    z: &ArrayBase<impl Data<Elem = F>, Ix2>,
    trace: &MatmulTrace<F>,
    by: &ArrayBase<impl Data<Elem = F>, Ix2>,
    out: &mut CoeffAdjoints<F>,
    bz: &mut Array2<F>,
) -> Result<()> {
    let (n, r) = check_coeffs(t, c, u, v)?;
    check_len(diag, n, "diag")?;
    let k = z.ncols();
    if z.dim() != (n, k) || by.dim() != (n, k) || bz.dim() != (n, k) || trace.fu.dim() != (n, r, k)
    {
        return Err(GpError::ShapeMismatch(
            "matmul adjoints do not match the forward shapes".to_string(),
        ));
    }
    check_adjoint_dims(out, n, r)?;

    let a = full_diag(u, v, diag);
    let mut ba = Array1::<F>::zeros(n);
    Zip::from(&mut ba)
        .and(by.rows())
        .and(z.rows())
        .for_each(|b, byr, zr| *b = byr.dot(&zr));
    Zip::from(bz.rows_mut())
        .and(by.rows())
        .and(&a)
        .for_each(|mut bzr, byr, &ai| {
            Zip::from(&mut bzr).and(&byr).for_each(|bv, &yv| *bv += ai * yv);
        });

    let mut bf = Array2::<F>::zeros((r, k));
    let mut bp = Array2::<F>::zeros((n.saturating_sub(1), r));
    for i in 0..n - 1 {
        let fui = trace.fu.index_axis(Axis(0), i);
        let pi = trace.p.row(i);
        let byi = by.row(i);
        for j in 0..r {
            let fj = fui.row(j);
            out.v[[i, j]] += pi[j] * byi.dot(&fj);
            let vj = v[[i, j]];
            Zip::from(&mut bf.row_mut(j))
                .and(&byi)
                .for_each(|bv, &yv| *bv += vj * yv);
            bp[[i, j]] += bf.row(j).dot(&fj);
            let pj = pi[j];
            bf.row_mut(j).mapv_inplace(|bv| bv * pj);
            out.u[[i + 1, j]] += z.row(i + 1).dot(&bf.row(j));
            let uj = u[[i + 1, j]];
            let mut bznext = bz.row_mut(i + 1);
            Zip::from(&mut bznext)
                .and(&bf.row(j))
                .for_each(|bv, &fv| *bv += uj * fv);
        }
    }

    bf.fill(F::zero());
    for i in (1..n).rev() {
        let fli = trace.fl.index_axis(Axis(0), i);
        let pi = trace.p.row(i - 1);
        let byi = by.row(i);
        for j in 0..r {
            let fj = fli.row(j);
            out.u[[i, j]] += pi[j] * byi.dot(&fj);
            let uj = u[[i, j]];
            Zip::from(&mut bf.row_mut(j))
                .and(&byi)
                .for_each(|bv, &yv| *bv += uj * yv);
            bp[[i - 1, j]] += bf.row(j).dot(&fj);
            let pj = pi[j];
            bf.row_mut(j).mapv_inplace(|bv| bv * pj);
            out.v[[i - 1, j]] += z.row(i - 1).dot(&bf.row(j));
            let vj = v[[i - 1, j]];
            let mut bzprev = bz.row_mut(i - 1);
            Zip::from(&mut bzprev)
                .and(&bf.row(j))
                .for_each(|bv, &fv| *bv += vj * fv);
        }
    }

    for i in 0..n {
        let bai = ba[i];
        out.diag[i] += bai;
        for j in 0..r {
            out.u[[i, j]] += bai * v[[i, j]];
            out.v[[i, j]] += bai * u[[i, j]];
        }
    }
    propagator_chain(
        &t.view(),
        &c.view(),
        &trace.p.view(),
        &bp.view(),
        &mut out.t,
        &mut out.c,
    );
    Ok(())
}

/// Seeds the factor adjoints for a log-determinant: `∂ ln det K / ∂d[i] = 1/d[i]`.
pub fn log_det_rev<F: Float>(
    factor: &Factorization<F>,
    bld: F,
    fadj: &mut FactorAdjoints<F>,
) -> Result<()> {
    if fadj.d.len() != factor.n() {
        return Err(GpError::ShapeMismatch(
            "factor adjoint buffers do not match the factorization".to_string(),
        ));
    }
    Zip::from(&mut fadj.d)
        .and(factor.d())
        .for_each(|bd, &di| *bd += bld / di);
    Ok(())
}
