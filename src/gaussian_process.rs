use crate::algorithm::{
    conditional_mean, dot_tril, factorize_quiet, inv_quad, solve, FactorOutcome, Factorization,
};
use crate::errors::{GpError, Result};
use crate::terms::Term;
use crate::utils::{check_len, check_sorted, searchsorted};

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

use linfa::Float;
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2};
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;

/// Everything derived from one `compute()` call: the coefficient matrices of
/// the kernel at the input locations and the factorization built from them.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
struct ComputedState<F: Float> {
    t: Array1<F>,
    diag: Array1<F>,
    c: Array1<F>,
    u: Array2<F>,
    v: Array2<F>,
    outcome: FactorOutcome<F>,
    norm: F,
    stale: bool,
}

/// Gaussian process regression for one dimensional time series with a
/// celerite covariance kernel.
///
/// The model holds a [`Term`] kernel and, after [`compute`](Self::compute),
/// the semiseparable factorization of the covariance matrix at the input
/// locations. Likelihoods, predictions and samples all run in O(n·r²) where
/// `r` is the kernel rank.
///
/// ```
/// use ndarray::Array1;
/// use semisep::{terms::Term, GaussianProcess};
///
/// let t = Array1::linspace(0., 5., 40);
/// let diag = Array1::from_elem(40, 0.09);
/// let y = t.mapv(f64::sin);
///
/// let kernel = Term::sho(1.0, 2.0, 3.0) + Term::real(0.5, 1.0);
/// let mut gp = GaussianProcess::new(kernel);
/// gp.compute(&t, &diag).expect("factorization");
/// let ll = gp.log_likelihood(&y).expect("likelihood");
/// assert!(ll.is_finite());
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct GaussianProcess<F: Float> {
    kernel: Term<F>,
    mean: F,
    state: Option<ComputedState<F>>,
}

impl<F: Float> GaussianProcess<F> {
    /// A model with the given kernel and a zero mean function.
    pub fn new(kernel: Term<F>) -> Self {
        GaussianProcess {
            kernel,
            mean: F::zero(),
            state: None,
        }
    }

    /// Sets a constant mean function.
    pub fn with_mean(mut self, mean: F) -> Self {
        self.mean = mean;
        self
    }

    /// The covariance kernel.
    pub fn kernel(&self) -> &Term<F> {
        &self.kernel
    }

    /// Mutable access to the kernel. Marks any existing factorization as
    /// stale; call [`recompute`](Self::recompute) before using the model
    /// again.
    pub fn kernel_mut(&mut self) -> &mut Term<F> {
        if let Some(state) = self.state.as_mut() {
            state.stale = true;
        }
        &mut self.kernel
    }

    /// The constant mean.
    pub fn mean(&self) -> F {
        self.mean
    }

    /// Factorizes the covariance matrix of the kernel at the sorted input
    /// locations `t` with per-point measurement variance `diag`.
    ///
    /// Fails with [`GpError::NotPositiveDefinite`] when the matrix is not
    /// positive definite, leaving any previous factorization in place.
    pub fn compute(
        &mut self,
        t: &ArrayBase<impl Data<Elem = F>, Ix1>,
        diag: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<()> {
        self.compute_impl(t, diag, false)
    }

    /// Like [`compute`](Self::compute) but a non positive definite matrix is
    /// recorded instead of raised: the log-likelihood becomes `-inf`, which
    /// lets samplers reject the parameters without unwinding.
    pub fn compute_quiet(
        &mut self,
        t: &ArrayBase<impl Data<Elem = F>, Ix1>,
        diag: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<()> {
        self.compute_impl(t, diag, true)
    }

    /// Refactorizes with the stored inputs after a kernel change. On failure
    /// the model returns to the not computed state.
    pub fn recompute(&mut self, quiet: bool) -> Result<()> {
        let state = self.state.take().ok_or(GpError::NotComputed)?;
        let (t, diag) = (state.t, state.diag);
        self.compute_impl(&t, &diag, quiet)
    }

    fn compute_impl(
        &mut self,
        t: &ArrayBase<impl Data<Elem = F>, Ix1>,
        diag: &ArrayBase<impl Data<Elem = F>, Ix1>,
        quiet: bool,
    ) -> Result<()> {
        let (c, u, v) = self.kernel.matrices(t);
        // exposure integrated kernels carry part of their variance outside
        // the lowered matrices
        let corr = self.kernel.variance_correction();
        let noise = if corr != F::zero() {
            diag.mapv(|dv| dv + corr)
        } else {
            diag.to_owned()
        };
        let outcome = factorize_quiet(t, &c, &u, &v, &noise)?;
        let n = t.len();
        let norm = match &outcome {
            FactorOutcome::Factored(factor) => {
                debug!("Semiseparable factorization: n={}, rank={}", n, c.len());
                let ln2pi = F::cast(2. * std::f64::consts::PI).ln();
                -F::cast(0.5) * (F::cast(n as f64) * ln2pi + factor.log_det())
            }
            FactorOutcome::NotPositiveDefinite { row, .. } => {
                if !quiet {
                    return Err(GpError::NotPositiveDefinite { row: *row });
                }
                warn!(
                    "Covariance matrix not positive definite at row {}; log-likelihood set to -inf",
                    row
                );
                F::neg_infinity()
            }
        };
        self.state = Some(ComputedState {
            t: t.to_owned(),
            diag: diag.to_owned(),
            c,
            u,
            v,
            outcome,
            norm,
            stale: false,
        });
        Ok(())
    }

    fn state(&self) -> Result<&ComputedState<F>> {
        match &self.state {
            None => Err(GpError::NotComputed),
            Some(state) if state.stale => Err(GpError::StaleFactorization),
            Some(state) => Ok(state),
        }
    }

    fn factored(&self) -> Result<(&ComputedState<F>, &Factorization<F>)> {
        let state = self.state()?;
        match &state.outcome {
            FactorOutcome::Factored(factor) => Ok((state, factor)),
            FactorOutcome::NotPositiveDefinite { row, .. } => {
                Err(GpError::NotPositiveDefinite { row: *row })
            }
        }
    }

    /// Log-determinant of the factorized covariance matrix, `-inf` after a
    /// quiet factorization failure.
    pub fn log_det(&self) -> Result<F> {
        Ok(self.state()?.outcome.log_det())
    }

    /// Marginal log-likelihood of the observations `y`, `-inf` after a quiet
    /// factorization failure.
    pub fn log_likelihood(&self, y: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<F> {
        let state = self.state()?;
        check_len(y, state.t.len(), "y")?;
        let factor = match &state.outcome {
            FactorOutcome::Factored(factor) => factor,
            FactorOutcome::NotPositiveDefinite { .. } => return Ok(F::neg_infinity()),
        };
        let mean = self.mean;
        let resid = y.mapv(|yv| yv - mean).insert_axis(Axis(1));
        let quad = inv_quad(&state.t, &state.c, &state.u, factor, &resid)?;
        Ok(state.norm - F::cast(0.5) * quad[0])
    }

    /// Applies `K⁻¹` to the columns of `z`.
    pub fn apply_inverse(&self, z: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        let (state, factor) = self.factored()?;
        solve(&state.t, &state.c, &state.u, factor, z)
    }

    /// Applies the Cholesky-like factor `L·diag(√d)` to the columns of `z`.
    pub fn dot_l(&self, z: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        let (state, factor) = self.factored()?;
        dot_tril(&state.t, &state.c, &state.u, factor, z)
    }

    /// Posterior mean of the process at the sorted prediction points
    /// `t_star`, given the observations `y`.
    pub fn predict(
        &self,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
        t_star: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<Array1<F>> {
        let (state, factor) = self.factored()?;
        let n = state.t.len();
        check_len(y, n, "y")?;
        check_sorted(t_star, "t_star")?;
        let mean = self.mean;
        let resid = y.mapv(|yv| yv - mean).insert_axis(Axis(1));
        let alpha = solve(&state.t, &state.c, &state.u, factor, &resid)?
            .index_axis_move(Axis(1), 0);
        let (u_star, v_star, inds) = conditional_matrices(&self.kernel, state, t_star);
        let mu = conditional_mean(
            &state.t, &state.c, &state.u, &state.v, &alpha, &u_star, &v_star, &inds,
        )?;
        Ok(mu + self.mean)
    }

    /// Posterior variance of the process at the sorted prediction points.
    ///
    /// This needs a dense `n×m` cross covariance block, so it costs
    /// O(n·m) instead of the O((n + m)·r) of [`predict`](Self::predict).
    pub fn predict_var(
        &self,
        t_star: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<Array1<F>> {
        let (state, factor) = self.factored()?;
        check_sorted(t_star, "t_star")?;
        let n = state.t.len();
        let m = t_star.len();
        let kappa0 = self.kernel.value(F::zero());
        let kxs =
            Array2::from_shape_fn((n, m), |(i, j)| self.kernel.value(state.t[i] - t_star[j]));
        let xsol = solve(&state.t, &state.c, &state.u, factor, &kxs)?;
        let mut var = Array1::<F>::zeros(m);
        for j in 0..m {
            var[j] = kappa0 - kxs.column(j).dot(&xsol.column(j));
        }
        // slightly negative values can come out of the subtraction at machine
        // precision: clamp to zero
        Ok(var.mapv(|v| if v < F::zero() { F::zero() } else { v }))
    }

    /// Draws `n_traj` prior trajectories at the computed input locations,
    /// seeding the generator from the system entropy.
    pub fn sample(&self, n_traj: usize) -> Result<Array2<F>> {
        let mut rng = Xoshiro256Plus::from_entropy();
        self.sample_using(n_traj, &mut rng)
    }

    /// Draws `n_traj` prior trajectories at the computed input locations
    /// using the given random generator. Trajectories are the columns of the
    /// returned `n×n_traj` array.
    pub fn sample_using<R: Rng + ?Sized>(
        &self,
        n_traj: usize,
        rng: &mut R,
    ) -> Result<Array2<F>> {
        let (state, factor) = self.factored()?;
        let n = state.t.len();
        let z = Array2::<f64>::random_using((n, n_traj), StandardNormal, rng)
            .mapv(|v| F::cast(v));
        let draws = dot_tril(&state.t, &state.c, &state.u, factor, &z)?;
        Ok(draws + self.mean)
    }
}

/// Coefficient rows of the kernel at the prediction points, with the decay
/// over the gap to the neighboring training points folded in so that
/// [`conditional_mean`] only has to stitch them into its two sweeps.
fn conditional_matrices<F: Float>(
    kernel: &Term<F>,
    state: &ComputedState<F>,
    t_star: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> (Array2<F>, Array2<F>, Vec<usize>) {
    let n = state.t.len();
    let r = state.c.len();
    let (_, mut u_star, mut v_star) = kernel.matrices(t_star);
    let mut inds = Vec::with_capacity(t_star.len());
    for (m, &ts) in t_star.iter().enumerate() {
        let ind = searchsorted(&state.t, ts);
        if ind > 0 {
            let dt = ts - state.t[ind - 1];
            for j in 0..r {
                u_star[[m, j]] *= (-state.c[j] * dt).exp();
            }
        }
        if ind < n {
            let dt = state.t[ind] - ts;
            for j in 0..r {
                v_star[[m, j]] *= (-state.c[j] * dt).exp();
            }
        }
        inds.push(ind);
    }
    (u_star, v_star, inds)
}
