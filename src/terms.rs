//! Celerite covariance kernels and their semiseparable coefficients.
//!
//! Every kernel in this family is a mixture of exponentially damped
//! (co)sinusoids,
//!
//! ```text
//! k(τ) = Σ_j a_j·exp(-c_j·τ) + Σ_j exp(-c_j·τ)·(a_j·cos(d_j·τ) + b_j·sin(d_j·τ))
//! ```
//!
//! with `τ = |t_n - t_m|`. Kernels of this shape generate semiseparable
//! covariance matrices, which is what makes the O(n·r²) sweeps in
//! [`crate::algorithm`] possible. Sums and products of celerite kernels stay
//! in the family, so [`Term`] is a small expression tree closed under `+` and
//! `*`.

use crate::errors::{GpError, Result};

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1};
use std::fmt;
use std::ops::{Add, Mul};

/// Flattened celerite coefficients of a kernel: the real terms `(a, c)` and
/// the complex terms `(a, b, c, d)` of the mixture.
#[derive(Debug, Clone, PartialEq)]
pub struct Coefficients<F: Float> {
    /// Real components `a·exp(-c·τ)`
    pub real: Vec<(F, F)>,
    /// Complex components `exp(-c·τ)·(a·cos(d·τ) + b·sin(d·τ))`
    pub complex: Vec<(F, F, F, F)>,
}

impl<F: Float> Coefficients<F> {
    /// Width of the semiseparable representation: one column per real
    /// component, two per complex component.
    pub fn rank(&self) -> usize {
        self.real.len() + 2 * self.complex.len()
    }

    /// Evaluates the covariance at lag `tau`.
    pub fn value(&self, tau: F) -> F {
        let tau = tau.abs();
        let mut k = F::zero();
        for &(a, c) in &self.real {
            k += a * (-c * tau).exp();
        }
        for &(a, b, c, d) in &self.complex {
            let (s, co) = (d * tau).sin_cos();
            k += (-c * tau).exp() * (a * co + b * s);
        }
        k
    }
}

/// A celerite covariance kernel.
///
/// Leaf kernels are built with the constructors ([`Term::real`],
/// [`Term::sho`], ...) and composed with `+` and `*`:
///
/// ```
/// use semisep::terms::Term;
///
/// let kernel = Term::sho(1.0, 2.0, 3.0) + Term::real(0.5, 1.0);
/// assert_eq!(kernel.rank(), 3);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Term<F: Float> {
    /// A single real component `a·exp(-c·τ)`
    Real {
        /// Amplitude
        a: F,
        /// Decay rate
        c: F,
    },
    /// A single complex component `exp(-c·τ)·(a·cos(d·τ) + b·sin(d·τ))`
    Complex {
        /// Cosine amplitude
        a: F,
        /// Sine amplitude
        b: F,
        /// Decay rate
        c: F,
        /// Oscillation frequency
        d: F,
    },
    /// A stochastically driven damped harmonic oscillator with power spectrum
    /// `S(ω) = √(2/π)·s0·w0⁴ / ((ω² - w0²)² + w0²·ω²/q²)`
    Sho {
        /// Power at `ω = 0`
        s0: F,
        /// Undamped angular frequency
        w0: F,
        /// Quality factor
        q: F,
        /// Regularization floor used near the critically damped point `q = 1/2`
        eps: F,
    },
    /// An approximate Matérn-3/2 kernel
    /// `σ²·(1 + √3·τ/ρ)·exp(-√3·τ/ρ)`
    Matern32 {
        /// Standard deviation
        sigma: F,
        /// Length scale
        rho: F,
        /// Frequency used to approximate the linear factor
        eps: F,
    },
    /// A sum of kernels
    Sum(Vec<Term<F>>),
    /// A product of two kernels
    Product(Box<Term<F>>, Box<Term<F>>),
    /// The kernel of the derivative of the wrapped process, `-d²k/dτ²`
    Diff(Box<Term<F>>),
    /// The wrapped kernel integrated over a boxcar exposure window
    Convolution {
        /// Kernel of the instantaneous process
        term: Box<Term<F>>,
        /// Exposure width
        delta: F,
    },
}

impl<F: Float> Term<F> {
    /// A real kernel `a·exp(-c·τ)`.
    pub fn real(a: F, c: F) -> Self {
        Term::Real { a, c }
    }

    /// A complex kernel `exp(-c·τ)·(a·cos(d·τ) + b·sin(d·τ))`.
    pub fn complex(a: F, b: F, c: F, d: F) -> Self {
        Term::Complex { a, b, c, d }
    }

    /// A stochastically driven damped harmonic oscillator kernel parametrized
    /// by the power `s0`, the undamped frequency `w0` and the quality factor
    /// `q`.
    pub fn sho(s0: F, w0: F, q: F) -> Self {
        Term::Sho {
            s0,
            w0,
            q,
            eps: F::cast(1e-5),
        }
    }

    /// [`Term::sho`] parametrized by the standard deviation of the process
    /// instead of the power: `s0 = σ² / (w0·q)`.
    pub fn sho_from_sigma(sigma: F, w0: F, q: F) -> Self {
        Term::sho(sigma * sigma / (w0 * q), w0, q)
    }

    /// An approximate Matérn-3/2 kernel with standard deviation `sigma` and
    /// length scale `rho`.
    pub fn matern32(sigma: F, rho: F) -> Self {
        Term::Matern32 {
            sigma,
            rho,
            eps: F::cast(0.01),
        }
    }

    /// A quasi-periodic kernel suited to stellar rotation signals: two
    /// oscillators, one at the rotation `period` and one at its first
    /// harmonic carrying a fraction `f` of the power.
    ///
    /// `sigma` is the standard deviation of the process, `q0` the quality
    /// factor of the secondary oscillation and `dq` the difference between
    /// the quality factors of the first and second modes.
    pub fn rotation(sigma: F, period: F, q0: F, dq: F, f: F) -> Result<Self> {
        if !(sigma > F::zero()) || !(period > F::zero()) || !(q0 > F::zero()) {
            return Err(GpError::InvalidValueError(
                "sigma, period and q0 must be positive".to_string(),
            ));
        }
        if !(dq >= F::zero()) || !(F::zero()..=F::one()).contains(&f) {
            return Err(GpError::InvalidValueError(
                "dq must be non negative and f must lie in [0, 1]".to_string(),
            ));
        }
        let two = F::cast(2.);
        let four = F::cast(4.);
        let half = F::cast(0.5);
        let pi = F::cast(std::f64::consts::PI);
        let amp = sigma * sigma / (F::one() + f);

        let q1 = half + q0 + dq;
        let w1 = four * pi * q1 / (period * (four * q1 * q1 - F::one()).sqrt());
        let s1 = amp / (w1 * q1);

        let q2 = half + q0;
        let w2 = two * four * pi * q2 / (period * (four * q2 * q2 - F::one()).sqrt());
        let s2 = f * amp / (w2 * q2);

        Ok(Term::sho(s1, w1, q1) + Term::sho(s2, w2, q2))
    }

    /// The kernel of the time derivative of the process described by `term`,
    /// `-d²k/dτ²`.
    ///
    /// The wrapped kernel must describe a differentiable process for the
    /// result to be a valid covariance; exposure integrated kernels are
    /// rejected.
    pub fn diff(term: Term<F>) -> Result<Self> {
        if term.contains_convolution() {
            return Err(GpError::InvalidValueError(
                "cannot differentiate an exposure integrated kernel".to_string(),
            ));
        }
        Ok(Term::Diff(Box::new(term)))
    }

    /// The kernel of the process described by `term` integrated over a boxcar
    /// exposure of width `delta`, as seen in binned photometry.
    ///
    /// The lowered matrices reproduce the integrated kernel at separations of
    /// `delta` or more; entries closer to the diagonal use the extrapolated
    /// coefficients, with the variance itself restored through
    /// [`Term::variance_correction`].
    pub fn convolution(term: Term<F>, delta: F) -> Result<Self> {
        if !(delta > F::zero()) {
            return Err(GpError::InvalidValueError(
                "exposure width delta must be positive".to_string(),
            ));
        }
        if term.contains_convolution() {
            return Err(GpError::InvalidValueError(
                "exposure integration cannot be nested".to_string(),
            ));
        }
        Ok(Term::Convolution {
            term: Box::new(term),
            delta,
        })
    }

    fn contains_convolution(&self) -> bool {
        match self {
            Term::Convolution { .. } => true,
            Term::Sum(terms) => terms.iter().any(Term::contains_convolution),
            Term::Product(x, y) => x.contains_convolution() || y.contains_convolution(),
            Term::Diff(term) => term.contains_convolution(),
            _ => false,
        }
    }

    /// Width of the semiseparable representation of this kernel.
    pub fn rank(&self) -> usize {
        self.coefficients().rank()
    }

    /// Flattens the kernel tree into celerite coefficients, lowering the
    /// parametrized kernels and expanding products into the family.
    pub fn coefficients(&self) -> Coefficients<F> {
        let mut out = Coefficients {
            real: Vec::new(),
            complex: Vec::new(),
        };
        self.push_coefficients(&mut out);
        out
    }

    fn push_coefficients(&self, out: &mut Coefficients<F>) {
        let half = F::cast(0.5);
        let two = F::cast(2.);
        let four = F::cast(4.);
        match self {
            Term::Real { a, c } => out.real.push((*a, *c)),
            Term::Complex { a, b, c, d } => out.complex.push((*a, *b, *c, *d)),
            Term::Sho { s0, w0, q, eps } => {
                let (s0, w0, q, eps) = (*s0, *w0, *q, *eps);
                if q < half {
                    // overdamped: a pair of real exponentials
                    let f = (F::one() - four * q * q).max(eps).sqrt();
                    let a = half * s0 * w0 * q;
                    let c = half * w0 / q;
                    out.real.push((a * (F::one() + F::one() / f), c * (F::one() - f)));
                    out.real.push((a * (F::one() - F::one() / f), c * (F::one() + f)));
                } else {
                    // underdamped: one damped oscillation
                    let f = (four * q * q - F::one()).max(eps).sqrt();
                    let a = s0 * w0 * q;
                    let c = half * w0 / q;
                    out.complex.push((a, a / f, c, c * f));
                }
            }
            Term::Matern32 { sigma, rho, eps } => {
                let w0 = F::cast(3.).sqrt() / *rho;
                let s2 = *sigma * *sigma;
                out.complex.push((s2, s2 * w0 / *eps, w0, *eps));
            }
            Term::Sum(terms) => {
                for term in terms {
                    term.push_coefficients(out);
                }
            }
            Term::Product(x, y) => {
                let cx = x.coefficients();
                let cy = y.coefficients();
                for &(ax, crx) in &cx.real {
                    for &(ay, cry) in &cy.real {
                        out.real.push((ax * ay, crx + cry));
                    }
                    for &(ay, by, cy_, dy) in &cy.complex {
                        out.complex.push((ax * ay, ax * by, crx + cy_, dy));
                    }
                }
                for &(ax, bx, ccx, dx) in &cx.complex {
                    for &(ay, cry) in &cy.real {
                        out.complex.push((ax * ay, bx * ay, ccx + cry, dx));
                    }
                    for &(ay, by, ccy, dy) in &cy.complex {
                        out.complex.push((
                            half * (ax * ay + bx * by),
                            half * (bx * ay - ax * by),
                            ccx + ccy,
                            dx - dy,
                        ));
                        out.complex.push((
                            half * (ax * ay - bx * by),
                            half * (ax * by + bx * ay),
                            ccx + ccy,
                            dx + dy,
                        ));
                    }
                }
            }
            Term::Diff(term) => {
                let inner = term.coefficients();
                for &(a, c) in &inner.real {
                    out.real.push((-a * c * c, c));
                }
                for &(a, b, c, d) in &inner.complex {
                    let c2 = c * c;
                    let d2 = d * d;
                    out.complex.push((
                        a * (d2 - c2) + two * b * c * d,
                        b * (d2 - c2) - two * a * c * d,
                        c,
                        d,
                    ));
                }
            }
            Term::Convolution { term, delta } => {
                let dt = *delta;
                let inner = term.coefficients();
                for &(a, c) in &inner.real {
                    let cd = c * dt;
                    out.real.push((two * a * (cd.cosh() - F::one()) / (cd * cd), c));
                }
                for &(a, b, c, d) in &inner.complex {
                    let c2 = c * c;
                    let d2 = d * d;
                    let k1 = a * (c2 - d2) + two * b * c * d;
                    let k2 = b * (c2 - d2) - two * a * c * d;
                    let den = dt * (c2 + d2);
                    let norm = F::one() / (den * den);
                    let x = (c * dt).cosh() * (d * dt).cos() - F::one();
                    let y = (c * dt).sinh() * (d * dt).sin();
                    out.complex.push((
                        two * norm * (k1 * x - k2 * y),
                        two * norm * (k2 * x + k1 * y),
                        c,
                        d,
                    ));
                }
            }
        }
    }

    /// Evaluates the covariance at lag `tau`. Prefer
    /// [`Coefficients::value`] when evaluating many lags of a kernel without
    /// exposure integration.
    pub fn value(&self, tau: F) -> F {
        match self {
            Term::Sum(terms) => terms
                .iter()
                .fold(F::zero(), |acc, term| acc + term.value(tau)),
            Term::Product(x, y) => x.value(tau) * y.value(tau),
            Term::Convolution { term, delta } => {
                let tau = tau.abs();
                let k = self.coefficients().value(tau);
                if tau < *delta {
                    k + exposure_correction(&term.coefficients(), *delta, *delta - tau)
                } else {
                    k
                }
            }
            _ => self.coefficients().value(tau),
        }
    }

    /// The difference between the kernel variance [`Term::value`]`(0)` and
    /// the diagonal produced by the lowered [`Term::matrices`]. Zero unless
    /// the kernel contains a [`Term::convolution`] node; the façade adds it
    /// to the measurement variance before factorizing.
    pub fn variance_correction(&self) -> F {
        match self {
            Term::Convolution { term, delta } => {
                exposure_correction(&term.coefficients(), *delta, *delta)
            }
            Term::Sum(terms) => terms
                .iter()
                .fold(F::zero(), |acc, term| acc + term.variance_correction()),
            Term::Product(x, y) => {
                let cx = x.variance_correction();
                let cy = y.variance_correction();
                if cx == F::zero() && cy == F::zero() {
                    F::zero()
                } else {
                    let x0 = x.coefficients().value(F::zero());
                    let y0 = y.coefficients().value(F::zero());
                    (x0 + cx) * (y0 + cy) - x0 * y0
                }
            }
            _ => F::zero(),
        }
    }

    /// Builds the semiseparable matrices `(c, U, V)` of this kernel at the
    /// input locations `t`: decay rates of length `r` and `n×r` coefficient
    /// matrices such that `K[n, m] = U[n]·diag(exp(-c·(t_n - t_m)))·V[m]ᵀ`
    /// for `n > m`.
    pub fn matrices(
        &self,
        t: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> (Array1<F>, Array2<F>, Array2<F>) {
        let coeffs = self.coefficients();
        let n = t.len();
        let rank = coeffs.rank();
        let mut c = Array1::<F>::zeros(rank);
        let mut u = Array2::<F>::zeros((n, rank));
        let mut v = Array2::<F>::zeros((n, rank));
        let mut j = 0;
        for &(a, cr) in &coeffs.real {
            c[j] = cr;
            for i in 0..n {
                u[[i, j]] = a;
                v[[i, j]] = F::one();
            }
            j += 1;
        }
        for &(a, b, cc, dd) in &coeffs.complex {
            c[j] = cc;
            c[j + 1] = cc;
            for i in 0..n {
                let (s, co) = (dd * t[i]).sin_cos();
                u[[i, j]] = a * co + b * s;
                u[[i, j + 1]] = a * s - b * co;
                v[[i, j]] = co;
                v[[i, j + 1]] = s;
            }
            j += 2;
        }
        (c, u, v)
    }
}

/// Difference between the boxcar integrated kernel and its exponential
/// extrapolation at lag `delta - u`, for `0 <= u <= delta`. At `u = delta`
/// this is the variance deficit of the integrated process.
fn exposure_correction<F: Float>(coeffs: &Coefficients<F>, delta: F, u: F) -> F {
    let two = F::cast(2.);
    let mut corr = F::zero();
    for &(a, c) in &coeffs.real {
        let cd = c * delta;
        let cu = c * u;
        corr += two * a * (cu - cu.sinh()) / (cd * cd);
    }
    for &(a, b, c, d) in &coeffs.complex {
        let c2 = c * c;
        let d2 = d * d;
        let k1 = a * (c2 - d2) + two * b * c * d;
        let k2 = b * (c2 - d2) - two * a * c * d;
        let den = delta * (c2 + d2);
        let norm = F::one() / (den * den);
        let cu = c * u;
        let du = d * u;
        corr += two
            * norm
            * (k1 * cu - k2 * du - k1 * cu.sinh() * du.cos() + k2 * cu.cosh() * du.sin());
    }
    corr
}

impl<F: Float> Add for Term<F> {
    type Output = Term<F>;

    fn add(self, rhs: Term<F>) -> Term<F> {
        match (self, rhs) {
            (Term::Sum(mut a), Term::Sum(b)) => {
                a.extend(b);
                Term::Sum(a)
            }
            (Term::Sum(mut a), b) => {
                a.push(b);
                Term::Sum(a)
            }
            (a, Term::Sum(mut b)) => {
                b.insert(0, a);
                Term::Sum(b)
            }
            (a, b) => Term::Sum(vec![a, b]),
        }
    }
}

impl<F: Float> Mul for Term<F> {
    type Output = Term<F>;

    fn mul(self, rhs: Term<F>) -> Term<F> {
        Term::Product(Box::new(self), Box::new(rhs))
    }
}

impl<F: Float> fmt::Display for Term<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Term::Real { a, c } => write!(f, "Real(a={}, c={})", a, c),
            Term::Complex { a, b, c, d } => {
                write!(f, "Complex(a={}, b={}, c={}, d={})", a, b, c, d)
            }
            Term::Sho { s0, w0, q, .. } => write!(f, "Sho(s0={}, w0={}, q={})", s0, w0, q),
            Term::Matern32 { sigma, rho, .. } => {
                write!(f, "Matern32(sigma={}, rho={})", sigma, rho)
            }
            Term::Sum(terms) => {
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, " + ")?;
                    }
                    write!(f, "{}", term)?;
                }
                Ok(())
            }
            Term::Product(x, y) => write!(f, "({}) * ({})", x, y),
            Term::Diff(term) => write!(f, "Diff({})", term),
            Term::Convolution { term, delta } => {
                write!(f, "Convolution({}, delta={})", term, delta)
            }
        }
    }
}
