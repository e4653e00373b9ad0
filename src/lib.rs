//! This library implements [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process) regression
//! for one dimensional data with *celerite* kernels, covariance functions built from
//! sums of exponentially decaying sinusoids.
//!
//! For such kernels the covariance matrix is semiseparable: away from the diagonal it
//! coincides with a low rank outer product. A dense Cholesky approach is in O(N^3) in
//! processing time and O(N^2) in memory where N is the number of data points; the
//! semiseparable structure reduces these respectively to O(N.r^2) and O(N.r) where r
//! is the kernel rank, which keeps hundreds of thousands of points tractable.
//!
//! GP methods are implemented by [GaussianProcess] parameterized by a [terms::Term]
//! kernel. The factorization and solver primitives ([factorize], [solve], [matmul])
//! are exported at the crate root and their reverse mode derivatives live in [grad].
//!
//! References: Foreman-Mackey, Agol, Ambikasaran and Angus (2017), *Fast and scalable
//! Gaussian process modeling with applications to astronomical time series*, AJ 154, 220;
//! Foreman-Mackey (2018), *Scalable backpropagation for Gaussian processes using
//! celerite*, RNAAS 2, 31.
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
mod errors;
mod gaussian_process;
pub mod grad;
pub mod terms;

mod utils;

pub use algorithm::*;
pub use errors::*;
pub use gaussian_process::*;
