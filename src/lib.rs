//! # tabdiff
//!
//! Denoising diffusion for mixed continuous/discrete **tabular** data.
//!
//! This crate is intentionally small:
//!
//! - it implements the **forward (noising)** and **reverse (denoising)** processes for
//!   tabular records that mix continuous columns with one-hot discrete columns,
//! - it trains a timestep-conditioned feed-forward network by hand-derived gradients
//!   (no GPU framework types leak through the public API),
//! - it does not provide a CLI, dataset parsing, or plotting (that belongs to the host).
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: every stochastic function takes an `rng`
//!   (or a config carries a `seed`). Two runs with the same seed are bit-identical.
//! - **Two parallel noise processes**: a Gaussian beta-schedule process for the
//!   continuous block ([`gaussian`]) and a categorical mix-toward-uniform process for
//!   each discrete feature ([`categorical`]). Both read the same [`schedule::NoiseSchedule`].
//! - **Cross-modality conditioning is noise**: during training, the "other modality"
//!   input fed to the network is freshly resampled random noise, *not* the batch's
//!   true paired value. This quasi-independent training of the two denoisers is
//!   deliberate and preserved exactly; see [`loss`].
//!
//! ## Module map
//!
//! - `schedule`: beta/alpha noise schedules (linear, quadratic, sigmoid) plus the
//!   log-space quantities used by the categorical process
//! - `timestep`: antithetic timestep sampling and the shared extract-and-broadcast
//!   primitive
//! - `layout`: typed feature layout for the one-hot discrete block
//! - `gaussian`: continuous forward process and variational-bound utilities
//! - `categorical`: discrete forward process over one-hot features
//! - `model`: the conditional network contract and a concrete tabular model
//! - `optim`: Adam over flat parameter vectors, gradient clipping, EMA, early stopping
//! - `loss`: per-modality noise-estimation losses and their gradients
//! - `sample`: reverse samplers (continuous-only and joint tabular)
//! - `train`: the epoch/batch training loop
//! - `metrics`: numeric comparisons between generated and real data

pub mod categorical;
pub mod gaussian;
pub mod layout;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod sample;
pub mod schedule;
pub mod timestep;
pub mod train;

/// tabdiff error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("domain error: {0}")]
    Domain(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
