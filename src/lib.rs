//! # ifs_ensemble
//!
//! **Perturbed initial-condition ensembles for numerical weather prediction.**
//!
//! Starting from one deterministic initial state, each ensemble member gets
//! a copy of the spectral container in which exactly one spectral mode of
//! one variable and level has been nudged by a small signed amount. Every
//! member is verified against the input and documented in a provenance log
//! of SHA-256 digests.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ifs_ensemble::{run, EnsembleConfig};
//!
//! let mut config = EnsembleConfig::new("/data/ic/a0b1", "a0b1", "/data/ensemble");
//! config.members = 10;
//! config.seed = Some(42);
//!
//! let report = run(&config)?;
//! for member in &report.members {
//!     println!("{} mode={} amount={}", member.name, member.perturbation.mode, member.perturbation.magnitude);
//! }
//! # Ok::<(), ifs_ensemble::EnsembleError>(())
//! ```
//!
//! ## Modules
//!
//! - [`checksum`] — streaming SHA-256 digests
//! - [`container`] — field container codec and keyed index
//! - [`modes`] — seeded mode and sign draws
//! - [`perturb`] — single-value container rewrite
//! - [`verify`] — read-back check of the perturbed value
//! - [`provenance`] — per-member digest log
//! - [`ensemble`] — run orchestration

pub mod checksum;
pub mod container;
pub mod ensemble;
pub mod error;
pub mod modes;
pub mod perturb;
pub mod provenance;
pub mod verify;

pub use ensemble::{run, EnsembleConfig, MemberReport, RunReport, Verdict};
pub use error::EnsembleError;
pub use perturb::PerturbationSpec;
