//! # Perturbation engine
//!
//! Rewrites one container into another, changing a single scalar in the
//! record matching the target variable and level. Every other record is
//! passed through with its original bytes.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::container::{Container, FieldRecord};
use crate::error::Result;

/// What a single ensemble member perturbs, and by how much.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerturbationSpec {
    /// Short name of the target variable
    pub variable: String,
    /// Target vertical level
    pub level: i32,
    /// Even mode position in the target record
    pub mode: usize,
    /// Signed amount added to the value at `mode`
    pub magnitude: f64,
}

/// Outcome of a perturbation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerturbOutcome {
    /// Records written to the output container
    pub records: usize,
    /// Value before and after, if a matching record was found
    pub change: Option<(f64, f64)>,
}

/// Apply `spec` to `records` in place.
///
/// Only the first record matching `(variable, level)` is modified.
/// Returns the old and new value, or `None` when nothing matched.
pub fn apply(records: &mut [FieldRecord], spec: &PerturbationSpec) -> Result<Option<(f64, f64)>> {
    let Some(target) = records.iter_mut().find(|r| r.matches(&spec.variable, spec.level)) else {
        return Ok(None);
    };
    let before = target.value(spec.mode)?;
    let after = before + spec.magnitude;
    let mut values = target.values().to_vec();
    values[spec.mode] = after;
    target.set_values(values)?;
    Ok(Some((before, after)))
}

/// Read `input`, perturb it per `spec` and write the result to `output`.
///
/// The input file is never modified. When no record matches the target
/// the output is a plain copy; the verifier reports that case.
pub fn perturb(input: &Path, output: &Path, spec: &PerturbationSpec) -> Result<PerturbOutcome> {
    let mut records = Container::open(input)?.into_records();
    let change = apply(&mut records, spec)?;
    match change {
        Some((before, after)) => debug!(
            variable = %spec.variable,
            level = spec.level,
            mode = spec.mode,
            before,
            after,
            "perturbed target value"
        ),
        None => warn!(
            variable = %spec.variable,
            level = spec.level,
            "no record matches target; writing unperturbed copy"
        ),
    }
    Container::write(output, &records)?;
    Ok(PerturbOutcome {
        records: records.len(),
        change,
    })
}
