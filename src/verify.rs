//! End-to-end check that a perturbation reached the persisted output.

use std::path::Path;

use tracing::debug;

use crate::container::{ContainerError, FieldIndex};
use crate::error::{EnsembleError, Result};

/// Values read back from both containers at the target position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verification {
    pub original: f64,
    pub perturbed: f64,
}

impl Verification {
    pub fn passed(&self) -> bool {
        self.original != self.perturbed
    }
}

/// Re-open both containers and compare the value at `mode` of the first
/// record matching `(variable, level)` in each.
pub fn compare(input: &Path, output: &Path, variable: &str, level: i32, mode: usize) -> Result<Verification> {
    let original = FieldIndex::open(input)?.first(variable, level)?.value(mode)?;
    let perturbed = FieldIndex::open(output)?.first(variable, level)?.value(mode)?;
    debug!(original, perturbed, mode, "read back target values");
    Ok(Verification { original, perturbed })
}

/// `true` iff the stored values differ.
///
/// A target missing from either container counts as unchanged.
pub fn verify(input: &Path, output: &Path, variable: &str, level: i32, mode: usize) -> Result<bool> {
    match compare(input, output, variable, level, mode) {
        Ok(v) => Ok(v.passed()),
        Err(EnsembleError::Container(ContainerError::NotFound { .. })) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Container, FieldRecord};
    use crate::perturb::{perturb, PerturbationSpec};
    use tempfile::tempdir;

    fn write(path: &Path, t30: Vec<f64>) {
        let records = vec![
            FieldRecord::new("t", 29, vec![0.0; t30.len()]).unwrap(),
            FieldRecord::new("t", 30, t30).unwrap(),
        ];
        Container::write(path, &records).unwrap();
    }

    #[test]
    fn perturbed_output_verifies() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        write(&input, (0..10).map(|i| i as f64).collect());
        let spec = PerturbationSpec {
            variable: "t".into(),
            level: 30,
            mode: 4,
            magnitude: 0.1,
        };
        perturb(&input, &output, &spec).unwrap();
        assert!(verify(&input, &output, "t", 30, 4).unwrap());
        let v = compare(&input, &output, "t", 30, 4).unwrap();
        assert_eq!(v.perturbed, 4.0 + 0.1);
        assert!(!verify(&input, &output, "t", 30, 2).unwrap());
    }

    #[test]
    fn identical_values_fail_verification() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        write(&input, vec![1.0, 2.0, 3.0, 4.0]);
        let mut changed = vec![1.0, 2.0, 3.0, 4.0];
        changed[1] = 9.0;
        write(&output, changed);
        assert!(!verify(&input, &output, "t", 30, 2).unwrap());
        assert!(verify(&input, &output, "t", 30, 1).unwrap());
    }

    #[test]
    fn missing_target_fails_verification() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        write(&input, vec![1.0, 2.0]);
        assert!(!verify(&input, &input, "q", 30, 0).unwrap());
    }

    #[test]
    fn unreadable_output_is_an_error() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        write(&input, vec![1.0, 2.0]);
        assert!(verify(&input, &dir.path().join("missing"), "t", 30, 0).is_err());
    }
}
