//! # Provenance log
//!
//! Per-member text record of every input and output file digest plus a
//! closing summary of the perturbation applied. Lines accumulate in
//! memory and are written once by [`ProvenanceLog::flush`].
//!
//! ```text
//! [Input] sha256 /state/ICMSHexpINIT: 9f2c...
//! [Input] sha256 /state/ICMGGexpINIT: 11aa...
//!
//! [Output] sha256 /out/exp_1/ICMSHexp_1INIT: 04be...
//! [Output] sha256 /out/exp_1/ICMGGexp_1INIT: 11aa...
//!
//! Perturbed ensemble exp_1, variable t, mode 42, level 30, by amount -0.1. Random seed 7 was used to create the perturbed initial state.
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{EnsembleError, Result};

#[derive(Debug)]
pub struct ProvenanceLog {
    path: PathBuf,
    inputs: Vec<String>,
    outputs: Vec<String>,
    notes: Vec<String>,
    summary: String,
}

impl ProvenanceLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ProvenanceLog {
            path: path.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            notes: Vec::new(),
            summary: String::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_input(&mut self, path: &Path, digest: &str) {
        self.inputs.push(format!("[Input] sha256 {}: {}", path.display(), digest));
    }

    pub fn record_output(&mut self, path: &Path, digest: &str) {
        self.outputs.push(format!("[Output] sha256 {}: {}", path.display(), digest));
    }

    /// Put an output line ahead of those already recorded.
    pub fn record_primary_output(&mut self, path: &Path, digest: &str) {
        self.outputs
            .insert(0, format!("[Output] sha256 {}: {}", path.display(), digest));
    }

    pub fn record_skipped(&mut self, path: &Path, reason: &str) {
        self.notes.push(format!("[Skipped] {}: {}", path.display(), reason));
    }

    pub fn record_summary(&mut self, member: &str, variable: &str, mode: usize, level: i32, magnitude: f64, seed: u64) {
        self.summary = format!(
            "Perturbed ensemble {member}, variable {variable}, mode {mode}, level {level}, by amount {magnitude}. \
             Random seed {seed} was used to create the perturbed initial state."
        );
    }

    pub fn record_failure(&mut self, input: &Path, output: &Path) {
        self.summary = format!(
            "Perturbation failed: input file {} and output file {} are the same.",
            input.display(),
            output.display()
        );
    }

    pub fn record_aborted(&mut self, reason: &str) {
        self.summary = format!("Member aborted: {reason}");
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Render the log text: inputs, a blank line, outputs, notes, summary.
    pub fn render(&self) -> String {
        let mut text = String::new();
        for line in &self.inputs {
            text.push_str(line);
            text.push('\n');
        }
        text.push('\n');
        for line in self.outputs.iter().chain(self.notes.iter()) {
            text.push_str(line);
            text.push('\n');
        }
        if !self.summary.is_empty() {
            text.push('\n');
            text.push_str(&self.summary);
            text.push('\n');
        }
        text
    }

    /// Write the log to its path. Consumes the log so it is written once.
    pub fn flush(self) -> Result<PathBuf> {
        let io_err = |e| EnsembleError::io(&self.path, e);
        let mut w = BufWriter::new(File::create(&self.path).map_err(io_err)?);
        w.write_all(self.render().as_bytes()).map_err(io_err)?;
        w.flush().map_err(io_err)?;
        Ok(self.path)
    }
}
