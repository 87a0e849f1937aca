//! # Ensemble orchestration
//!
//! Drives a whole run: validate the configuration, draw modes and signs
//! from one seeded generator, then build each member in turn.
//!
//! Each member walks a fixed sequence of states:
//!
//! ```text
//! Init -> DirPrepared -> AuxCopied -> Perturbed -> Verified{Pass|Fail} -> LogClosed
//! ```
//!
//! A failed verification still closes the member's log, then halts the
//! run. Directories already written for earlier members are left as is.
//!
//! ## Output layout
//!
//! ```text
//! <output_dir>/<exp>_<i>/ICMSH<exp>_<i>INIT   perturbed spectral container
//! <output_dir>/<exp>_<i>/ICMGG<exp>_<i>INIT   copied gridpoint file
//! <output_dir>/<exp>_<i>/ICMGG<exp>_<i>INIUA  copied upper-air file
//! <output_dir>/<exp>_<i>/<exp>_<i>.log        provenance log
//! ```

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::checksum;
use crate::container::Container;
use crate::error::{EnsembleError, Result};
use crate::modes::EnsembleRng;
use crate::perturb::{perturb, PerturbationSpec};
use crate::provenance::ProvenanceLog;
use crate::verify::verify;

/// Name of the spectral container that gets perturbed.
pub fn spectral_file(experiment: &str) -> String {
    format!("ICMSH{experiment}INIT")
}

/// Names of the gridpoint files copied unchanged.
pub fn auxiliary_files(experiment: &str) -> [String; 2] {
    [format!("ICMGG{experiment}INIT"), format!("ICMGG{experiment}INIUA")]
}

fn default_members() -> usize {
    1
}

fn default_variable() -> String {
    "t".into()
}

fn default_level() -> i32 {
    30
}

fn default_perturbation() -> f64 {
    0.1
}

/// Configuration for one ensemble run.
///
/// Same config + same seed = same modes, signs and output bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Directory holding the initial state to perturb
    pub initial_state: PathBuf,
    /// Experiment name of the initial state
    pub experiment: String,
    /// Base directory receiving one subdirectory per member
    pub output_dir: PathBuf,
    /// Number of members to create
    #[serde(default = "default_members")]
    pub members: usize,
    /// Generator seed; drawn from OS entropy when absent
    #[serde(default)]
    pub seed: Option<u64>,
    /// Replace existing member directories
    #[serde(default)]
    pub force: bool,
    /// Short name of the variable to perturb
    #[serde(default = "default_variable")]
    pub variable: String,
    /// Model level to perturb
    #[serde(default = "default_level")]
    pub level: i32,
    /// Base perturbation magnitude; the sign is drawn per member
    #[serde(default = "default_perturbation")]
    pub perturbation: f64,
    /// Optional path for a JSON run report
    #[serde(default)]
    pub report: Option<PathBuf>,
}

impl EnsembleConfig {
    pub fn new(initial_state: impl Into<PathBuf>, experiment: &str, output_dir: impl Into<PathBuf>) -> Self {
        EnsembleConfig {
            initial_state: initial_state.into(),
            experiment: experiment.to_string(),
            output_dir: output_dir.into(),
            members: default_members(),
            seed: None,
            force: false,
            variable: default_variable(),
            level: default_level(),
            perturbation: default_perturbation(),
            report: None,
        }
    }

    /// Reject configurations that cannot produce a valid run.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(EnsembleError::InvalidArgument(msg)) };
        if self.members == 0 {
            return invalid("members must be at least 1".into());
        }
        if self.experiment.is_empty() {
            return invalid("experiment name is empty".into());
        }
        if self.variable.is_empty() {
            return invalid("variable name is empty".into());
        }
        if !self.perturbation.is_finite() || self.perturbation == 0.0 {
            return invalid(format!("perturbation must be finite and non-zero, got {}", self.perturbation));
        }
        for dir in [&self.initial_state, &self.output_dir] {
            if !dir.is_dir() {
                return invalid(format!("{} is not a directory", dir.display()));
            }
        }
        Ok(())
    }

    pub fn input_container(&self) -> PathBuf {
        self.initial_state.join(spectral_file(&self.experiment))
    }

    pub fn member_name(&self, index: usize) -> String {
        format!("{}_{}", self.experiment, index)
    }

    pub fn member_dir(&self, index: usize) -> PathBuf {
        self.output_dir.join(self.member_name(index))
    }
}

/// Per-member progress through the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Init,
    DirPrepared,
    AuxCopied,
    Perturbed,
    Verified(Verdict),
    LogClosed,
}

/// Result of reading the perturbed value back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDigest {
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberReport {
    pub index: usize,
    pub name: String,
    pub directory: PathBuf,
    pub perturbation: PerturbationSpec,
    pub outputs: Vec<FileDigest>,
    pub skipped: Vec<PathBuf>,
    pub log: PathBuf,
    pub verdict: Verdict,
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub seed: u64,
    pub input: FileDigest,
    pub mode_count: usize,
    pub variable: String,
    pub level: i32,
    pub members: Vec<MemberReport>,
}

/// Run-wide inputs shared by every member.
struct RunContext<'a> {
    config: &'a EnsembleConfig,
    input: &'a Path,
    input_digest: &'a str,
    seed: u64,
}

struct Member {
    index: usize,
    name: String,
    dir: PathBuf,
    state: MemberState,
}

impl Member {
    fn advance(&mut self, next: MemberState) {
        debug!(member = %self.name, from = ?self.state, to = ?next, "member state");
        self.state = next;
    }
}

/// Build every member described by `config`.
///
/// Fails with [`EnsembleError::VerificationFailure`] on the first member
/// whose output does not differ from the input; later members are not
/// attempted.
pub fn run(config: &EnsembleConfig) -> Result<RunReport> {
    config.validate()?;
    let input = config.input_container();
    let container = Container::open(&input)?;
    let mode_count = container
        .mode_count()
        .ok_or_else(|| EnsembleError::InvalidArgument(format!("{} holds no records", input.display())))?;
    drop(container);

    let mut rng = EnsembleRng::from_optional_seed(config.seed);
    let seed = rng.seed();
    let modes = rng.select_modes(mode_count, config.members)?;
    let signs = rng.draw_signs(config.members);
    info!(seed, mode_count, members = config.members, "drew ensemble modes");
    debug!(?modes, ?signs, "mode and sign assignment");

    if !config.force {
        for index in 1..=config.members {
            let dir = config.member_dir(index);
            if dir.exists() {
                return Err(EnsembleError::AlreadyExists(dir));
            }
        }
    }

    let input_digest = checksum::digest(&input).map_err(|e| EnsembleError::io(&input, e))?;
    debug!(path = %input.display(), sha256 = %input_digest, "input digest");

    let ctx = RunContext {
        config,
        input: &input,
        input_digest: &input_digest,
        seed,
    };
    let mut members = Vec::with_capacity(config.members);
    for (offset, (&mode, &sign)) in modes.iter().zip(signs.iter()).enumerate() {
        let spec = PerturbationSpec {
            variable: config.variable.clone(),
            level: config.level,
            mode,
            magnitude: sign * config.perturbation,
        };
        let report = run_member(&ctx, offset + 1, spec)?;
        if report.verdict == Verdict::Fail {
            let output = report.directory.join(spectral_file(&report.name));
            error!(member = %report.name, "perturbation did not change the target value");
            return Err(EnsembleError::VerificationFailure {
                input: input.clone(),
                output,
            });
        }
        members.push(report);
    }

    let report = RunReport {
        seed,
        input: FileDigest {
            path: input.clone(),
            sha256: input_digest.clone(),
        },
        mode_count,
        variable: config.variable.clone(),
        level: config.level,
        members,
    };
    if let Some(path) = &config.report {
        write_report(path, &report)?;
        info!(path = %path.display(), "run report written");
    }
    Ok(report)
}

fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    let io_err = |e: io::Error| EnsembleError::io(path, e);
    let mut w = BufWriter::new(File::create(path).map_err(io_err)?);
    serde_json::to_writer_pretty(&mut w, report).map_err(|e| io_err(e.into()))?;
    writeln!(w).map_err(io_err)?;
    w.flush().map_err(io_err)?;
    Ok(())
}

/// Build one member. The provenance log is written on every exit path
/// once the member directory exists.
fn run_member(ctx: &RunContext<'_>, index: usize, spec: PerturbationSpec) -> Result<MemberReport> {
    let name = ctx.config.member_name(index);
    let mut member = Member {
        index,
        dir: ctx.config.member_dir(index),
        name,
        state: MemberState::Init,
    };
    info!(member = %member.name, mode = spec.mode, magnitude = spec.magnitude, "building member");

    prepare_dir(&member.dir, ctx.config.force)?;
    member.advance(MemberState::DirPrepared);

    let mut log = ProvenanceLog::new(member.dir.join(format!("{}.log", member.name)));
    log.record_input(ctx.input, ctx.input_digest);

    let built = build_member(ctx, &mut member, &spec, &mut log);
    let outcome = match built {
        Ok(outcome) => outcome,
        Err(e) => {
            log.record_aborted(&e.to_string());
            if let Err(flush_err) = log.flush() {
                warn!(member = %member.name, error = %flush_err, "could not write provenance log");
            }
            return Err(e);
        }
    };
    let log_path = log.flush()?;
    member.advance(MemberState::LogClosed);

    Ok(MemberReport {
        index: member.index,
        name: member.name,
        directory: member.dir,
        perturbation: spec,
        outputs: outcome.outputs,
        skipped: outcome.skipped,
        log: log_path,
        verdict: outcome.verdict,
    })
}

struct BuiltMember {
    outputs: Vec<FileDigest>,
    skipped: Vec<PathBuf>,
    verdict: Verdict,
}

fn build_member(
    ctx: &RunContext<'_>,
    member: &mut Member,
    spec: &PerturbationSpec,
    log: &mut ProvenanceLog,
) -> Result<BuiltMember> {
    let mut outputs = Vec::new();
    let mut skipped = Vec::new();

    let sources = auxiliary_files(&ctx.config.experiment);
    let targets = auxiliary_files(&member.name);
    for (source, target) in sources.iter().zip(targets.iter()) {
        let from = ctx.config.initial_state.join(source);
        let to = member.dir.join(target);
        match copy_auxiliary(&from, &to) {
            Ok((digest_in, digest_out)) => {
                log.record_input(&from, &digest_in);
                log.record_output(&to, &digest_out);
                outputs.push(FileDigest {
                    path: to,
                    sha256: digest_out,
                });
            }
            Err(e) => {
                warn!(path = %from.display(), error = %e, "auxiliary file skipped");
                log.record_skipped(&from, &e.to_string());
                skipped.push(from);
            }
        }
    }
    member.advance(MemberState::AuxCopied);

    let output = member.dir.join(spectral_file(&member.name));
    perturb(ctx.input, &output, spec)?;
    let output_digest = checksum::digest(&output).map_err(|e| EnsembleError::io(&output, e))?;
    log.record_primary_output(&output, &output_digest);
    outputs.insert(
        0,
        FileDigest {
            path: output.clone(),
            sha256: output_digest,
        },
    );
    member.advance(MemberState::Perturbed);

    let verdict = if verify(ctx.input, &output, &spec.variable, spec.level, spec.mode)? {
        Verdict::Pass
    } else {
        Verdict::Fail
    };
    member.advance(MemberState::Verified(verdict));

    match verdict {
        Verdict::Pass => {
            log.record_summary(&member.name, &spec.variable, spec.mode, spec.level, spec.magnitude, ctx.seed);
            println!("{}", log.summary());
        }
        Verdict::Fail => log.record_failure(ctx.input, &output),
    }

    Ok(BuiltMember {
        outputs,
        skipped,
        verdict,
    })
}

/// Create a fresh member directory, removing an old one first when forced.
fn prepare_dir(dir: &Path, force: bool) -> Result<()> {
    if force {
        let _ = fs::remove_dir_all(dir);
    }
    fs::create_dir(dir).map_err(|e| match e.kind() {
        io::ErrorKind::AlreadyExists => EnsembleError::AlreadyExists(dir.to_path_buf()),
        _ => EnsembleError::io(dir, e),
    })
}

fn copy_auxiliary(from: &Path, to: &Path) -> io::Result<(String, String)> {
    fs::copy(from, to)?;
    Ok((checksum::digest(from)?, checksum::digest(to)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::FieldRecord;
    use tempfile::{tempdir, TempDir};

    const EXP: &str = "a0b1";

    /// Initial state with a 100-mode spectral container and both
    /// gridpoint files.
    fn initial_state() -> (TempDir, EnsembleConfig) {
        let root = tempdir().unwrap();
        let state = root.path().join("state");
        let out = root.path().join("out");
        fs::create_dir_all(&state).unwrap();
        fs::create_dir_all(&out).unwrap();
        let values = |base: f64| (0..100).map(|i| base + i as f64 * 0.01).collect::<Vec<_>>();
        let records = vec![
            FieldRecord::new("lnsp", 1, values(11.0)).unwrap(),
            FieldRecord::new("t", 29, values(240.0)).unwrap(),
            FieldRecord::new("t", 30, values(250.0)).unwrap(),
            FieldRecord::new("vo", 30, values(0.0)).unwrap(),
        ];
        Container::write(&state.join(spectral_file(EXP)), &records).unwrap();
        let [gg, ua] = auxiliary_files(EXP);
        fs::write(state.join(gg), b"gridpoint surface fields").unwrap();
        fs::write(state.join(ua), b"gridpoint upper air fields").unwrap();

        let mut config = EnsembleConfig::new(&state, EXP, &out);
        config.seed = Some(42);
        (root, config)
    }

    #[test]
    fn builds_members_with_distinct_modes() {
        let (_root, mut config) = initial_state();
        config.members = 3;
        let report = run(&config).unwrap();
        assert_eq!(report.seed, 42);
        assert_eq!(report.mode_count, 100);
        assert_eq!(report.members.len(), 3);

        let mut modes: Vec<usize> = report.members.iter().map(|m| m.perturbation.mode).collect();
        modes.sort_unstable();
        modes.dedup();
        assert_eq!(modes.len(), 3);

        for (i, m) in report.members.iter().enumerate() {
            let name = format!("{EXP}_{}", i + 1);
            assert_eq!(m.name, name);
            assert_eq!(m.verdict, Verdict::Pass);
            assert!(m.perturbation.mode % 2 == 0);
            assert_eq!(m.perturbation.magnitude.abs(), 0.1);
            let dir = config.output_dir.join(&name);
            assert!(dir.join(format!("ICMSH{name}INIT")).is_file());
            assert!(dir.join(format!("ICMGG{name}INIT")).is_file());
            assert!(dir.join(format!("ICMGG{name}INIUA")).is_file());
            assert!(dir.join(format!("{name}.log")).is_file());
            assert_eq!(m.outputs.len(), 3);
            assert!(m.skipped.is_empty());
        }
    }

    #[test]
    fn same_seed_reproduces_assignment_and_bytes() {
        let (_a, mut first) = initial_state();
        let (_b, mut second) = initial_state();
        first.members = 4;
        second.members = 4;
        let ra = run(&first).unwrap();
        let rb = run(&second).unwrap();
        for (ma, mb) in ra.members.iter().zip(&rb.members) {
            assert_eq!(ma.perturbation, mb.perturbation);
            assert_eq!(ma.outputs[0].sha256, mb.outputs[0].sha256);
        }
    }

    #[test]
    fn target_value_moves_by_the_signed_magnitude() {
        let (_root, config) = initial_state();
        let report = run(&config).unwrap();
        let m = &report.members[0];
        let before = Container::open(&config.input_container()).unwrap();
        let after = Container::open(&m.outputs[0].path).unwrap();
        for (rb, ra) in before.records().iter().zip(after.records()) {
            if rb.matches("t", 30) {
                let mode = m.perturbation.mode;
                assert_eq!(ra.values()[mode], rb.values()[mode] + m.perturbation.magnitude);
            } else {
                assert_eq!(rb.serialize(), ra.serialize());
            }
        }
    }

    #[test]
    fn existing_member_dir_without_force_fails_before_writing() {
        let (_root, mut config) = initial_state();
        config.members = 2;
        fs::create_dir(config.member_dir(2)).unwrap();
        let err = run(&config).unwrap_err();
        assert!(matches!(err, EnsembleError::AlreadyExists(ref p) if *p == config.member_dir(2)));
        assert!(!config.member_dir(1).exists());
        assert_eq!(fs::read_dir(config.member_dir(2)).unwrap().count(), 0);
    }

    #[test]
    fn force_replaces_existing_member_dir() {
        let (_root, mut config) = initial_state();
        let dir = config.member_dir(1);
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("stale"), b"old").unwrap();
        config.force = true;
        run(&config).unwrap();
        assert!(!dir.join("stale").exists());
        assert!(dir.join(format!("{EXP}_1.log")).is_file());
    }

    #[test]
    fn too_many_members_fails_before_any_output() {
        let (_root, mut config) = initial_state();
        config.members = 60;
        let err = run(&config).unwrap_err();
        assert!(matches!(err, EnsembleError::InvalidArgument(_)));
        assert_eq!(fs::read_dir(&config.output_dir).unwrap().count(), 0);
    }

    #[test]
    fn missing_auxiliary_file_is_skipped_and_logged() {
        let (_root, config) = initial_state();
        let [_, ua] = auxiliary_files(EXP);
        fs::remove_file(config.initial_state.join(&ua)).unwrap();
        let report = run(&config).unwrap();
        let m = &report.members[0];
        assert_eq!(m.skipped, vec![config.initial_state.join(&ua)]);
        assert_eq!(m.outputs.len(), 2);
        let log = fs::read_to_string(&m.log).unwrap();
        assert!(log.contains("[Skipped]"));
        assert!(!config.member_dir(1).join(format!("ICMGG{EXP}_1INIUA")).exists());
    }

    #[test]
    fn missing_target_record_fails_verification_and_logs_it() {
        let (_root, mut config) = initial_state();
        config.members = 2;
        config.level = 99;
        let err = run(&config).unwrap_err();
        match err {
            EnsembleError::VerificationFailure { input, output } => {
                assert_eq!(input, config.input_container());
                assert_eq!(output, config.member_dir(1).join(format!("ICMSH{EXP}_1INIT")));
            }
            other => panic!("expected verification failure, got {other}"),
        }
        let log = fs::read_to_string(config.member_dir(1).join(format!("{EXP}_1.log"))).unwrap();
        assert!(log.contains("Perturbation failed"));
        assert!(!config.member_dir(2).exists());
    }

    #[test]
    fn log_records_digests_and_seed() {
        let (_root, config) = initial_state();
        let report = run(&config).unwrap();
        let m = &report.members[0];
        let log = fs::read_to_string(&m.log).unwrap();
        let input_line = format!(
            "[Input] sha256 {}: {}",
            config.input_container().display(),
            report.input.sha256
        );
        assert!(log.starts_with(&input_line));
        let output_line = format!("[Output] sha256 {}: {}", m.outputs[0].path.display(), m.outputs[0].sha256);
        assert!(log.contains(&output_line));
        assert!(log.contains("Random seed 42 was used"));
        assert_eq!(checksum::digest(&m.outputs[0].path).unwrap(), m.outputs[0].sha256);
    }

    #[test]
    fn report_is_written_as_json() {
        let (root, mut config) = initial_state();
        let path = root.path().join("report.json");
        config.report = Some(path.clone());
        config.members = 2;
        let report = run(&config).unwrap();
        let parsed: serde_json::Value = serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        assert_eq!(parsed["seed"], 42);
        assert_eq!(parsed["mode_count"], 100);
        assert_eq!(parsed["input"]["sha256"], report.input.sha256.as_str());
        let members = parsed["members"].as_array().unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[1]["name"], format!("{EXP}_2").as_str());
        assert_eq!(members[1]["verdict"], "Pass");
        assert_eq!(members[0]["perturbation"]["mode"], report.members[0].perturbation.mode);
    }

    #[test]
    fn validation_rejects_bad_config() {
        let (_root, config) = initial_state();
        let mut c = config.clone();
        c.members = 0;
        assert!(matches!(c.validate(), Err(EnsembleError::InvalidArgument(_))));
        let mut c = config.clone();
        c.perturbation = f64::NAN;
        assert!(c.validate().is_err());
        let mut c = config.clone();
        c.output_dir = c.output_dir.join("does-not-exist");
        assert!(c.validate().is_err());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_defaults_match_cli_defaults() {
        let c: EnsembleConfig =
            serde_json::from_str(r#"{"initial_state":"/s","experiment":"x","output_dir":"/o"}"#).unwrap();
        assert_eq!(c, EnsembleConfig::new("/s", "x", "/o"));
        assert_eq!(c.variable, "t");
        assert_eq!(c.level, 30);
        assert_eq!(c.perturbation, 0.1);
        assert_eq!(c.members, 1);
    }
}
