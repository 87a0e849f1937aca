use anyhow::{anyhow, Context, Result};
use clap::Parser;
use ifs_ensemble::{run, EnsembleConfig};
use std::env;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ifs-perturb",
    version,
    about = "Create an ensemble of perturbed initial conditions from an existing initial state"
)]
struct Cli {
    /// Directory containing the initial state to perturb
    #[arg(short = 'i', long = "initialstate")]
    initial_state: PathBuf,
    /// Experiment name of the initial state to perturb
    #[arg(short = 'e', long)]
    experiment: String,
    /// Base output directory
    #[arg(short = 'o', long = "outputdir")]
    output_dir: PathBuf,
    /// Number of initial states to create
    #[arg(short = 'm', long, default_value_t = 1)]
    members: usize,
    /// Random seed
    #[arg(short = 's', long)]
    seed: Option<u64>,
    /// Force overwriting existing member directories
    #[arg(short = 'f', long, default_value_t = false)]
    force: bool,
    /// Variable short name
    #[arg(short = 'v', long, default_value = "t")]
    variable: String,
    /// Model level
    #[arg(short = 'l', long, default_value_t = 30)]
    level: i32,
    /// Perturbation amount
    #[arg(short = 'p', long, default_value_t = 0.1, allow_negative_numbers = true)]
    perturbation: f64,
    /// Write a JSON run report to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,ifs_ensemble=info,ifs_perturb=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Expand a leading `~` and make the path absolute.
fn full_path(path: &Path) -> Result<PathBuf> {
    let expanded = match path.strip_prefix("~") {
        Ok(rest) => {
            let home = env::var_os("HOME").ok_or_else(|| anyhow!("HOME is not set, cannot expand {}", path.display()))?;
            PathBuf::from(home).join(rest)
        }
        Err(_) => path.to_path_buf(),
    };
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(env::current_dir().context("reading current directory")?.join(expanded))
    }
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = EnsembleConfig {
        initial_state: full_path(&cli.initial_state)?,
        experiment: cli.experiment,
        output_dir: full_path(&cli.output_dir)?,
        members: cli.members,
        seed: cli.seed,
        force: cli.force,
        variable: cli.variable,
        level: cli.level,
        perturbation: cli.perturbation,
        report: cli.report.as_deref().map(full_path).transpose()?,
    };
    let report = run(&config)?;
    info!(
        members = report.members.len(),
        seed = report.seed,
        output = %config.output_dir.display(),
        "ensemble complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_flags_match_long_flags() {
        let cli = Cli::try_parse_from([
            "ifs-perturb", "-i", "/s", "-e", "a0b1", "-o", "/o", "-m", "3", "-s", "42", "-f", "-v", "vo", "-l", "12",
            "-p", "0.5",
        ])
        .unwrap();
        assert_eq!(cli.initial_state, PathBuf::from("/s"));
        assert_eq!(cli.experiment, "a0b1");
        assert_eq!(cli.members, 3);
        assert_eq!(cli.seed, Some(42));
        assert!(cli.force);
        assert_eq!(cli.variable, "vo");
        assert_eq!(cli.level, 12);
        assert_eq!(cli.perturbation, 0.5);
    }

    #[test]
    fn defaults_apply() {
        let cli = Cli::try_parse_from(["ifs-perturb", "--initialstate", "/s", "--experiment", "x", "--outputdir", "/o"])
            .unwrap();
        assert_eq!(cli.members, 1);
        assert_eq!(cli.seed, None);
        assert!(!cli.force);
        assert_eq!(cli.variable, "t");
        assert_eq!(cli.level, 30);
        assert_eq!(cli.perturbation, 0.1);
    }

    #[test]
    fn required_flags_are_enforced() {
        assert!(Cli::try_parse_from(["ifs-perturb", "-i", "/s", "-e", "x"]).is_err());
    }

    #[test]
    fn relative_paths_become_absolute() {
        let p = full_path(Path::new("state/dir")).unwrap();
        assert!(p.is_absolute());
        assert!(p.ends_with("state/dir"));
        assert_eq!(full_path(Path::new("/abs")).unwrap(), PathBuf::from("/abs"));
    }
}
