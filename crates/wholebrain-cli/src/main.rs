//! # WholeBrain CLI
//!
//! Command-line interface for coupling sweeps, FIC balancing and single runs.

mod connectome;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Axis;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use wholebrain_core::{Connectome, GlobalCoupling, Reduction, TimeSeries};
use wholebrain_dmf::{DmfParams, DynamicMeanField, InstantaneousCoupling, Naskar, NaskarParams};
use wholebrain_fic::{
    BalancingMechanism, Deco2014, FicMechanism, FicSolver, Herzog2022, JStore, JsonDirStore,
    NoStore, ProportionalFic,
};
use wholebrain_integrator::{IntegrationSettings, Scheme, SimulationContext};
use wholebrain_sweep::{run_sweep_with, write_csv, GRange, SweepConfig, SweepPoint, SweepResult};

#[derive(Parser)]
#[command(name = "wholebrain")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Whole-brain mean field simulation toolkit", long_about = None)]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sweep the global coupling G and report the peak firing rate
    Sweep {
        /// Connectome file (.json, .csv or whitespace separated text)
        #[arg(short, long)]
        connectome: PathBuf,
        /// Sweep configuration (one object or an array of curves)
        #[arg(long, conflicts_with = "figure")]
        config: Option<PathBuf>,
        /// Preset curves of a published figure
        #[arg(long, value_enum)]
        figure: Option<Figure>,
        #[arg(long)]
        g_start: Option<f64>,
        #[arg(long)]
        g_end: Option<f64>,
        #[arg(long)]
        g_step: Option<f64>,
        /// Integration step (ms)
        #[arg(long)]
        dt: Option<f64>,
        /// Recorded time (ms)
        #[arg(long)]
        t_max: Option<f64>,
        #[arg(long)]
        seed: Option<u64>,
        /// Rescale the connectome to this maximum entry
        #[arg(long)]
        normalize: Option<f64>,
        /// Directory of cached balanced J
        #[arg(long)]
        cache: Option<PathBuf>,
        /// CSV output (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Full JSON report
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Balance J for a list of G values
    Balance {
        #[arg(short, long)]
        connectome: PathBuf,
        /// G values
        #[arg(short, long, num_args = 1.., required = true)]
        g: Vec<f64>,
        #[arg(short, long, value_enum, default_value_t = MechanismArg::Proportional)]
        mechanism: MechanismArg,
        #[arg(long)]
        normalize: Option<f64>,
        #[arg(long)]
        cache: Option<PathBuf>,
    },

    /// Run one simulation and write the population mean rate per sample
    Simulate {
        #[arg(short, long)]
        connectome: PathBuf,
        #[arg(short, long)]
        g: f64,
        #[arg(long, value_enum, default_value_t = ModelArg::Dmf)]
        model: ModelArg,
        /// Balance J first (DMF only)
        #[arg(long, value_enum)]
        fic: Option<MechanismArg>,
        #[arg(long, default_value_t = 0.1)]
        dt: f64,
        #[arg(long, default_value_t = 10_000.0)]
        t_max: f64,
        #[arg(long, default_value_t = 0.0)]
        warm_up: f64,
        /// Noise amplitude; 0 runs deterministic Euler
        #[arg(long, default_value_t = 0.01)]
        sigma: f64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long)]
        normalize: Option<f64>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Summarize a connectome file
    Info {
        connectome: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Figure {
    Herzog,
    Naskar,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelArg {
    Dmf,
    Naskar,
}

#[derive(Clone, Copy, ValueEnum)]
enum MechanismArg {
    Herzog2022,
    Proportional,
    Deco2014,
}

impl MechanismArg {
    fn mechanism(self) -> FicMechanism {
        match self {
            MechanismArg::Herzog2022 => FicMechanism::Herzog2022(Herzog2022::default()),
            MechanismArg::Proportional => FicMechanism::Proportional(ProportionalFic::default()),
            MechanismArg::Deco2014 => FicMechanism::Deco2014(Deco2014::default()),
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // stdout is reserved for CSV output
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Sweep {
            connectome,
            config,
            figure,
            g_start,
            g_end,
            g_step,
            dt,
            t_max,
            seed,
            normalize,
            cache,
            output,
            report,
        } => {
            let c = connectome::load(&connectome)?;
            let mut configs = match (config, figure) {
                (Some(path), _) => load_sweep_configs(&path)?,
                (None, Some(Figure::Herzog)) => SweepConfig::figure_herzog(),
                (None, Some(Figure::Naskar)) => SweepConfig::figure_naskar(),
                (None, None) => vec![SweepConfig::default()],
            };
            for cfg in &mut configs {
                let range = cfg.g_range;
                cfg.g_range = GRange::new(
                    g_start.unwrap_or(range.start),
                    g_end.unwrap_or(range.end),
                    g_step.unwrap_or(range.step),
                );
                if let Some(dt) = dt {
                    cfg.integration.dt = dt;
                }
                if let Some(t_max) = t_max {
                    cfg.integration.t_max = t_max;
                }
                if let Some(seed) = seed {
                    cfg.seed = seed;
                }
                if normalize.is_some() {
                    cfg.normalize = normalize;
                }
            }

            eprintln!(
                "{} {} ({} regions)",
                "Sweeping:".green().bold(),
                connectome.display(),
                c.n_regions()
            );
            let mut results = Vec::with_capacity(configs.len());
            for cfg in &configs {
                let result = match &cache {
                    Some(dir) => sweep_with_progress(cfg, &c, JsonDirStore::new(dir)?)?,
                    None => sweep_with_progress(cfg, &c, NoStore)?,
                };
                print_sweep_summary(&result);
                results.push(result);
            }

            match output {
                Some(path) => {
                    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
                    write_csv(&results, BufWriter::new(file))?;
                    eprintln!("{} {}", "Wrote".green(), path.display());
                }
                None => write_csv(&results, io::stdout().lock())?,
            }
            if let Some(path) = report {
                let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
                serde_json::to_writer_pretty(BufWriter::new(file), &results)?;
                eprintln!("{} {}", "Wrote".green(), path.display());
            }
        }

        Commands::Balance {
            connectome,
            g,
            mechanism,
            normalize,
            cache,
        } => {
            let c = scaled(connectome::load(&connectome)?, normalize)?;
            let mechanism = mechanism.mechanism();
            println!(
                "{} {} with {}",
                "Balancing:".green().bold(),
                connectome.display(),
                mechanism.name().cyan()
            );
            match cache {
                Some(dir) => balance_table(&c, FicSolver::new(mechanism, JsonDirStore::new(dir)?), &g)?,
                None => balance_table(&c, FicSolver::uncached(mechanism), &g)?,
            }
        }

        Commands::Simulate {
            connectome,
            g,
            model,
            fic,
            dt,
            t_max,
            warm_up,
            sigma,
            seed,
            normalize,
            output,
        } => {
            let c = scaled(connectome::load(&connectome)?, normalize)?;
            let settings = IntegrationSettings {
                dt,
                t_max,
                t_warm_up: warm_up,
            };
            let scheme = if sigma == 0.0 {
                Scheme::Euler
            } else {
                Scheme::EulerMaruyama { sigma }
            };
            let mut rng = StdRng::seed_from_u64(seed);
            eprintln!(
                "{} G = {} on {} ({} regions)",
                "Simulating:".green().bold(),
                g,
                connectome.display(),
                c.n_regions()
            );

            let ts = match (model, fic) {
                (ModelArg::Dmf, fic) => {
                    let n = c.n_regions();
                    let coupling = InstantaneousCoupling::new(&c);
                    let template = DynamicMeanField::new(n, DmfParams::for_regions(n))?;
                    let dmf = match fic {
                        Some(m) => {
                            let (balanced, outcome) =
                                FicSolver::uncached(m.mechanism()).balanced_model(&template, &coupling, g)?;
                            if !outcome.converged {
                                eprintln!("{}", "FIC did not converge, using best J".yellow());
                            }
                            balanced
                        }
                        None => template.with_global_coupling(g)?,
                    };
                    let ctx = SimulationContext::new(&dmf, &coupling, scheme)?;
                    settings.run(&ctx, &mut rng)?
                }
                (ModelArg::Naskar, Some(_)) => bail!("--fic applies to the dmf model only"),
                (ModelArg::Naskar, None) => {
                    let naskar = Naskar::new(&c, NaskarParams::default().with_g(g))?;
                    let ctx = SimulationContext::new(&naskar, naskar.coupling_operator(), scheme)?;
                    settings.run(&ctx, &mut rng)?
                }
            };

            print_run_summary(&ts);
            match output {
                Some(path) => {
                    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
                    write_mean_rate(&ts, BufWriter::new(file))?;
                    eprintln!("{} {}", "Wrote".green(), path.display());
                }
                None => write_mean_rate(&ts, io::stdout().lock())?,
            }
        }

        Commands::Info { connectome } => {
            let c = connectome::load(&connectome)?;
            let strength = c.row_strength();
            let max_weight = c.weights().iter().cloned().fold(0.0_f64, f64::max);
            println!("{} {}", "Connectome:".green().bold(), connectome.display());
            println!("  {:<14} {}", "regions", c.n_regions());
            println!("  {:<14} {}", "id", c.id().to_string().cyan());
            println!("  {:<14} {}", "symmetric", c.is_symmetric());
            println!("  {:<14} {}", "zero diagonal", c.has_zero_diagonal());
            println!("  {:<14} {:.4}", "max weight", max_weight);
            println!(
                "  {:<14} min {:.4}  mean {:.4}  max {:.4}",
                "strength",
                strength.iter().cloned().fold(f64::INFINITY, f64::min),
                strength.mean().unwrap_or(0.0),
                strength.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
            );
        }
    }

    Ok(())
}

fn scaled(c: Connectome, normalize: Option<f64>) -> anyhow::Result<Connectome> {
    Ok(match normalize {
        Some(max) => c.normalized(max)?,
        None => c,
    })
}

fn load_sweep_configs(path: &Path) -> anyhow::Result<Vec<SweepConfig>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let configs = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(configs)
}

fn sweep_with_progress<S: JStore>(
    config: &SweepConfig,
    c: &Connectome,
    store: S,
) -> anyhow::Result<SweepResult> {
    let points = config.g_range.values()?.len();
    let pb = ProgressBar::new(points as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg:>6} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("#>-"),
    );
    pb.set_message(config.label.clone());
    let on_point = |_: &SweepPoint| pb.inc(1);
    let result = run_sweep_with(config, c, store, &on_point);
    pb.finish_and_clear();
    Ok(result?)
}

fn print_sweep_summary(result: &SweepResult) {
    let peak = result
        .points
        .iter()
        .filter_map(|p| p.value.map(|v| (p.g, v)))
        .fold(None, |best: Option<(f64, f64)>, (g, v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((g, v)),
        });
    eprint!("  {:<6} {} points", result.label.cyan().bold(), result.points.len());
    if let Some((g, v)) = peak {
        eprint!(", peak {:.3} Hz at G = {:.2}", v, g);
    }
    let diverged = result.n_diverged();
    if diverged > 0 {
        eprint!(", {}", format!("{} diverged", diverged).red());
    }
    let unbalanced = result
        .points
        .iter()
        .filter(|p| p.fic_converged == Some(false))
        .count();
    if unbalanced > 0 {
        eprint!(", {}", format!("{} FIC not converged", unbalanced).yellow());
    }
    eprintln!();
}

fn balance_table<S: JStore>(c: &Connectome, solver: FicSolver<S>, gs: &[f64]) -> anyhow::Result<()> {
    let n = c.n_regions();
    let coupling = InstantaneousCoupling::new(c);
    let template = DynamicMeanField::new(n, DmfParams::for_regions(n))?;

    println!(
        "  {:>8} {:>10} {:>10} {:>12} {:>10}",
        "G", "converged", "iterations", "max error", "mean J"
    );
    for (g, outcome) in gs.iter().zip(solver.balance_all(&template, &coupling, gs)) {
        match outcome {
            Ok(out) => {
                let converged = if out.converged {
                    "yes".green()
                } else {
                    "no".yellow()
                };
                println!(
                    "  {:>8.2} {:>10} {:>10} {:>12.4} {:>10.4}",
                    g,
                    converged,
                    out.iterations,
                    out.max_rate_error,
                    out.j.mean().unwrap_or(f64::NAN)
                );
            }
            Err(e) => println!("  {:>8.2} {}", g, e.to_string().red()),
        }
    }
    Ok(())
}

fn print_run_summary(ts: &TimeSeries) {
    let Some(rates) = ts.variable_by_name("r_e") else {
        return;
    };
    if !ts.is_finite() {
        eprintln!("{}", "Run diverged (non-finite values in the output)".red());
        return;
    }
    for reduction in [Reduction::MaxOfMean, Reduction::MeanOfMax, Reduction::PeakPopulationMean] {
        eprintln!("  {:<22} {:.4} Hz", reduction.label(), reduction.apply(rates));
    }
}

/// CSV `t_ms,mean_rate` with the across-region mean excitatory rate
fn write_mean_rate<W: Write>(ts: &TimeSeries, mut out: W) -> anyhow::Result<()> {
    let rates = ts
        .variable_by_name("r_e")
        .context("model records no r_e observable")?;
    writeln!(out, "t_ms,mean_rate")?;
    for (k, row) in rates.axis_iter(Axis(0)).enumerate() {
        let mean = row.mean().unwrap_or(f64::NAN);
        writeln!(out, "{:.3},{}", k as f64 * ts.dt(), mean)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_balance() {
        let cli = Cli::try_parse_from([
            "wholebrain", "-vv", "balance", "-c", "sc.csv", "-g", "0.5", "1.0", "-m", "deco2014",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Balance { g, mechanism, .. } => {
                assert_eq!(g, vec![0.5, 1.0]);
                assert_eq!(mechanism.mechanism().name(), "deco2014");
            }
            _ => panic!("expected balance"),
        }
    }

    #[test]
    fn test_sweep_configs_file() {
        let dir = tempfile::tempdir().unwrap();
        let single = dir.path().join("one.json");
        let many = dir.path().join("many.json");
        fs::write(&single, r#"{"label": "E-E"}"#).unwrap();
        fs::write(&many, r#"[{"label": "E-E"}, {"label": "FIC", "fic": {"kind": "herzog2022"}}]"#).unwrap();
        assert_eq!(load_sweep_configs(&single).unwrap().len(), 1);
        let configs = load_sweep_configs(&many).unwrap();
        assert_eq!(configs[1].label, "FIC");
        assert!(configs[1].fic.is_some());
    }

    #[test]
    fn test_mean_rate_csv() {
        let data = ndarray::Array3::from_shape_fn((2, 2, 2), |(t, v, r)| (t + v + r) as f64);
        let ts = TimeSeries::new(data, vec!["I_e".into(), "r_e".into()], 0.5).unwrap();
        let mut out = Vec::new();
        write_mean_rate(&ts, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "t_ms,mean_rate\n0.000,1.5\n0.500,2.5\n");
    }
}
