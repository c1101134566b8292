//! # Sweep-RS: Global Coupling Sweeps
//!
//! Runs a whole-brain model over a range of global couplings G and reduces
//! each run to one number (by default the largest time-averaged regional
//! rate), optionally after balancing local inhibition with FIC.
//!
//! ```ignore
//! let config: SweepConfig = serde_json::from_str(&text)?;
//! let result = run_sweep(&config, &connectome)?;
//! write_csv(&[result], std::io::stdout())?;
//! ```
//!
//! Every G is independent: points run in parallel, each with its own model
//! value, RNG and state. A point whose run diverges is recorded without a
//! value and the sweep continues.

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::{info, warn};
use wholebrain_core::{
    check_finite, check_positive, ConfigurationError, Connectome, ConnectomeId,
    CouplingOperator, GlobalCoupling, InhibitoryWeights, NeuronalModel, Reduction, Result,
    WholeBrainError,
};
use wholebrain_dmf::{DmfParams, DynamicMeanField, InstantaneousCoupling, Naskar, NaskarParams};
use wholebrain_fic::{key_bits, BalanceOutcome, FicMechanism, FicSolver, Herzog2022, JStore, NoStore};
use wholebrain_integrator::{IntegrationSettings, Scheme, SimulationContext};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// `start..end` (end excluded) with spacing `step`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GRange {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl Default for GRange {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 6.001,
            step: 0.05,
        }
    }
}

impl GRange {
    pub fn new(start: f64, end: f64, step: f64) -> Self {
        Self { start, end, step }
    }

    /// Grid values, `ceil((end - start) / step)` of them
    pub fn values(&self) -> Result<Vec<f64>> {
        check_finite("g_range.start", self.start)?;
        check_finite("g_range.end", self.end)?;
        check_positive("g_range.step", self.step)?;
        if self.end <= self.start {
            return Err(ConfigurationError::invalid(
                "g_range",
                format!("empty range {}..{}", self.start, self.end),
            )
            .into());
        }
        let count = ((self.end - self.start) / self.step).ceil() as usize;
        Ok((0..count).map(|k| self.start + k as f64 * self.step).collect())
    }
}

/// Model simulated at every G
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum ModelConfig {
    /// Fixed J; an empty `j` means ones (no FIC)
    Dmf(DmfParams),
    /// J follows inhibitory plasticity
    Naskar(NaskarParams),
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig::Dmf(DmfParams::default())
    }
}

impl ModelConfig {
    pub fn name(&self) -> &'static str {
        match self {
            ModelConfig::Dmf(_) => "dmf",
            ModelConfig::Naskar(_) => "naskar",
        }
    }
}

/// One curve of a sweep figure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    /// Curve label in the output
    pub label: String,
    pub model: ModelConfig,
    /// Balance J before every run
    pub fic: Option<FicMechanism>,
    pub integration: IntegrationSettings,
    pub scheme: Scheme,
    pub seed: u64,
    pub g_range: GRange,
    pub reduction: Reduction,
    /// Rescale the connectome so its largest entry equals this value
    pub normalize: Option<f64>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            label: "E-E".to_string(),
            model: ModelConfig::default(),
            fic: None,
            integration: IntegrationSettings::default(),
            scheme: Scheme::default(),
            seed: 42,
            g_range: GRange::default(),
            reduction: Reduction::MaxOfMean,
            normalize: None,
        }
    }
}

impl SweepConfig {
    pub fn validate(&self) -> Result<()> {
        if self.label.contains(',') || self.label.contains('\n') {
            return Err(ConfigurationError::invalid("label", "must not contain ',' or newlines").into());
        }
        if let (ModelConfig::Naskar(_), Some(_)) = (&self.model, &self.fic) {
            return Err(ConfigurationError::invalid(
                "fic",
                "the naskar model adapts J itself and takes no FIC mechanism",
            )
            .into());
        }
        if let Some(max) = self.normalize {
            check_positive("normalize", max)?;
        }
        self.integration.validate()?;
        if self.integration.samples()? == 0 {
            return Err(ConfigurationError::invalid("integration.t_max", "must record at least one sample").into());
        }
        self.g_range.values()?;
        Ok(())
    }

    /// E-E and FDMF curves: baseline DMF without and with Herzog FIC
    pub fn figure_herzog() -> Vec<SweepConfig> {
        let ee = SweepConfig::default();
        let fic = SweepConfig {
            label: "FDMF".to_string(),
            fic: Some(FicMechanism::Herzog2022(Herzog2022::default())),
            ..ee.clone()
        };
        vec![ee, fic]
    }

    /// E-E and MDMF curves: deterministic 9 min runs after a 60 s warm-up
    pub fn figure_naskar() -> Vec<SweepConfig> {
        let ee = SweepConfig {
            integration: IntegrationSettings {
                dt: 0.1,
                t_max: 9.0 * 60.0 * 1000.0,
                t_warm_up: 60.0 * 1000.0,
            },
            scheme: Scheme::Euler,
            ..SweepConfig::default()
        };
        let mdmf = SweepConfig {
            label: "MDMF".to_string(),
            model: ModelConfig::Naskar(NaskarParams::default()),
            ..ee.clone()
        };
        vec![ee, mdmf]
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// Reduced value at one G
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub g: f64,
    /// `None` when the run diverged
    pub value: Option<f64>,
    /// FIC convergence flag, when FIC was used
    pub fic_converged: Option<bool>,
}

impl SweepPoint {
    pub fn diverged(&self) -> bool {
        self.value.is_none()
    }
}

/// One curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub label: String,
    pub model: String,
    pub reduction: Reduction,
    pub points: Vec<SweepPoint>,
}

impl SweepResult {
    pub fn values(&self) -> Vec<Option<f64>> {
        self.points.iter().map(|p| p.value).collect()
    }

    /// Spread (max - min) of the finite values
    pub fn spread(&self) -> Option<f64> {
        let values: Vec<f64> = self.points.iter().filter_map(|p| p.value).collect();
        if values.is_empty() {
            return None;
        }
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        Some(max - min)
    }

    pub fn n_diverged(&self) -> usize {
        self.points.iter().filter(|p| p.diverged()).count()
    }
}

/// CSV with columns `label,g,value,diverged`
pub fn write_csv<W: Write>(results: &[SweepResult], mut out: W) -> std::io::Result<()> {
    writeln!(out, "label,g,value,diverged")?;
    for result in results {
        for p in &result.points {
            let value = p.value.map(|v| v.to_string()).unwrap_or_default();
            writeln!(out, "{},{:.4},{},{}", result.label, p.g, value, p.diverged())?;
        }
    }
    Ok(())
}

// ============================================================================
// DRIVER
// ============================================================================

/// Sweep without a J cache
pub fn run_sweep(config: &SweepConfig, connectome: &Connectome) -> Result<SweepResult> {
    run_sweep_with(config, connectome, NoStore, &|_| {})
}

/// Sweep with a J store and a callback per finished point (any order)
pub fn run_sweep_with<S: JStore>(
    config: &SweepConfig,
    connectome: &Connectome,
    store: S,
    on_point: &(dyn Fn(&SweepPoint) + Sync),
) -> Result<SweepResult> {
    config.validate()?;
    let connectome = match config.normalize {
        Some(max) => connectome.normalized(max)?,
        None => connectome.clone(),
    };
    let gs = config.g_range.values()?;
    info!(
        label = %config.label,
        model = config.model.name(),
        points = gs.len(),
        regions = connectome.n_regions(),
        "sweep"
    );

    let points = match &config.model {
        ModelConfig::Dmf(params) => sweep_dmf(config, params, &connectome, &gs, store, on_point)?,
        ModelConfig::Naskar(params) => sweep_naskar(config, params, &connectome, &gs, on_point)?,
    };

    let result = SweepResult {
        label: config.label.clone(),
        model: config.model.name().to_string(),
        reduction: config.reduction,
        points,
    };
    if result.n_diverged() > 0 {
        warn!(label = %result.label, diverged = result.n_diverged(), "sweep had diverged points");
    }
    Ok(result)
}

fn sweep_dmf<S: JStore>(
    config: &SweepConfig,
    params: &DmfParams,
    connectome: &Connectome,
    gs: &[f64],
    store: S,
    on_point: &(dyn Fn(&SweepPoint) + Sync),
) -> Result<Vec<SweepPoint>> {
    let n = connectome.n_regions();
    let mut params = params.clone();
    if params.j.is_empty() {
        params.j = Array1::ones(n);
    }
    let template = DynamicMeanField::new(n, params)?;
    let coupling = InstantaneousCoupling::new(connectome);

    // Balance every G up front, then simulate
    let balanced: Vec<Option<Result<BalanceOutcome>>> = match &config.fic {
        Some(mechanism) => FicSolver::new(mechanism.clone(), store)
            .balance_all(&template, &coupling, gs)
            .into_iter()
            .map(Some)
            .collect(),
        None => gs.iter().map(|_| None).collect(),
    };

    gs.par_iter()
        .zip(balanced)
        .map(|(&g, fic)| {
            let model = template.with_global_coupling(g)?;
            let point = match fic {
                None => SweepPoint {
                    g,
                    value: simulate_point(&model, &coupling, connectome.id(), config, g)?,
                    fic_converged: None,
                },
                Some(Ok(outcome)) => {
                    let model = model.with_inhibitory_weights(outcome.j)?;
                    SweepPoint {
                        g,
                        value: simulate_point(&model, &coupling, connectome.id(), config, g)?,
                        fic_converged: Some(outcome.converged),
                    }
                }
                Some(Err(WholeBrainError::NumericalDivergence(what))) => {
                    warn!(g, %what, "FIC burst diverged");
                    SweepPoint {
                        g,
                        value: None,
                        fic_converged: Some(false),
                    }
                }
                Some(Err(e)) => return Err(e),
            };
            on_point(&point);
            Ok(point)
        })
        .collect()
}

fn sweep_naskar(
    config: &SweepConfig,
    params: &NaskarParams,
    connectome: &Connectome,
    gs: &[f64],
    on_point: &(dyn Fn(&SweepPoint) + Sync),
) -> Result<Vec<SweepPoint>> {
    let template = Naskar::new(connectome, params.clone())?;
    gs.par_iter()
        .map(|&g| {
            let model = template.with_global_coupling(g)?;
            let point = SweepPoint {
                g,
                value: simulate_point(&model, model.coupling_operator(), connectome.id(), config, g)?,
                fic_converged: None,
            };
            on_point(&point);
            Ok(point)
        })
        .collect()
}

/// Run one G and reduce its rates; `None` when the run diverged
fn simulate_point<M: NeuronalModel>(
    model: &M,
    coupling: &dyn CouplingOperator,
    connectome: ConnectomeId,
    config: &SweepConfig,
    g: f64,
) -> Result<Option<f64>> {
    let ctx = SimulationContext::new(model, coupling, config.scheme)?.bound_to(connectome)?;
    let mut rng = StdRng::seed_from_u64(config.seed ^ key_bits(g));
    let ts = config.integration.run(&ctx, &mut rng)?;
    let value = config.reduction.apply(ts.variable(model.rate_observable()));

    if let Err(e) = ts.check_finite() {
        warn!(g, error = %e, "run diverged");
        return Ok(None);
    }
    if !value.is_finite() {
        warn!(g, value, "reduced rate is not finite");
        return Ok(None);
    }
    info!(g, value, "point");
    Ok(Some(value))
}

// ============================================================================
// TESTS
// ============================================================================
