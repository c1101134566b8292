//! # FIC-RS: Feedback Inhibition Control
//!
//! Calibrates the per-region local inhibitory weight J of a mean field
//! model so that every region fires close to a target excitatory rate.
//!
//! ## Mechanisms
//!
//! | Mechanism | Method | Cost |
//! |-----------|--------|------|
//! | [`Herzog2022`] | `J = alpha G strength + beta` | none |
//! | [`ProportionalFic`] | damped proportional search on burst rates | bursts |
//! | [`Deco2014`] | fixed-increment search on the input current | bursts |
//!
//! [`FicSolver`] adds caching through a [`JStore`] and balances many G
//! values in parallel.

use ndarray::{Array1, Zip};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use xxhash_rust::xxh64::xxh64;
use wholebrain_core::{
    check_positive, ConfigurationError, ConnectomeId, CouplingOperator, GlobalCoupling,
    InhibitoryWeights, NeuronalModel, Rate, RegionVector, Result, Time, TimeSeries,
    WholeBrainError,
};
use wholebrain_dmf::GainFunction;
use wholebrain_integrator::{EulerMaruyama, IntegrationScheme, SimulationContext};

/// Canonical target excitatory rate (Hz)
pub const TARGET_RATE: Rate = 3.0;

// ============================================================================
// OUTCOME
// ============================================================================

/// Result of balancing one G value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceOutcome {
    /// Global coupling the J was computed for
    pub g: f64,
    #[serde(with = "wholebrain_core::region_vector_serde")]
    pub j: RegionVector,
    pub converged: bool,
    pub iterations: usize,
    /// Largest `|rate - target|` (Hz) of the returned J; 0 for analytic mechanisms
    pub max_rate_error: f64,
    /// Mean excitatory rate per region measured with the returned J; empty for analytic mechanisms
    #[serde(with = "wholebrain_core::region_vector_serde")]
    pub rates: RegionVector,
}

impl BalanceOutcome {
    /// Turn a non-converged outcome into [`WholeBrainError::NonConvergence`]
    pub fn into_converged(self) -> Result<Self> {
        if self.converged {
            Ok(self)
        } else {
            Err(WholeBrainError::NonConvergence {
                g: self.g,
                iterations: self.iterations,
                max_error: self.max_rate_error,
            })
        }
    }

    fn is_usable(&self, n: usize) -> bool {
        self.j.len() == n && self.j.iter().all(|v| v.is_finite())
    }
}

fn max_abs_error(rates: &RegionVector, target: Rate) -> f64 {
    rates
        .iter()
        .map(|r| (r - target).abs())
        .fold(0.0, |acc: f64, e| if e.is_nan() { f64::NAN } else { acc.max(e) })
}

/// G rounded to two decimals, as an integer
pub fn g_centi(g: f64) -> i64 {
    (g * 100.0).round() as i64
}

/// Bits mixed into the burst seed so every G draws its own noise
pub fn key_bits(g: f64) -> u64 {
    g_centi(g) as u64
}

// ============================================================================
// BURSTS
// ============================================================================

/// Short noisy simulation used only to measure rates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BurstConfig {
    pub dt: Time,
    /// Discarded transient (ms)
    pub t_warm_up: Time,
    /// Measured window (ms)
    pub t_measure: Time,
    /// Euler-Maruyama noise amplitude
    pub sigma: f64,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            dt: 0.1,
            t_warm_up: 2000.0,
            t_measure: 5000.0,
            sigma: 0.001,
        }
    }
}

impl BurstConfig {
    /// Simulate `t_max` and discard the first `min(1000 ms, t_max / 10)`
    pub fn discarding_transient(t_max: Time) -> Self {
        let discard = if t_max > 1000.0 { 1000.0 } else { t_max / 10.0 };
        Self {
            t_warm_up: discard,
            t_measure: t_max - discard,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_positive("burst.t_measure", self.t_measure)?;
        wholebrain_integrator::step_count(self.t_warm_up, self.dt)?;
        EulerMaruyama::new(self.sigma).validate()?;
        Ok(())
    }

    /// Run one burst. Divergence is an error here, not data.
    pub fn run<M, R>(&self, model: &M, coupling: &dyn CouplingOperator, rng: &mut R) -> Result<TimeSeries>
    where
        M: NeuronalModel + ?Sized,
        R: Rng + ?Sized,
    {
        let ctx = SimulationContext::new(model, coupling, EulerMaruyama::new(self.sigma))?;
        let ts = ctx.warm_up_and_simulate(self.dt, self.t_measure, self.t_warm_up, rng)?;
        ts.check_finite()?;
        Ok(ts)
    }
}

// ============================================================================
// MECHANISMS
// ============================================================================

/// Strategy computing a balanced J for the G of a model
pub trait BalancingMechanism: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Balance `model` at its own G. The model's current J is ignored.
    fn balance<M>(&self, model: &M, coupling: &dyn CouplingOperator) -> Result<BalanceOutcome>
    where
        M: InhibitoryWeights + GlobalCoupling;
}

/// Linear approximation of Herzog et al. (2022)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Herzog2022 {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for Herzog2022 {
    fn default() -> Self {
        Self {
            alpha: 0.75,
            beta: 1.0,
        }
    }
}

impl Herzog2022 {
    /// `alpha G strength + beta`, strength being the row sums of the connectome
    pub fn j(&self, g: f64, coupling: &dyn CouplingOperator) -> RegionVector {
        let strength = coupling.couple(Array1::ones(coupling.n_regions()).view());
        strength.mapv(|s| self.alpha * g * s + self.beta)
    }
}

impl BalancingMechanism for Herzog2022 {
    fn name(&self) -> &'static str {
        "herzog2022"
    }

    fn balance<M>(&self, model: &M, coupling: &dyn CouplingOperator) -> Result<BalanceOutcome>
    where
        M: InhibitoryWeights + GlobalCoupling,
    {
        let g = model.global_coupling();
        Ok(BalanceOutcome {
            g,
            j: self.j(g, coupling),
            converged: true,
            iterations: 0,
            max_rate_error: 0.0,
            rates: Array1::zeros(0),
        })
    }
}

/// Starting point of an iterative search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JInit {
    #[default]
    Herzog2022,
    Ones,
}

impl JInit {
    fn initial(&self, g: f64, coupling: &dyn CouplingOperator) -> RegionVector {
        match self {
            JInit::Herzog2022 => Herzog2022::default().j(g, coupling),
            JInit::Ones => Array1::ones(coupling.n_regions()),
        }
    }
}

/// Damped proportional search on measured burst rates
///
/// Every region farther than `acceptance * tolerance` from the target moves
/// by `gain (rate - target)`, clipped to `max_step`. A region's gain halves
/// each time its error changes sign. A candidate inside the acceptance band
/// is re-simulated `confirmation_bursts` times with fresh noise and accepted
/// only if every burst keeps every region within `tolerance`; otherwise the
/// search continues from the rates pooled over all of its bursts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProportionalFic {
    pub target: Rate,
    pub tolerance: Rate,
    /// Fraction of `tolerance` a candidate must reach before confirmation
    pub acceptance: f64,
    pub confirmation_bursts: usize,
    pub gain: f64,
    pub min_gain: f64,
    pub max_step: f64,
    pub max_iterations: usize,
    /// Lower bound of J
    pub j_min: f64,
    pub j_init: JInit,
    /// Independent bursts averaged per evaluation
    pub bursts_per_evaluation: usize,
    pub burst: BurstConfig,
    pub seed: u64,
}

impl Default for ProportionalFic {
    fn default() -> Self {
        Self {
            target: TARGET_RATE,
            tolerance: 0.2,
            acceptance: 0.5,
            confirmation_bursts: 2,
            gain: 0.05,
            min_gain: 0.005,
            max_step: 0.5,
            max_iterations: 200,
            j_min: 0.0,
            j_init: JInit::Herzog2022,
            bursts_per_evaluation: 1,
            burst: BurstConfig::default(),
            seed: 42,
        }
    }
}

impl ProportionalFic {
    /// Mean excitatory rate per region of one burst; `None` if it diverged
    fn burst_rates<M, R>(&self, model: &M, coupling: &dyn CouplingOperator, rng: &mut R) -> Result<Option<RegionVector>>
    where
        M: NeuronalModel,
        R: Rng + ?Sized,
    {
        match self.burst.run(model, coupling, rng) {
            Ok(ts) => Ok(Some(ts.time_mean(model.rate_observable()))),
            Err(WholeBrainError::NumericalDivergence(what)) => {
                debug!(%what, "FIC burst diverged");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Rates averaged over `bursts_per_evaluation` bursts; `None` if any diverged
    fn evaluate<M, R>(&self, model: &M, coupling: &dyn CouplingOperator, rng: &mut R) -> Result<Option<RegionVector>>
    where
        M: NeuronalModel,
        R: Rng + ?Sized,
    {
        let bursts = self.bursts_per_evaluation.max(1);
        let mut total = Array1::zeros(model.n_regions());
        for _ in 0..bursts {
            match self.burst_rates(model, coupling, rng)? {
                Some(rates) => total += &rates,
                None => return Ok(None),
            }
        }
        Ok(Some(total / bursts as f64))
    }

    /// Re-simulate an accepted candidate with fresh noise
    ///
    /// Returns whether every confirmation burst kept every region within
    /// tolerance, and the rates pooled over `first` and the confirmations.
    fn confirm<M, R>(
        &self,
        model: &M,
        coupling: &dyn CouplingOperator,
        rng: &mut R,
        first: &RegionVector,
    ) -> Result<(bool, RegionVector)>
    where
        M: NeuronalModel,
        R: Rng + ?Sized,
    {
        let mut held = true;
        let mut total = first.clone();
        let mut count = 1;
        for _ in 0..self.confirmation_bursts {
            match self.burst_rates(model, coupling, rng)? {
                Some(rates) => {
                    held &= max_abs_error(&rates, self.target) <= self.tolerance;
                    total += &rates;
                    count += 1;
                }
                None => held = false,
            }
        }
        Ok((held, total / count as f64))
    }
}

impl BalancingMechanism for ProportionalFic {
    fn name(&self) -> &'static str {
        "proportional"
    }

    fn validate(&self) -> Result<()> {
        check_positive("target", self.target)?;
        check_positive("tolerance", self.tolerance)?;
        check_positive("acceptance", self.acceptance)?;
        if self.acceptance > 1.0 {
            return Err(ConfigurationError::invalid("acceptance", "must be <= 1").into());
        }
        check_positive("gain", self.gain)?;
        check_positive("min_gain", self.min_gain)?;
        check_positive("max_step", self.max_step)?;
        if self.max_iterations == 0 {
            return Err(ConfigurationError::invalid("max_iterations", "must be > 0").into());
        }
        if !self.j_min.is_finite() || self.j_min < 0.0 {
            return Err(ConfigurationError::invalid("j_min", "must be finite and >= 0").into());
        }
        self.burst.validate()
    }

    fn balance<M>(&self, model: &M, coupling: &dyn CouplingOperator) -> Result<BalanceOutcome>
    where
        M: InhibitoryWeights + GlobalCoupling,
    {
        self.validate()?;
        let g = model.global_coupling();
        let n = model.n_regions();
        let mut rng = StdRng::seed_from_u64(self.seed ^ key_bits(g));

        let mut j = self.j_init.initial(g, coupling).mapv(|v| v.max(self.j_min));
        let mut gains = Array1::from_elem(n, self.gain);
        let mut last_error: RegionVector = Array1::zeros(n);
        let mut best: Option<(f64, RegionVector, RegionVector)> = None;
        let band = self.acceptance * self.tolerance;

        for iteration in 1..=self.max_iterations {
            let candidate = model.with_inhibitory_weights(j.clone())?;
            let Some(mut rates) = self.evaluate(&candidate, coupling, &mut rng)? else {
                warn!(g, iteration, "FIC burst diverged, retrying with fresh noise");
                continue;
            };
            let mut max_error = max_abs_error(&rates, self.target);
            debug!(g, iteration, max_error, "FIC iteration");

            if max_error <= band {
                let (held, pooled) = self.confirm(&candidate, coupling, &mut rng, &rates)?;
                rates = pooled;
                max_error = max_abs_error(&rates, self.target);
                if held {
                    return Ok(BalanceOutcome {
                        g,
                        j,
                        converged: true,
                        iterations: iteration,
                        max_rate_error: max_error,
                        rates,
                    });
                }
                debug!(g, iteration, max_error, "FIC candidate failed confirmation");
            }
            if best.as_ref().map_or(true, |(e, _, _)| max_error < *e) {
                best = Some((max_error, j.clone(), rates.clone()));
            }

            let target = self.target;
            let (min_gain, max_step, j_min) = (self.min_gain, self.max_step, self.j_min);
            Zip::from(&mut j)
                .and(&mut gains)
                .and(&mut last_error)
                .and(&rates)
                .for_each(|j, gain, last, &rate| {
                    let error = rate - target;
                    if error.abs() > band {
                        if error * *last < 0.0 {
                            *gain = (*gain * 0.5).max(min_gain);
                        }
                        let delta = (*gain * error).clamp(-max_step, max_step);
                        *j = (*j + delta).max(j_min);
                    }
                    *last = error;
                });
        }

        let (max_error, j, rates) = best.ok_or_else(|| {
            WholeBrainError::NumericalDivergence(format!("every FIC burst diverged at G = {}", g))
        })?;
        warn!(
            g,
            iterations = self.max_iterations,
            max_error,
            "FIC did not converge, returning best J"
        );
        Ok(BalanceOutcome {
            g,
            j,
            converged: false,
            iterations: self.max_iterations,
            max_rate_error: max_error,
            rates,
        })
    }
}

/// Fixed-increment search of Deco et al. (2014)
///
/// Drives the time-averaged `I_e - b/a` of every region to `target_current`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Deco2014 {
    /// Target of `I_e - b/a` (nA)
    pub target_current: f64,
    pub tolerance: f64,
    pub delta_init: f64,
    pub delta_decrement: f64,
    pub delta_min: f64,
    pub max_iterations: usize,
    pub burst: BurstConfig,
    pub seed: u64,
}

impl Default for Deco2014 {
    fn default() -> Self {
        Self {
            target_current: -0.026,
            tolerance: 0.005,
            delta_init: 0.02,
            delta_decrement: 0.001,
            delta_min: 0.001,
            max_iterations: 5000,
            burst: BurstConfig::discarding_transient(10_000.0),
            seed: 42,
        }
    }
}

impl BalancingMechanism for Deco2014 {
    fn name(&self) -> &'static str {
        "deco2014"
    }

    fn validate(&self) -> Result<()> {
        check_positive("tolerance", self.tolerance)?;
        check_positive("delta_init", self.delta_init)?;
        check_positive("delta_min", self.delta_min)?;
        if self.max_iterations == 0 {
            return Err(ConfigurationError::invalid("max_iterations", "must be > 0").into());
        }
        self.burst.validate()
    }

    fn balance<M>(&self, model: &M, coupling: &dyn CouplingOperator) -> Result<BalanceOutcome>
    where
        M: InhibitoryWeights + GlobalCoupling,
    {
        self.validate()?;
        let g = model.global_coupling();
        let n = model.n_regions();
        let threshold = GainFunction::excitatory().threshold_current();
        let mut rng = StdRng::seed_from_u64(self.seed ^ key_bits(g));

        let mut j: RegionVector = Array1::ones(n);
        let mut delta = Array1::from_elem(n, self.delta_init);
        let mut rates: RegionVector = Array1::zeros(n);

        for iteration in 1..=self.max_iterations {
            let candidate = model.with_inhibitory_weights(j.clone())?;
            let ts = self.burst.run(&candidate, coupling, &mut rng)?;
            let current = ts
                .variable_index("I_e")
                .map(|i| ts.time_mean(i) - threshold)
                .ok_or_else(|| ConfigurationError::MissingParameter("I_e observable".into()))?;
            rates = ts.time_mean(candidate.rate_observable());

            let (target, tolerance) = (self.target_current, self.tolerance);
            let (step, floor) = (self.delta_decrement, self.delta_min);
            let mut settled = 0;
            Zip::from(&mut j)
                .and(&mut delta)
                .and(&current)
                .for_each(|j, delta, &curr| {
                    if (curr - target).abs() <= tolerance {
                        settled += 1;
                    } else if curr < target {
                        *j -= *delta;
                        *delta = (*delta - step).max(floor);
                    } else {
                        *j += *delta;
                    }
                });
            debug!(g, iteration, settled, "Deco2014 iteration");

            if settled == n {
                return Ok(BalanceOutcome {
                    g,
                    max_rate_error: max_abs_error(&rates, TARGET_RATE),
                    j,
                    converged: true,
                    iterations: iteration,
                    rates,
                });
            }
        }

        warn!(g, iterations = self.max_iterations, "Deco2014 FIC did not converge");
        Ok(BalanceOutcome {
            g,
            max_rate_error: max_abs_error(&rates, TARGET_RATE),
            j,
            converged: false,
            iterations: self.max_iterations,
            rates,
        })
    }
}

/// Mechanism selected from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FicMechanism {
    Herzog2022(Herzog2022),
    Proportional(ProportionalFic),
    Deco2014(Deco2014),
}

impl Default for FicMechanism {
    fn default() -> Self {
        FicMechanism::Proportional(ProportionalFic::default())
    }
}

impl BalancingMechanism for FicMechanism {
    fn name(&self) -> &'static str {
        match self {
            FicMechanism::Herzog2022(m) => m.name(),
            FicMechanism::Proportional(m) => m.name(),
            FicMechanism::Deco2014(m) => m.name(),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            FicMechanism::Herzog2022(m) => m.validate(),
            FicMechanism::Proportional(m) => m.validate(),
            FicMechanism::Deco2014(m) => m.validate(),
        }
    }

    fn balance<M>(&self, model: &M, coupling: &dyn CouplingOperator) -> Result<BalanceOutcome>
    where
        M: InhibitoryWeights + GlobalCoupling,
    {
        match self {
            FicMechanism::Herzog2022(m) => m.balance(model, coupling),
            FicMechanism::Proportional(m) => m.balance(model, coupling),
            FicMechanism::Deco2014(m) => m.balance(model, coupling),
        }
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Identity of a balanced J
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub g_centi: i64,
    pub connectome: ConnectomeId,
    pub mechanism: String,
    /// Hash of the mechanism settings and the model template
    pub config: u64,
}

impl CacheKey {
    pub fn new(g: f64, connectome: ConnectomeId, mechanism: &str, config: u64) -> Self {
        Self {
            g_centi: g_centi(g),
            connectome,
            mechanism: mechanism.to_string(),
            config,
        }
    }

    /// `fic_<mechanism>_g<G:.2>_<connectome>_<config>`
    pub fn file_stem(&self) -> String {
        format!(
            "fic_{}_g{:.2}_{}_{:016x}",
            self.mechanism,
            self.g_centi as f64 / 100.0,
            self.connectome,
            self.config
        )
    }
}

/// Hash of a mechanism's serialized settings, seeded with the template's fingerprint
pub fn config_fingerprint<M: InhibitoryWeights>(mechanism: &FicMechanism, template: &M) -> Result<u64> {
    let settings = serde_json::to_vec(mechanism).map_err(|e| WholeBrainError::Serialization(e.to_string()))?;
    Ok(xxh64(&settings, template.template_fingerprint()))
}

/// Key-value storage of balanced J
pub trait JStore: Send + Sync {
    fn load(&self, key: &CacheKey) -> Result<Option<BalanceOutcome>>;

    fn save(&self, key: &CacheKey, outcome: &BalanceOutcome) -> Result<()>;
}

/// Always recompute
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStore;

impl JStore for NoStore {
    fn load(&self, _key: &CacheKey) -> Result<Option<BalanceOutcome>> {
        Ok(None)
    }

    fn save(&self, _key: &CacheKey, _outcome: &BalanceOutcome) -> Result<()> {
        Ok(())
    }
}

/// In-process cache
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<CacheKey, BalanceOutcome>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl JStore for MemoryStore {
    fn load(&self, key: &CacheKey) -> Result<Option<BalanceOutcome>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn save(&self, key: &CacheKey, outcome: &BalanceOutcome) -> Result<()> {
        self.entries.write().insert(key.clone(), outcome.clone());
        Ok(())
    }
}

/// One pretty-printed JSON file per key
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    /// Use (and create if needed) `dir`
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.file_stem()))
    }
}

impl JStore for JsonDirStore {
    fn load(&self, key: &CacheKey) -> Result<Option<BalanceOutcome>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let outcome = serde_json::from_str(&text)
            .map_err(|e| WholeBrainError::Serialization(format!("{}: {}", path.display(), e)))?;
        Ok(Some(outcome))
    }

    fn save(&self, key: &CacheKey, outcome: &BalanceOutcome) -> Result<()> {
        let path = self.path_for(key);
        let text = serde_json::to_string_pretty(outcome)
            .map_err(|e| WholeBrainError::Serialization(e.to_string()))?;
        // Uniquely named sibling, then rename: readers never see a partial
        // file and concurrent writers of one key never share a temp file
        let mut partial = NamedTempFile::new_in(&self.dir)?;
        partial.write_all(text.as_bytes())?;
        partial.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }
}

// ============================================================================
// SOLVER
// ============================================================================

/// Cached, parallel balancing over G values
pub struct FicSolver<S: JStore = NoStore> {
    mechanism: FicMechanism,
    store: S,
}

impl FicSolver<NoStore> {
    pub fn uncached(mechanism: FicMechanism) -> Self {
        Self {
            mechanism,
            store: NoStore,
        }
    }
}

impl<S: JStore> FicSolver<S> {
    pub fn new(mechanism: FicMechanism, store: S) -> Self {
        Self { mechanism, store }
    }

    pub fn mechanism(&self) -> &FicMechanism {
        &self.mechanism
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn key<M: InhibitoryWeights>(&self, template: &M, coupling: &dyn CouplingOperator, g: f64) -> Result<CacheKey> {
        Ok(CacheKey::new(
            g,
            coupling.connectome_id(),
            self.mechanism.name(),
            config_fingerprint(&self.mechanism, template)?,
        ))
    }

    /// Balanced J for `g`, from the store when available
    pub fn balance_j<M>(&self, template: &M, coupling: &dyn CouplingOperator, g: f64) -> Result<BalanceOutcome>
    where
        M: InhibitoryWeights + GlobalCoupling,
    {
        let key = self.key(template, coupling, g)?;
        let n = template.n_regions();
        if let Some(stored) = self.store.load(&key)? {
            if stored.is_usable(n) {
                debug!(key = %key.file_stem(), "FIC cache hit");
                return Ok(stored);
            }
            warn!(
                key = %key.file_stem(),
                stored = stored.j.len(),
                expected = n,
                "stale FIC cache entry, recomputing"
            );
        }

        let model = template.with_global_coupling(g)?;
        let outcome = self.mechanism.balance(&model, coupling)?;
        info!(
            g,
            mechanism = self.mechanism.name(),
            converged = outcome.converged,
            iterations = outcome.iterations,
            "balanced"
        );
        self.store.save(&key, &outcome)?;
        Ok(outcome)
    }

    /// Balance every G independently in parallel, results in input order
    pub fn balance_all<M>(
        &self,
        template: &M,
        coupling: &dyn CouplingOperator,
        gs: &[f64],
    ) -> Vec<Result<BalanceOutcome>>
    where
        M: InhibitoryWeights + GlobalCoupling,
    {
        gs.par_iter()
            .map(|&g| self.balance_j(template, coupling, g))
            .collect()
    }

    /// Template at `g` with its balanced J applied
    pub fn balanced_model<M>(&self, template: &M, coupling: &dyn CouplingOperator, g: f64) -> Result<(M, BalanceOutcome)>
    where
        M: InhibitoryWeights + GlobalCoupling,
    {
        let outcome = self.balance_j(template, coupling, g)?;
        let model = template
            .with_global_coupling(g)?
            .with_inhibitory_weights(outcome.j.clone())?;
        Ok((model, outcome))
    }
}

// ============================================================================
// TESTS
// ============================================================================
