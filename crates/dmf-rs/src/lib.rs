//! # DMF-RS: Dynamic Mean Field Models
//!
//! Neural mass models of coupled excitatory/inhibitory pools, one pair per
//! brain region, connected through an anatomical connectome.
//!
//! Models:
//! - [`DynamicMeanField`]: Deco et al. (2014), J Neurosci 34(23):7886.
//!   Local inhibitory weight J is a fixed per-region parameter.
//! - [`Naskar`]: multiscale DMF of Naskar et al. (2021), Netw Neurosci 5(3).
//!   J is a per-region state variable driven by inhibitory plasticity
//!   towards a target excitatory rate.
//!
//! Both record the excitatory input current `I_e` (nA) and the excitatory
//! firing rate `r_e` (Hz). Time is in ms.

use ndarray::{s, Array1, Array2, ArrayView1, Zip};
use serde::{Deserialize, Serialize};
use wholebrain_core::{
    check_finite, check_positive, check_region_vector, hash_values, ConfigurationError,
    Connectome, ConnectomeId, CouplingOperator, GlobalCoupling, InhibitoryWeights, NetworkState,
    NeuronalModel, RegionVector, Result,
};

/// Initial value of the synaptic gating variables
pub const INITIAL_GATING: f64 = 0.001;

const OBSERVABLES: &[&str] = &["I_e", "r_e"];

// ============================================================================
// GAIN FUNCTION
// ============================================================================

/// Input-output function of a neural pool (Abbott & Chance 2005)
///
/// `phi(I) = (a I - b) / (1 - exp(-d (a I - b)))`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GainFunction {
    pub a: f64, // Gain (nC^-1)
    pub b: f64, // Threshold (Hz)
    pub d: f64, // Curvature (s)
}

impl GainFunction {
    pub const fn excitatory() -> Self {
        Self { a: 310.0, b: 125.0, d: 0.16 }
    }

    pub const fn inhibitory() -> Self {
        Self { a: 615.0, b: 177.0, d: 0.087 }
    }

    /// Firing rate (Hz) for an input current (nA)
    #[inline]
    pub fn rate(&self, current: f64) -> f64 {
        let x = self.a * current - self.b;
        if x.abs() < 1e-9 {
            // Removable singularity: limit is 1/d
            1.0 / self.d + 0.5 * x
        } else {
            x / (1.0 - (-self.d * x).exp())
        }
    }

    /// Current at which `a I - b` vanishes
    pub fn threshold_current(&self) -> f64 {
        self.b / self.a
    }

    fn validate(&self, name: &str) -> std::result::Result<(), ConfigurationError> {
        check_positive(&format!("{}.a", name), self.a)?;
        check_finite(&format!("{}.b", name), self.b)?;
        check_positive(&format!("{}.d", name), self.d)
    }
}

// ============================================================================
// COUPLING
// ============================================================================

/// Instantaneous direct coupling: `input = C · x`
#[derive(Debug, Clone)]
pub struct InstantaneousCoupling {
    weights: Array2<f64>,
    connectome: ConnectomeId,
}

impl InstantaneousCoupling {
    pub fn new(connectome: &Connectome) -> Self {
        Self {
            weights: connectome.weights().clone(),
            connectome: connectome.id(),
        }
    }
}

impl CouplingOperator for InstantaneousCoupling {
    fn n_regions(&self) -> usize {
        self.weights.nrows()
    }

    fn connectome_id(&self) -> ConnectomeId {
        self.connectome
    }

    fn couple(&self, coupled_state: ArrayView1<'_, f64>) -> RegionVector {
        self.weights.dot(&coupled_state)
    }
}

// ============================================================================
// SHARED POOL DYNAMICS
// ============================================================================

/// Constants shared by both DMF variants
#[derive(Debug, Clone, Copy)]
struct PoolConstants {
    base_e: f64,
    base_i: f64,
    w_jn: f64,
    jn: f64,
    tau_e: f64,
    tau_i: f64,
    gamma: f64,
    gamma_i: f64,
    gain_e: GainFunction,
    gain_i: GainFunction,
}

impl PoolConstants {
    /// Fill `I_e` and `r_e` for every region
    fn excitatory(
        &self,
        state: &NetworkState,
        drive: &RegionVector,
        j: ArrayView1<'_, f64>,
        observed: &mut Array2<f64>,
    ) {
        let (mut ie_out, mut re_out) = observed.multi_slice_mut((s![0, ..], s![1, ..]));
        Zip::from(&mut ie_out)
            .and(&mut re_out)
            .and(state.row(0))
            .and(state.row(1))
            .and(drive)
            .and(j)
            .for_each(|ie_out, re_out, &se, &si, &drive, &j| {
                let ie = self.base_e + self.w_jn * se + drive - j * si;
                *ie_out = ie;
                *re_out = self.gain_e.rate(ie);
            });
    }

    /// Write `dS_e` and `dS_i`
    fn gating(&self, state: &NetworkState, re: ArrayView1<'_, f64>, dstate: &mut NetworkState) {
        let (mut d_se, mut d_si) = dstate.multi_slice_mut((s![0, ..], s![1, ..]));
        Zip::from(&mut d_se)
            .and(&mut d_si)
            .and(re)
            .and(state.row(0))
            .and(state.row(1))
            .for_each(|d_se, d_si, &re, &se, &si| {
                let ri = self.gain_i.rate(self.base_i + self.jn * se - si);
                *d_se = -se / self.tau_e + (1.0 - se) * self.gamma * re / 1000.0;
                *d_si = -si / self.tau_i + self.gamma_i * ri / 1000.0;
            });
    }

    fn inhibitory_rate(&self, se: f64, si: f64) -> f64 {
        self.gain_i.rate(self.base_i + self.jn * se - si)
    }
}

fn initial_gating(n_rows: usize, n: usize) -> NetworkState {
    Array2::from_elem((n_rows, n), INITIAL_GATING)
}

// ============================================================================
// DYNAMIC MEAN FIELD (Deco 2014)
// ============================================================================

/// Parameters of [`DynamicMeanField`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DmfParams {
    pub tau_e: f64,   // NMDA time constant (ms)
    pub tau_i: f64,   // GABA time constant (ms)
    pub gamma: f64,   // Kinetic parameter of excitation
    pub jn: f64,      // NMDA coupling (nA)
    pub i0: f64,      // External input (nA)
    pub j_ext_e: f64, // External input scaling, excitatory pool
    pub j_ext_i: f64, // External input scaling, inhibitory pool
    pub w: f64,       // Local excitatory recurrence
    pub g: f64,       // Global coupling (G)
    /// Local inhibitory weight per region (FIC)
    #[serde(with = "wholebrain_core::region_vector_serde")]
    pub j: RegionVector,
    /// Extra input current per region (nA); empty means none
    #[serde(with = "wholebrain_core::region_vector_serde")]
    pub i_ext: RegionVector,
    pub gain_e: GainFunction,
    pub gain_i: GainFunction,
}

impl Default for DmfParams {
    fn default() -> Self {
        Self {
            tau_e: 100.0,
            tau_i: 10.0,
            gamma: 0.641,
            jn: 0.15,
            i0: 0.382,
            j_ext_e: 1.0,
            j_ext_i: 0.7,
            w: 1.4,
            g: 2.1,
            j: Array1::zeros(0),
            i_ext: Array1::zeros(0),
            gain_e: GainFunction::excitatory(),
            gain_i: GainFunction::inhibitory(),
        }
    }
}

impl DmfParams {
    /// Defaults with J = 1 in every region (no FIC)
    pub fn for_regions(n: usize) -> Self {
        Self {
            j: Array1::ones(n),
            ..Default::default()
        }
    }

    pub fn with_g(mut self, g: f64) -> Self {
        self.g = g;
        self
    }

    pub fn validate(&self, n: usize) -> std::result::Result<(), ConfigurationError> {
        check_positive("tau_e", self.tau_e)?;
        check_positive("tau_i", self.tau_i)?;
        for (name, value) in [
            ("gamma", self.gamma),
            ("jn", self.jn),
            ("i0", self.i0),
            ("j_ext_e", self.j_ext_e),
            ("j_ext_i", self.j_ext_i),
            ("w", self.w),
            ("g", self.g),
        ] {
            check_finite(name, value)?;
        }
        check_region_vector("J", &self.j, n)?;
        if !self.i_ext.is_empty() {
            check_region_vector("i_ext", &self.i_ext, n)?;
        }
        self.gain_e.validate("gain_e")?;
        self.gain_i.validate("gain_i")
    }

    fn constants(&self) -> PoolConstants {
        PoolConstants {
            base_e: self.j_ext_e * self.i0,
            base_i: self.j_ext_i * self.i0,
            w_jn: self.w * self.jn,
            jn: self.jn,
            tau_e: self.tau_e,
            tau_i: self.tau_i,
            gamma: self.gamma,
            gamma_i: 1.0,
            gain_e: self.gain_e,
            gain_i: self.gain_i,
        }
    }
}

/// Dynamic mean field model with fixed local inhibition
///
/// State rows: `S_e`, `S_i`.
#[derive(Debug, Clone)]
pub struct DynamicMeanField {
    n: usize,
    params: DmfParams,
    i_ext: RegionVector,
}

impl DynamicMeanField {
    pub fn new(n_regions: usize, params: DmfParams) -> Result<Self> {
        if n_regions == 0 {
            return Err(ConfigurationError::invalid("n_regions", "must be > 0").into());
        }
        params.validate(n_regions)?;
        let i_ext = resolve_external(&params.i_ext, n_regions);
        Ok(Self {
            n: n_regions,
            params,
            i_ext,
        })
    }

    pub fn params(&self) -> &DmfParams {
        &self.params
    }

    /// Replace the whole parameter set. On error the previous set is kept.
    pub fn set_params(&mut self, params: DmfParams) -> Result<()> {
        params.validate(self.n)?;
        self.i_ext = resolve_external(&params.i_ext, self.n);
        self.params = params;
        Ok(())
    }

    /// Copy of this model with another parameter set
    pub fn with_params(&self, params: DmfParams) -> Result<Self> {
        Self::new(self.n, params)
    }
}

fn resolve_external(i_ext: &RegionVector, n: usize) -> RegionVector {
    if i_ext.is_empty() {
        Array1::zeros(n)
    } else {
        i_ext.clone()
    }
}

/// Long-range drive `G jn lre + i_ext`
fn drive(long_range: &RegionVector, g: f64, jn: f64, i_ext: &RegionVector) -> RegionVector {
    long_range * (g * jn) + i_ext
}

impl NeuronalModel for DynamicMeanField {
    fn name(&self) -> &'static str {
        "DMF"
    }

    fn n_regions(&self) -> usize {
        self.n
    }

    fn state_names(&self) -> &'static [&'static str] {
        &["S_e", "S_i"]
    }

    fn observable_names(&self) -> &'static [&'static str] {
        OBSERVABLES
    }

    fn rate_observable(&self) -> usize {
        1
    }

    fn initial_state(&self) -> NetworkState {
        initial_gating(2, self.n)
    }

    fn drift(
        &self,
        state: &NetworkState,
        long_range: &RegionVector,
        dstate: &mut NetworkState,
        observed: &mut Array2<f64>,
    ) {
        let p = &self.params;
        let c = p.constants();
        let drive = drive(long_range, p.g, p.jn, &self.i_ext);
        c.excitatory(state, &drive, p.j.view(), observed);
        c.gating(state, observed.row(1), dstate);
    }
}

impl GlobalCoupling for DynamicMeanField {
    fn global_coupling(&self) -> f64 {
        self.params.g
    }

    fn with_global_coupling(&self, g: f64) -> Result<Self> {
        self.with_params(self.params.clone().with_g(g))
    }
}

impl InhibitoryWeights for DynamicMeanField {
    fn inhibitory_weights(&self) -> &RegionVector {
        &self.params.j
    }

    fn with_inhibitory_weights(&self, j: RegionVector) -> Result<Self> {
        self.with_params(DmfParams {
            j,
            ..self.params.clone()
        })
    }

    fn template_fingerprint(&self) -> u64 {
        let p = &self.params;
        let scalars = [p.tau_e, p.tau_i, p.gamma, p.jn, p.i0, p.j_ext_e, p.j_ext_i, p.w];
        let gains = [p.gain_e, p.gain_i].into_iter().flat_map(|f| [f.a, f.b, f.d]);
        // i_ext length is folded in so an empty vector differs from zeros
        let values = scalars
            .into_iter()
            .chain(gains)
            .chain(std::iter::once(p.i_ext.len() as f64))
            .chain(p.i_ext.iter().copied());
        hash_values(values, self.n as u64)
    }
}

// ============================================================================
// MULTISCALE DMF (Naskar 2021)
// ============================================================================

/// Parameters of [`Naskar`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NaskarParams {
    pub tau_e: f64,
    pub tau_i: f64,
    pub gamma: f64,
    pub gamma_i: f64, // Kinetic parameter of inhibition
    pub jn: f64,
    pub i0: f64,
    pub j_ext_e: f64,
    pub j_ext_i: f64,
    pub w: f64,
    pub g: f64,
    pub rho: f64, // Target excitatory rate (Hz)
    pub eta: f64, // Inhibitory plasticity rate (ms^-1 Hz^-2)
    /// Initial local inhibitory weight per region; empty means ones
    #[serde(with = "wholebrain_core::region_vector_serde")]
    pub j_init: RegionVector,
    #[serde(with = "wholebrain_core::region_vector_serde")]
    pub i_ext: RegionVector,
    pub gain_e: GainFunction,
    pub gain_i: GainFunction,
}

impl Default for NaskarParams {
    fn default() -> Self {
        let dmf = DmfParams::default();
        Self {
            tau_e: dmf.tau_e,
            tau_i: dmf.tau_i,
            gamma: dmf.gamma,
            gamma_i: 1.0,
            jn: dmf.jn,
            i0: dmf.i0,
            j_ext_e: dmf.j_ext_e,
            j_ext_i: dmf.j_ext_i,
            w: dmf.w,
            g: dmf.g,
            rho: 3.0,
            eta: 1e-4,
            j_init: Array1::zeros(0),
            i_ext: Array1::zeros(0),
            gain_e: dmf.gain_e,
            gain_i: dmf.gain_i,
        }
    }
}

impl NaskarParams {
    pub fn with_g(mut self, g: f64) -> Self {
        self.g = g;
        self
    }

    pub fn validate(&self, n: usize) -> std::result::Result<(), ConfigurationError> {
        check_positive("tau_e", self.tau_e)?;
        check_positive("tau_i", self.tau_i)?;
        for (name, value) in [
            ("gamma", self.gamma),
            ("gamma_i", self.gamma_i),
            ("jn", self.jn),
            ("i0", self.i0),
            ("j_ext_e", self.j_ext_e),
            ("j_ext_i", self.j_ext_i),
            ("w", self.w),
            ("g", self.g),
            ("rho", self.rho),
            ("eta", self.eta),
        ] {
            check_finite(name, value)?;
        }
        if self.eta < 0.0 {
            return Err(ConfigurationError::invalid("eta", "must be >= 0"));
        }
        if !self.j_init.is_empty() {
            check_region_vector("j_init", &self.j_init, n)?;
        }
        if !self.i_ext.is_empty() {
            check_region_vector("i_ext", &self.i_ext, n)?;
        }
        self.gain_e.validate("gain_e")?;
        self.gain_i.validate("gain_i")
    }

    fn constants(&self) -> PoolConstants {
        PoolConstants {
            base_e: self.j_ext_e * self.i0,
            base_i: self.j_ext_i * self.i0,
            w_jn: self.w * self.jn,
            jn: self.jn,
            tau_e: self.tau_e,
            tau_i: self.tau_i,
            gamma: self.gamma,
            gamma_i: self.gamma_i,
            gain_e: self.gain_e,
            gain_i: self.gain_i,
        }
    }
}

/// Multiscale dynamic mean field model with inhibitory plasticity
///
/// State rows: `S_e`, `S_i`, `J`. The model owns a coupling operator bound
/// to the connectome it was built from.
#[derive(Debug, Clone)]
pub struct Naskar {
    params: NaskarParams,
    coupling: InstantaneousCoupling,
    j_init: RegionVector,
    i_ext: RegionVector,
}

impl Naskar {
    pub fn new(connectome: &Connectome, params: NaskarParams) -> Result<Self> {
        Self::with_coupling(InstantaneousCoupling::new(connectome), params)
    }

    fn with_coupling(coupling: InstantaneousCoupling, params: NaskarParams) -> Result<Self> {
        let n = coupling.n_regions();
        params.validate(n)?;
        let j_init = if params.j_init.is_empty() {
            Array1::ones(n)
        } else {
            params.j_init.clone()
        };
        let i_ext = resolve_external(&params.i_ext, n);
        Ok(Self {
            params,
            coupling,
            j_init,
            i_ext,
        })
    }

    pub fn params(&self) -> &NaskarParams {
        &self.params
    }

    /// Replace the whole parameter set. On error the previous set is kept.
    pub fn set_params(&mut self, params: NaskarParams) -> Result<()> {
        *self = Self::with_coupling(self.coupling.clone(), params)?;
        Ok(())
    }

    pub fn with_params(&self, params: NaskarParams) -> Result<Self> {
        Self::with_coupling(self.coupling.clone(), params)
    }

    /// Coupling operator bound to this model's connectome
    pub fn coupling_operator(&self) -> &InstantaneousCoupling {
        &self.coupling
    }
}

impl NeuronalModel for Naskar {
    fn name(&self) -> &'static str {
        "MDMF"
    }

    fn n_regions(&self) -> usize {
        self.coupling.n_regions()
    }

    fn state_names(&self) -> &'static [&'static str] {
        &["S_e", "S_i", "J"]
    }

    fn observable_names(&self) -> &'static [&'static str] {
        OBSERVABLES
    }

    fn rate_observable(&self) -> usize {
        1
    }

    fn initial_state(&self) -> NetworkState {
        let mut state = initial_gating(3, self.n_regions());
        state.row_mut(2).assign(&self.j_init);
        state
    }

    fn drift(
        &self,
        state: &NetworkState,
        long_range: &RegionVector,
        dstate: &mut NetworkState,
        observed: &mut Array2<f64>,
    ) {
        let p = &self.params;
        let c = p.constants();
        let drive = drive(long_range, p.g, p.jn, &self.i_ext);
        c.excitatory(state, &drive, state.row(2), observed);
        c.gating(state, observed.row(1), dstate);

        let (eta, rho) = (p.eta, p.rho);
        Zip::from(dstate.row_mut(2))
            .and(observed.row(1))
            .and(state.row(0))
            .and(state.row(1))
            .for_each(|d_j, &re, &se, &si| {
                *d_j = eta * c.inhibitory_rate(se, si) * (re - rho);
            });
    }
}

impl GlobalCoupling for Naskar {
    fn global_coupling(&self) -> f64 {
        self.params.g
    }

    fn with_global_coupling(&self, g: f64) -> Result<Self> {
        self.with_params(self.params.clone().with_g(g))
    }
}

// ============================================================================
// TESTS
// ============================================================================
