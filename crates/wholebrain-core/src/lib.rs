//! # WholeBrain Core
//!
//! Shared types and utilities for whole-brain mean field simulation.
//!
//! ## Contents
//!
//! | Item | Role |
//! |------|------|
//! | [`Connectome`] | N×N anatomical connectivity with a stable identity |
//! | [`TimeSeries`] | `[sample, variable, region]` simulation output |
//! | [`NeuronalModel`] | drift + gain read-out of a neural mass model |
//! | [`CouplingOperator`] | long-range input computed from the connectome |
//! | [`Reduction`] | scalar summaries of a firing rate time series |
//!
//! ## Design Philosophy
//!
//! 1. Typed parameters, validated once, replaced atomically
//! 2. No global simulation state: everything is passed explicitly
//! 3. Numerical blow-up stays visible in the data

use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use xxhash_rust::xxh64::xxh64;

// ============================================================================
// ERRORS
// ============================================================================

/// Invalid model, coupling or integration configuration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("{what}: expected length {expected}, got {got}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        got: usize,
    },

    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Coupling bound to connectome {got}, expected {expected}")]
    StaleCoupling {
        expected: ConnectomeId,
        got: ConnectomeId,
    },

    #[error("Invalid connectome: {0}")]
    InvalidConnectome(String),
}

impl ConfigurationError {
    pub fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Common errors
#[derive(Debug, Error)]
pub enum WholeBrainError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Balancing did not converge for G = {g} after {iterations} iterations (max error {max_error:.4})")]
    NonConvergence {
        g: f64,
        iterations: usize,
        max_error: f64,
    },

    #[error("Numerical divergence: {0}")]
    NumericalDivergence(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, WholeBrainError>;

/// Time (ms)
pub type Time = f64;

/// Firing rate (Hz)
pub type Rate = f64;

/// Network state: one row per state variable, one column per region
pub type NetworkState = Array2<f64>;

/// Per-region vector (J, rates, long-range input, ...)
pub type RegionVector = Array1<f64>;

/// Serialize a [`RegionVector`] as a plain JSON array
///
/// Use with `#[serde(with = "wholebrain_core::region_vector_serde")]`.
pub mod region_vector_serde {
    use super::RegionVector;
    use ndarray::Array1;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &RegionVector, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RegionVector, D::Error> {
        Vec::<f64>::deserialize(deserializer).map(Array1::from)
    }
}

/// Check that a per-region vector has exactly `n` entries.
///
/// Scalars are never broadcast: callers build the full vector themselves.
pub fn check_region_vector(
    what: &str,
    values: &RegionVector,
    n: usize,
) -> std::result::Result<(), ConfigurationError> {
    if values.is_empty() {
        return Err(ConfigurationError::MissingParameter(what.to_string()));
    }
    if values.len() != n {
        return Err(ConfigurationError::ShapeMismatch {
            what: what.to_string(),
            expected: n,
            got: values.len(),
        });
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ConfigurationError::invalid(what, "contains non-finite values"));
    }
    Ok(())
}

/// Check a scalar parameter is finite and strictly positive
pub fn check_positive(name: &str, value: f64) -> std::result::Result<(), ConfigurationError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigurationError::invalid(
            name,
            format!("must be finite and > 0, got {}", value),
        ));
    }
    Ok(())
}

/// Check a scalar parameter is finite
pub fn check_finite(name: &str, value: f64) -> std::result::Result<(), ConfigurationError> {
    if !value.is_finite() {
        return Err(ConfigurationError::invalid(name, "must be finite"));
    }
    Ok(())
}

// ============================================================================
// CONNECTOME
// ============================================================================

/// Stable identity of a connectivity matrix (xxh64 of shape and entries)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectomeId(pub u64);

impl fmt::Display for ConnectomeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Anatomical connectivity matrix between brain regions
///
/// Entry `(i, j)` is the strength of the projection from region `j` onto
/// region `i`, so the long-range input of region `i` is row `i` times the
/// excitatory state.
#[derive(Debug, Clone)]
pub struct Connectome {
    weights: Array2<f64>,
    id: ConnectomeId,
    label: Option<String>,
}

impl Connectome {
    /// Build from a dense matrix. Must be square, non-empty, finite and non-negative.
    pub fn new(weights: Array2<f64>) -> Result<Self> {
        let (rows, cols) = weights.dim();
        if rows == 0 || rows != cols {
            return Err(ConfigurationError::InvalidConnectome(format!(
                "matrix must be square and non-empty, got {}x{}",
                rows, cols
            ))
            .into());
        }
        if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(ConfigurationError::InvalidConnectome(format!(
                "weights must be finite and non-negative, found {}",
                bad
            ))
            .into());
        }
        let id = fingerprint(&weights);
        Ok(Self {
            weights,
            id,
            label: None,
        })
    }

    /// Build from row vectors
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let n = rows.len();
        if let Some(row) = rows.iter().find(|r| r.len() != n) {
            return Err(ConfigurationError::InvalidConnectome(format!(
                "row of length {} in a {}-row matrix",
                row.len(),
                n
            ))
            .into());
        }
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        let weights = Array2::from_shape_vec((n, n), flat)
            .map_err(|e| ConfigurationError::InvalidConnectome(e.to_string()))?;
        Self::new(weights)
    }

    /// Unconnected network of `n` regions
    pub fn zeros(n: usize) -> Result<Self> {
        Self::new(Array2::zeros((n, n)))
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn n_regions(&self) -> usize {
        self.weights.nrows()
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    pub fn id(&self) -> ConnectomeId {
        self.id
    }

    /// Total input strength of each region (row sums)
    pub fn row_strength(&self) -> RegionVector {
        self.weights.sum_axis(Axis(1))
    }

    /// Self-loops are conventionally absent but not enforced
    pub fn has_zero_diagonal(&self) -> bool {
        self.weights.diag().iter().all(|&w| w == 0.0)
    }

    pub fn is_symmetric(&self) -> bool {
        self.weights == self.weights.t()
    }

    /// Rescale so the largest entry equals `max`
    pub fn normalized(&self, max: f64) -> Result<Self> {
        check_positive("max", max)?;
        let current = self.weights.iter().cloned().fold(0.0_f64, f64::max);
        if current == 0.0 {
            return Ok(self.clone());
        }
        let mut scaled = Self::new(&self.weights * (max / current))?;
        scaled.label = self.label.clone();
        Ok(scaled)
    }
}

fn fingerprint(weights: &Array2<f64>) -> ConnectomeId {
    let header = weights.nrows() as f64;
    ConnectomeId(hash_values(std::iter::once(header).chain(weights.iter().copied()), 0))
}

/// xxh64 of the little-endian bytes of `values`
pub fn hash_values<I: IntoIterator<Item = f64>>(values: I, seed: u64) -> u64 {
    let bytes: Vec<u8> = values.into_iter().flat_map(f64::to_le_bytes).collect();
    xxh64(&bytes, seed)
}

// ============================================================================
// TIME SERIES
// ============================================================================

/// Simulation output indexed `[sample, variable, region]`
///
/// The variable axis holds the model's recorded observables, see
/// [`NeuronalModel::observable_names`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    data: Array3<f64>,
    variables: Vec<String>,
    dt: Time,
}

impl TimeSeries {
    pub fn new(data: Array3<f64>, variables: Vec<String>, dt: Time) -> Result<Self> {
        if data.len_of(Axis(1)) != variables.len() {
            return Err(ConfigurationError::ShapeMismatch {
                what: "time series variables".into(),
                expected: data.len_of(Axis(1)),
                got: variables.len(),
            }
            .into());
        }
        check_positive("dt", dt)?;
        Ok(Self {
            data,
            variables,
            dt,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn n_variables(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    pub fn n_regions(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    pub fn is_empty(&self) -> bool {
        self.n_samples() == 0
    }

    pub fn dt(&self) -> Time {
        self.dt
    }

    /// Covered time (ms)
    pub fn duration(&self) -> Time {
        self.n_samples() as f64 * self.dt
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn into_data(self) -> Array3<f64> {
        self.data
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn variable_index(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v == name)
    }

    /// `[sample, region]` view of one variable
    pub fn variable(&self, index: usize) -> ArrayView2<'_, f64> {
        self.data.index_axis(Axis(1), index)
    }

    pub fn variable_by_name(&self, name: &str) -> Option<ArrayView2<'_, f64>> {
        self.variable_index(name).map(|i| self.variable(i))
    }

    /// Drop the first `n` samples
    pub fn discard_leading(&self, n: usize) -> Self {
        let n = n.min(self.n_samples());
        Self {
            data: self.data.slice(ndarray::s![n.., .., ..]).to_owned(),
            variables: self.variables.clone(),
            dt: self.dt,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Turn NaN/Inf in the data into [`WholeBrainError::NumericalDivergence`]
    pub fn check_finite(&self) -> Result<()> {
        match self
            .data
            .indexed_iter()
            .find(|(_, v)| !v.is_finite())
        {
            None => Ok(()),
            Some(((t, var, region), v)) => Err(WholeBrainError::NumericalDivergence(format!(
                "{} = {} at sample {} (t = {:.3} ms), region {}",
                self.variables.get(var).map(String::as_str).unwrap_or("?"),
                v,
                t,
                t as f64 * self.dt,
                region
            ))),
        }
    }

    /// Per-region mean over time of one variable
    pub fn time_mean(&self, index: usize) -> RegionVector {
        let v = self.variable(index);
        if v.nrows() == 0 {
            return Array1::from_elem(v.ncols(), f64::NAN);
        }
        v.mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::from_elem(v.ncols(), f64::NAN))
    }
}

// ============================================================================
// REDUCTIONS
// ============================================================================

/// Scalar summary of a `[sample, region]` rate matrix
///
/// Published analyses disagree on which statistic to plot, so all of them
/// are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// Largest time-averaged regional rate
    #[default]
    MaxOfMean,
    /// Regional average of each region's peak rate
    MeanOfMax,
    /// Peak over time of the population (across-region) mean rate
    PeakPopulationMean,
}

impl Reduction {
    /// Apply to a `[sample, region]` view. NaN anywhere yields NaN.
    pub fn apply(&self, rates: ArrayView2<'_, f64>) -> f64 {
        if rates.is_empty() {
            return f64::NAN;
        }
        match self {
            Reduction::MaxOfMean => nan_max(rates.sum_axis(Axis(0)) / rates.nrows() as f64),
            Reduction::MeanOfMax => {
                let peaks = rates.map_axis(Axis(0), |col| nan_max(col.to_owned()));
                peaks.sum() / peaks.len() as f64
            }
            Reduction::PeakPopulationMean => {
                nan_max(rates.sum_axis(Axis(1)) / rates.ncols() as f64)
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Reduction::MaxOfMean => "max_of_mean",
            Reduction::MeanOfMax => "mean_of_max",
            Reduction::PeakPopulationMean => "peak_population_mean",
        }
    }
}

fn nan_max(values: Array1<f64>) -> f64 {
    values.iter().fold(f64::NEG_INFINITY, |acc, &x| {
        if acc.is_nan() || x.is_nan() {
            f64::NAN
        } else {
            acc.max(x)
        }
    })
}

// ============================================================================
// MODEL TRAITS
// ============================================================================

/// Long-range input of every region, bound to one connectome
pub trait CouplingOperator: Send + Sync {
    fn n_regions(&self) -> usize;

    /// Connectome this operator was built from
    fn connectome_id(&self) -> ConnectomeId;

    /// Input received by each region given the coupled state of all regions
    fn couple(&self, coupled_state: ndarray::ArrayView1<'_, f64>) -> RegionVector;
}

/// Neural mass model (all regions at once)
pub trait NeuronalModel: Send + Sync {
    fn name(&self) -> &'static str;

    fn n_regions(&self) -> usize;

    /// Names of the state rows, e.g. `["S_e", "S_i"]`
    fn state_names(&self) -> &'static [&'static str];

    /// Names of the recorded observables, e.g. `["I_e", "r_e"]`
    fn observable_names(&self) -> &'static [&'static str];

    /// State row fed to the coupling operator
    fn coupled_state(&self) -> usize {
        0
    }

    /// Observable row holding the excitatory firing rate (Hz)
    fn rate_observable(&self) -> usize;

    fn initial_state(&self) -> NetworkState;

    /// Derivative of every state variable and the recorded observables.
    ///
    /// `dstate` has the shape of `state`; `observed` has one row per
    /// observable. Both are overwritten.
    fn drift(
        &self,
        state: &NetworkState,
        long_range: &RegionVector,
        dstate: &mut NetworkState,
        observed: &mut Array2<f64>,
    );

    /// Instantaneous excitatory firing rate (Hz) of every region
    fn firing_rate(&self, state: &NetworkState, long_range: &RegionVector) -> RegionVector {
        let mut dstate = Array2::zeros(state.raw_dim());
        let mut observed = Array2::zeros((self.observable_names().len(), self.n_regions()));
        self.drift(state, long_range, &mut dstate, &mut observed);
        observed.row(self.rate_observable()).to_owned()
    }
}

/// Models scaled by a global coupling G
pub trait GlobalCoupling: NeuronalModel + Sized {
    fn global_coupling(&self) -> f64;

    /// Same model with a new G (fresh, validated parameter snapshot)
    fn with_global_coupling(&self, g: f64) -> Result<Self>;
}

/// Models with a per-region local inhibitory weight J
pub trait InhibitoryWeights: NeuronalModel + Sized {
    fn inhibitory_weights(&self) -> &RegionVector;

    /// Same model with a new J (fresh, validated parameter snapshot)
    fn with_inhibitory_weights(&self, j: RegionVector) -> Result<Self>;

    /// Hash of every parameter a balanced J depends on, except G and J
    fn template_fingerprint(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    #[test]
    fn test_connectome_validation() {
        assert!(Connectome::from_rows(&[vec![0.0, 1.0], vec![1.0, 0.0]]).is_ok());
        assert!(Connectome::from_rows(&[vec![0.0, 1.0]]).is_err());
        assert!(Connectome::from_rows(&[vec![0.0, -1.0], vec![1.0, 0.0]]).is_err());
        assert!(Connectome::from_rows(&[vec![0.0, f64::NAN], vec![1.0, 0.0]]).is_err());
        assert!(Connectome::new(Array2::zeros((0, 0))).is_err());
    }

    #[test]
    fn test_connectome_identity() {
        let a = Connectome::from_rows(&[vec![0.0, 1.0], vec![1.0, 0.0]]).unwrap();
        let b = Connectome::from_rows(&[vec![0.0, 1.0], vec![1.0, 0.0]]).unwrap();
        let c = Connectome::from_rows(&[vec![0.0, 1.0], vec![0.5, 0.0]]).unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().to_string().len(), 16);
        assert!(a.has_zero_diagonal());
        assert!(a.is_symmetric());
        assert!(!c.is_symmetric());
    }

    #[test]
    fn test_hash_values() {
        assert_eq!(hash_values([1.0, 2.0], 7), hash_values(vec![1.0, 2.0], 7));
        assert_ne!(hash_values([1.0, 2.0], 7), hash_values([2.0, 1.0], 7));
        assert_ne!(hash_values([1.0, 2.0], 7), hash_values([1.0, 2.0], 8));
    }

    #[test]
    fn test_row_strength_and_normalize() {
        let c = Connectome::from_rows(&[vec![0.0, 2.0, 1.0], vec![1.0, 0.0, 0.0], vec![4.0, 0.0, 0.0]])
            .unwrap()
            .with_label("toy");
        assert_eq!(c.row_strength(), array![3.0, 1.0, 4.0]);
        let n = c.normalized(0.2).unwrap();
        assert!((n.weights()[[2, 0]] - 0.2).abs() < 1e-12);
        assert_eq!(n.label(), Some("toy"));
    }

    #[test]
    fn test_region_vector_checks() {
        assert!(check_region_vector("J", &array![1.0, 1.0], 2).is_ok());
        assert!(matches!(
            check_region_vector("J", &array![1.0], 2),
            Err(ConfigurationError::ShapeMismatch { expected: 2, got: 1, .. })
        ));
        assert!(matches!(
            check_region_vector("J", &Array1::zeros(0), 2),
            Err(ConfigurationError::MissingParameter(_))
        ));
    }

    fn series(rates: Array2<f64>) -> TimeSeries {
        let (t, n) = rates.dim();
        let mut data = Array3::zeros((t, 2, n));
        data.index_axis_mut(Axis(1), 1).assign(&rates);
        TimeSeries::new(data, vec!["I_e".into(), "r_e".into()], 0.1).unwrap()
    }

    #[test]
    fn test_reductions() {
        // region 0 steady at 2 Hz, region 1 spikes once to 10 Hz
        let rates = array![[2.0, 1.0], [2.0, 10.0], [2.0, 1.0], [2.0, 0.0]];
        let ts = series(rates);
        let v = ts.variable(1);
        assert!((Reduction::MaxOfMean.apply(v) - 3.0).abs() < 1e-12);
        assert!((Reduction::MeanOfMax.apply(v) - 6.0).abs() < 1e-12);
        assert!((Reduction::PeakPopulationMean.apply(v) - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_reduction_propagates_nan() {
        let ts = series(array![[1.0, f64::NAN], [1.0, 1.0]]);
        assert!(Reduction::MaxOfMean.apply(ts.variable(1)).is_nan());
        assert!(Reduction::MeanOfMax.apply(ts.variable(1)).is_nan());
        assert!(!ts.is_finite());
        assert!(matches!(
            ts.check_finite(),
            Err(WholeBrainError::NumericalDivergence(_))
        ));
    }

    #[test]
    fn test_time_series_shape() {
        let ts = series(Array2::from_elem((5, 3), 1.5));
        assert_eq!(ts.n_samples(), 5);
        assert_eq!(ts.n_variables(), 2);
        assert_eq!(ts.n_regions(), 3);
        assert!((ts.duration() - 0.5).abs() < 1e-12);
        assert_eq!(ts.variable_index("r_e"), Some(1));
        assert_eq!(ts.discard_leading(2).n_samples(), 3);
        assert_eq!(ts.time_mean(1), array![1.5, 1.5, 1.5]);
        assert!(TimeSeries::new(Array3::zeros((1, 2, 1)), vec!["x".into()], 0.1).is_err());
    }

    #[test]
    fn test_reduction_serde() {
        let r: Reduction = serde_json::from_str("\"mean_of_max\"").unwrap();
        assert_eq!(r, Reduction::MeanOfMax);
        assert_eq!(Reduction::default(), Reduction::MaxOfMean);
    }
}
