//! End-to-end sweeps on a two-region network

use std::sync::atomic::{AtomicUsize, Ordering};
use wholebrain_core::Connectome;
use wholebrain_dmf::NaskarParams;
use wholebrain_fic::{BurstConfig, FicMechanism, Herzog2022, JsonDirStore, ProportionalFic};
use wholebrain_integrator::{IntegrationSettings, Scheme};
use wholebrain_sweep::{run_sweep, run_sweep_with, GRange, ModelConfig, SweepConfig};

fn pair() -> Connectome {
    Connectome::from_rows(&[vec![0.0, 1.0], vec![1.0, 0.0]]).unwrap()
}

/// Deterministic runs over G in {0, 1, 2}, connectome scaled to a 0.2 maximum
fn base() -> SweepConfig {
    SweepConfig {
        integration: IntegrationSettings {
            dt: 0.1,
            t_max: 2000.0,
            t_warm_up: 2000.0,
        },
        scheme: Scheme::Euler,
        g_range: GRange::new(0.0, 2.5, 1.0),
        normalize: Some(0.2),
        ..SweepConfig::default()
    }
}

fn quick_fic() -> FicMechanism {
    FicMechanism::Proportional(ProportionalFic {
        burst: BurstConfig {
            dt: 0.5,
            t_warm_up: 1000.0,
            t_measure: 1000.0,
            sigma: 0.001,
        },
        max_iterations: 100,
        ..ProportionalFic::default()
    })
}

#[test]
fn test_peak_rate_grows_with_coupling() {
    let result = run_sweep(&base(), &pair()).unwrap();
    let values: Vec<f64> = result.values().into_iter().map(|v| v.unwrap()).collect();
    assert_eq!(values.len(), 3);
    assert!((values[0] - 3.0).abs() < 0.5, "G = 0 rate {}", values[0]);
    assert!(values.windows(2).all(|w| w[1] >= w[0]), "{:?}", values);
    assert!(values[2] > values[0] + 1.0);
}

#[test]
fn test_fic_flattens_the_curve() {
    let plain = run_sweep(&base(), &pair()).unwrap();
    let config = SweepConfig {
        label: "FIC".into(),
        fic: Some(quick_fic()),
        ..base()
    };
    let fic = run_sweep(&config, &pair()).unwrap();

    for p in &fic.points {
        let value = p.value.unwrap();
        assert!((value - 3.0).abs() < 1.0, "G = {}: {}", p.g, value);
        assert_eq!(p.fic_converged, Some(true));
    }
    assert!(fic.spread().unwrap() < plain.spread().unwrap());
}

#[test]
fn test_naskar_without_plasticity_matches_dmf_at_zero_coupling() {
    let zero = SweepConfig {
        g_range: GRange::new(0.0, 0.5, 1.0),
        ..base()
    };
    let naskar = SweepConfig {
        label: "MDMF".into(),
        model: ModelConfig::Naskar(NaskarParams {
            eta: 0.0,
            ..NaskarParams::default()
        }),
        ..zero.clone()
    };
    let a = run_sweep(&zero, &pair()).unwrap();
    let b = run_sweep(&naskar, &pair()).unwrap();
    assert_eq!(a.values(), b.values());
    assert_eq!(b.model, "naskar");
}

#[test]
fn test_fic_store_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let config = SweepConfig {
        fic: Some(FicMechanism::Herzog2022(Herzog2022::default())),
        integration: IntegrationSettings {
            dt: 0.5,
            t_max: 200.0,
            t_warm_up: 0.0,
        },
        ..base()
    };

    let seen = AtomicUsize::new(0);
    let on_point = |_: &wholebrain_sweep::SweepPoint| {
        seen.fetch_add(1, Ordering::Relaxed);
    };
    let store = JsonDirStore::new(dir.path()).unwrap();
    let first = run_sweep_with(&config, &pair(), store.clone(), &on_point).unwrap();
    let second = run_sweep_with(&config, &pair(), store, &on_point).unwrap();

    assert_eq!(first, second);
    assert_eq!(seen.load(Ordering::Relaxed), 6);
    let files = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(files, 3);
}
