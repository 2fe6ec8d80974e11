//! End-to-end reconstruction of a handful of synthetic events.
//!
//! Run with `cargo run --example reconstruct`.

use std::sync::Arc;

use nalgebra::Vector3;

use recon_core::{DetectorType, RawEvent, Rese, UniformGeometry};
use recon_pipeline::config::ReconstructionConfig;
use recon_pipeline::{JsonlSink, RawEventAnalyzer};

fn hit(id: u32, x: f64, z: f64, energy: f64) -> Rese {
    let det = if z >= 0.0 {
        DetectorType::Tracker2d
    } else {
        DetectorType::Calorimeter
    };
    let mut r = Rese::hit(id, Vector3::new(x, 0.0, z), energy, det);
    r.position_resolution = Vector3::new(0.05, 0.05, 0.05);
    r.energy_resolution = 2.0;
    r
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut config = ReconstructionConfig::default();
    config.selection.total_energy_min = 50.0;
    config.selection.total_energy_max = 5000.0;

    let mut analyzer = RawEventAnalyzer::new(config, Arc::new(UniformGeometry::default()));
    analyzer.set_sink(Box::new(JsonlSink::new(std::io::stdout())));
    analyzer.pre_analysis().expect("configuration is valid");

    // A single-site absorption.
    analyzer.add_raw_event(RawEvent::with_reses(
        1,
        0.0,
        vec![hit(1, 0.0, -2.0, 662.0)],
    ));

    // A three-site Compton chain: the middle vertex scatters at the
    // angle its energy split implies.
    let (e2, e3) = (150.0, 162.0);
    let cos_phi: f64 = 1.0 - 511.044 / e3 + 511.044 / (e2 + e3);
    let theta = cos_phi.clamp(-1.0, 1.0).acos();
    let third = Vector3::new(theta.sin() * 2.0, 0.0, 2.0 - theta.cos() * 2.0);
    analyzer.add_raw_event(RawEvent::with_reses(
        2,
        1.0,
        vec![
            hit(1, 0.0, 4.0, 200.0),
            hit(2, 0.0, 2.0, e2),
            hit(3, third.x, third.z, e3),
        ],
    ));

    // An event below the energy window, kept for the statistics.
    analyzer.add_raw_event(RawEvent::with_reses(
        3,
        2.0,
        vec![hit(1, 0.0, -1.0, 20.0)],
    ));

    let processed = analyzer.analyze_all().expect("pipeline runs");
    let footer = analyzer.post_analysis().expect("footer renders");

    eprintln!("processed {processed} events");
    eprint!("{footer}");
}
