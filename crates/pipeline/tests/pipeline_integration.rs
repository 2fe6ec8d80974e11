//! Full-pipeline integration: selection gates, stage interplay,
//! emission, and statistics bookkeeping.

use std::sync::{Arc, Mutex};

use nalgebra::Vector3;

use recon_core::{
    DetectorType, Geometry, PhysicalEvent, PhysicalEventKind, RawEvent, RejectionReason, Rese,
    SinkError, UniformGeometry,
};
use recon_pipeline::config::{
    ClusteringAlgorithm, CoincidenceAlgorithm, ReconstructionConfig, TrackingAlgorithm,
};
use recon_pipeline::sink::EventSink;
use recon_pipeline::source::VecSource;
use recon_pipeline::{AnalysisStatus, RawEventAnalyzer, RunStatistics};

fn geometry() -> Arc<dyn Geometry> {
    Arc::new(UniformGeometry::default())
}

fn analyzer(config: ReconstructionConfig) -> RawEventAnalyzer {
    let mut a = RawEventAnalyzer::new(config, geometry());
    a.pre_analysis().unwrap();
    a
}

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

/// Geometrically consistent three-site Compton chain (512 keV total).
fn compton_chain(event_id: u64) -> RawEvent {
    let (e2, e3) = (150.0, 162.0);
    let cos_phi: f64 = 1.0 - 511.044 / e3 + 511.044 / (e2 + e3);
    let theta = cos_phi.clamp(-1.0, 1.0).acos();
    let scatter = Vector3::new(theta.sin(), 0.0, -theta.cos());
    let second = Vector3::new(0.0, 0.0, 2.0);
    let third = second + scatter * 2.0;
    RawEvent::with_reses(
        event_id,
        event_id as f64,
        vec![
            hit(1, 0.0, 4.0, 200.0),
            hit(2, second.x, second.z, e2),
            hit(3, third.x, third.z, e3),
        ],
    )
}

fn photo_event(event_id: u64) -> RawEvent {
    RawEvent::with_reses(event_id, event_id as f64, vec![hit(1, 0.0, -2.0, 662.0)])
}

/// Sink with a shared handle, so tests can inspect what was emitted
/// after the analyzer takes ownership.
#[derive(Clone, Default)]
struct SharedSink {
    events: Arc<Mutex<Vec<PhysicalEvent>>>,
    footer: Arc<Mutex<Option<String>>>,
}

impl EventSink for SharedSink {
    fn emit(&mut self, event: PhysicalEvent) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    fn footer(&mut self, text: &str) -> Result<(), SinkError> {
        *self.footer.lock().unwrap() = Some(text.to_string());
        Ok(())
    }
}

fn base_config() -> ReconstructionConfig {
    let mut config = ReconstructionConfig::default();
    // Keep the spatially tight test chains unclustered.
    config.clustering.algorithm = ClusteringAlgorithm::None;
    config
}

#[test]
fn test_compton_chain_end_to_end() {
    let sink = SharedSink::default();
    let mut a = analyzer(base_config());
    a.set_sink(Box::new(sink.clone()));

    a.add_raw_event(compton_chain(1));
    assert_eq!(a.analyze_event().unwrap(), AnalysisStatus::Ok);

    assert_eq!(a.statistics().compton, 1);
    assert_eq!(a.statistics().good, 1);
    assert_eq!(a.statistics().passed_selection, 1);

    let events = sink.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    match &events[0].kind {
        PhysicalEventKind::Compton {
            sites,
            scatter_angles,
            quality,
            ..
        } => {
            assert_eq!(sites.len(), 3);
            assert_eq!(scatter_angles.len(), 1);
            assert!(*quality < 1.0);
        }
        other => panic!("expected a Compton event, got {other:?}"),
    }
}

#[test]
fn test_energy_window_short_circuits_csr() {
    let mut config = base_config();
    config.selection.total_energy_min = 100.0;
    config.selection.total_energy_max = 2000.0;
    let mut a = analyzer(config);

    a.add_raw_event(RawEvent::with_reses(
        1,
        0.0,
        vec![hit(1, 0.0, -2.0, 50.0)],
    ));
    a.analyze_event().unwrap();

    assert_eq!(
        a.statistics().rejections[&RejectionReason::TotalEnergyOutOfLimits],
        1
    );
    // CSR never ran for this event.
    assert_eq!(a.csr_engine().unwrap().permutations_evaluated(), 0);
    assert!(!a.hypotheses().has_optimum());
}

#[test]
fn test_lever_arm_window() {
    let mut config = base_config();
    config.selection.lever_arm_min = 0.5;
    let mut a = analyzer(config);

    // Two sites 0.3 cm apart; CSR would order them fine, but the
    // lever-arm filter runs first.
    a.add_raw_event(RawEvent::with_reses(
        1,
        0.0,
        vec![hit(1, 0.0, 0.1, 200.0), hit(2, 0.0, -0.2, 312.0)],
    ));
    a.analyze_event().unwrap();

    assert_eq!(
        a.statistics().rejections[&RejectionReason::LeverArmOutOfLimits],
        1
    );
    assert!(!a.hypotheses().has_optimum());
}

#[test]
fn test_first_rejection_survives_later_stages() {
    let mut config = base_config();
    config.selection.lever_arm_min = 0.5;
    let mut a = analyzer(config);

    a.add_raw_event(RawEvent::with_reses(
        1,
        0.0,
        vec![hit(1, 0.0, 0.1, 200.0), hit(2, 0.0, -0.2, 312.0)],
    ));
    a.analyze_event().unwrap();

    // The reason stays the lever arm, not anything CSR might have said.
    let best_try = a
        .hypotheses()
        .best_try()
        .or_else(|| a.hypotheses().get(0))
        .unwrap();
    assert_eq!(best_try.rejection(), RejectionReason::LeverArmOutOfLimits);
}

#[test]
fn test_optimum_equals_best_try_when_set() {
    let mut a = analyzer(base_config());
    a.add_raw_event(compton_chain(1));
    a.analyze_event().unwrap();

    let group = a.hypotheses();
    assert!(group.has_optimum());
    let optimum = group.optimum().unwrap();
    let best_try = group.best_try().unwrap();
    assert_eq!(optimum.event_id, best_try.event_id);
    assert_eq!(optimum.quality, best_try.quality);
}

#[test]
fn test_statistics_merge_matches_single_run() {
    let batch_a = vec![compton_chain(1), photo_event(2)];
    let batch_b = vec![compton_chain(3), {
        let mut bad = photo_event(4);
        bad.external_bad = true;
        bad
    }];

    // One run over the union.
    let mut combined = analyzer(base_config());
    for event in batch_a.iter().chain(batch_b.iter()).cloned() {
        combined.add_raw_event(event);
    }
    combined.analyze_all().unwrap();

    // Two shards, merged.
    let mut shard_a = analyzer(base_config());
    for event in batch_a {
        shard_a.add_raw_event(event);
    }
    shard_a.analyze_all().unwrap();

    let mut shard_b = analyzer(base_config());
    for event in batch_b {
        shard_b.add_raw_event(event);
    }
    shard_b.analyze_all().unwrap();

    let mut merged = RunStatistics::new();
    merged.merge(shard_a.statistics());
    merged.merge(shard_b.statistics());

    assert_eq!(&merged, combined.statistics());
    assert_eq!(merged.events, 4);
    assert_eq!(merged.compton, 2);
    assert_eq!(merged.photo, 1);
    assert_eq!(merged.rejections[&RejectionReason::ExternalBadFlag], 1);
}

#[test]
fn test_coincidence_window_buffers_until_gap() {
    let mut config = base_config();
    config.coincidence.algorithm = CoincidenceAlgorithm::Window;
    config.coincidence.window_s = 1e-6;
    let mut a = analyzer(config);

    // Two hit lists inside one window, then one far outside. Distinct
    // positions, so the same-voxel merge leaves both deposits alone.
    let first = RawEvent::with_reses(1, 0.0, vec![hit(1, 0.0, -2.0, 300.0)]);
    let second = RawEvent::with_reses(2, 5e-7, vec![hit(2, 3.0, -2.0, 400.0)]);
    let third = RawEvent::with_reses(3, 1.0, vec![hit(3, 0.0, -2.0, 662.0)]);

    a.set_source(Box::new(VecSource::new(vec![first, second, third])));

    // The window stays open while input keeps arriving.
    assert_eq!(a.analyze_event().unwrap(), AnalysisStatus::CoincidenceWait);
    assert_eq!(a.analyze_event().unwrap(), AnalysisStatus::CoincidenceWait);
    // The third list closes the window; lists one and two merge.
    assert_eq!(a.analyze_event().unwrap(), AnalysisStatus::Ok);
    assert_eq!(a.initial_event().unwrap().len(), 2);
    // Source exhausted: the last buffered list flushes out.
    assert_eq!(a.analyze_event().unwrap(), AnalysisStatus::Ok);
    assert_eq!(a.analyze_event().unwrap(), AnalysisStatus::NoEventsLeft);
}

#[test]
fn test_tracker_pair_event_bypasses_csr() {
    let mut config = base_config();
    config.tracking.algorithm = TrackingAlgorithm::Directional;
    let mut a = analyzer(config);

    // Inverted-V pair signature in the tracker stack.
    a.add_raw_event(RawEvent::with_reses(
        1,
        0.0,
        vec![
            hit(1, 0.0, 5.5, 800.0),
            hit(2, -0.4, 4.5, 300.0),
            hit(3, 0.4, 4.5, 350.0),
            hit(4, -0.8, 3.5, 200.0),
            hit(5, 0.8, 3.5, 220.0),
        ],
    ));
    a.analyze_event().unwrap();

    assert_eq!(a.statistics().pair, 1);
    // CSR was skipped: the tracker already produced the optimum.
    assert_eq!(a.csr_engine().unwrap().permutations_evaluated(), 0);
}

#[test]
fn test_decay_tagging_annotates_compton_event() {
    let mut config = base_config();
    config.decay.algorithm = recon_pipeline::config::DecayAlgorithm::Standard;
    // 150 + 162 = 312 keV: pretend that is a known line.
    config.decay.lines = vec![(312.0, 3.0)];
    let sink = SharedSink::default();
    let mut a = analyzer(config);
    a.set_sink(Box::new(sink.clone()));

    a.add_raw_event(compton_chain(1));
    a.analyze_event().unwrap();

    assert_eq!(a.statistics().decay, 1);
    assert_eq!(a.statistics().compton, 1);
    let events = sink.events.lock().unwrap();
    match &events[0].kind {
        PhysicalEventKind::Compton { decay, .. } => assert!(decay),
        other => panic!("expected Compton, got {other:?}"),
    }
}

#[test]
fn test_diagnostic_emission_of_rejected_events() {
    let mut config = base_config();
    config.selection.total_energy_min = 1000.0;
    config.selection.emit_diagnostics = true;
    let sink = SharedSink::default();
    let mut a = analyzer(config);
    a.set_sink(Box::new(sink.clone()));

    a.add_raw_event(photo_event(1)); // 662 keV, below the window
    a.analyze_event().unwrap();

    // Emitted for diagnostics, never counted as successful.
    assert_eq!(a.statistics().good, 0);
    assert_eq!(a.statistics().unidentifiable, 1);
    let events = sink.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    match &events[0].kind {
        PhysicalEventKind::Unidentifiable { rejection } => {
            assert_eq!(*rejection, RejectionReason::TotalEnergyOutOfLimits)
        }
        other => panic!("expected Unidentifiable, got {other:?}"),
    }
}

#[test]
fn test_footer_carries_provenance_and_statistics() {
    let sink = SharedSink::default();
    let mut a = analyzer(base_config());
    a.set_sink(Box::new(sink.clone()));

    a.add_raw_event(compton_chain(1));
    a.analyze_all().unwrap();
    let footer = a.post_analysis().unwrap();

    assert!(footer.contains("CSR options"));
    assert!(footer.contains("Number of events"));
    assert_eq!(sink.footer.lock().unwrap().as_deref(), Some(footer.as_str()));
}

#[test]
fn test_worker_shards_emit_independently() {
    // Two workers over disjoint shards, one shared output collection.
    // The emission order across workers is not guaranteed; the totals
    // are.
    let sink = SharedSink::default();

    for shard in [vec![compton_chain(1)], vec![photo_event(2)]] {
        let mut worker = analyzer(base_config());
        worker.set_sink(Box::new(sink.clone()));
        for event in shard {
            worker.add_raw_event(event);
        }
        worker.analyze_all().unwrap();
    }

    let events = sink.events.lock().unwrap();
    assert_eq!(events.len(), 2);
}
