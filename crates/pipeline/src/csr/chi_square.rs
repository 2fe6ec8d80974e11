//! Chi-square figure-of-merit: compare the Compton scatter angle
//! implied by the energy deposits against the angle implied by the hit
//! geometry, vertex by vertex.

use std::sync::Arc;

use tracing::debug;

use recon_core::kinematics::{
    cos_phi_from_energies, klein_nishina_normalized_by_area, kinematics_ok, phi_from_energies,
    ELECTRON_MASS_KEV,
};
use recon_core::{EventType, Geometry, RawEvent, RejectionReason, Rese};

use crate::config::{CsrConfig, TestStatistic, UndecidedHandling};
use crate::csr::{compute_position_error, SequenceScorer};

/// An energy-computed cos(phi) may exceed the physical range by this
/// many sigmas before the ordering counts as inadmissible.
const COS_LIMIT_SIGMA: f64 = 100.5;

pub struct ChiSquareScorer {
    test_statistic: TestStatistic,
    #[allow(dead_code)]
    geometry: Arc<dyn Geometry>,
}

impl ChiSquareScorer {
    pub fn new(test_statistic: TestStatistic, geometry: Arc<dyn Geometry>) -> Self {
        ChiSquareScorer {
            test_statistic,
            geometry,
        }
    }

    /// Dedicated two-site treatment: decide which of the two deposits
    /// came first, or reject the event as undecidable.
    pub fn sequence_dual_hit(&self, event: &mut RawEvent, config: &CsrConfig, geometry: &dyn Geometry) {
        debug_assert_eq!(event.len(), 2);
        debug!(event = event.event_id, "csr-cs: dual hit analysis");

        if config.reject_one_detector_type_only
            && event.reses()[0].detector == event.reses()[1].detector
        {
            event.reject(RejectionReason::OneDetectorTypeOnly);
            return;
        }

        if event.reses()[0].is_track() && event.reses()[1].is_track() {
            event.reject(RejectionReason::TwoTracksOnly);
            return;
        }

        // Initial estimate for the first interaction: the deposit in a
        // first-module detector, or the electron track if only one is.
        let first_module = [
            event.reses()[0].detector.is_first_module(),
            event.reses()[1].detector.is_first_module(),
        ];
        let is_track = [event.reses()[0].is_track(), event.reses()[1].is_track()];
        let estimated_first: Option<usize> = match (first_module, is_track) {
            ([true, false], _) => Some(0),
            ([false, true], _) => Some(1),
            (_, [true, false]) => Some(0),
            (_, [false, true]) => Some(1),
            _ => None,
        };

        let has_track = estimated_first.map(|i| is_track[i]).unwrap_or(false);
        if !has_track && !config.use_comptel_type_events {
            event.reject(RejectionReason::ComptelType);
            return;
        }

        let e = [event.reses()[0].energy, event.reses()[1].energy];
        let p = [event.reses()[0].position, event.reses()[1].position];
        let total = e[0] + e[1];

        let both_in_first = first_module[0] && first_module[1];
        let mut chosen: Option<usize> = None;
        let mut qualities: Option<(f64, f64)> = None;

        if !config.start_in_first_module || both_in_first {
            let forward_ok = kinematics_ok(e[0], e[1]);
            let backward_ok = kinematics_ok(e[1], e[0]);

            match (forward_ok, backward_ok) {
                (true, false) => chosen = Some(0),
                (false, true) => chosen = Some(1),
                (false, false) => {
                    debug!(event = event.event_id, "csr-cs: dual hit kinematics bad");
                    event.reject(RejectionReason::ComptelKinematicsBad);
                    return;
                }
                (true, true) => {
                    if has_track {
                        // The electron track direction settles it: a
                        // backward-pointing recoil is unphysical.
                        let first = estimated_first.unwrap_or(0);
                        let second = 1 - first;
                        let track_dir = event.reses()[first]
                            .direction()
                            .unwrap_or_else(|| nalgebra::Vector3::new(0.0, 0.0, -1.0));
                        let theta = track_dir.angle(&(p[second] - p[first]));
                        let phi1 = phi_from_energies(e[first], e[second]);
                        if theta > std::f64::consts::FRAC_PI_2 + phi1 {
                            event.reject(RejectionReason::TrackNotValid);
                            return;
                        }
                        chosen = Some(first);
                    } else {
                        match config.undecided_handling {
                            UndecidedHandling::Ignore => {
                                event.reject(RejectionReason::StartUndecided);
                                return;
                            }
                            UndecidedHandling::AssumeFirstModule => {
                                chosen = Some(estimated_first.unwrap_or(0));
                            }
                            UndecidedHandling::LargerKleinNishina => {
                                let kn0 = klein_nishina_normalized_by_area(
                                    total,
                                    phi_from_energies(e[0], e[1]),
                                );
                                let kn1 = klein_nishina_normalized_by_area(
                                    total,
                                    phi_from_energies(e[1], e[0]),
                                );
                                let (first, a, b) =
                                    if kn0 > kn1 { (0, kn0, kn1) } else { (1, kn1, kn0) };
                                chosen = Some(first);
                                if a + b > 0.0 {
                                    qualities = Some((a / (a + b), b / (a + b)));
                                }
                            }
                            UndecidedHandling::LargerKleinNishinaTimesPhoto => {
                                let kn0 = klein_nishina_normalized_by_area(
                                    total,
                                    phi_from_energies(e[0], e[1]),
                                ) * geometry.photo_absorption_probability(&p[0], &p[1], e[1]);
                                let kn1 = klein_nishina_normalized_by_area(
                                    total,
                                    phi_from_energies(e[1], e[0]),
                                ) * geometry.photo_absorption_probability(&p[1], &p[0], e[0]);
                                let (first, a, b) =
                                    if kn0 > kn1 { (0, kn0, kn1) } else { (1, kn1, kn0) };
                                chosen = Some(first);
                                if a + b > 0.0 {
                                    qualities = Some((a / (a + b), b / (a + b)));
                                }
                            }
                            UndecidedHandling::LargerEnergyDeposit => {
                                let first = if e[0] > e[1] { 0 } else { 1 };
                                chosen = Some(first);
                                qualities =
                                    Some((e[first] / total, e[1 - first] / total));
                            }
                        }
                    }
                }
            }
        } else {
            // Start in the first module is required and only one (or no)
            // deposit can satisfy it.
            let Some(first) = estimated_first else {
                event.reject(RejectionReason::StartNotInFirstModule);
                return;
            };
            let second = 1 - first;
            if !kinematics_ok(e[first], e[second]) {
                event.reject(RejectionReason::StartNotInFirstModule);
                return;
            }
            chosen = Some(first);
        }

        let Some(first) = chosen else {
            event.reject(RejectionReason::StartUndecided);
            return;
        };

        if config.start_in_first_module && !event.reses()[first].detector.is_first_module() {
            event.reject(RejectionReason::StartNotInFirstModule);
            return;
        }

        if has_track && !event.test_electron_direction(e[first], e[1 - first]) {
            event.reject(RejectionReason::TrackNotValid);
            return;
        }

        if first == 1 {
            event.reorder(&[1, 0]);
        }
        event.start_index = Some(0);
        let (q1, q2) = qualities.unwrap_or((0.0, 1.0));
        event.quality = Some(q1);
        event.second_quality = Some(q2);
        event.event_type = EventType::Compton;
        event.set_good(true);
        event.reconstructed = true;
        debug!(event = event.event_id, "csr-cs: good dual-hit Compton");
    }
}

impl SequenceScorer for ChiSquareScorer {
    fn score(&self, sequence: &[&Rese]) -> Option<f64> {
        if sequence.len() < 3 {
            return None;
        }

        let mut ts = 0.0;
        let mut n_terms = 0u32;

        for i in 1..sequence.len() - 1 {
            let ee = sequence[i].energy;
            let dee = sequence[i].energy_resolution;

            let mut eg = 0.0;
            let mut deg2 = 0.0;
            for r in &sequence[i + 1..] {
                eg += r.energy;
                deg2 += r.energy_resolution * r.energy_resolution;
            }
            let ei = ee + eg;

            if eg <= 0.0 || ei <= 0.0 {
                return None;
            }

            let e0 = ELECTRON_MASS_KEV;
            let cos_phi_e = cos_phi_from_energies(ee, eg);
            let d_cos_phi_e2 = e0 * e0 / (ei * ei * ei * ei) * dee * dee
                + (e0 / (eg * eg) - e0 / ((ee + eg) * (ee + eg))).powi(2) * deg2;

            // Mild out-of-range values are measurement noise; far ones
            // rule the ordering out.
            if cos_phi_e < -1.0 && cos_phi_e < -1.0 - COS_LIMIT_SIGMA * d_cos_phi_e2.sqrt() {
                return None;
            }
            if cos_phi_e > 1.0 && cos_phi_e > 1.0 + COS_LIMIT_SIGMA * d_cos_phi_e2.sqrt() {
                return None;
            }

            let incoming = sequence[i].position - sequence[i - 1].position;
            let outgoing = sequence[i + 1].position - sequence[i].position;
            let cos_phi_g = incoming.angle(&outgoing).cos();

            let d_cos_phi_g2 =
                compute_position_error(sequence[i - 1], sequence[i], sequence[i + 1]).powi(2);

            if d_cos_phi_g2 <= 0.0 || d_cos_phi_e2 <= 0.0 {
                return None;
            }

            let deviation = (cos_phi_e - cos_phi_g) * (cos_phi_e - cos_phi_g);
            match self.test_statistic {
                TestStatistic::Simple => ts += deviation,
                TestStatistic::SimpleWithErrors | TestStatistic::ChiSquare => {
                    ts += deviation / (d_cos_phi_e2 + d_cos_phi_g2)
                }
            }
            n_terms += 1;
        }

        if n_terms == 0 {
            return None;
        }
        ts /= n_terms as f64;

        if self.test_statistic == TestStatistic::ChiSquare && ts <= 0.0 {
            return None;
        }

        Some(ts)
    }

    fn describe(&self) -> String {
        format!("# Test statistics: {:?}\n", self.test_statistic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use recon_core::{DetectorType, UniformGeometry};

    fn geometry() -> Arc<dyn Geometry> {
        Arc::new(UniformGeometry::default())
    }

    fn hit(id: u32, x: f64, z: f64, energy: f64, det: DetectorType) -> Rese {
        let mut r = Rese::hit(id, Vector3::new(x, 0.0, z), energy, det);
        r.position_resolution = Vector3::new(0.05, 0.05, 0.05);
        r.energy_resolution = 2.0;
        r
    }

    /// A forward-scatter chain whose geometry matches its energy split:
    /// an even split at the middle vertex means a 90-degree scatter, and
    /// the third hit sits exactly on that cone.
    fn consistent_chain() -> Vec<Rese> {
        let e_mid = ELECTRON_MASS_KEV / 2.0;
        vec![
            hit(1, 0.0, 4.0, 150.0, DetectorType::Tracker2d),
            hit(2, 0.0, 2.0, e_mid, DetectorType::Tracker2d),
            hit(3, 2.0, 2.0, e_mid, DetectorType::Calorimeter),
        ]
    }

    #[test]
    fn test_consistent_ordering_beats_scrambled() {
        let scorer = ChiSquareScorer::new(TestStatistic::ChiSquare, geometry());
        let chain = consistent_chain();
        let ordered: Vec<&Rese> = chain.iter().collect();
        let scrambled: Vec<&Rese> = vec![&chain[1], &chain[0], &chain[2]];

        let good = scorer.score(&ordered).unwrap();
        match scorer.score(&scrambled) {
            Some(bad) => assert!(good < bad, "good={good} bad={bad}"),
            None => {} // scrambled order may be outright inadmissible
        }
    }

    #[test]
    fn test_impossible_energy_split_is_inadmissible() {
        let scorer = ChiSquareScorer::new(TestStatistic::ChiSquare, geometry());
        // Huge middle deposit with a tiny trailing photon: cos(phi) from
        // energies is far below -1.
        let chain = vec![
            hit(1, 0.0, 4.0, 100.0, DetectorType::Tracker2d),
            hit(2, 0.0, 2.0, 5000.0, DetectorType::Tracker2d),
            hit(3, 1.0, 0.0, 20.0, DetectorType::Calorimeter),
        ];
        let seq: Vec<&Rese> = chain.iter().collect();
        assert!(scorer.score(&seq).is_none());
    }

    #[test]
    fn test_dual_hit_unique_kinematics_chooses_order() {
        let scorer = ChiSquareScorer::new(TestStatistic::ChiSquare, geometry());
        let config = CsrConfig {
            start_in_first_module: false,
            reject_one_detector_type_only: false,
            ..CsrConfig::default()
        };
        let geo = UniformGeometry::default();

        // 662 keV split so only one order is Compton-compatible:
        // 600 keV first then 62 keV fails (back-scatter limit), while
        // 62 keV first then 600 keV is fine.
        let mut event = RawEvent::with_reses(
            1,
            0.0,
            vec![
                hit(1, 0.0, -2.0, 600.0, DetectorType::Calorimeter),
                hit(2, 0.0, 2.0, 62.0, DetectorType::Tracker2d),
            ],
        );
        scorer.sequence_dual_hit(&mut event, &config, &geo);

        assert!(event.is_good());
        assert_eq!(event.event_type, EventType::Compton);
        // The 62 keV deposit must be first.
        assert_eq!(event.reses()[0].id, 2);
    }

    #[test]
    fn test_dual_hit_undecided_ignore_rejects() {
        let scorer = ChiSquareScorer::new(TestStatistic::ChiSquare, geometry());
        let config = CsrConfig {
            start_in_first_module: false,
            reject_one_detector_type_only: false,
            undecided_handling: UndecidedHandling::Ignore,
            ..CsrConfig::default()
        };
        let geo = UniformGeometry::default();

        // A symmetric split is compatible in both orders.
        let mut event = RawEvent::with_reses(
            1,
            0.0,
            vec![
                hit(1, 0.0, 2.0, 255.0, DetectorType::Tracker2d),
                hit(2, 0.0, -2.0, 255.0, DetectorType::Calorimeter),
            ],
        );
        scorer.sequence_dual_hit(&mut event, &config, &geo);
        assert_eq!(event.rejection(), RejectionReason::StartUndecided);
    }

    #[test]
    fn test_dual_hit_larger_energy_deposit_policy() {
        let scorer = ChiSquareScorer::new(TestStatistic::ChiSquare, geometry());
        let config = CsrConfig {
            start_in_first_module: false,
            reject_one_detector_type_only: false,
            undecided_handling: UndecidedHandling::LargerEnergyDeposit,
            ..CsrConfig::default()
        };
        let geo = UniformGeometry::default();

        let mut event = RawEvent::with_reses(
            1,
            0.0,
            vec![
                hit(1, 0.0, 2.0, 200.0, DetectorType::Tracker2d),
                hit(2, 0.0, -2.0, 300.0, DetectorType::Calorimeter),
            ],
        );
        scorer.sequence_dual_hit(&mut event, &config, &geo);

        assert!(event.is_good());
        assert_eq!(event.reses()[0].id, 2);
        let q1 = event.quality.unwrap();
        let q2 = event.second_quality.unwrap();
        assert!((q1 - 0.6).abs() < 1e-9);
        assert!((q2 - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_dual_hit_one_detector_type_only() {
        let scorer = ChiSquareScorer::new(TestStatistic::ChiSquare, geometry());
        let config = CsrConfig::default();
        let geo = UniformGeometry::default();

        let mut event = RawEvent::with_reses(
            1,
            0.0,
            vec![
                hit(1, 0.0, -2.0, 300.0, DetectorType::Calorimeter),
                hit(2, 1.0, -3.0, 300.0, DetectorType::Calorimeter),
            ],
        );
        scorer.sequence_dual_hit(&mut event, &config, &geo);
        assert_eq!(event.rejection(), RejectionReason::OneDetectorTypeOnly);
    }
}
