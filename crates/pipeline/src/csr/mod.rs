//! Compton sequence reconstruction.
//!
//! Given a raw event whose remaining RESEs are believed to form one
//! Compton scattering chain, enumerate the admissible visiting orders,
//! score each with a figure-of-merit (lower is better), and promote the
//! best admissible ordering to the optimum, or reject the event with a
//! typed reason. One shared search/ranking skeleton serves all scoring
//! back-ends.

mod chi_square;
mod energy_recovery;
mod features;
mod tof;

pub use chi_square::ChiSquareScorer;
pub use energy_recovery::EnergyRecoveryScorer;
pub use features::{ClassifierScorer, SequenceClassifier, SequenceFeatures};
pub use tof::TimeOfFlightScorer;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use recon_core::{
    EventType, Geometry, HypothesisGroup, RawEvent, RejectionReason, Rese, SetupError,
};

use crate::config::{CsrAlgorithm, CsrConfig};
use crate::stage::ReconstructionStage;

/// Score map key with a total order, so the BTreeMap iterates
/// best-first without re-sorting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quality(pub f64);

impl Eq for Quality {}

impl PartialOrd for Quality {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quality {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Figure-of-merit back-end: raw RESE sequence in, scalar score out
/// (lower is better), `None` when the ordering is inadmissible.
pub trait SequenceScorer {
    fn score(&self, sequence: &[&Rese]) -> Option<f64>;

    /// Energy estimated to have escaped for this ordering.
    fn escaped_energy(&self, _sequence: &[&Rese]) -> f64 {
        0.0
    }

    fn describe(&self) -> String;
}

enum ScorerKind {
    ChiSquare(ChiSquareScorer),
    EnergyRecovery(EnergyRecoveryScorer),
    TimeOfFlight(TimeOfFlightScorer),
    Classifier(ClassifierScorer),
}

impl ScorerKind {
    fn as_scorer(&self) -> &dyn SequenceScorer {
        match self {
            ScorerKind::ChiSquare(s) => s,
            ScorerKind::EnergyRecovery(s) => s,
            ScorerKind::TimeOfFlight(s) => s,
            ScorerKind::Classifier(s) => s,
        }
    }
}

pub struct CsrEngine {
    config: CsrConfig,
    geometry: Arc<dyn Geometry>,
    scorer: ScorerKind,
    /// Permutations scored for the most recent event.
    permutations_evaluated: u64,
}

impl CsrEngine {
    pub fn new(config: CsrConfig, geometry: Arc<dyn Geometry>) -> Result<Self, SetupError> {
        let scorer = match config.algorithm {
            CsrAlgorithm::ChiSquare => ScorerKind::ChiSquare(ChiSquareScorer::new(
                config.test_statistic,
                geometry.clone(),
            )),
            CsrAlgorithm::EnergyRecovery => {
                ScorerKind::EnergyRecovery(EnergyRecoveryScorer::new(geometry.clone()))
            }
            CsrAlgorithm::TimeOfFlight => {
                ScorerKind::TimeOfFlight(TimeOfFlightScorer::new(geometry.clone()))
            }
            CsrAlgorithm::Classifier => {
                return Err(SetupError::InvalidParameter(
                    "classifier scoring needs with_classifier()".into(),
                ))
            }
            CsrAlgorithm::None => {
                return Err(SetupError::UnknownAlgorithm("csr: none".into()));
            }
        };
        Ok(CsrEngine {
            config,
            geometry,
            scorer,
            permutations_evaluated: 0,
        })
    }

    /// Build the engine around an external classifier back-end.
    pub fn with_classifier(
        config: CsrConfig,
        geometry: Arc<dyn Geometry>,
        classifier: Box<dyn SequenceClassifier>,
    ) -> Self {
        let scorer = ScorerKind::Classifier(ClassifierScorer::new(geometry.clone(), classifier));
        CsrEngine {
            config,
            geometry,
            scorer,
            permutations_evaluated: 0,
        }
    }

    /// Number of permutations scored for the last analyzed event.
    pub fn permutations_evaluated(&self) -> u64 {
        self.permutations_evaluated
    }

    /// Score every admissible permutation of the event's RESEs.
    ///
    /// Returns the ascending score map and the number of orderings
    /// scored. Generation is lazy (lexicographic next-permutation) and
    /// stops at the configured budget.
    fn compute_quality_map(&mut self, event: &RawEvent) -> BTreeMap<Quality, Vec<Vec<usize>>> {
        let n = event.len();
        let mut map: BTreeMap<Quality, Vec<Vec<usize>>> = BTreeMap::new();
        self.permutations_evaluated = 0;

        let mut permutation: Vec<usize> = (0..n).collect();
        loop {
            if self.permutations_evaluated >= self.config.max_permutations {
                debug!(
                    budget = self.config.max_permutations,
                    "csr: permutation budget exhausted"
                );
                break;
            }

            let head_ok = !self.config.start_in_first_module
                || event.reses()[permutation[0]].detector.is_first_module();
            if head_ok {
                let sequence: Vec<&Rese> =
                    permutation.iter().map(|&i| &event.reses()[i]).collect();
                self.permutations_evaluated += 1;
                if let Some(score) = self.scorer.as_scorer().score(&sequence) {
                    map.entry(Quality(score)).or_default().push(permutation.clone());
                }
            }

            if !next_permutation(&mut permutation) {
                break;
            }
        }
        map
    }

    /// The full sequence search for events with three or more sites
    /// (and for two-site events outside the chi-square mode).
    fn find_sequence(&mut self, event: &mut RawEvent) {
        let map = self.compute_quality_map(event);

        let n_good: usize = map.values().map(|v| v.len()).sum();
        if n_good == 0 {
            debug!(event = event.event_id, "csr: no admissible sequence");
            event.reject(RejectionReason::CsrNoGoodCombination);
            return;
        }

        let best_score = map.iter().next().expect("non-empty map").0 .0;

        // Everything within the numerical tolerance of the best score
        // counts as tied. Ties resolve to the sequence with the
        // lexicographically smallest RESE ids, so selection never
        // depends on generation order. When pure ambiguities are not
        // acceptable, a tie rejects the event outright.
        let mut tied: Vec<&Vec<usize>> = Vec::new();
        for (quality, perms) in map.iter() {
            if quality.0 - best_score <= self.config.ambiguity_tolerance {
                tied.extend(perms.iter());
            } else {
                break;
            }
        }

        if self.config.reject_pure_ambiguities && tied.len() > 1 {
            debug!(event = event.event_id, "csr: pure ambiguity");
            event.reject(RejectionReason::StartUndecided);
            return;
        }

        let best_perm = tied
            .iter()
            .min_by_key(|perm| perm.iter().map(|&i| event.reses()[i].id).collect::<Vec<_>>())
            .expect("non-empty tie set")
            .to_vec();

        let second_score = map
            .iter()
            .flat_map(|(q, perms)| perms.iter().map(move |_| q.0))
            .nth(1);

        let sequence: Vec<&Rese> = best_perm.iter().map(|&i| &event.reses()[i]).collect();
        let escaped = self.scorer.as_scorer().escaped_energy(&sequence);
        drop(sequence);

        event.reorder(&best_perm);
        event.start_index = Some(0);
        event.quality = Some(best_score);
        event.second_quality = second_score;
        event.escaped_energy = escaped;

        if best_score < self.config.threshold_min || best_score > self.config.threshold_max {
            debug!(
                event = event.event_id,
                score = best_score,
                "csr: best sequence outside threshold window"
            );
            event.reject(RejectionReason::CsrThreshold);
            return;
        }

        if self.config.start_in_first_module
            && !event.reses()[0].detector.is_first_module()
        {
            event.reject(RejectionReason::StartNotInFirstModule);
            return;
        }

        // A track at the sequence head must point the way the recoil
        // electron kinematics allows.
        if event.reses()[0].is_track() {
            let e1 = event.reses()[0].energy;
            let e2: f64 =
                event.reses().iter().skip(1).map(|r| r.energy).sum::<f64>() + event.escaped_energy;
            if !event.test_electron_direction(e1, e2) {
                event.reject(RejectionReason::ElectronDirectionBad);
                return;
            }
        }

        debug!(
            event = event.event_id,
            score = best_score,
            "csr: sequence found"
        );
        event.event_type = EventType::Compton;
        event.set_good(true);
        event.reconstructed = true;
    }

    /// Replace each raw event by one unscored incarnation per
    /// permutation: training-sample production for external
    /// classifiers.
    fn create_only_permutations(&mut self, group: &mut HypothesisGroup) {
        group.clear_optimum();

        let mut originals = Vec::with_capacity(group.len());
        while !group.is_empty() {
            originals.push(group.remove(0));
        }

        for mut original in originals {
            let n = original.len();
            if n == 0 {
                original.reject(RejectionReason::NoHits);
                group.add(original);
                continue;
            }
            if n > self.config.max_hits {
                original.reject(RejectionReason::TooManyHitsCsr);
                group.add(original);
                continue;
            }

            let mut permutation: Vec<usize> = (0..n).collect();
            let mut produced = 0u64;
            loop {
                if produced >= self.config.max_permutations {
                    break;
                }
                let mut incarnation = original.clone();
                incarnation.reorder(&permutation);
                incarnation.start_index = Some(0);
                group.add(incarnation);
                produced += 1;
                if !next_permutation(&mut permutation) {
                    break;
                }
            }
        }
    }

    fn size_gate(&self, event: &mut RawEvent) -> bool {
        let n = event.len();
        if n > self.config.max_hits {
            debug!(
                event = event.event_id,
                hits = n,
                max = self.config.max_hits,
                "csr: too many hits"
            );
            event.reject(RejectionReason::TooManyHitsCsr);
            return false;
        }
        if n == 0 {
            event.reject(RejectionReason::NoHits);
            return false;
        }
        if n == 1 {
            if event.reses()[0].is_track() {
                event.reject(RejectionReason::OneTrackOnly);
            } else {
                event.event_type = EventType::Photo;
                event.set_good(true);
                event.reconstructed = true;
            }
            return false;
        }
        true
    }
}

impl ReconstructionStage for CsrEngine {
    fn analyze(&mut self, group: &mut HypothesisGroup) -> Result<(), SetupError> {
        if self.config.only_create_permutations {
            self.create_only_permutations(group);
            return Ok(());
        }

        for event in group.events_mut() {
            if event.is_rejected() || event.reconstructed {
                continue;
            }
            event.quality = None;
            event.second_quality = None;

            if !self.size_gate(event) {
                continue;
            }

            // Two-site events get the dedicated treatment in chi-square
            // mode; every other back-end scores them like any sequence.
            if event.len() == 2 {
                if let ScorerKind::ChiSquare(scorer) = &self.scorer {
                    scorer.sequence_dual_hit(event, &self.config, self.geometry.as_ref());
                    continue;
                }
            }

            self.find_sequence(event);
        }

        // The best good interpretation across incarnations becomes the
        // optimum: any photo event qualifies outright, Compton events
        // compete on their quality factor.
        let mut best: Option<(usize, f64)> = None;
        for (i, event) in group.events().iter().enumerate() {
            if !event.is_good() {
                continue;
            }
            match event.event_type {
                EventType::Photo => {
                    best = Some((i, f64::NEG_INFINITY));
                }
                EventType::Compton => {
                    let q = event.quality.unwrap_or(f64::MAX);
                    if best.map(|(_, bq)| q < bq).unwrap_or(true) {
                        best = Some((i, q));
                    }
                }
                _ => {}
            }
        }
        match best {
            Some((i, _)) => group.set_optimum(i),
            None => {
                debug!("csr: no good incarnation");
                group.clear_optimum();
            }
        }

        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "# CSR options:\n\
             # Algorithm: {:?}\n\
             # QualityFactorMin: {}\n\
             # QualityFactorMax: {}\n\
             # MaxNInteractions: {}\n\
             # GuaranteeStartInFirstModule: {}\n\
             {}",
            self.config.algorithm,
            self.config.threshold_min,
            self.config.threshold_max,
            self.config.max_hits,
            self.config.start_in_first_module,
            self.scorer.as_scorer().describe(),
        )
    }

    fn pre_analysis(&mut self) -> Result<(), SetupError> {
        if matches!(
            self.scorer,
            ScorerKind::ChiSquare(_) | ScorerKind::EnergyRecovery(_)
        ) && !self.geometry.cross_sections_present()
        {
            return Err(SetupError::CrossSectionsMissing("csr"));
        }
        Ok(())
    }
}

/// Lexicographic next-permutation; returns `false` after the last one.
fn next_permutation(perm: &mut [usize]) -> bool {
    if perm.len() < 2 {
        return false;
    }
    let mut i = perm.len() - 1;
    while i > 0 && perm[i - 1] >= perm[i] {
        i -= 1;
    }
    if i == 0 {
        return false;
    }
    let mut j = perm.len() - 1;
    while perm[j] <= perm[i - 1] {
        j -= 1;
    }
    perm.swap(i - 1, j);
    perm[i..].reverse();
    true
}

/// Propagated error on the geometric `cos(phi)` at the middle vertex of
/// an interaction triple.
pub(crate) fn compute_position_error(first: &Rese, second: &Rese, third: &Rese) -> f64 {
    let a = first.position;
    let b = second.position;
    let c = third.position;
    let da = first.position_resolution;
    let db = second.position_resolution;
    let dc = third.position_resolution;

    let v = a - b;
    let u = b - c;
    let u_dot_v = u.dot(&v);
    let len_v2 = v.norm_squared();
    let len_u2 = u.norm_squared();
    let len_v = len_v2.sqrt();
    let len_u = len_u2.sqrt();

    let len_vu = len_v * len_u;
    let len_v3u = len_v2 * len_vu;
    let len_vu3 = len_vu * len_u2;

    if len_vu == 0.0 {
        return 0.0;
    }

    // d cos(theta) / d position, one triple of partials per point.
    let d1 = |vc: f64, uc: f64| (vc - uc) / len_vu - uc * u_dot_v / len_vu3 + vc * u_dot_v / len_v3u;
    let d2 = |vc: f64, uc: f64| uc * u_dot_v / len_vu3 - vc / len_vu;
    let d0 = |vc: f64, uc: f64| -vc * u_dot_v / len_v3u + uc / len_vu;

    let (dx1, dy1, dz1) = (d1(v.x, u.x), d1(v.y, u.y), d1(v.z, u.z));
    let (dx2, dy2, dz2) = (d2(v.x, u.x), d2(v.y, u.y), d2(v.z, u.z));
    let (dx0, dy0, dz0) = (d0(v.x, u.x), d0(v.y, u.y), d0(v.z, u.z));

    let mut delta = (dx1 * dx1 * db.x * db.x
        + dy1 * dy1 * db.y * db.y
        + dz1 * dz1 * db.z * db.z
        + dx2 * dx2 * dc.x * dc.x
        + dy2 * dy2 * dc.y * dc.y
        + dz2 * dz2 * dc.z * dc.z
        + dx0 * dx0 * da.x * da.x
        + dy0 * dy0 * da.y * da.y
        + dz0 * dz0 * da.z * da.z)
        .sqrt();

    if delta == 0.0 {
        // Collinear hits defeat the propagation; fall back to a crude
        // resolution-over-baseline estimate.
        if ((u_dot_v / len_u / len_v).abs() - 1.0).abs() < 1e-10 {
            let avg = |r: nalgebra::Vector3<f64>| r.norm();
            delta = ((((avg(da) + avg(db)) / len_v).atan()
                + ((avg(db) + avg(dc)) / len_u).atan())
            .cos())
            .abs();
        }
    }

    delta
}
