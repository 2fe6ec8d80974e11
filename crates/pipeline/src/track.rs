//! Track recognition: find charged-particle signatures among the RESEs
//! of the tracking detectors before Compton sequencing runs.
//!
//! Three searches, in priority order: pair-production vertices and
//! minimum-ionizing tracks short-circuit the rest of the reconstruction
//! (they set the optimum directly); Compton electron tracks merge their
//! hits into track nodes and may fan the event out into several
//! competing incarnations when the pairing is ambiguous.

use std::sync::Arc;

use nalgebra::Vector3;
use tracing::debug;

use recon_core::{
    DetectorType, EventType, Geometry, HypothesisGroup, RawEvent, RejectionReason, Rese,
    SetupError,
};

use crate::config::{TrackingAlgorithm, TrackingConfig};
use crate::stage::ReconstructionStage;

pub struct Tracker {
    config: TrackingConfig,
    geometry: Arc<dyn Geometry>,
    next_track_id: u32,
}

impl Tracker {
    pub fn new(config: TrackingConfig, geometry: Arc<dyn Geometry>) -> Self {
        Tracker {
            config,
            geometry,
            next_track_id: 2_000_000,
        }
    }

    fn fresh_track_id(&mut self) -> u32 {
        self.next_track_id += 1;
        self.next_track_id
    }

    fn is_trackable(&self, detector: DetectorType) -> bool {
        self.config.detectors.contains(&detector)
    }

    /// Indices of trackable RESEs grouped by layer, top layer first.
    fn layered(&self, event: &RawEvent) -> Vec<(i32, Vec<usize>)> {
        let mut layers: Vec<(i32, Vec<usize>)> = Vec::new();
        for (i, rese) in event.reses().iter().enumerate() {
            if !self.is_trackable(rese.detector) {
                continue;
            }
            let layer = self.geometry.layer(&rese.position);
            match layers.iter_mut().find(|(l, _)| *l == layer) {
                Some((_, v)) => v.push(i),
                None => layers.push((layer, vec![i])),
            }
        }
        layers.sort_by(|a, b| b.0.cmp(&a.0));
        layers
    }

    /// Pair signature: one vertex with at least two prongs in the next
    /// layer down. The whole trackable content becomes one track node
    /// and the event is finished as a pair event.
    fn search_pair(&mut self, event: &mut RawEvent) -> bool {
        let layers = self.layered(event);
        if layers.len() < 2 {
            return false;
        }

        let mut vertex: Option<usize> = None;
        for w in layers.windows(2) {
            let (_, above) = &w[0];
            let (_, below) = &w[1];
            if above.len() == 1 && below.len() >= 2 {
                vertex = Some(above[0]);
                break;
            }
        }
        let Some(vertex_idx) = vertex else {
            return false;
        };

        let trackable: Vec<usize> = layers.iter().flat_map(|(_, v)| v.clone()).collect();
        if trackable.len() < 3 {
            return false;
        }

        debug!(
            vertex = event.reses()[vertex_idx].id,
            prongs = trackable.len() - 1,
            "tracker: pair vertex found"
        );

        let vertex_position = event.reses()[vertex_idx].position;
        let constituents = Self::extract(event, &trackable, Some(vertex_idx));
        let direction = Self::mean_direction(&vertex_position, &constituents);
        let track = Rese::track(self.fresh_track_id(), constituents, direction);
        event.push(track);
        event.event_type = EventType::Pair;
        event.set_good(true);
        true
    }

    /// Minimum-ionizing signature: every trackable RESE on one straight
    /// line spanning enough layers.
    fn search_mip(&mut self, event: &mut RawEvent) -> bool {
        let layers = self.layered(event);
        let span = match (layers.first(), layers.last()) {
            (Some((top, _)), Some((bottom, _))) => top - bottom + 1,
            _ => return false,
        };
        if span < self.config.min_layers_mip || layers.iter().any(|(_, v)| v.len() != 1) {
            return false;
        }

        let indices: Vec<usize> = layers.iter().map(|(_, v)| v[0]).collect();
        if indices.len() < 2 || indices.len() != event.len() {
            return false;
        }

        // Straightness: every inter-hit direction must agree with the
        // end-to-end axis.
        let first = event.reses()[indices[0]].position;
        let last = event.reses()[*indices.last().unwrap()].position;
        let axis = (last - first).normalize();
        for w in indices.windows(2) {
            let step = (event.reses()[w[1]].position - event.reses()[w[0]].position).normalize();
            if step.angle(&axis) > 0.1 {
                return false;
            }
        }

        debug!(layers = indices.len(), "tracker: minimum-ionizing track");
        let constituents = Self::extract(event, &indices, Some(indices[0]));
        let track = Rese::track(self.fresh_track_id(), constituents, axis);
        event.push(track);
        event.event_type = EventType::Muon;
        event.set_good(true);
        true
    }

    /// Compton electron tracks: hits in directly neighboring layers (up
    /// to `max_compton_jump`) pair into short track segments. Every
    /// admissible pairing becomes one candidate incarnation, ranked by
    /// the summed segment length (shorter is better).
    fn compton_candidates(&self, event: &RawEvent) -> Vec<(f64, Vec<(usize, usize)>)> {
        let layers = self.layered(event);
        let mut pairs: Vec<(usize, usize, f64)> = Vec::new();
        for i in 0..layers.len() {
            for j in (i + 1)..layers.len() {
                let gap = layers[i].0 - layers[j].0;
                if gap <= 0 || gap > self.config.max_compton_jump {
                    continue;
                }
                for &a in &layers[i].1 {
                    for &b in &layers[j].1 {
                        let d = event.reses()[a].center_distance(&event.reses()[b]);
                        pairs.push((a, b, d));
                    }
                }
            }
        }
        if pairs.is_empty() {
            return Vec::new();
        }

        // Enumerate disjoint pairings (each hit used at most once).
        let mut candidates: Vec<(f64, Vec<(usize, usize)>)> = Vec::new();
        Self::assign(&pairs, 0, &mut Vec::new(), &mut candidates);
        candidates.retain(|(_, assignment)| !assignment.is_empty());
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
        candidates
    }

    fn assign(
        pairs: &[(usize, usize, f64)],
        from: usize,
        current: &mut Vec<(usize, usize)>,
        out: &mut Vec<(f64, Vec<(usize, usize)>)>,
    ) {
        let used = |idx: usize, current: &[(usize, usize)]| {
            current.iter().any(|&(a, b)| a == idx || b == idx)
        };
        let mut extended = false;
        for (i, &(a, b, _)) in pairs.iter().enumerate().skip(from) {
            if used(a, current) || used(b, current) {
                continue;
            }
            extended = true;
            current.push((a, b));
            Self::assign(pairs, i + 1, current, out);
            current.pop();
        }
        if !extended && !current.is_empty() {
            let cost: f64 = current
                .iter()
                .map(|&(a, b)| pairs.iter().find(|&&(x, y, _)| x == a && y == b).map(|p| p.2).unwrap_or(0.0))
                .sum();
            out.push((cost, current.clone()));
        }
    }

    /// Materialize one pairing as a new incarnation of the event.
    fn materialize(&mut self, event: &RawEvent, assignment: &[(usize, usize)], cost: f64) -> RawEvent {
        let mut incarnation = event.clone();
        incarnation.track_quality = Some(cost);

        // Indices shift as RESEs are taken out; work on identities.
        let pair_ids: Vec<(u32, u32)> = assignment
            .iter()
            .map(|&(a, b)| (event.reses()[a].id, event.reses()[b].id))
            .collect();

        for (start_id, end_id) in pair_ids {
            let reses = incarnation.reses();
            let Some(start_idx) = reses.iter().position(|r| r.id == start_id) else {
                continue;
            };
            let Some(end_idx) = reses.iter().position(|r| r.id == end_id) else {
                continue;
            };
            let (first, second) = if start_idx < end_idx {
                (end_idx, start_idx)
            } else {
                (start_idx, end_idx)
            };
            // Remove the higher index first to keep the lower one valid.
            let r_first = incarnation.take(first);
            let r_second = incarnation.take(second);
            let (start, end) = if r_first.id == start_id {
                (r_first, r_second)
            } else {
                (r_second, r_first)
            };
            let direction = (end.position - start.position).normalize();
            let track = Rese::track(self.fresh_track_id(), vec![start, end], direction);
            incarnation.push(track);
        }
        incarnation
    }

    fn extract(event: &mut RawEvent, indices: &[usize], first: Option<usize>) -> Vec<Rese> {
        let mut order: Vec<usize> = indices.to_vec();
        if let Some(f) = first {
            order.retain(|&i| i != f);
            order.insert(0, f);
        }
        let ids: Vec<u32> = order.iter().map(|&i| event.reses()[i].id).collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(pos) = event.reses().iter().position(|r| r.id == id) {
                out.push(event.take(pos));
            }
        }
        out
    }

    fn mean_direction(origin: &Vector3<f64>, constituents: &[Rese]) -> Vector3<f64> {
        let mut dir = Vector3::zeros();
        for r in constituents.iter().skip(1) {
            let step = r.position - origin;
            if step.norm() > 0.0 {
                dir += step.normalize();
            }
        }
        if dir.norm() > 0.0 {
            dir.normalize()
        } else {
            Vector3::new(0.0, 0.0, -1.0)
        }
    }
}

impl ReconstructionStage for Tracker {
    fn analyze(&mut self, group: &mut HypothesisGroup) -> Result<(), SetupError> {
        if self.config.algorithm == TrackingAlgorithm::None {
            return Ok(());
        }

        let indices: Vec<usize> = (0..group.len()).collect();
        for idx in indices {
            let Some(event) = group.get(idx) else { continue };
            if event.is_rejected() {
                continue;
            }

            if self.config.search_pairs {
                let found = match group.get_mut(idx) {
                    Some(event) => self.search_pair(event),
                    None => false,
                };
                if found {
                    group.set_optimum(idx);
                    continue;
                }
            }

            if self.config.search_mips {
                let found = match group.get_mut(idx) {
                    Some(event) => self.search_mip(event),
                    None => false,
                };
                if found {
                    group.set_optimum(idx);
                    continue;
                }
            }

            if !self.config.search_comptons {
                continue;
            }

            let candidates = {
                let event = group.get(idx).expect("index valid");
                self.compton_candidates(event)
            };
            if candidates.is_empty() {
                continue;
            }

            if candidates.len() > self.config.max_incarnations {
                if let Some(event) = group.get_mut(idx) {
                    event.reject(RejectionReason::TooManyIncarnations);
                }
                continue;
            }

            if self.config.reject_pure_ambiguities && candidates.len() > 1 {
                let best = candidates[0].0;
                let second = candidates[1].0;
                if (best - second).abs() < 1e-9 {
                    if let Some(event) = group.get_mut(idx) {
                        event.reject(RejectionReason::TooManyUndecidedTrackElements);
                    }
                    continue;
                }
            }

            let kept = candidates
                .into_iter()
                .take(self.config.n_sequences_to_keep.max(1));
            let original = group.get(idx).expect("index valid").clone();
            let mut replaced_original = false;
            for (cost, assignment) in kept {
                let incarnation = self.materialize(&original, &assignment, cost);
                if !replaced_original {
                    *group.get_mut(idx).expect("index valid") = incarnation;
                    replaced_original = true;
                } else {
                    group.add(incarnation);
                }
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        let detectors: Vec<&str> = self.config.detectors.iter().map(|d| d.as_str()).collect();
        format!(
            "# Tracker options:\n\
             # Algorithm: {:?}\n\
             # Detectors: {}\n\
             # Search pairs: {}\n\
             # Search MIPs: {}\n\
             # Search Comptons: {}\n\
             # Max Compton jump: {}\n\
             # Sequences to keep: {}\n",
            self.config.algorithm,
            detectors.join(", "),
            self.config.search_pairs,
            self.config.search_mips,
            self.config.search_comptons,
            self.config.max_compton_jump,
            self.config.n_sequences_to_keep,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::UniformGeometry;

    fn geometry() -> Arc<dyn Geometry> {
        Arc::new(UniformGeometry::default())
    }

    fn tracker(config: TrackingConfig) -> Tracker {
        Tracker::new(config, geometry())
    }

    fn hit(id: u32, x: f64, z: f64, energy: f64) -> Rese {
        Rese::hit(id, Vector3::new(x, 0.0, z), energy, DetectorType::Tracker2d)
    }

    fn calo_hit(id: u32, z: f64, energy: f64) -> Rese {
        Rese::hit(id, Vector3::new(0.0, 0.0, z), energy, DetectorType::Calorimeter)
    }

    fn group_of(reses: Vec<Rese>) -> HypothesisGroup {
        let mut g = HypothesisGroup::new();
        g.set_initial(RawEvent::with_reses(1, 0.0, reses));
        g
    }

    #[test]
    fn test_pair_vertex_sets_optimum() {
        let config = TrackingConfig {
            algorithm: TrackingAlgorithm::Directional,
            ..TrackingConfig::default()
        };
        let mut stage = tracker(config);

        // One vertex at layer 5, two prongs at layer 4, spreading further
        // down: the classic inverted V.
        let mut group = group_of(vec![
            hit(1, 0.0, 5.5, 800.0),
            hit(2, -0.4, 4.5, 300.0),
            hit(3, 0.4, 4.5, 350.0),
            hit(4, -0.8, 3.5, 200.0),
            hit(5, 0.8, 3.5, 220.0),
        ]);
        stage.analyze(&mut group).unwrap();

        assert!(group.has_optimum());
        let optimum = group.optimum().unwrap();
        assert_eq!(optimum.event_type, EventType::Pair);
        assert_eq!(optimum.len(), 1);
        assert!(optimum.reses()[0].is_track());
    }

    #[test]
    fn test_mip_straight_chain_sets_optimum() {
        let config = TrackingConfig {
            algorithm: TrackingAlgorithm::Directional,
            search_pairs: false,
            search_mips: true,
            search_comptons: false,
            min_layers_mip: 4,
            ..TrackingConfig::default()
        };
        let mut stage = tracker(config);

        let mut group = group_of(vec![
            hit(1, 0.0, 6.5, 100.0),
            hit(2, 0.1, 5.5, 100.0),
            hit(3, 0.2, 4.5, 100.0),
            hit(4, 0.3, 3.5, 100.0),
            hit(5, 0.4, 2.5, 100.0),
        ]);
        stage.analyze(&mut group).unwrap();

        assert!(group.has_optimum());
        assert_eq!(group.optimum().unwrap().event_type, EventType::Muon);
    }

    #[test]
    fn test_compton_track_merges_adjacent_layer_hits() {
        let config = TrackingConfig {
            algorithm: TrackingAlgorithm::Directional,
            search_pairs: false,
            search_comptons: true,
            ..TrackingConfig::default()
        };
        let mut stage = tracker(config);

        let mut group = group_of(vec![
            hit(1, 0.0, 5.5, 200.0),
            hit(2, 0.2, 4.5, 150.0),
            calo_hit(3, -2.0, 400.0),
        ]);
        stage.analyze(&mut group).unwrap();

        assert!(!group.has_optimum());
        let event = group.initial().unwrap();
        assert_eq!(event.len(), 2);
        assert!(event.reses().iter().any(|r| r.is_track()));
        assert!(event.track_quality.is_some());
    }

    #[test]
    fn test_ambiguous_pairing_fans_out_incarnations() {
        let config = TrackingConfig {
            algorithm: TrackingAlgorithm::Directional,
            search_pairs: false,
            search_comptons: true,
            n_sequences_to_keep: 2,
            ..TrackingConfig::default()
        };
        let mut stage = tracker(config);

        // Two hits in the upper layer, one below: two admissible pairings.
        let mut group = group_of(vec![
            hit(1, 0.0, 5.5, 200.0),
            hit(2, 1.0, 5.5, 180.0),
            hit(3, 0.5, 4.5, 150.0),
        ]);
        stage.analyze(&mut group).unwrap();

        assert_eq!(group.len(), 2);
        // Both incarnations carry a quality, best first by construction.
        let q0 = group.get(0).unwrap().track_quality.unwrap();
        let q1 = group.get(1).unwrap().track_quality.unwrap();
        assert!(q0 <= q1);
    }

    #[test]
    fn test_tracking_disabled_is_noop() {
        let mut stage = tracker(TrackingConfig::default());
        let mut group = group_of(vec![hit(1, 0.0, 5.5, 100.0), hit(2, 0.2, 4.5, 90.0)]);
        stage.analyze(&mut group).unwrap();
        assert_eq!(group.initial().unwrap().len(), 2);
    }
}
