//! Hit clustering: merge adjacent or duplicate deposits into single
//! RESE nodes.
//!
//! Three interchangeable adjacency policies: a fixed metric distance per
//! detector class, voxel-neighbor connectivity with an optional timing
//! veto, and a precomputed separability table thresholded at 0.5.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use recon_core::{Geometry, HypothesisGroup, RawEvent, Rese, SetupError};

use crate::config::{ClusteringAlgorithm, ClusteringConfig};
use crate::stage::ReconstructionStage;

/// Precomputed cluster-separability probabilities.
///
/// `pairs` is keyed by (lower energy, higher energy, depth separation)
/// bins; `multi` by (energy, multiplicity). A probability above 0.5
/// means the deposits are separable and must not stay merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSeparabilityTable {
    pub energy_bin_kev: f64,
    pub depth_bin_cm: f64,
    /// (low-energy bin, high-energy bin, depth bin) -> separability
    pub pairs: Vec<((u32, u32, u32), f64)>,
    /// (energy bin, multiplicity) -> separability
    pub multi: Vec<((u32, usize), f64)>,
}

impl ClusterSeparabilityTable {
    pub fn from_json_file(path: &Path) -> Result<Self, SetupError> {
        let content = std::fs::read_to_string(path).map_err(|e| SetupError::TableLoad {
            what: "cluster separability table",
            detail: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| SetupError::TableLoad {
            what: "cluster separability table",
            detail: e.to_string(),
        })
    }

    fn pair_probability(&self, e_low: f64, e_high: f64, depth: f64) -> f64 {
        if self.energy_bin_kev <= 0.0 || self.depth_bin_cm <= 0.0 {
            return 0.0;
        }
        let key = (
            (e_low / self.energy_bin_kev) as u32,
            (e_high / self.energy_bin_kev) as u32,
            (depth / self.depth_bin_cm) as u32,
        );
        self.pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, p)| *p)
            .unwrap_or(0.0)
    }

    fn multi_probability(&self, energy: f64, multiplicity: usize) -> f64 {
        if self.energy_bin_kev <= 0.0 {
            return 0.0;
        }
        let key = ((energy / self.energy_bin_kev) as u32, multiplicity);
        self.multi
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, p)| *p)
            .unwrap_or(0.0)
    }
}

pub struct Clusterizer {
    config: ClusteringConfig,
    geometry: Arc<dyn Geometry>,
    table: Option<ClusterSeparabilityTable>,
    next_cluster_id: u32,
}

impl Clusterizer {
    pub fn new(config: ClusteringConfig, geometry: Arc<dyn Geometry>) -> Self {
        Clusterizer {
            config,
            geometry,
            table: None,
            next_cluster_id: 1_000_000,
        }
    }

    /// Install an already-loaded separability table (tests, embedding).
    pub fn with_table(mut self, table: ClusterSeparabilityTable) -> Self {
        self.table = Some(table);
        self
    }

    fn fresh_cluster_id(&mut self) -> u32 {
        self.next_cluster_id += 1;
        self.next_cluster_id
    }

    fn cluster_event(&mut self, event: &mut RawEvent) {
        match self.config.algorithm {
            ClusteringAlgorithm::None => {}
            ClusteringAlgorithm::Distance => self.cluster_by_distance(event),
            ClusteringAlgorithm::AdjacentVoxels => {
                self.cluster_by_adjacency(event, self.config.adjacent_sigma, self.config.adjacent_level)
            }
            ClusteringAlgorithm::ProbabilityTable => self.cluster_by_table(event),
        }
    }

    /// Agglomerative pairwise merge: whenever two RESEs of the same
    /// detector class are closer than that class's threshold, coalesce
    /// them and restart from the merged node.
    fn cluster_by_distance(&mut self, event: &mut RawEvent) {
        let mut reses: Vec<Rese> = event.reses().to_vec();
        let mut h = 0;
        while h < reses.len() {
            let mut merged = false;
            let mut l = h + 1;
            while l < reses.len() {
                if reses[h].detector != reses[l].detector {
                    l += 1;
                    continue;
                }
                let threshold = self
                    .config
                    .min_distances_cm
                    .get(&reses[h].detector)
                    .copied()
                    .unwrap_or(0.0);
                if threshold <= 0.0 {
                    l += 1;
                    continue;
                }
                let distance = if self.config.center_is_reference {
                    reses[h].center_distance(&reses[l])
                } else {
                    reses[h].min_distance(&reses[l])
                };
                if distance < threshold {
                    let b = reses.remove(l);
                    let a = reses.remove(h);
                    let id = self.fresh_cluster_id();
                    reses.insert(h, Self::coalesce(id, a, b));
                    merged = true;
                    break;
                }
                l += 1;
            }
            if !merged {
                h += 1;
            }
        }
        event.replace_reses(reses);
    }

    fn cluster_by_adjacency(&mut self, event: &mut RawEvent, sigma: f64, level: u8) {
        let mut reses: Vec<Rese> = event.reses().to_vec();
        let mut h = 0;
        while h < reses.len() {
            let mut merged = false;
            let mut l = h + 1;
            while l < reses.len() {
                if reses[h].detector == reses[l].detector
                    && reses[h].are_adjacent(&reses[l], sigma, level)
                {
                    let b = reses.remove(l);
                    let a = reses.remove(h);
                    let id = self.fresh_cluster_id();
                    reses.insert(h, Self::coalesce(id, a, b));
                    merged = true;
                    break;
                }
                l += 1;
            }
            if !merged {
                h += 1;
            }
        }
        event.replace_reses(reses);
    }

    /// Cluster with the widest adjacency first, then split every cluster
    /// the separability table calls separable.
    fn cluster_by_table(&mut self, event: &mut RawEvent) {
        self.cluster_by_adjacency(event, 0.0, 2);

        let Some(table) = self.table.as_ref() else {
            return;
        };

        let mut out: Vec<Rese> = Vec::with_capacity(event.len());
        let mut split_any = false;
        for rese in event.reses().iter().cloned() {
            if !rese.is_cluster() {
                out.push(rese);
                continue;
            }
            let children = rese.children();
            let separable = if children.len() == 2 {
                let (a, b) = (&children[0], &children[1]);
                let depth = Self::depth_separation(self.geometry.as_ref(), a, b);
                let (lo, hi) = if a.energy <= b.energy {
                    (a.energy, b.energy)
                } else {
                    (b.energy, a.energy)
                };
                table.pair_probability(lo, hi, depth) > 0.5
            } else {
                table.multi_probability(rese.energy, children.len()) > 0.5
            };

            if separable {
                debug!(cluster = rese.id, "separability table splits cluster");
                split_any = true;
                out.extend(rese.children().iter().cloned());
            } else {
                out.push(rese);
            }
        }
        if split_any {
            event.replace_reses(out);
        }
    }

    fn depth_separation(geometry: &dyn Geometry, a: &Rese, b: &Rese) -> f64 {
        // Depth within the sensitive volume; the uniform stack maps this
        // to the z offset inside the layer.
        let _ = geometry;
        (a.position.z - b.position.z).abs()
    }

    fn coalesce(id: u32, a: Rese, b: Rese) -> Rese {
        // Flatten existing clusters so the tree stays one level deep.
        let mut constituents = Vec::new();
        for r in [a, b] {
            if r.is_cluster() {
                match r.kind {
                    recon_core::ReseKind::Cluster { children } => constituents.extend(children),
                    _ => unreachable!(),
                }
            } else {
                constituents.push(r);
            }
        }
        Rese::cluster(id, constituents)
    }
}

impl ReconstructionStage for Clusterizer {
    fn analyze(&mut self, group: &mut HypothesisGroup) -> Result<(), SetupError> {
        for event in group.events_mut() {
            if event.is_rejected() {
                continue;
            }
            self.cluster_event(event);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        let mut out = String::from("# Clusterizer options:\n");
        match self.config.algorithm {
            ClusteringAlgorithm::None => out.push_str("# Clustering: off\n"),
            ClusteringAlgorithm::Distance => {
                out.push_str("# Clustering by distance\n");
                for (det, d) in &self.config.min_distances_cm {
                    out.push_str(&format!("# Min distance {}: {d}\n", det.as_str()));
                }
            }
            ClusteringAlgorithm::AdjacentVoxels => {
                out.push_str("# Clustering by adjacent voxels\n");
                out.push_str(&format!("# Level: {}\n", self.config.adjacent_level));
                out.push_str(&format!("# Sigma: {}\n", self.config.adjacent_sigma));
            }
            ClusteringAlgorithm::ProbabilityTable => {
                out.push_str("# Clustering by separability table\n");
                if let Some(file) = &self.config.separability_table {
                    out.push_str(&format!("# Table: {file}\n"));
                }
            }
        }
        out
    }

    fn pre_analysis(&mut self) -> Result<(), SetupError> {
        if self.config.algorithm == ClusteringAlgorithm::ProbabilityTable && self.table.is_none() {
            let Some(file) = self.config.separability_table.clone() else {
                return Err(SetupError::InvalidParameter(
                    "probability-table clustering needs a separability table file".into(),
                ));
            };
            self.table = Some(ClusterSeparabilityTable::from_json_file(Path::new(&file))?);
        }
        Ok(())
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
        r.position_resolution = Vector3::new(0.1, 0.1, 0.1);
        r
    }

    fn group_of(reses: Vec<Rese>) -> HypothesisGroup {
        let mut g = HypothesisGroup::new();
        g.set_initial(RawEvent::with_reses(1, 0.0, reses));
        g
    }

    #[test]
    fn test_distance_policy_merges_within_threshold() {
        let config = ClusteringConfig {
            algorithm: ClusteringAlgorithm::Distance,
            ..ClusteringConfig::default()
        };
        let mut stage = Clusterizer::new(config, geometry());

        // Calorimeter threshold is 1.1 cm: first two merge, third stays.
        let mut group = group_of(vec![
            hit(1, 0.0, -1.0, 100.0, DetectorType::Calorimeter),
            hit(2, 0.5, -1.0, 200.0, DetectorType::Calorimeter),
            hit(3, 5.0, -1.0, 300.0, DetectorType::Calorimeter),
        ]);
        stage.analyze(&mut group).unwrap();

        let event = group.initial().unwrap();
        assert_eq!(event.len(), 2);
        let cluster = event.reses().iter().find(|r| r.is_cluster()).unwrap();
        assert!((cluster.energy - 300.0).abs() < 1e-9);
        assert_eq!(cluster.leaves().len(), 2);
    }

    #[test]
    fn test_distance_policy_ignores_cross_detector_pairs() {
        let config = ClusteringConfig {
            algorithm: ClusteringAlgorithm::Distance,
            ..ClusteringConfig::default()
        };
        let mut stage = Clusterizer::new(config, geometry());

        let mut group = group_of(vec![
            hit(1, 0.0, 0.5, 100.0, DetectorType::Tracker2d),
            hit(2, 0.01, -0.5, 200.0, DetectorType::Calorimeter),
        ]);
        stage.analyze(&mut group).unwrap();
        assert_eq!(group.initial().unwrap().len(), 2);
    }

    #[test]
    fn test_adjacency_policy_chains_neighbors() {
        let config = ClusteringConfig {
            algorithm: ClusteringAlgorithm::AdjacentVoxels,
            adjacent_level: 2,
            ..ClusteringConfig::default()
        };
        let mut stage = Clusterizer::new(config, geometry());

        // Three hits in consecutive voxels chain into one cluster.
        let mut group = group_of(vec![
            hit(1, 0.0, 1.0, 50.0, DetectorType::Tracker2d),
            hit(2, 0.1, 1.0, 60.0, DetectorType::Tracker2d),
            hit(3, 0.2, 1.0, 70.0, DetectorType::Tracker2d),
        ]);
        stage.analyze(&mut group).unwrap();

        let event = group.initial().unwrap();
        assert_eq!(event.len(), 1);
        assert_eq!(event.reses()[0].leaves().len(), 3);
    }

    #[test]
    fn test_table_policy_splits_separable_pair() {
        let table = ClusterSeparabilityTable {
            energy_bin_kev: 100.0,
            depth_bin_cm: 0.1,
            // (50 keV, 60 keV, dz=0) bin: clearly separable
            pairs: vec![((0, 0, 0), 0.9)],
            multi: vec![],
        };
        let config = ClusteringConfig {
            algorithm: ClusteringAlgorithm::ProbabilityTable,
            ..ClusteringConfig::default()
        };
        let mut stage = Clusterizer::new(config, geometry()).with_table(table);

        let mut group = group_of(vec![
            hit(1, 0.0, 1.0, 50.0, DetectorType::Tracker2d),
            hit(2, 0.1, 1.0, 60.0, DetectorType::Tracker2d),
        ]);
        stage.analyze(&mut group).unwrap();

        // The pre-pass merges them, the table splits them again.
        assert_eq!(group.initial().unwrap().len(), 2);
    }

    #[test]
    fn test_rejected_events_left_untouched() {
        let config = ClusteringConfig {
            algorithm: ClusteringAlgorithm::AdjacentVoxels,
            ..ClusteringConfig::default()
        };
        let mut stage = Clusterizer::new(config, geometry());

        let mut group = group_of(vec![
            hit(1, 0.0, 1.0, 50.0, DetectorType::Tracker2d),
            hit(2, 0.1, 1.0, 60.0, DetectorType::Tracker2d),
        ]);
        group
            .get_mut(0)
            .unwrap()
            .reject(recon_core::RejectionReason::ExternalBadFlag);
        stage.analyze(&mut group).unwrap();
        assert_eq!(group.initial().unwrap().len(), 2);
    }
}
