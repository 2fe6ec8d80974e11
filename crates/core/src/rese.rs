//! RESE: reconstructed elementary sub-event.
//!
//! A RESE is one node of the event tree: a raw detector hit, a cluster
//! of merged hits, or a recognized charged-particle track. Clusters and
//! tracks exclusively own their constituents; dropping the root drops the
//! whole tree.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Detector module classes of the instrument.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DetectorType {
    Tracker2d,
    Calorimeter,
    Strip3d,
    Scintillator,
    DriftChamber,
    DirectionalStrip3d,
    AngerCamera,
    Voxel3d,
    Unknown,
}

impl DetectorType {
    /// Detector classes a Compton sequence may be required to start in.
    pub fn is_first_module(&self) -> bool {
        matches!(self, DetectorType::Tracker2d | DetectorType::DriftChamber)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorType::Tracker2d => "tracker_2d",
            DetectorType::Calorimeter => "calorimeter",
            DetectorType::Strip3d => "strip_3d",
            DetectorType::Scintillator => "scintillator",
            DetectorType::DriftChamber => "drift_chamber",
            DetectorType::DirectionalStrip3d => "directional_strip_3d",
            DetectorType::AngerCamera => "anger_camera",
            DetectorType::Voxel3d => "voxel_3d",
            DetectorType::Unknown => "unknown",
        }
    }
}

/// Node payload: what kind of sub-event this RESE represents.
#[derive(Debug, Clone, PartialEq)]
pub enum ReseKind {
    /// A single detector hit.
    Hit,
    /// Merged adjacent hits; owns its constituents.
    Cluster { children: Vec<Rese> },
    /// A recognized charged-particle track with its fitted start direction.
    Track {
        children: Vec<Rese>,
        direction: Vector3<f64>,
    },
}

/// One reconstructed elementary sub-event.
///
/// Positions are in cm, energies in keV, times in seconds. Resolutions
/// are one-sigma.
#[derive(Debug, Clone, PartialEq)]
pub struct Rese {
    pub id: u32,
    pub position: Vector3<f64>,
    pub energy: f64,
    pub time: f64,
    pub position_resolution: Vector3<f64>,
    pub energy_resolution: f64,
    pub time_resolution: f64,
    pub detector: DetectorType,
    pub kind: ReseKind,
    /// Truth particle IDs that contributed (simulation input only).
    pub origins: Vec<u32>,
}

impl Rese {
    /// A bare hit with uniform per-axis position resolution.
    pub fn hit(id: u32, position: Vector3<f64>, energy: f64, detector: DetectorType) -> Self {
        Rese {
            id,
            position,
            energy,
            time: 0.0,
            position_resolution: Vector3::new(0.1, 0.1, 0.1),
            energy_resolution: 1.0,
            time_resolution: 0.0,
            detector,
            kind: ReseKind::Hit,
            origins: Vec::new(),
        }
    }

    pub fn with_time(mut self, time: f64, time_resolution: f64) -> Self {
        self.time = time;
        self.time_resolution = time_resolution;
        self
    }

    pub fn with_resolutions(mut self, position: Vector3<f64>, energy: f64) -> Self {
        self.position_resolution = position;
        self.energy_resolution = energy;
        self
    }

    pub fn is_hit(&self) -> bool {
        matches!(self.kind, ReseKind::Hit)
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self.kind, ReseKind::Cluster { .. })
    }

    pub fn is_track(&self) -> bool {
        matches!(self.kind, ReseKind::Track { .. })
    }

    /// Fitted start direction for tracks, `None` otherwise.
    pub fn direction(&self) -> Option<Vector3<f64>> {
        match &self.kind {
            ReseKind::Track { direction, .. } => Some(*direction),
            _ => None,
        }
    }

    pub fn children(&self) -> &[Rese] {
        match &self.kind {
            ReseKind::Hit => &[],
            ReseKind::Cluster { children } | ReseKind::Track { children, .. } => children,
        }
    }

    /// Leaf hits of this subtree, in ownership order.
    pub fn leaves(&self) -> Vec<&Rese> {
        match &self.kind {
            ReseKind::Hit => vec![self],
            ReseKind::Cluster { children } | ReseKind::Track { children, .. } => {
                children.iter().flat_map(|c| c.leaves()).collect()
            }
        }
    }

    /// Distance between the summary positions of two RESEs.
    pub fn center_distance(&self, other: &Rese) -> f64 {
        (self.position - other.position).norm()
    }

    /// Minimum distance over all leaf pairs, the clustering metric when
    /// the cluster centroid is not the reference.
    pub fn min_distance(&self, other: &Rese) -> f64 {
        let mut min = f64::INFINITY;
        for a in self.leaves() {
            for b in other.leaves() {
                let d = (a.position - b.position).norm();
                if d < min {
                    min = d;
                }
            }
        }
        min
    }

    /// Voxel-neighborhood adjacency test between two RESEs.
    ///
    /// `level` selects the connectivity neighborhood (1 => 4-connected in
    /// plane, 2 => 8, 3 => 12, 4 => 20, 5 => 24), measured in units of the
    /// per-axis position resolution, which doubles as the voxel pitch. A
    /// positive `sigma` vetoes pairs whose time difference exceeds
    /// `sigma` combined timing resolutions.
    pub fn are_adjacent(&self, other: &Rese, sigma: f64, level: u8) -> bool {
        if sigma > 0.0 && self.time_resolution > 0.0 && other.time_resolution > 0.0 {
            let combined = (self.time_resolution.powi(2) + other.time_resolution.powi(2)).sqrt();
            if (self.time - other.time).abs() > sigma * combined {
                return false;
            }
        }

        for a in self.leaves() {
            for b in other.leaves() {
                if Self::voxels_adjacent(a, b, level) {
                    return true;
                }
            }
        }
        false
    }

    fn voxels_adjacent(a: &Rese, b: &Rese, level: u8) -> bool {
        let pitch = |r: f64| if r > 0.0 { r } else { 1.0 };
        let dx = ((a.position.x - b.position.x) / pitch(a.position_resolution.x.max(b.position_resolution.x)))
            .round()
            .abs() as i64;
        let dy = ((a.position.y - b.position.y) / pitch(a.position_resolution.y.max(b.position_resolution.y)))
            .round()
            .abs() as i64;
        let dz = ((a.position.z - b.position.z) / pitch(a.position_resolution.z.max(b.position_resolution.z)))
            .round()
            .abs() as i64;

        if dz > 1 {
            return false;
        }
        let planar = dx.max(dy);
        let diagonal = dx == 1 && dy == 1;
        match level {
            // 4-connectivity: share a face in plane, same layer
            1 => dz == 0 && dx + dy == 1,
            // 8-connectivity: plane neighbors including diagonals
            2 => dz == 0 && planar == 1 && (dx + dy) >= 1,
            // 12: plane diagonals plus face neighbors in depth
            3 => (dz == 0 && planar == 1 && (dx + dy) >= 1) || (dz == 1 && dx + dy == 0),
            // 20: everything but the depth diagonals across both axes
            4 => (planar == 1 || (dz == 1 && dx + dy == 0)) && !(dz == 1 && diagonal),
            // 24: full 3x3x3 neighborhood minus the center
            _ => planar <= 1 && (dx + dy + dz) >= 1,
        }
    }

    /// Merge constituents into a cluster node. The cluster position is the
    /// energy-weighted centroid; resolutions combine accordingly.
    pub fn cluster(id: u32, constituents: Vec<Rese>) -> Self {
        debug_assert!(!constituents.is_empty());
        let energy: f64 = constituents.iter().map(|r| r.energy).sum();
        let weight = |r: &Rese| {
            if energy > 0.0 {
                r.energy / energy
            } else {
                1.0 / constituents.len() as f64
            }
        };

        let mut position = Vector3::zeros();
        let mut pos_res = Vector3::zeros();
        let mut energy_res_sq = 0.0;
        let mut time = f64::INFINITY;
        let mut time_res = 0.0_f64;
        for r in &constituents {
            let w = weight(r);
            position += r.position * w;
            pos_res += r.position_resolution.component_mul(&r.position_resolution) * w * w;
            energy_res_sq += r.energy_resolution * r.energy_resolution;
            if r.time < time {
                time = r.time;
                time_res = r.time_resolution;
            }
        }

        let mut origins: Vec<u32> = constituents.iter().flat_map(|r| r.origins.clone()).collect();
        origins.sort_unstable();
        origins.dedup();

        Rese {
            id,
            position,
            energy,
            time,
            position_resolution: pos_res.map(f64::sqrt),
            energy_resolution: energy_res_sq.sqrt(),
            time_resolution: time_res,
            detector: constituents[0].detector,
            kind: ReseKind::Cluster { children: constituents },
            origins,
        }
    }

    /// Assemble constituents into a track node. The track position is the
    /// first constituent's (the assumed start point), the energy the sum.
    pub fn track(id: u32, constituents: Vec<Rese>, direction: Vector3<f64>) -> Self {
        debug_assert!(!constituents.is_empty());
        let energy: f64 = constituents.iter().map(|r| r.energy).sum();
        let energy_res_sq: f64 = constituents
            .iter()
            .map(|r| r.energy_resolution * r.energy_resolution)
            .sum();
        let first = &constituents[0];

        let mut origins: Vec<u32> = constituents.iter().flat_map(|r| r.origins.clone()).collect();
        origins.sort_unstable();
        origins.dedup();

        Rese {
            id,
            position: first.position,
            energy,
            time: first.time,
            position_resolution: first.position_resolution,
            energy_resolution: energy_res_sq.sqrt(),
            time_resolution: first.time_resolution,
            detector: first.detector,
            kind: ReseKind::Track {
                children: constituents,
                direction,
            },
            origins,
        }
    }
}
