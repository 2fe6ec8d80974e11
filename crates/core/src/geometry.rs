//! Geometry collaborator interface.
//!
//! The reconstruction never inspects the detector description itself; it
//! asks the geometry for absorption probabilities along a path, for the
//! volume containment of a position, for resolutions, and for detector
//! classification. The collaborator is read-only during reconstruction
//! and shared across workers, so implementations must be `Send + Sync`.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::rese::DetectorType;

/// One-sigma measurement resolutions at a position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Resolutions {
    pub position: Vector3<f64>,
    pub energy: f64,
    pub time: f64,
}

pub trait Geometry: Send + Sync {
    /// Probability that a photon of `energy` keV interacts anywhere on
    /// the straight path from `from` to `to`.
    fn absorption_probability(&self, from: &Vector3<f64>, to: &Vector3<f64>, energy: f64) -> f64;

    /// Photo-effect-only absorption probability along the path.
    fn photo_absorption_probability(
        &self,
        from: &Vector3<f64>,
        to: &Vector3<f64>,
        energy: f64,
    ) -> f64;

    /// Compton-only interaction probability along the path.
    fn compton_absorption_probability(
        &self,
        from: &Vector3<f64>,
        to: &Vector3<f64>,
        energy: f64,
    ) -> f64;

    /// Pair-production-only interaction probability along the path.
    fn pair_absorption_probability(
        &self,
        from: &Vector3<f64>,
        to: &Vector3<f64>,
        energy: f64,
    ) -> f64;

    /// Volume path (outermost first) containing the position.
    fn volume_sequence(&self, position: &Vector3<f64>) -> Vec<String>;

    /// Measurement resolutions for a deposit at this position.
    fn resolutions(&self, position: &Vector3<f64>, energy: f64, time: f64) -> Resolutions;

    /// Detector classification of the position.
    fn detector_type(&self, position: &Vector3<f64>) -> DetectorType;

    /// Whether two positions lie in the same sensitive volume (used to
    /// suppress time-of-flight terms inside one module).
    fn in_same_volume(&self, a: &Vector3<f64>, b: &Vector3<f64>) -> bool;

    /// Layer index of a position within its tracker stack.
    fn layer(&self, position: &Vector3<f64>) -> i32;

    /// Whether absorption cross sections were loaded. Scorers that weight
    /// by absorption probabilities require this.
    fn cross_sections_present(&self) -> bool {
        true
    }

    /// Probability that a photon travels between two interaction points
    /// without any further interaction.
    fn reach_probability(&self, from: &Vector3<f64>, to: &Vector3<f64>, energy: f64) -> f64 {
        (1.0 - self.pair_absorption_probability(from, to, energy))
            * (1.0 - self.compton_absorption_probability(from, to, energy))
            * (1.0 - self.photo_absorption_probability(from, to, energy))
    }
}

/// Homogeneous single-material geometry for tests and demos.
///
/// A tracker stack of `tracker_layers` planes (pitch `layer_pitch` cm)
/// sits above a monolithic calorimeter at negative z. Absorption follows
/// a single attenuation length independent of energy shape, crude but
/// with the right [0,1] behavior over distance.
#[derive(Debug, Clone)]
pub struct UniformGeometry {
    pub attenuation_length_cm: f64,
    pub position_resolution_cm: f64,
    pub energy_resolution_kev: f64,
    pub time_resolution_s: f64,
    pub tracker_layers: i32,
    pub layer_pitch_cm: f64,
}

impl Default for UniformGeometry {
    fn default() -> Self {
        UniformGeometry {
            attenuation_length_cm: 10.0,
            position_resolution_cm: 0.1,
            energy_resolution_kev: 2.0,
            time_resolution_s: 1e-9,
            tracker_layers: 10,
            layer_pitch_cm: 1.0,
        }
    }
}

impl UniformGeometry {
    fn path_interaction(&self, from: &Vector3<f64>, to: &Vector3<f64>) -> f64 {
        let d = (to - from).norm();
        1.0 - (-d / self.attenuation_length_cm).exp()
    }
}

impl Geometry for UniformGeometry {
    fn absorption_probability(&self, from: &Vector3<f64>, to: &Vector3<f64>, _energy: f64) -> f64 {
        self.path_interaction(from, to)
    }

    fn photo_absorption_probability(
        &self,
        from: &Vector3<f64>,
        to: &Vector3<f64>,
        _energy: f64,
    ) -> f64 {
        0.4 * self.path_interaction(from, to)
    }

    fn compton_absorption_probability(
        &self,
        from: &Vector3<f64>,
        to: &Vector3<f64>,
        _energy: f64,
    ) -> f64 {
        0.5 * self.path_interaction(from, to)
    }

    fn pair_absorption_probability(
        &self,
        from: &Vector3<f64>,
        to: &Vector3<f64>,
        _energy: f64,
    ) -> f64 {
        0.1 * self.path_interaction(from, to)
    }

    fn volume_sequence(&self, position: &Vector3<f64>) -> Vec<String> {
        if position.z >= 0.0 {
            vec!["world".into(), format!("tracker.layer{}", self.layer(position))]
        } else {
            vec!["world".into(), "calorimeter".into()]
        }
    }

    fn resolutions(&self, _position: &Vector3<f64>, _energy: f64, _time: f64) -> Resolutions {
        Resolutions {
            position: Vector3::from_element(self.position_resolution_cm),
            energy: self.energy_resolution_kev,
            time: self.time_resolution_s,
        }
    }

    fn detector_type(&self, position: &Vector3<f64>) -> DetectorType {
        if position.z >= 0.0 {
            DetectorType::Tracker2d
        } else {
            DetectorType::Calorimeter
        }
    }

    fn in_same_volume(&self, a: &Vector3<f64>, b: &Vector3<f64>) -> bool {
        self.volume_sequence(a) == self.volume_sequence(b)
    }

    fn layer(&self, position: &Vector3<f64>) -> i32 {
        (position.z / self.layer_pitch_cm).floor() as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reach_probability_decreases_with_distance() {
        let g = UniformGeometry::default();
        let a = Vector3::new(0.0, 0.0, 0.0);
        let near = Vector3::new(0.0, 0.0, 1.0);
        let far = Vector3::new(0.0, 0.0, 8.0);

        let p_near = g.reach_probability(&a, &near, 500.0);
        let p_far = g.reach_probability(&a, &far, 500.0);
        assert!(p_near > p_far);
        assert!((0.0..=1.0).contains(&p_near));
        assert!((0.0..=1.0).contains(&p_far));
    }

    #[test]
    fn test_detector_classification_by_depth() {
        let g = UniformGeometry::default();
        assert_eq!(
            g.detector_type(&Vector3::new(0.0, 0.0, 3.0)),
            DetectorType::Tracker2d
        );
        assert_eq!(
            g.detector_type(&Vector3::new(0.0, 0.0, -3.0)),
            DetectorType::Calorimeter
        );
    }

    #[test]
    fn test_layer_quantization() {
        let g = UniformGeometry::default();
        assert_eq!(g.layer(&Vector3::new(0.0, 0.0, 2.4)), 2);
        assert_eq!(g.layer(&Vector3::new(0.0, 0.0, 2.9)), 2);
        assert_eq!(g.layer(&Vector3::new(0.0, 0.0, 3.1)), 3);
    }
}
