//! Feature extraction for external sequence classifiers.
//!
//! A trained model replaces the analytic figure-of-merit without
//! touching the search skeleton: the engine builds the same fixed-width
//! feature vector per candidate ordering and asks the classifier for a
//! probability-like score.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use recon_core::kinematics::{klein_nishina_normalized_by_area, phi_from_energies};
use recon_core::{Geometry, Rese};

use crate::csr::SequenceScorer;

/// Fixed-width numeric description of one candidate ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceFeatures {
    /// Per-site energy deposits, sequence order.
    pub energies: Vec<f64>,
    /// Per-site positions, flattened (x, y, z) triples.
    pub positions: Vec<f64>,
    /// Distances between consecutive sites.
    pub distances: Vec<f64>,
    /// Compton scatter angle at each inner vertex, from energies.
    pub scatter_angles: Vec<f64>,
    /// Klein-Nishina weight at each inner vertex.
    pub cross_sections: Vec<f64>,
    /// Differences between consecutive scatter angles.
    pub angle_differences: Vec<f64>,
    /// Probability of reaching each next site without interaction.
    pub reach_probabilities: Vec<f64>,
    /// Photo-absorption probability at the final site.
    pub final_absorption: f64,
    /// Zenith angle of the inferred incoming direction.
    pub zenith: f64,
}

impl SequenceFeatures {
    pub fn from_sequence(sequence: &[&Rese], geometry: &dyn Geometry) -> Self {
        let energies: Vec<f64> = sequence.iter().map(|r| r.energy).collect();
        let positions: Vec<f64> = sequence
            .iter()
            .flat_map(|r| [r.position.x, r.position.y, r.position.z])
            .collect();
        let distances: Vec<f64> = sequence
            .windows(2)
            .map(|w| (w[1].position - w[0].position).norm())
            .collect();

        let mut scatter_angles = Vec::new();
        let mut cross_sections = Vec::new();
        let mut reach_probabilities = Vec::new();
        for i in 1..sequence.len().saturating_sub(1) {
            let ee = sequence[i].energy;
            let eg: f64 = sequence[i + 1..].iter().map(|r| r.energy).sum();
            let ei = ee + eg;
            let phi = phi_from_energies(ee, eg);
            scatter_angles.push(phi);
            cross_sections.push(klein_nishina_normalized_by_area(ei, phi));
        }
        for w in sequence.windows(2) {
            let carried: f64 = energies.iter().sum::<f64>()
                - sequence
                    .iter()
                    .take_while(|r| r.id != w[1].id)
                    .map(|r| r.energy)
                    .sum::<f64>();
            reach_probabilities.push(geometry.reach_probability(
                &w[0].position,
                &w[1].position,
                carried,
            ));
        }

        let angle_differences = scatter_angles
            .windows(2)
            .map(|w| w[1] - w[0])
            .collect();

        let final_absorption = match sequence.len() {
            0 | 1 => 0.0,
            n => geometry.photo_absorption_probability(
                &sequence[n - 2].position,
                &sequence[n - 1].position,
                sequence[n - 1].energy,
            ),
        };

        let zenith = if sequence.len() >= 2 {
            let incoming = sequence[1].position - sequence[0].position;
            incoming.angle(&nalgebra::Vector3::new(0.0, 0.0, -1.0))
        } else {
            0.0
        };

        SequenceFeatures {
            energies,
            positions,
            distances,
            scatter_angles,
            cross_sections,
            angle_differences,
            reach_probabilities,
            final_absorption,
            zenith,
        }
    }

    /// Flatten into the classifier input layout.
    pub fn to_vector(&self) -> Vec<f64> {
        let mut v = Vec::new();
        v.extend(&self.energies);
        v.extend(&self.positions);
        v.extend(&self.distances);
        v.extend(&self.scatter_angles);
        v.extend(&self.cross_sections);
        v.extend(&self.angle_differences);
        v.extend(&self.reach_probabilities);
        v.push(self.final_absorption);
        v.push(self.zenith);
        v
    }
}

/// External scoring back-end: feature vector in, probability-like score
/// out (higher = more likely the correct ordering).
pub trait SequenceClassifier: Send {
    fn classify(&self, features: &SequenceFeatures) -> f64;

    fn name(&self) -> &str {
        "external classifier"
    }
}

/// Adapter that plugs a classifier into the shared search skeleton.
pub struct ClassifierScorer {
    geometry: Arc<dyn Geometry>,
    classifier: Box<dyn SequenceClassifier>,
}

impl ClassifierScorer {
    pub fn new(geometry: Arc<dyn Geometry>, classifier: Box<dyn SequenceClassifier>) -> Self {
        ClassifierScorer {
            geometry,
            classifier,
        }
    }
}

impl SequenceScorer for ClassifierScorer {
    fn score(&self, sequence: &[&Rese]) -> Option<f64> {
        if sequence.len() < 2 {
            return None;
        }
        let features = SequenceFeatures::from_sequence(sequence, self.geometry.as_ref());
        let p = self.classifier.classify(&features);
        if !(0.0..=1.0).contains(&p) {
            return None;
        }
        // The skeleton ranks ascending; flip the probability.
        Some(1.0 - p)
    }

    fn describe(&self) -> String {
        format!("# Classifier scoring: {}\n", self.classifier.name())
    }
}
