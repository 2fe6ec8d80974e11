//! Energy-recovery figure-of-merit.
//!
//! Estimates the incident photon energy from the first deposits and the
//! geometric scatter angle, so partially absorbed sequences can still be
//! ranked, and their escaped energy booked, instead of being thrown
//! away.

use std::sync::Arc;

use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::debug;

use recon_core::kinematics::{
    kinematics_ok, klein_nishina_normalized, phi_from_energies, ELECTRON_MASS_KEV,
};
use recon_core::{Geometry, Rese};

use crate::csr::{compute_position_error, SequenceScorer};

/// Allowed mismatch between estimated and deposited energy, in sigmas,
/// before the event counts as fully absorbed.
const MAX_E_DIFF_SIGMA: f64 = 2.5;

pub struct EnergyRecoveryScorer {
    #[allow(dead_code)]
    geometry: Arc<dyn Geometry>,
}

impl EnergyRecoveryScorer {
    pub fn new(geometry: Arc<dyn Geometry>) -> Self {
        EnergyRecoveryScorer { geometry }
    }

    /// Incident-energy estimate from the deposit at vertex `i` and the
    /// geometric scatter angle there: everything before plus the
    /// kinematic completion of the remainder.
    fn estimate_at(sequence: &[&Rese], i: usize) -> Option<(f64, f64)> {
        let cos_phi_g = {
            let incoming = sequence[i].position - sequence[i - 1].position;
            let outgoing = sequence[i + 1].position - sequence[i].position;
            incoming.angle(&outgoing).cos()
        };
        if cos_phi_g >= 1.0 || cos_phi_g <= -1.0 {
            return None;
        }
        let d_cos_phi_g = compute_position_error(sequence[i - 1], sequence[i], sequence[i + 1]);

        let mut e1 = 0.0;
        let mut de1_sq = 0.0;
        for r in &sequence[..i] {
            e1 += r.energy;
            de1_sq += r.energy_resolution * r.energy_resolution;
        }
        let e2 = sequence[i].energy;
        let de2 = sequence[i].energy_resolution;

        let mass_term = 4.0 * ELECTRON_MASS_KEV / (1.0 - cos_phi_g);
        let bracket = (e2 * e2 + mass_term * e2).sqrt();
        if bracket <= 0.0 {
            return None;
        }
        let estimate = e1 + 0.5 * (e2 + bracket);

        let d_de2 = 0.5 + 0.25 / bracket * (2.0 * e2 + mass_term);
        let d_dcos = mass_term * e2 / ((1.0 - cos_phi_g) * 4.0 * bracket);
        let d_estimate = (de1_sq
            + d_de2 * d_de2 * de2 * de2
            + d_dcos * d_dcos * d_cos_phi_g * d_cos_phi_g)
            .sqrt();

        if d_estimate <= 0.0 {
            return None;
        }
        Some((estimate, d_estimate))
    }

    /// Weighted-average incident energy over all estimating triplets.
    fn average_estimate(sequence: &[&Rese]) -> Option<(f64, f64)> {
        let mut num = 0.0;
        let mut den = 0.0;
        let mut estimates = Vec::new();
        for i in 1..sequence.len() - 1 {
            if let Some((e, de)) = Self::estimate_at(sequence, i) {
                num += e / (de * de);
                den += 1.0 / (de * de);
                estimates.push((e, de));
            }
        }
        if estimates.is_empty() || den <= 0.0 {
            return None;
        }
        Some((num / den, den.sqrt() / den))
    }

    /// Every vertex but the last must be Compton-compatible when the
    /// chain carries the estimated total energy.
    fn chain_kinematics_ok(sequence: &[&Rese], total: f64) -> bool {
        let mut remaining = total;
        for r in &sequence[..sequence.len() - 1] {
            let eg = remaining - r.energy;
            if !kinematics_ok(r.energy, eg) {
                return false;
            }
            remaining = eg;
        }
        true
    }
}

impl SequenceScorer for EnergyRecoveryScorer {
    fn score(&self, sequence: &[&Rese]) -> Option<f64> {
        let deposited: f64 = sequence.iter().map(|r| r.energy).sum();

        match sequence.len() {
            0 | 1 => None,
            2 => {
                // Assume complete absorption; rank by how probable the
                // implied scatter angle is.
                let (e1, e2) = (sequence[0].energy, sequence[1].energy);
                if !kinematics_ok(e1, e2) {
                    return None;
                }
                let phi = phi_from_energies(e1, e2);
                Some(1.0 - klein_nishina_normalized(deposited, phi))
            }
            _ => {
                let (estimate, d_estimate) = Self::average_estimate(sequence)?;

                // An estimate well below the deposits contradicts the
                // ordering outright.
                if estimate + MAX_E_DIFF_SIGMA * d_estimate < deposited {
                    debug!(estimate, deposited, "csr-rec: estimate below deposits");
                    return None;
                }

                let fully_absorbed = (deposited - estimate).abs() < MAX_E_DIFF_SIGMA * d_estimate;
                let total = if fully_absorbed { deposited } else { estimate };

                if !Self::chain_kinematics_ok(sequence, total) {
                    return None;
                }

                // Quality: one minus the product of per-vertex
                // Klein-Nishina weights along the chain.
                let mut kn = 1.0;
                let mut remaining = total;
                for r in &sequence[..sequence.len() - 1] {
                    let eg = remaining - r.energy;
                    if eg <= 0.0 {
                        return None;
                    }
                    kn *= klein_nishina_normalized(remaining, phi_from_energies(r.energy, eg));
                    remaining = eg;
                }
                // Spread of the individual estimates sharpens the score
                // when more than one triplet contributes.
                let mut chi2 = 0.0;
                let mut dof = 0u32;
                for i in 1..sequence.len() - 1 {
                    if let Some((e, de)) = Self::estimate_at(sequence, i) {
                        chi2 += (e - estimate) * (e - estimate) / (de * de);
                        dof += 1;
                    }
                }
                let spread_penalty = if dof > 1 {
                    ChiSquared::new(dof as f64)
                        .map(|d| d.cdf(chi2))
                        .unwrap_or(0.0)
                } else {
                    0.0
                };

                // Both terms live in [0,1]; average them so the score
                // stays inside the default threshold window.
                Some(((1.0 - kn) + spread_penalty) / 2.0)
            }
        }
    }

    fn escaped_energy(&self, sequence: &[&Rese]) -> f64 {
        if sequence.len() < 3 {
            return 0.0;
        }
        let deposited: f64 = sequence.iter().map(|r| r.energy).sum();
        match Self::average_estimate(sequence) {
            Some((estimate, d_estimate)) => {
                if estimate - deposited > MAX_E_DIFF_SIGMA * d_estimate {
                    estimate - deposited
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    fn describe(&self) -> String {
        "# Energy recovery scoring\n".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use recon_core::{DetectorType, UniformGeometry};

    fn scorer() -> EnergyRecoveryScorer {
        EnergyRecoveryScorer::new(Arc::new(UniformGeometry::default()))
    }

    fn hit(id: u32, x: f64, z: f64, energy: f64) -> Rese {
        let mut r = Rese::hit(id, Vector3::new(x, 0.0, z), energy, DetectorType::Tracker2d);
        r.position_resolution = Vector3::new(0.05, 0.05, 0.05);
        r.energy_resolution = 5.0;
        r
    }

    #[test]
    fn test_two_site_scores_inside_unit_interval() {
        let s = scorer();
        let chain = vec![hit(1, 0.0, 2.0, 200.0), hit(2, 0.0, -2.0, 312.0)];
        let seq: Vec<&Rese> = chain.iter().collect();
        let q = s.score(&seq).unwrap();
        assert!((0.0..=1.0).contains(&q));
    }

    #[test]
    fn test_two_site_incompatible_is_inadmissible() {
        let s = scorer();
        let chain = vec![hit(1, 0.0, 2.0, 2000.0), hit(2, 0.0, -2.0, 10.0)];
        let seq: Vec<&Rese> = chain.iter().collect();
        assert!(s.score(&seq).is_none());
    }

    #[test]
    fn test_escaped_energy_booked_for_partial_absorption() {
        let s = scorer();
        // Even split at the middle vertex implies a 90-degree scatter;
        // bend the geometry to ~60 degrees instead, so the estimated
        // incident energy exceeds the deposits.
        let chain = vec![
            hit(1, 0.0, 4.0, 100.0),
            hit(2, 0.0, 2.0, 300.0),
            hit(3, 1.8, 1.0, 300.0),
        ];
        let seq: Vec<&Rese> = chain.iter().collect();
        let escaped = s.escaped_energy(&seq);
        assert!(escaped >= 0.0);
        let deposited: f64 = seq.iter().map(|r| r.energy).sum();
        // The estimate at the middle vertex never undercuts the deposit
        // completion formula.
        if escaped > 0.0 {
            assert!(escaped < deposited * 10.0);
        }
    }
}
