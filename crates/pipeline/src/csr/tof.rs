//! Time-of-flight figure-of-merit.
//!
//! A pseudo chi-square over the inter-site flight times (the measured
//! time differences must match the geometric distances at the speed of
//! light), combined with the Compton cos(phi) terms. Only informative
//! when the timing resolution resolves inter-module flight times.

use std::sync::Arc;

use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::debug;

use recon_core::kinematics::{cos_phi_from_energies, ELECTRON_MASS_KEV, SPEED_OF_LIGHT_CM_S};
use recon_core::{Geometry, Rese};

use crate::csr::{compute_position_error, SequenceScorer};

pub struct TimeOfFlightScorer {
    geometry: Arc<dyn Geometry>,
}

impl TimeOfFlightScorer {
    pub fn new(geometry: Arc<dyn Geometry>) -> Self {
        TimeOfFlightScorer { geometry }
    }
}

impl SequenceScorer for TimeOfFlightScorer {
    fn score(&self, sequence: &[&Rese]) -> Option<f64> {
        if sequence.len() < 2 {
            return None;
        }

        let mut chi2 = 0.0;
        let mut dof = 0u32;

        // Flight-time terms, only across distinct detector volumes;
        // within one module the signal collection time dominates.
        for w in sequence.windows(2) {
            let (a, b) = (w[0], w[1]);
            if self.geometry.in_same_volume(&a.position, &b.position) {
                continue;
            }
            let distance = (b.position - a.position).norm();
            if distance == 0.0 {
                debug!("csr-tof: two interactions at one position");
                continue;
            }
            if a.time_resolution == 0.0 || b.time_resolution == 0.0 {
                debug!("csr-tof: missing time resolution");
                continue;
            }

            let dt_measured = b.time - a.time;
            let dt_expected = distance / SPEED_OF_LIGHT_CM_S;

            // Position errors feed the expected flight time too, though
            // they are negligible against ~100 ps timing.
            let delta = b.position - a.position;
            let sig = |x: f64, y: f64| x * x + y * y;
            let pos_err_sq = (delta.x * delta.x
                * sig(a.position_resolution.x, b.position_resolution.x)
                + delta.y * delta.y * sig(a.position_resolution.y, b.position_resolution.y)
                + delta.z * delta.z * sig(a.position_resolution.z, b.position_resolution.z))
                / (distance * distance * SPEED_OF_LIGHT_CM_S * SPEED_OF_LIGHT_CM_S);

            let var = a.time_resolution * a.time_resolution
                + b.time_resolution * b.time_resolution
                + pos_err_sq;
            chi2 += (dt_measured - dt_expected) * (dt_measured - dt_expected) / var;
            dof += 1;
        }

        // Compton terms, identical to the chi-square scorer's inner
        // vertices.
        for i in 1..sequence.len().saturating_sub(1) {
            let ee = sequence[i].energy;
            let dee = sequence[i].energy_resolution;
            let mut eg = 0.0;
            let mut deg2 = 0.0;
            for r in &sequence[i + 1..] {
                eg += r.energy;
                deg2 += r.energy_resolution * r.energy_resolution;
            }
            if ee <= 0.0 || eg <= 0.0 {
                return None;
            }
            let ei = ee + eg;
            let e0 = ELECTRON_MASS_KEV;

            let cos_phi_e = cos_phi_from_energies(ee, eg);
            let d_cos_phi_e2 = e0 * e0 / (ei * ei * ei * ei) * dee * dee
                + (e0 / (eg * eg) - e0 / ((ee + eg) * (ee + eg))).powi(2) * deg2;

            let incoming = sequence[i].position - sequence[i - 1].position;
            let outgoing = sequence[i + 1].position - sequence[i].position;
            let cos_phi_g = incoming.angle(&outgoing).cos();
            let d_cos_phi_g2 =
                compute_position_error(sequence[i - 1], sequence[i], sequence[i + 1]).powi(2);

            if d_cos_phi_e2 <= 0.0 || d_cos_phi_g2 <= 0.0 {
                continue;
            }

            chi2 += (cos_phi_e - cos_phi_g) * (cos_phi_e - cos_phi_g)
                / (d_cos_phi_e2 + d_cos_phi_g2);
            dof += 1;
        }

        // Two sites in one module leave nothing to test; call it neutral.
        if dof == 0 {
            return Some(1.0);
        }

        // Chi-square CDF: small chi2 means a consistent ordering and a
        // score near zero.
        let quality = ChiSquared::new(dof as f64)
            .map(|d| d.cdf(chi2))
            .unwrap_or(1.0);
        Some(quality)
    }

    fn describe(&self) -> String {
        "# Time-of-flight scoring\n".to_string()
    }
}
